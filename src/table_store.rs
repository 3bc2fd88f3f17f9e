pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use self::sqlite::SqliteTableStore;

/// One result record, keyed by column name in select order.
pub type Row = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Integer,
    Real,
    Text,
    Date,
    Boolean,
    Unknown,
}

impl ColumnType {
    /// Infers a column type from a declared SQL type name.
    pub fn from_declared(declared: &str) -> Self {
        let upper = declared.to_ascii_uppercase();
        if upper.contains("BOOL") {
            Self::Boolean
        } else if upper.contains("DATE") || upper.contains("TIME") {
            Self::Date
        } else if upper.contains("INT") {
            Self::Integer
        } else if upper.contains("REAL")
            || upper.contains("FLOA")
            || upper.contains("DOUB")
            || upper.contains("NUM")
            || upper.contains("DEC")
        {
            Self::Real
        } else if upper.contains("CHAR") || upper.contains("TEXT") || upper.contains("CLOB") {
            Self::Text
        } else {
            Self::Unknown
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Integer => "integer",
            Self::Real => "real",
            Self::Text => "text",
            Self::Date => "date",
            Self::Boolean => "boolean",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: ColumnType,
}

/// Read-only access to the tables being analysed.
#[async_trait]
pub trait TableStore: Send + Sync {
    async fn execute(&self, sql: &str) -> Result<Vec<Row>>;

    async fn schema(&self, table: &str) -> Result<Vec<ColumnInfo>>;

    async fn list_tables(&self) -> Result<Vec<String>>;
}

#[cfg(test)]
mod tests {
    use super::ColumnType;

    #[test]
    fn declared_types() {
        assert_eq!(ColumnType::from_declared("INTEGER"), ColumnType::Integer);
        assert_eq!(ColumnType::from_declared("bigint"), ColumnType::Integer);
        assert_eq!(ColumnType::from_declared("DECIMAL(10,2)"), ColumnType::Real);
        assert_eq!(ColumnType::from_declared("double"), ColumnType::Real);
        assert_eq!(ColumnType::from_declared("VARCHAR(20)"), ColumnType::Text);
        assert_eq!(ColumnType::from_declared("DATE"), ColumnType::Date);
        assert_eq!(ColumnType::from_declared("timestamp"), ColumnType::Date);
        assert_eq!(ColumnType::from_declared("boolean"), ColumnType::Boolean);
        assert_eq!(ColumnType::from_declared(""), ColumnType::Unknown);
    }
}
