use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum QueryType {
    Summary,
    Analytical,
    Comparison,
    Timeseries,
}

impl QueryType {
    pub const ALL: [QueryType; 4] = [
        QueryType::Summary,
        QueryType::Analytical,
        QueryType::Comparison,
        QueryType::Timeseries,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            QueryType::Summary => "summary",
            QueryType::Analytical => "analytical",
            QueryType::Comparison => "comparison",
            QueryType::Timeseries => "timeseries",
        }
    }

    /// Accepts exactly one of the four labels, ignoring case and
    /// surrounding punctuation.
    pub fn parse(raw: &str) -> Option<Self> {
        let word = raw
            .trim()
            .trim_matches(|c: char| !c.is_ascii_alphanumeric())
            .to_ascii_lowercase();
        Self::ALL.into_iter().find(|t| t.as_str() == word)
    }

    /// Types whose answers are expected to carry an aggregation or grouping.
    pub fn expects_aggregation(self) -> bool {
        matches!(self, QueryType::Analytical | QueryType::Comparison)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggFunc {
    Sum,
    Avg,
    Count,
    Min,
    Max,
}

impl AggFunc {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "sum" | "total" => Some(AggFunc::Sum),
            "avg" | "average" | "mean" => Some(AggFunc::Avg),
            "count" => Some(AggFunc::Count),
            "min" | "minimum" => Some(AggFunc::Min),
            "max" | "maximum" => Some(AggFunc::Max),
            _ => None,
        }
    }

    pub fn sql_name(self) -> &'static str {
        match self {
            AggFunc::Sum => "SUM",
            AggFunc::Avg => "AVG",
            AggFunc::Count => "COUNT",
            AggFunc::Min => "MIN",
            AggFunc::Max => "MAX",
        }
    }

    /// Output alias used when the aggregation is selected.
    pub fn alias(self) -> &'static str {
        match self {
            AggFunc::Sum => "total",
            AggFunc::Avg => "average",
            AggFunc::Count => "count",
            AggFunc::Min => "minimum",
            AggFunc::Max => "maximum",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Aggregation {
    pub function: AggFunc,
    /// A column name, or `*` for `count`.
    pub column: String,
}

impl Aggregation {
    pub fn new(function: AggFunc, column: &str) -> Self {
        Self {
            function,
            column: column.to_string(),
        }
    }

    pub fn is_star(&self) -> bool {
        self.column == "*"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Asc,
    #[default]
    Desc,
}

impl Direction {
    pub fn parse(raw: &str) -> Self {
        if raw.trim().to_ascii_lowercase().starts_with("asc") {
            Direction::Asc
        } else {
            Direction::Desc
        }
    }

    pub fn as_sql(self) -> &'static str {
        match self {
            Direction::Asc => "ASC",
            Direction::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    pub column: String,
    pub direction: Direction,
}

/// Comparison operator of a filter. Anything unrecognised is kept verbatim
/// in `Unsupported` so it can be rejected instead of dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Operator {
    Eq,
    NotEq,
    Gt,
    Gte,
    Lt,
    Lte,
    Between,
    In,
    Unsupported(String),
}

impl Operator {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "=" | "==" | "eq" | "equals" | "is" => Operator::Eq,
            "!=" | "<>" | "ne" | "neq" | "not_eq" | "not equals" => Operator::NotEq,
            ">" | "gt" => Operator::Gt,
            ">=" | "gte" => Operator::Gte,
            "<" | "lt" => Operator::Lt,
            "<=" | "lte" => Operator::Lte,
            "between" => Operator::Between,
            "in" => Operator::In,
            _ => Operator::Unsupported(raw.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Operator::Eq => "=",
            Operator::NotEq => "!=",
            Operator::Gt => ">",
            Operator::Gte => ">=",
            Operator::Lt => "<",
            Operator::Lte => "<=",
            Operator::Between => "between",
            Operator::In => "in",
            Operator::Unsupported(raw) => raw,
        }
    }

    /// Lower is more selective; used to pick the filter to relax first.
    pub fn selectivity_rank(&self) -> u8 {
        match self {
            Operator::Eq => 0,
            Operator::In => 1,
            Operator::Between => 2,
            Operator::Gt | Operator::Gte | Operator::Lt | Operator::Lte => 3,
            Operator::NotEq => 4,
            Operator::Unsupported(_) => 5,
        }
    }
}

impl From<String> for Operator {
    fn from(raw: String) -> Self {
        Operator::parse(&raw)
    }
}

impl From<Operator> for String {
    fn from(op: Operator) -> Self {
        op.as_str().to_string()
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub column: String,
    pub operator: Operator,
    pub value: Value,
}

/// Structured intent extracted from a question.
///
/// Never mutated after it is built; refinement clones it into a new value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuerySpec {
    pub query_type: QueryType,
    pub primary_table: String,
    pub entities: Vec<String>,
    pub aggregations: Vec<Aggregation>,
    pub group_by: Vec<String>,
    pub order_by: Vec<OrderBy>,
    pub filters: Vec<Filter>,
    pub limit: Option<u32>,
    pub confidence: f64,
    /// Business terms the mapper could not resolve.
    #[serde(default)]
    pub unmapped_terms: Vec<String>,
}

impl QuerySpec {
    /// Whole-table row count, used when nothing in the question maps.
    pub fn row_count(table: &str, confidence: f64) -> Self {
        Self {
            query_type: QueryType::Summary,
            primary_table: table.to_string(),
            entities: Vec::new(),
            aggregations: vec![Aggregation::new(AggFunc::Count, "*")],
            group_by: Vec::new(),
            order_by: Vec::new(),
            filters: Vec::new(),
            limit: None,
            confidence: confidence.clamp(0.0, 1.0),
            unmapped_terms: Vec::new(),
        }
    }

    pub fn is_scalar_aggregate(&self) -> bool {
        !self.aggregations.is_empty() && self.group_by.is_empty()
    }

    /// Every column name the spec refers to, `*` excluded.
    pub fn referenced_columns(&self) -> impl Iterator<Item = &str> {
        self.entities
            .iter()
            .map(String::as_str)
            .chain(
                self.aggregations
                    .iter()
                    .filter(|a| !a.is_star())
                    .map(|a| a.column.as_str()),
            )
            .chain(self.group_by.iter().map(String::as_str))
            .chain(self.order_by.iter().map(|o| o.column.as_str()))
            .chain(self.filters.iter().map(|f| f.column.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_type_labels() {
        assert_eq!(QueryType::parse("Comparison"), Some(QueryType::Comparison));
        assert_eq!(QueryType::parse(" summary.\n"), Some(QueryType::Summary));
        assert_eq!(QueryType::parse("\"timeseries\""), Some(QueryType::Timeseries));
        assert_eq!(QueryType::parse("analytical query"), None);
        assert_eq!(QueryType::parse(""), None);
    }

    #[test]
    fn aggregation_vocabulary() {
        assert_eq!(AggFunc::parse("total"), Some(AggFunc::Sum));
        assert_eq!(AggFunc::parse("Mean"), Some(AggFunc::Avg));
        assert_eq!(AggFunc::parse("maximum"), Some(AggFunc::Max));
        assert_eq!(AggFunc::parse("median"), None);
    }

    #[test]
    fn operators_round_trip_through_json() {
        let filter: Filter =
            serde_json::from_str(r#"{"column":"a","operator":">=","value":3}"#).unwrap();
        assert_eq!(filter.operator, Operator::Gte);

        let filter: Filter =
            serde_json::from_str(r#"{"column":"a","operator":"like","value":"x%"}"#).unwrap();
        assert_eq!(filter.operator, Operator::Unsupported("like".to_string()));
        assert_eq!(
            serde_json::to_value(&filter).unwrap()["operator"],
            serde_json::json!("like")
        );
    }

    #[test]
    fn referenced_columns_skip_star() {
        let spec = QuerySpec::row_count("sales", 0.2);
        assert_eq!(spec.referenced_columns().count(), 0);
        assert!(spec.is_scalar_aggregate());
    }
}
