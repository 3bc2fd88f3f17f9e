use serde::{Deserialize, Serialize};

use crate::table_store::Row;

/// Aggregates over one numeric column. Sums and extremes are `None` when
/// the column holds no values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnMetrics {
    pub column: String,
    pub non_null: u64,
    pub total: Option<f64>,
    pub average: Option<f64>,
    pub minimum: Option<f64>,
    pub maximum: Option<f64>,
}

/// Overview of a whole table: size, key metrics, a sample and a short
/// written summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetSummary {
    pub table: String,
    pub row_count: u64,
    pub column_count: usize,
    pub metrics: Vec<ColumnMetrics>,
    pub sample: Vec<Row>,
    pub summary: String,
}
