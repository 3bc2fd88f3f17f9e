use crate::query_graph::types::query::QueryType;

const SUMMARY: [&str; 3] = [
    "Can you break this down by region?",
    "What's the trend over time?",
    "How does this compare to last period?",
];
const ANALYTICAL: [&str; 3] = [
    "Which segment drove this result?",
    "What's the growth rate?",
    "Show me the distribution.",
];
const COMPARISON: [&str; 3] = [
    "What are the key differences?",
    "Which performed better overall?",
    "What's driving the variance?",
];
const TIMESERIES: [&str; 3] = [
    "What's the forecast?",
    "Where are the anomalies?",
    "What caused the peaks/valleys?",
];
const GENERIC: [&str; 3] = [
    "Can you provide more details?",
    "What's the business impact?",
    "How does this trend?",
];

/// Follow-up questions for an answer of the given type; generic ones when
/// no structured answer was produced.
pub fn suggest(query_type: Option<QueryType>) -> Vec<String> {
    let picks = match query_type {
        Some(QueryType::Summary) => SUMMARY,
        Some(QueryType::Analytical) => ANALYTICAL,
        Some(QueryType::Comparison) => COMPARISON,
        Some(QueryType::Timeseries) => TIMESERIES,
        None => GENERIC,
    };
    picks.iter().map(ToString::to_string).collect()
}
