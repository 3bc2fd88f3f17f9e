use std::collections::HashMap;

use serde_json::Value;

use crate::{
    error::QueryError,
    query_graph::types::query::{AggFunc, Aggregation, Filter, Operator, QuerySpec},
};

/// Renders `spec` as a single SQL statement.
///
/// Pure: the same spec always yields byte-identical text. `row_cap` bounds
/// the LIMIT of every non-scalar query.
pub fn synthesize(spec: &QuerySpec, row_cap: u32) -> Result<String, QueryError> {
    if spec.primary_table.trim().is_empty() {
        return Err(QueryError::Spec("no target table".to_string()));
    }
    if spec
        .referenced_columns()
        .any(|column| column.trim().is_empty())
    {
        return Err(QueryError::Spec("blank column name".to_string()));
    }
    for agg in &spec.aggregations {
        if agg.is_star() && agg.function != AggFunc::Count {
            return Err(QueryError::Spec(format!(
                "{}(*) is not a valid aggregation",
                agg.function.sql_name()
            )));
        }
    }

    let aliases = aliases(&spec.aggregations);

    let mut select: Vec<String> = spec.group_by.iter().map(|c| quote_ident(c)).collect();
    select.extend(
        spec.aggregations
            .iter()
            .zip(&aliases)
            .map(|(agg, alias)| format!("{} AS {alias}", render_aggregation(agg))),
    );
    if select.is_empty() {
        select = spec.entities.iter().map(|c| quote_ident(c)).collect();
    }
    if select.is_empty() {
        select.push("*".to_string());
    }

    let mut sql = format!(
        "SELECT {} FROM {}",
        select.join(", "),
        quote_ident(&spec.primary_table)
    );

    if !spec.filters.is_empty() {
        let predicates = spec
            .filters
            .iter()
            .map(render_filter)
            .collect::<Result<Vec<_>, _>>()?;
        sql.push_str(" WHERE ");
        sql.push_str(&predicates.join(" AND "));
    }

    if !spec.group_by.is_empty() {
        sql.push_str(" GROUP BY ");
        sql.push_str(
            &spec
                .group_by
                .iter()
                .map(|c| quote_ident(c))
                .collect::<Vec<_>>()
                .join(", "),
        );
    }

    let order = order_terms(spec, &aliases);
    if !order.is_empty() {
        sql.push_str(" ORDER BY ");
        sql.push_str(&order.join(", "));
    }

    if !spec.is_scalar_aggregate() {
        let limit = match spec.limit {
            Some(0) => return Err(QueryError::Spec("limit must be positive".to_string())),
            Some(limit) => limit.min(row_cap),
            None => row_cap,
        };
        sql.push_str(&format!(" LIMIT {limit}"));
    }

    Ok(sql)
}

/// SQLite keywords, sorted for binary search.
const KEYWORDS: &[&str] = &[
    "ABORT", "ACTION", "ADD", "AFTER", "ALL", "ALTER", "ALWAYS", "ANALYZE", "AND", "AS", "ASC",
    "ATTACH", "AUTOINCREMENT", "BEFORE", "BEGIN", "BETWEEN", "BY", "CASCADE", "CASE", "CAST",
    "CHECK", "COLLATE", "COLUMN", "COMMIT", "CONFLICT", "CONSTRAINT", "CREATE", "CROSS",
    "CURRENT", "CURRENT_DATE", "CURRENT_TIME", "CURRENT_TIMESTAMP", "DATABASE", "DEFAULT",
    "DEFERRABLE", "DEFERRED", "DELETE", "DESC", "DETACH", "DISTINCT", "DO", "DROP", "EACH",
    "ELSE", "END", "ESCAPE", "EXCEPT", "EXCLUDE", "EXCLUSIVE", "EXISTS", "EXPLAIN", "FAIL",
    "FILTER", "FIRST", "FOLLOWING", "FOR", "FOREIGN", "FROM", "FULL", "GENERATED", "GLOB",
    "GROUP", "GROUPS", "HAVING", "IF", "IGNORE", "IMMEDIATE", "IN", "INDEX", "INDEXED",
    "INITIALLY", "INNER", "INSERT", "INSTEAD", "INTERSECT", "INTO", "IS", "ISNULL", "JOIN",
    "KEY", "LAST", "LEFT", "LIKE", "LIMIT", "MATCH", "MATERIALIZED", "NATURAL", "NO", "NOT",
    "NOTHING", "NOTNULL", "NULL", "NULLS", "OF", "OFFSET", "ON", "OR", "ORDER", "OTHERS",
    "OUTER", "OVER", "PARTITION", "PLAN", "PRAGMA", "PRECEDING", "PRIMARY", "QUERY", "RAISE",
    "RANGE", "RECURSIVE", "REFERENCES", "REGEXP", "REINDEX", "RELEASE", "RENAME", "REPLACE",
    "RESTRICT", "RETURNING", "RIGHT", "ROLLBACK", "ROW", "ROWS", "SAVEPOINT", "SELECT", "SET",
    "TABLE", "TEMP", "TEMPORARY", "THEN", "TIES", "TO", "TRANSACTION", "TRIGGER", "UNBOUNDED",
    "UNION", "UNIQUE", "UPDATE", "USING", "VACUUM", "VALUES", "VIEW", "VIRTUAL", "WHEN",
    "WHERE", "WINDOW", "WITH", "WITHOUT",
];

/// Quotes an identifier unless it is a plain word that is not a keyword.
pub fn quote_ident(name: &str) -> String {
    let mut chars = name.chars();
    let plain = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && KEYWORDS
            .binary_search(&name.to_ascii_uppercase().as_str())
            .is_err();
    if plain {
        name.to_string()
    } else {
        format!("\"{}\"", name.replace('"', "\"\""))
    }
}

fn aliases(aggregations: &[Aggregation]) -> Vec<String> {
    let mut uses: HashMap<&str, usize> = HashMap::new();
    for agg in aggregations {
        *uses.entry(agg.function.alias()).or_default() += 1;
    }
    aggregations
        .iter()
        .map(|agg| {
            let word = agg.function.alias();
            if uses.get(word).copied().unwrap_or(0) > 1 {
                let column: String = if agg.is_star() {
                    "all".to_string()
                } else {
                    agg.column
                        .chars()
                        .map(|c| {
                            if c.is_ascii_alphanumeric() {
                                c.to_ascii_lowercase()
                            } else {
                                '_'
                            }
                        })
                        .collect()
                };
                format!("{word}_{column}")
            } else {
                word.to_string()
            }
        })
        .collect()
}

fn render_aggregation(agg: &Aggregation) -> String {
    let column = if agg.is_star() {
        "*".to_string()
    } else {
        quote_ident(&agg.column)
    };
    format!("{}({column})", agg.function.sql_name())
}

fn order_terms(spec: &QuerySpec, aliases: &[String]) -> Vec<String> {
    if spec.order_by.is_empty() {
        if spec.group_by.is_empty() {
            return Vec::new();
        }
        let mut terms = Vec::new();
        if let Some(first) = aliases.first() {
            terms.push(format!("{first} DESC"));
        }
        terms.extend(spec.group_by.iter().map(|c| format!("{} ASC", quote_ident(c))));
        return terms;
    }

    spec.order_by
        .iter()
        .map(|order| {
            let target = if spec.group_by.contains(&order.column) {
                quote_ident(&order.column)
            } else {
                spec.aggregations
                    .iter()
                    .position(|agg| agg.column == order.column)
                    .and_then(|idx| aliases.get(idx).cloned())
                    .unwrap_or_else(|| quote_ident(&order.column))
            };
            format!("{target} {}", order.direction.as_sql())
        })
        .collect()
}

/// Whether `filter` can be rendered.
pub fn check_filter(filter: &Filter) -> Result<(), QueryError> {
    render_filter(filter).map(|_| ())
}

fn render_filter(filter: &Filter) -> Result<String, QueryError> {
    let column = quote_ident(&filter.column);
    let invalid = |what: &str| {
        QueryError::Spec(format!(
            "filter on `{}` with `{}` needs {what}, got {}",
            filter.column, filter.operator, filter.value
        ))
    };

    match &filter.operator {
        Operator::Eq => match &filter.value {
            Value::Null => Ok(format!("{column} IS NULL")),
            value => Ok(format!("{column} = {}", scalar(value).ok_or_else(|| invalid("a scalar"))?)),
        },
        Operator::NotEq => match &filter.value {
            Value::Null => Ok(format!("{column} IS NOT NULL")),
            value => Ok(format!(
                "{column} <> {}",
                scalar(value).ok_or_else(|| invalid("a scalar"))?
            )),
        },
        Operator::Gt | Operator::Gte | Operator::Lt | Operator::Lte => {
            let bound = match &filter.value {
                Value::Number(_) | Value::String(_) => scalar(&filter.value),
                _ => None,
            }
            .ok_or_else(|| invalid("a number or date"))?;
            Ok(format!("{column} {} {bound}", filter.operator.as_str()))
        }
        Operator::Between => {
            let bounds = match &filter.value {
                Value::Array(items) if items.len() == 2 => {
                    match (scalar(&items[0]), scalar(&items[1])) {
                        (Some(low), Some(high)) if !items[0].is_null() && !items[1].is_null() => {
                            Some((low, high))
                        }
                        _ => None,
                    }
                }
                _ => None,
            };
            let (low, high) = bounds.ok_or_else(|| invalid("a [low, high] pair"))?;
            Ok(format!("{column} BETWEEN {low} AND {high}"))
        }
        Operator::In => {
            let items = match &filter.value {
                Value::Array(items) if !items.is_empty() => items
                    .iter()
                    .filter(|v| !v.is_null())
                    .map(scalar)
                    .collect::<Option<Vec<_>>>(),
                _ => None,
            }
            .filter(|items| !items.is_empty())
            .ok_or_else(|| invalid("a non-empty list"))?;
            Ok(format!("{column} IN ({})", items.join(", ")))
        }
        Operator::Unsupported(raw) => Err(QueryError::Spec(format!(
            "unsupported operator `{raw}` on `{}`",
            filter.column
        ))),
    }
}

/// SQL literal for a JSON scalar; `None` for arrays and objects.
fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::Null => Some("NULL".to_string()),
        Value::Bool(b) => Some(if *b { "1" } else { "0" }.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) => Some(format!("'{}'", s.replace('\'', "''"))),
        Value::Array(_) | Value::Object(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        query_graph::types::query::{Direction, OrderBy, QueryType},
        table_store::{SqliteTableStore, TableStore},
    };

    fn spec() -> QuerySpec {
        QuerySpec {
            query_type: QueryType::Summary,
            primary_table: "sales".to_string(),
            entities: Vec::new(),
            aggregations: Vec::new(),
            group_by: Vec::new(),
            order_by: Vec::new(),
            filters: Vec::new(),
            limit: None,
            confidence: 0.9,
            unmapped_terms: Vec::new(),
        }
    }

    fn filter(column: &str, op: Operator, value: Value) -> Filter {
        Filter {
            column: column.to_string(),
            operator: op,
            value,
        }
    }

    #[test]
    fn scalar_sum() {
        let spec = QuerySpec {
            aggregations: vec![Aggregation::new(AggFunc::Sum, "Amount")],
            ..spec()
        };
        assert_eq!(
            synthesize(&spec, 1000).unwrap(),
            "SELECT SUM(Amount) AS total FROM sales"
        );
    }

    #[test]
    fn grouped_defaults_to_first_aggregation_desc() {
        let spec = QuerySpec {
            query_type: QueryType::Analytical,
            aggregations: vec![
                Aggregation::new(AggFunc::Sum, "Amount"),
                Aggregation::new(AggFunc::Count, "*"),
            ],
            group_by: vec!["Region".to_string(), "Month".to_string()],
            ..spec()
        };
        let sql = synthesize(&spec, 1000).unwrap();
        assert_eq!(
            sql,
            "SELECT Region, Month, SUM(Amount) AS total, COUNT(*) AS count FROM sales \
             GROUP BY Region, Month ORDER BY total DESC, Region ASC, Month ASC LIMIT 1000"
        );
        assert_eq!(sql, synthesize(&spec, 1000).unwrap());
    }

    #[test]
    fn explicit_order_uses_alias_and_limit_is_capped() {
        let spec = QuerySpec {
            aggregations: vec![Aggregation::new(AggFunc::Avg, "Amount")],
            group_by: vec!["Region".to_string()],
            order_by: vec![OrderBy {
                column: "Amount".to_string(),
                direction: Direction::Asc,
            }],
            limit: Some(5000),
            ..spec()
        };
        assert_eq!(
            synthesize(&spec, 1000).unwrap(),
            "SELECT Region, AVG(Amount) AS average FROM sales GROUP BY Region \
             ORDER BY average ASC LIMIT 1000"
        );
    }

    #[test]
    fn repeated_functions_get_distinct_aliases() {
        let spec = QuerySpec {
            aggregations: vec![
                Aggregation::new(AggFunc::Sum, "Amount"),
                Aggregation::new(AggFunc::Sum, "Unit Cost"),
            ],
            ..spec()
        };
        assert_eq!(
            synthesize(&spec, 10).unwrap(),
            "SELECT SUM(Amount) AS total_amount, SUM(\"Unit Cost\") AS total_unit_cost FROM sales"
        );
    }

    #[test]
    fn raw_preview_without_aggregations() {
        let spec = QuerySpec {
            entities: vec!["Region".to_string(), "order date".to_string()],
            limit: Some(20),
            ..spec()
        };
        assert_eq!(
            synthesize(&spec, 1000).unwrap(),
            "SELECT Region, \"order date\" FROM sales LIMIT 20"
        );
        assert_eq!(
            synthesize(&self::spec(), 50).unwrap(),
            "SELECT * FROM sales LIMIT 50"
        );
    }

    #[test]
    fn filters_render_inclusive_and_exact() {
        let spec = QuerySpec {
            aggregations: vec![Aggregation::new(AggFunc::Sum, "Amount")],
            filters: vec![
                filter("Region", Operator::Eq, json!("O'Hare")),
                filter("Amount", Operator::Between, json!([10, 20])),
                filter("Month", Operator::Gte, json!("2024-01")),
                filter("Region", Operator::In, json!(["east", "west"])),
                filter("Discount", Operator::NotEq, Value::Null),
            ],
            ..spec()
        };
        assert_eq!(
            synthesize(&spec, 1000).unwrap(),
            "SELECT SUM(Amount) AS total FROM sales WHERE Region = 'O''Hare' \
             AND Amount BETWEEN 10 AND 20 AND Month >= '2024-01' \
             AND Region IN ('east', 'west') AND Discount IS NOT NULL"
        );
    }

    #[test]
    fn unknown_operator_is_rejected() {
        let spec = QuerySpec {
            filters: vec![filter(
                "Region",
                Operator::Unsupported("like".to_string()),
                json!("e%"),
            )],
            ..spec()
        };
        assert!(matches!(synthesize(&spec, 1000), Err(QueryError::Spec(_))));
    }

    #[test]
    fn malformed_filter_values_are_rejected() {
        for bad in [
            filter("Amount", Operator::Between, json!([1])),
            filter("Amount", Operator::In, json!([])),
            filter("Amount", Operator::Gt, json!({"x": 1})),
            filter("Amount", Operator::Eq, json!([1, 2])),
        ] {
            let spec = QuerySpec {
                filters: vec![bad],
                ..spec()
            };
            assert!(matches!(synthesize(&spec, 1000), Err(QueryError::Spec(_))));
        }
    }

    #[test]
    fn star_only_for_count() {
        let spec = QuerySpec {
            aggregations: vec![Aggregation::new(AggFunc::Sum, "*")],
            ..spec()
        };
        assert!(synthesize(&spec, 1000).is_err());
        assert_eq!(
            synthesize(&QuerySpec::row_count("sales", 0.3), 1000).unwrap(),
            "SELECT COUNT(*) AS count FROM sales"
        );
    }

    #[test]
    fn keywords_are_quoted() {
        assert_eq!(quote_ident("Region"), "Region");
        assert_eq!(quote_ident("Group"), "\"Group\"");
        assert_eq!(quote_ident("order"), "\"order\"");
        assert_eq!(quote_ident("Last Update"), "\"Last Update\"");
        assert_eq!(quote_ident("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[tokio::test]
    async fn keyword_columns_run_against_sqlite() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE sales (\"Group\" TEXT, \"Order\" INTEGER, Amount INTEGER);
             INSERT INTO sales VALUES ('toys', 1, 40);
             INSERT INTO sales VALUES ('toys', 2, 60);
             INSERT INTO sales VALUES ('games', 3, 30);",
        )
        .unwrap();
        let store = SqliteTableStore::from_connection(conn);

        let spec = QuerySpec {
            query_type: QueryType::Analytical,
            aggregations: vec![
                Aggregation::new(AggFunc::Sum, "Amount"),
                Aggregation::new(AggFunc::Max, "Order"),
            ],
            group_by: vec!["Group".to_string()],
            filters: vec![filter("Group", Operator::NotEq, json!("none"))],
            ..spec()
        };
        let sql = synthesize(&spec, 1000).unwrap();
        let rows = store.execute(&sql).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["Group"], json!("toys"));
        assert_eq!(rows[0]["total"], json!(100));
        assert_eq!(rows[0]["maximum"], json!(2));
    }
}
