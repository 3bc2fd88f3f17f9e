use strsim::jaro_winkler;
use tracing::debug;

const MIN_SIMILARITY: f64 = 0.85;

/// Picks the table a question runs against.
///
/// An explicit hint wins when it names a known table (case-insensitive).
/// Otherwise the table closest to a word of the question is used, and
/// failing that the first table in name order.
pub fn resolve_table(tables: &[String], hint: Option<&str>, question: &str) -> Option<String> {
    if let Some(hint) = hint.map(str::trim).filter(|h| !h.is_empty()) {
        if let Some(table) = tables.iter().find(|t| t.eq_ignore_ascii_case(hint)) {
            return Some(table.clone());
        }
        debug!(hint, "Table hint matches no table");
    }

    let words: Vec<String> = question
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|w| w.len() > 2)
        .map(str::to_lowercase)
        .collect();

    let best = tables
        .iter()
        .filter_map(|table| {
            let name = table.to_lowercase();
            let singular = name.trim_end_matches('s');
            words
                .iter()
                .map(|word| {
                    jaro_winkler(&name, word).max(jaro_winkler(singular, word.trim_end_matches('s')))
                })
                .fold(None, |best: Option<f64>, score| {
                    Some(best.map_or(score, |b| b.max(score)))
                })
                .filter(|score| *score >= MIN_SIMILARITY)
                .map(|score| (table, score))
        })
        .fold(None, |best: Option<(&String, f64)>, (table, score)| match best {
            Some((_, top)) if top >= score => best,
            _ => Some((table, score)),
        });

    if let Some((table, score)) = best {
        debug!(table, score, "Table matched from question");
        return Some(table.clone());
    }

    let mut sorted: Vec<&String> = tables.iter().collect();
    sorted.sort();
    sorted.first().map(|t| (*t).clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tables() -> Vec<String> {
        vec!["sales".to_string(), "customers".to_string(), "Inventory".to_string()]
    }

    #[test]
    fn hint_is_case_insensitive() {
        assert_eq!(
            resolve_table(&tables(), Some("INVENTORY"), "total revenue"),
            Some("Inventory".to_string())
        );
    }

    #[test]
    fn question_words_pick_table() {
        assert_eq!(
            resolve_table(&tables(), None, "how many customer rows are there"),
            Some("customers".to_string())
        );
        assert_eq!(
            resolve_table(&tables(), Some("missing"), "sale amounts by region"),
            Some("sales".to_string())
        );
    }

    #[test]
    fn defaults_to_first_by_name() {
        assert_eq!(
            resolve_table(&tables(), None, "total revenue"),
            Some("Inventory".to_string())
        );
        assert_eq!(resolve_table(&[], None, "total revenue"), None);
    }
}
