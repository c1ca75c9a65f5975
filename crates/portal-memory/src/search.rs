//! Term search over memory text
//!
//! A query matches a document when they share at least one term. Terms are
//! lowercased alphanumeric runs. Score is the number of distinct query terms
//! present; ties keep the caller's order.

use std::collections::HashSet;

/// Split text into lowercased alphanumeric terms
pub fn terms(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

/// Number of distinct query terms that appear in `document`
pub fn score(query_terms: &HashSet<String>, document: &str) -> usize {
    if query_terms.is_empty() {
        return 0;
    }
    let doc_terms: HashSet<String> = terms(document).into_iter().collect();
    query_terms.intersection(&doc_terms).count()
}

/// Rank `items` against `query` on the text picked by `field`.
///
/// Non-matching items are dropped. The sort is stable, so equal scores keep
/// their input order.
pub fn rank<'a, T, F>(query: &str, items: &'a [T], field: F, limit: usize) -> Vec<&'a T>
where
    F: Fn(&T) -> &str,
{
    let query_terms: HashSet<String> = terms(query).into_iter().collect();
    if query_terms.is_empty() {
        return vec![];
    }

    let mut scored: Vec<(usize, &T)> = items
        .iter()
        .map(|item| (score(&query_terms, field(item)), item))
        .filter(|(s, _)| *s > 0)
        .collect();

    scored.sort_by(|a, b| b.0.cmp(&a.0));
    scored.into_iter().take(limit).map(|(_, item)| item).collect()
}
