//! FTS5 query construction from free text.
//!
//! User text is never passed to `MATCH` as-is: tokens are cleaned and quoted so
//! FTS5 operators in the input cannot change the query's meaning.

use serde::{Deserialize, Serialize};

/// Tokens kept for the coarse fuzzy-match pre-filter
const CANDIDATE_TOKENS: usize = 5;
const MIN_CANDIDATE_TOKEN_LEN: usize = 3;
const MIN_SEARCH_TOKEN_LEN: usize = 2;

/// Which indexed columns a search covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchScope {
    Source,
    Target,
    #[default]
    Both,
}

impl SearchScope {
    fn column_filter(self, expression: &str) -> String {
        match self {
            SearchScope::Source => format!("source_text : ({})", expression),
            SearchScope::Target => format!("translated_text : ({})", expression),
            SearchScope::Both => format!("{{source_text translated_text}} : ({})", expression),
        }
    }
}

/// Coarse OR-query over the longest tokens of `text`, restricted to source text.
///
/// Returns `None` when no token is long enough to be selective.
pub fn build_candidate_query(text: &str) -> Option<String> {
    let mut tokens: Vec<String> = Vec::new();
    for token in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= MIN_CANDIDATE_TOKEN_LEN)
    {
        let lowered = token.to_lowercase();
        if !tokens.contains(&lowered) {
            tokens.push(lowered);
        }
    }

    if tokens.is_empty() {
        return None;
    }

    // Longer tokens are rarer and prune more candidates; stable sort keeps text order on ties
    tokens.sort_by(|a, b| b.chars().count().cmp(&a.chars().count()));
    tokens.truncate(CANDIDATE_TOKENS);

    let expression = tokens
        .iter()
        .map(|t| quote(t))
        .collect::<Vec<_>>()
        .join(" OR ");
    Some(SearchScope::Source.column_filter(&expression))
}

/// Prefix-match query for interactive search; every token must match.
pub fn build_search_query(text: &str, scope: SearchScope) -> Option<String> {
    let terms: Vec<String> = text
        .split_whitespace()
        .map(strip_special_chars)
        .filter(|t| t.chars().count() >= MIN_SEARCH_TOKEN_LEN)
        .map(|t| format!("{}*", quote(&t)))
        .collect();

    if terms.is_empty() {
        return None;
    }

    Some(scope.column_filter(&terms.join(" ")))
}

fn strip_special_chars(token: &str) -> String {
    token
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_')
        .collect()
}

fn quote(token: &str) -> String {
    format!("\"{}\"", token.replace('"', "\"\""))
}
