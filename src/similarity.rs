//! Normalized edit-distance similarity between two strings.

/// Levenshtein distance over Unicode scalar values.
///
/// Uses a single rolling row, so memory is O(len(b)).
pub fn levenshtein(a: &str, b: &str) -> usize {
    let b_chars: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b_chars.len();
    }
    if b_chars.is_empty() {
        return a.chars().count();
    }

    let mut row: Vec<usize> = (0..=b_chars.len()).collect();

    for (i, ca) in a.chars().enumerate() {
        let mut diagonal = row[0];
        row[0] = i + 1;
        for (j, cb) in b_chars.iter().enumerate() {
            let substitution = diagonal + usize::from(ca != *cb);
            diagonal = row[j + 1];
            row[j + 1] = substitution.min(row[j] + 1).min(diagonal + 1);
        }
    }

    row[b_chars.len()]
}

/// Similarity in `[0, 1]` where 1 means identical.
///
/// Computed as `1 - distance / max(len(a), len(b))`. Two empty strings are identical.
pub fn similarity(a: &str, b: &str, case_sensitive: bool) -> f64 {
    if case_sensitive {
        score(a, b)
    } else {
        score(&a.to_lowercase(), &b.to_lowercase())
    }
}

fn score(a: &str, b: &str) -> f64 {
    let longest = a.chars().count().max(b.chars().count());
    if longest == 0 {
        return 1.0;
    }
    let distance = levenshtein(a, b);
    1.0 - distance as f64 / longest as f64
}
