//! Table-name derivation

/// Convert an entity name to lowercase snake_case.
pub fn snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    let mut prev_lower = false;
    for c in name.chars() {
        if c.is_ascii_uppercase() {
            if prev_lower {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
            prev_lower = false;
        } else {
            prev_lower = c.is_ascii_lowercase() || c.is_ascii_digit();
            out.push(c);
        }
    }
    out
}

/// Pluralize a snake_case word with the usual English suffix rules.
pub fn pluralize(word: &str) -> String {
    if let Some(stem) = word.strip_suffix('y') {
        let preceded_by_vowel = stem
            .chars()
            .last()
            .map(|c| matches!(c, 'a' | 'e' | 'i' | 'o' | 'u'))
            .unwrap_or(false);
        if !preceded_by_vowel {
            return format!("{}ies", stem);
        }
    }
    if word.ends_with('s')
        || word.ends_with('x')
        || word.ends_with('z')
        || word.ends_with("ch")
        || word.ends_with("sh")
    {
        return format!("{}es", word);
    }
    format!("{}s", word)
}

/// Derived table name for an entity: pluralized lowercase snake_case.
pub fn table_name(entity: &str) -> String {
    pluralize(&snake_case(entity))
}
