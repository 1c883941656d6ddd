//! Subject validation and wildcard matching
//!
//! Subjects are `.`-separated, non-empty tokens. Subscriptions may use two
//! wildcards, each of which must occupy a whole token:
//!
//! - `*` matches exactly one token
//! - `>` matches one or more trailing tokens and must be the last token
//!
//! Publications always target a literal subject.

/// Validate a subject used for publishing (no wildcards allowed).
pub fn validate_literal(subject: &str) -> Result<(), String> {
    validate_tokens(subject)?;
    if subject.split('.').any(|t| t == "*" || t == ">") {
        return Err(format!("subject '{}' must not contain wildcards", subject));
    }
    Ok(())
}

/// Validate a subject filter used for subscribing.
pub fn validate_filter(filter: &str) -> Result<(), String> {
    validate_tokens(filter)?;
    let tokens: Vec<&str> = filter.split('.').collect();
    for (i, token) in tokens.iter().enumerate() {
        if *token == ">" && i != tokens.len() - 1 {
            return Err(format!("'>' must be the last token in '{}'", filter));
        }
    }
    Ok(())
}

fn validate_tokens(subject: &str) -> Result<(), String> {
    if subject.is_empty() {
        return Err("subject must not be empty".to_string());
    }
    if subject.chars().any(char::is_whitespace) {
        return Err(format!("subject '{}' must not contain whitespace", subject));
    }
    for token in subject.split('.') {
        if token.is_empty() {
            return Err(format!("subject '{}' contains an empty token", subject));
        }
        if token.len() > 1 && (token.contains('*') || token.contains('>')) {
            return Err(format!("wildcard must be a whole token in '{}'", subject));
        }
    }
    Ok(())
}

/// Test whether a subscription filter matches a literal subject.
pub fn matches(filter: &str, subject: &str) -> bool {
    let filter_parts: Vec<&str> = filter.split('.').collect();
    let subject_parts: Vec<&str> = subject.split('.').collect();

    let mut fi = 0;
    let mut si = 0;

    while fi < filter_parts.len() {
        if filter_parts[fi] == ">" {
            // '>' needs at least one remaining token and must be last
            return fi == filter_parts.len() - 1 && si < subject_parts.len();
        }

        if si >= subject_parts.len() {
            return false;
        }

        if filter_parts[fi] != "*" && filter_parts[fi] != subject_parts[si] {
            return false;
        }

        fi += 1;
        si += 1;
    }

    si == subject_parts.len()
}
