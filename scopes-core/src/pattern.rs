//! Restricted glob matching for artifact names.
//!
//! Only `*` is special ("any run of characters"). Matching is a linear scan
//! over the literal segments between wildcards, so no pattern can trigger
//! backtracking blowups. Patterns with more than [`MAX_WILDCARDS`] wildcards
//! degrade further to "every literal segment occurs somewhere in the text".

/// Wildcard count above which a pattern falls back to substring checks.
pub const MAX_WILDCARDS: usize = 3;

/// How much of the text a pattern must cover.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    /// The pattern must span the whole text (`architecture/*.md` style).
    Whole,
    /// The pattern may match any substring of the text.
    Anywhere,
}

/// `true` if `pattern` matches all of `text`.
pub fn glob_match(text: &str, pattern: &str) -> bool {
    matches(text, pattern, MatchMode::Whole)
}

/// `true` if `pattern` matches somewhere inside `text`.
pub fn glob_find(text: &str, pattern: &str) -> bool {
    matches(text, pattern, MatchMode::Anywhere)
}

pub fn matches(text: &str, pattern: &str, mode: MatchMode) -> bool {
    if text.is_empty() || pattern.is_empty() {
        return false;
    }
    if pattern == "*" {
        return true;
    }

    let wildcards = pattern.matches('*').count();
    if wildcards > MAX_WILDCARDS {
        return pattern
            .split('*')
            .filter(|part| !part.is_empty())
            .all(|part| text.contains(part));
    }

    let segments: Vec<&str> = pattern.split('*').collect();
    match mode {
        MatchMode::Anywhere => find_in_order(text, &segments).is_some(),
        MatchMode::Whole => {
            if wildcards == 0 {
                return text == pattern;
            }
            // At least one wildcard, so at least two segments.
            let first = segments[0];
            let last = segments[segments.len() - 1];
            let middle = &segments[1..segments.len() - 1];
            let Some(after_prefix) = text.strip_prefix(first) else {
                return false;
            };
            match find_in_order(after_prefix, middle) {
                Some(remaining) => remaining.ends_with(last),
                None => false,
            }
        }
    }
}

/// Consume each non-empty segment at its leftmost occurrence, returning what
/// is left of `text` after the last one.
fn find_in_order<'a>(text: &'a str, segments: &[&str]) -> Option<&'a str> {
    segments
        .iter()
        .filter(|seg| !seg.is_empty())
        .try_fold(text, |rest, seg| {
            rest.find(seg).map(|idx| &rest[idx + seg.len()..])
        })
}
