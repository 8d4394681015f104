/// `*`-wildcard match used for catalog action filters and policy rules.
/// Comparison is exact apart from the wildcard; callers normalize case.
pub fn wildcard_matches(pattern: &str, value: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if !pattern.contains('*') {
        return pattern == value;
    }
    let parts = pattern.split('*').collect::<Vec<_>>();
    let last = parts.len() - 1;
    let mut remaining = value;
    for (index, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if index == 0 {
            if let Some(stripped) = remaining.strip_prefix(part) {
                remaining = stripped;
            } else {
                return false;
            }
            continue;
        }
        if index == last {
            return remaining.ends_with(part);
        }
        if let Some(pos) = remaining.find(part) {
            remaining = &remaining[pos + part.len()..];
        } else {
            return false;
        }
    }
    pattern.ends_with('*') || remaining.is_empty()
}

/// True when `value` matches any of `patterns`, ignoring ASCII case.
/// An empty pattern list matches everything.
pub fn matches_any(patterns: &[String], value: &str) -> bool {
    if patterns.is_empty() {
        return true;
    }
    let value = value.trim().to_ascii_lowercase();
    patterns
        .iter()
        .any(|p| wildcard_matches(&p.trim().to_ascii_lowercase(), &value))
}
