//! Cacheability guard: only subjects whose `subject_key` is stable are
//! cacheable, ported 1:1 from `cache_policy.py`'s per-source prefix rules.

/// `true` when `subject_key` is safe to use as a cache partition for
/// `source`. Non-cacheable keys (`name:`, `query:`, ...) bypass cache read
/// and write entirely.
pub fn is_cacheable_subject(source: &str, subject_key: &str) -> bool {
    if subject_key.is_empty() {
        return false;
    }
    match source.trim().to_ascii_lowercase().as_str() {
        "scholar" => subject_key.starts_with("id:"),
        "github" => subject_key.starts_with("login:"),
        "linkedin" => subject_key.starts_with("url:"),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scholar_requires_id_prefix() {
        assert!(is_cacheable_subject("scholar", "id:abc123"));
        assert!(!is_cacheable_subject("scholar", "name:Jane Doe"));
    }

    #[test]
    fn github_requires_login_prefix() {
        assert!(is_cacheable_subject("github", "login:torvalds"));
        assert!(!is_cacheable_subject("github", "query:linux kernel"));
    }

    #[test]
    fn linkedin_requires_url_prefix() {
        assert!(is_cacheable_subject("linkedin", "url:https://linkedin.com/in/x"));
        assert!(!is_cacheable_subject("linkedin", "name:x"));
    }

    #[test]
    fn other_sources_accept_any_nonempty_key() {
        assert!(is_cacheable_subject("twitter", "handle:foo"));
        assert!(!is_cacheable_subject("twitter", ""));
    }
}
