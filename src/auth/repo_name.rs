//! Repository identifier validation.
//!
//! Identifiers arrive straight from the client's exec request and are used as
//! a path component under the repository root, as a URL path segment towards
//! the key authority, and inside the generated post-receive hook.  Anything
//! outside a conservative charset is refused before it reaches any of those.

/// Longest identifier accepted, in characters.
pub const MAX_REPO_NAME_LEN: usize = 100;

/// Return `true` if `name` is a safe repository identifier.
///
/// A valid identifier is 1 to [`MAX_REPO_NAME_LEN`] characters drawn from
/// `[A-Za-z0-9._-]` and never contains `..`.  No trimming or case folding is
/// applied.
pub fn is_valid_repo_name(name: &str) -> bool {
    if name.is_empty() || name.chars().count() > MAX_REPO_NAME_LEN {
        return false;
    }
    if name.contains("..") || name.contains('/') {
        return false;
    }
    name.chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_simple_names() {
        assert!(is_valid_repo_name("demo"));
        assert!(is_valid_repo_name("my-repo_2.0"));
        assert!(is_valid_repo_name("A"));
        assert!(is_valid_repo_name("project.git-mirror"));
    }

    #[test]
    fn accepts_full_charset_at_max_length() {
        let charset = "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789._-";
        let name: String = charset.chars().cycle().take(MAX_REPO_NAME_LEN).collect();
        assert!(!name.contains(".."));
        assert!(is_valid_repo_name(&name));
    }

    #[test]
    fn rejects_empty() {
        assert!(!is_valid_repo_name(""));
    }

    #[test]
    fn rejects_over_length() {
        let name = "a".repeat(MAX_REPO_NAME_LEN + 1);
        assert!(!is_valid_repo_name(&name));
    }

    #[test]
    fn rejects_path_separators_and_traversal() {
        assert!(!is_valid_repo_name("org/repo"));
        assert!(!is_valid_repo_name("/demo"));
        assert!(!is_valid_repo_name(".."));
        assert!(!is_valid_repo_name("a..b"));
        assert!(!is_valid_repo_name("../etc"));
    }

    #[test]
    fn rejects_shell_metacharacters() {
        for bad in ["a;b", "a$b", "a\0b", "a b", "a\\b", "a'b", "a`b", "a\nb"] {
            assert!(!is_valid_repo_name(bad), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn rejects_non_ascii() {
        assert!(!is_valid_repo_name("répo"));
        assert!(!is_valid_repo_name("ｄｅｍｏ"));
    }

    #[test]
    fn no_normalisation_is_applied() {
        assert!(!is_valid_repo_name(" demo"));
        assert!(!is_valid_repo_name("demo\t"));
    }
}
