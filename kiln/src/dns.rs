//! DNS-safe name transformation.
//!
//! Service aliases come from user configuration and may contain characters
//! that are not valid in Kubernetes object names or hostnames. Proxy services
//! and host aliases derive their names from aliases through
//! [`make_rfc1123_compatible`].

/// The maximum length of an RFC 1123 DNS label.
const MAX_LABEL_LENGTH: usize = 63;

/// Transforms a name into an RFC 1123 compatible DNS label.
///
/// Uppercase letters are lowercased, characters outside `[a-z0-9-]` are
/// dropped, leading and trailing hyphens are trimmed, and the result is
/// truncated to 63 characters. The result may be empty if the input contains
/// no usable characters; callers are expected to fall back to a generated
/// name in that case.
pub fn make_rfc1123_compatible(name: &str) -> String {
    let mut label: String = name
        .chars()
        .filter_map(|c| match c {
            'a'..='z' | '0'..='9' | '-' => Some(c),
            'A'..='Z' => Some(c.to_ascii_lowercase()),
            _ => None,
        })
        .collect();

    label.truncate(MAX_LABEL_LENGTH);

    label.trim_matches('-').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_names_are_unchanged() {
        assert_eq!(make_rfc1123_compatible("postgres"), "postgres");
        assert_eq!(make_rfc1123_compatible("my-svc-0"), "my-svc-0");
    }

    #[test]
    fn invalid_characters_are_dropped() {
        assert_eq!(make_rfc1123_compatible("tutum/wordpress"), "tutumwordpress");
        assert_eq!(make_rfc1123_compatible("registry:5000"), "registry5000");
        assert_eq!(make_rfc1123_compatible("my_service"), "myservice");
    }

    #[test]
    fn uppercase_is_lowered() {
        assert_eq!(make_rfc1123_compatible("Redis"), "redis");
    }

    #[test]
    fn hyphens_are_trimmed_from_the_edges() {
        assert_eq!(make_rfc1123_compatible("-edge-case-"), "edge-case");
        assert_eq!(make_rfc1123_compatible("---"), "");
    }

    #[test]
    fn long_names_are_truncated() {
        let name = "a".repeat(100);
        assert_eq!(make_rfc1123_compatible(&name).len(), MAX_LABEL_LENGTH);
    }

    #[test]
    fn unusable_names_become_empty() {
        assert_eq!(make_rfc1123_compatible("@@@"), "");
        assert_eq!(make_rfc1123_compatible(""), "");
    }
}
