//! Small helpers shared across modules.

/// Parse a boolean setting.
///
/// Recognises `1`, `true`, `yes`, `y`, `on` (case-insensitive) as `true`;
/// any other value is `false`.
pub fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "y" | "on"
    )
}

/// Longest prefix of `s` with at most `max` characters. Never splits a char.
pub fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Make process output safe to hand to a model.
///
/// Mostly-binary output is replaced by a short description; otherwise
/// invalid UTF-8 and control characters other than whitespace are dropped.
pub fn sanitize_output(bytes: &[u8]) -> String {
    let non_printable = bytes
        .iter()
        .filter(|&&b| b < 0x20 && b != b'\n' && b != b'\r' && b != b'\t')
        .count();

    if bytes.len() > 100 && non_printable > bytes.len() / 10 {
        return format!(
            "[Binary output detected - {} bytes, {}% non-printable]",
            bytes.len(),
            non_printable * 100 / bytes.len()
        );
    }

    String::from_utf8_lossy(bytes)
        .chars()
        .filter(|&c| c == '\n' || c == '\r' || c == '\t' || (c >= ' ' && c != '\u{FFFD}'))
        .collect()
}

/// Deduplicate and trim a list of names, preserving order.
pub fn dedup_names<I, S>(names: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for name in names {
        let trimmed = name.as_ref().trim();
        if trimmed.is_empty() {
            continue;
        }
        if seen.insert(trimmed.to_string()) {
            out.push(trimmed.to_string());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
        assert_eq!(truncate_chars("", 3), "");
    }

    #[test]
    fn parse_bool_variants() {
        for v in ["1", "true", "YES", " y ", "On"] {
            assert!(parse_bool(v), "{v}");
        }
        for v in ["0", "false", "", "nope"] {
            assert!(!parse_bool(v), "{v}");
        }
    }

    #[test]
    fn sanitize_drops_control_chars() {
        assert_eq!(sanitize_output(b"ok\x07\n\tdone"), "ok\n\tdone");
        let binary = vec![0u8; 200];
        assert!(sanitize_output(&binary).starts_with("[Binary output detected"));
    }

    #[test]
    fn dedup_names_preserves_order() {
        assert_eq!(
            dedup_names(vec![" a ", "b", "", "a", "c"]),
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
    }
}
