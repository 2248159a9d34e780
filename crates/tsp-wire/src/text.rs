//! Validation and sanitisation of metric names, tag keys, and tag values.

use crate::point::PointError;

/// Check that `b` is acceptable as metric or tag text: non-empty UTF-8 where
/// every character is ASCII alphanumeric, one of `- _ . /`, or a non-ASCII
/// letter or digit.
pub fn valid(b: &[u8]) -> Result<(), PointError> {
    if b.is_empty() {
        return Err(PointError::EmptyText);
    }
    let s = std::str::from_utf8(b).map_err(|_| PointError::InvalidUtf8)?;
    for ch in s.chars() {
        let ok = ch.is_ascii_alphanumeric()
            || matches!(ch, '-' | '_' | '.' | '/')
            || (!ch.is_ascii() && ch.is_alphanumeric());
        if !ok {
            return Err(PointError::InvalidChar {
                ch,
                text: s.to_string(),
            });
        }
    }
    Ok(())
}

/// Replace every character that is not storable downstream with an
/// underscore. Must be applied to any externally-provided metric name, tag
/// key, or tag value before building a point from it.
///
/// Note that `clean` is surjective and may therefore cause data conflicts.
pub fn clean(s: &str) -> String {
    s.chars().map(to_storable).collect()
}

fn to_storable(ch: char) -> char {
    if ch.is_ascii_graphic() && !is_query_meta(ch) {
        ch
    } else {
        '_'
    }
}

/// Characters reserved by the downstream query language.
fn is_query_meta(ch: char) -> bool {
    matches!(ch, '{' | '}' | '=' | ',' | '|' | '*')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_accepts_metric_charset() {
        for text in ["foo", "foo.bar-baz_2/x", "A9", "żółć", "метрика7"] {
            assert!(valid(text.as_bytes()).is_ok(), "rejected {text:?}");
        }
    }

    #[test]
    fn test_valid_rejects() {
        assert!(matches!(valid(b""), Err(PointError::EmptyText)));
        assert!(matches!(valid(&[0xff, 0xfe]), Err(PointError::InvalidUtf8)));
        for text in ["a b", "a=b", "a{b", "a|b", "a*b", "a,b", "a\tb", "a\nb"] {
            assert!(
                matches!(valid(text.as_bytes()), Err(PointError::InvalidChar { .. })),
                "accepted {text:?}"
            );
        }
    }

    #[test]
    fn test_clean() {
        assert_eq!(clean("foo.bar"), "foo.bar");
        assert_eq!(clean("a b\tc"), "a_b_c");
        assert_eq!(clean("q{a=b,c|d}*"), "q_a_b_c_d__");
        assert_eq!(clean("naïve"), "na_ve");
        assert_eq!(clean("ctrl\u{7}char"), "ctrl_char");
    }
}
