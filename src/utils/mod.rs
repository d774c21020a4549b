//! Small helpers shared across the node

pub mod backoff;

pub use backoff::RecoveryPolicy;

/// Current wall clock time as fractional seconds since the Unix epoch
///
/// This is the `t` qualifier sent with every value.
pub fn now() -> f64 {
    let ts = chrono::Utc::now();
    #[allow(clippy::cast_precision_loss)]
    let micros = ts.timestamp_micros() as f64;
    micros / 1e6
}

/// Truncate `text` to at most `max` bytes without splitting a character
pub fn truncate_utf8(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_is_recent() {
        // 2020-01-01
        assert!(now() > 1_577_836_800.0);
    }

    #[test]
    fn test_truncate_on_char_boundary() {
        assert_eq!(truncate_utf8("abc", 10), "abc");
        assert_eq!(truncate_utf8("abc", 2), "ab");
        assert_eq!(truncate_utf8("aäb", 2), "a");
        assert_eq!(truncate_utf8("ä", 0), "");
    }
}
