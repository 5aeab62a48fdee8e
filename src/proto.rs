//! Helpers for the NMDC wire dialect: entity escaping, the Lock-to-Key
//! transform and human-readable byte sizes.

use regex::Regex;

lazy_static! {
    static ref ENTITY_RE: Regex = Regex::new(r"\&\#([0-9]{1,3})\;").unwrap();
}

/// Key bytes that must never appear literally in a serialized key.
const KEY_FORBIDDEN: [u8; 6] = [0, 5, 36, 96, 124, 126];

/// Escapes the characters that carry protocol significance in chat text.
pub(crate) fn escape(data: &str) -> String {
    data.replace('&', "&amp;")
        .replace('|', "&#124;")
        .replace('$', "&#36;")
}

/// Reverses [`escape`], decoding any `&#n;` entity in the fixed 0..=255 range.
pub(crate) fn unescape(data: &str) -> String {
    let data = data.replace("&amp;", "&#38;");
    ENTITY_RE
        .replace_all(&data, |caps: &regex::Captures| {
            let code: u32 = caps[1].parse().unwrap_or(0);
            match std::char::from_u32(code) {
                Some(c) => c.to_string(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Escapes a file or group name for use on disk: every non-alphanumeric
/// character becomes a `&#n;` entity.
pub(crate) fn escape_filename(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_alphanumeric() {
            out.push(c);
        } else {
            out.push_str(&format!("&#{};", c as u32));
        }
    }
    out
}

/// Generates the response to a `$Lock` challenge.
///
/// The first key byte folds in the last two lock bytes, every subsequent byte
/// is the xor of its lock byte with the previous one, and all bytes have
/// their nibbles swapped. Bytes the protocol reserves are serialized as the
/// literal `/%DCNnnn%/` escape.
pub(crate) fn lock2key(lock: &[u8]) -> Vec<u8> {
    if lock.len() < 2 {
        return Vec::new();
    }
    let mut key = Vec::with_capacity(lock.len());
    key.push(lock[0] ^ lock[lock.len() - 1] ^ lock[lock.len() - 2] ^ 5);
    for n in 1..lock.len() {
        key.push(lock[n] ^ lock[n - 1]);
    }
    let mut out = Vec::with_capacity(key.len());
    for byte in key {
        let swapped = (byte << 4) | (byte >> 4);
        if KEY_FORBIDDEN.contains(&swapped) {
            out.extend_from_slice(format!("/%DCN{:03}%/", swapped).as_bytes());
        } else {
            out.push(swapped);
        }
    }
    out
}

/// Formats a byte count in human readable form.
pub fn human_size(bytes: u64) -> String {
    const PREFIXES: [&str; 8] = ["KB", "MB", "GB", "TB", "PB", "EB", "ZB", "YB"];
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64 / 1024.0;
    for prefix in &PREFIXES {
        if value < 1024.0 {
            return format!("{:.2} {}", value, prefix);
        }
        value /= 1024.0;
    }
    format!("{:.2} {}", value * 1024.0, PREFIXES[PREFIXES.len() - 1])
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_escape_round_trip() {
        let samples = [
            "hello world",
            "a|b$c&d",
            "&amp; already escaped",
            "trailing pipe |",
            "$Search is not a command here",
        ];
        for sample in &samples {
            assert_eq!(unescape(&escape(sample)), *sample);
        }
    }

    #[test]
    fn test_escape_replaces_significant_chars() {
        assert_eq!(escape("a|b"), "a&#124;b");
        assert_eq!(escape("a$b"), "a&#36;b");
        assert_eq!(escape("a&b"), "a&amp;b");
    }

    #[test]
    fn test_escape_filename() {
        assert_eq!(escape_filename("abc123"), "abc123");
        assert_eq!(escape_filename("a b.txt"), "a&#32;b&#46;txt");
        assert_eq!(escape_filename("x/y"), "x&#47;y");
    }

    #[test]
    fn test_lock2key_reference_vector() {
        // The classic NMDC documentation lock.
        let key = lock2key(b"EXTENDEDPROTOCOLABCABCABCABCABCABCABCABC");
        assert_eq!(
            key,
            vec![
                20, 209, 192, 17, 176, 160, 16, 16, 65, 32, 209, 177, 177, 192,
                192, 48, 208, 48, 16, 32, 48, 16, 32, 48, 16, 32, 48, 16, 32,
                48, 16, 32, 48, 16, 32, 48, 16, 32, 48, 16
            ]
        );
    }

    #[test]
    fn test_lock2key_deterministic() {
        let a = lock2key(b"EXTENDEDPROTOCOLMajestic12");
        let b = lock2key(b"EXTENDEDPROTOCOLMajestic12");
        assert_eq!(a, b);
        assert_eq!(a.len(), 26);
    }

    #[test]
    fn test_lock2key_escapes_forbidden_bytes() {
        // This lock produces the raw key bytes 96 and 36, both of which must
        // be serialized as /%DCNnnn%/ escapes.
        let key = lock2key(&[0x41, 0x03]);
        assert_eq!(key, b"/%DCN096%//%DCN036%/".to_vec());

        // No unescaped forbidden byte may survive in any serialized key.
        for lock in &[&b"Majestic12"[..], b"EXTENDEDPROTOCOLABC", &[0x41, 0x03]] {
            let serialized = lock2key(lock);
            let mut i = 0;
            while i < serialized.len() {
                if serialized[i..].starts_with(b"/%DCN") {
                    i += "/%DCNnnn%/".len();
                    continue;
                }
                assert!(!KEY_FORBIDDEN.contains(&serialized[i]));
                i += 1;
            }
        }
    }

    #[test]
    fn test_human_size() {
        assert_eq!(human_size(0), "0 B");
        assert_eq!(human_size(1023), "1023 B");
        assert_eq!(human_size(1024), "1.00 KB");
        assert_eq!(human_size(5 * 1024 * 1024), "5.00 MB");
        assert_eq!(human_size(3 * 1024 * 1024 * 1024), "3.00 GB");
    }
}
