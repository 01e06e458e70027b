//! Name codec for CBM DOS directory entries
//!
//! On disk a name is 16 bytes of PETSCII padded with shifted spaces
//! (0xA0).  This module projects those bytes onto an ASCII-safe,
//! upper-cased form used as the lookup key, and encodes host names
//! back into the padded on-disk form.  The projection is lossy by
//! design; the original bytes are preserved wherever an operation does
//! not touch the name itself.

use crate::error::{Error, ErrorKind};

/// On-disk length of a file or disk name.
pub const NAME_LEN: usize = 16;

/// The PETSCII shifted space used as name padding.
pub const PAD: u8 = 0xA0;

/// Decode a padded on-disk name into its ASCII-safe upper-cased form.
///
/// 0xA0 becomes a space, printable ASCII is kept (with `/` and `\`
/// rewritten to `_` so names never smuggle path separators), anything
/// else becomes `_`.  Trailing spaces are trimmed and the result is
/// upper-cased.
pub fn decode_name(bytes: &[u8]) -> String {
    let decoded: String = bytes
        .iter()
        .map(|&b| match b {
            PAD => ' ',
            b'/' | b'\\' => '_',
            0x20..=0x7E => b as char,
            _ => '_',
        })
        .collect();

    decoded.trim_end_matches(' ').to_ascii_uppercase()
}

/// Normalize a caller-supplied name into the lookup key form.
///
/// Lookups are case-insensitive on the upper-cased, trimmed name.
pub fn normalize_key(name: &str) -> String {
    name.trim_end_matches(' ').to_ascii_uppercase()
}

/// Encode a name for a D64/D71 directory entry (strict mode).
///
/// The input is upper-cased and padded to 16 bytes with 0xA0;
/// characters outside `A-Z`, `0-9` and `_` become `_`.  Empty and
/// over-long names cannot be represented and are rejected.
pub fn encode_name(name: &str) -> Result<[u8; NAME_LEN], Error> {
    encode_with(name, |c| match c {
        b'A'..=b'Z' | b'0'..=b'9' | b'_' => c,
        _ => b'_',
    })
}

/// Encode a name for a D81 directory entry (permissive mode).
///
/// Printable ASCII is kept apart from the path separators; everything
/// else becomes `_`.
pub fn encode_name_d81(name: &str) -> Result<[u8; NAME_LEN], Error> {
    encode_with(name, |c| match c {
        b'/' | b'\\' => b'_',
        0x20..=0x7E => c,
        _ => b'_',
    })
}

fn encode_with(name: &str, map: impl Fn(u8) -> u8) -> Result<[u8; NAME_LEN], Error> {
    let upper = name.trim_end_matches(' ').to_ascii_uppercase();
    if upper.is_empty() {
        return Err(Error::new(ErrorKind::BadRequest(String::from(
            "empty file name",
        ))));
    }
    if upper.len() > NAME_LEN {
        return Err(Error::new(ErrorKind::BadRequest(format!(
            "file name longer than {} characters: {}",
            NAME_LEN, upper
        ))));
    }

    let mut out = [PAD; NAME_LEN];
    for (i, b) in upper.bytes().enumerate() {
        out[i] = map(b);
    }
    Ok(out)
}

/// True if the name carries a CBM wildcard.  Wildcards are read-side
/// sugar in CBM DOS; any write path containing one is malformed.
pub fn has_wildcard(name: &str) -> bool {
    name.contains('*') || name.contains('?')
}

#[cfg(test)]
mod tests {
    use super::{decode_name, encode_name, encode_name_d81, has_wildcard, normalize_key};
    use pretty_assertions::assert_eq;

    #[test]
    fn decode_strips_padding() {
        let bytes = [
            0x48, 0x45, 0x4C, 0x4C, 0x4F, 0xA0, 0xA0, 0xA0, 0xA0, 0xA0, 0xA0, 0xA0, 0xA0, 0xA0,
            0xA0, 0xA0,
        ];
        assert_eq!(decode_name(&bytes), "HELLO");
    }

    #[test]
    fn decode_upper_cases_and_scrubs() {
        assert_eq!(decode_name(b"hello world\xA0\xA0\xA0\xA0\xA0"), "HELLO WORLD");
        assert_eq!(decode_name(b"a/b\\c"), "A_B_C");
        assert_eq!(decode_name(&[0x01, 0x41, 0xFF]), "_A_");
    }

    #[test]
    fn decode_keeps_interior_spaces() {
        // Only trailing spaces are trimmed; 0xA0 padding reads as
        // spaces first.
        let bytes = [0x41, 0x20, 0x42, 0xA0, 0xA0];
        assert_eq!(decode_name(&bytes), "A B");
    }

    #[test]
    fn encode_strict_scrubs_punctuation() {
        let encoded = encode_name("He.l-lo").unwrap();
        assert_eq!(&encoded[0..7], b"HE_L_LO");
        assert!(encoded[7..].iter().all(|&b| b == 0xA0));
    }

    #[test]
    fn encode_d81_keeps_printable() {
        let encoded = encode_name_d81("a.b c!").unwrap();
        assert_eq!(&encoded[0..6], b"A.B C!");
        let encoded = encode_name_d81("a/b").unwrap();
        assert_eq!(&encoded[0..3], b"A_B");
    }

    #[test]
    fn encode_rejects_unrepresentable() {
        assert_eq!(encode_name("").unwrap_err().status(), 12);
        assert_eq!(
            encode_name("ABCDEFGHIJKLMNOPQ").unwrap_err().status(),
            12
        );
    }

    /// Property: decode(encode(name)) equals the normalized name for
    /// every name the strict encoder accepts unchanged.
    #[test]
    fn name_round_trip() {
        for name in ["HELLO", "a", "FILE_1", "x9", "lower case"] {
            let encoded = encode_name_d81(name).unwrap();
            assert_eq!(decode_name(&encoded), normalize_key(name));
        }
    }

    #[test]
    fn wildcard_detection() {
        assert!(has_wildcard("GAME*"));
        assert!(has_wildcard("FILE?"));
        assert!(!has_wildcard("PLAIN"));
    }
}
