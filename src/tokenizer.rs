//! Tokenizer driver: scans raw text, segments it into tokens using the
//! classifier of [`crate::hash`], and writes (hash, freq) pairs into a
//! caller-owned [`FreqTable`] rather than allocating per document.

use crate::freq_table::FreqTable;
use crate::hash::{delimiter_mask_16, fnv1a, nonzero_hash, CHAR_LUT};

/// Minimum kept token length, inclusive.
pub const MIN_TOKEN_LEN: usize = 2;
/// Maximum kept token length, inclusive.
pub const MAX_TOKEN_LEN: usize = 32;

/// Tokenize `text` into `table`, resetting it first. Returns the document
/// length (count of kept tokens, saturated to `u16`).
///
/// A token is a maximal run of bytes whose `CHAR_LUT` entry is non-zero.
/// Delimiters (including every non-ASCII byte) end the current token and
/// are themselves skipped. Tokens outside `[MIN_TOKEN_LEN, MAX_TOKEN_LEN]`
/// are discarded without affecting the document length.
pub fn tokenize_into(text: &str, table: &mut FreqTable) -> u16 {
    table.reset();
    let bytes = text.as_bytes();
    let len = bytes.len();
    let mut total: u32 = 0;
    let mut i = 0;

    while i < len {
        // Skip whole 16-byte runs of delimiters at once before falling
        // back to the byte-at-a-time scan for the remainder.
        while i + 16 <= len {
            let chunk: [u8; 16] = bytes[i..i + 16].try_into().unwrap();
            if delimiter_mask_16(&chunk) == 0xffff {
                i += 16;
            } else {
                break;
            }
        }
        while i < len && CHAR_LUT[bytes[i] as usize] == 0 {
            i += 1;
        }
        if i >= len {
            break;
        }

        let start = i;
        while i < len && CHAR_LUT[bytes[i] as usize] != 0 {
            i += 1;
        }
        let token_len = i - start;

        if (MIN_TOKEN_LEN..=MAX_TOKEN_LEN).contains(&token_len) {
            let lowered: Vec<u8> = bytes[start..i]
                .iter()
                .map(|&b| CHAR_LUT[b as usize])
                .collect();
            let hash = nonzero_hash(fnv1a(&lowered));
            table.insert(hash);
            total += 1;
        }
    }

    total.min(u16::MAX as u32) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokenize(text: &str) -> (Vec<(u64, u16)>, u16) {
        let mut table = FreqTable::new(4096);
        let len = tokenize_into(text, &mut table);
        let mut pairs: Vec<_> = table.iter().collect();
        pairs.sort_unstable();
        (pairs, len)
    }

    #[test]
    fn empty_text_has_zero_length() {
        let (pairs, len) = tokenize("");
        assert!(pairs.is_empty());
        assert_eq!(len, 0);
    }

    #[test]
    fn repeated_token_increments_frequency() {
        let (pairs, len) = tokenize("Hello, hello world!");
        assert_eq!(len, 3);
        assert_eq!(pairs.len(), 2);
        let hello_hash = nonzero_hash(fnv1a(b"hello"));
        let world_hash = nonzero_hash(fnv1a(b"world"));
        let map: std::collections::HashMap<_, _> = pairs.into_iter().collect();
        assert_eq!(map[&hello_hash], 2);
        assert_eq!(map[&world_hash], 1);
    }

    #[test]
    fn length_filter_drops_too_short_and_too_long() {
        let long_token = "x".repeat(33);
        let text = format!("a ab abc {}", long_token);
        let (pairs, len) = tokenize(&text);
        assert_eq!(len, 2); // only "ab" and "abc" survive
        assert_eq!(pairs.len(), 2);
    }

    #[test]
    fn non_ascii_byte_ends_token() {
        // "café" = 63 61 66 c3 a9 — 0xc3 is a delimiter, so only "caf" (len 3)
        // is a token candidate; "caf" passes the length filter.
        let (pairs, len) = tokenize("café");
        assert_eq!(len, 1);
        let caf_hash = nonzero_hash(fnv1a(b"caf"));
        assert_eq!(pairs, vec![(caf_hash, 1)]);
    }

    #[test]
    fn idempotent_across_repeated_calls() {
        let mut table = FreqTable::new(4096);
        let text = "the quick brown fox jumps over the lazy dog";
        let first_len = tokenize_into(text, &mut table);
        let mut first: Vec<_> = table.iter().collect();
        first.sort_unstable();

        let second_len = tokenize_into(text, &mut table);
        let mut second: Vec<_> = table.iter().collect();
        second.sort_unstable();

        assert_eq!(first_len, second_len);
        assert_eq!(first, second);
    }
}
