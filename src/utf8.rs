//! Incremental UTF-8 decoding across read boundaries.

use tracing::debug;

/// Longest UTF-8 encoding of a single code point.
const MAX_SEQUENCE: usize = 4;

/// Decodes UTF-8 fed in arbitrary slices. A multi-byte sequence cut by a
/// read boundary is held back and completed by the next call.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes of an incomplete sequence carried over to the next call.
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }

    /// Decode as much of `pending + bytes` as forms complete code points.
    ///
    /// Invalid sequences become U+FFFD and decoding resumes right after
    /// them, so a bad byte never shifts the text that follows.
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        if bytes.is_empty() {
            return String::new();
        }

        let input: Vec<u8> = if self.pending.is_empty() {
            bytes.to_vec()
        } else {
            let mut joined = std::mem::take(&mut self.pending);
            joined.extend_from_slice(bytes);
            joined
        };

        let mut out = String::with_capacity(input.len());
        let mut rest = &input[..];
        loop {
            match std::str::from_utf8(rest) {
                Ok(text) => {
                    out.push_str(text);
                    break;
                }
                Err(err) => {
                    let (valid, after) = rest.split_at(err.valid_up_to());
                    out.push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match err.error_len() {
                        Some(bad) => {
                            debug!(bad, "replacing invalid utf-8 sequence");
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[bad..];
                        }
                        None => {
                            debug_assert!(after.len() < MAX_SEQUENCE);
                            self.pending.extend_from_slice(after);
                            break;
                        }
                    }
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_multibyte_character() {
        let text = "caf\u{e9} \u{1f426} \u{65e5}\u{672c}";
        let bytes = text.as_bytes();

        for split in 0..=bytes.len() {
            let mut decoder = Utf8Decoder::new();
            let mut got = decoder.decode(&bytes[..split]);
            got.push_str(&decoder.decode(&bytes[split..]));
            assert_eq!(got, text, "split at {split}");
            assert!(decoder.pending().is_empty());
        }
    }

    #[test]
    fn one_byte_at_a_time() {
        let text = "\u{1f426}\u{1f426}x";
        let mut decoder = Utf8Decoder::new();
        let got: String = text
            .as_bytes()
            .iter()
            .map(|b| decoder.decode(std::slice::from_ref(b)))
            .collect();
        assert_eq!(got, text);
    }

    #[test]
    fn invalid_bytes_do_not_desync() {
        let mut decoder = Utf8Decoder::new();
        let got = decoder.decode(b"a\xffb\xc3");
        assert_eq!(got, "a\u{fffd}b");
        assert_eq!(decoder.pending(), b"\xc3");
        assert_eq!(decoder.decode(b"\xa9!"), "\u{e9}!");
    }
}
