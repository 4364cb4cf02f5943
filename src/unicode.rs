//! Unicode-safe streaming text reader.
//!
//! [`UnicodeReader`] turns a byte stream of unknown provenance into batches
//! of clean text:
//!
//! 1. **Encoding**: a byte-order mark selects UTF-8, UTF-16LE or UTF-16BE and
//!    is consumed. Without a BOM the configured single-byte fallback
//!    (windows-1252 by default) is used. Decoding is stateful, so a
//!    multi-byte sequence split across two reads decodes correctly.
//!    Malformed input becomes U+FFFD, never an error.
//! 2. **Normalization**: NFC, with composition preserved across read
//!    boundaries.
//! 3. **Sanitation**: every line-break variant (CRLF, CR, VT, FF, NEL,
//!    U+2028, U+2029) becomes `\n`. NUL is dropped. Other C0/C1 controls
//!    except `\n` and `\t` become a space.
//!
//! Output is yielded in batches of at most `batch_chars` characters so
//! memory stays bounded regardless of document size.

use encoding_rs::{CoderResult, Decoder, Encoding, WINDOWS_1252};
use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use unicode_normalization::char::canonical_combining_class;
use unicode_normalization::UnicodeNormalization;

use crate::config::ReaderConfig;

const READ_BUF_BYTES: usize = 16 * 1024;

/// Held-back text for normalization never grows past this many chars, even
/// for pathological runs of combining marks.
const MAX_NFC_HOLD: usize = 1024;

/// Streaming decoder yielding sanitized text batches.
///
/// Finite and not restartable: open a new reader to read the file again.
pub struct UnicodeReader<R> {
    inner: R,
    decoder: Decoder,
    batch_chars: usize,
    normalize: bool,
    raw: Vec<u8>,
    hold: String,
    pending_cr: bool,
    ready: VecDeque<char>,
    eof: bool,
}

impl UnicodeReader<File> {
    /// Open `path` with the reader settings from config.
    pub fn open(path: &Path, config: &ReaderConfig) -> io::Result<Self> {
        let file = File::open(path)?;
        let fallback = Encoding::for_label(config.fallback_encoding.as_bytes()).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unknown encoding label '{}'", config.fallback_encoding),
            )
        })?;
        Ok(Self::new(file, fallback, config.batch_chars, config.normalize_nfc))
    }
}

impl<R: Read> UnicodeReader<R> {
    pub fn new(inner: R, fallback: &'static Encoding, batch_chars: usize, normalize: bool) -> Self {
        Self {
            inner,
            // BOM sniffing: a recognized BOM overrides `fallback` and is removed.
            decoder: fallback.new_decoder(),
            batch_chars: batch_chars.max(1),
            normalize,
            raw: vec![0; READ_BUF_BYTES],
            hold: String::new(),
            pending_cr: false,
            ready: VecDeque::new(),
            eof: false,
        }
    }

    /// Reader with the default windows-1252 fallback and NFC enabled.
    pub fn with_defaults(inner: R, batch_chars: usize) -> Self {
        Self::new(inner, WINDOWS_1252, batch_chars, true)
    }

    fn fill(&mut self) -> io::Result<()> {
        let n = loop {
            match self.inner.read(&mut self.raw) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        };
        let last = n == 0;
        let decoded = decode_piece(&mut self.decoder, &self.raw[..n], last);

        let normalized = if self.normalize {
            self.normalize_piece(decoded, last)
        } else {
            decoded
        };
        sanitize_into(&normalized, &mut self.pending_cr, &mut self.ready);

        if last {
            self.eof = true;
        }
        Ok(())
    }

    /// NFC-normalize `decoded`, holding back the tail that a later piece
    /// could still compose with.
    fn normalize_piece(&mut self, decoded: String, last: bool) -> String {
        self.hold.push_str(&decoded);
        if last {
            let all = std::mem::take(&mut self.hold);
            return all.nfc().collect();
        }

        let split = self
            .hold
            .char_indices()
            .rev()
            .find(|(_, c)| canonical_combining_class(*c) == 0)
            .map(|(i, _)| i)
            .unwrap_or(0);
        let split = if split == 0 && self.hold.chars().count() > MAX_NFC_HOLD {
            self.hold.len()
        } else {
            split
        };

        let tail = self.hold.split_off(split);
        let stable = std::mem::replace(&mut self.hold, tail);
        stable.nfc().collect()
    }
}

impl<R: Read> Iterator for UnicodeReader<R> {
    type Item = io::Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.ready.len() < self.batch_chars && !self.eof {
            if let Err(e) = self.fill() {
                self.eof = true;
                return Some(Err(e));
            }
        }
        if self.ready.is_empty() {
            return None;
        }
        let take = self.ready.len().min(self.batch_chars);
        Some(Ok(self.ready.drain(..take).collect()))
    }
}

fn decode_piece(decoder: &mut Decoder, bytes: &[u8], last: bool) -> String {
    let capacity = decoder
        .max_utf8_buffer_length(bytes.len())
        .unwrap_or(bytes.len() * 3 + 16);
    let mut out = String::with_capacity(capacity);
    let mut input = bytes;
    loop {
        let (result, read, _had_errors) = decoder.decode_to_string(input, &mut out, last);
        input = &input[read..];
        match result {
            CoderResult::InputEmpty => break,
            CoderResult::OutputFull => out.reserve(input.len() * 3 + 16),
        }
    }
    out
}

/// Apply line-break and control-character rules to `text`.
///
/// `pending_cr` carries a trailing CR between calls so that a CRLF split
/// across two pieces still yields a single `\n`.
fn sanitize_into(text: &str, pending_cr: &mut bool, out: &mut VecDeque<char>) {
    for c in text.chars() {
        if *pending_cr {
            *pending_cr = false;
            if c == '\n' {
                continue;
            }
        }
        match c {
            '\r' => {
                out.push_back('\n');
                *pending_cr = true;
            }
            '\n' | '\u{000B}' | '\u{000C}' | '\u{0085}' | '\u{2028}' | '\u{2029}' => {
                out.push_back('\n')
            }
            '\0' => {}
            '\t' => out.push_back('\t'),
            c if c.is_control() => out.push_back(' '),
            c => out.push_back(c),
        }
    }
}

/// Decode and sanitize a whole byte slice. Convenience for small inputs.
pub fn decode_all(bytes: &[u8]) -> String {
    UnicodeReader::with_defaults(bytes, usize::MAX)
        .filter_map(|b| b.ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A reader that hands out at most `step` bytes per read call.
    struct Trickle<'a> {
        data: &'a [u8],
        step: usize,
    }

    impl Read for Trickle<'_> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = self.step.min(buf.len()).min(self.data.len());
            buf[..n].copy_from_slice(&self.data[..n]);
            self.data = &self.data[n..];
            Ok(n)
        }
    }

    fn read_trickle(data: &[u8], step: usize, batch: usize) -> Vec<String> {
        UnicodeReader::with_defaults(Trickle { data, step }, batch)
            .map(|b| b.unwrap())
            .collect()
    }

    #[test]
    fn test_utf8_bom_consumed() {
        assert_eq!(decode_all(b"\xEF\xBB\xBFhello"), "hello");
    }

    #[test]
    fn test_utf16le_bom() {
        let mut bytes = vec![0xFF, 0xFE];
        for u in "héllo\n".encode_utf16() {
            bytes.extend_from_slice(&u.to_le_bytes());
        }
        assert_eq!(decode_all(&bytes), "héllo\n");
    }

    #[test]
    fn test_utf16be_bom() {
        let mut bytes = vec![0xFE, 0xFF];
        for u in "ok".encode_utf16() {
            bytes.extend_from_slice(&u.to_be_bytes());
        }
        assert_eq!(decode_all(&bytes), "ok");
    }

    #[test]
    fn test_no_bom_falls_back_to_windows_1252() {
        // 0x93/0x94 are curly quotes in windows-1252; 0xE9 is é.
        assert_eq!(decode_all(b"\x93caf\xE9\x94"), "\u{201C}café\u{201D}");
    }

    #[test]
    fn test_no_bytes_skipped_without_bom() {
        assert_eq!(decode_all(b"ab"), "ab");
    }

    #[test]
    fn test_multibyte_split_across_reads() {
        let text = "naïve 日本語 façade\n";
        let mut bytes = b"\xEF\xBB\xBF".to_vec();
        bytes.extend_from_slice(text.as_bytes());
        let out: String = read_trickle(&bytes, 1, 4).concat();
        assert_eq!(out, text);
    }

    #[test]
    fn test_malformed_utf8_is_replaced() {
        let out = decode_all(b"\xEF\xBB\xBFok\xFF\xFEdone");
        assert!(out.starts_with("ok"));
        assert!(out.ends_with("done"));
        assert!(out.contains('\u{FFFD}'));
    }

    #[test]
    fn test_line_breaks_normalized() {
        let input = "a\r\nb\rc\u{000B}d\u{000C}e\u{0085}f\u{2028}g\u{2029}h";
        let mut bytes = b"\xEF\xBB\xBF".to_vec();
        bytes.extend_from_slice(input.as_bytes());
        assert_eq!(decode_all(&bytes), "a\nb\nc\nd\ne\nf\ng\nh");
    }

    #[test]
    fn test_crlf_split_across_reads() {
        let out: String = read_trickle(b"\xEF\xBB\xBFone\r\ntwo\r\r\nthree", 1, 2).concat();
        assert_eq!(out, "one\ntwo\n\nthree");
    }

    #[test]
    fn test_controls_sanitized() {
        let out = decode_all(b"\xEF\xBB\xBFa\x00b\x01c\td\x7Fe");
        assert_eq!(out, "ab c\td e");
    }

    #[test]
    fn test_c1_controls_become_space() {
        let mut bytes = b"\xEF\xBB\xBF".to_vec();
        bytes.extend_from_slice("x\u{0090}y".as_bytes());
        assert_eq!(decode_all(&bytes), "x y");
    }

    #[test]
    fn test_nfc_composition() {
        let mut bytes = b"\xEF\xBB\xBF".to_vec();
        bytes.extend_from_slice("e\u{0301}".as_bytes());
        assert_eq!(decode_all(&bytes), "\u{00E9}");
    }

    #[test]
    fn test_nfc_across_read_boundary() {
        let mut bytes = b"\xEF\xBB\xBF".to_vec();
        bytes.extend_from_slice("cafe\u{0301} au lait".as_bytes());
        let out: String = read_trickle(&bytes, 5, 3).concat();
        assert_eq!(out, "caf\u{00E9} au lait");
    }

    #[test]
    fn test_nfc_disabled() {
        let mut bytes = b"\xEF\xBB\xBF".to_vec();
        bytes.extend_from_slice("e\u{0301}".as_bytes());
        let out: String = UnicodeReader::new(&bytes[..], WINDOWS_1252, 16, false)
            .map(|b| b.unwrap())
            .collect();
        assert_eq!(out, "e\u{0301}");
    }

    #[test]
    fn test_batches_bounded() {
        let data = "x".repeat(100);
        let batches = read_trickle(data.as_bytes(), 7, 30);
        assert_eq!(batches.len(), 4);
        assert!(batches.iter().all(|b| b.chars().count() <= 30));
        assert_eq!(batches.concat(), data);
    }

    #[test]
    fn test_empty_input() {
        assert!(read_trickle(b"", 4, 4).is_empty());
    }
}
