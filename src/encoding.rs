//! Entry-name encoding layer.
//!
//! Archive formats predate Unicode; names are byte strings whose meaning
//! depends on the producing system. [`EntryEncoding`] wraps an
//! `encoding_rs` encoding plus the policies readers and writers need.

use std::borrow::Cow;

use crate::{Error, Result};

/// A character encoding for entry names and text fields.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct EntryEncoding(&'static encoding_rs::Encoding);

impl std::fmt::Debug for EntryEncoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EntryEncoding({})", self.0.name())
    }
}

impl Default for EntryEncoding {
    fn default() -> Self {
        Self::UTF_8
    }
}

impl EntryEncoding {
    /// UTF-8, the default for modern producers.
    pub const UTF_8: Self = Self(encoding_rs::UTF_8);
    /// ISO-8859-1, the GZIP and historical TAR text encoding.
    pub const LATIN1: Self = Self(encoding_rs::WINDOWS_1252);
    /// IBM code page 437 via its closest superset, for legacy ZIP names.
    pub const CP437: Self = Self(encoding_rs::IBM866);

    /// Wraps an arbitrary `encoding_rs` encoding.
    pub const fn new(encoding: &'static encoding_rs::Encoding) -> Self {
        Self(encoding)
    }

    /// Looks an encoding up by WHATWG label, e.g. `"shift_jis"`.
    pub fn for_label(label: &str) -> Option<Self> {
        encoding_rs::Encoding::for_label(label.as_bytes()).map(Self)
    }

    /// Decodes bytes, substituting U+FFFD for undecodable sequences.
    pub fn decode(&self, bytes: &[u8]) -> String {
        let (text, _, _) = self.0.decode(bytes);
        text.into_owned()
    }

    /// Decodes bytes, failing on any undecodable sequence.
    pub fn decode_strict(&self, bytes: &[u8]) -> Result<String> {
        let (text, _, had_errors) = self.0.decode(bytes);
        if had_errors {
            return Err(Error::invalid(format!(
                "name is not valid {}",
                self.0.name()
            )));
        }
        Ok(text.into_owned())
    }

    /// Encodes text, failing on unmappable characters.
    pub fn encode<'a>(&self, text: &'a str) -> Result<Cow<'a, [u8]>> {
        let (bytes, _, had_errors) = self.0.encode(text);
        if had_errors {
            return Err(Error::invalid(format!(
                "name cannot be encoded as {}",
                self.0.name()
            )));
        }
        Ok(match bytes {
            Cow::Borrowed(b) => Cow::Borrowed(b),
            Cow::Owned(b) => Cow::Owned(b),
        })
    }

    /// Whether every character of `text` is representable.
    pub fn can_encode(&self, text: &str) -> bool {
        let (_, _, had_errors) = self.0.encode(text);
        !had_errors
    }

    /// The canonical name of the wrapped encoding.
    pub fn name(&self) -> &'static str {
        self.0.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utf8_roundtrip() {
        let enc = EntryEncoding::UTF_8;
        let encoded = enc.encode("dir/ünïcode.txt").unwrap();
        assert_eq!(enc.decode_strict(&encoded).unwrap(), "dir/ünïcode.txt");
    }

    #[test]
    fn latin1_rejects_unmappable() {
        assert!(!EntryEncoding::LATIN1.can_encode("サンプル"));
        assert!(EntryEncoding::LATIN1.encode("サンプル").is_err());
    }

    #[test]
    fn lossy_decode_substitutes() {
        let decoded = EntryEncoding::UTF_8.decode(&[0x66, 0xFF, 0x6F]);
        assert!(decoded.contains('\u{FFFD}'));
    }

    #[test]
    fn label_lookup() {
        assert!(EntryEncoding::for_label("shift_jis").is_some());
        assert!(EntryEncoding::for_label("not-a-charset").is_none());
    }
}
