use byteorder::{LittleEndian, WriteBytesExt};

/// A password used for password protected, encrypted archives.
///
/// Internally the password is stored as UTF-16LE bytes, the form the 7z key
/// derivation consumes. Use [`Password::empty()`] when no password applies.
///
/// ```rust
/// use omniarc::Password;
///
/// let password: Password = "a password string".into();
/// ```
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Password(Vec<u8>);

impl Password {
    /// Creates a new [`Password`] from the given password string.
    pub fn new(password: &str) -> Self {
        Self::from(password)
    }

    /// Creates a new [`Password`] from raw UTF-16LE bytes.
    pub fn from_raw(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }

    /// Creates an empty password.
    pub fn empty() -> Self {
        Self(Default::default())
    }

    /// Returns the UTF-16LE byte representation of the password.
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    /// Returns `true` if the password is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl AsRef<[u8]> for Password {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<&str> for Password {
    fn from(s: &str) -> Self {
        let mut result = Vec::with_capacity(s.len() * 2);
        for u in s.encode_utf16() {
            let _ = result.write_u16::<LittleEndian>(u);
        }
        Self(result)
    }
}

impl From<&String> for Password {
    fn from(s: &String) -> Self {
        s.as_str().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_utf16le() {
        let password = Password::from("Ab");
        assert_eq!(password.as_slice(), &[0x41, 0x00, 0x42, 0x00]);
    }

    #[test]
    fn empty_password() {
        assert!(Password::empty().is_empty());
        assert!(!Password::from("x").is_empty());
    }
}
