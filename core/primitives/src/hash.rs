use sha2::{Digest, Sha512};
use std::fmt;
use std::str::FromStr;

/// Number of bytes in a hash.
pub const BYTE_LEN: usize = 20;
/// Number of characters in the base32 rendering of a hash.
pub const STRING_LEN: usize = 32;

/// Alphabet of the base32 rendering. 20 bytes are exactly 32 five-bit
/// characters, so there is never padding.
const ALPHABET: &[u8; 32] = b"0123456789abcdefghijklmnopqrstuv";

/// Content address of a chunk: the first 20 bytes of the SHA-512 digest of
/// its bytes. Identical bytes produce identical hashes.
///
/// The all-zero hash is reserved to mean "no value" (fresh store roots,
/// absent chunks) and is what `Hash::default()` returns.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Hash(pub [u8; BYTE_LEN]);

impl Hash {
    /// Digests `data` into a hash.
    pub fn of(data: &[u8]) -> Self {
        let digest = Sha512::digest(data);
        let mut bytes = [0u8; BYTE_LEN];
        bytes.copy_from_slice(&digest[..BYTE_LEN]);
        Hash(bytes)
    }

    /// True for the all-zero hash.
    pub fn is_empty(&self) -> bool {
        self.0 == [0u8; BYTE_LEN]
    }

    pub fn as_bytes(&self) -> &[u8; BYTE_LEN] {
        &self.0
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = [0u8; STRING_LEN];
        let mut buffer = 0u16;
        let mut bits = 0u32;
        let mut at = 0;
        for &byte in &self.0 {
            buffer = (buffer << 8) | u16::from(byte);
            bits += 8;
            while bits >= 5 {
                bits -= 5;
                out[at] = ALPHABET[usize::from((buffer >> bits) & 0x1f)];
                at += 1;
            }
        }
        // The alphabet is pure ASCII.
        f.write_str(std::str::from_utf8(&out).unwrap())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Failure to parse the textual form of a hash.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseHashError {
    #[error("hash must be {STRING_LEN} characters, got {0}")]
    BadLength(usize),
    #[error("invalid base32 character {0:?}")]
    BadChar(char),
}

impl FromStr for Hash {
    type Err = ParseHashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != STRING_LEN {
            return Err(ParseHashError::BadLength(s.len()));
        }
        let mut bytes = [0u8; BYTE_LEN];
        let mut buffer = 0u16;
        let mut bits = 0u32;
        let mut at = 0;
        for c in s.chars() {
            let digit = match c {
                '0'..='9' => c as u16 - '0' as u16,
                'a'..='v' => c as u16 - 'a' as u16 + 10,
                _ => return Err(ParseHashError::BadChar(c)),
            };
            buffer = (buffer << 5) | digit;
            bits += 5;
            if bits >= 8 {
                bits -= 8;
                bytes[at] = (buffer >> bits) as u8;
                at += 1;
            }
        }
        Ok(Hash(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn digest_is_deterministic() {
        let h1 = Hash::of(b"abc");
        let h2 = Hash::of(b"abc");
        assert_eq!(h1, h2);
        assert_ne!(h1, Hash::of(b"abd"));
        assert!(!h1.is_empty());
        assert!(Hash::default().is_empty());
    }

    #[test]
    fn display_round_trips() {
        for input in [&b"abc"[..], &b""[..], &b"hello world"[..], &[0xffu8; 40][..]] {
            let h = Hash::of(input);
            let s = h.to_string();
            assert_eq!(s.len(), STRING_LEN);
            assert_eq!(s.parse::<Hash>().unwrap(), h);
        }
        let zero = Hash::default();
        assert_eq!(zero.to_string(), "0".repeat(STRING_LEN));
        assert_eq!(zero.to_string().parse::<Hash>().unwrap(), zero);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert_matches!("tooshort".parse::<Hash>(), Err(ParseHashError::BadLength(8)));
        let bad = "w".repeat(STRING_LEN);
        assert_matches!(bad.parse::<Hash>(), Err(ParseHashError::BadChar('w')));
    }
}
