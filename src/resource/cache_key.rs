//! 128-bit cache keys derived from a resource's logical address.

use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

const HEX: &[u8; 16] = b"0123456789abcdef";

/// Key under which a resource is cached in both tiers.
///
/// The first 16 bytes of SHA-256 over the logical source string. Collisions are possible in
/// principle and accepted. Rendered as 32 lowercase hex characters in file names and journal
/// records.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey([u8; 16]);

impl CacheKey {
  pub fn for_source(logical: &str) -> Self {
    let digest = Sha256::digest(logical.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Self(bytes)
  }

  pub fn as_bytes(&self) -> &[u8; 16] {
    &self.0
  }

  pub fn to_hex(&self) -> String {
    let mut out = String::with_capacity(32);
    for &b in self.0.iter() {
      out.push(HEX[(b >> 4) as usize] as char);
      out.push(HEX[(b & 0x0f) as usize] as char);
    }
    out
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.to_hex())
  }
}

impl fmt::Debug for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "CacheKey({})", self.to_hex())
  }
}

/// Error returned when a string is not a 32-character lowercase hex key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseCacheKeyError;

impl fmt::Display for ParseCacheKeyError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str("cache keys are 32 lowercase hex characters")
  }
}

impl std::error::Error for ParseCacheKeyError {}

impl FromStr for CacheKey {
  type Err = ParseCacheKeyError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let raw = s.as_bytes();
    if raw.len() != 32 {
      return Err(ParseCacheKeyError);
    }
    let mut bytes = [0u8; 16];
    for (i, pair) in raw.chunks_exact(2).enumerate() {
      bytes[i] = (hex_value(pair[0])? << 4) | hex_value(pair[1])?;
    }
    Ok(Self(bytes))
  }
}

fn hex_value(c: u8) -> Result<u8, ParseCacheKeyError> {
  match c {
    b'0'..=b'9' => Ok(c - b'0'),
    b'a'..=b'f' => Ok(c - b'a' + 10),
    _ => Err(ParseCacheKeyError),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn key_is_stable_and_hex_rendered() {
    let a = CacheKey::for_source("https://example.com/cat.png");
    let b = CacheKey::for_source("https://example.com/cat.png");
    assert_eq!(a, b);
    let hex = a.to_string();
    assert_eq!(hex.len(), 32);
    assert!(hex.bytes().all(|c| c.is_ascii_digit() || (b'a'..=b'f').contains(&c)));
    assert_eq!(hex.parse::<CacheKey>().unwrap(), a);
  }

  #[test]
  fn distinct_sources_get_distinct_keys() {
    let a = CacheKey::for_source("https://example.com/a.png");
    let b = CacheKey::for_source("https://example.com/b.png");
    assert_ne!(a, b);
  }

  #[test]
  fn parse_rejects_malformed_keys() {
    assert!("".parse::<CacheKey>().is_err());
    assert!("ABCDEF0123456789abcdef0123456789".parse::<CacheKey>().is_err());
    assert!("0123".parse::<CacheKey>().is_err());
    assert!("zz23456789abcdef0123456789abcdef".parse::<CacheKey>().is_err());
  }
}
