//! Base64 image payloads.
//!
//! Accepts either a bare base64 string or a `data:<mime>;base64,<payload>` URL. ASCII
//! whitespace inside the payload (line-wrapped input) is ignored.

use crate::error::{Error, ImageError, Result};
use base64::Engine;

/// Decodes a base64 payload into raw bytes.
pub fn decode_base64_payload(payload: &str) -> Result<Vec<u8>> {
  let (mime, data) = split_data_url(payload)?;
  if let Some(mime) = mime {
    if !mime.is_empty() && !mime.starts_with("image/") {
      tracing::debug!(mime, "base64 payload declares a non-image media type");
    }
  }
  decode_base64_data(data)
}

/// Splits off a `data:` prefix, returning the declared media type and the payload.
fn split_data_url(input: &str) -> Result<(Option<&str>, &str)> {
  let trimmed = input.trim_start();
  let Some(rest) = strip_prefix_ignore_case(trimmed, "data:") else {
    return Ok((None, input));
  };
  let Some((header, data)) = rest.split_once(',') else {
    return Err(Error::Image(ImageError::InvalidBase64 {
      reason: "data URL is missing ','".to_string(),
    }));
  };
  let mut params = header.split(';');
  let mime = params.next().unwrap_or("").trim();
  if !params.any(|p| p.trim().eq_ignore_ascii_case("base64")) {
    return Err(Error::Image(ImageError::InvalidBase64 {
      reason: "data URL is not base64-encoded".to_string(),
    }));
  }
  Ok((Some(mime), data))
}

fn strip_prefix_ignore_case<'a>(input: &'a str, prefix: &str) -> Option<&'a str> {
  let head = input.get(..prefix.len())?;
  head
    .eq_ignore_ascii_case(prefix)
    .then(|| &input[prefix.len()..])
}

/// Decode base64 payloads, tolerating ASCII whitespace for robustness.
fn decode_base64_data(data: &str) -> Result<Vec<u8>> {
  let mut cleaned = Vec::with_capacity(data.len());
  let mut saw_whitespace = false;

  for byte in data.bytes() {
    if byte.is_ascii_whitespace() {
      saw_whitespace = true;
      continue;
    }
    cleaned.push(byte);
  }

  let input = if saw_whitespace {
    cleaned.as_slice()
  } else {
    data.as_bytes()
  };
  if input.is_empty() {
    return Err(Error::Image(ImageError::InvalidBase64 {
      reason: "empty payload".to_string(),
    }));
  }

  base64::engine::general_purpose::STANDARD
    .decode(input)
    .map_err(|e| {
      Error::Image(ImageError::InvalidBase64 {
        reason: e.to_string(),
      })
    })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn decodes_bare_payload() {
    assert_eq!(decode_base64_payload("aGVsbG8=").unwrap(), b"hello");
  }

  #[test]
  fn tolerates_whitespace() {
    assert_eq!(decode_base64_payload("aGVs\n bG8=\r\n").unwrap(), b"hello");
  }

  #[test]
  fn strips_data_url_prefix() {
    assert_eq!(
      decode_base64_payload("data:image/png;base64,aGVsbG8=").unwrap(),
      b"hello"
    );
    assert_eq!(
      decode_base64_payload("DATA:image/gif;charset=binary;BASE64,aGVsbG8=").unwrap(),
      b"hello"
    );
  }

  #[test]
  fn rejects_malformed_input() {
    assert!(decode_base64_payload("!!!").is_err());
    assert!(decode_base64_payload("").is_err());
    assert!(decode_base64_payload("data:image/png,plain").is_err());
    assert!(decode_base64_payload("data:image/png;base64").is_err());
  }
}
