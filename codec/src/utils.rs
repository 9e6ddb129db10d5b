// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};

/// Text fields in MQTT control packets are limited to 64KiB.
pub const MAX_STRING_BYTES: usize = u16::MAX as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringError {
    /// Larger than 65535 bytes.
    TooLong,

    /// Contains the null character U+0000 [MQTT-1.5.4-2].
    InvalidChar,

    /// Byte sequence is not well-formed UTF-8 [MQTT-1.5.4-1].
    Utf8Error,
}

/// Check that `s` is a legal MQTT string value.
///
/// # Errors
///
/// Returns error if `s` is too long or contains the null character.
pub fn validate_utf8_string(s: &str) -> Result<(), StringError> {
    if s.len() > MAX_STRING_BYTES {
        return Err(StringError::TooLong);
    }
    if s.chars().any(|c| c == '\u{0000}') {
        return Err(StringError::InvalidChar);
    }
    Ok(())
}

/// Convert a raw byte sequence read from a packet into a validated string.
///
/// # Errors
///
/// Returns error if `bytes` are not well-formed UTF-8 or violate string rules.
pub fn to_utf8_string(bytes: &[u8]) -> Result<String, StringError> {
    let s = String::from_utf8(bytes.to_vec()).map_err(|_| StringError::Utf8Error)?;
    validate_utf8_string(&s)?;
    Ok(s)
}

/// Generate random alphanumeric string with `len` chars.
#[must_use]
pub fn random_string(len: usize) -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Generate a client id for clients which connected with a zero-length one.
#[must_use]
pub fn random_client_id() -> String {
    format!("loon-{}", random_string(16))
}

/// Check a client supplied client id.
///
/// The generous interpretation is used: any non-null UTF-8 string up to the
/// string limit is accepted. Zero-length handling is a broker policy decision,
/// not a codec one.
///
/// # Errors
///
/// Returns error if `client_id` violates string rules.
pub fn validate_client_id(client_id: &str) -> Result<(), StringError> {
    validate_utf8_string(client_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_utf8_string() {
        assert!(validate_utf8_string("sensors/room1/temp").is_ok());
        assert!(validate_utf8_string("").is_ok());
        assert_eq!(
            validate_utf8_string("a\u{0000}b"),
            Err(StringError::InvalidChar)
        );
        let long = "x".repeat(MAX_STRING_BYTES + 1);
        assert_eq!(validate_utf8_string(&long), Err(StringError::TooLong));
    }

    #[test]
    fn test_random_client_id() {
        let id = random_client_id();
        assert!(id.starts_with("loon-"));
        assert_ne!(id, random_client_id());
    }
}
