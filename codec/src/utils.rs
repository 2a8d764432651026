// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Lesser General Public License that can be found
// in the LICENSE file.

use rand::Rng;

/// Maximum byte length of a string field on the wire.
pub const MAX_STRING_LEN: usize = u16::MAX as usize;

/// Auto generated client ids are restricted to 23 bytes, which every
/// conforming server accepts.
pub const MAX_GENERATED_CLIENT_ID_LEN: usize = 23;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringError {
    TooManyData,

    /// Ill-formed UTF-8, or the string contains U+0000.
    IllFormedString,
}

/// Check whether `s` is a valid MQTT UTF-8 string.
///
/// The character data MUST NOT include encodings of code points between
/// U+D800 and U+DFFF, nor the null character U+0000 [MQTT-1.5.4-1], [MQTT-1.5.4-2].
/// Surrogates cannot occur in a rust `str`, so only the length and the null
/// character need checking here.
///
/// # Errors
///
/// Returns error if `s` is too long or contains U+0000.
pub fn validate_utf8_string(s: &str) -> Result<(), StringError> {
    if s.len() > MAX_STRING_LEN {
        return Err(StringError::TooManyData);
    }
    if s.chars().any(|c| c == '\u{0000}') {
        return Err(StringError::IllFormedString);
    }
    Ok(())
}

/// Convert raw bytes into an MQTT UTF-8 string.
///
/// # Errors
///
/// Returns error if `bytes` is not well-formed UTF-8 or violates
/// [`validate_utf8_string`].
pub fn to_utf8_string(bytes: &[u8]) -> Result<String, StringError> {
    let s = std::str::from_utf8(bytes).map_err(|_| StringError::IllFormedString)?;
    validate_utf8_string(s)?;
    Ok(s.to_string())
}

/// Generate a random client id with `prefix`.
///
/// The result is truncated to 23 bytes so that every server accepts it.
#[must_use]
pub fn random_client_id(prefix: &str) -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut rng = rand::thread_rng();
    let mut id = String::with_capacity(MAX_GENERATED_CLIENT_ID_LEN);
    id.push_str(prefix);
    while id.len() < MAX_GENERATED_CLIENT_ID_LEN {
        let idx = rng.gen_range(0..CHARSET.len());
        id.push(char::from(CHARSET[idx]));
    }
    id.truncate(MAX_GENERATED_CLIENT_ID_LEN);
    id
}

/// Check a user supplied client id.
///
/// The server MUST allow client ids which are between 1 and 23 bytes of
/// alphanumerics [MQTT-3.1.3-5]; longer or richer ids MAY be accepted, so
/// only the hard wire limit is enforced here. An empty client id requests
/// a server assigned one.
///
/// # Errors
///
/// Returns error if `id` exceeds the string field limit.
pub fn validate_client_id(id: &str) -> Result<(), StringError> {
    validate_utf8_string(id)?;
    if id.len() > MAX_GENERATED_CLIENT_ID_LEN {
        log::warn!("client id is longer than 23 bytes, some servers may reject it");
    }
    Ok(())
}
