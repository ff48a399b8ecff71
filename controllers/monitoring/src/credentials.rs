//! Generated passwords for internal credentials.

use crate::error::ControllerError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;

/// Length of every generated credential.
pub const PASSWORD_LENGTH: usize = 24;

/// Returns `length` random characters from `[A-Za-z0-9]`.
///
/// Draws `3 * length` bytes from the OpenSSL CSPRNG, base64-encodes them and
/// keeps only alphanumerics, drawing again until enough survive.
pub fn generate_password(length: usize) -> Result<String, ControllerError> {
    generate_with(length, |buf| {
        openssl::rand::rand_bytes(buf).map_err(|e| ControllerError::Credential(format!("random source failed: {e}")))
    })
}

fn generate_with<F>(length: usize, mut fill: F) -> Result<String, ControllerError>
where
    F: FnMut(&mut [u8]) -> Result<(), ControllerError>,
{
    if length < 1 {
        return Err(ControllerError::Credential(format!(
            "password length must be at least 1, got {length}"
        )));
    }

    let mut password = String::with_capacity(length);
    let mut buf = vec![0u8; length.saturating_mul(3)];
    while password.len() < length {
        fill(&mut buf)?;
        password.extend(STANDARD.encode(&buf).chars().filter(char::is_ascii_alphanumeric));
    }
    password.truncate(length);
    Ok(password)
}
