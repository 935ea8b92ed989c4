//! Secure random number generation.
//!
//! All randomness comes from the operating system CSPRNG.

use crate::{CryptoError, IV_SIZE, KEY_SIZE};

/// Fill a buffer with random bytes from the OS CSPRNG.
///
/// # Errors
///
/// Returns [`CryptoError::RandomFailed`] if the underlying OS CSPRNG fails.
pub fn fill_random(buf: &mut [u8]) -> Result<(), CryptoError> {
    getrandom::getrandom(buf).map_err(|_| CryptoError::RandomFailed)
}

/// Generate a fresh CTR initialization vector.
///
/// # Errors
///
/// Returns [`CryptoError::RandomFailed`] if the underlying OS CSPRNG fails.
pub fn random_iv() -> Result<[u8; IV_SIZE], CryptoError> {
    let mut buf = [0u8; IV_SIZE];
    fill_random(&mut buf)?;
    Ok(buf)
}

/// Generate a random 32-byte array.
///
/// # Errors
///
/// Returns [`CryptoError::RandomFailed`] if the underlying OS CSPRNG fails.
pub fn random_32() -> Result<[u8; KEY_SIZE], CryptoError> {
    let mut buf = [0u8; KEY_SIZE];
    fill_random(&mut buf)?;
    Ok(buf)
}
