//! Streaming AES-256-CTR codec.
//!
//! Ciphertext layout:
//!
//! ```text
//! ┌────────────────┬──────────────────────────────┐
//! │ IV (16 bytes)  │ plaintext XOR keystream      │
//! └────────────────┴──────────────────────────────┘
//! ```
//!
//! There is no authentication tag, so `len(ciphertext) == len(plaintext) + 16`
//! for every input. Both directions process the input in fixed-size chunks and
//! never buffer a whole object.

use crate::{CryptoError, EncryptionKey, IV_SIZE, KEY_SIZE, STREAM_BUFFER_SIZE};
use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

fn keystream(key: &EncryptionKey, iv: &[u8; IV_SIZE]) -> Result<Aes256Ctr, CryptoError> {
    Aes256Ctr::new_from_slices(key.as_bytes(), iv).map_err(|_| CryptoError::InvalidKeyLength {
        expected: KEY_SIZE,
        actual: key.as_bytes().len(),
    })
}

async fn pump<R, W>(cipher: &mut Aes256Ctr, src: &mut R, dst: &mut W) -> Result<u64, CryptoError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; STREAM_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        cipher.apply_keystream(&mut buf[..n]);
        dst.write_all(&buf[..n]).await?;
        total += n as u64;
    }
    dst.flush().await?;
    Ok(total)
}

/// Encrypt `src` into `dst`.
///
/// Writes a fresh random IV followed by the encrypted payload. Returns the
/// number of bytes written, IV included.
///
/// # Errors
///
/// Returns [`CryptoError::Io`] if reading or writing fails and
/// [`CryptoError::RandomFailed`] if no IV could be generated.
pub async fn encrypt_stream<R, W>(
    key: &EncryptionKey,
    src: &mut R,
    dst: &mut W,
) -> Result<u64, CryptoError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let iv = crate::random::random_iv()?;
    let mut cipher = keystream(key, &iv)?;
    dst.write_all(&iv).await?;
    let body = pump(&mut cipher, src, dst).await?;
    Ok(body + IV_SIZE as u64)
}

/// Decrypt `src` into `dst`.
///
/// Reads the IV prefix, then streams the remainder through the keystream.
/// Returns the number of plaintext bytes written.
///
/// # Errors
///
/// Returns [`CryptoError::Truncated`] if `src` ends before a full IV was read,
/// and [`CryptoError::Io`] for any other read or write failure.
pub async fn decrypt_stream<R, W>(
    key: &EncryptionKey,
    src: &mut R,
    dst: &mut W,
) -> Result<u64, CryptoError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut iv = [0u8; IV_SIZE];
    let mut filled = 0;
    while filled < IV_SIZE {
        let n = src.read(&mut iv[filled..]).await?;
        if n == 0 {
            return Err(CryptoError::Truncated {
                expected: IV_SIZE,
                actual: filled,
            });
        }
        filled += n;
    }

    let mut cipher = keystream(key, &iv)?;
    pump(&mut cipher, src, dst).await
}

/// Encrypt an in-memory buffer. Convenience wrapper over [`encrypt_stream`].
///
/// # Errors
///
/// See [`encrypt_stream`].
pub async fn encrypt_to_vec(key: &EncryptionKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut out = Vec::with_capacity(plaintext.len() + IV_SIZE);
    let mut src = plaintext;
    encrypt_stream(key, &mut src, &mut out).await?;
    Ok(out)
}

/// Decrypt an in-memory buffer. Convenience wrapper over [`decrypt_stream`].
///
/// # Errors
///
/// See [`decrypt_stream`].
pub async fn decrypt_to_vec(
    key: &EncryptionKey,
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let mut out = Vec::with_capacity(ciphertext.len().saturating_sub(IV_SIZE));
    let mut src = ciphertext;
    decrypt_stream(key, &mut src, &mut out).await?;
    Ok(out)
}
