//! Connection handshakes.
//!
//! A handshake runs on the raw connection halves before the peer is handed to
//! the application. Failing it closes the connection.

use crate::transport::{TransportError, TransportResult};
use crate::{DynReader, DynWriter};
use async_trait::async_trait;
use subtle::ConstantTimeEq;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use zeroize::ZeroizeOnDrop;

/// Connection being handshaken.
#[derive(Debug, Clone, Copy)]
pub struct HandshakeInfo<'a> {
    /// Remote address
    pub remote_addr: &'a str,
    /// We dialed the connection
    pub outbound: bool,
}

/// Pluggable connection admission check.
#[async_trait]
pub trait Handshake: Send + Sync {
    /// Run the handshake over the connection.
    ///
    /// # Errors
    /// Returns `TransportError::Handshake` to reject the connection.
    async fn handshake(
        &self,
        info: HandshakeInfo<'_>,
        reader: &mut DynReader,
        writer: &mut DynWriter,
    ) -> TransportResult<()>;
}

/// Accepts every connection without exchanging bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct NopHandshake;

#[async_trait]
impl Handshake for NopHandshake {
    async fn handshake(
        &self,
        _info: HandshakeInfo<'_>,
        _reader: &mut DynReader,
        _writer: &mut DynWriter,
    ) -> TransportResult<()> {
        Ok(())
    }
}

const PSK_CONTEXT: &str = "hoard 2024 pre-shared key handshake v1";
const DIALER_LABEL: &[u8] = b"hoard-psk-proof dialer";
const LISTENER_LABEL: &[u8] = b"hoard-psk-proof listener";
const NONCE_SIZE: usize = 16;

/// Mutual proof of a shared secret.
///
/// ```text
/// D → L: nonce_d                               L → D: nonce_l
/// D → L: BLAKE3_k("dialer" ‖ nonce_l ‖ nonce_d)
///                              L → D: BLAKE3_k("listener" ‖ nonce_d ‖ nonce_l)
/// ```
///
/// Both sides write before they read. Each proof is bound to the role of the
/// side that sends it, so a proof can never be replayed back at its author,
/// and a peer echoing our own nonce is rejected. Proofs are compared in
/// constant time.
#[derive(Clone, ZeroizeOnDrop)]
pub struct PresharedKeyHandshake {
    key: [u8; 32],
}

impl PresharedKeyHandshake {
    /// Use a raw 32-byte secret.
    #[must_use]
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Derive the secret from a passphrase.
    #[must_use]
    pub fn from_passphrase(passphrase: &str) -> Self {
        Self {
            key: blake3::derive_key(PSK_CONTEXT, passphrase.as_bytes()),
        }
    }

    fn proof(
        &self,
        dialer: bool,
        challenge: &[u8; NONCE_SIZE],
        own: &[u8; NONCE_SIZE],
    ) -> blake3::Hash {
        let mut hasher = blake3::Hasher::new_keyed(&self.key);
        hasher.update(if dialer { DIALER_LABEL } else { LISTENER_LABEL });
        hasher.update(challenge);
        hasher.update(own);
        hasher.finalize()
    }
}

impl std::fmt::Debug for PresharedKeyHandshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PresharedKeyHandshake(..)")
    }
}

#[async_trait]
impl Handshake for PresharedKeyHandshake {
    async fn handshake(
        &self,
        info: HandshakeInfo<'_>,
        reader: &mut DynReader,
        writer: &mut DynWriter,
    ) -> TransportResult<()> {
        let mut ours = [0u8; NONCE_SIZE];
        getrandom::getrandom(&mut ours)
            .map_err(|e| TransportError::Handshake(format!("nonce generation failed: {e}")))?;

        writer.write_all(&ours).await?;
        writer.flush().await?;
        let mut theirs = [0u8; NONCE_SIZE];
        reader.read_exact(&mut theirs).await?;
        if bool::from(theirs[..].ct_eq(&ours[..])) {
            return Err(TransportError::Handshake(format!(
                "{} echoed our nonce",
                info.remote_addr
            )));
        }

        let proof = self.proof(info.outbound, &theirs, &ours);
        writer.write_all(proof.as_bytes()).await?;
        writer.flush().await?;

        let mut received = [0u8; 32];
        reader.read_exact(&mut received).await?;
        let expected = self.proof(!info.outbound, &ours, &theirs);

        if bool::from(received[..].ct_eq(&expected.as_bytes()[..])) {
            tracing::trace!(remote = info.remote_addr, "pre-shared key verified");
            Ok(())
        } else {
            Err(TransportError::Handshake(format!(
                "pre-shared key mismatch with {}",
                info.remote_addr
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{ReadHalf, WriteHalf, split};

    type Halves = (
        ReadHalf<tokio::io::DuplexStream>,
        WriteHalf<tokio::io::DuplexStream>,
    );

    fn pipe() -> (Halves, Halves) {
        let (a, b) = tokio::io::duplex(1024);
        (split(a), split(b))
    }

    async fn run_pair(
        left: PresharedKeyHandshake,
        right: PresharedKeyHandshake,
    ) -> (TransportResult<()>, TransportResult<()>) {
        let ((mut ar, mut aw), (mut br, mut bw)) = pipe();
        let a = tokio::spawn(async move {
            let info = HandshakeInfo {
                remote_addr: "b",
                outbound: true,
            };
            left.handshake(info, &mut ar, &mut aw).await
        });
        let b = tokio::spawn(async move {
            let info = HandshakeInfo {
                remote_addr: "a",
                outbound: false,
            };
            right.handshake(info, &mut br, &mut bw).await
        });
        (a.await.unwrap(), b.await.unwrap())
    }

    #[tokio::test]
    async fn test_nop_handshake() {
        let ((mut r, mut w), _) = pipe();
        let info = HandshakeInfo {
            remote_addr: "x",
            outbound: false,
        };
        assert!(NopHandshake.handshake(info, &mut r, &mut w).await.is_ok());
    }

    #[tokio::test]
    async fn test_psk_matching_keys() {
        let (a, b) = run_pair(
            PresharedKeyHandshake::from_passphrase("swordfish"),
            PresharedKeyHandshake::from_passphrase("swordfish"),
        )
        .await;
        assert!(a.is_ok());
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_psk_same_role_on_both_ends_fails() {
        // each side expects the other role's proof
        let ((mut ar, mut aw), (mut br, mut bw)) = pipe();
        let left = PresharedKeyHandshake::from_passphrase("swordfish");
        let right = left.clone();
        let a = tokio::spawn(async move {
            let info = HandshakeInfo {
                remote_addr: "b",
                outbound: false,
            };
            left.handshake(info, &mut ar, &mut aw).await
        });
        let info = HandshakeInfo {
            remote_addr: "a",
            outbound: false,
        };
        assert!(right.handshake(info, &mut br, &mut bw).await.is_err());
        assert!(a.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_psk_rejects_reflected_nonce_and_proof() {
        let ((mut ar, mut aw), (mut er, mut ew)) = pipe();
        let listener = tokio::spawn(async move {
            let info = HandshakeInfo {
                remote_addr: "mirror",
                outbound: false,
            };
            PresharedKeyHandshake::from_passphrase("swordfish")
                .handshake(info, &mut ar, &mut aw)
                .await
        });

        // a keyless client mirrors whatever it is sent
        let mut nonce = [0u8; NONCE_SIZE];
        er.read_exact(&mut nonce).await.unwrap();
        ew.write_all(&nonce).await.unwrap();
        let mut proof = [0u8; 32];
        if er.read_exact(&mut proof).await.is_ok() {
            let _ = ew.write_all(&proof).await;
        }
        drop(ew);

        assert!(matches!(
            listener.await.unwrap(),
            Err(TransportError::Handshake(_))
        ));
    }

    #[test]
    fn test_proofs_are_bound_to_role() {
        let psk = PresharedKeyHandshake::new([9u8; 32]);
        let (x, y) = ([1u8; NONCE_SIZE], [2u8; NONCE_SIZE]);
        assert_ne!(psk.proof(true, &x, &y), psk.proof(false, &x, &y));
        assert_ne!(psk.proof(true, &x, &y), psk.proof(true, &y, &x));
    }

    #[tokio::test]
    async fn test_psk_mismatched_keys() {
        let (a, b) = run_pair(
            PresharedKeyHandshake::from_passphrase("swordfish"),
            PresharedKeyHandshake::from_passphrase("marlin"),
        )
        .await;
        assert!(matches!(a, Err(TransportError::Handshake(_))));
        assert!(matches!(b, Err(TransportError::Handshake(_))));
    }
}
