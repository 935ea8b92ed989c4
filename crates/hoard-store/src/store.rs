//! Async on-disk content-addressed store.

use crate::error::{Result, StoreError};
use crate::path::{PathKey, PathTransform, cas_path_transform};
use crate::DEFAULT_ROOT_FOLDER;
use hoard_crypto::{EncryptionKey, decrypt_stream, encrypt_stream};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncWriteExt};

/// Distinguishes temp files of concurrent writers to the same key
static PARTIAL_SEQ: AtomicU64 = AtomicU64::new(0);

/// Store configuration
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Directory all objects live under
    pub root: PathBuf,
    /// Key to path mapping
    pub path_transform: PathTransform,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_ROOT_FOLDER),
            path_transform: cas_path_transform,
        }
    }
}

/// On-disk object store.
///
/// The store holds no in-memory state: every call goes to the filesystem, so
/// clones are cheap and share the same root. Objects are written to a sibling
/// `.partial` file and renamed into place, so readers never observe a
/// half-written object.
#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
    transform: PathTransform,
}

impl Store {
    /// Create a store from configuration. Nothing is touched on disk yet.
    #[must_use]
    pub fn new(config: StoreConfig) -> Self {
        Self {
            root: config.root,
            transform: config.path_transform,
        }
    }

    /// Create a CAS store rooted at `root`.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self::new(StoreConfig {
            root: root.into(),
            ..StoreConfig::default()
        })
    }

    /// Storage root
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Location of `key` relative to the root
    #[must_use]
    pub fn path_key(&self, key: &str) -> PathKey {
        (self.transform)(key)
    }

    /// Absolute location of `key`'s object
    #[must_use]
    pub fn full_path(&self, key: &str) -> PathBuf {
        let pk = self.path_key(key);
        self.root.join(pk.path_name).join(pk.file_name)
    }

    /// Check whether an object is stored under `key`.
    ///
    /// Filesystem errors other than "not found" are logged and reported as
    /// absent.
    pub async fn has(&self, key: &str) -> bool {
        let path = self.full_path(key);
        match fs::metadata(&path).await {
            Ok(meta) => meta.is_file(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => {
                tracing::warn!(key, path = %path.display(), error = %e, "stat failed");
                false
            }
        }
    }

    /// Write the whole of `reader` under `key`, replacing any previous object.
    ///
    /// Returns the number of bytes written.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the reader or the filesystem fails.
    pub async fn write<R>(&self, key: &str, reader: &mut R) -> Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut pending = self.begin(key).await?;
        let copied = tokio::io::copy(reader, &mut pending.file).await;
        let n = pending.finish(copied.map_err(StoreError::from)).await?;
        tracing::debug!(key, bytes = n, "wrote object");
        Ok(n)
    }

    /// Decrypt `reader` with `enc_key` and store the plaintext under `key`.
    ///
    /// Returns the number of plaintext bytes written.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Crypto`] if the ciphertext is malformed or the
    /// stream fails mid-way.
    pub async fn write_decrypted<R>(
        &self,
        key: &str,
        enc_key: &EncryptionKey,
        reader: &mut R,
    ) -> Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut pending = self.begin(key).await?;
        let decrypted = decrypt_stream(enc_key, reader, &mut pending.file).await;
        let n = pending.finish(decrypted.map_err(StoreError::from)).await?;
        tracing::debug!(key, bytes = n, "wrote decrypted object");
        Ok(n)
    }

    /// Encrypt `reader` with `enc_key` and store the ciphertext under `key`.
    ///
    /// Returns the number of bytes written, IV included.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Crypto`] if encryption or I/O fails.
    pub async fn write_encrypted<R>(
        &self,
        key: &str,
        enc_key: &EncryptionKey,
        reader: &mut R,
    ) -> Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut pending = self.begin(key).await?;
        let encrypted = encrypt_stream(enc_key, reader, &mut pending.file).await;
        pending.finish(encrypted.map_err(StoreError::from)).await
    }

    /// Open the object stored under `key`.
    ///
    /// Returns the object size and a handle positioned at its start.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if nothing is stored under `key`.
    pub async fn read(&self, key: &str) -> Result<(u64, File)> {
        let path = self.full_path(key);
        let file = match File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(key.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let size = file.metadata().await?.len();
        Ok((size, file))
    }

    /// Delete `key` by removing its whole top-level shard directory.
    ///
    /// Every other key whose path starts with the same segment is deleted
    /// with it.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if nothing is stored under `key`.
    pub async fn delete(&self, key: &str) -> Result<()> {
        if !self.has(key).await {
            return Err(StoreError::NotFound(key.to_string()));
        }

        let pk = self.path_key(key);
        let shard = self.root.join(pk.first_segment());
        fs::remove_dir_all(&shard).await?;
        tracing::debug!(key, shard = %shard.display(), "deleted object");
        Ok(())
    }

    /// Remove the entire storage root.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the root exists but cannot be removed.
    pub async fn clear(&self) -> Result<()> {
        match fs::remove_dir_all(&self.root).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn begin(&self, key: &str) -> Result<PendingWrite> {
        let pk = self.path_key(key);
        let dir = self.root.join(&pk.path_name);
        fs::create_dir_all(&dir).await?;

        let seq = PARTIAL_SEQ.fetch_add(1, Ordering::Relaxed);
        let target = dir.join(&pk.file_name);
        let partial = dir.join(format!("{}.partial-{seq}", pk.file_name));
        let file = File::create(&partial).await?;

        Ok(PendingWrite {
            file,
            partial,
            target,
        })
    }
}

/// A temp file that becomes the object on success.
struct PendingWrite {
    file: File,
    partial: PathBuf,
    target: PathBuf,
}

impl PendingWrite {
    async fn finish(mut self, outcome: Result<u64>) -> Result<u64> {
        let outcome = match outcome {
            Ok(n) => self.file.flush().await.map(|()| n).map_err(StoreError::from),
            Err(e) => Err(e),
        };
        drop(self.file);

        match outcome {
            Ok(n) => {
                fs::rename(&self.partial, &self.target).await?;
                Ok(n)
            }
            Err(e) => {
                if let Err(rm) = fs::remove_file(&self.partial).await {
                    tracing::debug!(path = %self.partial.display(), error = %rm, "partial cleanup failed");
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::{PathKey, default_path_transform};
    use hoard_crypto::stream::encrypt_to_vec;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    fn temp_store() -> (TempDir, Store) {
        let dir = TempDir::new().unwrap();
        let store = Store::with_root(dir.path().join("store"));
        (dir, store)
    }

    async fn read_all(store: &Store, key: &str) -> Vec<u8> {
        let (size, mut file) = store.read(key).await.unwrap();
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await.unwrap();
        assert_eq!(size, buf.len() as u64);
        buf
    }

    #[tokio::test]
    async fn test_write_read_delete_many_keys() {
        let (_dir, store) = temp_store();

        for i in 0..50 {
            let key = format!("foo_{i}");
            let data = b"some jpg bytes";

            let n = store.write(&key, &mut &data[..]).await.unwrap();
            assert_eq!(n, data.len() as u64);
            assert!(store.has(&key).await);

            assert_eq!(read_all(&store, &key).await, data);

            store.delete(&key).await.unwrap();
            assert!(!store.has(&key).await);
        }
    }

    #[tokio::test]
    async fn test_layout_on_disk() {
        let (_dir, store) = temp_store();
        store.write("HelloWorld", &mut &b"x"[..]).await.unwrap();
        let expected = store
            .root()
            .join("db8ac/1c259/eb89d/4a131/b253b/acfca/5f319/d54f2")
            .join("db8ac1c259eb89d4a131b253bacfca5f319d54f2");
        assert!(expected.is_file());
        assert_eq!(store.full_path("HelloWorld"), expected);
    }

    #[tokio::test]
    async fn test_overwrite_replaces_content() {
        let (_dir, store) = temp_store();
        store.write("k", &mut &b"first version"[..]).await.unwrap();
        store.write("k", &mut &b"second"[..]).await.unwrap();
        assert_eq!(read_all(&store, "k").await, b"second");
    }

    #[tokio::test]
    async fn test_missing_key() {
        let (_dir, store) = temp_store();
        assert!(!store.has("nope").await);
        assert!(store.read("nope").await.unwrap_err().is_not_found());
        assert!(store.delete("nope").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_delete_is_per_top_level_shard() {
        fn by_initial(key: &str) -> PathKey {
            PathKey {
                path_name: format!("{}/{}", &key[..1], key),
                file_name: key.to_string(),
            }
        }

        let dir = TempDir::new().unwrap();
        let store = Store::new(StoreConfig {
            root: dir.path().to_path_buf(),
            path_transform: by_initial,
        });

        store.write("apple", &mut &b"a"[..]).await.unwrap();
        store.write("avocado", &mut &b"b"[..]).await.unwrap();
        store.write("banana", &mut &b"c"[..]).await.unwrap();

        store.delete("apple").await.unwrap();
        assert!(!store.has("apple").await);
        assert!(!store.has("avocado").await);
        assert!(store.has("banana").await);
    }

    #[tokio::test]
    async fn test_default_transform() {
        let dir = TempDir::new().unwrap();
        let store = Store::new(StoreConfig {
            root: dir.path().to_path_buf(),
            path_transform: default_path_transform,
        });
        store.write("plain", &mut &b"data"[..]).await.unwrap();
        assert!(dir.path().join("plain").join("plain").is_file());
    }

    #[tokio::test]
    async fn test_write_decrypted() {
        let (_dir, store) = temp_store();
        let key = EncryptionKey::generate().unwrap();
        let ct = encrypt_to_vec(&key, b"testing").await.unwrap();

        let n = store
            .write_decrypted("secret", &key, &mut ct.as_slice())
            .await
            .unwrap();
        assert_eq!(n, 7);
        assert_eq!(read_all(&store, "secret").await, b"testing");
    }

    #[tokio::test]
    async fn test_write_decrypted_truncated_leaves_nothing() {
        let (_dir, store) = temp_store();
        let key = EncryptionKey::generate().unwrap();

        let err = store
            .write_decrypted("bad", &key, &mut &[1u8, 2, 3][..])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Crypto(_)));
        assert!(!store.has("bad").await);
    }

    #[tokio::test]
    async fn test_write_encrypted_adds_iv() {
        let (_dir, store) = temp_store();
        let key = EncryptionKey::generate().unwrap();
        let n = store
            .write_encrypted("enc", &key, &mut &b"testing"[..])
            .await
            .unwrap();
        assert_eq!(n, 7 + hoard_crypto::IV_SIZE as u64);
        assert_ne!(read_all(&store, "enc").await, b"testing");
    }

    #[tokio::test]
    async fn test_clear() {
        let (_dir, store) = temp_store();
        store.write("a", &mut &b"1"[..]).await.unwrap();
        store.clear().await.unwrap();
        assert!(!store.root().exists());
        // clearing twice is fine
        store.clear().await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_writers_and_readers() {
        let (_dir, store) = temp_store();

        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..32 {
            let store = store.clone();
            tasks.spawn(async move {
                let key = format!("key-{i}");
                let body = format!("payload number {i}");
                store.write(&key, &mut body.as_bytes()).await.unwrap();
                let (size, _) = store.read(&key).await.unwrap();
                assert_eq!(size, body.len() as u64);
            });
        }
        while let Some(res) = tasks.join_next().await {
            res.unwrap();
        }

        for i in 0..32 {
            assert!(store.has(&format!("key-{i}")).await);
        }
    }
}
