//! Encrypted descriptor store: one face embedding per student.
//!
//! Embeddings are sealed with AES-256-GCM before they touch disk. The key is
//! the SHA-256 of the configured secret, the nonce is fresh per write and
//! stored beside the ciphertext, and the username is bound in as associated
//! data so a row pasted onto another username fails to unseal.

use aes_gcm::aead::{Aead, OsRng, Payload};
use aes_gcm::{AeadCore, Aes256Gcm, Key, KeyInit, Nonce};
use rollcall_core::Embedding;
use rusqlite::{params, OptionalExtension};
use sha2::{Digest, Sha256};
use std::path::Path;
use thiserror::Error;
use tokio_rusqlite::Connection;

const NONCE_LEN: usize = 12;

#[derive(Error, Debug)]
pub enum DescriptorError {
    #[error("descriptor for {0} cannot be unsealed (wrong secret or tampered row)")]
    Unsealable(String),
    #[error("descriptor for {0} cannot be sealed")]
    SealFailed(String),
    #[error("stored descriptor for {0} is corrupt: {1}")]
    Corrupt(String, String),
    #[error("database: {0}")]
    Db(#[from] rusqlite::Error),
    #[error("database connection lost: {0}")]
    Connection(String),
}

impl From<tokio_rusqlite::Error> for DescriptorError {
    fn from(err: tokio_rusqlite::Error) -> Self {
        match err {
            tokio_rusqlite::Error::Rusqlite(e) => DescriptorError::Db(e),
            tokio_rusqlite::Error::Other(e) => match e.downcast::<DescriptorError>() {
                Ok(e) => *e,
                Err(e) => DescriptorError::Connection(e.to_string()),
            },
            other => DescriptorError::Connection(other.to_string()),
        }
    }
}

/// Handle to the descriptor database. Clones share one connection and
/// carry their own copy of the cipher.
#[derive(Clone)]
pub struct DescriptorStore {
    conn: Connection,
    cipher: Aes256Gcm,
}

impl DescriptorStore {
    /// Open (creating if necessary) the descriptor database, deriving the
    /// sealing key from `secret`.
    pub async fn open(path: &Path, secret: &str) -> Result<Self, DescriptorError> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "descriptor database not found, initializing");
        }
        let conn = Connection::open(path).await?;
        Self::init(conn, secret).await
    }

    /// In-memory database for tests.
    pub async fn open_in_memory(secret: &str) -> Result<Self, DescriptorError> {
        let conn = Connection::open_in_memory().await?;
        Self::init(conn, secret).await
    }

    async fn init(conn: Connection, secret: &str) -> Result<Self, DescriptorError> {
        conn.call(|conn| {
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "busy_timeout", 5000)?;
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS descriptors (
                    username      TEXT PRIMARY KEY,
                    dim           INTEGER NOT NULL,
                    model_version TEXT,
                    nonce         BLOB NOT NULL,
                    embedding     BLOB NOT NULL,
                    updated_at    TEXT NOT NULL
                )",
            )?;
            Ok(())
        })
        .await?;
        let key = Sha256::digest(secret.as_bytes());
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        Ok(Self { conn, cipher })
    }

    /// Store a descriptor, fully replacing any previous one.
    pub async fn put(&self, username: &str, embedding: &Embedding) -> Result<(), DescriptorError> {
        let (nonce, ciphertext) = seal(&self.cipher, username, embedding)?;
        let dim = embedding.dim();
        let username_owned = username.to_string();
        let model_version = embedding.model_version.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO descriptors
                     (username, dim, model_version, nonce, embedding, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        username_owned,
                        dim as i64,
                        model_version,
                        nonce,
                        ciphertext,
                        chrono::Utc::now().to_rfc3339(),
                    ],
                )?;
                Ok(())
            })
            .await?;
        tracing::info!(username, dim, "descriptor stored");
        Ok(())
    }

    /// Fetch and unseal a descriptor. `None` means the student has never
    /// enrolled a face (or it was removed).
    pub async fn get(&self, username: &str) -> Result<Option<Embedding>, DescriptorError> {
        let username_owned = username.to_string();
        let row: Option<(i64, Option<String>, Vec<u8>, Vec<u8>)> = self
            .conn
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT dim, model_version, nonce, embedding
                         FROM descriptors WHERE username = ?1",
                        params![username_owned],
                        |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
                    )
                    .optional()?)
            })
            .await?;
        match row {
            Some((dim, model_version, nonce, ciphertext)) => Ok(Some(unseal(
                &self.cipher,
                username,
                dim as usize,
                model_version,
                &nonce,
                &ciphertext,
            )?)),
            None => Ok(None),
        }
    }

    pub async fn contains(&self, username: &str) -> Result<bool, DescriptorError> {
        let username = username.to_string();
        Ok(self
            .conn
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT 1 FROM descriptors WHERE username = ?1",
                        params![username],
                        |r| r.get::<_, i64>(0),
                    )
                    .optional()?
                    .is_some())
            })
            .await?)
    }

    /// Remove a stored descriptor. Returns whether one existed.
    pub async fn remove(&self, username: &str) -> Result<bool, DescriptorError> {
        let username_owned = username.to_string();
        let removed = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "DELETE FROM descriptors WHERE username = ?1",
                    params![username_owned],
                )?;
                Ok(n > 0)
            })
            .await?;
        if removed {
            tracing::info!(username, "descriptor removed");
        }
        Ok(removed)
    }
}

fn seal(
    cipher: &Aes256Gcm,
    username: &str,
    embedding: &Embedding,
) -> Result<(Vec<u8>, Vec<u8>), DescriptorError> {
    let mut plaintext = Vec::with_capacity(embedding.dim() * 4);
    for v in &embedding.values {
        plaintext.extend_from_slice(&v.to_le_bytes());
    }
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(
            &nonce,
            Payload {
                msg: &plaintext,
                aad: username.as_bytes(),
            },
        )
        .map_err(|_| DescriptorError::SealFailed(username.to_string()))?;
    Ok((nonce.to_vec(), ciphertext))
}

fn unseal(
    cipher: &Aes256Gcm,
    username: &str,
    dim: usize,
    model_version: Option<String>,
    nonce: &[u8],
    ciphertext: &[u8],
) -> Result<Embedding, DescriptorError> {
    if nonce.len() != NONCE_LEN {
        return Err(DescriptorError::Corrupt(
            username.to_string(),
            format!("nonce is {} bytes, want {NONCE_LEN}", nonce.len()),
        ));
    }
    let plaintext = cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad: username.as_bytes(),
            },
        )
        .map_err(|_| DescriptorError::Unsealable(username.to_string()))?;
    if plaintext.len() != dim * 4 {
        return Err(DescriptorError::Corrupt(
            username.to_string(),
            format!("payload is {} bytes for dim {dim}", plaintext.len()),
        ));
    }
    let values = plaintext
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    Ok(Embedding {
        values,
        model_version,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn embedding(values: &[f32]) -> Embedding {
        Embedding {
            values: values.to_vec(),
            model_version: Some("w600k_r50".to_string()),
        }
    }

    fn cipher_for(secret: &str) -> Aes256Gcm {
        let key = Sha256::digest(secret.as_bytes());
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key))
    }

    #[tokio::test]
    async fn test_roundtrip_is_bit_exact() {
        let store = DescriptorStore::open_in_memory("secret").await.unwrap();
        let original = embedding(&[0.25, -1.5, 3.125, f32::MIN_POSITIVE]);
        store.put("amy", &original).await.unwrap();

        let loaded = store.get("amy").await.unwrap().unwrap();
        assert_eq!(loaded.values, original.values);
        assert_eq!(loaded.model_version.as_deref(), Some("w600k_r50"));
    }

    #[tokio::test]
    async fn test_missing_descriptor_is_none() {
        let store = DescriptorStore::open_in_memory("secret").await.unwrap();
        assert!(store.get("ghost").await.unwrap().is_none());
        assert!(!store.contains("ghost").await.unwrap());
    }

    #[tokio::test]
    async fn test_put_replaces_previous_descriptor() {
        let store = DescriptorStore::open_in_memory("secret").await.unwrap();
        store.put("amy", &embedding(&[1.0, 2.0])).await.unwrap();
        store.put("amy", &embedding(&[9.0, 8.0])).await.unwrap();

        let loaded = store.get("amy").await.unwrap().unwrap();
        assert_eq!(loaded.values, vec![9.0, 8.0]);
    }

    #[tokio::test]
    async fn test_remove_reports_existence() {
        let store = DescriptorStore::open_in_memory("secret").await.unwrap();
        store.put("amy", &embedding(&[1.0])).await.unwrap();

        assert!(store.remove("amy").await.unwrap());
        assert!(store.get("amy").await.unwrap().is_none());
        assert!(!store.remove("amy").await.unwrap());
    }

    #[test]
    fn test_wrong_secret_fails_to_unseal() {
        let sealed_with = cipher_for("right");
        let (nonce, ciphertext) = seal(&sealed_with, "amy", &embedding(&[1.0, 2.0])).unwrap();

        let opened_with = cipher_for("wrong");
        let err = unseal(&opened_with, "amy", 2, None, &nonce, &ciphertext).unwrap_err();
        assert!(matches!(err, DescriptorError::Unsealable(_)));
    }

    #[test]
    fn test_tampered_ciphertext_fails_to_unseal() {
        let cipher = cipher_for("secret");
        let (nonce, mut ciphertext) = seal(&cipher, "amy", &embedding(&[1.0, 2.0])).unwrap();
        ciphertext[0] ^= 0x01;

        let err = unseal(&cipher, "amy", 2, None, &nonce, &ciphertext).unwrap_err();
        assert!(matches!(err, DescriptorError::Unsealable(_)));
    }

    #[test]
    fn test_row_bound_to_username() {
        let cipher = cipher_for("secret");
        let (nonce, ciphertext) = seal(&cipher, "amy", &embedding(&[1.0, 2.0])).unwrap();

        // The same row presented under another username must not open.
        let err = unseal(&cipher, "bob", 2, None, &nonce, &ciphertext).unwrap_err();
        assert!(matches!(err, DescriptorError::Unsealable(_)));
    }

    #[test]
    fn test_corrupt_dim_detected() {
        let cipher = cipher_for("secret");
        let (nonce, ciphertext) = seal(&cipher, "amy", &embedding(&[1.0, 2.0])).unwrap();

        let err = unseal(&cipher, "amy", 3, None, &nonce, &ciphertext).unwrap_err();
        assert!(matches!(err, DescriptorError::Corrupt(..)));
    }

    #[test]
    fn test_bad_nonce_length_detected() {
        let cipher = cipher_for("secret");
        let (_, ciphertext) = seal(&cipher, "amy", &embedding(&[1.0])).unwrap();

        let err = unseal(&cipher, "amy", 1, None, &[0u8; 8], &ciphertext).unwrap_err();
        assert!(matches!(err, DescriptorError::Corrupt(..)));
    }
}
