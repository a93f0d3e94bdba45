//! Per-group encrypted message persistence with debounced batched writes
//! (§ message-at-rest store).
//!
//! Grounded on the teacher's `net/encrypted.rs` nonce-prefixed AEAD framing
//! (`nonce || ciphertext || tag`), reused here for at-rest files instead of
//! an in-flight stream, and on the `LateSignatureBuffer` pending-map +
//! coalescing pattern from `net/sync.rs` for the write debounce.

use crate::config::MeshConfig;
use crate::error::StorageError;
use crate::keystore::Keystore;
use crate::types::ChatMessage;
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use tokio::time::{self, Duration};
use tracing::{info, warn};

const FILE_KEY_TAG: &str = "fluxon.store.file_key";
const NONCE_LEN: usize = 12;

struct Inner {
    pending: HashMap<String, Vec<ChatMessage>>,
}

/// Encrypts and persists chat history per group. A single device-wide file
/// key (independent of any group key) is generated on first use and kept in
/// the secure keystore.
pub struct MessageStore {
    data_dir: PathBuf,
    file_key: [u8; 32],
    config: MeshConfig,
    inner: Mutex<Inner>,
}

impl MessageStore {
    pub async fn open(
        data_dir: PathBuf,
        keystore: &dyn Keystore,
        config: MeshConfig,
    ) -> Result<Self, StorageError> {
        let file_key = match keystore.read(FILE_KEY_TAG).await? {
            Some(bytes) if bytes.len() == 32 => bytes.try_into().unwrap(),
            _ => {
                use rand::RngCore;
                let mut key = [0u8; 32];
                rand::rngs::OsRng.fill_bytes(&mut key);
                keystore.write(FILE_KEY_TAG, key.to_vec()).await?;
                key
            }
        };
        fs::create_dir_all(&data_dir).await?;
        Ok(Self {
            data_dir,
            file_key,
            config,
            inner: Mutex::new(Inner { pending: HashMap::new() }),
        })
    }

    fn path_for(&self, group_id: &str) -> PathBuf {
        let sanitized: String = group_id.chars().filter(|c| c.is_ascii_alphanumeric()).collect();
        self.data_dir.join(format!("messages_{sanitized}.bin"))
    }

    /// Buffers `messages` for `group_id`; flushes immediately once
    /// [`MeshConfig::store_flush_threshold`] writes are outstanding.
    pub async fn save(self: &Arc<Self>, group_id: &str, messages: Vec<ChatMessage>) -> Result<(), StorageError> {
        let should_flush_all = {
            let mut inner = self.inner.lock().await;
            inner.pending.insert(group_id.to_string(), messages);
            inner.pending.len() >= self.config.store_flush_threshold
        };
        if should_flush_all {
            self.flush_all().await?;
        }
        Ok(())
    }

    /// Flushes only `group_id`'s pending write, leaving other groups
    /// debounced — required so [`Self::load`] observes our own latest
    /// write without perturbing unrelated groups' batching.
    pub async fn flush_one(&self, group_id: &str) -> Result<(), StorageError> {
        let pending = {
            let mut inner = self.inner.lock().await;
            inner.pending.remove(group_id)
        };
        if let Some(messages) = pending {
            self.write_encrypted(group_id, &messages).await?;
        }
        Ok(())
    }

    pub async fn flush_all(&self) -> Result<(), StorageError> {
        let drained: Vec<(String, Vec<ChatMessage>)> = {
            let mut inner = self.inner.lock().await;
            inner.pending.drain().collect()
        };
        for (group_id, messages) in drained {
            self.write_encrypted(&group_id, &messages).await?;
        }
        Ok(())
    }

    /// Spawns a background task that flushes every [`MeshConfig::store_debounce_window`],
    /// so a lone `save` with no follow-up write still reaches disk instead of
    /// waiting on the write-count threshold or an explicit flush. The
    /// returned handle should be aborted on disposal.
    pub fn spawn_flush_timer(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let store = self.clone();
        let window = store.config.store_debounce_window;
        tokio::spawn(async move {
            let mut ticker = time::interval(window.max(Duration::from_millis(1)));
            loop {
                ticker.tick().await;
                if let Err(e) = store.flush_all().await {
                    warn!(error = %e, "debounce timer flush failed");
                }
            }
        })
    }

    /// Loads a group's history, flushing only that group's pending write
    /// first. Returns an empty list on any read/decrypt/parse failure —
    /// this path never surfaces an error to the caller.
    pub async fn load(&self, group_id: &str) -> Vec<ChatMessage> {
        if let Err(e) = self.flush_one(group_id).await {
            warn!(error = %e, "flush before load failed, reading existing file anyway");
        }

        let path = self.path_for(group_id);
        let Ok(bytes) = fs::read(&path).await else {
            return Vec::new();
        };

        match self.decrypt(&bytes) {
            Ok(plaintext) => serde_json::from_slice(&plaintext).unwrap_or_default(),
            Err(_) => {
                // Legacy unencrypted file: migrate in place if it parses as
                // plaintext JSON, otherwise give up quietly.
                match serde_json::from_slice::<Vec<ChatMessage>>(&bytes) {
                    Ok(messages) => {
                        info!(%group_id, "migrating legacy plaintext store to encrypted format");
                        if let Err(e) = self.write_encrypted(group_id, &messages).await {
                            warn!(error = %e, "failed to re-encrypt migrated store");
                        }
                        messages
                    }
                    Err(_) => Vec::new(),
                }
            }
        }
    }

    pub async fn delete_all(&self, group_id: &str) -> Result<(), StorageError> {
        self.inner.lock().await.pending.remove(group_id);
        let path = self.path_for(group_id);
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    pub async fn delete_message(
        self: &Arc<Self>,
        group_id: &str,
        message_id: &str,
        current: Vec<ChatMessage>,
    ) -> Result<(), StorageError> {
        let remaining: Vec<ChatMessage> = current.into_iter().filter(|m| m.id != message_id).collect();
        self.save(group_id, remaining).await
    }

    /// Cancels outstanding work and synchronously flushes everything.
    /// Idempotent — calling twice is a no-op the second time.
    pub async fn dispose(&self) -> Result<(), StorageError> {
        self.flush_all().await
    }

    async fn write_encrypted(&self, group_id: &str, messages: &[ChatMessage]) -> Result<(), StorageError> {
        let plaintext = serde_json::to_vec(messages)?;
        let blob = self.encrypt(&plaintext);
        let path = self.path_for(group_id);
        let tmp_path = path.with_extension("bin.tmp");
        fs::write(&tmp_path, &blob).await?;
        fs::rename(&tmp_path, &path).await?;
        Ok(())
    }

    fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.file_key));
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = cipher.encrypt(&nonce, plaintext).expect("encryption with a fixed-size key cannot fail");
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        out
    }

    fn decrypt(&self, blob: &[u8]) -> Result<Vec<u8>, ()> {
        if blob.len() < NONCE_LEN {
            return Err(());
        }
        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.file_key));
        cipher.decrypt(Nonce::from_slice(nonce_bytes), ciphertext).map_err(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::MemoryKeystore;
    use crate::types::MessageStatus;
    use std::collections::BTreeSet;

    fn sample(id: &str) -> ChatMessage {
        ChatMessage {
            id: id.into(),
            sender: crate::types::PeerId([1u8; 32]),
            sender_name: "A".into(),
            text: "hello".into(),
            timestamp: 1,
            is_local: false,
            status: MessageStatus::Sent,
            delivered_to: BTreeSet::new(),
            read_by: BTreeSet::new(),
        }
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let ks = MemoryKeystore::new();
        let store = Arc::new(MessageStore::open(dir.path().to_path_buf(), &ks, MeshConfig::default()).await.unwrap());
        store.save("groupA", vec![sample("m1")]).await.unwrap();
        let loaded = store.load("groupA").await;
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, "m1");
    }

    #[tokio::test]
    async fn save_alone_does_not_touch_disk_until_flush() {
        let dir = tempfile::tempdir().unwrap();
        let ks = MemoryKeystore::new();
        let store = Arc::new(MessageStore::open(dir.path().to_path_buf(), &ks, MeshConfig::default()).await.unwrap());
        store.save("groupA", vec![sample("m1")]).await.unwrap();
        assert!(!dir.path().join("messages_groupA.bin").exists());
        store.flush_all().await.unwrap();
        assert!(dir.path().join("messages_groupA.bin").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn debounce_timer_flushes_without_an_explicit_call() {
        let dir = tempfile::tempdir().unwrap();
        let ks = MemoryKeystore::new();
        let config = MeshConfig { store_debounce_window: Duration::from_secs(5), ..MeshConfig::default() };
        let store = Arc::new(MessageStore::open(dir.path().to_path_buf(), &ks, config).await.unwrap());
        let _timer = store.spawn_flush_timer();

        store.save("groupA", vec![sample("m1")]).await.unwrap();
        assert!(!dir.path().join("messages_groupA.bin").exists());

        time::advance(Duration::from_secs(6)).await;
        let path = dir.path().join("messages_groupA.bin");
        for _ in 0..200 {
            if path.exists() {
                break;
            }
            tokio::task::yield_now().await;
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(path.exists());
    }

    #[tokio::test]
    async fn legacy_plaintext_file_is_migrated() {
        let dir = tempfile::tempdir().unwrap();
        let ks = MemoryKeystore::new();
        let store = Arc::new(MessageStore::open(dir.path().to_path_buf(), &ks, MeshConfig::default()).await.unwrap());
        let legacy = serde_json::to_vec(&vec![sample("legacy")]).unwrap();
        fs::write(dir.path().join("messages_groupB.bin"), &legacy).await.unwrap();

        let loaded = store.load("groupB").await;
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, "legacy");

        let on_disk = fs::read(dir.path().join("messages_groupB.bin")).await.unwrap();
        assert_ne!(on_disk, legacy, "file should now be encrypted");
    }
}
