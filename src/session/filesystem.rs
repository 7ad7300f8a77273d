//! Durable, cross-process session store. Each context gets a `<name>.json`
//! history file, a `<name>.lock` advisory lock, and a shared `index.json`
//! metadata table. Writes go through a temp file + rename so a reader never
//! observes a partial write — grounded on `fs4`'s async file-lock extension,
//! the crate the pack reaches for when a teacher module has no on-disk
//! locking precedent of its own.

use super::{validate_context_name, Session, SessionMetadata, SessionStore};
use crate::error::{ChatCoreError, Result};
use crate::types::ChatMessage;
use fs4::tokio::AsyncFileExt;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

pub struct FilesystemSessionStore {
    base_dir: PathBuf,
    /// Guards `index.json` read-modify-write against concurrent access
    /// from this process; cross-process safety for the index itself is
    /// best-effort (small, rewritten wholesale, temp-and-rename).
    index_lock: Mutex<()>,
}

impl FilesystemSessionStore {
    pub async fn new(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir).await?;
        Ok(Self {
            base_dir,
            index_lock: Mutex::new(()),
        })
    }

    /// `~/.<app>/contexts/`, the layout's documented default.
    pub async fn default_for_app(app_name: &str) -> Result<Self> {
        let home = dirs::home_dir().ok_or_else(|| {
            ChatCoreError::Configuration("could not resolve the user's home directory".to_string())
        })?;
        Self::new(home.join(format!(".{app_name}")).join("contexts")).await
    }

    fn history_path(&self, name: &str) -> PathBuf {
        self.base_dir.join(format!("{name}.json"))
    }

    fn lock_path(&self, name: &str) -> PathBuf {
        self.base_dir.join(format!("{name}.lock"))
    }

    fn index_path(&self) -> PathBuf {
        self.base_dir.join("index.json")
    }

    async fn read_index(&self) -> Result<HashMap<String, SessionMetadata>> {
        match fs::read(self.index_path()).await {
            Ok(bytes) if !bytes.is_empty() => Ok(serde_json::from_slice(&bytes)?),
            Ok(_) => Ok(HashMap::new()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_index(&self, index: &HashMap<String, SessionMetadata>) -> Result<()> {
        write_atomically(&self.index_path(), &serde_json::to_vec_pretty(index)?).await
    }

    async fn update_index_entry(&self, name: &str, metadata: SessionMetadata) -> Result<()> {
        let _guard = self.index_lock.lock().await;
        let mut index = self.read_index().await?;
        index.insert(name.to_string(), metadata);
        self.write_index(&index).await
    }

    async fn read_history(&self, name: &str) -> Result<Vec<ChatMessage>> {
        match fs::read(self.history_path(name)).await {
            Ok(bytes) if !bytes.is_empty() => Ok(serde_json::from_slice(&bytes)?),
            Ok(_) => Ok(Vec::new()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_history(&self, name: &str, history: &[ChatMessage]) -> Result<()> {
        write_atomically(&self.history_path(name), &serde_json::to_vec_pretty(history)?).await
    }
}

async fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp_path = path.with_extension(format!(
        "{}.tmp",
        path.extension().and_then(|e| e.to_str()).unwrap_or("json")
    ));
    let mut tmp = File::create(&tmp_path).await?;
    tmp.write_all(bytes).await?;
    tmp.flush().await?;
    fs::rename(&tmp_path, path).await?;
    Ok(())
}

async fn open_lock_file(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)
        .await
        .map_err(Into::into)
}

#[async_trait::async_trait]
impl SessionStore for FilesystemSessionStore {
    async fn get(&self, name: &str) -> Result<Box<dyn Session>> {
        validate_context_name(name)?;
        let lock_file = open_lock_file(&self.lock_path(name)).await?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| ChatCoreError::Storage(format!("context \"{name}\" is locked by another process")))?;

        let history = self.read_history(name).await?;
        let mut metadata = self.read_index().await?.remove(name).unwrap_or_default();
        metadata.last_used = Some(chrono::Local::now().to_rfc3339());
        self.update_index_entry(name, metadata.clone()).await?;

        Ok(Box::new(FilesystemSession {
            name: name.to_string(),
            base_dir: self.base_dir.clone(),
            history,
            metadata,
            lock_file: Some(lock_file),
        }))
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        Ok(fs::try_exists(self.history_path(name)).await.unwrap_or(false))
    }

    async fn list(&self) -> Result<Vec<String>> {
        Ok(self.read_index().await?.into_keys().collect())
    }

    async fn get_last(&self) -> Result<Option<String>> {
        let index = self.read_index().await?;
        Ok(index
            .into_iter()
            .max_by_key(|(_, m)| m.last_used.clone())
            .map(|(name, _)| name))
    }

    async fn get_all_metadata(&self) -> Result<HashMap<String, SessionMetadata>> {
        self.read_index().await
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        validate_context_name(name)?;
        let lock_file = open_lock_file(&self.lock_path(name)).await?;
        if lock_file.try_lock_exclusive().is_err() {
            // Held by another open session: skip quietly rather than force it.
            return Ok(false);
        }

        let _ = fs::remove_file(self.history_path(name)).await;
        let _ = fs::remove_file(self.lock_path(name)).await;
        AsyncFileExt::unlock(&lock_file).ok();

        let _guard = self.index_lock.lock().await;
        let mut index = self.read_index().await?;
        index.remove(name);
        self.write_index(&index).await?;
        Ok(true)
    }
}

struct FilesystemSession {
    name: String,
    base_dir: PathBuf,
    history: Vec<ChatMessage>,
    metadata: SessionMetadata,
    lock_file: Option<File>,
}

impl FilesystemSession {
    fn store(&self) -> FilesystemStoreHandle<'_> {
        FilesystemStoreHandle { base_dir: &self.base_dir }
    }
}

/// Thin handle re-deriving file paths without re-locking, used only for the
/// read/write helpers a session needs (the lock is already held).
struct FilesystemStoreHandle<'a> {
    base_dir: &'a Path,
}

impl<'a> FilesystemStoreHandle<'a> {
    async fn write_history(&self, name: &str, history: &[ChatMessage]) -> Result<()> {
        write_atomically(
            &self.base_dir.join(format!("{name}.json")),
            &serde_json::to_vec_pretty(history)?,
        )
        .await
    }
}

#[async_trait::async_trait]
impl Session for FilesystemSession {
    fn get_name(&self) -> &str {
        &self.name
    }

    async fn add_message(&mut self, message: ChatMessage) -> Result<()> {
        self.history.push(message);
        self.store().write_history(&self.name, &self.history).await
    }

    async fn get_history(&self) -> Result<Vec<ChatMessage>> {
        Ok(self.history.clone())
    }

    async fn clear(&mut self) -> Result<()> {
        self.history.clear();
        self.metadata.last_used = Some(chrono::Local::now().to_rfc3339());
        self.store().write_history(&self.name, &self.history).await
    }

    async fn get_metadata(&self) -> Result<SessionMetadata> {
        Ok(self.metadata.clone())
    }

    async fn set_metadata(&mut self, metadata: SessionMetadata) -> Result<()> {
        self.metadata = metadata;
        Ok(())
    }

    async fn update_metadata(&mut self, partial: SessionMetadata) -> Result<()> {
        if partial.model.is_some() {
            self.metadata.model = partial.model;
        }
        if partial.temperature.is_some() {
            self.metadata.temperature = partial.temperature;
        }
        if partial.max_tokens.is_some() {
            self.metadata.max_tokens = partial.max_tokens;
        }
        if partial.system_prompt.is_some() {
            self.metadata.system_prompt = partial.system_prompt;
        }
        if partial.max_history.is_some() {
            self.metadata.max_history = partial.max_history;
        }
        if partial.thinking_effort.is_some() {
            self.metadata.thinking_effort = partial.thinking_effort;
        }
        if partial.tool_timeout_secs.is_some() {
            self.metadata.tool_timeout_secs = partial.tool_timeout_secs;
        }
        if !partial.active_tools.is_empty() {
            self.metadata.active_tools = partial.active_tools;
        }
        self.metadata.extra.extend(partial.extra);
        Ok(())
    }

    async fn close(mut self: Box<Self>) -> Result<()> {
        write_atomically(
            &self.base_dir.join("index.json"),
            &{
                let mut index: HashMap<String, SessionMetadata> =
                    match fs::read(self.base_dir.join("index.json")).await {
                        Ok(bytes) if !bytes.is_empty() => serde_json::from_slice(&bytes)?,
                        _ => HashMap::new(),
                    };
                index.insert(self.name.clone(), self.metadata.clone());
                serde_json::to_vec_pretty(&index)?
            },
        )
        .await?;

        if let Some(lock_file) = self.lock_file.take() {
            AsyncFileExt::unlock(&lock_file).ok();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_history_across_open_close() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemSessionStore::new(dir.path()).await.unwrap();

        let mut session = store.get("alice").await.unwrap();
        session.add_message(ChatMessage::user("hi")).await.unwrap();
        session.close().await.unwrap();

        let session = store.get("alice").await.unwrap();
        let history = session.get_history().await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "hi");
    }

    #[tokio::test]
    async fn get_fails_while_another_handle_holds_the_lock() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemSessionStore::new(dir.path()).await.unwrap();
        let _held = store.get("bob").await.unwrap();

        let second = store.get("bob").await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn delete_skips_quietly_while_locked() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemSessionStore::new(dir.path()).await.unwrap();
        let _held = store.get("carol").await.unwrap();

        let deleted = store.delete("carol").await.unwrap();
        assert!(!deleted);
    }

    #[tokio::test]
    async fn delete_after_close_removes_the_context() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemSessionStore::new(dir.path()).await.unwrap();
        store.get("dave").await.unwrap().close().await.unwrap();

        assert!(store.delete("dave").await.unwrap());
        assert!(!store.exists("dave").await.unwrap());
    }

    #[tokio::test]
    async fn rejects_invalid_context_name() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemSessionStore::new(dir.path()).await.unwrap();
        assert!(store.get("../escape").await.is_err());
    }
}
