//! Volatile, per-process session store. Grounded on the teacher's general
//! `Arc<RwLock<HashMap<...>>>` sharing idiom for in-process shared state —
//! no on-disk durability, no cross-process lock, so `get` always succeeds
//! and `delete` never needs to "skip".

use super::{Session, SessionMetadata, SessionStore};
use crate::error::Result;
use crate::types::ChatMessage;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

#[derive(Default, Clone)]
struct Entry {
    history: Vec<ChatMessage>,
    metadata: SessionMetadata,
}

pub struct MemorySessionStore {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get(&self, name: &str) -> Result<Box<dyn Session>> {
        super::validate_context_name(name)?;
        {
            let mut entries = self.entries.write().unwrap();
            let entry = entries.entry(name.to_string()).or_default();
            entry.metadata.last_used = Some(now_iso8601());
        }
        Ok(Box::new(MemorySession {
            name: name.to_string(),
            entries: Arc::clone(&self.entries),
        }))
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.entries.read().unwrap().contains_key(name))
    }

    async fn list(&self) -> Result<Vec<String>> {
        Ok(self.entries.read().unwrap().keys().cloned().collect())
    }

    async fn get_last(&self) -> Result<Option<String>> {
        let entries = self.entries.read().unwrap();
        Ok(entries
            .iter()
            .max_by_key(|(_, e)| e.metadata.last_used.clone())
            .map(|(name, _)| name.clone()))
    }

    async fn get_all_metadata(&self) -> Result<HashMap<String, SessionMetadata>> {
        Ok(self
            .entries
            .read()
            .unwrap()
            .iter()
            .map(|(name, entry)| (name.clone(), entry.metadata.clone()))
            .collect())
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        Ok(self.entries.write().unwrap().remove(name).is_some())
    }
}

struct MemorySession {
    name: String,
    entries: Arc<RwLock<HashMap<String, Entry>>>,
}

#[async_trait]
impl Session for MemorySession {
    fn get_name(&self) -> &str {
        &self.name
    }

    async fn add_message(&mut self, message: ChatMessage) -> Result<()> {
        let mut entries = self.entries.write().unwrap();
        entries.entry(self.name.clone()).or_default().history.push(message);
        Ok(())
    }

    async fn get_history(&self) -> Result<Vec<ChatMessage>> {
        Ok(self
            .entries
            .read()
            .unwrap()
            .get(&self.name)
            .map(|e| e.history.clone())
            .unwrap_or_default())
    }

    async fn clear(&mut self) -> Result<()> {
        let mut entries = self.entries.write().unwrap();
        let entry = entries.entry(self.name.clone()).or_default();
        entry.history.clear();
        entry.metadata.last_used = Some(now_iso8601());
        Ok(())
    }

    async fn get_metadata(&self) -> Result<SessionMetadata> {
        Ok(self
            .entries
            .read()
            .unwrap()
            .get(&self.name)
            .map(|e| e.metadata.clone())
            .unwrap_or_default())
    }

    async fn set_metadata(&mut self, metadata: SessionMetadata) -> Result<()> {
        self.entries.write().unwrap().entry(self.name.clone()).or_default().metadata = metadata;
        Ok(())
    }

    async fn update_metadata(&mut self, partial: SessionMetadata) -> Result<()> {
        let mut entries = self.entries.write().unwrap();
        let metadata = &mut entries.entry(self.name.clone()).or_default().metadata;
        if partial.model.is_some() {
            metadata.model = partial.model;
        }
        if partial.temperature.is_some() {
            metadata.temperature = partial.temperature;
        }
        if partial.max_tokens.is_some() {
            metadata.max_tokens = partial.max_tokens;
        }
        if partial.system_prompt.is_some() {
            metadata.system_prompt = partial.system_prompt;
        }
        if partial.max_history.is_some() {
            metadata.max_history = partial.max_history;
        }
        if partial.thinking_effort.is_some() {
            metadata.thinking_effort = partial.thinking_effort;
        }
        if partial.tool_timeout_secs.is_some() {
            metadata.tool_timeout_secs = partial.tool_timeout_secs;
        }
        if !partial.active_tools.is_empty() {
            metadata.active_tools = partial.active_tools;
        }
        metadata.extra.extend(partial.extra);
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

fn now_iso8601() -> String {
    chrono::Local::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_history_and_metadata() {
        let store = MemorySessionStore::new();
        {
            let mut session = store.get("alice").await.unwrap();
            session.add_message(ChatMessage::user("hi")).await.unwrap();
            session
                .update_metadata(SessionMetadata {
                    system_prompt: Some("S1".to_string()),
                    ..Default::default()
                })
                .await
                .unwrap();
            session.close().await.unwrap();
        }

        let session = store.get("alice").await.unwrap();
        let history = session.get_history().await.unwrap();
        assert_eq!(history.len(), 1);
        let metadata = session.get_metadata().await.unwrap();
        assert_eq!(metadata.system_prompt.as_deref(), Some("S1"));
    }

    #[tokio::test]
    async fn clear_drops_history_but_keeps_metadata() {
        let store = MemorySessionStore::new();
        let mut session = store.get("bob").await.unwrap();
        session.add_message(ChatMessage::user("hi")).await.unwrap();
        session
            .update_metadata(SessionMetadata {
                model: Some("openai/gpt-5".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        session.clear().await.unwrap();

        assert!(session.get_history().await.unwrap().is_empty());
        assert_eq!(session.get_metadata().await.unwrap().model.as_deref(), Some("openai/gpt-5"));
    }

    #[tokio::test]
    async fn delete_and_purge() {
        let store = MemorySessionStore::new();
        store.get("a").await.unwrap().close().await.unwrap();
        store.get("b").await.unwrap().close().await.unwrap();
        assert_eq!(store.list().await.unwrap().len(), 2);
        let deleted = store.purge().await.unwrap();
        assert_eq!(deleted, 2);
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejects_invalid_context_name() {
        let store = MemorySessionStore::new();
        assert!(store.get("a/b").await.is_err());
    }
}
