//! Conversation sessions for the agent
//!
//! A job carrying a `session_id` resumes that session's message history and
//! saves its new messages back when it finishes successfully. Sessions are
//! JSON files under `<data_dir>/sessions`, or kept in memory when the
//! service runs without a data directory.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::llm::{ChatMessage, Role};

/// Longest accepted session id.
const MAX_SESSION_ID_LEN: usize = 128;

/// A saved conversation session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Conversation history, system prompt excluded
    pub messages: Vec<ChatMessage>,
    /// Jobs that have contributed to this session
    pub jobs: usize,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            created_at: now,
            updated_at: now,
            messages: Vec::new(),
            jobs: 0,
        }
    }

    /// Record one finished job's messages.
    pub fn extend(&mut self, messages: &[ChatMessage]) {
        self.messages.extend(
            messages
                .iter()
                .filter(|m| m.role != Role::System)
                .cloned(),
        );
        self.jobs += 1;
        self.updated_at = Utc::now();
    }
}

/// Session ids become file names, so only `[A-Za-z0-9_.-]` is accepted.
pub fn is_valid_session_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_SESSION_ID_LEN
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

/// Session storage manager
pub struct SessionStore {
    /// Base directory for session files; `None` keeps sessions in memory only
    base_dir: Option<PathBuf>,
    cache: Mutex<HashMap<String, Session>>,
}

impl SessionStore {
    /// Store sessions as JSON files under `base_dir`.
    pub fn open(base_dir: impl Into<PathBuf>) -> io::Result<Self> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir)?;
        Ok(Self {
            base_dir: Some(base_dir),
            cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            base_dir: None,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Load a session, `None` if it has never been saved.
    pub fn load(&self, session_id: &str) -> io::Result<Option<Session>> {
        let cache = self.lock();
        self.load_locked(&cache, session_id)
    }

    /// Prior messages of a session, empty for a new one.
    pub fn history(&self, session_id: &str) -> io::Result<Vec<ChatMessage>> {
        Ok(self
            .load(session_id)?
            .map(|s| s.messages)
            .unwrap_or_default())
    }

    /// Append one job's new messages and persist the session.
    pub fn append(&self, session_id: &str, messages: &[ChatMessage]) -> io::Result<Session> {
        if !is_valid_session_id(session_id) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid session id '{}'", session_id),
            ));
        }
        let mut cache = self.lock();
        let mut session = self
            .load_locked(&cache, session_id)?
            .unwrap_or_else(|| Session::new(session_id));
        session.extend(messages);
        if let Some(dir) = &self.base_dir {
            let json = serde_json::to_string_pretty(&session)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            std::fs::write(session_path(dir, session_id), json)?;
        }
        cache.insert(session_id.to_string(), session.clone());
        Ok(session)
    }

    /// Delete a session; `false` if it did not exist.
    pub fn delete(&self, session_id: &str) -> io::Result<bool> {
        let mut cache = self.lock();
        let cached = cache.remove(session_id).is_some();
        let Some(dir) = &self.base_dir else {
            return Ok(cached);
        };
        if !is_valid_session_id(session_id) {
            return Ok(false);
        }
        match std::fs::remove_file(session_path(dir, session_id)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(cached),
            Err(e) => Err(e),
        }
    }

    fn load_locked(
        &self,
        cache: &HashMap<String, Session>,
        session_id: &str,
    ) -> io::Result<Option<Session>> {
        if let Some(session) = cache.get(session_id) {
            return Ok(Some(session.clone()));
        }
        let Some(dir) = &self.base_dir else {
            return Ok(None);
        };
        if !is_valid_session_id(session_id) {
            return Ok(None);
        }
        let json = match std::fs::read_to_string(session_path(dir, session_id)) {
            Ok(json) => json,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        serde_json::from_str(&json)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Session>> {
        self.cache.lock().unwrap_or_else(|p| p.into_inner())
    }
}

fn session_path(dir: &Path, session_id: &str) -> PathBuf {
    dir.join(format!("{}.json", session_id))
}
