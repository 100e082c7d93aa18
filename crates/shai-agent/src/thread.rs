//! Persisted conversation threads

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use shai_llm::Message;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use thiserror::Error;

/// Longest name produced by [`derive_thread_name`], including the ellipsis
pub const MAX_THREAD_NAME_CHARS: usize = 120;

static DEFAULT_NAME: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"^Thread-\d+$").ok());

/// A named, persisted conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thread {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Thread {
    /// A new empty thread with an auto-generated name
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: default_thread_name(now),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the thread still carries the name it was created with
    pub fn has_default_name(&self) -> bool {
        self.name == default_thread_name(self.created_at)
    }

    /// Whether the first exchange is in and the name was never chosen
    pub fn needs_auto_name(&self) -> bool {
        self.has_default_name() && self.messages.len() >= 2
    }
}

impl Default for Thread {
    fn default() -> Self {
        Self::new()
    }
}

pub fn default_thread_name(now: DateTime<Utc>) -> String {
    format!("Thread-{}", now.timestamp_millis())
}

pub fn is_default_thread_name(name: &str) -> bool {
    DEFAULT_NAME.as_ref().is_some_and(|re| re.is_match(name))
}

/// Name a thread after its first exchange: `"<first user> - <first reply>"`.
///
/// Whitespace is collapsed and the result is capped at
/// [`MAX_THREAD_NAME_CHARS`] characters. Returns `None` when the history
/// has no user message.
pub fn derive_thread_name(messages: &[Message]) -> Option<String> {
    let first_user = messages.iter().find_map(|m| match m {
        Message::User(text) if !text.trim().is_empty() => Some(text.as_str()),
        _ => None,
    })?;
    let first_reply = messages.iter().find_map(|m| match m {
        Message::Assistant(text) if !text.trim().is_empty() => Some(text.as_str()),
        _ => None,
    });

    let raw = match first_reply {
        Some(reply) => format!("{} - {}", first_user, reply),
        None => first_user.to_string(),
    };
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");

    if collapsed.chars().count() <= MAX_THREAD_NAME_CHARS {
        return Some(collapsed);
    }
    let truncated: String = collapsed.chars().take(MAX_THREAD_NAME_CHARS - 3).collect();
    Some(format!("{}...", truncated.trim_end()))
}

/// Thread persistence failures
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Thread not found: {0}")]
    NotFound(String),

    #[error("Thread storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Thread serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("No data directory available for thread storage")]
    NoDataDir,
}

/// Storage for threads.
///
/// Reads of a missing or unreadable thread yield `Ok(None)`. Writers to the
/// same id are not coordinated.
#[async_trait]
pub trait ThreadStore: Send + Sync {
    /// Create and persist a new empty thread
    async fn create_thread(&self) -> Result<Thread, StoreError>;

    async fn get_thread(&self, id: &str) -> Result<Option<Thread>, StoreError>;

    /// Replace a thread's messages
    async fn update_thread(&self, id: &str, messages: Vec<Message>) -> Result<Thread, StoreError>;

    async fn rename_thread(&self, id: &str, name: &str) -> Result<Thread, StoreError>;

    /// All threads, most recently updated first
    async fn list_threads(&self) -> Result<Vec<Thread>, StoreError>;
}

/// Threads kept as one JSON file each in a directory
#[derive(Debug, Clone)]
pub struct FileThreadStore {
    dir: PathBuf,
}

impl FileThreadStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The default threads directory
    pub fn default_dir() -> Option<PathBuf> {
        dirs::data_local_dir().map(|d| d.join("shai").join("threads"))
    }

    /// Store threads in [`default_dir`](Self::default_dir)
    pub fn open_default() -> Result<Self, StoreError> {
        Self::default_dir().map(Self::new).ok_or(StoreError::NoDataDir)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File for a thread id; ids that could escape the directory have none
    fn path_for(&self, id: &str) -> Option<PathBuf> {
        let valid = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        valid.then(|| self.dir.join(format!("{}.json", id)))
    }

    async fn read(&self, path: &Path) -> Option<Thread> {
        let data = match tokio::fs::read_to_string(path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!("Failed to read thread {}: {}", path.display(), e);
                return None;
            }
        };

        match serde_json::from_str(&data) {
            Ok(thread) => Some(thread),
            Err(e) => {
                tracing::warn!("Ignoring corrupt thread {}: {}", path.display(), e);
                None
            }
        }
    }

    async fn write(&self, thread: &Thread) -> Result<(), StoreError> {
        let path = self
            .path_for(&thread.id)
            .ok_or_else(|| StoreError::NotFound(thread.id.clone()))?;
        tokio::fs::create_dir_all(&self.dir).await?;

        let data = serde_json::to_string_pretty(thread)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &path).await?;

        tracing::debug!("Saved thread {} ({} messages)", thread.id, thread.messages.len());
        Ok(())
    }

    async fn load_existing(&self, id: &str) -> Result<Thread, StoreError> {
        match self.get_thread(id).await? {
            Some(thread) => Ok(thread),
            None => Err(StoreError::NotFound(id.to_string())),
        }
    }
}

#[async_trait]
impl ThreadStore for FileThreadStore {
    async fn create_thread(&self) -> Result<Thread, StoreError> {
        let thread = Thread::new();
        self.write(&thread).await?;
        tracing::info!("Created thread {} ({})", thread.id, thread.name);
        Ok(thread)
    }

    async fn get_thread(&self, id: &str) -> Result<Option<Thread>, StoreError> {
        match self.path_for(id) {
            Some(path) => Ok(self.read(&path).await),
            None => Ok(None),
        }
    }

    async fn update_thread(&self, id: &str, messages: Vec<Message>) -> Result<Thread, StoreError> {
        let mut thread = self.load_existing(id).await?;
        thread.messages = messages;
        thread.updated_at = Utc::now();
        self.write(&thread).await?;
        Ok(thread)
    }

    async fn rename_thread(&self, id: &str, name: &str) -> Result<Thread, StoreError> {
        let mut thread = self.load_existing(id).await?;
        thread.name = name.to_string();
        thread.updated_at = Utc::now();
        self.write(&thread).await?;
        Ok(thread)
    }

    async fn list_threads(&self) -> Result<Vec<Thread>, StoreError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut threads = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            if let Some(thread) = self.read(&path).await {
                threads.push(thread);
            }
        }

        threads.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(threads)
    }
}

/// Threads kept in memory for the lifetime of the process
#[derive(Debug, Default)]
pub struct MemoryThreadStore {
    threads: Mutex<HashMap<String, Thread>>,
}

impl MemoryThreadStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a thread as-is
    pub fn insert(&self, thread: Thread) {
        self.threads.lock().insert(thread.id.clone(), thread);
    }

    fn modify(&self, id: &str, f: impl FnOnce(&mut Thread)) -> Result<Thread, StoreError> {
        let mut threads = self.threads.lock();
        let thread = threads
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        f(thread);
        thread.updated_at = Utc::now();
        Ok(thread.clone())
    }
}

#[async_trait]
impl ThreadStore for MemoryThreadStore {
    async fn create_thread(&self) -> Result<Thread, StoreError> {
        let thread = Thread::new();
        self.insert(thread.clone());
        Ok(thread)
    }

    async fn get_thread(&self, id: &str) -> Result<Option<Thread>, StoreError> {
        Ok(self.threads.lock().get(id).cloned())
    }

    async fn update_thread(&self, id: &str, messages: Vec<Message>) -> Result<Thread, StoreError> {
        self.modify(id, |thread| thread.messages = messages)
    }

    async fn rename_thread(&self, id: &str, name: &str) -> Result<Thread, StoreError> {
        self.modify(id, |thread| thread.name = name.to_string())
    }

    async fn list_threads(&self) -> Result<Vec<Thread>, StoreError> {
        let mut threads: Vec<Thread> = self.threads.lock().values().cloned().collect();
        threads.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(threads)
    }
}
