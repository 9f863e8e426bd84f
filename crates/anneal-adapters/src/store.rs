//! On-disk state: the durable pending-request table and the error log.
//!
//! The pending table is a single JSON map keyed by request id. Every
//! mutation takes an exclusive advisory lock, reloads the file,
//! applies one change, and rewrites it atomically, so concurrent
//! resolutions of the same request cannot both win and a crash never
//! leaves a half-written table.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use anneal_core::ports::MessageRef;
use anneal_core::request::DurableRequest;

const PENDING_FILE: &str = "pending_requests.json";
const ERROR_LOG_FILE: &str = "error_log.jsonl";
const LOCK_FILE: &str = ".lock";

const LOCK_TIMEOUT_SECS: u64 = 5;
const LOCK_RETRY_MS: u64 = 50;

struct StoreLock {
    file: std::fs::File,
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Durable pending-request table under the state directory.
#[derive(Debug, Clone)]
pub struct PendingStore {
    state_dir: PathBuf,
}

impl PendingStore {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            state_dir: state_dir.to_path_buf(),
        }
    }

    fn pending_path(&self) -> PathBuf {
        self.state_dir.join(PENDING_FILE)
    }

    fn lock(&self) -> anyhow::Result<StoreLock> {
        std::fs::create_dir_all(&self.state_dir)
            .with_context(|| format!("Failed to create {}", self.state_dir.display()))?;

        let lock_path = self.state_dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;

        let start = Instant::now();
        loop {
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => break,
                Err(err) => {
                    if err.kind() != ErrorKind::WouldBlock {
                        return Err(err.into());
                    }
                    if start.elapsed() >= Duration::from_secs(LOCK_TIMEOUT_SECS) {
                        return Err(anyhow::anyhow!(
                            "Timed out waiting for store lock ({}s)",
                            LOCK_TIMEOUT_SECS
                        ));
                    }
                    std::thread::sleep(Duration::from_millis(LOCK_RETRY_MS));
                }
            }
        }

        Ok(StoreLock { file })
    }

    fn load(&self) -> BTreeMap<String, DurableRequest> {
        let path = self.pending_path();
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(_) => return BTreeMap::new(),
        };
        match serde_json::from_str(&content) {
            Ok(map) => map,
            Err(e) => {
                tracing::warn!(error = %e, "pending table unreadable, preserving and starting empty");
                let _ = std::fs::rename(&path, path.with_extension("corrupt"));
                BTreeMap::new()
            }
        }
    }

    fn save(&self, map: &BTreeMap<String, DurableRequest>) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(map)?;
        write_atomic(&self.pending_path(), &content)
    }

    pub fn insert(&self, request: DurableRequest) -> anyhow::Result<()> {
        let _lock = self.lock()?;
        let mut map = self.load();
        map.insert(request.request_id().to_string(), request);
        self.save(&map)
    }

    /// Remove and return the request, if it is still pending. Exactly
    /// one caller gets `Some` for a given id.
    pub fn remove(&self, request_id: &str) -> anyhow::Result<Option<DurableRequest>> {
        let _lock = self.lock()?;
        let mut map = self.load();
        let removed = map.remove(request_id);
        if removed.is_some() {
            self.save(&map)?;
        }
        Ok(removed)
    }

    pub fn get(&self, request_id: &str) -> anyhow::Result<Option<DurableRequest>> {
        let _lock = self.lock()?;
        Ok(self.load().get(request_id).cloned())
    }

    /// Everything still pending, oldest id first.
    pub fn all(&self) -> anyhow::Result<Vec<DurableRequest>> {
        let _lock = self.lock()?;
        Ok(self.load().into_values().collect())
    }

    pub fn set_message_ref(
        &self,
        request_id: &str,
        message_ref: MessageRef,
    ) -> anyhow::Result<bool> {
        let _lock = self.lock()?;
        let mut map = self.load();
        match map.get_mut(request_id) {
            Some(request) => {
                request.set_message_ref(message_ref);
                self.save(&map)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

fn write_atomic(path: &Path, content: &str) -> anyhow::Result<()> {
    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, content)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        let _ = std::fs::set_permissions(&tmp_path, perms);
    }

    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Append-only record of runtime failures and how they ended.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ErrorLogEntry {
    Reported {
        id: String,
        error_type: String,
        error_message: String,
        skill: String,
        action: String,
        context: String,
        at: DateTime<Utc>,
    },
    Resolved {
        id: String,
        resolution: String,
        at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone)]
pub struct ErrorLog {
    path: PathBuf,
}

impl ErrorLog {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join(ERROR_LOG_FILE),
        }
    }

    pub fn append(&self, entry: &ErrorLogEntry) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let line = serde_json::to_string(entry)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", line)?;
        Ok(())
    }

    pub fn entries(&self) -> anyhow::Result<Vec<ErrorLogEntry>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut out = Vec::new();
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(entry) => out.push(entry),
                Err(e) => tracing::warn!(error = %e, "skipping unreadable error log line"),
            }
        }
        Ok(out)
    }
}
