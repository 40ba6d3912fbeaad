//! Durable gateway state: the (token identity → project id) cache and the
//! round-robin counter.
//!
//! Backed by a single SQLite file. If the database cannot be opened or the
//! schema cannot be applied, the store degrades to an in-memory map with the
//! same interface; every operation still succeeds, nothing survives a
//! restart. The dispatcher must always be able to run.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use rusqlite::Connection;
use sha2::{Digest, Sha256};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS token_project (
    token_key    TEXT PRIMARY KEY,
    provider     TEXT,
    client_id    TEXT,
    project_id   TEXT NOT NULL,
    last_used_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);
CREATE INDEX IF NOT EXISTS idx_token_project_client ON token_project(client_id);
CREATE INDEX IF NOT EXISTS idx_token_project_last_used ON token_project(last_used_at);

CREATE TABLE IF NOT EXISTS rr_counter (
    provider  TEXT NOT NULL,
    client_id TEXT NOT NULL,
    value     INTEGER NOT NULL,
    PRIMARY KEY (provider, client_id)
);
"#;

/// Stable digest for a credential identity: the cache key survives file
/// renames and reveals nothing about the refresh token.
pub fn token_key(provider: &str, client_id: &str, identity: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(provider.as_bytes());
    hasher.update(b":");
    hasher.update(client_id.as_bytes());
    hasher.update(b":");
    hasher.update(identity.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Default)]
struct MemState {
    projects: HashMap<String, String>,
    counters: HashMap<(String, String), u64>,
}

enum Backend {
    Sqlite(Mutex<Connection>),
    Memory(RwLock<MemState>),
}

/// Thread-safe handle over the state database.
#[derive(Clone)]
pub struct StateStore {
    backend: Arc<Backend>,
}

impl StateStore {
    /// Open (or create) the store at `path`. Never fails: any problem opening
    /// SQLite falls back to a memory-only store with a warning.
    pub fn open(path: &Path) -> Self {
        match Self::try_open_sqlite(path) {
            Ok(conn) => Self {
                backend: Arc::new(Backend::Sqlite(Mutex::new(conn))),
            },
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "sqlite unavailable, falling back to in-memory state"
                );
                Self::open_in_memory()
            }
        }
    }

    /// A memory-only store; used as the fallback and in tests.
    pub fn open_in_memory() -> Self {
        Self {
            backend: Arc::new(Backend::Memory(RwLock::new(MemState::default()))),
        }
    }

    fn try_open_sqlite(path: &Path) -> anyhow::Result<Connection> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                std::fs::create_dir_all(dir)?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
                }
            }
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;
        conn.execute_batch(SCHEMA)?;
        Ok(conn)
    }

    /// Whether state is actually durable (false on the memory fallback).
    pub fn is_durable(&self) -> bool {
        matches!(*self.backend, Backend::Sqlite(_))
    }

    /// Look up the cached project id for `token_key`, touching
    /// `last_used_at` best-effort on a hit.
    pub fn get_project_id(&self, token_key: &str) -> Option<String> {
        match &*self.backend {
            Backend::Memory(mem) => mem
                .read()
                .ok()
                .and_then(|m| m.projects.get(token_key).cloned()),
            Backend::Sqlite(conn) => {
                let conn = conn.lock().ok()?;
                let pid: Option<String> = conn
                    .query_row(
                        "SELECT project_id FROM token_project WHERE token_key = ?1",
                        [token_key],
                        |row| row.get(0),
                    )
                    .ok();
                if pid.is_some() {
                    let _ = conn.execute(
                        "UPDATE token_project SET last_used_at = CURRENT_TIMESTAMP WHERE token_key = ?1",
                        [token_key],
                    );
                }
                pid
            }
        }
    }

    /// Insert or replace the mapping for `token_key`.
    pub fn upsert_project_id(
        &self,
        token_key: &str,
        provider: &str,
        client_id: &str,
        project_id: &str,
    ) -> anyhow::Result<()> {
        match &*self.backend {
            Backend::Memory(mem) => {
                if let Ok(mut m) = mem.write() {
                    m.projects.insert(token_key.to_string(), project_id.to_string());
                }
                Ok(())
            }
            Backend::Sqlite(conn) => {
                let conn = conn.lock().map_err(|_| anyhow::anyhow!("state mutex poisoned"))?;
                conn.execute(
                    "INSERT INTO token_project (token_key, provider, client_id, project_id, last_used_at)
                     VALUES (?1, ?2, ?3, ?4, CURRENT_TIMESTAMP)
                     ON CONFLICT(token_key) DO UPDATE SET
                         project_id = excluded.project_id,
                         last_used_at = excluded.last_used_at",
                    [token_key, provider, client_id, project_id],
                )?;
                Ok(())
            }
        }
    }

    /// The persisted round-robin counter for this deployment, if any.
    pub fn get_rr_counter(&self, provider: &str, client_id: &str) -> Option<u64> {
        match &*self.backend {
            Backend::Memory(mem) => mem
                .read()
                .ok()
                .and_then(|m| m.counters.get(&(provider.to_string(), client_id.to_string())).copied()),
            Backend::Sqlite(conn) => {
                let conn = conn.lock().ok()?;
                conn.query_row(
                    "SELECT value FROM rr_counter WHERE provider = ?1 AND client_id = ?2",
                    [provider, client_id],
                    |row| row.get::<_, i64>(0),
                )
                .ok()
                .map(|v| v as u64)
            }
        }
    }

    /// Persist the round-robin counter; best-effort, callers do not block on
    /// failure.
    pub fn set_rr_counter(&self, provider: &str, client_id: &str, value: u64) -> anyhow::Result<()> {
        match &*self.backend {
            Backend::Memory(mem) => {
                if let Ok(mut m) = mem.write() {
                    m.counters
                        .insert((provider.to_string(), client_id.to_string()), value);
                }
                Ok(())
            }
            Backend::Sqlite(conn) => {
                let conn = conn.lock().map_err(|_| anyhow::anyhow!("state mutex poisoned"))?;
                conn.execute(
                    "INSERT INTO rr_counter (provider, client_id, value) VALUES (?1, ?2, ?3)
                     ON CONFLICT(provider, client_id) DO UPDATE SET value = excluded.value",
                    rusqlite::params![provider, client_id, value as i64],
                )?;
                Ok(())
            }
        }
    }
}
