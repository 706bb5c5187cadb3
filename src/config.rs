use std::time::Duration;

use rusqlite::OpenFlags;
use serde::{Deserialize, Serialize};

use crate::error::{engine_message, AccessError, Result};

/// SQLite connection configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SqliteConfig {
    /// Name of the lane thread; the delivery thread gets a `-delivery` suffix.
    pub lane_name: String,
    /// How long the engine waits on a locked database file, in milliseconds.
    pub busy_timeout_ms: u64,
    pub foreign_keys: bool,
    /// Value for `PRAGMA journal_mode`, left untouched when `None`.
    pub journal_mode: Option<String>,
    pub read_only: bool,
    pub create_if_missing: bool,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            lane_name: "sqlite-lane".to_string(),
            busy_timeout_ms: 5_000,
            foreign_keys: true,
            journal_mode: None,
            read_only: false,
            create_if_missing: true,
        }
    }
}

impl SqliteConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lane_name(mut self, name: impl Into<String>) -> Self {
        self.lane_name = name.into();
        self
    }

    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_foreign_keys(mut self, enabled: bool) -> Self {
        self.foreign_keys = enabled;
        self
    }

    pub fn with_journal_mode(mut self, mode: impl Into<String>) -> Self {
        self.journal_mode = Some(mode.into());
        self
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn with_create_if_missing(mut self, create: bool) -> Self {
        self.create_if_missing = create;
        self
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub(crate) fn open_flags(&self) -> OpenFlags {
        let mut flags = OpenFlags::SQLITE_OPEN_URI | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        if self.read_only {
            flags |= OpenFlags::SQLITE_OPEN_READ_ONLY;
        } else {
            flags |= OpenFlags::SQLITE_OPEN_READ_WRITE;
            if self.create_if_missing {
                flags |= OpenFlags::SQLITE_OPEN_CREATE;
            }
        }
        flags
    }

    /// Apply per-connection pragmas to a freshly opened handle.
    pub(crate) fn apply(&self, conn: &rusqlite::Connection) -> Result<()> {
        let opened = |err: rusqlite::Error| AccessError::ConnectionOpenFailed(engine_message(&err));
        conn.busy_timeout(self.busy_timeout()).map_err(opened)?;
        conn.pragma_update(None, "foreign_keys", self.foreign_keys)
            .map_err(opened)?;
        if let Some(mode) = &self.journal_mode {
            // journal_mode answers with the resulting mode, so it has to be queried.
            conn.pragma_update_and_check(None, "journal_mode", mode, |_| Ok(()))
                .map_err(opened)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_open_read_write_and_create() {
        let flags = SqliteConfig::default().open_flags();
        assert!(flags.contains(OpenFlags::SQLITE_OPEN_READ_WRITE));
        assert!(flags.contains(OpenFlags::SQLITE_OPEN_CREATE));
        assert!(!flags.contains(OpenFlags::SQLITE_OPEN_READ_ONLY));
    }

    #[test]
    fn read_only_never_creates() {
        let flags = SqliteConfig::new().with_read_only(true).open_flags();
        assert!(flags.contains(OpenFlags::SQLITE_OPEN_READ_ONLY));
        assert!(!flags.contains(OpenFlags::SQLITE_OPEN_CREATE));
    }

    #[test]
    fn pragmas_are_applied() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        SqliteConfig::new()
            .with_foreign_keys(true)
            .with_busy_timeout(Duration::from_millis(250))
            .apply(&conn)
            .unwrap();
        let enabled: i64 = conn
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .unwrap();
        assert_eq!(enabled, 1);
    }
}
