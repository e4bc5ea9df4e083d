//! Persistent SQLite store for per-room reply settings.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};
use tracing::info;

use crate::chatbot::collaborators::{RoomPermissions, RoomSettings};
use crate::chatbot::message::{RoomId, UserId};
use crate::error::{CollaboratorError, StorageError};

/// Room settings backed by SQLite. A room without a row is disabled.
pub struct SqliteSettings {
    conn: Mutex<Connection>,
}

impl SqliteSettings {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        let db = Self { conn: Mutex::new(conn) };
        db.init_schema()?;
        info!("Loaded room settings from {:?} ({} rooms)", path, db.room_count()?);
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn: Mutex::new(conn) };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<(), StorageError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS room_settings (
                room_id INTEGER PRIMARY KEY,
                enabled INTEGER NOT NULL DEFAULT 0,
                llm_enabled INTEGER NOT NULL DEFAULT 1,
                proactive_enabled INTEGER NOT NULL DEFAULT 0,
                proactive_whitelist TEXT
            );
        "#,
        )?;
        Ok(())
    }

    pub fn room_count(&self) -> Result<usize, StorageError> {
        let conn = self.conn.lock().unwrap();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM room_settings", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Read a room's settings, `None` if the room was never configured.
    pub fn get(&self, room_id: RoomId) -> Result<Option<RoomPermissions>, StorageError> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT enabled, llm_enabled, proactive_enabled, proactive_whitelist
                 FROM room_settings WHERE room_id = ?1",
                params![room_id],
                |row| {
                    Ok((
                        row.get::<_, bool>(0)?,
                        row.get::<_, bool>(1)?,
                        row.get::<_, bool>(2)?,
                        row.get::<_, Option<String>>(3)?,
                    ))
                },
            )
            .optional()?;

        let Some((enabled, llm_enabled, proactive_enabled, whitelist)) = row else {
            return Ok(None);
        };

        let proactive_whitelist = match whitelist {
            Some(json) => Some(serde_json::from_str::<HashSet<UserId>>(&json)?),
            None => None,
        };

        Ok(Some(RoomPermissions {
            enabled,
            llm_enabled,
            proactive_enabled,
            proactive_whitelist,
        }))
    }

    /// Write all of a room's settings.
    pub fn set(&self, room_id: RoomId, perms: &RoomPermissions) -> Result<(), StorageError> {
        let whitelist = match &perms.proactive_whitelist {
            Some(users) => {
                let mut sorted: Vec<UserId> = users.iter().copied().collect();
                sorted.sort_unstable();
                Some(serde_json::to_string(&sorted)?)
            }
            None => None,
        };

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO room_settings (room_id, enabled, llm_enabled, proactive_enabled, proactive_whitelist)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(room_id) DO UPDATE SET
                enabled = excluded.enabled,
                llm_enabled = excluded.llm_enabled,
                proactive_enabled = excluded.proactive_enabled,
                proactive_whitelist = excluded.proactive_whitelist",
            params![
                room_id,
                perms.enabled,
                perms.llm_enabled,
                perms.proactive_enabled,
                whitelist
            ],
        )?;
        Ok(())
    }

    pub fn set_enabled(&self, room_id: RoomId, enabled: bool) -> Result<(), StorageError> {
        self.update(room_id, |p| p.enabled = enabled)
    }

    pub fn set_llm_enabled(&self, room_id: RoomId, enabled: bool) -> Result<(), StorageError> {
        self.update(room_id, |p| p.llm_enabled = enabled)
    }

    /// Set proactive replies and their whitelist (`None` allows everyone).
    pub fn set_proactive(
        &self,
        room_id: RoomId,
        enabled: bool,
        whitelist: Option<HashSet<UserId>>,
    ) -> Result<(), StorageError> {
        self.update(room_id, |p| {
            p.proactive_enabled = enabled;
            p.proactive_whitelist = whitelist;
        })
    }

    fn update(
        &self,
        room_id: RoomId,
        f: impl FnOnce(&mut RoomPermissions),
    ) -> Result<(), StorageError> {
        let mut perms = self.get(room_id)?.unwrap_or(RoomPermissions {
            enabled: false,
            llm_enabled: true,
            proactive_enabled: false,
            proactive_whitelist: None,
        });
        f(&mut perms);
        self.set(room_id, &perms)
    }
}

#[async_trait]
impl RoomSettings for SqliteSettings {
    async fn permissions(
        &self,
        room_id: RoomId,
    ) -> Result<Option<RoomPermissions>, CollaboratorError> {
        Ok(self.get(room_id)?)
    }
}
