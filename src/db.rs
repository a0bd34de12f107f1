//! Durable persistence: a single `instances` table plus a forward-only
//! migration runner (`SCHEMA_VERSION`, `schema_migrations` table,
//! `run_migrations`/`migrate_vN` sequencing, `query_row(...).optional()`
//! CRUD idiom), per the §6.2 layout.

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension};

use crate::config::InstanceOptions;
use crate::error::Error;
use crate::instance::InstanceStatus;

const SCHEMA_VERSION: i64 = 1;

pub struct Db {
    conn: Mutex<Connection>,
}

/// A row as read back from persistence at startup, before an `Instance`
/// supervisor has been constructed for it.
pub struct InstanceRow {
    pub name: String,
    pub options: InstanceOptions,
    pub status: InstanceStatus,
    pub port: Option<u16>,
    pub restart_count: u32,
}

impl Db {
    pub fn open(path: &Path) -> Result<Self, Error> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::PersistenceError {
                message: format!("failed to create data directory: {e}"),
            })?;
        }
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.run_migrations()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self, Error> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> Result<(), Error> {
        let conn = self.conn.lock();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (version INTEGER PRIMARY KEY);",
        )?;
        let current_version: i64 = conn
            .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |r| {
                r.get(0)
            })?;
        if current_version < 1 {
            migrate_v1(&conn)?;
        }
        if current_version < SCHEMA_VERSION {
            conn.execute(
                "INSERT INTO schema_migrations (version) VALUES (?1)",
                rusqlite::params![SCHEMA_VERSION],
            )?;
        }
        Ok(())
    }

    pub fn create_instance(
        &self,
        name: &str,
        options: &InstanceOptions,
        status: InstanceStatus,
    ) -> Result<(), Error> {
        let options_json = serde_json::to_string(options).map_err(|e| Error::PersistenceError {
            message: e.to_string(),
        })?;
        let now = now_epoch();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO instances (name, backend_type, options_json, status, port, restart_count, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, NULL, 0, ?5, ?5)",
            rusqlite::params![name, options.backend_type.as_str(), options_json, status.to_string(), now],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Error::AlreadyExists { name: name.to_string() }
            }
            other => other.into(),
        })?;
        Ok(())
    }

    pub fn update_status(
        &self,
        name: &str,
        status: InstanceStatus,
        port: Option<u16>,
        restart_count: u32,
    ) -> Result<(), Error> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE instances SET status = ?1, port = ?2, restart_count = ?3, updated_at = ?4 WHERE name = ?5",
            rusqlite::params![status.to_string(), port, restart_count, now_epoch(), name],
        )?;
        Ok(())
    }

    pub fn update_options(&self, name: &str, options: &InstanceOptions) -> Result<(), Error> {
        let options_json = serde_json::to_string(options).map_err(|e| Error::PersistenceError {
            message: e.to_string(),
        })?;
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE instances SET backend_type = ?1, options_json = ?2, updated_at = ?3 WHERE name = ?4",
            rusqlite::params![options.backend_type.as_str(), options_json, now_epoch(), name],
        )?;
        Ok(())
    }

    pub fn delete_instance(&self, name: &str) -> Result<bool, Error> {
        let conn = self.conn.lock();
        let affected = conn.execute("DELETE FROM instances WHERE name = ?1", rusqlite::params![name])?;
        Ok(affected > 0)
    }

    pub fn get_instance(&self, name: &str) -> Result<Option<InstanceRow>, Error> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT name, options_json, status, port, restart_count FROM instances WHERE name = ?1",
            rusqlite::params![name],
            row_to_instance,
        )
        .optional()
        .map_err(Error::from)
    }

    pub fn list_instances(&self) -> Result<Vec<InstanceRow>, Error> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT name, options_json, status, port, restart_count FROM instances ORDER BY name",
        )?;
        let rows = stmt
            .query_map([], row_to_instance)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn row_to_instance(row: &rusqlite::Row<'_>) -> rusqlite::Result<InstanceRow> {
    let name: String = row.get(0)?;
    let options_json: String = row.get(1)?;
    let status_str: String = row.get(2)?;
    let port: Option<u16> = row.get(3)?;
    let restart_count: u32 = row.get(4)?;

    let options: InstanceOptions = serde_json::from_str(&options_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let status = parse_status(&status_str).unwrap_or(InstanceStatus::Stopped);

    Ok(InstanceRow {
        name,
        options,
        status,
        port,
        restart_count,
    })
}

fn parse_status(s: &str) -> Option<InstanceStatus> {
    match s {
        "stopped" => Some(InstanceStatus::Stopped),
        "running" => Some(InstanceStatus::Running),
        "failed" => Some(InstanceStatus::Failed),
        _ => None,
    }
}

fn migrate_v1(conn: &Connection) -> Result<(), Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS instances (
            name TEXT PRIMARY KEY,
            backend_type TEXT NOT NULL,
            options_json TEXT NOT NULL,
            status TEXT NOT NULL,
            port INTEGER,
            restart_count INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_instances_status ON instances (status);
        CREATE INDEX IF NOT EXISTS idx_instances_backend_type ON instances (backend_type);",
    )?;
    Ok(())
}

fn now_epoch() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
