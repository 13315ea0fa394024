//! SQLite-backed alarm store.
//!
//! Each definition is one row: the JSON body plus the columns queries need
//! (next trigger, at-login flag, archive state).

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection};

use super::data_dir;
use crate::alarm::{AlarmDefinition, AlarmId, SubAlarmKind};
use crate::collaborators::AlarmStore;
use crate::error::{ConfigError, StoreError};

/// Sortable text form of a timestamp.
fn sql_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn decode(id: String, body: &str) -> Result<AlarmDefinition, StoreError> {
    serde_json::from_str(body).map_err(|e| StoreError::Corrupt {
        id,
        message: e.to_string(),
    })
}

pub struct SqliteStore {
    /// `None` for an in-memory database.
    path: Option<PathBuf>,
    conn: Option<Connection>,
}

impl SqliteStore {
    /// Store backed by the file at `path`. Nothing is opened yet.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: Some(path.as_ref().to_path_buf()),
            conn: None,
        }
    }

    /// Store at `~/.config/chime/alarms.db`.
    pub fn at_default_path() -> Result<Self, ConfigError> {
        Ok(Self::new(data_dir()?.join("alarms.db")))
    }

    /// In-memory store (for tests). Contents survive `reload` but not `close`.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            conn: None,
        }
    }

    fn conn(&self) -> Result<&Connection, StoreError> {
        self.conn.as_ref().ok_or(StoreError::NotOpen)
    }

    fn migrate(conn: &Connection) -> Result<(), rusqlite::Error> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS alarms (
                id           TEXT PRIMARY KEY,
                body         TEXT NOT NULL,
                next_trigger TEXT,
                at_login     INTEGER NOT NULL DEFAULT 0,
                archived     INTEGER NOT NULL DEFAULT 0,
                archived_at  TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_alarms_next_trigger ON alarms(archived, next_trigger);
            CREATE INDEX IF NOT EXISTS idx_alarms_at_login ON alarms(archived, at_login);",
        )
    }

    fn query_defs(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<AlarmDefinition>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut defs = Vec::new();
        for row in rows {
            let (id, body) = row?;
            defs.push(decode(id, &body)?);
        }
        Ok(defs)
    }
}

impl AlarmStore for SqliteStore {
    fn open(&mut self) -> Result<(), StoreError> {
        if self.conn.is_some() {
            return Ok(());
        }
        let conn = match &self.path {
            Some(path) => Connection::open(path).map_err(|source| StoreError::OpenFailed {
                path: path.clone(),
                source,
            })?,
            None => Connection::open_in_memory().map_err(|source| StoreError::OpenFailed {
                path: PathBuf::from(":memory:"),
                source,
            })?,
        };
        Self::migrate(&conn)?;
        self.conn = Some(conn);
        Ok(())
    }

    fn close(&mut self) {
        self.conn = None;
    }

    fn reload(&mut self) -> Result<(), StoreError> {
        // SQLite reads through to disk; only a missing connection needs work.
        self.open()
    }

    fn event(&self, id: &AlarmId) -> Result<Option<AlarmDefinition>, StoreError> {
        let mut defs = self.query_defs(
            "SELECT id, body FROM alarms WHERE id = ?1 AND archived = 0",
            params![id.as_str()],
        )?;
        Ok(defs.pop())
    }

    fn find_by_prefix(&self, prefix: &str) -> Result<Vec<AlarmId>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id FROM alarms
             WHERE archived = 0 AND substr(id, 1, length(?1)) = ?1
             ORDER BY id",
        )?;
        let rows = stmt.query_map(params![prefix], |row| row.get::<_, String>(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(AlarmId::from(row?));
        }
        Ok(ids)
    }

    fn earliest_alarm(
        &self,
        exclude: &HashSet<AlarmId>,
    ) -> Result<Option<AlarmDefinition>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, body FROM alarms
             WHERE archived = 0 AND next_trigger IS NOT NULL
             ORDER BY next_trigger ASC",
        )?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let id: String = row.get(0)?;
            if exclude.contains(&AlarmId::from(id.as_str())) {
                continue;
            }
            let body: String = row.get(1)?;
            return decode(id, &body).map(Some);
        }
        Ok(None)
    }

    fn update_event(&mut self, def: &AlarmDefinition) -> Result<(), StoreError> {
        let body = serde_json::to_string(def).map_err(|e| StoreError::Corrupt {
            id: def.id.to_string(),
            message: e.to_string(),
        })?;
        self.conn()?.execute(
            "INSERT OR REPLACE INTO alarms (id, body, next_trigger, at_login, archived, archived_at)
             VALUES (?1, ?2, ?3, ?4, 0, NULL)",
            params![
                def.id.as_str(),
                body,
                def.next_trigger().map(sql_time),
                def.sub_alarm(SubAlarmKind::AtLogin).is_some(),
            ],
        )?;
        Ok(())
    }

    fn delete_event(
        &mut self,
        id: &AlarmId,
        archive: bool,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let conn = self.conn()?;
        if archive {
            conn.execute(
                "UPDATE alarms SET archived = 1, archived_at = ?2, next_trigger = NULL, at_login = 0
                 WHERE id = ?1",
                params![id.as_str(), sql_time(now)],
            )?;
        } else {
            conn.execute("DELETE FROM alarms WHERE id = ?1", params![id.as_str()])?;
        }
        Ok(())
    }

    fn at_login_alarms(&self) -> Result<Vec<AlarmDefinition>, StoreError> {
        self.query_defs(
            "SELECT id, body FROM alarms WHERE archived = 0 AND at_login = 1 ORDER BY id",
            [],
        )
    }

    fn active_events(&self) -> Result<Vec<AlarmDefinition>, StoreError> {
        self.query_defs(
            "SELECT id, body FROM alarms
             WHERE archived = 0
             ORDER BY next_trigger IS NULL, next_trigger ASC",
            [],
        )
    }

    fn purge_archived(&mut self, before: DateTime<Utc>) -> Result<usize, StoreError> {
        let removed = self.conn()?.execute(
            "DELETE FROM alarms WHERE archived = 1 AND archived_at < ?1",
            params![sql_time(before)],
        )?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarm::{AlarmAction, AlarmDraft, DraftDefaults};
    use crate::clock::AlarmZone;
    use chrono::{Duration, TimeZone};

    fn def_at(h: u32) -> AlarmDefinition {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, h, 0, 0).unwrap();
        AlarmDraft::new(AlarmAction::Display { text: format!("at {h}") }, t)
            .into_definition(t - Duration::hours(1), AlarmZone::utc(), &DraftDefaults::default())
            .unwrap()
    }

    fn open_memory() -> SqliteStore {
        let mut store = SqliteStore::in_memory();
        store.open().unwrap();
        store
    }

    #[test]
    fn earliest_alarm_orders_by_trigger_and_honours_exclusions() {
        let mut store = open_memory();
        let late = def_at(11);
        let early = def_at(9);
        store.update_event(&late).unwrap();
        store.update_event(&early).unwrap();

        let found = store.earliest_alarm(&HashSet::new()).unwrap().unwrap();
        assert_eq!(found.id, early.id);

        let exclude: HashSet<_> = [early.id.clone()].into_iter().collect();
        let found = store.earliest_alarm(&exclude).unwrap().unwrap();
        assert_eq!(found.id, late.id);
    }

    #[test]
    fn archive_hides_definition_until_purged() {
        let mut store = open_memory();
        let def = def_at(9);
        store.update_event(&def).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        store.delete_event(&def.id, true, now).unwrap();
        assert!(store.event(&def.id).unwrap().is_none());
        assert!(store.active_events().unwrap().is_empty());

        assert_eq!(store.purge_archived(now).unwrap(), 0);
        assert_eq!(store.purge_archived(now + Duration::days(1)).unwrap(), 1);
    }

    #[test]
    fn prefix_lookup_finds_unique_and_shared_prefixes() {
        let mut store = open_memory();
        let mut a = def_at(9);
        a.id = AlarmId::from("abc-1");
        let mut b = def_at(10);
        b.id = AlarmId::from("abd-2");
        store.update_event(&a).unwrap();
        store.update_event(&b).unwrap();
        assert_eq!(store.find_by_prefix("abc").unwrap(), vec![a.id.clone()]);
        assert_eq!(store.find_by_prefix("ab").unwrap().len(), 2);
    }

    #[test]
    fn file_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alarms.db");
        let def = def_at(9);
        {
            let mut store = SqliteStore::new(&path);
            store.open().unwrap();
            store.update_event(&def).unwrap();
            store.close();
        }
        let mut store = SqliteStore::new(&path);
        assert!(matches!(store.event(&def.id), Err(StoreError::NotOpen)));
        store.open().unwrap();
        assert_eq!(store.event(&def.id).unwrap(), Some(def));
    }
}
