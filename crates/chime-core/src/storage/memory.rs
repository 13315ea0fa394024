//! In-memory alarm store.
//!
//! Clones share the same contents, so a test can hand one clone to the
//! engine and inspect another.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use crate::alarm::{AlarmDefinition, AlarmId, SubAlarmKind};
use crate::collaborators::AlarmStore;
use crate::error::StoreError;

#[derive(Debug, Clone)]
struct Record {
    def: AlarmDefinition,
    archived_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Inner {
    open: bool,
    fail_writes: bool,
    records: BTreeMap<AlarmId, Record>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner.lock().map_err(|_| StoreError::Locked)
    }

    fn lock_open(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        let inner = self.lock()?;
        if !inner.open {
            return Err(StoreError::NotOpen);
        }
        Ok(inner)
    }

    fn lock_writable(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        let inner = self.lock_open()?;
        if inner.fail_writes {
            return Err(StoreError::QueryFailed("store is read-only".into()));
        }
        Ok(inner)
    }

    /// Make every write fail, to exercise store-failure handling.
    pub fn set_fail_writes(&self, fail: bool) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.fail_writes = fail;
        }
    }

    /// Copy of a definition, archived or not.
    pub fn snapshot(&self, id: &AlarmId) -> Option<AlarmDefinition> {
        let inner = self.inner.lock().ok()?;
        inner.records.get(id).map(|r| r.def.clone())
    }

    pub fn is_archived(&self, id: &AlarmId) -> bool {
        self.inner
            .lock()
            .map(|inner| {
                inner
                    .records
                    .get(id)
                    .is_some_and(|r| r.archived_at.is_some())
            })
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|i| i.records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn active(inner: &Inner) -> impl Iterator<Item = &AlarmDefinition> {
    inner
        .records
        .values()
        .filter(|r| r.archived_at.is_none())
        .map(|r| &r.def)
}

impl AlarmStore for MemoryStore {
    fn open(&mut self) -> Result<(), StoreError> {
        self.lock()?.open = true;
        Ok(())
    }

    fn close(&mut self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.open = false;
        }
    }

    fn event(&self, id: &AlarmId) -> Result<Option<AlarmDefinition>, StoreError> {
        let inner = self.lock_open()?;
        Ok(inner
            .records
            .get(id)
            .filter(|r| r.archived_at.is_none())
            .map(|r| r.def.clone()))
    }

    fn find_by_prefix(&self, prefix: &str) -> Result<Vec<AlarmId>, StoreError> {
        let inner = self.lock_open()?;
        Ok(active(&inner)
            .filter(|d| d.id.as_str().starts_with(prefix))
            .map(|d| d.id.clone())
            .collect())
    }

    fn earliest_alarm(
        &self,
        exclude: &HashSet<AlarmId>,
    ) -> Result<Option<AlarmDefinition>, StoreError> {
        let inner = self.lock_open()?;
        Ok(active(&inner)
            .filter(|d| !exclude.contains(&d.id))
            .filter_map(|d| d.next_trigger().map(|t| (t, d)))
            .min_by_key(|(t, _)| *t)
            .map(|(_, d)| d.clone()))
    }

    fn update_event(&mut self, def: &AlarmDefinition) -> Result<(), StoreError> {
        let mut inner = self.lock_writable()?;
        inner.records.insert(
            def.id.clone(),
            Record {
                def: def.clone(),
                archived_at: None,
            },
        );
        Ok(())
    }

    fn delete_event(
        &mut self,
        id: &AlarmId,
        archive: bool,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock_writable()?;
        if archive {
            if let Some(record) = inner.records.get_mut(id) {
                record.archived_at = Some(now);
            }
        } else {
            inner.records.remove(id);
        }
        Ok(())
    }

    fn at_login_alarms(&self) -> Result<Vec<AlarmDefinition>, StoreError> {
        let inner = self.lock_open()?;
        Ok(active(&inner)
            .filter(|d| d.sub_alarm(SubAlarmKind::AtLogin).is_some())
            .cloned()
            .collect())
    }

    fn active_events(&self) -> Result<Vec<AlarmDefinition>, StoreError> {
        let inner = self.lock_open()?;
        let mut defs: Vec<_> = active(&inner).cloned().collect();
        defs.sort_by_key(|d| (d.next_trigger().is_none(), d.next_trigger()));
        Ok(defs)
    }

    fn purge_archived(&mut self, before: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut inner = self.lock_writable()?;
        let count = inner.records.len();
        inner
            .records
            .retain(|_, r| r.archived_at.map_or(true, |at| at >= before));
        Ok(count - inner.records.len())
    }
}
