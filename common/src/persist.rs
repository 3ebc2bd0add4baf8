//! Durable state on top of a flat key-value store.
//!
//! Keys stay within 15 characters so the same layout fits an NVS namespace.
//! Values are JSON-encoded; counts are stored next to their blobs and a
//! mismatch between the two discards the blob.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::admin::{AdminSet, MAX_ADMINS};
use crate::calendar::{CalendarCache, DayRecord, CACHE_CAPACITY};
use crate::clock::Ymd;

pub const KEY_SCHEMA_VERSION: &str = "times_ver";
pub const KEY_DAY_COUNT: &str = "day_count";
pub const KEY_DAY_BLOB: &str = "days_blob";
pub const KEY_ADMIN_COUNT: &str = "adm_count";
pub const KEY_ADMIN_BLOB: &str = "adm_blob";
pub const KEY_LAST_MESSAGE: &str = "tg_last";
pub const KEY_LAST_REFRESH: &str = "last_upd_ymd";

/// Bumped whenever the persisted day-record layout changes.
pub const CALENDAR_SCHEMA_VERSION: u8 = 2;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("stored value for `{key}` is malformed")]
    Codec {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

pub trait KeyValueStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
    fn set(&mut self, key: &str, value: &[u8]) -> Result<(), StoreError>;
    fn remove(&mut self, key: &str) -> Result<(), StoreError>;
}

fn get_json<S, T>(store: &S, key: &str) -> Result<Option<T>, StoreError>
where
    S: KeyValueStore + ?Sized,
    T: DeserializeOwned,
{
    let Some(bytes) = store.get(key)? else {
        return Ok(None);
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| StoreError::Codec {
            key: key.to_string(),
            source,
        })
}

fn set_json<S, T>(store: &mut S, key: &str, value: &T) -> Result<(), StoreError>
where
    S: KeyValueStore + ?Sized,
    T: Serialize + ?Sized,
{
    let bytes = serde_json::to_vec(value).map_err(|source| StoreError::Codec {
        key: key.to_string(),
        source,
    })?;
    store.set(key, &bytes)
}

/// Loads the cache, wiping it when the schema tag does not match. Malformed
/// or inconsistent blobs load as an empty cache.
pub fn load_calendar<S>(store: &mut S) -> Result<CalendarCache, StoreError>
where
    S: KeyValueStore + ?Sized,
{
    let version = get_json::<_, u8>(&*store, KEY_SCHEMA_VERSION).ok().flatten();
    if version != Some(CALENDAR_SCHEMA_VERSION) {
        store.remove(KEY_DAY_COUNT)?;
        store.remove(KEY_DAY_BLOB)?;
        set_json(store, KEY_SCHEMA_VERSION, &CALENDAR_SCHEMA_VERSION)?;
        return Ok(CalendarCache::new());
    }

    let count = get_json::<_, usize>(&*store, KEY_DAY_COUNT)
        .ok()
        .flatten()
        .unwrap_or(0);
    if count == 0 || count > CACHE_CAPACITY {
        return Ok(CalendarCache::new());
    }

    match get_json::<_, Vec<DayRecord>>(&*store, KEY_DAY_BLOB) {
        Ok(Some(days)) if days.len() == count => Ok(CalendarCache::from_records(days)),
        _ => Ok(CalendarCache::new()),
    }
}

pub fn save_calendar<S>(store: &mut S, cache: &CalendarCache, refreshed_on: Option<Ymd>) -> Result<(), StoreError>
where
    S: KeyValueStore + ?Sized,
{
    set_json(store, KEY_SCHEMA_VERSION, &CALENDAR_SCHEMA_VERSION)?;
    set_json(store, KEY_DAY_BLOB, cache.records())?;
    set_json(store, KEY_DAY_COUNT, &cache.len())?;
    if let Some(day) = refreshed_on {
        set_json(store, KEY_LAST_REFRESH, &day)?;
    }
    Ok(())
}

pub fn load_last_refresh<S>(store: &S) -> Result<Option<Ymd>, StoreError>
where
    S: KeyValueStore + ?Sized,
{
    Ok(get_json::<_, Ymd>(store, KEY_LAST_REFRESH).ok().flatten())
}

/// Loads the admin list, or starts over with just the owner when `reset` is
/// set or nothing valid is stored. The repaired list is written back.
pub fn load_admins<S>(store: &mut S, owner: i64, reset: bool) -> Result<AdminSet, StoreError>
where
    S: KeyValueStore + ?Sized,
{
    if reset {
        let admins = AdminSet::new(owner);
        save_admins(store, &admins)?;
        return Ok(admins);
    }

    let count = get_json::<_, usize>(&*store, KEY_ADMIN_COUNT).ok().flatten();
    let stored = get_json::<_, Vec<i64>>(&*store, KEY_ADMIN_BLOB).ok().flatten();
    let admins = match (count, stored.as_deref()) {
        (Some(count), Some(ids)) if count > 0 && count <= MAX_ADMINS && ids.len() == count => {
            AdminSet::from_stored(owner, ids)
        }
        _ => AdminSet::new(owner),
    };

    // Write back whenever the repair changed anything, even at equal length.
    if count != Some(admins.len()) || stored.as_deref() != Some(admins.ids()) {
        save_admins(store, &admins)?;
    }
    Ok(admins)
}

pub fn save_admins<S>(store: &mut S, admins: &AdminSet) -> Result<(), StoreError>
where
    S: KeyValueStore + ?Sized,
{
    set_json(store, KEY_ADMIN_BLOB, admins.ids())?;
    set_json(store, KEY_ADMIN_COUNT, &admins.len())
}

pub fn load_last_message_id<S>(store: &S) -> Result<i64, StoreError>
where
    S: KeyValueStore + ?Sized,
{
    Ok(get_json::<_, i64>(store, KEY_LAST_MESSAGE)
        .ok()
        .flatten()
        .unwrap_or(0))
}

/// Returns whether a write happened.
pub fn save_last_message_id<S>(store: &mut S, id: i64) -> Result<bool, StoreError>
where
    S: KeyValueStore + ?Sized,
{
    if id <= load_last_message_id(&*store)? {
        return Ok(false);
    }
    set_json(store, KEY_LAST_MESSAGE, &id)?;
    Ok(true)
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: HashMap<String, Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.entries.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        self.entries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::fixtures::days_from;
    use pretty_assertions::assert_eq;

    fn filled_cache() -> CalendarCache {
        CalendarCache::from_records(days_from(Ymd::new(2026, 3, 1).unwrap(), 15))
    }

    #[test]
    fn calendar_survives_reload() {
        let mut store = MemoryStore::new();
        let cache = filled_cache();
        let today = Ymd::new(2026, 3, 2);
        save_calendar(&mut store, &cache, today).unwrap();

        assert_eq!(load_calendar(&mut store).unwrap(), cache);
        assert_eq!(load_last_refresh(&store).unwrap(), today);
    }

    #[test]
    fn stale_schema_wipes_cache() {
        let mut store = MemoryStore::new();
        save_calendar(&mut store, &filled_cache(), None).unwrap();
        set_json(&mut store, KEY_SCHEMA_VERSION, &(CALENDAR_SCHEMA_VERSION - 1)).unwrap();

        let cache = load_calendar(&mut store).unwrap();
        assert_eq!(cache.len(), 0);
        assert_eq!(store.get(KEY_DAY_BLOB).unwrap(), None);
        assert_eq!(
            get_json::<_, u8>(&store, KEY_SCHEMA_VERSION).unwrap(),
            Some(CALENDAR_SCHEMA_VERSION)
        );
    }

    #[test]
    fn count_mismatch_discards_blob() {
        let mut store = MemoryStore::new();
        save_calendar(&mut store, &filled_cache(), None).unwrap();
        set_json(&mut store, KEY_DAY_COUNT, &3usize).unwrap();
        assert!(load_calendar(&mut store).unwrap().is_empty());
    }

    #[test]
    fn admins_default_to_owner_and_round_trip() {
        let mut store = MemoryStore::new();
        let mut admins = load_admins(&mut store, 77, false).unwrap();
        assert_eq!(admins.ids(), &[77]);

        admins.add(5).unwrap();
        save_admins(&mut store, &admins).unwrap();
        assert_eq!(load_admins(&mut store, 77, false).unwrap().ids(), &[77, 5]);

        // Reset goes back to owner only and persists it.
        assert_eq!(load_admins(&mut store, 77, true).unwrap().ids(), &[77]);
        assert_eq!(load_admins(&mut store, 77, false).unwrap().ids(), &[77]);
    }

    #[test]
    fn full_list_without_owner_is_repaired_in_place() {
        let mut store = MemoryStore::new();
        let full: Vec<i64> = (1..=MAX_ADMINS as i64).collect();
        set_json(&mut store, KEY_ADMIN_BLOB, &full).unwrap();
        set_json(&mut store, KEY_ADMIN_COUNT, &full.len()).unwrap();

        let admins = load_admins(&mut store, 77, false).unwrap();
        assert_eq!(admins.len(), MAX_ADMINS);
        assert!(admins.contains(77));

        let saved = get_json::<_, Vec<i64>>(&store, KEY_ADMIN_BLOB).unwrap().unwrap();
        assert_eq!(saved.as_slice(), admins.ids());
    }

    #[test]
    fn last_message_id_only_moves_forward() {
        let mut store = MemoryStore::new();
        assert_eq!(load_last_message_id(&store).unwrap(), 0);
        assert!(save_last_message_id(&mut store, 10).unwrap());
        assert!(!save_last_message_id(&mut store, 9).unwrap());
        assert!(!save_last_message_id(&mut store, 10).unwrap());
        assert_eq!(load_last_message_id(&store).unwrap(), 10);
    }
}
