//! Persistent store for the orchestration engine, using redb.
//!
//! # Table design
//!
//! Eight tables hold JSON-encoded records:
//!
//! - `proposals`, `missions`, `steps`, `triggers`, `reactions` — keyed by
//!   the record's 16-byte UUID.
//! - `events` — keyed by a store-assigned `u64` sequence. Key order equals
//!   append order, so consumers track a sequence high-water mark and scan
//!   `seq > mark` without post-sorting.
//! - `action_runs` — 24-byte composite key
//!   `[ timestamp_ms: u64 big-endian | uuid: 16 bytes ]`, so byte order
//!   equals time order and "recent runs" is a reverse range scan.
//! - `policy` — keyed by the policy key string.
//!
//! Every conditional transition (claim, terminal update, gated admission)
//! runs inside a single write transaction. redb admits one writer at a
//! time, which is what makes the claim protocol race-free: the status
//! check and the update commit together or not at all.

mod proposals;
mod reactions;
mod steps;

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, NaiveTime, Utc};
use redb::{Database, ReadableTable, TableDefinition, WriteTransaction};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{ForemanError, Result};
use crate::event::Event;
use crate::heartbeat::ActionRun;
use crate::policy::{self, PolicyEntry};

pub use proposals::Submission;
pub use reactions::{DrainSummary, EvaluationSummary};
pub use steps::MissionDetail;

// ---------------------------------------------------------------------------
// Table definitions
// ---------------------------------------------------------------------------

const PROPOSALS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("proposals");
const MISSIONS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("missions");
const STEPS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("steps");
const TRIGGERS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("triggers");
const REACTIONS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("reactions");
const EVENTS: TableDefinition<u64, &[u8]> = TableDefinition::new("events");
const ACTION_RUNS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("action_runs");
const POLICY: TableDefinition<&str, &[u8]> = TableDefinition::new("policy");

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

pub(crate) fn storage<E: std::fmt::Display>(e: E) -> ForemanError {
    ForemanError::Storage(e.to_string())
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Composite key for time-ordered tables (see module docs).
fn timed_key(ts: DateTime<Utc>, id: Uuid) -> [u8; 24] {
    let mut key = [0u8; 24];
    let ms = ts.timestamp_millis().max(0) as u64;
    key[..8].copy_from_slice(&ms.to_be_bytes());
    key[8..].copy_from_slice(id.as_bytes());
    key
}

/// Start of the current UTC day, the window for daily cap counting.
pub(crate) fn today_start(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive().and_time(NaiveTime::MIN).and_utc()
}

// ---------------------------------------------------------------------------
// Db
// ---------------------------------------------------------------------------

/// Handle to the engine's persistent state. Cheap to share behind an `Arc`;
/// all methods take `&self` and are safe under concurrent callers.
pub struct Db {
    db: Database,
}

impl Db {
    /// Open or create the database at `path`, creating all tables so that
    /// later read transactions never race table creation.
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path).map_err(storage)?;
        let wt = db.begin_write().map_err(storage)?;
        wt.open_table(PROPOSALS).map_err(storage)?;
        wt.open_table(MISSIONS).map_err(storage)?;
        wt.open_table(STEPS).map_err(storage)?;
        wt.open_table(TRIGGERS).map_err(storage)?;
        wt.open_table(REACTIONS).map_err(storage)?;
        wt.open_table(EVENTS).map_err(storage)?;
        wt.open_table(ACTION_RUNS).map_err(storage)?;
        wt.open_table(POLICY).map_err(storage)?;
        wt.commit().map_err(storage)?;
        Ok(Self { db })
    }

    /// Open the database under an instance root (`<root>/.foreman/`).
    pub fn open_at_root(root: &Path) -> Result<Self> {
        let path = crate::paths::db_path(root);
        if !path.exists() {
            return Err(ForemanError::NotInitialized);
        }
        Self::open(&path)
    }

    pub(crate) fn begin_write(&self) -> Result<WriteTransaction> {
        self.db.begin_write().map_err(storage)
    }

    /// Decode every row of a UUID-keyed table.
    fn read_all<T: DeserializeOwned>(&self, def: TableDefinition<&[u8], &[u8]>) -> Result<Vec<T>> {
        let rt = self.db.begin_read().map_err(storage)?;
        let table = rt.open_table(def).map_err(storage)?;
        let mut out = Vec::new();
        for entry in table.iter().map_err(storage)? {
            let (_, v) = entry.map_err(storage)?;
            out.push(decode(v.value())?);
        }
        Ok(out)
    }

    fn read_by_id<T: DeserializeOwned>(
        &self,
        def: TableDefinition<&[u8], &[u8]>,
        id: Uuid,
    ) -> Result<Option<T>> {
        let rt = self.db.begin_read().map_err(storage)?;
        let table = rt.open_table(def).map_err(storage)?;
        match table.get(id.as_bytes().as_slice()).map_err(storage)? {
            Some(v) => Ok(Some(decode(v.value())?)),
            None => Ok(None),
        }
    }

    // -----------------------------------------------------------------------
    // Event log
    // -----------------------------------------------------------------------

    /// Append one event; the sequence is assigned inside the transaction.
    pub fn append_event(&self, kind: &str, source: &str, payload: Value) -> Result<Event> {
        let wt = self.begin_write()?;
        let event = append_event_tx(&wt, kind, source, payload)?;
        wt.commit().map_err(storage)?;
        Ok(event)
    }

    /// Events with `seq > after`, in append order.
    pub fn events_since(&self, after: u64) -> Result<Vec<Event>> {
        let rt = self.db.begin_read().map_err(storage)?;
        let table = rt.open_table(EVENTS).map_err(storage)?;
        let mut out = Vec::new();
        for entry in table.range((after + 1)..).map_err(storage)? {
            let (_, v) = entry.map_err(storage)?;
            out.push(decode(v.value())?);
        }
        Ok(out)
    }

    /// The newest `limit` events, newest first.
    pub fn recent_events(&self, limit: usize) -> Result<Vec<Event>> {
        let rt = self.db.begin_read().map_err(storage)?;
        let table = rt.open_table(EVENTS).map_err(storage)?;
        let mut out = Vec::new();
        for entry in table.iter().map_err(storage)?.rev().take(limit) {
            let (_, v) = entry.map_err(storage)?;
            out.push(decode(v.value())?);
        }
        Ok(out)
    }

    /// Highest assigned event sequence (0 when the log is empty).
    pub fn latest_seq(&self) -> Result<u64> {
        let rt = self.db.begin_read().map_err(storage)?;
        let table = rt.open_table(EVENTS).map_err(storage)?;
        let out = table.last().map_err(storage)?.map(|(k, _)| k.value()).unwrap_or(0);
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // Policy
    // -----------------------------------------------------------------------

    pub fn set_policy(&self, key: &str, value: Value) -> Result<PolicyEntry> {
        let entry = PolicyEntry {
            key: key.to_string(),
            value,
            updated_at: Utc::now(),
        };
        let wt = self.begin_write()?;
        {
            let mut table = wt.open_table(POLICY).map_err(storage)?;
            table
                .insert(key, encode(&entry)?.as_slice())
                .map_err(storage)?;
        }
        wt.commit().map_err(storage)?;
        Ok(entry)
    }

    pub fn policy_value(&self, key: &str) -> Result<Option<Value>> {
        let rt = self.db.begin_read().map_err(storage)?;
        let table = rt.open_table(POLICY).map_err(storage)?;
        match table.get(key).map_err(storage)? {
            Some(v) => {
                let entry: PolicyEntry = decode(v.value())?;
                Ok(Some(entry.value))
            }
            None => Ok(None),
        }
    }

    /// Latest value for `key`, decoded into its typed shape.
    pub fn policy<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.policy_value(key)? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub fn list_policies(&self) -> Result<Vec<PolicyEntry>> {
        let rt = self.db.begin_read().map_err(storage)?;
        let table = rt.open_table(POLICY).map_err(storage)?;
        let mut out = Vec::new();
        for entry in table.iter().map_err(storage)? {
            let (_, v) = entry.map_err(storage)?;
            out.push(decode(v.value())?);
        }
        Ok(out)
    }

    /// Write documented defaults for keys not already present. Returns the
    /// number of keys seeded; existing values are never overwritten.
    pub fn seed_default_policies(&self) -> Result<u32> {
        let mut seeded = 0;
        let wt = self.begin_write()?;
        {
            let mut table = wt.open_table(POLICY).map_err(storage)?;
            for (key, value) in policy::default_policies() {
                if table.get(key.as_str()).map_err(storage)?.is_none() {
                    let entry = PolicyEntry {
                        key: key.clone(),
                        value,
                        updated_at: Utc::now(),
                    };
                    table
                        .insert(key.as_str(), encode(&entry)?.as_slice())
                        .map_err(storage)?;
                    seeded += 1;
                }
            }
        }
        wt.commit().map_err(storage)?;
        Ok(seeded)
    }

    // -----------------------------------------------------------------------
    // Action runs
    // -----------------------------------------------------------------------

    pub fn record_action_run(&self, run: &ActionRun) -> Result<()> {
        let key = timed_key(run.created_at, run.id);
        let wt = self.begin_write()?;
        {
            let mut table = wt.open_table(ACTION_RUNS).map_err(storage)?;
            table
                .insert(key.as_slice(), encode(run)?.as_slice())
                .map_err(storage)?;
        }
        wt.commit().map_err(storage)?;
        Ok(())
    }

    /// The newest `limit` action runs, newest first (reverse key scan).
    pub fn recent_action_runs(&self, limit: usize) -> Result<Vec<ActionRun>> {
        let rt = self.db.begin_read().map_err(storage)?;
        let table = rt.open_table(ACTION_RUNS).map_err(storage)?;
        let mut out = Vec::new();
        for entry in table.iter().map_err(storage)?.rev().take(limit) {
            let (_, v) = entry.map_err(storage)?;
            out.push(decode(v.value())?);
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// In-transaction helpers shared by the operation modules
// ---------------------------------------------------------------------------

/// Append an event inside an open write transaction, so state transitions
/// and the facts recording them commit atomically.
pub(crate) fn append_event_tx(
    wt: &WriteTransaction,
    kind: &str,
    source: &str,
    payload: Value,
) -> Result<Event> {
    let mut table = wt.open_table(EVENTS).map_err(storage)?;
    let seq = table
        .last()
        .map_err(storage)?
        .map(|(k, _)| k.value() + 1)
        .unwrap_or(1);
    let event = Event {
        seq,
        kind: kind.to_string(),
        source: source.to_string(),
        payload,
        created_at: Utc::now(),
    };
    table
        .insert(seq, encode(&event)?.as_slice())
        .map_err(storage)?;
    Ok(event)
}

/// The whole policy table as key → value, read inside the transaction that
/// will use it, so gate decisions and the audit snapshot agree.
pub(crate) fn snapshot_policy_tx(wt: &WriteTransaction) -> Result<BTreeMap<String, Value>> {
    let table = wt.open_table(POLICY).map_err(storage)?;
    let mut snapshot = BTreeMap::new();
    for entry in table.iter().map_err(storage)? {
        let (k, v) = entry.map_err(storage)?;
        let policy: PolicyEntry = decode(v.value())?;
        snapshot.insert(k.value().to_string(), policy.value);
    }
    Ok(snapshot)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::types::RunStatus;
    use tempfile::TempDir;

    pub(crate) fn open_tmp() -> (TempDir, Db) {
        let dir = TempDir::new().unwrap();
        let db = Db::open(&dir.path().join("test.redb")).unwrap();
        (dir, db)
    }

    #[test]
    fn event_sequences_are_monotonic_from_one() {
        let (_dir, db) = open_tmp();
        let first = db
            .append_event("proposal.created", "test", serde_json::json!({}))
            .unwrap();
        let second = db
            .append_event("proposal.approved", "test", serde_json::json!({}))
            .unwrap();
        assert_eq!(first.seq, 1);
        assert_eq!(second.seq, 2);
        assert_eq!(db.latest_seq().unwrap(), 2);
    }

    #[test]
    fn events_since_scans_forward_from_watermark() {
        let (_dir, db) = open_tmp();
        for i in 0..5 {
            db.append_event("tick", "test", serde_json::json!({ "i": i }))
                .unwrap();
        }
        let tail = db.events_since(3).unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].seq, 4);
        assert_eq!(tail[1].seq, 5);
        assert!(db.events_since(5).unwrap().is_empty());
    }

    #[test]
    fn recent_events_newest_first_and_bounded() {
        let (_dir, db) = open_tmp();
        for i in 0..10 {
            db.append_event("tick", "test", serde_json::json!({ "i": i }))
                .unwrap();
        }
        let recent = db.recent_events(3).unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].seq, 10);
        assert_eq!(recent[2].seq, 8);
    }

    #[test]
    fn policy_set_then_get() {
        let (_dir, db) = open_tmp();
        db.set_policy("daily_proposal_cap", serde_json::json!({"max": 5}))
            .unwrap();
        let cap: crate::policy::DailyCapPolicy =
            db.policy("daily_proposal_cap").unwrap().unwrap();
        assert_eq!(cap.max, 5);
        assert!(db
            .policy::<crate::policy::DailyCapPolicy>("missing")
            .unwrap()
            .is_none());
    }

    #[test]
    fn seed_defaults_is_idempotent_and_preserves_overrides() {
        let (_dir, db) = open_tmp();
        db.set_policy("daily_proposal_cap", serde_json::json!({"max": 3}))
            .unwrap();

        let seeded = db.seed_default_policies().unwrap();
        assert!(seeded >= 3);
        assert_eq!(db.seed_default_policies().unwrap(), 0);

        // The pre-existing override is untouched.
        let cap: crate::policy::DailyCapPolicy =
            db.policy("daily_proposal_cap").unwrap().unwrap();
        assert_eq!(cap.max, 3);
    }

    #[test]
    fn action_runs_list_newest_first() {
        let (_dir, db) = open_tmp();
        let early = ActionRun::finished(
            "recoverStaleSteps",
            RunStatus::Ok,
            serde_json::json!({}),
            12,
        );
        std::thread::sleep(std::time::Duration::from_millis(5));
        let late = ActionRun::finished("logHeartbeat", RunStatus::Ok, serde_json::json!({}), 1);
        db.record_action_run(&early).unwrap();
        db.record_action_run(&late).unwrap();

        let runs = db.recent_action_runs(10).unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].action, "logHeartbeat");
        assert_eq!(runs[1].action, "recoverStaleSteps");
    }

    #[test]
    fn open_at_root_requires_init() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            Db::open_at_root(dir.path()),
            Err(ForemanError::NotInitialized)
        ));
    }

    #[test]
    fn today_start_is_utc_midnight() {
        let now = Utc::now();
        let start = today_start(now);
        assert_eq!(start.date_naive(), now.date_naive());
        assert_eq!(start.time(), NaiveTime::MIN);
    }
}
