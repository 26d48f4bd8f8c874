//! Append-only attendance log.
//!
//! Records are never updated or deleted. A correction is a new record whose
//! `amends` points at the root of its chain; the latest record of a chain is
//! the effective one.
//!
//! The ledger is the authority on session state and on who is already
//! recorded: several managers (the daemon and the CLI) may share one file,
//! so [`AttendanceLedger::admit`] and [`AttendanceLedger::close_session`]
//! check and write in one transaction.

use crate::session::{AttendanceRecord, AuditInfo, SessionId, SessionInfo, SessionKey, SessionState};
use chrono::{NaiveDate, NaiveDateTime};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, TransactionBehavior};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// How long a writer waits for another process holding the database lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("corrupt ledger row: {0}")]
    Corrupt(String),
    #[error("session {0} is not in the ledger")]
    MissingSession(SessionId),
}

/// What [`AttendanceLedger::admit`] did with a first record.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Appended,
    /// The identity already has a root record in the session.
    Duplicate(Uuid),
    SessionClosed,
}

/// What [`AttendanceLedger::close_session`] did.
#[derive(Debug, Clone, PartialEq)]
pub enum Closure {
    /// The session was open. These absences were stored.
    Closed(Vec<AttendanceRecord>),
    AlreadyClosed,
}

/// Filter for [`AttendanceLedger::query`]. Dates are session dates, inclusive.
#[derive(Debug, Clone, Default)]
pub struct RecordQuery {
    pub class_id: Option<String>,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub identity: Option<String>,
}

impl RecordQuery {
    fn matches(&self, key: &SessionKey, identity: &str) -> bool {
        self.class_id.as_deref().map_or(true, |c| c == key.class_id)
            && self.from.map_or(true, |d| key.date >= d)
            && self.to.map_or(true, |d| key.date <= d)
            && self.identity.as_deref().map_or(true, |i| i == identity)
    }
}

pub trait AttendanceLedger: Send + Sync {
    /// Store `session` unless its key already has one. Returns the stored
    /// session, which is someone else's if the key was taken.
    fn open_session(&self, session: &SessionInfo) -> Result<SessionInfo, LedgerError>;

    fn session(&self, id: SessionId) -> Result<Option<SessionInfo>, LedgerError>;

    fn sessions(&self) -> Result<Vec<SessionInfo>, LedgerError>;

    /// Append a root record if its session is open and the identity has no
    /// root record there yet.
    fn admit(&self, record: &AttendanceRecord) -> Result<Admission, LedgerError>;

    /// Close an open session at `closed_at`, storing each of `absent` whose
    /// identity has no root record yet.
    fn close_session(
        &self,
        id: SessionId,
        closed_at: NaiveDateTime,
        absent: &[AttendanceRecord],
    ) -> Result<Closure, LedgerError>;

    /// Append records atomically: either all are stored or none.
    fn append(&self, records: &[AttendanceRecord]) -> Result<(), LedgerError>;

    fn record(&self, id: Uuid) -> Result<Option<AttendanceRecord>, LedgerError>;

    /// Every record of a session, amendments included, in append order.
    fn session_records(&self, session: SessionId) -> Result<Vec<AttendanceRecord>, LedgerError>;

    /// Effective records matching `query`, in append order of their roots.
    fn query(&self, query: &RecordQuery) -> Result<Vec<AttendanceRecord>, LedgerError>;

    /// Root record of `id`'s chain followed by its amendments.
    fn history(&self, id: Uuid) -> Result<Vec<AttendanceRecord>, LedgerError>;
}

/// Collapse amendment chains to their latest record.
pub fn effective(records: impl IntoIterator<Item = AttendanceRecord>) -> Vec<AttendanceRecord> {
    let mut out: Vec<AttendanceRecord> = Vec::new();
    let mut slot: HashMap<Uuid, usize> = HashMap::new();
    for record in records {
        match slot.get(&record.root_id()) {
            Some(&i) => out[i] = record,
            None => {
                slot.insert(record.root_id(), out.len());
                out.push(record);
            }
        }
    }
    out
}

// --- in-memory ----------------------------------------------------------------

#[derive(Default)]
struct MemoryInner {
    sessions: HashMap<SessionId, SessionInfo>,
    records: Vec<AttendanceRecord>,
}

impl MemoryInner {
    fn root_of(&self, session: SessionId, identity: &str) -> Option<Uuid> {
        self.records
            .iter()
            .find(|r| r.session_id == session && r.amends.is_none() && r.identity == identity)
            .map(|r| r.id)
    }

    fn state(&self, id: SessionId) -> Result<SessionState, LedgerError> {
        self.sessions
            .get(&id)
            .map(|s| s.state)
            .ok_or(LedgerError::MissingSession(id))
    }
}

/// Ledger kept in process memory. Used in tests and by embedders that
/// persist records themselves.
#[derive(Default)]
pub struct MemoryLedger {
    inner: Mutex<MemoryInner>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of stored records, amendments included.
    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AttendanceLedger for MemoryLedger {
    fn open_session(&self, session: &SessionInfo) -> Result<SessionInfo, LedgerError> {
        let mut inner = self.lock();
        if let Some(existing) = inner.sessions.values().find(|s| s.key == session.key) {
            return Ok(existing.clone());
        }
        inner.sessions.insert(session.id, session.clone());
        Ok(session.clone())
    }

    fn session(&self, id: SessionId) -> Result<Option<SessionInfo>, LedgerError> {
        Ok(self.lock().sessions.get(&id).cloned())
    }

    fn sessions(&self) -> Result<Vec<SessionInfo>, LedgerError> {
        let mut all: Vec<_> = self.lock().sessions.values().cloned().collect();
        all.sort_by_key(|s| s.opened_at);
        Ok(all)
    }

    fn admit(&self, record: &AttendanceRecord) -> Result<Admission, LedgerError> {
        let mut inner = self.lock();
        if inner.state(record.session_id)? == SessionState::Closed {
            return Ok(Admission::SessionClosed);
        }
        if let Some(id) = inner.root_of(record.session_id, &record.identity) {
            return Ok(Admission::Duplicate(id));
        }
        inner.records.push(record.clone());
        Ok(Admission::Appended)
    }

    fn close_session(
        &self,
        id: SessionId,
        closed_at: NaiveDateTime,
        absent: &[AttendanceRecord],
    ) -> Result<Closure, LedgerError> {
        let mut inner = self.lock();
        if inner.state(id)? == SessionState::Closed {
            return Ok(Closure::AlreadyClosed);
        }
        let stored: Vec<AttendanceRecord> = absent
            .iter()
            .filter(|r| inner.root_of(id, &r.identity).is_none())
            .cloned()
            .collect();
        inner.records.extend(stored.iter().cloned());
        if let Some(session) = inner.sessions.get_mut(&id) {
            session.state = SessionState::Closed;
            session.closed_at = Some(closed_at);
        }
        Ok(Closure::Closed(stored))
    }

    fn append(&self, records: &[AttendanceRecord]) -> Result<(), LedgerError> {
        self.lock().records.extend_from_slice(records);
        Ok(())
    }

    fn record(&self, id: Uuid) -> Result<Option<AttendanceRecord>, LedgerError> {
        Ok(self.lock().records.iter().find(|r| r.id == id).cloned())
    }

    fn session_records(&self, session: SessionId) -> Result<Vec<AttendanceRecord>, LedgerError> {
        Ok(self
            .lock()
            .records
            .iter()
            .filter(|r| r.session_id == session)
            .cloned()
            .collect())
    }

    fn query(&self, query: &RecordQuery) -> Result<Vec<AttendanceRecord>, LedgerError> {
        let inner = self.lock();
        let matching = inner.records.iter().filter(|r| {
            inner
                .sessions
                .get(&r.session_id)
                .is_some_and(|s| query.matches(&s.key, &r.identity))
        });
        Ok(effective(matching.cloned()))
    }

    fn history(&self, id: Uuid) -> Result<Vec<AttendanceRecord>, LedgerError> {
        let inner = self.lock();
        let Some(root) = inner.records.iter().find(|r| r.id == id).map(|r| r.root_id()) else {
            return Ok(Vec::new());
        };
        Ok(inner.records.iter().filter(|r| r.root_id() == root).cloned().collect())
    }
}

// --- sqlite -------------------------------------------------------------------

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sessions (
    id          TEXT PRIMARY KEY,
    class_id    TEXT NOT NULL,
    date        TEXT NOT NULL,
    slot        TEXT NOT NULL,
    state       TEXT NOT NULL,
    opened_at   TEXT NOT NULL,
    slot_start  TEXT NOT NULL,
    deadline    TEXT NOT NULL,
    closed_at   TEXT,
    UNIQUE (class_id, date, slot)
);
CREATE TABLE IF NOT EXISTS records (
    seq                 INTEGER PRIMARY KEY AUTOINCREMENT,
    id                  TEXT NOT NULL UNIQUE,
    session_id          TEXT NOT NULL REFERENCES sessions(id),
    identity            TEXT NOT NULL,
    timestamp           TEXT NOT NULL,
    confidence          REAL,
    status              TEXT NOT NULL,
    snapshot_reference  TEXT,
    source              TEXT NOT NULL,
    amends              TEXT,
    actor               TEXT,
    reason              TEXT
);
CREATE INDEX IF NOT EXISTS records_session ON records(session_id);
CREATE INDEX IF NOT EXISTS records_identity ON records(identity);
CREATE UNIQUE INDEX IF NOT EXISTS records_one_root_per_identity
    ON records(session_id, identity) WHERE amends IS NULL;
";

const SESSION_COLUMNS: &str = "id, class_id, date, slot, state, opened_at, slot_start, deadline, closed_at";

const RECORD_COLUMNS: &str = "r.id, r.session_id, r.identity, r.timestamp, r.confidence, r.status, \
     r.snapshot_reference, r.source, r.amends, r.actor, r.reason";

/// SQLite-backed ledger. One connection guarded by a mutex; other
/// processes may hold their own connections to the same file.
pub struct SqliteLedger {
    conn: Mutex<Connection>,
}

impl SqliteLedger {
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, LedgerError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, LedgerError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn select(&self, filter: &str, args: Vec<String>) -> Result<Vec<AttendanceRecord>, LedgerError> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM records r JOIN sessions s ON s.id = r.session_id \
             WHERE {filter} ORDER BY r.seq"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args), read_record)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row??);
        }
        Ok(out)
    }
}

fn parse<T: std::str::FromStr>(raw: String, what: &str) -> Result<T, LedgerError> {
    raw.parse()
        .map_err(|_| LedgerError::Corrupt(format!("{what} '{raw}'")))
}

fn parse_uuid(raw: String) -> Result<Uuid, LedgerError> {
    Uuid::parse_str(&raw).map_err(|e| LedgerError::Corrupt(format!("uuid '{raw}': {e}")))
}

/// Row → record; inner errors are column decoding problems.
fn read_record(row: &Row<'_>) -> rusqlite::Result<Result<AttendanceRecord, LedgerError>> {
    let id: String = row.get(0)?;
    let session_id: String = row.get(1)?;
    let status: String = row.get(5)?;
    let source: String = row.get(7)?;
    let amends: Option<String> = row.get(8)?;
    let actor: Option<String> = row.get(9)?;
    let reason: Option<String> = row.get(10)?;
    let identity: String = row.get(2)?;
    let timestamp = row.get(3)?;
    let confidence: Option<f64> = row.get(4)?;
    let snapshot_reference = row.get(6)?;

    Ok((|| -> Result<AttendanceRecord, LedgerError> {
        Ok(AttendanceRecord {
            id: parse_uuid(id)?,
            session_id: SessionId(parse_uuid(session_id)?),
            identity,
            timestamp,
            confidence: confidence.map(|c| c as f32),
            status: parse(status, "status")?,
            snapshot_reference,
            source: parse(source, "source")?,
            amends: amends.map(parse_uuid).transpose()?,
            audit: match (actor, reason) {
                (Some(actor), reason) => Some(AuditInfo {
                    actor,
                    reason: reason.unwrap_or_default(),
                }),
                (None, _) => None,
            },
        })
    })())
}

fn read_session(row: &Row<'_>) -> rusqlite::Result<Result<SessionInfo, LedgerError>> {
    let id: String = row.get(0)?;
    let class_id: String = row.get(1)?;
    let date = row.get(2)?;
    let slot: String = row.get(3)?;
    let state: String = row.get(4)?;
    let opened_at = row.get(5)?;
    let slot_start = row.get(6)?;
    let deadline = row.get(7)?;
    let closed_at = row.get(8)?;

    Ok((|| -> Result<SessionInfo, LedgerError> {
        Ok(SessionInfo {
            id: SessionId(parse_uuid(id)?),
            key: SessionKey {
                class_id,
                date,
                slot: parse(slot, "slot")?,
            },
            state: parse(state, "state")?,
            opened_at,
            slot_start,
            deadline,
            closed_at,
        })
    })())
}

fn insert_record(conn: &Connection, r: &AttendanceRecord) -> Result<(), LedgerError> {
    conn.execute(
        "INSERT INTO records (id, session_id, identity, timestamp, confidence, status,
                              snapshot_reference, source, amends, actor, reason)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            r.id.to_string(),
            r.session_id.to_string(),
            r.identity,
            r.timestamp,
            r.confidence.map(f64::from),
            r.status.as_str(),
            r.snapshot_reference,
            r.source.as_str(),
            r.amends.map(|u| u.to_string()),
            r.audit.as_ref().map(|a| a.actor.as_str()),
            r.audit.as_ref().map(|a| a.reason.as_str()),
        ],
    )?;
    Ok(())
}

fn session_state(conn: &Connection, id: SessionId) -> Result<SessionState, LedgerError> {
    let raw: Option<String> = conn
        .query_row("SELECT state FROM sessions WHERE id = ?1", [id.to_string()], |row| row.get(0))
        .optional()?;
    parse(raw.ok_or(LedgerError::MissingSession(id))?, "state")
}

fn root_of(conn: &Connection, session: SessionId, identity: &str) -> Result<Option<Uuid>, LedgerError> {
    conn.query_row(
        "SELECT id FROM records WHERE session_id = ?1 AND identity = ?2 AND amends IS NULL",
        params![session.to_string(), identity],
        |row| row.get::<_, String>(0),
    )
    .optional()?
    .map(parse_uuid)
    .transpose()
}

impl AttendanceLedger for SqliteLedger {
    fn open_session(&self, s: &SessionInfo) -> Result<SessionInfo, LedgerError> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT INTO sessions (id, class_id, date, slot, state, opened_at, slot_start, deadline, closed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(class_id, date, slot) DO NOTHING",
            params![
                s.id.to_string(),
                s.key.class_id,
                s.key.date,
                s.key.slot.as_str(),
                s.state.as_str(),
                s.opened_at,
                s.slot_start,
                s.deadline,
                s.closed_at,
            ],
        )?;
        let stored = tx.query_row(
            &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE class_id = ?1 AND date = ?2 AND slot = ?3"),
            params![s.key.class_id, s.key.date, s.key.slot.as_str()],
            read_session,
        )??;
        tx.commit()?;
        Ok(stored)
    }

    fn session(&self, id: SessionId) -> Result<Option<SessionInfo>, LedgerError> {
        let conn = self.conn();
        conn.query_row(
            &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"),
            [id.to_string()],
            read_session,
        )
        .optional()?
        .transpose()
    }

    fn sessions(&self) -> Result<Vec<SessionInfo>, LedgerError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!("SELECT {SESSION_COLUMNS} FROM sessions ORDER BY opened_at"))?;
        let rows = stmt.query_map([], read_session)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row??);
        }
        Ok(out)
    }

    fn admit(&self, record: &AttendanceRecord) -> Result<Admission, LedgerError> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if session_state(&tx, record.session_id)? == SessionState::Closed {
            return Ok(Admission::SessionClosed);
        }
        if let Some(id) = root_of(&tx, record.session_id, &record.identity)? {
            return Ok(Admission::Duplicate(id));
        }
        insert_record(&tx, record)?;
        tx.commit()?;
        Ok(Admission::Appended)
    }

    fn close_session(
        &self,
        id: SessionId,
        closed_at: NaiveDateTime,
        absent: &[AttendanceRecord],
    ) -> Result<Closure, LedgerError> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if session_state(&tx, id)? == SessionState::Closed {
            return Ok(Closure::AlreadyClosed);
        }
        let mut stored = Vec::new();
        for record in absent {
            if root_of(&tx, id, &record.identity)?.is_none() {
                insert_record(&tx, record)?;
                stored.push(record.clone());
            }
        }
        tx.execute(
            "UPDATE sessions SET state = ?2, closed_at = ?3 WHERE id = ?1",
            params![id.to_string(), SessionState::Closed.as_str(), closed_at],
        )?;
        tx.commit()?;
        Ok(Closure::Closed(stored))
    }

    fn append(&self, records: &[AttendanceRecord]) -> Result<(), LedgerError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        for r in records {
            insert_record(&tx, r)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn record(&self, id: Uuid) -> Result<Option<AttendanceRecord>, LedgerError> {
        let conn = self.conn();
        let sql = format!("SELECT {RECORD_COLUMNS} FROM records r WHERE r.id = ?1");
        conn.query_row(&sql, [id.to_string()], read_record)
            .optional()?
            .transpose()
    }

    fn session_records(&self, session: SessionId) -> Result<Vec<AttendanceRecord>, LedgerError> {
        self.select("r.session_id = ?1", vec![session.to_string()])
    }

    fn query(&self, query: &RecordQuery) -> Result<Vec<AttendanceRecord>, LedgerError> {
        let mut filter = vec!["1 = 1".to_string()];
        let mut args = Vec::new();
        if let Some(class_id) = &query.class_id {
            args.push(class_id.clone());
            filter.push(format!("s.class_id = ?{}", args.len()));
        }
        if let Some(from) = query.from {
            args.push(from.to_string());
            filter.push(format!("s.date >= ?{}", args.len()));
        }
        if let Some(to) = query.to {
            args.push(to.to_string());
            filter.push(format!("s.date <= ?{}", args.len()));
        }
        if let Some(identity) = &query.identity {
            args.push(identity.clone());
            filter.push(format!("r.identity = ?{}", args.len()));
        }
        Ok(effective(self.select(&filter.join(" AND "), args)?))
    }

    fn history(&self, id: Uuid) -> Result<Vec<AttendanceRecord>, LedgerError> {
        let Some(record) = self.record(id)? else {
            return Ok(Vec::new());
        };
        let root = record.root_id().to_string();
        self.select("(r.id = ?1 OR r.amends = ?1)", vec![root])
    }
}
