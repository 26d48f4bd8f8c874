//! Attendance session state machine.
//!
//! One session per (class, date, slot), `Open → Closed`. Each session sits
//! behind its own mutex and keeps a cached view of the ledger. The ledger
//! has the final word: appends and closes re-check state there, so a
//! manager in another process sharing the same ledger cannot cause a second
//! record or a record after close. A conflict refreshes the cached view.
//!
//! Lock order: registry, then session. Nothing takes the registry while
//! holding a session lock.

use crate::config::SessionConfig;
use crate::ledger::{self, Admission, AttendanceLedger, Closure, LedgerError};
use crate::roster::{ClassRoster, EditAuthorizer};
use crate::session::{
    AttendanceRecord, AttendanceStatus, AuditInfo, RecordSource, SessionId, SessionInfo, SessionKey,
    SessionState, SessionSummary,
};
use chrono::{Local, NaiveDateTime};
use rollcall_core::{Identity, MatchResult, MatchVerdict};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use uuid::Uuid;

/// Actor recorded on absences synthesized at close.
pub const SYSTEM_ACTOR: &str = "system";

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("a session is already open for {0}")]
    SessionAlreadyOpen(SessionKey),
    #[error("the session for {0} is closed")]
    SessionClosed(SessionKey),
    #[error("unknown session {0}")]
    UnknownSession(SessionId),
    #[error("unknown attendance record {0}")]
    UnknownRecord(Uuid),
    #[error("'{actor}' may not edit attendance for class {class_id}")]
    Unauthorized { actor: String, class_id: String },
    #[error("status '{0}' cannot be marked manually")]
    InvalidStatus(AttendanceStatus),
    #[error("{identity} is not enrolled in class {class_id}")]
    NotEnrolled { identity: String, class_id: String },
    #[error("deadline {deadline} is not after slot start {slot_start}")]
    InvalidDeadline {
        slot_start: NaiveDateTime,
        deadline: NaiveDateTime,
    },
    #[error("ledger: {0}")]
    Ledger(#[from] LedgerError),
}

/// Why an observation produced no record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum IgnoreReason {
    /// The matcher returned unknown.
    Unrecognized(MatchVerdict),
    LowConfidence { confidence: f32, min_confidence: f32 },
    /// Recognized, but not on the session's class roster.
    NotEnrolled,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ObserveOutcome {
    Recorded(AttendanceRecord),
    /// The identity already has a record in this session.
    Duplicate { record_id: Uuid },
    Ignored(IgnoreReason),
    /// The session is closed (or just closed because the observation came after its deadline).
    SessionClosed,
}

impl ObserveOutcome {
    pub fn record(&self) -> Option<&AttendanceRecord> {
        match self {
            ObserveOutcome::Recorded(r) => Some(r),
            _ => None,
        }
    }
}

struct Session {
    info: SessionInfo,
    /// identity → root record id. Anyone in here is never recorded again.
    recorded: HashMap<String, Uuid>,
}

#[derive(Default)]
struct Registry {
    by_id: HashMap<SessionId, Arc<Mutex<Session>>>,
    by_key: HashMap<SessionKey, SessionId>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Rebuild a session's cached view from the ledger.
fn load_session(ledger: &dyn AttendanceLedger, info: SessionInfo) -> Result<Session, SessionError> {
    let recorded = ledger
        .session_records(info.id)?
        .into_iter()
        .filter(|r| r.amends.is_none())
        .map(|r| (r.identity, r.id))
        .collect();
    Ok(Session { info, recorded })
}

/// Result of opening a key: our new session, or one already in the ledger.
enum Opened {
    New(SessionInfo),
    Existing(SessionInfo),
}

pub struct AttendanceSessionManager {
    config: SessionConfig,
    ledger: Arc<dyn AttendanceLedger>,
    roster: Arc<dyn ClassRoster>,
    authorizer: Arc<dyn EditAuthorizer>,
    registry: Mutex<Registry>,
}

impl AttendanceSessionManager {
    /// Build a manager, restoring every session already in `ledger`.
    pub fn new(
        config: SessionConfig,
        ledger: Arc<dyn AttendanceLedger>,
        roster: Arc<dyn ClassRoster>,
        authorizer: Arc<dyn EditAuthorizer>,
    ) -> Result<Self, SessionError> {
        let mut registry = Registry::default();
        for info in ledger.sessions()? {
            let session = load_session(ledger.as_ref(), info)?;
            registry.by_key.insert(session.info.key.clone(), session.info.id);
            registry.by_id.insert(session.info.id, Arc::new(Mutex::new(session)));
        }
        if !registry.by_id.is_empty() {
            tracing::info!(sessions = registry.by_id.len(), "restored attendance sessions");
        }

        Ok(Self {
            config,
            ledger,
            roster,
            authorizer,
            registry: Mutex::new(registry),
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<dyn AttendanceLedger> {
        &self.ledger
    }

    /// Open a new session for `key`.
    pub fn start(&self, key: SessionKey, deadline: NaiveDateTime) -> Result<SessionInfo, SessionError> {
        let mut registry = lock(&self.registry);
        let existing = registry.by_key.get(&key).and_then(|id| registry.by_id.get(id)).cloned();
        if let Some(cell) = existing {
            let mut s = lock(&cell);
            if s.info.state == SessionState::Open {
                self.refresh(&mut s)?;
            }
            return Err(match s.info.state {
                SessionState::Open => SessionError::SessionAlreadyOpen(key),
                SessionState::Closed => SessionError::SessionClosed(key),
            });
        }
        match self.create(&mut registry, key, deadline)? {
            Opened::New(info) => Ok(info),
            Opened::Existing(info) => Err(match info.state {
                SessionState::Open => SessionError::SessionAlreadyOpen(info.key),
                SessionState::Closed => SessionError::SessionClosed(info.key),
            }),
        }
    }

    /// The open session for `key`, creating it if none exists.
    ///
    /// Without an explicit deadline the session runs for the configured
    /// default length from its slot start.
    pub fn ensure_open(
        &self,
        key: SessionKey,
        deadline: Option<NaiveDateTime>,
    ) -> Result<SessionInfo, SessionError> {
        let mut registry = lock(&self.registry);
        let existing = registry.by_key.get(&key).and_then(|id| registry.by_id.get(id)).cloned();
        if let Some(cell) = existing {
            let s = lock(&cell);
            return match s.info.state {
                SessionState::Open => Ok(s.info.clone()),
                SessionState::Closed => Err(SessionError::SessionClosed(key)),
            };
        }
        let deadline = deadline.unwrap_or_else(|| self.slot_start(&key) + self.config.session_length());
        match self.create(&mut registry, key, deadline)? {
            Opened::New(info) => Ok(info),
            Opened::Existing(info) => match info.state {
                SessionState::Open => Ok(info),
                SessionState::Closed => Err(SessionError::SessionClosed(info.key)),
            },
        }
    }

    fn slot_start(&self, key: &SessionKey) -> NaiveDateTime {
        key.date.and_time(self.config.slot_schedule.start_of(key.slot))
    }

    fn create(
        &self,
        registry: &mut Registry,
        key: SessionKey,
        deadline: NaiveDateTime,
    ) -> Result<Opened, SessionError> {
        let slot_start = self.slot_start(&key);
        if deadline <= slot_start {
            return Err(SessionError::InvalidDeadline { slot_start, deadline });
        }

        let info = SessionInfo {
            id: SessionId::new(),
            key,
            state: SessionState::Open,
            opened_at: Local::now().naive_local(),
            slot_start,
            deadline,
            closed_at: None,
        };
        let stored = self.ledger.open_session(&info)?;
        if stored.id != info.id {
            let cell = self.adopt(registry, stored)?;
            let existing = lock(&cell).info.clone();
            return Ok(Opened::Existing(existing));
        }

        registry.by_key.insert(info.key.clone(), info.id);
        registry.by_id.insert(
            info.id,
            Arc::new(Mutex::new(Session {
                info: info.clone(),
                recorded: HashMap::new(),
            })),
        );
        tracing::info!(session = %info.id, key = %info.key, deadline = %info.deadline, "session opened");
        Ok(Opened::New(info))
    }

    /// Register a session that another manager wrote to the shared ledger.
    fn adopt(&self, registry: &mut Registry, info: SessionInfo) -> Result<Arc<Mutex<Session>>, SessionError> {
        if let Some(cell) = registry.by_id.get(&info.id) {
            return Ok(Arc::clone(cell));
        }
        let session = load_session(self.ledger.as_ref(), info)?;
        let id = session.info.id;
        tracing::debug!(session = %id, key = %session.info.key, "session picked up from ledger");
        registry.by_key.insert(session.info.key.clone(), id);
        let cell = Arc::new(Mutex::new(session));
        registry.by_id.insert(id, Arc::clone(&cell));
        Ok(cell)
    }

    /// Re-read state and recorded identities from the ledger.
    fn refresh(&self, s: &mut Session) -> Result<(), SessionError> {
        if let Some(info) = self.ledger.session(s.info.id)? {
            *s = load_session(self.ledger.as_ref(), info)?;
        }
        Ok(())
    }

    fn cell(&self, id: SessionId) -> Result<Arc<Mutex<Session>>, SessionError> {
        let mut registry = lock(&self.registry);
        if let Some(cell) = registry.by_id.get(&id) {
            return Ok(Arc::clone(cell));
        }
        let info = self.ledger.session(id)?.ok_or(SessionError::UnknownSession(id))?;
        self.adopt(&mut registry, info)
    }

    fn is_enrolled(&self, class_id: &str, identity: &str) -> bool {
        self.roster.enrolled(class_id).iter().any(|e| e == identity)
    }

    pub fn session(&self, id: SessionId) -> Result<SessionInfo, SessionError> {
        let cell = self.cell(id)?;
        let info = lock(&cell).info.clone();
        Ok(info)
    }

    pub fn find(&self, key: &SessionKey) -> Option<SessionInfo> {
        let cell = {
            let registry = lock(&self.registry);
            let id = registry.by_key.get(key)?;
            Arc::clone(registry.by_id.get(id)?)
        };
        let info = lock(&cell).info.clone();
        Some(info)
    }

    /// Every known session, oldest slot first.
    pub fn sessions(&self) -> Vec<SessionInfo> {
        let cells: Vec<_> = lock(&self.registry).by_id.values().cloned().collect();
        let mut all: Vec<_> = cells.iter().map(|c| lock(c).info.clone()).collect();
        all.sort_by(|a, b| (a.slot_start, &a.key.class_id).cmp(&(b.slot_start, &b.key.class_id)));
        all
    }

    /// Feed one match result into the session.
    ///
    /// Unknown or low-confidence results and repeats are normal traffic and
    /// return an outcome, never an error.
    pub fn observe(
        &self,
        id: SessionId,
        result: &MatchResult,
        timestamp: NaiveDateTime,
        snapshot_reference: Option<String>,
    ) -> Result<ObserveOutcome, SessionError> {
        let cell = self.cell(id)?;
        let mut s = lock(&cell);

        if s.info.state == SessionState::Closed {
            tracing::debug!(session = %id, "observation after close ignored");
            return Ok(ObserveOutcome::SessionClosed);
        }
        if timestamp > s.info.deadline {
            tracing::info!(session = %id, %timestamp, "observation past deadline, closing session");
            self.close_locked(&mut s, timestamp)?;
            return Ok(ObserveOutcome::SessionClosed);
        }

        let Identity::Known(identity) = &result.identity else {
            tracing::debug!(
                session = %id,
                verdict = ?result.verdict,
                confidence = result.confidence,
                "unrecognised face, monitoring only"
            );
            return Ok(ObserveOutcome::Ignored(IgnoreReason::Unrecognized(result.verdict)));
        };
        if result.confidence < self.config.min_confidence {
            tracing::debug!(
                session = %id,
                identity = %identity,
                confidence = result.confidence,
                "confidence below session minimum, monitoring only"
            );
            return Ok(ObserveOutcome::Ignored(IgnoreReason::LowConfidence {
                confidence: result.confidence,
                min_confidence: self.config.min_confidence,
            }));
        }
        if !self.is_enrolled(&s.info.key.class_id, identity) {
            tracing::debug!(
                session = %id,
                identity = %identity,
                class_id = %s.info.key.class_id,
                "recognised student not enrolled in this class"
            );
            return Ok(ObserveOutcome::Ignored(IgnoreReason::NotEnrolled));
        }
        if let Some(&record_id) = s.recorded.get(identity) {
            return Ok(ObserveOutcome::Duplicate { record_id });
        }

        let status = if timestamp <= s.info.slot_start + self.config.grace() {
            AttendanceStatus::Present
        } else {
            AttendanceStatus::Late
        };
        let record = AttendanceRecord {
            id: Uuid::new_v4(),
            session_id: id,
            identity: identity.clone(),
            timestamp,
            confidence: Some(result.confidence),
            status,
            snapshot_reference,
            source: RecordSource::Recognition,
            amends: None,
            audit: None,
        };
        match self.ledger.admit(&record)? {
            Admission::Appended => {}
            Admission::Duplicate(record_id) => {
                self.refresh(&mut s)?;
                return Ok(ObserveOutcome::Duplicate { record_id });
            }
            Admission::SessionClosed => {
                tracing::debug!(session = %id, "session closed elsewhere, observation ignored");
                self.refresh(&mut s)?;
                return Ok(ObserveOutcome::SessionClosed);
            }
        }
        s.recorded.insert(record.identity.clone(), record.id);

        tracing::info!(
            session = %id,
            identity = %record.identity,
            status = %record.status,
            confidence = result.confidence,
            "attendance recorded"
        );
        Ok(ObserveOutcome::Recorded(record))
    }

    /// Manually mark an identity Present, Late or Excused in an open session.
    pub fn mark(
        &self,
        id: SessionId,
        identity: &str,
        status: AttendanceStatus,
        audit: AuditInfo,
        timestamp: NaiveDateTime,
    ) -> Result<ObserveOutcome, SessionError> {
        if status == AttendanceStatus::Absent {
            return Err(SessionError::InvalidStatus(status));
        }
        let cell = self.cell(id)?;
        let mut s = lock(&cell);
        self.authorize(&audit.actor, &s.info.key.class_id)?;

        if s.info.state == SessionState::Closed {
            return Err(SessionError::SessionClosed(s.info.key.clone()));
        }
        if !self.is_enrolled(&s.info.key.class_id, identity) {
            return Err(SessionError::NotEnrolled {
                identity: identity.to_string(),
                class_id: s.info.key.class_id.clone(),
            });
        }
        if let Some(&record_id) = s.recorded.get(identity) {
            return Ok(ObserveOutcome::Duplicate { record_id });
        }

        let record = AttendanceRecord {
            id: Uuid::new_v4(),
            session_id: id,
            identity: identity.to_string(),
            timestamp,
            confidence: None,
            status,
            snapshot_reference: None,
            source: RecordSource::Manual,
            amends: None,
            audit: Some(audit),
        };
        match self.ledger.admit(&record)? {
            Admission::Appended => {}
            Admission::Duplicate(record_id) => {
                self.refresh(&mut s)?;
                return Ok(ObserveOutcome::Duplicate { record_id });
            }
            Admission::SessionClosed => {
                self.refresh(&mut s)?;
                return Err(SessionError::SessionClosed(s.info.key.clone()));
            }
        }
        s.recorded.insert(record.identity.clone(), record.id);
        tracing::info!(session = %id, identity, %status, "attendance marked manually");
        Ok(ObserveOutcome::Recorded(record))
    }

    /// Close the session, synthesizing Absent for every unrecorded enrolled
    /// student. Closing a closed session returns its summary unchanged.
    pub fn close(&self, id: SessionId, now: NaiveDateTime) -> Result<SessionSummary, SessionError> {
        let cell = self.cell(id)?;
        let mut s = lock(&cell);
        if s.info.state == SessionState::Open {
            self.close_locked(&mut s, now)?;
        }
        self.summarize(&s)
    }

    /// Close every open session whose deadline is at or before `now`.
    ///
    /// Each session is closed independently; one failure does not stop the rest.
    pub fn close_expired(&self, now: NaiveDateTime) -> Vec<(SessionId, Result<SessionSummary, SessionError>)> {
        self.pick_up_open_sessions();
        let cells: Vec<_> = lock(&self.registry).by_id.values().cloned().collect();
        let mut out = Vec::new();
        for cell in cells {
            let mut s = lock(&cell);
            if s.info.state != SessionState::Open || s.info.deadline > now {
                continue;
            }
            let id = s.info.id;
            let result = self.close_locked(&mut s, now).and_then(|()| self.summarize(&s));
            out.push((id, result));
        }
        out
    }

    /// Adopt open sessions that other managers created in the shared ledger.
    fn pick_up_open_sessions(&self) {
        let stored = match self.ledger.sessions() {
            Ok(stored) => stored,
            Err(e) => {
                tracing::warn!(error = %e, "listing ledger sessions failed");
                return;
            }
        };
        let mut registry = lock(&self.registry);
        for info in stored {
            if info.state != SessionState::Open || registry.by_id.contains_key(&info.id) {
                continue;
            }
            if let Err(e) = self.adopt(&mut registry, info) {
                tracing::warn!(error = %e, "loading session from ledger failed");
            }
        }
    }

    fn close_locked(&self, s: &mut Session, now: NaiveDateTime) -> Result<(), SessionError> {
        let reason = if now >= s.info.deadline {
            "Auto-marked absent after deadline"
        } else {
            "Marked absent at session close"
        };
        let absent: Vec<AttendanceRecord> = self
            .roster
            .enrolled(&s.info.key.class_id)
            .into_iter()
            .filter(|identity| !s.recorded.contains_key(identity))
            .map(|identity| AttendanceRecord {
                id: Uuid::new_v4(),
                session_id: s.info.id,
                identity,
                timestamp: now,
                confidence: None,
                status: AttendanceStatus::Absent,
                snapshot_reference: None,
                source: RecordSource::AutoAbsent,
                amends: None,
                audit: Some(AuditInfo {
                    actor: SYSTEM_ACTOR.to_string(),
                    reason: reason.to_string(),
                }),
            })
            .collect();

        match self.ledger.close_session(s.info.id, now, &absent)? {
            Closure::Closed(stored) => tracing::info!(
                session = %s.info.id,
                key = %s.info.key,
                absent = stored.len(),
                "session closed"
            ),
            Closure::AlreadyClosed => {
                tracing::debug!(session = %s.info.id, "session was already closed in the ledger")
            }
        }
        self.refresh(s)
    }

    /// Append an amendment to `record_id`'s chain. Allowed in any session state.
    pub fn edit(
        &self,
        record_id: Uuid,
        new_status: AttendanceStatus,
        audit: AuditInfo,
        now: NaiveDateTime,
    ) -> Result<AttendanceRecord, SessionError> {
        let original = self
            .ledger
            .record(record_id)?
            .ok_or(SessionError::UnknownRecord(record_id))?;
        let cell = self.cell(original.session_id)?;
        let mut s = lock(&cell);
        self.authorize(&audit.actor, &s.info.key.class_id)?;

        let latest = self.ledger.history(record_id)?.pop().unwrap_or_else(|| original.clone());
        let amendment = AttendanceRecord {
            id: Uuid::new_v4(),
            session_id: original.session_id,
            identity: original.identity.clone(),
            timestamp: now,
            confidence: latest.confidence,
            status: new_status,
            snapshot_reference: latest.snapshot_reference,
            source: RecordSource::Amendment,
            amends: Some(original.root_id()),
            audit: Some(audit),
        };
        self.ledger.append(std::slice::from_ref(&amendment))?;
        s.recorded
            .entry(amendment.identity.clone())
            .or_insert(original.root_id());

        tracing::info!(
            record = %original.root_id(),
            identity = %amendment.identity,
            from = %latest.status,
            to = %new_status,
            actor = amendment.audit.as_ref().map(|a| a.actor.as_str()).unwrap_or_default(),
            "attendance record amended"
        );
        Ok(amendment)
    }

    /// Effective records of one session.
    pub fn records(&self, id: SessionId) -> Result<Vec<AttendanceRecord>, SessionError> {
        self.cell(id)?;
        Ok(ledger::effective(self.ledger.session_records(id)?))
    }

    pub fn summary(&self, id: SessionId) -> Result<SessionSummary, SessionError> {
        let cell = self.cell(id)?;
        let s = lock(&cell);
        self.summarize(&s)
    }

    fn summarize(&self, s: &Session) -> Result<SessionSummary, SessionError> {
        let roster: BTreeSet<String> = self.roster.enrolled(&s.info.key.class_id).into_iter().collect();
        // Records of students no longer on the roster stay in the ledger but not in the counts.
        let records: Vec<AttendanceRecord> = ledger::effective(self.ledger.session_records(s.info.id)?)
            .into_iter()
            .filter(|r| roster.contains(&r.identity))
            .collect();

        let count = |status| records.iter().filter(|r| r.status == status).count();
        let present = count(AttendanceStatus::Present);
        let pending = roster.iter().filter(|i| !s.recorded.contains_key(*i)).count();
        let total_students = roster.len();

        Ok(SessionSummary {
            session_id: s.info.id,
            key: s.info.key.clone(),
            state: s.info.state,
            total_students,
            present,
            late: count(AttendanceStatus::Late),
            absent: count(AttendanceStatus::Absent),
            excused: count(AttendanceStatus::Excused),
            pending,
            attendance_rate: if total_students == 0 {
                0.0
            } else {
                present as f32 / total_students as f32 * 100.0
            },
        })
    }

    fn authorize(&self, actor: &str, class_id: &str) -> Result<(), SessionError> {
        if self.authorizer.can_edit(actor, class_id) {
            Ok(())
        } else {
            tracing::warn!(actor, class_id, "attendance edit refused");
            Err(SessionError::Unauthorized {
                actor: actor.to_string(),
                class_id: class_id.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{MemoryLedger, RecordQuery, SqliteLedger};
    use crate::roster::{StaticAuthorizer, StaticRoster};
    use crate::session::Slot;
    use chrono::{Duration, NaiveDate};
    use rollcall_core::BoundingBox;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 9, 2).unwrap()
    }

    fn at(h: u32, m: u32) -> NaiveDateTime {
        day().and_hms_opt(h, m, 0).unwrap()
    }

    fn key() -> SessionKey {
        SessionKey::new("7A", day(), Slot::Morning)
    }

    fn manager_with(ledger: Arc<dyn AttendanceLedger>) -> AttendanceSessionManager {
        let roster = StaticRoster::new()
            .with_class("7A", ["S1", "S2", "S3"])
            .with_class("7B", ["S9"]);
        let auth = StaticAuthorizer::new().grant("ms.k", "7A");
        AttendanceSessionManager::new(SessionConfig::default(), ledger, Arc::new(roster), Arc::new(auth)).unwrap()
    }

    fn manager() -> (Arc<MemoryLedger>, AttendanceSessionManager) {
        let ledger = Arc::new(MemoryLedger::new());
        (Arc::clone(&ledger), manager_with(ledger.clone()))
    }

    fn seen(identity: &str, confidence: f32) -> MatchResult {
        MatchResult {
            identity: Identity::Known(identity.into()),
            confidence,
            bbox: BoundingBox {
                x: 0.0,
                y: 0.0,
                width: 50.0,
                height: 50.0,
                confidence: 0.9,
                landmarks: None,
            },
            verdict: MatchVerdict::Accepted,
            gallery_version: 1,
        }
    }

    fn unknown(confidence: f32, verdict: MatchVerdict) -> MatchResult {
        MatchResult {
            identity: Identity::Unknown,
            verdict,
            ..seen("x", confidence)
        }
    }

    fn audit(actor: &str) -> AuditInfo {
        AuditInfo {
            actor: actor.into(),
            reason: "note from parent".into(),
        }
    }

    #[test]
    fn test_class_7a_morning_scenario() {
        let (ledger, m) = manager();
        let session = m.start(key(), at(9, 0)).unwrap();

        let first = m.observe(session.id, &seen("S1", 0.82), at(7, 5), Some("snap/1.jpg".into())).unwrap();
        let record = first.record().cloned().unwrap();
        assert_eq!(record.status, AttendanceStatus::Present);
        assert_eq!(record.snapshot_reference.as_deref(), Some("snap/1.jpg"));

        let second = m.observe(session.id, &seen("S1", 0.90), at(7, 6), None).unwrap();
        assert_eq!(second, ObserveOutcome::Duplicate { record_id: record.id });
        assert_eq!(ledger.len(), 1);

        let summary = m.close(session.id, at(9, 0)).unwrap();
        assert_eq!(summary.state, SessionState::Closed);
        assert_eq!((summary.present, summary.absent, summary.pending), (1, 2, 0));
        assert_eq!(summary.total_students, 3);

        let records = m.records(session.id).unwrap();
        let absent: Vec<_> = records
            .iter()
            .filter(|r| r.status == AttendanceStatus::Absent)
            .map(|r| r.identity.as_str())
            .collect();
        assert_eq!(absent, vec!["S2", "S3"]);
        let reason = records[1].audit.as_ref().map(|a| a.reason.as_str());
        assert_eq!(reason, Some("Auto-marked absent after deadline"));
    }

    #[test]
    fn test_low_confidence_creates_no_record() {
        let (ledger, m) = manager();
        let session = m.start(key(), at(9, 0)).unwrap();

        let low = m.observe(session.id, &seen("S1", 0.55), at(7, 5), None).unwrap();
        assert!(matches!(
            low,
            ObserveOutcome::Ignored(IgnoreReason::LowConfidence { confidence, .. }) if confidence == 0.55
        ));
        let unrecognized = m
            .observe(session.id, &unknown(0.55, MatchVerdict::BelowThreshold), at(7, 5), None)
            .unwrap();
        assert_eq!(
            unrecognized,
            ObserveOutcome::Ignored(IgnoreReason::Unrecognized(MatchVerdict::BelowThreshold))
        );
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_ambiguous_match_never_records() {
        let (ledger, m) = manager();
        let session = m.start(key(), at(9, 0)).unwrap();
        let outcome = m
            .observe(session.id, &unknown(0.97, MatchVerdict::Ambiguous), at(7, 1), None)
            .unwrap();
        assert!(matches!(outcome, ObserveOutcome::Ignored(_)));
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_grace_period_boundary() {
        let (_ledger, m) = manager();
        let session = m.start(key(), at(9, 0)).unwrap();
        let on_time = m.observe(session.id, &seen("S1", 0.8), at(7, 15), None).unwrap();
        let late = m.observe(session.id, &seen("S2", 0.8), at(7, 16), None).unwrap();
        assert_eq!(on_time.record().unwrap().status, AttendanceStatus::Present);
        assert_eq!(late.record().unwrap().status, AttendanceStatus::Late);
    }

    #[test]
    fn test_start_twice_fails() {
        let (_ledger, m) = manager();
        let session = m.start(key(), at(9, 0)).unwrap();
        assert!(matches!(m.start(key(), at(10, 0)), Err(SessionError::SessionAlreadyOpen(_))));

        m.close(session.id, at(8, 0)).unwrap();
        assert!(matches!(m.start(key(), at(10, 0)), Err(SessionError::SessionClosed(_))));
        assert!(matches!(m.ensure_open(key(), None), Err(SessionError::SessionClosed(_))));
    }

    #[test]
    fn test_deadline_must_follow_slot_start() {
        let (_ledger, m) = manager();
        assert!(matches!(
            m.start(key(), at(6, 0)),
            Err(SessionError::InvalidDeadline { .. })
        ));
    }

    #[test]
    fn test_ensure_open_reuses_session() {
        let (_ledger, m) = manager();
        let first = m.ensure_open(key(), None).unwrap();
        assert_eq!(first.deadline, at(7, 0) + Duration::hours(8));
        let again = m.ensure_open(key(), Some(at(9, 0))).unwrap();
        assert_eq!(again.id, first.id);
        assert_eq!(m.find(&key()).map(|s| s.id), Some(first.id));
    }

    #[test]
    fn test_unknown_session_is_an_error() {
        let (_ledger, m) = manager();
        let missing = SessionId::new();
        assert!(matches!(
            m.observe(missing, &seen("S1", 0.9), at(7, 0), None),
            Err(SessionError::UnknownSession(_))
        ));
        assert!(matches!(m.close(missing, at(9, 0)), Err(SessionError::UnknownSession(_))));
    }

    #[test]
    fn test_close_is_idempotent() {
        let (ledger, m) = manager();
        let session = m.start(key(), at(9, 0)).unwrap();
        let first = m.close(session.id, at(8, 30)).unwrap();
        let count = ledger.len();
        let second = m.close(session.id, at(9, 0)).unwrap();
        assert_eq!(first, second);
        assert_eq!(ledger.len(), count);
        assert_eq!(m.session(session.id).unwrap().closed_at, Some(at(8, 30)));
    }

    #[test]
    fn test_observe_after_close_records_nothing() {
        let (ledger, m) = manager();
        let session = m.start(key(), at(9, 0)).unwrap();
        m.close(session.id, at(8, 0)).unwrap();
        let count = ledger.len();
        let outcome = m.observe(session.id, &seen("S1", 0.9), at(8, 1), None).unwrap();
        assert_eq!(outcome, ObserveOutcome::SessionClosed);
        assert_eq!(ledger.len(), count);
    }

    #[test]
    fn test_observe_past_deadline_closes_session() {
        let (_ledger, m) = manager();
        let session = m.start(key(), at(9, 0)).unwrap();
        let outcome = m.observe(session.id, &seen("S1", 0.9), at(9, 1), None).unwrap();
        assert_eq!(outcome, ObserveOutcome::SessionClosed);
        let summary = m.summary(session.id).unwrap();
        assert_eq!(summary.state, SessionState::Closed);
        assert_eq!(summary.absent, 3);
    }

    #[test]
    fn test_concurrent_observe_records_once() {
        let (ledger, m) = manager();
        let session = m.start(key(), at(9, 0)).unwrap();

        std::thread::scope(|s| {
            for t in 0..8 {
                let m = &m;
                s.spawn(move || {
                    for n in 0..50 {
                        let who = if n % 2 == 0 { "S1" } else { "S2" };
                        m.observe(session.id, &seen(who, 0.9), at(7, (t + n) % 10), None)
                            .unwrap();
                    }
                });
            }
        });

        assert_eq!(ledger.len(), 2);
        let summary = m.summary(session.id).unwrap();
        assert_eq!(summary.present, 2);
        assert_eq!(summary.pending, 1);
    }

    #[test]
    fn test_close_racing_observe_keeps_totality() {
        for _ in 0..20 {
            let (_ledger, m) = manager();
            let session = m.start(key(), at(9, 0)).unwrap();

            std::thread::scope(|s| {
                for who in ["S1", "S2", "S3"] {
                    let m = &m;
                    s.spawn(move || {
                        for _ in 0..20 {
                            m.observe(session.id, &seen(who, 0.9), at(7, 30), None).unwrap();
                        }
                    });
                }
                s.spawn(|| m.close(session.id, at(7, 31)).unwrap());
                s.spawn(|| m.close(session.id, at(9, 0)).unwrap());
            });

            let records = m.records(session.id).unwrap();
            let mut identities: Vec<_> = records.iter().map(|r| r.identity.as_str()).collect();
            identities.sort();
            assert_eq!(identities, vec!["S1", "S2", "S3"]);
            // Nothing recorded after close.
            let closed_at = m.session(session.id).unwrap().closed_at.unwrap();
            assert!(records.iter().all(|r| r.timestamp <= closed_at));
        }
    }

    #[test]
    fn test_mark_manual_entries() {
        let (_ledger, m) = manager();
        let session = m.start(key(), at(9, 0)).unwrap();

        let excused = m
            .mark(session.id, "S2", AttendanceStatus::Excused, audit("ms.k"), at(7, 2))
            .unwrap();
        assert_eq!(excused.record().unwrap().source, RecordSource::Manual);

        // Recognition afterwards is a duplicate.
        let later = m.observe(session.id, &seen("S2", 0.95), at(7, 3), None).unwrap();
        assert!(matches!(later, ObserveOutcome::Duplicate { .. }));

        assert!(matches!(
            m.mark(session.id, "S3", AttendanceStatus::Absent, audit("ms.k"), at(7, 2)),
            Err(SessionError::InvalidStatus(AttendanceStatus::Absent))
        ));
        assert!(matches!(
            m.mark(session.id, "S3", AttendanceStatus::Present, audit("intruder"), at(7, 2)),
            Err(SessionError::Unauthorized { .. })
        ));

        let summary = m.close(session.id, at(9, 0)).unwrap();
        assert_eq!((summary.excused, summary.absent), (1, 2));
    }

    #[test]
    fn test_edit_appends_amendment() {
        let (ledger, m) = manager();
        let session = m.start(key(), at(9, 0)).unwrap();
        m.close(session.id, at(9, 0)).unwrap();

        let absent_s2 = m
            .records(session.id)
            .unwrap()
            .into_iter()
            .find(|r| r.identity == "S2")
            .unwrap();

        let fixed = m
            .edit(absent_s2.id, AttendanceStatus::Excused, audit("ms.k"), at(10, 0))
            .unwrap();
        assert_eq!(fixed.amends, Some(absent_s2.id));
        assert_eq!(fixed.audit.as_ref().unwrap().reason, "note from parent");

        // Editing the amendment still chains to the root.
        let again = m.edit(fixed.id, AttendanceStatus::Present, audit("ms.k"), at(10, 5)).unwrap();
        assert_eq!(again.amends, Some(absent_s2.id));

        let history = ledger.history(absent_s2.id).unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0], absent_s2);

        let effective = ledger
            .query(&RecordQuery {
                identity: Some("S2".into()),
                ..RecordQuery::default()
            })
            .unwrap();
        assert_eq!(effective.len(), 1);
        assert_eq!(effective[0].status, AttendanceStatus::Present);

        let summary = m.summary(session.id).unwrap();
        assert_eq!((summary.present, summary.absent), (1, 2));
    }

    #[test]
    fn test_edit_checks_authorization_and_existence() {
        let (_ledger, m) = manager();
        let session = m.start(key(), at(9, 0)).unwrap();
        let r = m.observe(session.id, &seen("S1", 0.9), at(7, 1), None).unwrap();
        let id = r.record().unwrap().id;

        assert!(matches!(
            m.edit(id, AttendanceStatus::Late, audit("mr.b"), at(7, 2)),
            Err(SessionError::Unauthorized { .. })
        ));
        assert!(matches!(
            m.edit(Uuid::new_v4(), AttendanceStatus::Late, audit("ms.k"), at(7, 2)),
            Err(SessionError::UnknownRecord(_))
        ));
    }

    #[test]
    fn test_close_expired_only_touches_past_deadlines() {
        let (_ledger, m) = manager();
        let morning = m.start(key(), at(9, 0)).unwrap();
        let afternoon = m
            .start(SessionKey::new("7B", day(), Slot::Afternoon), at(15, 0))
            .unwrap();

        let closed = m.close_expired(at(9, 30));
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].0, morning.id);
        assert!(closed[0].1.is_ok());
        assert_eq!(m.session(afternoon.id).unwrap().state, SessionState::Open);

        // A second sweep finds nothing left to do.
        assert!(m.close_expired(at(9, 31)).is_empty());
    }

    #[test]
    fn test_sessions_restored_from_ledger() {
        let ledger = Arc::new(MemoryLedger::new());
        let session = {
            let m = manager_with(Arc::<MemoryLedger>::clone(&ledger));
            let session = m.start(key(), at(9, 0)).unwrap();
            m.observe(session.id, &seen("S1", 0.9), at(7, 1), None).unwrap();
            session
        };

        let m = manager_with(ledger);
        let again = m.observe(session.id, &seen("S1", 0.9), at(7, 2), None).unwrap();
        assert!(matches!(again, ObserveOutcome::Duplicate { .. }));
        assert!(matches!(m.start(key(), at(9, 0)), Err(SessionError::SessionAlreadyOpen(_))));
        assert_eq!(m.sessions().len(), 1);
    }

    #[test]
    fn test_student_from_another_class_is_not_recorded() {
        let (ledger, m) = manager();
        let session = m.start(key(), at(9, 0)).unwrap();

        let outcome = m.observe(session.id, &seen("S9", 0.93), at(7, 4), None).unwrap();
        assert_eq!(outcome, ObserveOutcome::Ignored(IgnoreReason::NotEnrolled));
        assert!(matches!(
            m.mark(session.id, "S9", AttendanceStatus::Present, audit("ms.k"), at(7, 5)),
            Err(SessionError::NotEnrolled { .. })
        ));
        assert!(ledger.is_empty());

        m.observe(session.id, &seen("S1", 0.9), at(7, 5), None).unwrap();
        let summary = m.summary(session.id).unwrap();
        assert_eq!((summary.total_students, summary.present, summary.pending), (3, 1, 2));
    }

    #[test]
    fn test_summary_counts_roster_students_only() {
        let (ledger, m) = manager();
        let session = m.start(key(), at(9, 0)).unwrap();
        m.observe(session.id, &seen("S1", 0.9), at(7, 5), None).unwrap();
        // A record left behind by a student who has since left the class.
        let former = AttendanceRecord {
            id: Uuid::new_v4(),
            identity: "S7".into(),
            ..m.records(session.id).unwrap()[0].clone()
        };
        ledger.append(&[former]).unwrap();

        let summary = m.summary(session.id).unwrap();
        assert_eq!(summary.total_students, 3);
        assert_eq!(summary.present, 1);
        assert!((summary.attendance_rate - 100.0 / 3.0).abs() < 1e-4);
    }

    #[test]
    fn test_managers_sharing_a_ledger_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("attendance.db");
        let daemon = manager_with(Arc::new(SqliteLedger::open(&path).unwrap()));
        let cli = manager_with(Arc::new(SqliteLedger::open(&path).unwrap()));

        let session = daemon.ensure_open(key(), Some(at(9, 0))).unwrap();
        assert_eq!(cli.ensure_open(key(), None).unwrap().id, session.id);
        assert!(matches!(cli.start(key(), at(9, 0)), Err(SessionError::SessionAlreadyOpen(_))));

        // A manual mark from one manager blocks recognition in the other.
        let marked = cli
            .mark(session.id, "S1", AttendanceStatus::Present, audit("ms.k"), at(7, 2))
            .unwrap();
        let marked_id = marked.record().unwrap().id;
        let seen_again = daemon.observe(session.id, &seen("S1", 0.9), at(7, 3), None).unwrap();
        assert_eq!(seen_again, ObserveOutcome::Duplicate { record_id: marked_id });

        // A close from one manager stops recording in the other.
        let summary = cli.close(session.id, at(8, 0)).unwrap();
        assert_eq!((summary.present, summary.absent), (1, 2));
        let late = daemon.observe(session.id, &seen("S2", 0.9), at(8, 1), None).unwrap();
        assert_eq!(late, ObserveOutcome::SessionClosed);
        assert_eq!(daemon.session(session.id).unwrap().state, SessionState::Closed);
        assert!(matches!(daemon.ensure_open(key(), None), Err(SessionError::SessionClosed(_))));

        let records = daemon.records(session.id).unwrap();
        let s1: Vec<_> = records.iter().filter(|r| r.identity == "S1").collect();
        let s2: Vec<_> = records.iter().filter(|r| r.identity == "S2").map(|r| r.status).collect();
        assert_eq!(s1.len(), 1);
        assert_eq!(s2, vec![AttendanceStatus::Absent]);

        // Sessions opened elsewhere still get closed at their deadline.
        let afternoon = cli
            .start(SessionKey::new("7A", day(), Slot::Afternoon), at(15, 0))
            .unwrap();
        let closed: Vec<SessionId> = daemon.close_expired(at(15, 30)).into_iter().map(|(id, _)| id).collect();
        assert_eq!(closed, vec![afternoon.id]);
        assert_eq!(daemon.session(afternoon.id).unwrap().state, SessionState::Closed);
    }
}
