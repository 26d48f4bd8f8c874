//! Attendance session and record types.

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Half-day slot a session covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Slot {
    Morning,
    Afternoon,
}

impl Slot {
    pub fn as_str(&self) -> &'static str {
        match self {
            Slot::Morning => "morning",
            Slot::Afternoon => "afternoon",
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Slot {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "morning" | "am" => Ok(Slot::Morning),
            "afternoon" | "pm" => Ok(Slot::Afternoon),
            other => Err(format!("unknown slot '{other}' (expected morning or afternoon)")),
        }
    }
}

/// (class, date, slot). At most one session exists per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub class_id: String,
    pub date: NaiveDate,
    pub slot: Slot,
}

impl SessionKey {
    pub fn new(class_id: impl Into<String>, date: NaiveDate, slot: Slot) -> Self {
        Self {
            class_id: class_id.into(),
            date,
            slot,
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.class_id, self.date, self.slot)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Open,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Open => "open",
            SessionState::Closed => "closed",
        }
    }
}

impl FromStr for SessionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(SessionState::Open),
            "closed" => Ok(SessionState::Closed),
            other => Err(format!("unknown session state '{other}'")),
        }
    }
}

/// Persisted view of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub key: SessionKey,
    pub state: SessionState,
    pub opened_at: NaiveDateTime,
    /// Start of the slot; Present/Late is decided against this plus the grace period.
    pub slot_start: NaiveDateTime,
    pub deadline: NaiveDateTime,
    pub closed_at: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttendanceStatus {
    Present,
    Late,
    Absent,
    Excused,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceStatus::Present => "present",
            AttendanceStatus::Late => "late",
            AttendanceStatus::Absent => "absent",
            AttendanceStatus::Excused => "excused",
        }
    }
}

impl fmt::Display for AttendanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttendanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "present" => Ok(AttendanceStatus::Present),
            "late" => Ok(AttendanceStatus::Late),
            "absent" => Ok(AttendanceStatus::Absent),
            "excused" => Ok(AttendanceStatus::Excused),
            other => Err(format!("unknown attendance status '{other}'")),
        }
    }
}

/// How a record came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordSource {
    Recognition,
    Manual,
    AutoAbsent,
    Amendment,
}

impl RecordSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordSource::Recognition => "recognition",
            RecordSource::Manual => "manual",
            RecordSource::AutoAbsent => "auto_absent",
            RecordSource::Amendment => "amendment",
        }
    }
}

impl FromStr for RecordSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "recognition" => Ok(RecordSource::Recognition),
            "manual" => Ok(RecordSource::Manual),
            "auto_absent" => Ok(RecordSource::AutoAbsent),
            "amendment" => Ok(RecordSource::Amendment),
            other => Err(format!("unknown record source '{other}'")),
        }
    }
}

/// Who changed a record and why, stored verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditInfo {
    pub actor: String,
    pub reason: String,
}

/// One entry of the append-only attendance log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub id: Uuid,
    pub session_id: SessionId,
    pub identity: String,
    pub timestamp: NaiveDateTime,
    /// Match confidence for recognised check-ins; `None` for manual and synthesized records.
    pub confidence: Option<f32>,
    pub status: AttendanceStatus,
    pub snapshot_reference: Option<String>,
    pub source: RecordSource,
    /// Root record this one amends. Amendments always point at the root,
    /// never at another amendment.
    pub amends: Option<Uuid>,
    pub audit: Option<AuditInfo>,
}

impl AttendanceRecord {
    /// Id of the chain this record belongs to.
    pub fn root_id(&self) -> Uuid {
        self.amends.unwrap_or(self.id)
    }
}

/// Counts over a session's effective records.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub key: SessionKey,
    pub state: SessionState,
    pub total_students: usize,
    pub present: usize,
    pub late: usize,
    pub absent: usize,
    pub excused: usize,
    /// Enrolled students with no record yet (always 0 once closed).
    pub pending: usize,
    /// `present / total_students * 100`.
    pub attendance_rate: f32,
}
