//! rollcall-attendance: attendance sessions fed by face matches.
//!
//! An [`AttendanceSessionManager`] keeps one `Open → Closed` session per
//! (class, date, slot), records each student at most once per session, and
//! synthesizes absences at close. Records go to an append-only
//! [`AttendanceLedger`]; corrections are amendments, never rewrites.

pub mod config;
pub mod ledger;
pub mod manager;
pub mod roster;
pub mod scheduler;
pub mod session;

pub use config::{SessionConfig, SlotSchedule};
pub use ledger::{Admission, AttendanceLedger, Closure, LedgerError, MemoryLedger, RecordQuery, SqliteLedger};
pub use manager::{AttendanceSessionManager, IgnoreReason, ObserveOutcome, SessionError};
pub use roster::{ClassRoster, EditAuthorizer, StaticAuthorizer, StaticRoster};
pub use scheduler::DeadlineScheduler;
pub use session::{
    AttendanceRecord, AttendanceStatus, AuditInfo, RecordSource, SessionId, SessionInfo, SessionKey,
    SessionState, SessionSummary, Slot,
};
