//! Session manager configuration.

use crate::session::Slot;
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(15 * 60);
pub const DEFAULT_MIN_CONFIDENCE: f32 = 0.6;
/// Sessions left open this long after their slot start are closed automatically.
pub const DEFAULT_SESSION_LENGTH: Duration = Duration::from_secs(8 * 3600);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlotSchedule {
    pub morning: NaiveTime,
    pub afternoon: NaiveTime,
}

impl Default for SlotSchedule {
    fn default() -> Self {
        Self {
            morning: NaiveTime::from_hms_opt(7, 0, 0).unwrap_or_default(),
            afternoon: NaiveTime::from_hms_opt(13, 0, 0).unwrap_or_default(),
        }
    }
}

impl SlotSchedule {
    pub fn start_of(&self, slot: Slot) -> NaiveTime {
        match slot {
            Slot::Morning => self.morning,
            Slot::Afternoon => self.afternoon,
        }
    }

    /// Slot a wall-clock time falls into: afternoon from its start on, morning before.
    pub fn slot_at(&self, time: NaiveTime) -> Slot {
        if time >= self.afternoon {
            Slot::Afternoon
        } else {
            Slot::Morning
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Check-ins up to `slot_start + grace` are Present, later ones Late.
    #[serde(with = "duration_secs")]
    pub session_grace_period: Duration,
    /// Recognitions below this confidence never create a record.
    pub min_confidence: f32,
    /// Deadline used by `ensure_open` when the caller gives none.
    #[serde(with = "duration_secs")]
    pub default_session_length: Duration,
    pub slot_schedule: SlotSchedule,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_grace_period: DEFAULT_GRACE_PERIOD,
            min_confidence: DEFAULT_MIN_CONFIDENCE,
            default_session_length: DEFAULT_SESSION_LENGTH,
            slot_schedule: SlotSchedule::default(),
        }
    }
}

impl SessionConfig {
    pub fn grace(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.session_grace_period).unwrap_or_else(|_| chrono::Duration::zero())
    }

    pub fn session_length(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.default_session_length).unwrap_or_else(|_| chrono::Duration::hours(8))
    }

    /// Apply `ROLLCALL_SESSION_GRACE_SECS`, `ROLLCALL_MIN_CONFIDENCE` and
    /// `ROLLCALL_SESSION_LENGTH_SECS` from `var`. Unparseable values are skipped.
    pub fn with_overrides(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(secs) = parse_var(&var, "ROLLCALL_SESSION_GRACE_SECS") {
            self.session_grace_period = Duration::from_secs(secs);
        }
        if let Some(c) = parse_var(&var, "ROLLCALL_MIN_CONFIDENCE") {
            self.min_confidence = c;
        }
        if let Some(secs) = parse_var(&var, "ROLLCALL_SESSION_LENGTH_SECS") {
            self.default_session_length = Duration::from_secs(secs);
        }
        self
    }
}

fn parse_var<T: FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = var(key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable config value");
            None
        }
    }
}

/// Durations as whole seconds in config files.
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = SessionConfig::default();
        assert_eq!(cfg.session_grace_period, Duration::from_secs(900));
        assert_eq!(cfg.min_confidence, 0.6);
        assert_eq!(cfg.slot_schedule.start_of(Slot::Afternoon), NaiveTime::from_hms_opt(13, 0, 0).unwrap());
    }

    #[test]
    fn test_partial_document_uses_defaults() {
        let cfg: SessionConfig = serde_json::from_value(serde_json::json!({
            "session_grace_period": 600,
            "slot_schedule": { "morning": "08:30:00" }
        }))
        .unwrap();
        assert_eq!(cfg.session_grace_period, Duration::from_secs(600));
        assert_eq!(cfg.min_confidence, DEFAULT_MIN_CONFIDENCE);
        assert_eq!(cfg.slot_schedule.morning, NaiveTime::from_hms_opt(8, 30, 0).unwrap());
        assert_eq!(cfg.slot_schedule.afternoon, NaiveTime::from_hms_opt(13, 0, 0).unwrap());
    }

    #[test]
    fn test_slot_at() {
        let s = SlotSchedule::default();
        assert_eq!(s.slot_at(NaiveTime::from_hms_opt(12, 59, 59).unwrap()), Slot::Morning);
        assert_eq!(s.slot_at(NaiveTime::from_hms_opt(13, 0, 0).unwrap()), Slot::Afternoon);
    }

    #[test]
    fn test_overrides() {
        let cfg = SessionConfig::default().with_overrides(|key: &str| match key {
            "ROLLCALL_SESSION_GRACE_SECS" => Some("120".to_string()),
            "ROLLCALL_MIN_CONFIDENCE" => Some("high".to_string()),
            _ => None,
        });
        assert_eq!(cfg.session_grace_period, Duration::from_secs(120));
        assert_eq!(cfg.min_confidence, DEFAULT_MIN_CONFIDENCE);
        assert_eq!(cfg.default_session_length, DEFAULT_SESSION_LENGTH);
    }
}
