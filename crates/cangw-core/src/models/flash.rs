//! Flash order and flash progress models

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::DeviceId;
use crate::store::StoreError;

/// Globally unique identifier of a flash order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(pub Uuid);

impl OrderId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OrderId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for OrderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for OrderId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// A request to overwrite a device's program image and activate it.
///
/// Orders are never persisted themselves; only the [`FlashState`] derived
/// from them is.
#[derive(Debug, Clone)]
pub struct FlashOrder {
    pub order_id: OrderId,
    pub device_id: DeviceId,
    /// Raw program image
    pub payload: Bytes,
    /// Version the device should report after booting the new image
    pub expected_version: Option<String>,
}

impl FlashOrder {
    pub fn new(
        device_id: DeviceId,
        payload: impl Into<Bytes>,
        expected_version: Option<String>,
    ) -> Self {
        Self {
            order_id: OrderId::new(),
            device_id,
            payload: payload.into(),
            expected_version,
        }
    }
}

/// Phase of a flash order.
///
/// # Lifecycle
///
/// ```text
/// Requested → PreOperational → ProgramStopBefore → ProgramClear
///   → ProgramWriteData → ProgramWriteFinish → ProgramStopAfter
///   → ProgramStart → ProgramCheckError → ProgramCheckVersion
///   → ProgramAck → Finish
///
/// any non-terminal phase ──→ Error
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlashPhase {
    Requested,
    PreOperational,
    ProgramStopBefore,
    ProgramClear,
    ProgramWriteData,
    ProgramWriteFinish,
    ProgramStopAfter,
    ProgramStart,
    ProgramCheckError,
    ProgramCheckVersion,
    ProgramAck,
    Finish,
    Error,
}

impl FlashPhase {
    /// All phases of a successful run, in order
    pub const SEQUENCE: [FlashPhase; 12] = [
        FlashPhase::Requested,
        FlashPhase::PreOperational,
        FlashPhase::ProgramStopBefore,
        FlashPhase::ProgramClear,
        FlashPhase::ProgramWriteData,
        FlashPhase::ProgramWriteFinish,
        FlashPhase::ProgramStopAfter,
        FlashPhase::ProgramStart,
        FlashPhase::ProgramCheckError,
        FlashPhase::ProgramCheckVersion,
        FlashPhase::ProgramAck,
        FlashPhase::Finish,
    ];

    /// Phase that follows this one on success (None for terminal phases)
    pub fn next(self) -> Option<FlashPhase> {
        if self.is_terminal() {
            return None;
        }
        let pos = Self::SEQUENCE.iter().position(|p| *p == self)?;
        Self::SEQUENCE.get(pos + 1).copied()
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, FlashPhase::Finish | FlashPhase::Error)
    }

    /// True while a worker is driving the device through this phase
    pub fn is_executing(self) -> bool {
        !self.is_terminal() && self != FlashPhase::Requested
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FlashPhase::Requested => "requested",
            FlashPhase::PreOperational => "pre_operational",
            FlashPhase::ProgramStopBefore => "program_stop_before",
            FlashPhase::ProgramClear => "program_clear",
            FlashPhase::ProgramWriteData => "program_write_data",
            FlashPhase::ProgramWriteFinish => "program_write_finish",
            FlashPhase::ProgramStopAfter => "program_stop_after",
            FlashPhase::ProgramStart => "program_start",
            FlashPhase::ProgramCheckError => "program_check_error",
            FlashPhase::ProgramCheckVersion => "program_check_version",
            FlashPhase::ProgramAck => "program_ack",
            FlashPhase::Finish => "finish",
            FlashPhase::Error => "error",
        }
    }

    /// Human-readable description shown to operators
    pub fn description(&self) -> &'static str {
        match self {
            FlashPhase::Requested => "Flash requested",
            FlashPhase::PreOperational => "Flash set PRE-OPERATIONAL",
            FlashPhase::ProgramStopBefore => "Flash program stopping before flashing",
            FlashPhase::ProgramClear => "Flash program data clearing",
            FlashPhase::ProgramWriteData => "Flash program data writing",
            FlashPhase::ProgramWriteFinish => "Flash program check data writing",
            FlashPhase::ProgramStopAfter => "Flash program stopping after flashing",
            FlashPhase::ProgramStart => "Flash program starting application",
            FlashPhase::ProgramCheckError => "Flash program check errors",
            FlashPhase::ProgramCheckVersion => "Flash program check version",
            FlashPhase::ProgramAck => "Flash program acknowledging application",
            FlashPhase::Finish => "Flash program finished",
            FlashPhase::Error => "Flash program finished with error",
        }
    }
}

impl std::fmt::Display for FlashPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FlashPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FlashPhase::SEQUENCE
            .iter()
            .chain(std::iter::once(&FlashPhase::Error))
            .find(|p| p.as_str() == s)
            .copied()
            .ok_or_else(|| format!("Unknown flash phase: '{}'", s))
    }
}

/// Durable progress record of one flash order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlashState {
    pub requested_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub phase: FlashPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FlashState {
    /// Fresh record for an accepted order
    pub fn requested(now: DateTime<Utc>) -> Self {
        Self {
            requested_at: now,
            started_at: None,
            finished_at: None,
            phase: FlashPhase::Requested,
            error: None,
        }
    }

    /// Once `finished_at` is stamped the record must not change again
    pub fn is_terminal(&self) -> bool {
        self.finished_at.is_some()
    }

    /// Apply a phase transition with its timestamp rules.
    ///
    /// `started_at` is stamped on `PreOperational`, `finished_at` on `Finish`
    /// and `Error`. The error message is only recorded together with `Error`.
    /// Transitions must follow [`FlashPhase::SEQUENCE`] one step at a time or
    /// jump to `Error`.
    pub fn advance(
        &mut self,
        phase: FlashPhase,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if self.is_terminal() {
            return Err(StoreError::InvalidTransition {
                from: self.phase,
                to: phase,
            });
        }

        let allowed = phase == FlashPhase::Error || self.phase.next() == Some(phase);
        if !allowed {
            return Err(StoreError::InvalidTransition {
                from: self.phase,
                to: phase,
            });
        }

        match phase {
            FlashPhase::PreOperational => self.started_at = Some(now),
            FlashPhase::Finish => self.finished_at = Some(now),
            FlashPhase::Error => {
                self.finished_at = Some(now);
                self.error = error.map(str::to_string);
            }
            _ => {}
        }
        self.phase = phase;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_next_walks_sequence() {
        let mut phase = FlashPhase::Requested;
        let mut walked = vec![phase];
        while let Some(next) = phase.next() {
            walked.push(next);
            phase = next;
        }
        assert_eq!(walked, FlashPhase::SEQUENCE.to_vec());
        assert_eq!(FlashPhase::Error.next(), None);
    }

    #[test]
    fn test_executing_phases() {
        assert!(!FlashPhase::Requested.is_executing());
        assert!(FlashPhase::ProgramWriteData.is_executing());
        assert!(!FlashPhase::Finish.is_executing());
        assert!(!FlashPhase::Error.is_executing());
    }

    #[test]
    fn test_phase_round_trips_through_name() {
        for phase in FlashPhase::SEQUENCE {
            assert_eq!(phase.as_str().parse::<FlashPhase>().unwrap(), phase);
        }
        assert_eq!("error".parse::<FlashPhase>().unwrap(), FlashPhase::Error);
        assert!("flashing".parse::<FlashPhase>().is_err());
    }

    #[test]
    fn test_advance_stamps_timestamps() {
        let t0 = Utc::now();
        let mut state = FlashState::requested(t0);

        state
            .advance(FlashPhase::PreOperational, None, t0)
            .unwrap();
        assert_eq!(state.started_at, Some(t0));
        assert_eq!(state.finished_at, None);

        for phase in &FlashPhase::SEQUENCE[2..] {
            state.advance(*phase, None, t0).unwrap();
        }
        assert_eq!(state.phase, FlashPhase::Finish);
        assert_eq!(state.finished_at, Some(t0));
        assert_eq!(state.error, None);
    }

    #[test]
    fn test_advance_rejects_skips_and_backward_moves() {
        let now = Utc::now();
        let mut state = FlashState::requested(now);

        assert!(state.advance(FlashPhase::ProgramClear, None, now).is_err());
        state.advance(FlashPhase::PreOperational, None, now).unwrap();
        assert!(state.advance(FlashPhase::Requested, None, now).is_err());
        assert!(state.advance(FlashPhase::PreOperational, None, now).is_err());
        assert_eq!(state.phase, FlashPhase::PreOperational);
    }

    #[test]
    fn test_error_is_terminal() {
        let now = Utc::now();
        let mut state = FlashState::requested(now);
        state
            .advance(FlashPhase::Error, Some("session failed"), now)
            .unwrap();

        assert!(state.is_terminal());
        assert_eq!(state.error.as_deref(), Some("session failed"));
        assert_eq!(state.started_at, None);

        let err = state.advance(FlashPhase::Error, Some("again"), now).unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
        assert_eq!(state.error.as_deref(), Some("session failed"));
    }

    #[test]
    fn test_yaml_layout() {
        let now = Utc::now();
        let mut state = FlashState::requested(now);
        state.advance(FlashPhase::PreOperational, None, now).unwrap();

        let yaml = serde_yaml::to_string(&state).unwrap();
        assert!(yaml.contains("phase: pre_operational"));
        assert!(!yaml.contains("finished_at"));

        let back: FlashState = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back, state);
    }
}
