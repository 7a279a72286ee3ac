//! Notification gate: signature comparison plus cooldown.
//!
//! The gate only decides. Callers persist the current window for every decision
//! except [`GateDecision::Unchanged`], whether or not a notification goes out.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Idle,
    ChangedPending,
    CoolingDown,
    Notified,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// Signature matches the persisted one.
    Unchanged,
    /// First window ever observed; recorded without notifying.
    Baseline,
    Notify,
    /// Change detected inside the cooldown window.
    Suppress { remaining: TimeDelta },
}

impl GateDecision {
    /// Terminal state reached for this cycle.
    pub fn state(&self) -> GateState {
        match self {
            GateDecision::Unchanged | GateDecision::Baseline => GateState::Idle,
            GateDecision::Notify => GateState::Notified,
            GateDecision::Suppress { .. } => GateState::CoolingDown,
        }
    }

    pub fn persists_window(&self) -> bool {
        !matches!(self, GateDecision::Unchanged)
    }
}

#[derive(Debug, Clone)]
pub struct NotificationGate {
    cooldown: TimeDelta,
    notify_on_first_run: bool,
}

impl NotificationGate {
    pub fn new(cooldown: Duration, notify_on_first_run: bool) -> Self {
        Self {
            cooldown: TimeDelta::from_std(cooldown).unwrap_or(TimeDelta::MAX),
            notify_on_first_run,
        }
    }

    /// `Idle` when the signature is unchanged, `ChangedPending` otherwise.
    pub fn detect(&self, current: &str, previous: Option<&str>) -> GateState {
        match previous {
            Some(prev) if prev == current => GateState::Idle,
            _ => GateState::ChangedPending,
        }
    }

    pub fn evaluate(
        &self,
        current: &str,
        previous: Option<&str>,
        last_sent_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> GateDecision {
        if self.detect(current, previous) == GateState::Idle {
            return GateDecision::Unchanged;
        }
        if previous.is_none() && !self.notify_on_first_run {
            return GateDecision::Baseline;
        }
        match last_sent_at {
            None => GateDecision::Notify,
            Some(sent) => {
                let elapsed = now - sent;
                if elapsed >= self.cooldown {
                    GateDecision::Notify
                } else {
                    // Saturates when `last_sent_at` lies ahead of `now`.
                    GateDecision::Suppress {
                        remaining: self
                            .cooldown
                            .checked_sub(&elapsed)
                            .unwrap_or(TimeDelta::MAX),
                    }
                }
            }
        }
    }
}
