//! Cycle orchestration: one fetch-to-persist pass per cycle, and the polling loop around it.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use jobwatch_adapters::{ListingError, ListingSource, Normalizer};
use jobwatch_core::{Job, RunHistoryEntry};
use jobwatch_storage::{StateStore, StorageError};
use rand::Rng;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::MonitorConfig;
use crate::gate::{GateDecision, NotificationGate};
use crate::notify::{compose_message, Notifier};
use crate::window::{diff, snapshot, WindowError};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Source of the pause between two cycles.
pub trait DelayProvider: Send + Sync {
    fn next_delay(&self) -> Duration;
}

/// Uniform whole-second delay in `[min_secs, max_secs]`.
#[derive(Debug, Clone, Copy)]
pub struct JitterDelay {
    pub min_secs: u64,
    pub max_secs: u64,
}

impl JitterDelay {
    pub fn from_config(config: &MonitorConfig) -> Self {
        Self {
            min_secs: config.poll_min_secs,
            max_secs: config.poll_max_secs,
        }
    }
}

impl DelayProvider for JitterDelay {
    fn next_delay(&self) -> Duration {
        let (lo, hi) = if self.min_secs <= self.max_secs {
            (self.min_secs, self.max_secs)
        } else {
            (self.max_secs, self.min_secs)
        };
        Duration::from_secs(rand::thread_rng().gen_range(lo..=hi))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedDelay(pub Duration);

impl DelayProvider for FixedDelay {
    fn next_delay(&self) -> Duration {
        self.0
    }
}

#[derive(Debug, Error)]
pub enum CycleError {
    #[error("listing unavailable: {0}")]
    Fetch(#[from] ListingError),
    #[error(transparent)]
    Window(#[from] WindowError),
    #[error("state store: {0}")]
    Storage(#[from] StorageError),
}

impl CycleError {
    /// Expected, retry-next-cycle conditions as opposed to real faults.
    pub fn is_skip(&self) -> bool {
        matches!(
            self,
            CycleError::Fetch(_) | CycleError::Window(WindowError::Insufficient { .. })
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    NoChange,
    Baseline {
        signature: String,
    },
    Notified {
        signature: String,
        entered: Vec<String>,
        left: Vec<String>,
    },
    Suppressed {
        signature: String,
        remaining_secs: i64,
    },
    /// Change persisted but the transport failed; the cooldown clock was not reset.
    NotifyFailed {
        signature: String,
        error: String,
    },
    Skipped {
        reason: String,
    },
    Failed {
        error: String,
    },
}

impl CycleOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            CycleOutcome::NoChange => "no-change",
            CycleOutcome::Baseline { .. } => "baseline",
            CycleOutcome::Notified { .. } => "change-notified",
            CycleOutcome::Suppressed { .. } => "change-suppressed",
            CycleOutcome::NotifyFailed { .. } => "notify-failed",
            CycleOutcome::Skipped { .. } => "skipped",
            CycleOutcome::Failed { .. } => "errored",
        }
    }

    fn log(&self) {
        let outcome = self.label();
        match self {
            CycleOutcome::NoChange => info!(outcome, "top-K window unchanged"),
            CycleOutcome::Baseline { signature } => {
                info!(outcome, %signature, "recorded first top-K window")
            }
            CycleOutcome::Notified {
                signature,
                entered,
                left,
            } => info!(
                outcome,
                %signature,
                entered = entered.len(),
                left = left.len(),
                "top-K window changed; notification sent"
            ),
            CycleOutcome::Suppressed {
                signature,
                remaining_secs,
            } => info!(
                outcome,
                %signature,
                remaining_secs,
                "top-K window changed; notification suppressed by cooldown"
            ),
            CycleOutcome::NotifyFailed { signature, error } => {
                error!(outcome, %signature, %error, "top-K window changed; notification failed")
            }
            CycleOutcome::Skipped { reason } => warn!(outcome, %reason, "cycle skipped"),
            CycleOutcome::Failed { error } => error!(outcome, %error, "cycle failed"),
        }
    }
}

/// Stop condition for [`Monitor::run_loop`].
#[derive(Debug, Clone, Default)]
pub struct LoopControl {
    /// `None` runs until cancelled.
    pub max_cycles: Option<usize>,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopSummary {
    pub cycles: usize,
    pub no_change: usize,
    pub baseline: usize,
    pub notified: usize,
    pub suppressed: usize,
    pub notify_failed: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl LoopSummary {
    fn record(&mut self, outcome: &CycleOutcome) {
        self.cycles += 1;
        let slot = match outcome {
            CycleOutcome::NoChange => &mut self.no_change,
            CycleOutcome::Baseline { .. } => &mut self.baseline,
            CycleOutcome::Notified { .. } => &mut self.notified,
            CycleOutcome::Suppressed { .. } => &mut self.suppressed,
            CycleOutcome::NotifyFailed { .. } => &mut self.notify_failed,
            CycleOutcome::Skipped { .. } => &mut self.skipped,
            CycleOutcome::Failed { .. } => &mut self.failed,
        };
        *slot += 1;
    }
}

pub struct Monitor {
    config: MonitorConfig,
    normalizer: Normalizer,
    gate: NotificationGate,
    source: Arc<dyn ListingSource>,
    store: Arc<dyn StateStore>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
}

impl Monitor {
    pub fn new(
        config: MonitorConfig,
        source: Arc<dyn ListingSource>,
        store: Arc<dyn StateStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            normalizer: Normalizer::new(config.job_url_base.clone()),
            gate: NotificationGate::new(config.cooldown(), config.notify_on_first_run),
            config,
            source,
            store,
            notifier,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Run one isolated cycle. Every failure is folded into the returned outcome.
    pub async fn run_cycle(&self) -> CycleOutcome {
        let run_id = Uuid::new_v4();
        let span = info_span!("cycle", %run_id, source = self.source.source_id());
        async {
            let outcome = match self.execute(run_id).await {
                Ok(outcome) => outcome,
                Err(err) if err.is_skip() => CycleOutcome::Skipped {
                    reason: err.to_string(),
                },
                Err(err) => CycleOutcome::Failed {
                    error: err.to_string(),
                },
            };
            outcome.log();
            outcome
        }
        .instrument(span)
        .await
    }

    async fn execute(&self, run_id: Uuid) -> Result<CycleOutcome, CycleError> {
        let now = self.clock.now();
        let k = self.config.top_k;

        let raw = self.source.fetch_listing().await?;
        let jobs: Vec<Job> = raw
            .iter()
            .take(k)
            .map(|entry| self.normalizer.normalize(entry, now))
            .collect();
        let current = snapshot(&jobs, k, now).map_err(|err| match err {
            WindowError::Insufficient { needed, .. } => WindowError::Insufficient {
                needed,
                available: raw.len(),
            },
            other => other,
        })?;
        let duplicates = current.duplicate_ids();
        if !duplicates.is_empty() {
            warn!(ids = ?duplicates, "duplicate ids inside top-K window");
        }

        let state = self.store.load_state().await?;
        self.store
            .append_run(&RunHistoryEntry {
                run_id,
                recorded_at: now,
                signature: current.signature.clone(),
                snapshot: current.clone(),
            })
            .await?;

        let decision = self.gate.evaluate(
            &current.signature,
            state.last_window_signature.as_deref(),
            state.last_notification_sent_at,
            now,
        );
        if !decision.persists_window() {
            return Ok(CycleOutcome::NoChange);
        }

        let signature = current.signature.clone();
        let (sent_at, outcome) = match decision {
            GateDecision::Notify => {
                let changes = diff(state.last_window_snapshot.as_ref(), &current);
                let message = compose_message(&self.config, &current, &changes, now);
                match self.notifier.send(&message.subject, &message.body).await {
                    Ok(()) => (
                        Some(now),
                        CycleOutcome::Notified {
                            signature,
                            entered: changes.entered,
                            left: changes.left,
                        },
                    ),
                    Err(err) => (
                        None,
                        CycleOutcome::NotifyFailed {
                            signature,
                            error: format!("{} notifier: {err}", self.notifier.name()),
                        },
                    ),
                }
            }
            GateDecision::Suppress { remaining } => (
                None,
                CycleOutcome::Suppressed {
                    signature,
                    remaining_secs: remaining.num_seconds(),
                },
            ),
            GateDecision::Baseline | GateDecision::Unchanged => {
                (None, CycleOutcome::Baseline { signature })
            }
        };
        self.store.commit_window(&current, sent_at).await?;
        debug!(gate_state = ?decision.state(), "window committed");
        Ok(outcome)
    }

    /// Run cycles back to back with a provider-chosen pause between them, until
    /// `max_cycles` is reached or `cancel` fires. An in-flight cycle always completes.
    pub async fn run_loop(&self, delays: &dyn DelayProvider, control: &LoopControl) -> LoopSummary {
        let mut summary = LoopSummary::default();
        loop {
            if control.cancel.is_cancelled() {
                info!("monitor loop cancelled");
                break;
            }
            if control.max_cycles.is_some_and(|max| summary.cycles >= max) {
                break;
            }

            let outcome = self.run_cycle().await;
            summary.record(&outcome);

            if control.max_cycles.is_some_and(|max| summary.cycles >= max) {
                break;
            }
            let delay = delays.next_delay();
            info!(delay_secs = delay.as_secs(), "sleeping until next cycle");
            tokio::select! {
                _ = control.cancel.cancelled() => {
                    info!("monitor loop cancelled");
                    break;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_within_bounds() {
        let jitter = JitterDelay {
            min_secs: 120,
            max_secs: 180,
        };
        for _ in 0..200 {
            let secs = jitter.next_delay().as_secs();
            assert!((120..=180).contains(&secs), "{secs} out of range");
        }
        let degenerate = JitterDelay {
            min_secs: 7,
            max_secs: 7,
        };
        assert_eq!(degenerate.next_delay(), Duration::from_secs(7));
    }

    #[test]
    fn skip_classification_follows_error_taxonomy() {
        assert!(CycleError::Fetch(ListingError::Empty("page".into())).is_skip());
        assert!(CycleError::Window(WindowError::Insufficient {
            needed: 5,
            available: 2
        })
        .is_skip());
        assert!(!CycleError::Window(WindowError::ZeroSize).is_skip());
        assert!(!CycleError::Storage(StorageError::InvalidValue {
            context: "state".into(),
            message: "bad".into()
        })
        .is_skip());
    }

    #[test]
    fn summary_counts_each_outcome() {
        let mut summary = LoopSummary::default();
        summary.record(&CycleOutcome::NoChange);
        summary.record(&CycleOutcome::Skipped {
            reason: "empty".into(),
        });
        summary.record(&CycleOutcome::NoChange);
        assert_eq!(summary.cycles, 3);
        assert_eq!(summary.no_change, 2);
        assert_eq!(summary.skipped, 1);
    }
}
