//! Background minute-bar prefetch.
//!
//! After the session close the minute cache is warmed for the instruments a
//! user is most likely to open: the configured index codes plus the top
//! stocks by traded amount, over the most recent trading dates. Progress is
//! persisted after every date batch so a crashed run is visible and a
//! finished run is never repeated the same day. The run itself happens on a
//! detached thread; an atomic flag keeps it single-flight per process.

use crate::config::PrefetchSettings;
use crate::domain::{Instrument, Period};
use crate::minute::MinuteBarCache;
use crate::orchestrator::FetchOrchestrator;
use crate::store::KvStore;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const STATE_KEY: &str = "prefetch/state.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrefetchStatus {
    Pending,
    Running,
    /// Every task in the plan succeeded.
    Done,
    /// The run finished but some tasks failed.
    Partial,
}

/// Persisted progress of the latest prefetch run, keyed by trigger date.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrefetchState {
    /// The day the run was triggered for.
    pub date: NaiveDate,
    pub status: PrefetchStatus,
    pub success: usize,
    pub failed: usize,
    pub updated: NaiveDateTime,
}

/// One date's worth of instruments to warm.
#[derive(Debug, Clone)]
pub struct PrefetchBatch {
    pub date: NaiveDate,
    pub instruments: Vec<Instrument>,
}

pub struct PrefetchScheduler {
    store: Arc<dyn KvStore>,
    minute: Arc<MinuteBarCache>,
    settings: PrefetchSettings,
    period: Period,
    running: AtomicBool,
}

impl PrefetchScheduler {
    pub fn new(
        store: Arc<dyn KvStore>,
        minute: Arc<MinuteBarCache>,
        settings: PrefetchSettings,
        period: Period,
    ) -> Self {
        Self {
            store,
            minute,
            settings,
            period,
            running: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> Option<PrefetchState> {
        let bytes = self.store.get(STATE_KEY)?;
        serde_json::from_slice(&bytes).ok()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Whether the auto-trigger should fire: enabled, past the trigger
    /// time on a trading day, and not already run for `trigger_date`.
    pub fn should_autostart(
        &self,
        trigger_date: NaiveDate,
        now: NaiveTime,
        is_trading_day: bool,
    ) -> bool {
        if !self.settings.enabled || !is_trading_day {
            return false;
        }
        let trigger = crate::config::parse_hhmm(&self.settings.trigger_time)
            .unwrap_or_else(|| NaiveTime::from_hms_opt(15, 15, 0).unwrap());
        if now < trigger {
            return false;
        }
        // A run in flight (this or another process) or a completed one is
        // not restarted; a partial run may re-trigger later the same day so
        // its failed tasks get another chance.
        match self.state() {
            Some(state) if state.date == trigger_date => !matches!(
                state.status,
                PrefetchStatus::Running | PrefetchStatus::Done
            ),
            _ => true,
        }
    }

    /// Run the plan on a detached thread. Returns `false` when a run is
    /// already in flight.
    pub fn start_detached(
        self: &Arc<Self>,
        trigger_date: NaiveDate,
        plan: Vec<PrefetchBatch>,
    ) -> bool {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            info!("prefetch already running, not starting another");
            return false;
        }
        let scheduler = Arc::clone(self);
        std::thread::Builder::new()
            .name("quotevault-prefetch".into())
            .spawn(move || {
                scheduler.run_plan(trigger_date, plan);
                scheduler.running.store(false, Ordering::SeqCst);
            })
            .map(|_| true)
            .unwrap_or_else(|e| {
                warn!(error = %e, "failed to spawn prefetch thread");
                self.running.store(false, Ordering::SeqCst);
                false
            })
    }

    /// Synchronous worker. Each date batch runs serially with the
    /// configured delay and acts as a barrier: state is persisted with
    /// cumulative counts before the next date starts.
    pub fn run_plan(&self, trigger_date: NaiveDate, plan: Vec<PrefetchBatch>) {
        let total_tasks: usize = plan.iter().map(|b| b.instruments.len()).sum();
        info!(
            %trigger_date,
            dates = plan.len(),
            tasks = total_tasks,
            "prefetch run starting"
        );

        let mut state = PrefetchState {
            date: trigger_date,
            status: PrefetchStatus::Running,
            success: 0,
            failed: 0,
            updated: chrono::Local::now().naive_local(),
        };
        self.persist(&state);

        let orchestrator =
            FetchOrchestrator::serial(Duration::from_secs_f64(self.settings.delay_secs.max(0.0)));
        for batch in plan {
            let date = batch.date;
            let period = self.period;
            let report = orchestrator.run(batch.instruments, |instrument| {
                self.minute.fetch(instrument, date, period)
            });
            for (instrument, err) in &report.failures {
                warn!(%instrument, %date, error = %err, "prefetch task failed");
            }
            info!(
                %date,
                success = report.stats.success,
                failed = report.stats.failed,
                cache_hits = report.stats.cache_hits,
                "prefetch date batch finished"
            );

            state.success += report.stats.success;
            state.failed += report.stats.failed;
            state.updated = chrono::Local::now().naive_local();
            self.persist(&state);
        }

        state.status = if state.failed == 0 {
            PrefetchStatus::Done
        } else {
            PrefetchStatus::Partial
        };
        state.updated = chrono::Local::now().naive_local();
        self.persist(&state);
        info!(
            status = ?state.status,
            success = state.success,
            failed = state.failed,
            "prefetch run finished"
        );
    }

    fn persist(&self, state: &PrefetchState) {
        match serde_json::to_vec_pretty(state) {
            Ok(bytes) => {
                if let Err(e) = self.store.put(STATE_KEY, &bytes) {
                    warn!(error = %e, "failed to persist prefetch state");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize prefetch state"),
        }
    }
}
