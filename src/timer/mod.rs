use crate::{
    control::InstanceControlClient,
    settings::ControllerSettings,
    transport::ActivitySignal,
};
use std::{future::Future, time::Duration};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const DEFAULT_TICK_PERIOD_SECS: u64 = 15;
pub const DEFAULT_RECONCILE_THRESHOLD_SECS: u64 = 1_500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Activity was observed since the previous tick.
    Reset,
    Advanced { estimate_secs: u64 },
    Reconciled { estimate_secs: u64 },
    ReconcileFailed { estimate_secs: u64 },
    /// Teardown happened while reconciliation was in flight.
    Discarded,
}

impl TickOutcome {
    pub fn estimate_secs(self) -> Option<u64> {
        match self {
            Self::Reset => Some(0),
            Self::Advanced { estimate_secs }
            | Self::Reconciled { estimate_secs }
            | Self::ReconcileFailed { estimate_secs } => Some(estimate_secs),
            Self::Discarded => None,
        }
    }
}

pub struct InactivityTimer {
    control: InstanceControlClient,
    signal: ActivitySignal,
    estimate_secs: Mutex<u64>,
    tick_lock: Mutex<()>,
    step_secs: u64,
    threshold_secs: u64,
}

impl InactivityTimer {
    pub fn new(control: InstanceControlClient, step_secs: u64, threshold_secs: u64) -> Self {
        let signal = control.transport().activity().clone();
        Self {
            control,
            signal,
            estimate_secs: Mutex::new(0),
            tick_lock: Mutex::new(()),
            step_secs,
            threshold_secs,
        }
    }

    pub fn from_settings(control: InstanceControlClient, settings: &ControllerSettings) -> Self {
        Self::new(
            control,
            settings.tick_period_secs,
            settings.reconcile_threshold_secs,
        )
    }

    pub fn with_initial_estimate(mut self, estimate_secs: u64) -> Self {
        self.estimate_secs = Mutex::new(estimate_secs);
        self
    }

    pub fn period(&self) -> Duration {
        Duration::from_secs(self.step_secs)
    }

    pub fn threshold_secs(&self) -> u64 {
        self.threshold_secs
    }

    pub fn is_near_timeout(&self, estimate_secs: u64) -> bool {
        estimate_secs >= self.threshold_secs
    }

    pub fn signal(&self) -> &ActivitySignal {
        &self.signal
    }

    pub async fn estimate_secs(&self) -> u64 {
        *self.estimate_secs.lock().await
    }

    pub async fn reset(&self) {
        *self.estimate_secs.lock().await = 0;
    }

    /// One coordinator step. Ticks are serialized by `tick_lock`; the
    /// estimate itself is only locked around reads and writes, so `reset`
    /// never waits on a reconciliation fetch.
    pub async fn tick(&self, cancel: &CancellationToken) -> TickOutcome {
        let _serial = self.tick_lock.lock().await;
        let pre_tick = {
            let mut estimate = self.estimate_secs.lock().await;
            if self.signal.take() {
                *estimate = 0;
                return TickOutcome::Reset;
            }
            let pre_tick = *estimate;
            let advanced = pre_tick.saturating_add(self.step_secs);
            if advanced < self.threshold_secs {
                *estimate = advanced;
                return TickOutcome::Advanced {
                    estimate_secs: advanced,
                };
            }
            pre_tick
        };

        let reconciled = self.control.fetch_elapsed_inactivity().await;
        if cancel.is_cancelled() {
            return TickOutcome::Discarded;
        }
        match reconciled {
            Ok(remote_secs) => {
                *self.estimate_secs.lock().await = remote_secs;
                TickOutcome::Reconciled {
                    estimate_secs: remote_secs,
                }
            }
            Err(err) => {
                debug!(error = %err, estimate_secs = pre_tick, "inactivity reconciliation failed; retrying next tick");
                TickOutcome::ReconcileFailed {
                    estimate_secs: pre_tick,
                }
            }
        }
    }

    /// Ticks every period until `cancel` fires. The next sleep only starts once
    /// `on_tick` for the previous tick has completed.
    pub async fn run<F, Fut>(&self, cancel: CancellationToken, mut on_tick: F)
    where
        F: FnMut(TickOutcome) -> Fut,
        Fut: Future<Output = ()>,
    {
        let period = self.period();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(period) => {}
            }
            let outcome = self.tick(&cancel).await;
            if cancel.is_cancelled() {
                break;
            }
            on_tick(outcome).await;
        }
        debug!("inactivity timer stopped");
    }
}
