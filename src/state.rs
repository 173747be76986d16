use crate::{
    control::{InstanceAction, InstanceControlClient, InstanceIdentity},
    inference::InferenceClient,
    lifecycle::{next_state, LifecycleInput, LifecycleState, TransitionRejected},
    session::SessionContext,
    settings::{ControllerSettings, SettingsError},
    timer::{InactivityTimer, TickOutcome},
    transport::{ActivitySignal, RequestTransport},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 64;
const NOTIFICATION_TITLE: &str = "MONAI Label";
const SUCCESS_DURATION_MS: u64 = 2_000;
const ERROR_DURATION_MS: u64 = 5_000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleSnapshot {
    pub lifecycle_state: LifecycleState,
    pub inactivity_estimate_seconds: u64,
    pub status_available: bool,
    pub last_error: Option<String>,
}

impl Default for LifecycleSnapshot {
    fn default() -> Self {
        Self {
            lifecycle_state: LifecycleState::Unknown,
            inactivity_estimate_seconds: 0,
            status_available: true,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum NotificationKind {
    Success,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub title: String,
    pub message: String,
    pub kind: NotificationKind,
    pub duration_ms: u64,
}

impl Notification {
    fn success(message: &str) -> Self {
        Self {
            title: NOTIFICATION_TITLE.to_string(),
            message: message.to_string(),
            kind: NotificationKind::Success,
            duration_ms: SUCCESS_DURATION_MS,
        }
    }

    fn error(message: &str) -> Self {
        Self {
            title: NOTIFICATION_TITLE.to_string(),
            message: message.to_string(),
            kind: NotificationKind::Error,
            duration_ms: ERROR_DURATION_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerEvent {
    Snapshot(LifecycleSnapshot),
    Notification(Notification),
}

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("lifecycle request rejected: {0}")]
    Rejected(#[from] TransitionRejected),
    #[error("controller has been torn down")]
    TornDown,
    #[error("settings error: {0}")]
    Settings(#[from] SettingsError),
}

fn action_notification(action: InstanceAction, succeeded: bool) -> Notification {
    match (action, succeeded) {
        (InstanceAction::Start, true) => Notification::success("Started GPU MonaiLabel Instance!"),
        (InstanceAction::Stop, true) => Notification::success("Stopped GPU MonaiLabel Instance!"),
        (InstanceAction::Start, false) => {
            Notification::error("Failed to Start the GPU MonaiLabel Instance")
        }
        (InstanceAction::Stop, false) => {
            Notification::error("Failed to Stop the GPU MonaiLabel Instance")
        }
    }
}

/// Owns the lifecycle state of one remote instance for one client session.
///
/// Status queries and start/stop results drive the state machine; the
/// inactivity timer runs only while the instance is observed running.
pub struct LifecycleController {
    identity: InstanceIdentity,
    control: InstanceControlClient,
    inference: InferenceClient,
    timer: Arc<InactivityTimer>,
    auto_start_on_open: bool,
    snapshot: Mutex<LifecycleSnapshot>,
    server_info: Mutex<Option<Value>>,
    session: Option<SessionContext>,
    events: broadcast::Sender<ControllerEvent>,
    session_token: CancellationToken,
    timer_token: Mutex<Option<CancellationToken>>,
}

impl LifecycleController {
    pub fn new(
        settings: &ControllerSettings,
        transport: RequestTransport,
    ) -> Result<Self, ControllerError> {
        settings.validate()?;
        let control = InstanceControlClient::new(transport.clone());
        let timer = Arc::new(InactivityTimer::from_settings(control.clone(), settings));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Self {
            identity: InstanceIdentity::from_settings(settings),
            control,
            inference: InferenceClient::new(transport),
            timer,
            auto_start_on_open: settings.auto_start_on_open,
            snapshot: Mutex::new(LifecycleSnapshot::default()),
            server_info: Mutex::new(None),
            session: None,
            events,
            session_token: CancellationToken::new(),
            timer_token: Mutex::new(None),
        })
    }

    pub fn with_session(mut self, session: SessionContext) -> Self {
        self.session = Some(session);
        self
    }

    pub async fn snapshot(&self) -> LifecycleSnapshot {
        self.snapshot.lock().await.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.events.subscribe()
    }

    pub fn identity(&self) -> &InstanceIdentity {
        &self.identity
    }

    /// Inference calls made through this client count as instance activity.
    pub fn inference(&self) -> &InferenceClient {
        &self.inference
    }

    pub fn session(&self) -> Option<&SessionContext> {
        self.session.as_ref()
    }

    pub fn activity(&self) -> &ActivitySignal {
        self.timer.signal()
    }

    pub async fn server_info(&self) -> Option<Value> {
        self.server_info.lock().await.clone()
    }

    pub fn is_torn_down(&self) -> bool {
        self.session_token.is_cancelled()
    }

    /// Establishes the instance state when a viewing session opens. A stopped
    /// instance is started when auto-start is enabled.
    pub async fn open_session(self: &Arc<Self>) -> Result<LifecycleState, ControllerError> {
        let state = self.refresh_status().await?;
        match state {
            LifecycleState::Stopped if self.auto_start_on_open => {
                info!(instance = %self.identity.name(), "auto-starting stopped instance");
                self.request_start().await
            }
            state if state.is_running() => {
                self.load_server_info().await;
                Ok(self.snapshot().await.lifecycle_state)
            }
            state => Ok(state),
        }
    }

    pub async fn request_start(self: &Arc<Self>) -> Result<LifecycleState, ControllerError> {
        self.mutate(InstanceAction::Start).await
    }

    pub async fn request_stop(self: &Arc<Self>) -> Result<LifecycleState, ControllerError> {
        self.mutate(InstanceAction::Stop).await
    }

    /// Stops a running instance, otherwise asks for a start.
    pub async fn toggle(self: &Arc<Self>) -> Result<LifecycleState, ControllerError> {
        if self.snapshot().await.lifecycle_state.is_running() {
            self.request_stop().await
        } else {
            self.request_start().await
        }
    }

    /// Runs one timer step immediately, outside the periodic schedule.
    pub async fn tick_now(&self) -> TickOutcome {
        if self.is_torn_down() {
            return TickOutcome::Discarded;
        }
        let outcome = self.timer.tick(&self.session_token).await;
        self.apply_tick(outcome).await;
        outcome
    }

    /// Cancels the tick schedule. Every later request is rejected and any
    /// reconciliation still in flight is discarded.
    pub async fn teardown(&self) {
        self.session_token.cancel();
        self.timer_token.lock().await.take();
        info!(instance = %self.identity.name(), "lifecycle controller torn down");
    }

    async fn mutate(
        self: &Arc<Self>,
        action: InstanceAction,
    ) -> Result<LifecycleState, ControllerError> {
        let input = match action {
            InstanceAction::Start => LifecycleInput::StartRequested,
            InstanceAction::Stop => LifecycleInput::StopRequested,
        };
        self.transition(input, |snapshot| snapshot.last_error = None)
            .await?;

        let result = match action {
            InstanceAction::Start => self.control.start(&self.identity).await,
            InstanceAction::Stop => self.control.stop(&self.identity).await,
        };
        let succeeded = result.is_ok();
        if let Err(err) = &result {
            warn!(
                action = action.as_str(),
                instance = %self.identity.name(),
                error = %err,
                "instance {} failed",
                action.as_str()
            );
        }
        self.notify(action_notification(action, succeeded));

        let message = result
            .err()
            .map(|err| format!("Failed to {} instance: {err}", action.as_str()));
        self.transition(LifecycleInput::MutationCompleted, |snapshot| {
            if message.is_some() {
                snapshot.last_error = message;
            }
        })
        .await?;

        let state = self.refresh_status().await?;
        if succeeded && state.is_running() {
            self.load_server_info().await;
        }
        Ok(self.snapshot().await.lifecycle_state)
    }

    pub async fn refresh_status(self: &Arc<Self>) -> Result<LifecycleState, ControllerError> {
        self.transition(LifecycleInput::CheckRequested, |_| {}).await?;

        match self.control.is_running(&self.identity).await {
            Ok(running) => {
                let reported = self
                    .transition(LifecycleInput::StatusReported { running }, |snapshot| {
                        snapshot.status_available = true;
                        if running {
                            self.settle_estimate(snapshot);
                        } else {
                            snapshot.inactivity_estimate_seconds = 0;
                        }
                    })
                    .await;
                let state = match reported {
                    Ok(state) => state,
                    Err(ControllerError::Rejected(rejected)) => {
                        debug!(%rejected, "dropping stale status report");
                        return Ok(self.snapshot().await.lifecycle_state);
                    }
                    Err(err) => return Err(err),
                };
                if running {
                    self.ensure_timer_running().await;
                } else {
                    self.stop_timer().await;
                }
                Ok(state)
            }
            Err(err) => {
                warn!(instance = %self.identity.name(), error = %err, "instance status unavailable");
                let message = format!("Instance status unavailable: {err}");
                let state = self
                    .transition(LifecycleInput::StatusFailed, |snapshot| {
                        snapshot.status_available = false;
                        snapshot.last_error = Some(message);
                    })
                    .await;
                match state {
                    Err(ControllerError::Rejected(_)) => Ok(self.snapshot().await.lifecycle_state),
                    other => other,
                }
            }
        }
    }

    async fn load_server_info(&self) {
        match self.inference.info().await {
            Ok(server_info) => {
                if self.is_torn_down() {
                    return;
                }
                *self.server_info.lock().await = Some(server_info);
                self.timer.reset().await;
                {
                    let mut snapshot = self.snapshot.lock().await;
                    snapshot.inactivity_estimate_seconds = 0;
                    self.settle_estimate(&mut snapshot);
                    self.publish(&snapshot);
                }
                self.notify(Notification::success(
                    "Connected to MONAI Label Server - Successful",
                ));
            }
            Err(err) => {
                warn!(error = %err, "failed to load inference server info");
                self.notify(Notification::error("Failed to Connect to MONAI Label Server"));
            }
        }
    }

    /// Starts the tick schedule from a zero estimate unless one already runs.
    async fn ensure_timer_running(self: &Arc<Self>) {
        let token = {
            let mut slot = self.timer_token.lock().await;
            if slot.is_some() || self.is_torn_down() {
                return;
            }
            let token = self.session_token.child_token();
            *slot = Some(token.clone());
            token
        };

        self.timer.reset().await;
        {
            let mut snapshot = self.snapshot.lock().await;
            if self.is_torn_down() {
                return;
            }
            snapshot.inactivity_estimate_seconds = 0;
            self.settle_estimate(&mut snapshot);
            self.publish(&snapshot);
        }

        let timer = self.timer.clone();
        let controller = self.clone();
        let run_token = token.clone();
        tokio::spawn(async move {
            timer
                .run(run_token, move |outcome| {
                    let controller = controller.clone();
                    async move { controller.apply_tick(outcome).await }
                })
                .await;
        });
        debug!(instance = %self.identity.name(), "inactivity timer started");
    }

    async fn stop_timer(&self) {
        if let Some(token) = self.timer_token.lock().await.take() {
            token.cancel();
        }
    }

    async fn apply_tick(&self, outcome: TickOutcome) {
        let Some(estimate_secs) = outcome.estimate_secs() else {
            return;
        };
        let mut snapshot = self.snapshot.lock().await;
        if self.is_torn_down() {
            return;
        }
        snapshot.inactivity_estimate_seconds = estimate_secs;
        self.settle_estimate(&mut snapshot);
        self.publish(&snapshot);
    }

    /// Derives `Running` vs `RunningNearTimeout` from the snapshot's estimate.
    fn settle_estimate(&self, snapshot: &mut LifecycleSnapshot) {
        let near_timeout = self
            .timer
            .is_near_timeout(snapshot.inactivity_estimate_seconds);
        if let Ok(next) = next_state(
            snapshot.lifecycle_state,
            LifecycleInput::EstimateUpdated { near_timeout },
        ) {
            self.record_transition(snapshot, next);
        }
    }

    async fn transition<F>(
        &self,
        input: LifecycleInput,
        update: F,
    ) -> Result<LifecycleState, ControllerError>
    where
        F: FnOnce(&mut LifecycleSnapshot),
    {
        let mut snapshot = self.snapshot.lock().await;
        if self.is_torn_down() {
            return Err(ControllerError::TornDown);
        }
        let next = next_state(snapshot.lifecycle_state, input)?;
        self.record_transition(&mut snapshot, next);
        update(&mut *snapshot);
        self.publish(&snapshot);
        Ok(snapshot.lifecycle_state)
    }

    fn record_transition(&self, snapshot: &mut LifecycleSnapshot, next: LifecycleState) {
        if snapshot.lifecycle_state != next {
            info!(
                instance = %self.identity.name(),
                from = %snapshot.lifecycle_state,
                to = %next,
                "lifecycle transition"
            );
        }
        snapshot.lifecycle_state = next;
    }

    fn publish(&self, snapshot: &LifecycleSnapshot) {
        let _ = self.events.send(ControllerEvent::Snapshot(snapshot.clone()));
    }

    fn notify(&self, notification: Notification) {
        let _ = self.events.send(ControllerEvent::Notification(notification));
    }
}
