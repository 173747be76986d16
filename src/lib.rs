pub mod control;
pub mod inference;
pub mod lifecycle;
pub mod session;
pub mod settings;
pub mod state;
pub mod timer;
pub mod transport;

use settings::{access_token_from_env, SettingsError, SettingsStore};
use state::{ControllerEvent, LifecycleController};
use std::sync::Arc;
use tracing::{info, warn};
use transport::{Credential, RequestTransport};

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    Settings(#[from] SettingsError),
    #[error("{0}")]
    Controller(#[from] state::ControllerError),
    #[error("failed to set up HTTP transport: {0}")]
    Transport(#[from] transport::TransportError),
    #[error("failed to wait for shutdown signal: {0}")]
    Signal(#[source] std::io::Error),
}

/// Opens a session against the configured instance and keeps the lifecycle
/// controller alive until Ctrl-C.
pub async fn run() -> Result<(), AppError> {
    let store = SettingsStore::new()?;
    let settings = store.load()?.with_env_overrides();
    let credential = Credential::new(access_token_from_env()?);
    let transport = RequestTransport::http(&settings, credential)?;
    let controller = Arc::new(LifecycleController::new(&settings, transport)?);

    let mut events = controller.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ControllerEvent::Snapshot(snapshot) => info!(
                    state = %snapshot.lifecycle_state,
                    estimate_secs = snapshot.inactivity_estimate_seconds,
                    status_available = snapshot.status_available,
                    "lifecycle snapshot"
                ),
                ControllerEvent::Notification(notification) => {
                    info!(kind = ?notification.kind, "{}: {}", notification.title, notification.message)
                }
            }
        }
    });

    info!(
        zone = %controller.identity().zone(),
        instance = %controller.identity().name(),
        settings = %store.path().display(),
        "opening session"
    );
    if let Err(err) = controller.open_session().await {
        warn!(error = %err, "session open did not complete");
    }

    let shutdown = tokio::signal::ctrl_c().await;
    controller.teardown().await;
    shutdown.map_err(AppError::Signal)
}
