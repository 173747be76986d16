use gpuwarden_core_lib::{
    lifecycle::{LifecycleState, TransitionRejected},
    session::{DisplaySetInfo, SessionContext},
    settings::ControllerSettings,
    state::{ControllerError, ControllerEvent, LifecycleController, NotificationKind},
    timer::TickOutcome,
    transport::{
        Credential, HttpMethod, RequestTransport, ScriptedExchange, ScriptedReply, TransportError,
    },
};
use serde_json::json;
use std::{sync::Arc, time::Duration};

const STATUS_PATH: &str = "is_running/us-east4-c/monai-gpu";

fn controller(exchange: &ScriptedExchange, auto_start: bool) -> Arc<LifecycleController> {
    let settings = ControllerSettings {
        auto_start_on_open: auto_start,
        ..ControllerSettings::default()
    };
    let transport =
        RequestTransport::scripted(&settings, Credential::new("test-token"), exchange.clone());
    Arc::new(LifecycleController::new(&settings, transport).expect("controller should build"))
}

async fn wait_for_state(controller: &LifecycleController, expected: LifecycleState) {
    for _ in 0..400 {
        if controller.snapshot().await.lifecycle_state == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("controller never reached {expected}");
}

fn notification_messages(
    events: &mut tokio::sync::broadcast::Receiver<ControllerEvent>,
) -> Vec<(NotificationKind, String)> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let ControllerEvent::Notification(notification) = event {
            out.push((notification.kind, notification.message));
        }
    }
    out
}

async fn drive_to_near_timeout(controller: &LifecycleController) {
    for _ in 0..100 {
        controller.tick_now().await;
    }
    let snapshot = controller.snapshot().await;
    assert_eq!(snapshot.lifecycle_state, LifecycleState::RunningNearTimeout);
    assert_eq!(snapshot.inactivity_estimate_seconds, 1_600);
}

#[tokio::test]
async fn stopped_instance_is_started_and_tracked_to_750_seconds() {
    let exchange = ScriptedExchange::new();
    exchange.push(HttpMethod::Get, STATUS_PATH, ScriptedReply::ok_json(json!({"data": false})));
    exchange.push(HttpMethod::Get, STATUS_PATH, ScriptedReply::ok_json(json!({"data": true})));
    exchange.push(HttpMethod::Post, "start", ScriptedReply::ok_json(json!({"status": "ok"})));
    exchange.push(HttpMethod::Get, "info", ScriptedReply::ok_json(json!({"models": {}})));
    let controller = controller(&exchange, true);
    let mut events = controller.subscribe();

    let state = controller.open_session().await.expect("open should succeed");

    assert_eq!(state, LifecycleState::Running);
    assert_eq!(controller.snapshot().await.inactivity_estimate_seconds, 0);
    assert_eq!(exchange.call_count(HttpMethod::Post, "start"), 1);

    let mut seen_states = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let ControllerEvent::Snapshot(snapshot) = event {
            if seen_states.last() != Some(&snapshot.lifecycle_state) {
                seen_states.push(snapshot.lifecycle_state);
            }
        }
    }
    assert_eq!(
        seen_states,
        vec![
            LifecycleState::CheckingStatus,
            LifecycleState::Stopped,
            LifecycleState::Starting,
            LifecycleState::CheckingStatus,
            LifecycleState::Running,
        ]
    );

    for tick in 1..=100 {
        if tick == 50 {
            controller
                .inference()
                .info()
                .await
                .expect("inference call should succeed");
        }
        controller.tick_now().await;
    }

    let snapshot = controller.snapshot().await;
    assert_eq!(snapshot.inactivity_estimate_seconds, 750);
    assert_eq!(snapshot.lifecycle_state, LifecycleState::Running);
    assert_eq!(exchange.call_count(HttpMethod::Get, "timer_elapsed"), 0);
    controller.teardown().await;
}

#[tokio::test]
async fn second_start_while_starting_is_rejected_without_network_call() {
    let exchange = ScriptedExchange::new();
    exchange.push(HttpMethod::Get, STATUS_PATH, ScriptedReply::ok_json(json!({"data": false})));
    exchange.push(HttpMethod::Get, STATUS_PATH, ScriptedReply::ok_json(json!({"data": true})));
    exchange.push(
        HttpMethod::Post,
        "start",
        ScriptedReply::ok_json(json!({"status": "ok"})).with_latency(Duration::from_millis(300)),
    );
    exchange.push(HttpMethod::Get, "info", ScriptedReply::ok_json(json!({})));
    let controller = controller(&exchange, false);
    controller.open_session().await.expect("open should succeed");

    let first = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.request_start().await })
    };
    wait_for_state(&controller, LifecycleState::Starting).await;

    let err = controller
        .request_start()
        .await
        .expect_err("duplicate start should be rejected");
    assert!(matches!(
        err,
        ControllerError::Rejected(TransitionRejected::InFlight(LifecycleState::Starting))
    ));

    let state = first
        .await
        .expect("start task should join")
        .expect("first start should complete");
    assert_eq!(state, LifecycleState::Running);
    assert_eq!(exchange.call_count(HttpMethod::Post, "start"), 1);
    controller.teardown().await;
}

#[tokio::test]
async fn failed_status_query_keeps_checking_and_recovers() {
    let exchange = ScriptedExchange::new();
    exchange.push(
        HttpMethod::Get,
        STATUS_PATH,
        ScriptedReply::network_failure("connection reset"),
    );
    let controller = controller(&exchange, true);

    let state = controller.open_session().await.expect("open should resolve");

    assert_eq!(state, LifecycleState::CheckingStatus);
    let snapshot = controller.snapshot().await;
    assert!(!snapshot.status_available);
    assert!(snapshot
        .last_error
        .as_deref()
        .is_some_and(|message| message.contains("status unavailable")));
    assert_eq!(exchange.call_count(HttpMethod::Post, "start"), 0);

    exchange.replace(HttpMethod::Get, STATUS_PATH, ScriptedReply::ok_json(json!({"data": true})));
    let state = controller.refresh_status().await.expect("refresh should resolve");
    assert_eq!(state, LifecycleState::Running);
    assert!(controller.snapshot().await.status_available);
    controller.teardown().await;
}

#[tokio::test]
async fn non_success_inference_call_does_not_reset_estimate() {
    let exchange = ScriptedExchange::new();
    exchange.push(HttpMethod::Get, STATUS_PATH, ScriptedReply::ok_json(json!({"data": true})));
    exchange.push(HttpMethod::Get, "info", ScriptedReply::ok_json(json!({})));
    let controller = controller(&exchange, false);
    controller.open_session().await.expect("open should succeed");
    assert_eq!(controller.tick_now().await, TickOutcome::Reset);
    assert_eq!(
        controller.tick_now().await,
        TickOutcome::Advanced { estimate_secs: 15 }
    );

    exchange.replace(HttpMethod::Get, "info", ScriptedReply::status(500));
    let err = controller
        .inference()
        .info()
        .await
        .expect_err("500 should fail");
    assert_eq!(err, TransportError::HttpStatus(500));
    assert!(!controller.activity().is_raised());

    assert_eq!(
        controller.tick_now().await,
        TickOutcome::Advanced { estimate_secs: 30 }
    );
    controller.teardown().await;
}

#[tokio::test]
async fn stop_rederives_stopped_state_from_status() {
    let exchange = ScriptedExchange::new();
    exchange.push(HttpMethod::Get, STATUS_PATH, ScriptedReply::ok_json(json!({"data": true})));
    exchange.push(HttpMethod::Get, STATUS_PATH, ScriptedReply::ok_json(json!({"data": false})));
    exchange.push(HttpMethod::Get, "info", ScriptedReply::ok_json(json!({})));
    exchange.push(HttpMethod::Post, "stop", ScriptedReply::ok_json(json!({"status": "ok"})));
    let controller = controller(&exchange, false);
    controller.open_session().await.expect("open should succeed");

    let state = controller.toggle().await.expect("toggle should stop");

    assert_eq!(state, LifecycleState::Stopped);
    assert_eq!(exchange.call_count(HttpMethod::Post, "stop"), 1);
    assert_eq!(exchange.call_count(HttpMethod::Get, "info"), 1);
    controller.teardown().await;
}

#[tokio::test]
async fn teardown_discards_in_flight_reconciliation_and_rejects_requests() {
    let exchange = ScriptedExchange::new();
    exchange.push(HttpMethod::Get, STATUS_PATH, ScriptedReply::ok_json(json!({"data": true})));
    exchange.push(
        HttpMethod::Get,
        "timer_elapsed",
        ScriptedReply::ok_json(json!({"data": 12})).with_latency(Duration::from_millis(200)),
    );
    let controller = controller(&exchange, false);
    controller.refresh_status().await.expect("status should resolve");
    for _ in 0..99 {
        controller.tick_now().await;
    }
    assert_eq!(controller.snapshot().await.inactivity_estimate_seconds, 1_485);

    let reconciling = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.tick_now().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    controller.teardown().await;

    let outcome = reconciling.await.expect("tick task should join");
    assert_eq!(outcome, TickOutcome::Discarded);
    assert_eq!(controller.snapshot().await.inactivity_estimate_seconds, 1_485);
    assert_eq!(controller.tick_now().await, TickOutcome::Discarded);
    assert!(matches!(
        controller.request_stop().await,
        Err(ControllerError::TornDown)
    ));
    assert!(controller.is_torn_down());
}

#[tokio::test]
async fn session_context_is_carried_read_only() {
    let exchange = ScriptedExchange::new();
    let settings = ControllerSettings::default();
    let transport =
        RequestTransport::scripted(&settings, Credential::new("test-token"), exchange.clone());
    let session = SessionContext::from_display_set(&DisplaySetInfo {
        patient_id: "PAT-9".to_string(),
        study_instance_uid: "1.2.3".to_string(),
        series_instance_uid: "1.2.3.4".to_string(),
        display_set_instance_uid: "ds-9".to_string(),
        image_ids: vec!["wadors:1".to_string(), "wadors:2".to_string()],
    })
    .expect("session context should build");

    let controller = LifecycleController::new(&settings, transport)
        .expect("controller should build")
        .with_session(session.clone());

    assert_eq!(controller.session(), Some(&session));
    assert_eq!(
        controller.session().and_then(|context| context.frame_index("wadors:2")),
        Some(1)
    );
    assert_eq!(controller.snapshot().await.lifecycle_state, LifecycleState::Unknown);
}

#[tokio::test]
async fn restart_after_near_timeout_starts_from_zero_estimate() {
    let exchange = ScriptedExchange::new();
    exchange.push(HttpMethod::Get, STATUS_PATH, ScriptedReply::ok_json(json!({"data": true})));
    exchange.push(HttpMethod::Get, STATUS_PATH, ScriptedReply::ok_json(json!({"data": false})));
    exchange.push(HttpMethod::Get, STATUS_PATH, ScriptedReply::ok_json(json!({"data": true})));
    exchange.push(HttpMethod::Get, "timer_elapsed", ScriptedReply::ok_json(json!({"data": 1_600})));
    exchange.push(HttpMethod::Post, "stop", ScriptedReply::ok_json(json!({"status": "ok"})));
    exchange.push(HttpMethod::Post, "start", ScriptedReply::ok_json(json!({"status": "ok"})));
    exchange.push(HttpMethod::Get, "info", ScriptedReply::status(503));
    let controller = controller(&exchange, false);
    controller.refresh_status().await.expect("status should resolve");
    drive_to_near_timeout(&controller).await;

    let state = controller.request_stop().await.expect("stop should resolve");
    assert_eq!(state, LifecycleState::Stopped);
    assert_eq!(controller.snapshot().await.inactivity_estimate_seconds, 0);

    let mut events = controller.subscribe();
    let state = controller.request_start().await.expect("start should resolve");

    assert_eq!(state, LifecycleState::Running);
    let snapshot = controller.snapshot().await;
    assert_eq!(snapshot.inactivity_estimate_seconds, 0);
    assert_eq!(
        notification_messages(&mut events),
        vec![
            (NotificationKind::Success, "Started GPU MonaiLabel Instance!".to_string()),
            (NotificationKind::Error, "Failed to Connect to MONAI Label Server".to_string()),
        ]
    );
    assert_eq!(
        controller.tick_now().await,
        TickOutcome::Advanced { estimate_secs: 15 }
    );
    assert_eq!(controller.snapshot().await.inactivity_estimate_seconds, 15);
    controller.teardown().await;
}

#[tokio::test]
async fn failed_stop_near_timeout_notifies_and_stays_near_timeout() {
    let exchange = ScriptedExchange::new();
    exchange.push(HttpMethod::Get, STATUS_PATH, ScriptedReply::ok_json(json!({"data": true})));
    exchange.push(HttpMethod::Get, "timer_elapsed", ScriptedReply::ok_json(json!({"data": 1_600})));
    exchange.push(HttpMethod::Post, "stop", ScriptedReply::status(503));
    let controller = controller(&exchange, false);
    controller.refresh_status().await.expect("status should resolve");
    drive_to_near_timeout(&controller).await;
    let mut events = controller.subscribe();

    let state = controller.request_stop().await.expect("stop should resolve");

    assert_eq!(state, LifecycleState::RunningNearTimeout);
    let snapshot = controller.snapshot().await;
    assert_eq!(snapshot.inactivity_estimate_seconds, 1_600);
    assert!(snapshot
        .last_error
        .as_deref()
        .is_some_and(|message| message.contains("Failed to stop")));
    assert_eq!(
        notification_messages(&mut events),
        vec![(
            NotificationKind::Error,
            "Failed to Stop the GPU MonaiLabel Instance".to_string()
        )]
    );
    assert_eq!(exchange.call_count(HttpMethod::Post, "stop"), 1);
    assert_eq!(exchange.call_count(HttpMethod::Get, "info"), 0);
    controller.teardown().await;
}
