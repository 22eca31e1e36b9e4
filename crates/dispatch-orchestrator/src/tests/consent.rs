//! Consent-gated tracking.

use std::sync::Arc;

use dispatch_config_and_utils::{ConfigHandle, ConsentConfig, Paths};
use dispatch_types::ConsentDecision;
use flow_control_gates::{
    ManualConsentProvider, CONSENT_TYPE_KEY, PURPOSES_PROCESSED_KEY, PURPOSES_UNPROCESSED_KEY,
};
use serde_json::json;
use tempfile::tempdir;

use super::{builder, config, dest, event, settle, wait_for_count, wait_until, Mode, RecordingDispatcher};
use crate::{DispatchCore, TrackOutcome};

fn consent_config(refire: &[&str]) -> ConfigHandle {
    let refire_destinations = refire.iter().map(|d| dest(d)).collect();
    config(|c| {
        c.consent = Some(ConsentConfig {
            required_purpose: "platform".to_string(),
            refire_destinations,
        })
    })
}

#[tokio::test]
async fn held_events_replay_once_after_consent() {
    let config = consent_config(&[]);
    let provider = Arc::new(ManualConsentProvider::new(["platform", "analytics"]));
    let x = RecordingDispatcher::new("x", Mode::Ack);
    let core = builder(&config)
        .dispatcher(x.clone())
        .consent_provider(provider.clone())
        .build()
        .unwrap();
    core.start().await.unwrap();

    assert_eq!(core.track_and_wait(event("early")).await.unwrap(), TrackOutcome::Held);
    assert_eq!(core.coordinator().held_count().await.unwrap(), 1);
    assert_eq!(core.coordinator().count().await.unwrap(), 0);

    provider.decide(ConsentDecision::explicit(["platform"]));
    wait_until("held event replayed", || x.count() == 1).await;
    assert_eq!(x.events()[0].get(CONSENT_TYPE_KEY), Some(&json!("explicit")));

    // A later decision must not replay it again.
    provider.decide(ConsentDecision::explicit(["platform", "analytics"]));
    settle().await;
    assert_eq!(x.count(), 1);

    assert_eq!(core.track_and_wait(event("late")).await.unwrap(), TrackOutcome::Enqueued);
    wait_until("late delivered", || x.count() == 2).await;

    core.shutdown().await;
}

#[tokio::test]
async fn explicit_refusal_discards_held_and_new_events() {
    let config = consent_config(&[]);
    let provider = Arc::new(ManualConsentProvider::new(["platform"]));
    let x = RecordingDispatcher::new("x", Mode::Ack);
    let core = builder(&config)
        .dispatcher(x.clone())
        .consent_provider(provider.clone())
        .build()
        .unwrap();
    core.start().await.unwrap();

    assert_eq!(core.track_and_wait(event("early")).await.unwrap(), TrackOutcome::Held);

    provider.decide(ConsentDecision::explicit(Vec::<String>::new()));
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(3);
    while core.coordinator().held_count().await.unwrap() != 0 {
        assert!(tokio::time::Instant::now() < deadline, "held event not discarded");
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    assert_eq!(core.track_and_wait(event("late")).await.unwrap(), TrackOutcome::Discarded);
    settle().await;
    assert_eq!(x.count(), 0);
    wait_for_count(&core, 0).await;

    core.shutdown().await;
}

#[tokio::test]
async fn refire_destination_gets_newly_granted_purposes() {
    let config = consent_config(&["r"]);
    let provider = Arc::new(ManualConsentProvider::new(["platform", "analytics"]));
    provider.decide(ConsentDecision::implicit(["platform"]));

    let x = RecordingDispatcher::new("x", Mode::Ack);
    let r = RecordingDispatcher::new("r", Mode::Ack);
    let core = builder(&config)
        .dispatcher(x.clone())
        .dispatcher(r.clone())
        .consent_provider(provider.clone())
        .build()
        .unwrap();
    core.start().await.unwrap();

    core.track_and_wait(event("page")).await.unwrap();
    wait_until("x delivered", || x.count() == 1).await;
    wait_until("r delivered", || r.count() == 1).await;
    let original = x.events()[0].clone();
    assert_eq!(original.get(CONSENT_TYPE_KEY), Some(&json!("implicit")));

    provider.decide(ConsentDecision::explicit(["platform", "analytics"]));
    wait_until("refire delivered", || r.count() == 2).await;

    let refired = r.events()[1].clone();
    assert_eq!(refired.name(), "page");
    assert_eq!(refired.id().as_str(), format!("{}:refire:1", original.id()));
    assert_eq!(refired.get(PURPOSES_PROCESSED_KEY), Some(&json!(["platform"])));
    assert_eq!(refired.get(PURPOSES_UNPROCESSED_KEY), Some(&json!(["analytics"])));

    settle().await;
    assert_eq!(x.count(), 1);

    core.shutdown().await;
}

#[tokio::test]
async fn held_events_survive_restart() {
    let dir = tempdir().unwrap();
    let paths = Paths::with_base_dir(dir.path().to_path_buf());
    let config = consent_config(&[]);

    {
        let provider = Arc::new(ManualConsentProvider::new(["platform"]));
        let core = DispatchCore::builder(config.clone())
            .paths(paths.clone())
            .dispatcher(RecordingDispatcher::new("x", Mode::Ack))
            .consent_provider(provider)
            .build()
            .unwrap();
        core.start().await.unwrap();
        assert_eq!(core.track_and_wait(event("early")).await.unwrap(), TrackOutcome::Held);
        core.shutdown().await;
    }

    let provider = Arc::new(ManualConsentProvider::new(["platform"]));
    let x = RecordingDispatcher::new("x", Mode::Ack);
    let core = DispatchCore::builder(config)
        .paths(paths)
        .dispatcher(x.clone())
        .consent_provider(provider.clone())
        .build()
        .unwrap();
    core.start().await.unwrap();
    assert_eq!(core.coordinator().held_count().await.unwrap(), 1);

    provider.decide(ConsentDecision::explicit(["platform"]));
    wait_until("restored event delivered", || x.count() == 1).await;
    assert_eq!(x.names(), vec!["early"]);
    assert_eq!(core.coordinator().held_count().await.unwrap(), 0);

    core.shutdown().await;
}
