//! Runtime integration tests: builder validation and start/shutdown.

use std::sync::Arc;
use std::time::Duration;

use archivist::*;
use archivist_testkit::*;
use tokio::time::{sleep, timeout, Instant};

type TestRuntimeBuilder =
    ArchivistRuntimeBuilder<InMemoryEntityStore, MockStorageGateway, RecordingNotifier>;

fn config() -> ArchivistConfig {
    let mut config = ArchivistConfig::default();
    config.tenants = vec![TEST_TENANT.to_string()];
    config.lifecycle.sweep_interval_ms = 20;
    config
}

#[test]
fn test_builder_reports_missing_dependency() {
    let err = TestRuntimeBuilder::new(config())
        .with_store(Arc::new(InMemoryEntityStore::new()))
        .with_gateway(Arc::new(MockStorageGateway::new()))
        .build()
        .unwrap_err();

    assert!(err.to_string().contains("notifier dependency missing"));
}

#[test]
fn test_builder_debug_lists_configured_parts() {
    let builder = TestRuntimeBuilder::new(config()).with_store(Arc::new(InMemoryEntityStore::new()));
    let debug = format!("{builder:?}");

    assert!(debug.contains("store_set: true"));
    assert!(debug.contains("gateway_set: false"));
}

#[tokio::test]
async fn test_runtime_processes_messages_and_sweeps() {
    let tenant = Tenant::new(TEST_TENANT);
    let store = Arc::new(InMemoryEntityStore::new());
    let gateway = Arc::new(MockStorageGateway::new());

    let runtime = TestRuntimeBuilder::new(config())
        .with_store(Arc::clone(&store))
        .with_gateway(Arc::clone(&gateway))
        .with_notifier(Arc::new(RecordingNotifier::new()))
        .with_jobs(Arc::new(InMemoryJobRegistry::new()))
        .build()
        .unwrap();

    // Picked up by the periodic submission sweep.
    let pending = sip_id(1);
    store.insert_sip(&tenant, SipEntity::new(pending.clone()));
    store.insert_aip(&tenant, AipEntity::new(aip_id(1, 0), pending.clone()));

    // Resolved by an inbound message.
    let queued = sip_id(2);
    store.insert_sip(&tenant, SipEntity::new(queued.clone()).with_state(SipState::Queued));
    store.insert_aip(
        &tenant,
        AipEntity::new(aip_id(2, 0), queued.clone()).with_state(AipState::Queued),
    );

    let inbound = runtime.start().await;
    inbound
        .send(Envelope::new(
            tenant.clone(),
            InboundMessage::Aip(aip_event(&aip_id(2, 0), &queued, AipEventState::Stored)),
        ))
        .await
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let submitted = store.sip(&tenant, &pending).map(|s| s.state()) == Some(SipState::Queued);
        let stored = store.sip(&tenant, &queued).map(|s| s.state()) == Some(SipState::Stored);
        if submitted && stored {
            break;
        }
        assert!(Instant::now() < deadline, "runtime did not converge");
        sleep(Duration::from_millis(10)).await;
    }

    timeout(Duration::from_secs(5), runtime.shutdown())
        .await
        .expect("shutdown should complete")
        .unwrap();
    assert!(runtime.shutdown_token().is_cancelled());
    assert!(!gateway.store_calls().is_empty());
}

#[tokio::test]
async fn test_shared_event_bus_sees_transitions() {
    let tenant = Tenant::new(TEST_TENANT);
    let store = Arc::new(InMemoryEntityStore::new());
    let events = Arc::new(InProcEventBus::new(16));
    let mut rx = events.subscribe_lifecycle();

    let runtime = TestRuntimeBuilder::new(config())
        .with_store(Arc::clone(&store))
        .with_gateway(Arc::new(MockStorageGateway::new()))
        .with_notifier(Arc::new(RecordingNotifier::new()))
        .with_jobs(Arc::new(InMemoryJobRegistry::new()))
        .with_events(events)
        .build()
        .unwrap();

    let sip = sip_id(1);
    store.insert_sip(&tenant, SipEntity::new(sip.clone()).with_state(SipState::Queued));
    store.insert_aip(
        &tenant,
        AipEntity::new(aip_id(1, 0), sip.clone()).with_state(AipState::Queued),
    );

    let ctx = CallContext::for_tenant(tenant.clone());
    runtime
        .lifecycle()
        .handle_aip_event(&ctx, &aip_event(&aip_id(1, 0), &sip, AipEventState::Stored))
        .await
        .unwrap();

    let event = rx.recv().await.unwrap();
    assert!(matches!(
        event.payload,
        LifecycleEventPayload::SipStateChanged { to: SipState::Stored, .. }
    ));
}
