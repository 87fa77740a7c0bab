//! Bulk sweep integration tests.
//!
//! Covers batching of storage requests, the handling of refused AIPs and
//! SIPs, and the administrator notification contract of the deletion sweep.

use archivist::*;
use archivist_testkit::*;

fn with_sizes(batch: usize, page: usize) -> Harness {
    Harness::with_config(LifecycleConfig {
        submission_batch_size: batch,
        deletion_page_size: page,
        ..LifecycleConfig::default()
    })
}

#[tokio::test]
async fn test_submission_is_batched() {
    let h = with_sizes(2, 100);
    let (first, first_aips) = h.seed_sip(1, SipState::Created, 3, AipState::Created);
    let (second, second_aips) = h.seed_sip(2, SipState::Created, 2, AipState::Created);

    let report = h.scheduler.submission_sweep(&h.ctx).await.unwrap();

    assert_eq!(report.batches, 3);
    assert_eq!(report.accepted, 5);
    assert_eq!(report.rejected, 0);
    assert!(!report.interrupted);
    h.gateway.assert_store_call_count_eq(3);
    assert!(h.gateway.store_calls().iter().all(|call| call.batch.len() <= 2));

    for aip in first_aips.iter().chain(&second_aips) {
        assert_eq!(h.aip_state(aip), Some(AipState::Queued));
    }
    assert_eq!(h.sip_state(&first), Some(SipState::Queued));
    assert_eq!(h.sip_state(&second), Some(SipState::Queued));
}

#[tokio::test]
async fn test_submission_without_pending_aips_sends_nothing() {
    let h = Harness::new();
    h.seed_sip(1, SipState::Stored, 2, AipState::Stored);

    let report = h.scheduler.submission_sweep(&h.ctx).await.unwrap();

    assert_eq!(report, SubmissionReport::default());
    h.gateway.assert_store_call_count_eq(0);
}

#[tokio::test]
async fn test_transient_store_failure_keeps_aips_created() {
    let h = with_sizes(10, 100);
    let (sip, aips) = h.seed_sip(1, SipState::Created, 2, AipState::Created);
    h.gateway
        .fail_next_store(GatewayError::Transient("connection reset".into()));

    let report = h.scheduler.submission_sweep(&h.ctx).await.unwrap();
    assert!(report.interrupted);
    assert_eq!(report.batches, 0);
    for aip in &aips {
        assert_eq!(h.aip_state(aip), Some(AipState::Created));
    }
    assert_eq!(h.sip_state(&sip), Some(SipState::Created));

    // The next sweep picks them up again.
    let report = h.scheduler.submission_sweep(&h.ctx).await.unwrap();
    assert_eq!(report.accepted, 2);
    assert_eq!(h.sip_state(&sip), Some(SipState::Queued));
}

#[tokio::test]
async fn test_client_store_failure_aborts_sweep() {
    let h = Harness::new();
    let (_, aips) = h.seed_sip(1, SipState::Created, 1, AipState::Created);
    h.gateway.fail_next_store(GatewayError::Client {
        status: 400,
        rejected: Vec::new(),
    });

    let err = h.scheduler.submission_sweep(&h.ctx).await.unwrap_err();

    assert!(matches!(
        err,
        SweepError::Lifecycle(LifecycleError::Gateway(GatewayError::Client { status: 400, .. }))
    ));
    assert_eq!(h.aip_state(&aips[0]), Some(AipState::Created));
}

#[tokio::test]
async fn test_refused_aip_flags_sip() {
    let h = Harness::new();
    let (sip, aips) = h.seed_sip(1, SipState::Created, 2, AipState::Created);
    h.gateway.refuse_aip(aips[0].clone(), "unknown storage location");
    let mut rx = h.events.subscribe_lifecycle();

    let report = h.scheduler.submission_sweep(&h.ctx).await.unwrap();

    assert_eq!(report.accepted, 1);
    assert_eq!(report.rejected, 1);
    let refused = h.store.aip(&h.tenant, &aips[0]).unwrap();
    assert_eq!(refused.state(), AipState::Rejected);
    assert_eq!(refused.error_message(), Some("unknown storage location"));
    assert_eq!(h.aip_state(&aips[1]), Some(AipState::Queued));

    let sip = h.store.sip(&h.tenant, &sip).unwrap();
    assert_eq!(sip.state(), SipState::StoreError);
    assert_eq!(
        sip.rejection_causes(),
        [submission_rejected_cause(&aips[0], "unknown storage location")]
    );

    let mut submitted = None;
    while let Ok(event) = rx.try_recv() {
        if let LifecycleEventPayload::AipsSubmitted { accepted, rejected } = event.payload {
            submitted = Some((accepted, rejected));
        }
    }
    assert_eq!(submitted, Some((1, 1)));
}

#[tokio::test]
async fn test_deletion_sweep_with_partial_rejection() {
    let h = Harness::new();
    let sips: Vec<SipId> = (0..100)
        .map(|n| h.seed_sip(n, SipState::ToBeDeleted, 1, AipState::Stored).0)
        .collect();
    let refused = [&sips[3], &sips[50], &sips[97]];
    for sip in refused {
        h.gateway.refuse_deletion(sip.clone(), "AIP is locked");
    }

    let report = h.scheduler.deletion_sweep(&h.ctx).await.unwrap();

    assert_eq!(report.pages, 1);
    assert_eq!(report.deleted, 97);
    assert_eq!(report.rejected.len(), 3);
    for sip in &sips {
        let entity = h.store.sip(&h.tenant, sip).unwrap();
        if refused.contains(&sip) {
            assert_eq!(entity.state(), SipState::ToBeDeleted);
            assert_eq!(
                entity.rejection_causes(),
                [deletion_rejected_cause("AIP is locked")]
            );
        } else {
            assert_eq!(entity.state(), SipState::Deleted);
            assert!(h.store.aips_of(&h.tenant, sip).is_empty());
        }
    }

    let sent = h.notifier.notifications();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].title, "Errors during SIP deletions");
    assert!(sent[0].message.contains("3 SIP(s)"));
    for sip in refused {
        assert!(sent[0].message.contains(&format!("SIP({sip}): AIP is locked")));
    }
}

#[tokio::test]
async fn test_refused_sips_are_retried_next_sweep() {
    let h = Harness::new();
    let (sip, _) = h.seed_sip(1, SipState::ToBeDeleted, 1, AipState::Stored);
    h.gateway.refuse_deletion(sip.clone(), "busy");

    for _ in 0..3 {
        let report = h.scheduler.deletion_sweep(&h.ctx).await.unwrap();
        assert_eq!(report.rejected.len(), 1);
    }
    assert_eq!(h.notifier.count(), 3);

    h.gateway.allow_deletion(&sip);
    let report = h.scheduler.deletion_sweep(&h.ctx).await.unwrap();
    assert_eq!(report.deleted, 1);
    assert_eq!(h.sip_state(&sip), Some(SipState::Deleted));
    assert_eq!(h.notifier.count(), 3);
}

#[tokio::test]
async fn test_repeated_refusal_is_recorded_once() {
    let h = Harness::new();
    let (sip, _) = h.seed_sip(1, SipState::ToBeDeleted, 1, AipState::Stored);
    h.gateway.refuse_deletion(sip.clone(), "busy");

    for _ in 0..50 {
        h.scheduler.deletion_sweep(&h.ctx).await.unwrap();
    }
    let causes = h.store.sip(&h.tenant, &sip).unwrap().rejection_causes().to_vec();
    assert_eq!(causes, [deletion_rejected_cause("busy")]);

    // A new reason is history worth keeping.
    h.gateway.refuse_deletion(sip.clone(), "legal hold");
    h.scheduler.deletion_sweep(&h.ctx).await.unwrap();
    h.scheduler.deletion_sweep(&h.ctx).await.unwrap();
    let causes = h.store.sip(&h.tenant, &sip).unwrap().rejection_causes().to_vec();
    assert_eq!(
        causes,
        [
            deletion_rejected_cause("busy"),
            deletion_rejected_cause("legal hold"),
        ]
    );
}

#[tokio::test]
async fn test_deletion_runs_elevated() {
    let h = Harness::new();
    h.seed_sip(1, SipState::ToBeDeleted, 1, AipState::Stored);

    h.scheduler.deletion_sweep(&h.ctx).await.unwrap();

    let calls = h.gateway.deletion_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].ctx.role(), Role::System);
    assert_eq!(calls[0].ctx.tenant(), &h.tenant);
    assert_eq!(h.ctx.role(), Role::Service);
}

#[tokio::test]
async fn test_deletion_pages_skip_refused_sips() {
    let h = with_sizes(1000, 2);
    let sips: Vec<SipId> = (0..5)
        .map(|n| h.seed_sip(n, SipState::ToBeDeleted, 1, AipState::Stored).0)
        .collect();
    h.gateway.refuse_deletion(sips[0].clone(), "locked");

    let report = h.scheduler.deletion_sweep(&h.ctx).await.unwrap();

    assert_eq!(report.deleted, 4);
    assert_eq!(report.rejected.len(), 1);
    assert_eq!(report.pages, 3);
    // Every SIP was requested exactly once.
    let requested: usize = h
        .gateway
        .deletion_calls()
        .iter()
        .map(|call| call.sip_ids.len())
        .sum();
    assert_eq!(requested, 5);
    assert_eq!(h.notifier.count(), 1);
}

#[tokio::test]
async fn test_unprocessable_answers_count_as_rejections() {
    let h = Harness::new();
    let (sip, _) = h.seed_sip(1, SipState::ToBeDeleted, 1, AipState::Stored);
    h.gateway.refuse_deletion(sip.clone(), "unknown SIP");
    h.gateway
        .answer_deletions_with(|_, rejected| Err(GatewayError::Client { status: 422, rejected }));

    let report = h.scheduler.deletion_sweep(&h.ctx).await.unwrap();

    assert_eq!(report.rejected.len(), 1);
    assert_eq!(h.sip_state(&sip), Some(SipState::ToBeDeleted));
    assert_eq!(h.notifier.count(), 1);
}

#[tokio::test]
async fn test_transient_deletion_failure_leaves_sips_untouched() {
    let h = Harness::new();
    let (sip, _) = h.seed_sip(1, SipState::ToBeDeleted, 1, AipState::Stored);
    h.gateway
        .fail_next_deletion(GatewayError::Transient("503".into()));

    let report = h.scheduler.deletion_sweep(&h.ctx).await.unwrap();

    assert_eq!(report.skipped, 1);
    assert_eq!(report.deleted, 0);
    assert_eq!(h.sip_state(&sip), Some(SipState::ToBeDeleted));
    assert!(h.store.sip(&h.tenant, &sip).unwrap().rejection_causes().is_empty());
    assert_eq!(h.notifier.count(), 0);
}

#[tokio::test]
async fn test_notification_client_error_aborts_before_recording() {
    let h = Harness::new();
    let (refused, _) = h.seed_sip(1, SipState::ToBeDeleted, 1, AipState::Stored);
    let (accepted, _) = h.seed_sip(2, SipState::ToBeDeleted, 1, AipState::Stored);
    h.gateway.refuse_deletion(refused.clone(), "locked");
    h.notifier.fail_with_client_error();

    let err = h.scheduler.deletion_sweep(&h.ctx).await.unwrap_err();

    assert!(matches!(err, SweepError::Notification(NotificationError::Client(_))));
    assert_eq!(h.sip_state(&refused), Some(SipState::ToBeDeleted));
    assert!(h.store.sip(&h.tenant, &refused).unwrap().rejection_causes().is_empty());
    assert_eq!(h.sip_state(&accepted), Some(SipState::ToBeDeleted));
}

#[tokio::test]
async fn test_notification_server_error_is_logged_only() {
    let h = Harness::new();
    let (refused, _) = h.seed_sip(1, SipState::ToBeDeleted, 1, AipState::Stored);
    let (accepted, _) = h.seed_sip(2, SipState::ToBeDeleted, 1, AipState::Stored);
    h.gateway.refuse_deletion(refused.clone(), "locked");
    h.notifier.fail_with_server_error();

    let report = h.scheduler.deletion_sweep(&h.ctx).await.unwrap();

    assert_eq!(report.deleted, 1);
    assert_eq!(h.sip_state(&accepted), Some(SipState::Deleted));
    assert_eq!(h.store.sip(&h.tenant, &refused).unwrap().rejection_causes().len(), 1);
}

#[tokio::test]
async fn test_deletion_rejections_are_published() {
    let h = Harness::new();
    let (sip, _) = h.seed_sip(1, SipState::ToBeDeleted, 1, AipState::Stored);
    h.gateway.refuse_deletion(sip.clone(), "locked");
    let mut rx = h.events.subscribe_lifecycle();

    h.scheduler.deletion_sweep(&h.ctx).await.unwrap();

    let event = rx.try_recv().unwrap();
    assert_eq!(
        event.payload,
        LifecycleEventPayload::DeletionRejected { sip_ids: vec![sip] }
    );
}

#[tokio::test]
async fn test_run_once_sweeps_every_tenant() {
    let h = Harness::new();
    let (sip, _) = h.seed_sip(1, SipState::Created, 1, AipState::Created);
    let (doomed, _) = h.seed_sip(2, SipState::ToBeDeleted, 1, AipState::Stored);

    let sweeps = h.scheduler.run_once().await;

    assert_eq!(sweeps.len(), 1);
    assert_eq!(sweeps[0].tenant, h.tenant);
    assert_eq!(sweeps[0].submission.as_ref().unwrap().accepted, 1);
    assert_eq!(sweeps[0].deletion.as_ref().unwrap().deleted, 1);
    assert_eq!(h.sip_state(&sip), Some(SipState::Queued));
    assert_eq!(h.sip_state(&doomed), Some(SipState::Deleted));
}
