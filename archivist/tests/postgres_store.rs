//! Integration tests for the PostgreSQL entity store.
//!
//! Requires a running Postgres instance reachable through `DATABASE_URL`.
//! Run with: `cargo test --test postgres_store --features postgres -- --ignored`

#![cfg(feature = "postgres")]

use archivist::persistence::PostgresEntityStore;
use archivist::*;
use sqlx::PgPool;
use uuid::Uuid;

async fn store() -> PostgresEntityStore {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let pool = PgPool::connect(&url).await.expect("connect");
    let store = PostgresEntityStore::new(pool);
    store.ensure_schema().await.expect("schema");
    store
}

// A fresh tenant per test keeps runs independent without truncating tables.
fn fresh_tenant() -> Tenant {
    Tenant::new(format!("test-{}", Uuid::new_v4()))
}

#[tokio::test]
#[ignore]
async fn test_apply_round_trips_entities() {
    let store = store().await;
    let tenant = fresh_tenant();
    let sip = SipEntity::new(SipId::new("URN:SIP:1"))
        .in_session("session-1")
        .from_provider("provider-1")
        .with_state(SipState::StoreError)
        .with_rejection_cause("first")
        .with_rejection_cause("second");
    let aip = AipEntity::new(AipId::new("URN:AIP:1"), sip.sip_id().clone())
        .with_error(AipState::Rejected, "refused");

    store
        .apply(
            &tenant,
            Changeset::new().upsert_sip(sip.clone()).upsert_aip(aip.clone()),
        )
        .await
        .unwrap();

    let loaded = store.find_sip(&tenant, sip.sip_id()).await.unwrap().unwrap();
    assert_eq!(loaded.state(), SipState::StoreError);
    assert_eq!(loaded.rejection_causes(), ["first", "second"]);
    assert_eq!(loaded.session(), Some("session-1"));
    assert_eq!(loaded.id(), sip.id());

    let loaded = store.find_aip(&tenant, aip.aip_id()).await.unwrap().unwrap();
    assert_eq!(loaded.state(), AipState::Rejected);
    assert_eq!(loaded.error_message(), Some("refused"));

    // Other tenants see nothing.
    assert!(store.find_sip(&fresh_tenant(), sip.sip_id()).await.unwrap().is_none());
}

#[tokio::test]
#[ignore]
async fn test_upsert_and_remove() {
    let store = store().await;
    let tenant = fresh_tenant();
    let sip = SipEntity::new(SipId::new("URN:SIP:2"));
    let aips: Vec<AipEntity> = (0..3)
        .map(|n| AipEntity::new(AipId::new(format!("URN:AIP:2:{n}")), sip.sip_id().clone()))
        .collect();

    let mut changes = Changeset::new().upsert_sip(sip.clone());
    for aip in &aips {
        changes = changes.upsert_aip(aip.clone());
    }
    store.apply(&tenant, changes).await.unwrap();

    let created = store
        .find_aips_by_state(&tenant, AipState::Created, 2)
        .await
        .unwrap();
    assert_eq!(created.len(), 2);
    assert_eq!(created[0].aip_id(), aips[0].aip_id());

    let sip = store.find_sip(&tenant, sip.sip_id()).await.unwrap().unwrap();
    assert_eq!(sip.version(), 1);
    store
        .apply(
            &tenant,
            Changeset::new()
                .upsert_sip(sip.clone().with_state(SipState::Queued))
                .upsert_aip(aips[0].clone().with_state(AipState::Queued))
                .remove_aip(aips[2].aip_id().clone()),
        )
        .await
        .unwrap();

    let remaining = store.find_aips_by_sip(&tenant, sip.sip_id()).await.unwrap();
    assert_eq!(remaining.len(), 2);
    assert_eq!(remaining[0].state(), AipState::Queued);
    let sip = store.find_sip(&tenant, sip.sip_id()).await.unwrap().unwrap();
    assert_eq!(sip.state(), SipState::Queued);
    assert_eq!(sip.version(), 2);
}

#[tokio::test]
#[ignore]
async fn test_stale_snapshot_writes_nothing() {
    let store = store().await;
    let tenant = fresh_tenant();
    let sip = SipEntity::new(SipId::new("URN:SIP:3")).with_state(SipState::Queued);
    store
        .apply(&tenant, Changeset::new().upsert_sip(sip.clone()))
        .await
        .unwrap();
    let current = store.find_sip(&tenant, sip.sip_id()).await.unwrap().unwrap();

    // First writer wins.
    store
        .apply(
            &tenant,
            Changeset::new().upsert_sip(current.clone().with_state(SipState::StoreError)),
        )
        .await
        .unwrap();

    let aip = AipEntity::new(AipId::new("URN:AIP:3"), sip.sip_id().clone());
    let err = store
        .apply(
            &tenant,
            Changeset::new()
                .upsert_aip(aip.clone())
                .upsert_sip(current.with_state(SipState::Stored)),
        )
        .await
        .unwrap_err();

    assert!(err.downcast_ref::<StoreConflict>().is_some());
    let sip = store.find_sip(&tenant, sip.sip_id()).await.unwrap().unwrap();
    assert_eq!(sip.state(), SipState::StoreError);
    assert!(store.find_aip(&tenant, aip.aip_id()).await.unwrap().is_none());
}

#[tokio::test]
#[ignore]
async fn test_search_filters_and_pages() {
    let store = store().await;
    let tenant = fresh_tenant();
    let mut changes = Changeset::new();
    for n in 0..5 {
        changes = changes.upsert_sip(
            SipEntity::new(SipId::new(format!("URN:SIP:{n}")))
                .in_session(if n < 3 { "s1" } else { "s2" })
                .with_state(SipState::ToBeDeleted),
        );
    }
    store.apply(&tenant, changes).await.unwrap();

    let first = store
        .search_sips(&tenant, &SipFilter::in_state(SipState::ToBeDeleted), PageRequest::new(0, 2))
        .await
        .unwrap();
    let rest = store
        .search_sips(&tenant, &SipFilter::in_state(SipState::ToBeDeleted), PageRequest::new(2, 10))
        .await
        .unwrap();
    assert_eq!(first.len(), 2);
    assert_eq!(rest.len(), 3);
    assert_eq!(first[0].sip_id().as_str(), "URN:SIP:0");

    let session = store
        .search_sips(&tenant, &SipFilter::in_session("s1"), PageRequest::first(10))
        .await
        .unwrap();
    assert_eq!(session.len(), 3);

    let ids = store
        .search_sips(
            &tenant,
            &SipFilter::with_ids([SipId::new("URN:SIP:4"), SipId::new("URN:SIP:9")]),
            PageRequest::first(10),
        )
        .await
        .unwrap();
    assert_eq!(ids.len(), 1);
}
