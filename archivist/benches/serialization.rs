//! Benchmarks for inbound envelope decoding and lifecycle event encoding.
//!
//! These benchmarks measure the performance of:
//! - Decoding broker payloads into envelopes
//! - Encoding lifecycle events for downstream consumers

#![allow(missing_docs)]

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use archivist::{
    AipEvent, AipEventState, AipId, BroadcastEntityEvent, BroadcastEventType, Envelope,
    InboundMessage, LifecycleEvent, SipId, SipState, Tenant,
};

fn aip_envelope() -> Envelope {
    Envelope::new(
        "project-a",
        InboundMessage::Aip(AipEvent {
            aip_id: AipId::new("URN:AIP:DATA:project-a:0001:V1"),
            sip_id: SipId::new("URN:SIP:DATA:project-a:0001:V1"),
            aip_state: AipEventState::StorageError,
            failure_cause: Some("checksum mismatch on data file 3".to_string()),
        }),
    )
}

/// A broadcast naming many AIPs, as sent after a bulk reindex.
fn broadcast_envelope(aips: usize) -> Envelope {
    Envelope::new(
        "project-a",
        InboundMessage::Broadcast(BroadcastEntityEvent {
            event_type: BroadcastEventType::Indexed,
            aip_ids: (0..aips)
                .map(|n| AipId::new(format!("URN:AIP:DATA:project-a:{n:06}:V1")))
                .collect(),
        }),
    )
}

fn bench_envelope_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("envelope_decode");
    group.sample_size(100);
    group.measurement_time(std::time::Duration::from_secs(10));

    let aip = serde_json::to_vec(&aip_envelope()).expect("serialize should succeed");
    group.throughput(Throughput::Bytes(aip.len() as u64));
    group.bench_function("aip_event", |b| {
        b.iter(|| {
            let envelope = Envelope::decode(black_box(&aip)).expect("decode should succeed");
            black_box(envelope);
        });
    });

    let broadcast = serde_json::to_vec(&broadcast_envelope(500)).expect("serialize should succeed");
    group.throughput(Throughput::Bytes(broadcast.len() as u64));
    group.bench_function("broadcast_500_aips", |b| {
        b.iter(|| {
            let envelope = Envelope::decode(black_box(&broadcast)).expect("decode should succeed");
            black_box(envelope);
        });
    });

    group.finish();
}

fn bench_lifecycle_event_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("lifecycle_event_encode");

    let event = LifecycleEvent::sip_state_changed(
        Tenant::new("project-a"),
        SipId::new("URN:SIP:DATA:project-a:0001:V1"),
        SipState::Queued,
        SipState::Stored,
    );
    group.bench_function("sip_state_changed", |b| {
        b.iter(|| {
            let json = serde_json::to_vec(black_box(&event)).expect("serialize should succeed");
            black_box(json);
        });
    });

    group.finish();
}

criterion_group!(benches, bench_envelope_decode, bench_lifecycle_event_encode);
criterion_main!(benches);
