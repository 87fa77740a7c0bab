use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::entity::{AipId, SipId, SipState, Tenant};

// Inbound messages

/// AIP state reported by the storage service.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AipEventState {
    Pending,
    Valid,
    StoringMetadata,
    Stored,
    StorageError,
    Deleted,
    Updated,
}

/// Storage confirmation or failure for one AIP.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AipEvent {
    pub aip_id: AipId,
    pub sip_id: SipId,
    pub aip_state: AipEventState,
    #[serde(default)]
    pub failure_cause: Option<String>,
}

/// Lifecycle stage reported by the local job runner.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobEventType {
    Queued,
    Running,
    Succeeded,
    Failed,
    Aborted,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEvent {
    pub job_id: String,
    pub job_event_type: JobEventType,
}

/// Indexing outcome reported by the search-index service.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BroadcastEventType {
    Indexed,
    IndexError,
    Create,
    Update,
    Delete,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastEntityEvent {
    pub event_type: BroadcastEventType,
    pub aip_ids: Vec<AipId>,
}

/// Any message the intake subscribes to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum InboundMessage {
    Aip(AipEvent),
    Job(JobEvent),
    Broadcast(BroadcastEntityEvent),
}

impl InboundMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            InboundMessage::Aip(_) => "aip",
            InboundMessage::Job(_) => "job",
            InboundMessage::Broadcast(_) => "broadcast",
        }
    }
}

/// A message together with the tenant its transport envelope named.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub tenant: Tenant,
    #[serde(default = "Uuid::now_v7")]
    pub correlation_id: Uuid,
    pub message: InboundMessage,
}

impl Envelope {
    pub fn new(tenant: impl Into<Tenant>, message: InboundMessage) -> Self {
        Self {
            tenant: tenant.into(),
            correlation_id: Uuid::now_v7(),
            message,
        }
    }

    /// Decode a JSON envelope as delivered by the message broker.
    pub fn decode(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

// Outbound lifecycle events

/// Metadata envelope attached to every lifecycle event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventMeta {
    pub version: u16,
    pub correlation_id: Uuid,
    pub idempotency_key: String,
    pub tenant: Tenant,
    pub timestamp: DateTime<Utc>,
}

impl EventMeta {
    pub fn new(
        tenant: Tenant,
        correlation_id: Option<Uuid>,
        idempotency_key: impl Into<String>,
    ) -> Self {
        Self {
            version: 1,
            correlation_id: correlation_id.unwrap_or_else(Uuid::now_v7),
            idempotency_key: idempotency_key.into(),
            tenant,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub meta: EventMeta,
    pub payload: LifecycleEventPayload,
}

/// Event payload emitted for SIP lifecycle transitions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum LifecycleEventPayload {
    /// The aggregate state of a SIP changed.
    SipStateChanged {
        sip_id: SipId,
        from: SipState,
        to: SipState,
    },
    /// A storage request was answered.
    AipsSubmitted { accepted: usize, rejected: usize },
    /// The storage service refused to delete these SIPs.
    DeletionRejected { sip_ids: Vec<SipId> },
}

impl LifecycleEvent {
    pub fn sip_state_changed(
        tenant: Tenant,
        sip_id: SipId,
        from: SipState,
        to: SipState,
    ) -> Self {
        let key = format!("sip-{}-{}", sip_id, to.as_str());
        Self {
            meta: EventMeta::new(tenant, None, key),
            payload: LifecycleEventPayload::SipStateChanged { sip_id, from, to },
        }
    }

    pub fn aips_submitted(tenant: Tenant, accepted: usize, rejected: usize) -> Self {
        let correlation_id = Uuid::now_v7();
        Self {
            meta: EventMeta::new(tenant, Some(correlation_id), format!("submission-{correlation_id}")),
            payload: LifecycleEventPayload::AipsSubmitted { accepted, rejected },
        }
    }

    pub fn deletion_rejected(tenant: Tenant, sip_ids: Vec<SipId>) -> Self {
        let correlation_id = Uuid::now_v7();
        Self {
            meta: EventMeta::new(tenant, Some(correlation_id), format!("deletion-{correlation_id}")),
            payload: LifecycleEventPayload::DeletionRejected { sip_ids },
        }
    }
}

/// Generic event publisher trait for publishing events of type `E`.
#[async_trait]
pub trait EventPublisher<E>: Send + Sync
where
    E: Clone + Send + Sync + 'static,
{
    /// Publish an event to all subscribers.
    ///
    /// Returns an error if the event cannot be published.
    async fn publish(&self, event: E) -> anyhow::Result<()>;
}

/// Generic event subscriber trait for receiving events of type `E`.
pub trait EventSubscriber<E>: Send + Sync
where
    E: Clone + Send + Sync + 'static,
{
    /// Subscribe to events, returning a broadcast receiver.
    ///
    /// Multiple subscribers can receive the same events (fan-out).
    fn subscribe(&self) -> broadcast::Receiver<E>;
}

/// In-process event bus using tokio broadcast channels.
///
/// Carries two streams: lifecycle events produced by state transitions, and
/// envelopes the intake gave up on (dead letters). Publishing never blocks;
/// a lagging subscriber receives `RecvError::Lagged` instead of slowing the
/// publisher down, and events published with no subscriber are dropped.
pub struct InProcEventBus {
    lifecycle_sender: broadcast::Sender<LifecycleEvent>,
    dead_letter_sender: broadcast::Sender<Envelope>,
    capacity: usize,
}

impl std::fmt::Debug for InProcEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcEventBus")
            .field("capacity", &self.capacity)
            .field(
                "lifecycle_subscribers",
                &self.lifecycle_sender.receiver_count(),
            )
            .field(
                "dead_letter_subscribers",
                &self.dead_letter_sender.receiver_count(),
            )
            .finish()
    }
}

impl InProcEventBus {
    /// Create a new event bus buffering at most `capacity` events per stream.
    pub fn new(capacity: usize) -> Self {
        let (lifecycle_sender, _) = broadcast::channel(capacity);
        let (dead_letter_sender, _) = broadcast::channel(capacity);
        Self {
            lifecycle_sender,
            dead_letter_sender,
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn lifecycle_subscriber_count(&self) -> usize {
        self.lifecycle_sender.receiver_count()
    }

    pub fn publish_lifecycle(&self, event: LifecycleEvent) {
        let _ = self.lifecycle_sender.send(event);
    }

    pub fn publish_dead_letter(&self, envelope: Envelope) {
        let _ = self.dead_letter_sender.send(envelope);
    }

    pub fn subscribe_lifecycle(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.lifecycle_sender.subscribe()
    }

    pub fn subscribe_dead_letters(&self) -> broadcast::Receiver<Envelope> {
        self.dead_letter_sender.subscribe()
    }
}

#[async_trait]
impl EventPublisher<LifecycleEvent> for InProcEventBus {
    async fn publish(&self, event: LifecycleEvent) -> anyhow::Result<()> {
        self.publish_lifecycle(event);
        Ok(())
    }
}

#[async_trait]
impl EventPublisher<Envelope> for InProcEventBus {
    async fn publish(&self, envelope: Envelope) -> anyhow::Result<()> {
        self.publish_dead_letter(envelope);
        Ok(())
    }
}

impl EventSubscriber<LifecycleEvent> for InProcEventBus {
    fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.subscribe_lifecycle()
    }
}

impl EventSubscriber<Envelope> for InProcEventBus {
    fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.subscribe_dead_letters()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn state_change(i: usize) -> LifecycleEvent {
        LifecycleEvent::sip_state_changed(
            Tenant::new("project"),
            SipId::new(format!("URN:SIP:{i}")),
            SipState::Queued,
            SipState::Stored,
        )
    }

    #[test]
    fn test_decode_aip_event_envelope() {
        let json = br#"{
            "tenant": "project",
            "message": {
                "type": "Aip",
                "payload": {
                    "aipId": "URN:AIP:1",
                    "sipId": "URN:SIP:1",
                    "aipState": "STORAGE_ERROR",
                    "failureCause": "disk full"
                }
            }
        }"#;

        let envelope = Envelope::decode(json).unwrap();
        assert_eq!(envelope.tenant, Tenant::new("project"));
        match envelope.message {
            InboundMessage::Aip(event) => {
                assert_eq!(event.aip_state, AipEventState::StorageError);
                assert_eq!(event.failure_cause.as_deref(), Some("disk full"));
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn test_decode_broadcast_and_job_events() {
        let json = br#"{"tenant":"t","message":{"type":"Broadcast","payload":{"eventType":"INDEX_ERROR","aipIds":["a1","a2"]}}}"#;
        let envelope = Envelope::decode(json).unwrap();
        assert_eq!(envelope.message.kind(), "broadcast");

        let json = br#"{"tenant":"t","message":{"type":"Job","payload":{"jobId":"j1","jobEventType":"FAILED"}}}"#;
        let envelope = Envelope::decode(json).unwrap();
        assert_eq!(
            envelope.message,
            InboundMessage::Job(JobEvent {
                job_id: "j1".into(),
                job_event_type: JobEventType::Failed,
            })
        );
    }

    #[test]
    fn test_decode_rejects_unknown_state() {
        let json = br#"{"tenant":"t","message":{"type":"Aip","payload":{"aipId":"a","sipId":"s","aipState":"ARCHIVED"}}}"#;
        assert!(Envelope::decode(json).is_err());
    }

    #[tokio::test]
    async fn test_event_bus_broadcast_to_multiple_subscribers() {
        let bus = InProcEventBus::new(100);

        let mut rx1 = bus.subscribe_lifecycle();
        let mut rx2 = bus.subscribe_lifecycle();

        for i in 0..5 {
            bus.publish_lifecycle(state_change(i));
        }

        for _ in 0..5 {
            assert!(timeout(Duration::from_millis(100), rx1.recv()).await.is_ok());
            assert!(timeout(Duration::from_millis(100), rx2.recv()).await.is_ok());
        }
    }

    #[tokio::test]
    async fn test_lagged_subscriber_doesnt_block_publisher() {
        let bus = InProcEventBus::new(2);
        let mut rx = bus.subscribe_lifecycle();

        for i in 0..5 {
            bus.publish_lifecycle(state_change(i));
        }

        let result = timeout(Duration::from_millis(100), rx.recv()).await;
        match result.unwrap() {
            Err(broadcast::error::RecvError::Lagged(_)) | Ok(_) => {}
            Err(broadcast::error::RecvError::Closed) => {
                panic!("Channel should not be closed");
            }
        }
    }

    #[tokio::test]
    async fn test_dead_letters_are_a_separate_stream() {
        let bus = InProcEventBus::new(8);
        let mut lifecycle = bus.subscribe_lifecycle();
        let mut dead = bus.subscribe_dead_letters();

        let envelope = Envelope::new(
            "project",
            InboundMessage::Job(JobEvent {
                job_id: "j1".into(),
                job_event_type: JobEventType::Failed,
            }),
        );
        EventPublisher::<Envelope>::publish(&bus, envelope.clone())
            .await
            .unwrap();

        let received = timeout(Duration::from_millis(100), dead.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, envelope);
        assert!(lifecycle.try_recv().is_err());
    }

    #[test]
    fn test_event_bus_debug_format() {
        let bus = InProcEventBus::new(100);
        let _rx1 = bus.subscribe_lifecycle();
        let _rx2 = bus.subscribe_lifecycle();

        let debug_str = format!("{:?}", bus);
        assert!(debug_str.contains("InProcEventBus"));
        assert!(debug_str.contains("lifecycle_subscribers: 2"));
        assert!(debug_str.contains("capacity: 100"));
    }

    #[test]
    fn test_event_meta_creation() {
        let correlation_id = Uuid::now_v7();
        let meta = EventMeta::new(Tenant::new("t"), Some(correlation_id), "key");

        assert_eq!(meta.version, 1);
        assert_eq!(meta.correlation_id, correlation_id);
        assert_eq!(meta.idempotency_key, "key");
        assert!(meta.timestamp <= Utc::now());
    }
}
