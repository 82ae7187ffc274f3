#![forbid(unsafe_code)]

use custody_contracts::artifact::{
    ArtifactId, ArtifactPayload, ArtifactRecord, ArtifactRecordInput, ArtifactSource, ArtifactType,
};
use custody_contracts::audit::{AuditResourceType, ErrorRecord, ErrorSeverity};
use custody_contracts::conversation::{ConversationId, ConversationRecord, ConversationStatus};
use custody_contracts::delivery::{DeliveryEventType, DeliveryTaskInput};
use custody_contracts::provenance::InputRef;
use custody_contracts::{
    ActorRef, ContractViolation, MonotonicTimeNs, ProducedBy, SchemaVersion, Validate,
};
use custody_storage::canon;
use custody_storage::{LedgerError, LedgerStore};

use crate::registry::DeliveryRegistry;

pub const INGEST_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

/// Ingestion envelope from producers (call engine, transcription /
/// translation / scoring jobs). Producers never pick ids: the
/// `client_supplied_id` slot exists so a caller that tries anyway is
/// rejected loudly instead of silently ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactIngestRequest {
    pub schema_version: SchemaVersion,
    pub conversation_id: ConversationId,
    pub artifact_type: ArtifactType,
    pub payload: ArtifactPayload,
    pub produced_by: ProducedBy,
    pub source: Option<ArtifactSource>,
    pub parent_artifact_id: Option<ArtifactId>,
    pub input_refs: Vec<InputRef>,
    pub client_supplied_id: Option<String>,
    pub actor: ActorRef,
}

impl ArtifactIngestRequest {
    #[allow(clippy::too_many_arguments)]
    pub fn v1(
        conversation_id: ConversationId,
        artifact_type: ArtifactType,
        payload: ArtifactPayload,
        produced_by: ProducedBy,
        source: Option<ArtifactSource>,
        parent_artifact_id: Option<ArtifactId>,
        input_refs: Vec<InputRef>,
        actor: ActorRef,
    ) -> Result<Self, ContractViolation> {
        let r = Self {
            schema_version: INGEST_CONTRACT_VERSION,
            conversation_id,
            artifact_type,
            payload,
            produced_by,
            source,
            parent_artifact_id,
            input_refs,
            client_supplied_id: None,
            actor,
        };
        r.validate()?;
        Ok(r)
    }
}

impl Validate for ArtifactIngestRequest {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != INGEST_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "artifact_ingest_request.schema_version",
                reason: "must match INGEST_CONTRACT_VERSION",
            });
        }
        if self.client_supplied_id.is_some() {
            return Err(ContractViolation::InvalidValue {
                field: "artifact_ingest_request.client_supplied_id",
                reason: "artifact ids are generated server-side",
            });
        }
        self.conversation_id.validate()?;
        self.payload.validate()?;
        self.produced_by.validate()?;
        self.actor.validate()?;
        for r in &self.input_refs {
            r.validate()?;
        }
        Ok(())
    }
}

/// Which notification an artifact write fans out as.
pub fn artifact_event_type(artifact_type: ArtifactType) -> DeliveryEventType {
    match artifact_type {
        ArtifactType::Score => DeliveryEventType::ScoreReady,
        ArtifactType::TranscriptVersion => DeliveryEventType::TranscriptReady,
        _ => DeliveryEventType::ArtifactCreated,
    }
}

/// Persists the artifact (row + provenance + audit, atomically), then
/// fans out one delivery task per registered target. Delivery is
/// decoupled: enqueue failures are journaled and never surface to the
/// producer, which only sees the outcome of the artifact write.
pub fn ingest_artifact(
    store: &mut LedgerStore,
    registry: &DeliveryRegistry,
    now: MonotonicTimeNs,
    request: ArtifactIngestRequest,
) -> Result<ArtifactRecord, LedgerError> {
    request.validate()?;
    let input = ArtifactRecordInput::v1(
        request.conversation_id,
        request.artifact_type,
        request.payload,
        request.produced_by,
        request.source,
    )?;
    let record = store.create_artifact(
        now,
        input,
        request.parent_artifact_id,
        request.input_refs,
        request.actor.clone(),
    )?;

    let event_type = artifact_event_type(record.artifact_type);
    let payload = serde_json::json!({
        "artifact_id": record.artifact_id.0,
        "conversation_id": record.conversation_id.0,
        "artifact_type": record.artifact_type.as_str(),
        "content_hash": record.content_hash,
        "version": record.version.0,
        "occurred_at_ns": now.0,
    });
    fan_out_event(
        store,
        registry,
        now,
        event_type,
        &payload,
        &format!("artifact_{}", record.artifact_id.0),
        record.artifact_id.0,
        &request.actor,
    )?;
    Ok(record)
}

/// Soft-deletes an artifact and fans out the retirement notification.
pub fn retire_artifact(
    store: &mut LedgerStore,
    registry: &DeliveryRegistry,
    now: MonotonicTimeNs,
    artifact_id: ArtifactId,
    actor: ActorRef,
) -> Result<ArtifactRecord, LedgerError> {
    let record = store.soft_delete_artifact(now, artifact_id, actor.clone())?;
    let payload = serde_json::json!({
        "artifact_id": record.artifact_id.0,
        "conversation_id": record.conversation_id.0,
        "artifact_type": record.artifact_type.as_str(),
        "deleted_at_ns": record.deleted_at.map(|t| t.0),
        "occurred_at_ns": now.0,
    });
    fan_out_event(
        store,
        registry,
        now,
        DeliveryEventType::ArtifactSoftDeleted,
        &payload,
        &format!("artifact_{}_retired", record.artifact_id.0),
        record.artifact_id.0,
        &actor,
    )?;
    Ok(record)
}

/// Ends a conversation through the narrow status path and fans out the
/// `conversation_ended` notification.
pub fn end_conversation(
    store: &mut LedgerStore,
    registry: &DeliveryRegistry,
    now: MonotonicTimeNs,
    conversation_id: ConversationId,
    actor: ActorRef,
) -> Result<ConversationRecord, LedgerError> {
    let record =
        store.update_conversation_status(now, conversation_id, ConversationStatus::Ended, actor.clone())?;
    let payload = serde_json::json!({
        "conversation_id": record.conversation_id.0,
        "status": record.status.as_str(),
        "ended_at_ns": record.ended_at.map(|t| t.0),
        "occurred_at_ns": now.0,
    });
    fan_out_event(
        store,
        registry,
        now,
        DeliveryEventType::ConversationEnded,
        &payload,
        &format!("conversation_{}_ended", record.conversation_id.0),
        record.conversation_id.0,
        &actor,
    )?;
    Ok(record)
}

/// Enqueues one task per registered target with a deterministic
/// idempotency key, so producer-side retries of the same logical event
/// dedupe instead of double-delivering.
#[allow(clippy::too_many_arguments)]
fn fan_out_event(
    store: &mut LedgerStore,
    registry: &DeliveryRegistry,
    now: MonotonicTimeNs,
    event_type: DeliveryEventType,
    payload: &serde_json::Value,
    key_seed: &str,
    resource_id: u64,
    actor: &ActorRef,
) -> Result<(), LedgerError> {
    let payload_json = payload.to_string();
    for target in registry.targets_for(event_type) {
        let idempotency_key = derive_idempotency_key(key_seed, event_type, &target.label());
        let input = match DeliveryTaskInput::v1(
            now,
            event_type,
            payload_json.clone(),
            target.clone(),
            idempotency_key,
            registry.default_max_attempts(),
        ) {
            Ok(input) => input,
            Err(violation) => {
                journal_enqueue_failure(store, now, resource_id, actor, &violation)?;
                continue;
            }
        };
        match store.enqueue_delivery_task(input, actor.clone()) {
            Ok(_) => {}
            Err(LedgerError::ContractViolation(violation)) => {
                journal_enqueue_failure(store, now, resource_id, actor, &violation)?;
            }
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

fn journal_enqueue_failure(
    store: &mut LedgerStore,
    now: MonotonicTimeNs,
    resource_id: u64,
    actor: &ActorRef,
    violation: &ContractViolation,
) -> Result<(), LedgerError> {
    store.journal_error(
        now,
        AuditResourceType::DeliveryTask,
        resource_id,
        None,
        actor.clone(),
        ErrorRecord::v1(
            "DELIVERY_ENQUEUE_FAILED",
            ErrorSeverity::High,
            true,
            format!("notification enqueue rejected: {violation:?}"),
        )?,
    )?;
    Ok(())
}

/// `<seed>:<event>:<16-hex target fingerprint>`: stable per logical
/// event and target, short enough for the idempotency-key bound.
fn derive_idempotency_key(key_seed: &str, event_type: DeliveryEventType, target_label: &str) -> String {
    let digest = canon::content_hash_hex(target_label.as_bytes());
    let fingerprint = digest.trim_start_matches("sha256:");
    format!(
        "{key_seed}:{}:{}",
        event_type.as_str(),
        &fingerprint[..16.min(fingerprint.len())]
    )
}
