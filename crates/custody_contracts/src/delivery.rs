#![forbid(unsafe_code)]

use crate::{ContractViolation, MonotonicTimeNs, SchemaVersion, Validate};

pub const DELIVERY_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

fn validate_token(
    field: &'static str,
    value: &str,
    max_len: usize,
) -> Result<(), ContractViolation> {
    if value.trim().is_empty() {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must not be empty",
        });
    }
    if value.len() > max_len {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "exceeds max length",
        });
    }
    if !value.is_ascii() {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must be ASCII",
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeliveryTaskId(pub u64);

impl Validate for DeliveryTaskId {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "delivery_task_id",
                reason: "must be > 0",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DeliveryEventType {
    ArtifactCreated,
    ArtifactSoftDeleted,
    ConversationEnded,
    BundleBuilt,
    ScoreReady,
    TranscriptReady,
}

impl DeliveryEventType {
    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryEventType::ArtifactCreated => "artifact_created",
            DeliveryEventType::ArtifactSoftDeleted => "artifact_soft_deleted",
            DeliveryEventType::ConversationEnded => "conversation_ended",
            DeliveryEventType::BundleBuilt => "bundle_built",
            DeliveryEventType::ScoreReady => "score_ready",
            DeliveryEventType::TranscriptReady => "transcript_ready",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DeliveryTarget {
    Webhook { url: String },
    Internal { handler_key: String },
}

impl DeliveryTarget {
    /// Stable label used for idempotency-key derivation and audit
    /// snapshots.
    pub fn label(&self) -> String {
        match self {
            DeliveryTarget::Webhook { url } => format!("webhook:{url}"),
            DeliveryTarget::Internal { handler_key } => format!("internal:{handler_key}"),
        }
    }
}

impl Validate for DeliveryTarget {
    fn validate(&self) -> Result<(), ContractViolation> {
        match self {
            DeliveryTarget::Webhook { url } => {
                validate_token("delivery_target.url", url, 512)?;
                if !(url.starts_with("https://") || url.starts_with("http://")) {
                    return Err(ContractViolation::InvalidValue {
                        field: "delivery_target.url",
                        reason: "must be an http(s) URL",
                    });
                }
                Ok(())
            }
            DeliveryTarget::Internal { handler_key } => {
                validate_token("delivery_target.handler_key", handler_key, 128)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DeliveryTaskStatus {
    Pending,
    Retrying,
    Succeeded,
    Failed,
    ManualReview,
    Discarded,
}

impl DeliveryTaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryTaskStatus::Pending => "pending",
            DeliveryTaskStatus::Retrying => "retrying",
            DeliveryTaskStatus::Succeeded => "succeeded",
            DeliveryTaskStatus::Failed => "failed",
            DeliveryTaskStatus::ManualReview => "manual_review",
            DeliveryTaskStatus::Discarded => "discarded",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DeliveryTaskStatus::Succeeded | DeliveryTaskStatus::Discarded
        )
    }
}

/// The delivery state machine. `Retrying -> Retrying` covers
/// consecutive transient failures; `Failed`/`ManualReview ->
/// Retrying` is the operator's forced re-delivery path.
pub fn is_allowed_task_transition(from: DeliveryTaskStatus, to: DeliveryTaskStatus) -> bool {
    use DeliveryTaskStatus::*;
    matches!(
        (from, to),
        (Pending, Succeeded)
            | (Pending, Retrying)
            | (Pending, Failed)
            | (Retrying, Succeeded)
            | (Retrying, Retrying)
            | (Retrying, Failed)
            | (Failed, ManualReview)
            | (Failed, Discarded)
            | (Failed, Retrying)
            | (ManualReview, Retrying)
            | (ManualReview, Discarded)
    )
}

/// Retry scheduling parameters. Tunable configuration, never
/// hard-coded per task type.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u16,
    pub jitter_fraction: f32,
}

impl BackoffConfig {
    pub fn mvp_v1() -> Self {
        Self {
            base_delay_ms: 5_000,
            max_delay_ms: 300_000,
            max_attempts: 5,
            jitter_fraction: 0.2,
        }
    }
}

impl Validate for BackoffConfig {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.base_delay_ms == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "backoff_config.base_delay_ms",
                reason: "must be > 0",
            });
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(ContractViolation::InvalidValue {
                field: "backoff_config.max_delay_ms",
                reason: "must be >= base_delay_ms",
            });
        }
        if self.max_attempts == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "backoff_config.max_attempts",
                reason: "must be >= 1",
            });
        }
        // Jitter below one base step keeps consecutive retry times
        // strictly increasing until the cap.
        if !self.jitter_fraction.is_finite() {
            return Err(ContractViolation::NotFinite {
                field: "backoff_config.jitter_fraction",
            });
        }
        if !(0.0..1.0).contains(&self.jitter_fraction) {
            return Err(ContractViolation::InvalidRange {
                field: "backoff_config.jitter_fraction",
                min: 0.0,
                max: 1.0,
                got: self.jitter_fraction as f64,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryTaskInput {
    pub schema_version: SchemaVersion,
    pub created_at: MonotonicTimeNs,
    pub event_type: DeliveryEventType,
    pub payload_json: String,
    pub target: DeliveryTarget,
    pub idempotency_key: String,
    pub max_attempts: u16,
}

impl DeliveryTaskInput {
    pub fn v1(
        created_at: MonotonicTimeNs,
        event_type: DeliveryEventType,
        payload_json: String,
        target: DeliveryTarget,
        idempotency_key: String,
        max_attempts: u16,
    ) -> Result<Self, ContractViolation> {
        let r = Self {
            schema_version: DELIVERY_CONTRACT_VERSION,
            created_at,
            event_type,
            payload_json,
            target,
            idempotency_key,
            max_attempts,
        };
        r.validate()?;
        Ok(r)
    }
}

impl Validate for DeliveryTaskInput {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != DELIVERY_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "delivery_task_input.schema_version",
                reason: "must match DELIVERY_CONTRACT_VERSION",
            });
        }
        if self.created_at.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "delivery_task_input.created_at",
                reason: "must be > 0",
            });
        }
        if self.payload_json.trim().is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "delivery_task_input.payload_json",
                reason: "must not be empty",
            });
        }
        if self.payload_json.len() > 16_384 {
            return Err(ContractViolation::InvalidValue {
                field: "delivery_task_input.payload_json",
                reason: "exceeds max payload size",
            });
        }
        self.target.validate()?;
        validate_token(
            "delivery_task_input.idempotency_key",
            &self.idempotency_key,
            128,
        )?;
        if self.max_attempts == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "delivery_task_input.max_attempts",
                reason: "must be >= 1",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryTaskRecord {
    pub schema_version: SchemaVersion,
    pub task_id: DeliveryTaskId,
    pub idempotency_key: String,
    pub event_type: DeliveryEventType,
    pub payload_json: String,
    pub target: DeliveryTarget,
    pub status: DeliveryTaskStatus,
    pub attempt_count: u16,
    pub max_attempts: u16,
    pub next_retry_at: MonotonicTimeNs,
    pub last_error: Option<String>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<MonotonicTimeNs>,
    pub created_at: MonotonicTimeNs,
}

impl DeliveryTaskRecord {
    pub fn from_input_v1(
        task_id: DeliveryTaskId,
        input: DeliveryTaskInput,
    ) -> Result<Self, ContractViolation> {
        input.validate()?;
        task_id.validate()?;
        Ok(Self {
            schema_version: DELIVERY_CONTRACT_VERSION,
            task_id,
            idempotency_key: input.idempotency_key,
            event_type: input.event_type,
            payload_json: input.payload_json,
            target: input.target,
            status: DeliveryTaskStatus::Pending,
            attempt_count: 0,
            max_attempts: input.max_attempts,
            next_retry_at: input.created_at,
            last_error: None,
            lease_owner: None,
            lease_expires_at: None,
            created_at: input.created_at,
        })
    }
}
