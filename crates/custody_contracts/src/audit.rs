#![forbid(unsafe_code)]

use crate::conversation::ConversationId;
use crate::{ActorRef, ContractViolation, MonotonicTimeNs, SchemaVersion, Validate};

pub const AUDIT_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

pub const MAX_SNAPSHOT_BYTES: usize = 4_096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AuditEntryId(pub u64);

impl Validate for AuditEntryId {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "audit_entry_id",
                reason: "must be > 0",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuditAction {
    ConversationCreated,
    ConversationStatusChanged,
    ArtifactCreated,
    ArtifactSoftDeleted,
    BundleBuilt,
    DeliveryEnqueued,
    DeliverySucceeded,
    DeliveryManualReview,
    DeliveryDiscarded,
    DeliveryForcedRetry,
    Error,
}

impl AuditAction {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditAction::ConversationCreated => "conversation_created",
            AuditAction::ConversationStatusChanged => "conversation_status_changed",
            AuditAction::ArtifactCreated => "artifact_created",
            AuditAction::ArtifactSoftDeleted => "artifact_soft_deleted",
            AuditAction::BundleBuilt => "bundle_built",
            AuditAction::DeliveryEnqueued => "delivery_enqueued",
            AuditAction::DeliverySucceeded => "delivery_succeeded",
            AuditAction::DeliveryManualReview => "delivery_manual_review",
            AuditAction::DeliveryDiscarded => "delivery_discarded",
            AuditAction::DeliveryForcedRetry => "delivery_forced_retry",
            AuditAction::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuditResourceType {
    Conversation,
    Artifact,
    ProvenanceEdge,
    EvidenceBundle,
    DeliveryTask,
}

impl AuditResourceType {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditResourceType::Conversation => "conversation",
            AuditResourceType::Artifact => "artifact",
            AuditResourceType::ProvenanceEdge => "provenance_edge",
            AuditResourceType::EvidenceBundle => "evidence_bundle",
            AuditResourceType::DeliveryTask => "delivery_task",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorSeverity {
    Critical,
    High,
    Medium,
    Low,
}

impl ErrorSeverity {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorSeverity::Critical => "CRITICAL",
            ErrorSeverity::High => "HIGH",
            ErrorSeverity::Medium => "MEDIUM",
            ErrorSeverity::Low => "LOW",
        }
    }
}

fn is_upper_snake_code(s: &str) -> bool {
    let b = s.as_bytes();
    if b.is_empty() {
        return false;
    }
    if !b[0].is_ascii_uppercase() {
        return false;
    }
    for &c in b.iter().skip(1) {
        if !(c.is_ascii_uppercase() || c.is_ascii_digit() || c == b'_') {
            return false;
        }
    }
    true
}

/// Structured failure journal payload. This is the system's only
/// error log; there is no separate unstructured sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorRecord {
    pub code: String,
    pub severity: ErrorSeverity,
    pub retriable: bool,
    pub details: String,
}

impl ErrorRecord {
    pub fn v1(
        code: impl Into<String>,
        severity: ErrorSeverity,
        retriable: bool,
        details: impl Into<String>,
    ) -> Result<Self, ContractViolation> {
        let r = Self {
            code: code.into(),
            severity,
            retriable,
            details: details.into(),
        };
        r.validate()?;
        Ok(r)
    }
}

impl Validate for ErrorRecord {
    fn validate(&self) -> Result<(), ContractViolation> {
        if !is_upper_snake_code(&self.code) {
            return Err(ContractViolation::InvalidValue {
                field: "error_record.code",
                reason: "must be UPPER_SNAKE_CASE (A-Z0-9_)",
            });
        }
        if self.code.len() > 64 {
            return Err(ContractViolation::InvalidValue {
                field: "error_record.code",
                reason: "must be <= 64 chars",
            });
        }
        if self.details.trim().is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "error_record.details",
                reason: "must not be empty",
            });
        }
        if self.details.len() > 512 {
            return Err(ContractViolation::InvalidValue {
                field: "error_record.details",
                reason: "must be <= 512 chars",
            });
        }
        Ok(())
    }
}

fn validate_opt_snapshot(
    field: &'static str,
    value: &Option<String>,
) -> Result<(), ContractViolation> {
    if let Some(v) = value {
        if v.trim().is_empty() {
            return Err(ContractViolation::InvalidValue {
                field,
                reason: "must not be empty when provided",
            });
        }
        if v.len() > MAX_SNAPSHOT_BYTES {
            return Err(ContractViolation::InvalidValue {
                field,
                reason: "exceeds max snapshot size",
            });
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub struct AuditEntryInput {
    pub schema_version: SchemaVersion,
    pub created_at: MonotonicTimeNs,
    pub conversation_id: Option<ConversationId>,
    pub actor: ActorRef,
    pub action: AuditAction,
    pub resource_type: AuditResourceType,
    pub resource_id: u64,
    /// Canonical JSON snapshots of the mutated row, when applicable.
    pub before: Option<String>,
    pub after: Option<String>,
    pub error: Option<ErrorRecord>,
}

impl AuditEntryInput {
    #[allow(clippy::too_many_arguments)]
    pub fn v1(
        created_at: MonotonicTimeNs,
        conversation_id: Option<ConversationId>,
        actor: ActorRef,
        action: AuditAction,
        resource_type: AuditResourceType,
        resource_id: u64,
        before: Option<String>,
        after: Option<String>,
        error: Option<ErrorRecord>,
    ) -> Result<Self, ContractViolation> {
        let e = Self {
            schema_version: AUDIT_CONTRACT_VERSION,
            created_at,
            conversation_id,
            actor,
            action,
            resource_type,
            resource_id,
            before,
            after,
            error,
        };
        e.validate()?;
        Ok(e)
    }
}

impl Validate for AuditEntryInput {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != AUDIT_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "audit_entry_input.schema_version",
                reason: "must match AUDIT_CONTRACT_VERSION",
            });
        }
        if self.created_at.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "audit_entry_input.created_at",
                reason: "must be > 0",
            });
        }
        if let Some(c) = self.conversation_id {
            c.validate()?;
        }
        self.actor.validate()?;
        if self.resource_id == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "audit_entry_input.resource_id",
                reason: "must be > 0",
            });
        }
        validate_opt_snapshot("audit_entry_input.before", &self.before)?;
        validate_opt_snapshot("audit_entry_input.after", &self.after)?;
        match (&self.action, &self.error) {
            (AuditAction::Error, None) => {
                return Err(ContractViolation::InvalidValue {
                    field: "audit_entry_input.error",
                    reason: "error entries must carry an error record",
                });
            }
            (AuditAction::Error, Some(e)) => e.validate()?,
            (_, Some(_)) => {
                return Err(ContractViolation::InvalidValue {
                    field: "audit_entry_input.error",
                    reason: "only error entries carry an error record",
                });
            }
            (_, None) => {}
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AuditEntry {
    pub schema_version: SchemaVersion,
    pub entry_id: AuditEntryId,
    pub created_at: MonotonicTimeNs,
    pub conversation_id: Option<ConversationId>,
    pub actor: ActorRef,
    pub action: AuditAction,
    pub resource_type: AuditResourceType,
    pub resource_id: u64,
    pub before: Option<String>,
    pub after: Option<String>,
    pub error: Option<ErrorRecord>,
}

impl AuditEntry {
    pub fn from_input_v1(
        entry_id: AuditEntryId,
        input: AuditEntryInput,
    ) -> Result<Self, ContractViolation> {
        input.validate()?;
        entry_id.validate()?;
        Ok(Self {
            schema_version: AUDIT_CONTRACT_VERSION,
            entry_id,
            created_at: input.created_at,
            conversation_id: input.conversation_id,
            actor: input.actor,
            action: input.action,
            resource_type: input.resource_type,
            resource_id: input.resource_id,
            before: input.before,
            after: input.after,
            error: input.error,
        })
    }
}
