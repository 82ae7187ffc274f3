#![forbid(unsafe_code)]

use crate::common::is_allowed_lifecycle_transition;
use crate::conversation::ConversationId;
use crate::{ContractViolation, LifecycleState, MonotonicTimeNs, ProducedBy, SchemaVersion, Validate};

pub const ARTIFACT_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

pub const MAX_INLINE_PAYLOAD_BYTES: usize = 65_536;

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

pub fn is_content_hash(value: &str) -> bool {
    let Some(hex) = value.strip_prefix("sha256:") else {
        return false;
    };
    hex.len() == 64 && hex.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ArtifactId(pub u64);

impl Validate for ArtifactId {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "artifact_id",
                reason: "must be > 0",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ArtifactVersion(pub u32);

impl Validate for ArtifactVersion {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "artifact_version",
                reason: "must be > 0",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ArtifactType {
    Recording,
    TranscriptVersion,
    Translation,
    Score,
    SurveyResponse,
    EvidenceManifest,
    EvidenceBundle,
}

impl ArtifactType {
    pub fn as_str(self) -> &'static str {
        match self {
            ArtifactType::Recording => "recording",
            ArtifactType::TranscriptVersion => "transcript_version",
            ArtifactType::Translation => "translation",
            ArtifactType::Score => "score",
            ArtifactType::SurveyResponse => "survey_response",
            ArtifactType::EvidenceManifest => "evidence_manifest",
            ArtifactType::EvidenceBundle => "evidence_bundle",
        }
    }

    /// Root artifacts enter the ledger without provenance parents.
    pub fn is_root(self) -> bool {
        matches!(self, ArtifactType::Recording | ArtifactType::SurveyResponse)
    }

    /// Raw media is never deletable, not even softly.
    pub fn is_never_deletable(self) -> bool {
        matches!(self, ArtifactType::Recording)
    }
}

/// Closed set of raw-media origins. Declared at creation, never
/// inferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ArtifactSource {
    VendorTelephony,
    DeviceCapture,
    OperatorUpload,
}

impl ArtifactSource {
    pub fn as_str(self) -> &'static str {
        match self {
            ArtifactSource::VendorTelephony => "vendor_telephony",
            ArtifactSource::DeviceCapture => "device_capture",
            ArtifactSource::OperatorUpload => "operator_upload",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactPayload {
    /// Structured data stored inline as a JSON document.
    InlineJson(String),
    /// Opaque reference to externally stored content (blob URI). The
    /// ledger hashes the reference, never the dereferenced bytes.
    ContentRef(String),
}

impl Validate for ArtifactPayload {
    fn validate(&self) -> Result<(), ContractViolation> {
        match self {
            ArtifactPayload::InlineJson(doc) => {
                if doc.trim().is_empty() {
                    return Err(ContractViolation::InvalidValue {
                        field: "artifact_payload.inline_json",
                        reason: "must not be empty",
                    });
                }
                if doc.len() > MAX_INLINE_PAYLOAD_BYTES {
                    return Err(ContractViolation::InvalidValue {
                        field: "artifact_payload.inline_json",
                        reason: "exceeds max inline payload size",
                    });
                }
                Ok(())
            }
            ArtifactPayload::ContentRef(r) => {
                validate_token("artifact_payload.content_ref", r, 256)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRecordInput {
    pub schema_version: SchemaVersion,
    pub conversation_id: ConversationId,
    pub artifact_type: ArtifactType,
    pub payload: ArtifactPayload,
    pub produced_by: ProducedBy,
    pub source: Option<ArtifactSource>,
}

impl ArtifactRecordInput {
    pub fn v1(
        conversation_id: ConversationId,
        artifact_type: ArtifactType,
        payload: ArtifactPayload,
        produced_by: ProducedBy,
        source: Option<ArtifactSource>,
    ) -> Result<Self, ContractViolation> {
        let r = Self {
            schema_version: ARTIFACT_CONTRACT_VERSION,
            conversation_id,
            artifact_type,
            payload,
            produced_by,
            source,
        };
        r.validate()?;
        Ok(r)
    }
}

impl Validate for ArtifactRecordInput {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != ARTIFACT_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "artifact_record_input.schema_version",
                reason: "must match ARTIFACT_CONTRACT_VERSION",
            });
        }
        self.conversation_id.validate()?;
        self.payload.validate()?;
        self.produced_by.validate()?;
        if self.artifact_type == ArtifactType::Recording && self.source.is_none() {
            return Err(ContractViolation::InvalidValue {
                field: "artifact_record_input.source",
                reason: "raw recordings must declare their origin",
            });
        }
        if self.artifact_type != ArtifactType::Recording && self.source.is_some() {
            return Err(ContractViolation::InvalidValue {
                field: "artifact_record_input.source",
                reason: "only raw recordings carry a source",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRecord {
    pub schema_version: SchemaVersion,
    pub artifact_id: ArtifactId,
    pub conversation_id: ConversationId,
    pub artifact_type: ArtifactType,
    pub payload: ArtifactPayload,
    pub content_hash: String,
    pub produced_by: ProducedBy,
    pub source: Option<ArtifactSource>,
    pub version: ArtifactVersion,
    pub created_at: MonotonicTimeNs,
    pub lifecycle: LifecycleState,
    pub deleted_at: Option<MonotonicTimeNs>,
}

impl ArtifactRecord {
    pub fn from_input_v1(
        artifact_id: ArtifactId,
        input: ArtifactRecordInput,
        content_hash: String,
        version: ArtifactVersion,
        created_at: MonotonicTimeNs,
    ) -> Result<Self, ContractViolation> {
        input.validate()?;
        let r = Self {
            schema_version: ARTIFACT_CONTRACT_VERSION,
            artifact_id,
            conversation_id: input.conversation_id,
            artifact_type: input.artifact_type,
            payload: input.payload,
            content_hash,
            produced_by: input.produced_by,
            source: input.source,
            version,
            created_at,
            lifecycle: LifecycleState::Active,
            deleted_at: None,
        };
        r.validate()?;
        Ok(r)
    }

    /// The one legal lifecycle mutation. Everything else on this row
    /// is locked after creation.
    pub fn soft_deleted_v1(mut self, deleted_at: MonotonicTimeNs) -> Result<Self, ContractViolation> {
        if !is_allowed_lifecycle_transition(self.lifecycle, LifecycleState::SoftDeleted) {
            return Err(ContractViolation::InvalidValue {
                field: "artifact_record.lifecycle",
                reason: "soft delete is one-way",
            });
        }
        self.lifecycle = LifecycleState::SoftDeleted;
        self.deleted_at = Some(deleted_at);
        self.validate()?;
        Ok(self)
    }
}

impl Validate for ArtifactRecord {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != ARTIFACT_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "artifact_record.schema_version",
                reason: "must match ARTIFACT_CONTRACT_VERSION",
            });
        }
        self.artifact_id.validate()?;
        self.conversation_id.validate()?;
        self.payload.validate()?;
        self.produced_by.validate()?;
        self.version.validate()?;
        if !is_content_hash(&self.content_hash) {
            return Err(ContractViolation::InvalidValue {
                field: "artifact_record.content_hash",
                reason: "must be sha256:<64 lowercase hex>",
            });
        }
        if self.created_at.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "artifact_record.created_at",
                reason: "must be > 0",
            });
        }
        match self.lifecycle {
            LifecycleState::Active => {
                if self.deleted_at.is_some() {
                    return Err(ContractViolation::InvalidValue {
                        field: "artifact_record.deleted_at",
                        reason: "must be unset while active",
                    });
                }
            }
            LifecycleState::SoftDeleted => {
                if self.deleted_at.is_none() {
                    return Err(ContractViolation::InvalidValue {
                        field: "artifact_record.deleted_at",
                        reason: "must be set once soft-deleted",
                    });
                }
            }
        }
        Ok(())
    }
}
