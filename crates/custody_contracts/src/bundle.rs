#![forbid(unsafe_code)]

use serde::Serialize;

use crate::artifact::is_content_hash;
use crate::conversation::ConversationId;
use crate::{ContractViolation, MonotonicTimeNs, SchemaVersion, Validate};

pub const BUNDLE_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EvidenceBundleId(pub u64);

impl Validate for EvidenceBundleId {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "evidence_bundle_id",
                reason: "must be > 0",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BundleVersion(pub u32);

impl Validate for BundleVersion {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "bundle_version",
                reason: "must be > 0",
            });
        }
        Ok(())
    }
}

/// One canonical tuple per artifact in the bundle closure. Field
/// values are plain scalars so the canonical bytes stay stable across
/// contract refactors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BundleArtifactRef {
    pub artifact_id: u64,
    pub content_hash: String,
    pub produced_by: String,
    pub produced_at_ns: u64,
}

impl Validate for BundleArtifactRef {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.artifact_id == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "bundle_artifact_ref.artifact_id",
                reason: "must be > 0",
            });
        }
        if !is_content_hash(&self.content_hash) {
            return Err(ContractViolation::InvalidValue {
                field: "bundle_artifact_ref.content_hash",
                reason: "must be sha256:<64 lowercase hex>",
            });
        }
        if self.produced_by.trim().is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "bundle_artifact_ref.produced_by",
                reason: "must not be empty",
            });
        }
        if self.produced_at_ns == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "bundle_artifact_ref.produced_at_ns",
                reason: "must be > 0",
            });
        }
        Ok(())
    }
}

/// Bundle metadata that participates in the bundle hash. Deliberately
/// excludes version and creation time so rebuilding an unchanged
/// conversation reproduces the hash byte-for-byte.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BundleMetadata {
    pub conversation_id: u64,
    pub canon_rules_version: u32,
    pub artifact_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvidenceBundleRecordInput {
    pub schema_version: SchemaVersion,
    pub conversation_id: ConversationId,
    pub artifact_refs: Vec<BundleArtifactRef>,
    pub bundle_payload: String,
    pub bundle_hash: String,
    pub parent_bundle_id: Option<EvidenceBundleId>,
    pub version: BundleVersion,
    pub created_at: MonotonicTimeNs,
}

impl EvidenceBundleRecordInput {
    #[allow(clippy::too_many_arguments)]
    pub fn v1(
        conversation_id: ConversationId,
        artifact_refs: Vec<BundleArtifactRef>,
        bundle_payload: String,
        bundle_hash: String,
        parent_bundle_id: Option<EvidenceBundleId>,
        version: BundleVersion,
        created_at: MonotonicTimeNs,
    ) -> Result<Self, ContractViolation> {
        let r = Self {
            schema_version: BUNDLE_CONTRACT_VERSION,
            conversation_id,
            artifact_refs,
            bundle_payload,
            bundle_hash,
            parent_bundle_id,
            version,
            created_at,
        };
        r.validate()?;
        Ok(r)
    }
}

impl Validate for EvidenceBundleRecordInput {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != BUNDLE_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "evidence_bundle_record_input.schema_version",
                reason: "must match BUNDLE_CONTRACT_VERSION",
            });
        }
        self.conversation_id.validate()?;
        if self.artifact_refs.is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "evidence_bundle_record_input.artifact_refs",
                reason: "must reference at least one artifact",
            });
        }
        for r in &self.artifact_refs {
            r.validate()?;
        }
        if self.bundle_payload.trim().is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "evidence_bundle_record_input.bundle_payload",
                reason: "must not be empty",
            });
        }
        if !is_content_hash(&self.bundle_hash) {
            return Err(ContractViolation::InvalidValue {
                field: "evidence_bundle_record_input.bundle_hash",
                reason: "must be sha256:<64 lowercase hex>",
            });
        }
        if let Some(parent) = self.parent_bundle_id {
            parent.validate()?;
            if self.version.0 < 2 {
                return Err(ContractViolation::InvalidValue {
                    field: "evidence_bundle_record_input.version",
                    reason: "must be >= 2 when a parent bundle exists",
                });
            }
        } else if self.version.0 != 1 {
            return Err(ContractViolation::InvalidValue {
                field: "evidence_bundle_record_input.version",
                reason: "first bundle version must be 1",
            });
        }
        self.version.validate()?;
        if self.created_at.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "evidence_bundle_record_input.created_at",
                reason: "must be > 0",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvidenceBundleRecord {
    pub schema_version: SchemaVersion,
    pub bundle_id: EvidenceBundleId,
    pub conversation_id: ConversationId,
    pub artifact_refs: Vec<BundleArtifactRef>,
    pub bundle_payload: String,
    pub bundle_hash: String,
    pub parent_bundle_id: Option<EvidenceBundleId>,
    pub version: BundleVersion,
    pub created_at: MonotonicTimeNs,
}

impl EvidenceBundleRecord {
    pub fn from_input_v1(
        bundle_id: EvidenceBundleId,
        input: EvidenceBundleRecordInput,
    ) -> Result<Self, ContractViolation> {
        input.validate()?;
        bundle_id.validate()?;
        Ok(Self {
            schema_version: BUNDLE_CONTRACT_VERSION,
            bundle_id,
            conversation_id: input.conversation_id,
            artifact_refs: input.artifact_refs,
            bundle_payload: input.bundle_payload,
            bundle_hash: input.bundle_hash,
            parent_bundle_id: input.parent_bundle_id,
            version: input.version,
            created_at: input.created_at,
        })
    }
}
