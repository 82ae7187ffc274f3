#![forbid(unsafe_code)]

use crate::artifact::{is_content_hash, ArtifactId, ArtifactVersion};
use crate::{ContractViolation, MonotonicTimeNs, ProducedBy, SchemaVersion, Validate};

pub const PROVENANCE_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

pub const MAX_INPUT_REFS: usize = 16;

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
pub enum InputRefKind {
    /// Another ledger artifact, referenced by its row id.
    Artifact,
    /// Content outside the ledger (vendor media URL, model prompt).
    External,
}

impl InputRefKind {
    pub fn as_str(self) -> &'static str {
        match self {
            InputRefKind::Artifact => "artifact",
            InputRefKind::External => "external",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputRef {
    pub kind: InputRefKind,
    pub ref_id: String,
    pub content_hash: String,
}

impl InputRef {
    pub fn v1(
        kind: InputRefKind,
        ref_id: impl Into<String>,
        content_hash: impl Into<String>,
    ) -> Result<Self, ContractViolation> {
        let r = Self {
            kind,
            ref_id: ref_id.into(),
            content_hash: content_hash.into(),
        };
        r.validate()?;
        Ok(r)
    }
}

impl Validate for InputRef {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_token("input_ref.ref_id", &self.ref_id, 256)?;
        if !is_content_hash(&self.content_hash) {
            return Err(ContractViolation::InvalidValue {
                field: "input_ref.content_hash",
                reason: "must be sha256:<64 lowercase hex>",
            });
        }
        Ok(())
    }
}

/// One provenance record per artifact, written in the same mutation
/// that creates the artifact row. Edges always point from a newer id
/// to an already-persisted one, so the graph cannot acquire a cycle
/// through the public API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvenanceEdge {
    pub schema_version: SchemaVersion,
    pub artifact_id: ArtifactId,
    pub parent_artifact_id: Option<ArtifactId>,
    pub produced_by: ProducedBy,
    pub input_refs: Vec<InputRef>,
    pub version: ArtifactVersion,
    pub produced_at: MonotonicTimeNs,
}

impl ProvenanceEdge {
    pub fn v1(
        artifact_id: ArtifactId,
        parent_artifact_id: Option<ArtifactId>,
        produced_by: ProducedBy,
        input_refs: Vec<InputRef>,
        version: ArtifactVersion,
        produced_at: MonotonicTimeNs,
    ) -> Result<Self, ContractViolation> {
        let e = Self {
            schema_version: PROVENANCE_CONTRACT_VERSION,
            artifact_id,
            parent_artifact_id,
            produced_by,
            input_refs,
            version,
            produced_at,
        };
        e.validate()?;
        Ok(e)
    }
}

impl Validate for ProvenanceEdge {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != PROVENANCE_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "provenance_edge.schema_version",
                reason: "must match PROVENANCE_CONTRACT_VERSION",
            });
        }
        self.artifact_id.validate()?;
        if let Some(parent) = self.parent_artifact_id {
            parent.validate()?;
            if parent == self.artifact_id {
                return Err(ContractViolation::InvalidValue {
                    field: "provenance_edge.parent_artifact_id",
                    reason: "artifact cannot be its own parent",
                });
            }
        }
        self.produced_by.validate()?;
        if self.input_refs.len() > MAX_INPUT_REFS {
            return Err(ContractViolation::InvalidValue {
                field: "provenance_edge.input_refs",
                reason: "exceeds max input refs",
            });
        }
        for r in &self.input_refs {
            r.validate()?;
        }
        self.version.validate()?;
        if self.produced_at.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "provenance_edge.produced_at",
                reason: "must be > 0",
            });
        }
        Ok(())
    }
}
