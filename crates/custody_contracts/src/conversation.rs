#![forbid(unsafe_code)]

use crate::{ActorRef, ContractViolation, MonotonicTimeNs, SchemaVersion, Validate};

pub const CONVERSATION_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

fn validate_opt_token(
    field: &'static str,
    value: &Option<String>,
    max_len: usize,
) -> Result<(), ContractViolation> {
    if let Some(v) = value {
        if v.trim().is_empty() {
            return Err(ContractViolation::InvalidValue {
                field,
                reason: "must not be empty when provided",
            });
        }
        if v.len() > max_len {
            return Err(ContractViolation::InvalidValue {
                field,
                reason: "exceeds max length",
            });
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConversationId(pub u64);

impl Validate for ConversationId {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "conversation_id",
                reason: "must be > 0",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConversationStatus {
    Pending,
    Active,
    Ended,
}

impl ConversationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ConversationStatus::Pending => "pending",
            ConversationStatus::Active => "active",
            ConversationStatus::Ended => "ended",
        }
    }
}

/// `Pending -> Ended` covers calls abandoned before answer.
pub fn is_allowed_conversation_transition(
    from: ConversationStatus,
    to: ConversationStatus,
) -> bool {
    matches!(
        (from, to),
        (ConversationStatus::Pending, ConversationStatus::Active)
            | (ConversationStatus::Pending, ConversationStatus::Ended)
            | (ConversationStatus::Active, ConversationStatus::Ended)
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationRecordInput {
    pub schema_version: SchemaVersion,
    pub created_at: MonotonicTimeNs,
    pub created_by: ActorRef,
    /// Vendor-side reference for the call leg (e.g. a call SID).
    pub external_ref: Option<String>,
}

impl ConversationRecordInput {
    pub fn v1(
        created_at: MonotonicTimeNs,
        created_by: ActorRef,
        external_ref: Option<String>,
    ) -> Result<Self, ContractViolation> {
        let r = Self {
            schema_version: CONVERSATION_CONTRACT_VERSION,
            created_at,
            created_by,
            external_ref,
        };
        r.validate()?;
        Ok(r)
    }
}

impl Validate for ConversationRecordInput {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != CONVERSATION_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "conversation_record_input.schema_version",
                reason: "must match CONVERSATION_CONTRACT_VERSION",
            });
        }
        if self.created_at.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "conversation_record_input.created_at",
                reason: "must be > 0",
            });
        }
        self.created_by.validate()?;
        validate_opt_token(
            "conversation_record_input.external_ref",
            &self.external_ref,
            128,
        )?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationRecord {
    pub schema_version: SchemaVersion,
    pub conversation_id: ConversationId,
    pub status: ConversationStatus,
    pub started_at: Option<MonotonicTimeNs>,
    pub ended_at: Option<MonotonicTimeNs>,
    pub created_by: ActorRef,
    pub created_at: MonotonicTimeNs,
    pub external_ref: Option<String>,
}

impl ConversationRecord {
    pub fn from_input_v1(
        conversation_id: ConversationId,
        input: ConversationRecordInput,
    ) -> Result<Self, ContractViolation> {
        input.validate()?;
        let r = Self {
            schema_version: CONVERSATION_CONTRACT_VERSION,
            conversation_id,
            status: ConversationStatus::Pending,
            started_at: None,
            ended_at: None,
            created_by: input.created_by,
            created_at: input.created_at,
            external_ref: input.external_ref,
        };
        r.validate()?;
        Ok(r)
    }
}

impl Validate for ConversationRecord {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != CONVERSATION_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "conversation_record.schema_version",
                reason: "must match CONVERSATION_CONTRACT_VERSION",
            });
        }
        self.conversation_id.validate()?;
        if self.created_at.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "conversation_record.created_at",
                reason: "must be > 0",
            });
        }
        self.created_by.validate()?;
        validate_opt_token("conversation_record.external_ref", &self.external_ref, 128)?;
        if self.status == ConversationStatus::Ended && self.ended_at.is_none() {
            return Err(ContractViolation::InvalidValue {
                field: "conversation_record.ended_at",
                reason: "must be set when status is ended",
            });
        }
        if self.status != ConversationStatus::Ended && self.ended_at.is_some() {
            return Err(ContractViolation::InvalidValue {
                field: "conversation_record.ended_at",
                reason: "must be unset unless status is ended",
            });
        }
        Ok(())
    }
}
