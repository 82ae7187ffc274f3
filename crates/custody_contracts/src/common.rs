#![forbid(unsafe_code)]

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SchemaVersion(pub u32);

/// Server-clock timestamp. Callers at the process edge read the clock
/// once and thread the value through; record types never accept a
/// client-supplied timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MonotonicTimeNs(pub u64);

impl MonotonicTimeNs {
    pub fn saturating_add_ms(self, ms: u64) -> Self {
        Self(self.0.saturating_add(ms.saturating_mul(1_000_000)))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ContractViolation {
    InvalidValue {
        field: &'static str,
        reason: &'static str,
    },
    InvalidRange {
        field: &'static str,
        min: f64,
        max: f64,
        got: f64,
    },
    NotFinite {
        field: &'static str,
    },
}

pub trait Validate {
    fn validate(&self) -> Result<(), ContractViolation>;
}

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

/// Uniform soft-delete marker shared by every ledger entity. The only
/// legal transition is `Active -> SoftDeleted`; restoration happens by
/// creating a new row that references the old one through provenance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LifecycleState {
    Active,
    SoftDeleted,
}

pub fn is_allowed_lifecycle_transition(from: LifecycleState, to: LifecycleState) -> bool {
    matches!(
        (from, to),
        (LifecycleState::Active, LifecycleState::SoftDeleted)
    )
}

/// Request attribution. Always passed explicitly into mutating
/// operations; there is no ambient actor context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActorRef {
    System,
    Human { user_id: String },
    Vendor { vendor_key: String },
    Automation { job_name: String },
}

impl ActorRef {
    pub fn actor_type(&self) -> &'static str {
        match self {
            ActorRef::System => "system",
            ActorRef::Human { .. } => "human",
            ActorRef::Vendor { .. } => "vendor",
            ActorRef::Automation { .. } => "automation",
        }
    }

    pub fn actor_id(&self) -> Option<&str> {
        match self {
            ActorRef::System => None,
            ActorRef::Human { user_id } => Some(user_id),
            ActorRef::Vendor { vendor_key } => Some(vendor_key),
            ActorRef::Automation { job_name } => Some(job_name),
        }
    }
}

impl Validate for ActorRef {
    fn validate(&self) -> Result<(), ContractViolation> {
        match self {
            ActorRef::System => Ok(()),
            ActorRef::Human { user_id } => validate_token("actor_ref.user_id", user_id, 128),
            ActorRef::Vendor { vendor_key } => {
                validate_token("actor_ref.vendor_key", vendor_key, 128)
            }
            ActorRef::Automation { job_name } => {
                validate_token("actor_ref.job_name", job_name, 128)
            }
        }
    }
}

/// Evidence attribution: who or what produced an artifact's content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProducedBy {
    System,
    Human { user_id: String },
    Model { model_name: String },
}

impl ProducedBy {
    /// Stable label used inside canonical bundle tuples.
    pub fn label(&self) -> String {
        match self {
            ProducedBy::System => "system".to_string(),
            ProducedBy::Human { user_id } => format!("human:{user_id}"),
            ProducedBy::Model { model_name } => format!("model:{model_name}"),
        }
    }
}

impl Validate for ProducedBy {
    fn validate(&self) -> Result<(), ContractViolation> {
        match self {
            ProducedBy::System => Ok(()),
            ProducedBy::Human { user_id } => validate_token("produced_by.user_id", user_id, 128),
            ProducedBy::Model { model_name } => {
                validate_token("produced_by.model_name", model_name, 128)
            }
        }
    }
}
