#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use custody_contracts::delivery::{DeliveryEventType, DeliveryTarget};
use custody_contracts::{ContractViolation, Validate};

/// Event-to-target routing. This is configuration handed in by the
/// integration surface, not ledger data; the processor only reads it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryRegistry {
    routes: BTreeMap<DeliveryEventType, Vec<DeliveryTarget>>,
    default_max_attempts: u16,
}

impl DeliveryRegistry {
    pub fn mvp_v1() -> Self {
        Self {
            routes: BTreeMap::new(),
            default_max_attempts: 5,
        }
    }

    pub fn with_max_attempts(max_attempts: u16) -> Result<Self, ContractViolation> {
        if max_attempts == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "delivery_registry.max_attempts",
                reason: "must be >= 1",
            });
        }
        Ok(Self {
            routes: BTreeMap::new(),
            default_max_attempts: max_attempts,
        })
    }

    pub fn default_max_attempts(&self) -> u16 {
        self.default_max_attempts
    }

    /// Registering the same target twice for one event is a no-op.
    pub fn register(
        &mut self,
        event_type: DeliveryEventType,
        target: DeliveryTarget,
    ) -> Result<(), ContractViolation> {
        target.validate()?;
        if let DeliveryTarget::Webhook { url } = &target {
            // Target URLs come from the integration UI; parse them
            // strictly before they can reach the worker.
            let parsed = url::Url::parse(url).map_err(|_| ContractViolation::InvalidValue {
                field: "delivery_target.url",
                reason: "must parse as a URL",
            })?;
            if parsed.host_str().is_none() {
                return Err(ContractViolation::InvalidValue {
                    field: "delivery_target.url",
                    reason: "must include a host",
                });
            }
        }
        let targets = self.routes.entry(event_type).or_default();
        if !targets.contains(&target) {
            targets.push(target);
        }
        Ok(())
    }

    pub fn targets_for(&self, event_type: DeliveryEventType) -> &[DeliveryTarget] {
        self.routes
            .get(&event_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}
