#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use custody_contracts::artifact::{
    ArtifactId, ArtifactRecord, ArtifactRecordInput, ArtifactType, ArtifactVersion,
};
use custody_contracts::audit::{
    AuditAction, AuditEntry, AuditEntryId, AuditEntryInput, AuditResourceType, ErrorRecord,
    ErrorSeverity,
};
use custody_contracts::bundle::{
    BundleVersion, EvidenceBundleId, EvidenceBundleRecord, EvidenceBundleRecordInput,
};
use custody_contracts::conversation::{
    is_allowed_conversation_transition, ConversationId, ConversationRecord,
    ConversationRecordInput, ConversationStatus,
};
use custody_contracts::delivery::{
    is_allowed_task_transition, DeliveryTaskId, DeliveryTaskInput, DeliveryTaskRecord,
    DeliveryTaskStatus,
};
use custody_contracts::provenance::{InputRef, ProvenanceEdge};
use custody_contracts::{ActorRef, ContractViolation, LifecycleState, MonotonicTimeNs, Validate};

use crate::canon;

#[derive(Debug, Clone, PartialEq)]
pub enum LedgerError {
    ForeignKeyViolation {
        table: &'static str,
        key: String,
    },
    DuplicateKey {
        table: &'static str,
        key: String,
    },
    AppendOnlyViolation {
        table: &'static str,
    },
    ImmutabilityViolation {
        table: &'static str,
        field: &'static str,
    },
    TransitionViolation {
        table: &'static str,
        from: &'static str,
        to: &'static str,
    },
    LeaseViolation {
        key: String,
    },
    IncompleteEvidence {
        conversation_id: ConversationId,
        detail: String,
    },
    ContractViolation(ContractViolation),
}

impl From<ContractViolation> for LedgerError {
    fn from(v: ContractViolation) -> Self {
        LedgerError::ContractViolation(v)
    }
}

/// Fields a generic update may touch, per table. Everything else is
/// locked once the row exists; the allowed fields still change only
/// through their dedicated narrow paths.
pub const ARTIFACT_MUTABLE_FIELDS: &[&str] = &["deleted_at"];
pub const CONVERSATION_MUTABLE_FIELDS: &[&str] = &["status", "ended_at"];

/// In-memory relational ledger. One instance owns all evidence and
/// delivery state; server timestamps give audit entries a total order
/// within the instance.
#[derive(Debug, Default)]
pub struct LedgerStore {
    conversations: BTreeMap<ConversationId, ConversationRecord>,
    next_conversation_id: u64,

    artifacts: BTreeMap<ArtifactId, ArtifactRecord>,
    artifacts_by_conversation: BTreeMap<ConversationId, Vec<ArtifactId>>,
    // Lineage version counter per (conversation, artifact type).
    artifact_lineage_versions: BTreeMap<(ConversationId, ArtifactType), u32>,
    next_artifact_id: u64,

    // One provenance record per artifact, written in the same mutation
    // that creates the artifact row. Never retrofitted.
    provenance_edges: BTreeMap<ArtifactId, ProvenanceEdge>,

    audit_entries: Vec<AuditEntry>,
    next_audit_entry_id: u64,

    bundles: Vec<EvidenceBundleRecord>,
    next_bundle_id: u64,

    delivery_tasks: BTreeMap<DeliveryTaskId, DeliveryTaskRecord>,
    // idempotency_key -> newest task for that key.
    delivery_idempotency_index: BTreeMap<String, DeliveryTaskId>,
    next_delivery_task_id: u64,
}

impl LedgerStore {
    pub fn new_in_memory() -> Self {
        Self {
            next_conversation_id: 1,
            next_artifact_id: 1,
            next_audit_entry_id: 1,
            next_bundle_id: 1,
            next_delivery_task_id: 1,
            ..Self::default()
        }
    }

    // ------------------------
    // Conversations.
    // ------------------------

    pub fn insert_conversation(
        &mut self,
        input: ConversationRecordInput,
        actor: ActorRef,
    ) -> Result<ConversationRecord, LedgerError> {
        input.validate()?;
        let conversation_id = ConversationId(self.next_conversation_id);
        let record = ConversationRecord::from_input_v1(conversation_id, input)?;
        let audit = AuditEntryInput::v1(
            record.created_at,
            Some(conversation_id),
            actor,
            AuditAction::ConversationCreated,
            AuditResourceType::Conversation,
            conversation_id.0,
            None,
            Some(conversation_snapshot(&record)),
            None,
        )?;

        self.next_conversation_id = self.next_conversation_id.saturating_add(1);
        self.conversations.insert(conversation_id, record.clone());
        self.push_audit_entry(audit)?;
        Ok(record)
    }

    pub fn conversation(&self, conversation_id: ConversationId) -> Option<&ConversationRecord> {
        self.conversations.get(&conversation_id)
    }

    /// The one narrow path through which `status`/`ended_at` change.
    pub fn update_conversation_status(
        &mut self,
        now: MonotonicTimeNs,
        conversation_id: ConversationId,
        to: ConversationStatus,
        actor: ActorRef,
    ) -> Result<ConversationRecord, LedgerError> {
        let current = self.conversations.get(&conversation_id).ok_or_else(|| {
            LedgerError::ForeignKeyViolation {
                table: "conversations",
                key: conversation_id.0.to_string(),
            }
        })?;
        if !is_allowed_conversation_transition(current.status, to) {
            return Err(LedgerError::TransitionViolation {
                table: "conversations",
                from: current.status.as_str(),
                to: to.as_str(),
            });
        }

        let before = conversation_snapshot(current);
        let mut updated = current.clone();
        updated.status = to;
        match to {
            ConversationStatus::Active => {
                if updated.started_at.is_none() {
                    updated.started_at = Some(now);
                }
            }
            ConversationStatus::Ended => {
                updated.ended_at = Some(now);
            }
            ConversationStatus::Pending => {}
        }
        updated.validate()?;
        let audit = AuditEntryInput::v1(
            now,
            Some(conversation_id),
            actor,
            AuditAction::ConversationStatusChanged,
            AuditResourceType::Conversation,
            conversation_id.0,
            Some(before),
            Some(conversation_snapshot(&updated)),
            None,
        )?;

        self.conversations.insert(conversation_id, updated.clone());
        self.push_audit_entry(audit)?;
        Ok(updated)
    }

    /// Application-layer immutability guard for the conversation row.
    /// A rejected write is itself evidence: the violation is journaled
    /// before the error propagates.
    pub fn attempt_update_conversation_field(
        &mut self,
        now: MonotonicTimeNs,
        conversation_id: ConversationId,
        field: &'static str,
        actor: ActorRef,
    ) -> Result<(), LedgerError> {
        if self.conversations.get(&conversation_id).is_none() {
            return Err(LedgerError::ForeignKeyViolation {
                table: "conversations",
                key: conversation_id.0.to_string(),
            });
        }
        if CONVERSATION_MUTABLE_FIELDS.contains(&field) {
            return Err(LedgerError::ContractViolation(
                ContractViolation::InvalidValue {
                    field: "conversation.update",
                    reason: "mutable fields change only through update_conversation_status",
                },
            ));
        }
        self.journal_error(
            now,
            AuditResourceType::Conversation,
            conversation_id.0,
            Some(conversation_id),
            actor,
            ErrorRecord::v1(
                "IMMUTABLE_FIELD_WRITE_REJECTED",
                ErrorSeverity::High,
                false,
                format!("conversation field `{field}` is locked after creation"),
            )?,
        )?;
        Err(LedgerError::ImmutabilityViolation {
            table: "conversations",
            field,
        })
    }

    // ------------------------
    // Artifacts + provenance (single atomic mutation).
    // ------------------------

    /// Creates the artifact row, its provenance edge, and the audit
    /// entry as one all-or-nothing mutation: every fallible step runs
    /// before the first table write, so readers never observe an
    /// artifact without its provenance and audit trail.
    pub fn create_artifact(
        &mut self,
        now: MonotonicTimeNs,
        input: ArtifactRecordInput,
        parent_artifact_id: Option<ArtifactId>,
        input_refs: Vec<InputRef>,
        actor: ActorRef,
    ) -> Result<ArtifactRecord, LedgerError> {
        input.validate()?;
        if !self.conversations.contains_key(&input.conversation_id) {
            return Err(LedgerError::ForeignKeyViolation {
                table: "conversations",
                key: input.conversation_id.0.to_string(),
            });
        }
        if let Some(parent) = parent_artifact_id {
            let parent_row =
                self.artifacts
                    .get(&parent)
                    .ok_or_else(|| LedgerError::ForeignKeyViolation {
                        table: "artifacts",
                        key: parent.0.to_string(),
                    })?;
            if parent_row.conversation_id != input.conversation_id {
                return Err(LedgerError::ContractViolation(
                    ContractViolation::InvalidValue {
                        field: "provenance_edge.parent_artifact_id",
                        reason: "parent must belong to the same conversation",
                    },
                ));
            }
        }
        if !input.artifact_type.is_root() && parent_artifact_id.is_none() && input_refs.is_empty() {
            return Err(LedgerError::ContractViolation(
                ContractViolation::InvalidValue {
                    field: "provenance_edge",
                    reason: "derived artifacts must declare a parent or input refs",
                },
            ));
        }

        let lineage_key = (input.conversation_id, input.artifact_type);
        let version = ArtifactVersion(
            self.artifact_lineage_versions
                .get(&lineage_key)
                .copied()
                .unwrap_or(0)
                .saturating_add(1),
        );
        let content_hash = canon::artifact_content_hash(&input.payload)?;
        let artifact_id = ArtifactId(self.next_artifact_id);
        if self.artifacts.contains_key(&artifact_id) || self.provenance_edges.contains_key(&artifact_id)
        {
            return Err(LedgerError::DuplicateKey {
                table: "artifacts",
                key: artifact_id.0.to_string(),
            });
        }
        let conversation_id = input.conversation_id;
        let produced_by = input.produced_by.clone();
        let record =
            ArtifactRecord::from_input_v1(artifact_id, input, content_hash, version, now)?;
        let edge = ProvenanceEdge::v1(
            artifact_id,
            parent_artifact_id,
            produced_by,
            input_refs,
            version,
            now,
        )?;
        let audit = AuditEntryInput::v1(
            now,
            Some(conversation_id),
            actor,
            AuditAction::ArtifactCreated,
            AuditResourceType::Artifact,
            artifact_id.0,
            None,
            Some(artifact_snapshot(&record)),
            None,
        )?;

        self.next_artifact_id = self.next_artifact_id.saturating_add(1);
        self.artifact_lineage_versions.insert(lineage_key, version.0);
        self.artifacts.insert(artifact_id, record.clone());
        self.artifacts_by_conversation
            .entry(conversation_id)
            .or_default()
            .push(artifact_id);
        self.provenance_edges.insert(artifact_id, edge);
        self.push_audit_entry(audit)?;
        Ok(record)
    }

    /// Default read path: soft-deleted rows are hidden.
    pub fn artifact(&self, artifact_id: ArtifactId) -> Option<&ArtifactRecord> {
        self.artifacts
            .get(&artifact_id)
            .filter(|a| a.lifecycle == LifecycleState::Active)
    }

    /// Audit/compliance read path.
    pub fn artifact_including_deleted(&self, artifact_id: ArtifactId) -> Option<&ArtifactRecord> {
        self.artifacts.get(&artifact_id)
    }

    pub fn artifacts_by_conversation(
        &self,
        conversation_id: ConversationId,
        include_deleted: bool,
    ) -> Vec<&ArtifactRecord> {
        self.artifacts_by_conversation
            .get(&conversation_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.artifacts.get(id))
                    .filter(|a| include_deleted || a.lifecycle == LifecycleState::Active)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn soft_delete_artifact(
        &mut self,
        now: MonotonicTimeNs,
        artifact_id: ArtifactId,
        actor: ActorRef,
    ) -> Result<ArtifactRecord, LedgerError> {
        let current =
            self.artifacts
                .get(&artifact_id)
                .ok_or_else(|| LedgerError::ForeignKeyViolation {
                    table: "artifacts",
                    key: artifact_id.0.to_string(),
                })?;
        if current.artifact_type.is_never_deletable() {
            let conversation_id = current.conversation_id;
            self.journal_error(
                now,
                AuditResourceType::Artifact,
                artifact_id.0,
                Some(conversation_id),
                actor,
                ErrorRecord::v1(
                    "RAW_MEDIA_DELETE_REJECTED",
                    ErrorSeverity::High,
                    false,
                    "raw recordings are never deletable",
                )?,
            )?;
            return Err(LedgerError::ImmutabilityViolation {
                table: "artifacts",
                field: "deleted_at",
            });
        }

        let before = artifact_snapshot(current);
        let conversation_id = current.conversation_id;
        let updated = current.clone().soft_deleted_v1(now)?;
        let audit = AuditEntryInput::v1(
            now,
            Some(conversation_id),
            actor,
            AuditAction::ArtifactSoftDeleted,
            AuditResourceType::Artifact,
            artifact_id.0,
            Some(before),
            Some(artifact_snapshot(&updated)),
            None,
        )?;

        self.artifacts.insert(artifact_id, updated.clone());
        self.push_audit_entry(audit)?;
        Ok(updated)
    }

    /// Application-layer immutability guard for artifact rows. Checks
    /// the mutable-field allow-list, journals the rejection, and
    /// refuses.
    pub fn attempt_update_artifact_field(
        &mut self,
        now: MonotonicTimeNs,
        artifact_id: ArtifactId,
        field: &'static str,
        actor: ActorRef,
    ) -> Result<(), LedgerError> {
        let conversation_id = self
            .artifacts
            .get(&artifact_id)
            .map(|a| a.conversation_id)
            .ok_or_else(|| LedgerError::ForeignKeyViolation {
                table: "artifacts",
                key: artifact_id.0.to_string(),
            })?;
        if ARTIFACT_MUTABLE_FIELDS.contains(&field) {
            return Err(LedgerError::ContractViolation(
                ContractViolation::InvalidValue {
                    field: "artifact.update",
                    reason: "mutable fields change only through soft_delete_artifact",
                },
            ));
        }
        self.journal_error(
            now,
            AuditResourceType::Artifact,
            artifact_id.0,
            Some(conversation_id),
            actor,
            ErrorRecord::v1(
                "IMMUTABLE_FIELD_WRITE_REJECTED",
                ErrorSeverity::High,
                false,
                format!("artifact field `{field}` is locked after creation"),
            )?,
        )?;
        Err(LedgerError::ImmutabilityViolation {
            table: "artifacts",
            field,
        })
    }

    pub fn attempt_overwrite_artifact_row(
        &mut self,
        _artifact_id: ArtifactId,
    ) -> Result<(), LedgerError> {
        Err(LedgerError::AppendOnlyViolation { table: "artifacts" })
    }

    // ------------------------
    // Provenance graph.
    // ------------------------

    pub fn provenance_edge(&self, artifact_id: ArtifactId) -> Option<&ProvenanceEdge> {
        self.provenance_edges.get(&artifact_id)
    }

    pub fn attempt_overwrite_provenance_edge(
        &mut self,
        _artifact_id: ArtifactId,
    ) -> Result<(), LedgerError> {
        Err(LedgerError::AppendOnlyViolation {
            table: "provenance_edges",
        })
    }

    /// Walks parent pointers to the root, nearest ancestor first.
    /// Finite by construction: edges only ever point at ids persisted
    /// before the child existed. Soft-deleted ancestors are included;
    /// the caller decides how to treat them.
    pub fn ancestors(&self, artifact_id: ArtifactId) -> Result<Vec<&ArtifactRecord>, LedgerError> {
        if !self.artifacts.contains_key(&artifact_id) {
            return Err(LedgerError::ForeignKeyViolation {
                table: "artifacts",
                key: artifact_id.0.to_string(),
            });
        }
        let mut chain = Vec::new();
        let mut cursor = artifact_id;
        while let Some(parent_id) = self
            .provenance_edges
            .get(&cursor)
            .and_then(|e| e.parent_artifact_id)
        {
            let parent =
                self.artifacts
                    .get(&parent_id)
                    .ok_or_else(|| LedgerError::ForeignKeyViolation {
                        table: "artifacts",
                        key: parent_id.0.to_string(),
                    })?;
            chain.push(parent);
            cursor = parent_id;
        }
        Ok(chain)
    }

    // ------------------------
    // Audit trail.
    // ------------------------

    pub fn append_audit_entry(
        &mut self,
        input: AuditEntryInput,
    ) -> Result<AuditEntryId, LedgerError> {
        input.validate()?;
        self.push_audit_entry(input)
    }

    fn push_audit_entry(&mut self, input: AuditEntryInput) -> Result<AuditEntryId, LedgerError> {
        let entry_id = AuditEntryId(self.next_audit_entry_id);
        let entry = AuditEntry::from_input_v1(entry_id, input)?;
        self.next_audit_entry_id = self.next_audit_entry_id.saturating_add(1);
        self.audit_entries.push(entry);
        Ok(entry_id)
    }

    /// Structured failure journal. Every catchable failure affecting
    /// evidence or delivery lands here; there is no other error sink.
    pub fn journal_error(
        &mut self,
        now: MonotonicTimeNs,
        resource_type: AuditResourceType,
        resource_id: u64,
        conversation_id: Option<ConversationId>,
        actor: ActorRef,
        error: ErrorRecord,
    ) -> Result<AuditEntryId, LedgerError> {
        let input = AuditEntryInput::v1(
            now,
            conversation_id,
            actor,
            AuditAction::Error,
            resource_type,
            resource_id,
            None,
            None,
            Some(error),
        )?;
        self.push_audit_entry(input)
    }

    pub fn audit_entries(&self) -> &[AuditEntry] {
        &self.audit_entries
    }

    pub fn attempt_overwrite_audit_entry(
        &mut self,
        _entry_id: AuditEntryId,
    ) -> Result<(), LedgerError> {
        Err(LedgerError::AppendOnlyViolation {
            table: "audit_entries",
        })
    }

    /// Ascending `created_at` (append order); server timestamps give
    /// the trail a total order inside one store instance.
    pub fn audit_entries_by_conversation(
        &self,
        conversation_id: ConversationId,
        offset: usize,
        limit: usize,
    ) -> Vec<&AuditEntry> {
        self.audit_entries
            .iter()
            .filter(|e| e.conversation_id == Some(conversation_id))
            .skip(offset)
            .take(limit)
            .collect()
    }

    // ------------------------
    // Evidence bundles.
    // ------------------------

    /// Bundle rows are written last, after every read in the build has
    /// succeeded; a cancelled or failed build leaves no partial row.
    pub fn append_bundle_row(
        &mut self,
        input: EvidenceBundleRecordInput,
        actor: ActorRef,
    ) -> Result<EvidenceBundleRecord, LedgerError> {
        input.validate()?;
        if !self.conversations.contains_key(&input.conversation_id) {
            return Err(LedgerError::ForeignKeyViolation {
                table: "conversations",
                key: input.conversation_id.0.to_string(),
            });
        }
        let latest = self.latest_bundle(input.conversation_id);
        let expected_version = BundleVersion(
            latest.map(|b| b.version.0).unwrap_or(0).saturating_add(1),
        );
        if input.version != expected_version {
            return Err(LedgerError::ContractViolation(
                ContractViolation::InvalidValue {
                    field: "evidence_bundle_record_input.version",
                    reason: "must extend the conversation's bundle chain by one",
                },
            ));
        }
        let expected_parent = latest.map(|b| b.bundle_id);
        if input.parent_bundle_id != expected_parent {
            return Err(LedgerError::ContractViolation(
                ContractViolation::InvalidValue {
                    field: "evidence_bundle_record_input.parent_bundle_id",
                    reason: "must reference the latest prior bundle version",
                },
            ));
        }

        let bundle_id = EvidenceBundleId(self.next_bundle_id);
        let conversation_id = input.conversation_id;
        let created_at = input.created_at;
        let record = EvidenceBundleRecord::from_input_v1(bundle_id, input)?;
        let audit = AuditEntryInput::v1(
            created_at,
            Some(conversation_id),
            actor,
            AuditAction::BundleBuilt,
            AuditResourceType::EvidenceBundle,
            bundle_id.0,
            None,
            Some(bundle_snapshot(&record)),
            None,
        )?;

        self.next_bundle_id = self.next_bundle_id.saturating_add(1);
        self.bundles.push(record.clone());
        self.push_audit_entry(audit)?;
        Ok(record)
    }

    pub fn bundle(&self, bundle_id: EvidenceBundleId) -> Option<&EvidenceBundleRecord> {
        self.bundles.iter().find(|b| b.bundle_id == bundle_id)
    }

    pub fn latest_bundle(&self, conversation_id: ConversationId) -> Option<&EvidenceBundleRecord> {
        self.bundles
            .iter()
            .filter(|b| b.conversation_id == conversation_id)
            .max_by_key(|b| b.version)
    }

    pub fn bundles_by_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Vec<&EvidenceBundleRecord> {
        self.bundles
            .iter()
            .filter(|b| b.conversation_id == conversation_id)
            .collect()
    }

    pub fn attempt_overwrite_bundle_row(
        &mut self,
        _bundle_id: EvidenceBundleId,
    ) -> Result<(), LedgerError> {
        Err(LedgerError::AppendOnlyViolation {
            table: "evidence_bundles",
        })
    }

    // ------------------------
    // Delivery queue.
    // ------------------------

    /// Deduplicating enqueue. Re-enqueueing an idempotency key whose
    /// task has not terminally failed is a no-op returning the
    /// existing task; callers may re-enqueue freely on their own
    /// retries. Returns `(task, created)`.
    pub fn enqueue_delivery_task(
        &mut self,
        input: DeliveryTaskInput,
        actor: ActorRef,
    ) -> Result<(DeliveryTaskRecord, bool), LedgerError> {
        input.validate()?;
        if let Some(existing_id) = self.delivery_idempotency_index.get(&input.idempotency_key) {
            if let Some(existing) = self.delivery_tasks.get(existing_id) {
                if !matches!(
                    existing.status,
                    DeliveryTaskStatus::Failed | DeliveryTaskStatus::Discarded
                ) {
                    // Deterministic no-op on retry: hand back the
                    // original task.
                    return Ok((existing.clone(), false));
                }
            }
        }

        let task_id = DeliveryTaskId(self.next_delivery_task_id);
        let created_at = input.created_at;
        let record = DeliveryTaskRecord::from_input_v1(task_id, input)?;
        let audit = AuditEntryInput::v1(
            created_at,
            None,
            actor,
            AuditAction::DeliveryEnqueued,
            AuditResourceType::DeliveryTask,
            task_id.0,
            None,
            Some(task_snapshot(&record)),
            None,
        )?;

        self.next_delivery_task_id = self.next_delivery_task_id.saturating_add(1);
        self.delivery_idempotency_index
            .insert(record.idempotency_key.clone(), task_id);
        self.delivery_tasks.insert(task_id, record.clone());
        self.push_audit_entry(audit)?;
        Ok((record, true))
    }

    /// Atomic claim of due work: `status ∈ {pending, retrying}`,
    /// `next_retry_at <= now`, and no live lease. Claimed tasks get a
    /// lease so a crashed worker's work becomes claimable again after
    /// expiry.
    pub fn claim_due_tasks(
        &mut self,
        now: MonotonicTimeNs,
        limit: u16,
        lease_ms: u32,
        worker_id: &str,
    ) -> Vec<DeliveryTaskRecord> {
        let mut claimed = Vec::new();
        for task in self.delivery_tasks.values_mut() {
            if claimed.len() >= limit as usize {
                break;
            }
            let due = matches!(
                task.status,
                DeliveryTaskStatus::Pending | DeliveryTaskStatus::Retrying
            ) && task.next_retry_at <= now;
            if !due {
                continue;
            }
            let lease_live = matches!(task.lease_expires_at, Some(expiry) if expiry > now);
            if lease_live {
                continue;
            }
            task.lease_owner = Some(worker_id.to_string());
            task.lease_expires_at = Some(now.saturating_add_ms(lease_ms as u64));
            claimed.push(task.clone());
        }
        claimed
    }

    pub fn due_task_count(&self, now: MonotonicTimeNs) -> usize {
        self.delivery_tasks
            .values()
            .filter(|t| {
                matches!(
                    t.status,
                    DeliveryTaskStatus::Pending | DeliveryTaskStatus::Retrying
                ) && t.next_retry_at <= now
                    && !matches!(t.lease_expires_at, Some(expiry) if expiry > now)
            })
            .count()
    }

    fn claimed_task_mut(
        &mut self,
        task_id: DeliveryTaskId,
        worker_id: &str,
    ) -> Result<&mut DeliveryTaskRecord, LedgerError> {
        let task =
            self.delivery_tasks
                .get_mut(&task_id)
                .ok_or_else(|| LedgerError::ForeignKeyViolation {
                    table: "delivery_tasks",
                    key: task_id.0.to_string(),
                })?;
        if task.lease_owner.as_deref() != Some(worker_id) {
            return Err(LedgerError::LeaseViolation {
                key: format!("task {} is not leased to {worker_id}", task_id.0),
            });
        }
        Ok(task)
    }

    /// Attempt outcome: delivered. Exactly one audit entry per
    /// attempt.
    pub fn record_attempt_success(
        &mut self,
        now: MonotonicTimeNs,
        task_id: DeliveryTaskId,
        worker_id: &str,
    ) -> Result<DeliveryTaskRecord, LedgerError> {
        let task = self.claimed_task_mut(task_id, worker_id)?;
        if !is_allowed_task_transition(task.status, DeliveryTaskStatus::Succeeded) {
            return Err(LedgerError::TransitionViolation {
                table: "delivery_tasks",
                from: task.status.as_str(),
                to: DeliveryTaskStatus::Succeeded.as_str(),
            });
        }
        task.status = DeliveryTaskStatus::Succeeded;
        task.attempt_count = task.attempt_count.saturating_add(1);
        task.last_error = None;
        task.lease_owner = None;
        task.lease_expires_at = None;
        let updated = task.clone();
        let audit = AuditEntryInput::v1(
            now,
            None,
            ActorRef::Automation {
                job_name: worker_id.to_string(),
            },
            AuditAction::DeliverySucceeded,
            AuditResourceType::DeliveryTask,
            task_id.0,
            None,
            Some(task_snapshot(&updated)),
            None,
        )?;
        self.push_audit_entry(audit)?;
        Ok(updated)
    }

    /// Attempt outcome: transient failure. Reschedules at the supplied
    /// `next_retry_at` unless the retry budget is exhausted, in which
    /// case the task lands in `failed` for operator triage.
    pub fn record_attempt_transient_failure(
        &mut self,
        now: MonotonicTimeNs,
        task_id: DeliveryTaskId,
        worker_id: &str,
        message: String,
        next_retry_at: MonotonicTimeNs,
    ) -> Result<DeliveryTaskRecord, LedgerError> {
        let task = self.claimed_task_mut(task_id, worker_id)?;
        let attempts = task.attempt_count.saturating_add(1);
        let exhausted = attempts >= task.max_attempts;
        let to = if exhausted {
            DeliveryTaskStatus::Failed
        } else {
            DeliveryTaskStatus::Retrying
        };
        if !is_allowed_task_transition(task.status, to) {
            return Err(LedgerError::TransitionViolation {
                table: "delivery_tasks",
                from: task.status.as_str(),
                to: to.as_str(),
            });
        }
        task.attempt_count = attempts;
        task.status = to;
        task.last_error = Some(bounded_error_message(&message));
        task.lease_owner = None;
        task.lease_expires_at = None;
        if !exhausted {
            task.next_retry_at = next_retry_at;
        }
        let updated = task.clone();
        let (code, severity, retriable) = if exhausted {
            ("DELIVERY_RETRIES_EXHAUSTED", ErrorSeverity::High, false)
        } else {
            ("DELIVERY_ATTEMPT_TRANSIENT", ErrorSeverity::Medium, true)
        };
        self.journal_error(
            now,
            AuditResourceType::DeliveryTask,
            task_id.0,
            None,
            ActorRef::Automation {
                job_name: worker_id.to_string(),
            },
            ErrorRecord::v1(
                code,
                severity,
                retriable,
                format!(
                    "attempt {}/{}: {}",
                    updated.attempt_count,
                    updated.max_attempts,
                    bounded_error_message(&message)
                ),
            )?,
        )?;
        Ok(updated)
    }

    /// Attempt outcome: permanent failure. Skips the retry path and
    /// goes straight to `failed`.
    pub fn record_attempt_permanent_failure(
        &mut self,
        now: MonotonicTimeNs,
        task_id: DeliveryTaskId,
        worker_id: &str,
        message: String,
    ) -> Result<DeliveryTaskRecord, LedgerError> {
        let task = self.claimed_task_mut(task_id, worker_id)?;
        if !is_allowed_task_transition(task.status, DeliveryTaskStatus::Failed) {
            return Err(LedgerError::TransitionViolation {
                table: "delivery_tasks",
                from: task.status.as_str(),
                to: DeliveryTaskStatus::Failed.as_str(),
            });
        }
        task.attempt_count = task.attempt_count.saturating_add(1);
        task.status = DeliveryTaskStatus::Failed;
        task.last_error = Some(bounded_error_message(&message));
        task.lease_owner = None;
        task.lease_expires_at = None;
        let updated = task.clone();
        self.journal_error(
            now,
            AuditResourceType::DeliveryTask,
            task_id.0,
            None,
            ActorRef::Automation {
                job_name: worker_id.to_string(),
            },
            ErrorRecord::v1(
                "DELIVERY_ATTEMPT_PERMANENT",
                ErrorSeverity::High,
                false,
                format!(
                    "attempt {}/{}: {}",
                    updated.attempt_count,
                    updated.max_attempts,
                    bounded_error_message(&message)
                ),
            )?,
        )?;
        Ok(updated)
    }

    // ------------------------
    // Delivery queue: operator actions.
    // ------------------------

    pub fn promote_manual_review(
        &mut self,
        now: MonotonicTimeNs,
        task_id: DeliveryTaskId,
        actor: ActorRef,
    ) -> Result<DeliveryTaskRecord, LedgerError> {
        self.operator_transition(
            now,
            task_id,
            DeliveryTaskStatus::ManualReview,
            AuditAction::DeliveryManualReview,
            actor,
            None,
        )
    }

    pub fn discard_task(
        &mut self,
        now: MonotonicTimeNs,
        task_id: DeliveryTaskId,
        reason: String,
        actor: ActorRef,
    ) -> Result<DeliveryTaskRecord, LedgerError> {
        self.operator_transition(
            now,
            task_id,
            DeliveryTaskStatus::Discarded,
            AuditAction::DeliveryDiscarded,
            actor,
            Some(reason),
        )
    }

    /// Re-delivery after manual intervention: zeroes the attempt
    /// budget and re-enters the normal attempt path immediately.
    pub fn force_retry(
        &mut self,
        now: MonotonicTimeNs,
        task_id: DeliveryTaskId,
        actor: ActorRef,
    ) -> Result<DeliveryTaskRecord, LedgerError> {
        let task =
            self.delivery_tasks
                .get_mut(&task_id)
                .ok_or_else(|| LedgerError::ForeignKeyViolation {
                    table: "delivery_tasks",
                    key: task_id.0.to_string(),
                })?;
        if !is_allowed_task_transition(task.status, DeliveryTaskStatus::Retrying) {
            return Err(LedgerError::TransitionViolation {
                table: "delivery_tasks",
                from: task.status.as_str(),
                to: DeliveryTaskStatus::Retrying.as_str(),
            });
        }
        let before = task_snapshot(task);
        task.status = DeliveryTaskStatus::Retrying;
        task.attempt_count = 0;
        task.next_retry_at = now;
        task.last_error = None;
        task.lease_owner = None;
        task.lease_expires_at = None;
        let updated = task.clone();
        let audit = AuditEntryInput::v1(
            now,
            None,
            actor,
            AuditAction::DeliveryForcedRetry,
            AuditResourceType::DeliveryTask,
            task_id.0,
            Some(before),
            Some(task_snapshot(&updated)),
            None,
        )?;
        self.push_audit_entry(audit)?;
        Ok(updated)
    }

    fn operator_transition(
        &mut self,
        now: MonotonicTimeNs,
        task_id: DeliveryTaskId,
        to: DeliveryTaskStatus,
        action: AuditAction,
        actor: ActorRef,
        reason: Option<String>,
    ) -> Result<DeliveryTaskRecord, LedgerError> {
        let task =
            self.delivery_tasks
                .get_mut(&task_id)
                .ok_or_else(|| LedgerError::ForeignKeyViolation {
                    table: "delivery_tasks",
                    key: task_id.0.to_string(),
                })?;
        if !is_allowed_task_transition(task.status, to) {
            return Err(LedgerError::TransitionViolation {
                table: "delivery_tasks",
                from: task.status.as_str(),
                to: to.as_str(),
            });
        }
        let before = task_snapshot(task);
        task.status = to;
        task.lease_owner = None;
        task.lease_expires_at = None;
        let updated = task.clone();
        let after = match &reason {
            Some(r) => task_snapshot_with_reason(&updated, r),
            None => task_snapshot(&updated),
        };
        let audit = AuditEntryInput::v1(
            now,
            None,
            actor,
            action,
            AuditResourceType::DeliveryTask,
            task_id.0,
            Some(before),
            Some(after),
            None,
        )?;
        self.push_audit_entry(audit)?;
        Ok(updated)
    }

    pub fn delivery_task(&self, task_id: DeliveryTaskId) -> Option<&DeliveryTaskRecord> {
        self.delivery_tasks.get(&task_id)
    }

    pub fn delivery_tasks(&self) -> impl Iterator<Item = &DeliveryTaskRecord> {
        self.delivery_tasks.values()
    }

    /// Operations-dashboard listing.
    pub fn tasks_by_status(&self, status: DeliveryTaskStatus) -> Vec<&DeliveryTaskRecord> {
        self.delivery_tasks
            .values()
            .filter(|t| t.status == status)
            .collect()
    }
}

fn bounded_error_message(message: &str) -> String {
    if message.len() > 256 {
        message.chars().take(256).collect()
    } else {
        message.to_string()
    }
}

fn conversation_snapshot(record: &ConversationRecord) -> String {
    serde_json::json!({
        "conversation_id": record.conversation_id.0,
        "status": record.status.as_str(),
        "started_at_ns": record.started_at.map(|t| t.0),
        "ended_at_ns": record.ended_at.map(|t| t.0),
    })
    .to_string()
}

fn artifact_snapshot(record: &ArtifactRecord) -> String {
    serde_json::json!({
        "artifact_id": record.artifact_id.0,
        "conversation_id": record.conversation_id.0,
        "artifact_type": record.artifact_type.as_str(),
        "content_hash": record.content_hash,
        "produced_by": record.produced_by.label(),
        "version": record.version.0,
        "lifecycle": match record.lifecycle {
            LifecycleState::Active => "active",
            LifecycleState::SoftDeleted => "soft_deleted",
        },
    })
    .to_string()
}

fn bundle_snapshot(record: &EvidenceBundleRecord) -> String {
    serde_json::json!({
        "bundle_id": record.bundle_id.0,
        "conversation_id": record.conversation_id.0,
        "bundle_hash": record.bundle_hash,
        "version": record.version.0,
        "parent_bundle_id": record.parent_bundle_id.map(|b| b.0),
        "artifact_count": record.artifact_refs.len(),
    })
    .to_string()
}

fn task_snapshot(record: &DeliveryTaskRecord) -> String {
    serde_json::json!({
        "task_id": record.task_id.0,
        "event_type": record.event_type.as_str(),
        "target": record.target.label(),
        "status": record.status.as_str(),
        "attempt_count": record.attempt_count,
        "max_attempts": record.max_attempts,
        "idempotency_key": record.idempotency_key,
    })
    .to_string()
}

fn task_snapshot_with_reason(record: &DeliveryTaskRecord, reason: &str) -> String {
    serde_json::json!({
        "task_id": record.task_id.0,
        "status": record.status.as_str(),
        "attempt_count": record.attempt_count,
        "reason": reason,
    })
    .to_string()
}
