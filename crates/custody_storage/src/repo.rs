#![forbid(unsafe_code)]

use custody_contracts::artifact::{ArtifactId, ArtifactRecord, ArtifactRecordInput};
use custody_contracts::audit::{AuditEntry, AuditEntryId, AuditEntryInput, AuditResourceType, ErrorRecord};
use custody_contracts::bundle::{EvidenceBundleId, EvidenceBundleRecord, EvidenceBundleRecordInput};
use custody_contracts::conversation::ConversationId;
use custody_contracts::delivery::{
    DeliveryTaskId, DeliveryTaskInput, DeliveryTaskRecord, DeliveryTaskStatus,
};
use custody_contracts::provenance::{InputRef, ProvenanceEdge};
use custody_contracts::{ActorRef, MonotonicTimeNs};

use crate::store::{LedgerError, LedgerStore};

/// Typed repository interface for the artifacts ledger. The store
/// owns artifact rows exclusively; provenance and audit are written in
/// the same mutation that creates the artifact.
pub trait ArtifactLedgerRepo {
    fn create_artifact_row(
        &mut self,
        now: MonotonicTimeNs,
        input: ArtifactRecordInput,
        parent_artifact_id: Option<ArtifactId>,
        input_refs: Vec<InputRef>,
        actor: ActorRef,
    ) -> Result<ArtifactRecord, LedgerError>;
    fn artifact_row(&self, artifact_id: ArtifactId) -> Option<&ArtifactRecord>;
    fn artifact_row_including_deleted(&self, artifact_id: ArtifactId) -> Option<&ArtifactRecord>;
    fn soft_delete_artifact_row(
        &mut self,
        now: MonotonicTimeNs,
        artifact_id: ArtifactId,
        actor: ActorRef,
    ) -> Result<ArtifactRecord, LedgerError>;
}

/// Typed repository interface for provenance reads. Edges are written
/// only through artifact creation.
pub trait ProvenanceGraphRepo {
    fn provenance_edge_row(&self, artifact_id: ArtifactId) -> Option<&ProvenanceEdge>;
    fn ancestor_rows(&self, artifact_id: ArtifactId) -> Result<Vec<&ArtifactRecord>, LedgerError>;
}

/// Typed repository interface for the append-only audit trail.
pub trait AuditTrailRepo {
    fn append_audit_row(&mut self, input: AuditEntryInput) -> Result<AuditEntryId, LedgerError>;
    fn append_error_row(
        &mut self,
        now: MonotonicTimeNs,
        resource_type: AuditResourceType,
        resource_id: u64,
        conversation_id: Option<ConversationId>,
        actor: ActorRef,
        error: ErrorRecord,
    ) -> Result<AuditEntryId, LedgerError>;
    fn audit_rows(&self) -> &[AuditEntry];
    fn audit_rows_by_conversation(
        &self,
        conversation_id: ConversationId,
        offset: usize,
        limit: usize,
    ) -> Vec<&AuditEntry>;
}

/// Typed repository interface for evidence bundle persistence.
pub trait EvidenceBundleRepo {
    fn append_bundle_row(
        &mut self,
        input: EvidenceBundleRecordInput,
        actor: ActorRef,
    ) -> Result<EvidenceBundleRecord, LedgerError>;
    fn bundle_row(&self, bundle_id: EvidenceBundleId) -> Option<&EvidenceBundleRecord>;
    fn latest_bundle_row(&self, conversation_id: ConversationId)
        -> Option<&EvidenceBundleRecord>;
}

/// Generic "due work" interface for the delivery worker. Keeping the
/// claim behind a trait lets the implementation swap between simple
/// polling and a push-based durable queue without touching worker
/// logic.
pub trait DeliveryQueueRepo {
    fn enqueue_task(
        &mut self,
        input: DeliveryTaskInput,
        actor: ActorRef,
    ) -> Result<(DeliveryTaskRecord, bool), LedgerError>;
    fn claim_due(
        &mut self,
        now: MonotonicTimeNs,
        limit: u16,
        lease_ms: u32,
        worker_id: &str,
    ) -> Vec<DeliveryTaskRecord>;
    fn task_row(&self, task_id: DeliveryTaskId) -> Option<&DeliveryTaskRecord>;
    fn task_rows_by_status(&self, status: DeliveryTaskStatus) -> Vec<&DeliveryTaskRecord>;
}

impl ArtifactLedgerRepo for LedgerStore {
    fn create_artifact_row(
        &mut self,
        now: MonotonicTimeNs,
        input: ArtifactRecordInput,
        parent_artifact_id: Option<ArtifactId>,
        input_refs: Vec<InputRef>,
        actor: ActorRef,
    ) -> Result<ArtifactRecord, LedgerError> {
        self.create_artifact(now, input, parent_artifact_id, input_refs, actor)
    }

    fn artifact_row(&self, artifact_id: ArtifactId) -> Option<&ArtifactRecord> {
        self.artifact(artifact_id)
    }

    fn artifact_row_including_deleted(&self, artifact_id: ArtifactId) -> Option<&ArtifactRecord> {
        self.artifact_including_deleted(artifact_id)
    }

    fn soft_delete_artifact_row(
        &mut self,
        now: MonotonicTimeNs,
        artifact_id: ArtifactId,
        actor: ActorRef,
    ) -> Result<ArtifactRecord, LedgerError> {
        self.soft_delete_artifact(now, artifact_id, actor)
    }
}

impl ProvenanceGraphRepo for LedgerStore {
    fn provenance_edge_row(&self, artifact_id: ArtifactId) -> Option<&ProvenanceEdge> {
        self.provenance_edge(artifact_id)
    }

    fn ancestor_rows(&self, artifact_id: ArtifactId) -> Result<Vec<&ArtifactRecord>, LedgerError> {
        self.ancestors(artifact_id)
    }
}

impl AuditTrailRepo for LedgerStore {
    fn append_audit_row(&mut self, input: AuditEntryInput) -> Result<AuditEntryId, LedgerError> {
        self.append_audit_entry(input)
    }

    fn append_error_row(
        &mut self,
        now: MonotonicTimeNs,
        resource_type: AuditResourceType,
        resource_id: u64,
        conversation_id: Option<ConversationId>,
        actor: ActorRef,
        error: ErrorRecord,
    ) -> Result<AuditEntryId, LedgerError> {
        self.journal_error(now, resource_type, resource_id, conversation_id, actor, error)
    }

    fn audit_rows(&self) -> &[AuditEntry] {
        self.audit_entries()
    }

    fn audit_rows_by_conversation(
        &self,
        conversation_id: ConversationId,
        offset: usize,
        limit: usize,
    ) -> Vec<&AuditEntry> {
        self.audit_entries_by_conversation(conversation_id, offset, limit)
    }
}

impl EvidenceBundleRepo for LedgerStore {
    fn append_bundle_row(
        &mut self,
        input: EvidenceBundleRecordInput,
        actor: ActorRef,
    ) -> Result<EvidenceBundleRecord, LedgerError> {
        LedgerStore::append_bundle_row(self, input, actor)
    }

    fn bundle_row(&self, bundle_id: EvidenceBundleId) -> Option<&EvidenceBundleRecord> {
        self.bundle(bundle_id)
    }

    fn latest_bundle_row(
        &self,
        conversation_id: ConversationId,
    ) -> Option<&EvidenceBundleRecord> {
        self.latest_bundle(conversation_id)
    }
}

impl DeliveryQueueRepo for LedgerStore {
    fn enqueue_task(
        &mut self,
        input: DeliveryTaskInput,
        actor: ActorRef,
    ) -> Result<(DeliveryTaskRecord, bool), LedgerError> {
        self.enqueue_delivery_task(input, actor)
    }

    fn claim_due(
        &mut self,
        now: MonotonicTimeNs,
        limit: u16,
        lease_ms: u32,
        worker_id: &str,
    ) -> Vec<DeliveryTaskRecord> {
        self.claim_due_tasks(now, limit, lease_ms, worker_id)
    }

    fn task_row(&self, task_id: DeliveryTaskId) -> Option<&DeliveryTaskRecord> {
        self.delivery_task(task_id)
    }

    fn task_rows_by_status(&self, status: DeliveryTaskStatus) -> Vec<&DeliveryTaskRecord> {
        self.tasks_by_status(status)
    }
}
