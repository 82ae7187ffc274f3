#![forbid(unsafe_code)]

use custody_contracts::artifact::ArtifactRecord;
use custody_contracts::audit::AuditEntry;
use custody_contracts::bundle::EvidenceBundleRecord;
use custody_contracts::conversation::{ConversationId, ConversationRecord};
use custody_storage::{LedgerError, LedgerStore};

use crate::bundle_builder;

/// The compliance/export read: latest bundle plus a freshly recomputed
/// verification verdict, so clients can check the fingerprint without
/// trusting the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct BundleView {
    pub bundle: EvidenceBundleRecord,
    pub verified: bool,
}

pub fn latest_bundle_view(
    store: &LedgerStore,
    conversation_id: ConversationId,
) -> Result<Option<BundleView>, LedgerError> {
    if store.conversation(conversation_id).is_none() {
        return Err(LedgerError::ForeignKeyViolation {
            table: "conversations",
            key: conversation_id.0.to_string(),
        });
    }
    Ok(store.latest_bundle(conversation_id).map(|bundle| BundleView {
        bundle: bundle.clone(),
        verified: bundle_builder::verify_bundle(bundle),
    }))
}

/// Operational triage view: the conversation row, its artifact list,
/// and the full audit excerpt in trail order.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationDebugView {
    pub conversation: ConversationRecord,
    pub artifacts: Vec<ArtifactRecord>,
    pub audit_entries: Vec<AuditEntry>,
}

pub fn conversation_debug_view(
    store: &LedgerStore,
    conversation_id: ConversationId,
    include_deleted: bool,
) -> Result<ConversationDebugView, LedgerError> {
    let conversation = store.conversation(conversation_id).cloned().ok_or_else(|| {
        LedgerError::ForeignKeyViolation {
            table: "conversations",
            key: conversation_id.0.to_string(),
        }
    })?;
    let artifacts = store
        .artifacts_by_conversation(conversation_id, include_deleted)
        .into_iter()
        .cloned()
        .collect();
    let audit_entries = store
        .audit_entries_by_conversation(conversation_id, 0, usize::MAX)
        .into_iter()
        .cloned()
        .collect();
    Ok(ConversationDebugView {
        conversation,
        artifacts,
        audit_entries,
    })
}
