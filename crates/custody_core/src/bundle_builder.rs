#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use custody_contracts::artifact::{ArtifactId, ArtifactRecord};
use custody_contracts::bundle::{
    BundleArtifactRef, BundleMetadata, BundleVersion, EvidenceBundleRecord,
    EvidenceBundleRecordInput,
};
use custody_contracts::conversation::ConversationId;
use custody_contracts::{ActorRef, LifecycleState, MonotonicTimeNs};
use custody_storage::canon;
use custody_storage::{LedgerError, LedgerStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BundleBuilderConfig {
    pub max_artifacts: usize,
}

impl BundleBuilderConfig {
    pub fn mvp_v1() -> Self {
        Self { max_artifacts: 512 }
    }
}

/// Builds the next evidence bundle version for a conversation:
/// active artifacts, their full provenance closure, one canonical
/// tuple per artifact, and a single verifiable fingerprint over
/// tuples + metadata. All reads complete before the bundle row is
/// written, so a failed or cancelled build leaves no partial row.
///
/// Rebuilding an unchanged conversation reproduces `bundle_hash`
/// byte-for-byte while still appending a new version row; versions
/// are a historical ledger, not a cache.
pub fn build_bundle(
    store: &mut LedgerStore,
    now: MonotonicTimeNs,
    conversation_id: ConversationId,
    actor: ActorRef,
    config: &BundleBuilderConfig,
) -> Result<EvidenceBundleRecord, LedgerError> {
    if store.conversation(conversation_id).is_none() {
        return Err(LedgerError::ForeignKeyViolation {
            table: "conversations",
            key: conversation_id.0.to_string(),
        });
    }

    let active = store.artifacts_by_conversation(conversation_id, false);
    if active.is_empty() {
        return Err(LedgerError::IncompleteEvidence {
            conversation_id,
            detail: "conversation has no active artifacts".to_string(),
        });
    }

    // Highest lineage version per artifact type, soft-deleted rows
    // included: a soft-deleted ancestor is admissible evidence only
    // when a newer version of that lineage superseded it.
    let mut latest_lineage_versions: BTreeMap<&'static str, u32> = BTreeMap::new();
    for artifact in store.artifacts_by_conversation(conversation_id, true) {
        let slot = latest_lineage_versions
            .entry(artifact.artifact_type.as_str())
            .or_insert(0);
        *slot = (*slot).max(artifact.version.0);
    }

    let mut closure: BTreeMap<ArtifactId, &ArtifactRecord> = BTreeMap::new();
    for &artifact in &active {
        closure.insert(artifact.artifact_id, artifact);
        for ancestor in store.ancestors(artifact.artifact_id)? {
            if ancestor.lifecycle == LifecycleState::SoftDeleted {
                let superseded = latest_lineage_versions
                    .get(ancestor.artifact_type.as_str())
                    .is_some_and(|latest| *latest > ancestor.version.0);
                if !superseded {
                    return Err(LedgerError::IncompleteEvidence {
                        conversation_id,
                        detail: format!(
                            "artifact {} is soft-deleted and not superseded",
                            ancestor.artifact_id.0
                        ),
                    });
                }
            }
            closure.insert(ancestor.artifact_id, ancestor);
        }
    }

    if closure.len() > config.max_artifacts {
        return Err(LedgerError::IncompleteEvidence {
            conversation_id,
            detail: format!(
                "bundle closure of {} artifacts exceeds the {} artifact bound",
                closure.len(),
                config.max_artifacts
            ),
        });
    }

    // BTreeMap iteration gives ascending artifact id order, which is
    // the canonical tuple order.
    let artifact_refs: Vec<BundleArtifactRef> = closure
        .values()
        .map(|artifact| BundleArtifactRef {
            artifact_id: artifact.artifact_id.0,
            content_hash: artifact.content_hash.clone(),
            produced_by: artifact.produced_by.label(),
            produced_at_ns: artifact.created_at.0,
        })
        .collect();
    let metadata = BundleMetadata {
        conversation_id: conversation_id.0,
        canon_rules_version: canon::CANON_RULES_VERSION.0,
        artifact_count: artifact_refs.len() as u32,
    };
    let bundle_hash = compute_bundle_hash(&artifact_refs, &metadata)?;
    let payload_bytes = canon::canonicalize_value(&serde_json::json!({
        "artifacts": artifact_refs,
        "metadata": metadata,
    }))?;
    let bundle_payload = String::from_utf8(payload_bytes).map_err(|_| {
        LedgerError::IncompleteEvidence {
            conversation_id,
            detail: "bundle payload is not valid UTF-8".to_string(),
        }
    })?;

    let latest = store.latest_bundle(conversation_id);
    let version = BundleVersion(latest.map(|b| b.version.0).unwrap_or(0).saturating_add(1));
    let parent_bundle_id = latest.map(|b| b.bundle_id);
    let input = EvidenceBundleRecordInput::v1(
        conversation_id,
        artifact_refs,
        bundle_payload,
        bundle_hash,
        parent_bundle_id,
        version,
        now,
    )?;
    store.append_bundle_row(input, actor)
}

/// `bundle_hash = sha256(canon(tuples) ++ canon(metadata))`.
pub fn compute_bundle_hash(
    artifact_refs: &[BundleArtifactRef],
    metadata: &BundleMetadata,
) -> Result<String, LedgerError> {
    let mut bytes = canon::canonicalize_value(&artifact_refs)?;
    bytes.extend_from_slice(&canon::canonicalize_value(metadata)?);
    Ok(canon::content_hash_hex(&bytes))
}

/// Recomputes the fingerprint from the stored rows. True iff the
/// bundle still verifies, including after a reload from storage.
pub fn verify_bundle(bundle: &EvidenceBundleRecord) -> bool {
    let metadata = BundleMetadata {
        conversation_id: bundle.conversation_id.0,
        canon_rules_version: canon::CANON_RULES_VERSION.0,
        artifact_count: bundle.artifact_refs.len() as u32,
    };
    match compute_bundle_hash(&bundle.artifact_refs, &metadata) {
        Ok(hash) => hash == bundle.bundle_hash,
        Err(_) => false,
    }
}
