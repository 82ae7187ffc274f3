#![forbid(unsafe_code)]

use custody_contracts::bundle::{
    BundleArtifactRef, BundleVersion, EvidenceBundleId, EvidenceBundleRecordInput,
};
use custody_contracts::conversation::{ConversationId, ConversationRecordInput};
use custody_contracts::{ActorRef, ContractViolation, MonotonicTimeNs};
use custody_storage::{LedgerError, LedgerStore};

fn seeded_conversation(store: &mut LedgerStore) -> ConversationId {
    store
        .insert_conversation(
            ConversationRecordInput::v1(MonotonicTimeNs(1), ActorRef::System, None).unwrap(),
            ActorRef::System,
        )
        .unwrap()
        .conversation_id
}

fn bundle_input(
    conversation_id: ConversationId,
    parent: Option<EvidenceBundleId>,
    version: u32,
    at: u64,
) -> EvidenceBundleRecordInput {
    EvidenceBundleRecordInput::v1(
        conversation_id,
        vec![BundleArtifactRef {
            artifact_id: 1,
            content_hash: format!("sha256:{}", "a".repeat(64)),
            produced_by: "system".to_string(),
            produced_at_ns: 5,
        }],
        "{\"artifacts\":[]}".to_string(),
        format!("sha256:{}", "b".repeat(64)),
        parent,
        BundleVersion(version),
        MonotonicTimeNs(at),
    )
    .unwrap()
}

#[test]
fn at_bundles_db_01_version_chain_with_parent_links() {
    let mut s = LedgerStore::new_in_memory();
    let conversation_id = seeded_conversation(&mut s);

    let v1 = s
        .append_bundle_row(bundle_input(conversation_id, None, 1, 10), ActorRef::System)
        .unwrap();
    let v2 = s
        .append_bundle_row(
            bundle_input(conversation_id, Some(v1.bundle_id), 2, 20),
            ActorRef::System,
        )
        .unwrap();

    assert_eq!(v1.version, BundleVersion(1));
    assert_eq!(v2.parent_bundle_id, Some(v1.bundle_id));
    assert_eq!(s.latest_bundle(conversation_id).unwrap().bundle_id, v2.bundle_id);
    assert_eq!(s.bundles_by_conversation(conversation_id).len(), 2);
}

#[test]
fn at_bundles_db_02_chain_must_extend_by_exactly_one() {
    let mut s = LedgerStore::new_in_memory();
    let conversation_id = seeded_conversation(&mut s);
    let v1 = s
        .append_bundle_row(bundle_input(conversation_id, None, 1, 10), ActorRef::System)
        .unwrap();

    // Skipping a version is refused.
    let err = s
        .append_bundle_row(
            bundle_input(conversation_id, Some(v1.bundle_id), 3, 20),
            ActorRef::System,
        )
        .unwrap_err();
    assert!(matches!(
        err,
        LedgerError::ContractViolation(ContractViolation::InvalidValue {
            field: "evidence_bundle_record_input.version",
            ..
        })
    ));

    // A second v1 with no parent is refused once a chain exists.
    let err = s
        .append_bundle_row(bundle_input(conversation_id, None, 1, 20), ActorRef::System)
        .unwrap_err();
    assert!(matches!(err, LedgerError::ContractViolation(_)));
}

#[test]
fn at_bundles_db_03_parent_must_be_latest_version() {
    let mut s = LedgerStore::new_in_memory();
    let conversation_id = seeded_conversation(&mut s);
    let v1 = s
        .append_bundle_row(bundle_input(conversation_id, None, 1, 10), ActorRef::System)
        .unwrap();
    let _v2 = s
        .append_bundle_row(
            bundle_input(conversation_id, Some(v1.bundle_id), 2, 20),
            ActorRef::System,
        )
        .unwrap();

    // v3 must point at v2, not back at v1.
    let err = s
        .append_bundle_row(
            bundle_input(conversation_id, Some(v1.bundle_id), 3, 30),
            ActorRef::System,
        )
        .unwrap_err();
    assert!(matches!(
        err,
        LedgerError::ContractViolation(ContractViolation::InvalidValue {
            field: "evidence_bundle_record_input.parent_bundle_id",
            ..
        })
    ));
}

#[test]
fn at_bundles_db_04_bundle_rows_are_append_only_and_audited() {
    let mut s = LedgerStore::new_in_memory();
    let conversation_id = seeded_conversation(&mut s);
    let v1 = s
        .append_bundle_row(bundle_input(conversation_id, None, 1, 10), ActorRef::System)
        .unwrap();
    assert!(matches!(
        s.attempt_overwrite_bundle_row(v1.bundle_id),
        Err(LedgerError::AppendOnlyViolation {
            table: "evidence_bundles",
        })
    ));
    let built_entries = s
        .audit_entries()
        .iter()
        .filter(|e| e.action == custody_contracts::audit::AuditAction::BundleBuilt)
        .count();
    assert_eq!(built_entries, 1);
}

#[test]
fn at_bundles_db_05_unknown_conversation_is_refused() {
    let mut s = LedgerStore::new_in_memory();
    let err = s
        .append_bundle_row(bundle_input(ConversationId(404), None, 1, 10), ActorRef::System)
        .unwrap_err();
    assert!(matches!(
        err,
        LedgerError::ForeignKeyViolation {
            table: "conversations",
            ..
        }
    ));
}
