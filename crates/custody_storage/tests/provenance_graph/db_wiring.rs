#![forbid(unsafe_code)]

use custody_contracts::artifact::{
    ArtifactId, ArtifactPayload, ArtifactRecordInput, ArtifactSource, ArtifactType,
};
use custody_contracts::conversation::{ConversationId, ConversationRecordInput};
use custody_contracts::provenance::{InputRef, InputRefKind, ProvenanceEdge};
use custody_contracts::{ActorRef, ContractViolation, MonotonicTimeNs, ProducedBy, Validate};
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

fn add_recording(store: &mut LedgerStore, conversation_id: ConversationId, at: u64) -> ArtifactId {
    store
        .create_artifact(
            MonotonicTimeNs(at),
            ArtifactRecordInput::v1(
                conversation_id,
                ArtifactType::Recording,
                ArtifactPayload::ContentRef(format!("blob://recordings/{at}")),
                ProducedBy::System,
                Some(ArtifactSource::VendorTelephony),
            )
            .unwrap(),
            None,
            vec![],
            ActorRef::System,
        )
        .unwrap()
        .artifact_id
}

fn add_derived(
    store: &mut LedgerStore,
    conversation_id: ConversationId,
    artifact_type: ArtifactType,
    parent: Option<ArtifactId>,
    input_refs: Vec<InputRef>,
    at: u64,
) -> Result<ArtifactId, LedgerError> {
    store
        .create_artifact(
            MonotonicTimeNs(at),
            ArtifactRecordInput::v1(
                conversation_id,
                artifact_type,
                ArtifactPayload::InlineJson(format!("{{\"at\":{at}}}")),
                ProducedBy::Model {
                    model_name: "stt_v3".to_string(),
                },
                None,
            )
            .unwrap(),
            parent,
            input_refs,
            ActorRef::System,
        )
        .map(|r| r.artifact_id)
}

#[test]
fn at_provenance_db_01_edge_written_with_artifact_creation() {
    let mut s = LedgerStore::new_in_memory();
    let conversation_id = seeded_conversation(&mut s);
    let recording = add_recording(&mut s, conversation_id, 10);
    let transcript = add_derived(
        &mut s,
        conversation_id,
        ArtifactType::TranscriptVersion,
        Some(recording),
        vec![],
        11,
    )
    .unwrap();

    let edge = s.provenance_edge(transcript).unwrap();
    assert_eq!(edge.parent_artifact_id, Some(recording));
    assert_eq!(edge.version.0, 1);
    // Root artifacts carry an edge with no parent.
    assert_eq!(s.provenance_edge(recording).unwrap().parent_artifact_id, None);
}

#[test]
fn at_provenance_db_02_ancestors_walk_to_root() {
    let mut s = LedgerStore::new_in_memory();
    let conversation_id = seeded_conversation(&mut s);
    let recording = add_recording(&mut s, conversation_id, 10);
    let transcript = add_derived(
        &mut s,
        conversation_id,
        ArtifactType::TranscriptVersion,
        Some(recording),
        vec![],
        11,
    )
    .unwrap();
    let translation = add_derived(
        &mut s,
        conversation_id,
        ArtifactType::Translation,
        Some(transcript),
        vec![],
        12,
    )
    .unwrap();

    let chain = s.ancestors(translation).unwrap();
    let ids: Vec<ArtifactId> = chain.iter().map(|a| a.artifact_id).collect();
    assert_eq!(ids, vec![transcript, recording]);
    assert!(s.ancestors(recording).unwrap().is_empty());
}

#[test]
fn at_provenance_db_03_parent_must_share_conversation() {
    let mut s = LedgerStore::new_in_memory();
    let conversation_a = seeded_conversation(&mut s);
    let conversation_b = seeded_conversation(&mut s);
    let recording_a = add_recording(&mut s, conversation_a, 10);

    let err = add_derived(
        &mut s,
        conversation_b,
        ArtifactType::TranscriptVersion,
        Some(recording_a),
        vec![],
        11,
    )
    .unwrap_err();
    assert!(matches!(
        err,
        LedgerError::ContractViolation(ContractViolation::InvalidValue {
            field: "provenance_edge.parent_artifact_id",
            ..
        })
    ));
}

#[test]
fn at_provenance_db_04_parent_must_already_exist() {
    let mut s = LedgerStore::new_in_memory();
    let conversation_id = seeded_conversation(&mut s);
    let err = add_derived(
        &mut s,
        conversation_id,
        ArtifactType::TranscriptVersion,
        Some(ArtifactId(404)),
        vec![],
        11,
    )
    .unwrap_err();
    assert!(matches!(
        err,
        LedgerError::ForeignKeyViolation {
            table: "artifacts",
            ..
        }
    ));
}

#[test]
fn at_provenance_db_05_self_reference_rejected_at_contract_level() {
    let edge = ProvenanceEdge::v1(
        ArtifactId(5),
        Some(ArtifactId(5)),
        ProducedBy::System,
        vec![],
        custody_contracts::artifact::ArtifactVersion(1),
        MonotonicTimeNs(1),
    );
    assert!(edge.is_err());
}

#[test]
fn at_provenance_db_06_derived_artifacts_require_lineage() {
    let mut s = LedgerStore::new_in_memory();
    let conversation_id = seeded_conversation(&mut s);
    let err = add_derived(
        &mut s,
        conversation_id,
        ArtifactType::TranscriptVersion,
        None,
        vec![],
        11,
    )
    .unwrap_err();
    assert!(matches!(
        err,
        LedgerError::ContractViolation(ContractViolation::InvalidValue {
            field: "provenance_edge",
            ..
        })
    ));

    // Input refs alone satisfy the lineage requirement (external
    // vendor media as the declared input).
    let ok = add_derived(
        &mut s,
        conversation_id,
        ArtifactType::TranscriptVersion,
        None,
        vec![InputRef::v1(
            InputRefKind::External,
            "vendor://media/call_1",
            format!("sha256:{}", "a".repeat(64)),
        )
        .unwrap()],
        12,
    );
    assert!(ok.is_ok());
}

#[test]
fn at_provenance_db_07_one_edge_per_artifact_and_append_only() {
    let mut s = LedgerStore::new_in_memory();
    let conversation_id = seeded_conversation(&mut s);
    let recording = add_recording(&mut s, conversation_id, 10);
    let edge = s.provenance_edge(recording).unwrap().clone();
    assert!(edge.validate().is_ok());
    assert!(matches!(
        s.attempt_overwrite_provenance_edge(recording),
        Err(LedgerError::AppendOnlyViolation {
            table: "provenance_edges",
        })
    ));
}
