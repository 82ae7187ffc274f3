#![forbid(unsafe_code)]

use custody_contracts::artifact::{
    ArtifactId, ArtifactPayload, ArtifactRecordInput, ArtifactSource, ArtifactType,
};
use custody_contracts::audit::AuditAction;
use custody_contracts::conversation::{ConversationId, ConversationRecordInput};
use custody_contracts::{ActorRef, LifecycleState, MonotonicTimeNs, ProducedBy};
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

fn recording_input(conversation_id: ConversationId, blob: &str) -> ArtifactRecordInput {
    ArtifactRecordInput::v1(
        conversation_id,
        ArtifactType::Recording,
        ArtifactPayload::ContentRef(blob.to_string()),
        ProducedBy::System,
        Some(ArtifactSource::VendorTelephony),
    )
    .unwrap()
}

fn score_input(conversation_id: ConversationId, doc: &str) -> ArtifactRecordInput {
    ArtifactRecordInput::v1(
        conversation_id,
        ArtifactType::Score,
        ArtifactPayload::InlineJson(doc.to_string()),
        ProducedBy::Model {
            model_name: "scorer_v2".to_string(),
        },
        None,
    )
    .unwrap()
}

#[test]
fn at_artifacts_db_01_create_assigns_server_side_ids_and_hash() {
    let mut s = LedgerStore::new_in_memory();
    let conversation_id = seeded_conversation(&mut s);

    let a = s
        .create_artifact(
            MonotonicTimeNs(10),
            recording_input(conversation_id, "blob://rec/1"),
            None,
            vec![],
            ActorRef::System,
        )
        .unwrap();
    let b = s
        .create_artifact(
            MonotonicTimeNs(11),
            recording_input(conversation_id, "blob://rec/2"),
            None,
            vec![],
            ActorRef::System,
        )
        .unwrap();

    assert_eq!(a.artifact_id, ArtifactId(1));
    assert_eq!(b.artifact_id, ArtifactId(2));
    assert!(a.content_hash.starts_with("sha256:"));
    assert_ne!(a.content_hash, b.content_hash);
    // Lineage versions are monotonic per (conversation, type).
    assert_eq!(a.version.0, 1);
    assert_eq!(b.version.0, 2);
}

#[test]
fn at_artifacts_db_02_create_rejects_unknown_conversation() {
    let mut s = LedgerStore::new_in_memory();
    let err = s
        .create_artifact(
            MonotonicTimeNs(10),
            recording_input(ConversationId(999), "blob://rec/1"),
            None,
            vec![],
            ActorRef::System,
        )
        .unwrap_err();
    assert!(matches!(
        err,
        LedgerError::ForeignKeyViolation {
            table: "conversations",
            ..
        }
    ));
    // Nothing was written: no artifact row, no audit entry.
    assert!(s.artifact(ArtifactId(1)).is_none());
    assert!(s.audit_entries().is_empty());
}

#[test]
fn at_artifacts_db_03_read_returns_row_unchanged() {
    let mut s = LedgerStore::new_in_memory();
    let conversation_id = seeded_conversation(&mut s);
    let created = s
        .create_artifact(
            MonotonicTimeNs(10),
            recording_input(conversation_id, "blob://rec/1"),
            None,
            vec![],
            ActorRef::System,
        )
        .unwrap();
    let read = s.artifact(created.artifact_id).unwrap();
    assert_eq!(read, &created);
}

#[test]
fn at_artifacts_db_04_locked_field_write_rejected_and_journaled() {
    let mut s = LedgerStore::new_in_memory();
    let conversation_id = seeded_conversation(&mut s);
    let created = s
        .create_artifact(
            MonotonicTimeNs(10),
            recording_input(conversation_id, "blob://rec/1"),
            None,
            vec![],
            ActorRef::System,
        )
        .unwrap();

    for field in ["payload", "content_hash", "produced_by", "source", "conversation_id"] {
        let err = s
            .attempt_update_artifact_field(
                MonotonicTimeNs(20),
                created.artifact_id,
                field,
                ActorRef::Human {
                    user_id: "agent_17".to_string(),
                },
            )
            .unwrap_err();
        assert!(matches!(
            err,
            LedgerError::ImmutabilityViolation {
                table: "artifacts",
                ..
            }
        ));
    }
    // Row is byte-identical after the rejected writes.
    assert_eq!(s.artifact(created.artifact_id).unwrap(), &created);
    // Violations are evidence too: one error entry per rejected write.
    let error_entries = s
        .audit_entries()
        .iter()
        .filter(|e| e.action == AuditAction::Error)
        .count();
    assert_eq!(error_entries, 5);
    let entry = s
        .audit_entries()
        .iter()
        .find(|e| e.action == AuditAction::Error)
        .unwrap();
    let error = entry.error.as_ref().unwrap();
    assert_eq!(error.code, "IMMUTABLE_FIELD_WRITE_REJECTED");
    assert!(!error.retriable);
    assert_eq!(entry.actor.actor_type(), "human");
}

#[test]
fn at_artifacts_db_05_soft_delete_hides_row_from_default_reads() {
    let mut s = LedgerStore::new_in_memory();
    let conversation_id = seeded_conversation(&mut s);
    let created = s
        .create_artifact(
            MonotonicTimeNs(10),
            score_input(conversation_id, "{\"value\":0.8}"),
            None,
            vec![custody_contracts::provenance::InputRef::v1(
                custody_contracts::provenance::InputRefKind::External,
                "vendor://media/1",
                format!("sha256:{}", "a".repeat(64)),
            )
            .unwrap()],
            ActorRef::System,
        )
        .unwrap();

    let deleted = s
        .soft_delete_artifact(MonotonicTimeNs(20), created.artifact_id, ActorRef::System)
        .unwrap();
    assert_eq!(deleted.lifecycle, LifecycleState::SoftDeleted);
    assert!(s.artifact(created.artifact_id).is_none());
    // Compliance read path still sees it.
    assert!(s.artifact_including_deleted(created.artifact_id).is_some());
    assert!(s
        .artifacts_by_conversation(conversation_id, false)
        .is_empty());
    assert_eq!(s.artifacts_by_conversation(conversation_id, true).len(), 1);
}

#[test]
fn at_artifacts_db_06_raw_recordings_are_never_deletable() {
    let mut s = LedgerStore::new_in_memory();
    let conversation_id = seeded_conversation(&mut s);
    let created = s
        .create_artifact(
            MonotonicTimeNs(10),
            recording_input(conversation_id, "blob://rec/1"),
            None,
            vec![],
            ActorRef::System,
        )
        .unwrap();
    let err = s
        .soft_delete_artifact(MonotonicTimeNs(20), created.artifact_id, ActorRef::System)
        .unwrap_err();
    assert!(matches!(
        err,
        LedgerError::ImmutabilityViolation {
            table: "artifacts",
            field: "deleted_at",
        }
    ));
    // Still active, and the rejection is journaled.
    assert!(s.artifact(created.artifact_id).is_some());
    let entry = s
        .audit_entries()
        .iter()
        .find(|e| e.action == AuditAction::Error)
        .unwrap();
    assert_eq!(entry.error.as_ref().unwrap().code, "RAW_MEDIA_DELETE_REJECTED");
}

#[test]
fn at_artifacts_db_07_append_only_overwrite_is_refused() {
    let mut s = LedgerStore::new_in_memory();
    let conversation_id = seeded_conversation(&mut s);
    let created = s
        .create_artifact(
            MonotonicTimeNs(10),
            recording_input(conversation_id, "blob://rec/1"),
            None,
            vec![],
            ActorRef::System,
        )
        .unwrap();
    assert!(matches!(
        s.attempt_overwrite_artifact_row(created.artifact_id),
        Err(LedgerError::AppendOnlyViolation { table: "artifacts" })
    ));
}

#[test]
fn at_artifacts_db_08_conversation_status_narrow_path() {
    let mut s = LedgerStore::new_in_memory();
    let conversation_id = seeded_conversation(&mut s);

    let active = s
        .update_conversation_status(
            MonotonicTimeNs(10),
            conversation_id,
            custody_contracts::conversation::ConversationStatus::Active,
            ActorRef::System,
        )
        .unwrap();
    assert_eq!(active.started_at, Some(MonotonicTimeNs(10)));

    let ended = s
        .update_conversation_status(
            MonotonicTimeNs(20),
            conversation_id,
            custody_contracts::conversation::ConversationStatus::Ended,
            ActorRef::System,
        )
        .unwrap();
    assert_eq!(ended.ended_at, Some(MonotonicTimeNs(20)));

    // Ended is terminal.
    let err = s
        .update_conversation_status(
            MonotonicTimeNs(30),
            conversation_id,
            custody_contracts::conversation::ConversationStatus::Active,
            ActorRef::System,
        )
        .unwrap_err();
    assert!(matches!(
        err,
        LedgerError::TransitionViolation {
            table: "conversations",
            ..
        }
    ));

    // Any other conversation field is locked.
    let err = s
        .attempt_update_conversation_field(
            MonotonicTimeNs(40),
            conversation_id,
            "created_by",
            ActorRef::System,
        )
        .unwrap_err();
    assert!(matches!(
        err,
        LedgerError::ImmutabilityViolation {
            table: "conversations",
            field: "created_by",
        }
    ));
}
