#![forbid(unsafe_code)]

use custody_contracts::audit::{
    AuditAction, AuditEntryId, AuditEntryInput, AuditResourceType, ErrorRecord, ErrorSeverity,
};
use custody_contracts::conversation::{ConversationId, ConversationRecordInput};
use custody_contracts::{ActorRef, MonotonicTimeNs};
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

fn entry(
    at: u64,
    conversation_id: Option<ConversationId>,
    actor: ActorRef,
    resource_id: u64,
) -> AuditEntryInput {
    AuditEntryInput::v1(
        MonotonicTimeNs(at),
        conversation_id,
        actor,
        AuditAction::DeliveryEnqueued,
        AuditResourceType::DeliveryTask,
        resource_id,
        None,
        Some("{\"status\":\"pending\"}".to_string()),
        None,
    )
    .unwrap()
}

#[test]
fn at_audit_db_01_append_assigns_sequential_ids() {
    let mut s = LedgerStore::new_in_memory();
    let conversation_id = seeded_conversation(&mut s);
    // insert_conversation already appended entry 1.
    let id2 = s
        .append_audit_entry(entry(10, Some(conversation_id), ActorRef::System, 1))
        .unwrap();
    let id3 = s
        .append_audit_entry(entry(11, Some(conversation_id), ActorRef::System, 2))
        .unwrap();
    assert_eq!(id2, AuditEntryId(2));
    assert_eq!(id3, AuditEntryId(3));
    assert_eq!(s.audit_entries().len(), 3);
}

#[test]
fn at_audit_db_02_no_update_or_delete_path_exists() {
    let mut s = LedgerStore::new_in_memory();
    let conversation_id = seeded_conversation(&mut s);
    let id = s
        .append_audit_entry(entry(10, Some(conversation_id), ActorRef::System, 1))
        .unwrap();
    assert!(matches!(
        s.attempt_overwrite_audit_entry(id),
        Err(LedgerError::AppendOnlyViolation {
            table: "audit_entries",
        })
    ));
}

#[test]
fn at_audit_db_03_every_entry_carries_an_actor() {
    let mut s = LedgerStore::new_in_memory();
    let conversation_id = seeded_conversation(&mut s);
    s.append_audit_entry(entry(
        10,
        Some(conversation_id),
        ActorRef::Vendor {
            vendor_key: "telephony_primary".to_string(),
        },
        1,
    ))
    .unwrap();
    for e in s.audit_entries() {
        assert!(!e.actor.actor_type().is_empty());
    }
}

#[test]
fn at_audit_db_04_error_journal_shape() {
    let mut s = LedgerStore::new_in_memory();
    let conversation_id = seeded_conversation(&mut s);
    s.journal_error(
        MonotonicTimeNs(10),
        AuditResourceType::DeliveryTask,
        7,
        Some(conversation_id),
        ActorRef::Automation {
            job_name: "delivery_worker_1".to_string(),
        },
        ErrorRecord::v1(
            "DELIVERY_ATTEMPT_TRANSIENT",
            ErrorSeverity::Medium,
            true,
            "attempt 1/5: http status 503",
        )
        .unwrap(),
    )
    .unwrap();

    let e = s.audit_entries().last().unwrap();
    assert_eq!(e.action, AuditAction::Error);
    let error = e.error.as_ref().unwrap();
    assert_eq!(error.code, "DELIVERY_ATTEMPT_TRANSIENT");
    assert_eq!(error.severity, ErrorSeverity::Medium);
    assert!(error.retriable);
}

#[test]
fn at_audit_db_05_query_by_conversation_is_ordered_and_paginated() {
    let mut s = LedgerStore::new_in_memory();
    let conversation_a = seeded_conversation(&mut s);
    let conversation_b = seeded_conversation(&mut s);
    for i in 0..5u64 {
        s.append_audit_entry(entry(10 + i, Some(conversation_a), ActorRef::System, i + 1))
            .unwrap();
    }
    s.append_audit_entry(entry(20, Some(conversation_b), ActorRef::System, 9))
        .unwrap();

    let all = s.audit_entries_by_conversation(conversation_a, 0, 100);
    // conversation_created + 5 appended entries, ascending created_at.
    assert_eq!(all.len(), 6);
    for pair in all.windows(2) {
        assert!(pair[0].created_at <= pair[1].created_at);
    }

    let page = s.audit_entries_by_conversation(conversation_a, 2, 2);
    assert_eq!(page.len(), 2);
    assert_eq!(page[0].entry_id.0 + 1, page[1].entry_id.0);

    let other = s.audit_entries_by_conversation(conversation_b, 0, 100);
    assert_eq!(other.len(), 2);
}
