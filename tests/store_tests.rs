//! End-to-end tests of the message store engine: enqueue/dequeue,
//! tiering, XA branches, recovery visitation, and restart behavior.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use mqstore::{
    EnqueueRecord, MessageHandle, MessageMetadata, MessageStore, MetadataType, StoreConfig,
    StoreError, Xid, XidEnqueue,
};
use tempfile::TempDir;
use uuid::Uuid;

fn open_store(dir: &TempDir) -> MessageStore {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    MessageStore::open(StoreConfig::new(dir.path().join("messages.db"))).unwrap()
}

fn message(store: &MessageStore, content: &[u8]) -> Arc<MessageHandle> {
    let handle = store
        .create_message(MessageMetadata::new(
            MetadataType::Internal,
            u32::try_from(content.len()).unwrap(),
            Vec::new(),
        ))
        .unwrap();
    if !content.is_empty() {
        handle.add_content(content).unwrap();
    }
    handle
}

fn content_bytes(handle: &MessageHandle, offset: usize, length: usize) -> Vec<u8> {
    let mut out = Vec::new();
    for view in handle.content(offset, length).unwrap() {
        out.extend_from_slice(&view);
    }
    out
}

#[test]
fn store_commit_and_recover_round_trip() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let queue = Uuid::new_v4();

    let handle = message(&store, b"hello");
    assert_eq!(handle.id(), 1);

    let mut txn = store.begin().unwrap();
    txn.enqueue(queue, &handle).unwrap();
    txn.commit().unwrap();

    let reader = store.reader().unwrap();
    let recovered = reader.get_message(1).unwrap().expect("message 1 exists");
    assert_eq!(content_bytes(&recovered, 0, 5), b"hello");
    assert_eq!(recovered.metadata().unwrap().kind, MetadataType::Internal);

    let mut entries = Vec::new();
    reader
        .visit_queue_entries(Some(queue), |record| {
            entries.push(record);
            true
        })
        .unwrap();
    assert_eq!(
        entries,
        vec![EnqueueRecord {
            queue_id: queue,
            message_id: 1
        }]
    );
}

#[test]
fn message_ids_are_strictly_increasing() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    let mut last = 0;
    for _ in 0..100 {
        let id = store.next_message_id();
        assert!(id > last, "id {id} not greater than {last}");
        last = id;
    }
}

#[test]
fn allocator_reseeds_from_persisted_rows_on_restart() {
    let dir = TempDir::new().unwrap();
    let queue = Uuid::new_v4();
    {
        let store = open_store(&dir);
        let mut txn = store.begin().unwrap();
        for _ in 0..3 {
            let handle = message(&store, b"m");
            txn.enqueue(queue, &handle).unwrap();
        }
        txn.commit().unwrap();
    }

    let store = open_store(&dir);
    assert_eq!(store.next_message_id(), 4);
}

#[test]
fn dequeue_removes_the_entry() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let queue = Uuid::new_v4();

    let handle = message(&store, b"payload");
    let mut txn = store.begin().unwrap();
    let record = txn.enqueue(queue, &handle).unwrap();
    txn.commit().unwrap();

    let mut txn = store.begin().unwrap();
    txn.dequeue(&record).unwrap();
    txn.commit().unwrap();

    let mut count = 0;
    store
        .reader()
        .unwrap()
        .visit_queue_entries(None, |_| {
            count += 1;
            true
        })
        .unwrap();
    assert_eq!(count, 0);
}

#[test]
fn dequeue_of_missing_entry_is_integrity_violation() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    let mut txn = store.begin().unwrap();
    let err = txn
        .dequeue(&EnqueueRecord {
            queue_id: Uuid::new_v4(),
            message_id: 42,
        })
        .unwrap_err();
    assert!(matches!(err, StoreError::IntegrityViolation(_)));

    // The transaction is still abortable, with no partial effect.
    txn.abort().unwrap();

    let mut count = 0;
    store
        .reader()
        .unwrap()
        .visit_queue_entries(None, |_| {
            count += 1;
            true
        })
        .unwrap();
    assert_eq!(count, 0);
}

#[test]
fn flow_to_disk_evicts_and_content_survives() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    let handle = message(&store, b"payload");
    assert!(handle.is_in_memory());

    handle.flow_to_disk().unwrap();
    assert!(!handle.is_in_memory(), "buffers must be released");
    assert_eq!(store.store_size(), 7);

    assert_eq!(content_bytes(&handle, 0, 7), b"payload");
    assert!(handle.is_in_memory(), "read restores the cache");

    // Evicting again releases the restored cache; nothing is rewritten.
    handle.flow_to_disk().unwrap();
    assert!(!handle.is_in_memory());
    assert_eq!(store.store_size(), 7);
}

#[test]
fn partial_content_reads() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    let handle = message(&store, b"hello");
    handle.flow_to_disk().unwrap();

    assert_eq!(content_bytes(&handle, 1, 3), b"ell");
    assert_eq!(content_bytes(&handle, 4, 10), b"o");
    assert_eq!(content_bytes(&handle, 9, 3), b"");
}

#[test]
fn multi_chunk_content_concatenates_in_order() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    let handle = store
        .create_message(MessageMetadata::new(MetadataType::Amqp1_0, 6, vec![9, 9]))
        .unwrap();
    handle.add_content(b"foo".as_slice()).unwrap();
    handle.add_content(b"bar".as_slice()).unwrap();

    handle.flow_to_disk().unwrap();
    assert_eq!(content_bytes(&handle, 0, 6), b"foobar");
}

#[test]
fn add_content_after_store_is_rejected() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    let handle = message(&store, b"x");
    handle.flow_to_disk().unwrap();

    let err = handle.add_content(b"more".as_slice()).unwrap_err();
    assert!(matches!(err, StoreError::IntegrityViolation(_)));
}

#[test]
fn abort_leaves_no_rows_behind() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let queue = Uuid::new_v4();

    let mut txn = store.begin().unwrap();
    for _ in 0..2 {
        let handle = message(&store, b"transient");
        txn.enqueue(queue, &handle).unwrap();
    }
    txn.abort().unwrap();

    let reader = store.reader().unwrap();
    let mut messages = 0;
    reader
        .visit_messages(|_| {
            messages += 1;
            true
        })
        .unwrap();
    assert_eq!(messages, 0);

    let mut entries = 0;
    reader
        .visit_queue_entries(None, |_| {
            entries += 1;
            true
        })
        .unwrap();
    assert_eq!(entries, 0);
    assert_eq!(store.store_size(), 0);
}

#[test]
fn dropping_a_transaction_rolls_back() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let queue = Uuid::new_v4();

    {
        let mut txn = store.begin().unwrap();
        let handle = message(&store, b"dropped");
        txn.enqueue(queue, &handle).unwrap();
    }

    let mut entries = 0;
    store
        .reader()
        .unwrap()
        .visit_queue_entries(None, |_| {
            entries += 1;
            true
        })
        .unwrap();
    assert_eq!(entries, 0);
}

#[test]
fn remove_deletes_rows_and_accounts_size() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let queue = Uuid::new_v4();

    let handle = message(&store, b"hello");
    let mut txn = store.begin().unwrap();
    txn.enqueue(queue, &handle).unwrap();
    txn.commit().unwrap();
    assert_eq!(store.store_size(), 5);

    handle.remove().unwrap();
    assert_eq!(store.store_size(), 0);
    assert!(store.reader().unwrap().get_message(handle.id()).unwrap().is_none());

    // Double remove is a guarded no-op.
    handle.remove().unwrap();
    assert_eq!(store.store_size(), 0);

    let err = handle.content(0, 5).unwrap_err();
    assert!(matches!(err, StoreError::MessageNotFound(_)));
}

#[test]
fn enqueue_of_durable_message_still_accumulates_size() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let queue = Uuid::new_v4();

    let handle = message(&store, b"payload");
    handle.flow_to_disk().unwrap();
    assert_eq!(store.store_size(), 7);

    // The pre-commit store is a no-op for an already durable message,
    // but its size is counted again, as with a freshly stored one.
    let mut txn = store.begin().unwrap();
    txn.enqueue(queue, &handle).unwrap();
    txn.commit().unwrap();
    assert_eq!(store.store_size(), 14);
}

#[test]
fn abort_rolls_back_rows_written_before_commit() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let queue = Uuid::new_v4();

    let m1 = message(&store, b"one");
    let m2 = message(&store, b"two");
    let xid = Xid::new(9, vec![0x0A], vec![0x0B]);

    // record_xid persists the branch's not-yet-durable messages within
    // the transaction, so metadata and content rows exist before abort.
    let mut txn = store.begin().unwrap();
    txn.record_xid(
        &xid,
        &[
            XidEnqueue {
                queue_id: queue,
                message: Arc::clone(&m1),
            },
            XidEnqueue {
                queue_id: queue,
                message: Arc::clone(&m2),
            },
        ],
        &[],
    )
    .unwrap();
    txn.abort().unwrap();

    let reader = store.reader().unwrap();
    assert!(reader.get_message(m1.id()).unwrap().is_none());
    assert!(reader.get_message(m2.id()).unwrap().is_none());

    let mut messages = 0;
    reader
        .visit_messages(|_| {
            messages += 1;
            true
        })
        .unwrap();
    assert_eq!(messages, 0);

    let mut branches = 0;
    reader
        .visit_distributed_transactions(|_| {
            branches += 1;
            true
        })
        .unwrap();
    assert_eq!(branches, 0);
}

#[test]
fn commit_async_resolves_with_value_after_commit() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let queue = Uuid::new_v4();

    let handle = message(&store, b"async");
    let mut txn = store.begin().unwrap();
    txn.enqueue(queue, &handle).unwrap();
    let future = txn.commit_async(handle.id()).unwrap();
    assert_eq!(future.wait().unwrap(), handle.id());

    let recovered = store
        .reader()
        .unwrap()
        .get_message(handle.id())
        .unwrap()
        .expect("committed message visible");
    assert_eq!(content_bytes(&recovered, 0, 5), b"async");
}

#[test]
fn commit_async_accounts_optimistically_before_confirmation() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let queue = Uuid::new_v4();

    let fired = Arc::new(AtomicUsize::new(0));
    let handle = message(&store, b"eager");
    let mut txn = store.begin().unwrap();
    txn.enqueue(queue, &handle).unwrap();
    {
        let fired = Arc::clone(&fired);
        txn.add_post_commit(move || {
            fired.fetch_add(1, Ordering::SeqCst);
        });
    }

    // Size accounting and post-commit callbacks run on the caller as
    // part of commit_async itself, before the background commit is
    // confirmed.
    let future = txn.commit_async(()).unwrap();
    assert_eq!(store.store_size(), 5);
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    future.wait().unwrap();
    assert_eq!(store.store_size(), 5);
}

#[test]
fn post_commit_actions_run_after_commit() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let queue = Uuid::new_v4();

    let fired = Arc::new(AtomicUsize::new(0));
    let handle = message(&store, b"cb");
    let mut txn = store.begin().unwrap();
    txn.enqueue(queue, &handle).unwrap();
    for _ in 0..2 {
        let fired = Arc::clone(&fired);
        txn.add_post_commit(move || {
            fired.fetch_add(1, Ordering::SeqCst);
        });
    }
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    txn.commit().unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 2);
}

#[test]
fn xid_branch_visits_with_partitioned_actions() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let q1 = Uuid::new_v4();
    let q2 = Uuid::new_v4();

    // An already-enqueued message supplies the dequeue effect.
    let settled = message(&store, b"settled");
    let mut txn = store.begin().unwrap();
    let dequeue_record = txn.enqueue(q1, &settled).unwrap();
    txn.commit().unwrap();

    let m1 = message(&store, b"first");
    let m2 = message(&store, b"second");
    let xid = Xid::new(7, vec![0xAA, 0xBB], vec![0xCC]);

    let mut txn = store.begin().unwrap();
    txn.record_xid(
        &xid,
        &[
            XidEnqueue {
                queue_id: q1,
                message: Arc::clone(&m1),
            },
            XidEnqueue {
                queue_id: q2,
                message: Arc::clone(&m2),
            },
        ],
        &[dequeue_record],
    )
    .unwrap();
    txn.commit().unwrap();

    let mut branches = Vec::new();
    store
        .reader()
        .unwrap()
        .visit_distributed_transactions(|branch| {
            branches.push(branch);
            true
        })
        .unwrap();

    assert_eq!(branches.len(), 1);
    let branch = &branches[0];
    assert_eq!(branch.xid, xid);
    assert_eq!(branch.enqueues.len(), 2);
    assert_eq!(branch.dequeues.len(), 1);
    assert_eq!(branch.enqueues[0].message_id, m1.id());
    assert_eq!(branch.enqueues[1].message_id, m2.id());
    assert_eq!(branch.dequeues[0], dequeue_record);

    // Messages named by the branch were persisted with it.
    assert!(store.reader().unwrap().get_message(m1.id()).unwrap().is_some());
    assert!(store.reader().unwrap().get_message(m2.id()).unwrap().is_some());
}

#[test]
fn remove_xid_succeeds_once_then_violates() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let queue = Uuid::new_v4();

    let handle = message(&store, b"xa");
    let xid = Xid::new(1, vec![0x01], vec![0x02]);

    let mut txn = store.begin().unwrap();
    txn.record_xid(
        &xid,
        &[XidEnqueue {
            queue_id: queue,
            message: Arc::clone(&handle),
        }],
        &[],
    )
    .unwrap();
    txn.commit().unwrap();

    let mut txn = store.begin().unwrap();
    txn.remove_xid(&xid).unwrap();
    txn.commit().unwrap();

    let mut txn = store.begin().unwrap();
    let err = txn.remove_xid(&xid).unwrap_err();
    assert!(matches!(err, StoreError::IntegrityViolation(_)));
    txn.abort().unwrap();

    let mut branches = 0;
    store
        .reader()
        .unwrap()
        .visit_distributed_transactions(|_| {
            branches += 1;
            true
        })
        .unwrap();
    assert_eq!(branches, 0);
}

#[test]
fn visit_messages_in_ascending_id_order_with_early_stop() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let queue = Uuid::new_v4();

    let mut txn = store.begin().unwrap();
    for _ in 0..3 {
        let handle = message(&store, b"m");
        txn.enqueue(queue, &handle).unwrap();
    }
    txn.commit().unwrap();

    let reader = store.reader().unwrap();
    let mut ids = Vec::new();
    reader
        .visit_messages(|handle| {
            ids.push(handle.id());
            true
        })
        .unwrap();
    assert_eq!(ids, vec![1, 2, 3]);

    let mut seen = 0;
    reader
        .visit_messages(|_| {
            seen += 1;
            false
        })
        .unwrap();
    assert_eq!(seen, 1);
}

#[test]
fn visit_queue_entries_orders_by_queue_then_message() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let q1 = Uuid::new_v4();
    let q2 = Uuid::new_v4();

    let mut txn = store.begin().unwrap();
    for queue in [q2, q1, q2, q1] {
        let handle = message(&store, b"m");
        txn.enqueue(queue, &handle).unwrap();
    }
    txn.commit().unwrap();

    let mut entries = Vec::new();
    store
        .reader()
        .unwrap()
        .visit_queue_entries(None, |record| {
            entries.push(record);
            true
        })
        .unwrap();

    assert_eq!(entries.len(), 4);
    let keys: Vec<_> = entries
        .iter()
        .map(|r| (r.queue_id.to_string(), r.message_id))
        .collect();
    let mut sorted = keys.clone();
    sorted.sort();
    assert_eq!(keys, sorted);
}

#[test]
fn corrupt_metadata_surfaces_as_corrupt_record() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    let handle = message(&store, b"ok");
    handle.flow_to_disk().unwrap();

    let conn = rusqlite::Connection::open(dir.path().join("messages.db")).unwrap();
    conn.execute(
        "UPDATE message_metadata SET meta_data = ?1 WHERE message_id = ?2",
        rusqlite::params![vec![0xFFu8, 0, 0, 0, 0], handle.id()],
    )
    .unwrap();

    let err = store
        .reader()
        .unwrap()
        .get_message(handle.id())
        .unwrap_err();
    assert!(matches!(err, StoreError::CorruptRecord(_)));
}

#[test]
fn closed_store_rejects_operations() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    store.close();

    assert!(!store.is_open());
    assert!(matches!(store.begin(), Err(StoreError::StoreClosed)));
    assert!(matches!(store.reader(), Err(StoreError::StoreClosed)));
    assert!(matches!(
        store.create_message(MessageMetadata::new(MetadataType::Internal, 0, Vec::new())),
        Err(StoreError::StoreClosed)
    ));

    // Idempotent.
    store.close();
}

#[test]
fn delete_store_drops_all_tables() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let queue = Uuid::new_v4();

    let handle = message(&store, b"bye");
    let mut txn = store.begin().unwrap();
    txn.enqueue(queue, &handle).unwrap();
    txn.commit().unwrap();

    store.close();
    store.delete_store().unwrap();

    let conn = rusqlite::Connection::open(dir.path().join("messages.db")).unwrap();
    let tables: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(tables, 0);
}

#[test]
fn table_prefix_applies_to_all_tables() {
    let dir = TempDir::new().unwrap();
    let mut config = StoreConfig::new(dir.path().join("messages.db"));
    config.table_prefix = "broker_".to_string();
    let store = MessageStore::open(config).unwrap();

    for name in store.table_names() {
        assert!(name.starts_with("broker_"), "unprefixed table {name}");
    }

    let conn = rusqlite::Connection::open(dir.path().join("messages.db")).unwrap();
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master \
             WHERE type = 'table' AND name LIKE 'broker\\_%' ESCAPE '\\'",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(count, 6);
}

#[test]
fn reopened_store_visits_recovered_state() {
    let dir = TempDir::new().unwrap();
    let queue = Uuid::new_v4();
    let xid = Xid::new(3, vec![0x10], vec![0x20]);

    {
        let store = open_store(&dir);
        let handle = message(&store, b"durable");
        let mut txn = store.begin().unwrap();
        txn.enqueue(queue, &handle).unwrap();
        txn.record_xid(&xid, &[], &[]).unwrap();
        txn.commit().unwrap();
    }

    let store = open_store(&dir);
    let reader = store.reader().unwrap();

    let recovered = reader.get_message(1).unwrap().expect("message survived");
    assert_eq!(content_bytes(&recovered, 0, 7), b"durable");

    let mut branches = Vec::new();
    reader
        .visit_distributed_transactions(|branch| {
            branches.push(branch.xid.clone());
            true
        })
        .unwrap();
    assert_eq!(branches, vec![xid]);
}
