use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use combdb::{
    MessageKey, MessageRecord, MessageStore, QueueEntryRecord, QueueKey, QueueRecord, StoreConfig,
};
use tempfile::TempDir;

const WAIT: Duration = Duration::from_secs(5);

fn config(dir: &TempDir) -> StoreConfig {
    StoreConfig::new(dir.path().join("broker"))
        .with_page_size(512)
        .with_max_pages(4096)
        .unsynced()
}

fn message(id: &str) -> MessageRecord {
    MessageRecord {
        message_id: id.to_string(),
        payload: format!("payload of {id}").into_bytes(),
    }
}

fn entry(queue: QueueKey, seq: u64, message: MessageKey) -> QueueEntryRecord {
    QueueEntryRecord {
        queue_key: queue,
        queue_seq: seq,
        message_key: message,
        size: 64,
    }
}

/// Completion listener that signals a channel, so tests wait on real
/// pipeline progress instead of sleeping.
fn completion_probe(
    uow: &combdb::StoreUow,
    calls: &Arc<AtomicUsize>,
) -> mpsc::Receiver<combdb::UowResult> {
    let (tx, rx) = mpsc::channel();
    let calls = Arc::clone(calls);
    uow.on_complete(move |result| {
        calls.fetch_add(1, Ordering::SeqCst);
        let _ = tx.send(result);
    });
    rx
}

#[test]
fn store_enqueue_flush_and_read_back() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = MessageStore::open(config(&dir).with_flush_delay_ms(10)).unwrap();
    let queue = store
        .add_queue(QueueRecord {
            name: "orders".into(),
        })
        .unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let uow = store.create_uow();
    let key = uow.store(message("m-1"));
    uow.enqueue(entry(queue, 1, key));
    let done = completion_probe(&uow, &calls);
    uow.complete();

    done.recv_timeout(WAIT).unwrap().unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let loaded = store.load_message(key).unwrap().unwrap();
    assert_eq!(loaded, message("m-1"));
    let entries = store.list_queue_entries(queue, 0, u64::MAX).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].queue_seq, 1);
    assert_eq!(entries[0].message_key, key);

    let status = store.get_queue_status(queue).unwrap().unwrap();
    assert_eq!(status.count, 1);
    assert_eq!(status.first_seq, Some(1));
    assert_eq!(status.last_seq, Some(1));
    assert_eq!(status.record.name, "orders");

    store.close().unwrap();
}

#[test]
fn matched_enqueue_dequeue_pair_cancels_without_disk_io() {
    let dir = tempfile::tempdir().unwrap();
    // A generous delay keeps the first UOW in the pipeline while the
    // matching dequeue arrives.
    let mut store = MessageStore::open(config(&dir).with_flush_delay_ms(10_000)).unwrap();
    let queue = store
        .add_queue(QueueRecord {
            name: "transient".into(),
        })
        .unwrap();

    let calls = Arc::new(AtomicUsize::new(0));

    let u1 = store.create_uow();
    let key = u1.store(message("m-cancel"));
    u1.enqueue(entry(queue, 1, key));
    let done1 = completion_probe(&u1, &calls);
    u1.complete();

    let u2 = store.create_uow();
    u2.dequeue(entry(queue, 1, key));
    let done2 = completion_probe(&u2, &calls);
    u2.complete();

    // Both complete promptly: cancellation, not the 10s delay.
    done1.recv_timeout(WAIT).unwrap().unwrap();
    done2.recv_timeout(WAIT).unwrap().unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let metrics = store.metrics();
    assert_eq!(metrics.uows_canceled, 2);
    assert_eq!(metrics.enqueues_canceled, 1);
    assert_eq!(metrics.records_elided, 1);
    assert_eq!(metrics.flush_batches, 0);

    // Nothing reached disk.
    assert!(store.load_message(key).unwrap().is_none());
    assert!(store.list_queue_entries(queue, 0, u64::MAX).unwrap().is_empty());
    store.close().unwrap();
}

#[test]
fn partial_cancellation_keeps_the_surviving_enqueue() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = MessageStore::open(config(&dir).with_flush_delay_ms(50)).unwrap();
    let q1 = store.add_queue(QueueRecord { name: "q1".into() }).unwrap();
    let q2 = store.add_queue(QueueRecord { name: "q2".into() }).unwrap();

    let calls = Arc::new(AtomicUsize::new(0));

    let u1 = store.create_uow();
    let key = u1.store(message("m-partial"));
    u1.enqueue(entry(q1, 1, key));
    u1.enqueue(entry(q2, 1, key));
    let done1 = completion_probe(&u1, &calls);
    u1.complete();

    let u2 = store.create_uow();
    u2.dequeue(entry(q1, 1, key));
    let done2 = completion_probe(&u2, &calls);
    u2.complete();

    done1.recv_timeout(WAIT).unwrap().unwrap();
    done2.recv_timeout(WAIT).unwrap().unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // q1's entry canceled, q2's entry and the record persisted.
    assert!(store.list_queue_entries(q1, 0, u64::MAX).unwrap().is_empty());
    let survivors = store.list_queue_entries(q2, 0, u64::MAX).unwrap();
    assert_eq!(survivors.len(), 1);
    assert_eq!(survivors[0].message_key, key);
    assert_eq!(store.load_message(key).unwrap().unwrap(), message("m-partial"));

    let metrics = store.metrics();
    assert_eq!(metrics.enqueues_canceled, 1);
    assert_eq!(metrics.records_elided, 0);
    store.close().unwrap();
}

#[test]
fn complete_asap_skips_the_flush_delay() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = MessageStore::open(config(&dir).with_flush_delay_ms(60_000)).unwrap();
    let queue = store.add_queue(QueueRecord { name: "q".into() }).unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let uow = store.create_uow();
    let key = uow.store(message("m-asap"));
    uow.enqueue(entry(queue, 1, key));
    uow.complete_asap();
    let done = completion_probe(&uow, &calls);
    uow.complete();

    // Flushes on the next drain rather than after a minute.
    done.recv_timeout(WAIT).unwrap().unwrap();
    assert_eq!(store.metrics().flush_batches, 1);
    assert_eq!(store.load_message(key).unwrap().unwrap(), message("m-asap"));
    store.close().unwrap();
}

#[test]
fn pending_messages_are_visible_before_flush() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = MessageStore::open(config(&dir).with_flush_delay_ms(10_000)).unwrap();
    let queue = store.add_queue(QueueRecord { name: "q".into() }).unwrap();

    let uow = store.create_uow();
    let key = uow.store(message("m-pending"));
    uow.enqueue(entry(queue, 1, key));
    let calls = Arc::new(AtomicUsize::new(0));
    let done = completion_probe(&uow, &calls);
    uow.complete();

    // Delayed in the pipeline, but loadMessage sees it.
    assert_eq!(
        store.load_message(key).unwrap().unwrap(),
        message("m-pending")
    );

    // flush_message forces it to disk without waiting the 10s.
    let (flushed_tx, flushed_rx) = mpsc::channel();
    store
        .flush_message(key, move |result| {
            let _ = flushed_tx.send(result);
        })
        .unwrap();
    flushed_rx.recv_timeout(WAIT).unwrap().unwrap();
    done.recv_timeout(WAIT).unwrap().unwrap();

    store.close().unwrap();
}

#[test]
fn dequeue_of_flushed_entry_removes_message_when_unreferenced() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = MessageStore::open(config(&dir).with_flush_delay_ms(10)).unwrap();
    let queue = store.add_queue(QueueRecord { name: "q".into() }).unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let u1 = store.create_uow();
    let key = u1.store(message("m-consumed"));
    u1.enqueue(entry(queue, 7, key));
    let done1 = completion_probe(&u1, &calls);
    u1.complete();
    done1.recv_timeout(WAIT).unwrap().unwrap();
    assert!(store.load_message(key).unwrap().is_some());

    // The enqueue is durable now, so this dequeue cannot cancel; it is
    // applied against storage instead.
    let u2 = store.create_uow();
    u2.dequeue(entry(queue, 7, key));
    let done2 = completion_probe(&u2, &calls);
    u2.complete();
    done2.recv_timeout(WAIT).unwrap().unwrap();

    assert!(store.list_queue_entries(queue, 0, u64::MAX).unwrap().is_empty());
    assert!(store.load_message(key).unwrap().is_none());
    assert_eq!(store.metrics().enqueues_canceled, 0);
    store.close().unwrap();
}

#[test]
fn durable_state_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let queue;
    let key;
    {
        let mut store = MessageStore::open(config(&dir).with_flush_delay_ms(10)).unwrap();
        queue = store
            .add_queue(QueueRecord {
                name: "durable".into(),
            })
            .unwrap();
        let uow = store.create_uow();
        key = uow.store(message("m-durable"));
        uow.enqueue(entry(queue, 3, key));
        let calls = Arc::new(AtomicUsize::new(0));
        let done = completion_probe(&uow, &calls);
        uow.complete();
        done.recv_timeout(WAIT).unwrap().unwrap();
        store.close().unwrap();
    }

    let mut store = MessageStore::open(config(&dir)).unwrap();
    let queues = store.list_queues().unwrap();
    assert_eq!(queues.len(), 1);
    assert_eq!(queues[0].0, queue);
    assert_eq!(queues[0].1.name, "durable");
    assert_eq!(
        store.load_message(key).unwrap().unwrap(),
        message("m-durable")
    );
    let entries = store.list_queue_entries(queue, 0, u64::MAX).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].queue_seq, 3);

    // Message keys continue past the persisted high-water mark.
    let uow = store.create_uow();
    let next = uow.store(message("m-next"));
    assert!(next > key);
    drop(uow);
    store.close().unwrap();
}

#[test]
fn queue_entry_ranges_chunk_contiguous_runs() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = MessageStore::open(config(&dir).with_flush_delay_ms(10)).unwrap();
    let queue = store.add_queue(QueueRecord { name: "q".into() }).unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let uow = store.create_uow();
    for seq in 1..=7 {
        let key = uow.store(message(&format!("m-{seq}")));
        uow.enqueue(entry(queue, seq, key));
    }
    let done = completion_probe(&uow, &calls);
    uow.complete();
    done.recv_timeout(WAIT).unwrap().unwrap();

    let ranges = store.list_queue_entry_ranges(queue, 3).unwrap();
    assert_eq!(ranges.len(), 3);
    assert_eq!((ranges[0].first_seq, ranges[0].last_seq, ranges[0].count), (1, 3, 3));
    assert_eq!((ranges[1].first_seq, ranges[1].last_seq, ranges[1].count), (4, 6, 3));
    assert_eq!((ranges[2].first_seq, ranges[2].last_seq, ranges[2].count), (7, 7, 1));

    let mid = store.list_queue_entries(queue, 3, 5).unwrap();
    assert_eq!(mid.len(), 3);
    assert_eq!(mid[0].queue_seq, 3);
    assert_eq!(mid[2].queue_seq, 5);
    store.close().unwrap();
}

#[test]
fn remove_queue_drops_entries_and_unreferenced_messages() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = MessageStore::open(config(&dir).with_flush_delay_ms(10)).unwrap();
    let queue = store.add_queue(QueueRecord { name: "gone".into() }).unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let uow = store.create_uow();
    let key = uow.store(message("m-orphaned"));
    uow.enqueue(entry(queue, 1, key));
    let done = completion_probe(&uow, &calls);
    uow.complete();
    done.recv_timeout(WAIT).unwrap().unwrap();

    assert!(store.remove_queue(queue).unwrap());
    assert!(!store.remove_queue(queue).unwrap());
    assert!(store.list_queues().unwrap().is_empty());
    assert!(store.load_message(key).unwrap().is_none());
    store.close().unwrap();
}

#[test]
fn purge_empties_the_store_but_keeps_counters() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = MessageStore::open(config(&dir).with_flush_delay_ms(10)).unwrap();
    let queue = store.add_queue(QueueRecord { name: "q".into() }).unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let uow = store.create_uow();
    let key = uow.store(message("m-purged"));
    uow.enqueue(entry(queue, 1, key));
    let done = completion_probe(&uow, &calls);
    uow.complete();
    done.recv_timeout(WAIT).unwrap().unwrap();

    store.purge().unwrap();
    assert!(store.list_queues().unwrap().is_empty());
    assert!(store.load_message(key).unwrap().is_none());

    // Key assignment continues monotonically after the purge.
    let uow = store.create_uow();
    let next = uow.store(message("m-after"));
    assert!(next > key);
    drop(uow);
    store.close().unwrap();
}

#[test]
fn net_queue_state_matches_submitted_sequence() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = MessageStore::open(config(&dir).with_flush_delay_ms(10)).unwrap();
    let queue = store.add_queue(QueueRecord { name: "q".into() }).unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let mut waiters = Vec::new();
    let mut keys = Vec::new();
    for seq in 1..=4u64 {
        let uow = store.create_uow();
        let key = uow.store(message(&format!("m-{seq}")));
        uow.enqueue(entry(queue, seq, key));
        waiters.push(completion_probe(&uow, &calls));
        keys.push(key);
        uow.complete();
    }
    for waiter in &waiters {
        waiter.recv_timeout(WAIT).unwrap().unwrap();
    }

    let dequeuer = store.create_uow();
    dequeuer.dequeue(entry(queue, 2, keys[1]));
    dequeuer.dequeue(entry(queue, 4, keys[3]));
    let done = completion_probe(&dequeuer, &calls);
    dequeuer.complete();
    done.recv_timeout(WAIT).unwrap().unwrap();

    let remaining: Vec<u64> = store
        .list_queue_entries(queue, 0, u64::MAX)
        .unwrap()
        .iter()
        .map(|e| e.queue_seq)
        .collect();
    assert_eq!(remaining, vec![1, 3]);
    assert_eq!(calls.load(Ordering::SeqCst), 5);
    store.close().unwrap();
}
