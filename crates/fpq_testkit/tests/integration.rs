//! End-to-end tests for the persistent queue: ordering, transactions,
//! recovery from disk and journal housekeeping.

use bytes::Bytes;
use fpq_core::journal::RECORD_HEADER_SIZE;
use fpq_core::{Config, ContextMode, PersistentQueue, QueueError, SegmentStatus};
use fpq_testkit::prelude::*;
use proptest::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;

fn payloads_of(ctx_entries: &[fpq_core::Entry]) -> Vec<Bytes> {
    ctx_entries.iter().map(|e| e.payload().clone()).collect()
}

#[test]
fn fifo_across_transactions() {
    init_test_logging();
    let queue = TestQueue::new();
    push_committed(&queue, ["one", "two"]);
    push_committed(&queue, ["three"]);

    assert_eq!(pop_committed(&queue, 1), vec!["one"]);
    assert_eq!(pop_committed(&queue, 10), vec!["two", "three"]);
    assert!(queue.is_empty());
}

#[test]
fn three_push_transactions_pop_in_order() {
    init_test_logging();
    let queue = TestQueue::new();
    // ten-byte payloads
    let payloads = numbered_payloads("ev-0", 250);
    assert_eq!(payloads[0].len(), 10);
    push_committed(&queue, payloads[..100].iter().cloned());
    push_committed(&queue, payloads[100..200].iter().cloned());
    push_committed(&queue, payloads[200..].iter().cloned());
    assert_eq!(queue.len(), 250);

    let mut popped = Vec::new();
    for expected in [100, 100, 50] {
        let batch = pop_committed(&queue, 100);
        assert_eq!(batch.len(), expected);
        popped.extend(batch);
    }
    assert_eq!(popped, payloads);
    assert!(pop_committed(&queue, 100).is_empty());

    let stats = queue.stats();
    assert_eq!(stats.push_commits, 3);
    assert_eq!(stats.entries_pushed, 250);
    assert_eq!(stats.entries_popped, 250);
}

#[test]
fn push_commit_counts_against_current_journal() {
    let queue = TestQueue::new();
    let before = queue.current_journal().entries_unconsumed;
    push_committed(&queue, numbered_payloads("j", 7));

    let current = queue.current_journal();
    assert_eq!(current.entries_unconsumed, before + 7);
    assert_eq!(current.entries_written, 7);
    assert!(!queue.is_empty());

    pop_committed(&queue, 3);
    assert_eq!(queue.current_journal().entries_unconsumed, 4);
}

#[test]
fn rolled_journals_are_deleted_once_drained() {
    init_test_logging();
    let queue = TestQueue::small();
    let payloads = numbered_payloads("e", 1_000);
    push_in_batches(&queue, &payloads, 20);
    assert!(queue.journals_created() > 1);

    // offloaded segments may be overtaken while they reload; nothing is
    // lost or duplicated
    let mut drained = drain_committed(&queue, 50);
    drained.sort();
    assert_eq!(drained, payloads);

    let created = queue.journals_created();
    assert!(wait_for(|| queue.journals_removed() == created - 1));
    let files = queue.journal_files();
    assert_eq!(files.len(), 1);
    assert!(files[0].is_current());
}

#[test]
fn sequence_ids_continue_after_drained_journals_are_deleted() {
    init_test_logging();
    let queue = TestQueue::with_config(|c| c.max_journal_file_size_bytes(40));
    let payloads = numbered_payloads("ev-0", 3);
    push_committed(&queue, payloads.iter().cloned());

    let mut ctx = queue.create_context();
    let last = queue.pop(&mut ctx, 3).unwrap()[2].sequence_id();
    queue.commit(&mut ctx).unwrap();
    assert!(wait_for(|| queue.journals_removed() >= 1));

    let queue = queue.reopen();
    push_committed(&queue, ["after-restart"]);
    let first = queue.pop(&mut ctx, 1).unwrap()[0].sequence_id();
    assert!(first > last, "{first} was handed out again after {last}");
    queue.commit(&mut ctx).unwrap();
}

#[test]
fn failed_push_commit_keeps_payloads_for_retry() {
    init_test_logging();
    let switch = CrashSwitch::new();
    let queue = TestQueue::with_backends(|c| c, CrashableFactory::new(Arc::clone(&switch)));

    let mut ctx = queue.create_context();
    queue.push(&mut ctx, ["a", "b", "c"]).unwrap();
    switch.reset();
    switch.crash_after(0);

    let err = queue.commit(&mut ctx).unwrap_err();
    assert!(err.is_journal_io());
    assert_eq!(ctx.mode(), ContextMode::Pushing);
    assert_eq!(ctx.pending().to_vec(), vec!["a", "b", "c"]);
    assert!(queue.is_empty());
    assert_eq!(queue.current_journal().entries_written, 0);

    switch.reset();
    queue.commit(&mut ctx).unwrap();
    assert_eq!(ctx.mode(), ContextMode::Idle);

    let popped = queue.pop(&mut ctx, 10).unwrap();
    assert_eq!(payloads_of(popped), vec!["a", "b", "c"]);
    let seqs: Vec<u64> = popped.iter().map(|e| e.sequence_id().as_u64()).collect();
    assert_eq!(seqs, vec![1, 2, 3]);
    queue.commit(&mut ctx).unwrap();
}

#[test]
fn failed_pop_commit_reverts_acks_and_requeues_in_order() {
    init_test_logging();
    let switch = CrashSwitch::new();
    let queue = TestQueue::with_backends(
        |c| c.max_journal_file_size_bytes(30),
        CrashableFactory::new(Arc::clone(&switch)),
    );
    // one journal file per commit
    push_committed(&queue, ["a", "b", "c"]);
    push_committed(&queue, ["d", "e", "f"]);
    assert!(queue.journal_files().len() >= 3);

    let mut ctx = queue.create_context();
    while ctx.len() < 6 {
        let want = 6 - ctx.len();
        queue.pop(&mut ctx, want).unwrap();
    }
    assert!(queue.is_empty());

    // the first file's acks land, the second file's are cut short
    switch.reset();
    switch.crash_after(3 * RECORD_HEADER_SIZE + 5);
    let err = queue.commit(&mut ctx).unwrap_err();
    assert!(err.is_journal_io());
    assert!(switch.has_crashed());
    assert_eq!(ctx.mode(), ContextMode::Idle);
    assert!(ctx.is_empty());

    switch.reset();
    assert_eq!(queue.len(), 6);
    assert_eq!(queue.journal_files()[0].entries_unconsumed, 3);
    let mut requeued = Vec::new();
    while requeued.len() < 6 {
        let want = 6 - ctx.len();
        requeued = payloads_of(queue.pop(&mut ctx, want).unwrap());
    }
    assert_eq!(requeued, vec!["a", "b", "c", "d", "e", "f"]);
    queue.rollback(&mut ctx);
    assert_eq!(queue.journals_removed(), 0);

    // nothing was acknowledged on disk either
    let queue = queue.reopen();
    assert_eq!(
        drain_committed(&queue, 10),
        vec!["a", "b", "c", "d", "e", "f"]
    );
}

#[test]
fn segments_never_exceed_their_budget() {
    let queue = TestQueue::small();
    push_in_batches(&queue, &numbered_payloads("b", 400), 20);

    let segments = queue.segments();
    assert!(segments.len() > 1);
    for segment in &segments {
        assert!(segment.bytes_used <= segment.max_bytes, "{segment:?}");
    }
    // only the newest segment may still accept pushes
    let open: Vec<_> = segments.iter().filter(|s| !s.closed_for_push).collect();
    assert!(open.len() <= 1);
    if let Some(last) = open.first() {
        assert_eq!(last.id, segments[segments.len() - 1].id);
    }
}

#[test]
fn evicted_segments_are_reloaded() {
    let queue = TestQueue::small();
    let payloads = numbered_payloads("s", 600);
    push_in_batches(&queue, &payloads, 25);

    let resident: u64 = queue
        .segments()
        .iter()
        .filter(|s| s.status == SegmentStatus::Ready)
        .map(|s| s.resident)
        .sum();
    assert!(resident <= queue.config().memory_queue_max_size);
    assert!(queue.stats().segments_evicted > 0);

    let mut drained = drain_committed(&queue, 30);
    assert!(queue.stats().segments_reloaded > 0);
    drained.sort();
    assert_eq!(drained, payloads);
}

#[test]
fn concurrent_producers_and_consumers() {
    init_test_logging();
    let (queue, _dir) = TestQueue::new().into_shared();
    let config = StressConfig {
        events: 4_000,
        threads: 4,
        payload_size: 32,
        batch_size: 40,
    };
    let outcome = stress_producers_consumers(queue.clone(), &config);

    let mut ids: Vec<u64> = outcome
        .all()
        .iter()
        .map(|p| stress_payload_id(p).unwrap())
        .collect();
    assert_eq!(ids.len(), 4_000);
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 4_000);

    // each consumer sees every producer's events in push order
    let per_producer = 1_000;
    for consumer in &outcome.popped {
        let mut last: HashMap<u64, u64> = HashMap::new();
        for payload in consumer {
            let id = stress_payload_id(payload).unwrap();
            if let Some(prev) = last.insert(id / per_producer, id) {
                assert!(prev < id, "producer order broken: {prev} before {id}");
            }
        }
    }
    assert!(queue.is_empty());
}

#[test]
fn rollback_returns_entries_to_the_front() {
    let queue = TestQueue::new();
    push_committed(&queue, numbered_payloads("r", 10));

    let mut first = queue.create_context();
    let held = payloads_of(queue.pop(&mut first, 3).unwrap());
    let mut second = queue.create_context();
    let next = payloads_of(queue.pop(&mut second, 3).unwrap());
    assert_eq!(next, numbered_payloads("r", 6)[3..]);

    queue.rollback(&mut first);
    assert!(first.is_empty());
    assert_eq!(pop_committed(&queue, 3), held);

    queue.commit(&mut second).unwrap();
    assert_eq!(drain_committed(&queue, 10), numbered_payloads("r", 10)[6..]);
    assert_eq!(queue.stats().rollbacks, 1);
}

#[test]
fn oversized_requests_leave_context_unchanged() {
    let queue = TestQueue::new();
    let mut ctx = queue.create_context();
    queue.push(&mut ctx, numbered_payloads("x", 60)).unwrap();

    let err = queue.push(&mut ctx, numbered_payloads("y", 50)).unwrap_err();
    assert!(matches!(err, QueueError::TransactionSizeExceeded { .. }));
    assert_eq!(ctx.len(), 60);
    queue.commit(&mut ctx).unwrap();

    let err = queue.pop(&mut ctx, 101).unwrap_err();
    assert!(matches!(err, QueueError::TransactionSizeExceeded { .. }));
    assert!(ctx.is_empty());

    queue.pop(&mut ctx, 50).unwrap();
    let err = queue.pop(&mut ctx, 51).unwrap_err();
    assert!(matches!(err, QueueError::TransactionSizeExceeded { .. }));
    assert_eq!(ctx.len(), 50);
    queue.commit(&mut ctx).unwrap();
    assert_eq!(queue.len(), 10);
}

#[test]
fn mixing_push_and_pop_in_one_context_fails() {
    let queue = TestQueue::new();
    push_committed(&queue, ["a"]);

    let mut ctx = queue.create_context();
    queue.push_one(&mut ctx, "b").unwrap();
    assert!(matches!(
        queue.pop(&mut ctx, 1).unwrap_err(),
        QueueError::InvalidState { .. }
    ));
    queue.rollback(&mut ctx);

    queue.pop(&mut ctx, 1).unwrap();
    assert!(matches!(
        queue.push_one(&mut ctx, "c").unwrap_err(),
        QueueError::InvalidState { .. }
    ));
}

#[test]
fn reopen_recovers_unconsumed_entries() {
    let queue = TestQueue::new();
    push_committed(&queue, numbered_payloads("p", 10));
    assert_eq!(pop_committed(&queue, 4), numbered_payloads("p", 4));

    let queue = queue.reopen();
    assert_eq!(queue.len(), 6);
    assert_eq!(queue.stats().recovered_entries, 6);
    assert_eq!(drain_committed(&queue, 10), numbered_payloads("p", 10)[4..]);
}

#[test]
fn uncommitted_pops_are_redelivered_after_reopen() {
    let queue = TestQueue::new();
    push_committed(&queue, numbered_payloads("u", 5));

    let mut ctx = queue.create_context();
    assert_eq!(queue.pop(&mut ctx, 2).unwrap().len(), 2);
    drop(ctx);

    let queue = queue.reopen();
    assert_eq!(drain_committed(&queue, 10), numbered_payloads("u", 5));
}

#[test]
fn torn_journal_tail_is_dropped() {
    init_test_logging();
    let queue = TestQueue::new();
    push_committed(&queue, ["first"]);
    push_committed(&queue, ["second"]);
    push_committed(&queue, ["third"]);

    let queue = queue.reopen_after(|dir| {
        tear_last_journal(dir, 3);
    });
    assert_eq!(drain_committed(&queue, 10), vec!["first", "second"]);

    // new pushes continue after the surviving sequence numbers
    push_committed(&queue, ["fourth"]);
    let queue = queue.reopen();
    assert_eq!(drain_committed(&queue, 10), vec!["fourth"]);
}

#[test]
fn partial_header_is_ignored_on_reopen() {
    let queue = TestQueue::new();
    push_committed(&queue, ["kept"]);

    let queue = queue.reopen_after(|dir| {
        let path = journal_paths(dir).pop().unwrap();
        append_garbage(&path, &[7, 0, 0]);
    });
    assert_eq!(drain_committed(&queue, 10), vec!["kept"]);
}

#[test]
fn directory_is_locked_while_open() {
    let (queue, _dir) = TestQueue::new().into_shared();
    let config = queue.config().clone();
    let err = PersistentQueue::open(config.clone()).unwrap_err();
    assert!(matches!(err, QueueError::QueueLocked));

    queue.shutdown().unwrap();
    drop(queue);
    let reopened = PersistentQueue::open(config).unwrap();
    assert!(reopened.is_empty());
}

#[test]
fn batch_too_large_for_a_segment() {
    let queue = TestQueue::with_config(|config| config.max_segment_size_bytes(256));
    let mut ctx = queue.create_context();
    queue.push(&mut ctx, [Bytes::from(vec![0u8; 300])]).unwrap();

    let err = queue.commit(&mut ctx).unwrap_err();
    assert!(matches!(err, QueueError::BatchTooLarge { max: 256, .. }));
    assert_eq!(ctx.len(), 1);
    assert!(queue.is_empty());
}

#[test]
fn invalid_configuration_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::new(dir.path()).max_number_of_segments(2);
    assert!(matches!(
        PersistentQueue::open(config).unwrap_err(),
        QueueError::Configuration { .. }
    ));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn fifo_holds_for_any_batching(
        payloads in tagged_payloads_strategy(200),
        push_sizes in batch_sizes_strategy(50),
        pop_sizes in batch_sizes_strategy(50),
    ) {
        let queue = TestQueue::new();
        for batch in split_by_sizes(&payloads, &push_sizes) {
            push_committed(&queue, batch);
        }

        let mut popped = Vec::new();
        for size in pop_sizes.iter().cycle() {
            if queue.is_empty() {
                break;
            }
            popped.extend(pop_committed(&queue, *size));
        }
        prop_assert_eq!(popped, payloads);
    }
}
