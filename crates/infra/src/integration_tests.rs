//! Integration tests for the queue pipeline.
//!
//! Tests: producer → DbBackedQueue → QueueService → handler → history
//!
//! Verifies:
//! - A row is claimed by exactly one node
//! - Failures are re-armed with backoff until the retry ceiling
//! - Orphans are reaped atomically into history plus a fresh row
//! - Partition order and effective dates are respected

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::{Arc, Barrier, Mutex};
    use std::thread;
    use std::time::Duration;

    use proptest::prelude::*;
    use serde::{Deserialize, Serialize};

    use dbq_core::{
        Clock, ManualClock, OwnerId, PersistentQueueConfig, PollingMode, ProcessingState,
        QueueEntry, RetryPolicy,
    };
    use dbq_events::{CompletionLatch, HandlerError, HandlerRegistry, QueueEvent, handler_fn};

    use crate::bus::PersistentBus;
    use crate::queue::DbBackedQueue;
    use crate::reaper::Reaper;
    use crate::service::{QueueContext, QueueService};
    use crate::store::{
        EntryStore, EntryTransaction, InMemoryEntryStore, StoreError, StoreOperation, StoreResult,
    };

    type MemQueue = DbBackedQueue<Arc<InMemoryEntryStore>>;

    const ACTIVE: &str = "bus_events";
    const HISTORY: &str = "bus_events_history";
    const QUEUE: &str = "orders";

    fn init_tracing() {
        dbq_observability::init_for_tests();
    }

    fn owner(name: &str) -> OwnerId {
        OwnerId::new(name).unwrap()
    }

    fn config(mode: PollingMode) -> PersistentQueueConfig {
        PersistentQueueConfig::default()
            .with_queue_name(QUEUE)
            .with_mode(mode)
            .with_claim_time(Duration::from_secs(60))
            .with_polling_sleep_time(Duration::from_millis(10))
            .with_reaping(Duration::from_secs(120), Duration::from_millis(20))
            .with_retry_policy(RetryPolicy::fixed(Duration::from_secs(5)))
    }

    fn engine(
        store: &Arc<InMemoryEntryStore>,
        config: PersistentQueueConfig,
        node: &str,
        clock: &ManualClock,
    ) -> MemQueue {
        DbBackedQueue::new(store.clone(), config, owner(node), Arc::new(clock.clone())).unwrap()
    }

    fn entry(queue: &MemQueue, partition: i64) -> QueueEntry {
        QueueEntry::new(
            QUEUE,
            "OrderPlaced",
            format!("{{\"partition\":{partition}}}"),
            queue.owner().clone(),
            queue.clock().now(),
        )
        .with_search_keys(Some(partition), None)
    }

    fn service_with(queue: MemQueue, registry: HandlerRegistry) -> QueueService<Arc<InMemoryEntryStore>> {
        QueueService::new(QueueContext::new(queue, Arc::new(registry)))
    }

    fn failing_registry() -> HandlerRegistry {
        let registry = HandlerRegistry::new();
        registry
            .register(QUEUE, handler_fn(|_, _| Err(HandlerError::failed("downstream unavailable"))))
            .unwrap();
        registry
    }

    // ----- scenario A: claim exclusivity -----

    #[test]
    fn concurrent_pollers_claim_a_row_exactly_once() {
        init_tracing();
        let store = InMemoryEntryStore::arc();
        let clock = ManualClock::starting_now();
        let producer = engine(&store, config(PollingMode::Polling), "producer", &clock);
        producer.insert_entry(&entry(&producer, 1)).unwrap();

        let workers = 8;
        let barrier = Arc::new(Barrier::new(workers));
        let joins: Vec<_> = (0..workers)
            .map(|i| {
                let queue = engine(&store, config(PollingMode::Polling), &format!("node-{i}"), &clock);
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    queue.get_ready_entries().unwrap().len()
                })
            })
            .collect();

        let claimed: usize = joins.into_iter().map(|j| j.join().unwrap()).sum();
        assert_eq!(claimed, 1);

        let rows = store.rows(ACTIVE);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].processing_state, ProcessingState::InProcessing);
        assert!(rows[0].processing_owner.is_some());
    }

    #[test]
    fn sticky_batches_do_not_overlap_between_nodes() {
        let store = InMemoryEntryStore::arc();
        let clock = ManualClock::starting_now();
        let cfg = config(PollingMode::StickyPolling).with_max_entries_claimed(3);
        let a = engine(&store, cfg.clone(), "node-a", &clock);
        let b = engine(&store, cfg, "node-b", &clock);
        for p in 0..5 {
            a.insert_entry(&entry(&a, p)).unwrap();
        }

        let first = a.get_ready_entries().unwrap();
        let second = b.get_ready_entries().unwrap();

        assert_eq!(first.len(), 3);
        assert_eq!(second.len(), 2);
        assert!(
            first
                .entries
                .iter()
                .all(|e| second.entries.iter().all(|o| o.record_id != e.record_id))
        );
    }

    #[test]
    fn sticky_poll_recovers_rows_of_a_previous_incarnation() {
        let store = InMemoryEntryStore::arc();
        let clock = ManualClock::starting_now();
        let cfg = config(PollingMode::StickyPolling);

        let before_restart = engine(&store, cfg.clone(), "node-a", &clock);
        before_restart.insert_entry(&entry(&before_restart, 1)).unwrap();
        assert_eq!(before_restart.get_ready_entries().unwrap().len(), 1);
        drop(before_restart);

        let after_restart = engine(&store, cfg, "node-a", &clock);
        after_restart.initialize();
        let ready = after_restart.get_ready_entries().unwrap();
        assert_eq!(ready.len(), 1);

        // Already in flight in this process: not handed out twice.
        assert!(after_restart.get_ready_entries().unwrap().is_empty());
    }

    #[test]
    fn claim_failure_surfaces_then_next_poll_recovers() {
        let store = InMemoryEntryStore::arc();
        let clock = ManualClock::starting_now();
        let queue = engine(&store, config(PollingMode::Polling), "node-a", &clock);
        queue.insert_entry(&entry(&queue, 1)).unwrap();

        store.fail_next(StoreOperation::ClaimEntry);
        assert!(queue.get_ready_entries().is_err());
        assert_eq!(queue.get_ready_entries().unwrap().len(), 1);
    }

    // ----- scenario B: reaping -----

    #[test]
    fn expired_claim_of_another_node_is_reaped_and_redispatched() {
        init_tracing();
        let store = InMemoryEntryStore::arc();
        let clock = ManualClock::starting_now();
        let a = engine(&store, config(PollingMode::Polling), "node-a", &clock);
        let b = engine(&store, config(PollingMode::Polling), "node-b", &clock);

        let original = a.insert_entry(&entry(&a, 1)).unwrap();
        assert_eq!(a.get_ready_entries().unwrap().len(), 1);

        clock.advance(Duration::from_secs(60 + 120 + 1));
        let outcome = Reaper::reap_once(&b).unwrap();

        assert_eq!(outcome.reaped, vec![original]);
        assert_eq!(outcome.redispatched.len(), 1);

        let history = store.row(HISTORY, original).unwrap();
        assert_eq!(history.processing_state, ProcessingState::Reaped);

        let active = store.rows(ACTIVE);
        assert_eq!(active.len(), 1);
        let replacement = &active[0];
        assert_eq!(replacement.record_id, outcome.redispatched[0]);
        assert_eq!(replacement.processing_state, ProcessingState::Available);
        assert_eq!(replacement.error_count, 1);
        assert_eq!(replacement.creating_owner, owner("node-b"));
        assert!(replacement.processing_owner.is_none());
        assert_eq!(replacement.event_json, history.event_json);
    }

    #[test]
    fn own_expired_claims_and_backlog_are_left_alone() {
        let store = InMemoryEntryStore::arc();
        let clock = ManualClock::starting_now();
        let cfg = config(PollingMode::Polling).with_max_entries_claimed(1);
        let a = engine(&store, cfg.clone(), "node-a", &clock);

        let stuck = a.insert_entry(&entry(&a, 1)).unwrap();
        assert_eq!(a.get_ready_entries().unwrap().len(), 1);
        let late = a.insert_entry(&entry(&a, 2)).unwrap();

        clock.advance(Duration::from_secs(600));
        let reaper = engine(&store, cfg.with_max_entries_claimed(10), "node-a", &clock);
        let outcome = Reaper::reap_once(&reaper).unwrap();

        assert_eq!(outcome.stuck, vec![stuck]);
        assert_eq!(outcome.late, vec![late]);
        assert!(outcome.reaped.is_empty());
        assert_eq!(store.len(ACTIVE), 2);
        assert_eq!(store.len(HISTORY), 0);
    }

    #[test]
    fn unclaimed_backlog_of_another_node_is_reaped() {
        let store = InMemoryEntryStore::arc();
        let clock = ManualClock::starting_now();
        let a = engine(&store, config(PollingMode::Polling), "node-a", &clock);
        let b = engine(&store, config(PollingMode::Polling), "node-b", &clock);

        let original = a.insert_entry(&entry(&a, 1)).unwrap();
        clock.advance(Duration::from_secs(121));
        let outcome = Reaper::reap_once(&b).unwrap();

        assert_eq!(outcome.reaped, vec![original]);
        let history = store.rows(HISTORY);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].record_id, original);
        assert_eq!(history[0].processing_state, ProcessingState::Reaped);

        let active = store.rows(ACTIVE);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].processing_state, ProcessingState::Available);
        assert_eq!(active[0].error_count, 1);
        assert_eq!(active[0].creating_owner, owner("node-b"));
    }

    #[test]
    fn redispatch_limit_leaves_unclaimed_entry_active() {
        let store = InMemoryEntryStore::arc();
        let clock = ManualClock::starting_now();
        let cfg = config(PollingMode::Polling).with_max_redispatch_count(2);
        let a = engine(&store, cfg.clone(), "node-a", &clock);
        let b = engine(&store, cfg, "node-b", &clock);
        a.insert_entry(&entry(&a, 1)).unwrap();

        for reaper in [&b, &a, &b, &a] {
            clock.advance(Duration::from_secs(121));
            Reaper::reap_once(reaper).unwrap();
        }

        let history = store.rows(HISTORY);
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|e| e.processing_state == ProcessingState::Reaped));

        let active = store.rows(ACTIVE);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].processing_state, ProcessingState::Available);
        assert_eq!(active[0].error_count, 2);

        // Still deliverable.
        assert_eq!(b.get_ready_entries().unwrap().len(), 1);
    }

    #[test]
    fn expired_claim_at_redispatch_limit_is_not_reaped() {
        let store = InMemoryEntryStore::arc();
        let clock = ManualClock::starting_now();
        let a = engine(&store, config(PollingMode::Polling), "node-a", &clock);
        let b = engine(
            &store,
            config(PollingMode::Polling).with_max_redispatch_count(2),
            "node-b",
            &clock,
        );

        let mut tired = entry(&a, 1);
        tired.error_count = 2;
        let id = a.insert_entry(&tired).unwrap();
        a.get_ready_entries().unwrap();

        clock.advance(Duration::from_secs(600));
        assert!(Reaper::reap_once(&b).unwrap().is_empty());
        assert_eq!(store.row(ACTIVE, id).unwrap().processing_state, ProcessingState::InProcessing);
        assert_eq!(store.len(HISTORY), 0);
    }

    #[test]
    fn own_rows_do_not_crowd_out_orphans() {
        let store = InMemoryEntryStore::arc();
        let clock = ManualClock::starting_now();
        let cfg = config(PollingMode::Polling).with_max_entries_claimed(2);
        let a = engine(&store, cfg.clone(), "node-a", &clock);
        let b = engine(&store, cfg, "node-b", &clock);

        // Lowest ids: backlog of the reaping node itself.
        for p in 0..4 {
            b.insert_entry(&entry(&b, p)).unwrap();
        }
        let orphan = a.insert_entry(&entry(&a, 9)).unwrap();

        clock.advance(Duration::from_secs(121));
        let outcome = Reaper::reap_once(&b).unwrap();

        assert_eq!(outcome.reaped, vec![orphan]);
        assert_eq!(outcome.late.len(), 2);
    }

    #[test]
    fn reap_rolls_back_when_replacement_insert_fails() {
        let store = InMemoryEntryStore::arc();
        let clock = ManualClock::starting_now();
        let a = engine(&store, config(PollingMode::Polling), "node-a", &clock);
        let b = engine(&store, config(PollingMode::Polling), "node-b", &clock);

        let id = a.insert_entry(&entry(&a, 1)).unwrap();
        a.get_ready_entries().unwrap();
        clock.advance(Duration::from_secs(600));

        store.fail_next(StoreOperation::InsertEntry);
        assert!(Reaper::reap_once(&b).is_err());

        let active = store.rows(ACTIVE);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].record_id, id);
        assert_eq!(active[0].processing_state, ProcessingState::InProcessing);
        assert_eq!(store.len(HISTORY), 0);

        // The next pass succeeds.
        assert_eq!(Reaper::reap_once(&b).unwrap().reaped, vec![id]);
    }

    /// Counts committed transactions so a test can wait for a background pass.
    struct CommitSignal {
        inner: Arc<InMemoryEntryStore>,
        commits: Arc<CompletionLatch>,
    }

    impl EntryStore for CommitSignal {
        fn in_transaction<R, F>(&self, f: F) -> StoreResult<R>
        where
            F: FnOnce(&mut dyn EntryTransaction) -> StoreResult<R>,
        {
            let result = self.inner.in_transaction(f);
            if result.is_ok() {
                self.commits.count_up();
            }
            result
        }
    }

    #[test]
    fn reaper_thread_recovers_orphans_and_stops_on_shutdown() {
        init_tracing();
        let store = InMemoryEntryStore::arc();
        let clock = ManualClock::starting_now();
        let a = engine(&store, config(PollingMode::Polling), "node-a", &clock);
        let id = a.insert_entry(&entry(&a, 1)).unwrap();
        a.get_ready_entries().unwrap();
        clock.advance(Duration::from_secs(600));

        let commits = Arc::new(CompletionLatch::new());
        let signalled = CommitSignal {
            inner: store.clone(),
            commits: commits.clone(),
        };
        let b = DbBackedQueue::new(
            signalled,
            config(PollingMode::Polling),
            owner("node-b"),
            Arc::new(clock.clone()),
        )
        .unwrap();
        let handle = Reaper::spawn(Arc::new(b));

        // One transaction per reaper pass.
        assert!(commits.wait_for(1, Duration::from_secs(5)));
        handle.shutdown();

        assert_eq!(
            store.row(HISTORY, id).map(|e| e.processing_state),
            Some(ProcessingState::Reaped)
        );
    }

    // ----- scenarios C and D: failures and the retry ceiling -----

    #[test]
    fn handler_error_rearms_with_backoff() {
        let store = InMemoryEntryStore::arc();
        let clock = ManualClock::starting_now();
        let queue = engine(&store, config(PollingMode::Polling), "node-a", &clock);
        let original = entry(&queue, 1);
        let id = queue.insert_entry(&original).unwrap();
        let svc = service_with(queue, failing_registry());

        assert_eq!(svc.process_ready_entries().unwrap(), 1);

        let row = store.row(ACTIVE, id).unwrap();
        assert_eq!(row.processing_state, ProcessingState::Available);
        assert_eq!(row.error_count, 1);
        assert!(row.processing_owner.is_none());
        assert_eq!(row.effective_date, original.effective_date + chrono::Duration::seconds(5));

        // Not eligible again until the backoff elapsed.
        assert_eq!(svc.process_ready_entries().unwrap(), 0);
        clock.advance(Duration::from_secs(5));
        assert_eq!(svc.process_ready_entries().unwrap(), 1);
        assert_eq!(store.row(ACTIVE, id).unwrap().error_count, 2);
    }

    #[test]
    fn retry_ceiling_moves_entry_to_failed_history() {
        let store = InMemoryEntryStore::arc();
        let clock = ManualClock::starting_now();
        let queue = engine(
            &store,
            config(PollingMode::StickyPolling).with_max_failure_retries(1),
            "node-a",
            &clock,
        );
        let id = queue.insert_entry(&entry(&queue, 1)).unwrap();
        let svc = service_with(queue, failing_registry());

        svc.process_ready_entries().unwrap();
        clock.advance(Duration::from_secs(5));
        svc.process_ready_entries().unwrap();

        assert_eq!(store.len(ACTIVE), 0);
        let failed = store.row(HISTORY, id).unwrap();
        assert_eq!(failed.processing_state, ProcessingState::Failed);
        assert_eq!(failed.error_count, 2);

        let stats = svc.stats();
        assert_eq!(stats.rearmed, 1);
        assert_eq!(stats.dead, 1);
    }

    #[test]
    fn moving_twice_to_history_is_harmless() {
        let store = InMemoryEntryStore::arc();
        let clock = ManualClock::starting_now();
        let queue = engine(&store, config(PollingMode::Polling), "node-a", &clock);
        queue.insert_entry(&entry(&queue, 1)).unwrap();
        let claimed = queue.get_ready_entries().unwrap().entries.remove(0);
        let processed = claimed.resolved(ProcessingState::Processed);

        assert!(queue.move_entry_to_history(&processed));
        assert!(!queue.move_entry_to_history(&processed));

        assert_eq!(store.len(ACTIVE), 0);
        assert_eq!(store.len(HISTORY), 1);
    }

    #[test]
    fn failed_history_move_leaves_entry_active() {
        let store = InMemoryEntryStore::arc();
        let clock = ManualClock::starting_now();
        let queue = engine(&store, config(PollingMode::Polling), "node-a", &clock);
        let id = queue.insert_entry(&entry(&queue, 1)).unwrap();
        let claimed = queue.get_ready_entries().unwrap().entries.remove(0);

        store.fail_next(StoreOperation::InsertHistory);
        assert!(!queue.move_entry_to_history(&claimed.resolved(ProcessingState::Processed)));

        assert!(store.row(ACTIVE, id).is_some());
        assert_eq!(store.len(HISTORY), 0);
    }

    #[test]
    fn rolled_back_history_move_keeps_entry_in_flight() {
        let store = InMemoryEntryStore::arc();
        let clock = ManualClock::starting_now();
        let queue = engine(&store, config(PollingMode::StickyPolling), "node-a", &clock);
        let id = queue.insert_entry(&entry(&queue, 1)).unwrap();
        let processed: Vec<_> = queue
            .get_ready_entries()
            .unwrap()
            .entries
            .iter()
            .map(|e| e.resolved(ProcessingState::Processed))
            .collect();

        let aborted: StoreResult<()> = store.in_transaction(|tx| {
            assert_eq!(queue.move_entries_to_history_from_transaction(tx, &processed)?, 1);
            assert_eq!(queue.inflight().len(), 1);
            Err(StoreError::Injected("caller aborted"))
        });
        assert!(aborted.is_err());

        // Still owned and still being dispatched here: the next poll skips it.
        assert_eq!(store.row(ACTIVE, id).unwrap().processing_state, ProcessingState::InProcessing);
        assert!(queue.get_ready_entries().unwrap().is_empty());

        assert_eq!(queue.move_entries_to_history(&processed), 1);
        assert!(queue.inflight().is_empty());
    }

    #[test]
    fn batch_insert_is_all_or_nothing() {
        let store = InMemoryEntryStore::arc();
        let clock = ManualClock::starting_now();
        let queue = engine(&store, config(PollingMode::Polling), "node-a", &clock);
        let batch: Vec<_> = (0..3).map(|p| entry(&queue, p)).collect();

        store.fail_next(StoreOperation::InsertEntry);
        assert!(queue.insert_entries(&batch).is_err());
        assert_eq!(store.len(ACTIVE), 0);

        let ids = queue.insert_entries(&batch).unwrap();
        assert_eq!(ids.len(), 3);
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    // ----- dispatch threads -----

    #[test]
    fn started_service_drains_the_queue() {
        init_tracing();
        let store = InMemoryEntryStore::arc();
        let clock = ManualClock::starting_now();
        let queue = engine(
            &store,
            config(PollingMode::Polling).with_nb_threads(2).with_max_entries_claimed(4),
            "node-a",
            &clock,
        );
        for p in 0..20 {
            queue.insert_entry(&entry(&queue, p)).unwrap();
        }

        let latch = Arc::new(CompletionLatch::new());
        let registry = HandlerRegistry::new();
        let done = latch.clone();
        registry
            .register(
                QUEUE,
                handler_fn(move |_, _| {
                    done.count_up();
                    Ok(())
                }),
            )
            .unwrap();
        let svc = service_with(queue, registry);

        let handle = svc.start();
        assert_eq!(handle.worker_names().len(), 3);
        assert!(latch.wait_for(20, Duration::from_secs(10)));
        handle.shutdown();

        assert_eq!(store.len(ACTIVE), 0);
        let history = store.rows(HISTORY);
        assert_eq!(history.len(), 20);
        assert!(history.iter().all(|e| e.processing_state == ProcessingState::Processed));
        assert!(svc.queue().inflight().is_empty());

        let stats = serde_json::to_value(svc.stats()).unwrap();
        assert_eq!(stats["succeeded"], 20);
    }

    #[test]
    fn sticky_nodes_with_several_threads_dispatch_each_entry_once() {
        init_tracing();
        let store = InMemoryEntryStore::arc();
        let clock = ManualClock::starting_now();
        let cfg = config(PollingMode::StickyPolling)
            .with_nb_threads(3)
            .with_max_entries_claimed(4);

        let producer = engine(&store, cfg.clone(), "producer", &clock);
        let batch: Vec<_> = (0..40).map(|p| entry(&producer, p)).collect();
        producer.insert_entries(&batch).unwrap();

        let latch = Arc::new(CompletionLatch::new());
        let seen: Arc<Mutex<HashMap<i64, usize>>> = Arc::new(Mutex::new(HashMap::new()));
        let services: Vec<_> = ["node-a", "node-b"]
            .into_iter()
            .map(|node| {
                let registry = HandlerRegistry::new();
                let done = latch.clone();
                let seen = seen.clone();
                registry
                    .register(
                        QUEUE,
                        handler_fn(move |_, metadata| {
                            *seen
                                .lock()
                                .unwrap()
                                .entry(metadata.record_id.value())
                                .or_default() += 1;
                            done.count_up();
                            Ok(())
                        }),
                    )
                    .unwrap();
                service_with(engine(&store, cfg.clone(), node, &clock), registry)
            })
            .collect();

        let handles: Vec<_> = services.iter().map(|svc| svc.start()).collect();
        assert!(latch.wait_for(40, Duration::from_secs(10)));
        for handle in handles {
            handle.shutdown();
        }

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 40);
        assert!(seen.values().all(|&count| count == 1));
        assert_eq!(latch.count(), 40);
        assert_eq!(store.len(ACTIVE), 0);
        assert_eq!(store.len(HISTORY), 40);
    }

    // ----- bus -----

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct PaymentCaptured {
        account: i64,
        cents: i64,
    }

    impl QueueEvent for PaymentCaptured {
        const CLASS_NAME: &'static str = "payments.PaymentCaptured";

        fn search_key1(&self) -> Option<i64> {
            Some(self.account)
        }
    }

    #[test]
    fn running_bus_delivers_posted_events() {
        init_tracing();
        let store = InMemoryEntryStore::arc();
        let clock = ManualClock::starting_now();
        let queue = engine(
            &store,
            config(PollingMode::StickyPolling).with_queue_name("payments"),
            "node-a",
            &clock,
        );
        let bus = PersistentBus::new(queue).unwrap();

        let latch = Arc::new(CompletionLatch::new());
        let done = latch.clone();
        bus.register::<PaymentCaptured, _>(move |event, metadata| {
            assert_eq!(metadata.search_key1, Some(event.account));
            done.count_up();
            Ok(())
        });

        bus.start();
        for account in 0..5 {
            bus.post(&PaymentCaptured { account, cents: 100 }).unwrap();
        }
        assert!(latch.wait_for(5, Duration::from_secs(10)));
        bus.stop();

        assert!(bus.in_processing_events().unwrap().is_empty());
        assert_eq!(store.len(HISTORY), 5);
    }

    // ----- properties -----

    fn drain_in_order(mode: PollingMode, count: usize, batch: usize) -> Vec<i64> {
        let store = InMemoryEntryStore::arc();
        let clock = ManualClock::starting_now();
        let queue = engine(
            &store,
            config(mode).with_max_entries_claimed(batch),
            "node-a",
            &clock,
        );
        for _ in 0..count {
            queue.insert_entry(&entry(&queue, 7)).unwrap();
        }

        let mut seen = Vec::new();
        loop {
            let ready = queue.get_ready_entries().unwrap();
            if ready.is_empty() {
                break;
            }
            let processed: Vec<_> = ready
                .entries
                .iter()
                .map(|e| e.resolved(ProcessingState::Processed))
                .collect();
            seen.extend(ready.entries.iter().map(|e| e.record_id.value()));
            queue.move_entries_to_history(&processed);
        }
        seen
    }

    proptest! {
        #[test]
        fn single_consumer_sees_partition_in_insertion_order(
            count in 1usize..30,
            batch in 1usize..8,
            sticky in any::<bool>(),
        ) {
            let mode = if sticky { PollingMode::StickyPolling } else { PollingMode::Polling };
            let seen = drain_in_order(mode, count, batch);

            prop_assert_eq!(seen.len(), count);
            prop_assert!(seen.windows(2).all(|w| w[0] < w[1]));
        }

        #[test]
        fn future_entry_is_held_until_its_effective_date(
            delay_secs in 1u64..86_400,
            sticky in any::<bool>(),
        ) {
            let mode = if sticky { PollingMode::StickyPolling } else { PollingMode::Polling };
            let store = InMemoryEntryStore::arc();
            let clock = ManualClock::starting_now();
            let queue = engine(&store, config(mode), "node-a", &clock);

            let due = clock.now() + chrono::Duration::seconds(delay_secs as i64);
            queue.insert_entry(&entry(&queue, 1).with_effective_date(due)).unwrap();

            prop_assert!(queue.get_ready_entries().unwrap().is_empty());
            clock.advance(Duration::from_secs(delay_secs - 1));
            prop_assert!(queue.get_ready_entries().unwrap().is_empty());
            clock.advance(Duration::from_secs(1));
            prop_assert_eq!(queue.get_ready_entries().unwrap().len(), 1);
        }
    }
}
