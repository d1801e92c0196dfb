// SPDX-License-Identifier: MIT OR Apache-2.0

//! Tests for the field module.

use super::*;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::Duration;

struct Job;

#[derive(Clone, Debug, PartialEq)]
struct Retries(u32);

#[derive(Clone, Debug, PartialEq)]
struct Label(&'static str);

fn tables() -> Vec<Arc<dyn FieldTable>> {
    vec![Arc::new(WeakKeyedTable::new()), Arc::new(ShardedTable::new(4))]
}

/// Stands in for a tracing collector: owners are "reachable" until collected.
#[derive(Clone, Default)]
struct FakeCollector {
    live: Arc<Mutex<HashSet<usize>>>,
    next: Arc<AtomicUsize>,
}

struct FakeOwner {
    id: usize,
    live: Arc<Mutex<HashSet<usize>>>,
}

struct FakeLiveness {
    id: usize,
    live: Arc<Mutex<HashSet<usize>>>,
}

impl FakeCollector {
    fn allocate(&self) -> FakeOwner {
        let id = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        self.live.lock().unwrap().insert(id);
        FakeOwner {
            id,
            live: self.live.clone(),
        }
    }

    fn collect(&self, owner: FakeOwner) {
        self.live.lock().unwrap().remove(&owner.id);
    }
}

impl Liveness for FakeLiveness {
    fn is_live(&self) -> bool {
        self.live.lock().unwrap().contains(&self.id)
    }
}

impl Owner for FakeOwner {
    fn owner_key(&self) -> OwnerKey {
        OwnerKey::from_raw(self.id)
    }

    fn liveness(&self) -> Box<dyn Liveness> {
        Box::new(FakeLiveness {
            id: self.id,
            live: self.live.clone(),
        })
    }
}

#[test]
fn test_get_put_remove() {
    for table in tables() {
        let field = VirtualField::<Arc<Job>, Retries>::with_table(table);
        let job = Arc::new(Job);

        assert_eq!(field.get(&job), None);
        assert!(!field.contains_key(&job));
        assert_eq!(field.put(&job, Retries(1)), None);
        assert_eq!(field.put(&job, Retries(2)), Some(Retries(1)));
        assert_eq!(field.get(&job), Some(Retries(2)));
        assert!(field.contains_key(&job));
        assert_eq!(field.len(), 1);

        assert_eq!(field.remove(&job), Some(Retries(2)));
        assert_eq!(field.get(&job), None);
        assert_eq!(field.remove(&job), None);
        assert!(field.is_empty());
    }
}

#[test]
fn test_put_if_absent_keeps_first() {
    for table in tables() {
        let field = VirtualField::<Arc<Job>, Retries>::with_table(table);
        let job = Arc::new(Job);
        assert_eq!(field.put_if_absent(&job, Retries(1)), None);
        assert_eq!(field.put_if_absent(&job, Retries(2)), Some(Retries(1)));
        assert_eq!(field.get(&job), Some(Retries(1)));
    }
}

#[test]
fn test_kinds_are_isolated() {
    let retries = VirtualField::<Arc<Job>, Retries>::find();
    let labels = VirtualField::<Arc<Job>, Label>::find();
    let job = Arc::new(Job);

    retries.put(&job, Retries(9));
    assert_eq!(labels.get(&job), None);
    assert!(!labels.contains_key(&job));
    labels.put(&job, Label("nightly"));
    assert_eq!(retries.get(&job), Some(Retries(9)));
    assert_ne!(retries.kind(), labels.kind());
}

#[test]
fn test_kinds_sharing_one_table_are_isolated() {
    for table in tables() {
        let retries = VirtualField::<Arc<Job>, Retries>::with_table(table.clone());
        let labels = VirtualField::<Arc<Job>, Label>::with_table(table);
        let job = Arc::new(Job);

        retries.put(&job, Retries(3));
        assert_eq!(labels.get(&job), None);
        assert!(!labels.contains_key(&job));
        assert!(labels.is_empty());
        assert_eq!(labels.remove(&job), None);

        assert_eq!(labels.compute_if_absent(&job, || Label("fresh")), Label("fresh"));
        assert_eq!(labels.put(&job, Label("again")), Some(Label("fresh")));
        assert_eq!(retries.get(&job), Some(Retries(3)));
        assert_eq!(retries.len(), 1);
        assert_eq!(labels.len(), 1);

        assert_eq!(retries.remove(&job), Some(Retries(3)));
        assert_eq!(labels.get(&job), Some(Label("again")));
    }
}

#[test]
fn test_find_shares_one_table() {
    struct Shared;
    let a = VirtualField::<Arc<Shared>, Retries>::find();
    let b = VirtualField::<Arc<Shared>, Retries>::find();
    let owner = Arc::new(Shared);
    a.put(&owner, Retries(4));
    assert_eq!(b.get(&owner), Some(Retries(4)));
    assert_eq!(a.kind(), b.kind());
    assert!(a.kind().value_type_name().ends_with("Retries"));
}

#[test]
fn test_compute_if_absent_runs_supplier_once() {
    const THREADS: usize = 16;
    for table in tables() {
        let field = VirtualField::<Arc<Job>, Arc<Mutex<u32>>>::with_table(table);
        let job = Arc::new(Job);
        let calls = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let field = field.clone();
                let job = job.clone();
                let calls = calls.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    field.compute_if_absent(&job, || {
                        calls.fetch_add(1, Ordering::SeqCst);
                        thread::yield_now();
                        Arc::new(Mutex::new(0))
                    })
                })
            })
            .collect();
        let values: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for value in &values {
            assert!(Arc::ptr_eq(value, &values[0]));
        }
    }
}

#[test]
fn test_failed_supplier_caches_nothing() {
    let field = VirtualField::<Arc<Job>, Retries>::with_table(Arc::new(WeakKeyedTable::new()));
    let job = Arc::new(Job);

    let err = field.try_compute_if_absent(&job, || Err::<Retries, _>("backend down"));
    assert_eq!(err, Err("backend down"));
    assert!(!field.contains_key(&job));

    let ok = field.try_compute_if_absent(&job, || Ok::<_, &str>(Retries(1)));
    assert_eq!(ok, Ok(Retries(1)));
    let again = field.try_compute_if_absent(&job, || Err::<Retries, _>("not called"));
    assert_eq!(again, Ok(Retries(1)));
}

#[test]
fn test_panicking_supplier_releases_claim() {
    let field = VirtualField::<Arc<Job>, Retries>::with_table(Arc::new(WeakKeyedTable::new()));
    let job = Arc::new(Job);

    let result = thread::scope(|s| {
        s.spawn(|| field.compute_if_absent(&job, || panic!("supplier failed")))
            .join()
    });
    assert!(result.is_err());
    assert!(!field.contains_key(&job));
    assert_eq!(field.compute_if_absent(&job, || Retries(2)), Retries(2));
}

/// Parks the second read of one owner's entry until the test lets it go.
struct GatedTable {
    inner: WeakKeyedTable,
    gated: OwnerKey,
    reads: AtomicUsize,
    parked: Mutex<Sender<()>>,
    gate: Mutex<Receiver<()>>,
}

impl FieldTable for GatedTable {
    fn get(&self, key: EntryKey) -> Option<ErasedValue> {
        if key.owner == self.gated && self.reads.fetch_add(1, Ordering::SeqCst) == 1 {
            self.parked.lock().unwrap().send(()).unwrap();
            self.gate.lock().unwrap().recv().unwrap();
        }
        self.inner.get(key)
    }

    fn put(
        &self,
        key: EntryKey,
        liveness: Box<dyn Liveness>,
        value: ErasedValue,
    ) -> Option<ErasedValue> {
        self.inner.put(key, liveness, value)
    }

    fn put_if_absent(
        &self,
        key: EntryKey,
        liveness: Box<dyn Liveness>,
        value: ErasedValue,
    ) -> Option<ErasedValue> {
        self.inner.put_if_absent(key, liveness, value)
    }

    fn remove(&self, key: EntryKey) -> Option<ErasedValue> {
        self.inner.remove(key)
    }

    fn len(&self, kind: FieldKind) -> usize {
        self.inner.len(kind)
    }

    fn reclaim(&self) -> usize {
        self.inner.reclaim()
    }
}

#[test]
fn test_slow_table_read_does_not_block_other_owners() {
    let slow = Arc::new(Job);
    let other = Arc::new(Job);
    let (parked_tx, parked_rx) = channel();
    let (gate_tx, gate_rx) = channel();
    let field = VirtualField::<Arc<Job>, Retries>::with_table(Arc::new(GatedTable {
        inner: WeakKeyedTable::new(),
        gated: slow.owner_key(),
        reads: AtomicUsize::new(0),
        parked: Mutex::new(parked_tx),
        gate: Mutex::new(gate_rx),
    }));

    let first = {
        let field = field.clone();
        let slow = slow.clone();
        thread::spawn(move || field.compute_if_absent(&slow, || Retries(1)))
    };
    // the slow owner is now claimed and stuck inside the table
    parked_rx.recv().unwrap();

    let (done_tx, done_rx) = channel();
    let second = {
        let field = field.clone();
        let other = other.clone();
        thread::spawn(move || {
            let value = field.compute_if_absent(&other, || Retries(2));
            done_tx.send(()).unwrap();
            value
        })
    };
    let finished = done_rx.recv_timeout(Duration::from_secs(5));
    gate_tx.send(()).unwrap();

    assert!(finished.is_ok(), "another owner waited on a slow table read");
    assert_eq!(second.join().unwrap(), Retries(2));
    assert_eq!(first.join().unwrap(), Retries(1));
}

#[test]
fn test_compute_sees_every_earlier_update() {
    const THREADS: usize = 8;
    let field = VirtualField::<Arc<Job>, Retries>::with_table(Arc::new(ShardedTable::new(2)));
    let job = Arc::new(Job);
    let barrier = Arc::new(Barrier::new(THREADS));
    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let field = field.clone();
            let job = job.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                field.compute(&job, |current| {
                    thread::yield_now();
                    Retries(current.map_or(1, |r| r.0 + 1))
                })
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(field.get(&job), Some(Retries(THREADS as u32)));
}

#[test]
fn test_reentrant_supplier_does_not_deadlock() {
    let field = VirtualField::<Arc<Job>, Retries>::with_table(Arc::new(WeakKeyedTable::new()));
    let job = Arc::new(Job);
    let outer = field.compute_if_absent(&job, || {
        let inner = field.compute_if_absent(&job, || Retries(1));
        Retries(inner.0 + 1)
    });
    assert_eq!(outer, Retries(2));
    assert_eq!(field.get(&job), Some(Retries(2)));
}

#[test]
fn test_dropped_arc_owner_disappears() {
    for table in tables() {
        let field = VirtualField::<Arc<Job>, Retries>::with_table(table);
        let kept = Arc::new(Job);
        let dropped = Arc::new(Job);
        field.put(&kept, Retries(1));
        field.put(&dropped, Retries(2));
        assert_eq!(field.len(), 2);

        drop(dropped);
        assert_eq!(field.len(), 1);
        assert_eq!(field.get(&kept), Some(Retries(1)));
    }
}

#[test]
fn test_collected_owner_is_reclaimed_without_remove() {
    for table in tables() {
        let collector = FakeCollector::default();
        let field = VirtualField::<FakeOwner, Retries>::with_table(table);
        let owners: Vec<_> = (0..3).map(|_| collector.allocate()).collect();
        for (n, owner) in owners.iter().enumerate() {
            field.put(owner, Retries(n as u32));
        }
        assert_eq!(field.len(), 3);

        let mut owners = owners.into_iter();
        let first = owners.next().unwrap();
        let survivors: Vec<_> = owners.collect();
        collector.collect(first);

        assert_eq!(field.reclaim(), 1);
        assert_eq!(field.len(), 2);
        assert_eq!(field.get(&survivors[0]), Some(Retries(1)));
        assert_eq!(field.reclaim(), 0);
    }
}

#[test]
fn test_collected_owner_is_invisible_before_sweep() {
    let collector = FakeCollector::default();
    let field = VirtualField::<FakeOwner, Retries>::with_table(Arc::new(WeakKeyedTable::new()));
    let owner = collector.allocate();
    field.put(&owner, Retries(1));
    let ghost = FakeOwner {
        id: owner.id,
        live: owner.live.clone(),
    };
    collector.collect(owner);
    assert_eq!(field.get(&ghost), None);
    assert_eq!(field.put_if_absent(&ghost, Retries(5)), None);
}

#[test]
fn test_reclamation_is_never_logged() {
    let _guard = crate::TEST_LOGGER_GUARD
        .lock()
        .unwrap_or_else(|e| e.into_inner());
    let logger = Arc::new(logwise::InMemoryLogger::new());
    logwise::add_global_logger(logger.clone());
    logwise::context::Context::reset("reclamation".to_string());
    logwise::context::Context::begin_trace();
    logger.drain_logs();

    let collector = FakeCollector::default();
    for table in tables() {
        let field = VirtualField::<FakeOwner, Retries>::with_table(table);
        let owner = collector.allocate();
        field.put(&owner, Retries(1));
        collector.collect(owner);
        assert_eq!(field.reclaim(), 1);
        assert!(field.is_empty());
    }
    for _ in 0..100 {
        VirtualField::<Arc<Job>, Retries>::find().put(&Arc::new(Job), Retries(0));
    }

    let logs = logger.drain_logs();
    assert!(!logs.contains("src/field/table.rs"), "{logs}");
    assert!(!logs.contains("FakeOwner"), "{logs}");
}

#[test]
fn test_writes_sweep_dead_entries() {
    let table = Arc::new(WeakKeyedTable::new());
    let field = VirtualField::<Arc<Job>, Retries>::with_table(table.clone());
    for _ in 0..200 {
        // each owner dies immediately after its write
        field.put(&Arc::new(Job), Retries(0));
    }
    // sweeps ran along the way, so the table never holds every dead entry
    assert!(table.reclaim() < 200);
    assert!(field.is_empty());
}

#[test]
fn test_default_provider_is_locked_in_after_use() {
    let _ = VirtualField::<Arc<Job>, Retries>::find();
    let err = register_field_provider(ShardedFieldProvider::default()).unwrap_err();
    let crate::error::FieldError::ProviderAlreadyInstalled { installed } = err;
    assert_eq!(installed, field_provider().name());
}
