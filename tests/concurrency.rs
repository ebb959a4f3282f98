mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use serde_json::Map;
use sak::{RunOutcome, TaskStatus};

use support::{Echo, EchoKind, TestStore, STORAGE};

#[test]
fn concurrent_runs_execute_body_once() {
    let mut store = TestStore::init();
    let (echo, runs) = store.register_counting_echo(Some(Duration::from_millis(200)));

    let barrier = Arc::new(Barrier::new(4));
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let echo = Arc::clone(&echo);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mut task = echo.task(Echo::new(1, "race")).unwrap();
                barrier.wait();
                task.run(Map::new()).unwrap()
            })
        })
        .collect();
    let outcomes: Vec<RunOutcome> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(outcomes.iter().filter(|o| **o == RunOutcome::Ran).count(), 1);
    assert_eq!(outcomes.iter().filter(|o| **o == RunOutcome::Cached).count(), 3);
}

#[test]
fn separate_storage_handles_share_the_task_lock() {
    let mut store = TestStore::init();
    let runs = Arc::new(AtomicUsize::new(0));
    let delay = Some(Duration::from_millis(200));
    let first = store
        .context_mut()
        .register_namespace(STORAGE, EchoKind::counting(Arc::clone(&runs), delay))
        .unwrap();

    let mut other = store.reopen();
    let second = other
        .register_namespace(STORAGE, EchoKind::counting(Arc::clone(&runs), delay))
        .unwrap();

    let a = thread::spawn(move || first.task(Echo::new(2, "x")).unwrap().run(Map::new()).unwrap());
    let b = thread::spawn(move || second.task(Echo::new(2, "x")).unwrap().run(Map::new()).unwrap());
    a.join().unwrap();
    b.join().unwrap();

    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[test]
fn distinct_tasks_run_in_parallel_with_separate_logs() {
    let mut store = TestStore::init();
    let (echo, runs) = store.register_echo();

    let handles: Vec<_> = (0..4)
        .map(|a| {
            let echo = Arc::clone(&echo);
            thread::spawn(move || {
                let mut task = echo.task(Echo::new(a, "p")).unwrap();
                task.run(Map::new()).unwrap();
                task
            })
        })
        .collect();

    for handle in handles {
        let task = handle.join().unwrap();
        assert_eq!(task.status(), TaskStatus::Success);
        let log = task.record().log_text.clone().unwrap();
        let a = task.params().a;
        assert!(log.contains(&format!("echo {a} p")));
        for other in (0..4).filter(|other| *other != a) {
            assert!(!log.contains(&format!("echo {other} p")));
        }
    }
    assert_eq!(runs.load(Ordering::SeqCst), 4);

    let report = store.context().sync(STORAGE).unwrap();
    assert_eq!(report.unhealed, 0);
    assert_eq!(echo.count_tasks().unwrap(), 4);
}

#[test]
fn concurrent_syncs_are_serialized() {
    let mut store = TestStore::init();
    store.register_echo();
    for a in 0..8 {
        store.write_log_key("echo", &Echo::new(a, "s"));
    }

    let storage = store.storage();
    let namespaces = store.context().namespaces_of(STORAGE);
    let handles: Vec<_> = (0..2)
        .map(|_| {
            let storage = Arc::clone(&storage);
            let namespaces = namespaces.clone();
            thread::spawn(move || storage.sync(&namespaces).unwrap())
        })
        .collect();
    let total: usize = handles
        .into_iter()
        .map(|h| h.join().unwrap().changed)
        .sum();

    // whichever sync ran second started from the first one's cursor
    assert_eq!(total, 8);
}
