//! Concurrent failures sharing a root cause converge on one fix task.

use std::sync::{Arc, Barrier};
use std::thread;

use relay::core::task::{TaskFilter, TaskStatus, TaskUpdate};
use relay::core::types::FailureAction;
use relay::dedup::{FailureInput, handle_failure};
use relay::io::task_store::TaskStore;
use relay::test_support::{TestCache, task_record};

const WORKERS: usize = 6;

fn seed(cache: &TestCache, id: &str) {
    let mut task = task_record(id);
    task.metadata.template = Some("checkout-flow".to_string());
    task.metadata.bump_attempts("test");
    cache.put(task);
}

#[test]
fn parallel_workers_hitting_one_root_cause_create_one_fix_task() {
    let cache = Arc::new(TestCache::new());
    let ids: Vec<String> = (0..WORKERS).map(|i| format!("bd-{i}")).collect();
    for id in &ids {
        seed(&cache, id);
    }

    let barrier = Arc::new(Barrier::new(WORKERS));
    let handles: Vec<_> = ids
        .iter()
        .enumerate()
        .map(|(i, id)| {
            let cache = Arc::clone(&cache);
            let barrier = Arc::clone(&barrier);
            let id = id.clone();
            thread::spawn(move || {
                // Same failure, different pid and address in each worker's output.
                let message = format!("worker pid {} crashed: segfault at 0x7ffd{i:04x}", 4000 + i);
                barrier.wait();
                handle_failure(
                    &cache.store,
                    &FailureInput {
                        task_id: &id,
                        stage: "test",
                        error_class: "signal:11",
                        message: &message,
                        retry_budget: 3,
                    },
                )
                .expect("handle failure")
            })
        })
        .collect();
    let outcomes: Vec<_> = handles
        .into_iter()
        .map(|h| h.join().expect("worker thread"))
        .collect();

    let created = outcomes
        .iter()
        .filter(|o| o.action == FailureAction::CreatedFixTask)
        .count();
    assert_eq!(created, 1);
    let fix_ids: Vec<_> = outcomes.iter().filter_map(|o| o.fix_task_id.clone()).collect();
    assert_eq!(fix_ids.len(), WORKERS);
    assert!(fix_ids.iter().all(|id| id == &fix_ids[0]));

    let fixes = cache.store.list(&TaskFilter::open_fix_tasks()).expect("list");
    assert_eq!(fixes.len(), 1);
    for id in &ids {
        assert_eq!(cache.task(id).blocked_by, vec![fix_ids[0].clone()]);
    }
}

#[test]
fn closed_fix_task_allows_a_new_one() {
    let cache = TestCache::new();
    seed(&cache, "bd-1");
    let input = FailureInput {
        task_id: "bd-1",
        stage: "test",
        error_class: "exit:1",
        message: "expected 200, got 500",
        retry_budget: 5,
    };

    let first = handle_failure(&cache.store, &input).expect("first");
    let fix_id = first.fix_task_id.expect("fix id");
    cache
        .store
        .update(&fix_id, &TaskUpdate::status(TaskStatus::Closed, "fixed"))
        .expect("close fix");

    let second = handle_failure(&cache.store, &input).expect("second");
    assert_eq!(second.action, FailureAction::CreatedFixTask);
    assert_ne!(second.fix_task_id.as_deref(), Some(fix_id.as_str()));
    assert_eq!(first.fingerprint, second.fingerprint);
}

#[test]
fn different_stages_do_not_share_fix_tasks() {
    let cache = TestCache::new();
    seed(&cache, "bd-1");
    let mut task = cache.task("bd-1");
    task.metadata.bump_attempts("lint");
    cache.put(task);

    let fail = |stage| {
        handle_failure(
            &cache.store,
            &FailureInput {
                task_id: "bd-1",
                stage,
                error_class: "exit:1",
                message: "boom",
                retry_budget: 3,
            },
        )
        .expect("handle")
    };
    let test = fail("test");
    let lint = fail("lint");
    assert_ne!(test.fingerprint, lint.fingerprint);
    assert_eq!(lint.action, FailureAction::CreatedFixTask);
    assert_eq!(cache.store.list(&TaskFilter::open_fix_tasks()).expect("list").len(), 2);
}
