//! Work-stealing convergence between two in-process workers.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use builder::{
    cache::{ActionId, ActionKind},
    cas::FsCas,
    hash::Blake3,
    remote::{ActionRequest, Worker, WorkerConfig, WorkerId},
};
use pretty_assertions::assert_eq;

use crate::tid;

fn request(name: &str) -> ActionRequest {
    ActionRequest {
        action: ActionId {
            target: tid(name),
            kind: ActionKind::Compile,
            sub_id: name.to_string(),
            input_hash: Blake3::from_buffer(name),
        },
        language: "c".to_string(),
        command: vec!["true".to_string()],
        inputs: Vec::new(),
        env: BTreeMap::new(),
        timeout: Duration::from_secs(10),
        priority: 0,
    }
}

async fn worker(id: u64, dir: &std::path::Path) -> Worker {
    let cas = Arc::new(FsCas::open(dir.join(format!("cas-{id}"))).await.unwrap());
    Worker::new(WorkerId(id), WorkerConfig::default(), cas)
}

/// 100 independent actions land on one worker while a second sits idle.
/// Stealing in batches converges the queues to within one batch of each
/// other in a bounded number of attempts.
#[test_log::test(tokio::test)]
async fn queues_converge_under_stealing() {
    let dir = tempfile::tempdir().unwrap();
    let busy = worker(1, dir.path()).await;
    let idle = worker(2, dir.path()).await;

    for i in 0..100 {
        busy.push_local(request(&format!("a{i}")));
    }
    assert_eq!(busy.shared().queue_depth(), 100);
    assert_eq!(idle.shared().queue_depth(), 0);

    let batch = 4;
    let mut attempts = 0;
    while idle.shared().queue_depth() + batch < busy.shared().queue_depth() {
        attempts += 1;
        assert!(attempts <= 100, "stealing failed to converge");
        for action in busy.shared().try_donate(batch) {
            idle.push_local(action);
        }
    }

    let busy_depth = busy.shared().queue_depth();
    let idle_depth = idle.shared().queue_depth();
    assert_eq!(busy_depth + idle_depth, 100, "no action lost or duplicated");
    assert!(
        busy_depth.abs_diff(idle_depth) <= batch,
        "queues should balance: {busy_depth} vs {idle_depth}",
    );
}

/// A steal in progress and the victim's own pop never hand out the same
/// action, and an executing action never migrates.
#[test_log::test(tokio::test)]
async fn steal_and_pop_race_is_safe() {
    let dir = tempfile::tempdir().unwrap();
    let victim = worker(1, dir.path()).await;
    for i in 0..50 {
        victim.push_local(request(&format!("a{i}")));
    }

    // The owner pops one for execution; that action is out of the deque and
    // can no longer be donated.
    let executing = victim.pop_local().unwrap();
    let stolen = victim.shared().try_donate(64);

    let mut names: Vec<String> = stolen.iter().map(|a| a.action.sub_id.clone()).collect();
    names.push(executing.action.sub_id.clone());
    names.sort();
    let before_dedup = names.len();
    names.dedup();
    assert_eq!(names.len(), before_dedup, "an action migrated mid-execution");
}
