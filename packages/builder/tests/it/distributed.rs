//! Distributed execution end to end: scheduler -> coordinator -> worker.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use builder::{
    remote::{
        Coordinator, CoordinatorConfig, DistributedExecutor, ResultRouter, Worker, WorkerConfig,
        WorkerId, worker::LocalWorkSource,
    },
    scheduler::{Scheduler, SchedulerConfig},
    target::TargetKind,
};
use pretty_assertions::assert_eq;

use crate::{graph_of, script_target, scripted_services, scripted_workspace};

/// One target whose command copies its staged source to an output. The
/// action flows through the coordinator queue to a pulled worker; outputs
/// come back through the CAS into the workspace.
#[cfg(unix)]
#[test_log::test(tokio::test)]
async fn action_round_trips_through_a_worker() {
    let (_dir, workspace) = scripted_workspace(&[("main.c", "int main;")]);
    let (services, _) = scripted_services(&workspace).await;

    let (coordinator, results) = Coordinator::new(CoordinatorConfig::default());
    let coordinator = Arc::new(coordinator);
    let router = ResultRouter::spawn(results);

    // One worker pulling in-process, sharing the services CAS.
    let worker_id = coordinator.register(
        builder::remote::Registration {
            capabilities: vec!["c".to_string()],
            max_concurrent: 1,
        },
        "127.0.0.1:0".to_string(),
    );
    let scratch = workspace.join("worker-scratch");
    let worker = Worker::new(
        worker_id,
        WorkerConfig {
            capabilities: vec!["c".to_string()],
            scratch_root: scratch,
            ..WorkerConfig::default()
        },
        Arc::new(
            builder::cas::FsCas::open(services.layout.cas())
                .await
                .unwrap(),
        ),
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    let worker_task = tokio::spawn(worker.run(
        LocalWorkSource(Arc::clone(&coordinator)),
        Arc::clone(&shutdown),
    ));

    // The target's command runs in the worker's scratch workdir against
    // staged inputs; `cp` produces a new file, which becomes the output.
    let mut target = script_target("remote", &["main.c"], &[]);
    target.kind = TargetKind::Custom;
    target.language = "c".to_string();
    target
        .config
        .insert("command".to_string(), "cp main.c main.o".to_string());

    let graph = Arc::new(graph_of(vec![target]));
    let executor = Arc::new(DistributedExecutor::new(
        Arc::clone(&services),
        Arc::clone(&coordinator),
        router,
    ));
    let report = Scheduler::new(Arc::clone(&services), executor, SchedulerConfig::default())
        .run(graph)
        .await
        .unwrap();

    shutdown.store(true, Ordering::Release);
    let _ = worker_task.await;

    assert!(report.success(), "first cause: {:?}", report.first_cause);
    assert_eq!(report.built, 1);

    // The worker's output was materialized back into the workspace and the
    // bytes round-tripped through the CAS.
    let copied = std::fs::read(workspace.join("main.o")).unwrap();
    assert_eq!(copied, b"int main;");
}
