//! Checkpoint/resume: a failed build picks up where it stopped.

use std::sync::{Arc, atomic::Ordering};

use builder::{
    checkpoint::Checkpoint,
    graph::NodeStatus,
    scheduler::{LocalExecutor, Scheduler, SchedulerConfig},
};
use pretty_assertions::assert_eq;

use crate::{graph_of, script_target, scripted_services, scripted_workspace, tid};

/// Ten targets in a chain; t6 has a compile error. The first build
/// completes t1-t5, checkpoints, and fails. After fixing t6, resume
/// restores t1-t5 without re-invoking their handler and finishes t6-t10.
#[test_log::test(tokio::test)]
async fn failed_build_resumes_after_the_fix() {
    let files: Vec<(String, String)> = (1..=10)
        .map(|i| {
            let content = if i == 6 { "FAIL".to_string() } else { format!("ok {i}") };
            (format!("t{i}.c"), content)
        })
        .collect();
    let file_refs: Vec<(&str, &str)> = files
        .iter()
        .map(|(name, content)| (name.as_str(), content.as_str()))
        .collect();
    let (_dir, workspace) = scripted_workspace(&file_refs);

    let targets = || {
        (1..=10)
            .map(|i| {
                let name = format!("t{i}");
                let source = format!("t{i}.c");
                let deps: Vec<String> = if i > 1 { vec![format!("t{}", i - 1)] } else { Vec::new() };
                let dep_refs: Vec<&str> = deps.iter().map(String::as_str).collect();
                script_target(&name, &[source.as_str()], &dep_refs)
            })
            .collect::<Vec<_>>()
    };

    let checkpoint_path = workspace.join(".builder-cache").join("checkpoint.bin");

    // First build: fails at t6; t7-t10 are never attempted.
    {
        let (services, invocations) = scripted_services(&workspace).await;
        let graph = Arc::new(graph_of(targets()));
        let config = SchedulerConfig {
            checkpoint_path: Some(checkpoint_path.clone()),
            ..SchedulerConfig::default()
        };
        let executor = Arc::new(LocalExecutor::new(Arc::clone(&services)));
        let report = Scheduler::new(Arc::clone(&services), executor, config)
            .run(Arc::clone(&graph))
            .await
            .unwrap();

        assert!(!report.success());
        assert_eq!(report.built, 5);
        assert_eq!(report.failed, vec![tid("t6")]);
        assert_eq!(report.propagated.len(), 4);
        assert_eq!(invocations.load(Ordering::SeqCst), 6);

        let checkpoint = Checkpoint::load(&checkpoint_path, &services.key).await.unwrap();
        assert_eq!(checkpoint.completed_targets, 5);
        assert_eq!(checkpoint.failed_targets, vec![tid("t6")]);
    }

    // Fix the broken source and resume.
    std::fs::write(workspace.join("t6.c"), "ok 6 fixed").unwrap();
    {
        let (services, invocations) = scripted_services(&workspace).await;
        let graph = Arc::new(graph_of(targets()));

        let checkpoint = Checkpoint::load(&checkpoint_path, &services.key).await.unwrap();
        checkpoint.validate_against(&graph).unwrap();
        let restored = checkpoint.merge_into(&graph);
        assert_eq!(restored, 5);

        let config = SchedulerConfig {
            checkpoint_path: Some(checkpoint_path.clone()),
            ..SchedulerConfig::default()
        };
        let executor = Arc::new(LocalExecutor::new(Arc::clone(&services)));
        let report = Scheduler::new(Arc::clone(&services), executor, config)
            .run(Arc::clone(&graph))
            .await
            .unwrap();

        assert!(report.success());
        // t1-t5 restored from the checkpoint, t6-t10 executed.
        assert_eq!(report.cached, 5);
        assert_eq!(report.built, 5);
        assert_eq!(invocations.load(Ordering::SeqCst), 5);
        for i in 1..=5 {
            let name = format!("t{i}");
            assert_eq!(
                graph.node(&tid(&name)).unwrap().status(),
                NodeStatus::Cached,
                "{name} must be restored, not rebuilt",
            );
        }
        for i in 6..=10 {
            let name = format!("t{i}");
            assert_eq!(graph.node(&tid(&name)).unwrap().status(), NodeStatus::Success);
        }

        // A clean full build clears the checkpoint.
        assert!(Checkpoint::load(&checkpoint_path, &services.key).await.is_none());
    }
}
