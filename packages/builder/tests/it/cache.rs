//! End-to-end caching behavior: hits, transitive invalidation, tampering.

use std::{
    path::PathBuf,
    sync::{Arc, atomic::Ordering},
};

use builder::{
    graph::NodeStatus,
    handler::CommandHandler,
    scheduler::{LocalExecutor, Scheduler, SchedulerConfig},
    target::{Target, TargetKind},
};
use pretty_assertions::assert_eq;

use crate::{graph_of, script_target, scripted_services, scripted_workspace, tid};

#[test_log::test(tokio::test)]
async fn second_build_is_fully_cached() {
    let (_dir, workspace) = scripted_workspace(&[("a.c", "x")]);

    // First build: the handler runs once.
    {
        let (services, invocations) = scripted_services(&workspace).await;
        let graph = Arc::new(graph_of(vec![script_target("a", &["a.c"], &[])]));
        let executor = Arc::new(LocalExecutor::new(Arc::clone(&services)));
        let scheduler = Scheduler::new(services, executor, SchedulerConfig::default());

        let report = scheduler.run(Arc::clone(&graph)).await.unwrap();
        assert!(report.success());
        assert_eq!(report.built, 1);
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
        assert_eq!(graph.node(&tid("a")).unwrap().status(), NodeStatus::Success);
        assert!(graph.node(&tid("a")).unwrap().output_hash().is_some());
    }

    // Second build, nothing changed: cached, zero handler invocations.
    {
        let (services, invocations) = scripted_services(&workspace).await;
        let graph = Arc::new(graph_of(vec![script_target("a", &["a.c"], &[])]));
        let executor = Arc::new(LocalExecutor::new(Arc::clone(&services)));
        let scheduler = Scheduler::new(services, executor, SchedulerConfig::default());

        let report = scheduler.run(Arc::clone(&graph)).await.unwrap();
        assert!(report.success());
        assert_eq!(report.cached, 1);
        assert_eq!(report.built, 0);
        assert_eq!(invocations.load(Ordering::SeqCst), 0);
        assert_eq!(graph.node(&tid("a")).unwrap().status(), NodeStatus::Cached);
    }
}

#[test_log::test(tokio::test)]
async fn changing_a_dependency_source_invalidates_dependents() {
    let (_dir, workspace) = scripted_workspace(&[("a.c", "consumer"), ("b.c", "provider v1")]);
    let targets = || {
        vec![
            script_target("b", &["b.c"], &[]),
            // a depends on b.
            script_target("a", &["a.c"], &["b"]),
        ]
    };

    let old_b_hash = {
        let (services, _) = scripted_services(&workspace).await;
        let graph = Arc::new(graph_of(targets()));
        let executor = Arc::new(LocalExecutor::new(Arc::clone(&services)));
        let report = Scheduler::new(services, executor, SchedulerConfig::default())
            .run(Arc::clone(&graph))
            .await
            .unwrap();
        assert_eq!(report.built, 2);
        graph.node(&tid("b")).unwrap().output_hash().unwrap()
    };

    // Modify b's source: b rebuilds with a new hash, and a's recorded
    // dependency hash no longer matches, so a rebuilds too.
    std::fs::write(workspace.join("b.c"), "provider v2").unwrap();
    {
        let (services, invocations) = scripted_services(&workspace).await;
        let graph = Arc::new(graph_of(targets()));
        let executor = Arc::new(LocalExecutor::new(Arc::clone(&services)));
        let report = Scheduler::new(services, executor, SchedulerConfig::default())
            .run(Arc::clone(&graph))
            .await
            .unwrap();

        assert_eq!(report.built, 2);
        assert_eq!(report.cached, 0);
        assert_eq!(invocations.load(Ordering::SeqCst), 2);

        let new_b_hash = graph.node(&tid("b")).unwrap().output_hash().unwrap();
        assert_ne!(old_b_hash, new_b_hash);
    }
}

#[test_log::test(tokio::test)]
async fn tampered_cache_is_ignored_then_rewritten() {
    let (_dir, workspace) = scripted_workspace(&[("a.c", "x")]);
    let run = |workspace: std::path::PathBuf| async move {
        let (services, invocations) = scripted_services(&workspace).await;
        let graph = Arc::new(graph_of(vec![script_target("a", &["a.c"], &[])]));
        let executor = Arc::new(LocalExecutor::new(Arc::clone(&services)));
        let report = Scheduler::new(services, executor, SchedulerConfig::default())
            .run(graph)
            .await
            .unwrap();
        (report, invocations.load(Ordering::SeqCst))
    };

    let (report, _) = run(workspace.clone()).await;
    assert_eq!(report.built, 1);

    // Flip one byte of the signed cache file.
    let cache_file = workspace.join(".builder-cache").join("cache.bin");
    let mut bytes = std::fs::read(&cache_file).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0x01;
    std::fs::write(&cache_file, &bytes).unwrap();

    // The build proceeds as if the cache were empty and rebuilds.
    let (report, invocations) = run(workspace.clone()).await;
    assert_eq!(report.built, 1);
    assert_eq!(invocations, 1);

    // The flush rewrote a valid signature: the next build hits again.
    let (report, invocations) = run(workspace.clone()).await;
    assert_eq!(report.cached, 1);
    assert_eq!(invocations, 0);
}

/// A custom-command target depends on a scripted one. Changing only the
/// dependency forces a target-level cache miss for the dependent, but its
/// own sources are unchanged, so the recorded action answers and the tool
/// does not rerun: file-level reuse independent of target-level reuse.
#[cfg(unix)]
#[test_log::test(tokio::test)]
async fn unchanged_sources_reuse_file_level_actions() {
    fn targets() -> Vec<Target> {
        let mut tool = script_target("tool", &["src.txt"], &["dep"]);
        tool.kind = TargetKind::Custom;
        tool.language = "custom".to_string();
        tool.config
            .insert("command".into(), "cp probe.txt tool.out".into());
        tool.output_hint = Some(PathBuf::from("tool.out"));
        vec![script_target("dep", &["dep.c"], &[]), tool]
    }

    let (_dir, workspace) = scripted_workspace(&[
        ("dep.c", "dep v1"),
        ("src.txt", "stable"),
        ("probe.txt", "v1"),
    ]);

    let run = |workspace: PathBuf| async move {
        let (services, _) = scripted_services(&workspace).await;
        services.handlers.register(Arc::new(CommandHandler::new("custom")));
        let graph = Arc::new(graph_of(targets()));
        let executor = Arc::new(LocalExecutor::new(Arc::clone(&services)));
        Scheduler::new(services, executor, SchedulerConfig::default())
            .run(graph)
            .await
            .unwrap()
    };

    let report = run(workspace.clone()).await;
    assert_eq!(report.built, 2);
    assert_eq!(std::fs::read(workspace.join("tool.out")).unwrap(), b"v1");

    // Change the dependency and the probe the command would copy. The
    // dependent's target cache misses (dep output hash changed) but its
    // recorded action still matches its unchanged sources.
    std::fs::write(workspace.join("dep.c"), "dep v2").unwrap();
    std::fs::write(workspace.join("probe.txt"), "v2").unwrap();

    let report = run(workspace.clone()).await;
    assert_eq!(report.built, 2);
    assert_eq!(
        std::fs::read(workspace.join("tool.out")).unwrap(),
        b"v1",
        "the command must not rerun while its inputs are unchanged",
    );

    // Changing the tool's own source changes the action inputs: real rerun.
    std::fs::write(workspace.join("src.txt"), "edited").unwrap();
    let report = run(workspace.clone()).await;
    assert!(report.success());
    assert_eq!(std::fs::read(workspace.join("tool.out")).unwrap(), b"v2");
}

#[test_log::test(tokio::test)]
async fn independent_targets_all_schedule() {
    // A graph of fully independent nodes saturates the concurrency cap and
    // completes them all.
    let files: Vec<(String, String)> = (0..12)
        .map(|i| (format!("t{i}.c"), format!("content {i}")))
        .collect();
    let file_refs: Vec<(&str, &str)> = files
        .iter()
        .map(|(name, content)| (name.as_str(), content.as_str()))
        .collect();
    let (_dir, workspace) = scripted_workspace(&file_refs);

    let (services, invocations) = scripted_services(&workspace).await;
    let targets: Vec<_> = (0..12)
        .map(|i| {
            let source = format!("t{i}.c");
            let name = format!("t{i}");
            script_target(&name, &[source.as_str()], &[])
        })
        .collect();
    let graph = Arc::new(graph_of(targets));

    let config = SchedulerConfig {
        concurrency: 4,
        ..SchedulerConfig::default()
    };
    let executor = Arc::new(LocalExecutor::new(Arc::clone(&services)));
    let report = Scheduler::new(services, executor, config)
        .run(graph)
        .await
        .unwrap();

    assert!(report.success());
    assert_eq!(report.built, 12);
    assert_eq!(invocations.load(Ordering::SeqCst), 12);
}

#[test_log::test(tokio::test)]
async fn compile_failure_propagates_to_dependents() {
    let (_dir, workspace) =
        scripted_workspace(&[("bad.c", "FAIL here"), ("mid.c", "ok"), ("top.c", "ok")]);

    let (services, invocations) = scripted_services(&workspace).await;
    let graph = Arc::new(graph_of(vec![
        script_target("bad", &["bad.c"], &[]),
        script_target("mid", &["mid.c"], &["bad"]),
        script_target("top", &["top.c"], &["mid"]),
    ]));
    let executor = Arc::new(LocalExecutor::new(Arc::clone(&services)));
    let report = Scheduler::new(services, executor, SchedulerConfig::default())
        .run(Arc::clone(&graph))
        .await
        .unwrap();

    assert!(!report.success());
    assert_eq!(report.failed, vec![tid("bad")]);
    let mut propagated = report.propagated.clone();
    propagated.sort();
    assert_eq!(propagated, vec![tid("mid"), tid("top")]);
    // Compile errors never retry: one invocation for the bad target, none
    // for its dependents.
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    assert!(report.first_cause.unwrap().contains("scripted compile error"));

    assert_eq!(graph.node(&tid("mid")).unwrap().status(), NodeStatus::Failed);
    assert_eq!(graph.node(&tid("top")).unwrap().status(), NodeStatus::Failed);
}
