//! The incremental pipeline end to end: import analysis feeds the
//! dependency cache, change detection feeds the planner, and the plan
//! drives which targets rebuild.

use std::{
    path::PathBuf,
    sync::{Arc, atomic::Ordering},
};

use builder::{
    analyzer::IncludeScanner,
    incremental::{self, RebuildPlan, RebuildStrategy},
    scheduler::{BuildReport, LocalExecutor, Scheduler, SchedulerConfig},
};
use pretty_assertions::assert_eq;

use crate::{graph_of, script_target, scripted_services, scripted_workspace};

/// `main.c` includes `util.h`, which is not a declared source of any
/// target. Editing the header must rebuild exactly the target that
/// reaches it through the dependency cache.
#[test_log::test(tokio::test)]
async fn header_edits_rebuild_only_reachable_targets() {
    let (_dir, workspace) = scripted_workspace(&[
        ("main.c", "#include \"util.h\"\nbody\n"),
        ("util.h", "u1"),
        ("lone.c", "alone"),
    ]);

    let run = |workspace: PathBuf| async move {
        let (services, invocations) = scripted_services(&workspace).await;
        services
            .analyzers
            .register(Arc::new(IncludeScanner::new("script")));

        let graph = Arc::new(graph_of(vec![
            script_target("a", &["main.c"], &[]),
            script_target("b", &["lone.c"], &[]),
        ]));
        let plan = incremental::plan_for_graph(&services, &graph, RebuildStrategy::Incremental)
            .await
            .unwrap();

        let executor = Arc::new(LocalExecutor::new(Arc::clone(&services)));
        let report: BuildReport = Scheduler::new(services, executor, SchedulerConfig::default())
            .run_planned(graph, Some(plan.clone()))
            .await
            .unwrap();
        (report, plan, invocations.load(Ordering::SeqCst))
    };

    // Cold build: everything is unknown, everything is affected.
    let (report, plan, invocations) = run(workspace.clone()).await;
    assert!(plan.reusable.is_empty());
    assert_eq!(report.built, 2);
    assert_eq!(invocations, 2);

    // Nothing changed: the plan marks everything reusable, both targets
    // resolve from the build cache.
    let (report, plan, invocations) = run(workspace.clone()).await;
    assert!(plan.affected.is_empty());
    assert_eq!(report.cached, 2);
    assert_eq!(invocations, 0);

    // Edit the header. It is not a declared source, but the dependency
    // cache reaches it from main.c, so `a` rebuilds while `b` stays cached.
    std::fs::write(workspace.join("util.h"), "u2").unwrap();
    let (report, plan, invocations) = run(workspace.clone()).await;
    assert_eq!(
        plan.affected,
        std::collections::BTreeSet::from([workspace.join("main.c")]),
    );
    assert_eq!(plan.reusable.len(), 1);
    assert_eq!(report.built, 1);
    assert_eq!(report.cached, 1);
    assert_eq!(invocations, 1);

    // The fingerprint advanced: a fourth build is clean again.
    let (report, _, invocations) = run(workspace).await;
    assert_eq!(report.cached, 2);
    assert_eq!(invocations, 0);
}

/// `Minimal` only reruns directly changed sources; `Full` reruns
/// everything regardless of the change scan.
#[test_log::test(tokio::test)]
async fn strategies_bound_the_affected_set() {
    let (_dir, workspace) = scripted_workspace(&[
        ("main.c", "#include \"util.h\"\nbody\n"),
        ("util.h", "u1"),
        ("lone.c", "alone"),
    ]);

    let plan_with = |workspace: PathBuf, strategy: RebuildStrategy| async move {
        let (services, _) = scripted_services(&workspace).await;
        services
            .analyzers
            .register(Arc::new(IncludeScanner::new("script")));
        let graph = graph_of(vec![
            script_target("a", &["main.c"], &[]),
            script_target("b", &["lone.c"], &[]),
        ]);
        let plan = incremental::plan_for_graph(&services, &graph, strategy)
            .await
            .unwrap();
        // No scheduler run here, so persist the dependency cache by hand.
        services.flush_all().await.unwrap();
        plan
    };

    // Seed the dependency cache and fingerprints, then edit the header.
    let _: RebuildPlan = plan_with(workspace.clone(), RebuildStrategy::Incremental).await;
    std::fs::write(workspace.join("util.h"), "u2").unwrap();

    // The header is not a declared source: minimal sees no direct change.
    let minimal = plan_with(workspace.clone(), RebuildStrategy::Minimal).await;
    assert!(minimal.affected.is_empty());

    // Full ignores the scan entirely.
    let full = plan_with(workspace.clone(), RebuildStrategy::Full).await;
    assert!(full.reusable.is_empty());
    assert_eq!(full.affected.len(), 2);
}
