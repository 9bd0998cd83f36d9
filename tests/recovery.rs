mod common;

use std::collections::HashSet;
use std::time::Duration;

use bson::doc;

use common::{wait_until, Context, DOC_TYPE, INDEX, NS};
use mongo_river::RiverState;

fn assert_applied_once(context: &Context) {
    let applied = context.applied_optimes();
    let unique: HashSet<_> = applied.iter().cloned().collect();
    assert_eq!(unique.len(), applied.len(), "operations re-applied: {:?}", applied);
}

#[test]
fn test_failover_resumes_without_reemission() {
    let context = Context::with_conf(|conf| conf.recovery.max_retries = 1000);
    context.start();
    for id in 0..5 {
        context.source.insert(NS, doc! {"_id": id});
    }
    let before = context.source.update_set(NS, 4, doc! {"name": "x"});
    context.wait_checkpoint(before);

    // primary steps down, the river keeps retrying.
    context.source.set_available(false);
    assert!(context
        .supervisor
        .wait_for_state(|s| s == RiverState::Recovering, Duration::from_secs(10)));
    assert!(context.supervisor.last_error().is_some());
    for id in 5..8 {
        context.source.insert(NS, doc! {"_id": id});
    }
    let after = context.source.delete(NS, 0);
    context.source.set_available(true);

    assert!(context
        .supervisor
        .wait_for_state(|s| s == RiverState::Running, Duration::from_secs(10)));
    context.wait_checkpoint(after);
    assert_eq!(context.supervisor.state(), RiverState::Running);
    assert!(context.supervisor.last_error().is_none());
    assert_eq!(context.replicated_count(), 7);
    assert_applied_once(&context);
}

#[test]
fn test_transient_read_failures_recover() {
    let context = Context::new();
    context.start();
    context.source.insert(NS, doc! {"_id": 1});
    context.source.fail_reads(3);
    let last = context.source.insert(NS, doc! {"_id": 2});

    context.wait_checkpoint(last);
    assert!(wait_until(|| context.supervisor.state() == RiverState::Running));
    assert_eq!(context.replicated_count(), 2);
    assert_applied_once(&context);
}

#[test]
fn test_checkpoint_write_failure_redelivers_after_restart() {
    let context = Context::new();
    context.start();
    let first = context.source.insert(NS, doc! {"_id": "a", "v": 1});
    context.wait_checkpoint(first);

    // the progress save and the final save of this run both fail.
    context.index.fail_document_writes(2);
    let second = context.source.insert(NS, doc! {"_id": "b", "v": 1});
    context.wait_checkpoint(second);

    let redelivered = context
        .applied_optimes()
        .into_iter()
        .filter(|(_, optime)| *optime == second)
        .count();
    assert!(redelivered >= 2, "applied {} times", redelivered);
    assert_eq!(context.supervisor.state(), RiverState::Running);
    assert_eq!(
        context.index.document(INDEX, DOC_TYPE, "b").unwrap()["v"],
        1
    );
}

#[test]
fn test_persistent_checkpoint_failure_ends_in_error() {
    let context = Context::with_conf(|conf| conf.recovery.max_retries = 2);
    context.start();
    let first = context.source.insert(NS, doc! {"_id": "a"});
    context.wait_checkpoint(first);
    context.supervisor.stop();

    // the cursor keeps opening, but no checkpoint is ever written again.
    context.index.fail_document_writes(1_000_000);
    context.source.insert(NS, doc! {"_id": "b"});
    context.supervisor.start().unwrap();
    assert!(
        context
            .supervisor
            .wait_for_state(|s| s == RiverState::Error, Duration::from_secs(10)),
        "state {:?}",
        context.supervisor.state()
    );
    let error = context.supervisor.last_error().unwrap();
    assert!(error.contains("Checkpoint write failed"), "{}", error);
    assert_eq!(context.supervisor.checkpoint(), Some(first));
}

#[test]
fn test_restart_resumes_from_checkpoint() {
    let context = Context::new();
    context.start();
    for id in 0..3 {
        context.source.insert(NS, doc! {"_id": id});
    }
    let stopped_at = context.source.update_set(NS, 2, doc! {"v": 2});
    context.wait_checkpoint(stopped_at);
    context.supervisor.stop();
    assert_eq!(context.supervisor.state(), RiverState::Stopped);
    assert_eq!(context.supervisor.checkpoint(), Some(stopped_at));

    context.source.insert(NS, doc! {"_id": 3});
    let last = context.source.delete(NS, 0);
    context.start();
    context.wait_checkpoint(last);

    assert_eq!(context.replicated_count(), 3);
    assert!(context.index.document(INDEX, DOC_TYPE, "0").is_none());
    assert_applied_once(&context);
    // counters survive the restart.
    assert_eq!(context.supervisor.statistics().indexed, 5);
    assert_eq!(context.supervisor.statistics().deleted, 1);
}

#[test]
fn test_resume_outside_oplog_window_is_an_error() {
    let context = Context::new();
    context.start();
    let first = context.source.insert(NS, doc! {"_id": 1});
    context.wait_checkpoint(first);
    context.supervisor.stop();

    context.source.insert(NS, doc! {"_id": 2});
    let latest = context.source.insert(NS, doc! {"_id": 3});
    context.source.truncate_oplog_before(latest);

    context.supervisor.start().unwrap();
    assert!(context
        .supervisor
        .wait_for_state(|s| s == RiverState::Error, Duration::from_secs(10)));
    let error = context.supervisor.last_error().unwrap();
    assert!(error.contains("older than the earliest oplog entry"), "{}", error);
    let status = context.checkpoint_document().unwrap();
    assert_eq!(status["status"], "error");
    assert!(status.contains_key("error"));
}

#[test]
fn test_checkpoint_never_moves_backwards() {
    let context = Context::with_conf(|conf| {
        conf.pipeline.consumers = 4;
        conf.pipeline.bulk_size = 2;
    });
    context.start();
    let mut last = None;
    for id in 0..30 {
        last = Some(context.source.insert(NS, doc! {"_id": id}));
    }
    let last = last.unwrap();

    let mut seen = Vec::new();
    assert!(wait_until(|| {
        if let Some(checkpoint) = context.supervisor.checkpoint() {
            seen.push(checkpoint);
        }
        context.supervisor.checkpoint().map_or(false, |c| c >= last)
    }));
    assert!(seen.windows(2).all(|w| w[0] <= w[1]), "{:?}", seen);
    assert_eq!(context.replicated_count(), 30);
}
