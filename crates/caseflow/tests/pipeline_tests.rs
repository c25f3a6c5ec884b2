//! End-to-end pipeline runs against a file-backed store.

mod common;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use caseflow::{BatchRequest, JobError, JobOptions, JobStatus, RecoveryPolicy, StageKind};
use common::{Behaviour, ScriptedStage, TestHarness};

fn artifact_names(harness: &TestHarness, job_id: &str) -> Vec<String> {
    harness
        .reader()
        .get_job_status(job_id)
        .unwrap()
        .artifacts
        .into_iter()
        .map(|a| a.name)
        .collect()
}

#[test]
fn test_batch_completes_with_all_artifacts() {
    let harness = TestHarness::new();
    let stages = ScriptedStage::all_succeed();
    let runner = harness.runner("w1", &stages);

    let id = harness.enqueue();
    assert_eq!(runner.run_job(&id).unwrap(), JobStatus::Completed);

    let view = harness.reader().get_job_status(&id).unwrap();
    assert_eq!(view.status, JobStatus::Completed);
    assert_eq!(view.progress, 100.0);
    assert!(view.error.is_none());
    assert_eq!(
        artifact_names(&harness, &id),
        vec!["transcribe", "diarize", "extract_entities", "detect_discrepancies"]
    );
    for artifact in &view.artifacts {
        let location = std::path::Path::new(&artifact.location);
        assert!(location.is_file(), "missing {}", artifact.location);
        assert!(location.starts_with(harness.artifact_root.join(&id)));
    }
    assert!(view
        .log
        .last()
        .unwrap()
        .message
        .contains("Job completed with 4 artifact(s)"));
    assert!(stages.iter().all(|s| s.runs() == 1));
}

#[test]
fn test_single_upload_through_dispatcher() {
    let harness = TestHarness::new();
    let request = BatchRequest::new(
        "C1",
        "U1",
        vec!["u1".to_string()],
        vec![PathBuf::from("/in/a.mp4")],
        JobOptions::default(),
    );
    let id = harness.queue().enqueue_batch(&request).unwrap();

    let queued = harness.reader().get_job_status(&id).unwrap();
    assert_eq!(queued.status, JobStatus::Queued);
    assert_eq!(queued.progress, 0.0);
    assert!(queued.artifacts.is_empty());

    let mut dispatcher = harness.dispatcher(
        harness.runner("d1", &ScriptedStage::all_succeed()),
        RecoveryPolicy::Resume,
    );
    dispatcher.start().unwrap();
    harness.wait_for(&id, Duration::from_secs(10), |job| job.is_finished());
    dispatcher.shutdown();
    dispatcher.wait();

    let done = harness.reader().get_job_status(&id).unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.progress, 100.0);
    assert!(!done.artifacts.is_empty());
    assert!(done.created_at <= done.updated_at);
}

#[test]
fn test_third_stage_failure_keeps_earlier_artifacts() {
    let harness = TestHarness::new();
    let mut events = harness.broadcaster.subscribe();
    let stages = ScriptedStage::pipeline([
        Behaviour::Succeed,
        Behaviour::Succeed,
        Behaviour::FailAfterProgress(0.8),
        Behaviour::Succeed,
    ]);
    let runner = harness.runner("w1", &stages);

    let id = harness.enqueue();
    assert_eq!(runner.run_job(&id).unwrap(), JobStatus::Failed);

    // The report reached subscribers but never the stored progress.
    let mut estimates = Vec::new();
    while let Ok(event) = events.try_recv() {
        assert!(event.progress <= 50.0);
        estimates.extend(event.estimated_progress);
    }
    assert!(estimates.contains(&70.0), "{:?}", estimates);

    let view = harness.reader().get_job_status(&id).unwrap();
    assert_eq!(view.status, JobStatus::Failed);
    assert_eq!(view.progress, 50.0);
    assert_eq!(artifact_names(&harness, &id), vec!["transcribe", "diarize"]);

    let error = view.error.unwrap();
    assert!(error.contains("extract_entities"), "{}", error);
    assert!(error.contains("after 2 attempt(s)"), "{}", error);

    assert_eq!(stages[2].runs(), 2);
    assert_eq!(stages[3].runs(), 0);
    assert!(view
        .log
        .iter()
        .any(|e| e.message.contains("attempt 1/2 failed")));
}

#[test]
fn test_disabled_stages_are_skipped_but_credited() {
    let harness = TestHarness::new();
    let stages = ScriptedStage::all_succeed();
    let runner = harness.runner("w1", &stages);

    let id = harness.enqueue_with(JobOptions {
        auto_transcribe: false,
        diarize: false,
        language_hint: Some("en".to_string()),
    });
    assert_eq!(runner.run_job(&id).unwrap(), JobStatus::Completed);

    let view = harness.reader().get_job_status(&id).unwrap();
    assert_eq!(view.progress, 100.0);
    assert_eq!(
        artifact_names(&harness, &id),
        vec!["extract_entities", "detect_discrepancies"]
    );
    assert_eq!(stages[0].runs(), 0);
    assert_eq!(stages[1].runs(), 0);
    let skipped = view
        .log
        .iter()
        .filter(|e| e.message.contains("skipped"))
        .count();
    assert_eq!(skipped, 2);
}

#[test]
fn test_concurrent_run_job_executes_once() {
    let harness = TestHarness::new();
    let stages = ScriptedStage::pipeline([Behaviour::SucceedAfter(Duration::from_millis(30)); 4]);
    let id = harness.enqueue();

    let runners: Vec<_> = (0..6)
        .map(|i| Arc::new(harness.runner(&format!("w{}", i), &stages)))
        .collect();
    let handles: Vec<_> = runners
        .into_iter()
        .map(|runner| {
            let id = id.clone();
            thread::spawn(move || runner.run_job(&id).unwrap())
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let job = harness.store.get(&id).unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert!(stages.iter().all(|s| s.runs() == 1));
    let claims = job
        .log
        .iter()
        .filter(|e| e.message.starts_with("Claimed by worker"))
        .count();
    assert_eq!(claims, 1);
}

#[test]
fn test_run_job_on_finished_job_is_a_no_op() {
    let harness = TestHarness::new();
    let stages = ScriptedStage::all_succeed();
    let runner = harness.runner("w1", &stages);

    let id = harness.enqueue();
    runner.run_job(&id).unwrap();
    let before = harness.store.get(&id).unwrap();

    assert_eq!(runner.run_job(&id).unwrap(), JobStatus::Completed);
    let after = harness.store.get(&id).unwrap();
    assert_eq!(before, after);
    assert!(stages.iter().all(|s| s.runs() == 1));
}

#[test]
fn test_unknown_job_is_not_found() {
    let harness = TestHarness::new();
    let runner = harness.runner("w1", &ScriptedStage::all_succeed());

    assert!(matches!(
        harness.reader().get_job_status("no-such-job"),
        Err(JobError::NotFound(_))
    ));
    assert!(matches!(
        runner.run_job("no-such-job"),
        Err(JobError::NotFound(_))
    ));
}

#[test]
fn test_identical_requests_get_distinct_ids() {
    let harness = TestHarness::new();
    let ids: HashSet<String> = (0..20).map(|_| harness.enqueue()).collect();
    assert_eq!(ids.len(), 20);
    assert_eq!(harness.reader().counts().unwrap().queued, 20);
}

#[test]
fn test_stage_timeout_abandons_attempt() {
    let harness = TestHarness::new();
    let stages = ScriptedStage::pipeline([
        Behaviour::Hang,
        Behaviour::Succeed,
        Behaviour::Succeed,
        Behaviour::Succeed,
    ]);
    let runner = harness.runner_with(
        "w1",
        &stages,
        TestHarness::pipeline_config(2),
        Duration::from_millis(150),
    );

    let id = harness.enqueue();
    assert_eq!(runner.run_job(&id).unwrap(), JobStatus::Failed);

    let job = harness.store.get(&id).unwrap();
    assert!(job.error.unwrap().contains("timed out"));
    assert_eq!(job.progress, 0.0);
    assert!(job.artifacts.is_empty());
    assert_eq!(stages[0].runs(), 2);
    assert_eq!(stages[1].runs(), 0);

    // Abandoned attempts wind down on their own threads.
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while stages[0].abandoned() < 2 && std::time::Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(stages[0].abandoned(), 2);
}

#[test]
fn test_cancel_running_job_stops_at_stage_boundary() {
    let harness = TestHarness::new();
    let stages = ScriptedStage::pipeline([Behaviour::SucceedAfter(Duration::from_millis(300)); 4]);
    let runner = Arc::new(harness.runner("w1", &stages));

    let id = harness.enqueue();
    let handle = {
        let runner = Arc::clone(&runner);
        let id = id.clone();
        thread::spawn(move || runner.run_job(&id).unwrap())
    };

    harness.wait_for(&id, Duration::from_secs(5), |job| {
        job.status == JobStatus::Running
    });
    harness.store.request_cancel(&id).unwrap();
    assert_eq!(handle.join().unwrap(), JobStatus::Failed);

    let job = harness.store.get(&id).unwrap();
    assert_eq!(job.error.as_deref(), Some("cancelled at user request"));
    assert_eq!(stages[0].runs(), 1);
    assert_eq!(stages[1].runs(), 0);
    assert_eq!(job.artifacts.len(), 1);
}

#[test]
fn test_cancel_queued_job_never_runs_a_stage() {
    let harness = TestHarness::new();
    let stages = ScriptedStage::all_succeed();
    let runner = harness.runner("w1", &stages);

    let id = harness.enqueue();
    harness.store.request_cancel(&id).unwrap();
    assert_eq!(runner.run_job(&id).unwrap(), JobStatus::Failed);
    assert!(stages.iter().all(|s| s.runs() == 0));

    assert!(matches!(
        harness.store.request_cancel(&id),
        Err(JobError::Validation(_))
    ));
}

#[test]
fn test_progress_never_decreases_and_log_only_grows() {
    let harness = TestHarness::new();
    let mut events = harness.broadcaster.subscribe();
    let stages = ScriptedStage::pipeline([Behaviour::SucceedAfter(Duration::from_millis(40)); 4]);
    let runner = Arc::new(harness.runner("w1", &stages));

    let id = harness.enqueue();
    let handle = {
        let runner = Arc::clone(&runner);
        let id = id.clone();
        thread::spawn(move || runner.run_job(&id).unwrap())
    };

    // Poll a second connection while the job runs.
    let observer = harness.reopen();
    let mut snapshots = Vec::new();
    loop {
        let job = observer.get(&id).unwrap();
        let done = job.is_finished();
        snapshots.push(job);
        if done {
            break;
        }
        thread::sleep(Duration::from_millis(5));
    }
    handle.join().unwrap();

    for pair in snapshots.windows(2) {
        let (earlier, later) = (&pair[0], &pair[1]);
        assert!(
            earlier.status == later.status || earlier.status.can_transition_to(later.status),
            "{} -> {}",
            earlier.status,
            later.status
        );
        assert!(later.progress >= earlier.progress);
        assert!(later.version >= earlier.version);
        assert!(later.log.len() >= earlier.log.len());
        assert_eq!(&later.log[..earlier.log.len()], &earlier.log[..]);
        assert_eq!(&later.artifacts[..earlier.artifacts.len()], &earlier.artifacts[..]);
    }

    let mut last = 0.0;
    let mut seen = 0;
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.job_id, id);
        assert!(event.progress >= last);
        last = event.progress;
        seen += 1;
    }
    assert!(seen > 4);
    assert_eq!(last, 100.0);
}

#[test]
fn test_state_survives_reopen() {
    let harness = TestHarness::new();
    let runner = harness.runner("w1", &ScriptedStage::all_succeed());

    let id = harness.enqueue();
    runner.run_job(&id).unwrap();
    let before = harness.reader().get_job_status(&id).unwrap();

    let reopened = harness.reopen();
    let after = reopened.get(&id).unwrap().status_view();
    assert_eq!(before, after);
    assert_eq!(
        reopened.get(&id).unwrap().completed_stages as usize,
        StageKind::ALL.len()
    );
}
