use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use weft_core::workers::dedicated_context;
use weft_core::{
    JobContext, JobError, JobEvent, JobFailure, JobOutcome, Lifetime, PenaltyInfo, Result,
    TeamLayout, WeftError, WorkerTeam,
};

fn give_up(_failure: &JobFailure<'_, u32>) -> PenaltyInfo {
    PenaltyInfo::give_up()
}

async fn wait_until(mut done: impl FnMut() -> bool, limit: Duration) {
    tokio::time::timeout(limit, async {
        while !done() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn do_work_reports_completion() -> Result<()> {
    let lifetime = Lifetime::new();
    let sum = Arc::new(AtomicUsize::new(0));
    let s = Arc::clone(&sum);
    let team = WorkerTeam::start(
        move |ctx: JobContext<u32>| {
            let s = Arc::clone(&s);
            async move {
                s.fetch_add(ctx.job as usize, Ordering::SeqCst);
                Ok(())
            }
        },
        give_up,
        &lifetime,
        TeamLayout::Workers(2),
    )?;

    let outcome = team.do_work(5).await?;
    assert_eq!(outcome, JobOutcome::Completed);
    assert_eq!(sum.load(Ordering::SeqCst), 5);
    assert_eq!(team.state().completed, 1);

    lifetime.end().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn jobs_given_up_count_as_failures() -> Result<()> {
    let lifetime = Lifetime::new();
    let team = WorkerTeam::start(
        |_ctx: JobContext<u32>| async { Err(JobError::Failed("always".into())) },
        give_up,
        &lifetime,
        TeamLayout::Workers(3),
    )?;

    for job in 0..50 {
        assert!(team.post(job));
    }

    wait_until(|| team.state().failed == 50, Duration::from_secs(5)).await;
    let state = team.state();
    assert_eq!(state.completed, 0);
    assert_eq!(state.queued, 0);

    lifetime.end().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_job_is_retried_after_delay() -> Result<()> {
    let lifetime = Lifetime::new();
    let attempts = Arc::new(Mutex::new(Vec::new()));
    let a = Arc::clone(&attempts);
    let team = WorkerTeam::start(
        move |ctx: JobContext<u32>| {
            let a = Arc::clone(&a);
            async move {
                a.lock().unwrap().push(ctx.failed_counter);
                if ctx.failed_counter < 2 {
                    Err(JobError::Failed("not yet".into()))
                } else {
                    Ok(())
                }
            }
        },
        |failure: &JobFailure<'_, u32>| {
            assert!(matches!(failure.error, JobError::Failed(_)));
            PenaltyInfo::retry_after(Duration::from_millis(100))
        },
        &lifetime,
        TeamLayout::Workers(2),
    )?;

    let started = Instant::now();
    let outcome = team.do_work(1).await?;
    let elapsed = started.elapsed();

    assert_eq!(outcome, JobOutcome::Completed);
    assert_eq!(*attempts.lock().unwrap(), vec![0, 1, 2]);
    assert!(elapsed >= Duration::from_millis(200), "retried too early: {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(2), "retried too late: {:?}", elapsed);

    lifetime.end().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn retry_without_delay_requeues_immediately() -> Result<()> {
    let lifetime = Lifetime::new();
    let runs = Arc::new(AtomicUsize::new(0));
    let r = Arc::clone(&runs);
    let team = WorkerTeam::start(
        move |_ctx: JobContext<u32>| {
            let r = Arc::clone(&r);
            async move {
                if r.fetch_add(1, Ordering::SeqCst) < 3 {
                    Err(JobError::Rejected)
                } else {
                    Ok(())
                }
            }
        },
        |_failure: &JobFailure<'_, u32>| PenaltyInfo::retry_now(),
        &lifetime,
        TeamLayout::Workers(1),
    )?;

    assert_eq!(team.do_work(0).await?, JobOutcome::Completed);
    assert_eq!(runs.load(Ordering::SeqCst), 4);

    lifetime.end().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn panicking_routine_is_treated_as_failure() -> Result<()> {
    let lifetime = Lifetime::new();
    let seen = Arc::new(Mutex::new(None));
    let s = Arc::clone(&seen);
    let team = WorkerTeam::start(
        |ctx: JobContext<u32>| async move {
            if ctx.job == 9 {
                panic!("routine blew up");
            }
            Ok(())
        },
        move |failure: &JobFailure<'_, u32>| {
            *s.lock().unwrap() = Some(failure.error.clone());
            PenaltyInfo::give_up()
        },
        &lifetime,
        TeamLayout::Workers(1),
    )?;
    let mut events = team.events();

    let outcome = team.do_work(9).await?;
    assert_eq!(outcome, JobOutcome::Failed { failed_count: 1 });
    assert!(matches!(
        seen.lock().unwrap().clone(),
        Some(JobError::Panicked(msg)) if msg.contains("routine blew up")
    ));

    match events.recv().await {
        Ok(JobEvent::Failed { job, failed_count, .. }) => {
            assert_eq!(job, 9);
            assert_eq!(failed_count, 1);
        }
        other => panic!("unexpected event: {:?}", other),
    }

    // The worker survived the panic.
    assert_eq!(team.do_work(1).await?, JobOutcome::Completed);
    assert_eq!(team.state().failed, 1);

    lifetime.end().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn run_drains_a_job_stream() -> Result<()> {
    let lifetime = Lifetime::new();
    let team = WorkerTeam::run(
        futures::stream::iter(0..100u32),
        |_ctx: JobContext<u32>| async {
            tokio::time::sleep(Duration::from_millis(1)).await;
            Ok(())
        },
        give_up,
        &lifetime,
        TeamLayout::Workers(4),
    )?;

    wait_until(|| team.state().completed == 100, Duration::from_secs(5)).await;
    assert_eq!(team.workers(), 4);

    lifetime.end().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn workers_run_on_dedicated_contexts() -> Result<()> {
    let lifetime = Lifetime::new();
    let contexts = vec![
        dedicated_context("weft-ctx-0", &lifetime)?,
        dedicated_context("weft-ctx-1", &lifetime)?,
    ];
    let threads = Arc::new(Mutex::new(HashSet::new()));
    let t = Arc::clone(&threads);
    let team = WorkerTeam::start(
        move |_ctx: JobContext<u32>| {
            let t = Arc::clone(&t);
            async move {
                let name = std::thread::current().name().unwrap_or_default().to_string();
                t.lock().unwrap().insert(name);
                Ok(())
            }
        },
        give_up,
        &lifetime,
        TeamLayout::Contexts(contexts),
    )?;

    for job in 0..20 {
        assert_eq!(team.do_work(job).await?, JobOutcome::Completed);
    }
    let names = threads.lock().unwrap().clone();
    assert!(!names.is_empty());
    assert!(names.iter().all(|n| n.starts_with("weft-ctx-")), "{:?}", names);

    lifetime.end().await;
    Ok(())
}

#[tokio::test]
async fn ended_team_rejects_work() -> Result<()> {
    let lifetime = Lifetime::new();
    let team = WorkerTeam::start(
        |_ctx: JobContext<u32>| async { Ok(()) },
        give_up,
        &lifetime,
        TeamLayout::Workers(1),
    )?;
    lifetime.end().await;

    assert!(!team.post(1));
    assert!(matches!(team.do_work(1).await, Err(WeftError::Closed(_))));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_job_keeps_retrying_at_fixed_delay() -> Result<()> {
    let lifetime = Lifetime::new();
    let delay = Duration::from_millis(50);
    let attempts = Arc::new(Mutex::new(Vec::new()));
    let a = Arc::clone(&attempts);
    let team = WorkerTeam::start(
        move |_ctx: JobContext<u32>| {
            let a = Arc::clone(&a);
            async move {
                a.lock().unwrap().push(Instant::now());
                Err(JobError::Failed("always".into()))
            }
        },
        move |_failure: &JobFailure<'_, u32>| PenaltyInfo::retry_after(delay),
        &lifetime,
        TeamLayout::Workers(1),
    )?;

    assert!(team.post(7));
    wait_until(|| attempts.lock().unwrap().len() >= 5, Duration::from_secs(5)).await;
    lifetime.end().await;

    let attempts = attempts.lock().unwrap().clone();
    for pair in attempts.windows(2) {
        let gap = pair[1] - pair[0];
        assert!(gap >= delay, "retried after {:?}", gap);
    }
    assert_eq!(team.state().completed, 0);
    Ok(())
}

#[test]
fn start_outside_runtime_is_an_error() {
    let lifetime = Lifetime::new();
    let result = WorkerTeam::start(
        |_ctx: JobContext<u32>| async { Ok(()) },
        give_up,
        &lifetime,
        TeamLayout::Workers(1),
    );
    assert!(matches!(result, Err(WeftError::NoRuntime(_))));
}
