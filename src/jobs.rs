//! Named, schedulable units of work.
//!
//! One task type covers everything: a name, a runnable body (an in-process
//! async closure or a spawned subprocess), an optional repeat interval and
//! an optional successor list. The scheduler wraps any task with
//! single-flight tracking: a trigger that lands while the previous
//! invocation is still running is skipped, not queued.
//!
//! The subprocess variant exists for the scrape pipeline: it holds
//! long-lived connections, and a fresh process per run guarantees nothing
//! leaks across runs. The child inherits stdio so its logs land in the
//! parent's output, and resolves by exit status.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use futures::future::BoxFuture;
use tokio::process::Command;
use tracing::{error, info, warn};

type TaskFn = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// How a task body executes.
enum Runnable {
    InProcess(TaskFn),
    Subprocess(SubprocessSpec),
}

/// Specification of an isolated child-process body.
#[derive(Debug, Clone)]
pub struct SubprocessSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Env keys copied from the parent process into the child (DB DSNs and
    /// friends); everything else the child picks up from its own .env.
    pub inherit_env: Vec<String>,
}

pub struct Task {
    name: String,
    runnable: Runnable,
    schedule: Option<Duration>,
    successors: Vec<Task>,
}

impl Task {
    pub fn in_process<F, Fut>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            runnable: Runnable::InProcess(Arc::new(move || Box::pin(body()))),
            schedule: None,
            successors: Vec::new(),
        }
    }

    pub fn subprocess(name: impl Into<String>, spec: SubprocessSpec) -> Self {
        Self {
            name: name.into(),
            runnable: Runnable::Subprocess(spec),
            schedule: None,
            successors: Vec::new(),
        }
    }

    /// Repeat interval when driven by [`Scheduler::spawn_schedule`].
    pub fn every(mut self, interval: Duration) -> Self {
        self.schedule = Some(interval);
        self
    }

    /// Append a successor that runs after this task's body completes.
    pub fn then(mut self, successor: Task) -> Self {
        self.successors.push(successor);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schedule(&self) -> Option<Duration> {
        self.schedule
    }

    async fn run_body(&self) -> Result<()> {
        match &self.runnable {
            Runnable::InProcess(f) => f().await,
            Runnable::Subprocess(spec) => {
                let mut cmd = Command::new(&spec.program);
                cmd.args(&spec.args).kill_on_drop(true);
                for key in &spec.inherit_env {
                    if let Ok(v) = std::env::var(key) {
                        cmd.env(key, v);
                    }
                }
                // stdio is inherited: the child logs into our output
                let status = cmd
                    .status()
                    .await
                    .with_context(|| format!("failed to spawn {}", spec.program))?;
                if status.success() {
                    Ok(())
                } else {
                    anyhow::bail!("{} exited with {status}", spec.program)
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Idle,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// A previous invocation is still running; this trigger did nothing.
    Skipped,
    Completed,
    Failed,
}

/// In-memory single-flight tracker per job name. State is lost on restart,
/// which is fine: jobs are re-triggered by schedule, not recovered.
#[derive(Default)]
pub struct Scheduler {
    states: Mutex<HashMap<String, JobState>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, name: &str) -> JobState {
        self.states
            .lock()
            .unwrap()
            .get(name)
            .copied()
            .unwrap_or(JobState::Idle)
    }

    /// Run the task once, unless an invocation with the same name is still
    /// in flight. Successors run sequentially afterwards; their failures
    /// are logged and never fail this task nor stop later successors.
    pub fn trigger<'a>(&'a self, task: &'a Task) -> BoxFuture<'a, JobOutcome> {
        Box::pin(async move {
            {
                let mut states = self.states.lock().unwrap();
                if states.get(&task.name) == Some(&JobState::Running) {
                    warn!(job = %task.name, "previous invocation still running, skipping trigger");
                    return JobOutcome::Skipped;
                }
                states.insert(task.name.clone(), JobState::Running);
            }
            info!(job = %task.name, "job started");

            let body = task.run_body().await;
            let outcome = match &body {
                Ok(()) => JobOutcome::Completed,
                Err(err) => {
                    error!(job = %task.name, error = %err, "job failed");
                    JobOutcome::Failed
                }
            };

            for successor in &task.successors {
                match self.trigger(successor).await {
                    JobOutcome::Failed => {
                        // already logged; keep going with the next successor
                        warn!(job = %task.name, successor = %successor.name, "successor failed");
                    }
                    JobOutcome::Skipped => {
                        warn!(job = %task.name, successor = %successor.name, "successor skipped");
                    }
                    JobOutcome::Completed => {}
                }
            }

            let terminal = match outcome {
                JobOutcome::Failed => JobState::Failed,
                _ => JobState::Completed,
            };
            self.states
                .lock()
                .unwrap()
                .insert(task.name.clone(), terminal);
            info!(job = %task.name, ?outcome, "job finished");
            outcome
        })
    }

    /// Drive the task on its interval until the returned handle is aborted.
    /// Ticks that land mid-run are skipped by the single-flight check.
    pub fn spawn_schedule(self: Arc<Self>, task: Arc<Task>) -> tokio::task::JoinHandle<()> {
        let scheduler = self;
        tokio::spawn(async move {
            let Some(period) = task.schedule else {
                warn!(job = %task.name, "task has no schedule, nothing to do");
                return;
            };
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // the first tick fires immediately; that is the initial run
            loop {
                ticker.tick().await;
                scheduler.trigger(&task).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn second_trigger_is_skipped_while_running() {
        let runs = Arc::new(AtomicUsize::new(0));
        let runs2 = runs.clone();
        let task = Arc::new(Task::in_process("slow", move || {
            let runs = runs2.clone();
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            }
        }));
        let scheduler = Arc::new(Scheduler::new());

        let first = {
            let scheduler = scheduler.clone();
            let task = task.clone();
            tokio::spawn(async move { scheduler.trigger(&task).await })
        };
        tokio::task::yield_now().await;
        assert_eq!(scheduler.state("slow"), JobState::Running);

        let second = scheduler.trigger(&task).await;
        assert_eq!(second, JobOutcome::Skipped);

        assert_eq!(first.await.unwrap(), JobOutcome::Completed);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.state("slow"), JobState::Completed);
    }

    #[tokio::test]
    async fn failing_successor_does_not_fail_the_parent() {
        let order = Arc::new(Mutex::new(Vec::<&'static str>::new()));
        let o1 = order.clone();
        let o2 = order.clone();
        let task = Task::in_process("parent", {
            let order = order.clone();
            move || {
                let order = order.clone();
                async move {
                    order.lock().unwrap().push("parent");
                    Ok(())
                }
            }
        })
        .then(Task::in_process("bad-successor", move || {
            let order = o1.clone();
            async move {
                order.lock().unwrap().push("bad");
                anyhow::bail!("successor exploded")
            }
        }))
        .then(Task::in_process("good-successor", move || {
            let order = o2.clone();
            async move {
                order.lock().unwrap().push("good");
                Ok(())
            }
        }));

        let scheduler = Scheduler::new();
        let outcome = scheduler.trigger(&task).await;
        assert_eq!(outcome, JobOutcome::Completed);
        // the failed successor neither aborted the chain nor the parent
        assert_eq!(*order.lock().unwrap(), vec!["parent", "bad", "good"]);
        assert_eq!(scheduler.state("bad-successor"), JobState::Failed);
        assert_eq!(scheduler.state("parent"), JobState::Completed);
    }

    #[tokio::test]
    async fn failing_body_marks_the_job_failed() {
        let task = Task::in_process("doomed", || async { anyhow::bail!("nope") });
        let scheduler = Scheduler::new();
        assert_eq!(scheduler.trigger(&task).await, JobOutcome::Failed);
        assert_eq!(scheduler.state("doomed"), JobState::Failed);
        // a later trigger runs again from idle-equivalent state
        assert_eq!(scheduler.trigger(&task).await, JobOutcome::Failed);
    }

    #[tokio::test]
    async fn subprocess_exit_status_maps_to_outcome() {
        let scheduler = Scheduler::new();
        let ok = Task::subprocess(
            "true-bin",
            SubprocessSpec {
                program: "true".into(),
                args: vec![],
                inherit_env: vec![],
            },
        );
        assert_eq!(scheduler.trigger(&ok).await, JobOutcome::Completed);

        let bad = Task::subprocess(
            "false-bin",
            SubprocessSpec {
                program: "false".into(),
                args: vec![],
                inherit_env: vec![],
            },
        );
        assert_eq!(scheduler.trigger(&bad).await, JobOutcome::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn schedule_reruns_on_the_interval() {
        let runs = Arc::new(AtomicUsize::new(0));
        let runs2 = runs.clone();
        let task = Arc::new(
            Task::in_process("ticker", move || {
                let runs = runs2.clone();
                async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .every(Duration::from_secs(10)),
        );
        let scheduler = Arc::new(Scheduler::new());
        let handle = scheduler.spawn_schedule(task);

        tokio::time::sleep(Duration::from_secs(25)).await;
        handle.abort();
        // first immediate run + two interval ticks
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }
}
