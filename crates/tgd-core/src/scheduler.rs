//! Deferred and periodic jobs for handlers.
//!
//! Each job runs in its own loop task that sleeps until the next run or until
//! its cancellation token fires. A run is spawned as a separate task so a
//! failing or panicking job only gets logged.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Days, Local, NaiveTime, TimeZone};
use tokio::{task::JoinHandle, time::sleep};
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// Passed to every run of a job.
#[derive(Clone, Debug)]
pub struct JobContext {
    pub id: JobId,
    pub name: String,
    /// Runs completed before this one.
    pub run_count: u64,
    /// Fires when the job is cancelled or the scheduler stops.
    pub cancel: CancellationToken,
}

#[async_trait]
pub trait Job: Send + Sync {
    async fn run(&self, ctx: JobContext) -> anyhow::Result<()>;
}

struct FnJob<F>(F);

#[async_trait]
impl<F, Fut> Job for FnJob<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn run(&self, ctx: JobContext) -> anyhow::Result<()> {
        (self.0)(ctx).await
    }
}

/// Wrap an async closure as a [`Job`].
pub fn job_fn<F, Fut>(f: F) -> Arc<dyn Job>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnJob(f))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Trigger {
    Once { delay: Duration },
    Repeating { interval: Duration, first: Duration },
    Daily { at: NaiveTime },
}

impl Trigger {
    /// Delay until the next run, `None` when the job is done.
    fn next_delay(&self, runs: u64, now: DateTime<Local>) -> Option<Duration> {
        match *self {
            Trigger::Once { delay } => (runs == 0).then_some(delay),
            Trigger::Repeating { interval, first } => {
                Some(if runs == 0 { first } else { interval })
            }
            Trigger::Daily { at } => {
                let next = next_daily(now, at)?;
                Some((next - now).to_std().unwrap_or(Duration::ZERO))
            }
        }
    }
}

/// Next local occurrence of `at` strictly after `now`. Skips times that do
/// not exist on a given day (DST gaps).
fn next_daily(now: DateTime<Local>, at: NaiveTime) -> Option<DateTime<Local>> {
    (0..=2).find_map(|days| {
        let date = now.date_naive().checked_add_days(Days::new(days))?;
        let candidate = Local.from_local_datetime(&date.and_time(at)).earliest()?;
        (candidate > now).then_some(candidate)
    })
}

/// Listing entry returned by [`JobScheduler::jobs`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobInfo {
    pub id: JobId,
    pub name: String,
    pub next_run: Option<DateTime<Local>>,
}

#[derive(Clone)]
pub struct JobScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    state: Mutex<SchedulerState>,
    next_id: AtomicU64,
    root: CancellationToken,
}

#[derive(Default)]
struct SchedulerState {
    jobs: HashMap<JobId, JobEntry>,
}

struct JobEntry {
    name: String,
    next_run: Option<DateTime<Local>>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Default for JobScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for JobScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobScheduler")
            .field("jobs", &self.jobs().len())
            .finish()
    }
}

impl JobScheduler {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                state: Mutex::new(SchedulerState::default()),
                next_id: AtomicU64::new(1),
                root: CancellationToken::new(),
            }),
        }
    }

    pub fn run_once(&self, name: impl Into<String>, delay: Duration, job: Arc<dyn Job>) -> JobId {
        self.schedule(name.into(), Trigger::Once { delay }, job)
    }

    pub fn run_repeating(
        &self,
        name: impl Into<String>,
        interval: Duration,
        first_delay: Duration,
        job: Arc<dyn Job>,
    ) -> JobId {
        let trigger = Trigger::Repeating {
            interval: interval.max(Duration::from_millis(1)),
            first: first_delay,
        };
        self.schedule(name.into(), trigger, job)
    }

    /// Run every day at `at`, local time.
    pub fn run_daily(&self, name: impl Into<String>, at: NaiveTime, job: Arc<dyn Job>) -> JobId {
        self.schedule(name.into(), Trigger::Daily { at }, job)
    }

    /// Returns `false` when the job is unknown or already finished.
    pub fn cancel(&self, id: JobId) -> bool {
        let entry = self.inner.lock().jobs.remove(&id);
        match entry {
            Some(entry) => {
                entry.cancel.cancel();
                tracing::debug!(job_id = %id, job = %entry.name, "job cancelled");
                true
            }
            None => false,
        }
    }

    /// Scheduled jobs ordered by next run.
    pub fn jobs(&self) -> Vec<JobInfo> {
        let st = self.inner.lock();
        let mut out: Vec<JobInfo> = st
            .jobs
            .iter()
            .map(|(id, e)| JobInfo {
                id: *id,
                name: e.name.clone(),
                next_run: e.next_run,
            })
            .collect();
        out.sort_by_key(|j| (j.next_run.is_none(), j.next_run, j.id));
        out
    }

    /// Cancel every job. The scheduler accepts no new jobs afterwards.
    pub fn stop(&self) {
        self.inner.root.cancel();
        let mut st = self.inner.lock();
        for (_, job) in st.jobs.drain() {
            job.cancel.cancel();
            if let Some(handle) = job.handle {
                handle.abort();
            }
        }
    }

    fn schedule(&self, name: String, trigger: Trigger, job: Arc<dyn Job>) -> JobId {
        let id = JobId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let cancel = self.inner.root.child_token();

        // Register before spawning so the loop always finds its entry. The
        // check shares the lock with `stop` so a job cannot slip in behind it.
        {
            let mut st = self.inner.lock();
            if self.inner.root.is_cancelled() {
                tracing::debug!(job_id = %id, job = %name, "scheduler stopped, job not scheduled");
                return id;
            }
            st.jobs.insert(
                id,
                JobEntry {
                    name: name.clone(),
                    next_run: None,
                    cancel: cancel.clone(),
                    handle: None,
                },
            );
        }

        let scheduler = self.clone();
        let handle = tokio::spawn(async move {
            scheduler.job_loop(id, name, trigger, job, cancel).await;
        });
        if let Some(entry) = self.inner.lock().jobs.get_mut(&id) {
            entry.handle = Some(handle);
        }
        id
    }

    async fn job_loop(
        &self,
        id: JobId,
        name: String,
        trigger: Trigger,
        job: Arc<dyn Job>,
        cancel: CancellationToken,
    ) {
        let mut runs = 0u64;
        loop {
            let now = Local::now();
            let Some(delay) = trigger.next_delay(runs, now) else {
                break;
            };
            let step =
                chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            self.set_next_run(id, now + step);

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = sleep(delay) => {
                    let ctx = JobContext {
                        id,
                        name: name.clone(),
                        run_count: runs,
                        cancel: cancel.clone(),
                    };
                    let job = job.clone();
                    match tokio::spawn(async move { job.run(ctx).await }).await {
                        Ok(Ok(())) => tracing::debug!(job_id = %id, job = %name, "job ran"),
                        Ok(Err(e)) => {
                            tracing::warn!(job_id = %id, job = %name, error = %e, "job failed")
                        }
                        Err(e) => {
                            tracing::error!(job_id = %id, job = %name, error = %e, "job panicked")
                        }
                    }
                    runs += 1;
                }
            }
        }
        self.inner.lock().jobs.remove(&id);
    }

    fn set_next_run(&self, id: JobId, at: DateTime<Local>) {
        if let Some(entry) = self.inner.lock().jobs.get_mut(&id) {
            entry.next_run = Some(at);
        }
    }
}

impl SchedulerInner {
    fn lock(&self) -> std::sync::MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
