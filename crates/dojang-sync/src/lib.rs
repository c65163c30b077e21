//! Ingestion jobs: record update policy, single-flight guards, status reporting and cron wiring.

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Offset, Utc};
use dojang_adapters::{FeedTarget, HttpPageSource, RankingCrawler, RankingFeed, DEFAULT_FEED_BASE_URL};
use dojang_core::{iso_week, ParseError, PartitionKey, RankRecord, TimeAlignment, WeekSelector};
use dojang_storage::{FetchError, HttpClientConfig, HttpFetcher, PartitionWriter, RankStore, StoreError};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "dojang-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_path: PathBuf,
    pub feed_base_url: String,
    pub worlds: Vec<i32>,
    pub rank_type: i32,
    pub utc_offset_hours: i32,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub scheduler_enabled: bool,
    pub this_week_cron: String,
    pub last_week_cron: String,
    pub telegram_token: Option<String>,
    pub telegram_chat_id: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("./dojang.redb"),
            feed_base_url: DEFAULT_FEED_BASE_URL.to_string(),
            worlds: vec![1, 12],
            rank_type: 2,
            utc_offset_hours: 9,
            user_agent: "dojang-bot/0.1".to_string(),
            http_timeout_secs: 20,
            scheduler_enabled: true,
            // 06:30 daily and Monday 06:00 at +09:00.
            this_week_cron: "0 30 21 * * *".to_string(),
            last_week_cron: "0 0 21 * * Sun".to_string(),
            telegram_token: None,
            telegram_chat_id: None,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_path: std::env::var("DOJANG_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.database_path),
            feed_base_url: std::env::var("DOJANG_FEED_BASE_URL").unwrap_or(defaults.feed_base_url),
            worlds: std::env::var("DOJANG_WORLDS")
                .map(|v| parse_worlds(&v))
                .unwrap_or(defaults.worlds),
            rank_type: std::env::var("DOJANG_RANK_TYPE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.rank_type),
            utc_offset_hours: std::env::var("DOJANG_UTC_OFFSET_HOURS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.utc_offset_hours),
            user_agent: std::env::var("DOJANG_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: std::env::var("DOJANG_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            scheduler_enabled: std::env::var("DOJANG_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(defaults.scheduler_enabled),
            this_week_cron: std::env::var("DOJANG_THIS_WEEK_CRON").unwrap_or(defaults.this_week_cron),
            last_week_cron: std::env::var("DOJANG_LAST_WEEK_CRON").unwrap_or(defaults.last_week_cron),
            telegram_token: std::env::var("DOJANG_TELEGRAM_TOKEN").ok().filter(|v| !v.is_empty()),
            telegram_chat_id: std::env::var("DOJANG_TELEGRAM_CHAT_ID").ok().filter(|v| !v.is_empty()),
        }
    }

    /// Offset in which calendar weeks are evaluated. Out-of-range values fall back to UTC.
    pub fn week_offset(&self) -> FixedOffset {
        self.utc_offset_hours
            .checked_mul(3600)
            .and_then(FixedOffset::east_opt)
            .unwrap_or_else(|| Utc.fix())
    }
}

fn parse_worlds(raw: &str) -> Vec<i32> {
    raw.split(',')
        .filter_map(|part| {
            let part = part.trim();
            match part.parse() {
                Ok(world) => Some(world),
                Err(_) => {
                    if !part.is_empty() {
                        warn!(value = part, "ignoring non-numeric world id");
                    }
                    None
                }
            }
        })
        .collect()
}

/// How one job kind stamps and filters records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdatePolicy {
    pub alignment: TimeAlignment,
    /// Drop observations stamped earlier than the stored recent record.
    pub skip_older_than_recent: bool,
    pub week_offset: FixedOffset,
}

impl UpdatePolicy {
    pub fn this_week(week_offset: FixedOffset) -> Self {
        Self {
            alignment: TimeAlignment::RunTime,
            skip_older_than_recent: false,
            week_offset,
        }
    }

    pub fn last_week(week_offset: FixedOffset) -> Self {
        Self {
            alignment: TimeAlignment::PreviousWeek,
            skip_older_than_recent: true,
            week_offset,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ApplyStats {
    pub inserted: usize,
    pub recent_written: usize,
    pub recent_suppressed: usize,
    pub best_improved: usize,
    pub stale_skipped: usize,
}

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("normalizing record for {player:?}: {source}")]
    Parse {
        player: String,
        #[source]
        source: ParseError,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Applies a fetched batch to one partition under an [`UpdatePolicy`].
#[derive(Debug, Clone, Copy)]
pub struct UpdateEngine {
    policy: UpdatePolicy,
}

impl UpdateEngine {
    pub fn new(policy: UpdatePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> UpdatePolicy {
        self.policy
    }

    /// Normalize, stamp and merge every record of `batch`, then advance the window.
    ///
    /// The first malformed record fails the whole batch; the caller's transaction
    /// must then be discarded.
    pub fn apply_batch(
        &self,
        writer: &mut PartitionWriter<'_>,
        batch: &[RankRecord],
        run_at: DateTime<Utc>,
    ) -> Result<ApplyStats, UpdateError> {
        let key = writer.key();
        let checked_time = self
            .policy
            .alignment
            .checked_time(run_at, self.policy.week_offset);
        let mut stats = ApplyStats::default();

        for raw in batch {
            let mut record = raw.clone();
            if let Err(source) = record.normalize() {
                return Err(UpdateError::Parse {
                    player: record.name,
                    source,
                });
            }
            record.world = key.world;
            record.type_id = key.type_id;
            record.checked_time = checked_time;
            self.merge(writer, &record, &mut stats)?;
        }

        writer.mark_window(run_at.timestamp())?;
        Ok(stats)
    }

    /// Store `apply_batch` in its own transaction.
    pub fn apply_to_store(
        &self,
        store: &RankStore,
        key: PartitionKey,
        batch: &[RankRecord],
        run_at: DateTime<Utc>,
    ) -> Result<ApplyStats, UpdateError> {
        store.write_partition(key, |writer| self.apply_batch(writer, batch, run_at))
    }

    fn merge(
        &self,
        writer: &mut PartitionWriter<'_>,
        record: &RankRecord,
        stats: &mut ApplyStats,
    ) -> Result<(), StoreError> {
        let Some(best) = writer.best(&record.name)? else {
            writer.put_recent(record)?;
            writer.put_best(record)?;
            stats.inserted += 1;
            return Ok(());
        };

        let mut write_recent = true;
        if let Some(recent) = writer.recent(&record.name)? {
            if self.policy.skip_older_than_recent && record.checked_time < recent.checked_time {
                stats.stale_skipped += 1;
                return Ok(());
            }
            let offset = self.policy.week_offset;
            if iso_week(recent.checked_time, offset) == iso_week(record.checked_time, offset)
                && recent.same_result_as(record)
            {
                write_recent = false;
            }
        }

        if write_recent {
            writer.put_recent(record)?;
            stats.recent_written += 1;
        } else {
            stats.recent_suppressed += 1;
        }

        if record.improves_on(&best) {
            writer.put_best(record)?;
            stats.best_improved += 1;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    ThisWeek,
    LastWeek,
}

impl JobKind {
    pub fn week(self) -> WeekSelector {
        match self {
            JobKind::ThisWeek => WeekSelector::ThisWeek,
            JobKind::LastWeek => WeekSelector::LastWeek,
        }
    }

    pub fn policy(self, week_offset: FixedOffset) -> UpdatePolicy {
        match self {
            JobKind::ThisWeek => UpdatePolicy::this_week(week_offset),
            JobKind::LastWeek => UpdatePolicy::last_week(week_offset),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            JobKind::ThisWeek => "this-week",
            JobKind::LastWeek => "last-week",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("{kind} job already running since {since}")]
    AlreadyRunning { kind: JobKind, since: DateTime<Utc> },
    #[error("crawling world {world}: {source}")]
    Fetch {
        world: i32,
        #[source]
        source: FetchError,
    },
    #[error("updating world {world}: {source}")]
    Update {
        world: i32,
        #[source]
        source: UpdateError,
    },
    #[error("update task for world {world} did not complete: {source}")]
    Task {
        world: i32,
        #[source]
        source: tokio::task::JoinError,
    },
}

/// Single-flight guard for one job kind.
///
/// Holds the start time of the in-flight run, or `None` when idle. A second
/// start while busy is rejected, never queued.
#[derive(Debug)]
pub struct JobGuard {
    kind: JobKind,
    running_since: Mutex<Option<DateTime<Utc>>>,
}

/// Proof that the holder owns the guard; releases it when dropped.
#[derive(Debug)]
pub struct JobPermit<'a> {
    guard: &'a JobGuard,
}

impl JobGuard {
    pub fn new(kind: JobKind) -> Self {
        Self {
            kind,
            running_since: Mutex::new(None),
        }
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn try_start(&self, started_at: DateTime<Utc>) -> Result<JobPermit<'_>, JobError> {
        let mut running_since = self.lock();
        if let Some(since) = *running_since {
            return Err(JobError::AlreadyRunning {
                kind: self.kind,
                since,
            });
        }
        *running_since = Some(started_at);
        Ok(JobPermit { guard: self })
    }

    pub fn running_since(&self) -> Option<DateTime<Utc>> {
        *self.lock()
    }

    // A panic while holding the lock cannot leave the sentinel half-written.
    fn lock(&self) -> MutexGuard<'_, Option<DateTime<Utc>>> {
        self.running_since.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for JobPermit<'_> {
    fn drop(&mut self) {
        *self.guard.lock() = None;
    }
}

/// One guard per job kind; kinds never block each other.
#[derive(Debug)]
pub struct JobGuards {
    this_week: JobGuard,
    last_week: JobGuard,
}

impl Default for JobGuards {
    fn default() -> Self {
        Self {
            this_week: JobGuard::new(JobKind::ThisWeek),
            last_week: JobGuard::new(JobKind::LastWeek),
        }
    }
}

impl JobGuards {
    pub fn for_kind(&self, kind: JobKind) -> &JobGuard {
        match kind {
            JobKind::ThisWeek => &self.this_week,
            JobKind::LastWeek => &self.last_week,
        }
    }
}

/// Best-effort destination for job status lines.
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn send(&self, message: &str) -> anyhow::Result<()>;
}

/// Writes status lines to the log only.
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl StatusSink for LogSink {
    async fn send(&self, message: &str) -> anyhow::Result<()> {
        info!(status = message, "job status");
        Ok(())
    }
}

/// Telegram Bot API `sendMessage` sink.
pub struct TelegramSink {
    http: reqwest::Client,
    endpoint: String,
    chat_id: String,
}

impl TelegramSink {
    pub fn new(token: &str, chat_id: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: format!("https://api.telegram.org/bot{token}/sendMessage"),
            chat_id: chat_id.into(),
        }
    }
}

#[async_trait]
impl StatusSink for TelegramSink {
    async fn send(&self, message: &str) -> anyhow::Result<()> {
        let resp = self
            .http
            .post(&self.endpoint)
            .json(&json!({ "chat_id": self.chat_id, "text": message }))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            warn!(status = %status, body = %body, "telegram sendMessage returned non-success");
            anyhow::bail!("telegram sendMessage returned {status}");
        }
        Ok(())
    }
}

pub fn sink_from_config(config: &SyncConfig) -> Arc<dyn StatusSink> {
    match (&config.telegram_token, &config.telegram_chat_id) {
        (Some(token), Some(chat_id)) => {
            info!("telegram status reports enabled");
            Arc::new(TelegramSink::new(token, chat_id.clone()))
        }
        _ => Arc::new(LogSink),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WorldSummary {
    pub world: i32,
    pub fetched: usize,
    pub stats: ApplyStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub run_id: Uuid,
    pub kind: JobKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub worlds: Vec<WorldSummary>,
}

/// Crawl every configured world and merge it into the store, one transaction per world.
pub struct SyncPipeline {
    config: SyncConfig,
    store: RankStore,
    feed: Arc<dyn RankingFeed>,
    sink: Arc<dyn StatusSink>,
    guards: Arc<JobGuards>,
    pending_reports: Mutex<Vec<JoinHandle<()>>>,
}

/// Upper bound on how long a one-shot run waits for its status reports.
pub const REPORT_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

impl SyncPipeline {
    pub fn new(config: SyncConfig, store: RankStore) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
        })?;
        let feed = RankingCrawler::new(HttpPageSource::new(http, config.feed_base_url.clone()));
        let sink = sink_from_config(&config);
        Ok(Self {
            config,
            store,
            feed: Arc::new(feed),
            sink,
            guards: Arc::new(JobGuards::default()),
            pending_reports: Mutex::new(Vec::new()),
        })
    }

    pub fn with_feed(mut self, feed: Arc<dyn RankingFeed>) -> Self {
        self.feed = feed;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn StatusSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_guards(mut self, guards: Arc<JobGuards>) -> Self {
        self.guards = guards;
        self
    }

    pub fn store(&self) -> &RankStore {
        &self.store
    }

    pub fn guards(&self) -> &JobGuards {
        &self.guards
    }

    pub async fn run_job(&self, kind: JobKind) -> Result<JobSummary, JobError> {
        self.run_job_at(kind, Utc::now()).await
    }

    /// Run one job kind with an explicit run timestamp.
    pub async fn run_job_at(&self, kind: JobKind, run_at: DateTime<Utc>) -> Result<JobSummary, JobError> {
        self.report(format!("{kind} crawl starting"));
        let guard = self.guards.for_kind(kind);
        let _permit = match guard.try_start(run_at) {
            Ok(permit) => permit,
            Err(err) => {
                warn!(kind = %kind, error = %err, "skipping job trigger");
                self.report(format!("warning: {kind} crawl is delayed ({err})"));
                return Err(err);
            }
        };

        let run_id = Uuid::new_v4();
        let span = info_span!("ingest_job", kind = %kind, %run_id);
        let result = self.run_worlds(run_id, kind, run_at).instrument(span).await;
        self.report(format!("{kind} crawl finished"));
        result
    }

    async fn run_worlds(&self, run_id: Uuid, kind: JobKind, run_at: DateTime<Utc>) -> Result<JobSummary, JobError> {
        info!(run_at = %run_at, worlds = ?self.config.worlds, "ingestion started");
        let policy = kind.policy(self.config.week_offset());
        let mut worlds = Vec::with_capacity(self.config.worlds.len());

        for &world in &self.config.worlds {
            let target = FeedTarget {
                world,
                type_id: self.config.rank_type,
                week: kind.week(),
            };

            let batch = match self.feed.fetch(target).await {
                Ok(batch) => batch,
                Err(source) => {
                    error!(world, error = %source, "crawl failed");
                    self.report(format!("world {world} {kind} crawl error: {source}"));
                    return Err(JobError::Fetch { world, source });
                }
            };

            let fetched = batch.len();
            self.report(format!("world {world} {kind} updating store: {fetched} records"));
            info!(world, items = fetched, "updating partition");

            let stats = match self.apply(policy, target.partition(), batch, run_at).await {
                Ok(stats) => stats,
                Err(err) => {
                    error!(world, error = %err, "partition update failed");
                    self.report(format!("world {world} {kind} update error: {err}"));
                    return Err(err);
                }
            };
            info!(world, ?stats, "partition updated");
            worlds.push(WorldSummary { world, fetched, stats });
        }

        self.report(format!("{kind} crawl completed normally"));
        Ok(JobSummary {
            run_id,
            kind,
            started_at: run_at,
            finished_at: Utc::now(),
            worlds,
        })
    }

    async fn apply(
        &self,
        policy: UpdatePolicy,
        key: PartitionKey,
        batch: Vec<RankRecord>,
        run_at: DateTime<Utc>,
    ) -> Result<ApplyStats, JobError> {
        let store = self.store.clone();
        let engine = UpdateEngine::new(policy);
        tokio::task::spawn_blocking(move || engine.apply_to_store(&store, key, &batch, run_at))
            .await
            .map_err(|source| JobError::Task {
                world: key.world,
                source,
            })?
            .map_err(|source| JobError::Update {
                world: key.world,
                source,
            })
    }

    fn report(&self, message: String) {
        let sink = Arc::clone(&self.sink);
        let handle = tokio::spawn(async move {
            if let Err(err) = sink.send(&message).await {
                warn!(error = %err, "status report not delivered");
            }
        });
        let mut pending = self.pending_reports.lock().unwrap_or_else(PoisonError::into_inner);
        pending.retain(|h| !h.is_finished());
        pending.push(handle);
    }

    /// Wait up to `within` for status reports still in flight.
    ///
    /// Returns `false` when the deadline passed first; the remaining sends are
    /// left running and may be lost if the runtime shuts down.
    pub async fn flush_reports(&self, within: Duration) -> bool {
        let pending = std::mem::take(&mut *self.pending_reports.lock().unwrap_or_else(PoisonError::into_inner));
        let drain = async {
            for handle in pending {
                if let Err(err) = handle.await {
                    warn!(error = %err, "status report task failed");
                }
            }
        };
        match tokio::time::timeout(within, drain).await {
            Ok(()) => true,
            Err(_) => {
                warn!(timeout = ?within, "status reports still pending at exit");
                false
            }
        }
    }

    /// Cron triggers for both job kinds, or `None` when scheduling is disabled.
    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        for (kind, cron) in [
            (JobKind::ThisWeek, self.config.this_week_cron.as_str()),
            (JobKind::LastWeek, self.config.last_week_cron.as_str()),
        ] {
            let pipeline = Arc::clone(self);
            let job = Job::new_async(cron, move |_uuid, _l| {
                let pipeline = Arc::clone(&pipeline);
                Box::pin(async move {
                    run_and_log(&pipeline, kind).await;
                })
            })
            .with_context(|| format!("creating {kind} scheduler job for cron {cron}"))?;
            sched.add(job).await.context("adding scheduler job")?;
            info!(kind = %kind, cron, "scheduled ingestion job");
        }
        Ok(Some(sched))
    }
}

/// Run a job and fold its outcome into the log; used by triggers that have no caller to return to.
pub async fn run_and_log(pipeline: &SyncPipeline, kind: JobKind) {
    match pipeline.run_job(kind).await {
        Ok(summary) => info!(
            kind = %kind,
            run_id = %summary.run_id,
            worlds = summary.worlds.len(),
            "ingestion job finished"
        ),
        Err(err @ JobError::AlreadyRunning { .. }) => warn!(kind = %kind, error = %err, "ingestion job skipped"),
        Err(err) => error!(kind = %kind, error = %err, "ingestion job failed"),
    }
}

pub async fn run_job_once_from_env(kind: JobKind) -> Result<JobSummary> {
    let config = SyncConfig::from_env();
    let store = RankStore::open(&config.database_path)
        .with_context(|| format!("opening {}", config.database_path.display()))?;
    let pipeline = SyncPipeline::new(config, store)?;
    let outcome = pipeline.run_job(kind).await;
    pipeline.flush_reports(REPORT_FLUSH_TIMEOUT).await;
    Ok(outcome?)
}
