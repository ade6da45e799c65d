//! Drives the per-cycle listen/decide/enqueue/drain loop described in
//! `spec.md` §4.9: pull a batch of messages and reactions from a
//! [`crate::listener::Listener`], turn new messages into tasks (optionally
//! gated behind reaction approval), and dispatch claimed tasks either
//! inline or to a bounded worker pool.
//!
//! The worker pool is modeled per the "Coroutine / process pool" design
//! note as a bounded channel of long-lived Tokio tasks, each owning its own
//! `SQLite` handle, rather than a dynamic pool of OS processes — CAS on the
//! task status and the execution lock (done by the main loop before
//! handoff) remains the only serialization boundary, not the pool itself.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{info, warn};

use crate::approval::{ApprovalManager, GateOutcome, ResolutionOutcome};
use crate::attachments::{materialize_images, FileDownloader, ATTACHMENTS_BASE_DIR};
use crate::config::Config;
use crate::decider::{decide_message, Decision, TaskSpec};
use crate::executor::{ExecutionOutcome, ExecutionStatus, Executor};
use crate::listener::Listener;
use crate::models::{SlackFile, SlackMessage, SlackReaction, TaskPayload, TaskStatus};
use crate::persistence::db;
use crate::persistence::processed_repo::ProcessedRepo;
use crate::persistence::session_repo::SessionRepo;
use crate::persistence::task_repo::TaskRepo;
use crate::queue::TaskQueue;
use crate::reporter::Reporter;
use crate::Result;

/// Queue depth for the worker-pool submission channel. A full channel
/// demotes the rest of the cycle to inline execution, per `spec.md` §7
/// (`process_pool_submit_failed`).
const WORK_CHANNEL_CAPACITY: usize = 64;

/// A claimed task handed to a worker (inline or pooled).
struct WorkItem {
    task_id: String,
    payload: TaskPayload,
    lock_key: String,
    done: oneshot::Sender<()>,
}

fn payload_from_spec(task: &TaskSpec, image_paths: Vec<String>) -> TaskPayload {
    TaskPayload {
        channel_id: task.channel_id.clone(),
        message_ts: task.message_ts.clone(),
        thread_ts: task.thread_ts.clone(),
        trigger_user: task.trigger_user.clone(),
        trigger_text: task.trigger_text.clone(),
        command_text: task.command_text.clone(),
        lock_key: task.lock_key.clone(),
        image_paths,
    }
}

fn spec_from_task(task_id: &str, payload: &TaskPayload) -> TaskSpec {
    TaskSpec {
        task_id: task_id.to_owned(),
        channel_id: payload.channel_id.clone(),
        message_ts: payload.message_ts.clone(),
        thread_ts: payload.thread_ts.clone(),
        trigger_user: payload.trigger_user.clone(),
        trigger_text: payload.trigger_text.clone(),
        command_text: payload.command_text.clone(),
        lock_key: payload.lock_key.clone(),
    }
}

fn worker_execution_failed(err: &crate::AppError) -> ExecutionOutcome {
    ExecutionOutcome {
        status: ExecutionStatus::Failed,
        summary: "worker execution failed".to_owned(),
        details: err.to_string(),
    }
}

fn status_for(outcome: &ExecutionOutcome) -> TaskStatus {
    match outcome.status {
        ExecutionStatus::Succeeded => TaskStatus::Succeeded,
        ExecutionStatus::Failed => TaskStatus::Failed,
        ExecutionStatus::Canceled => TaskStatus::Canceled,
    }
}

/// Execute a claimed task and finalize it: persist the outcome status,
/// release its execution lock, and post the report. Lock release happens
/// here regardless of outcome, per `spec.md` §9 ("Scoped resource
/// acquisition").
async fn finish_task(
    task_repo: &TaskRepo,
    executor: &Executor,
    reporter: &Reporter,
    task_id: &str,
    payload: &TaskPayload,
    lock_key: &str,
) {
    let outcome = match executor.execute(payload).await {
        Ok(outcome) => outcome,
        Err(err) => worker_execution_failed(&err),
    };
    let status = status_for(&outcome);

    if let Err(err) = task_repo.update_task_status(task_id, status).await {
        warn!(task_id, %err, "failed to persist finished task status");
    }
    if let Err(err) = task_repo.release_lock(lock_key, task_id).await {
        warn!(task_id, %err, "failed to release execution lock");
    }
    reporter.report(task_id, payload, &outcome).await;
    info!(task_id, status = status.as_str(), "task_finished");
}

/// Spawn `count` long-lived workers draining `rx`, each with its own
/// `SQLite` handle and `Executor`/`Reporter`, per the pool design note.
async fn spawn_workers(
    count: usize,
    state_db_path: &std::path::Path,
    config: Arc<Config>,
    reporter: Arc<Reporter>,
) -> Result<mpsc::Sender<WorkItem>> {
    let (tx, rx) = mpsc::channel::<WorkItem>(WORK_CHANNEL_CAPACITY);
    let rx = Arc::new(Mutex::new(rx));

    for _ in 0..count {
        let rx = Arc::clone(&rx);
        let task_pool = db::connect(state_db_path).await?;
        let task_repo = TaskRepo::new(Arc::new(task_pool));
        let session_pool = db::connect(state_db_path).await?;
        let sessions = SessionRepo::new(Arc::new(session_pool));
        let executor = Executor::new(Arc::clone(&config), Arc::new(sessions));
        let reporter = Arc::clone(&reporter);

        tokio::spawn(async move {
            loop {
                let item = {
                    let mut guard = rx.lock().await;
                    guard.recv().await
                };
                let Some(item) = item else { break };
                finish_task(
                    &task_repo,
                    &executor,
                    &reporter,
                    &item.task_id,
                    &item.payload,
                    &item.lock_key,
                )
                .await;
                let _ = item.done.send(());
            }
        });
    }

    Ok(tx)
}

/// Counters emitted with `cycle_finished`.
#[derive(Debug, Default, Clone, Copy)]
struct CycleCounters {
    messages: usize,
    reactions: usize,
    started: usize,
    deferred: usize,
}

/// Drives the listen/decide/enqueue/drain cycle.
pub struct Orchestrator {
    listener: Box<dyn Listener>,
    listen_timeout: Duration,
    config: Arc<Config>,
    processed: Arc<ProcessedRepo>,
    task_repo: Arc<TaskRepo>,
    approvals: Arc<ApprovalManager>,
    queue: TaskQueue,
    downloader: Arc<dyn FileDownloader>,
    attachments_base: PathBuf,
    executor: Arc<Executor>,
    reporter: Arc<Reporter>,
    work_tx: Option<mpsc::Sender<WorkItem>>,
}

impl Orchestrator {
    /// Build an orchestrator. When `config.worker_processes > 1`, this
    /// spawns that many long-lived worker tasks, each with its own state
    /// store handle, and opens the submission channel.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if a pool worker's database handle cannot be
    /// opened.
    #[allow(clippy::too_many_arguments)]
    pub async fn new(
        listener: Box<dyn Listener>,
        config: Arc<Config>,
        processed: Arc<ProcessedRepo>,
        task_repo: Arc<TaskRepo>,
        approvals: Arc<ApprovalManager>,
        downloader: Arc<dyn FileDownloader>,
        executor: Arc<Executor>,
        reporter: Arc<Reporter>,
    ) -> Result<Self> {
        let listen_timeout = if matches!(config.listener_mode, crate::config::ListenerMode::Poll) {
            Duration::from_secs_f64(config.poll_interval_seconds)
        } else {
            Duration::from_secs_f64(config.socket_read_timeout_seconds)
        };

        let work_tx = if config.worker_processes > 1 {
            Some(
                spawn_workers(
                    config.worker_processes,
                    &config.state_db_path,
                    Arc::clone(&config),
                    Arc::clone(&reporter),
                )
                .await?,
            )
        } else {
            None
        };

        Ok(Self {
            listener,
            listen_timeout,
            config,
            processed,
            task_repo,
            approvals,
            queue: TaskQueue::new(),
            downloader,
            attachments_base: PathBuf::from(ATTACHMENTS_BASE_DIR),
            executor,
            reporter,
            work_tx,
        })
    }

    /// Run cycles until `shutdown` flips to `true`, checked between
    /// cycles. Each call to `receive` already blocks for the listener's
    /// own interval (poll sleeps `poll_interval_seconds`; socket blocks up
    /// to `socket_read_timeout_seconds`), so no additional sleep is added
    /// here.
    pub async fn run_forever(&mut self, shutdown: &AtomicBool) {
        while !shutdown.load(Ordering::Relaxed) {
            if let Err(err) = self.run_cycle().await {
                warn!(%err, "listen_error");
            }
        }
    }

    /// Run exactly one cycle (the `--once` CLI mode).
    ///
    /// # Errors
    ///
    /// Propagates an error only if the listener batch could not be fetched
    /// at all; persistence and reporting failures mid-cycle are logged and
    /// swallowed per `spec.md` §7.
    pub async fn run_cycle(&mut self) -> Result<()> {
        let started = Instant::now();
        let mut counters = CycleCounters::default();

        let batch = match self.listener.receive(self.listen_timeout).await {
            Ok(batch) => batch,
            Err(err) => {
                warn!(%err, "listen_error");
                return Ok(());
            }
        };
        counters.messages = batch.messages.len();
        counters.reactions = batch.reactions.len();

        for message in &batch.messages {
            if let Err(err) = self.handle_message(message).await {
                warn!(%err, channel_id = %message.channel_id, ts = %message.ts, "failed to process message");
            }
        }

        for reaction in &batch.reactions {
            if let Err(err) = self.handle_reaction(reaction).await {
                warn!(%err, "failed to process reaction");
            }
        }

        self.drain_queue(&mut counters).await;

        info!(
            messages = counters.messages,
            reactions = counters.reactions,
            started_tasks = counters.started,
            deferred_tasks = counters.deferred,
            elapsed_ms = started.elapsed().as_millis(),
            "cycle_finished"
        );
        Ok(())
    }

    async fn handle_message(&mut self, message: &SlackMessage) -> Result<()> {
        let newly_seen = self
            .processed
            .mark_processed(&message.channel_id, &message.ts)
            .await?;
        if !newly_seen {
            return Ok(());
        }

        let Decision::Run { task } = decide_message(&self.config, message) else {
            return Ok(());
        };

        if self.task_repo.task_exists(&task.task_id).await? {
            return Ok(());
        }

        self.handle_new_task(task, &message.files).await
    }

    async fn handle_new_task(&mut self, task: TaskSpec, files: &[SlackFile]) -> Result<()> {
        let image_paths = match materialize_images(
            self.downloader.as_ref(),
            &self.attachments_base,
            &task.task_id,
            files,
        )
        .await
        {
            Ok(paths) => paths,
            Err(err) => {
                let payload = payload_from_spec(&task, Vec::new());
                self.task_repo
                    .upsert_task(&task.task_id, TaskStatus::Failed, &payload)
                    .await?;
                let outcome = ExecutionOutcome {
                    status: ExecutionStatus::Failed,
                    summary: "attachment materialization failed".to_owned(),
                    details: err.to_string(),
                };
                self.reporter.report(&task.task_id, &payload, &outcome).await;
                warn!(task_id = %task.task_id, %err, "task_image_prepare_failed");
                return Ok(());
            }
        };

        if !image_paths.is_empty() {
            info!(
                task_id = %task.task_id,
                count = image_paths.len(),
                "task_images_prepared"
            );
        }

        let image_path_strings: Vec<String> = image_paths
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        let payload = payload_from_spec(&task, image_path_strings.clone());

        match self.approvals.gate(&task, image_path_strings.len()).await {
            Ok(GateOutcome::EnqueueImmediately) => {
                self.task_repo
                    .upsert_task(&task.task_id, TaskStatus::Pending, &payload)
                    .await?;
                self.queue.enqueue(task);
            }
            Ok(GateOutcome::WaitingApproval { .. }) => {
                self.task_repo
                    .upsert_task(&task.task_id, TaskStatus::WaitingApproval, &payload)
                    .await?;
                info!(task_id = %task.task_id, "task_waiting_approval");
            }
            Err(err) => {
                self.task_repo
                    .upsert_task(&task.task_id, TaskStatus::Failed, &payload)
                    .await?;
                let outcome = ExecutionOutcome {
                    status: ExecutionStatus::Failed,
                    summary: "approval request failed".to_owned(),
                    details: err.to_string(),
                };
                self.reporter.report(&task.task_id, &payload, &outcome).await;
                warn!(task_id = %task.task_id, %err, "approval_request_failed");
            }
        }

        Ok(())
    }

    async fn handle_reaction(&mut self, reaction: &SlackReaction) -> Result<()> {
        let outcome = self
            .approvals
            .handle_reaction(
                &reaction.channel_id,
                &reaction.message_ts,
                &reaction.reaction,
                &reaction.user,
            )
            .await?;

        match outcome {
            ResolutionOutcome::Approved { task_id } => {
                let Some(task) = self.task_repo.get_task(&task_id).await? else {
                    return Ok(());
                };
                self.task_repo
                    .upsert_task(&task_id, TaskStatus::Pending, &task.payload)
                    .await?;
                self.queue.enqueue(spec_from_task(&task_id, &task.payload));
                info!(task_id = %task_id, "task_approved");
            }
            ResolutionOutcome::Rejected { task_id } => {
                let Some(task) = self.task_repo.get_task(&task_id).await? else {
                    return Ok(());
                };
                self.task_repo
                    .update_task_status(&task_id, TaskStatus::Canceled)
                    .await?;
                self.reporter
                    .report_rejected(&task_id, &task.payload, &reaction.user)
                    .await;
                info!(task_id = %task_id, "task_canceled");
            }
            ResolutionOutcome::NoOp => {}
        }

        Ok(())
    }

    async fn drain_queue(&mut self, counters: &mut CycleCounters) {
        let mut deferred_ids = HashSet::new();
        let mut deferred = Vec::new();
        let mut pending_acks = Vec::new();
        let mut pool_degraded = false;

        while let Some(task_spec) = self.queue.dequeue() {
            let task_id = task_spec.task_id.clone();
            let lock_key = task_spec.lock_key.clone();

            let claimed = match self
                .task_repo
                .transition_task_status(&task_id, TaskStatus::Pending, TaskStatus::Running)
                .await
            {
                Ok(claimed) => claimed,
                Err(err) => {
                    warn!(task_id = %task_id, %err, "failed to claim task");
                    continue;
                }
            };
            if !claimed {
                continue;
            }

            let payload = match self.task_repo.get_task(&task_id).await {
                Ok(Some(task)) => task.payload,
                Ok(None) => continue,
                Err(err) => {
                    warn!(task_id = %task_id, %err, "failed to load claimed task");
                    continue;
                }
            };

            let locked = match self.task_repo.acquire_lock(&lock_key, &task_id).await {
                Ok(locked) => locked,
                Err(err) => {
                    warn!(task_id = %task_id, %err, "failed to acquire execution lock");
                    continue;
                }
            };
            if !locked {
                if let Err(err) = self
                    .task_repo
                    .update_task_status(&task_id, TaskStatus::Pending)
                    .await
                {
                    warn!(task_id = %task_id, %err, "failed to revert deferred task to pending");
                }
                // A task may be dequeued more than once across deferral
                // rounds within the same drain; only count it once.
                if deferred_ids.insert(task_id.clone()) {
                    counters.deferred += 1;
                }
                info!(task_id = %task_id, lock_key = %lock_key, "task_deferred_lock_busy");
                deferred.push(task_spec);
                continue;
            }

            counters.started += 1;
            info!(task_id = %task_id, "task_started");

            let mut dispatched_to_pool = false;
            if !pool_degraded {
                if let Some(tx) = &self.work_tx {
                    let (done_tx, done_rx) = oneshot::channel();
                    let item = WorkItem {
                        task_id: task_id.clone(),
                        payload: payload.clone(),
                        lock_key: lock_key.clone(),
                        done: done_tx,
                    };
                    match tx.try_send(item) {
                        Ok(()) => {
                            pending_acks.push(done_rx);
                            dispatched_to_pool = true;
                        }
                        Err(_) => {
                            pool_degraded = true;
                            warn!(task_id = %task_id, "process_pool_submit_failed");
                        }
                    }
                }
            }

            if !dispatched_to_pool {
                finish_task(
                    &self.task_repo,
                    &self.executor,
                    &self.reporter,
                    &task_id,
                    &payload,
                    &lock_key,
                )
                .await;
            }
        }

        for task_spec in deferred {
            self.queue.enqueue(task_spec);
        }
        for ack in pending_acks {
            let _ = ack.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    use crate::approval::ApprovalManager;
    use crate::attachments::FileDownloader;
    use crate::config::{ApprovalMode, ListenerMode, RunMode, TriggerMode};
    use crate::models::{EventBatch, SlackMessage, SlackReaction};
    use crate::persistence::approval_repo::ApprovalRepo;
    use crate::persistence::db;
    use crate::persistence::processed_repo::ProcessedRepo;
    use crate::slack::SlackPoster;
    use std::path::PathBuf;

    fn base_config() -> Config {
        Config {
            slack_bot_token: "xoxb".into(),
            slack_app_token: None,
            command_channel_id: "C111".into(),
            report_channel_id: "C222".into(),
            listener_mode: ListenerMode::Socket,
            poll_interval_seconds: 3.0,
            poll_batch_size: 100,
            socket_read_timeout_seconds: 1.0,
            trigger_mode: TriggerMode::Prefix,
            trigger_prefix: "!do".into(),
            bot_user_id: None,
            state_db_path: PathBuf::from("./state.db"),
            exec_timeout_seconds: 30,
            dry_run: true,
            run_mode: RunMode::Approve,
            approval_mode: ApprovalMode::None,
            approve_reaction: "white_check_mark".into(),
            reject_reaction: "x".into(),
            shell_allowlist: vec!["echo".into()],
            worker_processes: 1,
            kimi_permission_mode: "conservative".into(),
            codex_permission_mode: "conservative".into(),
            codex_sandbox_mode: "workspace-write".into(),
            claude_permission_mode: "conservative".into(),
            agent_response_instruction: String::new(),
            report_input_max_chars: 500,
            report_summary_max_chars: 1200,
            report_details_max_chars: 4000,
        }
    }

    fn message(text: &str, ts: &str) -> SlackMessage {
        SlackMessage {
            channel_id: "C111".into(),
            ts: ts.into(),
            thread_ts: None,
            user: "U1".into(),
            text: text.into(),
            subtype: String::new(),
            files: Vec::new(),
        }
    }

    /// Hands out queued batches one per `receive` call, then empty batches
    /// once drained. The queue is shared so a test can enqueue a follow-up
    /// batch (e.g. a reaction) after the orchestrator has already been
    /// built around this listener.
    struct FakeListener {
        queue: Arc<Mutex<std::collections::VecDeque<EventBatch>>>,
    }

    impl FakeListener {
        fn once(batch: EventBatch) -> (Self, Arc<Mutex<std::collections::VecDeque<EventBatch>>>) {
            let queue = Arc::new(Mutex::new(std::collections::VecDeque::from([batch])));
            (
                Self {
                    queue: Arc::clone(&queue),
                },
                queue,
            )
        }
    }

    #[async_trait::async_trait]
    impl Listener for FakeListener {
        async fn receive(&mut self, _timeout: Duration) -> Result<EventBatch> {
            Ok(self.queue.lock().await.pop_front().unwrap_or_default())
        }
    }

    /// Never invoked in these tests: none of the fixture messages carry
    /// image attachments.
    struct UnusedDownloader;

    #[async_trait::async_trait]
    impl FileDownloader for UnusedDownloader {
        async fn download(&self, _url_private: &str) -> Result<Vec<u8>> {
            panic!("download should not be called by these fixtures");
        }
    }

    /// Records every posted message and hands back deterministic, ascending
    /// `ts` values, mirroring how Slack assigns them.
    struct RecordingPoster {
        next_ts: AtomicU64,
        posted: Mutex<Vec<(String, String)>>,
    }

    impl RecordingPoster {
        fn new() -> Self {
            Self {
                next_ts: AtomicU64::new(1),
                posted: Mutex::new(Vec::new()),
            }
        }

        async fn posted_texts(&self) -> Vec<String> {
            self.posted
                .lock()
                .await
                .iter()
                .map(|(_, text)| text.clone())
                .collect()
        }
    }

    #[async_trait::async_trait]
    impl SlackPoster for RecordingPoster {
        async fn post_message(
            &self,
            channel_id: &str,
            text: &str,
            _thread_ts: Option<&str>,
        ) -> Result<String> {
            let ts = self.next_ts.fetch_add(1, Ordering::SeqCst);
            self.posted
                .lock()
                .await
                .push((channel_id.to_owned(), text.to_owned()));
            Ok(format!("1.{ts}"))
        }

        async fn fetch_history(
            &self,
            _channel_id: &str,
            _oldest: Option<&str>,
            _cursor: Option<&str>,
            _limit: u32,
        ) -> Result<crate::slack::HistoryPage> {
            Ok(crate::slack::HistoryPage::default())
        }
    }

    struct Harness {
        orchestrator: Orchestrator,
        task_repo: Arc<TaskRepo>,
        poster: Arc<RecordingPoster>,
        listener_queue: Arc<Mutex<std::collections::VecDeque<EventBatch>>>,
    }

    async fn harness(config: Config, batch: EventBatch) -> Harness {
        let config = Arc::new(config);
        let db = Arc::new(db::connect_memory().await.expect("db"));
        let task_repo = Arc::new(TaskRepo::new(Arc::clone(&db)));
        let processed = Arc::new(ProcessedRepo::new(Arc::clone(&db)));
        let approval_repo = Arc::new(ApprovalRepo::new(Arc::clone(&db)));
        let session_repo = Arc::new(SessionRepo::new(Arc::clone(&db)));
        let poster: Arc<RecordingPoster> = Arc::new(RecordingPoster::new());

        let approvals = Arc::new(ApprovalManager::new(
            approval_repo,
            Arc::clone(&poster) as Arc<dyn SlackPoster>,
            &config,
        ));
        let executor = Arc::new(Executor::new(Arc::clone(&config), session_repo));
        let reporter = Arc::new(Reporter::new(
            Arc::clone(&poster) as Arc<dyn SlackPoster>,
            &config,
        ));
        let (fake_listener, listener_queue) = FakeListener::once(batch);
        let listener: Box<dyn Listener> = Box::new(fake_listener);
        let downloader: Arc<dyn FileDownloader> = Arc::new(UnusedDownloader);

        let orchestrator = Orchestrator::new(
            listener,
            Arc::clone(&config),
            processed,
            Arc::clone(&task_repo),
            approvals,
            downloader,
            executor,
            reporter,
        )
        .await
        .expect("orchestrator");

        Harness {
            orchestrator,
            task_repo,
            poster,
            listener_queue,
        }
    }

    #[test]
    fn payload_and_spec_round_trip_through_conversion() {
        let task = TaskSpec {
            task_id: "abc".into(),
            channel_id: "C1".into(),
            message_ts: "1.0".into(),
            thread_ts: "1.0".into(),
            trigger_user: "U1".into(),
            trigger_text: "!do sh:echo hi".into(),
            command_text: "sh:echo hi".into(),
            lock_key: "global".into(),
        };
        let payload = payload_from_spec(&task, vec!["/tmp/a.png".into()]);
        assert_eq!(payload.command_text, task.command_text);
        assert_eq!(payload.image_paths, vec!["/tmp/a.png".to_owned()]);

        let rebuilt = spec_from_task(&task.task_id, &payload);
        assert_eq!(rebuilt, task);
    }

    #[test]
    fn status_for_maps_every_execution_status() {
        let succeeded = ExecutionOutcome {
            status: ExecutionStatus::Succeeded,
            summary: String::new(),
            details: String::new(),
        };
        let failed = ExecutionOutcome {
            status: ExecutionStatus::Failed,
            summary: String::new(),
            details: String::new(),
        };
        let canceled = ExecutionOutcome {
            status: ExecutionStatus::Canceled,
            summary: String::new(),
            details: String::new(),
        };
        assert_eq!(status_for(&succeeded), TaskStatus::Succeeded);
        assert_eq!(status_for(&failed), TaskStatus::Failed);
        assert_eq!(status_for(&canceled), TaskStatus::Canceled);
    }

    #[test]
    fn worker_execution_failed_always_reports_failed_status() {
        let outcome = worker_execution_failed(&crate::AppError::Executor("boom".into()));
        assert_eq!(outcome.status, ExecutionStatus::Failed);
        assert!(outcome.details.contains("boom"));
    }

    #[tokio::test]
    async fn prefix_trigger_runs_and_reports_without_approval_gate() {
        let config = base_config();
        let batch = EventBatch {
            messages: vec![message("!do sh:echo hi", "1.100")],
            reactions: Vec::new(),
        };
        let mut harness = harness(config, batch).await;

        harness.orchestrator.run_cycle().await.expect("cycle");

        let tasks = harness
            .task_repo
            .list_pending()
            .await
            .expect("list_pending");
        assert!(tasks.is_empty(), "task must have left pending after dispatch");

        let posted = harness.poster.posted_texts().await;
        assert_eq!(posted.len(), 1, "exactly one completion report expected");
        assert!(posted[0].contains("succeeded"));
    }

    #[tokio::test]
    async fn reaction_approval_gate_waits_then_approves_and_runs() {
        let mut config = base_config();
        config.approval_mode = ApprovalMode::Reaction;
        let batch = EventBatch {
            messages: vec![message("!do codex:do the thing", "1.200")],
            reactions: Vec::new(),
        };
        let mut harness = harness(config, batch).await;

        harness.orchestrator.run_cycle().await.expect("cycle");
        let plan_posts = harness.poster.posted_texts().await;
        assert_eq!(plan_posts.len(), 1, "a plan message must be posted");

        let approval_ts = harness
            .task_repo
            .get_task(&crate::clock::task_id("C111", "1.200", "!do codex:do the thing"))
            .await
            .expect("get_task")
            .expect("task exists")
            .status;
        assert_eq!(approval_ts, TaskStatus::WaitingApproval);

        // Approving requires the reaction ts to match the plan message's
        // own ts, which `RecordingPoster` assigned as "1.1" (its first
        // posted message).
        let reaction_batch = EventBatch {
            messages: Vec::new(),
            reactions: vec![SlackReaction {
                channel_id: "C111".into(),
                message_ts: "1.1".into(),
                reaction: "white_check_mark".into(),
                user: "U2".into(),
            }],
        };
        harness.listener_queue.lock().await.push_back(reaction_batch);
        harness.orchestrator.run_cycle().await.expect("cycle");

        let task = harness
            .task_repo
            .get_task(&crate::clock::task_id(
                "C111",
                "1.200",
                "!do codex:do the thing",
            ))
            .await
            .expect("get_task")
            .expect("task exists");
        assert_eq!(task.status, TaskStatus::Succeeded);

        let posted = harness.poster.posted_texts().await;
        assert_eq!(
            posted.len(),
            2,
            "plan message plus final completion report expected"
        );
    }

    #[tokio::test]
    async fn reaction_rejection_cancels_task_without_running_it() {
        let mut config = base_config();
        config.approval_mode = ApprovalMode::Reaction;
        let batch = EventBatch {
            messages: vec![message("!do codex:do the thing", "1.300")],
            reactions: Vec::new(),
        };
        let mut harness = harness(config, batch).await;
        harness.orchestrator.run_cycle().await.expect("cycle");

        let reject_batch = EventBatch {
            messages: Vec::new(),
            reactions: vec![SlackReaction {
                channel_id: "C111".into(),
                message_ts: "1.1".into(),
                reaction: "x".into(),
                user: "U2".into(),
            }],
        };
        harness.listener_queue.lock().await.push_back(reject_batch);
        harness.orchestrator.run_cycle().await.expect("cycle");

        let task = harness
            .task_repo
            .get_task(&crate::clock::task_id(
                "C111",
                "1.300",
                "!do codex:do the thing",
            ))
            .await
            .expect("get_task")
            .expect("task exists");
        assert_eq!(task.status, TaskStatus::Canceled);

        let posted = harness.poster.posted_texts().await;
        assert_eq!(posted.len(), 2, "plan message plus rejection notice expected");
        assert!(posted[1].contains("canceled"));
    }

    #[tokio::test]
    async fn shell_command_outside_allowlist_requires_approval_in_reaction_mode() {
        let mut config = base_config();
        config.approval_mode = ApprovalMode::Reaction;
        config.shell_allowlist = vec!["echo".into()];
        let batch = EventBatch {
            messages: vec![message("!do sh:rm -rf /tmp/x", "1.400")],
            reactions: Vec::new(),
        };
        let mut harness = harness(config, batch).await;
        harness.orchestrator.run_cycle().await.expect("cycle");

        let task = harness
            .task_repo
            .get_task(&crate::clock::task_id("C111", "1.400", "!do sh:rm -rf /tmp/x"))
            .await
            .expect("get_task")
            .expect("task exists");
        assert_eq!(task.status, TaskStatus::WaitingApproval);
        assert_eq!(harness.poster.posted_texts().await.len(), 1);
    }

    #[tokio::test]
    async fn shell_command_inside_allowlist_skips_approval_gate_in_reaction_mode() {
        let mut config = base_config();
        config.approval_mode = ApprovalMode::Reaction;
        config.shell_allowlist = vec!["echo".into()];
        let batch = EventBatch {
            messages: vec![message("!do sh:echo hi", "1.500")],
            reactions: Vec::new(),
        };
        let mut harness = harness(config, batch).await;
        harness.orchestrator.run_cycle().await.expect("cycle");

        let task = harness
            .task_repo
            .get_task(&crate::clock::task_id("C111", "1.500", "!do sh:echo hi"))
            .await
            .expect("get_task")
            .expect("task exists");
        assert_eq!(task.status, TaskStatus::Succeeded);
        assert_eq!(
            harness.poster.posted_texts().await.len(),
            1,
            "only the completion report, no plan message"
        );
    }

    #[tokio::test]
    async fn crash_recovery_sweep_rewrites_running_tasks() {
        let config = base_config();
        let batch = EventBatch::default();
        let harness = harness(config, batch).await;
        harness
            .task_repo
            .upsert_task(
                "stuck",
                TaskStatus::Running,
                &payload_from_spec(
                    &TaskSpec {
                        task_id: "stuck".into(),
                        channel_id: "C111".into(),
                        message_ts: "1.0".into(),
                        thread_ts: "1.0".into(),
                        trigger_user: "U1".into(),
                        trigger_text: "!do sh:echo hi".into(),
                        command_text: "sh:echo hi".into(),
                        lock_key: "global".into(),
                    },
                    Vec::new(),
                ),
            )
            .await
            .expect("upsert");

        let recovered = harness
            .task_repo
            .mark_running_tasks_aborted()
            .await
            .expect("sweep");
        assert_eq!(recovered, 1);
        let task = harness
            .task_repo
            .get_task("stuck")
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(task.status, TaskStatus::AbortedOnRestart);
    }
}
