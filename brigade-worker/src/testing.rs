//! Test doubles shared by the unit tests of every module

use anyhow::{Result, bail};
use async_trait::async_trait;
use brigade_core::domain::action::{Action, Parameter, ParameterType, Variable};
use brigade_core::domain::job::{JobInfo, JobResult, Status, StepResult};
use brigade_core::domain::log::SignedLog;
use brigade_core::domain::plugin::{Platform, PluginBinary};
use brigade_core::dto::job::StepStatusUpdate;
use serde_json::json;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::builtin::{BuiltinAction, BuiltinRegistry};
use crate::config::Config;
use crate::context::{JobContext, JobDirectories, StepContext};
use crate::plugin::PluginRequest;
use crate::plugin::rpc::RpcResponse;
use crate::repository::{JobRepository, LogRepository, PluginRepository, Repositories};
use crate::service::{LogEntry, LogSender};

pub fn log_channel(capacity: usize) -> (LogSender, mpsc::Receiver<LogEntry>) {
    LogSender::channel(capacity)
}

// ---------------------------------------------------------------------------
// Repositories
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeLogRepository {
    sent: Mutex<Vec<SignedLog>>,
    hang: AtomicBool,
    fail: AtomicBool,
    attempts: AtomicUsize,
}

impl FakeLogRepository {
    pub fn sent(&self) -> Vec<SignedLog> {
        self.sent.lock().unwrap().clone()
    }

    /// Never answer
    pub fn hang(&self, hang: bool) {
        self.hang.store(hang, Ordering::SeqCst);
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LogRepository for FakeLogRepository {
    async fn send_log(&self, log: &SignedLog) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.fail.load(Ordering::SeqCst) {
            bail!("connection refused");
        }
        self.sent.lock().unwrap().push(log.clone());
        Ok(())
    }
}

pub struct FakeJobRepository {
    job: Mutex<Option<JobInfo>>,
    fail_take: AtomicBool,
    live_status: Mutex<Option<Status>>,
    fail_status_polls: AtomicBool,
    status_polls: AtomicUsize,
    step_statuses: Mutex<Vec<StepStatusUpdate>>,
    fail_step_status: AtomicBool,
    step_status_attempts: AtomicUsize,
    results: Mutex<Vec<JobResult>>,
    fail_results: AtomicBool,
    result_attempts: AtomicUsize,
}

impl Default for FakeJobRepository {
    fn default() -> Self {
        Self {
            job: Mutex::new(None),
            fail_take: AtomicBool::new(false),
            live_status: Mutex::new(Some(Status::Building)),
            fail_status_polls: AtomicBool::new(false),
            status_polls: AtomicUsize::new(0),
            step_statuses: Mutex::new(Vec::new()),
            fail_step_status: AtomicBool::new(false),
            step_status_attempts: AtomicUsize::new(0),
            results: Mutex::new(Vec::new()),
            fail_results: AtomicBool::new(false),
            result_attempts: AtomicUsize::new(0),
        }
    }
}

impl FakeJobRepository {
    pub fn set_job(&self, job: JobInfo) {
        *self.job.lock().unwrap() = Some(job);
    }

    pub fn fail_take(&self, fail: bool) {
        self.fail_take.store(fail, Ordering::SeqCst);
    }

    /// `None` means the controller no longer knows the job
    pub fn set_live_status(&self, status: Option<Status>) {
        *self.live_status.lock().unwrap() = status;
    }

    pub fn fail_status_polls(&self, fail: bool) {
        self.fail_status_polls.store(fail, Ordering::SeqCst);
    }

    pub fn status_polls(&self) -> usize {
        self.status_polls.load(Ordering::SeqCst)
    }

    pub fn step_statuses(&self) -> Vec<StepStatusUpdate> {
        self.step_statuses.lock().unwrap().clone()
    }

    /// Statuses pushed at the end of each step, in order
    pub fn final_statuses(&self) -> Vec<(usize, Status)> {
        self.step_statuses()
            .into_iter()
            .filter(|update| update.status != Status::Building)
            .map(|update| (update.step_order, update.status))
            .collect()
    }

    pub fn fail_step_status(&self, fail: bool) {
        self.fail_step_status.store(fail, Ordering::SeqCst);
    }

    pub fn step_status_attempts(&self) -> usize {
        self.step_status_attempts.load(Ordering::SeqCst)
    }

    pub fn results(&self) -> Vec<JobResult> {
        self.results.lock().unwrap().clone()
    }

    pub fn fail_results(&self, fail: bool) {
        self.fail_results.store(fail, Ordering::SeqCst);
    }

    pub fn result_attempts(&self) -> usize {
        self.result_attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobRepository for FakeJobRepository {
    async fn take_job(&self, job_id: i64, _worker_name: &str) -> Result<JobInfo> {
        if self.fail_take.load(Ordering::SeqCst) {
            bail!("connection refused");
        }
        match self.job.lock().unwrap().clone() {
            Some(job) if job.id == job_id => Ok(job),
            _ => bail!("job {} not found", job_id),
        }
    }

    async fn job_status(&self, _job_id: i64) -> Result<Option<Status>> {
        self.status_polls.fetch_add(1, Ordering::SeqCst);
        if self.fail_status_polls.load(Ordering::SeqCst) {
            bail!("connection refused");
        }
        Ok(*self.live_status.lock().unwrap())
    }

    async fn send_step_status(&self, _job_id: i64, update: &StepStatusUpdate) -> Result<()> {
        self.step_status_attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_step_status.load(Ordering::SeqCst) {
            bail!("connection refused");
        }
        self.step_statuses.lock().unwrap().push(update.clone());
        Ok(())
    }

    async fn send_result(&self, _job_id: i64, result: &JobResult) -> Result<()> {
        self.result_attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_results.load(Ordering::SeqCst) {
            bail!("connection refused");
        }
        self.results.lock().unwrap().push(result.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct FakePluginRepository {
    binaries: Mutex<Vec<PluginBinary>>,
    files: Mutex<HashMap<String, Vec<u8>>>,
    downloads: AtomicUsize,
}

impl FakePluginRepository {
    pub fn add_binary(&self, binary: PluginBinary) {
        self.binaries.lock().unwrap().push(binary);
    }

    pub fn add_file(&self, filename: &str, content: Vec<u8>) {
        self.files.lock().unwrap().insert(filename.to_string(), content);
    }

    /// Number of files downloaded so far
    pub fn downloads(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PluginRepository for FakePluginRepository {
    async fn plugin_binary(
        &self,
        plugin: &str,
        platform: &Platform,
    ) -> Result<Option<PluginBinary>> {
        let binaries = self.binaries.lock().unwrap();
        Ok(binaries
            .iter()
            .find(|b| b.plugin == plugin && b.os == platform.os && b.arch == platform.arch)
            .cloned())
    }

    async fn download_plugin_file(
        &self,
        _binary: &PluginBinary,
        filename: &str,
        dest: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<u64> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        let content = self.files.lock().unwrap().get(filename).cloned();
        let Some(content) = content else {
            bail!("file {} not found", filename);
        };
        dest.write_all(&content).await?;
        dest.flush().await?;
        Ok(content.len() as u64)
    }
}

// ---------------------------------------------------------------------------
// Plugin side
// ---------------------------------------------------------------------------

/// How a [`FakePluginServer`] answers
pub struct ServerBehavior {
    pub fail_run: Option<String>,
    /// Drop the connection instead of answering `stop`
    pub close_on_stop: bool,
    pub fail_stop: Option<String>,
    pub run_status: String,
    pub run_delay: Option<Duration>,
}

impl Default for ServerBehavior {
    fn default() -> Self {
        Self {
            fail_run: None,
            close_on_stop: false,
            fail_stop: None,
            run_status: "Success".to_string(),
            run_delay: None,
        }
    }
}

/// In-process plugin endpoint listening on a Unix socket
///
/// Must be started from within a Tokio runtime.
pub struct FakePluginServer {
    _dir: TempDir,
    address: PathBuf,
    requests: Arc<tokio::sync::Mutex<Vec<PluginRequest>>>,
    accept: JoinHandle<()>,
}

impl FakePluginServer {
    pub fn start(behavior: ServerBehavior) -> Self {
        let dir = TempDir::new().unwrap();
        let address = dir.path().join("plugin.sock");
        let listener = UnixListener::bind(&address).unwrap();
        let requests = Arc::new(tokio::sync::Mutex::new(Vec::new()));
        let behavior = Arc::new(behavior);

        let recorded = requests.clone();
        let accept = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream, behavior.clone(), recorded.clone()));
            }
        });

        Self {
            _dir: dir,
            address,
            requests,
            accept,
        }
    }

    pub fn address(&self) -> &Path {
        &self.address
    }

    pub async fn requests(&self) -> Vec<PluginRequest> {
        self.requests.lock().await.clone()
    }
}

impl Drop for FakePluginServer {
    fn drop(&mut self) {
        self.accept.abort();
    }
}

async fn serve(
    stream: UnixStream,
    behavior: Arc<ServerBehavior>,
    requests: Arc<tokio::sync::Mutex<Vec<PluginRequest>>>,
) {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let request: PluginRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(_) => return,
        };
        requests.lock().await.push(request.clone());

        let response = match request {
            PluginRequest::Manifest => ok(json!({
                "name": "fake",
                "version": "1.0.0",
                "description": "test plugin",
                "author": "brigade",
            })),
            PluginRequest::WorkerHttpPort { .. } => ok(serde_json::Value::Null),
            PluginRequest::Run { options } => {
                if let Some(delay) = behavior.run_delay {
                    tokio::time::sleep(delay).await;
                }
                match &behavior.fail_run {
                    Some(message) => failed(message),
                    None => {
                        let mut outputs = HashMap::new();
                        if let Some(message) = options.get("message") {
                            outputs.insert("echo".to_string(), message.clone());
                        }
                        ok(json!({
                            "status": behavior.run_status,
                            "details": "",
                            "outputs": outputs,
                        }))
                    }
                }
            }
            PluginRequest::Stop => {
                if behavior.close_on_stop {
                    return;
                }
                match &behavior.fail_stop {
                    Some(message) => failed(message),
                    None => ok(serde_json::Value::Null),
                }
            }
        };

        let mut payload = serde_json::to_vec(&response).unwrap();
        payload.push(b'\n');
        if write.write_all(&payload).await.is_err() {
            return;
        }
    }
}

fn ok(result: serde_json::Value) -> RpcResponse {
    RpcResponse {
        result: Some(result),
        error: None,
    }
}

fn failed(message: &str) -> RpcResponse {
    RpcResponse {
        result: None,
        error: Some(message.to_string()),
    }
}

/// Registers plugin `name` as a shell script in the job's plugin repository
///
/// The script announces the socket given by the `plugin.socket` step
/// parameter, then runs `body`.
pub fn shell_plugin(job: &TestJob, name: &str, body: &str) {
    let platform = Platform::current();
    job.plugins.add_binary(PluginBinary {
        plugin: name.to_string(),
        os: platform.os,
        arch: platform.arch,
        filename: name.to_string(),
        perm: 0o755,
        cmd: name.to_string(),
        args: Vec::new(),
        companion_files: Vec::new(),
    });
    let script = format!("#!/bin/sh\necho \"$PLUGIN_SOCKET ready\"\n{}\n", body);
    job.plugins.add_file(name, script.into_bytes());
}

// ---------------------------------------------------------------------------
// Builtins
// ---------------------------------------------------------------------------

/// Returns the same result every time
pub struct FixedAction {
    result: StepResult,
}

impl FixedAction {
    pub fn new(result: StepResult) -> Self {
        Self { result }
    }
}

#[async_trait]
impl BuiltinAction for FixedAction {
    async fn run(&self, _: &StepContext<'_>, _: &[Parameter], _: &[Variable]) -> StepResult {
        self.result.clone()
    }
}

/// Writes parameter `content` to `path`, relative to the working directory
pub struct WriteFileAction;

#[async_trait]
impl BuiltinAction for WriteFileAction {
    async fn run(&self, ctx: &StepContext<'_>, parameters: &[Parameter], _: &[Variable]) -> StepResult {
        let get = |name: &str| {
            parameters
                .iter()
                .find(|p| p.name == name)
                .map(|p| p.value.clone())
                .unwrap_or_default()
        };
        let path = ctx.working_dir().join(get("path"));
        match tokio::fs::write(&path, get("content")).await {
            Ok(()) => StepResult::success(),
            Err(e) => StepResult::failed(format!("cannot write {}: {}", path.display(), e)),
        }
    }
}

/// Reads `path`, relative to the working directory, into `file.content`
pub struct ReadFileAction;

#[async_trait]
impl BuiltinAction for ReadFileAction {
    async fn run(&self, ctx: &StepContext<'_>, parameters: &[Parameter], _: &[Variable]) -> StepResult {
        let relative = parameters
            .iter()
            .find(|p| p.name == "path")
            .map(|p| p.value.clone())
            .unwrap_or_default();
        let path = ctx.working_dir().join(relative);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => StepResult::success().with_variable("file.content", content),
            Err(e) => StepResult::failed(format!("cannot read {}: {}", path.display(), e)),
        }
    }
}

/// Ends the job early
pub struct ExitAction;

#[async_trait]
impl BuiltinAction for ExitAction {
    async fn run(&self, ctx: &StepContext<'_>, _: &[Parameter], _: &[Variable]) -> StepResult {
        ctx.job.request_exit();
        StepResult::success()
    }
}

/// Cancels the job it runs in
pub struct CancelAction;

#[async_trait]
impl BuiltinAction for CancelAction {
    async fn run(&self, ctx: &StepContext<'_>, _: &[Parameter], _: &[Variable]) -> StepResult {
        ctx.job.cancel.cancel();
        StepResult::success()
    }
}

/// Blocks until the job is cancelled
pub struct HangAction;

#[async_trait]
impl BuiltinAction for HangAction {
    async fn run(&self, ctx: &StepContext<'_>, _: &[Parameter], _: &[Variable]) -> StepResult {
        ctx.cancellation().cancelled().await;
        StepResult::failed("interrupted")
    }
}

/// Counts the runs of the wrapped action
struct Counted {
    name: String,
    calls: Arc<Mutex<HashMap<String, usize>>>,
    inner: Arc<dyn BuiltinAction>,
}

#[async_trait]
impl BuiltinAction for Counted {
    async fn run(&self, ctx: &StepContext<'_>, parameters: &[Parameter], secrets: &[Variable]) -> StepResult {
        *self.calls.lock().unwrap().entry(self.name.clone()).or_default() += 1;
        self.inner.run(ctx, parameters, secrets).await
    }
}

// ---------------------------------------------------------------------------
// Job fixture
// ---------------------------------------------------------------------------

/// A job wired to fake repositories, rooted in a temporary directory
pub struct TestJob {
    pub dir: TempDir,
    pub id: i64,
    pub jobs: Arc<FakeJobRepository>,
    pub logs: Arc<FakeLogRepository>,
    pub plugins: Arc<FakePluginRepository>,
    config: Config,
    action: Action,
    secrets: Vec<Variable>,
    builtins: BuiltinRegistry,
    calls: Arc<Mutex<HashMap<String, usize>>>,
    sender: LogSender,
    receiver: Mutex<mpsc::Receiver<LogEntry>>,
    entries: Mutex<Vec<LogEntry>>,
}

impl TestJob {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = Config::new("worker-1".to_string(), "http://localhost:8081".to_string());
        config.basedir = dir.path().to_path_buf();
        let (sender, receiver) = LogSender::channel(10_000);

        Self {
            dir,
            id: 42,
            jobs: Arc::new(FakeJobRepository::default()),
            logs: Arc::new(FakeLogRepository::default()),
            plugins: Arc::new(FakePluginRepository::default()),
            config,
            action: Action::composite("job", Vec::new()),
            secrets: Vec::new(),
            builtins: BuiltinRegistry::new(),
            calls: Arc::new(Mutex::new(HashMap::new())),
            sender,
            receiver: Mutex::new(receiver),
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn with_secret(mut self, name: &str, value: &str) -> Self {
        self.secrets
            .push(Parameter::new(name, value, ParameterType::Password));
        self
    }

    pub fn with_builtin(mut self, name: &str, action: impl BuiltinAction + 'static) -> Self {
        let counted = Counted {
            name: name.to_string(),
            calls: self.calls.clone(),
            inner: Arc::new(action),
        };
        self.builtins.register(name, counted);
        self
    }

    pub fn with_action(mut self, action: Action) -> Self {
        self.action = action;
        self
    }

    pub fn with_config(mut self, update: impl FnOnce(&mut Config)) -> Self {
        update(&mut self.config);
        self
    }

    pub fn config(&self) -> Config {
        self.config.clone()
    }

    pub fn builtins(&self) -> BuiltinRegistry {
        self.builtins.clone()
    }

    /// Repositories backed by the fakes; the job becomes takeable
    pub fn repositories(&self) -> Repositories {
        self.jobs.set_job(self.info());
        Repositories {
            jobs: self.jobs.clone(),
            logs: self.logs.clone(),
            plugins: self.plugins.clone(),
        }
    }

    pub fn info(&self) -> JobInfo {
        JobInfo {
            id: self.id,
            name: "build".to_string(),
            status: Status::Building,
            action: self.action.clone(),
            parameters: Vec::new(),
            secrets: self.secrets.clone(),
            signing_key: "00ff00ff".to_string(),
        }
    }

    /// A context whose logs are captured by [`TestJob::log_entries`]
    pub fn context(&self) -> JobContext {
        let root = self.dir.path().join("job");
        let dirs = JobDirectories {
            working: root.join("run"),
            keys: root.join("keys"),
            tmp: root.join("tmp"),
            hooks: root.join("hooks"),
            root,
        };
        for dir in [&dirs.working, &dirs.keys, &dirs.tmp, &dirs.hooks] {
            std::fs::create_dir_all(dir).unwrap();
        }

        JobContext::new(
            &self.info(),
            &self.config,
            dirs,
            self.sender.clone(),
            self.repositories(),
            Arc::new(self.builtins.clone()),
            CancellationToken::new(),
        )
    }

    /// Every log line sent so far
    pub fn log_entries(&self) -> Vec<LogEntry> {
        let mut receiver = self.receiver.lock().unwrap();
        let mut entries = self.entries.lock().unwrap();
        while let Ok(entry) = receiver.try_recv() {
            entries.push(entry);
        }
        entries.clone()
    }

    pub fn log_values(&self) -> Vec<String> {
        self.log_entries().into_iter().map(|e| e.value).collect()
    }

    pub fn builtin_calls(&self, name: &str) -> usize {
        self.calls.lock().unwrap().get(name).copied().unwrap_or(0)
    }
}
