//! Scripted transport fake shared by the module tests.

use fleetdeck_api::{ApiError, LogChunkSource, RunnerTransport};
use fleetdeck_core::{RunnerInstance, RunnerSpec, RunnerStatus, WriteCredential};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub(crate) fn sample_instance(id: u64, status: RunnerStatus) -> RunnerInstance {
    RunnerInstance {
        id,
        name: format!("runner-{id}"),
        source_repo: "https://github.com/acme/widgets".to_string(),
        credential_masked: Some("ghp_****".to_string()),
        labels: Some("linux,x64".to_string()),
        status,
        hostname: Some(format!("host-{id}")),
        created_at: None,
    }
}

pub(crate) fn status_error(status: u16, message: &str) -> ApiError {
    ApiError::Status {
        status,
        message: message.to_string(),
    }
}

/// One scripted reply from a fake log stream.
pub(crate) enum ChunkStep {
    Data(Vec<u8>),
    Fail(ApiError),
    /// Never resolves; used to exercise cancellation mid-read.
    Hang,
}

pub(crate) struct ScriptedLogStream {
    steps: VecDeque<ChunkStep>,
}

impl ScriptedLogStream {
    pub(crate) fn new(steps: Vec<ChunkStep>) -> Self {
        Self {
            steps: steps.into(),
        }
    }
}

impl LogChunkSource for ScriptedLogStream {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, ApiError> {
        match self.steps.pop_front() {
            Some(ChunkStep::Data(chunk)) => Ok(Some(chunk)),
            Some(ChunkStep::Fail(err)) => Err(err),
            Some(ChunkStep::Hang) => std::future::pending().await,
            None => Ok(None),
        }
    }
}

/// Transport double with scripted replies. Every operation records a call
/// marker, applies the optional delay, then pops the next scripted result
/// for its family; an empty script yields a benign default.
#[derive(Clone, Default)]
pub(crate) struct FakeTransport {
    calls: Arc<Mutex<Vec<String>>>,
    list_results: Arc<Mutex<VecDeque<Result<Vec<RunnerInstance>, ApiError>>>>,
    instance_results: Arc<Mutex<VecDeque<Result<RunnerInstance, ApiError>>>>,
    clone_results: Arc<Mutex<VecDeque<Result<Vec<RunnerInstance>, ApiError>>>>,
    unit_results: Arc<Mutex<VecDeque<Result<(), ApiError>>>>,
    stream_results: Arc<Mutex<VecDeque<Result<Vec<ChunkStep>, ApiError>>>>,
    delay: Arc<Mutex<Option<Duration>>>,
    flight: Arc<Mutex<(usize, usize)>>,
}

impl FakeTransport {
    pub(crate) fn push_list(&self, result: Result<Vec<RunnerInstance>, ApiError>) {
        self.list_results.lock().unwrap().push_back(result);
    }

    /// Queues the next reply for start/stop/restart/update/create.
    pub(crate) fn push_instance(&self, result: Result<RunnerInstance, ApiError>) {
        self.instance_results.lock().unwrap().push_back(result);
    }

    pub(crate) fn push_clone(&self, result: Result<Vec<RunnerInstance>, ApiError>) {
        self.clone_results.lock().unwrap().push_back(result);
    }

    /// Queues the next reply for delete/clear_logs.
    pub(crate) fn push_unit(&self, result: Result<(), ApiError>) {
        self.unit_results.lock().unwrap().push_back(result);
    }

    pub(crate) fn push_stream(&self, result: Result<Vec<ChunkStep>, ApiError>) {
        self.stream_results.lock().unwrap().push_back(result);
    }

    pub(crate) fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn list_calls(&self) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.as_str() == "list")
            .count()
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.flight.lock().unwrap().1
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn enter(&self) {
        let mut flight = self.flight.lock().unwrap();
        flight.0 += 1;
        flight.1 = flight.1.max(flight.0);
    }

    fn exit(&self) {
        self.flight.lock().unwrap().0 -= 1;
    }

    async fn apply_delay(&self) {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

impl RunnerTransport for FakeTransport {
    type LogStream = ScriptedLogStream;

    async fn list(&self) -> Result<Vec<RunnerInstance>, ApiError> {
        self.record("list".to_string());
        self.enter();
        self.apply_delay().await;
        let result = self
            .list_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(Vec::new()));
        self.exit();
        result
    }

    async fn create(
        &self,
        spec: &RunnerSpec,
        _credential: &WriteCredential,
    ) -> Result<RunnerInstance, ApiError> {
        self.record(format!("create:{}", spec.source_repo));
        self.enter();
        self.apply_delay().await;
        let result = self
            .instance_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(sample_instance(0, RunnerStatus::Starting)));
        self.exit();
        result
    }

    async fn update_credential(
        &self,
        id: u64,
        _credential: &WriteCredential,
    ) -> Result<RunnerInstance, ApiError> {
        self.record(format!("update_credential:{id}"));
        self.enter();
        self.apply_delay().await;
        let result = self
            .instance_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(sample_instance(id, RunnerStatus::Online)));
        self.exit();
        result
    }

    async fn delete(&self, id: u64) -> Result<(), ApiError> {
        self.record(format!("delete:{id}"));
        self.enter();
        self.apply_delay().await;
        let result = self
            .unit_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(()));
        self.exit();
        result
    }

    async fn start(&self, id: u64) -> Result<RunnerInstance, ApiError> {
        self.record(format!("start:{id}"));
        self.enter();
        self.apply_delay().await;
        let result = self
            .instance_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(sample_instance(id, RunnerStatus::Online)));
        self.exit();
        result
    }

    async fn stop(&self, id: u64) -> Result<RunnerInstance, ApiError> {
        self.record(format!("stop:{id}"));
        self.enter();
        self.apply_delay().await;
        let result = self
            .instance_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(sample_instance(id, RunnerStatus::Offline)));
        self.exit();
        result
    }

    async fn restart(&self, id: u64) -> Result<RunnerInstance, ApiError> {
        self.record(format!("restart:{id}"));
        self.enter();
        self.apply_delay().await;
        let result = self
            .instance_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(sample_instance(id, RunnerStatus::Online)));
        self.exit();
        result
    }

    async fn clone_runners(
        &self,
        id: u64,
        count: u32,
        credential: Option<&WriteCredential>,
    ) -> Result<Vec<RunnerInstance>, ApiError> {
        let token = if credential.is_some() { ":token" } else { "" };
        self.record(format!("clone:{id}:{count}{token}"));
        self.enter();
        self.apply_delay().await;
        let result = self
            .clone_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(Vec::new()));
        self.exit();
        result
    }

    async fn open_log_stream(&self, id: u64) -> Result<Self::LogStream, ApiError> {
        self.record(format!("open_log_stream:{id}"));
        self.enter();
        self.apply_delay().await;
        let result = self
            .stream_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(Vec::new()))
            .map(ScriptedLogStream::new);
        self.exit();
        result
    }

    async fn clear_logs(&self, id: u64) -> Result<(), ApiError> {
        self.record(format!("clear_logs:{id}"));
        self.enter();
        self.apply_delay().await;
        let result = self
            .unit_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(()));
        self.exit();
        result
    }
}
