//! Single-flight FIFO job queue.
//!
//! Jobs are drained by one task, one at a time, in submission order. A job
//! is resolved, encoded and dispatched before the next is taken; its result
//! (success or failure) goes to its own caller only.

use crate::context::ContextManager;
use crate::encoding::{BlobStore, EncodingSession, EncodingStrategy};
use crate::error::EvalError;
use crate::fetch::ModuleFetcher;
use crate::protocol::DispatchRequest;
use crate::resolver::{self, Dependencies};
use crate::result::EvalResult;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Export read when a job doesn't name one.
pub const DEFAULT_CALL_TARGET: &str = "initminal";

/// One evaluation request.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub source: String,
    pub dependencies: Dependencies,
    /// Passed to the export when it is a function.
    pub arg: Option<Value>,
    pub call_target: String,
    /// Overrides the sandbox's default timeout.
    pub timeout: Option<Duration>,
}

impl Job {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            dependencies: Dependencies::new(),
            arg: None,
            call_target: DEFAULT_CALL_TARGET.to_string(),
            timeout: None,
        }
    }

    pub fn dependencies(mut self, dependencies: Dependencies) -> Self {
        self.dependencies = dependencies;
        self
    }

    /// Map a single package name to a location or inline source.
    pub fn dependency(mut self, name: impl Into<String>, location: impl Into<String>) -> Self {
        self.dependencies.insert(name.into(), location.into());
        self
    }

    pub fn arg(mut self, arg: Value) -> Self {
        self.arg = Some(arg);
        self
    }

    pub fn call_target(mut self, call_target: impl Into<String>) -> Self {
        self.call_target = call_target.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl From<&str> for Job {
    fn from(source: &str) -> Self {
        Job::new(source)
    }
}

impl From<String> for Job {
    fn from(source: String) -> Self {
        Job::new(source)
    }
}

/// Everything needed to take a job from source text to a result.
pub(crate) struct JobRunner {
    pub(crate) contexts: Arc<ContextManager>,
    pub(crate) fetcher: Arc<dyn ModuleFetcher>,
    pub(crate) blobs: BlobStore,
    pub(crate) encoding: EncodingStrategy,
    pub(crate) default_timeout: Duration,
}

impl JobRunner {
    async fn execute(&self, job: Job) -> Result<Value, EvalError> {
        // Dropping the session revokes this job's blob URLs.
        let mut session = EncodingSession::new(self.encoding, self.blobs.clone());

        let resolution =
            resolver::resolve(&job.source, &job.dependencies, &mut session, self.fetcher.as_ref()).await?;
        tracing::debug!(modules = resolution.modules.len(), "dependencies resolved");

        let code_url = session.encode(&resolution.source);
        let arg = job
            .arg
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| EvalError::runtime(format!("argument is not serializable: {}", e)))?;

        self.contexts.ensure().await?;

        let request = DispatchRequest {
            code_url,
            arg,
            call_target: job.call_target,
        };
        let timeout = job.timeout.unwrap_or(self.default_timeout);
        self.contexts.dispatch(request, timeout).await
    }
}

struct QueuedJob {
    job: Job,
    done: oneshot::Sender<EvalResult>,
}

/// FIFO front of a sandbox.
///
/// The drain task starts on first submit, on the caller's runtime. If that
/// runtime shuts down the task goes with it, and the next submit starts a
/// new one.
pub(crate) struct ExecutionQueue {
    runner: Arc<JobRunner>,
    sender: Mutex<Option<mpsc::UnboundedSender<QueuedJob>>>,
}

impl ExecutionQueue {
    pub(crate) fn new(runner: JobRunner) -> Self {
        Self {
            runner: Arc::new(runner),
            sender: Mutex::new(None),
        }
    }

    /// Append `job`. Must be called from within a tokio runtime.
    pub(crate) fn submit(&self, job: Job) -> oneshot::Receiver<EvalResult> {
        let (done, completion) = oneshot::channel();
        let mut sender = self.sender.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let live = match sender.take() {
            Some(tx) if !tx.is_closed() => tx,
            stale => {
                if stale.is_some() {
                    tracing::warn!("execution queue driver stopped, restarting");
                }
                let (tx, rx) = mpsc::unbounded_channel();
                tokio::spawn(drain(self.runner.clone(), rx));
                tx
            }
        };

        if let Err(mpsc::error::SendError(rejected)) = live.send(QueuedJob { job, done }) {
            let _ = rejected
                .done
                .send(EvalResult::Failure(EvalError::runtime("execution queue has stopped")));
        }
        *sender = Some(live);
        completion
    }
}

async fn drain(runner: Arc<JobRunner>, mut jobs: mpsc::UnboundedReceiver<QueuedJob>) {
    while let Some(QueuedJob { job, done }) = jobs.recv().await {
        tracing::info!(
            code_len = job.source.len(),
            dependencies = job.dependencies.len(),
            call_target = %job.call_target,
            "job: starting"
        );

        let result = runner.execute(job).await;
        match &result {
            Ok(_) => tracing::info!("job: complete"),
            Err(e) => tracing::info!(kind = e.kind(), error = %e, "job: failed"),
        }

        if done.send(result.into()).is_err() {
            tracing::debug!("job caller went away before completion");
        }
    }
    tracing::debug!("execution queue drained");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_job_defaults() {
        let job = Job::new("export const initminal = 1;");
        assert_eq!(job.call_target, "initminal");
        assert!(job.dependencies.is_empty());
        assert!(job.arg.is_none());
        assert!(job.timeout.is_none());
    }

    #[test]
    fn test_job_builder() {
        let job = Job::from("export const main = (x) => x;")
            .dependency("lodash", "https://cdn.example.com/lodash.js")
            .arg(json!({"n": 1}))
            .call_target("main")
            .timeout(Duration::from_millis(50));

        assert_eq!(job.dependencies.get("lodash").map(String::as_str), Some("https://cdn.example.com/lodash.js"));
        assert_eq!(job.arg, Some(json!({"n": 1})));
        assert_eq!(job.call_target, "main");
        assert_eq!(job.timeout, Some(Duration::from_millis(50)));
    }
}
