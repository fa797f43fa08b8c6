//! The caller-facing sandbox handle.

use crate::capability::{CapabilityTable, Whitelist};
use crate::config::SandboxConfig;
use crate::context::{ContextManager, ContextOptions, ContextStatus, Teardown};
use crate::encoding::{BlobStore, EncodingStrategy};
use crate::error::EvalError;
use crate::fetch::{HttpFetcher, ModuleFetcher};
use crate::queue::{ExecutionQueue, Job, JobRunner};
use crate::result::EvalResult;
use anyhow::Result;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// A long-lived evaluation sandbox.
///
/// Jobs submitted through any clone of the handle share one queue and one
/// isolation context, and complete in submission order.
#[derive(Clone)]
pub struct Sandbox {
    inner: Arc<SandboxInner>,
}

struct SandboxInner {
    contexts: Arc<ContextManager>,
    queue: ExecutionQueue,
    whitelist: Mutex<Whitelist>,
    generation: AtomicU64,
    encoding: EncodingStrategy,
}

impl Sandbox {
    /// Create a sandbox that fetches network dependencies over HTTP.
    pub fn new(config: SandboxConfig) -> Result<Self> {
        let fetcher = HttpFetcher::new(config.fetch.clone())?;
        Ok(Self::with_fetcher(config, Arc::new(fetcher)))
    }

    /// Create a sandbox with a custom source for network dependencies.
    pub fn with_fetcher(config: SandboxConfig, fetcher: Arc<dyn ModuleFetcher>) -> Self {
        let whitelist = Whitelist::from_config(config.whitelist.as_deref());
        let blobs = BlobStore::new();

        let contexts = Arc::new(ContextManager::new(
            CapabilityTable::build(&whitelist, 0),
            ContextOptions {
                max_heap_size: config.max_heap_size,
                blobs: blobs.clone(),
            },
        ));

        let queue = ExecutionQueue::new(JobRunner {
            contexts: contexts.clone(),
            fetcher,
            blobs,
            encoding: config.encoding,
            default_timeout: config.default_timeout,
        });

        tracing::debug!(
            encoding = %config.encoding,
            whitelist = whitelist.names().len(),
            "sandbox created"
        );

        Self {
            inner: Arc::new(SandboxInner {
                contexts,
                queue,
                whitelist: Mutex::new(whitelist),
                generation: AtomicU64::new(0),
                encoding: config.encoding,
            }),
        }
    }

    fn lock_whitelist(&self) -> MutexGuard<'_, Whitelist> {
        self.inner
            .whitelist
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue a job and wait for its outcome. Never fails: every problem is
    /// reported as an [`EvalResult::Failure`].
    pub async fn run(&self, job: impl Into<Job>) -> EvalResult {
        match self.inner.queue.submit(job.into()).await {
            Ok(result) => result,
            Err(_) => EvalResult::Failure(EvalError::runtime("job was dropped before completing")),
        }
    }

    /// Like [`Sandbox::run`], with failures as `Err`.
    pub async fn run_or_throw(&self, job: impl Into<Job>) -> Result<Value, EvalError> {
        self.run(job).await.into_result()
    }

    /// Destroy the live isolation context, if any.
    ///
    /// Idempotent. A job running at the time fails with a runtime error;
    /// jobs still queued run on a fresh context afterwards.
    pub fn terminate(&self) -> bool {
        self.inner.contexts.destroy(Teardown::Terminated)
    }

    /// Replace the whitelist. `None` restores the default safe set.
    ///
    /// Only contexts created afterwards see the change; a job already
    /// running keeps the capabilities it started with.
    pub fn set_whitelist(&self, whitelist: Option<Vec<String>>) {
        let whitelist = Whitelist::from_config(whitelist.as_deref());

        // Generations must reach the manager in the order they were issued.
        let mut current = self.lock_whitelist();
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner
            .contexts
            .replace_table(CapabilityTable::build(&whitelist, generation));
        *current = whitelist;
        tracing::info!(generation, "whitelist replaced");
    }

    pub fn whitelist(&self) -> Whitelist {
        self.lock_whitelist().clone()
    }

    pub fn encoding(&self) -> EncodingStrategy {
        self.inner.encoding
    }

    pub fn context_status(&self) -> ContextStatus {
        self.inner.contexts.status()
    }
}
