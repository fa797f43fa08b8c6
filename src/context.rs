//! Isolation context lifecycle.
//!
//! V8 isolates are `!Send`, so each context lives on a dedicated OS thread
//! with its own current-thread tokio runtime. The [`ContextManager`] talks
//! to it through a request channel and a oneshot per job, and keeps the only
//! handle that can terminate it.
//!
//! ```text
//!            ensure               dispatch
//!   Absent ─────────▶ Idle ◀────────────────▶ Busy
//!      ▲                │  reply               │
//!      │    ensure      │ destroy              │ timeout / destroy / lost
//!      └──────────── Destroyed ◀───────────────┘
//! ```

use crate::capability::CapabilityTable;
use crate::encoding::BlobStore;
use crate::error::EvalError;
use crate::loader::GuestModuleLoader;
use crate::ops::{initminal_runtime, PendingTimers, PostedReply, UnenforcedNames};
use crate::protocol::{DispatchRequest, GuestMessage};
use anyhow::{anyhow, Context as _, Error};
use deno_core::{v8, JsRuntime, PollEventLoopOptions, RuntimeOptions};
use serde_json::Value;
use std::future::poll_fn;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Extra heap granted once the limit is hit, so termination can unwind.
const HEAP_GRACE_BYTES: usize = 1024 * 1024;

/// Why a context was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    /// A job overran its budget.
    Timeout,
    /// The sandbox owner asked for it.
    Terminated,
    /// The whitelist changed after the context was seeded.
    WhitelistChanged,
    /// The guest hit the V8 heap limit.
    HeapExhausted,
    /// The event loop failed, e.g. on an unhandled rejection.
    EngineFailure,
    /// The job settled with guest timers still scheduled.
    PendingTimers,
    /// The context thread went away without replying.
    Lost,
}

/// Observable lifecycle state of a manager's context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextStatus {
    Absent,
    Idle,
    Busy,
    Destroyed(Teardown),
}

enum ContextState {
    Absent,
    Idle(LiveContext),
    Busy(LiveContext),
    Destroyed(Teardown),
}

impl ContextState {
    fn status(&self) -> ContextStatus {
        match self {
            ContextState::Absent => ContextStatus::Absent,
            ContextState::Idle(_) => ContextStatus::Idle,
            ContextState::Busy(_) => ContextStatus::Busy,
            ContextState::Destroyed(reason) => ContextStatus::Destroyed(*reason),
        }
    }
}

/// Settings shared by every context a manager creates.
#[derive(Debug, Clone, Default)]
pub struct ContextOptions {
    /// V8 heap cap in bytes. `None` leaves V8's default.
    pub max_heap_size: Option<usize>,
    /// Store the module loader reads `blob:` sources from.
    pub blobs: BlobStore,
}

struct Envelope {
    request: DispatchRequest,
    reply: oneshot::Sender<ContextReply>,
}

struct ContextReply {
    outcome: Result<GuestMessage, String>,
    /// Set when the context must not be reused.
    teardown: Option<Teardown>,
}

/// Host-side handle on a running context thread.
struct LiveContext {
    id: u64,
    generation: u64,
    requests: mpsc::UnboundedSender<Envelope>,
    isolate: v8::IsolateHandle,
    shutdown: Option<oneshot::Sender<()>>,
}

impl LiveContext {
    async fn spawn(id: u64, table: Arc<CapabilityTable>, options: ContextOptions) -> Result<Self, Error> {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let generation = table.generation();

        std::thread::Builder::new()
            .name(format!("initminal-context-{}", id))
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        if ready_tx.send(Err(e.into())).is_err() {
                            tracing::warn!(context = id, "context owner dropped during startup");
                        }
                        return;
                    }
                };
                rt.block_on(serve(id, table, options, request_rx, shutdown_rx, ready_tx));
            })
            .context("failed to spawn isolation context thread")?;

        let isolate = ready_rx
            .await
            .map_err(|_| anyhow!("isolation context thread exited during startup"))??;

        Ok(Self {
            id,
            generation,
            requests: request_tx,
            isolate,
            shutdown: Some(shutdown_tx),
        })
    }
}

impl Drop for LiveContext {
    fn drop(&mut self) {
        // Interrupts guest code stuck in a loop; the thread then sees shutdown.
        self.isolate.terminate_execution();
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

/// Event loop of a context thread.
async fn serve(
    id: u64,
    table: Arc<CapabilityTable>,
    options: ContextOptions,
    mut requests: mpsc::UnboundedReceiver<Envelope>,
    mut shutdown: oneshot::Receiver<()>,
    ready: oneshot::Sender<Result<v8::IsolateHandle, Error>>,
) {
    let mut context = match IsolationContext::create(&table, &options) {
        Ok(context) => context,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    if ready.send(Ok(context.isolate_handle())).is_err() {
        return;
    }
    tracing::debug!(context = id, generation = table.generation(), "isolation context ready");

    loop {
        let Envelope { request, reply } = tokio::select! {
            _ = &mut shutdown => break,
            envelope = requests.recv() => match envelope {
                Some(envelope) => envelope,
                None => break,
            },
        };

        let outcome = tokio::select! {
            _ = &mut shutdown => break,
            outcome = context.run(&request) => outcome,
        };

        let poisoned = outcome.teardown.is_some();
        if reply.send(outcome).is_err() {
            tracing::debug!(context = id, "reply receiver dropped");
        }
        if poisoned {
            break;
        }
    }

    tracing::debug!(context = id, "isolation context stopped");
}

/// The isolate itself, owned by its context thread.
struct IsolationContext {
    runtime: JsRuntime,
    dispatch: v8::Global<v8::Function>,
    heap_exhausted: Arc<AtomicBool>,
}

impl IsolationContext {
    fn create(table: &CapabilityTable, options: &ContextOptions) -> Result<Self, Error> {
        let loader = GuestModuleLoader::new(options.blobs.clone());

        let create_params = options
            .max_heap_size
            .map(|max_bytes| v8::Isolate::create_params().heap_limits(0, max_bytes));

        let mut runtime = JsRuntime::new(RuntimeOptions {
            module_loader: Some(Rc::new(loader)),
            extensions: vec![initminal_runtime::init_ops_and_esm()],
            create_params,
            ..Default::default()
        });

        let heap_exhausted = Arc::new(AtomicBool::new(false));
        if options.max_heap_size.is_some() {
            let handle = runtime.v8_isolate().thread_safe_handle();
            let triggered = heap_exhausted.clone();
            runtime.add_near_heap_limit_callback(move |current, initial| {
                if !triggered.swap(true, Ordering::SeqCst) {
                    tracing::warn!(
                        current_mb = current / (1024 * 1024),
                        initial_mb = initial / (1024 * 1024),
                        "near heap limit, terminating guest"
                    );
                    handle.terminate_execution();
                }
                current + HEAP_GRACE_BYTES
            });
        }

        let script = table
            .bootstrap_script()
            .context("failed to embed capability table")?;
        let completion = runtime
            .execute_script("[initminal:bootstrap]", script)
            .context("bootstrap failed")?;

        let dispatch = {
            let scope = &mut runtime.handle_scope();
            let local = v8::Local::new(scope, &completion);
            let function = v8::Local::<v8::Function>::try_from(local)
                .map_err(|_| anyhow!("bootstrap did not produce a dispatch function"))?;
            v8::Global::new(scope, function)
        };

        if let Some(UnenforcedNames(names)) = runtime.op_state().borrow_mut().try_take::<UnenforcedNames>() {
            if !names.is_empty() {
                tracing::debug!(?names, "globals left unenforced");
            }
        }

        Ok(Self {
            runtime,
            dispatch,
            heap_exhausted,
        })
    }

    fn isolate_handle(&mut self) -> v8::IsolateHandle {
        self.runtime.v8_isolate().thread_safe_handle()
    }

    async fn run(&mut self, request: &DispatchRequest) -> ContextReply {
        let outcome = self.evaluate(request).await;

        if self.heap_exhausted.load(Ordering::SeqCst) {
            return ContextReply {
                outcome: Err("heap limit exceeded".to_string()),
                teardown: Some(Teardown::HeapExhausted),
            };
        }

        match outcome {
            Ok(message) => {
                let timers = self.take_pending_timers();
                let teardown = if timers > 0 {
                    tracing::debug!(timers, "job left timers behind");
                    Some(Teardown::PendingTimers)
                } else {
                    None
                };
                ContextReply {
                    outcome: Ok(message),
                    teardown,
                }
            }
            Err(e) => ContextReply {
                outcome: Err(format!("{:#}", e)),
                teardown: Some(Teardown::EngineFailure),
            },
        }
    }

    async fn evaluate(&mut self, request: &DispatchRequest) -> Result<GuestMessage, Error> {
        self.take_reply();
        self.take_pending_timers();
        self.invoke(request)?;

        match poll_fn(|cx| self.poll_reply(cx)).await? {
            Some(message) => Ok(message),
            None => {
                // Nothing left to run and no reply: the guest is waiting on
                // something that will never happen. The host timer decides.
                tracing::debug!("guest settled without replying");
                std::future::pending().await
            }
        }
    }

    /// Call the dispatch function. It is async and reports through
    /// `op_initminal_post_message`, so only engine-level failures surface here.
    fn invoke(&mut self, request: &DispatchRequest) -> Result<(), Error> {
        let scope = &mut self.runtime.handle_scope();
        let dispatch = v8::Local::new(scope, &self.dispatch);
        let undefined: v8::Local<v8::Value> = v8::undefined(scope).into();

        let code_url = v8_string(scope, &request.code_url)?;
        let arg = match &request.arg {
            Some(json) => v8_string(scope, json)?,
            None => undefined,
        };
        let call_target = v8_string(scope, &request.call_target)?;

        let tc = &mut v8::TryCatch::new(scope);
        if dispatch.call(tc, undefined, &[code_url, arg, call_target]).is_none() {
            let exception = tc.exception();
            let message = exception
                .map(|e| e.to_rust_string_lossy(tc))
                .unwrap_or_else(|| "execution terminated".to_string());
            return Err(anyhow!("dispatch failed: {}", message));
        }
        Ok(())
    }

    fn poll_reply(&mut self, cx: &mut Context<'_>) -> Poll<Result<Option<GuestMessage>, Error>> {
        if let Some(message) = self.take_reply() {
            return Poll::Ready(Ok(Some(message)));
        }
        match self.runtime.poll_event_loop(cx, PollEventLoopOptions::default()) {
            Poll::Ready(Ok(())) => Poll::Ready(Ok(self.take_reply())),
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => match self.take_reply() {
                Some(message) => Poll::Ready(Ok(Some(message))),
                None => Poll::Pending,
            },
        }
    }

    fn take_pending_timers(&mut self) -> u32 {
        self.runtime
            .op_state()
            .borrow_mut()
            .try_take::<PendingTimers>()
            .map_or(0, |PendingTimers(count)| count)
    }

    fn take_reply(&mut self) -> Option<GuestMessage> {
        self.runtime
            .op_state()
            .borrow_mut()
            .try_take::<PostedReply>()
            .map(|PostedReply(message)| message)
    }
}

fn v8_string<'s>(scope: &mut v8::HandleScope<'s>, value: &str) -> Result<v8::Local<'s, v8::Value>, Error> {
    v8::String::new(scope, value)
        .map(Into::into)
        .ok_or_else(|| anyhow!("string too large for V8 ({} bytes)", value.len()))
}

/// Owns at most one isolation context and drives its lifecycle.
pub struct ContextManager {
    state: Mutex<ContextState>,
    table: Mutex<Arc<CapabilityTable>>,
    options: ContextOptions,
    next_id: AtomicU64,
}

impl ContextManager {
    pub fn new(table: CapabilityTable, options: ContextOptions) -> Self {
        Self {
            state: Mutex::new(ContextState::Absent),
            table: Mutex::new(Arc::new(table)),
            options,
            next_id: AtomicU64::new(1),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, ContextState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn current_table(&self) -> Arc<CapabilityTable> {
        self.table
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn status(&self) -> ContextStatus {
        self.lock_state().status()
    }

    /// Make sure an idle context seeded with the current table exists.
    /// Returns its id.
    pub async fn ensure(&self) -> Result<u64, EvalError> {
        let table = self.current_table();
        {
            let mut state = self.lock_state();
            match &*state {
                ContextState::Idle(ctx) if ctx.generation == table.generation() => return Ok(ctx.id),
                ContextState::Idle(ctx) => {
                    tracing::info!(context = ctx.id, "whitelist changed, recycling isolation context");
                    *state = ContextState::Destroyed(Teardown::WhitelistChanged);
                }
                ContextState::Busy(_) => return Err(EvalError::runtime("isolation context is busy")),
                ContextState::Absent | ContextState::Destroyed(_) => {}
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let context = LiveContext::spawn(id, table, self.options.clone())
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "failed to create isolation context");
                EvalError::runtime(format!("failed to create isolation context: {:#}", e))
            })?;

        tracing::info!(context = id, generation = context.generation, "isolation context created");
        *self.lock_state() = ContextState::Idle(context);
        Ok(id)
    }

    /// Run one request on the idle context, racing its reply against `timeout`.
    pub async fn dispatch(&self, request: DispatchRequest, timeout: Duration) -> Result<Value, EvalError> {
        let (id, reply) = {
            let mut state = self.lock_state();
            match std::mem::replace(&mut *state, ContextState::Absent) {
                ContextState::Idle(ctx) => {
                    let (reply_tx, reply_rx) = oneshot::channel();
                    let envelope = Envelope {
                        request,
                        reply: reply_tx,
                    };
                    if ctx.requests.send(envelope).is_err() {
                        *state = ContextState::Destroyed(Teardown::Lost);
                        return Err(EvalError::runtime("isolation context is gone"));
                    }
                    let id = ctx.id;
                    *state = ContextState::Busy(ctx);
                    (id, reply_rx)
                }
                other => {
                    *state = other;
                    return Err(EvalError::runtime("no idle isolation context"));
                }
            }
        };

        tokio::select! {
            reply = reply => self.settle(id, reply.ok()),
            _ = tokio::time::sleep(timeout) => {
                tracing::warn!(context = id, timeout_ms = timeout.as_millis() as u64, "job timed out");
                self.destroy_context(id, Teardown::Timeout);
                Err(EvalError::Timeout)
            }
        }
    }

    fn settle(&self, id: u64, reply: Option<ContextReply>) -> Result<Value, EvalError> {
        let Some(ContextReply { outcome, teardown }) = reply else {
            // The thread dropped the responder: terminated or crashed.
            self.destroy_context(id, Teardown::Lost);
            return Err(EvalError::runtime("isolation context was terminated"));
        };

        {
            let mut state = self.lock_state();
            if matches!(&*state, ContextState::Busy(ctx) if ctx.id == id) {
                let next = match teardown {
                    Some(reason) => {
                        tracing::warn!(context = id, ?reason, "discarding isolation context");
                        ContextState::Destroyed(reason)
                    }
                    None => match std::mem::replace(&mut *state, ContextState::Absent) {
                        ContextState::Busy(ctx) => ContextState::Idle(ctx),
                        other => other,
                    },
                };
                *state = next;
            }
        }

        match outcome {
            Ok(message) => message.into_outcome(),
            Err(message) => Err(EvalError::runtime(message)),
        }
    }

    /// Destroy the context with `id` if it is still the live one.
    fn destroy_context(&self, id: u64, reason: Teardown) {
        let mut state = self.lock_state();
        let live = match &*state {
            ContextState::Idle(ctx) | ContextState::Busy(ctx) => ctx.id == id,
            _ => false,
        };
        if live {
            *state = ContextState::Destroyed(reason);
        }
    }

    /// Destroy whatever context is live. Returns false when there was none.
    pub fn destroy(&self, reason: Teardown) -> bool {
        let mut state = self.lock_state();
        match &*state {
            ContextState::Idle(ctx) | ContextState::Busy(ctx) => {
                tracing::info!(context = ctx.id, ?reason, "destroying isolation context");
                *state = ContextState::Destroyed(reason);
                true
            }
            ContextState::Absent | ContextState::Destroyed(_) => false,
        }
    }

    /// Install a new capability table. An idle context is recycled now; a
    /// busy one finishes its job and is recycled by the next `ensure`.
    pub fn replace_table(&self, table: CapabilityTable) {
        *self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Arc::new(table);

        let mut state = self.lock_state();
        if let ContextState::Idle(ctx) = &*state {
            tracing::info!(context = ctx.id, "whitelist changed, recycling isolation context");
            *state = ContextState::Destroyed(Teardown::WhitelistChanged);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::Whitelist;
    use serde_json::json;

    fn manager(whitelist: Whitelist) -> ContextManager {
        ContextManager::new(CapabilityTable::build(&whitelist, 0), ContextOptions::default())
    }

    fn request(source: &str) -> DispatchRequest {
        DispatchRequest {
            code_url: crate::encoding::encode_data_uri(source),
            arg: None,
            call_target: "initminal".to_string(),
        }
    }

    #[tokio::test]
    async fn test_lazy_creation_and_reuse() {
        let contexts = manager(Whitelist::default());
        assert_eq!(contexts.status(), ContextStatus::Absent);

        let first = contexts.ensure().await.unwrap();
        assert_eq!(contexts.status(), ContextStatus::Idle);
        assert_eq!(contexts.ensure().await.unwrap(), first);

        let value = contexts
            .dispatch(request("export const initminal = 1 + 1;"), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(value, json!(2));
        assert_eq!(contexts.status(), ContextStatus::Idle);
        assert_eq!(contexts.ensure().await.unwrap(), first);
    }

    #[tokio::test]
    async fn test_timeout_destroys_context() {
        let contexts = manager(Whitelist::default());
        contexts.ensure().await.unwrap();

        let err = contexts
            .dispatch(request("export const initminal = () => { while (true) {} };"), Duration::from_millis(200))
            .await
            .unwrap_err();
        assert_eq!(err, EvalError::Timeout);
        assert_eq!(contexts.status(), ContextStatus::Destroyed(Teardown::Timeout));
    }

    #[tokio::test]
    async fn test_leftover_timer_recycles_context() {
        let contexts = manager(Whitelist::default());
        contexts.ensure().await.unwrap();

        let value = contexts
            .dispatch(
                request("setTimeout(() => {}, 10000);\nexport const initminal = 'scheduled';"),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(value, json!("scheduled"));
        assert_eq!(contexts.status(), ContextStatus::Destroyed(Teardown::PendingTimers));
    }

    #[tokio::test]
    async fn test_dispatch_requires_idle_context() {
        let contexts = manager(Whitelist::default());
        let err = contexts
            .dispatch(request("export const initminal = 1;"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "error-eval-runtime");
    }

    #[tokio::test]
    async fn test_replaced_table_recycles_idle_context() {
        let contexts = manager(Whitelist::default());
        let first = contexts.ensure().await.unwrap();

        contexts.replace_table(CapabilityTable::build(&Whitelist::minimal_with(["Promise"]), 1));
        assert_eq!(contexts.status(), ContextStatus::Destroyed(Teardown::WhitelistChanged));
        assert_ne!(contexts.ensure().await.unwrap(), first);
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let contexts = manager(Whitelist::default());
        assert!(!contexts.destroy(Teardown::Terminated));
        contexts.ensure().await.unwrap();
        assert!(contexts.destroy(Teardown::Terminated));
        assert!(!contexts.destroy(Teardown::Terminated));
        assert_eq!(contexts.status(), ContextStatus::Destroyed(Teardown::Terminated));
    }
}
