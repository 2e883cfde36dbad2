//! Execution context builder.
//!
//! Every request gets its own `boa_engine::Context`, created and dropped on
//! the request's worker thread. Native bindings are handed to the prelude
//! script inside a private `host` object; the prelude publishes only the
//! globals of enabled capabilities.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use boa_engine::object::builtins::JsFunction;
use boa_engine::object::ObjectInitializer;
use boa_engine::property::Attribute;
use boa_engine::vm::RuntimeLimits;
use boa_engine::{
    js_string, Context, JsArgs, JsError, JsNativeError, JsObject, JsResult, JsString, JsValue,
    NativeFunction, Source,
};
use serde_json::json;
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

use crate::capabilities::buffer::{self, Encoding};
use crate::capabilities::html::is_html;
use crate::capabilities::{Capability, CapabilitySet, FetchedResponse, Fetcher};
use crate::config::SandboxConfig;
use crate::report::{format_chain, Failure, FailureKind};

use super::outcome::EvaluationRequest;
use super::timers::TimerQueue;

const PRELUDE: &str = include_str!("prelude.js");

/// Console lines kept per evaluation; the rest are only counted.
const MAX_CONSOLE_LINES: usize = 1000;

/// A capability error raised into the script, remembered so the
/// evaluator can tell it apart from an ordinary thrown error.
#[derive(Debug, Clone)]
pub(crate) struct CapabilityFault {
    pub capability: Capability,
    pub script_message: String,
    pub cause: String,
}

/// Host-side state of one context. Holds no engine values.
pub(crate) struct HostState {
    pub request_id: String,
    pub caller_id: String,
    pub deadline: Instant,
    pub abandoned: Arc<AtomicBool>,
    pub timers: TimerQueue,
    pub fault: Option<CapabilityFault>,
    pub console: ConsoleCapture,
}

impl HostState {
    pub fn is_abandoned(&self) -> bool {
        self.abandoned.load(Ordering::SeqCst)
    }
}

/// Lines written through `console.*`, capped at [`MAX_CONSOLE_LINES`].
#[derive(Debug, Default)]
pub(crate) struct ConsoleCapture {
    lines: Vec<String>,
    dropped: usize,
}

impl ConsoleCapture {
    pub fn push(&mut self, line: String) {
        if self.lines.len() < MAX_CONSOLE_LINES {
            self.lines.push(line);
        } else {
            self.dropped += 1;
        }
    }

    pub fn into_lines(mut self) -> Vec<String> {
        if self.dropped > 0 {
            self.lines
                .push(format!("... {} more console lines omitted", self.dropped));
        }
        self.lines
    }
}

type Shared = Rc<RefCell<HostState>>;

/// Everything a worker needs to build a context for one request.
pub(crate) struct ContextSetup<'a> {
    pub capabilities: &'a CapabilitySet,
    pub config: &'a SandboxConfig,
    pub request: &'a EvaluationRequest,
    pub request_id: &'a str,
    pub runtime: Handle,
    pub deadline: Instant,
    pub budget: Duration,
    pub abandoned: Arc<AtomicBool>,
}

/// A fresh, isolated evaluation environment owned by one request.
pub struct ExecutionContext {
    pub(crate) context: Context,
    pub(crate) state: Shared,
    pub(crate) stringify: JsFunction,
    pub(crate) fire_timer: Option<JsFunction>,
    pub(crate) budget: Duration,
}

struct Hooks {
    stringify: JsFunction,
    fire_timer: Option<JsFunction>,
}

impl ExecutionContext {
    pub(crate) fn build(setup: ContextSetup<'_>) -> Result<Self, Failure> {
        let mut context = Context::default();

        let mut limits = RuntimeLimits::default();
        limits.set_loop_iteration_limit(setup.config.loop_iteration_limit);
        limits.set_recursion_limit(setup.config.recursion_limit);
        context.set_runtime_limits(limits);

        let state = Rc::new(RefCell::new(HostState {
            request_id: setup.request_id.to_string(),
            caller_id: setup.request.caller().id.clone(),
            deadline: setup.deadline,
            abandoned: Arc::clone(&setup.abandoned),
            timers: TimerQueue::new(),
            fault: None,
            console: ConsoleCapture::default(),
        }));

        match install(&mut context, &state, &setup) {
            Ok(hooks) => Ok(Self {
                context,
                state,
                stringify: hooks.stringify,
                fire_timer: hooks.fire_timer,
                budget: setup.budget,
            }),
            Err(e) => Err(Failure::from_js_error(
                FailureKind::CapabilityError,
                &e,
                &mut context,
            )),
        }
    }

    pub(crate) fn deadline(&self) -> Instant {
        self.state.borrow().deadline
    }

    pub(crate) fn is_abandoned(&self) -> bool {
        self.state.borrow().is_abandoned()
    }

    pub(crate) fn request_id(&self) -> String {
        self.state.borrow().request_id.clone()
    }

    /// Drains the console lines captured so far.
    pub(crate) fn take_console(&self) -> Vec<String> {
        std::mem::take(&mut self.state.borrow_mut().console).into_lines()
    }
}

fn install(context: &mut Context, state: &Shared, setup: &ContextSetup<'_>) -> JsResult<Hooks> {
    let host = host_object(context, state, setup);

    let enabled: Vec<&str> = setup.capabilities.enabled().map(|c| c.name()).collect();
    let enabled = JsValue::from_json(&json!(enabled), context)?;

    let installer = context.eval(Source::from_bytes(PRELUDE))?;
    let installer = as_function(&installer)
        .ok_or_else(|| internal_error("prelude did not evaluate to a function"))?;
    let hooks = installer.call(&JsValue::undefined(), &[host.into(), enabled], context)?;
    let hooks = hooks
        .as_object()
        .cloned()
        .ok_or_else(|| internal_error("prelude returned no hooks"))?;

    let stringify = hooks.get(js_string!("stringify"), context)?;
    let stringify =
        as_function(&stringify).ok_or_else(|| internal_error("JSON.stringify is missing"))?;
    let fire_timer = hooks.get(js_string!("fireTimer"), context)?;
    let fire_timer = as_function(&fire_timer);

    if setup.capabilities.is_enabled(Capability::Caller) {
        bind_caller(context, setup.request)?;
    }

    Ok(Hooks {
        stringify,
        fire_timer,
    })
}

/// `caller`, `ctx` and `msg`, as the orchestration layer handed them over.
fn bind_caller(context: &mut Context, request: &EvaluationRequest) -> JsResult<()> {
    let caller = request.caller();
    let caller = JsValue::from_json(&json!({ "id": caller.id, "name": caller.name }), context)?;
    context.register_global_property(js_string!("caller"), caller, Attribute::all())?;

    let data = request.context_data();
    let ctx = JsValue::from_json(data, context)?;
    context.register_global_property(js_string!("ctx"), ctx, Attribute::all())?;

    let msg = match data.get("message") {
        Some(message) => JsValue::from_json(message, context)?,
        None => JsValue::undefined(),
    };
    context.register_global_property(js_string!("msg"), msg, Attribute::all())?;
    Ok(())
}

fn as_function(value: &JsValue) -> Option<JsFunction> {
    value.as_object().cloned().and_then(JsFunction::from_object)
}

fn internal_error(message: &str) -> JsError {
    JsNativeError::typ()
        .with_message(format!("sandbox setup: {message}"))
        .into()
}

// ── Native bindings ──────────────────────────────────────

fn native<F>(function: F) -> NativeFunction
where
    F: Fn(&JsValue, &[JsValue], &mut Context) -> JsResult<JsValue> + 'static,
{
    // SAFETY: every closure passed here captures host-side values only
    // (`Shared`, Arc'd collaborators, a runtime `Handle`); none of them
    // owns a garbage-collected engine value that would need tracing.
    unsafe { NativeFunction::from_closure(function) }
}

fn host_object(context: &mut Context, state: &Shared, setup: &ContextSetup<'_>) -> JsObject {
    let fetcher = setup.capabilities.fetcher();
    let html = setup.capabilities.html();
    let clock = setup.capabilities.clock();

    let log = {
        let state = Rc::clone(state);
        native(move |_, args, context| {
            let level = string_arg(args, 0, context)?;
            let line = string_arg(args, 1, context)?;
            let mut state = state.borrow_mut();
            let (id, caller) = (&state.request_id, &state.caller_id);
            match level.as_str() {
                "error" => error!("[{id} {caller}] console: {line}"),
                "warn" => warn!("[{id} {caller}] console: {line}"),
                "debug" => debug!("[{id} {caller}] console: {line}"),
                _ => info!("[{id} {caller}] console: {line}"),
            }
            state.console.push(line);
            Ok(JsValue::undefined())
        })
    };

    let fetch = {
        let state = Rc::clone(state);
        let fetcher = Arc::clone(&fetcher);
        let runtime = setup.runtime.clone();
        native(move |_, args, context| {
            let url = string_arg(args, 0, context)?;
            let response = blocking_fetch(&state, &runtime, &fetcher, &url)
                .map_err(|e| capability_error(&state, Capability::Fetch, e))?;
            JsValue::from_json(
                &json!({
                    "url": response.url,
                    "status": response.status,
                    "contentType": response.content_type,
                    "body": response.text(),
                }),
                context,
            )
        })
    };

    let html_text = {
        let html = Arc::clone(&html);
        native(move |_, args, context| {
            let raw = string_arg(args, 0, context)?;
            Ok(JsString::from(html.extract_text(&raw).as_str()).into())
        })
    };

    let webscrap = {
        let state = Rc::clone(state);
        let fetcher = Arc::clone(&fetcher);
        let html = Arc::clone(&html);
        let runtime = setup.runtime.clone();
        native(move |_, args, context| {
            let url = string_arg(args, 0, context)?;
            let response = blocking_fetch(&state, &runtime, &fetcher, &url)
                .map_err(|e| capability_error(&state, Capability::Fetch, e))?;
            let text = if is_html(&response.content_type) {
                html.extract_text(&response.text())
            } else {
                response.text()
            };
            Ok(JsString::from(text.as_str()).into())
        })
    };

    let buffer_decode = {
        let state = Rc::clone(state);
        native(move |_, args, context| {
            let text = string_arg(args, 0, context)?;
            let encoding = optional_string_arg(args, 1, context)?;
            let bytes = Encoding::parse(encoding.as_deref())
                .and_then(|encoding| buffer::decode(&text, encoding))
                .map_err(|e| capability_error(&state, Capability::Buffer, e))?;
            JsValue::from_json(&json!(bytes), context)
        })
    };

    let buffer_encode = {
        let state = Rc::clone(state);
        native(move |_, args, context| {
            let bytes = byte_array(args.get_or_undefined(0), context)?;
            let encoding = optional_string_arg(args, 1, context)?;
            let encoding = Encoding::parse(encoding.as_deref())
                .map_err(|e| capability_error(&state, Capability::Buffer, e))?;
            Ok(JsString::from(buffer::encode(&bytes, encoding).as_str()).into())
        })
    };

    let timer_schedule = {
        let state = Rc::clone(state);
        native(move |_, args, context| {
            let delay = args.get_or_undefined(0).to_number(context)?;
            let repeat = args.get_or_undefined(1).to_boolean();
            let delay = if delay.is_finite() && delay > 0.0 {
                Duration::from_millis(delay as u64)
            } else {
                Duration::ZERO
            };
            let scheduled = state
                .borrow_mut()
                .timers
                .schedule(Instant::now(), delay, repeat);
            let id = scheduled.map_err(|e| capability_error(&state, Capability::Timers, e))?;
            Ok(JsValue::from(id))
        })
    };

    let timer_cancel = {
        let state = Rc::clone(state);
        native(move |_, args, context| {
            let id = args.get_or_undefined(0).to_u32(context)?;
            state.borrow_mut().timers.cancel(id);
            Ok(JsValue::undefined())
        })
    };

    let now = native(move |_, _, _| Ok(JsValue::from(clock.now_millis() as f64)));

    let host = ObjectInitializer::new(context)
        .function(log, js_string!("log"), 2)
        .function(fetch, js_string!("fetch"), 1)
        .function(html_text, js_string!("htmlText"), 1)
        .function(webscrap, js_string!("webscrap"), 1)
        .function(buffer_decode, js_string!("bufferDecode"), 2)
        .function(buffer_encode, js_string!("bufferEncode"), 2)
        .function(timer_schedule, js_string!("timerSchedule"), 2)
        .function(timer_cancel, js_string!("timerCancel"), 1)
        .function(now, js_string!("now"), 0)
        .build();
    host
}

/// Runs an async fetch to completion on the host runtime, bounded by the
/// request deadline. Called from the worker thread only.
fn blocking_fetch(
    state: &Shared,
    runtime: &Handle,
    fetcher: &Arc<dyn Fetcher>,
    url: &str,
) -> anyhow::Result<FetchedResponse> {
    let (deadline, abandoned) = {
        let state = state.borrow();
        (state.deadline, state.is_abandoned())
    };
    if abandoned {
        return Err(anyhow::anyhow!("evaluation was abandoned"));
    }

    runtime.block_on(async {
        tokio::time::timeout_at(tokio::time::Instant::from_std(deadline), fetcher.fetch(url))
            .await
            .map_err(|_| anyhow::anyhow!("aborted, evaluation budget exhausted"))?
    })
}

/// Records the fault and builds the `Error` thrown into the script.
fn capability_error(state: &Shared, capability: Capability, error: anyhow::Error) -> JsError {
    let script_message = format!("{capability} failed: {error}");
    let mut state = state.borrow_mut();
    warn!(
        "[{} {}] capability {capability} failed: {error:#}",
        state.request_id, state.caller_id
    );
    state.fault = Some(CapabilityFault {
        capability,
        script_message: script_message.clone(),
        cause: format_chain(&error),
    });
    JsNativeError::error().with_message(script_message).into()
}

fn string_arg(args: &[JsValue], index: usize, context: &mut Context) -> JsResult<String> {
    Ok(args
        .get_or_undefined(index)
        .to_string(context)?
        .to_std_string_escaped())
}

fn optional_string_arg(
    args: &[JsValue],
    index: usize,
    context: &mut Context,
) -> JsResult<Option<String>> {
    let value = args.get_or_undefined(index);
    if value.is_undefined() || value.is_null() {
        return Ok(None);
    }
    Ok(Some(value.to_string(context)?.to_std_string_escaped()))
}

/// Reads an array-like of numbers into bytes (values wrap into 0..=255).
fn byte_array(value: &JsValue, context: &mut Context) -> JsResult<Vec<u8>> {
    let object = value.as_object().cloned().ok_or_else(|| {
        JsError::from(JsNativeError::typ().with_message("expected an array of bytes"))
    })?;
    let length = object.get(js_string!("length"), context)?.to_length(context)?;
    let length = u32::try_from(length)
        .map_err(|_| JsError::from(JsNativeError::range().with_message("buffer too large")))?;

    let mut bytes = Vec::with_capacity(length as usize);
    for index in 0..length {
        let byte = object.get(index, context)?.to_number(context)?;
        bytes.push((byte as i64).rem_euclid(256) as u8);
    }
    Ok(bytes)
}
