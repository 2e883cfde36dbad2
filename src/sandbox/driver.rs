//! Run loop for one compiled unit inside its execution context.
//!
//! Runs on the worker thread. The host side only ever sees the final
//! [`EvaluationOutcome`]; engine values never leave this module.

use std::time::Instant;

use boa_engine::builtins::promise::PromiseState;
use boa_engine::object::builtins::JsPromise;
use boa_engine::{JsError, JsValue};
use tracing::debug;

use super::compile::compile;
use super::context::ExecutionContext;
use super::outcome::{EvalValue, EvaluationOutcome};
use crate::report::{display_value, Failure, FailureKind};

/// Why the run loop stopped before the result settled.
enum Interrupted {
    Failed(Failure),
    OutOfTime,
}

impl From<Failure> for Interrupted {
    fn from(failure: Failure) -> Self {
        Interrupted::Failed(failure)
    }
}

/// Compiles and runs `code`, awaiting it if it produced a Promise.
pub(crate) fn run(exec: &mut ExecutionContext, code: &str, max_code_size: usize) -> EvaluationOutcome {
    let unit = match compile(code, max_code_size, &mut exec.context) {
        Ok(unit) => unit,
        Err(failure) => return EvaluationOutcome::Failure(failure),
    };
    debug!("[{}] compiled as {:?}", exec.request_id(), unit.form());

    let settled = match unit.evaluate(&mut exec.context) {
        Ok(value) => settle(exec, value),
        Err(error) => Err(Interrupted::Failed(runtime_failure(exec, error))),
    };

    // Whatever is still scheduled dies with the result
    exec.state.borrow_mut().timers.clear();

    match settled {
        Ok(value) => match convert(exec, value) {
            Ok(value) => EvaluationOutcome::Success(value),
            Err(failure) => EvaluationOutcome::Failure(failure),
        },
        Err(Interrupted::Failed(failure)) => EvaluationOutcome::Failure(failure),
        Err(Interrupted::OutOfTime) => EvaluationOutcome::TimedOut {
            budget: exec.budget,
        },
    }
}

fn settle(exec: &mut ExecutionContext, value: JsValue) -> Result<JsValue, Interrupted> {
    let promise = value
        .as_object()
        .cloned()
        .and_then(|object| JsPromise::from_object(object).ok());
    match promise {
        Some(promise) => await_promise(exec, &promise),
        None => Ok(value),
    }
}

fn await_promise(exec: &mut ExecutionContext, promise: &JsPromise) -> Result<JsValue, Interrupted> {
    loop {
        exec.context.run_jobs();

        match promise.state() {
            PromiseState::Fulfilled(value) => return Ok(value),
            PromiseState::Rejected(reason) => {
                let error = JsError::from_opaque(reason);
                return Err(runtime_failure(exec, error).into());
            }
            PromiseState::Pending => {}
        }

        let deadline = exec.deadline();
        if exec.is_abandoned() || Instant::now() >= deadline {
            return Err(Interrupted::OutOfTime);
        }

        let next_due = exec.state.borrow().timers.next_due();
        let Some(next_due) = next_due else {
            return Err(Failure::new(
                FailureKind::RuntimeError,
                "the snippet's promise never settled",
                "",
            )
            .into());
        };

        let now = Instant::now();
        if next_due > now {
            std::thread::sleep(next_due.min(deadline) - now);
            continue;
        }

        let due = exec.state.borrow_mut().timers.pop_due(now);
        if let Some(id) = due {
            fire_timer(exec, id)?;
        }
    }
}

fn fire_timer(exec: &mut ExecutionContext, id: u32) -> Result<(), Interrupted> {
    let Some(hook) = exec.fire_timer.clone() else {
        return Ok(());
    };
    match hook.call(&JsValue::undefined(), &[JsValue::from(id)], &mut exec.context) {
        Ok(_) => Ok(()),
        Err(error) => Err(runtime_failure(exec, error).into()),
    }
}

/// Normalizes an uncaught script error. A fault recorded by a capability
/// with the same message is reported as a capability failure.
fn runtime_failure(exec: &mut ExecutionContext, error: JsError) -> Failure {
    let failure = Failure::from_js_error(FailureKind::RuntimeError, &error, &mut exec.context);
    let fault = exec.state.borrow_mut().fault.take();
    match fault {
        Some(fault) if fault.script_message == failure.message => {
            Failure::capability(fault.capability, &fault.script_message, &fault.cause)
        }
        _ => failure,
    }
}

/// Detaches a settled value from the engine.
fn convert(exec: &mut ExecutionContext, value: JsValue) -> Result<EvalValue, Failure> {
    if value.is_null() {
        return Ok(EvalValue::Structured(serde_json::Value::Null));
    }

    let is_plain_object = value.as_object().is_some_and(|object| !object.is_callable());
    if is_plain_object {
        let stringify = exec.stringify.clone();
        // Cycles and BigInt make stringify throw; those fall back to String(value)
        if let Ok(json) = stringify.call(&JsValue::undefined(), &[value.clone()], &mut exec.context) {
            if let Some(json) = json.as_string() {
                let json = json.to_std_string_escaped();
                return serde_json::from_str(&json)
                    .map(EvalValue::Structured)
                    .map_err(|e| Failure::host(FailureKind::RuntimeError, &e.into()));
            }
        }
    }

    let text = match value.to_string(&mut exec.context) {
        Ok(text) => text.to_std_string_escaped(),
        Err(_) => display_value(&value),
    };
    Ok(EvalValue::Text(text))
}
