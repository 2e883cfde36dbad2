use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;

use snippet_eval::config::{CapabilitiesConfig, SandboxConfig};
use snippet_eval::sandbox::Isolation;
use snippet_eval::{
    Caller, CapabilitySet, EvalValue, EvaluationOutcome, EvaluationRequest, FailureKind, Sandbox,
};

fn sandbox(max_concurrent: usize) -> Sandbox {
    let config = SandboxConfig {
        max_concurrent,
        worker_path: Some(PathBuf::from(env!("CARGO_BIN_EXE_snippet-eval"))),
        ..SandboxConfig::default()
    };
    let capabilities = Arc::new(CapabilitySet::from_config(&CapabilitiesConfig::default()));
    Sandbox::new(capabilities, config)
}

fn request(code: &str) -> EvaluationRequest {
    EvaluationRequest::new(code, Caller::new("op-1"), json!({}))
}

fn text(value: &str) -> EvaluationOutcome {
    EvaluationOutcome::Success(EvalValue::Text(value.to_string()))
}

#[tokio::test]
async fn test_worker_process_evaluates_and_captures_console() {
    let sandbox = sandbox(2);
    assert_eq!(sandbox.isolation(), Isolation::Process);

    let evaluation = sandbox
        .run(&request("console.log('from the worker');\nreturn 40 + 2;"))
        .await;
    assert_eq!(evaluation.outcome, text("42"));
    assert_eq!(evaluation.console, vec!["from the worker".to_string()]);
}

#[tokio::test]
async fn test_worker_process_reports_thrown_errors() {
    let outcome = sandbox(2)
        .evaluate(&request("throw new TypeError('bad input')"))
        .await;
    match outcome {
        EvaluationOutcome::Failure(failure) => {
            assert_eq!(failure.kind, FailureKind::RuntimeError);
            assert_eq!(failure.message, "bad input");
            assert!(failure.diagnostic.starts_with("TypeError: bad input"));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn test_endless_nested_loop_is_killed_and_slot_reused() {
    let sandbox = sandbox(1);

    let started = Instant::now();
    let outcome = sandbox
        .evaluate_with_timeout(
            &request("for (;;) { for (let i = 0; i < 1000; i++) {} }"),
            Duration::from_millis(500),
        )
        .await;
    assert_eq!(
        outcome,
        EvaluationOutcome::TimedOut {
            budget: Duration::from_millis(500)
        }
    );
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(sandbox.runaway_workers(), 0);

    let started = Instant::now();
    assert_eq!(sandbox.evaluate(&request("1+1")).await, text("2"));
    assert!(started.elapsed() < Duration::from_secs(4));
}
