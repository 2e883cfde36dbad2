use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info, warn};

use crate::capabilities::CapabilitySet;
use crate::config::Config;
use crate::output::{deliver, Delivery, OutputSerializer, RenderedOutput};
use crate::report::Failure;
use crate::sandbox::{Evaluation, EvaluationRequest, Sandbox};

/// Reply to a request with nothing to run.
pub const NO_CODE_REPLY: &str = "No code to evaluate!";

/// Evaluation service, the facade the chat bridge talks to.
///
/// Checks the caller against the operator list, runs the snippet in the
/// sandbox, renders the outcome and hands it to the delivery collaborator.
pub struct EvalService {
    config: Config,
    sandbox: Sandbox,
    output: OutputSerializer,
    start_time: std::time::Instant,
}

impl EvalService {
    pub fn new(config: Config, capabilities: Arc<CapabilitySet>) -> Self {
        let sandbox = Sandbox::new(capabilities, config.sandbox.clone());
        let output = OutputSerializer::new(config.output.clone());
        Self {
            config,
            sandbox,
            output,
            start_time: std::time::Instant::now(),
        }
    }

    /// Builds the service with the real host collaborators.
    pub fn from_config(config: Config) -> Self {
        let capabilities = Arc::new(CapabilitySet::from_config(&config.capabilities));
        Self::new(config, capabilities)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    /// Runs a snippet and renders its result, without delivering it.
    pub async fn evaluate(&self, request: &EvaluationRequest) -> Result<RenderedOutput, Failure> {
        let Evaluation {
            outcome,
            console,
            elapsed,
        } = self.sandbox.run(request).await;
        let value = outcome.into_result()?;
        self.output.render_with(&value, &console, elapsed).await
    }

    /// Handles one request end to end. Returns `false` when the caller is
    /// not an operator and the request was ignored.
    pub async fn handle(&self, request: &EvaluationRequest, delivery: &dyn Delivery) -> Result<bool> {
        let caller = &request.caller().id;
        if !self.config.is_allowed(caller) {
            warn!("Unauthorized evaluation request from {caller}, ignoring");
            return Ok(false);
        }

        if request.code().trim().is_empty() {
            delivery.send_text(NO_CODE_REPLY).await?;
            return Ok(true);
        }

        let rendered = match self.evaluate(request).await {
            Ok(rendered) => rendered,
            Err(failure) => {
                error!("Evaluation for {caller} failed: {failure}");
                RenderedOutput::Inline(self.output.render_failure(&failure))
            }
        };

        deliver(rendered, delivery).await?;
        Ok(true)
    }

    /// One-paragraph status overview, for startup logs and status commands.
    pub fn status(&self) -> String {
        let uptime = self.start_time.elapsed();
        let hours = uptime.as_secs() / 3600;
        let minutes = (uptime.as_secs() % 3600) / 60;

        format!(
            "snippet-eval {} status\n\
             Uptime: {hours}h {minutes}m\n\
             Budget: {} ms, {} concurrent, {} isolation\n\
             Output: {}\n\
             Capabilities: {}",
            env!("CARGO_PKG_VERSION"),
            self.config.sandbox.timeout_ms,
            self.config.sandbox.max_concurrent,
            self.sandbox.isolation(),
            self.config.output.policy_description(),
            self.sandbox.capabilities().describe(),
        )
    }

    pub fn log_startup(&self) {
        for line in self.status().lines() {
            info!("{line}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::testing::{fake_capabilities, StaticFetcher};
    use crate::config::{OperatorsConfig, OutputConfig};
    use crate::output::delivery::testing::{RecordingDelivery, Sent};
    use crate::sandbox::Caller;
    use serde_json::json;

    fn service(artifact_dir: &std::path::Path) -> EvalService {
        let config = Config {
            output: OutputConfig {
                artifact_dir: artifact_dir.to_path_buf(),
                ..OutputConfig::default()
            },
            operators: OperatorsConfig {
                allowed: vec!["op-1".to_string()],
            },
            ..Config::default()
        };
        EvalService::new(config, fake_capabilities(StaticFetcher::default()))
    }

    fn request(caller: &str, code: &str) -> EvaluationRequest {
        EvaluationRequest::new(code, Caller::new(caller), json!({}))
    }

    fn files_in(dir: &std::path::Path) -> usize {
        std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
    }

    #[tokio::test]
    async fn test_evaluate_inline() {
        let tmp = tempfile::tempdir().unwrap();
        let rendered = service(tmp.path()).evaluate(&request("op-1", "1+1")).await.unwrap();
        assert!(matches!(rendered, RenderedOutput::Inline(ref s) if s == "2"));
    }

    #[tokio::test]
    async fn test_evaluate_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let failure = service(tmp.path())
            .evaluate(&request("op-1", "throw 'boom'"))
            .await
            .unwrap_err();
        assert!(failure.kind.is_runtime());
        assert_eq!(failure.message, "boom");
    }

    #[tokio::test]
    async fn test_handle_delivers_text() {
        let tmp = tempfile::tempdir().unwrap();
        let delivery = RecordingDelivery::default();
        let handled = service(tmp.path())
            .handle(&request("op-1", "[1, 2].map(x => x * 2)"), &delivery)
            .await
            .unwrap();
        assert!(handled);
        assert_eq!(delivery.sent(), vec![Sent::Text("[\n  2,\n  4\n]".to_string())]);
    }

    #[tokio::test]
    async fn test_handle_spills_large_output_and_cleans_up() {
        let tmp = tempfile::tempdir().unwrap();
        let delivery = RecordingDelivery::default();
        service(tmp.path())
            .handle(&request("op-1", "'z'.repeat(5000)"), &delivery)
            .await
            .unwrap();

        match delivery.sent().as_slice() {
            [Sent::Document(filename, content)] => {
                assert_eq!(filename, "output.txt");
                assert_eq!(content, &"z".repeat(5000));
            }
            other => panic!("unexpected deliveries {other:?}"),
        }
        assert_eq!(files_in(tmp.path()), 0);
    }

    #[tokio::test]
    async fn test_handle_cleans_up_when_delivery_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let delivery = RecordingDelivery::failing();
        let result = service(tmp.path())
            .handle(&request("op-1", "'z'.repeat(5000)"), &delivery)
            .await;
        assert!(result.is_err());
        assert_eq!(files_in(tmp.path()), 0);
    }

    #[tokio::test]
    async fn test_handle_reports_failure_inline() {
        let tmp = tempfile::tempdir().unwrap();
        let delivery = RecordingDelivery::default();
        service(tmp.path())
            .handle(&request("op-1", "throw new Error('boom')"), &delivery)
            .await
            .unwrap();
        match delivery.sent().as_slice() {
            [Sent::Text(text)] => assert!(text.starts_with("RuntimeError: boom\nError: boom")),
            other => panic!("unexpected deliveries {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_handle_prints_console_before_result() {
        let tmp = tempfile::tempdir().unwrap();
        let delivery = RecordingDelivery::default();
        service(tmp.path())
            .handle(
                &request("op-1", "console.log('fetching'); console.warn('slow'); 40 + 2"),
                &delivery,
            )
            .await
            .unwrap();
        assert_eq!(delivery.sent(), vec![Sent::Text("fetching\nslow\n42".to_string())]);
    }

    #[tokio::test]
    async fn test_handle_empty_code() {
        let tmp = tempfile::tempdir().unwrap();
        let delivery = RecordingDelivery::default();
        service(tmp.path())
            .handle(&request("op-1", "   "), &delivery)
            .await
            .unwrap();
        assert_eq!(delivery.sent(), vec![Sent::Text(NO_CODE_REPLY.to_string())]);
    }

    #[tokio::test]
    async fn test_handle_ignores_unauthorized_caller() {
        let tmp = tempfile::tempdir().unwrap();
        let delivery = RecordingDelivery::default();
        let handled = service(tmp.path())
            .handle(&request("stranger", "1+1"), &delivery)
            .await
            .unwrap();
        assert!(!handled);
        assert!(delivery.sent().is_empty());
    }

    #[test]
    fn test_status_mentions_policy_and_capabilities() {
        let tmp = tempfile::tempdir().unwrap();
        let status = service(tmp.path()).status();
        assert!(status.contains("spill above 1000 chars"));
        assert!(status.contains("fetch"));
        assert!(status.contains("5000 ms"));
        // Injected capabilities stay in-process
        assert!(status.contains("thread isolation"));
    }
}
