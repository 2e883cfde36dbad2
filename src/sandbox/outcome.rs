use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::report::Failure;

/// Identity of the operator submitting a snippet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    pub id: String,
    pub name: Option<String>,
}

impl Caller {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// One snippet to evaluate, with the caller and the opaque message
/// context handed over by the orchestration layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationRequest {
    code: String,
    caller: Caller,
    context_data: Value,
}

impl EvaluationRequest {
    pub fn new(code: impl Into<String>, caller: Caller, context_data: Value) -> Self {
        Self {
            code: code.into(),
            caller,
            context_data,
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn caller(&self) -> &Caller {
        &self.caller
    }

    pub fn context_data(&self) -> &Value {
        &self.context_data
    }
}

/// A value produced by a snippet, detached from the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EvalValue {
    /// Objects and arrays, canonicalized through `JSON.stringify`
    Structured(Value),
    /// Everything else, in `String(value)` form
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EvaluationOutcome {
    Success(EvalValue),
    Failure(Failure),
    TimedOut { budget: Duration },
}

/// An outcome with what the snippet printed along the way.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub outcome: EvaluationOutcome,
    /// `console.*` lines, in call order
    pub console: Vec<String>,
    /// Wall-clock time from submission to outcome
    pub elapsed: Duration,
}

impl Evaluation {
    pub fn new(outcome: EvaluationOutcome) -> Self {
        Self {
            outcome,
            console: Vec::new(),
            elapsed: Duration::ZERO,
        }
    }
}

impl EvaluationOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, EvaluationOutcome::Success(_))
    }

    /// Folds the outcome into a value or a normalized failure.
    pub fn into_result(self) -> Result<EvalValue, Failure> {
        match self {
            EvaluationOutcome::Success(value) => Ok(value),
            EvaluationOutcome::Failure(failure) => Err(failure),
            EvaluationOutcome::TimedOut { budget } => Err(Failure::timeout(budget)),
        }
    }

    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            EvaluationOutcome::Success(_) => "success",
            EvaluationOutcome::Failure(_) => "failure",
            EvaluationOutcome::TimedOut { .. } => "timed out",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::FailureKind;
    use serde_json::json;

    #[test]
    fn test_request_accessors() {
        let request = EvaluationRequest::new(
            "1+1",
            Caller::new("42").with_name("alice"),
            json!({"chat": 7}),
        );
        assert_eq!(request.code(), "1+1");
        assert_eq!(request.caller().id, "42");
        assert_eq!(request.caller().name.as_deref(), Some("alice"));
        assert_eq!(request.context_data()["chat"], 7);
    }

    #[test]
    fn test_timed_out_folds_into_timeout_failure() {
        let outcome = EvaluationOutcome::TimedOut {
            budget: Duration::from_millis(250),
        };
        assert!(!outcome.is_success());
        let failure = outcome.into_result().unwrap_err();
        assert_eq!(failure.kind, FailureKind::Timeout);
    }

    #[test]
    fn test_evaluation_survives_json() {
        // Worker processes hand evaluations back as JSON
        let evaluation = Evaluation {
            outcome: EvaluationOutcome::Failure(Failure::new(FailureKind::RuntimeError, "boom", "")),
            console: vec!["hi".to_string()],
            elapsed: Duration::from_millis(12),
        };
        let json = serde_json::to_string(&evaluation).unwrap();
        assert_eq!(serde_json::from_str::<Evaluation>(&json).unwrap(), evaluation);
    }

    #[test]
    fn test_success_folds_into_value() {
        let outcome = EvaluationOutcome::Success(EvalValue::Text("2".to_string()));
        assert_eq!(outcome.label(), "success");
        assert_eq!(outcome.into_result().unwrap(), EvalValue::Text("2".to_string()));
    }
}
