//! Bounded evaluation sandbox for operator-submitted JavaScript snippets.
//!
//! A snippet runs in a fresh engine context that exposes only the
//! configured capability surface, under a hard wall-clock budget. Its
//! result is rendered inline or spilled to a transient artifact, and every
//! failure comes back in one uniform shape.

pub mod capabilities;
pub mod config;
pub mod output;
pub mod report;
pub mod sandbox;
pub mod service;

pub use capabilities::{Capability, CapabilitySet};
pub use config::Config;
pub use output::{Delivery, OutputPolicy, RenderedOutput};
pub use report::{Failure, FailureKind};
pub use sandbox::{Caller, EvalValue, Evaluation, EvaluationOutcome, EvaluationRequest, Sandbox};
pub use service::EvalService;
