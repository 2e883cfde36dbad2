//! Output serializer. Turns a settled value into what gets delivered.
//!
//! Rendered text up to `output.threshold` characters goes inline. Above
//! it, the configured policy applies: `truncate` cuts the text and
//! appends a marker, `spill` writes the full text to an artifact and
//! hands back a reference to it. A result is never both.
//!
//! Console lines the snippet printed go above the result and count
//! toward the threshold like the result itself.

pub mod artifact;
pub mod delivery;

use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::config::OutputConfig;
use crate::report::{Failure, FailureKind};
use crate::sandbox::EvalValue;

pub use artifact::{ArtifactRef, ArtifactStore};
pub use delivery::{deliver, Delivery};

/// Shown instead of an empty rendered result.
pub const EMPTY_RESULT: &str = "(empty result)";

/// What to do with output above the inline threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputPolicy {
    /// Cut at the threshold and append a truncation marker
    Truncate,
    /// Write the full text to an artifact
    #[default]
    Spill,
}

#[derive(Debug)]
pub enum RenderedOutput {
    Inline(String),
    Artifact(ArtifactRef),
}

impl RenderedOutput {
    pub fn is_inline(&self) -> bool {
        matches!(self, RenderedOutput::Inline(_))
    }
}

pub struct OutputSerializer {
    config: OutputConfig,
    store: ArtifactStore,
}

impl OutputSerializer {
    pub fn new(config: OutputConfig) -> Self {
        let store = ArtifactStore::new(config.artifact_dir.clone());
        Self { config, store }
    }

    pub fn config(&self) -> &OutputConfig {
        &self.config
    }

    /// Canonical text of a value: pretty JSON for structured values,
    /// the string form otherwise.
    pub fn render_text(value: &EvalValue) -> String {
        let text = match value {
            EvalValue::Structured(json) => {
                serde_json::to_string_pretty(json).unwrap_or_else(|_| json.to_string())
            }
            EvalValue::Text(text) => text.clone(),
        };
        if text.is_empty() {
            EMPTY_RESULT.to_string()
        } else {
            text
        }
    }

    /// Renders a successful value according to the output policy.
    pub async fn render(&self, value: &EvalValue) -> Result<RenderedOutput, Failure> {
        self.render_output(Self::render_text(value)).await
    }

    /// Renders a value together with the console lines printed while
    /// producing it, and the evaluation time when `show_elapsed` is set.
    pub async fn render_with(
        &self,
        value: &EvalValue,
        console: &[String],
        elapsed: Duration,
    ) -> Result<RenderedOutput, Failure> {
        self.render_output(self.compose(value, console, elapsed)).await
    }

    pub fn compose(&self, value: &EvalValue, console: &[String], elapsed: Duration) -> String {
        let mut sections = Vec::with_capacity(3);
        if self.config.show_console && !console.is_empty() {
            sections.push(console.join("\n"));
        }
        sections.push(Self::render_text(value));
        if self.config.show_elapsed {
            sections.push(format!("({} ms)", elapsed.as_millis()));
        }
        sections.join("\n")
    }

    async fn render_output(&self, text: String) -> Result<RenderedOutput, Failure> {
        let length = text.chars().count();
        if length <= self.config.threshold {
            return Ok(RenderedOutput::Inline(text));
        }

        match self.config.policy {
            OutputPolicy::Truncate => {
                debug!("Truncating {length} chars of output");
                Ok(RenderedOutput::Inline(truncate(&text, self.config.threshold)))
            }
            OutputPolicy::Spill => self
                .store
                .write(&self.config.artifact_filename, &text, self.config.preview_chars)
                .await
                .map(RenderedOutput::Artifact)
                .map_err(|e| Failure::host(FailureKind::CapabilityError, &e)),
        }
    }

    /// Failure reports always go inline, truncated to the threshold.
    pub fn render_failure(&self, failure: &Failure) -> String {
        truncate(&failure.user_text(), self.config.threshold)
    }
}

/// Cuts `text` so that, marker included, it fits in `threshold` characters.
pub fn truncate(text: &str, threshold: usize) -> String {
    if text.chars().count() <= threshold {
        return text.to_string();
    }
    let marker = format!("\n[Output truncated at {threshold} characters]");
    let keep = threshold.saturating_sub(marker.chars().count());
    let mut truncated: String = text.chars().take(keep).collect();
    truncated.push_str(&marker);
    if keep == 0 {
        // Threshold smaller than the marker itself
        truncated = truncated.chars().take(threshold).collect();
    }
    truncated
}
