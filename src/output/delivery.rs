//! Hand-off to the delivery collaborator (chat bridge, stdout, ...).

use anyhow::Result;
use async_trait::async_trait;
use tracing::warn;

use super::{ArtifactRef, RenderedOutput};

/// Transmits rendered output to whoever asked for it.
#[async_trait]
pub trait Delivery: Send + Sync {
    /// Sends plain text. Markup and escaping are the collaborator's job.
    async fn send_text(&self, text: &str) -> Result<()>;

    /// Sends a spilled artifact. The file must not be retained: it is
    /// deleted as soon as this returns.
    async fn send_document(&self, artifact: &ArtifactRef) -> Result<()>;
}

/// Delivers `rendered`, then removes the artifact if there is one,
/// whether or not delivery succeeded.
pub async fn deliver(rendered: RenderedOutput, delivery: &dyn Delivery) -> Result<()> {
    match rendered {
        RenderedOutput::Inline(text) => delivery.send_text(&text).await,
        RenderedOutput::Artifact(artifact) => {
            let sent = delivery.send_document(&artifact).await;
            if let Err(e) = artifact.remove().await {
                warn!("{e:#}");
            }
            sent
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::output::ArtifactStore;

    #[tokio::test]
    async fn test_inline_is_sent_as_text() {
        let delivery = RecordingDelivery::default();
        deliver(RenderedOutput::Inline("2".to_string()), &delivery)
            .await
            .unwrap();
        assert_eq!(delivery.sent(), vec![Sent::Text("2".to_string())]);
    }

    #[tokio::test]
    async fn test_artifact_is_sent_then_removed() {
        let tmp = tempfile::tempdir().unwrap();
        let artifact = ArtifactStore::new(tmp.path())
            .write("output.txt", "full content", 0)
            .await
            .unwrap();
        let path = artifact.path().to_path_buf();

        let delivery = RecordingDelivery::default();
        deliver(RenderedOutput::Artifact(artifact), &delivery)
            .await
            .unwrap();

        assert_eq!(
            delivery.sent(),
            vec![Sent::Document("output.txt".to_string(), "full content".to_string())]
        );
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_artifact_removed_when_delivery_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let artifact = ArtifactStore::new(tmp.path())
            .write("output.txt", "full content", 0)
            .await
            .unwrap();
        let path = artifact.path().to_path_buf();

        let delivery = RecordingDelivery::failing();
        let result = deliver(RenderedOutput::Artifact(artifact), &delivery).await;

        assert!(result.is_err());
        assert_eq!(delivery.sent().len(), 1);
        assert!(!path.exists());
    }
}
