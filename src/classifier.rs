// SPDX-License-Identifier: MIT

//! Classifier client for the external inference service
//!
//! Wraps one HTTP call per cycle to a Roboflow-style detection workflow.
//! Any transport or parse error is surfaced as a distinguishable error; the
//! orchestrator converts it to "no detection" so classification failures
//! never stop archiving or logging.

use async_trait::async_trait;
use reqwest::multipart;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::config::ClassifierConfig;
use crate::{BugwatchError, Result};

/// One ranked prediction from the workflow
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Prediction {
    pub class: String,
    pub confidence: f64,
}

/// Full classification result for one image
#[derive(Debug, Clone, Default)]
pub struct Classification {
    /// Predictions as returned by the service; may be empty
    pub predictions: Vec<Prediction>,
    /// Base64-encoded annotated image (bounding boxes), when the workflow
    /// produces one
    pub annotated_image: Option<String>,
}

impl Classification {
    /// Highest-confidence prediction, or None when nothing was detected
    pub fn best(&self) -> Option<&Prediction> {
        self.predictions
            .iter()
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
    }
}

/// Capability interface the orchestrator depends on
#[async_trait]
pub trait Classify: Send + Sync {
    async fn classify(&self, image: &Path) -> Result<Classification>;
}

/// HTTP client for a Roboflow detection workflow
pub struct RoboflowClient {
    client: reqwest::Client,
    url: String,
}

/// Response body of the workflow endpoint.
///
/// The workflow may answer with the block directly or wrapped in a
/// one-element list; both shapes are accepted.
#[derive(Deserialize)]
#[serde(untagged)]
enum WorkflowResponse {
    Block(WorkflowBlock),
    List(Vec<WorkflowBlock>),
}

#[derive(Deserialize)]
struct WorkflowBlock {
    #[serde(default)]
    predictions: Option<PredictionsField>,
    #[serde(default)]
    output_image: Option<String>,
}

/// The `predictions` key is either the list itself or a nested block
/// carrying the list plus the annotated image.
#[derive(Deserialize)]
#[serde(untagged)]
enum PredictionsField {
    List(Vec<Prediction>),
    Nested {
        #[serde(default)]
        predictions: Vec<Prediction>,
        #[serde(default)]
        output_image: Option<String>,
    },
}

impl RoboflowClient {
    /// Create a new classifier client from configuration
    pub fn new(config: &ClassifierConfig) -> Result<Self> {
        if config.api_key.is_empty() {
            return Err(BugwatchError::Config(
                "classifier.api_key is required".to_string(),
            ));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        let url = format!(
            "{}/{}/{}?api_key={}",
            config.endpoint.trim_end_matches('/'),
            config.workspace,
            config.workflow,
            config.api_key
        );

        Ok(Self { client, url })
    }

    fn parse(body: &str) -> Result<Classification> {
        let response: WorkflowResponse = serde_json::from_str(body)?;
        let block = match response {
            WorkflowResponse::Block(block) => Some(block),
            WorkflowResponse::List(blocks) => blocks.into_iter().next(),
        };

        let Some(block) = block else {
            return Ok(Classification::default());
        };

        let (predictions, nested_image) = match block.predictions {
            Some(PredictionsField::List(list)) => (list, None),
            Some(PredictionsField::Nested {
                predictions,
                output_image,
            }) => (predictions, output_image),
            None => (Vec::new(), None),
        };

        Ok(Classification {
            predictions,
            annotated_image: block.output_image.or(nested_image),
        })
    }
}

#[async_trait]
impl Classify for RoboflowClient {
    async fn classify(&self, image: &Path) -> Result<Classification> {
        let bytes = tokio::fs::read(image).await?;
        let filename = image
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("capture.jpg")
            .to_string();

        debug!("Sending {} ({} bytes) to classifier", filename, bytes.len());

        let form = multipart::Form::new().part(
            "file",
            multipart::Part::bytes(bytes)
                .file_name(filename)
                .mime_str("image/jpeg")
                .map_err(|e| BugwatchError::Classifier(format!("Invalid mime: {}", e)))?,
        );

        let response = self.client.post(&self.url).multipart(form).send().await?;

        if !response.status().is_success() {
            return Err(BugwatchError::Classifier(format!(
                "Classifier returned status {}",
                response.status()
            )));
        }

        let body = response.text().await?;
        let classification = Self::parse(&body)?;
        debug!(
            "Classifier returned {} prediction(s)",
            classification.predictions.len()
        );
        Ok(classification)
    }
}
