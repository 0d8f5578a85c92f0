//! OCR provider contract

use crate::entities::{NoteImage, OcrResult};
use crate::error::ConnectorResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Options forwarded to the OCR engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OcrOptions {
    /// BCP-47 language hint
    pub language: String,
    /// Ask the engine for handwriting-tuned models
    pub handwriting: bool,
    /// Drop blocks below this confidence
    pub min_confidence: f32,
}

impl Default for OcrOptions {
    fn default() -> Self {
        Self {
            language: "en".to_string(),
            handwriting: true,
            min_confidence: 0.2,
        }
    }
}

/// Text recognition engine
///
/// Implementations may answer synchronously or poll a vendor job handle
/// internally; either way the call resolves to the final result.
#[async_trait]
pub trait OcrProvider: Send + Sync {
    /// Recognize text blocks in one image
    async fn process(&self, image: &NoteImage, options: &OcrOptions) -> ConnectorResult<OcrResult>;
}
