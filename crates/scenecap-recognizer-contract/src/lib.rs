#![warn(missing_docs)]
//! # scenecap-recognizer-contract
//!
//! ## Purpose
//! The wire contract between the stitcher's output and the opaque ML
//! predictor that turns a stitched tab image into a `(label, confidence)`
//! prediction. The predictor itself is out of scope here; this crate only
//! defines and validates the request/response shape that crosses that
//! boundary.
//!
//! ## Responsibilities
//! - Describe a recognize request: which session, which trainer/model
//!   directory, and which stitched tab images to run.
//! - Parse and validate a recognize response keyed by tab name.
//!
//! ## Data flow
//! Stitched PNGs -> [`RecognizeRequest`] -> (external predictor, opaque) ->
//! raw JSON -> [`parse_recognize_response`] -> [`RecognizeResponse`].
//!
//! ## Error model
//! Invalid JSON or a response missing mandatory fields returns
//! [`RecognizerError`].

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Per-session recognizer configuration, pushed as part of the session
/// config's `chara_detail.recognizer` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognizerConfig {
    /// Minimum confidence a prediction must carry to be treated as usable;
    /// predictions below this are still reported, just not acted on by the
    /// orchestrator's completion notification.
    #[serde(default = "default_score_threshold")]
    pub score_threshold: f32,
}

fn default_score_threshold() -> f32 {
    0.0
}

impl Default for RecognizerConfig {
    fn default() -> Self {
        Self {
            score_threshold: default_score_threshold(),
        }
    }
}

/// A request to recognize every stitched tab image of one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognizeRequest {
    /// Session identifier, echoed back in the response.
    pub session_id: String,
    /// Opaque trainer/model identifier selecting which model to run.
    pub trainer_id: String,
    /// Directory containing the trained model files.
    pub module_dir: PathBuf,
    /// Stitched tab image paths, keyed by tab name.
    pub tab_images: BTreeMap<String, PathBuf>,
}

/// A single prediction: an opaque label and the predictor's confidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    /// Predicted label. Opaque to this crate; the predictor defines its own
    /// label vocabulary.
    pub label: String,
    /// Confidence score in `[0.0, 1.0]`.
    pub confidence: f32,
}

/// The predictor's response to one [`RecognizeRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognizeResponse {
    /// Session identifier this response answers.
    pub session_id: String,
    /// One prediction per tab that was requested.
    #[serde(default)]
    pub predictions: BTreeMap<String, Prediction>,
}

/// Parses and validates a raw JSON recognize response.
///
/// # Errors
/// Returns [`RecognizerError::Decode`] for invalid JSON, or
/// [`RecognizerError::InvalidContract`] when `session_id` is blank.
pub fn parse_recognize_response(raw: &str) -> Result<RecognizeResponse, RecognizerError> {
    let parsed: RecognizeResponse = serde_json::from_str(raw).map_err(RecognizerError::Decode)?;

    if parsed.session_id.trim().is_empty() {
        return Err(RecognizerError::InvalidContract("session_id is empty".to_string()));
    }

    for (tab, prediction) in &parsed.predictions {
        if !(0.0..=1.0).contains(&prediction.confidence) {
            return Err(RecognizerError::InvalidContract(format!(
                "tab {tab} confidence {} out of [0.0, 1.0]",
                prediction.confidence
            )));
        }
    }

    Ok(parsed)
}

/// Recognizer contract errors.
#[derive(Debug, Error)]
pub enum RecognizerError {
    /// JSON decode failure.
    #[error("recognize response decode failure: {0}")]
    Decode(#[from] serde_json::Error),
    /// Parsed payload violates contract invariants.
    #[error("recognize response contract violation: {0}")]
    InvalidContract(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_response() {
        let raw = r#"{
            "session_id": "abc-123",
            "predictions": {
                "skill": {"label": "speed_up", "confidence": 0.92}
            }
        }"#;
        let response = parse_recognize_response(raw).expect("valid response parses");
        assert_eq!(response.session_id, "abc-123");
        assert_eq!(response.predictions["skill"].label, "speed_up");
    }

    #[test]
    fn rejects_blank_session_id() {
        let raw = r#"{"session_id": "", "predictions": {}}"#;
        let error = parse_recognize_response(raw).unwrap_err();
        assert!(matches!(error, RecognizerError::InvalidContract(_)));
    }

    #[test]
    fn rejects_out_of_range_confidence() {
        let raw = r#"{
            "session_id": "abc-123",
            "predictions": {"skill": {"label": "x", "confidence": 1.5}}
        }"#;
        let error = parse_recognize_response(raw).unwrap_err();
        assert!(matches!(error, RecognizerError::InvalidContract(_)));
    }

    #[test]
    fn default_score_threshold_is_zero() {
        assert_eq!(RecognizerConfig::default().score_threshold, 0.0);
    }
}
