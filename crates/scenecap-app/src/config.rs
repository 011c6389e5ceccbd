//! Session configuration: the JSON document pushed once at session start
//! (distilled spec §6 "Config").

use std::path::PathBuf;

use scenecap_condition::{Condition, ConditionError};
use scenecap_recognizer_contract::RecognizerConfig;
use scenecap_scrape::SceneScraperConfig;
use scenecap_stitch::StitcherConfig;
use serde::Deserialize;
use thiserror::Error;

fn default_end_timeout_ms() -> u64 {
    1000
}

/// Errors loading a [`Config`] from JSON.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The top-level document did not match the expected shape.
    #[error("malformed config JSON: {0}")]
    Malformed(#[from] serde_json::Error),
    /// `chara_detail.scene_context` was not a well-formed condition tree.
    #[error("malformed scene_context condition: {0}")]
    MalformedCondition(#[from] ConditionError),
}

/// The `chara_detail` sub-document: the only scene this core understands.
#[derive(Debug, Clone, Deserialize)]
pub struct CharaDetailConfig {
    /// The scene-visible condition tree, in the self-describing JSON wire
    /// form documented by `scenecap_condition::Condition`.
    pub scene_context: serde_json::Value,
    /// Milliseconds the scene condition may stay unmet before `end` fires,
    /// per distilled spec §4.2. Defaults to `1000`, matching the host's
    /// hardcoded legacy timeout when the field is omitted.
    #[serde(default = "default_end_timeout_ms")]
    pub end_timeout_ms: u64,
    /// Per-tab and base-frame scraping tuning.
    pub scene_scraper: SceneScraperConfig,
    /// Per-tab stitching layout.
    pub scene_stitcher: StitcherConfig,
    /// Opaque predictor tuning.
    #[serde(default)]
    pub recognizer: RecognizerConfig,
    /// Directory fragments/tab-button crops/base frame are written under,
    /// one subdirectory per session UUID.
    pub scraping_dir: PathBuf,
}

/// The full session config, pushed once at `startEventLoop` (distilled spec
/// §6). `platform` is host-specific and opaque to the core.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Selects [`scenecap_runtime::OverflowPolicy::Block`] (video file
    /// playback, drop nothing) vs `Discard` (live capture, bounded
    /// latency) for every queued connection the orchestrator wires.
    pub video_mode: bool,
    /// Opaque model/trainer identifier forwarded to the recognizer.
    pub trainer_id: String,
    /// Directory containing the trained model files.
    pub module_dir: PathBuf,
    /// Directory stitched per-tab images are written under.
    pub storage_dir: PathBuf,
    /// The character-detail scene configuration.
    pub chara_detail: CharaDetailConfig,
    /// Host-specific configuration, untouched by the core.
    #[serde(default)]
    pub platform: serde_json::Value,
}

impl Config {
    /// Parses a [`Config`] from a raw JSON document.
    ///
    /// # Errors
    /// Returns [`ConfigError::Malformed`] if the document does not match
    /// the expected shape, or [`ConfigError::MalformedCondition`] if
    /// `chara_detail.scene_context` is not a valid condition tree.
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(raw)?;
        // Eagerly validate the condition tree so a malformed scene_context
        // fails at load time rather than on the first frame (distilled
        // spec §7 "ConfigError ... fatal at session start; no partial
        // start").
        Condition::from_json_value(config.chara_detail.scene_context.clone())?;
        Ok(config)
    }

    /// Parses the validated scene-context condition tree. Cheap to call
    /// repeatedly since [`Config::from_json_str`] already validated the
    /// JSON once; this is the orchestrator's chance to build the owned
    /// `Condition` it drives frames through.
    pub(crate) fn scene_condition(&self) -> Result<Condition, ConditionError> {
        Condition::from_json_value(self.chara_detail.scene_context.clone())
    }
}
