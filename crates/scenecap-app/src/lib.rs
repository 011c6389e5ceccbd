#![warn(missing_docs)]
//! # scenecap-app
//!
//! ## Purpose
//! Wires the `scenecap-*` library crates — condition tree, scene detector,
//! frame distributor, scroll-capture engine, stitcher, recognizer contract,
//! and concurrency substrate — into one runnable character-detail capture
//! pipeline, and defines the JSON config a host pushes in and the JSON
//! notifications it gets back out (distilled spec §6).
//!
//! ## Responsibilities
//! - Parse and validate a session's [`Config`] before any runner starts.
//! - Stand up the four-stage runner pipeline through [`Orchestrator::new`]
//!   and accept frames through [`Orchestrator::feed_frame`].
//! - Persist scrape output (fragments, tab-button crops, the base frame) to
//!   disk as it is produced, and hand completed sessions to the stitcher and
//!   recognizer.
//! - Translate internal pipeline events into the [`Notification`] shapes a
//!   host understands.
//!
//! ## Data flow
//! A host decodes frames from its own capture source, builds one [`Config`]
//! and one pair of [`OrchestratorHooks`], and calls [`Orchestrator::new`]
//! once per recording session. Frames pushed through
//! [`Orchestrator::feed_frame`] flow distributor -> scene detector -> scrape
//! engine -> stitcher -> recognizer, each stage on its own worker thread.
//!
//! ## Ownership and lifetimes
//! [`Orchestrator`] owns every runner thread and the live scrape session; it
//! holds no reference back into host state beyond the two `Arc`-wrapped
//! closures in [`OrchestratorHooks`]. Dropping or calling
//! [`Orchestrator::shutdown`] stops and joins every thread in reverse start
//! order.
//!
//! ## Error model
//! Construction is fail-fast and all-or-nothing: [`Orchestrator::new`]
//! returns [`OrchestratorError`] without starting any runner if the scene
//! condition or a page box config is malformed. Once running, per-frame and
//! per-session failures are reported through the host's notify callback as
//! [`Notification::Error`] rather than propagated, so one bad session never
//! kills the pipeline.
//!
//! ## Security and privacy notes
//! This crate writes captured frame content to `scraping_dir`/`storage_dir`
//! as plain PNGs; callers are responsible for any encryption-at-rest or
//! retention policy those directories need. No network I/O happens here —
//! the recognizer hook is the host's to wire to a local model or a remote
//! endpoint.

mod config;
mod notify;
mod orchestrator;
mod persist;

pub use config::{CharaDetailConfig, Config, ConfigError};
pub use notify::Notification;
pub use orchestrator::{scene_state_name, Orchestrator, OrchestratorError, OrchestratorHooks};

/// This crate's version, baked in at build time from the workspace root's
/// `VERSION` file (see `build.rs`).
pub const APP_VERSION: &str = env!("SCENECAP_VERSION");

/// Returns [`APP_VERSION`].
pub fn app_version() -> &'static str {
    APP_VERSION
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_version_is_non_empty() {
        assert!(!app_version().is_empty());
    }
}
