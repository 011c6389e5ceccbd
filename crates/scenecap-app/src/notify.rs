//! The notification JSON shapes delivered on the host's notify callback
//! (distilled spec §6 "Notifications out").

use serde::Serialize;

/// One notification the orchestrator delivers to the host. Serializes to
/// the exact `{"type": "...", ...}` shapes named in distilled spec §6.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum Notification {
    /// The host's capture source has started. Emitted by explicit host
    /// call, not inferred from frame traffic — capture lifecycle is the
    /// user-facing command channel, out of this core's scope.
    #[serde(rename = "onCaptureStarted")]
    CaptureStarted,
    /// The host's capture source has stopped.
    #[serde(rename = "onCaptureStopped")]
    CaptureStopped,
    /// The character-detail scene became visible (scene detector `begin`).
    #[serde(rename = "onCharaDetailStarted")]
    CharaDetailStarted,
    /// A tab's first fragment was captured; the user may now scroll.
    #[serde(rename = "onScrollReady")]
    ScrollReady {
        /// Tab index, `0|1|2`.
        index: usize,
    },
    /// A new fragment was appended while scrolling a tab.
    #[serde(rename = "onScrollUpdated")]
    ScrollUpdated {
        /// Tab index, `0|1|2`.
        index: usize,
        /// Fraction of scan checkpoints consumed so far, in `[0, 1]`.
        progress: f64,
    },
    /// Every scan checkpoint for a tab has been consumed.
    #[serde(rename = "onPageReady")]
    PageReady {
        /// Tab index, `0|1|2`.
        index: usize,
    },
    /// The session reached a terminal state: `success = true` after
    /// stitching and recognition, `false` if the scene closed before every
    /// page completed.
    #[serde(rename = "onCharaDetailFinished")]
    CharaDetailFinished {
        /// The session's UUIDv4 identifier.
        id: String,
        /// `true` iff the session completed and was recognized.
        success: bool,
    },
    /// A recoverable failure surfaced at a runner's event boundary
    /// (distilled spec §7 "each runner catches exceptions... and emits
    /// `onError`, then continues").
    #[serde(rename = "onError")]
    Error {
        /// Human-readable failure description.
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_started_serializes_to_bare_type_tag() {
        let json = serde_json::to_value(Notification::CaptureStarted).unwrap();
        assert_eq!(json, serde_json::json!({"type": "onCaptureStarted"}));
    }

    #[test]
    fn scroll_updated_serializes_with_fields() {
        let json = serde_json::to_value(Notification::ScrollUpdated { index: 1, progress: 0.5 }).unwrap();
        assert_eq!(json, serde_json::json!({"type": "onScrollUpdated", "index": 1, "progress": 0.5}));
    }

    #[test]
    fn chara_detail_finished_serializes_with_fields() {
        let json = serde_json::to_value(Notification::CharaDetailFinished {
            id: "abc".to_string(),
            success: true,
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"type": "onCharaDetailFinished", "id": "abc", "success": true}));
    }
}
