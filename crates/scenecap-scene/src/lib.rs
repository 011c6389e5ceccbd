#![warn(missing_docs)]
//! # scenecap-scene
//!
//! ## Purpose
//! The scene detector and frame distributor: the layer that turns a raw
//! per-frame condition evaluation into a debounced open/update/close
//! lifecycle, and fans a single frame stream out across every configured
//! scene of interest.
//!
//! ## Responsibilities
//! - [`SceneDetector`] — wraps a [`scenecap_condition::Condition`] tree,
//!   tracks `Idle -> Active -> Closing -> Idle` transitions, and emits
//!   `begin`/`updated`/`end` events with a debounced close timer.
//! - [`FrameDistributor`] — drives every registered `SceneDetector` from one
//!   incoming frame and optionally forwards frames to an idle sink when no
//!   detector is active.
//!
//! ## Data flow
//! `capture source -> FrameDistributor::update -> SceneDetector::update ->
//! on_scene_begin/on_scene_updated/on_scene_end`. Events are delivered
//! through `scenecap_runtime::Sender` handles the caller supplies at
//! construction, so a detector never holds a reference back to its
//! orchestrator.
//!
//! ## Ownership and lifetimes
//! A `SceneDetector` owns its condition tree and its pending close
//! [`scenecap_runtime::Timer`], if any. Event senders are `Arc<dyn Sender>`
//! handles shared with whatever owns the other end of the connection.
//!
//! ## Error model
//! [`SceneError`] covers the one constructor-time failure: a condition tree
//! with no node tagged `tab_condition`. Once constructed, `update` never
//! fails — any listener panic is the caller's problem, per the distilled
//! spec's "any exception in a listener is fatal" policy.
//!
//! ## Example
//! ```
//! use std::sync::{Arc, Mutex};
//! use scenecap_condition::{Condition, Rule};
//! use scenecap_frame::Frame;
//! use scenecap_geometry::{Anchor, Color, ColorRange, LayoutAnchor, Point};
//! use scenecap_runtime::{DirectConnection, Sender};
//! use scenecap_scene::SceneDetector;
//!
//! let point = |x| Point::new(x, 0.0, Anchor::uniform(LayoutAnchor::ScreenStart));
//! let range = ColorRange::around(Color::new(10, 10, 10), 2);
//! let tab_a = Condition::plain(Rule::PointColor { point: point(0.0), range }, None);
//! let tab_b = Condition::plain(Rule::PointColor { point: point(1.0), range }, None);
//! let tabs = Condition::parallel(Rule::Or, vec![tab_a, tab_b], Some("tab_condition".into()));
//!
//! let begin = DirectConnection::<()>::new();
//! let updated = DirectConnection::<(Frame, usize)>::new();
//! let end = DirectConnection::<()>::new();
//! let seen = Arc::new(Mutex::new(Vec::new()));
//! let seen_in = seen.clone();
//! updated.listen(move |(_frame, index)| seen_in.lock().unwrap().push(index));
//!
//! let mut detector = SceneDetector::new(
//!     tabs, 2.0, 1.0, 0,
//!     begin.clone() as Arc<dyn Sender<()>>,
//!     updated.clone() as Arc<dyn Sender<(Frame, usize)>>,
//!     end.clone() as Arc<dyn Sender<()>>,
//! ).unwrap();
//!
//! let bgr = vec![10, 10, 10, 0, 0, 0];
//! let frame = Frame::new(2, 1, 0, bgr).unwrap();
//! detector.update(frame);
//! assert_eq!(*seen.lock().unwrap(), vec![0]);
//! ```

use std::sync::{Arc, Mutex};

use scenecap_condition::Condition;
use scenecap_frame::{Frame, FrameGeometry};
use scenecap_runtime::{Sender, Timer};

/// Errors constructing a [`SceneDetector`].
#[derive(Debug, thiserror::Error)]
pub enum SceneError {
    /// The supplied condition tree had no node tagged `tab_condition`.
    #[error("condition tree has no node tagged 'tab_condition'")]
    MissingTabCondition,
}

/// The detector's current lifecycle state, per the distilled spec's §3
/// scene lifecycle: `Idle -> Active -> Closing -> Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SceneState {
    /// The scene is not currently visible.
    Idle,
    /// The scene is visible; `begin` has fired and not yet matched by `end`.
    Active,
    /// The scene condition went unmet while active; a debounce timer is
    /// running before `end` fires, unless the condition re-asserts first.
    Closing,
}

/// Wraps a condition tree and emits a debounced `begin`/`updated`/`end`
/// lifecycle as frames are fed in. See the crate docs for the event wiring.
pub struct SceneDetector {
    condition: Condition,
    design_width: f64,
    design_height: f64,
    end_timeout_ms: u64,
    state: SceneState,
    last_met: bool,
    end_timer: Arc<Mutex<Option<Timer>>>,
    on_scene_begin: Arc<dyn Sender<()>>,
    on_scene_updated: Arc<dyn Sender<(Frame, usize)>>,
    on_scene_end: Arc<dyn Sender<()>>,
}

impl SceneDetector {
    /// Builds a detector over `condition`. `design_width`/`design_height`
    /// set the intersection-rectangle aspect ratio used to resolve anchored
    /// geometry (see `scenecap-frame::FrameGeometry`). `end_timeout_ms == 0`
    /// closes immediately on the falling edge instead of debouncing.
    ///
    /// # Errors
    /// Returns [`SceneError::MissingTabCondition`] if no node in `condition`
    /// is tagged `tab_condition`.
    pub fn new(
        condition: Condition,
        design_width: f64,
        design_height: f64,
        end_timeout_ms: u64,
        on_scene_begin: Arc<dyn Sender<()>>,
        on_scene_updated: Arc<dyn Sender<(Frame, usize)>>,
        on_scene_end: Arc<dyn Sender<()>>,
    ) -> Result<Self, SceneError> {
        if condition.find_by_tag("tab_condition").is_none() {
            return Err(SceneError::MissingTabCondition);
        }
        Ok(Self {
            condition,
            design_width,
            design_height,
            end_timeout_ms,
            state: SceneState::Idle,
            last_met: false,
            end_timer: Arc::new(Mutex::new(None)),
            on_scene_begin,
            on_scene_updated,
            on_scene_end,
        })
    }

    /// The detector's current lifecycle state.
    pub fn state(&self) -> SceneState {
        self.state
    }

    /// `true` iff the scene condition is currently met with a unique active
    /// tab (i.e. the detector is `Active`, including the instant it is
    /// about to transition out of `Closing`).
    pub fn met(&self) -> bool {
        self.last_met
    }

    fn cancel_end_timer(&self) -> bool {
        let mut slot = self.end_timer.lock().unwrap();
        if let Some(timer) = slot.take() {
            timer.cancel();
            return timer.has_expired() == Some(false);
        }
        false
    }

    fn start_end_timer(&mut self) {
        self.cancel_end_timer();
        let on_scene_end = self.on_scene_end.clone();
        let timer = Timer::start(
            std::time::Duration::from_millis(self.end_timeout_ms),
            move || on_scene_end.send(()),
            None,
        );
        *self.end_timer.lock().unwrap() = Some(timer);
    }

    /// If a debounce timer has run to expiry (as opposed to being cancelled
    /// by a re-assertion), reconciles `state` back to `Idle`. The timer's
    /// `on_expire` callback runs on its own background thread and only
    /// sends the `end` event; it cannot touch `self`, so the transition
    /// back to `Idle` is applied here, on the next `update`.
    fn reconcile_expired_timer(&mut self) {
        if self.state != SceneState::Closing {
            return;
        }
        let mut slot = self.end_timer.lock().unwrap();
        if let Some(timer) = slot.as_ref() {
            if timer.has_expired() == Some(true) {
                *slot = None;
                drop(slot);
                self.state = SceneState::Idle;
            }
        }
    }

    /// Feeds one frame through the condition tree and advances the
    /// lifecycle state machine, emitting `begin`/`updated`/`end` as
    /// described in the distilled spec's §4.2.
    pub fn update(&mut self, frame: Frame) {
        self.reconcile_expired_timer();

        let geometry = FrameGeometry::build(frame.width(), frame.height(), self.design_width, self.design_height);
        self.condition.update(&frame, &geometry);

        let tab_condition = self
            .condition
            .find_by_tag("tab_condition")
            .expect("tab_condition validated at construction");
        let active_tab = tab_condition.unique_met_child_index();
        let met_now = self.condition.met() && active_tab.is_some();

        if met_now {
            self.cancel_end_timer();
            if self.state == SceneState::Idle {
                self.on_scene_begin.send(());
                tracing::info!("scene begin");
            } else if self.state == SceneState::Closing {
                tracing::debug!("scene close cancelled, re-asserted before timeout");
            }
            self.state = SceneState::Active;
            let tab_index = active_tab.expect("met_now implies Some");
            self.on_scene_updated.send((frame, tab_index));
        } else if self.state == SceneState::Active {
            // Falling edge only: a `Closing` frame that is still unmet does
            // nothing here, so the single debounce timer started below runs
            // to expiry undisturbed instead of being restarted every frame.
            if self.end_timeout_ms == 0 {
                self.state = SceneState::Idle;
                self.on_scene_end.send(());
                tracing::info!("scene end (immediate)");
            } else {
                self.state = SceneState::Closing;
                self.start_end_timer();
                tracing::debug!("scene closing, debounce timer started");
            }
        }

        self.last_met = met_now;
    }
}

/// Fans one incoming frame stream out to every registered [`SceneDetector`].
/// Detectors are assumed mutually exclusive (distilled spec §9's "the spec
/// assumes mutual exclusion") — `FrameDistributor` itself does not enforce
/// this, but exposes [`FrameDistributor::active_count`] so a caller can
/// assert on it in debug builds.
pub struct FrameDistributor {
    detectors: Vec<SceneDetector>,
    on_no_target: Option<Arc<dyn Sender<Frame>>>,
}

impl FrameDistributor {
    /// Builds a distributor over `detectors`. `on_no_target`, if supplied,
    /// receives every frame for which no detector became active.
    pub fn new(detectors: Vec<SceneDetector>, on_no_target: Option<Arc<dyn Sender<Frame>>>) -> Self {
        Self {
            detectors,
            on_no_target,
        }
    }

    /// Number of detectors currently `Active` (including `Closing`, since
    /// the scene is still considered on-screen during debounce).
    pub fn active_count(&self) -> usize {
        self.detectors
            .iter()
            .filter(|d| matches!(d.state(), SceneState::Active | SceneState::Closing))
            .count()
    }

    /// Feeds `frame` to every registered detector. Forwards to the
    /// `on_no_target` sink iff no detector's condition is currently met
    /// after this update.
    pub fn update(&mut self, frame: Frame) {
        let mut has_active = false;
        for detector in self.detectors.iter_mut() {
            detector.update(frame.clone());
            if detector.met() {
                has_active = true;
            }
        }
        if !has_active {
            if let Some(sink) = &self.on_no_target {
                sink.send(frame);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scenecap_condition::Rule;
    use scenecap_geometry::{Anchor, Color, ColorRange, LayoutAnchor, Point};
    use scenecap_runtime::DirectConnection;
    use std::sync::Mutex as StdMutex;

    fn tab_condition() -> Condition {
        let range = ColorRange::around(Color::new(10, 10, 10), 2);
        let point_a = Point::new(0.0, 0.0, Anchor::uniform(LayoutAnchor::ScreenStart));
        let point_b = Point::new(1.0, 0.0, Anchor::uniform(LayoutAnchor::ScreenStart));
        Condition::parallel(
            Rule::Or,
            vec![
                Condition::plain(Rule::PointColor { point: point_a, range }, None),
                Condition::plain(Rule::PointColor { point: point_b, range }, None),
            ],
            Some("tab_condition".into()),
        )
    }

    fn met_frame(timestamp_ms: u64) -> Frame {
        Frame::new(2, 1, timestamp_ms, vec![10, 10, 10, 0, 0, 0]).unwrap()
    }

    fn unmet_frame(timestamp_ms: u64) -> Frame {
        Frame::new(2, 1, timestamp_ms, vec![0, 0, 0, 0, 0, 0]).unwrap()
    }

    struct Harness {
        detector: SceneDetector,
        begins: Arc<StdMutex<u32>>,
        ends: Arc<StdMutex<u32>>,
        updates: Arc<StdMutex<Vec<usize>>>,
    }

    fn harness(end_timeout_ms: u64) -> Harness {
        let begin_conn = DirectConnection::<()>::new();
        let updated_conn = DirectConnection::<(Frame, usize)>::new();
        let end_conn = DirectConnection::<()>::new();

        let begins = Arc::new(StdMutex::new(0u32));
        let begins_in = begins.clone();
        begin_conn.listen(move |_| *begins_in.lock().unwrap() += 1);

        let ends = Arc::new(StdMutex::new(0u32));
        let ends_in = ends.clone();
        end_conn.listen(move |_| *ends_in.lock().unwrap() += 1);

        let updates = Arc::new(StdMutex::new(Vec::new()));
        let updates_in = updates.clone();
        updated_conn.listen(move |(_frame, index)| updates_in.lock().unwrap().push(index));

        let detector = SceneDetector::new(
            tab_condition(),
            2.0,
            1.0,
            end_timeout_ms,
            begin_conn as Arc<dyn Sender<()>>,
            updated_conn as Arc<dyn Sender<(Frame, usize)>>,
            end_conn as Arc<dyn Sender<()>>,
        )
        .unwrap();

        Harness {
            detector,
            begins,
            ends,
            updates,
        }
    }

    #[test]
    fn rejects_condition_without_tab_condition_tag() {
        let untagged = Condition::plain(
            Rule::PointColor {
                point: Point::new(0.0, 0.0, Anchor::uniform(LayoutAnchor::ScreenStart)),
                range: ColorRange::around(Color::new(0, 0, 0), 1),
            },
            None,
        );
        let begin = DirectConnection::<()>::new();
        let updated = DirectConnection::<(Frame, usize)>::new();
        let end = DirectConnection::<()>::new();
        let error = SceneDetector::new(
            untagged,
            1.0,
            1.0,
            0,
            begin as Arc<dyn Sender<()>>,
            updated as Arc<dyn Sender<(Frame, usize)>>,
            end as Arc<dyn Sender<()>>,
        )
        .unwrap_err();
        assert!(matches!(error, SceneError::MissingTabCondition));
    }

    #[test]
    fn immediate_close_emits_end_without_timeout() {
        let mut h = harness(0);
        h.detector.update(met_frame(0));
        assert_eq!(*h.begins.lock().unwrap(), 1);
        h.detector.update(unmet_frame(16));
        assert_eq!(*h.ends.lock().unwrap(), 1);
        assert_eq!(h.detector.state(), SceneState::Idle);
    }

    #[test]
    fn flicker_shorter_than_timeout_does_not_close() {
        // Mirrors scenario E2: a brief unmet dip re-asserts before the
        // debounce timer fires, so exactly one begin and zero ends fire.
        let mut h = harness(1000);
        for ts in (0..500).step_by(16) {
            h.detector.update(met_frame(ts));
        }
        h.detector.update(unmet_frame(500));
        assert_eq!(h.detector.state(), SceneState::Closing);
        std::thread::sleep(std::time::Duration::from_millis(20));
        h.detector.update(met_frame(520));
        assert_eq!(h.detector.state(), SceneState::Active);
        assert_eq!(*h.begins.lock().unwrap(), 1);
        assert_eq!(*h.ends.lock().unwrap(), 0);
    }

    #[test]
    fn debounced_close_fires_end_after_timer_expiry() {
        let mut h = harness(30);
        h.detector.update(met_frame(0));
        h.detector.update(unmet_frame(16));
        assert_eq!(h.detector.state(), SceneState::Closing);
        // Keep feeding steady unmet frames, well inside the timeout spacing,
        // to make sure the debounce timer is started once and left alone
        // rather than restarted on every one of them.
        for ts in (32..80).step_by(16) {
            h.detector.update(unmet_frame(ts));
        }
        assert_eq!(h.detector.state(), SceneState::Closing);
        std::thread::sleep(std::time::Duration::from_millis(80));
        assert_eq!(*h.ends.lock().unwrap(), 1);
    }

    #[test]
    fn reopens_after_a_debounced_close_completes() {
        // A second open/close cycle after the debounce timer has already
        // fired `end` must emit a second `begin`, not be swallowed by a
        // detector stuck in `Closing`.
        let mut h = harness(30);
        h.detector.update(met_frame(0));
        h.detector.update(unmet_frame(16));
        assert_eq!(h.detector.state(), SceneState::Closing);
        std::thread::sleep(std::time::Duration::from_millis(80));
        assert_eq!(*h.ends.lock().unwrap(), 1);

        h.detector.update(met_frame(200));
        assert_eq!(h.detector.state(), SceneState::Active);
        assert_eq!(*h.begins.lock().unwrap(), 2);
        assert_eq!(*h.ends.lock().unwrap(), 1);

        h.detector.update(unmet_frame(216));
        assert_eq!(h.detector.state(), SceneState::Closing);
        std::thread::sleep(std::time::Duration::from_millis(80));
        assert_eq!(*h.ends.lock().unwrap(), 2);
        h.detector.update(unmet_frame(300));
        assert_eq!(h.detector.state(), SceneState::Idle);
    }

    #[test]
    fn updated_carries_the_unique_active_tab_index() {
        let mut h = harness(0);
        h.detector.update(met_frame(0));
        assert_eq!(*h.updates.lock().unwrap(), vec![0]);
    }

    #[test]
    fn frame_distributor_forwards_to_no_target_sink_when_nothing_active() {
        let sink = DirectConnection::<Frame>::new();
        let seen = Arc::new(StdMutex::new(0u32));
        let seen_in = seen.clone();
        sink.listen(move |_| *seen_in.lock().unwrap() += 1);

        let begin = DirectConnection::<()>::new();
        let updated = DirectConnection::<(Frame, usize)>::new();
        let end = DirectConnection::<()>::new();
        let detector = SceneDetector::new(
            tab_condition(),
            2.0,
            1.0,
            0,
            begin as Arc<dyn Sender<()>>,
            updated as Arc<dyn Sender<(Frame, usize)>>,
            end as Arc<dyn Sender<()>>,
        )
        .unwrap();

        let mut distributor = FrameDistributor::new(vec![detector], Some(sink as Arc<dyn Sender<Frame>>));
        distributor.update(unmet_frame(0));
        assert_eq!(*seen.lock().unwrap(), 1);
        assert_eq!(distributor.active_count(), 0);
    }
}
