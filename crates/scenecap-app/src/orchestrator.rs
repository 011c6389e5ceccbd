//! Wires the library crates into one runnable capture pipeline (distilled
//! spec §4.8 "Orchestrator"). Built as an owned, constructor-injected value
//! rather than the original's global singleton with mutable callback slots
//! — an explicit redesign, see `DESIGN.md`.
//!
//! Four [`SingleThreadRunner`]s, added to one [`RunnerController`] in the
//! order frames flow through them, so teardown (reverse order) drains the
//! recognizer before the stitcher, the stitcher before the scraper, and the
//! scraper before the distributor stops accepting new frames:
//!
//! ```text
//! feed_frame -> distributor -> [scene detector] -> scraper -> stitcher -> recognizer
//! ```

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use scenecap_frame::Frame;
use scenecap_recognizer_contract::{parse_recognize_response, RecognizeRequest, RecognizerError};
use scenecap_runtime::{
    DirectConnection, OverflowPolicy, QueuedConnection, RunnerController, RuntimeError, Sender, SingleThreadRunner,
};
use scenecap_scene::{FrameDistributor, SceneDetector, SceneError, SceneState};
use scenecap_scrape::{Fragment, ScrapeError, ScrapeEvent, SceneScraper};
use thiserror::Error;
use uuid::Uuid;

use crate::config::Config;
use crate::notify::Notification;
use crate::persist;

/// Host-supplied callbacks the orchestrator cannot provide itself: emitting
/// notifications across whatever boundary the host exposes (UI, FFI, IPC),
/// and invoking the trained recognizer, which distilled spec §1 explicitly
/// places out of this core's scope.
pub struct OrchestratorHooks {
    /// Invoked once per [`Notification`], synchronously on whichever runner
    /// thread produced it. Must not block for long — it runs inline with
    /// the pipeline's own worker threads.
    pub on_notify: Arc<dyn Fn(Notification) + Send + Sync>,
    /// Invoked with a populated [`RecognizeRequest`] once a session's three
    /// tab images are stitched. Returns the raw JSON response body the
    /// trained model produced, later parsed with
    /// [`scenecap_recognizer_contract::parse_recognize_response`].
    pub recognize: Arc<dyn Fn(RecognizeRequest) -> Result<String, RecognizerError> + Send + Sync>,
}

/// Errors standing up the orchestrator's detector and runners. Per
/// distilled spec §7, construction is all-or-nothing: an `Err` here
/// guarantees no runner was started.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// `chara_detail.scene_context` has no `tab_condition`-tagged node.
    #[error("scene detector setup failed: {0}")]
    Scene(#[from] SceneError),
    /// A page box's offset-estimator config was invalid.
    #[error("scrape setup failed: {0}")]
    Scrape(#[from] ScrapeError),
    /// A runner's worker thread failed to spawn.
    #[error("runner startup failed: {0}")]
    Runtime(#[from] RuntimeError),
}

const FRAME_QUEUE_CAPACITY: usize = 8;
const SESSION_QUEUE_CAPACITY: usize = 4;

/// Per-session bookkeeping the scraper thread keeps alongside the
/// [`SceneScraper`] itself: how much of each page's fragment list has
/// already been persisted, so a PNG is written exactly once per fragment
/// even though [`SceneScraper::update`] is driven frame-by-frame.
struct SessionState {
    session_id: String,
    scraper: SceneScraper,
    fragment_counts: [usize; 3],
    tab_button_written: [bool; 3],
    base_written: bool,
}

/// Owns the four worker threads, the scene detector, and per-session scrape
/// state for one configured character-detail recording pipeline.
pub struct Orchestrator {
    controller: RunnerController,
    frame_in: Arc<QueuedConnection<Frame>>,
    notify: Arc<dyn Fn(Notification) + Send + Sync>,
}

impl Orchestrator {
    /// Builds and starts every runner. Fails fast — no partial start — if
    /// the scene condition or any page box config is malformed.
    pub fn new(config: Config, hooks: OrchestratorHooks) -> Result<Self, OrchestratorError> {
        let notify = hooks.on_notify;
        let recognize = hooks.recognize;

        let distributor_runner = SingleThreadRunner::new("scenecap-distributor");
        let scraper_runner = SingleThreadRunner::new("scenecap-scraper");
        let stitcher_runner = SingleThreadRunner::new("scenecap-stitcher");
        let recognizer_runner = SingleThreadRunner::new("scenecap-recognizer");

        let overflow_policy = if config.video_mode { OverflowPolicy::Block } else { OverflowPolicy::Discard };

        // --- stitcher stage: scene_completed -> stitch -> recognize_ready ---
        let stitch_ready = stitcher_runner.make_connection::<String>(SESSION_QUEUE_CAPACITY, OverflowPolicy::Block);
        let recognize_ready = recognizer_runner.make_connection::<String>(SESSION_QUEUE_CAPACITY, OverflowPolicy::Block);
        {
            let scraping_dir = config.chara_detail.scraping_dir.clone();
            let storage_dir = config.storage_dir.clone();
            let stitcher_config = config.chara_detail.scene_stitcher.clone();
            let notify = notify.clone();
            let recognize_ready = recognize_ready.clone();
            stitch_ready.listen(move |session_id: String| {
                let session_dir = scraping_dir.join(&session_id);
                match scenecap_stitch::stitch_session(&session_dir, &storage_dir, &stitcher_config) {
                    Ok(tabs) => {
                        tracing::info!(session_id = %session_id, tabs = tabs.len(), "session stitched");
                        recognize_ready.send(session_id);
                    }
                    Err(error) => {
                        tracing::error!(session_id = %session_id, %error, "stitch failed");
                        notify(Notification::Error { message: error.to_string() });
                        notify(Notification::CharaDetailFinished { id: session_id, success: false });
                    }
                }
            });
        }

        // --- recognizer stage: recognize_ready -> host recognizer -> onCharaDetailFinished
        {
            let storage_dir = config.storage_dir.clone();
            let module_dir = config.module_dir.clone();
            let trainer_id = config.trainer_id.clone();
            let notify = notify.clone();
            recognize_ready.listen(move |session_id: String| {
                let tab_images: BTreeMap<String, _> = scenecap_stitch::TAB_NAMES
                    .iter()
                    .map(|tab| (tab.to_string(), storage_dir.join(&session_id).join(format!("{tab}.png"))))
                    .collect();
                let request = RecognizeRequest {
                    session_id: session_id.clone(),
                    trainer_id: trainer_id.clone(),
                    module_dir: module_dir.clone(),
                    tab_images,
                };
                let outcome = (recognize)(request).map_err(RecognizeFailure::Recognizer).and_then(|raw| {
                    parse_recognize_response(&raw).map_err(RecognizeFailure::Contract)
                });
                match outcome {
                    Ok(_response) => {
                        tracing::info!(session_id = %session_id, "session recognized");
                        notify(Notification::CharaDetailFinished { id: session_id, success: true });
                    }
                    Err(error) => {
                        tracing::error!(session_id = %session_id, %error, "recognition failed");
                        notify(Notification::Error { message: error.to_string() });
                        notify(Notification::CharaDetailFinished { id: session_id, success: false });
                    }
                }
            });
        }

        // --- scraper stage: owns the live session, persists fragments as they land
        let session: Arc<Mutex<Option<SessionState>>> = Arc::new(Mutex::new(None));
        let session_open = scraper_runner.make_connection::<()>(1, OverflowPolicy::Discard);
        let session_close = scraper_runner.make_connection::<()>(1, OverflowPolicy::Discard);
        let session_frame = scraper_runner.make_connection::<Frame>(FRAME_QUEUE_CAPACITY, overflow_policy);

        {
            let session = session.clone();
            let scraping_dir = config.chara_detail.scraping_dir.clone();
            let scraper_config = config.chara_detail.scene_scraper.clone();
            let notify = notify.clone();
            let stitch_ready = stitch_ready.clone();
            session_open.listen(move |()| {
                let session_id = Uuid::new_v4().to_string();
                let on_event = scrape_event_sender(notify.clone());
                let on_completed = stitch_ready.clone() as Arc<dyn Sender<String>>;
                let notify_closed = notify.clone();
                let closed_connection = DirectConnection::<String>::new();
                closed_connection.listen(move |session_id: String| {
                    notify_closed(Notification::CharaDetailFinished { id: session_id, success: false });
                });
                let on_closed_before_completed: Arc<dyn Sender<String>> = closed_connection;
                match SceneScraper::new(session_id.clone(), scraper_config.clone(), on_event, on_completed, on_closed_before_completed) {
                    Ok(scraper) => {
                        tracing::info!(session_id = %session_id, "scrape session opened");
                        notify(Notification::CharaDetailStarted);
                        *session.lock().unwrap() = Some(SessionState {
                            session_id,
                            scraper,
                            fragment_counts: [0; 3],
                            tab_button_written: [false; 3],
                            base_written: false,
                        });
                    }
                    Err(error) => {
                        tracing::error!(%error, "failed to open scrape session");
                        notify(Notification::Error { message: error.to_string() });
                    }
                }
            });

            let session = session.clone();
            session_close.listen(move |()| {
                if let Some(mut state) = session.lock().unwrap().take() {
                    tracing::info!(session_id = %state.session_id, "scrape session closed");
                    state.scraper.close();
                }
            });

            let session = session.clone();
            session_frame.listen(move |frame: Frame| {
                let mut guard = session.lock().unwrap();
                let Some(state) = guard.as_mut() else {
                    return;
                };
                state.scraper.update(frame);
                persist_new_output(&scraping_dir, state);
            });
        }

        // --- scene detector -> scraper lifecycle ---------------------------
        let condition = config
            .chara_detail
            .scene_condition()
            .expect("Config::from_json_str already validated the condition tree");

        let on_scene_begin: Arc<dyn Sender<()>> = session_open.clone() as Arc<dyn Sender<()>>;
        let on_scene_updated_frame: Arc<dyn Sender<Frame>> = session_frame.clone() as Arc<dyn Sender<Frame>>;
        let on_scene_updated: Arc<dyn Sender<(Frame, usize)>> = bind_first_to_frame(on_scene_updated_frame);
        let on_scene_end: Arc<dyn Sender<()>> = session_close.clone() as Arc<dyn Sender<()>>;

        let detector = SceneDetector::new(
            condition,
            config.chara_detail.scene_scraper.design_width,
            config.chara_detail.scene_scraper.design_height,
            config.chara_detail.end_timeout_ms,
            on_scene_begin,
            on_scene_updated,
            on_scene_end,
        )?;

        // --- distributor stage: feed_frame -> FrameDistributor -> detector -
        let distributor = Arc::new(Mutex::new(FrameDistributor::new(vec![detector], None)));
        let frame_in = distributor_runner.make_connection::<Frame>(FRAME_QUEUE_CAPACITY, overflow_policy);
        {
            let distributor = distributor.clone();
            frame_in.listen(move |frame: Frame| {
                distributor.lock().unwrap().update(frame);
            });
        }

        let controller = RunnerController::new();
        controller.add(distributor_runner);
        controller.add(scraper_runner);
        controller.add(stitcher_runner);
        controller.add(recognizer_runner);
        controller.start()?;

        Ok(Self {
            controller,
            frame_in,
            notify,
        })
    }

    /// Feeds one captured frame into the pipeline. Subject to the queued
    /// connection's overflow policy — blocking in video-file mode, dropping
    /// the newest frame in live-capture mode.
    pub fn feed_frame(&self, frame: Frame) {
        self.frame_in.send(frame);
    }

    /// Notifies that the host's capture source has started. Capture
    /// lifecycle is the host's command channel (distilled spec §1
    /// "deliberately out of scope"); the orchestrator only carries the
    /// notification shape, not the decision of when to emit it.
    pub fn notify_capture_started(&self) {
        (self.notify)(Notification::CaptureStarted);
    }

    /// Notifies that the host's capture source has stopped.
    pub fn notify_capture_stopped(&self) {
        (self.notify)(Notification::CaptureStopped);
    }

    /// `true` iff any runner is still running.
    pub fn is_running(&self) -> bool {
        self.controller.is_running()
    }

    /// Stops and joins every runner, in reverse start order (recognizer,
    /// then stitcher, then scraper, then distributor).
    pub fn shutdown(&self) {
        self.controller.join();
    }
}

#[derive(Debug, Error)]
enum RecognizeFailure {
    #[error("recognizer call failed: {0}")]
    Recognizer(RecognizerError),
    #[error("recognizer response invalid: {0}")]
    Contract(RecognizerError),
}

/// Builds the [`ScrapeEvent`] listener that forwards scroll/page progress
/// notifications to the host. Fragment/tab-button/base persistence happens
/// separately, after each `SceneScraper::update` call returns (see
/// [`persist_new_output`]) — `ScrapeEvent` carries no pixel data itself.
fn scrape_event_sender(notify: Arc<dyn Fn(Notification) + Send + Sync>) -> Arc<dyn Sender<ScrapeEvent>> {
    let connection = DirectConnection::<ScrapeEvent>::new();
    connection.listen(move |event: ScrapeEvent| {
        notify(match event {
            ScrapeEvent::ScrollReady { tab } => Notification::ScrollReady { index: tab },
            ScrapeEvent::ScrollUpdated { tab, progress } => Notification::ScrollUpdated { index: tab, progress },
            ScrapeEvent::PageReady { tab } => Notification::PageReady { index: tab },
        });
    });
    connection
}

/// Adapts a `Sender<Frame>` into the `Sender<(Frame, usize)>` shape
/// [`SceneDetector::new`] expects for `on_scene_updated`, discarding the
/// active-tab index: [`SceneScraper`] scrapes all three tabs regardless of
/// which one the condition tree currently reports as active.
fn bind_first_to_frame(inner: Arc<dyn Sender<Frame>>) -> Arc<dyn Sender<(Frame, usize)>> {
    Arc::new(DiscardSecond { inner })
}

struct DiscardSecond {
    inner: Arc<dyn Sender<Frame>>,
}

impl Sender<(Frame, usize)> for DiscardSecond {
    fn send(&self, value: (Frame, usize)) {
        self.inner.send(value.0);
    }
}

/// Writes any fragments, tab-button crops, or the base frame that appeared
/// during the most recent `SceneScraper::update` call but have not yet been
/// persisted.
fn persist_new_output(scraping_dir: &std::path::Path, state: &mut SessionState) {
    if !state.base_written {
        if let Some(frame) = state.scraper.base_frame() {
            if let Err(error) = persist::write_base(scraping_dir, &state.session_id, frame) {
                tracing::error!(session_id = %state.session_id, %error, "failed writing base frame");
            }
            state.base_written = true;
        }
    }

    for tab in 0..3 {
        let page = state.scraper.page(tab);

        if !state.tab_button_written[tab] {
            if let Some(image) = page.tab_button_image() {
                if let Err(error) = persist::write_tab_button(scraping_dir, &state.session_id, tab, image) {
                    tracing::error!(session_id = %state.session_id, tab, %error, "failed writing tab button");
                }
                state.tab_button_written[tab] = true;
            }
        }

        let fragments = page.fragments();
        while state.fragment_counts[tab] < fragments.len() {
            let index = state.fragment_counts[tab];
            let fragment: &Fragment = &fragments[index];
            if let Err(error) = persist::write_fragment(scraping_dir, &state.session_id, tab, index, fragment) {
                tracing::error!(session_id = %state.session_id, tab, index, %error, "failed writing fragment");
            }
            state.fragment_counts[tab] += 1;
        }
    }
}

/// Re-exported for callers that want to assert on detector liveness without
/// reaching into the orchestrator's internals (e.g. contract tests).
pub fn scene_state_name(state: SceneState) -> &'static str {
    match state {
        SceneState::Idle => "idle",
        SceneState::Active => "active",
        SceneState::Closing => "closing",
    }
}
