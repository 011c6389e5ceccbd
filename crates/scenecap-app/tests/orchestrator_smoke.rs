//! End-to-end smoke test driving [`scenecap_app::Orchestrator`] through a
//! full non-scrollable character-detail session: scene open, three pages
//! captured in one stationary frame each, stitching, and recognition.
//!
//! Unlike the unit tests embedded in each `scenecap-*` crate, this exercises
//! the real four-runner pipeline (distributor -> scraper -> stitcher ->
//! recognizer), each on its own background thread, so assertions poll for
//! the expected notification instead of asserting synchronously.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use scenecap_app::{Config, Notification, Orchestrator, OrchestratorHooks};
use scenecap_frame::Frame;

fn rect_json() -> &'static str {
    r#"{"top_left": {"x": 0.0, "y": 0.0, "anchor": {"horizontal": "ScreenStart", "vertical": "ScreenStart"}}, "bottom_right": {"x": 1.0, "y": 1.0, "anchor": {"horizontal": "ScreenStart", "vertical": "ScreenStart"}}}"#
}

fn line_json() -> &'static str {
    r#"{"p1": {"x": 0.5, "y": 0.0, "anchor": {"horizontal": "ScreenStart", "vertical": "ScreenStart"}}, "p2": {"x": 0.5, "y": 1.0, "anchor": {"horizontal": "ScreenStart", "vertical": "ScreenStart"}}}"#
}

/// A scroll-bar background color no test frame ever produces, so every page
/// classifies as non-scrollable on its first frame.
fn scrollbar_background_json() -> &'static str {
    r#"{"min": {"r": 250, "g": 250, "b": 250}, "max": {"r": 255, "g": 255, "b": 255}}"#
}

fn stationary_json() -> &'static str {
    r#"{"stationary_time_ms": 40, "min_color_delta": 10, "stationary_color_ratio": 0.05}"#
}

fn offset_estimator_json() -> &'static str {
    r#"{
        "trust_ratio": 0.5,
        "horizontal_threshold": 1.5,
        "vertical_threshold": 50.0,
        "minimum_key_points": 10,
        "patch_radius": 4,
        "grid_stride": 8,
        "corner_variance_threshold": 25.0,
        "max_key_points": 200,
        "ransac_iterations": 100,
        "ransac_tolerance_px": 2.0
    }"#
}

fn page_box_json(tab_index: usize) -> String {
    format!(
        r#"{{
            "tab_index": {tab_index},
            "tab_button_rect": {rect},
            "tab_button_stationary": {stationary},
            "scroll_area_rect": {rect},
            "scroll_bar_scan_line": {line},
            "scroll_bar_background": {scrollbar},
            "content_stationary": {stationary},
            "initial_scroll_threshold": 0.05,
            "minimum_scroll_threshold": 0.01,
            "scan_parameters": [],
            "offset_estimator": {offset_estimator}
        }}"#,
        rect = rect_json(),
        stationary = stationary_json(),
        line = line_json(),
        scrollbar = scrollbar_background_json(),
        offset_estimator = offset_estimator_json(),
    )
}

fn config_json(storage_dir: &std::path::Path, scraping_dir: &std::path::Path) -> String {
    format!(
        r#"{{
            "video_mode": false,
            "trainer_id": "trainer-1",
            "module_dir": "/models",
            "storage_dir": "{storage_dir}",
            "chara_detail": {{
                "scene_context": {{
                    "type": "Parallel",
                    "rule": {{ "rule": "Or" }},
                    "name": "tab_condition",
                    "children": [
                        {{
                            "type": "Plain",
                            "rule": {{
                                "rule": "PointColor",
                                "point": {{"x": 0.0, "y": 0.0, "anchor": {{"horizontal": "ScreenStart", "vertical": "ScreenStart"}}}},
                                "range": {{"min": {{"r": 0, "g": 0, "b": 0}}, "max": {{"r": 5, "g": 5, "b": 5}}}}
                            }}
                        }}
                    ]
                }},
                "end_timeout_ms": 1000,
                "scene_scraper": {{
                    "design_width": 4.0,
                    "design_height": 4.0,
                    "base_rect": {rect},
                    "base_stationary": {stationary},
                    "snackbar_scan_line": {line},
                    "snackbar_color": {scrollbar},
                    "snackbar_time_threshold_ms": 0,
                    "pages": [{page0}, {page1}, {page2}]
                }},
                "scene_stitcher": {{
                    "stretch_range": {line},
                    "scroll_area_cropping_rect": {rect},
                    "scroll_area_rect": {rect},
                    "scroll_bar_fill_rect": {rect},
                    "scroll_area_upper_fill_rect": {rect},
                    "scroll_area_lower_fill_rect": {rect},
                    "tab_button_rect": {rect}
                }},
                "recognizer": {{"score_threshold": 0.0}},
                "scraping_dir": "{scraping_dir}"
            }}
        }}"#,
        storage_dir = storage_dir.display(),
        scraping_dir = scraping_dir.display(),
        rect = rect_json(),
        stationary = stationary_json(),
        line = line_json(),
        scrollbar = scrollbar_background_json(),
        page0 = page_box_json(0),
        page1 = page_box_json(1),
        page2 = page_box_json(2),
    )
}

fn solid_frame(timestamp_ms: u64) -> Frame {
    // 4x4 BGR, every pixel black: satisfies the always-on tab condition and
    // every stationary catcher's rectangle (the whole frame).
    Frame::new(4, 4, timestamp_ms, vec![0u8; 4 * 4 * 3]).unwrap()
}

fn wait_for<F: Fn(&[Notification]) -> bool>(log: &Arc<Mutex<Vec<Notification>>>, timeout: Duration, predicate: F) -> bool {
    let start = Instant::now();
    loop {
        if predicate(&log.lock().unwrap()) {
            return true;
        }
        if start.elapsed() > timeout {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn non_scrollable_session_completes_end_to_end() {
    let root = std::env::temp_dir().join(format!("scenecap-app-smoke-{}", std::process::id()));
    let storage_dir = root.join("storage");
    let scraping_dir = root.join("scraping");
    std::fs::create_dir_all(&storage_dir).unwrap();
    std::fs::create_dir_all(&scraping_dir).unwrap();

    let config = Config::from_json_str(&config_json(&storage_dir, &scraping_dir)).expect("config should parse");

    let log: Arc<Mutex<Vec<Notification>>> = Arc::new(Mutex::new(Vec::new()));
    let log_in = log.clone();
    let hooks = OrchestratorHooks {
        on_notify: Arc::new(move |notification: Notification| {
            log_in.lock().unwrap().push(notification);
        }),
        recognize: Arc::new(|request| Ok(format!(r#"{{"session_id": "{}", "predictions": {{}}}}"#, request.session_id))),
    };

    let orchestrator = Orchestrator::new(config, hooks).expect("orchestrator should start");

    // Drive enough frames, spaced by 16ms timestamps, for every 40ms
    // stationary window (tab button, scroll area, base rect) to settle.
    for i in 0..20u64 {
        orchestrator.feed_frame(solid_frame(i * 16));
    }

    assert!(
        wait_for(&log, Duration::from_secs(5), |events| events
            .iter()
            .any(|event| matches!(event, Notification::CharaDetailFinished { .. }))),
        "expected onCharaDetailFinished within timeout, saw: {:?}",
        log.lock().unwrap()
    );

    let events = log.lock().unwrap().clone();
    assert!(events.contains(&Notification::CharaDetailStarted));
    for tab in 0..3 {
        assert!(events.contains(&Notification::ScrollReady { index: tab }));
        assert!(events.contains(&Notification::PageReady { index: tab }));
    }

    let session_id = events
        .iter()
        .find_map(|event| match event {
            Notification::CharaDetailFinished { id, success: true } => Some(id.clone()),
            _ => None,
        })
        .expect("a successful onCharaDetailFinished should have been recorded");
    assert!(
        !events.iter().any(|event| matches!(event, Notification::Error { .. })),
        "unexpected onError notification(s): {events:?}"
    );

    for tab in scenecap_stitch::TAB_NAMES {
        let stitched_path = storage_dir.join(&session_id).join(format!("{tab}.png"));
        assert!(stitched_path.is_file(), "expected stitched output at {}", stitched_path.display());
    }

    orchestrator.shutdown();
    std::fs::remove_dir_all(&root).ok();
}
