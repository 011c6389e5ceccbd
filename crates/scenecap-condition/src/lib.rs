#![warn(missing_docs)]
//! # scenecap-condition
//!
//! ## Purpose
//! The condition tree: a small serializable expression language over a
//! [`Frame`](scenecap_frame::Frame), used to detect when a scene of
//! interest is on screen and when a scroll region has stopped moving.
//!
//! ## Responsibilities
//! - [`Rule`] — the leaf/nested/parallel predicates over a frame:
//!   `PointColor`, `LineLength`, `StableLineLength`, `Stable`, `And`, `Or`.
//! - [`Condition`] — the tree of rules, each carrying an optional `tag`,
//!   with [`Condition::update`] walking the tree once per frame and
//!   [`Condition::find_by_tag`] doing a preorder tag lookup.
//! - Lossless JSON (de)serialization via a `type`-tagged wire form
//!   ([`Condition::to_json_value`]/[`Condition::from_json_value`]).
//!
//! ## Data flow
//! The scene detector and scrapers own one `Condition` tree each and call
//! `update(frame, geometry)` once per ingested frame, then read `met()` and
//! `find_by_tag()` to drive their own state machines.
//!
//! ## Ownership and lifetimes
//! A `Condition` owns its children and whatever rule state it accumulates
//! (e.g. `StableLineLength`'s previous ratio). Nothing here is shared or
//! reference-counted; the tree is mutated in place by `update`.
//!
//! ## Error model
//! [`ConditionError`] covers only JSON (de)serialization failures. Anchor
//! mismatches inside a rule's geometry are a programming error and panic
//! inside `scenecap-geometry`, not something this crate catches.
//!
//! ## Example
//! ```
//! use scenecap_condition::{Condition, Rule};
//! use scenecap_geometry::{Anchor, Color, ColorRange, LayoutAnchor, Point};
//! use scenecap_frame::{Frame, FrameGeometry};
//!
//! let point = Point::new(0.0, 0.0, Anchor::uniform(LayoutAnchor::ScreenStart));
//! let range = ColorRange::around(Color::new(10, 10, 10), 2);
//! let mut condition = Condition::plain(Rule::PointColor { point, range }, Some("probe".into()));
//!
//! let frame = Frame::new(1, 1, 0, vec![10, 10, 10]).unwrap();
//! let geometry = FrameGeometry::build(1, 1, 1.0, 1.0);
//! condition.update(&frame, &geometry);
//! assert!(condition.met());
//! assert!(condition.find_by_tag("probe").is_some());
//! ```

use scenecap_frame::{Frame, FrameGeometry};
use scenecap_geometry::{Color, ColorRange, Line, Point};
use serde::{Deserialize, Serialize};

/// Errors (de)serializing a [`Condition`] tree.
#[derive(Debug, thiserror::Error)]
pub enum ConditionError {
    /// The JSON did not match the expected tagged shape.
    #[error("malformed condition JSON: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// An inclusive `[min, max]` ratio range, used by [`Rule::LineLength`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RatioRange {
    /// Inclusive lower bound.
    pub min: f64,
    /// Inclusive upper bound.
    pub max: f64,
}

impl RatioRange {
    /// Builds a ratio range.
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// `true` iff `ratio` falls within `[min, max]`.
    pub fn contains(&self, ratio: f64) -> bool {
        ratio >= self.min && ratio <= self.max
    }
}

/// The predicate a condition node evaluates against a frame. Each variant
/// maps to exactly one `type` string in the JSON wire form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule")]
pub enum Rule {
    /// Met iff the pixel at `point` falls inside `range`.
    PointColor {
        /// The sampled point.
        point: Point<f64>,
        /// The acceptance range.
        range: ColorRange,
    },
    /// Met iff the scanned prefix ratio along `line` (matching `deviation`
    /// around the color sampled at `line.p1`) falls inside `length_range`.
    LineLength {
        /// The scan line.
        line: Line<f64>,
        /// Per-channel deviation applied to `line.p1`'s color.
        deviation: i32,
        /// The acceptance range for the measured ratio.
        length_range: RatioRange,
    },
    /// Measures the same prefix ratio as `LineLength` (using `deviation`
    /// around the color at `line.p1`) but is met iff that ratio exactly
    /// equals the ratio measured on the previous evaluation. The first
    /// evaluation is never met.
    StableLineLength {
        /// The scan line.
        line: Line<f64>,
        /// Per-channel deviation applied to `line.p1`'s color.
        deviation: i32,
    },
    /// Wraps a child; met iff the child has been continuously met for at
    /// least `threshold_ms` of frame-timestamp time. Resets as soon as the
    /// child becomes unmet.
    Stable {
        /// Required continuous-met duration, in frame-timestamp
        /// milliseconds.
        threshold_ms: u64,
    },
    /// Met iff every child is met.
    And,
    /// Met iff at least one child is met.
    Or,
}

#[derive(Debug, Clone, Default)]
struct StableLineLengthState {
    previous_ratio: Option<f64>,
}

#[derive(Debug, Clone, Default)]
struct StableState {
    met_since_ms: Option<u64>,
}

/// A node in the condition tree. See the crate docs for the tree shape.
#[derive(Debug, Clone)]
pub enum Condition {
    /// A leaf evaluating one of `PointColor`/`LineLength`/`StableLineLength`
    /// directly against the frame.
    Plain {
        /// The leaf rule.
        rule: Rule,
        /// Optional lookup tag.
        tag: Option<String>,
        /// Last computed `met` value.
        met: bool,
        /// Rule-local mutable state (only meaningful for `StableLineLength`).
        state: StableLineLengthState,
    },
    /// A node wrapping one child with a `Stable` rule.
    Nested {
        /// The nesting rule (currently always `Stable`).
        rule: Rule,
        /// Optional lookup tag.
        tag: Option<String>,
        /// Last computed `met` value.
        met: bool,
        /// The wrapped child.
        child: Box<Condition>,
        /// Rule-local mutable state tracking when the child last became met.
        state: StableState,
    },
    /// A node combining multiple children with `And`/`Or`.
    Parallel {
        /// The combining rule (`And` or `Or`).
        rule: Rule,
        /// Optional lookup tag.
        tag: Option<String>,
        /// Last computed `met` value.
        met: bool,
        /// The combined children.
        children: Vec<Condition>,
    },
}

impl Condition {
    /// Builds a `Plain` leaf. Panics if `rule` is not one of
    /// `PointColor`/`LineLength`/`StableLineLength`.
    pub fn plain(rule: Rule, tag: Option<String>) -> Self {
        assert!(
            matches!(rule, Rule::PointColor { .. } | Rule::LineLength { .. } | Rule::StableLineLength { .. }),
            "Condition::plain requires a leaf rule"
        );
        Condition::Plain {
            rule,
            tag,
            met: false,
            state: StableLineLengthState::default(),
        }
    }

    /// Builds a `Nested` node wrapping `child`. Panics if `rule` is not
    /// `Stable`.
    pub fn nested(rule: Rule, child: Condition, tag: Option<String>) -> Self {
        assert!(matches!(rule, Rule::Stable { .. }), "Condition::nested requires Rule::Stable");
        Condition::Nested {
            rule,
            tag,
            met: false,
            child: Box::new(child),
            state: StableState::default(),
        }
    }

    /// Builds a `Parallel` node combining `children`. Panics if `rule` is
    /// not `And`/`Or`.
    pub fn parallel(rule: Rule, children: Vec<Condition>, tag: Option<String>) -> Self {
        assert!(matches!(rule, Rule::And | Rule::Or), "Condition::parallel requires And/Or");
        Condition::Parallel {
            rule,
            tag,
            met: false,
            children,
        }
    }

    /// The node's most recently computed `met` value. `false` before the
    /// first `update`.
    pub fn met(&self) -> bool {
        match self {
            Condition::Plain { met, .. } => *met,
            Condition::Nested { met, .. } => *met,
            Condition::Parallel { met, .. } => *met,
        }
    }

    /// The node's lookup tag, if any.
    pub fn tag(&self) -> Option<&str> {
        match self {
            Condition::Plain { tag, .. } => tag.as_deref(),
            Condition::Nested { tag, .. } => tag.as_deref(),
            Condition::Parallel { tag, .. } => tag.as_deref(),
        }
    }

    /// Direct children, in traversal order. Empty for `Plain`.
    pub fn children(&self) -> &[Condition] {
        match self {
            Condition::Plain { .. } => &[],
            Condition::Nested { child, .. } => std::slice::from_ref(child),
            Condition::Parallel { children, .. } => children,
        }
    }

    /// Walks the tree once, recomputing every node's `met` value against
    /// `frame`. Children are updated before their parent.
    pub fn update(&mut self, frame: &Frame, geometry: &FrameGeometry) {
        match self {
            Condition::Plain { rule, met, state, .. } => {
                *met = Self::evaluate_plain(rule, state, frame, geometry);
            }
            Condition::Nested { rule, met, child, state, .. } => {
                child.update(frame, geometry);
                *met = Self::evaluate_nested(rule, state, child.met(), frame.timestamp_ms());
            }
            Condition::Parallel { rule, met, children, .. } => {
                for c in children.iter_mut() {
                    c.update(frame, geometry);
                }
                *met = Self::evaluate_parallel(rule, children);
            }
        }
    }

    fn evaluate_plain(rule: &Rule, state: &mut StableLineLengthState, frame: &Frame, geometry: &FrameGeometry) -> bool {
        match rule {
            Rule::PointColor { point, range } => frame.is_in(geometry, range, point),
            Rule::LineLength { line, deviation, length_range } => {
                let ratio = Self::measure_line_ratio(frame, geometry, line, *deviation);
                length_range.contains(ratio)
            }
            Rule::StableLineLength { line, deviation } => {
                let ratio = Self::measure_line_ratio(frame, geometry, line, *deviation);
                let met = state
                    .previous_ratio
                    .is_some_and(|previous| previous == ratio);
                state.previous_ratio = Some(ratio);
                met
            }
            Rule::Stable { .. } | Rule::And | Rule::Or => {
                unreachable!("non-leaf rule stored in a Plain condition")
            }
        }
    }

    fn measure_line_ratio(frame: &Frame, geometry: &FrameGeometry, line: &Line<f64>, deviation: i32) -> f64 {
        let reference = frame.color_at(geometry, &line.p1).unwrap_or(Color::new(0, 0, 0));
        let range = ColorRange::around(reference, deviation);
        frame.length_in(geometry, &range, line)
    }

    fn evaluate_nested(rule: &Rule, state: &mut StableState, child_met: bool, frame_timestamp_ms: u64) -> bool {
        let Rule::Stable { threshold_ms } = rule else {
            unreachable!("non-Stable rule stored in a Nested condition");
        };
        if !child_met {
            state.met_since_ms = None;
            return false;
        }
        let since = *state.met_since_ms.get_or_insert(frame_timestamp_ms);
        frame_timestamp_ms.saturating_sub(since) >= *threshold_ms
    }

    fn evaluate_parallel(rule: &Rule, children: &[Condition]) -> bool {
        match rule {
            Rule::And => children.iter().all(|c| c.met()),
            Rule::Or => children.iter().any(|c| c.met()),
            _ => unreachable!("non-And/Or rule stored in a Parallel condition"),
        }
    }

    /// Preorder search for the first node (including `self`) whose tag
    /// matches `name`.
    pub fn find_by_tag(&self, name: &str) -> Option<&Condition> {
        if self.tag() == Some(name) {
            return Some(self);
        }
        self.children().iter().find_map(|c| c.find_by_tag(name))
    }

    /// Index of the first child of `self` that is met, or `None` if zero
    /// or more than one child is met — used by the scene detector to
    /// determine the uniquely active tab under an `Or`-combined
    /// `tab_condition` node.
    pub fn unique_met_child_index(&self) -> Option<usize> {
        let mut found = None;
        for (index, child) in self.children().iter().enumerate() {
            if child.met() {
                if found.is_some() {
                    return None;
                }
                found = Some(index);
            }
        }
        found
    }

    /// Serializes the tree to the self-describing JSON wire form.
    pub fn to_json_value(&self) -> serde_json::Value {
        serde_json::to_value(ConditionJson::from(self)).expect("Condition always serializes")
    }

    /// Serializes the tree to a JSON string.
    pub fn to_json_string(&self) -> Result<String, ConditionError> {
        Ok(serde_json::to_string(&ConditionJson::from(self))?)
    }

    /// Parses a tree from the self-describing JSON wire form.
    pub fn from_json_value(value: serde_json::Value) -> Result<Condition, ConditionError> {
        let wire: ConditionJson = serde_json::from_value(value)?;
        Ok(wire.into())
    }

    /// Parses a tree from a JSON string.
    pub fn from_json_str(json: &str) -> Result<Condition, ConditionError> {
        let wire: ConditionJson = serde_json::from_str(json)?;
        Ok(wire.into())
    }
}

/// The `type`-tagged JSON wire form of a [`Condition`] tree. `type` names
/// `Plain|Nested|Parallel` and `rule` names the specific rule, matching
/// the distilled shape `{"type": "...", "rule": {...}, "name"?: "...",
/// "child"|"children": ...}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
enum ConditionJson {
    Plain {
        rule: Rule,
        name: Option<String>,
    },
    Nested {
        rule: Rule,
        name: Option<String>,
        child: Box<ConditionJson>,
    },
    Parallel {
        rule: Rule,
        name: Option<String>,
        children: Vec<ConditionJson>,
    },
}

impl From<&Condition> for ConditionJson {
    fn from(condition: &Condition) -> Self {
        match condition {
            Condition::Plain { rule, tag, .. } => ConditionJson::Plain {
                rule: rule.clone(),
                name: tag.clone(),
            },
            Condition::Nested { rule, tag, child, .. } => ConditionJson::Nested {
                rule: rule.clone(),
                name: tag.clone(),
                child: Box::new(ConditionJson::from(child.as_ref())),
            },
            Condition::Parallel { rule, tag, children, .. } => ConditionJson::Parallel {
                rule: rule.clone(),
                name: tag.clone(),
                children: children.iter().map(ConditionJson::from).collect(),
            },
        }
    }
}

impl From<ConditionJson> for Condition {
    fn from(wire: ConditionJson) -> Self {
        match wire {
            ConditionJson::Plain { rule, name } => Condition::plain(rule, name),
            ConditionJson::Nested { rule, name, child } => {
                Condition::nested(rule, Condition::from(*child), name)
            }
            ConditionJson::Parallel { rule, name, children } => {
                Condition::parallel(rule, children.into_iter().map(Condition::from).collect(), name)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scenecap_geometry::{Anchor, LayoutAnchor};

    fn screen_point(x: f64, y: f64) -> Point<f64> {
        Point::new(x, y, Anchor::uniform(LayoutAnchor::ScreenStart))
    }

    fn solid_frame(width: u32, height: u32, color: (u8, u8, u8), timestamp_ms: u64) -> Frame {
        let mut bgr = Vec::with_capacity((width * height * 3) as usize);
        for _ in 0..(width * height) {
            bgr.extend_from_slice(&[color.0, color.1, color.2]);
        }
        Frame::new(width, height, timestamp_ms, bgr).unwrap()
    }

    #[test]
    fn point_color_is_met_when_sample_is_in_range() {
        let mut condition = Condition::plain(
            Rule::PointColor {
                point: screen_point(0.0, 0.0),
                range: ColorRange::around(Color::new(10, 10, 10), 2),
            },
            Some("probe".into()),
        );
        let frame = solid_frame(2, 2, (10, 10, 10), 0);
        let geometry = FrameGeometry::build(2, 2, 2.0, 2.0);
        condition.update(&frame, &geometry);
        assert!(condition.met());
    }

    #[test]
    fn stable_line_length_is_unmet_on_first_evaluation() {
        let mut condition = Condition::plain(
            Rule::StableLineLength {
                line: Line::new(screen_point(0.0, 0.0), screen_point(1.0, 0.0)),
                deviation: 5,
            },
            None,
        );
        let frame = solid_frame(4, 1, (10, 10, 10), 0);
        let geometry = FrameGeometry::build(4, 1, 4.0, 1.0);
        condition.update(&frame, &geometry);
        assert!(!condition.met());
        condition.update(&frame, &geometry);
        assert!(condition.met(), "second identical measurement should match the stored ratio");
    }

    #[test]
    fn stable_resets_timer_as_soon_as_child_is_unmet() {
        let inner_range = ColorRange::around(Color::new(10, 10, 10), 2);
        let mut condition = Condition::nested(
            Rule::Stable { threshold_ms: 100 },
            Condition::plain(
                Rule::PointColor {
                    point: screen_point(0.0, 0.0),
                    range: inner_range,
                },
                None,
            ),
            None,
        );
        let geometry = FrameGeometry::build(2, 2, 2.0, 2.0);

        let met_frame = solid_frame(2, 2, (10, 10, 10), 0);
        condition.update(&met_frame, &geometry);
        assert!(!condition.met(), "threshold has not elapsed yet");

        let still_met_later = solid_frame(2, 2, (10, 10, 10), 150);
        condition.update(&still_met_later, &geometry);
        assert!(condition.met(), "continuously met for >= threshold_ms");

        let unmet_frame = solid_frame(2, 2, (0, 0, 0), 200);
        condition.update(&unmet_frame, &geometry);
        assert!(!condition.met());

        let met_again_soon = solid_frame(2, 2, (10, 10, 10), 250);
        condition.update(&met_again_soon, &geometry);
        assert!(!condition.met(), "timer must restart after the unmet frame");
    }

    #[test]
    fn or_reports_unique_met_child_index() {
        let range = ColorRange::around(Color::new(10, 10, 10), 2);
        let children = vec![
            Condition::plain(Rule::PointColor { point: screen_point(0.0, 0.0), range }, None),
            Condition::plain(Rule::PointColor { point: screen_point(1.0, 0.0), range }, None),
        ];
        let mut tab_condition = Condition::parallel(Rule::Or, children, Some("tab_condition".into()));
        let frame = solid_frame(2, 1, (0, 0, 0), 0);
        let mut bgr = frame.pixels().to_vec();
        bgr[0] = 10;
        bgr[1] = 10;
        bgr[2] = 10;
        let frame = Frame::new(2, 1, 0, bgr).unwrap();
        let geometry = FrameGeometry::build(2, 1, 2.0, 1.0);
        tab_condition.update(&frame, &geometry);
        assert!(tab_condition.met());
        assert_eq!(tab_condition.unique_met_child_index(), Some(0));
    }

    #[test]
    fn json_round_trips_losslessly() {
        let tree = Condition::parallel(
            Rule::And,
            vec![
                Condition::plain(
                    Rule::PointColor {
                        point: screen_point(0.0, 0.0),
                        range: ColorRange::around(Color::new(1, 2, 3), 4),
                    },
                    Some("p".into()),
                ),
                Condition::nested(
                    Rule::Stable { threshold_ms: 500 },
                    Condition::plain(
                        Rule::LineLength {
                            line: Line::new(screen_point(0.0, 0.0), screen_point(1.0, 1.0)),
                            deviation: 3,
                            length_range: RatioRange::new(0.2, 0.8),
                        },
                        None,
                    ),
                    Some("stable_line".into()),
                ),
            ],
            Some("root".into()),
        );

        let json = tree.to_json_value();
        let restored = Condition::from_json_value(json.clone()).unwrap();
        assert_eq!(restored.to_json_value(), json);
    }
}
