//! Keyframed attribute curves.
//!
//! Every animateable property of an effect or emitter is an [`AttributeCurve`]:
//! a list of `(frame, value)` nodes, each optionally carrying Bezier control
//! handles, plus a pre-sampled lookup table built by [`AttributeCurve::compile`].
//! Curves are evaluated on one of two time bases:
//!
//! * **Effect time** — `frame` is absolute effect age in milliseconds.
//! * **Over-life time** — `frame` is a 0..1 fraction of a particle's lifetime,
//!   scaled by the longest particle life the owning emitter can produce.

use bevy::prelude::*;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::library::UpdateConfig;

// ---------------------------------------------------------------------------
// AttributeNode — a single keyframe
// ---------------------------------------------------------------------------

/// One keyframe on an [`AttributeCurve`].
///
/// When `is_curve` is set, `c0` is the incoming control handle of the segment
/// that ends here and `c1` the outgoing handle of the segment that starts
/// here.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize, Reflect)]
pub struct AttributeNode {
    pub frame: f32,
    pub value: f32,
    pub is_curve: bool,
    pub c0: Vec2,
    pub c1: Vec2,
}

impl AttributeNode {
    pub fn new(frame: f32, value: f32) -> Self {
        Self {
            frame,
            value,
            is_curve: false,
            c0: Vec2::ZERO,
            c1: Vec2::ZERO,
        }
    }

    /// Turn the node into a curved keyframe with explicit Bezier handles.
    pub fn set_curve_points(&mut self, c0: Vec2, c1: Vec2) {
        self.c0 = c0;
        self.c1 = c1;
        self.is_curve = true;
    }

    pub fn toggle_curve(&mut self) {
        self.is_curve = !self.is_curve;
    }
}

// ---------------------------------------------------------------------------
// AttributeCurve — keyframes plus a compiled lookup table
// ---------------------------------------------------------------------------

/// A keyframed curve with an optional pre-sampled lookup table.
///
/// Uncompiled curves evaluate by scanning nodes and interpolating; compiled
/// curves index the table directly, which is what the per-tick simulation
/// uses. `min`/`max` clamp the output of Bezier segments so authored handles
/// cannot push a value outside its legal range.
#[derive(Clone, Debug, Default, Serialize, Deserialize, Reflect)]
pub struct AttributeCurve {
    nodes: Vec<AttributeNode>,
    min: f32,
    max: f32,
    #[serde(skip)]
    table: Vec<f32>,
    #[serde(skip)]
    compiled: bool,
    /// Longest-life scale baked in by [`compile_over_life`](Self::compile_over_life).
    #[serde(skip)]
    table_life: f32,
}

impl AttributeCurve {
    pub fn new(min: f32, max: f32) -> Self {
        Self {
            nodes: Vec::new(),
            min,
            max,
            table: Vec::new(),
            compiled: false,
            table_life: 0.0,
        }
    }

    /// Append a keyframe and return it for further tweaking (handles).
    /// Invalidates any compiled table.
    pub fn add(&mut self, frame: f32, value: f32) -> &mut AttributeNode {
        self.compiled = false;
        self.nodes.push(AttributeNode::new(frame, value));
        // just pushed, so the vec is non-empty
        let last = self.nodes.len() - 1;
        &mut self.nodes[last]
    }

    pub fn clear_nodes(&mut self) {
        self.nodes.clear();
        self.compiled = false;
    }

    /// Set a node's Bezier handles, clamping each handle's time coordinate
    /// between the neighboring keyframes so a segment cannot fold back on
    /// itself. No-op on an out-of-range index.
    pub fn set_node_curve_points(&mut self, index: usize, c0: Vec2, c1: Vec2) {
        if index >= self.nodes.len() {
            return;
        }
        let left = if index > 0 {
            self.nodes[index - 1].frame
        } else {
            f32::MIN
        };
        let right = self
            .nodes
            .get(index + 1)
            .map(|n| n.frame)
            .unwrap_or(f32::MAX);
        let frame = self.nodes[index].frame;
        let c0 = Vec2::new(c0.x.clamp(left, frame), c0.y);
        let c1 = Vec2::new(c1.x.clamp(frame, right), c1.y);
        self.nodes[index].set_curve_points(c0, c1);
        self.compiled = false;
    }

    /// Sort keyframes by ascending frame. The sort is stable, so nodes that
    /// share a frame keep their insertion order.
    pub fn sort(&mut self) {
        self.nodes
            .sort_by(|a, b| a.frame.partial_cmp(&b.frame).unwrap_or(Ordering::Equal));
        self.compiled = false;
    }

    pub fn nodes(&self) -> &[AttributeNode] {
        &self.nodes
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_compiled(&self) -> bool {
        self.compiled
    }

    /// Last valid index of the compiled table.
    pub fn last_frame(&self) -> usize {
        self.table.len().saturating_sub(1)
    }

    /// Lifetime scale the over-life table was compiled with.
    pub fn table_life(&self) -> f32 {
        self.table_life
    }

    /// Largest node value, floored at zero.
    pub fn max_value(&self) -> f32 {
        self.nodes.iter().fold(0.0f32, |m, n| m.max(n.value))
    }

    // -- compiled-table primitives ------------------------------------------

    /// Reset the table to `size` zeroed slots and mark the curve compiled.
    pub fn clear_table(&mut self, size: usize) {
        self.table.clear();
        self.table.resize(size, 0.0);
        self.compiled = true;
        self.table_life = 0.0;
    }

    /// Overwrite one compiled slot. Out-of-range writes are ignored.
    pub fn set_compiled(&mut self, index: usize, value: f32) {
        if let Some(slot) = self.table.get_mut(index) {
            *slot = value;
        }
    }

    fn get_compiled(&self, frame: f32) -> f32 {
        if self.table.is_empty() {
            return 0.0;
        }
        let index = (frame.max(0.0) as usize).min(self.table.len() - 1);
        self.table[index]
    }

    // -- compilation --------------------------------------------------------

    /// Sample the curve into a lookup table at `lookup_frequency` millisecond
    /// steps. The final slot always holds the last node's exact value. An
    /// empty curve compiles to a single zero slot.
    pub fn compile(&mut self, lookup_frequency: f32) {
        let Some(last) = self.nodes.last().copied() else {
            self.clear_table(1);
            return;
        };
        let end = (last.frame / lookup_frequency).ceil() as usize;
        let mut table = vec![0.0; end + 1];
        let mut frame = 0usize;
        let mut age = 0.0f32;
        while age < last.frame {
            table[frame] = self.interpolate(age);
            frame += 1;
            age = frame as f32 * lookup_frequency;
        }
        table[end] = last.value;
        self.table = table;
        self.table_life = 0.0;
        self.compiled = true;
    }

    /// Compile on the over-life time base: the table spans `longest_life`
    /// milliseconds sampled every `lookup_frequency_over_time`.
    pub fn compile_over_life(&mut self, lookup_frequency_over_time: f32, longest_life: f32) {
        if self.nodes.last().is_none() {
            self.clear_table(1);
            self.table_life = longest_life;
            return;
        }
        let end = (longest_life / lookup_frequency_over_time).ceil() as usize;
        let mut table = vec![0.0; end + 1];
        let mut frame = 0usize;
        let mut age = 0.0f32;
        while age < longest_life {
            table[frame] = self.interpolate_over_life(age, longest_life);
            frame += 1;
            age = frame as f32 * lookup_frequency_over_time;
        }
        table[end] = self.interpolate_over_life(longest_life, longest_life);
        self.table = table;
        self.table_life = longest_life;
        self.compiled = true;
    }

    // -- evaluation ---------------------------------------------------------

    /// Evaluate at an absolute frame. Compiled curves read the table (the
    /// frame is already in lookup units), uncompiled curves interpolate.
    pub fn get(&self, frame: f32) -> f32 {
        if self.compiled {
            self.get_compiled(frame)
        } else {
            self.interpolate(frame)
        }
    }

    /// Evaluate on the over-life time base for a particle of `lifetime`
    /// milliseconds at `age` milliseconds.
    pub fn get_over_life(&self, age: f32, lifetime: f32, cfg: &UpdateConfig) -> f32 {
        let frame = if lifetime != 0.0 {
            (age / lifetime) * self.table_life / cfg.lookup_frequency_over_time
        } else {
            0.0
        };
        self.get(frame)
    }

    /// Interpolate between keyframes at an absolute frame.
    pub fn interpolate(&self, frame: f32) -> f32 {
        self.interpolate_over_life(frame, 1.0)
    }

    /// Interpolate with each node's frame scaled by `lifetime`. Ages before
    /// the first node ramp from zero; ages past the last node hold its value.
    pub fn interpolate_over_life(&self, age: f32, lifetime: f32) -> f32 {
        let mut last_value = 0.0f32;
        let mut last_frame = 0.0f32;
        let mut last_node: Option<&AttributeNode> = None;
        for node in &self.nodes {
            let frame = node.frame * lifetime;
            if age < frame {
                let p = (age - last_frame) / (frame - last_frame);
                if let Some(prev) = last_node {
                    let bezier = bezier_value(prev, node, p, self.min, self.max);
                    // a Bezier segment evaluating to exactly zero falls back
                    // to linear interpolation
                    if bezier != 0.0 {
                        return bezier;
                    }
                }
                return last_value - p * (last_value - node.value);
            }
            last_value = node.value;
            last_frame = frame;
            last_node = Some(node);
        }
        last_value
    }
}

// ---------------------------------------------------------------------------
// Bezier segment evaluation
// ---------------------------------------------------------------------------

/// Evaluate the Bezier segment between two keyframes at parameter `t`.
///
/// Both nodes curved gives a cubic through `prev.c1` and `next.c0`, one node
/// curved gives a quadratic, neither gives 0.0 (the caller's linear-fallback
/// sentinel).
fn bezier_value(prev: &AttributeNode, next: &AttributeNode, t: f32, ymin: f32, ymax: f32) -> f32 {
    if prev.is_curve {
        if next.is_curve {
            cubic_bezier(
                Vec2::new(prev.frame, prev.value),
                prev.c1,
                next.c0,
                Vec2::new(next.frame, next.value),
                t,
                ymin,
                ymax,
            )
            .y
        } else {
            quad_bezier(
                Vec2::new(prev.frame, prev.value),
                prev.c1,
                Vec2::new(next.frame, next.value),
                t,
                ymin,
                ymax,
            )
            .y
        }
    } else if next.is_curve {
        quad_bezier(
            Vec2::new(prev.frame, prev.value),
            next.c0,
            Vec2::new(next.frame, next.value),
            t,
            ymin,
            ymax,
        )
        .y
    } else {
        0.0
    }
}

/// Quadratic Bezier point with time clamped to `[p0.x, p2.x]` so authored
/// handles cannot fold the segment back on itself, and value clamped to
/// `[ymin, ymax]`.
pub(crate) fn quad_bezier(p0: Vec2, p1: Vec2, p2: Vec2, t: f32, ymin: f32, ymax: f32) -> Vec2 {
    let u = 1.0 - t;
    let x = u * u * p0.x + 2.0 * u * t * p1.x + t * t * p2.x;
    let y = u * u * p0.y + 2.0 * u * t * p1.y + t * t * p2.y;
    Vec2::new(x.clamp(p0.x, p2.x), y.clamp(ymin, ymax))
}

/// Cubic Bezier point with the same time and value clamping as
/// [`quad_bezier`].
pub(crate) fn cubic_bezier(
    p0: Vec2,
    p1: Vec2,
    p2: Vec2,
    p3: Vec2,
    t: f32,
    ymin: f32,
    ymax: f32,
) -> Vec2 {
    let u = 1.0 - t;
    let x = u * u * u * p0.x + 3.0 * u * u * t * p1.x + 3.0 * u * t * t * p2.x + t * t * t * p3.x;
    let y = u * u * u * p0.y + 3.0 * u * u * t * p1.y + 3.0 * u * t * t * p2.y + t * t * t * p3.y;
    Vec2::new(x.clamp(p0.x, p3.x), y.clamp(ymin, ymax))
}

// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn linear_curve() -> AttributeCurve {
        let mut c = AttributeCurve::new(0.0, 100.0);
        c.add(0.0, 0.0);
        c.add(1000.0, 100.0);
        c
    }

    #[test]
    fn empty_curve_evaluates_to_zero() {
        let c = AttributeCurve::new(0.0, 10.0);
        assert_eq!(c.get(0.0), 0.0);
        assert_eq!(c.interpolate(500.0), 0.0);
    }

    #[test]
    fn flat_extrapolation_past_last_node() {
        let c = linear_curve();
        assert_eq!(c.interpolate(1000.0), 100.0);
        assert_eq!(c.interpolate(99999.0), 100.0);
    }

    #[test]
    fn linear_interpolation_between_nodes() {
        let c = linear_curve();
        assert!((c.interpolate(250.0) - 25.0).abs() < 1e-4);
        assert!((c.interpolate(500.0) - 50.0).abs() < 1e-4);
    }

    #[test]
    fn sort_is_stable_and_ascending() {
        let mut c = AttributeCurve::new(0.0, 10.0);
        c.add(500.0, 5.0);
        c.add(0.0, 1.0);
        c.add(500.0, 7.0);
        c.sort();
        let frames: Vec<f32> = c.nodes().iter().map(|n| n.frame).collect();
        assert_eq!(frames, vec![0.0, 500.0, 500.0]);
        // ties keep insertion order
        assert_eq!(c.nodes()[1].value, 5.0);
        assert_eq!(c.nodes()[2].value, 7.0);
    }

    #[test]
    fn compile_matches_interpolate_at_sample_points() {
        let mut c = linear_curve();
        let freq = 33.333_332;
        c.compile(freq);
        for i in 0..c.last_frame() {
            let age = i as f32 * freq;
            assert!(
                (c.get(i as f32) - c.interpolate(age)).abs() < 1e-4,
                "slot {i} diverges"
            );
        }
        // final slot pins the last node value exactly
        assert_eq!(c.get(c.last_frame() as f32), 100.0);
    }

    #[test]
    fn compiled_lookup_clamps_to_table_ends() {
        let mut c = linear_curve();
        c.compile(33.333_332);
        assert_eq!(c.get(-5.0), c.get(0.0));
        assert_eq!(c.get(1e6), 100.0);
    }

    #[test]
    fn empty_curve_compiles_to_single_zero_slot() {
        let mut c = AttributeCurve::new(0.0, 10.0);
        c.compile(33.333_332);
        assert!(c.is_compiled());
        assert_eq!(c.last_frame(), 0);
        assert_eq!(c.get(0.0), 0.0);
    }

    #[test]
    fn over_life_table_scales_with_lifetime() {
        let mut c = AttributeCurve::new(0.0, 20.0);
        c.add(0.0, 0.0);
        c.add(1.0, 10.0);
        c.compile_over_life(1.0, 2000.0);
        let cfg = UpdateConfig::default();
        // halfway through any lifetime lands halfway up the ramp
        let half_short = c.get_over_life(250.0, 500.0, &cfg);
        let half_long = c.get_over_life(2500.0, 5000.0, &cfg);
        assert!((half_short - 5.0).abs() < 0.1);
        assert!((half_long - 5.0).abs() < 0.1);
    }

    #[test]
    fn over_life_without_table_reads_slot_zero() {
        let mut c = AttributeCurve::new(0.0, 20.0);
        c.add(0.0, 3.0);
        c.add(1.0, 9.0);
        let cfg = UpdateConfig::default();
        // uncompiled: table_life is zero, so every age maps to frame zero
        assert_eq!(c.get_over_life(400.0, 800.0, &cfg), 3.0);
    }

    #[test]
    fn bezier_time_is_clamped_and_monotonic() {
        let p0 = Vec2::new(0.0, 0.0);
        let p3 = Vec2::new(100.0, 10.0);
        // handles pulled far outside the segment in time
        let p1 = Vec2::new(-500.0, 2.0);
        let p2 = Vec2::new(600.0, 8.0);
        let mut last_x = f32::NEG_INFINITY;
        for i in 0..=100 {
            let t = i as f32 / 100.0;
            let p = cubic_bezier(p0, p1, p2, p3, t, 0.0, 10.0);
            assert!(p.x >= 0.0 && p.x <= 100.0);
            assert!(p.x >= last_x, "time folds back at t={t}");
            last_x = p.x;
        }
    }

    #[test]
    fn bezier_value_is_clamped_to_range() {
        let p0 = Vec2::new(0.0, 0.0);
        let p2 = Vec2::new(100.0, 1.0);
        let p1 = Vec2::new(50.0, 50.0);
        let p = quad_bezier(p0, p1, p2, 0.5, 0.0, 1.0);
        assert!(p.y <= 1.0);
    }

    #[test]
    fn zero_bezier_falls_back_to_linear() {
        // both endpoints at 6 with handles at -2: the cubic dips to exactly
        // 0.0 at the midpoint, which is the linear-fallback sentinel
        let mut c = AttributeCurve::new(-10.0, 10.0);
        c.add(0.0, 6.0)
            .set_curve_points(Vec2::new(0.0, 6.0), Vec2::new(50.0, -2.0));
        c.add(100.0, 6.0)
            .set_curve_points(Vec2::new(50.0, -2.0), Vec2::new(100.0, 6.0));
        let v = c.interpolate(50.0);
        // linear interpolation between 6 and 6 wins over the zero cubic
        assert_eq!(v, 6.0);
    }

    #[test]
    fn node_round_trip_through_ron() {
        let mut c = AttributeCurve::new(0.0, 10.0);
        c.add(0.0, 1.0);
        c.add(250.0, 4.0)
            .set_curve_points(Vec2::new(100.0, 2.0), Vec2::new(200.0, 3.0));
        let text = ron::to_string(&c).unwrap();
        let back: AttributeCurve = ron::from_str(&text).unwrap();
        assert_eq!(back.node_count(), 2);
        assert_eq!(back.nodes()[1], c.nodes()[1]);
        // compiled state never round-trips
        assert!(!back.is_compiled());
    }
}
