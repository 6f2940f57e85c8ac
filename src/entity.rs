//! Entity state shared by effects, emitters, and particles.
//!
//! Everything that moves in the simulation composes an [`EntityState`]:
//! local and world transform, velocity/weight integration, animation frame,
//! lifecycle bookkeeping, and captured previous-tick values for render
//! tweening. Angles are in degrees, positions in pixels, time in
//! milliseconds.

use bevy::prelude::*;
use serde::{Deserialize, Serialize};

use crate::library::UpdateConfig;

/// How a particle's sprite is blended.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, Reflect)]
pub enum BlendMode {
    #[default]
    Alpha,
    Additive,
}

/// Lifecycle flag values for [`EntityState::dead`].
pub const ALIVE: u8 = 0;
pub const DEAD: u8 = 1;
/// A line-edge kill; the owning particle dies regardless of remaining life.
pub const EDGE_KILLED: u8 = 2;

// ---------------------------------------------------------------------------
// ParentTransform — read-only view of a parent for composition
// ---------------------------------------------------------------------------

/// The pieces of a parent entity a child needs to compose its world
/// transform. Copied out of the parent so the child can be mutated while the
/// parent is borrowed elsewhere.
#[derive(Clone, Copy, Debug)]
pub struct ParentTransform {
    pub wx: f32,
    pub wy: f32,
    pub z: f32,
    pub relative_angle: f32,
    pub matrix: Mat2,
}

// ---------------------------------------------------------------------------
// EntityState
// ---------------------------------------------------------------------------

/// Transform, motion, animation, and lifecycle state for one tree node.
///
/// `old_*` fields are the previous tick's values, captured at the start of
/// each update so the renderer can tween between ticks.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EntityState {
    // local and world position
    pub x: f32,
    pub y: f32,
    pub wx: f32,
    pub wy: f32,
    /// Scale factor inherited down the tree; also scales motion.
    pub z: f32,
    /// Whether the local transform is relative to the parent.
    pub relative: bool,
    pub matrix: Mat2,

    // color
    pub red: f32,
    pub green: f32,
    pub blue: f32,
    pub alpha: f32,

    // motion
    pub speed: f32,
    pub base_speed: f32,
    pub speed_vec: Vec2,
    pub update_speed: bool,
    pub direction: f32,
    pub direction_locked: bool,
    pub weight: f32,
    pub base_weight: f32,
    pub gravity: f32,

    // orientation and scale
    pub angle: f32,
    pub relative_angle: f32,
    pub scale_x: f32,
    pub scale_y: f32,
    pub width: f32,
    pub height: f32,

    // animation
    pub framerate: f32,
    pub current_frame: f32,
    pub animating: bool,
    pub animate_once: bool,
    pub handle_x: f32,
    pub handle_y: f32,
    pub auto_center: bool,

    // lifecycle
    pub dob: f32,
    pub age: f32,
    pub lifetime: f32,
    pub rpt_age_a: f32,
    pub rpt_age_c: f32,
    pub a_cycles: i32,
    pub c_cycles: i32,
    pub dead: u8,

    // previous-tick capture for tweened drawing
    pub old_x: f32,
    pub old_y: f32,
    pub old_wx: f32,
    pub old_wy: f32,
    pub old_z: f32,
    pub old_angle: f32,
    pub old_relative_angle: f32,
    pub old_scale_x: f32,
    pub old_scale_y: f32,
    pub old_current_frame: f32,
}

impl Default for EntityState {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            wx: 0.0,
            wy: 0.0,
            z: 1.0,
            relative: true,
            matrix: Mat2::IDENTITY,
            red: 255.0,
            green: 255.0,
            blue: 255.0,
            alpha: 1.0,
            speed: 0.0,
            base_speed: 0.0,
            speed_vec: Vec2::ZERO,
            update_speed: true,
            direction: 0.0,
            direction_locked: false,
            weight: 0.0,
            base_weight: 0.0,
            gravity: 0.0,
            angle: 0.0,
            relative_angle: 0.0,
            scale_x: 1.0,
            scale_y: 1.0,
            width: 0.0,
            height: 0.0,
            framerate: 1.0,
            current_frame: 0.0,
            animating: false,
            animate_once: false,
            handle_x: 0.0,
            handle_y: 0.0,
            auto_center: true,
            dob: 0.0,
            age: 0.0,
            lifetime: 0.0,
            rpt_age_a: 0.0,
            rpt_age_c: 0.0,
            a_cycles: 0,
            c_cycles: 0,
            dead: ALIVE,
            old_x: 0.0,
            old_y: 0.0,
            old_wx: 0.0,
            old_wy: 0.0,
            old_z: 1.0,
            old_angle: 0.0,
            old_relative_angle: 0.0,
            old_scale_x: 1.0,
            old_scale_y: 1.0,
            old_current_frame: 0.0,
        }
    }
}

impl EntityState {
    /// Snapshot the tweenable fields as this tick's starting values.
    pub fn capture(&mut self) {
        self.old_z = self.z;
        self.old_wx = self.wx;
        self.old_wy = self.wy;
        self.old_x = self.x;
        self.old_y = self.y;
        self.old_angle = self.angle;
        self.old_relative_angle = self.relative_angle;
        self.old_scale_x = self.scale_x;
        self.old_scale_y = self.scale_y;
        self.old_current_frame = self.current_frame;
    }

    /// One fixed-step update: integrate speed and weight, rebuild the local
    /// matrix, compose with the parent, and advance animation over `frames`
    /// sprite frames.
    pub fn advance(&mut self, cfg: &UpdateConfig, parent: Option<&ParentTransform>, frames: u32) {
        let cut = cfg.current_update_time;
        if self.update_speed && self.speed != 0.0 {
            let pps = self.speed / cut;
            let rad = self.direction.to_radians();
            self.speed_vec = Vec2::new(rad.sin() * pps, rad.cos() * pps);
            self.x += self.speed_vec.x * self.z;
            self.y -= self.speed_vec.y * self.z;
        }
        if self.weight != 0.0 {
            self.gravity += self.weight / cut;
            self.y += (self.gravity / cut) * self.z;
        }
        if self.relative {
            self.matrix = Mat2::from_angle(self.angle.to_radians());
        }
        self.compose_world(parent);
        if parent.is_none() {
            self.relative_angle = self.angle;
        }
        if frames > 0 && self.animating {
            self.current_frame += self.framerate / cut;
            if self.animate_once {
                self.current_frame = self.current_frame.clamp(0.0, (frames - 1) as f32);
            }
        }
    }

    /// Recompute the local matrix and world position without integrating
    /// motion. Used after a spawn or an edge reposition has moved the entity
    /// directly.
    pub fn mini_update(&mut self, parent: Option<&ParentTransform>) {
        self.matrix = Mat2::from_angle(self.angle.to_radians());
        if let Some(p) = parent {
            self.z = p.z;
        }
        self.compose_world(parent);
    }

    fn compose_world(&mut self, parent: Option<&ParentTransform>) {
        match parent {
            Some(p) if self.relative => {
                self.z = p.z;
                self.matrix = p.matrix * self.matrix;
                let rot = p.matrix * Vec2::new(self.x, self.y);
                if self.z != 1.0 {
                    self.wx = p.wx + rot.x * self.z;
                    self.wy = p.wy + rot.y * self.z;
                } else {
                    self.wx = p.wx + rot.x;
                    self.wy = p.wy + rot.y;
                }
                self.relative_angle = p.relative_angle + self.angle;
            }
            _ => {
                self.wx = self.x;
                self.wy = self.y;
            }
        }
    }

    /// View of this entity as a parent for its children.
    pub fn as_parent(&self) -> ParentTransform {
        ParentTransform {
            wx: self.wx,
            wy: self.wy,
            z: self.z,
            relative_angle: self.relative_angle,
            matrix: self.matrix,
        }
    }

    /// Set `x`, keeping `old_x` coherent: before the first update of a life
    /// the old value snaps to the new position instead of tweening from
    /// wherever the state was left.
    pub fn set_x(&mut self, x: f32) {
        self.old_x = if self.age > 0.0 { self.x } else { x };
        self.x = x;
    }

    pub fn set_y(&mut self, y: f32) {
        self.old_y = if self.age > 0.0 { self.y } else { y };
        self.y = y;
    }

    pub fn set_z(&mut self, z: f32) {
        self.old_z = if self.age > 0.0 { self.z } else { z };
        self.z = z;
    }
}

// ---------------------------------------------------------------------------
// helpers
// ---------------------------------------------------------------------------

/// Interpolate between last tick's value and this tick's by `t` in 0..1.
pub fn tween(old: f32, now: f32, t: f32) -> f32 {
    old + (now - old) * t
}

/// Bearing in degrees from one point to another, 0 = up, clockwise, always
/// in `[0, 360)`.
pub fn direction_to(from_x: f32, from_y: f32, to_x: f32, to_y: f32) -> f32 {
    ((to_y - from_y).atan2(to_x - from_x).to_degrees() + 450.0).rem_euclid(360.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn speed_moves_along_direction() {
        let cfg = UpdateConfig::default();
        let mut e = EntityState {
            speed: 60.0,
            direction: 0.0,
            relative: false,
            ..Default::default()
        };
        e.advance(&cfg, None, 0);
        // direction 0 is straight up: y decreases, x untouched
        assert!(e.y < 0.0);
        assert!(e.x.abs() < 1e-4);
    }

    #[test]
    fn weight_accumulates_gravity() {
        let cfg = UpdateConfig::default();
        let mut e = EntityState {
            weight: 30.0,
            relative: false,
            ..Default::default()
        };
        e.advance(&cfg, None, 0);
        let after_one = e.y;
        e.advance(&cfg, None, 0);
        // gravity keeps integrating, so the second step falls further
        assert!(e.y - after_one > after_one);
    }

    #[test]
    fn relative_child_composes_with_parent() {
        let cfg = UpdateConfig::default();
        let parent = ParentTransform {
            wx: 100.0,
            wy: 50.0,
            z: 1.0,
            relative_angle: 90.0,
            matrix: Mat2::from_angle(90.0_f32.to_radians()),
        };
        let mut e = EntityState {
            x: 10.0,
            y: 0.0,
            angle: 15.0,
            ..Default::default()
        };
        e.advance(&cfg, Some(&parent), 0);
        // parent rotation carries the local offset around
        let rotated = parent.matrix * Vec2::new(10.0, 0.0);
        assert!((e.wx - (100.0 + rotated.x)).abs() < 1e-4);
        assert!((e.wy - (50.0 + rotated.y)).abs() < 1e-4);
        assert_eq!(e.relative_angle, 105.0);
    }

    #[test]
    fn non_relative_world_is_local() {
        let cfg = UpdateConfig::default();
        let parent = ParentTransform {
            wx: 100.0,
            wy: 50.0,
            z: 2.0,
            relative_angle: 0.0,
            matrix: Mat2::IDENTITY,
        };
        let mut e = EntityState {
            x: 7.0,
            y: -3.0,
            relative: false,
            ..Default::default()
        };
        e.advance(&cfg, Some(&parent), 0);
        assert_eq!((e.wx, e.wy), (7.0, -3.0));
    }

    #[test]
    fn animate_once_clamps_to_last_frame() {
        let cfg = UpdateConfig::default();
        let mut e = EntityState {
            animating: true,
            animate_once: true,
            framerate: 10_000.0,
            ..Default::default()
        };
        e.advance(&cfg, None, 8);
        assert_eq!(e.current_frame, 7.0);
    }

    #[test]
    fn set_position_before_first_update_snaps_old() {
        let mut e = EntityState::default();
        e.set_x(40.0);
        assert_eq!(e.old_x, 40.0);
        e.age = 100.0;
        e.set_x(60.0);
        assert_eq!(e.old_x, 40.0);
    }

    #[test]
    fn direction_to_compass_quadrants() {
        assert!((direction_to(0.0, 0.0, 0.0, -1.0) - 0.0).abs() < 1e-3);
        assert!((direction_to(0.0, 0.0, 1.0, 0.0) - 90.0).abs() < 1e-3);
        assert!((direction_to(0.0, 0.0, 0.0, 1.0) - 180.0).abs() < 1e-3);
        assert!((direction_to(0.0, 0.0, -1.0, 0.0) - 270.0).abs() < 1e-3);
    }
}
