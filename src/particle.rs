//! Pooled particles.
//!
//! A [`Particle`] is a thin [`EntityState`] plus the values rolled for it at
//! spawn time. All per-tick behavior is applied by the owning emitter; the
//! particle itself only carries state. Particles live in the
//! [`ParticlePool`](crate::manager::ParticlePool) and are referenced by index
//! everywhere else.

use std::sync::Arc;

use crate::effect::Effect;
use crate::entity::{BlendMode, EntityState};
use crate::library::AnimImage;

#[derive(Clone, Debug, Default)]
pub struct Particle {
    pub base: EntityState,
    pub avatar: Option<Arc<AnimImage>>,
    pub blend: BlendMode,

    // values rolled at spawn
    pub emission_angle: f32,
    pub direction_variation: f32,
    pub spin_variation: f32,
    pub g_size_x: f32,
    pub g_size_y: f32,

    // random-motion accumulators
    pub random_direction: f32,
    pub random_speed: f32,
    pub time_tracker: f32,

    // pool and draw bookkeeping
    /// Currently grabbed from the pool.
    pub active: bool,
    /// Draw sublayer within the owning effect's layer, 0..9.
    pub layer: usize,
    /// Manager layer of the owning effect.
    pub effect_layer: usize,
    /// Held in the owning effect's buckets rather than the manager's.
    pub grouped: bool,
    /// Spawned by a single-particle emitter; loops until released.
    pub single: bool,
    /// A single particle flagged to die at the end of its current loop.
    pub release_single: bool,
    pub handle_center: bool,
    pub angle_relative: bool,

    /// Live sub-effects cloned from the emitter's prototypes at spawn.
    pub sub_effects: Vec<Effect>,
}

impl Particle {
    /// Return the particle to its pristine state before it goes back to the
    /// pool.
    pub fn reset(&mut self) {
        *self = Particle::default();
    }

    /// Diagonal of the sprite as drawn, used as a culling margin.
    pub fn image_diameter(&self) -> f32 {
        let Some(image) = &self.avatar else {
            return 0.0;
        };
        let w = image.width * self.base.scale_x.abs() * self.base.z;
        let h = image.height * self.base.scale_y.abs() * self.base.z;
        (w * w + h * h).sqrt()
    }
}
