//! # bevy_timelinefx
//!
//! Authored 2D particle effects for Bevy.
//!
//! Effects are built from keyframed attribute curves: an effect scales its
//! emitters over its own timeline, emitters roll per-particle values at spawn
//! and reshape them over each particle's life. Curves compile into lookup
//! tables once, so the per-tick simulation is all table reads. The simulation
//! steps at a fixed frequency and the draw pass tweens between the last two
//! ticks, so rendering stays smooth at any frame rate.
//!
//! Rendering itself is external: implement [`ParticleRenderer`] and hand it
//! to [`ParticleManager::draw`].
//!
//! ## Quick Start
//!
//! ```ignore
//! use bevy::prelude::*;
//! use bevy_timelinefx::{EffectLibrary, TimelineFx, TimelineFxPlugin};
//!
//! fn main() {
//!     App::new()
//!         .add_plugins(DefaultPlugins)
//!         .add_plugins(TimelineFxPlugin)
//!         .add_systems(Startup, setup)
//!         .run();
//! }
//!
//! fn setup(mut commands: Commands) {
//!     let mut fx = TimelineFx::default();
//!     if let Some(library) = EffectLibrary::load("explosions.ron".as_ref(), fx.manager.config())
//!         && let Some(template) = library.effect("big bang")
//!     {
//!         fx.manager.add_effect(template, 0);
//!     }
//!     commands.spawn(fx);
//! }
//! ```

pub mod attributes;
pub mod effect;
pub mod emitter;
pub mod entity;
pub mod library;
pub mod manager;
pub mod particle;

pub use attributes::{AttributeCurve, AttributeNode};
pub use effect::{Effect, EffectClass, EmissionType, EndBehavior};
pub use emitter::{AngleType, Emitter};
pub use entity::BlendMode;
pub use library::{AnimImage, EffectLibrary, UpdateConfig};
pub use manager::{ParticleManager, ParticleRenderer};
pub use particle::Particle;

use bevy::prelude::*;

/// One independent particle simulation. Drive it by adding effects to
/// `manager`; [`TimelineFxPlugin`] steps it at the manager's update
/// frequency.
#[derive(Component, Default)]
pub struct TimelineFx {
    pub manager: ParticleManager,
    accumulator: f32,
}

impl TimelineFx {
    /// Interpolation factor for [`ParticleManager::draw`] this frame: how far
    /// the render time sits between the last two simulation ticks.
    pub fn tween(&self) -> f32 {
        (self.accumulator / self.manager.config().update_time).clamp(0.0, 1.0)
    }
}

/// Fixed-step the simulation from frame time, carrying the remainder so tick
/// rate is independent of frame rate.
fn advance_timeline_fx(time: Res<Time>, mut query: Query<&mut TimelineFx>) {
    for mut fx in &mut query {
        if fx.manager.is_paused() {
            continue;
        }
        fx.accumulator += time.delta_secs() * 1000.0;
        let step = fx.manager.config().update_time;
        // cap catch-up so a long hitch doesn't spiral
        let mut budget = 4;
        while fx.accumulator >= step && budget > 0 {
            fx.accumulator -= step;
            fx.manager.update();
            budget -= 1;
        }
        if budget == 0 {
            fx.accumulator = 0.0;
        }
    }
}

/// Registers reflectable types and the fixed-step update system.
pub struct TimelineFxPlugin;

impl Plugin for TimelineFxPlugin {
    fn build(&self, app: &mut App) {
        app.register_type::<emitter::AngleType>()
            .register_type::<attributes::AttributeCurve>()
            .register_type::<attributes::AttributeNode>()
            .register_type::<library::AnimImage>()
            .register_type::<entity::BlendMode>()
            .register_type::<effect::EffectClass>()
            .register_type::<effect::EmissionType>()
            .register_type::<effect::EndBehavior>()
            .register_type::<library::UpdateConfig>()
            .add_systems(Update, advance_timeline_fx);
    }
}
