//! Emitters: spawn engines and per-tick particle control.
//!
//! An [`Emitter`] owns roughly thirty [`AttributeCurve`]s split across two
//! time bases: base curves sampled at the parent effect's current frame when
//! particles spawn, and over-life curves resampled every tick for each live
//! particle. The emitter writes all particle state; particles themselves are
//! passive.

use bevy::prelude::*;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::attributes::AttributeCurve;
use crate::effect::{Effect, EffectClass, EffectCtx, EffectParent, EmissionType, EndBehavior};
use crate::entity::{ALIVE, DEAD, EDGE_KILLED, EntityState, direction_to, tween};
use crate::library::{
    AnimImage, MAX_DIRECTION_VARIATION, MAX_VELOCITY_VARIATION, MOTION_VARIATION_INTERVAL,
    UpdateConfig,
};
use crate::manager::{LayerBuckets, ParticleIndex, ParticlePool, UpdateCtx};

// ---------------------------------------------------------------------------
// Enums and flags
// ---------------------------------------------------------------------------

/// How a spawned particle's sprite rotation is chosen.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, Reflect)]
pub enum AngleType {
    /// Face the direction of travel.
    #[default]
    Align,
    /// Random rotation up to the angle offset.
    Random,
    /// Fixed rotation equal to the angle offset.
    Specify,
}

bitflags! {
    /// Degenerate-curve shortcuts recomputed by [`Emitter::analyse`]. A set
    /// flag skips work whose result would be identical to evaluating a
    /// constant-zero curve.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Bypass: u16 {
        const WEIGHT = 1 << 0;
        const SPEED = 1 << 1;
        const SPIN = 1 << 2;
        const DIRECTION_VARIATION = 1 << 3;
        const COLOR = 1 << 4;
        const SCALE_X = 1 << 5;
        const SCALE_Y = 1 << 6;
        const LIFE_VARIATION = 1 << 7;
        const FRAMERATE = 1 << 8;
        const STRETCH = 1 << 9;
        const SPLATTER = 1 << 10;
    }
}

// ---------------------------------------------------------------------------
// EmitterCurves — the full authored curve set
// ---------------------------------------------------------------------------

/// Every curve an emitter is authored with. Shared between the template and
/// its live instances; [`Emitter::compile_all`] copies-on-write when tables
/// need rebuilding.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EmitterCurves {
    // base curves, sampled at the effect's current frame at spawn
    pub life: AttributeCurve,
    pub life_variation: AttributeCurve,
    pub amount: AttributeCurve,
    pub amount_variation: AttributeCurve,
    pub size_x: AttributeCurve,
    pub size_y: AttributeCurve,
    pub size_x_variation: AttributeCurve,
    pub size_y_variation: AttributeCurve,
    pub base_speed: AttributeCurve,
    pub speed_variation: AttributeCurve,
    pub base_weight: AttributeCurve,
    pub weight_variation: AttributeCurve,
    pub base_spin: AttributeCurve,
    pub spin_variation: AttributeCurve,
    pub emission_angle: AttributeCurve,
    pub emission_range: AttributeCurve,
    pub splatter: AttributeCurve,
    pub direction_variation: AttributeCurve,
    // over-life curves, resampled along each particle's lifetime
    pub alpha: AttributeCurve,
    pub red: AttributeCurve,
    pub green: AttributeCurve,
    pub blue: AttributeCurve,
    pub scale_x: AttributeCurve,
    pub scale_y: AttributeCurve,
    pub spin: AttributeCurve,
    pub velocity: AttributeCurve,
    pub weight: AttributeCurve,
    pub direction: AttributeCurve,
    pub direction_variation_ot: AttributeCurve,
    pub framerate: AttributeCurve,
    pub stretch: AttributeCurve,
    // global adjuster on effect time
    pub global_velocity: AttributeCurve,
}

impl Default for EmitterCurves {
    fn default() -> Self {
        use crate::library::*;
        Self {
            life: AttributeCurve::new(LIFE_MIN, LIFE_MAX),
            life_variation: AttributeCurve::new(LIFE_MIN, LIFE_MAX),
            amount: AttributeCurve::new(AMOUNT_MIN, AMOUNT_MAX),
            amount_variation: AttributeCurve::new(AMOUNT_MIN, AMOUNT_MAX),
            size_x: AttributeCurve::new(DIMENSIONS_MIN, DIMENSIONS_MAX),
            size_y: AttributeCurve::new(DIMENSIONS_MIN, DIMENSIONS_MAX),
            size_x_variation: AttributeCurve::new(DIMENSIONS_MIN, DIMENSIONS_MAX),
            size_y_variation: AttributeCurve::new(DIMENSIONS_MIN, DIMENSIONS_MAX),
            base_speed: AttributeCurve::new(VELOCITY_MIN, VELOCITY_MAX),
            speed_variation: AttributeCurve::new(VELOCITY_MIN, VELOCITY_MAX),
            base_weight: AttributeCurve::new(WEIGHT_MIN, WEIGHT_MAX),
            weight_variation: AttributeCurve::new(WEIGHT_VARIATION_MIN, WEIGHT_VARIATION_MAX),
            base_spin: AttributeCurve::new(SPIN_MIN, SPIN_MAX),
            spin_variation: AttributeCurve::new(SPIN_VARIATION_MIN, SPIN_VARIATION_MAX),
            emission_angle: AttributeCurve::new(ANGLE_MIN, ANGLE_MAX),
            emission_range: AttributeCurve::new(EMISSION_RANGE_MIN, EMISSION_RANGE_MAX),
            splatter: AttributeCurve::new(DIMENSIONS_MIN, DIMENSIONS_MAX),
            direction_variation: AttributeCurve::new(GLOBAL_PERCENT_MIN, GLOBAL_PERCENT_MAX),
            alpha: AttributeCurve::new(0.0, 1.0),
            red: AttributeCurve::new(0.0, 0.0),
            green: AttributeCurve::new(0.0, 0.0),
            blue: AttributeCurve::new(0.0, 0.0),
            scale_x: AttributeCurve::new(GLOBAL_PERCENT_MIN, GLOBAL_PERCENT_MAX),
            scale_y: AttributeCurve::new(GLOBAL_PERCENT_MIN, GLOBAL_PERCENT_MAX),
            spin: AttributeCurve::new(SPIN_OVER_TIME_MIN, SPIN_OVER_TIME_MAX),
            velocity: AttributeCurve::new(VELOCITY_OVER_TIME_MIN, VELOCITY_OVER_TIME_MAX),
            weight: AttributeCurve::new(GLOBAL_PERCENT_MIN, GLOBAL_PERCENT_MAX),
            direction: AttributeCurve::new(DIRECTION_OVER_TIME_MIN, DIRECTION_OVER_TIME_MAX),
            direction_variation_ot: AttributeCurve::new(GLOBAL_PERCENT_MIN, GLOBAL_PERCENT_MAX),
            framerate: AttributeCurve::new(FRAMERATE_MIN, FRAMERATE_MAX),
            stretch: AttributeCurve::new(GLOBAL_PERCENT_MIN, GLOBAL_PERCENT_MAX),
            global_velocity: AttributeCurve::new(GLOBAL_PERCENT_MIN, GLOBAL_PERCENT_MAX),
        }
    }
}

/// Base-curve samples cached when a spawn burst begins, so every particle in
/// the burst rolls against the same frame.
#[derive(Clone, Copy, Debug, Default)]
struct SpawnValues {
    life: f32,
    life_variation: f32,
    weight: f32,
    weight_variation: f32,
    speed: f32,
    speed_variation: f32,
    spin: f32,
    spin_variation: f32,
    direction_variation: f32,
    emission_angle: f32,
    size_x: f32,
    size_y: f32,
    size_x_variation: f32,
    size_y_variation: f32,
}

// ---------------------------------------------------------------------------
// Emitter
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Emitter {
    pub name: String,
    pub base: EntityState,
    pub curves: Arc<EmitterCurves>,
    /// Sub-effect prototypes cloned onto every spawned particle.
    pub effects: Vec<Effect>,
    /// Image looked up in the library catalog when the effect is registered.
    pub image_name: String,
    #[serde(skip)]
    pub image: Option<Arc<AnimImage>>,

    // authored configuration
    /// Height follows width so sprites scale uniformly.
    pub uniform: bool,
    pub handle_center: bool,
    pub angle_offset: f32,
    /// Rotation continuously tracks direction of travel.
    pub locked_angle: bool,
    pub angle_type: AngleType,
    /// Drawn rotation includes the inherited relative angle.
    pub angle_relative: bool,
    /// Use the parent effect's emission angle/range instead of our own.
    pub use_effect_emission: bool,
    pub visible: bool,
    pub single_particle: bool,
    pub one_shot: bool,
    pub random_color: bool,
    /// Draw sublayer 0..9 within the effect's layer.
    pub z_layer: usize,
    pub animate: bool,
    pub animate_once: bool,
    pub random_start_frame: bool,
    pub animation_direction: f32,
    pub color_repeat: i32,
    pub alpha_repeat: i32,
    pub particles_relative: bool,
    /// Particles live in the effect's buckets and die with it.
    pub group_particles: bool,
    pub blend: crate::entity::BlendMode,

    #[serde(skip)]
    pub bypass: Bypass,

    // runtime state
    #[serde(skip)]
    counter: f32,
    #[serde(skip)]
    grid_x: f32,
    #[serde(skip)]
    grid_y: f32,
    #[serde(skip)]
    dir_alternator: bool,
    #[serde(skip)]
    started_spawning: bool,
    #[serde(skip)]
    tween_spawns: bool,
    #[serde(skip)]
    pub(crate) dying: bool,
    #[serde(skip)]
    pub(crate) child_particles: Vec<ParticleIndex>,
    #[serde(skip)]
    current: SpawnValues,
}

impl Default for Emitter {
    fn default() -> Self {
        Self {
            name: String::new(),
            base: EntityState::default(),
            curves: Arc::new(EmitterCurves::default()),
            effects: Vec::new(),
            image_name: String::new(),
            image: None,
            uniform: true,
            handle_center: false,
            angle_offset: 0.0,
            locked_angle: false,
            angle_type: AngleType::Align,
            angle_relative: false,
            use_effect_emission: false,
            visible: true,
            single_particle: false,
            one_shot: false,
            random_color: false,
            z_layer: 0,
            animate: false,
            animate_once: false,
            random_start_frame: false,
            animation_direction: 1.0,
            color_repeat: 0,
            alpha_repeat: 0,
            particles_relative: false,
            group_particles: false,
            blend: crate::entity::BlendMode::Alpha,
            bypass: Bypass::empty(),
            counter: 0.0,
            grid_x: 0.0,
            grid_y: 0.0,
            dir_alternator: false,
            started_spawning: false,
            tween_spawns: false,
            dying: false,
            child_particles: Vec::new(),
            current: SpawnValues::default(),
        }
    }
}

impl Emitter {
    /// Fresh, empty emitter.
    pub fn new(name: impl Into<String>) -> Emitter {
        Emitter {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn particle_count(&self) -> usize {
        self.child_particles.len()
    }

    /// Reset transient spawn state after a template clone.
    pub(crate) fn rebase(&mut self, time: f32) {
        self.base.dob = time;
        self.counter = 0.0;
        self.grid_x = 0.0;
        self.grid_y = 0.0;
        self.dir_alternator = false;
        self.started_spawning = false;
        self.tween_spawns = false;
        self.dying = false;
        self.child_particles.clear();
        for sub in &mut self.effects {
            sub.change_dob(time);
        }
    }

    // -- per-tick update ----------------------------------------------------

    /// Advance the emitter and all its particles by one tick. Returns false
    /// when the emitter has died and emptied out, asking the parent effect to
    /// drop it.
    pub(crate) fn update(
        &mut self,
        ctx: &mut UpdateCtx,
        eff: &mut EffectCtx,
        grouped: &mut LayerBuckets,
    ) -> bool {
        self.base.capture();

        self.base.matrix = Mat2::from_angle(self.base.angle.to_radians());
        if self.base.relative {
            self.base.z = eff.transform.z;
            self.base.matrix = eff.transform.matrix * self.base.matrix;
            let rot = eff.transform.matrix * Vec2::new(self.base.x, self.base.y);
            self.base.wx = eff.transform.wx + rot.x * self.base.z;
            self.base.wy = eff.transform.wy + rot.y * self.base.z;
            self.base.relative_angle = eff.transform.relative_angle + self.base.angle;
        } else {
            self.base.wx = self.base.x;
            self.base.wy = self.base.y;
        }

        // the first update has no previous tick to tween from
        if !self.tween_spawns {
            self.base.capture();
            self.tween_spawns = true;
        }

        self.dying = eff.dying;

        let children = std::mem::take(&mut self.child_particles);
        let mut kept = Vec::with_capacity(children.len());
        for index in children {
            if self.update_particle(index, ctx, eff, grouped) {
                kept.push(index);
            }
        }
        self.child_particles = kept;

        if self.base.dead == ALIVE && !self.dying {
            if self.visible && ctx.spawning_allowed {
                self.update_spawns(ctx, eff, grouped);
            }
            true
        } else if self.child_particles.is_empty() {
            false
        } else {
            self.kill(ctx.pool);
            true
        }
    }

    /// Mark this emitter and everything below it dead. Particles live out
    /// their remaining time; single particles stop looping.
    pub(crate) fn kill(&mut self, pool: &mut ParticlePool) {
        self.base.dead = DEAD;
        for index in self.child_particles.clone() {
            pool.get_mut(index).base.dead = DEAD;
            let mut subs = std::mem::take(&mut pool.get_mut(index).sub_effects);
            for sub in &mut subs {
                sub.base.dead = DEAD;
                for emitter in &mut sub.emitters {
                    emitter.kill(pool);
                }
            }
            pool.get_mut(index).sub_effects = subs;
        }
    }

    /// Age one particle, run its sub-effects, and apply over-life control.
    /// Returns false when the particle was released.
    fn update_particle(
        &self,
        index: ParticleIndex,
        ctx: &mut UpdateCtx,
        eff: &EffectCtx,
        grouped: &mut LayerBuckets,
    ) -> bool {
        let emitter_transform = self.base.as_parent();
        let p = ctx.pool.get_mut(index);
        p.base.capture();

        if self.dying || self.one_shot || p.base.dead != ALIVE {
            p.release_single = true;
        }
        if self.single_particle && !p.release_single {
            p.base.age = ctx.current_time - p.base.dob;
            if p.base.age > p.base.lifetime {
                p.base.age = 0.0;
                p.base.dob = ctx.current_time;
            }
        } else {
            p.base.age = ctx.current_time - p.base.dob;
        }

        let frames = p.avatar.as_ref().map(|a| a.frame_count()).unwrap_or(0);
        p.base.advance(ctx.cfg, Some(&emitter_transform), frames);

        // sub-effects are children of the particle: they follow its
        // transform and cascade from this emitter's parent effect
        let mut subs = std::mem::take(&mut ctx.pool.get_mut(index).sub_effects);
        if !subs.is_empty() {
            let parent = EffectParent {
                transform: ctx.pool.get(index).base.as_parent(),
                values: eff.values,
                dying: self.dying,
            };
            subs.retain_mut(|sub| sub.update(ctx, Some(&parent)));
        }

        let p = ctx.pool.get_mut(index);
        if p.base.age > p.base.lifetime || p.base.dead == EDGE_KILLED {
            p.base.dead = DEAD;
            if subs.is_empty() {
                let (was_grouped, sublayer) = (p.grouped, p.layer);
                if was_grouped {
                    let bucket = &mut grouped[sublayer];
                    if let Some(pos) = bucket.iter().position(|&i| i == index) {
                        bucket.remove(pos);
                    }
                }
                ctx.release_particle(index);
                return false;
            }
            self.control_particle(ctx.pool.get_mut(index), ctx.cfg, eff);
            for sub in &mut subs {
                sub.base.dead = DEAD;
                for emitter in &mut sub.emitters {
                    emitter.kill(ctx.pool);
                }
            }
            ctx.pool.get_mut(index).sub_effects = subs;
            return true;
        }

        self.control_particle(ctx.pool.get_mut(index), ctx.cfg, eff);
        ctx.pool.get_mut(index).sub_effects = subs;
        true
    }

    // -- spawning -----------------------------------------------------------

    fn update_spawns(&mut self, ctx: &mut UpdateCtx, eff: &mut EffectCtx, grouped: &mut LayerBuckets) {
        let frame = eff.current_effect_frame;
        let qty = ((self.curves.amount.get(frame)
            + rnd(self.curves.amount_variation.get(frame)))
            * eff.values.amount
            * ctx.global_amount_scale
            * ctx.local_amount_scale)
            / ctx.cfg.update_frequency;
        if !self.single_particle {
            self.counter += qty;
        }
        let mut count = self.counter as i32;
        if count < 1 && !(self.single_particle && !self.started_spawning) {
            return;
        }
        if self.single_particle {
            count = if self.started_spawning {
                0
            } else {
                match eff.class {
                    EffectClass::Point => 1,
                    EffectClass::Area => eff.grid_x * eff.grid_y,
                    EffectClass::Line | EffectClass::Ellipse => eff.grid_x,
                }
            };
        }

        // sample every base curve once for the burst
        self.current.life = self.curves.life.get(frame) * eff.values.life;
        if !self.bypass.contains(Bypass::WEIGHT) {
            self.current.weight = self.curves.base_weight.get(frame);
            self.current.weight_variation = self.curves.weight_variation.get(frame);
        }
        if !self.bypass.contains(Bypass::SPEED) {
            self.current.speed = self.curves.base_speed.get(frame);
            self.current.speed_variation = self.curves.speed_variation.get(frame);
        }
        if !self.bypass.contains(Bypass::SPIN) {
            self.current.spin = self.curves.base_spin.get(frame);
            self.current.spin_variation = self.curves.spin_variation.get(frame);
        }
        self.current.direction_variation = self.curves.direction_variation.get(frame);
        let emission_range;
        if self.use_effect_emission {
            emission_range = eff.values.emission_range;
            self.current.emission_angle = eff.values.emission_angle;
        } else {
            emission_range = self.curves.emission_range.get(frame);
            self.current.emission_angle = self.curves.emission_angle.get(frame);
        }
        self.current.life_variation = self.curves.life_variation.get(frame);
        self.current.size_x = self.curves.size_x.get(frame);
        self.current.size_y = self.curves.size_y.get(frame);
        self.current.size_x_variation = self.curves.size_x_variation.get(frame);
        self.current.size_y_variation = self.curves.size_y_variation.get(frame);

        for c in 1..=count {
            self.started_spawning = true;
            let Some(index) = ctx.pool.grab() else {
                continue;
            };
            {
                let p = ctx.pool.get_mut(index);
                p.layer = self.z_layer.min(9);
                p.effect_layer = eff.effect_layer;
                p.grouped = self.group_particles;
                p.base.dob = ctx.current_time;
            }
            if self.group_particles {
                grouped[self.z_layer.min(9)].push(index);
            } else {
                ctx.insert_bucket(eff.effect_layer, self.z_layer.min(9), index);
            }

            if eff.traverse_edge && eff.class == EffectClass::Line {
                self.particles_relative = true;
            }
            ctx.pool.get_mut(index).base.relative = self.particles_relative;

            self.position_spawn(ctx.pool.get_mut(index), eff, c, count);

            let p = ctx.pool.get_mut(index);
            p.base.z = self.base.z;
            p.base.old_z = self.base.z;

            p.avatar = self.image.clone();
            p.base.handle_x = self.base.handle_x;
            p.base.handle_y = self.base.handle_y;
            p.handle_center = self.handle_center;
            p.angle_relative = self.angle_relative;
            p.single = self.single_particle;
            p.blend = self.blend;

            p.base.lifetime = (self.current.life
                + rnd_range(-self.current.life_variation, self.current.life_variation)
                    * eff.values.life)
                .trunc();

            // speed
            p.base.speed_vec = Vec2::ZERO;
            if !self.bypass.contains(Bypass::SPEED) {
                let variation =
                    rnd_range(-self.current.speed_variation, self.current.speed_variation);
                p.base.base_speed = (self.current.speed + variation) * eff.values.velocity;
                p.base.speed = self.curves.velocity.get(0.0)
                    * p.base.base_speed
                    * self.curves.global_velocity.get(0.0);
            } else {
                p.base.speed = 0.0;
            }

            // size
            p.g_size_x = eff.values.size_x;
            p.g_size_y = eff.values.size_y;
            let image_width = self.image.as_ref().map(|i| i.width).unwrap_or(1.0);
            let image_height = self.image.as_ref().map(|i| i.height).unwrap_or(1.0);
            let scale_temp = self.curves.scale_x.get(0.0);
            p.base.width = rnd(self.current.size_x_variation) + self.current.size_x;
            p.base.scale_x = if scale_temp != 0.0 {
                (p.base.width / image_width) * scale_temp * p.g_size_x
            } else {
                0.0
            };
            if self.uniform {
                p.base.scale_y = p.base.scale_x;
                if !self.bypass.contains(Bypass::STRETCH) {
                    p.base.scale_y = (self.curves.scale_x.get(0.0)
                        * p.g_size_x
                        * (p.base.width
                            + p.base.speed.abs()
                                * self.curves.stretch.get(0.0)
                                * eff.values.stretch))
                        / image_width;
                    if p.base.scale_y < p.base.scale_x {
                        p.base.scale_y = p.base.scale_x;
                    }
                }
            } else {
                let scale_temp = self.curves.scale_y.get(0.0);
                p.base.height = rnd(self.current.size_y_variation) + self.current.size_y;
                p.base.scale_y = if scale_temp != 0.0 {
                    (p.base.height / image_height) * scale_temp * p.g_size_y
                } else {
                    0.0
                };
                if !self.bypass.contains(Bypass::STRETCH) && p.base.speed != 0.0 {
                    p.base.scale_y = (self.curves.scale_y.get(0.0)
                        * p.g_size_y
                        * (p.base.height
                            + p.base.speed.abs()
                                * self.curves.stretch.get(0.0)
                                * eff.values.stretch))
                        / image_height;
                    if p.base.scale_y < p.base.scale_x {
                        p.base.scale_y = p.base.scale_x;
                    }
                }
            }

            // splatter: uniform within a disc of the splatter radius
            if !self.bypass.contains(Bypass::SPLATTER) {
                let radius = self.curves.splatter.get(frame);
                let mut splat_x = rnd_range(-radius, radius);
                let mut splat_y = rnd_range(-radius, radius);
                while radius > 0.0 && (splat_x * splat_x + splat_y * splat_y).sqrt() >= radius {
                    splat_x = rnd_range(-radius, radius);
                    splat_y = rnd_range(-radius, radius);
                }
                let p = ctx.pool.get_mut(index);
                if self.base.z == 1.0 || p.base.relative {
                    p.base.x += splat_x;
                    p.base.y += splat_y;
                } else {
                    p.base.x += splat_x * self.base.z;
                    p.base.y += splat_y * self.base.z;
                }
            }

            let emitter_transform = self.base.as_parent();
            let p = ctx.pool.get_mut(index);
            p.base.mini_update(Some(&emitter_transform));

            // direction of travel
            if eff.traverse_edge && eff.class == EffectClass::Line {
                p.base.direction_locked = true;
                p.base.direction = 90.0;
            } else {
                self.roll_direction(p, eff, emission_range);
            }

            if !self.bypass.contains(Bypass::SPIN) {
                p.spin_variation =
                    rnd_range(-self.current.spin_variation, self.current.spin_variation)
                        + self.current.spin;
            }

            // weight
            if !self.bypass.contains(Bypass::WEIGHT) {
                p.base.weight = self.curves.weight.get(0.0);
                let variation =
                    rnd_range(-self.current.weight_variation, self.current.weight_variation);
                p.base.base_weight = (self.current.weight + variation) * eff.values.weight;
            }

            // sprite rotation
            if self.locked_angle {
                if !self.bypass.contains(Bypass::WEIGHT)
                    && !self.bypass.contains(Bypass::SPEED)
                    && !eff.bypass_weight
                {
                    let rad = p.base.direction.to_radians();
                    p.base.speed_vec = Vec2::new(rad.sin(), rad.cos());
                    p.base.angle =
                        direction_to(0.0, 0.0, p.base.speed_vec.x, -p.base.speed_vec.y);
                } else if eff.traverse_edge {
                    p.base.angle = eff.angle + self.angle_offset;
                } else {
                    p.base.angle = p.base.direction + self.base.angle + self.angle_offset;
                }
            } else {
                match self.angle_type {
                    AngleType::Align => {
                        p.base.angle = if eff.traverse_edge {
                            eff.angle + self.angle_offset
                        } else {
                            p.base.direction + self.angle_offset
                        };
                    }
                    AngleType::Random => p.base.angle = rnd(self.angle_offset),
                    AngleType::Specify => p.base.angle = self.angle_offset,
                }
            }

            // color
            if self.random_color {
                let random_age = rnd(self.curves.red.last_frame() as f32);
                let lifetime = p.base.lifetime;
                p.base.red = channel(self.curves.red.get_over_life(random_age, lifetime, ctx.cfg));
                p.base.green =
                    channel(self.curves.green.get_over_life(random_age, lifetime, ctx.cfg));
                p.base.blue =
                    channel(self.curves.blue.get_over_life(random_age, lifetime, ctx.cfg));
            } else {
                p.base.red = channel(self.curves.red.get(0.0));
                p.base.green = channel(self.curves.green.get(0.0));
                p.base.blue = channel(self.curves.blue.get(0.0));
            }
            p.base.alpha =
                self.curves.alpha.get_over_life(0.0, p.base.lifetime, ctx.cfg) * eff.values.alpha;

            // animation
            p.base.animating = self.animate;
            p.base.animate_once = self.animate_once;
            p.base.framerate = self.curves.framerate.get(0.0);
            p.base.current_frame = if self.random_start_frame {
                rnd(p.avatar.as_ref().map(|a| a.frame_count()).unwrap_or(1) as f32)
            } else {
                self.base.current_frame
            };

            // rotation basis for non-relative particles
            if !p.base.relative {
                p.base.matrix = eff.transform.matrix * Mat2::from_angle(self.base.angle.to_radians());
            }
            p.base.relative_angle = eff.transform.relative_angle + p.base.angle;
            p.base.capture();

            // attach sub-effect instances
            let mut subs = Vec::with_capacity(self.effects.len());
            for proto in &self.effects {
                let mut sub = proto.instance(ctx.current_time);
                sub.effect_layer = eff.effect_layer;
                subs.push(sub);
            }
            ctx.pool.get_mut(index).sub_effects = subs;
            self.child_particles.push(index);
            eff.particles_created = true;
        }
        self.counter -= count as f32;
    }

    /// Place a particle according to the parent effect's class geometry.
    /// `c`/`count` index the particle within this tick's burst for intra-tick
    /// position tweening.
    fn position_spawn(&mut self, p: &mut crate::particle::Particle, eff: &EffectCtx, c: i32, count: i32) {
        match eff.class {
            EffectClass::Point => {
                if p.base.relative {
                    p.base.set_x(-eff.handle_x);
                    p.base.set_y(-eff.handle_y);
                } else {
                    let t = c as f32 / count as f32;
                    if eff.handle_center || eff.handle_x + eff.handle_y == 0.0 {
                        p.base.set_x(tween(self.base.old_wx, self.base.wx, t));
                        p.base.set_y(tween(self.base.old_wy, self.base.wy, t));
                        if self.base.z != 1.0 {
                            p.base.wx = p.base.x - eff.handle_x * self.base.z;
                            p.base.wy = p.base.y - eff.handle_y * self.base.z;
                        } else {
                            p.base.wx = p.base.x - eff.handle_x;
                            p.base.wy = p.base.y - eff.handle_y;
                        }
                    } else {
                        p.base.set_x(-eff.handle_x);
                        p.base.set_y(-eff.handle_y);
                        let rot = eff.transform.matrix * Vec2::new(p.base.x, p.base.y);
                        p.base.set_x(tween(self.base.old_wx, self.base.wx, t) + rot.x);
                        p.base.set_y(tween(self.base.old_wy, self.base.wy, t) + rot.y);
                        if self.base.z != 1.0 {
                            p.base.wx = p.base.x * self.base.z;
                            p.base.wy = p.base.y * self.base.z;
                        } else {
                            p.base.wx = p.base.x;
                            p.base.wy = p.base.y;
                        }
                    }
                }
            }
            EffectClass::Area => {
                if eff.emit_at_points {
                    if eff.spawn_direction == -1.0 {
                        self.grid_x += eff.spawn_direction;
                        if self.grid_x < 0.0 {
                            self.grid_x = (eff.grid_x - 1) as f32;
                            self.grid_y += eff.spawn_direction;
                            if self.grid_y < 0.0 {
                                self.grid_y = (eff.grid_y - 1) as f32;
                            }
                        }
                    }
                    if eff.grid_x > 1 {
                        p.base.set_x(
                            self.grid_x / (eff.grid_x - 1) as f32 * eff.values.width
                                - eff.handle_x,
                        );
                    } else {
                        p.base.set_x(-eff.handle_x);
                    }
                    if eff.grid_y > 1 {
                        p.base.set_y(
                            self.grid_y / (eff.grid_y - 1) as f32 * eff.values.height
                                - eff.handle_y,
                        );
                    } else {
                        p.base.set_y(-eff.handle_y);
                    }
                    if eff.spawn_direction == 1.0 {
                        self.grid_x += eff.spawn_direction;
                        if self.grid_x >= eff.grid_x as f32 {
                            self.grid_x = 0.0;
                            self.grid_y += eff.spawn_direction;
                            if self.grid_y >= eff.grid_y as f32 {
                                self.grid_y = 0.0;
                            }
                        }
                    }
                } else {
                    p.base.set_x(rnd(eff.values.width) - eff.handle_x);
                    p.base.set_y(rnd(eff.values.height) - eff.handle_y);
                }
                self.to_world(p, eff);
            }
            EffectClass::Ellipse => {
                let tx = eff.values.width / 2.0;
                let ty = eff.values.height / 2.0;
                let th;
                if eff.emit_at_points {
                    let grid_max = eff.grid_x.max(1);
                    self.grid_x += eff.spawn_direction;
                    if self.grid_x >= grid_max as f32 {
                        self.grid_x = 0.0;
                    } else if self.grid_x < 0.0 {
                        self.grid_x = (grid_max - 1) as f32;
                    }
                    th = self.grid_x * (eff.ellipse_arc / grid_max as f32) + eff.ellipse_offset;
                } else {
                    th = rnd(eff.ellipse_arc) + eff.ellipse_offset;
                }
                p.base.set_x(th.to_radians().cos() * tx - eff.handle_x + tx);
                p.base.set_y(-th.to_radians().sin() * ty - eff.handle_y + ty);
                self.to_world(p, eff);
            }
            EffectClass::Line => {
                if !eff.traverse_edge {
                    if eff.emit_at_points {
                        if eff.spawn_direction == -1.0 {
                            self.grid_x += eff.spawn_direction;
                            if self.grid_x < 0.0 {
                                self.grid_x = (eff.grid_x - 1) as f32;
                            }
                        }
                        if eff.grid_x > 1 {
                            p.base.set_x(
                                self.grid_x / (eff.grid_x - 1) as f32 * eff.values.width
                                    - eff.handle_x,
                            );
                        } else {
                            p.base.set_x(-eff.handle_x);
                        }
                        p.base.set_y(-eff.handle_y);
                        if eff.spawn_direction == 1.0 {
                            self.grid_x += eff.spawn_direction;
                            if self.grid_x >= eff.grid_x as f32 {
                                self.grid_x = 0.0;
                            }
                        }
                    } else {
                        p.base.set_x(rnd(eff.values.width) - eff.handle_x);
                        p.base.set_y(-eff.handle_y);
                    }
                } else if eff.distance_set_by_life {
                    p.base.set_x(-eff.handle_x);
                    p.base.set_y(-eff.handle_y);
                } else if eff.emit_at_points {
                    if eff.spawn_direction == -1.0 {
                        self.grid_x += eff.spawn_direction;
                        if self.grid_x < 0.0 {
                            self.grid_x = (eff.grid_x - 1) as f32;
                        }
                    }
                    if eff.grid_x > 1 {
                        p.base.set_x(
                            self.grid_x / (eff.grid_x - 1) as f32 * eff.values.width
                                - eff.handle_x,
                        );
                    } else {
                        p.base.set_x(-eff.handle_x);
                    }
                    p.base.set_y(-eff.handle_y);
                    if eff.spawn_direction == 1.0 {
                        self.grid_x += eff.spawn_direction;
                        if self.grid_x >= eff.grid_x as f32 {
                            self.grid_x = 0.0;
                        }
                    }
                } else {
                    p.base.set_x(rnd(eff.values.width) - eff.handle_x);
                    p.base.set_y(-eff.handle_y);
                }
                self.to_world(p, eff);
            }
        }
    }

    /// Rotate a local spawn position into world space for non-relative
    /// particles.
    fn to_world(&self, p: &mut crate::particle::Particle, eff: &EffectCtx) {
        if p.base.relative {
            return;
        }
        let rot = eff.transform.matrix * Vec2::new(p.base.x, p.base.y);
        if self.base.z != 1.0 {
            p.base.set_x(eff.transform.wx + rot.x * self.base.z);
            p.base.set_y(eff.transform.wy + rot.y * self.base.z);
        } else {
            p.base.set_x(eff.transform.wx + rot.x);
            p.base.set_y(eff.transform.wy + rot.y);
        }
    }

    /// Roll emission angle and initial direction for a new particle.
    fn roll_direction(
        &mut self,
        p: &mut crate::particle::Particle,
        eff: &EffectCtx,
        emission_range: f32,
    ) {
        if eff.class != EffectClass::Point {
            if !self.bypass.contains(Bypass::SPEED) || self.angle_type == AngleType::Align {
                p.emission_angle =
                    self.current.emission_angle + rnd_range(-emission_range, emission_range);
                // aim away from or towards the emitter handle
                let adjust = match eff.emission_type {
                    EmissionType::Inwards => Some(false),
                    EmissionType::Outwards => Some(true),
                    EmissionType::InAndOut => {
                        self.dir_alternator = !self.dir_alternator;
                        Some(self.dir_alternator)
                    }
                    EmissionType::Specified => None,
                };
                if let Some(outwards) = adjust {
                    let bearing = if p.base.relative {
                        if outwards {
                            direction_to(0.0, 0.0, p.base.x, p.base.y)
                        } else {
                            direction_to(p.base.x, p.base.y, 0.0, 0.0)
                        }
                    } else if outwards {
                        direction_to(self.base.wx, self.base.wy, p.base.wx, p.base.wy)
                    } else {
                        direction_to(p.base.wx, p.base.wy, self.base.wx, self.base.wy)
                    };
                    p.emission_angle += bearing;
                }
            }
        } else {
            p.emission_angle =
                self.current.emission_angle + rnd_range(-emission_range, emission_range);
        }

        if !self.bypass.contains(Bypass::DIRECTION_VARIATION) {
            p.direction_variation = self.current.direction_variation;
            let dv = p.direction_variation * self.curves.direction_variation_ot.get(0.0);
            p.base.direction =
                p.emission_angle + self.curves.direction.get(0.0) + rnd_range(-dv, dv);
        } else {
            p.base.direction = p.emission_angle + self.curves.direction.get(0.0);
        }
    }

    // -- over-life control --------------------------------------------------

    /// Recompute a live particle's animated state from its over-life curves.
    fn control_particle(
        &self,
        p: &mut crate::particle::Particle,
        cfg: &UpdateConfig,
        eff: &EffectCtx,
    ) {
        let lifetime = p.base.lifetime;
        let cut = cfg.current_update_time;

        // alpha
        if self.alpha_repeat > 1 {
            p.base.rpt_age_a += cut * self.alpha_repeat as f32;
            p.base.alpha =
                self.curves.alpha.get_over_life(p.base.rpt_age_a, lifetime, cfg) * eff.values.alpha;
            if p.base.rpt_age_a > lifetime && p.base.a_cycles < self.alpha_repeat {
                p.base.rpt_age_a -= lifetime;
                p.base.a_cycles += 1;
            }
        } else {
            p.base.alpha =
                self.curves.alpha.get_over_life(p.base.age, lifetime, cfg) * eff.values.alpha;
        }

        // rotation
        if self.locked_angle && self.angle_type == AngleType::Align {
            if p.base.direction_locked {
                p.base.angle = eff.angle + self.base.angle + self.angle_offset;
            } else if !self.bypass.contains(Bypass::WEIGHT)
                && (!eff.bypass_weight || p.base.direction != 0.0)
            {
                if p.base.old_wx != p.base.wx && p.base.old_wy != p.base.wy {
                    p.base.angle = if p.base.relative {
                        direction_to(p.base.old_x, p.base.old_y, p.base.x, p.base.y)
                    } else {
                        direction_to(p.base.old_wx, p.base.old_wy, p.base.wx, p.base.wy)
                    };
                    if (p.base.old_angle - p.base.angle).abs() > 180.0 {
                        if p.base.old_angle > p.base.angle {
                            p.base.old_angle -= 360.0;
                        } else {
                            p.base.old_angle += 360.0;
                        }
                    }
                }
            } else {
                p.base.angle = p.base.direction + self.base.angle + self.angle_offset;
            }
        } else if !self.bypass.contains(Bypass::SPIN) {
            p.base.angle += (self.curves.spin.get_over_life(p.base.age, lifetime, cfg)
                * p.spin_variation
                * eff.values.spin)
                / cut;
        }

        // direction and motion randomness
        if p.base.direction_locked {
            p.base.direction = 90.0;
            if eff.class == EffectClass::Line {
                if eff.distance_set_by_life {
                    let life = p.base.age / lifetime;
                    p.base.x = life * eff.values.width - eff.handle_x;
                } else {
                    match eff.end_behavior {
                        EndBehavior::Kill => {
                            if p.base.x > eff.values.width - eff.handle_x
                                || p.base.x < -eff.handle_x
                            {
                                p.base.dead = EDGE_KILLED;
                            }
                        }
                        EndBehavior::LoopAround => {
                            let emitter_transform = self.base.as_parent();
                            if p.base.x > eff.values.width - eff.handle_x {
                                p.base.x = -eff.handle_x;
                                p.base.mini_update(Some(&emitter_transform));
                                p.base.old_x = p.base.x;
                                p.base.old_wx = p.base.wx;
                                p.base.old_wy = p.base.wy;
                            } else if p.base.x < -eff.handle_x {
                                p.base.x = eff.values.width - eff.handle_x;
                                p.base.mini_update(Some(&emitter_transform));
                                p.base.old_x = p.base.x;
                                p.base.old_wx = p.base.wx;
                                p.base.old_wy = p.base.wy;
                            }
                        }
                        EndBehavior::LetFree => {}
                    }
                }
            }
        } else {
            if !self.bypass.contains(Bypass::DIRECTION_VARIATION) {
                let dv = p.direction_variation
                    * self
                        .curves
                        .direction_variation_ot
                        .get_over_life(p.base.age, lifetime, cfg);
                p.time_tracker += cfg.update_time;
                if p.time_tracker > MOTION_VARIATION_INTERVAL {
                    p.random_direction += MAX_DIRECTION_VARIATION * rnd_range(-dv, dv);
                    p.random_speed += MAX_VELOCITY_VARIATION * rnd_range(-dv, dv);
                    p.time_tracker = 0.0;
                }
            }
            p.base.direction = p.emission_angle
                + self.curves.direction.get_over_life(p.base.age, lifetime, cfg)
                + p.random_direction;
        }

        // size
        let image_width = p.avatar.as_ref().map(|i| i.width).unwrap_or(1.0);
        let image_height = p.avatar.as_ref().map(|i| i.height).unwrap_or(1.0);
        if !self.bypass.contains(Bypass::SCALE_X) {
            p.base.scale_x = (self.curves.scale_x.get_over_life(p.base.age, lifetime, cfg)
                * p.g_size_x
                * p.base.width)
                / image_width;
        }
        if self.uniform {
            if !self.bypass.contains(Bypass::SCALE_X) {
                p.base.scale_y = p.base.scale_x;
            }
        } else if !self.bypass.contains(Bypass::SCALE_Y) {
            p.base.scale_y = (self.curves.scale_y.get_over_life(p.base.age, lifetime, cfg)
                * p.g_size_y
                * p.base.height)
                / image_height;
        }

        // color
        if !self.bypass.contains(Bypass::COLOR) && !self.random_color {
            if self.color_repeat > 1 {
                p.base.rpt_age_c += cut * self.color_repeat as f32;
                p.base.red = channel(self.curves.red.get_over_life(p.base.rpt_age_c, lifetime, cfg));
                p.base.green =
                    channel(self.curves.green.get_over_life(p.base.rpt_age_c, lifetime, cfg));
                p.base.blue =
                    channel(self.curves.blue.get_over_life(p.base.rpt_age_c, lifetime, cfg));
                if p.base.rpt_age_c > lifetime && p.base.c_cycles < self.color_repeat {
                    p.base.rpt_age_c -= lifetime;
                    p.base.c_cycles += 1;
                }
            } else {
                p.base.red = channel(self.curves.red.get_over_life(p.base.age, lifetime, cfg));
                p.base.green = channel(self.curves.green.get_over_life(p.base.age, lifetime, cfg));
                p.base.blue = channel(self.curves.blue.get_over_life(p.base.age, lifetime, cfg));
            }
        }

        // animation
        if !self.bypass.contains(Bypass::FRAMERATE) {
            p.base.framerate = self.curves.framerate.get_over_life(p.base.age, lifetime, cfg)
                * self.animation_direction;
        }

        // speed
        if !self.bypass.contains(Bypass::SPEED) {
            p.base.speed = self.curves.velocity.get_over_life(p.base.age, lifetime, cfg)
                * p.base.base_speed
                * self.curves.global_velocity.get(eff.current_effect_frame)
                + p.random_speed;
        } else {
            p.base.speed = p.random_speed;
        }

        // stretch
        if !self.bypass.contains(Bypass::STRETCH) {
            if !self.bypass.contains(Bypass::WEIGHT) && !eff.bypass_weight {
                if p.base.speed != 0.0 {
                    p.base.speed_vec.x /= cut;
                    p.base.speed_vec.y = p.base.speed_vec.y / cut - p.base.gravity;
                } else {
                    p.base.speed_vec = Vec2::new(0.0, -p.base.gravity);
                }
            }
            let (curve, g_size, dim, image_dim) = if self.uniform {
                (&self.curves.scale_x, p.g_size_x, p.base.width, image_width)
            } else {
                (&self.curves.scale_y, p.g_size_y, p.base.height, image_height)
            };
            p.base.scale_y = (curve.get_over_life(p.base.age, lifetime, cfg)
                * g_size
                * (dim
                    + p.base.speed.abs()
                        * self.curves.stretch.get_over_life(p.base.age, lifetime, cfg)
                        * eff.values.stretch))
                / image_dim;
            if p.base.scale_y < p.base.scale_x {
                p.base.scale_y = p.base.scale_x;
            }
        }

        // weight
        if !self.bypass.contains(Bypass::WEIGHT) {
            p.base.weight = self.curves.weight.get_over_life(p.base.age, lifetime, cfg)
                * p.base.base_weight;
        }
    }

    // -- compilation and analysis -------------------------------------------

    /// Longest particle life this emitter can roll, in milliseconds. Over-life
    /// tables span this range.
    pub fn longest_life(&self, parent_life_max: f32) -> f32 {
        (self.curves.life_variation.max_value() + self.curves.life.max_value()) * parent_life_max
    }

    /// Build every lookup table, recurse into sub-effect prototypes, and
    /// recompute bypass flags.
    pub fn compile_all(&mut self, cfg: &UpdateConfig, parent_life_max: f32) {
        let longest_life = self.longest_life(parent_life_max);
        let curves = Arc::make_mut(&mut self.curves);
        let freq = cfg.lookup_frequency;
        curves.life.compile(freq);
        curves.life_variation.compile(freq);
        curves.amount.compile(freq);
        curves.amount_variation.compile(freq);
        curves.size_x.compile(freq);
        curves.size_y.compile(freq);
        curves.size_x_variation.compile(freq);
        curves.size_y_variation.compile(freq);
        curves.base_speed.compile(freq);
        curves.speed_variation.compile(freq);
        curves.base_weight.compile(freq);
        curves.weight_variation.compile(freq);
        curves.base_spin.compile(freq);
        curves.spin_variation.compile(freq);
        curves.emission_angle.compile(freq);
        curves.emission_range.compile(freq);
        curves.splatter.compile(freq);
        curves.direction_variation.compile(freq);
        let ot = cfg.lookup_frequency_over_time;
        curves.alpha.compile_over_life(ot, longest_life);
        curves.red.compile_over_life(ot, longest_life);
        curves.green.compile_over_life(ot, longest_life);
        curves.blue.compile_over_life(ot, longest_life);
        curves.scale_x.compile_over_life(ot, longest_life);
        curves.scale_y.compile_over_life(ot, longest_life);
        curves.spin.compile_over_life(ot, longest_life);
        curves.velocity.compile_over_life(ot, longest_life);
        curves.weight.compile_over_life(ot, longest_life);
        curves.direction.compile_over_life(ot, longest_life);
        curves.direction_variation_ot.compile_over_life(ot, longest_life);
        curves.framerate.compile_over_life(ot, longest_life);
        curves.stretch.compile_over_life(ot, longest_life);
        curves.global_velocity.compile(freq);

        for sub in &mut self.effects {
            sub.compile_all(cfg);
        }
        self.analyse(cfg);
    }

    /// Collapse every over-life table to its frame-zero value. Cheap
    /// recompile for previewing edits; bypass flags are reset but not
    /// re-derived.
    pub fn compile_quick(&mut self, cfg: &UpdateConfig, parent_life_max: f32) {
        let longest_life = self.longest_life(parent_life_max);
        let curves = Arc::make_mut(&mut self.curves);
        for curve in [
            &mut curves.alpha,
            &mut curves.red,
            &mut curves.green,
            &mut curves.blue,
            &mut curves.scale_x,
            &mut curves.scale_y,
            &mut curves.velocity,
            &mut curves.weight,
            &mut curves.direction,
            &mut curves.direction_variation_ot,
            &mut curves.framerate,
            &mut curves.stretch,
        ] {
            let value = curve.get_over_life(0.0, longest_life, cfg);
            curve.clear_table(1);
            curve.set_compiled(0, value);
        }
        let splatter = curves.splatter.get(0.0);
        curves.splatter.clear_table(1);
        curves.splatter.set_compiled(0, splatter);
    }

    /// Derive bypass flags from degenerate curves: a single-slot table whose
    /// value is zero contributes nothing, so the work it drives is skipped.
    pub fn analyse(&mut self, cfg: &UpdateConfig) {
        self.bypass = Bypass::empty();
        let c = &self.curves;

        if degenerate_zero(&c.life_variation) {
            self.bypass |= Bypass::LIFE_VARIATION;
        }
        if c.stretch.get_over_life(0.0, 1.0, cfg) == 0.0 {
            self.bypass |= Bypass::STRETCH;
        }
        if degenerate_zero(&c.framerate) {
            self.bypass |= Bypass::FRAMERATE;
        }
        if degenerate_zero(&c.splatter) {
            self.bypass |= Bypass::SPLATTER;
        }
        if (degenerate_zero(&c.base_weight) && degenerate_zero(&c.weight_variation))
            || degenerate_zero(&c.weight)
        {
            self.bypass |= Bypass::WEIGHT;
        }
        if degenerate_zero(&c.base_speed) && degenerate_zero(&c.speed_variation) {
            self.bypass |= Bypass::SPEED;
        }
        if degenerate_zero(&c.base_spin) && degenerate_zero(&c.spin_variation) {
            self.bypass |= Bypass::SPIN;
        }
        if degenerate_zero(&c.direction_variation) {
            self.bypass |= Bypass::DIRECTION_VARIATION;
        }
        if c.red.node_count() <= 1 {
            self.bypass |= Bypass::COLOR;
        }
        if c.scale_x.node_count() <= 1 {
            self.bypass |= Bypass::SCALE_X;
        }
        if c.scale_y.node_count() <= 1 {
            self.bypass |= Bypass::SCALE_Y;
        }
    }
}

// ---------------------------------------------------------------------------
// helpers
// ---------------------------------------------------------------------------

fn degenerate_zero(curve: &AttributeCurve) -> bool {
    curve.last_frame() == 0 && curve.get(0.0) == 0.0
}

/// Quantize a 0..255 channel value the way the draw pass expects.
fn channel(value: f32) -> f32 {
    value.clamp(0.0, 255.0).trunc()
}

fn rnd(max: f32) -> f32 {
    fastrand::f32() * max
}

fn rnd_range(min: f32, max: f32) -> f32 {
    min + fastrand::f32() * (max - min)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::{ParticleIndex, ParticleManager};

    fn host_effect() -> Effect {
        let mut effect = Effect::new("fx");
        let c = Arc::make_mut(&mut effect.curves);
        c.life.add(0.0, 1.0);
        c.amount.add(0.0, 1.0);
        c.velocity.add(0.0, 1.0);
        c.weight.add(0.0, 1.0);
        c.spin.add(0.0, 1.0);
        c.alpha.add(0.0, 1.0);
        c.size_x.add(0.0, 1.0);
        c.size_y.add(0.0, 1.0);
        c.stretch.add(0.0, 1.0);
        c.global_z.add(0.0, 1.0);
        effect
    }

    fn quiet_emitter(amount_per_sec: f32, life_ms: f32) -> Emitter {
        let mut emitter = Emitter::new("spray");
        let c = Arc::make_mut(&mut emitter.curves);
        c.amount.add(0.0, amount_per_sec);
        c.life.add(0.0, life_ms);
        c.alpha.add(0.0, 1.0);
        emitter
    }

    fn manager() -> ParticleManager {
        ParticleManager::new(512, 1, UpdateConfig::default())
    }

    #[test]
    fn spawn_quota_accumulates_fractionally() {
        // 3/sec at 30 ticks/sec is 0.1 per tick; over 1000 ticks the total
        // must land within one particle of 100
        let mut effect = host_effect();
        effect.emitters.push(quiet_emitter(3.0, 10_000_000.0));
        effect.compile_all(&UpdateConfig::default());

        let mut pm = manager();
        pm.add_effect(&effect, 0);
        for _ in 0..1000 {
            pm.update();
        }
        let spawned = pm.pool().in_use();
        assert!((99..=101).contains(&spawned), "spawned {spawned}");
    }

    #[test]
    fn single_particle_spawns_once_and_persists() {
        let mut effect = host_effect();
        let mut emitter = quiet_emitter(0.0, 100.0);
        emitter.single_particle = true;
        effect.emitters.push(emitter);
        effect.compile_all(&UpdateConfig::default());

        let mut pm = manager();
        pm.add_effect(&effect, 0);
        for _ in 0..300 {
            pm.update();
            assert_eq!(pm.pool().in_use(), 1);
        }
    }

    #[test]
    fn analyse_flags_degenerate_curves() {
        let mut emitter = quiet_emitter(30.0, 100.0);
        emitter.compile_all(&UpdateConfig::default(), 1.0);
        let expected = Bypass::WEIGHT
            | Bypass::SPEED
            | Bypass::SPIN
            | Bypass::DIRECTION_VARIATION
            | Bypass::COLOR
            | Bypass::SCALE_X
            | Bypass::SCALE_Y
            | Bypass::LIFE_VARIATION
            | Bypass::FRAMERATE
            | Bypass::STRETCH
            | Bypass::SPLATTER;
        assert_eq!(emitter.bypass, expected);
    }

    #[test]
    fn analyse_keeps_live_curves() {
        let mut emitter = quiet_emitter(30.0, 100.0);
        {
            let c = Arc::make_mut(&mut emitter.curves);
            c.base_speed.add(0.0, 200.0);
            c.base_weight.add(0.0, 50.0);
            c.weight.add(0.0, 1.0);
            c.scale_x.add(0.0, 1.0);
            c.scale_x.add(100.0, 0.0);
        }
        emitter.compile_all(&UpdateConfig::default(), 1.0);
        assert!(!emitter.bypass.contains(Bypass::SPEED));
        assert!(!emitter.bypass.contains(Bypass::WEIGHT));
        assert!(!emitter.bypass.contains(Bypass::SCALE_X));
        assert!(emitter.bypass.contains(Bypass::SPIN));
    }

    fn particle_states(pm: &ParticleManager) -> Vec<[f32; 10]> {
        (0..pm.pool().capacity())
            .map(ParticleIndex)
            .map(|i| pm.pool().get(i))
            .filter(|p| p.active)
            .map(|p| {
                [
                    p.base.x,
                    p.base.y,
                    p.base.angle,
                    p.base.scale_x,
                    p.base.scale_y,
                    p.base.alpha,
                    p.base.speed,
                    p.base.weight,
                    p.base.framerate,
                    p.base.red,
                ]
            })
            .collect()
    }

    #[test]
    fn bypass_flags_match_evaluating_the_curves() {
        // an emitter full of flat-zero attributes must behave the same
        // whether the analysed shortcuts are taken or every curve is
        // evaluated
        let run = |clear_bypass: bool| {
            let mut effect = host_effect();
            effect.emitters.push(quiet_emitter(60.0, 400.0));
            effect.compile_all(&UpdateConfig::default());

            let mut pm = manager();
            pm.add_effect(&effect, 0);
            for fx in pm.effects_mut(0) {
                for emitter in &mut fx.emitters {
                    assert!(!emitter.bypass.is_empty());
                    if clear_bypass {
                        emitter.bypass = Bypass::empty();
                    }
                }
            }
            for _ in 0..40 {
                pm.update();
            }
            particle_states(&pm)
        };
        let shortcut = run(false);
        let evaluated = run(true);
        assert!(!shortcut.is_empty());
        assert_eq!(shortcut, evaluated);
    }

    #[test]
    fn line_traverse_loops_back_to_the_start() {
        let mut effect = host_effect();
        effect.class = EffectClass::Line;
        effect.traverse_edge = true;
        effect.end_behavior = EndBehavior::LoopAround;
        effect.emit_at_points = true;
        effect.grid_x = 1;
        Arc::make_mut(&mut effect.curves).width.add(0.0, 100.0);

        let mut emitter = quiet_emitter(30.0, 100_000.0);
        {
            let c = Arc::make_mut(&mut emitter.curves);
            c.base_speed.add(0.0, 600.0);
            c.velocity.add(0.0, 1.0);
            c.global_velocity.add(0.0, 1.0);
        }
        effect.emitters.push(emitter);
        effect.compile_all(&UpdateConfig::default());

        let mut pm = manager();
        pm.add_effect(&effect, 0);
        for _ in 0..50 {
            pm.update();
            for i in (0..pm.pool().capacity()).map(ParticleIndex) {
                let p = pm.pool().get(i);
                if p.active {
                    assert!((0.0..=100.0).contains(&p.base.x), "x = {}", p.base.x);
                    assert_eq!(p.base.direction, 90.0);
                }
            }
        }
    }

    #[test]
    fn edge_kill_releases_traversing_particles() {
        let mut effect = host_effect();
        effect.class = EffectClass::Line;
        effect.traverse_edge = true;
        effect.end_behavior = EndBehavior::Kill;
        effect.emit_at_points = true;
        effect.grid_x = 1;
        effect.does_not_timeout = true;
        Arc::make_mut(&mut effect.curves).width.add(0.0, 100.0);

        let mut emitter = quiet_emitter(30.0, 100_000.0);
        {
            let c = Arc::make_mut(&mut emitter.curves);
            c.base_speed.add(0.0, 600.0);
            c.velocity.add(0.0, 1.0);
            c.global_velocity.add(0.0, 1.0);
        }
        effect.emitters.push(emitter);
        effect.compile_all(&UpdateConfig::default());

        let mut pm = manager();
        pm.add_effect(&effect, 0);
        for _ in 0..100 {
            pm.update();
        }
        // ~20 units per tick across a 100 unit line: about six particles
        // in flight at once, nowhere near the hundred spawned
        assert!(pm.pool().in_use() < 10, "in use {}", pm.pool().in_use());
    }
}
