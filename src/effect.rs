//! Effects: the top of the particle tree.
//!
//! An [`Effect`] owns emitters, scales every child value through fifteen
//! curves sampled on its own timeline, and decides when the whole tree is
//! finished. Effects nest: an emitter can carry sub-effect prototypes that
//! are instanced onto each particle it spawns.

use bevy::prelude::*;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::attributes::AttributeCurve;
use crate::emitter::{Bypass, Emitter};
use crate::entity::{ALIVE, DEAD, EntityState, ParentTransform};
use crate::library::UpdateConfig;
use crate::manager::{LayerBuckets, ParticlePool, UpdateCtx};

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Spawn geometry of an effect.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, Reflect)]
pub enum EffectClass {
    /// All particles spawn at the effect origin.
    #[default]
    Point,
    /// Particles spawn within (or on a grid across) a rectangle.
    Area,
    /// Particles spawn along a horizontal line.
    Line,
    /// Particles spawn on the rim of an ellipse, or an arc of it.
    Ellipse,
}

/// How the initial travel direction relates to the spawn position.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, Reflect)]
pub enum EmissionType {
    /// Away from the effect handle.
    #[default]
    Inwards,
    /// Towards the effect handle.
    Outwards,
    /// Emission angle only, no positional bearing.
    Specified,
    /// Alternate inwards and outwards per particle.
    InAndOut,
}

/// What happens when a line-traversing particle reaches the end of the line.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, Reflect)]
pub enum EndBehavior {
    /// The particle dies at the edge.
    #[default]
    Kill,
    /// The particle wraps to the other end.
    LoopAround,
    /// The particle keeps going past the end.
    LetFree,
}

bitflags! {
    /// Which current values have been pinned by a setter and are no longer
    /// driven by their curves.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Overrides: u16 {
        const LIFE = 1 << 0;
        const AMOUNT = 1 << 1;
        const VELOCITY = 1 << 2;
        const WEIGHT = 1 << 3;
        const SPIN = 1 << 4;
        const SIZE_X = 1 << 5;
        const SIZE_Y = 1 << 6;
        const ALPHA = 1 << 7;
        const STRETCH = 1 << 8;
        const GLOBAL_Z = 1 << 9;
        const EMISSION_ANGLE = 1 << 10;
        const EMISSION_RANGE = 1 << 11;
        const ANGLE = 1 << 12;
        const SIZE = 1 << 13;
    }
}

// ---------------------------------------------------------------------------
// Current values and curve set
// ---------------------------------------------------------------------------

/// This tick's sampled (and cascaded) effect values. Emitters multiply their
/// own curves by these.
#[derive(Clone, Copy, Debug)]
pub struct EffectValues {
    pub life: f32,
    pub amount: f32,
    pub velocity: f32,
    pub weight: f32,
    pub spin: f32,
    pub alpha: f32,
    pub size_x: f32,
    pub size_y: f32,
    pub width: f32,
    pub height: f32,
    pub emission_angle: f32,
    pub emission_range: f32,
    pub stretch: f32,
    pub global_z: f32,
}

impl Default for EffectValues {
    fn default() -> Self {
        Self {
            life: 1.0,
            amount: 1.0,
            velocity: 1.0,
            weight: 1.0,
            spin: 1.0,
            alpha: 1.0,
            size_x: 1.0,
            size_y: 1.0,
            width: 0.0,
            height: 0.0,
            emission_angle: 0.0,
            emission_range: 0.0,
            stretch: 1.0,
            global_z: 1.0,
        }
    }
}

/// The effect-timeline curves. Shared with instances; copied-on-write when
/// tables are rebuilt.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EffectCurves {
    pub life: AttributeCurve,
    pub amount: AttributeCurve,
    pub velocity: AttributeCurve,
    pub weight: AttributeCurve,
    pub spin: AttributeCurve,
    pub alpha: AttributeCurve,
    pub size_x: AttributeCurve,
    pub size_y: AttributeCurve,
    pub width: AttributeCurve,
    pub height: AttributeCurve,
    pub angle: AttributeCurve,
    pub emission_angle: AttributeCurve,
    pub emission_range: AttributeCurve,
    pub stretch: AttributeCurve,
    pub global_z: AttributeCurve,
}

impl Default for EffectCurves {
    fn default() -> Self {
        use crate::library::*;
        Self {
            life: AttributeCurve::new(GLOBAL_PERCENT_MIN, GLOBAL_PERCENT_MAX),
            amount: AttributeCurve::new(GLOBAL_PERCENT_MIN, GLOBAL_PERCENT_MAX),
            velocity: AttributeCurve::new(GLOBAL_PERCENT_MIN, GLOBAL_PERCENT_MAX),
            weight: AttributeCurve::new(GLOBAL_PERCENT_MIN, GLOBAL_PERCENT_MAX),
            spin: AttributeCurve::new(GLOBAL_PERCENT_MIN, GLOBAL_PERCENT_MAX),
            alpha: AttributeCurve::new(0.0, 1.0),
            size_x: AttributeCurve::new(GLOBAL_PERCENT_MIN, GLOBAL_PERCENT_MAX),
            size_y: AttributeCurve::new(GLOBAL_PERCENT_MIN, GLOBAL_PERCENT_MAX),
            width: AttributeCurve::new(DIMENSIONS_MIN, DIMENSIONS_MAX),
            height: AttributeCurve::new(DIMENSIONS_MIN, DIMENSIONS_MAX),
            angle: AttributeCurve::new(ANGLE_MIN, ANGLE_MAX),
            emission_angle: AttributeCurve::new(ANGLE_MIN, ANGLE_MAX),
            emission_range: AttributeCurve::new(EMISSION_RANGE_MIN, EMISSION_RANGE_MAX),
            stretch: AttributeCurve::new(GLOBAL_PERCENT_MIN, GLOBAL_PERCENT_MAX),
            global_z: AttributeCurve::new(GLOBAL_PERCENT_MIN, GLOBAL_PERCENT_MAX),
        }
    }
}

// ---------------------------------------------------------------------------
// Cross-level plumbing
// ---------------------------------------------------------------------------

/// What a nested effect inherits from the particle carrying it.
pub(crate) struct EffectParent {
    pub transform: ParentTransform,
    pub values: EffectValues,
    pub dying: bool,
}

/// Owned snapshot of an effect's state handed to its emitters for one tick,
/// so effect and emitters can be borrowed independently.
pub(crate) struct EffectCtx {
    pub transform: ParentTransform,
    pub values: EffectValues,
    pub class: EffectClass,
    pub emission_type: EmissionType,
    pub end_behavior: EndBehavior,
    pub dying: bool,
    pub current_effect_frame: f32,
    pub effect_layer: usize,
    pub emit_at_points: bool,
    pub grid_x: i32,
    pub grid_y: i32,
    pub spawn_direction: f32,
    pub traverse_edge: bool,
    pub distance_set_by_life: bool,
    pub ellipse_arc: f32,
    pub ellipse_offset: f32,
    pub handle_x: f32,
    pub handle_y: f32,
    pub handle_center: bool,
    pub angle: f32,
    pub bypass_weight: bool,
    /// Set by emitters when they spawn; flows back to the effect.
    pub particles_created: bool,
}

// ---------------------------------------------------------------------------
// Effect
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Effect {
    pub name: String,
    pub base: EntityState,
    pub class: EffectClass,
    pub curves: Arc<EffectCurves>,
    pub emitters: Vec<Emitter>,

    // authored configuration
    pub emission_type: EmissionType,
    /// Spawn on a grid instead of randomly within the geometry.
    pub emit_at_points: bool,
    /// Grid points across (Area, Line, Ellipse).
    pub grid_x: i32,
    /// Grid points down (Area only).
    pub grid_y: i32,
    /// Timeline length in milliseconds; 0 means endless. The timeline wraps
    /// when it runs out.
    pub effect_length: f32,
    /// Line effects: particles ride along the line instead of emitting
    /// from it.
    pub traverse_edge: bool,
    pub end_behavior: EndBehavior,
    /// Traversal position follows particle age rather than speed.
    pub distance_set_by_life: bool,
    /// Walk grid points in reverse order.
    pub reverse_spawn: bool,
    /// Degrees of an ellipse rim particles spawn on.
    pub ellipse_arc: f32,
    pub handle_center: bool,
    /// Height scaling follows width scaling.
    pub lock_aspect: bool,
    /// Never retire on idle; wait to be killed explicitly.
    pub does_not_timeout: bool,

    // runtime state
    #[serde(skip)]
    pub(crate) effect_layer: usize,
    #[serde(skip)]
    pub(crate) dying: bool,
    #[serde(skip)]
    idle_time: u32,
    #[serde(skip)]
    current_effect_frame: f32,
    #[serde(skip)]
    spawn_age: f32,
    #[serde(skip)]
    particles_created: bool,
    #[serde(skip)]
    current: EffectValues,
    /// Buckets for grouped particles, indexed by sublayer.
    #[serde(skip)]
    pub(crate) in_use: LayerBuckets,
    #[serde(skip)]
    overrides: Overrides,
    #[serde(skip)]
    bypass_weight: bool,
    #[serde(skip)]
    hard_killed: bool,
}

impl Default for Effect {
    fn default() -> Self {
        Self {
            name: String::new(),
            base: EntityState::default(),
            class: EffectClass::Point,
            curves: Arc::new(EffectCurves::default()),
            emitters: Vec::new(),
            emission_type: EmissionType::Inwards,
            emit_at_points: false,
            grid_x: 0,
            grid_y: 0,
            effect_length: 0.0,
            traverse_edge: false,
            end_behavior: EndBehavior::Kill,
            distance_set_by_life: false,
            reverse_spawn: false,
            ellipse_arc: 360.0,
            handle_center: false,
            lock_aspect: false,
            does_not_timeout: false,
            effect_layer: 0,
            dying: false,
            idle_time: 0,
            current_effect_frame: 0.0,
            spawn_age: 0.0,
            particles_created: false,
            current: EffectValues::default(),
            in_use: LayerBuckets::default(),
            overrides: Overrides::empty(),
            bypass_weight: false,
            hard_killed: false,
        }
    }
}

impl Effect {
    /// Fresh, empty effect template.
    pub fn new(name: impl Into<String>) -> Effect {
        Effect {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Clone this template into a live instance born at `time`.
    pub fn instance(&self, time: f32) -> Effect {
        let mut effect = self.clone();
        effect.change_dob(time);
        effect
    }

    /// Re-date the whole tree to a new birth time.
    pub fn change_dob(&mut self, time: f32) {
        self.base.dob = time;
        for emitter in &mut self.emitters {
            emitter.rebase(time);
        }
    }

    /// +1 or -1: the order grid spawn points are walked in.
    pub fn spawn_direction(&self) -> f32 {
        if self.reverse_spawn { -1.0 } else { 1.0 }
    }

    /// Start angle of the ellipse arc, centered on straight up.
    pub fn ellipse_offset(&self) -> f32 {
        90.0 - (self.ellipse_arc / 2.0).trunc()
    }

    pub fn has_particles(&self) -> bool {
        self.emitters.iter().any(|e| e.particle_count() > 0)
    }

    pub fn particle_count(&self) -> usize {
        self.emitters.iter().map(Emitter::particle_count).sum()
    }

    pub fn is_dying(&self) -> bool {
        self.dying
    }

    /// Whether any emitter has spawned since this instance was added.
    pub fn particles_created(&self) -> bool {
        self.particles_created
    }

    /// Furthest point reached on the timeline, unaffected by wrapping.
    pub fn spawn_age(&self) -> f32 {
        self.spawn_age
    }

    pub fn is_dead(&self) -> bool {
        self.base.dead != ALIVE
    }

    /// Stop spawning and let existing particles live out their lifetimes.
    /// The effect retires once the last particle dies.
    pub fn soft_kill(&mut self) {
        self.dying = true;
    }

    /// Retire immediately; the whole particle tree is released on the next
    /// update.
    pub fn hard_kill(&mut self) {
        self.dying = true;
        self.base.dead = DEAD;
        self.hard_killed = true;
    }

    pub fn show_all(&mut self) {
        for emitter in &mut self.emitters {
            emitter.visible = true;
        }
    }

    pub fn hide_all(&mut self) {
        for emitter in &mut self.emitters {
            emitter.visible = false;
        }
    }

    // -- overrides ----------------------------------------------------------
    //
    // Each setter pins a current value; the corresponding curve is ignored
    // from then on for this instance.

    pub fn set_life(&mut self, value: f32) {
        self.current.life = value;
        self.overrides |= Overrides::LIFE;
    }

    pub fn set_amount(&mut self, value: f32) {
        self.current.amount = value;
        self.overrides |= Overrides::AMOUNT;
    }

    pub fn set_velocity(&mut self, value: f32) {
        self.current.velocity = value;
        self.overrides |= Overrides::VELOCITY;
    }

    pub fn set_weight(&mut self, value: f32) {
        self.current.weight = value;
        self.overrides |= Overrides::WEIGHT;
    }

    pub fn set_spin(&mut self, value: f32) {
        self.current.spin = value;
        self.overrides |= Overrides::SPIN;
    }

    pub fn set_alpha(&mut self, value: f32) {
        self.current.alpha = value;
        self.overrides |= Overrides::ALPHA;
    }

    pub fn set_size_x(&mut self, value: f32) {
        self.current.size_x = value;
        self.overrides |= Overrides::SIZE_X;
    }

    pub fn set_size_y(&mut self, value: f32) {
        self.current.size_y = value;
        self.overrides |= Overrides::SIZE_Y;
    }

    pub fn set_stretch(&mut self, value: f32) {
        self.current.stretch = value;
        self.overrides |= Overrides::STRETCH;
    }

    pub fn set_global_z(&mut self, value: f32) {
        self.current.global_z = value;
        self.overrides |= Overrides::GLOBAL_Z;
    }

    pub fn set_emission_angle(&mut self, value: f32) {
        self.current.emission_angle = value;
        self.overrides |= Overrides::EMISSION_ANGLE;
    }

    pub fn set_emission_range(&mut self, value: f32) {
        self.current.emission_range = value;
        self.overrides |= Overrides::EMISSION_RANGE;
    }

    pub fn set_effect_angle(&mut self, value: f32) {
        self.base.angle = value;
        self.overrides |= Overrides::ANGLE;
    }

    /// Pin the spawn geometry dimensions (Area, Ellipse, Line).
    pub fn set_area_size(&mut self, width: f32, height: f32) {
        self.current.width = width;
        self.current.height = height;
        self.overrides |= Overrides::SIZE;
    }

    pub fn set_ellipse_arc(&mut self, degrees: f32) {
        self.ellipse_arc = degrees;
    }

    pub fn position(&self) -> Vec2 {
        Vec2::new(self.base.x, self.base.y)
    }

    pub fn set_position(&mut self, position: Vec2) {
        self.base.set_x(position.x);
        self.base.set_y(position.y);
    }

    // -- per-tick update ----------------------------------------------------

    /// Advance one tick. Returns false when the effect has retired and
    /// should be dropped.
    pub(crate) fn update(&mut self, ctx: &mut UpdateCtx, parent: Option<&EffectParent>) -> bool {
        self.base.capture();
        self.base.age = ctx.current_time - self.base.dob;
        if self.spawn_age < self.base.age {
            self.spawn_age = self.base.age;
        }
        if self.effect_length > 0.0 && self.base.age > self.effect_length {
            self.base.dob = ctx.current_time;
            self.base.age = 0.0;
        }
        self.current_effect_frame = self.base.age / ctx.cfg.lookup_frequency;
        let frame = self.current_effect_frame;

        if !self.overrides.contains(Overrides::SIZE) {
            match self.class {
                EffectClass::Point => {
                    self.current.width = 0.0;
                    self.current.height = 0.0;
                }
                EffectClass::Area | EffectClass::Ellipse => {
                    self.current.width = self.curves.width.get(frame);
                    self.current.height = self.curves.height.get(frame);
                }
                EffectClass::Line => {
                    self.current.width = self.curves.width.get(frame);
                    self.current.height = 0.0;
                }
            }
        }
        if self.handle_center && self.class != EffectClass::Point {
            self.base.handle_x = self.current.width / 2.0;
            self.base.handle_y = self.current.height / 2.0;
        } else {
            self.base.handle_x = 0.0;
            self.base.handle_y = 0.0;
        }

        if self.has_particles() || self.does_not_timeout {
            self.idle_time = 0;
        } else {
            self.idle_time += 1;
        }

        self.sample_currents(frame, parent);
        if self.current.weight == 0.0 {
            self.bypass_weight = true;
        }
        if let Some(parent) = parent {
            self.dying = parent.dying;
        }

        self.base
            .advance(ctx.cfg, parent.map(|p| &p.transform), 0);

        // emitters get an owned snapshot so the effect tree can be borrowed
        // level by level
        let mut ectx = EffectCtx {
            transform: self.base.as_parent(),
            values: self.current,
            class: self.class,
            emission_type: self.emission_type,
            end_behavior: self.end_behavior,
            dying: self.dying,
            current_effect_frame: self.current_effect_frame,
            effect_layer: self.effect_layer,
            emit_at_points: self.emit_at_points,
            grid_x: self.grid_x,
            grid_y: self.grid_y,
            spawn_direction: self.spawn_direction(),
            traverse_edge: self.traverse_edge,
            distance_set_by_life: self.distance_set_by_life,
            ellipse_arc: self.ellipse_arc,
            ellipse_offset: self.ellipse_offset(),
            handle_x: self.base.handle_x,
            handle_y: self.base.handle_y,
            handle_center: self.handle_center,
            angle: self.base.angle,
            bypass_weight: self.bypass_weight,
            particles_created: false,
        };
        {
            let Self {
                emitters, in_use, ..
            } = &mut *self;
            emitters.retain_mut(|emitter| emitter.update(ctx, &mut ectx, in_use));
        }
        self.particles_created |= ectx.particles_created;

        if self.idle_time > ctx.idle_time_limit {
            self.base.dead = DEAD;
        }
        if self.base.dead != ALIVE {
            if self.hard_killed || self.emitters.is_empty() {
                self.destroy(ctx);
                return false;
            }
            self.kill_children(ctx.pool);
        }
        true
    }

    /// Sample the fifteen value curves at `frame`, scaling by the parent's
    /// currents when this effect is nested.
    fn sample_currents(&mut self, frame: f32, parent: Option<&EffectParent>) {
        let c = &self.curves;
        let o = self.overrides;
        if let Some(parent) = parent {
            let pv = &parent.values;
            if !o.contains(Overrides::LIFE) {
                self.current.life = c.life.get(frame) * pv.life;
            }
            if !o.contains(Overrides::AMOUNT) {
                self.current.amount = c.amount.get(frame) * pv.amount;
            }
            if !o.contains(Overrides::VELOCITY) {
                self.current.velocity = c.velocity.get(frame) * pv.velocity;
            }
            if !o.contains(Overrides::WEIGHT) {
                self.current.weight = c.weight.get(frame) * pv.weight;
            }
            if !o.contains(Overrides::SPIN) {
                self.current.spin = c.spin.get(frame) * pv.spin;
            }
            if !o.contains(Overrides::ALPHA) {
                self.current.alpha = c.alpha.get(frame) * pv.alpha;
            }
            if !o.contains(Overrides::STRETCH) {
                self.current.stretch = c.stretch.get(frame) * pv.stretch;
            }
            if !o.contains(Overrides::GLOBAL_Z) {
                self.current.global_z = c.global_z.get(frame) * pv.global_z;
            }
            if !o.contains(Overrides::SIZE_X) {
                self.current.size_x = c.size_x.get(frame) * pv.size_x;
            }
            if !o.contains(Overrides::SIZE_Y) {
                self.current.size_y = if self.lock_aspect {
                    self.current.size_x * pv.size_y
                } else {
                    c.size_y.get(frame) * pv.size_y
                };
            }
        } else {
            if !o.contains(Overrides::LIFE) {
                self.current.life = c.life.get(frame);
            }
            if !o.contains(Overrides::AMOUNT) {
                self.current.amount = c.amount.get(frame);
            }
            if !o.contains(Overrides::VELOCITY) {
                self.current.velocity = c.velocity.get(frame);
            }
            if !o.contains(Overrides::WEIGHT) {
                self.current.weight = c.weight.get(frame);
            }
            if !o.contains(Overrides::SPIN) {
                self.current.spin = c.spin.get(frame);
            }
            if !o.contains(Overrides::ALPHA) {
                self.current.alpha = c.alpha.get(frame);
            }
            if !o.contains(Overrides::STRETCH) {
                self.current.stretch = c.stretch.get(frame);
            }
            if !o.contains(Overrides::GLOBAL_Z) {
                self.current.global_z = c.global_z.get(frame);
            }
            if !o.contains(Overrides::SIZE_X) {
                self.current.size_x = c.size_x.get(frame);
            }
            if !o.contains(Overrides::SIZE_Y) {
                self.current.size_y = if self.lock_aspect {
                    self.current.size_x
                } else {
                    c.size_y.get(frame)
                };
            }
        }
        if !o.contains(Overrides::EMISSION_ANGLE) {
            self.current.emission_angle = c.emission_angle.get(frame);
        }
        if !o.contains(Overrides::EMISSION_RANGE) {
            self.current.emission_range = c.emission_range.get(frame);
        }
        if !o.contains(Overrides::ANGLE) {
            self.base.angle = c.angle.get(frame);
        }
        if !o.contains(Overrides::GLOBAL_Z) {
            self.base.set_z(self.current.global_z);
        }
    }

    /// Mark every emitter (and everything below) dead.
    pub(crate) fn kill_children(&mut self, pool: &mut ParticlePool) {
        for emitter in &mut self.emitters {
            emitter.kill(pool);
        }
    }

    /// Release every particle in the tree back to the pool. The effect is
    /// dropped by the caller afterwards.
    pub(crate) fn destroy(&mut self, ctx: &mut UpdateCtx) {
        for emitter in &mut self.emitters {
            for index in std::mem::take(&mut emitter.child_particles) {
                release_particle_tree(ctx, index);
            }
        }
        for bucket in &mut self.in_use {
            bucket.clear();
        }
    }

    // -- compilation --------------------------------------------------------

    /// Largest value the life curve reaches; emitters size their over-life
    /// tables against it.
    pub fn life_max_value(&self) -> f32 {
        self.curves.life.max_value()
    }

    /// Build lookup tables for this effect and everything below it.
    pub fn compile_all(&mut self, cfg: &UpdateConfig) {
        let freq = cfg.lookup_frequency;
        {
            let c = Arc::make_mut(&mut self.curves);
            c.life.compile(freq);
            c.amount.compile(freq);
            c.velocity.compile(freq);
            c.weight.compile(freq);
            c.spin.compile(freq);
            c.alpha.compile(freq);
            c.size_x.compile(freq);
            c.size_y.compile(freq);
            c.width.compile(freq);
            c.height.compile(freq);
            c.angle.compile(freq);
            c.emission_angle.compile(freq);
            c.emission_range.compile(freq);
            c.stretch.compile(freq);
            // depth is authored as a multiplier but frame zero must be
            // exactly one so unscaled effects stay at their native size
            c.global_z.compile(freq);
            c.global_z.set_compiled(0, 1.0);
        }
        let life_max = self.life_max_value();
        for emitter in &mut self.emitters {
            emitter.compile_all(cfg, life_max);
        }
    }

    /// Cheap recompile for previews: emitters collapse their over-life
    /// tables to frame-zero values and clear their bypass flags.
    pub fn compile_quick(&mut self, cfg: &UpdateConfig) {
        let life_max = self.life_max_value();
        for emitter in &mut self.emitters {
            emitter.compile_quick(cfg, life_max);
            emitter.bypass = Bypass::empty();
        }
    }
}

/// Release a particle and recursively destroy its sub-effects first.
pub(crate) fn release_particle_tree(ctx: &mut UpdateCtx, index: crate::manager::ParticleIndex) {
    let mut subs = std::mem::take(&mut ctx.pool.get_mut(index).sub_effects);
    for sub in &mut subs {
        sub.destroy(ctx);
    }
    ctx.release_particle(index);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emitter::Emitter;
    use crate::manager::{ParticleIndex, ParticleManager};

    fn scaled_effect(life_scale: f32) -> Effect {
        let mut effect = Effect::new("fx");
        let c = Arc::make_mut(&mut effect.curves);
        c.life.add(0.0, life_scale);
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

    fn steady_emitter(amount_per_sec: f32, life_ms: f32) -> Emitter {
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

    fn active_lifetimes(pm: &ParticleManager) -> Vec<f32> {
        (0..pm.pool().capacity())
            .map(ParticleIndex)
            .filter(|&i| pm.pool().get(i).active)
            .map(|i| pm.pool().get(i).base.lifetime)
            .collect()
    }

    #[test]
    fn life_curve_scales_particle_lifetime() {
        let mut effect = scaled_effect(2.0);
        effect.emitters.push(steady_emitter(300.0, 100.0));
        effect.compile_all(&UpdateConfig::default());

        let mut pm = manager();
        pm.add_effect(&effect, 0);
        for _ in 0..5 {
            pm.update();
        }
        let lifetimes = active_lifetimes(&pm);
        assert!(!lifetimes.is_empty());
        for lifetime in lifetimes {
            assert_eq!(lifetime, 200.0);
        }
    }

    #[test]
    fn nested_effect_values_multiply_down_the_tree() {
        // parent scales life by 2, the nested effect by 3: particles of the
        // nested emitter should live base * 2 * 3
        let mut sub = scaled_effect(3.0);
        sub.emitters.push(steady_emitter(30.0, 100.0));

        let mut carrier = steady_emitter(3.0, 100_000.0);
        carrier.effects.push(sub);

        let mut effect = scaled_effect(2.0);
        effect.emitters.push(carrier);
        effect.compile_all(&UpdateConfig::default());

        let mut pm = manager();
        pm.add_effect(&effect, 0);
        for _ in 0..60 {
            pm.update();
        }
        let lifetimes = active_lifetimes(&pm);
        assert!(
            lifetimes.contains(&600.0),
            "no cascaded particle found in {lifetimes:?}"
        );
    }

    #[test]
    fn idle_effect_times_out() {
        // an emitter that never spawns leaves the effect idle until the
        // manager's limit retires it
        let mut effect = scaled_effect(1.0);
        effect.emitters.push(steady_emitter(0.0, 100.0));
        effect.compile_all(&UpdateConfig::default());

        let mut pm = manager();
        pm.add_effect(&effect, 0);
        for _ in 0..=pm.idle_time_limit() {
            pm.update();
            assert_eq!(pm.effects(0).len(), 1);
        }
        for _ in 0..3 {
            pm.update();
        }
        assert!(pm.effects(0).is_empty());
    }

    #[test]
    fn does_not_timeout_keeps_idle_effect_alive() {
        let mut effect = scaled_effect(1.0);
        effect.does_not_timeout = true;
        effect.emitters.push(steady_emitter(0.0, 100.0));
        effect.compile_all(&UpdateConfig::default());

        let mut pm = manager();
        pm.add_effect(&effect, 0);
        for _ in 0..300 {
            pm.update();
        }
        assert_eq!(pm.effects(0).len(), 1);
    }

    #[test]
    fn timeline_wraps_at_effect_length() {
        let mut effect = scaled_effect(1.0);
        effect.effect_length = 100.0;
        effect.does_not_timeout = true;
        effect.emitters.push(steady_emitter(0.0, 100.0));
        effect.compile_all(&UpdateConfig::default());

        let mut pm = manager();
        pm.add_effect(&effect, 0);
        for _ in 0..20 {
            pm.update();
            let fx = &pm.effects(0)[0];
            assert!(fx.base.age <= fx.effect_length + pm.config().update_time);
        }
        assert!(pm.effects(0)[0].spawn_age() > 100.0);
    }

    #[test]
    fn soft_kill_drains_then_retires() {
        let mut effect = scaled_effect(1.0);
        effect.emitters.push(steady_emitter(300.0, 200.0));
        effect.compile_all(&UpdateConfig::default());

        let mut pm = manager();
        pm.add_effect(&effect, 0);
        for _ in 0..30 {
            pm.update();
        }
        assert!(pm.pool().in_use() > 0);

        for fx in pm.effects_mut(0) {
            fx.soft_kill();
        }
        for _ in 0..160 {
            pm.update();
        }
        assert!(pm.effects(0).is_empty());
        assert_eq!(pm.pool().in_use(), 0);
    }

    #[test]
    fn hard_kill_releases_particles_at_once() {
        // particles had most of their 10s lifetime left; a hard kill must not
        // let them live it out
        let mut effect = scaled_effect(1.0);
        effect.emitters.push(steady_emitter(300.0, 10_000.0));
        effect.compile_all(&UpdateConfig::default());

        let mut pm = manager();
        pm.add_effect(&effect, 0);
        for _ in 0..30 {
            pm.update();
        }
        assert!(pm.pool().in_use() > 0);

        for fx in pm.effects_mut(0) {
            fx.hard_kill();
        }
        pm.update();
        assert!(pm.effects(0).is_empty());
        assert_eq!(pm.pool().in_use(), 0);
    }

    #[test]
    fn life_override_pins_the_curve() {
        let mut effect = scaled_effect(2.0);
        effect.emitters.push(steady_emitter(300.0, 100.0));
        effect.compile_all(&UpdateConfig::default());
        effect.set_life(5.0);

        let mut pm = manager();
        pm.add_effect(&effect, 0);
        for _ in 0..5 {
            pm.update();
        }
        let lifetimes = active_lifetimes(&pm);
        assert!(!lifetimes.is_empty());
        for lifetime in lifetimes {
            assert_eq!(lifetime, 500.0);
        }
    }
}
