//! Particle manager: the fixed pool, effect layers, and the draw pass.
//!
//! A [`ParticleManager`] owns every live effect and a fixed-size
//! [`ParticlePool`]. [`update`](ParticleManager::update) advances the whole
//! tree by one fixed step; [`draw`](ParticleManager::draw) hands every
//! visible particle to a [`ParticleRenderer`], tweened between the last two
//! ticks so rendering can run faster than the simulation.

use bevy::prelude::*;

use crate::effect::Effect;
use crate::entity::{BlendMode, tween};
use crate::library::{AnimImage, PARTICLE_LIMIT, UpdateConfig};
use crate::particle::Particle;

/// Draw sublayers per effect layer.
pub const SUBLAYERS: usize = 10;

/// Handle to a slot in the [`ParticlePool`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ParticleIndex(pub(crate) usize);

/// Per-layer particle buckets: one list per draw sublayer.
pub type LayerBuckets = [Vec<ParticleIndex>; SUBLAYERS];

// ---------------------------------------------------------------------------
// ParticlePool — fixed arena with a LIFO free list
// ---------------------------------------------------------------------------

/// Fixed-capacity particle arena. Slots are recycled through a LIFO free
/// list; when the pool runs dry, spawns are silently skipped until slots
/// return.
pub struct ParticlePool {
    particles: Vec<Particle>,
    free: Vec<ParticleIndex>,
}

impl ParticlePool {
    pub fn new(capacity: usize) -> Self {
        Self {
            particles: vec![Particle::default(); capacity],
            free: (0..capacity).map(ParticleIndex).collect(),
        }
    }

    /// Take a slot from the free list, or `None` if the pool is exhausted.
    pub fn grab(&mut self) -> Option<ParticleIndex> {
        let index = self.free.pop()?;
        self.particles[index.0].active = true;
        Some(index)
    }

    /// Reset a slot and return it to the free list. Releasing an inactive
    /// slot is a bookkeeping bug; it is logged and ignored so the free list
    /// can never hold duplicates.
    pub fn release(&mut self, index: ParticleIndex) {
        let particle = &mut self.particles[index.0];
        if !particle.active {
            warn!("released particle {} twice", index.0);
            return;
        }
        particle.reset();
        self.free.push(index);
    }

    pub fn get(&self, index: ParticleIndex) -> &Particle {
        &self.particles[index.0]
    }

    pub fn get_mut(&mut self, index: ParticleIndex) -> &mut Particle {
        &mut self.particles[index.0]
    }

    pub fn capacity(&self) -> usize {
        self.particles.len()
    }

    pub fn in_use(&self) -> usize {
        self.particles.len() - self.free.len()
    }

    pub fn unused(&self) -> usize {
        self.free.len()
    }

    /// Flag every active particle so single-particle loops wind down.
    pub fn release_single_particles(&mut self) {
        for particle in &mut self.particles {
            if particle.active {
                particle.release_single = true;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// UpdateCtx — split-borrowed manager state passed down the update tree
// ---------------------------------------------------------------------------

/// Everything an effect or emitter needs from the manager during one tick.
pub struct UpdateCtx<'a> {
    pub pool: &'a mut ParticlePool,
    /// Non-grouped particle buckets, indexed `[effect_layer][sublayer]`.
    pub buckets: &'a mut Vec<LayerBuckets>,
    pub cfg: &'a UpdateConfig,
    pub current_time: f32,
    pub idle_time_limit: u32,
    pub global_amount_scale: f32,
    pub local_amount_scale: f32,
    pub spawning_allowed: bool,
}

impl UpdateCtx<'_> {
    /// Register a freshly grabbed non-grouped particle with the manager.
    pub(crate) fn insert_bucket(
        &mut self,
        effect_layer: usize,
        sublayer: usize,
        index: ParticleIndex,
    ) {
        if let Some(layer) = self.buckets.get_mut(effect_layer) {
            layer[sublayer].push(index);
        }
    }

    /// Release a particle back to the pool, removing it from the manager
    /// buckets if it is not effect-grouped. Grouped particles are removed
    /// from their effect's buckets by the caller.
    pub(crate) fn release_particle(&mut self, index: ParticleIndex) {
        let particle = self.pool.get(index);
        let (grouped, effect_layer, sublayer) = (
            particle.grouped,
            particle.effect_layer,
            particle.layer,
        );
        if !grouped
            && let Some(layer) = self.buckets.get_mut(effect_layer)
        {
            let bucket = &mut layer[sublayer];
            if let Some(pos) = bucket.iter().position(|&i| i == index) {
                bucket.remove(pos);
            }
        }
        self.pool.release(index);
    }
}

// ---------------------------------------------------------------------------
// ParticleRenderer — the seam to whatever actually draws sprites
// ---------------------------------------------------------------------------

/// Receives one call per visible particle per frame. Implementations resolve
/// [`AnimImage::filename`] to a texture and draw however they like; the
/// simulation never touches the GPU.
pub trait ParticleRenderer {
    fn draw_sprite(
        &mut self,
        image: &AnimImage,
        x: f32,
        y: f32,
        frame: f32,
        handle: Vec2,
        rotation: f32,
        scale: Vec2,
        color: LinearRgba,
        additive: bool,
    );
}

struct DrawCtx {
    tween: f32,
    camt: Vec2,
    camtz: f32,
    angle_tweened: f32,
    matrix: Mat2,
    rotated: bool,
}

// ---------------------------------------------------------------------------
// ParticleManager
// ---------------------------------------------------------------------------

/// Owns effect layers, the particle pool, and the camera used by the draw
/// pass. One manager is one independent simulation.
pub struct ParticleManager {
    pool: ParticlePool,
    effects: Vec<Vec<Effect>>,
    buckets: Vec<LayerBuckets>,
    cfg: UpdateConfig,

    // camera
    origin: Vec2,
    origin_z: f32,
    old_origin: Vec2,
    old_origin_z: f32,
    angle: f32,
    old_angle: f32,
    vp_pos: Vec2,
    vp_size: Vec2,
    center: Vec2,

    global_amount_scale: f32,
    local_amount_scale: f32,
    spawning_allowed: bool,
    paused: bool,
    current_tick: u64,
    current_time: f32,
    /// Ticks an effect may sit idle (no live particles) before it dies.
    idle_time_limit: u32,
}

impl Default for ParticleManager {
    fn default() -> Self {
        Self::new(PARTICLE_LIMIT, 1, UpdateConfig::default())
    }
}

impl ParticleManager {
    pub fn new(particles: usize, layers: usize, cfg: UpdateConfig) -> Self {
        let layers = layers.max(1);
        Self {
            pool: ParticlePool::new(particles),
            effects: (0..layers).map(|_| Vec::new()).collect(),
            buckets: (0..layers).map(|_| LayerBuckets::default()).collect(),
            cfg,
            origin: Vec2::ZERO,
            origin_z: 1.0,
            old_origin: Vec2::ZERO,
            old_origin_z: 1.0,
            angle: 0.0,
            old_angle: 0.0,
            vp_pos: Vec2::ZERO,
            vp_size: Vec2::ZERO,
            center: Vec2::ZERO,
            global_amount_scale: 1.0,
            local_amount_scale: 1.0,
            spawning_allowed: true,
            paused: false,
            current_tick: 0,
            current_time: 0.0,
            idle_time_limit: 100,
        }
    }

    // -- time ---------------------------------------------------------------

    /// Advance the whole simulation by one fixed step.
    pub fn update(&mut self) {
        if self.paused {
            return;
        }
        self.current_tick += 1;
        self.current_time = self.current_tick as f32 * self.cfg.update_time;
        let current_time = self.current_time;
        let ParticleManager {
            pool,
            effects,
            buckets,
            cfg,
            idle_time_limit,
            global_amount_scale,
            local_amount_scale,
            spawning_allowed,
            ..
        } = self;
        let mut ctx = UpdateCtx {
            pool,
            buckets,
            cfg,
            current_time,
            idle_time_limit: *idle_time_limit,
            global_amount_scale: *global_amount_scale,
            local_amount_scale: *local_amount_scale,
            spawning_allowed: *spawning_allowed,
        };
        for layer in effects.iter_mut() {
            layer.retain_mut(|effect| effect.update(&mut ctx, None));
        }
        self.old_origin = self.origin;
        self.old_origin_z = self.origin_z;
        self.old_angle = self.angle;
    }

    /// Simulation time in milliseconds, always a whole number of ticks.
    pub fn current_time(&self) -> f32 {
        self.current_time
    }

    pub fn current_tick(&self) -> u64 {
        self.current_tick
    }

    pub fn toggle_pause(&mut self) {
        self.paused = !self.paused;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    // -- effects ------------------------------------------------------------

    /// Instance a template onto a layer. Out-of-range layers fall back to
    /// layer zero.
    pub fn add_effect(&mut self, template: &Effect, layer: usize) {
        let layer = if layer >= self.effects.len() {
            warn!("effect layer {layer} out of range, using 0");
            0
        } else {
            layer
        };
        let mut effect = template.instance(self.current_time);
        effect.effect_layer = layer;
        self.effects[layer].push(effect);
    }

    /// Instance a template as if it had already been running for `frames`
    /// ticks: the instance is back-dated and stepped forward to now, so it
    /// appears mid-flow on its first drawn frame.
    pub fn add_pre_loaded_effect(&mut self, template: &Effect, frames: u32, layer: usize) {
        let layer = if layer >= self.effects.len() { 0 } else { layer };
        let start = self.current_time - frames as f32 * self.cfg.update_time;
        let mut effect = template.instance(start);
        effect.effect_layer = layer;

        let ParticleManager {
            pool,
            buckets,
            cfg,
            idle_time_limit,
            global_amount_scale,
            local_amount_scale,
            spawning_allowed,
            ..
        } = self;
        let mut ctx = UpdateCtx {
            pool,
            buckets,
            cfg,
            current_time: start,
            idle_time_limit: *idle_time_limit,
            global_amount_scale: *global_amount_scale,
            local_amount_scale: *local_amount_scale,
            spawning_allowed: *spawning_allowed,
        };
        for frame in 1..=frames {
            ctx.current_time = start + frame as f32 * ctx.cfg.update_time;
            if !effect.update(&mut ctx, None) {
                return;
            }
        }
        self.effects[layer].push(effect);
    }

    pub fn effects(&self, layer: usize) -> &[Effect] {
        self.effects.get(layer).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn effects_mut(&mut self, layer: usize) -> impl Iterator<Item = &mut Effect> {
        self.effects.get_mut(layer).into_iter().flatten()
    }

    /// Destroy one effect on a layer, releasing its particles. Prefer
    /// [`Effect::soft_kill`] via [`effects_mut`](Self::effects_mut) when the
    /// effect should fade out instead of vanishing.
    pub fn remove_effect(&mut self, layer: usize, index: usize) {
        if self
            .effects
            .get(layer)
            .is_none_or(|effects| index >= effects.len())
        {
            return;
        }
        let ParticleManager {
            pool,
            effects,
            buckets,
            cfg,
            ..
        } = self;
        let mut ctx = UpdateCtx {
            pool,
            buckets,
            cfg,
            current_time: 0.0,
            idle_time_limit: 0,
            global_amount_scale: 1.0,
            local_amount_scale: 1.0,
            spawning_allowed: false,
        };
        effects[layer].remove(index).destroy(&mut ctx);
    }

    /// Destroy every effect on one layer, releasing their particles.
    pub fn clear_layer(&mut self, layer: usize) {
        if self.effects.get(layer).is_none_or(Vec::is_empty) {
            return;
        }
        let ParticleManager {
            pool,
            effects,
            buckets,
            cfg,
            ..
        } = self;
        let mut ctx = UpdateCtx {
            pool,
            buckets,
            cfg,
            current_time: 0.0,
            idle_time_limit: 0,
            global_amount_scale: 1.0,
            local_amount_scale: 1.0,
            spawning_allowed: false,
        };
        for mut effect in effects[layer].drain(..) {
            effect.destroy(&mut ctx);
        }
    }

    /// Destroy all effects on all layers.
    pub fn clear_all(&mut self) {
        for layer in 0..self.effects.len() {
            self.clear_layer(layer);
        }
    }

    /// Ask every live single particle to die at the end of its current loop.
    pub fn release_single_particles(&mut self) {
        self.pool.release_single_particles();
    }

    // -- pool and scales ----------------------------------------------------

    pub fn pool(&self) -> &ParticlePool {
        &self.pool
    }

    pub fn config(&self) -> &UpdateConfig {
        &self.cfg
    }

    pub fn idle_time_limit(&self) -> u32 {
        self.idle_time_limit
    }

    pub fn set_idle_time_limit(&mut self, ticks: u32) {
        self.idle_time_limit = ticks;
    }

    pub fn set_global_amount_scale(&mut self, scale: f32) {
        self.global_amount_scale = scale;
    }

    pub fn set_local_amount_scale(&mut self, scale: f32) {
        self.local_amount_scale = scale;
    }

    pub fn set_spawning_allowed(&mut self, allowed: bool) {
        self.spawning_allowed = allowed;
    }

    // -- camera -------------------------------------------------------------

    pub fn set_origin(&mut self, origin: Vec2, z: f32) {
        self.origin = origin;
        self.origin_z = z;
    }

    pub fn set_camera_angle(&mut self, angle: f32) {
        self.angle = angle;
    }

    pub fn set_screen_size(&mut self, w: f32, h: f32) {
        self.vp_size = Vec2::new(w, h);
        self.center = self.vp_size / 2.0;
    }

    pub fn set_screen_position(&mut self, x: f32, y: f32) {
        self.vp_pos = Vec2::new(x, y);
    }

    // -- drawing ------------------------------------------------------------

    /// Draw every particle, tweened `t` in 0..1 between the previous and
    /// current tick. Pass a layer to restrict to that effect layer.
    pub fn draw<R: ParticleRenderer>(&self, renderer: &mut R, t: f32, layer: Option<usize>) {
        let rotated = self.angle != 0.0;
        let angle_tweened = if rotated {
            tween(self.old_angle, self.angle, t)
        } else {
            0.0
        };
        let dc = DrawCtx {
            tween: t,
            camt: Vec2::new(
                -tween(self.old_origin.x, self.origin.x, t),
                -tween(self.old_origin.y, self.origin.y, t),
            ),
            camtz: tween(self.old_origin_z, self.origin_z, t),
            angle_tweened,
            matrix: Mat2::from_angle(angle_tweened.to_radians()),
            rotated,
        };
        let layers: Vec<usize> = match layer {
            Some(l) if l < self.effects.len() => vec![l],
            Some(l) => {
                warn!("draw layer {l} out of range, nothing drawn");
                return;
            }
            None => (0..self.effects.len()).collect(),
        };
        for &el in &layers {
            for bucket in &self.buckets[el] {
                for &index in bucket {
                    self.draw_particle(self.pool.get(index), &dc, renderer);
                }
            }
            for effect in &self.effects[el] {
                self.draw_effect(effect, &dc, renderer);
            }
        }
    }

    fn draw_effect<R: ParticleRenderer>(&self, effect: &Effect, dc: &DrawCtx, renderer: &mut R) {
        for bucket in &effect.in_use {
            for &index in bucket {
                let particle = self.pool.get(index);
                self.draw_particle(particle, dc, renderer);
                for sub in &particle.sub_effects {
                    self.draw_effect(sub, dc, renderer);
                }
            }
        }
    }

    fn draw_particle<R: ParticleRenderer>(&self, p: &Particle, dc: &DrawCtx, renderer: &mut R) {
        // a particle that has never updated has no tween span yet
        if p.base.age == 0.0 && !p.single {
            return;
        }
        let Some(image) = &p.avatar else {
            return;
        };
        let mut pos = Vec2::new(
            tween(p.base.old_wx, p.base.wx, dc.tween),
            tween(p.base.old_wy, p.base.wy, dc.tween),
        );
        if dc.rotated {
            pos = dc.matrix * pos;
        }
        pos = pos * dc.camtz + self.center + dc.camt * dc.camtz;

        let diameter = p.image_diameter();
        if pos.x <= self.vp_pos.x - diameter
            || pos.x >= self.vp_pos.x + self.vp_size.x + diameter
            || pos.y <= self.vp_pos.y - diameter
            || pos.y >= self.vp_pos.y + self.vp_size.y + diameter
        {
            return;
        }

        let handle = if p.handle_center {
            Vec2::new(image.width / 2.0, image.height / 2.0)
        } else {
            Vec2::new(p.base.handle_x, p.base.handle_y)
        };

        let mut rotation = tween(p.base.old_angle, p.base.angle, dc.tween) + dc.angle_tweened;
        if p.angle_relative {
            let old = if (p.base.old_relative_angle - p.base.relative_angle).abs() > 180.0 {
                p.base.old_relative_angle - 360.0
            } else {
                p.base.old_relative_angle
            };
            rotation += tween(old, p.base.relative_angle, dc.tween);
        }

        let tz = tween(p.base.old_z, p.base.z, dc.tween);
        let scale = Vec2::new(
            tween(p.base.old_scale_x, p.base.scale_x, dc.tween),
            tween(p.base.old_scale_y, p.base.scale_y, dc.tween),
        ) * tz
            * dc.camtz;

        let frames = image.frame_count() as f32;
        let frame = if p.base.animating {
            let f = tween(p.base.old_current_frame, p.base.current_frame, dc.tween);
            if f < 0.0 {
                let wrapped = frames + f % frames;
                if wrapped == frames { 0.0 } else { wrapped }
            } else {
                f % frames
            }
        } else {
            p.base.current_frame
        };

        let color = LinearRgba::new(
            p.base.red / 255.0,
            p.base.green / 255.0,
            p.base.blue / 255.0,
            p.base.alpha,
        );
        renderer.draw_sprite(
            image,
            pos.x,
            pos.y,
            frame,
            handle,
            rotation,
            scale,
            color,
            p.blend == BlendMode::Additive,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effect::Effect;
    use crate::emitter::Emitter;
    use std::sync::Arc;

    fn fountain(amount_per_sec: f32, life_ms: f32) -> Effect {
        let mut effect = Effect::new("fountain");
        {
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
        }
        let mut emitter = Emitter::new("jet");
        {
            let c = Arc::make_mut(&mut emitter.curves);
            c.amount.add(0.0, amount_per_sec);
            c.life.add(0.0, life_ms);
            c.alpha.add(0.0, 1.0);
        }
        effect.emitters.push(emitter);
        effect.compile_all(&UpdateConfig::default());
        effect
    }

    struct CountingRenderer {
        calls: usize,
    }

    impl ParticleRenderer for CountingRenderer {
        #[allow(clippy::too_many_arguments)]
        fn draw_sprite(
            &mut self,
            _image: &AnimImage,
            _x: f32,
            _y: f32,
            _frame: f32,
            _handle: Vec2,
            _rotation: f32,
            _scale: Vec2,
            _color: LinearRgba,
            _additive: bool,
        ) {
            self.calls += 1;
        }
    }

    #[test]
    fn pool_accounting_stays_balanced() {
        // every live particle sits in exactly one draw bucket, either the
        // manager's or a grouping effect's; the free list holds the rest
        let loose = fountain(600.0, 200.0);
        let mut grouped = fountain(600.0, 200.0);
        grouped.emitters[0].group_particles = true;

        let mut pm = ParticleManager::new(256, 1, UpdateConfig::default());
        pm.add_effect(&loose, 0);
        pm.add_effect(&grouped, 0);
        for _ in 0..200 {
            pm.update();
            let mut bucketed: usize = pm
                .buckets
                .iter()
                .flat_map(|layer| layer.iter())
                .map(|bucket| bucket.len())
                .sum();
            for layer in &pm.effects {
                for fx in layer {
                    bucketed += fx.in_use.iter().map(|bucket| bucket.len()).sum::<usize>();
                }
            }
            assert_eq!(bucketed, pm.pool.in_use());
            assert_eq!(pm.pool.in_use() + pm.pool.unused(), pm.pool.capacity());
        }
        assert!(pm.pool.in_use() > 0);
    }

    #[test]
    fn clear_all_releases_everything() {
        let effect = fountain(600.0, 10_000.0);
        let mut pm = ParticleManager::new(256, 2, UpdateConfig::default());
        pm.add_effect(&effect, 0);
        pm.add_effect(&effect, 1);
        for _ in 0..30 {
            pm.update();
        }
        assert!(pm.pool().in_use() > 0);
        pm.clear_all();
        assert_eq!(pm.pool().in_use(), 0);
        assert!(pm.effects(0).is_empty());
        assert!(pm.effects(1).is_empty());
    }

    #[test]
    fn out_of_range_layer_falls_back_to_zero() {
        let effect = fountain(30.0, 100.0);
        let mut pm = ParticleManager::new(64, 2, UpdateConfig::default());
        pm.add_effect(&effect, 7);
        assert_eq!(pm.effects(0).len(), 1);
        assert!(pm.effects(1).is_empty());
    }

    #[test]
    fn exhausted_pool_spawns_what_it_can() {
        let effect = fountain(6000.0, 10_000.0);
        let mut pm = ParticleManager::new(8, 1, UpdateConfig::default());
        pm.add_effect(&effect, 0);
        for _ in 0..50 {
            pm.update();
            assert!(pm.pool().in_use() <= 8);
        }
        assert_eq!(pm.pool().in_use(), 8);
    }

    #[test]
    fn draw_visits_live_particles() {
        let mut effect = fountain(600.0, 10_000.0);
        let image = Arc::new(AnimImage {
            name: "spark".into(),
            width: 32.0,
            height: 32.0,
            frames: 1,
            ..Default::default()
        });
        effect.emitters[0].image = Some(image);

        let mut pm = ParticleManager::new(256, 1, UpdateConfig::default());
        pm.set_screen_size(800.0, 600.0);
        pm.add_effect(&effect, 0);
        for _ in 0..10 {
            pm.update();
        }
        let mut renderer = CountingRenderer { calls: 0 };
        pm.draw(&mut renderer, 0.5, None);
        assert!(renderer.calls > 0);
        assert!(renderer.calls <= pm.pool().in_use());
    }

    #[test]
    fn draw_ignores_out_of_range_layer() {
        let mut effect = fountain(600.0, 10_000.0);
        let image = Arc::new(AnimImage {
            name: "spark".into(),
            width: 32.0,
            height: 32.0,
            frames: 1,
            ..Default::default()
        });
        effect.emitters[0].image = Some(image);

        let mut pm = ParticleManager::new(256, 1, UpdateConfig::default());
        pm.set_screen_size(800.0, 600.0);
        pm.add_effect(&effect, 0);
        for _ in 0..10 {
            pm.update();
        }
        let mut renderer = CountingRenderer { calls: 0 };
        pm.draw(&mut renderer, 0.5, Some(5));
        assert_eq!(renderer.calls, 0);
    }

    #[test]
    fn pause_stops_time() {
        let effect = fountain(600.0, 10_000.0);
        let mut pm = ParticleManager::new(64, 1, UpdateConfig::default());
        pm.add_effect(&effect, 0);
        for _ in 0..10 {
            pm.update();
        }
        let before = (pm.current_time(), pm.pool().in_use());
        pm.toggle_pause();
        for _ in 0..10 {
            pm.update();
        }
        assert_eq!((pm.current_time(), pm.pool().in_use()), before);
    }
}
