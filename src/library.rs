//! Effect library: authored ranges, update timing, and preset loading.
//!
//! An [`EffectLibrary`] holds compiled effect templates and the image catalog
//! they draw with. Libraries load from RON (`.fx.ron`) and hand out templates
//! that a [`ParticleManager`](crate::manager::ParticleManager) instances.

use bevy::platform::collections::HashMap;
use bevy::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

use crate::effect::Effect;
use crate::emitter::Emitter;

// ---------------------------------------------------------------------------
// Authored value ranges
// ---------------------------------------------------------------------------
// Each attribute curve clamps Bezier output to the range it was authored in.

pub const GLOBAL_PERCENT_MIN: f32 = 0.0;
pub const GLOBAL_PERCENT_MAX: f32 = 20.0;
pub const ANGLE_MIN: f32 = 0.0;
pub const ANGLE_MAX: f32 = 1080.0;
pub const EMISSION_RANGE_MIN: f32 = 0.0;
pub const EMISSION_RANGE_MAX: f32 = 180.0;
pub const DIMENSIONS_MIN: f32 = 0.0;
pub const DIMENSIONS_MAX: f32 = 200.0;
pub const LIFE_MIN: f32 = 0.0;
pub const LIFE_MAX: f32 = 100_000.0;
pub const AMOUNT_MIN: f32 = 0.0;
pub const AMOUNT_MAX: f32 = 2000.0;
pub const VELOCITY_MIN: f32 = 0.0;
pub const VELOCITY_MAX: f32 = 10_000.0;
pub const VELOCITY_OVER_TIME_MIN: f32 = -20.0;
pub const VELOCITY_OVER_TIME_MAX: f32 = 20.0;
pub const WEIGHT_MIN: f32 = -2500.0;
pub const WEIGHT_MAX: f32 = 2500.0;
pub const WEIGHT_VARIATION_MIN: f32 = 0.0;
pub const WEIGHT_VARIATION_MAX: f32 = 2500.0;
pub const SPIN_MIN: f32 = -2000.0;
pub const SPIN_MAX: f32 = 2000.0;
pub const SPIN_VARIATION_MIN: f32 = 0.0;
pub const SPIN_VARIATION_MAX: f32 = 2000.0;
pub const SPIN_OVER_TIME_MIN: f32 = -20.0;
pub const SPIN_OVER_TIME_MAX: f32 = 20.0;
pub const DIRECTION_OVER_TIME_MIN: f32 = 0.0;
pub const DIRECTION_OVER_TIME_MAX: f32 = 4320.0;
pub const FRAMERATE_MIN: f32 = 0.0;
pub const FRAMERATE_MAX: f32 = 200.0;

/// Degrees of wander a full-strength direction variation adds per interval.
pub const MAX_DIRECTION_VARIATION: f32 = 22.5;
/// Speed wander added per interval at full-strength direction variation.
pub const MAX_VELOCITY_VARIATION: f32 = 30.0;
/// Milliseconds between random-motion re-rolls.
pub const MOTION_VARIATION_INTERVAL: f32 = 30.0;

/// Default pool capacity for [`crate::manager::ParticleManager`].
pub const PARTICLE_LIMIT: usize = 5000;

// ---------------------------------------------------------------------------
// UpdateConfig — simulation and lookup timing
// ---------------------------------------------------------------------------

/// Fixed-step timing shared by every curve and entity update.
///
/// All simulation time is in milliseconds; `update_time` is the length of one
/// tick. Base curves compile at one sample per tick (`lookup_frequency`),
/// over-life curves at one sample per millisecond.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize, Reflect)]
pub struct UpdateConfig {
    /// Simulation ticks per second.
    pub update_frequency: f32,
    /// Milliseconds per tick.
    pub update_time: f32,
    /// Divisor used when integrating speeds and framerates. Holds the tick
    /// frequency, not the tick length; long-standing engine convention that
    /// authored values are calibrated against.
    pub current_update_time: f32,
    /// Milliseconds per compiled-table slot for effect-time curves.
    pub lookup_frequency: f32,
    /// Milliseconds per compiled-table slot for over-life curves.
    pub lookup_frequency_over_time: f32,
}

impl UpdateConfig {
    pub fn new(frequency: f32) -> Self {
        Self {
            update_frequency: frequency,
            update_time: 1000.0 / frequency,
            current_update_time: frequency,
            lookup_frequency: 1000.0 / frequency,
            lookup_frequency_over_time: 1.0,
        }
    }

    pub fn set_update_frequency(&mut self, frequency: f32) {
        *self = Self {
            lookup_frequency_over_time: self.lookup_frequency_over_time,
            ..Self::new(frequency)
        };
    }
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self::new(30.0)
    }
}

// ---------------------------------------------------------------------------
// AnimImage — sprite sheet metadata
// ---------------------------------------------------------------------------

/// Metadata for one sprite sheet an emitter can draw with. Rendering is
/// external; the simulation only needs dimensions and frame count.
#[derive(Clone, Debug, Default, Serialize, Deserialize, Reflect)]
pub struct AnimImage {
    pub name: String,
    /// Asset path the renderer resolves to an actual texture.
    pub filename: String,
    /// Frame width in pixels.
    pub width: f32,
    /// Frame height in pixels.
    pub height: f32,
    /// Radius of the smallest circle covering a frame, for culling.
    pub max_radius: f32,
    pub frames: u32,
}

impl AnimImage {
    pub fn frame_count(&self) -> u32 {
        self.frames.max(1)
    }
}

// ---------------------------------------------------------------------------
// EffectLibrary
// ---------------------------------------------------------------------------

/// On-disk form of a library preset.
#[derive(Serialize, Deserialize)]
struct LibraryFile {
    #[serde(default)]
    name: String,
    images: Vec<AnimImage>,
    effects: Vec<Effect>,
}

/// A catalog of effect templates and the images they reference.
///
/// Emitters store an image by name; [`add_effect`](Self::add_effect) resolves
/// those names against the catalog so every emitter ends up holding a shared
/// [`AnimImage`] handle.
#[derive(Default)]
pub struct EffectLibrary {
    name: String,
    effects: HashMap<String, Effect>,
    images: HashMap<String, Arc<AnimImage>>,
}

impl EffectLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_image(&mut self, image: AnimImage) {
        self.images.insert(image.name.clone(), Arc::new(image));
    }

    pub fn image(&self, name: &str) -> Option<&Arc<AnimImage>> {
        self.images.get(name)
    }

    /// Register a template, resolving every emitter's image name against the
    /// catalog. Unknown image names log a warning and leave the emitter
    /// imageless; such emitters still simulate but draw nothing.
    pub fn add_effect(&mut self, mut effect: Effect) {
        resolve_images(&mut effect, &self.images);
        self.effects.insert(effect.name.clone(), effect);
    }

    /// Look up a template by `/`-separated path, e.g. `"Explosion"` for a
    /// root effect or `"Explosion/Sparks/Flare"` for a sub-effect prototype.
    pub fn effect(&self, path: &str) -> Option<&Effect> {
        let mut segments = path.split('/');
        let mut effect = self.effects.get(segments.next()?)?;
        loop {
            let Some(emitter_name) = segments.next() else {
                return Some(effect);
            };
            let emitter = effect.emitters.iter().find(|e| e.name == emitter_name)?;
            let effect_name = segments.next()?;
            effect = emitter.effects.iter().find(|e| e.name == effect_name)?;
        }
    }

    /// Look up an emitter prototype by path, e.g. `"Explosion/Sparks"`.
    pub fn emitter(&self, path: &str) -> Option<&Emitter> {
        let (effect_path, emitter_name) = path.rsplit_once('/')?;
        self.effect(effect_path)?
            .emitters
            .iter()
            .find(|e| e.name == emitter_name)
    }

    pub fn effects(&self) -> impl Iterator<Item = &Effect> {
        self.effects.values()
    }

    /// Compile every template's lookup tables and recompute bypass flags.
    pub fn compile_all(&mut self, cfg: &UpdateConfig) {
        for effect in self.effects.values_mut() {
            effect.compile_all(cfg);
        }
    }

    /// Parse a library from RON text. Images are registered first so effect
    /// templates resolve against the full catalog.
    pub fn from_ron(text: &str) -> Result<Self, ron::error::SpannedError> {
        let file: LibraryFile = ron::from_str(text)?;
        let mut library = Self {
            name: file.name,
            ..Self::default()
        };
        for image in file.images {
            library.add_image(image);
        }
        for effect in file.effects {
            library.add_effect(effect);
        }
        Ok(library)
    }

    /// Load and compile a library from a `.fx.ron` file on disk.
    pub fn load(path: &Path, cfg: &UpdateConfig) -> Option<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) => {
                warn!("failed to read effect library {}: {err}", path.display());
                return None;
            }
        };
        match Self::from_ron(&text) {
            Ok(mut library) => {
                library.compile_all(cfg);
                info!(
                    "loaded effect library {} ({} effects)",
                    path.display(),
                    library.effects.len()
                );
                Some(library)
            }
            Err(err) => {
                warn!("failed to parse effect library {}: {err}", path.display());
                None
            }
        }
    }
}

fn resolve_images(effect: &mut Effect, images: &HashMap<String, Arc<AnimImage>>) {
    for emitter in &mut effect.emitters {
        if emitter.image_name.is_empty() {
            emitter.image = None;
        } else if let Some(image) = images.get(&emitter.image_name) {
            emitter.image = Some(image.clone());
        } else {
            warn!(
                "emitter {} references unknown image {}",
                emitter.name, emitter.image_name
            );
            emitter.image = None;
        }
        for sub in &mut emitter.effects {
            resolve_images(sub, images);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nested_library() -> EffectLibrary {
        let mut flare = Effect::default();
        flare.name = "Flare".into();

        let mut sparks = Emitter::default();
        sparks.name = "Sparks".into();
        sparks.image_name = "spark".into();
        sparks.effects.push(flare);

        let mut explosion = Effect::default();
        explosion.name = "Explosion".into();
        explosion.emitters.push(sparks);

        let mut library = EffectLibrary::new();
        library.add_image(AnimImage {
            name: "spark".into(),
            filename: "spark.png".into(),
            width: 32.0,
            height: 32.0,
            frames: 4,
            ..Default::default()
        });
        library.add_effect(explosion);
        library
    }

    #[test]
    fn slash_paths_walk_the_tree() {
        let library = nested_library();
        assert!(library.effect("Explosion").is_some());
        assert!(library.emitter("Explosion/Sparks").is_some());
        assert!(library.effect("Explosion/Sparks/Flare").is_some());
        assert!(library.effect("Explosion/Missing").is_none());
        assert!(library.effect("Nothing").is_none());
    }

    #[test]
    fn image_names_resolve_to_shared_handles() {
        let library = nested_library();
        let emitter = library.emitter("Explosion/Sparks").unwrap();
        let image = emitter.image.as_ref().unwrap();
        assert_eq!(image.name, "spark");
        assert_eq!(image.frame_count(), 4);
    }

    #[test]
    fn unknown_images_leave_the_emitter_imageless() {
        let mut effect = Effect::default();
        effect.name = "Smoke".into();
        let mut emitter = Emitter::default();
        emitter.name = "Puff".into();
        emitter.image_name = "missing".into();
        effect.emitters.push(emitter);

        let mut library = EffectLibrary::new();
        library.add_effect(effect);
        assert!(library.emitter("Smoke/Puff").unwrap().image.is_none());
    }

    #[test]
    fn ron_text_round_trips_through_the_catalog() {
        let library = nested_library();
        let file = LibraryFile {
            name: "test pack".into(),
            images: vec![AnimImage {
                name: "spark".into(),
                width: 32.0,
                height: 32.0,
                frames: 4,
                ..Default::default()
            }],
            effects: library.effects().cloned().collect(),
        };
        let text = ron::to_string(&file).unwrap();
        let parsed = EffectLibrary::from_ron(&text).unwrap();
        assert_eq!(parsed.name(), "test pack");
        assert!(parsed.effect("Explosion/Sparks/Flare").is_some());
        assert!(parsed.emitter("Explosion/Sparks").unwrap().image.is_some());
    }
}
