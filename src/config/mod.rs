// Session configuration
// Serde shape of everything a source carries; `Mixer::get_configuration`
// and `set_configuration` are inverses modulo floating-point rounding

use crate::plugin::ParamMap;
use crate::render::{Blending, FilterKind, MaskKind};
use crate::source::{AlgorithmKind, InvertMode, SourceCore};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read session file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid session file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// How a plugin-chain entry is persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PluginReference {
    /// Native module resolved by the host's loader.
    File { path: PathBuf },
    /// Built-in shader effect carried inline.
    Inline { name: String, code: String },
    /// Host-managed stage that cannot be persisted.
    Opaque { name: String },
}

/// One entry of a source's effect chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginConfig {
    pub reference: PluginReference,
    #[serde(default)]
    pub params: ParamMap,
}

/// Type-specific payload of a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "type")]
pub enum SourceTypeConfig {
    Algorithm {
        kind: AlgorithmKind,
        width: u32,
        height: u32,
        fps: u32,
    },
    Image {
        path: PathBuf,
    },
    Loopback {
        recursive: bool,
    },
    /// External producer (video file, device); re-attached by the host.
    Stream {
        description: String,
    },
}

/// Per-source persisted block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    pub position: (f64, f64),
    pub depth: f64,
    pub scale: (f64, f64),
    pub rotation: f64,
    pub center: (f64, f64),
    pub alpha_coordinates: (f64, f64),
    pub alpha: f64,
    pub color: [f32; 3],
    pub blending: Blending,
    pub mask: MaskKind,
    pub filter: FilterKind,
    pub invert: InvertMode,
    pub brightness: f32,
    pub contrast: f32,
    pub saturation: f32,
    pub hue_shift: f32,
    pub luminance_threshold: u8,
    pub number_of_colors: u16,
    pub chroma_key: bool,
    pub chroma_key_color: [f32; 3],
    pub chroma_key_tolerance: f32,
    pub gamma: f32,
    pub gamma_levels: [f32; 4],
    pub pixelated: bool,
    pub playing: bool,
    pub standby: bool,
    pub kind: SourceTypeConfig,
    #[serde(default)]
    pub plugins: Vec<PluginConfig>,
}

/// Whole-session persisted block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub resolution: (u32, u32),
    pub clear_to_white: bool,
    pub limbo_radius: f64,
    pub loopback_period: u32,
    pub sources: Vec<SourceConfig>,
}

impl SessionConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    pub fn save(&self, path: &std::path::Path) -> Result<(), ConfigError> {
        Ok(std::fs::write(path, self.to_json()?)?)
    }
}

/// Capture a core's state into its persisted block.
pub fn config_from_core(core: &SourceCore, kind: SourceTypeConfig, playing: bool) -> SourceConfig {
    let (ax, ay) = core.alpha_coordinates();
    SourceConfig {
        name: core.name.clone(),
        position: (core.x, core.y),
        depth: core.depth(),
        scale: core.scale(),
        rotation: core.rotation,
        center: (core.center_x, core.center_y),
        alpha_coordinates: (ax, ay),
        alpha: core.alpha(),
        color: core.color,
        blending: core.blending,
        mask: core.mask.clone(),
        filter: core.filter,
        invert: core.invert,
        brightness: core.brightness,
        contrast: core.contrast,
        saturation: core.saturation,
        hue_shift: core.hue_shift,
        luminance_threshold: core.luminance_threshold,
        number_of_colors: core.number_of_colors,
        chroma_key: core.chroma_key,
        chroma_key_color: core.chroma_key_color,
        chroma_key_tolerance: core.chroma_key_tolerance,
        gamma: core.gamma,
        gamma_levels: core.gamma_levels,
        pixelated: core.pixelated,
        playing,
        standby: core.is_standby(),
        kind,
        plugins: Vec::new(),
    }
}

/// Apply a persisted block back onto a core. The type payload and plugin
/// list are the mixer's responsibility.
pub fn apply_config_to_core(config: &SourceConfig, core: &mut SourceCore) {
    core.name = config.name.clone();
    core.x = config.position.0;
    core.y = config.position.1;
    core.set_depth(config.depth);
    core.set_scale(config.scale.0, config.scale.1);
    core.rotation = config.rotation;
    core.center_x = config.center.0;
    core.center_y = config.center.1;
    core.set_alpha_coordinates(config.alpha_coordinates.0, config.alpha_coordinates.1);
    core.color = config.color;
    core.blending = config.blending;
    core.mask = config.mask.clone();
    core.filter = config.filter;
    core.invert = config.invert;
    core.brightness = config.brightness;
    core.contrast = config.contrast;
    core.saturation = config.saturation;
    core.hue_shift = config.hue_shift;
    core.luminance_threshold = config.luminance_threshold;
    core.number_of_colors = config.number_of_colors;
    core.chroma_key = config.chroma_key;
    core.chroma_key_color = config.chroma_key_color;
    core.chroma_key_tolerance = config.chroma_key_tolerance;
    core.gamma = config.gamma;
    core.gamma_levels = config.gamma_levels;
    core.pixelated = config.pixelated;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::{BlendEquation, BlendFactor};
    use crate::source::SourceId;

    fn sample_core() -> SourceCore {
        let mut core = SourceCore::new(SourceId(5), 7.5, 64, 64);
        core.name = "clip".to_string();
        core.x = -3.25;
        core.y = 1.5;
        core.set_scale(2.0, 1.25);
        core.rotation = 42.0;
        core.set_alpha_coordinates(0.5, -0.5);
        core.color = [0.9, 0.8, 0.7];
        core.blending = Blending {
            source: BlendFactor::SrcAlpha,
            destination: BlendFactor::OneMinusSrcAlpha,
            equation: BlendEquation::Add,
        };
        core.mask = MaskKind::GradientCircle;
        core.filter = FilterKind::BlurGaussian;
        core.invert = InvertMode::Color;
        core.brightness = 0.1;
        core.contrast = 1.2;
        core.saturation = 0.8;
        core.gamma = 1.8;
        core.gamma_levels = [0.05, 0.95, 0.1, 0.9];
        core
    }

    fn assert_core_close(a: &SourceCore, b: &SourceCore) {
        const TOLERANCE: f64 = 1e-4;
        assert_eq!(a.name, b.name);
        assert!((a.x - b.x).abs() < TOLERANCE);
        assert!((a.y - b.y).abs() < TOLERANCE);
        assert!((a.depth() - b.depth()).abs() < TOLERANCE);
        assert!((a.scale().0 - b.scale().0).abs() < TOLERANCE);
        assert!((a.scale().1 - b.scale().1).abs() < TOLERANCE);
        assert!((a.rotation - b.rotation).abs() < TOLERANCE);
        assert!((a.alpha() - b.alpha()).abs() < TOLERANCE);
        assert_eq!(a.blending, b.blending);
        assert_eq!(a.mask, b.mask);
        assert_eq!(a.filter, b.filter);
        assert_eq!(a.invert, b.invert);
        assert!((a.gamma - b.gamma).abs() < 1e-4);
    }

    #[test]
    fn test_core_config_roundtrip() {
        let core = sample_core();
        let config = config_from_core(
            &core,
            SourceTypeConfig::Stream {
                description: "test".into(),
            },
            true,
        );
        let mut restored = SourceCore::new(SourceId(9), 0.0, 64, 64);
        apply_config_to_core(&config, &mut restored);
        assert_core_close(&core, &restored);
    }

    #[test]
    fn test_json_roundtrip() {
        let core = sample_core();
        let config = config_from_core(
            &core,
            SourceTypeConfig::Algorithm {
                kind: AlgorithmKind::Noise,
                width: 320,
                height: 240,
                fps: 25,
            },
            false,
        );
        let json = serde_json::to_string(&config).unwrap();
        let back: SourceConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, back);
    }

    #[test]
    fn test_session_file_roundtrip() {
        let session = SessionConfig {
            resolution: (1024, 768),
            clear_to_white: false,
            limbo_radius: 2.5,
            loopback_period: 2,
            sources: vec![config_from_core(
                &sample_core(),
                SourceTypeConfig::Loopback { recursive: true },
                true,
            )],
        };
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        session.save(&path).unwrap();
        let loaded = SessionConfig::load(&path).unwrap();
        assert_eq!(session, loaded);
    }

    #[test]
    fn test_plugin_reference_shapes() {
        let entries = vec![
            PluginConfig {
                reference: PluginReference::File {
                    path: PathBuf::from("/plugins/kaleidoscope.so"),
                },
                params: ParamMap::new(),
            },
            PluginConfig {
                reference: PluginReference::Inline {
                    name: "fade".into(),
                    code: "fn effect(uv: vec2<f32>, color: vec4<f32>) -> vec4<f32> { return color; }"
                        .into(),
                },
                params: [(
                    "level".to_string(),
                    crate::plugin::ParamValue::Float(0.5),
                )]
                .into_iter()
                .collect(),
            },
        ];
        let json = serde_json::to_string(&entries).unwrap();
        let back: Vec<PluginConfig> = serde_json::from_str(&json).unwrap();
        assert_eq!(entries, back);
    }
}
