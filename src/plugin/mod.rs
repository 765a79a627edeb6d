// Effect plugins
// GPU processing stages applied to a source's texture before compositing
//
// Plugins are third-party by nature and treated as hostile: every stage
// renders into its own offscreen target inside its own render pass, and a
// failing stage is evicted from its chain without touching its siblings.

mod chain;
mod shader;

pub use chain::EffectChain;
pub use shader::{ShaderEffect, ParamSpec};

use crate::render::RenderContext;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PluginError {
    #[error("Plugin failed to initialize: {0}")]
    InitFailed(String),
    #[error("Plugin failed to process: {0}")]
    ProcessFailed(String),
    #[error("Plugin was given no input texture")]
    MissingInput,
}

/// A parameter value exposed by a plugin.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Float(f32),
    Bool(bool),
    Text(String),
}

impl ParamValue {
    pub fn as_f32(&self) -> f32 {
        match self {
            ParamValue::Float(v) => *v,
            ParamValue::Bool(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            ParamValue::Text(_) => 0.0,
        }
    }
}

/// Name → value parameter map, ordered for stable persistence.
pub type ParamMap = BTreeMap<String, ParamValue>;

/// Static description of a plugin.
#[derive(Debug, Clone)]
pub struct PluginInfo {
    pub name: String,
    pub description: String,
    /// Whether the plugin generates content on its own (no input needed).
    pub generator: bool,
}

/// One GPU processing stage.
///
/// `init` is called lazily by the owning chain, at most once, with the
/// working viewport; `process` renders `input` into `output` inside the
/// encoder it is given. Both report failure through `PluginError` rather
/// than panicking: the chain's eviction logic depends on it.
pub trait EffectPlugin: Send {
    fn info(&self) -> PluginInfo;

    /// One-shot resource setup for the given viewport.
    fn init(&mut self, ctx: &RenderContext, width: u32, height: u32)
        -> Result<(), PluginError>;

    /// Current stream time, seconds since the stage started playing.
    fn set_time(&mut self, seconds: f64);

    /// Run the stage: read `input`, write `output`. The output target is
    /// cleared by the chain before this call.
    fn process(
        &mut self,
        ctx: &RenderContext,
        encoder: &mut wgpu::CommandEncoder,
        input: &wgpu::TextureView,
        output: &wgpu::TextureView,
    ) -> Result<(), PluginError>;

    /// Release GPU resources. Called on eviction and on drop of the chain.
    fn deinit(&mut self);

    /// Set a parameter by name. Unknown names are a logged no-op.
    fn set_parameter(&mut self, name: &str, value: ParamValue);

    fn parameters(&self) -> ParamMap;

    /// Defaults captured at load time, for `restore_defaults`.
    fn parameter_defaults(&self) -> ParamMap {
        self.parameters()
    }

    /// How this plugin is written into a session file. Host-managed
    /// plugins without a stable reference persist as opaque entries.
    fn reference(&self) -> crate::config::PluginReference {
        crate::config::PluginReference::Opaque {
            name: self.info().name,
        }
    }
}
