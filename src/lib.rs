// livemix - real-time video mixing and compositing engine
// Main library entry point
//
// The pipeline, producer to screen:
//
//   decode/capture threads -> PicturePool -> FrameMailbox -> TextureUploader
//     -> Source texture -> EffectChain -> Compositor -> composite texture
//     -> output window / loopback sources
//
// One render thread (the RenderLoop) owns all GPU state; producers only
// ever touch pooled CPU memory and their mailbox.

pub mod config;
pub mod events;
pub mod frame;
pub mod memory;
pub mod mixer;
pub mod output;
pub mod plugin;
pub mod render;
pub mod source;
pub mod upload;

pub use config::{SessionConfig, SourceConfig};
pub use events::{EventHub, MixerEvent};
pub use frame::{FrameMailbox, PixelFormat, VideoPicture};
pub use memory::PicturePool;
pub use mixer::Mixer;
pub use plugin::{EffectChain, EffectPlugin, ShaderEffect};
pub use render::{
    Blending, Compositor, RenderContext, RenderLoop, RenderLoopHandle,
};
pub use source::{Source, SourceId};
pub use upload::TextureUploader;
