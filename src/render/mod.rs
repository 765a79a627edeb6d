// GPU rendering module
// Explicit render context plus the offscreen compositing machinery
//
// One render thread owns the context and everything created from it;
// producer threads never touch the GPU.

mod blend;
mod compositor;
mod filter;
mod mask;
mod scheduler;
mod target;

pub use blend::{BlendEquation, BlendFactor, Blending};
pub use compositor::{Compositor, LoopbackState, COMPOSITE_FORMAT};
pub use filter::FilterKind;
pub use mask::MaskKind;
pub use scheduler::{CompositeFrame, RenderLoop, RenderLoopHandle};
pub use target::RenderTarget;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("Failed to initialize renderer: {0}")]
    InitError(String),
    #[error("GPU not available: {0}")]
    GpuNotAvailable(String),
    #[error("Render failed: {0}")]
    RenderError(String),
    #[error("Composite readback failed: {0}")]
    ReadbackError(String),
}

/// Half-extent of the mixing area in source units. A source at scale 1
/// covers one unit; the composite frustum spans `[-EXTENT*ar, EXTENT*ar]`
/// by `[-EXTENT, EXTENT]`.
pub const VIEW_EXTENT: f64 = 10.0;

/// Owner of the GPU device and the shared samplers.
///
/// Constructed once, up front, and passed by reference to every component
/// that renders; there is no global instance.
pub struct RenderContext {
    device: wgpu::Device,
    queue: wgpu::Queue,
    linear_sampler: wgpu::Sampler,
    nearest_sampler: wgpu::Sampler,
}

impl RenderContext {
    /// Create a headless context on the best available adapter.
    pub fn new() -> Result<Self, RenderError> {
        pollster::block_on(Self::new_async())
    }

    async fn new_async() -> Result<Self, RenderError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .map_err(|e| RenderError::GpuNotAvailable(format!("Failed to request adapter: {}", e)))?;

        log::info!("Using GPU adapter: {:?}", adapter.get_info().name);

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor::default())
            .await
            .map_err(|e| RenderError::InitError(format!("Failed to create device: {}", e)))?;

        Ok(Self::from_device(device, queue))
    }

    /// Wrap an existing device/queue pair, for hosts that already own a
    /// surface-compatible device.
    pub fn from_device(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        let linear_sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Linear Sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::MipmapFilterMode::Nearest,
            ..Default::default()
        });
        let nearest_sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Nearest Sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Nearest,
            min_filter: wgpu::FilterMode::Nearest,
            mipmap_filter: wgpu::MipmapFilterMode::Nearest,
            ..Default::default()
        });
        Self {
            device,
            queue,
            linear_sampler,
            nearest_sampler,
        }
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    pub fn linear_sampler(&self) -> &wgpu::Sampler {
        &self.linear_sampler
    }

    pub fn nearest_sampler(&self) -> &wgpu::Sampler {
        &self.nearest_sampler
    }

    /// Sampler matching a source's pixelated flag.
    pub fn sampler(&self, pixelated: bool) -> &wgpu::Sampler {
        if pixelated {
            &self.nearest_sampler
        } else {
            &self.linear_sampler
        }
    }
}
