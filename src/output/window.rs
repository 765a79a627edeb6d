// Native output window
// winit window + wgpu surface displaying composite frames pushed from
// the render loop's frame tap

use crate::render::CompositeFrame;
use crossbeam_channel::{Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use winit::{
    application::ApplicationHandler,
    dpi::PhysicalSize,
    event::WindowEvent as WinitWindowEvent,
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    window::{Window, WindowAttributes, WindowId},
};

/// Events surfaced from the output window.
#[derive(Debug, Clone)]
pub enum OutputWindowEvent {
    Resized(u32, u32),
    CloseRequested,
}

enum WindowCommand {
    ShowFrame(CompositeFrame),
    SetTitle(String),
    Close,
}

/// Handle to control the output window from another thread.
#[derive(Clone)]
pub struct OutputWindowHandle {
    command_tx: Sender<WindowCommand>,
    frame_tx: Sender<CompositeFrame>,
    event_rx: Receiver<OutputWindowEvent>,
    is_open: Arc<AtomicBool>,
}

impl OutputWindowHandle {
    /// Sender suitable for `RenderLoop::add_frame_tap`.
    pub fn frame_sink(&self) -> Sender<CompositeFrame> {
        self.frame_tx.clone()
    }

    pub fn set_title(&self, title: &str) {
        let _ = self
            .command_tx
            .send(WindowCommand::SetTitle(title.to_string()));
    }

    pub fn close(&self) {
        let _ = self.command_tx.send(WindowCommand::Close);
    }

    pub fn is_open(&self) -> bool {
        self.is_open.load(Ordering::Relaxed)
    }

    pub fn try_recv_event(&self) -> Option<OutputWindowEvent> {
        self.event_rx.try_recv().ok()
    }
}

struct SurfaceRenderer {
    device: wgpu::Device,
    queue: wgpu::Queue,
    surface: wgpu::Surface<'static>,
    config: wgpu::SurfaceConfiguration,
    pipeline: wgpu::RenderPipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    sampler: wgpu::Sampler,
    texture: Option<wgpu::Texture>,
    bind_group: Option<wgpu::BindGroup>,
    frame_width: u32,
    frame_height: u32,
}

const DISPLAY_SHADER: &str = r#"
struct VertexOutput {
    @builtin(position) position: vec4<f32>,
    @location(0) tex_coord: vec2<f32>,
}

@vertex
fn vs_main(@builtin(vertex_index) vertex_index: u32) -> VertexOutput {
    var positions = array<vec2<f32>, 6>(
        vec2<f32>(-1.0, -1.0),
        vec2<f32>(1.0, -1.0),
        vec2<f32>(1.0, 1.0),
        vec2<f32>(-1.0, -1.0),
        vec2<f32>(1.0, 1.0),
        vec2<f32>(-1.0, 1.0),
    );
    var tex_coords = array<vec2<f32>, 6>(
        vec2<f32>(0.0, 1.0),
        vec2<f32>(1.0, 1.0),
        vec2<f32>(1.0, 0.0),
        vec2<f32>(0.0, 1.0),
        vec2<f32>(1.0, 0.0),
        vec2<f32>(0.0, 0.0),
    );
    var output: VertexOutput;
    output.position = vec4<f32>(positions[vertex_index], 0.0, 1.0);
    output.tex_coord = tex_coords[vertex_index];
    return output;
}

@group(0) @binding(0) var frame_texture: texture_2d<f32>;
@group(0) @binding(1) var frame_sampler: sampler;

@fragment
fn fs_main(input: VertexOutput) -> @location(0) vec4<f32> {
    return textureSample(frame_texture, frame_sampler, input.tex_coord);
}
"#;

impl SurfaceRenderer {
    async fn new(window: Arc<Window>) -> Result<Self, String> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let surface = instance
            .create_surface(window.clone())
            .map_err(|e| format!("Failed to create surface: {}", e))?;

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: Some(&surface),
                force_fallback_adapter: false,
            })
            .await
            .map_err(|e| format!("Failed to request adapter: {}", e))?;

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor::default())
            .await
            .map_err(|e| format!("Failed to create device: {}", e))?;

        let size = window.inner_size();
        let capabilities = surface.get_capabilities(&adapter);
        let format = capabilities
            .formats
            .iter()
            .find(|f| f.is_srgb())
            .copied()
            .unwrap_or(capabilities.formats[0]);

        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format,
            width: size.width.max(1),
            height: size.height.max(1),
            present_mode: wgpu::PresentMode::Fifo,
            alpha_mode: wgpu::CompositeAlphaMode::Auto,
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        surface.configure(&device, &config);

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Display Shader"),
            source: wgpu::ShaderSource::Wgsl(DISPLAY_SHADER.into()),
        });

        let bind_group_layout =
            device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("Display Bind Group Layout"),
                entries: &[
                    wgpu::BindGroupLayoutEntry {
                        binding: 0,
                        visibility: wgpu::ShaderStages::FRAGMENT,
                        ty: wgpu::BindingType::Texture {
                            sample_type: wgpu::TextureSampleType::Float { filterable: true },
                            view_dimension: wgpu::TextureViewDimension::D2,
                            multisampled: false,
                        },
                        count: None,
                    },
                    wgpu::BindGroupLayoutEntry {
                        binding: 1,
                        visibility: wgpu::ShaderStages::FRAGMENT,
                        ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                        count: None,
                    },
                ],
            });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Display Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            immediate_size: 0,
        });

        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("Display Pipeline"),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &shader,
                entry_point: Some("vs_main"),
                buffers: &[],
                compilation_options: Default::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: &shader,
                entry_point: Some("fs_main"),
                targets: &[Some(wgpu::ColorTargetState {
                    format,
                    blend: None,
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: Default::default(),
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                ..Default::default()
            },
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview_mask: None,
            cache: None,
        });

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Display Sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::MipmapFilterMode::Nearest,
            ..Default::default()
        });

        Ok(Self {
            device,
            queue,
            surface,
            config,
            pipeline,
            bind_group_layout,
            sampler,
            texture: None,
            bind_group: None,
            frame_width: 0,
            frame_height: 0,
        })
    }

    fn resize(&mut self, width: u32, height: u32) {
        self.config.width = width.max(1);
        self.config.height = height.max(1);
        self.surface.configure(&self.device, &self.config);
    }

    fn upload(&mut self, frame: &CompositeFrame) {
        if self.frame_width != frame.width || self.frame_height != frame.height {
            let texture = self.device.create_texture(&wgpu::TextureDescriptor {
                label: Some("Display Frame Texture"),
                size: wgpu::Extent3d {
                    width: frame.width,
                    height: frame.height,
                    depth_or_array_layers: 1,
                },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: wgpu::TextureFormat::Rgba8Unorm,
                usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
                view_formats: &[],
            });
            let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
            let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("Display Bind Group"),
                layout: &self.bind_group_layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: wgpu::BindingResource::TextureView(&view),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: wgpu::BindingResource::Sampler(&self.sampler),
                    },
                ],
            });
            self.texture = Some(texture);
            self.bind_group = Some(bind_group);
            self.frame_width = frame.width;
            self.frame_height = frame.height;
        }

        if let Some(ref texture) = self.texture {
            self.queue.write_texture(
                wgpu::TexelCopyTextureInfo {
                    texture,
                    mip_level: 0,
                    origin: wgpu::Origin3d::ZERO,
                    aspect: wgpu::TextureAspect::All,
                },
                &frame.data,
                wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(frame.width * 4),
                    rows_per_image: None,
                },
                wgpu::Extent3d {
                    width: frame.width,
                    height: frame.height,
                    depth_or_array_layers: 1,
                },
            );
        }
    }

    fn render(&mut self) -> Result<(), String> {
        let output = self
            .surface
            .get_current_texture()
            .map_err(|e| format!("Failed to get surface texture: {}", e))?;
        let view = output
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Display Encoder"),
            });

        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Display Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                        store: wgpu::StoreOp::Store,
                    },
                    depth_slice: None,
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
                multiview_mask: None,
            });

            // Letterbox to keep the composite aspect ratio
            if self.frame_width > 0 && self.frame_height > 0 {
                let surface_w = self.config.width as f32;
                let surface_h = self.config.height as f32;
                let frame_aspect = self.frame_width as f32 / self.frame_height as f32;
                let surface_aspect = surface_w / surface_h;
                let (vp_x, vp_y, vp_w, vp_h) = if frame_aspect > surface_aspect {
                    let h = surface_w / frame_aspect;
                    (0.0, (surface_h - h) / 2.0, surface_w, h)
                } else {
                    let w = surface_h * frame_aspect;
                    ((surface_w - w) / 2.0, 0.0, w, surface_h)
                };
                pass.set_viewport(vp_x, vp_y, vp_w, vp_h, 0.0, 1.0);
            }

            if let Some(ref bind_group) = self.bind_group {
                pass.set_pipeline(&self.pipeline);
                pass.set_bind_group(0, bind_group, &[]);
                pass.draw(0..6, 0..1);
            }
        }

        self.queue.submit(std::iter::once(encoder.finish()));
        output.present();
        Ok(())
    }
}

/// Window application state, living on the window thread.
pub struct OutputWindow {
    title: String,
    width: u32,
    height: u32,
    command_rx: Receiver<WindowCommand>,
    frame_rx: Receiver<CompositeFrame>,
    event_tx: Sender<OutputWindowEvent>,
    is_open: Arc<AtomicBool>,
    window: Option<Arc<Window>>,
    renderer: Option<SurfaceRenderer>,
}

impl OutputWindow {
    /// Open the window on its own thread and return the control handle.
    pub fn create(title: &str, width: u32, height: u32) -> OutputWindowHandle {
        let (command_tx, command_rx) = crossbeam_channel::unbounded();
        let (frame_tx, frame_rx) = crossbeam_channel::bounded(2);
        let (event_tx, event_rx) = crossbeam_channel::unbounded();
        let is_open = Arc::new(AtomicBool::new(true));
        let is_open_clone = Arc::clone(&is_open);
        let title = title.to_string();
        let title_clone = title.clone();

        std::thread::Builder::new()
            .name("output-window".to_string())
            .spawn(move || {
                let event_loop = match EventLoop::new() {
                    Ok(l) => l,
                    Err(e) => {
                        log::error!("Failed to create event loop: {}", e);
                        is_open_clone.store(false, Ordering::Relaxed);
                        return;
                    }
                };
                event_loop.set_control_flow(ControlFlow::Poll);

                let mut app = OutputWindow {
                    title: title_clone,
                    width,
                    height,
                    command_rx,
                    frame_rx,
                    event_tx,
                    is_open: is_open_clone,
                    window: None,
                    renderer: None,
                };
                event_loop.run_app(&mut app).ok();
            })
            .expect("spawn output window thread");

        OutputWindowHandle {
            command_tx,
            frame_tx,
            event_rx,
            is_open,
        }
    }

    fn process_pending(&mut self) {
        while let Ok(command) = self.command_rx.try_recv() {
            match command {
                WindowCommand::ShowFrame(frame) => self.show_frame(frame),
                WindowCommand::SetTitle(title) => {
                    if let Some(ref window) = self.window {
                        window.set_title(&title);
                    }
                }
                WindowCommand::Close => {
                    self.is_open.store(false, Ordering::Relaxed);
                }
            }
        }
        // Only the newest tapped frame matters
        let mut latest = None;
        while let Ok(frame) = self.frame_rx.try_recv() {
            latest = Some(frame);
        }
        if let Some(frame) = latest {
            self.show_frame(frame);
        }
    }

    fn show_frame(&mut self, frame: CompositeFrame) {
        if let Some(ref mut renderer) = self.renderer {
            renderer.upload(&frame);
        }
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}

impl ApplicationHandler for OutputWindow {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let attrs = WindowAttributes::default()
            .with_title(&self.title)
            .with_inner_size(PhysicalSize::new(self.width, self.height));

        let window = match event_loop.create_window(attrs) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                log::error!("Failed to create window: {}", e);
                self.is_open.store(false, Ordering::Relaxed);
                event_loop.exit();
                return;
            }
        };

        match pollster::block_on(SurfaceRenderer::new(window.clone())) {
            Ok(renderer) => {
                self.renderer = Some(renderer);
                log::info!("output window created: {}x{}", self.width, self.height);
            }
            Err(e) => {
                log::error!("Failed to create output renderer: {}", e);
            }
        }
        self.window = Some(window);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _window_id: WindowId,
        event: WinitWindowEvent,
    ) {
        match event {
            WinitWindowEvent::CloseRequested => {
                self.is_open.store(false, Ordering::Relaxed);
                let _ = self.event_tx.send(OutputWindowEvent::CloseRequested);
                event_loop.exit();
            }
            WinitWindowEvent::Resized(size) => {
                self.width = size.width;
                self.height = size.height;
                if let Some(ref mut renderer) = self.renderer {
                    renderer.resize(size.width, size.height);
                }
                let _ = self
                    .event_tx
                    .send(OutputWindowEvent::Resized(size.width, size.height));
            }
            WinitWindowEvent::RedrawRequested => {
                self.process_pending();
                if let Some(ref mut renderer) = self.renderer {
                    if let Err(e) = renderer.render() {
                        log::error!("display render failed: {}", e);
                    }
                }
            }
            _ => {}
        }

        if !self.is_open.load(Ordering::Relaxed) {
            event_loop.exit();
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        self.process_pending();
    }
}
