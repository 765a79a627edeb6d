// Composite accumulator
// Draws every active source into the shared offscreen surface in stack
// order, snapshots it for loopback consumers, and feeds the catalog view
//
// All of this runs on the render thread; the per-tick contract is
// pre_render → render_source* → post_render.

use super::{Blending, MaskKind, RenderContext, RenderError, RenderTarget, VIEW_EXTENT};
use crate::events::{EventHub, MixerEvent};
use crate::source::{Source, SourceId, SourceInput};
use std::collections::HashMap;

/// Format of every offscreen surface in the pipeline.
pub const COMPOSITE_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

/// Catalog thumbnails are this fraction of the composite size.
const CATALOG_DIVISOR: u32 = 4;

/// Whether any source consumes the previous frame's composite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoopbackState {
    /// No loopback consumer registered.
    #[default]
    None,
    /// A consumer registered; the previous-frame surface has not been
    /// filled yet (it reads as cleared black for exactly one tick).
    Init,
    /// The previous-frame surface holds the last completed composite.
    Ready,
}

const COMPOSITE_SHADER: &str = r#"
struct SourceUniforms {
    transform: mat4x4<f32>,
    tint: vec4<f32>,      // rgb tint, a = mixing alpha
    adjust: vec4<f32>,    // brightness, contrast, saturation, hue shift
    gamma: vec4<f32>,     // gamma, level min in, level max in, posterize colors
    levels: vec4<f32>,    // level min out, level max out, luminance threshold, invert mode
    chroma: vec4<f32>,    // key rgb, tolerance (0 disables)
    filter_mode: vec4<u32>,  // mode, radius, 0, 0
    kernel0: vec4<f32>,
    kernel1: vec4<f32>,
    kernel2: vec4<f32>,
    texel: vec4<f32>,     // 1/w, 1/h, 0, 0
}

@group(0) @binding(0) var<uniform> u: SourceUniforms;
@group(0) @binding(1) var source_texture: texture_2d<f32>;
@group(0) @binding(2) var source_sampler: sampler;
@group(0) @binding(3) var mask_texture: texture_2d<f32>;
@group(0) @binding(4) var mask_sampler: sampler;

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
    output.position = u.transform * vec4<f32>(positions[vertex_index], 0.0, 1.0);
    output.tex_coord = tex_coords[vertex_index];
    return output;
}

fn sample_filtered(uv: vec2<f32>) -> vec4<f32> {
    let mode = u.filter_mode.x;
    if (mode == 1u) {
        // 3x3 convolution
        var acc = vec3<f32>(0.0);
        var kernel = array<vec4<f32>, 3>(u.kernel0, u.kernel1, u.kernel2);
        for (var j = 0; j < 3; j++) {
            for (var i = 0; i < 3; i++) {
                let offset = vec2<f32>(f32(i - 1), f32(j - 1)) * u.texel.xy;
                acc += textureSample(source_texture, source_sampler, uv + offset).rgb
                    * kernel[j][i];
            }
        }
        let alpha = textureSample(source_texture, source_sampler, uv).a;
        return vec4<f32>(clamp(acc, vec3<f32>(0.0), vec3<f32>(1.0)), alpha);
    }
    if (mode == 2u || mode == 3u) {
        // Morphology: erosion keeps the minimum, dilation the maximum
        let radius = i32(u.filter_mode.y);
        var acc = textureSample(source_texture, source_sampler, uv).rgb;
        for (var j = -6; j <= 6; j++) {
            for (var i = -6; i <= 6; i++) {
                if (abs(i) > radius || abs(j) > radius) {
                    continue;
                }
                let offset = vec2<f32>(f32(i), f32(j)) * u.texel.xy;
                let c = textureSample(source_texture, source_sampler, uv + offset).rgb;
                if (mode == 2u) {
                    acc = min(acc, c);
                } else {
                    acc = max(acc, c);
                }
            }
        }
        let alpha = textureSample(source_texture, source_sampler, uv).a;
        return vec4<f32>(acc, alpha);
    }
    return textureSample(source_texture, source_sampler, uv);
}

fn hue_rotate(c: vec3<f32>, turns: f32) -> vec3<f32> {
    let angle = turns * 6.2831853;
    let k = vec3<f32>(0.57735027);
    return c * cos(angle) + cross(k, c) * sin(angle)
        + k * dot(k, c) * (1.0 - cos(angle));
}

@fragment
fn fs_main(input: VertexOutput) -> @location(0) vec4<f32> {
    var color = sample_filtered(input.tex_coord);
    var rgb = color.rgb;
    var alpha = color.a;

    // Brightness, contrast, saturation
    rgb = (rgb - vec3<f32>(0.5)) * u.adjust.y + vec3<f32>(0.5) + vec3<f32>(u.adjust.x);
    let luma = dot(rgb, vec3<f32>(0.299, 0.587, 0.114));
    rgb = mix(vec3<f32>(luma), rgb, u.adjust.z);
    if (u.adjust.w != 0.0) {
        rgb = hue_rotate(rgb, u.adjust.w);
    }

    // Luminance threshold and posterization
    if (u.levels.z > 0.0 && luma < u.levels.z) {
        rgb = vec3<f32>(0.0);
    }
    if (u.gamma.w >= 2.0) {
        rgb = floor(rgb * u.gamma.w) / u.gamma.w;
    }

    // Chroma keying
    if (u.chroma.w > 0.0 && distance(rgb, u.chroma.rgb) < u.chroma.w) {
        alpha = 0.0;
    }

    // Inversion
    if (u.levels.w == 1.0) {
        rgb = vec3<f32>(1.0) - rgb;
    } else if (u.levels.w == 2.0) {
        let l = dot(rgb, vec3<f32>(0.299, 0.587, 0.114));
        rgb = clamp(rgb + vec3<f32>(1.0 - 2.0 * l), vec3<f32>(0.0), vec3<f32>(1.0));
    }

    // Gamma and levels
    var leveled = clamp(
        (rgb - vec3<f32>(u.gamma.y)) / max(u.gamma.z - u.gamma.y, 0.0001),
        vec3<f32>(0.0),
        vec3<f32>(1.0),
    );
    leveled = pow(leveled, vec3<f32>(1.0 / max(u.gamma.x, 0.0001)));
    rgb = vec3<f32>(u.levels.x) + leveled * (u.levels.y - u.levels.x);

    let mask_value = textureSample(mask_texture, mask_sampler, input.tex_coord).r;
    return vec4<f32>(rgb * u.tint.rgb, alpha * u.tint.a * mask_value);
}
"#;

const COPY_SHADER: &str = r#"
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

#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct SourceUniforms {
    transform: [[f32; 4]; 4],
    tint: [f32; 4],
    adjust: [f32; 4],
    gamma: [f32; 4],
    levels: [f32; 4],
    chroma: [f32; 4],
    filter_mode: [u32; 4],
    kernel0: [f32; 4],
    kernel1: [f32; 4],
    kernel2: [f32; 4],
    texel: [f32; 4],
}

/// GPU-side state the compositor keeps per source.
struct SourceGpu {
    uniform_buffer: wgpu::Buffer,
    mask_kind: MaskKind,
    mask_view: wgpu::TextureView,
}

/// The render-to-framebuffer accumulator.
pub struct Compositor {
    width: u32,
    height: u32,
    clear_white: bool,

    composite: RenderTarget,
    previous: RenderTarget,
    catalog: RenderTarget,
    catalog_enabled: bool,

    loopback_state: LoopbackState,
    loopback_period: u32,
    loopback_counter: u32,

    shader: wgpu::ShaderModule,
    bind_group_layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    pipelines: HashMap<Blending, wgpu::RenderPipeline>,

    copy_pipeline: wgpu::RenderPipeline,
    copy_bind_group_layout: wgpu::BindGroupLayout,

    per_source: HashMap<SourceId, SourceGpu>,
    frame: Option<wgpu::CommandEncoder>,
    drawn_this_frame: bool,
}

impl Compositor {
    pub fn new(ctx: &RenderContext, width: u32, height: u32) -> Self {
        let shader = ctx
            .device()
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("Composite Shader"),
                source: wgpu::ShaderSource::Wgsl(COMPOSITE_SHADER.into()),
            });

        let bind_group_layout =
            ctx.device()
                .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                    label: Some("Composite Bind Group Layout"),
                    entries: &[
                        wgpu::BindGroupLayoutEntry {
                            binding: 0,
                            visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                            ty: wgpu::BindingType::Buffer {
                                ty: wgpu::BufferBindingType::Uniform,
                                has_dynamic_offset: false,
                                min_binding_size: None,
                            },
                            count: None,
                        },
                        wgpu::BindGroupLayoutEntry {
                            binding: 1,
                            visibility: wgpu::ShaderStages::FRAGMENT,
                            ty: wgpu::BindingType::Texture {
                                sample_type: wgpu::TextureSampleType::Float { filterable: true },
                                view_dimension: wgpu::TextureViewDimension::D2,
                                multisampled: false,
                            },
                            count: None,
                        },
                        wgpu::BindGroupLayoutEntry {
                            binding: 2,
                            visibility: wgpu::ShaderStages::FRAGMENT,
                            ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                            count: None,
                        },
                        wgpu::BindGroupLayoutEntry {
                            binding: 3,
                            visibility: wgpu::ShaderStages::FRAGMENT,
                            ty: wgpu::BindingType::Texture {
                                sample_type: wgpu::TextureSampleType::Float { filterable: true },
                                view_dimension: wgpu::TextureViewDimension::D2,
                                multisampled: false,
                            },
                            count: None,
                        },
                        wgpu::BindGroupLayoutEntry {
                            binding: 4,
                            visibility: wgpu::ShaderStages::FRAGMENT,
                            ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                            count: None,
                        },
                    ],
                });

        let pipeline_layout =
            ctx.device()
                .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                    label: Some("Composite Pipeline Layout"),
                    bind_group_layouts: &[&bind_group_layout],
                    immediate_size: 0,
                });

        let copy_shader = ctx
            .device()
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("Copy Shader"),
                source: wgpu::ShaderSource::Wgsl(COPY_SHADER.into()),
            });

        let copy_bind_group_layout =
            ctx.device()
                .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                    label: Some("Copy Bind Group Layout"),
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

        let copy_pipeline_layout =
            ctx.device()
                .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                    label: Some("Copy Pipeline Layout"),
                    bind_group_layouts: &[&copy_bind_group_layout],
                    immediate_size: 0,
                });

        let copy_pipeline =
            ctx.device()
                .create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                    label: Some("Copy Pipeline"),
                    layout: Some(&copy_pipeline_layout),
                    vertex: wgpu::VertexState {
                        module: &copy_shader,
                        entry_point: Some("vs_main"),
                        buffers: &[],
                        compilation_options: Default::default(),
                    },
                    fragment: Some(wgpu::FragmentState {
                        module: &copy_shader,
                        entry_point: Some("fs_main"),
                        targets: &[Some(wgpu::ColorTargetState {
                            format: COMPOSITE_FORMAT,
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

        log::info!("composite frame buffer set to {}x{}", width, height);

        Self {
            width,
            height,
            clear_white: false,
            composite: RenderTarget::new(ctx, width, height, "Composite Target"),
            previous: RenderTarget::new(ctx, width, height, "Previous Frame Target"),
            catalog: RenderTarget::new(
                ctx,
                (width / CATALOG_DIVISOR).max(1),
                (height / CATALOG_DIVISOR).max(1),
                "Catalog Target",
            ),
            catalog_enabled: true,
            loopback_state: LoopbackState::None,
            loopback_period: 1,
            loopback_counter: 0,
            shader,
            bind_group_layout,
            pipeline_layout,
            pipelines: HashMap::new(),
            copy_pipeline,
            copy_bind_group_layout,
            per_source: HashMap::new(),
            frame: None,
            drawn_this_frame: false,
        }
    }

    /// Change the working resolution; all surfaces are recreated and the
    /// loopback history restarts.
    pub fn resize(&mut self, ctx: &RenderContext, width: u32, height: u32) {
        if self.width == width && self.height == height {
            return;
        }
        self.width = width;
        self.height = height;
        self.composite = RenderTarget::new(ctx, width, height, "Composite Target");
        self.previous = RenderTarget::new(ctx, width, height, "Previous Frame Target");
        self.catalog = RenderTarget::new(
            ctx,
            (width / CATALOG_DIVISOR).max(1),
            (height / CATALOG_DIVISOR).max(1),
            "Catalog Target",
        );
        if self.loopback_state == LoopbackState::Ready {
            self.loopback_state = LoopbackState::Init;
        }
        log::info!("composite frame buffer set to {}x{}", width, height);
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn aspect_ratio(&self) -> f64 {
        self.width as f64 / self.height.max(1) as f64
    }

    pub fn set_clear_white(&mut self, white: bool) {
        self.clear_white = white;
    }

    pub fn set_catalog_enabled(&mut self, enabled: bool) {
        self.catalog_enabled = enabled;
    }

    pub fn loopback_state(&self) -> LoopbackState {
        self.loopback_state
    }

    /// Frames between previous-frame snapshots (1 = every tick).
    pub fn set_loopback_period(&mut self, period: u32) {
        self.loopback_period = period.max(1);
    }

    /// Called by the mixer when recursive loopback consumers appear or
    /// disappear.
    pub fn set_loopback_enabled(&mut self, enabled: bool) {
        self.loopback_state = match (self.loopback_state, enabled) {
            (LoopbackState::None, true) => {
                log::debug!("loopback rendering enabled");
                LoopbackState::Init
            }
            (state, true) => state,
            (_, false) => LoopbackState::None,
        };
    }

    /// The composited output, read-only.
    pub fn composite_view(&self) -> &wgpu::TextureView {
        self.composite.view()
    }

    /// Last snapshot of the composite (what recursive sources see).
    pub fn previous_view(&self) -> &wgpu::TextureView {
        self.previous.view()
    }

    pub fn catalog_view(&self) -> &wgpu::TextureView {
        self.catalog.view()
    }

    /// Split borrow for the scheduler: the frame encoder (to record the
    /// effect chains into) plus the previous-frame view for recursive
    /// inputs. Valid between `pre_render` and `post_render`.
    pub fn effect_pass_parts(
        &mut self,
    ) -> Option<(&mut wgpu::CommandEncoder, &wgpu::TextureView)> {
        let encoder = self.frame.as_mut()?;
        Some((encoder, self.previous.view()))
    }

    /// Begin the frame: open the encoder and clear the composite surface,
    /// so the output is well-defined even if nothing gets drawn.
    pub fn pre_render(&mut self, ctx: &RenderContext) {
        let mut encoder =
            ctx.device()
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("Composite Frame Encoder"),
                });
        let clear = if self.clear_white {
            wgpu::Color::WHITE
        } else {
            wgpu::Color::BLACK
        };
        encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("Composite Clear"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: self.composite.view(),
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Clear(clear),
                    store: wgpu::StoreOp::Store,
                },
                depth_slice: None,
            })],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
            multiview_mask: None,
        });
        self.frame = Some(encoder);
        self.drawn_this_frame = false;
    }

    /// Draw one already-updated, already-effect-processed source into the
    /// composite. Standby, culled, fully transparent and not-yet-ready
    /// sources are the caller's filter; this draws unconditionally.
    pub fn render_source(&mut self, ctx: &RenderContext, source: &dyn Source) {
        let input_view = match source.display_input() {
            SourceInput::Own(view) => view,
            SourceInput::PreviousComposite => self.previous.view(),
            SourceInput::Pending => return,
        };

        let core = source.core();
        let render_aspect = self.width as f64 / self.height.max(1) as f64;

        // Per-source GPU state, created on first draw
        let gpu = self
            .per_source
            .entry(core.id())
            .or_insert_with(|| SourceGpu {
                uniform_buffer: ctx.device().create_buffer(&wgpu::BufferDescriptor {
                    label: Some("Source Uniforms"),
                    size: std::mem::size_of::<SourceUniforms>() as u64,
                    usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                    mapped_at_creation: false,
                }),
                mask_kind: core.mask.clone(),
                mask_view: core.mask.create_texture(ctx),
            });
        if gpu.mask_kind != core.mask {
            gpu.mask_kind = core.mask.clone();
            gpu.mask_view = core.mask.create_texture(ctx);
        }

        let (frame_w, frame_h) = source.frame_size();
        let uniforms = build_uniforms(core, render_aspect, frame_w, frame_h);
        ctx.queue()
            .write_buffer(&gpu.uniform_buffer, 0, bytemuck::cast_slice(&[uniforms]));

        let bind_group = ctx.device().create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Source Bind Group"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: gpu.uniform_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(input_view),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::Sampler(ctx.sampler(core.pixelated)),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: wgpu::BindingResource::TextureView(&gpu.mask_view),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: wgpu::BindingResource::Sampler(ctx.linear_sampler()),
                },
            ],
        });

        // Blend state is set per source, immediately before its draw; it
        // never persists across sources
        let shader = &self.shader;
        let pipeline_layout = &self.pipeline_layout;
        let pipeline = self
            .pipelines
            .entry(core.blending)
            .or_insert_with(|| build_pipeline(ctx, shader, pipeline_layout, core.blending));

        let Some(encoder) = self.frame.as_mut() else {
            log::error!("render_source called outside pre_render/post_render");
            return;
        };

        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("Composite Source Pass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: self.composite.view(),
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Load,
                    store: wgpu::StoreOp::Store,
                },
                depth_slice: None,
            })],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
            multiview_mask: None,
        });
        pass.set_pipeline(pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.draw(0..6, 0..1);
        drop(pass);

        self.drawn_this_frame = true;
    }

    /// End the frame: snapshot the composite for loopback consumers,
    /// refresh the catalog view and submit the command stream.
    pub fn post_render(&mut self, ctx: &RenderContext, events: &EventHub) {
        let Some(mut encoder) = self.frame.take() else {
            log::error!("post_render called without pre_render");
            return;
        };

        if self.loopback_state != LoopbackState::None {
            self.loopback_counter = self.loopback_counter.wrapping_add(1);
            if self.loopback_counter % self.loopback_period == 0 {
                encoder.copy_texture_to_texture(
                    self.composite.texture().as_image_copy(),
                    self.previous.texture().as_image_copy(),
                    wgpu::Extent3d {
                        width: self.width,
                        height: self.height,
                        depth_or_array_layers: 1,
                    },
                );
                if self.loopback_state == LoopbackState::Init {
                    self.loopback_state = LoopbackState::Ready;
                    events.emit(MixerEvent::LoopbackReady);
                }
            }
        }

        if self.catalog_enabled {
            self.draw_copy(ctx, &mut encoder, self.composite.view(), self.catalog.view());
        }

        ctx.queue().submit(std::iter::once(encoder.finish()));
    }

    /// Copy the just-completed composite into a private target (the
    /// non-recursive loopback path). Submits its own encoder; call after
    /// `post_render`.
    pub fn snapshot_composite_into(&self, ctx: &RenderContext, target: &RenderTarget) {
        let mut encoder =
            ctx.device()
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("Composite Snapshot Encoder"),
                });
        if target.size() == (self.width, self.height) {
            encoder.copy_texture_to_texture(
                self.composite.texture().as_image_copy(),
                target.texture().as_image_copy(),
                wgpu::Extent3d {
                    width: self.width,
                    height: self.height,
                    depth_or_array_layers: 1,
                },
            );
        } else {
            self.draw_copy(ctx, &mut encoder, self.composite.view(), target.view());
        }
        ctx.queue().submit(std::iter::once(encoder.finish()));
    }

    /// Drop cached GPU state of a removed source.
    pub fn forget_source(&mut self, id: SourceId) {
        self.per_source.remove(&id);
    }

    /// Whether any source was drawn since the last `pre_render`. When
    /// false the composite is the plain clear color, by construction.
    pub fn drawn_this_frame(&self) -> bool {
        self.drawn_this_frame
    }

    /// Read the composite back to CPU memory as tightly packed RGBA rows.
    pub fn read_composite(&self, ctx: &RenderContext) -> Result<Vec<u8>, RenderError> {
        let bytes_per_row = self.width * 4;
        let padded = bytes_per_row.div_ceil(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT)
            * wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let buffer = ctx.device().create_buffer(&wgpu::BufferDescriptor {
            label: Some("Composite Readback Buffer"),
            size: padded as u64 * self.height as u64,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let mut encoder =
            ctx.device()
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("Composite Readback Encoder"),
                });
        encoder.copy_texture_to_buffer(
            self.composite.texture().as_image_copy(),
            wgpu::TexelCopyBufferInfo {
                buffer: &buffer,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded),
                    rows_per_image: None,
                },
            },
            wgpu::Extent3d {
                width: self.width,
                height: self.height,
                depth_or_array_layers: 1,
            },
        );
        ctx.queue().submit(std::iter::once(encoder.finish()));

        let slice = buffer.slice(..);
        let (tx, rx) = crossbeam_channel::bounded(1);
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        ctx.device()
            .poll(wgpu::PollType::wait_indefinitely())
            .map_err(|e| RenderError::ReadbackError(e.to_string()))?;
        rx.recv()
            .map_err(|e| RenderError::ReadbackError(e.to_string()))?
            .map_err(|e| RenderError::ReadbackError(e.to_string()))?;

        let mapped = slice.get_mapped_range();
        let mut pixels = Vec::with_capacity((bytes_per_row * self.height) as usize);
        for row in 0..self.height {
            let start = (row * padded) as usize;
            pixels.extend_from_slice(&mapped[start..start + bytes_per_row as usize]);
        }
        drop(mapped);
        buffer.unmap();
        Ok(pixels)
    }

    fn draw_copy(
        &self,
        ctx: &RenderContext,
        encoder: &mut wgpu::CommandEncoder,
        from: &wgpu::TextureView,
        to: &wgpu::TextureView,
    ) {
        let bind_group = ctx.device().create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Copy Bind Group"),
            layout: &self.copy_bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(from),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Sampler(ctx.linear_sampler()),
                },
            ],
        });
        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("Copy Pass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: to,
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
        pass.set_pipeline(&self.copy_pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.draw(0..6, 0..1);
    }
}

fn build_pipeline(
    ctx: &RenderContext,
    shader: &wgpu::ShaderModule,
    layout: &wgpu::PipelineLayout,
    blending: Blending,
) -> wgpu::RenderPipeline {
    ctx.device()
        .create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("Composite Pipeline"),
            layout: Some(layout),
            vertex: wgpu::VertexState {
                module: shader,
                entry_point: Some("vs_main"),
                buffers: &[],
                compilation_options: Default::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: shader,
                entry_point: Some("fs_main"),
                targets: &[Some(wgpu::ColorTargetState {
                    format: COMPOSITE_FORMAT,
                    blend: Some(blending.to_wgpu()),
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
        })
}

fn build_uniforms(
    core: &crate::source::SourceCore,
    render_aspect: f64,
    frame_w: u32,
    frame_h: u32,
) -> SourceUniforms {
    let params = core.filter.params();
    let (scale_x, scale_y) = core.scale();
    let transform = mul(
        ortho(
            (VIEW_EXTENT * render_aspect) as f32,
            VIEW_EXTENT as f32,
        ),
        model(
            core.x as f32,
            core.y as f32,
            core.rotation as f32,
            scale_x as f32,
            scale_y as f32,
        ),
    );
    SourceUniforms {
        transform,
        tint: [
            core.color[0],
            core.color[1],
            core.color[2],
            core.alpha() as f32,
        ],
        adjust: [
            core.brightness,
            core.contrast,
            core.saturation,
            core.hue_shift,
        ],
        gamma: [
            core.gamma,
            core.gamma_levels[0],
            core.gamma_levels[1],
            core.number_of_colors as f32,
        ],
        levels: [
            core.gamma_levels[2],
            core.gamma_levels[3],
            core.luminance_threshold as f32 / 100.0,
            match core.invert {
                crate::source::InvertMode::None => 0.0,
                crate::source::InvertMode::Color => 1.0,
                crate::source::InvertMode::Luminance => 2.0,
            },
        ],
        chroma: [
            core.chroma_key_color[0],
            core.chroma_key_color[1],
            core.chroma_key_color[2],
            if core.chroma_key {
                core.chroma_key_tolerance
            } else {
                0.0
            },
        ],
        filter_mode: [params.mode, params.radius, 0, 0],
        kernel0: pad_row(params.kernel[0]),
        kernel1: pad_row(params.kernel[1]),
        kernel2: pad_row(params.kernel[2]),
        texel: [
            1.0 / frame_w.max(1) as f32,
            1.0 / frame_h.max(1) as f32,
            0.0,
            0.0,
        ],
    }
}

fn pad_row(row: [f32; 3]) -> [f32; 4] {
    [row[0], row[1], row[2], 0.0]
}

/// Column-major orthographic projection onto the mixing frustum.
fn ortho(half_w: f32, half_h: f32) -> [[f32; 4]; 4] {
    [
        [1.0 / half_w, 0.0, 0.0, 0.0],
        [0.0, 1.0 / half_h, 0.0, 0.0],
        [0.0, 0.0, 1.0, 0.0],
        [0.0, 0.0, 0.0, 1.0],
    ]
}

/// Column-major translate · rotate · scale model matrix.
fn model(x: f32, y: f32, rotation_deg: f32, sx: f32, sy: f32) -> [[f32; 4]; 4] {
    let (sin, cos) = rotation_deg.to_radians().sin_cos();
    [
        [cos * sx, sin * sx, 0.0, 0.0],
        [-sin * sy, cos * sy, 0.0, 0.0],
        [0.0, 0.0, 1.0, 0.0],
        [x, y, 0.0, 1.0],
    ]
}

/// Column-major matrix product `a · b`.
fn mul(a: [[f32; 4]; 4], b: [[f32; 4]; 4]) -> [[f32; 4]; 4] {
    let mut out = [[0.0f32; 4]; 4];
    for (j, col) in out.iter_mut().enumerate() {
        for (i, cell) in col.iter_mut().enumerate() {
            *cell = (0..4).map(|k| a[k][i] * b[j][k]).sum();
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ortho_maps_frustum_to_clip() {
        let m = ortho(20.0, 10.0);
        // A point on the frustum edge lands on the clip edge
        let p = apply(m, [20.0, -10.0]);
        assert!((p[0] - 1.0).abs() < 1e-6);
        assert!((p[1] + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_model_translates_and_scales() {
        let m = model(3.0, -2.0, 0.0, 2.0, 0.5);
        let p = apply(m, [1.0, 1.0]);
        assert!((p[0] - 5.0).abs() < 1e-6);
        assert!((p[1] + 1.5).abs() < 1e-6);
    }

    #[test]
    fn test_model_rotates() {
        let m = model(0.0, 0.0, 90.0, 1.0, 1.0);
        let p = apply(m, [1.0, 0.0]);
        assert!(p[0].abs() < 1e-6);
        assert!((p[1] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_combined_transform() {
        let full = mul(ortho(10.0, 10.0), model(5.0, 0.0, 0.0, 1.0, 1.0));
        let p = apply(full, [0.0, 0.0]);
        assert!((p[0] - 0.5).abs() < 1e-6);
        assert!(p[1].abs() < 1e-6);
    }

    fn apply(m: [[f32; 4]; 4], p: [f32; 2]) -> [f32; 2] {
        [
            m[0][0] * p[0] + m[1][0] * p[1] + m[3][0],
            m[0][1] * p[0] + m[1][1] * p[1] + m[3][1],
        ]
    }
}
