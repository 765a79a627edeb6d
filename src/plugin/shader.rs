// Built-in shader effect
// Wraps a WGSL fragment snippet into a full effect stage
//
// The snippet must define `fn effect(uv: vec2<f32>, color: vec4<f32>) ->
// vec4<f32>`; it sees the stage time, output resolution and up to eight
// named float parameters. Invalid code fails initialization, which the
// owning chain turns into an eviction, never a crash.

use super::{EffectPlugin, ParamMap, ParamValue, PluginError, PluginInfo};
use crate::render::{RenderContext, COMPOSITE_FORMAT};

/// Maximum number of float parameters a shader effect can declare.
pub const MAX_SHADER_PARAMS: usize = 8;

const SHADER_PRELUDE: &str = r#"
struct EffectUniforms {
    time: f32,
    _pad: f32,
    resolution: vec2<f32>,
    params: array<vec4<f32>, 2>,
}

@group(0) @binding(0) var<uniform> u: EffectUniforms;
@group(0) @binding(1) var input_texture: texture_2d<f32>;
@group(0) @binding(2) var input_sampler: sampler;

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

fn param(index: u32) -> f32 {
    return u.params[index / 4u][index % 4u];
}

@fragment
fn fs_main(input: VertexOutput) -> @location(0) vec4<f32> {
    let color = textureSample(input_texture, input_sampler, input.tex_coord);
    return effect(input.tex_coord, color);
}
"#;

/// Declaration of one shader parameter.
#[derive(Debug, Clone)]
pub struct ParamSpec {
    pub name: String,
    pub default: f32,
}

impl ParamSpec {
    pub fn new(name: &str, default: f32) -> Self {
        Self {
            name: name.to_string(),
            default,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct EffectUniforms {
    time: f32,
    _pad: f32,
    resolution: [f32; 2],
    params: [[f32; 4]; 2],
}

struct ShaderGpu {
    pipeline: wgpu::RenderPipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    uniform_buffer: wgpu::Buffer,
}

/// In-process effect stage driven by a user-supplied WGSL snippet.
pub struct ShaderEffect {
    name: String,
    code: String,
    specs: Vec<ParamSpec>,
    values: Vec<f32>,
    time: f64,
    width: u32,
    height: u32,
    gpu: Option<ShaderGpu>,
}

impl ShaderEffect {
    pub fn new(name: &str, code: &str, specs: Vec<ParamSpec>) -> Self {
        let specs: Vec<ParamSpec> = specs.into_iter().take(MAX_SHADER_PARAMS).collect();
        let values = specs.iter().map(|s| s.default).collect();
        Self {
            name: name.to_string(),
            code: code.to_string(),
            specs,
            values,
            time: 0.0,
            width: 0,
            height: 0,
            gpu: None,
        }
    }

    /// A no-parameter identity effect, mostly useful in tests and as a
    /// template for session files.
    pub fn passthrough() -> Self {
        Self::new(
            "passthrough",
            "fn effect(uv: vec2<f32>, color: vec4<f32>) -> vec4<f32> { return color; }",
            Vec::new(),
        )
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn param_specs(&self) -> &[ParamSpec] {
        &self.specs
    }

    fn uniforms(&self) -> EffectUniforms {
        let mut params = [[0.0f32; 4]; 2];
        for (i, v) in self.values.iter().enumerate() {
            params[i / 4][i % 4] = *v;
        }
        EffectUniforms {
            time: self.time as f32,
            _pad: 0.0,
            resolution: [self.width as f32, self.height as f32],
            params,
        }
    }
}

impl EffectPlugin for ShaderEffect {
    fn info(&self) -> PluginInfo {
        PluginInfo {
            name: self.name.clone(),
            description: "Built-in WGSL fragment effect".to_string(),
            generator: false,
        }
    }

    fn init(
        &mut self,
        ctx: &RenderContext,
        width: u32,
        height: u32,
    ) -> Result<(), PluginError> {
        if self.gpu.is_some() {
            return Ok(());
        }
        self.width = width;
        self.height = height;

        let source = format!("{}\n{}", self.code, SHADER_PRELUDE);

        // The snippet is user code; catch validation errors instead of
        // letting them take down the device
        let error_scope = ctx.device().push_error_scope(wgpu::ErrorFilter::Validation);

        let module = ctx
            .device()
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("Shader Effect"),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            });

        let bind_group_layout =
            ctx.device()
                .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                    label: Some("Shader Effect Bind Group Layout"),
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
                    ],
                });

        let pipeline_layout =
            ctx.device()
                .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                    label: Some("Shader Effect Pipeline Layout"),
                    bind_group_layouts: &[&bind_group_layout],
                    immediate_size: 0,
                });

        let pipeline = ctx
            .device()
            .create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some("Shader Effect Pipeline"),
                layout: Some(&pipeline_layout),
                vertex: wgpu::VertexState {
                    module: &module,
                    entry_point: Some("vs_main"),
                    buffers: &[],
                    compilation_options: Default::default(),
                },
                fragment: Some(wgpu::FragmentState {
                    module: &module,
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

        if let Some(error) = pollster::block_on(error_scope.pop()) {
            return Err(PluginError::InitFailed(error.to_string()));
        }

        let uniform_buffer = ctx.device().create_buffer(&wgpu::BufferDescriptor {
            label: Some("Shader Effect Uniforms"),
            size: std::mem::size_of::<EffectUniforms>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        self.gpu = Some(ShaderGpu {
            pipeline,
            bind_group_layout,
            uniform_buffer,
        });
        Ok(())
    }

    fn set_time(&mut self, seconds: f64) {
        self.time = seconds;
    }

    fn process(
        &mut self,
        ctx: &RenderContext,
        encoder: &mut wgpu::CommandEncoder,
        input: &wgpu::TextureView,
        output: &wgpu::TextureView,
    ) -> Result<(), PluginError> {
        let gpu = self
            .gpu
            .as_ref()
            .ok_or_else(|| PluginError::ProcessFailed("not initialized".to_string()))?;

        ctx.queue().write_buffer(
            &gpu.uniform_buffer,
            0,
            bytemuck::cast_slice(&[self.uniforms()]),
        );

        let bind_group = ctx.device().create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Shader Effect Bind Group"),
            layout: &gpu.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: gpu.uniform_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(input),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::Sampler(ctx.linear_sampler()),
                },
            ],
        });

        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("Shader Effect Pass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: output,
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
        pass.set_pipeline(&gpu.pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.draw(0..6, 0..1);

        Ok(())
    }

    fn deinit(&mut self) {
        self.gpu = None;
    }

    fn set_parameter(&mut self, name: &str, value: ParamValue) {
        match self.specs.iter().position(|s| s.name == name) {
            Some(index) => self.values[index] = value.as_f32(),
            None => log::warn!(
                "shader effect '{}': unknown parameter '{}' ignored",
                self.name,
                name
            ),
        }
    }

    fn parameters(&self) -> ParamMap {
        self.specs
            .iter()
            .zip(&self.values)
            .map(|(s, v)| (s.name.clone(), ParamValue::Float(*v)))
            .collect()
    }

    fn parameter_defaults(&self) -> ParamMap {
        self.specs
            .iter()
            .map(|s| (s.name.clone(), ParamValue::Float(s.default)))
            .collect()
    }

    fn reference(&self) -> crate::config::PluginReference {
        crate::config::PluginReference::Inline {
            name: self.name.clone(),
            code: self.code.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parameter_set_get() {
        let mut fx = ShaderEffect::new(
            "wobble",
            "fn effect(uv: vec2<f32>, color: vec4<f32>) -> vec4<f32> { return color; }",
            vec![ParamSpec::new("amplitude", 0.1), ParamSpec::new("speed", 1.0)],
        );
        fx.set_parameter("amplitude", ParamValue::Float(0.5));
        assert_eq!(
            fx.parameters().get("amplitude"),
            Some(&ParamValue::Float(0.5))
        );
        // Unknown parameter: logged no-op
        fx.set_parameter("frequency", ParamValue::Float(3.0));
        assert_eq!(fx.parameters().len(), 2);
    }

    #[test]
    fn test_defaults_survive_changes() {
        let mut fx = ShaderEffect::new(
            "fade",
            "fn effect(uv: vec2<f32>, color: vec4<f32>) -> vec4<f32> { return color * param(0u); }",
            vec![ParamSpec::new("level", 1.0)],
        );
        fx.set_parameter("level", ParamValue::Float(0.2));
        assert_eq!(
            fx.parameter_defaults().get("level"),
            Some(&ParamValue::Float(1.0))
        );
    }

    #[test]
    fn test_uniform_packing() {
        let mut fx = ShaderEffect::new(
            "p",
            "fn effect(uv: vec2<f32>, color: vec4<f32>) -> vec4<f32> { return color; }",
            (0..8).map(|i| ParamSpec::new(&format!("p{}", i), i as f32)).collect(),
        );
        fx.set_time(2.5);
        let u = fx.uniforms();
        assert_eq!(u.time, 2.5);
        assert_eq!(u.params[0], [0.0, 1.0, 2.0, 3.0]);
        assert_eq!(u.params[1], [4.0, 5.0, 6.0, 7.0]);
    }

    #[test]
    fn test_param_count_is_capped() {
        let fx = ShaderEffect::new(
            "big",
            "fn effect(uv: vec2<f32>, color: vec4<f32>) -> vec4<f32> { return color; }",
            (0..20).map(|i| ParamSpec::new(&format!("p{}", i), 0.0)).collect(),
        );
        assert_eq!(fx.param_specs().len(), MAX_SHADER_PARAMS);
    }
}
