// Ordered effect chain of one source
// Stage k's output texture feeds stage k+1; the last output feeds the
// compositor. Failing stages are evicted, the rest keep running.

use super::{EffectPlugin, PluginError};
use crate::events::{EventHub, MixerEvent};
use crate::render::{RenderContext, RenderTarget};
use crate::source::SourceId;
use std::time::Instant;

struct Stage {
    plugin: Box<dyn EffectPlugin>,
    /// Allocated on first successful `init`.
    target: Option<RenderTarget>,
    initialized: bool,
    paused: bool,
    started: Instant,
    elapsed: f64,
}

impl Stage {
    fn new(plugin: Box<dyn EffectPlugin>) -> Self {
        Self {
            plugin,
            target: None,
            initialized: false,
            paused: false,
            started: Instant::now(),
            elapsed: 0.0,
        }
    }

    /// Lazy, one-shot initialization.
    fn ensure_initialized(
        &mut self,
        ctx: &RenderContext,
        width: u32,
        height: u32,
    ) -> Result<(), PluginError> {
        if self.initialized {
            return Ok(());
        }
        let target = RenderTarget::new(ctx, width, height, "Effect Stage Target");
        self.plugin.init(ctx, width, height)?;
        self.target = Some(target);
        self.initialized = true;
        self.started = Instant::now();
        log::debug!("effect stage '{}' initialized", self.plugin.info().name);
        Ok(())
    }

    fn advance_clock(&mut self) {
        if !self.paused {
            self.elapsed += self.started.elapsed().as_secs_f64();
        }
        self.started = Instant::now();
        self.plugin.set_time(self.elapsed);
    }
}

/// Ordered stack of effect stages applied to one source's texture.
pub struct EffectChain {
    stages: Vec<Stage>,
    width: u32,
    height: u32,
    /// Identity of the owning source, for failure events.
    owner: SourceId,
}

impl EffectChain {
    /// An empty chain for a source, sized to the working resolution.
    pub fn new(owner: SourceId, width: u32, height: u32) -> Self {
        Self {
            stages: Vec::new(),
            width,
            height,
            owner,
        }
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Append a stage; its input becomes the previous stage's output (or
    /// the source's raw texture if it is first).
    pub fn push(&mut self, plugin: Box<dyn EffectPlugin>) {
        log::debug!("effect '{}' appended to chain", plugin.info().name);
        self.stages.push(Stage::new(plugin));
    }

    /// Insert a stage at `index`, rewiring neighbours implicitly: the new
    /// stage reads what its predecessor produces, and the former occupant
    /// of `index` now reads the new stage's output.
    pub fn insert(&mut self, index: usize, plugin: Box<dyn EffectPlugin>) {
        let index = index.min(self.stages.len());
        self.stages.insert(index, Stage::new(plugin));
    }

    /// Remove the stage at `index`; its successor is rewired to read the
    /// predecessor's output (or the raw input if `index` was first).
    pub fn remove(&mut self, index: usize) -> Option<Box<dyn EffectPlugin>> {
        if index >= self.stages.len() {
            return None;
        }
        let mut stage = self.stages.remove(index);
        stage.plugin.deinit();
        Some(stage.plugin)
    }

    /// Reset a stage's parameters to the values captured at load time.
    pub fn restore_defaults(&mut self, index: usize) {
        if let Some(stage) = self.stages.get_mut(index) {
            for (name, value) in stage.plugin.parameter_defaults() {
                stage.plugin.set_parameter(&name, value);
            }
        }
    }

    pub fn set_paused(&mut self, index: usize, paused: bool) {
        if let Some(stage) = self.stages.get_mut(index) {
            if stage.paused && !paused {
                stage.started = Instant::now();
            }
            stage.paused = paused;
        }
    }

    pub fn plugin(&self, index: usize) -> Option<&dyn EffectPlugin> {
        self.stages.get(index).map(|s| s.plugin.as_ref())
    }

    pub fn plugin_mut(&mut self, index: usize) -> Option<&mut dyn EffectPlugin> {
        match self.stages.get_mut(index) {
            Some(s) => Some(s.plugin.as_mut()),
            None => None,
        }
    }

    /// Names of the stages, in order.
    pub fn names(&self) -> Vec<String> {
        self.stages.iter().map(|s| s.plugin.info().name).collect()
    }

    /// Index of the stage feeding stage `index`, if any. `None` means the
    /// stage reads the source's raw texture.
    pub fn input_of(&self, index: usize) -> Option<usize> {
        index.checked_sub(1)
    }

    /// Run every stage in order, feeding each stage the output of the last
    /// one that succeeded (the first reads `raw_input`). Failing stages
    /// are evicted and reported; the remaining stages keep the chain
    /// alive, and the tick's composite simply omits the failed stage's
    /// contribution.
    pub fn process_all(
        &mut self,
        ctx: &RenderContext,
        encoder: &mut wgpu::CommandEncoder,
        raw_input: &wgpu::TextureView,
        events: &EventHub,
    ) {
        let mut last_ok: Option<usize> = None;
        let mut evict: Vec<usize> = Vec::new();

        for index in 0..self.stages.len() {
            let (before, rest) = self.stages.split_at_mut(index);
            let stage = &mut rest[0];

            if let Err(e) = stage.ensure_initialized(ctx, self.width, self.height) {
                log::warn!(
                    "effect stage '{}' failed to initialize: {}",
                    stage.plugin.info().name,
                    e
                );
                events.emit(MixerEvent::PluginFailed {
                    source: self.owner,
                    stage: index,
                    name: stage.plugin.info().name,
                    reason: e.to_string(),
                });
                evict.push(index);
                continue;
            }

            // Input: output of the last stage that ran, else the raw texture
            let input = match last_ok {
                Some(prev) => before[prev]
                    .target
                    .as_ref()
                    .expect("completed stage has a target")
                    .view(),
                None => raw_input,
            };

            stage.advance_clock();
            let output = stage.target.as_ref().expect("initialized stage has a target");

            // Each stage runs in its own cleared pass; there is no GPU
            // state carried over between stages.
            clear_target(encoder, output.view());

            match stage.plugin.process(ctx, encoder, input, output.view()) {
                Ok(()) => last_ok = Some(index),
                Err(e) => {
                    log::warn!(
                        "effect stage '{}' failed to process: {}",
                        stage.plugin.info().name,
                        e
                    );
                    events.emit(MixerEvent::PluginFailed {
                        source: self.owner,
                        stage: index,
                        name: stage.plugin.info().name,
                        reason: e.to_string(),
                    });
                    evict.push(index);
                }
            }
        }

        // Tear down failed stages after the walk; indices shift as we go
        for (removed, index) in evict.into_iter().enumerate() {
            let mut stage = self.stages.remove(index - removed);
            stage.plugin.deinit();
            log::warn!(
                "effect stage '{}' evicted from chain",
                stage.plugin.info().name
            );
        }
    }

    /// Persisted entries for every stage, in order.
    pub fn configs(&self) -> Vec<crate::config::PluginConfig> {
        self.stages
            .iter()
            .map(|s| crate::config::PluginConfig {
                reference: s.plugin.reference(),
                params: s.plugin.parameters(),
            })
            .collect()
    }

    /// View of the chain's current output: the target of the last
    /// initialized stage. `None` when the chain has nothing to show yet.
    pub fn output_view(&self) -> Option<&wgpu::TextureView> {
        self.stages
            .iter()
            .rev()
            .find_map(|s| s.target.as_ref())
            .map(|t| t.view())
    }
}

impl Drop for EffectChain {
    fn drop(&mut self) {
        for stage in &mut self.stages {
            stage.plugin.deinit();
        }
    }
}

fn clear_target(encoder: &mut wgpu::CommandEncoder, view: &wgpu::TextureView) {
    encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
        label: Some("Effect Stage Clear"),
        color_attachments: &[Some(wgpu::RenderPassColorAttachment {
            view,
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{ParamMap, ParamValue, PluginInfo};

    struct MockPlugin {
        name: String,
        fail_init: bool,
        deinit_count: usize,
    }

    impl MockPlugin {
        fn boxed(name: &str) -> Box<dyn EffectPlugin> {
            Box::new(Self {
                name: name.to_string(),
                fail_init: false,
                deinit_count: 0,
            })
        }
    }

    impl EffectPlugin for MockPlugin {
        fn info(&self) -> PluginInfo {
            PluginInfo {
                name: self.name.clone(),
                description: String::new(),
                generator: false,
            }
        }

        fn init(
            &mut self,
            _ctx: &RenderContext,
            _w: u32,
            _h: u32,
        ) -> Result<(), PluginError> {
            if self.fail_init {
                Err(PluginError::InitFailed("mock".into()))
            } else {
                Ok(())
            }
        }

        fn set_time(&mut self, _seconds: f64) {}

        fn process(
            &mut self,
            _ctx: &RenderContext,
            _encoder: &mut wgpu::CommandEncoder,
            _input: &wgpu::TextureView,
            _output: &wgpu::TextureView,
        ) -> Result<(), PluginError> {
            Ok(())
        }

        fn deinit(&mut self) {
            self.deinit_count += 1;
        }

        fn set_parameter(&mut self, name: &str, _value: ParamValue) {
            log::warn!("unknown parameter '{}' ignored", name);
        }

        fn parameters(&self) -> ParamMap {
            ParamMap::new()
        }
    }

    #[test]
    fn test_insert_then_remove_restores_wiring() {
        let mut chain = EffectChain::new(SourceId(1), 64, 64);
        chain.push(MockPlugin::boxed("a"));
        chain.push(MockPlugin::boxed("b"));
        let before = chain.names();

        chain.insert(1, MockPlugin::boxed("x"));
        assert_eq!(chain.names(), vec!["a", "x", "b"]);
        // b now reads x, x reads a
        assert_eq!(chain.input_of(2), Some(1));
        assert_eq!(chain.input_of(1), Some(0));

        chain.remove(1);
        assert_eq!(chain.names(), before);
        // b reads a again, a reads the raw input
        assert_eq!(chain.input_of(1), Some(0));
        assert_eq!(chain.input_of(0), None);
    }

    #[test]
    fn test_remove_middle_of_three_leaves_contiguous_chain() {
        let mut chain = EffectChain::new(SourceId(1), 64, 64);
        chain.push(MockPlugin::boxed("a"));
        chain.push(MockPlugin::boxed("b"));
        chain.push(MockPlugin::boxed("c"));

        chain.remove(1);
        assert_eq!(chain.len(), 2);
        assert_eq!(chain.names(), vec!["a", "c"]);
        // Stage 0 feeds stage 1, stage 1 feeds the composite input
        assert_eq!(chain.input_of(0), None);
        assert_eq!(chain.input_of(1), Some(0));
    }

    #[test]
    fn test_insert_past_end_appends() {
        let mut chain = EffectChain::new(SourceId(1), 64, 64);
        chain.push(MockPlugin::boxed("a"));
        chain.insert(10, MockPlugin::boxed("z"));
        assert_eq!(chain.names(), vec!["a", "z"]);
    }

    #[test]
    fn test_restore_defaults() {
        use crate::plugin::{ParamSpec, ShaderEffect};
        let mut chain = EffectChain::new(SourceId(1), 64, 64);
        chain.push(Box::new(ShaderEffect::new(
            "fade",
            "fn effect(uv: vec2<f32>, color: vec4<f32>) -> vec4<f32> { return color; }",
            vec![ParamSpec::new("level", 1.0)],
        )));
        chain
            .plugin_mut(0)
            .unwrap()
            .set_parameter("level", ParamValue::Float(0.2));
        chain.restore_defaults(0);
        assert_eq!(
            chain.plugin(0).unwrap().parameters().get("level"),
            Some(&ParamValue::Float(1.0))
        );
    }

    #[test]
    fn test_remove_out_of_range_is_none() {
        let mut chain = EffectChain::new(SourceId(1), 64, 64);
        chain.push(MockPlugin::boxed("a"));
        assert!(chain.remove(3).is_none());
        assert_eq!(chain.len(), 1);
    }
}
