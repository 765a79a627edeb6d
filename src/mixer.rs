// Mixer
// Owns the depth-ordered source set, hands out ids, and round-trips the
// session configuration

use crate::config::{
    apply_config_to_core, config_from_core, PluginConfig, PluginReference, SessionConfig,
    SourceConfig, SourceTypeConfig,
};
use crate::events::{EventHub, MixerEvent};
use crate::memory::PicturePool;
use crate::plugin::{EffectPlugin, ParamSpec, PluginError, ShaderEffect};
use crate::source::{
    AlgorithmKind, AlgorithmSource, FrameGrabber, ImageSource, LoopbackSource, Source,
    SourceError, SourceId, SourceKind, StreamSource, DEFAULT_LIMBO_RADIUS,
};
use std::path::Path;
use std::sync::Arc;

/// Callback resolving a persisted plugin file reference to a live plugin.
pub type PluginLoader =
    Box<dyn Fn(&Path) -> Result<Box<dyn EffectPlugin>, PluginError> + Send>;

/// The live source collection.
///
/// Sources are kept sorted by depth; iteration order is the compositing
/// order (back first). All mutation happens on the render thread.
pub struct Mixer {
    sources: Vec<Box<dyn Source>>,
    next_id: u64,
    pool: Arc<PicturePool>,
    events: Arc<EventHub>,
    limbo_radius: f64,
    /// Working resolution handed to new effect chains.
    effect_size: (u32, u32),
    current: Option<SourceId>,
    plugin_loader: Option<PluginLoader>,
}

impl Mixer {
    pub fn new(effect_width: u32, effect_height: u32) -> Self {
        Self {
            sources: Vec::new(),
            next_id: 1,
            pool: PicturePool::new(),
            events: Arc::new(EventHub::new()),
            limbo_radius: DEFAULT_LIMBO_RADIUS,
            effect_size: (effect_width, effect_height),
            current: None,
            plugin_loader: None,
        }
    }

    pub fn pool(&self) -> &Arc<PicturePool> {
        &self.pool
    }

    pub fn events(&self) -> &Arc<EventHub> {
        &self.events
    }

    pub fn subscribe(&self) -> crossbeam_channel::Receiver<MixerEvent> {
        self.events.subscribe()
    }

    /// Install the host's resolver for persisted native-plugin entries.
    pub fn set_plugin_loader(&mut self, loader: PluginLoader) {
        self.plugin_loader = Some(loader);
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    fn allocate_id(&mut self) -> SourceId {
        let id = SourceId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Keep `name` unique across the set, suffixing like a file manager.
    fn unique_name(&self, base: &str) -> String {
        let mut name = base.to_string();
        let mut suffix = 1;
        while self.sources.iter().any(|s| s.core().name == name) {
            suffix += 1;
            name = format!("{}-{}", base, suffix);
        }
        name
    }

    fn insert(&mut self, mut source: Box<dyn Source>) -> SourceId {
        let id = source.core().id();
        source.core_mut().set_limbo_radius(self.limbo_radius);
        let name = self.unique_name(&source.core().name.clone());
        source.core_mut().name = name;
        self.sources.push(source);
        self.sort_by_depth();
        self.current = Some(id);
        self.events.emit(MixerEvent::SourceAdded(id));
        id
    }

    fn sort_by_depth(&mut self) {
        self.sources.sort_by(|a, b| {
            a.core()
                .depth()
                .partial_cmp(&b.core().depth())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.core().id().cmp(&b.core().id()))
        });
    }

    /// Depth at the front of the stack for a newly dropped source.
    fn next_depth(&self) -> f64 {
        self.sources
            .last()
            .map(|s| s.core().depth() + 1.0)
            .unwrap_or(1.0)
    }

    pub fn add_algorithm_source(
        &mut self,
        kind: AlgorithmKind,
        width: u32,
        height: u32,
        fps: u32,
    ) -> SourceId {
        let id = self.allocate_id();
        let source = AlgorithmSource::spawn(
            id,
            self.next_depth(),
            self.effect_size,
            Arc::clone(&self.pool),
            kind,
            width,
            height,
            fps,
        );
        self.insert(Box::new(source))
    }

    pub fn add_image_source(&mut self, path: &Path) -> Result<SourceId, SourceError> {
        let id = self.allocate_id();
        let source = ImageSource::load(id, self.next_depth(), self.effect_size, &self.pool, path)?;
        Ok(self.insert(Box::new(source)))
    }

    /// Attach an external producer (video decoder, camera driver).
    pub fn add_stream_source(&mut self, grabber: Box<dyn FrameGrabber>) -> SourceId {
        let id = self.allocate_id();
        let source = StreamSource::spawn(
            id,
            self.next_depth(),
            self.effect_size,
            Arc::clone(&self.pool),
            grabber,
        );
        self.insert(Box::new(source))
    }

    pub fn add_loopback_source(&mut self, recursive: bool) -> SourceId {
        let id = self.allocate_id();
        let source = LoopbackSource::new(id, self.next_depth(), self.effect_size, recursive);
        self.insert(Box::new(source))
    }

    /// Remove and drop a source. Producer threads are joined by the
    /// source's own teardown before its GPU resources go away.
    pub fn remove_source(&mut self, id: SourceId) -> bool {
        let Some(index) = self.sources.iter().position(|s| s.core().id() == id) else {
            return false;
        };
        self.sources.remove(index);
        if self.current == Some(id) {
            self.current = None;
        }
        self.events.emit(MixerEvent::SourceRemoved(id));
        log::info!("source {} removed", id);
        true
    }

    pub fn source(&self, id: SourceId) -> Option<&dyn Source> {
        self.sources
            .iter()
            .find(|s| s.core().id() == id)
            .map(|s| s.as_ref())
    }

    pub fn source_mut(&mut self, id: SourceId) -> Option<&mut Box<dyn Source>> {
        self.sources.iter_mut().find(|s| s.core().id() == id)
    }

    /// Back-to-front iteration, the compositing order.
    pub fn iter(&self) -> impl Iterator<Item = &Box<dyn Source>> {
        self.sources.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Box<dyn Source>> {
        self.sources.iter_mut()
    }

    pub fn set_current(&mut self, id: Option<SourceId>) {
        self.current = id.filter(|id| self.source(*id).is_some());
    }

    pub fn current(&self) -> Option<SourceId> {
        self.current
    }

    /// Move a source to another depth layer and restore the stack order.
    pub fn set_depth(&mut self, id: SourceId, depth: f64) {
        if let Some(source) = self.source_mut(id) {
            source.core_mut().set_depth(depth);
            self.sort_by_depth();
        }
    }

    /// Drop a source at mixing coordinates, the interactive way of
    /// setting its transparency.
    pub fn drop_source_with_alpha(&mut self, id: SourceId, x: f64, y: f64) {
        if let Some(source) = self.source_mut(id) {
            source.core_mut().set_alpha_coordinates(x, y);
        }
    }

    pub fn limbo_radius(&self) -> f64 {
        self.limbo_radius
    }

    /// Resize the mixing circle; every source's alpha is re-derived.
    pub fn set_limbo_radius(&mut self, radius: f64) {
        self.limbo_radius = radius.max(f64::EPSILON);
        for source in &mut self.sources {
            source.core_mut().set_limbo_radius(radius);
        }
    }

    /// Whether any source consumes the previous composite; drives the
    /// compositor's loopback bookkeeping.
    pub fn has_recursive_loopback(&self) -> bool {
        self.sources.iter().any(|s| {
            s.kind() == SourceKind::Loopback
                && matches!(
                    s.type_config(),
                    SourceTypeConfig::Loopback { recursive: true }
                )
        })
    }

    /// Append an effect stage to a source's chain.
    pub fn attach_plugin(&mut self, id: SourceId, plugin: Box<dyn EffectPlugin>) -> bool {
        match self.source_mut(id) {
            Some(source) => {
                source.core_mut().effects.push(plugin);
                true
            }
            None => false,
        }
    }

    pub fn detach_plugin(&mut self, id: SourceId, stage: usize) -> bool {
        match self.source_mut(id) {
            Some(source) => source.core_mut().effects.remove(stage).is_some(),
            None => false,
        }
    }

    fn instantiate_plugin(
        &self,
        config: &PluginConfig,
    ) -> Result<Box<dyn EffectPlugin>, PluginError> {
        let mut plugin: Box<dyn EffectPlugin> = match &config.reference {
            PluginReference::Inline { name, code } => {
                let specs = config
                    .params
                    .iter()
                    .map(|(name, value)| ParamSpec::new(name, value.as_f32()))
                    .collect();
                Box::new(ShaderEffect::new(name, code, specs))
            }
            PluginReference::File { path } => match &self.plugin_loader {
                Some(loader) => loader(path)?,
                None => {
                    return Err(PluginError::InitFailed(format!(
                        "no plugin loader installed for {}",
                        path.display()
                    )))
                }
            },
            PluginReference::Opaque { name } => {
                return Err(PluginError::InitFailed(format!(
                    "plugin '{}' cannot be restored from a session file",
                    name
                )))
            }
        };
        for (name, value) in &config.params {
            plugin.set_parameter(name, value.clone());
        }
        Ok(plugin)
    }

    /// Capture every source into a session block.
    pub fn get_configuration(
        &self,
        resolution: (u32, u32),
        clear_to_white: bool,
        loopback_period: u32,
    ) -> SessionConfig {
        let sources = self
            .sources
            .iter()
            .map(|source| {
                let mut config = config_from_core(
                    source.core(),
                    source.type_config(),
                    source.is_playing(),
                );
                config.plugins = source.core().effects.configs();
                config
            })
            .collect();
        SessionConfig {
            resolution,
            clear_to_white,
            limbo_radius: self.limbo_radius,
            loopback_period,
            sources,
        }
    }

    /// Rebuild the source set from a session block. Sources backed by
    /// external producers cannot be conjured from a file; they are
    /// reported and skipped, for the host to re-attach.
    pub fn set_configuration(&mut self, session: &SessionConfig) {
        let old: Vec<SourceId> = self.sources.iter().map(|s| s.core().id()).collect();
        for id in old {
            self.remove_source(id);
        }

        self.set_limbo_radius(session.limbo_radius);

        for source_config in &session.sources {
            let id = match &source_config.kind {
                SourceTypeConfig::Algorithm {
                    kind,
                    width,
                    height,
                    fps,
                } => Some(self.add_algorithm_source(*kind, *width, *height, *fps)),
                SourceTypeConfig::Image { path } => match self.add_image_source(path) {
                    Ok(id) => Some(id),
                    Err(e) => {
                        log::warn!("session image source skipped: {}", e);
                        None
                    }
                },
                SourceTypeConfig::Loopback { recursive } => {
                    Some(self.add_loopback_source(*recursive))
                }
                SourceTypeConfig::Stream { description } => {
                    log::warn!(
                        "session stream source '{}' must be re-attached by the host",
                        description
                    );
                    None
                }
            };
            let Some(id) = id else { continue };
            self.apply_source_config(id, source_config);
        }
    }

    /// Apply one persisted block to a live source.
    pub fn apply_source_config(&mut self, id: SourceId, config: &SourceConfig) {
        let plugins: Vec<Box<dyn EffectPlugin>> = config
            .plugins
            .iter()
            .filter_map(|p| match self.instantiate_plugin(p) {
                Ok(plugin) => Some(plugin),
                Err(e) => {
                    log::warn!("session plugin skipped: {}", e);
                    None
                }
            })
            .collect();

        let playing = config.playing;
        let standby = config.standby;
        if let Some(source) = self.source_mut(id) {
            apply_config_to_core(config, source.core_mut());
            for plugin in plugins {
                source.core_mut().effects.push(plugin);
            }
            // Only force standby when the position alone would not
            let parked_inside = {
                let (x, y) = source.core().alpha_coordinates();
                let r = source.core().limbo_radius();
                x * x + y * y < r * r
            };
            source.core_mut().set_standby(standby && parked_inside);
            source.play(playing);
        }
        self.sort_by_depth();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mixer_with_sources() -> (Mixer, SourceId, SourceId) {
        let mut mixer = Mixer::new(64, 64);
        let a = mixer.add_algorithm_source(AlgorithmKind::Flat, 32, 32, 5);
        let b = mixer.add_loopback_source(true);
        (mixer, a, b)
    }

    #[test]
    fn test_ids_are_sequential_and_unique() {
        let (mixer, a, b) = mixer_with_sources();
        assert_ne!(a, b);
        assert_eq!(mixer.len(), 2);
        assert!(mixer.source(a).is_some());
        assert!(mixer.source(b).is_some());
    }

    #[test]
    fn test_depth_order_is_maintained() {
        let (mut mixer, a, b) = mixer_with_sources();
        // b was added last, so it sits in front
        let order: Vec<SourceId> = mixer.iter().map(|s| s.core().id()).collect();
        assert_eq!(order, vec![a, b]);

        mixer.set_depth(a, 30.0);
        let order: Vec<SourceId> = mixer.iter().map(|s| s.core().id()).collect();
        assert_eq!(order, vec![b, a]);
    }

    #[test]
    fn test_remove_source() {
        let (mut mixer, a, _b) = mixer_with_sources();
        let events = mixer.subscribe();
        assert!(mixer.remove_source(a));
        assert!(!mixer.remove_source(a));
        assert_eq!(mixer.len(), 1);
        assert!(events
            .try_iter()
            .any(|e| e == MixerEvent::SourceRemoved(a)));
    }

    #[test]
    fn test_names_are_unique() {
        let mut mixer = Mixer::new(64, 64);
        let a = mixer.add_loopback_source(true);
        let b = mixer.add_loopback_source(true);
        // Loopback sources share a base name until the mixer suffixes them
        let name_a = mixer.source(a).unwrap().core().name.clone();
        let name_b = mixer.source(b).unwrap().core().name.clone();
        assert_ne!(name_a, name_b);
    }

    #[test]
    fn test_recursive_loopback_detection() {
        let mut mixer = Mixer::new(64, 64);
        assert!(!mixer.has_recursive_loopback());
        let id = mixer.add_loopback_source(true);
        assert!(mixer.has_recursive_loopback());
        mixer.remove_source(id);
        assert!(!mixer.has_recursive_loopback());
        mixer.add_loopback_source(false);
        assert!(!mixer.has_recursive_loopback());
    }

    #[test]
    fn test_configuration_roundtrip_with_plugins() {
        let (mut mixer, a, _b) = mixer_with_sources();

        // 3 chained plugins on source a
        for name in ["one", "two", "three"] {
            mixer.attach_plugin(
                a,
                Box::new(ShaderEffect::new(
                    name,
                    "fn effect(uv: vec2<f32>, color: vec4<f32>) -> vec4<f32> { return color; }",
                    vec![ParamSpec::new("level", 0.5)],
                )),
            );
        }
        {
            let core = mixer.source_mut(a).unwrap().core_mut();
            core.set_alpha_coordinates(1.0, 0.5);
            core.set_scale(2.0, 2.0);
            core.rotation = 15.0;
        }

        let session = mixer.get_configuration((640, 480), false, 1);
        assert_eq!(session.sources.len(), 2);
        let saved = session
            .sources
            .iter()
            .find(|s| s.plugins.len() == 3)
            .expect("source with chain persisted")
            .clone();

        let mut restored = Mixer::new(64, 64);
        restored.set_configuration(&session);
        assert_eq!(restored.len(), 2);

        let reloaded = restored.get_configuration((640, 480), false, 1);
        let restored_source = reloaded
            .sources
            .iter()
            .find(|s| s.plugins.len() == 3)
            .expect("chain restored");
        assert!((restored_source.alpha - saved.alpha).abs() < 1e-4);
        assert!((restored_source.rotation - saved.rotation).abs() < 1e-4);
        assert_eq!(restored_source.blending, saved.blending);
        assert_eq!(restored_source.plugins, saved.plugins);
    }

    #[test]
    fn test_configuration_roundtrip_zero_and_one_plugin() {
        let mut mixer = Mixer::new(64, 64);
        let a = mixer.add_algorithm_source(AlgorithmKind::Gradient, 32, 32, 5);
        mixer.add_algorithm_source(AlgorithmKind::Noise, 32, 32, 5);
        mixer.attach_plugin(a, Box::new(ShaderEffect::passthrough()));

        let session = mixer.get_configuration((320, 240), true, 2);
        let mut restored = Mixer::new(64, 64);
        restored.set_configuration(&session);
        let reloaded = restored.get_configuration((320, 240), true, 2);

        let plugin_counts = |s: &SessionConfig| {
            let mut counts: Vec<usize> = s.sources.iter().map(|c| c.plugins.len()).collect();
            counts.sort();
            counts
        };
        assert_eq!(plugin_counts(&session), plugin_counts(&reloaded));
    }

    #[test]
    fn test_attach_detach_plugin() {
        let (mut mixer, a, _b) = mixer_with_sources();
        assert!(mixer.attach_plugin(a, Box::new(ShaderEffect::passthrough())));
        assert_eq!(mixer.source(a).unwrap().core().effects.len(), 1);
        assert!(mixer.detach_plugin(a, 0));
        assert_eq!(mixer.source(a).unwrap().core().effects.len(), 0);
        assert!(!mixer.detach_plugin(a, 0));
    }
}
