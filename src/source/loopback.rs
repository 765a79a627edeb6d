// Loopback source
// Reads the compositor's own output back as an input
//
// Recursive: samples the shared previous-frame surface, one tick late by
// construction, so the same-frame read/write hazard cannot exist.
// Non-recursive: gets a private copy of the just-finished composite each
// tick, zero extra latency at the cost of one copy.

use super::{Source, SourceCore, SourceId, SourceInput, SourceKind};
use crate::events::EventHub;
use crate::plugin::EffectChain;
use crate::render::{RenderContext, RenderTarget};

pub struct LoopbackSource {
    core: SourceCore,
    recursive: bool,
    /// Private composite copy, allocated lazily (non-recursive only).
    snapshot: Option<RenderTarget>,
    frame_size: (u32, u32),
}

impl LoopbackSource {
    pub fn new(id: SourceId, depth: f64, effect_size: (u32, u32), recursive: bool) -> Self {
        let mut core = SourceCore::new(id, depth, effect_size.0, effect_size.1);
        core.name = if recursive {
            format!("loopback{}", id.0)
        } else {
            format!("monitor{}", id.0)
        };
        Self {
            core,
            recursive,
            snapshot: None,
            frame_size: (0, 0),
        }
    }

    pub fn is_recursive(&self) -> bool {
        self.recursive
    }

    /// Switching recursion drops the private surface; the compositor's
    /// loopback bookkeeping is refreshed by the mixer.
    pub fn set_recursive(&mut self, recursive: bool) {
        if self.recursive != recursive {
            self.recursive = recursive;
            self.snapshot = None;
        }
    }

    /// Target the scheduler copies the fresh composite into, sized to the
    /// composite surface (non-recursive only).
    pub fn snapshot_target(
        &mut self,
        ctx: &RenderContext,
        width: u32,
        height: u32,
    ) -> Option<&RenderTarget> {
        if self.recursive {
            return None;
        }
        let stale = self
            .snapshot
            .as_ref()
            .is_some_and(|t| t.size() != (width, height));
        if stale || self.snapshot.is_none() {
            self.snapshot = Some(RenderTarget::new(ctx, width, height, "Loopback Snapshot"));
        }
        self.frame_size = (width, height);
        self.snapshot.as_ref()
    }
}

impl Source for LoopbackSource {
    fn core(&self) -> &SourceCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut SourceCore {
        &mut self.core
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Loopback
    }

    fn update(&mut self, _ctx: &RenderContext, dt: f64, _events: &EventHub) {
        // Content is produced by the compositor; there is only the clock
        // to keep in sync
        self.core.advance_clock(dt);
        self.core.mark_ready();
        if self.core.state() == super::PlayState::Ready {
            self.core.set_playing(true);
        }
    }

    fn raw_input(&self) -> SourceInput<'_> {
        if self.recursive {
            SourceInput::PreviousComposite
        } else {
            match &self.snapshot {
                Some(target) => SourceInput::Own(target.view()),
                None => SourceInput::Pending,
            }
        }
    }

    fn effects_and_input(&mut self) -> (&mut EffectChain, SourceInput<'_>) {
        let input = if self.recursive {
            SourceInput::PreviousComposite
        } else {
            match &self.snapshot {
                Some(target) => SourceInput::Own(target.view()),
                None => SourceInput::Pending,
            }
        };
        (&mut self.core.effects, input)
    }

    fn frame_size(&self) -> (u32, u32) {
        self.frame_size
    }

    fn type_config(&self) -> crate::config::SourceTypeConfig {
        crate::config::SourceTypeConfig::Loopback {
            recursive: self.recursive,
        }
    }

    fn as_loopback_mut(&mut self) -> Option<&mut LoopbackSource> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recursive_reads_previous_composite() {
        let source = LoopbackSource::new(SourceId(1), 1.0, (64, 64), true);
        assert!(matches!(
            source.raw_input(),
            SourceInput::PreviousComposite
        ));
    }

    #[test]
    fn test_non_recursive_pending_until_snapshot() {
        let source = LoopbackSource::new(SourceId(2), 1.0, (64, 64), false);
        assert!(matches!(source.raw_input(), SourceInput::Pending));
    }

    #[test]
    fn test_switching_recursion_drops_snapshot() {
        let mut source = LoopbackSource::new(SourceId(3), 1.0, (64, 64), false);
        source.set_recursive(true);
        assert!(source.snapshot.is_none());
        assert!(matches!(
            source.raw_input(),
            SourceInput::PreviousComposite
        ));
    }
}
