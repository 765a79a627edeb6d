// Sources
// One compositable input: a texture plus all geometric and mixing state
//
// Sources are created through the mixer, updated once per render tick on
// the render thread, and drawn by the compositor in depth order.

mod algorithm;
mod image;
mod loopback;
mod stream;

pub use algorithm::{AlgorithmKind, AlgorithmSource};
pub use image::ImageSource;
pub use loopback::LoopbackSource;
pub use stream::{FrameGrabber, GrabberControl, StreamSource};

use crate::events::EventHub;
use crate::plugin::EffectChain;
use crate::render::{Blending, FilterKind, MaskKind, RenderContext, VIEW_EXTENT};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Failed to create source: {0}")]
    CreateError(String),
    #[error("Source producer failed: {0}")]
    ProducerError(String),
}

/// Unique identity of a source within one mixer.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct SourceId(pub u64);

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Run-time type of a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Stream,
    Algorithm,
    Image,
    Loopback,
}

/// Depth layer bounds of the source stack.
pub const MIN_DEPTH_LAYER: f64 = 0.0;
pub const MAX_DEPTH_LAYER: f64 = 40.0;

/// Magnitude bounds for either scale axis.
pub const MIN_SCALE: f64 = 0.1;
pub const MAX_SCALE: f64 = 30.0;

/// Default radius of the mixing circle; a source whose alpha coordinates
/// leave this circle is in standby.
pub const DEFAULT_LIMBO_RADIUS: f64 = 2.5;

/// Playback state machine.
///
/// `Standby` is not a state here: it is a derived condition a source can
/// have in any state (see [`SourceCore::is_standby`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlayState {
    #[default]
    Uninitialized,
    Ready,
    Playing,
    Paused,
}

/// How a source's raw scale maps the frame into its unit quad.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScalingMode {
    Crop,
    Fit,
    Deform,
    Pixel,
}

/// Color inversion mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InvertMode {
    #[default]
    None,
    Color,
    Luminance,
}

/// Where a source's pixels come from at draw time.
pub enum SourceInput<'a> {
    /// The source owns its texture.
    Own(&'a wgpu::TextureView),
    /// The compositor's previous-frame surface (recursive loopback).
    PreviousComposite,
    /// Nothing to draw yet.
    Pending,
}

/// Geometry, mixing and correction state shared by every source kind.
pub struct SourceCore {
    id: SourceId,
    pub name: String,

    // Geometry
    pub x: f64,
    pub y: f64,
    depth: f64,
    scale_x: f64,
    scale_y: f64,
    pub center_x: f64,
    pub center_y: f64,
    pub rotation: f64,
    pub aspect_ratio: f64,

    // Mixing
    alpha_x: f64,
    alpha_y: f64,
    alpha: f64,
    limbo_radius: f64,
    pub color: [f32; 3],
    pub blending: Blending,
    pub mask: MaskKind,

    // Correction
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

    // Status
    state: PlayState,
    standby_forced: bool,
    culled: bool,
    pub modifiable: bool,
    elapsed: f64,

    /// Effect stages applied to this source before compositing.
    pub effects: EffectChain,
}

impl SourceCore {
    pub fn new(id: SourceId, depth: f64, effect_width: u32, effect_height: u32) -> Self {
        Self {
            id,
            name: format!("source{}", id.0),
            x: 0.0,
            y: 0.0,
            depth: depth.clamp(MIN_DEPTH_LAYER, MAX_DEPTH_LAYER),
            scale_x: 1.0,
            scale_y: 1.0,
            center_x: 0.0,
            center_y: 0.0,
            rotation: 0.0,
            aspect_ratio: 1.0,
            alpha_x: 0.0,
            alpha_y: 0.0,
            alpha: 1.0,
            limbo_radius: DEFAULT_LIMBO_RADIUS,
            color: [1.0, 1.0, 1.0],
            blending: Blending::default(),
            mask: MaskKind::None,
            filter: FilterKind::None,
            invert: InvertMode::None,
            brightness: 0.0,
            contrast: 1.0,
            saturation: 1.0,
            hue_shift: 0.0,
            luminance_threshold: 0,
            number_of_colors: 0,
            chroma_key: false,
            chroma_key_color: [0.0, 1.0, 0.0],
            chroma_key_tolerance: 0.1,
            gamma: 1.0,
            gamma_levels: [0.0, 1.0, 0.0, 1.0],
            pixelated: false,
            state: PlayState::Uninitialized,
            standby_forced: false,
            culled: false,
            modifiable: true,
            elapsed: 0.0,
            effects: EffectChain::new(id, effect_width, effect_height),
        }
    }

    pub fn id(&self) -> SourceId {
        self.id
    }

    pub fn depth(&self) -> f64 {
        self.depth
    }

    /// Depth is clamped to the layer range; ordering is maintained by the
    /// mixer, which re-sorts after a change.
    pub fn set_depth(&mut self, depth: f64) {
        self.depth = depth.clamp(MIN_DEPTH_LAYER, MAX_DEPTH_LAYER);
    }

    pub fn scale(&self) -> (f64, f64) {
        (self.scale_x, self.scale_y)
    }

    pub fn set_scale(&mut self, sx: f64, sy: f64) {
        self.scale_x = clamp_scale(sx);
        self.scale_y = clamp_scale(sy);
    }

    pub fn scale_by(&mut self, fx: f64, fy: f64) {
        self.set_scale(self.scale_x * fx, self.scale_y * fy);
    }

    /// Reset the scale from the source's frame aspect ratio, against the
    /// composite frustum aspect.
    pub fn reset_scale(&mut self, mode: ScalingMode, frame_aspect: f64, render_aspect: f64) {
        let (sx, sy) = match mode {
            ScalingMode::Deform => (1.0, 1.0),
            ScalingMode::Crop => {
                if frame_aspect > render_aspect {
                    (frame_aspect / render_aspect, 1.0)
                } else {
                    (1.0, render_aspect / frame_aspect)
                }
            }
            ScalingMode::Fit => {
                if frame_aspect > render_aspect {
                    (1.0, render_aspect / frame_aspect)
                } else {
                    (frame_aspect / render_aspect, 1.0)
                }
            }
            ScalingMode::Pixel => (frame_aspect / render_aspect, 1.0),
        };
        self.set_scale(sx, sy);
    }

    pub fn limbo_radius(&self) -> f64 {
        self.limbo_radius
    }

    pub fn set_limbo_radius(&mut self, radius: f64) {
        self.limbo_radius = radius.max(f64::EPSILON);
        // Re-derive alpha for the new circle
        self.set_alpha_coordinates(self.alpha_x, self.alpha_y);
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn alpha_coordinates(&self) -> (f64, f64) {
        (self.alpha_x, self.alpha_y)
    }

    /// Place the source in the mixing plane. Alpha falls off with the
    /// squared distance from the center and reaches zero at the limbo
    /// circle; beyond it the position is kept (a parked source) while
    /// alpha stays pinned at zero.
    pub fn set_alpha_coordinates(&mut self, x: f64, y: f64) {
        self.alpha_x = x;
        self.alpha_y = y;
        let d = (x * x + y * y) / (self.limbo_radius * self.limbo_radius);
        self.alpha = (1.0 - d).clamp(0.0, 1.0);
    }

    /// Inverse of [`set_alpha_coordinates`]: move along the current
    /// angular direction to the radius implied by `alpha`. A source
    /// sitting exactly at the origin moves straight up.
    ///
    /// [`set_alpha_coordinates`]: Self::set_alpha_coordinates
    pub fn set_alpha(&mut self, alpha: f64) {
        let alpha = alpha.clamp(0.0, 1.0);
        let distance = self.limbo_radius * (1.0 - alpha).sqrt();
        let norm = (self.alpha_x * self.alpha_x + self.alpha_y * self.alpha_y).sqrt();
        let (dx, dy) = if norm > f64::EPSILON {
            (self.alpha_x / norm, self.alpha_y / norm)
        } else {
            (0.0, 1.0)
        };
        self.set_alpha_coordinates(dx * distance, dy * distance);
    }

    /// Outside the mixing circle a source is on standby: still updated,
    /// never composited. Forcing standby keeps a source parked wherever
    /// it is.
    pub fn is_standby(&self) -> bool {
        if self.standby_forced {
            return true;
        }
        let d = self.alpha_x * self.alpha_x + self.alpha_y * self.alpha_y;
        d >= self.limbo_radius * self.limbo_radius
    }

    pub fn set_standby(&mut self, standby: bool) {
        self.standby_forced = standby;
    }

    pub fn is_culled(&self) -> bool {
        self.culled
    }

    /// Cheap bounding-box test against the visible mixing area. Purely an
    /// optimization to skip draws; recomputed when position or scale
    /// changes.
    pub fn test_culling(&mut self, render_aspect: f64) {
        let (sin, cos) = self.rotation.to_radians().sin_cos();
        let ex = self.scale_x.abs() * cos.abs() + self.scale_y.abs() * sin.abs();
        let ey = self.scale_x.abs() * sin.abs() + self.scale_y.abs() * cos.abs();
        let half_w = VIEW_EXTENT * render_aspect;
        let half_h = VIEW_EXTENT;
        self.culled = self.x - ex > half_w
            || self.x + ex < -half_w
            || self.y - ey > half_h
            || self.y + ey < -half_h;
    }

    pub fn state(&self) -> PlayState {
        self.state
    }

    pub fn mark_ready(&mut self) {
        if self.state == PlayState::Uninitialized {
            self.state = PlayState::Ready;
        }
    }

    /// `play(true)` resumes the clock so elapsed time is continuous;
    /// `play(false)` freezes it.
    pub fn set_playing(&mut self, on: bool) {
        self.state = match (self.state, on) {
            (PlayState::Uninitialized, _) => PlayState::Uninitialized,
            (_, true) => PlayState::Playing,
            (PlayState::Playing, false) => PlayState::Paused,
            (s, false) => s,
        };
    }

    /// Seconds of accumulated play time.
    pub fn elapsed(&self) -> f64 {
        self.elapsed
    }

    /// Advance the clock by the wall-clock delta since the previous tick.
    /// Paused and not-yet-started sources keep their elapsed time.
    pub fn advance_clock(&mut self, dt: f64) {
        if self.state == PlayState::Playing {
            self.elapsed += dt;
        }
    }

    pub fn reset_clock(&mut self) {
        self.elapsed = 0.0;
    }
}

/// A compositable unit.
///
/// `update` runs once per tick on the render thread for every source,
/// including those in standby, and must never block: pull one pending
/// frame if there is one, otherwise keep displaying the last texture.
pub trait Source: Send {
    fn core(&self) -> &SourceCore;
    fn core_mut(&mut self) -> &mut SourceCore;
    fn kind(&self) -> SourceKind;

    /// Per-tick refresh: advance the clock and consume at most one
    /// pending frame.
    fn update(&mut self, ctx: &RenderContext, dt: f64, events: &EventHub);

    /// The source's raw pixels, before any effect stage.
    fn raw_input(&self) -> SourceInput<'_>;

    /// Split borrow used by the scheduler to run the effect chain over
    /// the raw input.
    fn effects_and_input(&mut self) -> (&mut EffectChain, SourceInput<'_>);

    /// Pixel size of the current frame, `(0, 0)` when unknown.
    fn frame_size(&self) -> (u32, u32) {
        (0, 0)
    }

    fn is_playable(&self) -> bool {
        false
    }

    fn is_playing(&self) -> bool {
        self.core().state() == PlayState::Playing
    }

    fn play(&mut self, _on: bool) {}

    /// What the compositor samples: the effect chain's output when one
    /// exists, the raw input otherwise.
    fn display_input(&self) -> SourceInput<'_> {
        match self.core().effects.output_view() {
            Some(view) => SourceInput::Own(view),
            None => self.raw_input(),
        }
    }

    /// Type-specific persisted payload.
    fn type_config(&self) -> crate::config::SourceTypeConfig;

    /// Loopback sources need compositor cooperation; everyone else says no.
    fn as_loopback_mut(&mut self) -> Option<&mut LoopbackSource> {
        None
    }

    fn id(&self) -> SourceId {
        self.core().id()
    }
}

fn clamp_scale(s: f64) -> f64 {
    let magnitude = s.abs().clamp(MIN_SCALE, MAX_SCALE);
    if s.is_sign_negative() {
        -magnitude
    } else {
        magnitude
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn core() -> SourceCore {
        SourceCore::new(SourceId(1), 1.0, 64, 64)
    }

    #[test]
    fn test_alpha_at_center_is_one() {
        let mut c = core();
        c.set_alpha_coordinates(0.0, 0.0);
        assert_eq!(c.alpha(), 1.0);
        assert!(!c.is_standby());
    }

    #[test]
    fn test_alpha_at_limbo_circle_is_zero() {
        let mut c = core();
        c.set_alpha_coordinates(2.5, 0.0);
        assert_eq!(c.alpha(), 0.0);
        assert!(c.is_standby());
        // Position preserved, not clamped
        assert_eq!(c.alpha_coordinates(), (2.5, 0.0));
    }

    #[test]
    fn test_alpha_quarter_distance() {
        let mut c = core();
        c.set_alpha_coordinates(1.25, 0.0);
        assert!((c.alpha() - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_alpha_monotonically_decreasing_in_distance() {
        let mut c = core();
        let mut previous = f64::INFINITY;
        for step in 0..=50 {
            let r = 2.5 * step as f64 / 50.0;
            c.set_alpha_coordinates(r, 0.0);
            assert!(c.alpha() <= previous);
            previous = c.alpha();
        }
        assert_eq!(previous, 0.0);
    }

    #[test]
    fn test_set_alpha_roundtrip() {
        for a in [0.0, 0.1, 0.25, 0.5, 0.75, 0.99, 1.0] {
            let mut c = core();
            c.set_alpha_coordinates(0.7, -1.3);
            c.set_alpha(a);
            assert!((c.alpha() - a).abs() < 1e-6, "alpha {} round-trips", a);
        }
    }

    #[test]
    fn test_set_alpha_preserves_direction() {
        let mut c = core();
        c.set_alpha_coordinates(1.0, 1.0);
        c.set_alpha(0.5);
        let (x, y) = c.alpha_coordinates();
        assert!((x - y).abs() < 1e-9, "direction kept along the diagonal");
        assert!(x > 0.0);
    }

    #[test]
    fn test_set_alpha_from_origin_goes_up() {
        let mut c = core();
        c.set_alpha_coordinates(0.0, 0.0);
        c.set_alpha(0.75);
        let (x, y) = c.alpha_coordinates();
        assert_eq!(x, 0.0);
        assert!(y > 0.0);
        assert!((c.alpha() - 0.75).abs() < 1e-6);
    }

    #[test]
    fn test_parked_source_keeps_position() {
        let mut c = core();
        c.set_alpha_coordinates(4.0, 3.0);
        assert_eq!(c.alpha(), 0.0);
        assert!(c.is_standby());
        assert_eq!(c.alpha_coordinates(), (4.0, 3.0));
    }

    #[test]
    fn test_scale_clamped() {
        let mut c = core();
        c.set_scale(0.0001, 100.0);
        assert_eq!(c.scale(), (MIN_SCALE, MAX_SCALE));
        c.set_scale(-100.0, -0.0001);
        assert_eq!(c.scale(), (-MAX_SCALE, -MIN_SCALE));
    }

    #[test]
    fn test_depth_clamped() {
        let mut c = core();
        c.set_depth(-3.0);
        assert_eq!(c.depth(), MIN_DEPTH_LAYER);
        c.set_depth(99.0);
        assert_eq!(c.depth(), MAX_DEPTH_LAYER);
    }

    #[test]
    fn test_play_state_transitions() {
        let mut c = core();
        assert_eq!(c.state(), PlayState::Uninitialized);
        c.set_playing(true);
        assert_eq!(c.state(), PlayState::Uninitialized);
        c.mark_ready();
        assert_eq!(c.state(), PlayState::Ready);
        c.set_playing(true);
        assert_eq!(c.state(), PlayState::Playing);
        c.set_playing(false);
        assert_eq!(c.state(), PlayState::Paused);
        c.set_playing(true);
        assert_eq!(c.state(), PlayState::Playing);
    }

    #[test]
    fn test_clock_advances_only_while_playing() {
        let mut c = core();
        c.mark_ready();
        c.advance_clock(1.0);
        assert_eq!(c.elapsed(), 0.0);
        c.set_playing(true);
        c.advance_clock(0.5);
        c.advance_clock(0.25);
        assert_eq!(c.elapsed(), 0.75);
        c.set_playing(false);
        c.advance_clock(10.0);
        assert_eq!(c.elapsed(), 0.75);
    }

    #[test]
    fn test_standby_can_coexist_with_playing() {
        let mut c = core();
        c.mark_ready();
        c.set_playing(true);
        c.set_alpha_coordinates(5.0, 0.0);
        assert_eq!(c.state(), PlayState::Playing);
        assert!(c.is_standby());
    }

    #[test]
    fn test_culling() {
        let mut c = core();
        c.test_culling(1.0);
        assert!(!c.is_culled());
        c.x = VIEW_EXTENT + 2.0;
        c.test_culling(1.0);
        assert!(c.is_culled());
        // A large scale reaches back into the visible area
        c.set_scale(5.0, 5.0);
        c.test_culling(1.0);
        assert!(!c.is_culled());
    }

    #[test]
    fn test_limbo_radius_change_rescales_alpha() {
        let mut c = core();
        c.set_alpha_coordinates(1.25, 0.0);
        assert!((c.alpha() - 0.75).abs() < 1e-9);
        c.set_limbo_radius(1.25);
        assert_eq!(c.alpha(), 0.0);
        assert!(c.is_standby());
    }
}
