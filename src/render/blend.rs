// Per-source blending state
// Named factor/equation enums, mapped to wgpu blend descriptors
//
// Configurations persist these by name; raw graphics-API constants never
// leave the process.

use serde::{Deserialize, Serialize};

/// Blend factor, applied to the source or destination color.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BlendFactor {
    Zero,
    One,
    SrcColor,
    OneMinusSrcColor,
    DstColor,
    OneMinusDstColor,
    SrcAlpha,
    OneMinusSrcAlpha,
    DstAlpha,
    OneMinusDstAlpha,
}

impl BlendFactor {
    pub fn to_wgpu(self) -> wgpu::BlendFactor {
        match self {
            BlendFactor::Zero => wgpu::BlendFactor::Zero,
            BlendFactor::One => wgpu::BlendFactor::One,
            BlendFactor::SrcColor => wgpu::BlendFactor::Src,
            BlendFactor::OneMinusSrcColor => wgpu::BlendFactor::OneMinusSrc,
            BlendFactor::DstColor => wgpu::BlendFactor::Dst,
            BlendFactor::OneMinusDstColor => wgpu::BlendFactor::OneMinusDst,
            BlendFactor::SrcAlpha => wgpu::BlendFactor::SrcAlpha,
            BlendFactor::OneMinusSrcAlpha => wgpu::BlendFactor::OneMinusSrcAlpha,
            BlendFactor::DstAlpha => wgpu::BlendFactor::DstAlpha,
            BlendFactor::OneMinusDstAlpha => wgpu::BlendFactor::OneMinusDstAlpha,
        }
    }
}

/// Blend equation combining the weighted source and destination colors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BlendEquation {
    Add,
    Subtract,
    ReverseSubtract,
    Min,
    Max,
}

impl BlendEquation {
    pub fn to_wgpu(self) -> wgpu::BlendOperation {
        match self {
            BlendEquation::Add => wgpu::BlendOperation::Add,
            BlendEquation::Subtract => wgpu::BlendOperation::Subtract,
            BlendEquation::ReverseSubtract => wgpu::BlendOperation::ReverseSubtract,
            BlendEquation::Min => wgpu::BlendOperation::Min,
            BlendEquation::Max => wgpu::BlendOperation::Max,
        }
    }

    /// Whether swapping draw order can change the result for some factor
    /// pair. Only used for diagnostics.
    pub fn is_order_sensitive(self) -> bool {
        !matches!(self, BlendEquation::Min | BlendEquation::Max)
    }
}

/// Complete blending state of one source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Blending {
    pub source: BlendFactor,
    pub destination: BlendFactor,
    pub equation: BlendEquation,
}

impl Default for Blending {
    /// Additive mixing: the classic crossfader behaviour where overlapping
    /// sources sum up.
    fn default() -> Self {
        Self {
            source: BlendFactor::SrcAlpha,
            destination: BlendFactor::One,
            equation: BlendEquation::Add,
        }
    }
}

impl Blending {
    /// Standard source-over alpha blending.
    pub fn alpha_over() -> Self {
        Self {
            source: BlendFactor::SrcAlpha,
            destination: BlendFactor::OneMinusSrcAlpha,
            equation: BlendEquation::Add,
        }
    }

    pub fn to_wgpu(self) -> wgpu::BlendState {
        let color = wgpu::BlendComponent {
            src_factor: self.source.to_wgpu(),
            dst_factor: self.destination.to_wgpu(),
            operation: self.equation.to_wgpu(),
        };
        // Alpha accumulates so the composite stays readable as RGBA
        let alpha = wgpu::BlendComponent {
            src_factor: wgpu::BlendFactor::One,
            dst_factor: wgpu::BlendFactor::One,
            operation: wgpu::BlendOperation::Add,
        };
        wgpu::BlendState { color, alpha }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Scalar model of one blended channel, enough to check ordering and
    // equation semantics without a GPU.
    fn factor(f: BlendFactor, src: f64, dst: f64) -> f64 {
        match f {
            BlendFactor::Zero => 0.0,
            BlendFactor::One => 1.0,
            BlendFactor::SrcColor | BlendFactor::SrcAlpha => src,
            BlendFactor::OneMinusSrcColor | BlendFactor::OneMinusSrcAlpha => 1.0 - src,
            BlendFactor::DstColor | BlendFactor::DstAlpha => dst,
            BlendFactor::OneMinusDstColor | BlendFactor::OneMinusDstAlpha => 1.0 - dst,
        }
    }

    fn blend_channel(b: Blending, src: f64, dst: f64) -> f64 {
        let s = src * factor(b.source, src, dst);
        let d = dst * factor(b.destination, src, dst);
        let v = match b.equation {
            BlendEquation::Add => s + d,
            BlendEquation::Subtract => s - d,
            BlendEquation::ReverseSubtract => d - s,
            BlendEquation::Min => s.min(d),
            BlendEquation::Max => s.max(d),
        };
        v.clamp(0.0, 1.0)
    }

    fn composite(b: Blending, layers: &[f64]) -> f64 {
        layers.iter().fold(0.0, |dst, &src| blend_channel(b, src, dst))
    }

    #[test]
    fn test_non_commutative_blend_is_order_sensitive() {
        let b = Blending {
            source: BlendFactor::One,
            destination: BlendFactor::OneMinusSrcColor,
            equation: BlendEquation::Add,
        };
        let forward = composite(b, &[0.8, 0.3, 0.1]);
        let reverse = composite(b, &[0.1, 0.3, 0.8]);
        assert!((forward - reverse).abs() > 1e-6);
    }

    #[test]
    fn test_additive_default_is_order_independent() {
        let b = Blending::default();
        // With full source alpha the default reduces to a plain sum
        let forward = composite(b, &[0.2, 0.3, 0.1]);
        let reverse = composite(b, &[0.1, 0.3, 0.2]);
        assert!((forward - reverse).abs() < 1e-9);
    }

    #[test]
    fn test_roundtrip_by_name() {
        let b = Blending {
            source: BlendFactor::SrcAlpha,
            destination: BlendFactor::OneMinusSrcAlpha,
            equation: BlendEquation::ReverseSubtract,
        };
        let json = serde_json::to_string(&b).unwrap();
        // Names, not numeric driver constants
        assert!(json.contains("one-minus-src-alpha"));
        assert!(json.contains("reverse-subtract"));
        let back: Blending = serde_json::from_str(&json).unwrap();
        assert_eq!(back, b);
    }

    #[test]
    fn test_wgpu_mapping_distinct() {
        assert_ne!(
            Blending::default().to_wgpu(),
            Blending::alpha_over().to_wgpu()
        );
    }
}
