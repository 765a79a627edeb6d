// Per-source convolution / morphology filters
// Executed in the compositing fragment shader

use serde::{Deserialize, Serialize};

/// Shader-side filter mode selector.
pub const FILTER_MODE_NONE: u32 = 0;
pub const FILTER_MODE_KERNEL: u32 = 1;
pub const FILTER_MODE_EROSION: u32 = 2;
pub const FILTER_MODE_DILATION: u32 = 3;

/// Image filter applied to a source before color correction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FilterKind {
    #[default]
    None,
    BlurGaussian,
    BlurMean,
    Sharpen,
    SharpenMore,
    EdgeGaussian,
    EdgeLaplace,
    EdgeLaplace2,
    Emboss,
    EmbossEdge,
    Erosion3x3,
    Erosion7x7,
    Erosion13x13,
    Dilation3x3,
    Dilation7x7,
    Dilation13x13,
}

/// Resolved shader parameters for one filter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterParams {
    pub mode: u32,
    /// Morphology radius in texels (0 for kernel filters).
    pub radius: u32,
    /// 3x3 convolution kernel, row-major.
    pub kernel: [[f32; 3]; 3],
}

impl FilterKind {
    pub fn params(&self) -> FilterParams {
        use FilterKind::*;
        let kernel3 = |k: [[f32; 3]; 3]| FilterParams {
            mode: FILTER_MODE_KERNEL,
            radius: 0,
            kernel: k,
        };
        let morpho = |mode: u32, radius: u32| FilterParams {
            mode,
            radius,
            kernel: [[0.0; 3]; 3],
        };
        match self {
            None => FilterParams {
                mode: FILTER_MODE_NONE,
                radius: 0,
                kernel: [[0.0; 3]; 3],
            },
            BlurGaussian => kernel3([
                [1.0 / 16.0, 2.0 / 16.0, 1.0 / 16.0],
                [2.0 / 16.0, 4.0 / 16.0, 2.0 / 16.0],
                [1.0 / 16.0, 2.0 / 16.0, 1.0 / 16.0],
            ]),
            BlurMean => kernel3([[1.0 / 9.0; 3]; 3]),
            Sharpen => kernel3([
                [0.0, -1.0, 0.0],
                [-1.0, 5.0, -1.0],
                [0.0, -1.0, 0.0],
            ]),
            SharpenMore => kernel3([
                [-1.0, -1.0, -1.0],
                [-1.0, 9.0, -1.0],
                [-1.0, -1.0, -1.0],
            ]),
            EdgeGaussian => kernel3([
                [-0.125, -0.25, -0.125],
                [-0.25, 2.5, -0.25],
                [-0.125, -0.25, -0.125],
            ]),
            EdgeLaplace => kernel3([
                [0.0, -1.0, 0.0],
                [-1.0, 4.0, -1.0],
                [0.0, -1.0, 0.0],
            ]),
            EdgeLaplace2 => kernel3([
                [-2.0, 1.0, -2.0],
                [1.0, 4.0, 1.0],
                [-2.0, 1.0, -2.0],
            ]),
            Emboss => kernel3([
                [-2.0, -1.0, 0.0],
                [-1.0, 1.0, 1.0],
                [0.0, 1.0, 2.0],
            ]),
            EmbossEdge => kernel3([
                [5.0, -3.0, -3.0],
                [5.0, 0.0, -3.0],
                [5.0, -3.0, -3.0],
            ]),
            Erosion3x3 => morpho(FILTER_MODE_EROSION, 1),
            Erosion7x7 => morpho(FILTER_MODE_EROSION, 3),
            Erosion13x13 => morpho(FILTER_MODE_EROSION, 6),
            Dilation3x3 => morpho(FILTER_MODE_DILATION, 1),
            Dilation7x7 => morpho(FILTER_MODE_DILATION, 3),
            Dilation13x13 => morpho(FILTER_MODE_DILATION, 6),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_none_has_no_effect_mode() {
        assert_eq!(FilterKind::None.params().mode, FILTER_MODE_NONE);
    }

    #[test]
    fn test_blur_kernels_are_normalized() {
        for kind in [FilterKind::BlurGaussian, FilterKind::BlurMean] {
            let sum: f32 = kind
                .params()
                .kernel
                .iter()
                .flatten()
                .sum();
            assert!((sum - 1.0).abs() < 1e-6, "{:?} sums to {}", kind, sum);
        }
    }

    #[test]
    fn test_sharpen_preserves_flat_regions() {
        // A kernel summing to 1 leaves a constant image unchanged
        let sum: f32 = FilterKind::Sharpen.params().kernel.iter().flatten().sum();
        assert!((sum - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_morphology_radii() {
        assert_eq!(FilterKind::Erosion3x3.params().radius, 1);
        assert_eq!(FilterKind::Erosion7x7.params().radius, 3);
        assert_eq!(FilterKind::Dilation13x13.params().radius, 6);
        assert_eq!(FilterKind::Dilation3x3.params().mode, FILTER_MODE_DILATION);
    }
}
