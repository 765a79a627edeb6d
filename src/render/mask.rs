// Source masks
// Procedurally generated alpha textures multiplied into a source's alpha

use super::RenderContext;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Resolution of generated mask textures. Masks are smooth gradients, so a
/// modest square texture upsampled linearly is indistinguishable from a
/// full-resolution one.
pub const MASK_SIZE: u32 = 256;

/// Shape of the alpha mask applied to a source.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MaskKind {
    #[default]
    None,
    RoundCorner,
    Circle,
    GradientCircle,
    GradientSquare,
    GradientLeft,
    GradientRight,
    GradientTop,
    GradientBottom,
    /// Grayscale image loaded from a file; the red channel is the alpha.
    Custom(PathBuf),
}

impl MaskKind {
    /// Stable index used in configuration files of older sessions.
    pub fn index(&self) -> u32 {
        match self {
            MaskKind::None => 0,
            MaskKind::RoundCorner => 1,
            MaskKind::Circle => 2,
            MaskKind::GradientCircle => 3,
            MaskKind::GradientSquare => 4,
            MaskKind::GradientLeft => 5,
            MaskKind::GradientRight => 6,
            MaskKind::GradientTop => 7,
            MaskKind::GradientBottom => 8,
            MaskKind::Custom(_) => 9,
        }
    }

    /// Generate the mask's alpha plane, one byte per texel, row-major
    /// `MASK_SIZE`×`MASK_SIZE`. `None` yields a fully opaque plane.
    pub fn generate(&self) -> Vec<u8> {
        let n = MASK_SIZE as usize;
        let mut data = vec![255u8; n * n];

        match self {
            MaskKind::None => {}
            MaskKind::Custom(path) => match image::open(path) {
                Ok(img) => {
                    let img = img
                        .resize_exact(
                            MASK_SIZE,
                            MASK_SIZE,
                            image::imageops::FilterType::Triangle,
                        )
                        .to_luma8();
                    data.copy_from_slice(img.as_raw());
                }
                Err(e) => {
                    // Degrade to no mask rather than failing the source
                    log::warn!("Custom mask {:?} could not be read: {}", path, e);
                }
            },
            _ => {
                for y in 0..n {
                    for x in 0..n {
                        // Normalized coordinates centered on the texture
                        let u = (x as f32 + 0.5) / n as f32;
                        let v = (y as f32 + 0.5) / n as f32;
                        let cx = u * 2.0 - 1.0;
                        let cy = v * 2.0 - 1.0;
                        data[y * n + x] = (self.sample(u, v, cx, cy) * 255.0) as u8;
                    }
                }
            }
        }
        data
    }

    fn sample(&self, u: f32, v: f32, cx: f32, cy: f32) -> f32 {
        let r = (cx * cx + cy * cy).sqrt();
        match self {
            MaskKind::RoundCorner => {
                // Opaque inner square, quarter-disc falloff in the corners
                let ex = (cx.abs() - 0.8).max(0.0) / 0.2;
                let ey = (cy.abs() - 0.8).max(0.0) / 0.2;
                let d = (ex * ex + ey * ey).sqrt();
                (1.0 - (d - 1.0).clamp(0.0, 1.0) * 8.0).clamp(0.0, 1.0)
            }
            MaskKind::Circle => {
                if r <= 1.0 {
                    1.0
                } else {
                    0.0
                }
            }
            MaskKind::GradientCircle => (1.0 - r).clamp(0.0, 1.0),
            MaskKind::GradientSquare => {
                (1.0 - cx.abs().max(cy.abs())).clamp(0.0, 1.0)
            }
            MaskKind::GradientLeft => 1.0 - u,
            MaskKind::GradientRight => u,
            MaskKind::GradientTop => 1.0 - v,
            MaskKind::GradientBottom => v,
            MaskKind::None | MaskKind::Custom(_) => 1.0,
        }
    }

    /// Upload the generated mask into an `R8Unorm` texture.
    pub fn create_texture(&self, ctx: &RenderContext) -> wgpu::TextureView {
        let data = self.generate();
        let texture = ctx.device().create_texture(&wgpu::TextureDescriptor {
            label: Some("Mask Texture"),
            size: wgpu::Extent3d {
                width: MASK_SIZE,
                height: MASK_SIZE,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::R8Unorm,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        ctx.queue().write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            &data,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(MASK_SIZE),
                rows_per_image: None,
            },
            wgpu::Extent3d {
                width: MASK_SIZE,
                height: MASK_SIZE,
                depth_or_array_layers: 1,
            },
        );
        texture.create_view(&wgpu::TextureViewDescriptor::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(data: &[u8], x: u32, y: u32) -> u8 {
        data[(y * MASK_SIZE + x) as usize]
    }

    #[test]
    fn test_none_is_opaque() {
        let data = MaskKind::None.generate();
        assert!(data.iter().all(|b| *b == 255));
    }

    #[test]
    fn test_circle_center_opaque_corner_clear() {
        let data = MaskKind::Circle.generate();
        let mid = MASK_SIZE / 2;
        assert_eq!(at(&data, mid, mid), 255);
        assert_eq!(at(&data, 0, 0), 0);
        assert_eq!(at(&data, MASK_SIZE - 1, MASK_SIZE - 1), 0);
    }

    #[test]
    fn test_gradient_left_decreases() {
        let data = MaskKind::GradientLeft.generate();
        let mid = MASK_SIZE / 2;
        assert!(at(&data, 0, mid) > at(&data, mid, mid));
        assert!(at(&data, mid, mid) > at(&data, MASK_SIZE - 1, mid));
    }

    #[test]
    fn test_gradient_circle_monotonic_in_radius() {
        let data = MaskKind::GradientCircle.generate();
        let mid = MASK_SIZE / 2;
        let mut previous = 255u8;
        for x in (mid..MASK_SIZE).step_by(16) {
            let v = at(&data, x, mid);
            assert!(v <= previous);
            previous = v;
        }
    }

    #[test]
    fn test_missing_custom_mask_degrades_to_opaque() {
        let data = MaskKind::Custom(PathBuf::from("/nonexistent/mask.png")).generate();
        assert!(data.iter().all(|b| *b == 255));
    }
}
