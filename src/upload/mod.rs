// Double-buffered texture upload
// Decouples the CPU-side pixel copy from the GPU-side texture update
//
// Two staging buffers alternate: each call encodes the GPU copy from the
// buffer filled on the previous call, then stages the new picture into
// the other buffer. The render thread never waits on a pixel transfer.

use crate::frame::{PixelFormat, VideoPicture};
use crate::render::RenderContext;

/// Destination texture format for a decoded pixel layout. 24-bit frames
/// are expanded to RGBA while staging; GPUs have no packed 24-bit format.
fn texture_format(format: PixelFormat) -> wgpu::TextureFormat {
    match format {
        PixelFormat::Rgb24 | PixelFormat::Rgba32 => wgpu::TextureFormat::Rgba8Unorm,
        PixelFormat::Bgra32 => wgpu::TextureFormat::Bgra8Unorm,
    }
}

/// Bytes per row in the staging buffer, padded to the copy alignment.
fn padded_bytes_per_row(width: u32) -> u32 {
    let unpadded = width * 4;
    let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
    unpadded.div_ceil(align) * align
}

/// Uploads decoded pictures into a live texture through two alternating
/// staging buffers.
pub struct TextureUploader {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    staging: [wgpu::Buffer; 2],
    /// Buffer to stage the next picture into.
    back: usize,
    /// Whether the front buffer holds bytes not yet copied to the texture.
    front_staged: bool,
    width: u32,
    height: u32,
    format: PixelFormat,
    bytes_per_row: u32,
    /// Skip the staging path entirely and write the texture directly.
    direct: bool,
    scratch: Vec<u8>,
    generation: u64,
}

impl TextureUploader {
    /// Allocate texture and transfer buffers for the picture's geometry.
    pub fn new(ctx: &RenderContext, picture: &VideoPicture) -> Self {
        let texture = Self::make_texture(ctx, 1, 1, PixelFormat::Rgba32);
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let mut uploader = Self {
            texture,
            view,
            staging: [
                Self::make_staging(ctx, 4),
                Self::make_staging(ctx, 4),
            ],
            back: 0,
            front_staged: false,
            width: 0,
            height: 0,
            format: PixelFormat::Rgba32,
            bytes_per_row: 0,
            direct: false,
            scratch: Vec::new(),
            generation: 0,
        };
        uploader.set_format(ctx, picture);
        uploader
    }

    /// Switch to direct synchronous uploads (no staging buffers). Slower
    /// but always available.
    pub fn set_direct(&mut self, direct: bool) {
        self.direct = direct;
        self.front_staged = false;
    }

    /// (Re)allocate the texture and both staging buffers for a new frame
    /// geometry. Called lazily by `upload` whenever the producer switches
    /// resolution or pixel format mid-stream.
    pub fn set_format(&mut self, ctx: &RenderContext, picture: &VideoPicture) {
        if self.width == picture.width()
            && self.height == picture.height()
            && self.format == picture.format()
        {
            return;
        }

        self.width = picture.width();
        self.height = picture.height();
        self.format = picture.format();
        self.bytes_per_row = padded_bytes_per_row(self.width);
        self.front_staged = false;
        self.generation += 1;

        self.texture = Self::make_texture(ctx, self.width, self.height, self.format);
        self.view = self
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());

        let buffer_size = self.bytes_per_row as u64 * self.height as u64;
        self.staging = [
            Self::make_staging(ctx, buffer_size),
            Self::make_staging(ctx, buffer_size),
        ];
        self.scratch.clear();
        self.scratch.resize(buffer_size as usize, 0);

        log::debug!(
            "uploader reset: {}x{} {:?}, {} bytes per padded row",
            self.width,
            self.height,
            self.format,
            self.bytes_per_row
        );
    }

    /// Transfer the queued staging buffer into the live texture and stage
    /// the new picture for the next cycle.
    pub fn upload(&mut self, ctx: &RenderContext, picture: &VideoPicture) {
        self.set_format(ctx, picture);

        if self.direct {
            self.write_direct(ctx, picture);
            return;
        }

        if self.front_staged {
            // GPU-side copy from the buffer staged last call
            let front = 1 - self.back;
            let mut encoder =
                ctx.device()
                    .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                        label: Some("Frame Upload Encoder"),
                    });
            encoder.copy_buffer_to_texture(
                wgpu::TexelCopyBufferInfo {
                    buffer: &self.staging[front],
                    layout: wgpu::TexelCopyBufferLayout {
                        offset: 0,
                        bytes_per_row: Some(self.bytes_per_row),
                        rows_per_image: None,
                    },
                },
                wgpu::TexelCopyTextureInfo {
                    texture: &self.texture,
                    mip_level: 0,
                    origin: wgpu::Origin3d::ZERO,
                    aspect: wgpu::TextureAspect::All,
                },
                wgpu::Extent3d {
                    width: self.width,
                    height: self.height,
                    depth_or_array_layers: 1,
                },
            );
            ctx.queue().submit(std::iter::once(encoder.finish()));
        } else {
            // Nothing staged yet (first frame after a format change):
            // upload directly so the texture is valid this tick
            self.write_direct(ctx, picture);
        }

        // CPU-side copy of the new picture into the back buffer
        self.stage_into_scratch(picture);
        ctx.queue()
            .write_buffer(&self.staging[self.back], 0, &self.scratch);
        self.front_staged = true;
        self.back = 1 - self.back;
    }

    fn write_direct(&self, ctx: &RenderContext, picture: &VideoPicture) {
        let data;
        let bytes_per_row;
        let converted;
        if picture.format() == PixelFormat::Rgb24 {
            converted = expand_rgb24(picture.data(), self.width, self.height, self.width * 4);
            data = converted.as_slice();
            bytes_per_row = self.width * 4;
        } else {
            data = picture.data();
            bytes_per_row = self.width * 4;
        }
        ctx.queue().write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &self.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            data,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(bytes_per_row),
                rows_per_image: None,
            },
            wgpu::Extent3d {
                width: self.width,
                height: self.height,
                depth_or_array_layers: 1,
            },
        );
    }

    /// Copy picture rows into the row-padded scratch layout, expanding
    /// 24-bit data on the way.
    fn stage_into_scratch(&mut self, picture: &VideoPicture) {
        let src = picture.data();
        let pitch = self.bytes_per_row as usize;
        match picture.format() {
            PixelFormat::Rgb24 => {
                let expanded =
                    expand_rgb24(src, self.width, self.height, self.bytes_per_row);
                self.scratch.copy_from_slice(&expanded);
            }
            PixelFormat::Rgba32 | PixelFormat::Bgra32 => {
                let row_bytes = self.width as usize * 4;
                for y in 0..self.height as usize {
                    let s = &src[y * row_bytes..(y + 1) * row_bytes];
                    self.scratch[y * pitch..y * pitch + row_bytes].copy_from_slice(s);
                }
            }
        }
    }

    pub fn view(&self) -> &wgpu::TextureView {
        &self.view
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Bumped whenever the texture is reallocated; bind groups built on an
    /// older generation must be rebuilt.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn make_texture(
        ctx: &RenderContext,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> wgpu::Texture {
        ctx.device().create_texture(&wgpu::TextureDescriptor {
            label: Some("Source Frame Texture"),
            size: wgpu::Extent3d {
                width: width.max(1),
                height: height.max(1),
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: texture_format(format),
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        })
    }

    fn make_staging(ctx: &RenderContext, size: u64) -> wgpu::Buffer {
        ctx.device().create_buffer(&wgpu::BufferDescriptor {
            label: Some("Frame Staging Buffer"),
            size,
            usage: wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        })
    }
}

/// Expand packed RGB rows to row-padded RGBA with opaque alpha.
fn expand_rgb24(src: &[u8], width: u32, height: u32, dst_pitch: u32) -> Vec<u8> {
    let mut out = vec![0u8; dst_pitch as usize * height as usize];
    let src_row = width as usize * 3;
    for y in 0..height as usize {
        let s = &src[y * src_row..(y + 1) * src_row];
        let d = &mut out[y * dst_pitch as usize..];
        for x in 0..width as usize {
            d[x * 4] = s[x * 3];
            d[x * 4 + 1] = s[x * 3 + 1];
            d[x * 4 + 2] = s[x * 3 + 2];
            d[x * 4 + 3] = 255;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_padding_is_aligned() {
        for width in [1u32, 64, 100, 640, 1279, 1920] {
            let padded = padded_bytes_per_row(width);
            assert_eq!(padded % wgpu::COPY_BYTES_PER_ROW_ALIGNMENT, 0);
            assert!(padded >= width * 4);
            assert!(padded < width * 4 + wgpu::COPY_BYTES_PER_ROW_ALIGNMENT);
        }
    }

    #[test]
    fn test_expand_rgb24() {
        // 2x2 RGB frame into a 256-byte pitch
        let src = [
            1, 2, 3, 4, 5, 6, //
            7, 8, 9, 10, 11, 12,
        ];
        let out = expand_rgb24(&src, 2, 2, 256);
        assert_eq!(&out[0..8], &[1, 2, 3, 255, 4, 5, 6, 255]);
        assert_eq!(&out[256..264], &[7, 8, 9, 255, 10, 11, 12, 255]);
        assert_eq!(out.len(), 512);
    }

    #[test]
    fn test_texture_format_mapping() {
        assert_eq!(
            texture_format(PixelFormat::Rgb24),
            wgpu::TextureFormat::Rgba8Unorm
        );
        assert_eq!(
            texture_format(PixelFormat::Bgra32),
            wgpu::TextureFormat::Bgra8Unorm
        );
    }
}
