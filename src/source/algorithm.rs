// Procedural sources
// Frame generators running on the standard producer thread: useful as
// test patterns and as cheap animated content with no decoder behind it

use super::{FrameGrabber, SourceError, SourceId, SourceKind, StreamSource};
use crate::frame::{PixelFormat, VideoPicture};
use crate::memory::PicturePool;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// What the generator draws.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AlgorithmKind {
    /// White uniform noise, reseeded every frame.
    Noise,
    /// Horizontal grayscale ramp scrolling over time.
    Gradient,
    /// Black and white checkerboard, phase alternating over time.
    Checkerboard,
    /// Solid black frames (placeholder content).
    Flat,
}

/// Generator of procedural frames.
pub struct AlgorithmGrabber {
    kind: AlgorithmKind,
    width: u32,
    height: u32,
    period: Duration,
    frame_index: u64,
    rng_state: u64,
}

impl AlgorithmGrabber {
    pub fn new(kind: AlgorithmKind, width: u32, height: u32, fps: u32) -> Self {
        Self {
            kind,
            width: width.max(1),
            height: height.max(1),
            period: Duration::from_micros(1_000_000 / fps.max(1) as u64),
            frame_index: 0,
            rng_state: 0x9E37_79B9_7F4A_7C15,
        }
    }

    // xorshift*: plenty for visual noise
    fn next_rand(&mut self) -> u64 {
        let mut x = self.rng_state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.rng_state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    fn render(&mut self, data: &mut [u8]) {
        let (w, h) = (self.width as usize, self.height as usize);
        let t = self.frame_index;
        match self.kind {
            AlgorithmKind::Noise => {
                let mut i = 0;
                while i + 8 <= data.len() {
                    let r = self.next_rand().to_ne_bytes();
                    data[i..i + 8].copy_from_slice(&r);
                    i += 8;
                }
                // Force opaque alpha
                for px in data.chunks_exact_mut(4) {
                    px[3] = 255;
                }
            }
            AlgorithmKind::Gradient => {
                for y in 0..h {
                    for x in 0..w {
                        let v = (((x + t as usize) % w) * 255 / w) as u8;
                        let o = (y * w + x) * 4;
                        data[o] = v;
                        data[o + 1] = v;
                        data[o + 2] = v;
                        data[o + 3] = 255;
                    }
                }
            }
            AlgorithmKind::Checkerboard => {
                let cell = (w / 8).max(1);
                let phase = (t as usize / 15) % 2;
                for y in 0..h {
                    for x in 0..w {
                        let on = ((x / cell + y / cell) % 2) == phase;
                        let v = if on { 255 } else { 0 };
                        let o = (y * w + x) * 4;
                        data[o] = v;
                        data[o + 1] = v;
                        data[o + 2] = v;
                        data[o + 3] = 255;
                    }
                }
            }
            AlgorithmKind::Flat => {
                for px in data.chunks_exact_mut(4) {
                    px[0] = 0;
                    px[1] = 0;
                    px[2] = 0;
                    px[3] = 255;
                }
            }
        }
    }
}

impl FrameGrabber for AlgorithmGrabber {
    fn grab(&mut self, pool: &Arc<PicturePool>) -> Result<VideoPicture, SourceError> {
        let mut picture = VideoPicture::new(pool, self.width, self.height, PixelFormat::Rgba32);
        picture.set_pts(self.frame_index as f64 * self.period.as_secs_f64());
        self.render(picture.data_mut());
        self.frame_index += 1;
        Ok(picture)
    }

    fn frame_period(&self) -> Duration {
        self.period
    }

    fn describe(&self) -> String {
        format!("{:?} {}x{}", self.kind, self.width, self.height)
    }
}

/// Procedural source: an [`AlgorithmGrabber`] behind the standard
/// producer-thread source.
pub struct AlgorithmSource;

impl AlgorithmSource {
    pub fn spawn(
        id: SourceId,
        depth: f64,
        effect_size: (u32, u32),
        pool: Arc<PicturePool>,
        kind: AlgorithmKind,
        width: u32,
        height: u32,
        fps: u32,
    ) -> StreamSource {
        let grabber = AlgorithmGrabber::new(kind, width, height, fps);
        StreamSource::spawn(id, depth, effect_size, pool, Box::new(grabber))
            .with_kind(SourceKind::Algorithm)
            .with_type_config(crate::config::SourceTypeConfig::Algorithm {
                kind,
                width,
                height,
                fps,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frames_are_opaque() {
        let pool = PicturePool::new();
        for kind in [
            AlgorithmKind::Noise,
            AlgorithmKind::Gradient,
            AlgorithmKind::Checkerboard,
            AlgorithmKind::Flat,
        ] {
            let mut grabber = AlgorithmGrabber::new(kind, 16, 16, 30);
            let picture = grabber.grab(&pool).unwrap();
            assert_eq!(picture.byte_len(), 16 * 16 * 4);
            assert!(
                picture.data().chunks_exact(4).all(|px| px[3] == 255),
                "{:?} has opaque alpha",
                kind
            );
        }
    }

    #[test]
    fn test_noise_varies_between_frames() {
        let pool = PicturePool::new();
        let mut grabber = AlgorithmGrabber::new(AlgorithmKind::Noise, 16, 16, 30);
        let a = grabber.grab(&pool).unwrap().data().to_vec();
        let b = grabber.grab(&pool).unwrap().data().to_vec();
        assert_ne!(a, b);
    }

    #[test]
    fn test_pts_follows_frame_period() {
        let pool = PicturePool::new();
        let mut grabber = AlgorithmGrabber::new(AlgorithmKind::Flat, 4, 4, 25);
        assert_eq!(grabber.grab(&pool).unwrap().pts(), 0.0);
        let second = grabber.grab(&pool).unwrap();
        assert!((second.pts() - 0.04).abs() < 1e-9);
    }
}
