// Still-image source
// One decoded image, uploaded once; no producer thread, no timeline

use super::{Source, SourceCore, SourceError, SourceId, SourceInput, SourceKind};
use crate::events::{EventHub, MixerEvent};
use crate::frame::{PixelFormat, VideoPicture};
use crate::memory::PicturePool;
use crate::plugin::EffectChain;
use crate::render::RenderContext;
use crate::upload::TextureUploader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub struct ImageSource {
    core: SourceCore,
    path: PathBuf,
    /// Decoded pixels, waiting for the first render-thread update.
    pending: Option<VideoPicture>,
    uploader: Option<TextureUploader>,
    frame_size: (u32, u32),
}

impl ImageSource {
    /// Decode the image on the calling thread; the GPU upload happens on
    /// the first `update`.
    pub fn load(
        id: SourceId,
        depth: f64,
        effect_size: (u32, u32),
        pool: &Arc<PicturePool>,
        path: &Path,
    ) -> Result<Self, SourceError> {
        let decoded = image::open(path)
            .map_err(|e| SourceError::CreateError(format!("{}: {}", path.display(), e)))?
            .to_rgba8();
        let (width, height) = decoded.dimensions();

        let mut picture = VideoPicture::new(pool, width, height, PixelFormat::Rgba32);
        picture
            .fill(0.0, decoded.as_raw())
            .map_err(|e| SourceError::CreateError(e.to_string()))?;

        log::info!("image source {}: {} ({}x{})", id, path.display(), width, height);

        let mut core = SourceCore::new(id, depth, effect_size.0, effect_size.1);
        core.name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("image{}", id.0));
        core.aspect_ratio = width as f64 / height.max(1) as f64;

        Ok(Self {
            core,
            path: path.to_path_buf(),
            pending: Some(picture),
            uploader: None,
            frame_size: (width, height),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Source for ImageSource {
    fn core(&self) -> &SourceCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut SourceCore {
        &mut self.core
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Image
    }

    fn update(&mut self, ctx: &RenderContext, dt: f64, events: &EventHub) {
        self.core.advance_clock(dt);
        if let Some(picture) = self.pending.take() {
            let mut uploader = TextureUploader::new(ctx, &picture);
            // One frame ever: the staging double buffer buys nothing here
            uploader.set_direct(true);
            uploader.upload(ctx, &picture);
            self.uploader = Some(uploader);
            self.core.mark_ready();
            events.emit(MixerEvent::SourceUpdated(self.core.id()));
        }
    }

    fn raw_input(&self) -> SourceInput<'_> {
        match &self.uploader {
            Some(uploader) => SourceInput::Own(uploader.view()),
            None => SourceInput::Pending,
        }
    }

    fn effects_and_input(&mut self) -> (&mut EffectChain, SourceInput<'_>) {
        let input = match &self.uploader {
            Some(uploader) => SourceInput::Own(uploader.view()),
            None => SourceInput::Pending,
        };
        (&mut self.core.effects, input)
    }

    fn frame_size(&self) -> (u32, u32) {
        self.frame_size
    }

    fn type_config(&self) -> crate::config::SourceTypeConfig {
        crate::config::SourceTypeConfig::Image {
            path: self.path.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_is_create_error() {
        let pool = PicturePool::new();
        let result = ImageSource::load(
            SourceId(1),
            1.0,
            (64, 64),
            &pool,
            Path::new("/nonexistent/picture.png"),
        );
        assert!(matches!(result, Err(SourceError::CreateError(_))));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("red.png");
        let img = image::RgbaImage::from_pixel(6, 4, image::Rgba([255, 0, 0, 255]));
        img.save(&path).unwrap();

        let pool = PicturePool::new();
        let source = ImageSource::load(SourceId(2), 1.0, (64, 64), &pool, &path).unwrap();
        assert_eq!(source.frame_size(), (6, 4));
        assert!((source.core().aspect_ratio - 1.5).abs() < 1e-9);
        let pending = source.pending.as_ref().unwrap();
        assert_eq!(&pending.data()[0..4], &[255, 0, 0, 255]);
    }
}
