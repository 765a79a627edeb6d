// Streaming source
// Generic producer-thread source: a grabber runs on its own thread and
// publishes frames through the single-slot mailbox; the render thread
// consumes at most one per tick and uploads it.
//
// Video files, cameras and procedural generators all share this shape;
// only the grabber differs.

use super::{Source, SourceCore, SourceError, SourceId, SourceInput, SourceKind};
use crate::events::{EventHub, MixerEvent};
use crate::frame::{FrameMailbox, PictureAction, VideoPicture};
use crate::memory::PicturePool;
use crate::plugin::EffectChain;
use crate::render::RenderContext;
use crate::upload::TextureUploader;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Shared control block between a source and its producer thread.
pub struct GrabberControl {
    stop: AtomicBool,
    playing: AtomicBool,
}

impl GrabberControl {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            stop: AtomicBool::new(false),
            playing: AtomicBool::new(true),
        })
    }

    pub fn should_stop(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }
}

/// A frame producer. Implementations run on a dedicated thread owned by
/// the source and may block in `grab`; they must never touch the GPU.
pub trait FrameGrabber: Send {
    /// Produce the next frame, allocating from the shared pool.
    fn grab(&mut self, pool: &Arc<PicturePool>) -> Result<VideoPicture, SourceError>;

    /// Nominal delay between frames, used to pace the producer loop.
    fn frame_period(&self) -> Duration;

    /// `true`: an unconsumed frame is replaced (cameras always show the
    /// newest). `false`: the producer waits for the consumer (video
    /// files get natural backpressure).
    fn latest_wins(&self) -> bool {
        true
    }

    /// Whether the stream has a timeline that can be paused.
    fn playable(&self) -> bool {
        true
    }

    fn describe(&self) -> String;
}

/// Source fed by a [`FrameGrabber`] on its own thread.
pub struct StreamSource {
    core: SourceCore,
    kind: SourceKind,
    pool: Arc<PicturePool>,
    mailbox: Arc<FrameMailbox>,
    uploader: Option<TextureUploader>,
    producer: Option<JoinHandle<()>>,
    control: Arc<GrabberControl>,
    failure: Arc<Mutex<Option<String>>>,
    playable: bool,
    frame_size: (u32, u32),
    description: String,
    type_config: crate::config::SourceTypeConfig,
    seen_drops: u64,
}

impl StreamSource {
    /// Create the source and start its producer thread.
    pub fn spawn(
        id: SourceId,
        depth: f64,
        effect_size: (u32, u32),
        pool: Arc<PicturePool>,
        mut grabber: Box<dyn FrameGrabber>,
    ) -> Self {
        let mailbox = FrameMailbox::new();
        let control = GrabberControl::new();
        let failure = Arc::new(Mutex::new(None));
        let playable = grabber.playable();
        let description = grabber.describe();

        let producer = {
            let mailbox = Arc::clone(&mailbox);
            let control = Arc::clone(&control);
            let failure = Arc::clone(&failure);
            let pool = Arc::clone(&pool);
            std::thread::Builder::new()
                .name(format!("producer-{}", id.0))
                .spawn(move || {
                    producer_loop(&mut *grabber, &pool, &mailbox, &control, &failure)
                })
                .expect("spawn producer thread")
        };

        log::info!("stream source {} started: {}", id, description);

        let mut core = SourceCore::new(id, depth, effect_size.0, effect_size.1);
        core.name = description.clone();

        Self {
            core,
            kind: SourceKind::Stream,
            pool,
            mailbox,
            uploader: None,
            producer: Some(producer),
            control,
            failure,
            playable,
            frame_size: (0, 0),
            type_config: crate::config::SourceTypeConfig::Stream { description: description.clone() },
            description,
            seen_drops: 0,
        }
    }

    pub(super) fn with_kind(mut self, kind: SourceKind) -> Self {
        self.kind = kind;
        self
    }

    pub(super) fn with_type_config(mut self, config: crate::config::SourceTypeConfig) -> Self {
        self.type_config = config;
        self
    }

    pub fn pool(&self) -> &Arc<PicturePool> {
        &self.pool
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    fn consume_pending(&mut self, ctx: &RenderContext, events: &EventHub) {
        let Some(picture) = self.mailbox.take() else {
            // Nothing ready: keep displaying the last texture
            return;
        };

        match picture.action() {
            PictureAction::Stop => {
                self.core.set_playing(false);
                log::debug!("source {} reached end of stream", self.core.id());
            }
            PictureAction::ResetPts => self.core.reset_clock(),
            PictureAction::Delete => return,
            PictureAction::None => {}
        }

        match &mut self.uploader {
            Some(uploader) => uploader.upload(ctx, &picture),
            None => {
                let mut uploader = TextureUploader::new(ctx, &picture);
                uploader.upload(ctx, &picture);
                self.uploader = Some(uploader);
            }
        }
        self.frame_size = (picture.width(), picture.height());
        self.core.aspect_ratio = picture.width() as f64 / picture.height().max(1) as f64;

        if self.core.state() == super::PlayState::Uninitialized {
            self.core.mark_ready();
            self.core.set_playing(true);
        }
        events.emit(MixerEvent::SourceUpdated(self.core.id()));
    }
}

impl Source for StreamSource {
    fn core(&self) -> &SourceCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut SourceCore {
        &mut self.core
    }

    fn kind(&self) -> SourceKind {
        self.kind
    }

    fn update(&mut self, ctx: &RenderContext, dt: f64, events: &EventHub) {
        self.core.advance_clock(dt);

        // A failed producer drops the source out of Playing; the last
        // valid texture remains on screen
        if let Some(reason) = self.failure.lock().take() {
            log::warn!("source {} producer failed: {}", self.core.id(), reason);
            self.core.set_playing(false);
            events.emit(MixerEvent::ProducerFailed {
                source: self.core.id(),
                reason,
            });
        }

        let drops = self.mailbox.dropped_count();
        if drops > self.seen_drops {
            self.seen_drops = drops;
            events.emit(MixerEvent::FrameDropped(self.core.id()));
        }

        self.consume_pending(ctx, events);
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

    fn is_playable(&self) -> bool {
        self.playable
    }

    fn play(&mut self, on: bool) {
        self.core.set_playing(on);
        self.control.playing.store(on, Ordering::SeqCst);
    }

    fn type_config(&self) -> crate::config::SourceTypeConfig {
        self.type_config.clone()
    }
}

impl Drop for StreamSource {
    fn drop(&mut self) {
        // Cooperative shutdown: flag, wake, join; only then may the GPU
        // resources go away
        self.control.stop.store(true, Ordering::SeqCst);
        self.mailbox.close();
        if let Some(producer) = self.producer.take() {
            if producer.join().is_err() {
                log::error!("source {} producer thread panicked", self.core.id());
            }
        }
    }
}

fn producer_loop(
    grabber: &mut dyn FrameGrabber,
    pool: &Arc<PicturePool>,
    mailbox: &Arc<FrameMailbox>,
    control: &Arc<GrabberControl>,
    failure: &Arc<Mutex<Option<String>>>,
) {
    let period = grabber.frame_period();
    let mut last_frame = Instant::now();

    while !control.should_stop() {
        if !control.is_playing() {
            std::thread::sleep(Duration::from_millis(10));
            last_frame = Instant::now();
            continue;
        }

        let picture = match grabber.grab(pool) {
            Ok(p) => p,
            Err(e) => {
                *failure.lock() = Some(e.to_string());
                break;
            }
        };

        let delivered = if grabber.latest_wins() {
            match mailbox.offer(picture) {
                Ok(displaced) => {
                    if displaced.is_some() {
                        log::trace!("producer displaced an unconsumed frame");
                    }
                    true
                }
                Err(_) => false,
            }
        } else {
            mailbox.put(picture).is_ok()
        };
        if !delivered {
            break;
        }

        // Frame pacing, as in any capture loop
        let elapsed = last_frame.elapsed();
        if elapsed < period {
            std::thread::sleep(period - elapsed);
        }
        last_frame = Instant::now();
    }
    log::debug!("producer thread exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PixelFormat;

    struct CountingGrabber {
        frames: u32,
        fail_after: Option<u32>,
    }

    impl FrameGrabber for CountingGrabber {
        fn grab(&mut self, pool: &Arc<PicturePool>) -> Result<VideoPicture, SourceError> {
            if let Some(limit) = self.fail_after {
                if self.frames >= limit {
                    return Err(SourceError::ProducerError("device unplugged".into()));
                }
            }
            self.frames += 1;
            let mut p = VideoPicture::new(pool, 8, 8, PixelFormat::Rgba32);
            p.set_pts(self.frames as f64 / 30.0);
            Ok(p)
        }

        fn frame_period(&self) -> Duration {
            Duration::from_millis(1)
        }

        fn describe(&self) -> String {
            "counting".to_string()
        }
    }

    #[test]
    fn test_producer_publishes_frames() {
        let pool = PicturePool::new();
        let source = StreamSource::spawn(
            SourceId(1),
            1.0,
            (64, 64),
            pool,
            Box::new(CountingGrabber {
                frames: 0,
                fail_after: None,
            }),
        );
        // Producer fills the mailbox without any consumer involvement
        let deadline = Instant::now() + Duration::from_secs(2);
        while !source.mailbox.has_pending() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(source.mailbox.has_pending());
    }

    #[test]
    fn test_drop_joins_producer() {
        let pool = PicturePool::new();
        let source = StreamSource::spawn(
            SourceId(2),
            1.0,
            (64, 64),
            Arc::clone(&pool),
            Box::new(CountingGrabber {
                frames: 0,
                fail_after: None,
            }),
        );
        std::thread::sleep(Duration::from_millis(20));
        drop(source);
        // All pictures returned to the pool once the producer is joined
        assert_eq!(pool.map_count(), 0);
    }

    #[test]
    fn test_producer_failure_is_reported() {
        let pool = PicturePool::new();
        let source = StreamSource::spawn(
            SourceId(3),
            1.0,
            (64, 64),
            pool,
            Box::new(CountingGrabber {
                frames: 0,
                fail_after: Some(0),
            }),
        );
        let deadline = Instant::now() + Duration::from_secs(2);
        while source.failure.lock().is_none() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(source.failure.lock().as_deref() == Some("Source producer failed: device unplugged"));
    }
}
