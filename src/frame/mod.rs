// Decoded video frames and the producer/consumer handoff
//
// Producers (decoders, capture devices, generators) run on their own
// threads and publish frames through a single-slot mailbox; the render
// thread takes at most one frame per tick and never blocks.

use crate::memory::{PageHandle, PicturePool};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Frame mailbox is closed")]
    MailboxClosed,
    #[error("Picture buffer is {0} bytes, expected {1}")]
    BufferSize(usize, usize),
}

/// Pixel layout of a decoded frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PixelFormat {
    Rgb24,
    Rgba32,
    Bgra32,
}

impl PixelFormat {
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Rgb24 => 3,
            PixelFormat::Rgba32 | PixelFormat::Bgra32 => 4,
        }
    }

    pub fn has_alpha(&self) -> bool {
        !matches!(self, PixelFormat::Rgb24)
    }
}

/// Control action a producer attaches to a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PictureAction {
    /// Plain frame, display it.
    #[default]
    None,
    /// Last frame of the stream; the source should leave `Playing`.
    Stop,
    /// Restart the presentation clock at this frame's timestamp.
    ResetPts,
    /// Recycle without displaying.
    Delete,
}

/// One decoded frame, backed by a pooled page.
///
/// Created by a producer, consumed exactly once by the render thread,
/// then released back to its picture map on drop.
pub struct VideoPicture {
    pts: f64,
    width: u32,
    height: u32,
    format: PixelFormat,
    action: PictureAction,
    page: PageHandle,
}

impl VideoPicture {
    /// Allocate a picture of the given geometry from the pool.
    pub fn new(
        pool: &Arc<PicturePool>,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Self {
        let page_size = width as usize * height as usize * format.bytes_per_pixel();
        Self {
            pts: 0.0,
            width,
            height,
            format,
            action: PictureAction::None,
            page: pool.acquire(page_size),
        }
    }

    /// Fill the picture from already-decoded bytes.
    pub fn fill(&mut self, pts: f64, data: &[u8]) -> Result<(), FrameError> {
        let expected = self.byte_len();
        if data.len() != expected {
            return Err(FrameError::BufferSize(data.len(), expected));
        }
        self.pts = pts;
        self.page.as_mut_slice().copy_from_slice(data);
        Ok(())
    }

    pub fn set_pts(&mut self, pts: f64) {
        self.pts = pts;
    }

    pub fn set_action(&mut self, action: PictureAction) {
        self.action = action;
    }

    pub fn pts(&self) -> f64 {
        self.pts
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn action(&self) -> PictureAction {
        self.action
    }

    pub fn byte_len(&self) -> usize {
        self.width as usize * self.height as usize * self.format.bytes_per_pixel()
    }

    pub fn data(&self) -> &[u8] {
        self.page.as_slice()
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        self.page.as_mut_slice()
    }
}

struct MailboxSlot {
    pending: Option<VideoPicture>,
    closed: bool,
}

/// Single-slot, latest-wins frame handoff between one producer thread and
/// the render thread.
///
/// At most one pending picture exists at any instant. `offer` replaces an
/// unconsumed picture (cameras: always show the newest), `put` waits for
/// the slot to drain (video files: natural backpressure). Neither path
/// ever blocks the consumer.
pub struct FrameMailbox {
    slot: Mutex<MailboxSlot>,
    drained: Condvar,
    dropped: std::sync::atomic::AtomicU64,
}

impl FrameMailbox {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            slot: Mutex::new(MailboxSlot {
                pending: None,
                closed: false,
            }),
            drained: Condvar::new(),
            dropped: std::sync::atomic::AtomicU64::new(0),
        })
    }

    /// Publish a frame, replacing any unconsumed one. Returns the picture
    /// that was displaced so the producer can recycle it.
    pub fn offer(&self, picture: VideoPicture) -> Result<Option<VideoPicture>, FrameError> {
        let mut slot = self.slot.lock();
        if slot.closed {
            return Err(FrameError::MailboxClosed);
        }
        let displaced = slot.pending.replace(picture);
        if displaced.is_some() {
            self.dropped
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
        Ok(displaced)
    }

    /// Frames displaced before the consumer ever saw them.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Publish a frame, waiting until the consumer has taken the previous
    /// one. Wakes up early when the mailbox is closed.
    pub fn put(&self, picture: VideoPicture) -> Result<(), FrameError> {
        let mut slot = self.slot.lock();
        while slot.pending.is_some() && !slot.closed {
            self.drained.wait(&mut slot);
        }
        if slot.closed {
            return Err(FrameError::MailboxClosed);
        }
        slot.pending = Some(picture);
        Ok(())
    }

    /// Read-and-clear the pending frame. Called from the render thread;
    /// never blocks.
    pub fn take(&self) -> Option<VideoPicture> {
        let mut slot = self.slot.lock();
        let picture = slot.pending.take();
        if picture.is_some() {
            self.drained.notify_one();
        }
        picture
    }

    /// Whether a frame is waiting.
    pub fn has_pending(&self) -> bool {
        self.slot.lock().pending.is_some()
    }

    /// Stop accepting frames and wake any blocked producer. The pending
    /// frame, if any, is dropped and recycled.
    pub fn close(&self) {
        let mut slot = self.slot.lock();
        slot.closed = true;
        slot.pending = None;
        self.drained.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.slot.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn picture(pool: &Arc<PicturePool>, pts: f64) -> VideoPicture {
        let mut p = VideoPicture::new(pool, 4, 4, PixelFormat::Rgba32);
        p.set_pts(pts);
        p
    }

    #[test]
    fn test_offer_is_latest_wins() {
        let pool = PicturePool::new();
        let mailbox = FrameMailbox::new();
        assert!(mailbox.offer(picture(&pool, 1.0)).unwrap().is_none());
        let displaced = mailbox.offer(picture(&pool, 2.0)).unwrap().unwrap();
        assert_eq!(displaced.pts(), 1.0);
        assert_eq!(mailbox.take().unwrap().pts(), 2.0);
        assert!(mailbox.take().is_none());
    }

    #[test]
    fn test_take_clears_slot() {
        let pool = PicturePool::new();
        let mailbox = FrameMailbox::new();
        mailbox.offer(picture(&pool, 0.5)).unwrap();
        assert!(mailbox.has_pending());
        assert!(mailbox.take().is_some());
        assert!(!mailbox.has_pending());
    }

    #[test]
    fn test_put_blocks_until_taken() {
        let pool = PicturePool::new();
        let mailbox = FrameMailbox::new();
        mailbox.put(picture(&pool, 1.0)).unwrap();

        let producer = {
            let mailbox = Arc::clone(&mailbox);
            let pool = Arc::clone(&pool);
            std::thread::spawn(move || mailbox.put(picture(&pool, 2.0)))
        };

        // Producer is parked on the full slot
        std::thread::sleep(Duration::from_millis(50));
        assert!(!producer.is_finished());

        assert_eq!(mailbox.take().unwrap().pts(), 1.0);
        producer.join().unwrap().unwrap();
        assert_eq!(mailbox.take().unwrap().pts(), 2.0);
    }

    #[test]
    fn test_close_unblocks_producer() {
        let pool = PicturePool::new();
        let mailbox = FrameMailbox::new();
        mailbox.put(picture(&pool, 1.0)).unwrap();

        let producer = {
            let mailbox = Arc::clone(&mailbox);
            let pool = Arc::clone(&pool);
            std::thread::spawn(move || mailbox.put(picture(&pool, 2.0)))
        };

        std::thread::sleep(Duration::from_millis(20));
        mailbox.close();
        assert!(matches!(
            producer.join().unwrap(),
            Err(FrameError::MailboxClosed)
        ));
        // Closing recycles the pending frame
        assert!(mailbox.take().is_none());
        assert_eq!(pool.map_count(), 0);
    }

    #[test]
    fn test_fill_checks_size() {
        let pool = PicturePool::new();
        let mut p = VideoPicture::new(&pool, 2, 2, PixelFormat::Rgb24);
        assert!(p.fill(0.0, &[0u8; 12]).is_ok());
        assert!(matches!(
            p.fill(0.0, &[0u8; 13]),
            Err(FrameError::BufferSize(13, 12))
        ));
    }
}
