// Rendering loop
// Fixed-interval tick driving the whole pipeline on one render thread:
// update every source, composite the eligible ones, snapshot for
// loopback, refresh secondary views
//
// The loop thread owns the GPU context, the compositor and the mixer;
// other threads reach in through queued commands.

use super::{Compositor, RenderContext};
use crate::events::EventHub;
use crate::mixer::Mixer;
use crate::source::{PlayState, SourceInput};
use crossbeam_channel::{Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// A composite frame read back for display or recording.
#[derive(Debug, Clone)]
pub struct CompositeFrame {
    pub width: u32,
    pub height: u32,
    /// Tightly packed RGBA rows.
    pub data: Vec<u8>,
}

type Command = Box<dyn FnOnce(&mut RenderLoop) + Send>;

/// The periodic scheduler.
pub struct RenderLoop {
    ctx: RenderContext,
    compositor: Compositor,
    mixer: Mixer,
    events: Arc<EventHub>,
    interval: Duration,
    last_tick: Option<Instant>,
    tick_count: u64,
    frame_taps: Vec<Sender<CompositeFrame>>,
    commands: Option<Receiver<Command>>,
}

impl RenderLoop {
    pub fn new(ctx: RenderContext, compositor: Compositor, mixer: Mixer, fps: u32) -> Self {
        let events = Arc::clone(mixer.events());
        Self {
            ctx,
            compositor,
            mixer,
            events,
            interval: Duration::from_micros(1_000_000 / fps.max(1) as u64),
            last_tick: None,
            tick_count: 0,
            frame_taps: Vec::new(),
            commands: None,
        }
    }

    pub fn mixer(&self) -> &Mixer {
        &self.mixer
    }

    pub fn mixer_mut(&mut self) -> &mut Mixer {
        &mut self.mixer
    }

    pub fn compositor(&self) -> &Compositor {
        &self.compositor
    }

    pub fn compositor_mut(&mut self) -> &mut Compositor {
        &mut self.compositor
    }

    pub fn ctx(&self) -> &RenderContext {
        &self.ctx
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    /// Register a consumer of read-back composite frames. Every tap costs
    /// a GPU readback per tick, so this is for preview and recording, not
    /// a hot path.
    pub fn add_frame_tap(&mut self, tap: Sender<CompositeFrame>) {
        self.frame_taps.push(tap);
    }

    /// One full frame. Callable directly for step-driven hosts; `run`
    /// calls it on a timer.
    pub fn tick(&mut self) {
        let now = Instant::now();
        let dt = self
            .last_tick
            .map(|t| (now - t).as_secs_f64())
            .unwrap_or(0.0);
        self.last_tick = Some(now);

        let render_aspect = self.compositor.aspect_ratio();

        // (a) update every source, standby included, so clocks and
        // decoders stay in sync while visually excluded
        for source in self.mixer.iter_mut() {
            source.update(&self.ctx, dt, &self.events);
            source.core_mut().test_culling(render_aspect);
        }

        self.compositor
            .set_loopback_enabled(self.mixer.has_recursive_loopback());

        // (b) open the composite frame
        self.compositor.pre_render(&self.ctx);

        // Effect chains run before compositing, each stage in its own
        // isolated pass
        for source in self.mixer.iter_mut() {
            let (chain, input) = source.effects_and_input();
            if chain.is_empty() {
                continue;
            }
            let Some((encoder, previous_view)) = self.compositor.effect_pass_parts() else {
                break;
            };
            let input_view = match input {
                SourceInput::Own(view) => view,
                SourceInput::PreviousComposite => previous_view,
                SourceInput::Pending => continue,
            };
            chain.process_all(&self.ctx, encoder, input_view, &self.events);
        }

        // (c) draw eligible sources in stack order
        for source in self.mixer.iter() {
            let core = source.core();
            if core.state() == PlayState::Uninitialized
                || core.is_standby()
                || core.is_culled()
                || core.alpha() <= 0.0
            {
                continue;
            }
            self.compositor.render_source(&self.ctx, source.as_ref());
        }

        // (d) close the frame: loopback snapshot + catalog + submit
        self.compositor.post_render(&self.ctx, &self.events);

        // Private copies for the zero-latency loopback consumers
        let (width, height) = self.compositor.size();
        for source in self.mixer.iter_mut() {
            if let Some(loopback) = source.as_loopback_mut() {
                if !loopback.is_recursive() {
                    if let Some(target) = loopback.snapshot_target(&self.ctx, width, height) {
                        self.compositor.snapshot_composite_into(&self.ctx, target);
                    }
                }
            }
        }

        // (e) secondary consumers of the finished composite
        if !self.frame_taps.is_empty() {
            match self.compositor.read_composite(&self.ctx) {
                Ok(data) => {
                    let frame = CompositeFrame {
                        width,
                        height,
                        data,
                    };
                    // A lagging consumer loses frames, never stalls the tick
                    self.frame_taps.retain(|tap| {
                        !matches!(
                            tap.try_send(frame.clone()),
                            Err(crossbeam_channel::TrySendError::Disconnected(_))
                        )
                    });
                }
                Err(e) => log::warn!("composite readback failed: {}", e),
            }
        }

        self.tick_count += 1;
    }

    fn drain_commands(&mut self) {
        let Some(commands) = self.commands.take() else {
            return;
        };
        while let Ok(command) = commands.try_recv() {
            command(self);
        }
        self.commands = Some(commands);
    }

    /// Spawn the render thread and hand back its control handle.
    pub fn run(mut self) -> RenderLoopHandle {
        let (command_tx, command_rx) = crossbeam_channel::unbounded::<Command>();
        self.commands = Some(command_rx);
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let interval = self.interval;

        let thread = std::thread::Builder::new()
            .name("render-loop".to_string())
            .spawn(move || {
                log::info!(
                    "render loop started at {:.1} fps",
                    1.0 / interval.as_secs_f64()
                );
                let mut next_tick = Instant::now();
                while !stop_flag.load(Ordering::SeqCst) {
                    self.drain_commands();
                    self.tick();

                    // Cooperative pacing: each tick runs to completion,
                    // then the loop sleeps out the rest of the interval
                    next_tick += interval;
                    let now = Instant::now();
                    if next_tick > now {
                        std::thread::sleep(next_tick - now);
                    } else {
                        // Ticks are running long; drop the debt instead of
                        // bursting to catch up
                        next_tick = now;
                    }
                }
                log::info!("render loop stopped after {} frames", self.tick_count);
            })
            .expect("spawn render loop thread");

        RenderLoopHandle {
            stop,
            thread: Some(thread),
            commands: command_tx,
        }
    }
}

/// Control handle of a running render loop.
pub struct RenderLoopHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    commands: Sender<Command>,
}

impl RenderLoopHandle {
    /// Queue a closure to run on the render thread between ticks.
    pub fn control(
        &self,
        f: impl FnOnce(&mut RenderLoop) + Send + 'static,
    ) -> Result<(), crossbeam_channel::SendError<()>> {
        self.commands
            .send(Box::new(f))
            .map_err(|_| crossbeam_channel::SendError(()))
    }

    pub fn is_running(&self) -> bool {
        !self.stop.load(Ordering::SeqCst)
            && self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Ask the loop to stop and wait for the render thread to finish.
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("render loop thread panicked");
            }
        }
    }
}

impl Drop for RenderLoopHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
