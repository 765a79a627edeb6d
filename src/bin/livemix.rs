// livemix demo
// Builds a mixer from a session file (or a default test scene), runs the
// render loop and shows the composite in an output window.

use anyhow::Context;
use clap::Parser;
use livemix::mixer::Mixer;
use livemix::output::OutputWindow;
use livemix::render::{Compositor, RenderContext, RenderLoop};
use livemix::source::AlgorithmKind;
use livemix::SessionConfig;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "livemix", about = "Real-time video mixing engine demo")]
struct Args {
    /// Session file to load (JSON)
    #[arg(short, long)]
    session: Option<PathBuf>,

    /// Composite width in pixels
    #[arg(long, default_value_t = 1024)]
    width: u32,

    /// Composite height in pixels
    #[arg(long, default_value_t = 768)]
    height: u32,

    /// Render loop frequency
    #[arg(long, default_value_t = 30)]
    fps: u32,

    /// Run without the preview window
    #[arg(long)]
    headless: bool,

    /// Stop after this many frames (0 = run until closed)
    #[arg(long, default_value_t = 0)]
    frames: u64,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let ctx = RenderContext::new().context("GPU context")?;
    let mut compositor = Compositor::new(&ctx, args.width, args.height);
    let mut mixer = Mixer::new(args.width, args.height);

    match &args.session {
        Some(path) => {
            let session = SessionConfig::load(path)
                .with_context(|| format!("loading {}", path.display()))?;
            compositor.set_clear_white(session.clear_to_white);
            compositor.set_loopback_period(session.loopback_period);
            mixer.set_configuration(&session);
            log::info!(
                "session loaded: {} sources from {}",
                mixer.len(),
                path.display()
            );
        }
        None => {
            // Default test scene: two generators mixed additively
            mixer.add_algorithm_source(AlgorithmKind::Gradient, 640, 480, args.fps);
            let noise = mixer.add_algorithm_source(AlgorithmKind::Noise, 320, 240, args.fps);
            mixer.drop_source_with_alpha(noise, 1.0, 0.5);
            log::info!("no session given, using the built-in test scene");
        }
    }

    let events = mixer.subscribe();
    let mut render_loop = RenderLoop::new(ctx, compositor, mixer, args.fps);

    let window = if args.headless {
        None
    } else {
        let handle = OutputWindow::create("livemix", args.width, args.height);
        render_loop.add_frame_tap(handle.frame_sink());
        Some(handle)
    };

    let handle = render_loop.run();

    loop {
        while let Ok(event) = events.try_recv() {
            log::debug!("event: {:?}", event);
        }
        if let Some(ref window) = window {
            if !window.is_open() {
                log::info!("output window closed");
                break;
            }
        }
        if !handle.is_running() {
            break;
        }
        if args.frames > 0 {
            // Bounded runs are for smoke-testing; poll the loop's progress
            let (done_tx, done_rx) = crossbeam_channel::bounded(1);
            let target = args.frames;
            let _ = handle.control(move |rl| {
                let _ = done_tx.send(rl.tick_count() >= target);
            });
            if done_rx
                .recv_timeout(std::time::Duration::from_secs(1))
                .unwrap_or(false)
            {
                break;
            }
        }
        std::thread::sleep(std::time::Duration::from_millis(100));
    }

    handle.stop();
    if let Some(window) = window {
        window.close();
    }
    Ok(())
}
