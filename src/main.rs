//! crt-overlay CLI: opens the overlay on a display and keeps it running.

use anyhow::Result;
use clap::Parser;
use crt_overlay::capture::{DisplayProvider, SyntheticDisplays, XcapDisplays};
use crt_overlay::config::{Config, ConfigWatcher, FileWatcher};
use crt_overlay::engine::RenderEngine;
use crt_overlay::shader::{GpuContext, SurfaceTarget, WgpuDevice, CRT_SHADER, TEST_CARD_SHADER};
use crt_overlay::surface::{OverlayWindow, PresentationSurface};
use crt_overlay::OverlayContext;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use winit::application::ApplicationHandler;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::WindowId;

/// How long `--test-window` keeps the overlay open.
const TEST_WINDOW_DURATION: Duration = Duration::from_secs(5);
/// Interval between telemetry log lines.
const REPORT_INTERVAL: Duration = Duration::from_secs(5);
/// Event loop wake-up interval for hot reload and shutdown checks.
const TICK: Duration = Duration::from_millis(100);

/// Real-time CRT effect overlay.
#[derive(Parser, Debug)]
#[command(name = "crt-overlay")]
#[command(about = "Overlay a real-time CRT shader effect on top of a display")]
struct Args {
    /// Display to capture (see --list-displays); defaults to the main display
    #[arg(short, long)]
    display: Option<u32>,

    /// WGSL or GLSL fragment shader; defaults to the built-in CRT effect
    #[arg(short, long)]
    shader: Option<PathBuf>,

    /// YAML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Capture rate in frames per second
    #[arg(long)]
    fps: Option<u32>,

    /// List available displays and exit
    #[arg(long)]
    list_displays: bool,

    /// Capture a generated test card instead of the screen
    #[arg(long)]
    synthetic: bool,

    /// Start with the overlay hidden
    #[arg(long)]
    hidden: bool,

    /// Show a solid test colour for five seconds, then exit
    #[arg(long)]
    test_window: bool,

    /// Do not watch shader and config files for changes
    #[arg(long)]
    no_hot_reload: bool,
}

impl Args {
    /// Command-line flags take precedence over the config file.
    fn merge_into(&self, mut config: Config) -> Config {
        if self.display.is_some() {
            config.display = self.display;
        }
        if self.shader.is_some() {
            config.shader = self.shader.clone();
        }
        if let Some(fps) = self.fps {
            config.fps = fps;
        }
        if self.no_hot_reload || self.test_window {
            config.hot_reload = false;
        }
        config
    }
}

fn display_provider(synthetic: bool) -> Box<dyn DisplayProvider> {
    if synthetic {
        Box::new(SyntheticDisplays::new(vec![(1280, 720)]).with_primary(1))
    } else {
        Box::new(XcapDisplays)
    }
}

/// Application state for the event loop.
struct OverlayApp {
    args: Args,
    config: Config,
    running: Arc<AtomicBool>,
    window: Option<Arc<OverlayWindow>>,
    context: Option<OverlayContext<WgpuDevice>>,
    shader_watcher: Option<FileWatcher>,
    config_watcher: Option<ConfigWatcher>,
    started: Instant,
    last_report: Instant,
    failure: Option<anyhow::Error>,
}

impl OverlayApp {
    fn new(args: Args, config: Config, running: Arc<AtomicBool>) -> Self {
        Self {
            args,
            config,
            running,
            window: None,
            context: None,
            shader_watcher: None,
            config_watcher: None,
            started: Instant::now(),
            last_report: Instant::now(),
            failure: None,
        }
    }

    fn initialize(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let displays = display_provider(self.args.synthetic);
        let monitor = match self.config.display {
            Some(id) => displays.display(id)?,
            None => displays.main_display()?,
        };
        info!("Using display {} ({}, {}x{})", monitor.id, monitor.name, monitor.width, monitor.height);

        let window = Arc::new(OverlayWindow::create(event_loop, &monitor, !self.args.hidden)?);
        let (gpu, surface) = GpuContext::with_surface(Arc::clone(window.window()))?;
        let target = SurfaceTarget::new(&gpu, surface, window.shared_size());
        let device = WgpuDevice::new(gpu, target.format());

        let presentation: Arc<dyn PresentationSurface> = window.clone();
        let context = OverlayContext::new(
            RenderEngine::new(device),
            target,
            displays,
            Some(presentation),
            self.config.fps,
        );
        self.config.apply(&context);

        if self.args.test_window {
            context.load_shader(TEST_CARD_SHADER)?;
        } else {
            match &self.config.shader {
                Some(path) => context.load_shader_from_file(path)?,
                None => context.load_shader(CRT_SHADER)?,
            }
        }
        context.start_capture(monitor.id)?;

        if self.config.hot_reload {
            self.shader_watcher = self.watch_shader();
            if let Some(path) = &self.args.config {
                match ConfigWatcher::new(path, self.config.clone()) {
                    Ok(watcher) => self.config_watcher = Some(watcher),
                    Err(e) => warn!("Config hot reload disabled: {}", e),
                }
            }
        }

        self.window = Some(window);
        self.context = Some(context);
        Ok(())
    }

    fn watch_shader(&self) -> Option<FileWatcher> {
        let path = self.config.shader.as_ref()?;
        match FileWatcher::new(path) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                warn!("Shader hot reload disabled: {}", e);
                None
            }
        }
    }

    fn poll_hot_reload(&mut self) {
        let Some(context) = &self.context else {
            return;
        };

        if self.shader_watcher.as_ref().is_some_and(|w| w.changed()) {
            if let Some(path) = &self.config.shader {
                info!("Shader {:?} changed, recompiling", path);
                // Compile failures are logged by the engine; the old program stays active.
                let _ = context.load_shader_from_file(path);
            }
        }

        let Some((old, new)) = self.config_watcher.as_mut().and_then(|w| w.check_for_changes()) else {
            return;
        };
        new.apply(context);
        if new.display != old.display || new.fps != old.fps {
            warn!("Display and fps changes take effect after a restart");
        }
        // The command line still overrides the file.
        let merged = self.args.merge_into(new);
        let shader_changed = merged.shader != self.config.shader;
        self.config = merged;
        if shader_changed {
            let result = match &self.config.shader {
                Some(path) => context.load_shader_from_file(path),
                None => context.load_shader(CRT_SHADER),
            };
            if let Err(e) = result {
                error!("Failed to switch shader: {}", e);
            }
            self.shader_watcher = self.watch_shader();
        }
    }

    fn report(&mut self) {
        let Some(context) = &self.context else {
            return;
        };
        if self.last_report.elapsed() < REPORT_INTERVAL {
            return;
        }
        self.last_report = Instant::now();
        let telemetry = context.telemetry();
        info!(
            "[Perf] {:.1} FPS, {:.2} ms latency ({} presented, {} dropped)",
            telemetry.fps, telemetry.latency_ms, telemetry.presented, telemetry.dropped
        );
    }

    fn shutdown(&mut self) {
        if let Some(context) = self.context.take() {
            context.shutdown();
        }
        self.window = None;
    }
}

impl ApplicationHandler for OverlayApp {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.context.is_some() {
            return;
        }
        if let Err(e) = self.initialize(event_loop) {
            error!("Initialization error: {:#}", e);
            self.failure = Some(e);
            event_loop.exit();
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _window_id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                info!("Overlay window closed");
                event_loop.exit();
            }
            WindowEvent::Resized(size) => {
                if let Some(window) = &self.window {
                    window.handle_resize(size);
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        if !self.running.load(Ordering::SeqCst) {
            event_loop.exit();
            return;
        }
        if self.args.test_window && self.started.elapsed() >= TEST_WINDOW_DURATION {
            info!("Test window finished");
            event_loop.exit();
            return;
        }
        if self.context.as_ref().is_some_and(|c| c.engine().is_lost()) {
            self.failure = Some(anyhow::anyhow!("GPU device lost"));
            event_loop.exit();
            return;
        }

        self.poll_hot_reload();
        self.report();
        event_loop.set_control_flow(ControlFlow::WaitUntil(Instant::now() + TICK));
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        self.shutdown();
    }
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    if args.list_displays {
        println!("Available displays:");
        match display_provider(args.synthetic).displays() {
            Ok(displays) => {
                for d in displays {
                    println!(
                        "  [{}] {} {}x{} (scale {}){}",
                        d.id,
                        d.name,
                        d.width,
                        d.height,
                        d.scale_factor,
                        if d.is_primary { " (main)" } else { "" }
                    );
                }
            }
            Err(e) => eprintln!("Failed to list displays: {}", e),
        }
        return Ok(());
    }

    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    let config = args.merge_into(config);

    // Set up signal handler for graceful shutdown
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        info!("Received interrupt signal, shutting down...");
        r.store(false, Ordering::SeqCst);
    })?;

    info!("Starting crt-overlay...");
    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::WaitUntil(Instant::now() + TICK));

    let mut app = OverlayApp::new(args, config, running);
    event_loop.run_app(&mut app)?;
    app.shutdown();

    match app.failure.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
