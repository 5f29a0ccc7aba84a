// =============================================================================
// FISSION RENDERER - Vulkan frame orchestration
// =============================================================================
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  main: outer loop (poll events, close check, resize signal)     │
// │    └── Renderer: frame scheduler                                │
// │          ├── Swapchain + PipelineState (rebuilt on staleness)   │
// │          ├── ResourceUploader (staging -> device-local)         │
// │          └── FrameSync per slot (fences, semaphores)            │
// │                └── DeviceContext (instance, device, queues)     │
// └─────────────────────────────────────────────────────────────────┘
//
// Any unrecoverable error ends the process through OrFatal::or_fatal.
//
// =============================================================================

mod assets;
mod backend;
mod camera;
mod config;
mod error;
mod renderer;
mod window;

use anyhow::{Context, Result};
use backend::{tracker, DeviceContext};
use config::Config;
use error::OrFatal;
use renderer::Renderer;
use std::fs::File;
use std::io::Write;
use std::time::Instant;
use window::{fps_title, AppWindow, FpsCounter};

fn main() {
    // Load configuration from config.toml
    let config = Config::load();

    init_logging(&config);
    log::info!("Starting Fission renderer");

    let mut window = AppWindow::new(&config.window).or_fatal();

    let device = DeviceContext::new(
        &config.window.title,
        config.validation_enabled(),
        Some(window.window()),
    )
    .or_fatal();

    let mut renderer = Renderer::new(device.clone(), &mut window, &config).or_fatal();
    let mut fps = FpsCounter::new(Instant::now());

    // Close is only checked between frames; a started frame always finishes
    loop {
        window.poll_events();
        if window.should_close() {
            break;
        }

        let resized = window.take_resize_signal();
        renderer.draw_frame(&mut window, resized).or_fatal();

        if config.debug.show_fps {
            if let Some(sample) = fps.frame(Instant::now()) {
                window.set_title(&fps_title(
                    &config.window.title,
                    sample,
                    window.is_fullscreen(),
                ));
            }
        }
    }

    log::info!("Shutting down after {} frames", renderer.frame_number());
    drop(renderer);
    drop(device);

    if tracker::report_leaks() {
        log::info!("All GPU handles released");
    }
}

/// env_logger from RUST_LOG (info by default), optionally piped to a file
fn init_logging(config: &Config) {
    use env_logger::{Builder, Env, Target};

    let mut builder = Builder::from_env(Env::default().default_filter_or("info"));

    let mut file_error = None;
    if config.debug.log_to_file {
        match open_log_file(&config.debug.log_file) {
            Ok(file) => {
                builder.target(Target::Pipe(Box::new(file)));
            }
            Err(e) => file_error = Some(e),
        }
    }

    builder.init();

    if let Some(e) = file_error {
        log::warn!("Logging to stderr instead: {:#}", e);
    }
}

fn open_log_file(path: &str) -> Result<File> {
    let mut file = File::create(path).with_context(|| format!("Failed to create log file {}", path))?;
    writeln!(file, "=== Fission Renderer Log ===")?;
    writeln!(file, "Started: {:?}", std::time::SystemTime::now())?;
    writeln!(file)?;
    Ok(file)
}
