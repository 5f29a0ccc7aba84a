// Window and input
//
// winit driven through pump_app_events, so main owns the outer loop and
// the renderer sees window state as plain values polled between frames.

use anyhow::{anyhow, Context, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    keyboard::{KeyCode, PhysicalKey},
    platform::pump_events::{EventLoopExtPumpEvents, PumpStatus},
    window::{Fullscreen, Window, WindowAttributes, WindowId},
};

use crate::config::WindowConfig;

/// What swapchain recreation needs from the window.
pub trait PresentTarget {
    /// Current framebuffer size in pixels; 0x0 while minimized.
    fn framebuffer_size(&self) -> (u32, u32);

    /// Block until at least one window event has been processed.
    fn wait_events(&mut self);

    fn close_requested(&self) -> bool {
        false
    }

    /// Forget resizes seen so far; the swapchain was just rebuilt to match.
    fn clear_resize_signal(&mut self) {}
}

/// Event-handler side of the window, fed by the event loop.
struct WindowState {
    config: WindowConfig,
    window: Option<Arc<Window>>,
    creation_error: Option<String>,
    is_fullscreen: bool,
    resized: bool,
    close_requested: bool,
}

impl WindowState {
    fn toggle_fullscreen(&mut self) {
        if let Some(ref window) = self.window {
            self.is_fullscreen = !self.is_fullscreen;

            if self.is_fullscreen {
                window.set_fullscreen(Some(Fullscreen::Borderless(None)));
                log::info!("Entered fullscreen mode");
            } else {
                window.set_fullscreen(None);
                log::info!("Exited fullscreen mode");
            }

            self.resized = true;
        }
    }
}

impl ApplicationHandler for WindowState {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let mut window_attributes = WindowAttributes::default()
            .with_title(&self.config.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.width,
                self.config.height,
            ));

        if self.config.fullscreen {
            window_attributes = window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        match event_loop.create_window(window_attributes) {
            Ok(window) => self.window = Some(Arc::new(window)),
            Err(e) => self.creation_error = Some(e.to_string()),
        }
    }

    fn window_event(&mut self, _event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                self.close_requested = true;
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                self.resized = true;
            }

            WindowEvent::KeyboardInput { event, .. } => {
                if event.state.is_pressed() {
                    if let PhysicalKey::Code(key) = event.physical_key {
                        match key {
                            KeyCode::Escape => {
                                log::info!("ESC pressed, exiting...");
                                self.close_requested = true;
                            }
                            KeyCode::F11 => self.toggle_fullscreen(),
                            _ => {}
                        }
                    }
                }
            }

            _ => {}
        }
    }
}

/// The application window plus the event loop that feeds it.
pub struct AppWindow {
    event_loop: EventLoop<()>,
    state: WindowState,
    window: Arc<Window>,
}

impl AppWindow {
    /// Create the event loop and pump it until the window exists.
    pub fn new(config: &WindowConfig) -> Result<Self> {
        let mut event_loop = EventLoop::new().context("Failed to create event loop")?;
        let mut state = WindowState {
            config: config.clone(),
            window: None,
            creation_error: None,
            is_fullscreen: config.fullscreen,
            resized: false,
            close_requested: false,
        };

        let window = loop {
            if let PumpStatus::Exit(code) =
                event_loop.pump_app_events(Some(Duration::from_millis(16)), &mut state)
            {
                return Err(anyhow!("Event loop exited with status {} before the window opened", code));
            }
            if let Some(error) = state.creation_error.take() {
                return Err(anyhow!("Failed to create window: {}", error));
            }
            if let Some(ref window) = state.window {
                break window.clone();
            }
        };

        log::info!(
            "Window: {}x{} ({})",
            config.width,
            config.height,
            if config.fullscreen { "fullscreen" } else { "windowed" }
        );

        // Creation itself reports a resize on some platforms
        state.resized = false;

        Ok(Self {
            event_loop,
            state,
            window,
        })
    }

    pub fn window(&self) -> &Window {
        &self.window
    }

    /// Process pending events without blocking.
    pub fn poll_events(&mut self) {
        self.pump(Some(Duration::ZERO));
    }

    /// Whether a resize happened since the last call. Clears the signal.
    pub fn take_resize_signal(&mut self) -> bool {
        std::mem::take(&mut self.state.resized)
    }

    pub fn should_close(&self) -> bool {
        self.state.close_requested
    }

    pub fn is_fullscreen(&self) -> bool {
        self.state.is_fullscreen
    }

    pub fn set_title(&self, title: &str) {
        self.window.set_title(title);
    }

    fn pump(&mut self, timeout: Option<Duration>) {
        if let PumpStatus::Exit(_) = self.event_loop.pump_app_events(timeout, &mut self.state) {
            self.state.close_requested = true;
        }
    }
}

impl PresentTarget for AppWindow {
    fn framebuffer_size(&self) -> (u32, u32) {
        let size = self.window.inner_size();
        (size.width, size.height)
    }

    fn wait_events(&mut self) {
        self.pump(None);
    }

    fn close_requested(&self) -> bool {
        self.should_close()
    }

    fn clear_resize_signal(&mut self) {
        self.state.resized = false;
    }
}

/// Frames per second, refreshed once per second.
#[derive(Debug)]
pub struct FpsCounter {
    frame_count: u32,
    last_update: Instant,
    last_frame: Instant,
}

/// Rate over the last one-second window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FpsSample {
    pub fps: f32,
    pub frame_ms: f32,
}

impl FpsCounter {
    pub fn new(now: Instant) -> Self {
        Self {
            frame_count: 0,
            last_update: now,
            last_frame: now,
        }
    }

    /// Count a presented frame; yields a sample once a second has passed.
    pub fn frame(&mut self, now: Instant) -> Option<FpsSample> {
        let frame_time = now.duration_since(self.last_frame).as_secs_f32();
        self.last_frame = now;
        self.frame_count += 1;

        let elapsed = now.duration_since(self.last_update).as_secs_f32();
        if elapsed < 1.0 {
            return None;
        }

        let sample = FpsSample {
            fps: self.frame_count as f32 / elapsed,
            frame_ms: frame_time * 1000.0,
        };
        self.frame_count = 0;
        self.last_update = now;
        Some(sample)
    }
}

pub fn fps_title(base: &str, sample: FpsSample, fullscreen: bool) -> String {
    let mode = if fullscreen { "fullscreen" } else { "windowed" };
    format!("{} - {:.0} FPS ({:.2}ms) [{}]", base, sample.fps, sample.frame_ms, mode)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fps_sample_once_per_second() {
        let start = Instant::now();
        let mut counter = FpsCounter::new(start);

        for i in 1..60 {
            assert!(counter.frame(start + Duration::from_millis(i * 16)).is_none());
        }
        let sample = counter.frame(start + Duration::from_millis(1000)).unwrap();
        assert!((sample.fps - 60.0).abs() < 0.01);
        assert!((sample.frame_ms - 56.0).abs() < 0.01);

        // Counter restarts after a sample
        assert!(counter.frame(start + Duration::from_millis(1016)).is_none());
    }

    #[test]
    fn title_includes_rate_and_mode() {
        let title = fps_title(
            "Fission Engine / Renderer",
            FpsSample {
                fps: 144.4,
                frame_ms: 6.5,
            },
            false,
        );
        assert_eq!(title, "Fission Engine / Renderer - 144 FPS (6.50ms) [windowed]");
    }
}
