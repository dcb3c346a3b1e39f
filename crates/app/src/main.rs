//! Ember - Main Entry Point
//!
//! Opens a window and drives the renderer's frame loop until the window is
//! closed or a fatal GPU error occurs.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use winit::application::ApplicationHandler;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::WindowId;

use ember_core::EngineConfig;
use ember_platform::Window;
use ember_renderer::Renderer;

const DEFAULT_CONFIG_PATH: &str = "config/ember.toml";

#[derive(Debug, Parser)]
#[command(name = "ember", version, about = "Ember frame pacing demo")]
struct Cli {
    /// Configuration file (defaults to config/ember.toml when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the number of frames in flight (1-4)
    #[arg(short = 'n', long)]
    frames_in_flight: Option<u32>,

    /// Force the validation layer on
    #[arg(long)]
    validation: bool,
}

impl Cli {
    fn load_config(&self) -> Result<EngineConfig> {
        let mut config = match &self.config {
            Some(path) => EngineConfig::load(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                EngineConfig::load(DEFAULT_CONFIG_PATH)
                    .with_context(|| format!("loading {DEFAULT_CONFIG_PATH}"))?
            }
            None => EngineConfig::default(),
        };

        if let Some(frames) = self.frames_in_flight {
            config.frames_in_flight = frames;
        }
        if self.validation {
            config.validation = true;
        }
        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

struct App {
    config: EngineConfig,
    // Declared before `window`: the surface must go before the window.
    renderer: Option<Renderer>,
    window: Option<Window>,
    failed: bool,
}

impl App {
    fn new(config: EngineConfig) -> Self {
        Self {
            config,
            renderer: None,
            window: None,
            failed: false,
        }
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop) {
        self.failed = true;
        // Tear the renderer down while the window still exists.
        self.renderer = None;
        event_loop.exit();
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let window = match Window::new(event_loop, &self.config.window) {
            Ok(window) => window,
            Err(e) => {
                error!("Failed to create window: {}", e);
                self.fail(event_loop);
                return;
            }
        };

        match Renderer::new(&window, &self.config) {
            Ok(renderer) => {
                info!("Initialization complete, entering main loop");
                self.renderer = Some(renderer);
                self.window = Some(window);
            }
            Err(e) => {
                error!("Failed to create renderer: {}", e);
                self.fail(event_loop);
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested, shutting down");
                self.renderer = None;
                event_loop.exit();
            }
            WindowEvent::Resized(size) => {
                if let Some(window) = self.window.as_mut() {
                    window.resize(size.width, size.height);
                }
                if let Some(renderer) = self.renderer.as_mut() {
                    renderer.resize(size.width, size.height);
                }
            }
            WindowEvent::RedrawRequested => {
                if let Some(renderer) = self.renderer.as_mut()
                    && let Err(e) = renderer.render_frame()
                {
                    error!("Fatal render error: {}", e);
                    self.fail(event_loop);
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(window) = self.window.as_ref()
            && !window.is_minimized()
        {
            window.request_redraw();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(renderer) = self.renderer.take() {
            info!("Rendered {} frames", renderer.frame_count());
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.load_config()?;

    ember_core::init_logging(config.log_filter.as_deref());
    info!(
        "Starting Ember ({} frames in flight, validation {})",
        config.frames_in_flight,
        if config.validation { "on" } else { "off" }
    );
    if config.frames_in_flight == 1 {
        warn!("One frame in flight: the CPU will wait for the GPU every frame");
    }

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;

    if app.failed {
        anyhow::bail!("ember exited after a fatal error");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides_config() {
        let cli = Cli::parse_from(["ember", "--frames-in-flight", "2", "--validation"]);
        let config = cli.load_config().unwrap();
        assert_eq!(config.frames_in_flight, 2);
        assert!(config.validation);
    }

    #[test]
    fn test_cli_rejects_out_of_range_frames() {
        let cli = Cli::parse_from(["ember", "-n", "9"]);
        assert!(cli.load_config().is_err());
    }

    #[test]
    fn test_missing_config_file_is_an_error() {
        let cli = Cli::parse_from(["ember", "--config", "does/not/exist.toml"]);
        assert!(cli.load_config().is_err());
    }
}
