//! Platform layer for Ember.
//!
//! - Window management via winit
//! - Vulkan surface creation and the instance extensions it needs

mod window;

pub use window::{Surface, Window, get_required_extensions};

// Re-export winit types that users might need
pub use winit::event::WindowEvent;
pub use winit::event_loop::EventLoop;
