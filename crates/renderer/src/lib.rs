//! Frame pacing and the renderer composition root.
//!
//! - [`frame_manager`]: the N-buffered frame ring and its begin/end protocol
//! - [`frame`]: the per-slot resources that ring cycles through
//! - [`clear_pass`]: the per-frame work recorded into each slot
//! - [`renderer`]: brings Vulkan up for a window and ties the above together

pub mod clear_pass;
pub mod frame;
pub mod frame_manager;
pub mod renderer;
pub mod settings;
pub mod ubo;

pub use frame::{FrameSlot, SlotState};
pub use frame_manager::{FrameEnd, FrameInfo, FrameManager, FrameManagerDesc, FrameStart};
pub use renderer::Renderer;
