//! Uniform buffer layouts.
//!
//! Structures use `#[repr(C)]` and implement `Pod` and `Zeroable` so they
//! can be uploaded with `bytemuck::bytes_of`.

use bytemuck::{Pod, Zeroable};

/// Per-frame uniform data.
///
/// # Memory Layout
///
/// - Offset 0: clear color (16 bytes)
/// - Offset 16: seconds since start (4 bytes)
/// - Offset 20: frame number, low 32 bits (4 bytes)
/// - Offset 24: palette index (4 bytes)
/// - Offset 28: padding (4 bytes)
/// - Total size: 32 bytes
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct FrameUniforms {
    pub clear_color: [f32; 4],
    pub time: f32,
    pub frame: u32,
    pub palette_index: u32,
    pub _padding: u32,
}

impl FrameUniforms {
    /// Size of the struct in bytes.
    pub const SIZE: usize = std::mem::size_of::<Self>();

    pub fn new(clear_color: [f32; 4], time: f32, frame_number: u64, palette_index: u32) -> Self {
        Self {
            clear_color,
            time,
            // Wraps after 2^32 frames.
            frame: frame_number as u32,
            palette_index,
            _padding: 0,
        }
    }
}
