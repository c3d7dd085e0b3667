// =============================================================================
// model/constants.rs — File format constants
// =============================================================================

pub const MAGIC: u32 = 0x5343_444D; // "MDCS"
pub const VERSION: u32 = 1;
pub const HEADER_SIZE: usize = 128;
pub const DIR_ENTRY_SIZE: usize = 64;

/// Every array in the payload starts on this boundary.
pub const ARRAY_ALIGN: usize = 16;

/// Directory `layer` value for tensors outside the layer stack.
pub const GLOBAL_LAYER: u32 = u32::MAX;

pub const DEFAULT_ROPE_THETA: f32 = 10000.0;
pub const DEFAULT_NORM_EPS: f32 = 1e-5;
