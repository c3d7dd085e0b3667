// =============================================================================
// sparse/ — MdCSR matrix type and the dense → MdCSR encoder
// =============================================================================

mod encode;
mod matrix;

pub use encode::ENCODE_SEARCH_CODES;
pub use matrix::SparseMatrix;
