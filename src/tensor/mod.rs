// =============================================================================
// tensor/mod.rs — Dense vector kernels used around the sparse projections
// =============================================================================

mod activations;
mod attention;
mod dot;
mod normalization;
mod rope;

#[cfg(test)]
mod tests;

pub use activations::{silu, swiglu};
pub use attention::streaming_attention;
pub use dot::{dot, scale_add};
pub use normalization::rmsnorm;
pub use rope::RopeTable;

#[cfg(test)]
pub(crate) use attention::reference_attention;

/// Index of the largest logit; ties go to the lowest index. NaN never wins.
pub fn argmax(logits: &[f32]) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (i, &v) in logits.iter().enumerate() {
        if v.is_nan() {
            continue;
        }
        match best {
            Some((_, b)) if v <= b => {}
            _ => best = Some((i, v)),
        }
    }
    best.map(|(i, _)| i)
}
