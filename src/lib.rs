// =============================================================================
// lib.rs — MdCSR sparse-weight inference core
// =============================================================================
//
// Weights live on disk in MdCSR form: i8 values, u16 column deltas, u32 row
// pointers, u16 codes into a prime table, and one f32 scale per row. A
// weight decodes as
//
//   w = value * prime[code] * scale[row]
//
// The loader maps the file and validates it once; every later access is a
// borrowed view. Each decode step runs the transformer layer by layer,
// sending the projections through a sparse mat-vec backend (rayon, or wgpu
// with the `gpu` feature) and attending over a per-session KV-Cache with a
// single-pass streaming softmax.
//
// Layers:
//   primes, sparse            code table and matrix format
//   kernel, accel             SpMV backends
//   context                   shared table, thread pool, accelerator
//   model                     file format, loader, writer
//   tensor, kv_cache          dense kernels and attention history
//   engine                    fused dispatcher and sessions
// =============================================================================

pub mod accel;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod kernel;
pub mod kv_cache;
pub mod model;
pub mod primes;
pub mod sparse;
pub mod tensor;

pub use config::{BackendKind, EngineConfig};
pub use context::EngineContext;
pub use engine::{Greedy, Sampler, Session, SessionState, SessionStats};
pub use error::{EngineError, Result};
pub use kv_cache::{KvCache, KvView};
pub use model::{LayerWeights, ModelConfig, ModelFile, ModelWriter};
pub use primes::PrimeTable;
pub use sparse::SparseMatrix;
