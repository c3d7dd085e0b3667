// =============================================================================
// engine/ — Decode sessions over a loaded MdCSR model
// =============================================================================
//
// `Session` is the surface the orchestration layer drives:
//
//   let ctx = Arc::new(EngineContext::new(config)?);
//   let model = Arc::new(ModelFile::load(path, &ctx)?);
//   let mut session = Session::new(ctx, model)?;
//   let logits = session.generate_step(token)?;
//
// `dispatch` hands each transformer layer to a `LayerBackend` as one
// dispatch; `scratch` holds the activations it reuses across steps.
// =============================================================================

mod dispatch;
mod layer;
mod scratch;
mod session;


pub(crate) use layer::{LayerBackend, LayerStep};
pub use session::{Greedy, Sampler, Session, SessionState, SessionStats};
