// =============================================================================
// model/mod.rs — MdCSR model files: format, loading, writing
// =============================================================================
//
// File layout (little-endian, v1):
//
//   [header 128 B][directory n × 64 B][16-byte aligned arrays ...]
//
// The loader maps the file read-only and hands out views that borrow the
// mapping directly. The OS only pages in what a forward pass touches; the
// warm-up pass can ask for layers ahead of time (see `prefetch`).
// =============================================================================

pub mod config;
pub mod constants;
pub mod directory;
pub mod header;
pub mod loader;
pub mod prefetch;
pub mod synthetic;
pub mod writer;

pub use config::ModelConfig;
pub use constants::*;
pub use directory::{DirEntry, Directory, TensorKind, TensorRanges};
pub use header::FileHeader;
pub use loader::{cache_key_owner, LayerWeights, ModelFile};
pub use synthetic::{synthetic_model, synthetic_model_bytes, synthetic_writer};
pub use writer::ModelWriter;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::context::EngineContext;
    use crate::error::EngineError;
    use crate::primes::PrimeTable;
    use crate::sparse::SparseMatrix;

    fn ctx() -> EngineContext {
        EngineContext::new(EngineConfig::cpu().with_threads(2).with_prime_table_len(128)).unwrap()
    }

    fn write_bytes(bytes: &[u8]) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.mdcs");
        std::fs::write(&path, bytes).unwrap();
        (dir, path)
    }

    #[test]
    fn test_load_synthetic_model() {
        let cfg = ModelConfig::tiny();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny.mdcs");
        synthetic_model(&path, &cfg, 42).unwrap();

        let ctx = ctx();
        let model = ModelFile::load(&path, &ctx).unwrap();
        assert_eq!(model.config(), &cfg);
        assert_eq!(model.layer_count(), 2);
        assert_eq!(model.directory().len(), 3 + 9 * cfg.n_layers);

        let layer = model.get_layer(1).unwrap();
        assert_eq!(layer.index, 1);
        assert_eq!(layer.wq.rows(), cfg.dim);
        assert_eq!(layer.w_gate.rows(), cfg.hidden_dim);
        assert_eq!(layer.w_down.cols(), cfg.hidden_dim);
        assert_eq!(layer.attn_norm.len(), cfg.dim);
        assert!(layer.wq.nnz() > 0);
        assert_eq!(model.embedding().unwrap().rows(), cfg.vocab_size);
        assert_eq!(model.final_norm().unwrap(), &vec![1.0f32; cfg.dim][..]);
    }

    #[test]
    fn test_views_are_zero_copy() {
        let cfg = ModelConfig::tiny();
        let (_d, path) = write_bytes(&synthetic_model_bytes(&cfg, 1).unwrap());
        let ctx = ctx();
        let model = ModelFile::load(&path, &ctx).unwrap();
        let layer = model.get_layer(0).unwrap();
        assert!(layer.wq.is_borrowed());
        assert!(layer.w_down.is_borrowed());
        assert!(model.output().unwrap().is_borrowed());
    }

    #[test]
    fn test_loaded_matches_written() {
        let cfg = ModelConfig::tiny();
        let primes = PrimeTable::generate(cfg.prime_codes).unwrap();
        let writer = synthetic_writer(&cfg, 9).unwrap();
        let (_d, path) = write_bytes(&writer.to_bytes().unwrap());

        let ctx = ctx();
        let model = ModelFile::load(&path, &ctx).unwrap();
        let dense = model.get_layer(0).unwrap().wv.to_dense(&primes);

        // Rebuild the same tensor through a second, independent load.
        let again = ModelFile::load(&path, &ctx).unwrap();
        let dense2 = again.get_layer(0).unwrap().wv.to_dense(&primes);
        assert_eq!(dense, dense2);
    }

    #[test]
    fn test_corrupted_magic_is_format_error() {
        let cfg = ModelConfig::tiny();
        let mut bytes = synthetic_model_bytes(&cfg, 3).unwrap();
        bytes[0..4].copy_from_slice(&0u32.to_le_bytes());
        let (_d, path) = write_bytes(&bytes);
        let err = ModelFile::load(&path, &ctx()).unwrap_err();
        assert!(matches!(err, EngineError::Format(ref m) if m.contains("magic")), "{err}");
    }

    #[test]
    fn test_unsupported_version() {
        let cfg = ModelConfig::tiny();
        let mut bytes = synthetic_model_bytes(&cfg, 3).unwrap();
        bytes[4..8].copy_from_slice(&7u32.to_le_bytes());
        let (_d, path) = write_bytes(&bytes);
        assert!(matches!(
            ModelFile::load(&path, &ctx()),
            Err(EngineError::Format(_))
        ));
    }

    #[test]
    fn test_truncated_file() {
        let cfg = ModelConfig::tiny();
        let bytes = synthetic_model_bytes(&cfg, 3).unwrap();
        let (_d, path) = write_bytes(&bytes[..bytes.len() / 2]);
        assert!(matches!(
            ModelFile::load(&path, &ctx()),
            Err(EngineError::Format(_))
        ));

        let (_d2, path) = write_bytes(&bytes[..40]);
        assert!(matches!(
            ModelFile::load(&path, &ctx()),
            Err(EngineError::Format(_))
        ));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ModelFile::load(&dir.path().join("absent.mdcs"), &ctx()).unwrap_err();
        assert!(matches!(err, EngineError::Io { .. }));
    }

    #[test]
    fn test_layer_out_of_range() {
        // 40 layers, ask for layer 41.
        let cfg = ModelConfig {
            n_layers: 40,
            dim: 8,
            hidden_dim: 8,
            n_heads: 2,
            head_dim: 4,
            vocab_size: 8,
            max_seq_len: 4,
            prime_codes: 16,
            ..ModelConfig::tiny()
        };
        let (_d, path) = write_bytes(&synthetic_model_bytes(&cfg, 5).unwrap());
        let ctx = ctx();
        let model = ModelFile::load(&path, &ctx).unwrap();
        assert!(model.get_layer(39).is_ok());
        let err = model.get_layer(41).unwrap_err();
        assert!(matches!(err, EngineError::Index { index: 41, len: 40, .. }), "{err}");
        assert!(matches!(model.prefetch_layer(40), Err(EngineError::Index { .. })));
    }

    #[test]
    fn test_context_table_too_small() {
        let cfg = ModelConfig::tiny();
        let (_d, path) = write_bytes(&synthetic_model_bytes(&cfg, 1).unwrap());
        let small =
            EngineContext::new(EngineConfig::cpu().with_prime_table_len(cfg.prime_codes - 1))
                .unwrap();
        assert!(matches!(
            ModelFile::load(&path, &small),
            Err(EngineError::Config(_))
        ));
    }

    /// Minimal one-layer model whose Wq is supplied by the caller.
    fn one_layer_with_wq(wq: SparseMatrix<'static>) -> Vec<u8> {
        let cfg = ModelConfig {
            n_layers: 1,
            dim: 4,
            hidden_dim: 4,
            n_heads: 2,
            head_dim: 2,
            vocab_size: 4,
            max_seq_len: 4,
            prime_codes: 8,
            ..ModelConfig::tiny()
        };
        let mut w = ModelWriter::new(cfg.clone());
        w.add_sparse(None, TensorKind::Embedding, SparseMatrix::empty(4, 4)).unwrap();
        w.add_sparse(None, TensorKind::Output, SparseMatrix::empty(4, 4)).unwrap();
        w.add_dense(None, TensorKind::FinalNorm, vec![1.0; 4]).unwrap();
        for kind in TensorKind::PER_LAYER {
            let (rows, cols) = kind.expected_shape(&cfg);
            if kind.is_dense() {
                w.add_dense(Some(0), kind, vec![1.0; rows]).unwrap();
            } else if kind == TensorKind::Wq {
                w.add_sparse(Some(0), kind, wq.clone()).unwrap();
            } else {
                w.add_sparse(Some(0), kind, SparseMatrix::empty(rows, cols)).unwrap();
            }
        }
        w.to_bytes().unwrap()
    }

    /// Byte offset of one of layer 0's Wq arrays inside `bytes`
    /// (0 values, 1 deltas, 2 row_ptr, 3 codes, 4 scales).
    fn wq_array_offset(bytes: &[u8], slot: usize) -> usize {
        let h = FileHeader::from_bytes(bytes).unwrap();
        (0..h.n_tensors as usize)
            .map(|i| {
                let at = HEADER_SIZE + i * DIR_ENTRY_SIZE;
                DirEntry::from_bytes(&bytes[at..at + DIR_ENTRY_SIZE]).unwrap()
            })
            .find(|e| e.kind == TensorKind::Wq)
            .map(|e| e.offsets[slot] as usize)
            .unwrap()
    }

    #[test]
    fn test_code_past_declared_prime_codes_is_format_error() {
        // The file declares 8 prime codes. Code 20 would decode fine against
        // the context's 128-entry table, but a session on an 8-entry table
        // would index past its end, so the loader must refuse the file.
        let primes = PrimeTable::generate(8).unwrap();
        let wq = SparseMatrix::new(
            4, 4, vec![1i8], vec![0u16], vec![0u32, 1, 1, 1, 1], vec![2u16], vec![1.0f32; 4],
            &primes,
        )
        .unwrap();
        let mut bytes = one_layer_with_wq(wq);
        let off = wq_array_offset(&bytes, 3);
        bytes[off..off + 2].copy_from_slice(&20u16.to_le_bytes());
        let (_d, path) = write_bytes(&bytes);

        let err = ModelFile::load(&path, &ctx()).unwrap_err();
        assert!(
            matches!(err, EngineError::Format(ref m) if m.contains("Wq") && m.contains("code 20")),
            "{err}"
        );
    }

    #[test]
    fn test_bad_scale_in_file_is_numeric_error() {
        let primes = PrimeTable::generate(8).unwrap();
        let wq = SparseMatrix::encode_dense(&[1.0; 16], 4, 4, &primes, 0.0).unwrap();
        let mut bytes = one_layer_with_wq(wq);
        let off = wq_array_offset(&bytes, 4);
        bytes[off..off + 4].copy_from_slice(&(-1.0f32).to_le_bytes());
        let (_d, path) = write_bytes(&bytes);
        let err = ModelFile::load(&path, &ctx()).unwrap_err();
        assert!(matches!(err, EngineError::Numeric(ref m) if m.contains("Wq")), "{err}");
    }

    #[test]
    fn test_misaligned_directory_entry() {
        let primes = PrimeTable::generate(8).unwrap();
        let wq = SparseMatrix::encode_dense(&[1.0; 16], 4, 4, &primes, 0.0).unwrap();
        let mut bytes = one_layer_with_wq(wq);
        // Shift the first entry's values offset off the 16-byte grid.
        let at = HEADER_SIZE + 24;
        let off = u64::from_le_bytes(bytes[at..at + 8].try_into().unwrap());
        bytes[at..at + 8].copy_from_slice(&(off + 2).to_le_bytes());
        let (_d, path) = write_bytes(&bytes);
        assert!(matches!(
            ModelFile::load(&path, &ctx()),
            Err(EngineError::Format(_))
        ));
    }

    #[test]
    fn test_prefetch_layers() {
        let cfg = ModelConfig::tiny();
        let (_d, path) = write_bytes(&synthetic_model_bytes(&cfg, 2).unwrap());
        let ctx = ctx();
        let model = ModelFile::load(&path, &ctx).unwrap();
        for l in 0..model.layer_count() {
            model.prefetch_layer(l).unwrap();
        }
    }

    #[test]
    fn test_cache_keys_unique() {
        let cfg = ModelConfig::tiny();
        let (_d, path) = write_bytes(&synthetic_model_bytes(&cfg, 2).unwrap());
        let ctx = ctx();
        let a = ModelFile::load(&path, &ctx).unwrap();
        let b = ModelFile::load(&path, &ctx).unwrap();
        let k = a.cache_key(Some(0), TensorKind::Wq);
        assert_ne!(k, a.cache_key(Some(1), TensorKind::Wq));
        assert_ne!(k, a.cache_key(Some(0), TensorKind::Wk));
        assert_ne!(k, a.cache_key(None, TensorKind::Output));
        assert_ne!(k, b.cache_key(Some(0), TensorKind::Wq));
    }

    #[test]
    fn test_cache_key_owner() {
        let cfg = ModelConfig::tiny();
        let (_d, path) = write_bytes(&synthetic_model_bytes(&cfg, 2).unwrap());
        let ctx = ctx();
        let a = ModelFile::load(&path, &ctx).unwrap();
        let b = ModelFile::load(&path, &ctx).unwrap();
        for (layer, kind) in [
            (Some(0), TensorKind::Wq),
            (Some(1), TensorKind::WDown),
            (None, TensorKind::Output),
            (None, TensorKind::FinalNorm),
        ] {
            assert_eq!(cache_key_owner(a.cache_key(layer, kind)), a.id());
            assert_eq!(cache_key_owner(b.cache_key(layer, kind)), b.id());
        }
        assert_ne!(a.id(), b.id());
    }
}
