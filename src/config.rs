// =============================================================================
// config.rs — Engine configuration (process/session knobs, not model shape)
// =============================================================================
//
// Model dimensions come from the file header (see `model::ModelConfig`).
// Everything here is chosen by the caller: how big the code table is, which
// backend runs the sparse kernel, how many worker threads, and so on.
// =============================================================================

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Which compute backend runs the sparse mat-vec kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Rayon row-parallel kernel only.
    Cpu,
    /// Require the wgpu accelerator; context construction fails without it.
    Gpu,
    /// Try the accelerator, use the CPU when it is unavailable.
    Auto,
}

impl Default for BackendKind {
    fn default() -> Self {
        BackendKind::Auto
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of primes in the code table. Must cover every manifold code
    /// used by the models loaded against this context.
    pub prime_table_len: usize,

    pub backend: BackendKind,

    /// On a device error mid-generation, continue on the CPU instead of
    /// closing the session.
    pub cpu_fallback: bool,

    /// Worker threads for the rayon pool. `None` = rayon's default.
    pub num_threads: Option<usize>,

    /// Cap on the KV-Cache capacity. Cannot exceed the file's `max_seq_len`.
    pub max_seq_len: Option<usize>,

    /// Ask the kernel to page in each layer's payload during warm-up.
    pub prefetch: bool,

    /// Minimum rows handed to one rayon task in the sparse kernel.
    pub min_rows_per_task: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            prime_table_len: 4096,
            backend: BackendKind::Auto,
            cpu_fallback: true,
            num_threads: None,
            max_seq_len: None,
            prefetch: true,
            min_rows_per_task: 16,
        }
    }
}

impl EngineConfig {
    /// CPU-only configuration; handy for tests and tooling.
    pub fn cpu() -> Self {
        Self {
            backend: BackendKind::Cpu,
            ..Self::default()
        }
    }

    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_threads(mut self, n: usize) -> Self {
        self.num_threads = Some(n);
        self
    }

    pub fn with_max_seq_len(mut self, n: usize) -> Self {
        self.max_seq_len = Some(n);
        self
    }

    pub fn with_prime_table_len(mut self, n: usize) -> Self {
        self.prime_table_len = n;
        self
    }

    pub fn with_cpu_fallback(mut self, on: bool) -> Self {
        self.cpu_fallback = on;
        self
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        let cfg: Self =
            serde_json::from_str(s).map_err(|e| EngineError::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| EngineError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.prime_table_len == 0 {
            return Err(EngineError::Config("prime_table_len must be > 0".into()));
        }
        if self.num_threads == Some(0) {
            return Err(EngineError::Config("num_threads must be > 0".into()));
        }
        if self.max_seq_len == Some(0) {
            return Err(EngineError::Config("max_seq_len must be > 0".into()));
        }
        if self.min_rows_per_task == 0 {
            return Err(EngineError::Config("min_rows_per_task must be > 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = EngineConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.backend, BackendKind::Auto);
        assert!(cfg.cpu_fallback);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let cfg = EngineConfig::from_json_str(r#"{ "backend": "cpu", "num_threads": 2 }"#)
            .unwrap();
        assert_eq!(cfg.backend, BackendKind::Cpu);
        assert_eq!(cfg.num_threads, Some(2));
        assert_eq!(cfg.prime_table_len, 4096);
        assert_eq!(cfg.min_rows_per_task, 16);
    }

    #[test]
    fn test_rejects_zero_values() {
        let err = EngineConfig::from_json_str(r#"{ "prime_table_len": 0 }"#).unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
        let err = EngineConfig::from_json_str(r#"{ "num_threads": 0 }"#).unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn test_rejects_unknown_backend() {
        let err = EngineConfig::from_json_str(r#"{ "backend": "tpu" }"#).unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn test_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(&path, r#"{ "prefetch": false, "max_seq_len": 128 }"#).unwrap();
        let cfg = EngineConfig::from_json_file(&path).unwrap();
        assert!(!cfg.prefetch);
        assert_eq!(cfg.max_seq_len, Some(128));

        let missing = EngineConfig::from_json_file(&dir.path().join("nope.json"));
        assert!(matches!(missing, Err(EngineError::Io { .. })));
    }
}
