// =============================================================================
// accel/device.rs — wgpu adapter / device / queue bring-up
// =============================================================================
//
// Every upload and every submission runs inside `scoped`, which captures
// validation and out-of-memory errors and returns them as `Device` errors.
// Anything that still escapes to the uncaptured handler is latched and
// reported by the next scope, so no GPU failure is only logged.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};
use wgpu::{Device, Queue};

use crate::error::{EngineError, Result};

pub(crate) struct GpuDevice {
    pub device: Device,
    pub queue: Queue,
    pub name: String,
    pub limits: wgpu::Limits,
    uncaptured: Arc<AtomicBool>,
}

impl GpuDevice {
    /// Blocking bring-up. Any failure is a `Device` error so the caller can
    /// choose the CPU path instead.
    pub fn open() -> Result<Self> {
        pollster::block_on(Self::open_async())
    }

    async fn open_async() -> Result<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or_else(|| EngineError::Device("no compatible GPU adapter".into()))?;

        let adapter_info = adapter.get_info();
        info!(
            adapter = %adapter_info.name,
            backend = ?adapter_info.backend,
            "[accel] selected adapter"
        );

        let limits = wgpu::Limits::default();
        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("mdcsr-engine"),
                    required_features: wgpu::Features::empty(),
                    required_limits: limits.clone(),
                    memory_hints: wgpu::MemoryHints::Performance,
                },
                None,
            )
            .await
            .map_err(|e| EngineError::Device(format!("request_device: {e}")))?;

        let uncaptured = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&uncaptured);
        device.on_uncaptured_error(Box::new(move |error| {
            warn!(%error, "[accel] uncaptured GPU error");
            flag.store(true, Ordering::Release);
        }));

        debug!(
            max_storage_buffers = limits.max_storage_buffers_per_shader_stage,
            max_binding = limits.max_storage_buffer_binding_size,
            workgroup_storage = limits.max_compute_workgroup_storage_size,
            "[accel] device limits"
        );

        Ok(Self {
            device,
            queue,
            name: adapter_info.name,
            limits,
            uncaptured,
        })
    }

    /// Largest buffer a shader can bind as one storage binding.
    pub fn max_binding(&self) -> u64 {
        (self.limits.max_storage_buffer_binding_size as u64).min(self.limits.max_buffer_size)
    }

    /// Run `f` inside validation and out-of-memory error scopes. A captured
    /// error, or one the uncaptured handler saw meanwhile, becomes
    /// `EngineError::Device` and wins over whatever `f` returned.
    pub fn scoped<T>(&self, what: &str, f: impl FnOnce(&Device) -> Result<T>) -> Result<T> {
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let out = f(&self.device);
        let validation = pollster::block_on(self.device.pop_error_scope());
        let oom = pollster::block_on(self.device.pop_error_scope());
        if let Some(e) = validation.or(oom) {
            return Err(EngineError::Device(format!("{what}: {e}")));
        }
        if self.uncaptured.swap(false, Ordering::AcqRel) {
            return Err(EngineError::Device(format!(
                "{what}: device reported an uncaptured error"
            )));
        }
        out
    }
}

/// Reject any buffer that would exceed the device's storage binding limit.
/// `sizes` pairs a buffer name with its byte length.
pub(crate) fn check_bindings(what: &str, sizes: &[(&str, u64)], limit: u64) -> Result<()> {
    match sizes.iter().find(|(_, bytes)| *bytes > limit) {
        None => Ok(()),
        Some((name, bytes)) => Err(EngineError::Device(format!(
            "{what}: {name} needs {bytes} bytes, device binds at most {limit}"
        ))),
    }
}
