// =============================================================================
// accel/spmv.rs — SpMV pipeline, per-tensor buffer cache, batched dispatch
// =============================================================================
//
// Upload layout (all little-endian u32 words):
//   values  : i8 bytes, zero-padded to a multiple of 4
//   packed  : delta | (code << 16) per entry
//   row_ptr : u32 as stored
//   scales  : f32 as stored
//
// `encode` records one product into a caller's command encoder. Input and
// output are addressed by element offset, so several products can read and
// write slices of the same workspace buffer, and `accumulate` adds into the
// output instead of overwriting it.
//
// Device buffers are cached per tensor key and dropped per model. Error
// scopes are a device-wide stack, so every scoped region runs under the
// submit lock.
// =============================================================================

use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard};

use bytemuck::{Pod, Zeroable};
use tracing::debug;
use wgpu::util::DeviceExt;

use crate::error::{EngineError, Result};
use crate::model::cache_key_owner;
use crate::primes::PrimeTable;
use crate::sparse::SparseMatrix;

use super::device::{check_bindings, GpuDevice};

pub(crate) const WORKGROUP_SIZE: u32 = 64;

/// Capacity of the shared-memory prime table (16 KiB of f32).
pub const MAX_SHARED_PRIMES: usize = 4096;

const SHADER_SRC: &str = include_str!("shaders/spmv.wgsl");

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct Params {
    rows: u32,
    cols: u32,
    batch: u32,
    n_primes: u32,
    x_offset: u32,
    y_offset: u32,
    accumulate: u32,
    _pad: u32,
}

pub(crate) struct GpuMatrix {
    pub rows: usize,
    pub cols: usize,
    values: wgpu::Buffer,
    packed: wgpu::Buffer,
    row_ptr: wgpu::Buffer,
    scales: wgpu::Buffer,
}

/// One product to run on the device: `[batch × cols]` in, `[batch × rows]` out.
pub(crate) struct DeviceJob<'a> {
    pub matrix: &'a SparseMatrix<'a>,
    pub cache_key: Option<u64>,
    pub x: &'a [f32],
    pub batch: usize,
}

/// `y[y_offset..] (+)= M · x[x_offset..]` on buffers already on the device.
pub(crate) struct SpmvOp<'a> {
    pub matrix: &'a GpuMatrix,
    pub x: &'a wgpu::Buffer,
    pub x_offset: usize,
    pub y: &'a wgpu::Buffer,
    pub y_offset: usize,
    pub batch: usize,
    pub accumulate: bool,
}

#[derive(Default)]
struct DeviceCache {
    matrices: HashMap<u64, Arc<GpuMatrix>>,
    vectors: HashMap<u64, Arc<wgpu::Buffer>>,
}

pub(crate) struct SpmvPipeline {
    gpu: GpuDevice,
    pipeline: wgpu::ComputePipeline,
    layout: wgpu::BindGroupLayout,
    primes: wgpu::Buffer,
    n_primes: u32,
    cache: Mutex<DeviceCache>,
    submit: Mutex<()>,
}

/// Byte length of every buffer `upload` creates for `m`.
pub(crate) fn matrix_bytes(m: &SparseMatrix<'_>) -> [(&'static str, u64); 4] {
    let nnz = m.nnz() as u64;
    [
        ("values", nnz.div_ceil(4).max(1) * 4),
        ("packed", nnz.max(1) * 4),
        ("row_ptr", (m.rows() as u64 + 1) * 4),
        ("scales", (m.rows() as u64).max(1) * 4),
    ]
}

fn f32_bytes(n: usize) -> u64 {
    (n * std::mem::size_of::<f32>()) as u64
}

impl SpmvPipeline {
    pub fn new(gpu: GpuDevice, table: &PrimeTable) -> Result<Self> {
        if table.len() > MAX_SHARED_PRIMES {
            return Err(EngineError::Device(format!(
                "prime table of {} entries exceeds shared-memory capacity {MAX_SHARED_PRIMES}",
                table.len()
            )));
        }
        let shared_bytes = (MAX_SHARED_PRIMES * 4) as u32;
        if shared_bytes > gpu.limits.max_compute_workgroup_storage_size {
            return Err(EngineError::Device(format!(
                "device offers {} bytes of workgroup storage, kernel needs {shared_bytes}",
                gpu.limits.max_compute_workgroup_storage_size
            )));
        }

        let source = SHADER_SRC.replace("__MAX_PRIMES__", &MAX_SHARED_PRIMES.to_string());
        let (pipeline, layout, primes) = gpu.scoped("spmv pipeline", |device| {
            let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("mdcsr_spmv"),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            });

            let entries: Vec<wgpu::BindGroupLayoutEntry> = (0..8)
                .map(|binding| wgpu::BindGroupLayoutEntry {
                    binding,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: match binding {
                            0 => wgpu::BufferBindingType::Uniform,
                            7 => wgpu::BufferBindingType::Storage { read_only: false },
                            _ => wgpu::BufferBindingType::Storage { read_only: true },
                        },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                })
                .collect();
            let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("mdcsr_spmv_layout"),
                entries: &entries,
            });

            let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("mdcsr_spmv_pipeline_layout"),
                bind_group_layouts: &[&layout],
                push_constant_ranges: &[],
            });

            let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some("mdcsr_spmv_pipeline"),
                layout: Some(&pipeline_layout),
                module: &module,
                entry_point: Some("main"),
                compilation_options: Default::default(),
                cache: None,
            });

            let primes = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("mdcsr_primes"),
                contents: bytemuck::cast_slice(table.values()),
                usage: wgpu::BufferUsages::STORAGE,
            });
            Ok((pipeline, layout, primes))
        })?;

        Ok(Self {
            n_primes: table.len() as u32,
            gpu,
            pipeline,
            layout,
            primes,
            cache: Mutex::new(DeviceCache::default()),
            submit: Mutex::new(()),
        })
    }

    pub fn gpu(&self) -> &GpuDevice {
        &self.gpu
    }

    pub fn adapter_name(&self) -> &str {
        &self.gpu.name
    }

    pub fn cached_matrices(&self) -> usize {
        self.cache.lock().map(|c| c.matrices.len()).unwrap_or(0)
    }

    /// Serialises scoped regions. Hold it across uploads and submissions.
    pub fn lock_submit(&self) -> Result<MutexGuard<'_, ()>> {
        self.submit
            .lock()
            .map_err(|_| EngineError::Device("submit lock poisoned".into()))
    }

    fn lock_cache(&self) -> Result<MutexGuard<'_, DeviceCache>> {
        self.cache
            .lock()
            .map_err(|_| EngineError::Device("buffer cache poisoned".into()))
    }

    /// Drop every cached buffer that belongs to `model`. Returns how many
    /// tensors were released.
    pub fn evict_model(&self, model: u64) -> usize {
        let Ok(mut cache) = self.cache.lock() else {
            return 0;
        };
        let before = cache.matrices.len() + cache.vectors.len();
        cache.matrices.retain(|&k, _| cache_key_owner(k) != model);
        cache.vectors.retain(|&k, _| cache_key_owner(k) != model);
        before - cache.matrices.len() - cache.vectors.len()
    }

    /// Device copy of `m`, from the cache when `key` is set. Callers hold
    /// the submit lock.
    pub fn matrix_buffers(&self, m: &SparseMatrix<'_>, key: Option<u64>) -> Result<Arc<GpuMatrix>> {
        if let Some(k) = key {
            if let Some(hit) = self.lock_cache()?.matrices.get(&k) {
                if hit.rows == m.rows() && hit.cols == m.cols() {
                    return Ok(Arc::clone(hit));
                }
            }
        }

        let what = format!("{}x{} matrix", m.rows(), m.cols());
        check_bindings(&what, &matrix_bytes(m), self.gpu.max_binding())?;
        let uploaded = Arc::new(self.gpu.scoped(&what, |device| Ok(Self::upload(device, m)))?);
        if let Some(k) = key {
            self.lock_cache()?.matrices.insert(k, Arc::clone(&uploaded));
            debug!(key = k, nnz = m.nnz(), "[accel] cached matrix upload");
        }
        Ok(uploaded)
    }

    /// Device copy of a dense vector, cached under `key`. Callers hold the
    /// submit lock.
    pub fn vector_buffer(&self, data: &[f32], key: u64) -> Result<Arc<wgpu::Buffer>> {
        if let Some(hit) = self.lock_cache()?.vectors.get(&key) {
            if hit.size() == f32_bytes(data.len().max(1)) {
                return Ok(Arc::clone(hit));
            }
        }
        let bytes = f32_bytes(data.len().max(1));
        check_bindings("dense vector", &[("vector", bytes)], self.gpu.max_binding())?;
        let contents: &[f32] = if data.is_empty() { &[0.0] } else { data };
        let buf = Arc::new(self.gpu.scoped("vector upload", |device| {
            Ok(device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("mdcsr_vector"),
                contents: bytemuck::cast_slice(contents),
                usage: wgpu::BufferUsages::STORAGE,
            }))
        })?);
        self.lock_cache()?.vectors.insert(key, Arc::clone(&buf));
        Ok(buf)
    }

    fn upload(device: &wgpu::Device, m: &SparseMatrix<'_>) -> GpuMatrix {
        let mut value_bytes: Vec<u8> = bytemuck::cast_slice(m.values()).to_vec();
        value_bytes.resize(value_bytes.len().div_ceil(4).max(1) * 4, 0);

        let mut packed: Vec<u32> = m
            .delta_indices()
            .iter()
            .zip(m.manifold_indices())
            .map(|(&d, &c)| d as u32 | ((c as u32) << 16))
            .collect();
        if packed.is_empty() {
            packed.push(0);
        }
        let mut scales = m.scales().to_vec();
        if scales.is_empty() {
            scales.push(1.0);
        }

        let storage = |label: &str, contents: &[u8]| {
            device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents,
                usage: wgpu::BufferUsages::STORAGE,
            })
        };

        GpuMatrix {
            rows: m.rows(),
            cols: m.cols(),
            values: storage("mdcsr_values", &value_bytes),
            packed: storage("mdcsr_packed", bytemuck::cast_slice(&packed)),
            row_ptr: storage("mdcsr_row_ptr", bytemuck::cast_slice(m.row_pointers())),
            scales: storage("mdcsr_scales", bytemuck::cast_slice(&scales)),
        }
    }

    /// Record one product. Nothing runs until the encoder is submitted.
    pub fn encode(
        &self,
        device: &wgpu::Device,
        encoder: &mut wgpu::CommandEncoder,
        op: SpmvOp<'_>,
    ) -> Result<()> {
        let m = op.matrix;
        if m.rows == 0 || op.batch == 0 {
            return Ok(());
        }
        let max_groups = self.gpu.limits.max_compute_workgroups_per_dimension as usize;
        let groups_x = m.rows.div_ceil(WORKGROUP_SIZE as usize);
        if groups_x > max_groups || op.batch > max_groups {
            return Err(EngineError::Device(format!(
                "dispatch {groups_x}x{} exceeds device limit {max_groups}",
                op.batch
            )));
        }
        let params = Params {
            rows: m.rows as u32,
            cols: m.cols as u32,
            batch: op.batch as u32,
            n_primes: self.n_primes,
            x_offset: op.x_offset as u32,
            y_offset: op.y_offset as u32,
            accumulate: op.accumulate as u32,
            _pad: 0,
        };
        let params_buf = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("mdcsr_params"),
            contents: bytemuck::bytes_of(&params),
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("mdcsr_spmv_bind_group"),
            layout: &self.layout,
            entries: &[
                wgpu::BindGroupEntry { binding: 0, resource: params_buf.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 1, resource: m.values.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 2, resource: m.packed.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 3, resource: m.row_ptr.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 4, resource: m.scales.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 5, resource: self.primes.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 6, resource: op.x.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 7, resource: op.y.as_entire_binding() },
            ],
        });

        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("mdcsr_spmv_pass"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&self.pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.dispatch_workgroups(groups_x as u32, op.batch as u32, 1);
        Ok(())
    }

    /// Encode all jobs, submit once, wait once, read every output back.
    pub fn dispatch(&self, jobs: &[DeviceJob<'_>]) -> Result<Vec<Vec<f32>>> {
        let _submit = self.lock_submit()?;
        let limit = self.gpu.max_binding();

        let mut matrices = Vec::with_capacity(jobs.len());
        for job in jobs {
            let m = job.matrix;
            if job.x.len() != m.cols() * job.batch {
                return Err(EngineError::shape("spmv input", m.cols() * job.batch, job.x.len()));
            }
            check_bindings(
                "spmv job",
                &[
                    ("x", f32_bytes(job.x.len().max(1))),
                    ("y", f32_bytes((m.rows() * job.batch).max(1))),
                ],
                limit,
            )?;
            matrices.push(self.matrix_buffers(m, job.cache_key)?);
        }

        self.gpu.scoped("spmv dispatch", |device| {
            struct Pending {
                out_len: usize,
                staging: wgpu::Buffer,
            }

            let mut pending = Vec::with_capacity(jobs.len());
            let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("mdcsr_spmv_encoder"),
            });

            for (job, gm) in jobs.iter().zip(&matrices) {
                let out_len = gm.rows * job.batch;
                if out_len == 0 {
                    pending.push(None);
                    continue;
                }
                let x_contents: &[f32] = if job.x.is_empty() { &[0.0] } else { job.x };
                let x_buf = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("mdcsr_x"),
                    contents: bytemuck::cast_slice(x_contents),
                    usage: wgpu::BufferUsages::STORAGE,
                });
                let out_bytes = f32_bytes(out_len);
                let out_buf = device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some("mdcsr_y"),
                    size: out_bytes,
                    usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
                    mapped_at_creation: false,
                });
                let staging = device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some("mdcsr_y_staging"),
                    size: out_bytes,
                    usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                    mapped_at_creation: false,
                });

                self.encode(
                    device,
                    &mut encoder,
                    SpmvOp {
                        matrix: gm,
                        x: &x_buf,
                        x_offset: 0,
                        y: &out_buf,
                        y_offset: 0,
                        batch: job.batch,
                        accumulate: false,
                    },
                )?;
                encoder.copy_buffer_to_buffer(&out_buf, 0, &staging, 0, out_bytes);
                pending.push(Some(Pending { out_len, staging }));
            }

            self.gpu.queue.submit(std::iter::once(encoder.finish()));

            let (tx, rx) = mpsc::channel();
            for (i, p) in pending.iter().enumerate() {
                if let Some(p) = p {
                    let tx = tx.clone();
                    p.staging
                        .slice(..)
                        .map_async(wgpu::MapMode::Read, move |res| {
                            let _ = tx.send((i, res));
                        });
                }
            }
            drop(tx);
            device.poll(wgpu::Maintain::Wait);

            let expected = pending.iter().flatten().count();
            let mut mapped = 0;
            while let Ok((i, res)) = rx.try_recv() {
                res.map_err(|e| EngineError::Device(format!("readback of job {i}: {e}")))?;
                mapped += 1;
            }
            if mapped != expected {
                return Err(EngineError::Device(format!(
                    "readback incomplete: {mapped} of {expected} buffers mapped"
                )));
            }

            let mut results = Vec::with_capacity(jobs.len());
            for p in pending {
                match p {
                    None => results.push(Vec::new()),
                    Some(p) => {
                        let slice = p.staging.slice(..);
                        let data = slice.get_mapped_range();
                        let out: Vec<f32> = bytemuck::cast_slice(&data[..p.out_len * 4]).to_vec();
                        drop(data);
                        p.staging.unmap();
                        results.push(out);
                    }
                }
            }
            Ok(results)
        })
    }
}
