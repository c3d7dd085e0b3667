// =============================================================================
// accel/layer.rs — One transformer layer as one command buffer
// =============================================================================
//
// Per layer the host writes x (and any cached K/V rows the device copy has
// not seen), then records:
//
//   rmsnorm → Wq,Wk,Wv into qkv → rope(q, k) → copy k,v into the device
//   cache → attention → x += Wo·att → rmsnorm → W_gate,W_up into ffn →
//   swiglu → x += W_down·ffn → copy x and k,v to staging
//
// submits once and maps the staging buffer once. The host KvCache stays
// authoritative: the k,v rows read back are staged there like on the CPU
// path, and the device copy only mirrors rows below the cursor, which never
// change.
// =============================================================================

use std::sync::mpsc;

use bytemuck::{Pod, Zeroable};
use wgpu::util::DeviceExt;

use crate::engine::LayerStep;
use crate::error::{EngineError, Result};
use crate::kv_cache::KvCache;
use crate::model::{ModelConfig, TensorKind};
use crate::tensor::RopeTable;

use super::device::{check_bindings, GpuDevice};
use super::spmv::{GpuMatrix, SpmvOp, SpmvPipeline, WORKGROUP_SIZE};

const RMSNORM_SRC: &str = include_str!("shaders/rmsnorm.wgsl");
const ROPE_SRC: &str = include_str!("shaders/rope.wgsl");
const ATTENTION_SRC: &str = include_str!("shaders/attention.wgsl");
const SWIGLU_SRC: &str = include_str!("shaders/swiglu.wgsl");

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct NormParams {
    n: u32,
    eps: f32,
    _pad: [u32; 2],
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct RopeParams {
    pairs: u32,
    half: u32,
    pos: u32,
    _pad: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct AttentionParams {
    head_dim: u32,
    len: u32,
    slot_base: u32,
    capacity: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct SwigluParams {
    n: u32,
    _pad: [u32; 3],
}

fn bytes(floats: usize) -> u64 {
    (floats * std::mem::size_of::<f32>()) as u64
}

/// The dense stages around the sparse projections.
pub(crate) struct LayerPipelines {
    rmsnorm: wgpu::ComputePipeline,
    rope: wgpu::ComputePipeline,
    attention: wgpu::ComputePipeline,
    swiglu: wgpu::ComputePipeline,
}

impl LayerPipelines {
    pub fn new(gpu: &GpuDevice) -> Result<Self> {
        gpu.scoped("layer pipelines", |device| {
            let build = |label: &str, src: &str| {
                let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
                    label: Some(label),
                    source: wgpu::ShaderSource::Wgsl(src.into()),
                });
                device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                    label: Some(label),
                    layout: None,
                    module: &module,
                    entry_point: Some("main"),
                    compilation_options: Default::default(),
                    cache: None,
                })
            };
            Ok(Self {
                rmsnorm: build("mdcsr_rmsnorm", RMSNORM_SRC),
                rope: build("mdcsr_rope", ROPE_SRC),
                attention: build("mdcsr_attention", ATTENTION_SRC),
                swiglu: build("mdcsr_swiglu", SWIGLU_SRC),
            })
        })
    }

    fn pass(
        device: &wgpu::Device,
        encoder: &mut wgpu::CommandEncoder,
        pipeline: &wgpu::ComputePipeline,
        params: &[u8],
        buffers: &[&wgpu::Buffer],
        groups: u32,
    ) {
        let params_buf = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("mdcsr_layer_params"),
            contents: params,
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let mut entries = vec![wgpu::BindGroupEntry {
            binding: 0,
            resource: params_buf.as_entire_binding(),
        }];
        for (i, buf) in buffers.iter().enumerate() {
            entries.push(wgpu::BindGroupEntry {
                binding: i as u32 + 1,
                resource: buf.as_entire_binding(),
            });
        }
        let layout = pipeline.get_bind_group_layout(0);
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("mdcsr_layer_bind_group"),
            layout: &layout,
            entries: &entries,
        });
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("mdcsr_layer_pass"),
            timestamp_writes: None,
        });
        pass.set_pipeline(pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.dispatch_workgroups(groups, 1, 1);
    }
}

/// Device buffers one session reuses for every layer and step.
pub(crate) struct LayerWorkspace {
    dim: usize,
    hidden: usize,
    n_heads: usize,
    head_dim: usize,
    capacity: usize,
    x: wgpu::Buffer,
    xb: wgpu::Buffer,
    /// q | k | v
    qkv: wgpu::Buffer,
    att: wgpu::Buffer,
    /// gate | up
    ffn: wgpu::Buffer,
    keys: wgpu::Buffer,
    values: wgpu::Buffer,
    scores: wgpu::Buffer,
    rope_cos: wgpu::Buffer,
    rope_sin: wgpu::Buffer,
    /// x | k | v read back after each layer
    staging: wgpu::Buffer,
    /// Per layer: cached positions already mirrored on the device.
    synced: Vec<usize>,
}

impl LayerWorkspace {
    pub fn new(gpu: &GpuDevice, cfg: &ModelConfig, rope: &RopeTable, capacity: usize) -> Result<Self> {
        let (dim, hidden) = (cfg.dim, cfg.hidden_dim);
        let cache_floats = cfg.n_layers * cfg.n_heads * capacity * cfg.head_dim;
        check_bindings(
            "layer workspace",
            &[
                ("kv cache", bytes(cache_floats)),
                ("scores", bytes(cfg.n_heads * capacity)),
                ("rope table", bytes(rope.cos_table().len())),
                ("ffn", bytes(2 * hidden)),
                ("qkv", bytes(3 * dim)),
            ],
            gpu.max_binding(),
        )?;
        let max_groups = gpu.limits.max_compute_workgroups_per_dimension as usize;
        if cfg.n_heads > max_groups {
            return Err(EngineError::Device(format!(
                "{} heads exceed the device's {max_groups} workgroups per dimension",
                cfg.n_heads
            )));
        }

        use wgpu::BufferUsages as U;
        gpu.scoped("layer workspace", |device| {
            let empty = |label: &str, floats: usize, usage: U| {
                device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some(label),
                    size: bytes(floats.max(1)),
                    usage,
                    mapped_at_creation: false,
                })
            };
            let table = |label: &str, data: &[f32]| {
                let data: &[f32] = if data.is_empty() { &[0.0] } else { data };
                device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some(label),
                    contents: bytemuck::cast_slice(data),
                    usage: U::STORAGE,
                })
            };
            Ok(Self {
                dim,
                hidden,
                n_heads: cfg.n_heads,
                head_dim: cfg.head_dim,
                capacity,
                x: empty("mdcsr_ws_x", dim, U::STORAGE | U::COPY_DST | U::COPY_SRC),
                xb: empty("mdcsr_ws_xb", dim, U::STORAGE),
                qkv: empty("mdcsr_ws_qkv", 3 * dim, U::STORAGE | U::COPY_SRC),
                att: empty("mdcsr_ws_att", dim, U::STORAGE),
                ffn: empty("mdcsr_ws_ffn", 2 * hidden, U::STORAGE),
                keys: empty("mdcsr_ws_keys", cache_floats, U::STORAGE | U::COPY_DST),
                values: empty("mdcsr_ws_values", cache_floats, U::STORAGE | U::COPY_DST),
                scores: empty("mdcsr_ws_scores", cfg.n_heads * capacity, U::STORAGE),
                rope_cos: table("mdcsr_ws_rope_cos", rope.cos_table()),
                rope_sin: table("mdcsr_ws_rope_sin", rope.sin_table()),
                staging: empty("mdcsr_ws_staging", 3 * dim, U::MAP_READ | U::COPY_DST),
                synced: vec![0; cfg.n_layers],
            })
        })
    }

    /// Byte offset of cache row (layer, head, pos).
    fn row_offset(&self, layer: usize, head: usize, pos: usize) -> u64 {
        bytes(((layer * self.n_heads + head) * self.capacity + pos) * self.head_dim)
    }

    /// Upload committed rows `[synced, pos)` of `layer` the device has not
    /// mirrored yet.
    fn sync_history(&self, queue: &wgpu::Queue, kv: &KvCache, layer: usize, pos: usize) -> Result<()> {
        let from = self.synced[layer].min(pos);
        if from == pos {
            return Ok(());
        }
        for h in 0..self.n_heads {
            let view = kv.read_range(layer, h, from, pos)?;
            let at = self.row_offset(layer, h, from);
            queue.write_buffer(&self.keys, at, bytemuck::cast_slice(view.keys()));
            queue.write_buffer(&self.values, at, bytemuck::cast_slice(view.values()));
        }
        Ok(())
    }

    fn read_back(&self, device: &wgpu::Device) -> Result<Vec<f32>> {
        let slice = self.staging.slice(..);
        let (tx, rx) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |res| {
            let _ = tx.send(res);
        });
        device.poll(wgpu::Maintain::Wait);
        match rx.try_recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(EngineError::Device(format!("layer readback: {e}"))),
            Err(_) => return Err(EngineError::Device("layer readback never completed".into())),
        }
        let data = slice.get_mapped_range();
        let out: Vec<f32> = bytemuck::cast_slice(&data).to_vec();
        drop(data);
        self.staging.unmap();
        Ok(out)
    }
}

/// Run one layer on the device. Same contract as the CPU layer: `x` in and
/// out of `scratch.x`, K/V for `pos` staged in the host cache.
pub(crate) fn forward_layer(
    spmv: &SpmvPipeline,
    pipes: &LayerPipelines,
    step: LayerStep<'_>,
) -> Result<()> {
    let LayerStep {
        model,
        weights: w,
        rope,
        pos,
        kv,
        scratch: s,
    } = step;
    let cfg = model.config();
    let gpu = spmv.gpu();
    let layer = w.index;
    let key = |kind: TensorKind| model.cache_key(Some(layer), kind);

    let _submit = spmv.lock_submit()?;
    if s.device.is_none() {
        s.device = Some(LayerWorkspace::new(gpu, cfg, rope, kv.capacity())?);
    }
    let ws = s
        .device
        .as_mut()
        .ok_or_else(|| EngineError::Device("layer workspace missing".into()))?;

    let wq = spmv.matrix_buffers(&w.wq, Some(key(TensorKind::Wq)))?;
    let wk = spmv.matrix_buffers(&w.wk, Some(key(TensorKind::Wk)))?;
    let wv = spmv.matrix_buffers(&w.wv, Some(key(TensorKind::Wv)))?;
    let wo = spmv.matrix_buffers(&w.wo, Some(key(TensorKind::Wo)))?;
    let w_gate = spmv.matrix_buffers(&w.w_gate, Some(key(TensorKind::WGate)))?;
    let w_up = spmv.matrix_buffers(&w.w_up, Some(key(TensorKind::WUp)))?;
    let w_down = spmv.matrix_buffers(&w.w_down, Some(key(TensorKind::WDown)))?;
    let attn_norm = spmv.vector_buffer(w.attn_norm, key(TensorKind::AttnNorm))?;
    let ffn_norm = spmv.vector_buffer(w.ffn_norm, key(TensorKind::FfnNorm))?;

    let (dim, hidden, hd) = (ws.dim, ws.hidden, ws.head_dim);
    let groups = |n: usize| n.div_ceil(WORKGROUP_SIZE as usize).max(1) as u32;
    let norm = NormParams {
        n: dim as u32,
        eps: cfg.norm_eps,
        _pad: [0; 2],
    };

    let out = gpu.scoped("layer dispatch", |device| {
        ws.sync_history(&gpu.queue, kv, layer, pos)?;
        gpu.queue.write_buffer(&ws.x, 0, bytemuck::cast_slice(&s.x));

        let mut enc = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("mdcsr_layer_encoder"),
        });
        let project = |enc: &mut wgpu::CommandEncoder,
                       matrix: &GpuMatrix,
                       x: &wgpu::Buffer,
                       y: &wgpu::Buffer,
                       y_offset: usize,
                       accumulate: bool| {
            spmv.encode(
                device,
                enc,
                SpmvOp {
                    matrix,
                    x,
                    x_offset: 0,
                    y,
                    y_offset,
                    batch: 1,
                    accumulate,
                },
            )
        };

        // ─── attention ───
        LayerPipelines::pass(
            device,
            &mut enc,
            &pipes.rmsnorm,
            bytemuck::bytes_of(&norm),
            &[&ws.x, &attn_norm, &ws.xb],
            1,
        );
        project(&mut enc, &*wq, &ws.xb, &ws.qkv, 0, false)?;
        project(&mut enc, &*wk, &ws.xb, &ws.qkv, dim, false)?;
        project(&mut enc, &*wv, &ws.xb, &ws.qkv, 2 * dim, false)?;
        let rope_params = RopeParams {
            pairs: dim as u32,
            half: (hd / 2) as u32,
            pos: pos as u32,
            _pad: 0,
        };
        LayerPipelines::pass(
            device,
            &mut enc,
            &pipes.rope,
            bytemuck::bytes_of(&rope_params),
            &[&ws.rope_cos, &ws.rope_sin, &ws.qkv],
            groups(dim),
        );
        for h in 0..ws.n_heads {
            let at = ws.row_offset(layer, h, pos);
            enc.copy_buffer_to_buffer(&ws.qkv, bytes(dim + h * hd), &ws.keys, at, bytes(hd));
            enc.copy_buffer_to_buffer(&ws.qkv, bytes(2 * dim + h * hd), &ws.values, at, bytes(hd));
        }
        let att_params = AttentionParams {
            head_dim: hd as u32,
            len: (pos + 1) as u32,
            slot_base: (layer * ws.n_heads) as u32,
            capacity: ws.capacity as u32,
        };
        LayerPipelines::pass(
            device,
            &mut enc,
            &pipes.attention,
            bytemuck::bytes_of(&att_params),
            &[&ws.qkv, &ws.keys, &ws.values, &ws.scores, &ws.att],
            ws.n_heads as u32,
        );
        project(&mut enc, &*wo, &ws.att, &ws.x, 0, true)?;

        // ─── gated feed-forward ───
        LayerPipelines::pass(
            device,
            &mut enc,
            &pipes.rmsnorm,
            bytemuck::bytes_of(&norm),
            &[&ws.x, &ffn_norm, &ws.xb],
            1,
        );
        project(&mut enc, &*w_gate, &ws.xb, &ws.ffn, 0, false)?;
        project(&mut enc, &*w_up, &ws.xb, &ws.ffn, hidden, false)?;
        let swiglu_params = SwigluParams {
            n: hidden as u32,
            _pad: [0; 3],
        };
        LayerPipelines::pass(
            device,
            &mut enc,
            &pipes.swiglu,
            bytemuck::bytes_of(&swiglu_params),
            &[&ws.ffn],
            groups(hidden),
        );
        project(&mut enc, &*w_down, &ws.ffn, &ws.x, 0, true)?;

        enc.copy_buffer_to_buffer(&ws.x, 0, &ws.staging, 0, bytes(dim));
        enc.copy_buffer_to_buffer(&ws.qkv, bytes(dim), &ws.staging, bytes(dim), bytes(2 * dim));
        gpu.queue.submit(std::iter::once(enc.finish()));
        ws.read_back(device)
    })?;

    let (x, kv_rows) = out.split_at(dim);
    let (k, v) = kv_rows.split_at(dim);
    s.x.copy_from_slice(x);
    for (h, (kh, vh)) in k.chunks_exact(hd).zip(v.chunks_exact(hd)).enumerate() {
        kv.write(layer, h, pos, kh, vh)?;
    }
    ws.synced[layer] = ws.synced[layer].max(pos + 1);
    Ok(())
}
