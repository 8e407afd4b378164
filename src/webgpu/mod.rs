//! WebGPU (wgpu) backend.
//!
//! [`WebGpuSurface`] runs the kernel set on Vulkan, Metal, DX12 or a
//! browser WebGPU implementation. WGSL has no dynamically sized
//! workgroup memory, so each kernel is compiled once per work-group size
//! (the host prepends `const WG: u32 = <size>u;`) and the pipelines are
//! cached. `KernelArg::Local` sizes are ignored; the shaders declare
//! their scratch statically.
//!
//! Kernel arguments map onto bindings positionally: buffers take
//! bindings `0..k`, and up to four scalars travel in a uniform at
//! binding `k` together with the dispatch tiling.
//!
//! # Feature Gate
//!
//! This module is only available when compiled with the `webgpu` feature:
//! ```bash
//! cargo build --features webgpu
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! # #[cfg(feature = "webgpu")]
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! use std::sync::Arc;
//! use clpp::webgpu::WebGpuSurface;
//! use clpp::{RadixSortEngine, SortConfig, SurfaceOptions};
//!
//! let surface = Arc::new(WebGpuSurface::new(SurfaceOptions::default())?);
//! let mut sorter = RadixSortEngine::new(surface, SortConfig::new(1 << 20))?;
//! let mut keys = vec![3, 1, 2];
//! sorter.push_keys(&keys)?;
//! sorter.sort()?;
//! sorter.pop_keys(&mut keys)?;
//! assert_eq!(keys, vec![1, 2, 3]);
//! # Ok(())
//! # }
//! ```

use crate::config::{KernelSource, SurfaceOptions, MAX_AUTO_WORK_GROUP_SIZE};
use crate::surface::{
    DeviceSurface, KernelArg, KernelName, STATUS_INVALID_GLOBAL_WORK_SIZE,
    STATUS_INVALID_KERNEL_ARGS, STATUS_INVALID_VALUE, STATUS_INVALID_WORK_GROUP_SIZE,
    STATUS_OUT_OF_RESOURCES, STATUS_UNKNOWN,
};
use crate::{ClppError, ClppResult};

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use wgpu::util::DeviceExt;

#[cfg(test)]
#[path = "tests.rs"]
mod tests;

/// Embedded WGSL kernel sources, one module per kernel.
const BLOCK_SCAN_KERNEL_SOURCE: &str = include_str!("../../kernels/block_scan.wgsl");
const UNIFORM_ADD_KERNEL_SOURCE: &str = include_str!("../../kernels/uniform_add.wgsl");
const RADIX_LOCAL_KERNEL_SOURCE: &str = include_str!("../../kernels/radix_local.wgsl");
const RADIX_PERMUTE_KERNEL_SOURCE: &str = include_str!("../../kernels/radix_permute.wgsl");

/// Scalars a kernel can take (the `args` vector of the params uniform).
const MAX_SCALAR_ARGS: usize = 4;

fn embedded_source(kernel: KernelName) -> (&'static str, &'static str) {
    match kernel {
        KernelName::BlockScan => ("block_scan.wgsl", BLOCK_SCAN_KERNEL_SOURCE),
        KernelName::UniformAdd => ("uniform_add.wgsl", UNIFORM_ADD_KERNEL_SOURCE),
        KernelName::RadixLocal => ("radix_local.wgsl", RADIX_LOCAL_KERNEL_SOURCE),
        KernelName::RadixPermute => ("radix_permute.wgsl", RADIX_PERMUTE_KERNEL_SOURCE),
    }
}

/// Information about a discovered WebGPU device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Human-readable device name.
    pub name: String,
    /// Device vendor string.
    pub vendor: String,
    /// Whether this is a discrete or integrated GPU.
    pub is_gpu: bool,
    /// Maximum workgroup size.
    pub max_work_group_size: usize,
    /// Workgroup storage in bytes.
    pub local_mem_size: usize,
}

/// Probe all available WebGPU devices without creating a surface.
pub fn probe_devices() -> Vec<DeviceInfo> {
    let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
        backends: wgpu::Backends::all(),
        ..Default::default()
    });

    let adapters = instance.enumerate_adapters(wgpu::Backends::all());
    adapters
        .into_iter()
        .map(|adapter| {
            let info = adapter.get_info();
            let limits = adapter.limits();
            DeviceInfo {
                name: info.name.clone(),
                vendor: format!("{:?}", info.vendor),
                is_gpu: matches!(
                    info.device_type,
                    wgpu::DeviceType::DiscreteGpu | wgpu::DeviceType::IntegratedGpu
                ),
                max_work_group_size: limits.max_compute_workgroup_size_x as usize,
                local_mem_size: limits.max_compute_workgroup_storage_size as usize,
            }
        })
        .collect()
}

/// Return the number of available WebGPU devices.
pub fn device_count() -> usize {
    probe_devices().len()
}

/// A device buffer of `u32` words.
#[derive(Debug)]
pub struct WebGpuBuffer {
    buffer: wgpu::Buffer,
    len: usize,
}

impl WebGpuBuffer {
    /// Length in words.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// WebGPU device surface.
///
/// Create one per device and share it between engines through an `Arc`.
pub struct WebGpuSurface {
    device: wgpu::Device,
    queue: wgpu::Queue,
    /// WGSL text per kernel, indexed by `KernelName as usize`.
    sources: Vec<Cow<'static, str>>,
    /// Compiled pipelines per (kernel, work-group size).
    pipelines: Mutex<HashMap<(KernelName, usize), wgpu::ComputePipeline>>,
    /// Device name for diagnostics.
    device_name: String,
    /// Maximum compute workgroup size.
    max_work_group_size: usize,
    /// Maximum workgroups per dispatch dimension (device-queried, typically 65535).
    max_workgroups_per_dim: u32,
    /// Workgroup storage in bytes.
    local_mem_size: usize,
    /// Largest buffer the device accepts, in bytes.
    max_buffer_size: u64,
    /// Whether the selected device is a CPU (not GPU).
    is_cpu: bool,
    /// Log wall-clock time per command at `debug` level.
    profiling: bool,
}

impl std::fmt::Debug for WebGpuSurface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebGpuSurface")
            .field("device_name", &self.device_name)
            .field("max_work_group_size", &self.max_work_group_size)
            .field("local_mem_size", &self.local_mem_size)
            .finish_non_exhaustive()
    }
}

impl WebGpuSurface {
    /// Select an adapter, create the device and check that every kernel
    /// compiles.
    ///
    /// Software adapters are rejected when `prefer_gpu` is set. Returns
    /// [`ClppError::Unsupported`] when no adapter is usable, and
    /// [`ClppError::ConfigError`] when kernel sources cannot be read or
    /// do not compile.
    pub fn new(options: SurfaceOptions) -> ClppResult<Self> {
        let sources = KernelName::ALL
            .iter()
            .map(|&kernel| {
                let (file, embedded) = embedded_source(kernel);
                options.kernel_source.load(file, embedded)
            })
            .collect::<ClppResult<Vec<_>>>()?;

        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let power_pref = if options.prefer_gpu {
            wgpu::PowerPreference::HighPerformance
        } else {
            wgpu::PowerPreference::None
        };

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: power_pref,
            force_fallback_adapter: false,
            compatible_surface: None,
        }))
        .map_err(|_| ClppError::Unsupported)?;

        let info = adapter.get_info();
        let is_cpu = matches!(info.device_type, wgpu::DeviceType::Cpu);

        // Reject software/CPU adapters (e.g. WARP on Windows) when a real GPU
        // was requested.
        if options.prefer_gpu && is_cpu {
            return Err(ClppError::Unsupported);
        }

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("clpp-webgpu"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::downlevel_defaults(),
            memory_hints: wgpu::MemoryHints::Performance,
            experimental_features: wgpu::ExperimentalFeatures::disabled(),
            trace: wgpu::Trace::Off,
        }))
        .map_err(|_| ClppError::Unsupported)?;

        let limits = device.limits();
        let max_work_group_size = limits
            .max_compute_workgroup_size_x
            .min(limits.max_compute_invocations_per_workgroup) as usize;
        let max_buffer_size = limits
            .max_buffer_size
            .min(u64::from(limits.max_storage_buffer_binding_size));

        let surface = WebGpuSurface {
            device,
            queue,
            sources,
            pipelines: Mutex::new(HashMap::new()),
            device_name: info.name.clone(),
            max_work_group_size,
            max_workgroups_per_dim: limits.max_compute_workgroups_per_dimension,
            local_mem_size: limits.max_compute_workgroup_storage_size as usize,
            max_buffer_size,
            is_cpu,
            profiling: options.profiling,
        };

        // Smoke-test: compile every kernel at the default size so source
        // errors surface here rather than on the first launch.
        let capped = max_work_group_size.clamp(1, MAX_AUTO_WORK_GROUP_SIZE);
        let wg = 1 << (usize::BITS - 1 - capped.leading_zeros());
        for kernel in KernelName::ALL {
            if let Err(msg) = surface.pipeline(kernel, wg) {
                return Err(match options.kernel_source {
                    KernelSource::Directory(_) => ClppError::ConfigError(msg),
                    KernelSource::Embedded => {
                        log::warn!("webgpu: {msg}");
                        ClppError::Unsupported
                    }
                });
            }
        }

        log::info!(
            "webgpu: {} (max work-group {max_work_group_size}, {} B workgroup storage)",
            surface.device_name,
            surface.local_mem_size
        );
        Ok(surface)
    }

    /// Check if the selected device is a CPU (not a GPU or accelerator).
    pub fn is_cpu_device(&self) -> bool {
        self.is_cpu
    }

    /// Whether profiling is enabled on this surface.
    pub fn profiling(&self) -> bool {
        self.profiling
    }

    /// Cached pipeline for `kernel` at work-group size `wg`, compiling it
    /// on first use.
    fn pipeline(&self, kernel: KernelName, wg: usize) -> Result<wgpu::ComputePipeline, String> {
        let mut cache = self
            .pipelines
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(pipeline) = cache.get(&(kernel, wg)) {
            return Ok(pipeline.clone());
        }

        let t0 = std::time::Instant::now();
        let source = format!("const WG: u32 = {wg}u;\n{}", self.sources[kernel as usize]);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(kernel.as_str()),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            });
        let pipeline = self
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(kernel.as_str()),
                layout: None,
                module: &module,
                entry_point: Some(kernel.as_str()),
                compilation_options: Default::default(),
                cache: None,
            });
        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(format!("kernel {kernel} (work-group {wg}): {err}"));
        }
        if self.profiling {
            let ms = t0.elapsed().as_secs_f64() * 1000.0;
            log::debug!("webgpu: compile {kernel} wg={wg}: {ms:.3} ms");
        }
        cache.insert((kernel, wg), pipeline.clone());
        Ok(pipeline)
    }

    /// Compute 2D tiling dimensions for a given workgroup count.
    fn tile_workgroups(&self, workgroups: usize) -> Option<(u32, u32)> {
        let max = self.max_workgroups_per_dim as usize;
        if workgroups <= max {
            Some((workgroups as u32, 1))
        } else {
            let wy = workgroups.div_ceil(max);
            (wy <= max).then_some((max as u32, wy as u32))
        }
    }

    fn create_raw_buffer(&self, label: &str, size: u64, usage: wgpu::BufferUsages) -> wgpu::Buffer {
        self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size,
            usage,
            mapped_at_creation: false,
        })
    }

    /// Block until submitted work completes, logging the elapsed time
    /// since `t0` when profiling.
    fn profile(&self, label: &str, t0: Option<std::time::Instant>) {
        if let Some(t0) = t0 {
            let _ = self.device.poll(wgpu::PollType::wait_indefinitely());
            let ms = t0.elapsed().as_secs_f64() * 1000.0;
            log::debug!("webgpu: {label}: {ms:.3} ms");
        }
    }

    fn profile_start(&self) -> Option<std::time::Instant> {
        self.profiling.then(std::time::Instant::now)
    }
}

impl DeviceSurface for WebGpuSurface {
    type Buffer = WebGpuBuffer;

    fn device_name(&self) -> &str {
        &self.device_name
    }

    fn max_work_group_size(&self) -> usize {
        self.max_work_group_size
    }

    fn local_mem_size(&self) -> usize {
        self.local_mem_size
    }

    fn kernel_work_group_size(&self, _kernel: KernelName) -> usize {
        self.max_work_group_size
    }

    fn create_buffer(&self, len: usize) -> ClppResult<WebGpuBuffer> {
        let fail = |status| ClppError::DeviceError {
            step: "create_buffer",
            status,
        };
        // Zero-sized storage bindings are invalid.
        let size = (len.max(1) * 4) as u64;
        if size > self.max_buffer_size {
            return Err(fail(STATUS_OUT_OF_RESOURCES));
        }
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let buffer = self.create_raw_buffer(
            "clpp_buffer",
            size,
            wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST,
        );
        if pollster::block_on(self.device.pop_error_scope()).is_some() {
            return Err(fail(STATUS_OUT_OF_RESOURCES));
        }
        Ok(WebGpuBuffer { buffer, len })
    }

    fn write_buffer(&self, buffer: &mut WebGpuBuffer, data: &[u32]) -> ClppResult<()> {
        if data.len() > buffer.len {
            return Err(ClppError::DeviceError {
                step: "write_buffer",
                status: STATUS_INVALID_VALUE,
            });
        }
        if data.is_empty() {
            return Ok(());
        }
        let t0 = self.profile_start();
        self.queue
            .write_buffer(&buffer.buffer, 0, bytemuck::cast_slice(data));
        self.profile("write_buffer", t0);
        Ok(())
    }

    fn read_buffer(&self, buffer: &WebGpuBuffer, out: &mut [u32]) -> ClppResult<()> {
        let fail = |status| ClppError::DeviceError {
            step: "read_buffer",
            status,
        };
        if out.len() > buffer.len {
            return Err(fail(STATUS_INVALID_VALUE));
        }
        if out.is_empty() {
            return Ok(());
        }
        let t0 = self.profile_start();
        let size = (out.len() * 4) as u64;
        let staging = self.create_raw_buffer(
            "staging",
            size,
            wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        );

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("read_buffer"),
            });
        encoder.copy_buffer_to_buffer(&buffer.buffer, 0, &staging, 0, size);
        self.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.device
            .poll(wgpu::PollType::wait_indefinitely())
            .map_err(|_| fail(STATUS_UNKNOWN))?;
        rx.recv()
            .map_err(|_| fail(STATUS_UNKNOWN))?
            .map_err(|_| fail(STATUS_UNKNOWN))?;

        {
            let data = slice.get_mapped_range();
            for (word, bytes) in out.iter_mut().zip(data.chunks_exact(4)) {
                *word = u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            }
        }
        staging.unmap();
        self.profile("read_buffer", t0);
        Ok(())
    }

    fn copy_buffer(&self, src: &WebGpuBuffer, dst: &mut WebGpuBuffer, len: usize) -> ClppResult<()> {
        if len > src.len || len > dst.len {
            return Err(ClppError::DeviceError {
                step: "copy_buffer",
                status: STATUS_INVALID_VALUE,
            });
        }
        if len == 0 {
            return Ok(());
        }
        let t0 = self.profile_start();
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("copy_buffer"),
            });
        encoder.copy_buffer_to_buffer(&src.buffer, 0, &dst.buffer, 0, (len * 4) as u64);
        self.queue.submit(Some(encoder.finish()));
        self.profile("copy_buffer", t0);
        Ok(())
    }

    fn launch(
        &self,
        kernel: KernelName,
        args: &[KernelArg<'_, WebGpuBuffer>],
        global: usize,
        local: usize,
    ) -> ClppResult<()> {
        let step = kernel.as_str();
        let fail = |status| ClppError::DeviceError { step, status };
        if local == 0 || local > self.max_work_group_size {
            return Err(fail(STATUS_INVALID_WORK_GROUP_SIZE));
        }
        if global == 0 || global % local != 0 {
            return Err(fail(STATUS_INVALID_GLOBAL_WORK_SIZE));
        }
        let groups = global / local;
        let (wx, wy) = self
            .tile_workgroups(groups)
            .ok_or(fail(STATUS_INVALID_GLOBAL_WORK_SIZE))?;

        let mut buffers = Vec::new();
        let mut scalars = Vec::new();
        for arg in args {
            match arg {
                KernelArg::Buffer(b) => buffers.push(&b.buffer),
                KernelArg::Uint(v) => scalars.push(*v),
                KernelArg::Local(_) => {}
            }
        }
        if scalars.len() > MAX_SCALAR_ARGS {
            return Err(fail(STATUS_INVALID_KERNEL_ARGS));
        }
        // params = { args: vec4<u32>, grid: vec4<u32> }
        let mut params = [0u32; 8];
        params[..scalars.len()].copy_from_slice(&scalars);
        params[4] = groups as u32;
        params[5] = wx;

        let pipeline = self.pipeline(kernel, local).map_err(|msg| {
            log::error!("webgpu: {msg}");
            fail(STATUS_UNKNOWN)
        })?;

        let t0 = self.profile_start();
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let params_buf = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("params"),
                contents: bytemuck::cast_slice(&params),
                usage: wgpu::BufferUsages::UNIFORM,
            });
        buffers.push(&params_buf);
        let entries: Vec<wgpu::BindGroupEntry<'_>> = buffers
            .iter()
            .enumerate()
            .map(|(binding, buffer)| wgpu::BindGroupEntry {
                binding: binding as u32,
                resource: buffer.as_entire_binding(),
            })
            .collect();
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(step),
            layout: &pipeline.get_bind_group_layout(0),
            entries: &entries,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(step) });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(step),
                timestamp_writes: None,
            });
            pass.set_pipeline(&pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(wx, wy, 1);
        }
        self.queue.submit(Some(encoder.finish()));
        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            log::error!("webgpu: {step}: {err}");
            return Err(fail(STATUS_UNKNOWN));
        }
        log::trace!("webgpu: {kernel} groups={groups} ({wx}x{wy}) local={local}");
        self.profile(step, t0);
        Ok(())
    }

    fn finish(&self) -> ClppResult<()> {
        self.device
            .poll(wgpu::PollType::wait_indefinitely())
            .map_err(|_| ClppError::DeviceError {
                step: "finish",
                status: STATUS_UNKNOWN,
            })?;
        Ok(())
    }
}
