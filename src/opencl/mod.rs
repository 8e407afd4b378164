//! OpenCL backend.
//!
//! [`OpenClSurface`] owns a context, one in-order command queue and the
//! program built from `kernels/scan.cl` and `kernels/radix_sort.cl`.
//! Kernel launches are chained on the event of the previous launch;
//! transfers are blocking.
//!
//! # Feature Gate
//!
//! This module is only available when compiled with the `opencl` feature:
//! ```bash
//! cargo build --features opencl
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! # #[cfg(feature = "opencl")]
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! use std::sync::Arc;
//! use clpp::opencl::OpenClSurface;
//! use clpp::{BlockScanEngine, DeviceSurface, ScanConfig, SurfaceOptions};
//!
//! let surface = Arc::new(OpenClSurface::new(SurfaceOptions::default())?);
//! println!("Using device: {}", surface.device_name());
//!
//! let mut scan = BlockScanEngine::new(surface, ScanConfig::new(1 << 20))?;
//! scan.push(&[1, 2, 3, 4])?;
//! scan.scan()?;
//! assert_eq!(scan.pop_vec()?, vec![0, 1, 3, 6]);
//! # Ok(())
//! # }
//! ```

use crate::config::{KernelSource, SurfaceOptions};
use crate::surface::{DeviceSurface, KernelArg, KernelName, STATUS_INVALID_VALUE};
use crate::{ClppError, ClppResult};

use opencl3::command_queue::{CommandQueue, CL_QUEUE_PROFILING_ENABLE};
use opencl3::context::Context;
use opencl3::device::{get_all_devices, Device, CL_DEVICE_TYPE_ALL, CL_DEVICE_TYPE_GPU};
use opencl3::error_codes::ClError;
use opencl3::event::Event;
use opencl3::kernel::Kernel;
use opencl3::memory::{Buffer, CL_MEM_READ_WRITE};
use opencl3::program::Program;
use opencl3::types::{cl_device_type, cl_event, cl_uint, CL_BLOCKING};

use std::ptr;
use std::sync::Mutex;

/// Embedded OpenCL source: `block_scan`, `uniform_add` and the
/// `scan_inclusive` helper the sort kernels share.
const SCAN_KERNEL_SOURCE: &str = include_str!("../../kernels/scan.cl");

/// Embedded OpenCL source: `radix_local`, `radix_permute`.
const RADIX_SORT_KERNEL_SOURCE: &str = include_str!("../../kernels/radix_sort.cl");

const BUILD_OPTIONS: &str = "-Werror";

/// Information about a discovered OpenCL device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Human-readable device name (e.g. "NVIDIA GeForce RTX 3080").
    pub name: String,
    /// Device vendor string.
    pub vendor: String,
    /// Whether this is a GPU device (vs CPU or accelerator).
    pub is_gpu: bool,
    /// Maximum work-group size supported by the device.
    pub max_work_group_size: usize,
    /// Local memory per work-group in bytes.
    pub local_mem_size: u64,
    /// Global memory size in bytes.
    pub global_mem_size: u64,
}

/// Probe all available OpenCL devices without creating a surface.
///
/// Returns an empty vec if no OpenCL runtime is installed or no
/// devices are found (never errors).
pub fn probe_devices() -> Vec<DeviceInfo> {
    let device_ids = match get_all_devices(CL_DEVICE_TYPE_ALL) {
        Ok(ids) => ids,
        Err(_) => return Vec::new(),
    };

    device_ids
        .into_iter()
        .map(|id| {
            let dev = Device::new(id);
            let dev_type: cl_device_type = dev.dev_type().unwrap_or(0);
            DeviceInfo {
                name: dev.name().unwrap_or_default().trim().to_string(),
                vendor: dev.vendor().unwrap_or_default().trim().to_string(),
                is_gpu: (dev_type & CL_DEVICE_TYPE_GPU) != 0,
                max_work_group_size: dev.max_work_group_size().unwrap_or(1),
                local_mem_size: dev.local_mem_size().unwrap_or(0),
                global_mem_size: dev.global_mem_size().unwrap_or(0),
            }
        })
        .collect()
}

/// Return the number of available OpenCL devices.
///
/// Doesn't create contexts or compile kernels. Returns 0 if OpenCL is
/// not available.
pub fn device_count() -> usize {
    get_all_devices(CL_DEVICE_TYPE_ALL)
        .map(|ids| ids.len())
        .unwrap_or(0)
}

fn device_error(step: &'static str) -> impl Fn(ClError) -> ClppError {
    move |e| ClppError::DeviceError { step, status: e.0 }
}

/// A device buffer of `cl_uint` words.
pub struct OpenClBuffer {
    buffer: Buffer<cl_uint>,
    len: usize,
}

impl OpenClBuffer {
    /// Length in words.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl std::fmt::Debug for OpenClBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenClBuffer")
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

// SAFETY: cl_mem handles may be used from any thread (OpenCL 1.2+).
unsafe impl Send for OpenClBuffer {}
unsafe impl Sync for OpenClBuffer {}

/// A compiled kernel and its device-reported work-group limit.
struct CompiledKernel {
    kernel: Kernel,
    work_group_size: usize,
}

/// OpenCL device surface.
///
/// Create one per device and share it between engines through an `Arc`.
///
/// Note: `Debug` is implemented manually because the OpenCL handle
/// types from `opencl3` don't implement `Debug`.
pub struct OpenClSurface {
    _device: Device,
    context: Context,
    queue: CommandQueue,
    /// Indexed by `KernelName as usize`.
    kernels: Vec<CompiledKernel>,
    device_name: String,
    max_work_group_size: usize,
    local_mem_size: usize,
    is_cpu: bool,
    profiling: bool,
    /// Event of the most recent launch. Held locked for the whole launch,
    /// which also serializes `clSetKernelArg` on the shared kernels.
    last_event: Mutex<Option<Event>>,
}

// SAFETY: OpenCL 1.2+ guarantees thread safety for context, command queue,
// and memory objects. Kernel argument setting is not thread safe and is
// serialized by `last_event`.
unsafe impl Send for OpenClSurface {}
unsafe impl Sync for OpenClSurface {}

impl std::fmt::Debug for OpenClSurface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenClSurface")
            .field("device_name", &self.device_name)
            .field("max_work_group_size", &self.max_work_group_size)
            .field("local_mem_size", &self.local_mem_size)
            .finish_non_exhaustive()
    }
}

impl OpenClSurface {
    /// Select a device and build the kernels.
    ///
    /// With `prefer_gpu`, GPUs are tried first, largest global memory
    /// first (discrete before integrated), then every other device.
    /// Returns [`ClppError::Unsupported`] when no device can build the
    /// kernels, and [`ClppError::ConfigError`] when kernel sources cannot
    /// be read.
    pub fn new(options: SurfaceOptions) -> ClppResult<Self> {
        let scan_source = options
            .kernel_source
            .load("scan.cl", SCAN_KERNEL_SOURCE)?;
        let radix_source = options
            .kernel_source
            .load("radix_sort.cl", RADIX_SORT_KERNEL_SOURCE)?;
        let sources = [scan_source.as_ref(), radix_source.as_ref()];

        let all_ids = get_all_devices(CL_DEVICE_TYPE_ALL).map_err(|_| ClppError::Unsupported)?;
        if all_ids.is_empty() {
            return Err(ClppError::Unsupported);
        }

        let gpu_ids = if options.prefer_gpu {
            let mut ids = get_all_devices(CL_DEVICE_TYPE_GPU).unwrap_or_default();
            // Sort by global memory descending (discrete > integrated)
            ids.sort_by(|a, b| {
                let mem_a = Device::new(*a).global_mem_size().unwrap_or(0);
                let mem_b = Device::new(*b).global_mem_size().unwrap_or(0);
                mem_b.cmp(&mem_a)
            });
            ids
        } else {
            Vec::new()
        };
        let candidates: Vec<_> = gpu_ids
            .iter()
            .copied()
            .chain(all_ids.iter().copied())
            .collect();

        let queue_props = if options.profiling {
            CL_QUEUE_PROFILING_ENABLE
        } else {
            0
        };

        // Try each candidate until one creates a context and queue and
        // builds the program. Some drivers accept the first two and only
        // fail on real kernel code.
        let mut selected = None;
        let mut last_build_log = None;
        for &id in &candidates {
            let dev = Device::new(id);
            let Ok(ctx) = Context::from_device(&dev) else {
                continue;
            };
            #[allow(deprecated)]
            let Ok(queue) = CommandQueue::create_default(&ctx, queue_props) else {
                continue;
            };
            match Program::create_and_build_from_sources(&ctx, &sources, BUILD_OPTIONS) {
                Ok(program) => {
                    selected = Some((dev, ctx, queue, program));
                    break;
                }
                Err(build_log) => {
                    log::warn!(
                        "opencl: build failed on {}",
                        dev.name().unwrap_or_default().trim()
                    );
                    last_build_log = Some(build_log);
                }
            }
        }

        let Some((device, context, queue, program)) = selected else {
            // A modified kernel that no device accepts is a configuration
            // problem, not a missing device.
            return match (last_build_log, &options.kernel_source) {
                (Some(build_log), KernelSource::Directory(_)) => Err(
                    ClppError::ConfigError(format!("kernel build failed: {build_log}")),
                ),
                _ => Err(ClppError::Unsupported),
            };
        };

        let device_name = device.name().unwrap_or_default().trim().to_string();
        let max_work_group_size = device.max_work_group_size().unwrap_or(1);
        let local_mem_size = device.local_mem_size().unwrap_or(0) as usize;
        let dev_type: cl_device_type = device.dev_type().unwrap_or(0);
        let is_cpu = (dev_type & CL_DEVICE_TYPE_GPU) == 0;

        let kernels = KernelName::ALL
            .iter()
            .map(|name| {
                let kernel = Kernel::create(&program, name.as_str()).map_err(|e| {
                    ClppError::ConfigError(format!("kernel {name}: status {}", e.0))
                })?;
                let work_group_size = kernel
                    .get_work_group_size(device.id())
                    .unwrap_or(max_work_group_size);
                Ok(CompiledKernel {
                    kernel,
                    work_group_size,
                })
            })
            .collect::<ClppResult<Vec<_>>>()?;

        log::info!(
            "opencl: {device_name} (max work-group {max_work_group_size}, {local_mem_size} B local)"
        );

        Ok(OpenClSurface {
            _device: device,
            context,
            queue,
            kernels,
            device_name,
            max_work_group_size,
            local_mem_size,
            is_cpu,
            profiling: options.profiling,
            last_event: Mutex::new(None),
        })
    }

    /// Check if the selected device is a CPU (not a GPU or accelerator).
    pub fn is_cpu_device(&self) -> bool {
        self.is_cpu
    }

    /// Whether profiling is enabled on this surface.
    pub fn profiling(&self) -> bool {
        self.profiling
    }

    /// Extract elapsed time in milliseconds from a completed OpenCL event.
    ///
    /// Requires the command queue to have been created with
    /// `CL_QUEUE_PROFILING_ENABLE`.
    pub fn event_elapsed_ms(event: &Event) -> Option<f64> {
        let start = event.profiling_command_start().ok()?;
        let end = event.profiling_command_end().ok()?;
        Some((end - start) as f64 / 1_000_000.0)
    }

    /// Log timing for a completed event when profiling is enabled.
    fn profile_event(&self, label: &str, event: &Event) {
        if self.profiling && event.wait().is_ok() {
            if let Some(ms) = Self::event_elapsed_ms(event) {
                log::debug!("opencl: {label}: {ms:.3} ms");
            }
        }
    }

    fn compiled(&self, kernel: KernelName) -> &CompiledKernel {
        &self.kernels[kernel as usize]
    }

    fn lock_events(&self) -> std::sync::MutexGuard<'_, Option<Event>> {
        // A panic while holding the lock leaves at worst a stale event.
        self.last_event
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl DeviceSurface for OpenClSurface {
    type Buffer = OpenClBuffer;

    fn device_name(&self) -> &str {
        &self.device_name
    }

    fn max_work_group_size(&self) -> usize {
        self.max_work_group_size
    }

    fn local_mem_size(&self) -> usize {
        self.local_mem_size
    }

    fn kernel_work_group_size(&self, kernel: KernelName) -> usize {
        self.compiled(kernel).work_group_size
    }

    fn create_buffer(&self, len: usize) -> ClppResult<OpenClBuffer> {
        // Zero-sized buffers are invalid in OpenCL.
        let buffer = unsafe {
            Buffer::<cl_uint>::create(&self.context, CL_MEM_READ_WRITE, len.max(1), ptr::null_mut())
        }
        .map_err(device_error("create_buffer"))?;
        Ok(OpenClBuffer { buffer, len })
    }

    fn write_buffer(&self, buffer: &mut OpenClBuffer, data: &[u32]) -> ClppResult<()> {
        if data.len() > buffer.len {
            return Err(ClppError::DeviceError {
                step: "write_buffer",
                status: STATUS_INVALID_VALUE,
            });
        }
        if data.is_empty() {
            return Ok(());
        }
        let events = self.lock_events();
        let wait: Vec<cl_event> = events.iter().map(|ev| ev.get()).collect();
        let event = unsafe {
            self.queue
                .enqueue_write_buffer(&mut buffer.buffer, CL_BLOCKING, 0, data, &wait)
        }
        .map_err(device_error("write_buffer"))?;
        self.profile_event("write_buffer", &event);
        Ok(())
    }

    fn read_buffer(&self, buffer: &OpenClBuffer, out: &mut [u32]) -> ClppResult<()> {
        if out.len() > buffer.len {
            return Err(ClppError::DeviceError {
                step: "read_buffer",
                status: STATUS_INVALID_VALUE,
            });
        }
        if out.is_empty() {
            return Ok(());
        }
        let events = self.lock_events();
        let wait: Vec<cl_event> = events.iter().map(|ev| ev.get()).collect();
        let event = unsafe {
            self.queue
                .enqueue_read_buffer(&buffer.buffer, CL_BLOCKING, 0, out, &wait)
        }
        .map_err(device_error("read_buffer"))?;
        self.profile_event("read_buffer", &event);
        Ok(())
    }

    fn copy_buffer(&self, src: &OpenClBuffer, dst: &mut OpenClBuffer, len: usize) -> ClppResult<()> {
        if len > src.len || len > dst.len {
            return Err(ClppError::DeviceError {
                step: "copy_buffer",
                status: STATUS_INVALID_VALUE,
            });
        }
        if len == 0 {
            return Ok(());
        }
        let mut events = self.lock_events();
        let wait: Vec<cl_event> = events.iter().map(|ev| ev.get()).collect();
        let bytes = len * std::mem::size_of::<cl_uint>();
        let event = unsafe {
            self.queue
                .enqueue_copy_buffer(&src.buffer, &mut dst.buffer, 0, 0, bytes, &wait)
        }
        .map_err(device_error("copy_buffer"))?;
        self.profile_event("copy_buffer", &event);
        *events = Some(event);
        Ok(())
    }

    fn launch(
        &self,
        kernel: KernelName,
        args: &[KernelArg<'_, OpenClBuffer>],
        global: usize,
        local: usize,
    ) -> ClppResult<()> {
        let step = kernel.as_str();
        let compiled = &self.compiled(kernel).kernel;
        let mut events = self.lock_events();

        for (index, arg) in args.iter().enumerate() {
            let index = index as cl_uint;
            unsafe {
                match arg {
                    KernelArg::Buffer(b) => compiled.set_arg(index, &b.buffer),
                    KernelArg::Uint(v) => compiled.set_arg(index, v),
                    KernelArg::Local(bytes) => compiled.set_arg_local_buffer(index, *bytes),
                }
            }
            .map_err(device_error(step))?;
        }

        let wait: Vec<cl_event> = events.iter().map(|ev| ev.get()).collect();
        let global_sizes = [global];
        let local_sizes = [local];
        let event = unsafe {
            self.queue.enqueue_nd_range_kernel(
                compiled.get(),
                1,
                ptr::null(),
                global_sizes.as_ptr(),
                local_sizes.as_ptr(),
                &wait,
            )
        }
        .map_err(device_error(step))?;
        log::trace!("opencl: {kernel} global={global} local={local}");
        self.profile_event(step, &event);
        *events = Some(event);
        Ok(())
    }

    fn finish(&self) -> ClppResult<()> {
        self.queue.finish().map_err(device_error("finish"))?;
        *self.lock_events() = None;
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests.rs"]
mod tests;
