//! The device abstraction the engines are written against.
//!
//! A [`DeviceSurface`] bundles a compute context, one command queue and
//! the compiled kernel set. The engines only allocate buffers, move data
//! and enqueue the kernels named by [`KernelName`]; device discovery and
//! kernel compilation stay inside each implementation.

use crate::config::{WorkGroupSize, MAX_AUTO_WORK_GROUP_SIZE};
use crate::{ClppError, ClppResult};

// Status codes of `ClppError::DeviceError`. Backends without native codes
// use the OpenCL numbering so failures read the same everywhere.

/// The backend reported no status code.
pub const STATUS_UNKNOWN: i32 = -1;
/// `CL_OUT_OF_RESOURCES`
pub const STATUS_OUT_OF_RESOURCES: i32 = -5;
/// `CL_INVALID_VALUE`: transfer or kernel access outside a buffer.
pub const STATUS_INVALID_VALUE: i32 = -30;
/// `CL_INVALID_MEM_OBJECT`: the same buffer bound twice for writing.
pub const STATUS_INVALID_MEM_OBJECT: i32 = -38;
/// `CL_INVALID_ARG_SIZE`: local scratch too small for the kernel.
pub const STATUS_INVALID_ARG_SIZE: i32 = -51;
/// `CL_INVALID_KERNEL_ARGS`
pub const STATUS_INVALID_KERNEL_ARGS: i32 = -52;
/// `CL_INVALID_WORK_GROUP_SIZE`
pub const STATUS_INVALID_WORK_GROUP_SIZE: i32 = -54;
/// `CL_INVALID_GLOBAL_WORK_SIZE`
pub const STATUS_INVALID_GLOBAL_WORK_SIZE: i32 = -63;

/// Kernels every surface must provide.
///
/// Positional argument order (buffers, then scalars, then local scratch):
///
/// | kernel          | buffers                                  | scalars                                         | local            |
/// |-----------------|------------------------------------------|-------------------------------------------------|------------------|
/// | `block_scan`    | data, block_sums                         | n                                               | `2W` words       |
/// | `uniform_add`   | data, carries                            | n                                               | none             |
/// | `radix_local`   | data, hist, block_offsets                | bit_offset, n, num_blocks, stride               | `4W*stride`, `2W`, 32 words |
/// | `radix_permute` | src, dst, hist, block_offsets            | bit_offset, n, num_blocks, stride               | none             |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelName {
    /// Per-work-group exclusive scan in place, block totals to `block_sums`.
    BlockScan,
    /// Add the scanned carry of each block to every element of the block.
    UniformAdd,
    /// Stable local sort of a `4W` tile by one 4-bit digit, plus the
    /// column-major digit histogram and per-block digit start offsets.
    RadixLocal,
    /// Scatter locally sorted tiles to their global positions.
    RadixPermute,
}

impl KernelName {
    pub const ALL: [KernelName; 4] = [
        KernelName::BlockScan,
        KernelName::UniformAdd,
        KernelName::RadixLocal,
        KernelName::RadixPermute,
    ];

    /// Entry-point name in the kernel sources.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BlockScan => "block_scan",
            Self::UniformAdd => "uniform_add",
            Self::RadixLocal => "radix_local",
            Self::RadixPermute => "radix_permute",
        }
    }
}

impl std::fmt::Display for KernelName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One positional kernel argument.
#[derive(Debug)]
pub enum KernelArg<'a, B> {
    /// A device buffer.
    Buffer(&'a B),
    /// A 32-bit unsigned scalar.
    Uint(u32),
    /// Local (work-group shared) scratch of the given size in bytes.
    Local(usize),
}

/// A compute context + queue + compiled kernel set.
///
/// Buffers are measured in 32-bit words. Implementations must execute
/// commands in submission order (or enforce that order with events), so
/// that each launch observes the results of every earlier one.
pub trait DeviceSurface {
    /// Device memory handle. Dropping it releases the memory.
    type Buffer;

    /// Human-readable device name for diagnostics.
    fn device_name(&self) -> &str;

    /// Largest work-group the device supports.
    fn max_work_group_size(&self) -> usize;

    /// Local memory available to one work-group, in bytes.
    fn local_mem_size(&self) -> usize;

    /// Device-reported optimum work-group size for one kernel.
    fn kernel_work_group_size(&self, kernel: KernelName) -> usize;

    /// Allocate an uninitialized buffer of `len` words.
    fn create_buffer(&self, len: usize) -> ClppResult<Self::Buffer>;

    /// Upload `data` to the start of `buffer`.
    fn write_buffer(&self, buffer: &mut Self::Buffer, data: &[u32]) -> ClppResult<()>;

    /// Download `out.len()` words from the start of `buffer`.
    fn read_buffer(&self, buffer: &Self::Buffer, out: &mut [u32]) -> ClppResult<()>;

    /// Copy `len` words between two device buffers without a host round trip.
    fn copy_buffer(&self, src: &Self::Buffer, dst: &mut Self::Buffer, len: usize) -> ClppResult<()>;

    /// Enqueue `kernel` over `global` work-items in groups of `local`.
    fn launch(
        &self,
        kernel: KernelName,
        args: &[KernelArg<'_, Self::Buffer>],
        global: usize,
        local: usize,
    ) -> ClppResult<()>;

    /// Block until every enqueued command has completed.
    fn finish(&self) -> ClppResult<()>;
}

/// Pick the work-group size for an engine that launches `kernels`.
///
/// `local_bytes(w)` is the local-memory footprint of the most demanding
/// kernel at work-group size `w`; `min` is the smallest size the kernels
/// work with.
pub fn resolve_work_group_size<S, F>(
    surface: &S,
    kernels: &[KernelName],
    requested: WorkGroupSize,
    min: usize,
    local_bytes: F,
) -> ClppResult<usize>
where
    S: DeviceSurface + ?Sized,
    F: Fn(usize) -> usize,
{
    let device_limit = kernels
        .iter()
        .map(|&k| surface.kernel_work_group_size(k))
        .fold(surface.max_work_group_size(), usize::min);
    let local_limit = surface.local_mem_size();

    match requested {
        WorkGroupSize::Fixed(w) => {
            if !w.is_power_of_two() || w < min {
                return Err(ClppError::ConfigError(format!(
                    "work-group size {w} must be a power of two >= {min}"
                )));
            }
            if w > device_limit {
                return Err(ClppError::ConfigError(format!(
                    "work-group size {w} exceeds device limit {device_limit}"
                )));
            }
            if local_bytes(w) > local_limit {
                return Err(ClppError::ConfigError(format!(
                    "work-group size {w} needs {} bytes of local memory, device has {local_limit}",
                    local_bytes(w)
                )));
            }
            Ok(w)
        }
        WorkGroupSize::Auto => {
            // Cap and round down to the nearest power of 2 for portability.
            let capped = device_limit.clamp(1, MAX_AUTO_WORK_GROUP_SIZE);
            let mut w = 1 << (usize::BITS - 1 - capped.leading_zeros());
            while w > min && local_bytes(w) > local_limit {
                w /= 2;
            }
            if w < min || local_bytes(w) > local_limit {
                return Err(ClppError::ConfigError(format!(
                    "device {} cannot run work-groups of {min} items",
                    surface.device_name()
                )));
            }
            log::debug!("{}: auto work-group size {w}", surface.device_name());
            Ok(w)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostSurface;

    fn words(w: usize) -> usize {
        2 * w * 4
    }

    #[test]
    fn test_fixed_size_accepted() {
        let surface = HostSurface::new();
        let w = resolve_work_group_size(&surface, &KernelName::ALL, WorkGroupSize::Fixed(64), 2, words);
        assert_eq!(w, Ok(64));
    }

    #[test]
    fn test_fixed_size_rejections() {
        let surface = HostSurface::with_limits(128, 1024);
        for w in [0usize, 3, 8, 256] {
            let result =
                resolve_work_group_size(&surface, &KernelName::ALL, WorkGroupSize::Fixed(w), 16, words);
            assert!(matches!(result, Err(ClppError::ConfigError(_))), "w={w}");
        }
        // 128 items need 1024 bytes, which fits exactly.
        assert_eq!(
            resolve_work_group_size(&surface, &KernelName::ALL, WorkGroupSize::Fixed(128), 16, words),
            Ok(128)
        );
        assert!(resolve_work_group_size(
            &surface,
            &KernelName::ALL,
            WorkGroupSize::Fixed(128),
            16,
            |w| words(w) + 1
        )
        .is_err());
    }

    #[test]
    fn test_auto_is_capped_and_rounded() {
        let big = HostSurface::with_limits(1024, 1 << 20);
        assert_eq!(
            resolve_work_group_size(&big, &KernelName::ALL, WorkGroupSize::Auto, 2, words),
            Ok(MAX_AUTO_WORK_GROUP_SIZE)
        );
        let odd = HostSurface::with_limits(100, 1 << 20);
        assert_eq!(
            resolve_work_group_size(&odd, &KernelName::ALL, WorkGroupSize::Auto, 2, words),
            Ok(64)
        );
    }

    #[test]
    fn test_auto_shrinks_to_local_memory() {
        let surface = HostSurface::with_limits(256, 128);
        assert_eq!(
            resolve_work_group_size(&surface, &KernelName::ALL, WorkGroupSize::Auto, 2, words),
            Ok(16)
        );
        let tiny = HostSurface::with_limits(256, 8);
        assert!(matches!(
            resolve_work_group_size(&tiny, &KernelName::ALL, WorkGroupSize::Auto, 2, words),
            Err(ClppError::ConfigError(_))
        ));
    }

    #[test]
    fn test_kernel_names() {
        let names: Vec<String> = KernelName::ALL.iter().map(|k| k.to_string()).collect();
        assert_eq!(names, ["block_scan", "uniform_add", "radix_local", "radix_permute"]);
    }
}
