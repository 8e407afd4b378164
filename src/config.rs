//! Engine and surface configuration.
//!
//! All knobs are plain values handed to constructors; nothing here is
//! process-wide state.

use crate::{ClppError, ClppResult};

use std::borrow::Cow;
use std::path::PathBuf;

/// Default key width in bits for radix sort.
pub const DEFAULT_KEY_BITS: u32 = 32;

/// Upper bound for auto-detected work-group sizes.
pub const MAX_AUTO_WORK_GROUP_SIZE: usize = 256;

/// Smallest work-group size of a scan engine.
pub const MIN_SCAN_WORK_GROUP_SIZE: usize = 2;

/// Smallest work-group size of a sort engine. `radix_local` needs at
/// least one work-item per digit value.
pub const MIN_SORT_WORK_GROUP_SIZE: usize = 16;

/// How the work-group size of an engine is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkGroupSize {
    /// Use the kernel's device-reported optimum, capped at
    /// [`MAX_AUTO_WORK_GROUP_SIZE`] and rounded down to a power of two,
    /// then shrunk until the local-memory footprint fits the device.
    #[default]
    Auto,
    /// Pin the size. Must be a power of two no smaller than
    /// [`MIN_SCAN_WORK_GROUP_SIZE`] (scan) or [`MIN_SORT_WORK_GROUP_SIZE`]
    /// (sort), and must fit the device limits.
    Fixed(usize),
}

/// Where a surface reads its kernel sources from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum KernelSource {
    /// Sources compiled into the crate with `include_str!`.
    #[default]
    Embedded,
    /// Load `<dir>/<file>` at surface creation, e.g. to try a modified
    /// kernel without rebuilding.
    Directory(PathBuf),
}

impl KernelSource {
    /// Resolve the source text for `file`, falling back to `embedded`
    /// for [`KernelSource::Embedded`].
    pub fn load(&self, file: &str, embedded: &'static str) -> ClppResult<Cow<'static, str>> {
        match self {
            Self::Embedded => Ok(Cow::Borrowed(embedded)),
            Self::Directory(dir) => {
                let path = dir.join(file);
                std::fs::read_to_string(&path).map(Cow::Owned).map_err(|e| {
                    ClppError::ConfigError(format!("cannot read {}: {e}", path.display()))
                })
            }
        }
    }
}

/// Options for creating a device surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SurfaceOptions {
    /// Prefer GPU devices over CPU / accelerator devices.
    pub prefer_gpu: bool,
    /// Log per-command timings at `debug` level.
    pub profiling: bool,
    /// Kernel source location.
    pub kernel_source: KernelSource,
}

impl Default for SurfaceOptions {
    fn default() -> Self {
        Self {
            prefer_gpu: true,
            profiling: false,
            kernel_source: KernelSource::Embedded,
        }
    }
}

impl SurfaceOptions {
    pub fn prefer_gpu(mut self, prefer_gpu: bool) -> Self {
        self.prefer_gpu = prefer_gpu;
        self
    }

    pub fn profiling(mut self, profiling: bool) -> Self {
        self.profiling = profiling;
        self
    }

    pub fn kernel_source(mut self, kernel_source: KernelSource) -> Self {
        self.kernel_source = kernel_source;
        self
    }
}

/// Configuration of a [`BlockScanEngine`](crate::BlockScanEngine).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanConfig {
    /// Largest dataset the engine accepts.
    pub max_elements: usize,
    pub work_group_size: WorkGroupSize,
}

impl ScanConfig {
    pub fn new(max_elements: usize) -> Self {
        Self {
            max_elements,
            work_group_size: WorkGroupSize::Auto,
        }
    }

    pub fn work_group_size(mut self, work_group_size: WorkGroupSize) -> Self {
        self.work_group_size = work_group_size;
        self
    }
}

/// Configuration of a [`RadixSortEngine`](crate::RadixSortEngine).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortConfig {
    /// Largest dataset the engine accepts.
    pub max_elements: usize,
    /// Number of low key bits that take part in the ordering, rounded up
    /// to whole 4-bit digits. `1..=32`.
    pub key_bits: u32,
    pub work_group_size: WorkGroupSize,
}

impl SortConfig {
    pub fn new(max_elements: usize) -> Self {
        Self {
            max_elements,
            key_bits: DEFAULT_KEY_BITS,
            work_group_size: WorkGroupSize::Auto,
        }
    }

    pub fn key_bits(mut self, key_bits: u32) -> Self {
        self.key_bits = key_bits;
        self
    }

    pub fn work_group_size(mut self, work_group_size: WorkGroupSize) -> Self {
        self.work_group_size = work_group_size;
        self
    }

    pub(crate) fn validate(&self) -> ClppResult<()> {
        if self.key_bits == 0 || self.key_bits > 32 {
            return Err(ClppError::InvalidInput);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sort_config_defaults() {
        let cfg = SortConfig::new(100);
        assert_eq!(cfg.max_elements, 100);
        assert_eq!(cfg.key_bits, 32);
        assert_eq!(cfg.work_group_size, WorkGroupSize::Auto);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_sort_config_rejects_bad_key_bits() {
        assert_eq!(
            SortConfig::new(8).key_bits(0).validate(),
            Err(ClppError::InvalidInput)
        );
        assert_eq!(
            SortConfig::new(8).key_bits(33).validate(),
            Err(ClppError::InvalidInput)
        );
        assert!(SortConfig::new(8).key_bits(7).validate().is_ok());
    }

    #[test]
    fn test_embedded_source_is_borrowed() {
        let src = KernelSource::Embedded.load("scan.cl", "kernel void k() {}").unwrap();
        assert!(matches!(src, Cow::Borrowed(_)));
    }

    #[test]
    fn test_directory_source_missing_file() {
        let source = KernelSource::Directory(PathBuf::from("/nonexistent/clpp-kernels"));
        match source.load("scan.cl", "") {
            Err(ClppError::ConfigError(msg)) => assert!(msg.contains("scan.cl")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_surface_options_builder() {
        let opts = SurfaceOptions::default()
            .prefer_gpu(false)
            .profiling(true)
            .kernel_source(KernelSource::Directory(PathBuf::from("kernels")));
        assert!(!opts.prefer_gpu);
        assert!(opts.profiling);
        assert_eq!(opts.kernel_source, KernelSource::Directory("kernels".into()));
    }
}
