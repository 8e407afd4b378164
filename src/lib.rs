//! Parallel primitives on compute devices: exclusive prefix sum and
//! LSD radix sort of 32-bit keys (optionally carrying a 32-bit value).
//!
//! The engines are written once against the [`DeviceSurface`] trait and
//! run on any of its implementations:
//!
//! - [`host::HostSurface`]: always available, executes the kernels on
//!   the CPU by emulating work-groups. Used by the tests.
//! - `opencl::OpenClSurface`: behind the `opencl` feature.
//! - `webgpu::WebGpuSurface`: behind the `webgpu` feature.
//!
//! # Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use clpp::host::HostSurface;
//! use clpp::{RadixSortEngine, SortConfig};
//!
//! # fn main() -> clpp::ClppResult<()> {
//! let surface = Arc::new(HostSurface::new());
//! let mut sorter = RadixSortEngine::new(surface, SortConfig::new(1024))?;
//!
//! let mut keys = vec![5u32, 3, 3, 1, 4, 1, 5, 9, 2, 6];
//! sorter.push_keys(&keys)?;
//! sorter.sort()?;
//! sorter.pop_keys(&mut keys)?;
//! assert_eq!(keys, vec![1, 1, 2, 3, 3, 4, 5, 5, 6, 9]);
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod config;
pub mod gpu_common;
pub mod host;
pub mod plan;
pub mod radix_sort;
pub mod scan;
pub mod surface;

#[cfg(feature = "opencl")]
pub mod opencl;

#[cfg(feature = "webgpu")]
pub mod webgpu;

pub use api::{best_scan, best_sort, best_sort_pairs, exclusive_scan, sort_keys, sort_pairs};
pub use config::{KernelSource, ScanConfig, SortConfig, SurfaceOptions, WorkGroupSize};
pub use radix_sort::{RadixSortEngine, SortLayout};
pub use scan::BlockScanEngine;
pub use surface::{DeviceSurface, KernelArg, KernelName};

/// Error types for clpp operations.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ClppError {
    /// Device setup, kernel compilation or buffer allocation failed
    /// while configuring an engine.
    ConfigError(String),
    /// More elements were pushed than the engine was configured for.
    CapacityExceeded {
        /// Number of elements pushed.
        requested: usize,
        /// Configured maximum.
        capacity: usize,
    },
    /// A kernel argument bind, enqueue or transfer failed.
    DeviceError {
        /// The step that failed (e.g. `"block_scan"`, `"pop"`).
        step: &'static str,
        /// Backend status code (OpenCL `cl_int`, or -1 when the backend
        /// has none).
        status: i32,
    },
    /// Input data is invalid (length mismatch, bad key width, ...).
    InvalidInput,
    /// The engine is not in a state that allows the operation.
    InvalidState(&'static str),
    /// No usable device or backend.
    Unsupported,
}

impl std::fmt::Display for ClppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConfigError(msg) => write!(f, "configuration error: {msg}"),
            Self::CapacityExceeded {
                requested,
                capacity,
            } => write!(
                f,
                "capacity exceeded: {requested} elements pushed, engine configured for {capacity}"
            ),
            Self::DeviceError { step, status } => {
                write!(f, "device error in {step} (status {status})")
            }
            Self::InvalidInput => write!(f, "invalid input"),
            Self::InvalidState(msg) => write!(f, "invalid engine state: {msg}"),
            Self::Unsupported => write!(f, "unsupported operation"),
        }
    }
}

impl std::error::Error for ClppError {}

pub type ClppResult<T> = Result<T, ClppError>;

/// Lifecycle of an engine between `push`, compute and `pop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Buffers and kernels ready, no data loaded.
    Configured,
    /// Data pushed, ready to compute.
    Loaded,
    /// Compute enqueued; results can be popped.
    Computed,
}
