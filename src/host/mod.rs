//! CPU implementation of [`DeviceSurface`].
//!
//! [`HostSurface`] runs the kernel set by emulating work-groups on the
//! calling thread: local memory is a scratch vector per launch, barrier
//! phases are loops over the local ids. Launches execute synchronously,
//! so the queue is trivially in order and [`finish`](DeviceSurface::finish)
//! has nothing to wait for.
//!
//! The surface checks launches the way a device driver would (work-group
//! size, local memory, buffer bounds) and reports failures as
//! [`ClppError::DeviceError`] with OpenCL-numbered status codes. It also
//! counts buffer allocations and kernel launches, which the engine tests
//! use to observe buffer reuse.

mod kernels;

use crate::surface::{
    DeviceSurface, KernelArg, KernelName, STATUS_INVALID_GLOBAL_WORK_SIZE,
    STATUS_INVALID_KERNEL_ARGS, STATUS_INVALID_MEM_OBJECT, STATUS_INVALID_VALUE,
    STATUS_INVALID_WORK_GROUP_SIZE, STATUS_OUT_OF_RESOURCES,
};
use crate::{ClppError, ClppResult};

use kernels::{Grid, RadixPass, RadixScratch};

use std::cell::{Ref, RefCell, RefMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

/// Default work-group limit of the emulated device.
pub const DEFAULT_MAX_WORK_GROUP_SIZE: usize = 256;

/// Default local memory of the emulated device (32 KiB, the common GPU
/// minimum).
pub const DEFAULT_LOCAL_MEM_SIZE: usize = 32 * 1024;

/// Host-memory buffer of 32-bit words.
#[derive(Debug)]
pub struct HostBuffer {
    words: RefCell<Vec<u32>>,
}

impl HostBuffer {
    pub fn len(&self) -> usize {
        self.words.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the buffer contents.
    pub fn to_vec(&self) -> Vec<u32> {
        self.words.borrow().clone()
    }
}

/// CPU device surface. See the [module docs](self).
#[derive(Debug)]
pub struct HostSurface {
    name: String,
    max_work_group_size: usize,
    local_mem_size: usize,
    allocations: AtomicUsize,
    launches: AtomicUsize,
    fail_on: Mutex<Option<KernelName>>,
    fail_transfers: AtomicBool,
}

impl Default for HostSurface {
    fn default() -> Self {
        Self::new()
    }
}

impl HostSurface {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_WORK_GROUP_SIZE, DEFAULT_LOCAL_MEM_SIZE)
    }

    /// Emulate a device with the given work-group and local-memory
    /// limits.
    pub fn with_limits(max_work_group_size: usize, local_mem_size: usize) -> Self {
        Self {
            name: format!("host ({max_work_group_size} items, {local_mem_size} B local)"),
            max_work_group_size,
            local_mem_size,
            allocations: AtomicUsize::new(0),
            launches: AtomicUsize::new(0),
            fail_on: Mutex::new(None),
            fail_transfers: AtomicBool::new(false),
        }
    }

    /// Number of buffers created so far.
    pub fn allocations(&self) -> usize {
        self.allocations.load(Ordering::Relaxed)
    }

    /// Number of kernel launches so far.
    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::Relaxed)
    }

    /// Make every launch of `kernel` fail with
    /// [`STATUS_OUT_OF_RESOURCES`]; `None` clears it.
    pub fn fail_kernel(&self, kernel: Option<KernelName>) {
        if let Ok(mut slot) = self.fail_on.lock() {
            *slot = kernel;
        }
    }

    /// Make every write, read and copy fail with
    /// [`STATUS_OUT_OF_RESOURCES`] until cleared.
    pub fn fail_transfers(&self, fail: bool) {
        self.fail_transfers.store(fail, Ordering::Relaxed);
    }

    fn check_transfer(&self, step: &'static str) -> ClppResult<()> {
        if self.fail_transfers.load(Ordering::Relaxed) {
            return Err(ClppError::DeviceError {
                step,
                status: STATUS_OUT_OF_RESOURCES,
            });
        }
        Ok(())
    }

    fn injected_failure(&self, kernel: KernelName) -> bool {
        self.fail_on
            .lock()
            .map(|slot| *slot == Some(kernel))
            .unwrap_or(false)
    }

    fn dispatch(
        &self,
        kernel: KernelName,
        args: &[KernelArg<'_, HostBuffer>],
        grid: Grid,
    ) -> Result<(), i32> {
        let args = Args(args);
        match kernel {
            KernelName::BlockScan => {
                let mut data = args.buffer_mut(0)?;
                let mut block_sums = args.buffer_mut(1)?;
                let n = args.uint(2)? as usize;
                let mut scratch = args.local(3)?;
                kernels::block_scan(&mut data, &mut block_sums, n, &mut scratch, grid)
            }
            KernelName::UniformAdd => {
                let mut data = args.buffer_mut(0)?;
                let carries = args.buffer(1)?;
                let n = args.uint(2)? as usize;
                kernels::uniform_add(&mut data, &carries, n, grid)
            }
            KernelName::RadixLocal => {
                let mut data = args.buffer_mut(0)?;
                let mut hist = args.buffer_mut(1)?;
                let mut block_offsets = args.buffer_mut(2)?;
                let pass = args.radix_pass(3)?;
                let mut tile = args.local(7)?;
                let mut scan = args.local(8)?;
                let mut digits = args.local(9)?;
                let local = RadixScratch {
                    tile: &mut tile,
                    scan: &mut scan,
                    digits: &mut digits,
                };
                kernels::radix_local(&mut data, &mut hist, &mut block_offsets, pass, local, grid)
            }
            KernelName::RadixPermute => {
                let src = args.buffer(0)?;
                let mut dst = args.buffer_mut(1)?;
                let hist = args.buffer(2)?;
                let block_offsets = args.buffer(3)?;
                let pass = args.radix_pass(4)?;
                kernels::radix_permute(&src, &mut dst, &hist, &block_offsets, pass, grid)
            }
        }
    }
}

/// Positional argument access for the emulated kernels.
struct Args<'a, 'b>(&'a [KernelArg<'b, HostBuffer>]);

impl<'a> Args<'a, '_> {
    fn buffer(&self, i: usize) -> Result<Ref<'a, Vec<u32>>, i32> {
        match self.0.get(i) {
            Some(KernelArg::Buffer(b)) => b
                .words
                .try_borrow()
                .map_err(|_| STATUS_INVALID_MEM_OBJECT),
            _ => Err(STATUS_INVALID_KERNEL_ARGS),
        }
    }

    fn buffer_mut(&self, i: usize) -> Result<RefMut<'a, Vec<u32>>, i32> {
        match self.0.get(i) {
            Some(KernelArg::Buffer(b)) => b
                .words
                .try_borrow_mut()
                .map_err(|_| STATUS_INVALID_MEM_OBJECT),
            _ => Err(STATUS_INVALID_KERNEL_ARGS),
        }
    }

    fn uint(&self, i: usize) -> Result<u32, i32> {
        match self.0.get(i) {
            Some(KernelArg::Uint(v)) => Ok(*v),
            _ => Err(STATUS_INVALID_KERNEL_ARGS),
        }
    }

    /// Fresh zeroed local memory of the requested size.
    fn local(&self, i: usize) -> Result<Vec<u32>, i32> {
        match self.0.get(i) {
            Some(KernelArg::Local(bytes)) => Ok(vec![0; bytes / 4]),
            _ => Err(STATUS_INVALID_KERNEL_ARGS),
        }
    }

    /// `bit_offset, n, num_blocks, stride` starting at `first`.
    fn radix_pass(&self, first: usize) -> Result<RadixPass, i32> {
        Ok(RadixPass {
            bit_offset: self.uint(first)?,
            n: self.uint(first + 1)? as usize,
            num_blocks: self.uint(first + 2)? as usize,
            stride: self.uint(first + 3)? as usize,
        })
    }
}

impl DeviceSurface for HostSurface {
    type Buffer = HostBuffer;

    fn device_name(&self) -> &str {
        &self.name
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

    fn create_buffer(&self, len: usize) -> ClppResult<HostBuffer> {
        self.allocations.fetch_add(1, Ordering::Relaxed);
        log::trace!("host: create_buffer({len})");
        Ok(HostBuffer {
            words: RefCell::new(vec![0; len]),
        })
    }

    fn write_buffer(&self, buffer: &mut HostBuffer, data: &[u32]) -> ClppResult<()> {
        self.check_transfer("write_buffer")?;
        let words = buffer.words.get_mut();
        let dst = words.get_mut(..data.len()).ok_or(ClppError::DeviceError {
            step: "write_buffer",
            status: STATUS_INVALID_VALUE,
        })?;
        dst.copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&self, buffer: &HostBuffer, out: &mut [u32]) -> ClppResult<()> {
        self.check_transfer("read_buffer")?;
        let err = ClppError::DeviceError {
            step: "read_buffer",
            status: STATUS_INVALID_VALUE,
        };
        let words = buffer.words.try_borrow().map_err(|_| err.clone())?;
        let src = words.get(..out.len()).ok_or(err)?;
        out.copy_from_slice(src);
        Ok(())
    }

    fn copy_buffer(&self, src: &HostBuffer, dst: &mut HostBuffer, len: usize) -> ClppResult<()> {
        self.check_transfer("copy_buffer")?;
        let err = ClppError::DeviceError {
            step: "copy_buffer",
            status: STATUS_INVALID_VALUE,
        };
        let words = src.words.try_borrow().map_err(|_| err.clone())?;
        let from = words.get(..len).ok_or(err.clone())?;
        let to = dst.words.get_mut().get_mut(..len).ok_or(err)?;
        to.copy_from_slice(from);
        Ok(())
    }

    fn launch(
        &self,
        kernel: KernelName,
        args: &[KernelArg<'_, HostBuffer>],
        global: usize,
        local: usize,
    ) -> ClppResult<()> {
        let fail = |status| ClppError::DeviceError {
            step: kernel.as_str(),
            status,
        };
        if self.injected_failure(kernel) {
            return Err(fail(STATUS_OUT_OF_RESOURCES));
        }
        if local == 0 || local > self.max_work_group_size {
            return Err(fail(STATUS_INVALID_WORK_GROUP_SIZE));
        }
        if global == 0 || global % local != 0 {
            return Err(fail(STATUS_INVALID_GLOBAL_WORK_SIZE));
        }
        let local_bytes: usize = args
            .iter()
            .map(|arg| match arg {
                KernelArg::Local(bytes) => *bytes,
                _ => 0,
            })
            .sum();
        if local_bytes > self.local_mem_size {
            return Err(fail(STATUS_OUT_OF_RESOURCES));
        }

        self.launches.fetch_add(1, Ordering::Relaxed);
        log::trace!("host: {kernel} global={global} local={local}");
        self.dispatch(kernel, args, Grid { global, local })
            .map_err(fail)
    }

    fn finish(&self) -> ClppResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_round_trip_and_counters() {
        let surface = HostSurface::new();
        let mut buf = surface.create_buffer(4).unwrap();
        surface.write_buffer(&mut buf, &[1, 2, 3]).unwrap();
        let mut out = [0u32; 3];
        surface.read_buffer(&buf, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3]);
        assert_eq!(surface.allocations(), 1);
        assert_eq!(surface.launches(), 0);
    }

    #[test]
    fn test_write_past_end_fails() {
        let surface = HostSurface::new();
        let mut buf = surface.create_buffer(2).unwrap();
        let err = surface.write_buffer(&mut buf, &[1, 2, 3]).unwrap_err();
        assert_eq!(
            err,
            ClppError::DeviceError {
                step: "write_buffer",
                status: STATUS_INVALID_VALUE
            }
        );
    }

    #[test]
    fn test_copy_buffer() {
        let surface = HostSurface::new();
        let mut a = surface.create_buffer(4).unwrap();
        let mut b = surface.create_buffer(4).unwrap();
        surface.write_buffer(&mut a, &[9, 8, 7, 6]).unwrap();
        surface.copy_buffer(&a, &mut b, 3).unwrap();
        assert_eq!(b.to_vec(), vec![9, 8, 7, 0]);
    }

    #[test]
    fn test_launch_block_scan() {
        let surface = HostSurface::new();
        let mut data = surface.create_buffer(5).unwrap();
        let sums = surface.create_buffer(2).unwrap();
        surface.write_buffer(&mut data, &[1, 2, 3, 4, 5]).unwrap();
        surface
            .launch(
                KernelName::BlockScan,
                &[
                    KernelArg::Buffer(&data),
                    KernelArg::Buffer(&sums),
                    KernelArg::Uint(5),
                    KernelArg::Local(2 * 4 * 4),
                ],
                8,
                4,
            )
            .unwrap();
        assert_eq!(data.to_vec(), vec![0, 1, 3, 6, 0]);
        assert_eq!(sums.to_vec(), vec![10, 5]);
        assert_eq!(surface.launches(), 1);
    }

    #[test]
    fn test_launch_validates_geometry() {
        let surface = HostSurface::with_limits(64, 1024);
        let data = surface.create_buffer(4).unwrap();
        let carries = surface.create_buffer(1).unwrap();
        let args = [
            KernelArg::Buffer(&data),
            KernelArg::Buffer(&carries),
            KernelArg::Uint(4),
        ];
        let status = |r: ClppResult<()>| match r {
            Err(ClppError::DeviceError { status, .. }) => status,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(
            status(surface.launch(KernelName::UniformAdd, &args, 128, 128)),
            STATUS_INVALID_WORK_GROUP_SIZE
        );
        assert_eq!(
            status(surface.launch(KernelName::UniformAdd, &args, 6, 4)),
            STATUS_INVALID_GLOBAL_WORK_SIZE
        );
        assert_eq!(
            status(surface.launch(KernelName::UniformAdd, &args[..2], 4, 4)),
            STATUS_INVALID_KERNEL_ARGS
        );
        assert_eq!(surface.launches(), 1);
    }

    #[test]
    fn test_launch_rejects_oversized_local_memory() {
        let surface = HostSurface::with_limits(64, 64);
        let data = surface.create_buffer(4).unwrap();
        let sums = surface.create_buffer(1).unwrap();
        let err = surface
            .launch(
                KernelName::BlockScan,
                &[
                    KernelArg::Buffer(&data),
                    KernelArg::Buffer(&sums),
                    KernelArg::Uint(4),
                    KernelArg::Local(128),
                ],
                16,
                16,
            )
            .unwrap_err();
        assert_eq!(
            err,
            ClppError::DeviceError {
                step: "block_scan",
                status: STATUS_OUT_OF_RESOURCES
            }
        );
    }

    #[test]
    fn test_aliased_write_buffers_rejected() {
        let surface = HostSurface::new();
        let data = surface.create_buffer(4).unwrap();
        let err = surface
            .launch(
                KernelName::BlockScan,
                &[
                    KernelArg::Buffer(&data),
                    KernelArg::Buffer(&data),
                    KernelArg::Uint(4),
                    KernelArg::Local(32),
                ],
                4,
                4,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            ClppError::DeviceError {
                status: STATUS_INVALID_MEM_OBJECT,
                ..
            }
        ));
    }

    #[test]
    fn test_injected_failure() {
        let surface = HostSurface::new();
        surface.fail_kernel(Some(KernelName::UniformAdd));
        let data = surface.create_buffer(4).unwrap();
        let carries = surface.create_buffer(1).unwrap();
        let args = [
            KernelArg::Buffer(&data),
            KernelArg::Buffer(&carries),
            KernelArg::Uint(4),
        ];
        assert!(surface.launch(KernelName::UniformAdd, &args, 4, 4).is_err());
        surface.fail_kernel(None);
        assert!(surface.launch(KernelName::UniformAdd, &args, 4, 4).is_ok());
    }

    #[test]
    fn test_injected_transfer_failure() {
        let surface = HostSurface::new();
        let mut a = surface.create_buffer(2).unwrap();
        let mut b = surface.create_buffer(2).unwrap();
        surface.fail_transfers(true);
        let status = |r: ClppResult<()>| match r {
            Err(ClppError::DeviceError { step, status }) => Some((step, status)),
            _ => None,
        };
        assert_eq!(
            status(surface.write_buffer(&mut a, &[1, 2])),
            Some(("write_buffer", STATUS_OUT_OF_RESOURCES))
        );
        assert_eq!(
            status(surface.read_buffer(&a, &mut [0; 2])),
            Some(("read_buffer", STATUS_OUT_OF_RESOURCES))
        );
        assert_eq!(
            status(surface.copy_buffer(&a, &mut b, 2)),
            Some(("copy_buffer", STATUS_OUT_OF_RESOURCES))
        );
        surface.fail_transfers(false);
        surface.write_buffer(&mut a, &[1, 2]).unwrap();
        surface.copy_buffer(&a, &mut b, 2).unwrap();
        assert_eq!(b.to_vec(), vec![1, 2]);
    }
}
