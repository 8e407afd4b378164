use super::*;
use crate::config::{ScanConfig, SortConfig};
use crate::{BlockScanEngine, RadixSortEngine};

use std::sync::Arc;

fn surface() -> Option<Arc<OpenClSurface>> {
    match OpenClSurface::new(SurfaceOptions::default()) {
        Ok(s) => Some(Arc::new(s)),
        Err(ClppError::Unsupported) => None,
        Err(e) => panic!("Unexpected error: {:?}", e),
    }
}

fn words(n: usize, seed: u32) -> Vec<u32> {
    let mut x = seed.max(1);
    (0..n)
        .map(|_| {
            x ^= x << 13;
            x ^= x >> 17;
            x ^= x << 5;
            x
        })
        .collect()
}

#[test]
fn test_probe_devices_does_not_panic() {
    // This should never panic, even without OpenCL runtime
    let devices = probe_devices();
    assert_eq!(devices.len(), device_count());
}

#[test]
fn test_missing_kernel_directory_is_config_error() {
    let options = SurfaceOptions::default().kernel_source(KernelSource::Directory(
        "/nonexistent/clpp-kernels".into(),
    ));
    assert!(matches!(
        OpenClSurface::new(options),
        Err(ClppError::ConfigError(_))
    ));
}

#[test]
fn test_surface_creation() {
    let Some(surface) = surface() else { return };
    assert!(!surface.device_name().is_empty());
    assert!(surface.max_work_group_size() > 0);
    for kernel in KernelName::ALL {
        assert!(surface.kernel_work_group_size(kernel) > 0);
    }
}

#[test]
fn test_buffer_round_trip() {
    let Some(surface) = surface() else { return };
    let mut a = surface.create_buffer(5).unwrap();
    let mut b = surface.create_buffer(5).unwrap();
    surface.write_buffer(&mut a, &[1, 2, 3, 4, 5]).unwrap();
    surface.copy_buffer(&a, &mut b, 5).unwrap();
    let mut out = [0u32; 5];
    surface.read_buffer(&b, &mut out).unwrap();
    assert_eq!(out, [1, 2, 3, 4, 5]);
    assert!(matches!(
        surface.write_buffer(&mut a, &[0; 6]),
        Err(ClppError::DeviceError { .. })
    ));
}

#[test]
fn test_gpu_scan_matches_reference() {
    let Some(surface) = surface() else { return };
    let mut engine = BlockScanEngine::new(surface, ScanConfig::new(200_000)).unwrap();
    for n in [1usize, 255, 256, 257, 65_537, 199_999] {
        let data: Vec<u32> = words(n, n as u32).iter().map(|x| x % 1000).collect();
        let mut acc = 0u32;
        let expected: Vec<u32> = data
            .iter()
            .map(|&x| {
                let out = acc;
                acc = acc.wrapping_add(x);
                out
            })
            .collect();
        engine.push(&data).unwrap();
        engine.scan().unwrap();
        assert_eq!(engine.pop_vec().unwrap(), expected, "n={n}");
    }
}

#[test]
fn test_gpu_sort_keys() {
    let Some(surface) = surface() else { return };
    let mut engine = RadixSortEngine::new(surface, SortConfig::new(100_000)).unwrap();
    let mut keys = words(100_000, 11);
    let mut expected = keys.clone();
    expected.sort_unstable();
    engine.push_keys(&keys).unwrap();
    engine.sort().unwrap();
    engine.pop_keys(&mut keys).unwrap();
    assert_eq!(keys, expected);
}

#[test]
fn test_gpu_sort_pairs_is_stable() {
    let Some(surface) = surface() else { return };
    let mut engine = RadixSortEngine::new(surface, SortConfig::new(10_000)).unwrap();
    let mut keys: Vec<u32> = words(10_000, 5).iter().map(|k| k % 64).collect();
    let mut values: Vec<u32> = (0..10_000).collect();
    let mut expected: Vec<(u32, u32)> = keys.iter().copied().zip(values.iter().copied()).collect();
    expected.sort_by_key(|&(k, _)| k);

    engine.push_pairs(&keys, &values).unwrap();
    engine.sort().unwrap();
    engine.pop_pairs(&mut keys, &mut values).unwrap();
    let got: Vec<(u32, u32)> = keys.into_iter().zip(values).collect();
    assert_eq!(got, expected);
}
