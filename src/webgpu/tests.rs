use super::*;
use crate::config::{ScanConfig, SortConfig};
use crate::{BlockScanEngine, RadixSortEngine, SortLayout};

use std::sync::Arc;

fn surface() -> Option<Arc<WebGpuSurface>> {
    match WebGpuSurface::new(SurfaceOptions::default()) {
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
    let devices = probe_devices();
    assert_eq!(devices.len(), device_count());
}

#[test]
fn test_missing_kernel_directory_is_config_error() {
    let options = SurfaceOptions::default().kernel_source(KernelSource::Directory(
        "/nonexistent/clpp-kernels".into(),
    ));
    assert!(matches!(
        WebGpuSurface::new(options),
        Err(ClppError::ConfigError(_))
    ));
}

#[test]
fn test_tile_workgroups() {
    let Some(surface) = surface() else { return };
    let max = surface.max_workgroups_per_dim as usize;
    assert_eq!(surface.tile_workgroups(7), Some((7, 1)));
    assert_eq!(surface.tile_workgroups(max), Some((max as u32, 1)));
    assert_eq!(surface.tile_workgroups(max + 1), Some((max as u32, 2)));
}

#[test]
fn test_buffer_round_trip() {
    let Some(surface) = surface() else { return };
    let mut a = surface.create_buffer(5).unwrap();
    let mut b = surface.create_buffer(5).unwrap();
    surface.write_buffer(&mut a, &[5, 4, 3, 2, 1]).unwrap();
    surface.copy_buffer(&a, &mut b, 4).unwrap();
    let mut out = [0u32; 4];
    surface.read_buffer(&b, &mut out).unwrap();
    assert_eq!(out, [5, 4, 3, 2]);
    assert!(matches!(
        surface.read_buffer(&b, &mut [0; 6]),
        Err(ClppError::DeviceError { .. })
    ));
}

#[test]
fn test_gpu_scan_small_work_group() {
    let Some(surface) = surface() else { return };
    let mut engine = BlockScanEngine::new(
        surface,
        ScanConfig::new(8).work_group_size(crate::WorkGroupSize::Fixed(4)),
    )
    .unwrap();
    engine.push(&[1; 8]).unwrap();
    engine.scan().unwrap();
    assert_eq!(engine.pop_vec().unwrap(), (0..8).collect::<Vec<u32>>());
}

#[test]
fn test_gpu_scan_matches_reference() {
    let Some(surface) = surface() else { return };
    let mut engine = BlockScanEngine::new(surface, ScanConfig::new(300_000)).unwrap();
    let data: Vec<u32> = words(299_993, 17).iter().map(|x| x & 0xFF).collect();
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
    assert_eq!(engine.pop_vec().unwrap(), expected);
}

#[test]
fn test_gpu_sort_keys_and_pairs() {
    let Some(surface) = surface() else { return };
    let mut engine = RadixSortEngine::new(surface, SortConfig::new(50_000)).unwrap();

    let mut keys = words(50_000, 3);
    let mut expected = keys.clone();
    expected.sort_unstable();
    engine.push_keys(&keys).unwrap();
    engine.sort().unwrap();
    engine.pop_keys(&mut keys).unwrap();
    assert_eq!(keys, expected);

    let mut keys: Vec<u32> = words(20_000, 9).iter().map(|k| k % 100).collect();
    let mut values: Vec<u32> = (0..20_000).collect();
    let mut pairs: Vec<(u32, u32)> = keys.iter().copied().zip(values.iter().copied()).collect();
    pairs.sort_by_key(|&(k, _)| k);
    engine.push_pairs(&keys, &values).unwrap();
    assert_eq!(engine.layout(), SortLayout::KeyValue);
    engine.sort().unwrap();
    engine.pop_pairs(&mut keys, &mut values).unwrap();
    assert_eq!(keys.into_iter().zip(values).collect::<Vec<_>>(), pairs);
}
