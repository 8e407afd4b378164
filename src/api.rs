//! Factory and one-shot helpers.
//!
//! The factories configure an engine with an automatically chosen
//! work-group size and allocate its buffers for the full capacity, so the
//! first push does no allocation. The one-shot helpers size a throwaway
//! engine to the input and run a full push/compute/pop cycle.

use crate::config::{ScanConfig, SortConfig};
use crate::radix_sort::{RadixSortEngine, SortLayout};
use crate::scan::BlockScanEngine;
use crate::surface::DeviceSurface;
use crate::{ClppError, ClppResult};

use std::sync::Arc;

/// Scan engine for up to `max_elements` words.
pub fn best_scan<S: DeviceSurface>(
    surface: Arc<S>,
    max_elements: usize,
) -> ClppResult<BlockScanEngine<S>> {
    BlockScanEngine::new(surface, ScanConfig::new(max_elements))
}

/// Keys-only sort engine for up to `max_elements` keys of `key_bits` bits.
pub fn best_sort<S: DeviceSurface>(
    surface: Arc<S>,
    max_elements: usize,
    key_bits: u32,
) -> ClppResult<RadixSortEngine<S>> {
    let mut engine = RadixSortEngine::new(surface, SortConfig::new(max_elements).key_bits(key_bits))?;
    engine.reserve(max_elements, SortLayout::KeysOnly)?;
    Ok(engine)
}

/// Key/value sort engine for up to `max_elements` pairs.
pub fn best_sort_pairs<S: DeviceSurface>(
    surface: Arc<S>,
    max_elements: usize,
    key_bits: u32,
) -> ClppResult<RadixSortEngine<S>> {
    let mut engine = RadixSortEngine::new(surface, SortConfig::new(max_elements).key_bits(key_bits))?;
    engine.reserve(max_elements, SortLayout::KeyValue)?;
    Ok(engine)
}

/// Replace `data` by its exclusive prefix sum.
pub fn exclusive_scan<S: DeviceSurface>(surface: &Arc<S>, data: &mut [u32]) -> ClppResult<()> {
    if data.is_empty() {
        return Ok(());
    }
    let mut engine = best_scan(Arc::clone(surface), data.len())?;
    engine.push(data)?;
    engine.scan()?;
    engine.pop(data)
}

/// Sort `keys` in place by their low `key_bits` bits.
pub fn sort_keys<S: DeviceSurface>(
    surface: &Arc<S>,
    keys: &mut [u32],
    key_bits: u32,
) -> ClppResult<()> {
    if keys.is_empty() {
        return SortConfig::new(0).key_bits(key_bits).validate();
    }
    let mut engine = RadixSortEngine::new(
        Arc::clone(surface),
        SortConfig::new(keys.len()).key_bits(key_bits),
    )?;
    engine.push_keys(keys)?;
    engine.sort()?;
    engine.pop_keys(keys)
}

/// Sort `keys` in place by their low `key_bits` bits, moving each value
/// with its key. Equal keys keep their relative order.
pub fn sort_pairs<S: DeviceSurface>(
    surface: &Arc<S>,
    keys: &mut [u32],
    values: &mut [u32],
    key_bits: u32,
) -> ClppResult<()> {
    if keys.len() != values.len() {
        return Err(ClppError::InvalidInput);
    }
    if keys.is_empty() {
        return SortConfig::new(0).key_bits(key_bits).validate();
    }
    let mut engine = RadixSortEngine::new(
        Arc::clone(surface),
        SortConfig::new(keys.len()).key_bits(key_bits),
    )?;
    engine.push_pairs(keys, values)?;
    engine.sort()?;
    engine.pop_pairs(keys, values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostSurface;
    use crate::EngineState;

    #[test]
    fn test_best_scan_uses_auto_work_group() {
        let surface = Arc::new(HostSurface::with_limits(128, 32 * 1024));
        let engine = best_scan(surface, 10_000).unwrap();
        assert_eq!(engine.work_group_size(), 128);
        assert_eq!(engine.max_elements(), 10_000);
    }

    #[test]
    fn test_best_sort_preallocates() {
        let surface = Arc::new(HostSurface::new());
        let mut engine = best_sort(Arc::clone(&surface), 5000, 16).unwrap();
        assert_eq!(engine.allocation_count(), 1);
        assert_eq!(engine.state(), EngineState::Configured);
        assert_eq!(engine.name(), "Radix sort");

        let allocated = surface.allocations();
        let mut keys: Vec<u32> = (0..5000u32).rev().collect();
        engine.push_keys(&keys).unwrap();
        engine.sort().unwrap();
        engine.pop_keys(&mut keys).unwrap();
        assert_eq!(keys, (0..5000u32).collect::<Vec<_>>());
        assert_eq!(surface.allocations(), allocated);
    }

    #[test]
    fn test_best_sort_pairs_reserves_pairs() {
        let surface = Arc::new(HostSurface::new());
        let mut engine = best_sort_pairs(surface, 1000, 32).unwrap();
        assert_eq!(engine.name(), "Radix sort (key/value)");
        let mut keys = vec![2u32, 1, 2, 0];
        let mut values = vec![10u32, 11, 12, 13];
        engine.push_pairs(&keys, &values).unwrap();
        engine.sort().unwrap();
        engine.pop_pairs(&mut keys, &mut values).unwrap();
        assert_eq!(keys, vec![0, 1, 2, 2]);
        assert_eq!(values, vec![13, 11, 10, 12]);
        assert_eq!(engine.allocation_count(), 1);
    }

    #[test]
    fn test_exclusive_scan_one_shot() {
        let surface = Arc::new(HostSurface::new());
        let mut data = vec![1u32; 1000];
        exclusive_scan(&surface, &mut data).unwrap();
        assert_eq!(data, (0..1000u32).collect::<Vec<_>>());

        let mut empty: Vec<u32> = Vec::new();
        exclusive_scan(&surface, &mut empty).unwrap();
    }

    #[test]
    fn test_sort_keys_one_shot() {
        let surface = Arc::new(HostSurface::new());
        let mut keys = vec![5u32, 3, 3, 1, 4, 1, 5, 9, 2, 6];
        sort_keys(&surface, &mut keys, 32).unwrap();
        assert_eq!(keys, vec![1, 1, 2, 3, 3, 4, 5, 5, 6, 9]);

        let mut empty: Vec<u32> = Vec::new();
        sort_keys(&surface, &mut empty, 32).unwrap();
        assert_eq!(
            sort_keys(&surface, &mut empty, 0),
            Err(ClppError::InvalidInput)
        );
    }

    #[test]
    fn test_sort_pairs_one_shot() {
        let surface = Arc::new(HostSurface::new());
        let mut keys = vec![0xBEEFu32, 0x1, 0xBEEF, 0x0];
        let mut values = vec![0, 1, 2, 3];
        sort_pairs(&surface, &mut keys, &mut values, 16).unwrap();
        assert_eq!(keys, vec![0x0, 0x1, 0xBEEF, 0xBEEF]);
        assert_eq!(values, vec![3, 1, 0, 2]);

        let mut short = vec![0u32; 3];
        assert_eq!(
            sort_pairs(&surface, &mut keys, &mut short, 16),
            Err(ClppError::InvalidInput)
        );
    }
}
