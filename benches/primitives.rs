use std::sync::Arc;
use std::time::Duration;

use clpp::host::HostSurface;
use clpp::{BlockScanEngine, DeviceSurface, RadixSortEngine, ScanConfig, SortConfig};
use criterion::measurement::WallTime;
use criterion::{criterion_group, criterion_main, BenchmarkGroup, BenchmarkId, Criterion, Throughput};

const SIZES_HOST: &[usize] = &[1 << 10, 1 << 14, 1 << 18];
#[cfg(any(feature = "opencl", feature = "webgpu"))]
const SIZES_GPU: &[usize] = &[1 << 16, 1 << 20, 1 << 23];

fn cap(group: &mut BenchmarkGroup<'_, WallTime>) {
    group.warm_up_time(Duration::from_secs(2));
    group.measurement_time(Duration::from_secs(5));
    group.sample_size(10);
}

/// Deterministic pseudo-random keys (xorshift32).
fn test_keys(n: usize) -> Vec<u32> {
    let mut x = 0x9E37_79B9u32;
    (0..n)
        .map(|_| {
            x ^= x << 13;
            x ^= x >> 17;
            x ^= x << 5;
            x
        })
        .collect()
}

fn bench_surface<S: DeviceSurface>(c: &mut Criterion, label: &str, surface: Arc<S>, sizes: &[usize]) {
    let max = sizes.iter().copied().max().unwrap_or(0);
    let mut scan = BlockScanEngine::new(Arc::clone(&surface), ScanConfig::new(max)).unwrap();
    let mut sort = RadixSortEngine::new(Arc::clone(&surface), SortConfig::new(max)).unwrap();

    let mut group = c.benchmark_group(format!("primitives_{label}"));
    cap(&mut group);
    for &size in sizes {
        let keys = test_keys(size);
        let values: Vec<u32> = (0..size as u32).collect();
        group.throughput(Throughput::Elements(size as u64));

        group.bench_with_input(BenchmarkId::new("scan", size), &keys, |b, keys| {
            b.iter(|| {
                scan.push(keys).unwrap();
                scan.scan().unwrap();
                scan.wait_completion().unwrap();
            });
        });

        group.bench_with_input(BenchmarkId::new("sort_keys", size), &keys, |b, keys| {
            b.iter(|| {
                sort.push_keys(keys).unwrap();
                sort.sort().unwrap();
                sort.wait_completion().unwrap();
            });
        });

        group.bench_with_input(BenchmarkId::new("sort_pairs", size), &keys, |b, keys| {
            b.iter(|| {
                sort.push_pairs(keys, &values).unwrap();
                sort.sort().unwrap();
                sort.wait_completion().unwrap();
            });
        });

        let mut reference = keys.clone();
        group.bench_function(BenchmarkId::new("cpu_sort_unstable", size), |b| {
            b.iter(|| {
                reference.copy_from_slice(&keys);
                reference.sort_unstable();
            });
        });
    }
    group.finish();
}

fn bench_host(c: &mut Criterion) {
    bench_surface(c, "host", Arc::new(HostSurface::new()), SIZES_HOST);
}

#[cfg(feature = "opencl")]
fn bench_opencl(c: &mut Criterion) {
    use clpp::opencl::OpenClSurface;

    let surface = match OpenClSurface::new(clpp::SurfaceOptions::default()) {
        Ok(s) => Arc::new(s),
        Err(_) => {
            eprintln!("primitives: no OpenCL device, skipping OpenCL benchmarks");
            return;
        }
    };
    eprintln!("primitives: OpenCL device: {}", surface.device_name());
    bench_surface(c, "opencl", surface, SIZES_GPU);
}

#[cfg(not(feature = "opencl"))]
fn bench_opencl(_c: &mut Criterion) {}

#[cfg(feature = "webgpu")]
fn bench_webgpu(c: &mut Criterion) {
    use clpp::webgpu::WebGpuSurface;

    let surface = match WebGpuSurface::new(clpp::SurfaceOptions::default()) {
        Ok(s) => Arc::new(s),
        Err(_) => {
            eprintln!("primitives: no WebGPU device, skipping WebGPU benchmarks");
            return;
        }
    };
    eprintln!("primitives: WebGPU device: {}", surface.device_name());
    bench_surface(c, "webgpu", surface, SIZES_GPU);
}

#[cfg(not(feature = "webgpu"))]
fn bench_webgpu(_c: &mut Criterion) {}

criterion_group!(benches, bench_host, bench_opencl, bench_webgpu);
criterion_main!(benches);
