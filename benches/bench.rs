use divan::{black_box, Bencher};
use image::{GrayImage, Luma};
use ndarray::Array2;
use phow::*;

fn main() {
    divan::main();
}

const K: usize = 600;

fn vocabulary() -> Vocabulary {
    Vocabulary::from_centroids(Array2::from_shape_fn((K, 128), |(i, j)| {
        ((i * 31 + j * 17) % 97) as f64 / 97.
    }))
    .unwrap()
}

fn image() -> GrayImage {
    GrayImage::from_fn(256, 192, |x, y| {
        Luma([((x * x + 3 * y * x + y * 7) % 251) as u8])
    })
}

fn dense_sift() -> DenseSift {
    DenseSift {
        step: 3,
        bin_size: 4,
        energy_threshold: 0.015,
    }
}

/// Benchmark for Vocabulary::assign()
#[divan::bench(sample_count = 100)]
fn assign(bencher: Bencher) {
    let voc = vocabulary();
    let features = dense_sift().detect(&image());
    bencher.bench_local(|| black_box(voc.assign_all(&features).unwrap()));
}

#[divan::bench(sample_count = 100)]
fn dense_sift_detect(bencher: Bencher) {
    let img = image();
    let sift = dense_sift();
    bencher.bench_local(|| black_box(sift.detect(&img)));
}

#[divan::bench(sample_count = 100)]
fn aggregate(bencher: Bencher) {
    let voc = vocabulary();
    let img = image();
    let features = dense_sift().detect(&img);
    let aggregator = SpatialAggregator::new(
        vec![PyramidLevel::new(2, 2), PyramidLevel::new(4, 4)],
        Normalisation::L2,
    )
    .unwrap();
    let bounds = Bounds::of_image(img.width(), img.height());
    bencher.bench_local(|| black_box(aggregator.aggregate(&voc, &features, bounds).unwrap()));
}

#[divan::bench(sample_count = 1000)]
fn kernel_map_expand(bencher: Bencher) {
    let map = HomogeneousKernelMap::new(KernelType::Chi2, 1);
    let histogram: Vec<f64> = (0..K * 20).map(|i| (i % 13) as f64 / 1000.).collect();
    bencher.bench_local(|| black_box(map.expand(&histogram)));
}
