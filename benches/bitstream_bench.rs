//! hwenc 性能基准测试.
//!
//! 覆盖 NAL 防竞争处理, 参数集写入与 ROI QP 表填充.

use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use hwenc::codec::nal::{anti_emulate, flush_nal};
use hwenc::codec::{Codec, NalHeader, StartCodeMode};
use hwenc::core::{BitstreamLite, Dimension};
use hwenc::qp::{RoiManager, RoiOrder, RoiQuality};

/// 含大量 00 00 0x 序列的负载, 每 4 字节至少插入一个防竞争字节
fn emulation_heavy_payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| if i % 4 == 3 { 0x01 } else { 0x00 }).collect()
}

/// 伪随机负载, 几乎不触发防竞争
fn noisy_payload(len: usize) -> Vec<u8> {
    let mut state = 0x1234_5678u32;
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(1_103_515_245).wrapping_add(12345);
            (state >> 16) as u8 | 0x80
        })
        .collect()
}

fn bench_anti_emulation(c: &mut Criterion) {
    let mut group = c.benchmark_group("anti_emulation");
    for (name, payload) in [
        ("heavy_64k", emulation_heavy_payload(64 * 1024)),
        ("noisy_64k", noisy_payload(64 * 1024)),
    ] {
        let mut out = vec![0u8; payload.len() * 2];
        group.throughput(Throughput::Bytes(payload.len() as u64));
        group.bench_function(name, |b| {
            b.iter(|| {
                let mut bs = BitstreamLite::new(&mut out);
                anti_emulate(&mut bs, black_box(&payload));
                bs.byte_offset()
            });
        });
    }
    group.finish();
}

fn bench_flush_nal(c: &mut Criterion) {
    let rbsp = noisy_payload(256);
    let header = NalHeader::hevc(39, 0, 0);
    let mut out = vec![0u8; 1024];
    c.bench_function("flush_nal_hevc_sei_256", |b| {
        b.iter(|| {
            let mut bs = BitstreamLite::new(&mut out);
            flush_nal(
                &mut bs,
                Codec::Hevc,
                39,
                &header,
                black_box(&rbsp),
                rbsp.len() * 8,
                StartCodeMode::Auto,
            );
            bs.byte_offset()
        });
    });
}

fn bench_bit_writer(c: &mut Criterion) {
    let mut out = vec![0u8; 16 * 1024];
    c.bench_function("put_ue_se_4096", |b| {
        b.iter(|| {
            let mut bs = BitstreamLite::new(&mut out);
            for v in 0..2048u32 {
                bs.put_ue(black_box(v));
                bs.put_se(black_box(v as i32 - 1024));
            }
            bs.bits_written()
        });
    });
}

fn bench_roi_fill(c: &mut Criterion) {
    // 1080p HEVC, 60x34 个 LCU
    let mut roi = RoiManager::new(
        Codec::Hevc,
        Dimension::new(1920, 1080),
        5,
        RoiQuality::LOW,
        RoiOrder::Quality,
    );
    for i in 0..16u32 {
        let quality = match i % 3 {
            0 => RoiQuality::HIGH,
            1 => RoiQuality::MEDIUM,
            _ => RoiQuality::INTRA,
        };
        roi.add_roi((i * 113) % 1800, (i * 67) % 1000, 128, 96, quality);
    }
    let mut buf = vec![0u8; roi.num_lcus()];
    c.bench_function("roi_fill_1080p_16_regions", |b| {
        b.iter(|| roi.fill_buffer(1, 1, black_box(&mut buf)))
    });
}

criterion_group!(
    benches,
    bench_anti_emulation,
    bench_flush_nal,
    bench_bit_writer,
    bench_roi_fill
);
criterion_main!(benches);
