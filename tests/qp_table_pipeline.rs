//! QP 表生成与随帧提交测试

use std::fs;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use hwenc::codec::{
    Codec, EncSettings, EncodedEvent, Encoder, HostAllocator, LoopbackScheduler, MAX_HEADER_SIZE, QpTableMode,
};
use hwenc::core::{Buffer, Dimension, PixMapMeta};
use hwenc::qp::{QpControl, QpFrameParams, QpGenerator, QpMode, QpTableError, decode_delta_qp};

const ROI_FILE: &str = "\
frame 0, BkgQuality=LOW_QUALITY, Order=QUALITY_ORDER
0:0,64x64,HIGH_QUALITY
frame 3, BkgQuality=MEDIUM_QUALITY
128:64,32x32,INTRA_QUALITY
";

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn params(frame_id: u32) -> QpFrameParams {
    QpFrameParams {
        frame_id,
        slice_qp: 30,
        min_qp: 0,
        max_qp: 51,
    }
}

/// 256x128 的 HEVC 图像, 8x4 个 32x32 LCU
fn roi_generator(dir: &std::path::Path) -> QpGenerator {
    let roi_path = dir.join("roi.txt");
    fs::write(&roi_path, ROI_FILE).unwrap();
    QpGenerator::new(
        Codec::Hevc,
        Dimension::new(256, 128),
        5,
        QpControl {
            mode: QpMode::Roi,
            relative: true,
        },
    )
    .with_roi_file(roi_path)
}

#[test]
fn test_roi_table_across_frames() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let mut generator = roi_generator(dir.path());
    assert_eq!(generator.layout().num_lcus(), 32);
    assert_eq!(generator.layout().table_size(), 128);

    let mut table = vec![0u8; generator.layout().table_size()];
    assert!(generator.generate(&params(0), &mut table).unwrap());
    let qp = |table: &[u8], x: usize, y: usize| decode_delta_qp(table[y * 8 + x]);
    assert_eq!(qp(&table, 0, 0), -5);
    assert_eq!(qp(&table, 1, 1), -5);
    assert_eq!(qp(&table, 2, 0), 0, "右侧边界被平滑");
    assert_eq!(qp(&table, 0, 2), 0, "下方边界被平滑");
    assert_eq!(qp(&table, 2, 2), 0, "角被平滑");
    assert_eq!(qp(&table, 5, 3), 5, "背景为低质量");
    assert!(table[32..].iter().all(|&b| b == 0), "对齐填充保持为 0");

    // 第 1 帧没有描述, 沿用第 0 帧
    let mut next = vec![0u8; table.len()];
    generator.generate(&params(1), &mut next).unwrap();
    assert_eq!(next, table);

    generator.generate(&params(3), &mut next).unwrap();
    assert_eq!(next[2 * 8 + 4], 0x40, "帧内强制标志");
    assert_eq!(qp(&next, 0, 0), 0, "背景改为中等质量");
}

#[test]
fn test_missing_roi_file() {
    let dir = tempfile::tempdir().unwrap();
    let mut generator = QpGenerator::new(
        Codec::Avc,
        Dimension::new(64, 64),
        4,
        QpControl {
            mode: QpMode::Roi,
            relative: true,
        },
    )
    .with_roi_file(dir.path().join("missing.txt"));
    let mut table = vec![0u8; 128];
    let err = generator.generate(&params(0), &mut table).unwrap_err();
    assert!(matches!(err, QpTableError::FileNotFound(_)));
}

#[test]
fn test_qp_table_submitted_with_frame() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let settings = EncSettings {
        width: 256,
        height: 128,
        qp_table: QpTableMode::Relative,
        ..Default::default()
    };
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    let encoder = Encoder::create(
        Arc::new(LoopbackScheduler::new()),
        Arc::new(HostAllocator::new()),
        settings.clone(),
        Box::new(move |event| {
            let _ = tx.lock().unwrap().send(event);
        }),
    )
    .unwrap();
    for _ in 0..2 {
        encoder
            .put_stream_buffer(Buffer::new(MAX_HEADER_SIZE + 16 * 1024, "stream"))
            .unwrap();
    }

    let mut generator = roi_generator(dir.path());
    for frame_id in 0..2 {
        let table = Buffer::new(generator.layout().table_size(), "qp_table");
        assert!(generator.generate(&params(frame_id), table.lock_data().as_mut_slice()).unwrap());

        let meta = PixMapMeta::packed(settings.dim(), settings.fourcc);
        let source = Buffer::new(meta.required_size(), "source");
        source.add_meta(meta);
        encoder.process(Some(&source), Some(&table)).unwrap();
    }
    encoder.process(None, None).unwrap();

    let events: Vec<EncodedEvent> = rx.try_iter().collect();
    let streams = events
        .iter()
        .filter(|e| matches!(e, EncodedEvent::Stream { .. }))
        .count();
    assert_eq!(streams, 2, "两帧都已编码");
    assert!(events.iter().any(|e| matches!(e, EncodedEvent::EndOfStream)));
}

#[test]
fn test_qp_table_rejected_without_qp_mode() {
    let settings = EncSettings {
        width: 256,
        height: 128,
        ..Default::default()
    };
    let encoder = Encoder::create(
        Arc::new(LoopbackScheduler::new()),
        Arc::new(HostAllocator::new()),
        settings.clone(),
        Box::new(|_| {}),
    )
    .unwrap();
    let meta = PixMapMeta::packed(settings.dim(), settings.fourcc);
    let source = Buffer::new(meta.required_size(), "source");
    source.add_meta(meta);
    let table = Buffer::new(128, "qp_table");
    assert!(encoder.process(Some(&source), Some(&table)).is_err());
}
