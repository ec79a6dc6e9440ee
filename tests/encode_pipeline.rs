//! 编码通道端到端测试: 回环调度器 + 分段组装 + Annex-B 输出

use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};

use hwenc::codec::{
    Codec, EncSettings, EncodedEvent, Encoder, FillerMode, HostAllocator, LoopbackScheduler, MAX_HEADER_SIZE, Profile,
    RcMode, SectionFlags, StreamMetaData, split_annex_b,
};
use hwenc::core::{BitReader, Buffer, Dimension, PixMapMeta};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn settings(profile: Profile) -> EncSettings {
    EncSettings {
        profile,
        width: 320,
        height: 192,
        ..Default::default()
    }
}

fn source(settings: &EncSettings) -> Buffer {
    let meta = PixMapMeta::packed(Dimension::new(settings.width, settings.height), settings.fourcc);
    let frame = Buffer::new(meta.required_size(), "source");
    frame.add_meta(meta);
    frame
}

fn create(settings: &EncSettings) -> (Encoder, Receiver<EncodedEvent>) {
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
    for _ in 0..4 {
        encoder
            .put_stream_buffer(Buffer::new(MAX_HEADER_SIZE + 64 * 1024, "stream"))
            .unwrap();
    }
    (encoder, rx)
}

/// 取出已完成的码流缓冲区, 并把它们重新交给编码器
fn take_streams(encoder: &Encoder, rx: &Receiver<EncodedEvent>, requeue: bool) -> Vec<Buffer> {
    let mut streams = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let EncodedEvent::Stream { stream, .. } = event {
            streams.push(stream.clone());
            if requeue {
                let fresh = Buffer::new(stream.size(), "stream");
                encoder.put_stream_buffer(fresh).unwrap();
            }
        }
    }
    streams
}

fn collect(stream: &Buffer) -> Vec<u8> {
    let data = stream.lock_data();
    stream
        .with_meta::<StreamMetaData, _>(|meta| meta.collect(&data).to_vec())
        .unwrap()
}

fn nal_types(data: &[u8], codec: Codec) -> Vec<u8> {
    split_annex_b(data, codec).iter().map(|nal| nal.nut).collect()
}

#[test]
fn test_hevc_access_units() {
    init_logger();
    let settings = settings(Profile::HevcMain);
    let (encoder, rx) = create(&settings);
    for _ in 0..3 {
        encoder.process(Some(&source(&settings)), None).unwrap();
    }
    encoder.process(None, None).unwrap();

    let streams = take_streams(&encoder, &rx, false);
    assert_eq!(streams.len(), 3, "每帧一个码流缓冲区");

    // AUD, VPS, SPS, PPS, IDR_W_RADL
    assert_eq!(nal_types(&collect(&streams[0]), Codec::Hevc), vec![35, 32, 33, 34, 19]);
    // AUD, TRAIL_R
    assert_eq!(nal_types(&collect(&streams[1]), Codec::Hevc), vec![35, 1]);

    let sync = streams[0]
        .with_meta::<StreamMetaData, _>(|m| m.sections().iter().all(|s| s.flags.contains(SectionFlags::SYNC)))
        .unwrap();
    assert!(sync, "IDR 帧的所有分段都是同步点");
}

#[test]
fn test_avc_restart_gop_resends_parameter_sets() {
    init_logger();
    let settings = settings(Profile::AvcHigh);
    let (encoder, rx) = create(&settings);
    encoder.process(Some(&source(&settings)), None).unwrap();
    encoder.process(Some(&source(&settings)), None).unwrap();
    encoder.restart_gop().unwrap();
    encoder.process(Some(&source(&settings)), None).unwrap();

    let streams = take_streams(&encoder, &rx, true);
    assert_eq!(nal_types(&collect(&streams[0]), Codec::Avc), vec![9, 7, 8, 5]);
    assert_eq!(nal_types(&collect(&streams[1]), Codec::Avc), vec![9, 1]);
    assert_eq!(
        nal_types(&collect(&streams[2]), Codec::Avc),
        vec![9, 7, 8, 5],
        "restart_gop 之后的帧为 IDR"
    );
}

#[test]
fn test_add_prefix_sei_to_encoded_stream() {
    init_logger();
    let settings = settings(Profile::HevcMain);
    let (encoder, rx) = create(&settings);
    encoder.process(Some(&source(&settings)), None).unwrap();
    let stream = take_streams(&encoder, &rx, false).remove(0);

    let payload = [0x11u8; 24];
    let idx = encoder.add_sei(&stream, true, 5, &payload, 0).unwrap();
    let flags = stream.with_meta::<StreamMetaData, _>(|m| m.sections()[idx].flags).unwrap();
    assert!(flags.contains(SectionFlags::SEI_PREFIX));

    let nuts = nal_types(&collect(&stream), Codec::Hevc);
    assert!(nuts.contains(&39), "应包含前缀 SEI: {:?}", nuts);
    let sei_pos = nuts.iter().position(|&n| n == 39).unwrap();
    let slice_pos = nuts.iter().position(|&n| n == 19).unwrap();
    assert!(sei_pos < slice_pos, "前缀 SEI 位于 slice 之前");
}

/// 读出 HEVC PPS 中的 (cb, cr) 色度 QP 偏移
fn pps_chroma_offsets(rbsp: &[u8]) -> (i32, i32) {
    let mut r = BitReader::new(rbsp);
    r.read_ue().unwrap(); // pps_id
    r.read_ue().unwrap(); // sps_id
    r.read_bits(7).unwrap();
    r.read_ue().unwrap();
    r.read_ue().unwrap();
    r.read_se().unwrap(); // init_qp_minus26
    r.read_bits(2).unwrap();
    if r.read_flag().unwrap() {
        r.read_ue().unwrap();
    }
    (r.read_se().unwrap(), r.read_se().unwrap())
}

#[test]
fn test_chroma_offsets_change_rewrites_pps() {
    init_logger();
    let settings = settings(Profile::HevcMain);
    let (encoder, rx) = create(&settings);
    encoder.process(Some(&source(&settings)), None).unwrap();
    encoder.process(Some(&source(&settings)), None).unwrap();
    encoder.set_qp_chroma_offsets(3, -2).unwrap();
    encoder.process(Some(&source(&settings)), None).unwrap();

    let streams = take_streams(&encoder, &rx, true);
    assert_eq!(nal_types(&collect(&streams[1]), Codec::Hevc), vec![35, 1]);

    let nals = split_annex_b(&collect(&streams[2]), Codec::Hevc);
    let pps = nals.iter().find(|nal| nal.nut == 34).expect("偏移变化后的 P 帧应重写 PPS");
    assert_eq!(pps_chroma_offsets(&pps.rbsp(Codec::Hevc)), (3, -2));

    let first = split_annex_b(&collect(&streams[0]), Codec::Hevc);
    let first_pps = first.iter().find(|nal| nal.nut == 34).unwrap();
    assert_eq!(pps_chroma_offsets(&first_pps.rbsp(Codec::Hevc)), (0, 0));
}

#[test]
fn test_cbr_filler_fills_frame_budget() {
    init_logger();
    let settings = EncSettings {
        filler: FillerMode::Enable,
        rc: hwenc::codec::RcParam {
            mode: RcMode::Cbr,
            target_bit_rate: 240_000,
            max_bit_rate: 240_000,
            ..Default::default()
        },
        ..settings(Profile::HevcMain)
    };
    let (encoder, rx) = create(&settings);
    encoder.process(Some(&source(&settings)), None).unwrap();
    encoder.process(Some(&source(&settings)), None).unwrap();

    let streams = take_streams(&encoder, &rx, false);
    let p_frame = &streams[1];
    let has_filler = p_frame
        .with_meta::<StreamMetaData, _>(|m| m.sections().iter().any(|s| s.flags.contains(SectionFlags::FILLER)))
        .unwrap();
    assert!(has_filler, "CBR 下应写入填充数据");
    let nuts = nal_types(&collect(p_frame), Codec::Hevc);
    assert_eq!(nuts.last(), Some(&38), "填充 NAL 位于帧尾");
}

#[test]
fn test_mismatched_source_is_rejected() {
    init_logger();
    let settings = settings(Profile::HevcMain);
    let (encoder, _rx) = create(&settings);
    let other = EncSettings {
        width: 640,
        height: 360,
        ..settings.clone()
    };
    assert!(encoder.process(Some(&source(&other)), None).is_err());
    encoder.process(Some(&source(&settings)), None).unwrap();
}
