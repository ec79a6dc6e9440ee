//! # hwenc-codec
//!
//! HEVC/AVC 硬件编码器的主机侧控制面.
//!
//! 硬件只产出 slice 数据, 其余码流 (AUD, VPS/SPS/PPS, SEI, 填充数据) 由本 crate
//! 在每个 slice 完成后写入码流缓冲区头部的预留区, 并以有序分段表
//! ([`StreamMetaData`]) 描述整个访问单元.
//!
//! ## 使用示例
//!
//! ```rust
//! use std::sync::Arc;
//! use hwenc_codec::{EncSettings, Encoder, HostAllocator, LoopbackScheduler};
//!
//! let encoder = Encoder::create(
//!     Arc::new(LoopbackScheduler::new()),
//!     Arc::new(HostAllocator::new()),
//!     EncSettings::default(),
//!     Box::new(|_event| {}),
//! )
//! .unwrap();
//! assert_eq!(encoder.settings().width, 1920);
//! ```

pub mod annexb;
pub mod encoder;
pub mod hls;
pub mod loopback;
pub mod nal;
pub mod picture;
pub mod sections;
pub mod sei;
pub mod stream;

// 重导出常用类型
pub use annexb::{AnnexBNal, split_annex_b};
pub use encoder::{
    Allocator, ChannelId, Completion, EncInfo, EncOptions, EncSettings, EncodedCallback, EncodedEvent, Encoder,
    FillerMode, GopParam, HighLevelEncoder, HostAllocator, Profile, QpTableMode, RcMode, RcParam, RecPicture,
    RequestInfo, RequestOptions, Scheduler, create_high_level_encoder,
};
pub use loopback::LoopbackScheduler;
pub use nal::{Codec, NalHeader, StartCodeMode};
pub use picture::{ErrorCode, PicStatus, PicStruct, SliceType, StreamPart};
pub use sei::{HdrSeis, SeiFlags};
pub use stream::{MAX_HEADER_SIZE, PictureMeta, SectionFlags, StreamMetaData, StreamSection};
