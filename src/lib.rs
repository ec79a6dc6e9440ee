//! # hwenc
//!
//! HEVC/AVC 硬件视频编码器的主机侧控制库.
//!
//! 硬件只产出 slice 数据. 本库负责其余全部码流: 参数集 (VPS/SPS/PPS),
//! AUD, SEI 与填充数据, 并管理编码通道的帧与码流缓冲区、动态参数修改
//! 以及逐 LCU 的 QP 表.
//!
//! # 快速开始
//!
//! ```rust
//! use std::sync::Arc;
//! use hwenc::codec::{EncSettings, Encoder, HostAllocator, LoopbackScheduler};
//!
//! let settings = EncSettings {
//!     width: 640,
//!     height: 360,
//!     ..Default::default()
//! };
//! let encoder = Encoder::create(
//!     Arc::new(LoopbackScheduler::new()),
//!     Arc::new(HostAllocator::new()),
//!     settings,
//!     Box::new(|event| println!("{:?}", event)),
//! )
//! .unwrap();
//! encoder.set_bit_rate(2_000_000).unwrap();
//! ```
//!
//! # Crate 结构
//!
//! | Crate | 功能 |
//! |-------|------|
//! | `hwenc-core` | 错误类型, 位写入器, 缓冲区与图像格式 |
//! | `hwenc-codec` | NAL 封装, 高层语法, 分段组装, 编码通道 |
//! | `hwenc-qp` | ROI 管理与 QP 表生成 |

/// 核心类型与工具
pub use hwenc_core as core;

/// 编码通道与码流生成
pub use hwenc_codec as codec;

/// QP 表与 ROI
pub use hwenc_qp as qp;

/// 获取 hwenc 版本号
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
