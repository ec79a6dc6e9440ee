//! # hwenc-qp
//!
//! 硬件编码器的 QP 表生成: ROI 管理器, ROI 描述文件, 以及十六进制文件和
//! 合成图样的逐帧 QP 表.
//!
//! QP 表每 LCU 一个字节, 按光栅顺序排列: 低 6 位为有符号 delta-QP (或绝对 QP),
//! bit 6 强制帧内, bit 7 强制 MV0.

pub mod qp_generator;
pub mod roi;
pub mod roi_file;

// 重导出常用类型
pub use qp_generator::{QpControl, QpFrameParams, QpGenerator, QpMode, QpTableError, QpTableLayout};
pub use roi::{RoiManager, RoiOrder, RoiQuality, decode_delta_qp};
pub use roi_file::{RoiFrame, RoiRegion, load_roi_frame, parse_roi_frame};
