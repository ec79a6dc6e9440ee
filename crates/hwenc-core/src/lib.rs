//! # hwenc-core
//!
//! 硬件编码器控制库核心, 提供错误类型、定长比特流写入器、RBSP 读取器、
//! 引用计数缓冲区与源图像格式定义.
//!
//! 本 crate 不依赖任何编码标准细节, 为 NAL 生成与编码上下文提供底层基础设施.

pub mod bitreader;
pub mod bitwriter;
pub mod buffer;
pub mod error;
pub mod pic_format;

// 重导出常用类型
pub use bitreader::BitReader;
pub use bitwriter::BitstreamLite;
pub use buffer::{Buffer, BufferView};
pub use error::{EncError, EncResult};
pub use pic_format::{ChromaMode, Dimension, FourCc, PixMapMeta};
