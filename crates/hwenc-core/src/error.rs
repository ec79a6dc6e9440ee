//! 统一错误类型定义.
//!
//! 所有 hwenc crate 共用的错误类型, 支持跨模块传播.

use thiserror::Error;

/// 编码器控制库统一错误类型
#[derive(Debug, Error)]
pub enum EncError {
    /// 无效参数
    #[error("无效参数: {0}")]
    InvalidArgument(String),

    /// 不支持的操作
    #[error("不支持的操作: {0}")]
    Unsupported(String),

    /// I/O 错误
    #[error("I/O 错误: {0}")]
    Io(#[from] std::io::Error),

    /// 文件不存在
    #[error("文件不存在: {0}")]
    FileNotFound(String),

    /// 无效数据 (文件内容损坏, 命令格式错误等)
    #[error("无效数据: {0}")]
    InvalidData(String),

    /// 内存分配失败
    #[error("内存分配失败: {0}")]
    OutOfMemory(String),

    /// 码流或缓冲区容量不足
    #[error("容量不足: {0}")]
    CapacityOverflow(String),

    /// 源图像缓冲区与通道格式不匹配
    #[error("源缓冲区格式不匹配: {0}")]
    SourceFormatMismatch(String),

    /// 调度器错误 (通道创建, 帧提交)
    #[error("调度器错误: {0}")]
    Scheduler(String),

    /// 已到达流末尾
    #[error("已到达流末尾")]
    Eof,

    /// 内部错误 (不应发生)
    #[error("内部错误: {0}")]
    Internal(String),
}

/// 编码器控制库统一 Result 类型
pub type EncResult<T> = Result<T, EncError>;
