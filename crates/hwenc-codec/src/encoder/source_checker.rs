//! 源帧合法性检查.

use hwenc_core::pic_format::BURST_ALIGNMENT;
use hwenc_core::{Buffer, Dimension, EncError, EncResult, FourCc, PixMapMeta};

/// 检查源帧布局是否满足通道要求
#[derive(Debug, Clone)]
pub struct SourceChecker {
    max_dim: Dimension,
    dim: Dimension,
    fourcc: FourCc,
}

impl SourceChecker {
    pub fn new(dim: Dimension, max_dim: Dimension, fourcc: FourCc) -> Self {
        Self { max_dim, dim, fourcc }
    }

    /// 当前期望的输入分辨率
    pub fn dim(&self) -> Dimension {
        self.dim
    }

    /// 输入分辨率变化, 不能超过通道创建时的最大分辨率
    pub fn update_resolution(&mut self, dim: Dimension) -> EncResult<()> {
        if dim.width == 0 || dim.height == 0 || !dim.fits_in(&self.max_dim) {
            return Err(EncError::InvalidArgument(format!(
                "输入分辨率 {} 超出范围 (最大 {})",
                dim, self.max_dim
            )));
        }
        self.dim = dim;
        Ok(())
    }

    /// 源帧可用时返回 true
    pub fn can_be_used(&self, buffer: &Buffer) -> bool {
        self.check(buffer).is_ok()
    }

    /// 逐项检查, 失败时给出原因
    pub fn check(&self, buffer: &Buffer) -> EncResult<()> {
        let meta = buffer
            .with_meta::<PixMapMeta, _>(|m| *m)
            .ok_or_else(|| EncError::SourceFormatMismatch("源帧缺少图像布局元数据".into()))?;

        if meta.dim != self.dim {
            return Err(EncError::SourceFormatMismatch(format!(
                "源帧尺寸 {} 与通道输入 {} 不一致",
                meta.dim, self.dim
            )));
        }
        if meta.fourcc != self.fourcc {
            return Err(EncError::SourceFormatMismatch(format!(
                "源帧格式 {} 与通道格式 {} 不一致",
                meta.fourcc, self.fourcc
            )));
        }
        let min_pitch = self.fourcc.min_pitch(meta.dim.width);
        if meta.luma_pitch < min_pitch || meta.luma_pitch % BURST_ALIGNMENT != 0 {
            return Err(EncError::SourceFormatMismatch(format!(
                "亮度行跨度 {} 非法 (最小 {}, 需 {} 字节对齐)",
                meta.luma_pitch, min_pitch, BURST_ALIGNMENT
            )));
        }
        let chroma_pitch = self.fourcc.chroma_pitch(meta.luma_pitch);
        if meta.chroma_pitch != chroma_pitch {
            return Err(EncError::SourceFormatMismatch(format!(
                "色度行跨度 {} 与亮度行跨度不匹配 (应为 {})",
                meta.chroma_pitch, chroma_pitch
            )));
        }
        let luma_size = meta.luma_pitch as usize * meta.dim.height as usize;
        if chroma_pitch != 0 && meta.chroma_offset < luma_size {
            return Err(EncError::SourceFormatMismatch(format!(
                "色度平面偏移 {} 与亮度平面重叠",
                meta.chroma_offset
            )));
        }
        let required = meta.required_size();
        if buffer.size() < required {
            return Err(EncError::SourceFormatMismatch(format!(
                "源帧缓冲区过小: {} < {}",
                buffer.size(),
                required
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(meta: PixMapMeta) -> Buffer {
        let buf = Buffer::new(meta.required_size(), "src");
        buf.add_meta(meta);
        buf
    }

    #[test]
    fn test_packed_nv12_accepted() {
        let dim = Dimension::new(1920, 1080);
        let checker = SourceChecker::new(dim, dim, FourCc::Nv12);
        assert!(checker.can_be_used(&source(PixMapMeta::packed(dim, FourCc::Nv12))));
    }

    #[test]
    fn test_rejects_mismatch() {
        let dim = Dimension::new(640, 480);
        let checker = SourceChecker::new(dim, dim, FourCc::Nv12);

        assert!(!checker.can_be_used(&Buffer::new(640 * 480 * 2, "raw")));
        assert!(!checker.can_be_used(&source(PixMapMeta::packed(dim, FourCc::P010))));
        assert!(!checker.can_be_used(&source(PixMapMeta::packed(Dimension::new(320, 240), FourCc::Nv12))));

        let mut meta = PixMapMeta::packed(dim, FourCc::Nv12);
        meta.luma_pitch = 650;
        meta.chroma_pitch = 650;
        assert!(matches!(
            checker.check(&source(meta)),
            Err(EncError::SourceFormatMismatch(_))
        ));

        let small = Buffer::new(640 * 480, "small");
        small.add_meta(PixMapMeta::packed(dim, FourCc::Nv12));
        assert!(!checker.can_be_used(&small));
    }

    #[test]
    fn test_update_resolution() {
        let max = Dimension::new(1280, 720);
        let mut checker = SourceChecker::new(max, max, FourCc::Nv12);
        assert!(checker.update_resolution(Dimension::new(1920, 1080)).is_err());
        checker.update_resolution(Dimension::new(640, 360)).unwrap();
        let meta = PixMapMeta::packed(Dimension::new(640, 360), FourCc::Nv12);
        assert!(checker.can_be_used(&source(meta)));
    }
}
