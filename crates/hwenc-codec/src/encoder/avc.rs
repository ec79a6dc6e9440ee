//! AVC 高层语法处理.

use hwenc_core::EncResult;

use super::settings::EncSettings;
use super::{HighLevelEncoder, SliceContext, max_ref, write_layer_sections};
use crate::hls::{AvcParamSets, SeiData};
use crate::nal::Codec;
use crate::stream::StreamMetaData;

/// 持有 AVC 通道的 SPS/PPS 与 CPB 时序
#[derive(Debug, Clone)]
pub struct AvcEncoder {
    sets: AvcParamSets,
    sei: SeiData,
}

impl AvcEncoder {
    pub fn new(settings: &EncSettings) -> Self {
        Self {
            sets: AvcParamSets::generate(settings, max_ref(settings)),
            sei: SeiData::new(&settings.rc),
        }
    }

    /// 当前参数集
    pub fn param_sets(&self) -> &AvcParamSets {
        &self.sets
    }
}

impl HighLevelEncoder for AvcEncoder {
    fn codec(&self) -> Codec {
        Codec::Avc
    }

    fn write_sections(&mut self, ctx: &SliceContext, stream: &mut [u8], meta: &mut StreamMetaData) -> EncResult<()> {
        self.sets.sps.update(ctx.status, ctx.settings);
        let must_write_pps = self.sets.pps.update(ctx.status);
        write_layer_sections(&self.sets, &mut self.sei, ctx, must_write_pps, stream, meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annexb::split_annex_b;
    use crate::encoder::settings::Profile;
    use crate::picture::{PicStatus, SliceType, StreamPart};
    use crate::stream::{MAX_HEADER_SIZE, SectionFlags};
    use hwenc_core::Dimension;

    fn settings() -> EncSettings {
        EncSettings {
            profile: Profile::AvcHigh,
            level: 40,
            ..Default::default()
        }
    }

    fn status(slice_type: SliceType, is_idr: bool, pps_qp: i32) -> PicStatus {
        PicStatus {
            slice_type,
            is_idr,
            is_first_slice: true,
            is_last_slice: true,
            pps_qp,
            pic_dim: Dimension::new(1920, 1080),
            stream_parts: vec![StreamPart {
                offset: MAX_HEADER_SIZE as u32,
                size: 100,
            }],
            ..Default::default()
        }
    }

    fn config_nal_types(stream: &[u8], meta: &StreamMetaData) -> Vec<u8> {
        meta.sections()
            .iter()
            .filter(|s| s.flags.contains(SectionFlags::CONFIG))
            .flat_map(|s| split_annex_b(&stream[s.offset as usize..s.end() as usize], Codec::Avc))
            .map(|n| n.nut)
            .collect()
    }

    #[test]
    fn test_pps_rewritten_when_qp_changes() {
        let settings = settings();
        let mut enc = AvcEncoder::new(&settings);
        let mut stream = vec![0u8; MAX_HEADER_SIZE + 256];

        // IDR: AUD SPS PPS
        let idr = status(SliceType::I, true, 30);
        let mut meta = StreamMetaData::default();
        let ctx = SliceContext { settings: &settings, status: &idr, dyn_hdr_changed: false };
        enc.write_sections(&ctx, &mut stream, &mut meta).unwrap();
        assert_eq!(config_nal_types(&stream, &meta), vec![9, 7, 8]);
        assert_eq!(enc.param_sets().pps.pic_init_qp_minus26, 4);

        // 同一 QP 的 P 帧: 只有 AUD
        let p = status(SliceType::P, false, 30);
        let mut meta = StreamMetaData::default();
        let ctx = SliceContext { settings: &settings, status: &p, dyn_hdr_changed: false };
        enc.write_sections(&ctx, &mut stream, &mut meta).unwrap();
        assert_eq!(config_nal_types(&stream, &meta), vec![9]);

        // QP 变化: 重写 PPS
        let p = status(SliceType::P, false, 24);
        let mut meta = StreamMetaData::default();
        let ctx = SliceContext { settings: &settings, status: &p, dyn_hdr_changed: false };
        enc.write_sections(&ctx, &mut stream, &mut meta).unwrap();
        assert_eq!(config_nal_types(&stream, &meta), vec![9, 8]);
    }
}
