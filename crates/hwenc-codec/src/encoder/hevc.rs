//! HEVC 高层语法处理.

use hwenc_core::EncResult;

use super::settings::EncSettings;
use super::{HighLevelEncoder, SliceContext, max_ref, write_layer_sections};
use crate::hls::{HevcParamSets, SeiData};
use crate::nal::Codec;
use crate::stream::StreamMetaData;

/// 持有 HEVC 通道的 VPS/SPS/PPS 与 CPB 时序
#[derive(Debug, Clone)]
pub struct HevcEncoder {
    sets: HevcParamSets,
    sei: SeiData,
}

impl HevcEncoder {
    pub fn new(settings: &EncSettings) -> Self {
        Self {
            sets: HevcParamSets::generate(settings, max_ref(settings)),
            sei: SeiData::new(&settings.rc),
        }
    }

    pub fn param_sets(&self) -> &HevcParamSets {
        &self.sets
    }
}

impl HighLevelEncoder for HevcEncoder {
    fn codec(&self) -> Codec {
        Codec::Hevc
    }

    fn write_sections(&mut self, ctx: &SliceContext, stream: &mut [u8], meta: &mut StreamMetaData) -> EncResult<()> {
        self.sets.sps.update(ctx.status, ctx.settings);
        let must_write_pps = self.sets.pps.update(ctx.status);
        write_layer_sections(&self.sets, &mut self.sei, ctx, must_write_pps, stream, meta)
    }
}
