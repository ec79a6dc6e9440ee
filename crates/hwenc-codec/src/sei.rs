//! SEI 负载写入.
//!
//! 每个 SEI 消息由 payloadType, payloadSize 与负载组成. 固定负载先写入类型和
//! 0xFF 占位的大小字节, 负载写完后回填实际大小. 多个消息打包进同一个 SEI NAL
//! 时, 由调用方在最后写入 rbsp_trailing_bits.

use bitflags::bitflags;
use hwenc_core::BitstreamLite;
use serde::{Deserialize, Serialize};

bitflags! {
    /// 需要写入的 SEI 消息
    ///
    /// 低 16 位为前缀 SEI, 高 16 位为后缀 SEI.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct SeiFlags: u32 {
        /// buffering period
        const BP = 0x0000_0001;
        /// picture timing
        const PT = 0x0000_0002;
        /// recovery point
        const RP = 0x0000_0004;
        /// mastering display colour volume
        const MDCV = 0x0000_0008;
        /// content light level
        const CLL = 0x0000_0010;
        /// alternative transfer characteristics
        const ATC = 0x0000_0020;
        /// SMPTE ST 2094-10 动态 HDR
        const ST2094_10 = 0x0000_0040;
        /// SMPTE ST 2094-40 动态 HDR
        const ST2094_40 = 0x0000_0080;
        /// 所有 HDR 相关消息
        const HDR = Self::MDCV.bits() | Self::CLL.bits() | Self::ATC.bits()
            | Self::ST2094_10.bits() | Self::ST2094_40.bits();
    }
}

impl SeiFlags {
    /// 前缀 SEI 掩码
    pub const PREFIX_MASK: u32 = 0x0000_FFFF;
    /// 后缀 SEI 掩码
    pub const SUFFIX_MASK: u32 = 0xFFFF_0000;

    /// 只保留前缀 SEI 标志
    pub fn prefix(self) -> Self {
        Self::from_bits_truncate(self.bits() & Self::PREFIX_MASK)
    }

    /// 是否请求了任何前缀 SEI
    pub fn has_prefix(self) -> bool {
        self.bits() & Self::PREFIX_MASK != 0
    }
}

/// SEI payloadType 编号
pub mod payload_type {
    pub const BUFFERING_PERIOD: u8 = 0;
    pub const PIC_TIMING: u8 = 1;
    pub const USER_DATA_REGISTERED_T35: u8 = 4;
    pub const USER_DATA_UNREGISTERED: u8 = 5;
    pub const RECOVERY_POINT: u8 = 6;
    pub const ACTIVE_PARAMETER_SETS: u8 = 129;
    pub const MASTERING_DISPLAY_COLOUR_VOLUME: u8 = 137;
    pub const CONTENT_LIGHT_LEVEL: u8 = 144;
    pub const ALTERNATIVE_TRANSFER_CHARACTERISTICS: u8 = 147;
}

/// 子帧低延迟模式下 user data unregistered SEI 使用的 UUID
pub const SUBFRAME_UUID: [u8; 16] = [
    0xb1, 0xe1, 0x67, 0xa4, 0xd9, 0xca, 0x11, 0xe7, 0xb1, 0x9b, 0x00, 0x50, 0xc2, 0x49, 0x00, 0x48,
];

/// 色度坐标 (0.00002 单位)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChromaCoord {
    pub x: u16,
    pub y: u16,
}

/// mastering display colour volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MasteringDisplayColourVolume {
    /// 三基色坐标 (G, B, R)
    pub display_primaries: [ChromaCoord; 3],
    /// 白点坐标
    pub white_point: ChromaCoord,
    /// 最大亮度 (0.0001 cd/m²)
    pub max_display_mastering_luminance: u32,
    /// 最小亮度 (0.0001 cd/m²)
    pub min_display_mastering_luminance: u32,
}

/// content light level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ContentLightLevel {
    pub max_content_light_level: u16,
    pub max_pic_average_light_level: u16,
}

/// alternative transfer characteristics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AlternativeTransferCharacteristics {
    pub preferred_transfer_characteristics: u8,
}

/// HDR 相关 SEI 的内容
///
/// ST 2094 的应用数据按字节原样写入 ITU-T T.35 负载.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HdrSeis {
    pub mdcv: Option<MasteringDisplayColourVolume>,
    pub cll: Option<ContentLightLevel>,
    pub atc: Option<AlternativeTransferCharacteristics>,
    pub st2094_10: Option<Vec<u8>>,
    pub st2094_40: Option<Vec<u8>>,
}

impl HdrSeis {
    /// 实际可写的 HDR SEI 标志
    pub fn available(&self) -> SeiFlags {
        let mut flags = SeiFlags::empty();
        flags.set(SeiFlags::MDCV, self.mdcv.is_some());
        flags.set(SeiFlags::CLL, self.cll.is_some());
        flags.set(SeiFlags::ATC, self.atc.is_some());
        flags.set(SeiFlags::ST2094_10, self.st2094_10.is_some());
        flags.set(SeiFlags::ST2094_40, self.st2094_40.is_some());
        flags
    }
}

/// 开始一个固定负载的 SEI 消息, 返回大小字节的位置 (位)
pub fn begin_sei(bs: &mut BitstreamLite, payload_type: u8) -> usize {
    bs.put_bits(8, u32::from(payload_type));
    let bookmark = bs.bits_written();
    debug_assert!(bookmark % 8 == 0, "SEI 消息未按字节对齐");
    bs.put_bits(8, 0xFF);
    bookmark
}

/// 结束 SEI 消息, 回填 payloadSize
pub fn end_sei(bs: &mut BitstreamLite, bookmark: usize) {
    let bits = bs.bits_written() - bookmark;
    debug_assert!(bits % 8 == 0, "SEI 负载未按字节对齐");
    let size = bits / 8 - 1;
    debug_assert!(size < 0xFF, "固定负载 SEI 超过 254 字节");
    bs.patch_byte(bookmark / 8, size.min(0xFE) as u8);
}

/// 写入 payloadType / payloadSize 的 0xFF 延续编码
pub fn put_uv(bs: &mut BitstreamLite, mut value: u32) {
    while value >= 255 {
        bs.put_bits(8, 0xFF);
        value -= 255;
    }
    bs.put_bits(8, value);
}

/// 开始一个已知大小的 SEI 消息
pub fn begin_sei_sized(bs: &mut BitstreamLite, payload_type: u32, payload_size: u32) {
    put_uv(bs, payload_type);
    put_uv(bs, payload_size);
}

/// SEI NAL 结尾: rbsp_trailing_bits
pub fn close_sei(bs: &mut BitstreamLite) {
    bs.rbsp_trailing_bits();
}

/// user data unregistered, 携带 slice 数, 独立成一个 NAL
pub fn write_user_data_unregistered(bs: &mut BitstreamLite, uuid: &[u8; 16], num_slices: u8) {
    let bookmark = begin_sei(bs, payload_type::USER_DATA_UNREGISTERED);
    bs.put_bytes(uuid);
    bs.put_bits(8, u32::from(num_slices));
    end_sei(bs, bookmark);
    close_sei(bs);
}

/// mastering display colour volume
pub fn write_mastering_display_colour_volume(bs: &mut BitstreamLite, mdcv: &MasteringDisplayColourVolume) {
    let bookmark = begin_sei(bs, payload_type::MASTERING_DISPLAY_COLOUR_VOLUME);
    for primary in &mdcv.display_primaries {
        bs.put_bits(16, u32::from(primary.x));
        bs.put_bits(16, u32::from(primary.y));
    }
    bs.put_bits(16, u32::from(mdcv.white_point.x));
    bs.put_bits(16, u32::from(mdcv.white_point.y));
    bs.put_bits(32, mdcv.max_display_mastering_luminance);
    bs.put_bits(32, mdcv.min_display_mastering_luminance);
    bs.end_of_sei_payload();
    end_sei(bs, bookmark);
}

/// content light level
pub fn write_content_light_level(bs: &mut BitstreamLite, cll: &ContentLightLevel) {
    let bookmark = begin_sei(bs, payload_type::CONTENT_LIGHT_LEVEL);
    bs.put_bits(16, u32::from(cll.max_content_light_level));
    bs.put_bits(16, u32::from(cll.max_pic_average_light_level));
    bs.end_of_sei_payload();
    end_sei(bs, bookmark);
}

/// alternative transfer characteristics
pub fn write_alternative_transfer_characteristics(
    bs: &mut BitstreamLite,
    atc: &AlternativeTransferCharacteristics,
) {
    let bookmark = begin_sei(bs, payload_type::ALTERNATIVE_TRANSFER_CHARACTERISTICS);
    bs.put_bits(8, u32::from(atc.preferred_transfer_characteristics));
    bs.end_of_sei_payload();
    end_sei(bs, bookmark);
}

const T35_COUNTRY_CODE_US: u8 = 0xB5;

/// ST 2094-10 (ATSC A/341 封装: provider 0x0031, "GA94", 类型 0x09)
pub fn write_st2094_10(bs: &mut BitstreamLite, app_data: &[u8]) {
    let header: [u8; 8] = [T35_COUNTRY_CODE_US, 0x00, 0x31, b'G', b'A', b'9', b'4', 0x09];
    write_t35(bs, &header, app_data);
}

/// ST 2094-40 (provider 0x003C, provider oriented code 0x0001, application id 4)
pub fn write_st2094_40(bs: &mut BitstreamLite, app_data: &[u8]) {
    let header: [u8; 6] = [T35_COUNTRY_CODE_US, 0x00, 0x3C, 0x00, 0x01, 0x04];
    write_t35(bs, &header, app_data);
}

fn write_t35(bs: &mut BitstreamLite, header: &[u8], app_data: &[u8]) {
    let size = (header.len() + app_data.len()) as u32;
    begin_sei_sized(bs, u32::from(payload_type::USER_DATA_REGISTERED_T35), size);
    bs.put_bytes(header);
    bs.put_bytes(app_data);
}

/// 应用提供的任意 SEI 消息, 独立成一个 NAL
pub fn write_external_sei(bs: &mut BitstreamLite, payload_type: u32, payload: &[u8]) {
    begin_sei_sized(bs, payload_type, payload.len() as u32);
    bs.put_bytes(payload);
    close_sei(bs);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn written(f: impl FnOnce(&mut BitstreamLite)) -> Vec<u8> {
        let mut buf = vec![0u8; 512];
        let mut bs = BitstreamLite::new(&mut buf);
        f(&mut bs);
        let n = bs.bytes_written();
        buf.truncate(n);
        buf
    }

    #[test]
    fn test_end_sei_patches_size() {
        let out = written(|bs| {
            let mark = begin_sei(bs, payload_type::CONTENT_LIGHT_LEVEL);
            bs.put_bits(16, 1000);
            bs.put_bits(16, 400);
            end_sei(bs, mark);
        });
        assert_eq!(out, vec![144, 4, 0x03, 0xE8, 0x01, 0x90]);
    }

    #[test]
    fn test_put_uv_continuation() {
        assert_eq!(written(|bs| put_uv(bs, 4)), vec![4]);
        assert_eq!(written(|bs| put_uv(bs, 255)), vec![0xFF, 0]);
        assert_eq!(written(|bs| put_uv(bs, 300)), vec![0xFF, 45]);
        assert_eq!(written(|bs| put_uv(bs, 510)), vec![0xFF, 0xFF, 0]);
    }

    #[test]
    fn test_user_data_unregistered_layout() {
        let out = written(|bs| write_user_data_unregistered(bs, &SUBFRAME_UUID, 3));
        assert_eq!(out[0], 5);
        assert_eq!(out[1], 17);
        assert_eq!(&out[2..18], &SUBFRAME_UUID);
        assert_eq!(out[18], 3);
        assert_eq!(out[19], 0x80, "应以 rbsp_trailing_bits 结尾");
        assert_eq!(out.len(), 20);
    }

    #[test]
    fn test_mdcv_size() {
        let out = written(|bs| write_mastering_display_colour_volume(bs, &MasteringDisplayColourVolume::default()));
        assert_eq!(out[0], 137);
        assert_eq!(out[1], 24);
        assert_eq!(out.len(), 26);
    }

    #[test]
    fn test_external_sei_large_payload() {
        let payload = vec![0x42u8; 300];
        let out = written(|bs| write_external_sei(bs, 5, &payload));
        assert_eq!(&out[..3], &[5, 0xFF, 45]);
        assert_eq!(out.len(), 3 + 300 + 1);
        assert_eq!(*out.last().unwrap_or(&0), 0x80);
    }

    #[test]
    fn test_st2094_40_t35_header() {
        let out = written(|bs| write_st2094_40(bs, &[0xAA, 0xBB]));
        assert_eq!(out, vec![4, 8, 0xB5, 0x00, 0x3C, 0x00, 0x01, 0x04, 0xAA, 0xBB]);
    }

    #[test]
    fn test_flag_masks() {
        let flags = SeiFlags::BP | SeiFlags::PT | SeiFlags::from_bits_retain(0x0001_0000);
        assert!(flags.has_prefix());
        assert_eq!(flags.prefix(), SeiFlags::BP | SeiFlags::PT);
        assert!(!SeiFlags::from_bits_retain(0x0002_0000).has_prefix());

        let hdr = HdrSeis {
            cll: Some(ContentLightLevel::default()),
            st2094_10: Some(vec![1]),
            ..Default::default()
        };
        assert_eq!(hdr.available(), SeiFlags::CLL | SeiFlags::ST2094_10);
    }
}
