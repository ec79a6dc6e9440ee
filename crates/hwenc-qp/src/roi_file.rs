//! ROI 描述文件.
//!
//! 文件由若干帧段组成, 每段以 `frame <帧号>` 开头, 可带 `BkgQuality=<质量>` 与
//! `Order=INCOMING_ORDER|QUALITY_ORDER` 选项, 之后每行一个区域 `x:y,宽x高,质量`:
//!
//! ```text
//! frame 0, BkgQuality=LOW_QUALITY, Order=QUALITY_ORDER
//! 0:0,256x128,HIGH_QUALITY
//! 512:256,128x128,-8
//! frame 10
//! 64:64,64x64,INTRA_QUALITY
//! ```
//!
//! 找不到某帧的段时沿用上一次加载的区域.

use std::fs;
use std::io;
use std::path::Path;

use log::{debug, warn};

use crate::qp_generator::QpTableError;
use crate::roi::{RoiManager, RoiOrder, RoiQuality};

const FRAME_KEYWORD: &str = "frame";

/// 一个 ROI 区域 (像素坐标)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoiRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub quality: RoiQuality,
}

/// 一帧的 ROI 描述
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RoiFrame {
    pub bkg_quality: Option<RoiQuality>,
    pub order: Option<RoiOrder>,
    pub regions: Vec<RoiRegion>,
}

/// 行内 `frame` 关键字之后的帧号
fn header_frame_id(line: &str) -> Option<u32> {
    let pos = line.find(FRAME_KEYWORD)?;
    let rest = line[pos + FRAME_KEYWORD.len()..].trim_start();
    let end = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
    rest[..end].parse().ok()
}

/// 取 `key=value` 中的值, 值以逗号或空白结束
fn option_value<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let pos = line.find(key)?;
    let rest = line[pos + key.len()..].trim_start_matches([' ', '\t', '=']);
    let end = rest.find([',', ' ', '\t']).unwrap_or(rest.len());
    Some(&rest[..end])
}

fn is_blank(line: &str) -> bool {
    !line.chars().any(|c| c.is_ascii_alphanumeric())
}

fn parse_pair(s: &str, sep: char) -> Option<(u32, u32)> {
    let (a, b) = s.split_once(sep)?;
    Some((a.trim().parse().ok()?, b.trim().parse().ok()?))
}

/// 解析区域行 `x:y,宽x高,质量`
fn parse_region(line: &str) -> Option<RoiRegion> {
    let mut fields = line.splitn(3, ',');
    let (x, y) = parse_pair(fields.next()?, ':')?;
    let (width, height) = parse_pair(fields.next()?, 'x')?;
    let quality = RoiQuality::parse(fields.next()?.trim_end_matches([',', ' ', '\t', '\r']))?;
    Some(RoiRegion {
        x,
        y,
        width,
        height,
        quality,
    })
}

/// 从文件内容中取出指定帧的 ROI 描述, 没有该帧时返回 None
pub fn parse_roi_frame(content: &str, frame_id: u32) -> Result<Option<RoiFrame>, String> {
    let mut lines = content.lines().enumerate();
    let header = lines.by_ref().find(|(_, line)| header_frame_id(line) == Some(frame_id));
    let Some((_, header)) = header else {
        return Ok(None);
    };

    let mut frame = RoiFrame {
        bkg_quality: match option_value(header, "BkgQuality") {
            Some(value) => Some(RoiQuality::parse(value).ok_or_else(|| format!("无效的背景质量 {:?}", value))?),
            None => None,
        },
        order: option_value(header, "Order").map(RoiOrder::parse),
        regions: Vec::new(),
    };

    for (idx, line) in lines {
        if line.contains(FRAME_KEYWORD) {
            break;
        }
        if is_blank(line) {
            continue;
        }
        let region = parse_region(line).ok_or_else(|| format!("第 {} 行不是有效的 ROI: {:?}", idx + 1, line))?;
        frame.regions.push(region);
    }
    Ok(Some(frame))
}

/// 加载指定帧的 ROI 到管理器
pub fn load_roi_frame(path: &Path, frame_id: u32, roi: &mut RoiManager) -> Result<(), QpTableError> {
    let content = fs::read_to_string(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => QpTableError::FileNotFound(path.to_path_buf()),
        _ => QpTableError::FileError(path.to_path_buf(), e.to_string()),
    })?;
    let Some(frame) =
        parse_roi_frame(&content, frame_id).map_err(|reason| QpTableError::FileError(path.to_path_buf(), reason))?
    else {
        return Ok(());
    };

    if let Some(quality) = frame.bkg_quality {
        roi.set_bkg_quality(quality);
    }
    if let Some(order) = frame.order {
        roi.set_order(order);
    }
    roi.clear();
    for r in &frame.regions {
        if !roi.add_roi(r.x, r.y, r.width, r.height, r.quality) {
            warn!("第 {} 帧的 ROI {}:{} 在图像之外, 已忽略", frame_id, r.x, r.y);
        }
    }
    debug!("第 {} 帧加载了 {} 个 ROI", frame_id, roi.num_rois());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hwenc_codec::Codec;
    use hwenc_core::Dimension;

    const SAMPLE: &str = "\
frame 0, BkgQuality=LOW_QUALITY, Order=INCOMING_ORDER
0:0,64x64,HIGH_QUALITY

32:32,64x32,-8
frame 2
64:0,32x32,INTRA_QUALITY
";

    #[test]
    fn test_parse_frame_sections() {
        let frame = parse_roi_frame(SAMPLE, 0).unwrap().unwrap();
        assert_eq!(frame.bkg_quality, Some(RoiQuality::LOW));
        assert_eq!(frame.order, Some(RoiOrder::Incoming));
        assert_eq!(frame.regions.len(), 2);
        assert_eq!(
            frame.regions[1],
            RoiRegion {
                x: 32,
                y: 32,
                width: 64,
                height: 32,
                quality: RoiQuality(-8),
            }
        );

        let frame = parse_roi_frame(SAMPLE, 2).unwrap().unwrap();
        assert_eq!(frame.bkg_quality, None);
        assert_eq!(frame.regions[0].quality, RoiQuality::INTRA);

        assert_eq!(parse_roi_frame(SAMPLE, 1).unwrap(), None);
    }

    #[test]
    fn test_malformed_region() {
        let err = parse_roi_frame("frame 0\n10;10,5x5,HIGH_QUALITY\n", 0).unwrap_err();
        assert!(err.contains("第 2 行"), "错误信息应包含行号: {}", err);
        assert!(parse_roi_frame("frame 0\n0:0,8x8,BEST\n", 0).is_err());
    }

    #[test]
    fn test_load_keeps_previous_rois() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ROI.txt");
        fs::write(&path, SAMPLE).unwrap();

        let mut roi = RoiManager::new(
            Codec::Hevc,
            Dimension::new(256, 256),
            5,
            RoiQuality::MEDIUM,
            RoiOrder::Quality,
        );
        load_roi_frame(&path, 0, &mut roi).unwrap();
        assert_eq!(roi.num_rois(), 2);
        assert_eq!(roi.bkg_quality(), RoiQuality::LOW);
        assert_eq!(roi.order(), RoiOrder::Incoming);

        load_roi_frame(&path, 1, &mut roi).unwrap();
        assert_eq!(roi.num_rois(), 2, "没有该帧的段时沿用上一帧");

        load_roi_frame(&path, 2, &mut roi).unwrap();
        assert_eq!(roi.num_rois(), 1);

        let missing = dir.path().join("none.txt");
        assert!(matches!(
            load_roi_frame(&missing, 0, &mut roi),
            Err(QpTableError::FileNotFound(_))
        ));
    }
}
