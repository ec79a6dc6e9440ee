//! ROI 管理器.
//!
//! 在 LCU 网格上维护一组矩形感兴趣区域, 生成每 LCU 一个字节的 QP 表:
//! 低 6 位为有符号 delta-QP, bit 6 为强制帧内, bit 7 为强制 MV0.
//!
//! 填充分两遍: 先以背景质量填满整张表, 再按节点顺序逐个写入 ROI 并平滑其四周边界.
//! 后画的节点会覆盖先画节点的区域与过渡带.

use hwenc_codec::Codec;
use hwenc_core::{Dimension, EncError, EncResult};
use log::trace;

/// delta-QP 所占位数
pub const QP_BITS: u32 = 6;
/// delta-QP 掩码
pub const MASK_QP: u8 = (1 << QP_BITS) - 1;
/// 强制帧内
pub const MASK_FORCE_INTRA: u8 = 1 << QP_BITS;
/// 强制 MV0 (跳过)
pub const MASK_FORCE_MV0: u8 = 1 << (QP_BITS + 1);
/// 所有强制标志
pub const MASK_FORCE: u8 = MASK_FORCE_INTRA | MASK_FORCE_MV0;

/// ROI 质量, 数值为期望的 delta-QP
///
/// [`RoiQuality::INTRA`] 是特殊值, 表示强制帧内编码而不改变 QP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RoiQuality(pub i32);

impl RoiQuality {
    pub const HIGH: Self = Self(-5);
    pub const MEDIUM: Self = Self(0);
    pub const LOW: Self = Self(5);
    pub const DONT_CARE: Self = Self(31);
    pub const INTRA: Self = Self(MASK_FORCE_INTRA as i32);

    /// 解析质量名或整数
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "HIGH_QUALITY" => Some(Self::HIGH),
            "MEDIUM_QUALITY" => Some(Self::MEDIUM),
            "LOW_QUALITY" => Some(Self::LOW),
            "NO_QUALITY" => Some(Self::DONT_CARE),
            "INTRA_QUALITY" => Some(Self::INTRA),
            other => other.parse().ok().map(Self),
        }
    }

    /// QP 表中的编码值
    pub fn table_byte(self) -> u8 {
        if self == Self::INTRA {
            return MASK_FORCE_INTRA;
        }
        (self.0 as u8) & MASK_QP
    }
}

impl Default for RoiQuality {
    fn default() -> Self {
        Self::MEDIUM
    }
}

/// 重叠 ROI 的优先级
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RoiOrder {
    /// 按添加顺序, 后添加的优先
    #[default]
    Incoming,
    /// 按质量, 质量高 (delta-QP 小) 的优先
    Quality,
}

impl RoiOrder {
    pub fn parse(s: &str) -> Self {
        if s.trim() == "INCOMING_ORDER" {
            Self::Incoming
        } else {
            Self::Quality
        }
    }
}

/// 取出表项中的 delta-QP (符号扩展)
pub fn decode_delta_qp(byte: u8) -> i8 {
    (((byte & MASK_QP) << (8 - QP_BITS)) as i8) >> (8 - QP_BITS)
}

/// 各标准 delta-QP 的取值范围
pub fn delta_qp_range(codec: Codec) -> (i8, i8) {
    match codec {
        Codec::Avc | Codec::Hevc => (-32, 31),
    }
}

/// LCU 网格上的一个 ROI
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RoiNode {
    x: u32,
    y: u32,
    width: u32,
    height: u32,
    delta_qp: u8,
}

/// 写入一个 ROI 单元, 保留已有的强制帧内标志
fn set_lcu_quality(cell: &mut u8, roi: u8) {
    *cell = if roi & MASK_FORCE_INTRA != 0 {
        (*cell & MASK_QP) | MASK_FORCE_INTRA
    } else if *cell & MASK_FORCE_INTRA != 0 && roi & MASK_FORCE_MV0 == 0 {
        roi | MASK_FORCE_INTRA
    } else {
        roi
    };
}

/// ROI 管理器
#[derive(Debug, Clone)]
pub struct RoiManager {
    pic_dim: Dimension,
    lcu_log2: u8,
    lcu_width: u32,
    lcu_height: u32,
    min_qp: i8,
    max_qp: i8,
    bkg_quality: RoiQuality,
    order: RoiOrder,
    nodes: Vec<RoiNode>,
}

impl RoiManager {
    pub fn new(codec: Codec, pic_dim: Dimension, lcu_log2: u8, bkg_quality: RoiQuality, order: RoiOrder) -> Self {
        let (min_qp, max_qp) = delta_qp_range(codec);
        let lcu_size = 1u32 << lcu_log2;
        Self {
            pic_dim,
            lcu_log2,
            lcu_width: pic_dim.width.div_ceil(lcu_size),
            lcu_height: pic_dim.height.div_ceil(lcu_size),
            min_qp,
            max_qp,
            bkg_quality,
            order,
            nodes: Vec::new(),
        }
    }

    /// LCU 网格宽度
    pub fn lcu_width(&self) -> u32 {
        self.lcu_width
    }

    /// LCU 网格高度
    pub fn lcu_height(&self) -> u32 {
        self.lcu_height
    }

    pub fn num_lcus(&self) -> usize {
        self.lcu_width as usize * self.lcu_height as usize
    }

    pub fn num_rois(&self) -> usize {
        self.nodes.len()
    }

    pub fn bkg_quality(&self) -> RoiQuality {
        self.bkg_quality
    }

    pub fn order(&self) -> RoiOrder {
        self.order
    }

    pub fn set_bkg_quality(&mut self, quality: RoiQuality) {
        self.bkg_quality = quality;
    }

    /// 修改优先级; 只影响之后添加的 ROI
    pub fn set_order(&mut self, order: RoiOrder) {
        self.order = order;
    }

    /// 删除所有 ROI
    pub fn clear(&mut self) {
        self.nodes.clear();
    }

    /// 删除所有 ROI 并重设背景质量与优先级
    pub fn reset(&mut self, bkg_quality: RoiQuality, order: RoiOrder) {
        self.clear();
        self.bkg_quality = bkg_quality;
        self.order = order;
    }

    /// 添加一个 ROI (像素坐标), 左上角在图像之外时返回 false
    pub fn add_roi(&mut self, x: u32, y: u32, width: u32, height: u32, quality: RoiQuality) -> bool {
        if x >= self.pic_dim.width || y >= self.pic_dim.height {
            return false;
        }
        let lcu_size = 1u32 << self.lcu_log2;
        let x = x >> self.lcu_log2;
        let y = y >> self.lcu_log2;
        let width = width.div_ceil(lcu_size);
        let height = height.div_ceil(lcu_size);

        let node = RoiNode {
            x,
            y,
            width: width.min(self.lcu_width - x),
            height: height.min(self.lcu_height - y),
            delta_qp: quality.table_byte(),
        };
        trace!("添加 ROI: {:?}", node);

        match self.order {
            RoiOrder::Incoming => self.nodes.push(node),
            RoiOrder::Quality => {
                let pos = self
                    .nodes
                    .iter()
                    .position(|cur| !Self::should_insert_after(cur.delta_qp, node.delta_qp))
                    .unwrap_or(self.nodes.len());
                self.nodes.insert(pos, node);
            }
        }
        true
    }

    /// 质量序中新节点是否排在 `current` 之后
    ///
    /// 列表按 delta-QP 降序排列, 质量最高的节点最后绘制.
    fn should_insert_after(current: u8, new: u8) -> bool {
        if new & MASK_FORCE_INTRA != 0 {
            return true;
        }
        decode_delta_qp(current) > decode_delta_qp(new)
    }

    fn cell_index(&self, x: u32, y: u32, bytes_per_lcu: usize) -> usize {
        (y as usize * self.lcu_width as usize + x as usize) * bytes_per_lcu
    }

    /// 生成 QP 表
    ///
    /// `buf` 至少要容纳 `num_lcus * bytes_per_lcu` 字节, 每个 LCU 写入前 `qp_per_lcu` 字节.
    pub fn fill_buffer(&self, qp_per_lcu: usize, bytes_per_lcu: usize, buf: &mut [u8]) -> EncResult<()> {
        if qp_per_lcu == 0 || qp_per_lcu > bytes_per_lcu {
            return Err(EncError::InvalidArgument(format!(
                "每 LCU QP 数 {} 与字节数 {} 不匹配",
                qp_per_lcu, bytes_per_lcu
            )));
        }
        let needed = self.num_lcus() * bytes_per_lcu;
        if buf.len() < needed {
            return Err(EncError::CapacityOverflow(format!(
                "QP 表缓冲区 {} 字节, 需要 {} 字节",
                buf.len(),
                needed
            )));
        }

        let bkg = self.bkg_quality.table_byte();
        for lcu in buf[..needed].chunks_exact_mut(bytes_per_lcu) {
            lcu[..qp_per_lcu].fill(bkg);
        }

        for node in &self.nodes {
            self.draw_node(node, qp_per_lcu, bytes_per_lcu, buf);
        }
        Ok(())
    }

    fn draw_node(&self, node: &RoiNode, qp_per_lcu: usize, bytes_per_lcu: usize, buf: &mut [u8]) {
        for y in node.y..node.y + node.height {
            for x in node.x..node.x + node.width {
                let idx = self.cell_index(x, y, bytes_per_lcu);
                for cell in &mut buf[idx..idx + qp_per_lcu] {
                    set_lcu_quality(cell, node.delta_qp);
                }
            }
        }

        if node.delta_qp & MASK_FORCE != 0 {
            return;
        }
        let smooth = Smoother {
            mgr: self,
            qp_per_lcu,
            bytes_per_lcu,
            node_qp: node.delta_qp,
        };

        if node.y > 0 {
            let row2 = if node.y > 1 { node.y - 2 } else { node.y - 1 };
            smooth.horizontal(buf, node, node.y - 1, row2);
        }
        let below = node.y + node.height;
        if below < self.lcu_height {
            let row2 = if below + 2 < self.lcu_height { below + 1 } else { below };
            smooth.horizontal(buf, node, below, row2);
        }
        if node.x > 0 {
            let col2 = if node.x > 1 { node.x - 2 } else { node.x - 1 };
            smooth.vertical(buf, node, node.x - 1, col2);
        }
        let right = node.x + node.width;
        if right < self.lcu_width {
            let col2 = if right + 2 < self.lcu_width { right + 1 } else { right };
            smooth.vertical(buf, node, right, col2);
        }
    }
}

/// ROI 边界平滑
struct Smoother<'a> {
    mgr: &'a RoiManager,
    qp_per_lcu: usize,
    bytes_per_lcu: usize,
    node_qp: u8,
}

impl Smoother<'_> {
    /// 目标单元取 (参考单元, 节点) delta-QP 的均值, 保留目标原有的强制标志
    fn mean(&self, buf: &mut [u8], target: (u32, u32), source: (u32, u32)) {
        let t = self.mgr.cell_index(target.0, target.1, self.bytes_per_lcu);
        let s = self.mgr.cell_index(source.0, source.1, self.bytes_per_lcu);
        let mask = (buf[t] & MASK_FORCE) | (self.node_qp & MASK_FORCE);
        let sum = i32::from(decode_delta_qp(buf[s])) + i32::from(decode_delta_qp(self.node_qp));
        let qp = sum
            .div_euclid(2)
            .clamp(i32::from(self.mgr.min_qp), i32::from(self.mgr.max_qp));
        let value = (qp as u8 & MASK_QP) | mask;
        buf[t..t + self.qp_per_lcu].fill(value);
    }

    /// 节点上方或下方的一行, 含两个角
    fn horizontal(&self, buf: &mut [u8], node: &RoiNode, row1: u32, row2: u32) {
        let lcu_width = self.mgr.lcu_width;
        if node.x > 1 {
            self.mean(buf, (node.x - 1, row1), (node.x - 2, row2));
        } else if node.x > 0 {
            self.mean(buf, (node.x - 1, row1), (node.x - 1, row2));
        }

        for x in node.x..node.x + node.width {
            self.mean(buf, (x, row1), (x, row2));
        }

        let right = node.x + node.width;
        if right + 1 < lcu_width {
            self.mean(buf, (right, row1), (right + 1, row2));
        } else if right < lcu_width {
            self.mean(buf, (right, row1), (right, row2));
        }
    }

    /// 节点左侧或右侧的一列
    fn vertical(&self, buf: &mut [u8], node: &RoiNode, col1: u32, col2: u32) {
        for y in node.y..node.y + node.height {
            self.mean(buf, (col1, y), (col2, y));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 256x256 的 HEVC 图像, 8x8 个 LCU
    fn manager(order: RoiOrder) -> RoiManager {
        RoiManager::new(Codec::Hevc, Dimension::new(256, 256), 5, RoiQuality::MEDIUM, order)
    }

    fn qp_at(mgr: &RoiManager, buf: &[u8], x: u32, y: u32) -> i8 {
        decode_delta_qp(buf[(y * mgr.lcu_width() + x) as usize])
    }

    #[test]
    fn test_quality_encoding() {
        assert_eq!(RoiQuality::HIGH.table_byte(), 0x3B);
        assert_eq!(decode_delta_qp(RoiQuality::HIGH.table_byte()), -5);
        assert_eq!(RoiQuality::INTRA.table_byte(), MASK_FORCE_INTRA);
        assert_eq!(decode_delta_qp(0x20), -32);
        assert_eq!(RoiQuality::parse("LOW_QUALITY"), Some(RoiQuality::LOW));
        assert_eq!(RoiQuality::parse("-7"), Some(RoiQuality(-7)));
        assert_eq!(RoiQuality::parse("BEST"), None);
    }

    #[test]
    fn test_add_roi_converts_and_clips() {
        let mut mgr = manager(RoiOrder::Incoming);
        assert!(!mgr.add_roi(256, 0, 32, 32, RoiQuality::HIGH), "左上角在图像外");
        assert!(mgr.add_roi(200, 224, 100, 100, RoiQuality::HIGH));
        // x=6, y=7, 宽 4 高 4 被裁到网格边界
        assert_eq!(
            mgr.nodes[0],
            RoiNode {
                x: 6,
                y: 7,
                width: 2,
                height: 1,
                delta_qp: RoiQuality::HIGH.table_byte(),
            }
        );
    }

    #[test]
    fn test_incoming_order_later_wins() {
        let mut mgr = manager(RoiOrder::Incoming);
        mgr.add_roi(0, 0, 128, 128, RoiQuality::HIGH);
        mgr.add_roi(64, 64, 128, 128, RoiQuality::LOW);
        let mut buf = vec![0u8; mgr.num_lcus()];
        mgr.fill_buffer(1, 1, &mut buf).unwrap();

        assert_eq!(qp_at(&mgr, &buf, 0, 0), -5);
        assert_eq!(qp_at(&mgr, &buf, 2, 2), 5, "重叠区由后添加的 ROI 决定");
        assert_eq!(qp_at(&mgr, &buf, 7, 7), 0);
    }

    #[test]
    fn test_quality_order_better_wins() {
        for (first, second) in [
            (RoiQuality::HIGH, RoiQuality::LOW),
            (RoiQuality::LOW, RoiQuality::HIGH),
        ] {
            let mut mgr = manager(RoiOrder::Quality);
            mgr.add_roi(0, 0, 128, 128, first);
            mgr.add_roi(64, 64, 128, 128, second);
            let mut buf = vec![0u8; mgr.num_lcus()];
            mgr.fill_buffer(1, 1, &mut buf).unwrap();
            assert_eq!(qp_at(&mgr, &buf, 2, 2), -5, "重叠区由高质量 ROI 决定");
        }
    }

    #[test]
    fn test_quality_order_tie_keeps_first() {
        let mut mgr = manager(RoiOrder::Quality);
        mgr.add_roi(0, 0, 64, 64, RoiQuality(-3));
        mgr.add_roi(32, 0, 64, 64, RoiQuality(-3));
        // 先添加的节点排在后面绘制
        assert_eq!(mgr.nodes[1].x, 0);
        assert_eq!(mgr.nodes[0].x, 1);

        mgr.add_roi(0, 128, 32, 32, RoiQuality::INTRA);
        assert_eq!(mgr.nodes.last().map(|n| n.delta_qp), Some(MASK_FORCE_INTRA));
    }

    #[test]
    fn test_smoothing_mean_is_floored() {
        let mut mgr = RoiManager::new(Codec::Hevc, Dimension::new(256, 256), 5, RoiQuality(-32), RoiOrder::Incoming);
        mgr.add_roi(64, 64, 64, 64, RoiQuality(31));
        let mut buf = vec![0u8; mgr.num_lcus()];
        mgr.fill_buffer(1, 1, &mut buf).unwrap();

        assert_eq!(qp_at(&mgr, &buf, 2, 2), 31);
        assert_eq!(qp_at(&mgr, &buf, 2, 1), -1, "上方过渡带取均值");
        assert_eq!(qp_at(&mgr, &buf, 1, 2), -1, "左侧过渡带取均值");
        assert_eq!(qp_at(&mgr, &buf, 5, 5), -32);
    }

    #[test]
    fn test_smoothing_keeps_force_bits() {
        let mut mgr = manager(RoiOrder::Incoming);
        mgr.add_roi(0, 0, 32, 32, RoiQuality::INTRA);
        mgr.add_roi(32, 0, 32, 32, RoiQuality::HIGH);
        let mut buf = vec![0u8; mgr.num_lcus()];
        mgr.fill_buffer(1, 1, &mut buf).unwrap();

        // (0,0) 是强制帧内单元, 平滑后仍保留该标志
        assert_eq!(buf[0] & MASK_FORCE, MASK_FORCE_INTRA);
        assert_eq!(decode_delta_qp(buf[0]), -3);
    }

    #[test]
    fn test_multi_qp_per_lcu_layout() {
        let mut mgr = manager(RoiOrder::Incoming);
        mgr.add_roi(0, 0, 32, 32, RoiQuality::HIGH);
        let mut buf = vec![0xAAu8; mgr.num_lcus() * 4];
        mgr.fill_buffer(2, 4, &mut buf).unwrap();
        assert_eq!(&buf[..4], &[0x3B, 0x3B, 0xAA, 0xAA]);
        assert!(mgr.fill_buffer(2, 4, &mut buf[..8]).is_err());
    }
}
