//! QP 表生成.
//!
//! 每帧生成一张 QP 表, 交给 [`Encoder::process`](hwenc_codec::Encoder::process).
//! 表的来源可以是十六进制文件, ROI 描述文件, 或几种用于测试的合成图样.
//! 合成图样使用确定性的伪随机序列, 同样的参数总是得到同样的表.

use std::fs;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use hwenc_codec::Codec;
use hwenc_core::{Dimension, EncError};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::roi::{MASK_FORCE, MASK_FORCE_INTRA, MASK_FORCE_MV0, MASK_QP, RoiManager, RoiOrder, RoiQuality};
use crate::roi_file::load_roi_frame;

/// QP 表缓冲区大小的对齐 (字节)
pub const QP_TABLE_ALIGN: usize = 128;

/// QP 表生成错误
#[derive(Debug, Error)]
pub enum QpTableError {
    /// 找不到 QP 表或 ROI 文件
    #[error("找不到 QP 表文件: {}", .0.display())]
    FileNotFound(PathBuf),

    /// 文件内容错误 (数据不足, 非法十六进制, ROI 行格式错误)
    #[error("QP 表文件 {} 错误: {}", .0.display(), .1)]
    FileError(PathBuf, String),

    /// 目标缓冲区小于 QP 表大小
    #[error("QP 表缓冲区 {got} 字节, 需要 {needed} 字节")]
    BufferTooSmall { needed: usize, got: usize },
}

impl From<QpTableError> for EncError {
    fn from(e: QpTableError) -> Self {
        match e {
            QpTableError::FileNotFound(path) => EncError::FileNotFound(path.display().to_string()),
            QpTableError::FileError(..) => EncError::InvalidData(e.to_string()),
            QpTableError::BufferTooSmall { .. } => EncError::CapacityOverflow(e.to_string()),
        }
    }
}

/// QP 表生成方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QpMode {
    /// 不使用 QP 表
    #[default]
    Uniform,
    /// 从 `QP_<帧号>.hex` 加载
    Load,
    /// 从 ROI 描述文件生成
    Roi,
    /// 随机 QP
    Random,
    /// 逐 LCU 递增的 QP
    Ramp,
    /// 图像边缘两圈 LCU 提高 QP
    Border,
    /// 均匀 QP, 随机 20% 的 LCU 强制帧内
    RandomIOnly,
    /// 均匀 QP, 随机 30% 的 LCU 强制跳过
    RandomSkip,
    /// 所有 LCU 强制跳过
    FullSkip,
    /// 中心椭圆之外的 LCU 强制跳过
    BorderSkip,
}

impl FromStr for QpMode {
    type Err = String;

    /// 接受 snake_case 名称, 如 `random_skip`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "uniform" => Self::Uniform,
            "load" => Self::Load,
            "roi" => Self::Roi,
            "random" => Self::Random,
            "ramp" => Self::Ramp,
            "border" => Self::Border,
            "random_i_only" => Self::RandomIOnly,
            "random_skip" => Self::RandomSkip,
            "full_skip" => Self::FullSkip,
            "border_skip" => Self::BorderSkip,
            other => return Err(format!("未知的 QP 表模式 {:?}", other)),
        })
    }
}

impl QpMode {
    /// 合成标志之前使用的基础图样
    fn table_mode(self) -> Self {
        match self {
            Self::RandomIOnly | Self::RandomSkip | Self::FullSkip | Self::BorderSkip => Self::Uniform,
            other => other,
        }
    }
}

/// QP 表控制: 生成方式 + 相对/绝对 QP
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QpControl {
    pub mode: QpMode,
    /// 表中为相对 slice QP 的差值
    pub relative: bool,
}

impl QpControl {
    /// 是否需要向编码器提交 QP 表
    pub fn has_qp_table(&self) -> bool {
        self.mode != QpMode::Uniform
    }
}

/// QP 表在内存中的布局
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QpTableLayout {
    pub lcu_width: u32,
    pub lcu_height: u32,
    /// 每 LCU 的 QP 个数
    pub qp_per_lcu: usize,
    /// 每 LCU 占用的字节数
    pub bytes_per_lcu: usize,
}

impl QpTableLayout {
    pub fn new(pic_dim: Dimension, lcu_log2: u8) -> Self {
        let lcu_size = 1u32 << lcu_log2;
        Self {
            lcu_width: pic_dim.width.div_ceil(lcu_size),
            lcu_height: pic_dim.height.div_ceil(lcu_size),
            qp_per_lcu: 1,
            bytes_per_lcu: 1,
        }
    }

    pub fn num_lcus(&self) -> usize {
        self.lcu_width as usize * self.lcu_height as usize
    }

    /// 缓冲区大小, 按 128 字节向上对齐
    pub fn table_size(&self) -> usize {
        (self.num_lcus() * self.bytes_per_lcu).next_multiple_of(QP_TABLE_ALIGN)
    }

    fn lcus_mut<'a>(&self, buf: &'a mut [u8]) -> impl Iterator<Item = &'a mut [u8]> {
        let qp_per_lcu = self.qp_per_lcu;
        buf[..self.num_lcus() * self.bytes_per_lcu]
            .chunks_exact_mut(self.bytes_per_lcu)
            .map(move |lcu| &mut lcu[..qp_per_lcu])
    }
}

/// 每帧 QP 表的生成参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QpFrameParams {
    pub frame_id: u32,
    /// slice QP (初始 QP)
    pub slice_qp: i16,
    pub min_qp: i16,
    pub max_qp: i16,
}

/// 确定性的线性同余随机数
#[derive(Debug, Clone, Copy)]
struct Lcg(i32);

impl Lcg {
    /// 由表大小, slice QP 与调用计数派生种子
    fn seeded(num_lcus: usize, slice_qp: i32, counter: i32) -> Self {
        let seed = (num_lcus as i32)
            .wrapping_mul(slice_qp)
            .wrapping_sub(0x00EF_FACE_i32.wrapping_shl((slice_qp >> 1) as u32))
            .wrapping_add(counter);
        Self(seed)
    }

    /// [min, max] 内的整数
    fn next_in(&mut self, min: i32, max: i32) -> i32 {
        self.0 = 1_103_515_245u32.wrapping_mul(self.0 as u32).wrapping_add(12345) as i32;
        let range = (max - min).max(0) + 1;
        min + (self.0 % range).abs()
    }
}

/// 逐帧 QP 表生成器
#[derive(Debug)]
pub struct QpGenerator {
    control: QpControl,
    layout: QpTableLayout,
    tables_folder: PathBuf,
    roi_file: Option<PathBuf>,
    roi: RoiManager,
    ramp_qp: i32,
    random_count: i32,
    flag_count: i32,
}

impl QpGenerator {
    pub fn new(codec: Codec, pic_dim: Dimension, lcu_log2: u8, control: QpControl) -> Self {
        Self {
            control,
            layout: QpTableLayout::new(pic_dim, lcu_log2),
            tables_folder: PathBuf::from("."),
            roi_file: None,
            roi: RoiManager::new(codec, pic_dim, lcu_log2, RoiQuality::MEDIUM, RoiOrder::Quality),
            ramp_qp: 0,
            random_count: 0,
            flag_count: 0,
        }
    }

    /// QP 表文件所在目录, 默认为当前目录
    pub fn with_tables_folder(mut self, folder: impl Into<PathBuf>) -> Self {
        self.tables_folder = folder.into();
        self
    }

    /// ROI 描述文件
    pub fn with_roi_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.roi_file = Some(path.into());
        self
    }

    pub fn control(&self) -> QpControl {
        self.control
    }

    pub fn layout(&self) -> &QpTableLayout {
        &self.layout
    }

    pub fn roi_manager(&self) -> &RoiManager {
        &self.roi
    }

    pub fn roi_manager_mut(&mut self) -> &mut RoiManager {
        &mut self.roi
    }

    /// 生成一帧的 QP 表
    ///
    /// 返回 `Ok(false)` 表示该模式不需要 QP 表 (均匀 QP).
    pub fn generate(&mut self, params: &QpFrameParams, buf: &mut [u8]) -> Result<bool, QpTableError> {
        let size = self.layout.table_size();
        if buf.len() < size {
            return Err(QpTableError::BufferTooSmall {
                needed: size,
                got: buf.len(),
            });
        }
        buf[..size].fill(0);

        if self.control.mode == QpMode::Roi {
            self.generate_roi(params.frame_id, buf)?;
            return Ok(true);
        }

        let mode = self.control.mode;
        let relative = self.control.relative;
        let slice_qp = i32::from(params.slice_qp);
        let (mut min_qp, mut max_qp) = (i32::from(params.min_qp), i32::from(params.max_qp));
        if relative {
            if mode == QpMode::Random {
                (min_qp, max_qp) = (-32, 31);
            } else {
                min_qp = if slice_qp - 32 < min_qp { min_qp - slice_qp } else { -32 };
                max_qp = if slice_qp + 31 > max_qp { max_qp - slice_qp } else { 31 };
            }
        }
        // 各类型上下界取交集后可能交叉
        max_qp = max_qp.max(min_qp);

        let mut used = match mode.table_mode() {
            QpMode::Ramp => {
                self.ramp(buf, min_qp, max_qp);
                true
            }
            QpMode::Random => {
                self.random(buf, slice_qp, min_qp, max_qp);
                true
            }
            QpMode::Border => {
                self.border(buf, if relative { 0 } else { slice_qp }, max_qp);
                true
            }
            QpMode::Load => {
                self.load(params.frame_id, buf)?;
                true
            }
            _ => false,
        };

        if mode != QpMode::Uniform && mode.table_mode() == QpMode::Uniform && !relative {
            for lcu in self.layout.lcus_mut(buf) {
                lcu.fill(slice_qp as u8);
            }
        }

        match mode {
            QpMode::RandomIOnly => {
                self.random_flags(buf, slice_qp, 20, MASK_FORCE_INTRA);
                used = true;
            }
            QpMode::RandomSkip => {
                self.random_flags(buf, slice_qp, 30, MASK_FORCE_MV0);
                used = true;
            }
            QpMode::FullSkip => {
                for lcu in self.layout.lcus_mut(buf) {
                    for qp in lcu {
                        *qp = (*qp & !MASK_FORCE) | MASK_FORCE_MV0;
                    }
                }
                used = true;
            }
            QpMode::BorderSkip => {
                self.border_skip(buf);
                used = true;
            }
            _ => {}
        }
        debug!("第 {} 帧 QP 表 ({:?}) 已生成", params.frame_id, mode);
        Ok(used)
    }

    fn generate_roi(&mut self, frame_id: u32, buf: &mut [u8]) -> Result<(), QpTableError> {
        let Some(path) = self.roi_file.clone() else {
            return Err(QpTableError::FileNotFound(PathBuf::from("ROI")));
        };
        load_roi_frame(&path, frame_id, &mut self.roi)?;
        self.roi
            .fill_buffer(self.layout.qp_per_lcu, self.layout.bytes_per_lcu, buf)
            .map_err(|e| QpTableError::FileError(path, e.to_string()))
    }

    /// 每个 LCU 的 QP 比前一个大 1, 超过上限后回到下限, 跨帧延续
    fn ramp(&mut self, buf: &mut [u8], min_qp: i32, max_qp: i32) {
        self.ramp_qp = self.ramp_qp.max(min_qp);
        for lcu in self.layout.lcus_mut(buf) {
            lcu.fill(self.ramp_qp as u8 & MASK_QP);
            self.ramp_qp += 1;
            if self.ramp_qp > max_qp {
                self.ramp_qp = min_qp;
            }
        }
    }

    fn random(&mut self, buf: &mut [u8], slice_qp: i32, min_qp: i32, max_qp: i32) {
        let mut rng = Lcg::seeded(self.layout.num_lcus(), slice_qp, self.random_count);
        self.random_count += 1;
        for lcu in self.layout.lcus_mut(buf) {
            for qp in lcu {
                *qp = rng.next_in(min_qp, max_qp) as u8 & MASK_QP;
            }
        }
    }

    fn border(&self, buf: &mut [u8], qp0: i32, max_qp: i32) {
        let qp1 = (qp0 + 1).min(max_qp) as u8;
        let qp2 = (qp0 + 2).min(max_qp) as u8;
        let (w, h) = (self.layout.lcu_width as i64, self.layout.lcu_height as i64);
        for (i, lcu) in self.layout.lcus_mut(buf).enumerate() {
            let (x, y) = (i as i64 % w, i as i64 / w);
            let value = if x == 0 || y == 0 || x == w - 1 || y >= h - 1 {
                qp2
            } else if x == 1 || y == 1 || x == w - 2 || y == h - 2 {
                qp1
            } else {
                qp0 as u8
            };
            lcu.fill(value);
        }
    }

    fn border_skip(&self, buf: &mut [u8]) {
        let (w, h) = (self.layout.lcu_width as i64, self.layout.lcu_height as i64);
        let rx = (w * 2 / 6).pow(2).max(1);
        let ry = (h * 2 / 6).pow(2).max(1);
        for (i, lcu) in self.layout.lcus_mut(buf).enumerate() {
            let x = i as i64 % w - (w >> 1);
            let y = i as i64 / w - (h >> 1);
            if 100 * x * x / rx + 100 * y * y / ry > 100 {
                lcu[0] = (lcu[0] & !MASK_FORCE) | MASK_FORCE_MV0;
            }
            let first = lcu[0];
            lcu.fill(first);
        }
    }

    /// 随机给 `percent`% 左右的 LCU 加上强制标志
    fn random_flags(&mut self, buf: &mut [u8], slice_qp: i32, percent: i32, flag: u8) {
        let mut rng = Lcg::seeded(self.layout.num_lcus(), slice_qp % 52, self.flag_count);
        self.flag_count += 1;
        for lcu in self.layout.lcus_mut(buf) {
            let first_force = lcu[0] & MASK_FORCE;
            if first_force != 0 {
                continue;
            }
            for qp in lcu.iter_mut() {
                if *qp & MASK_FORCE != first_force {
                    *qp &= !MASK_FORCE;
                }
                if rng.next_in(0, 99) <= percent {
                    *qp |= flag;
                }
            }
        }
    }

    /// 找到本帧的 QP 表文件: `QP_<帧号>.hex`, 其次 `QPs.hex`
    fn find_table_file(&self, frame_id: u32) -> Result<PathBuf, QpTableError> {
        let per_frame = self.tables_folder.join(format!("QP_{}.hex", frame_id));
        if per_frame.is_file() {
            return Ok(per_frame);
        }
        let legacy = self.tables_folder.join("QPs.hex");
        if legacy.is_file() {
            return Ok(legacy);
        }
        Err(QpTableError::FileNotFound(per_frame))
    }

    fn load(&self, frame_id: u32, buf: &mut [u8]) -> Result<(), QpTableError> {
        let path = self.find_table_file(frame_id)?;
        let file = fs::File::open(&path).map_err(|e| io_error(&path, e))?;
        let mut lines = BufReader::new(file).lines();
        for (i, lcu) in self.layout.lcus_mut(buf).enumerate() {
            let line = match lines.next() {
                Some(line) => line.map_err(|e| io_error(&path, e))?,
                None => {
                    return Err(QpTableError::FileError(
                        path.clone(),
                        format!("数据不足, 只读到 {} 个 LCU", i),
                    ));
                }
            };
            let value = parse_hex_byte(&line)
                .ok_or_else(|| QpTableError::FileError(path.clone(), format!("第 {} 行不是十六进制 QP: {:?}", i + 1, line)))?;
            lcu.fill(value);
        }
        Ok(())
    }
}

fn io_error(path: &Path, e: io::Error) -> QpTableError {
    warn!("读取 {} 失败: {}", path.display(), e);
    QpTableError::FileError(path.to_path_buf(), e.to_string())
}

/// 解析行首的两位十六进制数
fn parse_hex_byte(line: &str) -> Option<u8> {
    let digits = line.trim_start().get(..2)?;
    u8::from_str_radix(digits, 16).ok()
}
