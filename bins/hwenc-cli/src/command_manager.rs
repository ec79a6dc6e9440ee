//! 命令文件调度.
//!
//! 命令文件每行形如 `<帧号>: 命令[, 命令=值...]`, 例如:
//!
//! ```text
//! 0: KF
//! 30: BR=2000, Fps=59.94
//! 30: QPBounds=[10;40], CostMode=(true)
//! 60: SC
//! ```
//!
//! 帧号相同的连续行合并为一个条目. 条目缓存在长度不超过 `lookahead` 的队列中,
//! 每编码一帧调用一次 [`CommandManager::process`]: 队尾的场景切换提前
//! `lookahead` 帧通知, 队首到期的条目逐项应用, 过期条目随后丢弃.

use std::collections::VecDeque;
use std::io::{BufRead, Lines};

use hwenc_codec::SliceType;
use hwenc_core::{EncError, EncResult};
use log::{debug, trace};

use crate::commands_sender::CommandsSender;

const SEPARATORS: &[char] = &[':', ',', '=', ' ', '\t', '\r'];

/// 一帧的全部待应用命令
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameCommand {
    pub frame: u32,
    pub scene_change: bool,
    pub is_long_term: bool,
    pub use_long_term: bool,
    pub key_frame: bool,
    pub recovery_point: bool,
    pub gop_length: Option<u32>,
    pub num_b: Option<u32>,
    pub freq_idr: Option<u32>,
    /// (帧率, 时钟比)
    pub frame_rate: Option<(u16, u16)>,
    pub bit_rate: Option<u32>,
    /// (目标码率, 最大码率)
    pub max_bit_rate: Option<(u32, u32)>,
    pub qp_bounds: Option<(i16, i16)>,
    /// 按 (I, P, B) 排列
    pub qp_bounds_per_type: [Option<(i16, i16)>; 3],
    pub ip_delta: Option<i16>,
    pub pb_delta: Option<i16>,
    pub qp: Option<i16>,
    pub qp_offset: Option<i16>,
    pub input: Option<usize>,
    pub lf_beta_offset: Option<i8>,
    pub lf_tc_offset: Option<i8>,
    pub cost_mode: Option<bool>,
    pub max_picture_size: Option<u32>,
    /// 按 (I, P, B) 排列
    pub max_picture_size_per_type: [Option<u32>; 3],
    pub chroma_offsets: Option<(i8, i8)>,
    pub auto_qp: Option<bool>,
    pub hdr_index: Option<usize>,
}

/// 由浮点帧率得到 (帧率, 时钟比)
///
/// 帧率先取整到千分位. 有小数部分时帧率向上取整, 时钟比为
/// `1000 + (1000 - 千分位) / 帧率`, 59.94 得到 (60, 1001), 25 得到 (25, 1000).
/// 超出 [`MIN_FPS`]..=[`MAX_FPS`] 的取值先被截断.
pub fn frame_rate_to_ratio(fps: f64) -> (u16, u16) {
    let milli = (fps.clamp(MIN_FPS, MAX_FPS) * 1000.0).round() as u32;
    let mut frame_rate = milli / 1000;
    let frac = milli % 1000;
    let mut clk_ratio = 1000;
    if frac != 0 {
        frame_rate += 1;
        clk_ratio += (1000 - frac) / frame_rate;
    }
    (frame_rate.min(u32::from(u16::MAX)) as u16, clk_ratio as u16)
}

pub const MIN_FPS: f64 = 1.0;
/// 向上取整后仍在 u16 之内
pub const MAX_FPS: f64 = (u16::MAX - 1) as f64;

/// 一行中的 `名称[=值]` 序列
struct Tokenizer<'a> {
    line: &'a str,
    pos: usize,
}

impl<'a> Tokenizer<'a> {
    fn new(line: &'a str) -> Self {
        Self { line, pos: 0 }
    }

    fn skip(&mut self, pred: impl Fn(char) -> bool) {
        let rest = &self.line[self.pos..];
        self.pos += rest.find(|c: char| !pred(c)).unwrap_or(rest.len());
    }

    /// 取下一个非分隔符片段; 以 `[` 或 `(` 开头时一直取到配对的右括号
    fn word(&mut self) -> Option<&'a str> {
        self.skip(|c| SEPARATORS.contains(&c));
        let rest = &self.line[self.pos..];
        if rest.is_empty() {
            return None;
        }
        let close = match rest.as_bytes()[0] {
            b'[' => Some(']'),
            b'(' => Some(')'),
            _ => None,
        };
        let len = match close.and_then(|c| rest.find(c)) {
            Some(end) => end + 1,
            None => rest.find(SEPARATORS).unwrap_or(rest.len()),
        };
        self.pos += len;
        Some(&rest[..len])
    }

    /// 下一个命令及其值 (名称后紧跟 `=` 时)
    fn next_command(&mut self) -> Option<(&'a str, Option<&'a str>)> {
        let name = self.word()?;
        self.skip(|c| c == ' ' || c == '\t');
        let value = if self.line[self.pos..].starts_with('=') {
            self.pos += 1;
            self.word()
        } else {
            None
        };
        Some((name, value))
    }
}

/// 解析单条命令时的上下文, 用于生成带行内容的错误
struct LineContext<'a> {
    line: &'a str,
    line_no: usize,
}

impl LineContext<'_> {
    fn error(&self, reason: impl std::fmt::Display) -> EncError {
        EncError::InvalidData(format!("命令文件第 {} 行 {:?}: {}", self.line_no, self.line, reason))
    }

    fn value<'v>(&self, name: &str, value: Option<&'v str>) -> EncResult<&'v str> {
        value.ok_or_else(|| self.error(format!("{} 缺少取值", name)))
    }

    fn number(&self, name: &str, value: Option<&str>) -> EncResult<f64> {
        let value = self.value(name, value)?;
        value
            .trim()
            .parse::<f64>()
            .map_err(|_| self.error(format!("{} 的取值 {:?} 不是数字", name, value)))
    }

    fn int<T: TryFrom<i64>>(&self, name: &str, value: Option<&str>) -> EncResult<T> {
        let v = self.number(name, value)? as i64;
        T::try_from(v).map_err(|_| self.error(format!("{} 的取值 {} 超出范围", name, v)))
    }

    /// `[a;b]` 或 `(a;b)` 形式的二元组
    fn pair<T: TryFrom<i64>>(&self, name: &str, value: Option<&str>) -> EncResult<(T, T)> {
        let value = self.value(name, value)?;
        let inner = value
            .strip_prefix(['[', '('])
            .and_then(|v| v.strip_suffix([']', ')']))
            .ok_or_else(|| self.error(format!("{} 的区间 {:?} 缺少括号", name, value)))?;
        let (a, b) = inner
            .split_once(';')
            .ok_or_else(|| self.error(format!("{} 的区间 {:?} 缺少 ';'", name, value)))?;
        Ok((self.int(name, Some(a))?, self.int(name, Some(b))?))
    }

    /// `(true)` 列表取首元素, 也接受不带括号的 `true`
    fn flag(&self, name: &str, value: Option<&str>) -> EncResult<bool> {
        let value = self.value(name, value)?;
        let inner = value.trim_start_matches('(').trim_end_matches(')');
        let front = inner.split(';').next().unwrap_or_default().trim();
        Ok(front == "true")
    }
}

fn per_type_index(suffix: &str) -> Option<usize> {
    let slice_type = match suffix {
        "I" => SliceType::I,
        "P" => SliceType::P,
        "B" => SliceType::B,
        _ => return None,
    };
    Some(slice_type.rc_index())
}

const SLICE_TYPES: [SliceType; 3] = [SliceType::I, SliceType::P, SliceType::B];

impl FrameCommand {
    fn apply_token(&mut self, ctx: &LineContext<'_>, name: &str, value: Option<&str>) -> EncResult<()> {
        match name {
            "SC" => self.scene_change = true,
            "LT" => self.is_long_term = true,
            "UseLT" => self.use_long_term = true,
            "KF" => self.key_frame = true,
            "RP" => self.recovery_point = true,
            "GopLen" => self.gop_length = Some(ctx.int(name, value)?),
            "NumB" => self.num_b = Some(ctx.int(name, value)?),
            "FreqIDR" => self.freq_idr = Some(ctx.int(name, value)?),
            "Fps" => {
                let fps = ctx.number(name, value)?;
                if !(MIN_FPS..=MAX_FPS).contains(&fps) {
                    return Err(ctx.error(format!("帧率 {} 超出范围 [{}, {}]", fps, MIN_FPS, MAX_FPS)));
                }
                self.frame_rate = Some(frame_rate_to_ratio(fps));
            }
            "BR" => {
                let kbps: u32 = ctx.int(name, value)?;
                if kbps == 0 {
                    return Err(ctx.error("码率不能为 0"));
                }
                self.bit_rate = Some(kbps.saturating_mul(1000));
            }
            "BR.MaxBR" => {
                let (target, max): (u32, u32) = ctx.pair(name, value)?;
                if target == 0 || max == 0 {
                    return Err(ctx.error("目标码率与最大码率不能为 0"));
                }
                self.max_bit_rate = Some((target.saturating_mul(1000), max.saturating_mul(1000)));
            }
            "QP" => self.qp = Some(ctx.int(name, value)?),
            "QPOffset" => self.qp_offset = Some(ctx.int(name, value)?),
            "QPBounds" => self.qp_bounds = Some(ctx.pair(name, value)?),
            "IPDelta" => self.ip_delta = Some(ctx.int(name, value)?),
            "PBDelta" => self.pb_delta = Some(ctx.int(name, value)?),
            "Input" => self.input = Some(ctx.int(name, value)?),
            "LF.BetaOffset" => self.lf_beta_offset = Some(ctx.int(name, value)?),
            "LF.TcOffset" => self.lf_tc_offset = Some(ctx.int(name, value)?),
            "CostMode" => self.cost_mode = Some(ctx.flag(name, value)?),
            "MaxPictureSize" => {
                let kbits: u32 = ctx.int(name, value)?;
                self.max_picture_size = Some(kbits.saturating_mul(1000));
            }
            "QPChromaOffsets" => self.chroma_offsets = Some(ctx.pair(name, value)?),
            "AutoQP" => self.auto_qp = Some(ctx.flag(name, value)?),
            "HDRIndex" => self.hdr_index = Some(ctx.int(name, value)?),
            _ => {
                if let Some(idx) = name.strip_prefix("QPBounds.").and_then(per_type_index) {
                    self.qp_bounds_per_type[idx] = Some(ctx.pair(name, value)?);
                } else if let Some(idx) = name.strip_prefix("MaxPictureSize.").and_then(per_type_index) {
                    let kbits: u32 = ctx.int(name, value)?;
                    self.max_picture_size_per_type[idx] = Some(kbits.saturating_mul(1000));
                } else {
                    return Err(ctx.error(format!("未知命令 {:?}", name)));
                }
            }
        }
        Ok(())
    }
}

/// 解析一行, 返回帧号与命令序列
fn parse_line<'a>(ctx: &LineContext<'a>) -> EncResult<(u32, Tokenizer<'a>)> {
    let mut tok = Tokenizer::new(ctx.line);
    let frame = tok.word().unwrap_or_default();
    let frame = frame
        .parse::<u32>()
        .map_err(|_| ctx.error(format!("帧号 {:?} 无效", frame)))?;
    Ok((frame, tok))
}

/// 命令文件调度器
pub struct CommandManager<R: BufRead> {
    lines: Lines<R>,
    line_no: usize,
    /// 已读出但属于下一个条目的行
    buffered: Option<(usize, String)>,
    lookahead: usize,
    freq_lt: u32,
    has_lt: bool,
    queue: VecDeque<FrameCommand>,
}

impl<R: BufRead> CommandManager<R> {
    /// 创建调度器并预读第 0 帧起的命令
    pub fn new(reader: R, lookahead: usize, freq_lt: u32) -> EncResult<Self> {
        let mut mngr = Self {
            lines: reader.lines(),
            line_no: 0,
            buffered: None,
            lookahead: lookahead.max(1),
            freq_lt,
            has_lt: false,
            queue: VecDeque::new(),
        };
        mngr.refill(0)?;
        Ok(mngr)
    }

    /// 队列中的条目
    pub fn pending(&self) -> impl Iterator<Item = &FrameCommand> {
        self.queue.iter()
    }

    fn next_line(&mut self) -> EncResult<Option<(usize, String)>> {
        if let Some(buffered) = self.buffered.take() {
            return Ok(Some(buffered));
        }
        match self.lines.next() {
            Some(line) => {
                self.line_no += 1;
                Ok(Some((self.line_no, line?)))
            }
            None => Ok(None),
        }
    }

    /// 读出下一个条目, 合并帧号相同的连续行
    fn read_command(&mut self) -> EncResult<Option<FrameCommand>> {
        let mut cmd: Option<FrameCommand> = None;
        while let Some((line_no, line)) = self.next_line()? {
            let text = line.trim();
            if text.is_empty() || text.starts_with('#') {
                continue;
            }
            let ctx = LineContext { line: text, line_no };
            let (frame, mut tok) = parse_line(&ctx)?;
            if cmd.as_ref().is_some_and(|c| c.frame != frame) {
                self.buffered = Some((line_no, line));
                break;
            }
            let entry = cmd.get_or_insert_with(|| FrameCommand {
                frame,
                ..Default::default()
            });
            while let Some((name, value)) = tok.next_command() {
                entry.apply_token(&ctx, name, value)?;
            }
        }
        if let Some(c) = &cmd {
            trace!("读入第 {} 帧的命令", c.frame);
        }
        Ok(cmd)
    }

    /// 丢弃早于 `cur` 的条目, 再读到队列满或覆盖 `cur + lookahead`
    fn refill(&mut self, cur: u32) -> EncResult<()> {
        while self.queue.front().is_some_and(|c| c.frame < cur) {
            if let Some(stale) = self.queue.pop_front() {
                debug!("丢弃第 {} 帧的过期命令", stale.frame);
            }
        }
        let horizon = cur.saturating_add(self.lookahead as u32);
        while self.queue.len() < self.lookahead && self.queue.back().is_none_or(|c| c.frame < horizon) {
            match self.read_command()? {
                Some(cmd) => self.queue.push_back(cmd),
                None => break,
            }
        }
        Ok(())
    }

    /// 第 `frame` 帧提交前调用
    pub fn process(&mut self, sender: &mut dyn CommandsSender, frame: u32) -> EncResult<()> {
        let lookahead = self.lookahead as u32;
        let mut refill = false;

        if let Some(back) = self.queue.back() {
            if frame.saturating_add(lookahead) == back.frame {
                refill = true;
                if back.scene_change {
                    debug!("第 {} 帧预告场景切换", back.frame);
                    sender.notify_scene_change(lookahead);
                }
            }
        }

        if let Some(cmd) = self.queue.front().filter(|c| c.frame == frame) {
            refill = true;
            if cmd.use_long_term && (self.freq_lt != 0 || self.has_lt) {
                sender.notify_use_long_term();
            }
            if cmd.is_long_term {
                sender.notify_is_long_term();
                self.has_lt = true;
            }
            apply(cmd, sender);
        }

        if refill {
            self.refill(frame.saturating_add(1))?;
        }
        Ok(())
    }
}

/// 按固定顺序应用长期参考以外的命令
fn apply(cmd: &FrameCommand, sender: &mut dyn CommandsSender) {
    if cmd.key_frame {
        sender.restart_gop();
    }
    if cmd.recovery_point {
        sender.restart_gop_recovery_point();
    }
    if let Some(length) = cmd.gop_length {
        sender.set_gop_length(length);
    }
    if let Some(num_b) = cmd.num_b {
        sender.set_num_b(num_b);
    }
    if let Some(freq) = cmd.freq_idr {
        sender.set_freq_idr(freq);
    }
    if let Some((frame_rate, clk_ratio)) = cmd.frame_rate {
        sender.set_frame_rate(frame_rate, clk_ratio);
    }
    if let Some(bit_rate) = cmd.bit_rate {
        sender.set_bit_rate(bit_rate);
    }
    if let Some((target, max)) = cmd.max_bit_rate {
        sender.set_max_bit_rate(target, max);
    }
    if let Some((min, max)) = cmd.qp_bounds {
        sender.set_qp_bounds(min, max);
    }
    for slice_type in SLICE_TYPES {
        if let Some((min, max)) = cmd.qp_bounds_per_type[slice_type.rc_index()] {
            sender.set_qp_bounds_per_frame_type(slice_type, min, max);
        }
    }
    if let Some(delta) = cmd.ip_delta {
        sender.set_qp_ip_delta(delta);
    }
    if let Some(delta) = cmd.pb_delta {
        sender.set_qp_pb_delta(delta);
    }
    if let Some(qp) = cmd.qp {
        sender.set_qp(qp);
    }
    if let Some(offset) = cmd.qp_offset {
        sender.set_qp_offset(offset);
    }
    if let Some(index) = cmd.input {
        sender.set_dynamic_input(index);
    }
    if let Some(offset) = cmd.lf_beta_offset {
        sender.set_lf_beta_offset(offset);
    }
    if let Some(offset) = cmd.lf_tc_offset {
        sender.set_lf_tc_offset(offset);
    }
    if let Some(cost_mode) = cmd.cost_mode {
        sender.set_cost_mode(cost_mode);
    }
    if let Some(size) = cmd.max_picture_size {
        sender.set_max_picture_size(size);
    }
    for slice_type in SLICE_TYPES {
        if let Some(size) = cmd.max_picture_size_per_type[slice_type.rc_index()] {
            sender.set_max_picture_size_per_frame_type(slice_type, size);
        }
    }
    if let Some((cb, cr)) = cmd.chroma_offsets {
        sender.set_qp_chroma_offsets(cb, cr);
    }
    if let Some(auto_qp) = cmd.auto_qp {
        sender.set_auto_qp(auto_qp);
    }
    if let Some(index) = cmd.hdr_index {
        sender.set_hdr_index(index);
    }
}
