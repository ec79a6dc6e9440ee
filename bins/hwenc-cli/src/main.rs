//! hwenc-cli - 硬件编码器命令行驱动
//!
//! 加载通道配置, 在软件回环调度器上逐帧编码合成源帧, 按命令文件动态修改参数,
//! 并把完成的码流按分段顺序写成 Annex-B 文件.

mod command_manager;
mod commands_sender;
mod logging;
mod pipeline;
mod sink;

use std::fs;
use std::path::{Path, PathBuf};
use std::process;

use anyhow::{Context, Result, bail};
use clap::Parser;
use hwenc_codec::{EncSettings, HdrSeis};
use hwenc_core::Dimension;
use hwenc_qp::QpMode;
use log::{error, info};

use pipeline::JobConfig;

#[derive(Parser, Debug)]
#[command(name = "hwenc-cli", version, about = "HEVC/AVC 硬件编码器命令行驱动")]
struct Cli {
    /// 通道配置文件 (JSON, 未给出的字段取默认值)
    #[arg(short, long)]
    cfg: Option<PathBuf>,

    /// 编码帧数
    #[arg(short = 'n', long = "input-frames", default_value_t = 30)]
    input_frames: u32,

    /// 覆盖配置中的编码宽度
    #[arg(long)]
    width: Option<u32>,

    /// 覆盖配置中的编码高度
    #[arg(long)]
    height: Option<u32>,

    /// 动态命令文件
    #[arg(long = "cmd-file")]
    cmd_file: Option<PathBuf>,

    /// 命令预读帧数
    #[arg(long, default_value_t = 1)]
    lookahead: usize,

    /// QP 表模式 (uniform, load, roi, random, ramp, border, random_i_only, random_skip, full_skip, border_skip)
    #[arg(long = "qp-mode", default_value = "uniform")]
    qp_mode: QpMode,

    /// QP 表文件目录 (load 模式)
    #[arg(long = "qp-folder", default_value = ".")]
    qp_folder: PathBuf,

    /// ROI 描述文件 (roi 模式)
    #[arg(long = "roi-file")]
    roi_file: Option<PathBuf>,

    /// 动态输入分辨率 (如 "1280x720"), 可重复, 命令 `Input=<n>` 选择第 n 个
    #[arg(long = "dyn-input")]
    dyn_input: Vec<String>,

    /// HDR SEI 列表 (JSON 数组), 命令 `HDRIndex=<n>` 选择第 n 组
    #[arg(long = "hdr-file")]
    hdr_file: Option<PathBuf>,

    /// 码流缓冲区个数
    #[arg(long = "stream-buffers", default_value_t = 4)]
    stream_buffers: usize,

    /// 调度器在独立线程上编码
    #[arg(long)]
    threaded: bool,

    /// 输出码流文件
    #[arg(short, long)]
    output: PathBuf,

    /// 日志级别 (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// 解析 "宽x高"
fn parse_size(s: &str) -> Result<Dimension> {
    let (w, h) = s
        .split_once(['x', 'X'])
        .with_context(|| format!("分辨率 {:?} 应为 宽x高", s))?;
    let dim = Dimension::new(
        w.trim().parse().with_context(|| format!("无效宽度 {:?}", w))?,
        h.trim().parse().with_context(|| format!("无效高度 {:?}", h))?,
    );
    if dim.width == 0 || dim.height == 0 {
        bail!("分辨率 {} 不能为 0", dim);
    }
    Ok(dim)
}

fn load_settings(path: Option<&Path>) -> Result<EncSettings> {
    let Some(path) = path else {
        return Ok(EncSettings::default());
    };
    let text = fs::read_to_string(path).with_context(|| format!("读取配置文件 {} 失败", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("配置文件 {} 格式错误", path.display()))
}

fn load_hdr_seis(path: Option<&Path>) -> Result<Vec<HdrSeis>> {
    let Some(path) = path else {
        return Ok(Vec::new());
    };
    let text = fs::read_to_string(path).with_context(|| format!("读取 HDR 文件 {} 失败", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("HDR 文件 {} 格式错误", path.display()))
}

fn build_job(cli: &Cli) -> Result<JobConfig> {
    let mut settings = load_settings(cli.cfg.as_deref())?;
    if let Some(width) = cli.width {
        settings.width = width;
    }
    if let Some(height) = cli.height {
        settings.height = height;
    }

    let dyn_inputs = cli
        .dyn_input
        .iter()
        .map(|s| parse_size(s))
        .collect::<Result<Vec<_>>>()?;
    // 动态分辨率不能超过通道最大尺寸
    for dim in &dyn_inputs {
        settings.max_width = settings.max_width.max(dim.width);
        settings.max_height = settings.max_height.max(dim.height);
    }

    let mut job = JobConfig::new(settings, cli.input_frames, cli.output.clone());
    job.cmd_file = cli.cmd_file.clone();
    job.lookahead = cli.lookahead;
    job.qp_mode = cli.qp_mode;
    job.qp_folder = cli.qp_folder.clone();
    job.roi_file = cli.roi_file.clone();
    job.dyn_inputs = dyn_inputs;
    job.hdr_seis = load_hdr_seis(cli.hdr_file.as_deref())?;
    job.num_stream_buffers = cli.stream_buffers;
    job.threaded = cli.threaded;
    Ok(job)
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = logging::init("hwenc-cli", cli.verbose) {
        eprintln!("错误: {e:#}");
        process::exit(1);
    }

    let result = build_job(&cli).and_then(|job| {
        info!(
            "编码 {} 帧 {}x{} {:?} -> {}",
            job.num_frames,
            job.settings.width,
            job.settings.height,
            job.settings.profile,
            job.output.display()
        );
        pipeline::run(&job)
    });
    if let Err(e) = result {
        error!("{e:#}");
        process::exit(1);
    }
}
