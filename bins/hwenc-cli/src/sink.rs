//! 码流输出.
//!
//! 按分段表的顺序把码流缓冲区中的各段写成连续的 Annex-B 数据.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use hwenc_codec::{PictureMeta, SectionFlags, SliceType, StreamMetaData};
use hwenc_core::Buffer;

/// 一个码流缓冲区的写出结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamReport {
    pub bytes: usize,
    pub sections: usize,
    /// 以 END_FRAME 结束的帧数
    pub end_frames: usize,
    /// 所有分段标志的并集
    pub flags: SectionFlags,
    pub slice_type: Option<SliceType>,
    pub skipped: bool,
}

/// Annex-B 码流写出端
pub struct BitstreamSink<W: Write> {
    writer: W,
    total_bytes: u64,
    frames: u64,
}

impl BitstreamSink<BufWriter<File>> {
    pub fn create(path: &Path) -> io::Result<Self> {
        Ok(Self::new(BufWriter::new(File::create(path)?)))
    }
}

impl<W: Write> BitstreamSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            total_bytes: 0,
            frames: 0,
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// 已写出的完整帧数
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// 写出一个已编码的码流缓冲区; 没有分段元数据时写出空报告
    pub fn write_stream(&mut self, stream: &Buffer) -> io::Result<StreamReport> {
        let mut report = StreamReport::default();
        let collected = {
            let data = stream.lock_data();
            stream.with_meta::<StreamMetaData, _>(|meta| {
                report.sections = meta.num_sections();
                report.end_frames = meta.end_frame_count();
                report.flags = meta
                    .sections()
                    .iter()
                    .fold(SectionFlags::empty(), |acc, s| acc | s.flags);
                meta.collect(&data)
            })
        };
        if let Some(pic) = stream.with_meta::<PictureMeta, _>(|m| *m) {
            report.slice_type = Some(pic.slice_type);
            report.skipped = pic.skipped;
        }

        let Some(bytes) = collected else {
            return Ok(report);
        };
        self.writer.write_all(&bytes)?;
        report.bytes = bytes.len();
        self.total_bytes += bytes.len() as u64;
        self.frames += report.end_frames as u64;
        Ok(report)
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

/// 分段标志的简写, 用于逐帧日志
pub fn flags_summary(flags: SectionFlags) -> String {
    const NAMES: [(SectionFlags, &str); 6] = [
        (SectionFlags::CONFIG, "CFG"),
        (SectionFlags::SEI_PREFIX, "SEI"),
        (SectionFlags::SYNC, "SYNC"),
        (SectionFlags::FILLER, "FILL"),
        (SectionFlags::APP_FILLER, "APPFILL"),
        (SectionFlags::END_FRAME, "END"),
    ];
    let names: Vec<&str> = NAMES
        .iter()
        .filter(|(flag, _)| flags.contains(*flag))
        .map(|(_, name)| *name)
        .collect();
    if names.is_empty() { "-".into() } else { names.join("|") }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writes_sections_in_order() {
        let stream = Buffer::from_vec((0u8..32).collect(), "stream");
        let mut meta = StreamMetaData::new(4);
        meta.add_section(20, 4, SectionFlags::CONFIG).unwrap();
        meta.add_section(0, 3, SectionFlags::END_FRAME).unwrap();
        stream.add_meta(meta);

        let mut out = Vec::new();
        let mut sink = BitstreamSink::new(&mut out);
        let report = sink.write_stream(&stream).unwrap();
        assert_eq!(report.bytes, 7);
        assert_eq!(report.sections, 2);
        assert_eq!(report.end_frames, 1);
        assert_eq!(report.flags, SectionFlags::CONFIG | SectionFlags::END_FRAME);
        assert_eq!(sink.frames(), 1);
        drop(sink);
        assert_eq!(out, vec![20, 21, 22, 23, 0, 1, 2]);
    }

    #[test]
    fn test_stream_without_sections() {
        let stream = Buffer::new(16, "stream");
        let mut sink = BitstreamSink::new(Vec::new());
        assert_eq!(sink.write_stream(&stream).unwrap(), StreamReport::default());
        assert_eq!(sink.total_bytes(), 0);
    }

    #[test]
    fn test_flags_summary() {
        assert_eq!(flags_summary(SectionFlags::empty()), "-");
        assert_eq!(
            flags_summary(SectionFlags::CONFIG | SectionFlags::END_FRAME | SectionFlags::FILLER),
            "CFG|FILL|END"
        );
    }
}
