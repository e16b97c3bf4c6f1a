//! 输出文件
//!
//! 四种可开关的输出，文件名为 `qspy<unix 秒>.<扩展名>`，同名文件已存在时
//! 加 `_1`、`_2` 等后缀，不会覆盖：
//! - 文本：渲染后的记录行
//! - 二进制：链路原始字节（可用 `--file` 回放）
//! - Matlab：用户记录的数值行
//! - 时序图

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{info, warn};

use crate::command::Switch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkKind {
    Text,
    Binary,
    Matlab,
    Sequence,
}

impl SinkKind {
    pub fn ext(self) -> &'static str {
        match self {
            SinkKind::Text => "txt",
            SinkKind::Binary => "bin",
            SinkKind::Matlab => "mat",
            SinkKind::Sequence => "seq",
        }
    }

    const ALL: [SinkKind; 4] = [
        SinkKind::Text,
        SinkKind::Binary,
        SinkKind::Matlab,
        SinkKind::Sequence,
    ];
}

struct Sink {
    path: PathBuf,
    writer: BufWriter<File>,
}

/// 输出文件集合，关闭是幂等的，`Drop` 时也会关闭
pub struct Outputs {
    dir: PathBuf,
    sinks: [Option<Sink>; 4],
}

impl std::fmt::Debug for Outputs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let open: Vec<_> = self.sinks.iter().flatten().map(|s| &s.path).collect();
        f.debug_struct("Outputs")
            .field("dir", &self.dir)
            .field("open", &open)
            .finish()
    }
}

fn slot(kind: SinkKind) -> usize {
    kind as usize
}

/// 同一秒内重复打开时最多尝试的后缀数
const MAX_SUFFIX: u32 = 1000;

/// 新建一个不存在的文件，名字冲突时追加数字后缀
fn create_unique(dir: &Path, stem: &str, ext: &str) -> io::Result<(PathBuf, File)> {
    for n in 0..MAX_SUFFIX {
        let name = if n == 0 {
            format!("{}.{}", stem, ext)
        } else {
            format!("{}_{}.{}", stem, n, ext)
        };
        let path = dir.join(name);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("no free name for {}.{} in {}", stem, ext, dir.display()),
    ))
}

fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl Outputs {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            sinks: [None, None, None, None],
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_open(&self, kind: SinkKind) -> bool {
        self.sinks[slot(kind)].is_some()
    }

    pub fn path(&self, kind: SinkKind) -> Option<&Path> {
        self.sinks[slot(kind)].as_ref().map(|s| s.path.as_path())
    }

    pub fn open(&mut self, kind: SinkKind) -> io::Result<&Path> {
        self.close(kind);
        let stem = format!("qspy{}", unix_secs());
        let (path, file) = create_unique(&self.dir, &stem, kind.ext())?;
        info!("Opened {:?} output: {}", kind, path.display());
        let sink = self.sinks[slot(kind)].insert(Sink {
            path,
            writer: BufWriter::new(file),
        });
        Ok(sink.path.as_path())
    }

    pub fn close(&mut self, kind: SinkKind) {
        if let Some(mut sink) = self.sinks[slot(kind)].take() {
            if let Err(e) = sink.writer.flush() {
                warn!("Failed to flush {}: {}", sink.path.display(), e);
            }
            info!("Closed {:?} output: {}", kind, sink.path.display());
        }
    }

    /// 按开关动作打开或关闭，返回之后是否处于打开状态
    pub fn switch(&mut self, kind: SinkKind, switch: Switch) -> io::Result<bool> {
        let want = switch.apply(self.is_open(kind));
        if want == self.is_open(kind) {
            return Ok(want);
        }
        if want {
            self.open(kind)?;
        } else {
            self.close(kind);
        }
        Ok(want)
    }

    fn write(&mut self, kind: SinkKind, data: &[u8]) {
        let Some(sink) = self.sinks[slot(kind)].as_mut() else {
            return;
        };
        if let Err(e) = sink.writer.write_all(data) {
            warn!("Write to {} failed: {}", sink.path.display(), e);
            self.close(kind);
        }
    }

    fn write_line(&mut self, kind: SinkKind, line: &str) {
        if self.is_open(kind) {
            let mut buf = Vec::with_capacity(line.len() + 1);
            buf.extend_from_slice(line.as_bytes());
            buf.push(b'\n');
            self.write(kind, &buf);
        }
    }

    pub fn write_text(&mut self, line: &str) {
        self.write_line(SinkKind::Text, line);
    }

    pub fn write_binary(&mut self, data: &[u8]) {
        self.write(SinkKind::Binary, data);
    }

    pub fn write_matlab(&mut self, row: &str) {
        self.write_line(SinkKind::Matlab, row);
    }

    pub fn write_seq(&mut self, lines: &[String]) {
        for line in lines {
            self.write_line(SinkKind::Sequence, line);
        }
    }

    pub fn close_all(&mut self) {
        for kind in SinkKind::ALL {
            self.close(kind);
        }
    }
}

impl Drop for Outputs {
    fn drop(&mut self) {
        self.close_all();
    }
}
