//! qspy - QS 主机端跟踪工具
//!
//! 使用方法:
//!   qspy                          # 在 TCP 6601 等待目标连接
//!   qspy -f trace.bin             # 回放二进制文件
//!   qspy --probe "nc host 6601"   # 通过桥接进程连接目标
//!   qspy --seq AO_Table,AO_Philo[0] --seq-boundary
//!
//! 运行中输入单字符命令并回车（`h` 查看帮助）。

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use qspy::{run, QspyConfig, Session, SessionOptions, TargetLink};
use tokio::net::UdpSocket;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// 解析 u16：支持十进制或 0x 前缀的十六进制
fn parse_u16(s: &str) -> Result<u16, String> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => s.parse::<u16>(),
    };
    parsed.map_err(|e| format!("invalid number '{}': {}", s, e))
}

/// QS host tracer
#[derive(Parser, Debug)]
#[command(name = "qspy")]
#[command(about = "Decode QS trace records from a target, render them and relay to front-ends")]
struct Args {
    /// TCP port to wait for the target on
    #[arg(short = 't', long)]
    tcp_port: Option<u16>,

    /// Replay a binary trace file instead of listening
    #[arg(short = 'f', long, conflicts_with = "probe")]
    file: Option<PathBuf>,

    /// Bridge command whose stdin/stdout is the target link
    #[arg(short = 'p', long)]
    probe: Option<String>,

    /// UDP port for the front-end relay (0 disables)
    #[arg(short = 'u', long)]
    udp_port: Option<u16>,

    /// Dictionary file, loaded at start and written by the 'd' command
    #[arg(short = 'd', long)]
    dict: Option<PathBuf>,

    /// Directory for output files
    #[arg(short = 'o', long)]
    out_dir: Option<PathBuf>,

    /// Sequence diagram lanes (object names, comma separated)
    #[arg(long, value_delimiter = ',')]
    seq: Vec<String>,

    /// Add a system-boundary lane to the sequence diagram
    #[arg(long)]
    seq_boundary: bool,

    /// Repeat the sequence diagram header every N lines (0 = once)
    #[arg(long)]
    seq_header: Option<usize>,

    /// QP version of the target (e.g. 720 or 0x2D0)
    #[arg(short = 'v', long, value_parser = parse_u16)]
    version: Option<u16>,

    /// Timestamp size in bytes
    #[arg(short = 'T', long)]
    tstamp_size: Option<u8>,

    /// Object pointer size in bytes
    #[arg(short = 'O', long)]
    obj_ptr_size: Option<u8>,

    /// Function pointer size in bytes
    #[arg(short = 'F', long)]
    fun_ptr_size: Option<u8>,

    /// Signal size in bytes
    #[arg(short = 'S', long)]
    sig_size: Option<u8>,

    /// Event size field in bytes
    #[arg(short = 'E', long)]
    evt_size: Option<u8>,

    /// Queue counter size in bytes
    #[arg(short = 'Q', long)]
    queue_ctr_size: Option<u8>,

    /// Memory pool counter size in bytes
    #[arg(short = 'P', long)]
    pool_ctr_size: Option<u8>,

    /// Memory pool block size field in bytes
    #[arg(short = 'B', long)]
    pool_blk_size: Option<u8>,

    /// Time event counter size in bytes
    #[arg(short = 'C', long)]
    tevt_ctr_size: Option<u8>,

    /// Do not print records on screen
    #[arg(short = 'q', long)]
    quiet: bool,

    /// JSON configuration file (command line options take precedence)
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Ignore keyboard input
    #[arg(long)]
    no_keyboard: bool,

    /// Verbose logging
    #[arg(long)]
    verbose: bool,
}

impl Args {
    /// 命令行覆盖配置文件
    fn overlay(&self, cfg: &mut QspyConfig) {
        if let Some(v) = self.tcp_port {
            cfg.tcp_port = v;
        }
        if let Some(v) = self.udp_port {
            cfg.udp_port = v;
        }
        if let Some(v) = &self.dict {
            cfg.dict = Some(v.clone());
        }
        if let Some(v) = &self.out_dir {
            cfg.out_dir = v.clone();
        }
        if !self.seq.is_empty() {
            cfg.seq.lanes = self.seq.clone();
        }
        if self.seq_boundary {
            cfg.seq.boundary = true;
        }
        if let Some(v) = self.seq_header {
            cfg.seq.header_every = v;
        }
        if let Some(v) = self.version {
            cfg.version = v;
        }

        let w = &mut cfg.widths;
        let overrides = [
            (self.tstamp_size, &mut w.tstamp),
            (self.obj_ptr_size, &mut w.obj_ptr),
            (self.fun_ptr_size, &mut w.fun_ptr),
            (self.sig_size, &mut w.sig),
            (self.evt_size, &mut w.evt_size),
            (self.queue_ctr_size, &mut w.queue_ctr),
            (self.pool_ctr_size, &mut w.pool_ctr),
            (self.pool_blk_size, &mut w.pool_blk),
            (self.tevt_ctr_size, &mut w.tevt_ctr),
        ];
        for (value, slot) in overrides {
            if let Some(v) = value {
                *slot = v;
            }
        }

        if self.quiet {
            cfg.quiet = true;
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 设置日志
    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut cfg = match &args.config {
        Some(path) => QspyConfig::from_file(path)
            .with_context(|| format!("load config {}", path.display()))?,
        None => QspyConfig::default(),
    };
    args.overlay(&mut cfg);
    cfg.validate().context("invalid configuration")?;

    info!("qspy: Starting...");
    info!(
        "qspy: QP version {}, widths {:?}",
        cfg.version, cfg.widths
    );

    let session = Session::new(SessionOptions {
        config: cfg.session(),
        dict_path: cfg.dict.clone(),
        out_dir: cfg.out_dir.clone(),
        lanes: cfg.seq.lanes.clone(),
        boundary: cfg.seq.boundary,
        header_every: cfg.seq.header_every,
        quiet: cfg.quiet,
    })?;

    let link = if let Some(path) = &args.file {
        TargetLink::open_file(path)
            .await
            .with_context(|| format!("open {}", path.display()))?
    } else if let Some(cmd) = &args.probe {
        TargetLink::spawn_bridge(cmd).with_context(|| format!("start bridge '{}'", cmd))?
    } else {
        TargetLink::listen_tcp(cfg.tcp_port)
            .await
            .with_context(|| format!("listen on TCP port {}", cfg.tcp_port))?
    };

    let relay = if cfg.udp_port == 0 {
        None
    } else {
        let sock = UdpSocket::bind(("0.0.0.0", cfg.udp_port))
            .await
            .with_context(|| format!("bind UDP port {}", cfg.udp_port))?;
        Some(sock)
    };

    let keyboard = !args.no_keyboard;
    if keyboard {
        info!("qspy: Type 'h' and Enter for help, 'x' to exit");
    }

    run(session, link, relay, keyboard).await?;
    info!("qspy: Done");
    Ok(())
}
