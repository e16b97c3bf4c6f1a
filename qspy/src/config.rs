//! 会话配置
//!
//! 支持从 JSON 配置文件读取，命令行参数覆盖文件中的值。

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::bail;
use qs_proto::record::DEFAULT_VERSION;
use qs_proto::{SessionConfig, WidthTable, DEFAULT_TCP_PORT, DEFAULT_UDP_PORT};
use serde::{Deserialize, Serialize};

use crate::seq::{DEFAULT_HEADER_EVERY, MAX_LANES};

/// 自定义反序列化 u16：支持整数或十六进制字符串
fn deserialize_hex_or_int_u16<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum HexOrInt {
        Int(u16),
        Str(String),
    }

    match HexOrInt::deserialize(deserializer)? {
        HexOrInt::Int(v) => Ok(v),
        HexOrInt::Str(s) => {
            let s = s.trim();
            if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                u16::from_str_radix(hex, 16).map_err(D::Error::custom)
            } else {
                s.parse::<u16>().map_err(D::Error::custom)
            }
        }
    }
}

/// 时序图配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeqConfig {
    /// 泳道对象名（按字典中的对象名匹配）
    pub lanes: Vec<String>,
    /// 是否增加系统边界泳道
    pub boundary: bool,
    /// 每隔多少行重复表头
    pub header_every: usize,
}

impl Default for SeqConfig {
    fn default() -> Self {
        Self {
            lanes: Vec::new(),
            boundary: false,
            header_every: DEFAULT_HEADER_EVERY,
        }
    }
}

/// qspy 配置（JSON 格式）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QspyConfig {
    /// 协议版本（支持十六进制字符串）
    #[serde(deserialize_with = "deserialize_hex_or_int_u16")]
    pub version: u16,

    /// 字段宽度表
    pub widths: WidthTable,

    /// 目标连接的 TCP 端口
    pub tcp_port: u16,

    /// 前端中继 UDP 端口，0 表示关闭
    pub udp_port: u16,

    /// 字典文件
    pub dict: Option<PathBuf>,

    /// 输出文件目录
    pub out_dir: PathBuf,

    pub seq: SeqConfig,

    /// 安静模式：不在屏幕上显示记录
    pub quiet: bool,
}

impl Default for QspyConfig {
    fn default() -> Self {
        Self {
            version: DEFAULT_VERSION,
            widths: WidthTable::default(),
            tcp_port: DEFAULT_TCP_PORT,
            udp_port: DEFAULT_UDP_PORT,
            dict: None,
            out_dir: PathBuf::from("."),
            seq: SeqConfig::default(),
            quiet: false,
        }
    }
}

impl QspyConfig {
    /// 从 JSON 文件加载配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path.as_ref())?;
        let config: QspyConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.widths.validate()?;
        if self.seq.lanes.len() > MAX_LANES {
            bail!(
                "at most {} sequence lanes allowed, got {}",
                MAX_LANES,
                self.seq.lanes.len()
            );
        }
        Ok(())
    }

    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            version: self.version,
            widths: self.widths,
        }
    }
}
