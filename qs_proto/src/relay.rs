//! 前端中继协议 (UDP)
//!
//! 每个 UDP 数据报是一个包：
//! ```text
//! struct relay_packet {
//!     seq: u8,        // 发送方序列号
//!     id: u8,         // < 128: 原样转发给目标的 QS-RX 记录; >= 128: 后端命令
//!     payload: [u8],
//! }
//! ```

use thiserror::Error;

/// 默认中继端口
pub const DEFAULT_UDP_PORT: u16 = 7701;

/// 二进制通道：原始记录
pub const CHANNEL_BINARY: u8 = 0x01;

/// 文本通道：渲染后的文本行
pub const CHANNEL_TEXT: u8 = 0x02;

/// ATTACH 未指定通道时的默认值
pub const CHANNEL_ALL: u8 = CHANNEL_BINARY | CHANNEL_TEXT;

/// 后端命令起始 ID
pub const BE_CMD_BASE: u8 = 128;

/// RX_STATUS 中的错误标志
pub const RX_STATUS_ERROR: u8 = 0x80;

/// 中继错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("packet too short: {len} bytes")]
    TooShort { len: usize },
    #[error("{cmd:?}: malformed payload")]
    Malformed { cmd: BeCmd },
    #[error("{cmd:?}: cannot resolve '{name}'")]
    Unresolved { cmd: BeCmd, name: String },
    #[error("{cmd:?}: '{name}' does not fit in {width} bytes")]
    OutOfRange { cmd: BeCmd, name: String, width: u8 },
}

/// 后端命令
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BeCmd {
    Attach = 128,
    Detach = 129,
    SaveDict = 130,
    TextOut = 131,
    BinOut = 132,
    MatlabOut = 133,
    SequenceOut = 134,
    SendEvent = 135,
    SendAoFilter = 136,
    SendCurrObj = 137,
    SendCommand = 138,
    SendTestProbe = 139,
    ClearScreen = 140,
    ShowNote = 141,
}

impl TryFrom<u8> for BeCmd {
    type Error = u8;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        Ok(match v {
            128 => BeCmd::Attach,
            129 => BeCmd::Detach,
            130 => BeCmd::SaveDict,
            131 => BeCmd::TextOut,
            132 => BeCmd::BinOut,
            133 => BeCmd::MatlabOut,
            134 => BeCmd::SequenceOut,
            135 => BeCmd::SendEvent,
            136 => BeCmd::SendAoFilter,
            137 => BeCmd::SendCurrObj,
            138 => BeCmd::SendCommand,
            139 => BeCmd::SendTestProbe,
            140 => BeCmd::ClearScreen,
            141 => BeCmd::ShowNote,
            other => return Err(other),
        })
    }
}

/// 包的用途
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// 原样转发给目标
    ToTarget(u8),
    Command(BeCmd),
    /// 未知后端命令
    Unknown(u8),
}

/// 一个中继包（借用接收缓冲）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packet<'a> {
    pub seq: u8,
    pub id: u8,
    pub payload: &'a [u8],
}

impl<'a> Packet<'a> {
    pub fn decode(data: &'a [u8]) -> Result<Self, RelayError> {
        match data {
            [seq, id, payload @ ..] => Ok(Self {
                seq: *seq,
                id: *id,
                payload,
            }),
            _ => Err(RelayError::TooShort { len: data.len() }),
        }
    }

    pub fn kind(&self) -> PacketKind {
        if self.id < BE_CMD_BASE {
            PacketKind::ToTarget(self.id)
        } else {
            match BeCmd::try_from(self.id) {
                Ok(cmd) => PacketKind::Command(cmd),
                Err(id) => PacketKind::Unknown(id),
            }
        }
    }

    /// 去掉 seq 后的原始记录 `[id, payload..]`
    pub fn raw_record(data: &'a [u8]) -> &'a [u8] {
        data.get(1..).unwrap_or(&[])
    }
}

/// 编码一个中继包
pub fn encode_packet(seq: u8, id: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + payload.len());
    out.push(seq);
    out.push(id);
    out.extend_from_slice(payload);
    out
}

/// 读取 u8 长度前缀的名字，返回名字和剩余负载
pub fn take_name(payload: &[u8]) -> Option<(String, &[u8])> {
    let (&len, rest) = payload.split_first()?;
    let len = len as usize;
    if rest.len() < len {
        return None;
    }
    let name = String::from_utf8_lossy(&rest[..len]).into_owned();
    Some((name, &rest[len..]))
}

/// 名字可以直接写成数字：`0x1F` 或 `31`
pub fn parse_number(s: &str) -> Option<u64> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}
