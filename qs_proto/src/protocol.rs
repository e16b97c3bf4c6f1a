//! QS 帧协议 (HDLC 风格的透明传输)
//!
//! 帧结构（转义前）：
//! ```text
//! struct qs_frame {
//!     seq: u8,          // 序列号 (0-255 回绕)
//!     rec_id: u8,       // 记录ID
//!     payload: [u8],    // 负载数据
//!     chksum: u8,       // !(seq + rec_id + payload) 的 8 位累加和取反
//! }
//! ```
//!
//! 帧以一个未转义的 `FLAG` 结束。帧内出现的 `FLAG` 或 `ESC` 被替换为
//! `ESC, byte ^ ESC_XOR`。接收端对全部字节（含校验和）求和，结果必须为 `0xFF`。

use thiserror::Error;

/// 帧结束标志
pub const FLAG: u8 = 0x7E;

/// 转义字节
pub const ESC: u8 = 0x7D;

/// 转义异或掩码
pub const ESC_XOR: u8 = 0x20;

/// 正确帧的校验累加结果
pub const GOOD_CHKSUM: u8 = 0xFF;

/// 最短帧: seq + rec_id + chksum
pub const MIN_FRAME_SIZE: usize = 3;

/// 默认接收缓冲（去转义后的字节数）
pub const DEFAULT_MAX_FRAME: usize = 1024;

/// 默认目标 TCP 端口
pub const DEFAULT_TCP_PORT: u16 = 6601;

/// 主机发往目标的记录 ID (QS-RX)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RxRec {
    Info = 0,
    Command = 1,
    Reset = 2,
    Tick = 3,
    Peek = 4,
    Poke = 5,
    Fill = 6,
    TestSetup = 7,
    TestTeardown = 8,
    TestProbe = 9,
    GlbFilter = 10,
    LocFilter = 11,
    AoFilter = 12,
    CurrObj = 13,
    TestContinue = 14,
    QueryCurr = 15,
    Event = 16,
}

/// 协议错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("output buffer too small ({capacity} bytes)")]
    BufferTooSmall { capacity: usize },
    #[error("record must contain at least a record ID")]
    EmptyRecord,
}

/// 帧级错误：只影响单帧，解码器随后继续工作
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    #[error("bad checksum (seq={seq}, {len} bytes)")]
    Checksum { seq: u8, len: usize },
    #[error("frame too short: {len} bytes")]
    TooShort { len: usize },
    #[error("frame too long: exceeds {max} bytes")]
    TooLong { max: usize },
}

/// 去转义、校验通过的一帧
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    pub seq: u8,
    pub rec_id: u8,
    pub payload: &'a [u8],
}

/// 带边界检查的转义写入器
struct EscapeWriter<'a> {
    out: &'a mut [u8],
    len: usize,
}

impl EscapeWriter<'_> {
    fn put(&mut self, b: u8) -> Result<(), ProtocolError> {
        let capacity = self.out.len();
        let slot = self
            .out
            .get_mut(self.len)
            .ok_or(ProtocolError::BufferTooSmall { capacity })?;
        *slot = b;
        self.len += 1;
        Ok(())
    }

    fn put_escaped(&mut self, b: u8) -> Result<(), ProtocolError> {
        if b == FLAG || b == ESC {
            self.put(ESC)?;
            self.put(b ^ ESC_XOR)
        } else {
            self.put(b)
        }
    }
}

/// 发送方向的帧编码器，维护发送序列号
#[derive(Debug, Default, Clone)]
pub struct FrameEncoder {
    seq: u8,
}

impl FrameEncoder {
    pub fn new() -> Self {
        Self { seq: 0 }
    }

    /// 从上一次发送的序列号继续（下一帧使用 `last_seq + 1`）
    pub fn resume(last_seq: u8) -> Self {
        Self { seq: last_seq }
    }

    /// 最近一次发送的序列号
    pub fn last_seq(&self) -> u8 {
        self.seq
    }

    /// 重连时清零
    pub fn reset(&mut self) {
        self.seq = 0;
    }

    /// 单条记录编码后的最大长度
    pub fn max_encoded_len(raw_len: usize) -> usize {
        // seq + raw + chksum 都可能被转义，再加一个 FLAG
        2 * (raw_len + 2) + 1
    }

    /// 编码 `raw = [rec_id, payload..]` 到调用方提供的缓冲区
    ///
    /// 缓冲区不足时返回 `BufferTooSmall`，且序列号不前进。
    pub fn encode_into(&mut self, raw: &[u8], out: &mut [u8]) -> Result<usize, ProtocolError> {
        if raw.is_empty() {
            return Err(ProtocolError::EmptyRecord);
        }

        let seq = self.seq.wrapping_add(1);
        let mut writer = EscapeWriter { out, len: 0 };
        let mut chksum = 0u8;

        for &b in std::iter::once(&seq).chain(raw) {
            chksum = chksum.wrapping_add(b);
            writer.put_escaped(b)?;
        }
        writer.put_escaped(!chksum)?;
        writer.put(FLAG)?;

        self.seq = seq;
        Ok(writer.len)
    }

    /// 编码为新分配的字节序列
    pub fn encode(&mut self, raw: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let mut out = vec![0u8; Self::max_encoded_len(raw.len())];
        let len = self.encode_into(raw, &mut out)?;
        out.truncate(len);
        Ok(out)
    }

    /// 按记录 ID 和负载编码
    pub fn encode_record(&mut self, rec_id: u8, payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let mut raw = Vec::with_capacity(1 + payload.len());
        raw.push(rec_id);
        raw.extend_from_slice(payload);
        self.encode(&raw)
    }
}

/// 流式帧解码器
///
/// 逐字节消费链路数据，跨调用保存转义状态和半帧。
/// 缓冲区只在创建时分配一次；超长帧被整体丢弃，直到下一个 `FLAG` 重新同步。
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Box<[u8]>,
    len: usize,
    esc: bool,
    overflow: bool,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_max_frame(DEFAULT_MAX_FRAME)
    }

    pub fn with_max_frame(max_frame: usize) -> Self {
        Self {
            buf: vec![0u8; max_frame.max(MIN_FRAME_SIZE)].into_boxed_slice(),
            len: 0,
            esc: false,
            overflow: false,
        }
    }

    /// 丢弃半帧和转义状态
    pub fn reset(&mut self) {
        self.len = 0;
        self.esc = false;
        self.overflow = false;
    }

    /// 是否处于帧边界（没有未完成的半帧）
    pub fn is_idle(&self) -> bool {
        self.len == 0 && !self.esc && !self.overflow
    }

    /// 喂入链路字节，每完成一帧回调一次
    pub fn feed<F>(&mut self, data: &[u8], mut on_frame: F)
    where
        F: FnMut(Result<Frame<'_>, FrameError>),
    {
        for &b in data {
            match b {
                FLAG => self.finish(&mut on_frame),
                ESC => self.esc = true,
                _ => {
                    let b = if self.esc {
                        self.esc = false;
                        b ^ ESC_XOR
                    } else {
                        b
                    };
                    self.push(b);
                }
            }
        }
    }

    fn push(&mut self, b: u8) {
        match self.buf.get_mut(self.len) {
            Some(slot) => {
                *slot = b;
                self.len += 1;
            }
            None => self.overflow = true,
        }
    }

    fn finish<F>(&mut self, on_frame: &mut F)
    where
        F: FnMut(Result<Frame<'_>, FrameError>),
    {
        let len = self.len;
        let overflow = self.overflow;
        self.reset();

        if overflow {
            on_frame(Err(FrameError::TooLong {
                max: self.buf.len(),
            }));
            return;
        }
        if len == 0 {
            return;
        }
        if len < MIN_FRAME_SIZE {
            on_frame(Err(FrameError::TooShort { len }));
            return;
        }

        let frame = &self.buf[..len];
        let sum = frame.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
        if sum != GOOD_CHKSUM {
            on_frame(Err(FrameError::Checksum {
                seq: frame[0],
                len,
            }));
            return;
        }

        on_frame(Ok(Frame {
            seq: frame[0],
            rec_id: frame[1],
            payload: &frame[2..len - 1],
        }));
    }
}
