//! 前端中继后端
//!
//! 最多附着一个前端。附着后：
//! - 目标记录按前端订阅的通道转发（二进制原样、文本渲染行）
//! - 前端的命令映射为本地指令，或翻译成 QS-RX 记录发往目标
//!
//! 其他地址来的包（ATTACH 除外）一律忽略。

use std::net::SocketAddr;

use qs_proto::record::{put_str, put_uint};
use qs_proto::relay::{encode_packet, parse_number, take_name, RX_STATUS_ERROR};
use qs_proto::{
    BeCmd, Packet, PacketKind, RecKind, RelayError, RxRec, SessionConfig, CHANNEL_ALL,
    CHANNEL_BINARY, CHANNEL_TEXT,
};
use tracing::{debug, info, warn};

use crate::command::{Directive, Switch};
use crate::dict::Dictionaries;

/// 当前附着的前端
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attachment {
    pub addr: SocketAddr,
    /// 最近收到的前端序列号
    pub rx_seq: u8,
    pub channels: u8,
}

/// 一个前端包的处理结果
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Ignored,
    Handled,
    Directive(Directive),
    /// 发往目标的原始记录 `[id, payload..]`
    ToTarget(Vec<u8>),
    Note(String),
    Rejected(RelayError),
}

#[derive(Debug, Default)]
pub struct Backend {
    peer: Option<Attachment>,
    tx_seq: u8,
    outgoing: Vec<(SocketAddr, Vec<u8>)>,
}

impl Backend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attachment(&self) -> Option<&Attachment> {
        self.peer.as_ref()
    }

    /// 取走待发送给前端的包
    pub fn take_outgoing(&mut self) -> Vec<(SocketAddr, Vec<u8>)> {
        std::mem::take(&mut self.outgoing)
    }

    fn send(&mut self, addr: SocketAddr, id: u8, payload: &[u8]) {
        self.tx_seq = self.tx_seq.wrapping_add(1);
        self.outgoing
            .push((addr, encode_packet(self.tx_seq, id, payload)));
    }

    /// 处理一个前端数据报
    pub fn on_packet(
        &mut self,
        from: SocketAddr,
        data: &[u8],
        dicts: &Dictionaries,
        cfg: &SessionConfig,
    ) -> Inbound {
        let pkt = match Packet::decode(data) {
            Ok(pkt) => pkt,
            Err(e) => {
                warn!("Relay packet from {} dropped: {}", from, e);
                return Inbound::Ignored;
            }
        };

        if pkt.kind() == PacketKind::Command(BeCmd::Attach) {
            let channels = pkt.payload.first().copied().unwrap_or(CHANNEL_ALL);
            if let Some(old) = self.peer.filter(|p| p.addr != from) {
                info!("Front-end {} replaced by {}", old.addr, from);
            }
            self.peer = Some(Attachment {
                addr: from,
                rx_seq: pkt.seq,
                channels,
            });
            self.tx_seq = 0;
            info!("Front-end attached: {} (channels 0x{:02X})", from, channels);
            self.send(from, BeCmd::Attach as u8, &[]);
            return Inbound::Handled;
        }

        let Some(peer) = self.peer.as_mut().filter(|p| p.addr == from) else {
            debug!("Ignoring relay packet from non-attached {}", from);
            return Inbound::Ignored;
        };

        let expected = peer.rx_seq.wrapping_add(1);
        if pkt.seq != expected {
            warn!(
                "Relay sequence discontinuity: expected {} got {}",
                expected, pkt.seq
            );
        }
        peer.rx_seq = pkt.seq;

        match pkt.kind() {
            PacketKind::ToTarget(_) => Inbound::ToTarget(Packet::raw_record(data).to_vec()),
            PacketKind::Unknown(id) => {
                warn!("Unknown relay command {}", id);
                Inbound::Ignored
            }
            PacketKind::Command(cmd) => self.on_command(from, cmd, pkt.payload, dicts, cfg),
        }
    }

    fn on_command(
        &mut self,
        from: SocketAddr,
        cmd: BeCmd,
        payload: &[u8],
        dicts: &Dictionaries,
        cfg: &SessionConfig,
    ) -> Inbound {
        let switch = Switch::from_payload(payload);
        let directive = match cmd {
            BeCmd::Attach => return Inbound::Handled,
            BeCmd::Detach => {
                info!("Front-end detached: {}", from);
                self.peer = None;
                return Inbound::Handled;
            }
            BeCmd::SaveDict => Directive::SaveDictionaries,
            BeCmd::TextOut => Directive::TextFile(switch),
            BeCmd::BinOut => Directive::BinaryFile(switch),
            BeCmd::MatlabOut => Directive::MatlabFile(switch),
            BeCmd::SequenceOut => Directive::SequenceFile(switch),
            BeCmd::ClearScreen => Directive::ClearScreen,
            BeCmd::ShowNote => {
                let text = payload.get(1..).unwrap_or(&[]);
                return Inbound::Note(String::from_utf8_lossy(text).into_owned());
            }
            BeCmd::SendEvent
            | BeCmd::SendAoFilter
            | BeCmd::SendCurrObj
            | BeCmd::SendCommand
            | BeCmd::SendTestProbe => {
                return match translate(cmd, payload, dicts, cfg) {
                    Ok(raw) => Inbound::ToTarget(raw),
                    Err(e) => {
                        warn!("Front-end command rejected: {}", e);
                        let mut status = vec![RX_STATUS_ERROR | (cmd as u8 & 0x7F)];
                        status.extend_from_slice(e.to_string().as_bytes());
                        self.send(from, RecKind::RxStatus.id(), &status);
                        Inbound::Rejected(e)
                    }
                };
            }
        };
        Inbound::Directive(directive)
    }

    /// 把一条目标记录转发给前端
    ///
    /// `raw` 为 `[id, payload..]`；`text` 为空表示该记录不走文本通道。
    /// 目标信息记录无论订阅与否都会转发。
    pub fn forward(&mut self, raw: &[u8], text: Option<&str>) {
        let Some(peer) = self.peer else {
            return;
        };
        let Some((&id, payload)) = raw.split_first() else {
            return;
        };
        let always = id == RecKind::TargetInfo.id();

        if always || peer.channels & CHANNEL_BINARY != 0 {
            self.send(peer.addr, id, payload);
        }
        if let Some(text) = text {
            if peer.channels & CHANNEL_TEXT != 0 {
                self.send(peer.addr, id, text.as_bytes());
            }
        }
    }
}

fn malformed(cmd: BeCmd) -> RelayError {
    RelayError::Malformed { cmd }
}

/// 名字或数字字面量解析为键，且必须能放进目标字段的 `width` 字节
fn resolve<F>(cmd: BeCmd, name: &str, width: u8, lookup: F) -> Result<u64, RelayError>
where
    F: FnOnce(&str) -> Option<u64>,
{
    let value = lookup(name)
        .or_else(|| parse_number(name))
        .ok_or_else(|| RelayError::Unresolved {
            cmd,
            name: name.to_string(),
        })?;
    if width < 8 && value >> (8 * u32::from(width)) != 0 {
        return Err(RelayError::OutOfRange {
            cmd,
            name: name.to_string(),
            width,
        });
    }
    Ok(value)
}

fn read_u32(cmd: BeCmd, data: &[u8]) -> Result<(u32, &[u8]), RelayError> {
    if data.len() < 4 {
        return Err(malformed(cmd));
    }
    let (head, rest) = data.split_at(4);
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(head);
    Ok((u32::from_le_bytes(bytes), rest))
}

/// 把前端的符号化命令翻译为 QS-RX 记录 `[id, payload..]`
pub fn translate(
    cmd: BeCmd,
    payload: &[u8],
    dicts: &Dictionaries,
    cfg: &SessionConfig,
) -> Result<Vec<u8>, RelayError> {
    let w = &cfg.widths;
    let mut out = Vec::new();

    match cmd {
        BeCmd::SendEvent => {
            let (&prio, rest) = payload.split_first().ok_or(malformed(cmd))?;
            let (name, params) = take_name(rest).ok_or(malformed(cmd))?;
            let sig = resolve(cmd, &name, w.sig, |n| {
                dicts.find_sig(n).map(|(sig, _)| sig)
            })?;
            let len = u16::try_from(params.len()).map_err(|_| malformed(cmd))?;
            out.push(RxRec::Event as u8);
            out.push(prio);
            put_uint(&mut out, sig, w.sig);
            out.extend_from_slice(&len.to_le_bytes());
            out.extend_from_slice(params);
        }
        BeCmd::SendAoFilter => {
            let (name, _) = take_name(payload).ok_or(malformed(cmd))?;
            let obj = resolve(cmd, &name, w.obj_ptr, |n| dicts.find_obj(n))?;
            out.push(RxRec::AoFilter as u8);
            put_uint(&mut out, obj, w.obj_ptr);
        }
        BeCmd::SendCurrObj => {
            let (&kind, rest) = payload.split_first().ok_or(malformed(cmd))?;
            let (name, _) = take_name(rest).ok_or(malformed(cmd))?;
            let obj = resolve(cmd, &name, w.obj_ptr, |n| dicts.find_obj(n))?;
            out.push(RxRec::CurrObj as u8);
            out.push(kind);
            put_uint(&mut out, obj, w.obj_ptr);
        }
        BeCmd::SendCommand => {
            let (name, rest) = take_name(payload).ok_or(malformed(cmd))?;
            let id = resolve(cmd, &name, 1, |n| dicts.find_usr(n).map(u64::from))? as u8;
            let (p1, rest) = read_u32(cmd, rest)?;
            let (p2, rest) = read_u32(cmd, rest)?;
            let (p3, _) = read_u32(cmd, rest)?;
            out.push(RxRec::Command as u8);
            out.push(id);
            for p in [p1, p2, p3] {
                out.extend_from_slice(&p.to_le_bytes());
            }
        }
        BeCmd::SendTestProbe => {
            let (data, rest) = read_u32(cmd, payload)?;
            let (name, _) = take_name(rest).ok_or(malformed(cmd))?;
            let fun = resolve(cmd, &name, w.fun_ptr, |n| dicts.find_fun(n))?;
            out.push(RxRec::TestProbe as u8);
            out.extend_from_slice(&data.to_le_bytes());
            put_uint(&mut out, fun, w.fun_ptr);
        }
        _ => return Err(malformed(cmd)),
    }
    Ok(out)
}

/// 构造一个带名字的前端命令负载（测试与工具使用）
pub fn name_payload(prefix: &[u8], name: &str, suffix: &[u8]) -> Vec<u8> {
    let mut out = prefix.to_vec();
    put_str(&mut out, name);
    out.extend_from_slice(suffix);
    out
}
