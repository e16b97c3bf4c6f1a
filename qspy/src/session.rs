//! 会话
//!
//! [`Session`] 持有一次运行的全部状态：解码器、会话配置、字典、时序图、
//! 前端中继和输出文件。它本身不做 I/O，事件循环把链路字节、键盘输入和
//! 前端数据报交给它，再从 [`Outbox`] 取走需要发出的内容。

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use qs_proto::{
    parse_record, Body, Frame, FrameDecoder, FrameEncoder, FrameError, RecKind, Record, RxRec,
    SessionConfig, TargetInfo, Value,
};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::backend::{Backend, Inbound};
use crate::command::{Directive, Switch, HELP};
use crate::dict::{DictError, Dictionaries};
use crate::dispatch::{format_line, matlab_row, render, seq_event, SeqEvent};
use crate::output::{Outputs, SinkKind};
use crate::seq::{SeqDiagram, SeqError, DEFAULT_HEADER_EVERY};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Seq(#[from] SeqError),
    #[error("dictionary file {}: {source}", path.display())]
    Dict {
        path: PathBuf,
        #[source]
        source: DictError,
    },
}

/// 会话启动参数
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub config: SessionConfig,
    /// 启动时加载、`d` 指令保存的字典文件
    pub dict_path: Option<PathBuf>,
    pub out_dir: PathBuf,
    pub lanes: Vec<String>,
    pub boundary: bool,
    pub header_every: usize,
    pub quiet: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            config: SessionConfig::default(),
            dict_path: None,
            out_dir: PathBuf::from("."),
            lanes: Vec::new(),
            boundary: false,
            header_every: DEFAULT_HEADER_EVERY,
            quiet: false,
        }
    }
}

/// 一轮事件处理后待发出的内容
#[derive(Debug, Default)]
pub struct Outbox {
    /// 屏幕行
    pub screen: Vec<String>,
    /// 已成帧、发往目标的字节
    pub to_target: Vec<Vec<u8>>,
    /// 发往前端的数据报
    pub to_peer: Vec<(SocketAddr, Vec<u8>)>,
    pub clear_screen: bool,
    pub exit: bool,
}

impl Outbox {
    pub fn is_empty(&self) -> bool {
        self.screen.is_empty()
            && self.to_target.is_empty()
            && self.to_peer.is_empty()
            && !self.clear_screen
            && !self.exit
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub frames: u64,
    pub bad_frames: u64,
    pub parse_errors: u64,
    pub gaps: u64,
}

/// 除解码器以外的会话状态，解码回调借用它
#[derive(Debug)]
struct Core {
    cfg: SessionConfig,
    /// 当前字典所对应的配置（来自字典文件或已保存的字典）
    dict_config: Option<SessionConfig>,
    target: Option<TargetInfo>,
    dicts: Dictionaries,
    seq: SeqDiagram,
    backend: Backend,
    encoder: FrameEncoder,
    rx_seq: Option<u8>,
    outputs: Outputs,
    dict_path: Option<PathBuf>,
    quiet: bool,
    stats: Stats,
    outbox: Outbox,
}

#[derive(Debug)]
pub struct Session {
    decoder: FrameDecoder,
    core: Core,
}

impl Session {
    pub fn new(opts: SessionOptions) -> Result<Self, SessionError> {
        let mut seq = SeqDiagram::new(opts.header_every);
        seq.configure(&opts.lanes, opts.boundary)?;

        let mut core = Core {
            cfg: opts.config,
            dict_config: None,
            target: None,
            dicts: Dictionaries::new(),
            seq,
            backend: Backend::new(),
            encoder: FrameEncoder::new(),
            rx_seq: None,
            outputs: Outputs::new(opts.out_dir),
            dict_path: opts.dict_path,
            quiet: opts.quiet,
            stats: Stats::default(),
            outbox: Outbox::default(),
        };

        if let Some(path) = core.dict_path.clone() {
            if path.exists() {
                core.load_dictionaries(&path)?;
            } else {
                debug!("Dictionary file {} not found yet", path.display());
            }
        }

        Ok(Self {
            decoder: FrameDecoder::new(),
            core,
        })
    }

    /// 处理目标链路上的一段原始字节
    pub fn on_link_data(&mut self, data: &[u8]) {
        self.core.outputs.write_binary(data);
        let core = &mut self.core;
        self.decoder.feed(data, |res| match res {
            Ok(frame) => core.on_frame(frame),
            Err(e) => core.on_bad_frame(e),
        });
    }

    /// 新的目标连接: 解码器、收发序列号复位，字典保留
    pub fn on_reconnect(&mut self) {
        info!("Target link (re)established");
        self.decoder.reset();
        self.core.encoder.reset();
        self.core.rx_seq = None;
    }

    /// 处理一行键盘输入，每个字符是一条指令
    pub fn on_keyboard(&mut self, line: &str) {
        for key in line.trim().chars() {
            match Directive::from_key(key) {
                Some(directive) => self.core.apply(directive),
                None => warn!("Unknown key '{}', press 'h' for help", key),
            }
        }
    }

    /// 处理一个前端数据报
    pub fn on_relay(&mut self, from: SocketAddr, data: &[u8]) {
        let core = &mut self.core;
        match core.backend.on_packet(from, data, &core.dicts, &core.cfg) {
            Inbound::Directive(directive) => core.apply(directive),
            Inbound::ToTarget(raw) => core.send_raw(&raw),
            Inbound::Note(text) => {
                let line = format_line(None, "Note", &text);
                core.show(line);
            }
            Inbound::Ignored | Inbound::Handled | Inbound::Rejected(_) => {}
        }
    }

    pub fn apply(&mut self, directive: Directive) {
        self.core.apply(directive);
    }

    /// 取走待发出的内容
    pub fn take_outbox(&mut self) -> Outbox {
        let peer = self.core.backend.take_outgoing();
        self.core.outbox.to_peer.extend(peer);
        std::mem::take(&mut self.core.outbox)
    }

    /// 关闭全部输出文件；可重复调用
    pub fn shutdown(&mut self) {
        self.core.outputs.close_all();
        let s = self.core.stats;
        info!(
            "Session done: {} frames, {} bad frames, {} parse errors, {} discontinuities",
            s.frames, s.bad_frames, s.parse_errors, s.gaps
        );
    }

    pub fn config(&self) -> &SessionConfig {
        &self.core.cfg
    }

    pub fn target(&self) -> Option<&TargetInfo> {
        self.core.target.as_ref()
    }

    pub fn dictionaries(&self) -> &Dictionaries {
        &self.core.dicts
    }

    pub fn sequence(&self) -> &SeqDiagram {
        &self.core.seq
    }

    pub fn backend(&self) -> &Backend {
        &self.core.backend
    }

    pub fn outputs(&self) -> &Outputs {
        &self.core.outputs
    }

    pub fn stats(&self) -> Stats {
        self.core.stats
    }

    pub fn is_quiet(&self) -> bool {
        self.core.quiet
    }
}

impl Core {
    fn load_dictionaries(&mut self, path: &Path) -> Result<(), SessionError> {
        let wrap = |source: DictError| SessionError::Dict {
            path: path.to_path_buf(),
            source,
        };
        let file = File::open(path).map_err(|e| wrap(e.into()))?;
        let cfg = self
            .dicts
            .read_all(BufReader::new(file), None)
            .map_err(wrap)?;
        self.cfg = cfg;
        self.dict_config = Some(cfg);
        for (key, name) in self.dicts.objects() {
            self.seq.on_obj_dict(key, name);
        }
        info!("Loaded dictionaries from {}", path.display());
        Ok(())
    }

    fn on_bad_frame(&mut self, e: FrameError) {
        self.stats.bad_frames += 1;
        warn!("Bad frame dropped: {}", e);
    }

    fn on_frame(&mut self, frame: Frame<'_>) {
        self.stats.frames += 1;
        if let Some(prev) = self.rx_seq {
            let expected = prev.wrapping_add(1);
            if frame.seq != expected {
                self.stats.gaps += 1;
                warn!("Discontinuity: expected seq {} got {}", expected, frame.seq);
            }
        }
        self.rx_seq = Some(frame.seq);

        let rec = match parse_record(frame.rec_id, frame.payload, &self.cfg) {
            Ok(rec) => rec,
            Err(e) => {
                self.stats.parse_errors += 1;
                warn!("Record dropped: {}", e);
                return;
            }
        };
        if rec.kind == Some(RecKind::Empty) {
            return;
        }
        self.dispatch(&rec, frame.payload);
    }

    fn dispatch(&mut self, rec: &Record<'_>, payload: &[u8]) {
        match (&rec.body, rec.kind) {
            (Body::TargetInfo(info), _) => self.on_target_info(info),
            (Body::Fields(values), Some(kind)) if kind.is_dictionary() => {
                self.on_dictionary(kind, values)
            }
            _ => {}
        }

        let line = render(rec, &self.dicts, &self.cfg.widths);
        if rec.kind == Some(RecKind::AssertFail) {
            error!("Target assertion: {}", line);
        }
        self.outputs.write_text(&line);
        if rec.is_user() {
            if let Some(row) = matlab_row(rec) {
                self.outputs.write_matlab(&row);
            }
        }
        if self.seq.is_active() {
            if let Some(ev) = seq_event(rec) {
                self.draw(ev);
            }
            let lines = self.seq.take_lines();
            self.outputs.write_seq(&lines);
        }

        if self.backend.attachment().is_some() {
            let mut raw = Vec::with_capacity(payload.len() + 1);
            raw.push(rec.id);
            raw.extend_from_slice(payload);
            let is_dict = rec.kind.is_some_and(RecKind::is_dictionary);
            let text = (!is_dict).then_some(line.as_str());
            self.backend.forward(&raw, text);
        }

        if !self.quiet {
            self.outbox.screen.push(line);
        }
    }

    fn on_target_info(&mut self, info: &TargetInfo) {
        if info.is_reset {
            info!("Target reset, clearing dictionaries");
            self.dicts.reset_all();
            self.seq.reset_map();
        }
        if let Some(dict_cfg) = self.dict_config {
            if dict_cfg != info.config {
                error!(
                    "Dictionary configuration {:?} does not match target {:?}, dictionaries cleared",
                    dict_cfg, info.config
                );
                self.dicts.reset_all();
                self.seq.reset_map();
                self.dict_config = None;
            }
        }
        if self.cfg != info.config {
            info!(
                "Adopting target configuration: version {}, {:?}",
                info.config.version, info.config.widths
            );
        }
        self.cfg = info.config;
        self.target = Some(*info);
    }

    fn on_dictionary(&mut self, kind: RecKind, values: &[Value<'_>]) {
        let uint = |i: usize| values.get(i).and_then(Value::as_uint).unwrap_or(0);
        let name = |i: usize| values.get(i).and_then(Value::as_str).unwrap_or("");
        match kind {
            RecKind::ObjDict => {
                self.dicts.put_obj(uint(0), name(1));
                self.seq.on_obj_dict(uint(0), name(1));
            }
            RecKind::FunDict => {
                self.dicts.put_fun(uint(0), name(1));
            }
            RecKind::SigDict => {
                self.dicts.put_sig(uint(0), uint(1), name(2));
            }
            RecKind::UsrDict => {
                self.dicts.put_usr(uint(0) as u8, name(1));
            }
            RecKind::EnumDict => {
                self.dicts.put_enum(uint(1) as u8, uint(0) as u8, name(2));
            }
            _ => {}
        }
    }

    fn draw(&mut self, ev: SeqEvent) {
        match ev {
            SeqEvent::Post {
                ts,
                src,
                dst,
                sig,
                attempt,
            } => {
                if let (Some(s), Some(d)) = (self.seq.lane_for(src), self.seq.lane_for(dst)) {
                    let label = self.sig_name(sig, dst);
                    self.seq.on_post(ts, s, d, &label, attempt);
                }
            }
            SeqEvent::Publish { ts, src, sig } => {
                if let Some(s) = self.seq.lane_for(src) {
                    let label = self.sig_name(sig, 0);
                    self.seq.on_publish(ts, s, &label);
                }
            }
            SeqEvent::Transition { ts, obj, state } => {
                if let Some(lane) = self.seq.lane_of(obj) {
                    let state = self
                        .dicts
                        .fun(state)
                        .map(str::to_string)
                        .unwrap_or_else(|| format!("0x{:X}", state));
                    self.seq.on_transition(ts, lane, &state);
                }
            }
            SeqEvent::Dispatch { ts, obj, sig } => {
                if let Some(lane) = self.seq.lane_of(obj) {
                    let label = self.sig_name(sig, obj);
                    self.seq.on_dispatch(ts, lane, &label);
                }
            }
            SeqEvent::Ignored { ts, obj, sig } => {
                if let Some(lane) = self.seq.lane_of(obj) {
                    let label = self.sig_name(sig, obj);
                    self.seq.on_ignored(ts, lane, &label);
                }
            }
            SeqEvent::Tick { rate, counter } => self.seq.on_tick(rate, counter),
        }
    }

    fn sig_name(&self, sig: u64, obj: u64) -> String {
        self.dicts
            .sig(sig, obj)
            .map(str::to_string)
            .unwrap_or_else(|| sig.to_string())
    }

    fn show(&mut self, line: String) {
        self.outputs.write_text(&line);
        if !self.quiet {
            self.outbox.screen.push(line);
        }
    }

    fn send_record(&mut self, rec: RxRec, payload: &[u8]) {
        match self.encoder.encode_record(rec as u8, payload) {
            Ok(frame) => self.outbox.to_target.push(frame),
            Err(e) => warn!("Failed to encode {:?}: {}", rec, e),
        }
    }

    fn send_raw(&mut self, raw: &[u8]) {
        match self.encoder.encode(raw) {
            Ok(frame) => self.outbox.to_target.push(frame),
            Err(e) => warn!("Failed to encode relayed record: {}", e),
        }
    }

    fn apply(&mut self, directive: Directive) {
        debug!("Directive {:?}", directive);
        match directive {
            Directive::Exit => self.outbox.exit = true,
            Directive::Help => self.outbox.screen.extend(HELP.iter().map(|s| s.to_string())),
            Directive::ClearScreen => self.outbox.clear_screen = true,
            Directive::ResetTarget => self.send_record(RxRec::Reset, &[]),
            Directive::TargetInfo => self.send_record(RxRec::Info, &[]),
            Directive::Tick(rate) => self.send_record(RxRec::Tick, &[rate]),
            Directive::SaveDictionaries => self.save_dictionaries(),
            Directive::TextFile(sw) => self.switch_output(SinkKind::Text, sw),
            Directive::BinaryFile(sw) => self.switch_output(SinkKind::Binary, sw),
            Directive::MatlabFile(sw) => self.switch_output(SinkKind::Matlab, sw),
            Directive::SequenceFile(sw) => {
                let was_open = self.outputs.is_open(SinkKind::Sequence);
                self.switch_output(SinkKind::Sequence, sw);
                if !was_open && self.outputs.is_open(SinkKind::Sequence) {
                    self.seq.restart();
                    let lines = self.seq.take_lines();
                    self.outputs.write_seq(&lines);
                }
            }
            Directive::Quiet(sw) => {
                self.quiet = sw.apply(self.quiet);
                info!("Quiet mode {}", if self.quiet { "on" } else { "off" });
            }
        }
    }

    fn switch_output(&mut self, kind: SinkKind, sw: Switch) {
        if let Err(e) = self.outputs.switch(kind, sw) {
            warn!("Cannot open {:?} output in {}: {}", kind, self.outputs.dir().display(), e);
        }
    }

    fn dictionary_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.dict_path {
            return Some(path.clone());
        }
        self.target.map(|t| {
            self.outputs
                .dir()
                .join(format!("qspy{}.dic", t.build_stamp()))
        })
    }

    fn save_dictionaries(&mut self) {
        let Some(path) = self.dictionary_file() else {
            warn!("No target info yet, dictionaries not saved");
            return;
        };
        let result = File::create(&path).and_then(|file| {
            let mut w = BufWriter::new(file);
            self.dicts.write_all(&mut w, &self.cfg)?;
            w.flush()
        });
        match result {
            Ok(()) => {
                self.dict_config = Some(self.cfg);
                info!("Dictionaries saved to {}", path.display());
            }
            Err(e) => warn!("Failed to save dictionaries to {}: {}", path.display(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qs_proto::record::{put_str, put_uint};
    use qs_proto::{RecKind, WidthTable};

    fn frame(enc: &mut FrameEncoder, id: u8, payload: &[u8]) -> Vec<u8> {
        enc.encode_record(id, payload).unwrap()
    }

    fn obj_dict(key: u64, name: &str) -> Vec<u8> {
        let mut p = Vec::new();
        put_uint(&mut p, key, 4);
        put_str(&mut p, name);
        p
    }

    #[test]
    fn test_dictionary_then_render() {
        let mut session = Session::new(SessionOptions::default()).unwrap();
        let mut enc = FrameEncoder::new();
        let mut data = frame(&mut enc, RecKind::ObjDict.id(), &obj_dict(0x2000, "AO_Table"));

        let mut subscribe = Vec::new();
        put_uint(&mut subscribe, 100, 4);
        put_uint(&mut subscribe, 5, 2);
        put_uint(&mut subscribe, 0x2000, 4);
        data.extend(frame(&mut enc, RecKind::ActiveSubscribe.id(), &subscribe));
        session.on_link_data(&data);

        assert_eq!(session.dictionaries().obj(0x2000), Some("AO_Table"));
        let out = session.take_outbox();
        assert_eq!(out.screen.len(), 2);
        assert!(out.screen[1].starts_with("0000000100 AO-Subsc"));
        assert!(out.screen[1].ends_with("Obj=AO_Table"));
        assert_eq!(session.stats().frames, 2);
    }

    #[test]
    fn test_bad_checksum_counted() {
        let mut session = Session::new(SessionOptions::default()).unwrap();
        let mut enc = FrameEncoder::new();
        let mut data = frame(&mut enc, RecKind::ObjDict.id(), &obj_dict(1, "A"));
        data[3] ^= 0x01;
        session.on_link_data(&data);
        assert_eq!(session.stats().bad_frames, 1);
        assert!(session.take_outbox().screen.is_empty());
    }

    #[test]
    fn test_keyboard_directives() {
        let mut session = Session::new(SessionOptions::default()).unwrap();
        session.on_keyboard("rtu");
        let out = session.take_outbox();
        assert_eq!(out.to_target.len(), 3);
        // 第一帧: FLAG 之前是 seq=1, id=RESET
        assert_eq!(&out.to_target[0][..2], &[1, RxRec::Reset as u8]);
        assert_eq!(&out.to_target[2][..3], &[3, RxRec::Tick as u8, 1]);

        session.on_keyboard("h");
        assert_eq!(session.take_outbox().screen.len(), HELP.len());

        session.on_keyboard("q");
        assert!(session.is_quiet());
        session.on_keyboard("x");
        assert!(session.take_outbox().exit);
    }

    #[test]
    fn test_reconnect_resets_sequences() {
        let mut session = Session::new(SessionOptions::default()).unwrap();
        session.apply(Directive::TargetInfo);
        session.apply(Directive::TargetInfo);
        session.take_outbox();

        session.on_reconnect();
        session.apply(Directive::TargetInfo);
        let out = session.take_outbox();
        assert_eq!(out.to_target[0][0], 1);
    }

    #[test]
    fn test_target_info_adopts_config() {
        let mut session = Session::new(SessionOptions::default()).unwrap();
        let mut widths = WidthTable::default();
        widths.obj_ptr = 8;
        let info = TargetInfo {
            is_reset: true,
            config: SessionConfig {
                version: 730,
                widths,
            },
            max_active: 8,
            max_epool: 3,
            max_tick_rate: 2,
            build: [30, 15, 12, 16, 10, 26],
        };
        let mut enc = FrameEncoder::new();
        session.on_link_data(&frame(&mut enc, RecKind::TargetInfo.id(), &info.to_payload()));

        assert_eq!(session.config().widths.obj_ptr, 8);
        assert_eq!(session.config().version, 730);
        assert_eq!(session.target().map(|t| t.max_active), Some(8));
    }

    #[test]
    fn test_quiet_suppresses_screen() {
        let opts = SessionOptions {
            quiet: true,
            ..SessionOptions::default()
        };
        let mut session = Session::new(opts).unwrap();
        let mut enc = FrameEncoder::new();
        session.on_link_data(&frame(&mut enc, RecKind::ObjDict.id(), &obj_dict(1, "A")));
        assert!(session.take_outbox().screen.is_empty());

        session.apply(Directive::Quiet(Switch::Off));
        assert!(!session.is_quiet());
    }

    #[test]
    fn test_too_many_lanes_rejected() {
        let opts = SessionOptions {
            lanes: (0..11).map(|i| format!("AO_{}", i)).collect(),
            ..SessionOptions::default()
        };
        assert!(matches!(
            Session::new(opts),
            Err(SessionError::Seq(SeqError::TooManyLanes { .. }))
        ));
    }
}
