//! QS 软件跟踪协议库
//!
//! 目标端通过字节链路发送紧凑的二进制跟踪记录，本库负责帧的编解码、
//! 按宽度表解析记录，以及前端中继包的格式。
//!
//! # 示例
//!
//! ```rust
//! use qs_proto::{parse_record, FrameDecoder, FrameEncoder, SessionConfig};
//!
//! let mut enc = FrameEncoder::new();
//! let wire = enc.encode_record(62, &[0x00, 0x10, 0x00, 0x20, 4, b'm', b'a', b'i', b'n']).unwrap();
//!
//! let cfg = SessionConfig::default();
//! let mut dec = FrameDecoder::new();
//! dec.feed(&wire, |frame| {
//!     let frame = frame.unwrap();
//!     let rec = parse_record(frame.rec_id, frame.payload, &cfg).unwrap();
//!     println!("{:?}", rec);
//! });
//! ```

pub mod protocol;
pub mod record;
pub mod relay;

pub use protocol::{
    Frame, FrameDecoder, FrameEncoder, FrameError, ProtocolError, RxRec, DEFAULT_MAX_FRAME,
    DEFAULT_TCP_PORT, ESC, ESC_XOR, FLAG,
};
pub use record::{
    parse_record, Body, FieldKind, FieldSpec, RecKind, Record, RecordError, SessionConfig,
    TargetInfo, UserArg, Value, WidthTable, MAX_REC_ID, USER_BASE,
};
pub use relay::{
    BeCmd, Packet, PacketKind, RelayError, CHANNEL_ALL, CHANNEL_BINARY, CHANNEL_TEXT,
    DEFAULT_UDP_PORT,
};
