//! 记录渲染与分类
//!
//! 文本行布局（列偏移固定，供外部着色工具使用）：
//! ```text
//! 0000001234 AO-Post   Sdr=AO_Philo[0],Obj=AO_Table,Sig=HUNGRY_SIG,...
//! ^0         ^11       ^21
//! ```
//! 没有时间戳的记录时间戳列留空。

use qs_proto::record::FieldKind;
use qs_proto::{Body, RecKind, Record, UserArg, Value, WidthTable, USER_BASE};

use crate::dict::Dictionaries;

pub const TS_COL: usize = 0;
pub const DESC_COL: usize = 11;
pub const TEXT_COL: usize = 21;
const TS_WIDTH: usize = 10;
const DESC_WIDTH: usize = 9;

/// 组装一行文本
pub fn format_line(ts: Option<u64>, desc: &str, text: &str) -> String {
    let line = match ts {
        Some(ts) => format!("{:0tw$} {:<dw$.dw$} {}", ts, desc, text, tw = TS_WIDTH, dw = DESC_WIDTH),
        None => format!("{:tw$} {:<dw$.dw$} {}", "", desc, text, tw = TS_WIDTH, dw = DESC_WIDTH),
    };
    line.trim_end().to_string()
}

fn hex(v: u64, width: u8) -> String {
    format!("0x{:0w$X}", v, w = width as usize * 2)
}

/// 名字解析上下文
struct Names<'a> {
    dicts: Option<&'a Dictionaries>,
    widths: &'a WidthTable,
}

impl Names<'_> {
    fn obj(&self, key: u64) -> String {
        self.dicts
            .and_then(|d| d.obj(key))
            .map(str::to_string)
            .unwrap_or_else(|| hex(key, self.widths.obj_ptr))
    }

    fn fun(&self, key: u64) -> String {
        self.dicts
            .and_then(|d| d.fun(key))
            .map(str::to_string)
            .unwrap_or_else(|| hex(key, self.widths.fun_ptr))
    }

    fn sig(&self, sig: u64, obj: u64) -> String {
        self.dicts
            .and_then(|d| d.sig(sig, obj))
            .map(str::to_string)
            .unwrap_or_else(|| sig.to_string())
    }
}

/// 信号名的对象上下文: 最近的前一个对象字段，否则后面第一个，否则 0
fn sig_context(schema: &[qs_proto::FieldSpec], values: &[Value<'_>], at: usize) -> u64 {
    let is_obj = |i: &usize| schema[*i].kind == FieldKind::Obj;
    (0..at)
        .rev()
        .find(is_obj)
        .or_else(|| (at + 1..schema.len()).find(is_obj))
        .and_then(|i| values.get(i))
        .and_then(Value::as_uint)
        .unwrap_or(0)
}

fn render_fields(kind: RecKind, values: &[Value<'_>], names: &Names<'_>) -> String {
    let schema = kind.schema();
    let mut parts = Vec::with_capacity(schema.len());

    for (i, (spec, value)) in schema.iter().zip(values).enumerate() {
        let text = match (spec.kind, value) {
            (FieldKind::Time, _) => continue,
            (FieldKind::Obj, Value::Uint(v)) => names.obj(*v),
            (FieldKind::Fun, Value::Uint(v)) => names.fun(*v),
            (FieldKind::Sig, Value::Uint(v)) => names.sig(*v, sig_context(schema, values, i)),
            (FieldKind::U32, Value::Uint(v)) => hex(*v, 4),
            (_, Value::Uint(v)) => v.to_string(),
            (_, Value::PoolRef { pool, refs }) => {
                parts.push(format!("Pool={}", pool));
                format!("Ref={}", refs)
            }
            (_, Value::Str(s)) => s.to_string(),
            (_, Value::Mem(bytes)) => hex_dump(bytes),
        };
        if spec.label.is_empty() {
            parts.push(text);
        } else {
            parts.push(format!("{}={}", spec.label, text));
        }
    }
    parts.join(",")
}

fn hex_dump(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

fn render_user_arg(arg: &UserArg<'_>, dicts: &Dictionaries, names: &Names<'_>) -> String {
    match arg {
        UserArg::Int(v) => v.to_string(),
        UserArg::Uint(v) => v.to_string(),
        UserArg::Hex(v) => format!("0x{:08X}", v),
        UserArg::F32(v) => format!("{:e}", v),
        UserArg::F64(v) => format!("{:e}", v),
        UserArg::Str(s) => s.to_string(),
        UserArg::Mem(bytes) => hex_dump(bytes),
        UserArg::Sig { sig, obj } => names.sig(*sig, *obj),
        UserArg::Obj(v) => names.obj(*v),
        UserArg::Fun(v) => names.fun(*v),
        UserArg::Enum { group, value } => dicts
            .enum_name(*group, *value)
            .map(str::to_string)
            .unwrap_or_else(|| value.to_string()),
    }
}

/// 用户记录的描述列: 字典名或 `USER+nnn`
fn user_desc(id: u8, dicts: &Dictionaries) -> String {
    dicts
        .usr(id)
        .map(str::to_string)
        .unwrap_or_else(|| format!("USER+{:03}", id - USER_BASE))
}

/// 渲染一条记录为文本行
///
/// 字典类记录显示原始键值，不做名字替换。
pub fn render(rec: &Record<'_>, dicts: &Dictionaries, widths: &WidthTable) -> String {
    let resolve = !rec.kind.is_some_and(RecKind::is_dictionary);
    let names = Names {
        dicts: resolve.then_some(dicts),
        widths,
    };

    match (&rec.body, rec.kind) {
        (Body::Fields(values), Some(kind)) => {
            format_line(rec.tstamp(), kind.desc(), &render_fields(kind, values, &names))
        }
        (Body::TargetInfo(info), _) => {
            let text = format!(
                "QP-Ver={},Build={},Reset={},MaxActive={}",
                info.config.version,
                info.build_stamp(),
                info.is_reset,
                info.max_active
            );
            format_line(None, RecKind::TargetInfo.desc(), &text)
        }
        (Body::User { tstamp, args }, _) => {
            let text = args
                .iter()
                .map(|a| render_user_arg(a, dicts, &names))
                .collect::<Vec<_>>()
                .join(" ");
            format_line(Some(*tstamp), &user_desc(rec.id, dicts), &text)
        }
        (Body::Raw(bytes), _) => format_line(None, &format!("Rec{}", rec.id), &hex_dump(bytes)),
        (Body::Fields(_), None) => format_line(None, &format!("Rec{}", rec.id), ""),
    }
}

/// Matlab 行: `时间戳 记录ID 数值...`，没有数值参数时返回 None
pub fn matlab_row(rec: &Record<'_>) -> Option<String> {
    let Body::User { tstamp, args } = &rec.body else {
        return None;
    };
    let nums: Vec<String> = args
        .iter()
        .filter_map(UserArg::numeric)
        .map(|v| v.to_string())
        .collect();
    if nums.is_empty() {
        return None;
    }
    Some(format!("{} {} {}", tstamp, rec.id, nums.join(" ")))
}

/// 驱动时序图的事件（键值尚未解析为泳道）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqEvent {
    Post {
        ts: Option<u64>,
        src: u64,
        dst: u64,
        sig: u64,
        attempt: bool,
    },
    Publish {
        ts: Option<u64>,
        src: u64,
        sig: u64,
    },
    Transition {
        ts: Option<u64>,
        obj: u64,
        state: u64,
    },
    Dispatch {
        ts: Option<u64>,
        obj: u64,
        sig: u64,
    },
    /// 状态机忽略了事件
    Ignored {
        ts: Option<u64>,
        obj: u64,
        sig: u64,
    },
    Tick {
        rate: u8,
        counter: u64,
    },
}

fn uint(values: &[Value<'_>], i: usize) -> u64 {
    values.get(i).and_then(Value::as_uint).unwrap_or(0)
}

/// 从记录中提取时序图事件
pub fn seq_event(rec: &Record<'_>) -> Option<SeqEvent> {
    let kind = rec.kind?;
    let v = rec.fields();
    let ts = rec.tstamp();
    let ev = match kind {
        RecKind::ActivePost | RecKind::ActivePostAttempt => SeqEvent::Post {
            ts,
            src: uint(v, 1),
            dst: uint(v, 2),
            sig: uint(v, 3),
            attempt: kind == RecKind::ActivePostAttempt,
        },
        RecKind::ActivePostLifo => SeqEvent::Post {
            ts,
            src: uint(v, 1),
            dst: uint(v, 1),
            sig: uint(v, 2),
            attempt: false,
        },
        RecKind::Publish => SeqEvent::Publish {
            ts,
            src: uint(v, 1),
            sig: uint(v, 2),
        },
        RecKind::ActiveGet | RecKind::ActiveGetLast => SeqEvent::Dispatch {
            ts,
            obj: uint(v, 1),
            sig: uint(v, 2),
        },
        RecKind::Ignored => SeqEvent::Ignored {
            ts,
            obj: uint(v, 2),
            sig: uint(v, 1),
        },
        RecKind::Tran => SeqEvent::Transition {
            ts,
            obj: uint(v, 2),
            state: uint(v, 4),
        },
        RecKind::InitTran => SeqEvent::Transition {
            ts,
            obj: uint(v, 1),
            state: uint(v, 2),
        },
        RecKind::TranHist | RecKind::TranDeepHist | RecKind::TranXp => SeqEvent::Transition {
            ts: None,
            obj: uint(v, 0),
            state: uint(v, 2),
        },
        RecKind::Tick => SeqEvent::Tick {
            rate: uint(v, 1) as u8,
            counter: uint(v, 0),
        },
        _ => return None,
    };
    Some(ev)
}
