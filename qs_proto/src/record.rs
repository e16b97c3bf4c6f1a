//! QS 记录模型
//!
//! 每帧负载按记录 ID 查静态 schema 表解析。多字节整数一律小端，逐字节读取，
//! 无对齐要求；指针、信号、计数器等字段宽度由会话配置的宽度表决定。
//!
//! 特殊布局：
//! - `TargetInfo`: 固定布局，自带宽度描述
//! - 用户记录 (ID >= 100): 时间戳 + 若干自描述参数（格式字节 + 数据）

use std::borrow::Cow;

use bytes::Buf;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 第一个用户记录 ID
pub const USER_BASE: u8 = 100;

/// 最大记录 ID（7 位）
pub const MAX_REC_ID: u8 = 127;

/// 目标复位标志（TargetInfo 首字节）
pub const TARGET_RESET: u8 = 0xFF;

/// 默认协议版本
pub const DEFAULT_VERSION: u16 = 720;

/// 记录解析错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("record {rec}: truncated, need {need} bytes, {remaining} remaining")]
    Truncated {
        rec: u8,
        need: usize,
        remaining: usize,
    },
    #[error("invalid {field} width: {width}")]
    BadWidth { field: &'static str, width: u8 },
}

/// 字段宽度表（字节）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WidthTable {
    pub obj_ptr: u8,
    pub fun_ptr: u8,
    pub tstamp: u8,
    pub sig: u8,
    pub evt_size: u8,
    pub queue_ctr: u8,
    pub pool_ctr: u8,
    pub pool_blk: u8,
    pub tevt_ctr: u8,
}

impl Default for WidthTable {
    fn default() -> Self {
        Self {
            obj_ptr: 4,
            fun_ptr: 4,
            tstamp: 4,
            sig: 2,
            evt_size: 2,
            queue_ctr: 1,
            pool_ctr: 2,
            pool_blk: 2,
            tevt_ctr: 2,
        }
    }
}

impl WidthTable {
    fn entries(&self) -> [(&'static str, u8); 9] {
        [
            ("object pointer", self.obj_ptr),
            ("function pointer", self.fun_ptr),
            ("timestamp", self.tstamp),
            ("signal", self.sig),
            ("event size", self.evt_size),
            ("queue counter", self.queue_ctr),
            ("pool counter", self.pool_ctr),
            ("pool block", self.pool_blk),
            ("time event counter", self.tevt_ctr),
        ]
    }

    /// 每个宽度必须是 1/2/4/8
    pub fn validate(&self) -> Result<(), RecordError> {
        for (field, width) in self.entries() {
            if !matches!(width, 1 | 2 | 4 | 8) {
                return Err(RecordError::BadWidth { field, width });
            }
        }
        Ok(())
    }

    /// 字段类型对应的宽度（变长字段返回 None）
    pub fn width_of(&self, kind: FieldKind) -> Option<u8> {
        match kind {
            FieldKind::Time => Some(self.tstamp),
            FieldKind::Obj => Some(self.obj_ptr),
            FieldKind::Fun => Some(self.fun_ptr),
            FieldKind::Sig => Some(self.sig),
            FieldKind::EvtSize => Some(self.evt_size),
            FieldKind::QueueCtr => Some(self.queue_ctr),
            FieldKind::PoolCtr => Some(self.pool_ctr),
            FieldKind::PoolBlk => Some(self.pool_blk),
            FieldKind::TimeEvtCtr => Some(self.tevt_ctr),
            FieldKind::U8 => Some(1),
            FieldKind::U16 => Some(2),
            FieldKind::U32 => Some(4),
            FieldKind::PoolRef | FieldKind::Str | FieldKind::Mem => None,
        }
    }
}

/// 会话配置：协议版本 + 宽度表
///
/// 链路建立后不再逐字段修改，只会被目标上报的配置整体替换。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub version: u16,
    pub widths: WidthTable,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            version: DEFAULT_VERSION,
            widths: WidthTable::default(),
        }
    }
}

/// schema 字段类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Time,
    Obj,
    Fun,
    Sig,
    EvtSize,
    QueueCtr,
    PoolCtr,
    PoolBlk,
    TimeEvtCtr,
    U8,
    U16,
    U32,
    /// 事件池编号 + 引用计数 (u8, u8)
    PoolRef,
    /// u8 长度前缀的字符串
    Str,
    /// u8 长度前缀的二进制块
    Mem,
}

/// schema 中的一个字段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub kind: FieldKind,
    pub label: &'static str,
}

macro_rules! fs {
    ($kind:ident, $label:expr) => {
        FieldSpec {
            kind: $kind,
            label: $label,
        }
    };
}

use FieldKind::*;

const TIME: FieldSpec = fs!(Time, "");
const OBJ: FieldSpec = fs!(Obj, "Obj");
const SIG: FieldSpec = fs!(Sig, "Sig");
const STATE: FieldSpec = fs!(Fun, "State");
const SOURCE: FieldSpec = fs!(Fun, "Source");
const TARGET: FieldSpec = fs!(Fun, "Target");
const POOL_REF: FieldSpec = fs!(PoolRef, "");
const QUE: FieldSpec = fs!(Obj, "Que");
const SDR: FieldSpec = fs!(Obj, "Sdr");
const AO: FieldSpec = fs!(Obj, "AO");
const Q_FREE: FieldSpec = fs!(QueueCtr, "Free");
const Q_MIN: FieldSpec = fs!(QueueCtr, "Min");
const Q_MARGIN: FieldSpec = fs!(QueueCtr, "Margin");
const TE_CTR: FieldSpec = fs!(TimeEvtCtr, "Tim");
const TE_INT: FieldSpec = fs!(TimeEvtCtr, "Int");
const NAME: FieldSpec = fs!(Str, "Name");

/// 已知记录类型，判别值即记录 ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RecKind {
    Empty = 0,
    StateEntry = 1,
    StateExit = 2,
    StateInit = 3,
    InitTran = 4,
    InternTran = 5,
    Tran = 6,
    Ignored = 7,
    Dispatch = 8,
    Unhandled = 9,
    ActiveDefer = 10,
    ActiveRecall = 11,
    ActiveSubscribe = 12,
    ActiveUnsubscribe = 13,
    ActivePost = 14,
    ActivePostLifo = 15,
    ActiveGet = 16,
    ActiveGetLast = 17,
    ActiveRecallAttempt = 18,
    EqueuePost = 19,
    EqueuePostLifo = 20,
    EqueueGet = 21,
    EqueueGetLast = 22,
    NewAttempt = 23,
    MpoolGet = 24,
    MpoolPut = 25,
    Publish = 26,
    NewRef = 27,
    New = 28,
    GcAttempt = 29,
    Gc = 30,
    Tick = 31,
    TimeEvtArm = 32,
    TimeEvtAutoDisarm = 33,
    TimeEvtDisarmAttempt = 34,
    TimeEvtDisarm = 35,
    TimeEvtRearm = 36,
    TimeEvtPost = 37,
    DeleteRef = 38,
    CritEntry = 39,
    CritExit = 40,
    IsrEntry = 41,
    IsrExit = 42,
    IntDisable = 43,
    IntEnable = 44,
    ActivePostAttempt = 45,
    EqueuePostAttempt = 46,
    MpoolGetAttempt = 47,
    SchedPreempt = 48,
    SchedRestore = 49,
    SchedLock = 50,
    SchedUnlock = 51,
    SchedNext = 52,
    SchedIdle = 53,
    EnumDict = 54,
    TranHist = 55,
    TranDeepHist = 56,
    TranXp = 57,
    TestPaused = 58,
    TestProbeGet = 59,
    SigDict = 60,
    ObjDict = 61,
    FunDict = 62,
    UsrDict = 63,
    TargetInfo = 64,
    TargetDone = 65,
    RxStatus = 66,
    QueryData = 67,
    PeekData = 68,
    AssertFail = 69,
    QfRun = 70,
}

/// schema 表项
#[derive(Debug)]
pub struct RecInfo {
    pub kind: RecKind,
    /// 渲染行的描述字段
    pub desc: &'static str,
    pub fields: &'static [FieldSpec],
}

const fn rec(kind: RecKind, desc: &'static str, fields: &'static [FieldSpec]) -> RecInfo {
    RecInfo { kind, desc, fields }
}

/// 记录 ID -> schema，按 ID 顺序排列
static RECORD_TABLE: [RecInfo; 71] = [
    rec(RecKind::Empty, "", &[]),
    rec(RecKind::StateEntry, "St-Entry", &[OBJ, STATE]),
    rec(RecKind::StateExit, "St-Exit", &[OBJ, STATE]),
    rec(RecKind::StateInit, "St-Init", &[OBJ, SOURCE, TARGET]),
    rec(RecKind::InitTran, "Init===>", &[TIME, OBJ, STATE]),
    rec(RecKind::InternTran, "=>Intern", &[TIME, SIG, OBJ, STATE]),
    rec(RecKind::Tran, "===>Tran", &[TIME, SIG, OBJ, SOURCE, TARGET]),
    rec(RecKind::Ignored, "=>Ignore", &[TIME, SIG, OBJ, STATE]),
    rec(RecKind::Dispatch, "Disp===>", &[TIME, SIG, OBJ, STATE]),
    rec(RecKind::Unhandled, "=>Unhndl", &[SIG, OBJ, STATE]),
    rec(RecKind::ActiveDefer, "AO-Defer", &[TIME, OBJ, QUE, SIG, POOL_REF]),
    rec(RecKind::ActiveRecall, "AO-RCall", &[TIME, OBJ, QUE, SIG, POOL_REF]),
    rec(RecKind::ActiveSubscribe, "AO-Subsc", &[TIME, SIG, OBJ]),
    rec(RecKind::ActiveUnsubscribe, "AO-Unsub", &[TIME, SIG, OBJ]),
    rec(RecKind::ActivePost, "AO-Post", &[TIME, SDR, OBJ, SIG, POOL_REF, Q_FREE, Q_MIN]),
    rec(RecKind::ActivePostLifo, "AO-LIFO", &[TIME, OBJ, SIG, POOL_REF, Q_FREE, Q_MIN]),
    rec(RecKind::ActiveGet, "AO-Get", &[TIME, OBJ, SIG, POOL_REF, Q_FREE]),
    rec(RecKind::ActiveGetLast, "AO-GetL", &[TIME, OBJ, SIG, POOL_REF]),
    rec(RecKind::ActiveRecallAttempt, "AO-RCllA", &[TIME, OBJ, QUE]),
    rec(RecKind::EqueuePost, "EQ-Post", &[TIME, QUE, SIG, POOL_REF, Q_FREE, Q_MIN]),
    rec(RecKind::EqueuePostLifo, "EQ-LIFO", &[TIME, QUE, SIG, POOL_REF, Q_FREE, Q_MIN]),
    rec(RecKind::EqueueGet, "EQ-Get", &[TIME, QUE, SIG, POOL_REF, Q_FREE]),
    rec(RecKind::EqueueGetLast, "EQ-GetL", &[TIME, QUE, SIG, POOL_REF]),
    rec(RecKind::NewAttempt, "QF-NewA", &[TIME, fs!(EvtSize, "Size"), SIG]),
    rec(RecKind::MpoolGet, "MP-Get", &[TIME, fs!(Obj, "Pool"), fs!(PoolCtr, "Free"), fs!(PoolCtr, "Min")]),
    rec(RecKind::MpoolPut, "MP-Put", &[TIME, fs!(Obj, "Pool"), fs!(PoolCtr, "Free")]),
    rec(RecKind::Publish, "QF-Pub", &[TIME, SDR, SIG, POOL_REF]),
    rec(RecKind::NewRef, "QF-NewRf", &[TIME, SIG, POOL_REF]),
    rec(RecKind::New, "QF-New", &[TIME, fs!(EvtSize, "Size"), SIG]),
    rec(RecKind::GcAttempt, "QF-gcA", &[TIME, SIG, POOL_REF]),
    rec(RecKind::Gc, "QF-gc", &[TIME, SIG, POOL_REF]),
    rec(RecKind::Tick, "Tick", &[fs!(TimeEvtCtr, "Ctr"), fs!(U8, "Rate")]),
    rec(RecKind::TimeEvtArm, "TE-Arm", &[TIME, OBJ, AO, TE_CTR, TE_INT]),
    rec(RecKind::TimeEvtAutoDisarm, "TE-ADis", &[OBJ, AO]),
    rec(RecKind::TimeEvtDisarmAttempt, "TE-DisA", &[TIME, OBJ, AO]),
    rec(RecKind::TimeEvtDisarm, "TE-Dis", &[TIME, OBJ, AO, TE_CTR, TE_INT]),
    rec(RecKind::TimeEvtRearm, "TE-Rarm", &[TIME, OBJ, AO, TE_CTR, TE_INT, fs!(U8, "Was")]),
    rec(RecKind::TimeEvtPost, "TE-Post", &[TIME, OBJ, SIG, AO]),
    rec(RecKind::DeleteRef, "QF-DelRf", &[TIME, SIG, POOL_REF]),
    rec(RecKind::CritEntry, "QF-CrtE", &[TIME, fs!(U8, "Nest")]),
    rec(RecKind::CritExit, "QF-CrtX", &[TIME, fs!(U8, "Nest")]),
    rec(RecKind::IsrEntry, "QF-IsrE", &[TIME, fs!(U8, "Nest"), fs!(U8, "Pri")]),
    rec(RecKind::IsrExit, "QF-IsrX", &[TIME, fs!(U8, "Nest"), fs!(U8, "Pri")]),
    rec(RecKind::IntDisable, "QF-IntD", &[TIME, fs!(U8, "Lvl")]),
    rec(RecKind::IntEnable, "QF-IntE", &[TIME, fs!(U8, "Lvl")]),
    rec(RecKind::ActivePostAttempt, "AO-PostA", &[TIME, SDR, OBJ, SIG, POOL_REF, Q_FREE, Q_MARGIN]),
    rec(RecKind::EqueuePostAttempt, "EQ-PostA", &[TIME, QUE, SIG, POOL_REF, Q_FREE, Q_MARGIN]),
    rec(RecKind::MpoolGetAttempt, "MP-GetA", &[TIME, fs!(Obj, "Pool"), fs!(PoolCtr, "Free"), fs!(PoolCtr, "Margin")]),
    rec(RecKind::SchedPreempt, "Sch-Pre", &[TIME, fs!(U8, "Pri"), fs!(U8, "Prev")]),
    rec(RecKind::SchedRestore, "Sch-Rsto", &[TIME, fs!(U8, "Pri"), fs!(U8, "Prev")]),
    rec(RecKind::SchedLock, "Sch-Lock", &[TIME, fs!(U8, "Prev"), fs!(U8, "New")]),
    rec(RecKind::SchedUnlock, "Sch-Unlk", &[TIME, fs!(U8, "Prev"), fs!(U8, "New")]),
    rec(RecKind::SchedNext, "Sch-Next", &[TIME, fs!(U8, "Pri"), fs!(U8, "Prev")]),
    rec(RecKind::SchedIdle, "Sch-Idle", &[TIME, fs!(U8, "Prev")]),
    rec(RecKind::EnumDict, "EnumDic", &[fs!(U8, "Val"), fs!(U8, "Grp"), NAME]),
    rec(RecKind::TranHist, "=>Hist", &[OBJ, SOURCE, TARGET]),
    rec(RecKind::TranDeepHist, "=>DpHist", &[OBJ, SOURCE, TARGET]),
    rec(RecKind::TranXp, "=>XPoint", &[OBJ, SOURCE, TARGET]),
    rec(RecKind::TestPaused, "TstPause", &[]),
    rec(RecKind::TestProbeGet, "TstProbe", &[TIME, fs!(Fun, "Fun"), fs!(U32, "Data")]),
    rec(RecKind::SigDict, "Sig-Dict", &[SIG, OBJ, NAME]),
    rec(RecKind::ObjDict, "Obj-Dict", &[OBJ, NAME]),
    rec(RecKind::FunDict, "Fun-Dict", &[fs!(Fun, "Fun"), NAME]),
    rec(RecKind::UsrDict, "Usr-Dict", &[fs!(U8, "Rec"), NAME]),
    rec(RecKind::TargetInfo, "Trg-Info", &[]),
    rec(RecKind::TargetDone, "Trg-Done", &[TIME, fs!(U8, "Rec")]),
    rec(RecKind::RxStatus, "Trg-Ack", &[fs!(U8, "Rec")]),
    rec(RecKind::QueryData, "Query", &[TIME, fs!(U8, "Kind"), OBJ, fs!(Mem, "Data")]),
    rec(RecKind::PeekData, "Peek", &[TIME, fs!(U16, "Offs"), fs!(U8, "Size"), fs!(Mem, "Data")]),
    rec(RecKind::AssertFail, "=ASSERT=", &[TIME, fs!(U16, "Id"), fs!(Str, "Module")]),
    rec(RecKind::QfRun, "QF-RUN", &[]),
];

impl RecKind {
    pub fn from_id(id: u8) -> Option<Self> {
        RECORD_TABLE.get(id as usize).map(|info| info.kind)
    }

    pub fn id(self) -> u8 {
        self as u8
    }

    pub fn info(self) -> &'static RecInfo {
        &RECORD_TABLE[self as usize]
    }

    pub fn schema(self) -> &'static [FieldSpec] {
        self.info().fields
    }

    pub fn desc(self) -> &'static str {
        self.info().desc
    }

    /// 字典类记录（含目标信息），不作为普通跟踪文本转发
    pub fn is_dictionary(self) -> bool {
        matches!(
            self,
            RecKind::ObjDict
                | RecKind::FunDict
                | RecKind::SigDict
                | RecKind::UsrDict
                | RecKind::EnumDict
                | RecKind::TargetInfo
        )
    }
}

/// 解析出的字段值
#[derive(Debug, Clone, PartialEq)]
pub enum Value<'a> {
    Uint(u64),
    PoolRef { pool: u8, refs: u8 },
    Str(Cow<'a, str>),
    Mem(&'a [u8]),
}

impl Value<'_> {
    pub fn as_uint(&self) -> Option<u64> {
        match self {
            Value::Uint(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }
}

/// 用户记录参数格式（格式字节低 4 位）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UserFmt {
    I8Enum = 0,
    U8 = 1,
    I16 = 2,
    U16 = 3,
    I32 = 4,
    U32 = 5,
    F32 = 6,
    F64 = 7,
    Str = 8,
    Mem = 9,
    Sig = 10,
    Obj = 11,
    Fun = 12,
    I64 = 13,
    U64 = 14,
    Hex = 15,
}

impl From<u8> for UserFmt {
    fn from(v: u8) -> Self {
        match v & 0x0F {
            0 => UserFmt::I8Enum,
            1 => UserFmt::U8,
            2 => UserFmt::I16,
            3 => UserFmt::U16,
            4 => UserFmt::I32,
            5 => UserFmt::U32,
            6 => UserFmt::F32,
            7 => UserFmt::F64,
            8 => UserFmt::Str,
            9 => UserFmt::Mem,
            10 => UserFmt::Sig,
            11 => UserFmt::Obj,
            12 => UserFmt::Fun,
            13 => UserFmt::I64,
            14 => UserFmt::U64,
            _ => UserFmt::Hex,
        }
    }
}

/// 用户记录中的一个参数
#[derive(Debug, Clone, PartialEq)]
pub enum UserArg<'a> {
    Int(i64),
    Uint(u64),
    Hex(u32),
    F32(f32),
    F64(f64),
    Str(Cow<'a, str>),
    Mem(&'a [u8]),
    Sig { sig: u64, obj: u64 },
    Obj(u64),
    Fun(u64),
    Enum { group: u8, value: u8 },
}

impl UserArg<'_> {
    /// Matlab 输出用的数值
    pub fn numeric(&self) -> Option<f64> {
        match self {
            UserArg::Int(v) => Some(*v as f64),
            UserArg::Uint(v) => Some(*v as f64),
            UserArg::Hex(v) => Some(*v as f64),
            UserArg::F32(v) => Some(*v as f64),
            UserArg::F64(v) => Some(*v),
            UserArg::Enum { value, .. } => Some(*value as f64),
            _ => None,
        }
    }
}

/// 目标信息记录
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetInfo {
    pub is_reset: bool,
    pub config: SessionConfig,
    pub max_active: u8,
    pub max_epool: u8,
    pub max_tick_rate: u8,
    /// 编译时间: 秒、分、时、日、月、年(两位)
    pub build: [u8; 6],
}

/// TargetInfo 负载长度
pub const TARGET_INFO_SIZE: usize = 16;

impl TargetInfo {
    /// 编译时间戳 `YYMMDD_hhmmss`，用于字典文件名
    pub fn build_stamp(&self) -> String {
        let [sec, min, hour, day, month, year] = self.build;
        format!(
            "{:02}{:02}{:02}_{:02}{:02}{:02}",
            year, month, day, hour, min, sec
        )
    }

    /// 编码为 TargetInfo 负载（用于回放/测试目标）
    pub fn to_payload(&self) -> Vec<u8> {
        let w = &self.config.widths;
        let mut payload = Vec::with_capacity(TARGET_INFO_SIZE);
        payload.push(if self.is_reset { TARGET_RESET } else { 0 });
        payload.extend_from_slice(&self.config.version.to_le_bytes());
        payload.push(w.sig | (w.evt_size << 4));
        payload.push(w.queue_ctr | (w.tevt_ctr << 4));
        payload.push(w.pool_blk | (w.pool_ctr << 4));
        payload.push(w.obj_ptr | (w.fun_ptr << 4));
        payload.push(w.tstamp);
        payload.push(self.max_active);
        payload.push(self.max_epool | (self.max_tick_rate << 4));
        payload.extend_from_slice(&self.build);
        payload
    }

    fn parse(reader: &mut FieldReader<'_>) -> Result<Self, RecordError> {
        let is_reset = reader.u8()? == TARGET_RESET;
        let version = reader.u16()?;
        let b0 = reader.u8()?;
        let b1 = reader.u8()?;
        let b2 = reader.u8()?;
        let b3 = reader.u8()?;
        let tstamp = reader.u8()?;
        let max_active = reader.u8()?;
        let b6 = reader.u8()?;
        let mut build = [0u8; 6];
        for slot in build.iter_mut() {
            *slot = reader.u8()?;
        }

        let widths = WidthTable {
            obj_ptr: b3 & 0x0F,
            fun_ptr: b3 >> 4,
            tstamp,
            sig: b0 & 0x0F,
            evt_size: b0 >> 4,
            queue_ctr: b1 & 0x0F,
            pool_ctr: b2 >> 4,
            pool_blk: b2 & 0x0F,
            tevt_ctr: b1 >> 4,
        };
        widths.validate()?;

        Ok(Self {
            is_reset,
            config: SessionConfig { version, widths },
            max_active,
            max_epool: b6 & 0x0F,
            max_tick_rate: b6 >> 4,
            build,
        })
    }
}

/// 解析后的记录体
#[derive(Debug, Clone, PartialEq)]
pub enum Body<'a> {
    /// 与 `RecKind::schema()` 一一对应的字段
    Fields(Vec<Value<'a>>),
    TargetInfo(TargetInfo),
    User {
        tstamp: u64,
        args: Vec<UserArg<'a>>,
    },
    /// 未知记录，保留原始负载
    Raw(&'a [u8]),
}

/// 一条解析完成的记录，生命周期不超过一次分发
#[derive(Debug, Clone, PartialEq)]
pub struct Record<'a> {
    pub id: u8,
    pub kind: Option<RecKind>,
    pub body: Body<'a>,
}

impl<'a> Record<'a> {
    pub fn is_user(&self) -> bool {
        self.id >= USER_BASE && self.id <= MAX_REC_ID
    }

    pub fn fields(&self) -> &[Value<'a>] {
        match &self.body {
            Body::Fields(values) => values,
            _ => &[],
        }
    }

    /// 记录的时间戳（schema 含时间字段时）
    pub fn tstamp(&self) -> Option<u64> {
        match &self.body {
            Body::User { tstamp, .. } => Some(*tstamp),
            Body::Fields(values) => self.kind.and_then(|kind| {
                kind.schema()
                    .iter()
                    .position(|spec| spec.kind == FieldKind::Time)
                    .and_then(|i| values.get(i))
                    .and_then(Value::as_uint)
            }),
            _ => None,
        }
    }
}

/// 有边界检查的小端字段读取器
pub struct FieldReader<'a> {
    buf: &'a [u8],
    rec: u8,
}

impl<'a> FieldReader<'a> {
    pub fn new(rec: u8, buf: &'a [u8]) -> Self {
        Self { buf, rec }
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn need(&self, need: usize) -> Result<(), RecordError> {
        if self.buf.remaining() < need {
            return Err(RecordError::Truncated {
                rec: self.rec,
                need,
                remaining: self.buf.remaining(),
            });
        }
        Ok(())
    }

    /// 读取 `width` 字节的小端无符号整数 (width <= 8)
    pub fn uint(&mut self, width: u8) -> Result<u64, RecordError> {
        self.need(width as usize)?;
        Ok(self.buf.get_uint_le(width as usize))
    }

    pub fn u8(&mut self) -> Result<u8, RecordError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn u16(&mut self) -> Result<u16, RecordError> {
        self.need(2)?;
        Ok(self.buf.get_u16_le())
    }

    pub fn u32(&mut self) -> Result<u32, RecordError> {
        self.need(4)?;
        Ok(self.buf.get_u32_le())
    }

    pub fn u64(&mut self) -> Result<u64, RecordError> {
        self.need(8)?;
        Ok(self.buf.get_u64_le())
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8], RecordError> {
        self.need(len)?;
        let (head, rest) = self.buf.split_at(len);
        self.buf = rest;
        Ok(head)
    }

    /// u8 长度前缀的字符串
    pub fn str(&mut self) -> Result<Cow<'a, str>, RecordError> {
        let len = self.u8()? as usize;
        Ok(String::from_utf8_lossy(self.bytes(len)?))
    }

    /// u8 长度前缀的二进制块
    pub fn mem(&mut self) -> Result<&'a [u8], RecordError> {
        let len = self.u8()? as usize;
        self.bytes(len)
    }

    pub fn rest(&mut self) -> &'a [u8] {
        let rest = self.buf;
        self.buf = &[];
        rest
    }
}

fn parse_field<'a>(
    reader: &mut FieldReader<'a>,
    kind: FieldKind,
    widths: &WidthTable,
) -> Result<Value<'a>, RecordError> {
    match kind {
        FieldKind::PoolRef => {
            let pool = reader.u8()?;
            let refs = reader.u8()?;
            Ok(Value::PoolRef { pool, refs })
        }
        FieldKind::Str => Ok(Value::Str(reader.str()?)),
        FieldKind::Mem => Ok(Value::Mem(reader.mem()?)),
        fixed => {
            // 其余字段都是定宽整数
            let width = widths.width_of(fixed).unwrap_or(1);
            Ok(Value::Uint(reader.uint(width)?))
        }
    }
}

fn parse_user_arg<'a>(
    reader: &mut FieldReader<'a>,
    fmt: u8,
    widths: &WidthTable,
) -> Result<UserArg<'a>, RecordError> {
    let arg = match UserFmt::from(fmt) {
        UserFmt::I8Enum => {
            let value = reader.u8()?;
            if fmt & 0x80 != 0 {
                UserArg::Enum {
                    group: (fmt >> 4) & 0x07,
                    value,
                }
            } else {
                UserArg::Int(value as i8 as i64)
            }
        }
        UserFmt::U8 => UserArg::Uint(reader.u8()? as u64),
        UserFmt::I16 => UserArg::Int(reader.u16()? as i16 as i64),
        UserFmt::U16 => UserArg::Uint(reader.u16()? as u64),
        UserFmt::I32 => UserArg::Int(reader.u32()? as i32 as i64),
        UserFmt::U32 => UserArg::Uint(reader.u32()? as u64),
        UserFmt::F32 => UserArg::F32(f32::from_bits(reader.u32()?)),
        UserFmt::F64 => UserArg::F64(f64::from_bits(reader.u64()?)),
        UserFmt::Str => UserArg::Str(reader.str()?),
        UserFmt::Mem => UserArg::Mem(reader.mem()?),
        UserFmt::Sig => {
            let sig = reader.uint(widths.sig)?;
            let obj = reader.uint(widths.obj_ptr)?;
            UserArg::Sig { sig, obj }
        }
        UserFmt::Obj => UserArg::Obj(reader.uint(widths.obj_ptr)?),
        UserFmt::Fun => UserArg::Fun(reader.uint(widths.fun_ptr)?),
        UserFmt::I64 => UserArg::Int(reader.u64()? as i64),
        UserFmt::U64 => UserArg::Uint(reader.u64()?),
        UserFmt::Hex => UserArg::Hex(reader.u32()?),
    };
    Ok(arg)
}

/// 按记录 ID 解析负载
///
/// 所有字段都解析成功才返回；任何越界都使整条记录失败，调用方据此保证原子性。
pub fn parse_record<'a>(
    id: u8,
    payload: &'a [u8],
    cfg: &SessionConfig,
) -> Result<Record<'a>, RecordError> {
    let mut reader = FieldReader::new(id, payload);

    if id >= USER_BASE && id <= MAX_REC_ID {
        let tstamp = reader.uint(cfg.widths.tstamp)?;
        let mut args = Vec::new();
        while reader.remaining() > 0 {
            let fmt = reader.u8()?;
            args.push(parse_user_arg(&mut reader, fmt, &cfg.widths)?);
        }
        return Ok(Record {
            id,
            kind: None,
            body: Body::User { tstamp, args },
        });
    }

    let Some(kind) = RecKind::from_id(id) else {
        return Ok(Record {
            id,
            kind: None,
            body: Body::Raw(reader.rest()),
        });
    };

    let body = if kind == RecKind::TargetInfo {
        Body::TargetInfo(TargetInfo::parse(&mut reader)?)
    } else {
        let schema = kind.schema();
        let mut values = Vec::with_capacity(schema.len());
        for spec in schema {
            values.push(parse_field(&mut reader, spec.kind, &cfg.widths)?);
        }
        Body::Fields(values)
    };

    Ok(Record {
        id,
        kind: Some(kind),
        body,
    })
}

/// 按宽度追加小端整数（编码发往目标的记录时使用）
pub fn put_uint(out: &mut Vec<u8>, value: u64, width: u8) {
    out.extend_from_slice(&value.to_le_bytes()[..width.min(8) as usize]);
}

/// 追加 u8 长度前缀的字符串（超过 255 字节截断）
pub fn put_str(out: &mut Vec<u8>, s: &str) {
    let bytes = &s.as_bytes()[..s.len().min(u8::MAX as usize)];
    out.push(bytes.len() as u8);
    out.extend_from_slice(bytes);
}
