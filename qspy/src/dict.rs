//! 符号字典
//!
//! 四张独立的定长表：对象、函数、信号（按 (信号, 所属对象) 复合键）、用户记录/枚举。
//! 表满后不再插入，也不淘汰旧项。
//!
//! 文件格式（纯文本）：
//! ```text
//! -v720
//! -T4
//! -O4
//! ...
//!
//! Obj-Dic=4
//! 0x20000010 AO_Table
//! ***
//! Fun-Dic=4
//! ***
//! Usr-Dic=4
//! ***
//! Sig-Dic=2
//! 0x0005 0x20000010 EAT_SIG
//! ***
//! ```

use std::collections::HashMap;
use std::hash::Hash;
use std::io::{self, BufRead, Write};

use qs_proto::{SessionConfig, WidthTable};
use thiserror::Error;
use tracing::{debug, warn};

pub const OBJ_CAPACITY: usize = 512;
pub const FUN_CAPACITY: usize = 512;
pub const SIG_CAPACITY: usize = 512;
pub const USR_CAPACITY: usize = 256;

/// 名字最大长度（字节）
pub const MAX_NAME_LEN: usize = 64;

/// 枚举项在用户表中的键前缀
pub const ENUM_KEY_BASE: u64 = 0x1_0000;

/// 用户表键的宽度（字节）
const USR_KEY_WIDTH: usize = 4;

const STANZA_END: &str = "***";

/// 字典错误
#[derive(Error, Debug)]
pub enum DictError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("line {line}: {msg}")]
    Parse { line: usize, msg: String },
    #[error("dictionary configuration {file:?} does not match target configuration {live:?}")]
    ConfigMismatch {
        file: SessionConfig,
        live: SessionConfig,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Inserted,
    Replaced,
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DictKind {
    Obj,
    Fun,
    Sig,
    Usr,
}

/// 有界键值表，保留插入顺序用于序列化
#[derive(Debug, Clone)]
pub struct Table<K> {
    name: &'static str,
    capacity: usize,
    entries: Vec<(K, String)>,
    index: HashMap<K, usize>,
}

impl<K: PartialEq> PartialEq for Table<K> {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

fn clean_name(name: &str) -> String {
    let name = name.trim();
    let mut end = name.len().min(MAX_NAME_LEN);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name[..end]
        .chars()
        .map(|c| if c.is_control() { '_' } else { c })
        .collect()
}

impl<K: Copy + Eq + Hash> Table<K> {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            capacity,
            entries: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn put(&mut self, key: K, name: &str) -> PutOutcome {
        let name = clean_name(name);
        if let Some(&i) = self.index.get(&key) {
            self.entries[i].1 = name;
            return PutOutcome::Replaced;
        }
        if self.entries.len() >= self.capacity {
            warn!(
                "{} dictionary full ({} entries), dropping '{}'",
                self.name, self.capacity, name
            );
            return PutOutcome::Full;
        }
        self.index.insert(key, self.entries.len());
        self.entries.push((key, name));
        PutOutcome::Inserted
    }

    pub fn find(&self, key: &K) -> Option<&str> {
        self.index
            .get(key)
            .and_then(|&i| self.entries.get(i))
            .map(|(_, name)| name.as_str())
    }

    /// 按名字反查键
    pub fn find_key(&self, name: &str) -> Option<K> {
        self.entries
            .iter()
            .find(|(_, n)| n == name)
            .map(|(key, _)| *key)
    }

    pub fn reset(&mut self) {
        self.entries.clear();
        self.index.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (K, &str)> {
        self.entries.iter().map(|(key, name)| (*key, name.as_str()))
    }
}

/// 四张字典
#[derive(Debug, Clone, PartialEq)]
pub struct Dictionaries {
    obj: Table<u64>,
    fun: Table<u64>,
    sig: Table<(u64, u64)>,
    usr: Table<u64>,
}

impl Default for Dictionaries {
    fn default() -> Self {
        Self::new()
    }
}

fn enum_key(group: u8, value: u8) -> u64 {
    ENUM_KEY_BASE | ((group as u64) << 8) | value as u64
}

fn hex(key: u64, width: usize) -> String {
    format!("0x{:0w$X}", key, w = width * 2)
}

impl Dictionaries {
    pub fn new() -> Self {
        Self {
            obj: Table::new("Object", OBJ_CAPACITY),
            fun: Table::new("Function", FUN_CAPACITY),
            sig: Table::new("Signal", SIG_CAPACITY),
            usr: Table::new("User", USR_CAPACITY),
        }
    }

    pub fn put_obj(&mut self, key: u64, name: &str) -> PutOutcome {
        self.obj.put(key, name)
    }

    pub fn put_fun(&mut self, key: u64, name: &str) -> PutOutcome {
        self.fun.put(key, name)
    }

    pub fn put_sig(&mut self, sig: u64, obj: u64, name: &str) -> PutOutcome {
        self.sig.put((sig, obj), name)
    }

    pub fn put_usr(&mut self, rec: u8, name: &str) -> PutOutcome {
        self.usr.put(rec as u64, name)
    }

    pub fn put_enum(&mut self, group: u8, value: u8, name: &str) -> PutOutcome {
        self.usr.put(enum_key(group, value), name)
    }

    pub fn obj(&self, key: u64) -> Option<&str> {
        self.obj.find(&key)
    }

    pub fn fun(&self, key: u64) -> Option<&str> {
        self.fun.find(&key)
    }

    /// 信号名，找不到对象专属的名字时退回到全局 (sig, 0)
    pub fn sig(&self, sig: u64, obj: u64) -> Option<&str> {
        self.sig
            .find(&(sig, obj))
            .or_else(|| self.sig.find(&(sig, 0)))
    }

    pub fn usr(&self, rec: u8) -> Option<&str> {
        self.usr.find(&(rec as u64))
    }

    pub fn enum_name(&self, group: u8, value: u8) -> Option<&str> {
        self.usr.find(&enum_key(group, value))
    }

    pub fn find_obj(&self, name: &str) -> Option<u64> {
        self.obj.find_key(name)
    }

    pub fn find_fun(&self, name: &str) -> Option<u64> {
        self.fun.find_key(name)
    }

    /// 返回 (信号, 所属对象)
    pub fn find_sig(&self, name: &str) -> Option<(u64, u64)> {
        self.sig.find_key(name)
    }

    /// 只查找用户记录（不含枚举项）
    pub fn find_usr(&self, name: &str) -> Option<u8> {
        self.usr
            .iter()
            .find(|(key, n)| *key < 0x100 && *n == name)
            .map(|(key, _)| key as u8)
    }

    pub fn objects(&self) -> impl Iterator<Item = (u64, &str)> {
        self.obj.iter()
    }

    pub fn len(&self, kind: DictKind) -> usize {
        match kind {
            DictKind::Obj => self.obj.len(),
            DictKind::Fun => self.fun.len(),
            DictKind::Sig => self.sig.len(),
            DictKind::Usr => self.usr.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.obj.is_empty() && self.fun.is_empty() && self.sig.is_empty() && self.usr.is_empty()
    }

    pub fn reset(&mut self, kind: DictKind) {
        match kind {
            DictKind::Obj => self.obj.reset(),
            DictKind::Fun => self.fun.reset(),
            DictKind::Sig => self.sig.reset(),
            DictKind::Usr => self.usr.reset(),
        }
    }

    pub fn reset_all(&mut self) {
        self.obj.reset();
        self.fun.reset();
        self.sig.reset();
        self.usr.reset();
    }

    /// 按文件格式写出全部字典
    pub fn write_all<W: Write>(&self, w: &mut W, cfg: &SessionConfig) -> io::Result<()> {
        let widths = &cfg.widths;
        writeln!(w, "-v{}", cfg.version)?;
        for (opt, width) in width_options(widths) {
            writeln!(w, "-{}{}", opt, width)?;
        }
        writeln!(w)?;

        let obj_w = widths.obj_ptr as usize;
        let fun_w = widths.fun_ptr as usize;
        let sig_w = widths.sig as usize;

        writeln!(w, "Obj-Dic={}", obj_w)?;
        for (key, name) in self.obj.iter() {
            writeln!(w, "{} {}", hex(key, obj_w), name)?;
        }
        writeln!(w, "{}", STANZA_END)?;

        writeln!(w, "Fun-Dic={}", fun_w)?;
        for (key, name) in self.fun.iter() {
            writeln!(w, "{} {}", hex(key, fun_w), name)?;
        }
        writeln!(w, "{}", STANZA_END)?;

        writeln!(w, "Usr-Dic={}", USR_KEY_WIDTH)?;
        for (key, name) in self.usr.iter() {
            writeln!(w, "{} {}", hex(key, USR_KEY_WIDTH), name)?;
        }
        writeln!(w, "{}", STANZA_END)?;

        writeln!(w, "Sig-Dic={}", sig_w)?;
        for ((sig, obj), name) in self.sig.iter() {
            writeln!(w, "{} {} {}", hex(sig, sig_w), hex(obj, obj_w), name)?;
        }
        writeln!(w, "{}", STANZA_END)?;
        Ok(())
    }

    /// 读取字典文件
    ///
    /// 先解析到临时表，全部成功后整体替换。`live` 为当前目标上报的配置，
    /// 与文件中的配置不一致时清空全部字典并返回 `ConfigMismatch`。
    pub fn read_all<R: BufRead>(
        &mut self,
        reader: R,
        live: Option<&SessionConfig>,
    ) -> Result<SessionConfig, DictError> {
        let (loaded, file_cfg) = parse_file(reader)?;

        if let Some(live) = live {
            if *live != file_cfg {
                self.reset_all();
                return Err(DictError::ConfigMismatch {
                    file: file_cfg,
                    live: *live,
                });
            }
        }

        debug!(
            "Loaded dictionaries: {} objects, {} functions, {} signals, {} user",
            loaded.obj.len(),
            loaded.fun.len(),
            loaded.sig.len(),
            loaded.usr.len()
        );
        *self = loaded;
        Ok(file_cfg)
    }
}

fn width_options(w: &WidthTable) -> [(char, u8); 9] {
    [
        ('T', w.tstamp),
        ('O', w.obj_ptr),
        ('F', w.fun_ptr),
        ('S', w.sig),
        ('E', w.evt_size),
        ('Q', w.queue_ctr),
        ('P', w.pool_ctr),
        ('B', w.pool_blk),
        ('C', w.tevt_ctr),
    ]
}

fn parse_error(line: usize, msg: impl Into<String>) -> DictError {
    DictError::Parse {
        line,
        msg: msg.into(),
    }
}

fn parse_hex(s: &str, line: usize) -> Result<u64, DictError> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .ok_or_else(|| parse_error(line, format!("expected hex key, got '{}'", s)))?;
    u64::from_str_radix(digits, 16).map_err(|e| parse_error(line, format!("bad key '{}': {}", s, e)))
}

fn parse_file<R: BufRead>(reader: R) -> Result<(Dictionaries, SessionConfig), DictError> {
    let mut lines = reader.lines().enumerate().map(|(i, l)| (i + 1, l));
    let mut cfg = SessionConfig::default();

    // 配置前导，空行结束
    loop {
        let Some((no, line)) = lines.next() else {
            return Err(parse_error(0, "unexpected end of file in configuration"));
        };
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            break;
        }
        let mut chars = line.chars();
        let (Some('-'), Some(opt)) = (chars.next(), chars.next()) else {
            return Err(parse_error(no, format!("bad configuration line '{}'", line)));
        };
        let value = chars.as_str();
        if opt == 'v' {
            cfg.version = value
                .parse()
                .map_err(|_| parse_error(no, format!("bad version '{}'", value)))?;
            continue;
        }
        let width: u8 = value
            .parse()
            .map_err(|_| parse_error(no, format!("bad width '{}'", value)))?;
        let w = &mut cfg.widths;
        match opt {
            'T' => w.tstamp = width,
            'O' => w.obj_ptr = width,
            'F' => w.fun_ptr = width,
            'S' => w.sig = width,
            'E' => w.evt_size = width,
            'Q' => w.queue_ctr = width,
            'P' => w.pool_ctr = width,
            'B' => w.pool_blk = width,
            'C' => w.tevt_ctr = width,
            other => return Err(parse_error(no, format!("unknown option '-{}'", other))),
        }
    }
    cfg.widths
        .validate()
        .map_err(|e| parse_error(0, e.to_string()))?;

    let mut dicts = Dictionaries::new();
    let mut current: Option<DictKind> = None;

    for (no, line) in lines {
        let line = line?;
        let line = line.trim();

        let Some(kind) = current else {
            if line.is_empty() {
                continue;
            }
            let (header, width) = line
                .split_once('=')
                .ok_or_else(|| parse_error(no, format!("expected stanza header, got '{}'", line)))?;
            width
                .parse::<u8>()
                .map_err(|_| parse_error(no, format!("bad key width '{}'", width)))?;
            current = Some(match header {
                "Obj-Dic" => DictKind::Obj,
                "Fun-Dic" => DictKind::Fun,
                "Usr-Dic" => DictKind::Usr,
                "Sig-Dic" => DictKind::Sig,
                other => return Err(parse_error(no, format!("unknown stanza '{}'", other))),
            });
            continue;
        };

        if line == STANZA_END {
            current = None;
            continue;
        }

        // 名字为空时行尾的空格已被裁掉，只剩键
        let (key, rest) = line.split_once(' ').unwrap_or((line, ""));
        let key = parse_hex(key, no)?;
        match kind {
            DictKind::Obj => dicts.put_obj(key, rest),
            DictKind::Fun => dicts.put_fun(key, rest),
            DictKind::Usr => dicts.usr.put(key, rest),
            DictKind::Sig => {
                if rest.is_empty() {
                    return Err(parse_error(no, format!("bad signal entry '{}'", line)));
                }
                let (obj, name) = rest.split_once(' ').unwrap_or((rest, ""));
                dicts.put_sig(key, parse_hex(obj, no)?, name)
            }
        };
    }

    if current.is_some() {
        return Err(parse_error(0, "unterminated dictionary stanza"));
    }
    Ok((dicts, cfg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample() -> Dictionaries {
        let mut d = Dictionaries::new();
        d.put_obj(0x2000_0010, "AO_Table");
        d.put_obj(0x2000_0020, "AO_Philo[0]");
        d.put_fun(0x0800_1234, "Table_serving");
        d.put_sig(4, 0, "TIMEOUT_SIG");
        d.put_sig(5, 0x2000_0010, "HUNGRY_SIG");
        d.put_usr(100, "PHILO_STAT");
        d.put_enum(2, 3, "COLOR_RED");
        d
    }

    #[test]
    fn test_put_find_replace() {
        let mut d = sample();
        assert_eq!(d.obj(0x2000_0010), Some("AO_Table"));
        assert_eq!(d.put_obj(0x2000_0010, "AO_Table2"), PutOutcome::Replaced);
        assert_eq!(d.obj(0x2000_0010), Some("AO_Table2"));
        assert_eq!(d.len(DictKind::Obj), 2);
        assert_eq!(d.find_obj("AO_Philo[0]"), Some(0x2000_0020));
        assert_eq!(d.usr(100), Some("PHILO_STAT"));
        assert_eq!(d.enum_name(2, 3), Some("COLOR_RED"));
        assert_eq!(d.find_usr("PHILO_STAT"), Some(100));
        assert_eq!(d.find_usr("COLOR_RED"), None);
    }

    #[test]
    fn test_signal_fallback() {
        let d = sample();
        assert_eq!(d.sig(5, 0x2000_0010), Some("HUNGRY_SIG"));
        assert_eq!(d.sig(5, 0x2000_0020), None);
        // 全局信号对任何对象可见
        assert_eq!(d.sig(4, 0x2000_0020), Some("TIMEOUT_SIG"));
        assert_eq!(d.find_sig("HUNGRY_SIG"), Some((5, 0x2000_0010)));
    }

    #[test]
    fn test_capacity() {
        let mut d = Dictionaries::new();
        for i in 0..USR_CAPACITY as u64 {
            assert_eq!(d.usr.put(i, "x"), PutOutcome::Inserted);
        }
        assert_eq!(d.usr.put(9999, "late"), PutOutcome::Full);
        assert_eq!(d.len(DictKind::Usr), USR_CAPACITY);
        // 已有键仍可更新
        assert_eq!(d.usr.put(0, "y"), PutOutcome::Replaced);
    }

    #[test]
    fn test_name_is_cleaned() {
        let mut d = Dictionaries::new();
        let long = "N".repeat(100);
        d.put_obj(1, &long);
        assert_eq!(d.obj(1).map(str::len), Some(MAX_NAME_LEN));
        d.put_obj(2, " a\nb ");
        assert_eq!(d.obj(2), Some("a_b"));
    }

    #[test]
    fn test_round_trip() {
        let d = sample();
        let cfg = SessionConfig::default();
        let mut buf = Vec::new();
        d.write_all(&mut buf, &cfg).unwrap();

        let mut loaded = Dictionaries::new();
        let file_cfg = loaded.read_all(Cursor::new(&buf), None).unwrap();
        assert_eq!(file_cfg, cfg);
        assert_eq!(loaded, d);

        // 再次写出得到完全相同的文本
        let mut again = Vec::new();
        loaded.write_all(&mut again, &cfg).unwrap();
        assert_eq!(again, buf);
    }

    #[test]
    fn test_round_trip_empty_names() {
        let mut d = Dictionaries::new();
        d.put_obj(0x10, "");
        d.put_obj(0x20, "AO_Table");
        d.put_fun(0x0800_0000, "");
        d.put_usr(101, "");
        d.put_sig(7, 0x10, "");
        d.put_sig(8, 0, "");
        let cfg = SessionConfig::default();
        let mut buf = Vec::new();
        d.write_all(&mut buf, &cfg).unwrap();

        let mut loaded = Dictionaries::new();
        loaded.read_all(Cursor::new(&buf), None).unwrap();
        assert_eq!(loaded, d);
        assert_eq!(loaded.obj(0x10), Some(""));
        assert_eq!(loaded.sig(7, 0x10), Some(""));

        // 行尾没有空格的手写文件同样可以读取
        let text = "-v720\n\nObj-Dic=4\n0x00000030\n***\nSig-Dic=2\n0x0009 0x00000030\n***\n";
        let mut d = Dictionaries::new();
        d.read_all(Cursor::new(text), None).unwrap();
        assert_eq!(d.obj(0x30), Some(""));
        assert_eq!(d.sig(9, 0x30), Some(""));

        let bad = "-v720\n\nSig-Dic=2\n0x0009\n***\n";
        assert!(matches!(
            d.read_all(Cursor::new(bad), None),
            Err(DictError::Parse { line: 4, .. })
        ));
    }

    #[test]
    fn test_file_format() {
        let mut d = Dictionaries::new();
        d.put_obj(0x10, "l_table");
        d.put_sig(5, 0x10, "EAT_SIG");
        let mut buf = Vec::new();
        d.write_all(&mut buf, &SessionConfig::default()).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("-v720\n-T4\n-O4\n"));
        assert!(text.contains("\n\nObj-Dic=4\n0x00000010 l_table\n***\n"));
        assert!(text.ends_with("Sig-Dic=2\n0x0005 0x00000010 EAT_SIG\n***\n"));
    }

    #[test]
    fn test_mismatch_resets_everything() {
        let file_cfg = SessionConfig::default();
        let mut buf = Vec::new();
        sample().write_all(&mut buf, &file_cfg).unwrap();

        let mut live = SessionConfig::default();
        live.widths.obj_ptr = 8;

        let mut d = sample();
        let err = d.read_all(Cursor::new(&buf), Some(&live)).unwrap_err();
        assert!(matches!(err, DictError::ConfigMismatch { .. }));
        assert!(d.is_empty());
    }

    #[test]
    fn test_parse_error_leaves_tables_unchanged() {
        let text = "-v720\n\nObj-Dic=4\n0x10 ok\nnot-a-key broken\n***\n";
        let mut d = sample();
        let err = d.read_all(Cursor::new(text), None).unwrap_err();
        assert!(matches!(err, DictError::Parse { line: 5, .. }));
        assert_eq!(d, sample());

        let unterminated = "-v720\n\nObj-Dic=4\n0x10 ok\n";
        assert!(d.read_all(Cursor::new(unterminated), None).is_err());
        assert_eq!(d, sample());
    }
}
