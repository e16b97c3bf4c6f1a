//! 时序图生成器
//!
//! 每条泳道固定 20 列，前面是 10 列时间戳和一个空格。泳道 0 可以是系统边界
//! （无法解析到具体对象的收发方都画到这里）。
//!
//! ```text
//!            +----------------+  +----------------+
//!            |     System     |  |    AO_Table    |
//!            +--------+-------+  +--------+-------+
//! 0000001200          +------------------>| HUNGRY
//!                     |                  [serving]
//! ```

use std::collections::HashMap;

use thiserror::Error;

pub const TS_WIDTH: usize = 10;
pub const LANE_WIDTH: usize = 20;
pub const MAX_LANES: usize = 10;
pub const DEFAULT_HEADER_EVERY: usize = 100;
pub const BOUNDARY_NAME: &str = "System";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SeqError {
    #[error("too many sequence lanes: {count} (max {max})")]
    TooManyLanes { count: usize, max: usize },
    #[error("empty sequence lane name")]
    EmptyName,
}

/// 泳道中心列
pub fn center(lane: usize) -> usize {
    TS_WIDTH + 1 + lane * LANE_WIDTH + LANE_WIDTH / 2
}

fn clip(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// 对象名对应的类名: 去掉 `AO_`/`l_` 前缀和 `[n]` 下标
fn class_name(lane: &str) -> &str {
    let name = lane
        .strip_prefix("AO_")
        .or_else(|| lane.strip_prefix("l_"))
        .unwrap_or(lane);
    match name.find('[') {
        Some(pos) => &name[..pos],
        None => name,
    }
}

/// 状态的叶子名: 去掉 `Class_` 或 `Xxx::` 前缀
pub fn leaf_state<'a>(lane: &str, state: &'a str) -> &'a str {
    if let Some(pos) = state.rfind("::") {
        return &state[pos + 2..];
    }
    let class = class_name(lane);
    if !class.is_empty() {
        if let Some(rest) = state.strip_prefix(class) {
            if let Some(leaf) = rest.strip_prefix('_') {
                if !leaf.is_empty() {
                    return leaf;
                }
            }
        }
    }
    state
}

/// 一行画布
struct Row(Vec<char>);

impl Row {
    fn blank(lanes: usize) -> Self {
        Row(vec![' '; TS_WIDTH + 1 + lanes * LANE_WIDTH])
    }

    fn put(&mut self, col: usize, c: char) {
        if col >= self.0.len() {
            self.0.resize(col + 1, ' ');
        }
        self.0[col] = c;
    }

    fn text(&mut self, col: usize, s: &str) {
        for (i, c) in s.chars().enumerate() {
            self.put(col + i, c);
        }
    }

    fn fill(&mut self, from: usize, to: usize, c: char) {
        for col in from..to {
            self.put(col, c);
        }
    }

    fn finish(self) -> String {
        let line: String = self.0.into_iter().collect();
        line.trim_end().to_string()
    }
}

#[derive(Debug)]
pub struct SeqDiagram {
    lanes: Vec<String>,
    boundary: bool,
    lane_of: HashMap<u64, usize>,
    header_every: usize,
    since_header: usize,
    lines: Vec<String>,
}

impl Default for SeqDiagram {
    fn default() -> Self {
        Self::new(DEFAULT_HEADER_EVERY)
    }
}

impl SeqDiagram {
    /// `header_every` 为 0 时只在开头输出表头
    pub fn new(header_every: usize) -> Self {
        Self {
            lanes: Vec::new(),
            boundary: false,
            lane_of: HashMap::new(),
            header_every,
            since_header: 0,
            lines: Vec::new(),
        }
    }

    /// 建立泳道表并输出表头
    pub fn configure(&mut self, names: &[String], boundary: bool) -> Result<(), SeqError> {
        if names.len() > MAX_LANES {
            return Err(SeqError::TooManyLanes {
                count: names.len(),
                max: MAX_LANES,
            });
        }
        if names.iter().any(|n| n.trim().is_empty()) {
            return Err(SeqError::EmptyName);
        }

        self.lanes.clear();
        self.lane_of.clear();
        self.boundary = boundary;
        if boundary {
            self.lanes.push(BOUNDARY_NAME.to_string());
        }
        self.lanes.extend(names.iter().map(|n| n.trim().to_string()));

        if self.is_active() {
            self.emit_header();
        }
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        !self.lanes.is_empty()
    }

    pub fn lanes(&self) -> &[String] {
        &self.lanes
    }

    /// 对象字典更新时维护 键 -> 泳道 映射
    pub fn on_obj_dict(&mut self, key: u64, name: &str) {
        let first = usize::from(self.boundary);
        match self.lanes.iter().skip(first).position(|lane| lane == name) {
            Some(pos) => {
                self.lane_of.insert(key, first + pos);
            }
            None => {
                self.lane_of.remove(&key);
            }
        }
    }

    /// 字典被清空时调用
    pub fn reset_map(&mut self) {
        self.lane_of.clear();
    }

    /// 明确映射到的泳道
    pub fn lane_of(&self, key: u64) -> Option<usize> {
        self.lane_of.get(&key).copied()
    }

    /// 映射不到时退回系统边界泳道
    pub fn lane_for(&self, key: u64) -> Option<usize> {
        self.lane_of(key).or(if self.boundary { Some(0) } else { None })
    }

    pub fn lane_name(&self, lane: usize) -> Option<&str> {
        self.lanes.get(lane).map(String::as_str)
    }

    pub fn take_lines(&mut self) -> Vec<String> {
        std::mem::take(&mut self.lines)
    }

    /// 丢弃未取走的行并重新输出表头（打开新的时序图文件时）
    pub fn restart(&mut self) {
        self.lines.clear();
        if self.is_active() {
            self.emit_header();
        }
    }

    fn row(&self, ts: Option<u64>) -> Row {
        let mut row = Row::blank(self.lanes.len());
        if let Some(ts) = ts {
            row.text(0, &format!("{:010}", ts));
        }
        for lane in 0..self.lanes.len() {
            row.put(center(lane), '|');
        }
        row
    }

    fn emit_header(&mut self) {
        let n = self.lanes.len();
        let (mut top, mut mid, mut bot) = (Row::blank(n), Row::blank(n), Row::blank(n));
        let inner = LANE_WIDTH - 4;
        for (i, name) in self.lanes.iter().enumerate() {
            let start = TS_WIDTH + 1 + i * LANE_WIDTH + 1;
            top.text(start, &format!("+{}+", "-".repeat(inner)));
            mid.text(start, &format!("|{:^w$}|", clip(name, inner), w = inner));
            // 底边在泳道中心处接出生命线
            let left = center(i) - start - 1;
            bot.text(
                start,
                &format!("+{}+{}+", "-".repeat(left), "-".repeat(inner - left - 1)),
            );
        }
        self.lines.push(top.finish());
        self.lines.push(mid.finish());
        self.lines.push(bot.finish());
        self.since_header = 0;
    }

    fn emit(&mut self, row: Row) {
        if self.header_every > 0 && self.since_header >= self.header_every {
            self.emit_header();
        }
        self.lines.push(row.finish());
        self.since_header += 1;
    }

    fn valid(&self, lane: usize) -> bool {
        lane < self.lanes.len()
    }

    /// 消息箭头；`attempt` 为真时用 `~` 画线
    pub fn on_post(&mut self, ts: Option<u64>, src: usize, dst: usize, label: &str, attempt: bool) {
        if !self.valid(src) || !self.valid(dst) {
            return;
        }
        let dash = if attempt { '~' } else { '-' };

        if src == dst {
            let c = center(src);
            let mut first = self.row(ts);
            first.fill(c + 1, c + 3, dash);
            first.put(c + 3, '+');
            first.text(c + 5, &clip(label, LANE_WIDTH - 2));
            let mut second = self.row(None);
            second.put(c + 1, '<');
            second.put(c + 2, dash);
            second.put(c + 3, '+');
            self.emit(first);
            self.emit(second);
            return;
        }

        let (cs, cd) = (center(src), center(dst));
        let mut row = self.row(ts);
        row.put(cs, '+');
        if cs < cd {
            row.fill(cs + 1, cd - 1, dash);
            row.put(cd - 1, '>');
            row.text(cd + 2, &clip(label, LANE_WIDTH - 2));
        } else {
            row.fill(cd + 2, cs, dash);
            row.put(cd + 1, '<');
            let room = (cd - 2).saturating_sub(TS_WIDTH + 1).min(LANE_WIDTH - 2);
            let label = clip(label, room);
            let len = label.chars().count();
            row.text(cd - 1 - len, &label);
        }
        self.emit(row);
    }

    /// 广播：横跨全部泳道的点线
    pub fn on_publish(&mut self, ts: Option<u64>, src: usize, label: &str) {
        if !self.valid(src) {
            return;
        }
        let last = self.lanes.len() - 1;
        let mut row = self.row(ts);
        row.fill(center(0), center(last) + 1, '.');
        for lane in 0..=last {
            row.put(center(lane), '|');
        }
        row.put(center(src), '*');
        row.text(center(src) + 2, &clip(label, LANE_WIDTH - 2));
        self.emit(row);
    }

    /// 状态迁移：在泳道下方标注 `[叶子状态]`
    pub fn on_transition(&mut self, ts: Option<u64>, lane: usize, state: &str) {
        let Some(name) = self.lane_name(lane) else {
            return;
        };
        let text = format!("[{}]", clip(leaf_state(name, state), LANE_WIDTH - 4));
        self.annotate(ts, lane, &text);
    }

    /// 事件出队分派
    pub fn on_dispatch(&mut self, ts: Option<u64>, lane: usize, signal: &str) {
        if !self.valid(lane) {
            return;
        }
        let text = format!("({})", clip(signal, LANE_WIDTH - 4));
        self.annotate(ts, lane, &text);
    }

    /// 事件被状态机忽略：`X(SIG)`
    pub fn on_ignored(&mut self, ts: Option<u64>, lane: usize, signal: &str) {
        if !self.valid(lane) {
            return;
        }
        let text = format!("X({})", clip(signal, LANE_WIDTH - 5));
        self.annotate(ts, lane, &text);
    }

    fn annotate(&mut self, ts: Option<u64>, lane: usize, text: &str) {
        let mut row = self.row(ts);
        let len = text.chars().count();
        row.text(center(lane) - len / 2, text);
        self.emit(row);
    }

    /// 时钟节拍：整行 `=`
    pub fn on_tick(&mut self, rate: u8, counter: u64) {
        if !self.is_active() {
            return;
        }
        let mut row = Row::blank(self.lanes.len());
        let width = row.0.len();
        row.fill(TS_WIDTH + 1, width, '=');
        row.text(TS_WIDTH + 3, &format!(" TICK[{}]={} ", rate, counter));
        self.emit(row);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diagram(boundary: bool) -> SeqDiagram {
        let mut seq = SeqDiagram::new(DEFAULT_HEADER_EVERY);
        let lanes = vec!["AO_Table".to_string(), "AO_Philo[0]".to_string()];
        seq.configure(&lanes, boundary).unwrap();
        seq
    }

    fn at(line: &str, col: usize) -> Option<char> {
        line.chars().nth(col)
    }

    #[test]
    fn test_header() {
        let mut seq = diagram(true);
        let lines = seq.take_lines();
        assert_eq!(lines.len(), 3);
        assert!(lines[1].contains("System"));
        assert!(lines[1].contains("AO_Table"));
        assert!(lines[1].contains("AO_Philo[0]"));
        // 底边的 '+' 对齐到泳道中心
        for lane in 0..3 {
            assert_eq!(at(&lines[2], center(lane)), Some('+'));
        }
        assert_eq!(at(&lines[0], TS_WIDTH + 2), Some('+'));
    }

    #[test]
    fn test_too_many_lanes() {
        let mut seq = SeqDiagram::default();
        let lanes: Vec<String> = (0..11).map(|i| format!("AO_{}", i)).collect();
        assert_eq!(
            seq.configure(&lanes, false),
            Err(SeqError::TooManyLanes { count: 11, max: MAX_LANES })
        );
    }

    #[test]
    fn test_post_right_and_left() {
        let mut seq = diagram(false);
        seq.take_lines();

        seq.on_post(Some(1200), 0, 1, "HUNGRY", false);
        seq.on_post(Some(1300), 1, 0, "EAT", true);
        let lines = seq.take_lines();
        let right = &lines[0];
        let left = &lines[1];

        assert!(right.starts_with("0000001200 "));
        assert_eq!(at(right, center(0)), Some('+'));
        assert_eq!(at(right, center(1) - 1), Some('>'));
        assert_eq!(at(right, center(1)), Some('|'));
        assert_eq!(right.find("HUNGRY"), Some(center(1) + 2));

        assert_eq!(at(left, center(0) + 1), Some('<'));
        assert_eq!(at(left, center(0) + 2), Some('~'));
        assert_eq!(at(left, center(1)), Some('+'));
        // 左向箭头的标签在箭头左侧
        assert_eq!(left.find("EAT"), Some(center(0) - 4));
    }

    #[test]
    fn test_self_post() {
        let mut seq = diagram(false);
        seq.take_lines();
        seq.on_post(Some(5), 1, 1, "TIMEOUT", false);
        let lines = seq.take_lines();
        assert_eq!(lines.len(), 2);
        let c = center(1);
        assert_eq!(lines[0].get(c..c + 4), Some("|--+"));
        assert_eq!(lines[1].get(c..c + 4), Some("|<-+"));
        assert!(lines[0].ends_with("TIMEOUT"));
    }

    #[test]
    fn test_publish_spans_all_lanes() {
        let mut seq = diagram(true);
        seq.take_lines();
        seq.on_publish(Some(7), 1, "EAT_SIG");
        let line = &seq.take_lines()[0];
        assert_eq!(at(line, center(0)), Some('|'));
        assert_eq!(at(line, center(1)), Some('*'));
        assert_eq!(at(line, center(2)), Some('|'));
        assert_eq!(at(line, center(0) + 1), Some('.'));
        assert!(line.contains("EAT_SIG"));
    }

    #[test]
    fn test_transition_leaf_name() {
        assert_eq!(leaf_state("AO_Philo[0]", "Philo_thinking"), "thinking");
        assert_eq!(leaf_state("l_table", "table_serving"), "serving");
        assert_eq!(leaf_state("AO_Table", "QHsm::top"), "top");
        assert_eq!(leaf_state("AO_Table", "Other_state"), "Other_state");

        let mut seq = diagram(false);
        seq.take_lines();
        seq.on_transition(Some(9), 1, "Philo_eating");
        let line = &seq.take_lines()[0];
        let pos = line.find("[eating]").unwrap();
        assert!(pos < center(1) && pos + 8 > center(1));
    }

    #[test]
    fn test_ignored_annotation() {
        let mut seq = diagram(false);
        seq.take_lines();
        seq.on_ignored(Some(3), 0, "DONE_SIG");
        let line = &seq.take_lines()[0];
        assert!(line.starts_with("0000000003 "));
        let pos = line.find("X(DONE_SIG)").unwrap();
        assert!(pos < center(0) && pos + 11 > center(0));

        seq.on_ignored(Some(4), 7, "DONE_SIG");
        assert!(seq.take_lines().is_empty());
    }

    #[test]
    fn test_tick_line() {
        let mut seq = diagram(false);
        seq.take_lines();
        seq.on_tick(0, 42);
        let line = &seq.take_lines()[0];
        assert!(line.contains(" TICK[0]=42 "));
        assert!(line.ends_with('='));
        assert_eq!(line.chars().count(), center(1) + LANE_WIDTH / 2);
    }

    #[test]
    fn test_header_repeats() {
        let mut seq = SeqDiagram::new(2);
        seq.configure(&["AO_A".to_string()], false).unwrap();
        for ts in 0..5 {
            seq.on_dispatch(Some(ts), 0, "SIG");
        }
        let lines = seq.take_lines();
        // 表头 + 2 行 + 表头 + 2 行 + 表头 + 1 行
        assert_eq!(lines.len(), 3 * 3 + 5);
        assert!(lines[5].starts_with(&" ".repeat(TS_WIDTH + 1)));
        assert!(lines[5].contains('+'));
    }

    #[test]
    fn test_lane_map() {
        let mut seq = diagram(true);
        seq.on_obj_dict(0x10, "AO_Philo[0]");
        seq.on_obj_dict(0x20, "AO_Unknown");
        assert_eq!(seq.lane_of(0x10), Some(2));
        assert_eq!(seq.lane_for(0x20), Some(0));

        let mut no_boundary = diagram(false);
        no_boundary.on_obj_dict(0x10, "AO_Table");
        assert_eq!(no_boundary.lane_for(0x10), Some(0));
        assert_eq!(no_boundary.lane_for(0x99), None);

        seq.reset_map();
        assert_eq!(seq.lane_of(0x10), None);
    }

    #[test]
    fn test_restart_emits_fresh_header() {
        let mut seq = diagram(false);
        seq.on_tick(0, 1);
        seq.restart();
        let lines = seq.take_lines();
        assert_eq!(lines.len(), 3);
        assert!(lines[1].contains("AO_Table"));

        let mut idle = SeqDiagram::default();
        idle.restart();
        assert!(idle.take_lines().is_empty());
    }
}
