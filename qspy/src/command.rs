//! 交互指令
//!
//! 键盘单字符命令和前端的后端命令都映射到同一组 [`Directive`]。

/// 开关动作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Switch {
    Toggle,
    On,
    Off,
}

impl Switch {
    /// 前端命令负载: 空 = 切换, 0 = 关, 其他 = 开
    pub fn from_payload(payload: &[u8]) -> Self {
        match payload.first() {
            None => Switch::Toggle,
            Some(0) => Switch::Off,
            Some(_) => Switch::On,
        }
    }

    pub fn apply(self, current: bool) -> bool {
        match self {
            Switch::Toggle => !current,
            Switch::On => true,
            Switch::Off => false,
        }
    }
}

/// 会话指令
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    Exit,
    Help,
    ClearScreen,
    ResetTarget,
    TargetInfo,
    /// 触发目标时钟节拍（速率编号）
    Tick(u8),
    SaveDictionaries,
    TextFile(Switch),
    BinaryFile(Switch),
    MatlabFile(Switch),
    SequenceFile(Switch),
    Quiet(Switch),
}

impl Directive {
    /// 键盘字符到指令
    pub fn from_key(key: char) -> Option<Self> {
        Some(match key {
            'x' | 'X' => Directive::Exit,
            'h' => Directive::Help,
            'c' => Directive::ClearScreen,
            'r' => Directive::ResetTarget,
            'i' => Directive::TargetInfo,
            't' => Directive::Tick(0),
            'u' => Directive::Tick(1),
            'd' => Directive::SaveDictionaries,
            'o' => Directive::TextFile(Switch::Toggle),
            'b' => Directive::BinaryFile(Switch::Toggle),
            'm' => Directive::MatlabFile(Switch::Toggle),
            'g' => Directive::SequenceFile(Switch::Toggle),
            'q' => Directive::Quiet(Switch::Toggle),
            _ => return None,
        })
    }
}

/// 帮助文本
pub const HELP: &[&str] = &[
    "Keyboard shortcuts:",
    "KEY(s)            ACTION",
    "----------------- ----------------------------------------",
    "<x> or <X>        Exit",
    "<h>               Display this help",
    "<c>               Clear the screen",
    "<r>               Send RESET to the target",
    "<i>               Send INFO request to the target",
    "<t>               Send TICK[0] to the target",
    "<u>               Send TICK[1] to the target",
    "<d>               Save dictionaries to a file",
    "<o>               Toggle text output file",
    "<b>               Toggle binary output file",
    "<m>               Toggle Matlab output file",
    "<g>               Toggle sequence output file",
    "<q>               Toggle quiet mode",
];
