//! qspy - QS 主机端跟踪工具
//!
//! 从目标链路（TCP / 回放文件 / 桥接进程）接收 QS 帧，解码、查字典后渲染成
//! 文本行和时序图，并通过 UDP 把记录中继给外部前端，同时把键盘和前端的
//! 命令编码后发回目标。
//!
//! 模块划分：
//! - [`dict`]: 对象 / 函数 / 信号 / 用户记录字典及字典文件
//! - [`dispatch`]: 记录渲染、Matlab 行、时序图事件提取
//! - [`seq`]: 时序图
//! - [`backend`]: 前端中继
//! - [`output`]: 输出文件
//! - [`link`] / [`probe`]: 目标链路
//! - [`session`]: 会话状态
//! - [`run`]: 事件循环
//!
//! # Example
//!
//! ```no_run
//! use qspy::{run, Session, SessionOptions, TargetLink};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> anyhow::Result<()> {
//!     let session = Session::new(SessionOptions::default())?;
//!     let link = TargetLink::open_file("trace.bin").await?;
//!     run(session, link, None, false).await
//! }
//! ```

pub mod backend;
pub mod command;
pub mod config;
pub mod dict;
pub mod dispatch;
pub mod link;
pub mod output;
pub mod probe;
pub mod run;
pub mod seq;
pub mod session;

pub use backend::{Attachment, Backend, Inbound};
pub use command::{Directive, Switch};
pub use config::{QspyConfig, SeqConfig};
pub use dict::{DictError, DictKind, Dictionaries};
pub use link::{LinkEvent, TargetLink};
pub use output::{Outputs, SinkKind};
pub use run::run;
pub use seq::{SeqDiagram, SeqError};
pub use session::{Outbox, Session, SessionError, SessionOptions, Stats};
