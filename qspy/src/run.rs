//! 事件循环
//!
//! 单线程，每轮一个 biased `select!`，依次等待：Ctrl+C、键盘行、
//! 前端数据报、目标链路、轮询超时。处理完一个事件后把会话的待发内容
//! 按顺序送出（屏幕 -> 目标 -> 前端）。

use std::io::{self, Write};
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::net::UdpSocket;
use tracing::{info, warn};

use crate::link::{LinkEvent, TargetLink};
use crate::session::Session;

/// 没有任何事件时的轮询间隔
pub const POLL_TIMEOUT: Duration = Duration::from_millis(100);

const LINK_BUF_SIZE: usize = 4096;
const RELAY_BUF_SIZE: usize = 2048;

/// 清屏并把光标移到左上角
const CLEAR_SCREEN: &str = "\x1b[2J\x1b[H";

type Keyboard = Lines<BufReader<Stdin>>;

enum Flow {
    Continue,
    Stop,
}

async fn next_line(keys: &mut Option<Keyboard>) -> io::Result<Option<String>> {
    match keys {
        Some(lines) => lines.next_line().await,
        None => std::future::pending().await,
    }
}

async fn recv_relay(sock: Option<&UdpSocket>, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
    match sock {
        Some(sock) => sock.recv_from(buf).await,
        None => std::future::pending().await,
    }
}

/// 运行直到退出指令、Ctrl+C、回放结束或链路硬错误
///
/// 无论怎样退出，输出文件和链路都会先关闭。
pub async fn run(
    mut session: Session,
    mut link: TargetLink,
    relay: Option<UdpSocket>,
    keyboard: bool,
) -> anyhow::Result<()> {
    let mut keys = keyboard.then(|| BufReader::new(tokio::io::stdin()).lines());
    let mut link_buf = vec![0u8; LINK_BUF_SIZE];
    let mut relay_buf = vec![0u8; RELAY_BUF_SIZE];

    if let Some(sock) = &relay {
        info!("Front-end relay on UDP {}", sock.local_addr()?);
    }
    info!("Target link: {}", link.describe());

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let result = loop {
        let flow = tokio::select! {
            biased;

            _ = &mut ctrl_c => {
                info!("Received Ctrl+C, stopping...");
                Ok(Flow::Stop)
            }

            line = next_line(&mut keys) => {
                match line {
                    Ok(Some(line)) => session.on_keyboard(&line),
                    Ok(None) => {
                        info!("Keyboard input closed");
                        keys = None;
                    }
                    Err(e) => {
                        warn!("Keyboard read failed: {}", e);
                        keys = None;
                    }
                }
                Ok(Flow::Continue)
            }

            res = recv_relay(relay.as_ref(), &mut relay_buf) => {
                match res {
                    Ok((n, from)) => session.on_relay(from, &relay_buf[..n]),
                    Err(e) => warn!("Relay receive failed: {}", e),
                }
                Ok(Flow::Continue)
            }

            res = link.read(&mut link_buf) => {
                match res {
                    Ok(LinkEvent::Data(n)) => {
                        session.on_link_data(&link_buf[..n]);
                        Ok(Flow::Continue)
                    }
                    Ok(LinkEvent::Reconnected) => {
                        session.on_reconnect();
                        Ok(Flow::Continue)
                    }
                    Ok(LinkEvent::Disconnected) => Ok(Flow::Continue),
                    Ok(LinkEvent::Eof) => Ok(Flow::Stop),
                    Err(e) => Err(anyhow::Error::new(e)
                        .context(format!("target link {} failed", link.describe()))),
                }
            }

            _ = tokio::time::sleep(POLL_TIMEOUT) => Ok(Flow::Continue),
        };

        let flow = match flow {
            Ok(flow) => flow,
            Err(e) => break Err(e),
        };
        match flush(&mut session, &mut link, relay.as_ref()).await {
            Ok(true) => break Ok(()),
            Ok(false) => {}
            Err(e) => break Err(e),
        }
        if let Flow::Stop = flow {
            break Ok(());
        }
    };

    session.shutdown();
    link.close().await;
    result
}

/// 送出会话的待发内容，返回是否收到退出指令
async fn flush(
    session: &mut Session,
    link: &mut TargetLink,
    relay: Option<&UdpSocket>,
) -> anyhow::Result<bool> {
    let out = session.take_outbox();

    if out.clear_screen || !out.screen.is_empty() {
        let mut stdout = io::stdout().lock();
        if out.clear_screen {
            write!(stdout, "{}", CLEAR_SCREEN)?;
        }
        for line in &out.screen {
            writeln!(stdout, "{}", line)?;
        }
        stdout.flush()?;
    }

    for frame in &out.to_target {
        link.write(frame)
            .await
            .with_context(|| format!("write to target link {}", link.describe()))?;
    }

    if let Some(sock) = relay {
        for (addr, packet) in &out.to_peer {
            if let Err(e) = sock.send_to(packet, addr).await {
                warn!("Relay send to {} failed: {}", addr, e);
            }
        }
    }

    Ok(out.exit)
}
