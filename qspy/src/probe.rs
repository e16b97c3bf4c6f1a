//! 桥接进程工作者
//!
//! 通过 `sh -c <cmd>` 启动一个桥接进程（例如调试探针的转发工具），
//! 进程的 stdout 即目标字节流，写入 stdin 的字节发往目标。
//! 读写各由一个专用线程负责，与事件循环之间只通过通道交换字节块。

use std::io::{self, Read, Write};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use tokio::sync::mpsc as async_mpsc;
use tracing::{debug, info, warn};

/// 读线程一次读取的最大字节数
const READ_CHUNK: usize = 4096;

/// 读线程到事件循环的通道容量（按块计）
pub const CHANNEL_DEPTH: usize = 64;

pub struct ProbeWorker {
    cmd: String,
    child: Option<Child>,
    to_child: Option<mpsc::Sender<Vec<u8>>>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for ProbeWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeWorker")
            .field("cmd", &self.cmd)
            .field("running", &self.child.is_some())
            .finish()
    }
}

impl ProbeWorker {
    /// 启动桥接进程，返回工作者和接收目标字节的通道
    pub fn spawn(cmd: &str) -> io::Result<(Self, async_mpsc::Receiver<Bytes>)> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "bridge stdout not captured"))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "bridge stdin not captured"))?;

        let (tx, rx) = async_mpsc::channel::<Bytes>(CHANNEL_DEPTH);
        let reader = thread::Builder::new()
            .name("qspy-bridge-rx".to_string())
            .spawn(move || read_loop(stdout, tx))?;

        let (to_child, from_loop) = mpsc::channel::<Vec<u8>>();
        let writer = thread::Builder::new()
            .name("qspy-bridge-tx".to_string())
            .spawn(move || write_loop(stdin, from_loop))?;

        info!("Bridge started: '{}' (pid {})", cmd, child.id());
        Ok((
            Self {
                cmd: cmd.to_string(),
                child: Some(child),
                to_child: Some(to_child),
                reader: Some(reader),
                writer: Some(writer),
            },
            rx,
        ))
    }

    pub fn cmd(&self) -> &str {
        &self.cmd
    }

    /// 发送字节到桥接进程的 stdin
    pub fn send(&self, data: Vec<u8>) -> io::Result<()> {
        let tx = self
            .to_child
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "bridge stopped"))?;
        tx.send(data)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "bridge writer exited"))
    }

    /// 终止进程并回收线程；可重复调用
    ///
    /// 调用前应先关闭接收通道，否则读线程可能阻塞在满通道上。
    pub fn shutdown(&mut self) {
        // 关闭发送端让写线程退出
        self.to_child.take();

        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill() {
                debug!("Bridge process already exited: {}", e);
            }
            match child.wait() {
                Ok(status) => info!("Bridge stopped: '{}' ({})", self.cmd, status),
                Err(e) => warn!("Failed to reap bridge '{}': {}", self.cmd, e),
            }
        }
        if let Some(handle) = self.writer.take() {
            join_logged("writer", handle);
        }
        if let Some(handle) = self.reader.take() {
            join_logged("reader", handle);
        }
    }
}

impl Drop for ProbeWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// 回收线程，线程 panic 时记录日志并返回 false
fn join_logged(role: &str, handle: JoinHandle<()>) -> bool {
    match handle.join() {
        Ok(()) => true,
        Err(_) => {
            warn!("Bridge {} thread panicked", role);
            false
        }
    }
}

fn read_loop<R: Read>(mut input: R, tx: async_mpsc::Sender<Bytes>) {
    let mut buf = [0u8; READ_CHUNK];
    loop {
        match input.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if tx.blocking_send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                    break; // 接收端已关闭
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("Bridge read failed: {}", e);
                break;
            }
        }
    }
    debug!("Bridge reader finished");
}

fn write_loop<W: Write>(mut output: W, rx: mpsc::Receiver<Vec<u8>>) {
    for chunk in rx {
        if let Err(e) = output.write_all(&chunk).and_then(|_| output.flush()) {
            warn!("Bridge write failed: {}", e);
            break;
        }
    }
    debug!("Bridge writer finished");
}
