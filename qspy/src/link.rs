//! 目标链路
//!
//! 三种字节源，统一成 [`TargetLink`]：
//! - `Tcp`: 作为服务端等待目标连接，同一时间只服务一个客户端
//! - `File`: 回放二进制文件，读完即结束
//! - `Bridge`: 桥接进程（见 [`crate::probe`]）
//!
//! `read` 在 `select!` 中使用，各分支都是可取消的。

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use bytes::{Buf, Bytes};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::probe::ProbeWorker;

/// 一次读取的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// 读到 n 个字节
    Data(usize),
    /// 新的目标连接建立
    Reconnected,
    /// 当前连接断开（服务端继续等待）
    Disconnected,
    /// 数据源结束
    Eof,
}

#[derive(Debug)]
pub struct TcpLink {
    listener: TcpListener,
    client: Option<(TcpStream, SocketAddr)>,
}

impl TcpLink {
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.client.as_ref().map(|(_, addr)| *addr)
    }

    async fn read(&mut self, buf: &mut [u8]) -> io::Result<LinkEvent> {
        let Some((stream, addr)) = self.client.as_mut() else {
            let (stream, addr) = self.listener.accept().await?;
            if let Err(e) = stream.set_nodelay(true) {
                debug!("set_nodelay failed: {}", e);
            }
            info!("Target connected: {}", addr);
            self.client = Some((stream, addr));
            return Ok(LinkEvent::Reconnected);
        };

        match stream.read(buf).await {
            Ok(0) => {
                info!("Target disconnected: {}", addr);
                self.client = None;
                Ok(LinkEvent::Disconnected)
            }
            Ok(n) => Ok(LinkEvent::Data(n)),
            Err(e) => {
                warn!("Target connection {} failed: {}", addr, e);
                self.client = None;
                Ok(LinkEvent::Disconnected)
            }
        }
    }

    async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        let Some((stream, addr)) = self.client.as_mut() else {
            debug!("No target connected, {} bytes discarded", data.len());
            return Ok(());
        };
        if let Err(e) = stream.write_all(data).await {
            warn!("Write to target {} failed: {}", addr, e);
            self.client = None;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct FileLink {
    path: PathBuf,
    file: File,
}

impl FileLink {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<LinkEvent> {
        match self.file.read(buf).await? {
            0 => {
                info!("End of replay file: {}", self.path.display());
                Ok(LinkEvent::Eof)
            }
            n => Ok(LinkEvent::Data(n)),
        }
    }
}

#[derive(Debug)]
pub struct BridgeLink {
    // 先于 worker 释放，读线程才不会阻塞在满通道上
    rx: mpsc::Receiver<Bytes>,
    pending: Bytes,
    worker: ProbeWorker,
}

impl BridgeLink {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<LinkEvent> {
        if self.pending.is_empty() {
            match self.rx.recv().await {
                Some(chunk) => self.pending = chunk,
                None => {
                    info!("Bridge output closed: '{}'", self.worker.cmd());
                    return Ok(LinkEvent::Eof);
                }
            }
        }
        let n = self.pending.len().min(buf.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.advance(n);
        Ok(LinkEvent::Data(n))
    }
}

#[derive(Debug)]
pub enum TargetLink {
    Tcp(TcpLink),
    File(FileLink),
    Bridge(BridgeLink),
}

impl TargetLink {
    /// 在所有地址上监听目标连接
    pub async fn listen_tcp(port: u16) -> io::Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        info!("Waiting for target on TCP {}", listener.local_addr()?);
        Ok(TargetLink::Tcp(TcpLink {
            listener,
            client: None,
        }))
    }

    /// 仅监听本机回环地址（测试使用，端口 0 由系统分配）
    pub async fn listen_local(port: u16) -> io::Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", port)).await?;
        Ok(TargetLink::Tcp(TcpLink {
            listener,
            client: None,
        }))
    }

    pub async fn open_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).await?;
        info!("Replaying {}", path.display());
        Ok(TargetLink::File(FileLink { path, file }))
    }

    pub fn spawn_bridge(cmd: &str) -> io::Result<Self> {
        let (worker, rx) = ProbeWorker::spawn(cmd)?;
        Ok(TargetLink::Bridge(BridgeLink {
            rx,
            pending: Bytes::new(),
            worker,
        }))
    }

    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<LinkEvent> {
        match self {
            TargetLink::Tcp(link) => link.read(buf).await,
            TargetLink::File(link) => link.read(buf).await,
            TargetLink::Bridge(link) => link.read(buf).await,
        }
    }

    /// 发送已成帧的字节；回放文件没有回传方向，数据被丢弃
    pub async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        match self {
            TargetLink::Tcp(link) => link.write(data).await,
            TargetLink::File(link) => {
                debug!(
                    "Replay {}: {} bytes to target discarded",
                    link.path.display(),
                    data.len()
                );
                Ok(())
            }
            TargetLink::Bridge(link) => link.worker.send(data.to_vec()),
        }
    }

    pub async fn close(&mut self) {
        match self {
            TargetLink::Tcp(link) => {
                if let Some((mut stream, addr)) = link.client.take() {
                    match stream.shutdown().await {
                        Ok(()) => info!("Closed target connection {}", addr),
                        Err(e) => debug!("Target connection {} closed with error: {}", addr, e),
                    }
                }
            }
            TargetLink::File(_) => {}
            TargetLink::Bridge(link) => {
                link.rx.close();
                link.worker.shutdown();
            }
        }
    }

    pub fn describe(&self) -> String {
        match self {
            TargetLink::Tcp(link) => match link.local_addr() {
                Ok(addr) => format!("tcp:{}", addr),
                Err(_) => "tcp".to_string(),
            },
            TargetLink::File(link) => format!("file:{}", link.path.display()),
            TargetLink::Bridge(link) => format!("bridge:{}", link.worker.cmd()),
        }
    }
}
