//! 目标链路测试：回放文件、TCP 服务端、桥接进程

use std::fs;

use qspy::{LinkEvent, TargetLink};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

#[tokio::test]
async fn test_file_link_reads_to_eof() {
    let path = std::env::temp_dir().join(format!("qspy_link_{}.bin", std::process::id()));
    fs::write(&path, [0x01, 0x02, 0x03, 0x7E]).unwrap();

    let mut link = TargetLink::open_file(&path).await.unwrap();
    assert!(link.describe().starts_with("file:"));

    let mut buf = [0u8; 3];
    assert_eq!(link.read(&mut buf).await.unwrap(), LinkEvent::Data(3));
    assert_eq!(buf, [0x01, 0x02, 0x03]);
    assert_eq!(link.read(&mut buf).await.unwrap(), LinkEvent::Data(1));
    assert_eq!(link.read(&mut buf).await.unwrap(), LinkEvent::Eof);

    // 回放没有回传方向，写入被丢弃
    link.write(&[0x7E]).await.unwrap();
    link.close().await;
    fs::remove_file(&path).ok();
}

#[tokio::test]
async fn test_tcp_link_serves_one_client_at_a_time() {
    let mut link = TargetLink::listen_local(0).await.unwrap();
    let addr = match &link {
        TargetLink::Tcp(tcp) => tcp.local_addr().unwrap(),
        _ => unreachable!(),
    };

    // 没有客户端时写入直接丢弃
    link.write(&[0x01]).await.unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    let mut buf = [0u8; 16];
    assert_eq!(link.read(&mut buf).await.unwrap(), LinkEvent::Reconnected);

    client.write_all(&[0xAA, 0xBB]).await.unwrap();
    let mut got = Vec::new();
    while got.len() < 2 {
        match link.read(&mut buf).await.unwrap() {
            LinkEvent::Data(n) => got.extend_from_slice(&buf[..n]),
            other => panic!("unexpected {:?}", other),
        }
    }
    assert_eq!(got, vec![0xAA, 0xBB]);

    link.write(&[0x7E, 0x01]).await.unwrap();
    let mut echo = [0u8; 2];
    client.read_exact(&mut echo).await.unwrap();
    assert_eq!(echo, [0x7E, 0x01]);

    drop(client);
    assert_eq!(link.read(&mut buf).await.unwrap(), LinkEvent::Disconnected);

    // 断开后可以接受新的目标
    let _second = TcpStream::connect(addr).await.unwrap();
    assert_eq!(link.read(&mut buf).await.unwrap(), LinkEvent::Reconnected);
    link.close().await;
}

#[cfg(unix)]
#[tokio::test]
async fn test_bridge_link_round_trip() {
    let mut link = TargetLink::spawn_bridge("cat").unwrap();
    assert_eq!(link.describe(), "bridge:cat");

    link.write(&[0x10, 0x20, 0x30]).await.unwrap();
    let mut buf = [0u8; 2];
    let mut got = Vec::new();
    while got.len() < 3 {
        match link.read(&mut buf).await.unwrap() {
            LinkEvent::Data(n) => got.extend_from_slice(&buf[..n]),
            other => panic!("unexpected {:?}", other),
        }
    }
    assert_eq!(got, vec![0x10, 0x20, 0x30]);
    link.close().await;
}
