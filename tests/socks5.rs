use std::time::Duration;

use ranger::{
    config::SessionConfig,
    stage::{self, Transform},
    Socks5Service,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    time::timeout,
};

async fn echo_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut rx, mut tx) = stream.split();
                let _ = tokio::io::copy(&mut rx, &mut tx).await;
            });
        }
    });
    port
}

async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn connect(port: u16) -> TcpStream {
    TcpStream::connect(("127.0.0.1", port)).await.unwrap()
}

async fn read_exactly(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
        .await
        .expect("timed out")
        .unwrap();
    buf
}

fn connect_request(port: u16) -> Vec<u8> {
    let mut request = vec![5, 1, 0, 1, 127, 0, 0, 1];
    request.extend_from_slice(&port.to_be_bytes());
    request
}

#[tokio::test]
async fn connect_ipv4_and_relay() {
    let echo = echo_server().await;
    let service = Socks5Service::new();
    let port = service
        .publish(Some("127.0.0.1"), 0, SessionConfig::default())
        .await
        .unwrap();

    let mut client = connect(port).await;
    client.write_all(&[5, 1, 0]).await.unwrap();
    assert_eq!(read_exactly(&mut client, 2).await, vec![5, 0]);

    client.write_all(&connect_request(echo)).await.unwrap();
    let reply = read_exactly(&mut client, 10).await;
    let mut expected = vec![5, 0, 0, 1, 127, 0, 0, 1];
    expected.extend_from_slice(&echo.to_be_bytes());
    assert_eq!(reply, expected);

    client.write_all(b"Hello, world!").await.unwrap();
    assert_eq!(read_exactly(&mut client, 13).await, b"Hello, world!");
    assert_eq!(service.active_sessions(), 1);
}

#[tokio::test]
async fn connect_domain_echoes_name() {
    let echo = echo_server().await;
    let service = Socks5Service::new();
    let port = service
        .publish(Some("127.0.0.1"), 0, SessionConfig::default())
        .await
        .unwrap();

    let mut request = vec![5, 1, 0, 5, 1, 0, 3, 9];
    request.extend_from_slice(b"localhost");
    request.extend_from_slice(&echo.to_be_bytes());

    let mut client = connect(port).await;
    client.write_all(&request).await.unwrap();
    assert_eq!(read_exactly(&mut client, 2).await, vec![5, 0]);

    let reply = read_exactly(&mut client, 16).await;
    assert_eq!(reply[..5], [5, 0, 0, 3, 9]);
    assert_eq!(&reply[5..14], b"localhost");
    assert_eq!(reply[14..], echo.to_be_bytes());

    client.write_all(b"Hello, world!").await.unwrap();
    assert_eq!(read_exactly(&mut client, 13).await, b"Hello, world!");
}

#[tokio::test]
async fn unreachable_target_replies_0x05() {
    let target = closed_port().await;
    let service = Socks5Service::new();
    let port = service
        .publish(Some("127.0.0.1"), 0, SessionConfig::default())
        .await
        .unwrap();

    let mut client = connect(port).await;
    client.write_all(&[5, 1, 0]).await.unwrap();
    read_exactly(&mut client, 2).await;
    client.write_all(&connect_request(target)).await.unwrap();

    let reply = read_exactly(&mut client, 10).await;
    assert_eq!(reply[1], 0x05);

    let mut buf = [0u8; 1];
    let n = timeout(Duration::from_secs(5), client.read(&mut buf))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0);
}

#[tokio::test]
async fn auth_required_rejects_unauthenticated_offer() {
    let service = Socks5Service::new();
    assert!(service.add_user("admin", "password"));
    assert!(!service.add_user("admin", "other"));
    let port = service
        .publish(Some("127.0.0.1"), 0, SessionConfig::default())
        .await
        .unwrap();

    let mut client = connect(port).await;
    client.write_all(&[5, 1, 0]).await.unwrap();
    assert_eq!(read_exactly(&mut client, 2).await, vec![5, 0xFF]);
}

async fn authenticate(port: u16, username: &str, password: &str) -> (TcpStream, Vec<u8>) {
    let mut client = connect(port).await;
    client.write_all(&[5, 1, 2]).await.unwrap();
    assert_eq!(read_exactly(&mut client, 2).await, vec![5, 2]);

    let mut request = vec![1, username.len() as u8];
    request.extend_from_slice(username.as_bytes());
    request.push(password.len() as u8);
    request.extend_from_slice(password.as_bytes());
    client.write_all(&request).await.unwrap();
    let status = read_exactly(&mut client, 2).await;
    (client, status)
}

#[tokio::test]
async fn username_password_authentication() {
    let echo = echo_server().await;
    let service = Socks5Service::new();
    service.add_user("admin", "password");
    let port = service
        .publish(Some("127.0.0.1"), 0, SessionConfig::default())
        .await
        .unwrap();

    let (mut client, status) = authenticate(port, "admin", "password").await;
    assert_eq!(status, vec![1, 0]);
    client.write_all(&connect_request(echo)).await.unwrap();
    assert_eq!(read_exactly(&mut client, 10).await[1], 0);

    let (mut client, status) = authenticate(port, "admin", "wrong").await;
    assert_eq!(status, vec![1, 0xFF]);
    let mut buf = [0u8; 1];
    let n = timeout(Duration::from_secs(5), client.read(&mut buf))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0);
}

#[tokio::test]
async fn encrypted_and_compressed_listener() {
    let echo = echo_server().await;
    let key = b"correct horse battery staple".to_vec();
    let service = Socks5Service::new();
    let config = SessionConfig::default()
        .with_key(key.clone())
        .with_compression(true);
    let port = service.publish(Some("127.0.0.1"), 0, config).await.unwrap();

    let mut client = connect(port).await;
    let seed = read_exactly(&mut client, 4).await;
    let seed = u32::from_le_bytes([seed[0], seed[1], seed[2], seed[3]]);
    let mut pipe = stage::pipeline(Some(key.as_slice()), seed, true).unwrap().unwrap();

    let mut request = vec![5, 1, 0];
    request.extend(connect_request(echo));
    client
        .write_all(&pipe.encrypt(request).unwrap())
        .await
        .unwrap();

    let payload: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
    client
        .write_all(&pipe.encrypt(payload.clone()).unwrap())
        .await
        .unwrap();

    let mut plain = Vec::new();
    let mut buf = vec![0u8; 8192];
    while plain.len() < 12 + payload.len() {
        let n = timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .expect("timed out")
            .unwrap();
        assert!(n > 0, "connection closed early");
        plain.extend(pipe.decrypt(buf[..n].to_vec()).unwrap());
    }
    assert_eq!(plain[..4], [5, 0, 5, 0]);
    assert_eq!(plain[12..], payload[..]);
}

#[tokio::test]
async fn full_duplex_bulk_transfer() {
    const TOTAL: usize = 32 * 1024 * 1024;

    let echo = echo_server().await;
    let service = Socks5Service::new();
    let port = service
        .publish(Some("127.0.0.1"), 0, SessionConfig::default())
        .await
        .unwrap();

    let mut client = connect(port).await;
    client.write_all(&[5, 1, 0]).await.unwrap();
    assert_eq!(read_exactly(&mut client, 2).await, vec![5, 0]);
    client.write_all(&connect_request(echo)).await.unwrap();
    assert_eq!(read_exactly(&mut client, 10).await[1], 0);

    let (mut rx, mut tx) = client.into_split();
    let writer = tokio::spawn(async move {
        let chunk: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
        for _ in 0..TOTAL / chunk.len() {
            tx.write_all(&chunk).await.unwrap();
        }
        tx
    });
    let reader = tokio::spawn(async move {
        let mut buf = vec![0u8; 64 * 1024];
        let mut received = 0;
        let mut position = 0usize;
        while received < TOTAL {
            let n = rx.read(&mut buf).await.unwrap();
            assert!(n > 0, "proxy closed after {} bytes", received);
            for &byte in &buf[..n] {
                assert_eq!(byte, (position % (64 * 1024) % 251) as u8);
                position += 1;
            }
            received += n;
        }
        received
    });

    let received = timeout(Duration::from_secs(60), reader)
        .await
        .expect("relay stalled")
        .unwrap();
    assert_eq!(received, TOTAL);
    writer.await.unwrap();
}

#[tokio::test]
async fn encrypted_output_is_drained_before_close() {
    const TOTAL: usize = 300 * 1024;

    let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target_port = target.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut stream, _) = target.accept().await.unwrap();
        let payload: Vec<u8> = (0..TOTAL).map(|i| (i % 253) as u8).collect();
        stream.write_all(&payload).await.unwrap();
    });

    let key = b"drain key".to_vec();
    let service = Socks5Service::new();
    let port = service
        .publish(Some("127.0.0.1"), 0, SessionConfig::default().with_key(key.clone()))
        .await
        .unwrap();

    let mut client = connect(port).await;
    let seed = read_exactly(&mut client, 4).await;
    let seed = u32::from_le_bytes([seed[0], seed[1], seed[2], seed[3]]);
    let mut pipe = stage::pipeline(Some(key.as_slice()), seed, false).unwrap().unwrap();

    let mut request = vec![5, 1, 0];
    request.extend(connect_request(target_port));
    client.write_all(&pipe.encrypt(request).unwrap()).await.unwrap();

    let mut plain = Vec::new();
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        let n = timeout(Duration::from_secs(10), client.read(&mut buf))
            .await
            .expect("timed out")
            .unwrap();
        if n == 0 {
            break;
        }
        plain.extend(pipe.decrypt(buf[..n].to_vec()).unwrap());
    }

    assert_eq!(plain[..2], [5, 0]);
    assert_eq!(plain[3], 0);
    let payload = &plain[12..];
    assert_eq!(payload.len(), TOTAL);
    assert!(payload.iter().enumerate().all(|(i, &byte)| byte == (i % 253) as u8));
}
