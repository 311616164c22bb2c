//! End-to-end echo scenario: a listener with a pass-through pipeline
//! must return every byte and close cleanly with the client.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task::LocalSet;

use sluice_engine::{Configuration, ExportRegistry, ListenConfig, Worker};

#[tokio::test]
async fn test_echo_listener_round_trip() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let mut cfg = Configuration::new("echo");
            cfg.listen("127.0.0.1:0", ListenConfig::default()).pass();
            let bindings = cfg.bind(&mut ExportRegistry::new()).unwrap();

            let worker = Worker::start(bindings).unwrap();
            let addr = worker.listeners()[0].bound_addr().unwrap();

            let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
            client.write_all(b"hello").await.unwrap();

            let mut buf = [0u8; 16];
            let n = client.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"hello");

            // Client half-closes; the echo pipeline ends and the
            // server closes its side.
            client.shutdown().await.unwrap();
            let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
                .await
                .expect("server should close after EOF")
                .unwrap();
            assert_eq!(n, 0, "clean EOF after close");
        })
        .await;
}

#[tokio::test]
async fn test_echo_two_sequential_clients() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let mut cfg = Configuration::new("echo");
            cfg.listen("127.0.0.1:0", ListenConfig::default()).pass();
            let bindings = cfg.bind(&mut ExportRegistry::new()).unwrap();
            let worker = Worker::start(bindings).unwrap();
            let addr = worker.listeners()[0].bound_addr().unwrap();

            for payload in [&b"first"[..], &b"second"[..]] {
                let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
                client.write_all(payload).await.unwrap();
                let mut buf = vec![0u8; payload.len()];
                client.read_exact(&mut buf).await.unwrap();
                assert_eq!(buf, payload);
            }
        })
        .await;
}
