#![cfg(unix)]

use bytes::Bytes;
use futures::StreamExt;
use mcp_engine::{
    process::ProcessManager,
    transport::{StdioTransport, Transport},
};
use tokio::time::{sleep, timeout, Duration};

/// Get the current number of open file descriptors for this process
fn get_fd_count() -> Option<usize> {
    // On Linux, /proc/self/fd contains links to all open file descriptors
    std::fs::read_dir("/proc/self/fd")
        .ok()
        .map(|entries| entries.count())
}

/// Child processes are reaped and their pipes closed on shutdown
#[tokio::test]
async fn test_process_cleanup() {
    let initial_fd_count = get_fd_count().unwrap_or(0);

    for i in 0..5 {
        let mut pm = ProcessManager::new();
        let (output_tx, _output_rx) = tokio::sync::mpsc::channel(100);

        let mut command = tokio::process::Command::new("echo");
        command.arg("Hello from process").arg(i.to_string());

        let _process_tx = pm
            .start_process(command, output_tx)
            .await
            .expect("Failed to start process");

        sleep(Duration::from_millis(100)).await;
        pm.shutdown().await;
        assert!(!pm.is_running());
    }

    sleep(Duration::from_millis(500)).await;

    let final_fd_count = get_fd_count().unwrap_or(0);
    assert!(
        final_fd_count <= initial_fd_count + 10,
        "File descriptor leak detected: initial={}, final={}",
        initial_fd_count,
        final_fd_count
    );
}

/// A spawned child speaks newline-delimited frames and dies with the transport
#[tokio::test]
async fn test_spawned_transport_roundtrip_and_close() {
    let transport = StdioTransport::spawn(tokio::process::Command::new("cat"))
        .await
        .expect("Failed to spawn cat");
    let mut inbound = transport.receive();

    let frame = Bytes::from_static(br#"{"jsonrpc":"2.0","method":"ping","id":1}"#);
    transport.send(frame.clone()).await.unwrap();

    let echoed = timeout(Duration::from_secs(2), inbound.next())
        .await
        .expect("no frame echoed back")
        .expect("stream ended early")
        .unwrap();
    assert_eq!(echoed, frame);

    transport.close().await.unwrap();
    transport.close().await.unwrap();
    assert!(transport.send(frame).await.is_err());

    let end = timeout(Duration::from_secs(2), inbound.next())
        .await
        .expect("stream did not end after close");
    assert!(end.is_none());
}

/// Stress test to verify no file descriptor leaks under load
#[tokio::test]
async fn test_no_fd_leak_under_load() {
    let initial_fd_count = get_fd_count().unwrap_or(0);

    for round in 0..10 {
        for i in 0..5 {
            let mut command = tokio::process::Command::new("echo");
            command.arg(format!("test-{}-{}", round, i));

            if let Ok(transport) = StdioTransport::spawn(command).await {
                sleep(Duration::from_millis(10)).await;
                transport.close().await.unwrap();
            }
        }
    }

    sleep(Duration::from_millis(500)).await;

    let final_fd_count = get_fd_count().unwrap_or(0);
    assert!(
        final_fd_count <= initial_fd_count + 20,
        "Stress test file descriptor leak detected: initial={}, final={}",
        initial_fd_count,
        final_fd_count
    );
}
