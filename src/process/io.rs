use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::ChildStderr;
use tokio::sync::mpsc;

/// Writes each frame from `rx` as one line, until the channel closes
pub async fn write_lines<W>(writer: W, mut rx: mpsc::Receiver<Bytes>)
where
    W: AsyncWrite + Unpin,
{
    let mut writer = BufWriter::new(writer);
    while let Some(frame) = rx.recv().await {
        if let Err(e) = write_frame(&mut writer, &frame).await {
            log::error!(
                "error writing frame: {}. Frame was: {}",
                e,
                String::from_utf8_lossy(&frame)
            );
            break;
        }
    }
    let _ = writer.shutdown().await;
}

/// Forwards each non-empty line read from `reader` to `tx`, until end of input.
///
/// Lines are passed on as raw bytes; invalid UTF-8 is left for the codec to reject.
pub async fn read_lines<R>(reader: R, tx: mpsc::Sender<Bytes>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(n) if should_stop(n) => break,
            Ok(_) => {}
            Err(e) => {
                log::error!("error reading line: {}", e);
                break;
            }
        }
        let trimmed = trim_ascii(&line);
        if trimmed.is_empty() {
            continue;
        }
        if tx.send(Bytes::copy_from_slice(trimmed)).await.is_err() {
            log::debug!("line receiver dropped, stopping reader");
            break;
        }
    }
}

/// Surfaces a child's stderr through the log
pub async fn handle_stderr(stderr: ChildStderr) {
    let mut reader = BufReader::new(stderr);
    let mut line = Vec::new();
    while let Ok(n) = reader.read_until(b'\n', &mut line).await {
        if should_stop(n) {
            break;
        }
        log::debug!("[child stderr] {}", String::from_utf8_lossy(trim_ascii(&line)));
        line.clear();
    }
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &bytes[start..end]
}

async fn write_frame<W>(writer: &mut BufWriter<W>, frame: &[u8]) -> tokio::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

fn should_stop(n: usize) -> bool {
    n == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_read_lines_skips_blank_lines() {
        let input = tokio_test::io::Builder::new()
            .read(b"first\n\n  \nsecond\r\n")
            .build();
        let (tx, mut rx) = mpsc::channel(8);
        read_lines(input, tx).await;

        assert_eq!(rx.recv().await, Some(Bytes::from_static(b"first")));
        assert_eq!(rx.recv().await, Some(Bytes::from_static(b"second")));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_read_lines_survives_invalid_utf8() {
        let input = tokio_test::io::Builder::new()
            .read(b"\xff\xfe garbage\n")
            .read(b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"ping\"}\n")
            .build();
        let (tx, mut rx) = mpsc::channel(8);
        read_lines(input, tx).await;

        assert_eq!(rx.recv().await, Some(Bytes::from_static(b"\xff\xfe garbage")));
        assert_eq!(
            rx.recv().await,
            Some(Bytes::from_static(b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"ping\"}"))
        );
        assert_eq!(rx.recv().await, None);
    }

    #[test]
    fn test_trim_ascii() {
        assert_eq!(trim_ascii(b"  a b\r\n"), b"a b");
        assert_eq!(trim_ascii(b" \t\r\n"), b"");
        assert_eq!(trim_ascii(b""), b"");
    }

    #[tokio::test]
    async fn test_write_lines_appends_newlines() {
        let (ours, mut theirs) = tokio::io::duplex(64);
        let (tx, rx) = mpsc::channel(8);
        let writer = tokio::spawn(write_lines(ours, rx));

        tx.send(Bytes::from_static(b"{\"a\":1}")).await.unwrap();
        tx.send(Bytes::from_static(b"{\"b\":2}")).await.unwrap();
        drop(tx);
        writer.await.unwrap();

        let mut written = String::new();
        theirs.read_to_string(&mut written).await.unwrap();
        assert_eq!(written, "{\"a\":1}\n{\"b\":2}\n");
    }
}
