//! Per-connection state machine and dispatch (§3.5, §4.7).
//!
//! Tokio gives each connection its own task instead of a shared readiness
//! loop; the `NEED_HEADER`/`NEED_KEY` vocabulary still describes what each
//! iteration of the loop below does, it is just that `read_exact` absorbs
//! the partial-read bookkeeping a raw readiness-based loop would have to
//! track by hand.

use std::io::{self, IoSlice};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use catalog::Catalog;
use protocol::wire::{encode_length_prefix, parse_header, Action, HEADER_SIZE};
use protocol::QUIT_ACK;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tracing::warn;

/// Delay between writing the QUIT farewell and closing the socket, long
/// enough for a pipelined client's read to observe it (spec §4.7.1,
/// `SPEC_FULL.md`'s graceful-shutdown grace window).
const QUIT_GRACE: Duration = Duration::from_millis(50);

enum ResponseBody {
    /// Already wire-ready: a 4-byte big-endian length followed by the
    /// payload, taken verbatim from arena storage. No extra framing.
    Framed(Bytes),
    /// Raw payload; the connection adds the 4-byte length prefix.
    Unframed(Bytes),
    /// Zero-length payload (`FETCH` miss or an oversized, discarded key).
    Miss,
}

pub struct ConnectionHandler {
    catalog: Arc<Catalog>,
    max_key_len: u32,
    read_chunk: usize,
    write_chunk: usize,
    /// Notified on QUIT so the owning `Engine`'s accept loops stop and no
    /// further connections are accepted (spec §4.5, §5, §8 scenario 6).
    engine_stop: Arc<Notify>,
    /// Notified alongside `engine_stop` so the background refresh worker
    /// winds down as part of the same QUIT-triggered shutdown.
    cron_stop: Arc<Notify>,
}

impl ConnectionHandler {
    pub fn new(catalog: Arc<Catalog>, engine_stop: Arc<Notify>, cron_stop: Arc<Notify>) -> Self {
        let caps = &catalog.config().caps;
        let max_key_len = caps.max_key_len;
        let read_chunk = caps.read_buf_small.max(1) as usize;
        let write_chunk = caps.write_buf_max.max(1) as usize;
        ConnectionHandler {
            catalog,
            max_key_len,
            read_chunk,
            write_chunk,
            engine_stop,
            cron_stop,
        }
    }

    /// Drives one connection until it closes (protocol error, I/O error,
    /// or QUIT). Never panics on malformed input; every error path closes
    /// the connection per spec §7.
    pub async fn handle<S>(&self, mut stream: S, peer: &str)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let mut header_buf = [0u8; HEADER_SIZE];
            if let Err(e) = stream.read_exact(&mut header_buf).await {
                if e.kind() != io::ErrorKind::UnexpectedEof {
                    warn!(peer, error = %e, "io error reading request header");
                }
                return;
            }

            let header = match parse_header(&header_buf) {
                Ok(h) => h,
                Err(e) => {
                    warn!(peer, error = %e, "protocol error, closing connection");
                    return;
                }
            };

            if header.key_len > self.max_key_len {
                if let Err(e) = discard_bytes(&mut stream, header.key_len as u64, self.read_chunk).await {
                    warn!(peer, error = %e, "io error discarding oversized key");
                    return;
                }
                if let Err(e) = write_response(&mut stream, &ResponseBody::Miss, self.write_chunk).await {
                    warn!(peer, error = %e, "io error writing response");
                    return;
                }
                continue;
            }

            let mut key = vec![0u8; header.key_len as usize];
            if let Err(e) = stream.read_exact(&mut key).await {
                warn!(peer, error = %e, "io error reading key");
                return;
            }

            let response = self.dispatch(header.action, header.table_id, header.index_id, &key);
            if let Err(e) = write_response(&mut stream, &response, self.write_chunk).await {
                warn!(peer, error = %e, "io error writing response");
                return;
            }

            if matches!(header.action, Action::Quit) {
                tokio::time::sleep(QUIT_GRACE).await;
                // QUIT is a full shutdown trigger, not just this socket's
                // close (spec §4.5, §5, §8 scenario 6): wake every accept
                // loop and the cron worker so the whole process winds down.
                self.engine_stop.notify_waiters();
                self.cron_stop.notify_one();
                return;
            }
        }
    }

    fn dispatch(&self, action: Action, table_id: u8, index_id: u8, key: &[u8]) -> ResponseBody {
        match action {
            Action::Fetch => match self.catalog.fetch(table_id, index_id, key) {
                Some(hit) => ResponseBody::Framed(hit.payload),
                None => ResponseBody::Miss,
            },
            Action::DescribeSchema => ResponseBody::Unframed(self.catalog.schema_json()),
            Action::Stats => match self.catalog.stats_json() {
                Ok(bytes) => ResponseBody::Unframed(bytes),
                Err(e) => {
                    warn!(error = %e, "failed to build stats document");
                    ResponseBody::Unframed(Bytes::from_static(br#"{"error":"stats unavailable"}"#))
                }
            },
            Action::Quit => ResponseBody::Unframed(Bytes::from_static(QUIT_ACK)),
        }
    }
}

async fn discard_bytes<S: AsyncRead + Unpin>(stream: &mut S, mut remaining: u64, chunk_size: usize) -> io::Result<()> {
    let mut scratch = vec![0u8; chunk_size];
    while remaining > 0 {
        let chunk = remaining.min(scratch.len() as u64) as usize;
        stream.read_exact(&mut scratch[..chunk]).await?;
        remaining -= chunk as u64;
    }
    Ok(())
}

async fn write_response<S: AsyncWrite + Unpin>(stream: &mut S, resp: &ResponseBody, max_chunk: usize) -> io::Result<()> {
    match resp {
        ResponseBody::Framed(payload) => write_vectored_all(stream, &[], payload, max_chunk).await,
        ResponseBody::Unframed(payload) => {
            let header = encode_length_prefix(payload.len() as u32);
            write_vectored_all(stream, &header, payload, max_chunk).await
        }
        ResponseBody::Miss => stream.write_all(&[0u8; 4]).await,
    }
}

/// Gather-writes `header` followed by `payload` in as few syscalls as
/// `write_vectored` allows, retrying on short writes (spec §4.7.2), and
/// never presenting more than `max_chunk` bytes to a single syscall so the
/// configured `write_buf_max` cap (spec §5) is a real ceiling rather than
/// an unenforced knob.
async fn write_vectored_all<S: AsyncWrite + Unpin>(
    stream: &mut S,
    header: &[u8],
    payload: &[u8],
    max_chunk: usize,
) -> io::Result<()> {
    let max_chunk = max_chunk.max(header.len()).max(1);
    let mut header_remaining = header;
    let mut payload_remaining = payload;
    while !header_remaining.is_empty() || !payload_remaining.is_empty() {
        let payload_budget = max_chunk.saturating_sub(header_remaining.len());
        let payload_chunk = &payload_remaining[..payload_remaining.len().min(payload_budget)];
        let slices: Vec<IoSlice> = if !header_remaining.is_empty() {
            vec![IoSlice::new(header_remaining), IoSlice::new(payload_chunk)]
        } else {
            vec![IoSlice::new(payload_chunk)]
        };
        let mut n = stream.write_vectored(&slices).await?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "write_vectored wrote 0 bytes"));
        }
        if !header_remaining.is_empty() {
            let take = n.min(header_remaining.len());
            header_remaining = &header_remaining[take..];
            n -= take;
        }
        if n > 0 {
            let take = n.min(payload_remaining.len());
            payload_remaining = &payload_remaining[take..];
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use common::config::{Config, DbConfig, IndexSpec, KeyType, ListenConfig, ResourceCaps, TableSpec};
    use protocol::wire::{encode_length_prefix, PROTOCOL_VERSION};
    use std::io::Cursor;

    fn sample_config() -> Config {
        Config {
            db: DbConfig {
                driver: "mysql".to_string(),
                dsn: "mysql://localhost/app".to_string(),
            },
            listen: ListenConfig {
                tcp_host: None,
                tcp_port: Some(0),
                unix_path: None,
                backlog: 128,
            },
            default_refresh_period_seconds: 30,
            cron_period_seconds: 5,
            strip_nulls: false,
            caps: ResourceCaps::default(),
            tables: vec![TableSpec {
                name: "accounts".to_string(),
                id: 0,
                period_seconds: 30,
                select_text: "select id from accounts".to_string(),
                indexes: vec![IndexSpec {
                    id: 0,
                    column: "id".to_string(),
                    key_type: KeyType::Int,
                }],
            }],
        }
    }

    fn new_handler(catalog: Arc<Catalog>) -> ConnectionHandler {
        ConnectionHandler::new(catalog, Arc::new(Notify::new()), Arc::new(Notify::new()))
    }

    fn request(action: u8, table_id: u8, index_id: u8, key: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + key.len());
        buf.push(PROTOCOL_VERSION);
        buf.push(action);
        buf.push(table_id);
        buf.push(index_id);
        buf.extend_from_slice(&encode_length_prefix(key.len() as u32));
        buf.extend_from_slice(key);
        buf
    }

    struct DuplexMock {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl AsyncRead for DuplexMock {
        fn poll_read(
            mut self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<io::Result<()>> {
            std::pin::Pin::new(&mut self.input).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for DuplexMock {
        fn poll_write(
            mut self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &[u8],
        ) -> std::task::Poll<io::Result<usize>> {
            self.output.extend_from_slice(buf);
            std::task::Poll::Ready(Ok(buf.len()))
        }
        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }
        fn poll_shutdown(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn unknown_key_fetch_returns_zero_length_response() {
        let catalog = Arc::new(Catalog::new(sample_config()).unwrap());
        let handler = new_handler(catalog);
        let input = request(b'F', 0, 0, &1i32.to_le_bytes());
        let mut conn = DuplexMock {
            input: Cursor::new(input),
            output: Vec::new(),
        };
        handler.handle(&mut conn, "test").await;
        assert_eq!(conn.output, vec![0u8, 0, 0, 0]);
    }

    #[tokio::test]
    async fn describe_schema_returns_length_prefixed_json() {
        let catalog = Arc::new(Catalog::new(sample_config()).unwrap());
        let handler = new_handler(catalog);
        let input = request(b'D', 0, 0, b"");
        let mut conn = DuplexMock {
            input: Cursor::new(input),
            output: Vec::new(),
        };
        handler.handle(&mut conn, "test").await;
        let len = u32::from_be_bytes(conn.output[0..4].try_into().unwrap()) as usize;
        let body: serde_json::Value = serde_json::from_slice(&conn.output[4..4 + len]).unwrap();
        assert_eq!(body["tables"][0]["name"], "accounts");
    }

    #[tokio::test]
    async fn oversized_key_is_discarded_and_connection_stays_open() {
        let mut cfg = sample_config();
        cfg.caps.max_key_len = 4;
        let catalog = Arc::new(Catalog::new(cfg).unwrap());
        let handler = new_handler(catalog);

        let mut input = request(b'F', 0, 0, &[0u8; 16]);
        input.extend_from_slice(&request(b'F', 0, 0, &1i32.to_le_bytes()));
        let mut conn = DuplexMock {
            input: Cursor::new(input),
            output: Vec::new(),
        };
        handler.handle(&mut conn, "test").await;
        assert_eq!(&conn.output[0..4], &[0u8, 0, 0, 0]);
        assert_eq!(&conn.output[4..8], &[0u8, 0, 0, 0]);
    }

    #[tokio::test]
    async fn quit_returns_farewell_then_closes() {
        let catalog = Arc::new(Catalog::new(sample_config()).unwrap());
        let handler = new_handler(catalog);
        let input = request(b'q', 0, 0, b"");
        let mut conn = DuplexMock {
            input: Cursor::new(input),
            output: Vec::new(),
        };
        handler.handle(&mut conn, "test").await;
        let len = u32::from_be_bytes(conn.output[0..4].try_into().unwrap()) as usize;
        assert_eq!(&conn.output[4..4 + len], QUIT_ACK);
    }

    #[tokio::test]
    async fn quit_notifies_engine_and_cron_stop_handles() {
        let catalog = Arc::new(Catalog::new(sample_config()).unwrap());
        let engine_stop = Arc::new(Notify::new());
        let cron_stop = Arc::new(Notify::new());
        let handler = ConnectionHandler::new(catalog, engine_stop.clone(), cron_stop.clone());

        let engine_notified = engine_stop.notified();
        let cron_notified = cron_stop.notified();
        tokio::pin!(engine_notified);
        tokio::pin!(cron_notified);

        let input = request(b'q', 0, 0, b"");
        let mut conn = DuplexMock {
            input: Cursor::new(input),
            output: Vec::new(),
        };
        handler.handle(&mut conn, "test").await;

        tokio::time::timeout(Duration::from_secs(1), &mut engine_notified)
            .await
            .expect("engine stop handle should be notified after QUIT");
        tokio::time::timeout(Duration::from_secs(1), &mut cron_notified)
            .await
            .expect("cron stop handle should be notified after QUIT");
    }

    #[tokio::test]
    async fn write_vectored_all_honors_small_chunk_cap() {
        let mut conn = DuplexMock {
            input: Cursor::new(Vec::new()),
            output: Vec::new(),
        };
        let header = encode_length_prefix(10);
        let payload = vec![7u8; 10];
        write_vectored_all(&mut conn, &header, &payload, 3).await.unwrap();
        assert_eq!(conn.output.len(), header.len() + payload.len());
        assert_eq!(&conn.output[4..], payload.as_slice());
    }
}
