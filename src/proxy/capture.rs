use crate::events::PayloadCapture;
use crate::proxy::BoxBody;
use bytes::Bytes;
use hyper::body::{Body, Frame};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Serialize headers to canonical wire form, one `Name: value\r\n` line per
/// entry, in map order.
pub fn serialize_headers(headers: &http::HeaderMap) -> Vec<u8> {
    let mut out = Vec::with_capacity(headers_wire_len(headers) as usize);
    for (name, value) in headers {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out
}

/// Approximate wire length of a header block (`Name: value\r\n` per entry).
pub fn headers_wire_len(headers: &http::HeaderMap) -> u64 {
    headers
        .iter()
        .map(|(n, v)| n.as_str().len() as u64 + 2 + v.as_bytes().len() as u64 + 2)
        .sum()
}

/// Byte sink that records up to `cap` bytes (`-1` = unbounded) while
/// tracking the true total length.
pub struct CaptureBuffer {
    cap: i64,
    buf: Mutex<Vec<u8>>,
    total: AtomicU64,
}

impl CaptureBuffer {
    pub fn new(cap: i64) -> Arc<Self> {
        Arc::new(Self {
            cap,
            buf: Mutex::new(Vec::new()),
            total: AtomicU64::new(0),
        })
    }

    /// Seed a buffer with an already-materialized payload (header blocks).
    pub fn from_bytes(cap: i64, data: &[u8]) -> Arc<Self> {
        let buf = Self::new(cap);
        buf.record(data);
        buf
    }

    pub fn record(&self, data: &[u8]) {
        self.total.fetch_add(data.len() as u64, Ordering::AcqRel);
        let mut buf = self.buf.lock().unwrap();
        if self.cap < 0 {
            buf.extend_from_slice(data);
            return;
        }
        let room = (self.cap as usize).saturating_sub(buf.len());
        if room > 0 {
            buf.extend_from_slice(&data[..data.len().min(room)]);
        }
    }

    /// Drain into the final capture record.
    pub fn take(&self) -> PayloadCapture {
        let bytes = std::mem::take(&mut *self.buf.lock().unwrap());
        let total_len = self.total.load(Ordering::Acquire);
        PayloadCapture {
            truncated: total_len > bytes.len() as u64,
            bytes,
            total_len,
        }
    }
}

/// How a proxied body ended, as observed by [`ObservedBody`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyEnd {
    /// All frames delivered.
    Complete,
    /// The underlying stream failed mid-body.
    Error,
    /// The body was dropped before completion (client went away).
    Dropped,
}

type EndHook = Box<dyn FnOnce(BodyEnd) + Send + Sync>;

/// Pass-through body wrapper: counts data bytes into an atomic, optionally
/// records them into a capture buffer, and reports how the stream ended.
/// Every byte is forwarded to the consumer untouched.
pub struct ObservedBody {
    inner: BoxBody,
    counter: Option<Arc<AtomicU64>>,
    capture: Option<Arc<CaptureBuffer>>,
    on_end: Option<EndHook>,
}

impl ObservedBody {
    pub fn new(
        inner: BoxBody,
        counter: Option<Arc<AtomicU64>>,
        capture: Option<Arc<CaptureBuffer>>,
        on_end: Option<EndHook>,
    ) -> Self {
        Self {
            inner,
            counter,
            capture,
            on_end,
        }
    }
}

impl Body for ObservedBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = &mut *self;
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    if let Some(ref counter) = this.counter {
                        counter.fetch_add(data.len() as u64, Ordering::AcqRel);
                    }
                    if let Some(ref capture) = this.capture {
                        capture.record(data);
                    }
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => {
                if let Some(hook) = this.on_end.take() {
                    hook(BodyEnd::Error);
                }
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                if let Some(hook) = this.on_end.take() {
                    hook(BodyEnd::Complete);
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> hyper::body::SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for ObservedBody {
    fn drop(&mut self) {
        if let Some(hook) = self.on_end.take() {
            hook(BodyEnd::Dropped);
        }
    }
}

/// Bidirectional stream wrapper that tallies reads and writes into shared
/// per-request counters. Used on CONNECT tunnels and 101 upgrade bridges,
/// where reads are upstream→client (ingress) and writes client→upstream
/// (egress).
pub struct TallyStream<S> {
    inner: S,
    read_counter: Arc<AtomicU64>,
    write_counter: Arc<AtomicU64>,
}

impl<S> TallyStream<S> {
    pub fn new(inner: S, read_counter: Arc<AtomicU64>, write_counter: Arc<AtomicU64>) -> Self {
        Self {
            inner,
            read_counter,
            write_counter,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for TallyStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        let res = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = res {
            let n = buf.filled().len() - before;
            if n > 0 {
                self.read_counter.fetch_add(n as u64, Ordering::AcqRel);
            }
        }
        res
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TallyStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let res = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = res {
            if n > 0 {
                self.write_counter.fetch_add(n as u64, Ordering::AcqRel);
            }
        }
        res
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
