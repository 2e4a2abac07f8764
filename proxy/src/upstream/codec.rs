//! The codec-client seam between the connection pool and HTTP codecs.
//!
//! Full codecs live outside this repository; the pool only needs stream
//! allocation, response-lifecycle events, and reset propagation. The
//! built-in HTTP/1 client pairs a client connection with a minimal response
//! scanner: status line, headers (for `Connection: close`), and a
//! content-length body.

use crate::connection::{
    Connection, ConnectionCloseType, ConnectionEvent, FilterStatus, ReadFilter, WeakConnection,
};
use crate::upstream::cluster::ClusterInfo;
use bytes::BytesMut;
use event::Dispatcher;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamResetReason {
    /// The connection failed or timed out before the stream was bound.
    ConnectionFailure,
    /// The upstream disconnected while the request was in flight.
    ConnectionTermination,
    LocalReset,
    /// Rejected at admission.
    Overflow,
}

/// Receives the response for one upstream stream.
pub trait ResponseDecoder {
    fn decode_headers(&mut self, status: u16, headers: Vec<(String, String)>, end_stream: bool);
    fn decode_data(&mut self, data: &[u8], end_stream: bool);
}

struct StreamState {
    connection: Option<WeakConnection>,
    reset_callbacks: Vec<Box<dyn FnMut(StreamResetReason)>>,
    reset: Option<StreamResetReason>,
}

/// Handle to an allocated upstream stream: encode request bytes, observe
/// resets.
#[derive(Clone)]
pub struct StreamHandle {
    inner: Rc<RefCell<StreamState>>,
}

impl StreamHandle {
    pub fn new() -> StreamHandle {
        Self::with_connection(None)
    }

    fn with_connection(connection: Option<WeakConnection>) -> StreamHandle {
        StreamHandle {
            inner: Rc::new(RefCell::new(StreamState {
                connection,
                reset_callbacks: Vec::new(),
                reset: None,
            })),
        }
    }

    /// Send request bytes on the stream's connection.
    pub fn write(&self, data: &[u8]) {
        let connection = self.inner.borrow().connection.clone();
        if let Some(connection) = connection.and_then(|weak| weak.upgrade()) {
            connection.write(data);
        }
    }

    pub fn add_reset_callback(&self, cb: impl FnMut(StreamResetReason) + 'static) {
        self.inner.borrow_mut().reset_callbacks.push(Box::new(cb));
    }

    pub fn reset_reason(&self) -> Option<StreamResetReason> {
        self.inner.borrow().reset
    }

    /// Fire reset callbacks exactly once.
    pub fn reset(&self, reason: StreamResetReason) {
        let mut callbacks = {
            let mut inner = self.inner.borrow_mut();
            if inner.reset.is_some() {
                return;
            }
            inner.reset = Some(reason);
            std::mem::take(&mut inner.reset_callbacks)
        };
        for cb in &mut callbacks {
            cb(reason);
        }
    }
}

impl Default for StreamHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecClientEvent {
    Connected,
    RemoteClose,
    LocalClose,
    ResponseComplete { saw_connection_close: bool },
}

/// Events flow from the codec client back to its pool through this sink.
/// Implementations must only enqueue: a sink call may arrive while the pool
/// is mid-dispatch.
pub type CodecClientEventSink = Rc<dyn Fn(CodecClientEvent)>;

/// One upstream connection plus its codec.
pub trait CodecClient {
    fn connect(&mut self);
    fn new_stream(&mut self, decoder: Box<dyn ResponseDecoder>) -> StreamHandle;
    fn close(&mut self);
    fn has_active_request(&self) -> bool;
}

/// Creates codec clients; the seam the pool tests mock.
pub trait CodecClientFactory {
    fn create(
        &mut self,
        dispatcher: &Rc<Dispatcher>,
        cluster: &Arc<ClusterInfo>,
        sink: CodecClientEventSink,
    ) -> Box<dyn CodecClient>;
}

/// Production factory for HTTP/1 upstreams.
#[derive(Default)]
pub struct Http1CodecClientFactory;

impl CodecClientFactory for Http1CodecClientFactory {
    fn create(
        &mut self,
        dispatcher: &Rc<Dispatcher>,
        cluster: &Arc<ClusterInfo>,
        sink: CodecClientEventSink,
    ) -> Box<dyn CodecClient> {
        Box::new(Http1CodecClient {
            dispatcher: dispatcher.clone(),
            cluster: cluster.clone(),
            sink,
            connection: None,
            shared: Rc::new(RefCell::new(Http1Shared {
                scanner: ResponseScanner::new(),
                decoder: None,
                stream: None,
            })),
        })
    }
}

struct Http1Shared {
    scanner: ResponseScanner,
    decoder: Option<Box<dyn ResponseDecoder>>,
    stream: Option<StreamHandle>,
}

struct Http1CodecClient {
    dispatcher: Rc<Dispatcher>,
    cluster: Arc<ClusterInfo>,
    sink: CodecClientEventSink,
    connection: Option<Connection>,
    shared: Rc<RefCell<Http1Shared>>,
}

impl CodecClient for Http1CodecClient {
    fn connect(&mut self) {
        match Connection::connect(&self.dispatcher, self.cluster.address) {
            Ok(connection) => {
                connection.set_read_buffer_limit(self.cluster.per_connection_buffer_limit);
                let sink = self.sink.clone();
                connection.add_connection_callbacks(move |event| {
                    sink(match event {
                        ConnectionEvent::Connected => CodecClientEvent::Connected,
                        ConnectionEvent::RemoteClose => CodecClientEvent::RemoteClose,
                        ConnectionEvent::LocalClose => CodecClientEvent::LocalClose,
                    });
                });
                connection.add_read_filter(Box::new(Http1ResponseFilter {
                    shared: self.shared.clone(),
                    connection: connection.downgrade(),
                    sink: self.sink.clone(),
                }));
                self.connection = Some(connection);
            }
            Err(e) => {
                warn!(cluster = %self.cluster.name, error = %e, "upstream connect failed");
                (self.sink)(CodecClientEvent::RemoteClose);
            }
        }
    }

    fn new_stream(&mut self, decoder: Box<dyn ResponseDecoder>) -> StreamHandle {
        let stream =
            StreamHandle::with_connection(self.connection.as_ref().map(|c| c.downgrade()));
        let mut shared = self.shared.borrow_mut();
        debug_assert!(shared.stream.is_none(), "http1 allows one stream at a time");
        shared.scanner.reset();
        shared.decoder = Some(decoder);
        shared.stream = Some(stream.clone());
        stream
    }

    fn close(&mut self) {
        if let Some(connection) = &self.connection {
            connection.close(ConnectionCloseType::NoFlush);
        }
    }

    fn has_active_request(&self) -> bool {
        self.shared.borrow().stream.is_some()
    }
}

struct Http1ResponseFilter {
    shared: Rc<RefCell<Http1Shared>>,
    connection: WeakConnection,
    sink: CodecClientEventSink,
}

impl ReadFilter for Http1ResponseFilter {
    fn on_data(&mut self, data: &mut BytesMut) -> FilterStatus {
        // Scan while holding the codec state, then deliver with it released
        // so the pool can immediately bind another stream to this client.
        let scanned = self.shared.borrow_mut().scanner.scan(data);
        let deliveries = match scanned {
            Ok(deliveries) => deliveries,
            Err(e) => {
                debug!(error = %e, "upstream response parse error");
                if let Some(connection) = self.connection.upgrade() {
                    connection.close(ConnectionCloseType::NoFlush);
                }
                return FilterStatus::StopIteration;
            }
        };

        let mut decoder = self.shared.borrow_mut().decoder.take();
        let mut completed = None;
        for delivery in deliveries {
            match delivery {
                Delivery::Headers {
                    status,
                    headers,
                    end_stream,
                } => {
                    if let Some(decoder) = decoder.as_mut() {
                        decoder.decode_headers(status, headers, end_stream);
                    }
                }
                Delivery::Data { data, end_stream } => {
                    if let Some(decoder) = decoder.as_mut() {
                        decoder.decode_data(&data, end_stream);
                    }
                }
                Delivery::Complete {
                    saw_connection_close,
                } => {
                    completed = Some(saw_connection_close);
                }
            }
        }

        let mut shared = self.shared.borrow_mut();
        if let Some(saw_connection_close) = completed {
            shared.stream = None;
            drop(shared);
            drop(decoder);
            (self.sink)(CodecClientEvent::ResponseComplete {
                saw_connection_close,
            });
        } else {
            shared.decoder = decoder;
        }

        FilterStatus::Continue
    }
}

enum Delivery {
    Headers {
        status: u16,
        headers: Vec<(String, String)>,
        end_stream: bool,
    },
    Data {
        data: Vec<u8>,
        end_stream: bool,
    },
    Complete {
        saw_connection_close: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    StatusLine,
    Headers,
    Body,
    Done,
}

/// Incremental HTTP/1 response scanner: just enough framing for the pool.
/// Responses without a content length complete on connection close.
struct ResponseScanner {
    state: ScanState,
    status: u16,
    headers: Vec<(String, String)>,
    saw_connection_close: bool,
    remaining_body: Option<u64>,
}

impl ResponseScanner {
    fn new() -> ResponseScanner {
        ResponseScanner {
            state: ScanState::StatusLine,
            status: 0,
            headers: Vec::new(),
            saw_connection_close: false,
            remaining_body: None,
        }
    }

    fn reset(&mut self) {
        *self = ResponseScanner::new();
    }

    fn scan(&mut self, data: &mut BytesMut) -> Result<Vec<Delivery>, ScanError> {
        let mut out = Vec::new();
        loop {
            match self.state {
                ScanState::StatusLine => {
                    let Some(line) = take_line(data)? else {
                        break;
                    };
                    self.status = parse_status_line(&line)?;
                }
                ScanState::Headers => {
                    let Some(line) = take_line(data)? else {
                        break;
                    };
                    if line.is_empty() {
                        let end_stream = self.remaining_body.unwrap_or(1) == 0;
                        out.push(Delivery::Headers {
                            status: self.status,
                            headers: std::mem::take(&mut self.headers),
                            end_stream,
                        });
                        if end_stream {
                            out.push(Delivery::Complete {
                                saw_connection_close: self.saw_connection_close,
                            });
                            self.finish_response();
                        } else {
                            self.state = ScanState::Body;
                        }
                        continue;
                    }
                    self.push_header(&line)?;
                    continue;
                }
                ScanState::Body => {
                    if data.is_empty() {
                        break;
                    }
                    let take = match self.remaining_body {
                        Some(remaining) => (remaining as usize).min(data.len()),
                        None => data.len(),
                    };
                    let chunk = data.split_to(take);
                    let end_stream = match self.remaining_body.as_mut() {
                        Some(remaining) => {
                            *remaining -= take as u64;
                            *remaining == 0
                        }
                        None => false,
                    };
                    out.push(Delivery::Data {
                        data: chunk.to_vec(),
                        end_stream,
                    });
                    if end_stream {
                        out.push(Delivery::Complete {
                            saw_connection_close: self.saw_connection_close,
                        });
                        self.finish_response();
                    }
                    continue;
                }
                ScanState::Done => break,
            }

            // StatusLine parsed; fall into headers.
            self.state = ScanState::Headers;
        }
        Ok(out)
    }

    fn finish_response(&mut self) {
        // Ready for the next response on a kept-alive connection.
        self.reset();
    }

    fn push_header(&mut self, line: &[u8]) -> Result<(), ScanError> {
        let text = std::str::from_utf8(line).map_err(|_| ScanError::BadHeader)?;
        let (name, value) = text.split_once(':').ok_or(ScanError::BadHeader)?;
        let name = name.trim().to_string();
        let value = value.trim().to_string();

        if name.eq_ignore_ascii_case("connection") && value.eq_ignore_ascii_case("close") {
            self.saw_connection_close = true;
        }
        if name.eq_ignore_ascii_case("content-length") {
            let length: u64 = value.parse().map_err(|_| ScanError::BadContentLength)?;
            self.remaining_body = Some(length);
        }

        self.headers.push((name, value));
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
enum ScanError {
    #[error("malformed status line")]
    BadStatusLine,
    #[error("malformed header line")]
    BadHeader,
    #[error("malformed content-length")]
    BadContentLength,
    #[error("header section too long")]
    TooLong,
}

const MAX_LINE: usize = 16384;

fn take_line(data: &mut BytesMut) -> Result<Option<Vec<u8>>, ScanError> {
    match data.windows(2).position(|w| w == b"\r\n") {
        Some(pos) => {
            let line = data.split_to(pos).to_vec();
            let _ = data.split_to(2);
            Ok(Some(line))
        }
        None if data.len() > MAX_LINE => Err(ScanError::TooLong),
        None => Ok(None),
    }
}

fn parse_status_line(line: &[u8]) -> Result<u16, ScanError> {
    let text = std::str::from_utf8(line).map_err(|_| ScanError::BadStatusLine)?;
    let mut parts = text.split(' ');
    let version = parts.next().ok_or(ScanError::BadStatusLine)?;
    if !version.starts_with("HTTP/1.") {
        return Err(ScanError::BadStatusLine);
    }
    parts
        .next()
        .and_then(|code| code.parse().ok())
        .ok_or(ScanError::BadStatusLine)
}
