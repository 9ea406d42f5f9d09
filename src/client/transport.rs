//! The callback-driven framed transport consumed by the connection layer,
//! plus the two built-in implementations: an in-memory pair for tests and a
//! plain framed-TCP provider.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, unbounded};

use crate::client::frame::{FrameDecoder, encode_frame};

/// Where a transport should connect to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportEndpoint {
    pub address: String,
    pub port: u16,
    pub http_path: String,
    /// Offered sub-protocols, ordered highest version first.
    pub subprotocols: Vec<String>,
    pub is_ssl: bool,
}

/// Classification of a transport close event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportCloseKind {
    Normal,
    ResolveFailed,
    ConnectionFailed,
    ReadError,
    WriteError,
    ProtocolError,
    MessageTooBig,
    TlsHandshakeFailed,
    Unauthorized,
    Forbidden,
    MovedPermanently,
    ClientTooOld,
    ClientTooNew,
    ProtocolMismatch,
    InternalServerError,
    AbnormalClosure,
    RetryError,
}

/// Receives transport events. Implementations forward into the client's
/// event loop; callbacks may arrive on arbitrary threads.
pub trait TransportObserver: Send {
    fn transport_connected(&mut self, subprotocol: &str);
    fn frame_received(&mut self, data: &[u8]);
    fn transport_error(&mut self);
    fn transport_closed(&mut self, was_clean: bool, kind: TransportCloseKind, reason: &str);
}

pub type WriteCompletion = Box<dyn FnOnce() + Send>;

/// One live transport. Dropping it tears the link down.
pub trait Transport: Send {
    /// Queue a frame for writing; `completion` runs once the write has been
    /// handed to the network.
    fn write_frame(&mut self, frame: Vec<u8>, completion: WriteCompletion);
}

pub trait TransportProvider: Send + Sync {
    fn connect(
        &self,
        endpoint: TransportEndpoint,
        observer: Box<dyn TransportObserver>,
    ) -> Box<dyn Transport>;
}

/// Shared flag between a connection and its outstanding transport
/// callbacks. Once the connection tears the transport down, late callbacks
/// observe the destroyed marker and short-circuit.
#[derive(Clone, Debug, Default)]
pub struct LifecycleSentinel {
    destroyed: Arc<AtomicBool>,
}

impl LifecycleSentinel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn destroy(&self) {
        self.destroyed.store(true, Ordering::Release);
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }
}

// ---------------------------------------------------------------------------
// In-memory transport pair
// ---------------------------------------------------------------------------

type SharedObserver = Arc<Mutex<Box<dyn TransportObserver>>>;

/// Server half of an in-memory connection, handed to the test harness for
/// every `connect()` call on the provider.
pub struct MemoryServerEnd {
    pub endpoint: TransportEndpoint,
    observer: SharedObserver,
    frames: Receiver<Vec<u8>>,
    closed: Arc<AtomicBool>,
}

impl MemoryServerEnd {
    /// Complete the connect handshake, announcing the given sub-protocol.
    pub fn accept(&self, subprotocol: &str) {
        self.observer.lock().unwrap().transport_connected(subprotocol);
    }

    /// Push a frame to the client.
    pub fn deliver(&self, frame: &[u8]) {
        self.observer.lock().unwrap().frame_received(frame);
    }

    /// Close the link from the server side.
    pub fn close(&self, was_clean: bool, kind: TransportCloseKind, reason: &str) {
        self.closed.store(true, Ordering::Release);
        self.observer
            .lock()
            .unwrap()
            .transport_closed(was_clean, kind, reason);
    }

    /// Next frame written by the client, if any arrives within `timeout`.
    pub fn next_frame(&self, timeout: Duration) -> Option<Vec<u8>> {
        match self.frames.recv_timeout(timeout) {
            Ok(frame) => Some(frame),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn try_next_frame(&self) -> Option<Vec<u8>> {
        self.frames.try_recv().ok()
    }
}

struct MemoryTransport {
    frames: Sender<Vec<u8>>,
    closed: Arc<AtomicBool>,
}

impl Transport for MemoryTransport {
    fn write_frame(&mut self, frame: Vec<u8>, completion: WriteCompletion) {
        if !self.closed.load(Ordering::Acquire) {
            let _ = self.frames.send(frame);
            completion();
        }
    }
}

/// Transport provider whose connections surface as [`MemoryServerEnd`]s on
/// a channel, letting tests script the server side of the wire.
pub struct MemoryTransportProvider {
    accepts: Sender<MemoryServerEnd>,
}

impl MemoryTransportProvider {
    pub fn new() -> (Arc<Self>, Receiver<MemoryServerEnd>) {
        let (accepts, incoming) = unbounded();
        (Arc::new(Self { accepts }), incoming)
    }
}

impl TransportProvider for MemoryTransportProvider {
    fn connect(
        &self,
        endpoint: TransportEndpoint,
        observer: Box<dyn TransportObserver>,
    ) -> Box<dyn Transport> {
        let (frames_tx, frames_rx) = unbounded();
        let closed = Arc::new(AtomicBool::new(false));
        let server = MemoryServerEnd {
            endpoint,
            observer: Arc::new(Mutex::new(observer)),
            frames: frames_rx,
            closed: Arc::clone(&closed),
        };
        let _ = self.accepts.send(server);
        Box::new(MemoryTransport {
            frames: frames_tx,
            closed,
        })
    }
}

// ---------------------------------------------------------------------------
// Framed TCP transport
// ---------------------------------------------------------------------------

enum TcpWriteRequest {
    Frame(Vec<u8>, WriteCompletion),
    Shutdown,
}

struct TcpTransport {
    writes: Sender<TcpWriteRequest>,
}

impl Transport for TcpTransport {
    fn write_frame(&mut self, frame: Vec<u8>, completion: WriteCompletion) {
        let _ = self.writes.send(TcpWriteRequest::Frame(frame, completion));
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        let _ = self.writes.send(TcpWriteRequest::Shutdown);
    }
}

/// Framed transport over plain TCP using the length+crc32c frame layer.
///
/// No sub-protocol negotiation happens on raw TCP; the connected event
/// simply echoes the first (highest) offered sub-protocol. TLS endpoints
/// are not supported by this provider.
pub struct TcpTransportProvider {
    max_frame_bytes: usize,
}

impl TcpTransportProvider {
    pub fn new(max_frame_bytes: usize) -> Arc<Self> {
        Arc::new(Self { max_frame_bytes })
    }
}

impl TransportProvider for TcpTransportProvider {
    fn connect(
        &self,
        endpoint: TransportEndpoint,
        observer: Box<dyn TransportObserver>,
    ) -> Box<dyn Transport> {
        let (writes_tx, writes_rx) = unbounded::<TcpWriteRequest>();
        let max_frame_bytes = self.max_frame_bytes;
        let observer = Arc::new(Mutex::new(observer));

        let connect_observer = Arc::clone(&observer);
        thread::spawn(move || {
            let addr = format!("{}:{}", endpoint.address, endpoint.port);
            let stream = match TcpStream::connect(&addr) {
                Ok(stream) => stream,
                Err(err) => {
                    connect_observer.lock().unwrap().transport_closed(
                        false,
                        TransportCloseKind::ConnectionFailed,
                        &err.to_string(),
                    );
                    return;
                }
            };
            let _ = stream.set_nodelay(true);

            let reader_stream = match stream.try_clone() {
                Ok(clone) => clone,
                Err(err) => {
                    connect_observer.lock().unwrap().transport_closed(
                        false,
                        TransportCloseKind::ConnectionFailed,
                        &err.to_string(),
                    );
                    return;
                }
            };

            let negotiated = endpoint.subprotocols.first().cloned().unwrap_or_default();
            connect_observer
                .lock()
                .unwrap()
                .transport_connected(&negotiated);

            let reader_observer = Arc::clone(&connect_observer);
            let reader = thread::spawn(move || {
                run_tcp_reader(reader_stream, max_frame_bytes, reader_observer);
            });

            run_tcp_writer(stream, writes_rx, max_frame_bytes, connect_observer);
            let _ = reader.join();
        });

        Box::new(TcpTransport { writes: writes_tx })
    }
}

fn run_tcp_reader(mut stream: TcpStream, max_frame_bytes: usize, observer: SharedObserver) {
    let mut decoder = FrameDecoder::new(max_frame_bytes);
    let mut chunk = [0u8; 16 * 1024];
    loop {
        match stream.read(&mut chunk) {
            Ok(0) => {
                observer.lock().unwrap().transport_closed(
                    true,
                    TransportCloseKind::Normal,
                    "peer closed",
                );
                return;
            }
            Ok(n) => {
                decoder.push(&chunk[..n]);
                loop {
                    match decoder.next_frame() {
                        Ok(Some(frame)) => observer.lock().unwrap().frame_received(&frame),
                        Ok(None) => break,
                        Err(err) => {
                            observer.lock().unwrap().transport_closed(
                                false,
                                TransportCloseKind::ProtocolError,
                                &err.to_string(),
                            );
                            return;
                        }
                    }
                }
            }
            Err(err) => {
                observer.lock().unwrap().transport_closed(
                    false,
                    TransportCloseKind::ReadError,
                    &err.to_string(),
                );
                return;
            }
        }
    }
}

fn run_tcp_writer(
    mut stream: TcpStream,
    writes: Receiver<TcpWriteRequest>,
    max_frame_bytes: usize,
    observer: SharedObserver,
) {
    while let Ok(request) = writes.recv() {
        match request {
            TcpWriteRequest::Frame(payload, completion) => {
                let framed = match encode_frame(&payload, max_frame_bytes) {
                    Ok(framed) => framed,
                    Err(err) => {
                        observer.lock().unwrap().transport_closed(
                            false,
                            TransportCloseKind::MessageTooBig,
                            &err.to_string(),
                        );
                        return;
                    }
                };
                if let Err(err) = stream.write_all(&framed) {
                    observer.lock().unwrap().transport_closed(
                        false,
                        TransportCloseKind::WriteError,
                        &err.to_string(),
                    );
                    return;
                }
                completion();
            }
            TcpWriteRequest::Shutdown => {
                let _ = stream.shutdown(std::net::Shutdown::Both);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RecordingObserver {
        events: Sender<String>,
    }

    impl TransportObserver for RecordingObserver {
        fn transport_connected(&mut self, subprotocol: &str) {
            let _ = self.events.send(format!("connected:{subprotocol}"));
        }

        fn frame_received(&mut self, data: &[u8]) {
            let _ = self
                .events
                .send(format!("frame:{}", String::from_utf8_lossy(data)));
        }

        fn transport_error(&mut self) {
            let _ = self.events.send("error".into());
        }

        fn transport_closed(&mut self, was_clean: bool, kind: TransportCloseKind, _reason: &str) {
            let _ = self.events.send(format!("closed:{was_clean}:{kind:?}"));
        }
    }

    fn endpoint() -> TransportEndpoint {
        TransportEndpoint {
            address: "server".into(),
            port: 7800,
            http_path: "/".into(),
            subprotocols: vec!["lagoon-part-8".into()],
            is_ssl: false,
        }
    }

    #[test]
    fn memory_pair_passes_frames_both_ways() {
        let (provider, incoming) = MemoryTransportProvider::new();
        let (events_tx, events_rx) = unbounded();
        let mut transport = provider.connect(
            endpoint(),
            Box::new(RecordingObserver { events: events_tx }),
        );
        let server = incoming.recv().unwrap();

        server.accept("lagoon-part-8");
        assert_eq!(events_rx.recv().unwrap(), "connected:lagoon-part-8");

        let completed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&completed);
        transport.write_frame(
            b"up".to_vec(),
            Box::new(move || flag.store(true, Ordering::Release)),
        );
        assert_eq!(
            server.next_frame(Duration::from_secs(1)).unwrap(),
            b"up".to_vec()
        );
        assert!(completed.load(Ordering::Acquire));

        server.deliver(b"down");
        assert_eq!(events_rx.recv().unwrap(), "frame:down");

        server.close(true, TransportCloseKind::Normal, "bye");
        assert_eq!(events_rx.recv().unwrap(), "closed:true:Normal");
    }

    #[test]
    fn sentinel_flags_destruction() {
        let sentinel = LifecycleSentinel::new();
        let shared = sentinel.clone();
        assert!(!shared.is_destroyed());
        sentinel.destroy();
        assert!(shared.is_destroyed());
    }

    #[test]
    fn tcp_transport_frames_both_directions() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut decoder = FrameDecoder::new(1024);
            let mut chunk = [0u8; 256];
            let frame = loop {
                let n = stream.read(&mut chunk).unwrap();
                decoder.push(&chunk[..n]);
                if let Some(frame) = decoder.next_frame().unwrap() {
                    break frame;
                }
            };
            assert_eq!(frame, b"from-client");
            stream
                .write_all(&encode_frame(b"from-server", 1024).unwrap())
                .unwrap();
        });

        let provider = TcpTransportProvider::new(1024);
        let (events_tx, events_rx) = unbounded();
        let mut transport = provider.connect(
            TransportEndpoint {
                address: "127.0.0.1".into(),
                port,
                http_path: "/".into(),
                subprotocols: vec!["lagoon-part-8".into()],
                is_ssl: false,
            },
            Box::new(RecordingObserver { events: events_tx }),
        );

        assert_eq!(
            events_rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            "connected:lagoon-part-8"
        );
        transport.write_frame(b"from-client".to_vec(), Box::new(|| {}));
        assert_eq!(
            events_rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            "frame:from-server"
        );
        server.join().unwrap();
    }
}
