//! Direct peer transport: TCP with length-prefixed frames.
//!
//! Wire format per frame: `u32` big-endian payload length, then that many
//! bytes of UTF-8 (a serialized data frame). Frames are capped at 64 KiB —
//! larger application payloads travel as chunk frames, so a frame above
//! the cap is a protocol violation and closes the connection.
//!
//! The offerer binds a listener and advertises its addresses as
//! candidates; the answerer dials candidates in order. Reader threads
//! translate socket activity into `TransportEvent`s for the manager loop
//! and never block it.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

// ── Constants ───────────────────────────────────────────────

/// Maximum single frame payload. Chunking keeps data frames under this.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Connect timeout when dialing a candidate.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// How often the accept thread checks its stop flag between accepts.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

// ── Error type ──────────────────────────────────────────────

#[derive(Debug)]
pub enum TransportError {
    Io(io::Error),
    /// Peer announced a frame above `MAX_FRAME_LEN`.
    FrameTooLarge { len: usize },
    /// Frame payload was not valid UTF-8.
    InvalidUtf8,
    /// Transport already closed.
    Closed,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Io(e) => write!(f, "transport I/O error: {}", e),
            TransportError::FrameTooLarge { len } => {
                write!(f, "frame of {} bytes exceeds cap of {}", len, MAX_FRAME_LEN)
            }
            TransportError::InvalidUtf8 => write!(f, "frame payload is not valid UTF-8"),
            TransportError::Closed => write!(f, "transport is closed"),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        TransportError::Io(e)
    }
}

// ── Events ──────────────────────────────────────────────────

/// Socket activity, injected into the manager's event loop.
#[derive(Debug)]
pub enum TransportEvent {
    Connected,
    Frame(String),
    Closed { reason: String },
}

// ── Transport seam ──────────────────────────────────────────

/// Write side of an established direct channel. The read side lives on a
/// dedicated thread feeding `TransportEvent`s.
pub trait Transport: Send {
    fn send_frame(&self, frame: &str) -> Result<(), TransportError>;
    fn close(&self);
}

// ── Framing ─────────────────────────────────────────────────

/// Write one length-prefixed frame.
pub fn write_frame(stream: &mut impl Write, frame: &str) -> Result<(), TransportError> {
    let bytes = frame.as_bytes();
    if bytes.len() > MAX_FRAME_LEN {
        return Err(TransportError::FrameTooLarge { len: bytes.len() });
    }
    stream.write_all(&(bytes.len() as u32).to_be_bytes())?;
    stream.write_all(bytes)?;
    stream.flush()?;
    Ok(())
}

/// Read one length-prefixed frame. `Ok(None)` means a clean EOF at a
/// frame boundary.
pub fn read_frame(stream: &mut impl Read) -> Result<Option<String>, TransportError> {
    let mut header = [0u8; 4];
    match stream.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(TransportError::FrameTooLarge { len });
    }
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload)?;
    String::from_utf8(payload)
        .map(Some)
        .map_err(|_| TransportError::InvalidUtf8)
}

// ── TCP transport ───────────────────────────────────────────

/// Write handle over an established TCP connection. Clone-cheap via Arc.
#[derive(Clone)]
pub struct TcpTransport {
    stream: Arc<Mutex<TcpStream>>,
    closed: Arc<AtomicBool>,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream: Arc::new(Mutex::new(stream)),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Spawn the reader thread for this connection. Events are handed to
    /// `on_event` in arrival order; a `Closed` event is always last.
    pub fn spawn_reader(
        stream: TcpStream,
        on_event: impl Fn(TransportEvent) + Send + 'static,
    ) -> io::Result<thread::JoinHandle<()>> {
        let mut reader = stream.try_clone()?;
        thread::Builder::new()
            .name("transport-reader".to_string())
            .spawn(move || {
                on_event(TransportEvent::Connected);
                loop {
                    match read_frame(&mut reader) {
                        Ok(Some(frame)) => on_event(TransportEvent::Frame(frame)),
                        Ok(None) => {
                            on_event(TransportEvent::Closed {
                                reason: "peer closed".to_string(),
                            });
                            return;
                        }
                        Err(e) => {
                            on_event(TransportEvent::Closed {
                                reason: e.to_string(),
                            });
                            return;
                        }
                    }
                }
            })
    }
}

impl Transport for TcpTransport {
    fn send_frame(&self, frame: &str) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let mut stream = self.stream.lock().map_err(|_| TransportError::Closed)?;
        write_frame(&mut *stream, frame)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(stream) = self.stream.lock() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

// ── Listener ────────────────────────────────────────────────

/// Bound listener on the offerer side. Accepts at most one connection for
/// the current negotiation round.
pub struct ChannelListener {
    listener: TcpListener,
    local_addr: SocketAddr,
    stop: Arc<AtomicBool>,
}

/// Handle for stopping a round's accept thread. Closing after a
/// connection was already accepted is a no-op.
pub struct ListenerGuard {
    stop: Arc<AtomicBool>,
}

impl ListenerGuard {
    pub fn close(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

impl ChannelListener {
    /// Bind on an ephemeral port on all interfaces.
    pub fn bind() -> io::Result<Self> {
        let listener = TcpListener::bind("0.0.0.0:0")?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Candidate addresses to advertise: the configured addresses of this
    /// host plus loopback, each with the bound port.
    pub fn candidate_addresses(&self, advertise_ips: &[String]) -> Vec<String> {
        let mut out: Vec<String> = advertise_ips
            .iter()
            .map(|ip| format!("{}:{}", ip, self.port()))
            .collect();
        out.push(format!("127.0.0.1:{}", self.port()));
        out
    }

    /// Accept one inbound connection on a background thread and hand the
    /// resulting stream to `on_accept`. The returned guard stops the
    /// thread and releases the socket when the round is torn down before
    /// anyone connected. Accept errors are reported as `None`.
    pub fn accept_one(
        self,
        on_accept: impl FnOnce(Option<TcpStream>) + Send + 'static,
    ) -> io::Result<(ListenerGuard, thread::JoinHandle<()>)> {
        self.listener.set_nonblocking(true)?;
        let stop = self.stop.clone();
        let guard = ListenerGuard {
            stop: self.stop.clone(),
        };
        let join = thread::Builder::new()
            .name("transport-accept".to_string())
            .spawn(move || loop {
                if stop.load(Ordering::SeqCst) {
                    return;
                }
                match self.listener.accept() {
                    Ok((stream, peer)) => {
                        // The accepted stream must not inherit the
                        // listener's nonblocking mode.
                        if let Err(e) = stream.set_nonblocking(false) {
                            eprintln!("[transport] accepted stream setup failed: {}", e);
                            on_accept(None);
                            return;
                        }
                        eprintln!("[transport] accepted direct connection from {}", peer);
                        on_accept(Some(stream));
                        return;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        thread::sleep(ACCEPT_POLL_INTERVAL);
                    }
                    Err(e) => {
                        eprintln!("[transport] accept failed: {}", e);
                        on_accept(None);
                        return;
                    }
                }
            })?;
        Ok((guard, join))
    }
}

/// Dial one candidate address with a bounded timeout.
pub fn dial(address: &str) -> Result<TcpStream, TransportError> {
    let addr: SocketAddr = address
        .parse()
        .map_err(|_| TransportError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unparseable candidate address {:?}", address),
        )))?;
    let stream = TcpStream::connect_timeout(&addr, DIAL_TIMEOUT)?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

// ── In-memory transport (tests) ─────────────────────────────

/// In-memory transport half, paired over channels. Used by tests to run
/// two sessions against each other without sockets.
pub struct MemoryTransport {
    tx: mpsc::Sender<String>,
    closed: Arc<AtomicBool>,
}

impl MemoryTransport {
    /// Build a connected pair. Each side gets a write half and the
    /// receiver for frames sent by its peer.
    pub fn pair() -> (
        MemoryTransport,
        mpsc::Receiver<String>,
        MemoryTransport,
        mpsc::Receiver<String>,
    ) {
        let (a_tx, b_rx) = mpsc::channel();
        let (b_tx, a_rx) = mpsc::channel();
        let closed = Arc::new(AtomicBool::new(false));
        (
            MemoryTransport {
                tx: a_tx,
                closed: closed.clone(),
            },
            a_rx,
            MemoryTransport {
                tx: b_tx,
                closed,
            },
            b_rx,
        )
    }
}

impl Transport for MemoryTransport {
    fn send_frame(&self, frame: &str) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.tx
            .send(frame.to_string())
            .map_err(|_| TransportError::Closed)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

// ── Tests ───────────────────────────────────────────────────
