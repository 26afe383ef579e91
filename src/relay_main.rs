//! courier-relay — signaling relay for the peer channel subsystem.
//!
//! Accepts any number of WebSocket peers. The first frame on a connection
//! must be `register`; after that the connection's thread polls its socket
//! and drains the peer's outbound queue, while all routing state lives in
//! one `RelayCore` behind a mutex.
//!
//! Usage:
//!   courier-relay [--port <PORT>]

use std::io;
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tungstenite::{Message as WsMessage, WebSocket};

use courier::control::{ClientFrame, RelayFrame};
use courier::relay::{PeerHandle, RelayCore};

// ── Constants ───────────────────────────────────────────────

/// Default TCP listen port.
const DEFAULT_PORT: u16 = 4000;

/// Read timeout for the per-connection poll loop: each pass drains the
/// outbound queue, then waits this long for inbound data.
const POLL_READ_TIMEOUT: Duration = Duration::from_millis(50);

/// How long a fresh connection may take to send its register frame.
const REGISTER_TIMEOUT: Duration = Duration::from_secs(10);

type WsStream = WebSocket<TcpStream>;

// ── CLI ─────────────────────────────────────────────────────

fn parse_args() -> u16 {
    let argv: Vec<String> = std::env::args().collect();
    let mut port = DEFAULT_PORT;
    let mut i = 1;
    while i < argv.len() {
        match argv[i].as_str() {
            "--port" => {
                i += 1;
                port = match argv.get(i).and_then(|s| s.parse::<u16>().ok()) {
                    Some(p) if p > 0 => p,
                    _ => {
                        eprintln!("--port requires a valid port number (1-65535)");
                        std::process::exit(1);
                    }
                };
            }
            other => {
                eprintln!("Unknown argument: {}", other);
                eprintln!("Usage: courier-relay [--port <PORT>]");
                std::process::exit(1);
            }
        }
        i += 1;
    }
    port
}

// ── Connection handling ─────────────────────────────────────

/// Read one text frame, treating timeouts as `None`.
fn read_text(ws: &mut WsStream) -> Result<Option<String>, String> {
    let msg = match ws.read() {
        Ok(msg) => msg,
        Err(tungstenite::Error::Io(ref e))
            if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut =>
        {
            return Ok(None);
        }
        Err(tungstenite::Error::ConnectionClosed) | Err(tungstenite::Error::AlreadyClosed) => {
            return Err("connection closed".to_string());
        }
        Err(e) => return Err(e.to_string()),
    };

    if msg.is_ping() || msg.is_pong() {
        return Ok(None);
    }
    if msg.is_close() {
        return Err("peer sent close".to_string());
    }
    match msg {
        WsMessage::Text(text) => Ok(Some(text)),
        other => {
            eprintln!("[relay] ignoring non-text message ({} bytes)", other.len());
            Ok(None)
        }
    }
}

/// Wait for the connection's register frame.
fn await_register(ws: &mut WsStream) -> Result<(String, String), String> {
    let deadline = std::time::Instant::now() + REGISTER_TIMEOUT;
    loop {
        if std::time::Instant::now() > deadline {
            return Err("no register frame within timeout".to_string());
        }
        let text = match read_text(ws)? {
            Some(t) => t,
            None => continue,
        };
        return match serde_json::from_str::<ClientFrame>(&text) {
            Ok(ClientFrame::Register {
                participant_id,
                public_key,
            }) => Ok((participant_id, public_key)),
            Ok(_) => Err("first frame must be register".to_string()),
            Err(e) => Err(format!("unparseable register frame: {}", e)),
        };
    }
}

fn send_frame(ws: &mut WsStream, frame: &RelayFrame) -> Result<(), String> {
    let json = serde_json::to_string(frame).map_err(|e| e.to_string())?;
    ws.send(WsMessage::Text(json)).map_err(|e| e.to_string())
}

/// One connection: register, then poll inbound frames and drain the
/// peer's outbound queue until either side ends the connection.
fn run_connection(stream: TcpStream, core: Arc<Mutex<RelayCore>>) {
    let peer_addr = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    if let Err(e) = stream.set_read_timeout(Some(POLL_READ_TIMEOUT)) {
        eprintln!("[relay] {}: set_read_timeout failed: {}", peer_addr, e);
        return;
    }
    let mut ws = match tungstenite::accept(stream) {
        Ok(ws) => ws,
        Err(e) => {
            eprintln!("[relay] {}: WebSocket handshake failed: {}", peer_addr, e);
            return;
        }
    };

    let (participant_id, public_key) = match await_register(&mut ws) {
        Ok(pair) => pair,
        Err(e) => {
            eprintln!("[relay] {}: {}", peer_addr, e);
            let _ = send_frame(
                &mut ws,
                &RelayFrame::Error {
                    message: e,
                },
            );
            return;
        }
    };
    eprintln!("[relay] {} registered as {}", peer_addr, participant_id);

    let (tx, rx) = mpsc::channel::<RelayFrame>();
    let generation = {
        let mut core = core.lock().expect("relay core lock poisoned");
        core.register(&participant_id, &public_key, PeerHandle::new(tx))
    };

    loop {
        // Drain routed frames for this peer.
        let mut write_failed = false;
        while let Ok(frame) = rx.try_recv() {
            if let Err(e) = send_frame(&mut ws, &frame) {
                eprintln!("[relay] {}: write failed: {}", participant_id, e);
                write_failed = true;
                break;
            }
        }
        if write_failed {
            break;
        }

        // Poll inbound.
        match read_text(&mut ws) {
            Ok(Some(text)) => {
                let mut core = core.lock().expect("relay core lock poisoned");
                core.handle_text(&participant_id, &text);
            }
            Ok(None) => {}
            Err(reason) => {
                eprintln!("[relay] {}: {}", participant_id, reason);
                break;
            }
        }
    }

    // If the peer reconnected meanwhile, its new registration stays.
    let mut core = core.lock().expect("relay core lock poisoned");
    core.unregister_if_current(&participant_id, generation);
}

// ── Entry ───────────────────────────────────────────────────

fn main() {
    let port = parse_args();

    let bind_addr = format!("0.0.0.0:{}", port);
    let listener = match TcpListener::bind(&bind_addr) {
        Ok(l) => {
            eprintln!("[relay] listening on {}", bind_addr);
            l
        }
        Err(e) => {
            eprintln!("[relay] FATAL: bind {} failed: {}", bind_addr, e);
            std::process::exit(1);
        }
    };

    let core = Arc::new(Mutex::new(RelayCore::new()));

    for stream in listener.incoming() {
        let stream = match stream {
            Ok(s) => s,
            Err(e) => {
                eprintln!("[relay] accept failed: {}", e);
                continue;
            }
        };
        let core = core.clone();
        if let Err(e) = thread::Builder::new()
            .name("relay-conn".to_string())
            .spawn(move || run_connection(stream, core))
        {
            eprintln!("[relay] connection thread spawn failed: {}", e);
        }
    }
}
