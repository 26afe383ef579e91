//! courier — headless peer channel daemon.
//!
//! Loads the local identity key pair, registers with the signaling relay,
//! and runs one channel manager for the local user. Commands arrive on
//! stdin; received messages and channel status go to stdout.
//!
//! Usage:
//!   courier --id <participant-id> [--relay-url <ws://host:port>]
//!           [--scope lan|overlay|global] [--advertise <ip>]...
//!
//! Commands:
//!   connect <id>        open a direct channel
//!   send <id> <text>    encrypt and send
//!   close <id>          tear the channel down
//!   call <id>           start a media call
//!   accept <id>         accept a ringing call
//!   hangup <id>         end a call
//!   quit

use std::collections::HashMap;
use std::io::{self, BufRead};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tungstenite::Message as WsMessage;

use courier::call::CallState;
use courier::candidate_filter::NetworkScope;
use courier::control::{ClientFrame, RelayFrame};
use courier::key_directory::{KeyDirectory, RemoteKeyLookup};
use courier::key_store::{load_or_create_keypair, resolve_key_path};
use courier::manager::{
    ChannelManager, ChannelObserver, ManagerConfig, ManagerEvent, ManagerHandle, RelayLink,
};
use courier::message::Message;

// ── Constants ───────────────────────────────────────────────

const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:4000";

/// Poll interval for the relay socket loop.
const POLL_READ_TIMEOUT: Duration = Duration::from_millis(50);

/// How long a remote key lookup may wait for its result.
const KEY_LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

// ── CLI ─────────────────────────────────────────────────────

struct Args {
    participant_id: String,
    relay_url: String,
    scope: NetworkScope,
    advertise_ips: Vec<String>,
}

fn parse_args() -> Args {
    let argv: Vec<String> = std::env::args().collect();
    let mut participant_id = None;
    let mut relay_url = DEFAULT_RELAY_URL.to_string();
    let mut scope = NetworkScope::Lan;
    let mut advertise_ips = Vec::new();

    let mut i = 1;
    while i < argv.len() {
        match argv[i].as_str() {
            "--id" => {
                i += 1;
                participant_id = match argv.get(i) {
                    Some(id) if !id.is_empty() => Some(id.clone()),
                    _ => {
                        eprintln!("--id requires a participant id");
                        std::process::exit(1);
                    }
                };
            }
            "--relay-url" => {
                i += 1;
                relay_url = match argv.get(i) {
                    Some(url) => url.clone(),
                    None => {
                        eprintln!("--relay-url requires a URL");
                        std::process::exit(1);
                    }
                };
            }
            "--scope" => {
                i += 1;
                scope = match argv.get(i).map(|s| s.parse::<NetworkScope>()) {
                    Some(Ok(s)) => s,
                    _ => {
                        eprintln!("--scope must be lan, overlay, or global");
                        std::process::exit(1);
                    }
                };
            }
            "--advertise" => {
                i += 1;
                match argv.get(i) {
                    Some(ip) => advertise_ips.push(ip.clone()),
                    None => {
                        eprintln!("--advertise requires an IP address");
                        std::process::exit(1);
                    }
                }
            }
            other => {
                eprintln!("Unknown argument: {}", other);
                eprintln!(
                    "Usage: courier --id <participant-id> [--relay-url <url>] \
                     [--scope lan|overlay|global] [--advertise <ip>]..."
                );
                std::process::exit(1);
            }
        }
        i += 1;
    }

    let participant_id = participant_id.unwrap_or_else(|| {
        eprintln!("--id is required");
        std::process::exit(1);
    });
    Args {
        participant_id,
        relay_url,
        scope,
        advertise_ips,
    }
}

// ── Relay link plumbing ─────────────────────────────────────

/// Outbound frames are queued here and drained by the relay poll loop.
struct QueuedRelayLink {
    out: mpsc::Sender<ClientFrame>,
}

impl RelayLink for QueuedRelayLink {
    fn send(&self, frame: &ClientFrame) -> Result<(), String> {
        self.out
            .send(frame.clone())
            .map_err(|_| "relay link closed".to_string())
    }
}

type PendingLookups = Arc<Mutex<HashMap<String, mpsc::Sender<Option<String>>>>>;

/// Remote key lookup over the relay connection: sends `key-lookup` and
/// waits for the poll loop to route the matching `key-result` back.
struct RelayKeyLookup {
    out: mpsc::Sender<ClientFrame>,
    pending: PendingLookups,
}

impl RemoteKeyLookup for RelayKeyLookup {
    fn fetch(&self, participant_id: &str) -> Result<Option<String>, String> {
        let (tx, rx) = mpsc::channel();
        self.pending
            .lock()
            .expect("BUG: pending lookup lock poisoned")
            .insert(participant_id.to_string(), tx);
        self.out
            .send(ClientFrame::KeyLookup {
                participant_id: participant_id.to_string(),
            })
            .map_err(|_| "relay link closed".to_string())?;
        rx.recv_timeout(KEY_LOOKUP_TIMEOUT)
            .map_err(|_| "key lookup timed out".to_string())
    }
}

// ── Observer ────────────────────────────────────────────────

/// Prints channel activity for the interactive session.
struct PrintObserver;

impl ChannelObserver for PrintObserver {
    fn message_received(&self, message: &Message) {
        println!("[msg] {}: {}", message.sender_id, message.payload);
    }
    fn status_changed(&self, remote_id: &str, active: bool) {
        println!(
            "[channel] {} is {}",
            remote_id,
            if active { "open" } else { "closed" }
        );
    }
    fn sends_discarded(&self, remote_id: &str, count: usize) {
        println!(
            "[channel] connection to {} lost; {} queued messages discarded",
            remote_id, count
        );
    }
    fn read_acknowledged(&self, message_id: &str) {
        println!("[read] {}", message_id);
    }
    fn message_undecryptable(&self, sender_id: &str, message_id: &str) {
        println!(
            "[msg] {}: (undecryptable, id {}; ask the sender to resend)",
            sender_id, message_id
        );
    }
    fn call_state(&self, remote_id: &str, state: CallState) {
        println!("[call] {} {:?}", remote_id, state);
    }
}

// ── Relay poll loop ─────────────────────────────────────────

/// Owns the relay socket: drains outbound frames and routes inbound ones
/// to the pending key lookups or the manager.
fn run_relay_loop(
    relay_url: &str,
    participant_id: &str,
    public_key_b64: &str,
    out_rx: mpsc::Receiver<ClientFrame>,
    pending: PendingLookups,
    manager: ManagerHandle,
) -> Result<(), String> {
    let (mut ws, _resp) =
        tungstenite::connect(relay_url).map_err(|e| format!("connect {}: {}", relay_url, e))?;
    match ws.get_ref() {
        tungstenite::stream::MaybeTlsStream::Plain(stream) => stream
            .set_read_timeout(Some(POLL_READ_TIMEOUT))
            .map_err(|e| e.to_string())?,
        _ => return Err("unexpected TLS relay stream".to_string()),
    }

    let register = ClientFrame::Register {
        participant_id: participant_id.to_string(),
        public_key: public_key_b64.to_string(),
    };
    let json = serde_json::to_string(&register).map_err(|e| e.to_string())?;
    ws.send(WsMessage::Text(json)).map_err(|e| e.to_string())?;

    loop {
        // Drain frames the manager queued for the relay.
        while let Ok(frame) = out_rx.try_recv() {
            let json = serde_json::to_string(&frame).map_err(|e| e.to_string())?;
            ws.send(WsMessage::Text(json)).map_err(|e| e.to_string())?;
        }

        let msg = match ws.read() {
            Ok(msg) => msg,
            Err(tungstenite::Error::Io(ref e))
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(tungstenite::Error::ConnectionClosed)
            | Err(tungstenite::Error::AlreadyClosed) => {
                return Err("relay closed the connection".to_string());
            }
            Err(e) => return Err(e.to_string()),
        };
        if msg.is_ping() || msg.is_pong() {
            continue;
        }
        if msg.is_close() {
            return Err("relay sent close".to_string());
        }
        let text = match msg {
            WsMessage::Text(t) => t,
            _ => continue,
        };
        let frame: RelayFrame = match serde_json::from_str(&text) {
            Ok(f) => f,
            Err(e) => {
                eprintln!("[courier] unparseable relay frame: {}", e);
                continue;
            }
        };

        // Key results answer a blocked lookup; everything else goes to
        // the manager.
        if let RelayFrame::KeyResult {
            participant_id,
            public_key,
        } = &frame
        {
            let waiter = pending
                .lock()
                .expect("BUG: pending lookup lock poisoned")
                .remove(participant_id);
            if let Some(tx) = waiter {
                let _ = tx.send(public_key.clone());
                continue;
            }
        }
        manager.relay_frame(frame);
    }
}

// ── Stdin commands ──────────────────────────────────────────

fn run_command_loop(manager: &ManagerHandle) {
    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(l) => l,
            Err(_) => break,
        };
        let mut parts = line.trim().splitn(3, ' ');
        let command = parts.next().unwrap_or("");
        let target = parts.next();
        match (command, target) {
            ("connect", Some(id)) => manager.connect(id),
            ("send", Some(id)) => match parts.next() {
                Some(text) => manager.send(id, text),
                None => eprintln!("usage: send <id> <text>"),
            },
            ("close", Some(id)) => manager.close(id),
            ("call", Some(id)) => manager.post(ManagerEvent::CallDial {
                remote_id: id.to_string(),
            }),
            ("accept", Some(id)) => manager.post(ManagerEvent::CallAccept {
                remote_id: id.to_string(),
            }),
            ("hangup", Some(id)) => manager.post(ManagerEvent::CallHangUp {
                remote_id: id.to_string(),
            }),
            ("quit", _) => break,
            ("", _) => {}
            _ => eprintln!("unknown command: {}", line.trim()),
        }
    }
}

// ── Entry ───────────────────────────────────────────────────

fn main() {
    let args = parse_args();

    let key_path = match resolve_key_path() {
        Ok(p) => p,
        Err(e) => {
            eprintln!("[courier] FATAL: {}", e);
            std::process::exit(1);
        }
    };
    let keypair = match load_or_create_keypair(&key_path) {
        Ok(kp) => kp,
        Err(e) => {
            eprintln!("[courier] FATAL: {}", e);
            std::process::exit(1);
        }
    };
    let public_key_b64 = keypair.public_key_base64();
    eprintln!(
        "[courier] identity loaded for {} (key {})",
        args.participant_id, public_key_b64
    );

    let (out_tx, out_rx) = mpsc::channel::<ClientFrame>();
    let pending: PendingLookups = Arc::new(Mutex::new(HashMap::new()));

    let directory = Arc::new(KeyDirectory::new(Box::new(RelayKeyLookup {
        out: out_tx.clone(),
        pending: pending.clone(),
    })));

    let manager = ChannelManager::new(
        ManagerConfig {
            local_id: args.participant_id.clone(),
            scope: args.scope,
            advertise_ips: args.advertise_ips.clone(),
        },
        keypair,
        directory,
        Box::new(QueuedRelayLink { out: out_tx }),
        Box::new(PrintObserver),
    );
    let (handle, _manager_join) = manager.spawn();

    let relay_handle = handle.clone();
    let relay_url = args.relay_url.clone();
    let participant_id = args.participant_id.clone();
    let spawned = thread::Builder::new()
        .name("relay-loop".to_string())
        .spawn(move || {
            if let Err(e) = run_relay_loop(
                &relay_url,
                &participant_id,
                &public_key_b64,
                out_rx,
                pending,
                relay_handle,
            ) {
                eprintln!("[courier] FATAL: relay loop: {}", e);
                std::process::exit(1);
            }
        });
    if let Err(e) = spawned {
        eprintln!("[courier] FATAL: relay thread spawn failed: {}", e);
        std::process::exit(1);
    }

    run_command_loop(&handle);
    handle.shutdown();
}
