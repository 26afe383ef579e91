//! End-to-end channel test: two managers, a real in-process relay core,
//! and a loopback TCP transport. Covers negotiation, encrypted delivery,
//! chunked transfer, and read acknowledgments over the direct channel.

use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use courier::candidate_filter::NetworkScope;
use courier::chunk::CHUNK_SIZE;
use courier::codec::generate_keypair;
use courier::control::ClientFrame;
use courier::key_directory::{KeyDirectory, RemoteKeyLookup};
use courier::manager::{
    ChannelManager, ChannelObserver, ManagerConfig, ManagerEvent, ManagerHandle, RelayLink,
};
use courier::message::{Message, TransportHint};
use courier::relay::{PeerHandle, RelayCore};

// ── Harness ─────────────────────────────────────────────────

/// Frames a manager sends "to the relay" go straight into the core.
struct CoreLink {
    core: Arc<Mutex<RelayCore>>,
    local_id: String,
}

impl RelayLink for CoreLink {
    fn send(&self, frame: &ClientFrame) -> Result<(), String> {
        self.core
            .lock()
            .unwrap()
            .handle_frame(&self.local_id, frame.clone());
        Ok(())
    }
}

/// Key discovery against the core's published keys.
struct CoreLookup {
    core: Arc<Mutex<RelayCore>>,
}

impl RemoteKeyLookup for CoreLookup {
    fn fetch(&self, participant_id: &str) -> Result<Option<String>, String> {
        Ok(self
            .core
            .lock()
            .unwrap()
            .registry
            .public_key(participant_id)
            .map(str::to_string))
    }
}

#[derive(Debug)]
enum Observed {
    Message(Message),
    Status(String, bool),
    Read(String),
}

struct ForwardingObserver {
    events: mpsc::Sender<Observed>,
}

impl ChannelObserver for ForwardingObserver {
    fn message_received(&self, message: &Message) {
        let _ = self.events.send(Observed::Message(message.clone()));
    }
    fn status_changed(&self, remote_id: &str, active: bool) {
        let _ = self
            .events
            .send(Observed::Status(remote_id.to_string(), active));
    }
    fn sends_discarded(&self, _remote_id: &str, _count: usize) {}
    fn read_acknowledged(&self, message_id: &str) {
        let _ = self.events.send(Observed::Read(message_id.to_string()));
    }
}

struct Peer {
    handle: ManagerHandle,
    events: mpsc::Receiver<Observed>,
}

/// Spawn a manager for `id` and register it with the relay core. The
/// pump thread feeds routed frames back into the manager's queue.
fn spawn_peer(core: &Arc<Mutex<RelayCore>>, id: &str) -> Peer {
    let keypair = generate_keypair();
    let public_key = keypair.public_key_base64();
    let directory = Arc::new(KeyDirectory::new(Box::new(CoreLookup {
        core: core.clone(),
    })));

    let (events_tx, events_rx) = mpsc::channel();
    let manager = ChannelManager::new(
        ManagerConfig {
            local_id: id.to_string(),
            scope: NetworkScope::Lan,
            advertise_ips: vec![],
        },
        keypair,
        directory,
        Box::new(CoreLink {
            core: core.clone(),
            local_id: id.to_string(),
        }),
        Box::new(ForwardingObserver { events: events_tx }),
    );
    let (handle, _join) = manager.spawn();

    let (relay_tx, relay_rx) = mpsc::channel();
    core.lock()
        .unwrap()
        .register(id, &public_key, PeerHandle::new(relay_tx));
    let pump_handle = handle.clone();
    thread::spawn(move || {
        for frame in relay_rx {
            pump_handle.relay_frame(frame);
        }
    });

    Peer {
        handle,
        events: events_rx,
    }
}

fn wait_for(
    rx: &mpsc::Receiver<Observed>,
    what: &str,
    pred: impl Fn(&Observed) -> bool,
) -> Observed {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(remaining) {
            Ok(ev) if pred(&ev) => return ev,
            Ok(_) => continue,
            Err(_) => panic!("timed out waiting for {}", what),
        }
    }
}

fn open_channel(alice: &Peer, bob: &Peer) {
    alice.handle.connect("bob");
    wait_for(&alice.events, "alice channel open", |e| {
        matches!(e, Observed::Status(id, true) if id == "bob")
    });
    wait_for(&bob.events, "bob channel open", |e| {
        matches!(e, Observed::Status(id, true) if id == "alice")
    });
}

// ── Tests ───────────────────────────────────────────────────

#[test]
fn direct_channel_opens_and_delivers_encrypted_text() {
    let core = Arc::new(Mutex::new(RelayCore::new()));
    let alice = spawn_peer(&core, "alice");
    let bob = spawn_peer(&core, "bob");
    open_channel(&alice, &bob);

    alice.handle.send("bob", "meet at the usual place");
    let ev = wait_for(&bob.events, "message at bob", |e| {
        matches!(e, Observed::Message(_))
    });
    match ev {
        Observed::Message(m) => {
            assert_eq!(m.sender_id, "alice");
            assert_eq!(m.payload, "meet at the usual place");
            assert_eq!(m.transport_hint, TransportHint::Direct);
        }
        other => panic!("expected message, got {:?}", other),
    }

    // Nothing was persisted: both peers were online and direct.
    assert_eq!(core.lock().unwrap().store.pending_for("bob"), 0);
}

#[test]
fn oversized_message_travels_in_chunks_and_reassembles() {
    let core = Arc::new(Mutex::new(RelayCore::new()));
    let alice = spawn_peer(&core, "alice");
    let bob = spawn_peer(&core, "bob");
    open_channel(&alice, &bob);

    // Well past the chunk threshold even before encryption overhead.
    let big = "z".repeat(CHUNK_SIZE * 3);
    alice.handle.send("bob", &big);
    let ev = wait_for(&bob.events, "chunked message at bob", |e| {
        matches!(e, Observed::Message(_))
    });
    match ev {
        Observed::Message(m) => {
            assert_eq!(m.payload.len(), big.len());
            assert_eq!(m.payload, big);
        }
        other => panic!("expected message, got {:?}", other),
    }
}

#[test]
fn read_ack_returns_over_direct_channel() {
    let core = Arc::new(Mutex::new(RelayCore::new()));
    let alice = spawn_peer(&core, "alice");
    let bob = spawn_peer(&core, "bob");
    open_channel(&alice, &bob);

    alice.handle.send("bob", "did you get this?");
    let delivered = match wait_for(&bob.events, "message at bob", |e| {
        matches!(e, Observed::Message(_))
    }) {
        Observed::Message(m) => m,
        other => panic!("expected message, got {:?}", other),
    };

    bob.handle.post(ManagerEvent::MarkRead {
        message: delivered.clone(),
    });
    let ev = wait_for(&alice.events, "read ack at alice", |e| {
        matches!(e, Observed::Read(_))
    });
    match ev {
        Observed::Read(id) => assert_eq!(id, delivered.id),
        other => panic!("expected read ack, got {:?}", other),
    }
}
