//! # Framed Channel
//!
//! Bidirectional byte stream between the application and the daemon, backed
//! by one shared-memory ring per direction plus a doorbell mechanism for
//! readable/writable notifications.
//!
//! Two construction paths exist:
//!
//! - [`FramedChannel::connect`] maps two freshly created shared-memory
//!   segments, announces them to the daemon over its well-known Unix socket
//!   and then uses that socket as the notification carrier.
//! - [`FramedChannel::loopback_pair`] cross-wires two endpoints over
//!   heap-backed rings within one process, which is how the test suite
//!   stands up a fake daemon.
//!
//! Notifications are one-shot and may be spurious; consumers of this module
//! always re-check ring cursors after a wakeup instead of trusting the
//! doorbell.

use crate::config::IpcConfig;
use crate::error::IpcError;
use crate::ipc::protocol::PROTOCOL_VERSION;
use crate::ipc::ring::{RingBuffer, RingConsumer, RingProducer};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};
use uuid::Uuid;

/// Notification byte: the peer's receive ring has new data.
pub const NOTIFY_READABLE: u8 = 0x01;
/// Notification byte: the peer's send ring gained free space.
pub const NOTIFY_WRITABLE: u8 = 0x02;

const HANDSHAKE_ACK: u8 = 0x06;

/// How this endpoint delivers a notification to its peer.
#[derive(Clone)]
pub enum PeerNotifier {
    /// Same-process peer: ring its doorbell directly.
    Local(Arc<Notify>),
    /// Cross-process peer: push a tagged byte onto the socket writer task.
    Socket {
        outbound: mpsc::UnboundedSender<u8>,
        tag: u8,
    },
}

impl PeerNotifier {
    pub fn ring(&self) {
        match self {
            PeerNotifier::Local(bell) => bell.notify_one(),
            PeerNotifier::Socket { outbound, tag } => {
                // A closed carrier means the peer is gone; the disconnect
                // path will observe that separately.
                let _ = outbound.send(*tag);
            }
        }
    }
}

/// Shared disconnect state for one endpoint. Triggering it wakes every
/// registered doorbell so pumps observe the flag; triggering twice is a
/// no-op.
#[derive(Clone)]
pub struct DisconnectHandle {
    flag: Arc<AtomicBool>,
    bells: Arc<Mutex<Vec<Arc<Notify>>>>,
}

impl DisconnectHandle {
    fn new(flag: Arc<AtomicBool>, bells: Vec<Arc<Notify>>) -> Self {
        Self {
            flag,
            bells: Arc::new(Mutex::new(bells)),
        }
    }

    /// Flip the endpoint into the disconnected state. Returns `true` for
    /// the caller that performed the transition.
    pub fn trigger(&self) -> bool {
        if self.flag.swap(true, Ordering::SeqCst) {
            return false;
        }
        for bell in self.bells.lock().iter() {
            bell.notify_one();
        }
        true
    }

    pub fn is_disconnected(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Register an additional doorbell to wake on disconnect. Rings it
    /// immediately if the endpoint is already down.
    pub fn add_bell(&self, bell: Arc<Notify>) {
        self.bells.lock().push(bell.clone());
        if self.is_disconnected() {
            bell.notify_one();
        }
    }
}

/// Producing half of a framed channel: this endpoint's outgoing ring plus
/// the notification plumbing the message writer needs.
pub struct SendChannel {
    ring: RingProducer,
    writable_bell: Arc<Notify>,
    peer: PeerNotifier,
    disconnected: Arc<AtomicBool>,
}

impl SendChannel {
    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    pub fn available_write(&self) -> Result<usize, IpcError> {
        if self.disconnected.load(Ordering::SeqCst) {
            return Err(IpcError::Disconnected);
        }
        self.ring.available_write()
    }

    /// Stage bytes into the outgoing ring. Space must have been checked.
    pub fn write(&mut self, src: &[u8]) {
        self.ring.write(src);
    }

    pub fn commit(&mut self) {
        self.ring.commit();
    }

    /// Whether the peer currently observes an empty receive side. Sampled
    /// before a commit to detect the empty-to-non-empty transition.
    pub fn peer_sees_empty(&self) -> bool {
        self.ring.published_empty()
    }

    pub fn request_writable(&self) {
        self.ring.request_writable();
    }

    pub fn take_readable_request(&self) -> bool {
        self.ring.take_readable_request()
    }

    /// Deliver a readable notification to the peer.
    pub fn notify_peer_readable(&self) {
        self.peer.ring();
    }

    /// Doorbell rung when the peer drains this ring (or on disconnect).
    pub fn writable_bell(&self) -> Arc<Notify> {
        self.writable_bell.clone()
    }
}

/// Consuming half of a framed channel.
pub struct ReceiveChannel {
    ring: RingConsumer,
    readable_bell: Arc<Notify>,
    peer: PeerNotifier,
    disconnected: Arc<AtomicBool>,
}

impl ReceiveChannel {
    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    pub fn available_read(&self) -> Result<usize, IpcError> {
        if self.disconnected.load(Ordering::SeqCst) {
            return Err(IpcError::Disconnected);
        }
        self.ring.available_read()
    }

    /// Copy the next bytes of the stream into `dst`. Availability must
    /// have been checked.
    pub fn read_into(&mut self, dst: &mut [u8]) {
        self.ring.read(dst);
    }

    /// Publish consumed bytes and wake the peer if it asked to be woken
    /// once space frees up.
    pub fn commit_and_notify(&mut self) {
        self.ring.commit();
        if self.ring.take_writable_request() {
            self.peer.ring();
        }
    }

    pub fn request_readable(&self) {
        self.ring.request_readable();
    }

    /// Consume the peer's pending writable-notification request without
    /// committing. [`commit_and_notify`](Self::commit_and_notify) is the
    /// normal path; this exists for direct harness-level draining.
    pub fn take_writable_request(&self) -> bool {
        self.ring.take_writable_request()
    }

    /// Doorbell rung when the peer produces data (or on disconnect).
    pub fn readable_bell(&self) -> Arc<Notify> {
        self.readable_bell.clone()
    }
}

/// A connected duplex endpoint. Split into its two halves before wiring
/// them into the send and receive pumps.
pub struct FramedChannel {
    send: SendChannel,
    recv: ReceiveChannel,
    disconnect: DisconnectHandle,
}

impl FramedChannel {
    pub fn split(self) -> (SendChannel, ReceiveChannel, DisconnectHandle) {
        (self.send, self.recv, self.disconnect)
    }

    pub fn disconnect_handle(&self) -> DisconnectHandle {
        self.disconnect.clone()
    }

    /// Build two cross-wired endpoints over heap rings. Endpoint `a`'s
    /// send ring is endpoint `b`'s receive ring and vice versa.
    pub fn loopback_pair(capacity: usize) -> Result<(FramedChannel, FramedChannel), IpcError> {
        let a_to_b = RingBuffer::new_heap(capacity)?;
        let b_to_a = RingBuffer::new_heap(capacity)?;

        let a_readable = Arc::new(Notify::new());
        let a_writable = Arc::new(Notify::new());
        let b_readable = Arc::new(Notify::new());
        let b_writable = Arc::new(Notify::new());

        let a_flag = Arc::new(AtomicBool::new(false));
        let b_flag = Arc::new(AtomicBool::new(false));

        let a = FramedChannel {
            send: SendChannel {
                ring: RingProducer::new(a_to_b.clone()),
                writable_bell: a_writable.clone(),
                peer: PeerNotifier::Local(b_readable.clone()),
                disconnected: a_flag.clone(),
            },
            recv: ReceiveChannel {
                ring: RingConsumer::new(b_to_a.clone()),
                readable_bell: a_readable.clone(),
                peer: PeerNotifier::Local(b_writable.clone()),
                disconnected: a_flag.clone(),
            },
            disconnect: DisconnectHandle::new(a_flag, vec![a_readable, a_writable]),
        };

        let b = FramedChannel {
            send: SendChannel {
                ring: RingProducer::new(b_to_a),
                writable_bell: b_writable.clone(),
                peer: PeerNotifier::Local(a.recv.readable_bell.clone()),
                disconnected: b_flag.clone(),
            },
            recv: ReceiveChannel {
                ring: RingConsumer::new(a_to_b),
                readable_bell: b_readable.clone(),
                peer: PeerNotifier::Local(a.send.writable_bell.clone()),
                disconnected: b_flag.clone(),
            },
            disconnect: DisconnectHandle::new(b_flag, vec![b_readable, b_writable]),
        };

        Ok((a, b))
    }

    /// Establish the real connection to the daemon: create the two ring
    /// segments, announce them over the well-known Unix socket and keep
    /// the socket as the notification carrier.
    pub async fn connect(config: &IpcConfig) -> Result<FramedChannel, IpcError> {
        config.validate()?;

        let stream = UnixStream::connect(config.socket_path()).await?;
        let connection_id = Uuid::new_v4().simple().to_string();
        let tx_name = format!("sic-{}-tx", connection_id);
        let rx_name = format!("sic-{}-rx", connection_id);

        let tx_ring = RingBuffer::create_shared(&tx_name, config.ring_capacity)?;
        let rx_ring = RingBuffer::create_shared(&rx_name, config.ring_capacity)?;

        let (mut read_half, mut write_half) = stream.into_split();

        // Announce the segments; the daemon maps them and acknowledges.
        let hello = format!(
            "SOMEIP-IPC/{} {} {} {}\n",
            PROTOCOL_VERSION, tx_name, rx_name, config.ring_capacity
        );
        write_half.write_all(hello.as_bytes()).await?;

        let mut ack = [0u8; 1];
        read_half.read_exact(&mut ack).await?;
        if ack[0] != HANDSHAKE_ACK {
            return Err(IpcError::ProtocolViolation("daemon rejected the handshake"));
        }
        debug!(connection = %connection_id, "IPC connection established");

        let readable_bell = Arc::new(Notify::new());
        let writable_bell = Arc::new(Notify::new());
        let flag = Arc::new(AtomicBool::new(false));
        let disconnect = DisconnectHandle::new(
            flag.clone(),
            vec![readable_bell.clone(), writable_bell.clone()],
        );

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<u8>();

        // Outbound notification pump: tagged bytes toward the daemon.
        let writer_disconnect = disconnect.clone();
        tokio::spawn(async move {
            while let Some(tag) = outbound_rx.recv().await {
                if write_half.write_all(&[tag]).await.is_err() {
                    break;
                }
            }
            writer_disconnect.trigger();
        });

        // Inbound notification pump: daemon wakeups onto the doorbells.
        let reader_disconnect = disconnect.clone();
        let reader_readable = readable_bell.clone();
        let reader_writable = writable_bell.clone();
        tokio::spawn(async move {
            let mut byte = [0u8; 1];
            loop {
                match read_half.read_exact(&mut byte).await {
                    Ok(_) => match byte[0] {
                        NOTIFY_READABLE => reader_readable.notify_one(),
                        NOTIFY_WRITABLE => reader_writable.notify_one(),
                        other => warn!(value = other, "unknown notification byte ignored"),
                    },
                    Err(_) => {
                        debug!("daemon closed the notification socket");
                        reader_disconnect.trigger();
                        break;
                    }
                }
            }
        });

        Ok(FramedChannel {
            send: SendChannel {
                ring: RingProducer::new(tx_ring),
                writable_bell,
                peer: PeerNotifier::Socket {
                    outbound: outbound.clone(),
                    tag: NOTIFY_READABLE,
                },
                disconnected: flag.clone(),
            },
            recv: ReceiveChannel {
                ring: RingConsumer::new(rx_ring),
                readable_bell,
                peer: PeerNotifier::Socket {
                    outbound,
                    tag: NOTIFY_WRITABLE,
                },
                disconnected: flag,
            },
            disconnect,
        })
    }
}
