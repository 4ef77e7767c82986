//! Shared test harness: a hand-rolled fake daemon driving the far end of
//! a loopback channel. Framing is implemented independently of the
//! library's writer so the engine is exercised against a second
//! implementation of the wire format.

#![allow(dead_code)]

use someip_ipc_client::ipc::channel::{FramedChannel, ReceiveChannel, SendChannel};
use someip_ipc_client::ipc::protocol::{CommonHeader, FramePreamble, SpecificHeader};

pub struct FakeDaemon {
    pub send: SendChannel,
    pub recv: ReceiveChannel,
    tx_sequence: u32,
    rx_sequence: u32,
}

impl FakeDaemon {
    pub fn new(endpoint: FramedChannel) -> Self {
        let (send, recv, _) = endpoint.split();
        Self {
            send,
            recv,
            tx_sequence: 0,
            rx_sequence: 0,
        }
    }

    /// Frame one daemon-to-application message.
    pub fn frame(&mut self, message_type: u32, specific: SpecificHeader, payload: &[u8]) -> Vec<u8> {
        let common = CommonHeader::new(message_type, payload.len());
        let preamble = FramePreamble {
            sequence: self.tx_sequence,
            length_check: common.length,
        };
        self.tx_sequence = self.tx_sequence.wrapping_add(1);
        let mut out = Vec::with_capacity(24 + payload.len());
        out.extend_from_slice(&preamble.encode());
        out.extend_from_slice(&common.encode());
        out.extend_from_slice(&specific.encode());
        out.extend_from_slice(payload);
        out
    }

    /// Stream raw bytes into the ring, suspending on backpressure, with
    /// one commit-and-notify per piece written.
    pub async fn send_bytes(&mut self, bytes: &[u8]) {
        let mut offset = 0;
        while offset < bytes.len() {
            let available = self.send.available_write().unwrap();
            if available == 0 {
                self.send.request_writable();
                if self.send.available_write().unwrap() == 0 {
                    self.send.writable_bell().notified().await;
                    continue;
                }
                continue;
            }
            let n = available.min(bytes.len() - offset);
            self.send.write(&bytes[offset..offset + n]);
            let was_empty = self.send.peer_sees_empty();
            self.send.commit();
            if self.send.take_readable_request() || was_empty {
                self.send.notify_peer_readable();
            }
            offset += n;
        }
    }

    /// Frame and send one whole message.
    pub async fn send_message(&mut self, message_type: u32, specific: SpecificHeader, payload: &[u8]) {
        let frame = self.frame(message_type, specific, payload);
        self.send_bytes(&frame).await;
    }

    /// Frame one message and deliver it in the given piece sizes, cycling
    /// through them until the frame is exhausted.
    pub async fn send_message_chunked(
        &mut self,
        message_type: u32,
        specific: SpecificHeader,
        payload: &[u8],
        chunk_sizes: &[usize],
    ) {
        let frame = self.frame(message_type, specific, payload);
        let mut offset = 0;
        let mut sizes = chunk_sizes.iter().copied().cycle();
        while offset < frame.len() {
            let n = sizes.next().unwrap().min(frame.len() - offset);
            self.send_bytes(&frame[offset..offset + n]).await;
            tokio::task::yield_now().await;
            offset += n;
        }
    }

    async fn read_exact(&mut self, buf: &mut [u8]) {
        let mut offset = 0;
        while offset < buf.len() {
            let available = self.recv.available_read().unwrap();
            if available == 0 {
                self.recv.request_readable();
                if self.recv.available_read().unwrap() == 0 {
                    self.recv.readable_bell().notified().await;
                }
                continue;
            }
            let n = available.min(buf.len() - offset);
            self.recv.read_into(&mut buf[offset..offset + n]);
            self.recv.commit_and_notify();
            offset += n;
        }
    }

    /// Read and validate one application-to-daemon frame.
    pub async fn read_frame(&mut self) -> (CommonHeader, SpecificHeader, Vec<u8>) {
        let mut head = [0u8; 24];
        self.read_exact(&mut head).await;
        let preamble = FramePreamble::decode(&head[..8]);
        assert_eq!(preamble.sequence, self.rx_sequence, "sequence break");
        self.rx_sequence = self.rx_sequence.wrapping_add(1);
        let common = CommonHeader::decode(&head[8..20]);
        assert_eq!(common.length, preamble.length_check, "length check");
        let specific = SpecificHeader::decode(&head[20..24]);
        let mut payload = vec![0u8; common.payload_len()];
        self.read_exact(&mut payload).await;
        (common, specific, payload)
    }
}
