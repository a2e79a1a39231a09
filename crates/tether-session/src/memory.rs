//! In-memory loopback transport for tests and demos.
//!
//! Models the contract the session drives: an open frame exchanges peer id,
//! user data and the advertised extension list; the handshake fires only
//! when both endpoints announce the same first-feed discovery key (a key
//! mismatch ends the stream, the way mismatched MAC keys would); extension
//! frames are delivered only for names advertised by both peers.

use std::collections::VecDeque;
use std::io;

use rand::RngCore;
use tokio::sync::mpsc;

use tether_wire::discovery_key;

use crate::transport::{Transport, TransportEvent};

const WIRE_CHANNEL_SIZE: usize = 256;

#[derive(Debug, Clone)]
enum WireFrame {
    Open {
        id: [u8; 32],
        user_data: Vec<u8>,
        extensions: Vec<String>,
        discovery_key: Option<[u8; 32]>,
    },
    Feed {
        discovery_key: [u8; 32],
    },
    Extension {
        name: String,
        payload: Vec<u8>,
    },
    Destroy,
}

#[derive(Debug)]
struct RemoteInfo {
    id: [u8; 32],
    user_data: Vec<u8>,
    extensions: Vec<String>,
    discovery_key: Option<[u8; 32]>,
}

/// One endpoint of an in-memory duplex pair.
pub struct MemoryTransport {
    local_id: [u8; 32],
    user_data: Vec<u8>,
    advertised: Vec<String>,
    first_key: Option<Vec<u8>>,
    started: bool,
    handshaken: bool,
    closed: bool,
    destroyed: bool,
    tx: mpsc::Sender<WireFrame>,
    rx: mpsc::Receiver<WireFrame>,
    remote: Option<RemoteInfo>,
    pending: VecDeque<TransportEvent>,
    /// Extension frames that raced ahead of the handshake; flushed once it
    /// completes.
    held_frames: Vec<(String, Vec<u8>)>,
}

impl MemoryTransport {
    /// Create a connected endpoint pair with random ids.
    pub fn pair() -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::channel(WIRE_CHANNEL_SIZE);
        let (b_tx, a_rx) = mpsc::channel(WIRE_CHANNEL_SIZE);
        (Self::endpoint(a_tx, a_rx), Self::endpoint(b_tx, b_rx))
    }

    fn endpoint(tx: mpsc::Sender<WireFrame>, rx: mpsc::Receiver<WireFrame>) -> Self {
        let mut local_id = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut local_id);
        Self {
            local_id,
            user_data: Vec::new(),
            advertised: Vec::new(),
            first_key: None,
            started: false,
            handshaken: false,
            closed: false,
            destroyed: false,
            tx,
            rx,
            remote: None,
            pending: VecDeque::new(),
            held_frames: Vec::new(),
        }
    }

    async fn transmit(&mut self, frame: WireFrame) {
        if self.tx.send(frame).await.is_err() {
            // The peer endpoint is gone; this stream is over.
            self.closed = true;
        }
    }

    fn absorb(&mut self, frame: WireFrame) {
        match frame {
            WireFrame::Open {
                id,
                user_data,
                extensions,
                discovery_key,
            } => {
                if let Some(key) = discovery_key {
                    self.pending
                        .push_back(TransportEvent::Feed { discovery_key: key });
                }
                self.remote = Some(RemoteInfo {
                    id,
                    user_data,
                    extensions,
                    discovery_key,
                });
                self.check_handshake();
            }
            WireFrame::Feed { discovery_key } => {
                self.pending.push_back(TransportEvent::Feed { discovery_key });
                if let Some(remote) = &mut self.remote {
                    if remote.discovery_key.is_none() {
                        remote.discovery_key = Some(discovery_key);
                    }
                }
                self.check_handshake();
            }
            WireFrame::Extension { name, payload } => {
                if self.handshaken {
                    self.push_extension_event(name, payload);
                } else {
                    self.held_frames.push((name, payload));
                }
            }
            WireFrame::Destroy => self.closed = true,
        }
    }

    fn push_extension_event(&mut self, name: String, payload: Vec<u8>) {
        let local = self.advertised.iter().any(|n| n == &name);
        let remote = self
            .remote
            .as_ref()
            .map_or(false, |r| r.extensions.iter().any(|n| n == &name));
        if local && remote {
            self.pending
                .push_back(TransportEvent::Extension { name, payload });
        }
    }

    fn check_handshake(&mut self) {
        if self.handshaken {
            return;
        }
        let local_key = match &self.first_key {
            Some(key) => discovery_key(key),
            None => return,
        };
        let remote_key = match self.remote.as_ref().and_then(|r| r.discovery_key) {
            Some(key) => key,
            None => return,
        };
        if local_key == remote_key {
            self.handshaken = true;
            self.pending.push_back(TransportEvent::Handshake);
            let held = std::mem::take(&mut self.held_frames);
            for (name, payload) in held {
                self.push_extension_event(name, payload);
            }
        } else {
            // The peers fed different keys; the per-message MACs would never
            // line up, so the stream dies here.
            self.closed = true;
        }
    }
}

impl Transport for MemoryTransport {
    fn local_id(&self) -> [u8; 32] {
        self.local_id
    }

    fn remote_id(&self) -> Option<[u8; 32]> {
        if self.handshaken {
            self.remote.as_ref().map(|r| r.id)
        } else {
            None
        }
    }

    fn set_user_data(&mut self, data: Vec<u8>) {
        self.user_data = data;
    }

    fn remote_user_data(&self) -> Option<Vec<u8>> {
        if self.handshaken {
            self.remote.as_ref().map(|r| r.user_data.clone())
        } else {
            None
        }
    }

    fn advertise(&mut self, name: &str) {
        self.advertised.push(name.to_owned());
    }

    async fn start(&mut self) -> io::Result<()> {
        if self.started {
            return Ok(());
        }
        self.started = true;
        let frame = WireFrame::Open {
            id: self.local_id,
            user_data: self.user_data.clone(),
            extensions: self.advertised.clone(),
            discovery_key: self.first_key.as_deref().map(discovery_key),
        };
        self.transmit(frame).await;
        Ok(())
    }

    async fn feed(&mut self, key: &[u8]) -> io::Result<()> {
        let announced = discovery_key(key);
        if self.first_key.is_none() {
            self.first_key = Some(key.to_vec());
            if self.started {
                self.transmit(WireFrame::Feed {
                    discovery_key: announced,
                })
                .await;
            }
            self.check_handshake();
        } else {
            self.transmit(WireFrame::Feed {
                discovery_key: announced,
            })
            .await;
        }
        Ok(())
    }

    async fn send_extension(&mut self, name: &str, payload: Vec<u8>) -> io::Result<()> {
        self.transmit(WireFrame::Extension {
            name: name.to_owned(),
            payload,
        })
        .await;
        Ok(())
    }

    async fn next_event(&mut self) -> io::Result<Option<TransportEvent>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(Some(event));
            }
            if self.closed {
                return Ok(None);
            }
            match self.rx.recv().await {
                Some(frame) => self.absorb(frame),
                None => self.closed = true,
            }
        }
    }

    async fn destroy(&mut self) -> io::Result<()> {
        if !self.destroyed {
            self.destroyed = true;
            self.closed = true;
            let _ = self.tx.try_send(WireFrame::Destroy);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn handshake_pair() -> (MemoryTransport, MemoryTransport) {
        let (mut a, mut b) = MemoryTransport::pair();
        let topic = [7u8; 32];
        a.advertise("chat");
        b.advertise("chat");
        a.feed(&topic).await.unwrap();
        b.feed(&topic).await.unwrap();
        a.start().await.unwrap();
        b.start().await.unwrap();
        assert!(matches!(
            a.next_event().await.unwrap(),
            Some(TransportEvent::Feed { .. })
        ));
        assert_eq!(a.next_event().await.unwrap(), Some(TransportEvent::Handshake));
        assert!(matches!(
            b.next_event().await.unwrap(),
            Some(TransportEvent::Feed { .. })
        ));
        assert_eq!(b.next_event().await.unwrap(), Some(TransportEvent::Handshake));
        (a, b)
    }

    #[tokio::test]
    async fn handshake_requires_matching_keys() {
        let (a, b) = handshake_pair().await;
        assert!(a.remote_id().is_some());
        assert_eq!(a.remote_id(), Some(b.local_id()));
        assert_eq!(b.remote_id(), Some(a.local_id()));
    }

    #[tokio::test]
    async fn mismatched_keys_end_the_stream() {
        let (mut a, mut b) = MemoryTransport::pair();
        a.feed(&[1u8; 32]).await.unwrap();
        b.feed(&[2u8; 32]).await.unwrap();
        a.start().await.unwrap();
        b.start().await.unwrap();

        // Each side sees the other's feed reference, then end of stream.
        assert!(matches!(
            a.next_event().await.unwrap(),
            Some(TransportEvent::Feed { .. })
        ));
        assert_eq!(a.next_event().await.unwrap(), None);
        assert!(matches!(
            b.next_event().await.unwrap(),
            Some(TransportEvent::Feed { .. })
        ));
        assert_eq!(b.next_event().await.unwrap(), None);
    }

    #[tokio::test]
    async fn frames_flow_only_on_advertised_intersection() {
        let (mut a, mut b) = handshake_pair().await;

        a.send_extension("chat", b"hello".to_vec()).await.unwrap();
        a.send_extension("not-advertised", b"nope".to_vec())
            .await
            .unwrap();
        a.send_extension("chat", b"again".to_vec()).await.unwrap();

        assert_eq!(
            b.next_event().await.unwrap(),
            Some(TransportEvent::Extension {
                name: "chat".to_owned(),
                payload: b"hello".to_vec(),
            })
        );
        // The unadvertised frame is dropped; the next event is the second
        // chat frame.
        assert_eq!(
            b.next_event().await.unwrap(),
            Some(TransportEvent::Extension {
                name: "chat".to_owned(),
                payload: b"again".to_vec(),
            })
        );
    }

    #[tokio::test]
    async fn frames_sent_before_handshake_are_held() {
        let (mut a, mut b) = MemoryTransport::pair();
        let topic = [9u8; 32];
        a.advertise("chat");
        b.advertise("chat");

        a.feed(&topic).await.unwrap();
        a.start().await.unwrap();
        a.send_extension("chat", b"early".to_vec()).await.unwrap();

        // B has not fed its key yet; the chat frame must wait, not vanish.
        b.start().await.unwrap();
        b.feed(&topic).await.unwrap();

        let mut saw_frame = false;
        for _ in 0..4 {
            match b.next_event().await.unwrap() {
                Some(TransportEvent::Extension { name, payload }) => {
                    assert_eq!(name, "chat");
                    assert_eq!(payload, b"early".to_vec());
                    saw_frame = true;
                    break;
                }
                Some(_) => continue,
                None => break,
            }
        }
        assert!(saw_frame);
    }

    #[tokio::test]
    async fn destroy_ends_the_peer_stream() {
        let (mut a, mut b) = handshake_pair().await;
        a.destroy().await.unwrap();
        assert_eq!(b.next_event().await.unwrap(), None);
        assert_eq!(a.next_event().await.unwrap(), None);
    }

    #[tokio::test]
    async fn user_data_is_exchanged_at_handshake() {
        let (mut a, mut b) = MemoryTransport::pair();
        let topic = [3u8; 32];
        a.set_user_data(b"from-a".to_vec());
        b.set_user_data(b"from-b".to_vec());
        a.feed(&topic).await.unwrap();
        b.feed(&topic).await.unwrap();
        a.start().await.unwrap();
        b.start().await.unwrap();

        while a.next_event().await.unwrap() != Some(TransportEvent::Handshake) {}
        while b.next_event().await.unwrap() != Some(TransportEvent::Handshake) {}

        assert_eq!(a.remote_user_data(), Some(b"from-b".to_vec()));
        assert_eq!(b.remote_user_data(), Some(b"from-a".to_vec()));
    }
}
