//! Transport seam and the in-memory broadcast link used by simulations and tests.
//!
//! The engine only needs to open, close, send to an optional address
//! (broadcast when `None`) and poll for one frame without blocking.

use std::collections::{HashMap, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rand::Rng;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport is closed")]
    Closed,
    #[error("invalid port {0:?}")]
    InvalidPort(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub trait Transport: Send {
    /// Peer address as the transport sees it; cached per talker name.
    type Address: Clone + Eq + Hash + Debug + Send + 'static;

    fn open(&mut self) -> Result<(), TransportError>;
    fn close(&mut self);
    fn is_open(&self) -> bool;
    /// Send one frame; `None` broadcasts.
    fn send(&mut self, bytes: &[u8], to: Option<&Self::Address>) -> Result<(), TransportError>;
    /// One complete frame if available. Never blocks.
    fn receive(&mut self) -> Option<(Vec<u8>, Option<Self::Address>)>;
    fn port(&self) -> String;
    /// Switch port; an open transport is reopened on the new one.
    fn set_port(&mut self, port: &str) -> Result<(), TransportError>;
    /// Short human-readable description, reported by SYS SOCKET.
    fn describe(&self) -> String;
}

/// Default port shared by every transport.
pub const DEFAULT_PORT: u16 = 5005;

#[derive(Debug, Default)]
struct Node {
    open: bool,
    port: u16,
    queue: VecDeque<(Vec<u8>, u16)>,
}

#[derive(Debug, Default)]
struct Hub {
    nodes: HashMap<u16, Node>,
    next_node: u16,
    corruption: f64,
    corrupt_next: usize,
}

/// In-memory broadcast medium. Clones share the same medium.
#[derive(Debug, Clone, Default)]
pub struct SimLink {
    hub: Arc<Mutex<Hub>>,
}

impl SimLink {
    pub fn new() -> Self {
        Self::default()
    }

    fn hub(&self) -> MutexGuard<'_, Hub> {
        self.hub.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// New endpoint on the default port, closed until opened.
    pub fn endpoint(&self) -> SimTransport {
        let mut hub = self.hub();
        hub.next_node = hub.next_node.wrapping_add(1);
        let node = hub.next_node;
        hub.nodes.insert(
            node,
            Node {
                port: DEFAULT_PORT,
                ..Node::default()
            },
        );
        SimTransport {
            link: self.clone(),
            node,
        }
    }

    /// Probability that any delivered frame gets one bit flipped.
    pub fn set_corruption(&self, probability: f64) {
        self.hub().corruption = probability.clamp(0.0, 1.0);
    }

    /// Damage the checksum of the next `frames` frames sent, leaving them
    /// otherwise intact.
    pub fn corrupt_next(&self, frames: usize) {
        self.hub().corrupt_next = frames;
    }

    /// Frames queued across all endpoints.
    pub fn in_flight(&self) -> usize {
        self.hub().nodes.values().map(|n| n.queue.len()).sum()
    }

    fn deliver(&self, from: u16, bytes: &[u8], to: Option<u16>) -> Result<(), TransportError> {
        let mut hub = self.hub();
        let port = match hub.nodes.get(&from) {
            Some(node) if node.open => node.port,
            _ => return Err(TransportError::Closed),
        };
        let mut frame = bytes.to_vec();
        if hub.corrupt_next > 0 {
            hub.corrupt_next -= 1;
            damage_checksum(&mut frame);
        } else if hub.corruption > 0.0 && rand::thread_rng().gen_bool(hub.corruption) {
            flip_random_bit(&mut frame);
        }
        for (&id, node) in hub.nodes.iter_mut() {
            let addressed = to.map_or(true, |t| t == id);
            if id != from && node.open && node.port == port && addressed {
                node.queue.push_back((frame.clone(), from));
            }
        }
        Ok(())
    }
}

/// Flip the low bit of the last checksum digit; the frame stays valid JSON.
fn damage_checksum(frame: &mut [u8]) {
    let Some(colon) = crate::field::locate_colon(frame, crate::protocol::key::CHECKSUM) else {
        flip_random_bit(frame);
        return;
    };
    let start = crate::field::value_position(colon);
    let last = frame[start..]
        .iter()
        .take_while(|b| b.is_ascii_digit())
        .count();
    if last > 0 {
        frame[start + last - 1] ^= 1;
    }
}

fn flip_random_bit(frame: &mut [u8]) {
    if frame.len() > 2 {
        let mut rng = rand::thread_rng();
        let at = rng.gen_range(1..frame.len() - 1);
        frame[at] ^= 1 << rng.gen_range(0..8);
    }
}

/// One endpoint of a [`SimLink`]. Addresses are endpoint numbers.
#[derive(Debug)]
pub struct SimTransport {
    link: SimLink,
    node: u16,
}

impl SimTransport {
    pub fn address(&self) -> u16 {
        self.node
    }
}

impl Transport for SimTransport {
    type Address = u16;

    fn open(&mut self) -> Result<(), TransportError> {
        if let Some(node) = self.link.hub().nodes.get_mut(&self.node) {
            node.open = true;
        }
        Ok(())
    }

    fn close(&mut self) {
        if let Some(node) = self.link.hub().nodes.get_mut(&self.node) {
            node.open = false;
            node.queue.clear();
        }
    }

    fn is_open(&self) -> bool {
        self.link
            .hub()
            .nodes
            .get(&self.node)
            .map_or(false, |n| n.open)
    }

    fn send(&mut self, bytes: &[u8], to: Option<&u16>) -> Result<(), TransportError> {
        self.link.deliver(self.node, bytes, to.copied())
    }

    fn receive(&mut self) -> Option<(Vec<u8>, Option<u16>)> {
        let mut hub = self.link.hub();
        let node = hub.nodes.get_mut(&self.node)?;
        if !node.open {
            return None;
        }
        node.queue.pop_front().map(|(bytes, from)| (bytes, Some(from)))
    }

    fn port(&self) -> String {
        self.link
            .hub()
            .nodes
            .get(&self.node)
            .map(|n| n.port.to_string())
            .unwrap_or_default()
    }

    fn set_port(&mut self, port: &str) -> Result<(), TransportError> {
        let port: u16 = port
            .parse()
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| TransportError::InvalidPort(port.to_string()))?;
        if let Some(node) = self.link.hub().nodes.get_mut(&self.node) {
            node.port = port;
            node.queue.clear();
        }
        Ok(())
    }

    fn describe(&self) -> String {
        let state = if self.is_open() { "open" } else { "closed" };
        format!("SimLink(node={}, port={}, {})", self.node, self.port(), state)
    }
}

impl Drop for SimTransport {
    fn drop(&mut self) {
        self.link.hub().nodes.remove(&self.node);
    }
}
