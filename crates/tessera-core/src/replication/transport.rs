// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Shard-to-shard messaging.
//!
//! Frame layout:
//!
//! ``LENGTH(4, big-endian) || PAYLOAD || CHECKSUM(32)``
//!
//! * PAYLOAD is a CBOR-encoded [`ShardMessage`]
//! * CHECKSUM = blake3-256 over LENGTH || PAYLOAD
//!
//! Shards exchange only completion notices for points they own, replication
//! digests and reduction partials; operation streams are never shipped.

use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Mutex, PoisonError};

use blake3::Hasher;
use serde::{Deserialize, Serialize};

use crate::domain::DomainPoint;
use crate::error::ReplicationError;
use crate::ident::ShardId;

/// Outcome of a remotely executed point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PointValue {
    /// The point's return value.
    Value(Vec<u8>),
    /// The point was predicated false.
    Empty,
    /// The point failed.
    Failed(String),
}

/// Messages exchanged between shards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardMessage {
    /// A point owned by the sender finished.
    PointComplete {
        /// Sequence number of the launching operation.
        seq: u64,
        /// Launch point.
        point: DomainPoint,
        /// Result.
        value: PointValue,
    },
    /// Digest of the sender's sharding and projection decisions for `seq`.
    Digest {
        /// Sequence number of the launch.
        seq: u64,
        /// Sender.
        shard: ShardId,
        /// blake3 digest.
        digest: Vec<u8>,
    },
    /// Partial value of an unordered all-reduce.
    Reduce {
        /// Collective instance (per-shard counter, identical on every shard).
        tag: u64,
        /// Butterfly round.
        round: u32,
        /// Sender.
        from: ShardId,
        /// Partial reduction.
        value: Vec<u8>,
    },
    /// The sender finished its program after `launches` digested launches.
    Done {
        /// Sender.
        shard: ShardId,
        /// Launches digested by the sender.
        launches: u64,
    },
    /// Stops the receiving shard's message router.
    Shutdown,
}

impl ShardMessage {
    /// Encodes a checksummed frame.
    pub fn encode(&self) -> Result<Vec<u8>, ReplicationError> {
        let mut payload = Vec::new();
        ciborium::into_writer(self, &mut payload).map_err(|e| ReplicationError::Codec(e.to_string()))?;
        let len = u32::try_from(payload.len()).map_err(|e| ReplicationError::Codec(e.to_string()))?;
        let mut out = Vec::with_capacity(4 + payload.len() + 32);
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(&payload);
        let mut hasher = Hasher::new();
        hasher.update(&out);
        out.extend_from_slice(hasher.finalize().as_bytes());
        Ok(out)
    }

    /// Decodes and verifies a frame.
    pub fn decode(bytes: &[u8]) -> Result<Self, ReplicationError> {
        if bytes.len() < 4 + 32 {
            return Err(ReplicationError::Codec("incomplete frame".into()));
        }
        let len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        if bytes.len() != 4 + len + 32 {
            return Err(ReplicationError::Codec("frame length mismatch".into()));
        }
        let (body, checksum) = bytes.split_at(4 + len);
        let mut hasher = Hasher::new();
        hasher.update(body);
        if hasher.finalize().as_bytes() != checksum {
            return Err(ReplicationError::Codec("checksum mismatch".into()));
        }
        ciborium::from_reader(&body[4..]).map_err(|e| ReplicationError::Codec(e.to_string()))
    }
}

/// Point-to-point byte transport between the shards of one replicated run.
pub trait Transport: Send + Sync {
    /// This endpoint's shard.
    fn shard(&self) -> ShardId;
    /// Number of shards.
    fn shards(&self) -> usize;
    /// Sends a frame to `to`.
    fn send(&self, to: ShardId, frame: Vec<u8>) -> Result<(), ReplicationError>;
    /// Blocks for the next frame addressed to this shard.
    fn recv(&self) -> Result<Vec<u8>, ReplicationError>;
}

/// Encodes and sends `msg`.
pub fn send_message(transport: &dyn Transport, to: ShardId, msg: &ShardMessage) -> Result<(), ReplicationError> {
    if to.index() >= transport.shards() {
        return Err(ReplicationError::ShardOutOfRange {
            shard: to,
            shards: transport.shards(),
        });
    }
    transport.send(to, msg.encode()?)
}

/// Receives and decodes the next message.
pub fn recv_message(transport: &dyn Transport) -> Result<ShardMessage, ReplicationError> {
    ShardMessage::decode(&transport.recv()?)
}

/// Channel mesh connecting shards of one process.
#[derive(Debug)]
pub struct InMemoryTransport {
    shard: ShardId,
    peers: Vec<Sender<Vec<u8>>>,
    inbox: Mutex<Receiver<Vec<u8>>>,
}

impl InMemoryTransport {
    /// Fully connected mesh of `shards` endpoints, indexed by shard.
    pub fn mesh(shards: usize) -> Vec<Self> {
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..shards).map(|_| channel()).unzip();
        receivers
            .into_iter()
            .enumerate()
            .map(|(i, inbox)| Self {
                shard: ShardId::from_raw(i as u32),
                peers: senders.clone(),
                inbox: Mutex::new(inbox),
            })
            .collect()
    }
}

impl Transport for InMemoryTransport {
    fn shard(&self) -> ShardId {
        self.shard
    }

    fn shards(&self) -> usize {
        self.peers.len()
    }

    fn send(&self, to: ShardId, frame: Vec<u8>) -> Result<(), ReplicationError> {
        let peer = self.peers.get(to.index()).ok_or(ReplicationError::ShardOutOfRange {
            shard: to,
            shards: self.peers.len(),
        })?;
        peer.send(frame)
            .map_err(|_| ReplicationError::Transport(format!("shard {to} is gone")))
    }

    fn recv(&self) -> Result<Vec<u8>, ReplicationError> {
        self.inbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .recv()
            .map_err(|_| ReplicationError::Transport("all peers disconnected".into()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn frames_reject_corruption() {
        let msg = ShardMessage::PointComplete {
            seq: 4,
            point: DomainPoint::p2(1, -2),
            value: PointValue::Value(vec![1, 2, 3]),
        };
        let mut frame = msg.encode().unwrap();
        assert_eq!(ShardMessage::decode(&frame).unwrap(), msg);
        let mid = frame.len() / 2;
        frame[mid] ^= 0xFF;
        assert!(matches!(ShardMessage::decode(&frame), Err(ReplicationError::Codec(_))));
        assert!(ShardMessage::decode(&[0, 0]).is_err());
    }

    #[test]
    fn mesh_delivers_point_to_point() {
        let mesh = InMemoryTransport::mesh(3);
        send_message(&mesh[0], ShardId::from_raw(2), &ShardMessage::Shutdown).unwrap();
        send_message(
            &mesh[1],
            ShardId::from_raw(2),
            &ShardMessage::Done {
                shard: ShardId::from_raw(1),
                launches: 7,
            },
        )
        .unwrap();
        assert_eq!(recv_message(&mesh[2]).unwrap(), ShardMessage::Shutdown);
        assert!(matches!(recv_message(&mesh[2]).unwrap(), ShardMessage::Done { launches: 7, .. }));
        assert!(send_message(&mesh[0], ShardId::from_raw(3), &ShardMessage::Shutdown).is_err());
    }
}
