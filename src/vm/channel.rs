//! Typed FIFO channels.

use std::fmt;

use im::Vector;
use serde::{Deserialize, Serialize};

use crate::types::{Literal, Pid, Type};

/// Channel identity: the sender endpoint. A sender port carries at most one
/// channel, so `(sender_pid, port)` is a key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChannelId {
    /// Sending process.
    pub pid: Pid,
    /// Out-port name on the sender.
    pub port: String,
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.pid, self.port)
    }
}

/// A channel: unbounded FIFO of tuple messages from one sender endpoint to
/// one receiver endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct Channel {
    /// Component types every message must match.
    pub types: Vec<Type>,
    /// Receiving endpoint: process and in-port name.
    pub receiver: (Pid, String),
    /// Queued messages, each a `Literal::Tuple` of the components. The
    /// persistent vector keeps model-checker snapshots cheap to clone.
    pub queue: Vector<Literal>,
    /// Messages ever sent; per-channel monotonic numbering for the message
    /// flow log. Observational only; excluded from canonical hashing.
    pub sent: u64,
}

impl Channel {
    /// Fresh empty channel.
    pub fn new(types: Vec<Type>, receiver: (Pid, String)) -> Self {
        Channel {
            types,
            receiver,
            queue: Vector::new(),
            sent: 0,
        }
    }

    /// Sequence number of the message at the front of the queue.
    pub fn front_number(&self) -> u64 {
        self.sent - self.queue.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_id_ordering() {
        let a = ChannelId {
            pid: Pid(1),
            port: "out".into(),
        };
        let b = ChannelId {
            pid: Pid(2),
            port: "aaa".into(),
        };
        // Sender pid dominates the port name.
        assert!(a < b);
    }

    #[test]
    fn test_front_number() {
        let mut ch = Channel::new(vec![Type::Int], (Pid(2), "inp".into()));
        ch.queue.push_back(Literal::Tuple(vec![Literal::Int(0)]));
        ch.sent = 1;
        assert_eq!(ch.front_number(), 0);
        ch.queue.push_back(Literal::Tuple(vec![Literal::Int(1)]));
        ch.sent = 2;
        assert_eq!(ch.front_number(), 0);
        ch.queue.pop_front();
        assert_eq!(ch.front_number(), 1);
    }
}
