//! Traffic counters, publish-only; readers accept eventual consistency.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::messages::MessageType;

/// Coarse message classification for counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Response,
    Error,
}

impl MessageKind {
    pub fn of(message_type: &MessageType) -> Self {
        match message_type {
            MessageType::Request(_) => MessageKind::Request,
            MessageType::Response(_) => MessageKind::Response,
            MessageType::Error(_) => MessageKind::Error,
        }
    }

    fn index(&self) -> usize {
        match self {
            MessageKind::Request => 0,
            MessageKind::Response => 1,
            MessageKind::Error => 2,
        }
    }
}

#[derive(Debug, Default)]
pub struct RpcStats {
    sent_bytes: AtomicU64,
    received_bytes: AtomicU64,
    sent_messages: [AtomicU64; 3],
    received_messages: [AtomicU64; 3],
    timeouts: AtomicU64,
}

impl RpcStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add_sent_message(&self, message_type: &MessageType) {
        self.sent_messages[MessageKind::of(message_type).index()]
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_received_message(&self, message_type: &MessageType) {
        self.received_messages[MessageKind::of(message_type).index()]
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_sent_bytes(&self, bytes: usize) {
        self.sent_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn add_received_bytes(&self, bytes: usize) {
        self.received_bytes
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn add_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    // === Getters ===

    /// Bytes on the wire, including the per-family IP+UDP header overhead.
    pub fn sent_bytes(&self) -> u64 {
        self.sent_bytes.load(Ordering::Relaxed)
    }

    pub fn received_bytes(&self) -> u64 {
        self.received_bytes.load(Ordering::Relaxed)
    }

    pub fn sent_count(&self, kind: MessageKind) -> u64 {
        self.sent_messages[kind.index()].load(Ordering::Relaxed)
    }

    pub fn received_count(&self, kind: MessageKind) -> u64 {
        self.received_messages[kind.index()].load(Ordering::Relaxed)
    }

    pub fn timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::messages::{ErrorSpecific, MessageType};

    #[test]
    fn counts_by_kind() {
        let stats = RpcStats::new();
        let error = MessageType::Error(ErrorSpecific {
            code: 201,
            description: "".into(),
        });

        stats.add_sent_message(&error);
        stats.add_received_message(&error);
        stats.add_received_message(&error);

        assert_eq!(stats.sent_count(MessageKind::Error), 1);
        assert_eq!(stats.received_count(MessageKind::Error), 2);
        assert_eq!(stats.sent_count(MessageKind::Request), 0);
    }
}
