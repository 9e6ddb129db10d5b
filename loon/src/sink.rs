// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! The outbound byte path of one session.
//!
//! The broker core hands every encoded packet to a `PacketSink` and reacts
//! to the outcome; it never touches a socket itself. The server wires a
//! channel-backed sink to each connection task, tests use `BufferSink`.

use tokio::sync::mpsc;

use crate::commands::ListenerToConnectionCmd;

/// Result of handing one packet to the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkOutcome {
    /// Bytes accepted for transmission.
    Written,

    /// The outbound path is congested; retry on the next tick. The caller
    /// must leave its state unchanged.
    WouldBlock,

    /// The peer is gone; the connection is unusable.
    Closed,
}

pub trait PacketSink: Send {
    fn write(&mut self, bytes: &[u8]) -> SinkOutcome;
}

/// Forwards packets to the connection task owning the socket.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: mpsc::Sender<ListenerToConnectionCmd>,
}

impl ChannelSink {
    #[must_use]
    pub const fn new(sender: mpsc::Sender<ListenerToConnectionCmd>) -> Self {
        Self { sender }
    }
}

impl PacketSink for ChannelSink {
    fn write(&mut self, bytes: &[u8]) -> SinkOutcome {
        match self
            .sender
            .try_send(ListenerToConnectionCmd::Send(bytes.to_vec()))
        {
            Ok(()) => SinkOutcome::Written,
            Err(mpsc::error::TrySendError::Full(_)) => SinkOutcome::WouldBlock,
            Err(mpsc::error::TrySendError::Closed(_)) => SinkOutcome::Closed,
        }
    }
}

/// Collects packets in memory; the test double for a connection.
#[derive(Debug, Default)]
pub struct BufferSink {
    frames: Vec<Vec<u8>>,
    outcome: SinkOutcome,
}

impl Default for SinkOutcome {
    fn default() -> Self {
        Self::Written
    }
}

impl BufferSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All frames written so far, oldest first.
    #[must_use]
    pub fn frames(&self) -> &[Vec<u8>] {
        &self.frames
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }

    /// Make subsequent writes report `outcome` instead of accepting bytes.
    pub fn set_outcome(&mut self, outcome: SinkOutcome) {
        self.outcome = outcome;
    }
}

impl PacketSink for BufferSink {
    fn write(&mut self, bytes: &[u8]) -> SinkOutcome {
        if self.outcome == SinkOutcome::Written {
            self.frames.push(bytes.to_vec());
        }
        self.outcome
    }
}

// Lets a test keep a handle on the sink after handing it to the broker.
impl PacketSink for std::sync::Arc<std::sync::Mutex<BufferSink>> {
    fn write(&mut self, bytes: &[u8]) -> SinkOutcome {
        match self.lock() {
            Ok(mut sink) => sink.write(bytes),
            Err(_) => SinkOutcome::Closed,
        }
    }
}
