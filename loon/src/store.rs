// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! The process-wide message store.
//!
//! Every payload accepted by the broker lives here exactly once, shared by
//! all session queues and retained slots that reference it. Holders keep
//! an `Arc<Message>`; the store itself only keeps a `Weak` index entry, so
//! a message is freed the moment its last holder lets go. The `Arc` strong
//! count therefore is the reference count, with cloning and dropping
//! standing in for ref_inc/ref_dec.

use bytes::Bytes;
use codec::v5::Properties;
use codec::QoS;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// One application message, immutable once stored.
#[derive(Debug, Clone)]
pub struct Message {
    db_id: u64,
    topic: String,
    payload: Bytes,
    qos: QoS,
    retain: bool,
    source_id: String,
    source_username: String,
    properties: Properties,

    /// Absolute wall time in seconds after which the message must not be
    /// delivered any more; 0 means it never expires.
    expiry_at: u64,
}

impl Message {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        topic: String,
        payload: Bytes,
        qos: QoS,
        retain: bool,
        source_id: String,
        source_username: String,
        properties: Properties,
        expiry_at: u64,
    ) -> Self {
        Self {
            db_id: 0,
            topic,
            payload,
            qos,
            retain,
            source_id,
            source_username,
            properties,
            expiry_at,
        }
    }

    #[must_use]
    pub const fn db_id(&self) -> u64 {
        self.db_id
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    #[must_use]
    pub const fn payload(&self) -> &Bytes {
        &self.payload
    }

    #[must_use]
    pub const fn qos(&self) -> QoS {
        self.qos
    }

    #[must_use]
    pub const fn retain(&self) -> bool {
        self.retain
    }

    #[must_use]
    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    #[must_use]
    pub fn source_username(&self) -> &str {
        &self.source_username
    }

    #[must_use]
    pub const fn properties(&self) -> &Properties {
        &self.properties
    }

    #[must_use]
    pub const fn expiry_at(&self) -> u64 {
        self.expiry_at
    }

    #[must_use]
    pub const fn is_expired(&self, now_wall: u64) -> bool {
        self.expiry_at != 0 && now_wall > self.expiry_at
    }
}

/// The shared message index.
#[derive(Debug, Default)]
pub struct MessageStore {
    next_db_id: u64,
    messages: HashMap<u64, Weak<Message>>,
}

impl MessageStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a message, assigning its store id. The returned `Arc` is the
    /// first reference; the store itself does not keep the message alive.
    pub fn insert(&mut self, mut message: Message) -> Arc<Message> {
        self.next_db_id += 1;
        message.db_id = self.next_db_id;
        let message = Arc::new(message);
        self.messages.insert(self.next_db_id, Arc::downgrade(&message));
        message
    }

    /// Number of live references to `message`: session queue entries plus
    /// retained slots plus any in-progress routing step.
    #[must_use]
    pub fn ref_count(message: &Arc<Message>) -> usize {
        Arc::strong_count(message)
    }

    /// Look up a live message by its store id.
    #[must_use]
    pub fn get(&self, db_id: u64) -> Option<Arc<Message>> {
        self.messages.get(&db_id).and_then(Weak::upgrade)
    }

    /// Drop index entries whose message has been freed. Freeing itself
    /// needs no sweep; this only bounds the index size.
    pub fn compact(&mut self) {
        self.messages.retain(|_, weak| weak.strong_count() > 0);
    }

    /// Number of live messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(topic: &str) -> Message {
        Message::new(
            topic.to_string(),
            Bytes::from_static(b"payload"),
            QoS::AtLeastOnce,
            false,
            "tester".to_string(),
            String::new(),
            Properties::new(),
            0,
        )
    }

    #[test]
    fn test_db_id_is_monotone() {
        let mut store = MessageStore::new();
        let first = store.insert(message("a"));
        let second = store.insert(message("b"));
        assert!(second.db_id() > first.db_id());
    }

    #[test]
    fn test_message_freed_with_last_holder() {
        let mut store = MessageStore::new();
        let msg = store.insert(message("a"));
        let db_id = msg.db_id();
        assert_eq!(MessageStore::ref_count(&msg), 1);

        let extra = Arc::clone(&msg);
        assert_eq!(MessageStore::ref_count(&msg), 2);
        drop(extra);
        assert_eq!(MessageStore::ref_count(&msg), 1);

        drop(msg);
        assert!(store.get(db_id).is_none());
        assert_eq!(store.len(), 0);

        // The dead index entry disappears on compaction.
        store.compact();
        assert!(store.is_empty());
    }

    #[test]
    fn test_expiry() {
        let mut msg = message("a");
        msg.expiry_at = 100;
        let msg = MessageStore::new().insert(msg);
        assert!(!msg.is_expired(100));
        assert!(msg.is_expired(101));

        let never = MessageStore::new().insert(message("b"));
        assert!(!never.is_expired(u64::MAX));
    }
}
