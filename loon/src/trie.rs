// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! The subscription trie.
//!
//! Topic filters are indexed level by level; one node per level, one leaf
//! entry per (session, filter) pair. Each node additionally carries the
//! retained message for the topic it spells and the member lists of shared
//! subscription groups. Nodes with no children, no subscribers and no
//! retained message are removed on the way out of every mutation.

use codec::topic::validate_sub_topic;
use codec::QoS;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Error, ErrorKind};
use crate::store::Message;
use crate::types::SessionId;

/// The broker-side view of one subscription's options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeOptions {
    pub qos: QoS,
    pub no_local: bool,
    pub retain_as_published: bool,
}

impl SubscribeOptions {
    #[must_use]
    pub const fn with_qos(qos: QoS) -> Self {
        Self {
            qos,
            no_local: false,
            retain_as_published: false,
        }
    }
}

/// One session picked to receive a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Recipient {
    pub session_id: SessionId,
    pub qos: QoS,
    pub no_local: bool,
    pub retain_as_published: bool,
}

#[derive(Debug, Clone)]
struct SubEntry {
    session_id: SessionId,
    options: SubscribeOptions,
}

#[derive(Debug, Default)]
struct SharedGroup {
    entries: Vec<SubEntry>,

    /// Round-robin cursor; advanced once per publish so the choice is
    /// stable within one routing walk.
    next: usize,
}

#[derive(Debug, Default)]
struct TrieNode {
    children: HashMap<String, TrieNode>,
    subscribers: Vec<SubEntry>,
    shared: HashMap<String, SharedGroup>,
    retained: Option<Arc<Message>>,
}

impl TrieNode {
    fn is_removable(&self) -> bool {
        self.children.is_empty()
            && self.subscribers.is_empty()
            && self.shared.is_empty()
            && self.retained.is_none()
    }
}

/// Split a v5 shared subscription filter `$share/<group>/<filter>` into
/// group name and plain filter. Returns `None` for ordinary filters.
#[must_use]
pub fn split_shared_filter(filter: &str) -> Option<(&str, &str)> {
    let rest = filter.strip_prefix("$share/")?;
    let (group, plain) = rest.split_once('/')?;
    if group.is_empty() || plain.is_empty() {
        return None;
    }
    Some((group, plain))
}

#[derive(Debug, Default)]
pub struct SubTrie {
    root: TrieNode,
}

impl SubTrie {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh the subscription of `session_id` to `filter`.
    ///
    /// If the session already holds the identical filter, the options are
    /// updated in place. Returns true for a new subscription, false for an
    /// update [MQTT-3.8.4-3].
    ///
    /// # Errors
    ///
    /// Returns error if `filter` is not a valid topic filter.
    pub fn subscribe(
        &mut self,
        session_id: SessionId,
        filter: &str,
        options: SubscribeOptions,
    ) -> Result<bool, Error> {
        let (group, plain) = match split_shared_filter(filter) {
            Some((group, plain)) => (Some(group.to_string()), plain),
            None => (None, filter),
        };
        validate_sub_topic(plain).map_err(|err| {
            Error::from_string(
                ErrorKind::InvalidArgument,
                format!("trie: Invalid filter {filter}: {err:?}"),
            )
        })?;

        let mut node = &mut self.root;
        for level in plain.split('/') {
            node = node.children.entry(level.to_string()).or_default();
        }

        let entry = SubEntry {
            session_id,
            options,
        };
        let entries = match group {
            Some(group) => &mut node.shared.entry(group).or_default().entries,
            None => &mut node.subscribers,
        };
        if let Some(existing) = entries.iter_mut().find(|e| e.session_id == session_id) {
            existing.options = options;
            Ok(false)
        } else {
            entries.push(entry);
            Ok(true)
        }
    }

    /// Remove the subscription of `session_id` to `filter`. Returns false
    /// if no such leaf entry existed.
    pub fn unsubscribe(&mut self, session_id: SessionId, filter: &str) -> bool {
        let (group, plain) = match split_shared_filter(filter) {
            Some((group, plain)) => (Some(group), plain),
            None => (None, filter),
        };
        let levels: Vec<&str> = plain.split('/').collect();
        Self::unsubscribe_at(&mut self.root, &levels, session_id, group)
    }

    fn unsubscribe_at(
        node: &mut TrieNode,
        levels: &[&str],
        session_id: SessionId,
        group: Option<&str>,
    ) -> bool {
        if let Some((level, rest)) = levels.split_first() {
            let Some(child) = node.children.get_mut(*level) else {
                return false;
            };
            let removed = Self::unsubscribe_at(child, rest, session_id, group);
            if child.is_removable() {
                node.children.remove(*level);
            }
            return removed;
        }

        match group {
            Some(group) => {
                let Some(shared_group) = node.shared.get_mut(group) else {
                    return false;
                };
                let before = shared_group.entries.len();
                shared_group.entries.retain(|e| e.session_id != session_id);
                let removed = shared_group.entries.len() != before;
                if shared_group.entries.is_empty() {
                    node.shared.remove(group);
                }
                removed
            }
            None => {
                let before = node.subscribers.len();
                node.subscribers.retain(|e| e.session_id != session_id);
                node.subscribers.len() != before
            }
        }
    }

    /// Remove every subscription held by `session_id`.
    pub fn clean_session(&mut self, session_id: SessionId) {
        Self::clean_at(&mut self.root, session_id);
    }

    fn clean_at(node: &mut TrieNode, session_id: SessionId) {
        node.subscribers.retain(|e| e.session_id != session_id);
        for shared_group in node.shared.values_mut() {
            shared_group.entries.retain(|e| e.session_id != session_id);
        }
        node.shared.retain(|_, g| !g.entries.is_empty());
        node.children.retain(|_, child| {
            Self::clean_at(child, session_id);
            !child.is_removable()
        });
    }

    /// Re-point every leaf entry of `old_id` at `new_id`.
    ///
    /// Used by session takeover: the surviving subscription leaves must
    /// reference the new session handle, not the displaced one.
    pub fn rewrite_session(&mut self, old_id: SessionId, new_id: SessionId) {
        Self::rewrite_at(&mut self.root, old_id, new_id);
    }

    fn rewrite_at(node: &mut TrieNode, old_id: SessionId, new_id: SessionId) {
        for entry in &mut node.subscribers {
            if entry.session_id == old_id {
                entry.session_id = new_id;
            }
        }
        for shared_group in node.shared.values_mut() {
            for entry in &mut shared_group.entries {
                if entry.session_id == old_id {
                    entry.session_id = new_id;
                }
            }
        }
        for child in node.children.values_mut() {
            Self::rewrite_at(child, old_id, new_id);
        }
    }

    /// Collect the sessions a publish to `topic` must reach.
    ///
    /// Shared groups contribute exactly one member each, chosen round
    /// robin. When `allow_duplicates` is false, a session subscribed to
    /// several matching filters receives one entry carrying the highest
    /// granted QoS.
    pub fn collect_recipients(&mut self, topic: &str, allow_duplicates: bool) -> Vec<Recipient> {
        let levels: Vec<&str> = topic.split('/').collect();
        let reserved = topic.starts_with('$');
        let mut out = Vec::new();
        let mut seen: HashMap<SessionId, usize> = HashMap::new();
        Self::collect_at(
            &mut self.root,
            &levels,
            0,
            reserved,
            allow_duplicates,
            &mut out,
            &mut seen,
        );
        out
    }

    fn take_node(
        node: &mut TrieNode,
        allow_duplicates: bool,
        out: &mut Vec<Recipient>,
        seen: &mut HashMap<SessionId, usize>,
    ) {
        for entry in &node.subscribers {
            let recipient = Recipient {
                session_id: entry.session_id,
                qos: entry.options.qos,
                no_local: entry.options.no_local,
                retain_as_published: entry.options.retain_as_published,
            };
            if allow_duplicates {
                out.push(recipient);
                continue;
            }
            match seen.get(&entry.session_id) {
                Some(&index) => {
                    let merged = &mut out[index];
                    merged.qos = merged.qos.max(recipient.qos);
                    merged.no_local = merged.no_local && recipient.no_local;
                    merged.retain_as_published =
                        merged.retain_as_published || recipient.retain_as_published;
                }
                None => {
                    seen.insert(entry.session_id, out.len());
                    out.push(recipient);
                }
            }
        }

        for shared_group in node.shared.values_mut() {
            if shared_group.entries.is_empty() {
                continue;
            }
            let index = shared_group.next % shared_group.entries.len();
            shared_group.next = shared_group.next.wrapping_add(1);
            let entry = &shared_group.entries[index];
            out.push(Recipient {
                session_id: entry.session_id,
                qos: entry.options.qos,
                no_local: entry.options.no_local,
                retain_as_published: entry.options.retain_as_published,
            });
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn collect_at(
        node: &mut TrieNode,
        levels: &[&str],
        depth: usize,
        reserved: bool,
        allow_duplicates: bool,
        out: &mut Vec<Recipient>,
        seen: &mut HashMap<SessionId, usize>,
    ) {
        if depth == levels.len() {
            Self::take_node(node, allow_duplicates, out, seen);
            // A trailing `/#` also matches the level above it.
            if let Some(hash_child) = node.children.get_mut("#") {
                Self::take_node(hash_child, allow_duplicates, out, seen);
            }
            return;
        }

        // Filters starting with a wildcard never match `$`-topics
        // [MQTT-4.7.2-1].
        let wildcard_gate = reserved && depth == 0;
        if !wildcard_gate {
            if let Some(hash_child) = node.children.get_mut("#") {
                Self::take_node(hash_child, allow_duplicates, out, seen);
            }
            if let Some(plus_child) = node.children.get_mut("+") {
                Self::collect_at(
                    plus_child,
                    levels,
                    depth + 1,
                    reserved,
                    allow_duplicates,
                    out,
                    seen,
                );
            }
        }
        if let Some(child) = node.children.get_mut(levels[depth]) {
            Self::collect_at(child, levels, depth + 1, reserved, allow_duplicates, out, seen);
        }
    }

    /// Replace, set or clear the retained message at `topic`.
    ///
    /// `None` clears the slot, which is how a retained publish with an
    /// empty payload is applied. The old message's reference is dropped
    /// either way.
    pub fn set_retained(&mut self, topic: &str, message: Option<Arc<Message>>) {
        let levels: Vec<&str> = topic.split('/').collect();
        Self::set_retained_at(&mut self.root, &levels, message);
    }

    fn set_retained_at(node: &mut TrieNode, levels: &[&str], message: Option<Arc<Message>>) {
        let Some((level, rest)) = levels.split_first() else {
            node.retained = message;
            return;
        };
        match message {
            Some(message) => {
                let child = node.children.entry((*level).to_string()).or_default();
                Self::set_retained_at(child, rest, Some(message));
            }
            None => {
                if let Some(child) = node.children.get_mut(*level) {
                    Self::set_retained_at(child, rest, None);
                    if child.is_removable() {
                        node.children.remove(*level);
                    }
                }
            }
        }
    }

    /// Retained message at exactly `topic`, if any.
    #[must_use]
    pub fn retained_at(&self, topic: &str) -> Option<Arc<Message>> {
        let mut node = &self.root;
        for level in topic.split('/') {
            node = node.children.get(level)?;
        }
        node.retained.clone()
    }

    /// All retained messages a new subscription to `filter` must be
    /// offered, in trie order.
    #[must_use]
    pub fn retained_for_filter(&self, filter: &str) -> Vec<Arc<Message>> {
        let plain = split_shared_filter(filter).map_or(filter, |(_, plain)| plain);
        let levels: Vec<&str> = plain.split('/').collect();
        let mut out = Vec::new();
        Self::retained_at_filter(&self.root, &levels, 0, &mut out);
        out
    }

    fn retained_at_filter(
        node: &TrieNode,
        levels: &[&str],
        depth: usize,
        out: &mut Vec<Arc<Message>>,
    ) {
        let Some(level) = levels.get(depth) else {
            if let Some(message) = &node.retained {
                out.push(Arc::clone(message));
            }
            return;
        };

        match *level {
            "#" => Self::retained_subtree(node, depth == 0, out),
            "+" => {
                for (name, child) in &node.children {
                    if depth == 0 && name.starts_with('$') {
                        continue;
                    }
                    Self::retained_at_filter(child, levels, depth + 1, out);
                }
            }
            _ => {
                if let Some(child) = node.children.get(*level) {
                    Self::retained_at_filter(child, levels, depth + 1, out);
                }
            }
        }
    }

    fn retained_subtree(node: &TrieNode, gate_reserved: bool, out: &mut Vec<Arc<Message>>) {
        if let Some(message) = &node.retained {
            out.push(Arc::clone(message));
        }
        for (name, child) in &node.children {
            if gate_reserved && name.starts_with('$') {
                continue;
            }
            Self::retained_subtree(child, false, out);
        }
    }

    /// Look up the stored options of one (session, filter) leaf.
    #[must_use]
    pub fn options_of(&self, session_id: SessionId, filter: &str) -> Option<SubscribeOptions> {
        let (group, plain) = match split_shared_filter(filter) {
            Some((group, plain)) => (Some(group), plain),
            None => (None, filter),
        };
        let mut node = &self.root;
        for level in plain.split('/') {
            node = node.children.get(level)?;
        }
        let entries = match group {
            Some(group) => &node.shared.get(group)?.entries,
            None => &node.subscribers,
        };
        entries
            .iter()
            .find(|e| e.session_id == session_id)
            .map(|e| e.options)
    }

    /// Total number of leaf entries, for diagnostics and tests.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        Self::count_at(&self.root)
    }

    fn count_at(node: &TrieNode) -> usize {
        let shared: usize = node.shared.values().map(|g| g.entries.len()).sum();
        node.subscribers.len()
            + shared
            + node.children.values().map(Self::count_at).sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use codec::v5::Properties;

    fn retained_message(topic: &str, payload: &'static [u8]) -> Arc<Message> {
        Arc::new(Message::new(
            topic.to_string(),
            Bytes::from_static(payload),
            QoS::AtMostOnce,
            true,
            "src".to_string(),
            String::new(),
            Properties::new(),
            0,
        ))
    }

    fn options(qos: QoS) -> SubscribeOptions {
        SubscribeOptions::with_qos(qos)
    }

    #[test]
    fn test_subscribe_and_match() {
        let mut trie = SubTrie::new();
        assert!(trie
            .subscribe(1, "sensors/+/temp", options(QoS::AtLeastOnce))
            .unwrap());
        assert!(trie.subscribe(2, "sensors/#", options(QoS::AtMostOnce)).unwrap());

        let recipients = trie.collect_recipients("sensors/room1/temp", false);
        assert_eq!(recipients.len(), 2);

        let recipients = trie.collect_recipients("sensors/room1/humidity", false);
        assert_eq!(recipients.len(), 1);
        assert_eq!(recipients[0].session_id, 2);
    }

    #[test]
    fn test_subscribe_same_filter_updates_in_place() {
        let mut trie = SubTrie::new();
        assert!(trie.subscribe(1, "a/b", options(QoS::AtMostOnce)).unwrap());
        assert!(!trie.subscribe(1, "a/b", options(QoS::ExactOnce)).unwrap());
        assert_eq!(trie.subscription_count(), 1);

        let recipients = trie.collect_recipients("a/b", false);
        assert_eq!(recipients[0].qos, QoS::ExactOnce);
    }

    #[test]
    fn test_hash_matches_parent_level() {
        let mut trie = SubTrie::new();
        trie.subscribe(1, "a/#", options(QoS::AtMostOnce)).unwrap();
        assert_eq!(trie.collect_recipients("a", false).len(), 1);
        assert_eq!(trie.collect_recipients("a/b/c", false).len(), 1);
        assert_eq!(trie.collect_recipients("b", false).len(), 0);
    }

    #[test]
    fn test_reserved_root_gate() {
        let mut trie = SubTrie::new();
        trie.subscribe(1, "#", options(QoS::AtMostOnce)).unwrap();
        trie.subscribe(2, "$SYS/#", options(QoS::AtMostOnce)).unwrap();

        let recipients = trie.collect_recipients("$SYS/broker/uptime", false);
        assert_eq!(recipients.len(), 1);
        assert_eq!(recipients[0].session_id, 2);

        let recipients = trie.collect_recipients("normal/topic", false);
        assert_eq!(recipients.len(), 1);
        assert_eq!(recipients[0].session_id, 1);
    }

    #[test]
    fn test_overlapping_subscriptions_deduplicated() {
        let mut trie = SubTrie::new();
        trie.subscribe(1, "a/#", options(QoS::AtMostOnce)).unwrap();
        trie.subscribe(1, "a/b", options(QoS::AtLeastOnce)).unwrap();

        let deduped = trie.collect_recipients("a/b", false);
        assert_eq!(deduped.len(), 1);
        // The surviving entry carries the highest matching QoS.
        assert_eq!(deduped[0].qos, QoS::AtLeastOnce);

        let duplicated = trie.collect_recipients("a/b", true);
        assert_eq!(duplicated.len(), 2);
    }

    #[test]
    fn test_unsubscribe_prunes_nodes() {
        let mut trie = SubTrie::new();
        trie.subscribe(1, "a/b/c/d", options(QoS::AtMostOnce)).unwrap();
        assert!(trie.unsubscribe(1, "a/b/c/d"));
        assert!(!trie.unsubscribe(1, "a/b/c/d"));
        assert_eq!(trie.subscription_count(), 0);
        assert!(trie.root.children.is_empty());
    }

    #[test]
    fn test_clean_session() {
        let mut trie = SubTrie::new();
        trie.subscribe(1, "a/b", options(QoS::AtMostOnce)).unwrap();
        trie.subscribe(1, "c/#", options(QoS::AtMostOnce)).unwrap();
        trie.subscribe(2, "a/b", options(QoS::AtMostOnce)).unwrap();
        trie.clean_session(1);
        assert_eq!(trie.subscription_count(), 1);
        assert_eq!(trie.collect_recipients("c/x", false).len(), 0);
    }

    #[test]
    fn test_rewrite_session() {
        let mut trie = SubTrie::new();
        trie.subscribe(1, "a/b", options(QoS::AtLeastOnce)).unwrap();
        trie.rewrite_session(1, 9);
        let recipients = trie.collect_recipients("a/b", false);
        assert_eq!(recipients[0].session_id, 9);
    }

    #[test]
    fn test_retained_set_and_clear() {
        let mut trie = SubTrie::new();
        trie.set_retained("x/y", Some(retained_message("x/y", b"hi")));
        assert!(trie.retained_at("x/y").is_some());
        assert_eq!(trie.retained_for_filter("x/#").len(), 1);

        trie.set_retained("x/y", None);
        assert!(trie.retained_at("x/y").is_none());
        assert!(trie.retained_for_filter("x/#").is_empty());
        // Clearing the only retained message prunes the branch.
        assert!(trie.root.children.is_empty());
    }

    #[test]
    fn test_retained_replacement_drops_old_reference() {
        let mut trie = SubTrie::new();
        let old = retained_message("x/y", b"old");
        trie.set_retained("x/y", Some(Arc::clone(&old)));
        assert_eq!(Arc::strong_count(&old), 2);

        trie.set_retained("x/y", Some(retained_message("x/y", b"new")));
        assert_eq!(Arc::strong_count(&old), 1);
    }

    #[test]
    fn test_retained_for_wildcard_filters() {
        let mut trie = SubTrie::new();
        trie.set_retained("a/1/t", Some(retained_message("a/1/t", b"x")));
        trie.set_retained("a/2/t", Some(retained_message("a/2/t", b"y")));
        trie.set_retained("$SYS/version", Some(retained_message("$SYS/version", b"v")));

        assert_eq!(trie.retained_for_filter("a/+/t").len(), 2);
        // `#` does not reach into `$`-topics.
        assert_eq!(trie.retained_for_filter("#").len(), 2);
        assert_eq!(trie.retained_for_filter("$SYS/#").len(), 1);
    }

    #[test]
    fn test_shared_group_round_robin() {
        let mut trie = SubTrie::new();
        trie.subscribe(1, "$share/workers/jobs", options(QoS::AtLeastOnce))
            .unwrap();
        trie.subscribe(2, "$share/workers/jobs", options(QoS::AtLeastOnce))
            .unwrap();

        let first = trie.collect_recipients("jobs", false);
        let second = trie.collect_recipients("jobs", false);
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        assert_ne!(first[0].session_id, second[0].session_id);
    }

    #[test]
    fn test_split_shared_filter() {
        assert_eq!(
            split_shared_filter("$share/workers/jobs/new"),
            Some(("workers", "jobs/new"))
        );
        assert_eq!(split_shared_filter("jobs/new"), None);
        assert_eq!(split_shared_filter("$share/"), None);
    }
}
