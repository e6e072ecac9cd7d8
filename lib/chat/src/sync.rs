//! Message history reconciliation and persistence scheduling.
//!
//! The synchronizer owns the in-memory conversation of one session: the
//! adopted channel and its ordered, duplicate-free message log. Remote
//! history is merged in pages; live messages are appended one by one. Every
//! write to the store carries the full log.

use crate::config::ChatConfig;
use chrono::Utc;
use servicebell_core::{
    ChannelMetadata, Message, MessageId, PersistedChatRecord, RestaurantId, TerminalStatus,
};
use servicebell_gateway::{ConnectionGateway, convert};
use servicebell_store::PersistenceStore;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

/// Union of two message sequences.
///
/// Duplicates are resolved by id in favor of `remote`; the result is ordered
/// by `(created_at, id)`. Merging the same page twice changes nothing.
#[must_use]
pub fn merge(local: &[Message], remote: &[Message]) -> Vec<Message> {
    let mut by_id: HashMap<&MessageId, &Message> = HashMap::with_capacity(local.len() + remote.len());
    for message in local.iter().chain(remote) {
        by_id.insert(&message.id, message);
    }
    let mut merged: Vec<Message> = by_id.into_values().cloned().collect();
    merged.sort_by(Message::cmp_order);
    merged
}

/// Ordered, duplicate-free message sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageLog {
    messages: Vec<Message>,
    ids: HashSet<MessageId>,
}

impl MessageLog {
    /// Creates a log from arbitrary messages.
    #[must_use]
    pub fn from_messages(messages: &[Message]) -> Self {
        let mut log = Self::default();
        log.replace(merge(&[], messages));
        log
    }

    /// Inserts a message at its place in the order.
    ///
    /// Returns false if a message with the same id is already present.
    pub fn insert(&mut self, message: Message) -> bool {
        if self.ids.contains(&message.id) {
            return false;
        }
        let at = self
            .messages
            .partition_point(|m| m.cmp_order(&message) == Ordering::Less);
        self.ids.insert(message.id.clone());
        self.messages.insert(at, message);
        true
    }

    /// Replaces the content with an already merged sequence.
    fn replace(&mut self, messages: Vec<Message>) {
        self.ids = messages.iter().map(|m| m.id.clone()).collect();
        self.messages = messages;
    }

    /// Removes every message.
    pub fn clear(&mut self) {
        self.messages.clear();
        self.ids.clear();
    }

    #[must_use]
    pub fn contains(&self, id: &MessageId) -> bool {
        self.ids.contains(id)
    }

    #[must_use]
    pub fn as_slice(&self) -> &[Message] {
        &self.messages
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Returns true if a closing notice is part of the conversation.
    #[must_use]
    pub fn has_closed_notice(&self) -> bool {
        self.messages.iter().any(|m| m.kind.is_closed_notice())
    }
}

/// A single pending flush.
///
/// Requests coalesce: the earliest requested deadline wins, so a later
/// request never postpones a flush that is already due sooner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushSlot {
    deadline: Option<Instant>,
}

impl FlushSlot {
    /// Requests a flush no later than `at`.
    pub fn request(&mut self, at: Instant) {
        self.deadline = Some(match self.deadline {
            Some(deadline) if deadline <= at => deadline,
            _ => at,
        });
    }

    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Consumes the pending flush if it is due at `now`.
    pub fn take_due(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }

    pub fn clear(&mut self) {
        self.deadline = None;
    }
}

/// Conversation state accepted but not yet written.
///
/// Shared between the synchronizer and the session handle, so the handle can
/// write it on teardown without waiting for the session task. Writes from
/// either side are serialized by the staging lock.
#[derive(Debug)]
pub struct PendingWrite {
    store: PersistenceStore,
    restaurant_id: RestaurantId,
    staged: Mutex<Option<PersistedChatRecord>>,
}

impl PendingWrite {
    fn new(store: PersistenceStore, restaurant_id: RestaurantId) -> Self {
        Self {
            store,
            restaurant_id,
            staged: Mutex::new(None),
        }
    }

    fn stage(&self, channel: &ChannelMetadata, log: &MessageLog) {
        *self.staged.lock().unwrap_or_else(PoisonError::into_inner) = Some(record_of(channel, log));
    }

    fn discard(&self) {
        *self.staged.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Returns true if accepted messages still wait for a write.
    #[must_use]
    pub fn is_staged(&self) -> bool {
        self.staged
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Writes the staged conversation now.
    ///
    /// Returns false if nothing was staged or the write failed.
    pub fn write_now(&self) -> bool {
        let mut staged = self.staged.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(record) = staged.take() else {
            return false;
        };
        let mut log = MessageLog::from_messages(&record.messages);
        absorb_stored(&self.store, &self.restaurant_id, &record.channel_meta, &mut log);
        let written = self
            .store
            .save(&self.restaurant_id, &record_of(&record.channel_meta, &log));
        if written {
            debug!(messages = log.len(), "wrote pending conversation on teardown");
        }
        written
    }
}

fn record_of(channel: &ChannelMetadata, log: &MessageLog) -> PersistedChatRecord {
    PersistedChatRecord {
        channel_meta: channel.clone(),
        messages: log.as_slice().to_vec(),
        last_synced_at: Utc::now(),
    }
}

/// Merges into `log` the messages another writer stored for `channel`.
fn absorb_stored(
    store: &PersistenceStore,
    restaurant_id: &RestaurantId,
    channel: &ChannelMetadata,
    log: &mut MessageLog,
) {
    let Some(stored) = store.load(restaurant_id) else {
        return;
    };
    if stored.channel_meta.channel_url != channel.channel_url {
        return;
    }
    let has_notice = log.has_closed_notice();
    let foreign: Vec<Message> = stored
        .messages
        .into_iter()
        .filter(|m| !log.contains(&m.id))
        .filter(|m| !(has_notice && m.kind.is_closed_notice()))
        .collect();
    if !foreign.is_empty() {
        debug!(count = foreign.len(), "merging messages stored by another writer");
        let merged = merge(&foreign, log.as_slice());
        log.replace(merged);
    }
}

/// In-memory conversation of one session, kept in sync with the provider
/// and the store.
pub struct MessageSynchronizer {
    gateway: Arc<ConnectionGateway>,
    store: PersistenceStore,
    restaurant_id: RestaurantId,
    page_size: usize,
    flush_interval: Duration,
    channel: Option<ChannelMetadata>,
    log: MessageLog,
    pending: Arc<PendingWrite>,
    slot: FlushSlot,
}

impl MessageSynchronizer {
    /// Creates an empty synchronizer for a restaurant.
    #[must_use]
    pub fn new(
        gateway: Arc<ConnectionGateway>,
        store: PersistenceStore,
        restaurant_id: RestaurantId,
        config: &ChatConfig,
    ) -> Self {
        Self {
            gateway,
            pending: Arc::new(PendingWrite::new(store.clone(), restaurant_id.clone())),
            store,
            restaurant_id,
            page_size: config.history_page_size,
            flush_interval: config.flush_interval(),
            channel: None,
            log: MessageLog::default(),
            slot: FlushSlot::default(),
        }
    }

    /// The adopted channel, if any.
    #[must_use]
    pub fn channel(&self) -> Option<&ChannelMetadata> {
        self.channel.as_ref()
    }

    /// The conversation, in order.
    #[must_use]
    pub fn messages(&self) -> &[Message] {
        self.log.as_slice()
    }

    #[must_use]
    pub fn has_closed_notice(&self) -> bool {
        self.log.has_closed_notice()
    }

    /// Returns true if messages were accepted since the last write.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.pending.is_staged()
    }

    /// The unwritten state, for writing on teardown.
    #[must_use]
    pub fn pending(&self) -> Arc<PendingWrite> {
        self.pending.clone()
    }

    /// When the pending debounced write is due.
    #[must_use]
    pub fn flush_deadline(&self) -> Option<Instant> {
        self.slot.deadline()
    }

    /// Restores the cached conversation of the restaurant.
    ///
    /// Returns the cached channel so it can be offered to the resolver.
    pub fn restore_cached(&mut self) -> Option<ChannelMetadata> {
        let record = self.store.load(&self.restaurant_id)?;
        if record.channel_meta.restaurant_id != self.restaurant_id {
            warn!(
                restaurant_id = %self.restaurant_id,
                cached = %record.channel_meta.restaurant_id,
                "ignoring cached record of another restaurant"
            );
            return None;
        }
        debug!(
            channel_url = %record.channel_meta.channel_url,
            messages = record.messages.len(),
            "restored cached conversation"
        );
        self.log = MessageLog::from_messages(&record.messages);
        self.channel = Some(record.channel_meta.clone());
        Some(record.channel_meta)
    }

    /// Makes `channel` the conversation of this session.
    ///
    /// Adopting a different channel than the current one archives the
    /// current conversation and starts from an empty log.
    pub fn adopt(&mut self, channel: ChannelMetadata) {
        match &mut self.channel {
            Some(current) if current.channel_url == channel.channel_url => {
                current.absorb(&channel);
            }
            Some(current) => {
                let previous = PersistedChatRecord {
                    channel_meta: current.clone(),
                    messages: self.log.as_slice().to_vec(),
                    last_synced_at: Utc::now(),
                };
                self.store.archive(&previous);
                self.pending.discard();
                debug!(
                    previous = %previous.channel_meta.channel_url,
                    channel_url = %channel.channel_url,
                    "switched conversation channel"
                );
                self.log.clear();
                self.channel = Some(channel);
            }
            None => self.channel = Some(channel),
        }
    }

    /// Loads the most recent page of the adopted channel's history.
    ///
    /// Provider failures yield an empty page; malformed messages are
    /// skipped.
    #[instrument(skip(self), fields(restaurant_id = %self.restaurant_id))]
    pub async fn load_history(&self) -> Vec<Message> {
        let Some(channel) = &self.channel else {
            return Vec::new();
        };
        let page = match self
            .gateway
            .provider()
            .load_previous_messages(&channel.channel_url, self.page_size)
            .await
        {
            Ok(page) => page,
            Err(e) => {
                warn!(channel_url = %channel.channel_url, error = %e, "failed to load message history");
                return Vec::new();
            }
        };
        page.iter()
            .filter_map(|remote| match convert::message_from_remote(remote) {
                Ok(message) => Some(message),
                Err(e) => {
                    warn!(channel_url = %channel.channel_url, error = %e, "skipping malformed message");
                    None
                }
            })
            .collect()
    }

    /// Merges a page of remote history and writes immediately.
    ///
    /// Returns the number of messages the page added.
    pub fn merge_history(&mut self, page: &[Message]) -> usize {
        let before = self.log.len();
        let merged = merge(self.log.as_slice(), page);
        self.log.replace(merged);
        self.flush();
        self.log.len().saturating_sub(before)
    }

    /// Appends a live message and schedules a debounced write.
    ///
    /// Returns false if the message was already known.
    pub fn append_live(&mut self, message: Message) -> bool {
        if !self.log.insert(message) {
            return false;
        }
        if let Some(channel) = &self.channel {
            self.pending.stage(channel, &self.log);
        }
        self.slot.request(Instant::now() + self.flush_interval);
        true
    }

    /// Applies a newer copy of the adopted channel without writing.
    ///
    /// Copies of other channels are ignored. Returns true if anything
    /// changed.
    pub fn absorb_channel(&mut self, incoming: &ChannelMetadata) -> bool {
        match &mut self.channel {
            Some(current) if current.channel_url == incoming.channel_url => {
                current.absorb(incoming)
            }
            _ => false,
        }
    }

    /// Applies a newer copy of the adopted channel and writes if it changed.
    pub fn update_channel(&mut self, incoming: &ChannelMetadata) -> bool {
        let changed = self.absorb_channel(incoming);
        if changed {
            self.flush();
        }
        changed
    }

    /// Marks the adopted channel terminal without writing.
    pub fn mark_terminal(&mut self, status: TerminalStatus) -> bool {
        self.channel
            .as_mut()
            .is_some_and(|channel| channel.mark_terminal(status))
    }

    /// Performs the pending debounced write if it is due.
    pub fn flush_due(&mut self, now: Instant) -> bool {
        self.slot.take_due(now) && self.flush_pending()
    }

    /// Writes only if accepted messages are still unwritten.
    ///
    /// A teardown write from the session handle may already have covered
    /// them.
    pub fn flush_pending(&mut self) -> bool {
        if self.pending.is_staged() {
            self.flush()
        } else {
            self.slot.clear();
            false
        }
    }

    /// Writes the conversation now.
    ///
    /// Messages another writer stored for the same channel are merged in
    /// first, so the write never drops them. Returns false if nothing was
    /// written.
    pub fn flush(&mut self) -> bool {
        self.slot.clear();
        let Some(channel) = &self.channel else {
            return false;
        };

        let mut staged = self
            .pending
            .staged
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        absorb_stored(&self.store, &self.restaurant_id, channel, &mut self.log);
        let written = self
            .store
            .save(&self.restaurant_id, &record_of(channel, &self.log));
        if written {
            *staged = None;
        }
        written
    }

    /// Drops the pending debounced write.
    pub fn cancel(&mut self) {
        self.slot.clear();
    }
}

impl std::fmt::Debug for MessageSynchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageSynchronizer")
            .field("restaurant_id", &self.restaurant_id)
            .field("channel", &self.channel.as_ref().map(|c| &c.channel_url))
            .field("messages", &self.log.len())
            .field("dirty", &self.is_dirty())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone};
    use servicebell_core::{ChannelStatus, ChannelUrl, MessageKind, ParticipantId};
    use servicebell_gateway::{InMemoryProvider, RemoteChannel, RemoteMessage};
    use servicebell_store::{KeyValueBackend, MemoryBackend};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn text(id: &str, secs: i64) -> Message {
        Message::new(
            MessageId::new(id),
            ParticipantId::new("support_router"),
            format!("body {id}"),
            MessageKind::Text,
            at(secs),
        )
    }

    fn channel(url: &str) -> ChannelMetadata {
        ChannelMetadata {
            channel_url: ChannelUrl::new(url),
            name: "Support: R1".to_string(),
            status: ChannelStatus::Open,
            priority: false,
            created_at: at(0),
            restaurant_id: RestaurantId::new("R1"),
        }
    }

    fn ids(messages: &[Message]) -> Vec<&str> {
        messages.iter().map(|m| m.id.as_str()).collect()
    }

    struct Fixture {
        provider: Arc<InMemoryProvider>,
        store: PersistenceStore,
        sync: MessageSynchronizer,
    }

    fn fixture() -> Fixture {
        let provider = Arc::new(InMemoryProvider::new());
        let gateway = Arc::new(ConnectionGateway::new(provider.clone()));
        let backend: Arc<dyn KeyValueBackend> = Arc::new(MemoryBackend::new());
        let store = PersistenceStore::new(backend);
        let sync = MessageSynchronizer::new(
            gateway,
            store.clone(),
            RestaurantId::new("R1"),
            &ChatConfig::default(),
        );
        Fixture {
            provider,
            store,
            sync,
        }
    }

    fn stored_ids(store: &PersistenceStore) -> Vec<String> {
        store
            .load(&RestaurantId::new("R1"))
            .map(|r| r.messages.iter().map(|m| m.id.to_string()).collect())
            .unwrap_or_default()
    }

    #[test]
    fn merge_is_idempotent_and_ordered() {
        let local = vec![text("a", 1), text("c", 3)];
        let remote = vec![text("d", 4), text("b", 2), text("c", 3)];

        let once = merge(&local, &remote);
        let twice = merge(&once, &remote);

        assert_eq!(ids(&once), ["a", "b", "c", "d"]);
        assert_eq!(once, twice);
    }

    #[test]
    fn merge_prefers_remote_copy() {
        let mut edited = text("a", 1);
        edited.body = "edited".to_string();

        let merged = merge(&[text("a", 1)], &[edited]);

        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].body, "edited");
    }

    #[test]
    fn merge_breaks_timestamp_ties_by_id() {
        let merged = merge(&[text("b", 5)], &[text("a", 5)]);
        assert_eq!(ids(&merged), ["a", "b"]);
    }

    #[test]
    fn log_rejects_duplicates_and_keeps_order() {
        let mut log = MessageLog::default();
        assert!(log.insert(text("b", 2)));
        assert!(log.insert(text("a", 1)));
        assert!(log.insert(text("c", 3)));
        assert!(!log.insert(text("b", 2)));

        assert_eq!(ids(log.as_slice()), ["a", "b", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_slot_never_postpones_earlier_deadline() {
        let now = Instant::now();
        let mut slot = FlushSlot::default();

        slot.request(now + Duration::from_secs(5));
        slot.request(now + Duration::from_secs(9));
        assert_eq!(slot.deadline(), Some(now + Duration::from_secs(5)));

        slot.request(now + Duration::from_secs(1));
        assert_eq!(slot.deadline(), Some(now + Duration::from_secs(1)));

        assert!(!slot.take_due(now));
        assert!(slot.take_due(now + Duration::from_secs(1)));
        assert_eq!(slot.deadline(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn cached_page_merges_to_unique_ordered_sequence() {
        let mut f = fixture();
        let cached: Vec<Message> = (1..=5).map(|i| text(&format!("m{i}"), i)).collect();
        let mut record = PersistedChatRecord::new(channel("support_R1"));
        record.messages = cached;
        f.store.save(&RestaurantId::new("R1"), &record);

        let restored = f.sync.restore_cached().unwrap();
        f.sync.adopt(restored);
        let page = vec![text("m3", 3), text("m4", 4), text("m5", 5), text("m6", 6), text("m7", 7)];
        let added = f.sync.merge_history(&page);

        assert_eq!(added, 2);
        assert_eq!(
            ids(f.sync.messages()),
            ["m1", "m2", "m3", "m4", "m5", "m6", "m7"]
        );
        assert_eq!(stored_ids(&f.store).len(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn live_messages_are_written_after_debounce() {
        let mut f = fixture();
        f.sync.adopt(channel("support_R1"));
        f.sync.merge_history(&[]);

        assert!(f.sync.append_live(text("a", 1)));
        assert!(!f.sync.append_live(text("a", 1)));
        assert!(f.sync.is_dirty());
        assert!(stored_ids(&f.store).is_empty());

        let deadline = f.sync.flush_deadline().unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(f.sync.append_live(text("b", 2)));
        assert_eq!(f.sync.flush_deadline(), Some(deadline));

        assert!(!f.sync.flush_due(Instant::now()));
        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(f.sync.flush_due(Instant::now()));

        assert_eq!(stored_ids(&f.store), ["a", "b"]);
        assert!(!f.sync.is_dirty());
        assert_eq!(f.sync.flush_deadline(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_keeps_messages_written_by_another_tab() {
        let mut f = fixture();
        f.sync.adopt(channel("support_R1"));
        f.sync.append_live(text("a", 1));

        let mut other_tab = PersistedChatRecord::new(channel("support_R1"));
        other_tab.messages = vec![text("a", 1), text("x", 2)];
        f.store.save(&RestaurantId::new("R1"), &other_tab);

        assert!(f.sync.flush());
        assert_eq!(stored_ids(&f.store), ["a", "x"]);
        assert_eq!(ids(f.sync.messages()), ["a", "x"]);
    }

    #[tokio::test(start_paused = true)]
    async fn pending_write_covers_teardown() {
        let mut f = fixture();
        f.sync.adopt(channel("support_R1"));
        f.sync.merge_history(&[text("a", 1)]);
        let pending = f.sync.pending();
        assert!(!pending.write_now());

        f.sync.append_live(text("b", 2));
        let mut other_tab = PersistedChatRecord::new(channel("support_R1"));
        other_tab.messages = vec![text("a", 1), text("x", 3)];
        f.store.save(&RestaurantId::new("R1"), &other_tab);

        assert!(pending.write_now());
        assert_eq!(stored_ids(&f.store), ["a", "b", "x"]);
        assert!(!f.sync.is_dirty());
        assert!(!f.sync.flush_pending());
        assert_eq!(f.sync.flush_deadline(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn adopting_new_channel_archives_previous() {
        let mut f = fixture();
        let mut old = channel("support_R1_1");
        old.mark_terminal(TerminalStatus::Closed);
        f.sync.adopt(old);
        f.sync.merge_history(&[text("a", 1)]);

        f.sync.adopt(channel("support_R1_2"));
        f.sync.merge_history(&[]);

        assert!(f.sync.messages().is_empty());
        let archived = f
            .store
            .load_archived(&RestaurantId::new("R1"), &ChannelUrl::new("support_R1_1"))
            .unwrap();
        assert_eq!(archived.messages.len(), 1);
        assert_eq!(
            f.store
                .load(&RestaurantId::new("R1"))
                .unwrap()
                .channel_meta
                .channel_url
                .as_str(),
            "support_R1_2"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn metadata_change_writes_immediately() {
        let mut f = fixture();
        f.sync.adopt(channel("support_R1"));

        let mut incoming = channel("support_R1");
        incoming.priority = true;
        assert!(f.sync.update_channel(&incoming));
        assert!(!f.sync.update_channel(&incoming));
        assert!(!f.sync.update_channel(&channel("support_R1_other")));

        let stored = f.store.load(&RestaurantId::new("R1")).unwrap();
        assert!(stored.channel_meta.priority);
    }

    #[tokio::test]
    async fn history_skips_malformed_messages() {
        let mut f = fixture();
        let url = ChannelUrl::new("support_R1");
        f.provider.insert_channel(RemoteChannel {
            url: url.clone(),
            name: "Support".to_string(),
            metadata: std::collections::HashMap::new(),
            member_ids: vec![],
            created_at: 1_000,
        });
        for id in ["msg_1", ""] {
            f.provider.insert_message(RemoteMessage {
                message_id: id.to_string(),
                channel_url: url.clone(),
                sender_id: ParticipantId::new("support_router"),
                message: "hi".to_string(),
                custom_type: None,
                created_at: 2_000,
            });
        }
        f.sync.adopt(channel("support_R1"));

        let page = f.sync.load_history().await;

        assert_eq!(ids(&page), ["msg_1"]);
    }

    #[tokio::test]
    async fn history_failure_yields_empty_page() {
        let mut f = fixture();
        f.provider.fail_history(true);
        f.sync.adopt(channel("support_R1"));

        assert!(f.sync.load_history().await.is_empty());
    }
}
