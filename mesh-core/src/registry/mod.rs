//! The in-memory state registry.
//!
//! Mutations are two-phase: a `plan_*` method inspects the model and returns
//! a [`Change`] (records to write, keys to delete, notifications to emit)
//! without touching anything, and [`Model::install`] applies it once the
//! caller has made it durable. A change that fails to persist is simply
//! never installed.

mod geo;
mod query;

pub use geo::haversine_km;
pub use query::{node_matches, select_nodes, MessageView, NodeSortKey, SortDirection};

use std::collections::{BTreeMap, BTreeSet, HashMap};

use mesh_types::{
    is_supported_reaction, Channel, ChannelAdminEvent, ChannelIndex, ChannelRole, ChannelSettings,
    ChangeSummary, ConversationKey, DecodedEvent, DeliveryOutcome, DeliveryState, Destination,
    EntityKey, FieldGroup, Message, MessageId, NeighborEvent, Node, NodeId, NodeInfoEvent,
    Notification, PacketMeta, Position, Reaction, Record, RoutingEvent, TextEvent, Timestamp,
    Topic,
};

use crate::outbound::MAX_TEXT_BYTES;
use crate::{ValidationError, ValidationResult};

/// A staged mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    /// Identity of the entity the mutation is about.
    pub entity: EntityKey,
    /// Records to upsert.
    pub writes: Vec<Record>,
    /// Records to remove.
    pub deletes: Vec<EntityKey>,
    /// Notifications to publish after commit.
    pub notifications: Vec<Notification>,
}

impl Change {
    fn new(entity: EntityKey) -> Self {
        Self {
            entity,
            writes: Vec::new(),
            deletes: Vec::new(),
            notifications: Vec::new(),
        }
    }

    /// Whether the change leaves the model as it is.
    pub fn is_noop(&self) -> bool {
        self.writes.is_empty() && self.deletes.is_empty()
    }

    fn notify(&mut self, topic: Topic, key: EntityKey, summary: ChangeSummary) {
        self.notifications
            .push(Notification::entity(topic, key, summary));
    }
}

/// Entity counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Known nodes.
    pub nodes: usize,
    /// Enabled channel slots.
    pub channels_enabled: usize,
    /// Stored messages.
    pub messages: usize,
    /// Stored reactions.
    pub reactions: usize,
    /// Outgoing messages not yet written to the radio.
    pub pending: usize,
    /// Conversations with at least one message.
    pub conversations: usize,
}

/// What [`Model::restore`] could not attach.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreReport {
    /// Records loaded.
    pub records: usize,
    /// Reactions whose target message is gone.
    pub orphaned_reactions: usize,
}

/// The registry's state: nodes, the eight channel slots, and messages
/// partitioned by conversation.
#[derive(Debug, Clone)]
pub struct Model {
    nodes: HashMap<NodeId, Node>,
    channels: Vec<Channel>,
    messages: HashMap<MessageId, Message>,
    threads: BTreeMap<ConversationKey, BTreeSet<(Timestamp, MessageId)>>,
    local_node: Option<NodeId>,
    manual_origin: Option<Position>,
}

impl Default for Model {
    fn default() -> Self {
        Self::new()
    }
}

impl Model {
    /// An empty model with factory channel slots.
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
            channels: ChannelIndex::all().map(Channel::factory).collect(),
            messages: HashMap::new(),
            threads: BTreeMap::new(),
            local_node: None,
            manual_origin: None,
        }
    }

    /// Rebuild a model from persisted records, in any order.
    pub fn restore(records: impl IntoIterator<Item = Record>) -> (Self, RestoreReport) {
        let mut model = Self::new();
        let mut report = RestoreReport::default();
        let mut reactions = Vec::new();

        for record in records {
            report.records += 1;
            match record {
                Record::Reaction(reaction) => reactions.push(reaction),
                other => model.install_record(other),
            }
        }
        for reaction in reactions {
            if model.messages.contains_key(&reaction.message) {
                model.install_record(Record::Reaction(reaction));
            } else {
                report.orphaned_reactions += 1;
            }
        }

        (model, report)
    }

    /// Record the attached device's node id.
    pub fn set_local_node(&mut self, id: NodeId) {
        self.local_node = Some(id).filter(NodeId::is_addressable);
    }

    /// The attached device's node id, once known.
    pub fn local_node(&self) -> Option<NodeId> {
        self.local_node
    }

    /// Author id for locally created entities.
    pub fn author(&self) -> NodeId {
        self.local_node.unwrap_or(NodeId::LOCAL)
    }

    /// Fixed location used for distances when the local node has no fix.
    pub fn set_manual_origin(&mut self, origin: Option<Position>) {
        self.manual_origin = origin;
    }

    /// Position distances are measured from.
    pub fn origin(&self) -> Option<Position> {
        self.local_node
            .and_then(|id| self.nodes.get(&id))
            .and_then(|node| node.position)
            .or(self.manual_origin)
    }

    /// Look up a node.
    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    /// Look up a message (with reactions).
    pub fn message(&self, id: MessageId) -> Option<&Message> {
        self.messages.get(&id)
    }

    /// Look up a channel slot.
    pub fn channel(&self, index: ChannelIndex) -> &Channel {
        &self.channels[index.value() as usize]
    }

    /// All eight slots in order.
    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    /// Copy of every node.
    pub fn nodes_snapshot(&self) -> Vec<Node> {
        self.nodes.values().cloned().collect()
    }

    /// Outgoing messages still waiting for the radio, oldest first.
    pub fn pending_outgoing(&self) -> Vec<Message> {
        let mut pending: Vec<Message> = self
            .messages
            .values()
            .filter(|m| m.outgoing && m.state == DeliveryState::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(Message::sort_key);
        pending
    }

    /// Entity counts.
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            nodes: self.nodes.len(),
            channels_enabled: self.channels.iter().filter(|c| c.is_enabled()).count(),
            messages: self.messages.len(),
            reactions: self.messages.values().map(|m| m.reactions.len()).sum(),
            pending: self
                .messages
                .values()
                .filter(|m| m.state == DeliveryState::Pending)
                .count(),
            conversations: self.threads.values().filter(|t| !t.is_empty()).count(),
        }
    }

    /// Nodes last heard before `cutoff`, excluding favorites and the local node.
    pub fn stale_nodes(&self, cutoff: Timestamp) -> Vec<NodeId> {
        let mut stale: Vec<NodeId> = self
            .nodes
            .values()
            .filter(|n| !n.is_favorite && Some(n.id) != self.local_node)
            .filter(|n| n.last_seen.is_some_and(|seen| seen < cutoff))
            .map(|n| n.id)
            .collect();
        stale.sort();
        stale
    }

    /// Whether `id` is already taken by a known message.
    pub fn has_message(&self, id: MessageId) -> bool {
        self.messages.contains_key(&id)
    }

    // ----- planning -----

    /// Stage the fold of one decoded event.
    pub fn plan_event(&self, event: &DecodedEvent) -> ValidationResult<Change> {
        match event {
            DecodedEvent::Text(text) => self.plan_text(text),
            DecodedEvent::Position(ev) => {
                let mut touched = self.touch(&ev.meta)?;
                if newer(touched.node.position_updated, ev.meta.timestamp) {
                    touched.node.position = Some(ev.position);
                    touched.node.position_updated = Some(ev.meta.timestamp);
                    touched.groups.push(FieldGroup::Position);
                }
                Ok(touched.into_change())
            }
            DecodedEvent::Telemetry(ev) => {
                let mut touched = self.touch(&ev.meta)?;
                if newer(touched.node.telemetry_updated, ev.meta.timestamp) {
                    touched.node.metrics = ev.metrics;
                    touched.node.telemetry_updated = Some(ev.meta.timestamp);
                    touched.groups.push(FieldGroup::Telemetry);
                }
                Ok(touched.into_change())
            }
            DecodedEvent::NodeInfo(ev) => self.plan_node_info(ev),
            DecodedEvent::Reaction(ev) => {
                let touched = self.touch(&ev.meta)?;
                let reaction = Reaction {
                    message: ev.target,
                    author: ev.meta.source,
                    emoji: ev.emoji.clone(),
                    timestamp: ev.meta.timestamp,
                };
                let mut change = self.plan_reaction(reaction)?;
                touched.merge_into(&mut change);
                Ok(change)
            }
            DecodedEvent::ChannelAdmin(ev) => self.plan_channel_admin(ev),
            DecodedEvent::Routing(ev) => self.plan_routing(ev),
            DecodedEvent::Neighbor(ev) => self.plan_neighbors(ev),
            DecodedEvent::Raw(ev) => Ok(self.touch(&ev.meta)?.into_change()),
        }
    }

    fn plan_text(&self, ev: &TextEvent) -> ValidationResult<Change> {
        if !ev.id.is_valid() {
            return Err(ValidationError::MalformedId(format!("message id {}", ev.id)));
        }
        if let Destination::Direct(to) = ev.destination {
            if to.is_broadcast() {
                return Err(ValidationError::MalformedId(to.to_string()));
            }
        }
        let touched = self.touch(&ev.meta)?;
        let key = EntityKey::Message(ev.id);
        let mut change = Change::new(key.clone());

        if !self.messages.contains_key(&ev.id) {
            let outgoing = Some(ev.meta.source) == self.local_node;
            let conversation = conversation_for(ev.meta.source, ev.destination, outgoing);
            change.writes.push(Record::Message(Message {
                id: ev.id,
                from: ev.meta.source,
                destination: ev.destination,
                conversation,
                body: ev.body.clone(),
                timestamp: ev.meta.timestamp,
                state: DeliveryState::Delivered,
                failure: None,
                reply_to: ev.reply_to,
                outgoing,
                rx_snr: ev.meta.signal.snr,
                rx_rssi: ev.meta.signal.rssi,
                reactions: Vec::new(),
            }));
            change.notify(Topic::Conversation(conversation), key, ChangeSummary::Created);
        }

        touched.merge_into(&mut change);
        Ok(change)
    }

    fn plan_node_info(&self, ev: &NodeInfoEvent) -> ValidationResult<Change> {
        let mut touched = self.touch(&ev.meta)?;
        if newer(touched.node.identity_updated, ev.meta.timestamp) {
            let node = &mut touched.node;
            node.long_name = ev.long_name.clone();
            node.short_name = ev.short_name.clone();
            node.hw_model = ev.hw_model.clone();
            node.role = ev.role.clone();
            node.has_public_key = ev.has_public_key;
            node.identity_updated = Some(ev.meta.timestamp);
            touched.groups.push(FieldGroup::Identity);
        }
        Ok(touched.into_change())
    }

    fn plan_channel_admin(&self, ev: &ChannelAdminEvent) -> ValidationResult<Change> {
        self.plan_channel(&ev.settings)
    }

    fn plan_routing(&self, ev: &RoutingEvent) -> ValidationResult<Change> {
        let outcome = match &ev.error {
            None => DeliveryOutcome::Delivered,
            Some(reason) => DeliveryOutcome::Failed(reason.clone()),
        };
        let mut change = self
            .plan_delivery(ev.request_id, &outcome)?
            .unwrap_or_else(|| Change::new(EntityKey::Message(ev.request_id)));
        if ev.meta.source.is_addressable() {
            self.touch(&ev.meta)?.merge_into(&mut change);
        }
        Ok(change)
    }

    fn plan_neighbors(&self, ev: &NeighborEvent) -> ValidationResult<Change> {
        let mut touched = self.touch(&ev.meta)?;
        let mut discovered = Vec::new();
        if newer(touched.node.neighbors_updated, ev.meta.timestamp) {
            touched.node.neighbors = ev
                .neighbors
                .iter()
                .filter(|link| link.node.is_addressable() && link.node != ev.meta.source)
                .copied()
                .collect();
            touched.node.neighbors_updated = Some(ev.meta.timestamp);
            touched.groups.push(FieldGroup::Neighbors);

            for link in &touched.node.neighbors {
                if !self.nodes.contains_key(&link.node) && !discovered.contains(&link.node) {
                    discovered.push(link.node);
                }
            }
        }

        let mut change = touched.into_change();
        change
            .writes
            .extend(discovered.into_iter().map(|id| Record::Node(Node::new(id))));
        Ok(change)
    }

    /// Stage a delivery transition. `None` when nothing changes: the message
    /// is unknown or already in that state.
    pub fn plan_delivery(
        &self,
        id: MessageId,
        outcome: &DeliveryOutcome,
    ) -> ValidationResult<Option<Change>> {
        let Some(current) = self.messages.get(&id) else {
            return Ok(None);
        };
        let (from, to) = (current.state, outcome.state());
        if from == to {
            return Ok(None);
        }
        if to.rank() <= from.rank() {
            return Err(ValidationError::InvalidTransition { id, from, to });
        }

        let mut message = current.clone();
        message.state = to;
        if let DeliveryOutcome::Failed(reason) = outcome {
            message.failure = Some(reason.clone());
        }
        let conversation = message.conversation;
        let key = EntityKey::Message(id);
        let mut change = Change::new(key.clone());
        change.writes.push(Record::Message(message));
        change.notify(
            Topic::Conversation(conversation),
            key,
            ChangeSummary::Delivery { from, to },
        );
        Ok(Some(change))
    }

    /// Stage a locally authored text in `pending` state.
    pub fn plan_stage_text(
        &self,
        id: MessageId,
        destination: Destination,
        body: &str,
        reply_to: Option<MessageId>,
        now: Timestamp,
    ) -> ValidationResult<Change> {
        if !id.is_valid() || self.messages.contains_key(&id) {
            return Err(ValidationError::MalformedId(format!("message id {}", id)));
        }
        if body.trim().is_empty() {
            return Err(ValidationError::EmptyBody);
        }
        if body.len() > MAX_TEXT_BYTES {
            return Err(ValidationError::BodyTooLong {
                len: body.len(),
                max: MAX_TEXT_BYTES,
            });
        }
        match destination {
            Destination::Broadcast(index) => {
                if !self.channel(index).is_enabled() {
                    return Err(ValidationError::ChannelDisabled(index));
                }
            }
            Destination::Direct(node) => {
                if !node.is_addressable() {
                    return Err(ValidationError::MalformedId(node.to_string()));
                }
            }
        }

        let conversation = conversation_for(self.author(), destination, true);
        if let Some(parent) = reply_to {
            let target = self
                .messages
                .get(&parent)
                .ok_or(ValidationError::UnknownMessage(parent))?;
            if target.conversation != conversation {
                return Err(ValidationError::ReplyOutsideConversation {
                    parent,
                    conversation,
                });
            }
        }

        let key = EntityKey::Message(id);
        let mut change = Change::new(key.clone());
        change.writes.push(Record::Message(Message {
            id,
            from: self.author(),
            destination,
            conversation,
            body: body.to_string(),
            timestamp: now,
            state: DeliveryState::Pending,
            failure: None,
            reply_to,
            outgoing: true,
            rx_snr: None,
            rx_rssi: None,
            reactions: Vec::new(),
        }));
        change.notify(Topic::Conversation(conversation), key, ChangeSummary::Created);
        Ok(change)
    }

    /// Stage the local node's reaction. Also returns where to transmit it.
    pub fn plan_local_reaction(
        &self,
        target: MessageId,
        emoji: &str,
        now: Timestamp,
    ) -> ValidationResult<(Change, Destination)> {
        if !is_supported_reaction(emoji) {
            return Err(ValidationError::UnsupportedReaction(emoji.to_string()));
        }
        let message = self
            .messages
            .get(&target)
            .ok_or(ValidationError::UnknownMessage(target))?;
        let destination = match message.conversation {
            ConversationKey::Channel(index) => Destination::Broadcast(index),
            ConversationKey::Direct(peer) => Destination::Direct(peer),
        };
        let change = self.plan_reaction(Reaction {
            message: target,
            author: self.author(),
            emoji: emoji.to_string(),
            timestamp: now,
        })?;
        Ok((change, destination))
    }

    fn plan_reaction(&self, reaction: Reaction) -> ValidationResult<Change> {
        let message = self
            .messages
            .get(&reaction.message)
            .ok_or(ValidationError::UnknownMessage(reaction.message))?;
        let key = Record::Reaction(reaction.clone()).key();
        let mut change = Change::new(key.clone());

        let exists = message
            .reactions
            .iter()
            .any(|r| r.author == reaction.author && r.emoji == reaction.emoji);
        if !exists {
            let topic = Topic::Conversation(message.conversation);
            change.writes.push(Record::Reaction(reaction));
            change.notify(topic, key, ChangeSummary::Reacted);
        }
        Ok(change)
    }

    /// Validate channel settings into a slot.
    pub fn validate_channel(settings: &ChannelSettings) -> ValidationResult<Channel> {
        let index = ChannelIndex::new(settings.index)
            .ok_or(ValidationError::ChannelOutOfRange(settings.index))?;
        let role = ChannelRole::from_wire(settings.role)
            .ok_or(ValidationError::InvalidChannelRole(settings.role))?;
        Ok(Channel {
            index,
            name: settings.name.clone(),
            psk: settings.psk.clone(),
            role,
            uplink_enabled: settings.uplink_enabled,
            downlink_enabled: settings.downlink_enabled,
        })
    }

    /// Stage new settings for a channel slot.
    pub fn plan_channel(&self, settings: &ChannelSettings) -> ValidationResult<Change> {
        let channel = Self::validate_channel(settings)?;
        let key = EntityKey::Channel(channel.index);
        let mut change = Change::new(key.clone());
        if *self.channel(channel.index) != channel {
            change.writes.push(Record::Channel(channel));
            change.notify(Topic::Channels, key, ChangeSummary::Updated(Vec::new()));
        }
        Ok(change)
    }

    /// Stage pinning or unpinning a node.
    pub fn plan_favorite(&self, id: NodeId, favorite: bool) -> ValidationResult<Change> {
        let node = self.nodes.get(&id).ok_or(ValidationError::UnknownNode(id))?;
        let key = EntityKey::Node(id);
        let mut change = Change::new(key.clone());
        if node.is_favorite != favorite {
            let mut node = node.clone();
            node.is_favorite = favorite;
            change.writes.push(Record::Node(node));
            change.notify(
                Topic::AllNodes,
                key,
                ChangeSummary::Updated(vec![FieldGroup::Favorite]),
            );
        }
        Ok(change)
    }

    /// Stage removing a node. `None` when it is not known.
    pub fn plan_remove_node(&self, id: NodeId) -> Option<Change> {
        self.nodes.get(&id)?;
        let key = EntityKey::Node(id);
        let mut change = Change::new(key.clone());
        change.deletes.push(key.clone());
        change.notify(Topic::AllNodes, key, ChangeSummary::Removed);
        Some(change)
    }

    fn touch(&self, meta: &PacketMeta) -> ValidationResult<Touched> {
        if !meta.source.is_addressable() {
            return Err(ValidationError::MalformedId(format!(
                "source {}",
                meta.source
            )));
        }
        let (mut node, created) = match self.nodes.get(&meta.source) {
            Some(node) => (node.clone(), false),
            None => (Node::new(meta.source), true),
        };
        let mut groups = Vec::new();

        if newer(node.last_seen, meta.timestamp) {
            node.last_seen = Some(meta.timestamp);
            groups.push(FieldGroup::LastSeen);
        }
        let has_signal =
            meta.signal.snr.is_some() || meta.signal.rssi.is_some() || meta.hops_away.is_some();
        if has_signal && newer(node.signal_updated, meta.timestamp) {
            node.signal = meta.signal;
            node.hops_away = meta.hops_away;
            node.signal_updated = Some(meta.timestamp);
            groups.push(FieldGroup::Signal);
        }

        Ok(Touched {
            node,
            created,
            groups,
        })
    }

    // ----- installing -----

    /// Apply a committed change and hand back its notifications.
    pub fn install(&mut self, change: Change) -> Vec<Notification> {
        for record in change.writes {
            self.install_record(record);
        }
        for key in change.deletes {
            self.remove(&key);
        }
        change.notifications
    }

    fn install_record(&mut self, record: Record) {
        match record {
            Record::Node(node) => {
                self.nodes.insert(node.id, node);
            }
            Record::Channel(channel) => {
                let slot = channel.index.value() as usize;
                self.channels[slot] = channel;
            }
            Record::Message(mut message) => {
                if let Some(old) = self.messages.remove(&message.id) {
                    if let Some(thread) = self.threads.get_mut(&old.conversation) {
                        thread.remove(&old.sort_key());
                    }
                    message.reactions = old.reactions;
                }
                self.threads
                    .entry(message.conversation)
                    .or_default()
                    .insert(message.sort_key());
                self.messages.insert(message.id, message);
            }
            Record::Reaction(reaction) => {
                if let Some(message) = self.messages.get_mut(&reaction.message) {
                    let exists = message
                        .reactions
                        .iter()
                        .any(|r| r.author == reaction.author && r.emoji == reaction.emoji);
                    if !exists {
                        message.reactions.push(reaction);
                        message
                            .reactions
                            .sort_by(|a, b| {
                                (a.timestamp, a.author, &a.emoji)
                                    .cmp(&(b.timestamp, b.author, &b.emoji))
                            });
                    }
                }
            }
        }
    }

    fn remove(&mut self, key: &EntityKey) {
        match key {
            EntityKey::Node(id) => {
                self.nodes.remove(id);
            }
            EntityKey::Channel(index) => {
                self.channels[index.value() as usize] = Channel::factory(*index);
            }
            EntityKey::Message(id) => {
                if let Some(old) = self.messages.remove(id) {
                    if let Some(thread) = self.threads.get_mut(&old.conversation) {
                        thread.remove(&old.sort_key());
                    }
                }
            }
            EntityKey::Reaction {
                message,
                author,
                emoji,
            } => {
                if let Some(message) = self.messages.get_mut(message) {
                    message
                        .reactions
                        .retain(|r| !(r.author == *author && r.emoji == *emoji));
                }
            }
        }
    }
}

/// A node copy with the groups an event moved.
struct Touched {
    node: Node,
    created: bool,
    groups: Vec<FieldGroup>,
}

impl Touched {
    fn into_change(self) -> Change {
        let mut change = Change::new(EntityKey::Node(self.node.id));
        self.merge_into(&mut change);
        change
    }

    /// Add the node write (if anything moved) to another change.
    fn merge_into(self, change: &mut Change) {
        let summary = if self.created {
            ChangeSummary::Created
        } else if self.groups.is_empty() {
            return;
        } else {
            ChangeSummary::Updated(self.groups)
        };
        let key = EntityKey::Node(self.node.id);
        change.writes.insert(0, Record::Node(self.node));
        change.notify(Topic::AllNodes, key, summary);
    }
}

fn newer(stamp: Option<Timestamp>, candidate: Timestamp) -> bool {
    stamp.map_or(true, |current| candidate > current)
}

/// Thread a message belongs to.
///
/// Direct messages are keyed by the peer: the addressee for outgoing
/// messages, the sender otherwise.
pub fn conversation_for(from: NodeId, destination: Destination, outgoing: bool) -> ConversationKey {
    match destination {
        Destination::Broadcast(index) => ConversationKey::Channel(index),
        Destination::Direct(to) if outgoing => ConversationKey::Direct(to),
        Destination::Direct(_) => ConversationKey::Direct(from),
    }
}
