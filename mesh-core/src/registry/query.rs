//! Read-side selection: node filtering/sorting and conversation paging.
//!
//! Node queries take an owned copy of the nodes so callers can release the
//! model lock before filtering and sorting.

use std::cmp::Ordering;

use mesh_types::{ConversationKey, Message, MessageId, Node, Position, Timestamp};

use super::{haversine_km, Model};

/// Column a node list is ordered by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeSortKey {
    /// Case-folded long name, falling back to short name.
    Name,
    /// Last packet time.
    LastSeen,
    /// Distance from the local position.
    Distance,
    /// SNR of the last packet.
    Snr,
    /// Battery level.
    Battery,
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SortDirection {
    /// Smallest first.
    #[default]
    Ascending,
    /// Largest first.
    Descending,
}

/// A message with its reply parent resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageView {
    /// The message.
    pub message: Message,
    /// The parent, when it exists in the same conversation.
    pub parent: Option<Message>,
}

/// Whether a node matches a lowercase substring needle.
pub fn node_matches(node: &Node, needle: &str) -> bool {
    if needle.is_empty() {
        return true;
    }
    let hit = |text: &str| text.to_lowercase().contains(needle);

    hit(&node.id.to_string())
        || node.long_name.as_deref().is_some_and(hit)
        || node.short_name.as_deref().is_some_and(hit)
        || node.hw_model.as_deref().is_some_and(hit)
        || node
            .position
            .is_some_and(|p| hit(&format!("{:.4},{:.4}", p.latitude, p.longitude)))
}

/// Filter, annotate with distance, and sort an owned node list.
pub fn select_nodes(
    nodes: Vec<Node>,
    filter: Option<&str>,
    key: NodeSortKey,
    direction: SortDirection,
    origin: Option<Position>,
) -> Vec<Node> {
    let needle = filter.map(str::to_lowercase).unwrap_or_default();
    let mut selected: Vec<Node> = nodes
        .into_iter()
        .filter(|node| node_matches(node, &needle))
        .map(|mut node| {
            node.distance_km = match (origin, node.position) {
                (Some(origin), Some(position)) => Some(haversine_km(&origin, &position)),
                _ => None,
            };
            node
        })
        .collect();

    selected.sort_by(|a, b| compare(a, b, key, direction));
    selected
}

fn compare(a: &Node, b: &Node, key: NodeSortKey, direction: SortDirection) -> Ordering {
    let by_value = match key {
        NodeSortKey::Name => missing_last(name_key(a), name_key(b), direction),
        NodeSortKey::LastSeen => missing_last(a.last_seen, b.last_seen, direction),
        NodeSortKey::Distance => missing_last_f64(a.distance_km, b.distance_km, direction),
        NodeSortKey::Snr => missing_last_f64(
            a.signal.snr.map(f64::from),
            b.signal.snr.map(f64::from),
            direction,
        ),
        NodeSortKey::Battery => {
            missing_last(a.metrics.battery_level, b.metrics.battery_level, direction)
        }
    };
    by_value.then_with(|| a.id.cmp(&b.id))
}

fn name_key(node: &Node) -> Option<String> {
    node.long_name
        .as_deref()
        .or(node.short_name.as_deref())
        .map(str::to_lowercase)
}

fn missing_last<T: Ord>(a: Option<T>, b: Option<T>, direction: SortDirection) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => directed(a.cmp(&b), direction),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn missing_last_f64(a: Option<f64>, b: Option<f64>, direction: SortDirection) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => directed(a.total_cmp(&b), direction),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn directed(ordering: Ordering, direction: SortDirection) -> Ordering {
    match direction {
        SortDirection::Ascending => ordering,
        SortDirection::Descending => ordering.reverse(),
    }
}

impl Model {
    /// Filtered, sorted copy of the node list.
    pub fn query_nodes(
        &self,
        filter: Option<&str>,
        key: NodeSortKey,
        direction: SortDirection,
    ) -> Vec<Node> {
        select_nodes(self.nodes_snapshot(), filter, key, direction, self.origin())
    }

    /// The latest `limit` messages of a conversation older than `before`,
    /// oldest first.
    pub fn query_conversation(
        &self,
        key: ConversationKey,
        before: Option<Timestamp>,
        limit: usize,
    ) -> Vec<MessageView> {
        let Some(thread) = self.threads.get(&key) else {
            return Vec::new();
        };
        let upper = before.map(|ts| (ts, MessageId::new(0)));
        let mut ids: Vec<MessageId> = match upper {
            Some(upper) => thread.range(..upper).rev().take(limit).map(|(_, id)| *id).collect(),
            None => thread.iter().rev().take(limit).map(|(_, id)| *id).collect(),
        };
        ids.reverse();

        ids.into_iter()
            .filter_map(|id| self.messages.get(&id))
            .map(|message| MessageView {
                message: message.clone(),
                parent: message
                    .reply_to
                    .and_then(|parent| self.messages.get(&parent))
                    .filter(|parent| parent.conversation == message.conversation)
                    .cloned(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_types::{NodeId, Timestamp};

    fn node(id: u32, name: Option<&str>) -> Node {
        let mut node = Node::new(NodeId::new(id));
        node.long_name = name.map(String::from);
        node
    }

    fn ids(nodes: &[Node]) -> Vec<u32> {
        nodes.iter().map(|n| n.id.value()).collect()
    }

    #[test]
    fn name_sort_is_case_folded_with_missing_last() {
        let nodes = vec![
            node(4, None),
            node(3, Some("bravo")),
            node(2, Some("Alpha")),
            node(1, Some("charlie")),
        ];

        let asc = select_nodes(
            nodes.clone(),
            None,
            NodeSortKey::Name,
            SortDirection::Ascending,
            None,
        );
        assert_eq!(ids(&asc), vec![2, 3, 1, 4]);

        let desc = select_nodes(nodes, None, NodeSortKey::Name, SortDirection::Descending, None);
        assert_eq!(ids(&desc), vec![1, 3, 2, 4]);
    }

    #[test]
    fn short_name_is_the_fallback() {
        let mut short = node(9, None);
        short.short_name = Some("AAAA".into());
        let nodes = vec![node(1, Some("zulu")), short];
        let sorted = select_nodes(nodes, None, NodeSortKey::Name, SortDirection::Ascending, None);
        assert_eq!(ids(&sorted), vec![9, 1]);
    }

    #[test]
    fn ties_break_on_ascending_id_in_both_directions() {
        let mut nodes = Vec::new();
        for id in [7, 3, 5] {
            let mut n = node(id, None);
            n.metrics.battery_level = Some(80);
            nodes.push(n);
        }
        let asc = select_nodes(
            nodes.clone(),
            None,
            NodeSortKey::Battery,
            SortDirection::Ascending,
            None,
        );
        let desc = select_nodes(nodes, None, NodeSortKey::Battery, SortDirection::Descending, None);
        assert_eq!(ids(&asc), vec![3, 5, 7]);
        assert_eq!(ids(&desc), vec![3, 5, 7]);
    }

    #[test]
    fn snr_and_last_seen_sort() {
        let mut a = node(1, None);
        a.signal.snr = Some(-3.5);
        a.last_seen = Some(Timestamp::from_secs(10));
        let mut b = node(2, None);
        b.signal.snr = Some(6.0);
        b.last_seen = Some(Timestamp::from_secs(5));
        let c = node(3, None);

        let by_snr = select_nodes(
            vec![a.clone(), b.clone(), c.clone()],
            None,
            NodeSortKey::Snr,
            SortDirection::Descending,
            None,
        );
        assert_eq!(ids(&by_snr), vec![2, 1, 3]);

        let by_seen = select_nodes(
            vec![a, b, c],
            None,
            NodeSortKey::LastSeen,
            SortDirection::Ascending,
            None,
        );
        assert_eq!(ids(&by_seen), vec![2, 1, 3]);
    }

    #[test]
    fn distance_needs_an_origin() {
        let mut near = node(1, None);
        near.position = Some(Position::new(51.51, -0.13));
        let mut far = node(2, None);
        far.position = Some(Position::new(48.85, 2.35));
        let unknown = node(3, None);
        let nodes = vec![far, unknown, near];

        let origin = Some(Position::new(51.5, -0.12));
        let sorted = select_nodes(
            nodes.clone(),
            None,
            NodeSortKey::Distance,
            SortDirection::Ascending,
            origin,
        );
        assert_eq!(ids(&sorted), vec![1, 2, 3]);
        assert!(sorted[0].distance_km.unwrap() < 2.0);

        let no_origin = select_nodes(
            nodes,
            None,
            NodeSortKey::Distance,
            SortDirection::Ascending,
            None,
        );
        assert!(no_origin.iter().all(|n| n.distance_km.is_none()));
        assert_eq!(ids(&no_origin), vec![1, 2, 3]);
    }

    #[test]
    fn filter_matches_id_names_model_and_position() {
        let mut a = node(0xdeadbeef, Some("Hilltop Relay"));
        a.hw_model = Some("RAK4631".into());
        let mut b = node(0x12, None);
        b.short_name = Some("BASE".into());
        b.position = Some(Position::new(47.123456, 8.5));
        let nodes = vec![a, b];

        let by = |needle: &str| {
            ids(&select_nodes(
                nodes.clone(),
                Some(needle),
                NodeSortKey::Name,
                SortDirection::Ascending,
                None,
            ))
        };
        assert_eq!(by("hilltop"), vec![0xdeadbeef]);
        assert_eq!(by("!DEADBE"), vec![0xdeadbeef]);
        assert_eq!(by("rak"), vec![0xdeadbeef]);
        assert_eq!(by("base"), vec![0x12]);
        assert_eq!(by("47.1235,8.5000"), vec![0x12]);
        assert!(by("nothing").is_empty());
        assert_eq!(by("").len(), 2);
    }
}
