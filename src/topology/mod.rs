//! Join topology: which streams take part in a join and how they correlate.
//!
//! A [`JoinTree`] is built once through [`TopologyBuilder`] and is immutable
//! afterwards. Building validates the structure (rooted, acyclic, one incoming
//! pair per node) and every expression against the stream schemas, so the
//! engine never has to re-check them while records flow.

use crate::core::{Scalar, ScalarType, StreamRecord, StreamType};
use crate::expression::{Expr, TypeCheckError};
use thiserror::Error;

pub type NodeId = usize;
pub type PairId = usize;

/// Structural or schema problems found while building a topology.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TopologyError {
    #[error("Stream {0} appears more than once in the topology")]
    DuplicateStream(String),

    #[error("Join on {right} references unknown left stream {left}")]
    UnknownLeftNode { left: String, right: String },

    #[error("Joining {0} would create a cycle")]
    Cycle(String),

    #[error("Stream {0} already has an incoming join pair")]
    AmbiguousNode(String),

    #[error("Unknown field {stream}.{field}")]
    UnknownField { stream: String, field: String },

    #[error("Field {field} is qualified with {found} but belongs to the {expected} side")]
    MisqualifiedField { expected: String, found: String, field: String },

    #[error("Invalid expression on {stream}: {message}")]
    InvalidExpression { stream: String, message: String },

    #[error("Cannot correlate {left} with {right}")]
    IncomparableKeys { left: ScalarType, right: ScalarType },

    #[error("Ordering field {field} of stream {stream} is missing or not numeric")]
    InvalidOrderField { stream: String, field: String },

    #[error("Window of stream {0} must be positive")]
    ZeroWindow(String),

    #[error("Buffer capacity of stream {0} must be positive")]
    ZeroCapacity(String),

    #[error("Tumbling window of stream {0} must be positive")]
    ZeroTumbling(String),

    #[error("Tumbling window on {0} needs an ordering field")]
    TumblingWithoutOrder(String),

    #[error("Tumbling windows group root records; {0} is a joined stream")]
    TumblingOnJoinedStream(String),
}

/// A stream type placed in the tree, with its retention policy.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinTreeNode {
    pub stream_type: StreamType,
    /// Retention window in clock units; entries older than this expire.
    pub window: Option<u64>,
    /// Explicit buffer capacity; overrides the engine default.
    pub max_entries: Option<usize>,
    /// Size of the tumbling windows that batch tuples by this node's
    /// ordering field. Root only.
    pub tumbling: Option<u64>,
}

impl JoinTreeNode {
    pub fn new(stream_type: StreamType) -> Self {
        Self { stream_type, window: None, max_entries: None, tumbling: None }
    }

    pub fn with_window(mut self, duration: u64) -> Self {
        self.window = Some(duration);
        self
    }

    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = Some(max_entries);
        self
    }

    pub fn with_tumbling(mut self, size: u64) -> Self {
        self.tumbling = Some(size);
        self
    }

    /// Tumbling window `record` falls into: its ordering value divided by the
    /// window size, rounded down. `None` without a tumbling window or value.
    pub fn window_key(&self, record: &StreamRecord) -> Option<i64> {
        let size = self.tumbling?;
        let order_field = self.stream_type.order_field.as_ref()?;
        let value = record.get(order_field)?;
        match value {
            Scalar::Int(v) | Scalar::Timestamp(v) => {
                Some(v.div_euclid(i64::try_from(size).unwrap_or(i64::MAX)))
            }
            #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
            Scalar::Float(v) if v.is_finite() => Some((v / size as f64).floor() as i64),
            _ => None,
        }
    }

    pub fn name(&self) -> &str {
        &self.stream_type.name
    }
}

impl From<StreamType> for JoinTreeNode {
    fn from(stream_type: StreamType) -> Self {
        JoinTreeNode::new(stream_type)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Side {
    Left,
    Right,
}

/// Identifies one correlation index: the values of one side's expression of
/// one pair, kept in the buffer of that side's node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IndexId {
    pub pair: PairId,
    pub side: Side,
}

/// Two nodes whose expressions must evaluate to equal values.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinTreePair {
    pub left: NodeId,
    pub right: NodeId,
    pub left_expression: Expr,
    pub right_expression: Expr,
}

impl JoinTreePair {
    pub fn node(&self, side: Side) -> NodeId {
        match side {
            Side::Left => self.left,
            Side::Right => self.right,
        }
    }

    pub fn expression(&self, side: Side) -> &Expr {
        match side {
            Side::Left => &self.left_expression,
            Side::Right => &self.right_expression,
        }
    }
}

/// One probe of a traversal: take the key of the record already chosen for
/// `from` and look up matching entries of `to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraversalStep {
    pub from: NodeId,
    pub to: NodeId,
    pub key_index: IndexId,
    pub probe_index: IndexId,
}

/// Validated join topology. Node 0 is the root.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinTree {
    nodes: Vec<JoinTreeNode>,
    pairs: Vec<JoinTreePair>,
}

impl JoinTree {
    /// A topology with only a root stream: every record forms a tuple on its own.
    pub fn single(root: impl Into<JoinTreeNode>) -> Result<Self, TopologyError> {
        TopologyBuilder::new(root).build()
    }

    pub fn root(&self) -> &JoinTreeNode {
        &self.nodes[0]
    }

    pub fn nodes(&self) -> &[JoinTreeNode] {
        &self.nodes
    }

    pub fn pairs(&self) -> &[JoinTreePair] {
        &self.pairs
    }

    pub fn node(&self, id: NodeId) -> &JoinTreeNode {
        &self.nodes[id]
    }

    pub fn node_id(&self, stream: &str) -> Option<NodeId> {
        self.nodes.iter().position(|n| n.name() == stream)
    }

    pub fn stream_names(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(JoinTreeNode::name)
    }

    /// The pair through which `node` was joined into the tree.
    pub fn parent_pair(&self, node: NodeId) -> Option<PairId> {
        self.pairs.iter().position(|p| p.right == node)
    }

    /// Pairs in which `node` is the left side, in declaration order.
    pub fn child_pairs(&self, node: NodeId) -> impl Iterator<Item = PairId> + '_ {
        self.pairs.iter().enumerate().filter(move |(_, p)| p.left == node).map(|(id, _)| id)
    }

    /// Every index kept in the buffer of `node`.
    pub fn indexes_for(&self, node: NodeId) -> Vec<IndexId> {
        let mut indexes = Vec::new();
        for (pair_id, pair) in self.pairs.iter().enumerate() {
            if pair.left == node {
                indexes.push(IndexId { pair: pair_id, side: Side::Left });
            }
            if pair.right == node {
                indexes.push(IndexId { pair: pair_id, side: Side::Right });
            }
        }
        indexes
    }

    /// Depth-first probe order covering the whole tree starting at `pivot`:
    /// children through outgoing pairs first, then the parent through the
    /// incoming pair, recursively.
    pub fn traversal_from(&self, pivot: NodeId) -> Vec<TraversalStep> {
        let mut steps = Vec::with_capacity(self.pairs.len());
        self.visit(pivot, None, &mut steps);
        steps
    }

    fn visit(&self, node: NodeId, arrived_by: Option<PairId>, steps: &mut Vec<TraversalStep>) {
        let children: Vec<PairId> = self.child_pairs(node).collect();
        for pair_id in children {
            if Some(pair_id) == arrived_by {
                continue;
            }
            let to = self.pairs[pair_id].right;
            steps.push(TraversalStep {
                from: node,
                to,
                key_index: IndexId { pair: pair_id, side: Side::Left },
                probe_index: IndexId { pair: pair_id, side: Side::Right },
            });
            self.visit(to, Some(pair_id), steps);
        }

        if let Some(pair_id) = self.parent_pair(node) {
            if Some(pair_id) != arrived_by {
                let to = self.pairs[pair_id].left;
                steps.push(TraversalStep {
                    from: node,
                    to,
                    key_index: IndexId { pair: pair_id, side: Side::Right },
                    probe_index: IndexId { pair: pair_id, side: Side::Left },
                });
                self.visit(to, Some(pair_id), steps);
            }
        }
    }

    fn is_ancestor_or_self(&self, candidate: NodeId, mut node: NodeId) -> bool {
        loop {
            if candidate == node {
                return true;
            }
            match self.parent_pair(node) {
                Some(pair_id) => node = self.pairs[pair_id].left,
                None => return false,
            }
        }
    }
}

#[derive(Clone)]
struct PendingJoin {
    left_stream: Option<String>,
    node: JoinTreeNode,
    left_expression: Expr,
    right_expression: Expr,
}

/// Declares a topology: a root stream plus `(with, left_expression,
/// right_expression)` joins, validated by [`TopologyBuilder::build`].
#[derive(Clone)]
pub struct TopologyBuilder {
    root: JoinTreeNode,
    joins: Vec<PendingJoin>,
}

impl TopologyBuilder {
    pub fn new(root: impl Into<JoinTreeNode>) -> Self {
        Self { root: root.into(), joins: Vec::new() }
    }

    /// Join `with` to the root stream.
    pub fn join(
        mut self,
        with: impl Into<JoinTreeNode>,
        left_expression: Expr,
        right_expression: Expr,
    ) -> Self {
        self.joins.push(PendingJoin {
            left_stream: None,
            node: with.into(),
            left_expression,
            right_expression,
        });
        self
    }

    /// Join `with` to an already declared stream, chaining the tree deeper.
    pub fn join_from(
        mut self,
        left_stream: &str,
        with: impl Into<JoinTreeNode>,
        left_expression: Expr,
        right_expression: Expr,
    ) -> Self {
        self.joins.push(PendingJoin {
            left_stream: Some(left_stream.to_string()),
            node: with.into(),
            left_expression,
            right_expression,
        });
        self
    }

    pub fn build(self) -> Result<JoinTree, TopologyError> {
        validate_node(&self.root)?;
        let mut tree = JoinTree { nodes: vec![self.root], pairs: Vec::new() };

        for join in self.joins {
            validate_node(&join.node)?;
            if join.node.tumbling.is_some() {
                return Err(TopologyError::TumblingOnJoinedStream(join.node.name().to_string()));
            }
            let right_name = join.node.name().to_string();

            let left = match &join.left_stream {
                None => 0,
                Some(name) => tree.node_id(name).ok_or_else(|| TopologyError::UnknownLeftNode {
                    left: name.clone(),
                    right: right_name.clone(),
                })?,
            };

            if let Some(existing) = tree.node_id(&right_name) {
                if tree.is_ancestor_or_self(existing, left) {
                    return Err(TopologyError::Cycle(right_name));
                }
                return Err(TopologyError::AmbiguousNode(right_name));
            }

            let left_type = tree.nodes[left].stream_type.clone();
            let lt = check_expression(&join.left_expression, &left_type)?;
            let rt = check_expression(&join.right_expression, &join.node.stream_type)?;
            let comparable = (lt.is_numeric() && rt.is_numeric()) || lt == rt;
            if !comparable {
                return Err(TopologyError::IncomparableKeys { left: lt, right: rt });
            }

            tree.nodes.push(join.node);
            tree.pairs.push(JoinTreePair {
                left,
                right: tree.nodes.len() - 1,
                left_expression: join.left_expression,
                right_expression: join.right_expression,
            });
        }

        Ok(tree)
    }
}

fn validate_node(node: &JoinTreeNode) -> Result<(), TopologyError> {
    let stream_type = &node.stream_type;

    let mut seen = std::collections::HashSet::new();
    for def in &stream_type.fields {
        if !seen.insert(def.name.as_str()) {
            return Err(TopologyError::InvalidExpression {
                stream: stream_type.name.clone(),
                message: format!("field {} declared twice", def.name),
            });
        }
    }

    if let Some(order_field) = &stream_type.order_field {
        let numeric = stream_type.field_def(order_field).is_some_and(|def| def.ty.is_numeric());
        if !numeric {
            return Err(TopologyError::InvalidOrderField {
                stream: stream_type.name.clone(),
                field: order_field.clone(),
            });
        }
    }

    if node.window == Some(0) {
        return Err(TopologyError::ZeroWindow(stream_type.name.clone()));
    }
    if node.max_entries == Some(0) {
        return Err(TopologyError::ZeroCapacity(stream_type.name.clone()));
    }
    match node.tumbling {
        Some(0) => return Err(TopologyError::ZeroTumbling(stream_type.name.clone())),
        Some(_) if stream_type.order_field.is_none() => {
            return Err(TopologyError::TumblingWithoutOrder(stream_type.name.clone()));
        }
        _ => {}
    }
    Ok(())
}

fn check_expression(expr: &Expr, schema: &StreamType) -> Result<ScalarType, TopologyError> {
    for field_ref in expr.field_refs() {
        if let Some(stream) = &field_ref.stream {
            if stream != &schema.name {
                return Err(TopologyError::MisqualifiedField {
                    expected: schema.name.clone(),
                    found: stream.clone(),
                    field: field_ref.field.clone(),
                });
            }
        }
        if !schema.has_field(&field_ref.field) {
            return Err(TopologyError::UnknownField {
                stream: schema.name.clone(),
                field: field_ref.field.clone(),
            });
        }
    }

    expr.infer_type(schema).map_err(|e| match e {
        TypeCheckError::UnknownField(field) => {
            TopologyError::UnknownField { stream: schema.name.clone(), field }
        }
        TypeCheckError::Mismatch(message) => {
            TopologyError::InvalidExpression { stream: schema.name.clone(), message }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(name: &str) -> StreamType {
        StreamType::new(name).field("time", ScalarType::Int).field("key", ScalarType::Str)
    }

    #[test]
    fn test_chained_tree_structure() {
        let tree = TopologyBuilder::new(stream("A"))
            .join(stream("B"), Expr::field("time"), Expr::field("time"))
            .join_from("B", stream("C"), Expr::field("key"), Expr::field("key"))
            .build()
            .unwrap();

        assert_eq!(tree.nodes().len(), 3);
        assert_eq!(tree.node_id("C"), Some(2));
        assert_eq!(tree.parent_pair(2), Some(1));
        assert_eq!(tree.child_pairs(0).collect::<Vec<_>>(), vec![0]);
        assert_eq!(
            tree.indexes_for(1),
            vec![IndexId { pair: 0, side: Side::Right }, IndexId { pair: 1, side: Side::Left }]
        );
    }

    #[test]
    fn test_traversal_from_leaf_reaches_every_node() {
        let tree = TopologyBuilder::new(stream("A"))
            .join(stream("B"), Expr::field("time"), Expr::field("time"))
            .join(stream("D"), Expr::field("time"), Expr::field("time"))
            .join_from("B", stream("C"), Expr::field("key"), Expr::field("key"))
            .build()
            .unwrap();

        let order: Vec<(NodeId, NodeId)> =
            tree.traversal_from(3).iter().map(|s| (s.from, s.to)).collect();
        // C -> B, then B -> A, then A -> D
        assert_eq!(order, vec![(3, 1), (1, 0), (0, 2)]);

        let from_root: Vec<NodeId> = tree.traversal_from(0).iter().map(|s| s.to).collect();
        assert_eq!(from_root, vec![1, 3, 2]);
    }

    #[test]
    fn test_rejects_ambiguous_right_node() {
        let err = TopologyBuilder::new(stream("A"))
            .join(stream("B"), Expr::field("time"), Expr::field("time"))
            .join(stream("C"), Expr::field("time"), Expr::field("time"))
            .join_from("C", stream("B"), Expr::field("key"), Expr::field("key"))
            .build()
            .unwrap_err();
        assert_eq!(err, TopologyError::AmbiguousNode("B".to_string()));
    }

    #[test]
    fn test_rejects_cycle_and_self_join() {
        let cycle = TopologyBuilder::new(stream("A"))
            .join(stream("B"), Expr::field("time"), Expr::field("time"))
            .join_from("B", stream("A"), Expr::field("time"), Expr::field("time"))
            .build()
            .unwrap_err();
        assert_eq!(cycle, TopologyError::Cycle("A".to_string()));

        let self_join = TopologyBuilder::new(stream("A"))
            .join(stream("A"), Expr::field("time"), Expr::field("time"))
            .build()
            .unwrap_err();
        assert_eq!(self_join, TopologyError::Cycle("A".to_string()));
    }

    #[test]
    fn test_rejects_unknown_left_and_field() {
        let unknown_left = TopologyBuilder::new(stream("A"))
            .join_from("Z", stream("B"), Expr::field("time"), Expr::field("time"))
            .build()
            .unwrap_err();
        assert!(matches!(unknown_left, TopologyError::UnknownLeftNode { .. }));

        let unknown_field = TopologyBuilder::new(stream("A"))
            .join(stream("B"), Expr::field("time"), Expr::field("speed"))
            .build()
            .unwrap_err();
        assert_eq!(
            unknown_field,
            TopologyError::UnknownField { stream: "B".to_string(), field: "speed".to_string() }
        );
    }

    #[test]
    fn test_rejects_misqualified_and_incomparable() {
        let misqualified = TopologyBuilder::new(stream("A"))
            .join(stream("B"), Expr::qualified("B", "time"), Expr::field("time"))
            .build()
            .unwrap_err();
        assert!(matches!(misqualified, TopologyError::MisqualifiedField { .. }));

        let incomparable = TopologyBuilder::new(stream("A"))
            .join(stream("B"), Expr::field("time"), Expr::field("key"))
            .build()
            .unwrap_err();
        assert_eq!(
            incomparable,
            TopologyError::IncomparableKeys { left: ScalarType::Int, right: ScalarType::Str }
        );
    }

    #[test]
    fn test_rejects_bad_node_settings() {
        let bad_order = JoinTree::single(stream("A").ordered_by("key")).unwrap_err();
        assert!(matches!(bad_order, TopologyError::InvalidOrderField { .. }));

        let zero_window = JoinTree::single(JoinTreeNode::new(stream("A")).with_window(0));
        assert_eq!(zero_window.unwrap_err(), TopologyError::ZeroWindow("A".to_string()));
    }

    #[test]
    fn test_tumbling_window_only_on_ordered_root() {
        let unordered = JoinTree::single(JoinTreeNode::new(stream("A")).with_tumbling(10));
        assert_eq!(unordered.unwrap_err(), TopologyError::TumblingWithoutOrder("A".to_string()));

        let joined = TopologyBuilder::new(stream("A").ordered_by("time"))
            .join(
                JoinTreeNode::new(stream("B").ordered_by("time")).with_tumbling(10),
                Expr::field("time"),
                Expr::field("time"),
            )
            .build()
            .unwrap_err();
        assert_eq!(joined, TopologyError::TumblingOnJoinedStream("B".to_string()));

        let zero = JoinTree::single(JoinTreeNode::new(stream("A").ordered_by("time")).with_tumbling(0));
        assert_eq!(zero.unwrap_err(), TopologyError::ZeroTumbling("A".to_string()));
    }

    #[test]
    fn test_window_key_rounds_down() {
        let tree =
            JoinTree::single(JoinTreeNode::new(stream("A").ordered_by("time")).with_tumbling(10))
                .unwrap();
        let root = tree.root();

        assert_eq!(root.window_key(&StreamRecord::new("A").with("time", 0)), Some(0));
        assert_eq!(root.window_key(&StreamRecord::new("A").with("time", 19)), Some(1));
        assert_eq!(root.window_key(&StreamRecord::new("A").with("time", -1)), Some(-1));
        assert_eq!(root.window_key(&StreamRecord::new("A").with("key", "x")), None);
    }
}
