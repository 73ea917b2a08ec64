//! Immutable statechart document model.
//!
//! Documents use a JSON DSL mirroring the SCXML node structure:
//!
//! ```json
//! {
//!   "non_unique": ["on", "off"],
//!   "states": [
//!     {"id": "appear",
//!      "transitions": [{"event": "born", "target": "live", "ontransit": "say_hello"}]},
//!     {"id": "live", "kind": "parallel",
//!      "transitions": [{"event": "hp_zero", "target": "dead"}],
//!      "states": [
//!        {"id": "eat",  "states": [{"id": "on"}, {"id": "off"}]},
//!        {"id": "move", "states": [{"id": "on"}, {"id": "off"}]}
//!      ]},
//!     {"id": "dead", "kind": "final"}
//!   ]
//! }
//! ```
//!
//! `kind` is one of `state` (default), `parallel` or `final`; a `state` with
//! children is compound, without children atomic. Identifiers listed in
//! `non_unique` may repeat across parent scopes and are addressed by their
//! dotted path (`move.on`); all other identifiers are globally unique and
//! addressed by their flat id.

use crate::error::EngineError;
use serde::{de, Deserialize, Deserializer};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Index of a state node within its document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

/// Node kind per statechart semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Leaf state, no children.
    Atomic,
    /// Exactly one child active at a time; the first declared child is the
    /// default.
    Compound,
    /// All children active simultaneously.
    Parallel,
    /// Terminal leaf; never exited once entered.
    Final,
}

/// A resolved transition declared on a state node.
#[derive(Debug, Clone)]
pub struct Transition {
    /// Triggering event name; matched by equality only.
    pub event: String,
    /// Resolved target node.
    pub target: NodeId,
    /// Action slots fired between exits and entries, in declaration order.
    pub actions: Vec<String>,
}

/// One node of the parsed document tree.
#[derive(Debug)]
pub struct StateNode {
    /// Identifier as declared (local to the parent scope).
    pub id: String,
    /// Qualified identifier: flat for unique ids, dotted path for
    /// non-unique ones.
    pub uid: String,
    pub kind: NodeKind,
    pub parent: Option<NodeId>,
    /// Children in declaration order.
    pub children: Vec<NodeId>,
    pub transitions: Vec<Transition>,
    pub depth: u16,
}

/// An immutable document tree, built once from its textual form and shared
/// read-only by every machine bound to it.
#[derive(Debug)]
pub struct Document {
    name: String,
    nodes: Vec<StateNode>,
    by_uid: HashMap<String, NodeId>,
    non_unique: HashSet<String>,
    checksum: u32,
}

// ---------------------------------------------------------------------------
// Raw DSL
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawDocument {
    #[serde(default, deserialize_with = "string_or_seq")]
    non_unique: Vec<String>,
    #[serde(default)]
    states: Vec<RawNode>,
}

#[derive(Debug, Deserialize)]
struct RawNode {
    id: String,
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    states: Vec<RawNode>,
    #[serde(default)]
    transitions: Vec<RawTransition>,
}

#[derive(Debug, Deserialize)]
struct RawTransition {
    event: String,
    target: String,
    #[serde(default, deserialize_with = "string_or_seq")]
    ontransit: Vec<String>,
}

/// Accepts `"on,off"` as well as `["on", "off"]`; attribute-style
/// documents write the `non_unique` option as one comma-separated string.
fn string_or_seq<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    struct StringOrSeq;

    impl<'de> de::Visitor<'de> for StringOrSeq {
        type Value = Vec<String>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a string or array of strings")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(value
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect())
        }

        fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            let mut items = Vec::new();
            while let Some(s) = seq.next_element::<String>()? {
                items.push(s);
            }
            Ok(items)
        }
    }

    deserializer.deserialize_any(StringOrSeq)
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

enum LookupFailure {
    Ambiguous,
    Unknown,
}

fn lookup(
    by_uid: &HashMap<String, NodeId>,
    non_unique: &HashSet<String>,
    id: &str,
) -> Result<NodeId, LookupFailure> {
    // Bare lookups of a non-unique id never resolve, even when only one
    // node with that id exists; callers must qualify by path.
    if non_unique.contains(id) {
        return Err(LookupFailure::Ambiguous);
    }
    by_uid.get(id).copied().ok_or(LookupFailure::Unknown)
}

impl Document {
    /// Parses and validates a document from its textual form.
    pub fn parse(name: impl Into<String>, text: &str) -> Result<Self, EngineError> {
        let name = name.into();
        let malformed = |reason: String| EngineError::MalformedDocument {
            name: name.clone(),
            reason,
        };

        let raw: RawDocument =
            serde_json::from_str(text).map_err(|e| malformed(e.to_string()))?;

        let non_unique: HashSet<String> = raw.non_unique.into_iter().collect();
        let mut nodes = Vec::new();
        let mut by_uid = HashMap::new();
        let mut pending = Vec::new();

        nodes.push(StateNode {
            id: String::new(),
            uid: String::new(),
            kind: NodeKind::Compound,
            parent: None,
            children: Vec::new(),
            transitions: Vec::new(),
            depth: 0,
        });
        let root = NodeId(0);

        for child in raw.states {
            let nid = build_node(&mut nodes, &mut by_uid, &non_unique, &mut pending, child, root)
                .map_err(&malformed)?;
            nodes[root.0].children.push(nid);
        }

        if nodes[root.0].children.is_empty() {
            return Err(malformed("document declares no states".into()));
        }

        // Second pass: resolve transition targets now that every uid is known.
        for (nid, raw_tran) in pending {
            let target = match lookup(&by_uid, &non_unique, &raw_tran.target) {
                Ok(t) => t,
                Err(LookupFailure::Ambiguous) => {
                    return Err(malformed(format!(
                        "transition target '{}' is ambiguous, qualify it by parent path",
                        raw_tran.target
                    )))
                }
                Err(LookupFailure::Unknown) => {
                    return Err(malformed(format!(
                        "transition target '{}' does not resolve to any state",
                        raw_tran.target
                    )))
                }
            };
            let node: &mut StateNode = &mut nodes[nid.0];
            node.transitions.push(Transition {
                event: raw_tran.event,
                target,
                actions: raw_tran.ontransit,
            });
        }

        let checksum = crc32c::crc32c(text.as_bytes());

        Ok(Self {
            name,
            nodes,
            by_uid,
            non_unique,
            checksum,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// crc32c over the raw document text, used for idempotent re-install
    /// detection.
    pub fn checksum(&self) -> u32 {
        self.checksum
    }

    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    pub fn node(&self, id: NodeId) -> &StateNode {
        &self.nodes[id.0]
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// All addressable state uids, in document order.
    pub fn all_uids(&self) -> Vec<&str> {
        self.nodes[1..].iter().map(|n| n.uid.as_str()).collect()
    }

    /// Resolves a state identifier to a node. Globally-unique ids resolve by
    /// flat name; ids declared `non_unique` must be qualified by parent path
    /// and a bare lookup fails with [`EngineError::AmbiguousStateId`].
    pub fn resolve(&self, id: &str) -> Result<NodeId, EngineError> {
        match lookup(&self.by_uid, &self.non_unique, id) {
            Ok(n) => Ok(n),
            Err(LookupFailure::Ambiguous) => {
                Err(EngineError::AmbiguousStateId { id: id.to_string() })
            }
            Err(LookupFailure::Unknown) => Err(EngineError::UnknownStateId { id: id.to_string() }),
        }
    }

    /// Whether `node` equals `ancestor` or sits anywhere below it.
    pub fn is_descendant_or_self(&self, node: NodeId, ancestor: NodeId) -> bool {
        let mut cur = Some(node);
        while let Some(n) = cur {
            if n == ancestor {
                return true;
            }
            cur = self.nodes[n.0].parent;
        }
        false
    }

    /// Lowest common ancestor-or-self of two nodes.
    pub(crate) fn lca(&self, a: NodeId, b: NodeId) -> NodeId {
        let mut a = a;
        let mut b = b;
        while self.nodes[a.0].depth > self.nodes[b.0].depth {
            a = self.nodes[a.0].parent.expect("non-root node has a parent");
        }
        while self.nodes[b.0].depth > self.nodes[a.0].depth {
            b = self.nodes[b.0].parent.expect("non-root node has a parent");
        }
        while a != b {
            a = self.nodes[a.0].parent.expect("non-root node has a parent");
            b = self.nodes[b.0].parent.expect("non-root node has a parent");
        }
        a
    }

    /// The child of `ancestor` lying on the path down to `descendant`.
    /// `descendant` must be a strict descendant of `ancestor`.
    pub(crate) fn child_toward(&self, ancestor: NodeId, descendant: NodeId) -> NodeId {
        let mut cur = descendant;
        loop {
            let parent = self.nodes[cur.0]
                .parent
                .expect("descendant lies below ancestor");
            if parent == ancestor {
                return cur;
            }
            cur = parent;
        }
    }
}

fn build_node(
    nodes: &mut Vec<StateNode>,
    by_uid: &mut HashMap<String, NodeId>,
    non_unique: &HashSet<String>,
    pending: &mut Vec<(NodeId, RawTransition)>,
    raw: RawNode,
    parent: NodeId,
) -> Result<NodeId, String> {
    let kind = match raw.kind.as_deref() {
        None | Some("state") => {
            if raw.states.is_empty() {
                NodeKind::Atomic
            } else {
                NodeKind::Compound
            }
        }
        Some("parallel") => {
            if raw.states.is_empty() {
                return Err(format!("parallel state '{}' has no children", raw.id));
            }
            NodeKind::Parallel
        }
        Some("final") => {
            if !raw.states.is_empty() {
                return Err(format!("final state '{}' cannot have children", raw.id));
            }
            NodeKind::Final
        }
        Some(other) => return Err(format!("unknown node kind '{other}'")),
    };

    if kind == NodeKind::Final && nodes[parent.0].kind == NodeKind::Parallel {
        // Parallel completion is scoped to finals nested below a region; a
        // final region itself has no exit-free termination semantics.
        return Err(format!(
            "final state '{}' cannot be a direct child of a parallel state",
            raw.id
        ));
    }

    let parent_uid = nodes[parent.0].uid.clone();
    let uid = if non_unique.contains(&raw.id) {
        if parent_uid.is_empty() {
            raw.id.clone()
        } else {
            format!("{parent_uid}.{}", raw.id)
        }
    } else {
        raw.id.clone()
    };

    let nid = NodeId(nodes.len());
    if by_uid.insert(uid.clone(), nid).is_some() {
        return Err(format!("duplicate state id '{uid}'"));
    }

    let depth = nodes[parent.0].depth + 1;
    nodes.push(StateNode {
        id: raw.id,
        uid,
        kind,
        parent: Some(parent),
        children: Vec::new(),
        transitions: Vec::new(),
        depth,
    });

    for tran in raw.transitions {
        pending.push((nid, tran));
    }

    for child in raw.states {
        let cid = build_node(nodes, by_uid, non_unique, pending, child, nid)?;
        nodes[nid.0].children.push(cid);
    }

    Ok(nid)
}
