//! Active-state configuration for one machine instance.

use crate::document::{Document, NodeId, NodeKind};
use std::collections::HashMap;

/// How a node participates in the active configuration.
///
/// Final states are recorded as `Terminal` the moment they are entered.
/// Exit dispatch only exists for `Exitable` entries, so no code path can
/// fire an exit handler on a final state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Exitable,
    Terminal,
}

/// The set of currently active document nodes.
#[derive(Debug, Default)]
pub struct Configuration {
    active: HashMap<NodeId, Activation>,
}

impl Configuration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_active(&self, id: NodeId) -> bool {
        self.active.contains_key(&id)
    }

    pub fn activation(&self, id: NodeId) -> Option<Activation> {
        self.active.get(&id).copied()
    }

    pub(crate) fn activate(&mut self, id: NodeId, activation: Activation) {
        self.active.insert(id, activation);
    }

    pub(crate) fn deactivate(&mut self, id: NodeId) -> Option<Activation> {
        self.active.remove(&id)
    }

    pub(crate) fn clear(&mut self) {
        self.active.clear();
    }

    /// Active state uids in document order, excluding the document root.
    pub fn active_uids(&self, doc: &Document) -> Vec<String> {
        let mut ids: Vec<NodeId> = self.active.keys().copied().collect();
        ids.sort();
        ids.into_iter()
            .filter(|&n| n != doc.root())
            .map(|n| doc.node(n).uid.clone())
            .collect()
    }

    /// Active nodes with no active child, in document order.
    pub(crate) fn active_leaves(&self, doc: &Document) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .active
            .keys()
            .copied()
            .filter(|&n| {
                doc.node(n)
                    .children
                    .iter()
                    .all(|&c| !self.is_active(c))
            })
            .collect();
        ids.sort();
        ids
    }

    /// Active descendants of `top` including `top` itself, ordered
    /// deepest-active-leaf first: recursive post-order with children
    /// visited in reverse declaration order.
    pub(crate) fn exit_set(&self, doc: &Document, top: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        if self.is_active(top) {
            self.collect_exits(doc, top, &mut out);
        }
        out
    }

    fn collect_exits(&self, doc: &Document, node: NodeId, out: &mut Vec<NodeId>) {
        for &child in doc.node(node).children.iter().rev() {
            if self.is_active(child) {
                self.collect_exits(doc, child, out);
            }
        }
        out.push(node);
    }

    /// Whether a final state directly below the root is active.
    pub(crate) fn top_level_final_active(&self, doc: &Document) -> bool {
        doc.node(doc.root())
            .children
            .iter()
            .any(|&c| doc.node(c).kind == NodeKind::Final && self.is_active(c))
    }

    /// Checks the statechart invariants that must hold at every quiescent
    /// point. Returns a description of the first violation found.
    pub fn validate(&self, doc: &Document) -> Result<(), String> {
        if self.is_empty() {
            return Ok(());
        }
        if !self.is_active(doc.root()) {
            return Err("configuration non-empty but root inactive".into());
        }
        for (&id, &activation) in &self.active {
            let node = doc.node(id);
            if let Some(parent) = node.parent {
                if !self.is_active(parent) {
                    return Err(format!("'{}' active but its parent is not", node.uid));
                }
            }
            match node.kind {
                NodeKind::Compound => {
                    let active_children =
                        node.children.iter().filter(|&&c| self.is_active(c)).count();
                    if active_children != 1 {
                        return Err(format!(
                            "compound '{}' has {} active children, expected exactly 1",
                            node.uid, active_children
                        ));
                    }
                }
                NodeKind::Parallel => {
                    if !node.children.iter().all(|&c| self.is_active(c)) {
                        return Err(format!(
                            "parallel '{}' does not have all children active",
                            node.uid
                        ));
                    }
                }
                NodeKind::Atomic => {}
                NodeKind::Final => {
                    if activation != Activation::Terminal {
                        return Err(format!("final '{}' recorded as exitable", node.uid));
                    }
                }
            }
            if node.kind != NodeKind::Final && activation == Activation::Terminal {
                return Err(format!("non-final '{}' recorded as terminal", node.uid));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Document;

    fn doc() -> Document {
        Document::parse(
            "t",
            r#"{
                "non_unique": ["on", "off"],
                "states": [
                    {"id": "a"},
                    {"id": "p", "kind": "parallel", "states": [
                        {"id": "r1", "states": [{"id": "on"}, {"id": "off"}]},
                        {"id": "r2", "states": [{"id": "on"}, {"id": "off"}]}
                    ]},
                    {"id": "end", "kind": "final"}
                ]
            }"#,
        )
        .unwrap()
    }

    fn activate_path(config: &mut Configuration, doc: &Document, uid: &str) {
        let mut cur = Some(doc.resolve(uid).unwrap());
        while let Some(n) = cur {
            config.activate(n, Activation::Exitable);
            cur = doc.node(n).parent;
        }
        config.activate(doc.root(), Activation::Exitable);
    }

    #[test]
    fn test_validate_catches_compound_violation() {
        let doc = doc();
        let mut config = Configuration::new();
        activate_path(&mut config, &doc, "a");
        assert!(config.validate(&doc).is_ok());

        // Second active child of the root breaks exactly-one-active-child.
        config.activate(doc.resolve("p").unwrap(), Activation::Exitable);
        assert!(config.validate(&doc).is_err());
    }

    #[test]
    fn test_validate_requires_all_parallel_regions() {
        let doc = doc();
        let mut config = Configuration::new();
        activate_path(&mut config, &doc, "r1.on");
        // r2 inactive under the parallel.
        assert!(config.validate(&doc).is_err());

        activate_path(&mut config, &doc, "r2.off");
        assert!(config.validate(&doc).is_ok());
    }

    #[test]
    fn test_exit_set_is_deepest_first_reverse_region_order() {
        let doc = doc();
        let mut config = Configuration::new();
        activate_path(&mut config, &doc, "r1.on");
        activate_path(&mut config, &doc, "r2.off");

        let p = doc.resolve("p").unwrap();
        let exits = config.exit_set(&doc, p);
        let uids: Vec<&str> = exits.iter().map(|&n| doc.node(n).uid.as_str()).collect();
        assert_eq!(uids, vec!["r2.off", "r2", "r1.on", "r1", "p"]);
    }

    #[test]
    fn test_terminal_tagging() {
        let doc = doc();
        let mut config = Configuration::new();
        let end = doc.resolve("end").unwrap();
        config.activate(doc.root(), Activation::Exitable);
        config.activate(end, Activation::Terminal);

        assert!(config.top_level_final_active(&doc));
        assert_eq!(config.activation(end), Some(Activation::Terminal));
        assert!(config.validate(&doc).is_ok());
    }

    #[test]
    fn test_active_leaves() {
        let doc = doc();
        let mut config = Configuration::new();
        activate_path(&mut config, &doc, "r1.on");
        activate_path(&mut config, &doc, "r2.off");

        let leaves = config.active_leaves(&doc);
        let uids: Vec<&str> = leaves.iter().map(|&n| doc.node(n).uid.as_str()).collect();
        assert_eq!(uids, vec!["r1.on", "r2.off"]);
    }
}
