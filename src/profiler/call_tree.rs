//! The call tree data structure.

use std::fmt::Write as _;
use std::time::Instant;

use serde::Serialize;

/// One node of a recorded call tree: a method signature, its total
/// execution time, how often it was called from this position, and the
/// calls it made in turn.
///
/// Serializes with camelCase field names, e.g.
/// `{"signature": "...", "executionTime": 1000, "callCount": 1, "children": []}`.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallTreeNode {
    signature: String,
    #[serde(rename = "executionTime")]
    execution_time_nanos: u64,
    call_count: u32,
    children: Vec<CallTreeNode>,
    #[serde(skip)]
    started_at: Option<Instant>,
}

impl CallTreeNode {
    /// Create a closed node with a known execution time, for building call
    /// trees from externally measured data.
    pub fn new(signature: impl Into<String>, execution_time_nanos: u64) -> Self {
        CallTreeNode {
            signature: signature.into(),
            execution_time_nanos,
            call_count: 1,
            children: Vec::new(),
            started_at: None,
        }
    }

    /// Create an open node whose execution time starts accruing now.
    pub(crate) fn open(signature: impl Into<String>) -> Self {
        CallTreeNode {
            signature: signature.into(),
            execution_time_nanos: 0,
            call_count: 1,
            children: Vec::new(),
            started_at: Some(Instant::now()),
        }
    }

    /// Stop the clock on an open node. Closing a closed node is a no-op.
    pub(crate) fn close(&mut self) {
        if let Some(started_at) = self.started_at.take() {
            self.execution_time_nanos += started_at.elapsed().as_nanos() as u64;
        }
    }

    /// The method signature of this node.
    pub fn signature(&self) -> &str {
        &self.signature
    }

    /// Replace the signature, e.g. to label the root with the operation name.
    pub fn set_signature(&mut self, signature: impl Into<String>) {
        self.signature = signature.into();
    }

    /// The accumulated execution time of this node, including children.
    pub fn execution_time_nanos(&self) -> u64 {
        self.execution_time_nanos
    }

    /// Overwrite the accumulated execution time.
    pub fn set_execution_time_nanos(&mut self, execution_time_nanos: u64) {
        self.execution_time_nanos = execution_time_nanos;
    }

    /// How many sibling calls were folded into this node.
    pub fn call_count(&self) -> u32 {
        self.call_count
    }

    /// The calls made by this node.
    pub fn children(&self) -> &[CallTreeNode] {
        &self.children
    }

    /// Append a closed child node.
    pub fn add_child(&mut self, child: CallTreeNode) {
        self.children.push(child);
    }

    /// Append an open child and return its index.
    pub(crate) fn open_child(&mut self, signature: &str) -> usize {
        self.children.push(CallTreeNode::open(signature));
        self.children.len() - 1
    }

    pub(crate) fn child_mut_checked(&mut self, index: usize) -> Option<&mut CallTreeNode> {
        self.children.get_mut(index)
    }

    /// Merge the last child into its previous sibling when both are closed
    /// leaf calls of the same signature. Keeps repeated calls in a loop from
    /// blowing up the tree.
    pub(crate) fn fold_last_child(&mut self) {
        let [.., previous, last] = &self.children[..] else {
            return;
        };
        let foldable = previous.signature == last.signature
            && previous.children.is_empty()
            && last.children.is_empty()
            && previous.started_at.is_none()
            && last.started_at.is_none();
        if !foldable {
            return;
        }
        if let Some(last) = self.children.pop() {
            if let Some(previous) = self.children.last_mut() {
                previous.execution_time_nanos += last.execution_time_nanos;
                previous.call_count += last.call_count;
            }
        }
    }

    /// Remove all descendants faster than the given threshold. A child that
    /// is removed takes its own children with it.
    pub fn remove_calls_faster_than(&mut self, min_execution_time_nanos: u64) {
        self.children
            .retain(|child| child.execution_time_nanos >= min_execution_time_nanos);
        for child in &mut self.children {
            child.remove_calls_faster_than(min_execution_time_nanos);
        }
    }

    /// Render the tree as indented text, one line per node, with each
    /// node's share of the root execution time.
    pub fn to_ascii(&self) -> String {
        let mut out = String::new();
        let total = self.execution_time_nanos.max(1);
        self.write_ascii(&mut out, 0, total);
        out
    }

    fn write_ascii(&self, out: &mut String, depth: usize, total_nanos: u64) {
        let percent = self.execution_time_nanos as f64 / total_nanos as f64 * 100.0;
        let millis = self.execution_time_nanos as f64 / 1_000_000.0;
        let _ = write!(
            out,
            "{:indent$}{percent:.0}% {millis:.3} ms {}",
            "",
            self.signature,
            indent = depth * 2,
        );
        if self.call_count > 1 {
            let _ = write!(out, " (x{})", self.call_count);
        }
        out.push('\n');
        for child in &self.children {
            child.write_ascii(out, depth + 1, total_nanos);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree() -> CallTreeNode {
        let mut root = CallTreeNode::new("total", 1_000_000);
        let mut controller = CallTreeNode::new("Controller#index", 900_000);
        controller.add_child(CallTreeNode::new("Repository#find", 600_000));
        controller.add_child(CallTreeNode::new("View#render", 50_000));
        root.add_child(controller);
        root.add_child(CallTreeNode::new("Filter#audit", 20_000));
        root
    }

    #[test]
    fn pruning_removes_fast_subtrees() {
        let mut tree = sample_tree();
        tree.remove_calls_faster_than(100_000);

        assert_eq!(tree.children().len(), 1);
        let controller = &tree.children()[0];
        assert_eq!(controller.signature(), "Controller#index");
        assert_eq!(controller.children().len(), 1);
        assert_eq!(controller.children()[0].signature(), "Repository#find");
    }

    #[test]
    fn pruning_keeps_nodes_at_the_threshold() {
        let mut tree = CallTreeNode::new("total", 100);
        tree.add_child(CallTreeNode::new("at_threshold", 50));
        tree.remove_calls_faster_than(50);
        assert_eq!(tree.children().len(), 1);
    }

    #[test]
    fn folding_merges_repeated_leaf_calls() {
        let mut parent = CallTreeNode::new("loop", 0);
        parent.add_child(CallTreeNode::new("Dao#query", 100));
        parent.add_child(CallTreeNode::new("Dao#query", 150));
        parent.fold_last_child();

        assert_eq!(parent.children().len(), 1);
        assert_eq!(parent.children()[0].execution_time_nanos(), 250);
        assert_eq!(parent.children()[0].call_count(), 2);
    }

    #[test]
    fn folding_spares_calls_with_children() {
        let mut parent = CallTreeNode::new("loop", 0);
        let mut first = CallTreeNode::new("Service#call", 100);
        first.add_child(CallTreeNode::new("Dao#query", 50));
        parent.add_child(first);
        parent.add_child(CallTreeNode::new("Service#call", 100));
        parent.fold_last_child();
        assert_eq!(parent.children().len(), 2);
    }

    #[test]
    fn json_uses_camel_case_field_names() {
        let json = serde_json::to_string(&sample_tree()).expect("tree serializes");
        assert!(json.contains("\"executionTime\":1000000"));
        assert!(json.contains("\"callCount\":1"));
        assert!(json.contains("\"signature\":\"total\""));
        assert!(!json.contains("started_at"));
    }

    #[test]
    fn ascii_rendering_shows_signatures_and_percentages() {
        let mut tree = sample_tree();
        let mut repeated = CallTreeNode::new("Dao#query", 10_000);
        repeated.call_count = 3;
        tree.add_child(repeated);

        let ascii = tree.to_ascii();
        assert!(ascii.contains("total"));
        assert!(ascii.contains("Controller#index"));
        assert!(ascii.contains("90%"));
        assert!(ascii.contains("(x3)"));
    }
}
