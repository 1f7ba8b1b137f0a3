//! Thread-local call tree recording.
//!
//! A recording is activated for the current thread when a span qualifies
//! for profiling; instrumented code then brackets interesting calls with
//! [`Profiler::enter`]/[`Profiler::exit`] (or the RAII
//! [`Profiler::enter_scoped`]). When no recording is active these calls
//! cost a thread-local lookup and nothing else, so instrumentation can
//! stay in place unconditionally.

mod call_tree;
mod listener;

pub use call_tree::CallTreeNode;
pub use listener::CallTreeSpanEventListenerFactory;

use std::cell::RefCell;

struct Recording {
    root: CallTreeNode,
    // Child-index path from the root to the currently open call.
    path: Vec<usize>,
}

thread_local! {
    static RECORDING: RefCell<Option<Recording>> = const { RefCell::new(None) };
}

/// The call tree recorder for the current thread.
pub struct Profiler;

impl Profiler {
    /// Start recording a call tree on this thread. Returns `false` without
    /// touching the active recording when one is already running, so a
    /// nested span cannot steal the tree of the span that owns it.
    pub fn activate(root_signature: &str) -> bool {
        RECORDING.with(|cell| {
            let mut recording = cell.borrow_mut();
            if recording.is_some() {
                return false;
            }
            *recording = Some(Recording {
                root: CallTreeNode::open(root_signature),
                path: Vec::new(),
            });
            true
        })
    }

    /// Whether a recording is active on this thread.
    pub fn is_active() -> bool {
        RECORDING.with(|cell| cell.borrow().is_some())
    }

    /// Record entering a call. A no-op when no recording is active.
    pub fn enter(signature: &str) {
        RECORDING.with(|cell| {
            let mut recording = cell.borrow_mut();
            let Some(recording) = recording.as_mut() else {
                return;
            };
            let Some(parent) = node_at(&mut recording.root, &recording.path) else {
                return;
            };
            let child_index = parent.open_child(signature);
            recording.path.push(child_index);
        });
    }

    /// Record leaving the current call. Tolerates being called without a
    /// matching [`enter`](Profiler::enter).
    pub fn exit() {
        RECORDING.with(|cell| {
            let mut recording = cell.borrow_mut();
            let Some(recording) = recording.as_mut() else {
                return;
            };
            if recording.path.is_empty() {
                return;
            }
            if let Some(node) = node_at(&mut recording.root, &recording.path) {
                node.close();
            }
            recording.path.pop();
            if let Some(parent) = node_at(&mut recording.root, &recording.path) {
                parent.fold_last_child();
            }
        });
    }

    /// Record entering a call and leave it again when the returned guard
    /// drops, including on unwind.
    #[must_use = "the call is recorded as left when the guard drops"]
    pub fn enter_scoped(signature: &str) -> ProfiledCall {
        Profiler::enter(signature);
        ProfiledCall { _priv: () }
    }

    /// Stop recording and return the finished tree, or `None` when no
    /// recording was active. Calls still open (because the stack unwound
    /// past their `exit`) are closed on the way out.
    pub fn deactivate() -> Option<CallTreeNode> {
        RECORDING.with(|cell| {
            let recording = cell.borrow_mut().take()?;
            let Recording { mut root, mut path } = recording;
            while !path.is_empty() {
                if let Some(node) = node_at(&mut root, &path) {
                    node.close();
                }
                path.pop();
            }
            root.close();
            Some(root)
        })
    }
}

/// Closes the profiled call on drop. Created by
/// [`Profiler::enter_scoped`].
pub struct ProfiledCall {
    _priv: (),
}

impl Drop for ProfiledCall {
    fn drop(&mut self) {
        Profiler::exit();
    }
}

fn node_at<'a>(root: &'a mut CallTreeNode, path: &[usize]) -> Option<&'a mut CallTreeNode> {
    let mut node = root;
    for &index in path {
        node = node.child_mut_checked(index)?;
    }
    Some(node)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_nested_calls() {
        Profiler::activate("total");
        Profiler::enter("Controller#index");
        Profiler::enter("Repository#find");
        Profiler::exit();
        Profiler::enter("View#render");
        Profiler::exit();
        Profiler::exit();

        let tree = Profiler::deactivate().expect("a recording was active");
        assert_eq!(tree.signature(), "total");
        assert_eq!(tree.children().len(), 1);
        let controller = &tree.children()[0];
        assert_eq!(controller.signature(), "Controller#index");
        let grandchildren: Vec<&str> = controller
            .children()
            .iter()
            .map(CallTreeNode::signature)
            .collect();
        assert_eq!(grandchildren, vec!["Repository#find", "View#render"]);
    }

    #[test]
    fn repeated_leaf_calls_are_folded() {
        Profiler::activate("total");
        for _ in 0..3 {
            Profiler::enter("Dao#query");
            Profiler::exit();
        }
        let tree = Profiler::deactivate().unwrap();
        assert_eq!(tree.children().len(), 1);
        assert_eq!(tree.children()[0].call_count(), 3);
    }

    #[test]
    fn deactivate_is_idempotent() {
        assert!(Profiler::activate("total"));
        assert!(Profiler::deactivate().is_some());
        assert!(Profiler::deactivate().is_none());
        assert!(!Profiler::is_active());
    }

    #[test]
    fn activation_refuses_while_a_recording_is_running() {
        assert!(Profiler::activate("total"));
        Profiler::enter("Controller#index");
        assert!(!Profiler::activate("usurper"));
        Profiler::exit();

        // The original recording is untouched by the refused activation.
        let tree = Profiler::deactivate().expect("the first recording is still active");
        assert_eq!(tree.signature(), "total");
        assert_eq!(tree.children()[0].signature(), "Controller#index");
        assert!(Profiler::deactivate().is_none());
    }

    #[test]
    fn unbalanced_exit_is_tolerated() {
        Profiler::activate("total");
        Profiler::exit();
        Profiler::exit();
        assert!(Profiler::deactivate().is_some());
    }

    #[test]
    fn enter_and_exit_without_a_recording_are_noops() {
        assert!(!Profiler::is_active());
        Profiler::enter("ignored");
        Profiler::exit();
        assert!(Profiler::deactivate().is_none());
    }

    #[test]
    fn deactivate_closes_calls_left_open_by_an_unwind() {
        Profiler::activate("total");
        let result = std::panic::catch_unwind(|| {
            let _call = Profiler::enter_scoped("outer");
            Profiler::enter("inner");
            panic!("request failed");
        });
        assert!(result.is_err());

        // The scoped guard popped one frame during the unwind; anything
        // still open is closed by deactivation.
        let tree = Profiler::deactivate().expect("recording survives the panic");
        assert_eq!(tree.children().len(), 1);
        assert_eq!(tree.children()[0].signature(), "outer");
        assert_eq!(tree.children()[0].children()[0].signature(), "inner");
    }
}
