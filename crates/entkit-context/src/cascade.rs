//! Cascade traversal.
//!
//! Operations propagate along relationships whose cascade set includes the
//! operation, depth first, visiting each reachable instance once. Only loaded
//! targets are followed; the walk never performs I/O. Removal cascades into
//! unresolved proxies are completed at flush, which loads those targets.

use crate::identity_map::IdentityKey;
use entkit_core::{CascadeOp, EntityObject, ObjectId};
use std::collections::HashSet;
use std::sync::Arc;

/// How an instance is recognised as already visited.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum VisitKey {
    Identity(IdentityKey),
    /// Key-less instances fall back to instance identity
    Object(ObjectId),
}

impl VisitKey {
    fn of(object: &Arc<dyn EntityObject>) -> Self {
        IdentityKey::of(object).map_or_else(|| VisitKey::Object(ObjectId::of(object)), VisitKey::Identity)
    }
}

/// Instances already reached during one cascaded operation.
#[derive(Debug, Default)]
pub struct Visited {
    seen: HashSet<VisitKey>,
}

impl Visited {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `object` visited; false if it already was.
    pub fn insert(&mut self, object: &Arc<dyn EntityObject>) -> bool {
        self.seen.insert(VisitKey::of(object))
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// `root` and every instance reachable from it along edges cascading `op`,
/// in depth-first preorder. Instances already in `visited` are skipped.
pub fn reachable(
    root: &Arc<dyn EntityObject>,
    op: CascadeOp,
    visited: &mut Visited,
) -> Vec<Arc<dyn EntityObject>> {
    let mut order = Vec::new();
    let mut stack = vec![Arc::clone(root)];
    while let Some(object) = stack.pop() {
        if !visited.insert(&object) {
            continue;
        }
        let descriptor = object.descriptor();
        let mut next = Vec::new();
        for view in object.relations() {
            let cascades = descriptor
                .relationship(view.name)
                .is_some_and(|r| r.cascade.includes(op));
            if cascades {
                next.extend(view.state.targets());
            }
        }
        // Reversed so targets are visited in declaration order.
        stack.extend(next.into_iter().rev());
        order.push(object);
    }
    tracing::trace!(op = ?op, reached = order.len(), "Cascade walk");
    order
}
