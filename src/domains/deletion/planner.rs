//! Pure planning logic: turns a root and its enumerated descendants into
//! the ordered sequence of entity ids a worker will soft-delete.

use std::collections::{HashMap, HashSet};

use uuid::Uuid;

use crate::domains::entity::types::Entity;

/// Post-order deletion plan: children before their parents, the root last,
/// siblings in ascending id order.
///
/// The child-first discipline keeps the tree consistent at every checkpoint:
/// a live parent never ends up above a half-deleted subtree it did not
/// expect. The sibling tie-break makes the sequence deterministic, so a
/// worker resuming after a crash replays the same order against whatever
/// remains live.
pub fn plan_cascade(root_id: Uuid, descendants: &[Entity]) -> Vec<Uuid> {
    let mut children: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
    for entity in descendants {
        if let Some(parent_id) = entity.parent_id {
            children.entry(parent_id).or_default().push(entity.id);
        }
    }
    for siblings in children.values_mut() {
        siblings.sort();
    }

    let mut plan = Vec::with_capacity(descendants.len() + 1);
    let mut visited = HashSet::new();
    post_order(root_id, &children, &mut plan, &mut visited);

    // A live descendant always has a live parent chain, so the walk from the
    // root covers the whole set; anything it somehow missed is still
    // deleted, deepest first, ahead of the root.
    if visited.len() < descendants.len() {
        let mut missed: Vec<&Entity> = descendants
            .iter()
            .filter(|e| !visited.contains(&e.id))
            .collect();
        missed.sort_by(|a, b| b.depth.cmp(&a.depth).then(a.id.cmp(&b.id)));
        let root = plan.pop();
        plan.extend(missed.iter().map(|e| e.id));
        plan.extend(root);
    }

    plan
}

/// The `cascade == false` shape: just the root.
pub fn plan_single(root_id: Uuid) -> Vec<Uuid> {
    vec![root_id]
}

fn post_order(
    node: Uuid,
    children: &HashMap<Uuid, Vec<Uuid>>,
    plan: &mut Vec<Uuid>,
    visited: &mut HashSet<Uuid>,
) {
    if let Some(child_ids) = children.get(&node) {
        for &child in child_ids {
            if visited.insert(child) {
                post_order(child, children, plan, visited);
            }
        }
    }
    plan.push(node);
}
