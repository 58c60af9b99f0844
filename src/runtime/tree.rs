use super::PhysicalId;

/// This node's position in a binary fan-out tree laid over a group's physical
/// members, in the order they entered the group. Position `i` has parent
/// `(i - 1) / 2` and children `2i + 1`, `2i + 2`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommunicationTree {
    pub root: PhysicalId,
    pub parent: Option<PhysicalId>,
    pub children: Vec<PhysicalId>,
}

impl CommunicationTree {
    /// Builds the tree as seen from `me`, or `None` if `me` is not in `order`.
    pub fn new(order: &[PhysicalId], me: PhysicalId) -> Option<Self> {
        let position = order.iter().position(|&id| id == me)?;
        Some(Self {
            root: order[0],
            parent: parent_of(position).map(|p| order[p]),
            children: children_of(position, order.len())
                .map(|c| order[c])
                .collect(),
        })
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

pub fn parent_of(position: usize) -> Option<usize> {
    position.checked_sub(1).map(|p| p / 2)
}

/// Children positions of `position` in a tree of `size` nodes.
pub fn children_of(position: usize, size: usize) -> impl Iterator<Item = usize> {
    [2 * position + 1, 2 * position + 2]
        .into_iter()
        .filter(move |&c| c < size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn every_position_reaches_the_root_once() {
        for size in 1..64usize {
            let mut reached = HashSet::new();
            for start in 0..size {
                let mut seen = HashSet::new();
                let mut at = start;
                while let Some(parent) = parent_of(at) {
                    assert!(seen.insert(at), "cycle at {} in tree of {}", at, size);
                    assert!(parent < at);
                    at = parent;
                }
                assert_eq!(at, 0);
                reached.insert(start);
            }
            assert_eq!(reached.len(), size);
        }
    }

    #[test]
    fn children_are_the_two_next_slots_in_range() {
        for size in 1..32usize {
            let mut child_count = 0;
            for i in 0..size {
                let children: Vec<_> = children_of(i, size).collect();
                let expected: Vec<_> = [2 * i + 1, 2 * i + 2]
                    .into_iter()
                    .filter(|&c| c < size)
                    .collect();
                assert_eq!(children, expected);
                for child in children {
                    assert_eq!(parent_of(child), Some(i));
                }
                child_count += expected.len();
            }
            // a tree has exactly size - 1 edges
            assert_eq!(child_count, size - 1);
        }
    }

    #[test]
    fn maps_positions_through_the_join_order() {
        let order = [3, 0, 5, 1];
        let root = CommunicationTree::new(&order, 3).unwrap();
        assert!(root.is_root());
        assert_eq!(root.children, vec![0, 5]);

        let inner = CommunicationTree::new(&order, 0).unwrap();
        assert_eq!(inner.root, 3);
        assert_eq!(inner.parent, Some(3));
        assert_eq!(inner.children, vec![1]);

        let leaf = CommunicationTree::new(&order, 1).unwrap();
        assert_eq!(leaf.parent, Some(0));
        assert!(leaf.children.is_empty());

        assert!(CommunicationTree::new(&order, 9).is_none());
    }
}
