//! Label tree keyed by domain name, supporting closest-enclosing lookups.

use hickory_proto::rr::Name;
use std::collections::HashMap;

struct Node<V> {
    value: Option<V>,
    children: HashMap<Vec<u8>, Node<V>>,
}

impl<V> Node<V> {
    fn new() -> Self {
        Self {
            value: None,
            children: HashMap::new(),
        }
    }

    fn count(&self) -> (usize, usize) {
        let mut nodes = 0;
        let mut empty_leaves = 0;
        for child in self.children.values() {
            let (n, e) = child.count();
            nodes += n + 1;
            empty_leaves += e;
            if child.value.is_none() && child.children.is_empty() {
                empty_leaves += 1;
            }
        }
        (nodes, empty_leaves)
    }

    /// Drops empty leaves bottom-up. Returns true if this node became one.
    fn prune(&mut self) -> bool {
        self.children.retain(|_, child| !child.prune());
        self.value.is_none() && self.children.is_empty()
    }
}

/// Labels of a name from the root down, lowercased.
fn labels(name: &Name) -> Vec<Vec<u8>> {
    let mut labels: Vec<Vec<u8>> = name.iter().map(|l| l.to_ascii_lowercase()).collect();
    labels.reverse();
    labels
}

/// A map from domain names to values, organized by label.
///
/// Removing a value leaves its node in place; call
/// [`NameTree::prune_empty_leaves`] to reclaim them.
pub struct NameTree<V> {
    root: Node<V>,
    len: usize,
}

impl<V> NameTree<V> {
    /// Creates an empty tree.
    pub fn new() -> Self {
        Self {
            root: Node::new(),
            len: 0,
        }
    }

    /// Number of stored values.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if no value is stored.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Stores a value under `name`, returning the previous one.
    pub fn insert(&mut self, name: &Name, value: V) -> Option<V> {
        let mut node = &mut self.root;
        for label in labels(name) {
            node = node.children.entry(label).or_insert_with(Node::new);
        }
        let old = node.value.replace(value);
        if old.is_none() {
            self.len += 1;
        }
        old
    }

    /// Exact lookup.
    pub fn get(&self, name: &Name) -> Option<&V> {
        let mut node = &self.root;
        for label in labels(name) {
            node = node.children.get(&label)?;
        }
        node.value.as_ref()
    }

    /// Removes the value stored under `name`.
    pub fn remove(&mut self, name: &Name) -> Option<V> {
        let mut node = &mut self.root;
        for label in labels(name) {
            node = node.children.get_mut(&label)?;
        }
        let old = node.value.take();
        if old.is_some() {
            self.len -= 1;
        }
        old
    }

    /// Finds the value of the deepest stored name that encloses `name`
    /// (`name` itself included).
    pub fn find_closest(&self, name: &Name) -> Option<&V> {
        let mut node = &self.root;
        let mut closest = node.value.as_ref();
        for label in labels(name) {
            match node.children.get(&label) {
                Some(child) => {
                    node = child;
                    if node.value.is_some() {
                        closest = node.value.as_ref();
                    }
                }
                None => break,
            }
        }
        closest
    }

    /// Values of every stored name enclosing `name`, deepest first. The flag
    /// is true for the value stored under `name` itself.
    pub fn find_enclosing(&self, name: &Name) -> Vec<(&V, bool)> {
        let labels = labels(name);
        let mut node = &self.root;
        let mut found: Vec<(&V, bool)> = node
            .value
            .iter()
            .map(|v| (v, labels.is_empty()))
            .collect();
        for (depth, label) in labels.iter().enumerate() {
            let Some(child) = node.children.get(label) else {
                break;
            };
            node = child;
            if let Some(value) = node.value.as_ref() {
                found.push((value, depth + 1 == labels.len()));
            }
        }
        found.reverse();
        found
    }

    /// Number of nodes below the root.
    pub fn node_count(&self) -> usize {
        self.root.count().0
    }

    /// Percentage of nodes that are leaves without a value.
    pub fn empty_leaf_ratio(&self) -> usize {
        let (nodes, empty_leaves) = self.root.count();
        if nodes == 0 {
            0
        } else {
            empty_leaves * 100 / nodes
        }
    }

    /// Removes every leaf that holds no value, repeatedly.
    pub fn prune_empty_leaves(&mut self) {
        self.root.prune();
    }

    /// Removes every value and node.
    pub fn clear(&mut self) {
        self.root = Node::new();
        self.len = 0;
    }
}

impl<V> Default for NameTree<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn name(s: &str) -> Name {
        Name::from_str(s).unwrap()
    }

    #[test]
    fn test_find_closest() {
        let mut tree = NameTree::new();
        tree.insert(&name("com."), "com");
        tree.insert(&name("example.com."), "example");

        assert_eq!(tree.find_closest(&name("www.example.com.")), Some(&"example"));
        assert_eq!(tree.find_closest(&name("EXAMPLE.com.")), Some(&"example"));
        assert_eq!(tree.find_closest(&name("other.com.")), Some(&"com"));
        assert_eq!(tree.find_closest(&name("org.")), None);

        tree.insert(&Name::root(), "root");
        assert_eq!(tree.find_closest(&name("org.")), Some(&"root"));
        assert_eq!(tree.len(), 3);
    }

    #[test]
    fn test_find_enclosing() {
        let mut tree = NameTree::new();
        tree.insert(&name("example."), "example");
        tree.insert(&name("www.example."), "www");

        assert_eq!(
            tree.find_enclosing(&name("www.example.")),
            vec![(&"www", true), (&"example", false)]
        );
        assert_eq!(
            tree.find_enclosing(&name("a.www.example.")),
            vec![(&"www", false), (&"example", false)]
        );
        assert_eq!(tree.find_enclosing(&name("mail.example.")), vec![(&"example", false)]);
        assert!(tree.find_enclosing(&name("org.")).is_empty());
    }

    #[test]
    fn test_remove_and_prune() {
        let mut tree = NameTree::new();
        tree.insert(&name("a.b.c.example."), 1);
        tree.insert(&name("example."), 2);
        assert_eq!(tree.node_count(), 4);

        assert_eq!(tree.remove(&name("a.b.c.example.")), Some(1));
        assert_eq!(tree.remove(&name("a.b.c.example.")), None);
        assert_eq!(tree.remove(&name("nothing.")), None);
        assert_eq!(tree.len(), 1);
        // a.b.c.example is an empty leaf; b.c and c are interior nodes.
        assert_eq!(tree.empty_leaf_ratio(), 25);

        tree.prune_empty_leaves();
        assert_eq!(tree.node_count(), 1);
        assert_eq!(tree.empty_leaf_ratio(), 0);
        assert_eq!(tree.get(&name("example.")), Some(&2));
    }
}
