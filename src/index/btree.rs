use serde::{Serialize, Deserialize};
use std::cmp::Ordering;
use crate::core::error::{Error, Result};
use crate::core::types::{RowId, Value};
use crate::index::comparator::Comparator;
use crate::index::key::Key;
use crate::index::key_range::KeyRange;
use crate::index::runtime::{IndexStats, RuntimeIndex};
use crate::schema::schema::Order;

pub const DEFAULT_MAX_NODE_SIZE: usize = 512;
const MIN_FANOUT: usize = 4;

type NodeId = usize;

#[derive(Debug, Clone)]
enum Slots {
    /// One sorted row-id list per key. Unique trees hold exactly one id per key.
    Leaf(Vec<Vec<RowId>>),
    Internal(Vec<NodeId>),
}

/// Arena node. Internal nodes hold `children.len() - 1` keys and `keys[i]`
/// is the leftmost key stored under `children[i + 1]`.
#[derive(Debug, Clone)]
struct Node {
    keys: Vec<Key>,
    slots: Slots,
    prev: Option<NodeId>,
    next: Option<NodeId>,
}

impl Node {
    fn leaf() -> Node {
        Node {
            keys: Vec::new(),
            slots: Slots::Leaf(Vec::new()),
            prev: None,
            next: None,
        }
    }

    fn internal(keys: Vec<Key>, children: Vec<NodeId>) -> Node {
        Node {
            keys,
            slots: Slots::Internal(children),
            prev: None,
            next: None,
        }
    }

    fn is_leaf(&self) -> bool {
        matches!(self.slots, Slots::Leaf(_))
    }

    /// Keys for a leaf, children for an internal node.
    fn size(&self) -> usize {
        match &self.slots {
            Slots::Leaf(_) => self.keys.len(),
            Slots::Internal(children) => children.len(),
        }
    }

    fn children(&self) -> &[NodeId] {
        match &self.slots {
            Slots::Internal(children) => children,
            Slots::Leaf(_) => &[],
        }
    }
}

#[derive(Serialize, Deserialize)]
struct SerializedTree {
    comparator: Comparator,
    unique: bool,
    max_node_size: usize,
    entries: Vec<(Key, Vec<RowId>)>,
}

/// B+ tree over an arena of nodes, with linked leaves for range scans.
///
/// Nodes split once they reach `max_node_size` and steal from or merge with
/// a sibling once they drop below half of it. Writes keep the descent path
/// instead of parent pointers.
#[derive(Debug, Clone)]
pub struct BTree {
    name: String,
    comparator: Comparator,
    unique: bool,
    nodes: Vec<Node>,
    free: Vec<NodeId>,
    root: NodeId,
    max: usize,
    min: usize,
    total_rows: usize,
}

impl BTree {
    pub fn new(name: &str, comparator: Comparator, unique: bool) -> Self {
        BTree::with_fanout(name, comparator, unique, DEFAULT_MAX_NODE_SIZE)
    }

    pub fn with_fanout(name: &str, comparator: Comparator, unique: bool, max_node_size: usize) -> Self {
        let max = max_node_size.max(MIN_FANOUT);
        BTree {
            name: name.to_string(),
            comparator,
            unique,
            nodes: vec![Node::leaf()],
            free: Vec::new(),
            root: 0,
            max,
            min: max / 2,
            total_rows: 0,
        }
    }

    /// Number of distinct keys.
    pub fn key_count(&self) -> usize {
        let mut count = 0;
        let mut leaf = Some(self.leftmost_leaf());
        while let Some(id) = leaf {
            count += self.nodes[id].keys.len();
            leaf = self.nodes[id].next;
        }
        count
    }

    pub fn is_empty(&self) -> bool {
        self.total_rows == 0
    }

    pub fn height(&self) -> usize {
        let mut height = 1;
        let mut node = self.root;
        while let Some(&child) = self.nodes[node].children().first() {
            node = child;
            height += 1;
        }
        height
    }

    fn alloc(&mut self, node: Node) -> NodeId {
        match self.free.pop() {
            Some(id) => {
                self.nodes[id] = node;
                id
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        }
    }

    fn release(&mut self, id: NodeId) -> Node {
        self.free.push(id);
        std::mem::replace(&mut self.nodes[id], Node::leaf())
    }

    fn search(&self, id: NodeId, key: &Key) -> std::result::Result<usize, usize> {
        self.nodes[id].keys.binary_search_by(|k| self.comparator.compare(k, key))
    }

    /// Walks to the leaf that would hold `key`, recording `(node, child index)` per level.
    fn descend(&self, key: &Key) -> (NodeId, Vec<(NodeId, usize)>) {
        let mut path = Vec::new();
        let mut id = self.root;
        loop {
            let node = &self.nodes[id];
            match &node.slots {
                Slots::Leaf(_) => return (id, path),
                Slots::Internal(children) => {
                    let idx = node
                        .keys
                        .partition_point(|k| self.comparator.compare(k, key) != Ordering::Greater);
                    path.push((id, idx));
                    id = children[idx];
                }
            }
        }
    }

    fn leftmost_leaf(&self) -> NodeId {
        let mut id = self.root;
        while let Some(&child) = self.nodes[id].children().first() {
            id = child;
        }
        id
    }

    fn rightmost_leaf(&self) -> NodeId {
        let mut id = self.root;
        while let Some(&child) = self.nodes[id].children().last() {
            id = child;
        }
        id
    }

    fn leaf_values(&self, id: NodeId) -> &[Vec<RowId>] {
        match &self.nodes[id].slots {
            Slots::Leaf(values) => values,
            Slots::Internal(_) => &[],
        }
    }

    fn leaf_values_mut(&mut self, id: NodeId) -> Result<&mut Vec<Vec<RowId>>> {
        match &mut self.nodes[id].slots {
            Slots::Leaf(values) => Ok(values),
            Slots::Internal(_) => Err(Error::internal(format!("index {}: node {} is not a leaf", self.name, id))),
        }
    }

    fn children_mut(&mut self, id: NodeId) -> Result<&mut Vec<NodeId>> {
        match &mut self.nodes[id].slots {
            Slots::Internal(children) => Ok(children),
            Slots::Leaf(_) => Err(Error::internal(format!("index {}: node {} is not internal", self.name, id))),
        }
    }

    /// Re-points the separator above `path` at the leaf's current leftmost key.
    fn refresh_separator(&mut self, path: &[(NodeId, usize)], leaf: NodeId) {
        let Some(key) = self.nodes[leaf].keys.first().cloned() else {
            return;
        };
        for &(parent, idx) in path.iter().rev() {
            if idx > 0 {
                self.nodes[parent].keys[idx - 1] = key;
                return;
            }
        }
    }

    fn insert(&mut self, key: Key, value: RowId, replace: bool) -> Result<()> {
        if !self.comparator.accepts(&key) {
            return Err(Error::invalid_argument(format!(
                "index {}: key {} does not match comparator {:?}",
                self.name, key, self.comparator
            )));
        }
        let (leaf, path) = self.descend(&key);
        match self.search(leaf, &key) {
            Ok(pos) => {
                let unique = self.unique;
                let values = &mut self.leaf_values_mut(leaf)?[pos];
                if replace {
                    let removed = values.len();
                    *values = vec![value];
                    self.total_rows = self.total_rows + 1 - removed;
                    return Ok(());
                }
                if unique {
                    return Err(Error::duplicate_key(&self.name, &key));
                }
                if let Err(i) = values.binary_search(&value) {
                    values.insert(i, value);
                    self.total_rows += 1;
                }
                Ok(())
            }
            Err(pos) => {
                self.nodes[leaf].keys.insert(pos, key);
                self.leaf_values_mut(leaf)?.insert(pos, vec![value]);
                self.total_rows += 1;
                if pos == 0 {
                    self.refresh_separator(&path, leaf);
                }
                self.split(leaf, path)
            }
        }
    }

    fn split(&mut self, mut id: NodeId, mut path: Vec<(NodeId, usize)>) -> Result<()> {
        while self.nodes[id].size() >= self.max {
            let node = &mut self.nodes[id];
            let (right, separator) = match &mut node.slots {
                Slots::Leaf(values) => {
                    let mid = node.keys.len() / 2;
                    let right_keys = node.keys.split_off(mid);
                    let right_values = values.split_off(mid);
                    let separator = right_keys[0].clone();
                    let right = Node {
                        keys: right_keys,
                        slots: Slots::Leaf(right_values),
                        prev: Some(id),
                        next: node.next,
                    };
                    (right, separator)
                }
                Slots::Internal(children) => {
                    let mid = children.len() / 2;
                    let right_children = children.split_off(mid);
                    let mut right_keys = node.keys.split_off(mid - 1);
                    let separator = right_keys.remove(0);
                    (Node::internal(right_keys, right_children), separator)
                }
            };

            let is_leaf = right.is_leaf();
            let old_next = right.next;
            let right_id = self.alloc(right);
            if is_leaf {
                self.nodes[id].next = Some(right_id);
                if let Some(n) = old_next {
                    self.nodes[n].prev = Some(right_id);
                }
            }

            match path.pop() {
                Some((parent, idx)) => {
                    self.nodes[parent].keys.insert(idx, separator);
                    self.children_mut(parent)?.insert(idx + 1, right_id);
                    id = parent;
                }
                None => {
                    self.root = self.alloc(Node::internal(vec![separator], vec![id, right_id]));
                    break;
                }
            }
        }
        Ok(())
    }

    fn rebalance(&mut self, mut id: NodeId, mut path: Vec<(NodeId, usize)>) -> Result<()> {
        loop {
            if id == self.root {
                let only_child = match &self.nodes[id].slots {
                    Slots::Internal(children) if children.len() == 1 => Some(children[0]),
                    _ => None,
                };
                if let Some(child) = only_child {
                    self.release(id);
                    self.root = child;
                }
                return Ok(());
            }
            if self.nodes[id].size() >= self.min {
                return Ok(());
            }
            let Some((parent, idx)) = path.pop() else {
                return Ok(());
            };

            let siblings = self.nodes[parent].children();
            let left = if idx > 0 { Some(siblings[idx - 1]) } else { None };
            let right = siblings.get(idx + 1).copied();

            if let Some(r) = right.filter(|r| self.nodes[*r].size() > self.min) {
                return self.steal_from_right(id, r, parent, idx);
            }
            if let Some(l) = left.filter(|l| self.nodes[*l].size() > self.min) {
                return self.steal_from_left(id, l, parent, idx);
            }
            match (left, right) {
                (Some(l), _) => self.merge(l, id, parent, idx - 1)?,
                (None, Some(r)) => self.merge(id, r, parent, idx)?,
                (None, None) => return Ok(()),
            }
            id = parent;
        }
    }

    fn steal_from_right(&mut self, id: NodeId, right: NodeId, parent: NodeId, idx: usize) -> Result<()> {
        if self.nodes[id].is_leaf() {
            let key = self.nodes[right].keys.remove(0);
            let values = self.leaf_values_mut(right)?.remove(0);
            self.nodes[id].keys.push(key);
            self.leaf_values_mut(id)?.push(values);
            self.nodes[parent].keys[idx] = self.nodes[right].keys[0].clone();
        } else {
            let child = self.children_mut(right)?.remove(0);
            let right_key = self.nodes[right].keys.remove(0);
            let separator = std::mem::replace(&mut self.nodes[parent].keys[idx], right_key);
            self.nodes[id].keys.push(separator);
            self.children_mut(id)?.push(child);
        }
        Ok(())
    }

    fn steal_from_left(&mut self, id: NodeId, left: NodeId, parent: NodeId, idx: usize) -> Result<()> {
        if self.nodes[id].is_leaf() {
            let key = self.nodes[left].keys.pop();
            let values = self.leaf_values_mut(left)?.pop();
            let (Some(key), Some(values)) = (key, values) else {
                return Err(Error::internal(format!("index {}: empty sibling {}", self.name, left)));
            };
            self.nodes[parent].keys[idx - 1] = key.clone();
            self.nodes[id].keys.insert(0, key);
            self.leaf_values_mut(id)?.insert(0, values);
        } else {
            let child = self.children_mut(left)?.pop();
            let left_key = self.nodes[left].keys.pop();
            let (Some(child), Some(left_key)) = (child, left_key) else {
                return Err(Error::internal(format!("index {}: empty sibling {}", self.name, left)));
            };
            let separator = std::mem::replace(&mut self.nodes[parent].keys[idx - 1], left_key);
            self.nodes[id].keys.insert(0, separator);
            self.children_mut(id)?.insert(0, child);
        }
        Ok(())
    }

    /// Absorbs `right` into `left`; `sep_idx` is the parent key between them.
    fn merge(&mut self, left: NodeId, right: NodeId, parent: NodeId, sep_idx: usize) -> Result<()> {
        let separator = self.nodes[parent].keys.remove(sep_idx);
        self.children_mut(parent)?.remove(sep_idx + 1);
        let absorbed = self.release(right);

        match absorbed.slots {
            Slots::Leaf(values) => {
                self.nodes[left].keys.extend(absorbed.keys);
                self.leaf_values_mut(left)?.extend(values);
                self.nodes[left].next = absorbed.next;
                if let Some(n) = absorbed.next {
                    self.nodes[n].prev = Some(left);
                }
            }
            Slots::Internal(children) => {
                let node = &mut self.nodes[left];
                node.keys.push(separator);
                node.keys.extend(absorbed.keys);
                self.children_mut(left)?.extend(children);
            }
        }
        Ok(())
    }

    fn delete(&mut self, key: &Key, value: Option<RowId>) -> Result<()> {
        let (leaf, path) = self.descend(key);
        let Ok(pos) = self.search(leaf, key) else {
            return Ok(());
        };

        let values = &mut self.leaf_values_mut(leaf)?[pos];
        let removed = match value {
            Some(v) => {
                let Ok(i) = values.binary_search(&v) else {
                    return Ok(());
                };
                values.remove(i);
                1
            }
            None => std::mem::take(values).len(),
        };
        let now_empty = values.is_empty();
        self.total_rows -= removed;
        if !now_empty {
            return Ok(());
        }

        self.nodes[leaf].keys.remove(pos);
        self.leaf_values_mut(leaf)?.remove(pos);
        if pos == 0 {
            self.refresh_separator(&path, leaf);
        }
        self.rebalance(leaf, path)
    }

    /// Position of the first key whose first dimension is not before `start`.
    fn seek_first(&self, start: &Value) -> (NodeId, usize) {
        let mut id = self.root;
        loop {
            let node = &self.nodes[id];
            let idx = node
                .keys
                .partition_point(|k| self.comparator.compare_first(k, start) == Ordering::Less);
            match &node.slots {
                Slots::Leaf(_) => return (id, idx),
                Slots::Internal(children) => id = children[idx],
            }
        }
    }

    /// Collects `(key, row ids)` covered by one range, in tree order, stopping
    /// once `cap` row ids have been gathered or the first dimension is exhausted.
    /// Visits every key covered by `range` in index order until `visit`
    /// returns false.
    fn walk_range<'a>(&'a self, range: &KeyRange, mut visit: impl FnMut(&'a Key, &'a [RowId]) -> bool) {
        let (mut leaf, mut pos) = match self.comparator.range_start(range) {
            None => (self.leftmost_leaf(), 0),
            Some(start) => self.seek_first(start),
        };
        loop {
            let node = &self.nodes[leaf];
            let values = self.leaf_values(leaf);
            while pos < node.keys.len() {
                let key = &node.keys[pos];
                if self.comparator.past_end(key, range) {
                    return;
                }
                if self.comparator.is_in_range(key, range) && !visit(key, values[pos].as_slice()) {
                    return;
                }
                pos += 1;
            }
            match node.next {
                Some(next) => {
                    leaf = next;
                    pos = 0;
                }
                None => return,
            }
        }
    }

    fn scan_range<'a>(&'a self, range: &KeyRange, cap: Option<usize>, out: &mut Vec<(&'a Key, &'a [RowId])>) {
        let mut gathered = 0;
        self.walk_range(range, |key, ids| {
            out.push((key, ids));
            gathered += ids.len();
            !cap.is_some_and(|c| gathered >= c)
        });
    }

    /// Row ids under `range`, counting no further than `cap`.
    fn count_range(&self, range: &KeyRange, cap: usize) -> usize {
        let mut counted = 0;
        self.walk_range(range, |_, ids| {
            counted += ids.len();
            counted < cap
        });
        counted
    }

    fn entries(&self) -> Vec<(Key, Vec<RowId>)> {
        let mut out = Vec::new();
        let mut leaf = Some(self.leftmost_leaf());
        while let Some(id) = leaf {
            let node = &self.nodes[id];
            out.extend(node.keys.iter().cloned().zip(self.leaf_values(id).iter().cloned()));
            leaf = node.next;
        }
        out
    }

    /// Rebuilds the tree bottom-up from entries sorted in tree order.
    fn bulk_load(&mut self, entries: Vec<(Key, Vec<RowId>)>) {
        self.nodes = vec![Node::leaf()];
        self.free.clear();
        self.root = 0;
        self.total_rows = entries.iter().map(|(_, v)| v.len()).sum();
        if entries.is_empty() {
            return;
        }

        let per_node = self.max - 1;
        let mut level: Vec<(NodeId, Key)> = Vec::new();
        let mut remaining = entries.into_iter();
        let mut prev: Option<NodeId> = None;
        for size in even_chunks(remaining.len(), per_node) {
            let (keys, values): (Vec<Key>, Vec<Vec<RowId>>) = remaining.by_ref().take(size).unzip();
            let leftmost = keys[0].clone();
            let node = Node {
                keys,
                slots: Slots::Leaf(values),
                prev,
                next: None,
            };
            let id = if level.is_empty() {
                self.nodes[0] = node;
                0
            } else {
                self.alloc(node)
            };
            if let Some(p) = prev {
                self.nodes[p].next = Some(id);
            }
            prev = Some(id);
            level.push((id, leftmost));
        }

        while level.len() > 1 {
            let mut upper = Vec::new();
            let mut items = level.into_iter();
            for size in even_chunks(items.len(), per_node) {
                let group: Vec<(NodeId, Key)> = items.by_ref().take(size).collect();
                let leftmost = group[0].1.clone();
                let keys = group.iter().skip(1).map(|(_, k)| k.clone()).collect();
                let children = group.into_iter().map(|(id, _)| id).collect();
                let id = self.alloc(Node::internal(keys, children));
                upper.push((id, leftmost));
            }
            level = upper;
        }
        self.root = level[0].0;
    }

    pub fn deserialize(name: &str, bytes: &[u8]) -> Result<BTree> {
        let data: SerializedTree = bincode::deserialize(bytes)?;
        let mut tree = BTree::with_fanout(name, data.comparator, data.unique, data.max_node_size);
        tree.bulk_load(data.entries);
        Ok(tree)
    }

    /// Structural self-check: sorted keys, separators equal to subtree
    /// leftmost keys, node occupancy, uniform leaf depth, and leaf links.
    pub fn check_invariants(&self) -> Result<()> {
        let mut leaf_depth = None;
        self.check_node(self.root, 0, &mut leaf_depth)?;

        let mut previous: Option<&Key> = None;
        let mut rows = 0;
        let mut last_leaf: Option<NodeId> = None;
        let mut leaf = Some(self.leftmost_leaf());
        while let Some(id) = leaf {
            let node = &self.nodes[id];
            if node.prev != last_leaf {
                return Err(Error::internal(format!("leaf {} has a stale prev link", id)));
            }
            for key in &node.keys {
                if let Some(p) = previous {
                    if self.comparator.compare(p, key) != Ordering::Less {
                        return Err(Error::internal(format!("leaf chain out of order at {}", key)));
                    }
                }
                previous = Some(key);
            }
            rows += self.leaf_values(id).iter().map(Vec::len).sum::<usize>();
            last_leaf = Some(id);
            leaf = node.next;
        }
        if last_leaf != Some(self.rightmost_leaf()) {
            return Err(Error::internal("leaf chain does not end at the rightmost leaf"));
        }
        if rows != self.total_rows {
            return Err(Error::internal(format!("row count {} != {}", rows, self.total_rows)));
        }
        Ok(())
    }

    fn check_node(&self, id: NodeId, depth: usize, leaf_depth: &mut Option<usize>) -> Result<Option<Key>> {
        let node = &self.nodes[id];
        if id != self.root && (node.size() < self.min || node.size() >= self.max) {
            return Err(Error::internal(format!("node {} holds {} entries", id, node.size())));
        }
        for pair in node.keys.windows(2) {
            if self.comparator.compare(&pair[0], &pair[1]) != Ordering::Less {
                return Err(Error::internal(format!("node {} keys out of order", id)));
            }
        }
        match &node.slots {
            Slots::Leaf(values) => {
                if values.len() != node.keys.len() || values.iter().any(Vec::is_empty) {
                    return Err(Error::internal(format!("leaf {} has mismatched values", id)));
                }
                match leaf_depth {
                    Some(d) if *d != depth => return Err(Error::internal("leaves at different depths")),
                    _ => *leaf_depth = Some(depth),
                }
                Ok(node.keys.first().cloned())
            }
            Slots::Internal(children) => {
                if node.keys.len() + 1 != children.len() {
                    return Err(Error::internal(format!("internal node {} key/child mismatch", id)));
                }
                let mut leftmost = None;
                for (i, &child) in children.iter().enumerate() {
                    let child_leftmost = self.check_node(child, depth + 1, leaf_depth)?;
                    if i == 0 {
                        leftmost = child_leftmost;
                    } else if child_leftmost.as_ref() != Some(&node.keys[i - 1]) {
                        return Err(Error::internal(format!("stale separator {} in node {}", i - 1, id)));
                    }
                }
                Ok(leftmost)
            }
        }
    }
}

/// Splits `total` items into the fewest chunks of at most `cap`, sized as evenly as possible.
fn even_chunks(total: usize, cap: usize) -> Vec<usize> {
    if total == 0 {
        return Vec::new();
    }
    let count = total.div_ceil(cap);
    let base = total / count;
    let extra = total % count;
    (0..count).map(|i| if i < extra { base + 1 } else { base }).collect()
}

impl RuntimeIndex for BTree {
    fn name(&self) -> &str {
        &self.name
    }

    fn add(&mut self, key: Key, value: RowId) -> Result<()> {
        self.insert(key, value, false)
    }

    fn set(&mut self, key: Key, value: RowId) -> Result<()> {
        self.insert(key, value, true)
    }

    fn remove(&mut self, key: &Key, value: Option<RowId>) -> Result<()> {
        self.delete(key, value)
    }

    fn get(&self, key: &Key) -> Vec<RowId> {
        let (leaf, _) = self.descend(key);
        match self.search(leaf, key) {
            Ok(pos) => self.leaf_values(leaf)[pos].clone(),
            Err(_) => Vec::new(),
        }
    }

    fn contains_key(&self, key: &Key) -> bool {
        let (leaf, _) = self.descend(key);
        self.search(leaf, key).is_ok()
    }

    fn min(&self) -> Option<(Key, Vec<RowId>)> {
        let leaf = match self.comparator.first_order() {
            Order::Asc => self.leftmost_leaf(),
            Order::Desc => self.rightmost_leaf(),
        };
        let pos = match self.comparator.first_order() {
            Order::Asc => 0,
            Order::Desc => self.nodes[leaf].keys.len().checked_sub(1)?,
        };
        Some((self.nodes[leaf].keys.get(pos)?.clone(), self.leaf_values(leaf)[pos].clone()))
    }

    fn max(&self) -> Option<(Key, Vec<RowId>)> {
        let leaf = match self.comparator.first_order() {
            Order::Asc => self.rightmost_leaf(),
            Order::Desc => self.leftmost_leaf(),
        };
        let pos = match self.comparator.first_order() {
            Order::Asc => self.nodes[leaf].keys.len().checked_sub(1)?,
            Order::Desc => 0,
        };
        Some((self.nodes[leaf].keys.get(pos)?.clone(), self.leaf_values(leaf)[pos].clone()))
    }

    fn get_range(
        &self,
        ranges: Option<&[KeyRange]>,
        reverse: bool,
        limit: Option<usize>,
        skip: Option<usize>,
    ) -> Vec<RowId> {
        if limit == Some(0) {
            return Vec::new();
        }
        let skip = skip.unwrap_or(0);
        // Forward scans can stop early; reverse scans need the tail.
        let cap = if reverse { None } else { limit.map(|l| l + skip) };

        let mut matched: Vec<(&Key, &[RowId])> = Vec::new();
        match ranges {
            None => {
                let mut leaf = Some(self.leftmost_leaf());
                let mut gathered = 0;
                'leaves: while let Some(id) = leaf {
                    for (key, values) in self.nodes[id].keys.iter().zip(self.leaf_values(id)) {
                        matched.push((key, values.as_slice()));
                        gathered += values.len();
                        if cap.is_some_and(|c| gathered >= c) {
                            break 'leaves;
                        }
                    }
                    leaf = self.nodes[id].next;
                }
            }
            Some(ranges) => {
                let mut sorted = ranges.to_vec();
                self.comparator.sort_ranges(&mut sorted);
                for range in &sorted {
                    self.scan_range(range, cap, &mut matched);
                }
                if sorted.len() > 1 {
                    matched.sort_by(|a, b| self.comparator.compare(a.0, b.0));
                    matched.dedup_by(|a, b| a.0 == b.0);
                }
            }
        }

        let mut ids: Vec<RowId> = matched.into_iter().flat_map(|(_, v)| v.iter().copied()).collect();
        if reverse {
            ids.reverse();
        }
        ids.into_iter().skip(skip).take(limit.unwrap_or(usize::MAX)).collect()
    }

    fn cost(&self, range: Option<&KeyRange>) -> usize {
        match range {
            None => self.total_rows,
            Some(range) => self.count_range(range, usize::MAX),
        }
    }

    fn cost_within(&self, range: Option<&KeyRange>, budget: usize) -> usize {
        match range {
            None => self.total_rows,
            Some(range) => self.count_range(range, budget),
        }
    }

    fn is_unique_key(&self) -> bool {
        self.unique
    }

    fn comparator(&self) -> &Comparator {
        &self.comparator
    }

    fn stats(&self) -> IndexStats {
        IndexStats {
            total_rows: self.total_rows,
        }
    }

    fn clear(&mut self) {
        self.nodes = vec![Node::leaf()];
        self.free.clear();
        self.root = 0;
        self.total_rows = 0;
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        let data = SerializedTree {
            comparator: self.comparator.clone(),
            unique: self.unique,
            max_node_size: self.max,
            entries: self.entries(),
        };
        Ok(bincode::serialize(&data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ErrorKind;
    use crate::index::key_range::SingleKeyRange;
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    fn int_key(v: i64) -> Key {
        Key::Single(Value::Integer(v))
    }

    fn small_tree(unique: bool) -> BTree {
        BTree::with_fanout("t.idx", Comparator::Simple(Order::Asc), unique, 4)
    }

    fn range(from: Option<i64>, to: Option<i64>, el: bool, eu: bool) -> KeyRange {
        vec![SingleKeyRange::new(from.map(Value::Integer), to.map(Value::Integer), el, eu)]
    }

    #[test]
    fn test_split_and_full_scan() {
        let mut tree = small_tree(true);
        for i in (0..100).rev() {
            tree.add(int_key(i), i).unwrap();
        }
        tree.check_invariants().unwrap();
        assert!(tree.height() > 2);
        assert_eq!(tree.get_range(None, false, None, None), (0..100).collect::<Vec<_>>());
        assert_eq!(tree.stats().total_rows, 100);
    }

    #[test]
    fn test_unique_rejects_duplicate() {
        let mut tree = small_tree(true);
        tree.add(int_key(1), 10).unwrap();
        let err = tree.add(int_key(1), 11).unwrap_err();
        assert_eq!(err.kind, ErrorKind::DuplicateKey);
        tree.set(int_key(1), 11).unwrap();
        assert_eq!(tree.get(&int_key(1)), vec![11]);
        assert_eq!(tree.stats().total_rows, 1);
    }

    #[test]
    fn test_non_unique_values_sorted() {
        let mut tree = small_tree(false);
        tree.add(int_key(5), 30).unwrap();
        tree.add(int_key(5), 10).unwrap();
        tree.add(int_key(5), 20).unwrap();
        assert_eq!(tree.get(&int_key(5)), vec![10, 20, 30]);
        tree.remove(&int_key(5), Some(20)).unwrap();
        assert_eq!(tree.get(&int_key(5)), vec![10, 30]);
        tree.remove(&int_key(5), None).unwrap();
        assert!(!tree.contains_key(&int_key(5)));
        assert!(tree.is_empty());
    }

    #[test]
    fn test_remove_rebalances() {
        let mut tree = small_tree(true);
        for i in 0..200 {
            tree.add(int_key(i), i).unwrap();
        }
        for i in (0..200).filter(|i| i % 3 != 0) {
            tree.remove(&int_key(i), None).unwrap();
            tree.check_invariants().unwrap();
        }
        let expected: Vec<RowId> = (0..200).filter(|i| i % 3 == 0).collect();
        assert_eq!(tree.get_range(None, false, None, None), expected);
        for i in expected {
            tree.remove(&int_key(i), Some(i)).unwrap();
        }
        tree.check_invariants().unwrap();
        assert_eq!(tree.height(), 1);
        assert!(tree.min().is_none());
    }

    #[test]
    fn test_range_bounds_reverse_limit_skip() {
        let mut tree = small_tree(true);
        for i in 0..50 {
            tree.add(int_key(i), i).unwrap();
        }
        let r = range(Some(10), Some(20), true, false);
        assert_eq!(tree.get_range(Some(&[r.clone()]), false, None, None), (11..=20).collect::<Vec<_>>());
        assert_eq!(tree.get_range(Some(&[r.clone()]), true, Some(3), Some(1)), vec![19, 18, 17]);
        assert_eq!(tree.get_range(Some(&[r.clone()]), false, Some(2), Some(2)), vec![13, 14]);
        assert_eq!(tree.cost(Some(&r)), 10);
        assert_eq!(tree.cost(None), 50);
    }

    #[test]
    fn test_cost_within_stops_at_budget() {
        let mut tree = small_tree(false);
        for i in 0..200 {
            tree.add(int_key(i % 40), i).unwrap();
        }
        // keys 5..=34, five ids each
        let r = range(Some(5), Some(34), false, false);
        assert_eq!(tree.cost(Some(&r)), 150);
        assert_eq!(tree.cost_within(Some(&r), 1000), 150);
        let capped = tree.cost_within(Some(&r), 12);
        assert!((12..=16).contains(&capped), "{}", capped);
        assert_eq!(tree.cost_within(None, 3), 200);
    }

    #[test]
    fn test_multiple_disjoint_ranges() {
        let mut tree = small_tree(true);
        for i in 0..40 {
            tree.add(int_key(i), i).unwrap();
        }
        let ranges = vec![range(Some(30), Some(32), false, false), range(None, Some(2), false, true)];
        assert_eq!(tree.get_range(Some(&ranges), false, None, None), vec![0, 1, 30, 31, 32]);
    }

    #[test]
    fn test_descending_index_range() {
        let mut tree = BTree::with_fanout("t.desc", Comparator::Simple(Order::Desc), true, 4);
        for i in 0..30 {
            tree.add(int_key(i), i).unwrap();
        }
        let r = range(Some(5), Some(9), false, true);
        assert_eq!(tree.get_range(Some(&[r]), false, None, None), vec![8, 7, 6, 5]);
        assert_eq!(tree.min().unwrap().0, int_key(0));
        assert_eq!(tree.max().unwrap().0, int_key(29));
    }

    #[test]
    fn test_multi_key_range_second_dimension() {
        let comparator = Comparator::Multi(vec![Order::Asc, Order::Asc]);
        let mut tree = BTree::with_fanout("t.multi", comparator, true, 4);
        let mut id = 0;
        for a in 0..6 {
            for b in 0..6 {
                tree.add(Key::Multi(vec![Value::Integer(a), Value::Integer(b)]), id).unwrap();
                id += 1;
            }
        }
        let r = vec![
            SingleKeyRange::new(Some(Value::Integer(2)), Some(Value::Integer(3)), false, false),
            SingleKeyRange::only(Value::Integer(4)),
        ];
        assert_eq!(tree.get_range(Some(&[r]), false, None, None), vec![16, 22]);

        // Interleaved multi-dimension ranges still come back in key order.
        let a = vec![SingleKeyRange::new(Some(Value::Integer(1)), Some(Value::Integer(4)), false, false), SingleKeyRange::only(Value::Integer(0))];
        let b = vec![SingleKeyRange::only(Value::Integer(2)), SingleKeyRange::only(Value::Integer(5))];
        assert_eq!(tree.get_range(Some(&[a, b]), false, None, None), vec![6, 12, 17, 18, 24]);
    }

    #[test]
    fn test_serialize_round_trip() {
        let mut tree = small_tree(false);
        for i in 0..77 {
            tree.add(int_key(i % 20), i).unwrap();
        }
        let bytes = tree.serialize().unwrap();
        let copy = BTree::deserialize("t.idx", &bytes).unwrap();
        copy.check_invariants().unwrap();
        assert_eq!(copy.get_range(None, false, None, None), tree.get_range(None, false, None, None));
        assert_eq!(copy.stats(), tree.stats());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Add(i64, RowId),
        Remove(i64, Option<RowId>),
    }

    fn arb_op() -> impl Strategy<Value = Op> {
        prop_oneof![
            3 => (0i64..60, 0i64..8).prop_map(|(k, v)| Op::Add(k, v)),
            2 => (0i64..60, proptest::option::of(0i64..8)).prop_map(|(k, v)| Op::Remove(k, v)),
        ]
    }

    proptest! {
        #[test]
        fn prop_tree_matches_model(ops in proptest::collection::vec(arb_op(), 1..400), fanout in 4usize..9) {
            let mut tree = BTree::with_fanout("t.p", Comparator::Simple(Order::Asc), false, fanout);
            let mut model: BTreeMap<i64, Vec<RowId>> = BTreeMap::new();
            for op in ops {
                match op {
                    Op::Add(k, v) => {
                        tree.add(int_key(k), v).unwrap();
                        let ids = model.entry(k).or_default();
                        if let Err(i) = ids.binary_search(&v) {
                            ids.insert(i, v);
                        }
                    }
                    Op::Remove(k, v) => {
                        tree.remove(&int_key(k), v).unwrap();
                        match v {
                            None => { model.remove(&k); }
                            Some(v) => {
                                if let Some(ids) = model.get_mut(&k) {
                                    ids.retain(|x| *x != v);
                                    if ids.is_empty() { model.remove(&k); }
                                }
                            }
                        }
                    }
                }
            }
            prop_assert!(tree.check_invariants().is_ok());
            let expected: Vec<RowId> = model.values().flatten().copied().collect();
            prop_assert_eq!(tree.get_range(None, false, None, None), expected);

            let restored = BTree::deserialize("t.p", &tree.serialize().unwrap()).unwrap();
            prop_assert!(restored.check_invariants().is_ok());
            prop_assert_eq!(restored.stats().total_rows, tree.stats().total_rows);
        }
    }
}
