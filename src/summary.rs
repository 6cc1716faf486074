// Copyright 2023 Matthew Ingwersen.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you
// may not use this file except in compliance with the License. You may
// obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or
// implied. See the License for the specific language governing
// permissions and limitations under the License.

//! The name summary tree.
//!
//! This tree answers "which policy zones have a trigger for this
//! name?" for query names and nameserver names. Each node corresponds
//! to a domain name and carries two pair sets: `pair` for triggers on
//! the exact name, and `wild` for triggers a zone declared with a
//! wildcard owner `*.<name>`. Keeping wildcard contributions on the
//! *parent* means a lookup needs nothing but the path from the root to
//! the query name: wildcards match strict descendants, so every proper
//! ancestor's `wild` applies, while only a full match contributes its
//! `pair`.
//!
//! The answer is a union over zones. Unlike the CIDR tree, no priority
//! narrowing happens here; the caller resolves priority among the
//! candidate zones, which it must do anyway to weigh qname triggers
//! against other trigger kinds.

use std::collections::HashMap;

use crate::name::{LabelBuf, Name};
use crate::zset::{PairSet, ZoneSet};

/// The payload of one name: exact-match and wildcard-child trigger
/// sets.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct NameData {
    pub pair: PairSet,
    pub wild: PairSet,
}

impl NameData {
    pub fn is_empty(&self) -> bool {
        self.pair.is_empty() && self.wild.is_empty()
    }

    pub fn union(self, other: Self) -> Self {
        Self {
            pair: self.pair.union(other.pair),
            wild: self.wild.union(other.wild),
        }
    }

    pub fn intersect(self, other: Self) -> Self {
        Self {
            pair: self.pair.intersect(other.pair),
            wild: self.wild.intersect(other.wild),
        }
    }

    pub fn difference(self, other: Self) -> Self {
        Self {
            pair: self.pair.difference(other.pair),
            wild: self.wild.difference(other.wild),
        }
    }

    /// Restricts all four bit fields to `zones`.
    pub fn masked(self, zones: ZoneSet) -> Self {
        Self {
            pair: self.pair.masked(zones),
            wild: self.wild.masked(zones),
        }
    }
}

/// A node in the name tree. The path of labels from the root spells
/// the node's name, last label first.
#[derive(Debug, Default)]
struct Node {
    children: HashMap<LabelBuf, Node>,
    data: NameData,
}

/// The name summary tree.
#[derive(Debug, Default)]
pub struct NameTree {
    root: Node,
}

impl NameTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `data` at `name`, which must already have any wildcard
    /// label stripped (wildcard triggers are recorded in the parent's
    /// `wild` field). Fails if any requested bit is already present.
    pub fn add(&mut self, name: &Name, data: &NameData) -> Result<(), ExistsError> {
        let node = Self::descend_or_create(&mut self.root, name, name.len() - 1);
        if !node.data.intersect(*data).is_empty() {
            return Err(ExistsError);
        }
        node.data = node.data.union(*data);
        Ok(())
    }

    /// Clears the bits of `data` at `name`, pruning nodes that become
    /// empty. Returns whether any bit was actually cleared; clearing
    /// bits that were never set is not an error.
    pub fn remove(&mut self, name: &Name, data: &NameData) -> bool {
        Self::remove_at(&mut self.root, name, name.len() - 1, data)
    }

    /// Returns the candidate zones for `name`: the `pair` of the
    /// exactly matching node (if any) and the union of the `wild` sets
    /// of every proper ancestor on the path to it.
    pub fn find(&self, name: &Name) -> NameData {
        let mut wild = PairSet::EMPTY;
        let mut node = &self.root;
        let mut level = name.len() - 1;
        loop {
            if level == 0 {
                return NameData {
                    pair: node.data.pair,
                    wild,
                };
            }
            wild = wild.union(node.data.wild);
            match node.children.get(&name[level - 1]) {
                Some(child) => {
                    node = child;
                    level -= 1;
                }
                None => {
                    return NameData {
                        pair: PairSet::EMPTY,
                        wild,
                    }
                }
            }
        }
    }

    /// Visits every name with a nonzero payload. Used to rebuild
    /// trigger counts and to carry entries over to a freshly loaded
    /// index.
    pub fn for_each<F: FnMut(&Name, &NameData)>(&self, mut f: F) {
        let mut path = Vec::new();
        Self::visit(&self.root, &mut path, &mut f);
    }

    fn visit<F: FnMut(&Name, &NameData)>(node: &Node, path: &mut Vec<LabelBuf>, f: &mut F) {
        if !node.data.is_empty() {
            // The path holds the node's labels in reverse; labels that
            // came out of valid names always reassemble.
            let name = Name::from_labels(path.iter().rev().map(|l| &**l)).unwrap();
            f(&name, &node.data);
        }
        for (label, child) in &node.children {
            path.push(label.clone());
            Self::visit(child, path, f);
            path.pop();
        }
    }

    /// Gets or creates the node for `name`. `level` is the number of
    /// labels still to descend; `node` corresponds to `name[level]`.
    fn descend_or_create<'a>(node: &'a mut Node, name: &Name, level: usize) -> &'a mut Node {
        if level == 0 {
            node
        } else {
            let child = node.children.entry(name[level - 1].to_owned()).or_default();
            Self::descend_or_create(child, name, level - 1)
        }
    }

    fn remove_at(node: &mut Node, name: &Name, level: usize, data: &NameData) -> bool {
        if level == 0 {
            let cleared = node.data.intersect(*data);
            node.data = node.data.difference(cleared);
            return !cleared.is_empty();
        }
        let label = &name[level - 1];
        let Some(child) = node.children.get_mut(label) else {
            return false;
        };
        let cleared = Self::remove_at(child, name, level - 1, data);
        if child.data.is_empty() && child.children.is_empty() {
            node.children.remove(label);
        }
        cleared
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ExistsError;

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::TriggerKind;

    fn name(text: &str) -> Name {
        text.parse().unwrap()
    }

    fn exact(kind: TriggerKind, zone: usize) -> NameData {
        NameData {
            pair: PairSet::for_kind(kind, ZoneSet::only(zone)),
            wild: PairSet::EMPTY,
        }
    }

    fn wild(kind: TriggerKind, zone: usize) -> NameData {
        NameData {
            pair: PairSet::EMPTY,
            wild: PairSet::for_kind(kind, ZoneSet::only(zone)),
        }
    }

    #[test]
    fn exact_match_works() {
        let mut tree = NameTree::new();
        tree.add(&name("walled.garden.example."), &exact(TriggerKind::Qname, 0))
            .unwrap();

        let found = tree.find(&name("walled.garden.example."));
        assert!(found.pair.direct.contains(0));
        assert!(found.wild.is_empty());

        assert!(tree.find(&name("garden.example.")).is_empty());
        assert!(tree.find(&name("other.garden.example.")).is_empty());
        assert!(tree.find(&name("sub.walled.garden.example.")).is_empty());
    }

    #[test]
    fn wildcard_matches_descendants_but_not_the_bare_name() {
        let mut tree = NameTree::new();
        // The wildcard owner *.evil.example contributes to the parent
        // node's wild set.
        tree.add(&name("evil.example."), &wild(TriggerKind::Qname, 2))
            .unwrap();

        let found = tree.find(&name("foo.evil.example."));
        assert!(found.wild.direct.contains(2));

        let found = tree.find(&name("deep.foo.evil.example."));
        assert!(found.wild.direct.contains(2));

        let found = tree.find(&name("evil.example."));
        assert!(found.pair.is_empty() && found.wild.is_empty());
    }

    #[test]
    fn exact_and_wildcard_accumulate_along_the_path() {
        let mut tree = NameTree::new();
        tree.add(&name("example."), &wild(TriggerKind::Qname, 0))
            .unwrap();
        tree.add(&name("evil.example."), &wild(TriggerKind::Qname, 1))
            .unwrap();
        tree.add(&name("foo.evil.example."), &exact(TriggerKind::Qname, 2))
            .unwrap();

        let found = tree.find(&name("foo.evil.example."));
        assert!(found.pair.direct.contains(2));
        assert!(found.wild.direct.contains(0));
        assert!(found.wild.direct.contains(1));
    }

    #[test]
    fn root_wildcard_covers_everything() {
        let mut tree = NameTree::new();
        tree.add(&Name::root(), &wild(TriggerKind::Qname, 0)).unwrap();
        assert!(tree.find(&name("anything.at.all.")).wild.direct.contains(0));
        assert!(tree.find(&Name::root()).is_empty());
    }

    #[test]
    fn qname_and_nsdname_components_are_separate() {
        let mut tree = NameTree::new();
        tree.add(&name("ns.example."), &exact(TriggerKind::NsDname, 1))
            .unwrap();
        let found = tree.find(&name("ns.example."));
        assert!(found.pair.direct.is_empty());
        assert!(found.pair.ns.contains(1));
    }

    #[test]
    fn duplicate_bits_are_rejected() {
        let mut tree = NameTree::new();
        let data = exact(TriggerKind::Qname, 0);
        tree.add(&name("evil.example."), &data).unwrap();
        assert_eq!(tree.add(&name("evil.example."), &data), Err(ExistsError));
        // Another zone or the wildcard field is no conflict.
        tree.add(&name("evil.example."), &exact(TriggerKind::Qname, 1))
            .unwrap();
        tree.add(&name("evil.example."), &wild(TriggerKind::Qname, 0))
            .unwrap();
    }

    #[test]
    fn remove_mirrors_add_and_prunes() {
        let mut tree = NameTree::new();
        let data = exact(TriggerKind::Qname, 0);
        tree.add(&name("a.b.c.example."), &data).unwrap();
        tree.add(&name("c.example."), &exact(TriggerKind::Qname, 1))
            .unwrap();

        assert!(tree.remove(&name("a.b.c.example."), &data));
        assert!(tree.find(&name("a.b.c.example.")).is_empty());
        // The interior b.c.example node created for the deep entry is
        // gone again; c.example survives with its own data.
        let found = tree.find(&name("c.example."));
        assert!(found.pair.direct.contains(1));
        let example = tree.root.children.get(&name("example.")[0]).unwrap();
        let c = example.children.get(&name("c.")[0]).unwrap();
        assert!(c.children.is_empty());

        // Absent names and absent bits are tolerated.
        assert!(!tree.remove(&name("a.b.c.example."), &data));
        assert!(!tree.remove(&name("c.example."), &data));
    }

    #[test]
    fn for_each_reconstructs_names() {
        let mut tree = NameTree::new();
        tree.add(&name("evil.example."), &wild(TriggerKind::Qname, 2))
            .unwrap();
        tree.add(&name("walled.garden.example."), &exact(TriggerKind::Qname, 0))
            .unwrap();

        let mut seen = Vec::new();
        tree.for_each(|n, _| seen.push(n.clone()));
        seen.sort();
        let mut expected = vec![name("evil.example."), name("walled.garden.example.")];
        expected.sort();
        assert_eq!(seen, expected);
    }
}
