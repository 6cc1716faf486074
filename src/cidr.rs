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

//! The parallel CIDR radix tree.
//!
//! This is a Patricia trie over 128-bit address keys. A single tree
//! serves four logical databases at once: each node carries a
//! [`PairSet`], whose `direct` component records the zones listing the
//! node's block as a response-address trigger and whose `ns` component
//! records the zones listing it as a nameserver-address trigger, with
//! IPv4 blocks distinguished by their v4-mapped form.
//!
//! Every node also aggregates the pair sets of its entire subtree in
//! `sum`, which lets a lookup abandon a branch as soon as no zone it
//! still cares about has data there. Lookups narrow the set of zones
//! they care about as they descend: once some zone matches a block
//! covering the query address, no lower-priority zone can decide the
//! answer, so deeper hits are only accepted from zones of equal or
//! higher priority ([`PairSet::trim`]). The combination yields the
//! "first zone wins, then longest prefix wins" rule in one descent.
//!
//! Nodes are kept in a [`Slab`] arena and linked by index, parent and
//! children both, since the structural updates (splice, fork,
//! collapse) need to walk in both directions.

use slab::Slab;

use crate::key::{diff_bit, IpKey, KEY_BITS};
use crate::zset::PairSet;

/// A node of the tree. `ip` is always masked to `prefix`; the child at
/// slot `s` continues the key with bit value `s` at position `prefix`.
#[derive(Debug)]
struct Node {
    parent: Option<usize>,
    child: [Option<usize>; 2],
    ip: IpKey,
    prefix: u8,
    pair: PairSet,
    sum: PairSet,
}

/// The parallel CIDR radix tree.
#[derive(Debug, Default)]
pub struct CidrTree {
    nodes: Slab<Node>,
    root: Option<usize>,
}

/// The deepest relevant entry found by [`CidrTree::lookup`].
#[derive(Clone, Copy, Debug)]
pub struct CidrMatch {
    pub ip: IpKey,
    pub prefix: u8,

    /// The matched entry's zones, restricted to the zones the lookup
    /// was still considering when it reached the entry.
    pub pair: PairSet,
}

impl CidrTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Finds the deepest entry whose block covers `ip`/`prefix` and
    /// whose pair set intersects `pair`, honoring zone priority: a hit
    /// for some zone stops lower-priority zones from matching deeper.
    pub fn lookup(&self, ip: &IpKey, prefix: u8, pair: PairSet) -> Option<CidrMatch> {
        let mut live = pair;
        let mut best = None;
        let mut cur = self.root;
        while let Some(idx) = cur {
            let node = &self.nodes[idx];
            if node.sum.intersect(live).is_empty() {
                // Nothing relevant anywhere below here.
                break;
            }
            let dbit = diff_bit(ip, prefix, &node.ip, node.prefix);
            if dbit == prefix {
                if prefix == node.prefix {
                    // The node's key matches the target exactly.
                    let hit = node.pair.intersect(live);
                    if !hit.is_empty() {
                        best = Some(CidrMatch {
                            ip: node.ip,
                            prefix: node.prefix,
                            pair: hit,
                        });
                    }
                }
                // Entries below this point would be longer than the
                // target; quit with whatever we have.
                break;
            }
            if dbit < node.prefix {
                // The keys fork; neither contains the other.
                break;
            }
            // The node's block covers the target. Record the partial
            // match and narrow the live set before going deeper.
            let hit = node.pair.intersect(live);
            if !hit.is_empty() {
                best = Some(CidrMatch {
                    ip: node.ip,
                    prefix: node.prefix,
                    pair: hit,
                });
                live = live.trim(node.pair);
            }
            cur = node.child[ip.bit(dbit)];
        }
        best
    }

    /// Adds `pair` at `ip`/`prefix`, creating structure as needed.
    /// Fails if some of the requested bits are already present at an
    /// exact node, leaving the tree unchanged.
    pub fn insert(&mut self, ip: &IpKey, prefix: u8, pair: PairSet) -> Result<(), ExistsError> {
        let ip = ip.masked(prefix);
        let mut parent = None;
        let mut slot = 0;
        let mut cur = self.root;
        loop {
            let Some(idx) = cur else {
                // Off the end of the tree: the target becomes a new
                // leaf under the deepest covering node.
                let new = self.alloc(ip, prefix, pair);
                self.attach(new, parent, slot);
                self.set_sum(new);
                return Ok(());
            };
            let node = &self.nodes[idx];
            let dbit = diff_bit(&ip, prefix, &node.ip, node.prefix);
            if dbit == prefix {
                if prefix == node.prefix {
                    if !node.pair.intersect(pair).is_empty() {
                        return Err(ExistsError);
                    }
                    let node = &mut self.nodes[idx];
                    node.pair = node.pair.union(pair);
                    self.set_sum(idx);
                    return Ok(());
                }
                // The target is shorter than the node: splice it in as
                // the node's new parent.
                let child_slot = node.ip.bit(prefix);
                let new = self.alloc(ip, prefix, pair);
                self.attach(new, parent, slot);
                self.nodes[new].child[child_slot] = Some(idx);
                self.nodes[idx].parent = Some(new);
                self.set_sum(new);
                return Ok(());
            }
            if dbit == node.prefix {
                parent = Some(idx);
                slot = ip.bit(dbit);
                cur = self.nodes[idx].child[slot];
                continue;
            }
            // The keys disagree below both prefixes: fork an interior
            // node at the first differing bit, with the existing node
            // and a fresh leaf for the target as its children.
            let fork = self.alloc(ip.masked(dbit), dbit, PairSet::EMPTY);
            let leaf = self.alloc(ip, prefix, pair);
            self.attach(fork, parent, slot);
            let leaf_slot = ip.bit(dbit);
            self.nodes[fork].child[leaf_slot] = Some(leaf);
            self.nodes[fork].child[1 - leaf_slot] = Some(idx);
            self.nodes[leaf].parent = Some(fork);
            self.nodes[idx].parent = Some(fork);
            self.set_sum(leaf);
            return Ok(());
        }
    }

    /// Clears `pair` from the exact entry `ip`/`prefix`, collapsing any
    /// structure that becomes redundant. Returns whether an entry was
    /// found; clearing bits that are absent is not an error, and
    /// neither is an absent entry (deletes mirror adds that may have
    /// been rejected).
    pub fn remove(&mut self, ip: &IpKey, prefix: u8, pair: PairSet) -> bool {
        let ip = ip.masked(prefix);
        let Some(idx) = self.find_exact(&ip, prefix, pair) else {
            return false;
        };

        let node = &mut self.nodes[idx];
        let cleared = node.pair.intersect(pair);
        node.pair = node.pair.difference(cleared);
        self.set_sum(idx);

        // The node, and possibly its parent after a splice, may now be
        // a useless interior node.
        let mut cur = Some(idx);
        while let Some(i) = cur {
            let node = &self.nodes[i];
            if node.child[0].is_some() && node.child[1].is_some() {
                break;
            }
            if !node.pair.is_empty() {
                break;
            }
            let child = node.child[0].or(node.child[1]);
            let parent = node.parent;
            match parent {
                None => self.root = child,
                Some(p) => {
                    let slot = (self.nodes[p].child[1] == Some(i)) as usize;
                    self.nodes[p].child[slot] = child;
                }
            }
            if let Some(c) = child {
                self.nodes[c].parent = parent;
            }
            self.nodes.remove(i);
            cur = parent;
        }
        true
    }

    /// Visits every entry in preorder. Used to rebuild trigger counts
    /// and to carry entries over to a freshly loaded index.
    pub fn for_each<F: FnMut(&IpKey, u8, PairSet)>(&self, mut f: F) {
        self.visit(self.root, &mut f);
    }

    fn visit<F: FnMut(&IpKey, u8, PairSet)>(&self, cur: Option<usize>, f: &mut F) {
        // Paths strictly lengthen their prefixes, so the recursion
        // depth is bounded by the key width.
        if let Some(idx) = cur {
            let node = &self.nodes[idx];
            f(&node.ip, node.prefix, node.pair);
            self.visit(node.child[0], f);
            self.visit(node.child[1], f);
        }
    }

    /// Finds the node holding exactly `ip`/`prefix` with bits
    /// overlapping `pair`.
    fn find_exact(&self, ip: &IpKey, prefix: u8, pair: PairSet) -> Option<usize> {
        let mut cur = self.root;
        while let Some(idx) = cur {
            let node = &self.nodes[idx];
            if node.sum.intersect(pair).is_empty() {
                return None;
            }
            let dbit = diff_bit(ip, prefix, &node.ip, node.prefix);
            if dbit == prefix && prefix == node.prefix {
                return Some(idx).filter(|_| !node.pair.intersect(pair).is_empty());
            }
            if dbit == node.prefix && node.prefix < prefix {
                cur = node.child[ip.bit(dbit)];
            } else {
                return None;
            }
        }
        None
    }

    fn alloc(&mut self, ip: IpKey, prefix: u8, pair: PairSet) -> usize {
        // Trigger prefixes start at 1, but a fork of two keys that
        // disagree in their first bit sits at prefix 0.
        debug_assert!(prefix <= KEY_BITS);
        self.nodes.insert(Node {
            parent: None,
            child: [None, None],
            ip,
            prefix,
            pair,
            sum: PairSet::EMPTY,
        })
    }

    /// Puts `idx` where `slot`-th child of `parent` (or the root) used
    /// to be. The displaced node, if any, must be relinked by the
    /// caller.
    fn attach(&mut self, idx: usize, parent: Option<usize>, slot: usize) {
        self.nodes[idx].parent = parent;
        match parent {
            None => self.root = Some(idx),
            Some(p) => self.nodes[p].child[slot] = Some(idx),
        }
    }

    /// Recomputes subtree summaries from `idx` upward, stopping at the
    /// first node whose summary does not change.
    fn set_sum(&mut self, idx: usize) {
        let mut cur = Some(idx);
        while let Some(i) = cur {
            let node = &self.nodes[i];
            let mut sum = node.pair;
            for child in node.child.into_iter().flatten() {
                sum = sum.union(self.nodes[child].sum);
            }
            if sum == self.nodes[i].sum {
                break;
            }
            self.nodes[i].sum = sum;
            cur = self.nodes[i].parent;
        }
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
    use crate::zset::ZoneSet;

    impl CidrTree {
        /// Checks the structural invariants of every node.
        fn check(&self) {
            self.check_node(self.root, None);
        }

        fn check_node(&self, cur: Option<usize>, parent: Option<usize>) {
            let Some(idx) = cur else { return };
            let node = &self.nodes[idx];
            assert_eq!(node.parent, parent);
            assert!(node.prefix <= KEY_BITS);
            assert!(node.ip.is_masked(node.prefix));

            let mut sum = node.pair;
            for (slot, child) in node.child.iter().enumerate() {
                if let Some(c) = *child {
                    let cnode = &self.nodes[c];
                    assert!(cnode.prefix > node.prefix);
                    assert_eq!(
                        diff_bit(&cnode.ip, cnode.prefix, &node.ip, node.prefix),
                        node.prefix,
                    );
                    assert_eq!(cnode.ip.bit(node.prefix), slot);
                    sum = sum.union(cnode.sum);
                }
            }
            assert_eq!(node.sum, sum);
            assert!(!(node.pair.is_empty() && node.sum.is_empty()));

            self.check_node(node.child[0], cur);
            self.check_node(node.child[1], cur);
        }

        /// Collects (prefix, pair) entries with nonzero bits, sorted,
        /// for logical state comparisons.
        fn entries(&self) -> Vec<(IpKey, u8, PairSet)> {
            let mut out = Vec::new();
            self.for_each(|ip, prefix, pair| {
                if !pair.is_empty() {
                    out.push((*ip, prefix, pair));
                }
            });
            out.sort_by_key(|e| (e.0.bit(0), e.1));
            out
        }
    }

    fn v4_block(text: &str) -> (IpKey, u8) {
        let owner: crate::name::Name = format!("{}.", text).parse().unwrap();
        crate::key::parse_owner(&owner, owner.len() - 1).unwrap()
    }

    fn ip_pair(zone: usize) -> PairSet {
        PairSet::for_kind(TriggerKind::Ip, ZoneSet::only(zone))
    }

    fn nsip_pair(zone: usize) -> PairSet {
        PairSet::for_kind(TriggerKind::NsIp, ZoneSet::only(zone))
    }

    fn query(addr: &str) -> IpKey {
        IpKey::from_addr(addr.parse().unwrap())
    }

    #[test]
    fn longest_match_within_one_zone() {
        let mut tree = CidrTree::new();
        let (block24, p24) = v4_block("24.0.0.0.10");
        let (host, p32) = v4_block("32.1.1.1.10");
        tree.insert(&block24, p24, ip_pair(0)).unwrap();
        tree.insert(&host, p32, ip_pair(0)).unwrap();
        tree.check();

        let hit = tree
            .lookup(&query("10.1.1.1"), KEY_BITS, ip_pair(0))
            .unwrap();
        assert_eq!((hit.prefix, hit.ip), (p32, host));

        let hit = tree
            .lookup(&query("10.0.0.5"), KEY_BITS, ip_pair(0))
            .unwrap();
        assert_eq!((hit.prefix, hit.ip), (p24, block24));

        assert!(tree.lookup(&query("10.2.0.1"), KEY_BITS, ip_pair(0)).is_none());
    }

    #[test]
    fn higher_priority_zone_wins_over_longer_prefix() {
        let mut tree = CidrTree::new();
        let (block24, p24) = v4_block("24.0.0.0.10");
        let (host, p32) = v4_block("32.1.1.1.10");
        tree.insert(&block24, p24, ip_pair(0)).unwrap();
        tree.insert(&host, p32, ip_pair(1)).unwrap();
        tree.check();

        // Zone 0's /24 match halts zone 1, despite zone 1's /32.
        let both = ip_pair(0).union(ip_pair(1));
        let hit = tree.lookup(&query("10.1.1.1"), KEY_BITS, both).unwrap();
        assert_eq!(hit.prefix, p24);
        assert_eq!(hit.pair.direct.lowest(), Some(0));

        // Restricted to zone 1 alone, the /32 is reachable again.
        let hit = tree
            .lookup(&query("10.1.1.1"), KEY_BITS, ip_pair(1))
            .unwrap();
        assert_eq!(hit.prefix, p32);
    }

    #[test]
    fn shared_node_reports_lowest_zone() {
        let mut tree = CidrTree::new();
        let (host, p32) = v4_block("32.1.1.1.10");
        tree.insert(&host, p32, ip_pair(1)).unwrap();
        tree.insert(&host, p32, ip_pair(0)).unwrap();
        tree.check();

        let both = ip_pair(0).union(ip_pair(1));
        let hit = tree.lookup(&query("10.1.1.1"), KEY_BITS, both).unwrap();
        assert_eq!(hit.pair.direct.lowest(), Some(0));
    }

    #[test]
    fn direct_and_ns_databases_are_separate() {
        let mut tree = CidrTree::new();
        let (host, p32) = v4_block("32.1.1.1.10");
        tree.insert(&host, p32, nsip_pair(2)).unwrap();
        tree.check();

        assert!(tree.lookup(&query("10.1.1.1"), KEY_BITS, ip_pair(2)).is_none());
        let hit = tree
            .lookup(&query("10.1.1.1"), KEY_BITS, nsip_pair(2))
            .unwrap();
        assert_eq!(hit.pair.ns.lowest(), Some(2));
    }

    #[test]
    fn insert_rejects_duplicates() {
        let mut tree = CidrTree::new();
        let (host, p32) = v4_block("32.1.1.1.10");
        tree.insert(&host, p32, ip_pair(0)).unwrap();
        assert_eq!(tree.insert(&host, p32, ip_pair(0)), Err(ExistsError));
        // The same block for another zone or the other database is
        // not a duplicate.
        tree.insert(&host, p32, ip_pair(1)).unwrap();
        tree.insert(&host, p32, nsip_pair(0)).unwrap();
        tree.check();
    }

    #[test]
    fn splice_and_fork_preserve_structure() {
        let mut tree = CidrTree::new();
        let (a, pa) = v4_block("32.1.1.1.10");
        let (b, pb) = v4_block("32.2.1.1.10");
        let (cover, pcover) = v4_block("24.0.1.1.10");
        // Inserting two siblings forks an interior node; inserting
        // their covering block splices above the fork.
        tree.insert(&a, pa, ip_pair(0)).unwrap();
        tree.insert(&b, pb, ip_pair(0)).unwrap();
        tree.check();
        tree.insert(&cover, pcover, ip_pair(0)).unwrap();
        tree.check();

        for addr in ["10.1.1.1", "10.1.1.2"] {
            let hit = tree.lookup(&query(addr), KEY_BITS, ip_pair(0)).unwrap();
            assert_eq!(hit.prefix, KEY_BITS);
        }
        let hit = tree.lookup(&query("10.1.1.7"), KEY_BITS, ip_pair(0)).unwrap();
        assert_eq!(hit.prefix, pcover);
    }

    #[test]
    fn remove_inverts_insert() {
        let mut tree = CidrTree::new();
        let (a, pa) = v4_block("32.1.1.1.10");
        let (b, pb) = v4_block("32.2.1.1.10");
        let (cover, pcover) = v4_block("24.0.1.1.10");
        tree.insert(&a, pa, ip_pair(0)).unwrap();
        tree.insert(&cover, pcover, ip_pair(1)).unwrap();
        let before = tree.entries();

        tree.insert(&b, pb, ip_pair(0)).unwrap();
        tree.check();
        assert!(tree.remove(&b, pb, ip_pair(0)));
        tree.check();
        assert_eq!(tree.entries(), before);

        // Removing the rest empties the tree entirely.
        assert!(tree.remove(&a, pa, ip_pair(0)));
        assert!(tree.remove(&cover, pcover, ip_pair(1)));
        tree.check();
        assert!(tree.root.is_none());
        assert_eq!(tree.nodes.len(), 0);
    }

    #[test]
    fn remove_tolerates_absent_entries() {
        let mut tree = CidrTree::new();
        let (a, pa) = v4_block("32.1.1.1.10");
        let (b, pb) = v4_block("32.2.1.1.10");
        tree.insert(&a, pa, ip_pair(0)).unwrap();
        assert!(!tree.remove(&b, pb, ip_pair(0)));
        assert!(!tree.remove(&a, pa, ip_pair(1)));
        assert!(!tree.remove(&a, pa, nsip_pair(0)));
        tree.check();
    }

    #[test]
    fn fork_collapses_when_one_side_is_removed() {
        let mut tree = CidrTree::new();
        let (a, pa) = v4_block("32.1.1.1.10");
        let (b, pb) = v4_block("32.2.1.1.10");
        tree.insert(&a, pa, ip_pair(0)).unwrap();
        tree.insert(&b, pb, ip_pair(0)).unwrap();
        assert!(tree.remove(&a, pa, ip_pair(0)));
        tree.check();
        // The fork collapsed: only b's leaf remains.
        assert_eq!(tree.nodes.len(), 1);
        let hit = tree.lookup(&query("10.1.1.2"), KEY_BITS, ip_pair(0)).unwrap();
        assert_eq!((hit.ip, hit.prefix), (b, pb));
    }

    #[test]
    fn v6_and_v4_share_the_tree() {
        let mut tree = CidrTree::new();
        let owner: crate::name::Name = "48.zz.1.2.2001.".parse().unwrap();
        let (v6, p48) = crate::key::parse_owner(&owner, owner.len() - 1).unwrap();
        let (v4, p32) = v4_block("32.1.1.1.10");
        tree.insert(&v6, p48, ip_pair(0)).unwrap();
        tree.insert(&v4, p32, ip_pair(0)).unwrap();
        tree.check();

        let hit = tree
            .lookup(&query("2001:2:1::beef"), KEY_BITS, ip_pair(0))
            .unwrap();
        assert_eq!((hit.ip, hit.prefix), (v6, p48));
        let hit = tree.lookup(&query("10.1.1.1"), KEY_BITS, ip_pair(0)).unwrap();
        assert_eq!((hit.ip, hit.prefix), (v4, p32));
        assert!(tree
            .lookup(&query("2001:3::1"), KEY_BITS, ip_pair(0))
            .is_none());
    }
}
