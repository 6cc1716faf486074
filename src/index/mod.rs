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

//! The trigger index itself.
//!
//! An [`RpzIndex`] collects the triggers of up to [`MAX_ZONES`] policy
//! zones into one CIDR radix tree (response and nameserver addresses)
//! and one name summary tree (query and nameserver names), and answers
//! the resolver's two questions on the query path:
//!
//! * [`RpzIndex::find_ip`]: which zone, if any, has the best trigger
//!   covering this address, and at which owner name?
//! * [`RpzIndex::find_name`]: which zones have a trigger for this
//!   name?
//!
//! The index only identifies the matching zone and owner name; the
//! policy zone's actual records live elsewhere (in the resolver's zone
//! database), which is why the owner name it returns is encoded
//! bit-exactly the way the policy zone spells it.
//!
//! Zones are registered once with [`RpzIndex::add_zone`] and populated
//! through the loading protocol in this module's `load` half: a
//! begin/ready bracket around any number of add and delete calls, with
//! reloads built in a shadow index and swapped in atomically. See
//! [`RpzIndex::begin_load`].
//!
//! Locking follows the structure of the update protocol: a maintenance
//! mutex serializes all structural work, and a read-write search lock
//! protects the trees, held shared by lookups and exclusively for the
//! brief root swap and for each add or delete.

use std::net::IpAddr;
use std::sync::{Arc, Mutex, RwLock};

use log::warn;

use crate::cidr::CidrTree;
use crate::key::{self, IpKey, KEY_BITS};
use crate::name::Name;
use crate::policy::TriggerKind;
use crate::summary::NameTree;
use crate::zone::{TriggerCounts, ZoneConfig};
use crate::zset::{PairSet, RpzNum, ZoneSet, MAX_ZONES};

mod load;

/// Index-wide options, fixed at construction.
#[derive(Clone, Copy, Debug, Default)]
pub struct IndexOptions {
    /// When set, no zone may rewrite a response on the query name
    /// alone before recursion has completed;
    /// [`RpzIndex::qname_skip_recurse`] is then always empty.
    pub qname_wait_recurse: bool,
}

/// The in-memory index of policy zone triggers. See the module
/// documentation.
#[derive(Debug)]
pub struct RpzIndex {
    options: IndexOptions,
    maint: Mutex<Registry>,
    search: RwLock<SearchState>,
}

/// Registration state, guarded by the maintenance lock.
#[derive(Debug)]
struct Registry {
    /// Zone configurations by ordinal. Shared with a shadow index
    /// while one zone reloads.
    zones: Vec<Arc<ZoneConfig>>,

    /// Per-zone trigger counts, parallel to `zones`.
    counts: Vec<TriggerCounts>,

    /// Zones whose first load has started; their records go straight
    /// into this index rather than through a shadow copy.
    load_begun: ZoneSet,
}

/// Everything the query path reads, guarded by the search lock and
/// swapped wholesale when a reload completes.
#[derive(Debug)]
struct SearchState {
    cidr: CidrTree,
    names: NameTree,
    have: HaveSets,
}

/// Which zones currently hold at least one trigger, by kind. Derived
/// from the counters; used to cut queries short and by the resolver to
/// decide which checks a query needs at all.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct HaveSets {
    pub qname: ZoneSet,
    pub nsdname: ZoneSet,
    pub ipv4: ZoneSet,
    pub ipv6: ZoneSet,
    pub nsipv4: ZoneSet,
    pub nsipv6: ZoneSet,

    /// `ipv4 | ipv6`.
    pub ip: ZoneSet,

    /// `nsipv4 | nsipv6`.
    pub nsip: ZoneSet,

    /// The zones entitled to rewrite on the query name before
    /// recursion: those with higher priority than every zone holding
    /// any trigger that needs the recursion result.
    pub qname_skip_recurse: ZoneSet,
}

impl HaveSets {
    fn slot_mut(&mut self, kind: TriggerKind, v4: bool) -> &mut ZoneSet {
        match (kind, v4) {
            (TriggerKind::Qname, _) => &mut self.qname,
            (TriggerKind::NsDname, _) => &mut self.nsdname,
            (TriggerKind::Ip, true) => &mut self.ipv4,
            (TriggerKind::Ip, false) => &mut self.ipv6,
            (TriggerKind::NsIp, true) => &mut self.nsipv4,
            (TriggerKind::NsIp, false) => &mut self.nsipv6,
        }
    }

    /// Recomputes the derived sets after a per-kind set changed.
    fn fix_derived(&mut self, qname_wait_recurse: bool) {
        self.ip = self.ipv4 | self.ipv6;
        self.nsip = self.nsipv4 | self.nsipv6;
        self.qname_skip_recurse = if qname_wait_recurse {
            ZoneSet::EMPTY
        } else {
            let post_recurse = self.ipv4 | self.ipv6 | self.nsdname | self.nsipv4 | self.nsipv6;
            match post_recurse.lowest() {
                None => ZoneSet::ALL,
                Some(num) => ZoneSet::below(num),
            }
        };
    }
}

/// A hit returned by [`RpzIndex::find_ip`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IpMatch {
    /// The matching zone of highest priority.
    pub num: RpzNum,

    /// The trigger's owner name as the policy zone spells it, relative
    /// to the zone's address marker subdomain (e.g. `32.1.1.1.10.`).
    pub owner: Name,

    /// The prefix length of the matched block (v4-mapped form for
    /// IPv4, i.e. 96 more than the IPv4 prefix).
    pub prefix: u8,
}

/// Errors reported by index registration and loading operations.
///
/// Malformed trigger owner names are deliberately *not* an error: they
/// are logged and skipped so that one bad record cannot keep a policy
/// zone from loading.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Error {
    /// The index already holds [`MAX_ZONES`] zones.
    TooManyZones,

    /// The zone ordinal is not registered.
    NoSuchZone,

    /// The trigger being added is already present.
    Exists,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match *self {
            Self::TooManyZones => write!(f, "no more than {} policy zones are supported", MAX_ZONES),
            Self::NoSuchZone => f.write_str("the policy zone ordinal is not registered"),
            Self::Exists => f.write_str("the trigger is already present"),
        }
    }
}

impl std::error::Error for Error {}

impl RpzIndex {
    /// Creates a new, empty index.
    pub fn new(options: IndexOptions) -> Arc<Self> {
        Arc::new(Self {
            options,
            maint: Mutex::new(Registry {
                zones: Vec::new(),
                counts: Vec::new(),
                load_begun: ZoneSet::EMPTY,
            }),
            search: RwLock::new(SearchState {
                cidr: CidrTree::new(),
                names: NameTree::new(),
                have: HaveSets::default(),
            }),
        })
    }

    pub fn options(&self) -> IndexOptions {
        self.options
    }

    /// Registers a policy zone and returns its ordinal. Zones are
    /// prioritized in registration order: the first zone registered
    /// outranks all later ones.
    pub fn add_zone(&self, config: ZoneConfig) -> Result<RpzNum, Error> {
        let mut reg = self.maint.lock().unwrap();
        if reg.zones.len() >= MAX_ZONES {
            return Err(Error::TooManyZones);
        }
        reg.zones.push(Arc::new(config));
        reg.counts.push(TriggerCounts::default());
        Ok(reg.zones.len() - 1)
    }

    /// Returns the number of registered zones.
    pub fn num_zones(&self) -> usize {
        self.maint.lock().unwrap().zones.len()
    }

    /// Returns the configuration of zone `num`.
    pub fn zone(&self, num: RpzNum) -> Option<Arc<ZoneConfig>> {
        self.maint.lock().unwrap().zones.get(num).cloned()
    }

    /// Returns the per-zone trigger counts of zone `num`.
    pub fn trigger_counts(&self, num: RpzNum) -> Option<TriggerCounts> {
        self.maint.lock().unwrap().counts.get(num).copied()
    }

    /// Returns a snapshot of the per-kind "zone has any triggers"
    /// sets.
    pub fn have(&self) -> HaveSets {
        self.search.read().unwrap().have
    }

    /// The zones that may act on the query name before recursion; see
    /// [`HaveSets::qname_skip_recurse`].
    pub fn qname_skip_recurse(&self) -> ZoneSet {
        self.search.read().unwrap().have.qname_skip_recurse
    }

    /// Searches for the best address trigger covering `addr` among
    /// `zones`: the highest-priority zone with any covering block
    /// wins, and within it the longest prefix. `kind` selects the
    /// response-address or nameserver-address database and must be
    /// [`TriggerKind::Ip`] or [`TriggerKind::NsIp`].
    pub fn find_ip(&self, kind: TriggerKind, zones: ZoneSet, addr: IpAddr) -> Option<IpMatch> {
        let key = IpKey::from_addr(addr);
        let search = self.search.read().unwrap();
        let have = &search.have;
        let zones = zones
            & match (kind, addr.is_ipv4()) {
                (TriggerKind::Ip, true) => have.ipv4,
                (TriggerKind::Ip, false) => have.ipv6,
                (TriggerKind::NsIp, true) => have.nsipv4,
                (TriggerKind::NsIp, false) => have.nsipv6,
                _ => unreachable!("find_ip with name trigger kind"),
            };
        if zones.is_empty() {
            return None;
        }

        let pair = PairSet::for_kind(kind, zones);
        let hit = search.cidr.lookup(&key, KEY_BITS, pair)?;
        let matched = match kind {
            TriggerKind::Ip => hit.pair.direct,
            _ => hit.pair.ns,
        };
        let num = matched.lowest()?;
        match key::to_name(&hit.ip, hit.prefix, None) {
            Ok(owner) => Some(IpMatch {
                num,
                owner,
                prefix: hit.prefix,
            }),
            Err(e) => {
                warn!("response policy zone owner name encoding failed: {}", e);
                None
            }
        }
    }

    /// Returns the zones among `zones` holding a trigger matching
    /// `name`, either exactly or through a wildcard ancestor. `kind`
    /// selects the query-name or nameserver-name database and must be
    /// [`TriggerKind::Qname`] or [`TriggerKind::NsDname`]. Priority
    /// among the returned zones is left to the caller, which has to
    /// weigh them against other trigger kinds anyway.
    pub fn find_name(&self, kind: TriggerKind, zones: ZoneSet, name: &Name) -> ZoneSet {
        if zones.is_empty() {
            return ZoneSet::EMPTY;
        }
        let search = self.search.read().unwrap();
        let found = search.names.find(name);
        let candidates = match kind {
            TriggerKind::Qname => found.pair.direct | found.wild.direct,
            TriggerKind::NsDname => found.pair.ns | found.wild.ns,
            _ => unreachable!("find_name with address trigger kind"),
        };
        zones & candidates
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    fn name(text: &str) -> Name {
        text.parse().unwrap()
    }

    fn index_with_zones(options: IndexOptions, origins: &[&str]) -> Arc<RpzIndex> {
        let index = RpzIndex::new(options);
        for origin in origins {
            let num = index
                .add_zone(ZoneConfig::new(name(origin)).unwrap())
                .unwrap();
            index.begin_load(num).unwrap();
        }
        index
    }

    #[test]
    fn zone_registration_is_bounded() {
        let index = RpzIndex::new(IndexOptions::default());
        for i in 0..MAX_ZONES {
            let origin = format!("rpz{}.test.", i);
            let config = ZoneConfig::new(name(&origin)).unwrap();
            assert_eq!(index.add_zone(config), Ok(i));
        }
        let config = ZoneConfig::new(name("overflow.test.")).unwrap();
        assert_eq!(index.add_zone(config), Err(Error::TooManyZones));
        assert_eq!(index.num_zones(), MAX_ZONES);
    }

    #[test]
    fn queries_on_an_empty_index_miss() {
        let index = RpzIndex::new(IndexOptions::default());
        assert!(index
            .find_ip(TriggerKind::Ip, ZoneSet::ALL, "10.0.0.1".parse().unwrap())
            .is_none());
        assert!(index
            .find_name(TriggerKind::Qname, ZoneSet::ALL, &name("example."))
            .is_empty());
    }

    #[test]
    fn qname_skip_recurse_tracks_post_recursion_triggers() {
        let index = index_with_zones(
            IndexOptions::default(),
            &["rpz0.test.", "rpz1.test.", "rpz2.test."],
        );

        // Qname-only zones do not hold rewrites back.
        index.add(0, &name("evil.example.rpz0.test.")).unwrap();
        assert_eq!(index.qname_skip_recurse(), ZoneSet::ALL);

        // An address trigger in zone 1 means only zone 0 may still
        // rewrite on the query name before recursion.
        index.add(1, &name("32.1.1.1.10.rpz-ip.rpz1.test.")).unwrap();
        assert_eq!(index.qname_skip_recurse(), ZoneSet::below(1));

        // A nameserver-name trigger in zone 0 stops everyone.
        index
            .add(0, &name("ns.evil.example.rpz-nsdname.rpz0.test."))
            .unwrap();
        assert_eq!(index.qname_skip_recurse(), ZoneSet::EMPTY);

        // Deleting both restores the full set.
        index.delete(1, &name("32.1.1.1.10.rpz-ip.rpz1.test.")).unwrap();
        index
            .delete(0, &name("ns.evil.example.rpz-nsdname.rpz0.test."))
            .unwrap();
        assert_eq!(index.qname_skip_recurse(), ZoneSet::ALL);
    }

    #[test]
    fn qname_wait_recurse_disables_early_rewrites() {
        let options = IndexOptions {
            qname_wait_recurse: true,
        };
        let index = index_with_zones(options, &["rpz0.test."]);
        index.add(0, &name("evil.example.rpz0.test.")).unwrap();
        index.ready(Arc::clone(&index), 0).unwrap();
        assert_eq!(index.qname_skip_recurse(), ZoneSet::EMPTY);
    }

    #[test]
    fn find_ip_masks_by_family() {
        let index = index_with_zones(IndexOptions::default(), &["rpz0.test."]);
        index.add(0, &name("32.1.1.1.10.rpz-ip.rpz0.test.")).unwrap();

        // An IPv6 query cannot reach a v4 trigger; the family mask
        // rules it out before the tree is searched.
        assert!(index
            .find_ip(TriggerKind::Ip, ZoneSet::ALL, "2001::1".parse().unwrap())
            .is_none());
        let have = index.have();
        assert!(have.ipv4.contains(0));
        assert!(have.ipv6.is_empty());
        assert!(have.ip.contains(0));
    }
}
