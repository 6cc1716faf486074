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

//! The zone loading protocol: a begin/ready bracket around add and
//! delete calls.
//!
//! A reloaded zone may drop triggers, and the trees cannot tell which
//! entries of the old zone data a fresh load no longer contains. The
//! protocol therefore builds a reload in a shadow index: the new zone
//! data loads into an empty index, every *other* zone's entries are
//! copied over once the load succeeds, and the search states are then
//! swapped under the exclusive search locks, so the query path
//! atomically goes from all-old to all-new. If the load fails, the
//! shadow is simply dropped and the live index has never changed.
//!
//! The very first load of a zone has no old entries to drop, so it
//! skips the shadow and writes straight into the live index. Most
//! zone maintenance after that point is incremental adds and deletes
//! of individual records, which also apply directly.

use std::mem;
use std::sync::Arc;

use log::{info, warn};

use crate::key;
use crate::name::Name;
use crate::policy::TriggerKind;
use crate::summary::NameData;
use crate::zone::{TriggerCounts, ZoneConfig};
use crate::zset::{PairSet, RpzNum, ZoneSet};

use super::{Error, HaveSets, Registry, RpzIndex, SearchState};

impl RpzIndex {
    /// Starts a load of zone `num` and returns the index the loader
    /// must apply its [`add`](RpzIndex::add) and
    /// [`delete`](RpzIndex::delete) calls to, followed by one
    /// [`ready`](RpzIndex::ready) call.
    ///
    /// On the first load of a zone this is the live index itself; on
    /// later loads it is a fresh shadow index sharing this one's zone
    /// registry.
    pub fn begin_load(self: &Arc<Self>, num: RpzNum) -> Result<Arc<RpzIndex>, Error> {
        let mut reg = self.maint.lock().unwrap();
        if num >= reg.zones.len() {
            return Err(Error::NoSuchZone);
        }
        if !reg.load_begun.contains(num) {
            reg.load_begun |= ZoneSet::only(num);
            return Ok(Arc::clone(self));
        }

        let load = RpzIndex::new(self.options);
        {
            let mut load_reg = load.maint.lock().unwrap();
            load_reg.zones = reg.zones.clone();
            load_reg.counts = vec![TriggerCounts::default(); reg.zones.len()];
        }
        Ok(load)
    }

    /// Adds the trigger that `owner` declares for zone `num`.
    ///
    /// Malformed owner names are logged and skipped without failing
    /// the load. Re-adding a trigger that is already present is an
    /// error.
    pub fn add(&self, num: RpzNum, owner: &Name) -> Result<(), Error> {
        let mut reg = self.maint.lock().unwrap();
        let zone = reg.zones.get(num).cloned().ok_or(Error::NoSuchZone)?;
        let mut search = self.search.write().unwrap();
        match zone.classify(owner) {
            kind @ (TriggerKind::Ip | TriggerKind::NsIp) => {
                self.add_addr(&mut reg, &mut search, num, &zone, kind, owner)
            }
            kind => self.add_name(&mut reg, &mut search, num, &zone, kind, owner),
        }
    }

    /// Deletes the trigger that `owner` declares for zone `num`.
    ///
    /// Owner names that are malformed, or that name no present
    /// trigger, are ignored: deletes are driven by the records of the
    /// policy zone's database, which holds nodes (empty wildcard
    /// parents, for one) that never became triggers.
    pub fn delete(&self, num: RpzNum, owner: &Name) -> Result<(), Error> {
        let mut reg = self.maint.lock().unwrap();
        let zone = reg.zones.get(num).cloned().ok_or(Error::NoSuchZone)?;
        let mut search = self.search.write().unwrap();
        match zone.classify(owner) {
            kind @ (TriggerKind::Ip | TriggerKind::NsIp) => {
                if let Ok((key, prefix)) = key::parse_owner(owner, zone.own_labels(owner, kind)) {
                    let pair = PairSet::for_kind(kind, ZoneSet::only(num));
                    if search.cidr.remove(&key, prefix, pair) {
                        self.adjust_trigger(&mut reg, &mut search, num, kind, key.is_v4(prefix), false);
                    }
                }
            }
            kind => {
                let (trigger, data) = Self::name_trigger(num, &zone, kind, owner);
                if search.names.remove(&trigger, &data) {
                    self.adjust_trigger(&mut reg, &mut search, num, kind, false, false);
                }
            }
        }
        Ok(())
    }

    /// Completes the load of zone `num` begun with
    /// [`begin_load`](RpzIndex::begin_load). `self` is the live index;
    /// `load` is the handle `begin_load` returned.
    ///
    /// For a shadow load, this copies the other zones' entries into
    /// the shadow and swaps the two search states, after which
    /// dropping `load` frees the displaced trees. Either way the
    /// trigger counters are rebuilt from the trees and the load is
    /// logged.
    pub fn ready(self: &Arc<Self>, load: Arc<RpzIndex>, num: RpzNum) -> Result<(), Error> {
        if Arc::ptr_eq(self, &load) {
            let mut reg = self.maint.lock().unwrap();
            if num >= reg.zones.len() {
                return Err(Error::NoSuchZone);
            }
            let origin = reg.zones[num].origin().clone();
            let mut search = self.search.write().unwrap();
            let totals = self.fix_triggers(&mut reg, &mut search);
            info!(
                "loaded policy zone '{}': {} qname, {} nsdname, {} IP, {} NSIP entries",
                origin,
                totals.qname,
                totals.nsdname,
                totals.ip(),
                totals.nsip(),
            );
            return Ok(());
        }

        let mut live_reg = self.maint.lock().unwrap();
        let mut load_reg = load.maint.lock().unwrap();
        if num >= live_reg.zones.len() || load_reg.zones.len() != live_reg.zones.len() {
            return Err(Error::NoSuchZone);
        }
        let origin = live_reg.zones[num].origin().clone();

        // Fold every other zone's entries into the shadow. The shadow
        // held entries for the reloading zone alone, so the masked
        // copies cannot collide with anything.
        {
            let live_search = self.search.read().unwrap();
            let mut load_search = load.search.write().unwrap();
            let keep = !ZoneSet::only(num);
            live_search.cidr.for_each(|ip, prefix, pair| {
                let pair = pair.masked(keep);
                if !pair.is_empty() {
                    load_search
                        .cidr
                        .insert(ip, prefix, pair)
                        .expect("a shadow index cannot hold other zones' address triggers");
                }
            });
            live_search.names.for_each(|name, data| {
                let data = data.masked(keep);
                if !data.is_empty() {
                    load_search
                        .names
                        .add(name, &data)
                        .expect("a shadow index cannot hold other zones' name triggers");
                }
            });
        }

        // Exchange the search states: readers atomically go from the
        // all-old to the all-new trees. Then rebuild the counters on
        // both sides, this index from its new trees and the shadow
        // (which now owns the old trees, and frees them when dropped)
        // for the change report.
        let mut live_search = self.search.write().unwrap();
        let mut load_search = load.search.write().unwrap();
        mem::swap(&mut *live_search, &mut *load_search);
        let new = self.fix_triggers(&mut live_reg, &mut live_search);
        let old = load.fix_triggers(&mut load_reg, &mut load_search);
        info!(
            "reloading policy zone '{}' changed from {} to {} qname, \
             {} to {} nsdname, {} to {} IP, {} to {} NSIP entries",
            origin,
            old.qname,
            new.qname,
            old.nsdname,
            new.nsdname,
            old.ip(),
            new.ip(),
            old.nsip(),
            new.nsip(),
        );
        Ok(())
    }

    fn add_addr(
        &self,
        reg: &mut Registry,
        search: &mut SearchState,
        num: RpzNum,
        zone: &ZoneConfig,
        kind: TriggerKind,
        owner: &Name,
    ) -> Result<(), Error> {
        let (key, prefix) = match key::parse_owner(owner, zone.own_labels(owner, kind)) {
            Ok(decoded) => decoded,
            Err(e) => {
                // Complain about bad owner names, but let the zone
                // load.
                warn!("invalid response policy IP address \"{}\": {}", owner, e);
                return Ok(());
            }
        };
        let pair = PairSet::for_kind(kind, ZoneSet::only(num));
        if search.cidr.insert(&key, prefix, pair).is_err() {
            warn!("response policy {} trigger \"{}\" is already present", kind, owner);
            return Err(Error::Exists);
        }
        self.adjust_trigger(reg, search, num, kind, key.is_v4(prefix), true);
        Ok(())
    }

    fn add_name(
        &self,
        reg: &mut Registry,
        search: &mut SearchState,
        num: RpzNum,
        zone: &ZoneConfig,
        kind: TriggerKind,
        owner: &Name,
    ) -> Result<(), Error> {
        let (trigger, data) = Self::name_trigger(num, zone, kind, owner);
        if search.names.add(&trigger, &data).is_err() {
            warn!("response policy {} trigger \"{}\" is already present", kind, owner);
            return Err(Error::Exists);
        }
        self.adjust_trigger(reg, search, num, kind, false, true);
        Ok(())
    }

    /// Computes the summary-tree name and payload for a name trigger:
    /// the owner with the zone's suffix stripped, and, for a wildcard
    /// owner, with the wildcard label dropped and the bits moved to
    /// the wildcard set of the parent name.
    fn name_trigger(
        num: RpzNum,
        zone: &ZoneConfig,
        kind: TriggerKind,
        owner: &Name,
    ) -> (Name, NameData) {
        let pair = PairSet::for_kind(kind, ZoneSet::only(num));
        let skip = usize::from(owner.is_wildcard());
        let keep = zone.own_labels(owner, kind).saturating_sub(skip);
        // A wildcard owner has at least two labels, and keep excludes
        // at least the zone suffix, so both operations are in range.
        let trigger = owner.superdomain(skip).unwrap().first_labels(keep);
        let data = if skip == 1 {
            NameData {
                pair: PairSet::EMPTY,
                wild: pair,
            }
        } else {
            NameData {
                pair,
                wild: PairSet::EMPTY,
            }
        };
        (trigger, data)
    }

    /// Adjusts one trigger counter, keeping the `have` sets in step
    /// when the count crosses zero.
    fn adjust_trigger(
        &self,
        reg: &mut Registry,
        search: &mut SearchState,
        num: RpzNum,
        kind: TriggerKind,
        v4: bool,
        increment: bool,
    ) {
        let counts = &mut reg.counts[num];
        let count = match kind {
            TriggerKind::Qname | TriggerKind::NsDname => counts.name_slot_mut(kind),
            _ => counts.addr_slot_mut(kind, v4),
        };
        let crossed;
        if increment {
            *count += 1;
            crossed = *count == 1;
            if crossed {
                *search.have.slot_mut(kind, v4) |= ZoneSet::only(num);
            }
        } else {
            debug_assert!(*count > 0);
            *count = count.saturating_sub(1);
            crossed = *count == 0;
            if crossed {
                *search.have.slot_mut(kind, v4) &= !ZoneSet::only(num);
            }
        }
        if crossed {
            search.have.fix_derived(self.options.qname_wait_recurse);
        }
    }

    /// Rebuilds the per-zone trigger counts and `have` sets from the
    /// trees, returning whole-index totals. Every bit stored in a tree
    /// node is exactly one trigger.
    fn fix_triggers(&self, reg: &mut Registry, search: &mut SearchState) -> TriggerCounts {
        let mut counts = vec![TriggerCounts::default(); reg.zones.len()];
        search.cidr.for_each(|ip, prefix, pair| {
            let v4 = ip.is_v4(prefix);
            for num in pair.direct.iter() {
                *counts[num].addr_slot_mut(TriggerKind::Ip, v4) += 1;
            }
            for num in pair.ns.iter() {
                *counts[num].addr_slot_mut(TriggerKind::NsIp, v4) += 1;
            }
        });
        search.names.for_each(|_, data| {
            for num in data.pair.direct.iter() {
                counts[num].qname += 1;
            }
            for num in data.wild.direct.iter() {
                counts[num].qname += 1;
            }
            for num in data.pair.ns.iter() {
                counts[num].nsdname += 1;
            }
            for num in data.wild.ns.iter() {
                counts[num].nsdname += 1;
            }
        });

        let mut have = HaveSets::default();
        let mut totals = TriggerCounts::default();
        for (num, c) in counts.iter().enumerate() {
            let bit = ZoneSet::only(num);
            if c.qname > 0 {
                have.qname |= bit;
            }
            if c.nsdname > 0 {
                have.nsdname |= bit;
            }
            if c.ipv4 > 0 {
                have.ipv4 |= bit;
            }
            if c.ipv6 > 0 {
                have.ipv6 |= bit;
            }
            if c.nsipv4 > 0 {
                have.nsipv4 |= bit;
            }
            if c.nsipv6 > 0 {
                have.nsipv6 |= bit;
            }
            totals.accumulate(c);
        }
        have.fix_derived(self.options.qname_wait_recurse);
        reg.counts = counts;
        search.have = have;
        totals
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////
