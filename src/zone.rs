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

//! Per-zone configuration and trigger accounting.

use crate::name::{self, Label, Name};
use crate::policy::{Policy, TriggerKind};

/// The configuration of one policy zone.
///
/// Besides the origin, a `ZoneConfig` precomputes the conventional
/// subdomains that mark trigger categories (`rpz-ip.<origin>` and so
/// on) and the `rpz-passthru.<origin>` sentinel, and carries the
/// operator's policy override for the zone.
#[derive(Clone, Debug)]
pub struct ZoneConfig {
    origin: Name,
    ip: Name,
    nsip: Name,
    nsdname: Name,
    passthru: Name,
    policy: Policy,
    cname: Option<Name>,
}

impl ZoneConfig {
    /// Creates the configuration for the policy zone rooted at
    /// `origin`, with the default policy ([`Policy::Given`]) and no
    /// CNAME override. This fails only if the origin is so long that a
    /// marker subdomain of it would not be a valid name.
    pub fn new(origin: Name) -> Result<Self, name::Error> {
        // The marker labels are valid label constants.
        let marker = |l: &'static [u8]| <&Label>::try_from(l).unwrap();
        Ok(Self {
            ip: origin.prepended(marker(b"rpz-ip"))?,
            nsip: origin.prepended(marker(b"rpz-nsip"))?,
            nsdname: origin.prepended(marker(b"rpz-nsdname"))?,
            passthru: origin.prepended(marker(b"rpz-passthru"))?,
            origin,
            policy: Policy::Given,
            cname: None,
        })
    }

    /// Sets the operator's policy override for this zone. A `cname`
    /// target must accompany (and only accompany) [`Policy::Cname`].
    pub fn override_policy(&mut self, policy: Policy, cname: Option<Name>) {
        debug_assert_eq!(cname.is_some(), policy == Policy::Cname);
        self.policy = policy;
        self.cname = cname;
    }

    pub fn origin(&self) -> &Name {
        &self.origin
    }

    pub fn policy(&self) -> Policy {
        self.policy
    }

    pub fn cname(&self) -> Option<&Name> {
        self.cname.as_ref()
    }

    /// Determines the trigger kind a record's owner name declares,
    /// from the marker subdomain it falls under. Owners under none of
    /// the markers are query-name triggers.
    pub fn classify(&self, owner: &Name) -> TriggerKind {
        if owner.eq_or_subdomain_of(&self.ip) {
            TriggerKind::Ip
        } else if owner.eq_or_subdomain_of(&self.nsip) {
            TriggerKind::NsIp
        } else if owner.eq_or_subdomain_of(&self.nsdname) {
            TriggerKind::NsDname
        } else {
            TriggerKind::Qname
        }
    }

    /// The number of leading labels of `owner` that remain once the
    /// marker subdomain of `kind` is stripped.
    pub(crate) fn own_labels(&self, owner: &Name, kind: TriggerKind) -> usize {
        let suffix = match kind {
            TriggerKind::Qname => self.origin.len(),
            // The three marker subdomains are all one label longer
            // than the origin.
            _ => self.ip.len(),
        };
        owner.len().saturating_sub(suffix)
    }

    /// Translates the target of a policy record's CNAME into the
    /// action it encodes.
    ///
    /// The special forms are: the root (a name-error rewrite), the
    /// bare wildcard `*.` (an empty-answer rewrite), any other
    /// wildcard (a CNAME with the query name substituted for the
    /// wildcard label), this zone's passthru sentinel, and the
    /// obsolete passthru spelling in which a trigger points at its own
    /// owner name (passed as `selfname`). Everything else simply
    /// answers with the record's data.
    pub fn decode_cname(&self, target: &Name, selfname: Option<&Name>) -> Policy {
        if target.is_root() {
            return Policy::Nxdomain;
        }
        if target.is_wildcard() {
            if target.len() == 2 {
                return Policy::Nodata;
            }
            return Policy::Wildcname;
        }
        if *target == self.passthru {
            return Policy::Passthru;
        }
        if selfname == Some(target) {
            return Policy::Passthru;
        }
        Policy::Record
    }
}

/// Counts of a zone's triggers by kind, with the address kinds split
/// by family.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TriggerCounts {
    pub qname: usize,
    pub nsdname: usize,
    pub ipv4: usize,
    pub ipv6: usize,
    pub nsipv4: usize,
    pub nsipv6: usize,
}

impl TriggerCounts {
    /// The counter for address triggers of the given kind and family.
    /// Only the address kinds carry a family split.
    pub(crate) fn addr_slot_mut(&mut self, kind: TriggerKind, v4: bool) -> &mut usize {
        match (kind, v4) {
            (TriggerKind::Ip, true) => &mut self.ipv4,
            (TriggerKind::Ip, false) => &mut self.ipv6,
            (TriggerKind::NsIp, true) => &mut self.nsipv4,
            (TriggerKind::NsIp, false) => &mut self.nsipv6,
            _ => unreachable!("address counter for name trigger"),
        }
    }

    pub(crate) fn name_slot_mut(&mut self, kind: TriggerKind) -> &mut usize {
        match kind {
            TriggerKind::Qname => &mut self.qname,
            TriggerKind::NsDname => &mut self.nsdname,
            _ => unreachable!("name counter for address trigger"),
        }
    }

    /// Total response-address triggers.
    pub fn ip(&self) -> usize {
        self.ipv4 + self.ipv6
    }

    /// Total nameserver-address triggers.
    pub fn nsip(&self) -> usize {
        self.nsipv4 + self.nsipv6
    }

    /// Adds another zone's counts into this one (for whole-index
    /// totals).
    pub(crate) fn accumulate(&mut self, other: &TriggerCounts) {
        self.qname += other.qname;
        self.nsdname += other.nsdname;
        self.ipv4 += other.ipv4;
        self.ipv6 += other.ipv6;
        self.nsipv4 += other.nsipv4;
        self.nsipv6 += other.nsipv6;
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    fn zone() -> ZoneConfig {
        ZoneConfig::new("rpz.example.org.".parse().unwrap()).unwrap()
    }

    fn name(text: &str) -> Name {
        text.parse().unwrap()
    }

    #[test]
    fn marker_subdomains_are_derived() {
        let zone = zone();
        assert_eq!(zone.origin(), &name("rpz.example.org."));
        assert_eq!(zone.ip, name("rpz-ip.rpz.example.org."));
        assert_eq!(zone.passthru, name("rpz-passthru.rpz.example.org."));
    }

    #[test]
    fn classify_works() {
        let zone = zone();
        assert_eq!(
            zone.classify(&name("24.0.0.0.10.rpz-ip.rpz.example.org.")),
            TriggerKind::Ip,
        );
        assert_eq!(
            zone.classify(&name("32.1.1.1.10.rpz-nsip.rpz.example.org.")),
            TriggerKind::NsIp,
        );
        assert_eq!(
            zone.classify(&name("ns.evil.example.rpz-nsdname.rpz.example.org.")),
            TriggerKind::NsDname,
        );
        assert_eq!(
            zone.classify(&name("evil.example.rpz.example.org.")),
            TriggerKind::Qname,
        );
    }

    #[test]
    fn own_labels_strips_the_right_suffix() {
        let zone = zone();
        let qname_owner = name("evil.example.rpz.example.org.");
        assert_eq!(zone.own_labels(&qname_owner, TriggerKind::Qname), 2);
        let ip_owner = name("24.0.0.0.10.rpz-ip.rpz.example.org.");
        assert_eq!(zone.own_labels(&ip_owner, TriggerKind::Ip), 5);
    }

    #[test]
    fn decode_cname_works() {
        let zone = zone();
        assert_eq!(zone.decode_cname(&Name::root(), None), Policy::Nxdomain);
        assert_eq!(zone.decode_cname(&name("*."), None), Policy::Nodata);
        assert_eq!(
            zone.decode_cname(&name("*.garden.net."), None),
            Policy::Wildcname,
        );
        assert_eq!(
            zone.decode_cname(&name("rpz-passthru.rpz.example.org."), None),
            Policy::Passthru,
        );
        let owner = name("128.1.0.0.127.rpz-ip.rpz.example.org.");
        assert_eq!(zone.decode_cname(&owner, Some(&owner)), Policy::Passthru);
        assert_eq!(
            zone.decode_cname(&name("sinkhole.example.net."), Some(&owner)),
            Policy::Record,
        );
    }
}
