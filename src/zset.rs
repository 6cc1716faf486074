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

//! Zone ordinals and zone bit sets.
//!
//! Every registered policy zone is assigned a stable ordinal
//! ([`RpzNum`]) for the lifetime of the index; a lower ordinal means a
//! higher priority. Sets of zones are represented as one bit per
//! ordinal in a [`ZoneSet`], and most of the index carries these sets
//! in [`PairSet`]s, which keep the "direct" triggers (qname and
//! answer-IP) separate from the "nameserver" triggers (nsdname and
//! nsip).

use std::fmt;
use std::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Not};

use crate::policy::TriggerKind;

/// The ordinal of a policy zone. Lower ordinals have higher priority.
pub type RpzNum = usize;

/// The maximum number of policy zones an index can hold, fixed by the
/// width of the word backing [`ZoneSet`].
pub const MAX_ZONES: usize = 64;

/// A set of policy zones, one bit per ordinal.
#[derive(Clone, Copy, Default, Eq, Hash, PartialEq)]
pub struct ZoneSet(u64);

impl ZoneSet {
    /// The empty set.
    pub const EMPTY: Self = Self(0);

    /// The set containing every representable zone.
    pub const ALL: Self = Self(u64::MAX);

    /// Returns the set containing only zone `num`.
    pub fn only(num: RpzNum) -> Self {
        assert!(num < MAX_ZONES);
        Self(1 << num)
    }

    /// Returns the set of all zones with priority strictly higher than
    /// zone `num` (that is, all ordinals below `num`).
    pub fn below(num: RpzNum) -> Self {
        assert!(num < MAX_ZONES);
        Self((1 << num) - 1)
    }

    /// Returns whether zone `num` is in the set.
    pub fn contains(self, num: RpzNum) -> bool {
        num < MAX_ZONES && self.0 & (1 << num) != 0
    }

    /// Returns whether the set is empty.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Returns the highest-priority (lowest-ordinal) zone in the set,
    /// or `None` if the set is empty.
    pub fn lowest(self) -> Option<RpzNum> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0.trailing_zeros() as RpzNum)
        }
    }

    /// Returns an iterator over the ordinals in the set, in priority
    /// order.
    pub fn iter(self) -> impl Iterator<Item = RpzNum> {
        let mut rest = self.0;
        std::iter::from_fn(move || {
            if rest == 0 {
                None
            } else {
                let num = rest.trailing_zeros() as RpzNum;
                rest &= rest - 1;
                Some(num)
            }
        })
    }

    /// Given a hit against the zones in `found`, returns this set
    /// restricted to the zones that can still decide the answer: the
    /// highest-priority hit zone itself and every zone of higher
    /// priority. When the intersection with `found` is empty, the set
    /// is returned unchanged.
    pub fn trim(self, found: ZoneSet) -> Self {
        let hit = self.0 & found.0;
        let lowest_bit = hit & hit.wrapping_neg();
        let mask = (lowest_bit << 1).wrapping_sub(1);
        Self(self.0 & mask)
    }
}

impl BitAnd for ZoneSet {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl BitAndAssign for ZoneSet {
    fn bitand_assign(&mut self, rhs: Self) {
        self.0 &= rhs.0;
    }
}

impl BitOr for ZoneSet {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for ZoneSet {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl Not for ZoneSet {
    type Output = Self;

    fn not(self) -> Self {
        Self(!self.0)
    }
}

impl fmt::Debug for ZoneSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ZoneSet({:#x})", self.0)
    }
}

/// A pair of [`ZoneSet`]s flagging the existence of direct (IP or
/// qname) and nameserver (nsip or nsdname) policy triggers.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PairSet {
    pub direct: ZoneSet,
    pub ns: ZoneSet,
}

impl PairSet {
    /// The empty pair.
    pub const EMPTY: Self = Self {
        direct: ZoneSet::EMPTY,
        ns: ZoneSet::EMPTY,
    };

    /// Places `zones` into the component that collects triggers of the
    /// given kind.
    pub fn for_kind(kind: TriggerKind, zones: ZoneSet) -> Self {
        match kind {
            TriggerKind::Qname | TriggerKind::Ip => Self {
                direct: zones,
                ns: ZoneSet::EMPTY,
            },
            TriggerKind::NsDname | TriggerKind::NsIp => Self {
                direct: ZoneSet::EMPTY,
                ns: zones,
            },
        }
    }

    /// Returns whether both components are empty.
    pub fn is_empty(self) -> bool {
        self.direct.is_empty() && self.ns.is_empty()
    }

    /// Component-wise union.
    pub fn union(self, other: Self) -> Self {
        Self {
            direct: self.direct | other.direct,
            ns: self.ns | other.ns,
        }
    }

    /// Component-wise intersection.
    pub fn intersect(self, other: Self) -> Self {
        Self {
            direct: self.direct & other.direct,
            ns: self.ns & other.ns,
        }
    }

    /// Component-wise difference (the bits of `self` not in `other`).
    pub fn difference(self, other: Self) -> Self {
        Self {
            direct: self.direct & !other.direct,
            ns: self.ns & !other.ns,
        }
    }

    /// Restricts both components to `zones`.
    pub fn masked(self, zones: ZoneSet) -> Self {
        Self {
            direct: self.direct & zones,
            ns: self.ns & zones,
        }
    }

    /// Applies [`ZoneSet::trim`] to each component against the
    /// corresponding component of a hit.
    pub fn trim(self, found: Self) -> Self {
        Self {
            direct: self.direct.trim(found.direct),
            ns: self.ns.trim(found.ns),
        }
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////
