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

//! An in-memory index of DNS response policy zone (RPZ) triggers.
//!
//! Response policy zones are specially formatted DNS zones whose
//! records tell a recursive resolver to override certain answers: to
//! block a domain, to redirect it, or to leave it alone explicitly.
//! Each record's owner name encodes the *trigger*: the feature of a
//! live query (the query name, a response address, a nameserver name
//! or a nameserver address) the override applies to.
//!
//! This crate provides the data structure such a resolver consults on
//! every query: the [`index::RpzIndex`], which holds the triggers of
//! up to [`zset::MAX_ZONES`] policy zones in a pair of purpose-built
//! trees and answers, in one descent, which zone's trigger applies
//! under the RPZ precedence rules (the first configured zone with any
//! match wins, and within a zone the longest address prefix wins).
//! It also implements the loading protocol that keeps lookups
//! consistent while a zone is reloaded, and the decoding of a matched
//! policy record's CNAME target into the action it stands for.
//!
//! What this crate deliberately does not do: parse DNS messages or
//! zone files, resolve queries, transfer zones, or store the policy
//! zones' answer records. It identifies *which* zone matched and at
//! *which* owner name; the embedding resolver fetches the answer from
//! its own zone database and applies it.

mod cidr;
mod key;
mod summary;
mod util;

pub mod index;
pub mod name;
pub mod policy;
pub mod zone;
pub mod zset;

pub use index::{Error, HaveSets, IndexOptions, IpMatch, RpzIndex};
pub use policy::{Policy, TriggerKind};
pub use zone::{TriggerCounts, ZoneConfig};
pub use zset::{RpzNum, ZoneSet, MAX_ZONES};
