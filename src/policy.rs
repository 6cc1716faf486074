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

//! Policy actions and trigger kinds.

use std::fmt;
use std::str::FromStr;

use crate::util::Caseless;

/// The kinds of triggers a policy zone can declare.
///
/// The owner name of a record in a policy zone determines its kind:
/// owners under the zone's `rpz-ip` subdomain encode response IP
/// addresses, owners under `rpz-nsip` encode nameserver IP addresses,
/// owners under `rpz-nsdname` encode nameserver domain names, and
/// everything else triggers on the query name itself.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum TriggerKind {
    Qname,
    Ip,
    NsIp,
    NsDname,
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::Qname => f.write_str("QNAME"),
            Self::Ip => f.write_str("IP"),
            Self::NsIp => f.write_str("NSIP"),
            Self::NsDname => f.write_str("NSDNAME"),
        }
    }
}

/// The action a policy zone applies when one of its triggers matches.
///
/// [`Given`](Policy::Given) and [`Disabled`](Policy::Disabled) only
/// appear as per-zone configuration overrides; the actions decoded from
/// a matched record are the remaining variants.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Policy {
    /// Apply whatever action the matched record encodes.
    Given,

    /// Log the match, but do not rewrite the response.
    Disabled,

    /// Do not rewrite the response.
    Passthru,

    /// Synthesize a name-error response.
    Nxdomain,

    /// Synthesize an empty answer.
    Nodata,

    /// Rewrite to the zone's configured CNAME target.
    Cname,

    /// Answer with the matched record's own data.
    Record,

    /// Rewrite to a wildcard CNAME target, substituting the query name
    /// for the wildcard label.
    Wildcname,
}

/// Parses the policy override names accepted in resolver
/// configuration. Matching is ASCII-case-insensitive; the obsolete
/// spelling `no-op` is accepted as an alias for `passthru`.
impl FromStr for Policy {
    type Err = &'static str;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let text = Caseless(text);
        if text == Caseless("given") {
            Ok(Self::Given)
        } else if text == Caseless("disabled") {
            Ok(Self::Disabled)
        } else if text == Caseless("passthru") {
            Ok(Self::Passthru)
        } else if text == Caseless("nxdomain") {
            Ok(Self::Nxdomain)
        } else if text == Caseless("nodata") {
            Ok(Self::Nodata)
        } else if text == Caseless("cname") {
            Ok(Self::Cname)
        } else if text == Caseless("no-op") {
            // Obsolete spelling.
            Ok(Self::Passthru)
        } else {
            Err("unknown policy")
        }
    }
}

/// Formats the policy the way it is reported in logs. `Record` is
/// reported as `Local-Data`, and both CNAME forms as `CNAME`.
impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::Given => f.write_str("GIVEN"),
            Self::Disabled => f.write_str("DISABLED"),
            Self::Passthru => f.write_str("PASSTHRU"),
            Self::Nxdomain => f.write_str("NXDOMAIN"),
            Self::Nodata => f.write_str("NODATA"),
            Self::Record => f.write_str("Local-Data"),
            Self::Cname | Self::Wildcname => f.write_str("CNAME"),
        }
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////
