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

//! Implementation of data structures related to domain names.
//!
//! Trigger owner names, policy zone origins and query names all flow
//! through the [`Name`] type defined here. The representation is the
//! uncompressed on-the-wire form of the name together with an array of
//! label offsets, which makes label-wise iteration (the operation the
//! summary trees perform constantly) cheap in both directions.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::iter::FusedIterator;
use std::ops::Index;
use std::str::FromStr;

use arrayvec::ArrayVec;

mod error;
mod label;
pub use error::Error;
pub use label::{Label, LabelBuf};

/// The maximum number of labels in a domain name.
const MAX_N_LABELS: usize = 128;

/// The maximum length of the uncompressed on-the-wire representation of
/// a domain name.
const MAX_WIRE_LEN: usize = 255;

/// The maximum length of a label in a domain name (not including the
/// octet that provides the length).
const MAX_LABEL_LEN: usize = 63;

////////////////////////////////////////////////////////////////////////
// NAME STRUCTURE                                                     //
////////////////////////////////////////////////////////////////////////

/// A fully qualified domain name.
///
/// A `Name` always ends with the null (root) label, so even the
/// shortest `Name`, the DNS root itself, has one label. `Name`s can be
/// constructed through the [`FromStr`] implementation, from a sequence
/// of labels with [`Name::from_labels`], or derived from existing
/// `Name`s with [`Name::superdomain`], [`Name::first_labels`] and
/// [`Name::prepended`].
///
/// Internally, a `Name` stores the uncompressed on-the-wire
/// representation of the name ([RFC 1035 § 3.1]) plus the offset of
/// each label within it.
///
/// [RFC 1035 § 3.1]: https://datatracker.ietf.org/doc/html/rfc1035#section-3.1
#[derive(Clone)]
pub struct Name {
    wire: Box<[u8]>,
    offsets: Box<[u8]>,
}

#[allow(clippy::len_without_is_empty)] // A domain name is never empty!
impl Name {
    /// Builds a `Name` from the given labels, which must not include
    /// the terminating null label (it is appended automatically).
    pub fn from_labels<'a, I>(labels: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = &'a Label>,
    {
        let mut wire = ArrayVec::<u8, MAX_WIRE_LEN>::new();
        let mut offsets = ArrayVec::<u8, MAX_N_LABELS>::new();
        for label in labels {
            if label.is_null() {
                return Err(Error::NullNonTerminal);
            }
            if offsets.is_full() {
                return Err(Error::NameTooLong);
            }
            offsets.push(wire.len() as u8);
            wire.try_push(label.len() as u8)
                .map_err(|_| Error::NameTooLong)?;
            wire.try_extend_from_slice(label.octets())
                .map_err(|_| Error::NameTooLong)?;
        }
        if offsets.is_full() || wire.is_full() {
            return Err(Error::NameTooLong);
        }
        offsets.push(wire.len() as u8);
        wire.push(0);
        Ok(Self {
            wire: wire.as_slice().into(),
            offsets: offsets.as_slice().into(),
        })
    }

    /// Returns a `Name` representing the DNS root, `.`.
    pub fn root() -> Self {
        Self {
            wire: Box::new([0]),
            offsets: Box::new([0]),
        }
    }

    /// Returns the number of labels in this `Name`, including the
    /// terminating null label.
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    /// Returns whether the `Name` is the DNS root `.`.
    pub fn is_root(&self) -> bool {
        self.len() == 1
    }

    /// Returns whether the `Name` is a wildcard domain name (i.e.,
    /// whether its first label is `*`).
    pub fn is_wildcard(&self) -> bool {
        self[0].is_asterisk()
    }

    /// Returns an iterator over the labels in this `Name`.
    pub fn labels(&self) -> Labels {
        Labels {
            name: self,
            front: 0,
            back: self.len(),
        }
    }

    /// Returns whether this `Name` is equal to or a subdomain of
    /// `other`.
    pub fn eq_or_subdomain_of(&self, other: &Name) -> bool {
        self.len() >= other.len()
            && self
                .labels()
                .rev()
                .zip(other.labels().rev())
                .all(|(a, b)| a == b)
    }

    /// Returns the superdomain obtained by skipping the first `skip`
    /// labels of the `Name`, or `None` if there aren't enough labels.
    pub fn superdomain(&self, skip: usize) -> Option<Self> {
        if skip < self.len() {
            let n = self.len() - 1 - skip;
            // The labels of an existing Name always rebuild cleanly.
            Some(Self::from_labels(self.labels().skip(skip).take(n)).unwrap())
        } else {
            None
        }
    }

    /// Returns the `Name` made of the first `n` labels of this one,
    /// terminated by the root. This will panic if `n >= self.len()`.
    pub fn first_labels(&self, n: usize) -> Self {
        assert!(n < self.len());
        Self::from_labels(self.labels().take(n)).unwrap()
    }

    /// Returns the subdomain of this `Name` obtained by prepending
    /// `label`, failing if the result would be too long.
    pub fn prepended(&self, label: &Label) -> Result<Self, Error> {
        let rest = self.labels().take(self.len() - 1);
        Self::from_labels(std::iter::once(label).chain(rest))
    }

    /// Returns the (uncompressed) on-the-wire representation of the
    /// `Name`.
    pub fn wire_repr(&self) -> &[u8] {
        &self.wire
    }
}

impl Index<usize> for Name {
    type Output = Label;

    fn index(&self, index: usize) -> &Self::Output {
        let offset = self.offsets[index] as usize;
        let len = self.wire[offset] as usize;
        Label::from_unchecked(&self.wire[offset + 1..offset + 1 + len])
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_root() {
            f.write_str(".")
        } else {
            for label in self.labels().take(self.len() - 1) {
                write!(f, "{}.", label)?;
            }
            Ok(())
        }
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "\"{}\"", self)
    }
}

impl PartialEq for Name {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.labels().zip(other.labels()).all(|(a, b)| a == b)
    }
}

impl Eq for Name {}

impl PartialOrd for Name {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// The [`Ord`] implementation for `Name` employs DNSSEC's canonical
/// ordering of domain names: per [RFC 4034 § 6.1], `Name`s are ordered
/// as strings of labels read from right to left.
///
/// [RFC 4034 § 6.1]: https://datatracker.ietf.org/doc/html/rfc4034#section-6.1
impl Ord for Name {
    fn cmp(&self, other: &Self) -> Ordering {
        self.labels()
            .rev()
            .zip(other.labels().rev())
            .find_map(|(a, b)| Some(a.cmp(b)).filter(|ordering| ordering.is_ne()))
            .unwrap_or_else(|| self.len().cmp(&other.len()))
    }
}

impl Hash for Name {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for label in self.labels() {
            label.hash(state);
        }
    }
}

/// Allows for conversion of a Rust [`str`] into a [`Name`]. The passed
/// string must be strictly ASCII and fully qualified (ending with a
/// dot). Escape sequences are not supported; policy trigger names never
/// need them.
impl FromStr for Name {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(Error::StrEmpty);
        } else if !s.is_ascii() {
            return Err(Error::StrNotAscii);
        } else if s == "." {
            return Ok(Self::root());
        }

        let Some(relative) = s.strip_suffix('.') else {
            return Err(Error::NonFullyQualified);
        };
        let mut labels = Vec::new();
        for text in relative.split('.') {
            labels.push(<&Label>::try_from(text.as_bytes())?);
        }
        Self::from_labels(labels)
    }
}

////////////////////////////////////////////////////////////////////////
// ITERATION OVER A NAME'S LABELS                                     //
////////////////////////////////////////////////////////////////////////

/// An iterator over the [`Label`]s in a [`Name`], constructed by
/// [`Name::labels`].
#[derive(Clone, Debug)]
pub struct Labels<'a> {
    name: &'a Name,
    front: usize,
    back: usize,
}

impl<'a> Iterator for Labels<'a> {
    type Item = &'a Label;

    fn next(&mut self) -> Option<Self::Item> {
        if self.front < self.back {
            let this_one = self.front;
            self.front += 1;
            Some(&self.name[this_one])
        } else {
            None
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let len = self.back - self.front;
        (len, Some(len))
    }
}

impl DoubleEndedIterator for Labels<'_> {
    fn next_back(&mut self) -> Option<Self::Item> {
        if self.back > self.front {
            self.back -= 1;
            Some(&self.name[self.back])
        } else {
            None
        }
    }
}

impl ExactSizeIterator for Labels<'_> {}

impl FusedIterator for Labels<'_> {}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_has_expected_characteristics() {
        let root = Name::root();
        assert!(root.is_root());
        assert_eq!(root.len(), 1);
        assert_eq!(root.wire_repr(), &[0]);
    }

    #[test]
    fn is_wildcard_works() {
        let wildcard: Name = "*.policy.test.".parse().unwrap();
        let not_a_wildcard: Name = "policy.test.".parse().unwrap();
        let inner_asterisk: Name = "x.*.policy.test.".parse().unwrap();
        assert!(wildcard.is_wildcard());
        assert!(!not_a_wildcard.is_wildcard());
        assert!(!inner_asterisk.is_wildcard());
    }

    #[test]
    fn superdomain_works() {
        let subdomain: Name = "subdomain.example.test.".parse().unwrap();
        let domain: Name = "example.test.".parse().unwrap();
        let tld: Name = "test.".parse().unwrap();
        assert_eq!(subdomain.superdomain(0), Some(subdomain.clone()));
        assert_eq!(subdomain.superdomain(1), Some(domain));
        assert_eq!(subdomain.superdomain(2), Some(tld));
        assert_eq!(subdomain.superdomain(3), Some(Name::root()));
        assert_eq!(subdomain.superdomain(4), None);
    }

    #[test]
    fn first_labels_works() {
        let name: Name = "a.b.c.example.".parse().unwrap();
        assert_eq!(name.first_labels(2), "a.b.".parse().unwrap());
        assert_eq!(name.first_labels(0), Name::root());
    }

    #[test]
    fn prepended_works() {
        let origin: Name = "example.org.".parse().unwrap();
        let label = <&Label>::try_from(&b"rpz-ip"[..]).unwrap();
        assert_eq!(
            origin.prepended(label).unwrap(),
            "rpz-ip.example.org.".parse().unwrap(),
        );
    }

    #[test]
    fn labels_iterator_works() {
        let name: Name = "a.b.example.test.".parse().unwrap();
        let mut labels = name.labels();
        assert_eq!(labels.next().unwrap().octets(), b"a");
        assert_eq!(labels.next().unwrap().octets(), b"b");
        assert_eq!(labels.next().unwrap().octets(), b"example");
        assert_eq!(labels.next().unwrap().octets(), b"test");
        assert_eq!(labels.next(), Some(Label::null()));
        assert_eq!(labels.next(), None);
    }

    #[test]
    fn eq_or_subdomain_of_works() {
        let subdomain: Name = "subdomain.example.test.".parse().unwrap();
        let domain: Name = "example.test.".parse().unwrap();
        let other: Name = "other.test.".parse().unwrap();
        let root = Name::root();
        assert!(subdomain.eq_or_subdomain_of(&subdomain));
        assert!(subdomain.eq_or_subdomain_of(&domain));
        assert!(subdomain.eq_or_subdomain_of(&root));
        assert!(!domain.eq_or_subdomain_of(&subdomain));
        assert!(!domain.eq_or_subdomain_of(&other));
        assert!(!root.eq_or_subdomain_of(&domain));
    }

    #[test]
    fn eq_is_case_insensitive() {
        let lower: Name = "example.test.".parse().unwrap();
        let upper: Name = "EXAMPLE.TEST.".parse().unwrap();
        assert_eq!(lower, upper);
    }

    #[test]
    fn ord_works() {
        // This ordered list is from RFC 4034 § 6.1, which defines the
        // canonical ordering of domain names (escape-free subset).
        let names: Vec<Name> = [
            "example.",
            "a.example.",
            "yljkjljk.a.example.",
            "Z.a.example.",
            "zABC.a.EXAMPLE.",
            "z.example.",
            "*.z.example.",
        ]
        .into_iter()
        .map(|n| n.parse().unwrap())
        .collect();

        for (i, ni) in names.iter().enumerate() {
            for (j, nj) in names.iter().enumerate() {
                assert_eq!(i.cmp(&j), ni.cmp(nj));
            }
        }
    }

    #[test]
    fn fromstr_works() {
        let name: Name = "example.test.".parse().unwrap();
        assert_eq!(name.wire_repr(), b"\x07example\x04test\x00");
        assert_eq!(".".parse::<Name>().unwrap(), Name::root());
    }

    #[test]
    fn display_round_trips() {
        for text in [".", "example.test.", "*.evil.example.", "32.1.1.1.10."] {
            let name: Name = text.parse().unwrap();
            assert_eq!(name.to_string(), text);
        }
    }

    #[test]
    fn fromstr_rejects_bad_strings() {
        assert_eq!("".parse::<Name>(), Err(Error::StrEmpty));
        assert_eq!("✈.aero.".parse::<Name>(), Err(Error::StrNotAscii));
        assert_eq!("non.fqdn".parse::<Name>(), Err(Error::NonFullyQualified));
        assert_eq!("a.b..c.".parse::<Name>(), Err(Error::NullNonTerminal));
        assert_eq!(
            "xxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxx."
                .parse::<Name>(),
            Err(Error::LabelTooLong)
        );
        assert_eq!(
            "x.x.x.x.x.x.x.x.x.x.x.x.x.x.x.x.x.x.x.x.x.x.x.x.x.x.x.x.x.x.x.x.\
             x.x.x.x.x.x.x.x.x.x.x.x.x.x.x.x.x.x.x.x.x.x.x.x.x.x.x.x.x.x.x.x.\
             x.x.x.x.x.x.x.x.x.x.x.x.x.x.x.x.x.x.x.x.x.x.x.x.x.x.x.x.x.x.x.x.\
             x.x.x.x.x.x.x.x.x.x.x.x.x.x.x.x.x.x.x.x.x.x.x.x.x.x.x.x.x.x.x.x."
                .parse::<Name>(),
            Err(Error::NameTooLong)
        );
    }
}
