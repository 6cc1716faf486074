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

//! Implementation of the [`Label`] and [`LabelBuf`] types.

use std::borrow::Borrow;
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;

use arrayvec::ArrayVec;

use super::{Error, MAX_LABEL_LEN};

////////////////////////////////////////////////////////////////////////
// LABELS                                                             //
////////////////////////////////////////////////////////////////////////

/// The label given to a node in the Domain Name System's tree
/// structure.
///
/// `Label` is a wrapper over `[u8]` that can only be constructed if the
/// slice is a valid DNS label (that is, if it is no more than 63 octets
/// long). In accordance with [RFC 1034 § 3.1], comparisons between
/// `Label`s are ASCII-case-insensitive, but case is preserved in the
/// internal representation.
///
/// [RFC 1034 § 3.1]: https://tools.ietf.org/html/rfc1034#section-3.1
#[repr(transparent)]
pub struct Label {
    octets: [u8],
}

#[allow(clippy::len_without_is_empty)] // Following DNS terminology, we have is_null().
impl Label {
    /// Returns the asterisk label `*`, which marks wildcard domain
    /// names.
    pub fn asterisk() -> &'static Self {
        static ASTERISK_LABEL: &[u8; 1] = b"*";
        Self::from_unchecked(ASTERISK_LABEL)
    }

    /// Wraps up a `&[u8]` as a `Label` without checking its length for
    /// validity. To be used only within the parent module, and only
    /// after performing the length check manually.
    pub(super) fn from_unchecked(octets: &[u8]) -> &Self {
        unsafe { &*(octets as *const [u8] as *const Label) }
    }

    /// Returns whether this `Label` is the asterisk label.
    pub fn is_asterisk(&self) -> bool {
        self == Self::asterisk()
    }

    /// Returns whether this `Label` is the null (zero-length) label.
    pub fn is_null(&self) -> bool {
        self.octets.is_empty()
    }

    /// Returns the number of octets in this `Label`.
    pub fn len(&self) -> usize {
        self.octets.len()
    }

    /// Returns the null (zero-length) `Label`.
    pub fn null() -> &'static Self {
        Self::from_unchecked(&[])
    }

    /// Returns the octets of this `Label`.
    pub fn octets(&self) -> &[u8] {
        &self.octets
    }
}

impl<'a> TryFrom<&'a [u8]> for &'a Label {
    type Error = Error;

    fn try_from(octets: &'a [u8]) -> Result<Self, Self::Error> {
        if octets.len() > MAX_LABEL_LEN {
            Err(Error::LabelTooLong)
        } else {
            Ok(Label::from_unchecked(octets))
        }
    }
}

impl ToOwned for Label {
    type Owned = LabelBuf;

    fn to_owned(&self) -> Self::Owned {
        LabelBuf::from_unchecked(self.octets())
    }
}

/// When a `Label` is displayed, periods and backslashes are escaped
/// with a backslash, and octets that are not ASCII graphic characters
/// are escaped as `\xyz`, where `xyz` is the three-digit zero-padded
/// decimal representation of the octet (per RFC 1035 § 5.1 and
/// RFC 4343 § 2.1).
impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for &octet in self.octets() {
            match octet {
                b'.' | b'\\' => write!(f, "\\{}", octet as char)?,
                _ if octet.is_ascii_graphic() => write!(f, "{}", octet as char)?,
                _ => write!(f, "\\{:03}", octet)?,
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Label {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "\"{}\"", self)
    }
}

/// In accordance with RFC 1034 § 3.1 (clarified by RFC 4343),
/// comparison of `Label`s is ASCII-case-insensitive.
impl PartialEq for Label {
    fn eq(&self, other: &Self) -> bool {
        self.octets().eq_ignore_ascii_case(other.octets())
    }
}

impl Eq for Label {}

impl PartialOrd for Label {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// The [`Ord`] implementation for `Label` employs DNSSEC's canonical
/// ordering of labels ([RFC 4034 § 6.1]): unsigned left-justified octet
/// strings, with uppercase ASCII letters treated as if they were
/// lowercase.
///
/// [RFC 4034 § 6.1]: https://datatracker.ietf.org/doc/html/rfc4034#section-6.1
impl Ord for Label {
    fn cmp(&self, other: &Self) -> Ordering {
        let lhs = self.octets().iter().map(u8::to_ascii_lowercase);
        let rhs = other.octets().iter().map(u8::to_ascii_lowercase);
        lhs.cmp(rhs)
    }
}

impl Hash for Label {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // We have to hash in a case-insensitive manner to match our
        // implementations of [`PartialEq`] and [`Eq`].
        for octet in self.octets() {
            state.write_u8(octet.to_ascii_lowercase());
        }
    }
}

////////////////////////////////////////////////////////////////////////
// LABEL BUFFERS                                                      //
////////////////////////////////////////////////////////////////////////

/// An owned buffer holding any valid DNS label. It dereferences to a
/// [`Label`].
///
/// The notes about case and internal representation found in the
/// documentation for [`Label`] apply equally here.
#[derive(Clone)]
pub struct LabelBuf {
    octets: ArrayVec<u8, MAX_LABEL_LEN>,
}

impl LabelBuf {
    /// Constructs a `LabelBuf` from the given octets. The length of the
    /// slice is checked only in an assertion; the caller is expected to
    /// ensure that it is valid.
    fn from_unchecked(octets: &[u8]) -> Self {
        let mut buf = LabelBuf {
            octets: ArrayVec::new(),
        };
        buf.octets
            .try_extend_from_slice(octets)
            .expect("label octets fit any valid label");
        buf
    }
}

impl TryFrom<&[u8]> for LabelBuf {
    type Error = Error;

    fn try_from(octets: &[u8]) -> Result<Self, Self::Error> {
        if octets.len() > MAX_LABEL_LEN {
            Err(Error::LabelTooLong)
        } else {
            Ok(Self::from_unchecked(octets))
        }
    }
}

impl Deref for LabelBuf {
    type Target = Label;

    fn deref(&self) -> &Self::Target {
        Label::from_unchecked(&self.octets)
    }
}

impl Borrow<Label> for LabelBuf {
    fn borrow(&self) -> &Label {
        self.deref()
    }
}

impl fmt::Display for LabelBuf {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.deref().fmt(f)
    }
}

impl fmt::Debug for LabelBuf {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "\"{}\"", self.deref())
    }
}

// For use in HashMaps, Eq and Hash must be the same as for the
// corresponding Label.
impl PartialEq for LabelBuf {
    fn eq(&self, other: &Self) -> bool {
        self.deref() == other.deref()
    }
}

impl Eq for LabelBuf {}

impl PartialOrd for LabelBuf {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for LabelBuf {
    fn cmp(&self, other: &Self) -> Ordering {
        self.deref().cmp(other.deref())
    }
}

impl Hash for LabelBuf {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.deref().hash(state)
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use std::collections::hash_map::DefaultHasher;

    use super::*;

    fn label(octets: &[u8]) -> &Label {
        <&Label>::try_from(octets).unwrap()
    }

    #[test]
    fn try_from_checks_lengths() {
        let octets = [0; MAX_LABEL_LEN + 1];
        for i in 0..=MAX_LABEL_LEN {
            <&Label>::try_from(&octets[0..i]).unwrap();
            LabelBuf::try_from(&octets[0..i]).unwrap();
        }
        assert_eq!(<&Label>::try_from(&octets[..]), Err(Error::LabelTooLong));
        assert!(LabelBuf::try_from(&octets[..]).is_err());
    }

    #[test]
    fn asterisk_is_asterisk() {
        assert!(Label::asterisk().is_asterisk());
        assert!(!label(b"x").is_asterisk());
    }

    #[test]
    fn null_is_null() {
        assert!(Label::null().is_null());
    }

    #[test]
    fn eq_and_hash_are_case_insensitive() {
        let uppercase = label(b"EXAMPLE");
        let lowercase = label(b"example");
        assert_eq!(uppercase, lowercase);

        let hash = |l: &Label| {
            let mut hasher = DefaultHasher::new();
            l.hash(&mut hasher);
            hasher.finish()
        };
        assert_eq!(hash(uppercase), hash(lowercase));
    }

    #[test]
    fn labelbuf_hash_matches_label_hash() {
        // The hashes need to match so that LabelBufs can be HashMap
        // keys looked up by &Label.
        let buf = LabelBuf::try_from(&b"label"[..]).unwrap();
        let borrowed: &Label = buf.borrow();

        let mut hasher = DefaultHasher::new();
        buf.hash(&mut hasher);
        let buf_hash = hasher.finish();
        let mut hasher = DefaultHasher::new();
        borrowed.hash(&mut hasher);
        assert_eq!(buf_hash, hasher.finish());
    }

    #[test]
    fn ord_works() {
        let ordered: Vec<&Label> = vec![
            label(b"exam"),
            label(b"example"),
            label(b"examples"),
            label(b"zed"),
        ];
        for (i, li) in ordered.iter().enumerate() {
            for (j, lj) in ordered.iter().enumerate() {
                assert_eq!(i.cmp(&j), li.cmp(lj));
            }
        }
        assert_eq!(label(b"eXaMpLe").cmp(label(b"example")), Ordering::Equal);
    }

    #[test]
    fn display_escaping_works() {
        assert_eq!(label(b"\x00\\.a").to_string(), "\\000\\\\\\.a");
    }
}
