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

//! The 128-bit address keys of the CIDR trees and their canonical
//! owner-name encoding.
//!
//! A policy zone names an IP address or CIDR block with a label
//! sequence under its `rpz-ip` or `rpz-nsip` subdomain:
//!
//! * IPv4: `<prefix>.<o0>.<o1>.<o2>.<o3>`, where `prefix` is between
//!   1 and 32 and `o0` is the *low-order* octet of the address;
//! * IPv6: `<prefix>.<w0>.<w1>...`, where `prefix` is between 1 and
//!   128, the `w`s are hexadecimal 16-bit words with the low-order word
//!   first, and a single label `zz` stands for a run of zero words
//!   bringing the total to eight (the counterpart of `::`).
//!
//! The encoding is bijective: every `(address, prefix)` pair has
//! exactly one accepted label sequence. Decoding therefore re-encodes
//! the key it produced and rejects the owner name if the labels differ,
//! so that the owner of every indexed trigger can be reconstructed
//! bit-exactly from the tree alone.
//!
//! IPv4 addresses are stored in v4-mapped form (`::ffff:a.b.c.d`, with
//! the prefix shifted up by 96), which is what lets one radix tree
//! serve both families.

use std::fmt::{self, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::name::{self, Name};
use crate::util::ascii_hex_digit_to_nibble;

/// The number of bits in an [`IpKey`].
pub const KEY_BITS: u8 = 128;

/// The number of bits in each word of an [`IpKey`].
const WORD_BITS: u8 = 32;

/// The value of the third key word in a v4-mapped key.
const ADDR_V4MAPPED: u32 = 0xffff;

////////////////////////////////////////////////////////////////////////
// IP KEYS                                                            //
////////////////////////////////////////////////////////////////////////

/// A 128-bit address key: four 32-bit words in host byte order, big
/// end first.
#[derive(Clone, Copy, Default, Eq, Hash, PartialEq)]
pub struct IpKey {
    w: [u32; 4],
}

impl IpKey {
    /// Builds the v4-mapped key for an IPv4 address. The corresponding
    /// prefix lengths are shifted up by 96.
    pub fn from_v4(addr: Ipv4Addr) -> Self {
        Self {
            w: [0, 0, ADDR_V4MAPPED, addr.into()],
        }
    }

    /// Builds the key for an IPv6 address.
    pub fn from_v6(addr: Ipv6Addr) -> Self {
        let s = addr.segments();
        let word = |i: usize| (s[2 * i] as u32) << 16 | s[2 * i + 1] as u32;
        Self {
            w: [word(0), word(1), word(2), word(3)],
        }
    }

    /// Builds the key for any IP address.
    pub fn from_addr(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(v4) => Self::from_v4(v4),
            IpAddr::V6(v6) => Self::from_v6(v6),
        }
    }

    /// Returns whether this key together with `prefix` represents a
    /// v4-mapped IPv4 address or block.
    pub fn is_v4(&self, prefix: u8) -> bool {
        prefix >= 96 && self.w[0] == 0 && self.w[1] == 0 && self.w[2] == ADDR_V4MAPPED
    }

    /// Returns bit `n` of the key, counting from the most significant
    /// bit of the first word.
    pub fn bit(&self, n: u8) -> usize {
        debug_assert!(n < KEY_BITS);
        let word = self.w[usize::from(n / WORD_BITS)];
        (word >> (WORD_BITS - 1 - n % WORD_BITS) & 1) as usize
    }

    /// Returns the key with all bits at and past `prefix` cleared.
    pub fn masked(&self, prefix: u8) -> Self {
        let mut w = [0; 4];
        let full_words = usize::from(prefix / WORD_BITS);
        w[..full_words].copy_from_slice(&self.w[..full_words]);
        let partial = prefix % WORD_BITS;
        if partial != 0 {
            w[full_words] = self.w[full_words] & (u32::MAX << (WORD_BITS - partial));
        }
        Self { w }
    }

    /// Returns whether all bits at and past `prefix` are zero.
    pub fn is_masked(&self, prefix: u8) -> bool {
        *self == self.masked(prefix)
    }
}

impl fmt::Debug for IpKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "IpKey({:08x}:{:08x}:{:08x}:{:08x})",
            self.w[0], self.w[1], self.w[2], self.w[3]
        )
    }
}

/// Returns the position of the first bit at which two keys differ,
/// capped at the shorter of the two prefixes. Equivalently: through how
/// many leading bits, at most `min(prefix_a, prefix_b)`, the keys
/// agree.
pub fn diff_bit(a: &IpKey, prefix_a: u8, b: &IpKey, prefix_b: u8) -> u8 {
    let maxbit = prefix_a.min(prefix_b);
    for i in 0..4 {
        let delta = a.w[i] ^ b.w[i];
        if delta != 0 {
            let bit = i as u8 * WORD_BITS + delta.leading_zeros() as u8;
            return bit.min(maxbit);
        }
    }
    maxbit
}

////////////////////////////////////////////////////////////////////////
// DECODING OWNER NAMES                                               //
////////////////////////////////////////////////////////////////////////

/// The reasons an owner name fails to decode into an address key.
/// Such owners are logged and otherwise ignored by the loading paths.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum KeyError {
    /// Not enough labels for a prefix and an address.
    TooShort,

    /// The leading prefix label is not a number in `[1, 128]`.
    BadPrefix,

    /// An IPv4 owner (four dotted-decimal labels) carries a prefix
    /// greater than 32.
    BadV4Prefix,

    /// An IPv4 label is not a decimal number in `[0, 255]`.
    BadOctet,

    /// An IPv6 label is neither `zz` nor a hexadecimal number in
    /// `[0, ffff]`.
    BadWord,

    /// Labels were left over after eight words were assembled.
    TrailingLabels,

    /// The address has bits set beyond the prefix length.
    TooSmallPrefix,

    /// The labels decode, but are not the canonical encoding of the
    /// address they produce.
    NotCanonical,
}

impl fmt::Display for KeyError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::TooShort => f.write_str("too short"),
            Self::BadPrefix => f.write_str("invalid prefix length"),
            Self::BadV4Prefix => f.write_str("invalid IPv4 prefix length"),
            Self::BadOctet => f.write_str("invalid IPv4 octet"),
            Self::BadWord => f.write_str("invalid IPv6 word"),
            Self::TrailingLabels => f.write_str("trailing address labels"),
            Self::TooSmallPrefix => f.write_str("too small prefix length"),
            Self::NotCanonical => f.write_str("not canonical"),
        }
    }
}

impl std::error::Error for KeyError {}

/// Decodes the first `addr_labels` labels of a trigger owner name into
/// an address key and prefix. The caller determines `addr_labels` by
/// stripping the policy zone's `rpz-ip`/`rpz-nsip` subdomain suffix.
pub fn parse_owner(owner: &Name, addr_labels: usize) -> Result<(IpKey, u8), KeyError> {
    if addr_labels < 2 || addr_labels > owner.len() {
        return Err(KeyError::TooShort);
    }
    let prefix_num = parse_dec(owner[0].octets(), 128).ok_or(KeyError::BadPrefix)?;
    if prefix_num == 0 {
        return Err(KeyError::BadPrefix);
    }

    let n_words = addr_labels - 1;
    let has_z = (1..addr_labels).any(|i| owner[i].octets().iter().any(|o| *o == b'z' || *o == b'Z'));

    let mut key = IpKey::default();
    let prefix;
    if n_words == 4 && !has_z {
        // An IPv4 address, "prefix.o0.o1.o2.o3" with the low octet
        // first.
        if prefix_num > 32 {
            return Err(KeyError::BadV4Prefix);
        }
        prefix = prefix_num as u8 + 96;
        key.w[2] = ADDR_V4MAPPED;
        for i in 0..4 {
            let octet = parse_dec(owner[1 + i].octets(), 255).ok_or(KeyError::BadOctet)?;
            key.w[3] |= octet << (8 * i);
        }
    } else {
        // An IPv6 address: hexadecimal 16-bit words with the low word
        // first, and at most one "zz" standing for enough zero words
        // to make eight in all.
        prefix = prefix_num as u8;
        let mut i = 0usize;
        let mut remaining = n_words;
        let mut labels = (1..addr_labels).map(|n| owner[n].octets());
        while remaining > 0 && i < 8 {
            let label = labels.next().unwrap();
            if label.eq_ignore_ascii_case(b"zz") && i <= 6 {
                // Expand the run so that the remaining labels fill the
                // key exactly.
                loop {
                    if i % 2 == 0 {
                        key.w[3 - i / 2] = 0;
                    }
                    i += 1;
                    if remaining + i > 8 {
                        break;
                    }
                }
            } else {
                let word = parse_hex(label).ok_or(KeyError::BadWord)?;
                if i % 2 == 0 {
                    key.w[3 - i / 2] = word;
                } else {
                    key.w[3 - i / 2] |= word << 16;
                }
                i += 1;
            }
            remaining -= 1;
        }
        if remaining > 0 {
            return Err(KeyError::TrailingLabels);
        }
    }

    if !key.is_masked(prefix) {
        return Err(KeyError::TooSmallPrefix);
    }

    // Re-encode and require the identical label sequence, so that
    // every accepted owner name is in canonical form.
    let reencoded = encode_labels(&key, prefix);
    let mut echo = reencoded.split('.');
    for i in 0..addr_labels {
        match echo.next() {
            Some(label) if label.as_bytes().eq_ignore_ascii_case(owner[i].octets()) => (),
            _ => return Err(KeyError::NotCanonical),
        }
    }
    if echo.next().is_some() {
        return Err(KeyError::NotCanonical);
    }

    Ok((key, prefix))
}

fn parse_dec(octets: &[u8], max: u32) -> Option<u32> {
    if octets.is_empty() || octets.len() > 10 {
        return None;
    }
    let mut value: u64 = 0;
    for &octet in octets {
        if !octet.is_ascii_digit() {
            return None;
        }
        value = value * 10 + u64::from(octet - b'0');
    }
    u32::try_from(value).ok().filter(|v| *v <= max)
}

fn parse_hex(octets: &[u8]) -> Option<u32> {
    if octets.is_empty() || octets.len() > 8 {
        return None;
    }
    let mut value: u64 = 0;
    for &octet in octets {
        value = value << 4 | u64::from(ascii_hex_digit_to_nibble(octet)?);
    }
    u32::try_from(value).ok().filter(|v| *v <= 0xffff)
}

////////////////////////////////////////////////////////////////////////
// ENCODING OWNER NAMES                                               //
////////////////////////////////////////////////////////////////////////

/// Encodes an address key and prefix into its canonical owner name.
/// When `base` is given (e.g. the policy zone's `rpz-ip` subdomain),
/// the encoded labels are prepended to it; otherwise the name is
/// rooted directly.
pub fn to_name(key: &IpKey, prefix: u8, base: Option<&Name>) -> Result<Name, name::Error> {
    let labels = encode_labels(key, prefix);
    let text = match base {
        Some(base) if !base.is_root() => format!("{}.{}", labels, base),
        _ => format!("{}.", labels),
    };
    text.parse()
}

/// Produces the canonical label text (dot-separated, no trailing dot)
/// for a key and prefix.
fn encode_labels(key: &IpKey, prefix: u8) -> String {
    let mut text = String::new();
    if key.is_v4(prefix) {
        let v4 = key.w[3];
        write!(
            text,
            "{}.{}.{}.{}.{}",
            prefix - 96,
            v4 & 0xff,
            v4 >> 8 & 0xff,
            v4 >> 16 & 0xff,
            v4 >> 24 & 0xff,
        )
        .unwrap();
    } else {
        // The 16-bit words of the address, low-order first.
        let mut words = [0u32; 8];
        for i in 0..4 {
            words[i * 2] = key.w[3 - i] & 0xffff;
            words[i * 2 + 1] = key.w[3 - i] >> 16 & 0xffff;
        }
        write!(text, "{}", prefix).unwrap();
        let mut zeros = false;
        let mut i = 0;
        while i < 8 {
            if words[i] != 0 || zeros || i >= 7 || words[i + 1] != 0 {
                write!(text, ".{:x}", words[i]).unwrap();
                i += 1;
            } else {
                // "zz" replaces the first run of two or more zero
                // words, and only the first.
                zeros = true;
                text.push_str(".zz");
                i += 2;
                while i < 8 && words[i] == 0 {
                    i += 1;
                }
            }
        }
    }
    text
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////
