// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Feature flag bitmask.
//!
//! Bit values match the host's published hook constants so masks can be
//! exchanged numerically.

use std::fmt;
use std::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Not, Sub};
use std::str::FromStr;

use thiserror::Error;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct FeatureFlagSet(u32);

impl FeatureFlagSet {
    pub const NONE: Self = Self(0);
    pub const TCP: Self = Self(1 << 1);
    pub const UDP: Self = Self(1 << 2);
    pub const UNIX: Self = Self(1 << 3);
    pub const UDG: Self = Self(1 << 4);
    pub const SSL: Self = Self(1 << 5);
    pub const TLS: Self = Self(1 << 6);
    pub const STREAM_FUNCTION: Self = Self(1 << 7);
    pub const FILE: Self = Self(1 << 8);
    pub const SLEEP: Self = Self(1 << 9);
    pub const PROC: Self = Self(1 << 10);
    /// Script-level HTTP client (companion routines).
    pub const HTTP_SCRIPT: Self = Self(1 << 11);
    /// Native HTTP client.
    pub const HTTP_NATIVE: Self = Self(1 << 12);
    pub const BLOCKING_FUNCTION: Self = Self(1 << 13);
    pub const SOCKETS: Self = Self(1 << 14);
    pub const STDIO: Self = Self(1 << 15);
    pub const PDO_PGSQL: Self = Self(1 << 16);
    pub const PDO_ODBC: Self = Self(1 << 17);
    pub const PDO_ORACLE: Self = Self(1 << 18);
    pub const PDO_SQLITE: Self = Self(1 << 19);

    pub const TRANSPORTS: Self =
        Self(Self::TCP.0 | Self::UDP.0 | Self::UNIX.0 | Self::UDG.0 | Self::SSL.0 | Self::TLS.0);
    pub const STREAM_OPS: Self = Self(Self::FILE.0 | Self::STDIO.0);
    /// Bits whose hooks mutate process-wide state.
    pub const SHARED: Self = Self(Self::TRANSPORTS.0 | Self::STREAM_OPS.0);
    pub const DRIVERS: Self =
        Self(Self::PDO_PGSQL.0 | Self::PDO_ODBC.0 | Self::PDO_ORACLE.0 | Self::PDO_SQLITE.0);
    pub const KNOWN: Self = Self((1 << 20) - 2);
    /// Everything except the script-level HTTP client, which conflicts
    /// with the native one.
    pub const ALL: Self = Self(Self::KNOWN.0 & !Self::HTTP_SCRIPT.0);

    /// Named single bits, in bit order.
    pub const NAMED: &'static [(&'static str, FeatureFlagSet)] = &[
        ("tcp", Self::TCP),
        ("udp", Self::UDP),
        ("unix", Self::UNIX),
        ("udg", Self::UDG),
        ("ssl", Self::SSL),
        ("tls", Self::TLS),
        ("stream_function", Self::STREAM_FUNCTION),
        ("file", Self::FILE),
        ("sleep", Self::SLEEP),
        ("proc", Self::PROC),
        ("curl", Self::HTTP_SCRIPT),
        ("native_curl", Self::HTTP_NATIVE),
        ("blocking_function", Self::BLOCKING_FUNCTION),
        ("sockets", Self::SOCKETS),
        ("stdio", Self::STDIO),
        ("pdo_pgsql", Self::PDO_PGSQL),
        ("pdo_odbc", Self::PDO_ODBC),
        ("pdo_oracle", Self::PDO_ORACLE),
        ("pdo_sqlite", Self::PDO_SQLITE),
    ];

    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Keep only known bits.
    pub const fn from_bits_truncate(bits: u32) -> Self {
        Self(bits & Self::KNOWN.0)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    /// Name of a single known bit.
    pub fn name(self) -> Option<&'static str> {
        Self::NAMED.iter().find(|(_, f)| *f == self).map(|(n, _)| *n)
    }

    pub fn by_name(name: &str) -> Option<Self> {
        if name.eq_ignore_ascii_case("all") {
            return Some(Self::ALL);
        }
        Self::NAMED
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, f)| *f)
    }

    /// Single-bit members, lowest first.
    pub fn iter(self) -> impl Iterator<Item = FeatureFlagSet> {
        Self::NAMED
            .iter()
            .map(|(_, f)| *f)
            .filter(move |f| self.contains(*f))
    }
}

impl BitOr for FeatureFlagSet {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for FeatureFlagSet {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for FeatureFlagSet {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl BitAndAssign for FeatureFlagSet {
    fn bitand_assign(&mut self, rhs: Self) {
        self.0 &= rhs.0;
    }
}

impl Not for FeatureFlagSet {
    type Output = Self;
    fn not(self) -> Self {
        Self(!self.0 & Self::KNOWN.0)
    }
}

impl Sub for FeatureFlagSet {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self(self.0 & !rhs.0)
    }
}

impl fmt::Debug for FeatureFlagSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FeatureFlagSet({})", self)
    }
}

impl fmt::Display for FeatureFlagSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "none");
        }
        let mut first = true;
        for flag in self.iter() {
            if !first {
                write!(f, ",")?;
            }
            first = false;
            write!(f, "{}", flag.name().unwrap_or("?"))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown hook flag `{0}`")]
pub struct ParseFlagsError(pub String);

impl FromStr for FeatureFlagSet {
    type Err = ParseFlagsError;

    /// Accepts a number (decimal or `0x` hex) or a comma/pipe separated
    /// list of flag names. `none` and the empty string mean no flags.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s.eq_ignore_ascii_case("none") {
            return Ok(Self::NONE);
        }
        let numeric = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some(hex) => u32::from_str_radix(hex, 16).ok(),
            None => s.parse::<u32>().ok(),
        };
        if let Some(bits) = numeric {
            return Ok(Self::from_bits_truncate(bits));
        }
        let mut set = Self::NONE;
        for part in s.split([',', '|']) {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            set |= Self::by_name(part).ok_or_else(|| ParseFlagsError(part.to_string()))?;
        }
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bit_values_match_published_constants() {
        assert_eq!(FeatureFlagSet::TCP.bits(), 2);
        assert_eq!(FeatureFlagSet::HTTP_SCRIPT.bits(), 2048);
        assert_eq!(FeatureFlagSet::PDO_SQLITE.bits(), 1 << 19);
        assert!(!FeatureFlagSet::ALL.contains(FeatureFlagSet::HTTP_SCRIPT));
        assert!(FeatureFlagSet::ALL.contains(FeatureFlagSet::HTTP_NATIVE));
    }

    #[test]
    fn every_known_bit_is_named() {
        let named = FeatureFlagSet::NAMED
            .iter()
            .fold(FeatureFlagSet::NONE, |acc, (_, f)| acc | *f);
        assert_eq!(named, FeatureFlagSet::KNOWN);
        for (name, flag) in FeatureFlagSet::NAMED {
            assert_eq!(flag.bits().count_ones(), 1, "{name}");
            assert_eq!(flag.name(), Some(*name));
        }
    }

    #[test]
    fn parse_names_and_numbers() {
        let set: FeatureFlagSet = "tcp, sleep|file".parse().unwrap();
        assert_eq!(set, FeatureFlagSet::TCP | FeatureFlagSet::SLEEP | FeatureFlagSet::FILE);
        assert_eq!("0x2".parse::<FeatureFlagSet>().unwrap(), FeatureFlagSet::TCP);
        assert_eq!("512".parse::<FeatureFlagSet>().unwrap(), FeatureFlagSet::SLEEP);
        assert_eq!("ALL".parse::<FeatureFlagSet>().unwrap(), FeatureFlagSet::ALL);
        assert_eq!("none".parse::<FeatureFlagSet>().unwrap(), FeatureFlagSet::NONE);
        assert_eq!(
            "tcp,bogus".parse::<FeatureFlagSet>(),
            Err(ParseFlagsError("bogus".into()))
        );
    }

    #[test]
    fn unknown_numeric_bits_are_dropped() {
        let set = FeatureFlagSet::from_bits_truncate(u32::MAX);
        assert_eq!(set, FeatureFlagSet::KNOWN);
        assert_eq!(!FeatureFlagSet::NONE, FeatureFlagSet::KNOWN);
    }

    #[test]
    fn display_round_trips() {
        let set = FeatureFlagSet::UDP | FeatureFlagSet::HTTP_NATIVE;
        assert_eq!(set.to_string(), "udp,native_curl");
        assert_eq!(set.to_string().parse::<FeatureFlagSet>().unwrap(), set);
        assert_eq!(FeatureFlagSet::NONE.to_string(), "none");
    }
}
