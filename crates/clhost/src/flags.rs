//! Keyword <-> native code tables for the configuration values the core
//! passes through to the driver.

use crate::error::ClError;
use bitflags::{bitflags, Flags};
use std::fmt;
use std::str::FromStr;

/// Keyword spellings of a flag set's native codes.
pub trait Keywords: Flags<Bits = u64> + Copy + 'static {
    /// Name used in parse errors.
    const KIND: &'static str;
    /// `(keyword, code)` pairs. A zero code names the empty set.
    const TABLE: &'static [(&'static str, u64)];

    /// Native code for a single keyword.
    #[must_use]
    fn code(keyword: &str) -> Option<u64> {
        Self::TABLE
            .iter()
            .find(|(k, _)| *k == keyword)
            .map(|(_, bit)| *bit)
    }

    /// Keywords of every flag set in `self`.
    #[must_use]
    fn keywords(self) -> Vec<&'static str> {
        let bits = self.bits();
        Self::TABLE
            .iter()
            .filter(|(_, bit)| if bits == 0 { *bit == 0 } else { *bit != 0 && bits & *bit == *bit })
            .map(|(k, _)| *k)
            .collect()
    }
}

/// Parses a comma or whitespace separated keyword list.
fn parse_keywords<F: Keywords>(s: &str) -> Result<F, ClError> {
    s.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|k| !k.is_empty())
        .try_fold(F::empty(), |acc, k| {
            F::code(k)
                .map(|bit| F::from_bits_retain(acc.bits() | bit))
                .ok_or_else(|| ClError::invalid(format!("unknown {} keyword `{k}`", F::KIND)))
        })
}

macro_rules! keyword_io {
    ($($name:ident),+) => {$(
        impl FromStr for $name {
            type Err = ClError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                parse_keywords(s)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.keywords().join(","))
            }
        }
    )+};
}

bitflags! {
    /// Command queue creation properties. The empty set is an in-order queue.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct QueueProperties: u64 {
        const OUT_OF_ORDER = 1;
        const PROFILING = 2;
    }

    /// Memory object allocation flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MemFlags: u64 {
        const READ_WRITE = 1;
        const WRITE_ONLY = 2;
        const READ_ONLY = 4;
        const USE_HOST_PTR = 8;
        const ALLOC_HOST_PTR = 16;
        const COPY_HOST_PTR = 32;
        const HOST_WRITE_ONLY = 128;
        const HOST_READ_ONLY = 256;
        const HOST_NO_ACCESS = 512;
    }

    /// Access requested when mapping a memory object into host memory.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MapAccess: u64 {
        const READ = 1;
        const WRITE = 2;
        const WRITE_INVALIDATE_REGION = 4;
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
    }
}

impl QueueProperties {
    pub const IN_ORDER: Self = Self::empty();

    #[must_use]
    pub const fn is_out_of_order(self) -> bool {
        self.contains(Self::OUT_OF_ORDER)
    }
}

impl Default for QueueProperties {
    fn default() -> Self {
        Self::IN_ORDER
    }
}

impl Keywords for QueueProperties {
    const KIND: &'static str = "QueueProperties";
    const TABLE: &'static [(&'static str, u64)] = &[("in-order", 0), ("out-of-order", 1), ("profiling", 2)];
}

impl Keywords for MemFlags {
    const KIND: &'static str = "MemFlags";
    const TABLE: &'static [(&'static str, u64)] = &[
        ("read-write", 1),
        ("write-only", 2),
        ("read-only", 4),
        ("use-host-ptr", 8),
        ("alloc-host-ptr", 16),
        ("copy-host-ptr", 32),
        ("host-write-only", 128),
        ("host-read-only", 256),
        ("host-no-access", 512),
    ];
}

impl Keywords for MapAccess {
    const KIND: &'static str = "MapAccess";
    const TABLE: &'static [(&'static str, u64)] = &[("read", 1), ("write", 2), ("write-invalidate-region", 4)];
}

keyword_io!(QueueProperties, MemFlags, MapAccess);

/// Device category used when enumerating a platform's devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DeviceType {
    Default,
    Cpu,
    Gpu,
    Accelerator,
    Custom,
    #[default]
    All,
}

impl DeviceType {
    const TABLE: [(Self, &'static str, u64); 6] = [
        (Self::Default, "default", 1),
        (Self::Cpu, "cpu", 2),
        (Self::Gpu, "gpu", 4),
        (Self::Accelerator, "accelerator", 8),
        (Self::Custom, "custom", 16),
        (Self::All, "all", 0xFFFF_FFFF),
    ];

    #[must_use]
    pub fn code(self) -> u64 {
        Self::TABLE
            .iter()
            .find(|(t, _, _)| *t == self)
            .map_or(0, |(_, _, code)| *code)
    }

    /// Decodes a single-category device type code as reported by a device.
    #[must_use]
    pub fn from_code(code: u64) -> Option<Self> {
        Self::TABLE
            .iter()
            .find(|(_, _, c)| *c == code)
            .map(|(t, _, _)| *t)
    }

    #[must_use]
    pub fn keyword(self) -> &'static str {
        Self::TABLE
            .iter()
            .find(|(t, _, _)| *t == self)
            .map_or("all", |(_, k, _)| *k)
    }

    /// `true` when a device of category `kind` is selected by `self`.
    #[must_use]
    pub fn selects(self, kind: Self) -> bool {
        match self {
            Self::All | Self::Default => true,
            other => other == kind,
        }
    }
}

impl FromStr for DeviceType {
    type Err = ClError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::TABLE
            .iter()
            .find(|(_, k, _)| *k == s)
            .map(|(t, _, _)| *t)
            .ok_or_else(|| ClError::invalid(format!("unknown device type `{s}`")))
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_keywords_round_trip_to_codes() {
        let props: QueueProperties = "out-of-order, profiling".parse().unwrap();
        assert_eq!(props.bits(), 3);
        assert!(props.is_out_of_order());
        assert_eq!(props.to_string(), "out-of-order,profiling");
        assert_eq!("".parse::<QueueProperties>().unwrap(), QueueProperties::IN_ORDER);
        assert_eq!("in-order".parse::<QueueProperties>().unwrap(), QueueProperties::IN_ORDER);
        assert_eq!(QueueProperties::IN_ORDER.to_string(), "in-order");
    }

    #[test]
    fn unknown_keyword_is_rejected() {
        let err = "read-write,bogus".parse::<MemFlags>().unwrap_err();
        assert!(err.to_string().contains("bogus"));
    }

    #[test]
    fn mem_flag_codes_match_native_values() {
        assert_eq!(MemFlags::code("read-only"), Some(4));
        assert_eq!(MemFlags::code("host-no-access"), Some(512));
        let flags = MemFlags::READ_WRITE | MemFlags::COPY_HOST_PTR;
        assert!(flags.contains(MemFlags::COPY_HOST_PTR));
        assert_eq!(flags.keywords(), vec!["read-write", "copy-host-ptr"]);
    }

    #[test]
    fn map_access_read_write_is_union() {
        assert_eq!(MapAccess::READ_WRITE.bits(), 3);
        assert_eq!("read write".parse::<MapAccess>().unwrap(), MapAccess::READ_WRITE);
        assert_eq!(MapAccess::READ_WRITE.to_string(), "read,write");
    }

    #[test]
    fn unknown_bits_are_outside_the_queue_property_set() {
        assert_eq!(QueueProperties::from_bits(8), None);
        assert!(!QueueProperties::all().contains(QueueProperties::from_bits_retain(8)));
        assert_eq!(QueueProperties::default(), QueueProperties::IN_ORDER);
    }

    #[test]
    fn device_type_selection() {
        assert_eq!("gpu".parse::<DeviceType>().unwrap(), DeviceType::Gpu);
        assert_eq!(DeviceType::All.code(), 0xFFFF_FFFF);
        assert_eq!(DeviceType::from_code(2), Some(DeviceType::Cpu));
        assert!(DeviceType::All.selects(DeviceType::Accelerator));
        assert!(!DeviceType::Gpu.selects(DeviceType::Cpu));
    }
}
