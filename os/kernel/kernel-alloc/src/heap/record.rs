//! Allocation records.
//!
//! Every zone keeps a fixed table of records, each describing one span of the
//! zone's data pages by offset and size. Tiny zones pack many small records
//! into the table; all other classes use fewer, wider ones.

/// State of one record.
///
/// ```text
///  Unused ──split──▶ Free ──allocate──▶ Used
///    ▲                 ▲                  │
///    └────merge────────┴───────free───────┘
/// ```
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RecordKind {
    Free = 0,
    Used = 1,
    Unused = 2,
}

/// Common view of both record layouts.
pub(crate) trait Record: Copy {
    /// Largest span a single record can describe.
    const MAX_SIZE: u32;

    fn new(kind: RecordKind, size: u32, offset: u32) -> Self;
    fn kind(&self) -> RecordKind;
    fn size(&self) -> u32;
    fn offset(&self) -> u32;

    #[inline]
    fn unused() -> Self {
        Self::new(RecordKind::Unused, 0, 0)
    }

    #[inline]
    fn is(&self, kind: RecordKind) -> bool {
        self.kind() == kind
    }
}

/// Record of a tiny zone: at most 255 bytes at a 16-bit offset.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct TinyRecord {
    kind: RecordKind,
    size: u8,
    offset: u16,
}

impl Record for TinyRecord {
    const MAX_SIZE: u32 = u8::MAX as u32;

    #[allow(clippy::cast_possible_truncation)]
    fn new(kind: RecordKind, size: u32, offset: u32) -> Self {
        debug_assert!(size <= Self::MAX_SIZE && offset <= u32::from(u16::MAX));
        Self {
            kind,
            size: size as u8,
            offset: offset as u16,
        }
    }

    fn kind(&self) -> RecordKind {
        self.kind
    }

    fn size(&self) -> u32 {
        self.size.into()
    }

    fn offset(&self) -> u32 {
        self.offset.into()
    }
}

/// Record of a small, medium or large zone.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct GenericRecord {
    kind: RecordKind,
    size: u32,
    offset: u32,
}

impl Record for GenericRecord {
    const MAX_SIZE: u32 = u32::MAX;

    fn new(kind: RecordKind, size: u32, offset: u32) -> Self {
        Self { kind, size, offset }
    }

    fn kind(&self) -> RecordKind {
        self.kind
    }

    fn size(&self) -> u32 {
        self.size
    }

    fn offset(&self) -> u32 {
        self.offset
    }
}

/// Records in a tiny zone's table.
pub(crate) const TINY_RECORDS: usize = 1013;

/// Records in every other zone's table.
pub(crate) const GENERIC_RECORDS: usize = 337;

/// The record table of one zone; the layout depends on the size class.
#[repr(u32)]
pub(crate) enum Records {
    Tiny([TinyRecord; TINY_RECORDS]),
    Generic([GenericRecord; GENERIC_RECORDS]),
}

/// A copy of one record, for diagnostics.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RecordInfo {
    pub kind: RecordKind,
    pub size: u32,
    /// Offset from the start of the zone's data pages.
    pub offset: u32,
}

impl RecordInfo {
    pub(crate) fn of<R: Record>(record: &R) -> Self {
        Self {
            kind: record.kind(),
            size: record.size(),
            offset: record.offset(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_layouts() {
        assert_eq!(size_of::<TinyRecord>(), 4);
        assert_eq!(size_of::<GenericRecord>(), 12);
    }

    #[test]
    fn tiny_records_keep_their_fields() {
        let r = TinyRecord::new(RecordKind::Used, 255, 4080);
        assert_eq!((r.kind(), r.size(), r.offset()), (RecordKind::Used, 255, 4080));
        assert!(TinyRecord::unused().is(RecordKind::Unused));
    }
}
