// SPDX-License-Identifier: MIT

//! The preparsed representation of a report descriptor: one flat
//! [`ValueCaps`] record per capability, packed into a single
//! position-independent [`PreparsedData`] block that all later report
//! queries are answered from.

use crate::hid::MainDataFlags;
use crate::types::*;
use crate::{ParserError, Pool};

/// Identifies a [PreparsedData] block.
pub(crate) const PREPARSED_MAGIC: u32 = u32::from_le_bytes(*b"HidP");

/// Nominal size of the fixed preparsed header: magic, blob size, top-level
/// usage, the three per-direction index tables and the collection count,
/// padded to pointer alignment.
const HEADER_BYTES: usize = 40;

/// Parser-derived booleans describing one capability. Unlike the raw
/// [MainDataFlags] these reflect how the parser resolved the local item
/// scope, not just the Main item bits.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CapsFlags {
    /// `usage_min`/`usage_max` describe an inclusive range rather than a
    /// single usage.
    pub is_range: bool,
    /// `string_min`/`string_max` describe a range.
    pub is_string_range: bool,
    /// `designator_min`/`designator_max` describe a range.
    pub is_designator_range: bool,
    /// The field reports absolute values.
    pub is_absolute: bool,
    /// The field is constant padding.
    pub is_constant: bool,
    /// The field is a button-like control: one bit wide, or part of an
    /// array.
    pub is_button: bool,
    /// More records of the same array follow this one.
    pub array_has_more: bool,
}

/// One field (or grouped array of fields) within some report.
///
/// A Main item with several usages expands into several records; records
/// belonging to one array share their bit position and have
/// [`CapsFlags::array_has_more`] set on all but the last.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ValueCaps {
    /// The usage page of `usage_min`/`usage_max`.
    pub usage_page: UsagePage,
    /// First usage covered by this record. Equal to `usage_max` for a
    /// single usage.
    pub usage_min: UsageId,
    /// Last usage covered by this record.
    pub usage_max: UsageId,
    /// Report ID of the report this field is part of, zero if the
    /// descriptor declares none.
    pub report_id: ReportId,
    /// Byte offset of the field within its report buffer. Byte 0 always
    /// holds the report ID prefix.
    pub start_byte: u16,
    /// Bit offset within `start_byte`.
    pub start_bit: u8,
    /// Bits per element.
    pub bit_size: u16,
    /// Number of elements.
    pub report_count: u16,
    pub logical_min: i32,
    pub logical_max: i32,
    pub physical_min: i32,
    pub physical_max: i32,
    /// Unit encoding, passed through unmodified.
    pub units: u32,
    /// Unit exponent item value, passed through unmodified.
    pub units_exp: i32,
    /// First data index assigned to this record within its direction.
    pub data_index_min: u16,
    /// Last data index assigned to this record.
    pub data_index_max: u16,
    pub designator_min: u16,
    pub designator_max: u16,
    pub string_min: u16,
    pub string_max: u16,
    /// Index of the enclosing collection in the collection array.
    pub link_collection: u16,
    pub link_usage_page: UsagePage,
    pub link_usage: UsageId,
    /// The raw Main item flags. For collection records this keeps the
    /// collection type byte instead.
    pub bit_field: MainDataFlags,
    pub flags: CapsFlags,
}

impl ValueCaps {
    /// First bit past the end of this capability within its report
    /// buffer.
    pub fn end_bit(&self) -> u32 {
        (u32::from(self.start_byte) * 8 + u32::from(self.start_bit))
            .saturating_add(u32::from(self.bit_size) * u32::from(self.report_count))
    }
}

impl std::fmt::Display for ValueCaps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "rid {} usage {:02x}:{:02x}-{:02x} data {}-{} str {}-{} des {}-{} \
             bit {}.{} size {} count {} col {} ({:02x}:{:02x}) unit {:x} e{:+} \
             log {:+}..{:+} phy {:+}..{:+} field {:#x} {:?}",
            self.report_id,
            u16::from(self.usage_page),
            u16::from(self.usage_min),
            u16::from(self.usage_max),
            self.data_index_min,
            self.data_index_max,
            self.string_min,
            self.string_max,
            self.designator_min,
            self.designator_max,
            self.start_byte,
            self.start_bit,
            self.bit_size,
            self.report_count,
            self.link_collection,
            u16::from(self.link_usage_page),
            u16::from(self.link_usage),
            self.units,
            self.units_exp,
            self.logical_min,
            self.logical_max,
            self.physical_min,
            self.physical_max,
            self.bit_field.bits(),
            self.flags,
        )
    }
}

/// Element index table for one report direction within the capability
/// array.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct DirectionCaps {
    start: u16,
    count: u16,
    end: u16,
    byte_length: u16,
}

/// The finished pieces of a parse, handed over for packing.
pub(crate) struct PreparsedParts<'a> {
    pub usage_page: UsagePage,
    pub usage: UsageId,
    pub byte_lengths: [u16; 3],
    pub values: [&'a [ValueCaps]; 3],
    pub collections: &'a [ValueCaps],
}

/// The preparsed form of a report descriptor: a fixed header plus the
/// input, output, feature and collection capability arrays, concatenated
/// in that order.
///
/// The block is self-contained; all internal references are element
/// indices into the embedded capability array, so the value may be copied
/// and moved freely. Entry point is usually `PreparsedData::try_from(bytes)`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PreparsedData {
    magic: u32,
    usage_page: UsagePage,
    usage: UsageId,
    directions: [DirectionCaps; 3],
    number_link_collection_nodes: u16,
    caps: Box<[ValueCaps]>,
}

impl PreparsedData {
    pub(crate) fn assemble(
        parts: PreparsedParts<'_>,
        pool: &impl Pool,
    ) -> Result<PreparsedData, ParserError> {
        let caps_len = parts.values.iter().map(|v| v.len()).sum::<usize>() + parts.collections.len();
        if caps_len > usize::from(u16::MAX) {
            return Err(ParserError::StackOverflow);
        }

        let mut caps = pool
            .alloc::<ValueCaps>(caps_len)
            .ok_or(ParserError::NoMemory)?;
        let mut directions = [DirectionCaps::default(); 3];
        let mut start = 0u16;
        for direction in ReportDirection::ALL {
            let values = parts.values[direction.index()];
            let count = values.len() as u16;
            directions[direction.index()] = DirectionCaps {
                start,
                count,
                end: start + count,
                byte_length: parts.byte_lengths[direction.index()],
            };
            caps.extend_from_slice(values);
            start += count;
        }
        caps.extend_from_slice(parts.collections);

        Ok(PreparsedData {
            magic: PREPARSED_MAGIC,
            usage_page: parts.usage_page,
            usage: parts.usage,
            directions,
            number_link_collection_nodes: parts.collections.len() as u16,
            caps: caps.into_boxed_slice(),
        })
    }

    /// True if this block carries the preparsed data magic. A
    /// default-constructed block does not.
    pub fn is_valid(&self) -> bool {
        self.magic == PREPARSED_MAGIC
    }

    /// The usage page of the top-level application collection.
    pub fn usage_page(&self) -> UsagePage {
        self.usage_page
    }

    /// The usage of the top-level application collection.
    pub fn usage(&self) -> UsageId {
        self.usage
    }

    /// The capabilities of the given report direction.
    pub fn caps(&self, direction: ReportDirection) -> &[ValueCaps] {
        let d = &self.directions[direction.index()];
        &self.caps[usize::from(d.start)..usize::from(d.end)]
    }

    /// The input report capabilities, or the empty slice if none exist.
    pub fn input_caps(&self) -> &[ValueCaps] {
        self.caps(ReportDirection::Input)
    }

    /// The output report capabilities, or the empty slice if none exist.
    pub fn output_caps(&self) -> &[ValueCaps] {
        self.caps(ReportDirection::Output)
    }

    /// The feature report capabilities, or the empty slice if none exist.
    pub fn feature_caps(&self) -> &[ValueCaps] {
        self.caps(ReportDirection::Feature)
    }

    /// One record per collection, in declaration order. Record 0 is the
    /// top-level application collection; `link_collection` fields index
    /// into this array.
    pub fn collections(&self) -> &[ValueCaps] {
        let feature = &self.directions[ReportDirection::Feature.index()];
        &self.caps[usize::from(feature.end)..]
    }

    pub fn number_link_collection_nodes(&self) -> u16 {
        self.number_link_collection_nodes
    }

    /// The byte length of the longest report of the given direction,
    /// including the report ID prefix byte.
    pub fn report_byte_length(&self, direction: ReportDirection) -> u16 {
        self.directions[direction.index()].byte_length
    }

    /// The nominal size of this block in bytes: the fixed header plus the
    /// embedded capability array.
    pub fn size_in_bytes(&self) -> usize {
        HEADER_BYTES + self.caps.len() * std::mem::size_of::<ValueCaps>()
    }
}
