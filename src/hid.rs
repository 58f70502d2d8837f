// SPDX-License-Identifier: MIT

//! Decoding of the short items that make up a HID Report Descriptor byte
//! stream. This module splits the stream into typed items, one
//! [`LocatedItem`] per short item; interpretation of the items is left to
//! the parser in the crate root.
//!
//! In this document and unless stated otherwise, a reference to "Section a.b.c" refers to the
//! [HID Device Class Definition for HID 1.11](https://www.usb.org/document-library/device-class-definition-hid-111).
//!
//! ```
//! # use hidpreparse::hid::*;
//! # fn dump(bytes: &[u8]) -> Result<(), HidError> {
//! for located in ItemReader::new(bytes) {
//!     let located = located?;
//!     match located.item {
//!         ItemType::Main(MainItem::Input(_flags)) => {
//!             println!("Input item at offset {:02x}", located.offset)
//!         }
//!         _ => {}
//!     }
//! }
//! # Ok(())
//! # }
//! ```

use crate::types::*;

use thiserror::Error;

/// Convenience function to extract a single bit as bool from a value
fn bit(bits: u32, bit: u8) -> bool {
    assert!(bit < 32);
    bits & (1 << bit) != 0
}

/// The prefix byte reserved for long items, see Section 6.2.2.3. No long
/// item tags are defined by the protocol and this crate does not decode
/// them.
pub(crate) const LONG_ITEM_PREFIX: u8 = 0xfe;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum HidError {
    #[error("item at offset {offset} requires {needed} data bytes, {available} available")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },
    #[error("long item at offset {offset} is not supported")]
    LongItem { offset: usize },
    #[error("reserved item type in prefix {prefix:#04x} at offset {offset}")]
    ReservedType { offset: usize, prefix: u8 },
    #[error("unknown item tag in prefix {prefix:#04x} at offset {offset}")]
    UnknownTag { offset: usize, prefix: u8 },
}

type Result<T> = std::result::Result<T, HidError>;

/// One item value extracted from the 0, 1, 2 or 4 (little endian) data
/// bytes of a short item, readable both as the raw unsigned value and as
/// the sign-extended reinterpretation of the same bytes.
///
/// Which of the two readings applies depends on the item: logical and
/// physical bounds are signed, everything else is unsigned.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct HidValue {
    unsigned: u32,
    signed: i32,
}

impl HidValue {
    fn from_le_bytes(bytes: &[u8]) -> HidValue {
        match bytes.len() {
            0 => HidValue::default(),
            1 => HidValue {
                unsigned: u32::from(bytes[0]),
                signed: i32::from(bytes[0] as i8),
            },
            2 => {
                let v = u16::from_le_bytes(bytes[0..2].try_into().unwrap());
                HidValue {
                    unsigned: u32::from(v),
                    signed: i32::from(v as i16),
                }
            }
            4 => {
                let v = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
                HidValue {
                    unsigned: v,
                    signed: v as i32,
                }
            }
            n => panic!("Size {n} cannot happen"),
        }
    }

    /// The raw little-endian value, zero for items without data bytes.
    pub(crate) fn unsigned(&self) -> u32 {
        self.unsigned
    }

    /// The sign-extended reinterpretation of the same bytes.
    pub(crate) fn signed(&self) -> i32 {
        self.signed
    }
}

/// The data-field flags of an Input, Output or Feature item, see Section
/// 6.2.2.5. This wraps the raw item value; each flag pair is exposed
/// through a pair of accessors.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MainDataFlags(u32);

impl MainDataFlags {
    /// The raw flag bits as found in the descriptor.
    pub fn bits(&self) -> u32 {
        self.0
    }

    /// True if the field is a static read-only value and can usually be
    /// ignored, see Section 6.2.2.4.
    ///
    /// Mutually exclusive with [MainDataFlags::is_data].
    pub fn is_constant(&self) -> bool {
        bit(self.0, 0)
    }

    /// True if the field carries data.
    pub fn is_data(&self) -> bool {
        !self.is_constant()
    }

    /// True if each usage maps to its own bit-packed slot.
    ///
    /// Mutually exclusive with [MainDataFlags::is_array].
    pub fn is_variable(&self) -> bool {
        bit(self.0, 1)
    }

    /// True if one report slot selects from the usage set, see Section
    /// 6.2.2.5 on array items.
    pub fn is_array(&self) -> bool {
        !self.is_variable()
    }

    /// True if the data is relative to the value of a previous report.
    ///
    /// Mutually exclusive with [MainDataFlags::is_absolute].
    pub fn is_relative(&self) -> bool {
        bit(self.0, 2)
    }

    /// True if the data is absolute.
    pub fn is_absolute(&self) -> bool {
        !self.is_relative()
    }

    /// True if the data wraps around at the logical minimum/maximum.
    pub fn wraps(&self) -> bool {
        bit(self.0, 3)
    }

    /// True if the data was pre-processed on the device and the logical
    /// range is not linear.
    pub fn is_nonlinear(&self) -> bool {
        bit(self.0, 4)
    }

    /// True if the control does not return to a preferred state when the
    /// user stops interacting with it.
    pub fn has_no_preferred_state(&self) -> bool {
        bit(self.0, 5)
    }

    /// True if the control has a null state in which it does not send
    /// meaningful data.
    pub fn has_null_state(&self) -> bool {
        bit(self.0, 6)
    }

    /// True if the control value should be changed by the host. Reserved
    /// on Input items.
    pub fn is_volatile(&self) -> bool {
        bit(self.0, 7)
    }

    /// True if the field emits a fixed size stream of bytes.
    pub fn is_buffered_bytes(&self) -> bool {
        bit(self.0, 8)
    }
}

impl From<u32> for MainDataFlags {
    fn from(bits: u32) -> MainDataFlags {
        MainDataFlags(bits)
    }
}

/// The type of a Collection item, see Section 6.2.2.6.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CollectionKind {
    Physical,
    Application,
    Logical,
    Report,
    NamedArray,
    UsageSwitch,
    UsageModifier,
    Reserved { value: u8 },
    VendorDefined { value: u8 },
}

impl From<u8> for CollectionKind {
    fn from(v: u8) -> CollectionKind {
        match v {
            0x00 => CollectionKind::Physical,
            0x01 => CollectionKind::Application,
            0x02 => CollectionKind::Logical,
            0x03 => CollectionKind::Report,
            0x04 => CollectionKind::NamedArray,
            0x05 => CollectionKind::UsageSwitch,
            0x06 => CollectionKind::UsageModifier,
            value @ 0x07..=0x7f => CollectionKind::Reserved { value },
            value @ 0x80..=0xff => CollectionKind::VendorDefined { value },
        }
    }
}

impl From<CollectionKind> for u8 {
    fn from(c: CollectionKind) -> u8 {
        match c {
            CollectionKind::Physical => 0x00,
            CollectionKind::Application => 0x01,
            CollectionKind::Logical => 0x02,
            CollectionKind::Report => 0x03,
            CollectionKind::NamedArray => 0x04,
            CollectionKind::UsageSwitch => 0x05,
            CollectionKind::UsageModifier => 0x06,
            CollectionKind::Reserved { value } => value,
            CollectionKind::VendorDefined { value } => value,
        }
    }
}

/// See Section 6.2.2.4. Main items either create data fields within a
/// report (Input, Output, Feature) or group fields into collections.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MainItem {
    Input(MainDataFlags),
    Output(MainDataFlags),
    Feature(MainDataFlags),
    Collection(CollectionKind),
    EndCollection,
}

/// See Section 6.2.2.7, a global item applies to all subsequently defined
/// fields until overridden by another global item or restored by Pop.
///
/// Logical and physical bounds and the unit exponent carry the
/// sign-extended item value, everything else the raw value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GlobalItem {
    UsagePage(UsagePage),
    LogicalMinimum(i32),
    LogicalMaximum(i32),
    PhysicalMinimum(i32),
    PhysicalMaximum(i32),
    UnitExponent(i32),
    Unit(u32),
    ReportSize(u32),
    ReportId(u32),
    ReportCount(u32),
    Push,
    Pop,
}

/// See Section 6.2.2.8, a local item applies to the next Main item only.
///
/// A usage carried in a local item may include a Usage Page in its upper
/// 16 bits; a zero page means the current global page applies, represented
/// here as `page: None`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LocalItem {
    Usage { page: Option<UsagePage>, id: UsageId },
    UsageMinimum { page: Option<UsagePage>, id: UsageId },
    UsageMaximum { page: Option<UsagePage>, id: UsageId },
    DesignatorIndex(u32),
    DesignatorMinimum(u32),
    DesignatorMaximum(u32),
    StringIndex(u32),
    StringMinimum(u32),
    StringMaximum(u32),
    Delimiter(u32),
}

/// A short item is one of [MainItem], [GlobalItem] or [LocalItem]. The
/// reserved item type and the long item prefix are decoding errors, the
/// parser has no use for either.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ItemType {
    Main(MainItem),
    Global(GlobalItem),
    Local(LocalItem),
}

fn split_usage(value: HidValue) -> (Option<UsagePage>, UsageId) {
    let raw = value.unsigned();
    let page = (raw >> 16) as u16;
    let id = UsageId(raw as u16);
    if page != 0 {
        (Some(UsagePage(page)), id)
    } else {
        (None, id)
    }
}

impl MainItem {
    fn decode(prefix: u8, value: HidValue, offset: usize) -> Result<MainItem> {
        match prefix >> 4 {
            0x8 => Ok(MainItem::Input(MainDataFlags(value.unsigned()))),
            0x9 => Ok(MainItem::Output(MainDataFlags(value.unsigned()))),
            0xa => Ok(MainItem::Collection(CollectionKind::from(
                value.unsigned() as u8
            ))),
            0xb => Ok(MainItem::Feature(MainDataFlags(value.unsigned()))),
            0xc => Ok(MainItem::EndCollection),
            _ => Err(HidError::UnknownTag { offset, prefix }),
        }
    }
}

impl GlobalItem {
    fn decode(prefix: u8, value: HidValue, offset: usize) -> Result<GlobalItem> {
        match prefix >> 4 {
            0x0 => Ok(GlobalItem::UsagePage(UsagePage(value.unsigned() as u16))),
            0x1 => Ok(GlobalItem::LogicalMinimum(value.signed())),
            0x2 => Ok(GlobalItem::LogicalMaximum(value.signed())),
            0x3 => Ok(GlobalItem::PhysicalMinimum(value.signed())),
            0x4 => Ok(GlobalItem::PhysicalMaximum(value.signed())),
            0x5 => Ok(GlobalItem::UnitExponent(value.signed())),
            0x6 => Ok(GlobalItem::Unit(value.unsigned())),
            0x7 => Ok(GlobalItem::ReportSize(value.unsigned())),
            0x8 => Ok(GlobalItem::ReportId(value.unsigned())),
            0x9 => Ok(GlobalItem::ReportCount(value.unsigned())),
            0xa => Ok(GlobalItem::Push),
            0xb => Ok(GlobalItem::Pop),
            _ => Err(HidError::UnknownTag { offset, prefix }),
        }
    }
}

impl LocalItem {
    fn decode(prefix: u8, value: HidValue, offset: usize) -> Result<LocalItem> {
        match prefix >> 4 {
            0x0 => {
                let (page, id) = split_usage(value);
                Ok(LocalItem::Usage { page, id })
            }
            0x1 => {
                let (page, id) = split_usage(value);
                Ok(LocalItem::UsageMinimum { page, id })
            }
            0x2 => {
                let (page, id) = split_usage(value);
                Ok(LocalItem::UsageMaximum { page, id })
            }
            0x3 => Ok(LocalItem::DesignatorIndex(value.unsigned())),
            0x4 => Ok(LocalItem::DesignatorMinimum(value.unsigned())),
            0x5 => Ok(LocalItem::DesignatorMaximum(value.unsigned())),
            0x7 => Ok(LocalItem::StringIndex(value.unsigned())),
            0x8 => Ok(LocalItem::StringMinimum(value.unsigned())),
            0x9 => Ok(LocalItem::StringMaximum(value.unsigned())),
            0xa => Ok(LocalItem::Delimiter(value.unsigned())),
            _ => Err(HidError::UnknownTag { offset, prefix }),
        }
    }
}

impl ItemType {
    fn decode(prefix: u8, value: HidValue, offset: usize) -> Result<ItemType> {
        match (prefix >> 2) & 0b11 {
            0 => Ok(ItemType::Main(MainItem::decode(prefix, value, offset)?)),
            1 => Ok(ItemType::Global(GlobalItem::decode(prefix, value, offset)?)),
            2 => Ok(ItemType::Local(LocalItem::decode(prefix, value, offset)?)),
            3 => Err(HidError::ReservedType { offset, prefix }),
            t => panic!("Item type {t} cannot happen"),
        }
    }
}

/// A decoded item together with the descriptor offset its prefix byte was
/// read from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LocatedItem {
    pub offset: usize,
    pub item: ItemType,
}

/// Iterates over the short items of a report descriptor byte stream, see
/// Section 6.2.2.2: a one byte prefix `PPPPTTSS` (tag, type, size code)
/// followed by 0, 1, 2 or 4 little-endian data bytes.
///
/// Iteration stops after the first error; a failed item leaves the
/// remainder of the stream undecodable.
pub struct ItemReader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> ItemReader<'a> {
    pub fn new(bytes: &'a [u8]) -> ItemReader<'a> {
        ItemReader { bytes, offset: 0 }
    }
}

impl Iterator for ItemReader<'_> {
    type Item = Result<LocatedItem>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.bytes.len() {
            return None;
        }
        let offset = self.offset;
        let prefix = self.bytes[offset];
        if prefix == LONG_ITEM_PREFIX {
            self.offset = self.bytes.len();
            return Some(Err(HidError::LongItem { offset }));
        }
        let needed = match prefix & 0b11 {
            0 => 0,
            1 => 1,
            2 => 2,
            _ => 4,
        };
        let available = self.bytes.len() - offset - 1;
        if needed > available {
            self.offset = self.bytes.len();
            return Some(Err(HidError::Truncated {
                offset,
                needed,
                available,
            }));
        }
        let value = HidValue::from_le_bytes(&self.bytes[offset + 1..offset + 1 + needed]);
        match ItemType::decode(prefix, value, offset) {
            Ok(item) => {
                self.offset += 1 + needed;
                Some(Ok(LocatedItem { offset, item }))
            }
            Err(e) => {
                self.offset = self.bytes.len();
                Some(Err(e))
            }
        }
    }
}
