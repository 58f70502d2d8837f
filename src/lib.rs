// SPDX-License-Identifier: MIT
//
//! This crate parses HID Report Descriptors into *preparsed data*: flat
//! per-capability records with resolved bit positions from which the
//! reports sent by a device can later be interpreted. The descriptor
//! byte stream is a small stack machine (global item state with Push/Pop,
//! per-Main-item local state, nested collections); this crate runs that
//! machine and flattens the result.
//!
//! Entry points are [`DeviceDescription::from_descriptor`] for the
//! per-report-ID summary and `PreparsedData::try_from(bytes)` for the
//! capability records themselves:
//!
//! ```
//! # use hidpreparse::*;
//! let bytes: &[u8] = &[
//!     0x05, 0x01, 0x09, 0x02, 0xa1, 0x01, 0x09, 0x01, 0xa1, 0x00,
//!     0x05, 0x09, 0x19, 0x01, 0x29, 0x03, 0x15, 0x00, 0x25, 0x01,
//!     0x95, 0x03, 0x75, 0x01, 0x81, 0x02, 0x95, 0x01, 0x75, 0x05,
//!     0x81, 0x03, 0xc0, 0xc0,
//! ];
//!
//! let desc = DeviceDescription::from_descriptor(bytes, &HeapPool).unwrap();
//! let collection = desc.collections.first().unwrap();
//! assert_eq!(u16::from(collection.usage_page), 0x01); // Generic Desktop
//! assert_eq!(u16::from(collection.usage), 0x02); // Mouse
//! assert_eq!(collection.input_length, 2); // report ID prefix plus one data byte
//!
//! for report in &desc.report_ids {
//!     println!("Report ID {}: {} input bytes", report.report_id, report.input_length);
//! }
//! ```
//!
//! Byte 0 of every report buffer is reserved for the report ID prefix,
//! also for descriptors that declare no report IDs; all report byte
//! lengths include that byte.
//!
//! In this document and unless stated otherwise, a reference to "Section a.b.c" refers to the
//! [HID Device Class Definition for HID 1.11](https://www.usb.org/document-library/device-class-definition-hid-111).

use log::{debug, log_enabled, trace, warn, Level};
use thiserror::Error;

pub mod hid;
mod preparsed;
pub mod types;

use hid::{
    CollectionKind, GlobalItem, HidError, ItemReader, ItemType, LocalItem, LocatedItem,
    MainDataFlags, MainItem,
};
pub(crate) use preparsed::PreparsedParts;
pub use preparsed::{CapsFlags, PreparsedData, ValueCaps};
pub use types::*;

/// Number of usage slots one Main item can accumulate.
const USAGE_SLOTS: usize = 256;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParserError {
    #[error(transparent)]
    Item(#[from] HidError),
    #[error("usage delimiters are not supported (offset {offset})")]
    DelimiterUnsupported { offset: usize },
    #[error("item stack underflow at offset {offset}")]
    StackUnderflow { offset: usize },
    #[error("capability storage overflow")]
    StackOverflow,
    #[error("more than 256 usages on one main item (offset {offset})")]
    UsageOverflow { offset: usize },
    #[error("allocation failure")]
    NoMemory,
}

type Result<T> = std::result::Result<T, ParserError>;

/// Allocation source for parser output.
///
/// The preparsed data block and the [DeviceDescription] arrays are
/// allocated through the caller's pool so descriptors can be parsed into
/// externally managed memory; parser-private temporaries always use the
/// process heap.
pub trait Pool {
    /// Allocates an empty vector with capacity for `len` elements, or
    /// `None` when the pool is exhausted.
    fn alloc<T>(&self, len: usize) -> Option<Vec<T>>;
}

/// The process heap, the pool to use when no other pool applies.
#[derive(Clone, Copy, Debug, Default)]
pub struct HeapPool;

impl Pool for HeapPool {
    fn alloc<T>(&self, len: usize) -> Option<Vec<T>> {
        let mut vec = Vec::new();
        vec.try_reserve_exact(len).ok()?;
        Some(vec)
    }
}

/// Grows `vec` for `additional` more elements: geometric, starting at 32
/// slots, with a fallible reservation so allocator exhaustion surfaces as
/// an error instead of aborting the process.
fn reserve<T>(vec: &mut Vec<T>, additional: usize) -> Result<()> {
    let needed = vec.len() + additional;
    if needed <= vec.capacity() {
        return Ok(());
    }
    let target = needed.max(if vec.capacity() == 0 {
        32
    } else {
        vec.capacity() * 3 / 2
    });
    vec.try_reserve_exact(target - vec.len())
        .map_err(|_| ParserError::NoMemory)
}

/// The global item subset of the capability snapshot, the part that
/// Push/Pop transfers. See Section 6.2.2.7.
#[derive(Clone, Copy, Debug, Default)]
struct GlobalItems {
    usage_page: UsagePage,
    logical_min: i32,
    logical_max: i32,
    physical_min: i32,
    physical_max: i32,
    units: u32,
    units_exp: i32,
    bit_size: u16,
    report_id: ReportId,
    report_count: u16,
}

impl GlobalItems {
    fn capture(items: &ValueCaps) -> GlobalItems {
        GlobalItems {
            usage_page: items.usage_page,
            logical_min: items.logical_min,
            logical_max: items.logical_max,
            physical_min: items.physical_min,
            physical_max: items.physical_max,
            units: items.units,
            units_exp: items.units_exp,
            bit_size: items.bit_size,
            report_id: items.report_id,
            report_count: items.report_count,
        }
    }

    fn restore(&self, items: &mut ValueCaps) {
        items.usage_page = self.usage_page;
        items.logical_min = self.logical_min;
        items.logical_max = self.logical_max;
        items.physical_min = self.physical_min;
        items.physical_max = self.physical_max;
        items.units = self.units;
        items.units_exp = self.units_exp;
        items.bit_size = self.bit_size;
        items.report_id = self.report_id;
        items.report_count = self.report_count;
    }
}

/// The link triple identifying the enclosing collection, transferred by
/// Collection/End Collection.
#[derive(Clone, Copy, Debug, Default)]
struct CollectionLink {
    collection: u16,
    usage_page: UsagePage,
    usage: UsageId,
}

impl CollectionLink {
    fn capture(items: &ValueCaps) -> CollectionLink {
        CollectionLink {
            collection: items.link_collection,
            usage_page: items.link_usage_page,
            usage: items.link_usage,
        }
    }

    fn restore(&self, items: &mut ValueCaps) {
        items.link_collection = self.collection;
        items.link_usage_page = self.usage_page;
        items.link_usage = self.usage;
    }
}

/// All state of one descriptor parse. Created by [parse_descriptor],
/// mutated by every item, dropped before returning.
struct ParserState {
    /// The working capability snapshot. Global items overwrite single
    /// fields, local items fill the rest, Main items copy it out.
    items: ValueCaps,

    usages_page: [UsagePage; USAGE_SLOTS],
    usages_min: [UsageId; USAGE_SLOTS],
    usages_max: [UsageId; USAGE_SLOTS],
    usages_size: usize,

    global_stack: Vec<GlobalItems>,
    collection_stack: Vec<CollectionLink>,
    collections: Vec<ValueCaps>,

    values: [Vec<ValueCaps>; 3],
    /// Bit cursor per (direction, report ID). The first field on a given
    /// slot initializes the cursor to 8: byte 0 holds the report ID at
    /// runtime.
    bit_cursors: Box<[[u32; 256]; 3]>,
    data_indices: [u16; 3],
    byte_lengths: [u16; 3],

    /// Usage page and usage of the top-level application collection.
    usage_page: UsagePage,
    usage: UsageId,
}

impl ParserState {
    fn new() -> ParserState {
        ParserState {
            items: ValueCaps::default(),
            usages_page: [UsagePage::default(); USAGE_SLOTS],
            usages_min: [UsageId::default(); USAGE_SLOTS],
            usages_max: [UsageId::default(); USAGE_SLOTS],
            usages_size: 0,
            global_stack: Vec::new(),
            collection_stack: Vec::new(),
            collections: Vec::new(),
            values: [Vec::new(), Vec::new(), Vec::new()],
            bit_cursors: Box::new([[0; 256]; 3]),
            data_indices: [0; 3],
            byte_lengths: [0; 3],
            usage_page: UsagePage::default(),
            usage: UsageId::default(),
        }
    }

    /// Clears everything a Main item consumes, keeping the global items
    /// and the collection link.
    fn reset_local_items(&mut self) {
        let globals = GlobalItems::capture(&self.items);
        let link = CollectionLink::capture(&self.items);
        self.items = ValueCaps::default();
        globals.restore(&mut self.items);
        link.restore(&mut self.items);
        self.usages_page = [UsagePage::default(); USAGE_SLOTS];
        self.usages_min = [UsageId::default(); USAGE_SLOTS];
        self.usages_max = [UsageId::default(); USAGE_SLOTS];
        self.usages_size = 0;
    }

    fn push_globals(&mut self) -> Result<()> {
        reserve(&mut self.global_stack, 1)?;
        self.global_stack.push(GlobalItems::capture(&self.items));
        Ok(())
    }

    fn pop_globals(&mut self, offset: usize) -> Result<()> {
        let Some(globals) = self.global_stack.pop() else {
            warn!("global item pop with empty stack at offset {offset}");
            return Err(ParserError::StackUnderflow { offset });
        };
        globals.restore(&mut self.items);
        Ok(())
    }

    /// A Usage local item appends one usage to the list; a preceding
    /// range turns back into a list. See Section 6.2.2.8.
    fn add_usage(&mut self, offset: usize, page: Option<UsagePage>, id: UsageId) -> Result<()> {
        let page = page.unwrap_or(self.items.usage_page);
        if self.items.flags.is_range {
            self.usages_size = 0;
        }
        if self.usages_size == USAGE_SLOTS {
            warn!("usage list overflow at offset {offset}");
            return Err(ParserError::UsageOverflow { offset });
        }
        self.usages_page[self.usages_size] = page;
        self.usages_min[self.usages_size] = id;
        self.usages_max[self.usages_size] = id;
        self.items.usage_min = id;
        self.items.usage_max = id;
        self.items.flags.is_range = false;
        self.usages_size += 1;
        Ok(())
    }

    /// Usage Minimum switches slot 0 into range mode, invalidating a
    /// previous single usage's maximum.
    fn set_usage_min(&mut self, page: Option<UsagePage>, id: UsageId) {
        let page = page.unwrap_or(self.items.usage_page);
        if !self.items.flags.is_range {
            self.usages_max[0] = UsageId::default();
        }
        self.usages_page[0] = page;
        self.usages_min[0] = id;
        self.items.usage_min = id;
        self.items.flags.is_range = true;
        self.usages_size = 1;
    }

    fn set_usage_max(&mut self, page: Option<UsagePage>, id: UsageId) {
        let page = page.unwrap_or(self.items.usage_page);
        if !self.items.flags.is_range {
            self.usages_min[0] = UsageId::default();
        }
        self.usages_page[0] = page;
        self.usages_max[0] = id;
        self.items.usage_max = id;
        self.items.flags.is_range = true;
        self.usages_size = 1;
    }

    fn open_collection(&mut self, kind: CollectionKind) -> Result<()> {
        reserve(&mut self.collection_stack, 1)?;
        reserve(&mut self.collections, 1)?;
        let index =
            u16::try_from(self.collections.len()).map_err(|_| ParserError::StackOverflow)?;

        self.collection_stack
            .push(CollectionLink::capture(&self.items));

        // The collection record keeps its type byte in the raw bit-field.
        self.items.bit_field = MainDataFlags::from(u32::from(u8::from(kind)));
        self.items.usage_min = self.usages_min[0];
        self.items.usage_max = self.usages_max[0];
        self.collections.push(self.items);

        self.items.link_collection = index;
        self.items.link_usage_page = self.items.usage_page;
        self.items.link_usage = self.items.usage_min;
        if index == 0 {
            self.usage_page = self.items.usage_page;
            self.usage = self.items.usage_min;
        }

        self.reset_local_items();
        Ok(())
    }

    fn close_collection(&mut self, offset: usize) -> Result<()> {
        let Some(link) = self.collection_stack.pop() else {
            warn!("end of collection with empty stack at offset {offset}");
            return Err(ParserError::StackUnderflow { offset });
        };
        link.restore(&mut self.items);
        self.reset_local_items();
        Ok(())
    }

    /// An Input, Output or Feature item: advance the report's bit cursor
    /// and expand the current state into one capability record per usage
    /// slot.
    fn add_value_caps(
        &mut self,
        direction: ReportDirection,
        field: MainDataFlags,
        offset: usize,
    ) -> Result<()> {
        let d = direction.index();
        let rid = usize::from(self.items.report_id);
        self.items.bit_field = field;

        let item_bits = u32::from(self.items.bit_size) * u32::from(self.items.report_count);
        if self.bit_cursors[d][rid] == 0 {
            self.bit_cursors[d][rid] = 8;
        }
        self.bit_cursors[d][rid] = self.bit_cursors[d][rid].saturating_add(item_bits);
        let cursor = self.bit_cursors[d][rid];
        let bytes = u16::try_from(cursor.div_ceil(8)).unwrap_or(u16::MAX);
        self.byte_lengths[d] = self.byte_lengths[d].max(bytes);
        let mut start_bit = cursor;

        if self.items.report_count == 0 {
            // A zero count advanced the cursor but emits nothing.
            self.reset_local_items();
            return Ok(());
        }

        let usages = self.usages_size.max(1);
        reserve(&mut self.values[d], usages)?;

        let is_array = self.items.bit_field.is_array();
        if !is_array {
            if usize::from(self.items.report_count) < usages {
                warn!(
                    "main item at offset {offset} has {} report slots for {usages} usages",
                    self.items.report_count
                );
            }
            self.items.report_count = self.items.report_count.saturating_sub(usages as u16 - 1);
        } else {
            // Array records all share the position of the array start.
            start_bit -= item_bits;
        }

        if self.items.bit_field.is_absolute() {
            self.items.flags.is_absolute = true;
        }
        if self.items.bit_field.is_constant() {
            self.items.flags.is_constant = true;
        }
        if self.items.bit_size == 1 || is_array {
            self.items.flags.is_button = true;
        }

        // Fields are laid out back to front, last usage slot first.
        let global_page = self.items.usage_page;
        let mut slot = usages;
        while slot > 0 {
            slot -= 1;
            if !is_array {
                start_bit = start_bit
                    .saturating_sub(u32::from(self.items.report_count) * u32::from(self.items.bit_size));
            } else {
                self.items.flags.array_has_more = slot != 0;
            }
            self.items.start_byte = (start_bit / 8) as u16;
            self.items.start_bit = (start_bit % 8) as u8;
            self.items.usage_page = self.usages_page[slot];
            self.items.usage_min = self.usages_min[slot];
            self.items.usage_max = self.usages_max[slot];

            let span =
                u16::from(self.items.usage_max).saturating_sub(u16::from(self.items.usage_min));
            self.items.data_index_min = self.data_indices[d];
            self.items.data_index_max = self.data_indices[d].saturating_add(span);
            if self.items.usage_max != UsageId::default()
                || self.items.usage_min != UsageId::default()
            {
                self.data_indices[d] = self.items.data_index_max.saturating_add(1);
            }

            self.values[d].push(self.items);
            if !is_array {
                self.items.report_count = 1;
            }
        }

        self.items.usage_page = global_page;
        self.reset_local_items();
        Ok(())
    }

    fn finish(self, pool: &impl Pool) -> Result<PreparsedData> {
        if !self.global_stack.is_empty() {
            warn!(
                "{} unpopped global item state(s) at end of descriptor",
                self.global_stack.len()
            );
        }
        if !self.collection_stack.is_empty() {
            warn!(
                "{} unclosed collection(s) at end of descriptor",
                self.collection_stack.len()
            );
        }

        let data = PreparsedData::assemble(
            PreparsedParts {
                usage_page: self.usage_page,
                usage: self.usage,
                byte_lengths: self.byte_lengths,
                values: [
                    self.values[0].as_slice(),
                    self.values[1].as_slice(),
                    self.values[2].as_slice(),
                ],
                collections: &self.collections,
            },
            pool,
        )?;

        debug!(
            "usage {:02x}:{:02x} input {} caps, {} bytes, output {} caps, {} bytes, \
             feature {} caps, {} bytes, collections {}",
            u16::from(data.usage_page()),
            u16::from(data.usage()),
            data.input_caps().len(),
            data.report_byte_length(ReportDirection::Input),
            data.output_caps().len(),
            data.report_byte_length(ReportDirection::Output),
            data.feature_caps().len(),
            data.report_byte_length(ReportDirection::Feature),
            data.number_link_collection_nodes(),
        );
        if log_enabled!(Level::Trace) {
            for direction in ReportDirection::ALL {
                for (i, caps) in data.caps(direction).iter().enumerate() {
                    trace!("{direction} {i}: {caps}");
                }
            }
            for (i, caps) in data.collections().iter().enumerate() {
                trace!("collection {i}: {caps}");
            }
        }

        Ok(data)
    }
}

fn parse_descriptor(bytes: &[u8], pool: &impl Pool) -> Result<PreparsedData> {
    let mut state = ParserState::new();

    for located in ItemReader::new(bytes) {
        let LocatedItem { offset, item } = located?;
        match item {
            ItemType::Main(MainItem::Input(field)) => {
                state.add_value_caps(ReportDirection::Input, field, offset)?
            }
            ItemType::Main(MainItem::Output(field)) => {
                state.add_value_caps(ReportDirection::Output, field, offset)?
            }
            ItemType::Main(MainItem::Feature(field)) => {
                state.add_value_caps(ReportDirection::Feature, field, offset)?
            }
            ItemType::Main(MainItem::Collection(kind)) => state.open_collection(kind)?,
            ItemType::Main(MainItem::EndCollection) => state.close_collection(offset)?,

            ItemType::Global(GlobalItem::UsagePage(page)) => state.items.usage_page = page,
            ItemType::Global(GlobalItem::LogicalMinimum(min)) => state.items.logical_min = min,
            ItemType::Global(GlobalItem::LogicalMaximum(max)) => state.items.logical_max = max,
            ItemType::Global(GlobalItem::PhysicalMinimum(min)) => state.items.physical_min = min,
            ItemType::Global(GlobalItem::PhysicalMaximum(max)) => state.items.physical_max = max,
            ItemType::Global(GlobalItem::UnitExponent(exp)) => state.items.units_exp = exp,
            ItemType::Global(GlobalItem::Unit(units)) => state.items.units = units,
            ItemType::Global(GlobalItem::ReportSize(size)) => state.items.bit_size = size as u16,
            ItemType::Global(GlobalItem::ReportId(id)) => {
                state.items.report_id = ReportId::from(id as u8)
            }
            ItemType::Global(GlobalItem::ReportCount(count)) => {
                state.items.report_count = count as u16
            }
            ItemType::Global(GlobalItem::Push) => state.push_globals()?,
            ItemType::Global(GlobalItem::Pop) => state.pop_globals(offset)?,

            ItemType::Local(LocalItem::Usage { page, id }) => state.add_usage(offset, page, id)?,
            ItemType::Local(LocalItem::UsageMinimum { page, id }) => state.set_usage_min(page, id),
            ItemType::Local(LocalItem::UsageMaximum { page, id }) => state.set_usage_max(page, id),
            ItemType::Local(LocalItem::DesignatorIndex(index)) => {
                state.items.designator_min = index as u16;
                state.items.designator_max = index as u16;
                state.items.flags.is_designator_range = false;
            }
            ItemType::Local(LocalItem::DesignatorMinimum(min)) => {
                state.items.designator_min = min as u16;
                state.items.flags.is_designator_range = true;
            }
            ItemType::Local(LocalItem::DesignatorMaximum(max)) => {
                state.items.designator_max = max as u16;
                state.items.flags.is_designator_range = true;
            }
            ItemType::Local(LocalItem::StringIndex(index)) => {
                state.items.string_min = index as u16;
                state.items.string_max = index as u16;
                state.items.flags.is_string_range = false;
            }
            ItemType::Local(LocalItem::StringMinimum(min)) => {
                state.items.string_min = min as u16;
                state.items.flags.is_string_range = true;
            }
            ItemType::Local(LocalItem::StringMaximum(max)) => {
                state.items.string_max = max as u16;
                state.items.flags.is_string_range = true;
            }
            ItemType::Local(LocalItem::Delimiter(_)) => {
                return Err(ParserError::DelimiterUnsupported { offset })
            }
        }
    }

    state.finish(pool)
}

impl PreparsedData {
    /// Parses a report descriptor, allocating the preparsed block from
    /// the given pool.
    pub fn parse(bytes: &[u8], pool: &impl Pool) -> Result<PreparsedData> {
        parse_descriptor(bytes, pool)
    }
}

impl TryFrom<&[u8]> for PreparsedData {
    type Error = ParserError;

    /// Try to parse the given byte array as a report descriptor,
    /// allocating from the process heap.
    fn try_from(bytes: &[u8]) -> Result<PreparsedData> {
        PreparsedData::parse(bytes, &HeapPool)
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DescriptionError {
    /// The pool refused an allocation; nothing is retained.
    #[error("allocation failure")]
    NoMemory,
    /// The descriptor itself is invalid. Not retryable.
    #[error(transparent)]
    Parsing(ParserError),
}

impl From<ParserError> for DescriptionError {
    fn from(e: ParserError) -> DescriptionError {
        match e {
            ParserError::NoMemory => DescriptionError::NoMemory,
            e => DescriptionError::Parsing(e),
        }
    }
}

/// Summary of the top-level application collection.
#[derive(Clone, Debug, Default)]
pub struct CollectionDescription {
    pub usage_page: UsagePage,
    pub usage: UsageId,
    pub collection_number: u16,
    /// Longest input report in bytes, including the report ID prefix.
    pub input_length: u16,
    pub output_length: u16,
    pub feature_length: u16,
    /// Nominal size of the preparsed block in bytes.
    pub preparsed_data_length: usize,
    pub preparsed_data: PreparsedData,
}

/// Per-direction report byte lengths of one report ID in use.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReportIdDescription {
    pub report_id: ReportId,
    pub collection_number: u16,
    /// Input report length in bytes, including the report ID prefix;
    /// zero if the ID declares no input fields.
    pub input_length: u16,
    pub output_length: u16,
    pub feature_length: u16,
}

/// The device-level summary of a report descriptor: the top-level
/// collection and every report ID in use, with per-direction byte
/// lengths.
#[derive(Clone, Debug, Default)]
pub struct DeviceDescription {
    /// Exactly one entry, the top-level application collection.
    pub collections: Vec<CollectionDescription>,
    /// One entry per report ID that appears in any direction, in
    /// ascending ID order.
    pub report_ids: Vec<ReportIdDescription>,
}

impl DeviceDescription {
    /// Parses a report descriptor and summarizes the resulting preparsed
    /// data, allocating all output from the given pool.
    pub fn from_descriptor(
        bytes: &[u8],
        pool: &impl Pool,
    ) -> std::result::Result<DeviceDescription, DescriptionError> {
        let preparsed = PreparsedData::parse(bytes, pool)?;

        // Largest end bit per (direction, report ID); an ID is counted
        // the first time any direction sees it.
        let mut lengths = [[0u32; 256]; 3];
        let mut id_count = 0;
        for direction in ReportDirection::ALL {
            for caps in preparsed.caps(direction) {
                let id = usize::from(caps.report_id);
                if lengths[..=direction.index()].iter().all(|l| l[id] == 0) {
                    id_count += 1;
                }
                lengths[direction.index()][id] =
                    lengths[direction.index()][id].max(caps.end_bit());
            }
        }

        let mut collections = pool
            .alloc::<CollectionDescription>(1)
            .ok_or(DescriptionError::NoMemory)?;
        let mut report_ids = pool
            .alloc::<ReportIdDescription>(id_count)
            .ok_or(DescriptionError::NoMemory)?;

        for id in 0..256 {
            let [input, output, feature] =
                [lengths[0][id], lengths[1][id], lengths[2][id]];
            if input == 0 && output == 0 && feature == 0 {
                continue;
            }
            report_ids.push(ReportIdDescription {
                report_id: ReportId::from(id as u8),
                collection_number: 1,
                input_length: u16::try_from(input.div_ceil(8)).unwrap_or(u16::MAX),
                output_length: u16::try_from(output.div_ceil(8)).unwrap_or(u16::MAX),
                feature_length: u16::try_from(feature.div_ceil(8)).unwrap_or(u16::MAX),
            });
        }

        collections.push(CollectionDescription {
            usage_page: preparsed.usage_page(),
            usage: preparsed.usage(),
            collection_number: 1,
            input_length: preparsed.report_byte_length(ReportDirection::Input),
            output_length: preparsed.report_byte_length(ReportDirection::Output),
            feature_length: preparsed.report_byte_length(ReportDirection::Feature),
            preparsed_data_length: preparsed.size_in_bytes(),
            preparsed_data: preparsed,
        });

        Ok(DeviceDescription {
            collections,
            report_ids,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A pool that refuses every allocation.
    struct ExhaustedPool;

    impl Pool for ExhaustedPool {
        fn alloc<T>(&self, _len: usize) -> Option<Vec<T>> {
            None
        }
    }

    #[rustfmt::skip]
    const MINIMAL_MOUSE: &[u8] = &[
        0x05, 0x01,       // Usage Page (Generic Desktop)
        0x09, 0x02,       // Usage (Mouse)
        0xa1, 0x01,       // Collection (Application)
        0x09, 0x01,       //   Usage (Pointer)
        0xa1, 0x00,       //   Collection (Physical)
        0x05, 0x09,       //     Usage Page (Button)
        0x19, 0x01,       //     Usage Minimum (1)
        0x29, 0x03,       //     Usage Maximum (3)
        0x15, 0x00,       //     Logical Minimum (0)
        0x25, 0x01,       //     Logical Maximum (1)
        0x95, 0x03,       //     Report Count (3)
        0x75, 0x01,       //     Report Size (1)
        0x81, 0x02,       //     Input (Data,Var,Abs)
        0x95, 0x01,       //     Report Count (1)
        0x75, 0x05,       //     Report Size (5)
        0x81, 0x03,       //     Input (Cnst,Var,Abs)
        0xc0,             //   End Collection
        0xc0,             // End Collection
    ];

    #[rustfmt::skip]
    const BOOT_KEYBOARD: &[u8] = &[
        0x05, 0x01,       // Usage Page (Generic Desktop)
        0x09, 0x06,       // Usage (Keyboard)
        0xa1, 0x01,       // Collection (Application)
        0x05, 0x07,       //   Usage Page (Keyboard/Keypad)
        0x19, 0xe0,       //   Usage Minimum (224)
        0x29, 0xe7,       //   Usage Maximum (231)
        0x15, 0x00,       //   Logical Minimum (0)
        0x25, 0x01,       //   Logical Maximum (1)
        0x75, 0x01,       //   Report Size (1)
        0x95, 0x08,       //   Report Count (8)
        0x81, 0x02,       //   Input (Data,Var,Abs)
        0x95, 0x01,       //   Report Count (1)
        0x75, 0x08,       //   Report Size (8)
        0x81, 0x01,       //   Input (Cnst,Arr,Abs)
        0x95, 0x05,       //   Report Count (5)
        0x75, 0x01,       //   Report Size (1)
        0x05, 0x08,       //   Usage Page (LED)
        0x19, 0x01,       //   Usage Minimum (1)
        0x29, 0x05,       //   Usage Maximum (5)
        0x91, 0x02,       //   Output (Data,Var,Abs)
        0x95, 0x01,       //   Report Count (1)
        0x75, 0x03,       //   Report Size (3)
        0x91, 0x01,       //   Output (Cnst,Arr,Abs)
        0x95, 0x06,       //   Report Count (6)
        0x75, 0x08,       //   Report Size (8)
        0x15, 0x00,       //   Logical Minimum (0)
        0x25, 0x65,       //   Logical Maximum (101)
        0x05, 0x07,       //   Usage Page (Keyboard/Keypad)
        0x19, 0x00,       //   Usage Minimum (0)
        0x29, 0x65,       //   Usage Maximum (101)
        0x81, 0x00,       //   Input (Data,Arr,Abs)
        0xc0,             // End Collection
    ];

    fn parse(bytes: &[u8]) -> PreparsedData {
        PreparsedData::try_from(bytes).unwrap()
    }

    /// Within a direction, the data index intervals of usage-bearing
    /// capabilities partition the index space with no gaps.
    fn assert_data_indices_contiguous(caps: &[ValueCaps]) {
        let mut intervals: Vec<(u16, u16)> = caps
            .iter()
            .filter(|c| c.usage_min != UsageId::default() || c.usage_max != UsageId::default())
            .map(|c| (c.data_index_min, c.data_index_max))
            .collect();
        intervals.sort_unstable();
        let mut next = 0;
        for (min, max) in intervals {
            assert_eq!(min, next);
            assert!(max >= min);
            next = max + 1;
        }
    }

    #[test]
    fn minimal_mouse() {
        let data = parse(MINIMAL_MOUSE);

        assert_eq!(data.usage_page(), UsagePage(0x01));
        assert_eq!(data.usage(), UsageId(0x02));
        assert_eq!(data.number_link_collection_nodes(), 2);
        assert_eq!(data.report_byte_length(ReportDirection::Input), 2);
        assert_eq!(data.report_byte_length(ReportDirection::Output), 0);
        assert_eq!(data.report_byte_length(ReportDirection::Feature), 0);
        assert!(data.output_caps().is_empty());
        assert!(data.feature_caps().is_empty());

        let caps = data.input_caps();
        assert_eq!(caps.len(), 2);

        let buttons = &caps[0];
        assert_eq!(buttons.usage_page, UsagePage(0x09));
        assert_eq!(buttons.usage_min, UsageId(1));
        assert_eq!(buttons.usage_max, UsageId(3));
        assert_eq!(buttons.report_id, ReportId(0));
        assert_eq!((buttons.start_byte, buttons.start_bit), (1, 0));
        assert_eq!(buttons.bit_size, 1);
        assert_eq!(buttons.report_count, 3);
        assert_eq!(buttons.logical_min, 0);
        assert_eq!(buttons.logical_max, 1);
        assert_eq!((buttons.data_index_min, buttons.data_index_max), (0, 2));
        assert_eq!(buttons.link_collection, 1);
        assert_eq!(buttons.link_usage_page, UsagePage(0x01));
        assert_eq!(buttons.link_usage, UsageId(0x01));
        assert!(buttons.flags.is_range);
        assert!(buttons.flags.is_absolute);
        assert!(buttons.flags.is_button);
        assert!(!buttons.flags.is_constant);

        let padding = &caps[1];
        assert_eq!((padding.start_byte, padding.start_bit), (1, 3));
        assert_eq!(padding.bit_size, 5);
        assert_eq!(padding.report_count, 1);
        assert!(padding.flags.is_constant);
        assert!(!padding.flags.is_button);

        // collection 0 is the application collection, collection 1 links
        // back to it
        let collections = data.collections();
        assert_eq!(collections.len(), 2);
        assert_eq!(collections[0].usage_page, UsagePage(0x01));
        assert_eq!(collections[0].usage_min, UsageId(0x02));
        assert_eq!(collections[0].link_collection, 0);
        assert_eq!(collections[1].usage_min, UsageId(0x01));
        assert_eq!(collections[1].link_collection, 0);
        assert_eq!(collections[1].link_usage, UsageId(0x02));
    }

    #[test]
    fn boot_keyboard() {
        let data = parse(BOOT_KEYBOARD);

        assert_eq!(data.usage_page(), UsagePage(0x01));
        assert_eq!(data.usage(), UsageId(0x06));
        assert_eq!(data.report_byte_length(ReportDirection::Input), 9);
        assert_eq!(data.report_byte_length(ReportDirection::Output), 2);
        assert_eq!(data.number_link_collection_nodes(), 1);

        let caps = data.input_caps();
        assert_eq!(caps.len(), 3);

        // 8 modifier bits as one variable range record
        let modifiers = &caps[0];
        assert_eq!(modifiers.usage_page, UsagePage(0x07));
        assert_eq!(modifiers.usage_min, UsageId(0xe0));
        assert_eq!(modifiers.usage_max, UsageId(0xe7));
        assert_eq!(modifiers.bit_size, 1);
        assert_eq!(modifiers.report_count, 8);
        assert_eq!((modifiers.start_byte, modifiers.start_bit), (1, 0));
        assert_eq!((modifiers.data_index_min, modifiers.data_index_max), (0, 7));
        assert!(modifiers.flags.is_range);
        assert!(modifiers.flags.is_button);

        // 6-byte key array as one record covering the usage range
        let keys = &caps[2];
        assert_eq!(keys.usage_min, UsageId(0x00));
        assert_eq!(keys.usage_max, UsageId(0x65));
        assert_eq!(keys.bit_size, 8);
        assert_eq!(keys.report_count, 6);
        assert_eq!((keys.start_byte, keys.start_bit), (3, 0));
        assert!(keys.bit_field.is_array());
        assert!(keys.flags.is_button);
        assert!(!keys.flags.array_has_more);

        let outputs = data.output_caps();
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[0].usage_page, UsagePage(0x08));
        assert_eq!(outputs[0].report_count, 5);

        assert_data_indices_contiguous(data.input_caps());
        assert_data_indices_contiguous(data.output_caps());
    }

    #[test]
    fn report_ids() {
        #[rustfmt::skip]
        let bytes: &[u8] = &[
            0x05, 0x01,       // Usage Page (Generic Desktop)
            0x09, 0x05,       // Usage (Gamepad)
            0xa1, 0x01,       // Collection (Application)
            0x85, 0x01,       //   Report ID (1)
            0x09, 0x30,       //   Usage (X)
            0x15, 0x81,       //   Logical Minimum (-127)
            0x25, 0x7f,       //   Logical Maximum (127)
            0x75, 0x08,       //   Report Size (8)
            0x95, 0x01,       //   Report Count (1)
            0x81, 0x02,       //   Input (Data,Var,Abs)
            0x85, 0x02,       //   Report ID (2)
            0x09, 0x31,       //   Usage (Y)
            0x81, 0x02,       //   Input (Data,Var,Abs)
            0xc0,             // End Collection
        ];
        let desc = DeviceDescription::from_descriptor(bytes, &HeapPool).unwrap();

        assert_eq!(desc.report_ids.len(), 2);
        let first = &desc.report_ids[0];
        assert_eq!(first.report_id, ReportId(1));
        assert_eq!(first.input_length, 2);
        assert_eq!(first.output_length, 0);
        assert_eq!(first.feature_length, 0);
        let second = &desc.report_ids[1];
        assert_eq!(second.report_id, ReportId(2));
        assert_eq!(second.input_length, 2);

        // with report IDs in use, every field lives past the prefix byte
        let data = &desc.collections[0].preparsed_data;
        for caps in data.input_caps() {
            assert!(caps.report_id.is_declared());
            assert!(u32::from(caps.start_byte) * 8 + u32::from(caps.start_bit) >= 8);
        }
        assert_eq!(data.input_caps()[0].logical_min, -127);
        assert_eq!(data.input_caps()[0].logical_max, 127);
    }

    #[test]
    fn push_pop_restores_globals() {
        #[rustfmt::skip]
        let bytes: &[u8] = &[
            0x05, 0x01,       // Usage Page (Generic Desktop)
            0x09, 0x05,       // Usage (Gamepad)
            0xa1, 0x01,       // Collection (Application)
            0x75, 0x08,       //   Report Size (8)
            0x95, 0x01,       //   Report Count (1)
            0x16, 0x80, 0xff, //   Logical Minimum (-128)
            0xa4,             //   Push
            0x15, 0x00,       //     Logical Minimum (0)
            0x09, 0x30,       //     Usage (X)
            0x81, 0x02,       //     Input (Data,Var,Abs)
            0xb4,             //   Pop
            0x09, 0x31,       //   Usage (Y)
            0x81, 0x02,       //   Input (Data,Var,Abs)
            0xc0,             // End Collection
        ];
        let data = parse(bytes);
        let caps = data.input_caps();
        assert_eq!(caps.len(), 2);
        assert_eq!(caps[0].logical_min, 0);
        assert_eq!(caps[1].logical_min, -128);
        // both fields still use the same size and count
        assert_eq!(caps[1].bit_size, 8);
        assert_eq!(caps[1].report_count, 1);
    }

    #[test]
    fn truncated_descriptor() {
        // REPORT_SIZE announcing a data byte that is not there
        let bytes: &[u8] = &[0x75];
        let err = DeviceDescription::from_descriptor(bytes, &HeapPool).unwrap_err();
        assert!(matches!(
            err,
            DescriptionError::Parsing(ParserError::Item(HidError::Truncated { .. }))
        ));
    }

    #[test]
    fn reserved_and_long_items() {
        let bytes: &[u8] = &[0x0c];
        assert!(matches!(
            PreparsedData::try_from(bytes),
            Err(ParserError::Item(HidError::ReservedType { .. }))
        ));

        let bytes: &[u8] = &[0xfe, 0x01, 0xf0, 0x00];
        assert!(matches!(
            PreparsedData::try_from(bytes),
            Err(ParserError::Item(HidError::LongItem { offset: 0 }))
        ));

        let bytes: &[u8] = &[0xd0];
        assert!(matches!(
            PreparsedData::try_from(bytes),
            Err(ParserError::Item(HidError::UnknownTag { .. }))
        ));
    }

    #[test]
    fn variable_expansion() {
        #[rustfmt::skip]
        let bytes: &[u8] = &[
            0x05, 0x01,       // Usage Page (Generic Desktop)
            0x09, 0x02,       // Usage (Mouse)
            0xa1, 0x01,       // Collection (Application)
            0x09, 0x30,       //   Usage (X)
            0x09, 0x31,       //   Usage (Y)
            0x09, 0x38,       //   Usage (Wheel)
            0x15, 0x81,       //   Logical Minimum (-127)
            0x25, 0x7f,       //   Logical Maximum (127)
            0x75, 0x08,       //   Report Size (8)
            0x95, 0x03,       //   Report Count (3)
            0x81, 0x06,       //   Input (Data,Var,Rel)
            0xc0,             // End Collection
        ];
        let data = parse(bytes);
        let caps = data.input_caps();
        assert_eq!(caps.len(), 3);

        // one record per usage, emitted last usage first
        assert_eq!(caps[0].usage_min, UsageId(0x38));
        assert_eq!((caps[0].start_byte, caps[0].start_bit), (3, 0));
        assert_eq!(caps[1].usage_min, UsageId(0x31));
        assert_eq!((caps[1].start_byte, caps[1].start_bit), (2, 0));
        assert_eq!(caps[2].usage_min, UsageId(0x30));
        assert_eq!((caps[2].start_byte, caps[2].start_bit), (1, 0));

        let total: u16 = caps.iter().map(|c| c.report_count).sum();
        assert_eq!(total, 3);
        for record in caps {
            assert!(!record.flags.is_absolute);
            assert!(!record.flags.is_button);
            assert!(!record.flags.is_range);
        }
        assert_data_indices_contiguous(caps);
    }

    #[test]
    fn variable_with_spare_report_slots() {
        // two usages, three report slots: the first emitted record soaks
        // up the spare slots
        #[rustfmt::skip]
        let bytes: &[u8] = &[
            0x05, 0x01,       // Usage Page (Generic Desktop)
            0x09, 0x02,       // Usage (Mouse)
            0xa1, 0x01,       // Collection (Application)
            0x09, 0x30,       //   Usage (X)
            0x09, 0x31,       //   Usage (Y)
            0x15, 0x00,       //   Logical Minimum (0)
            0x25, 0x7f,       //   Logical Maximum (127)
            0x75, 0x08,       //   Report Size (8)
            0x95, 0x03,       //   Report Count (3)
            0x81, 0x02,       //   Input (Data,Var,Abs)
            0xc0,             // End Collection
        ];
        let data = parse(bytes);
        let caps = data.input_caps();
        assert_eq!(caps.len(), 2);
        assert_eq!(caps[0].usage_min, UsageId(0x31));
        assert_eq!(caps[0].report_count, 2);
        assert_eq!((caps[0].start_byte, caps[0].start_bit), (2, 0));
        assert_eq!(caps[1].usage_min, UsageId(0x30));
        assert_eq!(caps[1].report_count, 1);
        assert_eq!((caps[1].start_byte, caps[1].start_bit), (1, 0));

        let total: u16 = caps.iter().map(|c| c.report_count).sum();
        assert_eq!(total, 3);
    }

    #[test]
    fn array_grouping() {
        #[rustfmt::skip]
        let bytes: &[u8] = &[
            0x05, 0x0c,       // Usage Page (Consumer)
            0x09, 0x01,       // Usage (Consumer Control)
            0xa1, 0x01,       // Collection (Application)
            0x15, 0x01,       //   Logical Minimum (1)
            0x25, 0x02,       //   Logical Maximum (2)
            0x75, 0x08,       //   Report Size (8)
            0x95, 0x02,       //   Report Count (2)
            0x09, 0xb5,       //   Usage (Scan Next Track)
            0x09, 0xb6,       //   Usage (Scan Previous Track)
            0x81, 0x00,       //   Input (Data,Arr,Abs)
            0xc0,             // End Collection
        ];
        let data = parse(bytes);
        let caps = data.input_caps();
        assert_eq!(caps.len(), 2);

        // the records share the array's position and count; every record
        // but the last links to the next
        assert_eq!(caps[0].usage_min, UsageId(0xb6));
        assert!(caps[0].flags.array_has_more);
        assert_eq!(caps[1].usage_min, UsageId(0xb5));
        assert!(!caps[1].flags.array_has_more);
        for record in caps {
            assert_eq!((record.start_byte, record.start_bit), (1, 0));
            assert_eq!(record.bit_size, 8);
            assert_eq!(record.report_count, 2);
            assert!(record.flags.is_button);
        }
        assert_data_indices_contiguous(caps);
    }

    #[test]
    fn zero_report_count_advances_cursor() {
        #[rustfmt::skip]
        let bytes: &[u8] = &[
            0x05, 0x01,       // Usage Page (Generic Desktop)
            0x09, 0x02,       // Usage (Mouse)
            0xa1, 0x01,       // Collection (Application)
            0x75, 0x08,       //   Report Size (8)
            0x95, 0x00,       //   Report Count (0)
            0x81, 0x02,       //   Input (Data,Var,Abs)
            0x09, 0x30,       //   Usage (X)
            0x95, 0x01,       //   Report Count (1)
            0x81, 0x02,       //   Input (Data,Var,Abs)
            0xc0,             // End Collection
        ];
        let data = parse(bytes);
        let caps = data.input_caps();
        assert_eq!(caps.len(), 1);
        assert_eq!((caps[0].start_byte, caps[0].start_bit), (1, 0));
        assert_eq!(data.report_byte_length(ReportDirection::Input), 2);
    }

    #[test]
    fn usage_overflow() {
        let mut bytes = vec![0x05, 0x01, 0x09, 0x02, 0xa1, 0x01];
        for _ in 0..257 {
            bytes.extend_from_slice(&[0x09, 0x30]);
        }
        bytes.extend_from_slice(&[0x75, 0x01, 0x95, 0x01, 0x81, 0x02, 0xc0]);
        assert!(matches!(
            PreparsedData::try_from(bytes.as_slice()),
            Err(ParserError::UsageOverflow { .. })
        ));

        // 256 usages still fit
        let mut bytes = vec![0x05, 0x01, 0x09, 0x02, 0xa1, 0x01];
        for _ in 0..256 {
            bytes.extend_from_slice(&[0x09, 0x30]);
        }
        bytes.extend_from_slice(&[0x75, 0x01, 0x95, 0x01, 0x81, 0x02, 0xc0]);
        assert!(PreparsedData::try_from(bytes.as_slice()).is_ok());
    }

    #[test]
    fn stack_underflow() {
        // End Collection without a collection
        let bytes: &[u8] = &[0xc0];
        assert_eq!(
            PreparsedData::try_from(bytes),
            Err(ParserError::StackUnderflow { offset: 0 })
        );

        // Pop without a Push
        let bytes: &[u8] = &[0x05, 0x01, 0xb4];
        assert_eq!(
            PreparsedData::try_from(bytes),
            Err(ParserError::StackUnderflow { offset: 2 })
        );
    }

    #[test]
    fn delimiter_rejected() {
        let bytes: &[u8] = &[0x05, 0x01, 0xa9, 0x01];
        assert_eq!(
            PreparsedData::try_from(bytes),
            Err(ParserError::DelimiterUnsupported { offset: 2 })
        );
    }

    #[test]
    fn unclosed_collection_still_produces_output() {
        let bytes: &[u8] = &[0x05, 0x01, 0x09, 0x02, 0xa1, 0x01];
        let data = parse(bytes);
        assert_eq!(data.number_link_collection_nodes(), 1);
        assert_eq!(data.usage_page(), UsagePage(0x01));
        assert_eq!(data.usage(), UsageId(0x02));
        assert!(data.input_caps().is_empty());
    }

    #[test]
    fn empty_descriptor() {
        let data = parse(&[]);
        assert!(data.is_valid());
        assert_eq!(data.number_link_collection_nodes(), 0);

        let desc = DeviceDescription::from_descriptor(&[], &HeapPool).unwrap();
        assert_eq!(desc.collections.len(), 1);
        assert_eq!(desc.collections[0].input_length, 0);
        assert!(desc.report_ids.is_empty());
    }

    #[test]
    fn usage_page_carried_in_usage_item() {
        #[rustfmt::skip]
        let bytes: &[u8] = &[
            0x05, 0x01,                   // Usage Page (Generic Desktop)
            0x09, 0x02,                   // Usage (Mouse)
            0xa1, 0x01,                   // Collection (Application)
            0x15, 0x00,                   //   Logical Minimum (0)
            0x25, 0x01,                   //   Logical Maximum (1)
            0x75, 0x08,                   //   Report Size (8)
            0x95, 0x01,                   //   Report Count (1)
            0x0b, 0x38, 0x02, 0x0c, 0x00, //   Usage (Consumer: AC Pan)
            0x81, 0x02,                   //   Input (Data,Var,Abs)
            0xc0,                         // End Collection
        ];
        let data = parse(bytes);
        let caps = data.input_caps();
        assert_eq!(caps.len(), 1);
        assert_eq!(caps[0].usage_page, UsagePage(0x0c));
        assert_eq!(caps[0].usage_min, UsageId(0x0238));
        // the enclosing collection still lives on the global page
        assert_eq!(caps[0].link_usage_page, UsagePage(0x01));
    }

    #[test]
    fn exhausted_pool() {
        assert_eq!(
            PreparsedData::parse(MINIMAL_MOUSE, &ExhaustedPool),
            Err(ParserError::NoMemory)
        );
        assert_eq!(
            DeviceDescription::from_descriptor(MINIMAL_MOUSE, &ExhaustedPool).unwrap_err(),
            DescriptionError::NoMemory
        );
    }
}
