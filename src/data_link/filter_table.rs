//! Sorted, sectioned acceptance-filter table.
//!
//! The hardware look-up table is one array of 32-bit words split into four
//! contiguous sections, in this order:
//!
//! | Section         | Entry layout                                     | Width  |
//! |-----------------|--------------------------------------------------|--------|
//! | standard exact  | `SCC[15:13] DIS[12] - ID[10:0]`, two per word    | 16 bit |
//! | standard range  | lower bound in the high half, upper in the low   | 32 bit |
//! | extended exact  | `SCC[31:29] ID[28:0]`                            | 32 bit |
//! | extended range  | two extended entries, lower then upper           | 64 bit |
//!
//! Each section must be sorted ascending by its packed value. A standard-exact
//! section with an odd entry count is padded with [`DISABLED_SLOT`], which is
//! the largest possible 16-bit value and therefore always sorts to the tail.
//!
//! The table is kept here as four typed sections; the packed word array and
//! section start addresses are derived only when the bank is written.

use super::{Controller, FilterBank, FilterMode, FilterOp, SessionFilter};
use crate::error::{AutomotiveError, Result};
use crate::types::{CanId, IdFlags, IdFormat, MAX_STANDARD_ID};

/// Filter RAM size of the reference peripheral, in words
pub const DEFAULT_CAPACITY_WORDS: usize = 512;

/// Placeholder written into an unused standard-exact half-word
pub const DISABLED_SLOT: u16 = 0xFFFF;

const SCC_SHIFT_STANDARD: u32 = 13;
const SCC_SHIFT_EXTENDED: u32 = 29;

/// Table section an entry lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterKind {
    StandardExact,
    StandardRange,
    ExtendedExact,
    ExtendedRange,
}

impl FilterKind {
    pub fn exact(format: IdFormat) -> Self {
        match format {
            IdFormat::Standard => FilterKind::StandardExact,
            IdFormat::Extended => FilterKind::ExtendedExact,
        }
    }

    pub fn range(format: IdFormat) -> Self {
        match format {
            IdFormat::Standard => FilterKind::StandardRange,
            IdFormat::Extended => FilterKind::ExtendedRange,
        }
    }

    pub fn format(self) -> IdFormat {
        match self {
            FilterKind::StandardExact | FilterKind::StandardRange => IdFormat::Standard,
            FilterKind::ExtendedExact | FilterKind::ExtendedRange => IdFormat::Extended,
        }
    }

    pub fn is_range(self) -> bool {
        matches!(self, FilterKind::StandardRange | FilterKind::ExtendedRange)
    }
}

/// One logical filter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterEntry {
    pub identifier: CanId,
    pub end_of_range: Option<CanId>,
    pub format: IdFormat,
    pub kind: FilterKind,
    pub controller: Controller,
}

/// Byte offsets of each section start, plus the end of the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SectionBounds {
    pub standard_exact: u32,
    pub standard_range: u32,
    pub extended_exact: u32,
    pub extended_range: u32,
    pub end_of_table: u32,
}

fn pack_standard(id: CanId, controller: Controller) -> u16 {
    ((controller.field() << SCC_SHIFT_STANDARD) | (id & MAX_STANDARD_ID)) as u16
}

fn unpack_standard(slot: u16) -> (CanId, Controller) {
    let slot = slot as u32;
    (
        slot & MAX_STANDARD_ID,
        Controller::from_field((slot >> SCC_SHIFT_STANDARD) & 0x7),
    )
}

fn pack_extended(id: CanId, controller: Controller) -> u32 {
    (controller.field() << SCC_SHIFT_EXTENDED) | id
}

fn unpack_extended(word: u32) -> (CanId, Controller) {
    (
        word & IdFormat::Extended.max_id(),
        Controller::from_field(word >> SCC_SHIFT_EXTENDED),
    )
}

/// An entry in packed form, ready to be placed in its section
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    StandardExact(u16),
    StandardRange(u16, u16),
    ExtendedExact(u32),
    ExtendedRange(u32, u32),
}

impl Slot {
    fn encode(kind: FilterKind, id: CanId, range_end: Option<CanId>, controller: Controller) -> Result<Self> {
        let format = kind.format();
        format.check(id)?;
        let end = if kind.is_range() {
            let end = range_end.ok_or_else(|| {
                AutomotiveError::InvalidParameter("range filter needs an end of range".into())
            })?;
            format.check(end)?;
            if end < id {
                return Err(AutomotiveError::InvalidParameter(format!(
                    "range end {:#x} lies below start {:#x}",
                    end, id
                )));
            }
            end
        } else {
            id
        };

        Ok(match kind {
            FilterKind::StandardExact => Slot::StandardExact(pack_standard(id, controller)),
            FilterKind::StandardRange => {
                Slot::StandardRange(pack_standard(id, controller), pack_standard(end, controller))
            }
            FilterKind::ExtendedExact => Slot::ExtendedExact(pack_extended(id, controller)),
            FilterKind::ExtendedRange => {
                Slot::ExtendedRange(pack_extended(id, controller), pack_extended(end, controller))
            }
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Sections {
    standard_exact: Vec<u16>,
    standard_range: Vec<(u16, u16)>,
    extended_exact: Vec<u32>,
    extended_range: Vec<(u32, u32)>,
}

fn insert_sorted<T: Ord + Copy>(section: &mut Vec<T>, value: T) {
    let at = section.partition_point(|existing| *existing <= value);
    section.insert(at, value);
}

fn remove_value<T: PartialEq>(section: &mut Vec<T>, value: &T) -> bool {
    match section.iter().position(|existing| existing == value) {
        Some(at) => {
            section.remove(at);
            true
        }
        None => false,
    }
}

impl Sections {
    fn standard_exact_words(&self) -> usize {
        (self.standard_exact.len() + 1) / 2
    }

    fn total_words(&self) -> usize {
        self.standard_exact_words()
            + self.standard_range.len()
            + self.extended_exact.len()
            + 2 * self.extended_range.len()
    }

    /// Words the table grows by when `slot` is inserted.
    fn growth(&self, slot: &Slot) -> usize {
        match slot {
            // An odd section already has a disabled half-word to fill.
            Slot::StandardExact(_) => (self.standard_exact.len() % 2 == 0) as usize,
            Slot::StandardRange(..) | Slot::ExtendedExact(_) => 1,
            Slot::ExtendedRange(..) => 2,
        }
    }

    fn section_is_empty(&self, slot: &Slot) -> bool {
        match slot {
            Slot::StandardExact(_) => self.standard_exact.is_empty(),
            Slot::StandardRange(..) => self.standard_range.is_empty(),
            Slot::ExtendedExact(_) => self.extended_exact.is_empty(),
            Slot::ExtendedRange(..) => self.extended_range.is_empty(),
        }
    }

    fn contains(&self, slot: &Slot) -> bool {
        match *slot {
            Slot::StandardExact(v) => self.standard_exact.contains(&v),
            Slot::StandardRange(lo, hi) => self.standard_range.contains(&(lo, hi)),
            Slot::ExtendedExact(v) => self.extended_exact.contains(&v),
            Slot::ExtendedRange(lo, hi) => self.extended_range.contains(&(lo, hi)),
        }
    }

    fn insert(&mut self, slot: Slot) {
        match slot {
            Slot::StandardExact(v) => insert_sorted(&mut self.standard_exact, v),
            Slot::StandardRange(lo, hi) => insert_sorted(&mut self.standard_range, (lo, hi)),
            Slot::ExtendedExact(v) => insert_sorted(&mut self.extended_exact, v),
            Slot::ExtendedRange(lo, hi) => insert_sorted(&mut self.extended_range, (lo, hi)),
        }
    }

    fn remove(&mut self, slot: &Slot) -> bool {
        match *slot {
            Slot::StandardExact(v) => remove_value(&mut self.standard_exact, &v),
            Slot::StandardRange(lo, hi) => remove_value(&mut self.standard_range, &(lo, hi)),
            Slot::ExtendedExact(v) => remove_value(&mut self.extended_exact, &v),
            Slot::ExtendedRange(lo, hi) => remove_value(&mut self.extended_range, &(lo, hi)),
        }
    }

    fn packed_words(&self) -> Vec<u32> {
        let mut words = Vec::with_capacity(self.total_words());
        for pair in self.standard_exact.chunks(2) {
            let low = pair.get(1).copied().unwrap_or(DISABLED_SLOT);
            words.push(((pair[0] as u32) << 16) | low as u32);
        }
        for &(lo, hi) in &self.standard_range {
            words.push(((lo as u32) << 16) | hi as u32);
        }
        words.extend_from_slice(&self.extended_exact);
        for &(lo, hi) in &self.extended_range {
            words.push(lo);
            words.push(hi);
        }
        words
    }

    fn bounds(&self) -> SectionBounds {
        let standard_range = 4 * self.standard_exact_words() as u32;
        let extended_exact = standard_range + 4 * self.standard_range.len() as u32;
        let extended_range = extended_exact + 4 * self.extended_exact.len() as u32;
        SectionBounds {
            standard_exact: 0,
            standard_range,
            extended_exact,
            extended_range,
            end_of_table: extended_range + 8 * self.extended_range.len() as u32,
        }
    }

    fn entries(&self) -> Vec<FilterEntry> {
        let standard = |id, end, kind, controller| FilterEntry {
            identifier: id,
            end_of_range: end,
            format: IdFormat::Standard,
            kind,
            controller,
        };
        let extended = |id, end, kind, controller| FilterEntry {
            identifier: id,
            end_of_range: end,
            format: IdFormat::Extended,
            kind,
            controller,
        };

        let mut entries = Vec::new();
        for &slot in &self.standard_exact {
            let (id, controller) = unpack_standard(slot);
            entries.push(standard(id, None, FilterKind::StandardExact, controller));
        }
        for &(lo, hi) in &self.standard_range {
            let (id, controller) = unpack_standard(lo);
            let (end, _) = unpack_standard(hi);
            entries.push(standard(id, Some(end), FilterKind::StandardRange, controller));
        }
        for &word in &self.extended_exact {
            let (id, controller) = unpack_extended(word);
            entries.push(extended(id, None, FilterKind::ExtendedExact, controller));
        }
        for &(lo, hi) in &self.extended_range {
            let (id, controller) = unpack_extended(lo);
            let (end, _) = unpack_extended(hi);
            entries.push(extended(id, Some(end), FilterKind::ExtendedRange, controller));
        }
        entries
    }
}

/// Acceptance filter table mirrored into a [`FilterBank`]
pub struct FilterTable<B: FilterBank> {
    bank: B,
    capacity_words: usize,
    sections: Sections,
}

impl<B: FilterBank> FilterTable<B> {
    pub fn new(bank: B) -> Self {
        Self::with_capacity(bank, DEFAULT_CAPACITY_WORDS)
    }

    pub fn with_capacity(bank: B, capacity_words: usize) -> Self {
        Self {
            bank,
            capacity_words,
            sections: Sections::default(),
        }
    }

    pub fn bank(&self) -> &B {
        &self.bank
    }

    pub fn bank_mut(&mut self) -> &mut B {
        &mut self.bank
    }

    pub fn capacity_words(&self) -> usize {
        self.capacity_words
    }

    pub fn used_words(&self) -> usize {
        self.sections.total_words()
    }

    pub fn is_enabled(&self) -> bool {
        self.bank.mode() == FilterMode::Active
    }

    /// Start consulting the table for incoming frames.
    pub fn enable(&mut self) {
        tracing::debug!("acceptance filter enabled");
        self.bank.set_mode(FilterMode::Active);
    }

    /// Accept all traffic regardless of table contents.
    pub fn disable(&mut self) {
        tracing::debug!("acceptance filter bypassed");
        self.bank.set_mode(FilterMode::Bypass);
    }

    pub fn entries(&self) -> Vec<FilterEntry> {
        self.sections.entries()
    }

    pub fn bounds(&self) -> SectionBounds {
        self.sections.bounds()
    }

    pub fn packed_words(&self) -> Vec<u32> {
        self.sections.packed_words()
    }

    /// Software model of the hardware decision for one incoming frame.
    pub fn accepts(&self, id: CanId, format: IdFormat, controller: Controller) -> bool {
        if !self.is_enabled() {
            return true;
        }
        if format.check(id).is_err() {
            return false;
        }
        match format {
            IdFormat::Standard => {
                let key = pack_standard(id, controller);
                self.sections.standard_exact.binary_search(&key).is_ok()
                    || self
                        .sections
                        .standard_range
                        .iter()
                        .any(|&(lo, hi)| lo <= key && key <= hi)
            }
            IdFormat::Extended => {
                let key = pack_extended(id, controller);
                self.sections.extended_exact.binary_search(&key).is_ok()
                    || self
                        .sections
                        .extended_range
                        .iter()
                        .any(|&(lo, hi)| lo <= key && key <= hi)
            }
        }
    }

    /// Insert a filter at its sorted position; later sections shift toward the table end.
    pub fn add_filter(
        &mut self,
        kind: FilterKind,
        id: CanId,
        range_end: Option<CanId>,
        controller: Controller,
    ) -> Result<()> {
        let slot = Slot::encode(kind, id, range_end, controller)?;
        self.ensure_room(&slot, 0)?;
        tracing::debug!(?kind, id = %format_args!("{:#x}", id), ?controller, "filter add");
        self.commit(|sections| sections.insert(slot))
    }

    /// Remove a filter and close the gap.
    ///
    /// Returns `Ok(false)` when there was nothing to remove: the section is
    /// empty, or a standard-exact entry is absent.
    pub fn remove_filter(
        &mut self,
        kind: FilterKind,
        id: CanId,
        range_end: Option<CanId>,
        controller: Controller,
    ) -> Result<bool> {
        let slot = Slot::encode(kind, id, range_end, controller)?;
        if self.sections.section_is_empty(&slot) {
            return Ok(false);
        }
        if !self.sections.contains(&slot) {
            return match kind {
                FilterKind::StandardExact => Ok(false),
                _ => Err(AutomotiveError::FilterNotFound),
            };
        }
        tracing::debug!(?kind, id = %format_args!("{:#x}", id), ?controller, "filter remove");
        self.commit(|sections| sections.remove(&slot))
    }

    fn ensure_room(&self, slot: &Slot, freed_words: usize) -> Result<()> {
        let needed = self.sections.total_words() - freed_words + self.sections.growth(slot);
        if needed > self.capacity_words {
            tracing::warn!(needed, capacity = self.capacity_words, "filter table full");
            return Err(AutomotiveError::FilterTableFull);
        }
        Ok(())
    }

    /// Apply `change` with the bank bypassed, write the new layout, restore the previous mode.
    ///
    /// A failed bank write leaves the logical table as it was.
    fn commit<R>(&mut self, change: impl FnOnce(&mut Sections) -> R) -> Result<R> {
        let prior_mode = self.bank.mode();
        let snapshot = self.sections.clone();
        self.bank.set_mode(FilterMode::Bypass);

        let result = change(&mut self.sections);
        let written = self
            .bank
            .write_table(&self.sections.packed_words(), &self.sections.bounds());

        if written.is_err() {
            self.sections = snapshot;
        }
        self.bank.set_mode(prior_mode);
        written.map(|_| result)
    }

    /// Remove any identical entry and insert `slot` in one table rewrite.
    fn rearm_exact(&mut self, slot: Slot) -> Result<()> {
        let freed = if self.sections.contains(&slot) {
            let mut probe = self.sections.clone();
            probe.remove(&slot);
            self.sections.total_words() - probe.total_words()
        } else {
            0
        };
        self.ensure_room(&slot, freed)?;
        self.commit(|sections| {
            sections.remove(&slot);
            sections.insert(slot);
        })
    }
}

impl<B: FilterBank> SessionFilter for FilterTable<B> {
    fn set_filter_for_session(
        &mut self,
        op: FilterOp,
        id: u32,
        arg: u32,
        controller: Controller,
    ) -> Result<bool> {
        let (id, format) = IdFlags::untag(id);
        let (range_end, _) = IdFlags::untag(arg);
        match op {
            FilterOp::ExactAdd => {
                let slot = Slot::encode(FilterKind::exact(format), id, None, controller)?;
                self.rearm_exact(slot)?;
                Ok(true)
            }
            FilterOp::ExactRemove => self.remove_filter(FilterKind::exact(format), id, None, controller),
            FilterOp::RangeAdd => {
                self.add_filter(FilterKind::range(format), id, Some(range_end), controller)?;
                Ok(true)
            }
            FilterOp::RangeRemove => {
                self.remove_filter(FilterKind::range(format), id, Some(range_end), controller)
            }
        }
    }

    fn set_filtering(&mut self, enabled: bool) {
        if enabled {
            self.enable();
        } else {
            self.disable();
        }
    }
}
