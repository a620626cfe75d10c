//! Data link layer: the CAN controller's hardware acceptance filter.
//!
//! [`FilterTable`] keeps the logical filter list; a [`FilterBank`] is the
//! hardware it is mirrored into. Transports only see the narrow
//! [`SessionFilter`] capability.

pub mod filter_table;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use filter_table::{FilterEntry, FilterKind, FilterTable, SectionBounds, DISABLED_SLOT};

use crate::error::{AutomotiveError, Result};
use parking_lot::Mutex;
use std::sync::Arc;

/// Acceptance filter operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterMode {
    /// Only frames matching the table reach the receive path
    Active,
    /// Every frame is accepted; the table may be rewritten
    Bypass,
}

/// Controller half of the acceptance filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Controller {
    Can1 = 1,
    Can2 = 2,
}

impl Controller {
    pub const ALL: [Controller; 2] = [Controller::Can1, Controller::Can2];

    pub fn from_index(index: u8) -> Result<Self> {
        match index {
            1 => Ok(Controller::Can1),
            2 => Ok(Controller::Can2),
            _ => Err(AutomotiveError::InvalidParameter(format!(
                "controller index {} is not 1 or 2",
                index
            ))),
        }
    }

    /// Value of the SCC field in a packed table entry
    pub(crate) fn field(self) -> u32 {
        self as u32 - 1
    }

    pub(crate) fn from_field(field: u32) -> Self {
        if field == 0 {
            Controller::Can1
        } else {
            Controller::Can2
        }
    }
}

/// Filter RAM and mode register of a CAN peripheral
pub trait FilterBank: Send {
    fn mode(&self) -> FilterMode;
    fn set_mode(&mut self, mode: FilterMode);
    /// Copy the packed look-up table and its section start addresses into the peripheral.
    /// Only valid while the bank is in [`FilterMode::Bypass`].
    fn write_table(&mut self, words: &[u32], bounds: &SectionBounds) -> Result<()>;
}

/// High-level filter request issued by a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    ExactAdd,
    ExactRemove,
    RangeAdd,
    RangeRemove,
}

/// What a transport session needs from the filter table.
///
/// `id` carries [`IdFlags::EXTENDED`](crate::types::IdFlags) for 29-bit identifiers;
/// `arg` is the inclusive range end for range operations, tagged or bare, and ignored otherwise.
pub trait SessionFilter: Send {
    fn set_filter_for_session(
        &mut self,
        op: FilterOp,
        id: u32,
        arg: u32,
        controller: Controller,
    ) -> Result<bool>;

    /// Switch between consulting the table and accepting every frame.
    fn set_filtering(&mut self, enabled: bool);
}

impl<T: SessionFilter + ?Sized> SessionFilter for &mut T {
    fn set_filter_for_session(
        &mut self,
        op: FilterOp,
        id: u32,
        arg: u32,
        controller: Controller,
    ) -> Result<bool> {
        (**self).set_filter_for_session(op, id, arg, controller)
    }

    fn set_filtering(&mut self, enabled: bool) {
        (**self).set_filtering(enabled)
    }
}

impl<T: SessionFilter> SessionFilter for Arc<Mutex<T>> {
    fn set_filter_for_session(
        &mut self,
        op: FilterOp,
        id: u32,
        arg: u32,
        controller: Controller,
    ) -> Result<bool> {
        self.lock().set_filter_for_session(op, id, arg, controller)
    }

    fn set_filtering(&mut self, enabled: bool) {
        self.lock().set_filtering(enabled)
    }
}

/// Stand-in for platforms without a hardware filter
#[derive(Debug, Clone, Copy, Default)]
pub struct NoFilter;

impl SessionFilter for NoFilter {
    fn set_filter_for_session(&mut self, _: FilterOp, _: u32, _: u32, _: Controller) -> Result<bool> {
        Ok(true)
    }

    fn set_filtering(&mut self, _enabled: bool) {}
}
