//! Physical layer access for the diagnostic transports.
//!
//! Both transports talk to the bus through the [`CanLink`] capability:
//! - timed send of a single frame
//! - timed receive, optionally restricted to one identifier
//! - bitrate and bus-silent monitor mode control
//!
//! [`can::Can`] implements the capability over a platform [`Port`](crate::types::Port);
//! the `mock` module provides a scripted bus for tests.
//!
//! # Examples
//!
//! ```rust,no_run
//! use libcandiag::physical::can::{Can, CanBitrate, CanOptions};
//! # struct P;
//! # impl libcandiag::types::Port for P {
//! #     fn send(&mut self, _: &libcandiag::types::Frame) -> libcandiag::error::Result<()> { unimplemented!() }
//! #     fn receive(&mut self) -> libcandiag::error::Result<Option<libcandiag::types::Frame>> { unimplemented!() }
//! #     fn set_timeout(&mut self, _: u32) -> libcandiag::error::Result<()> { unimplemented!() }
//! # }
//! # fn port() -> impl libcandiag::types::Port { P }
//!
//! let link = Can::with_bitrate(port(), CanBitrate::Rate500K, CanOptions::NONE);
//! ```

pub mod can;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

use crate::error::Result;
use crate::types::{CanId, Frame};
use std::time::Duration;

/// Bus access consumed by the transports.
pub trait CanLink: Send {
    /// Queue `frame` and wait up to `timeout` for the controller to accept it.
    fn send(&mut self, frame: &Frame, timeout: Duration) -> Result<()>;
    /// Wait up to `timeout` for a frame, only returning frames whose identifier equals `id_filter` if set.
    fn receive(&mut self, id_filter: Option<CanId>, timeout: Duration) -> Option<Frame>;
    fn set_bitrate(&mut self, bitrate: u32) -> Result<()>;
    /// Monitor mode keeps the controller off the bus: no ACKs, no transmissions.
    fn set_monitor_mode(&mut self, enabled: bool) -> Result<()>;
}

impl<L: CanLink + ?Sized> CanLink for Box<L> {
    fn send(&mut self, frame: &Frame, timeout: Duration) -> Result<()> {
        (**self).send(frame, timeout)
    }

    fn receive(&mut self, id_filter: Option<CanId>, timeout: Duration) -> Option<Frame> {
        (**self).receive(id_filter, timeout)
    }

    fn set_bitrate(&mut self, bitrate: u32) -> Result<()> {
        (**self).set_bitrate(bitrate)
    }

    fn set_monitor_mode(&mut self, enabled: bool) -> Result<()> {
        (**self).set_monitor_mode(enabled)
    }
}
