use crate::error::{AutomotiveError, Result};
use bitflags::bitflags;
use std::fmt;

/// CAN ID type
pub type CanId = u32;

/// Largest 11-bit identifier
pub const MAX_STANDARD_ID: CanId = 0x7FF;
/// Largest 29-bit identifier
pub const MAX_EXTENDED_ID: CanId = 0x1FFF_FFFF;
/// Classic CAN payload size
pub const CAN_MAX_DLEN: usize = 8;

bitflags! {
    /// Tag bits carried above the 29-bit identifier when an ID travels as a plain `u32`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IdFlags: u32 {
        const EXTENDED = 0x8000_0000;
        const REMOTE = 0x4000_0000;
    }
}

impl IdFlags {
    /// Tags `id` with the extended flag when `format` is extended.
    pub fn tag(id: CanId, format: IdFormat) -> u32 {
        match format {
            IdFormat::Standard => id,
            IdFormat::Extended => id | IdFlags::EXTENDED.bits(),
        }
    }

    /// Splits a tagged identifier back into the bare ID and its format.
    pub fn untag(tagged: u32) -> (CanId, IdFormat) {
        let flags = IdFlags::from_bits_truncate(tagged);
        let id = tagged & MAX_EXTENDED_ID;
        if flags.contains(IdFlags::EXTENDED) {
            (id, IdFormat::Extended)
        } else {
            (id, IdFormat::Standard)
        }
    }
}

/// Identifier width
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum IdFormat {
    Standard, // 11-bit
    Extended, // 29-bit
}

impl IdFormat {
    pub fn max_id(self) -> CanId {
        match self {
            IdFormat::Standard => MAX_STANDARD_ID,
            IdFormat::Extended => MAX_EXTENDED_ID,
        }
    }

    pub fn check(self, id: CanId) -> Result<()> {
        if id > self.max_id() {
            return Err(AutomotiveError::InvalidParameter(format!(
                "identifier {:#x} does not fit a {:?} frame",
                id, self
            )));
        }
        Ok(())
    }
}

/// Frame type on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Data,
    Remote,
}

/// A classic CAN frame. Immutable once built.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    id: CanId,
    format: IdFormat,
    frame_type: FrameType,
    data: [u8; CAN_MAX_DLEN],
    len: u8,
}

impl Frame {
    /// Builds a data frame, rejecting oversize payloads and out-of-range identifiers.
    pub fn new(id: CanId, format: IdFormat, data: &[u8]) -> Result<Self> {
        Self::with_type(id, format, FrameType::Data, data)
    }

    pub fn with_type(id: CanId, format: IdFormat, frame_type: FrameType, data: &[u8]) -> Result<Self> {
        format.check(id)?;
        if data.len() > CAN_MAX_DLEN {
            return Err(AutomotiveError::InvalidParameter(format!(
                "{} data bytes do not fit a CAN frame",
                data.len()
            )));
        }
        let mut buf = [0u8; CAN_MAX_DLEN];
        buf[..data.len()].copy_from_slice(data);
        Ok(Self {
            id,
            format,
            frame_type,
            data: buf,
            len: data.len() as u8,
        })
    }

    pub fn id(&self) -> CanId {
        self.id
    }

    pub fn format(&self) -> IdFormat {
        self.format
    }

    pub fn frame_type(&self) -> FrameType {
        self.frame_type
    }

    pub fn data(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Byte at `index`, or 0 past the end of the payload.
    pub fn byte(&self, index: usize) -> u8 {
        self.data().get(index).copied().unwrap_or(0)
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame({:#x}", self.id)?;
        if self.format == IdFormat::Extended {
            write!(f, "x")?;
        }
        if self.frame_type == FrameType::Remote {
            write!(f, " RTR")?;
        }
        write!(f, " [")?;
        for (i, b) in self.data().iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{:02X}", b)?;
        }
        write!(f, "])")
    }
}

/// Modulo-16 counter used for ISO-TP sequence numbers and TP2.0 frame counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SequenceCounter(u8);

impl SequenceCounter {
    pub const fn new(value: u8) -> Self {
        Self(value & 0x0F)
    }

    pub fn value(self) -> u8 {
        self.0
    }

    /// Returns the current value and advances, wrapping 15 -> 0.
    pub fn advance(&mut self) -> u8 {
        let current = self.0;
        self.0 = (self.0 + 1) & 0x0F;
        current
    }

    pub fn next(self) -> Self {
        Self((self.0 + 1) & 0x0F)
    }
}

/// Configuration trait that must be implemented by all protocol configurations
pub trait Config: Send + Sync {
    fn validate(&self) -> crate::error::Result<()>;
}

/// Port trait that must be implemented by platform-specific code
pub trait Port: Send {
    fn send(&mut self, frame: &Frame) -> crate::error::Result<()>;
    /// Next frame from the controller, `Ok(None)` if nothing arrived within the port timeout.
    fn receive(&mut self) -> crate::error::Result<Option<Frame>>;
    fn set_timeout(&mut self, timeout_ms: u32) -> crate::error::Result<()>;
    /// Reprogram bus timing and listen-only mode. Ports without the knobs accept silently.
    fn configure(&mut self, _bitrate: u32, _listen_only: bool) -> crate::error::Result<()> {
        Ok(())
    }
}
