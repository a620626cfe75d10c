use super::CanLink;
use crate::error::{AutomotiveError, Result};
use crate::types::{CanId, Config, Frame, Port};
use bitflags::bitflags;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// CAN configuration
#[derive(Debug, Clone)]
pub struct CanConfig {
    pub bitrate: u32,
    pub sample_point: f32,
    pub sjw: u8,
    pub options: CanOptions,
}

/// CAN bitrate configurations
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CanBitrate {
    Rate1M,               // 1Mbit/sec, 75% sample point
    Rate500K,             // 500kbit/sec, 75% sample point
    Rate250K,             // 250kbit/sec, 75% sample point
    Rate125K,             // 125kbit/sec, 75% sample point
    Rate100K,             // 100kbit/sec, 75% sample point
    Custom(u32, f32, u8), // Custom bitrate, sample point, and SJW
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CanOptions: u32 {
        const NONE = 0;
        const LOOPBACK = 1;
        const LISTEN_ONLY = 2;
        const ONE_SHOT = 8;
    }
}

impl Config for CanConfig {
    fn validate(&self) -> Result<()> {
        if self.bitrate == 0 {
            return Err(AutomotiveError::InvalidParameter("bitrate must be non-zero".into()));
        }
        if self.sample_point <= 0.0 || self.sample_point >= 1.0 {
            return Err(AutomotiveError::InvalidParameter("sample point outside (0, 1)".into()));
        }
        if self.sjw == 0 {
            return Err(AutomotiveError::InvalidParameter("SJW must be non-zero".into()));
        }
        Ok(())
    }
}

const RX_QUEUE_SIZE: usize = 128;

/// CAN controller driven through a platform port.
///
/// Frames that arrive while the caller waits for a different identifier are
/// parked and handed out by a later `receive` that asks for them.
pub struct Can<P: Port> {
    config: CanConfig,
    port: P,
    parked: VecDeque<Frame>,
    dropped: u64,
}

impl<P: Port> Can<P> {
    /// Creates a new CAN instance with the given port
    pub fn with_port(config: CanConfig, port: P) -> Self {
        Self {
            config,
            port,
            parked: VecDeque::with_capacity(RX_QUEUE_SIZE),
            dropped: 0,
        }
    }

    /// Configure CAN controller with standard bitrate profile
    pub fn with_bitrate(port: P, bitrate: CanBitrate, options: CanOptions) -> Self {
        let (rate, sample_point, sjw) = match bitrate {
            CanBitrate::Rate1M => (1_000_000, 0.75, 1),
            CanBitrate::Rate500K => (500_000, 0.75, 1),
            CanBitrate::Rate250K => (250_000, 0.75, 1),
            CanBitrate::Rate125K => (125_000, 0.75, 1),
            CanBitrate::Rate100K => (100_000, 0.75, 1),
            CanBitrate::Custom(rate, sp, s) => (rate, sp, s),
        };

        let config = CanConfig {
            bitrate: rate,
            sample_point,
            sjw,
            options,
        };

        Self::with_port(config, port)
    }

    pub fn config(&self) -> &CanConfig {
        &self.config
    }

    /// Get number of frames parked for a later receive
    pub fn rx_pending(&self) -> usize {
        self.parked.len()
    }

    /// Frames discarded because the park queue was full
    pub fn rx_dropped(&self) -> u64 {
        self.dropped
    }

    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    fn park(&mut self, frame: Frame) {
        if self.parked.len() >= RX_QUEUE_SIZE {
            self.parked.pop_front();
            self.dropped += 1;
            tracing::warn!(dropped = self.dropped, "receive queue full, oldest frame dropped");
        }
        self.parked.push_back(frame);
    }

    fn take_parked(&mut self, id_filter: Option<CanId>) -> Option<Frame> {
        let index = self
            .parked
            .iter()
            .position(|frame| id_filter.map_or(true, |id| frame.id() == id))?;
        self.parked.remove(index)
    }

    fn apply_config(&mut self) -> Result<()> {
        self.config.validate()?;
        let listen_only = self.config.options.contains(CanOptions::LISTEN_ONLY);
        self.port.configure(self.config.bitrate, listen_only)
    }
}

fn millis(duration: Duration) -> u32 {
    duration.as_millis().min(u32::MAX as u128) as u32
}

impl<P: Port> CanLink for Can<P> {
    fn send(&mut self, frame: &Frame, timeout: Duration) -> Result<()> {
        if self.config.options.contains(CanOptions::LISTEN_ONLY) {
            return Err(AutomotiveError::LinkError("controller is in monitor mode".into()));
        }
        self.port.set_timeout(millis(timeout))?;
        self.port.send(frame)?;
        tracing::trace!(?frame, "tx");
        Ok(())
    }

    fn receive(&mut self, id_filter: Option<CanId>, timeout: Duration) -> Option<Frame> {
        if let Some(frame) = self.take_parked(id_filter) {
            return Some(frame);
        }

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if self.port.set_timeout(millis(remaining)).is_err() {
                return None;
            }
            match self.port.receive() {
                Ok(Some(frame)) => {
                    tracing::trace!(?frame, "rx");
                    if id_filter.map_or(true, |id| frame.id() == id) {
                        return Some(frame);
                    }
                    self.park(frame);
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::debug!(%err, "port receive failed");
                    return None;
                }
            }
            if remaining.is_zero() {
                return None;
            }
        }
    }

    fn set_bitrate(&mut self, bitrate: u32) -> Result<()> {
        let previous = self.config.bitrate;
        self.config.bitrate = bitrate;
        if let Err(err) = self.apply_config() {
            self.config.bitrate = previous;
            return Err(err);
        }
        Ok(())
    }

    fn set_monitor_mode(&mut self, enabled: bool) -> Result<()> {
        self.config.options.set(CanOptions::LISTEN_ONLY, enabled);
        self.apply_config()
    }
}
