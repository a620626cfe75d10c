use super::CanLink;
use crate::error::{AutomotiveError, Result};
use crate::types::{CanId, Frame};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// Scripted peer: sees every transmitted frame and returns the frames it puts on the bus in reply.
pub type MockResponder = Box<dyn FnMut(&Frame) -> Vec<Frame> + Send>;

struct MockState {
    responder: Option<MockResponder>,
    incoming: VecDeque<Frame>,
    sent: Vec<Frame>,
    fail_sends: bool,
    bitrate: u32,
    monitor_mode: bool,
}

/// Mock bus for testing.
///
/// Clones share the same bus, so a test can keep a handle while a session owns the link.
#[derive(Clone)]
pub struct MockLink {
    state: Arc<Mutex<MockState>>,
}

impl MockLink {
    /// Creates a new mock link with a custom responder
    pub fn new(responder: Option<MockResponder>) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                responder,
                incoming: VecDeque::new(),
                sent: Vec::new(),
                fail_sends: false,
                bitrate: 500_000,
                monitor_mode: false,
            })),
        }
    }

    pub fn with_responder<F>(responder: F) -> Self
    where
        F: FnMut(&Frame) -> Vec<Frame> + Send + 'static,
    {
        Self::new(Some(Box::new(responder)))
    }

    /// A bus where nobody answers
    pub fn silent() -> Self {
        Self::new(None)
    }

    /// Creates a new mock link whose sends always fail
    pub fn new_error() -> Self {
        let link = Self::silent();
        link.set_send_failure(true);
        link
    }

    pub fn set_responder<F>(&self, responder: F)
    where
        F: FnMut(&Frame) -> Vec<Frame> + Send + 'static,
    {
        self.state.lock().responder = Some(Box::new(responder));
    }

    pub fn set_send_failure(&self, fail: bool) {
        self.state.lock().fail_sends = fail;
    }

    /// Puts `frame` on the bus as if a peer had sent it unprompted.
    pub fn inject(&self, frame: Frame) {
        self.state.lock().incoming.push_back(frame);
    }

    pub fn sent(&self) -> Vec<Frame> {
        self.state.lock().sent.clone()
    }

    pub fn take_sent(&self) -> Vec<Frame> {
        std::mem::take(&mut self.state.lock().sent)
    }

    /// Frames waiting to be received
    pub fn pending(&self) -> usize {
        self.state.lock().incoming.len()
    }

    pub fn bitrate(&self) -> u32 {
        self.state.lock().bitrate
    }

    pub fn monitor_mode(&self) -> bool {
        self.state.lock().monitor_mode
    }
}

impl CanLink for MockLink {
    fn send(&mut self, frame: &Frame, _timeout: Duration) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_sends {
            return Err(AutomotiveError::LinkError("mock send failure".into()));
        }
        if state.monitor_mode {
            return Err(AutomotiveError::LinkError("controller is in monitor mode".into()));
        }
        state.sent.push(frame.clone());
        let replies = match state.responder.as_mut() {
            Some(responder) => responder(frame),
            None => Vec::new(),
        };
        state.incoming.extend(replies);
        Ok(())
    }

    fn receive(&mut self, id_filter: Option<CanId>, _timeout: Duration) -> Option<Frame> {
        let mut state = self.state.lock();
        let index = state
            .incoming
            .iter()
            .position(|frame| id_filter.map_or(true, |id| frame.id() == id))?;
        state.incoming.remove(index)
    }

    fn set_bitrate(&mut self, bitrate: u32) -> Result<()> {
        if bitrate == 0 {
            return Err(AutomotiveError::InvalidParameter("bitrate must be non-zero".into()));
        }
        self.state.lock().bitrate = bitrate;
        Ok(())
    }

    fn set_monitor_mode(&mut self, enabled: bool) -> Result<()> {
        self.state.lock().monitor_mode = enabled;
        Ok(())
    }
}
