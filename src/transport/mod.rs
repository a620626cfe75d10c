pub mod isotp;
pub mod keepalive;
pub mod tp20;

use crate::data_link::{Controller, FilterOp, SessionFilter};
use crate::error::Result;
use crate::types::{CanId, IdFlags, IdFormat};
use std::time::Duration;

/// Transport contract consumed by diagnostic clients; implemented by ISO-TP and TP2.0 sessions
pub trait DiagnosticTransport: Send {
    fn write(&mut self, payload: &[u8]) -> Result<()>;
    fn read(&mut self) -> Result<Vec<u8>>;
    /// Send `request` and wait for the reassembled reply.
    fn request_response_client(&mut self, request: &[u8]) -> Result<Vec<u8>>;
    fn set_timeouts(&mut self, request: Duration, response: Duration);
    /// Receive-interrupt hook: serve unsolicited peer frames while no request is in flight.
    fn on_receive_interrupt(&mut self) {}
    /// Periodic timer hook: keep-alive and liveness checks.
    fn on_timer_tick(&mut self) {}
}

/// Exact-match filter entries a session has installed for its identifier pair.
///
/// Both controller halves get the same entries. Installing a new pair always
/// retracts the previous one first.
#[derive(Debug, Default)]
pub(crate) struct SessionFilterSet {
    installed: Option<[u32; 2]>,
}

impl SessionFilterSet {
    pub(crate) fn is_active(&self) -> bool {
        self.installed.is_some()
    }

    pub(crate) fn install<F: SessionFilter>(
        &mut self,
        filters: &mut F,
        own: CanId,
        peer: CanId,
        format: IdFormat,
    ) -> Result<()> {
        self.retract(filters)?;

        let ids = [IdFlags::tag(own, format), IdFlags::tag(peer, format)];
        for controller in Controller::ALL {
            for id in ids {
                if let Err(err) = filters.set_filter_for_session(FilterOp::ExactAdd, id, 0, controller) {
                    tracing::warn!(%err, "session filter install failed, rolling back");
                    Self::remove_all(filters, ids);
                    return Err(err);
                }
            }
        }
        filters.set_filtering(true);
        self.installed = Some(ids);
        tracing::debug!(
            own = %format_args!("{:#x}", own),
            peer = %format_args!("{:#x}", peer),
            "session filters installed"
        );
        Ok(())
    }

    pub(crate) fn retract<F: SessionFilter>(&mut self, filters: &mut F) -> Result<()> {
        let Some(ids) = self.installed.take() else {
            return Ok(());
        };
        filters.set_filtering(false);
        let mut result = Ok(());
        for controller in Controller::ALL {
            for id in ids {
                if let Err(err) = filters.set_filter_for_session(FilterOp::ExactRemove, id, 0, controller) {
                    result = Err(err);
                }
            }
        }
        tracing::debug!("session filters retracted");
        result
    }

    fn remove_all<F: SessionFilter>(filters: &mut F, ids: [u32; 2]) {
        for controller in Controller::ALL {
            for id in ids {
                if let Err(err) = filters.set_filter_for_session(FilterOp::ExactRemove, id, 0, controller) {
                    tracing::warn!(
                        %err,
                        id = %format_args!("{:#x}", id),
                        ?controller,
                        "rollback left a session filter behind"
                    );
                }
            }
        }
    }
}
