//! Notifications from a connection to its owner.
//!
//! Every hook has a no-op default so a host only implements what it cares about.
//! Hooks run on the connection's driver task; they must not block.

use crate::core::event::Event;
use crate::core::header::EventType;
use crate::error::ProtocolError;
use crate::protocol::token::TokenRecord;
use crate::utils::throughput::DataProgress;

pub trait ConnectionDelegate: Send + Sync + 'static {
    /// Authentication with an existing token succeeded
    fn token_confirmed(&self, _record: &TokenRecord) {}

    /// A token was acquired with the password while opening
    fn token_received(&self, _record: &TokenRecord) {}

    /// The connection token string changed during a refresh and has to be persisted
    fn token_refreshed(&self, _record: &TokenRecord) {}

    /// The Miniserver rejected the token used to open
    fn token_invalid(&self) {}

    /// An open connection went down. Not called when `open()` itself fails.
    fn connection_closed(&self, _reason: &ProtocolError) {}

    fn event_received(&self, _events: &[Event], _event_type: EventType) {}

    /// Download progress; `None` while the payload size is unknown
    fn data_progress(&self, _progress: Option<&DataProgress>) {}
}

/// Delegate that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDelegate;

impl ConnectionDelegate for NoopDelegate {}
