//! Chat gateway plumbing for memento.
//!
//! One websocket connection carries both request/response actions (matched by
//! `echo`) and unsolicited events (fanned out to handlers). Nothing here knows
//! about storage or titles.

mod correlation;
mod dispatcher;
mod error;
mod traits;
mod transport;
mod types;

pub use correlation::{CorrelationTable, ResponseSlot};
pub use dispatcher::Dispatcher;
pub use error::{GatewayError, Result};
pub use traits::{EventHandler, GatewayClient};
pub use transport::{DEFAULT_CALL_TIMEOUT, Transport, TransportConfig};
pub use types::{
    Action, ActionReply, ChatEvent, InboundFrame, SEGMENT_FORWARD, SEGMENT_IMAGE, SEGMENT_NODE,
    SEGMENT_TEXT, Segment, SegmentData, SegmentKind, Sender, decode_frame,
};
