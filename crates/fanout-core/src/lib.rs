//! fanout engine.
//!
//! Keeps one inbound and one outbound stream per (peer, protocol) on top
//! of a `fanout-transport` overlay, prunes streams to peers that dropped
//! off, and fans payloads out to every live stream while reporting
//! per-peer failures.
//!
//! Payloads are opaque bytes on the fan-out path. Inbound streams are
//! read as newline-delimited text frames and handed to a [`FrameSink`].

pub mod broadcast;
pub mod channels;
pub mod config;
pub mod discovery;
pub mod error;
pub mod handle;
pub mod liveness;
pub mod ping;
pub mod reader;
pub mod result;
pub mod table;

pub use broadcast::BroadcastService;
pub use channels::Channels;
pub use config::{DiscoveryMode, FanoutConfig, DEFAULT_PROTOCOL};
pub use discovery::{Discovered, DiscoveryBridge};
pub use error::FanoutError;
pub use handle::{Direction, StreamHandle};
pub use liveness::LivenessProber;
pub use ping::{PingMessage, PingService, PING_REQUEST, PING_RESPONSE};
pub use reader::{read_loop, FrameSink, InboundFrame, NullSink};
pub use result::{BroadcastResult, Delivery, OpenFailure, PeerDelivery};
pub use table::{Ensured, PeerStreamTable};
