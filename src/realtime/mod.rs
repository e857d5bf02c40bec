//! Realtime subscriptions over WebSocket.
//!
//! Clients register path subscriptions (optionally with a child query). Every store
//! change is matched against them in store order, projected to what each subscription
//! watches, checked against the read rule for that client, and queued on the client's
//! bounded transport.

mod dispatcher;
mod handle;
mod messages;
mod subscription;
mod transport;

pub use dispatcher::{ClientId, DispatchReport, Dispatcher, DispatcherStats};
pub use handle::{spawn_dispatcher, Command, DispatcherHandle};
pub use messages::{ClientMessage, EventMessage, ServerMessage, SubscribeRequest};
pub use subscription::{EventKind, Filter, FilterOp, QuerySpec};
pub use transport::{ChannelTransport, ClientTransport, TransportError};

#[cfg(test)]
#[path = "realtime_tests.rs"]
mod realtime_tests;
