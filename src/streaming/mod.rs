// Notification stream module
// Persistent server-push connection with bounded reconnects and typed dispatch

pub mod bus;
pub mod client;
pub mod events;
pub mod reconnect;
pub mod sse;
pub mod transport;

pub use bus::{Callback, EventBus, SubscriptionId};
pub use client::{stream_url, EventStreamClient, StreamSettings};
pub use events::{ConnectionState, Notification, NotificationEvent, CONNECTION_STATUS_CHANGED};
pub use reconnect::ReconnectPolicy;
pub use sse::{SseFrame, SseParser};
pub use transport::{FrameStream, SseTransport, StreamTransport};
