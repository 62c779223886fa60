//! Server-to-client notifications over STOMP.

pub mod channel;
pub mod frame;
pub mod registry;

pub use channel::{ConnectionState, PushChannel, PushError, Subscription, TokenSource};
pub use frame::{Command, Frame, FrameError};
pub use registry::{PushDelivery, PushHandler};
