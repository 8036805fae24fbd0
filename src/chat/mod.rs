pub mod bootstrap; // HTTP-only preflight: session state + message history
pub mod client; // Owned per-application binding and socket loop
pub mod connection; // Socket lifecycle state machine with bounded reconnect
pub mod protocol; // Typed wire frames (inbound + outbound)
pub mod state; // Presentation phase derivation
pub mod transcript; // Append-only message log with monotonic ids

pub use bootstrap::{HttpSessionApi, SessionApi, SessionBootstrapper};
pub use client::{ChatClient, ChatCommand, ChatHandle, ChatMetrics, ChatSnapshot, ChatUpdate};
pub use connection::{ConnState, ConnectionManager, Directive, ReconnectPolicy, SocketEvent};
pub use protocol::{ClientFrame, ServerEvent};
pub use state::{ChatPhase, StateInputs};
pub use transcript::Transcript;
