//! Control plane for distributed telemetry samplers.
//!
//! Samplers and operator clients hold long-lived bidirectional streams to a central
//! server. The server keeps the desired configuration of every logical sampler and
//! pushes it to each connected instance with a level-triggered reconciliation loop,
//! so configuration converges across reconnects and server restarts.
//!
//! Layers, bottom up: [`transport`] (framed CBOR over TCP/TLS or in-memory pipes),
//! [`stream`] (registration handshake, FIFO request/response, reconnection),
//! [`registry`] and [`server`] (authoritative state and reconciliation) and [`sdk`]
//! (client and sampler).

pub mod control;
pub mod logging;
pub mod messages;
pub mod registry;
pub mod sdk;
pub mod server;
pub mod stream;
pub mod transport;

pub use control::{SamplerConfig, SamplerConfigUpdate, SamplerSummary};
pub use registry::{ClientRegistry, SamplerRegistry};
pub use sdk::{Client, ClientError, ClientOptions, Sampler, SamplerEvent, SamplerOptions};
pub use server::{Server, ServerError, ServerOptions};
pub use stream::{StreamEngine, StreamError, StreamOptions, StreamState};
