//! Signaling relay: hands out participant ids, keeps the live roster, and
//! forwards addressed envelopes between participants without interpreting them.

pub mod config;
pub mod relay;
pub mod server;

pub use config::{Cli, RelayConfig};
pub use relay::{Delivery, IdGenerator, Outbox, RandomIds, Relay, ScriptedIds};
pub use server::router;
