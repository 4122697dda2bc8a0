//! Local message relay.
//!
//! Client processes connect to one broker over localhost TCP. Whenever a
//! client sends a message, the broker forwards it to every other connected
//! client and never back to the sender. Each module owns one concern:
//!
//! - [`registry`] keeps the set of live connections and mints their ids.
//! - [`relay`] forwards one message to every other connection, removing peers
//!   that turn out to be gone.
//! - [`lifecycle`] drives a single connection from acceptance to close or
//!   cancellation.
//! - [`diagnostics`] is the serialized, append-only diagnostic log.
//! - [`channel`] defines what the broker needs from a connection: a
//!   [`channel::Channel`] to send on and a stream of inbound requests.
//! - [`message`] holds the message model and the JSON line protocol.
//! - [`transport`] and [`broker`] put the above on TCP sockets.
//! - [`client`] is the client side of the protocol plus a terminal front end.
//! - [`cli`] parses the command-line interface.

pub mod broker;
pub mod channel;
pub mod cli;
pub mod client;
pub mod diagnostics;
pub mod lifecycle;
pub mod message;
pub mod registry;
pub mod relay;
pub mod transport;
