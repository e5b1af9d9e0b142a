//! Nickname-based TCP chat: one server routing public and private lines
//! between connected clients, plus a terminal client.
//!
//! See `README.md` for usage and the wire format. Modules:
//!
//! - [`cli`] parses the flags shared by server and client mode.
//! - [`server`] accepts TCP connections and runs the per-connection
//!   nickname handshake and read loop.
//! - [`registry`] owns the nickname to connection mapping and routes each
//!   chat line to its recipients under a single lock.
//! - [`protocol`] holds the exact wire strings, chat line classification and
//!   the async line read/write helpers.
//! - [`client`] connects to a server and bridges it with the terminal.

pub mod cli;
pub mod client;
pub mod protocol;
pub mod registry;
pub mod server;
