//! Line-oriented chat relay that shares one room across processes.
//!
//! Clients connect over TCP, answer an alias prompt, and every line they send
//! is broadcast to all participants as `[alias]:text`. Each relay publishes
//! its traffic onto a pub/sub bus (Redis in production) and delivers whatever
//! it receives from that bus to its own clients, so clients on different
//! relays share one conversation.
//!
//! - [`cli`] parses the command-line interface for relay and client modes.
//! - [`server`] accepts connections and supervises startup and shutdown.
//! - [`session`] runs one connection: handshake, reader, writer, teardown.
//! - [`broker`] owns the [`registry`] and serializes joins, leaves, and
//!   publishing; it also fans bus deliveries out to local mailboxes.
//! - [`mailbox`] is the bounded per-client outbound queue.
//! - [`bus`] wraps the pub/sub transport and its subscription loop.
//! - [`protocol`] holds the bus payload format and line framing.
//! - [`client`] is a minimal terminal client.

pub mod broker;
pub mod bus;
pub mod cli;
pub mod client;
pub mod mailbox;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
