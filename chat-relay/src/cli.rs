use std::{net::SocketAddr, num::NonZeroUsize};

use clap::{Args, Parser, Subcommand};

use crate::{
    bus::{DEFAULT_REDIS_ADDR, DEFAULT_TOPIC},
    mailbox::DEFAULT_MAILBOX_CAPACITY,
    server::RelayConfig,
    session::SessionConfig,
};

const DEFAULT_CAPACITY_ARG: NonZeroUsize = match NonZeroUsize::new(DEFAULT_MAILBOX_CAPACITY) {
    Some(capacity) => capacity,
    None => panic!("default mailbox capacity must be non-zero"),
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a relay, accepting TCP clients and sharing traffic over the bus.
    Relay(RelayArgs),
    /// Connect to a relay and chat from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct RelayArgs {
    /// Socket address to accept clients on. Use port 0 for an ephemeral port.
    #[arg(long, env = "RELAY_LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Redis server used as the message bus.
    #[arg(long, env = "REDIS_ADDR", default_value = DEFAULT_REDIS_ADDR)]
    pub redis_addr: String,

    /// Pub/sub topic shared by every relay in the room.
    #[arg(long, env = "RELAY_TOPIC", default_value = DEFAULT_TOPIC)]
    pub topic: String,

    /// Lines buffered per client before a slow client is disconnected.
    #[arg(long, default_value_t = DEFAULT_CAPACITY_ARG)]
    pub mailbox_capacity: NonZeroUsize,

    /// Use an in-process bus instead of Redis. Only clients of this relay
    /// will see each other.
    #[arg(long)]
    pub local_bus: bool,
}

impl RelayArgs {
    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            session: SessionConfig {
                mailbox_capacity: self.mailbox_capacity.get(),
            },
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Address of the relay to connect to.
    #[arg(long, default_value = "127.0.0.1:8080")]
    pub server: String,

    /// Alias to join with. Prompted for on stdin when omitted.
    #[arg(long)]
    pub alias: Option<String>,
}
