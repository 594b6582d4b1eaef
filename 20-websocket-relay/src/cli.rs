use std::net::SocketAddr;

use clap::{Args, Parser, Subcommand};

use crate::{
    console::Console,
    hub::{DEFAULT_MAX_DROPS, DEFAULT_QUEUE_CAPACITY, HubConfig, OverflowPolicy},
    session::{DEFAULT_MAILBOX_CAPACITY, SessionConfig},
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay, accepting WebSocket connections on /websocket.
    Serve(ServeArgs),
    /// Connect to a relay and chat from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Socket address the relay should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "0.0.0.0:60000")]
    pub listen: SocketAddr,

    /// Capacity of each connection's inbound and outbound mailbox.
    #[arg(long, default_value_t = DEFAULT_MAILBOX_CAPACITY)]
    pub mailbox_capacity: usize,

    /// Capacity of the shared relay queue.
    #[arg(long, default_value_t = DEFAULT_QUEUE_CAPACITY)]
    pub queue_capacity: usize,

    /// Also deliver each message back to the client that sent it.
    #[arg(long)]
    pub echo_sender: bool,

    /// Disconnect a client once this many messages to it were dropped. 0 never disconnects.
    #[arg(long, default_value_t = DEFAULT_MAX_DROPS)]
    pub max_drops: u64,

    /// Do not print relayed messages to stdout.
    #[arg(long)]
    pub quiet: bool,
}

impl ServeArgs {
    pub fn hub_config(&self) -> HubConfig {
        let overflow = match self.max_drops {
            0 => OverflowPolicy::Drop,
            after_drops => OverflowPolicy::Disconnect { after_drops },
        };
        HubConfig {
            queue_capacity: self.queue_capacity,
            echo_to_sender: self.echo_sender,
            overflow,
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            mailbox_capacity: self.mailbox_capacity,
            console: (!self.quiet).then(Console::stdout),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// User name attached to every message you send.
    #[arg(long)]
    pub name: String,

    /// host:port of the relay to connect to.
    #[arg(long, default_value = "127.0.0.1:60000")]
    pub server: String,
}
