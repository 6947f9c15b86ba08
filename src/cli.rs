use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "tunsnare",
    about = "Redirect traffic from a TUN device into an HTTP(S) debugging proxy",
    version = env!("CARGO_PKG_VERSION")
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: TopCommand,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum TopCommand {
    /// Validate the proxy described by a setup link and remember it
    Discover {
        /// Setup link (…/connect/?data=<base64url json>)
        uri: String,
    },

    /// Intercept traffic on an already configured TUN descriptor
    Run(RunArgs),

    /// Inspect or edit stored settings
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },

    /// Print version information
    Version,
}

#[derive(Args)]
pub struct RunArgs {
    /// Inherited file descriptor of the TUN device
    #[arg(long)]
    pub tun_fd: i32,

    /// Setup link; defaults to re-validating the last proxy
    #[arg(long)]
    pub uri: Option<String>,

    /// Redirect these destination ports (repeatable; overrides config)
    #[arg(short, long = "port", value_parser = clap::value_parser!(u16).range(1..))]
    pub ports: Vec<u16>,

    /// Ask the proxy to CONNECT via SOCKS5 instead of raw redirection
    #[arg(long)]
    pub socks: bool,

    /// Mark upstream sockets with SO_MARK so they bypass the tunnel
    #[arg(long)]
    pub fwmark: Option<u32>,

    /// Write logs to this file instead of the terminal
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Print the current settings as JSON
    Show,

    /// Replace the set of redirected ports
    SetPorts {
        #[arg(required = true, value_parser = clap::value_parser!(u16).range(1..))]
        ports: Vec<u16>,
    },

    /// Restore the default redirected ports
    ResetPorts,
}
