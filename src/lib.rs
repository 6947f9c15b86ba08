// tunsnare library crate
//
// The interception engine and proxy discovery, shared by the CLI binary
// and the Android JNI crate.

// Infrastructure
pub mod cli;
pub mod config;
pub mod error;
pub mod logging;

// Packet path: codec, sessions, redirection, upstream sockets, write-back
pub mod capture;
pub mod handler;
pub mod icmp;
pub mod mux;
pub mod packet;
pub mod session;
pub mod writer;

// Lifecycle and proxy setup
pub mod discovery;
pub mod engine;
