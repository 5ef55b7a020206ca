//! k8psh: a remote command shell fabric for a fixed cluster of hosts.
//!
//! Operators declare, in one shared configuration file, a set of named
//! commands and the host each command must execute on. A long-running
//! server (`k8pshd`) on every participating host executes its commands on
//! behalf of clients; the `k8psh` client (or a per-command shim named
//! after the command) connects to the appropriate server and streams
//! standard input, standard output, standard error, the working
//! directory, selected environment variables, the argument vector, and
//! the exit code across the wire, so the invocation behaves like a local
//! execution.

pub mod channel;
pub mod cli;
pub mod client;
pub mod config;
pub mod env;
pub mod logging;
pub mod paths;
pub mod pidfile;
pub mod protocol;
pub mod server;
pub mod shims;
