//! Everything needed to assemble and run one replica process: command
//! line parsing, static configuration, the `Replica` protocol state
//! machine, and `server`'s async dispatcher tying it to a live `Node`.

pub mod cli;
pub mod config;
pub mod replica;
pub mod server;
