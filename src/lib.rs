//! `prime-order`: a Byzantine-fault-tolerant state-machine replication
//! ordering engine.
//!
//! Most of this crate's surface lives under [`bft`] and is hidden
//! unless the `expose_impl` feature is enabled -- applications are
//! expected to depend on [`bft::core::Replica`] and [`bft::executable::Service`]
//! rather than reach into the subprotocol modules directly.

pub mod bft;
