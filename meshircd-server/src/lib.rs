//! A mesh-linked IRC server node.
//!
//! Servers link over TCP into an arbitrary mesh. Channel topics replicate
//! across the mesh and reconverge after a netsplit using each channel's
//! creation time and topic time.

pub mod bounded;
pub mod channel;
pub mod clock;
pub mod color;
pub mod config;
pub mod connection;
pub mod error;
pub mod irc;
pub mod registry;
pub mod router;
pub mod s2s;
pub mod server;
pub mod source;
pub mod topic;
