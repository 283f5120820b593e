//! Container lifecycle core for the harbord daemon.
//!
//! The [`daemon::Daemon`] owns every container. A container is a
//! [`container::Container`]: an immutable identity plus a locked record
//! that is checkpointed to disk ([`persist`]) and published to a snapshot
//! store ([`view`]) on every change. Processes are run by an external
//! [`backend::Runtime`]; their output flows through [`stream`] into the log
//! drivers of [`logs`].

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod backend;
pub mod container;
pub mod daemon;
pub mod logs;
pub mod mounts;
pub mod persist;
pub mod reload;
pub mod restart;
pub mod signal;
pub mod state;
pub mod stats;
pub mod store;
pub mod stream;
pub mod view;

pub use daemon::{CreateOptions, Daemon, DaemonBuilder, RemoveOptions, UpdateOptions, WaitCondition};
