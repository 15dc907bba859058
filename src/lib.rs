//! Lead router: routes inbound chat messages to a bot menu or a human
//! queue, with a migration layer for running a legacy implementation
//! side by side.

pub mod api;
pub mod channels;
pub mod config;
pub mod error;
pub mod locks;
pub mod migration;
pub mod phone;
pub mod pipeline;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;
