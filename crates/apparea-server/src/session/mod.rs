//! Sessions: one per authenticated peer, fed by its views and forwarders.

pub mod manager;
pub mod view;

pub use manager::Session;
pub use view::{StatusView, View};
