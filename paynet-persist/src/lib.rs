//! Persisters for [`paynet::node::Node`] state.

pub mod model;

#[cfg(feature = "kvv")]
pub mod kvv;
