//! Adapters implementing the port traits.
//!
//! `live` talks to the real world; `memory` keeps everything in-process for
//! tests and local experimentation.

pub mod live;
pub mod memory;
