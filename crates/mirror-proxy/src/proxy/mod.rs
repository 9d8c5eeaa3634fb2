//! The request pipeline: duplicate, collect, select, relay.

pub mod body;
pub mod duplicate;
pub mod handoff;
pub mod headers;
pub mod relay;
pub mod select;
pub mod upstream;
