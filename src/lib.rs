#![forbid(unsafe_code)]

// huddle — SFU signaling and room orchestration server

pub mod auth;
pub mod engine;
pub mod media;
pub mod metrics;
pub mod room;
pub mod signaling;
