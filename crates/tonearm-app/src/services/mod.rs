//! Backend services integration.
//!
//! Connects the terminal front-end to the playback engine.

pub mod player;

pub use player::PlayerService;
