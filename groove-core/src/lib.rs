pub mod clock;
pub mod conductor;
pub mod config;
pub mod engine;
pub mod error;
pub mod patch;
pub mod persistence;
pub mod sink;
pub mod theory;

pub use groove_types::Mode;
