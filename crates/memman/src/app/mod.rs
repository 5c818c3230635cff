//! Application lifecycle: wiring and background tasks.

pub mod core;
pub mod tasks;

pub use self::core::Application;
