pub mod cli;
pub mod daemon;
pub mod request;

pub use cli::*;
pub use daemon::*;
pub use request::*;
