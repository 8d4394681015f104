pub mod event;
pub mod outcome;
pub mod tooling;

pub use event::*;
pub use outcome::*;
pub use tooling::*;
