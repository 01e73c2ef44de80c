pub mod billing;
pub mod guards;

pub use billing::*;
pub use guards::*;
