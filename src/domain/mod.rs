pub mod credential;
pub mod event;
pub mod tenant;

pub use credential::*;
pub use event::*;
pub use tenant::*;
