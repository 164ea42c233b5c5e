pub mod domain;
pub mod notify_worker;

pub use domain::*;
pub use notify_worker::*;
