mod certificate;
mod error;
mod security;
mod time;
pub mod hex;

pub use certificate::*;
pub use chrono;
pub use error::*;
pub use security::*;
pub use time::*;
