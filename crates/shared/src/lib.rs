pub mod domain;
pub mod error;
pub mod protocol;

pub use domain::*;
pub use error::{ApiError, ErrorCode};
pub use protocol::*;
