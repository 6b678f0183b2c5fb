pub mod response;
pub mod subscription;
pub mod validation;

pub use response::{ApiError, ApiResponse};
