pub mod user;
pub mod listing;
pub mod booking;

pub use user::*;
pub use listing::*;
pub use booking::*;
