pub mod email;
pub mod jwt;
pub mod stripe;

pub use email::EmailService;
pub use jwt::JwtService;
pub use stripe::{normalize_amount, StripeError, StripeService};
