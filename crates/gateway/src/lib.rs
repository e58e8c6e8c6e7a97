pub mod auth;
pub mod rate_limit;
pub mod relay;
pub mod server;

pub use rate_limit::{Admission, RateLimiter};
pub use relay::relay;
pub use server::{router, serve, GatewayState};
