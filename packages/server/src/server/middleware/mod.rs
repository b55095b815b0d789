// HTTP middleware: client IP extraction, admin bearer auth, rate limiting.

pub mod auth;
pub mod ip_extractor;
pub mod rate_limit;

pub use auth::admin_auth_middleware;
pub use ip_extractor::{extract_client_ip, ClientIp};
pub use rate_limit::rate_limit_middleware;
