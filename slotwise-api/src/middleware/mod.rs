pub mod auth;
pub mod signature;

pub use auth::{caller_auth_middleware, privileged_middleware, CallerClaims, CallerRole};
