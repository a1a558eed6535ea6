//! Authentication module for Subledger

pub mod jwt;
pub mod middleware;
#[cfg(test)]
mod middleware_tests;

pub use jwt::{Claims, JwtManager};
pub use middleware::{
    optional_auth, require_auth, AuthError, AuthState, AuthUser, MaybeAuthUser,
    AUTH_COOKIE,
};
