#![forbid(unsafe_code)]

// Join-token verification. Registration and credential storage live in a
// separate service; this server only checks the token it is handed at join
// time.

pub mod jwt;

pub use jwt::{create_join_token, verify_join_token, AuthError, JoinClaims};
