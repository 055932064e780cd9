#![forbid(unsafe_code)]

// Join-token verification. Tokens are minted by the account service and
// presented on joinRoom; this server pins HS256 and checks expiry with a
// small clock-skew allowance.

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{
    decode, encode, get_current_timestamp, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifetime of locally minted tokens. Production tokens come from the
/// account service under its own policy.
const TOKEN_TTL_SECS: u64 = 15 * 60;

/// Clock skew tolerated between the issuing service and this host.
const CLOCK_SKEW_LEEWAY_SECS: u64 = 30;

/// Token failures. The dispatcher collapses both variants into its
/// unauthenticated reply; the split exists for logs.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Token expired")]
    Expired,
    #[error("Token invalid: {0}")]
    Invalid(#[from] jsonwebtoken::errors::Error),
}

/// Claims carried by a join token: `sub` is the authenticated user id,
/// `name` the display name chosen at login.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinClaims {
    pub sub: String,
    pub name: String,
    pub exp: u64,
}

fn hs256_validation() -> Validation {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.leeway = CLOCK_SKEW_LEEWAY_SECS;
    validation
}

/// Verifies a join token against the shared secret and returns its claims.
pub fn verify_join_token(token: &str, secret: &str) -> Result<JoinClaims, AuthError> {
    decode::<JoinClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &hs256_validation(),
    )
    .map(|data| data.claims)
    .map_err(|e| match e.kind() {
        ErrorKind::ExpiredSignature => AuthError::Expired,
        _ => AuthError::Invalid(e),
    })
}

/// Mints a short-lived join token. Used by tests and local tooling; real
/// deployments hand out tokens from the account service.
pub fn create_join_token(
    user_id: &str,
    display_name: &str,
    secret: &str,
) -> Result<String, AuthError> {
    let claims = JoinClaims {
        sub: user_id.to_owned(),
        name: display_name.to_owned(),
        exp: get_current_timestamp() + TOKEN_TTL_SECS,
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(AuthError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "0123456789abcdef0123456789abcdef";

    fn mint_with_exp(exp: u64) -> String {
        let claims = JoinClaims {
            sub: "u1".into(),
            name: "Ada".into(),
            exp,
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn accepts_a_fresh_token_and_exposes_claims() {
        let token = create_join_token("user-7", "Ada", SECRET).unwrap();
        let claims = verify_join_token(&token, SECRET).unwrap();
        assert_eq!(claims.sub, "user-7");
        assert_eq!(claims.name, "Ada");
        assert!(claims.exp > get_current_timestamp());
    }

    #[test]
    fn expiry_beyond_leeway_is_rejected_as_expired() {
        let token = mint_with_exp(get_current_timestamp() - 3600);
        assert!(matches!(
            verify_join_token(&token, SECRET),
            Err(AuthError::Expired)
        ));
    }

    #[test]
    fn skew_within_leeway_still_passes() {
        let token = mint_with_exp(get_current_timestamp() - CLOCK_SKEW_LEEWAY_SECS / 2);
        assert!(verify_join_token(&token, SECRET).is_ok());
    }

    #[test]
    fn foreign_secret_and_tampering_are_invalid() {
        let token = create_join_token("user-7", "Ada", SECRET).unwrap();
        assert!(matches!(
            verify_join_token(&token, "another-secret-entirely"),
            Err(AuthError::Invalid(_))
        ));

        let mangled = format!("{token}x");
        assert!(verify_join_token(&mangled, SECRET).is_err());

        assert!(matches!(
            verify_join_token("definitely-not-a-jwt", SECRET),
            Err(AuthError::Invalid(_))
        ));
    }

    #[test]
    fn algorithm_is_pinned_to_hs256() {
        let claims = JoinClaims {
            sub: "u1".into(),
            name: "Ada".into(),
            exp: get_current_timestamp() + 60,
        };
        let token = encode(
            &Header::new(Algorithm::HS384),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap();
        assert!(matches!(
            verify_join_token(&token, SECRET),
            Err(AuthError::Invalid(_))
        ));
    }
}
