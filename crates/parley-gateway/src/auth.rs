use jsonwebtoken::{DecodingKey, Validation, decode};

use parley_types::api::Claims;
use parley_types::models::Principal;

/// Verify an identity-provider token and turn its claims into a principal.
pub fn verify_token(token: &str, secret: &str) -> jsonwebtoken::errors::Result<Principal> {
    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )?;

    Ok(Principal {
        id: token_data.claims.sub,
        role: token_data.claims.role,
    })
}
