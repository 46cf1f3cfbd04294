use anyhow::{Context, Result};
use chat_api::{HouseId, UserId};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

/// Claims carried by bearer tokens issued by the account service.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
pub struct Claims {
    /// User id as a decimal string.
    pub sub: String,
    pub name: String,
    /// Houses the user is an active tenant of.
    #[serde(default)]
    pub houses: Vec<HouseId>,
    pub exp: usize,
}

/// The authenticated caller behind a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    pub display_name: String,
    pub houses: Vec<HouseId>,
    pub expires_at: i64,
}

impl Identity {
    pub fn is_expired(&self) -> bool {
        self.expires_at < OffsetDateTime::now_utc().unix_timestamp()
    }

    pub fn is_tenant_of(&self, house_id: HouseId) -> bool {
        self.houses.contains(&house_id)
    }
}

/// Resolves an opaque bearer credential into an identity.
pub trait IdentityResolver: Send + Sync {
    fn resolve_identity(&self, token: &str) -> Result<Identity>;
}

/// Resolver for HS256 JWTs signed with a shared secret.
pub struct JwtResolver {
    secret: Vec<u8>,
}

impl JwtResolver {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }
}

impl IdentityResolver for JwtResolver {
    fn resolve_identity(&self, token: &str) -> Result<Identity> {
        let claims = verify_jwt(&self.secret, token)?;
        let user_id = claims
            .sub
            .parse::<UserId>()
            .context("subject is not a user id")?;
        Ok(Identity {
            user_id,
            display_name: claims.name,
            houses: claims.houses,
            expires_at: claims.exp as i64,
        })
    }
}

/// Issue a JWT for the given claims subject valid for the provided duration.
pub fn issue_jwt(
    secret: &[u8],
    user_id: UserId,
    name: &str,
    houses: &[HouseId],
    valid_for: Duration,
) -> Result<String> {
    let exp = (OffsetDateTime::now_utc() + valid_for).unix_timestamp() as usize;
    let claims = Claims {
        sub: user_id.to_string(),
        name: name.into(),
        houses: houses.to_vec(),
        exp,
    };
    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret),
    )?;
    Ok(token)
}

/// Verify a JWT and return its claims if valid.
pub fn verify_jwt(secret: &[u8], token: &str) -> Result<Claims> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = true;
    let data = decode::<Claims>(token, &DecodingKey::from_secret(secret), &validation)?;
    if data.claims.exp < OffsetDateTime::now_utc().unix_timestamp() as usize {
        anyhow::bail!("expired");
    }
    Ok(data.claims)
}

/// Extract the token from an `Authorization: Bearer ...` header value.
pub fn bearer_token(value: &str) -> Option<&str> {
    value
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}
