//! Registration, login and bearer tokens.
//!
//! Passwords are hashed with bcrypt on the blocking pool. Tokens are HS256
//! JWTs; only `access` tokens authenticate requests, `refresh` tokens are
//! issued alongside for clients that want them.

use chrono::{Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::config::AuthConfig;
use crate::db::Database;
use crate::error::{ApiError, ApiResult, ErrorCode};
use crate::types::{NewUser, Role, User};

pub const MIN_PASSWORD_LEN: usize = 8;
pub const MAX_PASSWORD_LEN: usize = 128;
pub const MIN_NAME_LEN: usize = 2;

/// Verified against when the login email is unknown, so both paths pay for
/// one bcrypt check.
const DUMMY_PASSWORD: &str = "dummy-Passw0rd!";

const EMAIL_PATTERN: &str = r"^[A-Za-z0-9._%+\-]+@[A-Za-z0-9\-]+(\.[A-Za-z0-9\-]+)*\.[A-Za-z]{2,}$";

fn email_regex() -> Option<&'static Regex> {
    static EMAIL: OnceLock<Option<Regex>> = OnceLock::new();
    EMAIL.get_or_init(|| Regex::new(EMAIL_PATTERN).ok()).as_ref()
}

pub fn is_valid_email(email: &str) -> bool {
    email_regex().is_some_and(|re| re.is_match(email))
}

/// Check the password policy. Returns the first rule violated.
pub fn check_password(password: &str) -> Result<(), &'static str> {
    let len = password.chars().count();
    if len < MIN_PASSWORD_LEN {
        return Err("Password must be at least 8 characters long");
    }
    if len > MAX_PASSWORD_LEN {
        return Err("Password must be at most 128 characters long");
    }
    if !password.chars().any(|c| c.is_uppercase()) {
        return Err("Password must contain at least one uppercase letter");
    }
    if !password.chars().any(|c| c.is_lowercase()) {
        return Err("Password must contain at least one lowercase letter");
    }
    if !password.chars().any(|c| c.is_ascii_digit()) {
        return Err("Password must contain at least one digit");
    }
    if !password.chars().any(|c| !c.is_alphanumeric() && !c.is_whitespace()) {
        return Err("Password must contain at least one special character");
    }
    Ok(())
}

pub async fn hash_password(password: &str, cost: u32) -> anyhow::Result<String> {
    let password = password.to_string();
    let hash = tokio::task::spawn_blocking(move || bcrypt::hash(password, cost)).await??;
    Ok(hash)
}

pub async fn verify_password(password: &str, hash: &str) -> anyhow::Result<bool> {
    let password = password.to_string();
    let hash = hash.to_string();
    let ok = tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash)).await??;
    Ok(ok)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Access,
    Refresh,
}

/// JWT payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub email: String,
    pub role: Role,
    #[serde(rename = "type")]
    pub kind: TokenKind,
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    /// Access token lifetime in seconds.
    pub expires_in: i64,
}

/// Signing keys and token lifetimes.
pub struct TokenIssuer {
    encoding: EncodingKey,
    decoding: DecodingKey,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl TokenIssuer {
    pub fn new(config: &AuthConfig) -> Self {
        let secret = config.jwt_secret.as_bytes();
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            access_ttl: Duration::minutes(config.access_token_expire_minutes),
            refresh_ttl: Duration::days(config.refresh_token_expire_days),
        }
    }

    pub fn issue(&self, user: &User, kind: TokenKind) -> anyhow::Result<String> {
        let now = Utc::now();
        let ttl = match kind {
            TokenKind::Access => self.access_ttl,
            TokenKind::Refresh => self.refresh_ttl,
        };
        let claims = Claims {
            sub: user.id.clone(),
            email: user.email.clone(),
            role: user.role,
            kind,
            jti: uuid::Uuid::new_v4().to_string(),
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
        };
        Ok(encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)?)
    }

    pub fn issue_pair(&self, user: &User) -> anyhow::Result<TokenPair> {
        Ok(TokenPair {
            access_token: self.issue(user, TokenKind::Access)?,
            refresh_token: self.issue(user, TokenKind::Refresh)?,
            token_type: "bearer".to_string(),
            expires_in: self.access_ttl.num_seconds(),
        })
    }

    /// Verify signature and expiry.
    pub fn decode(&self, token: &str) -> ApiResult<Claims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        decode::<Claims>(token, &self.decoding, &validation)
            .map(|data| data.claims)
            .map_err(|e| {
                debug!(error = %e, "Token rejected");
                ApiError::unauthorized("Could not validate credentials")
            })
    }

    /// Decode a token that must be an access token.
    pub fn authenticate(&self, token: &str) -> ApiResult<Claims> {
        let claims = self.decode(token)?;
        if claims.kind != TokenKind::Access {
            return Err(ApiError::unauthorized("Invalid token type"));
        }
        Ok(claims)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    pub name: String,
    #[serde(default)]
    pub role: Option<String>,
}

/// Form body of `POST /auth/login`.
#[derive(Debug, Clone, Deserialize)]
pub struct LoginForm {
    pub username: String,
    pub password: String,
}

/// User registration and login over the users table.
pub struct AuthService {
    db: Arc<Database>,
    tokens: Arc<TokenIssuer>,
    bcrypt_cost: u32,
    dummy_hash: OnceCell<String>,
}

impl AuthService {
    pub fn new(db: Arc<Database>, tokens: Arc<TokenIssuer>, bcrypt_cost: u32) -> Self {
        Self {
            db,
            tokens,
            bcrypt_cost,
            dummy_hash: OnceCell::new(),
        }
    }

    pub fn tokens(&self) -> &TokenIssuer {
        &self.tokens
    }

    pub async fn register(&self, req: RegisterRequest) -> ApiResult<User> {
        let email = req.email.trim().to_lowercase();
        if !is_valid_email(&email) {
            return Err(ApiError::validation("email", "Invalid email format"));
        }
        check_password(&req.password).map_err(|reason| ApiError::validation("password", reason))?;

        let name = req.name.trim().to_string();
        if name.chars().count() < MIN_NAME_LEN {
            return Err(ApiError::validation(
                "name",
                "Name must be at least 2 characters long",
            ));
        }

        let role = match req.role.as_deref() {
            None => Role::User,
            Some(role) => role
                .parse::<Role>()
                .map_err(|_| ApiError::validation("role", "Role must be 'admin' or 'user'"))?,
        };

        if self.db.find_user_by_email(&email)?.is_some() {
            return Err(ApiError::already_exists("Email already exists"));
        }

        let password_hash = hash_password(&req.password, self.bcrypt_cost).await?;
        let user = self.db.insert_user(&NewUser {
            email,
            password_hash,
            name,
            role,
        })?;

        info!(user_id = %user.id, role = role.as_str(), "User registered");
        Ok(user)
    }

    pub async fn login(&self, username: &str, password: &str) -> ApiResult<TokenPair> {
        let email = username.trim().to_lowercase();
        if !is_valid_email(&email) {
            return Err(ApiError::new(ErrorCode::ValidationFailed, "Invalid email format")
                .with_field("username")
                .with_status(axum::http::StatusCode::BAD_REQUEST));
        }

        let invalid = || ApiError::unauthorized("Invalid email or password");

        let Some(user) = self.db.find_user_by_email(&email)? else {
            let dummy = self
                .dummy_hash
                .get_or_try_init(|| hash_password(DUMMY_PASSWORD, self.bcrypt_cost))
                .await?;
            verify_password(password, dummy).await?;
            warn!("Login for unknown email");
            return Err(invalid());
        };
        if !verify_password(password, &user.password_hash).await? {
            warn!(user_id = %user.id, "Login with wrong password");
            return Err(invalid());
        }

        let pair = self.tokens.issue_pair(&user)?;
        info!(user_id = %user.id, "User logged in");
        Ok(pair)
    }

    /// The user behind an authenticated request.
    pub fn me(&self, user_id: &str) -> ApiResult<User> {
        self.db
            .find_user_by_id(user_id)?
            .ok_or_else(ApiError::user_not_found)
    }
}
