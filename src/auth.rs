//! Access token reassembly and validation
//!
//! Browsers cap cookie sizes, so the login page stores the access token
//! split across `<prefix>-0 .. <prefix>-N-1` with the fragment count in
//! `<prefix>s`.

use crate::config::AuthConfig;
use crate::cookies::get_cookie;
use hyper::header::HeaderMap;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

/// Upper bound on the fragment count cookie
const MAX_TOKEN_FRAGMENTS: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("token count cookie {0} is missing")]
    MissingCount(String),
    #[error("token count cookie {name} has invalid value {value:?}")]
    InvalidCount { name: String, value: String },
    #[error("token fragment cookie {0} is missing")]
    MissingFragment(String),
    #[error("reconstructed token is empty")]
    Empty,
    #[error("invalid token: {0}")]
    Invalid(#[from] jsonwebtoken::errors::Error),
    #[error("failed to read verification key: {0}")]
    Key(#[from] std::io::Error),
}

/// Rebuild the token stored under `prefix` from the request cookies
pub fn reconstruct_token(headers: &HeaderMap, prefix: &str) -> Result<String, TokenError> {
    let count_name = format!("{}s", prefix);
    let raw_count = get_cookie(headers, &count_name).ok_or_else(|| TokenError::MissingCount(count_name.clone()))?;
    let count: usize = raw_count
        .parse()
        .ok()
        .filter(|n| (1..=MAX_TOKEN_FRAGMENTS).contains(n))
        .ok_or_else(|| TokenError::InvalidCount {
            name: count_name.clone(),
            value: raw_count.to_string(),
        })?;

    let mut token = String::new();
    for i in 0..count {
        let name = format!("{}-{}", prefix, i);
        let fragment = get_cookie(headers, &name).ok_or(TokenError::MissingFragment(name))?;
        token.push_str(fragment);
    }

    if token.is_empty() {
        return Err(TokenError::Empty);
    }
    Ok(token)
}

/// True for the count cookie and every fragment cookie of `prefix`
pub fn is_token_cookie(name: &str, prefix: &str) -> bool {
    match name.strip_prefix(prefix) {
        Some("s") => true,
        Some(rest) => rest
            .strip_prefix('-')
            .map(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
            .unwrap_or(false),
        None => false,
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RealmAccess {
    #[serde(default)]
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: i64,
    #[serde(default)]
    pub iat: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realm_access: Option<RealmAccess>,
}

impl Claims {
    /// Identities used for per-account session admission
    pub fn accounts(&self) -> Vec<String> {
        match self.preferred_username.as_deref() {
            Some(name) if !name.is_empty() => vec![name.to_string()],
            _ if !self.sub.is_empty() => vec![self.sub.clone()],
            _ => Vec::new(),
        }
    }
}

/// Checks a reassembled bearer token
pub trait TokenValidator: Send + Sync {
    fn validate(&self, token: &str) -> Result<Claims, TokenError>;
}

#[derive(Clone)]
pub struct JwtValidator {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtValidator {
    /// HS256 with a shared secret
    pub fn from_secret(secret: &str) -> Self {
        Self::new(DecodingKey::from_secret(secret.as_bytes()), Algorithm::HS256)
    }

    /// RS256 with a PEM-encoded public key
    pub fn from_rsa_pem(pem: &[u8]) -> Result<Self, TokenError> {
        Ok(Self::new(DecodingKey::from_rsa_pem(pem)?, Algorithm::RS256))
    }

    pub fn from_config(config: &AuthConfig) -> Result<Self, TokenError> {
        let validator = match (&config.public_key_path, &config.secret) {
            (Some(path), _) => Self::from_rsa_pem(&std::fs::read(path)?)?,
            (None, Some(secret)) => Self::from_secret(secret),
            (None, None) => {
                return Err(TokenError::Invalid(
                    jsonwebtoken::errors::ErrorKind::InvalidKeyFormat.into(),
                ))
            }
        };

        let mut validator = validator.with_leeway(config.leeway_secs);
        if let Some(issuer) = &config.issuer {
            validator = validator.with_issuer(issuer);
        }
        if let Some(audience) = &config.audience {
            validator = validator.with_audience(audience);
        }
        Ok(validator)
    }

    fn new(decoding_key: DecodingKey, algorithm: Algorithm) -> Self {
        let mut validation = Validation::new(algorithm);
        // Identity-provider tokens usually carry an audience; only check it
        // when one is configured.
        validation.validate_aud = false;
        Self {
            decoding_key,
            validation,
        }
    }

    pub fn with_issuer(mut self, issuer: &str) -> Self {
        self.validation.set_issuer(&[issuer]);
        self
    }

    pub fn with_audience(mut self, audience: &str) -> Self {
        self.validation.set_audience(&[audience]);
        self.validation.validate_aud = true;
        self
    }

    pub fn with_leeway(mut self, leeway_secs: u64) -> Self {
        self.validation.leeway = leeway_secs;
        self
    }
}

impl TokenValidator for JwtValidator {
    fn validate(&self, token: &str) -> Result<Claims, TokenError> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation)?;
        Ok(data.claims)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use hyper::header::{HeaderValue, COOKIE};
    use jsonwebtoken::{encode, EncodingKey, Header};

    pub(crate) fn create_token(secret: &str, username: &str, valid_for: Duration) -> String {
        let now = Utc::now();
        let claims = Claims {
            sub: format!("{}-id", username),
            exp: (now + valid_for).timestamp(),
            iat: now.timestamp(),
            iss: Some("https://idp.internal/realms/master".to_string()),
            preferred_username: Some(username.to_string()),
            realm_access: Some(RealmAccess {
                roles: vec!["console-rw".to_string()],
            }),
        };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes())).unwrap()
    }

    fn split_cookies(prefix: &str, token: &str, parts: usize) -> HeaderMap {
        let chunk = token.len().div_ceil(parts);
        let mut cookie = format!("{}s={}", prefix, parts);
        for (i, piece) in token.as_bytes().chunks(chunk).enumerate() {
            cookie.push_str(&format!("; {}-{}={}", prefix, i, std::str::from_utf8(piece).unwrap()));
        }
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_str(&cookie).unwrap());
        headers
    }

    #[test]
    fn test_reconstruct_token() {
        let token = create_token("secret", "alice", Duration::hours(1));
        let headers = split_cookies("app-service-proxy-token", &token, 3);
        assert_eq!(reconstruct_token(&headers, "app-service-proxy-token").unwrap(), token);
    }

    #[test]
    fn test_reconstruct_missing_count() {
        let headers = HeaderMap::new();
        assert!(matches!(
            reconstruct_token(&headers, "keycloak-token"),
            Err(TokenError::MissingCount(_))
        ));
    }

    #[test]
    fn test_reconstruct_invalid_count() {
        for count in ["abc", "0", "-1", "1000"] {
            let mut headers = HeaderMap::new();
            headers.insert(COOKIE, HeaderValue::from_str(&format!("keycloak-tokens={}", count)).unwrap());
            assert!(matches!(
                reconstruct_token(&headers, "keycloak-token"),
                Err(TokenError::InvalidCount { .. })
            ));
        }
    }

    #[test]
    fn test_reconstruct_missing_fragment() {
        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_static("keycloak-tokens=3; keycloak-token-0=aa; keycloak-token-2=cc"),
        );
        match reconstruct_token(&headers, "keycloak-token") {
            Err(TokenError::MissingFragment(name)) => assert_eq!(name, "keycloak-token-1"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_is_token_cookie() {
        assert!(is_token_cookie("keycloak-tokens", "keycloak-token"));
        assert!(is_token_cookie("keycloak-token-0", "keycloak-token"));
        assert!(is_token_cookie("keycloak-token-12", "keycloak-token"));
        assert!(!is_token_cookie("keycloak-token-", "keycloak-token"));
        assert!(!is_token_cookie("keycloak-token-x", "keycloak-token"));
        assert!(!is_token_cookie("keycloak-token", "keycloak-token"));
        assert!(!is_token_cookie("app-service-proxy-project", "app-service-proxy-token"));
    }

    #[test]
    fn test_validate_token() {
        let validator = JwtValidator::from_secret("secret");
        let token = create_token("secret", "alice", Duration::hours(1));
        let claims = validator.validate(&token).unwrap();
        assert_eq!(claims.accounts(), vec!["alice".to_string()]);
        assert!(claims.exp > Utc::now().timestamp());
        assert_eq!(claims.realm_access.unwrap().roles, vec!["console-rw".to_string()]);
    }

    #[test]
    fn test_wrong_secret() {
        let validator = JwtValidator::from_secret("other");
        let token = create_token("secret", "alice", Duration::hours(1));
        assert!(matches!(validator.validate(&token), Err(TokenError::Invalid(_))));
    }

    #[test]
    fn test_expired_token() {
        let validator = JwtValidator::from_secret("secret").with_leeway(0);
        let token = create_token("secret", "alice", Duration::hours(-1));
        assert!(validator.validate(&token).is_err());
    }

    #[test]
    fn test_issuer_match() {
        let validator = JwtValidator::from_secret("secret").with_issuer("https://idp.internal/realms/master");
        let token = create_token("secret", "alice", Duration::hours(1));
        assert!(validator.validate(&token).is_ok());
    }

    #[test]
    fn test_issuer_mismatch() {
        let validator = JwtValidator::from_secret("secret").with_issuer("https://idp.example.com");
        let token = create_token("secret", "alice", Duration::hours(1));
        assert!(validator.validate(&token).is_err());
    }

    #[test]
    fn test_accounts_fall_back_to_subject() {
        let claims = Claims {
            sub: "user-1".to_string(),
            exp: 0,
            iat: 0,
            iss: None,
            preferred_username: None,
            realm_access: None,
        };
        assert_eq!(claims.accounts(), vec!["user-1".to_string()]);
    }
}
