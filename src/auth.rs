use {
    crate::models::UserId,
    anyhow::{
        anyhow,
        Result,
    },
    axum::http::HeaderMap,
    jsonwebtoken::{
        decode,
        DecodingKey,
        Validation,
    },
    serde::{
        Deserialize,
        Serialize,
    },
    time::OffsetDateTime,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub:      UserId,
    pub username: String,
    /// Seconds since the Unix epoch.
    pub exp:      i64,
}

impl Claims {
    pub fn expires_at(&self) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(self.exp).unwrap_or(OffsetDateTime::UNIX_EPOCH)
    }
}

pub fn verify_token(token: &str, secret: &str) -> Result<Claims> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|err| anyhow!("Invalid bearer token: {err}"))?;
    Ok(data.claims)
}

/// Extract the bearer credential from the `Authorization` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("Authorization")?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        jsonwebtoken::{
            encode,
            EncodingKey,
            Header,
        },
        uuid::Uuid,
    };

    fn token_for(claims: &Claims, secret: &str) -> String {
        encode(
            &Header::default(),
            claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn accepts_valid_token() {
        let claims = Claims {
            sub:      Uuid::new_v4(),
            username: "u1".to_string(),
            exp:      OffsetDateTime::now_utc().unix_timestamp() + 3600,
        };
        let verified = verify_token(&token_for(&claims, "secret"), "secret").unwrap();
        assert_eq!(verified.sub, claims.sub);
        assert_eq!(verified.username, "u1");
    }

    #[test]
    fn rejects_expired_token() {
        let claims = Claims {
            sub:      Uuid::new_v4(),
            username: "u1".to_string(),
            // Past the default validation leeway.
            exp:      OffsetDateTime::now_utc().unix_timestamp() - 3600,
        };
        assert!(verify_token(&token_for(&claims, "secret"), "secret").is_err());
    }

    #[test]
    fn rejects_wrong_secret() {
        let claims = Claims {
            sub:      Uuid::new_v4(),
            username: "u1".to_string(),
            exp:      OffsetDateTime::now_utc().unix_timestamp() + 3600,
        };
        assert!(verify_token(&token_for(&claims, "secret"), "other").is_err());
    }

    #[test]
    fn extracts_bearer_credential() {
        let mut headers = HeaderMap::new();
        headers.insert("Authorization", "Bearer abc.def.ghi".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("abc.def.ghi"));

        let mut basic = HeaderMap::new();
        basic.insert("Authorization", "Basic dXNlcg==".parse().unwrap());
        assert_eq!(bearer_token(&basic), None);
        assert_eq!(bearer_token(&HeaderMap::new()), None);
    }
}
