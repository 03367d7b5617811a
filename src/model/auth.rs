use std::fmt::Display;
use std::marker::PhantomData;

use chrono::{serde::ts_seconds, DateTime, Duration, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, TokenData, Validation};
use rocket::{
    http::{Cookie, SameSite, Status},
    outcome::{try_outcome, IntoOutcome},
    request::{FromRequest, Outcome},
    time::Duration as CookieDuration,
    Request, State,
};
use serde::{Deserialize, Serialize};

use crate::{
    config::Config,
    error::Error,
    model::{admin::Admin, voter::Voter},
    service::Services,
};

pub const ADMIN_TOKEN_COOKIE: &str = "auth_token";
pub const VOTER_TOKEN_COOKIE: &str = "voter_token";

/// A user of our application, having defined rights.
pub trait User {
    /// The rights of this user type.
    const RIGHTS: Rights;
    /// The cookie carrying this user type's token.
    const COOKIE: &'static str;
    /// Get the user's ID.
    fn id(&self) -> String;
    /// How long a session lasts.
    fn ttl(config: &Config) -> Duration;
}

/// Different privilege levels.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rights {
    Voter,
    Admin,
}

impl Display for Rights {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            formatter,
            "{}",
            match self {
                Self::Voter => "voter",
                Self::Admin => "admin",
            }
        )
    }
}

impl User for Voter {
    const RIGHTS: Rights = Rights::Voter;
    const COOKIE: &'static str = VOTER_TOKEN_COOKIE;

    fn id(&self) -> String {
        self.voter_id.clone()
    }

    fn ttl(config: &Config) -> Duration {
        config.auth_ttl()
    }
}

impl User for Admin {
    const RIGHTS: Rights = Rights::Admin;
    const COOKIE: &'static str = ADMIN_TOKEN_COOKIE;

    fn id(&self) -> String {
        self.username.clone()
    }

    fn ttl(config: &Config) -> Duration {
        config.admin_auth_ttl()
    }
}

/// An authentication token representing a specific user with specific rights.
#[derive(Debug, Serialize, Deserialize)]
pub struct AuthToken<U> {
    pub id: String,
    #[serde(rename = "rgt")]
    pub rights: Rights,
    #[serde(skip)]
    phantom: PhantomData<U>,
}

impl<U> AuthToken<U> {
    /// Does this token permit the given rights?
    pub fn permits(&self, target: Rights) -> bool {
        self.rights == target
    }
}

impl<U> AuthToken<U>
where
    U: User,
{
    /// Create a new [`AuthToken`] for the given user, with the correct rights for that user type.
    pub fn new(user: &U) -> Self {
        Self {
            id: user.id(),
            rights: U::RIGHTS,
            phantom: PhantomData,
        }
    }

    /// Serialize this token into a cookie.
    pub fn into_cookie(self, config: &Config) -> Result<Cookie<'static>, Error> {
        let ttl = U::ttl(config);
        let claims = Claims {
            token: self,
            expire_at: Utc::now() + ttl,
        };

        let token = jsonwebtoken::encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(config.jwt_secret()),
        )?;

        Ok(Cookie::build((U::COOKIE, token))
            .max_age(CookieDuration::seconds(ttl.num_seconds()))
            .http_only(true)
            .same_site(SameSite::Strict)
            .build())
    }

    /// Deserialize a token from a cookie.
    pub fn from_cookie(cookie: &Cookie<'static>, config: &Config) -> Result<Self, Error> {
        let token = jsonwebtoken::decode(
            cookie.value(),
            &DecodingKey::from_secret(config.jwt_secret()),
            &Validation::default(),
        )
        .map(|claims: TokenData<Claims<U>>| claims.claims.token)?;
        Ok(token)
    }
}

/// Cookie claims: the token itself plus an expiry datetime.
#[derive(Serialize, Deserialize)]
struct Claims<U> {
    #[serde(flatten, bound = "")]
    token: AuthToken<U>,
    #[serde(rename = "exp", with = "ts_seconds")]
    expire_at: DateTime<Utc>,
}

#[rocket::async_trait]
impl<'r, U> FromRequest<'r> for AuthToken<U>
where
    U: User + Send,
{
    type Error = Error;

    /// Get an [`AuthToken`] from the cookie and verify that it has the correct rights for this user
    /// type and that the user still exists.
    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let config = try_outcome!(req
            .guard::<&State<Config>>()
            .await
            .map_error(|(status, _)| (status, Error::Fatal("Config not managed".to_string()))));
        let services = try_outcome!(req
            .guard::<&State<Services>>()
            .await
            .map_error(|(status, _)| (status, Error::Fatal("Services not managed".to_string()))));

        // Forward to any routes that do not require an authentication token.
        let cookie = try_outcome!(req.cookies().get(U::COOKIE).or_forward(Status::Unauthorized));

        // Decode the token.
        let token: Self = try_outcome!(Self::from_cookie(cookie, config).or_forward(Status::Unauthorized));

        // Check it represents the correct rights.
        if !token.permits(U::RIGHTS) {
            return Outcome::Forward(Status::Unauthorized);
        }

        // Check the user actually exists.
        let store = services.store();
        let exists = match token.rights {
            Rights::Voter => store
                .get_voter(&token.id)
                .await
                .map(|voter| voter.map_or(false, |voter| !voter.erased)),
            Rights::Admin => store.get_admin(&token.id).await.map(|admin| admin.is_some()),
        };
        match exists {
            Ok(true) => Outcome::Success(token),
            Ok(false) => Outcome::Forward(Status::Unauthorized),
            Err(e) => Outcome::Error((e.status(), e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn cookie_round_trip() {
        let config = Config::example();
        let admin = Admin {
            username: "root".into(),
            password_hash: String::new(),
        };
        let cookie = AuthToken::new(&admin).into_cookie(&config).unwrap();
        assert_eq!(cookie.name(), ADMIN_TOKEN_COOKIE);
        assert_eq!(cookie.http_only(), Some(true));
        let token = AuthToken::<Admin>::from_cookie(&cookie, &config).unwrap();
        assert_eq!(token.id, "root");
        assert!(token.permits(Rights::Admin));
        assert!(!token.permits(Rights::Voter));
    }

    #[test]
    fn tampered_cookie_is_rejected() {
        let config = Config::example();
        let voter = Voter::approved("v1");
        let cookie = AuthToken::new(&voter).into_cookie(&config).unwrap();
        let forged = Cookie::new(VOTER_TOKEN_COOKIE, format!("{}x", cookie.value()));
        assert!(AuthToken::<Voter>::from_cookie(&forged, &config).is_err());
    }
}
