use log::{info, warn};
use rocket::{http::CookieJar, serde::json::Json, Route, State};
use serde::{Deserialize, Serialize};

use crate::{
    config::Config,
    error::{Code, Error, Result},
    model::{
        admin::AdminCredentials,
        audit::AuditEventType,
        auth::{AuthToken, ADMIN_TOKEN_COOKIE, VOTER_TOKEN_COOKIE},
        voter::VoterId,
    },
    service::Services,
};

use super::decode_capture;

pub fn routes() -> Vec<Route> {
    routes![authenticate_face, authenticate_admin, logout]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceAuthRequest {
    pub voter_id: VoterId,
    pub image_b64: String,
    /// Extra frames for the liveness check.
    #[serde(default)]
    pub frames_b64: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceAuthResponse {
    pub ok: bool,
    pub score: f64,
}

/// Match a live capture against the voter's enrolled template. On success the
/// voter gets a short-lived session cookie, needed to request a voting token.
#[post("/auth/face", data = "<request>", format = "json")]
pub async fn authenticate_face(
    cookies: &CookieJar<'_>,
    request: Json<FaceAuthRequest>,
    services: &State<Services>,
    config: &State<Config>,
) -> Result<Json<FaceAuthResponse>> {
    let capture = decode_capture(&request.image_b64, &request.frames_b64)?;
    let result = services.registry.authenticate(&request.voter_id, capture).await?;

    let voter = services.registry.lookup(&request.voter_id).await?;
    cookies.add(AuthToken::new(&voter).into_cookie(config)?);
    Ok(Json(FaceAuthResponse {
        ok: true,
        score: result.score,
    }))
}

#[post("/auth/admin", data = "<credentials>", format = "json")]
pub async fn authenticate_admin(
    cookies: &CookieJar<'_>,
    credentials: Json<AdminCredentials>,
    services: &State<Services>,
    config: &State<Config>,
) -> Result<()> {
    let admin = services
        .store()
        .get_admin(&credentials.username)
        .await?
        .filter(|admin| admin.verify_password(&credentials.password));

    let audit = &services.audit;
    let subject = format!("admin:{}", credentials.username);
    let Some(admin) = admin else {
        warn!("Failed admin login for {}", credentials.username);
        audit
            .record(audit.event(AuditEventType::AdminLogin, subject.clone(), subject, "rejected"))
            .await;
        return Err(Error::auth(
            Code::Unauthorized,
            "No admin found with the provided username and password combination.",
        ));
    };

    cookies.add(AuthToken::new(&admin).into_cookie(config)?);
    info!("Admin {} logged in", admin.username);
    audit
        .record(audit.event(AuditEventType::AdminLogin, subject.clone(), subject, "accepted"))
        .await;
    Ok(())
}

#[delete("/auth")]
pub fn logout(cookies: &CookieJar<'_>) {
    cookies.remove(ADMIN_TOKEN_COOKIE);
    cookies.remove(VOTER_TOKEN_COOKIE);
}
