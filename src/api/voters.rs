use rocket::{http::Status, serde::json::Json, Route, State};
use serde::{Deserialize, Serialize};

use crate::{
    error::Result,
    model::{
        admin::Admin,
        auth::AuthToken,
        voter::{VoterId, VoterView},
    },
    service::Services,
};

use super::{admin_actor, decode_capture};

pub fn routes() -> Vec<Route> {
    routes![enrol_voter, replace_template, approve_voter, block_voter, get_voter, erase_voter]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrolmentRequest {
    pub voter_id: VoterId,
    pub name: String,
    #[serde(default)]
    pub contact: String,
    pub image_b64: String,
    #[serde(default)]
    pub frames_b64: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureRequest {
    pub image_b64: String,
    #[serde(default)]
    pub frames_b64: Vec<String>,
}

/// Enrol a new voter. They stay PENDING until approved.
#[post("/voters", data = "<request>", format = "json")]
async fn enrol_voter(
    token: AuthToken<Admin>,
    request: Json<EnrolmentRequest>,
    services: &State<Services>,
) -> Result<(Status, Json<VoterView>)> {
    let capture = decode_capture(&request.image_b64, &request.frames_b64)?;
    let voter = services
        .registry
        .enroll(&request.voter_id, &request.name, &request.contact, capture, &admin_actor(&token))
        .await?;
    Ok((Status::Created, Json(voter.into())))
}

#[put("/voters/<voter_id>/template", data = "<request>", format = "json")]
async fn replace_template(
    token: AuthToken<Admin>,
    voter_id: &str,
    request: Json<CaptureRequest>,
    services: &State<Services>,
) -> Result<()> {
    let capture = decode_capture(&request.image_b64, &request.frames_b64)?;
    services
        .registry
        .reenroll(voter_id, capture, &admin_actor(&token))
        .await
}

#[post("/voters/<voter_id>/approve")]
async fn approve_voter(token: AuthToken<Admin>, voter_id: &str, services: &State<Services>) -> Result<Json<VoterView>> {
    let voter = services.registry.approve(voter_id, &admin_actor(&token)).await?;
    Ok(Json(voter.into()))
}

/// Block a voter, revoking any token they hold.
#[post("/voters/<voter_id>/block")]
async fn block_voter(token: AuthToken<Admin>, voter_id: &str, services: &State<Services>) -> Result<Json<VoterView>> {
    let voter = services.registry.block(voter_id, &admin_actor(&token)).await?;
    Ok(Json(voter.into()))
}

#[get("/voters/<voter_id>")]
async fn get_voter(_token: AuthToken<Admin>, voter_id: &str, services: &State<Services>) -> Result<Json<VoterView>> {
    let voter = services.registry.lookup(voter_id).await?;
    Ok(Json(voter.into()))
}

#[delete("/voters/<voter_id>")]
async fn erase_voter(token: AuthToken<Admin>, voter_id: &str, services: &State<Services>) -> Result<()> {
    services.registry.erase(voter_id, &admin_actor(&token)).await
}

#[cfg(test)]
mod tests {
    use rocket::{
        http::ContentType,
        local::asynchronous::{Client, LocalResponse},
        serde::json::serde_json::json,
    };

    use crate::{
        api::examples::{encrypt, enrol_voter as enrol, issue_token, login_voter, open_election, request_token, submit},
        biometric::examples::{b64, blank, face_a, face_a_moved, face_b},
        clock::ManualClock,
        error::{Code, ErrorBody},
        model::voter::EnrollmentState,
    };

    use super::*;

    async fn post_voter<'c>(client: &'c Client, voter_id: &str, image: &[u8]) -> LocalResponse<'c> {
        client
            .post(uri!(enrol_voter))
            .header(ContentType::JSON)
            .body(
                json!({
                    "voter_id": voter_id,
                    "name": "Vera Voter",
                    "image_b64": b64(image),
                })
                .to_string(),
            )
            .dispatch()
            .await
    }

    async fn view<'c>(client: &'c Client, voter_id: &str) -> LocalResponse<'c> {
        client.get(uri!(get_voter(voter_id))).dispatch().await
    }

    #[backend_test(admin)]
    async fn enrol_then_approve(client: Client) {
        let response = post_voter(&client, "v1", &face_a()).await;
        assert_eq!(response.status(), Status::Created);
        let voter: VoterView = response.into_json().await.unwrap();
        assert_eq!(voter.voter_id, "v1");
        assert_eq!(voter.state, EnrollmentState::Pending);
        assert!(voter.has_template);

        let response = client.post(uri!(approve_voter("v1"))).dispatch().await;
        assert_eq!(response.status(), Status::Ok);
        let response = view(&client, "v1").await;
        assert_eq!(response.status(), Status::Ok);
        let body = response.into_string().await.unwrap();
        assert!(!body.contains("vector"));
        let voter: VoterView = serde_json::from_str(&body).unwrap();
        assert_eq!(voter.state, EnrollmentState::Approved);
    }

    #[backend_test(admin)]
    async fn bad_enrolments(client: Client) {
        let response = post_voter(&client, "v1", &blank()).await;
        assert_eq!(response.status(), Status::BadRequest);
        let body: ErrorBody = response.into_json().await.unwrap();
        assert_eq!(body.code, Code::NoFace);

        enrol(&client, "v1").await;
        let response = post_voter(&client, "v1", &face_a()).await;
        assert_eq!(response.status(), Status::Conflict);
        let body: ErrorBody = response.into_json().await.unwrap();
        assert_eq!(body.code, Code::AlreadyExists);
    }

    #[backend_test(admin)]
    async fn replaced_template_is_used_for_matching(client: Client) {
        enrol(&client, "v1").await;
        let response = client
            .put(uri!(replace_template("v1")))
            .header(ContentType::JSON)
            .body(json!({"image_b64": b64(&face_b())}).to_string())
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Ok);

        let response = client
            .post("/auth/face")
            .header(ContentType::JSON)
            .body(
                json!({
                    "voter_id": "v1",
                    "image_b64": b64(&face_a()),
                    "frames_b64": [b64(&face_a_moved())],
                })
                .to_string(),
            )
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Unauthorized);

        let response = client
            .put(uri!(replace_template("nobody")))
            .header(ContentType::JSON)
            .body(json!({"image_b64": b64(&face_b())}).to_string())
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::NotFound);
    }

    #[backend_test(admin)]
    async fn blocked_voter_loses_token(client: Client, clock: ManualClock) {
        let election = open_election(&client, &clock).await;
        enrol(&client, "v1").await;
        let token = issue_token(&client, "v1", election.election_id).await;

        let response = client.post(uri!(block_voter("v1"))).dispatch().await;
        assert_eq!(response.status(), Status::Ok);
        let voter: VoterView = response.into_json().await.unwrap();
        assert_eq!(voter.state, EnrollmentState::Blocked);

        let response = submit(&client, &token, 1, &encrypt(&client, 1)).await;
        assert_eq!(response.status(), Status::Unauthorized);
        let body: ErrorBody = response.into_json().await.unwrap();
        assert_eq!(body.code, Code::TokenInvalid);

        let response = request_token(&client, "v1", election.election_id).await;
        assert_eq!(response.status(), Status::Forbidden);
        let body: ErrorBody = response.into_json().await.unwrap();
        assert_eq!(body.code, Code::NotApproved);
    }

    #[backend_test(admin)]
    async fn erased_voter_is_gone(client: Client) {
        enrol(&client, "v1").await;
        login_voter(&client, "v1").await;

        let response = client.delete(uri!(erase_voter("v1"))).dispatch().await;
        assert_eq!(response.status(), Status::Ok);
        assert_eq!(view(&client, "v1").await.status(), Status::NotFound);
        let response = client.delete(uri!(erase_voter("v1"))).dispatch().await;
        assert_eq!(response.status(), Status::NotFound);

        // The erased voter's session no longer opens the token endpoint.
        let response = request_token(&client, "v1", 1).await;
        assert_eq!(response.status(), Status::Unauthorized);
    }

    #[backend_test]
    async fn voters_require_admin(client: Client) {
        let response = post_voter(&client, "v1", &face_a()).await;
        assert_eq!(response.status(), Status::Unauthorized);
        assert_eq!(view(&client, "v1").await.status(), Status::Unauthorized);
    }
}
