use data_encoding::BASE64;
use rocket::{http::Status, serde::json::Json, Catcher, Request, Route};

use crate::{
    biometric::Capture,
    error::{Code, Error, ErrorBody, Result},
    model::{admin::Admin, auth::AuthToken},
};

pub mod admins;
pub mod audit;
pub mod auth;
pub mod elections;
pub mod keys;
pub mod ledger;
pub mod voters;
pub mod voting;

pub fn routes() -> Vec<Route> {
    let mut routes = Vec::new();
    routes.extend(admins::routes());
    routes.extend(audit::routes());
    routes.extend(auth::routes());
    routes.extend(elections::routes());
    routes.extend(keys::routes());
    routes.extend(ledger::routes());
    routes.extend(voters::routes());
    routes.extend(voting::routes());
    routes
}

pub fn catchers() -> Vec<Catcher> {
    catchers![json_error]
}

/// Errors raised by Rocket itself (unmatched routes, failed guards, bodies
/// that do not parse) get the same JSON shape as our own.
#[catch(default)]
fn json_error(status: Status, _req: &Request) -> (Status, Json<ErrorBody>) {
    let (code, message) = match status.code {
        400 | 422 => (Code::BadRequest, "Malformed request"),
        401 => (Code::Unauthorized, "Authentication required"),
        403 => (Code::Forbidden, "Forbidden"),
        404 => (Code::NotFound, "No such resource"),
        500..=599 => (Code::Fatal, "Internal server error"),
        _ => (Code::BadRequest, status.reason_lossy()),
    };
    (status, Json(ErrorBody::new(code, message)))
}

/// How an administrator appears in the audit log.
pub(crate) fn admin_actor(token: &AuthToken<Admin>) -> String {
    format!("admin:{}", token.id)
}

/// Decode a base64 capture: the primary image plus any liveness frames.
pub(crate) fn decode_capture(image_b64: &str, frames_b64: &[String]) -> Result<Capture> {
    let image = decode_b64(image_b64)?;
    let frames = frames_b64.iter().map(|frame| decode_b64(frame)).collect::<Result<_>>()?;
    Ok(Capture::new(image, frames))
}

fn decode_b64(encoded: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(encoded.trim().as_bytes())
        .map_err(|e| Error::input(Code::BadRequest, format!("Capture is not valid base64: {e}")))
}

/// HTTP helpers shared by the route tests.
#[cfg(test)]
pub(crate) mod examples {
    use std::sync::Arc;

    use num_bigint::BigUint;
    use rand::thread_rng;
    use rocket::{
        http::{ContentType, Status},
        local::asynchronous::{Client, LocalResponse},
        serde::json::serde_json::json,
    };

    use crate::{
        biometric::examples::{b64, face_a, face_a_moved},
        clock::{Clock, ManualClock},
        crypto::{keys::KeyStore, paillier::paillier_encrypt},
        model::{
            ballot::Receipt,
            election::{Election, ElectionId, ElectionSpec},
            token::IssuedOvt,
            voter::VoterView,
        },
    };

    /// Enrol a voter with the example face and approve them. Needs an admin session.
    pub async fn enrol_voter(client: &Client, voter_id: &str) -> VoterView {
        let response = client
            .post("/voters")
            .header(ContentType::JSON)
            .body(
                json!({
                    "voter_id": voter_id,
                    "name": "Vera Voter",
                    "contact": "vera@example.com",
                    "image_b64": b64(&face_a()),
                })
                .to_string(),
            )
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Created);
        let response = client.post(format!("/voters/{voter_id}/approve")).dispatch().await;
        assert_eq!(response.status(), Status::Ok);
        response.into_json().await.unwrap()
    }

    /// Open a voter session with a live capture of the example face.
    pub async fn login_voter(client: &Client, voter_id: &str) {
        let response = client
            .post("/auth/face")
            .header(ContentType::JSON)
            .body(
                json!({
                    "voter_id": voter_id,
                    "image_b64": b64(&face_a()),
                    "frames_b64": [b64(&face_a_moved())],
                })
                .to_string(),
            )
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Ok);
    }

    pub async fn create_election(client: &Client, spec: &ElectionSpec) -> Election {
        let response = client
            .post("/elections")
            .header(ContentType::JSON)
            .body(json!(spec).to_string())
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Created);
        response.into_json().await.unwrap()
    }

    /// Create and open the example two-candidate election. Needs an admin session.
    pub async fn open_election(client: &Client, clock: &ManualClock) -> Election {
        let election = create_election(client, &ElectionSpec::example(clock.now())).await;
        let response = client
            .post(format!("/elections/{}/open", election.election_id))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Ok);
        response.into_json().await.unwrap()
    }

    pub async fn request_token<'c>(client: &'c Client, voter_id: &str, election_id: ElectionId) -> LocalResponse<'c> {
        client
            .post("/ovt/issue")
            .header(ContentType::JSON)
            .body(json!({"voter_id": voter_id, "election_id": election_id}).to_string())
            .dispatch()
            .await
    }

    /// Log the voter in and get them a token.
    pub async fn issue_token(client: &Client, voter_id: &str, election_id: ElectionId) -> IssuedOvt {
        login_voter(client, voter_id).await;
        let response = request_token(client, voter_id, election_id).await;
        assert_eq!(response.status(), Status::Ok);
        response.into_json().await.unwrap()
    }

    /// A fresh encryption of `m` under the server's Paillier key.
    pub fn encrypt(client: &Client, m: u32) -> String {
        let keys = client.rocket().state::<Arc<KeyStore>>().unwrap();
        paillier_encrypt(keys.paillier_public(), &BigUint::from(m), &mut thread_rng())
            .unwrap()
            .to_string()
    }

    pub async fn submit<'c>(
        client: &'c Client,
        token: &IssuedOvt,
        candidate_id: u32,
        ciphertext: &str,
    ) -> LocalResponse<'c> {
        client
            .post("/ballot/submit")
            .header(ContentType::JSON)
            .body(
                json!({
                    "election_id": token.election_id,
                    "candidate_id": candidate_id,
                    "ciphertext": ciphertext,
                    "token_id": token.token_id,
                    "token_signature": token.signature,
                })
                .to_string(),
            )
            .dispatch()
            .await
    }

    /// Enrol a voter and cast an encryption of 1 for `candidate_id`.
    pub async fn cast_vote(client: &Client, voter_id: &str, election_id: ElectionId, candidate_id: u32) -> Receipt {
        enrol_voter(client, voter_id).await;
        let token = issue_token(client, voter_id, election_id).await;
        let response = submit(client, &token, candidate_id, &encrypt(client, 1)).await;
        assert_eq!(response.status(), Status::Created);
        response.into_json().await.unwrap()
    }
}

#[cfg(test)]
mod tests {
    use rocket::local::asynchronous::Client;

    use super::*;

    #[test]
    fn captures_decode_or_fail_as_input() {
        let capture = decode_capture("AAEC", &["AwQ=".to_string()]).unwrap();
        assert_eq!(capture.image, vec![0, 1, 2]);
        assert_eq!(capture.frames, vec![vec![3, 4]]);
        let err = decode_capture("not base64!", &[]).unwrap_err();
        assert_eq!(err.code(), Code::BadRequest);
    }

    #[backend_test]
    async fn unknown_routes_get_json_errors(client: Client) {
        let response = client.get("/no/such/route").dispatch().await;
        assert_eq!(response.status(), Status::NotFound);
        let body: ErrorBody = response.into_json().await.unwrap();
        assert_eq!(body.code, Code::NotFound);
    }
}
