use log::warn;
use rocket::{http::Status, serde::json::Json, Route, State};
use serde::{Deserialize, Serialize};

use crate::{
    error::{Code, Error, Result},
    model::{
        admin::Admin,
        auth::AuthToken,
        ballot::{Receipt, SubmitBallot},
        election::ElectionId,
        token::{IssuedOvt, Ovt, TokenId},
        voter::{Voter, VoterId},
    },
    service::Services,
};

use super::admin_actor;

pub fn routes() -> Vec<Route> {
    routes![issue_token, revoke_token, submit_ballot, fetch_receipt]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueRequest {
    pub voter_id: VoterId,
    pub election_id: ElectionId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiptRequest {
    pub token_id: TokenId,
    pub token_signature: String,
}

/// Issue a one-time voting token to the voter holding the session.
#[post("/ovt/issue", data = "<request>", format = "json")]
async fn issue_token(
    token: AuthToken<Voter>,
    request: Json<IssueRequest>,
    services: &State<Services>,
) -> Result<Json<IssuedOvt>> {
    if token.id != request.voter_id {
        warn!("Voter {} asked for a token on behalf of {}", token.id, request.voter_id);
        return Err(Error::auth(
            Code::Forbidden,
            "Tokens can only be requested for the authenticated voter",
        ));
    }
    let ovt = services.ovts.issue(&request.voter_id, request.election_id).await?;
    Ok(Json(ovt.into()))
}

#[post("/ovt/<token_id>/revoke")]
async fn revoke_token(token: AuthToken<Admin>, token_id: &str, services: &State<Services>) -> Result<Json<Ovt>> {
    let ovt = services.ovts.revoke(token_id, &admin_actor(&token)).await?;
    Ok(Json(ovt))
}

/// Accept an encrypted ballot. Ballots are anonymous: the token is the only
/// credential.
#[post("/ballot/submit", data = "<ballot>", format = "json")]
async fn submit_ballot(ballot: Json<SubmitBallot>, services: &State<Services>) -> Result<(Status, Json<Receipt>)> {
    let receipt = services.ingestor.submit(&ballot).await?;
    Ok((Status::Created, Json(receipt)))
}

/// The receipt for the ballot a token was spent on, for clients that lost the
/// submission response.
#[post("/ballot/receipt", data = "<request>", format = "json")]
async fn fetch_receipt(request: Json<ReceiptRequest>, services: &State<Services>) -> Result<Json<Receipt>> {
    let receipt = services
        .ovts
        .receipt(&request.token_id, &request.token_signature)
        .await?;
    Ok(Json(receipt))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration;
    use rocket::{futures::future::join, http::ContentType, local::asynchronous::Client, serde::json::serde_json::json};

    use crate::{
        api::examples::{
            cast_vote, encrypt, enrol_voter, issue_token as issue, login_voter, open_election, request_token, submit,
        },
        clock::ManualClock,
        config::Config,
        crypto::{canonical, rsa_pss_verify, KeyStore},
        error::ErrorBody,
        model::{block::Block, token::TokenState, voter::VoterView},
    };

    use super::*;

    async fn error_code(response: rocket::local::asynchronous::LocalResponse<'_>) -> Code {
        let body: ErrorBody = response.into_json().await.unwrap();
        body.code
    }

    #[backend_test(admin)]
    async fn happy_path(client: Client, clock: ManualClock) {
        let election = open_election(&client, &clock).await;
        let receipt = cast_vote(&client, "v1", election.election_id, 1).await;
        assert_eq!(receipt.payload.block_index, 1);
        assert_eq!(receipt.payload.election_id, election.election_id);

        let keys = client.rocket().state::<Arc<KeyStore>>().unwrap();
        rsa_pss_verify(
            keys.receipt_verifying(),
            &canonical(&receipt.payload).unwrap(),
            &receipt.receipt_signature,
        )
        .unwrap();

        let response = client
            .get(format!("/ledger/{}/blocks", election.election_id))
            .dispatch()
            .await;
        let blocks: Vec<Block> = response.into_json().await.unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[1].block_hash, receipt.payload.block_hash);

        let response = client.get("/voters/v1").dispatch().await;
        let voter: VoterView = response.into_json().await.unwrap();
        assert!(voter.has_voted_for.contains(&election.election_id));
    }

    #[backend_test(admin)]
    async fn double_vote_and_replay(client: Client, clock: ManualClock) {
        let election = open_election(&client, &clock).await;
        enrol_voter(&client, "v1").await;
        let token = issue(&client, "v1", election.election_id).await;
        let ciphertext = encrypt(&client, 1);
        let response = submit(&client, &token, 1, &ciphertext).await;
        assert_eq!(response.status(), Status::Created);

        let response = request_token(&client, "v1", election.election_id).await;
        assert_eq!(response.status(), Status::Conflict);
        assert_eq!(error_code(response).await, Code::AlreadyVoted);

        let response = submit(&client, &token, 1, &ciphertext).await;
        assert_eq!(response.status(), Status::Unauthorized);
        assert_eq!(error_code(response).await, Code::TokenInvalid);
    }

    #[backend_test(admin)]
    async fn outstanding_token_blocks_reissue(client: Client, clock: ManualClock) {
        let election = open_election(&client, &clock).await;
        enrol_voter(&client, "v1").await;
        issue(&client, "v1", election.election_id).await;
        let response = request_token(&client, "v1", election.election_id).await;
        assert_eq!(response.status(), Status::Conflict);
        assert_eq!(error_code(response).await, Code::OvtOutstanding);
    }

    #[backend_test(admin)]
    async fn expired_token_can_be_replaced(client: Client, clock: ManualClock) {
        let election = open_election(&client, &clock).await;
        enrol_voter(&client, "v1").await;
        let token = issue(&client, "v1", election.election_id).await;

        let ttl = client.rocket().state::<Config>().unwrap().ovt_ttl();
        clock.advance(ttl + Duration::seconds(1));
        let response = submit(&client, &token, 1, &encrypt(&client, 1)).await;
        assert_eq!(response.status(), Status::Unauthorized);
        assert_eq!(error_code(response).await, Code::Expired);

        let fresh = issue(&client, "v1", election.election_id).await;
        assert_ne!(fresh.token_id, token.token_id);
        let response = submit(&client, &fresh, 1, &encrypt(&client, 1)).await;
        assert_eq!(response.status(), Status::Created);
    }

    #[backend_test(admin)]
    async fn concurrent_submissions_accept_one(client: Client, clock: ManualClock) {
        let election = open_election(&client, &clock).await;
        enrol_voter(&client, "v1").await;
        let token = issue(&client, "v1", election.election_id).await;
        let (first, second) = (encrypt(&client, 1), encrypt(&client, 1));

        let (a, b) = join(submit(&client, &token, 1, &first), submit(&client, &token, 2, &second)).await;
        let mut statuses = vec![a.status(), b.status()];
        statuses.sort_by_key(|status| status.code);
        assert_eq!(statuses, vec![Status::Created, Status::Unauthorized]);
    }

    #[backend_test(admin)]
    async fn tokens_only_for_the_session_voter(client: Client, clock: ManualClock) {
        let election = open_election(&client, &clock).await;
        enrol_voter(&client, "v1").await;
        enrol_voter(&client, "v2").await;
        login_voter(&client, "v1").await;

        let response = request_token(&client, "v2", election.election_id).await;
        assert_eq!(response.status(), Status::Forbidden);
        assert_eq!(error_code(response).await, Code::Forbidden);
    }

    #[backend_test]
    async fn tokens_need_a_voter_session(client: Client) {
        let response = request_token(&client, "v1", 1).await;
        assert_eq!(response.status(), Status::Unauthorized);
    }

    #[backend_test(admin)]
    async fn ballot_for_unknown_candidate(client: Client, clock: ManualClock) {
        let election = open_election(&client, &clock).await;
        enrol_voter(&client, "v1").await;
        let token = issue(&client, "v1", election.election_id).await;

        let response = submit(&client, &token, 7, &encrypt(&client, 1)).await;
        assert_eq!(response.status(), Status::BadRequest);
        assert_eq!(error_code(response).await, Code::BadCandidate);
        let response = submit(&client, &token, 1, "not-a-number").await;
        assert_eq!(response.status(), Status::BadRequest);
        assert_eq!(error_code(response).await, Code::BadCiphertext);

        // Rejected ballots leave the token usable.
        let response = submit(&client, &token, 1, &encrypt(&client, 1)).await;
        assert_eq!(response.status(), Status::Created);
    }

    #[backend_test(admin)]
    async fn receipt_can_be_fetched_again(client: Client, clock: ManualClock) {
        let election = open_election(&client, &clock).await;
        enrol_voter(&client, "v1").await;
        let token = issue(&client, "v1", election.election_id).await;
        let request = json!({"token_id": token.token_id, "token_signature": token.signature}).to_string();

        let response = client
            .post(uri!(fetch_receipt))
            .header(ContentType::JSON)
            .body(&request)
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::NotFound);

        let response = submit(&client, &token, 2, &encrypt(&client, 1)).await;
        let receipt: Receipt = response.into_json().await.unwrap();
        let response = client
            .post(uri!(fetch_receipt))
            .header(ContentType::JSON)
            .body(&request)
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Ok);
        assert_eq!(response.into_json::<Receipt>().await.unwrap(), receipt);

        let forged = json!({"token_id": token.token_id, "token_signature": "00"}).to_string();
        let response = client
            .post(uri!(fetch_receipt))
            .header(ContentType::JSON)
            .body(forged)
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Unauthorized);
    }

    #[backend_test(admin)]
    async fn revoked_token_is_refused(client: Client, clock: ManualClock) {
        let election = open_election(&client, &clock).await;
        enrol_voter(&client, "v1").await;
        let token = issue(&client, "v1", election.election_id).await;

        let response = client.post(uri!(revoke_token(token.token_id.as_str()))).dispatch().await;
        assert_eq!(response.status(), Status::Ok);
        let revoked: Ovt = response.into_json().await.unwrap();
        assert_eq!(revoked.state, TokenState::Revoked);

        let response = submit(&client, &token, 1, &encrypt(&client, 1)).await;
        assert_eq!(response.status(), Status::Unauthorized);
        assert_eq!(error_code(response).await, Code::TokenInvalid);

        let response = client.post(uri!(revoke_token("no-such-token"))).dispatch().await;
        assert_eq!(response.status(), Status::NotFound);
    }
}
