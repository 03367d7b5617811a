use rocket::{serde::json::Json, Route, State};

use crate::{
    error::Result,
    model::{
        admin::Admin,
        auth::AuthToken,
        block::{Block, ChainReport},
        election::ElectionId,
    },
    service::Services,
};

use super::admin_actor;

pub fn routes() -> Vec<Route> {
    routes![verify_ledger, get_blocks, delete_block, replace_block]
}

#[get("/ledger/verify?<election_id>")]
async fn verify_ledger(election_id: ElectionId, services: &State<Services>) -> Result<Json<ChainReport>> {
    Ok(Json(services.ledger.verify(election_id).await?))
}

#[get("/ledger/<election_id>/blocks?<from>&<limit>")]
async fn get_blocks(
    election_id: ElectionId,
    from: Option<u64>,
    limit: Option<usize>,
    services: &State<Services>,
) -> Result<Json<Vec<Block>>> {
    let blocks = services
        .ledger
        .blocks(election_id, from.unwrap_or_default(), limit)
        .await?;
    Ok(Json(blocks))
}

/// Blocks are never deleted. The attempt is audited.
#[delete("/ledger/<election_id>/blocks/<index>")]
async fn delete_block(
    token: Option<AuthToken<Admin>>,
    election_id: ElectionId,
    index: u64,
    services: &State<Services>,
) -> Result<()> {
    let actor = actor(token.as_ref());
    Err(services
        .ledger
        .reject_modification(election_id, index, "delete", &actor)
        .await)
}

/// Blocks are never overwritten. The attempt is audited.
#[put("/ledger/<election_id>/blocks/<index>")]
async fn replace_block(
    token: Option<AuthToken<Admin>>,
    election_id: ElectionId,
    index: u64,
    services: &State<Services>,
) -> Result<()> {
    let actor = actor(token.as_ref());
    Err(services
        .ledger
        .reject_modification(election_id, index, "overwrite", &actor)
        .await)
}

fn actor(token: Option<&AuthToken<Admin>>) -> String {
    token.map_or_else(|| "anonymous".to_string(), admin_actor)
}

#[cfg(test)]
mod tests {
    use rocket::{http::Status, local::asynchronous::Client};

    use crate::{
        api::examples::{cast_vote, open_election},
        clock::ManualClock,
        error::{Code, ErrorBody},
        model::audit::{AuditEventType, AuditFilter},
    };

    use super::*;

    async fn chain(client: &Client, election_id: ElectionId) -> Vec<Block> {
        let response = client.get(uri!(get_blocks(election_id, _, _))).dispatch().await;
        assert_eq!(response.status(), Status::Ok);
        response.into_json().await.unwrap()
    }

    async fn violations(client: &Client) -> Vec<crate::model::audit::AuditEvent> {
        let services = client.rocket().state::<Services>().unwrap();
        let filter = AuditFilter {
            event_type: Some(AuditEventType::IntegrityViolation),
            ..Default::default()
        };
        services.audit.query(&filter).await.unwrap()
    }

    #[backend_test(admin)]
    async fn blocks_cannot_be_deleted_or_replaced(client: Client, clock: ManualClock) {
        let election = open_election(&client, &clock).await;
        let election_id = election.election_id;
        for (i, candidate_id) in [1, 2, 1, 2].into_iter().enumerate() {
            cast_vote(&client, &format!("v{i}"), election_id, candidate_id).await;
        }
        let before = chain(&client, election_id).await;
        assert_eq!(before.len(), 5);

        let response = client.delete(uri!(delete_block(election_id, 3))).dispatch().await;
        assert_eq!(response.status(), Status::Forbidden);
        let body: ErrorBody = response.into_json().await.unwrap();
        assert_eq!(body.code, Code::LedgerImmutable);

        let response = client.put(uri!(replace_block(election_id, 0))).dispatch().await;
        assert_eq!(response.status(), Status::Forbidden);

        assert_eq!(chain(&client, election_id).await, before);
        let response = client.get(uri!(verify_ledger(election_id))).dispatch().await;
        let report: ChainReport = response.into_json().await.unwrap();
        assert!(report.ok);
        assert_eq!(report.first_bad_index, None);

        let events = violations(&client).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].block_index, Some(3));
        assert_eq!(events[1].actor, "admin:admin");
        assert_eq!(events[0].block_index, Some(0));
    }

    #[backend_test]
    async fn anonymous_modification_is_audited(client: Client) {
        let response = client.delete(uri!(delete_block(1, 1))).dispatch().await;
        assert_eq!(response.status(), Status::Forbidden);

        let events = violations(&client).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].actor, "anonymous");
    }

    #[backend_test(admin)]
    async fn blocks_are_paged(client: Client, clock: ManualClock) {
        let election = open_election(&client, &clock).await;
        let election_id = election.election_id;
        for (i, candidate_id) in [1, 2, 2].into_iter().enumerate() {
            cast_vote(&client, &format!("v{i}"), election_id, candidate_id).await;
        }
        let all = chain(&client, election_id).await;

        let response = client
            .get(uri!(get_blocks(election_id, Some(1u64), Some(2usize))))
            .dispatch()
            .await;
        let page: Vec<Block> = response.into_json().await.unwrap();
        assert_eq!(page, all[1..3].to_vec());

        let response = client
            .get(uri!(get_blocks(election_id, Some(10u64), _)))
            .dispatch()
            .await;
        let page: Vec<Block> = response.into_json().await.unwrap();
        assert!(page.is_empty());
    }

    #[backend_test]
    async fn unknown_election_ledger(client: Client) {
        let response = client.get(uri!(verify_ledger(42))).dispatch().await;
        assert_eq!(response.status(), Status::NotFound);
        let response = client.get(uri!(get_blocks(42, _, _))).dispatch().await;
        assert_eq!(response.status(), Status::NotFound);
    }
}
