use log::info;
use rocket::{http::Status, serde::json::Json, Route, State};

use crate::{
    error::Result,
    model::{
        admin::Admin,
        auth::AuthToken,
        dump::ElectionDump,
        election::{Election, ElectionId, ElectionSpec},
        tally::{ElectionResults, Tally},
    },
    service::{ElectionClosers, Services},
};

use super::admin_actor;

pub fn routes() -> Vec<Route> {
    routes![
        get_elections,
        get_election,
        create_election,
        delete_election,
        open_election,
        close_election,
        tally_election,
        archive_election,
        resume_election,
        get_results,
        get_proof,
        get_dump,
    ]
}

#[get("/elections")]
async fn get_elections(services: &State<Services>) -> Result<Json<Vec<Election>>> {
    Ok(Json(services.lifecycle.list().await?))
}

#[get("/elections/<election_id>")]
async fn get_election(election_id: ElectionId, services: &State<Services>) -> Result<Json<Election>> {
    Ok(Json(services.lifecycle.get(election_id).await?))
}

#[post("/elections", data = "<spec>", format = "json")]
async fn create_election(
    token: AuthToken<Admin>,
    spec: Json<ElectionSpec>,
    services: &State<Services>,
) -> Result<(Status, Json<Election>)> {
    let election = services.lifecycle.create(spec.0, &admin_actor(&token)).await?;
    Ok((Status::Created, Json(election)))
}

/// Only DRAFT and ARCHIVED elections can be deleted.
#[delete("/elections/<election_id>")]
async fn delete_election(
    token: AuthToken<Admin>,
    election_id: ElectionId,
    services: &State<Services>,
    closers: &State<ElectionClosers>,
) -> Result<()> {
    services.lifecycle.delete(election_id, &admin_actor(&token)).await?;
    closers.cancel(election_id).await;
    Ok(())
}

/// Open an election for voting and schedule it to close at its end time.
#[post("/elections/<election_id>/open")]
async fn open_election(
    token: AuthToken<Admin>,
    election_id: ElectionId,
    services: &State<Services>,
    closers: &State<ElectionClosers>,
) -> Result<Json<Election>> {
    let election = services.lifecycle.open(election_id, &admin_actor(&token)).await?;
    closers.schedule(services, &election).await;
    info!("Election {election_id} closes at {}", election.end_time);
    Ok(Json(election))
}

/// Close an election ahead of its scheduled end.
#[post("/elections/<election_id>/close")]
async fn close_election(
    token: AuthToken<Admin>,
    election_id: ElectionId,
    services: &State<Services>,
    closers: &State<ElectionClosers>,
) -> Result<Json<Election>> {
    let election = services.lifecycle.close(election_id, &admin_actor(&token)).await?;
    closers.cancel(election_id).await;
    Ok(Json(election))
}

#[post("/elections/<election_id>/tally")]
async fn tally_election(token: AuthToken<Admin>, election_id: ElectionId, services: &State<Services>) -> Result<Json<Tally>> {
    Ok(Json(services.tally.tally(election_id, &admin_actor(&token)).await?))
}

#[post("/elections/<election_id>/archive")]
async fn archive_election(
    token: AuthToken<Admin>,
    election_id: ElectionId,
    services: &State<Services>,
) -> Result<Json<Election>> {
    Ok(Json(services.lifecycle.archive(election_id, &admin_actor(&token)).await?))
}

/// Lift a suspension once the ledger and keys check out again.
#[post("/elections/<election_id>/resume")]
async fn resume_election(
    token: AuthToken<Admin>,
    election_id: ElectionId,
    services: &State<Services>,
) -> Result<Json<Election>> {
    Ok(Json(services.lifecycle.resume(election_id, &admin_actor(&token)).await?))
}

#[get("/elections/<election_id>/results")]
async fn get_results(election_id: ElectionId, services: &State<Services>) -> Result<Json<ElectionResults>> {
    Ok(Json(services.lifecycle.results(election_id).await?))
}

#[get("/elections/<election_id>/proof")]
async fn get_proof(election_id: ElectionId, services: &State<Services>) -> Result<Json<Tally>> {
    Ok(Json(services.lifecycle.proof(election_id).await?))
}

/// Everything `verify-evote` needs to check a tallied election offline.
#[get("/elections/<election_id>/dump")]
async fn get_dump(election_id: ElectionId, services: &State<Services>) -> Result<Json<ElectionDump>> {
    Ok(Json(services.lifecycle.dump(election_id).await?))
}
