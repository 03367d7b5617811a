use log::info;
use rocket::{http::Status, serde::json::Json, Route, State};

use crate::{
    error::Result,
    model::{
        admin::{Admin, AdminCredentials},
        audit::AuditEventType,
        auth::AuthToken,
    },
    service::Services,
};

use super::admin_actor;

pub fn routes() -> Vec<Route> {
    routes![get_admins, create_admin, delete_admin]
}

#[get("/admins")]
async fn get_admins(_token: AuthToken<Admin>, services: &State<Services>) -> Result<Json<Vec<String>>> {
    let admin_names = services
        .store()
        .list_admins()
        .await?
        .into_iter()
        .map(|admin| admin.username)
        .collect();
    Ok(Json(admin_names))
}

#[post("/admins", data = "<new_admin>", format = "json")]
async fn create_admin(
    token: AuthToken<Admin>,
    new_admin: Json<AdminCredentials>,
    services: &State<Services>,
) -> Result<Status> {
    let admin = Admin::try_from(new_admin.0)?;
    services.store().insert_admin(&admin).await?;

    info!("Admin {} created by {}", admin.username, token.id);
    let audit = &services.audit;
    audit
        .record(audit.event(
            AuditEventType::AdminAction,
            admin_actor(&token),
            format!("admin:{}", admin.username),
            "created",
        ))
        .await;
    Ok(Status::Created)
}

#[delete("/admins/<username>")]
async fn delete_admin(token: AuthToken<Admin>, username: &str, services: &State<Services>) -> Result<()> {
    services.store().delete_admin(username).await?;

    info!("Admin {username} deleted by {}", token.id);
    let audit = &services.audit;
    audit
        .record(audit.event(
            AuditEventType::AdminAction,
            admin_actor(&token),
            format!("admin:{username}"),
            "deleted",
        ))
        .await;
    Ok(())
}
