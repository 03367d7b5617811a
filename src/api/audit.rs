use rocket::{serde::json::Json, Route, State};

use crate::{
    error::{Code, Error, Result},
    model::{
        admin::Admin,
        audit::{AuditEvent, AuditEventType, AuditFilter},
        auth::AuthToken,
    },
    service::Services,
};

pub fn routes() -> Vec<Route> {
    routes![get_audit]
}

/// Query the audit log, newest first.
#[get("/audit?<event_type>&<subject>&<limit>")]
async fn get_audit(
    _token: AuthToken<Admin>,
    event_type: Option<&str>,
    subject: Option<String>,
    limit: Option<usize>,
    services: &State<Services>,
) -> Result<Json<Vec<AuditEvent>>> {
    let event_type = event_type
        .map(|name| name.parse::<AuditEventType>())
        .transpose()
        .map_err(|name| Error::input(Code::BadRequest, format!("Unknown audit event type: {name}")))?;
    let filter = AuditFilter {
        event_type,
        subject,
        limit,
    };
    Ok(Json(services.audit.query(&filter).await?))
}
