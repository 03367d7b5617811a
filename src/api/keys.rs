use std::sync::Arc;

use rocket::{serde::json::Json, Route, State};

use crate::crypto::{KeyStore, PublicKeys};

pub fn routes() -> Vec<Route> {
    routes![get_keys]
}

/// The public halves of the server keys, so clients can encrypt ballots and
/// check tokens, blocks and receipts.
#[get("/keys")]
fn get_keys(keys: &State<Arc<KeyStore>>) -> Json<PublicKeys> {
    Json(keys.public_keys().clone())
}
