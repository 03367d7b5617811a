#[macro_use]
extern crate rocket;

#[cfg(test)]
#[macro_use]
extern crate backend_test;

use std::sync::Arc;

use rocket::{figment::Figment, Build, Rocket};

use crate::{
    biometric::{FaceAnalyzer, JpegAnalyzer},
    clock::{Clock, SystemClock},
    config::{ConfigFairing, KeyStoreFairing, StoreFairing},
    logging::LoggerFairing,
    service::{ElectionClosersFairing, ServicesFairing},
};

pub mod api;
pub mod biometric;
pub mod clock;
pub mod config;
pub mod crypto;
pub mod error;
pub mod logging;
pub mod model;
pub mod scheduled_task;
pub mod service;
pub mod store;

pub use config::Config;
pub use service::{ElectionClosers, Services};

/// The server, configured from `Rocket.toml` and `ROCKET_*` environment variables.
pub fn build() -> Rocket<Build> {
    build_with(rocket::Config::figment(), Arc::new(SystemClock), Arc::new(JpegAnalyzer))
}

/// The server with an explicit configuration source, clock and face analyzer.
///
/// Fairings run in attachment order, each relying on the state managed by
/// the ones before it.
pub fn build_with(figment: Figment, clock: Arc<dyn Clock>, analyzer: Arc<dyn FaceAnalyzer>) -> Rocket<Build> {
    rocket::custom(figment)
        .mount("/", api::routes())
        .register("/", api::catchers())
        .attach(ConfigFairing)
        .attach(KeyStoreFairing)
        .attach(StoreFairing)
        .attach(ServicesFairing::new(clock, analyzer))
        .attach(ElectionClosersFairing)
        .attach(LoggerFairing)
}

/// A server over the in-memory store and the development keys, with time
/// controlled by `clock`.
#[cfg(test)]
pub(crate) fn rocket_for_tests(clock: clock::ManualClock) -> Rocket<Build> {
    use rocket::figment::providers::Serialized;

    let figment = rocket::Config::figment()
        .merge(Serialized::globals(Config::example()))
        .merge(Serialized::global("db_uri", config::MEMORY_DB_URI))
        .merge(Serialized::global("log_level", "off"));
    build_with(figment, Arc::new(clock), Arc::new(JpegAnalyzer))
}
