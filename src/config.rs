use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Duration;
use log::{error, info, warn};
use rocket::{
    fairing::{Fairing, Info, Kind},
    Build, Rocket,
};
use serde::{Deserialize, Serialize};

use crate::{
    biometric::MatcherSettings,
    crypto::KeyStore,
    error::{Code, Result},
    model::{
        admin::{Admin, AdminCredentials},
        election::PublicParams,
    },
    store::{MemoryStore, MongoStore, Store},
};

/// `db_uri` value selecting the in-process store.
pub const MEMORY_DB_URI: &str = "memory";

/// Application configuration, derived from `Rocket.toml` and `ROCKET_*`
/// environment variables. This struct becomes managed state and can be
/// inspected by any endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // non-secrets
    ovt_ttl: u32,
    auth_ttl: u32,
    admin_auth_ttl: u32,
    key_dir: PathBuf,
    match_threshold: f64,
    quality_min: f64,
    liveness_required: bool,
    submission_deadline_ms: u64,
    default_admin_username: String,
    // secrets
    jwt_secret: String,
    default_admin_password: String,
}

impl Config {
    /// Valid lifetime of a one-time voting token.
    pub fn ovt_ttl(&self) -> Duration {
        Duration::seconds(self.ovt_ttl.into())
    }

    /// Valid lifetime of voter session cookies in seconds.
    pub fn auth_ttl(&self) -> Duration {
        Duration::seconds(self.auth_ttl.into())
    }

    /// Valid lifetime of admin session cookies in seconds.
    pub fn admin_auth_ttl(&self) -> Duration {
        Duration::seconds(self.admin_auth_ttl.into())
    }

    /// Secret key used to encrypt JWTs.
    pub fn jwt_secret(&self) -> &[u8] {
        self.jwt_secret.as_bytes()
    }

    /// Directory of the read-only key store.
    pub fn key_dir(&self) -> &Path {
        &self.key_dir
    }

    pub fn matcher_settings(&self) -> MatcherSettings {
        MatcherSettings {
            match_threshold: self.match_threshold,
            quality_min: self.quality_min,
            liveness_required: self.liveness_required,
        }
    }

    /// Ballot submissions still in flight after this long are abandoned.
    pub fn submission_deadline(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.submission_deadline_ms)
    }

    /// Credentials of the admin created when none exists.
    pub fn default_admin(&self) -> AdminCredentials {
        AdminCredentials {
            username: self.default_admin_username.clone(),
            password: self.default_admin_password.clone(),
        }
    }
}

/// A fairing that loads the application config and puts it in managed state.
/// This could easily be achieved using `AdHoc::config`, but is written out
/// explicitly for symmetry with the other fairings and control over error
/// messages.
pub struct ConfigFairing;

#[rocket::async_trait]
impl Fairing for ConfigFairing {
    fn info(&self) -> Info {
        Info {
            name: "Config",
            kind: Kind::Ignite,
        }
    }

    async fn on_ignite(&self, mut rocket: Rocket<Build>) -> rocket::fairing::Result {
        // Load the config.
        let config = match rocket.figment().extract::<Config>() {
            Ok(config) => config,
            Err(e) => {
                error!("Failed to load application config");
                rocket::config::pretty_print_error(e);
                return Err(rocket);
            }
        };

        // Manage the state.
        rocket = rocket.manage(config);
        Ok(rocket)
    }
}

/// A fairing that loads every key from the key store directory and places an
/// `Arc<KeyStore>` into managed state. Missing or malformed keys abort ignition.
/// This fairing must be attached after [`ConfigFairing`].
pub struct KeyStoreFairing;

#[rocket::async_trait]
impl Fairing for KeyStoreFairing {
    fn info(&self) -> Info {
        Info {
            name: "Key store",
            kind: Kind::Ignite,
        }
    }

    async fn on_ignite(&self, rocket: Rocket<Build>) -> rocket::fairing::Result {
        let key_dir = match rocket.state::<Config>() {
            Some(config) => config.key_dir().to_path_buf(),
            None => {
                error!("Config was not available when loading keys");
                return Err(rocket);
            }
        };
        let keys = match KeyStore::load(&key_dir) {
            Ok(keys) => keys,
            Err(e) => {
                error!("Failed to load key store from {}: {e}", key_dir.display());
                return Err(rocket);
            }
        };
        let public = keys.public_keys();
        info!(
            "Loaded key store: ovt {}, ledger {}, receipt {}",
            public.ovt_fingerprint, public.ledger_fingerprint, public.receipt_fingerprint
        );

        Ok(rocket.manage(Arc::new(keys)))
    }
}

/// Configuration for the storage backend.
#[derive(Deserialize)]
struct DbConfig {
    // secrets
    db_uri: String,
    #[serde(default = "default_db_name")]
    db_name: String,
}

fn default_db_name() -> String {
    "evote".to_string()
}

/// A fairing that connects the storage backend, performs any setup necessary,
/// and places an `Arc<dyn Store>` into managed state.
/// This fairing must be attached after [`KeyStoreFairing`].
pub struct StoreFairing;

#[rocket::async_trait]
impl Fairing for StoreFairing {
    fn info(&self) -> Info {
        Info {
            name: "Store",
            kind: Kind::Ignite,
        }
    }

    async fn on_ignite(&self, rocket: Rocket<Build>) -> rocket::fairing::Result {
        // Load the config.
        let db_config = match rocket.figment().extract::<DbConfig>() {
            Ok(config) => config,
            Err(e) => {
                error!("Failed to load database config");
                rocket::config::pretty_print_error(e);
                return Err(rocket);
            }
        };
        let (config, keys) = match (rocket.state::<Config>(), rocket.state::<Arc<KeyStore>>()) {
            (Some(config), Some(keys)) => (config.clone(), keys.clone()),
            _ => {
                error!("Config and keys must be loaded before the store");
                return Err(rocket);
            }
        };

        // Construct the connection.
        let store: Arc<dyn Store> = if db_config.db_uri == MEMORY_DB_URI {
            warn!("Using the in-memory store; nothing will be persisted");
            Arc::new(MemoryStore::new())
        } else {
            info!("Loaded database config, connecting...");
            match MongoStore::connect(&db_config.db_uri, &db_config.db_name).await {
                Ok(store) => Arc::new(store),
                Err(e) => {
                    error!("Failed to connect to database: {e}");
                    return Err(rocket);
                }
            }
        };

        // Ensure there is at least one admin user and the configuration record is current.
        if let Err(e) = ensure_admin_exists(store.as_ref(), &config).await {
            error!("Failed to create default admin: {e}");
            return Err(rocket);
        }
        if let Err(e) = record_public_params(store.as_ref(), &keys).await {
            error!("Failed to record system configuration: {e}");
            return Err(rocket);
        }
        info!("...store online!");

        Ok(rocket.manage(store))
    }
}

/// Create the default admin if no admins exist.
pub async fn ensure_admin_exists(store: &dyn Store, config: &Config) -> Result<()> {
    if !store.list_admins().await?.is_empty() {
        return Ok(());
    }
    let admin = Admin::try_from(config.default_admin())?;
    info!("No admins found, creating default admin {}", admin.username);
    match store.insert_admin(&admin).await {
        Err(e) if e.code() == Code::AlreadyExists => Ok(()),
        other => other,
    }
}

/// Store the active public parameters as the system configuration record.
pub async fn record_public_params(store: &dyn Store, keys: &KeyStore) -> Result<()> {
    let params = PublicParams::from_keys(keys);
    match store.get_system_config().await? {
        Some(previous) if previous == params => return Ok(()),
        Some(_) => warn!("Key store differs from the recorded configuration; elections bound to old keys cannot open"),
        None => {}
    }
    store.put_system_config(&params).await
}


#[cfg(test)]
mod tests {
    use super::*;

    #[rocket::async_test]
    async fn default_admin_created_once() {
        let store = MemoryStore::new();
        let config = Config::example();
        ensure_admin_exists(&store, &config).await.unwrap();
        ensure_admin_exists(&store, &config).await.unwrap();
        let admins = store.list_admins().await.unwrap();
        assert_eq!(admins.len(), 1);
        assert!(admins[0].verify_password("test-admin-password"));
    }

    #[rocket::async_test]
    async fn public_params_recorded() {
        let store = MemoryStore::new();
        let keys = KeyStore::example();
        record_public_params(&store, &keys).await.unwrap();
        assert_eq!(
            store.get_system_config().await.unwrap(),
            Some(PublicParams::from_keys(&keys))
        );
    }

    #[test]
    fn durations() {
        let config = Config::example();
        assert_eq!(config.ovt_ttl(), Duration::minutes(5));
        assert_eq!(config.submission_deadline(), std::time::Duration::from_secs(10));
        assert!(config.matcher_settings().liveness_required);
    }
}
