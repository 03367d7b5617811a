//! The core services. Each one holds a [`Context`] with everything it needs;
//! nothing is reached through globals.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{error, info};
use rocket::{
    fairing::{Fairing, Info, Kind},
    tokio::task::JoinError,
    Build, Orbit, Rocket,
};

use crate::{
    biometric::{BiometricMatcher, FaceAnalyzer},
    clock::Clock,
    config::Config,
    crypto::KeyStore,
    error::{Error, Result},
    model::{
        audit::AuditEventType,
        election::{Election, ElectionId},
    },
    store::Store,
};

pub mod audit;
pub mod closer;
pub mod ingest;
pub mod ledger;
pub mod lifecycle;
pub mod locks;
pub mod ovt;
pub mod registry;
pub mod tally;

pub use self::audit::AuditLog;
pub use self::closer::{ElectionClosers, ElectionClosersFairing};
pub use self::ingest::BallotIngestor;
pub use self::ledger::Ledger;
pub use self::lifecycle::LifecycleController;
pub use self::locks::KeyedLocks;
pub use self::ovt::OvtService;
pub use self::registry::VoterRegistry;
pub use self::tally::TallyEngine;

/// Actor recorded for actions the server takes on its own.
pub const SYSTEM_ACTOR: &str = "system";

/// Process-wide dependencies shared by every service.
#[derive(Clone)]
pub struct Context {
    pub store: Arc<dyn Store>,
    pub keys: Arc<KeyStore>,
    pub clock: Arc<dyn Clock>,
    pub config: Arc<Config>,
}

impl Context {
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Get an election or fail with `NOT_FOUND`.
    pub async fn election(&self, election_id: ElectionId) -> Result<Election> {
        self.store
            .get_election(election_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("Election {election_id}")))
    }
}

/// All core services, wired together. Cheap to clone.
#[derive(Clone)]
pub struct Services {
    pub audit: AuditLog,
    pub registry: VoterRegistry,
    pub ovts: OvtService,
    pub ledger: Ledger,
    pub ingestor: BallotIngestor,
    pub tally: TallyEngine,
    pub lifecycle: LifecycleController,
    ctx: Context,
}

impl Services {
    pub fn new(ctx: Context, analyzer: Arc<dyn FaceAnalyzer>) -> Self {
        let voter_locks = Arc::new(KeyedLocks::new());
        let election_locks = Arc::new(KeyedLocks::new());

        let audit = AuditLog::new(ctx.clone());
        let matcher = Arc::new(BiometricMatcher::new(analyzer, ctx.config.matcher_settings()));
        let registry = VoterRegistry::new(ctx.clone(), audit.clone(), matcher, voter_locks.clone());
        let ovts = OvtService::new(ctx.clone(), audit.clone(), voter_locks);
        let ledger = Ledger::new(ctx.clone(), audit.clone());
        let ingestor = BallotIngestor::new(ctx.clone(), audit.clone(), ovts.clone(), ledger.clone());
        let tally = TallyEngine::new(ctx.clone(), audit.clone(), ledger.clone(), election_locks.clone());
        let lifecycle = LifecycleController::new(ctx.clone(), audit.clone(), ledger.clone(), election_locks);

        Self {
            audit,
            registry,
            ovts,
            ledger,
            ingestor,
            tally,
            lifecycle,
            ctx,
        }
    }

    pub fn store(&self) -> &dyn Store {
        self.ctx.store.as_ref()
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }
}

/// Refuse further submissions on an election until an administrator resumes it.
pub(crate) async fn suspend(ctx: &Context, audit: &AuditLog, election_id: ElectionId, reason: &str) {
    error!("Suspending election {election_id}: {reason}");
    if let Err(e) = ctx.store.set_suspended(election_id, Some(reason.to_string())).await {
        error!("Failed to record suspension of election {election_id}: {e}");
    }
    audit
        .record(audit.event(
            AuditEventType::ElectionSuspended,
            SYSTEM_ACTOR,
            format!("election:{election_id}"),
            reason,
        ))
        .await;
}

/// A panicked or cancelled worker is a server fault.
pub(crate) fn join_error(err: JoinError) -> Error {
    Error::Fatal(format!("Worker task failed: {err}"))
}

/// A fairing that builds the core services from the config, key store and
/// store already in managed state, and places [`Services`] into managed state.
/// On shutdown it waits for in-flight ledger appends to finish.
pub struct ServicesFairing {
    clock: Arc<dyn Clock>,
    analyzer: Arc<dyn FaceAnalyzer>,
}

impl ServicesFairing {
    pub fn new(clock: Arc<dyn Clock>, analyzer: Arc<dyn FaceAnalyzer>) -> Self {
        Self { clock, analyzer }
    }
}

#[rocket::async_trait]
impl Fairing for ServicesFairing {
    fn info(&self) -> Info {
        Info {
            name: "Services",
            kind: Kind::Ignite | Kind::Shutdown,
        }
    }

    async fn on_ignite(&self, rocket: Rocket<Build>) -> rocket::fairing::Result {
        let ctx = match (
            rocket.state::<Config>(),
            rocket.state::<Arc<KeyStore>>(),
            rocket.state::<Arc<dyn Store>>(),
        ) {
            (Some(config), Some(keys), Some(store)) => Context {
                store: store.clone(),
                keys: keys.clone(),
                clock: self.clock.clone(),
                config: Arc::new(config.clone()),
            },
            _ => {
                error!("Config, keys and store must be available before the services");
                return Err(rocket);
            }
        };
        info!("Core services ready");
        Ok(rocket.manage(Services::new(ctx, self.analyzer.clone())))
    }

    async fn on_shutdown(&self, rocket: &Rocket<Orbit>) {
        if let Some(services) = rocket.state::<Services>() {
            services.ledger.drain().await;
            info!("Ledger writers flushed");
        }
    }
}

/// Services over the in-memory store, fixed keys and a manual clock.
#[cfg(test)]
pub(crate) mod examples {
    use crate::{
        biometric::{examples::face_a, Capture, JpegAnalyzer},
        clock::ManualClock,
        model::{
            election::ElectionSpec,
            token::IssuedOvt,
            voter::{Voter, VoterId},
        },
        store::MemoryStore,
    };

    use super::*;

    pub struct Harness {
        pub services: Services,
        pub clock: ManualClock,
        pub memory: Arc<MemoryStore>,
    }

    impl Harness {
        pub fn new() -> Self {
            Self::with_config(Config::example())
        }

        pub fn with_config(config: Config) -> Self {
            Self::with_parts(config, KeyStore::example())
        }

        pub fn with_parts(config: Config, keys: KeyStore) -> Self {
            let clock = ManualClock::default();
            let memory = Arc::new(MemoryStore::new());
            let ctx = Context {
                store: memory.clone(),
                keys: Arc::new(keys),
                clock: Arc::new(clock.clone()),
                config: Arc::new(config),
            };
            Self {
                services: Services::new(ctx, Arc::new(JpegAnalyzer)),
                clock,
                memory,
            }
        }

        pub fn store(&self) -> &dyn Store {
            self.services.store()
        }

        /// Create and open an election with the two example candidates.
        pub async fn open_election(&self) -> Election {
            let spec = ElectionSpec::example(self.clock.now());
            let election = self.services.lifecycle.create(spec, "admin:test").await.unwrap();
            self.services
                .lifecycle
                .open(election.election_id, "admin:test")
                .await
                .unwrap()
        }

        /// Enrol and approve a voter, bypassing the capture pipeline.
        pub async fn approved_voter(&self, voter_id: &str) -> VoterId {
            self.store().insert_voter(&Voter::approved(voter_id)).await.unwrap();
            voter_id.to_string()
        }

        /// Enrol a voter with the example face through the registry.
        pub async fn enrolled_voter(&self, voter_id: &str) -> Voter {
            self.services
                .registry
                .enroll(voter_id, "Vera Voter", "vera@example.com", Capture::new(face_a(), vec![]), "admin:test")
                .await
                .unwrap()
        }

        pub async fn issue(&self, voter_id: &str, election_id: ElectionId) -> IssuedOvt {
            self.services.ovts.issue(voter_id, election_id).await.unwrap().into()
        }
    }
}
