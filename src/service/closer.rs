use std::collections::HashMap;
use std::sync::Arc;

use chrono::Duration;
use log::{debug, error, info, trace, warn};
use rocket::{
    fairing::{Fairing, Info, Kind},
    futures::future::{BoxFuture, FutureExt},
    tokio::sync::Mutex,
    Build, Rocket,
};

use crate::{
    error::{Code, Error, Result},
    model::election::{Election, ElectionId},
    scheduled_task::ScheduledTask,
};

use super::{Services, SYSTEM_ACTOR};

/// Delay before a failed scheduled close is attempted again.
const RETRY_INTERVAL_SECONDS: i64 = 300;

type TaskMap = HashMap<ElectionId, ScheduledTask<Result<()>>>;

/// Scheduled tasks that close each OPEN election at its end time.
pub struct ElectionClosers {
    tasks: Arc<Mutex<TaskMap>>,
}

impl ElectionClosers {
    pub fn new() -> Self {
        Self {
            tasks: Default::default(),
        }
    }

    pub async fn is_scheduled(&self, election_id: ElectionId) -> bool {
        self.tasks.lock().await.contains_key(&election_id)
    }

    /// Schedule closing for every OPEN election.
    pub async fn schedule_open(&self, services: &Services) -> Result<usize> {
        let elections = services.lifecycle.open_elections().await?;
        for election in &elections {
            self.schedule(services, election).await;
        }
        Ok(elections.len())
    }

    /// Schedule `election` to close at its end time, replacing any existing task.
    pub async fn schedule(&self, services: &Services, election: &Election) {
        let closer = Self::closer(election.election_id, services.clone(), self.tasks.clone());
        let mut tasks = self.tasks.lock().await;
        if let Some(task) = tasks.remove(&election.election_id) {
            if task.cancel().await {
                warn!("Closer for election {} had already run", election.election_id);
            }
        }
        let task = ScheduledTask::new(closer, election.end_time, services.context().now());
        tasks.insert(election.election_id, task);
        debug!("Election {} will close at {}", election.election_id, election.end_time);
    }

    /// Drop the scheduled close of an election, if there is one.
    pub async fn cancel(&self, election_id: ElectionId) {
        let task = self.tasks.lock().await.remove(&election_id);
        if let Some(task) = task {
            task.cancel().await;
            trace!("Cancelled closer for election {election_id}");
        }
    }

    /// Run the scheduled close of an election now and wait for it.
    pub async fn close_now(&self, election_id: ElectionId) -> Result<()> {
        let task = self.tasks.lock().await.remove(&election_id);
        match task {
            Some(closer) => {
                closer.trigger_now();
                closer
                    .await
                    .unwrap_or_else(|e| Err(Error::Fatal(format!("Closer for election {election_id} failed: {e}"))))
            }
            None => Ok(()),
        }
    }

    /// Close the election, retrying later on failure. Recursive, hence boxed.
    fn closer(election_id: ElectionId, services: Services, tasks: Arc<Mutex<TaskMap>>) -> BoxFuture<'static, Result<()>> {
        async move {
            let result = match services.lifecycle.close(election_id, SYSTEM_ACTOR).await {
                Ok(_) => {
                    info!("Election {election_id} closed at its end time");
                    Ok(())
                }
                Err(e) if matches!(e.code(), Code::IllegalTransition | Code::NotFound) => {
                    debug!("Election {election_id} no longer needs closing: {e}");
                    Ok(())
                }
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => {
                    tasks.lock().await.remove(&election_id);
                }
                Err(ref e) => {
                    error!("Failed to close election {election_id}: {e}");
                    let retry = Self::closer(election_id, services.clone(), tasks.clone());
                    let now = services.context().now();
                    let task = ScheduledTask::new(retry, now + Duration::seconds(RETRY_INTERVAL_SECONDS), now);
                    tasks.lock().await.insert(election_id, task);
                    warn!("Closing election {election_id} will be retried in {RETRY_INTERVAL_SECONDS} seconds");
                }
            }
            result
        }
        .boxed()
    }
}

impl Default for ElectionClosers {
    fn default() -> Self {
        Self::new()
    }
}

/// A fairing that schedules closing for every OPEN election during ignition
/// and places [`ElectionClosers`] into managed state. Must be attached after
/// the services fairing.
pub struct ElectionClosersFairing;

#[rocket::async_trait]
impl Fairing for ElectionClosersFairing {
    fn info(&self) -> Info {
        Info {
            name: "Election Closers",
            kind: Kind::Ignite,
        }
    }

    async fn on_ignite(&self, rocket: Rocket<Build>) -> rocket::fairing::Result {
        let closers = ElectionClosers::new();
        let services = match rocket.state::<Services>() {
            Some(services) => services,
            None => {
                error!("Services were not available when scheduling election closers");
                return Err(rocket);
            }
        };
        match closers.schedule_open(services).await {
            Ok(count) => info!("Scheduled closing of {count} open elections"),
            Err(e) => {
                error!("Failed to schedule election closers: {e}");
                return Err(rocket);
            }
        }
        Ok(rocket.manage(closers))
    }
}

#[cfg(test)]
mod tests {
    use crate::{model::election::ElectionState, service::examples::Harness};

    use super::*;

    #[rocket::async_test]
    async fn close_now_closes_open_election() {
        let harness = Harness::new();
        let election = harness.open_election().await;
        let closers = ElectionClosers::new();
        assert_eq!(closers.schedule_open(&harness.services).await.unwrap(), 1);
        assert!(closers.is_scheduled(election.election_id).await);

        closers.close_now(election.election_id).await.unwrap();
        assert!(!closers.is_scheduled(election.election_id).await);
        let election = harness.services.lifecycle.get(election.election_id).await.unwrap();
        assert_eq!(election.state, ElectionState::Closed);
    }

    #[rocket::async_test]
    async fn past_end_time_closes_immediately() {
        let harness = Harness::new();
        let election = harness.open_election().await;
        harness.clock.advance(Duration::days(2));
        let closers = ElectionClosers::new();
        closers.schedule(&harness.services, &election).await;

        let mut state = ElectionState::Open;
        for _ in 0..200 {
            state = harness.services.lifecycle.get(election.election_id).await.unwrap().state;
            if state == ElectionState::Closed {
                break;
            }
            rocket::tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(state, ElectionState::Closed);
    }

    #[rocket::async_test]
    async fn already_closed_election_is_left_alone() {
        let harness = Harness::new();
        let election = harness.open_election().await;
        let closers = ElectionClosers::new();
        closers.schedule(&harness.services, &election).await;
        harness
            .services
            .lifecycle
            .close(election.election_id, "admin:test")
            .await
            .unwrap();

        closers.close_now(election.election_id).await.unwrap();
        closers.cancel(election.election_id).await;
        assert!(!closers.is_scheduled(election.election_id).await);
    }
}
