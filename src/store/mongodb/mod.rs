//! MongoDB storage. Submission commits and election deletion run in
//! multi-document transactions, so the server must be a replica set.

use log::{info, warn};
use mongodb::{
    bson::{doc, to_bson, Bson, Document},
    options::{FindOneOptions, FindOptions, ReplaceOptions},
    Client, ClientSession, Database,
};
use rocket::futures::TryStreamExt;
use serde::Serialize;

use crate::{
    error::{Error, Result},
    model::{
        admin::Admin,
        audit::{AuditEvent, AuditFilter},
        ballot::Ballot,
        block::Block,
        election::{Election, ElectionId, ElectionState, PublicParams},
        tally::Tally,
        token::{Ovt, TokenId, TokenState},
        voter::{BiometricTemplate, EnrollmentState, Voter},
    },
};

use super::{fail, Store, Submission};

mod collection;
mod counter;
mod errors;

pub use collection::{ensure_indexes_exist, Coll, MongoCollection, SystemConfig, SYSTEM_CONFIG_ID};
pub use counter::{ensure_election_id_counter_exists, Counter, ELECTION_ID_COUNTER_ID};
pub use errors::{is_duplicate_key, DUPLICATE_KEY};

pub struct MongoStore {
    client: Client,
    db: Database,
}

impl MongoStore {
    /// Connect, and make sure indexes and counters exist.
    pub async fn connect(uri: &str, database: &str) -> Result<Self> {
        let client = Client::with_uri_str(uri).await?;
        let db = client.database(database);
        ensure_indexes_exist(&db).await?;
        ensure_election_id_counter_exists(&Coll::from_db(&db)).await?;
        info!("Using database {database}");
        Ok(Self { client, db })
    }

    fn coll<T: MongoCollection>(&self) -> Coll<T> {
        Coll::from_db(&self.db)
    }

    async fn start_transaction(&self) -> Result<ClientSession> {
        let mut session = self.client.start_session(None).await?;
        session.start_transaction(None).await?;
        Ok(session)
    }

    async fn commit_in(&self, submission: &Submission, session: &mut ClientSession) -> Result<()> {
        let Submission {
            token_id,
            voter_id,
            election_id,
            ballot,
            block,
            now,
        } = submission;

        // Consume the token.
        let filter = doc! {
            "token_id": token_id.as_str(),
            "state": TokenState::Issued,
            "expires_at": { "$gt": now.timestamp_millis() },
        };
        let update = doc! {"$set": {"state": TokenState::Consumed}};
        let consumed = self
            .coll::<Ovt>()
            .update_one_with_session(filter, update, None, session)
            .await?;
        if consumed.matched_count == 0 {
            return Err(fail::token_unusable());
        }

        // Mark the voter as voted.
        let filter = doc! {
            "voter_id": voter_id.as_str(),
            "has_voted_for": { "$ne": *election_id },
        };
        let update = doc! {"$addToSet": {"has_voted_for": *election_id}};
        let marked = self
            .coll::<Voter>()
            .update_one_with_session(filter, update, None, session)
            .await?;
        if marked.matched_count == 0 {
            return Err(fail::already_voted(voter_id, *election_id));
        }

        // Store the ballot and its block.
        if let Err(e) = self
            .coll::<Ballot>()
            .insert_one_with_session(ballot, None, session)
            .await
        {
            return Err(if is_duplicate_key(&e) {
                fail::token_unusable()
            } else {
                e.into()
            });
        }
        if let Err(e) = self
            .coll::<Block>()
            .insert_one_with_session(block, None, session)
            .await
        {
            return Err(if is_duplicate_key(&e) {
                fail::block_taken(*election_id, block.index)
            } else {
                e.into()
            });
        }
        Ok(())
    }

    async fn delete_in(&self, election_id: ElectionId, session: &mut ClientSession) -> Result<bool> {
        let filter = doc! {"election_id": election_id};
        let deleted = self
            .coll::<Election>()
            .delete_one_with_session(filter.clone(), None, session)
            .await?;
        if deleted.deleted_count == 0 {
            return Ok(false);
        }
        self.coll::<Ovt>()
            .delete_many_with_session(filter.clone(), None, session)
            .await?;
        self.coll::<Ballot>()
            .delete_many_with_session(filter.clone(), None, session)
            .await?;
        self.coll::<Block>()
            .delete_many_with_session(filter, None, session)
            .await?;
        self.coll::<Tally>()
            .delete_many_with_session(doc! {"bundle.election_id": election_id}, None, session)
            .await?;
        Ok(true)
    }

    async fn publish_in(&self, tally: &Tally, session: &mut ClientSession) -> Result<bool> {
        let filter = doc! {"election_id": tally.election_id(), "state": ElectionState::Closed};
        let update = doc! {"$set": {"state": ElectionState::Tallied}};
        let result = self
            .coll::<Election>()
            .update_one_with_session(filter, update, None, session)
            .await?;
        if result.matched_count == 0 {
            return Ok(false);
        }
        self.coll::<Tally>()
            .insert_one_with_session(tally, None, session)
            .await?;
        Ok(true)
    }
}

/// Commit on success, abort on failure.
async fn finish_transaction<T>(mut session: ClientSession, result: Result<T>) -> Result<T> {
    match result {
        Ok(value) => {
            session.commit_transaction().await?;
            Ok(value)
        }
        Err(e) => {
            if let Err(abort) = session.abort_transaction().await {
                warn!("Failed to abort transaction: {abort}");
            }
            Err(e)
        }
    }
}

/// Serialize a value for use inside an update document.
fn bson<T: Serialize>(value: &T) -> Result<Bson> {
    to_bson(value).map_err(|e| Error::Fatal(format!("Failed to serialize to BSON: {e}")))
}

#[rocket::async_trait]
impl Store for MongoStore {
    async fn next_election_id(&self) -> Result<ElectionId> {
        Counter::next(&self.coll(), ELECTION_ID_COUNTER_ID).await
    }

    async fn insert_election(&self, election: &Election) -> Result<()> {
        self.coll::<Election>().insert_one(election, None).await?;
        Ok(())
    }

    async fn get_election(&self, election_id: ElectionId) -> Result<Option<Election>> {
        let filter = doc! {"election_id": election_id};
        Ok(self.coll::<Election>().find_one(filter, None).await?)
    }

    async fn list_elections(&self) -> Result<Vec<Election>> {
        let options = FindOptions::builder().sort(doc! {"election_id": 1}).build();
        let elections = self.coll::<Election>().find(None, options).await?.try_collect().await?;
        Ok(elections)
    }

    async fn elections_in_state(&self, state: ElectionState) -> Result<Vec<Election>> {
        let filter = doc! {"state": state};
        let options = FindOptions::builder().sort(doc! {"election_id": 1}).build();
        let elections = self.coll::<Election>().find(filter, options).await?.try_collect().await?;
        Ok(elections)
    }

    async fn transition_election(
        &self,
        election_id: ElectionId,
        from: ElectionState,
        to: ElectionState,
    ) -> Result<bool> {
        let filter = doc! {"election_id": election_id, "state": from};
        let update = doc! {"$set": {"state": to}};
        let result = self.coll::<Election>().update_one(filter, update, None).await?;
        Ok(result.matched_count == 1)
    }

    async fn set_suspended(&self, election_id: ElectionId, reason: Option<String>) -> Result<bool> {
        let filter = doc! {"election_id": election_id};
        let update = doc! {"$set": {"suspended": reason}};
        let result = self.coll::<Election>().update_one(filter, update, None).await?;
        Ok(result.matched_count == 1)
    }

    async fn delete_election(&self, election_id: ElectionId) -> Result<bool> {
        let mut session = self.start_transaction().await?;
        let result = self.delete_in(election_id, &mut session).await;
        finish_transaction(session, result).await
    }

    async fn insert_voter(&self, voter: &Voter) -> Result<()> {
        match self.coll::<Voter>().insert_one(voter, None).await {
            Ok(_) => Ok(()),
            Err(e) if is_duplicate_key(&e) => Err(fail::voter_exists(&voter.voter_id)),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_voter(&self, voter_id: &str) -> Result<Option<Voter>> {
        Ok(self.coll::<Voter>().find_one(doc! {"voter_id": voter_id}, None).await?)
    }

    async fn set_voter_state(&self, voter_id: &str, state: EnrollmentState) -> Result<bool> {
        let filter = doc! {"voter_id": voter_id, "erased": false};
        let update = doc! {"$set": {"state": state}};
        let result = self.coll::<Voter>().update_one(filter, update, None).await?;
        Ok(result.matched_count == 1)
    }

    async fn replace_template(&self, voter_id: &str, template: &BiometricTemplate) -> Result<bool> {
        let filter = doc! {"voter_id": voter_id, "erased": false};
        let update = doc! {"$set": {"template": bson(template)?}};
        let result = self.coll::<Voter>().update_one(filter, update, None).await?;
        Ok(result.matched_count == 1)
    }

    async fn erase_voter(&self, voter_id: &str) -> Result<bool> {
        let update = doc! {
            "$set": {
                "name": "",
                "contact": "",
                "template": Bson::Null,
                "state": EnrollmentState::Blocked,
                "erased": true,
            }
        };
        let result = self
            .coll::<Voter>()
            .update_one(doc! {"voter_id": voter_id}, update, None)
            .await?;
        Ok(result.matched_count == 1)
    }

    async fn mark_voted(&self, voter_id: &str, election_id: ElectionId) -> Result<()> {
        let filter = doc! {"voter_id": voter_id, "has_voted_for": {"$ne": election_id}};
        let update = doc! {"$addToSet": {"has_voted_for": election_id}};
        let result = self.coll::<Voter>().update_one(filter, update, None).await?;
        if result.matched_count == 1 {
            return Ok(());
        }
        match self.get_voter(voter_id).await? {
            Some(_) => Err(fail::already_voted(voter_id, election_id)),
            None => Err(Error::not_found(format!("Voter {voter_id}"))),
        }
    }

    async fn insert_token(&self, token: &Ovt) -> Result<()> {
        match self.coll::<Ovt>().insert_one(token, None).await {
            Ok(_) => Ok(()),
            Err(e) if is_duplicate_key(&e) => Err(fail::ovt_outstanding(&token.voter_id, token.election_id)),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_token(&self, token_id: &str) -> Result<Option<Ovt>> {
        Ok(self.coll::<Ovt>().find_one(doc! {"token_id": token_id}, None).await?)
    }

    async fn set_token_state(&self, token_id: &str, from: TokenState, to: TokenState) -> Result<bool> {
        let filter = doc! {"token_id": token_id, "state": from};
        let update = doc! {"$set": {"state": to}};
        let result = self.coll::<Ovt>().update_one(filter, update, None).await?;
        Ok(result.matched_count == 1)
    }

    async fn issued_token_for(&self, voter_id: &str, election_id: ElectionId) -> Result<Option<Ovt>> {
        let filter = doc! {
            "voter_id": voter_id,
            "election_id": election_id,
            "state": TokenState::Issued,
        };
        Ok(self.coll::<Ovt>().find_one(filter, None).await?)
    }

    async fn revoke_tokens_for_voter(&self, voter_id: &str) -> Result<Vec<TokenId>> {
        let filter = doc! {"voter_id": voter_id, "state": TokenState::Issued};
        let issued: Vec<Ovt> = self.coll::<Ovt>().find(filter, None).await?.try_collect().await?;
        let mut revoked = Vec::new();
        for token in issued {
            if self
                .set_token_state(&token.token_id, TokenState::Issued, TokenState::Revoked)
                .await?
            {
                revoked.push(token.token_id);
            }
        }
        Ok(revoked)
    }

    async fn ballot_by_token(&self, token_id: &str) -> Result<Option<Ballot>> {
        Ok(self.coll::<Ballot>().find_one(doc! {"token_id": token_id}, None).await?)
    }

    async fn ballots_for_election(&self, election_id: ElectionId) -> Result<Vec<Ballot>> {
        let filter = doc! {"election_id": election_id};
        let options = FindOptions::builder().sort(doc! {"receipt.block_index": 1}).build();
        let ballots = self.coll::<Ballot>().find(filter, options).await?.try_collect().await?;
        Ok(ballots)
    }

    async fn blocks(&self, election_id: ElectionId, from: u64, limit: Option<usize>) -> Result<Vec<Block>> {
        let filter = doc! {
            "election_id": election_id,
            "index": { "$gte": i64::try_from(from).unwrap_or(i64::MAX) },
        };
        let options = FindOptions::builder()
            .sort(doc! {"index": 1})
            .limit(limit.map(|limit| i64::try_from(limit).unwrap_or(i64::MAX)))
            .build();
        let blocks = self.coll::<Block>().find(filter, options).await?.try_collect().await?;
        Ok(blocks)
    }

    async fn tail_block(&self, election_id: ElectionId) -> Result<Option<Block>> {
        let options = FindOneOptions::builder().sort(doc! {"index": -1}).build();
        let filter = doc! {"election_id": election_id};
        Ok(self.coll::<Block>().find_one(filter, options).await?)
    }

    async fn append_block(&self, block: &Block) -> Result<()> {
        match self.coll::<Block>().insert_one(block, None).await {
            Ok(_) => Ok(()),
            Err(e) if is_duplicate_key(&e) => Err(fail::block_taken(block.election_id, block.index)),
            Err(e) => Err(e.into()),
        }
    }

    async fn commit_submission(&self, submission: &Submission) -> Result<()> {
        let mut session = self.start_transaction().await?;
        let result = self.commit_in(submission, &mut session).await;
        finish_transaction(session, result).await
    }

    async fn publish_tally(&self, tally: &Tally) -> Result<bool> {
        let mut session = self.start_transaction().await?;
        let result = self.publish_in(tally, &mut session).await;
        finish_transaction(session, result).await
    }

    async fn get_tally(&self, election_id: ElectionId) -> Result<Option<Tally>> {
        let filter = doc! {"bundle.election_id": election_id};
        Ok(self.coll::<Tally>().find_one(filter, None).await?)
    }

    async fn append_audit(&self, event: &AuditEvent) -> Result<()> {
        self.coll::<AuditEvent>().insert_one(event, None).await?;
        Ok(())
    }

    async fn query_audit(&self, filter: &AuditFilter) -> Result<Vec<AuditEvent>> {
        let mut query = Document::new();
        if let Some(event_type) = filter.event_type {
            query.insert("event_type", event_type);
        }
        if let Some(subject) = &filter.subject {
            query.insert("subject", subject.as_str());
        }
        let options = FindOptions::builder()
            .sort(doc! {"ts": -1, "_id": -1})
            .limit(i64::try_from(filter.limit()).unwrap_or(i64::MAX))
            .build();
        let events = self.coll::<AuditEvent>().find(query, options).await?.try_collect().await?;
        Ok(events)
    }

    async fn get_admin(&self, username: &str) -> Result<Option<Admin>> {
        Ok(self.coll::<Admin>().find_one(doc! {"username": username}, None).await?)
    }

    async fn list_admins(&self) -> Result<Vec<Admin>> {
        let options = FindOptions::builder().sort(doc! {"username": 1}).build();
        let admins = self.coll::<Admin>().find(None, options).await?.try_collect().await?;
        Ok(admins)
    }

    async fn insert_admin(&self, admin: &Admin) -> Result<()> {
        match self.coll::<Admin>().insert_one(admin, None).await {
            Ok(_) => Ok(()),
            Err(e) if is_duplicate_key(&e) => Err(fail::admin_exists(&admin.username)),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_admin(&self, username: &str) -> Result<()> {
        let admins = self.coll::<Admin>();
        if admins.find_one(doc! {"username": username}, None).await?.is_none() {
            return Err(Error::not_found(format!("Admin {username}")));
        }
        // Prevent deleting the last admin.
        if admins.count_documents(None, None).await? == 1 {
            return Err(fail::last_admin());
        }
        admins.delete_one(doc! {"username": username}, None).await?;
        Ok(())
    }

    async fn get_system_config(&self) -> Result<Option<PublicParams>> {
        let config = self
            .coll::<SystemConfig>()
            .find_one(doc! {"_id": SYSTEM_CONFIG_ID}, None)
            .await?;
        Ok(config.map(|config| config.params))
    }

    async fn put_system_config(&self, params: &PublicParams) -> Result<()> {
        let record = SystemConfig {
            id: SYSTEM_CONFIG_ID.to_string(),
            params: params.clone(),
        };
        let options = ReplaceOptions::builder().upsert(true).build();
        self.coll::<SystemConfig>()
            .replace_one(doc! {"_id": SYSTEM_CONFIG_ID}, record, options)
            .await?;
        Ok(())
    }
}
