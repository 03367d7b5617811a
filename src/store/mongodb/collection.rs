use std::ops::Deref;

use log::debug;
use mongodb::{bson::doc, error::Error as DbError, options::IndexOptions, Collection, Database, IndexModel};
use serde::{Deserialize, Serialize};

use crate::model::{
    admin::Admin,
    audit::AuditEvent,
    ballot::Ballot,
    block::Block,
    election::{Election, PublicParams},
    tally::Tally,
    token::{Ovt, TokenState},
    voter::Voter,
};

use super::counter::Counter;

/// A type that can be directly inserted/read to/from the database.
pub trait MongoCollection {
    /// The name of the collection.
    const NAME: &'static str;
}

/// A database collection of the given type.
pub struct Coll<T>(Collection<T>);

impl<T> Coll<T>
where
    T: MongoCollection,
{
    /// Get a handle on this collection in the given database.
    pub fn from_db(db: &Database) -> Self {
        Self(db.collection(T::NAME))
    }
}

// `Derive(Clone)` would only derive if `T: Clone`, but we don't need that bound.
impl<T> Clone for Coll<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> Deref for Coll<T> {
    type Target = Collection<T>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// The single system configuration record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    #[serde(rename = "_id")]
    pub id: String,
    pub params: PublicParams,
}

pub const SYSTEM_CONFIG_ID: &str = "system";

impl MongoCollection for Election {
    const NAME: &'static str = "elections";
}

impl MongoCollection for Voter {
    const NAME: &'static str = "voters";
}

impl MongoCollection for Ovt {
    const NAME: &'static str = "tokens";
}

impl MongoCollection for Ballot {
    const NAME: &'static str = "ballots";
}

impl MongoCollection for Block {
    const NAME: &'static str = "blocks";
}

impl MongoCollection for Tally {
    const NAME: &'static str = "tallies";
}

impl MongoCollection for AuditEvent {
    const NAME: &'static str = "audit";
}

impl MongoCollection for Admin {
    const NAME: &'static str = "admins";
}

impl MongoCollection for Counter {
    const NAME: &'static str = "counters";
}

impl MongoCollection for SystemConfig {
    const NAME: &'static str = "config";
}

/// Ensure that all the required indexes exist on the given database.
///
/// This operation is idempotent.
pub async fn ensure_indexes_exist(db: &Database) -> Result<(), DbError> {
    debug!("Ensuring collection indexes exist");

    let unique = IndexOptions::builder().unique(true).build();
    let unique_index = |keys| IndexModel::builder().keys(keys).options(unique.clone()).build();

    Coll::<Election>::from_db(db)
        .create_index(unique_index(doc! {"election_id": 1}), None)
        .await?;
    Coll::<Voter>::from_db(db)
        .create_index(unique_index(doc! {"voter_id": 1}), None)
        .await?;
    Coll::<Admin>::from_db(db)
        .create_index(unique_index(doc! {"username": 1}), None)
        .await?;
    Coll::<Ballot>::from_db(db)
        .create_index(unique_index(doc! {"token_id": 1}), None)
        .await?;
    Coll::<Block>::from_db(db)
        .create_index(unique_index(doc! {"election_id": 1, "index": 1}), None)
        .await?;
    Coll::<Tally>::from_db(db)
        .create_index(unique_index(doc! {"bundle.election_id": 1}), None)
        .await?;

    // Tokens: unique IDs, and at most one issued token per voter and election.
    let tokens = Coll::<Ovt>::from_db(db);
    tokens
        .create_index(unique_index(doc! {"token_id": 1}), None)
        .await?;
    let one_issued = IndexModel::builder()
        .keys(doc! {"voter_id": 1, "election_id": 1})
        .options(
            IndexOptions::builder()
                .unique(true)
                .partial_filter_expression(doc! {"state": TokenState::Issued})
                .build(),
        )
        .build();
    tokens.create_index(one_issued, None).await?;

    Coll::<AuditEvent>::from_db(db)
        .create_index(IndexModel::builder().keys(doc! {"ts": -1}).build(), None)
        .await?;

    Ok(())
}
