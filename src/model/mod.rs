//! Data types shared by the services, the store and the API.

pub mod admin;
pub mod audit;
pub mod auth;
pub mod ballot;
pub mod block;
pub mod dump;
pub mod election;
pub mod tally;
pub mod token;
pub mod voter;
