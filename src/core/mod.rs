pub mod coordinator;
pub mod errors;
pub mod events;
pub mod findings;
pub mod health;
pub mod models;
pub mod normalizer;
pub mod policy;
pub mod scheduler;
pub mod scope;
pub mod state;
pub mod store;
