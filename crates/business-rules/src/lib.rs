pub mod arbiter;
pub mod cache;
pub mod clauses;
pub mod config;
pub mod error;
pub mod index;
pub mod lexical;
pub mod model;
pub mod parser;
pub mod retrieval;
pub mod schema;
pub mod semantic;
pub mod server;
pub mod sql_engine;
pub mod store;
pub mod submission;
pub mod verifier;

#[cfg(test)]
mod testing;
