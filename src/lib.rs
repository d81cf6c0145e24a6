pub mod app;
pub mod config;
pub mod context;
pub mod crm;
pub mod email;
pub mod error;
pub mod leads;
pub mod ledger;
pub mod model;
pub mod preview;
pub mod prompting;
pub mod queue;
pub mod retrieval;
pub mod router;
pub mod store;
pub mod tools;
pub mod types;
pub mod visitor;

#[cfg(test)]
mod testing;
