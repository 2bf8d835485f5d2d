pub mod api;
pub mod cli;
pub mod engine;
pub mod ledger;
pub mod lifecycle;
pub mod probe;
pub mod storage;
