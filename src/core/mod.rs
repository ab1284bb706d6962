pub mod agent;
pub mod answer;
pub mod config;
pub mod db;
pub mod error;
pub mod llm;
pub mod protocol;
pub mod safety;
pub mod schema;
pub mod terminal;
pub mod trace;
