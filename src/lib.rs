pub mod api;
pub mod click_ledger;
pub mod code_gen;
pub mod config;
pub mod geo;
pub mod link_repo;
pub mod model;
pub mod orm;
pub mod redirect;
pub mod registry;
pub mod server;
pub mod url_validator;
pub mod user_agent;
