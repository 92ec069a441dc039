pub mod agent;
pub mod configuration;
pub mod controller;
pub mod errors;
pub mod history;
pub mod mcp;
pub mod models;
pub mod prompt_template;
pub mod providers;
pub mod runner;
pub mod systems;
