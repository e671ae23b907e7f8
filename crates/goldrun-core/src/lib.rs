pub mod config;
pub mod domain;
pub mod numerics;
pub mod orchestrator;
pub mod parser;
pub mod scenarios;
pub mod template;
pub mod workdir;
