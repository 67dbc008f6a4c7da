pub mod command;
pub mod config;
pub mod parser;
pub mod types;

pub use command::{CommandBuilder, CommandTemplate, RunCommand, RunRequest, RunScope};
pub use config::Config;
pub use types::*;
