pub mod cli;
pub mod commands;

pub use cli::{Cli, Command, ConversationAction};
pub use commands::{run, Client};
