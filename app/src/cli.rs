use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "chatline", version, about = "Chat with the Chatline backend from a terminal")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
    /// Override the configured backend base URL.
    #[arg(long, global = true)]
    pub base_url: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Sign in and remember the session.
    Login {
        #[arg(long)]
        email: String,
        #[arg(long, env = "CHATLINE_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Ask the backend to mail a registration code.
    RegisterCode {
        #[arg(long)]
        email: String,
    },
    Register {
        #[arg(long)]
        nickname: String,
        #[arg(long)]
        email: String,
        #[arg(long, env = "CHATLINE_PASSWORD", hide_env_values = true)]
        password: String,
        #[arg(long)]
        code: String,
    },
    /// Forget the stored session.
    Logout,
    /// List, rename or delete conversations.
    Conversations {
        #[command(subcommand)]
        action: Option<ConversationAction>,
    },
    /// Print the messages of a conversation.
    History { conversation: String },
    /// List the models the backend offers.
    Models,
    /// Send a message; the reply streams unless --no-stream is given.
    Send {
        text: String,
        #[arg(long)]
        conversation: Option<String>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        no_stream: bool,
        #[arg(long)]
        deep_think: bool,
    },
    /// Upload a file into a conversation.
    Upload {
        path: PathBuf,
        #[arg(long)]
        conversation: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConversationAction {
    List,
    Rename { id: String, title: String },
    Delete {
        #[arg(required = true)]
        ids: Vec<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_send_flags() {
        let cli = Cli::parse_from([
            "chatline",
            "send",
            "hello",
            "--model",
            "gpt-4o",
            "--deep-think",
            "--no-stream",
        ]);
        match cli.command {
            Command::Send {
                text,
                model,
                no_stream,
                deep_think,
                conversation,
            } => {
                assert_eq!(text, "hello");
                assert_eq!(model.as_deref(), Some("gpt-4o"));
                assert!(no_stream && deep_think);
                assert!(conversation.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn conversation_delete_needs_ids() {
        assert!(Cli::try_parse_from(["chatline", "conversations", "delete"]).is_err());
        let cli = Cli::try_parse_from(["chatline", "conversations", "delete", "a", "b"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Conversations {
                action: Some(ConversationAction::Delete { ref ids })
            } if ids.len() == 2
        ));
    }
}
