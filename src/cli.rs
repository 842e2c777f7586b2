use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "antigravity-context-monitor",
    version,
    about = "Show live context-window usage of Antigravity conversations"
)]
pub struct Cli {
    /// Workspace folder path or `file://` URI to monitor.
    #[arg(long, global = true, value_name = "PATH|URI")]
    pub workspace: Option<String>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print one line per state change without taking over the terminal.
    Watch,
    /// Run a single poll cycle and print the result.
    Status {
        /// Emit machine-readable JSON.
        #[arg(long)]
        json: bool,
    },
    /// Check discovery prerequisites and probe the language server.
    Doctor,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workspace_is_accepted_after_the_subcommand() {
        let cli = Cli::try_parse_from([
            "antigravity-context-monitor",
            "status",
            "--json",
            "--workspace",
            "/tmp/ws",
        ])
        .expect("parse");
        assert_eq!(cli.workspace.as_deref(), Some("/tmp/ws"));
        assert!(matches!(cli.command, Some(Commands::Status { json: true })));
    }

    #[test]
    fn no_subcommand_means_dashboard() {
        let cli = Cli::try_parse_from(["antigravity-context-monitor"]).expect("parse");
        assert!(cli.command.is_none());
        assert!(cli.workspace.is_none());
    }
}
