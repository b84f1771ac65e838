use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// tokend: per-identity token issuance and validation service
#[derive(Parser)]
#[command(name = "tokend", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP server (the default)
    Serve(ServeArgs),

    /// Operate on token records directly, without going through the server
    Token {
        #[command(subcommand)]
        command: TokenCommands,
    },

    /// Delete records revoked or expired longer than the retention window
    Prune {
        /// Retention in seconds (defaults to TOKEND_RETENTION)
        #[arg(long)]
        retention: Option<u64>,
    },
}

/// Flags that override the environment for one deployment.
#[derive(Debug, Default, clap::Args)]
pub struct ServeArgs {
    /// Port to bind
    #[arg(short, long)]
    pub port: Option<u16>,
    /// Address to bind
    #[arg(long)]
    pub host: Option<String>,
    /// Directory holding token records
    #[arg(long)]
    pub token_dir: Option<PathBuf>,
    /// Instance name reported by `/` and in logs
    #[arg(long)]
    pub instance: Option<String>,
}

#[derive(Subcommand)]
pub enum TokenCommands {
    /// Issue a token and print its value (shown only once)
    Issue {
        identity: String,
        /// Lifetime in seconds; omitted means the configured default
        #[arg(long)]
        ttl: Option<u64>,
    },
    /// Check a value against the stored token
    Validate { identity: String, value: String },
    /// Revoke the token of an identity
    Revoke { identity: String },
    /// Extend the lifetime of a live token
    Renew {
        identity: String,
        #[arg(long)]
        ttl: Option<u64>,
    },
    /// Show the state of a token
    Status { identity: String },
    /// List all token records
    List,
    /// Delete a token record outright
    Purge { identity: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_subcommand_means_serve() {
        let cli = Cli::try_parse_from(["tokend"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_serve_overrides() {
        let cli = Cli::try_parse_from([
            "tokend", "serve", "--port", "8001", "--token-dir", "/app/tokens", "--instance", "b",
        ])
        .unwrap();
        let Some(Commands::Serve(args)) = cli.command else {
            panic!("expected serve");
        };
        assert_eq!(args.port, Some(8001));
        assert_eq!(args.token_dir, Some(PathBuf::from("/app/tokens")));
        assert_eq!(args.instance.as_deref(), Some("b"));
        assert!(args.host.is_none());
    }

    #[test]
    fn test_token_issue_parses_ttl() {
        let cli = Cli::try_parse_from(["tokend", "token", "issue", "svc-a", "--ttl", "3600"]).unwrap();
        match cli.command {
            Some(Commands::Token {
                command: TokenCommands::Issue { identity, ttl },
            }) => {
                assert_eq!(identity, "svc-a");
                assert_eq!(ttl, Some(3600));
            }
            _ => panic!("expected token issue"),
        }
    }
}
