//! Command-line interface.

use clap::{Parser, Subcommand};

use crate::config::ProxyConfig;

#[derive(Parser)]
#[command(name = "pincer", about = "Model-routing and session-relay proxy", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the proxy server (the default when no subcommand is given)
    Start,
    /// Print the resolved configuration (secrets redacted)
    Config,
    /// Print version information
    Version,
}

pub fn handle_config() {
    println!("{:#?}", ProxyConfig::from_env());
}

pub fn handle_version() {
    println!("pincer v{}", env!("CARGO_PKG_VERSION"));
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_subcommands() {
        assert!(matches!(
            Cli::parse_from(["pincer"]).command,
            None
        ));
        assert!(matches!(
            Cli::parse_from(["pincer", "start"]).command,
            Some(Command::Start)
        ));
        assert!(matches!(
            Cli::parse_from(["pincer", "version"]).command,
            Some(Command::Version)
        ));
    }
}
