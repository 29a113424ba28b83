//! Command-line interface definition for oauthkit
//!
//! This module defines the CLI structure using clap's derive API.

use clap::{Parser, Subcommand};
use url::Url;

/// oauthkit - OAuth 2.0 / OpenID Connect client for the terminal
///
/// Discover providers, log in through the system browser, and hand out
/// fresh access tokens to scripts.
#[derive(Parser, Debug, Clone)]
#[command(name = "oauthkit")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "OAUTHKIT_CONFIG", default_value = crate::config::DEFAULT_CONFIG_PATH)]
    pub config: String,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub json_logs: bool,

    /// Override the provider issuer
    #[arg(long)]
    pub issuer: Option<Url>,

    /// Override the client identifier
    #[arg(long)]
    pub client_id: Option<String>,

    /// Keyring account the auth state is stored under
    #[arg(short, long)]
    pub account: Option<String>,

    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Fetch and print the provider's discovery document
    Discover {
        /// Print the raw document instead of a summary
        #[arg(long)]
        json: bool,
    },

    /// Log in through the browser and store the resulting grant
    Login {
        /// Print the authorization URL without opening a browser
        #[arg(long)]
        no_browser: bool,

        /// Scopes to request instead of the configured ones
        #[arg(short, long = "scope")]
        scopes: Vec<String>,
    },

    /// Print a valid access token, refreshing it when needed
    Token {
        /// Refresh even if the current token is still valid
        #[arg(long)]
        force_refresh: bool,

        /// Print the ID token instead of the access token
        #[arg(long)]
        id_token: bool,
    },

    /// Forget the stored grant
    Logout {
        /// Also end the session at the provider through the browser
        #[arg(long)]
        end_session: bool,

        /// Print the logout URL without opening a browser
        #[arg(long)]
        no_browser: bool,
    },

    /// Register a new client with the provider
    Register {
        /// Redirect URIs to register; defaults to the loopback redirect
        #[arg(long = "redirect-uri")]
        redirect_uris: Vec<Url>,

        /// Bearer token for protected registration endpoints
        #[arg(long, env = "OAUTHKIT_INITIAL_ACCESS_TOKEN")]
        initial_access_token: Option<String>,

        /// Store the registration so `login` can use the issued client id
        #[arg(long)]
        save: bool,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
