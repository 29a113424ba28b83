//! oauthkit - OAuth 2.0 / OpenID Connect client CLI
//!
#![doc = "Main entry point for the oauthkit command-line client."]

use anyhow::Result;

use oauthkit::cli::{Cli, Commands};
use oauthkit::commands::{self, Context};
use oauthkit::config::Config;
use oauthkit::logging::init_logging;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let cli = Cli::parse_args();

    // Load configuration
    let config = Config::load(&cli.config, &cli)?;

    // Initialize tracing before validation so config warnings are visible
    init_logging(&config.logging)?;

    // Validate configuration
    config.validate()?;

    let ctx = Context::new(config);

    // Execute command
    match cli.command {
        Commands::Discover { json } => {
            tracing::info!("Resolving provider configuration");
            commands::discover::run(&ctx, json).await?;
            Ok(())
        }
        Commands::Login { no_browser, scopes } => {
            tracing::info!("Starting browser login");
            commands::login::run(&ctx, no_browser, scopes).await?;
            Ok(())
        }
        Commands::Token {
            force_refresh,
            id_token,
        } => {
            tracing::debug!("Fetching a fresh token");
            commands::token::run(&ctx, force_refresh, id_token).await?;
            Ok(())
        }
        Commands::Logout {
            end_session,
            no_browser,
        } => {
            tracing::info!("Logging out");
            commands::logout::run(&ctx, end_session, no_browser).await?;
            Ok(())
        }
        Commands::Register {
            redirect_uris,
            initial_access_token,
            save,
        } => {
            tracing::info!("Registering client");
            commands::register::run(&ctx, redirect_uris, initial_access_token, save).await?;
            Ok(())
        }
    }
}
