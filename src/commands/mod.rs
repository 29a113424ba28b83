/*!
Command handlers for the CLI

This module provides command handlers invoked by the CLI entrypoint:

- `discover` - Fetch and summarize the provider's discovery document
- `login`    - Browser login over a loopback redirect, then code exchange
- `token`    - Print a fresh access token
- `logout`   - Forget the stored grant, optionally ending the provider session
- `register` - Dynamic client registration

Handlers share [`Context`], which carries the configuration, the
authorization service, and the keyring store.
*/

use std::future::Future;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context as _, Result};
use url::Url;

use crate::auth_state::AuthState;
use crate::config::Config;
use crate::discovery::ServiceConfiguration;
use crate::service::AuthorizationService;
use crate::store::KeyringStore;
use crate::user_agent::{ExternalUserAgent, LoopbackUserAgent};

/// Shared command state.
#[derive(Debug, Clone)]
pub struct Context {
    pub config: Config,
    pub service: AuthorizationService,
    pub store: KeyringStore,
}

impl Context {
    /// Builds the context for `config` with the default HTTP transport.
    pub fn new(config: Config) -> Self {
        let store = KeyringStore::new(config.storage.service_name.clone());
        Self {
            config,
            service: AuthorizationService::default(),
            store,
        }
    }

    fn account(&self) -> &str {
        &self.config.storage.account
    }

    /// Explicit endpoints if configured, otherwise discovery.
    pub async fn resolve_configuration(&self) -> Result<ServiceConfiguration> {
        if let Some(manual) = self.config.provider.manual_configuration() {
            tracing::debug!("using configured endpoints");
            return Ok(manual);
        }
        let issuer = self
            .config
            .provider
            .issuer
            .as_ref()
            .ok_or_else(|| anyhow!("no provider issuer configured"))?;
        Ok(self.service.discover_for_issuer(issuer).await?)
    }

    fn load_state(&self) -> Result<Option<AuthState>> {
        Ok(self.store.load(self.account(), self.service.clone())?)
    }

    async fn bind_agent(&self, no_browser: bool) -> Result<Arc<LoopbackUserAgent>> {
        let client = &self.config.client;
        let agent = LoopbackUserAgent::bind(client.redirect_port, &client.redirect_path).await?;
        Ok(Arc::new(if no_browser {
            agent.without_browser()
        } else {
            agent
        }))
    }
}

/// Runs `flow` until it finishes or Ctrl-C is pressed, in which case
/// `cancel` runs and the flow's cancellation outcome is awaited.
async fn until_interrupted<T>(
    flow: impl Future<Output = crate::error::Result<T>>,
    cancel: impl FnOnce(),
) -> Result<T> {
    tokio::pin!(flow);
    tokio::select! {
        result = &mut flow => return Ok(result?),
        _ = tokio::signal::ctrl_c() => {}
    }
    eprintln!("Interrupted, cancelling");
    cancel();
    Ok(flow.await?)
}

/// Discover command
pub mod discover {
    use super::*;
    use crate::pkce;

    /// Prints the resolved provider configuration.
    ///
    /// # Arguments
    ///
    /// * `ctx` - Command context
    /// * `json` - Print the raw discovery document
    pub async fn run(ctx: &Context, json: bool) -> Result<()> {
        let configuration = ctx.resolve_configuration().await?;

        if json {
            let document = match configuration.discovery() {
                Some(discovery) => serde_json::Value::Object(discovery.raw().clone()),
                None => serde_json::to_value(&configuration)?,
            };
            println!("{}", serde_json::to_string_pretty(&document)?);
            return Ok(());
        }

        print!("{}", summary(&configuration));
        if let Some(discovery) = configuration.discovery() {
            if let Err(e) = pkce::verify_s256_support(discovery) {
                println!("warning: {e}");
            }
        }
        Ok(())
    }

    /// Human-readable endpoint listing.
    pub fn summary(configuration: &ServiceConfiguration) -> String {
        let optional = |url: Option<&Url>| url.map_or_else(|| "-".to_string(), Url::to_string);
        let mut out = String::new();
        out.push_str(&format!("issuer:                 {}\n", optional(configuration.issuer())));
        out.push_str(&format!(
            "authorization_endpoint: {}\n",
            configuration.authorization_endpoint()
        ));
        out.push_str(&format!(
            "token_endpoint:         {}\n",
            configuration.token_endpoint()
        ));
        out.push_str(&format!(
            "registration_endpoint:  {}\n",
            optional(configuration.registration_endpoint())
        ));
        out.push_str(&format!(
            "end_session_endpoint:   {}\n",
            optional(configuration.end_session_endpoint())
        ));
        out.push_str(&format!(
            "userinfo_endpoint:      {}\n",
            optional(configuration.userinfo_endpoint())
        ));
        if let Some(scopes) = configuration
            .discovery()
            .and_then(|d| d.scopes_supported.as_ref())
        {
            out.push_str(&format!("scopes_supported:       {}\n", scopes.join(" ")));
        }
        out
    }
}

/// Login command
pub mod login {
    use super::*;
    use crate::authorization::AuthorizationRequest;

    /// Logs in through the browser and stores the resulting grant.
    ///
    /// The client id comes from the configuration, or from a registration
    /// stored by `register --save`.
    ///
    /// # Arguments
    ///
    /// * `ctx` - Command context
    /// * `no_browser` - Only print the authorization URL
    /// * `scopes` - Scopes overriding the configured ones, if non-empty
    pub async fn run(ctx: &Context, no_browser: bool, scopes: Vec<String>) -> Result<()> {
        let configuration = ctx.resolve_configuration().await?;
        let state = ctx
            .load_state()?
            .unwrap_or_else(|| AuthState::new(ctx.service.clone()));
        let registration = state.last_registration_response();

        let client_id = ctx
            .config
            .client
            .client_id
            .clone()
            .or_else(|| registration.as_ref().map(|r| r.client_id().to_string()))
            .ok_or_else(|| anyhow!("no client id configured; set client.client_id or run `oauthkit register --save`"))?;
        let client_secret = ctx.config.client.client_secret.clone().or_else(|| {
            registration
                .as_ref()
                .and_then(|r| r.client_secret().map(str::to_string))
        });

        let agent = ctx.bind_agent(no_browser).await?;
        let scopes = if scopes.is_empty() {
            ctx.config.client.scopes.clone()
        } else {
            scopes
        };

        let mut builder =
            AuthorizationRequest::builder(configuration, client_id, agent.redirect_uri().clone())
                .scopes(scopes);
        if let Some(secret) = client_secret {
            builder = builder.client_secret(secret);
        }
        for (key, value) in &ctx.config.client.additional_parameters {
            builder = builder.additional_parameter(key, value);
        }
        let request = builder.build()?;

        let persist = ctx.store.observer(ctx.account());
        state.add_observer(&persist);

        let (session, completion) = ctx
            .service
            .present_authorization_request(request, agent.clone() as Arc<dyn ExternalUserAgent>)
            .await?;
        let response = until_interrupted(completion, || session.cancel()).await?;
        state.update_with_authorization_response(Ok(response.clone()));

        let token_request = response.token_exchange_request()?;
        let result = ctx
            .service
            .perform_token_request(&token_request, Some(&response))
            .await;
        state.update_with_token_response(result.clone());
        result.context("code exchange failed")?;

        ctx.store.save(ctx.account(), &state)?;
        eprintln!(
            "Logged in as account '{}'{}",
            ctx.account(),
            state
                .scope()
                .map(|s| format!(" with scope '{s}'"))
                .unwrap_or_default()
        );
        Ok(())
    }
}

/// Token command
pub mod token {
    use super::*;

    /// Prints a valid access token (or the ID token), refreshing first when
    /// the stored one is about to expire.
    ///
    /// # Arguments
    ///
    /// * `ctx` - Command context
    /// * `force_refresh` - Refresh even if the token is still valid
    /// * `id_token` - Print the ID token instead
    pub async fn run(ctx: &Context, force_refresh: bool, id_token: bool) -> Result<()> {
        let state = ctx
            .load_state()?
            .ok_or_else(|| anyhow!("not logged in; run `oauthkit login`"))?;
        let persist = ctx.store.observer(ctx.account());
        state.add_observer(&persist);

        if force_refresh {
            state.set_needs_token_refresh();
        }

        let tokens = state
            .fresh_tokens(ctx.config.refresh.min_validity())
            .await
            .context("could not obtain a fresh token")?;

        if id_token {
            let id_token = tokens
                .id_token
                .ok_or_else(|| anyhow!("the stored grant has no ID token"))?;
            println!("{id_token}");
        } else {
            println!("{}", tokens.access_token);
        }
        Ok(())
    }
}

/// Logout command
pub mod logout {
    use super::*;
    use crate::end_session::EndSessionRequest;

    /// Deletes the stored grant, ending the provider session first when
    /// asked.
    ///
    /// # Arguments
    ///
    /// * `ctx` - Command context
    /// * `end_session` - Run the RP-initiated logout flow
    /// * `no_browser` - Only print the logout URL
    pub async fn run(ctx: &Context, end_session: bool, no_browser: bool) -> Result<()> {
        let state = ctx.load_state()?;

        if end_session {
            let state = state
                .as_ref()
                .ok_or_else(|| anyhow!("not logged in; nothing to end"))?;
            let id_token = state
                .id_token()
                .ok_or_else(|| anyhow!("the stored grant has no ID token to send as a hint"))?;
            let configuration = match state.last_authorization_response() {
                Some(response) => response.request().configuration().clone(),
                None => ctx.resolve_configuration().await?,
            };

            let agent = ctx.bind_agent(no_browser).await?;
            let request =
                EndSessionRequest::new(configuration, id_token, agent.redirect_uri().clone())?;
            let (session, completion) = ctx
                .service
                .present_end_session_request(request, agent.clone() as Arc<dyn ExternalUserAgent>)
                .await?;
            until_interrupted(completion, || session.cancel()).await?;
            eprintln!("Provider session ended");
        }

        if state.is_some() {
            ctx.store.delete(ctx.account())?;
            eprintln!("Logged out of account '{}'", ctx.account());
        } else {
            eprintln!("Account '{}' was not logged in", ctx.account());
        }
        Ok(())
    }
}

/// Register command
pub mod register {
    use super::*;
    use crate::registration::RegistrationRequest;

    /// The loopback redirect URI registered when none is given.
    ///
    /// A configured port of `0` registers the port-less form, which RFC 8252
    /// providers match against any loopback port.
    pub fn default_redirect_uri(config: &Config) -> Result<Url> {
        let client = &config.client;
        let authority = match client.redirect_port {
            0 => "127.0.0.1".to_string(),
            port => format!("127.0.0.1:{port}"),
        };
        Url::parse(&format!("http://{authority}{}", client.redirect_path))
            .context("invalid redirect path")
    }

    /// Registers a client and prints the issued credentials as JSON.
    ///
    /// # Arguments
    ///
    /// * `ctx` - Command context
    /// * `redirect_uris` - Redirect URIs; empty means the loopback default
    /// * `initial_access_token` - Bearer token for the registration endpoint
    /// * `save` - Store the registration for later `login` calls
    pub async fn run(
        ctx: &Context,
        redirect_uris: Vec<Url>,
        initial_access_token: Option<String>,
        save: bool,
    ) -> Result<()> {
        let configuration = ctx.resolve_configuration().await?;
        if configuration.registration_endpoint().is_none() {
            bail!("the provider does not support dynamic client registration");
        }

        let redirect_uris = if redirect_uris.is_empty() {
            vec![default_redirect_uri(&ctx.config)?]
        } else {
            redirect_uris
        };

        let mut builder = RegistrationRequest::builder(configuration, redirect_uris)
            .token_endpoint_auth_method("none");
        if let Some(token) = initial_access_token {
            builder = builder.initial_access_token(token);
        }
        let request = builder.build()?;
        let response = ctx.service.perform_registration_request(&request).await?;

        let summary = serde_json::json!({
            "client_id": response.client_id(),
            "client_secret": response.client_secret(),
            "client_secret_expires_at": response.client_secret_expires_at(),
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);

        if save {
            let state = AuthState::from_registration(ctx.service.clone(), response);
            ctx.store.save(ctx.account(), &state)?;
            eprintln!("Registration stored for account '{}'", ctx.account());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manual_config() -> Config {
        Config::from_yaml(
            r#"
provider:
  issuer: https://auth.example.com
  authorization_endpoint: https://auth.example.com/authorize
  token_endpoint: https://auth.example.com/token
client:
  redirect_port: 8123
"#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_resolve_configuration_prefers_manual_endpoints() {
        let ctx = Context::new(manual_config());
        let configuration = ctx.resolve_configuration().await.unwrap();
        assert_eq!(
            configuration.authorization_endpoint().as_str(),
            "https://auth.example.com/authorize"
        );
        assert_eq!(
            configuration.issuer().map(Url::as_str),
            Some("https://auth.example.com/")
        );
    }

    #[test]
    fn test_summary_lists_endpoints() {
        let configuration = manual_config().provider.manual_configuration().unwrap();
        let summary = discover::summary(&configuration);
        assert!(summary.contains("token_endpoint:         https://auth.example.com/token"));
        assert!(summary.contains("registration_endpoint:  -"));
    }

    #[test]
    fn test_default_redirect_uri_with_port() {
        let uri = register::default_redirect_uri(&manual_config()).unwrap();
        assert_eq!(uri.as_str(), "http://127.0.0.1:8123/callback");
    }

    #[test]
    fn test_default_redirect_uri_without_port() {
        let mut config = manual_config();
        config.client.redirect_port = 0;
        let uri = register::default_redirect_uri(&config).unwrap();
        assert_eq!(uri.as_str(), "http://127.0.0.1/callback");
    }
}
