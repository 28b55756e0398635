//! Non-serve CLI commands: login, import, env.

use anyhow::{Context, bail};
use tokio::io::{AsyncBufReadExt, BufReader};

use lmux_core::Config;
use lmux_provider_core::{Auth, AuthStore, FileStore};

/// Interactive OAuth handshake. Claude uses a manual PKCE flow: open the
/// URL, paste the callback code back in.
pub async fn login(config: &Config, provider: &str, label: Option<String>) -> anyhow::Result<()> {
    if provider != lmux_common::provider::CLAUDE {
        bail!(
            "interactive login is only wired for claude; for {provider}, obtain a credential \
             with the provider's own CLI and run `lmux import {provider}`"
        );
    }

    let state = uuid::Uuid::new_v4().to_string();
    let challenge = lmux_provider_impl::claude_login::login_challenge(&state);
    println!("Open this URL, authorize, then paste the code below:\n\n{}\n", challenge.url);
    print!("code> ");
    use std::io::Write as _;
    std::io::stdout().flush().ok();

    let mut line = String::new();
    BufReader::new(tokio::io::stdin())
        .read_line(&mut line)
        .await
        .context("reading authorization code")?;
    let code = line.trim();
    if code.is_empty() {
        bail!("no authorization code provided");
    }

    let update = lmux_provider_impl::claude_login::exchange_login_code(
        code,
        &state,
        &challenge.verifier,
    )
    .await
    .context("exchanging authorization code")?;

    let label = label.unwrap_or_else(|| format!("account-{}", &state[..8]));
    let mut auth = Auth::new(provider, format!("{provider}-{label}"));
    auth.label = label;
    auth.metadata.access_token = update.access_token;
    auth.metadata.refresh_token = update.refresh_token.unwrap_or_default();
    auth.metadata.expires_at = update.expires_at;

    let store = FileStore::new(&config.auth_dir)?;
    store.save(&auth).context("writing auth file")?;
    println!("saved credential {} to {}", auth.id, config.auth_dir);
    Ok(())
}

/// Ingest pasted credential JSON. Accepts either a full auth entry or a bare
/// token object (`access_token` / `refresh_token` / `expires_at` / ...).
pub async fn import(config: &Config, provider: &str, label: Option<String>) -> anyhow::Result<()> {
    if !lmux_common::provider::known().contains(&provider) {
        bail!("unknown provider {provider}");
    }

    let mut input = String::new();
    let mut reader = BufReader::new(tokio::io::stdin());
    loop {
        let mut line = String::new();
        let read = reader.read_line(&mut line).await?;
        if read == 0 {
            break;
        }
        input.push_str(&line);
    }
    let input = input.trim();
    if input.is_empty() {
        bail!("no credential JSON on stdin");
    }

    let auth = match serde_json::from_str::<Auth>(input) {
        Ok(mut auth) => {
            auth.provider = provider.to_string();
            auth
        }
        Err(_) => {
            let metadata: lmux_provider_core::AuthMetadata =
                serde_json::from_str(input).context("credential JSON did not parse")?;
            if metadata.access_token.is_empty()
                && metadata.refresh_token.is_empty()
                && metadata.api_key.is_empty()
            {
                bail!("credential JSON carries no usable token material");
            }
            let label = label
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()[..8].to_string());
            let mut auth = Auth::new(provider, format!("{provider}-{label}"));
            auth.label = label;
            auth.metadata = metadata;
            auth
        }
    };

    let store = FileStore::new(&config.auth_dir)?;
    store.save(&auth).context("writing auth file")?;
    println!("imported {} credential {}", provider, auth.id);
    Ok(())
}

pub fn print_env(config: &Config) {
    println!("LMUX_HOST={}", config.host);
    println!("LMUX_PORT={}", config.port);
    println!("LMUX_AUTH_DIR={}", config.auth_dir);
    println!("LMUX_DISABLE_AUTH={}", config.disable_auth);
    println!("LMUX_DISABLE_COOLING={}", config.disable_cooling);
    println!("LMUX_REQUEST_RETRY={}", config.request_retry);
    println!(
        "LMUX_PROXY_URL={}",
        config.proxy_url.as_deref().unwrap_or_default()
    );
    println!("LMUX_DEBUG={}", config.debug);
}
