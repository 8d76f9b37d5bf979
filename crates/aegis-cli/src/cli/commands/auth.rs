//! Auth command handlers.

use std::io::{self, BufRead, Write};
use std::sync::Arc;

use anyhow::Result;
use url::Url;

use aegis_core::callback::{
    CallbackHandler, HostedRefresher, RedirectArtifacts, parse_redirect_url,
};
use aegis_core::config::{Config, paths};
use aegis_core::hosted;
use aegis_core::session::SessionBridge;
use aegis_core::storage::{FileStore, MemoryStore};

fn build_bridge(config: &Config) -> SessionBridge {
    SessionBridge::new(
        config.key_prefix.clone(),
        config.client_id.clone(),
        Arc::new(FileStore::new(paths::tokens_path())),
        Arc::new(MemoryStore::new()),
    )
}

/// Turns pasted input (full redirect URL or bare authorization code) into a
/// redirect URL the callback handler can process.
fn resolve_redirect_url(config: &Config, input: &str) -> Result<Url> {
    if let Ok(url) = Url::parse(input) {
        return Ok(url);
    }

    let mut url = Url::parse(&config.redirect_uri)
        .map_err(|e| anyhow::anyhow!("Invalid redirect_uri in config: {e}"))?;
    url.query_pairs_mut().append_pair("code", input);
    Ok(url)
}

pub async fn login() -> Result<()> {
    let config = Config::load()?;
    if config.domain.is_empty() || config.client_id.is_empty() {
        anyhow::bail!(
            "Provider not configured. Set domain and client_id in {}",
            paths::config_path().display()
        );
    }

    let bridge = build_bridge(&config);

    // Check if already logged in
    if let Some(existing) = bridge.tokens()
        && bridge.is_logged_in()
    {
        println!(
            "Already logged in as {} (token: {})",
            existing.username,
            hosted::mask_token(&existing.id_token)
        );
        print!("Do you want to replace the existing session? [y/N] ");
        io::stdout().flush()?;

        let mut response = String::new();
        io::stdin().lock().read_line(&mut response)?;
        if !response.trim().eq_ignore_ascii_case("y") {
            println!("Login cancelled.");
            return Ok(());
        }
    }

    let provider = config.provider();
    let oauth_state = uuid::Uuid::new_v4().to_string();
    let auth_url = provider.authorize_url(&oauth_state);

    println!("To log in through the hosted UI:");
    println!();
    println!("  1. A browser window will open (or visit the URL below)");
    println!("  2. Log in and authorize access");
    println!("  3. Paste the redirect URL (or the authorization code) here");
    println!();
    println!("Authorization URL:");
    println!("  {auth_url}");
    println!();

    // Try to open browser (best effort, skip in tests)
    if std::env::var("AEGIS_NO_BROWSER").is_err() {
        let _ = open::that(&auth_url);
    }

    print!("Paste the redirect URL (or authorization code): ");
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().lock().read_line(&mut input)?;
    let input = input.trim();
    if input.is_empty() {
        anyhow::bail!("Authorization code cannot be empty");
    }

    let redirect = resolve_redirect_url(&config, input)?;
    if let Some(RedirectArtifacts::Code {
        state: Some(state), ..
    }) = parse_redirect_url(&redirect)
        && state != oauth_state
    {
        anyhow::bail!("State mismatch");
    }

    println!("Exchanging code for tokens...");
    let handler = CallbackHandler::new(&bridge, HostedRefresher::new(provider))
        .with_polling(config.idle_poll(), config.callback_poll());
    let outcome = handler.process(&redirect).await;

    if outcome.authenticated {
        println!();
        match bridge.tokens() {
            Some(tokens) => println!(
                "✓ Logged in as {} (token: {})",
                tokens.username,
                hosted::mask_token(&tokens.id_token)
            ),
            None => println!("✓ Logged in"),
        }
        println!("  Tokens saved to: {}", paths::tokens_path().display());
    } else {
        println!("Login did not complete; remaining logged out.");
    }

    Ok(())
}

pub fn status() -> Result<()> {
    let config = Config::load()?;
    let bridge = build_bridge(&config);

    match bridge.tokens() {
        Some(tokens) if bridge.is_logged_in() => {
            println!(
                "Logged in as {} (token: {})",
                tokens.username,
                hosted::mask_token(&tokens.id_token)
            );
            if let Some(claims) = hosted::decode_claims(&tokens.id_token)
                && let Some(email) = claims.get("email").and_then(|v| v.as_str())
            {
                println!("  Email: {email}");
            }
        }
        Some(_) => println!("Session expired. Run `aegis login` to re-authenticate."),
        None => println!("Not logged in."),
    }

    Ok(())
}

pub fn logout() -> Result<()> {
    let config = Config::load()?;
    let bridge = build_bridge(&config);

    let had_tokens = bridge.logout()?;
    if had_tokens {
        println!("✓ Logged out");
        println!("  Tokens removed from: {}", paths::tokens_path().display());
    } else {
        println!("Not logged in (no tokens found).");
    }

    Ok(())
}
