//! OAuth callback handling.
//!
//! On startup the handler inspects the redirect URL for hosted-UI artifacts
//! (authorization code or implicit-flow tokens), hydrates the session through
//! a [`SessionRefresher`], and falls back to bounded polling of the session
//! bridge. Polling exists because the provider's own hydration is
//! asynchronous and not directly awaitable; watching `is_logged_in()` is the
//! only observable completion signal, and the attempt bounds are an explicit
//! timeout policy standing in for a completion callback.
//!
//! No failure in this flow is surfaced to the user: every path degrades to
//! the logged-out state.

use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::hosted::{self, HostedProvider};
use crate::session::{ResumeIntent, SessionBridge, TokenSet};

/// Interval between poll attempts.
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Attempt bound for the safety-net poll when no artifacts are present.
pub const IDLE_POLL_ATTEMPTS: u32 = 10;

/// Attempt bound after a detected callback. Substantially longer than the
/// idle bound: a legitimate in-flight provider redirect may still resolve.
pub const CALLBACK_POLL_ATTEMPTS: u32 = 40;

/// Bounded polling schedule. The defaults are placeholder timeouts to be
/// tuned against the provider's observed latency, not SLAs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl PollPolicy {
    pub const fn new(attempts: u32, interval: Duration) -> Self {
        Self { attempts, interval }
    }

    /// Default schedule for the no-artifacts path.
    pub const fn idle() -> Self {
        Self::new(IDLE_POLL_ATTEMPTS, POLL_INTERVAL)
    }

    /// Default schedule after a detected callback.
    pub const fn callback() -> Self {
        Self::new(CALLBACK_POLL_ATTEMPTS, POLL_INTERVAL)
    }
}

/// OAuth artifacts found in a redirect URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedirectArtifacts {
    /// Authorization-code flow: `?code=..&state=..`.
    Code { code: String, state: Option<String> },
    /// Implicit flow: `#id_token=..&access_token=..`.
    ImplicitTokens {
        id_token: Option<String>,
        access_token: Option<String>,
    },
}

/// Parses OAuth artifacts out of a redirect URL, if any.
pub fn parse_redirect_url(url: &Url) -> Option<RedirectArtifacts> {
    let code = url
        .query_pairs()
        .find(|(k, _)| k == "code")
        .map(|(_, v)| v.to_string());
    if let Some(code) = code {
        let state = url
            .query_pairs()
            .find(|(k, _)| k == "state")
            .map(|(_, v)| v.to_string());
        return Some(RedirectArtifacts::Code { code, state });
    }

    let fragment = url.fragment()?;
    let params: Vec<(String, String)> = url::form_urlencoded::parse(fragment.as_bytes())
        .into_owned()
        .collect();
    let id_token = params
        .iter()
        .find(|(k, _)| k == "id_token")
        .map(|(_, v)| v.clone());
    let access_token = params
        .iter()
        .find(|(k, _)| k == "access_token")
        .map(|(_, v)| v.clone());

    if id_token.is_none() && access_token.is_none() {
        return None;
    }
    Some(RedirectArtifacts::ImplicitTokens {
        id_token,
        access_token,
    })
}

/// Returns the path-only form of a redirect URL (query and fragment
/// stripped), so the artifacts are not re-processed on a reload or
/// back-navigation equivalent.
pub fn cleaned_url(url: &Url) -> Url {
    let mut cleaned = url.clone();
    cleaned.set_query(None);
    cleaned.set_fragment(None);
    cleaned
}

/// Seam over the identity provider's session-refresh path.
///
/// Returns `Ok(true)` once tokens have been persisted through the bridge.
/// `Ok(false)` and errors both mean "hydration did not complete here" and
/// send the handler into its polling fallback.
pub trait SessionRefresher {
    async fn refresh(
        &self,
        bridge: &SessionBridge,
        artifacts: &RedirectArtifacts,
    ) -> Result<bool>;
}

/// Default refresher: manual exchange against the hosted token endpoint.
#[derive(Debug, Clone)]
pub struct HostedRefresher {
    provider: HostedProvider,
}

impl HostedRefresher {
    pub fn new(provider: HostedProvider) -> Self {
        Self { provider }
    }
}

impl SessionRefresher for HostedRefresher {
    async fn refresh(
        &self,
        bridge: &SessionBridge,
        artifacts: &RedirectArtifacts,
    ) -> Result<bool> {
        match artifacts {
            RedirectArtifacts::Code { code, .. } => {
                // Prefer the provider's refresh path when a refresh token is
                // already persisted; fall back to exchanging the code.
                if let Some(current) = bridge.tokens()
                    && current.refresh_token.is_some()
                {
                    match self.provider.refresh_session(&current).await {
                        Ok(tokens) => {
                            bridge.store_tokens(&tokens)?;
                            return Ok(true);
                        }
                        Err(err) => {
                            warn!("session refresh failed, exchanging code instead: {err:#}");
                        }
                    }
                }
                let tokens = self.provider.exchange_code(code).await?;
                bridge.store_tokens(&tokens)?;
                Ok(true)
            }
            RedirectArtifacts::ImplicitTokens {
                id_token,
                access_token,
            } => {
                let Some(id_token) = id_token else {
                    return Ok(false);
                };
                let Some(username) = hosted::username_from_id_token(id_token) else {
                    return Ok(false);
                };
                // The implicit flow issues no refresh token.
                bridge.store_tokens(&TokenSet {
                    access_token: access_token.clone().unwrap_or_default(),
                    id_token: id_token.clone(),
                    refresh_token: None,
                    username,
                })?;
                Ok(true)
            }
        }
    }
}

/// Outcome of one redirect-processing pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackOutcome {
    pub authenticated: bool,
    /// Path-only redirect URL, produced at most once and only after
    /// successful detection.
    pub cleaned_url: Option<Url>,
}

/// Drives the page-load lifecycle: artifact detection, refresh, polling
/// fallback, URL cleanup.
pub struct CallbackHandler<'a, R> {
    bridge: &'a SessionBridge,
    refresher: R,
    idle_poll: PollPolicy,
    callback_poll: PollPolicy,
    cancel: CancellationToken,
}

impl<'a, R: SessionRefresher> CallbackHandler<'a, R> {
    pub fn new(bridge: &'a SessionBridge, refresher: R) -> Self {
        Self {
            bridge,
            refresher,
            idle_poll: PollPolicy::idle(),
            callback_poll: PollPolicy::callback(),
            cancel: CancellationToken::new(),
        }
    }

    /// Overrides both polling schedules.
    pub fn with_polling(mut self, idle: PollPolicy, callback: PollPolicy) -> Self {
        self.idle_poll = idle;
        self.callback_poll = callback;
        self
    }

    /// Ties the handler to an external cancellation token. Once cancelled,
    /// no further bridge probes run and no event fires from this handler.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Processes one redirect URL. Never fails: every error degrades to a
    /// silent unauthenticated outcome.
    pub async fn process(&self, url: &Url) -> CallbackOutcome {
        // A pending intent from before the last hard transition re-emits the
        // auth change ahead of URL inspection, since the old subscribers are
        // gone.
        if let Some(ResumeIntent::ReEmitAuthChange) = self.bridge.take_resume_intent() {
            debug!("consuming resume intent, re-emitting auth change");
            self.bridge.notify_auth_change(true);
        }

        let Some(artifacts) = parse_redirect_url(url) else {
            debug!("no oauth artifacts in url, starting safety-net poll");
            let authenticated = self.poll_for_login(self.idle_poll).await;
            if authenticated {
                self.bridge.notify_auth_change(false);
            }
            return CallbackOutcome {
                authenticated,
                cleaned_url: None,
            };
        };

        debug!("oauth artifacts detected, attempting session refresh");
        match self.refresher.refresh(self.bridge, &artifacts).await {
            Ok(true) => {
                self.bridge.notify_auth_change(true);
                CallbackOutcome {
                    authenticated: true,
                    cleaned_url: Some(cleaned_url(url)),
                }
            }
            outcome => {
                if let Err(err) = outcome {
                    warn!("session refresh failed, falling back to polling: {err:#}");
                }
                let authenticated = self.poll_for_login(self.callback_poll).await;
                if authenticated {
                    // Clean at the detection point, not before.
                    let cleaned = cleaned_url(url);
                    self.bridge.notify_auth_change(true);
                    CallbackOutcome {
                        authenticated: true,
                        cleaned_url: Some(cleaned),
                    }
                } else {
                    CallbackOutcome {
                        authenticated: false,
                        cleaned_url: None,
                    }
                }
            }
        }
    }

    /// Watches `is_logged_in()` on a fixed interval until it flips, the
    /// bound is exhausted, or the handler is cancelled. Sleeps before each
    /// probe: hydration that was going to complete synchronously already has.
    async fn poll_for_login(&self, policy: PollPolicy) -> bool {
        for attempt in 1..=policy.attempts {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    debug!("polling cancelled after {} attempts", attempt - 1);
                    return false;
                }
                () = tokio::time::sleep(policy.interval) => {}
            }
            if self.cancel.is_cancelled() {
                return false;
            }
            if self.bridge.is_logged_in() {
                debug!(attempt, "session detected while polling");
                return true;
            }
        }
        debug!(
            attempts = policy.attempts,
            "poll bound exhausted, remaining logged out"
        );
        false
    }
}
