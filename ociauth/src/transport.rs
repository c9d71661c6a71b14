//! A tower layer that authenticates registry requests.
//!
//! The service sends each request as-is first. On a `401` carrying a
//! `WWW-Authenticate` challenge it resolves credentials for the request's
//! host from the [`Config`], acquires a token from the challenge realm (for
//! `Bearer`) or attaches the credentials directly (for `Basic`), and replays
//! the request once. Bearer tokens are cached keyed by the canonical scope
//! they were granted for; a request needing a superset of previously
//! requested scopes triggers a fresh acquisition for the union.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use base64::prelude::{Engine as _, BASE64_STANDARD};
use http::header;
use http::{HeaderValue, Request, Response, StatusCode};
use http_body_util::BodyExt as _;
use hyperdriver::Body;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde::Deserialize;
use tower::{BoxError, Layer, Service, ServiceExt as _};

use crate::challenge::{parse_challenge, Challenge};
use crate::config::Config;
use crate::scope::{RequiredScope, Scope};

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Layer wrapping a transport with registry authentication.
#[derive(Debug, Clone)]
pub struct AuthLayer {
    state: Arc<AuthState>,
}

impl AuthLayer {
    pub fn new(config: Config) -> Self {
        AuthLayer {
            state: Arc::new(AuthState {
                config,
                tokens: Mutex::new(Vec::new()),
                wanted: Mutex::new(Scope::empty()),
            }),
        }
    }
}

impl<S> Layer<S> for AuthLayer {
    type Service = AuthService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthService {
            inner,
            state: self.state.clone(),
        }
    }
}

/// Service produced by [`AuthLayer`].
#[derive(Debug)]
pub struct AuthService<S> {
    inner: S,
    state: Arc<AuthState>,
}

impl<S: Clone> Clone for AuthService<S> {
    fn clone(&self) -> Self {
        AuthService {
            inner: self.inner.clone(),
            state: self.state.clone(),
        }
    }
}

#[derive(Debug)]
struct AuthState {
    config: Config,
    tokens: Mutex<Vec<CachedToken>>,
    // Union of every scope requested so far, so token upgrades ask for
    // everything the session has needed.
    wanted: Mutex<Scope>,
}

#[derive(Debug)]
struct CachedToken {
    scope: Scope,
    token: String,
}

impl AuthState {
    fn cached_token(&self, scope: &Scope) -> Option<String> {
        let tokens = self.tokens.lock().expect("token cache lock");
        tokens
            .iter()
            .find(|t| t.scope.contains(scope))
            .map(|t| t.token.clone())
    }

    fn store_token(&self, scope: Scope, token: String) {
        let mut tokens = self.tokens.lock().expect("token cache lock");
        tokens.retain(|t| !scope.contains(&t.scope));
        tokens.push(CachedToken { scope, token });
    }

    fn want(&self, scope: &Scope) -> Scope {
        let mut wanted = self.wanted.lock().expect("wanted scope lock");
        *wanted = std::mem::take(&mut *wanted).union(scope);
        wanted.clone()
    }

    async fn acquire_token<S>(
        &self,
        transport: S,
        host: &str,
        challenge: &Challenge,
    ) -> Result<String, BoxError>
    where
        S: Service<Request<Body>, Response = Response<Body>> + Send + 'static,
        S::Error: Into<BoxError>,
        S::Future: Send,
    {
        let entry = self.config.entry_for_registry(host)?;
        if !entry.access_token.is_empty() {
            // A registry token from configuration is used as-is.
            return Ok(entry.access_token);
        }

        let scope = match Scope::parse(&challenge.scope) {
            Ok(challenged) => self.want(&challenged),
            Err(_) => self.want(&Scope::empty()),
        };
        if let Some(token) = self.cached_token(&scope) {
            return Ok(token);
        }

        let mut query = Vec::new();
        if !challenge.service.is_empty() {
            query.push(format!(
                "service={}",
                utf8_percent_encode(&challenge.service, NON_ALPHANUMERIC)
            ));
        }
        for entry in scope.to_string().split_ascii_whitespace() {
            query.push(format!("scope={}", utf8_percent_encode(entry, NON_ALPHANUMERIC)));
        }
        let uri = if query.is_empty() {
            challenge.realm.clone()
        } else {
            let separator = if challenge.realm.contains('?') { '&' } else { '?' };
            format!("{}{}{}", challenge.realm, separator, query.join("&"))
        };

        tracing::debug!(realm = %challenge.realm, scope = %scope, "acquiring bearer token");

        let mut request = Request::builder()
            .method(http::Method::GET)
            .uri(uri.as_str())
            .header(header::ACCEPT, "application/json")
            .body(Body::empty())
            .map_err(BoxError::from)?;
        if !entry.username.is_empty() || !entry.password.is_empty() {
            request
                .headers_mut()
                .insert(header::AUTHORIZATION, basic_auth(&entry.username, &entry.password));
        }

        let response = transport.oneshot(request).await.map_err(Into::into)?;
        if !response.status().is_success() {
            return Err(format!("cannot acquire token from {uri:?}: {}", response.status()).into());
        }
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|err| format!("cannot read token response: {err}"))?
            .to_bytes();
        let token: TokenResponse = serde_json::from_slice(&body)
            .map_err(|err| format!("cannot decode token response: {err}"))?;
        let token = if !token.token.is_empty() {
            token.token
        } else {
            token.access_token
        };
        if token.is_empty() {
            return Err("token server returned an empty token".into());
        }
        self.store_token(scope, token.clone());
        Ok(token)
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: String,
    #[serde(default)]
    access_token: String,
}

impl<S> Service<Request<Body>> for AuthService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Error: Into<BoxError>,
    S::Future: Send,
{
    type Response = Response<Body>;
    type Error = BoxError;
    type Future = BoxFuture<Result<Response<Body>, BoxError>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let state = self.state.clone();
        let inner = self.inner.clone();
        Box::pin(async move {
            let scope = req
                .extensions()
                .get::<RequiredScope>()
                .map(|s| s.0.clone())
                .unwrap_or_default();
            if !scope.is_empty() {
                state.want(&scope);
                if let Some(token) = state.cached_token(&scope) {
                    attach_bearer(&mut req, &token)?;
                }
            }

            let retry = clone_request(&req);
            let response = inner.clone().oneshot(req).await.map_err(Into::into)?;
            if response.status() != StatusCode::UNAUTHORIZED {
                return Ok(response);
            }
            let Some(mut retry_req) = retry else {
                return Ok(response);
            };
            let Some(challenge) = response
                .headers()
                .get(header::WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_challenge)
            else {
                return Ok(response);
            };

            let host = retry_req
                .uri()
                .authority()
                .map(|a| a.as_str().to_string())
                .unwrap_or_default();

            match challenge.scheme.as_str() {
                "bearer" => {
                    let token = state.acquire_token(inner.clone(), &host, &challenge).await?;
                    attach_bearer(&mut retry_req, &token)?;
                }
                "basic" => {
                    let entry = state.config.entry_for_registry(&host)?;
                    if entry.username.is_empty() && entry.password.is_empty() {
                        return Ok(response);
                    }
                    retry_req
                        .headers_mut()
                        .insert(header::AUTHORIZATION, basic_auth(&entry.username, &entry.password));
                }
                scheme => {
                    tracing::debug!(%scheme, "unhandled authentication challenge scheme");
                    return Ok(response);
                }
            }
            tracing::debug!(%host, "retrying request with fresh credentials");
            inner.oneshot(retry_req).await.map_err(Into::into)
        })
    }
}

/// A `Basic` authorization header for the given credentials.
pub fn basic_auth(username: &str, password: &str) -> HeaderValue {
    let encoded = BASE64_STANDARD.encode(format!("{username}:{password}"));
    let mut value = HeaderValue::from_str(&format!("Basic {encoded}"))
        .expect("base64 is always a valid header value");
    value.set_sensitive(true);
    value
}

fn attach_bearer(req: &mut Request<Body>, token: &str) -> Result<(), BoxError> {
    let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
        .map_err(|err| format!("token is not a valid header value: {err}"))?;
    value.set_sensitive(true);
    req.headers_mut().insert(header::AUTHORIZATION, value);
    Ok(())
}

fn clone_request(req: &Request<Body>) -> Option<Request<Body>> {
    let body = req.body().try_clone()?;
    let mut next = Request::builder()
        .method(req.method().clone())
        .uri(req.uri().clone())
        .version(req.version())
        .body(body)
        .ok()?;
    *next.extensions_mut() = req.extensions().clone();
    *next.headers_mut() = req.headers().clone();
    Some(next)
}
