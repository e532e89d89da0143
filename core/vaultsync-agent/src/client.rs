//! Secrets clients: the mutually-TLS-authenticated HTTPS client and the
//! offline bundle variant behind one small capability set.

use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use rand::Rng as _;
use reqwest::{Client, StatusCode, Url};
use tracing::{info, warn};

use crate::bundle::BundleClient;
use crate::config::ClientConfig;
use crate::error::{AgentError, AgentResult};
use crate::metrics::AgentMetrics;
use crate::secret::{index_by_filename, parse_secret, parse_secret_list, Secret};

use std::collections::HashMap;

/// A source of secrets: list the catalog, fetch one, and reload
/// credentials. Concrete variants are dispatched here so the methods stay
/// plain `async fn`s.
pub enum SecretSource {
    Https(HttpsClient),
    Bundle(BundleClient),
    #[cfg(test)]
    Mock(crate::testing::MockClient),
}

impl SecretSource {
    /// The full catalog, keyed by derived filename.
    pub async fn list(&self) -> AgentResult<HashMap<String, Secret>> {
        match self {
            SecretSource::Https(client) => client.list().await,
            SecretSource::Bundle(client) => client.list(),
            #[cfg(test)]
            SecretSource::Mock(client) => client.list(),
        }
    }

    /// One secret by server name.
    pub async fn get(&self, name: &str) -> AgentResult<Secret> {
        match self {
            SecretSource::Https(client) => client.secret(name).await,
            SecretSource::Bundle(client) => client.get(name),
            #[cfg(test)]
            SecretSource::Mock(client) => client.get(name),
        }
    }

    /// Reloads client credentials from disk; a no-op for offline sources.
    pub async fn rebuild(&self) -> AgentResult<()> {
        match self {
            SecretSource::Https(client) => client.rebuild(),
            SecretSource::Bundle(_) => Ok(()),
            #[cfg(test)]
            SecretSource::Mock(_) => Ok(()),
        }
    }
}

/// TLS parameters a client is (re)built from.
struct ClientParams {
    cert: PathBuf,
    key: PathBuf,
    ca_file: PathBuf,
    timeout: Duration,
    max_retries: u32,
    min_backoff: Duration,
    max_backoff: Duration,
}

/// Client for the secrets server over mutual TLS.
///
/// The inner HTTP client is swapped wholesale by [`HttpsClient::rebuild`],
/// so short-lived client certificates can rotate without a restart.
pub struct HttpsClient {
    inner: RwLock<Client>,
    params: ClientParams,
    url: Url,
    metrics: Arc<AgentMetrics>,
}

impl HttpsClient {
    pub fn new(
        config: &ClientConfig,
        ca_file: PathBuf,
        server: &Url,
        metrics: Arc<AgentMetrics>,
    ) -> AgentResult<HttpsClient> {
        let params = ClientParams {
            cert: config.cert.clone(),
            key: config.key.clone(),
            ca_file,
            timeout: Duration::from_millis(config.timeout_ms),
            max_retries: config.max_retries.max(1),
            min_backoff: Duration::from_millis(config.min_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        };
        let initial = build_client(&params)?;
        Ok(HttpsClient {
            inner: RwLock::new(initial),
            params,
            url: server.clone(),
            metrics,
        })
    }

    /// Reloads certificates from disk and swaps the underlying client.
    /// Call periodically so routinely-replaced short-lived certificates
    /// are picked up.
    pub fn rebuild(&self) -> AgentResult<()> {
        let rebuilt = build_client(&self.params)?;
        *self.inner.write().expect("client lock poisoned") = rebuilt;
        Ok(())
    }

    /// Raw bytes from the server's `_status` endpoint, passed through.
    pub async fn server_status(&self) -> AgentResult<Vec<u8>> {
        let (status, body) = self.get_with_retry(&["_status"]).await?;
        if status != StatusCode::OK {
            return Err(server_error(status, &body));
        }
        Ok(body)
    }

    /// Raw JSON for one secret. 404 is reported as [`AgentError::SecretDeleted`]
    /// so the caller can map it to an on-disk deletion.
    pub async fn raw_secret(&self, name: &str) -> AgentResult<Vec<u8>> {
        let result = self.get_with_retry(&["secret", name]).await;
        let (status, body) = match result {
            Ok(ok) => ok,
            Err(err) => {
                self.metrics.mark_failure();
                warn!(secret = name, %err, "error retrieving secret");
                return Err(err);
            }
        };

        match status {
            StatusCode::OK => {
                self.metrics.mark_success();
                Ok(body)
            }
            StatusCode::NOT_FOUND => {
                warn!(secret = name, "secret not found");
                Err(AgentError::SecretDeleted)
            }
            other => {
                self.metrics.mark_failure();
                Err(server_error(other, &body))
            }
        }
    }

    /// One secret, parsed.
    pub async fn secret(&self, name: &str) -> AgentResult<Secret> {
        let data = self.raw_secret(name).await?;
        parse_secret(&data)
            .map_err(|err| AgentError::Parse(format!("decoding retrieved secret {name}: {err}")))
    }

    /// Raw JSON for the full secret listing.
    pub async fn raw_secret_list(&self) -> AgentResult<Vec<u8>> {
        let result = self.get_with_retry(&["secrets"]).await;
        let (status, body) = match result {
            Ok(ok) => ok,
            Err(err) => {
                self.metrics.mark_failure();
                return Err(err);
            }
        };
        if status != StatusCode::OK {
            self.metrics.mark_failure();
            return Err(server_error(status, &body));
        }
        self.metrics.mark_success();
        Ok(body)
    }

    /// The catalog, keyed by derived filename. Duplicate filenames are a
    /// server-side inconsistency and fail the whole listing.
    pub async fn list(&self) -> AgentResult<HashMap<String, Secret>> {
        let data = self.raw_secret_list().await?;
        let secrets = parse_secret_list(&data)?;
        index_by_filename(secrets)
    }

    /// GET with bounded, jittered-exponential retries. Only transient
    /// failures retry: connection errors and 5xx responses. The final
    /// attempt's outcome is returned either way.
    async fn get_with_retry(&self, segments: &[&str]) -> AgentResult<(StatusCode, Vec<u8>)> {
        let mut url = self.url.clone();
        url.path_segments_mut()
            .map_err(|_| AgentError::Config(format!("server URL {} cannot be a base", self.url)))?
            .extend(segments);

        let mut backoff = self.params.min_backoff;
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.metrics.mark_request();
            let client = self
                .inner
                .read()
                .expect("client lock poisoned")
                .clone();

            let started = Instant::now();
            let outcome = match client.get(url.clone()).send().await {
                Ok(response) => {
                    let status = response.status();
                    info!(
                        path = %url.path(),
                        status = status.as_u16(),
                        duration = ?started.elapsed(),
                        "GET"
                    );
                    if !status.is_server_error() {
                        let body = response.bytes().await?;
                        return Ok((status, body.to_vec()));
                    }
                    if attempt >= self.params.max_retries {
                        let body = response.bytes().await.unwrap_or_default();
                        return Ok((status, body.to_vec()));
                    }
                    Ok(status)
                }
                Err(err) => {
                    if attempt >= self.params.max_retries {
                        return Err(err.into());
                    }
                    Err(err)
                }
            };

            let sleep = jittered(self.params.min_backoff, backoff);
            match outcome {
                Ok(status) => info!(
                    path = %url.path(),
                    status = status.as_u16(),
                    attempt,
                    max = self.params.max_retries,
                    retry_in = ?sleep,
                    "retrying transient server error"
                ),
                Err(err) => warn!(
                    path = %url.path(),
                    %err,
                    attempt,
                    max = self.params.max_retries,
                    retry_in = ?sleep,
                    "retrying failed request"
                ),
            }
            tokio::time::sleep(sleep).await;
            backoff = (backoff * 2).min(self.params.max_backoff);
        }
    }
}

fn server_error(status: StatusCode, body: &[u8]) -> AgentError {
    // Squash newlines so the server message stays a single log line.
    let message = String::from_utf8_lossy(body)
        .split('\n')
        .collect::<Vec<_>>()
        .join(" ");
    AgentError::Server {
        status: status.as_u16(),
        message,
    }
}

/// A duration in `[min, current]`, uniformly chosen.
fn jittered(min: Duration, current: Duration) -> Duration {
    if current <= min {
        return current;
    }
    let span = (current - min).as_millis() as u64;
    min + Duration::from_millis(rand::thread_rng().gen_range(0..=span))
}

/// Builds the TLS client: identity and CA pool read fresh from disk,
/// minimum TLS 1.2, and no system roots — the dedicated CA bundle is the
/// only trust anchor.
fn build_client(params: &ClientParams) -> AgentResult<Client> {
    let mut identity_pem = fs::read(&params.cert).map_err(|err| {
        AgentError::Tls(format!("loading cert {}: {err}", params.cert.display()))
    })?;
    if params.key != params.cert {
        let key_pem = fs::read(&params.key).map_err(|err| {
            AgentError::Tls(format!("loading key {}: {err}", params.key.display()))
        })?;
        identity_pem.extend_from_slice(&key_pem);
    }
    let identity = reqwest::Identity::from_pem(&identity_pem)
        .map_err(|err| AgentError::Tls(format!("loading keypair: {err}")))?;

    let ca_pem = fs::read(&params.ca_file).map_err(|err| {
        AgentError::Tls(format!("loading CA file {}: {err}", params.ca_file.display()))
    })?;
    let roots = reqwest::Certificate::from_pem_bundle(&ca_pem)
        .map_err(|err| AgentError::Tls(format!("parsing CA bundle: {err}")))?;

    let mut builder = Client::builder()
        .use_rustls_tls()
        .identity(identity)
        .tls_built_in_root_certs(false)
        .min_tls_version(reqwest::tls::Version::TLS_1_2)
        .timeout(params.timeout);
    for root in roots {
        builder = builder.add_root_certificate(root);
    }
    builder
        .build()
        .map_err(|err| AgentError::Tls(format!("building TLS client: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_within_bounds() {
        let min = Duration::from_millis(100);
        let current = Duration::from_millis(800);
        for _ in 0..200 {
            let sleep = jittered(min, current);
            assert!(sleep >= min && sleep <= current);
        }
    }

    #[test]
    fn jitter_at_floor_is_identity() {
        let min = Duration::from_millis(100);
        assert_eq!(jittered(min, min), min);
    }

    #[test]
    fn server_errors_squash_newlines() {
        let err = server_error(StatusCode::INTERNAL_SERVER_ERROR, b"line one\nline two");
        assert_eq!(
            err.to_string(),
            "server error (status=500): line one line two"
        );
    }
}
