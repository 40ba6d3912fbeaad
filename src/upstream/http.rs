//! Outbound HTTP plumbing: per-credential client construction and the
//! bounded retry helper used by discovery calls.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use super::{is_transient_for_discovery, UpstreamError};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const TCP_KEEPALIVE: Duration = Duration::from_secs(30);
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const POOL_MAX_IDLE_PER_HOST: usize = 10;

/// Build the reqwest client used for all traffic of one credential.
///
/// Connections are pooled and long-lived; HTTP/2 is negotiated via ALPN.
/// The proxy, when configured, applies to every request (`http` and
/// `socks5` schemes, enforced at config validation).
pub fn build_http_client(
    proxy: Option<&reqwest::Url>,
    user_agent: &str,
) -> Result<reqwest::Client, reqwest::Error> {
    let mut builder = reqwest::Client::builder()
        .user_agent(user_agent)
        .connect_timeout(CONNECT_TIMEOUT)
        .tcp_keepalive(TCP_KEEPALIVE)
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST);

    if let Some(url) = proxy {
        builder = builder.proxy(reqwest::Proxy::all(url.as_str())?);
    }
    builder.build()
}

/// Run `op` with exponential backoff and +0..20% jitter between attempts.
///
/// Only errors [`is_transient_for_discovery`] accepts are retried; the
/// generation hot path never goes through here, rotation across units is the
/// dispatcher's job.
pub async fn with_retries<T, F, Fut>(
    max_retries: u32,
    base_delay: Duration,
    mut op: F,
) -> Result<T, UpstreamError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, UpstreamError>>,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= max_retries || !is_transient_for_discovery(&err) {
                    return Err(err);
                }
                let jitter = 1.0 + rand::rng().random_range(0.0..0.2);
                let factor = 1u64 << attempt.min(16);
                let delay = base_delay.mul_f64(jitter * factor as f64);
                warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient upstream error, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn status(code: u16) -> UpstreamError {
        UpstreamError::Status {
            status: code,
            body: String::new(),
        }
    }

    #[test]
    fn test_build_http_client_without_proxy() {
        build_http_client(None, "test-agent/1.0").unwrap();
    }

    #[test]
    fn test_build_http_client_with_proxies() {
        let http = reqwest::Url::parse("http://127.0.0.1:8080").unwrap();
        build_http_client(Some(&http), "test-agent/1.0").unwrap();

        let socks = reqwest::Url::parse("socks5://127.0.0.1:1080").unwrap();
        build_http_client(Some(&socks), "test-agent/1.0").unwrap();
    }

    #[tokio::test]
    async fn test_with_retries_succeeds_after_transient_errors() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let result = with_retries(3, Duration::from_millis(1), move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(status(503))
                } else {
                    Ok("ok")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retries_stops_on_non_transient() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let result: Result<(), _> = with_retries(3, Duration::from_millis(1), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(status(404))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_with_retries_exhausts_budget() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let result: Result<(), _> = with_retries(2, Duration::from_millis(1), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(status(500))
            }
        })
        .await;

        assert!(result.is_err());
        // Initial call plus two retries.
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
