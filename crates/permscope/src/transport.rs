use std::time::Duration;

use permscope_config::{ConfigError, TransportConfig, SOCKET_TRANSPORT};
use permscope_jdwp::wire::{JdwpClient, JdwpClientConfig};
use tokio::time::Instant;

use crate::{TraceError, TraceResult};

/// How hard to try reaching the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectPolicy {
    /// Retry until `timeout` instead of failing on the first refusal.
    pub wait: bool,
    pub timeout: Duration,
    pub retry_interval: Duration,
}

impl From<&TransportConfig> for ConnectPolicy {
    fn from(config: &TransportConfig) -> Self {
        Self {
            wait: config.wait,
            timeout: config.wait_timeout(),
            retry_interval: config.retry_interval(),
        }
    }
}

pub fn address(config: &TransportConfig) -> String {
    format!("{}:{}", config.host, config.port)
}

/// Attaches to the target described by `config`.
pub async fn connect(config: &TransportConfig) -> TraceResult<JdwpClient> {
    if config.transport != SOCKET_TRANSPORT {
        return Err(ConfigError::UnsupportedTransport(config.transport.clone()).into());
    }
    connect_with_policy(
        &address(config),
        ConnectPolicy::from(config),
        JdwpClientConfig::default(),
    )
    .await
}

pub async fn connect_with_policy(
    address: &str,
    policy: ConnectPolicy,
    client_config: JdwpClientConfig,
) -> TraceResult<JdwpClient> {
    let deadline = Instant::now() + policy.timeout;
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let reason = match attempt_connect(address, &client_config).await {
            Ok(client) => {
                tracing::info!(target = "permscope.transport", address, attempt, "attached");
                return Ok(client);
            }
            Err(reason) => reason,
        };

        let now = Instant::now();
        if !policy.wait || now >= deadline {
            return Err(TraceError::Transport {
                address: address.to_owned(),
                reason,
            });
        }
        let pause = policy.retry_interval.min(deadline - now);
        tracing::info!(
            target = "permscope.transport",
            address,
            attempt,
            %reason,
            retry_in_ms = pause.as_millis() as u64,
            "target not reachable; waiting"
        );
        tokio::time::sleep(pause).await;
    }
}

async fn attempt_connect(address: &str, client_config: &JdwpClientConfig) -> Result<JdwpClient, String> {
    let candidates = tokio::net::lookup_host(address)
        .await
        .map_err(|err| err.to_string())?;
    let mut last = format!("{address} did not resolve to any address");
    for addr in candidates {
        match JdwpClient::connect_with_config(addr, client_config.clone()).await {
            Ok(client) => return Ok(client),
            Err(err) => last = err.to_string(),
        }
    }
    Err(last)
}
