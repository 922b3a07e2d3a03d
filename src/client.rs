use crate::config::Config;
use crate::state::{ChannelProperties, Forward, Hop, NodeIdentity, Payment, PaymentState};
use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use tokio::time::sleep;

/// Trait abstracting the node RPC surface used by the advisor.
///
/// This enables mock-based testing without a live node.
#[async_trait::async_trait]
pub trait NodeClient: Send + Sync {
    async fn get_identity(&self) -> anyhow::Result<NodeIdentity>;
    async fn get_channels(&self) -> anyhow::Result<Vec<ChannelProperties>>;
    async fn get_forwards(
        &self,
        after: DateTime<Utc>,
        before: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Forward>>;
    async fn get_payments(
        &self,
        after: DateTime<Utc>,
        before: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Payment>>;
    async fn delete_payment(&self, id: &str) -> anyhow::Result<()>;
}

/// Retrying client for the LND REST API.
pub struct LndRestClient {
    http: reqwest::Client,
    base_url: String,
}

const MAX_RETRIES: u32 = 3;
const RETRY_BASE_MS: u64 = 1000;
const PAGE_SIZE: usize = 1000;

impl LndRestClient {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let cert_pem = std::fs::read(&config.lnd.tls_cert_path).with_context(|| {
            format!(
                "Failed to read TLS cert at {}",
                config.lnd.tls_cert_path.display()
            )
        })?;
        let macaroon = std::fs::read(&config.lnd.macaroon_path).with_context(|| {
            format!(
                "Failed to read macaroon at {}",
                config.lnd.macaroon_path.display()
            )
        })?;

        let mut headers = reqwest::header::HeaderMap::new();
        let macaroon_value = hex::encode(macaroon)
            .parse()
            .context("macaroon is not a valid header value")?;
        headers.insert("Grpc-Metadata-macaroon", macaroon_value);

        let http = reqwest::Client::builder()
            .add_root_certificate(reqwest::Certificate::from_pem(&cert_pem)?)
            .default_headers(headers)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            http,
            base_url: config.lnd.rest_url.trim_end_matches('/').to_string(),
        })
    }

    async fn with_retry<T, F, Fut>(&self, name: &str, f: F) -> anyhow::Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match f().await {
                Ok(value) => {
                    debug!("{}: success", name);
                    return Ok(value);
                }
                Err(e) => {
                    attempt += 1;
                    if attempt >= MAX_RETRIES {
                        return Err(e.context(format!(
                            "{}: all {} attempts failed",
                            name, MAX_RETRIES
                        )));
                    }
                    let delay = RETRY_BASE_MS * 2u64.pow(attempt - 1);
                    warn!(
                        "{}: attempt {} failed ({:#}), retrying in {}ms",
                        name, attempt, e, delay
                    );
                    sleep(std::time::Duration::from_millis(delay)).await;
                }
            }
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> anyhow::Result<T> {
        let response = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> anyhow::Result<T> {
        let response = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .json(body)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    async fn partner_fee_rate(&self, channel: &RpcChannel) -> Option<u64> {
        let edge: ChannelEdge = match self
            .get_json(&format!("/v1/graph/edge/{}", channel.chan_id))
            .await
        {
            Ok(edge) => edge,
            Err(e) => {
                debug!(
                    "No graph edge for channel {}: {:#}",
                    channel.chan_id, e
                );
                return None;
            }
        };
        let policy = if edge.node1_pub == channel.remote_pubkey {
            edge.node1_policy
        } else {
            edge.node2_policy
        };
        policy.map(|p| p.fee_rate_milli_msat)
    }
}

#[async_trait::async_trait]
impl NodeClient for LndRestClient {
    async fn get_identity(&self) -> anyhow::Result<NodeIdentity> {
        let info: GetInfoResponse = self
            .with_retry("GetInfo", || self.get_json("/v1/getinfo"))
            .await?;
        Ok(NodeIdentity {
            public_key: info.identity_pubkey,
            alias: non_empty(info.alias),
        })
    }

    async fn get_channels(&self) -> anyhow::Result<Vec<ChannelProperties>> {
        let channels: ListChannelsResponse = self
            .with_retry("ListChannels", || {
                self.get_json("/v1/channels?peer_alias_lookup=true")
            })
            .await?;
        let fees: FeeReportResponse = self
            .with_retry("FeeReport", || self.get_json("/v1/fees"))
            .await?;

        let fee_by_channel: HashMap<&str, (u64, u64)> = fees
            .channel_fees
            .iter()
            .map(|f| (f.chan_id.as_str(), (f.base_fee_msat, f.fee_per_mil)))
            .collect();

        let now = Utc::now();
        let mut result = Vec::with_capacity(channels.channels.len());
        for channel in channels.channels {
            let (base_fee_msat, fee_rate) = fee_by_channel
                .get(channel.chan_id.as_str())
                .copied()
                .unwrap_or((0, 0));
            // Edge lookups can fail for fresh channels not yet in the graph.
            let partner_fee_rate = self.partner_fee_rate(&channel).await;
            // ListChannels has no open timestamp; lifetime only counts
            // monitored seconds, so this is a lower bound on the age.
            let opened_at = now - Duration::seconds(channel.lifetime);
            result.push(ChannelProperties {
                id: channel.chan_id,
                partner_alias: non_empty(channel.peer_alias),
                capacity: channel.capacity,
                local_balance: channel.local_balance,
                fee_rate,
                base_fee_msat,
                partner_fee_rate,
                opened_at,
            });
        }
        Ok(result)
    }

    async fn get_forwards(
        &self,
        after: DateTime<Utc>,
        before: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Forward>> {
        let mut forwards = Vec::new();
        let mut index_offset = 0u32;
        loop {
            let body = serde_json::json!({
                "start_time": after.timestamp().to_string(),
                "end_time": before.timestamp().to_string(),
                "index_offset": index_offset,
                "num_max_events": PAGE_SIZE,
            });
            let page: ForwardingHistoryResponse = self
                .with_retry("ForwardingHistory", || self.post_json("/v1/switch", &body))
                .await?;

            let count = page.forwarding_events.len();
            index_offset = page.last_offset_index;
            for event in page.forwarding_events {
                forwards.push(event.into_forward()?);
            }
            if count < PAGE_SIZE {
                break;
            }
        }
        forwards.sort_by_key(|f| f.created_at);
        Ok(forwards)
    }

    async fn get_payments(
        &self,
        after: DateTime<Utc>,
        before: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Payment>> {
        let mut payments = Vec::new();
        let mut index_offset = 0u64;
        loop {
            let path = format!(
                "/v1/payments?include_incomplete=true&creation_date_start={}&creation_date_end={}&max_payments={}&index_offset={}",
                after.timestamp(),
                before.timestamp(),
                PAGE_SIZE,
                index_offset,
            );
            let page: ListPaymentsResponse = self
                .with_retry("ListPayments", || self.get_json(&path))
                .await?;

            let count = page.payments.len();
            index_offset = page.last_index_offset;
            for payment in page.payments {
                payments.push(payment.into_payment()?);
            }
            if count < PAGE_SIZE {
                break;
            }
        }
        payments.sort_by_key(|p| p.created_at);
        Ok(payments)
    }

    async fn delete_payment(&self, id: &str) -> anyhow::Result<()> {
        self.with_retry("DeletePayment", || async {
            self.http
                .delete(format!(
                    "{}/v1/payment?payment_hash={}&failed_htlcs_only=false",
                    self.base_url, id
                ))
                .send()
                .await?
                .error_for_status()?;
            Ok(())
        })
        .await
    }
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

/// LND's REST API serializes 64-bit numbers as JSON strings.
fn number_from_string<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: std::str::FromStr + Default,
    T::Err: std::fmt::Display,
{
    match Option::<String>::deserialize(deserializer)? {
        Some(s) if !s.is_empty() => s.parse().map_err(serde::de::Error::custom),
        _ => Ok(T::default()),
    }
}

fn timestamp_from_ns(ns: u64) -> anyhow::Result<DateTime<Utc>> {
    DateTime::from_timestamp((ns / 1_000_000_000) as i64, (ns % 1_000_000_000) as u32)
        .context("timestamp out of range")
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct GetInfoResponse {
    identity_pubkey: String,
    #[serde(default)]
    alias: String,
}

#[derive(Debug, Deserialize)]
struct ListChannelsResponse {
    #[serde(default)]
    channels: Vec<RpcChannel>,
}

#[derive(Debug, Deserialize)]
struct RpcChannel {
    chan_id: String,
    #[serde(default)]
    remote_pubkey: String,
    #[serde(default)]
    peer_alias: String,
    #[serde(default, deserialize_with = "number_from_string")]
    capacity: u64,
    #[serde(default, deserialize_with = "number_from_string")]
    local_balance: u64,
    #[serde(default, deserialize_with = "number_from_string")]
    lifetime: i64,
}

#[derive(Debug, Deserialize)]
struct FeeReportResponse {
    #[serde(default)]
    channel_fees: Vec<ChannelFeeReport>,
}

#[derive(Debug, Deserialize)]
struct ChannelFeeReport {
    chan_id: String,
    #[serde(default, deserialize_with = "number_from_string")]
    base_fee_msat: u64,
    #[serde(default, deserialize_with = "number_from_string")]
    fee_per_mil: u64,
}

#[derive(Debug, Deserialize)]
struct ChannelEdge {
    #[serde(default)]
    node1_pub: String,
    #[serde(default)]
    node2_pub: String,
    node1_policy: Option<RoutingPolicy>,
    node2_policy: Option<RoutingPolicy>,
}

#[derive(Debug, Deserialize)]
struct RoutingPolicy {
    #[serde(default, deserialize_with = "number_from_string")]
    fee_rate_milli_msat: u64,
}

#[derive(Debug, Deserialize)]
struct ForwardingHistoryResponse {
    #[serde(default)]
    forwarding_events: Vec<ForwardingEvent>,
    // uint32, so a plain JSON number (only 64-bit fields arrive as strings)
    #[serde(default)]
    last_offset_index: u32,
}

#[derive(Debug, Deserialize)]
struct ForwardingEvent {
    #[serde(default, deserialize_with = "number_from_string")]
    timestamp_ns: u64,
    #[serde(default)]
    chan_id_in: String,
    #[serde(default)]
    chan_id_out: String,
    #[serde(default, deserialize_with = "number_from_string")]
    amt_out: u64,
    #[serde(default, deserialize_with = "number_from_string")]
    fee_msat: u64,
}

impl ForwardingEvent {
    fn into_forward(self) -> anyhow::Result<Forward> {
        Ok(Forward {
            created_at: timestamp_from_ns(self.timestamp_ns)?,
            tokens: self.amt_out,
            fee_msat: self.fee_msat,
            incoming_channel: self.chan_id_in,
            outgoing_channel: self.chan_id_out,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ListPaymentsResponse {
    #[serde(default)]
    payments: Vec<RpcPayment>,
    #[serde(default, deserialize_with = "number_from_string")]
    last_index_offset: u64,
}

#[derive(Debug, Deserialize)]
struct RpcPayment {
    payment_hash: String,
    #[serde(default, deserialize_with = "number_from_string")]
    value_sat: u64,
    #[serde(default, deserialize_with = "number_from_string")]
    fee_msat: u64,
    #[serde(default, deserialize_with = "number_from_string")]
    creation_time_ns: u64,
    #[serde(default)]
    status: String,
    #[serde(default)]
    htlcs: Vec<RpcHtlc>,
}

#[derive(Debug, Deserialize)]
struct RpcHtlc {
    #[serde(default)]
    status: String,
    route: Option<RpcRoute>,
}

#[derive(Debug, Deserialize)]
struct RpcRoute {
    #[serde(default)]
    hops: Vec<RpcHop>,
}

#[derive(Debug, Deserialize)]
struct RpcHop {
    #[serde(default)]
    chan_id: String,
    #[serde(default)]
    pub_key: String,
}

impl RpcPayment {
    fn into_payment(self) -> anyhow::Result<Payment> {
        let state = match self.status.as_str() {
            "SUCCEEDED" => PaymentState::Succeeded,
            "FAILED" => PaymentState::Failed,
            _ => PaymentState::Pending,
        };
        // Hops of the settled attempt; multi-part payments contribute their
        // first settled shard's route.
        let hops = self
            .htlcs
            .iter()
            .find(|htlc| htlc.status == "SUCCEEDED")
            .and_then(|htlc| htlc.route.as_ref())
            .map(|route| {
                route
                    .hops
                    .iter()
                    .map(|hop| Hop {
                        channel: hop.chan_id.clone(),
                        public_key: hop.pub_key.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(Payment {
            id: self.payment_hash,
            created_at: timestamp_from_ns(self.creation_time_ns)?,
            tokens: self.value_sat,
            fee_msat: self.fee_msat,
            state,
            hops,
        })
    }
}

// ---------------------------------------------------------------------------
// Mock client for testing
// ---------------------------------------------------------------------------

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Mock node client returning preset data and recording deletions.
    pub struct MockNodeClient {
        pub identity: NodeIdentity,
        pub channels: Vec<ChannelProperties>,
        pub forwards: Vec<Forward>,
        pub payments: Vec<Payment>,
        pub delete_payment_calls: Arc<Mutex<Vec<String>>>,
    }

    impl MockNodeClient {
        pub fn new() -> Self {
            Self {
                identity: NodeIdentity {
                    public_key:
                        "02aa00000000000000000000000000000000000000000000000000000000000000"
                            .to_string(),
                    alias: Some("mock-node".to_string()),
                },
                channels: Vec::new(),
                forwards: Vec::new(),
                payments: Vec::new(),
                delete_payment_calls: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    #[async_trait::async_trait]
    impl NodeClient for MockNodeClient {
        async fn get_identity(&self) -> anyhow::Result<NodeIdentity> {
            Ok(self.identity.clone())
        }

        async fn get_channels(&self) -> anyhow::Result<Vec<ChannelProperties>> {
            Ok(self.channels.clone())
        }

        async fn get_forwards(
            &self,
            after: DateTime<Utc>,
            before: DateTime<Utc>,
        ) -> anyhow::Result<Vec<Forward>> {
            Ok(self
                .forwards
                .iter()
                .filter(|f| f.created_at >= after && f.created_at <= before)
                .cloned()
                .collect())
        }

        async fn get_payments(
            &self,
            after: DateTime<Utc>,
            before: DateTime<Utc>,
        ) -> anyhow::Result<Vec<Payment>> {
            Ok(self
                .payments
                .iter()
                .filter(|p| p.created_at >= after && p.created_at <= before)
                .cloned()
                .collect())
        }

        async fn delete_payment(&self, id: &str) -> anyhow::Result<()> {
            self.delete_payment_calls
                .lock()
                .unwrap()
                .push(id.to_string());
            Ok(())
        }
    }
}
