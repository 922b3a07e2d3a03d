use crate::client::NodeClient;
use chrono::{DateTime, Duration, Utc};
use log::debug;

/// Identity of the node under advisement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    pub public_key: String,
    pub alias: Option<String>,
}

/// Immutable per-channel facts at snapshot time.
///
/// Amounts are satoshis; `base_fee_msat` is millisatoshis; `fee_rate` and
/// `partner_fee_rate` are ppm.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelProperties {
    pub id: String,
    pub partner_alias: Option<String>,
    pub capacity: u64,
    pub local_balance: u64,
    /// Our current outbound fee rate
    pub fee_rate: u64,
    /// Our current outbound base fee
    pub base_fee_msat: u64,
    /// The peer's rate for traffic coming towards us, when known
    pub partner_fee_rate: Option<u64>,
    pub opened_at: DateTime<Utc>,
}

/// A settled forward routed through our node.
#[derive(Debug, Clone, PartialEq)]
pub struct Forward {
    pub created_at: DateTime<Utc>,
    /// Tokens delivered on the outgoing side, in satoshis
    pub tokens: u64,
    /// Our routing fee, in millisatoshis
    pub fee_msat: u64,
    pub incoming_channel: String,
    pub outgoing_channel: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentState {
    Succeeded,
    Failed,
    Pending,
}

/// One hop of a payment route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hop {
    pub channel: String,
    pub public_key: String,
}

/// A payment our node initiated.
#[derive(Debug, Clone, PartialEq)]
pub struct Payment {
    pub id: String,
    pub created_at: DateTime<Utc>,
    /// Tokens delivered to the destination, in satoshis
    pub tokens: u64,
    /// Routing fees paid, in millisatoshis
    pub fee_msat: u64,
    pub state: PaymentState,
    /// Hops of the settled route; empty for payments that never settled
    pub hops: Vec<Hop>,
}

impl Payment {
    /// A payment whose final hop lands back on our own node shifted balance
    /// between two of our channels rather than paying anyone.
    pub fn is_rebalance(&self, own_key: &str) -> bool {
        self.hops.last().map(|h| h.public_key == own_key).unwrap_or(false)
    }

    /// The channel the payment left through.
    pub fn out_channel(&self) -> Option<&str> {
        self.hops.first().map(|h| h.channel.as_str())
    }

    /// The channel a rebalance came back in on.
    pub fn in_channel(&self) -> Option<&str> {
        self.hops.last().map(|h| h.channel.as_str())
    }
}

/// Everything the engine needs, fetched at one instant.
///
/// A refresh produces a whole new snapshot; nothing here is ever mutated.
#[derive(Debug, Clone)]
pub struct NodeSnapshot {
    pub identity: NodeIdentity,
    pub channels: Vec<ChannelProperties>,
    /// Forwards within the window, as reported by the node
    pub forwards: Vec<Forward>,
    /// Own payments within the window, including failed ones
    pub payments: Vec<Payment>,
    pub days: u32,
}

impl NodeSnapshot {
    /// Collect a fresh snapshot over the rolling window ending now.
    pub async fn collect(client: &(impl NodeClient + Sync), days: u32) -> anyhow::Result<Self> {
        let now = Utc::now();
        let after = now - Duration::days(i64::from(days));

        let identity = client.get_identity().await?;
        let (channels, forwards, payments) = tokio::try_join!(
            client.get_channels(),
            client.get_forwards(after, now),
            client.get_payments(after, now),
        )?;

        debug!(
            "Collected snapshot: {} channels, {} forwards, {} payments over {} days",
            channels.len(),
            forwards.len(),
            payments.len(),
            days,
        );

        Ok(Self {
            identity,
            channels,
            forwards,
            payments,
            days,
        })
    }

    /// Total channel capacity in satoshis.
    pub fn total_capacity(&self) -> u64 {
        self.channels.iter().map(|c| c.capacity).sum()
    }

    /// Total local balance across channels, in satoshis.
    pub fn total_local_balance(&self) -> u64 {
        self.channels.iter().map(|c| c.local_balance).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hop(channel: &str, key: &str) -> Hop {
        Hop {
            channel: channel.to_string(),
            public_key: key.to_string(),
        }
    }

    #[test]
    fn test_rebalance_detected_by_final_hop() {
        let payment = Payment {
            id: "p1".to_string(),
            created_at: Utc::now(),
            tokens: 10_000,
            fee_msat: 5_000,
            state: PaymentState::Succeeded,
            hops: vec![hop("ch_out", "peer_a"), hop("ch_in", "our_key")],
        };
        assert!(payment.is_rebalance("our_key"));
        assert!(!payment.is_rebalance("someone_else"));
        assert_eq!(payment.out_channel(), Some("ch_out"));
        assert_eq!(payment.in_channel(), Some("ch_in"));
    }

    #[test]
    fn test_payment_without_hops() {
        let payment = Payment {
            id: "p2".to_string(),
            created_at: Utc::now(),
            tokens: 10_000,
            fee_msat: 0,
            state: PaymentState::Failed,
            hops: Vec::new(),
        };
        assert!(!payment.is_rebalance("our_key"));
        assert_eq!(payment.out_channel(), None);
    }
}
