use crate::error::EngineError;
use crate::history::{self, Change};
use crate::state::{ChannelProperties, NodeSnapshot};
use std::collections::BTreeMap;

/// Aggregate over the forwards of one direction on one channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwardStats {
    pub count: u32,
    pub total_tokens: u64,
    /// Largest single forward seen in the window
    pub max_tokens: u64,
}

impl ForwardStats {
    fn record(&mut self, tokens: u64) {
        self.count += 1;
        self.total_tokens += tokens;
        self.max_tokens = self.max_tokens.max(tokens);
    }
}

/// Everything the engine knows about one channel.
#[derive(Debug, Clone)]
pub struct ChannelStats {
    pub in_forwards: ForwardStats,
    pub out_forwards: ForwardStats,
    /// Latest-first change timeline
    pub history: Vec<Change>,
    pub properties: ChannelProperties,
}

/// The engine's input: per-channel statistics over a rolling window.
#[derive(Debug, Clone)]
pub struct NodeStats {
    pub days: u32,
    pub channels: BTreeMap<String, ChannelStats>,
}

impl NodeStats {
    /// Project a snapshot into per-channel statistics.
    pub fn build(snapshot: &NodeSnapshot) -> Result<Self, EngineError> {
        let mut histories = history::build(snapshot)?;

        let mut channels = BTreeMap::new();
        for properties in &snapshot.channels {
            let history = histories.remove(&properties.id).unwrap_or_default();

            let mut in_forwards = ForwardStats::default();
            let mut out_forwards = ForwardStats::default();
            for change in &history {
                match change {
                    Change::InForward { .. } => in_forwards.record(change.amount().unsigned_abs()),
                    Change::OutForward { .. } => out_forwards.record(change.amount().unsigned_abs()),
                    _ => {}
                }
            }

            channels.insert(
                properties.id.clone(),
                ChannelStats {
                    in_forwards,
                    out_forwards,
                    history,
                    properties: properties.clone(),
                },
            );
        }

        Ok(Self {
            days: snapshot.days,
            channels,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Forward, NodeIdentity};
    use chrono::{DateTime, TimeZone, Utc};

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, minute, 0).unwrap()
    }

    fn channel(id: &str, capacity: u64, local_balance: u64) -> ChannelProperties {
        ChannelProperties {
            id: id.to_string(),
            partner_alias: None,
            capacity,
            local_balance,
            fee_rate: 100,
            base_fee_msat: 0,
            partner_fee_rate: None,
            opened_at: at(0),
        }
    }

    fn forward(minute: u32, tokens: u64, from: &str, to: &str) -> Forward {
        Forward {
            created_at: at(minute),
            tokens,
            fee_msat: 0,
            incoming_channel: from.to_string(),
            outgoing_channel: to.to_string(),
        }
    }

    fn snapshot() -> NodeSnapshot {
        NodeSnapshot {
            identity: NodeIdentity {
                public_key: "own".to_string(),
                alias: None,
            },
            channels: vec![
                channel("a", 1_000_000, 400_000),
                channel("b", 1_000_000, 600_000),
            ],
            forwards: vec![
                forward(10, 50_000, "a", "b"),
                forward(20, 30_000, "a", "b"),
                forward(25, 20_000, "b", "a"),
            ],
            payments: vec![],
            days: 30,
        }
    }

    #[test]
    fn test_directional_aggregates() {
        let stats = NodeStats::build(&snapshot()).unwrap();

        let a = &stats.channels["a"];
        assert_eq!(a.in_forwards.count, 2);
        assert_eq!(a.in_forwards.total_tokens, 80_000);
        assert_eq!(a.in_forwards.max_tokens, 50_000);
        assert_eq!(a.out_forwards.count, 1);
        assert_eq!(a.out_forwards.total_tokens, 20_000);

        let b = &stats.channels["b"];
        assert_eq!(b.out_forwards.count, 2);
        assert_eq!(b.out_forwards.total_tokens, 80_000);
        assert_eq!(b.out_forwards.max_tokens, 50_000);
        assert_eq!(b.in_forwards.count, 1);
    }

    #[test]
    fn test_history_attached_latest_first() {
        let stats = NodeStats::build(&snapshot()).unwrap();
        let a = &stats.channels["a"];
        assert_eq!(a.history.len(), 3);
        assert!(a.history[0].time() > a.history[1].time());
        assert!(a.history[1].time() > a.history[2].time());
    }

    #[test]
    fn test_channel_without_events() {
        let mut snap = snapshot();
        snap.forwards.clear();
        let stats = NodeStats::build(&snap).unwrap();
        let a = &stats.channels["a"];
        assert_eq!(a.in_forwards, ForwardStats::default());
        assert!(a.history.is_empty());
    }

    #[test]
    fn test_days_carried_over() {
        let stats = NodeStats::build(&snapshot()).unwrap();
        assert_eq!(stats.days, 30);
    }
}
