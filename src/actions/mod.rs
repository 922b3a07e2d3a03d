pub mod balance;
pub mod fees;

use crate::config::ActionsConfig;
use crate::error::EngineError;
use crate::stats::NodeStats;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Entity {
    Channel,
    Node,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Variable {
    #[serde(rename = "balance")]
    Balance,
    #[serde(rename = "feeRate")]
    FeeRate,
}

/// One recommendation. Emitted, never executed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub entity: Entity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    pub priority: u32,
    pub variable: Variable,
    pub actual: i64,
    pub target: i64,
    pub max: i64,
    pub reason: String,
}

/// Normalized signed offset of a balance from its target, in [-1, 1].
///
/// The denominator differs on the two sides of the target so that a channel
/// with a target away from 50% still maps its extremes to -1 and +1. A zero
/// target yields NaN below it; callers guard the degenerate case.
pub(crate) fn distance(balance: u64, target: u64, capacity: u64) -> f64 {
    if balance <= target {
        balance as f64 / target as f64 - 1.0
    } else {
        (balance - target) as f64 / (capacity - target) as f64
    }
}

/// Priority bands: one band per `min_rebalance_distance` of offset. A NaN or
/// sub-band distance collapses to 0, which suppresses the action.
pub(crate) fn priority(base: u32, distance: f64, min_rebalance_distance: f64) -> u32 {
    let bands = (distance.abs() / min_rebalance_distance).floor();
    if bands.is_finite() && bands >= 0.0 {
        base.saturating_mul(bands.min(f64::from(u32::MAX)) as u32)
    } else {
        0
    }
}

/// The recommendation engine. Pure and synchronous: construction validates
/// config and snapshot invariants, `get` derives the action stream.
#[derive(Debug)]
pub struct Actions<'a> {
    config: &'a ActionsConfig,
    stats: &'a NodeStats,
}

impl<'a> Actions<'a> {
    pub fn new(config: &'a ActionsConfig, stats: &'a NodeStats) -> Result<Self, EngineError> {
        config.validate(stats.days)?;
        Self::check_invariants(stats)?;
        Ok(Self { config, stats })
    }

    fn check_invariants(stats: &NodeStats) -> Result<(), EngineError> {
        for (id, channel) in &stats.channels {
            let capacity = channel.properties.capacity;
            if capacity == 0 {
                return Err(EngineError::SnapshotInvariant(format!(
                    "channel {} has zero capacity",
                    id
                )));
            }
            if channel.properties.local_balance > capacity {
                return Err(EngineError::SnapshotInvariant(format!(
                    "channel {}: local balance {} exceeds capacity {}",
                    id, channel.properties.local_balance, capacity
                )));
            }
            let mut previous: Option<DateTime<Utc>> = None;
            for change in &channel.history {
                if change.balance() > capacity {
                    return Err(EngineError::SnapshotInvariant(format!(
                        "channel {}: history balance {} exceeds capacity {}",
                        id,
                        change.balance(),
                        capacity
                    )));
                }
                if let Some(previous) = previous {
                    if change.time() > previous {
                        return Err(EngineError::SnapshotInvariant(format!(
                            "channel {}: history is not ordered latest-first",
                            id
                        )));
                    }
                }
                previous = Some(change.time());
            }
        }
        Ok(())
    }

    /// Derive the full action stream: per-channel balance actions, then the
    /// node-level balance sum, then per-channel fee actions. Actions whose
    /// priority collapsed to 0 are filtered out; the order within each group
    /// follows the channel map.
    pub fn get(&self, now: DateTime<Utc>) -> Result<Vec<Action>, EngineError> {
        let mut targets: BTreeMap<&str, u64> = BTreeMap::new();
        let mut emitted = Vec::new();

        for (id, channel) in &self.stats.channels {
            let action = balance::channel_balance_action(channel, self.config);
            targets.insert(id.as_str(), action.target as u64);
            if action.priority > 0 {
                emitted.push(action);
            }
        }

        if !self.stats.channels.is_empty() {
            let action = balance::node_balance_action(self.stats, &targets, self.config);
            if action.priority > 0 {
                emitted.push(action);
            }
        }

        for channel in self.stats.channels.values() {
            if let Some(action) =
                fees::channel_fee_action(channel, self.stats, &targets, self.config, now)?
            {
                emitted.push(action);
            }
        }

        Ok(emitted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::Change;
    use crate::state::ChannelProperties;
    use crate::stats::{ChannelStats, ForwardStats};
    use chrono::TimeZone;

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, minute, 0).unwrap()
    }

    fn props(id: &str, capacity: u64, local_balance: u64) -> ChannelProperties {
        ChannelProperties {
            id: id.to_string(),
            partner_alias: Some(format!("peer_{}", id)),
            capacity,
            local_balance,
            fee_rate: 100,
            base_fee_msat: 0,
            partner_fee_rate: None,
            opened_at: at(0),
        }
    }

    fn quiet_channel(id: &str, capacity: u64, local_balance: u64) -> ChannelStats {
        ChannelStats {
            in_forwards: ForwardStats::default(),
            out_forwards: ForwardStats::default(),
            history: Vec::new(),
            properties: props(id, capacity, local_balance),
        }
    }

    fn node_stats(channels: Vec<ChannelStats>) -> NodeStats {
        NodeStats {
            days: 30,
            channels: channels
                .into_iter()
                .map(|c| (c.properties.id.clone(), c))
                .collect(),
        }
    }

    #[test]
    fn test_distance_zero_at_target() {
        assert_eq!(distance(500_000, 500_000, 1_000_000), 0.0);
        assert_eq!(distance(250_000, 250_000, 1_000_000), 0.0);
    }

    #[test]
    fn test_distance_extremes() {
        assert_eq!(distance(0, 500_000, 1_000_000), -1.0);
        assert_eq!(distance(1_000_000, 500_000, 1_000_000), 1.0);
        // Asymmetric target: extremes still map to -1 and +1.
        assert_eq!(distance(0, 250_000, 1_000_000), -1.0);
        assert_eq!(distance(1_000_000, 250_000, 1_000_000), 1.0);
    }

    #[test]
    fn test_distance_asymmetric_normalization() {
        // Below a 250k target, half way = -0.5; above, half of the 750k room.
        assert_eq!(distance(125_000, 250_000, 1_000_000), -0.5);
        assert_eq!(distance(625_000, 250_000, 1_000_000), 0.5);
    }

    #[test]
    fn test_priority_bands() {
        assert_eq!(priority(1, 0.0, 0.05), 0);
        assert_eq!(priority(1, 0.04, 0.05), 0);
        assert_eq!(priority(1, 0.12, 0.05), 2);
        assert_eq!(priority(1, 1.0, 0.05), 20);
        assert_eq!(priority(4, 1.0, 0.05), 80);
        assert_eq!(priority(1, f64::NAN, 0.05), 0);
    }

    #[test]
    fn test_action_json_round_trip() {
        let action = Action {
            entity: Entity::Channel,
            id: Some("748x1x0".to_string()),
            alias: Some("peer".to_string()),
            priority: 4,
            variable: Variable::FeeRate,
            actual: 100,
            target: 140,
            max: 2500,
            reason: "test".to_string(),
        };
        let json = serde_json::to_string(&action).unwrap();
        assert!(json.contains("\"feeRate\""));
        let back: Action = serde_json::from_str(&json).unwrap();
        assert_eq!(action, back);

        let node_action = Action {
            entity: Entity::Node,
            id: None,
            alias: None,
            priority: 8,
            variable: Variable::Balance,
            actual: 1,
            target: 2,
            max: 3,
            reason: "Sum of target balances of all channels.".to_string(),
        };
        let json = serde_json::to_string(&node_action).unwrap();
        assert!(!json.contains("\"id\""));
        let back: Action = serde_json::from_str(&json).unwrap();
        assert_eq!(node_action, back);
    }

    #[test]
    fn test_new_rejects_unordered_history() {
        let mut channel = quiet_channel("a", 1_000_000, 500_000);
        channel.history = vec![
            Change::OutForward {
                time: at(10),
                amount: 1_000,
                fee_msat: 0,
                balance: 500_000,
                in_channel: None,
            },
            Change::OutForward {
                time: at(20),
                amount: 1_000,
                fee_msat: 0,
                balance: 501_000,
                in_channel: None,
            },
        ];
        let stats = node_stats(vec![channel]);
        let config = ActionsConfig::default();
        let err = Actions::new(&config, &stats).unwrap_err();
        assert!(matches!(err, EngineError::SnapshotInvariant(_)));
    }

    #[test]
    fn test_new_rejects_balance_beyond_capacity() {
        let mut channel = quiet_channel("a", 1_000_000, 500_000);
        channel.history = vec![Change::OutForward {
            time: at(10),
            amount: 1_000,
            fee_msat: 0,
            balance: 1_500_000,
            in_channel: None,
        }];
        let stats = node_stats(vec![channel]);
        let config = ActionsConfig::default();
        assert!(Actions::new(&config, &stats).is_err());
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let stats = node_stats(vec![]);
        let mut config = ActionsConfig::default();
        config.min_rebalance_distance = 0.0;
        let err = Actions::new(&config, &stats).unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn test_emission_order_and_priorities() {
        // Two skewed channels plus one balanced one (which gets filtered).
        // The totals are skewed too, so the node-level action survives.
        let stats = node_stats(vec![
            quiet_channel("a", 1_000_000, 0),
            quiet_channel("b", 1_000_000, 500_000),
            quiet_channel("c", 1_000_000, 900_000),
        ]);
        let config = ActionsConfig::default();
        let actions = Actions::new(&config, &stats)
            .unwrap()
            .get(at(30))
            .unwrap();

        // Every emitted action carries a positive priority.
        assert!(actions.iter().all(|a| a.priority >= 1));

        // Channel balance actions precede the node action, which precedes
        // any fee action.
        let node_pos = actions
            .iter()
            .position(|a| a.entity == Entity::Node)
            .expect("node action expected");
        for (i, action) in actions.iter().enumerate() {
            match action.variable {
                Variable::Balance if action.entity == Entity::Channel => assert!(i < node_pos),
                Variable::Balance => assert_eq!(i, node_pos),
                Variable::FeeRate => assert!(i > node_pos),
            }
        }

        // The balanced channel's action was filtered.
        assert!(actions
            .iter()
            .filter(|a| a.variable == Variable::Balance)
            .all(|a| a.id.as_deref() != Some("b")));
    }

    #[test]
    fn test_get_is_idempotent() {
        let stats = node_stats(vec![
            quiet_channel("a", 1_000_000, 100_000),
            quiet_channel("b", 2_000_000, 1_900_000),
        ]);
        let config = ActionsConfig::default();
        let engine = Actions::new(&config, &stats).unwrap();
        let first = engine.get(at(30)).unwrap();
        let second = engine.get(at(30)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_empty_node_yields_nothing() {
        let stats = node_stats(vec![]);
        let config = ActionsConfig::default();
        let actions = Actions::new(&config, &stats).unwrap().get(at(30)).unwrap();
        assert!(actions.is_empty());
    }
}
