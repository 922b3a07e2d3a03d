use super::{distance, priority, Action, Entity, Variable};
use crate::config::ActionsConfig;
use crate::stats::{ChannelStats, NodeStats};
use std::collections::BTreeMap;

/// Compute the balance action for one channel.
///
/// The target follows the observed flow: a channel that mostly sends should
/// hold most of its capacity locally, one that mostly receives should stay
/// near empty. Floors, ceilings and forward headroom clamp the result.
pub(crate) fn channel_balance_action(stats: &ChannelStats, config: &ActionsConfig) -> Action {
    let properties = &stats.properties;
    let capacity = properties.capacity;
    let in_sum = stats.in_forwards.total_tokens;
    let out_sum = stats.out_forwards.total_tokens;
    let forwards = stats.in_forwards.count + stats.out_forwards.count;

    let half = (0.5 * capacity as f64).round() as i64;

    let (target, reason) = if forwards < config.min_channel_forwards || in_sum + out_sum == 0 {
        (
            half,
            format!(
                "Not enough forwards to predict the flow ({} of {} needed), aiming for half the capacity.",
                forwards, config.min_channel_forwards
            ),
        )
    } else {
        let out_fraction = out_sum as f64 / (in_sum + out_sum) as f64;
        let optimal = (out_fraction * capacity as f64).round() as i64;

        let margin = 1.0 + config.largest_forward_margin_fraction;
        let min_forward_balance = (stats.out_forwards.max_tokens as f64 * margin).round() as i64;
        let max_forward_balance =
            (capacity as f64 - stats.in_forwards.max_tokens as f64 * margin).round() as i64;

        if min_forward_balance > max_forward_balance {
            // TODO: suggest a capacity increase when the largest forwards in
            // both directions no longer fit into the channel together.
            (
                half,
                "The largest in and out forwards no longer fit together, aiming for half the capacity.".to_string(),
            )
        } else {
            let min_balance = (config.min_channel_balance_fraction * capacity as f64).round() as i64;
            let max_balance = capacity as i64 - min_balance;

            let target = if optimal < min_balance {
                min_balance
            } else if optimal > max_balance {
                max_balance
            } else if optimal < min_forward_balance {
                min_forward_balance
            } else if optimal > max_forward_balance {
                max_forward_balance
            } else {
                optimal
            };
            (
                target,
                format!(
                    "{:.0}% of the forwarded tokens left through this channel.",
                    out_fraction * 100.0
                ),
            )
        }
    };

    let dist = distance(properties.local_balance, target as u64, capacity);
    Action {
        entity: Entity::Channel,
        id: Some(properties.id.clone()),
        alias: properties.partner_alias.clone(),
        priority: priority(1, dist, config.min_rebalance_distance),
        variable: Variable::Balance,
        actual: properties.local_balance as i64,
        target,
        max: capacity as i64,
        reason,
    }
}

/// Aggregate balance action across all channels.
pub(crate) fn node_balance_action(
    stats: &NodeStats,
    targets: &BTreeMap<&str, u64>,
    config: &ActionsConfig,
) -> Action {
    let actual: u64 = stats
        .channels
        .values()
        .map(|c| c.properties.local_balance)
        .sum();
    let target: u64 = targets.values().sum();
    let max: u64 = stats.channels.values().map(|c| c.properties.capacity).sum();

    let dist = distance(actual, target, max);
    Action {
        entity: Entity::Node,
        id: None,
        alias: None,
        priority: priority(4, dist, config.min_rebalance_distance),
        variable: Variable::Balance,
        actual: actual as i64,
        target: target as i64,
        max: max as i64,
        reason: "Sum of target balances of all channels.".to_string(),
    }
}
