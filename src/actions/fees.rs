use super::{distance, Action, Entity, Variable};
use crate::config::ActionsConfig;
use crate::error::EngineError;
use crate::history::Change;
use crate::state::ChannelProperties;
use crate::stats::{ChannelStats, NodeStats};
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;

const MS_PER_DAY: f64 = 86_400_000.0;

/// Forwards younger than this are treated as an emergency signal and get the
/// full increase immediately instead of the elapsed-time scaling.
const RECENT_FORWARD_MS: i64 = 5 * 60 * 1000;

/// Floor for increased fee rates; increasing a near-zero rate by a fraction
/// of itself would change nothing.
const MIN_INCREASED_FEE_RATE: i64 = 30;

/// Fee rate in ppm implied by a fee on an amount. Fees are millisatoshis,
/// amounts satoshis.
fn rate_ppm(fee_msat: i64, amount_sat: i64) -> f64 {
    fee_msat as f64 / (amount_sat as f64 * 1000.0) * 1_000_000.0
}

fn fee_action(
    properties: &ChannelProperties,
    config: &ActionsConfig,
    target: i64,
    reason: String,
) -> Action {
    Action {
        entity: Entity::Channel,
        id: Some(properties.id.clone()),
        alias: properties.partner_alias.clone(),
        priority: 1,
        variable: Variable::FeeRate,
        actual: properties.fee_rate as i64,
        target,
        max: config.max_fee_rate as i64,
        reason,
    }
}

/// Compute the fee action for one channel, if any.
///
/// `targets` carries the balance targets of every channel as computed by the
/// balance pass; the inflow analysis needs the feeder channels' targets too.
pub(crate) fn channel_fee_action(
    stats: &ChannelStats,
    node: &NodeStats,
    targets: &BTreeMap<&str, u64>,
    config: &ActionsConfig,
    now: DateTime<Utc>,
) -> Result<Option<Action>, EngineError> {
    let properties = &stats.properties;
    let target = targets
        .get(properties.id.as_str())
        .copied()
        .ok_or_else(|| {
            EngineError::Computation(format!("no balance target for channel {}", properties.id))
        })?;
    let current_distance = distance(properties.local_balance, target, properties.capacity);

    let last_out_time = stats.history.iter().find_map(|change| match change {
        Change::OutForward { time, .. } => Some(*time),
        _ => None,
    });

    let (last_out_time, last_out_rate) = match (last_out_time, last_out_fee_rate(stats, config)) {
        (Some(time), Some(rate)) => (time, rate),
        // Without a usable outbound fee rate the flow tells us nothing;
        // fall back to the all-or-nothing pricing for stale channels.
        _ => return Ok(stale_channel_action(stats, target, config, now, node.days)),
    };

    if current_distance <= -config.min_fee_increase_distance {
        // Deep under target: raise the fee beyond what the forwards that
        // drained the channel paid.
        let new_rate = max_increase_rate(
            &stats.history,
            properties,
            target,
            config,
            now,
            node.days,
        )?;
        if new_rate > properties.fee_rate as i64 {
            let reason = format!(
                "Local balance {} is far below the target of {} sat.",
                properties.local_balance, target
            );
            return Ok(Some(fee_action(properties, config, new_rate, reason)));
        }
    } else {
        // How long has the channel been out of the danger zone?
        let mut not_below = 0usize;
        let mut not_below_start: Option<DateTime<Utc>> = None;
        for change in &stats.history {
            let d = distance(change.balance(), target, properties.capacity);
            if d > -config.min_fee_increase_distance {
                not_below_start = Some(change.time());
                not_below += 1;
            } else {
                break;
            }
        }

        let outcome = match not_below_start {
            Some(start) if start > last_out_time => {
                // Nothing left the channel since it recovered. Decrease from
                // the rate an increase would have set at the recovery point.
                let reconstructed = max_increase_rate(
                    &stats.history[not_below..],
                    properties,
                    target,
                    config,
                    start,
                    node.days,
                )?;
                try_decrease(stats, config, reconstructed, now - start, node.days)
            }
            _ => try_decrease(stats, config, last_out_rate, now - last_out_time, node.days),
        };
        if outcome.attempted {
            return Ok(outcome.action);
        }
    }

    if current_distance <= -config.min_rebalance_distance {
        return inflow_increase(stats, node, targets, config, current_distance, last_out_rate);
    }

    Ok(None)
}

/// Fee rate of the most recent outbound forwards, provided they moved enough
/// of the capacity to be meaningful.
///
/// A forward is included while the forwards accumulated before it still fall
/// short of the threshold, so the forward crossing the threshold is the last
/// one in.
fn last_out_fee_rate(stats: &ChannelStats, config: &ActionsConfig) -> Option<i64> {
    let min_amount = config.min_out_fee_forward_fraction * stats.properties.capacity as f64;

    let mut total = 0i64;
    let mut fees = 0i64;
    let mut count = 0i64;
    for change in stats
        .history
        .iter()
        .filter(|change| matches!(change, Change::OutForward { .. }))
    {
        if total as f64 >= min_amount {
            break;
        }
        total += change.amount();
        fees += change.fee_msat() as i64;
        count += 1;
    }

    if count == 0 || (total as f64) < min_amount {
        return None;
    }
    let base = stats.properties.base_fee_msat as i64;
    Some(rate_ppm(fees - count * base, total).round() as i64)
}

/// The most aggressive justified increase, derived from the outbound forwards
/// that happened while the channel sat below bounds.
///
/// Each such forward is a distinct cause of the depletion. Recent forwards
/// demand the full correction at once; older ones scale with the time that
/// has passed since. The maximum over all candidates wins, ties going to the
/// first seen.
fn max_increase_rate(
    history: &[Change],
    properties: &ChannelProperties,
    target: u64,
    config: &ActionsConfig,
    eval_time: DateTime<Utc>,
    days: u32,
) -> Result<i64, EngineError> {
    let mut forwards: Vec<(DateTime<Utc>, i64, u64)> = Vec::new();
    let mut first_distance = None;
    for change in history {
        let d = distance(change.balance(), target, properties.capacity);
        if d > -config.min_fee_increase_distance {
            break;
        }
        if first_distance.is_none() {
            first_distance = Some(d);
        }
        if let Change::OutForward { time, amount, fee_msat, .. } = change {
            forwards.push((*time, *amount, *fee_msat));
        }
    }

    let first_distance = match first_distance {
        Some(d) if !forwards.is_empty() => d,
        _ => {
            return Err(EngineError::Computation(
                "fee increase requested without below-bounds outbound forwards".into(),
            ))
        }
    };
    let raw_fraction = first_distance.abs() - config.min_fee_increase_distance;

    let base = properties.base_fee_msat as i64;
    let mut best = i64::MIN;
    for (time, amount, fee_msat) in forwards {
        let forward_rate = rate_ppm(fee_msat as i64 - base, amount).round();
        let elapsed_ms = (eval_time - time).num_milliseconds();
        let add_fraction = if elapsed_ms < RECENT_FORWARD_MS {
            raw_fraction
        } else {
            let elapsed_days = elapsed_ms as f64 / MS_PER_DAY;
            raw_fraction * (elapsed_days * config.fee_increase_multiplier) / f64::from(days)
        };
        let new_rate = ((forward_rate * (1.0 + add_fraction)).round() as i64)
            .max(MIN_INCREASED_FEE_RATE)
            .min(config.max_fee_rate as i64);
        if new_rate > best {
            best = new_rate;
        }
    }
    Ok(best)
}

struct DecreaseOutcome {
    /// Whether enough idle time had passed for a decrease to be considered
    /// at all. A considered decrease ends the evaluation even when nothing
    /// is emitted.
    attempted: bool,
    action: Option<Action>,
}

/// Linear decay of the fee rate over the idle time, floored by what inbound
/// liquidity costs us.
fn try_decrease(
    stats: &ChannelStats,
    config: &ActionsConfig,
    base_rate: i64,
    elapsed: Duration,
    days: u32,
) -> DecreaseOutcome {
    let idle_days = elapsed.num_milliseconds() as f64 / MS_PER_DAY;
    let elapsed_days = idle_days - config.fee_decrease_wait_days;
    if elapsed_days <= 0.0 {
        return DecreaseOutcome {
            attempted: false,
            action: None,
        };
    }

    let decrease_fraction = elapsed_days / (f64::from(days) - config.fee_decrease_wait_days);
    let candidate = (base_rate as f64 * (1.0 - decrease_fraction)).round() as i64;
    let target = min_fee_rate(stats, config).max(candidate);

    let action = if target < stats.properties.fee_rate as i64 {
        let reason = format!(
            "No meaningful outbound flow for {:.1} days at {} ppm.",
            idle_days, base_rate
        );
        Some(fee_action(&stats.properties, config, target, reason))
    } else {
        None
    };
    DecreaseOutcome {
        attempted: true,
        action,
    }
}

/// Floor for fee decreases: what we recently paid to refill this channel,
/// or the peer's rate towards us, whichever is higher. Ignored when the
/// channel earns most of its keep from inbound forwards.
fn min_fee_rate(stats: &ChannelStats, config: &ActionsConfig) -> i64 {
    let rates: Vec<i64> = stats
        .history
        .iter()
        .filter(|change| matches!(change, Change::InRebalance { .. }))
        .take(3)
        .map(|change| rate_ppm(change.fee_msat() as i64, change.amount().abs()).round() as i64)
        .collect();
    if rates.is_empty() {
        return 0;
    }
    let rebalance_rate = rates.iter().sum::<i64>() as f64 / rates.len() as f64;

    let in_sum = stats.in_forwards.total_tokens;
    let out_sum = stats.out_forwards.total_tokens;
    let inflow_fraction = in_sum as f64 / (in_sum + out_sum) as f64;
    if !inflow_fraction.is_finite() || inflow_fraction > config.min_inflow_fraction {
        return 0;
    }

    let partner_rate = stats.properties.partner_fee_rate.unwrap_or(0) as f64;
    rebalance_rate.max(partner_rate).round() as i64
}

/// All-or-nothing pricing for channels without a usable outbound fee rate:
/// past the window age, price at the cap when depleted, at zero otherwise.
fn stale_channel_action(
    stats: &ChannelStats,
    target: u64,
    config: &ActionsConfig,
    now: DateTime<Utc>,
    days: u32,
) -> Option<Action> {
    let properties = &stats.properties;
    let age_ms = (now - properties.opened_at).num_milliseconds();
    if (age_ms as f64) < f64::from(days) * MS_PER_DAY {
        return None;
    }

    let current_distance = distance(properties.local_balance, target, properties.capacity);
    let (new_rate, reason) = if current_distance <= -config.min_fee_increase_distance {
        (
            config.max_fee_rate as i64,
            "No usable outbound flow and hardly any liquidity left; pricing at the cap."
                .to_string(),
        )
    } else {
        (
            0,
            "No usable outbound flow; dropping the fee to attract forwards.".to_string(),
        )
    };

    if new_rate == properties.fee_rate as i64 {
        return None;
    }
    Some(fee_action(properties, config, new_rate, reason))
}

struct FeederInflow<'a> {
    id: &'a str,
    inflow: i64,
    distance: f64,
    earliest: DateTime<Utc>,
}

/// Raise the fee of a draining channel whose outflow is fed by channels
/// sitting far above their own targets.
fn inflow_increase(
    stats: &ChannelStats,
    node: &NodeStats,
    targets: &BTreeMap<&str, u64>,
    config: &ActionsConfig,
    current_distance: f64,
    last_out_rate: i64,
) -> Result<Option<Action>, EngineError> {
    let properties = &stats.properties;

    let mut feeders: Vec<&str> = Vec::new();
    for change in &stats.history {
        if let Change::OutForward { in_channel: Some(feeder), .. } = change {
            if !feeders.contains(&feeder.as_str()) {
                feeders.push(feeder.as_str());
            }
        }
    }

    let mut flows: Vec<FeederInflow> = Vec::new();
    for feeder_id in feeders {
        let feeder = node.channels.get(feeder_id).ok_or_else(|| {
            EngineError::SnapshotInvariant(format!(
                "channel {} forwarded from unknown channel {}",
                properties.id, feeder_id
            ))
        })?;
        let feeder_target = targets.get(feeder_id).copied().ok_or_else(|| {
            EngineError::Computation(format!("no balance target for channel {}", feeder_id))
        })?;
        let feeder_capacity = feeder.properties.capacity;
        let feeder_distance = distance(
            feeder.properties.local_balance,
            feeder_target,
            feeder_capacity,
        );
        if feeder_distance < config.min_fee_increase_distance {
            continue;
        }

        // Sum what the feeder pushed through us while it was above bounds.
        let mut inflow = 0i64;
        let mut earliest = None;
        for change in &feeder.history {
            let d = distance(change.balance(), feeder_target, feeder_capacity);
            if d < config.min_fee_increase_distance {
                break;
            }
            if let Change::InForward { time, amount, out_channel: Some(out), .. } = change {
                if out == &properties.id {
                    inflow += amount.abs();
                    earliest = Some(*time);
                }
            }
        }
        if let Some(earliest) = earliest {
            flows.push(FeederInflow {
                id: feeder_id,
                inflow,
                distance: feeder_distance,
                earliest,
            });
        }
    }

    let Some(earliest) = flows.iter().map(|f| f.earliest).min() else {
        return Ok(None);
    };

    let total_outflow: i64 = stats
        .history
        .iter()
        .filter(|change| matches!(change, Change::OutForward { .. }))
        .filter(|change| change.time() >= earliest)
        .map(|change| change.amount().abs())
        .sum();

    let weighted: f64 = flows.iter().map(|f| f.inflow as f64 * f.distance).sum();
    let fraction = weighted / total_outflow as f64;
    if fraction <= config.min_fee_increase_distance {
        return Ok(None);
    }

    let increase_fraction = (fraction - config.min_fee_increase_distance) * current_distance.abs();
    let new_rate = ((last_out_rate as f64 * (1.0 + increase_fraction)).round() as i64)
        .min(config.max_fee_rate as i64);
    if new_rate <= properties.fee_rate as i64 {
        return Ok(None);
    }

    let details = flows
        .iter()
        .map(|f| {
            format!(
                "{} pushed {} sat since {} at distance {:.2}",
                f.id,
                f.inflow,
                f.earliest.format("%Y-%m-%dT%H:%M:%SZ"),
                f.distance
            )
        })
        .collect::<Vec<_>>()
        .join("; ");
    let reason = format!("Outflow is fed by channels far above their targets: {}.", details);
    Ok(Some(fee_action(properties, config, new_rate, reason)))
}
