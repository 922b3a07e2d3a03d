use crate::error::EngineError;
use crate::state::{NodeSnapshot, PaymentState};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// One balance-affecting event on a channel.
///
/// `amount` is outflow-positive in satoshis: positive amounts debited the
/// local balance, negative amounts credited it. `balance` is the local
/// balance immediately after the event. Walking a history from newest to
/// oldest, `balance + amount` gives the balance before the event.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    /// A forward that arrived on this channel and left via `out_channel`.
    InForward {
        time: DateTime<Utc>,
        amount: i64,
        fee_msat: u64,
        balance: u64,
        out_channel: Option<String>,
    },
    /// A forward that left through this channel, having arrived via `in_channel`.
    OutForward {
        time: DateTime<Utc>,
        amount: i64,
        fee_msat: u64,
        balance: u64,
        in_channel: Option<String>,
    },
    /// A self-payment crediting this channel.
    InRebalance {
        time: DateTime<Utc>,
        amount: i64,
        fee_msat: u64,
        balance: u64,
    },
    /// A self-payment debiting this channel.
    OutRebalance {
        time: DateTime<Utc>,
        amount: i64,
        fee_msat: u64,
        balance: u64,
    },
    /// An outbound payment to a third party.
    OutPayment {
        time: DateTime<Utc>,
        amount: i64,
        fee_msat: u64,
        balance: u64,
    },
}

impl Change {
    pub fn time(&self) -> DateTime<Utc> {
        match self {
            Change::InForward { time, .. }
            | Change::OutForward { time, .. }
            | Change::InRebalance { time, .. }
            | Change::OutRebalance { time, .. }
            | Change::OutPayment { time, .. } => *time,
        }
    }

    pub fn amount(&self) -> i64 {
        match self {
            Change::InForward { amount, .. }
            | Change::OutForward { amount, .. }
            | Change::InRebalance { amount, .. }
            | Change::OutRebalance { amount, .. }
            | Change::OutPayment { amount, .. } => *amount,
        }
    }

    pub fn fee_msat(&self) -> u64 {
        match self {
            Change::InForward { fee_msat, .. }
            | Change::OutForward { fee_msat, .. }
            | Change::InRebalance { fee_msat, .. }
            | Change::OutRebalance { fee_msat, .. }
            | Change::OutPayment { fee_msat, .. } => *fee_msat,
        }
    }

    pub fn balance(&self) -> u64 {
        match self {
            Change::InForward { balance, .. }
            | Change::OutForward { balance, .. }
            | Change::InRebalance { balance, .. }
            | Change::OutRebalance { balance, .. }
            | Change::OutPayment { balance, .. } => *balance,
        }
    }
}

fn msat_to_sat(msat: u64) -> u64 {
    (msat + 500) / 1000
}

enum EventKind {
    InForward { out_channel: String },
    OutForward { in_channel: String },
    InRebalance,
    OutRebalance,
    OutPayment,
}

struct Event {
    time: DateTime<Utc>,
    amount: i64,
    fee_msat: u64,
    kind: EventKind,
}

impl Event {
    fn into_change(self, balance: u64) -> Change {
        match self.kind {
            EventKind::InForward { out_channel } => Change::InForward {
                time: self.time,
                amount: self.amount,
                fee_msat: self.fee_msat,
                balance,
                out_channel: Some(out_channel),
            },
            EventKind::OutForward { in_channel } => Change::OutForward {
                time: self.time,
                amount: self.amount,
                fee_msat: self.fee_msat,
                balance,
                in_channel: Some(in_channel),
            },
            EventKind::InRebalance => Change::InRebalance {
                time: self.time,
                amount: self.amount,
                fee_msat: self.fee_msat,
                balance,
            },
            EventKind::OutRebalance => Change::OutRebalance {
                time: self.time,
                amount: self.amount,
                fee_msat: self.fee_msat,
                balance,
            },
            EventKind::OutPayment => Change::OutPayment {
                time: self.time,
                amount: self.amount,
                fee_msat: self.fee_msat,
                balance,
            },
        }
    }
}

/// Build the latest-first change timeline for every channel in the snapshot.
///
/// Forwards and payments touching channels the snapshot no longer carries
/// (closed since) contribute nothing to the channels they left behind.
pub fn build(snapshot: &NodeSnapshot) -> Result<BTreeMap<String, Vec<Change>>, EngineError> {
    let mut events: BTreeMap<&str, Vec<Event>> = snapshot
        .channels
        .iter()
        .map(|c| (c.id.as_str(), Vec::new()))
        .collect();

    for forward in &snapshot.forwards {
        let fee_sat = msat_to_sat(forward.fee_msat);
        if let Some(list) = events.get_mut(forward.incoming_channel.as_str()) {
            // The inbound HTLC carries the forwarded tokens plus our fee.
            list.push(Event {
                time: forward.created_at,
                amount: -((forward.tokens + fee_sat) as i64),
                fee_msat: forward.fee_msat,
                kind: EventKind::InForward {
                    out_channel: forward.outgoing_channel.clone(),
                },
            });
        }
        if let Some(list) = events.get_mut(forward.outgoing_channel.as_str()) {
            list.push(Event {
                time: forward.created_at,
                amount: forward.tokens as i64,
                fee_msat: forward.fee_msat,
                kind: EventKind::OutForward {
                    in_channel: forward.incoming_channel.clone(),
                },
            });
        }
    }

    for payment in &snapshot.payments {
        if payment.state != PaymentState::Succeeded || payment.hops.is_empty() {
            continue;
        }
        let fee_sat = msat_to_sat(payment.fee_msat);
        let debit = (payment.tokens + fee_sat) as i64;
        if payment.is_rebalance(&snapshot.identity.public_key) {
            if let Some(out) = payment.out_channel() {
                if let Some(list) = events.get_mut(out) {
                    list.push(Event {
                        time: payment.created_at,
                        amount: debit,
                        fee_msat: payment.fee_msat,
                        kind: EventKind::OutRebalance,
                    });
                }
            }
            if let Some(inbound) = payment.in_channel() {
                if let Some(list) = events.get_mut(inbound) {
                    list.push(Event {
                        time: payment.created_at,
                        amount: -(payment.tokens as i64),
                        fee_msat: payment.fee_msat,
                        kind: EventKind::InRebalance,
                    });
                }
            }
        } else if let Some(out) = payment.out_channel() {
            if let Some(list) = events.get_mut(out) {
                list.push(Event {
                    time: payment.created_at,
                    amount: debit,
                    fee_msat: payment.fee_msat,
                    kind: EventKind::OutPayment,
                });
            }
        }
    }

    let mut histories = BTreeMap::new();
    for channel in &snapshot.channels {
        if channel.local_balance > channel.capacity {
            return Err(EngineError::SnapshotInvariant(format!(
                "channel {}: local balance {} exceeds capacity {}",
                channel.id, channel.local_balance, channel.capacity
            )));
        }

        let mut list = events.remove(channel.id.as_str()).unwrap_or_default();
        list.sort_by(|a, b| b.time.cmp(&a.time));

        // The newest event left the channel at its current balance; walking
        // towards older events, balance + amount restores the earlier state.
        let mut balance = channel.local_balance as i64;
        let mut history = Vec::with_capacity(list.len());
        for event in list {
            if balance < 0 || balance > channel.capacity as i64 {
                return Err(EngineError::SnapshotInvariant(format!(
                    "channel {}: reconstructed balance {} outside [0, {}]",
                    channel.id, balance, channel.capacity
                )));
            }
            let amount = event.amount;
            history.push(event.into_change(balance as u64));
            balance += amount;
        }
        // `balance` is now the balance at the start of the window, which must
        // have been possible too.
        if balance < 0 || balance > channel.capacity as i64 {
            return Err(EngineError::SnapshotInvariant(format!(
                "channel {}: reconstructed balance {} outside [0, {}]",
                channel.id, balance, channel.capacity
            )));
        }

        histories.insert(channel.id.clone(), history);
    }

    Ok(histories)
}
