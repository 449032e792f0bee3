//! Lifetime failure accounting and the restart escalation policy

use alloc::vec::Vec;

use crate::channel::{Channel, MAX_CHANNELS, OccupiedChannels};
use crate::record::FailureCount;
use crate::stats::ChannelAggregate;

/// Count of incomplete cycles per channel since the process started.
///
/// Counters only ever go up; the ledger is rebuilt empty after a restart.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailureLedger {
    counts: [u32; MAX_CHANNELS],
}

impl FailureLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, channel: Channel) -> u32 {
        self.counts[channel.index() as usize]
    }

    pub fn record(&mut self, channel: Channel) {
        let count = &mut self.counts[channel.index() as usize];
        *count = count.saturating_add(1);
    }

    /// Charge every incomplete channel of this cycle with one failure and
    /// return those channels in ascending order.
    pub fn record_cycle(
        &mut self,
        aggregates: &[ChannelAggregate],
    ) -> heapless::Vec<Channel, MAX_CHANNELS> {
        let mut failed = heapless::Vec::new();
        for aggregate in aggregates.iter().filter(|a| !a.complete) {
            self.record(aggregate.channel);
            // One aggregate per channel, so at most MAX_CHANNELS entries.
            let _ = failed.push(aggregate.channel);
        }
        failed.sort_unstable();
        failed
    }

    /// Lifetime counts of the occupied channels that have failed at least once.
    pub fn report(&self, occupied: &OccupiedChannels) -> Vec<FailureCount> {
        occupied
            .iter()
            .map(|channel| FailureCount {
                channel,
                count: self.count(channel),
            })
            .filter(|failure| failure.count > 0)
            .collect()
    }
}

/// Escalates to a device restart once a channel has failed too often.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    threshold: u32,
}

impl RestartPolicy {
    pub const fn new(threshold: u32) -> Self {
        Self { threshold }
    }

    /// The first occupied channel, in ascending order, whose lifetime count
    /// strictly exceeds the threshold. Later channels are not inspected.
    pub fn first_breach(
        &self,
        ledger: &FailureLedger,
        occupied: &OccupiedChannels,
    ) -> Option<Channel> {
        occupied
            .iter()
            .find(|&channel| ledger.count(channel) > self.threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ch(index: u8) -> Channel {
        Channel::new(index).unwrap()
    }

    fn aggregate(channel: Channel, complete: bool) -> ChannelAggregate {
        ChannelAggregate {
            channel,
            temperature: Some(20.0),
            humidity: Some(40.0),
            co2: Some(600.0),
            complete,
        }
    }

    #[test]
    fn incomplete_channel_gains_exactly_one_failure() {
        let mut ledger = FailureLedger::new();
        let failed = ledger.record_cycle(&[aggregate(ch(1), true), aggregate(ch(4), false)]);

        assert_eq!(failed.as_slice(), &[ch(4)]);
        assert_eq!(ledger.count(ch(4)), 1);
        assert_eq!(ledger.count(ch(1)), 0);
    }

    #[test]
    fn repeated_failures_accumulate() {
        let mut ledger = FailureLedger::new();
        for _ in 0..3 {
            ledger.record_cycle(&[aggregate(ch(2), false)]);
        }
        ledger.record_cycle(&[aggregate(ch(2), true)]);
        assert_eq!(ledger.count(ch(2)), 3);
    }

    #[test]
    fn report_lists_only_channels_that_failed() {
        let occupied: OccupiedChannels = [ch(0), ch(3), ch(5)].into_iter().collect();
        let mut ledger = FailureLedger::new();
        ledger.record(ch(5));
        ledger.record(ch(5));
        ledger.record(ch(0));

        assert_eq!(
            ledger.report(&occupied),
            [
                FailureCount {
                    channel: ch(0),
                    count: 1
                },
                FailureCount {
                    channel: ch(5),
                    count: 2
                },
            ]
        );
    }

    #[test]
    fn restart_requires_strictly_more_than_threshold() {
        let occupied: OccupiedChannels = [ch(1)].into_iter().collect();
        let policy = RestartPolicy::new(9);
        let mut ledger = FailureLedger::new();

        for _ in 0..9 {
            ledger.record(ch(1));
        }
        assert_eq!(policy.first_breach(&ledger, &occupied), None);

        ledger.record(ch(1));
        assert_eq!(policy.first_breach(&ledger, &occupied), Some(ch(1)));
    }

    #[test]
    fn first_breach_in_ascending_order_wins() {
        let occupied: OccupiedChannels = [ch(6), ch(2), ch(4)].into_iter().collect();
        let policy = RestartPolicy::new(9);
        let mut ledger = FailureLedger::new();
        for _ in 0..12 {
            ledger.record(ch(6));
            ledger.record(ch(4));
        }

        assert_eq!(policy.first_breach(&ledger, &occupied), Some(ch(4)));
    }
}
