//! Statistics over a cycle's samples: trimmed per-channel means and
//! cross-channel spreads

use alloc::vec::Vec;

use crate::channel::Channel;
use crate::sampling::SampleSet;

/// Minimum sample count at which the extremes are trimmed.
pub const TRIM_THRESHOLD: usize = 4;

/// Outlier-resistant mean.
///
/// With fewer than [`TRIM_THRESHOLD`] samples this is the plain mean. From
/// [`TRIM_THRESHOLD`] samples on, exactly one lowest and one highest sample are
/// dropped (one instance each, even when the extreme value repeats) before
/// averaging. Returns `None` for an empty slice.
pub fn trimmed_mean(samples: &[f32]) -> Option<f32> {
    match samples.len() {
        0 => None,
        n if n < TRIM_THRESHOLD => Some(samples.iter().sum::<f32>() / n as f32),
        n => {
            let mut sorted: Vec<f32> = samples.to_vec();
            sorted.sort_unstable_by(f32::total_cmp);
            let kept = &sorted[1..n - 1];
            Some(kept.iter().sum::<f32>() / kept.len() as f32)
        }
    }
}

/// `max - min` over `values`, or `None` when there are none.
pub fn spread(values: impl IntoIterator<Item = f32>) -> Option<f32> {
    values
        .into_iter()
        .fold(None, |range: Option<(f32, f32)>, value| match range {
            None => Some((value, value)),
            Some((low, high)) => Some((low.min(value), high.max(value))),
        })
        .map(|(low, high)| high - low)
}

/// One channel's averaged readings for a cycle.
///
/// A metric that produced no sample at all has no average.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelAggregate {
    pub channel: Channel,
    pub temperature: Option<f32>,
    pub humidity: Option<f32>,
    pub co2: Option<f32>,
    /// Whether the channel delivered every expected reading this cycle.
    pub complete: bool,
}

impl ChannelAggregate {
    pub fn from_samples(channel: Channel, samples: &SampleSet, expected_readings: usize) -> Self {
        Self {
            channel,
            temperature: trimmed_mean(&samples.temperature),
            humidity: trimmed_mean(&samples.humidity),
            co2: trimmed_mean(&samples.co2),
            complete: samples.entry_count() == expected_readings,
        }
    }
}

/// Spread of each metric's per-channel averages.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Deltas {
    pub temperature: Option<f32>,
    pub humidity: Option<f32>,
    pub co2: Option<f32>,
}

impl Deltas {
    pub fn across(aggregates: &[ChannelAggregate]) -> Self {
        Self {
            temperature: spread(aggregates.iter().filter_map(|a| a.temperature)),
            humidity: spread(aggregates.iter().filter_map(|a| a.humidity)),
            co2: spread(aggregates.iter().filter_map(|a| a.co2)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(actual: Option<f32>, expected: f32) {
        let actual = actual.expect("expected a value");
        assert!(
            (actual - expected).abs() < 1e-5,
            "expected {expected}, got {actual}"
        );
    }

    #[test]
    fn short_sequences_use_the_plain_mean() {
        approx(trimmed_mean(&[10.0, 20.0, 30.0]), 20.0);
        approx(trimmed_mean(&[7.0]), 7.0);
    }

    #[test]
    fn drops_one_minimum_and_one_maximum() {
        approx(trimmed_mean(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]), 3.5);
        approx(trimmed_mean(&[6.0, 1.0, 5.0, 2.0, 4.0, 3.0]), 3.5);
        approx(trimmed_mean(&[20.0, 21.0, 22.0, 23.0]), 21.5);
    }

    #[test]
    fn duplicate_extremes_are_trimmed_once() {
        approx(trimmed_mean(&[5.0, 5.0, 5.0, 5.0, 9.0]), 5.0);
        approx(trimmed_mean(&[1.0, 1.0, 3.0, 3.0]), 2.0);
    }

    #[test]
    fn empty_input_has_no_mean() {
        assert_eq!(trimmed_mean(&[]), None);
    }

    #[test]
    fn spread_is_max_minus_min() {
        approx(spread([21.0, 23.5, 22.0]), 2.5);
        approx(spread([22.0]), 0.0);
        assert_eq!(spread(core::iter::empty()), None);
    }

    #[test]
    fn deltas_skip_channels_without_an_average() {
        let ch = |i| Channel::new(i).unwrap();
        let aggregates = [
            ChannelAggregate {
                channel: ch(0),
                temperature: Some(21.0),
                humidity: Some(40.0),
                co2: None,
                complete: false,
            },
            ChannelAggregate {
                channel: ch(1),
                temperature: Some(23.5),
                humidity: Some(44.5),
                co2: Some(700.0),
                complete: true,
            },
        ];

        let deltas = Deltas::across(&aggregates);
        approx(deltas.temperature, 2.5);
        approx(deltas.humidity, 4.5);
        approx(deltas.co2, 0.0);
    }
}
