//! The per-cycle result record and its wire encoding
//!
//! In memory the record is strongly typed. On the wire it becomes
//!
//! ```text
//! {"data": {"<ch>_Temp": [{"value": 21.5}], ..., "Delta_CO2": [{"value": 12.0}], "<ch>_failures": [{"value": 3}]}}
//! ```
//!
//! with keys `<ch>_Temp`, `<ch>_Humidity`, `<ch>_CO2`, `Delta_Temp`,
//! `Delta_Humidity`, `Delta_CO2` and `<ch>_failures`.

use alloc::format;
use alloc::vec::Vec;

use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;

use crate::channel::Channel;
use crate::stats::{ChannelAggregate, Deltas};

/// A channel's lifetime failure count at the time the record was built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureCount {
    pub channel: Channel,
    pub count: u32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultRecord {
    /// One aggregate per occupied channel, ascending.
    pub channels: Vec<ChannelAggregate>,
    pub deltas: Deltas,
    /// Only filled in cycles where at least one channel failed.
    pub failures: Vec<FailureCount>,
}

impl ResultRecord {
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

#[derive(Serialize)]
struct ValueEntry<T> {
    value: T,
}

/// The `"data"` object: every metric as a one-element list of value entries.
struct WireData<'a>(&'a ResultRecord);

impl Serialize for WireData<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        fn entry<M: SerializeMap, T: Serialize>(map: &mut M, key: &str, value: T) -> Result<(), M::Error> {
            map.serialize_entry(key, &[ValueEntry { value }])
        }

        let record = self.0;
        let mut map = serializer.serialize_map(None)?;

        for aggregate in &record.channels {
            let channel = aggregate.channel;
            if let Some(temperature) = aggregate.temperature {
                entry(&mut map, &format!("{channel}_Temp"), temperature)?;
            }
            if let Some(humidity) = aggregate.humidity {
                entry(&mut map, &format!("{channel}_Humidity"), humidity)?;
            }
            if let Some(co2) = aggregate.co2 {
                entry(&mut map, &format!("{channel}_CO2"), co2)?;
            }
        }

        let deltas = &record.deltas;
        if let Some(temperature) = deltas.temperature {
            entry(&mut map, "Delta_Temp", temperature)?;
        }
        if let Some(humidity) = deltas.humidity {
            entry(&mut map, "Delta_Humidity", humidity)?;
        }
        if let Some(co2) = deltas.co2 {
            entry(&mut map, "Delta_CO2", co2)?;
        }

        for failure in &record.failures {
            entry(
                &mut map,
                &format!("{}_failures", failure.channel),
                failure.count,
            )?;
        }

        map.end()
    }
}

impl Serialize for ResultRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry("data", &WireData(self))?;
        map.end()
    }
}
