use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use ahash::AHashMap;
use bytes::Bytes;
use log::{debug, info};

use crate::common::collector::{AggregationKind, ProfileSample, StackValue, Units};
use crate::common::labels::Labels;
use crate::error::{Error, Result};
use crate::pprof::{decode, Profile, Symbols};

pub const DEFAULT_SAMPLE_RATE: u32 = 100;

#[derive(Clone, Debug, PartialEq)]
pub struct SampleTypeConfig {
    pub units: Units,
    pub display_name: Option<String>,
    pub aggregation: AggregationKind,
    /// Values are running totals since process start.
    pub cumulative: bool,
}

impl SampleTypeConfig {
    pub fn new(units: Units) -> Self {
        Self {
            units,
            display_name: None,
            aggregation: AggregationKind::Sum,
            cumulative: false,
        }
    }

    pub fn display_name(mut self, name: &str) -> Self {
        self.display_name = Some(name.to_string());
        self
    }

    pub fn aggregation(mut self, aggregation: AggregationKind) -> Self {
        self.aggregation = aggregation;
        self
    }

    pub fn cumulative(mut self) -> Self {
        self.cumulative = true;
        self
    }
}

/// Raw bytes of one successful scrape.
#[derive(Clone, Debug)]
pub struct PullResult {
    pub profile: Bytes,
    pub start_time: SystemTime,
    pub end_time: SystemTime,
}

pub struct ConvertInput<'a> {
    pub current: &'a PullResult,
    /// Last successful pull of the same target, if any.
    pub previous: Option<&'a PullResult>,
    pub profile_kind: &'a str,
    pub sample_types: &'a HashMap<String, SampleTypeConfig>,
    pub labels: &'a Labels,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct StackKey {
    frames: Vec<String>,
    labels: Vec<(String, String)>,
}

/// Per stack values of every sample type, duplicates summed.
struct StackTable {
    profile: Profile,
    rows: AHashMap<StackKey, Vec<i64>>,
}

impl StackTable {
    fn build(profile: Profile) -> Result<Self> {
        profile.validate()?;
        let mut rows: AHashMap<StackKey, Vec<i64>> = AHashMap::with_capacity(profile.sample.len());
        {
            let symbols = Symbols::new(&profile);
            for sample in &profile.sample {
                let key = StackKey {
                    frames: symbols.stack(sample)?,
                    labels: symbols.labels(sample)?,
                };
                match rows.get_mut(&key) {
                    Some(values) => {
                        for (acc, v) in values.iter_mut().zip(&sample.value) {
                            *acc = acc.checked_add(*v).ok_or_else(|| {
                                Error::Schema(format!("values of stack {} overflow", key.frames.join(";")))
                            })?;
                        }
                    }
                    None => {
                        rows.insert(key, sample.value.clone());
                    }
                }
            }
        }
        Ok(Self { profile, rows })
    }

    fn column(&self, index: usize) -> impl Iterator<Item = (&StackKey, i64)> {
        self.rows.iter().map(move |(k, v)| (k, v[index]))
    }

    fn value(&self, key: &StackKey, index: usize) -> i64 {
        self.rows.get(key).map_or(0, |v| v[index])
    }
}

/// Converts one pull into zero or more profile samples.
///
/// Decode and schema failures of the current payload are returned; an
/// unusable previous payload only turns this pull into a new baseline.
pub fn convert(input: &ConvertInput<'_>) -> Result<Vec<ProfileSample>> {
    let current = StackTable::build(decode(&input.current.profile)?)?;
    let previous = match input.previous {
        Some(prev) => match decode(&prev.profile).and_then(StackTable::build) {
            Ok(table) => Some((prev, table)),
            Err(err) => {
                debug!("previous {} profile unusable, using pull as baseline: {}", input.profile_kind, err);
                None
            }
        },
        None => None,
    };
    let sample_rate = sample_rate(&current.profile);

    let mut out = Vec::new();
    for (index, vt) in current.profile.sample_type.iter().enumerate() {
        let type_name = current.profile.string(vt.r#type)?;
        let Some(cfg) = input.sample_types.get(type_name) else {
            debug!("skipping unconfigured sample type {} of {}", type_name, input.profile_kind);
            continue;
        };

        let (start_time, values) = if cfg.cumulative {
            let Some((prev, prev_table)) = previous.as_ref() else {
                continue;
            };
            let Some(prev_index) = prev_table.profile.sample_type_index(type_name) else {
                continue;
            };
            let Some(deltas) = delta(&current, index, prev_table, prev_index) else {
                info!(
                    "{} {} went backwards, counter reset, skipping interval",
                    input.profile_kind, type_name
                );
                continue;
            };
            let values = match cfg.aggregation {
                AggregationKind::Sum => deltas,
                AggregationKind::Average => {
                    let elapsed = input
                        .current
                        .end_time
                        .duration_since(prev.end_time)
                        .unwrap_or(Duration::ZERO);
                    average(deltas, elapsed)
                }
            };
            (prev.end_time, values)
        } else {
            let values = current
                .column(index)
                .filter(|(_, v)| *v != 0)
                .map(|(k, v)| (k, v as f64))
                .collect();
            (input.current.start_time, values)
        };

        let name = cfg.display_name.as_deref().unwrap_or(type_name);
        for (embedded, stacks) in group_by_labels(values) {
            out.push(ProfileSample {
                name: name.to_string(),
                profile_kind: input.profile_kind.to_string(),
                start_time,
                end_time: input.current.end_time,
                sample_rate,
                units: cfg.units,
                aggregation: cfg.aggregation,
                labels: input.labels.merge(&embedded),
                stacks,
            });
        }
    }
    Ok(out)
}

/// new - old per stack. Stacks only in the old snapshot are dropped, zero
/// deltas are omitted. `None` when any stack decreased or the difference
/// does not fit.
fn delta<'a>(
    current: &'a StackTable,
    index: usize,
    previous: &StackTable,
    prev_index: usize,
) -> Option<Vec<(&'a StackKey, f64)>> {
    let mut out = Vec::with_capacity(current.rows.len());
    for (key, value) in current.column(index) {
        // An overflowing difference cannot come from a live counter.
        let d = value.checked_sub(previous.value(key, prev_index))?;
        if d < 0 {
            return None;
        }
        if d != 0 {
            out.push((key, d as f64));
        }
    }
    Some(out)
}

fn average(values: Vec<(&StackKey, f64)>, elapsed: Duration) -> Vec<(&StackKey, f64)> {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return values;
    }
    values.into_iter().map(|(k, v)| (k, v / secs)).collect()
}

fn group_by_labels(values: Vec<(&StackKey, f64)>) -> Vec<(Labels, Vec<StackValue>)> {
    let mut groups: AHashMap<&[(String, String)], Vec<StackValue>> = AHashMap::new();
    for (key, value) in values {
        groups.entry(key.labels.as_slice()).or_default().push(StackValue {
            frames: key.frames.clone(),
            value,
        });
    }

    let mut out: Vec<(Labels, Vec<StackValue>)> = groups
        .into_iter()
        .map(|(labels, mut stacks)| {
            stacks.sort_by(|a, b| a.frames.cmp(&b.frames));
            (labels.iter().cloned().collect(), stacks)
        })
        .collect();
    out.sort_by(|a, b| a.0.to_string().cmp(&b.0.to_string()));
    out
}

fn sample_rate(profile: &Profile) -> u32 {
    let nanos_period = profile
        .period_type
        .as_ref()
        .and_then(|pt| profile.string(pt.unit).ok())
        .map_or(false, |unit| unit == "nanoseconds");
    if nanos_period && profile.period > 0 {
        let rate = 1_000_000_000 / profile.period;
        if rate > 0 {
            return rate as u32;
        }
    }
    DEFAULT_SAMPLE_RATE
}
