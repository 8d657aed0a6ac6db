use std::fmt;
use std::time::SystemTime;

use crate::common::labels::Labels;

/// How the values of one interval are combined.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum AggregationKind {
    #[default]
    Sum,
    Average,
}

impl AggregationKind {
    /// Resolves a configured kind. Anything that is not `average` is `sum`.
    pub fn parse(kind: &str) -> Self {
        match kind.trim().to_ascii_lowercase().as_str() {
            "average" | "avg" => AggregationKind::Average,
            _ => AggregationKind::Sum,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AggregationKind::Sum => "sum",
            AggregationKind::Average => "average",
        }
    }
}

impl fmt::Display for AggregationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Units {
    Samples,
    Nanoseconds,
    Objects,
    Bytes,
    Goroutines,
    LockNanoseconds,
    LockSamples,
}

impl Units {
    pub fn as_str(&self) -> &'static str {
        match self {
            Units::Samples => "samples",
            Units::Nanoseconds => "nanoseconds",
            Units::Objects => "objects",
            Units::Bytes => "bytes",
            Units::Goroutines => "goroutines",
            Units::LockNanoseconds => "lock_nanoseconds",
            Units::LockSamples => "lock_samples",
        }
    }
}

impl fmt::Display for Units {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One call stack, root frame first, and its value for the interval.
#[derive(Clone, Debug, PartialEq)]
pub struct StackValue {
    pub frames: Vec<String>,
    pub value: f64,
}

/// A normalized profile for one sample type of one pull.
#[derive(Clone, Debug)]
pub struct ProfileSample {
    pub name: String,
    pub profile_kind: String,
    pub start_time: SystemTime,
    pub end_time: SystemTime,
    pub sample_rate: u32,
    pub units: Units,
    pub aggregation: AggregationKind,
    pub labels: Labels,
    pub stacks: Vec<StackValue>,
}

impl ProfileSample {
    pub fn total(&self) -> f64 {
        self.stacks.iter().map(|s| s.value).sum()
    }

    /// Value of the stack whose frames are exactly `frames`, root first.
    pub fn value_of(&self, frames: &[&str]) -> Option<f64> {
        self.stacks
            .iter()
            .find(|s| s.frames.iter().map(String::as_str).eq(frames.iter().copied()))
            .map(|s| s.value)
    }
}

/// Downstream sink for converted profiles.
pub trait Collector: Send + Sync {
    fn collect(&self, sample: ProfileSample);
}
