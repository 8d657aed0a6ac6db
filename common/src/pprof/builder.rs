use std::collections::HashMap;
use std::io::{self, Write};

use flate2::write::GzEncoder;
use flate2::Compression;
use prost::Message;
use xxhash_rust::xxh3::xxh3_64;

use crate::pprof::profile::{Function, Label, Line, Location, Mapping, Profile, Sample, ValueType};

/// Assembles pprof profiles from named stacks.
///
/// Stacks are given root frame first, the way they come out of the
/// converter; the builder stores them leaf first as pprof expects. Adding the
/// same stack with the same labels twice accumulates its values.
pub struct ProfileBuilder {
    strings: HashMap<String, i64>,
    locations: HashMap<String, u64>,
    functions: HashMap<String, u64>,
    sample_hash_to_sample: HashMap<u64, usize>,
    profile: Profile,

    tmp_location_ids: Vec<u64>,
}

impl ProfileBuilder {
    /// `sample_types` are `(type, unit)` pairs, one per value column.
    pub fn new(sample_types: &[(&str, &str)]) -> Self {
        let mut b = Self {
            strings: HashMap::new(),
            locations: HashMap::new(),
            functions: HashMap::new(),
            sample_hash_to_sample: HashMap::new(),
            profile: Profile {
                mapping: vec![Mapping { id: 1, ..Default::default() }],
                ..Default::default()
            },
            tmp_location_ids: Vec::with_capacity(128),
        };
        b.add_string("");
        for (ty, unit) in sample_types {
            let vt = ValueType {
                r#type: b.add_string(ty),
                unit: b.add_string(unit),
            };
            b.profile.sample_type.push(vt);
        }
        b
    }

    pub fn period(mut self, ty: &str, unit: &str, period: i64) -> Self {
        self.profile.period_type = Some(ValueType {
            r#type: self.add_string(ty),
            unit: self.add_string(unit),
        });
        self.profile.period = period;
        self
    }

    pub fn add_sample(&mut self, stack: &[&str], values: &[i64]) {
        self.add_sample_with_labels(stack, values, &[]);
    }

    pub fn add_sample_with_labels(&mut self, stack: &[&str], values: &[i64], labels: &[(&str, &str)]) {
        self.tmp_location_ids.clear();
        for frame in stack.iter().rev() {
            let id = self.add_location(frame);
            self.tmp_location_ids.push(id);
        }

        let mut key = Vec::with_capacity(self.tmp_location_ids.len() * 8 + labels.len() * 16);
        for id in &self.tmp_location_ids {
            key.extend_from_slice(&id.to_le_bytes());
        }
        let mut label = Vec::with_capacity(labels.len());
        for (k, v) in labels {
            let (k, v) = (self.add_string(k), self.add_string(v));
            key.extend_from_slice(&k.to_le_bytes());
            key.extend_from_slice(&v.to_le_bytes());
            label.push(Label { key: k, str: v, ..Default::default() });
        }
        let h = xxh3_64(&key);

        if let Some(&i) = self.sample_hash_to_sample.get(&h) {
            let sample = &mut self.profile.sample[i];
            for (acc, v) in sample.value.iter_mut().zip(values) {
                *acc = acc.saturating_add(*v);
            }
            return;
        }

        self.sample_hash_to_sample.insert(h, self.profile.sample.len());
        self.profile.sample.push(Sample {
            location_id: self.tmp_location_ids.clone(),
            value: values.to_vec(),
            label,
        });
    }

    fn add_string(&mut self, s: &str) -> i64 {
        if let Some(&i) = self.strings.get(s) {
            return i;
        }
        let i = self.profile.string_table.len() as i64;
        self.profile.string_table.push(s.to_string());
        self.strings.insert(s.to_string(), i);
        i
    }

    fn add_location(&mut self, function: &str) -> u64 {
        if let Some(&id) = self.locations.get(function) {
            return id;
        }

        let id = (self.profile.location.len() + 1) as u64;
        let function_id = self.add_function(function);
        self.profile.location.push(Location {
            id,
            mapping_id: self.profile.mapping[0].id,
            line: vec![Line { function_id, line: 0 }],
            ..Default::default()
        });
        self.locations.insert(function.to_string(), id);
        id
    }

    fn add_function(&mut self, function: &str) -> u64 {
        if let Some(&id) = self.functions.get(function) {
            return id;
        }

        let id = (self.profile.function.len() + 1) as u64;
        let name = self.add_string(function);
        self.profile.function.push(Function {
            id,
            name,
            system_name: name,
            ..Default::default()
        });
        self.functions.insert(function.to_string(), id);
        id
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    pub fn encode(&self) -> Vec<u8> {
        self.profile.encode_to_vec()
    }

    pub fn write(&self, dst: &mut dyn Write) -> io::Result<()> {
        let mut gzip_writer = GzEncoder::new(dst, Compression::default());
        gzip_writer.write_all(&self.encode())?;
        gzip_writer.finish()?;
        Ok(())
    }

    pub fn gzip(&self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.write(&mut buf)?;
        Ok(buf)
    }
}
