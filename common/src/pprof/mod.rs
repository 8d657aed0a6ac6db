use std::collections::HashMap;
use std::io::Read;

use flate2::read::GzDecoder;
use prost::Message;

use crate::error::{Error, Result};

pub use builder::ProfileBuilder;
pub use profile::{Function, Label, Line, Location, Mapping, Profile, Sample, ValueType};

mod builder;
pub mod convert;
mod profile;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

pub fn is_gzip(raw: &[u8]) -> bool {
    raw.starts_with(&GZIP_MAGIC)
}

/// Largest inflated size accepted for a gzip-compressed payload.
pub const MAX_DECODED_SIZE: u64 = 256 << 20;

/// Decodes a pprof payload, gzip-compressed or not.
pub fn decode(raw: &[u8]) -> Result<Profile> {
    decode_with_limit(raw, MAX_DECODED_SIZE)
}

/// Like [`decode`], rejecting gzip payloads that inflate past `max_decoded`
/// bytes.
pub fn decode_with_limit(raw: &[u8], max_decoded: u64) -> Result<Profile> {
    if raw.is_empty() {
        return Err(Error::Decode("empty payload".to_string()));
    }
    if is_gzip(raw) {
        let mut buf = Vec::with_capacity(raw.len().saturating_mul(4).min(max_decoded as usize));
        GzDecoder::new(raw)
            .take(max_decoded.saturating_add(1))
            .read_to_end(&mut buf)
            .map_err(|e| Error::Decode(format!("gzip: {}", e)))?;
        if buf.len() as u64 > max_decoded {
            return Err(Error::Decode(format!(
                "gzip payload inflates past {} bytes",
                max_decoded
            )));
        }
        return decode_raw(&buf);
    }
    decode_raw(raw)
}

fn decode_raw(buf: &[u8]) -> Result<Profile> {
    Profile::decode(buf).map_err(|e| Error::Decode(format!("protobuf: {}", e)))
}

impl Profile {
    pub fn string(&self, index: i64) -> Result<&str> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.string_table.get(i))
            .map(String::as_str)
            .ok_or_else(|| Error::Decode(format!("string index {} out of range", index)))
    }

    pub fn sample_type_index(&self, name: &str) -> Option<usize> {
        self.sample_type
            .iter()
            .position(|vt| self.string(vt.r#type).map_or(false, |s| s == name))
    }

    /// Checks the parts of the profile the converter relies on.
    pub fn validate(&self) -> Result<()> {
        if self.sample_type.is_empty() {
            return Err(Error::Schema("profile has no sample types".to_string()));
        }
        for vt in &self.sample_type {
            if self.string(vt.r#type)?.is_empty() {
                return Err(Error::Schema("sample type without a name".to_string()));
            }
        }
        for (i, sample) in self.sample.iter().enumerate() {
            if sample.value.len() != self.sample_type.len() {
                return Err(Error::Schema(format!(
                    "sample {} has {} values, expected {}",
                    i,
                    sample.value.len(),
                    self.sample_type.len()
                )));
            }
        }
        Ok(())
    }
}

/// Id lookups over the location and function tables of one profile.
pub(crate) struct Symbols<'a> {
    profile: &'a Profile,
    locations: HashMap<u64, &'a Location>,
    functions: HashMap<u64, &'a Function>,
}

impl<'a> Symbols<'a> {
    pub(crate) fn new(profile: &'a Profile) -> Self {
        Self {
            profile,
            locations: profile.location.iter().map(|l| (l.id, l)).collect(),
            functions: profile.function.iter().map(|f| (f.id, f)).collect(),
        }
    }

    /// Resolves a sample's call stack to function names, root frame first.
    pub(crate) fn stack(&self, sample: &Sample) -> Result<Vec<String>> {
        let mut frames = Vec::with_capacity(sample.location_id.len());
        for id in &sample.location_id {
            let location = self
                .locations
                .get(id)
                .ok_or_else(|| Error::Decode(format!("unknown location id {}", id)))?;
            if location.line.is_empty() {
                frames.push(format!("0x{:x}", location.address));
                continue;
            }
            for line in &location.line {
                let function = self.functions.get(&line.function_id).ok_or_else(|| {
                    Error::Decode(format!("unknown function id {}", line.function_id))
                })?;
                frames.push(self.profile.string(function.name)?.to_string());
            }
        }
        frames.reverse();
        Ok(frames)
    }

    /// String labels attached to a sample. Numeric labels are ignored.
    pub(crate) fn labels(&self, sample: &Sample) -> Result<Vec<(String, String)>> {
        let mut labels = Vec::with_capacity(sample.label.len());
        for label in &sample.label {
            if label.str == 0 {
                continue;
            }
            labels.push((
                self.profile.string(label.key)?.to_string(),
                self.profile.string(label.str)?.to_string(),
            ));
        }
        labels.sort();
        labels.dedup_by(|a, b| a.0 == b.0);
        Ok(labels)
    }
}
