//! Multi-dimensional resource accounting.
//!
//! Quantities are kept in integral units (millicores, bytes, whole
//! scalar units) so that add/sub round-trips are exact and equality
//! can be exact — everything derives from discrete resource requests.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use serde::{Deserialize, Serialize};

/// A pod/task/job resource footprint. `Sub` does not clamp: callers
/// must only subtract a value they previously added, so a negative
/// component always indicates a protocol bug upstream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    /// CPU in millicores.
    pub milli_cpu: i64,
    /// Memory in bytes.
    pub memory_bytes: i64,
    /// Everything else (accelerators, extended resources) in whole
    /// units, keyed by the Kubernetes resource name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub scalars: BTreeMap<String, i64>,
}

impl Resource {
    pub fn new(milli_cpu: i64, memory_bytes: i64) -> Self {
        Self { milli_cpu, memory_bytes, scalars: BTreeMap::new() }
    }

    pub fn with_scalar(mut self, name: &str, units: i64) -> Self {
        if units != 0 {
            self.scalars.insert(name.to_string(), units);
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.milli_cpu == 0 && self.memory_bytes == 0 && self.scalars.is_empty()
    }

    /// Dimension-wise addition.
    pub fn add(&mut self, other: &Resource) {
        self.milli_cpu += other.milli_cpu;
        self.memory_bytes += other.memory_bytes;
        for (name, units) in &other.scalars {
            let entry = self.scalars.entry(name.clone()).or_insert(0);
            *entry += units;
        }
        self.prune_zero_scalars();
    }

    /// Dimension-wise subtraction, no clamping.
    pub fn sub(&mut self, other: &Resource) {
        self.milli_cpu -= other.milli_cpu;
        self.memory_bytes -= other.memory_bytes;
        for (name, units) in &other.scalars {
            let entry = self.scalars.entry(name.clone()).or_insert(0);
            *entry -= units;
        }
        self.prune_zero_scalars();
    }

    /// Sum the per-container requests of one pod into a footprint.
    pub fn from_requests<'a, I>(requests: I) -> Self
    where
        I: IntoIterator<Item = (&'a String, &'a Quantity)>,
    {
        let mut total = Resource::default();
        for (name, quantity) in requests {
            let value = quantity_value(quantity);
            match name.as_str() {
                "cpu" => total.milli_cpu += (value * 1000.0).round() as i64,
                "memory" => total.memory_bytes += value.round() as i64,
                other => {
                    let units = value.round() as i64;
                    if units != 0 {
                        *total.scalars.entry(other.to_string()).or_insert(0) += units;
                    }
                }
            }
        }
        total
    }

    // An entry that sums back to exactly zero is dropped so that
    // "added then fully subtracted" compares equal to "never added".
    fn prune_zero_scalars(&mut self) {
        self.scalars.retain(|_, units| *units != 0);
    }
}

/// Parse a Kubernetes quantity string ("500m", "2", "1.5", "4Gi",
/// "100M", "1e3") into its canonical numeric value. Unparseable input
/// counts as zero; the watch source only hands us values the API
/// server already validated.
pub fn quantity_value(q: &Quantity) -> f64 {
    let s = q.0.trim();
    if s.is_empty() {
        return 0.0;
    }
    // Split the numeric part from a trailing suffix. An 'e'/'E'
    // followed by a digit or sign is scientific notation, not the
    // exa suffix.
    let bytes = s.as_bytes();
    let mut split = s.len();
    for (i, &b) in bytes.iter().enumerate() {
        match b {
            b'0'..=b'9' | b'.' | b'+' | b'-' => continue,
            b'e' | b'E' => {
                let next = bytes.get(i + 1);
                if matches!(next, Some(b'0'..=b'9') | Some(b'+') | Some(b'-')) {
                    continue;
                }
                split = i;
                break;
            }
            _ => {
                split = i;
                break;
            }
        }
    }
    let (num, suffix) = s.split_at(split);
    let value: f64 = match num.parse() {
        Ok(v) => v,
        Err(_) => return 0.0,
    };
    let multiplier: f64 = match suffix {
        "" => 1.0,
        "m" => 1e-3,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "E" => 1e18,
        "Ki" => 1024.0,
        "Mi" => 1024f64.powi(2),
        "Gi" => 1024f64.powi(3),
        "Ti" => 1024f64.powi(4),
        "Pi" => 1024f64.powi(5),
        "Ei" => 1024f64.powi(6),
        _ => return 0.0,
    };
    value * multiplier
}
