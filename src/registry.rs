//! Quantity-type registry.
//!
//! Maps each quantity name to its element type, its time-axis element type,
//! and the statistics it takes part in. The storage core only reads from the
//! registry; it is built once (from the built-in table or from JSON) and then
//! shared behind an `Arc`.
//!
//! The registry also names the combined-column groups: quantities that are
//! always appended together and share the time axis of the group's first
//! member.

use std::collections::BTreeMap;
use std::path::Path;

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};

use crate::codec::DType;
use crate::error::{Error, Result};

/// Static description of one quantity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuantitySpec {
    pub name: String,
    pub dtype: DType,
    #[serde(default = "default_time_dtype")]
    pub time_dtype: DType,
    /// Keep box-plot statistics (median, quartiles). Quantities without it
    /// only track sample counts and duration.
    #[serde(default)]
    pub box_plot: bool,
    /// Include in the JSON live summary of data chunks.
    #[serde(default)]
    pub live_summary: bool,
}

fn default_time_dtype() -> DType {
    DType::F64
}

impl QuantitySpec {
    pub fn new(name: &str, dtype: DType) -> Self {
        Self {
            name: name.to_string(),
            dtype,
            time_dtype: DType::F64,
            box_plot: false,
            live_summary: false,
        }
    }

    pub fn with_box_plot(mut self) -> Self {
        self.box_plot = true;
        self
    }

    pub fn with_live_summary(mut self) -> Self {
        self.live_summary = true;
        self
    }

    pub fn with_time_dtype(mut self, dtype: DType) -> Self {
        self.time_dtype = dtype;
        self
    }
}

/// Read-only table of quantities and combined-column groups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuantityRegistry {
    quantities: BTreeMap<String, QuantitySpec>,
    #[serde(default)]
    groups: BTreeMap<String, Vec<String>>,
}

lazy_static! {
    /// The built-in quantity table.
    ///
    /// Built once on first use and cloned by [`QuantityRegistry::default`].
    static ref BUILTIN_REGISTRY: QuantityRegistry = builtin();
}

fn builtin() -> QuantityRegistry {
    let specs = [
        QuantitySpec::new("heart_rate", DType::U8).with_box_plot().with_live_summary(),
        QuantitySpec::new("rr_interval", DType::U16).with_box_plot(),
        QuantitySpec::new("spo2", DType::U8).with_box_plot().with_live_summary(),
        QuantitySpec::new("respiration_rate", DType::F32).with_box_plot(),
        QuantitySpec::new("temperature", DType::F32).with_box_plot().with_live_summary(),
        QuantitySpec::new("battery", DType::U8).with_box_plot().with_live_summary(),
        QuantitySpec::new("steps", DType::U32).with_box_plot(),
        QuantitySpec::new("ppg", DType::I24),
        QuantitySpec::new("ppg_ambient", DType::I24),
        QuantitySpec::new("ecg", DType::I24),
        QuantitySpec::new("eeg", DType::I24Be),
        QuantitySpec::new("acc_x", DType::I16),
        QuantitySpec::new("acc_y", DType::I16),
        QuantitySpec::new("acc_z", DType::I16),
        QuantitySpec::new("gyro_x", DType::I16),
        QuantitySpec::new("gyro_y", DType::I16),
        QuantitySpec::new("gyro_z", DType::I16),
        QuantitySpec::new("magn_x", DType::I16),
        QuantitySpec::new("magn_y", DType::I16),
        QuantitySpec::new("magn_z", DType::I16),
    ];

    let mut registry = QuantityRegistry::empty();
    for spec in specs {
        registry.insert(spec);
    }
    for group in ["acc", "gyro", "magn"] {
        let members = ["x", "y", "z"].iter().map(|axis| format!("{}_{}", group, axis)).collect();
        registry.groups.insert(group.to_string(), members);
    }
    registry
}

impl Default for QuantityRegistry {
    fn default() -> Self {
        BUILTIN_REGISTRY.clone()
    }
}

impl QuantityRegistry {
    /// A registry with no quantities at all.
    pub fn empty() -> Self {
        Self { quantities: BTreeMap::new(), groups: BTreeMap::new() }
    }

    /// Parses a registry from JSON and validates its groups.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let registry: QuantityRegistry = serde_json::from_str(json)?;
        registry.validate()?;
        Ok(registry)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        Self::from_json_str(&std::fs::read_to_string(path)?)
    }

    /// Adds or replaces a quantity.
    pub fn insert(&mut self, spec: QuantitySpec) {
        self.quantities.insert(spec.name.clone(), spec);
    }

    /// Adds a combined-column group. Every member must already be registered
    /// and share the first member's time element type.
    pub fn insert_group(&mut self, name: &str, members: &[&str]) -> Result<()> {
        let mut candidate = self.clone();
        candidate.groups.insert(name.to_string(), members.iter().map(|m| m.to_string()).collect());
        candidate.validate()?;
        *self = candidate;
        Ok(())
    }

    /// Looks up a quantity by name.
    pub fn get(&self, name: &str) -> Result<&QuantitySpec> {
        self.quantities.get(name).ok_or_else(|| Error::UnknownQuantity(name.to_string()))
    }

    /// Members of a combined-column group, first member owning the time axis.
    pub fn group(&self, name: &str) -> Result<&[String]> {
        self.groups
            .get(name)
            .map(|m| m.as_slice())
            .ok_or_else(|| Error::InvalidInput(format!("unknown combined-column group '{}'", name)))
    }

    /// The group a quantity belongs to, if any.
    pub fn group_of(&self, quantity: &str) -> Option<(&str, &[String])> {
        self.groups
            .iter()
            .find(|(_, members)| members.iter().any(|m| m == quantity))
            .map(|(name, members)| (name.as_str(), members.as_slice()))
    }

    pub fn quantities(&self) -> impl Iterator<Item = &QuantitySpec> {
        self.quantities.values()
    }

    fn validate(&self) -> Result<()> {
        for (name, members) in &self.groups {
            let Some(first) = members.first() else {
                return Err(Error::InvalidInput(format!("combined-column group '{}' is empty", name)));
            };
            let time_dtype = self.get(first)?.time_dtype;
            for member in members {
                if self.get(member)?.time_dtype != time_dtype {
                    return Err(Error::InvalidInput(format!(
                        "member '{}' of group '{}' does not share the group's time type",
                        member, name
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_lookup() {
        let registry = QuantityRegistry::default();
        let hr = registry.get("heart_rate").unwrap();
        assert_eq!(hr.dtype, DType::U8);
        assert!(hr.box_plot);
        assert!(!registry.get("ppg").unwrap().box_plot);
        assert!(matches!(registry.get("nope"), Err(Error::UnknownQuantity(_))));
    }

    #[test]
    fn test_group_membership() {
        let registry = QuantityRegistry::default();
        assert_eq!(registry.group("acc").unwrap(), ["acc_x", "acc_y", "acc_z"]);
        let (name, members) = registry.group_of("gyro_y").unwrap();
        assert_eq!(name, "gyro");
        assert_eq!(members.len(), 3);
        assert!(registry.group_of("heart_rate").is_none());
    }

    #[test]
    fn test_group_with_unknown_member_rejected() {
        let mut registry = QuantityRegistry::empty();
        registry.insert(QuantitySpec::new("a", DType::I16));
        assert!(registry.insert_group("ab", &["a", "b"]).is_err());
    }
}
