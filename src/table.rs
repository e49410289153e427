//! Minimal record/schema store for measurement outputs.
//!
//! The measurement algorithms only need a narrow attribute-store surface:
//! named double and flag fields, an alias map, "slot" indirection for the
//! canonical centroid/shape measurements, a footprint with peaks, and a
//! metadata list store. This module provides a small concrete
//! implementation of exactly that surface; the real catalog system of a
//! host pipeline can stand in anywhere these types appear.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::errors::MeasureError;
use crate::geom::Quadrupole;

/// Alias under which the canonical centroid measurement is registered.
pub const CENTROID_SLOT: &str = "slot_Centroid";
/// Alias under which the canonical shape measurement is registered.
pub const SHAPE_SLOT: &str = "slot_Shape";

/// The storage type of a schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// A double-precision value field.
    Double,
    /// A boolean flag field.
    Flag,
}

#[derive(Debug, Clone)]
struct Field {
    kind: FieldKind,
    #[allow(dead_code)]
    doc: String,
}

/// Field layout shared by all records of one catalog.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    fields: BTreeMap<String, Field>,
    aliases: BTreeMap<String, String>,
}

impl Schema {
    /// An empty schema.
    pub fn new() -> Self {
        Self::default()
    }

    /// Join name parts with the field separator.
    pub fn join(parts: &[&str]) -> String {
        parts.join("_")
    }

    /// Register a double field.
    pub fn add_double(&mut self, name: &str, doc: &str) -> Result<(), MeasureError> {
        self.add_field(name, FieldKind::Double, doc)
    }

    /// Register a flag field.
    pub fn add_flag(&mut self, name: &str, doc: &str) -> Result<(), MeasureError> {
        self.add_field(name, FieldKind::Flag, doc)
    }

    fn add_field(&mut self, name: &str, kind: FieldKind, doc: &str) -> Result<(), MeasureError> {
        if self.fields.contains_key(name) {
            return Err(MeasureError::Logic(format!(
                "field '{name}' is already registered"
            )));
        }
        self.fields.insert(
            name.to_string(),
            Field {
                kind,
                doc: doc.to_string(),
            },
        );
        Ok(())
    }

    /// True if the (alias-resolved) name refers to a registered field.
    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(&self.apply_alias(name))
    }

    /// Storage kind of the (alias-resolved) field, if registered.
    pub fn kind(&self, name: &str) -> Option<FieldKind> {
        self.fields.get(&self.apply_alias(name)).map(|f| f.kind)
    }

    /// Define an alias; reads and writes of `from` resolve to `to`.
    pub fn set_alias(&mut self, from: &str, to: &str) {
        self.aliases.insert(from.to_string(), to.to_string());
    }

    /// Resolve a name through the alias map.
    ///
    /// The longest alias key matching the whole name or a `_`-bounded
    /// prefix of it is substituted, once.
    pub fn apply_alias(&self, name: &str) -> String {
        let mut best: Option<(&str, &str)> = None;
        for (key, target) in &self.aliases {
            let is_match = name == key
                || (name.starts_with(key.as_str()) && name.as_bytes().get(key.len()) == Some(&b'_'));
            if is_match && best.map_or(true, |(bk, _)| key.len() > bk.len()) {
                best = Some((key, target));
            }
        }
        match best {
            Some((key, target)) => format!("{target}{}", &name[key.len()..]),
            None => name.to_string(),
        }
    }

    /// Point the centroid slot at a measurement prefix.
    pub fn define_centroid_slot(&mut self, target: &str) {
        self.set_alias(CENTROID_SLOT, target);
    }

    /// Prefix of the centroid slot, when defined with usable fields.
    pub fn centroid_slot(&self) -> Option<String> {
        let target = self.aliases.get(CENTROID_SLOT)?;
        let have_fields = self.fields.contains_key(&Schema::join(&[target, "x"]))
            && self.fields.contains_key(&Schema::join(&[target, "y"]));
        have_fields.then(|| target.clone())
    }

    /// Resolved name of the centroid slot's flag field, when registered.
    pub fn centroid_flag_field(&self) -> Option<String> {
        let resolved = self.apply_alias(&Schema::join(&[CENTROID_SLOT, "flag"]));
        self.fields.contains_key(&resolved).then_some(resolved)
    }

    /// Point the shape slot at a measurement prefix.
    pub fn define_shape_slot(&mut self, target: &str) {
        self.set_alias(SHAPE_SLOT, target);
    }

    /// Prefix of the shape slot, when defined with usable fields.
    pub fn shape_slot(&self) -> Option<String> {
        let target = self.aliases.get(SHAPE_SLOT)?;
        let have_fields = ["xx", "yy", "xy"]
            .iter()
            .all(|f| self.fields.contains_key(&Schema::join(&[target, f])));
        have_fields.then(|| target.clone())
    }

    /// Resolved name of the shape slot's flag field, when registered.
    pub fn shape_flag_field(&self) -> Option<String> {
        let resolved = self.apply_alias(&Schema::join(&[SHAPE_SLOT, "flag"]));
        self.fields.contains_key(&resolved).then_some(resolved)
    }
}

/// A detected peak inside a footprint.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Peak {
    /// Column coordinate of the peak.
    pub fx: f64,
    /// Row coordinate of the peak.
    pub fy: f64,
}

/// The detected pixels of a source, reduced to its ordered peak list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Footprint {
    peaks: Vec<Peak>,
}

impl Footprint {
    /// Create a footprint from its ordered peaks.
    pub fn new(peaks: Vec<Peak>) -> Self {
        Self { peaks }
    }

    /// The peaks, strongest first.
    pub fn peaks(&self) -> &[Peak] {
        &self.peaks
    }

    /// The strongest peak, if any.
    pub fn first_peak(&self) -> Option<&Peak> {
        self.peaks.first()
    }
}

/// One source's attribute values over a shared schema.
#[derive(Debug, Clone)]
pub struct Record {
    schema: Arc<Schema>,
    doubles: HashMap<String, f64>,
    flags: HashMap<String, bool>,
    footprint: Option<Footprint>,
}

impl Record {
    /// Create an empty record over a schema.
    ///
    /// Unset double fields read as NaN; unset flags read as false.
    pub fn new(schema: Arc<Schema>) -> Self {
        Self {
            schema,
            doubles: HashMap::new(),
            flags: HashMap::new(),
            footprint: None,
        }
    }

    /// The schema this record conforms to.
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Attach the source's footprint.
    pub fn set_footprint(&mut self, footprint: Footprint) {
        self.footprint = Some(footprint);
    }

    /// The source's footprint, if attached.
    pub fn footprint(&self) -> Option<&Footprint> {
        self.footprint.as_ref()
    }

    /// Write a double field (alias-resolved).
    pub fn set_double(&mut self, name: &str, value: f64) {
        let resolved = self.schema.apply_alias(name);
        assert!(
            self.schema.kind(&resolved) == Some(FieldKind::Double),
            "'{resolved}' is not a registered double field"
        );
        self.doubles.insert(resolved, value);
    }

    /// Read a double field (alias-resolved); NaN when unset.
    pub fn get_double(&self, name: &str) -> f64 {
        let resolved = self.schema.apply_alias(name);
        self.doubles.get(&resolved).copied().unwrap_or(f64::NAN)
    }

    /// Write a flag field (alias-resolved).
    pub fn set_flag(&mut self, name: &str, value: bool) {
        let resolved = self.schema.apply_alias(name);
        assert!(
            self.schema.kind(&resolved) == Some(FieldKind::Flag),
            "'{resolved}' is not a registered flag field"
        );
        self.flags.insert(resolved, value);
    }

    /// Read a flag field (alias-resolved); false when unset.
    pub fn get_flag(&self, name: &str) -> bool {
        let resolved = self.schema.apply_alias(name);
        self.flags.get(&resolved).copied().unwrap_or(false)
    }

    /// Centroid slot value, when the slot is defined.
    pub fn centroid(&self) -> Option<(f64, f64)> {
        let prefix = self.schema.centroid_slot()?;
        Some((
            self.get_double(&Schema::join(&[&prefix, "x"])),
            self.get_double(&Schema::join(&[&prefix, "y"])),
        ))
    }

    /// Centroid slot flag, when the flag field exists.
    pub fn centroid_flag(&self) -> Option<bool> {
        let field = self.schema.centroid_flag_field()?;
        Some(self.get_flag(&field))
    }

    /// Shape slot value, when the slot is defined.
    pub fn shape(&self) -> Option<Quadrupole> {
        let prefix = self.schema.shape_slot()?;
        Some(Quadrupole::new(
            self.get_double(&Schema::join(&[&prefix, "xx"])),
            self.get_double(&Schema::join(&[&prefix, "yy"])),
            self.get_double(&Schema::join(&[&prefix, "xy"])),
        ))
    }

    /// Shape slot flag, when the flag field exists.
    pub fn shape_flag(&self) -> Option<bool> {
        let field = self.schema.shape_flag_field()?;
        Some(self.get_flag(&field))
    }
}

/// One flag an algorithm can raise, with its field suffix and docstring.
#[derive(Debug, Clone, Copy)]
pub struct FlagDefinition {
    /// Field name suffix (joined under the algorithm prefix).
    pub name: &'static str,
    /// Human-readable description recorded in the schema.
    pub doc: &'static str,
}

/// Ordered set of flag fields registered under one prefix.
///
/// Flag number 0 is the general failure flag by convention. Excluded
/// definitions keep their number but have no backing field, and setting
/// them is a no-op.
#[derive(Debug, Clone)]
pub struct FlagHandler {
    names: Vec<Option<String>>,
}

impl FlagHandler {
    /// Register every definition under `prefix`.
    pub fn add_fields(
        schema: &mut Schema,
        prefix: &str,
        defs: &[FlagDefinition],
    ) -> Result<Self, MeasureError> {
        Self::add_fields_excluding(schema, prefix, defs, &[])
    }

    /// Register definitions under `prefix`, skipping the named exclusions.
    pub fn add_fields_excluding(
        schema: &mut Schema,
        prefix: &str,
        defs: &[FlagDefinition],
        exclude: &[&str],
    ) -> Result<Self, MeasureError> {
        let mut names = Vec::with_capacity(defs.len());
        for def in defs {
            if exclude.contains(&def.name) {
                names.push(None);
                continue;
            }
            let full = Schema::join(&[prefix, def.name]);
            schema.add_flag(&full, def.doc)?;
            names.push(Some(full));
        }
        Ok(Self { names })
    }

    /// Number of flag definitions (including exclusions).
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// True when no flags are defined.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Index of the general failure flag.
    pub fn failure_flag_number(&self) -> usize {
        0
    }

    /// Set flag `index` on a record.
    pub fn set_value(&self, record: &mut Record, index: usize, value: bool) {
        if let Some(Some(name)) = self.names.get(index) {
            record.set_flag(name, value);
        }
    }

    /// Read flag `index` from a record.
    pub fn get_value(&self, record: &Record, index: usize) -> bool {
        match self.names.get(index) {
            Some(Some(name)) => record.get_flag(name),
            _ => false,
        }
    }

    /// Record a failure: raise the general flag, plus a measurement
    /// error's specific flag when one is given.
    pub fn handle_failure(&self, record: &mut Record, error: Option<&MeasureError>) {
        self.set_value(record, self.failure_flag_number(), true);
        if let Some(MeasureError::Measurement { flag, .. }) = error {
            self.set_value(record, *flag, true);
        }
    }
}

/// String-keyed lists of doubles recorded at algorithm registration time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metadata {
    values: BTreeMap<String, Vec<f64>>,
}

impl Metadata {
    /// An empty metadata store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one value under a key.
    pub fn add(&mut self, name: &str, value: f64) {
        self.values.entry(name.to_string()).or_default().push(value);
    }

    /// All values recorded under a key.
    pub fn get(&self, name: &str) -> Option<&[f64]> {
        self.values.get(name).map(|v| v.as_slice())
    }
}
