//! Safe extraction of upstream centroid and shape inputs.
//!
//! Measurement algorithms consume the canonical centroid/shape "slot" of
//! the record schema. These extractors resolve that input defensively: a
//! missing slot, a NaN value, or an inconsistent slot flag each map to a
//! well-defined fallback, error, or propagated failure flag, so a bad
//! upstream measurement degrades one source instead of poisoning the run.

use crate::errors::MeasureError;
use crate::geom::{Point2, Quadrupole};
use crate::table::{FlagHandler, Record, Schema};

// Validity margin for Ixx·Iyy > (1+ε)·Ixy².
const SHAPE_EPSILON: f64 = 1.0e-6;

fn extract_peak(record: &Record, name: &str) -> Result<Point2, MeasureError> {
    let footprint = record.footprint().ok_or_else(|| {
        MeasureError::Runtime(format!(
            "{name}: centroid slot value is NaN, but no footprint attached to record"
        ))
    })?;
    let peak = footprint.first_peak().ok_or_else(|| {
        MeasureError::Runtime(format!(
            "{name}: centroid slot value is NaN, but footprint has no peaks"
        ))
    })?;
    Ok(Point2::new(peak.fx, peak.fy))
}

/// Resolves the initial centroid for a measurement call.
///
/// A *consumer* requires the centroid slot to point at an algorithm that
/// ran earlier; a *centroider* (an algorithm that itself produces the
/// slot measurement) may fall back to the footprint peak instead.
#[derive(Debug, Clone)]
pub struct SafeCentroidExtractor {
    name: String,
    is_centroider: bool,
}

impl SafeCentroidExtractor {
    /// Wire the extractor into a schema at algorithm construction time.
    ///
    /// Consumers alias `{name}_flag_badCentroid` to the slot's flag field
    /// and fail with a logic error when the slot alias is not yet defined;
    /// centroiders link the slot flag into `{name}_flag_badInitialCentroid`
    /// unless the slot is this very algorithm.
    pub fn new(schema: &mut Schema, name: &str, is_centroider: bool) -> Result<Self, MeasureError> {
        let aliased = Schema::join(&["slot", "Centroid", "flag"]);
        let slot_flag = schema.apply_alias(&aliased);
        if is_centroider {
            if slot_flag != Schema::join(&[name, "flag"]) {
                schema.set_alias(&Schema::join(&[name, "flag", "badInitialCentroid"]), &slot_flag);
            }
        } else {
            if aliased == slot_flag {
                return Err(MeasureError::Logic(format!(
                    "alias for '{aliased}' must be defined before initializing '{name}' plugin"
                )));
            }
            schema.set_alias(&Schema::join(&[name, "flag", "badCentroid"]), &slot_flag);
        }
        Ok(Self {
            name: name.to_string(),
            is_centroider,
        })
    }

    /// Resolve the centroid for one record.
    ///
    /// Sets the algorithm's general failure flag (through `flags`) when a
    /// best-effort fallback or flagged slot value is used.
    pub fn extract(&self, record: &mut Record, flags: &FlagHandler) -> Result<Point2, MeasureError> {
        if record.schema().centroid_slot().is_none() {
            if self.is_centroider {
                return extract_peak(record, &self.name);
            }
            return Err(MeasureError::FatalAlgorithm(format!(
                "{} requires a centroid, but the centroid slot is not defined",
                self.name
            )));
        }
        let (cx, cy) = record.centroid().unwrap_or((f64::NAN, f64::NAN));
        if cx.is_nan() || cy.is_nan() {
            let Some(flag_set) = record.centroid_flag() else {
                if self.is_centroider {
                    return extract_peak(record, &self.name);
                }
                return Err(MeasureError::Runtime(format!(
                    "{}: centroid slot value is NaN, but there is no centroid slot flag \
                     (is the execution order for {} lower than that of the slot centroid?)",
                    self.name, self.name
                )));
            };
            if !flag_set && !self.is_centroider {
                return Err(MeasureError::Runtime(format!(
                    "{}: centroid slot value is NaN, but the centroid slot flag is not set \
                     (is the execution order for {} lower than that of the slot centroid?)",
                    self.name, self.name
                )));
            }
            let peak = extract_peak(record, &self.name)?;
            if !self.is_centroider {
                // the peak is only an approximation of the centroid
                flags.set_value(record, flags.failure_flag_number(), true);
            }
            return Ok(peak);
        }
        if !self.is_centroider && record.centroid_flag() == Some(true) {
            // usable value, but its producer flagged it; proceed best-effort
            flags.set_value(record, flags.failure_flag_number(), true);
        }
        Ok(Point2::new(cx, cy))
    }
}

/// Resolves the upstream shape for a measurement call.
///
/// Shapes are always consumed, never produced, so there is no centroider
/// mode. Beyond NaN screening, validity requires the moments matrix to be
/// comfortably positive definite.
#[derive(Debug, Clone)]
pub struct SafeShapeExtractor {
    name: String,
}

impl SafeShapeExtractor {
    /// Wire the extractor into a schema at algorithm construction time.
    pub fn new(schema: &mut Schema, name: &str) -> Result<Self, MeasureError> {
        let aliased = Schema::join(&["slot", "Shape", "flag"]);
        let slot_flag = schema.apply_alias(&aliased);
        if aliased == slot_flag {
            return Err(MeasureError::Logic(format!(
                "alias for '{aliased}' must be defined before initializing '{name}' plugin"
            )));
        }
        schema.set_alias(&Schema::join(&[name, "flag", "badShape"]), &slot_flag);
        Ok(Self {
            name: name.to_string(),
        })
    }

    /// Resolve the shape for one record.
    pub fn extract(
        &self,
        record: &mut Record,
        flags: &FlagHandler,
    ) -> Result<Quadrupole, MeasureError> {
        let Some(shape) = record.shape() else {
            return Err(MeasureError::FatalAlgorithm(format!(
                "{} requires a shape, but the shape slot is not defined",
                self.name
            )));
        };
        let invalid = shape.ixx.is_nan()
            || shape.iyy.is_nan()
            || shape.ixy.is_nan()
            || shape.ixx * shape.iyy < (1.0 + SHAPE_EPSILON) * shape.ixy * shape.ixy;
        if invalid {
            let Some(flag_set) = record.shape_flag() else {
                return Err(MeasureError::Runtime(format!(
                    "{}: shape slot value is invalid, but there is no shape slot flag \
                     (is the execution order for {} lower than that of the slot shape?)",
                    self.name, self.name
                )));
            };
            if !flag_set {
                return Err(MeasureError::Runtime(format!(
                    "{}: shape slot value is invalid, but the shape slot flag is not set \
                     (is the execution order for {} lower than that of the slot shape?)",
                    self.name, self.name
                )));
            }
            return Err(MeasureError::Measurement {
                message: format!("{}: shape needed, and shape slot measurement failed", self.name),
                flag: flags.failure_flag_number(),
            });
        }
        if record.shape_flag() == Some(true) {
            // usable value, but its producer flagged it; proceed best-effort
            flags.set_value(record, flags.failure_flag_number(), true);
        }
        Ok(shape)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::{FlagDefinition, Footprint, Peak};
    use std::sync::Arc;

    const TEST_FLAGS: &[FlagDefinition] = &[FlagDefinition {
        name: "flag",
        doc: "general failure flag",
    }];

    fn schema_with_centroid_slot() -> Schema {
        let mut schema = Schema::new();
        schema.add_double("ref_Centroid_x", "upstream x").unwrap();
        schema.add_double("ref_Centroid_y", "upstream y").unwrap();
        schema.add_flag("ref_Centroid_flag", "upstream failed").unwrap();
        schema.define_centroid_slot("ref_Centroid");
        schema
    }

    fn schema_with_shape_slot() -> Schema {
        let mut schema = Schema::new();
        schema.add_double("ref_Shape_xx", "upstream xx").unwrap();
        schema.add_double("ref_Shape_yy", "upstream yy").unwrap();
        schema.add_double("ref_Shape_xy", "upstream xy").unwrap();
        schema.add_flag("ref_Shape_flag", "upstream failed").unwrap();
        schema.define_shape_slot("ref_Shape");
        schema
    }

    #[test]
    fn test_consumer_without_slot_is_logic_error() {
        let mut schema = Schema::new();
        assert!(matches!(
            SafeCentroidExtractor::new(&mut schema, "alg", false),
            Err(MeasureError::Logic(_))
        ));
        assert!(matches!(
            SafeShapeExtractor::new(&mut schema, "alg"),
            Err(MeasureError::Logic(_))
        ));
    }

    #[test]
    fn test_centroider_without_slot_is_allowed() {
        let mut schema = Schema::new();
        assert!(SafeCentroidExtractor::new(&mut schema, "alg", true).is_ok());
    }

    #[test]
    fn test_consumer_reads_good_centroid() {
        let mut schema = schema_with_centroid_slot();
        let extractor = SafeCentroidExtractor::new(&mut schema, "alg", false).unwrap();
        let handler = FlagHandler::add_fields(&mut schema, "alg", TEST_FLAGS).unwrap();
        let mut record = Record::new(Arc::new(schema));
        record.set_double("ref_Centroid_x", 4.0);
        record.set_double("ref_Centroid_y", 5.0);

        let point = extractor.extract(&mut record, &handler).unwrap();
        assert_eq!((point.x, point.y), (4.0, 5.0));
        assert!(!handler.get_value(&record, 0));
    }

    #[test]
    fn test_flagged_centroid_propagates_failure() {
        let mut schema = schema_with_centroid_slot();
        let extractor = SafeCentroidExtractor::new(&mut schema, "alg", false).unwrap();
        let handler = FlagHandler::add_fields(&mut schema, "alg", TEST_FLAGS).unwrap();
        let mut record = Record::new(Arc::new(schema));
        record.set_double("ref_Centroid_x", 4.0);
        record.set_double("ref_Centroid_y", 5.0);
        record.set_flag("ref_Centroid_flag", true);

        let point = extractor.extract(&mut record, &handler).unwrap();
        assert_eq!((point.x, point.y), (4.0, 5.0));
        assert!(handler.get_value(&record, 0), "failure flag should propagate");
    }

    #[test]
    fn test_nan_centroid_falls_back_to_peak() {
        let mut schema = schema_with_centroid_slot();
        let extractor = SafeCentroidExtractor::new(&mut schema, "alg", false).unwrap();
        let handler = FlagHandler::add_fields(&mut schema, "alg", TEST_FLAGS).unwrap();
        let mut record = Record::new(Arc::new(schema));
        record.set_double("ref_Centroid_x", f64::NAN);
        record.set_double("ref_Centroid_y", 5.0);
        record.set_flag("ref_Centroid_flag", true);
        record.set_footprint(Footprint::new(vec![Peak { fx: 9.0, fy: 11.0 }]));

        let point = extractor.extract(&mut record, &handler).unwrap();
        assert_eq!((point.x, point.y), (9.0, 11.0));
        assert!(handler.get_value(&record, 0));
    }

    #[test]
    fn test_nan_centroid_without_set_flag_is_runtime_error() {
        let mut schema = schema_with_centroid_slot();
        let extractor = SafeCentroidExtractor::new(&mut schema, "alg", false).unwrap();
        let handler = FlagHandler::add_fields(&mut schema, "alg", TEST_FLAGS).unwrap();
        let mut record = Record::new(Arc::new(schema));
        record.set_double("ref_Centroid_x", f64::NAN);
        record.set_double("ref_Centroid_y", 5.0);

        assert!(matches!(
            extractor.extract(&mut record, &handler),
            Err(MeasureError::Runtime(_))
        ));
    }

    #[test]
    fn test_nan_centroid_without_footprint_is_runtime_error() {
        let mut schema = schema_with_centroid_slot();
        let extractor = SafeCentroidExtractor::new(&mut schema, "alg", false).unwrap();
        let handler = FlagHandler::add_fields(&mut schema, "alg", TEST_FLAGS).unwrap();
        let mut record = Record::new(Arc::new(schema));
        record.set_double("ref_Centroid_x", f64::NAN);
        record.set_double("ref_Centroid_y", 5.0);
        record.set_flag("ref_Centroid_flag", true);

        assert!(matches!(
            extractor.extract(&mut record, &handler),
            Err(MeasureError::Runtime(_))
        ));
    }

    #[test]
    fn test_valid_shape_extraction() {
        let mut schema = schema_with_shape_slot();
        let extractor = SafeShapeExtractor::new(&mut schema, "alg").unwrap();
        let handler = FlagHandler::add_fields(&mut schema, "alg", TEST_FLAGS).unwrap();
        let mut record = Record::new(Arc::new(schema));
        record.set_double("ref_Shape_xx", 3.0);
        record.set_double("ref_Shape_yy", 2.0);
        record.set_double("ref_Shape_xy", 0.5);

        let shape = extractor.extract(&mut record, &handler).unwrap();
        assert_eq!(shape, Quadrupole::new(3.0, 2.0, 0.5));
        assert!(!handler.get_value(&record, 0));
    }

    #[test]
    fn test_degenerate_shape_with_flag_is_measurement_error() {
        let mut schema = schema_with_shape_slot();
        let extractor = SafeShapeExtractor::new(&mut schema, "alg").unwrap();
        let handler = FlagHandler::add_fields(&mut schema, "alg", TEST_FLAGS).unwrap();
        let mut record = Record::new(Arc::new(schema));
        // ixx·iyy == ixy² exactly: fails the (1+ε) margin
        record.set_double("ref_Shape_xx", 2.0);
        record.set_double("ref_Shape_yy", 2.0);
        record.set_double("ref_Shape_xy", 2.0);
        record.set_flag("ref_Shape_flag", true);

        match extractor.extract(&mut record, &handler) {
            Err(MeasureError::Measurement { flag, .. }) => assert_eq!(flag, 0),
            other => panic!("expected measurement error, got {other:?}"),
        }
    }

    #[test]
    fn test_degenerate_shape_without_flag_is_runtime_error() {
        let mut schema = schema_with_shape_slot();
        let extractor = SafeShapeExtractor::new(&mut schema, "alg").unwrap();
        let handler = FlagHandler::add_fields(&mut schema, "alg", TEST_FLAGS).unwrap();
        let mut record = Record::new(Arc::new(schema));
        record.set_double("ref_Shape_xx", f64::NAN);
        record.set_double("ref_Shape_yy", 2.0);
        record.set_double("ref_Shape_xy", 0.0);

        assert!(matches!(
            extractor.extract(&mut record, &handler),
            Err(MeasureError::Runtime(_))
        ));
    }
}
