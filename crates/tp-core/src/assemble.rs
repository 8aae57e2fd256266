use ndarray::{s, Array3, ArrayView2};
use thiserror::Error;

use crate::mode::SchemaDescriptor;
use crate::record::RawRecord;

/// One record assembled into its persisted form. `sequence_id` is assigned
/// by the orchestrator, and only for records that pass the validity filter.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    /// One (rows, cols, channels) tensor per year label, in year-label order.
    pub tensors: Vec<Array3<f32>>,
    pub lat: f32,
    pub lng: f32,
    pub urban_share: f32,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AssembleError {
    #[error("record is missing field {name:?}")]
    MissingField { name: String },
    #[error("field {name:?} has {actual} elements, expected {expected}")]
    FieldLength {
        name: String,
        expected: usize,
        actual: usize,
    },
}

/// Stacks the per-year channel grids into channel-last tensors, extracts the
/// center-cell coordinates, and scores the urban mask.
pub fn assemble(schema: &SchemaDescriptor, raw: &RawRecord) -> Result<Observation, AssembleError> {
    let rows = schema.rows;
    let cols = schema.cols;
    let channels = schema.channels();

    let mut tensors = Vec::with_capacity(schema.year_labels.len());
    for year in &schema.year_labels {
        let mut tensor = Array3::<f32>::zeros((rows, cols, channels));
        for (ci, channel) in schema.channel_names.iter().enumerate() {
            let name = format!("{channel}_{year}");
            let values = checked_field(schema, raw, &name)?;
            let grid = ArrayView2::from_shape((rows, cols), values)
                .map_err(|_| AssembleError::FieldLength {
                    name: name.clone(),
                    expected: schema.cells(),
                    actual: values.len(),
                })?;
            tensor.slice_mut(s![.., .., ci]).assign(&grid);
        }
        tensors.push(tensor);
    }

    let lat_grid = checked_field(schema, raw, "latitude")?;
    let lng_grid = checked_field(schema, raw, "longitude")?;
    let urban = checked_field(schema, raw, "urban")?;

    let center = (rows / 2) * cols + cols / 2;

    Ok(Observation {
        tensors,
        lat: lat_grid[center],
        lng: lng_grid[center],
        urban_share: nan_zero_mean(urban),
    })
}

fn checked_field<'a>(
    schema: &SchemaDescriptor,
    raw: &'a RawRecord,
    name: &str,
) -> Result<&'a [f32], AssembleError> {
    let values = raw.field(name).ok_or_else(|| AssembleError::MissingField {
        name: name.to_string(),
    })?;
    if values.len() != schema.cells() {
        return Err(AssembleError::FieldLength {
            name: name.to_string(),
            expected: schema.cells(),
            actual: values.len(),
        });
    }
    Ok(values)
}

/// Mean with NaN entries zeroed first (not excluded). An all-NaN grid
/// therefore scores exactly 0.0.
fn nan_zero_mean(values: &[f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sum = 0f64;
    for &v in values {
        if !v.is_nan() {
            sum += f64::from(v);
        }
    }
    (sum / values.len() as f64) as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mode::Mode;

    fn mw_record_with(urban: Vec<f32>, lat_center: f32, lng_center: f32) -> RawRecord {
        let schema = Mode::Mw.config();
        let cells = schema.cells();
        let mut raw = RawRecord::default();
        for name in schema.field_names() {
            raw.insert(name, vec![0.0; cells]);
        }
        raw.insert("urban".to_string(), urban);

        let center = (schema.rows / 2) * schema.cols + schema.cols / 2;
        let mut lat = vec![0.0f32; cells];
        let mut lng = vec![0.0f32; cells];
        lat[center] = lat_center;
        lng[center] = lng_center;
        raw.insert("latitude".to_string(), lat);
        raw.insert("longitude".to_string(), lng);
        raw
    }

    #[test]
    fn coordinates_come_from_the_center_cell() {
        let schema = Mode::Mw.config();
        let raw = mw_record_with(vec![0.0; schema.cells()], 41.25, -96.0);
        let obs = assemble(&schema, &raw).unwrap();
        assert_eq!(obs.lat, 41.25);
        assert_eq!(obs.lng, -96.0);
    }

    #[test]
    fn urban_share_zeroes_nan_before_averaging() {
        let schema = Mode::Mw.config();
        let cells = schema.cells();
        // Half the grid is NaN: the mean divides by the full cell count.
        let mut urban = vec![1.0f32; cells];
        for v in urban.iter_mut().take(cells / 2) {
            *v = f32::NAN;
        }
        let obs = assemble(&schema, &mw_record_with(urban, 0.0, 0.0)).unwrap();
        assert!((obs.urban_share - 0.5).abs() < 1e-6);
    }

    #[test]
    fn all_nan_urban_grid_scores_exactly_zero() {
        let schema = Mode::Mw.config();
        let urban = vec![f32::NAN; schema.cells()];
        let obs = assemble(&schema, &mw_record_with(urban, 0.0, 0.0)).unwrap();
        assert_eq!(obs.urban_share, 0.0);
    }

    #[test]
    fn constant_urban_grid_scores_its_value() {
        let schema = Mode::Mw.config();
        let urban = vec![0.1f32; schema.cells()];
        let obs = assemble(&schema, &mw_record_with(urban, 0.0, 0.0)).unwrap();
        assert_eq!(obs.urban_share, 0.1);
    }

    #[test]
    fn tensors_are_channel_last() {
        let schema = Mode::Mw.config();
        let cells = schema.cells();
        let mut raw = mw_record_with(vec![0.0; cells], 0.0, 0.0);
        // Mark channel "blue" (index 2) of year "10" (index 1) at cell (3, 7).
        let mut blue = vec![0.0f32; cells];
        blue[3 * schema.cols + 7] = 9.5;
        raw.insert("blue_10".to_string(), blue);

        let obs = assemble(&schema, &raw).unwrap();
        assert_eq!(obs.tensors.len(), 3);
        assert_eq!(obs.tensors[1].dim(), (108, 108, 10));
        assert_eq!(obs.tensors[1][[3, 7, 2]], 9.5);
        assert_eq!(obs.tensors[1][[3, 7, 1]], 0.0);
        assert_eq!(obs.tensors[0][[3, 7, 2]], 0.0);
    }

    #[test]
    fn missing_field_is_reported_by_name() {
        let schema = Mode::Mw.config();
        let mut raw = mw_record_with(vec![0.0; schema.cells()], 0.0, 0.0);
        raw.fields.remove("B5_15");
        let err = assemble(&schema, &raw).unwrap_err();
        assert_eq!(
            err,
            AssembleError::MissingField {
                name: "B5_15".to_string()
            }
        );
    }

    #[test]
    fn short_field_is_rejected() {
        let schema = Mode::Mw.config();
        let mut raw = mw_record_with(vec![0.0; schema.cells()], 0.0, 0.0);
        raw.insert("urban".to_string(), vec![0.0; 4]);
        let err = assemble(&schema, &raw).unwrap_err();
        assert!(matches!(err, AssembleError::FieldLength { actual: 4, .. }));
    }
}
