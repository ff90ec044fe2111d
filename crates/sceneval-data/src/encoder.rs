//! Encoder feature archives
//!
//! Planners dump the encoder output of each scenario into a `.npz` archive.
//! Every array in an archive is either `[batch, tokens, dim]` or
//! `[tokens, dim]`; token 0 is the ego vehicle, the remaining tokens are the
//! other agents and map elements.
//!
//! The helpers here turn those archives into plain row matrices: one row per
//! ego embedding, ready to be scaled and scored by [`crate::ood`].

use std::{
    fs::{self, File},
    io,
    path::{Path, PathBuf},
};

use nalgebra::DMatrix;
use ndarray::{
    Array1, Array2, ArrayD, ArrayView2, ArrayViewD, Axis, Ix2, IxDyn, OwnedRepr, concatenate, s,
};
use ndarray_npy::{NpzReader, ReadNpzError};
use tracing::{info, warn};

pub const LAYER_NORM_EPS: f64 = 1e-5;

#[derive(Debug, derive_more::Display, derive_more::Error)]
pub enum EncoderError {
    #[display("Failed to read directory {}", path.display())]
    ReadDir { path: PathBuf, source: io::Error },
    #[display("Failed to open archive {}", path.display())]
    Open { path: PathBuf, source: io::Error },
    #[display("Failed to read archive {}", path.display())]
    Npz {
        path: PathBuf,
        source: ReadNpzError,
    },
    #[display("Array '{name}' has shape {shape:?}, expected [batch, tokens, dim] or [tokens, dim]")]
    UnsupportedShape { name: String, shape: Vec<usize> },
    #[display("Array '{name}' has no other tokens")]
    NoOtherTokens { name: String },
    #[display("Feature dimensions differ: {expected} and {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[display("No feature rows")]
    Empty,
}

/// Arrays of one scenario archive, in archive order.
#[derive(Debug, Clone)]
pub struct ScenarioFeatures {
    pub name: String,
    pub arrays: Vec<(String, ArrayD<f64>)>,
}

impl ScenarioFeatures {
    /// Ego rows of every array, stacked.
    pub fn ego_rows(&self) -> Result<Array2<f64>, EncoderError> {
        let rows = self
            .arrays
            .iter()
            .map(|(name, array)| ego_features(name, array))
            .collect::<Result<Vec<_>, _>>()?;
        stack_rows(&rows)
    }
}

/// Reads every array of an archive as `f64`. Arrays stored as `f32` are widened.
pub fn load_npz(path: &Path) -> Result<Vec<(String, ArrayD<f64>)>, EncoderError> {
    let npz_err = |source| EncoderError::Npz {
        path: path.to_owned(),
        source,
    };
    let file = File::open(path).map_err(|source| EncoderError::Open {
        path: path.to_owned(),
        source,
    })?;
    let mut npz = NpzReader::new(file).map_err(npz_err)?;
    let mut arrays = vec![];
    for name in npz.names().map_err(npz_err)? {
        let array = match npz.by_name::<OwnedRepr<f32>, IxDyn>(&name) {
            Ok(array) => array.mapv(f64::from),
            Err(_) => npz
                .by_name::<OwnedRepr<f64>, IxDyn>(&name)
                .map_err(npz_err)?,
        };
        let name = name.strip_suffix(".npy").unwrap_or(&name).to_owned();
        arrays.push((name, array));
    }
    Ok(arrays)
}

/// Loads every `.npz` archive in `dir`, sorted by file name.
///
/// The scenario name is the file name up to its first `.`. Archives that
/// cannot be read are logged and skipped.
pub fn load_scenario_features(dir: &Path) -> Result<Vec<ScenarioFeatures>, EncoderError> {
    let read_dir_err = |source| EncoderError::ReadDir {
        path: dir.to_owned(),
        source,
    };
    let mut paths = vec![];
    for entry in fs::read_dir(dir).map_err(read_dir_err)? {
        let path = entry.map_err(read_dir_err)?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "npz") {
            paths.push(path);
        }
    }
    paths.sort();

    let mut scenarios = vec![];
    for path in paths {
        let Some(file_name) = path.file_name().and_then(|name| name.to_str()) else {
            warn!("Skipping non UTF-8 file name {}", path.display());
            continue;
        };
        let name = file_name.split('.').next().unwrap_or(file_name).to_owned();
        match load_npz(&path) {
            Ok(arrays) => scenarios.push(ScenarioFeatures { name, arrays }),
            Err(err) => warn!("Failed to load {}: {err}", path.display()),
        }
    }
    info!("Loaded {} scenarios from {}", scenarios.len(), dir.display());
    Ok(scenarios)
}

fn to_2d(name: &str, view: ArrayViewD<'_, f64>) -> Result<Array2<f64>, EncoderError> {
    let shape = view.shape().to_vec();
    view.into_dimensionality::<Ix2>()
        .map(|v| v.to_owned())
        .map_err(|_| EncoderError::UnsupportedShape {
            name: name.to_owned(),
            shape,
        })
}

/// Token 0 of every batch entry: `[batch, dim]`, or `[1, dim]` for 2-D arrays.
pub fn ego_features(name: &str, array: &ArrayD<f64>) -> Result<Array2<f64>, EncoderError> {
    match array.ndim() {
        3 if array.shape()[1] > 0 => to_2d(name, array.index_axis(Axis(1), 0)),
        2 if array.shape()[0] > 0 => {
            to_2d(name, array.index_axis(Axis(0), 0).insert_axis(Axis(0)))
        }
        _ => Err(EncoderError::UnsupportedShape {
            name: name.to_owned(),
            shape: array.shape().to_vec(),
        }),
    }
}

/// Tokens 1.. flattened into rows of `[n, dim]`.
pub fn other_features(name: &str, array: &ArrayD<f64>) -> Result<Array2<f64>, EncoderError> {
    let unsupported = || EncoderError::UnsupportedShape {
        name: name.to_owned(),
        shape: array.shape().to_vec(),
    };
    let rows = match *array.shape() {
        [batch, tokens, dim] => {
            if tokens < 2 {
                return Err(EncoderError::NoOtherTokens {
                    name: name.to_owned(),
                });
            }
            let others = array.slice(s![.., 1.., ..]).to_owned();
            others
                .into_shape_with_order((batch * (tokens - 1), dim))
                .map_err(|_| unsupported())?
        }
        [tokens, _] => {
            if tokens < 2 {
                return Err(EncoderError::NoOtherTokens {
                    name: name.to_owned(),
                });
            }
            array.slice(s![1.., ..]).to_owned()
        }
        _ => return Err(unsupported()),
    };
    Ok(rows)
}

/// Concatenates row blocks of equal width.
pub fn stack_rows(blocks: &[Array2<f64>]) -> Result<Array2<f64>, EncoderError> {
    let Some(first) = blocks.first() else {
        return Err(EncoderError::Empty);
    };
    let dim = first.ncols();
    if let Some(block) = blocks.iter().find(|b| b.ncols() != dim) {
        return Err(EncoderError::DimensionMismatch {
            expected: dim,
            actual: block.ncols(),
        });
    }
    let views = blocks.iter().map(Array2::view).collect::<Vec<ArrayView2<'_, f64>>>();
    concatenate(Axis(0), &views).map_err(|_| EncoderError::Empty)
}

#[must_use]
pub fn column_mean(rows: &Array2<f64>) -> Option<Array1<f64>> {
    rows.mean_axis(Axis(0))
}

/// Sample standard deviation (`ddof = 1`) of every column.
#[must_use]
pub fn column_std(rows: &Array2<f64>) -> Option<Array1<f64>> {
    (rows.nrows() > 1).then(|| rows.std_axis(Axis(0), 1.0))
}

#[must_use]
pub fn column_min(rows: &Array2<f64>) -> Option<Array1<f64>> {
    (rows.nrows() > 0).then(|| rows.fold_axis(Axis(0), f64::INFINITY, |a, b| a.min(*b)))
}

#[must_use]
pub fn column_max(rows: &Array2<f64>) -> Option<Array1<f64>> {
    (rows.nrows() > 0).then(|| rows.fold_axis(Axis(0), f64::NEG_INFINITY, |a, b| a.max(*b)))
}

/// Row-major flattening into a single vector.
#[must_use]
pub fn flatten(rows: &Array2<f64>) -> Array1<f64> {
    rows.iter().copied().collect()
}

/// Normalizes every row to zero mean and unit variance (no affine terms).
#[must_use]
pub fn layer_norm(rows: &Array2<f64>) -> Array2<f64> {
    let mut normalized = rows.clone();
    for mut row in normalized.rows_mut() {
        let Some(mean) = row.mean() else {
            continue;
        };
        let var = row.var(0.0);
        let denom = (var + LAYER_NORM_EPS).sqrt();
        row.mapv_inplace(|v| (v - mean) / denom);
    }
    normalized
}

#[must_use]
pub fn to_dmatrix(rows: &Array2<f64>) -> DMatrix<f64> {
    DMatrix::from_row_iterator(rows.nrows(), rows.ncols(), rows.iter().copied())
}

#[cfg(test)]
pub(crate) mod tests {
    use ndarray::{Array3, array};
    use ndarray_npy::NpzWriter;

    use super::*;

    pub(crate) fn write_npz(path: &Path, arrays: &[(&str, ArrayD<f32>)]) {
        let mut npz = NpzWriter::new(File::create(path).unwrap());
        for (name, array) in arrays {
            npz.add_array(*name, array).unwrap();
        }
        npz.finish().unwrap();
    }

    /// `[batch, tokens, dim]` where element = 100·b + 10·t + d.
    #[expect(clippy::cast_precision_loss)]
    pub(crate) fn encoded(batch: usize, tokens: usize, dim: usize) -> ArrayD<f32> {
        Array3::from_shape_fn((batch, tokens, dim), |(b, t, d)| {
            (100 * b + 10 * t + d) as f32
        })
        .into_dyn()
    }

    #[test]
    fn test_ego_and_other_features() {
        let array = encoded(2, 3, 2).mapv(f64::from);
        assert_eq!(
            ego_features("x", &array).unwrap(),
            array![[0.0, 1.0], [100.0, 101.0]]
        );
        let others = other_features("x", &array).unwrap();
        assert_eq!(
            others,
            array![[10.0, 11.0], [20.0, 21.0], [110.0, 111.0], [120.0, 121.0]]
        );

        let flat = array![[1.0, 2.0], [3.0, 4.0]].into_dyn();
        assert_eq!(ego_features("y", &flat).unwrap(), array![[1.0, 2.0]]);
        assert_eq!(other_features("y", &flat).unwrap(), array![[3.0, 4.0]]);

        let vector = array![1.0, 2.0].into_dyn();
        assert!(matches!(
            ego_features("z", &vector),
            Err(EncoderError::UnsupportedShape { .. })
        ));
    }

    #[test]
    fn test_column_reductions() {
        let rows = array![[1.0, 4.0], [3.0, 0.0]];
        assert_eq!(column_mean(&rows).unwrap(), array![2.0, 2.0]);
        let std = column_std(&rows).unwrap();
        assert!((std[0] - 2.0_f64.sqrt()).abs() < 1e-12);
        assert_eq!(column_min(&rows).unwrap(), array![1.0, 0.0]);
        assert_eq!(column_max(&rows).unwrap(), array![3.0, 4.0]);
        assert_eq!(flatten(&rows), array![1.0, 4.0, 3.0, 0.0]);
        assert!(column_std(&array![[1.0, 2.0]]).is_none());
    }

    #[test]
    fn test_layer_norm_rows() {
        let normalized = layer_norm(&array![[1.0, 3.0], [5.0, 5.0]]);
        let expected = 1.0 / (1.0 + LAYER_NORM_EPS).sqrt();
        assert!((normalized[[0, 0]] + expected).abs() < 1e-12);
        assert!((normalized[[0, 1]] - expected).abs() < 1e-12);
        assert_eq!(normalized.row(1), array![0.0, 0.0]);
    }

    #[test]
    fn test_stack_rows() {
        let stacked = stack_rows(&[array![[1.0, 2.0]], array![[3.0, 4.0], [5.0, 6.0]]]).unwrap();
        assert_eq!(stacked.nrows(), 3);
        assert!(matches!(
            stack_rows(&[array![[1.0]], array![[1.0, 2.0]]]),
            Err(EncoderError::DimensionMismatch { .. })
        ));
        assert!(matches!(stack_rows(&[]), Err(EncoderError::Empty)));
        assert_eq!(
            to_dmatrix(&stacked),
            DMatrix::from_row_slice(3, 2, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0])
        );
    }

    #[test]
    fn test_load_scenario_features() {
        let dir = tempfile::tempdir().unwrap();
        write_npz(
            &dir.path().join("b_scenario.features.npz"),
            &[("encoding", encoded(1, 3, 2))],
        );
        write_npz(
            &dir.path().join("a_scenario.npz"),
            &[("first", encoded(2, 2, 2)), ("second", encoded(1, 2, 2))],
        );
        fs::write(dir.path().join("broken.npz"), b"not a zip").unwrap();
        fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        let scenarios = load_scenario_features(dir.path()).unwrap();
        let names = scenarios.iter().map(|s| s.name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, ["a_scenario", "b_scenario"]);
        assert_eq!(scenarios[0].arrays.len(), 2);
        assert_eq!(scenarios[0].arrays[0].0, "first");
        assert_eq!(
            scenarios[0].ego_rows().unwrap(),
            array![[0.0, 1.0], [100.0, 101.0], [0.0, 1.0]]
        );
    }

    #[test]
    fn test_load_npz_f64() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wide.npz");
        let mut npz = NpzWriter::new(File::create(&path).unwrap());
        npz.add_array("values", &array![[1.5_f64, 2.5]]).unwrap();
        npz.finish().unwrap();
        let arrays = load_npz(&path).unwrap();
        assert_eq!(arrays[0].0, "values");
        assert_eq!(arrays[0].1, array![[1.5, 2.5]].into_dyn());
    }
}
