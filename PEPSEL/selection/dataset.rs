use std::{collections::HashSet, fs::File, io::Read, path::Path};

use indexmap::IndexMap;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SelectionError};

/// Column roles of a delimited descriptor table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    /// Unique sample identifier column.
    pub id_column: String,
    /// Raw target column (never treated as a descriptor).
    pub target_column: String,
    /// Non-descriptor columns removed before the engine sees the table.
    #[serde(default)]
    pub drop_columns: Vec<String>,
}

/// How the raw target column becomes the modelled target.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TargetTransform {
    /// Use the raw value as a continuous target.
    #[default]
    Continuous,
    /// Binary label: `1` when the raw value is at most `threshold`, else `0`.
    Binarize {
        /// Inclusive upper bound of the positive class.
        threshold: f64,
    },
    /// Keep only rows whose raw value is at most `threshold`, target unchanged.
    AtMost {
        /// Inclusive upper bound of retained rows.
        threshold: f64,
    },
}

/// Immutable table of samples, named numeric descriptors and one target.
///
/// Descriptor order is the column order of the source table and is the
/// iteration order used everywhere candidates are enumerated.
#[derive(Debug, Clone)]
pub struct Dataset {
    ids: Vec<String>,
    descriptors: IndexMap<String, usize>,
    features: Array2<f64>,
    target: Array1<f64>,
}

impl Dataset {
    /// Builds a dataset after validating its invariants.
    pub fn new(
        ids: Vec<String>,
        descriptor_names: Vec<String>,
        features: Array2<f64>,
        target: Array1<f64>,
    ) -> Result<Self> {
        let (rows, cols) = features.dim();
        if ids.len() != rows || target.len() != rows {
            return Err(SelectionError::Dataset(format!(
                "row count mismatch: {} ids, {} feature rows, {} targets",
                ids.len(),
                rows,
                target.len()
            )));
        }
        if descriptor_names.len() != cols {
            return Err(SelectionError::Dataset(format!(
                "{} descriptor names for {} columns",
                descriptor_names.len(),
                cols
            )));
        }
        let mut seen = HashSet::with_capacity(ids.len());
        if let Some(dup) = ids.iter().find(|id| !seen.insert(id.as_str())) {
            return Err(SelectionError::Dataset(format!("duplicate sample id `{dup}`")));
        }
        let mut descriptors = IndexMap::with_capacity(cols);
        for (idx, name) in descriptor_names.into_iter().enumerate() {
            if descriptors.insert(name.clone(), idx).is_some() {
                return Err(SelectionError::Dataset(format!("duplicate descriptor `{name}`")));
            }
        }
        if let Some(((row, col), _)) = features.indexed_iter().find(|(_, v)| !v.is_finite()) {
            return Err(SelectionError::Dataset(format!(
                "non-finite value in row `{}`, descriptor `{}`",
                ids[row],
                descriptors.get_index(col).map_or("?", |(name, _)| name.as_str())
            )));
        }
        if let Some(row) = target.iter().position(|v| !v.is_finite()) {
            return Err(SelectionError::Dataset(format!(
                "non-finite target in row `{}`",
                ids[row]
            )));
        }
        Ok(Self {
            ids,
            descriptors,
            features,
            target,
        })
    }

    /// Loads a comma-delimited table from disk.
    pub fn from_csv(path: impl AsRef<Path>, schema: &TableSchema) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        Self::from_reader(file, schema)
    }

    /// Parses a comma-delimited table with a header row.
    pub fn from_reader<R: Read>(reader: R, schema: &TableSchema) -> Result<Self> {
        let table = RawTable::read(reader)?;
        let id_col = table.position(&schema.id_column)?;
        let target_col = table.position(&schema.target_column)?;
        let mut excluded: HashSet<usize> = [id_col, target_col].into_iter().collect();
        for name in &schema.drop_columns {
            excluded.insert(table.position(name)?);
        }
        let ids = table.text_column(id_col);
        let target = table.numeric_column(target_col)?;
        let (names, features) = table.descriptor_block(&excluded)?;
        Self::new(ids, names, features, Array1::from(target))
    }

    /// Applies a target transform, returning the derived dataset.
    pub fn with_target(self, transform: TargetTransform) -> Result<Self> {
        match transform {
            TargetTransform::Continuous => Ok(self),
            TargetTransform::Binarize { threshold } => {
                let labels = self
                    .target
                    .mapv(|value| if value <= threshold { 1.0 } else { 0.0 });
                Ok(Self {
                    target: labels,
                    ..self
                })
            }
            TargetTransform::AtMost { threshold } => {
                let keep: Vec<usize> = self
                    .target
                    .iter()
                    .enumerate()
                    .filter(|(_, value)| **value <= threshold)
                    .map(|(idx, _)| idx)
                    .collect();
                if keep.is_empty() {
                    return Err(SelectionError::Dataset(format!(
                        "no rows with target at most {threshold}"
                    )));
                }
                Ok(self.rows(&keep))
            }
        }
    }

    /// Returns the dataset restricted to the given row indices, in order.
    #[must_use]
    pub fn rows(&self, indices: &[usize]) -> Self {
        Self {
            ids: indices.iter().map(|&idx| self.ids[idx].clone()).collect(),
            descriptors: self.descriptors.clone(),
            features: self.features.select(Axis(0), indices),
            target: self.target.select(Axis(0), indices),
        }
    }

    /// Generates a dataset whose target is `3 * x1 + 1` with uniform noise
    /// descriptors `x2..` for tests and demos.
    #[must_use]
    pub fn synthetic(count: usize, feature_dim: usize, seed: u64) -> Self {
        let mut rng = SmallRng::seed_from_u64(seed);
        let feature_dim = feature_dim.max(1);
        let features =
            Array2::from_shape_fn((count, feature_dim), |_| rng.gen_range(0.0..10.0));
        let target = features.column(0).mapv(|x1| 3.0 * x1 + 1.0);
        Self {
            ids: (0..count).map(|idx| format!("sample-{idx:04}")).collect(),
            descriptors: (0..feature_dim)
                .map(|idx| (format!("x{}", idx + 1), idx))
                .collect(),
            features,
            target,
        }
    }

    /// Number of samples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Returns true when the dataset holds no samples.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Number of descriptor columns.
    #[must_use]
    pub fn width(&self) -> usize {
        self.descriptors.len()
    }

    /// Sample identifiers in row order.
    #[must_use]
    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    /// Descriptor names in column order.
    pub fn descriptor_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.descriptors.keys().map(String::as_str)
    }

    /// Returns true when `name` is a descriptor of this dataset.
    #[must_use]
    pub fn has_descriptor(&self, name: &str) -> bool {
        self.descriptors.contains_key(name)
    }

    /// Full descriptor matrix (rows x descriptors).
    #[must_use]
    pub fn features(&self) -> ArrayView2<'_, f64> {
        self.features.view()
    }

    /// Target vector.
    #[must_use]
    pub fn target(&self) -> ArrayView1<'_, f64> {
        self.target.view()
    }

    /// Copies the named descriptor columns, in the order given.
    pub fn columns(&self, names: &[String]) -> Result<Array2<f64>> {
        select_columns(&self.descriptors, &self.features, names)
    }
}

/// Held-out table scored by a fitted pipeline: identifiers, a passthrough
/// label column copied to the output unchanged, and descriptors.
#[derive(Debug, Clone)]
pub struct ScoringTable {
    ids: Vec<String>,
    passthrough: Vec<String>,
    descriptors: IndexMap<String, usize>,
    features: Array2<f64>,
}

impl ScoringTable {
    /// Loads a scoring table from disk.
    pub fn from_csv(
        path: impl AsRef<Path>,
        id_column: &str,
        passthrough_column: &str,
        drop_columns: &[String],
    ) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        Self::from_reader(file, id_column, passthrough_column, drop_columns)
    }

    /// Parses a scoring table with a header row.
    pub fn from_reader<R: Read>(
        reader: R,
        id_column: &str,
        passthrough_column: &str,
        drop_columns: &[String],
    ) -> Result<Self> {
        let table = RawTable::read(reader)?;
        let id_col = table.position(id_column)?;
        let pass_col = table.position(passthrough_column)?;
        let mut excluded: HashSet<usize> = [id_col, pass_col].into_iter().collect();
        for name in drop_columns {
            excluded.insert(table.position(name)?);
        }
        let (names, features) = table.descriptor_block(&excluded)?;
        Ok(Self {
            ids: table.text_column(id_col),
            passthrough: table.text_column(pass_col),
            descriptors: names
                .into_iter()
                .enumerate()
                .map(|(idx, name)| (name, idx))
                .collect(),
            features,
        })
    }

    /// Sample identifiers in row order.
    #[must_use]
    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    /// Passthrough labels in row order.
    #[must_use]
    pub fn passthrough(&self) -> &[String] {
        &self.passthrough
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Returns true when the table holds no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Copies the named descriptor columns, in the order given.
    pub fn columns(&self, names: &[String]) -> Result<Array2<f64>> {
        select_columns(&self.descriptors, &self.features, names)
    }
}

/// Row-aligned source of named descriptor columns.
pub trait DescriptorTable {
    /// Sample identifiers in row order.
    fn row_ids(&self) -> &[String];

    /// Copies the named descriptor columns, in the order given.
    fn descriptor_columns(&self, names: &[String]) -> Result<Array2<f64>>;
}

impl DescriptorTable for Dataset {
    fn row_ids(&self) -> &[String] {
        self.ids()
    }

    fn descriptor_columns(&self, names: &[String]) -> Result<Array2<f64>> {
        self.columns(names)
    }
}

impl DescriptorTable for ScoringTable {
    fn row_ids(&self) -> &[String] {
        self.ids()
    }

    fn descriptor_columns(&self, names: &[String]) -> Result<Array2<f64>> {
        self.columns(names)
    }
}

fn select_columns(
    descriptors: &IndexMap<String, usize>,
    features: &Array2<f64>,
    names: &[String],
) -> Result<Array2<f64>> {
    let indices = names
        .iter()
        .map(|name| {
            descriptors
                .get(name)
                .copied()
                .ok_or_else(|| SelectionError::UnknownDescriptor(name.clone()))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(features.select(Axis(1), &indices))
}

struct RawTable {
    headers: Vec<String>,
    rows: Vec<csv::StringRecord>,
}

impl RawTable {
    fn read<R: Read>(reader: R) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
        let headers = reader.headers()?.iter().map(str::to_owned).collect();
        let rows = reader.records().collect::<std::result::Result<Vec<_>, _>>()?;
        if rows.is_empty() {
            return Err(SelectionError::Dataset("table has no data rows".into()));
        }
        Ok(Self { headers, rows })
    }

    fn position(&self, name: &str) -> Result<usize> {
        self.headers
            .iter()
            .position(|header| header == name)
            .ok_or_else(|| SelectionError::Dataset(format!("column `{name}` not found")))
    }

    fn text_column(&self, col: usize) -> Vec<String> {
        self.rows
            .iter()
            .map(|row| row.get(col).unwrap_or_default().to_owned())
            .collect()
    }

    fn numeric_column(&self, col: usize) -> Result<Vec<f64>> {
        self.rows
            .iter()
            .enumerate()
            .map(|(row_idx, row)| self.parse_cell(row, row_idx, col))
            .collect()
    }

    fn descriptor_block(&self, excluded: &HashSet<usize>) -> Result<(Vec<String>, Array2<f64>)> {
        let cols: Vec<usize> = (0..self.headers.len())
            .filter(|col| !excluded.contains(col))
            .collect();
        let mut features = Array2::zeros((self.rows.len(), cols.len()));
        for (row_idx, row) in self.rows.iter().enumerate() {
            for (out_col, &col) in cols.iter().enumerate() {
                features[[row_idx, out_col]] = self.parse_cell(row, row_idx, col)?;
            }
        }
        let names = cols.iter().map(|&col| self.headers[col].clone()).collect();
        Ok((names, features))
    }

    fn parse_cell(&self, row: &csv::StringRecord, row_idx: usize, col: usize) -> Result<f64> {
        let raw = row.get(col).unwrap_or_default();
        raw.parse::<f64>()
            .ok()
            .filter(|value| value.is_finite())
            .ok_or_else(|| {
                SelectionError::Dataset(format!(
                    "column `{}` row {}: `{raw}` is not a finite number",
                    self.headers[col],
                    row_idx + 1
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = "\
Name,Seq,MBIC,charge,hydrophobicity
p1,KLW,16,3.0,0.5
p2,RRW,128,5.0,0.1
p3,KKL,64,4.0,0.9
";

    fn schema() -> TableSchema {
        TableSchema {
            id_column: "Name".into(),
            target_column: "MBIC".into(),
            drop_columns: vec!["Seq".into()],
        }
    }

    #[test]
    fn loads_descriptors_in_column_order() {
        let dataset = Dataset::from_reader(TABLE.as_bytes(), &schema()).unwrap();
        assert_eq!(dataset.len(), 3);
        assert_eq!(
            dataset.descriptor_names().collect::<Vec<_>>(),
            vec!["charge", "hydrophobicity"]
        );
        assert_eq!(dataset.target().to_vec(), vec![16.0, 128.0, 64.0]);
        let cols = dataset
            .columns(&["hydrophobicity".into(), "charge".into()])
            .unwrap();
        assert_eq!(cols.row(1).to_vec(), vec![0.1, 5.0]);
    }

    #[test]
    fn rejects_non_numeric_descriptor() {
        let schema = TableSchema {
            drop_columns: Vec::new(),
            ..schema()
        };
        let err = Dataset::from_reader(TABLE.as_bytes(), &schema).unwrap_err();
        assert!(err.to_string().contains("`Seq`"));
    }

    #[test]
    fn binarize_marks_low_values_positive() {
        let dataset = Dataset::from_reader(TABLE.as_bytes(), &schema())
            .unwrap()
            .with_target(TargetTransform::Binarize { threshold: 64.0 })
            .unwrap();
        assert_eq!(dataset.target().to_vec(), vec![1.0, 0.0, 1.0]);
    }

    #[test]
    fn at_most_keeps_low_rows() {
        let dataset = Dataset::from_reader(TABLE.as_bytes(), &schema())
            .unwrap()
            .with_target(TargetTransform::AtMost { threshold: 64.0 })
            .unwrap();
        assert_eq!(dataset.ids(), &["p1".to_string(), "p3".to_string()]);
        assert_eq!(dataset.target().to_vec(), vec![16.0, 64.0]);
    }

    #[test]
    fn unknown_descriptor_is_reported() {
        let dataset = Dataset::synthetic(4, 2, 1);
        let err = dataset.columns(&["x9".into()]).unwrap_err();
        assert!(matches!(err, SelectionError::UnknownDescriptor(name) if name == "x9"));
    }

    #[test]
    fn scoring_table_keeps_passthrough() {
        let raw = "Name,Decision Fn,charge\nq1,0.8,2.0\nq2,-0.3,6.0\n";
        let table = ScoringTable::from_reader(raw.as_bytes(), "Name", "Decision Fn", &[]).unwrap();
        assert_eq!(table.passthrough(), &["0.8".to_string(), "-0.3".to_string()]);
        assert_eq!(table.columns(&["charge".into()]).unwrap().column(0).to_vec(), vec![2.0, 6.0]);
    }
}
