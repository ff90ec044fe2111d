//! In-memory columnar tables
//!
//! Report files are wide tables keyed by `scenario_name`. [`Table`] keeps the
//! handful of column types those reports use, each cell nullable:
//!
//! | [`Column`] | Arrow source types |
//! |---|---|
//! | `Text` | `Utf8`, `LargeUtf8`, `Utf8View` |
//! | `Float` | any numeric type (cast to `f64`) |
//! | `Bool` | `Boolean` |
//! | `FloatList` | list of numeric |
//! | `FloatLists` | list of list of numeric |
//!
//! Null elements inside lists become NaN.
//!
//! [`Table::left_join`] keeps every row of the left table in order; rows
//! without a match get null in the added columns.

use std::{
    collections::HashMap,
    fs::File,
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use arrow::{
    array::{Array, ArrayRef, AsArray, new_empty_array},
    compute::cast,
    datatypes::{DataType, Field, Float64Type},
    error::ArrowError,
};
use parquet::{
    arrow::{ProjectionMask, arrow_reader::ParquetRecordBatchReaderBuilder},
    errors::ParquetError,
};

#[derive(Debug, derive_more::Display, derive_more::Error)]
pub enum TableError {
    #[display("Failed to open {}", path.display())]
    Open { path: PathBuf, source: io::Error },
    #[display("Failed to read parquet file {}", path.display())]
    Parquet {
        path: PathBuf,
        source: ParquetError,
    },
    #[display("Failed to read record batch from {}", path.display())]
    Batch { path: PathBuf, source: ArrowError },
    #[display("Failed to decode column '{column}'")]
    Arrow { column: String, source: ArrowError },
    #[display("Missing columns {columns:?} in {table}")]
    MissingColumns { table: String, columns: Vec<String> },
    #[display("Column '{column}' has unsupported type {data_type}")]
    UnsupportedType { column: String, data_type: String },
    #[display("Column '{column}' is {actual}, expected {expected}")]
    TypeMismatch {
        column: String,
        expected: &'static str,
        actual: &'static str,
    },
    #[display("Column '{column}' has {actual} rows, table has {expected}")]
    LengthMismatch {
        column: String,
        expected: usize,
        actual: usize,
    },
    #[display("Column '{column}' already exists")]
    DuplicateColumn { column: String },
    #[display("Failed to write CSV file {}", path.display())]
    Csv { path: PathBuf, source: csv::Error },
    #[display("Failed to encode list cell of column '{column}'")]
    Json {
        column: String,
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Column {
    Text(Vec<Option<String>>),
    Float(Vec<Option<f64>>),
    Bool(Vec<Option<bool>>),
    FloatList(Vec<Option<Vec<f64>>>),
    FloatLists(Vec<Option<Vec<Vec<f64>>>>),
}

fn pick<T: Clone>(values: &[Option<T>], rows: &[Option<usize>]) -> Vec<Option<T>> {
    rows.iter()
        .map(|row| row.and_then(|i| values[i].clone()))
        .collect()
}

fn keep<T: Clone>(values: &[Option<T>], mask: &[bool]) -> Vec<Option<T>> {
    values
        .iter()
        .zip(mask)
        .filter(|(_, keep)| **keep)
        .map(|(v, _)| v.clone())
        .collect()
}

impl Column {
    /// Non-null text column.
    pub fn text<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Column::Text(values.into_iter().map(|v| Some(v.into())).collect())
    }

    /// Non-null float column.
    pub fn float<I>(values: I) -> Self
    where
        I: IntoIterator<Item = f64>,
    {
        Column::Float(values.into_iter().map(Some).collect())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Column::Text(v) => v.len(),
            Column::Float(v) => v.len(),
            Column::Bool(v) => v.len(),
            Column::FloatList(v) => v.len(),
            Column::FloatLists(v) => v.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Column::Text(_) => "text",
            Column::Float(_) => "float",
            Column::Bool(_) => "bool",
            Column::FloatList(_) => "float list",
            Column::FloatLists(_) => "list of float lists",
        }
    }

    #[must_use]
    pub fn is_null(&self, row: usize) -> bool {
        match self {
            Column::Text(v) => v[row].is_none(),
            Column::Float(v) => v[row].is_none(),
            Column::Bool(v) => v[row].is_none(),
            Column::FloatList(v) => v[row].is_none(),
            Column::FloatLists(v) => v[row].is_none(),
        }
    }

    /// Gathers `rows` from this column; `None` produces a null cell.
    #[must_use]
    pub fn take(&self, rows: &[Option<usize>]) -> Column {
        match self {
            Column::Text(v) => Column::Text(pick(v, rows)),
            Column::Float(v) => Column::Float(pick(v, rows)),
            Column::Bool(v) => Column::Bool(pick(v, rows)),
            Column::FloatList(v) => Column::FloatList(pick(v, rows)),
            Column::FloatLists(v) => Column::FloatLists(pick(v, rows)),
        }
    }

    #[must_use]
    pub fn filter(&self, mask: &[bool]) -> Column {
        match self {
            Column::Text(v) => Column::Text(keep(v, mask)),
            Column::Float(v) => Column::Float(keep(v, mask)),
            Column::Bool(v) => Column::Bool(keep(v, mask)),
            Column::FloatList(v) => Column::FloatList(keep(v, mask)),
            Column::FloatLists(v) => Column::FloatLists(keep(v, mask)),
        }
    }

    fn append(&mut self, name: &str, other: Column) -> Result<(), TableError> {
        match (self, other) {
            (Column::Text(a), Column::Text(b)) => a.extend(b),
            (Column::Float(a), Column::Float(b)) => a.extend(b),
            (Column::Bool(a), Column::Bool(b)) => a.extend(b),
            (Column::FloatList(a), Column::FloatList(b)) => a.extend(b),
            (Column::FloatLists(a), Column::FloatLists(b)) => a.extend(b),
            (this, other) => {
                return Err(TableError::TypeMismatch {
                    column: name.to_owned(),
                    expected: this.type_name(),
                    actual: other.type_name(),
                });
            }
        }
        Ok(())
    }

    /// Cell rendered for CSV export. Nulls are empty, lists are JSON.
    fn cell_text(&self, name: &str, row: usize) -> Result<String, TableError> {
        let json = |source| TableError::Json {
            column: name.to_owned(),
            source,
        };
        Ok(match self {
            Column::Text(v) => v[row].clone().unwrap_or_default(),
            Column::Float(v) => v[row].map(|x| x.to_string()).unwrap_or_default(),
            Column::Bool(v) => v[row].map(|x| x.to_string()).unwrap_or_default(),
            Column::FloatList(v) => match &v[row] {
                Some(list) => serde_json::to_string(list).map_err(json)?,
                None => String::new(),
            },
            Column::FloatLists(v) => match &v[row] {
                Some(lists) => serde_json::to_string(lists).map_err(json)?,
                None => String::new(),
            },
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    columns: Vec<(String, Column)>,
    num_rows: usize,
}

impl Table {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_columns<I, S>(columns: I) -> Result<Self, TableError>
    where
        I: IntoIterator<Item = (S, Column)>,
        S: Into<String>,
    {
        let mut table = Self::new();
        for (name, column) in columns {
            table.push_column(name, column)?;
        }
        Ok(table)
    }

    #[must_use]
    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    #[must_use]
    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.columns.iter().map(|(name, _)| name.as_str())
    }

    #[must_use]
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, column)| column)
    }

    pub fn require(&self, name: &str) -> Result<&Column, TableError> {
        self.column(name).ok_or_else(|| TableError::MissingColumns {
            table: "table".to_owned(),
            columns: vec![name.to_owned()],
        })
    }

    pub fn text_column(&self, name: &str) -> Result<&[Option<String>], TableError> {
        match self.require(name)? {
            Column::Text(v) => Ok(v),
            other => Err(mismatch(name, "text", other)),
        }
    }

    pub fn float_column(&self, name: &str) -> Result<&[Option<f64>], TableError> {
        match self.require(name)? {
            Column::Float(v) => Ok(v),
            other => Err(mismatch(name, "float", other)),
        }
    }

    pub fn bool_column(&self, name: &str) -> Result<&[Option<bool>], TableError> {
        match self.require(name)? {
            Column::Bool(v) => Ok(v),
            other => Err(mismatch(name, "bool", other)),
        }
    }

    /// Appends a column. The first column of an empty table sets the row count.
    pub fn push_column<S>(&mut self, name: S, column: Column) -> Result<(), TableError>
    where
        S: Into<String>,
    {
        let name = name.into();
        if self.column(&name).is_some() {
            return Err(TableError::DuplicateColumn { column: name });
        }
        if self.columns.is_empty() {
            self.num_rows = column.len();
        } else if column.len() != self.num_rows {
            return Err(TableError::LengthMismatch {
                column: name,
                expected: self.num_rows,
                actual: column.len(),
            });
        }
        self.columns.push((name, column));
        Ok(())
    }

    /// Replaces the column called `name`, or appends it if absent.
    pub fn set_column<S>(&mut self, name: S, column: Column) -> Result<(), TableError>
    where
        S: Into<String>,
    {
        let name = name.into();
        match self.columns.iter().position(|(n, _)| *n == name) {
            Some(i) => {
                if column.len() != self.num_rows {
                    return Err(TableError::LengthMismatch {
                        column: name,
                        expected: self.num_rows,
                        actual: column.len(),
                    });
                }
                self.columns[i].1 = column;
                Ok(())
            }
            None => self.push_column(name, column),
        }
    }

    pub fn rename_column(&mut self, from: &str, to: &str) -> Result<(), TableError> {
        if from == to {
            return self.require(from).map(|_| ());
        }
        if self.column(to).is_some() {
            return Err(TableError::DuplicateColumn {
                column: to.to_owned(),
            });
        }
        let entry = self
            .columns
            .iter_mut()
            .find(|(n, _)| n == from)
            .ok_or_else(|| TableError::MissingColumns {
                table: "table".to_owned(),
                columns: vec![from.to_owned()],
            })?;
        to.clone_into(&mut entry.0);
        Ok(())
    }

    /// Keeps only the rows where `mask` is true.
    #[must_use]
    pub fn filter_rows(&self, mask: &[bool]) -> Table {
        assert_eq!(mask.len(), self.num_rows, "row mask length mismatch");
        Table {
            columns: self
                .columns
                .iter()
                .map(|(name, column)| (name.clone(), column.filter(mask)))
                .collect(),
            num_rows: mask.iter().filter(|m| **m).count(),
        }
    }

    /// Left join on a text `key` column present in both tables.
    ///
    /// The result has exactly the rows of `self`, in order. When `other`
    /// holds the same key more than once, the first occurrence wins.
    pub fn left_join(&self, other: &Table, key: &str) -> Result<Table, TableError> {
        for (label, table) in [("left table", self), ("right table", other)] {
            if table.column(key).is_none() {
                return Err(TableError::MissingColumns {
                    table: label.to_owned(),
                    columns: vec![key.to_owned()],
                });
            }
        }
        let left_keys = self.text_column(key)?;
        let right_keys = other.text_column(key)?;

        let mut index = HashMap::<&str, usize>::new();
        for (i, k) in right_keys.iter().enumerate() {
            if let Some(k) = k {
                index.entry(k.as_str()).or_insert(i);
            }
        }
        let rows = left_keys
            .iter()
            .map(|k| k.as_deref().and_then(|k| index.get(k).copied()))
            .collect::<Vec<_>>();

        let mut joined = self.clone();
        for (name, column) in &other.columns {
            if name == key {
                continue;
            }
            joined.push_column(name.clone(), column.take(&rows))?;
        }
        Ok(joined)
    }

    /// Reads `columns` from a parquet file. Every requested column must exist.
    pub fn read_parquet<S>(path: &Path, columns: &[S]) -> Result<Table, TableError>
    where
        S: AsRef<str>,
    {
        let parquet_err = |source| TableError::Parquet {
            path: path.to_owned(),
            source,
        };
        let file = File::open(path).map_err(|source| TableError::Open {
            path: path.to_owned(),
            source,
        })?;
        let builder = ParquetRecordBatchReaderBuilder::try_new(file).map_err(parquet_err)?;
        let schema = Arc::clone(builder.schema());

        let missing = columns
            .iter()
            .map(AsRef::as_ref)
            .filter(|name| schema.column_with_name(name).is_none())
            .map(str::to_owned)
            .collect::<Vec<_>>();
        if !missing.is_empty() {
            return Err(TableError::MissingColumns {
                table: path.display().to_string(),
                columns: missing,
            });
        }

        let mut indices = vec![];
        let mut table_columns = vec![];
        for name in columns.iter().map(AsRef::as_ref) {
            if let Some((index, field)) = schema.column_with_name(name) {
                indices.push(index);
                let empty = new_empty_array(field.data_type());
                table_columns.push((name.to_owned(), convert_array(name, &empty)?));
            }
        }

        let mask = ProjectionMask::roots(builder.parquet_schema(), indices);
        let reader = builder.with_projection(mask).build().map_err(parquet_err)?;
        for batch in reader {
            let batch = batch.map_err(|source| TableError::Batch {
                path: path.to_owned(),
                source,
            })?;
            for (name, column) in &mut table_columns {
                let Some(array) = batch.column_by_name(name) else {
                    continue;
                };
                column.append(name, convert_array(name, array)?)?;
            }
        }

        Table::from_columns(table_columns)
    }

    pub fn write_csv(&self, path: &Path) -> Result<(), TableError> {
        let file = File::create(path).map_err(|source| TableError::Open {
            path: path.to_owned(),
            source,
        })?;
        self.write_csv_to(file).map_err(|err| match err {
            TableError::Csv { source, .. } => TableError::Csv {
                path: path.to_owned(),
                source,
            },
            other => other,
        })
    }

    /// Writes the table as CSV with a header row.
    pub fn write_csv_to<W>(&self, writer: W) -> Result<(), TableError>
    where
        W: io::Write,
    {
        let csv_err = |source| TableError::Csv {
            path: PathBuf::new(),
            source,
        };
        let mut writer = csv::Writer::from_writer(writer);
        writer
            .write_record(self.column_names())
            .map_err(csv_err)?;
        for row in 0..self.num_rows {
            let record = self
                .columns
                .iter()
                .map(|(name, column)| column.cell_text(name, row))
                .collect::<Result<Vec<_>, _>>()?;
            writer.write_record(&record).map_err(csv_err)?;
        }
        writer.flush().map_err(|source| csv_err(source.into()))
    }
}

fn mismatch(name: &str, expected: &'static str, actual: &Column) -> TableError {
    TableError::TypeMismatch {
        column: name.to_owned(),
        expected,
        actual: actual.type_name(),
    }
}

fn list_type(item: DataType) -> DataType {
    DataType::List(Arc::new(Field::new("item", item, true)))
}

fn is_list(data_type: &DataType) -> bool {
    matches!(
        data_type,
        DataType::List(_) | DataType::LargeList(_) | DataType::FixedSizeList(..)
    )
}

fn float_values(array: &dyn Array) -> Option<Vec<f64>> {
    let values = array.as_primitive_opt::<Float64Type>()?;
    Some(values.iter().map(|v| v.unwrap_or(f64::NAN)).collect())
}

fn convert_array(column: &str, array: &ArrayRef) -> Result<Column, TableError> {
    let unsupported = || TableError::UnsupportedType {
        column: column.to_owned(),
        data_type: array.data_type().to_string(),
    };
    let cast_to = |target: &DataType| {
        cast(array, target).map_err(|source| TableError::Arrow {
            column: column.to_owned(),
            source,
        })
    };

    match array.data_type() {
        DataType::Utf8 | DataType::LargeUtf8 | DataType::Utf8View => {
            let array = cast_to(&DataType::Utf8)?;
            let strings = array.as_string_opt::<i32>().ok_or_else(unsupported)?;
            Ok(Column::Text(
                strings.iter().map(|v| v.map(str::to_owned)).collect(),
            ))
        }
        DataType::Boolean => {
            let bools = array.as_boolean_opt().ok_or_else(unsupported)?;
            Ok(Column::Bool(bools.iter().collect()))
        }
        data_type if data_type.is_numeric() => {
            let array = cast_to(&DataType::Float64)?;
            let values = array
                .as_primitive_opt::<Float64Type>()
                .ok_or_else(unsupported)?;
            Ok(Column::Float(values.iter().collect()))
        }
        DataType::List(field) | DataType::LargeList(field) | DataType::FixedSizeList(field, _)
            if is_list(field.data_type()) =>
        {
            let array = cast_to(&list_type(list_type(DataType::Float64)))?;
            let outer = array.as_list_opt::<i32>().ok_or_else(unsupported)?;
            let mut rows = Vec::with_capacity(outer.len());
            for row in outer.iter() {
                let Some(row) = row else {
                    rows.push(None);
                    continue;
                };
                let inner = row.as_list_opt::<i32>().ok_or_else(unsupported)?;
                let mut lists = Vec::with_capacity(inner.len());
                for values in inner.iter() {
                    match values {
                        Some(values) => {
                            lists.push(float_values(&values).ok_or_else(unsupported)?);
                        }
                        None => lists.push(vec![]),
                    }
                }
                rows.push(Some(lists));
            }
            Ok(Column::FloatLists(rows))
        }
        DataType::List(field) | DataType::LargeList(field) | DataType::FixedSizeList(field, _)
            if field.data_type().is_numeric() =>
        {
            let array = cast_to(&list_type(DataType::Float64))?;
            let outer = array.as_list_opt::<i32>().ok_or_else(unsupported)?;
            let mut rows = Vec::with_capacity(outer.len());
            for row in outer.iter() {
                match row {
                    Some(values) => rows.push(Some(float_values(&values).ok_or_else(unsupported)?)),
                    None => rows.push(None),
                }
            }
            Ok(Column::FloatList(rows))
        }
        _ => Err(unsupported()),
    }
}
