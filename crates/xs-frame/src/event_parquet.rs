//! Parquet → [`EventFrame`] reader.
//!
//! Numeric and boolean columns become scalar `f64` columns; `List` /
//! `LargeList` columns of numbers become jagged columns (one vector per
//! event, a null list is an empty vector). Other column types are skipped.
//! Null scalar values read as NaN.

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

use arrow::array::{Array, AsArray, GenericListArray, OffsetSizeTrait};
use arrow::compute::cast;
use arrow::datatypes::{DataType, Float64Type};
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

use crate::error::{FrameError, Result};
use crate::frame::{EventFrame, JaggedColumn};

/// Read every row group of a Parquet file into one frame.
pub fn read_parquet_frame(path: &Path) -> Result<EventFrame> {
    let file = File::open(path)?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;
    let mut acc = Accumulator::default();
    for batch in reader {
        acc.push(&batch?)?;
    }
    log::debug!("read {} rows from {}", acc.rows, path.display());
    acc.finish()
}

/// Concatenate Arrow record batches into one frame.
pub fn frame_from_batches(batches: &[RecordBatch]) -> Result<EventFrame> {
    let mut acc = Accumulator::default();
    for b in batches {
        acc.push(b)?;
    }
    acc.finish()
}

#[derive(Default)]
struct Accumulator {
    rows: usize,
    scalars: HashMap<String, Vec<f64>>,
    jagged: HashMap<String, (Vec<f64>, Vec<usize>)>,
}

impl Accumulator {
    fn push(&mut self, batch: &RecordBatch) -> Result<()> {
        let schema = batch.schema();
        for (field, col) in schema.fields().iter().zip(batch.columns()) {
            let name = field.name();
            match field.data_type() {
                DataType::List(_) => {
                    let (values, offsets) = self.jagged_entry(name);
                    append_list(name, col.as_list::<i32>(), values, offsets)?;
                }
                DataType::LargeList(_) => {
                    let (values, offsets) = self.jagged_entry(name);
                    append_list(name, col.as_list::<i64>(), values, offsets)?;
                }
                dt if dt.is_numeric() || *dt == DataType::Boolean => {
                    let f = cast(col.as_ref(), &DataType::Float64)
                        .map_err(|_| unsupported(name, dt))?;
                    let f = f.as_primitive::<Float64Type>();
                    self.scalars
                        .entry(name.clone())
                        .or_default()
                        .extend(f.iter().map(|v| v.unwrap_or(f64::NAN)));
                }
                dt => log::debug!("skipping column '{name}' of type {dt}"),
            }
        }
        self.rows += batch.num_rows();
        Ok(())
    }

    fn jagged_entry(&mut self, name: &str) -> (&mut Vec<f64>, &mut Vec<usize>) {
        let (v, o) = self.jagged.entry(name.to_string()).or_insert_with(|| (Vec::new(), vec![0]));
        (v, o)
    }

    fn finish(self) -> Result<EventFrame> {
        let mut frame = EventFrame::new();
        for (name, values) in self.scalars {
            frame.insert_column(name, values)?;
        }
        for (name, (values, offsets)) in self.jagged {
            frame.insert_jagged(name, JaggedColumn::new(values, offsets)?)?;
        }
        Ok(frame)
    }
}

fn append_list<O: OffsetSizeTrait>(
    name: &str,
    list: &GenericListArray<O>,
    values: &mut Vec<f64>,
    offsets: &mut Vec<usize>,
) -> Result<()> {
    let flat = cast(list.values().as_ref(), &DataType::Float64)
        .map_err(|_| unsupported(name, list.data_type()))?;
    let flat = flat.as_primitive::<Float64Type>();
    let bounds = list.value_offsets();
    for row in 0..list.len() {
        if !list.is_null(row) {
            let (start, end) = (bounds[row].as_usize(), bounds[row + 1].as_usize());
            values.extend(
                (start..end).map(|i| if flat.is_null(i) { f64::NAN } else { flat.value(i) }),
            );
        }
        offsets.push(values.len());
    }
    Ok(())
}

fn unsupported(name: &str, dt: &DataType) -> FrameError {
    FrameError::UnsupportedType { column: name.to_string(), data_type: dt.to_string() }
}
