//! Content-addressed dataset object (C4).
//!
//! Row/column shape is grounded on `examples/original_source/model.h`'s
//! `row_t`/`variable_t`/`columntype_t`; the wire encoding reuses the same
//! reader/writer primitives as the node codec (`crate::codec`).

use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::ast::{Environment, Variable};
use crate::codec::{
    decode_value, encode_value, read_compressed_uint, read_string, write_compressed_uint,
    write_string,
};
use crate::error::Error;
use crate::value::Value;

pub const HASH_SIZE: usize = 20;
pub type Hash = [u8; HASH_SIZE];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Categorical,
    Continuous,
}

impl ColumnType {
    pub(crate) fn tag(self) -> u8 {
        match self {
            ColumnType::Categorical => 0,
            ColumnType::Continuous => 1,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> Result<Self, Error> {
        match tag {
            0 => Ok(ColumnType::Categorical),
            1 => Ok(ColumnType::Continuous),
            other => Err(Error::UnknownOpcode(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub kind: ColumnType,
}

/// A content-addressed table of rows (§4.4). The hash is computed only over
/// the serialized row payload, not the column metadata, so two datasets with
/// identical rows but differently-named columns collide on the wire -- this
/// mirrors the original's `example_t` identity, which carries no column
/// names at all.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    pub columns: Vec<Column>,
    pub rows: Vec<Vec<Value>>,
    pub hash: Hash,
}

impl Dataset {
    /// Builds a dataset from columns and rows, computing its content hash.
    pub fn new(columns: Vec<Column>, rows: Vec<Vec<Value>>) -> Self {
        let hash = hash_rows(&rows);
        Self {
            columns,
            rows,
            hash,
        }
    }

    /// Projects row `idx` into an interpreter `Environment`, lifting each
    /// column's stored `Value` back to the `Variable` the evaluator expects.
    pub fn environment_for_row(&self, idx: usize) -> Result<Environment, Error> {
        let row = self
            .rows
            .get(idx)
            .ok_or(Error::VarOutOfRange(idx, self.rows.len()))?;
        let vars = row
            .iter()
            .map(|v| match v {
                Value::Category(c) => Variable::Categorical(*c),
                Value::Float(f) => Variable::Continuous(*f),
                Value::Missing => Variable::Missing,
                other => {
                    unreachable!("dataset cell holds non-row value: {:?}", other)
                }
            })
            .collect();
        Ok(Environment::new(vars))
    }
}

/// Encodes only the rows themselves (no leading row count): each row as a
/// compressed-uint length followed by that many encoded values.
fn encode_rows(rows: &[Vec<Value>]) -> Vec<u8> {
    let mut buf = Vec::new();
    for row in rows {
        write_compressed_uint(&mut buf, row.len() as u64);
        for value in row {
            encode_value(&mut buf, value, crate::codec::KEEP_STRINGS);
        }
    }
    buf
}

/// The content hash covers the row count plus every row, matching the
/// serialized row payload that `dataset_write` places on the wire.
fn hash_rows(rows: &[Vec<Value>]) -> Hash {
    let mut hasher = Sha1::new();
    let mut buf = Vec::new();
    write_compressed_uint(&mut buf, rows.len() as u64);
    buf.extend_from_slice(&encode_rows(rows));
    hasher.update(&buf);
    let digest = hasher.finalize();
    let mut out = [0u8; HASH_SIZE];
    out.copy_from_slice(&digest);
    out
}

/// Writes `{row count, column count, columns, rows}` (§4.4).
pub async fn dataset_write<W: AsyncWrite + Unpin>(
    w: &mut W,
    dataset: &Dataset,
) -> Result<(), Error> {
    let mut buf = Vec::new();
    write_compressed_uint(&mut buf, dataset.rows.len() as u64);
    write_compressed_uint(&mut buf, dataset.columns.len() as u64);
    for column in &dataset.columns {
        write_string(&mut buf, &column.name, crate::codec::KEEP_STRINGS);
        buf.push(column.kind.tag());
    }
    buf.extend_from_slice(&encode_rows(&dataset.rows));
    w.write_all(&buf).await?;
    Ok(())
}

/// Reads a dataset written by `dataset_write`, recomputing its hash from the
/// decoded rows rather than trusting a value carried on the wire.
pub async fn dataset_read<R: AsyncRead + Unpin + Send>(r: &mut R) -> Result<Dataset, Error> {
    let num_rows = read_compressed_uint(r).await? as usize;
    let num_columns = read_compressed_uint(r).await? as usize;

    let mut columns = Vec::with_capacity(num_columns);
    for _ in 0..num_columns {
        let name = read_string(r).await?;
        let kind = ColumnType::from_tag(r.read_u8().await?)?;
        columns.push(Column { name, kind });
    }

    let mut rows = Vec::with_capacity(num_rows);
    for _ in 0..num_rows {
        let row_len = read_compressed_uint(r).await? as usize;
        let mut row = Vec::with_capacity(row_len);
        for _ in 0..row_len {
            row.push(decode_value(r).await?);
        }
        rows.push(row);
    }

    Ok(Dataset::new(columns, rows))
}
