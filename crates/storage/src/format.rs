//! Versioned row formats.
//!
//! A table carries one row format per schema version. The wire row image
//! is always encoded against some historical format, and the only way to
//! tell which one is its byte length, so every format has a fixed,
//! deterministic layout:
//!
//! ```text
//! null bitmap (ceil(fields/8) bytes) + fixed-width field cells in order
//! ```
//!
//! Cell widths: Int 4, BigInt 8, Text/Bytes their declared length
//! (NUL-padded), Blob 8 (the blob id, patched in place when the applier
//! materializes staged blob content).

use shadow_core::{Result, ShadowError};

use crate::value::Value;

/// Field type plus its fixed cell width.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldKind {
    /// 32-bit integer cell.
    Int,
    /// 64-bit integer cell.
    BigInt,
    /// Fixed-width NUL-padded text cell.
    Text {
        /// Declared cell width in bytes.
        length: usize,
    },
    /// Fixed-width raw byte cell.
    Bytes {
        /// Declared cell width in bytes.
        length: usize,
    },
    /// Blob reference cell holding a local blob id.
    Blob {
        /// Blob subtype tag carried onto materialized blobs.
        sub_type: u8,
        /// Character set tag carried onto materialized blobs.
        charset: u8,
    },
}

impl FieldKind {
    /// Cell width in bytes.
    pub fn width(&self) -> usize {
        match self {
            FieldKind::Int => 4,
            FieldKind::BigInt => 8,
            FieldKind::Text { length } | FieldKind::Bytes { length } => *length,
            FieldKind::Blob { .. } => 8,
        }
    }
}

/// One field of a row format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    /// Field name.
    pub name: String,
    /// Field type.
    pub kind: FieldKind,
}

impl FieldDescriptor {
    /// Shorthand constructor.
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        FieldDescriptor {
            name: name.into(),
            kind,
        }
    }
}

/// A versioned row format: the decoding key for one historical row layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowFormat {
    /// Format version, starting at 0 for the table's first layout.
    pub version: u16,
    /// Fields in cell order.
    pub fields: Vec<FieldDescriptor>,
}

impl RowFormat {
    /// Create a format.
    pub fn new(version: u16, fields: Vec<FieldDescriptor>) -> Self {
        RowFormat { version, fields }
    }

    /// Number of fields.
    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    fn bitmap_len(&self) -> usize {
        (self.fields.len() + 7) / 8
    }

    /// Total encoded row length for this format.
    pub fn row_length(&self) -> usize {
        self.bitmap_len() + self.fields.iter().map(|f| f.kind.width()).sum::<usize>()
    }

    /// Byte offset of field `index` inside an encoded row.
    pub fn field_offset(&self, index: usize) -> usize {
        self.bitmap_len()
            + self.fields[..index]
                .iter()
                .map(|f| f.kind.width())
                .sum::<usize>()
    }

    fn check_length(&self, image: &[u8]) -> Result<()> {
        if image.len() != self.row_length() {
            return Err(ShadowError::Engine(format!(
                "row image length {} does not match format version {} (expected {})",
                image.len(),
                self.version,
                self.row_length()
            )));
        }
        Ok(())
    }

    fn is_null(&self, image: &[u8], index: usize) -> bool {
        image[index / 8] & (1 << (index % 8)) != 0
    }

    /// Decode field `index` from an encoded row; `None` is SQL NULL.
    pub fn decode_field(&self, image: &[u8], index: usize) -> Result<Option<Value>> {
        self.check_length(image)?;

        if self.is_null(image, index) {
            return Ok(None);
        }

        let offset = self.field_offset(index);
        let cell = &image[offset..offset + self.fields[index].kind.width()];

        let value = match &self.fields[index].kind {
            FieldKind::Int => Value::Int(i32::from_le_bytes(cell.try_into().unwrap())),
            FieldKind::BigInt => Value::BigInt(i64::from_le_bytes(cell.try_into().unwrap())),
            FieldKind::Text { .. } => {
                let len = cell.iter().position(|&b| b == 0).unwrap_or(cell.len());
                let text = std::str::from_utf8(&cell[..len]).map_err(|_| {
                    ShadowError::Engine(format!(
                        "text field {} holds invalid UTF-8",
                        self.fields[index].name
                    ))
                })?;
                Value::Text(text.to_owned())
            }
            FieldKind::Bytes { .. } => Value::Bytes(cell.to_vec()),
            FieldKind::Blob { .. } => {
                let id = u64::from_le_bytes(cell.try_into().unwrap());
                if id == 0 {
                    // An all-zero blob cell is an empty reference.
                    return Ok(None);
                }
                Value::Blob(id)
            }
        };

        Ok(Some(value))
    }

    /// The local blob id referenced by blob field `index`, if any.
    ///
    /// Returns `None` for NULL fields, empty references, and non-blob
    /// fields alike; the callers iterate blob fields only.
    pub fn blob_reference(&self, image: &[u8], index: usize) -> Result<Option<u64>> {
        if !matches!(self.fields[index].kind, FieldKind::Blob { .. }) {
            return Ok(None);
        }
        match self.decode_field(image, index)? {
            Some(Value::Blob(id)) => Ok(Some(id)),
            _ => Ok(None),
        }
    }

    /// Patch blob field `index` in place with a new local blob id.
    ///
    /// An id of zero clears the reference.
    pub fn set_blob_reference(&self, image: &mut [u8], index: usize, id: u64) -> Result<()> {
        self.check_length(image)?;
        if !matches!(self.fields[index].kind, FieldKind::Blob { .. }) {
            return Err(ShadowError::Engine(format!(
                "field {} is not a blob field",
                self.fields[index].name
            )));
        }

        let offset = self.field_offset(index);
        image[offset..offset + 8].copy_from_slice(&id.to_le_bytes());
        image[index / 8] &= !(1 << (index % 8));
        Ok(())
    }

    /// Encode a full row from field values. Used by tests and by the
    /// in-memory engine; a real engine brings its own encoding.
    pub fn encode(&self, values: &[Option<Value>]) -> Result<Vec<u8>> {
        if values.len() != self.fields.len() {
            return Err(ShadowError::Engine(format!(
                "expected {} field values, got {}",
                self.fields.len(),
                values.len()
            )));
        }

        let mut image = vec![0u8; self.row_length()];

        for (index, (field, value)) in self.fields.iter().zip(values).enumerate() {
            let offset = self.field_offset(index);
            let width = field.kind.width();
            let cell = &mut image[offset..offset + width];

            match (value, &field.kind) {
                (None, _) => {
                    image[index / 8] |= 1 << (index % 8);
                }
                (Some(Value::Int(v)), FieldKind::Int) => {
                    cell.copy_from_slice(&v.to_le_bytes());
                }
                (Some(Value::BigInt(v)), FieldKind::BigInt) => {
                    cell.copy_from_slice(&v.to_le_bytes());
                }
                (Some(Value::Text(v)), FieldKind::Text { length }) => {
                    let bytes = v.as_bytes();
                    if bytes.len() > *length {
                        return Err(ShadowError::Engine(format!(
                            "text value too long for field {}",
                            field.name
                        )));
                    }
                    cell[..bytes.len()].copy_from_slice(bytes);
                }
                (Some(Value::Bytes(v)), FieldKind::Bytes { length }) => {
                    if v.len() != *length {
                        return Err(ShadowError::Engine(format!(
                            "byte value width mismatch for field {}",
                            field.name
                        )));
                    }
                    cell.copy_from_slice(v);
                }
                (Some(Value::Blob(id)), FieldKind::Blob { .. }) => {
                    cell.copy_from_slice(&id.to_le_bytes());
                }
                (Some(v), kind) => {
                    return Err(ShadowError::Engine(format!(
                        "value {v:?} does not fit field {} of kind {kind:?}",
                        field.name
                    )));
                }
            }
        }

        Ok(image)
    }
}
