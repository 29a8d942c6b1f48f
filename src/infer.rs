//! Column type inference for tables created from a row set.
//!
//! Inference runs only when a target table has to be created (or a new
//! column added). Existing column types are never changed.

use crate::rows::{RowSet, Scalar, parse_timestamp};

/// The destination type chosen for a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    BigInt,
    Double,
    Boolean,
    Timestamp,
    Text,
}

impl ColumnKind {
    pub fn sql_type(&self) -> &'static str {
        match self {
            ColumnKind::BigInt => "BIGINT",
            ColumnKind::Double => "DOUBLE PRECISION",
            ColumnKind::Boolean => "BOOLEAN",
            ColumnKind::Timestamp => "TIMESTAMPTZ",
            ColumnKind::Text => "TEXT",
        }
    }
}

/// A named column with its inferred type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub kind: ColumnKind,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, kind: ColumnKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// Infer one column type from its non-null values.
///
/// - no non-null values: `TEXT`
/// - all integral numbers: `BIGINT`; all numbers otherwise: `DOUBLE PRECISION`
/// - all booleans: `BOOLEAN`
/// - all timestamps (or text that parses as one): `TIMESTAMPTZ`
/// - anything mixed: `TEXT`
pub fn infer_kind<'a>(values: impl IntoIterator<Item = &'a Scalar>) -> ColumnKind {
    let mut seen = false;
    let mut numeric = true;
    let mut integral = true;
    let mut boolean = true;
    let mut temporal = true;

    for value in values {
        if value.is_null() {
            continue;
        }
        seen = true;
        match value {
            Scalar::Int(_) | Scalar::Float(_) => {
                integral &= value.is_integral();
                boolean = false;
                temporal = false;
            }
            Scalar::Bool(_) => {
                numeric = false;
                temporal = false;
            }
            Scalar::Timestamp(_) => {
                numeric = false;
                boolean = false;
            }
            Scalar::Text(s) => {
                numeric = false;
                boolean = false;
                temporal &= parse_timestamp(s).is_some();
            }
            Scalar::Null => {}
        }
        if !numeric && !boolean && !temporal {
            return ColumnKind::Text;
        }
    }

    if !seen {
        ColumnKind::Text
    } else if numeric {
        if integral {
            ColumnKind::BigInt
        } else {
            ColumnKind::Double
        }
    } else if boolean {
        ColumnKind::Boolean
    } else if temporal {
        ColumnKind::Timestamp
    } else {
        ColumnKind::Text
    }
}

/// Infer a definition for every column of `rows`, in column order.
pub fn infer_columns(rows: &RowSet) -> Vec<ColumnDef> {
    rows.columns()
        .iter()
        .enumerate()
        .map(|(idx, name)| ColumnDef::new(name.clone(), infer_kind(rows.column_values(idx))))
        .collect()
}
