use std::cmp::Ordering;
use std::fmt;
use std::marker::PhantomData;

use serde::{Deserialize, Serialize};

use crate::error::QueueError;
use crate::types::meta_column_name;

/// PostgreSQL column type backing a meta field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetaType {
    SmallInt,
    Int,
    BigInt,
    Boolean,
    Real,
    Double,
    Text,
}

impl MetaType {
    pub fn sql_type(&self) -> &'static str {
        match self {
            MetaType::SmallInt => "smallint",
            MetaType::Int => "int",
            MetaType::BigInt => "bigint",
            MetaType::Boolean => "boolean",
            MetaType::Real => "real",
            MetaType::Double => "double precision",
            MetaType::Text => "varchar",
        }
    }
}

/// A single typed meta value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MetaValue {
    SmallInt(i16),
    Int(i32),
    BigInt(i64),
    Boolean(bool),
    Real(f32),
    Double(f64),
    Text(String),
}

impl MetaValue {
    pub fn meta_type(&self) -> MetaType {
        match self {
            MetaValue::SmallInt(_) => MetaType::SmallInt,
            MetaValue::Int(_) => MetaType::Int,
            MetaValue::BigInt(_) => MetaType::BigInt,
            MetaValue::Boolean(_) => MetaType::Boolean,
            MetaValue::Real(_) => MetaType::Real,
            MetaValue::Double(_) => MetaType::Double,
            MetaValue::Text(_) => MetaType::Text,
        }
    }

    /// Compare two values of the same type. Values of different types are
    /// unordered.
    pub fn compare(&self, other: &MetaValue) -> Option<Ordering> {
        match (self, other) {
            (MetaValue::SmallInt(a), MetaValue::SmallInt(b)) => Some(a.cmp(b)),
            (MetaValue::Int(a), MetaValue::Int(b)) => Some(a.cmp(b)),
            (MetaValue::BigInt(a), MetaValue::BigInt(b)) => Some(a.cmp(b)),
            (MetaValue::Boolean(a), MetaValue::Boolean(b)) => Some(a.cmp(b)),
            (MetaValue::Real(a), MetaValue::Real(b)) => a.partial_cmp(b),
            (MetaValue::Double(a), MetaValue::Double(b)) => a.partial_cmp(b),
            (MetaValue::Text(a), MetaValue::Text(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl fmt::Display for MetaValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetaValue::SmallInt(v) => write!(f, "{v}"),
            MetaValue::Int(v) => write!(f, "{v}"),
            MetaValue::BigInt(v) => write!(f, "{v}"),
            MetaValue::Boolean(v) => write!(f, "{v}"),
            MetaValue::Real(v) => write!(f, "{v}"),
            MetaValue::Double(v) => write!(f, "{v}"),
            MetaValue::Text(v) => write!(f, "'{v}'"),
        }
    }
}

/// A list of meta values of one type, bound as a single array parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum MetaArray {
    SmallInt(Vec<i16>),
    Int(Vec<i32>),
    BigInt(Vec<i64>),
    Boolean(Vec<bool>),
    Real(Vec<f32>),
    Double(Vec<f64>),
    Text(Vec<String>),
}

impl MetaArray {
    pub fn len(&self) -> usize {
        match self {
            MetaArray::SmallInt(v) => v.len(),
            MetaArray::Int(v) => v.len(),
            MetaArray::BigInt(v) => v.len(),
            MetaArray::Boolean(v) => v.len(),
            MetaArray::Real(v) => v.len(),
            MetaArray::Double(v) => v.len(),
            MetaArray::Text(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `value` equals any element.
    pub fn contains(&self, value: &MetaValue) -> bool {
        match (self, value) {
            (MetaArray::SmallInt(v), MetaValue::SmallInt(x)) => v.contains(x),
            (MetaArray::Int(v), MetaValue::Int(x)) => v.contains(x),
            (MetaArray::BigInt(v), MetaValue::BigInt(x)) => v.contains(x),
            (MetaArray::Boolean(v), MetaValue::Boolean(x)) => v.contains(x),
            (MetaArray::Real(v), MetaValue::Real(x)) => v.contains(x),
            (MetaArray::Double(v), MetaValue::Double(x)) => v.contains(x),
            (MetaArray::Text(v), MetaValue::Text(x)) => v.contains(x),
            _ => false,
        }
    }
}

/// Rust types that can be stored in a meta column.
pub trait MetaScalar: Sized + Clone {
    const META_TYPE: MetaType;

    fn into_value(self) -> MetaValue;

    fn into_array(values: Vec<Self>) -> MetaArray;

    /// The wrapped value, if `value` holds this type.
    fn from_value(value: &MetaValue) -> Option<Self>;
}

macro_rules! meta_scalar {
    ($ty:ty, $variant:ident) => {
        impl MetaScalar for $ty {
            const META_TYPE: MetaType = MetaType::$variant;

            fn into_value(self) -> MetaValue {
                MetaValue::$variant(self)
            }

            fn into_array(values: Vec<Self>) -> MetaArray {
                MetaArray::$variant(values)
            }

            fn from_value(value: &MetaValue) -> Option<Self> {
                match value {
                    MetaValue::$variant(v) => Some(v.clone()),
                    _ => None,
                }
            }
        }

        impl From<$ty> for MetaValue {
            fn from(value: $ty) -> Self {
                MetaValue::$variant(value)
            }
        }
    };
}

meta_scalar!(i16, SmallInt);
meta_scalar!(i32, Int);
meta_scalar!(i64, BigInt);
meta_scalar!(bool, Boolean);
meta_scalar!(f32, Real);
meta_scalar!(f64, Double);
meta_scalar!(String, Text);

impl From<&str> for MetaValue {
    fn from(value: &str) -> Self {
        MetaValue::Text(value.to_owned())
    }
}

/// Typed handle to a meta column of a queue.
///
/// The name is validated once at construction; every condition, order and
/// meta value built from the field reuses the checked column name.
pub struct Field<T> {
    name: String,
    column: String,
    _type: PhantomData<fn() -> T>,
}

impl<T: MetaScalar> Field<T> {
    pub fn new(name: impl Into<String>) -> Result<Self, QueueError> {
        let name = name.into();
        let column = meta_column_name(&name)?;
        Ok(Self {
            name,
            column,
            _type: PhantomData,
        })
    }

    pub fn meta_type(&self) -> MetaType {
        T::META_TYPE
    }
}

impl<T> Field<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Database column name, `meta_<name>`.
    pub fn column(&self) -> &str {
        &self.column
    }
}

impl<T> Clone for Field<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            column: self.column.clone(),
            _type: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Field<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Field")
            .field("name", &self.name)
            .field("column", &self.column)
            .finish()
    }
}
