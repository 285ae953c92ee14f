//! Binding compiled parameters onto sqlx queries.

use sqlx::postgres::{PgArguments, Postgres};
use sqlx::query::Query;

use super::{MetaArray, MetaValue, SqlParam};

pub(crate) type PgQuery<'q> = Query<'q, Postgres, PgArguments>;

/// Bind every parameter, in order.
pub(crate) fn bind_params<'q>(mut query: PgQuery<'q>, params: &[SqlParam]) -> PgQuery<'q> {
    for param in params {
        query = match param {
            SqlParam::Value(value) => bind_value(query, value),
            SqlParam::Array(values) => bind_array(query, values),
        };
    }
    query
}

pub(crate) fn bind_value<'q>(query: PgQuery<'q>, value: &MetaValue) -> PgQuery<'q> {
    match value {
        MetaValue::SmallInt(v) => query.bind(*v),
        MetaValue::Int(v) => query.bind(*v),
        MetaValue::BigInt(v) => query.bind(*v),
        MetaValue::Boolean(v) => query.bind(*v),
        MetaValue::Real(v) => query.bind(*v),
        MetaValue::Double(v) => query.bind(*v),
        MetaValue::Text(v) => query.bind(v.clone()),
    }
}

fn bind_array<'q>(query: PgQuery<'q>, values: &MetaArray) -> PgQuery<'q> {
    match values {
        MetaArray::SmallInt(v) => query.bind(v.clone()),
        MetaArray::Int(v) => query.bind(v.clone()),
        MetaArray::BigInt(v) => query.bind(v.clone()),
        MetaArray::Boolean(v) => query.bind(v.clone()),
        MetaArray::Real(v) => query.bind(v.clone()),
        MetaArray::Double(v) => query.bind(v.clone()),
        MetaArray::Text(v) => query.bind(v.clone()),
    }
}
