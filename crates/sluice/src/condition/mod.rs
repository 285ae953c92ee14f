//! Typed filter conditions over meta columns, compiled to parameterized SQL.
//!
//! A [`Condition`] is an immutable tree built from [`Field`] handles:
//!
//! ```ignore
//! let user = Field::<i64>::new("user_id")?;
//! let priority = Field::<i32>::new("priority")?;
//! let cond = user.eq(42).and(priority.between(1, 5));
//! let compiled = cond.compile(&mut ColumnIndex::new());
//! assert_eq!(compiled.sql, "(meta_user_id = $1) and (meta_priority between $2 and $3)");
//! ```
//!
//! Compilation walks the tree twice in the same order: once to emit SQL text
//! with `$n` placeholders, once to collect the values for those placeholders.
//! Both walks draw from one [`ColumnIndex`] cursor, so the n-th placeholder is
//! always bound by the n-th collected parameter.

mod eval;
mod field;
mod order;
#[cfg(feature = "sql")]
pub(crate) mod bind;

pub use field::{Field, MetaArray, MetaScalar, MetaType, MetaValue};
pub use order::{Order, SortOrder};

use crate::error::QueueError;
use crate::types::meta_column_name;

/// Cursor handing out placeholder numbers, starting at `$1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnIndex {
    next: usize,
}

impl ColumnIndex {
    pub fn new() -> Self {
        Self { next: 1 }
    }

    /// Continue numbering after placeholders already used by the enclosing
    /// statement.
    pub fn starting_at(first: usize) -> Self {
        Self { next: first.max(1) }
    }

    pub fn next_index(&mut self) -> usize {
        let index = self.next;
        self.next += 1;
        index
    }

    /// Number the next call to [`next_index`](Self::next_index) returns.
    pub fn peek(&self) -> usize {
        self.next
    }
}

impl Default for ColumnIndex {
    fn default() -> Self {
        Self::new()
    }
}

/// A value bound to one placeholder.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Value(MetaValue),
    /// A whole list bound to a single array placeholder.
    Array(MetaArray),
}

/// SQL text plus the parameters for its placeholders, in placeholder order.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledCondition {
    pub sql: String,
    pub params: Vec<SqlParam>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CompareOp {
    Eq,
    Neq,
    Greater,
    GreaterEq,
    Less,
    LessEq,
    Like,
}

impl CompareOp {
    fn sql(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Neq => "<>",
            CompareOp::Greater => ">",
            CompareOp::GreaterEq => ">=",
            CompareOp::Less => "<",
            CompareOp::LessEq => "<=",
            CompareOp::Like => "like",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Node {
    Compare {
        column: String,
        op: CompareOp,
        value: MetaValue,
    },
    Between {
        column: String,
        low: MetaValue,
        high: MetaValue,
    },
    In {
        column: String,
        values: MetaArray,
    },
    IsNull {
        column: String,
    },
    IsNotNull {
        column: String,
    },
    And(Vec<Node>),
    Or(Vec<Node>),
    Not(Box<Node>),
    Native {
        pattern: String,
        columns: Vec<String>,
    },
}

/// Immutable filter expression over a queue's meta columns.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition(pub(crate) Node);

impl Condition {
    /// Conjunction. Nested conjunctions on either side are flattened into one
    /// list, so `(a and b) and (c and d)` is a single four-term chain.
    pub fn and(self, other: Condition) -> Condition {
        Condition(match (self.0, other.0) {
            (Node::And(mut left), Node::And(right)) => {
                left.extend(right);
                Node::And(left)
            }
            (Node::And(mut left), right) => {
                left.push(right);
                Node::And(left)
            }
            (left, Node::And(right)) => {
                let mut all = Vec::with_capacity(right.len() + 1);
                all.push(left);
                all.extend(right);
                Node::And(all)
            }
            (left, right) => Node::And(vec![left, right]),
        })
    }

    /// Disjunction, flattened the same way as [`and`](Self::and).
    pub fn or(self, other: Condition) -> Condition {
        Condition(match (self.0, other.0) {
            (Node::Or(mut left), Node::Or(right)) => {
                left.extend(right);
                Node::Or(left)
            }
            (Node::Or(mut left), right) => {
                left.push(right);
                Node::Or(left)
            }
            (left, Node::Or(right)) => {
                let mut all = Vec::with_capacity(right.len() + 1);
                all.push(left);
                all.extend(right);
                Node::Or(all)
            }
            (left, right) => Node::Or(vec![left, right]),
        })
    }

    /// Raw SQL with meta column names substituted positionally.
    ///
    /// `{0}`, `{1}`, ... in `pattern` are replaced by the column names of
    /// `fields` (meta field names, not column names). Nothing is bound: the
    /// pattern is pasted into the statement verbatim, so it must never carry
    /// untrusted text, and it must not contain `$n` placeholders of its own.
    pub fn native(pattern: impl Into<String>, fields: &[&str]) -> Result<Condition, QueueError> {
        let pattern = pattern.into();
        let columns = fields
            .iter()
            .map(|field| meta_column_name(field))
            .collect::<Result<Vec<_>, _>>()?;
        // Fail now on a placeholder with no field.
        substitute_columns(&pattern, &columns)?;
        Ok(Condition(Node::Native { pattern, columns }))
    }

    /// Compile to SQL text and parameters, numbering placeholders from
    /// `index`. On return `index` points past the last placeholder used.
    pub fn compile(&self, index: &mut ColumnIndex) -> CompiledCondition {
        let mut text_index = index.clone();
        let mut sql = String::new();
        self.0.write_sql(&mut sql, &mut text_index);

        let mut params = Vec::new();
        self.0.collect_params(&mut params, index);

        debug_assert_eq!(
            &text_index, index,
            "placeholder numbering diverged between text and bind passes"
        );
        CompiledCondition { sql, params }
    }
}

impl std::ops::Not for Condition {
    type Output = Condition;

    fn not(self) -> Condition {
        Condition(Node::Not(Box::new(self.0)))
    }
}

impl Node {
    fn write_sql(&self, out: &mut String, index: &mut ColumnIndex) {
        match self {
            Node::Compare { column, op, .. } => {
                out.push_str(&format!("{column} {} ${}", op.sql(), index.next_index()));
            }
            Node::Between { column, .. } => {
                let low = index.next_index();
                let high = index.next_index();
                out.push_str(&format!("{column} between ${low} and ${high}"));
            }
            Node::In { column, .. } => {
                out.push_str(&format!("{column} = ANY (${})", index.next_index()));
            }
            Node::IsNull { column } => {
                out.push_str(&format!("{column} is null"));
            }
            Node::IsNotNull { column } => {
                out.push_str(&format!("{column} is not null"));
            }
            Node::And(children) => write_joined(out, children, " and ", index),
            Node::Or(children) => write_joined(out, children, " or ", index),
            Node::Not(child) => {
                out.push_str("not (");
                child.write_sql(out, index);
                out.push(')');
            }
            Node::Native { pattern, columns } => {
                // Validated at construction.
                if let Ok(sql) = substitute_columns(pattern, columns) {
                    out.push_str(&sql);
                }
            }
        }
    }

    fn collect_params(&self, params: &mut Vec<SqlParam>, index: &mut ColumnIndex) {
        match self {
            Node::Compare { value, .. } => {
                index.next_index();
                params.push(SqlParam::Value(value.clone()));
            }
            Node::Between { low, high, .. } => {
                index.next_index();
                params.push(SqlParam::Value(low.clone()));
                index.next_index();
                params.push(SqlParam::Value(high.clone()));
            }
            Node::In { values, .. } => {
                index.next_index();
                params.push(SqlParam::Array(values.clone()));
            }
            Node::IsNull { .. } | Node::IsNotNull { .. } | Node::Native { .. } => {}
            Node::And(children) | Node::Or(children) => {
                for child in children {
                    child.collect_params(params, index);
                }
            }
            Node::Not(child) => child.collect_params(params, index),
        }
    }
}

fn write_joined(out: &mut String, children: &[Node], separator: &str, index: &mut ColumnIndex) {
    for (i, child) in children.iter().enumerate() {
        if i > 0 {
            out.push_str(separator);
        }
        out.push('(');
        child.write_sql(out, index);
        out.push(')');
    }
}

/// Replace `{n}` in `pattern` with `columns[n]`. Other braces are kept.
fn substitute_columns(pattern: &str, columns: &[String]) -> Result<String, QueueError> {
    let mut out = String::with_capacity(pattern.len());
    let mut rest = pattern;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let digits = after.bytes().take_while(u8::is_ascii_digit).count();
        if digits > 0 && after[digits..].starts_with('}') {
            let position: usize = after[..digits].parse().map_err(|_| {
                QueueError::invalid_config(format!("bad placeholder in native condition: {pattern}"))
            })?;
            let column = columns.get(position).ok_or_else(|| {
                QueueError::invalid_config(format!(
                    "native condition refers to field {{{position}}} but only {} given: {pattern}",
                    columns.len()
                ))
            })?;
            out.push_str(column);
            rest = &after[digits + 1..];
        } else {
            out.push('{');
            rest = after;
        }
    }
    out.push_str(rest);
    Ok(out)
}

impl<T: MetaScalar> Field<T> {
    fn compare(&self, op: CompareOp, value: T) -> Condition {
        Condition(Node::Compare {
            column: self.column().to_owned(),
            op,
            value: value.into_value(),
        })
    }

    /// `column = value`
    pub fn eq(&self, value: T) -> Condition {
        self.compare(CompareOp::Eq, value)
    }

    /// `column <> value`
    pub fn neq(&self, value: T) -> Condition {
        self.compare(CompareOp::Neq, value)
    }

    /// `column > value`
    pub fn greater(&self, value: T) -> Condition {
        self.compare(CompareOp::Greater, value)
    }

    /// `column >= value`
    pub fn greater_eq(&self, value: T) -> Condition {
        self.compare(CompareOp::GreaterEq, value)
    }

    /// `column < value`
    pub fn less(&self, value: T) -> Condition {
        self.compare(CompareOp::Less, value)
    }

    /// `column <= value`
    pub fn less_eq(&self, value: T) -> Condition {
        self.compare(CompareOp::LessEq, value)
    }

    /// `column between low and high`, both ends inclusive.
    pub fn between(&self, low: T, high: T) -> Condition {
        Condition(Node::Between {
            column: self.column().to_owned(),
            low: low.into_value(),
            high: high.into_value(),
        })
    }

    /// `column = ANY ($n)`, with all values bound as one array.
    pub fn is_in(&self, values: impl IntoIterator<Item = T>) -> Condition {
        Condition(Node::In {
            column: self.column().to_owned(),
            values: T::into_array(values.into_iter().collect()),
        })
    }

    pub fn is_null(&self) -> Condition {
        Condition(Node::IsNull {
            column: self.column().to_owned(),
        })
    }

    pub fn is_not_null(&self) -> Condition {
        Condition(Node::IsNotNull {
            column: self.column().to_owned(),
        })
    }
}

impl Field<String> {
    /// `column like pattern`, with `%` and `_` wildcards.
    pub fn like(&self, pattern: impl Into<String>) -> Condition {
        self.compare(CompareOp::Like, pattern.into())
    }
}
