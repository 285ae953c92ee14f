use std::cmp::Ordering;
use std::collections::BTreeMap;

use super::{Field, MetaValue};

/// Direction and null placement of an `order by` term.
///
/// Plain `Asc` sorts nulls last and plain `Desc` sorts nulls first, as
/// PostgreSQL does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SortOrder {
    Asc,
    AscNullsFirst,
    AscNullsLast,
    Desc,
    DescNullsFirst,
    DescNullsLast,
}

impl SortOrder {
    pub fn sql(&self) -> &'static str {
        match self {
            SortOrder::Asc => "asc",
            SortOrder::AscNullsFirst => "asc nulls first",
            SortOrder::AscNullsLast => "asc nulls last",
            SortOrder::Desc => "desc",
            SortOrder::DescNullsFirst => "desc nulls first",
            SortOrder::DescNullsLast => "desc nulls last",
        }
    }

    pub(crate) fn descending(&self) -> bool {
        matches!(
            self,
            SortOrder::Desc | SortOrder::DescNullsFirst | SortOrder::DescNullsLast
        )
    }

    fn nulls_first(&self) -> bool {
        matches!(
            self,
            SortOrder::AscNullsFirst | SortOrder::Desc | SortOrder::DescNullsFirst
        )
    }
}

/// One `order by` term over a meta column.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Order {
    column: String,
    sort: SortOrder,
}

impl Order {
    pub fn new<T>(field: &Field<T>, sort: SortOrder) -> Self {
        Self {
            column: field.column().to_owned(),
            sort,
        }
    }

    pub fn column(&self) -> &str {
        &self.column
    }

    pub fn sort(&self) -> SortOrder {
        self.sort
    }

    /// `meta_<field> <direction>`
    pub fn sql(&self) -> String {
        format!("{} {}", self.column, self.sort.sql())
    }

    /// Compare two rows by this term.
    pub fn compare(
        &self,
        left: &BTreeMap<String, MetaValue>,
        right: &BTreeMap<String, MetaValue>,
    ) -> Ordering {
        match (left.get(&self.column), right.get(&self.column)) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) if self.sort.nulls_first() => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) if self.sort.nulls_first() => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(a), Some(b)) => {
                let ordering = a.compare(b).unwrap_or(Ordering::Equal);
                if self.sort.descending() {
                    ordering.reverse()
                } else {
                    ordering
                }
            }
        }
    }
}

impl<T> Field<T> {
    pub fn asc(&self) -> Order {
        Order::new(self, SortOrder::Asc)
    }

    pub fn asc_nulls_first(&self) -> Order {
        Order::new(self, SortOrder::AscNullsFirst)
    }

    pub fn asc_nulls_last(&self) -> Order {
        Order::new(self, SortOrder::AscNullsLast)
    }

    pub fn desc(&self) -> Order {
        Order::new(self, SortOrder::Desc)
    }

    pub fn desc_nulls_first(&self) -> Order {
        Order::new(self, SortOrder::DescNullsFirst)
    }

    pub fn desc_nulls_last(&self) -> Order {
        Order::new(self, SortOrder::DescNullsLast)
    }
}
