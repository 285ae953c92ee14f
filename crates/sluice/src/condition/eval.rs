//! In-process evaluation of conditions, used by the in-memory backend.
//!
//! Follows SQL three-valued logic: a comparison against a missing (null)
//! column is unknown, `not unknown` is unknown, and only rows whose condition
//! is definitely true match.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use super::{CompareOp, Condition, MetaValue, Node};
use crate::error::QueueError;

impl Condition {
    /// Whether a row with the given meta columns satisfies the condition.
    ///
    /// `meta` is keyed by column name (`meta_<field>`). Native SQL conditions
    /// cannot be evaluated outside the database and yield an error.
    pub fn matches(&self, meta: &BTreeMap<String, MetaValue>) -> Result<bool, QueueError> {
        Ok(self.0.eval(meta)? == Some(true))
    }
}

impl Node {
    fn eval(&self, meta: &BTreeMap<String, MetaValue>) -> Result<Option<bool>, QueueError> {
        Ok(match self {
            Node::Compare { column, op, value } => meta.get(column).and_then(|actual| {
                if *op == CompareOp::Like {
                    return match (actual, value) {
                        (MetaValue::Text(text), MetaValue::Text(pattern)) => {
                            Some(like_matches(text, pattern))
                        }
                        _ => None,
                    };
                }
                let ordering = actual.compare(value)?;
                Some(match op {
                    CompareOp::Eq => ordering == Ordering::Equal,
                    CompareOp::Neq => ordering != Ordering::Equal,
                    CompareOp::Greater => ordering == Ordering::Greater,
                    CompareOp::GreaterEq => ordering != Ordering::Less,
                    CompareOp::Less => ordering == Ordering::Less,
                    CompareOp::LessEq => ordering != Ordering::Greater,
                    CompareOp::Like => false,
                })
            }),
            Node::Between { column, low, high } => meta.get(column).and_then(|actual| {
                let above = actual.compare(low)? != Ordering::Less;
                let below = actual.compare(high)? != Ordering::Greater;
                Some(above && below)
            }),
            Node::In { column, values } => meta.get(column).map(|actual| values.contains(actual)),
            Node::IsNull { column } => Some(!meta.contains_key(column)),
            Node::IsNotNull { column } => Some(meta.contains_key(column)),
            Node::And(children) => {
                let mut result = Some(true);
                for child in children {
                    match child.eval(meta)? {
                        Some(false) => return Ok(Some(false)),
                        None => result = None,
                        Some(true) => {}
                    }
                }
                result
            }
            Node::Or(children) => {
                let mut result = Some(false);
                for child in children {
                    match child.eval(meta)? {
                        Some(true) => return Ok(Some(true)),
                        None => result = None,
                        Some(false) => {}
                    }
                }
                result
            }
            Node::Not(child) => child.eval(meta)?.map(|value| !value),
            Node::Native { pattern, .. } => {
                return Err(QueueError::invalid_config(format!(
                    "native SQL condition cannot be evaluated in memory: {pattern}"
                )))
            }
        })
    }
}

/// SQL `LIKE`: `%` matches any run, `_` one character, `\` escapes.
fn like_matches(text: &str, pattern: &str) -> bool {
    let text: Vec<char> = text.chars().collect();
    let pattern: Vec<char> = pattern.chars().collect();

    // Iterative wildcard matching with backtracking to the last `%`.
    let (mut t, mut p) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while t < text.len() {
        if p < pattern.len() {
            match pattern[p] {
                '%' => {
                    star = Some((p, t));
                    p += 1;
                    continue;
                }
                '_' => {
                    t += 1;
                    p += 1;
                    continue;
                }
                '\\' if p + 1 < pattern.len() && pattern[p + 1] == text[t] => {
                    t += 1;
                    p += 2;
                    continue;
                }
                c if c != '\\' && c == text[t] => {
                    t += 1;
                    p += 1;
                    continue;
                }
                _ => {}
            }
        }
        match star {
            Some((star_p, star_t)) => {
                p = star_p + 1;
                t = star_t + 1;
                star = Some((star_p, star_t + 1));
            }
            None => return false,
        }
    }
    pattern[p..].iter().all(|c| *c == '%')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::Field;

    fn row(entries: &[(&str, MetaValue)]) -> BTreeMap<String, MetaValue> {
        entries
            .iter()
            .map(|(k, v)| (format!("meta_{k}"), v.clone()))
            .collect()
    }

    #[test]
    fn comparisons() {
        let x = Field::<i32>::new("x").unwrap();
        let r = row(&[("x", MetaValue::Int(10))]);
        assert!(x.eq(10).matches(&r).unwrap());
        assert!(!x.neq(10).matches(&r).unwrap());
        assert!(x.greater(9).matches(&r).unwrap());
        assert!(x.greater_eq(10).matches(&r).unwrap());
        assert!(!x.less(10).matches(&r).unwrap());
        assert!(x.less_eq(10).matches(&r).unwrap());
        assert!(x.between(10, 20).matches(&r).unwrap());
        assert!(x.between(1, 10).matches(&r).unwrap());
        assert!(!x.between(11, 20).matches(&r).unwrap());
        assert!(x.is_in(vec![1, 10]).matches(&r).unwrap());
    }

    #[test]
    fn null_columns_follow_three_valued_logic() {
        let x = Field::<i32>::new("x").unwrap();
        let y = Field::<i32>::new("y").unwrap();
        let r = row(&[("y", MetaValue::Int(1))]);
        assert!(!x.eq(1).matches(&r).unwrap());
        assert!(!(!x.eq(1)).matches(&r).unwrap());
        assert!(x.is_null().matches(&r).unwrap());
        assert!(!x.is_not_null().matches(&r).unwrap());
        // unknown or true is true, unknown and true is unknown
        assert!(x.eq(1).or(y.eq(1)).matches(&r).unwrap());
        assert!(!x.eq(1).and(y.eq(1)).matches(&r).unwrap());
        assert!(!(!x.eq(1).and(y.eq(1))).matches(&r).unwrap());
    }

    #[test]
    fn like_patterns() {
        assert!(like_matches("hello", "hello"));
        assert!(like_matches("hello", "h%"));
        assert!(like_matches("hello", "%llo"));
        assert!(like_matches("hello", "h_l%o"));
        assert!(like_matches("", "%"));
        assert!(!like_matches("hello", "h_"));
        assert!(!like_matches("hello", "world%"));
        assert!(like_matches("50%", "50\\%"));
        assert!(!like_matches("500", "50\\%"));
        assert!(like_matches("abcabd", "%abd"));
    }

    #[test]
    fn native_is_rejected() {
        let cond = Condition::native("{0} > 1", &["x"]).unwrap();
        assert!(cond.matches(&BTreeMap::new()).is_err());
    }
}
