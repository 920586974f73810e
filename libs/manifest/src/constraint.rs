//! Fact constraints.
//!
//! A constraint is a set of `left → right` pairs. Both sides are
//! interpolated against the node facts, then the right side is split on its
//! first space into an operator and an operand:
//!
//! | Right side     | Holds when                                        |
//! |----------------|---------------------------------------------------|
//! | `value`        | `left == value`                                   |
//! | `= value`      | `left == value` (allows values with spaces)       |
//! | `!= value`     | `left != value`                                   |
//! | `~ a,b,c`      | every comma-separated item of `left` is listed    |
//! | `!~ a,b,c`     | no comma-separated item of `left` is listed       |
//! | `< n`          | `left < n` numerically                            |
//! | `> n`          | `left > n` numerically                            |
//!
//! An unknown operator word falls back to equality against the whole right
//! side.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ConstraintError;
use crate::interpolate::{interpolate, variables};

/// Flat string-to-string map used for facts and render environments.
pub type FlatMap = BTreeMap<String, String>;

const OP_EQUAL: &str = "=";
const OP_NOT_EQUAL: &str = "!=";
const OP_IN: &str = "~";
const OP_NOT_IN: &str = "!~";
const OP_LESS: &str = "<";
const OP_GREATER: &str = ">";

/// A set of fact checks. The empty constraint always holds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Constraint(BTreeMap<String, String>);

impl Constraint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pair, replacing any pair with the same left side.
    pub fn with(mut self, left: impl Into<String>, right: impl Into<String>) -> Self {
        self.0.insert(left.into(), right.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    /// Check every pair against `facts`, reporting the first failing one.
    pub fn check(&self, facts: &FlatMap) -> Result<(), ConstraintError> {
        for (left, right) in &self.0 {
            if !check_pair(&interpolate(left, facts), &interpolate(right, facts)) {
                return Err(ConstraintError::Failed {
                    left: left.clone(),
                    right: right.clone(),
                });
            }
        }
        Ok(())
    }

    /// Merge `others` into a copy of this constraint. Later pairs win.
    pub fn merge<'a, I>(&self, others: I) -> Constraint
    where
        I: IntoIterator<Item = &'a Constraint>,
    {
        let mut res = self.clone();
        for other in others {
            for (left, right) in &other.0 {
                res.0.insert(left.clone(), right.clone());
            }
        }
        res
    }

    /// Drop pairs referencing any variable under one of `prefixes`.
    pub fn filter_out(&self, prefixes: &[&str]) -> Constraint {
        let references = |expr: &str| {
            variables(expr)
                .iter()
                .any(|var| prefixes.iter().any(|prefix| var.starts_with(prefix)))
        };
        Constraint(
            self.0
                .iter()
                .filter(|(left, right)| !references(left) && !references(right))
                .map(|(left, right)| (left.clone(), right.clone()))
                .collect(),
        )
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Constraint {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Constraint(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

fn check_pair(left: &str, right: &str) -> bool {
    let Some((op, operand)) = right.split_once(' ') else {
        return left == right;
    };
    match op {
        OP_EQUAL => left == operand,
        OP_NOT_EQUAL => left != operand,
        OP_IN => {
            let listed = split_list(operand);
            split_list(left).iter().all(|item| listed.contains(item))
        }
        OP_NOT_IN => {
            let listed = split_list(operand);
            !split_list(left).iter().any(|item| listed.contains(item))
        }
        OP_LESS | OP_GREATER => match (left.trim().parse::<f64>(), operand.trim().parse::<f64>()) {
            (Ok(l), Ok(r)) if op == OP_LESS => l < r,
            (Ok(l), Ok(r)) => l > r,
            _ => false,
        },
        _ => left == right,
    }
}

fn split_list(s: &str) -> Vec<&str> {
    s.split(',').map(str::trim).filter(|item| !item.is_empty()).collect()
}
