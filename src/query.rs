//! Structured catalog queries and their type-1 (RPN) form.
//!
//! A [`StructuredQuery`] is a tree of [`QueryClause`]s: leaves pair a Bib-1
//! [`UseAttribute`] with a search term, inner nodes combine two clauses with a
//! [`BooleanOp`]. [`StructuredQuery::to_rpn`] validates the tree and lowers it
//! into an [`RpnQuery`], which the APDU codec encodes on the wire with each
//! operator following both of its operands.
//!
//! # Examples
//!
//! ```
//! use fedcat::query::{StructuredQuery, UseAttribute};
//!
//! let query = StructuredQuery::by(UseAttribute::Title, "earthsea")
//!     .and(StructuredQuery::by(UseAttribute::Author, "le guin"));
//! let rpn = query.to_rpn()?;
//! assert_eq!(
//!     rpn.to_string(),
//!     r#"@attrset bib-1 @and @attr 1=4 "earthsea" @attr 1=1003 "le guin""#
//! );
//! # Ok::<(), fedcat::query::QueryError>(())
//! ```

use crate::z3950::ber::Oid;
use crate::z3950::BIB1_ATTRIBUTE_SET;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Bib-1 attribute type for "use" (which index to search).
pub const USE_ATTRIBUTE_TYPE: i64 = 1;

/// Errors from query validation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    /// A leaf term is empty or whitespace only.
    #[error("query term is empty")]
    EmptyTerm,

    /// A use attribute code outside the positive integers.
    #[error("invalid use attribute code {0}")]
    InvalidAttribute(u32),
}

/// Bib-1 use attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UseAttribute {
    /// Any (1016)
    Any,
    /// Title (4)
    Title,
    /// Author / name (1003)
    Author,
    /// ISBN (7)
    Isbn,
    /// ISSN (8)
    Issn,
    /// Subject heading (21)
    Subject,
    /// Publisher (1018)
    Publisher,
    /// Date of publication (31)
    DatePublication,
    /// Local control number (12)
    LocalNumber,
    /// Any other Bib-1 use code
    Other(u32),
}

impl UseAttribute {
    /// The Bib-1 numeric code.
    #[must_use]
    pub fn code(self) -> u32 {
        match self {
            UseAttribute::Any => 1016,
            UseAttribute::Title => 4,
            UseAttribute::Author => 1003,
            UseAttribute::Isbn => 7,
            UseAttribute::Issn => 8,
            UseAttribute::Subject => 21,
            UseAttribute::Publisher => 1018,
            UseAttribute::DatePublication => 31,
            UseAttribute::LocalNumber => 12,
            UseAttribute::Other(code) => code,
        }
    }

    /// Map a numeric code back to its named attribute where one exists.
    #[must_use]
    pub fn from_code(code: u32) -> Self {
        match code {
            1016 => UseAttribute::Any,
            4 => UseAttribute::Title,
            1003 => UseAttribute::Author,
            7 => UseAttribute::Isbn,
            8 => UseAttribute::Issn,
            21 => UseAttribute::Subject,
            1018 => UseAttribute::Publisher,
            31 => UseAttribute::DatePublication,
            12 => UseAttribute::LocalNumber,
            other => UseAttribute::Other(other),
        }
    }
}

/// Boolean operators of the type-1 query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BooleanOp {
    /// Both operands match
    And,
    /// Either operand matches
    Or,
    /// Left matches and right does not
    AndNot,
}

impl BooleanOp {
    /// PQF keyword.
    #[must_use]
    pub fn keyword(self) -> &'static str {
        match self {
            BooleanOp::And => "@and",
            BooleanOp::Or => "@or",
            BooleanOp::AndNot => "@not",
        }
    }
}

/// One node of a structured query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryClause {
    /// Search `term` in the index named by `attribute`.
    Term {
        /// Index to search
        attribute: UseAttribute,
        /// Search term
        term: String,
    },
    /// Combine two clauses.
    Boolean {
        /// Operator
        op: BooleanOp,
        /// Left operand
        left: Box<QueryClause>,
        /// Right operand
        right: Box<QueryClause>,
    },
}

/// A validated-on-demand query tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StructuredQuery {
    /// Root clause
    pub root: QueryClause,
}

impl StructuredQuery {
    /// A bare term searched against [`UseAttribute::Any`].
    pub fn any(term: impl Into<String>) -> Self {
        Self::by(UseAttribute::Any, term)
    }

    /// A term searched against a specific index.
    pub fn by(attribute: UseAttribute, term: impl Into<String>) -> Self {
        StructuredQuery {
            root: QueryClause::Term {
                attribute,
                term: term.into(),
            },
        }
    }

    /// `self AND other`.
    #[must_use]
    pub fn and(self, other: StructuredQuery) -> Self {
        self.combine(BooleanOp::And, other)
    }

    /// `self OR other`.
    #[must_use]
    pub fn or(self, other: StructuredQuery) -> Self {
        self.combine(BooleanOp::Or, other)
    }

    /// `self AND-NOT other`.
    #[must_use]
    pub fn and_not(self, other: StructuredQuery) -> Self {
        self.combine(BooleanOp::AndNot, other)
    }

    fn combine(self, op: BooleanOp, other: StructuredQuery) -> Self {
        StructuredQuery {
            root: QueryClause::Boolean {
                op,
                left: Box::new(self.root),
                right: Box::new(other.root),
            },
        }
    }

    /// Check every leaf without building anything.
    ///
    /// # Errors
    ///
    /// [`QueryError::EmptyTerm`] for a blank term,
    /// [`QueryError::InvalidAttribute`] for use code 0.
    pub fn validate(&self) -> Result<(), QueryError> {
        fn walk(clause: &QueryClause) -> Result<(), QueryError> {
            match clause {
                QueryClause::Term { attribute, term } => {
                    if term.trim().is_empty() {
                        return Err(QueryError::EmptyTerm);
                    }
                    if attribute.code() == 0 {
                        return Err(QueryError::InvalidAttribute(0));
                    }
                    Ok(())
                },
                QueryClause::Boolean { left, right, .. } => {
                    walk(left)?;
                    walk(right)
                },
            }
        }
        walk(&self.root)
    }

    /// Lower into a Bib-1 type-1 query.
    ///
    /// # Errors
    ///
    /// As [`validate`](Self::validate).
    pub fn to_rpn(&self) -> Result<RpnQuery, QueryError> {
        self.validate()?;
        Ok(RpnQuery {
            attribute_set: Oid::new(BIB1_ATTRIBUTE_SET),
            root: lower(&self.root),
        })
    }
}

fn lower(clause: &QueryClause) -> RpnNode {
    match clause {
        QueryClause::Term { attribute, term } => RpnNode::Operand {
            attributes: vec![AttributeElement {
                attribute_type: USE_ATTRIBUTE_TYPE,
                value: i64::from(attribute.code()),
            }],
            term: term.trim().to_string(),
        },
        QueryClause::Boolean { op, left, right } => RpnNode::Operation {
            left: Box::new(lower(left)),
            right: Box::new(lower(right)),
            operator: *op,
        },
    }
}

/// One `(type, value)` attribute pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttributeElement {
    /// Attribute type (1 = use)
    pub attribute_type: i64,
    /// Attribute value
    pub value: i64,
}

/// A node of the RPN structure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpnNode {
    /// Attributes plus term
    Operand {
        /// Attribute list
        attributes: Vec<AttributeElement>,
        /// General term
        term: String,
    },
    /// Two sub-queries and the operator joining them
    Operation {
        /// First operand
        left: Box<RpnNode>,
        /// Second operand
        right: Box<RpnNode>,
        /// Operator, applied after both operands
        operator: BooleanOp,
    },
}

/// Flattened postfix view of an [`RpnNode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpnToken<'a> {
    /// A leaf
    Operand {
        /// Attribute list
        attributes: &'a [AttributeElement],
        /// Term
        term: &'a str,
    },
    /// An operator popping the two preceding results
    Operator(BooleanOp),
}

/// A type-1 query: attribute set plus RPN structure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpnQuery {
    /// Attribute set OID (Bib-1)
    pub attribute_set: Oid,
    /// Query structure
    pub root: RpnNode,
}

impl RpnQuery {
    /// Postfix token sequence: every operator follows both operands.
    #[must_use]
    pub fn postfix(&self) -> Vec<RpnToken<'_>> {
        fn walk<'a>(node: &'a RpnNode, out: &mut Vec<RpnToken<'a>>) {
            match node {
                RpnNode::Operand { attributes, term } => out.push(RpnToken::Operand {
                    attributes,
                    term,
                }),
                RpnNode::Operation {
                    left,
                    right,
                    operator,
                } => {
                    walk(left, out);
                    walk(right, out);
                    out.push(RpnToken::Operator(*operator));
                },
            }
        }
        let mut tokens = Vec::new();
        walk(&self.root, &mut tokens);
        tokens
    }

    /// Every term in the query, left to right.
    #[must_use]
    pub fn terms(&self) -> Vec<&str> {
        self.postfix()
            .into_iter()
            .filter_map(|token| match token {
                RpnToken::Operand { term, .. } => Some(term),
                RpnToken::Operator(_) => None,
            })
            .collect()
    }
}

impl fmt::Display for RpnNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpnNode::Operand { attributes, term } => {
                for attr in attributes {
                    write!(f, "@attr {}={} ", attr.attribute_type, attr.value)?;
                }
                write!(f, "\"{}\"", term.replace('"', "\\\""))
            },
            RpnNode::Operation {
                left,
                right,
                operator,
            } => write!(f, "{} {left} {right}", operator.keyword()),
        }
    }
}

impl fmt::Display for RpnQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.attribute_set == *BIB1_ATTRIBUTE_SET {
            write!(f, "@attrset bib-1 {}", self.root)
        } else {
            write!(f, "@attrset {} {}", self.attribute_set, self.root)
        }
    }
}
