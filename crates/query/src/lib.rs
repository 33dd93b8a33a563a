//! Query parameters for the document service: a typed filter/sort/populate AST,
//! a parser from the loosely-shaped JSON parameters, and an in-memory evaluator.

pub mod ast;
pub mod compare;
pub mod eval;
pub mod parser;

pub use ast::{Comparison, FilterNode, Populate, PopulateEntry, SortField, SortOrder};
pub use eval::{eval_filter, value_at_path, EvalError, JsonScope, NestedRows, Scope};
pub use parser::{parse_fields, parse_filters, parse_populate, parse_sort, ParseError};
