//! Query AST consumed by the planner.

pub mod ast;
pub mod visit;

pub use ast::{
    ANY_FIELD, CompareOp, DATATYPE_FIELD, Marker, NO_FIELD, Node, SHARD_DAY_HINT, is_unfielded,
};
pub use visit::{CostKey, all_indexed_equalities, depth, flatten, indexed_terms, order_by_cost};
