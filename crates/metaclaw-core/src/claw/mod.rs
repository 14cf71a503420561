//! Clawfile pipeline: schema types, strict YAML parsing, and the
//! normalize/validate pass that turns a raw document into IR.

pub mod parse;
pub mod schema;
pub mod validate;

pub use parse::{parse_file, ParseError};
pub use schema::Clawfile;
pub use validate::{normalize_and_validate, ValidateError};
