//! Test case definitions and validation.
//!
//! Test cases are YAML or JSON documents validated against an embedded JSON
//! Schema before being deserialized.

mod parser;
mod schema;

pub use parser::{TestCase, TestCaseError};
pub use schema::{validate_output, validate_test_case_schema, SchemaError};
