//! # Aster Core IR
//!
//! Data model for the Core Intermediate Representation consumed by the Aster
//! workflow runtime: a JSON-serialised AST for a small functional/imperative
//! language. Modules carry functions, data types, enums and imports; every
//! node in the tree is a tagged union discriminated by a literal `"kind"`
//! field.
//!
//! This crate is a pure model: parsing, validation and the value types that
//! flow between the evaluator and the runtime. Execution lives in
//! `aster-runtime`.
//!
//! ## Example
//!
//! ```rust
//! use aster_core::module::Module;
//!
//! let module = Module::from_json(r#"{
//!     "name": "demo",
//!     "decls": [
//!         { "kind": "Import", "module": "core/text" },
//!         { "kind": "Func", "name": "main", "params": [], "body": [
//!             { "kind": "Return", "value": { "kind": "Int", "value": 42 } }
//!         ] }
//!     ]
//! }"#).unwrap();
//!
//! assert_eq!(module.name, "demo");
//! assert!(module.func("main").is_some());
//! ```

pub mod error;
pub mod expr;
pub mod module;
pub mod value;

pub use error::{CoreError, CoreResult};
pub use expr::{Expr, MatchArm, Param, Pattern, Stmt, Type, WorkflowStepIr};
pub use module::{DataField, Decl, EnumVariant, Module};
pub use value::{ControlFlow, Value};
