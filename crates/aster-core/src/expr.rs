//! Expressions, statements, patterns and types of the Core IR.
//!
//! Every node is an internally-tagged union with a literal `"kind"`
//! discriminator. The tag names are normative wire format and must not be
//! renamed.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A function or lambda parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    /// Parameter name.
    pub name: String,

    /// Optional declared type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ty: Option<Type>,
}

impl Param {
    /// Creates an untyped parameter.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ty: None,
        }
    }
}

/// A Core IR type reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Type {
    /// Machine integer.
    Int,

    /// UTF-8 string.
    Str,

    /// Boolean.
    Bool,

    /// Unit / void.
    Unit,

    /// Named (user-declared) type.
    Name { name: String },

    /// Homogeneous list.
    List { item: Box<Type> },

    /// Function type.
    Fn { params: Vec<Type>, ret: Box<Type> },
}

/// A Core IR expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Expr {
    /// Integer literal.
    Int { value: i64 },

    /// String literal.
    Str { value: String },

    /// Boolean literal.
    Bool { value: bool },

    /// Variable reference.
    Name { name: String },

    /// Function call.
    Call { func: Box<Expr>, args: Vec<Expr> },

    /// Anonymous function.
    Lambda { params: Vec<Param>, body: Vec<Stmt> },

    /// Conditional. Branches are statement blocks.
    If {
        cond: Box<Expr>,
        then: Vec<Stmt>,
        #[serde(default, skip_serializing_if = "Option::is_none", rename = "else")]
        otherwise: Option<Vec<Stmt>>,
    },

    /// Pattern match.
    Match {
        scrutinee: Box<Expr>,
        arms: Vec<MatchArm>,
    },

    /// Statement block evaluating to its last expression statement.
    Block { stmts: Vec<Stmt> },

    /// Workflow subprogram: named steps with dependency and compensation
    /// wiring, executed as one unit by the runtime.
    #[serde(rename = "workflow")]
    Workflow { steps: Vec<WorkflowStepIr> },
}

/// A Core IR statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Stmt {
    /// Binds a fresh name.
    Let { name: String, value: Expr },

    /// Mutates an existing binding.
    Set { name: String, value: Expr },

    /// Unwinds the enclosing function with an optional value.
    Return {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<Expr>,
    },

    /// Starts an async task and binds its handle to `name`.
    Start { name: String, expr: Expr },

    /// Awaits the async task bound to `name`.
    Wait { name: String },

    /// Bare expression statement.
    Expr { expr: Expr },
}

/// One arm of a `Match` expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchArm {
    /// Pattern to test.
    pub pattern: Pattern,

    /// Body executed when the pattern matches.
    pub body: Vec<Stmt>,
}

/// A Core IR pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Pattern {
    /// Matches anything, binds nothing.
    Wildcard,

    /// Matches anything, binds it to `name`.
    Bind { name: String },

    /// Integer literal pattern.
    Int { value: i64 },

    /// String literal pattern.
    Str { value: String },

    /// Enum constructor pattern with sub-patterns.
    Ctor {
        name: String,
        #[serde(default)]
        args: Vec<Pattern>,
    },
}

/// One step of a `workflow` expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStepIr {
    /// User-declared step name, unique within the workflow.
    pub name: String,

    /// Names of sibling steps that must complete first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deps: Vec<String>,

    /// Step body, evaluated by the evaluator collaborator.
    pub body: Expr,

    /// Optional rollback body, run LIFO if a later step fails.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensate: Option<Expr>,
}

impl WorkflowStepIr {
    /// Creates a step with no dependencies and no compensation.
    pub fn new(name: impl Into<String>, body: Expr) -> Self {
        Self {
            name: name.into(),
            deps: Vec::new(),
            body,
            compensate: None,
        }
    }

    /// Adds a dependency on a sibling step.
    pub fn depends_on(mut self, dep: impl Into<String>) -> Self {
        self.deps.push(dep.into());
        self
    }

    /// Sets the compensation body.
    pub fn with_compensation(mut self, body: Expr) -> Self {
        self.compensate = Some(body);
        self
    }
}

/// Validates the step list of a `workflow` expression: unique names, known
/// dependencies.
pub fn validate_workflow_steps(steps: &[WorkflowStepIr]) -> CoreResult<()> {
    let mut seen: HashSet<&str> = HashSet::new();
    for step in steps {
        if !seen.insert(step.name.as_str()) {
            return Err(CoreError::DuplicateStep(step.name.clone()));
        }
    }
    for step in steps {
        for dep in &step.deps {
            if !seen.contains(dep.as_str()) {
                return Err(CoreError::UnknownStep {
                    step: step.name.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }
    Ok(())
}
