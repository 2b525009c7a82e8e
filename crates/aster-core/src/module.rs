//! Module and declaration model of the Core IR.

use crate::error::{CoreError, CoreResult};
use crate::expr::{Param, Stmt, Type};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A top-level declaration, tagged by `"kind"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Decl {
    /// Imports another module by path.
    Import { module: String },

    /// Function declaration.
    Func {
        name: String,
        params: Vec<Param>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ret: Option<Type>,
        body: Vec<Stmt>,
    },

    /// Enum (sum type) declaration.
    Enum {
        name: String,
        variants: Vec<EnumVariant>,
    },

    /// Data (record type) declaration.
    Data { name: String, fields: Vec<DataField> },
}

impl Decl {
    /// Returns the declared name, if the declaration introduces one.
    pub fn name(&self) -> Option<&str> {
        match self {
            Decl::Import { .. } => None,
            Decl::Func { name, .. } | Decl::Enum { name, .. } | Decl::Data { name, .. } => {
                Some(name)
            }
        }
    }
}

/// One variant of an enum declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnumVariant {
    /// Variant name.
    pub name: String,

    /// Payload types carried by the variant.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<Type>,
}

/// One field of a data declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataField {
    /// Field name.
    pub name: String,

    /// Field type.
    pub ty: Type,
}

/// A Core IR module: a name plus its declarations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Module {
    /// Module name.
    pub name: String,

    /// Declarations in source order.
    pub decls: Vec<Decl>,
}

impl Module {
    /// Creates an empty module.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            decls: Vec::new(),
        }
    }

    /// Parses a module from its JSON wire form and validates it.
    pub fn from_json(json: &str) -> CoreResult<Self> {
        let module: Module = serde_json::from_str(json)?;
        module.validate()?;
        Ok(module)
    }

    /// Serialises the module to its JSON wire form.
    pub fn to_json(&self) -> CoreResult<String> {
        serde_json::to_string(self).map_err(|e| CoreError::Serialization(e.to_string()))
    }

    /// Validates the module: declared names must be unique.
    pub fn validate(&self) -> CoreResult<()> {
        let mut seen: HashSet<&str> = HashSet::new();
        for decl in &self.decls {
            if let Some(name) = decl.name() {
                if !seen.insert(name) {
                    return Err(CoreError::DuplicateDecl(name.to_string()));
                }
            }
        }
        Ok(())
    }

    /// Adds a declaration.
    pub fn add_decl(&mut self, decl: Decl) {
        self.decls.push(decl);
    }

    /// Looks up a function declaration by name.
    pub fn func(&self, name: &str) -> Option<&Decl> {
        self.decls.iter().find(|d| {
            matches!(d, Decl::Func { name: n, .. } if n == name)
        })
    }

    /// Returns the modules imported by this module.
    pub fn imports(&self) -> Vec<&str> {
        self.decls
            .iter()
            .filter_map(|d| match d {
                Decl::Import { module } => Some(module.as_str()),
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Expr;

    fn sample_module() -> Module {
        Module {
            name: "orders".to_string(),
            decls: vec![
                Decl::Import {
                    module: "core/text".to_string(),
                },
                Decl::Func {
                    name: "total".to_string(),
                    params: vec![Param::new("n")],
                    ret: Some(Type::Int),
                    body: vec![Stmt::Return {
                        value: Some(Expr::Name {
                            name: "n".to_string(),
                        }),
                    }],
                },
                Decl::Enum {
                    name: "Status".to_string(),
                    variants: vec![
                        EnumVariant {
                            name: "Open".to_string(),
                            fields: vec![],
                        },
                        EnumVariant {
                            name: "Closed".to_string(),
                            fields: vec![Type::Str],
                        },
                    ],
                },
            ],
        }
    }

    #[test]
    fn test_module_round_trip() {
        let module = sample_module();
        let json = module.to_json().unwrap();
        let back = Module::from_json(&json).unwrap();
        assert_eq!(module, back);
    }

    #[test]
    fn test_decl_kind_tags() {
        let json = serde_json::to_value(sample_module()).unwrap();
        assert_eq!(json["decls"][0]["kind"], "Import");
        assert_eq!(json["decls"][1]["kind"], "Func");
        assert_eq!(json["decls"][2]["kind"], "Enum");
    }

    #[test]
    fn test_duplicate_decl_rejected() {
        let mut module = sample_module();
        module.add_decl(Decl::Data {
            name: "total".to_string(),
            fields: vec![],
        });
        assert!(matches!(
            module.validate(),
            Err(CoreError::DuplicateDecl(name)) if name == "total"
        ));
    }

    #[test]
    fn test_func_lookup_and_imports() {
        let module = sample_module();
        assert!(module.func("total").is_some());
        assert!(module.func("missing").is_none());
        assert_eq!(module.imports(), vec!["core/text"]);
    }
}
