//! Argument resolution.
//!
//! `stencil.Arg(path)` resolution: the invoking module must declare
//! the argument; a declaration may defer to another module with
//! `from`; the project manifest supplies the value by dotted path;
//! defaults and schema-derived zero values fill the gaps; the
//! innermost declaration's schema validates the result.

use crate::error::{Result, StencilError};
use crate::manifest::Argument;
use crate::module::Module;
use crate::schema;
use std::collections::HashMap;
use std::sync::Arc;

/// Resolves `stencil.Arg` lookups against the project manifest and the
/// loaded module set.
pub struct ArgResolver {
    project_arguments: HashMap<String, serde_json::Value>,
    modules: HashMap<String, Arc<Module>>,
}

impl ArgResolver {
    /// Create a resolver over the project's arguments and every loaded
    /// module.
    #[must_use]
    pub fn new(
        project_arguments: HashMap<String, serde_json::Value>,
        modules: &[Arc<Module>],
    ) -> Self {
        Self {
            project_arguments,
            modules: modules.iter().map(|m| (m.name.clone(), Arc::clone(m))).collect(),
        }
    }

    /// Resolve argument `path` as seen from `module`.
    ///
    /// # Errors
    ///
    /// `UnknownArgument`, `ArgumentFromUndeclared`,
    /// `MissingRequiredArgument` and `SchemaValidation` per the lookup
    /// rules.
    pub fn resolve(&self, module: &str, path: &str) -> Result<serde_json::Value> {
        if path.is_empty() {
            return Err(StencilError::UnknownArgument {
                module: module.to_string(),
                name: path.to_string(),
            });
        }

        let (owner, declaration) = self.innermost_declaration(module, path)?;

        let supplied = self.project_value(path);
        let value = match supplied {
            Some(value) => value,
            None => {
                if let Some(default) = &declaration.default {
                    default.clone()
                } else if declaration.required {
                    return Err(StencilError::MissingRequiredArgument {
                        module: owner.clone(),
                        name: path.to_string(),
                    });
                } else {
                    zero_value(&declaration.schema, &owner, path)?
                }
            }
        };

        if let Some(declared_schema) = &declaration.schema {
            schema::validate(declared_schema, &value, &format!("{owner}.arguments.{path}"))?;
        }

        Ok(value)
    }

    /// Follow `from` indirections to the innermost non-`from`
    /// declaration, verifying each hop is a declared dependency.
    fn innermost_declaration(&self, module: &str, path: &str) -> Result<(String, Argument)> {
        let mut current = module.to_string();
        let mut visited: Vec<String> = Vec::new();

        loop {
            let owner = self.modules.get(&current).ok_or_else(|| {
                StencilError::UnknownArgument { module: current.clone(), name: path.to_string() }
            })?;
            let declaration = owner.manifest.arguments.get(path).ok_or_else(|| {
                StencilError::UnknownArgument { module: current.clone(), name: path.to_string() }
            })?;

            let Some(from) = &declaration.from else {
                return Ok((current, declaration.clone()));
            };

            if !owner.manifest.modules.iter().any(|dep| &dep.name == from) {
                return Err(StencilError::ArgumentFromUndeclared {
                    module: current.clone(),
                    name: path.to_string(),
                    from: from.clone(),
                });
            }
            if visited.contains(from) {
                return Err(StencilError::internal(format!(
                    "cyclic 'from' chain resolving argument '{path}' (revisited '{from}')"
                )));
            }
            visited.push(current);
            current = from.clone();
        }
    }

    /// Look up a dotted path in the project arguments: an exact key
    /// match wins, otherwise the path traverses nested maps (numeric
    /// segments index arrays).
    fn project_value(&self, path: &str) -> Option<serde_json::Value> {
        if let Some(value) = self.project_arguments.get(path) {
            return Some(value.clone());
        }

        let mut segments = path.split('.');
        let mut current = self.project_arguments.get(segments.next()?)?;
        for segment in segments {
            current = match current {
                serde_json::Value::Object(map) => map.get(segment)?,
                serde_json::Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current.clone())
    }
}

/// Synthesise a zero value from a schema's top-level `type`.
fn zero_value(
    declared_schema: &Option<serde_json::Value>,
    owner: &str,
    path: &str,
) -> Result<serde_json::Value> {
    let Some(declared_schema) = declared_schema else {
        return Ok(serde_json::Value::Null);
    };
    let type_name = declared_schema
        .get("type")
        .and_then(serde_json::Value::as_str)
        .unwrap_or("");

    match type_name {
        "object" | "map" => Ok(serde_json::json!({})),
        "array" | "list" => Ok(serde_json::json!([])),
        "string" => Ok(serde_json::json!("")),
        "boolean" | "bool" => Ok(serde_json::json!(false)),
        "integer" | "int" | "number" => Ok(serde_json::json!(0)),
        other => Err(StencilError::SchemaValidation {
            subject: format!("{owner}.arguments.{path}"),
            message: format!("cannot synthesise a zero value for schema type '{other}'"),
        }),
    }
}
