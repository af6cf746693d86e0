//! Cross-template shared state.
//!
//! Templates communicate through three concurrent tables, all keyed by
//! `<module>/<name>`: exported functions, module-scoped globals and
//! append-only module hooks. Functions and globals converge across
//! pre-render passes; hooks are rebuilt by each pass. The state is
//! frozen for the final pass; fixed-point detection hashes the whole
//! state with [`SharedState::stabilise`].

use crate::error::{Result, StencilError};
use crate::schema;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Which render pass is executing. Some operations behave differently
/// while the state is still converging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderStage {
    /// Pre-render passes: outputs are discarded, re-exports are no-ops
    Pre,
    /// Final pass: outputs are kept, duplicate exports are fatal
    Final,
}

/// A function exported by a library template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportedFunction {
    /// Import path of the library template that exported it
    pub source_template: String,
}

/// A module-scoped global value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Global {
    /// Import path of the template that last wrote it
    pub defining_template: String,
    /// The stored value
    pub value: serde_json::Value,
}

/// Join a module name and a local name into a shared-state key.
#[must_use]
pub fn qualified(module: &str, name: &str) -> String {
    format!("{module}/{name}")
}

/// The process-private shared store.
#[derive(Debug, Default)]
pub struct SharedState {
    functions: DashMap<String, ExportedFunction>,
    globals: DashMap<String, Global>,
    module_hooks: DashMap<String, Vec<serde_json::Value>>,
    hook_schemas: DashMap<String, serde_json::Value>,
}

impl SharedState {
    /// Create an empty state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hook schema declared by `module` for hook `name`.
    /// Appends to that hook are validated against it.
    pub fn register_hook_schema(&self, module: &str, name: &str, schema_value: serde_json::Value) {
        self.hook_schemas.insert(qualified(module, name), schema_value);
    }

    /// Export a function under `<module>/<name>`.
    ///
    /// During pre-render passes a duplicate export is a no-op, because
    /// the same directive legitimately re-executes every pass. In the
    /// final pass a duplicate is fatal.
    ///
    /// # Errors
    ///
    /// `AlreadyExported` for a final-pass duplicate.
    pub fn export_function(
        &self,
        module: &str,
        name: &str,
        source_template: &str,
        stage: RenderStage,
    ) -> Result<()> {
        let key = qualified(module, name);
        if let Some(existing) = self.functions.get(&key) {
            match stage {
                RenderStage::Pre => return Ok(()),
                RenderStage::Final => {
                    if existing.source_template != source_template {
                        return Err(StencilError::AlreadyExported {
                            name: key,
                            existing: existing.source_template.clone(),
                        });
                    }
                    return Ok(());
                }
            }
        }
        self.functions.insert(key, ExportedFunction { source_template: source_template.to_string() });
        Ok(())
    }

    /// Look up an exported function by its qualified name.
    #[must_use]
    pub fn function(&self, qualified_name: &str) -> Option<ExportedFunction> {
        self.functions.get(qualified_name).map(|f| f.clone())
    }

    /// Overwrite a module-scoped global.
    pub fn set_global(
        &self,
        module: &str,
        name: &str,
        value: serde_json::Value,
        defining_template: &str,
    ) {
        self.globals.insert(
            qualified(module, name),
            Global { defining_template: defining_template.to_string(), value },
        );
    }

    /// Read a module-scoped global, last-writer-wins.
    ///
    /// A miss is a logged warning in the final pass and a debug log in
    /// earlier ones, because the writer may simply not have run yet.
    #[must_use]
    pub fn global(&self, module: &str, name: &str, stage: RenderStage) -> Option<serde_json::Value> {
        let key = qualified(module, name);
        match self.globals.get(&key) {
            Some(global) => Some(global.value.clone()),
            None => {
                match stage {
                    RenderStage::Final => {
                        tracing::warn!(key = %key, "Global was never set");
                    }
                    RenderStage::Pre => {
                        tracing::debug!(key = %key, "Global not yet set");
                    }
                }
                None
            }
        }
    }

    /// Append values to a module hook, atomically and in order.
    ///
    /// Hooks are rebuilt by every pre-render pass (see
    /// [`reset_module_hooks`](Self::reset_module_hooks)); in the final
    /// pass the state is frozen, so the append is validated but
    /// dropped and readers observe the settled multiset.
    ///
    /// # Errors
    ///
    /// `SchemaValidation` when the target module declared a schema for
    /// the hook and any value violates it.
    pub fn add_to_module_hook(
        &self,
        target_module: &str,
        name: &str,
        values: Vec<serde_json::Value>,
        stage: RenderStage,
    ) -> Result<()> {
        if values.is_empty() {
            return Ok(());
        }
        let key = qualified(target_module, name);
        if let Some(hook_schema) = self.hook_schemas.get(&key) {
            for value in &values {
                schema::validate(&hook_schema, value, &format!("{target_module}.moduleHooks.{name}"))?;
            }
        }
        if stage == RenderStage::Final {
            return Ok(());
        }
        self.module_hooks.entry(key).or_default().extend(values);
        Ok(())
    }

    /// Clear every module hook. Called at the start of each pre-render
    /// pass so that re-executed appends rebuild the same multiset
    /// instead of growing it, which is what lets the fixed-point hash
    /// converge.
    pub fn reset_module_hooks(&self) {
        self.module_hooks.clear();
    }

    /// The current ordered contents of a module hook (empty when the
    /// hook was never written).
    #[must_use]
    pub fn module_hook(&self, module: &str, name: &str) -> Vec<serde_json::Value> {
        self.module_hooks
            .get(&qualified(module, name))
            .map(|values| values.clone())
            .unwrap_or_default()
    }

    /// Sort every hook's contents by element content hash and return a
    /// deterministic structural hash of the whole state.
    ///
    /// Ordering hook elements by their own hashes makes the
    /// fingerprint insensitive to append order across passes: once the
    /// multiset of elements stabilises, so does the hash.
    #[must_use]
    pub fn stabilise(&self) -> String {
        for mut entry in self.module_hooks.iter_mut() {
            entry.value_mut().sort_by_key(|value| content_hash(value));
        }

        let functions: BTreeMap<String, String> = self
            .functions
            .iter()
            .map(|e| (e.key().clone(), e.value().source_template.clone()))
            .collect();
        let globals: BTreeMap<String, serde_json::Value> = self
            .globals
            .iter()
            .map(|e| {
                (
                    e.key().clone(),
                    serde_json::json!({
                        "template": e.value().defining_template,
                        "value": e.value().value,
                    }),
                )
            })
            .collect();
        let hooks: BTreeMap<String, Vec<serde_json::Value>> = self
            .module_hooks
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        let canonical = serde_json::json!({
            "functions": functions,
            "globals": globals,
            "hooks": hooks,
        });

        let digest = Sha256::digest(canonical.to_string().as_bytes());
        format!("{digest:x}")
    }
}

/// Content hash of one hook element over its canonical JSON form.
fn content_hash(value: &serde_json::Value) -> String {
    let digest = Sha256::digest(value.to_string().as_bytes());
    format!("{digest:x}")
}
