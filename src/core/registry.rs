//! Module registry and handler parameter validation.
//!
//! Modules are registered once from configuration and are read-only for
//! the rest of the run. Local handlers declare a [`ParamSchema`]; the
//! prepared init parameters are checked against it before construction so
//! a bad config fails with a readable message instead of deep inside a
//! handler.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

/// How a module is executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleKind {
    /// In-process handler compiled into the binary
    Local,

    /// External program, possibly inside another environment
    External,
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleKind::Local => f.write_str("local"),
            ModuleKind::External => f.write_str("external"),
        }
    }
}

/// A registered unit of processing logic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    /// Registry name (filled from the config map key)
    #[serde(default)]
    pub name: String,

    #[serde(alias = "type")]
    pub kind: ModuleKind,

    /// Handler identifier (local) or script path (external)
    #[serde(alias = "path")]
    pub target: String,

    /// Execution environment directory (external only)
    #[serde(default, alias = "venv_path")]
    pub environment: Option<PathBuf>,

    /// Program used to run the target, e.g. `python`
    #[serde(default)]
    pub interpreter: Option<String>,

    /// Static configuration passed to the module
    #[serde(default)]
    pub config: Map<String, Value>,
}

impl ModuleDescriptor {
    pub fn local(target: impl Into<String>) -> Self {
        Self {
            name: String::new(),
            kind: ModuleKind::Local,
            target: target.into(),
            environment: None,
            interpreter: None,
            config: Map::new(),
        }
    }

    pub fn external(script: impl Into<String>) -> Self {
        Self {
            kind: ModuleKind::External,
            ..Self::local(script)
        }
    }

    pub fn with_environment(mut self, environment: impl Into<PathBuf>) -> Self {
        self.environment = Some(environment.into());
        self
    }

    pub fn with_interpreter(mut self, interpreter: impl Into<String>) -> Self {
        self.interpreter = Some(interpreter.into());
        self
    }

    pub fn with_config(mut self, key: impl Into<String>, value: Value) -> Self {
        self.config.insert(key.into(), value);
        self
    }
}

/// Registry lookup failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("Module '{0}' is not registered")]
    NotRegistered(String),

    #[error("Module '{module}' targets unknown local handler '{target}'")]
    UnknownHandler { module: String, target: String },
}

/// Modules available to a run, keyed by name
#[derive(Debug, Clone, Default)]
pub struct ModuleRegistry {
    modules: HashMap<String, ModuleDescriptor>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module, returning the descriptor it replaced (if any)
    pub fn register(
        &mut self,
        name: impl Into<String>,
        mut descriptor: ModuleDescriptor,
    ) -> Option<ModuleDescriptor> {
        let name = name.into();
        descriptor.name = name.clone();

        let previous = self.modules.insert(name.clone(), descriptor);
        if previous.is_some() {
            warn!(module = %name, "Module already registered, overwriting");
        }
        previous
    }

    pub fn resolve(&self, name: &str) -> Result<&ModuleDescriptor, RegistryError> {
        self.modules
            .get(name)
            .ok_or_else(|| RegistryError::NotRegistered(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Registered modules sorted by name
    pub fn modules(&self) -> Vec<&ModuleDescriptor> {
        let mut modules: Vec<_> = self.modules.values().collect();
        modules.sort_by(|a, b| a.name.cmp(&b.name));
        modules
    }
}

/// JSON type tags a parameter may accept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    Bool,
    Integer,
    /// Any number, integers included
    Float,
    String,
    Array,
    Object,
    Null,
}

impl ParamType {
    /// Type tag of a concrete value (integers report as `Integer`)
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => ParamType::Null,
            Value::Bool(_) => ParamType::Bool,
            Value::Number(n) if n.is_i64() || n.is_u64() => ParamType::Integer,
            Value::Number(_) => ParamType::Float,
            Value::String(_) => ParamType::String,
            Value::Array(_) => ParamType::Array,
            Value::Object(_) => ParamType::Object,
        }
    }

    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            ParamType::Float => value.is_number(),
            other => *other == Self::of(value),
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ParamType::Bool => "bool",
            ParamType::Integer => "integer",
            ParamType::Float => "float",
            ParamType::String => "string",
            ParamType::Array => "array",
            ParamType::Object => "object",
            ParamType::Null => "null",
        };
        f.write_str(name)
    }
}

fn join_types(types: &[ParamType]) -> String {
    types
        .iter()
        .map(ParamType::to_string)
        .collect::<Vec<_>>()
        .join(" | ")
}

/// One declared handler parameter
#[derive(Debug, Clone, PartialEq)]
pub struct ParamSpec {
    pub name: String,

    /// Accepted types; empty means untyped
    pub types: Vec<ParamType>,

    /// Default value; `None` makes the parameter required
    pub default: Option<Value>,
}

impl ParamSpec {
    pub fn is_required(&self) -> bool {
        self.default.is_none()
    }
}

/// Declared parameter contract of a local handler
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamSchema {
    params: Vec<ParamSpec>,
}

/// Successful validation result
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    /// Supplied parameters the handler does not declare
    pub extra_params: Vec<String>,
}

/// Parameter contract violations
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("Module '{module}' is missing required parameter(s) {missing:?} (required: {required:?})")]
    MissingParameters {
        module: String,
        missing: Vec<String>,
        required: Vec<String>,
    },

    #[error("Module '{module}' parameter '{param}' has the wrong type: expected {}, got {actual} (value: {value})", join_types(.expected))]
    TypeMismatch {
        module: String,
        param: String,
        expected: Vec<ParamType>,
        actual: ParamType,
        value: Value,
    },
}

impl ParamSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a parameter without a default
    pub fn required(mut self, name: impl Into<String>, types: &[ParamType]) -> Self {
        self.params.push(ParamSpec {
            name: name.into(),
            types: types.to_vec(),
            default: None,
        });
        self
    }

    /// Declare a parameter with a default value
    pub fn optional(mut self, name: impl Into<String>, types: &[ParamType], default: Value) -> Self {
        self.params.push(ParamSpec {
            name: name.into(),
            types: types.to_vec(),
            default: Some(default),
        });
        self
    }

    pub fn params(&self) -> &[ParamSpec] {
        &self.params
    }

    pub fn get(&self, name: &str) -> Option<&ParamSpec> {
        self.params.iter().find(|p| p.name == name)
    }

    /// Names of parameters without defaults, in declaration order
    pub fn required_names(&self) -> Vec<String> {
        self.params
            .iter()
            .filter(|p| p.is_required())
            .map(|p| p.name.clone())
            .collect()
    }

    /// Check prepared init parameters against the contract.
    ///
    /// Missing required parameters and type mismatches are errors;
    /// undeclared parameters are reported and logged as a warning.
    pub fn validate(
        &self,
        module: &str,
        params: &Map<String, Value>,
    ) -> Result<ValidationReport, ValidationError> {
        let required = self.required_names();
        let missing: Vec<String> = required
            .iter()
            .filter(|name| !params.contains_key(name.as_str()))
            .cloned()
            .collect();

        if !missing.is_empty() {
            return Err(ValidationError::MissingParameters {
                module: module.to_string(),
                missing,
                required,
            });
        }

        let mut extra_params: Vec<String> = params
            .keys()
            .filter(|key| self.get(key).is_none())
            .cloned()
            .collect();
        extra_params.sort();

        if !extra_params.is_empty() {
            let supported: Vec<&str> = self.params.iter().map(|p| p.name.as_str()).collect();
            warn!(
                module,
                extra = ?extra_params,
                supported = ?supported,
                "Module received undeclared parameters"
            );
        }

        for spec in &self.params {
            let Some(value) = params.get(&spec.name) else {
                continue;
            };
            if spec.types.is_empty() || spec.types.iter().any(|t| t.accepts(value)) {
                continue;
            }
            return Err(ValidationError::TypeMismatch {
                module: module.to_string(),
                param: spec.name.clone(),
                expected: spec.types.clone(),
                actual: ParamType::of(value),
                value: value.clone(),
            });
        }

        Ok(ValidationReport { extra_params })
    }

    /// Keep declared parameters and fill in defaults for absent ones
    pub fn prepare(&self, params: &Map<String, Value>) -> Map<String, Value> {
        let mut prepared = Map::new();
        for spec in &self.params {
            if let Some(value) = params.get(&spec.name).or(spec.default.as_ref()) {
                prepared.insert(spec.name.clone(), value.clone());
            }
        }
        prepared
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_register_and_resolve() {
        let mut registry = ModuleRegistry::new();
        assert!(registry.register("blur", ModuleDescriptor::external("blur.py")).is_none());

        let module = registry.resolve("blur").unwrap();
        assert_eq!(module.name, "blur");
        assert_eq!(module.kind, ModuleKind::External);

        assert_eq!(
            registry.resolve("missing"),
            Err(RegistryError::NotRegistered("missing".to_string()))
        );
    }

    #[test]
    fn test_reregistration_returns_previous() {
        let mut registry = ModuleRegistry::new();
        registry.register("m", ModuleDescriptor::local("passthrough"));
        let previous = registry.register("m", ModuleDescriptor::external("m.py"));

        assert_eq!(previous.unwrap().kind, ModuleKind::Local);
        assert_eq!(registry.resolve("m").unwrap().kind, ModuleKind::External);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_descriptor_accepts_legacy_keys() {
        let descriptor: ModuleDescriptor = serde_json::from_value(json!({
            "type": "external",
            "path": "filters/duration.py",
            "venv_path": "/envs/video",
            "config": {"min_seconds": 3}
        }))
        .unwrap();

        assert_eq!(descriptor.kind, ModuleKind::External);
        assert_eq!(descriptor.target, "filters/duration.py");
        assert_eq!(descriptor.environment, Some(PathBuf::from("/envs/video")));
        assert_eq!(descriptor.config["min_seconds"], 3);
    }

    #[test]
    fn test_param_type_accepts() {
        assert!(ParamType::Float.accepts(&json!(3)));
        assert!(ParamType::Float.accepts(&json!(0.5)));
        assert!(!ParamType::Integer.accepts(&json!(0.5)));
        assert!(ParamType::Null.accepts(&Value::Null));
        assert_eq!(ParamType::of(&json!("x")), ParamType::String);
    }

    #[test]
    fn test_union_types() {
        let schema = ParamSchema::new().optional(
            "max_bytes",
            &[ParamType::Integer, ParamType::Null],
            Value::Null,
        );

        assert!(schema.validate("m", &params(json!({"max_bytes": 10}))).is_ok());
        assert!(schema.validate("m", &params(json!({"max_bytes": null}))).is_ok());

        let err = schema
            .validate("m", &params(json!({"max_bytes": "big"})))
            .unwrap_err();
        match err {
            ValidationError::TypeMismatch { expected, actual, value, .. } => {
                assert_eq!(expected, vec![ParamType::Integer, ParamType::Null]);
                assert_eq!(actual, ParamType::String);
                assert_eq!(value, json!("big"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_type_mismatch_message() {
        let schema = ParamSchema::new().required("threshold", &[ParamType::Float]);
        let err = schema
            .validate("blur", &params(json!({"threshold": "high"})))
            .unwrap_err();

        let message = err.to_string();
        assert!(message.contains("threshold"));
        assert!(message.contains("expected float"));
        assert!(message.contains("got string"));
    }

    #[test]
    fn test_prepare_fills_defaults_and_drops_extras() {
        let schema = ParamSchema::new()
            .required("input_path", &[ParamType::String])
            .optional("recursive", &[ParamType::Bool], json!(true));

        let prepared = schema.prepare(&params(json!({"input_path": "/x", "noise": 1})));

        assert_eq!(prepared.len(), 2);
        assert_eq!(prepared["recursive"], json!(true));
        assert!(!prepared.contains_key("noise"));
    }
}
