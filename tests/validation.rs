//! Local Module Validation Tests
//!
//! Declared parameter contracts are checked before a handler is built.

use std::time::Duration;

use mediaflow::adapters::{
    DispatchError, Handler, HandlerCatalog, HandlerFactory, LocalExecutor, ModuleExecutor,
    ModuleRequest, IGNORED_PARAMS_KEY,
};
use mediaflow::core::{ModuleDescriptor, ParamSchema, ValidationError};
use mediaflow::domain::{ErrorKind, ErrorStage};
use serde_json::{json, Map, Value};

/// Returns the parameters it was built with
struct Echo {
    params: Map<String, Value>,
}

impl Handler for Echo {
    fn process(&mut self) -> anyhow::Result<Value> {
        Ok(Value::Object(self.params.clone()))
    }
}

fn schema() -> ParamSchema {
    ParamSchema::new().required("a", &[]).required("b", &[])
}

fn executor() -> LocalExecutor {
    let mut catalog = HandlerCatalog::new();
    catalog.register(
        "echo",
        HandlerFactory::new(schema(), |params| {
            let handler: Box<dyn Handler> = Box::new(Echo {
                params: params.clone(),
            });
            Ok(handler)
        }),
    );
    LocalExecutor::new(catalog)
}

fn request(params: Value) -> ModuleRequest {
    ModuleRequest::new(params.as_object().cloned().unwrap())
}

async fn run(params: Value) -> Result<Value, DispatchError> {
    let mut module = ModuleDescriptor::local("echo");
    module.name = "echo-module".to_string();
    executor()
        .execute(&module, &request(params), Duration::from_secs(5))
        .await
}

#[tokio::test]
async fn test_missing_parameter_is_named() {
    let err = run(json!({"a": 1})).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(err.stage(), ErrorStage::Validate);
    match err {
        DispatchError::Validation(ValidationError::MissingParameters {
            module,
            missing,
            required,
        }) => {
            assert_eq!(module, "echo-module");
            assert_eq!(missing, vec!["b".to_string()]);
            assert_eq!(required, vec!["a".to_string(), "b".to_string()]);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_extra_parameter_is_reported_not_fatal() {
    let params = json!({"a": 1, "b": 2, "c": 3});

    let report = schema()
        .validate("echo-module", params.as_object().unwrap())
        .unwrap();
    assert_eq!(report.extra_params, vec!["c".to_string()]);

    // Undeclared parameters never reach the handler but show up in its result
    let result = run(params).await.unwrap();
    assert_eq!(result, json!({"a": 1, "b": 2, IGNORED_PARAMS_KEY: ["c"]}));
}

#[tokio::test]
async fn test_module_config_is_merged_under_params() {
    let module = ModuleDescriptor::local("echo")
        .with_config("a", json!("from config"))
        .with_config("b", json!("from config"));
    let result = executor()
        .execute(&module, &request(json!({"b": "bound"})), Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(result, json!({"a": "from config", "b": "bound"}));
}

#[tokio::test]
async fn test_unknown_handler_is_configuration_error() {
    let module = ModuleDescriptor::local("nope");
    let err = executor()
        .execute(&module, &request(json!({})), Duration::from_secs(5))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert_eq!(err.stage(), ErrorStage::Resolve);
}
