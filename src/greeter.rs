//! Example handler served by the binary.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::rpc::{parse_params, RpcError, RpcHandler};

/// Answers `SayHello` and `Echo`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Greeter;

#[derive(Deserialize)]
#[serde(untagged)]
enum HelloParams {
    Named { name: String },
    Positional((String,)),
}

impl Greeter {
    pub fn say_hello(name: &str) -> String {
        format!("Hello, {name}!")
    }
}

#[async_trait]
impl RpcHandler for Greeter {
    async fn handle(&self, method: &str, params: Option<Value>) -> Result<Value, RpcError> {
        match method {
            "SayHello" => {
                let name = match parse_params::<HelloParams>(params)? {
                    HelloParams::Named { name } => name,
                    HelloParams::Positional((name,)) => name,
                };
                Ok(json!(Self::say_hello(&name)))
            }
            "Echo" => Ok(params.unwrap_or(Value::Null)),
            other => Err(RpcError::method_not_found(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::message::{INVALID_PARAMS, METHOD_NOT_FOUND};

    #[tokio::test]
    async fn says_hello_by_name_or_position() {
        let named = Greeter
            .handle("SayHello", Some(json!({"name": "Ada"})))
            .await
            .unwrap();
        assert_eq!(named, json!("Hello, Ada!"));

        let positional = Greeter
            .handle("SayHello", Some(json!(["Linus"])))
            .await
            .unwrap();
        assert_eq!(positional, json!("Hello, Linus!"));
    }

    #[tokio::test]
    async fn rejects_bad_params_and_unknown_methods() {
        let err = Greeter.handle("SayHello", None).await.unwrap_err();
        assert_eq!(err.code, INVALID_PARAMS);

        let err = Greeter.handle("Shout", None).await.unwrap_err();
        assert_eq!(err.code, METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn echo_returns_params() {
        let value = Greeter.handle("Echo", Some(json!([1, "a"]))).await.unwrap();
        assert_eq!(value, json!([1, "a"]));
    }
}
