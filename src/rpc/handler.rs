//! The object whose methods an RPC session invokes.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::rpc::message::RpcError;

/// Dispatch target for JSON-RPC calls.
///
/// One handler instance is shared by every session, so implementations must
/// be safe to call concurrently.
#[async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    /// Invoke `method`. Return [`RpcError::method_not_found`] for names the
    /// handler does not know.
    async fn handle(&self, method: &str, params: Option<Value>) -> Result<Value, RpcError>;
}

/// Decode call parameters, mapping failures to `-32602 Invalid params`.
pub fn parse_params<T: DeserializeOwned>(params: Option<Value>) -> Result<T, RpcError> {
    serde_json::from_value(params.unwrap_or(Value::Null))
        .map_err(|e| RpcError::invalid_params(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    use crate::rpc::message::INVALID_PARAMS;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Pair {
        a: i64,
        b: i64,
    }

    #[test]
    fn params_decode_by_name() {
        let pair: Pair = parse_params(Some(json!({"a": 1, "b": 2}))).unwrap();
        assert_eq!(pair, Pair { a: 1, b: 2 });
    }

    #[test]
    fn missing_params_are_invalid() {
        let err = parse_params::<Pair>(None).unwrap_err();
        assert_eq!(err.code, INVALID_PARAMS);
    }
}
