use crate::catalog;
use crate::error::{DispatchError, DispatchResult};
use crate::protocol::{CommandMessage, Outcome, ResultMessage};
use async_trait::async_trait;
use serde_json::{Map, Value as JsonValue};

/// One request/response exchange with the command executor.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn round_trip(&self, command: CommandMessage) -> DispatchResult<ResultMessage>;

    /// Releases any open connection.
    async fn close(&self) {}
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Box<T> {
    async fn round_trip(&self, command: CommandMessage) -> DispatchResult<ResultMessage> {
        (**self).round_trip(command).await
    }

    async fn close(&self) {
        (**self).close().await
    }
}

/// Validates tool calls against the catalog and forwards them to Blender.
pub struct Dispatcher<T> {
    transport: T,
    allow_code_execution: bool,
}

impl<T: Transport> Dispatcher<T> {
    pub fn new(transport: T, allow_code_execution: bool) -> Self {
        Self {
            transport,
            allow_code_execution,
        }
    }

    pub fn allows_code_execution(&self) -> bool {
        self.allow_code_execution
    }

    pub async fn close(&self) {
        self.transport.close().await
    }

    pub async fn call(&self, tool: &str, args: JsonValue) -> DispatchResult<JsonValue> {
        let descriptor = catalog::lookup(tool)?;
        let args = match args {
            JsonValue::Object(map) => map,
            JsonValue::Null => Map::new(),
            other => {
                return Err(DispatchError::invalid(
                    tool,
                    format!("expected an object of arguments, got {other}"),
                ))
            }
        };
        let params = descriptor.wire_params(&args)?;
        if descriptor.gated && !self.allow_code_execution {
            return Err(DispatchError::CapabilityDisabled(tool.to_string()));
        }

        let command = CommandMessage::new(descriptor.command, params);
        tracing::debug!(tool, id = ?command.id, "Dispatching command to Blender");
        let response = self.transport.round_trip(command).await?;
        match response.outcome {
            Outcome::Success { result } => Ok(result),
            Outcome::Error { message } => {
                tracing::debug!(tool, %message, "Blender reported an error");
                Err(DispatchError::Handler(message))
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// Records every command and answers with a canned outcome.
    #[derive(Clone)]
    pub(crate) struct RecordingTransport {
        pub sent: Arc<Mutex<Vec<CommandMessage>>>,
        pub calls: Arc<AtomicUsize>,
        reply: Outcome,
    }

    impl RecordingTransport {
        pub fn replying(reply: Outcome) -> Self {
            Self {
                sent: Arc::default(),
                calls: Arc::default(),
                reply,
            }
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn round_trip(&self, command: CommandMessage) -> DispatchResult<ResultMessage> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let id = command.id;
            self.sent.lock().unwrap().push(command);
            Ok(ResultMessage {
                outcome: self.reply.clone(),
                id,
            })
        }
    }

    fn ok_transport() -> RecordingTransport {
        RecordingTransport::replying(Outcome::Success {
            result: json!({"ok": true}),
        })
    }

    #[tokio::test]
    async fn unknown_tool_never_reaches_transport() {
        let transport = ok_transport();
        let dispatcher = Dispatcher::new(transport.clone(), true);
        for name in ["", "render", "GET_SCENE_INFO", "execute_code"] {
            let err = dispatcher.call(name, json!({})).await.unwrap_err();
            assert!(matches!(err, DispatchError::UnknownTool(_)), "{name}");
        }
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn invalid_arguments_never_reach_transport() {
        let transport = ok_transport();
        let dispatcher = Dispatcher::new(transport.clone(), true);
        let err = dispatcher
            .call("replace_part", json!({"slot": "head"}))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::InvalidArguments { .. }));
        let err = dispatcher
            .call("get_object_info", json!(["Cube"]))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::InvalidArguments { .. }));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn code_execution_requires_opt_in() {
        let transport = ok_transport();
        let dispatcher = Dispatcher::new(transport.clone(), false);
        let err = dispatcher
            .call("execute_blender_code", json!({"code": "print(1)"}))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::CapabilityDisabled(_)));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);

        let enabled = Dispatcher::new(transport.clone(), true);
        enabled
            .call("execute_blender_code", json!({"code": "print(1)"}))
            .await
            .unwrap();
        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent[0].kind, "execute_code");
        assert_eq!(sent[0].params["code"], json!("print(1)"));
    }

    #[tokio::test]
    async fn each_call_gets_a_fresh_request_id() {
        let transport = ok_transport();
        let dispatcher = Dispatcher::new(transport.clone(), false);
        dispatcher.call("get_scene_info", JsonValue::Null).await.unwrap();
        dispatcher.call("list_parts", json!({})).await.unwrap();
        let sent = transport.sent.lock().unwrap();
        assert!(sent[0].id.is_some());
        assert_ne!(sent[0].id, sent[1].id);
    }

    #[tokio::test]
    async fn handler_error_is_surfaced() {
        let transport = RecordingTransport::replying(Outcome::Error {
            message: "Object not found: Ghost".to_string(),
        });
        let dispatcher = Dispatcher::new(transport, false);
        let err = dispatcher
            .call("get_object_info", json!({"name": "Ghost"}))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Handler(ref m) if m == "Object not found: Ghost"));
    }

    #[tokio::test]
    async fn success_payload_is_returned() {
        let dispatcher = Dispatcher::new(ok_transport(), false);
        let result = dispatcher
            .call("has_node_group", json!({"name": "NodeCity"}))
            .await
            .unwrap();
        assert_eq!(result, json!({"ok": true}));
    }
}
