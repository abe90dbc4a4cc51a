//! Request handlers every `fleetctl serve` process answers

use serde_json::json;
use tracing::debug;

use crate::bus::{MessageBus, bus_handler};
use crate::messages::{Message, MessageKind, MessageType, TaskResponse};

/// Task types answered by [`register_builtin_handlers`]
pub const BUILTIN_TASK_TYPES: &[&str] = &["ping", "echo"];

/// Answer a task request addressed to this service
///
/// `ping` replies with the service name, `echo` returns the payload as the
/// result, and anything else fails with an unsupported task type.
pub fn answer_task(service: &str, message: &Message) -> Option<MessageKind> {
    let MessageKind::TaskRequest(request) = &message.kind else {
        return None;
    };
    debug!(%service, task_type = %request.task_type, "answer_task: called");
    let response = match request.task_type.as_str() {
        "ping" => TaskResponse::completed(&message.id, json!({ "service": service, "pong": true })),
        "echo" => TaskResponse::completed(&message.id, request.payload.clone()),
        other => TaskResponse::failed(
            &message.id,
            format!(
                "Unsupported task type: {} (supported: {})",
                other,
                BUILTIN_TASK_TYPES.join(", ")
            ),
        ),
    };
    Some(MessageKind::TaskResponse(response))
}

pub async fn register_builtin_handlers(bus: &MessageBus) {
    let service = bus.service().to_string();
    bus.register_handler(
        MessageType::TaskRequest,
        bus_handler(move |message: Message| {
            let service = service.clone();
            async move { Ok(answer_task(&service, &message)) }
        }),
    )
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusConfig;
    use crate::messages::{TaskRequest, TaskStatus};
    use sharedstore::{MemoryStore, SharedStore};
    use std::sync::Arc;
    use std::time::Duration;

    fn task(task_type: &str, payload: serde_json::Value) -> Message {
        Message::new("client", MessageKind::TaskRequest(TaskRequest::new(task_type, payload)))
    }

    #[test]
    fn test_answer_task() {
        match answer_task("svc", &task("ping", json!(null))) {
            Some(MessageKind::TaskResponse(r)) => {
                assert_eq!(r.status, TaskStatus::Completed);
                assert_eq!(r.result.unwrap()["service"], "svc");
            }
            _ => panic!("Wrong variant"),
        }
        match answer_task("svc", &task("deploy", json!({}))) {
            Some(MessageKind::TaskResponse(r)) => {
                assert_eq!(r.status, TaskStatus::Failed);
                assert!(r.error.unwrap().contains("deploy"));
            }
            _ => panic!("Wrong variant"),
        }
    }

    #[tokio::test]
    async fn test_builtin_echo_over_bus() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let server = MessageBus::new(store.clone(), "worker", BusConfig::default());
        let client = MessageBus::new(store, "client", BusConfig::default());
        register_builtin_handlers(&server).await;
        server.start().await.unwrap();
        client.start().await.unwrap();

        let request = task("echo", json!({ "n": 7 }));
        let reply = client
            .send_request("worker", request.clone(), Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(reply.correlation_id.as_deref(), Some(request.id.as_str()));
        match reply.kind {
            MessageKind::TaskResponse(r) => assert_eq!(r.result, Some(json!({ "n": 7 }))),
            _ => panic!("Wrong variant"),
        }

        client.stop().await;
        server.stop().await;
    }
}
