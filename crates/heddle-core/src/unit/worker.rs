use tokio::sync::mpsc;

use super::protocol::{UnitRequest, UnitResponse};
use crate::domain::{ErrorKind, HandlerError, UnitId};
use crate::typed::HandlerRegistry;

/// Execution unit loop.
///
/// Each unit owns its own [`HandlerRegistry`] and processes one request at a
/// time until its request channel is closed. A panic inside a handler ends
/// the task abnormally; the pool watches for that and replaces the unit.
///
/// # Request Types
///
/// - [`UnitRequest::Run`]: runs the handler registered for `handler_kind`
///   and answers with `Completed` or `Failed`.
/// - [`UnitRequest::Ping`]: answers with `Pong`.
pub(crate) async fn unit_loop(
    unit_id: UnitId,
    slot: usize,
    handlers: HandlerRegistry,
    mut requests: mpsc::Receiver<UnitRequest>,
    responses: mpsc::Sender<UnitResponse>,
) {
    tracing::trace!(%unit_id, slot, "execution unit started");

    while let Some(request) = requests.recv().await {
        let response = match request {
            UnitRequest::Ping => UnitResponse::Pong,
            UnitRequest::Run {
                task_id,
                handler_kind,
                payload,
            } => {
                let result = match handlers.get(handler_kind.as_str()) {
                    Some(handler) => handler.handle_dyn(payload).await,
                    None => Err(HandlerError::new(
                        ErrorKind::UnknownHandler,
                        format!("handler not found for handler_kind={handler_kind}"),
                    )),
                };
                match result {
                    Ok(output) => UnitResponse::Completed { task_id, output },
                    Err(error) => UnitResponse::Failed { task_id, error },
                }
            }
        };

        // 受け手がいなくなった = pool 側がこのユニットを手放した
        if responses.send(response).await.is_err() {
            break;
        }
    }

    tracing::trace!(%unit_id, slot, "execution unit stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{HandlerKind, TaskId};
    use crate::typed::handler::fixtures::GreetHandler;
    use crate::typed::task::fixtures::Greet;
    use crate::typed::Task;

    fn spawn_greeter() -> (
        mpsc::Sender<UnitRequest>,
        mpsc::Receiver<UnitResponse>,
        tokio::task::JoinHandle<()>,
    ) {
        let mut handlers = HandlerRegistry::new();
        handlers.register::<Greet, _>(GreetHandler).unwrap();
        let (req_tx, req_rx) = mpsc::channel(4);
        let (resp_tx, resp_rx) = mpsc::channel(4);
        let join = tokio::spawn(unit_loop(UnitId::generate(), 0, handlers, req_rx, resp_tx));
        (req_tx, resp_rx, join)
    }

    #[tokio::test]
    async fn answers_ping_with_pong() {
        let (tx, mut rx, _join) = spawn_greeter();
        tx.send(UnitRequest::Ping).await.unwrap();
        assert!(matches!(rx.recv().await, Some(UnitResponse::Pong)));
    }

    #[tokio::test]
    async fn runs_registered_handler_and_tags_the_response() {
        let (tx, mut rx, _join) = spawn_greeter();
        let task_id = TaskId::generate();
        tx.send(UnitRequest::Run {
            task_id,
            handler_kind: HandlerKind::new(Greet::TYPE),
            payload: serde_json::json!({"name": "unit"}),
        })
        .await
        .unwrap();

        match rx.recv().await {
            Some(UnitResponse::Completed { task_id: id, output }) => {
                assert_eq!(id, task_id);
                assert_eq!(output, serde_json::json!("Hello, unit!"));
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_handler_is_reported_not_fatal() {
        let (tx, mut rx, _join) = spawn_greeter();
        let task_id = TaskId::generate();
        tx.send(UnitRequest::Run {
            task_id,
            handler_kind: HandlerKind::new("missing.v1"),
            payload: serde_json::json!({}),
        })
        .await
        .unwrap();

        match rx.recv().await {
            Some(UnitResponse::Failed { error, .. }) => {
                assert_eq!(error.kind(), ErrorKind::UnknownHandler);
            }
            other => panic!("unexpected response: {other:?}"),
        }

        // still alive
        tx.send(UnitRequest::Ping).await.unwrap();
        assert!(matches!(rx.recv().await, Some(UnitResponse::Pong)));
    }

    #[tokio::test]
    async fn stops_when_request_channel_closes() {
        let (tx, _rx, join) = spawn_greeter();
        drop(tx);
        join.await.unwrap();
    }
}
