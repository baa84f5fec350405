//! Command executor: accepts connections on the executor port, queues every
//! parsed command, and runs them one per tick against a [`SceneHost`].
//!
//! Socket I/O happens on as many tasks as there are clients, but commands are
//! only ever executed by whoever drives [`CommandQueue::tick`], so the host is
//! never touched concurrently. A client connection moves through
//! accepted, queued, executing and responded before its next command is read.

use crate::host::{self, SceneHost};
use crate::protocol::{write_message, CommandMessage, FrameError, MessageReader, ResultMessage};
use serde_json::Value as JsonValue;
use std::collections::VecDeque;
use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch, Mutex};
use tokio::time::{Duration, MissedTickBehavior};
use uuid::Uuid;

pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(50);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(500);
const SHUTDOWN_MESSAGE: &str = "Executor is shutting down";

struct QueuedCommand {
    command: CommandMessage,
    reply: oneshot::Sender<ResultMessage>,
}

/// FIFO of commands waiting for the main-thread tick.
#[derive(Clone, Default)]
pub struct CommandQueue {
    pending: Arc<Mutex<VecDeque<QueuedCommand>>>,
}

impl CommandQueue {
    pub async fn enqueue(&self, command: CommandMessage) -> oneshot::Receiver<ResultMessage> {
        let (reply, rx) = oneshot::channel();
        self.pending
            .lock()
            .await
            .push_back(QueuedCommand { command, reply });
        rx
    }

    /// Answers every pending command with an error without running it.
    /// Returns how many were rejected.
    pub async fn reject_pending(&self, message: &str) -> usize {
        let pending: Vec<QueuedCommand> = self.pending.lock().await.drain(..).collect();
        let rejected = pending.len();
        for QueuedCommand { command, reply } in pending {
            reply.send(ResultMessage::error(command.id, message)).ok();
        }
        rejected
    }

    pub async fn len(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.pending.lock().await.is_empty()
    }

    /// Runs at most one pending command to completion. Returns whether a
    /// command was executed.
    pub async fn tick<H: SceneHost + ?Sized>(&self, host: &mut H) -> bool {
        let next = { self.pending.lock().await.pop_front() };
        let Some(QueuedCommand { command, reply }) = next else {
            return false;
        };
        let response = host::handle_command(host, command);
        if reply.send(response).is_err() {
            tracing::debug!("Client went away before its response was ready");
        }
        true
    }
}

/// Drives [`CommandQueue::tick`] on a fixed cadence until `shutdown` fires.
pub async fn run_tick_loop<H: SceneHost + ?Sized>(
    queue: CommandQueue,
    host: &mut H,
    period: Duration,
    mut shutdown: watch::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                queue.tick(host).await;
            }
        }
    }
    let rejected = queue.reject_pending(SHUTDOWN_MESSAGE).await;
    if rejected > 0 {
        tracing::warn!("Tick loop stopped with {rejected} commands still queued");
    } else {
        tracing::info!("Tick loop stopped");
    }
}

pub enum BindOutcome {
    Listener(TcpListener),
    AddrInUse,
}

pub async fn bind_executor_listener(addr: (IpAddr, u16)) -> Result<BindOutcome, io::Error> {
    match TcpListener::bind(addr).await {
        Ok(listener) => Ok(BindOutcome::Listener(listener)),
        Err(err) if err.kind() == io::ErrorKind::AddrInUse => Ok(BindOutcome::AddrInUse),
        Err(err) => Err(err),
    }
}

/// Accepts clients until `shutdown` fires; each client gets its own task.
pub async fn serve(listener: TcpListener, queue: CommandQueue, mut shutdown: watch::Receiver<()>) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        tracing::info!("Connected to client: {peer}");
                        tokio::spawn(handle_client(stream, queue.clone(), shutdown.clone()));
                    }
                    Err(err) => {
                        tracing::error!("Error accepting connection: {err}");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                }
            }
        }
    }
    tracing::info!("Executor listener stopped");
}

fn request_id(value: &JsonValue) -> Option<Uuid> {
    value
        .get("id")
        .and_then(|id| serde_json::from_value(id.clone()).ok())
}

async fn handle_client(stream: TcpStream, queue: CommandQueue, mut shutdown: watch::Receiver<()>) {
    let (read, mut write) = stream.into_split();
    let mut reader = MessageReader::new(read);
    let mut closing = false;
    while !closing {
        let next = tokio::select! {
            _ = shutdown.changed() => {
                tracing::info!("Closing client connection for shutdown");
                break;
            }
            next = reader.next_value() => next,
        };
        let value = match next {
            Ok(Some(value)) => value,
            Ok(None) => {
                tracing::info!("Client disconnected");
                break;
            }
            Err(err @ (FrameError::Syntax(_) | FrameError::TooLarge(_))) => {
                tracing::warn!("Rejecting unreadable input: {err}");
                let response = ResultMessage::error(None, err.to_string());
                write_message(&mut write, &response).await.ok();
                break;
            }
            Err(err) => {
                tracing::warn!("Error receiving data: {err}");
                break;
            }
        };

        let response = match serde_json::from_value::<CommandMessage>(value.clone()) {
            Ok(command) => {
                let id = command.id;
                let reply = queue.enqueue(command).await;
                tokio::select! {
                    answered = reply => answered.unwrap_or_else(|_| {
                        closing = true;
                        ResultMessage::error(id, SHUTDOWN_MESSAGE)
                    }),
                    _ = shutdown.changed() => {
                        closing = true;
                        ResultMessage::error(id, SHUTDOWN_MESSAGE)
                    }
                }
            }
            Err(err) => ResultMessage::error(request_id(&value), format!("Invalid command: {err}")),
        };

        if let Err(err) = write_message(&mut write, &response).await {
            tracing::warn!("Failed to send response - client disconnected: {err}");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blender_connection::BlenderConnection;
    use crate::dispatch::Dispatcher;
    use crate::error::DispatchError;
    use crate::protocol::Outcome;
    use crate::scene::InMemoryScene;
    use serde_json::{json, Map};
    use std::net::{Ipv4Addr, TcpListener as StdTcpListener};

    struct Harness {
        port: u16,
        close: watch::Sender<()>,
    }

    async fn start(scene: InMemoryScene) -> Harness {
        start_with_period(scene, Duration::from_millis(5)).await
    }

    async fn start_with_period(scene: InMemoryScene, period: Duration) -> Harness {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let queue = CommandQueue::default();
        let (close, close_rx) = watch::channel(());
        tokio::spawn(serve(listener, queue.clone(), close_rx.clone()));
        tokio::spawn(async move {
            let mut scene = scene;
            run_tick_loop(queue, &mut scene, period, close_rx).await;
        });
        Harness { port, close }
    }

    fn command(kind: &str, params: JsonValue) -> CommandMessage {
        CommandMessage::new(kind, params.as_object().cloned().unwrap_or_default())
    }

    #[tokio::test]
    async fn tick_runs_one_command_in_fifo_order() {
        let queue = CommandQueue::default();
        let mut scene = InMemoryScene::default();
        assert!(!queue.tick(&mut scene).await);

        let first = queue.enqueue(command("init_model", json!({}))).await;
        let second = queue
            .enqueue(command("replace_part", json!({"part_type": "Head", "new_name": "Head_Visor"})))
            .await;
        assert_eq!(queue.len().await, 2);

        assert!(queue.tick(&mut scene).await);
        assert_eq!(queue.len().await, 1);
        assert!(first.await.unwrap().is_success());

        assert!(queue.tick(&mut scene).await);
        assert!(second.await.unwrap().is_success());
        assert!(!queue.tick(&mut scene).await);
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn dropped_client_does_not_stall_the_queue() {
        let queue = CommandQueue::default();
        let mut scene = InMemoryScene::default();
        drop(queue.enqueue(command("list_parts", json!({}))).await);
        let kept = queue.enqueue(command("get_scene_info", json!({}))).await;
        assert!(queue.tick(&mut scene).await);
        assert!(queue.tick(&mut scene).await);
        assert!(kept.await.unwrap().is_success());
    }

    #[tokio::test]
    async fn replace_part_then_list_parts_over_tcp() {
        let harness = start(InMemoryScene::default()).await;
        let connection = BlenderConnection::new("127.0.0.1", harness.port, Duration::from_secs(5));
        let dispatcher = Dispatcher::new(connection, false);

        dispatcher.call("init_model", json!({})).await.unwrap();
        let before = dispatcher.call("list_parts", json!({})).await.unwrap();
        dispatcher
            .call("replace_part", json!({"slot": "head", "asset_id": "Head_Helmet"}))
            .await
            .unwrap();
        let after = dispatcher.call("list_parts", json!({})).await.unwrap();

        assert_eq!(after["bound"]["head"], json!("Head_Helmet"));
        for slot in ["waist", "arms", "legs"] {
            assert_eq!(after["bound"][slot], before["bound"][slot]);
        }
        harness.close.send(()).ok();
    }

    #[tokio::test]
    async fn node_group_round_trip_over_tcp() {
        let mut scene = InMemoryScene::default();
        scene.node_groups.push(crate::scene::NodeGroup {
            name: "CityGenerator".to_string(),
            inputs: vec![crate::scene::NodeGroupInput {
                name: "block_size".to_string(),
                kind: "VALUE".to_string(),
                default: json!(8.0),
            }],
        });
        let harness = start(scene).await;
        let connection = BlenderConnection::new("127.0.0.1", harness.port, Duration::from_secs(5));
        let dispatcher = Dispatcher::new(connection, false);

        assert_eq!(
            dispatcher
                .call("has_node_group", json!({"name": "CityGenerator"}))
                .await
                .unwrap(),
            json!(true)
        );
        assert_eq!(
            dispatcher
                .call("has_node_group", json!({"name": "Forest"}))
                .await
                .unwrap(),
            json!(false)
        );
        dispatcher
            .call(
                "set_node_group_input",
                json!({"name": "CityGenerator", "input": "block_size", "value": 12.0}),
            )
            .await
            .unwrap();
        let inputs = dispatcher
            .call("get_node_group_inputs", json!({"name": "CityGenerator"}))
            .await
            .unwrap();
        assert_eq!(inputs[0]["name"], json!("block_size"));
        assert_eq!(inputs[0]["default"], json!(12.0));
        harness.close.send(()).ok();
    }

    #[tokio::test]
    async fn handler_failure_keeps_the_executor_running() {
        let harness = start(InMemoryScene::default()).await;
        let connection = BlenderConnection::new("127.0.0.1", harness.port, Duration::from_secs(5));
        let dispatcher = Dispatcher::new(connection, true);

        let err = dispatcher
            .call("get_object_info", json!({"name": "Ghost"}))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Handler(ref m) if m == "Object not found: Ghost"));
        let err = dispatcher
            .call("execute_blender_code", json!({"code": "print(1)"}))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Handler(_)));

        let cube = dispatcher
            .call("get_object_info", json!({"name": "Cube"}))
            .await
            .unwrap();
        assert_eq!(cube["type"], json!("MESH"));
        harness.close.send(()).ok();
    }

    #[tokio::test]
    async fn pipelined_commands_answer_in_order_with_matching_ids() {
        let harness = start(InMemoryScene::default()).await;
        let stream = TcpStream::connect((Ipv4Addr::LOCALHOST, harness.port))
            .await
            .unwrap();
        let (read, mut write) = stream.into_split();
        let mut reader = MessageReader::new(read);

        let commands = [
            command("init_model", json!({})),
            command("replace_part", json!({"part_type": "Legs", "new_name": "Leg_Boots"})),
            command("list_parts", json!({})),
            command("render", json!({})),
        ];
        for command in &commands {
            write_message(&mut write, command).await.unwrap();
        }

        let mut responses = Vec::new();
        for _ in &commands {
            responses.push(reader.next::<ResultMessage>().await.unwrap().unwrap());
        }
        for (command, response) in commands.iter().zip(&responses) {
            assert_eq!(response.id, command.id);
        }
        match &responses[2].outcome {
            Outcome::Success { result } => assert_eq!(result["bound"]["legs"], json!("Leg_Boots")),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            responses[3].outcome,
            Outcome::Error {
                message: "Unknown command type: render".to_string()
            }
        );
        harness.close.send(()).ok();
    }

    #[tokio::test]
    async fn malformed_command_gets_an_error_with_its_id() {
        let harness = start(InMemoryScene::default()).await;
        let stream = TcpStream::connect((Ipv4Addr::LOCALHOST, harness.port))
            .await
            .unwrap();
        let (read, mut write) = stream.into_split();
        let mut reader = MessageReader::new(read);

        let id = Uuid::new_v4();
        write_message(&mut write, &json!({"params": {}, "id": id}))
            .await
            .unwrap();
        let response: ResultMessage = reader.next().await.unwrap().unwrap();
        assert_eq!(response.id, Some(id));
        assert!(!response.is_success());

        // The connection stays usable afterwards.
        let follow_up = CommandMessage::new("get_scene_info", Map::new());
        write_message(&mut write, &follow_up).await.unwrap();
        let response: ResultMessage = reader.next().await.unwrap().unwrap();
        assert_eq!(response.id, follow_up.id);
        assert!(response.is_success());
        harness.close.send(()).ok();
    }

    #[tokio::test]
    async fn invalid_json_is_answered_then_closed() {
        let harness = start(InMemoryScene::default()).await;
        let stream = TcpStream::connect((Ipv4Addr::LOCALHOST, harness.port))
            .await
            .unwrap();
        let (read, mut write) = stream.into_split();
        let mut reader = MessageReader::new(read);

        tokio::io::AsyncWriteExt::write_all(&mut write, b"}{ nope")
            .await
            .unwrap();
        let response: ResultMessage = reader.next().await.unwrap().unwrap();
        assert!(!response.is_success());
        assert!(reader.next::<ResultMessage>().await.unwrap().is_none());
        harness.close.send(()).ok();
    }

    #[tokio::test]
    async fn reject_pending_answers_every_queued_command() {
        let queue = CommandQueue::default();
        let first = command("list_parts", json!({}));
        let id = first.id;
        let reply = queue.enqueue(first).await;
        queue.enqueue(command("get_scene_info", json!({}))).await;

        assert_eq!(queue.reject_pending("stopping").await, 2);
        assert!(queue.is_empty().await);
        let response = reply.await.unwrap();
        assert_eq!(response.id, id);
        assert_eq!(
            response.outcome,
            Outcome::Error {
                message: "stopping".to_string()
            }
        );
    }

    #[tokio::test]
    async fn shutdown_answers_waiting_clients_and_closes_them() {
        // The first tick fires immediately; the next one never comes.
        let harness = start_with_period(InMemoryScene::default(), Duration::from_secs(3600)).await;
        let stream = TcpStream::connect((Ipv4Addr::LOCALHOST, harness.port))
            .await
            .unwrap();
        let (read, mut write) = stream.into_split();
        let mut reader = MessageReader::new(read);

        let waiting = command("get_scene_info", json!({}));
        write_message(&mut write, &waiting).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        harness.close.send(()).unwrap();

        let response = tokio::time::timeout(Duration::from_secs(5), reader.next::<ResultMessage>())
            .await
            .expect("client should be answered on shutdown")
            .unwrap()
            .unwrap();
        assert_eq!(response.id, waiting.id);
        assert_eq!(
            response.outcome,
            Outcome::Error {
                message: SHUTDOWN_MESSAGE.to_string()
            }
        );
        let closed = tokio::time::timeout(Duration::from_secs(5), reader.next::<ResultMessage>())
            .await
            .expect("connection should be closed on shutdown")
            .unwrap();
        assert!(closed.is_none());
    }

    #[tokio::test]
    async fn bind_executor_listener_returns_addr_in_use() {
        let std_listener =
            StdTcpListener::bind((Ipv4Addr::LOCALHOST, 0)).expect("bind test listener");
        let port = std_listener.local_addr().expect("port").port();

        let outcome = bind_executor_listener((Ipv4Addr::LOCALHOST.into(), port))
            .await
            .expect("bind outcome");

        match outcome {
            BindOutcome::AddrInUse => {}
            BindOutcome::Listener(_) => panic!("expected AddrInUse, got listener"),
        }
    }

    #[tokio::test]
    async fn bind_executor_listener_propagates_other_errors() {
        let result = bind_executor_listener((Ipv4Addr::new(203, 0, 113, 1).into(), 0)).await;

        match result {
            Ok(BindOutcome::Listener(_)) => {
                panic!("expected bind failure, but listener was created");
            }
            Ok(BindOutcome::AddrInUse) => {
                panic!("expected bind failure, but port reported as in use");
            }
            Err(err) => {
                assert_eq!(err.kind(), io::ErrorKind::AddrNotAvailable);
            }
        }
    }
}
