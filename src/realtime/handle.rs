//! The dispatcher task: one loop that owns the [`Dispatcher`] and serializes
//! registry commands with the store change feed.

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::dispatcher::{ClientId, Dispatcher, DispatcherStats};
use super::messages::{ServerMessage, SubscribeRequest};
use super::transport::ClientTransport;
use crate::identity::AuthContext;
use crate::storage::ChangeEvent;

pub enum Command {
    Connect { client: ClientId, transport: Box<dyn ClientTransport>, auth: AuthContext },
    Disconnect { client: ClientId },
    Subscribe { client: ClientId, request: SubscribeRequest },
    Unsubscribe { client: ClientId, id: Option<String>, path: Option<String> },
    /// Swap identity and acknowledge with `action` (`signin` or `signout`).
    Reauthenticate { client: ClientId, auth: AuthContext, action: &'static str },
    Notify { client: ClientId, message: ServerMessage },
    Stats { reply: oneshot::Sender<DispatcherStats> },
}

/// Cloneable sender side of the dispatcher task.
#[derive(Clone)]
pub struct DispatcherHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl DispatcherHandle {
    fn send(&self, cmd: Command) {
        if self.tx.send(cmd).is_err() {
            debug!(target: "realtime", "dispatcher task has stopped");
        }
    }

    pub fn connect<T: ClientTransport + 'static>(&self, client: &str, transport: T, auth: AuthContext) {
        self.send(Command::Connect { client: client.to_string(), transport: Box::new(transport), auth });
    }

    pub fn disconnect(&self, client: &str) { self.send(Command::Disconnect { client: client.to_string() }); }

    pub fn subscribe(&self, client: &str, request: SubscribeRequest) {
        self.send(Command::Subscribe { client: client.to_string(), request });
    }

    pub fn unsubscribe(&self, client: &str, id: Option<String>, path: Option<String>) {
        self.send(Command::Unsubscribe { client: client.to_string(), id, path });
    }

    pub fn reauthenticate(&self, client: &str, auth: AuthContext, action: &'static str) {
        self.send(Command::Reauthenticate { client: client.to_string(), auth, action });
    }

    pub fn notify(&self, client: &str, message: ServerMessage) {
        self.send(Command::Notify { client: client.to_string(), message });
    }

    /// `None` once the dispatcher task has stopped.
    pub async fn stats(&self) -> Option<DispatcherStats> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Stats { reply });
        rx.await.ok()
    }
}

/// Spawn the dispatcher loop. Commands are handled before pending change events so a
/// subscription acknowledged to a client sees every later change. The loop ends when
/// every handle is dropped.
pub fn spawn_dispatcher(dispatcher: Dispatcher, changes: mpsc::UnboundedReceiver<ChangeEvent>) -> (DispatcherHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(run(dispatcher, rx, changes));
    (DispatcherHandle { tx }, task)
}

async fn run(mut dispatcher: Dispatcher, mut commands: mpsc::UnboundedReceiver<Command>, mut changes: mpsc::UnboundedReceiver<ChangeEvent>) {
    let mut feed_open = true;
    loop {
        tokio::select! {
            biased;
            cmd = commands.recv() => match cmd {
                Some(cmd) => apply(&mut dispatcher, cmd),
                None => break,
            },
            ev = changes.recv(), if feed_open => match ev {
                Some(ev) => {
                    let report = dispatcher.on_change(&ev);
                    if report.delivered + report.denied > 0 || !report.dropped.is_empty() {
                        debug!(target: "realtime", seq = ev.seq, path = %ev.path, delivered = report.delivered, denied = report.denied, dropped = report.dropped.len(), "dispatched");
                    }
                }
                None => {
                    info!(target: "realtime", "change feed closed");
                    feed_open = false;
                }
            },
        }
    }
    info!(target: "realtime", "dispatcher stopped");
}

fn apply(d: &mut Dispatcher, cmd: Command) {
    match cmd {
        Command::Connect { client, transport, auth } => d.connect(client, transport, auth),
        Command::Disconnect { client } => {
            d.disconnect(&client);
        }
        Command::Subscribe { client, request } => {
            let request_id = request.id.clone();
            let reply = match d.subscribe(&client, request) {
                Ok(id) => ServerMessage::ack("subscribe", Some(id)),
                Err(e) => ServerMessage::error(request_id, &e),
            };
            d.send_to(&client, reply);
        }
        Command::Unsubscribe { client, id, path } => {
            let removed = d.unsubscribe(&client, id.as_deref(), path.as_deref());
            debug!(target: "realtime", client = %client, removed, "unsubscribed");
            d.send_to(&client, ServerMessage::ack("unsubscribe", id));
        }
        Command::Reauthenticate { client, auth, action } => {
            let uid = auth.uid.clone();
            if d.reauthenticate(&client, auth) {
                d.send_to(&client, ServerMessage::Ack { action: action.to_string(), id: None, uid });
            }
        }
        Command::Notify { client, message } => {
            d.send_to(&client, message);
        }
        Command::Stats { reply } => {
            let _ = reply.send(d.stats());
        }
    }
}
