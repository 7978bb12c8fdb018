use crate::client::ClientCommand;
use crate::config::{HOUSEKEEPING_INTERVAL, SHUTDOWN_CLIENT_BUDGET, SHUTDOWN_TOTAL_BUDGET};
use crate::frame::OpCode;
use crate::registry::{ClientId, Registry};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant};

/// Commands an I/O worker processes, the channel equivalent of the
/// classic command pipe. Clients are referenced by ID and resolved
/// through the registry on the receiving side.
#[derive(Debug)]
pub(crate) enum WorkerCommand {
    AddClient(ClientId),
    RemoveClient(ClientId),
    Broadcast { opcode: OpCode, payload: Vec<u8> },
    Exit,
}

/// Handle to one I/O worker.
pub(crate) struct Worker {
    pub index: usize,
    pub commands: UnboundedSender<WorkerCommand>,
    pub handle: JoinHandle<()>,
}

struct ClientTask {
    control: UnboundedSender<ClientCommand>,
    handle: JoinHandle<()>,
}

impl Worker {
    /// Spawn a worker task. Each worker owns the set of client tasks
    /// assigned to it: it claims registered sessions on AddClient, fans
    /// broadcasts out to them, and drives the bounded shutdown sequence.
    pub fn spawn(index: usize, registry: Arc<Registry>) -> Worker {
        let (commands, rx) = unbounded_channel();
        let handle = tokio::spawn(worker_loop(index, rx, registry));
        Worker {
            index,
            commands,
            handle,
        }
    }
}

async fn worker_loop(
    index: usize,
    mut commands: UnboundedReceiver<WorkerCommand>,
    registry: Arc<Registry>,
) {
    debug!("worker {index} started");

    let mut clients: HashMap<ClientId, ClientTask> = HashMap::new();
    let mut reap = interval_at(
        Instant::now() + HOUSEKEEPING_INTERVAL,
        HOUSEKEEPING_INTERVAL,
    );

    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else { break };
                match command {
                    WorkerCommand::AddClient(id) => add_client(index, &registry, &mut clients, id),
                    WorkerCommand::RemoveClient(id) => {
                        if let Some(task) = clients.get(&id) {
                            if task.control.send(ClientCommand::Remove).is_err() {
                                clients.remove(&id);
                            }
                        } else {
                            warn!("worker {index}: client {id} not found for remove command");
                        }
                    }
                    WorkerCommand::Broadcast { opcode, payload } => {
                        // the session itself enforces that only OPEN
                        // clients get the message
                        for task in clients.values() {
                            let _ = task.control.send(ClientCommand::Send {
                                opcode,
                                payload: payload.clone(),
                                use_compression: true,
                            });
                        }
                    }
                    WorkerCommand::Exit => {
                        shutdown_clients(index, clients).await;
                        break;
                    }
                }
            }
            _ = reap.tick() => {
                clients.retain(|_, task| !task.handle.is_finished());
            }
        }
    }

    info!("worker {index} exiting");
}

fn add_client(
    index: usize,
    registry: &Arc<Registry>,
    clients: &mut HashMap<ClientId, ClientTask>,
    id: ClientId,
) {
    let Some(session) = registry.take_pending(id) else {
        error!("worker {index}: client {id} not found for add command");
        return;
    };
    let Some(control) = registry.control(id) else {
        error!("worker {index}: client {id} has no control channel");
        return;
    };

    debug!("worker {index}: adding client {id}");
    let session = *session;
    let handle = tokio::spawn(session.run());
    clients.insert(id, ClientTask { control, handle });
}

/// Graceful shutdown: ask every client to close with 1001 and give each a
/// bounded slice of a bounded total budget to drain; stragglers are
/// aborted.
async fn shutdown_clients(index: usize, clients: HashMap<ClientId, ClientTask>) {
    let total = clients.len();
    if total == 0 {
        return;
    }

    let deadline = Instant::now() + SHUTDOWN_TOTAL_BUDGET;
    let mut closed = 0usize;
    let mut skipped = 0usize;

    for task in clients.values() {
        let _ = task.control.send(ClientCommand::Shutdown);
    }

    for (id, mut task) in clients {
        let budget = SHUTDOWN_CLIENT_BUDGET.min(deadline.saturating_duration_since(Instant::now()));
        match timeout(budget, &mut task.handle).await {
            Ok(_) => closed += 1,
            Err(_) => {
                debug!("worker {index}: client {id} did not drain in time, aborting");
                task.handle.abort();
                skipped += 1;
            }
        }
    }

    info!("worker {index} shutdown complete: {closed} clients closed gracefully, {skipped} aborted");
}
