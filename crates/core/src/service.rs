/// Async front end for a `Node`.
///
/// The node is owned by one spawned task. Everything that touches it,
/// whether a cell arrival, a channel notification, a timer tick or a
/// caller's query, goes through that task's queue, so events are handled
/// strictly one at a time.
use crate::cell::Cell;
use crate::channel::{ChannelId, ChannelLayer};
use crate::node::Node;
use anyhow::{anyhow, Result};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// How many events may wait for the node before senders block
const EVENT_QUEUE_DEPTH: usize = 1024;

/// Default interval between build-timeout checks
pub const DEFAULT_TICK: Duration = Duration::from_secs(1);

/// Something that happened on the channel layer
#[derive(Debug, Clone)]
pub enum NodeEvent {
    Cell { chan: ChannelId, cell: Cell },
    ChannelReady(ChannelId),
    ChannelFailed(ChannelId),
    ChannelClosed(ChannelId),
}

type Job<C> = Box<dyn FnOnce(&mut Node<C>) + Send>;

enum Command<C: ChannelLayer> {
    Event(NodeEvent),
    Call(Job<C>),
    Shutdown,
}

/// Cloneable handle to a node running on its own task
pub struct NodeHandle<C: ChannelLayer> {
    tx: mpsc::Sender<Command<C>>,
}

impl<C: ChannelLayer> Clone for NodeHandle<C> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl<C> NodeHandle<C>
where
    C: ChannelLayer + Send + 'static,
{
    /// Move `node` onto a new task. The join handle yields the node back
    /// once the handle asks for shutdown or every handle is dropped.
    pub fn spawn(node: Node<C>, tick: Duration) -> (Self, JoinHandle<Node<C>>) {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let task = tokio::spawn(run(node, rx, tick));
        (Self { tx }, task)
    }

    /// Queue a channel-layer event for the node
    pub async fn send(&self, event: NodeEvent) -> Result<()> {
        self.tx
            .send(Command::Event(event))
            .await
            .map_err(|_| anyhow!("node event loop has stopped"))
    }

    /// Run `f` against the node between two events and return its result
    pub async fn call<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Node<C>) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job: Job<C> = Box::new(move |node| {
            // The caller may have given up waiting
            let _ = reply_tx.send(f(node));
        });
        self.tx
            .send(Command::Call(job))
            .await
            .map_err(|_| anyhow!("node event loop has stopped"))?;
        reply_rx
            .await
            .map_err(|_| anyhow!("node event loop dropped the request"))
    }

    /// Stop the event loop after the events already queued
    pub async fn shutdown(&self) -> Result<()> {
        self.tx
            .send(Command::Shutdown)
            .await
            .map_err(|_| anyhow!("node event loop has stopped"))
    }
}

async fn run<C: ChannelLayer>(mut node: Node<C>, mut rx: mpsc::Receiver<Command<C>>, tick: Duration) -> Node<C> {
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!("Node event loop started, tick every {:?}", tick);

    loop {
        tokio::select! {
            command = rx.recv() => match command {
                Some(Command::Event(event)) => dispatch(&mut node, event),
                Some(Command::Call(job)) => job(&mut node),
                Some(Command::Shutdown) | None => break,
            },
            _ = ticker.tick() => node.expire_building(Instant::now()),
        }
    }

    info!("Node event loop stopped");
    node
}

fn dispatch<C: ChannelLayer>(node: &mut Node<C>, event: NodeEvent) {
    match event {
        NodeEvent::Cell { chan, cell } => node.handle_cell(chan, cell),
        NodeEvent::ChannelReady(chan) => node.channel_ready(chan),
        NodeEvent::ChannelFailed(chan) => node.channel_failed(chan),
        NodeEvent::ChannelClosed(chan) => node.channel_closed(chan),
    }
}
