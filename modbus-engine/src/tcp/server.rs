use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::Instrument;

use crate::client::Framing;
use crate::common::phys::PhysLayer;
use crate::decode::DecodeLevel;
use crate::server::handler::{ConnectionListener, RequestHandler};
use crate::server::task::SessionTask;

/// Live sessions, oldest first
///
/// Dropping a session's sender ends that session.
struct SessionTracker {
    max: usize,
    id: u64,
    sessions: BTreeMap<u64, mpsc::Sender<()>>,
}

type SessionTrackerWrapper = Arc<Mutex<SessionTracker>>;

impl SessionTracker {
    fn new(max: usize) -> SessionTracker {
        Self {
            max,
            id: 0,
            sessions: BTreeMap::new(),
        }
    }

    fn wrapped(max: usize) -> SessionTrackerWrapper {
        Arc::new(Mutex::new(Self::new(max)))
    }

    fn get_next_id(&mut self) -> u64 {
        let ret = self.id;
        self.id += 1;
        ret
    }

    fn add(&mut self, sender: mpsc::Sender<()>) -> u64 {
        if self.sessions.len() >= self.max {
            if let Some((id, _)) = self.sessions.pop_first() {
                tracing::warn!("exceeded max connections, closing oldest session: {}", id);
            }
        }

        let id = self.get_next_id();
        self.sessions.insert(id, sender);
        id
    }

    fn remove(&mut self, id: u64) {
        self.sessions.remove(&id);
    }

    fn clear(&mut self) {
        self.sessions.clear();
    }
}

fn lock(tracker: &SessionTrackerWrapper) -> MutexGuard<'_, SessionTracker> {
    tracker.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Accepts connections and spawns a session task for each
pub(crate) struct TcpServerTask {
    listener: TcpListener,
    handler: Arc<dyn RequestHandler>,
    connections: Option<Arc<dyn ConnectionListener>>,
    tracker: SessionTrackerWrapper,
    decode: DecodeLevel,
}

impl TcpServerTask {
    pub(crate) fn new(
        max_sessions: usize,
        listener: TcpListener,
        handler: Arc<dyn RequestHandler>,
        connections: Option<Arc<dyn ConnectionListener>>,
        decode: DecodeLevel,
    ) -> Self {
        Self {
            listener,
            handler,
            connections,
            tracker: SessionTracker::wrapped(max_sessions),
            decode,
        }
    }

    pub(crate) async fn run(&mut self, mut shutdown: mpsc::Receiver<()>) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("server shutdown");
                    break;
                }
                result = self.listener.accept() => {
                    match result {
                        Err(err) => {
                            tracing::error!("error accepting connection: {}", err);
                            break;
                        }
                        Ok((socket, addr)) => self.handle(socket, addr),
                    }
                }
            }
        }
        // ends every session
        lock(&self.tracker).clear();
    }

    fn handle(&self, socket: TcpStream, addr: SocketAddr) {
        if let Some(connections) = &self.connections {
            if !connections.on_connect(addr) {
                tracing::info!("rejected connection from: {}", addr);
                return;
            }
        }

        if let Err(err) = socket.set_nodelay(true) {
            tracing::warn!("unable to enable TCP_NODELAY: {}", err);
        }

        let (tx, rx) = mpsc::channel(1);
        let id = lock(&self.tracker).add(tx);
        tracing::info!("accepted connection {} from: {}", id, addr);

        let mut session = SessionTask::new(Framing::Tcp, self.handler.clone(), self.decode, rx);
        let tracker = self.tracker.clone();
        let connections = self.connections.clone();

        tokio::spawn(
            async move {
                let err = session.run(PhysLayer::new_tcp(socket)).await;
                tracing::info!("shutdown session {}: {}", id, err);
                lock(&tracker).remove(id);
                if let Some(connections) = connections {
                    connections.on_disconnect(addr);
                }
            }
            .instrument(tracing::info_span!("Session", remote = ?addr)),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_closes_oldest_session_when_full() {
        let mut tracker = SessionTracker::new(2);
        let (tx1, mut rx1) = mpsc::channel(1);
        let (tx2, mut rx2) = mpsc::channel(1);
        let (tx3, mut rx3) = mpsc::channel(1);

        assert_eq!(tracker.add(tx1), 0);
        assert_eq!(tracker.add(tx2), 1);
        assert_eq!(tracker.add(tx3), 2);

        assert_eq!(rx1.try_recv(), Err(mpsc::error::TryRecvError::Disconnected));
        assert_eq!(rx2.try_recv(), Err(mpsc::error::TryRecvError::Empty));
        assert_eq!(rx3.try_recv(), Err(mpsc::error::TryRecvError::Empty));
    }

    #[test]
    fn removed_session_is_not_evicted_again() {
        let mut tracker = SessionTracker::new(2);
        let (tx1, _rx1) = mpsc::channel(1);
        let (tx2, mut rx2) = mpsc::channel(1);
        let (tx3, _rx3) = mpsc::channel(1);

        let first = tracker.add(tx1);
        tracker.add(tx2);
        tracker.remove(first);
        tracker.add(tx3);

        assert_eq!(rx2.try_recv(), Err(mpsc::error::TryRecvError::Empty));
    }

    #[test]
    fn clear_ends_every_session() {
        let mut tracker = SessionTracker::new(10);
        let (tx, mut rx) = mpsc::channel(1);
        tracker.add(tx);
        tracker.clear();
        assert_eq!(rx.try_recv(), Err(mpsc::error::TryRecvError::Disconnected));
    }
}
