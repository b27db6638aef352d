//! Modbus client: one connection, any number of concurrent callers
//!
//! Callers queue requests to a write task that owns the write half of the
//! connection. The connection task reads responses and correlates them by
//! transaction id (TCP) or by the single outstanding request on the line (RTU).

mod pending;
mod task;

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{ready, Context, Poll};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::client::pending::{spawn_sweeper, PendingTable, ReplyReceiver};
use crate::client::task::{ClientTask, Outcome, Queued};
use crate::common::frame::TxIdGenerator;
use crate::common::phys::Connector;
use crate::constants::defaults;
use crate::decode::DecodeLevel;
use crate::error::{InvalidRequest, RequestError};
use crate::exception::ExceptionCode;
use crate::pdu::ModbusMessage;
use crate::retry::{doubling_retry_strategy, RetryStrategy};
use crate::tcp::client::TcpConnector;

/// How ADUs are framed on the connection
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub enum Framing {
    /// MBAP header, responses matched by transaction id
    Tcp,
    /// unit id and CRC trailer, one request in flight at a time
    Rtu,
}

/// State of the client connection, published on a watch channel
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// not started, stopped or gave up
    Disconnected,
    /// a connection attempt is in progress
    Connecting,
    /// requests can be sent
    Connected,
    /// waiting out the retry delay before the next attempt
    Reconnecting,
}

/// Client configuration
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct ClientConfig {
    /// How long [`ModbusClient::send`] waits for a reply
    pub reply_timeout: Duration,
    /// Reconnect after connection failures and disconnects
    pub auto_reconnect: bool,
    /// Delay before the first reconnect attempt
    pub reconnect_delay: Duration,
    /// If set, the reconnect delay doubles after every failed attempt up to this value
    pub max_reconnect_delay: Option<Duration>,
    /// Age after which an unanswered request is failed with [`RequestError::Expired`]
    pub pending_ttl: Duration,
    /// Minimum interval between two writes on the connection
    pub min_send_delay: Option<Duration>,
    /// Protocol decoding
    pub decode: DecodeLevel,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            reply_timeout: defaults::REPLY_TIMEOUT,
            auto_reconnect: true,
            reconnect_delay: defaults::AUTO_RECONNECT_DELAY,
            max_reconnect_delay: None,
            pending_ttl: defaults::PENDING_MESSAGE_TTL,
            min_send_delay: None,
            decode: DecodeLevel::default(),
        }
    }
}

impl ClientConfig {
    /// Set the reply timeout
    pub fn with_reply_timeout(self, reply_timeout: Duration) -> Self {
        Self {
            reply_timeout,
            ..self
        }
    }

    /// Enable or disable automatic reconnection
    pub fn with_auto_reconnect(self, auto_reconnect: bool) -> Self {
        Self {
            auto_reconnect,
            ..self
        }
    }

    /// Set the reconnect delay
    pub fn with_reconnect_delay(self, reconnect_delay: Duration) -> Self {
        Self {
            reconnect_delay,
            ..self
        }
    }

    /// Double the reconnect delay after each failed attempt, up to `max`
    pub fn with_max_reconnect_delay(self, max: Duration) -> Self {
        Self {
            max_reconnect_delay: Some(max),
            ..self
        }
    }

    /// Set the pending request TTL
    pub fn with_pending_ttl(self, pending_ttl: Duration) -> Self {
        Self {
            pending_ttl,
            ..self
        }
    }

    /// Enforce a minimum interval between writes
    pub fn with_min_send_delay(self, delay: Duration) -> Self {
        Self {
            min_send_delay: Some(delay),
            ..self
        }
    }

    /// Set the decode level
    pub fn with_decode_level(self, decode: DecodeLevel) -> Self {
        Self { decode, ..self }
    }

    pub(crate) fn retry_strategy(&self) -> Box<dyn RetryStrategy> {
        doubling_retry_strategy(
            self.reconnect_delay,
            self.max_reconnect_delay.unwrap_or(self.reconnect_delay),
        )
    }
}

/// A request and the response correlated with it
///
/// On RTU a response whose CRC does not match is still delivered, flagged
/// through [`crc_valid`](Self::crc_valid) and [`validate`](Self::validate).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reply {
    request: ModbusMessage,
    response: ModbusMessage,
    integrity: Result<(), InvalidRequest>,
}

impl Reply {
    /// The request that was sent
    pub fn request(&self) -> &ModbusMessage {
        &self.request
    }

    /// The response received, possibly an exception response
    pub fn response(&self) -> &ModbusMessage {
        &self.response
    }

    /// False if the RTU frame carrying the response failed its CRC check
    pub fn crc_valid(&self) -> bool {
        self.integrity.is_ok()
    }

    /// The CRC check of the frame carrying the response, always Ok on TCP
    pub fn validate(&self) -> Result<(), InvalidRequest> {
        self.integrity
    }

    /// Split into request and response
    pub fn into_parts(self) -> (ModbusMessage, ModbusMessage) {
        (self.request, self.response)
    }

    /// The response, or its exception code if the server answered with an exception
    pub fn into_result(self) -> Result<ModbusMessage, ExceptionCode> {
        match self.response.error() {
            Some(code) => Err(code),
            None => Ok(self.response),
        }
    }
}

/// Completes when the reply to a request sent with [`ModbusClient::send_async`] arrives
///
/// Dropping the future abandons the request.
pub struct ResponseFuture {
    request: Option<ModbusMessage>,
    key: u16,
    seq: u64,
    rx: ReplyReceiver,
    pending: Arc<PendingTable>,
}

impl Future for ResponseFuture {
    type Output = Result<Reply, RequestError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let result = ready!(Pin::new(&mut this.rx).poll(cx));
        let response = match result {
            Ok(response) => response,
            // the table was dropped with the entry still in it
            Err(_) => Err(RequestError::Shutdown),
        };
        let result = match (response, this.request.take()) {
            (Ok(received), Some(request)) => Ok(Reply {
                request,
                response: received.message,
                integrity: received.integrity,
            }),
            (Err(err), _) => Err(err),
            (Ok(_), None) => Err(RequestError::Shutdown),
        };
        Poll::Ready(result)
    }
}

impl Drop for ResponseFuture {
    fn drop(&mut self) {
        self.pending.remove(self.key, self.seq);
    }
}

/// State shared between callers and the connection task
pub(crate) struct Shared {
    pub(crate) pending: Arc<PendingTable>,
    /// queue to the write task of the active connection
    requests: Mutex<Option<mpsc::Sender<Queued>>>,
    state: watch::Sender<ConnectionState>,
    tx_ids: TxIdGenerator,
    line: Arc<Semaphore>,
}

impl Shared {
    fn new() -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            pending: Arc::new(PendingTable::new()),
            requests: Mutex::new(None),
            state,
            tx_ids: TxIdGenerator::new(),
            line: Arc::new(Semaphore::new(1)),
        }
    }

    fn requests(&self) -> Option<mpsc::Sender<Queued>> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_requests(&self, requests: Option<mpsc::Sender<Queued>>) {
        *self.requests.lock().unwrap_or_else(PoisonError::into_inner) = requests;
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!("{:?} -> {:?}", previous, state);
        }
    }
}

struct Running {
    stop: watch::Sender<bool>,
    supervisor: JoinHandle<()>,
    sweeper: JoinHandle<()>,
    outcome: watch::Receiver<Outcome>,
}

impl Drop for Running {
    fn drop(&mut self) {
        // the supervisor notices the stop sender going away on its own
        self.sweeper.abort();
    }
}

struct Inner {
    framing: Framing,
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
}

impl Inner {
    fn running(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn(&self) -> Running {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (outcome_tx, outcome_rx) = watch::channel(None);

        let span = match self.framing {
            Framing::Tcp => tracing::info_span!("Modbus-Client-TCP"),
            Framing::Rtu => tracing::info_span!("Modbus-Client-RTU"),
        };
        let task = ClientTask::new(
            self.framing,
            self.config,
            self.connector.clone(),
            self.shared.clone(),
            stop_rx,
            outcome_tx,
        );

        Running {
            stop: stop_tx,
            supervisor: tokio::spawn(task.run().instrument(span)),
            sweeper: spawn_sweeper(self.shared.pending.clone(), self.config.pending_ttl),
            outcome: outcome_rx,
        }
    }
}

/// Handle to a Modbus client
///
/// Cheap to clone; every clone drives the same connection. The connection
/// task stops when [`ModbusClient::stop`] is called or the last handle is dropped.
#[derive(Clone)]
pub struct ModbusClient {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ModbusClient {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ModbusClient")
            .field("framing", &self.inner.framing)
            .field("state", &self.state())
            .finish()
    }
}

impl ModbusClient {
    /// Client that opens its connections with `connector`
    pub fn new<C>(framing: Framing, connector: C, config: ClientConfig) -> Self
    where
        C: Connector,
    {
        Self {
            inner: Arc::new(Inner {
                framing,
                config,
                connector: Arc::new(connector),
                shared: Arc::new(Shared::new()),
                running: Mutex::new(None),
            }),
        }
    }

    /// Modbus/TCP client for the server at `addr`
    pub fn tcp(addr: std::net::SocketAddr, config: ClientConfig) -> Self {
        Self::new(Framing::Tcp, TcpConnector::new(addr), config)
    }

    /// Modbus/RTU client on the serial port at `path`
    #[cfg(feature = "serial")]
    pub fn rtu(path: &str, settings: crate::serial::SerialSettings, config: ClientConfig) -> Self {
        Self::new(
            Framing::Rtu,
            crate::serial::SerialConnector::new(path, settings),
            config,
        )
    }

    /// Framing used on the connection
    pub fn framing(&self) -> Framing {
        self.inner.framing
    }

    /// Configuration the client was built with
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        *self.inner.shared.state.borrow()
    }

    /// Watch connection state changes
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.inner.shared.state.subscribe()
    }

    /// Number of requests waiting for a reply
    pub fn pending_requests(&self) -> usize {
        self.inner.shared.pending.len()
    }

    /// Connect and start the pending request sweeper
    ///
    /// Returns the result of the first connection attempt. Calling `start` again
    /// before [`stop`](Self::stop) returns that same result without connecting
    /// again. With auto-reconnect enabled the client keeps trying after a
    /// failed first attempt.
    pub async fn start(&self) -> Result<(), RequestError> {
        let mut outcome = {
            let mut running = self.inner.running();
            match running.as_ref() {
                Some(running) => running.outcome.clone(),
                None => {
                    tracing::info!("starting {:?} client", self.inner.framing);
                    let started = self.inner.spawn();
                    let outcome = started.outcome.clone();
                    *running = Some(started);
                    outcome
                }
            }
        };

        let result = *outcome
            .wait_for(Option::is_some)
            .await
            .map_err(|_| RequestError::Shutdown)?;
        result.unwrap_or(Err(RequestError::Shutdown))
    }

    /// Close the connection, stop reconnecting and fail every waiting caller with
    /// [`RequestError::Shutdown`]
    pub async fn stop(&self) {
        let running = self.inner.running().take();
        if let Some(mut running) = running {
            tracing::info!("stopping {:?} client", self.inner.framing);
            running.stop.send_replace(true);
            if let Err(err) = (&mut running.supervisor).await {
                tracing::warn!("client task ended abnormally: {}", err);
            }
        }
        self.inner.shared.pending.fail_all(RequestError::Shutdown);
        self.inner.shared.set_state(ConnectionState::Disconnected);
    }

    /// Queue `request` and return, once it is written, a future that completes with its reply
    ///
    /// Fails immediately with [`RequestError::NoConnection`] when not connected.
    /// On RTU the request is written once the previous request on the line is
    /// answered, timed out or expired.
    pub async fn send_async(&self, request: ModbusMessage) -> Result<ResponseFuture, RequestError> {
        let shared = &self.inner.shared;
        let requests = shared.requests().ok_or(RequestError::NoConnection)?;

        let (written, rx) = oneshot::channel();
        requests
            .send(Queued {
                request: request.clone(),
                written,
            })
            .await
            .map_err(|_| RequestError::Shutdown)?;
        let registered = rx.await.map_err(|_| RequestError::Shutdown)??;

        Ok(ResponseFuture {
            request: Some(request),
            key: registered.key,
            seq: registered.seq,
            rx: registered.rx,
            pending: shared.pending.clone(),
        })
    }

    /// Send `request` and wait up to the reply timeout for its reply
    ///
    /// The timeout covers queueing and writing the request as well as the
    /// reply. A timeout abandons the request but leaves the connection open.
    pub async fn send(&self, request: ModbusMessage) -> Result<Reply, RequestError> {
        let reply = async { self.send_async(request).await?.await };
        match tokio::time::timeout(self.inner.config.reply_timeout, reply).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    "no reply within {} ms",
                    self.inner.config.reply_timeout.as_millis()
                );
                Err(RequestError::ResponseTimeout)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::time::Instant;

    use super::*;
    use crate::common::phys::{ConnectFuture, PhysLayer};
    use crate::pdu::*;
    use crate::serial::frame::format_rtu;
    use crate::tcp::frame::format_mbap;
    use crate::types::UnitId;

    /// Hands the far end of every connection to the test
    struct DuplexConnector {
        peers: mpsc::UnboundedSender<DuplexStream>,
        failures: AtomicUsize,
    }

    impl DuplexConnector {
        fn new(failures: usize) -> (Self, mpsc::UnboundedReceiver<DuplexStream>) {
            let (tx, rx) = mpsc::unbounded_channel();
            (
                Self {
                    peers: tx,
                    failures: AtomicUsize::new(failures),
                },
                rx,
            )
        }
    }

    impl Connector for DuplexConnector {
        fn connect(&self) -> ConnectFuture<'_> {
            Box::pin(async move {
                let failing = self
                    .failures
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |x| x.checked_sub(1))
                    .is_ok();
                if failing {
                    return Err(std::io::ErrorKind::ConnectionRefused.into());
                }
                let (local, remote) = tokio::io::duplex(1024);
                self.peers
                    .send(remote)
                    .map_err(|_| std::io::Error::from(std::io::ErrorKind::BrokenPipe))?;
                Ok(PhysLayer::new(local))
            })
        }
    }

    fn request(address: u16) -> ModbusMessage {
        read_holding_registers_request(UnitId::new(1), address, 1).unwrap()
    }

    fn response(address: u16, value: u16) -> ModbusMessage {
        read_holding_registers_response(UnitId::new(1), address, &[value]).unwrap()
    }

    async fn connected(
        framing: Framing,
        config: ClientConfig,
    ) -> (ModbusClient, DuplexStream, mpsc::UnboundedReceiver<DuplexStream>) {
        let (connector, mut peers) = DuplexConnector::new(0);
        let client = ModbusClient::new(framing, connector, config);
        client.start().await.unwrap();
        let peer = peers.recv().await.unwrap();
        (client, peer, peers)
    }

    /// Read one MBAP framed request and return its transaction id
    async fn read_mbap(peer: &mut DuplexStream) -> u16 {
        // read holding registers: 7 byte header + 5 byte PDU
        let mut frame = [0u8; 12];
        peer.read_exact(&mut frame).await.unwrap();
        u16::from_be_bytes([frame[0], frame[1]])
    }

    async fn answer_mbap(peer: &mut DuplexStream, tx_id: u16, msg: &ModbusMessage) {
        let bytes = format_mbap(tx_id, msg, DecodeLevel::nothing()).unwrap();
        peer.write_all(&bytes).await.unwrap();
    }

    /// 259 bytes framed, so four of them overflow the 1024 byte duplex buffer
    fn large_write() -> ModbusMessage {
        write_registers_request(UnitId::new(1), 0, &[0xAAAA; 123]).unwrap()
    }

    /// Fill the transport until the next write stalls, the peer never reads
    async fn fill_transport(client: &ModbusClient) -> Vec<ResponseFuture> {
        let mut written = Vec::new();
        for _ in 0..3 {
            written.push(client.send_async(large_write()).await.unwrap());
        }
        written
    }

    #[tokio::test]
    async fn send_fails_before_start() {
        let (connector, _peers) = DuplexConnector::new(0);
        let client = ModbusClient::new(Framing::Tcp, connector, ClientConfig::default());
        assert_eq!(client.send_async(request(0)).await.err(), Some(RequestError::NoConnection));
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn responses_are_matched_by_transaction_id() {
        let (client, mut peer, _peers) = connected(Framing::Tcp, ClientConfig::default()).await;

        let first = client.send_async(request(10)).await.unwrap();
        let second = client.send_async(request(20)).await.unwrap();
        let tx_first = read_mbap(&mut peer).await;
        let tx_second = read_mbap(&mut peer).await;
        assert_ne!(tx_first, tx_second);

        // answer out of order
        answer_mbap(&mut peer, tx_second, &response(20, 2)).await;
        answer_mbap(&mut peer, tx_first, &response(10, 1)).await;

        let second = second.await.unwrap();
        assert_eq!(second.request(), &request(20));
        assert_eq!(second.response(), &response(20, 2));
        let first = first.await.unwrap();
        assert_eq!(first.request(), &request(10));
        assert_eq!(first.response(), &response(10, 1));
        assert_eq!(client.pending_requests(), 0);
    }

    #[tokio::test]
    async fn unknown_transaction_id_is_discarded() {
        let (client, mut peer, _peers) = connected(Framing::Tcp, ClientConfig::default()).await;

        let reply = client.send_async(request(1)).await.unwrap();
        let tx_id = read_mbap(&mut peer).await;
        answer_mbap(&mut peer, tx_id.wrapping_add(100), &response(1, 0xDEAD)).await;
        answer_mbap(&mut peer, tx_id, &response(1, 0xBEEF)).await;

        assert_eq!(reply.await.unwrap().response(), &response(1, 0xBEEF));
        assert_eq!(client.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn exception_response_is_a_reply() {
        let (client, mut peer, _peers) = connected(Framing::Tcp, ClientConfig::default()).await;

        let reply = client.send_async(request(1)).await.unwrap();
        let tx_id = read_mbap(&mut peer).await;
        let exception = request(1).to_exception(ExceptionCode::IllegalDataAddress);
        answer_mbap(&mut peer, tx_id, &exception).await;

        let reply = reply.await.unwrap();
        assert_eq!(reply.response().error(), Some(ExceptionCode::IllegalDataAddress));
        assert_eq!(reply.into_result(), Err(ExceptionCode::IllegalDataAddress));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_removes_entry_and_keeps_connection() {
        let config = ClientConfig::default().with_reply_timeout(Duration::from_secs(1));
        let (client, mut peer, _peers) = connected(Framing::Tcp, config).await;

        let start = Instant::now();
        assert_eq!(client.send(request(1)).await, Err(RequestError::ResponseTimeout));
        assert!(start.elapsed() >= Duration::from_secs(1));
        assert_eq!(client.pending_requests(), 0);
        assert_eq!(client.state(), ConnectionState::Connected);

        // a late reply is discarded and the next request still works
        let late = read_mbap(&mut peer).await;
        answer_mbap(&mut peer, late, &response(1, 1)).await;
        let (sent, tx_id) = tokio::join!(client.send(request(2)), async {
            let tx_id = read_mbap(&mut peer).await;
            answer_mbap(&mut peer, tx_id, &response(2, 2)).await;
            tx_id
        });
        assert_ne!(tx_id, late);
        assert_eq!(sent.unwrap().response(), &response(2, 2));
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_request_expires() {
        let config = ClientConfig::default().with_pending_ttl(Duration::from_millis(100));
        let (client, _peer, _peers) = connected(Framing::Tcp, config).await;

        let start = Instant::now();
        let reply = client.send_async(request(1)).await.unwrap();
        assert_eq!(reply.await, Err(RequestError::Expired));
        assert!(start.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn connection_loss_fails_pending_requests() {
        let config = ClientConfig::default().with_reconnect_delay(Duration::from_millis(1));
        let (client, peer, mut peers) = connected(Framing::Tcp, config).await;
        let mut states = client.subscribe();

        let reply = client.send_async(request(1)).await.unwrap();
        drop(peer);
        assert_eq!(reply.await, Err(RequestError::ConnectionClosed));

        // reconnects on its own
        let _peer = peers.recv().await.unwrap();
        states
            .wait_for(|x| *x == ConnectionState::Connected)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn stop_fails_waiting_callers_with_shutdown() {
        let (client, _peer, _peers) = connected(Framing::Tcp, ClientConfig::default()).await;

        let reply = client.send_async(request(1)).await.unwrap();
        client.stop().await;
        assert_eq!(reply.await, Err(RequestError::Shutdown));
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(client.send_async(request(1)).await.err(), Some(RequestError::NoConnection));

        // stop is idempotent
        client.stop().await;
    }

    #[tokio::test]
    async fn start_reports_first_attempt_and_is_idempotent() {
        let (connector, _peers) = DuplexConnector::new(1);
        let config = ClientConfig::default().with_auto_reconnect(false);
        let client = ModbusClient::new(Framing::Tcp, connector, config);

        let refused = Err(RequestError::Io(std::io::ErrorKind::ConnectionRefused));
        assert_eq!(client.start().await, refused);
        assert_eq!(client.start().await, refused);

        // a fresh start after stop tries again
        client.stop().await;
        assert_eq!(client.start().await, Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_delay_doubles_up_to_maximum() {
        let (connector, mut peers) = DuplexConnector::new(3);
        let config = ClientConfig::default()
            .with_reconnect_delay(Duration::from_secs(1))
            .with_max_reconnect_delay(Duration::from_secs(2));
        let client = ModbusClient::new(Framing::Tcp, connector, config);

        let start = Instant::now();
        assert!(client.start().await.is_err());
        assert_eq!(client.state(), ConnectionState::Reconnecting);

        let _peer = peers.recv().await.unwrap();
        // 1 s + 2 s + 2 s
        assert_eq!(start.elapsed().as_secs(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn min_send_delay_spaces_out_writes() {
        let config = ClientConfig::default().with_min_send_delay(Duration::from_millis(50));
        let (client, mut peer, _peers) = connected(Framing::Tcp, config).await;

        let start = Instant::now();
        let _first = client.send_async(request(1)).await.unwrap();
        let _second = client.send_async(request(2)).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(50));
        read_mbap(&mut peer).await;
        read_mbap(&mut peer).await;
    }

    #[tokio::test]
    async fn rtu_keeps_one_request_on_the_line() {
        let (client, mut peer, _peers) = connected(Framing::Rtu, ClientConfig::default()).await;

        let first = client.send_async(request(1)).await.unwrap();
        let mut frame = [0u8; 8];
        peer.read_exact(&mut frame).await.unwrap();
        assert_eq!(frame, format_rtu(&request(1), DecodeLevel::nothing()).unwrap().as_slice());

        let second = tokio::spawn({
            let client = client.clone();
            async move { client.send_async(request(2)).await.unwrap().await }
        });
        tokio::task::yield_now().await;
        assert_eq!(client.pending_requests(), 1);

        let bytes = format_rtu(&response(1, 0x1234), DecodeLevel::nothing()).unwrap();
        peer.write_all(&bytes).await.unwrap();
        assert_eq!(first.await.unwrap().response(), &response(1, 0x1234));

        // only now is the second request written
        peer.read_exact(&mut frame).await.unwrap();
        assert_eq!(frame, format_rtu(&request(2), DecodeLevel::nothing()).unwrap().as_slice());
        let bytes = format_rtu(&response(2, 0x5678), DecodeLevel::nothing()).unwrap();
        peer.write_all(&bytes).await.unwrap();
        assert_eq!(second.await.unwrap().unwrap().response(), &response(2, 0x5678));
    }

    #[tokio::test]
    async fn rtu_response_with_bad_crc_is_delivered_and_flagged() {
        let (client, mut peer, _peers) = connected(Framing::Rtu, ClientConfig::default()).await;

        let reply = client.send_async(request(1)).await.unwrap();
        let mut frame = [0u8; 8];
        peer.read_exact(&mut frame).await.unwrap();

        let mut bytes = format_rtu(&response(1, 0x1234), DecodeLevel::nothing()).unwrap();
        if let Some(last) = bytes.last_mut() {
            *last ^= 0xFF;
        }
        peer.write_all(&bytes).await.unwrap();

        let reply = reply.await.unwrap();
        assert_eq!(reply.response(), &response(1, 0x1234));
        assert!(!reply.crc_valid());
        assert!(matches!(reply.validate(), Err(InvalidRequest::CrcMismatch { .. })));
        assert_eq!(client.state(), ConnectionState::Connected);
        assert_eq!(client.pending_requests(), 0);
    }

    #[tokio::test]
    async fn tcp_reply_has_valid_crc() {
        let (client, mut peer, _peers) = connected(Framing::Tcp, ClientConfig::default()).await;

        let reply = client.send_async(request(1)).await.unwrap();
        let tx_id = read_mbap(&mut peer).await;
        answer_mbap(&mut peer, tx_id, &response(1, 7)).await;

        let reply = reply.await.unwrap();
        assert!(reply.crc_valid());
        assert_eq!(reply.validate(), Ok(()));
    }

    #[tokio::test]
    async fn undecodable_response_is_dropped_and_request_stays_pending() {
        let (client, mut peer, _peers) = connected(Framing::Tcp, ClientConfig::default()).await;

        let reply = client.send_async(request(1)).await.unwrap();
        let tx_id = read_mbap(&mut peer).await;

        // valid MBAP header, but a byte count of 5 for a one register read
        let [hi, lo] = tx_id.to_be_bytes();
        let garbled = [hi, lo, 0x00, 0x00, 0x00, 0x08, 0x01, 0x03, 0x05, 0x00, 0x01, 0x02, 0x03, 0x04];
        peer.write_all(&garbled).await.unwrap();
        answer_mbap(&mut peer, tx_id, &response(1, 0xBEEF)).await;

        assert_eq!(reply.await.unwrap().response(), &response(1, 0xBEEF));
        assert_eq!(client.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn stop_fails_caller_waiting_for_the_rtu_line() {
        let (client, mut peer, _peers) = connected(Framing::Rtu, ClientConfig::default()).await;

        let first = client.send_async(request(1)).await.unwrap();
        let mut frame = [0u8; 8];
        peer.read_exact(&mut frame).await.unwrap();

        let second = tokio::spawn({
            let client = client.clone();
            async move { client.send_async(request(2)).await.err() }
        });
        tokio::task::yield_now().await;

        tokio::time::timeout(Duration::from_secs(2), client.stop())
            .await
            .unwrap();
        assert_eq!(second.await.unwrap(), Some(RequestError::Shutdown));
        assert_eq!(first.await, Err(RequestError::Shutdown));
    }

    #[tokio::test]
    async fn stop_does_not_wait_for_a_stalled_write() {
        let (client, _peer, _peers) = connected(Framing::Tcp, ClientConfig::default()).await;
        let written = fill_transport(&client).await;

        let stalled = tokio::spawn({
            let client = client.clone();
            async move { client.send_async(large_write()).await.err() }
        });
        let queued = tokio::spawn({
            let client = client.clone();
            async move { client.send_async(request(1)).await.err() }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!stalled.is_finished());

        tokio::time::timeout(Duration::from_secs(2), client.stop())
            .await
            .unwrap();
        assert_eq!(stalled.await.unwrap(), Some(RequestError::Shutdown));
        assert_eq!(queued.await.unwrap(), Some(RequestError::Shutdown));
        for reply in written {
            assert_eq!(reply.await, Err(RequestError::Shutdown));
        }
        assert_eq!(client.pending_requests(), 0);
    }

    #[tokio::test]
    async fn send_timeout_covers_a_stalled_write() {
        let config = ClientConfig::default().with_reply_timeout(Duration::from_millis(200));
        let (client, _peer, _peers) = connected(Framing::Tcp, config).await;
        let _written = fill_transport(&client).await;

        let sent = tokio::time::timeout(Duration::from_secs(2), client.send(large_write())).await;
        assert_eq!(sent, Ok(Err(RequestError::ResponseTimeout)));
        assert_eq!(client.state(), ConnectionState::Connected);

        tokio::time::timeout(Duration::from_secs(2), client.stop())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn dropped_caller_does_not_leave_a_pending_entry() {
        let (client, mut peer, _peers) = connected(Framing::Tcp, ClientConfig::default()).await;
        let _written = fill_transport(&client).await;

        // gives up while its write is stalled
        let abandoned = tokio::time::timeout(Duration::from_millis(50), client.send_async(large_write())).await;
        assert!(abandoned.is_err());

        // drain the buffer so the stalled write completes
        let mut sink = vec![0u8; 4 * 259];
        peer.read_exact(&mut sink).await.unwrap();

        let (reply, tx_id) = tokio::join!(client.send_async(request(1)), read_mbap(&mut peer));
        assert_eq!(client.pending_requests(), 4);
        answer_mbap(&mut peer, tx_id, &response(1, 1)).await;
        assert_eq!(reply.unwrap().await.unwrap().response(), &response(1, 1));
    }
}
