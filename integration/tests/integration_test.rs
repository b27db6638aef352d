//! End-to-end tests between the TCP client and server over loopback sockets

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::AsyncReadExt;

use modbus_engine::*;

const USER_FUNCTION: u8 = 0x41;

struct Device {
    coils: Vec<bool>,
    registers: Vec<u16>,
}

impl Device {
    fn new() -> Self {
        Self {
            coils: vec![false; 10],
            registers: (0..10).collect(),
        }
    }
}

fn range<T: Copy>(values: &[T], address: u16, count: u16) -> Option<Vec<T>> {
    let start = address as usize;
    values.get(start..start + count as usize).map(|x| x.to_vec())
}

fn store<T: Copy>(values: &mut [T], address: u16, new: &[T]) -> bool {
    let start = address as usize;
    match values.get_mut(start..start + new.len()) {
        Some(slot) => {
            slot.copy_from_slice(new);
            true
        }
        None => false,
    }
}

fn process(device: &mut Device, request: &ModbusMessage) -> Result<ModbusMessage, ExceptionCode> {
    let unit = request.unit_id();
    let illegal_address = ExceptionCode::IllegalDataAddress;
    let illegal_value = ExceptionCode::IllegalDataValue;

    match request.function() {
        FunctionCode::ReadCoils => {
            let bits = request.bits().ok_or(illegal_value)?;
            let values = range(&device.coils, bits.address(), bits.count()).ok_or(illegal_address)?;
            read_coils_response(unit, bits.address(), &values).map_err(|_| illegal_value)
        }
        FunctionCode::WriteCoils => {
            let bits = request.bits().ok_or(illegal_value)?;
            let values = bits.bits().ok_or(illegal_value)?.to_vec();
            if !store(&mut device.coils, bits.address(), &values) {
                return Err(illegal_address);
            }
            write_coils_response(unit, bits.address(), bits.count()).map_err(|_| illegal_value)
        }
        FunctionCode::ReadHoldingRegisters => {
            let regs = request.registers().ok_or(illegal_value)?;
            let values =
                range(&device.registers, regs.address(), regs.count()).ok_or(illegal_address)?;
            read_holding_registers_response(unit, regs.address(), &values)
                .map_err(|_| illegal_value)
        }
        FunctionCode::WriteHoldingRegisters => {
            let regs = request.registers().ok_or(illegal_value)?;
            let values = regs.values().ok_or(illegal_value)?;
            if !store(&mut device.registers, regs.address(), &values) {
                return Err(illegal_address);
            }
            write_registers_response(unit, regs.address(), regs.count()).map_err(|_| illegal_value)
        }
        FunctionCode::MaskWriteHoldingRegister => {
            let regs = request.registers().ok_or(illegal_value)?;
            let (and_mask, or_mask) = regs.masks().ok_or(illegal_value)?;
            let current = device
                .registers
                .get_mut(regs.address() as usize)
                .ok_or(illegal_address)?;
            *current = (*current & and_mask) | (or_mask & !and_mask);
            Ok(mask_write_register_response(unit, regs.address(), and_mask, or_mask))
        }
        FunctionCode::ReadWriteHoldingRegisters => {
            let regs = request.registers().ok_or(illegal_value)?;
            let write_address = regs.write_address().ok_or(illegal_value)?;
            let values = regs.values().ok_or(illegal_value)?;
            if !store(&mut device.registers, write_address, &values) {
                return Err(illegal_address);
            }
            let read =
                range(&device.registers, regs.address(), regs.count()).ok_or(illegal_address)?;
            read_write_registers_response(unit, regs.address(), &read).map_err(|_| illegal_value)
        }
        FunctionCode::Other(USER_FUNCTION) => {
            let mut data = request.raw().ok_or(illegal_value)?.to_vec();
            data.reverse();
            Ok(raw_message(unit, request.function(), data))
        }
        _ => Err(ExceptionCode::IllegalFunction),
    }
}

fn device_handler() -> impl Fn(ModbusMessage, ReplySink) + Send + Sync + 'static {
    let device = Mutex::new(Device::new());
    move |request: ModbusMessage, reply: ReplySink| {
        let result = match device.lock() {
            Ok(mut device) => process(&mut device, &request),
            Err(_) => Err(ExceptionCode::ServerDeviceFailure),
        };
        match result {
            Ok(response) => reply.reply(response),
            Err(code) => reply.exception(code),
        }
    }
}

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_test_writer()
        .try_init();
}

async fn spawn_server(config: ServerConfig) -> (ServerHandle, SocketAddr) {
    init_logging();
    let server = spawn_tcp_server("127.0.0.1:0".parse().unwrap(), device_handler(), config)
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    (server, addr)
}

fn client_config() -> ClientConfig {
    ClientConfig::default()
        .with_reply_timeout(Duration::from_secs(5))
        .with_auto_reconnect(false)
}

async fn connected_client(addr: SocketAddr) -> ModbusClient {
    let client = ModbusClient::tcp(addr, client_config());
    client.start().await.unwrap();
    client
}

async fn response(client: &ModbusClient, request: ModbusMessage) -> ModbusMessage {
    client.send(request).await.unwrap().into_result().unwrap()
}

#[tokio::test]
async fn reads_and_writes_round_trip_through_server() {
    let (_server, addr) = spawn_server(ServerConfig::default()).await;
    let client = connected_client(addr).await;
    let unit = UnitId::new(1);

    let written = response(
        &client,
        write_coils_request(unit, 2, &[true, false, true]).unwrap(),
    )
    .await;
    assert_eq!(written, write_coils_response(unit, 2, 3).unwrap());

    let coils = response(&client, read_coils_request(unit, 1, 4).unwrap()).await;
    assert_eq!(
        coils.bits().and_then(|x| x.bits()).map(|x| x.to_vec()),
        Some(vec![false, true, false, true])
    );

    response(
        &client,
        write_registers_request(unit, 0, &[0xCAFE, 0xBEEF]).unwrap(),
    )
    .await;
    let registers = response(&client, read_holding_registers_request(unit, 0, 3).unwrap()).await;
    assert_eq!(
        registers.registers().and_then(|x| x.values()),
        Some(vec![0xCAFE, 0xBEEF, 2])
    );

    let masked = response(&client, mask_write_register_request(unit, 4, 0x00F2, 0x0025)).await;
    assert_eq!(masked, mask_write_register_response(unit, 4, 0x00F2, 0x0025));
    let register = response(&client, read_holding_registers_request(unit, 4, 1).unwrap()).await;
    // (0x0004 & 0x00F2) | (0x0025 & !0x00F2)
    assert_eq!(register.registers().and_then(|x| x.values()), Some(vec![0x0005]));

    let exchanged = response(
        &client,
        read_write_registers_request(unit, 5, 2, 6, &[0x1111]).unwrap(),
    )
    .await;
    assert_eq!(
        exchanged.registers().and_then(|x| x.values()),
        Some(vec![5, 0x1111])
    );

    client.stop().await;
}

#[tokio::test]
async fn user_function_travels_as_raw_bytes() {
    let (_server, addr) = spawn_server(ServerConfig::default()).await;
    let client = connected_client(addr).await;

    let request = raw_message(
        UnitId::new(7),
        FunctionCode::Other(USER_FUNCTION),
        vec![0x01, 0x02, 0x03],
    );
    let reply = response(&client, request).await;
    assert_eq!(reply.raw(), Some([0x03, 0x02, 0x01].as_slice()));
}

#[tokio::test]
async fn server_exceptions_are_delivered_as_replies() {
    let (_server, addr) = spawn_server(ServerConfig::default()).await;
    let client = connected_client(addr).await;

    let reply = client
        .send(read_holding_registers_request(UnitId::new(1), 8, 5).unwrap())
        .await
        .unwrap();
    assert_eq!(
        reply.response().error(),
        Some(ExceptionCode::IllegalDataAddress)
    );

    let reply = client
        .send(read_fifo_queue_request(UnitId::new(1), 0))
        .await
        .unwrap();
    assert_eq!(reply.into_result(), Err(ExceptionCode::IllegalFunction));
}

#[tokio::test]
async fn concurrent_requests_are_correlated() {
    let (_server, addr) = spawn_server(ServerConfig::default()).await;
    let client = connected_client(addr).await;

    let tasks: Vec<_> = (0..10u16)
        .map(|address| {
            let client = client.clone();
            tokio::spawn(async move {
                let request = read_holding_registers_request(UnitId::new(1), address, 1).unwrap();
                let reply = client.send(request.clone()).await.unwrap();
                assert_eq!(reply.request(), &request);
                reply.into_result().unwrap().registers().and_then(|x| x.values())
            })
        })
        .collect();

    for (address, task) in tasks.into_iter().enumerate() {
        assert_eq!(task.await.unwrap(), Some(vec![address as u16]));
    }
    assert_eq!(client.pending_requests(), 0);
}

#[tokio::test]
async fn oldest_session_is_closed_when_full() {
    let (_server, addr) = spawn_server(ServerConfig::default().with_max_sessions(1)).await;

    let first = connected_client(addr).await;
    let mut states = first.subscribe();
    // the first session is served
    response(&first, read_coils_request(UnitId::new(1), 0, 1).unwrap()).await;

    let second = connected_client(addr).await;
    states
        .wait_for(|x| *x != ConnectionState::Connected)
        .await
        .unwrap();
    response(&second, read_coils_request(UnitId::new(1), 0, 1).unwrap()).await;
}

struct Gatekeeper {
    accept: bool,
    connects: Arc<AtomicUsize>,
    disconnects: Arc<AtomicUsize>,
}

impl ConnectionListener for Gatekeeper {
    fn on_connect(&self, _addr: SocketAddr) -> bool {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.accept
    }

    fn on_disconnect(&self, _addr: SocketAddr) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}

async fn spawn_guarded(accept: bool) -> (ServerHandle, Arc<AtomicUsize>, Arc<AtomicUsize>) {
    init_logging();
    let connects = Arc::new(AtomicUsize::new(0));
    let disconnects = Arc::new(AtomicUsize::new(0));
    let listener = Gatekeeper {
        accept,
        connects: connects.clone(),
        disconnects: disconnects.clone(),
    };
    let server = spawn_tcp_server_with_listener(
        "127.0.0.1:0".parse().unwrap(),
        device_handler(),
        listener,
        ServerConfig::default(),
    )
    .await
    .unwrap();
    (server, connects, disconnects)
}

#[tokio::test]
async fn listener_can_veto_connections() {
    let (server, connects, disconnects) = spawn_guarded(false).await;
    let addr = server.local_addr().unwrap();

    let mut socket = tokio::net::TcpStream::connect(addr).await.unwrap();
    let mut buffer = [0u8; 1];
    // closed without a session
    assert_eq!(socket.read(&mut buffer).await.unwrap(), 0);
    assert_eq!(connects.load(Ordering::SeqCst), 1);
    assert_eq!(disconnects.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn listener_sees_session_end() {
    let (server, connects, disconnects) = spawn_guarded(true).await;
    let addr = server.local_addr().unwrap();

    let client = connected_client(addr).await;
    response(&client, read_coils_request(UnitId::new(1), 0, 1).unwrap()).await;
    client.stop().await;

    tokio::time::timeout(Duration::from_secs(5), async {
        while disconnects.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(connects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn dropping_server_disconnects_clients() {
    let (server, addr) = spawn_server(ServerConfig::default()).await;
    let client = connected_client(addr).await;
    let mut states = client.subscribe();

    drop(server);
    states
        .wait_for(|x| *x == ConnectionState::Disconnected)
        .await
        .unwrap();
    assert_eq!(
        client
            .send(read_coils_request(UnitId::new(1), 0, 1).unwrap())
            .await,
        Err(RequestError::NoConnection)
    );
}
