//! An async implementation of the [Modbus](http://modbus.org/) protocol
//! using [Tokio](https://docs.rs/tokio) and Rust's `async/await` syntax.
//!
//! # Features
//!
//! * Panic-free parsing and encoding of every public Modbus function
//! * Modbus/TCP (MBAP) and Modbus/RTU (CRC16) framing over any async byte stream
//! * Client with transaction correlation, reply timeouts, pending request expiry
//!   and automatic reconnection
//! * Server dispatching decoded requests to a user handler
//! * Opt-in protocol tracing at the PDU, ADU and physical layers
//!
//! # Supported modes
//!
//! * TCP client and server
//! * RTU client and server over serial ports (`serial` feature, on by default)
//!
//! # Example
//!
//! A client application that reads some holding registers
//!
//! ```no_run
//! use modbus_engine::*;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = ModbusClient::tcp("127.0.0.1:502".parse()?, ClientConfig::default());
//!     client.start().await?;
//!
//!     let request = read_holding_registers_request(UnitId::new(1), 0, 5)?;
//!     let reply = client.send(request).await?;
//!     match reply.into_result() {
//!         Ok(response) => println!("{:?}", response.registers().and_then(|x| x.values())),
//!         Err(code) => println!("exception: {}", code),
//!     }
//!
//!     client.stop().await;
//!     Ok(())
//! }
//! ```

pub use crate::client::{
    ClientConfig, ConnectionState, Framing, ModbusClient, Reply, ResponseFuture,
};
pub use crate::common::bytes;
pub use crate::common::crc::compute_crc;
pub use crate::common::function::{BlockType, FunctionCode};
pub use crate::common::phys::{ConnectFuture, Connector, LineTiming, PhysLayer, PhysStream};
pub use crate::decode::*;
pub use crate::error::*;
pub use crate::exception::ExceptionCode;
pub use crate::pdu::*;
pub use crate::retry::*;
pub use crate::serial::frame::RtuFrame;
#[cfg(feature = "serial")]
pub use crate::serial::SerialConnector;
pub use crate::serial::{DataBits, FlowControl, Parity, Rs485Settings, SerialSettings, StopBits};
pub use crate::server::*;
pub use crate::tcp::client::TcpConnector;
pub use crate::tcp::frame::TcpFrame;
pub use crate::types::*;

/// Public constant values related to the Modbus specification
pub mod constants;

// internal modules
mod client;
mod common;
mod decode;
mod error;
mod exception;
mod pdu;
mod retry;
mod serial;
mod server;
mod tcp;
mod types;
