/// Default TCP port for Modbus/TCP
pub const DEFAULT_TCP_PORT: u16 = 502;

/// Values of a single coil write
pub mod coil {
    /// Coil on
    pub const ON: u16 = 0xFF00;
    /// Coil off
    pub const OFF: u16 = 0x0000;
}

/// Limits of request sizes
pub mod limits {
    /// Maximum count allowed in a read coils/discrete inputs request
    pub const MAX_READ_COILS_COUNT: u16 = 0x07D0;
    /// Maximum count allowed in a read holding/input registers request
    pub const MAX_READ_REGISTERS_COUNT: u16 = 0x007D;
    /// Maximum count allowed in a `write multiple coils` request
    pub const MAX_WRITE_COILS_COUNT: u16 = 0x07B0;
    /// Maximum count allowed in a `write multiple registers` request
    /// and in the write half of a `read/write multiple registers` request
    pub const MAX_WRITE_REGISTERS_COUNT: u16 = 0x0079;
    /// Maximum number of registers a FIFO queue may return
    pub const MAX_FIFO_COUNT: u16 = 0x0031;
}

/// Wire values of the standard exception codes
pub mod exceptions {
    /// Function not supported
    pub const ILLEGAL_FUNCTION: u8 = 0x01;
    /// Address out of range
    pub const ILLEGAL_DATA_ADDRESS: u8 = 0x02;
    /// Request field rejected
    pub const ILLEGAL_DATA_VALUE: u8 = 0x03;
    /// Server failed while processing
    pub const SERVER_DEVICE_FAILURE: u8 = 0x04;
    /// Accepted, completes later
    pub const ACKNOWLEDGE: u8 = 0x05;
    /// Busy, retry later
    pub const SERVER_DEVICE_BUSY: u8 = 0x06;
    /// File record consistency failure
    pub const MEMORY_PARITY_ERROR: u8 = 0x08;
    /// Gateway could not route the request
    pub const GATEWAY_PATH_UNAVAILABLE: u8 = 0x0A;
    /// Gateway target did not answer
    pub const GATEWAY_TARGET_DEVICE_FAILED_TO_RESPOND: u8 = 0x0B;
}

/// Client defaults
pub mod defaults {
    use std::time::Duration;

    /// How long `send` waits for a reply
    pub const REPLY_TIMEOUT: Duration = Duration::from_secs(60);
    /// Delay between reconnect attempts
    pub const AUTO_RECONNECT_DELAY: Duration = Duration::from_secs(30);
    /// Age after which an unanswered request is discarded
    pub const PENDING_MESSAGE_TTL: Duration = Duration::from_secs(120);
    /// Maximum number of concurrent TCP server sessions
    pub const MAX_SESSIONS: usize = 100;
}
