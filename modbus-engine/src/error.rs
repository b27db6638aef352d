/// Top level error type for requests made by a client
///
/// Exception responses from a server are *not* represented here: they are
/// delivered as normal replies whose message carries an [`ExceptionCode`].
///
/// [`ExceptionCode`]: crate::ExceptionCode
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    /// An I/O error occurred on the underlying transport
    #[error("i/o error: {0}")]
    Io(std::io::ErrorKind),
    /// The client is not connected to the server
    #[error("no connection exists to the Modbus server")]
    NoConnection,
    /// No reply was received within the reply timeout
    #[error("timeout occurred before receiving a response from the server")]
    ResponseTimeout,
    /// The request outlived the pending message TTL without receiving a reply
    #[error("request expired without a reply")]
    Expired,
    /// The connection was closed while the request was outstanding
    #[error("connection closed before a reply was received")]
    ConnectionClosed,
    /// The client was stopped or the task processing requests is no longer running
    #[error("the client has been stopped")]
    Shutdown,
    /// The request could not be constructed or validated
    #[error("invalid request: {0}")]
    BadRequest(#[from] InvalidRequest),
    /// A frame could not be parsed off the stream
    #[error("bad frame: {0}")]
    BadFrame(#[from] FrameParseError),
    /// A response PDU could not be parsed
    #[error("bad response: {0}")]
    BadResponse(#[from] AduParseError),
    /// An internal error that indicates a bug in the library
    #[error("internal error: {0}")]
    Internal(#[from] InternalError),
}

/// Validation errors raised synchronously when constructing or validating messages
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidRequest {
    /// Request contains a count of zero
    #[error("request contains a count of zero")]
    CountOfZero,
    /// Start and count would overflow the u16 address space
    #[error("start == {0} and count == {1} would overflow the representation of u16")]
    AddressOverflow(u16, u16),
    /// Count exceeds the maximum allowed for the function
    #[error("the request count of {0} exceeds maximum allowed count of {1} for this type")]
    CountTooLargeForType(u16, u16),
    /// Register data must contain an even number of bytes
    #[error("register data has an odd length of {0} bytes")]
    OddRegisterData(usize),
    /// The number of values doesn't fit in a u16 count
    #[error("the number of values ({0}) exceeds the maximum value of u16")]
    CountTooBigForU16(usize),
    /// RTU frame CRC does not match the contents
    #[error("received CRC {received:#06X} does not match the computed CRC {expected:#06X}")]
    CrcMismatch {
        /// CRC carried by the frame
        received: u16,
        /// CRC computed over the unit id and PDU
        expected: u16,
    },
}

/// Errors that occur while parsing a frame off a stream (TCP or serial)
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameParseError {
    /// Received TCP frame with the length field set to zero
    #[error("received TCP frame with the length field set to zero")]
    MbapLengthZero,
    /// Received TCP frame with length that exceeds max allowed size
    #[error("received TCP frame with length ({0}) that exceeds max allowed size ({1})")]
    MbapLengthTooBig(usize, usize),
    /// Received TCP frame within non-Modbus protocol id
    #[error("received TCP frame with non-Modbus protocol id: {0}")]
    UnknownProtocolId(u16),
    /// Byte that can never be a request function code
    #[error("byte {0:#04X} is not a valid request function code")]
    InvalidFunctionCode(u8),
}

/// Errors that occur while parsing the body of a PDU
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AduParseError {
    /// PDU is too short to be valid
    #[error("PDU is too short to be valid")]
    InsufficientBytes,
    /// Byte count doesn't match what is expected based on the request
    #[error("byte count ({1}) doesn't match what is expected based on request ({0})")]
    RequestByteCountMismatch(usize, usize),
    /// Byte count doesn't match the actual number of bytes present
    #[error("byte count ({0}) doesn't match the actual number of bytes remaining ({1})")]
    InsufficientBytesForByteCount(usize, usize),
    /// PDU contains extra trailing bytes
    #[error("PDU contains {0} extra trailing bytes")]
    TrailingBytes(usize),
    /// Bad value for the coil state
    #[error("received coil state with unspecified value: {0:#06X}")]
    UnknownCoilState(u16),
    /// Values inside the PDU violate request limits
    #[error("PDU carries an invalid request: {0}")]
    InvalidRequest(InvalidRequest),
    /// Response is not an echo of the write request
    #[error("response is not an echo of the write request")]
    ReplyEchoMismatch,
    /// Response function code doesn't match the request
    #[error("received response with function code {0:#04X} for a request with function code {1:#04X}")]
    UnknownResponseFunction(u8, u8),
}

/// Errors that should only occur if there is a logic error in the library
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InternalError {
    /// Insufficient space for write operation
    #[error("insufficient space for write operation")]
    InsufficientWriteSpace,
    /// The calculated ADU size exceeds the Modbus maximum
    #[error("ADU length of {0} exceeds the maximum allowed length")]
    AduTooBig(usize),
    /// Byte count would exceed maximum allowed size in the ADU of u8
    #[error("byte count would exceed maximum allowed size of u8: {0}")]
    BadByteCount(usize),
    /// Attempted to read more bytes than present
    #[error("attempted to read {0} bytes with only {1} remaining")]
    InsufficientBytesForRead(usize, usize),
}

/// Marker type returned when the task processing requests is shut down
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct Shutdown;

impl From<std::io::Error> for RequestError {
    fn from(err: std::io::Error) -> Self {
        RequestError::Io(err.kind())
    }
}

impl From<Shutdown> for RequestError {
    fn from(_: Shutdown) -> Self {
        RequestError::Shutdown
    }
}

impl From<InvalidRequest> for AduParseError {
    fn from(err: InvalidRequest) -> Self {
        AduParseError::InvalidRequest(err)
    }
}

impl From<scursor::ReadError> for AduParseError {
    fn from(_: scursor::ReadError) -> Self {
        AduParseError::InsufficientBytes
    }
}

impl From<scursor::ReadError> for RequestError {
    fn from(err: scursor::ReadError) -> Self {
        RequestError::BadResponse(err.into())
    }
}

impl From<scursor::WriteError> for InternalError {
    fn from(_: scursor::WriteError) -> Self {
        InternalError::InsufficientWriteSpace
    }
}

impl From<scursor::WriteError> for RequestError {
    fn from(err: scursor::WriteError) -> Self {
        RequestError::Internal(err.into())
    }
}
