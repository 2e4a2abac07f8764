//! The hot-restart RPC wire format.
//!
//! Every message begins with a `u64` length (of the whole message) and a
//! `u64` type, little endian; the remainder is type-specific and fixed
//! size. Listen-socket fds travel as `SCM_RIGHTS` ancillary data, never in
//! the message body.

/// Upper bound on any encoded message; the receive buffer is this large.
pub const MAX_RPC_SIZE: usize = 4096;

/// Fixed buffer for a listener address, sized to a URL, NUL terminated.
pub const ADDRESS_BUF_SIZE: usize = 256;

const HEADER_SIZE: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcMessage {
    DrainListenersRequest,
    GetListenSocketRequest { address: String },
    /// `fd_present` tags whether an fd rides in the ancillary data; absence
    /// means the parent has no listener at the requested address.
    GetListenSocketReply { fd_present: bool },
    ShutdownAdminRequest,
    ShutdownAdminReply { original_start_time: u64 },
    TerminateRequest,
    UnknownRequestReply,
    GetStatsRequest,
    GetStatsReply {
        memory_allocated: u64,
        num_connections: u64,
    },
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RpcError {
    #[error("rpc message truncated: declared {declared} bytes, received {received}")]
    Truncated { declared: u64, received: usize },
    #[error("rpc message length {0} out of range")]
    BadLength(u64),
    #[error("unknown rpc message type {0}")]
    UnknownType(u64),
    #[error("rpc address field is not valid UTF-8")]
    BadAddress,
}

impl RpcMessage {
    fn type_id(&self) -> u64 {
        match self {
            RpcMessage::DrainListenersRequest => 1,
            RpcMessage::GetListenSocketRequest { .. } => 2,
            RpcMessage::GetListenSocketReply { .. } => 3,
            RpcMessage::ShutdownAdminRequest => 4,
            RpcMessage::ShutdownAdminReply { .. } => 5,
            RpcMessage::TerminateRequest => 6,
            RpcMessage::UnknownRequestReply => 7,
            RpcMessage::GetStatsRequest => 8,
            RpcMessage::GetStatsReply { .. } => 9,
        }
    }

    /// Encode into `buf`, returning the number of bytes written.
    pub fn encode(&self, buf: &mut [u8; MAX_RPC_SIZE]) -> usize {
        let body_len = match self {
            RpcMessage::GetListenSocketRequest { .. } => ADDRESS_BUF_SIZE,
            RpcMessage::GetListenSocketReply { .. } => 8,
            RpcMessage::ShutdownAdminReply { .. } => 8,
            RpcMessage::GetStatsReply { .. } => 16,
            _ => 0,
        };
        let total = HEADER_SIZE + body_len;

        buf[0..8].copy_from_slice(&(total as u64).to_le_bytes());
        buf[8..16].copy_from_slice(&self.type_id().to_le_bytes());
        buf[HEADER_SIZE..total].fill(0);

        match self {
            RpcMessage::GetListenSocketRequest { address } => {
                let bytes = address.as_bytes();
                // Leave at least the terminating NUL.
                let len = bytes.len().min(ADDRESS_BUF_SIZE - 1);
                buf[HEADER_SIZE..HEADER_SIZE + len].copy_from_slice(&bytes[..len]);
            }
            RpcMessage::GetListenSocketReply { fd_present } => {
                buf[HEADER_SIZE..HEADER_SIZE + 8]
                    .copy_from_slice(&(*fd_present as u64).to_le_bytes());
            }
            RpcMessage::ShutdownAdminReply {
                original_start_time,
            } => {
                buf[HEADER_SIZE..HEADER_SIZE + 8]
                    .copy_from_slice(&original_start_time.to_le_bytes());
            }
            RpcMessage::GetStatsReply {
                memory_allocated,
                num_connections,
            } => {
                buf[HEADER_SIZE..HEADER_SIZE + 8].copy_from_slice(&memory_allocated.to_le_bytes());
                buf[HEADER_SIZE + 8..HEADER_SIZE + 16]
                    .copy_from_slice(&num_connections.to_le_bytes());
            }
            _ => {}
        }

        total
    }

    /// Decode a received datagram. The declared length must match the
    /// received size exactly.
    pub fn decode(buf: &[u8]) -> Result<RpcMessage, RpcError> {
        if buf.len() < HEADER_SIZE {
            return Err(RpcError::Truncated {
                declared: HEADER_SIZE as u64,
                received: buf.len(),
            });
        }
        let length = u64::from_le_bytes(buf[0..8].try_into().unwrap());
        let type_id = u64::from_le_bytes(buf[8..16].try_into().unwrap());

        if length > MAX_RPC_SIZE as u64 || length < HEADER_SIZE as u64 {
            return Err(RpcError::BadLength(length));
        }
        if length != buf.len() as u64 {
            return Err(RpcError::Truncated {
                declared: length,
                received: buf.len(),
            });
        }

        let body = &buf[HEADER_SIZE..];
        let msg = match type_id {
            1 => RpcMessage::DrainListenersRequest,
            2 => {
                if body.len() != ADDRESS_BUF_SIZE {
                    return Err(RpcError::BadLength(length));
                }
                let nul = body.iter().position(|&b| b == 0).unwrap_or(body.len());
                let address = std::str::from_utf8(&body[..nul])
                    .map_err(|_| RpcError::BadAddress)?
                    .to_string();
                RpcMessage::GetListenSocketRequest { address }
            }
            3 => {
                if body.len() != 8 {
                    return Err(RpcError::BadLength(length));
                }
                let tag = u64::from_le_bytes(body[0..8].try_into().unwrap());
                RpcMessage::GetListenSocketReply {
                    fd_present: tag != 0,
                }
            }
            4 => RpcMessage::ShutdownAdminRequest,
            5 => {
                if body.len() != 8 {
                    return Err(RpcError::BadLength(length));
                }
                RpcMessage::ShutdownAdminReply {
                    original_start_time: u64::from_le_bytes(body[0..8].try_into().unwrap()),
                }
            }
            6 => RpcMessage::TerminateRequest,
            7 => RpcMessage::UnknownRequestReply,
            8 => RpcMessage::GetStatsRequest,
            9 => {
                if body.len() != 16 {
                    return Err(RpcError::BadLength(length));
                }
                RpcMessage::GetStatsReply {
                    memory_allocated: u64::from_le_bytes(body[0..8].try_into().unwrap()),
                    num_connections: u64::from_le_bytes(body[8..16].try_into().unwrap()),
                }
            }
            other => return Err(RpcError::UnknownType(other)),
        };

        Ok(msg)
    }
}
