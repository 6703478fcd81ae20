//! Wire container for encoded payloads.
//!
//! Container format: `[length:4][checksum:4][payload:N]`
//!
//! - **length**: Total container size including the header (little-endian)
//! - **checksum**: CRC32C of the payload for integrity verification
//! - **payload**: Codec-encoded frame, or a data-plane preamble
//!
//! The message plane carries one container per frame. The data plane
//! carries one container holding the transfer preamble, followed by the
//! announced number of raw bytes, followed by one acknowledgement
//! container flowing the other way.

/// Header size: 4 (length) + 4 (checksum) = 8 bytes.
pub const CONTAINER_HEADER_SIZE: usize = 8;

/// Maximum payload size (1 MiB).
///
/// Containers larger than this are rejected to bound memory per
/// connection. Bulk data bypasses this limit by streaming raw bytes after
/// the preamble container.
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

/// Wire container error types.
#[derive(Debug, Clone, thiserror::Error)]
pub enum WireError {
    /// Not enough data to parse the container.
    #[error("insufficient data: need {needed} bytes, have {have}")]
    InsufficientData {
        /// Minimum bytes required to parse.
        needed: usize,
        /// Actual bytes available.
        have: usize,
    },

    /// Checksum verification failed; the payload was corrupted in transit.
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Expected checksum from the header.
        expected: u32,
        /// Computed checksum over the payload.
        actual: u32,
    },

    /// Payload exceeds the maximum allowed size.
    #[error("payload too large: {size} bytes (max {MAX_PAYLOAD_SIZE})")]
    PayloadTooLarge {
        /// Actual payload size in bytes.
        size: usize,
    },

    /// Length field has an invalid value.
    #[error("invalid container length: {length}")]
    InvalidLength {
        /// The invalid length value from the header.
        length: u32,
    },
}

/// Wrap a payload in a wire container.
///
/// # Errors
///
/// Returns `PayloadTooLarge` when the payload exceeds [`MAX_PAYLOAD_SIZE`].
pub fn encode_container(payload: &[u8]) -> Result<Vec<u8>, WireError> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(WireError::PayloadTooLarge {
            size: payload.len(),
        });
    }

    let total = CONTAINER_HEADER_SIZE + payload.len();
    let mut data = Vec::with_capacity(total);
    data.extend_from_slice(&(total as u32).to_le_bytes());
    data.extend_from_slice(&crc32c::crc32c(payload).to_le_bytes());
    data.extend_from_slice(payload);
    Ok(data)
}

/// Try to parse one container from a buffer that may hold partial data.
///
/// # Returns
///
/// - `Ok(Some((payload, consumed)))` when a complete container was parsed
/// - `Ok(None)` when more data is needed (not an error)
/// - `Err` when the data is malformed; the connection should be torn down
pub fn try_decode_container(data: &[u8]) -> Result<Option<(Vec<u8>, usize)>, WireError> {
    if data.len() < CONTAINER_HEADER_SIZE {
        return Ok(None);
    }

    let length = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    if (length as usize) < CONTAINER_HEADER_SIZE
        || (length as usize) > CONTAINER_HEADER_SIZE + MAX_PAYLOAD_SIZE
    {
        return Err(WireError::InvalidLength { length });
    }

    let expected_len = length as usize;
    if data.len() < expected_len {
        return Ok(None);
    }

    let checksum = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
    let payload = &data[CONTAINER_HEADER_SIZE..expected_len];
    let computed = crc32c::crc32c(payload);
    if computed != checksum {
        return Err(WireError::ChecksumMismatch {
            expected: checksum,
            actual: computed,
        });
    }

    Ok(Some((payload.to_vec(), expected_len)))
}

/// Parse one complete container, failing on partial data.
///
/// # Errors
///
/// - `InsufficientData`: not enough bytes for the header or full container
/// - `ChecksumMismatch`: the payload was corrupted
/// - `InvalidLength`: the length field is malformed
pub fn decode_container(data: &[u8]) -> Result<Vec<u8>, WireError> {
    match try_decode_container(data)? {
        Some((payload, _consumed)) => Ok(payload),
        None => Err(WireError::InsufficientData {
            needed: if data.len() < CONTAINER_HEADER_SIZE {
                CONTAINER_HEADER_SIZE
            } else {
                u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize
            },
            have: data.len(),
        }),
    }
}
