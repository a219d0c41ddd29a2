//! Copy buffer sizing.

use bytes::BytesMut;

/// Buffer size classes for different use cases
const BUFFER_SIZES: &[usize] = &[1024, 4096, 8192, 16384, 32768, 65536];

/// Largest UDP payload.
pub const MAX_DATAGRAM: usize = 65_535;

/// Get a zeroed buffer of at least `min_size` bytes, rounded up to a size class.
pub fn get_buffer(min_size: usize) -> BytesMut {
    let size = BUFFER_SIZES
        .iter()
        .find(|&&size| size >= min_size)
        .copied()
        .unwrap_or_else(|| min_size.next_power_of_two().max(4096));

    BytesMut::zeroed(size)
}

/// Buffer for one direction of a stream pump.
pub fn stream_buffer() -> BytesMut {
    get_buffer(16384)
}

/// Buffer able to hold any datagram.
pub fn datagram_buffer() -> BytesMut {
    get_buffer(MAX_DATAGRAM)
}
