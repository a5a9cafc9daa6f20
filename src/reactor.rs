//! Byte accumulator for incremental frame decoding over a streaming
//! transport, shared by the CPC and Spinel clients.

use crate::error::Result;

/// Accumulates bytes received from a streaming transport and repeatedly
/// offers them to a decoder until the decoder either extracts a frame
/// or reports it needs more data.
#[derive(Default)]
pub struct ByteAccumulator {
    buffer: Vec<u8>,
}

impl ByteAccumulator {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Borrows the buffered bytes without consuming them.
    pub fn peek(&self) -> &[u8] {
        &self.buffer
    }

    /// Drops the first `n` buffered bytes.
    pub fn consume(&mut self, n: usize) {
        self.buffer.drain(..n);
    }

    /// Repeatedly calls `decode` against the buffered bytes. `decode`
    /// returns `Ok(Some((frame, consumed)))` on a full frame, `Ok(None)`
    /// if more bytes are needed, or `Err` on a malformed prefix (the
    /// caller's `decode` is expected to have already resynchronized by
    /// skipping the offending byte(s) before returning `Err`, matching
    /// how frame-oriented protocols recover from a corrupt header).
    pub fn drain_frames<T>(
        &mut self,
        mut decode: impl FnMut(&[u8]) -> Result<Option<(T, usize)>>,
    ) -> Result<Vec<T>> {
        let mut frames = Vec::new();

        loop {
            match decode(&self.buffer) {
                Ok(Some((frame, consumed))) => {
                    self.buffer.drain(..consumed);
                    frames.push(frame);
                }
                Ok(None) => break,
                Err(e) => {
                    self.buffer.clear();
                    return Err(e);
                }
            }
        }

        Ok(frames)
    }

    /// Drops a single leading byte, used to resynchronize onto the next
    /// plausible frame start after a decode error.
    pub fn skip_one(&mut self) {
        if !self.buffer.is_empty() {
            self.buffer.remove(0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FlasherError;

    #[test]
    fn test_byte_accumulator_drains_multiple_frames() {
        let mut acc = ByteAccumulator::new();
        acc.extend(&[1, 2, 3, 4]);

        let frames = acc
            .drain_frames(|buf| {
                if buf.len() < 2 {
                    return Ok(None);
                }
                Ok(Some(((buf[0], buf[1]), 2)))
            })
            .unwrap();

        assert_eq!(frames, vec![(1, 2), (3, 4)]);
        assert!(acc.is_empty());
    }

    #[test]
    fn test_byte_accumulator_clears_on_error() {
        let mut acc = ByteAccumulator::new();
        acc.extend(&[0xFF]);

        let result: Result<Vec<()>> = acc.drain_frames(|_| {
            Err(FlasherError::InvalidFormat("bad byte".to_string()))
        });

        assert!(result.is_err());
        assert!(acc.is_empty());
    }
}
