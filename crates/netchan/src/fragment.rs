//! Splitting of oversized reliable messages into datagram-sized fragments and
//! their in-order reassembly on the receiving side.
//!
//! Fragments are delivered strictly in sequence: the receiver only ever
//! appends, so the offset carried by each fragment must match what has been
//! accumulated so far.

use crate::error::FragmentError;

/// A slice of an outgoing message ready to be framed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fragment<'a> {
    pub offset: usize,
    pub total_len: usize,
    pub data: &'a [u8],
    pub is_last: bool,
}

#[derive(Debug, Default)]
pub struct FragmentSender {
    payload: Vec<u8>,
    cursor: usize,
    pending: bool,
}

impl FragmentSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_send(&mut self, payload: Vec<u8>) {
        self.payload = payload;
        self.cursor = 0;
        self.pending = true;
    }

    /// Returns up to `max_chunk` bytes starting at the cursor and advances it.
    pub fn next_fragment(&mut self, max_chunk: usize) -> Result<Fragment<'_>, FragmentError> {
        if !self.pending {
            return Err(FragmentError::NoPendingFragment);
        }

        let offset = self.cursor;
        let len = (self.payload.len() - offset).min(max_chunk);
        let is_last = offset + len == self.payload.len();

        self.cursor += len;
        if is_last {
            self.pending = false;
        }

        Ok(Fragment {
            offset,
            total_len: self.payload.len(),
            data: &self.payload[offset..offset + len],
            is_last,
        })
    }

    /// Restarts the message from its first fragment.
    pub fn rewind(&mut self) {
        self.cursor = 0;
        self.pending = true;
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    /// Whether the cursor sits mid-message (some but not all fragments sent).
    pub fn is_mid_stream(&self) -> bool {
        self.pending && self.cursor > 0
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn clear(&mut self) {
        self.payload.clear();
        self.cursor = 0;
        self.pending = false;
    }
}

#[derive(Debug)]
pub struct FragmentAssembler {
    buffer: Vec<u8>,
    expected_len: Option<usize>,
    max_size: usize,
}

impl FragmentAssembler {
    pub fn new(max_size: usize) -> Self {
        Self {
            buffer: Vec::new(),
            expected_len: None,
            max_size,
        }
    }

    pub fn in_progress(&self) -> bool {
        self.expected_len.is_some()
    }

    pub fn received_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn expected_len(&self) -> Option<usize> {
        self.expected_len
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.expected_len = None;
    }

    /// Appends one fragment. Returns the complete message once the last
    /// fragment arrives.
    pub fn on_fragment_received(
        &mut self,
        offset: usize,
        total_len: usize,
        data: &[u8],
        is_last: bool,
    ) -> Result<Option<Vec<u8>>, FragmentError> {
        if total_len > self.max_size {
            self.reset();
            return Err(FragmentError::Oversize {
                size: total_len,
                max: self.max_size,
            });
        }

        if offset == 0 {
            if self.in_progress() {
                log::warn!(
                    "discarding incomplete fragmented message ({} of {:?} bytes)",
                    self.buffer.len(),
                    self.expected_len
                );
            }
            self.reset();
            self.expected_len = Some(total_len);
        }

        let Some(expected) = self.expected_len else {
            return Err(FragmentError::NoMessageInProgress { offset });
        };

        if expected != total_len {
            self.reset();
            return Err(FragmentError::LengthMismatch {
                expected,
                total: total_len,
            });
        }

        if offset != self.buffer.len() {
            let received = self.buffer.len();
            self.reset();
            return Err(FragmentError::OutOfSequence {
                expected: received,
                offset,
            });
        }

        let end = offset + data.len();
        if end > expected || (is_last != (end == expected)) {
            self.reset();
            return Err(FragmentError::LengthMismatch {
                expected,
                total: end,
            });
        }

        self.buffer.extend_from_slice(data);

        if !is_last {
            return Ok(None);
        }

        self.expected_len = None;
        Ok(Some(std::mem::take(&mut self.buffer)))
    }
}
