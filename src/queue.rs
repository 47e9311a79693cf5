// SPDX-License-Identifier: MIT

//! Lock-protected byte FIFOs shared between the driver and its orchestrator.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

//--------------------------------------------------------------------------------------------------
// Public definitions
//--------------------------------------------------------------------------------------------------

/// An unbounded FIFO of bytes behind a single lock.
///
/// Bytes are appended at the tail and removed from the head only; the order
/// of successful pushes is preserved in pop order. Two independent instances
/// exist in a running driver: the receive queue (driver to consumer) and the
/// transmit queue (consumer to driver).
pub struct ByteQueue {
    inner: Mutex<VecDeque<u8>>,
}

//--------------------------------------------------------------------------------------------------
// Public code
//--------------------------------------------------------------------------------------------------

impl ByteQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
        }
    }

    /// Append one byte at the tail.
    pub fn push(&self, byte: u8) {
        self.with(|q| q.push_back(byte));
    }

    /// Remove the head byte, if any.
    pub fn pop(&self) -> Option<u8> {
        self.with(|q| q.pop_front())
    }

    pub fn len(&self) -> usize {
        self.with(|q| q.len())
    }

    pub fn is_empty(&self) -> bool {
        self.with(|q| q.is_empty())
    }

    /// Grants temporary access to the queue under its lock.
    ///
    /// When two queues are held at once (the orchestrator's drain step), the
    /// receive queue must be entered before the transmit queue everywhere, or
    /// deadlock is possible.
    pub fn with<R>(&self, f: impl FnOnce(&mut VecDeque<u8>) -> R) -> R {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }
}

impl Default for ByteQueue {
    fn default() -> Self {
        Self::new()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
