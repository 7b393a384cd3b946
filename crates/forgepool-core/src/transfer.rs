//! `Transfer`: a binary region the caller is willing to give up
//! ownership of when handing a call to a worker.

use bytes::Bytes;

/// Wraps a buffer destined for [`crate::pool::ExecOptions::transfer`].
/// Whether the move actually happens, rather than a copy, is entirely up
/// to the concrete [`crate::channel::WorkerChannel`] — the core only
/// carries the intent.
#[derive(Clone, Debug)]
pub struct Transfer(Bytes);

impl Transfer {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Transfer(bytes.into())
    }

    pub fn into_inner(self) -> Bytes {
        self.0
    }
}

impl From<Bytes> for Transfer {
    fn from(bytes: Bytes) -> Self {
        Transfer(bytes)
    }
}

impl From<Transfer> for Bytes {
    fn from(t: Transfer) -> Self {
        t.0
    }
}
