//! Receive callback for records relayed from clients into the host
//!
//! The multiplexing loop owns the handler and calls it once per record read
//! from any client. Closures implement [`RecordHandler`] directly, so the
//! "callback plus context" pair is simply whatever the closure captures.

/// Handler refused a record; the record is counted as lost
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("record rejected by handler (code {0})")]
pub struct Rejected(pub i32);

/// Consumer of records received from clients
pub trait RecordHandler: Send + 'static {
    /// Process one record
    ///
    /// Returning `Err` is reported and counted, never fatal: the connection
    /// stays open and the loop keeps running.
    fn on_record(&mut self, record: &[u8]) -> Result<(), Rejected>;
}

impl<F> RecordHandler for F
where
    F: FnMut(&[u8]) -> Result<(), Rejected> + Send + 'static,
{
    fn on_record(&mut self, record: &[u8]) -> Result<(), Rejected> {
        self(record)
    }
}
