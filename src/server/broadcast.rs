//! Per-client record writes for broadcasts
//!
//! Client sockets are non-blocking (the multiplexing loop needs that for
//! edge-triggered reads), so a full send buffer shows up as `WouldBlock`.
//! The writer retries until the record is out or the client has made no
//! progress for the stall timeout. A stalled client is shut down: it may hold
//! part of a record, and left in place it would cost every later broadcast
//! another stall. The loop then sees the hang-up and removes it.

use std::io::{self, ErrorKind, Write};
use std::net::{Shutdown, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

/// Pause between retries on a full send buffer
const STALL_RETRY_INTERVAL: Duration = Duration::from_micros(200);

/// Write one whole record to a client
pub(crate) fn write_record(
    stream: &TcpStream,
    record: &[u8],
    stall_timeout: Duration,
) -> io::Result<()> {
    let mut writer = stream;
    let mut written = 0;
    let mut stalled_since: Option<Instant> = None;

    while written < record.len() {
        match writer.write(&record[written..]) {
            Ok(0) => return Err(io::Error::from(ErrorKind::WriteZero)),
            Ok(n) => {
                written += n;
                stalled_since = None;
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                let since = *stalled_since.get_or_insert_with(Instant::now);
                if since.elapsed() >= stall_timeout {
                    let _ = stream.shutdown(Shutdown::Both);
                    return Err(io::Error::new(
                        ErrorKind::TimedOut,
                        format!(
                            "client stalled after {} of {} bytes",
                            written,
                            record.len()
                        ),
                    ));
                }
                thread::sleep(STALL_RETRY_INTERVAL);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
