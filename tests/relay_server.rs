//! Relay server integration tests
//!
//! Every test runs a real server on an ephemeral port (`service = "0"`) and
//! talks to it through real client connections on the loopback interface.
//!
//! Run with: `cargo test --test relay_server`

use crossbeam_channel::{Receiver, unbounded};
use relay_io::{
    Error, RecvTimeout, Rejected, RelayClient, RelayServer, ServerConfig, ServerStats,
};
use std::io::Read;
use std::net::TcpStream;
use std::thread;
use std::time::{Duration, Instant};

// ============================================================================
// Helpers
// ============================================================================

const RECORD_SIZE: usize = 16;
const WAIT: Duration = Duration::from_secs(5);

/// Poll `condition` until it holds or `WAIT` expires
fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

fn accept_all(_record: &[u8]) -> Result<(), Rejected> {
    Ok(())
}

/// Server whose handler forwards every record to the returned channel
fn forwarding_server(
    config: ServerConfig,
    verdict: Result<(), Rejected>,
) -> (RelayServer, Receiver<Vec<u8>>) {
    let (tx, rx) = unbounded();
    let handler = move |record: &[u8]| -> Result<(), Rejected> {
        let _ = tx.send(record.to_vec());
        verdict
    };
    (RelayServer::start(config, handler).unwrap(), rx)
}

fn connect(server: &RelayServer) -> RelayClient {
    let port = server.local_addr().port();
    RelayClient::connect(&format!("127.0.0.1:{}", port)).unwrap()
}

fn recv_record(client: &mut RelayClient) -> [u8; RECORD_SIZE] {
    let mut record = [0u8; RECORD_SIZE];
    client
        .recv(&mut record, RecvTimeout::Bounded(WAIT))
        .unwrap();
    record
}

// ============================================================================
// Lifecycle
// ============================================================================

#[test]
fn test_stop_releases_listening_port() {
    let server = RelayServer::start(ServerConfig::new("0", RECORD_SIZE), accept_all).unwrap();
    assert!(server.is_running());
    let port = server.local_addr().port().to_string();
    server.stop().unwrap();

    let again = RelayServer::start(ServerConfig::new(port.as_str(), RECORD_SIZE), accept_all)
        .expect("restart on the same service");
    assert_eq!(again.local_addr().port().to_string(), port);
    again.stop().unwrap();
}

#[test]
fn test_stop_closes_connected_clients() {
    let server = RelayServer::start(ServerConfig::new("0", RECORD_SIZE), accept_all).unwrap();
    let mut client = connect(&server);
    assert!(wait_until(|| server.client_count() == 1));

    server.stop().unwrap();

    let mut record = [0u8; RECORD_SIZE];
    assert!(matches!(
        client.recv(&mut record, RecvTimeout::Bounded(WAIT)),
        Err(Error::Disconnected)
    ));
}

#[test]
fn test_drop_stops_server() {
    let port = {
        let server =
            RelayServer::start(ServerConfig::new("0", RECORD_SIZE), accept_all).unwrap();
        server.local_addr().port()
    };
    assert!(RelayClient::connect(&format!("127.0.0.1:{}", port)).is_err());
}

#[test]
fn test_start_rejects_bad_arguments() {
    for size in [0, 1461] {
        assert!(matches!(
            RelayServer::start(ServerConfig::new("0", size), accept_all),
            Err(Error::InvalidArgument(_))
        ));
    }
    assert!(matches!(
        RelayServer::start(ServerConfig::new("", RECORD_SIZE), accept_all),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        RelayServer::start(ServerConfig::new("no-such-service-xyz", RECORD_SIZE), accept_all),
        Err(Error::Address(_))
    ));
}

#[test]
fn test_port_in_use_is_bind_error() {
    let first = RelayServer::start(ServerConfig::new("0", RECORD_SIZE), accept_all).unwrap();
    let port = first.local_addr().port().to_string();

    match RelayServer::start(ServerConfig::new(port.as_str(), RECORD_SIZE), accept_all) {
        Err(Error::Bind { service, .. }) => assert_eq!(service, port),
        Err(e) => panic!("expected bind error, got {}", e),
        Ok(_) => panic!("second server bound a port in use"),
    }
    first.stop().unwrap();
}

// ============================================================================
// Broadcast
// ============================================================================

#[test]
fn test_broadcast_without_clients_is_lost() {
    let server = RelayServer::start(ServerConfig::new("0", RECORD_SIZE), accept_all).unwrap();

    server.send(&[0xAA; RECORD_SIZE]).unwrap();
    server.send(&[0xBB; RECORD_SIZE]).unwrap();

    assert_eq!(
        server.stats(),
        ServerStats {
            sent: 0,
            received: 0,
            lost: 2
        }
    );
    server.stop().unwrap();
}

#[test]
fn test_broadcast_rejects_wrong_size() {
    let server = RelayServer::start(ServerConfig::new("0", RECORD_SIZE), accept_all).unwrap();

    assert!(matches!(server.send(&[]), Err(Error::InvalidArgument(_))));
    assert!(matches!(
        server.send(&[0xAA; RECORD_SIZE - 1]),
        Err(Error::InvalidArgument(_))
    ));
    assert_eq!(server.stats(), ServerStats::default());
    server.stop().unwrap();
}

#[test]
fn test_broadcast_reaches_remaining_clients_after_disconnect() {
    let server = RelayServer::start(ServerConfig::new("0", RECORD_SIZE), accept_all).unwrap();
    let mut client1 = connect(&server);
    let mut client2 = connect(&server);
    assert!(wait_until(|| server.client_count() == 2));

    server.send(&[0xAA; RECORD_SIZE]).unwrap();
    assert_eq!(recv_record(&mut client1), [0xAA; RECORD_SIZE]);
    assert_eq!(recv_record(&mut client2), [0xAA; RECORD_SIZE]);

    let gone = client1.local_addr().unwrap();
    client1.close().unwrap();
    assert!(wait_until(|| server.client_count() == 1));
    assert!(!server.connected_peers().contains(&gone));
    assert!(
        server
            .connected_peers()
            .contains(&client2.local_addr().unwrap())
    );

    server.send(&[0x55; RECORD_SIZE]).unwrap();
    assert_eq!(recv_record(&mut client2), [0x55; RECORD_SIZE]);

    // One increment per call, not per client
    assert_eq!(server.stats().sent, 2);
    assert_eq!(server.stats().lost, 0);
    server.stop().unwrap();
}

#[test]
fn test_concurrent_broadcasts_never_interleave() {
    let server = RelayServer::start(ServerConfig::new("0", RECORD_SIZE), accept_all).unwrap();
    let mut client = connect(&server);
    assert!(wait_until(|| server.client_count() == 1));

    const PER_SENDER: usize = 50;
    thread::scope(|s| {
        for value in [0x11u8, 0x22] {
            let server = &server;
            s.spawn(move || {
                for _ in 0..PER_SENDER {
                    server.send(&[value; RECORD_SIZE]).unwrap();
                }
            });
        }
    });

    let mut counts = [0usize; 2];
    for _ in 0..2 * PER_SENDER {
        let record = recv_record(&mut client);
        assert!(record.iter().all(|&b| b == record[0]), "{:02X?}", record);
        match record[0] {
            0x11 => counts[0] += 1,
            0x22 => counts[1] += 1,
            other => panic!("unexpected record byte {:02X}", other),
        }
    }
    assert_eq!(counts, [PER_SENDER, PER_SENDER]);
    assert_eq!(server.stats().sent, (2 * PER_SENDER) as u64);
    server.stop().unwrap();
}

// ============================================================================
// Inbound records
// ============================================================================

#[test]
fn test_client_record_reaches_handler_once() {
    let (server, records) = forwarding_server(ServerConfig::new("0", RECORD_SIZE), Ok(()));
    let mut client = connect(&server);

    let sent: Vec<u8> = (0..RECORD_SIZE as u8).collect();
    assert_eq!(client.send(&sent).unwrap(), RECORD_SIZE);

    assert_eq!(records.recv_timeout(WAIT).unwrap(), sent);
    assert!(wait_until(|| server.stats().received == 1));
    assert!(records.recv_timeout(Duration::from_millis(100)).is_err());
    assert_eq!(server.stats().received, 1);
    assert_eq!(server.stats().lost, 0);
    server.stop().unwrap();
}

#[test]
fn test_rejected_record_keeps_connection_open() {
    let (server, records) =
        forwarding_server(ServerConfig::new("0", RECORD_SIZE), Err(Rejected(-1)));
    let mut client = connect(&server);
    assert!(wait_until(|| server.client_count() == 1));

    client.send(&[0x01; RECORD_SIZE]).unwrap();
    records.recv_timeout(WAIT).unwrap();
    assert!(wait_until(|| server.stats().lost == 1));
    assert_eq!(server.stats().received, 1);

    // Still registered and still served
    assert_eq!(server.client_count(), 1);
    server.send(&[0x02; RECORD_SIZE]).unwrap();
    assert_eq!(recv_record(&mut client), [0x02; RECORD_SIZE]);
    server.stop().unwrap();
}

#[test]
fn test_panicking_handler_keeps_server_serving() {
    let (tx, records) = unbounded();
    let handler = move |record: &[u8]| -> Result<(), Rejected> {
        if record[0] == 0xFF {
            panic!("handler cannot take {:02X?}", record);
        }
        let _ = tx.send(record.to_vec());
        Ok(())
    };
    let server = RelayServer::start(ServerConfig::new("0", RECORD_SIZE), handler).unwrap();
    let mut client1 = connect(&server);
    assert!(wait_until(|| server.client_count() == 1));

    client1.send(&[0xFF; RECORD_SIZE]).unwrap();
    assert!(wait_until(|| server.stats().lost == 1));
    assert_eq!(server.stats().received, 1);
    assert!(server.is_running());

    // Still accepting, broadcasting and dispatching
    let mut client2 = connect(&server);
    assert!(wait_until(|| server.client_count() == 2));
    server.send(&[0x03; RECORD_SIZE]).unwrap();
    assert_eq!(recv_record(&mut client1), [0x03; RECORD_SIZE]);
    assert_eq!(recv_record(&mut client2), [0x03; RECORD_SIZE]);

    client2.send(&[0x04; RECORD_SIZE]).unwrap();
    assert_eq!(records.recv_timeout(WAIT).unwrap(), vec![0x04; RECORD_SIZE]);
    assert_eq!(server.stats().sent, 1);
    server.stop().unwrap();
}

// ============================================================================
// Slow clients
// ============================================================================

#[test]
fn test_stalled_client_is_dropped_without_blocking_others() {
    const SIZE: usize = 1460;
    let stall = Duration::from_millis(200);
    let config = ServerConfig::new("0", SIZE).with_send_stall_timeout(stall);
    let server = RelayServer::start(config, accept_all).unwrap();
    let port = server.local_addr().port();

    // Never reads; once its buffers fill up the next broadcast stalls on it
    let _stalled = TcpStream::connect(("127.0.0.1", port)).unwrap();
    let mut reader = TcpStream::connect(("127.0.0.1", port)).unwrap();
    assert!(wait_until(|| server.client_count() == 2));

    let reading = thread::spawn(move || {
        let mut record = vec![0u8; SIZE];
        let mut count = 0u64;
        while reader.read_exact(&mut record).is_ok() {
            assert!(record.iter().all(|&b| b == record[0]), "torn record");
            count += 1;
        }
        count
    });

    let deadline = Instant::now() + Duration::from_secs(60);
    let mut value = 0u8;
    while server.client_count() == 2 {
        assert!(Instant::now() < deadline, "stalled client never dropped");
        value = value.wrapping_add(1);
        let started = Instant::now();
        server.send(&[value; SIZE]).unwrap();
        let elapsed = started.elapsed();
        assert!(elapsed < stall + Duration::from_secs(1), "send took {:?}", elapsed);
    }
    assert_eq!(server.client_count(), 1);

    // The remaining client keeps getting whole records
    for _ in 0..10 {
        value = value.wrapping_add(1);
        server.send(&[value; SIZE]).unwrap();
    }
    let sent = server.stats().sent;
    server.stop().unwrap();

    assert_eq!(reading.join().unwrap(), sent);
}

// ============================================================================
// Client receive timeouts
// ============================================================================

#[test]
fn test_recv_immediate_without_data() {
    let server = RelayServer::start(ServerConfig::new("0", RECORD_SIZE), accept_all).unwrap();
    let mut client = connect(&server);
    let mut record = [0u8; RECORD_SIZE];

    let started = Instant::now();
    assert!(matches!(
        client.recv(&mut record, RecvTimeout::from_millis(0)),
        Err(Error::NoData)
    ));
    assert!(started.elapsed() < Duration::from_millis(10));
    server.stop().unwrap();
}

#[test]
fn test_recv_bounded_without_data() {
    let server = RelayServer::start(ServerConfig::new("0", RECORD_SIZE), accept_all).unwrap();
    let mut client = connect(&server);
    let mut record = [0u8; RECORD_SIZE];

    let started = Instant::now();
    assert!(matches!(
        client.recv(&mut record, RecvTimeout::from_millis(200)),
        Err(Error::NoData)
    ));
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(180), "returned after {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(2), "returned after {:?}", elapsed);
    server.stop().unwrap();
}

// ============================================================================
// Session log
// ============================================================================

#[test]
fn test_session_log_records_the_session() {
    let dir = tempfile::tempdir().unwrap();
    let config = ServerConfig::new("0", RECORD_SIZE)
        .with_log_level(3)
        .with_log_dir(dir.path());
    let (server, records) = forwarding_server(config, Ok(()));
    let path = server.session_log_path().unwrap().to_path_buf();
    assert_eq!(path, dir.path().join("tcp_0.log"));

    let mut client = connect(&server);
    assert!(wait_until(|| server.client_count() == 1));
    server.send(&[0xAA; RECORD_SIZE]).unwrap();
    recv_record(&mut client);
    client.send(&[0x0F; RECORD_SIZE]).unwrap();
    records.recv_timeout(WAIT).unwrap();
    server.stop().unwrap();

    let text = std::fs::read_to_string(&path).unwrap();
    assert!(text.starts_with("+++ TCP/IP Server on port 0 with data size 16 +++"));
    assert!(text.contains("New connection from 127.0.0.1 on socket"));
    assert!(text.contains(&format!("Sending 16 byte(s):{}", " AA".repeat(16))));
    assert!(text.contains(&format!("Received 16 byte(s):{}", " 0F".repeat(16))));
    assert!(text.contains("          1 packet(s) sent to clients"));
    assert!(text.contains("          1 packet(s) received from clients"));
    assert!(text.contains("          0 packet(s) not processed by the host"));
    assert!(text.contains("+++ TCP/IP Server terminated: elapsed time "));
}

#[test]
fn test_no_session_log_by_default() {
    let dir = tempfile::tempdir().unwrap();
    let config = ServerConfig::new("0", RECORD_SIZE).with_log_dir(dir.path());
    let server = RelayServer::start(config, accept_all).unwrap();
    assert!(server.session_log_path().is_none());
    server.stop().unwrap();
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}
