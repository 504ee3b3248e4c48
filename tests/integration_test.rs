use bytes::Bytes;
use reactor_net::lifecycle::{setup_tracing, Runtime, RuntimeConfig};
use reactor_net::net::{ConnStream, ServerOptions, StreamStage};
use reactor_net::{context, NetError};
use std::io::Read;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn runtime() -> Runtime {
    setup_tracing();
    Runtime::new(RuntimeConfig::with_workers(2)).expect("Failed to start runtime")
}

/// Client writes "hello", the server answers "world" and closes.
#[tokio::test]
async fn test_hello_world_round_trip() {
    let runtime = runtime();
    let server = runtime.server_with_options(ServerOptions {
        tcp_no_delay: true,
        ..Default::default()
    });

    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
    server.connect_handler(move |socket| {
        let tx = tx.clone();
        let replier = socket.clone();
        let mut received = Vec::new();
        socket.data_handler(move |data| {
            received.extend_from_slice(&data);
            let _ = tx.send(data);
            if received == b"hello" {
                replier.write_str("world")?;
                replier.close()?;
            }
            Ok(())
        })?;
        Ok(())
    });
    let addr = server.listen(0, "127.0.0.1").expect("Failed to listen");

    let mut client = TcpStream::connect(addr).await.expect("Failed to connect");
    client.write_all(b"hello").await.expect("Failed to write");

    let mut seen = Vec::new();
    while seen.len() < 5 {
        let chunk = timeout(WAIT, rx.recv())
            .await
            .expect("Timed out waiting for data")
            .expect("Channel closed");
        seen.extend_from_slice(&chunk);
    }
    assert_eq!(seen, b"hello");

    // read_to_end returns at the first EOF: nothing may follow "world".
    let mut reply = Vec::new();
    timeout(WAIT, client.read_to_end(&mut reply))
        .await
        .expect("Timed out waiting for EOF")
        .expect("Failed to read");
    assert_eq!(reply, b"world");

    server.close_async().await;
    assert_eq!(server.connection_count(), 0);
    runtime.shutdown();
}

/// Writes issued on the owning thread arrive concatenated in call order.
#[tokio::test]
async fn test_writes_arrive_in_call_order() {
    let runtime = runtime();
    let server = runtime.server();
    server.connect_handler(|socket| {
        for i in 0..100 {
            socket.write(format!("{i},"))?;
        }
        socket.close()?;
        Ok(())
    });
    let addr = server.listen(0, "127.0.0.1").expect("Failed to listen");

    let mut client = TcpStream::connect(addr).await.expect("Failed to connect");
    let mut reply = String::new();
    timeout(WAIT, client.read_to_string(&mut reply))
        .await
        .expect("Timed out")
        .expect("Failed to read");
    let expected: String = (0..100).map(|i| format!("{i},")).collect();
    assert_eq!(reply, expected);

    server.close_async().await;
    runtime.shutdown();
}

/// The live set is empty by the time the close callback runs.
#[test]
fn test_close_with_empties_live_set_first() {
    let runtime = runtime();
    let server = runtime.server();
    let (tx, rx) = std_mpsc::channel();
    server.connect_handler(move |socket| {
        tx.send(socket.id())?;
        Ok(())
    });
    let addr = server.listen(0, "127.0.0.1").expect("Failed to listen");

    let mut clients: Vec<_> = (0..3)
        .map(|_| std::net::TcpStream::connect(addr).expect("Failed to connect"))
        .collect();
    for _ in 0..3 {
        rx.recv_timeout(WAIT).expect("Connection not accepted");
    }
    assert_eq!(server.connection_count(), 3);

    let observed = Arc::new(Mutex::new(None));
    let seen = Arc::clone(&observed);
    let inspected = server.clone();
    server.close_with(move || {
        *seen.lock().unwrap() = Some(inspected.connection_count());
    });
    // Outside any context the callback has already run inline.
    assert_eq!(*observed.lock().unwrap(), Some(0));

    for client in &mut clients {
        client.set_read_timeout(Some(WAIT)).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(client.read(&mut buf).expect("Failed to read"), 0);
    }
    runtime.shutdown();
}

/// Holds every accepted stream for a while before the socket is built.
struct SlowSetup(Duration);

#[async_trait::async_trait]
impl StreamStage for SlowSetup {
    fn name(&self) -> &'static str {
        "slow-setup"
    }

    async fn apply(&self, stream: ConnStream) -> Result<ConnStream, NetError> {
        tokio::time::sleep(self.0).await;
        Ok(stream)
    }
}

/// A connection still in setup when the close starts finishes before the close callback.
#[test]
fn test_close_waits_for_connections_in_setup() {
    let runtime = runtime();
    let server = runtime.server();
    server.add_stage(Arc::new(SlowSetup(Duration::from_millis(400))));

    let events = Arc::new(Mutex::new(Vec::new()));
    let on_connect = Arc::clone(&events);
    server.connect_handler(move |_socket| {
        on_connect.lock().unwrap().push("connect".to_string());
        Ok(())
    });
    let addr = server.listen(0, "127.0.0.1").expect("Failed to listen");

    let mut client = std::net::TcpStream::connect(addr).expect("Failed to connect");
    std::thread::sleep(Duration::from_millis(100));
    assert!(events.lock().unwrap().is_empty());

    let on_done = Arc::clone(&events);
    let inspected = server.clone();
    server.close_with(move || {
        on_done
            .lock()
            .unwrap()
            .push(format!("close-done live={}", inspected.connection_count()));
    });
    assert_eq!(*events.lock().unwrap(), vec!["connect", "close-done live=0"]);

    client.set_read_timeout(Some(WAIT)).unwrap();
    let mut buf = [0u8; 16];
    assert_eq!(client.read(&mut buf).expect("Failed to read"), 0);

    // Nothing else fires once the close has completed.
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(events.lock().unwrap().len(), 2);
    runtime.shutdown();
}

/// Closing from inside a connection's own handler completes on that connection's worker.
#[tokio::test]
async fn test_close_with_from_a_socket_callback() {
    let runtime = runtime();
    let server = runtime.server();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let closer = server.clone();
    let pool = Arc::clone(runtime.pool());
    server.connect_handler(move |socket| {
        let tx = tx.clone();
        let pool = Arc::clone(&pool);
        let owner = socket.worker();
        closer.close_with(move || {
            let _ = tx.send(pool.current_worker() == Some(owner));
        });
        Ok(())
    });
    let addr = server.listen(0, "127.0.0.1").expect("Failed to listen");

    let _client = TcpStream::connect(addr).await.expect("Failed to connect");
    let on_owner = timeout(WAIT, rx.recv())
        .await
        .expect("Close callback never ran")
        .expect("Channel closed");
    assert!(on_owner);
    assert_eq!(server.connection_count(), 0);
    runtime.shutdown();
}

/// A drain handler registered on a writable socket fires once before registration returns.
#[tokio::test]
async fn test_drain_handler_fires_synchronously_when_writable() {
    let runtime = runtime();
    let server = runtime.server();
    let (tx, mut rx) = mpsc::unbounded_channel();
    server.connect_handler(move |socket| {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        socket.drain_handler(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })?;
        let _ = tx.send((socket.is_writable(), fired.load(Ordering::SeqCst)));
        Ok(())
    });
    let addr = server.listen(0, "127.0.0.1").expect("Failed to listen");

    let _client = TcpStream::connect(addr).await.expect("Failed to connect");
    let (writable, fired) = timeout(WAIT, rx.recv())
        .await
        .expect("Timed out")
        .expect("Channel closed");
    assert!(writable);
    assert_eq!(fired, 1);

    server.close_async().await;
    runtime.shutdown();
}

/// Crossing the high watermark turns writability off; flushing turns it back on and fires
/// the drain handler exactly once.
#[tokio::test]
async fn test_watermarks_drive_drain() {
    let runtime = runtime();
    let server = runtime.server_with_options(ServerOptions {
        write_high_water_mark: 16,
        write_low_water_mark: 8,
        ..Default::default()
    });
    let (tx, mut rx) = mpsc::unbounded_channel();
    server.connect_handler(move |socket| {
        socket.write(vec![b'x'; 64])?;
        let _ = tx.send(format!("writable={}", socket.is_writable()));

        let tx = tx.clone();
        let watched = socket.clone();
        socket.drain_handler(move || {
            let _ = tx.send(format!("drain writable={}", watched.is_writable()));
            Ok(())
        })?;
        Ok(())
    });
    let addr = server.listen(0, "127.0.0.1").expect("Failed to listen");

    let mut client = TcpStream::connect(addr).await.expect("Failed to connect");
    let first = timeout(WAIT, rx.recv()).await.expect("Timed out").unwrap();
    assert_eq!(first, "writable=false");

    let mut buf = vec![0u8; 64];
    timeout(WAIT, client.read_exact(&mut buf))
        .await
        .expect("Timed out")
        .expect("Failed to read");
    let second = timeout(WAIT, rx.recv()).await.expect("Timed out").unwrap();
    assert_eq!(second, "drain writable=true");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err(), "drain fired more than once");

    server.close_async().await;
    runtime.shutdown();
}

/// Remote close: end handler once, then closed handler, then the socket leaves the live set.
#[tokio::test]
async fn test_remote_end_runs_end_then_closed() {
    let runtime = runtime();
    let server = runtime.server();
    let (tx, mut rx) = mpsc::unbounded_channel();
    server.connect_handler(move |socket| {
        let on_end = tx.clone();
        let on_closed = tx.clone();
        socket.end_handler(move || {
            let _ = on_end.send("end");
            Ok(())
        })?;
        socket.closed_handler(move || {
            let _ = on_closed.send("closed");
            Ok(())
        })?;
        let _ = tx.send("connected");
        Ok(())
    });
    let addr = server.listen(0, "127.0.0.1").expect("Failed to listen");

    let client = TcpStream::connect(addr).await.expect("Failed to connect");
    assert_eq!(rx.recv().await, Some("connected"));
    drop(client);

    let mut events = Vec::new();
    while events.len() < 2 {
        events.push(timeout(WAIT, rx.recv()).await.expect("Timed out").unwrap());
    }
    assert_eq!(events, vec!["end", "closed"]);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err());
    assert_eq!(server.connection_count(), 0);
    runtime.shutdown();
}

/// A reset from the peer closes the socket and reaches the exception handler, never the end handler.
#[tokio::test]
async fn test_connection_reset_reports_error_then_closes() {
    let runtime = runtime();
    let server = runtime.server();
    let (tx, mut rx) = mpsc::unbounded_channel();
    server.connect_handler(move |socket| {
        let on_end = tx.clone();
        let on_closed = tx.clone();
        let on_error = tx.clone();
        socket.end_handler(move || {
            let _ = on_end.send("end");
            Ok(())
        })?;
        socket.closed_handler(move || {
            let _ = on_closed.send("closed");
            Ok(())
        })?;
        socket.exception_handler(move |err| {
            let event = match err {
                NetError::Io(_) => "io error",
                _ => "other error",
            };
            let _ = on_error.send(event);
        })?;
        let _ = tx.send("connected");
        Ok(())
    });
    let addr = server.listen(0, "127.0.0.1").expect("Failed to listen");

    let client = std::net::TcpStream::connect(addr).expect("Failed to connect");
    assert_eq!(
        timeout(WAIT, rx.recv()).await.expect("Timed out"),
        Some("connected")
    );
    // Zero linger turns the close into a reset.
    socket2::SockRef::from(&client)
        .set_linger(Some(Duration::ZERO))
        .expect("Failed to set linger");
    drop(client);

    let mut events = Vec::new();
    while events.len() < 2 {
        events.push(timeout(WAIT, rx.recv()).await.expect("Timed out").unwrap());
    }
    assert_eq!(events, vec!["io error", "closed"]);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err());
    assert_eq!(server.connection_count(), 0);
    runtime.shutdown();
}

/// Handler errors and panics go to the exception handler; the connection keeps working.
#[tokio::test]
async fn test_handler_failures_reach_exception_handler() {
    let runtime = runtime();
    let server = runtime.server();
    let (tx, mut rx) = mpsc::unbounded_channel();
    server.connect_handler(move |socket| {
        let sink = tx.clone();
        socket.exception_handler(move |err| {
            let _ = sink.send(err.to_string());
        })?;
        socket.data_handler(|data| match &data[..] {
            b"fail" => Err("bad frame".into()),
            b"panic" => panic!("handler exploded"),
            _ => Ok(()),
        })?;
        Ok(())
    });
    let addr = server.listen(0, "127.0.0.1").expect("Failed to listen");

    let mut client = TcpStream::connect(addr).await.expect("Failed to connect");
    client.write_all(b"fail").await.unwrap();
    let first = timeout(WAIT, rx.recv()).await.expect("Timed out").unwrap();
    assert_eq!(first, "data handler failed: bad frame");

    client.write_all(b"panic").await.unwrap();
    let second = timeout(WAIT, rx.recv()).await.expect("Timed out").unwrap();
    assert_eq!(second, "data handler panicked: handler exploded");
    assert_eq!(server.connection_count(), 1);

    server.close_async().await;
    runtime.shutdown();
}

/// Completion callbacks run on the owning thread with the socket's context current.
#[tokio::test]
async fn test_write_completion_runs_on_owning_context() {
    let runtime = runtime();
    let server = runtime.server();
    let (tx, mut rx) = mpsc::unbounded_channel();
    server.connect_handler(move |socket| {
        let tx = tx.clone();
        let expected = socket.context();
        socket.write_str_then("done", move || {
            let _ = tx.send(context::current() == Some(expected));
        })?;
        Ok(())
    });
    let addr = server.listen(0, "127.0.0.1").expect("Failed to listen");

    let mut client = TcpStream::connect(addr).await.expect("Failed to connect");
    let mut buf = [0u8; 4];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"done");
    assert!(timeout(WAIT, rx.recv()).await.expect("Timed out").unwrap());

    server.close_async().await;
    runtime.shutdown();
}

/// Files are streamed behind earlier writes; a missing file is reported without closing.
#[tokio::test]
async fn test_send_file() {
    let dir = std::env::temp_dir().join(format!("reactor-net-send-file-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("payload.bin");
    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    std::fs::write(&path, &payload).unwrap();

    let runtime = runtime();
    let server = runtime.server();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let missing = dir.join("missing.bin");
    server.connect_handler(move |socket| {
        let tx = tx.clone();
        let reporter = socket.clone();
        socket.exception_handler(move |err| {
            let _ = tx.send((matches!(err, NetError::Io(_)), reporter.is_open()));
        })?;
        socket.write_str("head")?;
        socket.send_file(missing.clone())?;
        socket.send_file(path.clone())?;
        socket.close()?;
        Ok(())
    });
    let addr = server.listen(0, "127.0.0.1").expect("Failed to listen");

    let mut client = TcpStream::connect(addr).await.expect("Failed to connect");
    let mut received = Vec::new();
    timeout(WAIT, client.read_to_end(&mut received))
        .await
        .expect("Timed out")
        .expect("Failed to read");
    assert_eq!(&received[..4], b"head");
    assert_eq!(&received[4..], &payload[..]);

    let (is_io, still_open) = timeout(WAIT, rx.recv()).await.expect("Timed out").unwrap();
    assert!(is_io);
    // close() was already requested when the missing file was reached.
    assert!(!still_open);

    server.close_async().await;
    runtime.shutdown();
    let _ = std::fs::remove_dir_all(&dir);
}

/// Writes after close fail with SocketClosed.
#[tokio::test]
async fn test_write_after_close_is_rejected() {
    let runtime = runtime();
    let server = runtime.server();
    let (tx, mut rx) = mpsc::unbounded_channel();
    server.connect_handler(move |socket| {
        socket.close()?;
        socket.close()?;
        let _ = tx.send(matches!(socket.write_str("late"), Err(NetError::SocketClosed)));
        Ok(())
    });
    let addr = server.listen(0, "127.0.0.1").expect("Failed to listen");

    let mut client = TcpStream::connect(addr).await.expect("Failed to connect");
    assert!(timeout(WAIT, rx.recv()).await.expect("Timed out").unwrap());
    let mut rest = Vec::new();
    client.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());

    server.close_async().await;
    runtime.shutdown();
}

#[test]
fn test_listen_twice_and_host_resolution() {
    let runtime = runtime();

    let server = runtime.server();
    let err = server.listen(0, "no-such-host.invalid").unwrap_err();
    assert!(matches!(err, NetError::HostResolution { .. }));
    assert!(server.is_listening());
    assert!(matches!(
        server.listen(0, "127.0.0.1"),
        Err(NetError::AlreadyListening)
    ));

    let other = runtime.server();
    let addr = other.listen(0, "127.0.0.1").expect("Failed to listen");
    assert_eq!(other.local_addr(), Some(addr));
    assert!(matches!(
        other.listen(0, "127.0.0.1"),
        Err(NetError::AlreadyListening)
    ));
    other.close_with(|| {});
    runtime.shutdown();
}
