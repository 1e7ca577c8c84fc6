//! End-to-end transport scenarios.

use std::time::{Duration, Instant};

use sprocket::{Aio, AioTimeout, Error, Message, OptValue, Pipe, names};

const PROTO: u16 = 0x0510;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Listen, bind, and connect one pipe pair over `listen_url`.
async fn pair(listen_url: &str) -> (sprocket::Listener, sprocket::Dialer, Pipe, Pipe) {
    let listener = sprocket::listen(listen_url, PROTO).await.unwrap();
    listener.bind().await.unwrap();
    let url = listener.get_opt(names::URL).unwrap();
    let url = url.as_str().unwrap().to_string();

    let accepted = Aio::waitable();
    listener.accept(&accepted);

    let dialer = sprocket::dial(&url, PROTO).unwrap();
    let connected = Aio::waitable();
    dialer.connect(&connected);

    connected.wait().await;
    accepted.wait().await;
    assert_eq!(connected.result(), Ok(()));
    assert_eq!(accepted.result(), Ok(()));
    let dpipe: Pipe = connected.take_output().unwrap();
    let lpipe: Pipe = accepted.take_output().unwrap();
    assert_eq!(dpipe.peer(), PROTO);
    assert_eq!(lpipe.peer(), PROTO);
    (listener, dialer, dpipe, lpipe)
}

async fn send_msg(pipe: &Pipe, bytes: &[u8]) -> sprocket::Result<usize> {
    let aio = Aio::waitable();
    aio.set_msg(Message::from(bytes));
    pipe.send(&aio);
    aio.wait().await;
    aio.result().map(|_| aio.count())
}

async fn recv_msg(pipe: &Pipe) -> sprocket::Result<Message> {
    let aio = Aio::waitable();
    pipe.recv(&aio);
    aio.wait().await;
    aio.result()?;
    Ok(aio.take_msg().expect("successful recv carries a message"))
}

#[tokio::test(flavor = "multi_thread")]
async fn receive_times_out_without_data() {
    let (_l, _d, dpipe, _lpipe) = pair("inproc://scenario-recv-timeout").await;

    let aio = Aio::waitable();
    aio.set_timeout(AioTimeout::After(Duration::from_millis(10)));
    let start = Instant::now();
    dpipe.recv(&aio);
    aio.wait().await;
    let elapsed = start.elapsed();

    assert_eq!(aio.result(), Err(Error::TimedOut));
    assert!(aio.take_msg().is_none());
    assert!(elapsed >= Duration::from_millis(9), "fired early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(500), "fired late: {elapsed:?}");
}

#[tokio::test(flavor = "multi_thread")]
async fn nonblocking_receive_reports_again() {
    let (_l, _d, dpipe, _lpipe) = pair("inproc://scenario-nonblock").await;

    let aio = Aio::waitable();
    aio.set_timeout(AioTimeout::After(Duration::ZERO));
    let start = Instant::now();
    dpipe.recv(&aio);
    aio.wait().await;

    assert_eq!(aio.result(), Err(Error::Again));
    assert!(aio.take_msg().is_none());
    assert!(start.elapsed() < Duration::from_millis(500));
}

#[tokio::test(flavor = "multi_thread")]
async fn late_listener_is_reached_by_redial() {
    // Find a port that is currently free.
    let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = probe.local_addr().unwrap().port();
    drop(probe);
    let url = format!("tcp://127.0.0.1:{port}");

    let dialer = sprocket::dial(&url, PROTO).unwrap();
    dialer
        .set_opt(names::RECONNECT_MIN, &OptValue::Ms(10))
        .unwrap();
    dialer
        .set_opt(names::RECONNECT_MAX, &OptValue::Ms(10))
        .unwrap();
    dialer.start().unwrap();

    // Nobody is listening yet; the dialer keeps retrying every 10ms.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let listener = sprocket::listen(&url, PROTO).await.unwrap();
    listener.bind().await.unwrap();
    let accepted = Aio::waitable();
    listener.accept(&accepted);

    tokio::time::sleep(Duration::from_millis(100)).await;

    let connected = Aio::waitable();
    dialer.connect(&connected);
    connected.wait().await;
    accepted.wait().await;
    assert_eq!(connected.result(), Ok(()));
    assert_eq!(accepted.result(), Ok(()));
    let dpipe: Pipe = connected.take_output().unwrap();
    let lpipe: Pipe = accepted.take_output().unwrap();

    assert_eq!(send_msg(&dpipe, b"abc\0").await, Ok(4));
    let msg = recv_msg(&lpipe).await.unwrap();
    assert_eq!(msg.body(), b"abc\0");
}

#[tokio::test(flavor = "multi_thread")]
async fn second_listener_on_same_address_is_busy() {
    let url = "inproc://scenario-addr-busy";

    let first = sprocket::listen(url, PROTO).await.unwrap();
    assert!(first.id() > 0);
    first.bind().await.unwrap();

    let second = sprocket::listen(url, PROTO).await.unwrap();
    assert_eq!(second.bind().await, Err(Error::AddressInUse));

    // A listener that is already running cannot be started again.
    assert_eq!(first.bind().await, Err(Error::InvalidState));

    // Dialing the same URL still works.
    let accepted = Aio::waitable();
    first.accept(&accepted);
    let dialer = sprocket::dial(url, PROTO).unwrap();
    let connected = Aio::waitable();
    dialer.connect(&connected);
    connected.wait().await;
    assert_eq!(connected.result(), Ok(()));
}

#[tokio::test(flavor = "multi_thread")]
async fn zero_length_message_round_trips() {
    let (_l, _d, dpipe, lpipe) = pair("inproc://scenario-zero-len").await;

    assert_eq!(send_msg(&dpipe, b"").await, Ok(0));
    let msg = recv_msg(&lpipe).await.unwrap();
    assert_eq!(msg.len(), 0);
    assert!(msg.body().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn oversize_message_fails_and_pipe_closes() {
    init_tracing();
    let url = "inproc://scenario-oversize";
    let listener = sprocket::listen(url, PROTO).await.unwrap();
    listener
        .set_opt(names::RECV_MAX_SIZE, &OptValue::Size(4))
        .unwrap();
    listener.bind().await.unwrap();

    let accepted = Aio::waitable();
    listener.accept(&accepted);
    let dialer = sprocket::dial(url, PROTO).unwrap();
    let connected = Aio::waitable();
    dialer.connect(&connected);
    connected.wait().await;
    accepted.wait().await;
    let dpipe: Pipe = connected.take_output().unwrap();
    let lpipe: Pipe = accepted.take_output().unwrap();

    assert_eq!(send_msg(&dpipe, b"12345").await, Ok(5));
    assert_eq!(recv_msg(&lpipe).await.unwrap_err(), Error::MessageTooBig);

    // The protocol layer closes the pipe on a fatal receive error.
    lpipe.close();
    let aio = Aio::waitable();
    lpipe.recv(&aio);
    aio.wait().await;
    assert_eq!(aio.result(), Err(Error::Closed));
}

#[tokio::test(flavor = "multi_thread")]
async fn garbage_handshake_is_a_protocol_error() {
    let listener = sprocket::listen("tcp://127.0.0.1:0", PROTO).await.unwrap();
    listener.bind().await.unwrap();
    let url = listener.get_opt(names::URL).unwrap();
    let bound = sprocket::Url::parse(url.as_str().unwrap()).unwrap();

    let accepted = Aio::waitable();
    listener.accept(&accepted);

    let mut raw = tokio::net::TcpStream::connect(("127.0.0.1", bound.port().unwrap()))
        .await
        .unwrap();
    tokio::io::AsyncWriteExt::write_all(&mut raw, &[1, 2, 3, 4, 5, 6, 7, 8])
        .await
        .unwrap();

    accepted.wait().await;
    assert_eq!(accepted.result(), Err(Error::Protocol));
}

#[tokio::test(flavor = "multi_thread")]
async fn peer_hangup_during_handshake_is_connection_shutdown() {
    let listener = sprocket::listen("tcp://127.0.0.1:0", PROTO).await.unwrap();
    listener.bind().await.unwrap();
    let url = listener.get_opt(names::URL).unwrap();
    let bound = sprocket::Url::parse(url.as_str().unwrap()).unwrap();

    let accepted = Aio::waitable();
    listener.accept(&accepted);

    // Send FIN but keep the socket open: the accepting side reads EOF
    // mid-handshake.
    let mut raw = tokio::net::TcpStream::connect(("127.0.0.1", bound.port().unwrap()))
        .await
        .unwrap();
    tokio::io::AsyncWriteExt::shutdown(&mut raw).await.unwrap();

    accepted.wait().await;
    assert_eq!(accepted.result(), Err(Error::ConnectionShutdown));
    drop(raw);
}
