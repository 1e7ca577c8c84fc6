//! Framing and ordering properties of the pipe engine.

use std::sync::Arc;

use parking_lot::Mutex;
use sprocket::{Aio, Error, Message, Pipe, names};

const PROTO: u16 = 0x0113;

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
    (
        listener,
        dialer,
        connected.take_output().unwrap(),
        accepted.take_output().unwrap(),
    )
}

async fn recv_msg(pipe: &Pipe) -> sprocket::Result<Message> {
    let aio = Aio::waitable();
    pipe.recv(&aio);
    aio.wait().await;
    aio.result()?;
    Ok(aio.take_msg().expect("successful recv carries a message"))
}

#[tokio::test(flavor = "multi_thread")]
async fn queued_sends_complete_in_fifo_order() {
    let (_l, _d, dpipe, lpipe) = pair("inproc://order-fifo-send").await;

    let order: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
    let mut aios = Vec::new();
    for i in 0..8usize {
        let order = order.clone();
        let aio = Aio::new(move || {
            order.lock().push(i);
        });
        aio.set_msg(Message::from(format!("msg-{i}").as_bytes()));
        dpipe.send(&aio);
        aios.push(aio);
    }
    for aio in &aios {
        aio.wait().await;
        assert_eq!(aio.result(), Ok(()));
    }
    assert_eq!(*order.lock(), (0..8).collect::<Vec<_>>());

    // The wire preserves the same order.
    for i in 0..8usize {
        let msg = recv_msg(&lpipe).await.unwrap();
        assert_eq!(msg.body(), format!("msg-{i}").as_bytes());
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn queued_receives_complete_in_fifo_order() {
    let (_l, _d, dpipe, lpipe) = pair("inproc://order-fifo-recv").await;

    let mut rx_aios = Vec::new();
    for _ in 0..3 {
        let aio = Aio::waitable();
        lpipe.recv(&aio);
        rx_aios.push(aio);
    }
    for word in ["first", "second", "third"] {
        let aio = Aio::waitable();
        aio.set_msg(Message::from(word.as_bytes()));
        dpipe.send(&aio);
        aio.wait().await;
        assert_eq!(aio.result(), Ok(()));
    }
    for (aio, want) in rx_aios.iter().zip(["first", "second", "third"]) {
        aio.wait().await;
        assert_eq!(aio.result(), Ok(()));
        assert_eq!(aio.take_msg().unwrap().body(), want.as_bytes());
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn large_message_survives_partial_transfers() {
    let (_l, _d, dpipe, lpipe) = pair("inproc://order-large").await;

    // Larger than the in-process buffer, forcing several partial writes
    // and reads per frame.
    let payload: Vec<u8> = (0..300 * 1024).map(|i| (i % 251) as u8).collect();
    let aio = Aio::waitable();
    aio.set_msg(Message::from(&payload[..]));
    dpipe.send(&aio);

    let msg = recv_msg(&lpipe).await.unwrap();
    aio.wait().await;
    assert_eq!(aio.result(), Ok(()));
    assert_eq!(aio.count(), payload.len());
    assert_eq!(msg.body(), &payload[..]);
}

#[tokio::test(flavor = "multi_thread")]
async fn header_and_body_travel_as_one_frame() {
    let (_l, _d, dpipe, lpipe) = pair("inproc://order-hdr-body").await;

    let mut msg = Message::new();
    msg.push_header(b"HDR");
    msg.push_body(b"BODY");
    let aio = Aio::waitable();
    aio.set_msg(msg);
    dpipe.send(&aio);
    aio.wait().await;
    assert_eq!(aio.result(), Ok(()));
    assert_eq!(aio.count(), 7);

    let got = recv_msg(&lpipe).await.unwrap();
    assert_eq!(got.len(), 7);
    assert_eq!(got.body(), b"HDRBODY");
}

#[tokio::test(flavor = "multi_thread")]
async fn many_messages_round_trip_identically() {
    let (_l, _d, dpipe, lpipe) = pair("inproc://order-many").await;

    let sizes = [0usize, 1, 7, 8, 9, 255, 256, 1024, 65 * 1024];
    for (i, size) in sizes.iter().enumerate() {
        let payload: Vec<u8> = (0..*size).map(|b| (b ^ i) as u8).collect();
        let aio = Aio::waitable();
        aio.set_msg(Message::from(&payload[..]));
        dpipe.send(&aio);
        aio.wait().await;
        assert_eq!(aio.result(), Ok(()), "send of {size} bytes failed");

        let msg = recv_msg(&lpipe).await.unwrap();
        assert_eq!(msg.body(), &payload[..], "payload of {size} bytes mangled");
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn canceling_queued_send_leaves_the_wire_clean() {
    let (_l, _d, dpipe, lpipe) = pair("inproc://order-cancel-queued").await;

    // The head send is bigger than the in-process buffer and nobody is
    // reading yet, so it stays on the wire while the second request sits
    // queued behind it.
    let big: Vec<u8> = vec![0x5a; 200 * 1024];
    let head = Aio::waitable();
    head.set_msg(Message::from(&big[..]));
    dpipe.send(&head);

    let queued = Aio::waitable();
    queued.set_msg(Message::from(&b"queued"[..]));
    dpipe.send(&queued);
    queued.abort(Error::Canceled);
    queued.wait().await;
    assert_eq!(queued.result(), Err(Error::Canceled));

    // Draining the receiver completes the head transfer; the canceled
    // request left no half-frame behind.
    let msg = recv_msg(&lpipe).await.unwrap();
    assert_eq!(msg.len(), big.len());
    head.wait().await;
    assert_eq!(head.result(), Ok(()));

    let aio = Aio::waitable();
    aio.set_msg(Message::from(&b"after"[..]));
    dpipe.send(&aio);
    aio.wait().await;
    assert_eq!(aio.result(), Ok(()));
    let msg = recv_msg(&lpipe).await.unwrap();
    assert_eq!(msg.body(), b"after");
}
