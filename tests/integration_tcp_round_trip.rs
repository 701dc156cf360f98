//! End-to-end scenarios over `transport::tcp` (tag `zeromq`): two
//! independent `TcpTransport` instances standing in for two peer
//! processes, talking over loopback TCP.

use devicemesh::channel::SocketType;
use devicemesh::interrupt::InterruptFlag;
use devicemesh::message::{Message, MultipartMessage};
use devicemesh::socket::Transfer;
use devicemesh::transport::tcp::TcpTransport;
use devicemesh::transport::Transport;

/// Scenario 1: PUSH sends an empty message then a text message on one
/// channel; PULL receives both, in order, with the expected sizes and
/// content.
#[tokio::test]
async fn push_pull_empty_then_text() {
    let pull_transport = TcpTransport::new(InterruptFlag::new());
    let push_transport = TcpTransport::new(InterruptFlag::new());

    let pull = pull_transport.create_socket(SocketType::Pull);
    let bound = pull.bind("tcp://127.0.0.1:0").await.expect("bind");

    let push = push_transport.create_socket(SocketType::Push);
    push.connect(&bound).await.expect("connect");

    // give the accept loop a moment to register the connection
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    match push.send(Message::new_empty(), 1000).await {
        Transfer::Done(n) => assert_eq!(n, 0),
        other => panic!("unexpected send result: {other:?}"),
    }
    match push.send(Message::new_simple(*b"testdata1234"), 1000).await {
        Transfer::Done(n) => assert_eq!(n, 12),
        other => panic!("unexpected send result: {other:?}"),
    }

    let first = pull.receive(1000).await;
    match first {
        Transfer::Done(msg) => assert_eq!(msg.len(), 0),
        other => panic!("unexpected receive result: {other:?}"),
    }

    let second = pull.receive(1000).await;
    match second {
        Transfer::Done(msg) => {
            assert_eq!(msg.len(), 12);
            assert_eq!(msg.as_slice(), b"testdata1234");
        }
        other => panic!("unexpected receive result: {other:?}"),
    }
}

/// Scenario 2: a requester sends "request", the replier receives it and
/// sends back "reply"; the requester receives the reply. Both sides
/// terminate cleanly (no hung tasks, no dropped bytes).
#[tokio::test]
async fn req_rep_round_trip() {
    let rep_transport = TcpTransport::new(InterruptFlag::new());
    let req_transport = TcpTransport::new(InterruptFlag::new());

    let rep = rep_transport.create_socket(SocketType::Rep);
    let bound = rep.bind("tcp://127.0.0.1:0").await.expect("bind");

    let req = req_transport.create_socket(SocketType::Req);
    req.connect(&bound).await.expect("connect");
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    let sent = req.send(Message::new_simple(*b"request"), 1000).await;
    assert!(matches!(sent, Transfer::Done(7)));

    let received = rep.receive(1000).await;
    let Transfer::Done(msg) = received else { panic!("replier did not receive request") };
    assert_eq!(msg.as_slice(), b"request");

    let replied = rep.send(Message::new_simple(*b"reply"), 1000).await;
    assert!(matches!(replied, Transfer::Done(5)));

    let reply = req.receive(1000).await;
    let Transfer::Done(msg) = reply else { panic!("requester did not receive reply") };
    assert_eq!(msg.as_slice(), b"reply");
}

/// A multi-part send over TCP is received as one multi-part message with
/// the same number of parts, in the same order — the wire framing must
/// not interleave or reorder parts from a single `send_parts` call.
#[tokio::test]
async fn multipart_send_preserves_order_and_count() {
    let pull_transport = TcpTransport::new(InterruptFlag::new());
    let push_transport = TcpTransport::new(InterruptFlag::new());

    let pull = pull_transport.create_socket(SocketType::Pull);
    let bound = pull.bind("tcp://127.0.0.1:0").await.expect("bind");
    let push = push_transport.create_socket(SocketType::Push);
    push.connect(&bound).await.expect("connect");
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    let mut parts = MultipartMessage::new();
    parts.push(Message::new_simple(1u8));
    parts.push(Message::new_simple(2u16));
    parts.push(Message::new_simple(3u32));
    push.send_parts(parts, 1000).await.into_done().expect("send_parts");

    let received = pull.receive_parts(1000).await.into_done().expect("receive_parts");
    assert_eq!(received.len(), 3);
    let bytes: Vec<_> = received.iter().map(|m| m.as_slice().to_vec()).collect();
    assert_eq!(bytes[0], 1u8.to_ne_bytes());
    assert_eq!(bytes[1], 2u16.to_ne_bytes());
    assert_eq!(bytes[2], 3u32.to_ne_bytes());
}
