//! End-to-end scenarios over `transport::shmem` (tag `shmem`): every
//! socket created by one `ShmemTransport` shares a backing region, and
//! a send publishes only `(offset, len)` pairs — the receiver builds
//! zero-copy `Message::InRegion` values directly over that region.

use devicemesh::interrupt::InterruptFlag;
use devicemesh::message::{Message, MultipartMessage};
use devicemesh::transport::shmem::ShmemTransport;
use devicemesh::transport::Transport;
use devicemesh::SocketType;

/// Scenario 1, replayed over the zero-copy transport: the received
/// message's bytes must match what was sent even though no owned copy
/// crossed the wire — they were read back out of the shared region.
#[tokio::test]
async fn push_pull_empty_then_text_over_shared_region() {
    let transport = ShmemTransport::new(InterruptFlag::new());

    let pull = transport.create_socket(SocketType::Pull);
    let bound = pull.bind("shmem://data").await.expect("bind");
    let push = transport.create_socket(SocketType::Push);
    push.connect(&bound).await.expect("connect");
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;

    push.send(Message::new_empty(), 1000).await.into_done().expect("send empty");
    push.send(Message::new_simple(*b"testdata1234"), 1000).await.into_done().expect("send text");

    let first = pull.receive(1000).await.into_done().expect("receive empty");
    assert_eq!(first.len(), 0);

    let second = pull.receive(1000).await.into_done().expect("receive text");
    assert_eq!(second.as_slice(), b"testdata1234");
    // The receiver's message is backed directly by the transport's
    // shared region, not a fresh owned allocation.
    assert!(second.region_tag().is_some());
}

/// Multi-part sends over shmem publish one `(offset, len)` per part and
/// must reassemble with the same count and order the sender issued.
#[tokio::test]
async fn multipart_send_preserves_order_and_count_over_shared_region() {
    let transport = ShmemTransport::new(InterruptFlag::new());
    let pull = transport.create_socket(SocketType::Pull);
    let bound = pull.bind("shmem://frames").await.expect("bind");
    let push = transport.create_socket(SocketType::Push);
    push.connect(&bound).await.expect("connect");
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;

    let mut parts = MultipartMessage::new();
    parts.push(Message::new_sized(4));
    parts.push(Message::new_simple(*b"abcdefgh"));
    parts.push(Message::new_sized(2));
    let sent_bytes = parts.total_bytes();
    assert_eq!(sent_bytes, 14);

    push.send_parts(parts, 1000).await.into_done().expect("send_parts");

    let received = pull.receive_parts(1000).await.into_done().expect("receive_parts");
    assert_eq!(received.len(), 3);
    assert_eq!(received.total_bytes(), sent_bytes);
    let lens: Vec<_> = received.iter().map(Message::len).collect();
    assert_eq!(lens, vec![4, 8, 2]);
    assert_eq!(received.iter().nth(1).unwrap().as_slice(), b"abcdefgh");
}

/// A bound `Pub`-like endpoint fans a single publish out to every
/// connected subscriber — the spec's PUB/SUB rendezvous depends on this:
/// both subscribers must observe the same published message.
#[tokio::test]
async fn bound_endpoint_fans_a_publish_out_to_every_connected_peer() {
    let transport = ShmemTransport::new(InterruptFlag::new());

    let publisher = transport.create_socket(SocketType::Pub);
    let bound = publisher.bind("shmem://fanout").await.expect("bind");

    let sub_a = transport.create_socket(SocketType::Sub);
    let sub_b = transport.create_socket(SocketType::Sub);
    sub_a.connect(&bound).await.expect("connect a");
    sub_b.connect(&bound).await.expect("connect b");
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;

    publisher.send(Message::new_simple(*b"update"), 1000).await.into_done().expect("publish");

    let a = sub_a.receive(1000).await.into_done().expect("subscriber a receives");
    let b = sub_b.receive(1000).await.into_done().expect("subscriber b receives");
    assert_eq!(a.as_slice(), b"update");
    assert_eq!(b.as_slice(), b"update");
}
