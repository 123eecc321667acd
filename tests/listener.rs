use bytes::Bytes;
use framewire::{
    setup_local_tracing, ConnectionSession, ListenerSession, NetworkConfig, SessionConfig,
    SessionEvent,
};
use rstest::{fixture, rstest};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::time::{timeout, Duration};

#[fixture]
#[once]
fn setup() {
    setup_local_tracing().expect("failed to setup tracing");
}

fn loopback() -> NetworkConfig {
    NetworkConfig {
        ip: "127.0.0.1".to_string(),
        port: 0,
        ..NetworkConfig::default()
    }
}

fn session_config() -> SessionConfig {
    SessionConfig {
        keepalive_interval_ms: 0,
        ..SessionConfig::default()
    }
}

async fn next_packet(session: &mut ConnectionSession) -> Bytes {
    loop {
        match session.next_event().await {
            Some(SessionEvent::PacketArrived(payload)) => return payload,
            Some(SessionEvent::WriteCompleted { result: Ok(()), .. }) => continue,
            other => panic!("expected a packet, got {:?}", other),
        }
    }
}

#[rstest]
#[tokio::test]
async fn accepted_session_receives_ping(_setup: ()) {
    let handle = Handle::current();
    let mut listener = ListenerSession::bind(&loopback(), session_config(), &handle)
        .await
        .unwrap();
    let mut client = ConnectionSession::connect(listener.local_addr(), &session_config(), &handle)
        .await
        .unwrap();
    let mut server = listener.next_connection().await.unwrap().unwrap();
    assert!(server.peer_addr().is_some());

    client.write_packet(&b"PING"[..], None).unwrap();
    assert_eq!(next_packet(&mut server).await, Bytes::from_static(b"PING"));

    server.write_packet(&b"PONG"[..], None).unwrap();
    assert_eq!(next_packet(&mut client).await, Bytes::from_static(b"PONG"));
}

#[rstest]
#[tokio::test]
async fn raw_peer_sees_little_endian_prefix(_setup: ()) {
    let mut listener = ListenerSession::bind(&loopback(), session_config(), &Handle::current())
        .await
        .unwrap();
    let mut raw = TcpStream::connect(listener.local_addr()).await.unwrap();
    let server = listener.next_connection().await.unwrap().unwrap();

    server.write_packet(&b"PING"[..], None).unwrap();

    let mut frame = [0u8; 8];
    raw.read_exact(&mut frame).await.unwrap();
    assert_eq!(frame, [0x04, 0x00, 0x00, 0x00, b'P', b'I', b'N', b'G']);
}

#[rstest]
#[tokio::test]
async fn split_prefix_over_tcp_is_reassembled(_setup: ()) {
    let mut listener = ListenerSession::bind(&loopback(), session_config(), &Handle::current())
        .await
        .unwrap();
    let mut raw = TcpStream::connect(listener.local_addr()).await.unwrap();
    raw.set_nodelay(true).unwrap();
    let mut server = listener.next_connection().await.unwrap().unwrap();

    raw.write_all(&[0x04, 0x00, 0x00]).await.unwrap();
    raw.flush().await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    raw.write_all(&[0x00, b'P', b'I', b'N', b'G']).await.unwrap();

    assert_eq!(next_packet(&mut server).await, Bytes::from_static(b"PING"));
}

#[rstest]
#[tokio::test]
async fn closed_listener_leaves_sessions_running(_setup: ()) {
    let handle = Handle::current();
    let mut listener = ListenerSession::bind(&loopback(), session_config(), &handle)
        .await
        .unwrap();
    let mut client = ConnectionSession::connect(listener.local_addr(), &session_config(), &handle)
        .await
        .unwrap();
    let mut server = listener.next_connection().await.unwrap().unwrap();

    listener.close();
    assert!(listener.is_closed());
    assert!(listener.next_connection().await.is_none());

    client.write_packet(&b"still here"[..], None).unwrap();
    assert_eq!(
        next_packet(&mut server).await,
        Bytes::from_static(b"still here")
    );
}

#[rstest]
#[tokio::test]
async fn zero_connection_limit_is_refused(_setup: ()) {
    let network = NetworkConfig {
        max_connections: 0,
        ..loopback()
    };
    assert!(
        ListenerSession::bind(&network, session_config(), &Handle::current())
            .await
            .is_err()
    );
}

#[rstest]
#[tokio::test]
async fn accept_is_rearmed_for_every_arrival(_setup: ()) {
    let handle = Handle::current();
    let mut listener = ListenerSession::bind(&loopback(), session_config(), &handle)
        .await
        .unwrap();

    let mut clients = Vec::new();
    let mut servers = Vec::new();
    for _ in 0..3 {
        clients.push(
            ConnectionSession::connect(listener.local_addr(), &session_config(), &handle)
                .await
                .unwrap(),
        );
        servers.push(listener.next_connection().await.unwrap().unwrap());
    }

    let ids: Vec<u64> = servers.iter().map(|server| server.id()).collect();
    assert!(ids[0] < ids[1] && ids[1] < ids[2]);
    for (index, client) in clients.iter().enumerate() {
        client.write_packet(vec![index as u8 + 1], None).unwrap();
    }
    for (index, server) in servers.iter_mut().enumerate() {
        assert_eq!(next_packet(server).await[..], [index as u8 + 1]);
    }
}

#[rstest]
#[tokio::test]
async fn connection_limit_holds_back_arrivals_until_a_slot_frees(_setup: ()) {
    let handle = Handle::current();
    let network = NetworkConfig {
        max_connections: 1,
        ..loopback()
    };
    let mut listener = ListenerSession::bind(&network, session_config(), &handle)
        .await
        .unwrap();

    let _first_client =
        ConnectionSession::connect(listener.local_addr(), &session_config(), &handle)
            .await
            .unwrap();
    let mut first = listener.next_connection().await.unwrap().unwrap();

    // the handshake completes in the backlog, the accept itself waits for a slot
    let mut second_client =
        ConnectionSession::connect(listener.local_addr(), &session_config(), &handle)
            .await
            .unwrap();
    assert!(
        timeout(Duration::from_millis(200), listener.next_connection())
            .await
            .is_err()
    );

    first.close();

    let mut second = timeout(Duration::from_secs(5), listener.next_connection())
        .await
        .expect("second arrival after the slot was released")
        .unwrap()
        .unwrap();
    second_client.write_packet(&b"admitted"[..], None).unwrap();
    assert_eq!(
        next_packet(&mut second).await,
        Bytes::from_static(b"admitted")
    );
}

#[rstest]
#[tokio::test]
async fn dropping_an_open_session_closes_it(_setup: ()) {
    let handle = Handle::current();
    let mut listener = ListenerSession::bind(&loopback(), session_config(), &handle)
        .await
        .unwrap();
    let mut client = ConnectionSession::connect(listener.local_addr(), &session_config(), &handle)
        .await
        .unwrap();
    let server = listener.next_connection().await.unwrap().unwrap();

    drop(server);

    match timeout(Duration::from_secs(5), client.next_event()).await {
        Ok(Some(SessionEvent::RemoteClosed)) => {}
        other => panic!("expected remote close, got {:?}", other),
    }
}
