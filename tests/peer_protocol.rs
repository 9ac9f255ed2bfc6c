//! Integration tests for handshake exchange and message framing against a
//! real TCP loopback connection (no mocked transport).
use rs_torrent_client::peer::{Handshake, Message, PeerError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

async fn loopback_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connect = TcpStream::connect(addr);
    let accept = listener.accept();
    let (client, (server, _)) = tokio::join!(connect, accept);
    (client.unwrap(), server)
}

#[tokio::test]
async fn handshake_round_trips_over_a_real_socket() {
    let (mut client, mut server) = loopback_pair().await;

    let info_hash = [7u8; 20];
    let peer_id = [9u8; 20];
    let ours = Handshake::new(info_hash, peer_id);

    let write = client.write_all(&ours.serialize());
    let read = Handshake::read(&mut server);
    let (write_result, read_result) = tokio::join!(write, read);
    write_result.unwrap();

    let received = read_result.unwrap();
    assert_eq!(received.info_hash, info_hash);
    assert_eq!(received.peer_id, peer_id);
    assert!(received.supports_extended());
    received.validate(info_hash).unwrap();
}

#[tokio::test]
async fn handshake_with_bad_protocol_length_is_rejected() {
    let (mut client, mut server) = loopback_pair().await;

    let mut malformed = Handshake::new([1u8; 20], [2u8; 20]).serialize();
    malformed[0] = 18; // pstrlen must be 19

    let write = client.write_all(&malformed);
    let read = Handshake::read(&mut server);
    let (write_result, read_result) = tokio::join!(write, read);
    write_result.unwrap();

    assert!(matches!(read_result, Err(PeerError::BadProtocolLength(18))));
}

#[tokio::test]
async fn handshake_with_wrong_protocol_string_is_rejected() {
    let (mut client, mut server) = loopback_pair().await;

    let mut malformed = Handshake::new([1u8; 20], [2u8; 20]).serialize();
    malformed[1..20].copy_from_slice(b"NotBitTorrentProto!");

    let write = client.write_all(&malformed);
    let read = Handshake::read(&mut server);
    let (write_result, read_result) = tokio::join!(write, read);
    write_result.unwrap();

    assert!(matches!(read_result, Err(PeerError::BadProtocolString)));
}

/// Writes a message the way a `PeerSession` would (4-byte length prefix,
/// then body) and reads it back frame-by-frame on the other end.
#[tokio::test]
async fn message_frames_round_trip_over_a_real_socket() {
    let (mut client, mut server) = loopback_pair().await;

    let messages = vec![
        Message::Keepalive,
        Message::Unchoke,
        Message::Interested,
        Message::Have { piece_index: 42 },
        Message::Request {
            index: 0,
            begin: 0,
            length: 16384,
        },
        Message::Piece {
            index: 0,
            begin: 0,
            block: vec![0xab; 1024],
        },
    ];

    let to_send = messages.clone();
    let writer = tokio::spawn(async move {
        for message in &to_send {
            client.write_all(&message.to_bytes()).await.unwrap();
        }
    });

    for expected in &messages {
        let mut len_buf = [0u8; 4];
        server.read_exact(&mut len_buf).await.unwrap();
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut body = vec![0u8; len];
        server.read_exact(&mut body).await.unwrap();
        let parsed = Message::from_body(&body).unwrap();
        assert_eq!(&parsed, expected);
    }

    writer.await.unwrap();
}
