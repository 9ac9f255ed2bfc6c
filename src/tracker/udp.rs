//! UDP tracker client (BEP 15): a two-step connect/announce exchange over
//! a single UDP socket.
use crate::tracker::{PeerInfo, TrackerError, TrackerResult};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use rand::Rng;
use std::io::{Cursor, Read};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::debug;

const PROTOCOL_ID: u64 = 0x41727101980;
const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;

/// Result of a UDP tracker announce: the peer list plus the interval the
/// tracker reports (already in the same shape the HTTP client returns, so
/// callers can treat both uniformly).
pub struct UdpAnnounceResult {
    pub interval: Duration,
    pub peers: Vec<PeerInfo>,
}

/// Performs a BEP 15 connect+announce exchange against `tracker_addr`.
/// `send_hostname` controls whether the optional trailing hostname
/// extension is appended to the announce packet; most deployments omit it.
#[tracing::instrument(skip(info_hash, peer_id), level = "debug")]
pub async fn announce(
    tracker_addr: SocketAddr,
    tracker_host: &str,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    port: u16,
    per_attempt_timeout: Duration,
    send_hostname: bool,
) -> TrackerResult<UdpAnnounceResult> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(tracker_addr).await?;

    let transaction_id: u32 = rand::rng().random();
    let connection_id = connect(&socket, transaction_id, per_attempt_timeout).await?;

    let transaction_id: u32 = rand::rng().random();
    announce_step(
        &socket,
        connection_id,
        transaction_id,
        info_hash,
        peer_id,
        port,
        tracker_host,
        send_hostname,
        per_attempt_timeout,
    )
    .await
}

async fn connect(socket: &UdpSocket, transaction_id: u32, timeout: Duration) -> TrackerResult<u64> {
    let mut request = Vec::with_capacity(16);
    request.write_u64::<BigEndian>(PROTOCOL_ID).unwrap();
    request.write_u32::<BigEndian>(ACTION_CONNECT).unwrap();
    request.write_u32::<BigEndian>(transaction_id).unwrap();

    let response = send_and_recv(socket, &request, timeout).await?;
    let mut cur = Cursor::new(&response);
    let action = cur.read_u32::<BigEndian>().map_err(io_to_invalid)?;
    let got_transaction_id = cur.read_u32::<BigEndian>().map_err(io_to_invalid)?;
    let connection_id = cur.read_u64::<BigEndian>().map_err(io_to_invalid)?;

    if action != ACTION_CONNECT || got_transaction_id != transaction_id {
        return Err(TrackerError::InvalidResponse(
            "UDP connect response action/transaction_id mismatch".to_string(),
        ));
    }
    Ok(connection_id)
}

#[allow(clippy::too_many_arguments)]
async fn announce_step(
    socket: &UdpSocket,
    connection_id: u64,
    transaction_id: u32,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    port: u16,
    tracker_host: &str,
    send_hostname: bool,
    timeout: Duration,
) -> TrackerResult<UdpAnnounceResult> {
    let key: u32 = rand::rng().random();
    let mut request = Vec::with_capacity(98);
    request.write_u64::<BigEndian>(connection_id).unwrap();
    request.write_u32::<BigEndian>(ACTION_ANNOUNCE).unwrap();
    request.write_u32::<BigEndian>(transaction_id).unwrap();
    request.extend_from_slice(&info_hash);
    request.extend_from_slice(&peer_id);
    request.write_u64::<BigEndian>(0).unwrap(); // downloaded
    request.write_u64::<BigEndian>(0).unwrap(); // left
    request.write_u64::<BigEndian>(0).unwrap(); // uploaded
    request.write_u32::<BigEndian>(0).unwrap(); // event: none
    request.write_u32::<BigEndian>(0).unwrap(); // ip: default
    request.write_u32::<BigEndian>(key).unwrap();
    request.write_i32::<BigEndian>(-1).unwrap(); // num_want: default
    request.write_u16::<BigEndian>(port).unwrap();
    if send_hostname {
        let hostname = tracker_host.as_bytes();
        request.push(hostname.len() as u8);
        request.extend_from_slice(hostname);
    }

    let response = send_and_recv(socket, &request, timeout).await?;
    if response.len() < 20 {
        return Err(TrackerError::InvalidResponse(
            "UDP announce response shorter than fixed header".to_string(),
        ));
    }
    let mut cur = Cursor::new(&response);
    let action = cur.read_u32::<BigEndian>().map_err(io_to_invalid)?;
    let got_transaction_id = cur.read_u32::<BigEndian>().map_err(io_to_invalid)?;
    let interval = cur.read_u32::<BigEndian>().map_err(io_to_invalid)?;
    let _leechers = cur.read_u32::<BigEndian>().map_err(io_to_invalid)?;
    let _seeders = cur.read_u32::<BigEndian>().map_err(io_to_invalid)?;

    if action != ACTION_ANNOUNCE || got_transaction_id != transaction_id {
        return Err(TrackerError::InvalidResponse(
            "UDP announce response action/transaction_id mismatch".to_string(),
        ));
    }

    let mut peers = Vec::new();
    let mut entry = [0u8; 6];
    while cur.read_exact(&mut entry).is_ok() {
        let ip = Ipv4Addr::new(entry[0], entry[1], entry[2], entry[3]);
        let peer_port = u16::from_be_bytes([entry[4], entry[5]]);
        peers.push(PeerInfo {
            ip: IpAddr::V4(ip),
            port: peer_port,
            peer_id: None,
        });
    }

    Ok(UdpAnnounceResult {
        interval: Duration::from_secs(interval as u64),
        peers,
    })
}

async fn send_and_recv(socket: &UdpSocket, request: &[u8], timeout: Duration) -> TrackerResult<Vec<u8>> {
    socket.send(request).await?;
    let mut buf = vec![0u8; 65_535];
    let len = tokio::time::timeout(timeout, socket.recv(&mut buf))
        .await
        .map_err(|_| TrackerError::Timeout)??;
    buf.truncate(len);
    debug!(bytes = len, "received UDP tracker datagram");
    Ok(buf)
}

fn io_to_invalid(_: std::io::Error) -> TrackerError {
    TrackerError::InvalidResponse("UDP response truncated".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UdpSocket as TokioUdpSocket;

    #[tokio::test]
    async fn connect_accepts_mock_server_reply() {
        let server = TokioUdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        let client_task = tokio::spawn(async move {
            let client = TokioUdpSocket::bind("127.0.0.1:0").await.unwrap();
            client.connect(server_addr).await.unwrap();
            connect(&client, 0xdead_beef, Duration::from_secs(2)).await
        });

        let mut buf = [0u8; 16];
        let (len, peer_addr) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(len, 16);
        let mut cur = Cursor::new(&buf[..len]);
        let protocol_id = cur.read_u64::<BigEndian>().unwrap();
        assert_eq!(protocol_id, PROTOCOL_ID);
        let action = cur.read_u32::<BigEndian>().unwrap();
        assert_eq!(action, ACTION_CONNECT);
        let transaction_id = cur.read_u32::<BigEndian>().unwrap();

        let mut reply = Vec::new();
        reply.write_u32::<BigEndian>(ACTION_CONNECT).unwrap();
        reply.write_u32::<BigEndian>(transaction_id).unwrap();
        reply.write_u64::<BigEndian>(0x1122_3344_5566_7788).unwrap();
        server.send_to(&reply, peer_addr).await.unwrap();

        let connection_id = client_task.await.unwrap().unwrap();
        assert_eq!(connection_id, 0x1122_3344_5566_7788);
    }
}
