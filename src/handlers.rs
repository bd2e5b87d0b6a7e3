//! Request handlers for the DNS server.
//!
//! This module provides functions for handling DNS requests over UDP and TCP.
//! Both transports hand the raw query to [`lookup`] against the current
//! database generation and send back whatever it produces.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use metrics::increment_counter;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream, UdpSocket},
    sync::Semaphore,
    task,
    time::timeout,
};

use crate::config::ServerConfig;
use crate::db::Database;
use crate::dns::{rcode_of, MAX_MESSAGE_LEN, UDP_MAX_RESPONSE};
use crate::errors::DnsError;
use crate::lookup::lookup;

/// Resolve one query against the current generation.
///
/// # Returns
/// The response, empty if nothing should be sent.
fn answer(db: &Database, mut message: Vec<u8>, max_len: usize, client: IpAddr) -> Vec<u8> {
    let cdb = db.snapshot();
    let len = lookup(&cdb, &mut message, max_len, client);
    message.truncate(len);

    if let Some(rcode) = rcode_of(&message) {
        increment_counter!("dns_responses_total", "rcode" => rcode.as_str());
    }
    message
}

/// Run the UDP DNS server.
///
/// # Arguments
/// * `addr` - The address to bind to.
/// * `db` - The zone database.
/// * `config` - The server configuration.
///
/// # Returns
/// A `Result` indicating success or failure.
pub async fn run_udp_server(
    addr: SocketAddr,
    db: Arc<Database>,
    config: Arc<ServerConfig>,
) -> Result<(), DnsError> {
    let socket = UdpSocket::bind(addr).await?;
    info!("UDP DNS server listening on {}", addr);
    serve_udp(socket, db, config.udp_max_response).await
}

/// Answer queries arriving on an already bound socket.
pub async fn serve_udp(socket: UdpSocket, db: Arc<Database>, max_len: usize) -> Result<(), DnsError> {
    let socket = Arc::new(socket);
    let mut buf = vec![0u8; UDP_MAX_RESPONSE];

    loop {
        match socket.recv_from(&mut buf).await {
            Ok((amt, src)) => {
                let query = buf[..amt].to_vec();
                let socket = socket.clone();
                let db = db.clone();
                task::spawn(async move {
                    if let Err(e) = handle_udp_query(query, src, socket, db, max_len).await {
                        warn!("UDP query error: {}", e);
                    }
                });
            }
            Err(e) => error!("UDP receive error: {}", e),
        }
    }
}

/// Handle a UDP DNS query.
///
/// # Arguments
/// * `query` - The DNS query.
/// * `src` - The source address of the query.
/// * `socket` - The UDP socket to send the response on.
/// * `db` - The zone database.
/// * `max_len` - Largest response before truncation.
///
/// # Returns
/// A `Result` indicating success or failure.
pub async fn handle_udp_query(
    query: Vec<u8>,
    src: SocketAddr,
    socket: Arc<UdpSocket>,
    db: Arc<Database>,
    max_len: usize,
) -> Result<(), DnsError> {
    increment_counter!("dns_queries_total", "transport" => "udp");

    let response = answer(&db, query, max_len, src.ip());
    if response.is_empty() {
        debug!("No response for UDP query from {}", src);
        return Ok(());
    }

    socket.send_to(&response, src).await?;
    Ok(())
}

/// Run the TCP DNS server.
///
/// # Arguments
/// * `addr` - The address to bind to.
/// * `db` - The zone database.
/// * `config` - The server configuration.
///
/// # Returns
/// A `Result` indicating success or failure.
pub async fn run_tcp_server(
    addr: SocketAddr,
    db: Arc<Database>,
    config: Arc<ServerConfig>,
) -> Result<(), DnsError> {
    let listener = TcpListener::bind(addr).await?;
    info!("TCP DNS server listening on {}", addr);
    serve_tcp(listener, db, config.tcp_max_connections, config.tcp_idle_timeout).await
}

/// Accept connections on an already bound listener.
///
/// At most `max_connections` are served at once; connections beyond that
/// are closed as soon as they are accepted.
pub async fn serve_tcp(
    listener: TcpListener,
    db: Arc<Database>,
    max_connections: usize,
    idle: Duration,
) -> Result<(), DnsError> {
    let slots = Arc::new(Semaphore::new(max_connections));

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let permit = match slots.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        warn!("TCP connection limit reached, dropping {}", addr);
                        continue;
                    }
                };
                let db = db.clone();
                task::spawn(async move {
                    if let Err(e) = handle_tcp_connection(stream, addr, db, idle).await {
                        warn!("TCP connection error: {}", e);
                    }
                    drop(permit);
                });
            }
            Err(e) => error!("TCP accept error: {}", e),
        }
    }
}

/// Handle a TCP DNS connection.
///
/// Queries are read one after another until the client closes the
/// connection, goes idle for longer than `idle`, sends an empty frame, or
/// sends something that gets no answer.
///
/// # Arguments
/// * `stream` - The TCP stream.
/// * `addr` - The client address.
/// * `db` - The zone database.
/// * `idle` - How long to wait for each read.
///
/// # Returns
/// A `Result` indicating success or failure.
pub async fn handle_tcp_connection(
    mut stream: TcpStream,
    addr: SocketAddr,
    db: Arc<Database>,
    idle: Duration,
) -> Result<(), DnsError> {
    loop {
        let mut len_buf = [0u8; 2];
        match timeout(idle, stream.read_exact(&mut len_buf)).await {
            Ok(Ok(_)) => {}
            Ok(Err(_)) | Err(_) => break,
        }
        let len = u16::from_be_bytes(len_buf) as usize;
        if len == 0 {
            break;
        }

        let mut query = vec![0u8; len];
        match timeout(idle, stream.read_exact(&mut query)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                debug!("TCP client {} stalled mid-query", addr);
                break;
            }
        }

        increment_counter!("dns_queries_total", "transport" => "tcp");
        let response = answer(&db, query, MAX_MESSAGE_LEN, addr.ip());
        if response.is_empty() {
            debug!("No response for TCP query from {}, closing", addr);
            break;
        }
        send_tcp_response(&mut stream, &response).await?;
    }
    Ok(())
}

/// Write one length-prefixed message.
pub async fn send_tcp_response(stream: &mut TcpStream, response: &[u8]) -> Result<(), DnsError> {
    let len = u16::try_from(response.len())
        .map_err(|_| DnsError::resource("TCP response longer than 65535 bytes"))?;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(response).await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::cdb::{Cdb, CdbBuilder};
    use crate::dns::{Rcode, TYPE_A};
    use crate::zonefile::ZoneCompiler;

    fn database(zone: &str) -> Arc<Database> {
        let builder = CdbBuilder::new(Cursor::new(Vec::new())).unwrap();
        let mut compiler = ZoneCompiler::new(builder, 1);
        compiler.compile(zone.as_bytes()).unwrap();
        assert_eq!(compiler.failures(), 0);
        let image = compiler.into_sink().finish().unwrap().into_inner();
        Arc::new(Database::from_cdb("test.cdb", Cdb::from_bytes(image).unwrap()))
    }

    fn query(id: u16, name: &[u8], qtype: u16) -> Vec<u8> {
        let mut msg = id.to_be_bytes().to_vec();
        msg.extend_from_slice(&[1, 0, 0, 1, 0, 0, 0, 0, 0, 0]);
        msg.extend_from_slice(name);
        msg.extend_from_slice(&qtype.to_be_bytes());
        msg.extend_from_slice(&1u16.to_be_bytes());
        msg
    }

    const ZONE: &str = ".example.com:ns1.example.com:3600\n+www.example.com:192.0.2.1:300\n";
    const WWW: &[u8] = b"\x03www\x07example\x03com\x00";

    #[tokio::test]
    async fn test_udp_query() {
        let db = database(ZONE);
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = socket.local_addr().unwrap();
        let server = task::spawn(serve_udp(socket, db, UDP_MAX_RESPONSE));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(&query(0x1234, WWW, TYPE_A), server_addr).await.unwrap();

        let mut buf = [0u8; 512];
        let (len, _) = timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let response = &buf[..len];
        assert_eq!(&response[..2], &[0x12, 0x34]);
        assert_eq!(rcode_of(response), Some(Rcode::NoError));
        assert_eq!(&response[6..8], &[0, 1]);
        assert_eq!(&response[len - 4..], &[192, 0, 2, 1]);

        server.abort();
    }

    #[tokio::test]
    async fn test_tcp_multiple_queries_per_connection() {
        let db = database(ZONE);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server_addr = listener.local_addr().unwrap();
        let server = task::spawn(serve_tcp(listener, db, 4, Duration::from_secs(5)));

        let mut stream = TcpStream::connect(server_addr).await.unwrap();
        for id in [1u16, 2] {
            let msg = query(id, WWW, TYPE_A);
            stream.write_all(&(msg.len() as u16).to_be_bytes()).await.unwrap();
            stream.write_all(&msg).await.unwrap();

            let mut len_buf = [0u8; 2];
            stream.read_exact(&mut len_buf).await.unwrap();
            let mut response = vec![0u8; u16::from_be_bytes(len_buf) as usize];
            stream.read_exact(&mut response).await.unwrap();
            assert_eq!(u16::from_be_bytes([response[0], response[1]]), id);
            assert_eq!(rcode_of(&response), Some(Rcode::NoError));
        }

        // An empty frame ends the session.
        stream.write_all(&[0, 0]).await.unwrap();
        let mut rest = Vec::new();
        let read = timeout(Duration::from_secs(5), stream.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read, 0);

        server.abort();
    }

    #[tokio::test]
    async fn test_tcp_connection_limit() {
        let db = database(ZONE);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server_addr = listener.local_addr().unwrap();
        let server = task::spawn(serve_tcp(listener, db, 1, Duration::from_secs(5)));

        // The first connection holds the only slot.
        let mut first = TcpStream::connect(server_addr).await.unwrap();
        let msg = query(7, WWW, TYPE_A);
        first.write_all(&(msg.len() as u16).to_be_bytes()).await.unwrap();
        first.write_all(&msg).await.unwrap();
        let mut len_buf = [0u8; 2];
        first.read_exact(&mut len_buf).await.unwrap();

        let mut second = TcpStream::connect(server_addr).await.unwrap();
        let mut rest = Vec::new();
        let read = timeout(Duration::from_secs(5), second.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(read, 0);

        server.abort();
    }

    #[tokio::test]
    async fn test_tcp_idle_timeout_closes() {
        let db = database(ZONE);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server_addr = listener.local_addr().unwrap();
        let server = task::spawn(serve_tcp(listener, db, 4, Duration::from_millis(100)));

        let mut stream = TcpStream::connect(server_addr).await.unwrap();
        let mut rest = Vec::new();
        let read = timeout(Duration::from_secs(5), stream.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read, 0);

        server.abort();
    }

    #[test]
    fn test_unanswerable_query_gives_empty_response() {
        let db = database(ZONE);
        let mut msg = query(1, WWW, TYPE_A);
        msg[2] |= 0x80;
        assert!(answer(&db, msg, UDP_MAX_RESPONSE, "127.0.0.1".parse().unwrap()).is_empty());
        assert!(answer(&db, vec![0; 5], UDP_MAX_RESPONSE, "127.0.0.1".parse().unwrap()).is_empty());
    }
}
