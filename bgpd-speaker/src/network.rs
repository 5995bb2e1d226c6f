//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::{Arc, PoisonError};
use std::task::{Context, Poll};

use bgpd_utils::Sender;
use bgpd_utils::ip::{AddressFamily, IpAddrKind};
use bgpd_utils::socket::{SocketOptions, TcpListener, TcpSocket, TcpStream};
use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use tokio::io::{
    AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf, ReadHalf,
    WriteHalf,
};
use tokio::sync::mpsc::error::SendError;
use tokio_util::codec::{Decoder, FramedRead};

use crate::error::{Error, IoError, NbrRxError};
use crate::fsm::TTL_MAX;
use crate::packet::codec::{CodecCxt, MessageCodec, SharedCodecCxt};
use crate::packet::message::Message;

// Size of the in-memory pipes.
const MEMORY_PIPE_SIZE: usize = 256 * 1024;

// Transport of a BGP session.
#[derive(Debug)]
pub enum Stream {
    Tcp(TcpStream),
    // In-process pipe, used to run sessions without sockets.
    Memory(DuplexStream),
}

// Addressing information of a transport connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct ConnInfo {
    pub local: Option<SocketAddr>,
    pub remote: SocketAddr,
}

// Established transport connection.
#[derive(Debug)]
pub struct Connection {
    pub stream: Stream,
    pub info: ConnInfo,
}

// Splits the received byte stream into BGP messages.
#[derive(Debug)]
pub struct MessageDecoder {
    codec: Arc<dyn MessageCodec>,
    cxt: SharedCodecCxt,
}

// Encodes and writes BGP messages.
#[derive(Debug)]
pub struct MessageWriter {
    stream: WriteHalf<Stream>,
    codec: Arc<dyn MessageCodec>,
    cxt: SharedCodecCxt,
}

// Message-oriented view of a connection.
#[derive(Debug)]
pub struct Session {
    pub reader: FramedRead<ReadHalf<Stream>, MessageDecoder>,
    pub writer: MessageWriter,
    pub cxt: SharedCodecCxt,
}

// ===== impl Stream =====

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            Stream::Memory(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Stream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            Stream::Memory(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            Stream::Memory(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            Stream::Memory(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

// ===== impl Connection =====

impl Connection {
    pub(crate) fn tcp(stream: TcpStream) -> Result<Connection, IoError> {
        // Obtain TCP connection address/port information.
        let local = stream.local_addr().map_err(IoError::TcpInfoError)?;
        let remote = stream.peer_addr().map_err(IoError::TcpInfoError)?;
        Ok(Connection {
            stream: Stream::Tcp(stream),
            info: ConnInfo {
                local: Some(local),
                remote,
            },
        })
    }

    // Creates a connection over an in-memory pipe. The returned stream is
    // the remote end of the pipe.
    pub fn memory(
        local: Option<SocketAddr>,
        remote: SocketAddr,
    ) -> (Connection, DuplexStream) {
        let (stream, remote_end) = tokio::io::duplex(MEMORY_PIPE_SIZE);
        let conn = Connection {
            stream: Stream::Memory(stream),
            info: ConnInfo { local, remote },
        };
        (conn, remote_end)
    }

    pub fn remote_addr(&self) -> IpAddr {
        self.info.remote.ip()
    }

    // Applies the session socket options to an accepted connection.
    pub(crate) fn init(
        &self,
        ttl: u8,
        min_ttl: Option<u8>,
    ) -> Result<(), std::io::Error> {
        let Stream::Tcp(stream) = &self.stream else {
            return Ok(());
        };
        let af = self.info.remote.address_family();

        // Set TTL.
        SocketOptions::set_ttl(stream, af, ttl)?;

        // Set TTL security check.
        if let Some(min_ttl) = min_ttl {
            SocketOptions::set_min_ttl(stream, af, min_ttl)?;
        }

        Ok(())
    }

    // Converts the connection into a message-oriented session.
    pub(crate) fn into_session(self, codec: Arc<dyn MessageCodec>) -> Session {
        let cxt = SharedCodecCxt::default();
        let (read_half, write_half) = tokio::io::split(self.stream);
        let decoder = MessageDecoder {
            codec: codec.clone(),
            cxt: cxt.clone(),
        };
        let writer = MessageWriter {
            stream: write_half,
            codec,
            cxt: cxt.clone(),
        };
        Session {
            reader: FramedRead::new(read_half, decoder),
            writer,
            cxt,
        }
    }
}

// ===== impl MessageDecoder =====

impl Decoder for MessageDecoder {
    type Item = Message;
    type Error = NbrRxError;

    fn decode(
        &mut self,
        src: &mut BytesMut,
    ) -> Result<Option<Message>, NbrRxError> {
        let Some(len) = self
            .codec
            .message_len(src)
            .map_err(NbrRxError::MsgDecodeError)?
        else {
            return Ok(None);
        };
        let data = src.split_to(len);
        let cxt = self.cxt.read().unwrap_or_else(PoisonError::into_inner);
        self.codec
            .decode(&data, &cxt)
            .map(Some)
            .map_err(NbrRxError::MsgDecodeError)
    }
}

// ===== impl MessageWriter =====

impl MessageWriter {
    pub(crate) async fn send(
        &mut self,
        msg: &Message,
    ) -> Result<(), std::io::Error> {
        let buf = {
            let cxt = self.cxt.read().unwrap_or_else(PoisonError::into_inner);
            self.codec.encode(msg, &cxt)
        };
        self.stream.write_all(&buf).await?;
        self.stream.flush().await
    }

    pub(crate) async fn shutdown(&mut self) {
        let _ = self.stream.shutdown().await;
    }
}

// ===== impl Session =====

impl Session {
    // Updates the codec state once the capabilities are negotiated.
    pub(crate) fn update_cxt(&self, cxt: CodecCxt) {
        *self.cxt.write().unwrap_or_else(PoisonError::into_inner) = cxt;
    }
}

// ===== global functions =====

pub(crate) fn listen_socket(
    addr: SocketAddr,
) -> Result<TcpListener, std::io::Error> {
    let af = addr.address_family();

    // Create TCP socket.
    let socket = socket(af)?;

    // Bind socket.
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;

    // GTSM Procedure: set TTL to max for outgoing packets.
    SocketOptions::set_ttl(&socket, af, TTL_MAX)?;

    // Convert the socket into a TcpListener.
    socket.listen(4096)
}

pub(crate) fn listen_socket_md5sig_update(
    listener: &TcpListener,
    nbr_addr: IpAddr,
    password: Option<&str>,
) {
    let sockaddr = SocketAddr::from((nbr_addr, 0));
    if let Err(error) =
        SocketOptions::set_md5_signature(listener, &sockaddr, password)
    {
        IoError::TcpAuthError(error).log();
    }
}

pub(crate) async fn listen_loop(
    listener: Arc<TcpListener>,
    tcp_acceptp: Sender<Connection>,
) -> Result<(), SendError<Connection>> {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => match Connection::tcp(stream) {
                Ok(conn) => {
                    tcp_acceptp.send(conn).await?;
                }
                Err(error) => {
                    error.log();
                }
            },
            Err(error) => {
                IoError::TcpAcceptError(error).log();
            }
        }
    }
}

pub(crate) async fn connect(
    remote_addr: SocketAddr,
    local_addr: Option<IpAddr>,
    ttl: u8,
    min_ttl: Option<u8>,
    password: Option<&str>,
) -> Result<Connection, Error> {
    let af = remote_addr.address_family();

    // Create TCP socket.
    let socket = socket(af).map_err(IoError::TcpSocketError)?;

    // Bind socket.
    if let Some(local_addr) = local_addr {
        let sockaddr = SocketAddr::from((local_addr, 0));
        socket
            .set_reuseaddr(true)
            .map_err(IoError::TcpSocketError)?;
        socket.bind(sockaddr).map_err(IoError::TcpSocketError)?;
    }

    // Set TTL.
    SocketOptions::set_ttl(&socket, af, ttl)
        .map_err(IoError::TcpSocketError)?;

    // Set TTL security check.
    if let Some(min_ttl) = min_ttl {
        SocketOptions::set_min_ttl(&socket, af, min_ttl)
            .map_err(IoError::TcpSocketError)?;
    }

    // Set the TCP MD5 password.
    if let Some(password) = password {
        SocketOptions::set_md5_signature(&socket, &remote_addr, Some(password))
            .map_err(IoError::TcpAuthError)?;
    }

    // Connect to remote address on the BGP port.
    let stream = socket
        .connect(remote_addr)
        .await
        .map_err(IoError::TcpConnectError)?;

    let conn = Connection::tcp(stream)?;
    Ok(conn)
}

// ===== helper functions =====

fn socket(af: AddressFamily) -> Result<TcpSocket, std::io::Error> {
    let socket = match af {
        AddressFamily::Ipv4 => TcpSocket::new_v4()?,
        AddressFamily::Ipv6 => {
            let socket = TcpSocket::new_v6()?;
            SocketOptions::set_ipv6_only(&socket, true)?;
            socket
        }
    };

    Ok(socket)
}

// ===== unit tests =====
