//! Shadowsocks server side.
//!
//! Every connection is driven by an [`SsSession`]: a sans-io state machine that takes
//! [`Event`]s and answers with [`Effect`]s. The async driver in [`SsNode::serve`] only
//! performs reads, the outbound dial and writes, then hands both codec halves to the
//! relay pump once the session reaches `Relaying`.

use std::mem;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use ::log::{debug, info, warn};
use anyhow::Context;
use crypto::{CipherKey, Decrypt, Decryptor, Encrypt, Encryptor};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use crate::error::SessionError;
use crate::server::{relay, server_stream_handler, Transform};
use crate::socks::{connect_target, AddressError, TargetAddress};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Handshake,
    Relaying,
    Closed,
}

impl Stage {
    fn name(&self) -> &'static str {
        match self {
            Stage::Handshake => "handshake",
            Stage::Relaying => "relaying",
            Stage::Closed => "closed",
        }
    }
}

#[derive(Debug)]
pub enum Event<'a> {
    /// Raw bytes read from the client socket.
    ClientData(&'a [u8]),
    Connected,
    DialFailed,
    /// Either socket closed or failed.
    Closed,
}

impl Event<'_> {
    fn name(&self) -> &'static str {
        match self {
            Event::ClientData(_) => "client data",
            Event::Connected => "connected",
            Event::DialFailed => "dial failed",
            Event::Closed => "closed",
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Effect {
    Dial(TargetAddress),
    SendClient(Vec<u8>),
    SendTarget(Vec<u8>),
    Close,
}

/// Per-connection state: one decryptor for the client stream, one encryptor for the
/// reply stream, and the decrypted bytes received before the target is connected.
pub struct SsSession {
    stage: Stage,
    decryptor: Decryptor,
    encryptor: Encryptor,
    pending: Vec<u8>,
    target: Option<TargetAddress>,
}

impl SsSession {
    pub fn new(key: &CipherKey) -> Result<SsSession, SessionError> {
        Ok(SsSession {
            stage: Stage::Handshake,
            decryptor: key.decryptor()?,
            encryptor: key.encryptor()?,
            pending: Vec::new(),
            target: None,
        })
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Applies one event. Any error closes the session for good.
    pub fn handle(&mut self, event: Event<'_>) -> Result<Vec<Effect>, SessionError> {
        let res = self.step(event);
        if res.is_err() {
            self.stage = Stage::Closed;
        }
        res
    }

    fn step(&mut self, event: Event<'_>) -> Result<Vec<Effect>, SessionError> {
        match (self.stage, event) {
            (Stage::Handshake, Event::ClientData(data)) => {
                self.decryptor.decrypt(data, &mut self.pending)?;
                if self.target.is_some() {
                    // Dial in flight; keep everything for the target.
                    return Ok(Vec::new());
                }
                match TargetAddress::decode(&self.pending) {
                    Ok((target, used)) => {
                        self.pending.drain(..used);
                        self.target = Some(target.clone());
                        Ok(vec![Effect::Dial(target)])
                    }
                    Err(AddressError::Truncated) => Ok(Vec::new()),
                    Err(e) => Err(e.into()),
                }
            }
            (Stage::Handshake, Event::Connected) if self.target.is_some() => {
                self.stage = Stage::Relaying;
                let mut effects = Vec::new();
                if let Some(preamble) = self.encryptor.take_preamble() {
                    effects.push(Effect::SendClient(preamble));
                }
                if !self.pending.is_empty() {
                    effects.push(Effect::SendTarget(mem::take(&mut self.pending)));
                }
                Ok(effects)
            }
            (Stage::Handshake, Event::DialFailed) | (Stage::Handshake, Event::Closed)
            | (Stage::Relaying, Event::Closed) => {
                self.stage = Stage::Closed;
                Ok(vec![Effect::Close])
            }
            (Stage::Closed, _) => Ok(Vec::new()),
            (stage, event) => Err(SessionError::InvalidTransition {
                stage: stage.name(),
                event: event.name(),
            }),
        }
    }

    /// Hands the codec halves to the relay pump. Only valid while relaying.
    pub fn into_relay(self) -> Result<(Decryptor, Encryptor), SessionError> {
        match self.stage {
            Stage::Relaying => Ok((self.decryptor, self.encryptor)),
            stage => Err(SessionError::InvalidTransition {
                stage: stage.name(),
                event: "relay",
            }),
        }
    }
}

impl Transform for Decryptor {
    fn apply(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<(), SessionError> {
        Ok(self.decrypt(input, out)?)
    }
}

impl Transform for Encryptor {
    fn apply(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<(), SessionError> {
        Ok(self.encrypt(input, out)?)
    }
}

#[derive(Debug, Clone)]
pub struct SsNode {
    key: CipherKey,
    idle: Duration,
}

impl SsNode {
    /// Resolves the cipher method and derives the master key once for every session
    /// this node serves.
    pub fn new(password: &str, method: &str, timeout_secs: u64) -> Result<SsNode, SessionError> {
        Ok(SsNode {
            key: CipherKey::new(method, password)?,
            idle: Duration::from_secs(timeout_secs),
        })
    }

    async fn serve(&self, mut conn: TcpStream) -> Result<(u64, u64, TargetAddress), SessionError> {
        let mut session = SsSession::new(&self.key)?;
        let mut buf = vec![0u8; 8 * 1024];

        let target_addr = loop {
            let n = timeout(self.idle, conn.read(&mut buf))
                .await
                .map_err(|_| SessionError::IdleTimeout(self.idle.as_secs()))??;
            if n == 0 {
                let stage = session.stage();
                session.handle(Event::Closed)?;
                return Err(SessionError::violation(format!(
                    "client closed while {}",
                    stage.name()
                )));
            }
            let dial = session
                .handle(Event::ClientData(&buf[..n]))?
                .into_iter()
                .find_map(|effect| match effect {
                    Effect::Dial(target) => Some(target),
                    _ => None,
                });
            if let Some(target) = dial {
                break target;
            }
        };

        debug!("proxy request {:?} -> {}", conn.peer_addr(), target_addr);
        let mut target = match connect_target(&target_addr).await {
            Ok(target) => target,
            Err(e) => {
                session.handle(Event::DialFailed)?;
                return Err(SessionError::Dial {
                    target: target_addr.to_string(),
                    source: e,
                });
            }
        };

        for effect in session.handle(Event::Connected)? {
            match effect {
                Effect::SendClient(bytes) => conn.write_all(&bytes).await?,
                Effect::SendTarget(bytes) => target.write_all(&bytes).await?,
                Effect::Dial(_) | Effect::Close => {}
            }
        }

        let (decryptor, encryptor) = session.into_relay()?;
        let (up, down) = relay(conn, target, decryptor, encryptor, self.idle).await?;
        Ok((up, down, target_addr))
    }
}

fn concate_conn(conn: TcpStream, client_addr: SocketAddr, node: Arc<SsNode>) {
    tokio::spawn(async move {
        match node.serve(conn).await {
            Ok((a, b, addr)) => info!(
                "proxied {} -----> {}: {}/{} bytes",
                client_addr, addr, a, b,
            ),
            Err(e) => warn!("Error for {}: {}", client_addr, e),
        }
    });
}

pub async fn start_ss_mode(listen_addr: SocketAddr, node: SsNode) -> anyhow::Result<()> {
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", listen_addr))?;
    info!(
        "Shadowsocks listening on {}, method {}, timeout {}s",
        listen_addr,
        node.key.method(),
        node.idle.as_secs()
    );
    server_stream_handler(listener, concate_conn, Arc::new(node)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socks::AddressKind;
    use crypto::CryptoError;

    fn header(target: &TargetAddress) -> Vec<u8> {
        let mut buf = Vec::new();
        target.encode(&mut buf).unwrap();
        buf
    }

    /// What a client sends: its encrypted stream for `plain`.
    fn client_wire(key: &CipherKey, plain: &[&[u8]]) -> (Encryptor, Vec<Vec<u8>>) {
        let mut enc = key.encryptor().unwrap();
        let mut out = Vec::new();
        for (i, p) in plain.iter().enumerate() {
            let mut wire = Vec::new();
            if i == 0 {
                if let Some(pre) = enc.take_preamble() {
                    wire.extend(pre);
                }
            }
            enc.encrypt(p, &mut wire).unwrap();
            out.push(wire);
        }
        (enc, out)
    }

    #[test]
    fn aead_header_with_no_payload_dials_target() {
        let key = CipherKey::new("aes-256-gcm", "qwe123").unwrap();
        let target = TargetAddress::new(AddressKind::Ipv4, "93.184.216.34", 80);
        let (_, wire) = client_wire(&key, &[&header(&target)]);

        let mut session = SsSession::new(&key).unwrap();
        let effects = session.handle(Event::ClientData(&wire[0])).unwrap();
        assert_eq!(effects, vec![Effect::Dial(target)]);
        assert_eq!(session.stage(), Stage::Handshake);

        // AEAD replies carry their salt with the first frame, nothing to flush yet.
        assert_eq!(session.handle(Event::Connected).unwrap(), vec![]);
        assert_eq!(session.stage(), Stage::Relaying);
    }

    #[test]
    fn relay_halves_carry_bytes_both_ways() {
        let key = CipherKey::new("aes-256-gcm", "qwe123").unwrap();
        let target = TargetAddress::new(AddressKind::Ipv4, "93.184.216.34", 80);
        let (mut enc, wire) = client_wire(&key, &[&header(&target)]);

        let mut session = SsSession::new(&key).unwrap();
        session.handle(Event::ClientData(&wire[0])).unwrap();
        session.handle(Event::Connected).unwrap();
        // Once relaying, traffic goes through the codec halves, not the session.
        assert!(matches!(
            session.handle(Event::ClientData(b"x")),
            Err(SessionError::InvalidTransition { .. })
        ));

        let mut session = SsSession::new(&key).unwrap();
        session.handle(Event::ClientData(&wire[0])).unwrap();
        session.handle(Event::Connected).unwrap();
        let (mut upstream, mut downstream) = session.into_relay().unwrap();

        let mut typed = Vec::new();
        enc.encrypt(b"GET / HTTP/1.0\r\n\r\n", &mut typed).unwrap();
        let mut plain = Vec::new();
        upstream.apply(&typed, &mut plain).unwrap();
        assert_eq!(plain, b"GET / HTTP/1.0\r\n\r\n".to_vec());

        let mut reply = Vec::new();
        downstream.apply(b"HTTP/1.0 200 OK", &mut reply).unwrap();
        let mut dec = key.decryptor().unwrap();
        let mut plain = Vec::new();
        dec.decrypt(&reply, &mut plain).unwrap();
        assert_eq!(plain, b"HTTP/1.0 200 OK".to_vec());
    }

    #[test]
    fn relay_half_rejects_tampered_frame() {
        let key = CipherKey::new("chacha20-ietf-poly1305", "qwe123").unwrap();
        let target = TargetAddress::new(AddressKind::Ipv4, "1.2.3.4", 80);
        let (mut enc, wire) = client_wire(&key, &[&header(&target)]);
        let mut session = SsSession::new(&key).unwrap();
        session.handle(Event::ClientData(&wire[0])).unwrap();
        session.handle(Event::Connected).unwrap();
        let (mut upstream, _) = session.into_relay().unwrap();

        let mut typed = Vec::new();
        enc.encrypt(b"payload", &mut typed).unwrap();
        typed[3] ^= 1;
        assert!(matches!(
            upstream.apply(&typed, &mut Vec::new()),
            Err(SessionError::Crypto(CryptoError::FrameAuth))
        ));
    }

    #[test]
    fn header_split_across_reads() {
        let key = CipherKey::new("aes-128-gcm", "qwe123").unwrap();
        let target = TargetAddress::new(AddressKind::Domain, "example.com", 443);
        let hdr = header(&target);
        // Type and length byte first, domain and port later, then early payload.
        let (_, wire) = client_wire(&key, &[&hdr[..2], &hdr[2..], b"early"]);

        let mut session = SsSession::new(&key).unwrap();
        assert_eq!(session.handle(Event::ClientData(&wire[0])).unwrap(), vec![]);
        // Split the second frame mid-way as well.
        let (a, b) = wire[1].split_at(7);
        assert_eq!(session.handle(Event::ClientData(a)).unwrap(), vec![]);
        assert_eq!(
            session.handle(Event::ClientData(b)).unwrap(),
            vec![Effect::Dial(target)]
        );
        // Bytes arriving while dialing are kept for the target.
        assert_eq!(session.handle(Event::ClientData(&wire[2])).unwrap(), vec![]);
        assert_eq!(
            session.handle(Event::Connected).unwrap(),
            vec![Effect::SendTarget(b"early".to_vec())]
        );
    }

    #[test]
    fn payload_in_first_message_is_pending() {
        let key = CipherKey::new("chacha20-ietf-poly1305", "qwe123").unwrap();
        let target = TargetAddress::new(AddressKind::Ipv4, "1.2.3.4", 8080);
        let mut first = header(&target);
        first.extend_from_slice(b"hello");
        let (_, wire) = client_wire(&key, &[&first]);

        let mut session = SsSession::new(&key).unwrap();
        assert_eq!(
            session.handle(Event::ClientData(&wire[0])).unwrap(),
            vec![Effect::Dial(target)]
        );
        assert_eq!(
            session.handle(Event::Connected).unwrap(),
            vec![Effect::SendTarget(b"hello".to_vec())]
        );
    }

    #[test]
    fn unknown_address_type_closes() {
        let key = CipherKey::new("aes-256-gcm", "qwe123").unwrap();
        let (_, wire) = client_wire(&key, &[&[9, 1, 2, 3, 4, 0, 80]]);
        let mut session = SsSession::new(&key).unwrap();
        assert!(matches!(
            session.handle(Event::ClientData(&wire[0])),
            Err(SessionError::AddressParse(AddressError::UnknownType(9)))
        ));
        assert_eq!(session.stage(), Stage::Closed);
    }

    #[test]
    fn tampered_frame_closes() {
        let key = CipherKey::new("aes-256-gcm", "qwe123").unwrap();
        let target = TargetAddress::new(AddressKind::Ipv4, "1.2.3.4", 80);
        let (_, mut wire) = client_wire(&key, &[&header(&target)]);
        let last = wire[0].len() - 1;
        wire[0][last] ^= 0x80;

        let mut session = SsSession::new(&key).unwrap();
        assert!(matches!(
            session.handle(Event::ClientData(&wire[0])),
            Err(SessionError::Crypto(CryptoError::FrameAuth))
        ));
        assert_eq!(session.stage(), Stage::Closed);
        assert_eq!(session.handle(Event::ClientData(b"x")).unwrap(), vec![]);
    }

    #[test]
    fn dial_failure_closes() {
        let key = CipherKey::new("aes-256-gcm", "qwe123").unwrap();
        let target = TargetAddress::new(AddressKind::Ipv4, "1.2.3.4", 80);
        let (_, wire) = client_wire(&key, &[&header(&target)]);
        let mut session = SsSession::new(&key).unwrap();
        session.handle(Event::ClientData(&wire[0])).unwrap();
        assert_eq!(session.handle(Event::DialFailed).unwrap(), vec![Effect::Close]);
        assert_eq!(session.stage(), Stage::Closed);
        assert!(session.into_relay().is_err());
    }

    #[test]
    fn connected_before_header_is_rejected() {
        let key = CipherKey::new("aes-256-gcm", "qwe123").unwrap();
        let mut session = SsSession::new(&key).unwrap();
        assert!(matches!(
            session.handle(Event::Connected),
            Err(SessionError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn legacy_sends_iv_once_connected() {
        let key = CipherKey::new("aes-256-cfb", "qwe123").unwrap();
        let target = TargetAddress::new(AddressKind::Ipv4, "93.184.216.34", 80);
        let mut first = header(&target);
        first.extend_from_slice(b"payload");
        let (_, wire) = client_wire(&key, &[&first]);

        let mut session = SsSession::new(&key).unwrap();
        assert_eq!(
            session.handle(Event::ClientData(&wire[0])).unwrap(),
            vec![Effect::Dial(target)]
        );
        let effects = session.handle(Event::Connected).unwrap();
        assert_eq!(effects.len(), 2);
        assert!(matches!(&effects[0], Effect::SendClient(iv) if iv.len() == 16));
        assert_eq!(effects[1], Effect::SendTarget(b"payload".to_vec()));
    }

    #[test]
    fn legacy_short_first_message_closes() {
        let key = CipherKey::new("aes-128-cfb", "qwe123").unwrap();
        let mut session = SsSession::new(&key).unwrap();
        assert!(matches!(
            session.handle(Event::ClientData(&[0u8; 8])),
            Err(SessionError::Crypto(CryptoError::ShortIv { got: 8, need: 16 }))
        ));
        assert_eq!(session.stage(), Stage::Closed);
    }

    async fn echo_target() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut s, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = s.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    async fn start_node(method: &str) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let node = Arc::new(SsNode::new("qwe123", method, 5).unwrap());
        tokio::spawn(server_stream_handler(listener, concate_conn, node));
        addr
    }

    async fn read_plain(conn: &mut TcpStream, dec: &mut Decryptor, want: usize) -> Vec<u8> {
        let mut plain = Vec::new();
        let mut buf = [0u8; 1024];
        while plain.len() < want {
            let n = conn.read(&mut buf).await.unwrap();
            assert!(n > 0, "connection closed early");
            dec.decrypt(&buf[..n], &mut plain).unwrap();
        }
        plain
    }

    async fn end_to_end(method: &str) {
        let echo = echo_target().await;
        let server = start_node(method).await;
        let key = CipherKey::new(method, "qwe123").unwrap();

        let mut conn = TcpStream::connect(server).await.unwrap();
        let target = TargetAddress::new(AddressKind::Ipv4, "127.0.0.1", echo.port());
        let (mut enc, wire) = client_wire(&key, &[&header(&target)]);
        conn.write_all(&wire[0]).await.unwrap();

        let mut dec = key.decryptor().unwrap();
        for line in [&b"first line\n"[..], &b"second line\n"[..]] {
            let mut out = Vec::new();
            enc.encrypt(line, &mut out).unwrap();
            conn.write_all(&out).await.unwrap();
            assert_eq!(read_plain(&mut conn, &mut dec, line.len()).await, line.to_vec());
        }
    }

    #[tokio::test]
    async fn end_to_end_aead() {
        end_to_end("aes-256-gcm").await;
    }

    #[tokio::test]
    async fn end_to_end_legacy() {
        end_to_end("aes-256-cfb").await;
    }

    #[tokio::test]
    async fn wrong_password_is_dropped_without_reply() {
        let server = start_node("aes-256-gcm").await;
        let key = CipherKey::new("aes-256-gcm", "wrong").unwrap();
        let target = TargetAddress::new(AddressKind::Ipv4, "127.0.0.1", 9);
        let (_, wire) = client_wire(&key, &[&header(&target)]);

        let mut conn = TcpStream::connect(server).await.unwrap();
        conn.write_all(&wire[0]).await.unwrap();
        let mut rest = Vec::new();
        // Closed without any bytes; a reset is also acceptable.
        let n = conn.read_to_end(&mut rest).await.unwrap_or(0);
        assert_eq!(n, 0);
    }
}
