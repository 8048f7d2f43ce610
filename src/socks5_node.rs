//! Plain SOCKS5 server (RFC 1928 CONNECT with RFC 1929 username/password).

use std::mem;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use ::log::{debug, info, warn};
use anyhow::Context;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use crate::error::SessionError;
use crate::server::{relay, server_stream_handler, Passthrough};
use crate::socks::{connect_target, v5, AddressError, AddressKind, TargetAddress};

/// Reply to a CONNECT request. `BND.ADDR`/`BND.PORT` are always 0.0.0.0:0.
fn connect_reply(rep: u8) -> Result<Vec<u8>, SessionError> {
    let mut reply = vec![v5::VERSION, rep, 0];
    TargetAddress::new(AddressKind::Ipv4, "0.0.0.0", 0).encode(&mut reply)?;
    Ok(reply)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    MethodNegotiation,
    Authenticating,
    Requesting,
    Relaying,
    Closed,
}

impl Stage {
    fn name(&self) -> &'static str {
        match self {
            Stage::MethodNegotiation => "negotiating methods",
            Stage::Authenticating => "authenticating",
            Stage::Requesting => "requesting",
            Stage::Relaying => "relaying",
            Stage::Closed => "closed",
        }
    }
}

#[derive(Debug)]
pub enum Event<'a> {
    ClientData(&'a [u8]),
    Connected,
    DialFailed,
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
    SendClient(Vec<u8>),
    Dial(TargetAddress),
    Close,
}

/// Handshake state for one SOCKS5 client. Input may arrive in any fragmentation; bytes
/// are buffered until a whole message is available, and anything after the CONNECT
/// request is kept for the target.
pub struct Socks5Session {
    stage: Stage,
    username: Arc<str>,
    password: Arc<str>,
    buf: Vec<u8>,
    target: Option<TargetAddress>,
    reason: Option<SessionError>,
}

impl Socks5Session {
    pub fn new(username: Arc<str>, password: Arc<str>) -> Socks5Session {
        Socks5Session {
            stage: Stage::MethodNegotiation,
            username,
            password,
            buf: Vec::new(),
            target: None,
            reason: None,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn handle(&mut self, event: Event<'_>) -> Result<Vec<Effect>, SessionError> {
        let res = self.step(event);
        if res.is_err() {
            self.stage = Stage::Closed;
        }
        res
    }

    /// Client bytes that followed the CONNECT request, to be written to the target
    /// before relaying.
    pub fn take_early_data(&mut self) -> Vec<u8> {
        mem::take(&mut self.buf)
    }

    /// Why the session emitted [`Effect::Close`] after sending its reply.
    pub fn close_reason(&mut self) -> SessionError {
        self.reason
            .take()
            .unwrap_or_else(|| SessionError::violation("session closed"))
    }

    fn step(&mut self, event: Event<'_>) -> Result<Vec<Effect>, SessionError> {
        match (self.stage, event) {
            (Stage::MethodNegotiation, Event::ClientData(data))
            | (Stage::Authenticating, Event::ClientData(data))
            | (Stage::Requesting, Event::ClientData(data)) => {
                self.buf.extend_from_slice(data);
                self.advance()
            }
            (Stage::Requesting, Event::Connected) if self.target.is_some() => {
                self.stage = Stage::Relaying;
                Ok(vec![Effect::SendClient(connect_reply(v5::REP_SUCCEEDED)?)])
            }
            (Stage::Requesting, Event::DialFailed) if self.target.is_some() => {
                let reply = connect_reply(v5::REP_GENERAL_FAILURE)?;
                Ok(self.close_with(reply, None))
            }
            (Stage::Closed, _) => Ok(Vec::new()),
            (_, Event::Closed) => {
                self.stage = Stage::Closed;
                Ok(vec![Effect::Close])
            }
            (stage, event) => Err(SessionError::InvalidTransition {
                stage: stage.name(),
                event: event.name(),
            }),
        }
    }

    // Consumes every complete message in the buffer.
    fn advance(&mut self) -> Result<Vec<Effect>, SessionError> {
        let mut effects = Vec::new();
        while self.target.is_none() && self.stage != Stage::Closed {
            let used = match self.stage {
                Stage::MethodNegotiation => self.negotiate(&mut effects)?,
                Stage::Authenticating => self.authenticate(&mut effects)?,
                Stage::Requesting => self.request(&mut effects)?,
                Stage::Relaying | Stage::Closed => None,
            };
            match used {
                Some(n) => {
                    self.buf.drain(..n);
                }
                None => break,
            }
        }
        Ok(effects)
    }

    fn negotiate(&mut self, effects: &mut Vec<Effect>) -> Result<Option<usize>, SessionError> {
        if self.buf.len() < 2 {
            return Ok(None);
        }
        if self.buf[0] != v5::VERSION {
            return Err(SessionError::violation(format!(
                "unknown version {}",
                self.buf[0]
            )));
        }
        let len = 2 + self.buf[1] as usize;
        let offered = match self.buf.get(2..len) {
            Some(methods) => methods.contains(&v5::METH_USER_PASS),
            None => return Ok(None),
        };
        if offered {
            self.stage = Stage::Authenticating;
            effects.push(Effect::SendClient(vec![v5::VERSION, v5::METH_USER_PASS]));
        } else {
            let reason = SessionError::violation("no supported method given");
            let reply = vec![v5::VERSION, v5::METH_NO_ACCEPTABLE];
            effects.extend(self.close_with(reply, Some(reason)));
        }
        Ok(Some(len))
    }

    fn authenticate(&mut self, effects: &mut Vec<Effect>) -> Result<Option<usize>, SessionError> {
        if self.buf.len() < 2 {
            return Ok(None);
        }
        if self.buf[0] != v5::AUTH_VERSION {
            return Err(SessionError::violation(format!(
                "unknown auth version {}",
                self.buf[0]
            )));
        }
        let ulen = self.buf[1] as usize;
        let plen = match self.buf.get(2 + ulen) {
            Some(&plen) => plen as usize,
            None => return Ok(None),
        };
        let len = 3 + ulen + plen;
        if self.buf.len() < len {
            return Ok(None);
        }
        let user = &self.buf[2..2 + ulen];
        let pass = &self.buf[3 + ulen..len];

        // Both comparisons always run.
        let user_ok = constant_time_eq(user, self.username.as_bytes());
        let pass_ok = constant_time_eq(pass, self.password.as_bytes());
        if user_ok & pass_ok {
            self.stage = Stage::Requesting;
            effects.push(Effect::SendClient(vec![v5::AUTH_VERSION, v5::AUTH_SUCCESS]));
        } else {
            let reason = SessionError::AuthFailed(String::from_utf8_lossy(user).into_owned());
            let reply = vec![v5::AUTH_VERSION, v5::AUTH_FAILURE];
            effects.extend(self.close_with(reply, Some(reason)));
        }
        Ok(Some(len))
    }

    fn request(&mut self, effects: &mut Vec<Effect>) -> Result<Option<usize>, SessionError> {
        if self.buf.len() < 3 {
            return Ok(None);
        }
        if self.buf[0] != v5::VERSION {
            return Err(SessionError::violation("didn't confirm with v5 version"));
        }
        if self.buf[1] != v5::CMD_CONNECT {
            let reason = SessionError::violation(format!("unsupported command {}", self.buf[1]));
            effects.extend(self.close_with(
                vec![v5::VERSION, v5::REP_COMMAND_NOT_SUPPORTED],
                Some(reason),
            ));
            return Ok(Some(self.buf.len()));
        }
        match TargetAddress::decode(&self.buf[3..]) {
            Ok((target, used)) => {
                self.target = Some(target.clone());
                effects.push(Effect::Dial(target));
                Ok(Some(3 + used))
            }
            Err(AddressError::Truncated) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn close_with(&mut self, reply: Vec<u8>, reason: Option<SessionError>) -> Vec<Effect> {
        self.stage = Stage::Closed;
        self.reason = reason;
        vec![Effect::SendClient(reply), Effect::Close]
    }
}

/// Compares without an early exit on the first differing byte.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[derive(Clone)]
pub struct Socks5Node {
    username: Arc<str>,
    password: Arc<str>,
    idle: Duration,
}

impl Socks5Node {
    pub fn new(username: &str, password: &str, timeout_secs: u64) -> Socks5Node {
        Socks5Node {
            username: username.into(),
            password: password.into(),
            idle: Duration::from_secs(timeout_secs),
        }
    }

    async fn serve(&self, mut conn: TcpStream) -> Result<(u64, u64, TargetAddress), SessionError> {
        let mut session = Socks5Session::new(self.username.clone(), self.password.clone());
        let mut buf = [0u8; 1024];

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
            let mut dial = None;
            for effect in session.handle(Event::ClientData(&buf[..n]))? {
                match effect {
                    Effect::SendClient(bytes) => conn.write_all(&bytes).await?,
                    Effect::Dial(target) => dial = Some(target),
                    Effect::Close => return Err(session.close_reason()),
                }
            }
            if let Some(target) = dial {
                break target;
            }
        };

        debug!("proxy request {:?} -> {}", conn.peer_addr(), target_addr);
        let mut target = match connect_target(&target_addr).await {
            Ok(target) => target,
            Err(e) => {
                for effect in session.handle(Event::DialFailed)? {
                    if let Effect::SendClient(bytes) = effect {
                        conn.write_all(&bytes).await?;
                    }
                }
                return Err(SessionError::Dial {
                    target: target_addr.to_string(),
                    source: e,
                });
            }
        };

        for effect in session.handle(Event::Connected)? {
            if let Effect::SendClient(bytes) = effect {
                conn.write_all(&bytes).await?;
            }
        }
        let early = session.take_early_data();
        if !early.is_empty() {
            target.write_all(&early).await?;
        }

        let (up, down) = relay(conn, target, Passthrough, Passthrough, self.idle).await?;
        Ok((up, down, target_addr))
    }
}

fn concate_conn(conn: TcpStream, client_addr: SocketAddr, node: Arc<Socks5Node>) {
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

pub async fn start_socks5_mode(listen_addr: SocketAddr, node: Socks5Node) -> anyhow::Result<()> {
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", listen_addr))?;
    info!(
        "SOCKS5 listening on {}, user {}, timeout {}s",
        listen_addr,
        node.username,
        node.idle.as_secs()
    );
    server_stream_handler(listener, concate_conn, Arc::new(node)).await?;
    Ok(())
}
