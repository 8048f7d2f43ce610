use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use ::log::{debug, error};
use futures::future::{self, BoxFuture, FutureExt};
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, sleep_until, Instant};

use crate::error::SessionError;

/// Pause after a failed accept, e.g. when the process is out of file descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Accepts inbound connections forever and hands each one to `f` together with a clone
/// of `node`. `f` is expected to spawn; a failing connection never stops the loop.
pub async fn server_stream_handler<N>(
    listener: TcpListener,
    f: fn(TcpStream, SocketAddr, N),
    node: N,
) -> io::Result<()>
where
    N: Clone,
{
    loop {
        let (socket, client_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                error!("Accept error: {}", e);
                sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };
        debug!("Accepted connection from {}", client_addr);
        if let Err(e) = socket.set_nodelay(true) {
            debug!("Set nodelay for {} error: {}", client_addr, e);
        }
        f(socket, client_addr, node.clone());
    }
}

/// Per-direction byte rewriting applied by [`transfer`].
pub trait Transform: Send {
    /// Appends the bytes to forward for `input` to `out`. May append nothing while a
    /// codec waits for a complete unit.
    fn apply(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<(), SessionError>;
}

/// Forwards bytes unchanged.
pub struct Passthrough;

impl Transform for Passthrough {
    fn apply(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<(), SessionError> {
        out.extend_from_slice(input);
        Ok(())
    }
}

/// When bytes last moved through a relay, in either direction.
pub struct Activity {
    start: Instant,
    /// Microseconds after `start`.
    last: AtomicU64,
}

impl Activity {
    pub fn new() -> Activity {
        Activity {
            start: Instant::now(),
            last: AtomicU64::new(0),
        }
    }

    pub fn touch(&self) {
        let elapsed = self.start.elapsed().as_micros() as u64;
        self.last.fetch_max(elapsed, Ordering::Relaxed);
    }

    pub fn last(&self) -> Instant {
        self.start + Duration::from_micros(self.last.load(Ordering::Relaxed))
    }
}

/// Reads everything from one side of a proxied connection, runs it through `transform`
/// and writes the result to the other side. Every read is written out completely before
/// the next one, so the order of the stream is kept. `amt` counts bytes read; every read
/// and every partial write touches `activity`.
pub async fn transfer(
    mut reader: impl AsyncRead + Unpin,
    reader_addr: SocketAddr,
    mut writer: impl AsyncWrite + Unpin,
    writer_addr: SocketAddr,
    mut transform: impl Transform,
    amt: &AtomicU64,
    activity: &Activity,
) -> Result<(), SessionError> {
    let mut buf = vec![0u8; 8 * 1024];
    let mut out = Vec::with_capacity(buf.len());
    loop {
        let read_size = match reader.read(&mut buf).await {
            Ok(0) => {
                if let Err(e) = writer.shutdown().await {
                    debug!("Close {} error: {}", writer_addr, e);
                }
                return Ok(());
            }
            Ok(n) => n,
            Err(e) => {
                debug!("Read from {} error: {}", reader_addr, e);
                return Err(e.into());
            }
        };
        activity.touch();
        amt.fetch_add(read_size as u64, Ordering::Relaxed);

        out.clear();
        transform.apply(&buf[..read_size], &mut out)?;
        let mut written = 0;
        while written < out.len() {
            match writer.write(&out[written..]).await {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                Ok(n) => {
                    written += n;
                    activity.touch();
                }
                Err(e) => {
                    debug!("Write to {} error: {}", writer_addr, e);
                    return Err(e.into());
                }
            }
        }

        const MAX_LEN: usize = 1024 * 1024 * 2;

        if read_size >= buf.len() && buf.len() <= MAX_LEN {
            buf.resize(buf.len() * 2, 0);
            debug!(
                "Expand the read buffer size to {} for {}",
                buf.len(),
                reader_addr
            );
        }
    }
}

// Resolves with an error once `idle` has passed since the last activity.
async fn watchdog(idle: Duration, activity: &Activity) -> Result<(), SessionError> {
    loop {
        let deadline = activity.last() + idle;
        if Instant::now() >= deadline {
            return Err(SessionError::IdleTimeout(idle.as_secs()));
        }
        sleep_until(deadline).await;
    }
}

/// Pumps bytes both ways between `client` and `target` until either side closes or
/// fails, or until no byte has moved either way for `idle`. Both sockets are closed when
/// this returns; a half-closed connection is not kept alive. Returns the number of bytes
/// read from the client and from the target.
pub async fn relay(
    client: TcpStream,
    target: TcpStream,
    upstream: impl Transform,
    downstream: impl Transform,
    idle: Duration,
) -> Result<(u64, u64), SessionError> {
    let client_addr = client.peer_addr()?;
    let target_addr = target.peer_addr()?;
    let (c_read, c_write) = client.into_split();
    let (t_read, t_write) = target.into_split();

    let up = AtomicU64::new(0);
    let down = AtomicU64::new(0);
    let activity = Activity::new();
    let res = {
        let halves: Vec<BoxFuture<'_, Result<(), SessionError>>> = vec![
            transfer(c_read, client_addr, t_write, target_addr, upstream, &up, &activity).boxed(),
            transfer(t_read, target_addr, c_write, client_addr, downstream, &down, &activity)
                .boxed(),
            watchdog(idle, &activity).boxed(),
        ];
        let (res, _index, _rest) = future::select_all(halves).await;
        res
    };
    res?;
    Ok((up.into_inner(), down.into_inner()))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (a, b) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (a.unwrap(), b.unwrap().0)
    }

    struct Upper;

    impl Transform for Upper {
        fn apply(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<(), SessionError> {
            out.extend(input.iter().map(|b| b.to_ascii_uppercase()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn transfer_applies_transform_and_counts() {
        let (mut client, server_side) = pair().await;
        let (reader, mut input) = tokio::io::duplex(64);
        let amt = AtomicU64::new(0);
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();

        input.write_all(b"hello relay").await.unwrap();
        input.shutdown().await.unwrap();

        let activity = Activity::new();
        transfer(reader, addr, server_side, addr, Upper, &amt, &activity)
            .await
            .unwrap();
        assert_eq!(amt.load(Ordering::Relaxed), 11);

        let mut got = Vec::new();
        client.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"HELLO RELAY".to_vec());
    }

    #[tokio::test]
    async fn relay_closes_both_sides_when_one_closes() {
        let (mut client, client_side) = pair().await;
        let (mut target, target_side) = pair().await;

        let pump = tokio::spawn(relay(
            client_side,
            target_side,
            Passthrough,
            Passthrough,
            Duration::from_secs(30),
        ));

        client.write_all(b"request").await.unwrap();
        let mut buf = [0u8; 7];
        target.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"request");

        target.write_all(b"response").await.unwrap();
        let mut buf = [0u8; 8];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"response");

        drop(target);
        let (up, down) = pump.await.unwrap().unwrap();
        assert_eq!((up, down), (7, 8));

        // The client side is closed as well, not left half open.
        let mut rest = Vec::new();
        assert_eq!(client.read_to_end(&mut rest).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn relay_times_out_when_idle() {
        let (_client, client_side) = pair().await;
        let (_target, target_side) = pair().await;

        let res = relay(
            client_side,
            target_side,
            Passthrough,
            Passthrough,
            Duration::from_millis(50),
        )
        .await;
        assert!(matches!(res, Err(SessionError::IdleTimeout(_))));
    }

    #[tokio::test]
    async fn idle_window_counts_from_last_activity() {
        let (mut client, client_side) = pair().await;
        let (_target, target_side) = pair().await;
        let idle = Duration::from_millis(300);

        let pump = tokio::spawn(relay(client_side, target_side, Passthrough, Passthrough, idle));
        sleep(Duration::from_millis(50)).await;
        client.write_all(b"x").await.unwrap();
        let sent = Instant::now();

        let res = pump.await.unwrap();
        let quiet = sent.elapsed();
        assert!(matches!(res, Err(SessionError::IdleTimeout(_))));
        assert!(quiet >= idle - Duration::from_millis(5), "closed after {:?}", quiet);
        assert!(quiet < idle + Duration::from_millis(150), "closed after {:?}", quiet);
    }

    #[tokio::test]
    async fn steady_traffic_keeps_relay_open() {
        let (mut client, client_side) = pair().await;
        let (mut target, target_side) = pair().await;
        let idle = Duration::from_millis(200);

        let pump = tokio::spawn(relay(client_side, target_side, Passthrough, Passthrough, idle));
        let mut byte = [0u8; 1];
        for _ in 0..6 {
            sleep(Duration::from_millis(100)).await;
            client.write_all(b"x").await.unwrap();
            target.read_exact(&mut byte).await.unwrap();
        }
        assert!(!pump.is_finished());

        drop(client);
        assert_eq!(pump.await.unwrap().unwrap(), (6, 0));
    }
}
