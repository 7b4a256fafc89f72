// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bounded pool of persistent connections to BIRD's line-oriented control
//! socket.
//!
//! Protocol: a request is a single line terminated by `\n`. A response is one
//! or more lines; the terminal line begins with a four-digit status code
//! followed by a space. Success codes of interest are `0002` (info), `0003`
//! (acknowledged) and `0018` (restart); `8xxx` is a runtime error and `9xxx`
//! a parse error.

use crate::error::Error;
use slog::{debug, warn, Logger};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::Semaphore;
use wren_common::lock;

const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

struct Conn {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Conn {
    async fn dial(path: &Path) -> Result<Self, Error> {
        let stream =
            tokio::time::timeout(DIAL_TIMEOUT, UnixStream::connect(path))
                .await
                .map_err(|_| Error::DialTimeout)??;
        let (rx, tx) = stream.into_split();
        let mut conn = Conn {
            reader: BufReader::new(rx),
            writer: tx,
        };
        // BIRD greets every connection; consume the welcome banner.
        conn.read_response().await?;
        Ok(conn)
    }

    async fn send(&mut self, cmd: &str) -> Result<(), Error> {
        self.writer.write_all(cmd.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        Ok(())
    }

    /// Accumulate lines until the terminator: a line whose fifth character is
    /// a space (four-digit code + space). Everything read, terminator
    /// included, is returned.
    async fn read_response(&mut self) -> Result<String, Error> {
        let mut out = String::new();
        loop {
            let mut line = String::new();
            let n = self.reader.read_line(&mut line).await?;
            if n == 0 {
                return Err(Error::UnexpectedEof);
            }
            let terminal = is_final_line(&line);
            out.push_str(&line);
            if terminal {
                return Ok(out);
            }
        }
    }
}

fn is_final_line(line: &str) -> bool {
    let b = line.as_bytes();
    b.len() >= 5 && b[4] == b' '
}

fn is_error_line(line: &str) -> bool {
    let b = line.as_bytes();
    b.len() >= 4
        && (b[0] == b'8' || b[0] == b'9')
        && b[..4].iter().all(|c| c.is_ascii_digit())
}

pub struct Pool {
    socket_path: PathBuf,
    max_size: usize,
    idle: Mutex<Vec<Conn>>,
    slots: Arc<Semaphore>,
    closed: AtomicBool,
    log: Logger,
}

impl Pool {
    /// Open a pool with `initial_size` eagerly dialed connections. A dial
    /// failure here is fatal to the caller.
    pub async fn connect(
        socket_path: impl Into<PathBuf>,
        initial_size: usize,
        max_size: usize,
        log: Logger,
    ) -> Result<Self, Error> {
        let socket_path = socket_path.into();
        let max_size = max_size.max(initial_size).max(1);
        let mut idle = Vec::with_capacity(initial_size);
        for _ in 0..initial_size {
            idle.push(Conn::dial(&socket_path).await?);
        }
        Ok(Self {
            socket_path,
            max_size,
            idle: Mutex::new(idle),
            slots: Arc::new(Semaphore::new(max_size)),
            closed: AtomicBool::new(false),
            log,
        })
    }

    /// Run one command and return the complete response.
    ///
    /// A connection is acquired for the duration of the call and never shared
    /// with another caller. On an I/O or framing error the connection is
    /// discarded and the command is retried once on a fresh connection.
    pub async fn execute(&self, cmd: &str) -> Result<String, Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::PoolClosed);
        }
        let _permit = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::PoolClosed)?;

        let mut conn = match self.take_idle() {
            Some(conn) => conn,
            None => Conn::dial(&self.socket_path).await?,
        };

        match Self::round_trip(&mut conn, cmd).await {
            Ok(resp) => {
                self.release(conn);
                Ok(resp)
            }
            Err(e) => {
                drop(conn);
                warn!(
                    self.log,
                    "connection error, retrying on a fresh connection: {e}"
                );
                let mut fresh = Conn::dial(&self.socket_path).await?;
                let resp = Self::round_trip(&mut fresh, cmd).await?;
                self.release(fresh);
                Ok(resp)
            }
        }
    }

    async fn round_trip(conn: &mut Conn, cmd: &str) -> Result<String, Error> {
        conn.send(cmd).await?;
        conn.read_response().await
    }

    fn take_idle(&self) -> Option<Conn> {
        lock!(self.idle).pop()
    }

    fn release(&self, conn: Conn) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let mut idle = lock!(self.idle);
        if idle.len() < self.max_size {
            idle.push(conn);
        }
    }

    /// Trigger a configuration reload and classify the textual outcome.
    pub async fn configure(&self) -> Result<(), Error> {
        let result = self.execute("configure").await?;
        if result.contains("Reconfigured")
            || result.contains("Reconfiguration in progress")
            || result.lines().any(|l| {
                l.starts_with("0003 ")
                    || l.starts_with("0018 ")
                    || l.starts_with("0002-")
            })
        {
            return Ok(());
        }
        if let Some(line) = result.lines().find(|l| is_error_line(l)) {
            return Err(Error::ConfigureFailed(line.to_string()));
        }
        debug!(
            self.log,
            "configure response assumed success: {}",
            result.trim()
        );
        Ok(())
    }

    pub async fn show_protocols(&self) -> Result<String, Error> {
        self.execute("show protocols").await
    }

    /// Mark the pool closed and drop all idle connections. Connections still
    /// checked out are closed on release instead of returning to the pool.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.slots.close();
        lock!(self.idle).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::net::UnixListener;

    /// Minimal fake of the BIRD control socket. Greets each connection and
    /// answers a couple of commands; `flaky_first` makes the first accepted
    /// connection die right after the welcome banner.
    fn fake_bird(
        listener: UnixListener,
        flaky_first: bool,
    ) -> Arc<AtomicUsize> {
        let conns = Arc::new(AtomicUsize::new(0));
        let counter = conns.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let n = counter.fetch_add(1, Ordering::SeqCst);
                let die = flaky_first && n == 0;
                tokio::spawn(async move {
                    let (rx, mut tx) = stream.into_split();
                    let mut lines = BufReader::new(rx).lines();
                    if tx
                        .write_all(b"0001 BIRD 3.0.0 ready.\n")
                        .await
                        .is_err()
                    {
                        return;
                    }
                    if die {
                        return;
                    }
                    while let Ok(Some(line)) = lines.next_line().await {
                        let reply: &[u8] = match line.as_str() {
                            "configure" => {
                                b"0002-Reading configuration from /etc/bird/bird.conf\n0003 Reconfigured\n"
                            }
                            "show protocols" => {
                                b"2002-Name       Proto      Table      State  Since         Info\n1002-dn42_4242420123 BGP        ---        up     10:47:27      Established\n1002-static1    Static     master4    up     10:45:01      \n0000 \n"
                            }
                            "broken" => b"8003 Could not parse\n",
                            _ => b"0000 \n",
                        };
                        if tx.write_all(reply).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });
        conns
    }

    fn test_log() -> Logger {
        wren_common::log::build_logger(std::io::sink())
    }

    async fn pool_with(
        flaky_first: bool,
        initial: usize,
        max: usize,
    ) -> (Pool, Arc<AtomicUsize>, tempfile::TempDir) {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("bird.ctl");
        let listener = UnixListener::bind(&path).unwrap();
        let conns = fake_bird(listener, flaky_first);
        let pool = Pool::connect(&path, initial, max, test_log())
            .await
            .unwrap();
        (pool, conns, dir)
    }

    #[tokio::test]
    async fn execute_returns_full_response_with_terminator() {
        let (pool, _conns, _dir) = pool_with(false, 1, 4).await;
        let resp = pool.show_protocols().await.unwrap();
        assert!(resp.contains("dn42_4242420123"));
        assert!(resp.ends_with("0000 \n"));
        assert_eq!(resp.lines().count(), 4);
    }

    #[tokio::test]
    async fn configure_classifies_success() {
        let (pool, _conns, _dir) = pool_with(false, 1, 4).await;
        pool.configure().await.unwrap();
    }

    #[tokio::test]
    async fn error_codes_surface_from_execute() {
        let (pool, _conns, _dir) = pool_with(false, 1, 4).await;
        let resp = pool.execute("broken").await.unwrap();
        assert!(resp.starts_with("8003 "));
    }

    #[tokio::test]
    async fn broken_connection_retried_once_transparently() {
        // The eagerly-dialed connection dies after the welcome banner; the
        // command must succeed on the transparent redial.
        let (pool, conns, _dir) = pool_with(true, 1, 4).await;
        let resp = pool.execute("show protocols").await.unwrap();
        assert!(resp.contains("dn42_4242420123"));
        assert_eq!(conns.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn connections_are_reused_not_redialed() {
        let (pool, conns, _dir) = pool_with(false, 1, 4).await;
        for _ in 0..5 {
            pool.execute("show protocols").await.unwrap();
        }
        assert_eq!(conns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_callers_never_share_a_connection() {
        let (pool, conns, _dir) = pool_with(false, 1, 1).await;
        let pool = Arc::new(pool);
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let p = pool.clone();
            tasks.push(tokio::spawn(async move {
                p.execute("show protocols").await.unwrap()
            }));
        }
        for t in tasks {
            let resp = t.await.unwrap();
            // Interleaved use of one connection would tear this framing.
            assert!(resp.ends_with("0000 \n"));
            assert_eq!(resp.lines().count(), 4);
        }
        // max_size is 1, so at most one connection was ever dialed.
        assert_eq!(conns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn close_rejects_further_commands() {
        let (pool, _conns, _dir) = pool_with(false, 1, 4).await;
        pool.close();
        assert!(matches!(
            pool.execute("configure").await,
            Err(Error::PoolClosed)
        ));
    }
}
