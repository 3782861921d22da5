//! Stores for cached validation results
//!
//! Both backends hold opaque byte blobs with a TTL; they never see raw
//! tokens or unprotected payloads when a protection strategy is configured.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

/// Key/value store with per-entry TTL
#[async_trait]
pub trait CacheBackend: Send + Sync + 'static {
    /// Fetch a live entry
    async fn get(&self, key: &str) -> io::Result<Option<Vec<u8>>>;

    /// Store an entry for `ttl`
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> io::Result<()>;
}

struct MemoryEntry {
    value: Vec<u8>,
    stored_at: Instant,
    ttl: Duration,
}

impl MemoryEntry {
    fn is_expired(&self) -> bool {
        self.stored_at.elapsed() >= self.ttl
    }
}

/// Hit/miss counters of the in-process backend
#[derive(Debug, Default)]
pub struct MemoryStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

/// Point-in-time copy of [`MemoryStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryStatsSnapshot {
    /// Lookups served
    pub hits: u64,
    /// Lookups that found nothing live
    pub misses: u64,
    /// Entries dropped on expiry or for capacity
    pub evictions: u64,
    /// Current entry count
    pub size: usize,
}

/// Per-process store on a [`DashMap`]
pub struct InMemoryBackend {
    entries: DashMap<String, MemoryEntry>,
    max_entries: usize,
    stats: MemoryStats,
}

impl InMemoryBackend {
    /// Empty store bounded to `max_entries`
    #[must_use]
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries: max_entries.max(1),
            stats: MemoryStats::default(),
        }
    }

    /// Current statistics
    pub fn stats(&self) -> MemoryStatsSnapshot {
        MemoryStatsSnapshot {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            size: self.entries.len(),
        }
    }

    /// Drop expired entries, returning how many were removed
    pub fn cleanup_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired());
        let removed = before.saturating_sub(self.entries.len());
        self.stats
            .evictions
            .fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    fn make_room(&self) {
        if self.entries.len() < self.max_entries {
            return;
        }
        if self.cleanup_expired() > 0 && self.entries.len() < self.max_entries {
            return;
        }
        // Still full: drop the entry closest to expiry
        let victim = self
            .entries
            .iter()
            .min_by_key(|e| e.ttl.saturating_sub(e.stored_at.elapsed()))
            .map(|e| e.key().clone());
        if let Some(key) = victim {
            self.entries.remove(&key);
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[async_trait]
impl CacheBackend for InMemoryBackend {
    async fn get(&self, key: &str) -> io::Result<Option<Vec<u8>>> {
        if let Some(entry) = self.entries.get(key) {
            if entry.is_expired() {
                drop(entry);
                self.entries.remove(key);
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            } else {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(entry.value.clone()))
            }
        } else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            Ok(None)
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> io::Result<()> {
        if !self.entries.contains_key(key) {
            self.make_room();
        }
        self.entries.insert(
            key.to_string(),
            MemoryEntry {
                value,
                stored_at: Instant::now(),
                ttl,
            },
        );
        Ok(())
    }
}

/// Largest relative expiry memcached accepts; longer values are read as
/// absolute unix times
const MEMCACHED_MAX_RELATIVE_TTL: u64 = 60 * 60 * 24 * 30;
/// Default memcached item size limit; larger replies are treated as corrupt
const MEMCACHED_MAX_ITEM_SIZE: usize = 1024 * 1024;

struct MemcachedServer {
    addr: String,
    conn: Mutex<Option<BufReader<TcpStream>>>,
}

/// Memcached pool speaking the text protocol.
///
/// Keys are spread over the servers by hash; each server has one connection
/// that is opened on first use and dropped after any I/O error so the next
/// call reconnects.
pub struct MemcachedBackend {
    servers: Vec<MemcachedServer>,
    io_timeout: Duration,
}

impl MemcachedBackend {
    /// Pool over `host:port` addresses
    #[must_use]
    pub fn new(servers: &[String], io_timeout: Duration) -> Self {
        Self {
            servers: servers
                .iter()
                .map(|addr| MemcachedServer {
                    addr: addr.clone(),
                    conn: Mutex::new(None),
                })
                .collect(),
            io_timeout,
        }
    }

    fn server_for(&self, key: &str) -> io::Result<&MemcachedServer> {
        if self.servers.is_empty() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "no memcached servers"));
        }
        let digest = Sha256::digest(key.as_bytes());
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        let index = u64::from_be_bytes(head) % self.servers.len() as u64;
        // index < servers.len(), which fits in usize
        #[allow(clippy::cast_possible_truncation)]
        Ok(&self.servers[index as usize])
    }

    async fn lock_connected<'a>(
        &self,
        server: &'a MemcachedServer,
    ) -> io::Result<MutexGuard<'a, Option<BufReader<TcpStream>>>> {
        let mut guard = server.conn.lock().await;
        if guard.is_none() {
            let stream = tokio::time::timeout(self.io_timeout, TcpStream::connect(&server.addr))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "memcached connect timed out"))??;
            stream.set_nodelay(true)?;
            debug!(server = %server.addr, "Connected to memcached");
            *guard = Some(BufReader::new(stream));
        }
        Ok(guard)
    }
}

/// Drop the connection after a failed or timed out exchange
fn settle<T>(
    server: &MemcachedServer,
    guard: &mut MutexGuard<'_, Option<BufReader<TcpStream>>>,
    outcome: std::result::Result<io::Result<T>, tokio::time::error::Elapsed>,
) -> io::Result<T> {
    let result = outcome
        .unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::TimedOut, "memcached request timed out")));
    if let Err(e) = &result {
        warn!(server = %server.addr, error = %e, "Dropping memcached connection");
        **guard = None;
    }
    result
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "memcached connection lost")
}

async fn get_value(conn: &mut BufReader<TcpStream>, key: &str) -> io::Result<Option<Vec<u8>>> {
    conn.get_mut()
        .write_all(format!("get {key}\r\n").as_bytes())
        .await?;
    let header = read_line(conn).await?;
    if header == "END" {
        return Ok(None);
    }
    let mut parts = header.split_whitespace();
    if parts.next() != Some("VALUE") || parts.next() != Some(key) {
        return Err(protocol_error(format!("unexpected reply: {header}")));
    }
    let len: usize = parts
        .nth(1)
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| protocol_error(format!("bad VALUE line: {header}")))?;
    let framed = len
        .checked_add(2)
        .filter(|_| len <= MEMCACHED_MAX_ITEM_SIZE)
        .ok_or_else(|| protocol_error(format!("value of {len} bytes exceeds item limit")))?;
    let mut data = vec![0u8; framed];
    conn.read_exact(&mut data).await?;
    data.truncate(len);
    let end = read_line(conn).await?;
    if end != "END" {
        return Err(protocol_error(format!("expected END, got {end}")));
    }
    Ok(Some(data))
}

async fn set_value(
    conn: &mut BufReader<TcpStream>,
    key: &str,
    value: &[u8],
    exptime: u64,
) -> io::Result<()> {
    let mut request = format!("set {key} 0 {exptime} {}\r\n", value.len()).into_bytes();
    request.extend_from_slice(value);
    request.extend_from_slice(b"\r\n");
    conn.get_mut().write_all(&request).await?;
    match read_line(conn).await?.as_str() {
        "STORED" => Ok(()),
        other => Err(protocol_error(format!("set failed: {other}"))),
    }
}

fn protocol_error(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

async fn read_line(conn: &mut BufReader<TcpStream>) -> io::Result<String> {
    let mut line = String::new();
    if conn.read_line(&mut line).await? == 0 {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "memcached closed connection"));
    }
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

fn memcached_exptime(ttl: Duration) -> u64 {
    // 0 means "never expire"; round sub-second TTLs up
    let secs = ttl.as_secs().max(1);
    if secs > MEMCACHED_MAX_RELATIVE_TTL {
        MEMCACHED_MAX_RELATIVE_TTL
    } else {
        secs
    }
}

#[async_trait]
impl CacheBackend for MemcachedBackend {
    async fn get(&self, key: &str) -> io::Result<Option<Vec<u8>>> {
        let server = self.server_for(key)?;
        let mut guard = self.lock_connected(server).await?;
        let conn = guard.as_mut().ok_or_else(not_connected)?;
        let outcome = tokio::time::timeout(self.io_timeout, get_value(conn, key)).await;
        settle(server, &mut guard, outcome)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> io::Result<()> {
        let server = self.server_for(key)?;
        let mut guard = self.lock_connected(server).await?;
        let conn = guard.as_mut().ok_or_else(not_connected)?;
        let outcome = tokio::time::timeout(
            self.io_timeout,
            set_value(conn, key, &value, memcached_exptime(ttl)),
        )
        .await;
        settle(server, &mut guard, outcome)
    }
}
