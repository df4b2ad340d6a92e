//! External response cache client.
//!
//! Two wire dialects: RESP (`GET` / `SETEX`) and text memcache
//! (`get` / `set`). Every operation is bounded by the configured
//! timeout and any failure degrades silently to origin. Keys are the
//! FNV-1a fingerprint of the request, prefixed and hex-encoded so they
//! are safe for both dialects.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use infermesh_balance::hash::fnv1a64;
use infermesh_config::{CacheConfig, CacheDialect};

pub struct CacheClient {
    cfg: CacheConfig,
}

impl CacheClient {
    pub fn new(cfg: CacheConfig) -> Self {
        Self { cfg }
    }

    /// Fingerprint of method, path, query and the configured vary
    /// headers, as a hex string.
    pub fn fingerprint(
        &self,
        method: &str,
        path: &str,
        query: &str,
        headers: &[(String, String)],
    ) -> String {
        let mut input = format!("{}\n{}\n{}", method, path, query);
        for name in &self.cfg.vary_headers {
            input.push('\n');
            input.push_str(name);
            input.push('=');
            if let Some(value) = crate::http::header_get(headers, name) {
                input.push_str(value);
            }
        }
        format!("{:016x}", fnv1a64(input.as_bytes()))
    }

    fn key(&self, fingerprint: &str) -> String {
        format!("p:{}", fingerprint)
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.cfg.timeout_ms.max(1))
    }

    /// Fetch a cached value. Miss and failure both yield `None`.
    pub async fn get(&self, fingerprint: &str) -> Option<Vec<u8>> {
        let key = self.key(fingerprint);
        let result = tokio::time::timeout(self.timeout(), async {
            match self.cfg.dialect {
                CacheDialect::Redis => self.redis_get(&key).await,
                CacheDialect::Memcached => self.memcached_get(&key).await,
            }
        })
        .await;
        match result {
            Ok(Ok(value)) => value,
            Ok(Err(e)) => {
                tracing::trace!(error = %e, "cache get failed");
                None
            }
            Err(_) => {
                tracing::trace!("cache get timed out");
                None
            }
        }
    }

    /// Store a value, best-effort.
    pub async fn set(&self, fingerprint: &str, value: &[u8]) {
        if value.len() > self.cfg.max_value_bytes {
            return;
        }
        let key = self.key(fingerprint);
        let result = tokio::time::timeout(self.timeout(), async {
            match self.cfg.dialect {
                CacheDialect::Redis => self.redis_set(&key, value).await,
                CacheDialect::Memcached => self.memcached_set(&key, value).await,
            }
        })
        .await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::trace!(error = %e, "cache set failed"),
            Err(_) => tracing::trace!("cache set timed out"),
        }
    }

    async fn connect(&self) -> std::io::Result<TcpStream> {
        TcpStream::connect((self.cfg.host.as_str(), self.cfg.port)).await
    }

    async fn redis_get(&self, key: &str) -> std::io::Result<Option<Vec<u8>>> {
        let mut stream = BufReader::new(self.connect().await?);
        let cmd = format!("*2\r\n$3\r\nGET\r\n${}\r\n{}\r\n", key.len(), key);
        stream.get_mut().write_all(cmd.as_bytes()).await?;

        let mut line = String::new();
        stream.read_line(&mut line).await?;
        let line = line.trim_end();
        if !line.starts_with('$') {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "unexpected redis reply",
            ));
        }
        let n: i64 = line[1..].parse().map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, "bad bulk length")
        })?;
        if n < 0 {
            return Ok(None);
        }
        let n = n as usize;
        if n > self.cfg.max_value_bytes {
            return Ok(None);
        }
        let mut value = vec![0u8; n + 2];
        stream.read_exact(&mut value).await?;
        value.truncate(n);
        Ok(Some(value))
    }

    async fn redis_set(&self, key: &str, value: &[u8]) -> std::io::Result<()> {
        let mut stream = BufReader::new(self.connect().await?);
        let ttl = self.cfg.ttl_secs.max(1).to_string();
        let mut cmd = format!(
            "*4\r\n$5\r\nSETEX\r\n${}\r\n{}\r\n${}\r\n{}\r\n${}\r\n",
            key.len(),
            key,
            ttl.len(),
            ttl,
            value.len()
        )
        .into_bytes();
        cmd.extend_from_slice(value);
        cmd.extend_from_slice(b"\r\n");
        stream.get_mut().write_all(&cmd).await?;

        let mut line = String::new();
        stream.read_line(&mut line).await?;
        if line.starts_with("+OK") {
            Ok(())
        } else {
            Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "setex not acknowledged",
            ))
        }
    }

    async fn memcached_get(&self, key: &str) -> std::io::Result<Option<Vec<u8>>> {
        let mut stream = BufReader::new(self.connect().await?);
        let cmd = format!("get {}\r\n", key);
        stream.get_mut().write_all(cmd.as_bytes()).await?;

        let mut line = String::new();
        stream.read_line(&mut line).await?;
        let line_trim = line.trim_end();
        if line_trim == "END" {
            return Ok(None);
        }
        // VALUE <key> <flags> <bytes>
        let mut parts = line_trim.split_whitespace();
        if parts.next() != Some("VALUE") {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "unexpected memcache reply",
            ));
        }
        let bytes: usize = parts
            .nth(2)
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::InvalidData, "bad VALUE line")
            })?;
        if bytes > self.cfg.max_value_bytes {
            return Ok(None);
        }
        let mut value = vec![0u8; bytes + 2];
        stream.read_exact(&mut value).await?;
        value.truncate(bytes);
        Ok(Some(value))
    }

    async fn memcached_set(&self, key: &str, value: &[u8]) -> std::io::Result<()> {
        let mut stream = BufReader::new(self.connect().await?);
        let ttl = self.cfg.ttl_secs.max(1);
        let mut cmd = format!("set {} 0 {} {}\r\n", key, ttl, value.len()).into_bytes();
        cmd.extend_from_slice(value);
        cmd.extend_from_slice(b"\r\n");
        stream.get_mut().write_all(&cmd).await?;

        let mut line = String::new();
        stream.read_line(&mut line).await?;
        if line.starts_with("STORED") {
            Ok(())
        } else {
            Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "set not acknowledged",
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn cache_cfg(dialect: CacheDialect, port: u16) -> CacheConfig {
        CacheConfig {
            dialect,
            host: "127.0.0.1".into(),
            port,
            ttl_secs: 60,
            timeout_ms: 500,
            max_value_bytes: 1024 * 1024,
            vary_headers: vec!["X-Model".into()],
        }
    }

    #[test]
    fn fingerprint_varies_on_inputs() {
        let client = CacheClient::new(cache_cfg(CacheDialect::Redis, 1));
        let headers_a = vec![("X-Model".to_string(), "llama".to_string())];
        let headers_b = vec![("X-Model".to_string(), "gemma".to_string())];

        let base = client.fingerprint("GET", "/x", "a=1", &headers_a);
        assert_eq!(base, client.fingerprint("GET", "/x", "a=1", &headers_a));
        assert_ne!(base, client.fingerprint("POST", "/x", "a=1", &headers_a));
        assert_ne!(base, client.fingerprint("GET", "/y", "a=1", &headers_a));
        assert_ne!(base, client.fingerprint("GET", "/x", "a=2", &headers_a));
        assert_ne!(base, client.fingerprint("GET", "/x", "a=1", &headers_b));
        assert_eq!(base.len(), 16);
    }

    #[tokio::test]
    async fn redis_hit_and_miss() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            // First connection: miss. Second: hit.
            for reply in [b"$-1\r\n".to_vec(), b"$5\r\nhello\r\n".to_vec()] {
                let (mut stream, _) = listener.accept().await.unwrap();
                let mut buf = [0u8; 512];
                let _ = stream.read(&mut buf).await.unwrap();
                stream.write_all(&reply).await.unwrap();
            }
        });

        let client = CacheClient::new(cache_cfg(CacheDialect::Redis, port));
        assert!(client.get("aabb").await.is_none());
        assert_eq!(client.get("aabb").await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn memcached_hit_and_miss() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let replies: [&[u8]; 2] = [b"END\r\n", b"VALUE p:ff 0 2\r\nhi\r\nEND\r\n"];
            for reply in replies {
                let (mut stream, _) = listener.accept().await.unwrap();
                let mut buf = [0u8; 512];
                let _ = stream.read(&mut buf).await.unwrap();
                stream.write_all(reply).await.unwrap();
            }
        });

        let client = CacheClient::new(cache_cfg(CacheDialect::Memcached, port));
        assert!(client.get("ff").await.is_none());
        assert_eq!(client.get("ff").await.unwrap(), b"hi");
    }

    #[tokio::test]
    async fn unresponsive_server_times_out_to_none() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let client = CacheClient::new(cache_cfg(CacheDialect::Redis, port));
        let started = std::time::Instant::now();
        assert!(client.get("dead").await.is_none());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn unreachable_server_degrades_silently() {
        let client = CacheClient::new(cache_cfg(CacheDialect::Redis, 1));
        assert!(client.get("x").await.is_none());
        client.set("x", b"v").await;
    }
}
