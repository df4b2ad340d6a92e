//! Script probe: run a shell command with `{ip}` / `{port}` expansion.
//! Exit code 0 within the timeout means healthy; on expiry the child
//! is killed.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use super::Probe;

pub struct ScriptProbe {
    timeout: Duration,
    cmd_template: String,
}

impl ScriptProbe {
    pub fn new(timeout_secs: f64, cmd_template: String) -> Self {
        Self {
            timeout: Duration::from_secs_f64(timeout_secs.max(0.05)),
            cmd_template,
        }
    }

    fn expand(&self, addr: &SocketAddr) -> String {
        self.cmd_template
            .replace("{ip}", &addr.ip().to_string())
            .replace("{port}", &addr.port().to_string())
    }
}

#[async_trait]
impl Probe for ScriptProbe {
    async fn check(&self, addr: SocketAddr) -> bool {
        if self.cmd_template.is_empty() {
            return false;
        }
        let cmd = self.expand(&addr);
        let child = Command::new("/bin/sh")
            .arg("-c")
            .arg(&cmd)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn();
        let mut child = match child {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %e, "script probe spawn failed");
                return false;
            }
        };
        match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(Ok(status)) => status.success(),
            Ok(Err(_)) => false,
            Err(_) => {
                child.start_kill().ok();
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    #[tokio::test]
    async fn exit_zero_is_healthy() {
        let probe = ScriptProbe::new(1.0, "true".into());
        assert!(probe.check(addr()).await);
    }

    #[tokio::test]
    async fn exit_nonzero_is_unhealthy() {
        let probe = ScriptProbe::new(1.0, "false".into());
        assert!(!probe.check(addr()).await);
    }

    #[tokio::test]
    async fn placeholders_expand() {
        let probe = ScriptProbe::new(1.0, "test {ip} = 127.0.0.1 && test {port} = 9000".into());
        assert!(probe.check(addr()).await);
    }

    #[tokio::test]
    async fn timeout_kills_and_fails() {
        let probe = ScriptProbe::new(0.2, "sleep 5".into());
        let started = std::time::Instant::now();
        assert!(!probe.check(addr()).await);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn empty_command_is_unhealthy() {
        let probe = ScriptProbe::new(0.2, String::new());
        assert!(!probe.check(addr()).await);
    }
}
