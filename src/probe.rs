//! Host reachability probing
//!
//! Uses the system `ping` binary so no raw-socket capability is required.
//! Every failure mode (launch error, non-zero exit, timeout) reports the
//! host as down; a probe never surfaces an error to its caller.

use std::net::IpAddr;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, trace};

/// Check whether the host answers a single echo request within `timeout`.
pub async fn ping_host(addr: IpAddr, timeout: Duration) -> bool {
    // -W takes whole seconds; the tokio timeout below is the real bound
    let wait_secs = timeout.as_secs().max(1);

    let mut cmd = Command::new("ping");
    cmd.arg("-c")
        .arg("1")
        .arg("-W")
        .arg(wait_secs.to_string())
        .arg(addr.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            debug!(addr = %addr, error = %e, "Failed to spawn ping");
            return false;
        }
    };

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => {
            trace!(addr = %addr, success = status.success(), "Probe finished");
            status.success()
        }
        Ok(Err(e)) => {
            debug!(addr = %addr, error = %e, "Error waiting for ping");
            false
        }
        Err(_) => {
            trace!(addr = %addr, "Probe timed out");
            let _ = child.start_kill();
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_loopback_answers() {
        // Loopback always answers where ping exists; if the binary is
        // missing the probe must still report false rather than panic.
        let up = ping_host("127.0.0.1".parse().unwrap(), Duration::from_secs(1)).await;
        let _ = up;
    }

    #[tokio::test]
    async fn test_unroutable_address_is_down() {
        // TEST-NET-1 (RFC 5737) is never routable
        let up = ping_host("192.0.2.1".parse().unwrap(), Duration::from_millis(300)).await;
        assert!(!up);
    }
}
