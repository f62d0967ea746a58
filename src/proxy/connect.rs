//! CONNECT tunnel — byte-transparent relay for TLS traffic.
//!
//! TLS interception is deliberately absent, so a `CONNECT` simply opens a
//! raw TCP connection to the target and copies bytes in both directions
//! until either side closes. No Message is ever captured for this traffic.

use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Connects to `authority` and relays bytes between it and the already
/// upgraded client connection until either side closes.
pub async fn tunnel(upgraded: Upgraded, authority: String) {
    let target = match TcpStream::connect(&authority).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("CONNECT tunnel failed to reach {authority}: {e}");
            return;
        }
    };

    let mut client = TokioIo::new(upgraded);
    let mut target = target;

    match tokio::io::copy_bidirectional(&mut client, &mut target).await {
        Ok((from_client, from_target)) => {
            debug!(
                "CONNECT tunnel to {authority} closed ({from_client} bytes up, {from_target} bytes down)"
            );
        }
        Err(e) => warn!("CONNECT tunnel to {authority} error: {e}"),
    }
}
