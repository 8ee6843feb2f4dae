use std::{io, sync::Arc, time::Duration};

use async_trait::async_trait;
use socket::{
    addr::Address,
    filter::SubnetFilter,
    server::Server,
    socks5::{Dial, DirectDial, Socks5Connect},
};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
pub async fn main() {
    tracing_subscriber::fmt::init();

    let port = listen_port(std::env::var("PORT").ok());
    let allowed_subnet = allowed_subnet(std::env::var("ALLOW_IP").ok());

    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .expect("Failed to bind to listen address");

    let cancellation = CancellationToken::new();
    let server = Arc::new(Server::new(cancellation.clone()));
    let handler = Socks5Connect::new(LoggingDial(DirectDial));

    {
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            let res = match allowed_subnet {
                Some(filter) => server.serve(filter.wrap(listener), handler).await,
                None => server.serve(listener, handler).await,
            };
            if let Err(e) = res {
                warn!(?e, "Serve finished");
            }
        });
    }

    tokio::signal::ctrl_c()
        .await
        .expect("Failed to listen for ctrl-c");
    info!("Shutting down");

    let deadline = CancellationToken::new();
    {
        let deadline = deadline.clone();
        tokio::spawn(async move {
            tokio::time::sleep(SHUTDOWN_TIMEOUT).await;
            deadline.cancel();
        });
    }
    if let Err(e) = server.shutdown(deadline).await {
        warn!(?e, "Connections still open past the shutdown deadline");
    }
}

/// An unset or empty `PORT` falls back to 8080.
fn listen_port(env: Option<String>) -> u16 {
    env.filter(|port| !port.is_empty())
        .map_or(8080, |port| {
            port.parse().expect("PORT must be a port number")
        })
}

/// An unset or empty `ALLOW_IP` means no filtering. A malformed value
/// aborts startup before anything is bound.
fn allowed_subnet(env: Option<String>) -> Option<SubnetFilter> {
    env.filter(|subnet| !subnet.is_empty()).map(|subnet| {
        info!(%subnet, "Allowed IP subnet");
        subnet.parse().expect("ALLOW_IP must be a CIDR subnet")
    })
}

/// Logs every outbound target before handing off to the direct dial.
struct LoggingDial(DirectDial);

#[async_trait]
impl Dial for LoggingDial {
    async fn dial(
        &self,
        cancellation: &CancellationToken,
        addr: &Address,
    ) -> io::Result<TcpStream> {
        info!(%addr, "Dialing");
        self.0.dial(cancellation, addr).await
    }
}
