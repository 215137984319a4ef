use std::error::Error;
use std::io;

use socksling::protocol::{Address, AuthMethod, Host, Reply};
use socksling::{Request, Server};
use tokio::net::TcpStream;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Minimal embedder: accept every no-auth handshake, dial CONNECT targets
/// directly, deny BIND and ASSOCIATE.
#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let server = Server::new();
    let mut handshakes = server.handshake_channel().expect("receiver taken once");
    let mut requests = server.request_channel().expect("receiver taken once");

    server.start("0.0.0.0:1080").await?;
    info!("proxy listening on {:?}", server.addr());

    tokio::spawn(async move {
        while let Some(handshake) = handshakes.recv().await {
            if handshake.methods().contains(&AuthMethod::NoAuthRequired) {
                handshake.accept(AuthMethod::NoAuthRequired, None);
            } else {
                handshake.deny();
            }
        }
    });

    while let Some(request) = requests.recv().await {
        match request {
            Request::Connect(connect) => {
                tokio::spawn(async move {
                    match dial(connect.dst()).await {
                        Ok(conn) => {
                            let bound = conn
                                .local_addr()
                                .map(Address::from)
                                .unwrap_or_else(|_| Address::unspecified());
                            connect.accept(bound, Box::new(conn));
                        }
                        Err(err) => {
                            warn!("dial {} failed: {}", connect.dst(), err);
                            let reply = Reply::from(&err);
                            connect.deny(reply, Address::unspecified());
                        }
                    }
                });
            }
            Request::Bind(bind) => {
                bind.deny(Reply::ConnectionNotAllowedByRuleset, Address::unspecified());
            }
            Request::Associate(associate) => {
                associate.deny(Reply::ConnectionNotAllowedByRuleset, Address::unspecified());
            }
        }
    }

    Ok(())
}

async fn dial(dst: &Address) -> io::Result<TcpStream> {
    match &dst.host {
        Host::Ipv4(ip) => TcpStream::connect((*ip, dst.port)).await,
        Host::Ipv6(ip) => TcpStream::connect((*ip, dst.port)).await,
        Host::Domain(name) => TcpStream::connect((name.as_str(), dst.port)).await,
    }
}
