use std::{io, net::SocketAddr};

use async_trait::async_trait;
use tokio::net::lookup_host;

use crate::ports::transport::Dns;

/// Resolver backed by the operating system (`getaddrinfo` on a blocking thread).
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemDns;

#[async_trait]
impl Dns for SystemDns {
    async fn lookup(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
        let addrs: Vec<SocketAddr> = lookup_host((host, port)).await?.collect();
        tracing::trace!(host, count = addrs.len(), "Resolved host");
        Ok(addrs)
    }
}
