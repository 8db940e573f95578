//! Endpoint configuration: resolving the IP/port a context binds to.

use std::net::Ipv4Addr;

use crate::error::Error;

const ENV_IP: &str = "LIBPROCESS_IP";
const ENV_PORT: &str = "LIBPROCESS_PORT";

/// Resolved bind address for a context's HTTP endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointConfig {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl EndpointConfig {
    /// Resolution order: explicit arguments, then `LIBPROCESS_IP` /
    /// `LIBPROCESS_PORT`, then `0.0.0.0:0` (bind to any interface, let the
    /// OS pick a port).
    pub fn resolve(ip: Option<Ipv4Addr>, port: Option<u16>) -> Result<Self, Error> {
        let ip = match ip {
            Some(ip) => ip,
            None => match std::env::var(ENV_IP) {
                Ok(v) => v
                    .parse()
                    .map_err(|_| Error::ConfigError(format!("invalid {ENV_IP}: {v}")))?,
                Err(_) => Ipv4Addr::UNSPECIFIED,
            },
        };
        let port = match port {
            Some(port) => port,
            None => match std::env::var(ENV_PORT) {
                Ok(v) => v
                    .parse()
                    .map_err(|_| Error::ConfigError(format!("invalid {ENV_PORT}: {v}")))?,
                Err(_) => 0,
            },
        };
        Ok(EndpointConfig { ip, port })
    }

    /// After binding to `0.0.0.0`, substitute the local hostname's
    /// resolvable address so peers are handed a routable pid, mirroring
    /// `Context.get_ip_port`'s 0.0.0.0-to-hostname substitution.
    ///
    /// Hostname lookup goes through the `hostname` crate, the same one the
    /// teacher uses for device naming (`auth.rs:57`, `device.rs:299`),
    /// rather than an env var: shells don't reliably export `HOSTNAME` into
    /// a process's environment, and a `"localhost"` fallback would hand
    /// peers an unroutable loopback address.
    pub fn advertised_ip(&self) -> Result<Ipv4Addr, Error> {
        if self.ip != Ipv4Addr::UNSPECIFIED {
            return Ok(self.ip);
        }
        let hostname = hostname::get()?
            .into_string()
            .map_err(|_| Error::ConfigError("hostname is not valid UTF-8".into()))?;
        use std::net::ToSocketAddrs;
        (hostname.as_str(), 0_u16)
            .to_socket_addrs()
            .map_err(Error::SocketError)?
            .find_map(|addr| match addr.ip() {
                std::net::IpAddr::V4(v4) => Some(v4),
                std::net::IpAddr::V6(_) => None,
            })
            .ok_or_else(|| Error::ConfigError("could not resolve local hostname".into()))
    }
}
