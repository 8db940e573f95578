use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::error::Error;

/// A location-transparent process identity: `name@ip:port`.
///
/// `id` is the process's registered name within its owning context; `ip`
/// and `port` locate the context's HTTP endpoint. Two pids are equal, and
/// hash equally, iff all three fields match exactly.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Pid {
    pub id: String,
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl Pid {
    pub fn new(id: impl Into<String>, ip: Ipv4Addr, port: u16) -> Self {
        Pid {
            id: id.into(),
            ip,
            port,
        }
    }

    /// The base URL a peer dials to reach this pid: `http://ip:port`.
    pub fn as_url(&self) -> String {
        format!("http://{}:{}", self.ip, self.port)
    }

    /// The path prefix this pid's routes and mailboxes are mounted under.
    pub fn path_prefix(&self) -> String {
        format!("/{}", self.id)
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.id, self.ip, self.port)
    }
}

impl FromStr for Pid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (id, rest) = s
            .split_once('@')
            .ok_or_else(|| Error::InvalidPid(s.to_string()))?;
        if id.is_empty() {
            return Err(Error::InvalidPid(s.to_string()));
        }
        let (ip, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| Error::InvalidPid(s.to_string()))?;
        let ip: Ipv4Addr = ip
            .parse()
            .map_err(|_| Error::InvalidPid(s.to_string()))?;
        let port: u16 = port
            .parse()
            .map_err(|_| Error::InvalidPid(s.to_string()))?;
        if port == 0 {
            return Err(Error::InvalidPid(s.to_string()));
        }
        Ok(Pid {
            id: id.to_string(),
            ip,
            port,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_pid() {
        let pid: Pid = "echo@127.0.0.1:5050".parse().unwrap();
        assert_eq!(pid.id, "echo");
        assert_eq!(pid.ip, Ipv4Addr::new(127, 0, 0, 1));
        assert_eq!(pid.port, 5050);
    }

    #[test]
    fn display_round_trips_through_parse() {
        let pid = Pid::new("echo", Ipv4Addr::new(10, 0, 0, 1), 1234);
        let shown = pid.to_string();
        let reparsed: Pid = shown.parse().unwrap();
        assert_eq!(pid, reparsed);
    }

    #[test]
    fn rejects_missing_at_sign() {
        assert!("echo-127.0.0.1:5050".parse::<Pid>().is_err());
    }

    #[test]
    fn rejects_missing_port() {
        assert!("echo@127.0.0.1".parse::<Pid>().is_err());
    }

    #[test]
    fn rejects_empty_id() {
        assert!("@127.0.0.1:5050".parse::<Pid>().is_err());
    }

    #[test]
    fn rejects_zero_port() {
        assert!("echo@127.0.0.1:0".parse::<Pid>().is_err());
    }

    #[test]
    fn equality_and_hash_require_all_fields() {
        let a = Pid::new("echo", Ipv4Addr::new(127, 0, 0, 1), 5050);
        let b = Pid::new("echo", Ipv4Addr::new(127, 0, 0, 1), 5051);
        assert_ne!(a, b);
    }

    #[test]
    fn as_url_and_path_prefix() {
        let pid = Pid::new("echo", Ipv4Addr::new(127, 0, 0, 1), 5050);
        assert_eq!(pid.as_url(), "http://127.0.0.1:5050");
        assert_eq!(pid.path_prefix(), "/echo");
    }
}
