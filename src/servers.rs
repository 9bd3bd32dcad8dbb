use serde::{Serialize, Serializer};
use std::{fmt, str::FromStr};
use thiserror::Error;

/// Game servers the upstream marketplace exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Server {
    Baphomet,
    Yggdrasil,
    Ifrit,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown server: {0}")]
pub struct UnknownServer(pub String);

impl Server {
    pub const ALL: [Self; 3] = [Self::Baphomet, Self::Yggdrasil, Self::Ifrit];

    /// Maps a free-text alias (English, any case, or the Korean display name).
    #[must_use]
    pub fn from_alias(alias: &str) -> Option<Self> {
        let alias = alias.trim();
        Self::ALL.into_iter().find(|server| {
            alias.eq_ignore_ascii_case(server.code()) || alias == server.display_name()
        })
    }

    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Baphomet => "baphomet",
            Self::Yggdrasil => "yggdrasil",
            Self::Ifrit => "ifrit",
        }
    }

    /// Numeric site code the upstream expects in `svrID`.
    #[must_use]
    pub const fn site_code(self) -> &'static str {
        match self {
            Self::Baphomet => "129",
            Self::Yggdrasil => "130",
            Self::Ifrit => "131",
        }
    }

    #[must_use]
    pub const fn display_name(self) -> &'static str {
        match self {
            Self::Baphomet => "바포메트",
            Self::Yggdrasil => "이그드라실",
            Self::Ifrit => "이프리트",
        }
    }
}

impl FromStr for Server {
    type Err = UnknownServer;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_alias(s).ok_or_else(|| UnknownServer(s.to_string()))
    }
}

impl fmt::Display for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl Serialize for Server {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::Server;

    #[test]
    fn aliases() {
        assert_eq!(Server::from_alias("BAPHOMET"), Some(Server::Baphomet));
        assert_eq!(Server::from_alias(" ifrit "), Some(Server::Ifrit));
        assert_eq!(Server::from_alias("이그드라실"), Some(Server::Yggdrasil));
        assert_eq!(Server::from_alias("loki"), None);
        assert_eq!("ifrit".parse::<Server>().map(Server::site_code), Ok("131"));
    }
}
