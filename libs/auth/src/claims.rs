use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// Identity attached to every authenticated request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Operator id, the owner of a live stream
    pub sub: String,
    pub exp: usize,
    pub mode: Mode,
}

impl Claims {
    pub fn access(&self) -> Access {
        Access::from(self.mode)
    }
}

impl Display for Claims {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "operator: {}\nexpire: {}, mode: {}",
            self.sub,
            self.exp,
            Access::from(self.mode)
        )
    }
}

/// Look like Linux File-system permissions
/// 4: read, allow status queries, version listing and progress watching
/// 2: write, allow going live, recording and uploads
/// 1: execute, allow admin actions, example: stop someone else's stream
pub type Mode = u8;

pub const MODE_ALL: Mode = 7;

impl From<Mode> for Access {
    fn from(mask: Mode) -> Access {
        Access {
            r: mask & 4 != 0,
            w: mask & 2 != 0,
            x: mask & 1 != 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Access {
    pub r: bool,
    pub w: bool,
    pub x: bool,
}

impl Display for Access {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}{}{}",
            if self.r { "r" } else { "-" },
            if self.w { "w" } else { "-" },
            if self.x { "x" } else { "-" },
        )
    }
}
