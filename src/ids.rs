//! Opaque identifiers for sessions, pooled connections, and SFTP transfers.
//!
//! The teacher keys its connection cache by the literal `user@host:port`
//! string because it manages at most one connection per device address.
//! The gateway multiplexes many browser connections (sessions) that may
//! each open their own pooled SSH connection and SFTP transfers, so each
//! gets its own generated identity instead.

use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! opaque_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

opaque_id!(SessionId);
opaque_id!(ConnectionId);
opaque_id!(TransferId);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        assert_ne!(SessionId::new(), SessionId::new());
        assert_ne!(ConnectionId::new(), ConnectionId::new());
        assert_ne!(TransferId::new(), TransferId::new());
    }
}
