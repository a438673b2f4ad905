//! Record identifiers.
//!
//! Identifiers are database-assigned integers. A build's id doubles as its
//! default admission sequence and prefixes its destination directory.

use derive_more::{Display, From};
use serde::{Deserialize, Serialize};

macro_rules! record_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
            Display, From,
        )]
        #[serde(transparent)]
        #[display("{_0}")]
        pub struct $name(i64);

        impl $name {
            pub const fn new(id: i64) -> Self {
                Self(id)
            }

            pub const fn get(self) -> i64 {
                self.0
            }
        }

        impl From<$name> for i64 {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl std::str::FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                Ok(Self(s.parse()?))
            }
        }
    };
}

record_id!(
    /// Identifier of a tracked repository.
    RepoId
);
record_id!(
    /// Identifier of a branch (or pull request ref) of a repository.
    BranchId
);
record_id!(
    /// Identifier of a build.
    BuildId
);
