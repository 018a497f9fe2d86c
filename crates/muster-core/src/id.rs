//! Opaque integer identifiers.
//!
//! Ids are assigned by the record store. They are wrapped in newtypes so an
//! application id can never be passed where a session id is expected.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! id_type {
  ($(#[$meta:meta])* $name:ident) => {
    $(#[$meta])*
    #[derive(
      Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
    )]
    #[serde(transparent)]
    pub struct $name(pub i64);

    impl fmt::Display for $name {
      fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { self.0.fmt(f) }
    }
  };
}

id_type!(
  /// A community member.
  UserId
);
id_type!(
  /// An in-world persona owned by a member.
  CharacterId
);
id_type!(ApplicationId);
id_type!(TestId);
id_type!(SessionId);
id_type!(ResultId);
id_type!(DepartmentId);
