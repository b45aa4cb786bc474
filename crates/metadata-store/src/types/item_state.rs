use serde::{Deserialize, Serialize};
use sqlx::encode::IsNull;
use sqlx::error::BoxDynError;
use sqlx::sqlite::{SqliteArgumentValue, SqliteTypeInfo, SqliteValueRef};
use sqlx::{Decode, Encode, Sqlite, Type};

/// Lifecycle state of a filesystem entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    /// Metadata known, content only on the remote
    Ghost,
    /// Content is being downloaded by a worker
    Hydrating,
    /// Content cached locally and in sync with the remote
    Hydrated,
    /// Local content has edits not yet pushed to the remote
    DirtyLocal,
    /// Local edits and a newer remote version both exist
    Conflict,
    /// The last hydration or upload failed
    Error,
    /// Terminal; the identifier is never reused
    Deleted,
}

impl ItemState {
    pub const ALL: [ItemState; 7] = [
        ItemState::Ghost,
        ItemState::Hydrating,
        ItemState::Hydrated,
        ItemState::DirtyLocal,
        ItemState::Conflict,
        ItemState::Error,
        ItemState::Deleted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ItemState::Ghost => "ghost",
            ItemState::Hydrating => "hydrating",
            ItemState::Hydrated => "hydrated",
            ItemState::DirtyLocal => "dirty_local",
            ItemState::Conflict => "conflict",
            ItemState::Error => "error",
            ItemState::Deleted => "deleted",
        }
    }

    /// Whether the local cache holds content a reader may be served.
    pub fn has_local_content(&self) -> bool {
        matches!(
            self,
            ItemState::Hydrated | ItemState::DirtyLocal | ItemState::Conflict
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ItemState::Deleted)
    }
}

/// Returned when a stored or supplied state name is not one of the seven
/// lifecycle values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown item state: {0:?}")]
pub struct UnknownState(pub String);

impl std::str::FromStr for ItemState {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "ghost" => ItemState::Ghost,
            "hydrating" => ItemState::Hydrating,
            "hydrated" => ItemState::Hydrated,
            "dirty_local" => ItemState::DirtyLocal,
            "conflict" => ItemState::Conflict,
            "error" => ItemState::Error,
            "deleted" => ItemState::Deleted,
            other => return Err(UnknownState(other.to_string())),
        })
    }
}

impl std::fmt::Display for ItemState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Decode<'_, Sqlite> for ItemState {
    fn decode(value: SqliteValueRef<'_>) -> Result<Self, BoxDynError> {
        let s = <String as Decode<Sqlite>>::decode(value)?;
        Ok(s.parse()?)
    }
}

impl Encode<'_, Sqlite> for ItemState {
    fn encode_by_ref(
        &self,
        args: &mut Vec<SqliteArgumentValue<'_>>,
    ) -> Result<IsNull, BoxDynError> {
        args.push(SqliteArgumentValue::Text(self.as_str().into()));
        Ok(IsNull::No)
    }
}

impl Type<Sqlite> for ItemState {
    fn compatible(ty: &SqliteTypeInfo) -> bool {
        <String as Type<Sqlite>>::compatible(ty)
    }

    fn type_info() -> SqliteTypeInfo {
        <String as Type<Sqlite>>::type_info()
    }
}
