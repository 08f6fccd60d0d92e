//! Shared domain enums, stored as upper-case text columns

use serde::{Deserialize, Serialize};
use sqlx::{postgres::PgTypeInfo, Decode, Encode, Postgres};
use utoipa::ToSchema;

// ---------------------------------------------------------------------------
// BookStatus
// ---------------------------------------------------------------------------

/// Circulation status of a book.
///
/// Only the lending engine and the overdue sweep move a book between states;
/// catalog edits never touch it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookStatus {
    Active,
    Borrowed,
    Lost,
}

impl BookStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookStatus::Active => "ACTIVE",
            BookStatus::Borrowed => "BORROWED",
            BookStatus::Lost => "LOST",
        }
    }
}

impl std::fmt::Display for BookStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for BookStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "ACTIVE" => Ok(BookStatus::Active),
            "BORROWED" => Ok(BookStatus::Borrowed),
            "LOST" => Ok(BookStatus::Lost),
            _ => Err(format!("Invalid book status: {}", s)),
        }
    }
}

// ---------------------------------------------------------------------------
// BorrowingPrivilege
// ---------------------------------------------------------------------------

/// Borrowing tier of a member. Declared from most to least permissive; a
/// member only ever moves down this list.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
    ToSchema,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BorrowingPrivilege {
    #[default]
    Full,
    Limited,
    Unable,
}

impl BorrowingPrivilege {
    pub fn as_str(&self) -> &'static str {
        match self {
            BorrowingPrivilege::Full => "FULL",
            BorrowingPrivilege::Limited => "LIMITED",
            BorrowingPrivilege::Unable => "UNABLE",
        }
    }
}

impl std::fmt::Display for BorrowingPrivilege {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for BorrowingPrivilege {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "FULL" => Ok(BorrowingPrivilege::Full),
            "LIMITED" => Ok(BorrowingPrivilege::Limited),
            "UNABLE" => Ok(BorrowingPrivilege::Unable),
            _ => Err(format!("Invalid borrowing privilege: {}", s)),
        }
    }
}

// ---------------------------------------------------------------------------
// Role
// ---------------------------------------------------------------------------

/// API role carried in access tokens
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    #[default]
    User,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "USER",
            Role::Admin => "ADMIN",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "USER" => Ok(Role::User),
            "ADMIN" => Ok(Role::Admin),
            _ => Err(format!("Invalid role: {}", s)),
        }
    }
}

// ---------------------------------------------------------------------------
// SQLx conversions (TEXT columns)
// ---------------------------------------------------------------------------

macro_rules! text_column {
    ($ty:ty) => {
        impl sqlx::Type<Postgres> for $ty {
            fn type_info() -> PgTypeInfo {
                <String as sqlx::Type<Postgres>>::type_info()
            }

            fn compatible(ty: &PgTypeInfo) -> bool {
                <String as sqlx::Type<Postgres>>::compatible(ty)
            }
        }

        impl<'r> Decode<'r, Postgres> for $ty {
            fn decode(
                value: sqlx::postgres::PgValueRef<'r>,
            ) -> Result<Self, sqlx::error::BoxDynError> {
                let s: &str = Decode::<Postgres>::decode(value)?;
                s.parse().map_err(|e: String| e.into())
            }
        }

        impl Encode<'_, Postgres> for $ty {
            fn encode_by_ref(
                &self,
                buf: &mut sqlx::postgres::PgArgumentBuffer,
            ) -> sqlx::encode::IsNull {
                <&str as Encode<Postgres>>::encode(self.as_str(), buf)
            }
        }
    };
}

text_column!(BookStatus);
text_column!(BorrowingPrivilege);
text_column!(Role);
