//! State paths
//!
//! Paths form a hierarchy. A container path ends with `/` and owns the
//! element paths directly beneath it; its value is the member set of
//! element keys. The root container `/` always exists and is not stored.
//!
//! Account state lives under `/accounts/{address}/`:
//!
//! ```text
//! /accounts/0x…/            container
//! /accounts/0x…/balance     numeric
//! /accounts/0x…/nonce       numeric
//! /accounts/0x…/code        plain
//! /accounts/0x…/storage/    container of slots
//! ```

use super::value_objects::Address;

/// State path
pub type Path = String;

/// Root container, always present
pub const ROOT: &str = "/";

/// Whether `path` names a container.
pub fn is_container(path: &str) -> bool {
    path.ends_with('/')
}

/// Container directly owning `path`, `None` for the root.
pub fn parent_of(path: &str) -> Option<&str> {
    if path == ROOT || path.is_empty() {
        return None;
    }
    let trimmed = path.strip_suffix('/').unwrap_or(path);
    trimmed.rfind('/').map(|idx| &path[..=idx])
}

/// Member key of `path` within its container (`"balance"`, `"storage/"`).
pub fn element_key(path: &str) -> Option<&str> {
    parent_of(path).map(|parent| &path[parent.len()..])
}

/// Join a container and a member key.
pub fn child(container: &str, key: &str) -> Path {
    format!("{container}{key}")
}

/// Whether `path` lies strictly beneath `container`.
pub fn is_under(path: &str, container: &str) -> bool {
    is_container(container) && path.len() > container.len() && path.starts_with(container)
}

/// Account field addressed by a structured key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AccountField {
    Balance,
    Nonce,
    Code,
    Storage,
}

impl AccountField {
    fn key(&self) -> &'static str {
        match self {
            Self::Balance => "balance",
            Self::Nonce => "nonce",
            Self::Code => "code",
            Self::Storage => "storage/",
        }
    }
}

/// Structured account path builder.
///
/// Fee and nonce handling compares paths built here for equality instead
/// of matching on path fragments.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AccountPath {
    pub address: Address,
    pub field: Option<AccountField>,
}

impl AccountPath {
    /// Container holding every account
    pub const ACCOUNTS: &'static str = "/accounts/";

    pub fn container(address: Address) -> Self {
        Self {
            address,
            field: None,
        }
    }

    pub fn field(address: Address, field: AccountField) -> Self {
        Self {
            address,
            field: Some(field),
        }
    }

    pub fn to_path(&self) -> Path {
        let base = format!("{}{:#x}/", Self::ACCOUNTS, self.address);
        match self.field {
            None => base,
            Some(field) => child(&base, field.key()),
        }
    }
}

/// `/accounts/{address}/`
pub fn account(address: &Address) -> Path {
    AccountPath::container(*address).to_path()
}

/// `/accounts/{address}/balance`
pub fn balance(address: &Address) -> Path {
    AccountPath::field(*address, AccountField::Balance).to_path()
}

/// `/accounts/{address}/nonce`
pub fn nonce(address: &Address) -> Path {
    AccountPath::field(*address, AccountField::Nonce).to_path()
}

/// `/accounts/{address}/code`
pub fn code(address: &Address) -> Path {
    AccountPath::field(*address, AccountField::Code).to_path()
}

/// `/accounts/{address}/storage/`
pub fn storage(address: &Address) -> Path {
    AccountPath::field(*address, AccountField::Storage).to_path()
}

/// `/accounts/{address}/storage/{key}`
pub fn storage_slot(address: &Address, key: &str) -> Path {
    child(&storage(address), key)
}
