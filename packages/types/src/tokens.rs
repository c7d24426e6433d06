use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A user grant entry: either a concrete service id or the name of a
/// token group that expands to several ids at load time.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[serde(untagged)]
pub enum ServiceRef {
    Id(u32),
    Group(String),
}

impl ServiceRef {
    /// Digit strings are service ids in disguise; group names are never
    /// pure digits. Normalizes `"3"` to `Id(3)`.
    pub fn normalize(self) -> Self {
        match self {
            ServiceRef::Group(name) => {
                let trimmed = name.trim();
                match trimmed.parse::<u32>() {
                    Ok(id) => ServiceRef::Id(id),
                    Err(_) => ServiceRef::Group(trimmed.to_string()),
                }
            }
            id => id,
        }
    }
}

/// On-disk token database. All four collections must be present; unknown
/// keys are a load error.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TokensFile {
    pub groups: BTreeMap<String, Vec<u32>>,
    pub users: BTreeMap<String, Vec<ServiceRef>>,
    pub superusers: Vec<String>,
    pub admins: Vec<String>,
}

/// Body of `PUT`/`DELETE /server/tokens/`. Every field is optional; an
/// entirely empty patch is rejected with "Nothing provided".
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct TokensPatch {
    pub group: String,
    pub group_services: Vec<ServiceRef>,
    pub user: String,
    pub user_services: Vec<ServiceRef>,
    pub superuser: String,
    pub admin: String,
}

impl TokensPatch {
    pub fn is_empty(&self) -> bool {
        self.group.is_empty()
            && self.user.is_empty()
            && self.superuser.is_empty()
            && self.admin.is_empty()
    }
}
