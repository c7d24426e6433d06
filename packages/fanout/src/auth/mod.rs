//! The authorization manager: the in-memory token database and every
//! question the server asks about it. Tables are replaced atomically on
//! reload so concurrent readers always see a consistent snapshot.

mod file;

use regex::Regex;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use thiserror::Error;

use fanout_types::{ServiceId, ServiceRef, TokensFile};

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Tokens file: {0}: {1}")]
    Io(PathBuf, String),

    #[error("Syntax error in tokens file: {0}: {1}")]
    Parse(PathBuf, String),

    #[error("Unsupported tokens file format: {0} (expected .json or .toml)")]
    UnsupportedFormat(PathBuf),

    #[error("Could not find a free backup name near: {0}")]
    BackupExhausted(PathBuf),

    #[error("Invalid {role} token: {token}, token did not match token_regex")]
    InvalidToken { role: &'static str, token: String },

    #[error("Invalid group name: {0}, group names must not be digit strings")]
    DigitGroupName(String),

    #[error("Group name {0} does not exist")]
    UnknownGroup(String),

    #[error("Invalid token regex: {0}")]
    InvalidRegex(String),
}

/// One immutable snapshot of the token database.
///
/// `users` is the load-time expansion of `users_mixed`: group names
/// resolved to the union of their service ids. The mixed form is kept
/// for display and for writing the file back the way the operator
/// maintains it.
#[derive(Clone, Default)]
struct TokenStore {
    admins: Vec<String>,
    superusers: Vec<String>,
    groups: BTreeMap<String, Vec<u32>>,
    users_mixed: BTreeMap<String, Vec<ServiceRef>>,
    users: BTreeMap<String, BTreeSet<u32>>,
}

impl TokenStore {
    fn build(tokens: TokensFile, regex: Option<&Regex>) -> Result<Self, AuthError> {
        let mut store = TokenStore::default();

        for token in tokens.admins {
            if !format_ok(&token, regex) {
                return Err(AuthError::InvalidToken {
                    role: "admin",
                    token,
                });
            }
            store.admins.push(token);
        }
        for token in tokens.superusers {
            if !format_ok(&token, regex) {
                return Err(AuthError::InvalidToken {
                    role: "superuser",
                    token,
                });
            }
            store.superusers.push(token);
        }

        for (name, services) in tokens.groups {
            // digit names are indistinguishable from service ids in user
            // entries, so they are rejected outright
            if name.chars().all(|c| c.is_ascii_digit()) {
                return Err(AuthError::DigitGroupName(name));
            }
            store.groups.insert(name, services);
        }

        for (token, refs) in tokens.users {
            if !format_ok(&token, regex) {
                return Err(AuthError::InvalidToken {
                    role: "user",
                    token,
                });
            }
            let mut expanded = BTreeSet::new();
            for service_ref in &refs {
                match service_ref {
                    ServiceRef::Id(id) => {
                        expanded.insert(*id);
                    }
                    ServiceRef::Group(name) => {
                        let members = store
                            .groups
                            .get(name)
                            .ok_or_else(|| AuthError::UnknownGroup(name.clone()))?;
                        expanded.extend(members.iter().copied());
                    }
                }
            }
            store.users.insert(token.clone(), expanded);
            store.users_mixed.insert(token, refs);
        }

        Ok(store)
    }

    fn to_file(&self) -> TokensFile {
        TokensFile {
            groups: self.groups.clone(),
            users: self.users_mixed.clone(),
            superusers: self.superusers.clone(),
            admins: self.admins.clone(),
        }
    }
}

fn format_ok(token: &str, regex: Option<&Regex>) -> bool {
    match regex {
        Some(regex) => regex.is_match(token),
        None => true,
    }
}

pub struct AuthManager {
    store: RwLock<TokenStore>,
    regex: Option<Regex>,
    bypass_user: bool,
    bypass_admin: bool,
}

impl AuthManager {
    pub fn new(
        path: &Path,
        token_regex: &str,
        bypass_user: bool,
        bypass_admin: bool,
    ) -> Result<Self, AuthError> {
        let tokens = file::load(path)?;
        Self::from_tokens(tokens, token_regex, bypass_user, bypass_admin)
    }

    /// Builds the manager from an in-memory token set; used by tests and
    /// by `new` after the file is parsed.
    pub fn from_tokens(
        tokens: TokensFile,
        token_regex: &str,
        bypass_user: bool,
        bypass_admin: bool,
    ) -> Result<Self, AuthError> {
        let regex = compile_regex(token_regex)?;
        let store = TokenStore::build(tokens, regex.as_ref())?;
        Ok(Self {
            store: RwLock::new(store),
            regex,
            bypass_user,
            bypass_admin,
        })
    }

    fn valid_format(&self, token: &str) -> bool {
        format_ok(token, self.regex.as_ref())
    }

    // ============================ queries ==============================

    /// Any known token: user, superuser or admin. Bypass modes accept
    /// everything without even a format check.
    pub fn exists(&self, token: &str) -> bool {
        if self.bypass_user || self.bypass_admin {
            return true;
        }
        if !self.valid_format(token) {
            return false;
        }
        let store = self.store.read().unwrap();
        store.superusers.iter().any(|t| t == token)
            || store.admins.iter().any(|t| t == token)
            || store.users.contains_key(token)
    }

    /// Whether the token may invoke the service. Superusers may invoke
    /// everything.
    pub fn authorize_user(&self, token: &str, service_id: ServiceId) -> bool {
        if self.bypass_user {
            return true;
        }
        if !self.valid_format(token) {
            return false;
        }
        let store = self.store.read().unwrap();
        if store.superusers.iter().any(|t| t == token) {
            return true;
        }
        store
            .users
            .get(token)
            .map(|services| services.contains(&service_id.inner()))
            .unwrap_or(false)
    }

    /// Projects the authorized subset of `service_ids` for this token.
    pub fn filter_authorized(&self, token: &str, service_ids: &[ServiceId]) -> Vec<ServiceId> {
        if self.bypass_user {
            return service_ids.to_vec();
        }
        if !self.valid_format(token) {
            return Vec::new();
        }
        let store = self.store.read().unwrap();
        if store.superusers.iter().any(|t| t == token) {
            return service_ids.to_vec();
        }
        match store.users.get(token) {
            Some(services) => service_ids
                .iter()
                .filter(|id| services.contains(&id.inner()))
                .copied()
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn authorize_admin(&self, token: &str) -> bool {
        if self.bypass_admin {
            return true;
        }
        if !self.valid_format(token) {
            return false;
        }
        self.store.read().unwrap().admins.iter().any(|t| t == token)
    }

    pub fn authorize_superuser(&self, token: &str) -> bool {
        if self.bypass_user {
            return true;
        }
        if !self.valid_format(token) {
            return false;
        }
        self.store
            .read()
            .unwrap()
            .superusers
            .iter()
            .any(|t| t == token)
    }

    pub fn len_users(&self) -> usize {
        self.store.read().unwrap().users.len()
    }

    pub fn len_superusers(&self) -> usize {
        self.store.read().unwrap().superusers.len()
    }

    /// Mixed-form snapshot for display and persistence.
    pub fn tokens_file(&self) -> TokensFile {
        self.store.read().unwrap().to_file()
    }

    // =========================== mutations =============================

    pub fn add_admin(&self, token: &str) -> bool {
        if !self.valid_format(token) {
            return false;
        }
        let mut store = self.store.write().unwrap();
        if !store.admins.iter().any(|t| t == token) {
            store.admins.push(token.to_string());
        }
        true
    }

    pub fn remove_admin(&self, token: &str) -> bool {
        if !self.valid_format(token) {
            return false;
        }
        let mut store = self.store.write().unwrap();
        match store.admins.iter().position(|t| t == token) {
            Some(index) => {
                store.admins.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn add_superuser(&self, token: &str) -> bool {
        if !self.valid_format(token) {
            return false;
        }
        let mut store = self.store.write().unwrap();
        if !store.superusers.iter().any(|t| t == token) {
            store.superusers.push(token.to_string());
        }
        true
    }

    pub fn remove_superuser(&self, token: &str) -> bool {
        if !self.valid_format(token) {
            return false;
        }
        let mut store = self.store.write().unwrap();
        match store.superusers.iter().position(|t| t == token) {
            Some(index) => {
                store.superusers.remove(index);
                true
            }
            None => false,
        }
    }

    /// Creates or overwrites a group. Members must be service ids;
    /// digit strings are accepted and converted, anything else refused.
    pub fn add_group(&self, name: &str, services: &[ServiceRef]) -> bool {
        if name.chars().all(|c| c.is_ascii_digit()) {
            return false;
        }
        let mut members = Vec::new();
        for service_ref in services {
            match service_ref.clone().normalize() {
                ServiceRef::Id(id) => members.push(id),
                ServiceRef::Group(name) if name.is_empty() => continue,
                ServiceRef::Group(_) => return false,
            }
        }
        self.store
            .write()
            .unwrap()
            .groups
            .insert(name.to_string(), members);
        true
    }

    /// Refused while any user still references the group, since removing
    /// it would silently change that user's expansion on the next load.
    pub fn remove_group(&self, name: &str) -> bool {
        let mut store = self.store.write().unwrap();
        if !store.groups.contains_key(name) {
            return false;
        }
        let referenced = store.users_mixed.values().any(|refs| {
            refs.iter()
                .any(|r| matches!(r, ServiceRef::Group(group) if group == name))
        });
        if referenced {
            return false;
        }
        store.groups.remove(name);
        true
    }

    /// Creates or overwrites a user. Entries may be service ids, digit
    /// strings, or names of existing groups (expanded immediately).
    pub fn add_user(&self, token: &str, services: &[ServiceRef]) -> bool {
        if !self.valid_format(token) {
            return false;
        }
        let mut store = self.store.write().unwrap();
        let mut refs = Vec::new();
        let mut expanded = BTreeSet::new();
        for service_ref in services {
            match service_ref.clone().normalize() {
                ServiceRef::Id(id) => {
                    expanded.insert(id);
                    refs.push(ServiceRef::Id(id));
                }
                ServiceRef::Group(name) if name.is_empty() => continue,
                ServiceRef::Group(name) => match store.groups.get(&name) {
                    Some(members) => {
                        expanded.extend(members.iter().copied());
                        refs.push(ServiceRef::Group(name));
                    }
                    None => return false,
                },
            }
        }
        store.users_mixed.insert(token.to_string(), refs);
        store.users.insert(token.to_string(), expanded);
        true
    }

    pub fn remove_user(&self, token: &str) -> bool {
        let mut store = self.store.write().unwrap();
        if store.users.remove(token).is_none() {
            return false;
        }
        store.users_mixed.remove(token);
        true
    }

    // ========================= file operations =========================

    /// Replaces the in-memory tables with the on-disk state. On any load
    /// or validation error the running tables are left untouched.
    pub fn reload(&self, path: &Path) -> Result<(), AuthError> {
        let tokens = file::load(path)?;
        let fresh = TokenStore::build(tokens, self.regex.as_ref())?;
        *self.store.write().unwrap() = fresh;
        Ok(())
    }

    /// Difference between the running tables and the given file, shaped
    /// as `{section: {add, del}}` with only changed sections present.
    /// `None` when the file cannot be read or parsed.
    pub fn diff(&self, path: &Path) -> Option<Value> {
        let saved = file::load(path).ok()?;
        // the file is loaded without format checking, like any external
        // snapshot we only diff against
        let saved = TokenStore::build(saved, None).ok()?;
        let store = self.store.read().unwrap();

        let mut difference = Map::new();
        if let Some(delta) = delta_list(&store.superusers, &saved.superusers) {
            difference.insert("superusers".into(), delta);
        }
        if let Some(delta) = delta_list(&store.admins, &saved.admins) {
            difference.insert("admins".into(), delta);
        }
        if let Some(delta) = delta_map(&store.groups, &saved.groups) {
            difference.insert("groups".into(), delta);
        }
        let users: BTreeMap<String, Vec<u32>> = store
            .users
            .iter()
            .map(|(token, set)| (token.clone(), set.iter().copied().collect()))
            .collect();
        let saved_users: BTreeMap<String, Vec<u32>> = saved
            .users
            .iter()
            .map(|(token, set)| (token.clone(), set.iter().copied().collect()))
            .collect();
        if let Some(delta) = delta_map(&users, &saved_users) {
            difference.insert("users".into(), delta);
        }

        Some(Value::Object(difference))
    }

    /// Writes the running tables to disk, optionally moving the old file
    /// into a timestamped backup first. Returns false on any failure;
    /// the in-memory state is never touched.
    pub fn save(&self, path: &Path, create_backup: bool) -> bool {
        let serialized = match file::serialize(&self.tokens_file(), path) {
            Ok(serialized) => serialized,
            Err(err) => {
                tracing::error!("AuthManager: cannot serialize tokens: {}", err);
                return false;
            }
        };
        if create_backup {
            if let Err(err) = file::backup(path) {
                tracing::error!("AuthManager: cannot back up tokens file: {}", err);
                return false;
            }
        }
        if let Err(err) = std::fs::write(path, serialized) {
            tracing::error!(
                "AuthManager: cannot write tokens file: {}: {}",
                path.display(),
                err
            );
            return false;
        }
        true
    }
}

fn compile_regex(token_regex: &str) -> Result<Option<Regex>, AuthError> {
    if token_regex.is_empty() {
        return Ok(None);
    }
    Regex::new(token_regex)
        .map(Some)
        .map_err(|_| AuthError::InvalidRegex(token_regex.to_string()))
}

fn delta_list(current: &[String], saved: &[String]) -> Option<Value> {
    let add: Vec<&String> = current.iter().filter(|t| !saved.contains(t)).collect();
    let del: Vec<&String> = saved.iter().filter(|t| !current.contains(t)).collect();
    if add.is_empty() && del.is_empty() {
        None
    } else {
        Some(json!({ "add": add, "del": del }))
    }
}

fn delta_map<V: PartialEq + serde::Serialize>(
    current: &BTreeMap<String, V>,
    saved: &BTreeMap<String, V>,
) -> Option<Value> {
    let mut add = Map::new();
    let mut del = Map::new();
    for (key, value) in current {
        if saved.get(key) != Some(value) {
            add.insert(key.clone(), json!(value));
        }
    }
    for (key, value) in saved {
        if !current.contains_key(key) {
            del.insert(key.clone(), json!(value));
        }
    }
    if add.is_empty() && del.is_empty() {
        None
    } else {
        Some(json!({ "add": add, "del": del }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const USER: &str = "usertoken1234";
    const SUPER: &str = "supertoken1234";
    const ADMIN: &str = "admintoken1234";

    fn tokens() -> TokensFile {
        serde_json::from_value(json!({
            "groups": { "net": [0, 1] },
            "users": { USER: [2, "net"] },
            "superusers": [SUPER],
            "admins": [ADMIN]
        }))
        .unwrap()
    }

    fn manager() -> AuthManager {
        AuthManager::from_tokens(tokens(), "^[A-Za-z0-9]{10,}$", false, false).unwrap()
    }

    #[test]
    fn users_expand_group_references() {
        let auth = manager();
        for id in [0, 1, 2] {
            assert!(auth.authorize_user(USER, ServiceId::new(id)));
        }
        assert!(!auth.authorize_user(USER, ServiceId::new(3)));
    }

    #[test]
    fn superusers_are_authorized_everywhere() {
        let auth = manager();
        assert!(auth.authorize_user(SUPER, ServiceId::new(99)));
        assert!(auth.authorize_superuser(SUPER));
        assert!(!auth.authorize_admin(SUPER));
        assert!(auth.authorize_admin(ADMIN));
    }

    #[test]
    fn filter_projects_the_authorized_subset() {
        let auth = manager();
        let ids: Vec<ServiceId> = [0, 3, 2].into_iter().map(ServiceId::new).collect();
        assert_eq!(
            auth.filter_authorized(USER, &ids),
            vec![ServiceId::new(0), ServiceId::new(2)]
        );
        assert_eq!(auth.filter_authorized("unknowntoken99", &ids), vec![]);
        assert_eq!(auth.filter_authorized(SUPER, &ids), ids);
    }

    #[test]
    fn format_check_rejects_short_tokens() {
        let auth = manager();
        assert!(!auth.exists("short"));
        assert!(!auth.add_admin("short"));

        let lax = AuthManager::from_tokens(tokens(), "", false, false).unwrap();
        assert!(lax.add_admin("x"));
    }

    #[test]
    fn bypass_modes_accept_everything() {
        let auth = AuthManager::from_tokens(tokens(), "^[A-Za-z0-9]{10,}$", true, true).unwrap();
        assert!(auth.exists(""));
        assert!(auth.authorize_user("", ServiceId::new(7)));
        assert!(auth.authorize_admin(""));
    }

    #[test]
    fn authorization_is_monotonic_under_removal() {
        let auth = manager();
        let id = ServiceId::new(2);
        assert!(auth.authorize_user(USER, id));
        assert!(auth.remove_user(USER));
        assert!(!auth.authorize_user(USER, id));
        assert!(!auth.exists(USER));

        assert!(auth.add_user(USER, &[ServiceRef::Id(2)]));
        assert!(auth.authorize_user(USER, id));
    }

    #[test]
    fn group_removal_refused_while_referenced() {
        let auth = manager();
        assert!(!auth.remove_group("net"));

        assert!(auth.remove_user(USER));
        assert!(auth.remove_group("net"));
        assert!(!auth.remove_group("net"));
    }

    #[test]
    fn add_group_accepts_digit_strings_only() {
        let auth = manager();
        assert!(auth.add_group(
            "web",
            &[ServiceRef::Id(1), ServiceRef::Group("2".into())]
        ));
        assert!(!auth.add_group("web", &[ServiceRef::Group("nope".into())]));
        assert!(!auth.add_group("123", &[]));

        assert!(auth.add_user("newusertoken99", &[ServiceRef::Group("web".into())]));
        assert!(auth.authorize_user("newusertoken99", ServiceId::new(2)));
    }

    #[test]
    fn add_user_rejects_unknown_groups() {
        let auth = manager();
        assert!(!auth.add_user("newusertoken99", &[ServiceRef::Group("ghost".into())]));
    }

    #[test]
    fn digit_group_names_fail_the_load() {
        let tokens: TokensFile = serde_json::from_value(json!({
            "groups": { "12": [0] },
            "users": {},
            "superusers": [],
            "admins": []
        }))
        .unwrap();
        assert!(matches!(
            AuthManager::from_tokens(tokens, "", false, false),
            Err(AuthError::DigitGroupName(_))
        ));
    }

    #[test]
    fn save_load_round_trips_canonically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        let auth = manager();
        assert!(auth.save(&path, false));

        let reloaded = AuthManager::new(&path, "^[A-Za-z0-9]{10,}$", false, false).unwrap();
        assert_eq!(reloaded.tokens_file(), auth.tokens_file());

        // byte-for-byte stable once canonicalized
        let first = std::fs::read(&path).unwrap();
        assert!(reloaded.save(&path, false));
        assert_eq!(std::fs::read(&path).unwrap(), first);
    }

    #[test]
    fn diff_reports_only_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        let auth = manager();
        assert!(auth.save(&path, false));

        let diff = auth.diff(&path).unwrap();
        assert!(diff.as_object().unwrap().is_empty());

        assert!(auth.add_admin("extraadmin99"));
        let diff = auth.diff(&path).unwrap();
        assert_eq!(diff["admins"]["add"], json!(["extraadmin99"]));
        assert_eq!(diff["admins"]["del"], json!([]));
        assert!(diff.get("users").is_none());

        assert!(auth.diff(dir.path().join("missing.json").as_path()).is_none());
    }

    #[test]
    fn save_with_backup_preserves_the_old_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        let auth = manager();
        assert!(auth.save(&path, false));
        assert!(auth.add_admin("extraadmin99"));
        assert!(auth.save(&path, true));

        let backups: Vec<_> = std::fs::read_dir(dir.path().join("tokens_backups"))
            .unwrap()
            .collect();
        assert_eq!(backups.len(), 1);

        let reloaded = AuthManager::new(&path, "", false, false).unwrap();
        assert!(reloaded.authorize_admin("extraadmin99"));
    }

    #[test]
    fn reload_keeps_old_state_on_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        std::fs::write(&path, "{ not json").unwrap();

        let auth = manager();
        assert!(auth.reload(&path).is_err());
        assert!(auth.authorize_admin(ADMIN));
    }
}
