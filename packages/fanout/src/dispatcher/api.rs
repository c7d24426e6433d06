//! Token-checked endpoint bodies behind the HTTP handlers: service and
//! group catalogs, runtime introspection, lifecycle commands and token
//! database edits. Everything returns loose JSON because the shapes are
//! keyed by service and group names.

use serde_json::{json, Map, Value};

use fanout_types::TokensPatch;

use super::Dispatcher;

const CONFIG_DISABLED: &str = "Configuration via API is disabled";
const INSUFFICIENT_PERMISSIONS: &str = "Insufficient permissions";

impl Dispatcher {
    fn admin_or_superuser(&self, token: &str) -> bool {
        self.auth.authorize_admin(token) || self.auth.authorize_superuser(token)
    }

    /// `{id: name}` of the services the caller may invoke. Admins see the
    /// whole catalog even though listing is not invoking.
    pub fn get_services_info(&self, token: &str) -> Value {
        tracing::info!("{}: get_services_info: Services requested", token);
        let mut output = Map::new();
        for (id, name) in self.registry.list_services() {
            if self.admin_or_superuser(token) || self.auth.authorize_user(token, id) {
                output.insert(id.to_string(), json!(name));
            }
        }
        Value::Object(output)
    }

    /// `{id: [name, description, groups]}` of the visible services.
    pub fn get_services_info_more(&self, token: &str) -> Value {
        tracing::info!("{}: get_services_info_more: Services requested", token);
        let mut output = Map::new();
        for (id, name, description, groups) in self.registry.list_services_detailed() {
            if self.admin_or_superuser(token) || self.auth.authorize_user(token, id) {
                output.insert(id.to_string(), json!([name, description, groups]));
            }
        }
        Value::Object(output)
    }

    /// `{group: [[id, name], ...]}`; a group shows up only when the
    /// caller is authorized for at least one member.
    pub fn get_groups_info(&self, token: &str) -> Value {
        tracing::info!("{}: get_groups_info: Groups requested", token);
        let mut output = Map::new();
        for (group, members) in self.registry.groups() {
            let visible: Vec<_> = members
                .into_iter()
                .filter(|(id, _)| {
                    self.admin_or_superuser(token) || self.auth.authorize_user(token, *id)
                })
                .map(|(id, name)| json!([id, name]))
                .collect();
            if !visible.is_empty() {
                output.insert(group, Value::Array(visible));
            }
        }
        Value::Object(output)
    }

    /// The full running token configuration. Admin only.
    pub fn get_tokens_info(&self, token: &str) -> Value {
        if !self.auth.authorize_admin(token) {
            tracing::info!("{}: get_tokens_info: Insufficient permissions", token);
            return json!({ "server": INSUFFICIENT_PERMISSIONS });
        }
        tracing::info!("{}: get_tokens_info: Tokens requested", token);
        serde_json::to_value(self.auth.tokens_file()).expect("token tables are plain json")
    }

    /// Static descriptors, per-service runtime state and database sizes.
    /// Admin only.
    pub fn get_server_info(&self, token: &str) -> Value {
        if !self.auth.authorize_admin(token) {
            tracing::info!("{}: get_server_info: Insufficient permissions", token);
            return json!({ "server": INSUFFICIENT_PERMISSIONS });
        }
        tracing::info!("{}: get_server_info: Server info requested", token);

        let mut info = Map::new();
        let mut running = Map::new();
        for registered in self.registry.iter() {
            let descriptor = &registered.descriptor;
            info.insert(
                descriptor.name.clone(),
                serde_json::to_value(descriptor).expect("descriptors are plain json"),
            );
            running.insert(
                descriptor.name.clone(),
                json!({
                    "service_id": descriptor.id,
                    "running": self.engine.service_running(descriptor.id),
                    "workers": descriptor.workers(),
                    "input queue length": self.engine.input_len(descriptor.id),
                    "output queue length": self.engine.output_len(descriptor.id),
                    "pending requests": self.engine.pending_len(descriptor.id),
                }),
            );
        }

        json!({
            "info": info,
            "running": running,
            "database": self.database_info(),
        })
    }

    /// Queue and cache lengths per service, keyed by service index.
    fn database_info(&self) -> Value {
        let ids: Vec<_> = self.registry.iter().map(|s| s.descriptor.id).collect();
        json!({
            "service_input_queues":
                ids.iter().map(|id| json!({(id.to_string()): self.engine.input_len(*id)})).collect::<Vec<_>>(),
            "service_output_queues":
                ids.iter().map(|id| json!({(id.to_string()): self.engine.output_len(*id)})).collect::<Vec<_>>(),
            "tmp_queues":
                ids.iter().map(|id| json!({(id.to_string()): self.tmp_len(*id)})).collect::<Vec<_>>(),
            "service_outputs":
                ids.iter().map(|id| json!({(id.to_string()): self.cache_len(*id)})).collect::<Vec<_>>(),
            "pending":
                ids.iter().map(|id| json!({(id.to_string()): self.engine.pending_len(*id)})).collect::<Vec<_>>(),
        })
    }

    /// `{version}` for any known token.
    pub fn get_server_version(&self, token: &str) -> Value {
        if !self.auth.exists(token) {
            tracing::info!("{}: get_server_version: Insufficient permissions", token);
            return json!({ "server": INSUFFICIENT_PERMISSIONS });
        }
        tracing::info!("{}: get_server_version: Version requested", token);
        json!({ "version": self.version() })
    }

    fn gate_admin_command(&self, token: &str, command: &str) -> Option<Value> {
        if !self.auth.authorize_admin(token) {
            tracing::info!("{}: {}: Insufficient permissions", token, command);
            return Some(json!({ "server": INSUFFICIENT_PERMISSIONS }));
        }
        if self.config.disable_config_endpoints {
            tracing::warn!("{}: {}: Configuration via API is disabled", token, command);
            return Some(json!({ "server": CONFIG_DISABLED }));
        }
        None
    }

    pub fn get_start(&self, token: &str) -> Value {
        if let Some(denied) = self.gate_admin_command(token, "get_start") {
            return denied;
        }
        if self.start_services() {
            tracing::info!("{}: get_start: Services started", token);
            json!({ "server": "Services started" })
        } else {
            tracing::info!("{}: get_start: Services already running", token);
            json!({ "server": "Services already running" })
        }
    }

    pub fn get_stop(&self, token: &str) -> Value {
        if let Some(denied) = self.gate_admin_command(token, "get_stop") {
            return denied;
        }
        if self.stop_services() {
            tracing::info!("{}: get_stop: Services stopped", token);
            json!({ "server": "Services stopped" })
        } else {
            tracing::info!("{}: get_stop: Services already stopped", token);
            json!({ "server": "Services already stopped" })
        }
    }

    pub fn get_restart(&self, token: &str) -> Value {
        if let Some(denied) = self.gate_admin_command(token, "get_restart") {
            return denied;
        }
        self.restart_services();
        tracing::info!("{}: get_restart: Services restarted", token);
        json!({ "server": "Services restarted" })
    }

    pub fn get_reload_tokens(&self, token: &str) -> Value {
        if let Some(denied) = self.gate_admin_command(token, "get_reload_tokens") {
            return denied;
        }
        if self.reload_tokens() {
            tracing::info!("{}: get_reload_tokens: Tokens reloaded", token);
            json!({ "server": "Tokens successfully reloaded" })
        } else {
            tracing::info!("{}: get_reload_tokens: Error while reloading tokens", token);
            json!({ "server": "Tokens did not reload. Using old tokens." })
        }
    }

    /// Add or update token entries, then persist the store. Per-key
    /// failures are reported individually; keys with errors are not
    /// applied while valid keys in the same call are.
    pub fn put_tokens(&self, patch: &TokensPatch, token: &str) -> Value {
        if let Some(denied) = self.gate_admin_command(token, "put_tokens") {
            return denied;
        }
        if patch.is_empty() {
            tracing::info!("{}: put_tokens: Nothing provided", token);
            return json!({ "server": "Nothing provided" });
        }

        let mut output = Map::new();
        output.insert("server".into(), json!("OK"));

        if !patch.group.is_empty() {
            if self.auth.add_group(&patch.group, &patch.group_services) {
                output.insert("group".into(), json!("Group successfully added"));
            } else {
                output.insert("server".into(), json!("ERROR"));
                output.insert(
                    "group".into(),
                    json!(
                        "Error in group addition. Group name cannot be a number \
                         and group services can contain only numbers (Service IDs)."
                    ),
                );
            }
        }
        if !patch.user.is_empty() {
            if self.auth.add_user(&patch.user, &patch.user_services) {
                output.insert("user".into(), json!("User successfully added"));
            } else {
                output.insert("server".into(), json!("ERROR"));
                output.insert(
                    "user".into(),
                    json!(
                        "Error in user addition. Make sure that token has valid format and user \
                         services contain only numbers (Service IDs) or existing groups."
                    ),
                );
            }
        }
        if !patch.superuser.is_empty() {
            if self.auth.add_superuser(&patch.superuser) {
                output.insert("superuser".into(), json!("Superuser successfully added"));
            } else {
                output.insert("server".into(), json!("ERROR"));
                output.insert(
                    "superuser".into(),
                    json!("Error in superuser addition. Make sure that token has valid format."),
                );
            }
        }
        if !patch.admin.is_empty() {
            if self.auth.add_admin(&patch.admin) {
                output.insert("admin".into(), json!("Admin successfully added"));
            } else {
                output.insert("server".into(), json!("ERROR"));
                output.insert(
                    "admin".into(),
                    json!("Error in admin addition. Make sure that token has valid format."),
                );
            }
        }

        if output["server"] == json!("ERROR") {
            output.insert(
                "info".into(),
                json!("Any changes in keys containing errors will not be saved."),
            );
        }

        self.persist_tokens(&mut output, token, "put_tokens");
        Value::Object(output)
    }

    /// Delete token entries, then persist the store.
    pub fn del_tokens(&self, patch: &TokensPatch, token: &str) -> Value {
        if let Some(denied) = self.gate_admin_command(token, "del_tokens") {
            return denied;
        }
        if patch.is_empty() {
            tracing::info!("{}: del_tokens: Nothing provided", token);
            return json!({ "server": "Nothing provided" });
        }

        let mut output = Map::new();
        output.insert("server".into(), json!("OK"));

        if !patch.group.is_empty() {
            if self.auth.remove_group(&patch.group) {
                output.insert("group".into(), json!("Group successfully removed"));
            } else {
                output.insert("server".into(), json!("ERROR"));
                output.insert(
                    "group".into(),
                    json!(
                        "Error in group removal. Make sure you are not trying to delete a group \
                         which is assigned to a user. Remove the group from the user/s first."
                    ),
                );
            }
        }
        if !patch.user.is_empty() {
            if self.auth.remove_user(&patch.user) {
                output.insert("user".into(), json!("User successfully removed"));
            } else {
                output.insert("server".into(), json!("ERROR"));
                output.insert("user".into(), json!("Error in user removal"));
            }
        }
        if !patch.superuser.is_empty() {
            if self.auth.remove_superuser(&patch.superuser) {
                output.insert("superuser".into(), json!("Superuser successfully removed"));
            } else {
                output.insert("server".into(), json!("ERROR"));
                output.insert("superuser".into(), json!("Error in superuser removal"));
            }
        }
        if !patch.admin.is_empty() {
            if self.auth.remove_admin(&patch.admin) {
                output.insert("admin".into(), json!("Admin successfully removed"));
            } else {
                output.insert("server".into(), json!("ERROR"));
                output.insert("admin".into(), json!("Error in admin removal"));
            }
        }

        self.persist_tokens(&mut output, token, "del_tokens");
        Value::Object(output)
    }

    /// Shared tail of the token mutations: diff against the on-disk
    /// file, refuse no-op saves, persist with optional backup. A failed
    /// save keeps the in-memory state and warns that it is volatile.
    fn persist_tokens(&self, output: &mut Map<String, Value>, token: &str, command: &str) {
        let difference = match self.auth.diff(&self.config.tokens_path) {
            Some(difference) => difference,
            None => {
                tracing::error!("{}: {}: Error while reading tokens file", token, command);
                output.insert("server".into(), json!("ERROR"));
                output.insert(
                    "message".into(),
                    json!("Error occurred while saving tokens. Any changes will be lost on reload."),
                );
                return;
            }
        };
        if difference.as_object().map(|d| d.is_empty()).unwrap_or(true) {
            output.insert("server".into(), json!("ERROR"));
            output.insert("message".into(), json!("Nothing was changed"));
            return;
        }

        if !self
            .auth
            .save(&self.config.tokens_path, self.config.tokens_backups)
        {
            tracing::error!("{}: {}: Error while trying to save tokens", token, command);
            output.insert("server".into(), json!("ERROR"));
            output.insert(
                "message".into(),
                json!("Error occurred while saving tokens. Any changes will be lost on reload."),
            );
        }
        output.insert("changes".into(), difference);
        tracing::info!("{}: {}: Tokens edited", token, command);
    }

    fn tmp_len(&self, id: fanout_types::ServiceId) -> usize {
        self.tmp[id.index()].lock().unwrap().len()
    }

    fn cache_len(&self, id: fanout_types::ServiceId) -> usize {
        self.cache.len(id)
    }
}
