use thiserror::Error;

use fanout_types::{ServiceDescriptor, ServiceId, ServiceSpec};

use crate::config::Config;
use crate::services::SharedService;

/// Characters allowed in service and group names besides ASCII
/// letters and digits.
const ALLOWED_CHARS: [char; 4] = [' ', '_', '-', '.'];

/// `server` is the key of the response envelope, `auto` belongs to the
/// web client's search selector.
const RESERVED_NAMES: [&str; 2] = ["server", "auto"];

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("There are no services to run. Define a service first.")]
    Empty,

    #[error("Service '{0}': every service must have at least 1 thread/process")]
    NoWorkers(String),

    #[error("Every service must have a service name")]
    UnnamedService,

    #[error("Invalid service name '{0}': it can contain only ASCII letters, numbers or ' ', '_', '-', '.'")]
    InvalidName(String),

    #[error("Invalid service name '{0}': name cannot end with ' ', '_', '-' or '.'")]
    NameEndsInPunctuation(String),

    #[error("Invalid service name '{got}', did you mean '{want}'?")]
    NameHasPadding { got: String, want: String },

    #[error("Names 'server' and 'auto' are reserved. Please use a different name.")]
    ReservedName,

    #[error("Service name '{0}' is already being used by a different service. Choose a unique name.")]
    DuplicateName(String),

    #[error("Service '{0}': service ID {1} is too large")]
    IdTooLarge(String, u32),

    #[error("Service '{0}': service ID must be unique")]
    DuplicateId(String),

    #[error("Invalid group name '{0}': it can contain only ASCII letters, numbers or ' ', '_', '-', '.'")]
    InvalidGroupName(String),

    #[error("Invalid group name '{0}': name cannot end with ' ', '_', '-' or '.'")]
    GroupNameEndsInPunctuation(String),

    #[error("Invalid group name '{got}', did you mean '{want}'?")]
    GroupNameHasPadding { got: String, want: String },

    #[error("Invalid group name '{0}': digit-only names are reserved for service IDs")]
    DigitGroupName(String),

    #[error("Invalid group name '{0}': it cannot start with 'list '")]
    ListPrefixGroupName(String),

    #[error("Invalid group name '{0}': it could be confused with the implicit group name 'all'")]
    AllLookalike(String),

    #[error("Invalid service group '{0}': it cannot be the name of a service while name groups are enabled")]
    GroupShadowsService(String),

    #[error("Service group '{0}' is already used by a different service. It must be unique while name groups are enabled.")]
    NameGroupCollision(String),
}

/// A validated service together with its frozen descriptor. The vector
/// inside [`Registry`] is sorted so that `services[i].descriptor.id == i`.
pub struct RegisteredService {
    pub service: SharedService,
    pub descriptor: ServiceDescriptor,
}

/// Immutable catalog of every hosted service, built once at startup.
///
/// Consumes the explicit registration table (no runtime plugin
/// discovery): each instance declares a [`ServiceSpec`], the registry
/// validates it, injects the implicit `all`/name groups, fills missing
/// ids with the lowest unused value and sorts by id. Any violation is
/// fatal at startup.
pub struct Registry {
    services: Vec<RegisteredService>,
    group_names: Vec<String>,
    key_sensitivity: bool,
}

impl Registry {
    pub fn new(instances: Vec<SharedService>, config: &Config) -> Result<Self, RegistryError> {
        let mut specs: Vec<(SharedService, ServiceSpec)> = Vec::new();
        let mut group_names: Vec<String> = Vec::new();

        for service in instances {
            let mut spec = service.spec();
            if spec.ignore {
                continue;
            }
            validate_spec(
                &mut spec,
                specs.iter().map(|(_, s)| s),
                &group_names,
                config,
            )?;
            for group in &spec.groups {
                if !group_names.contains(group) {
                    group_names.push(group.clone());
                }
            }
            specs.push((service, spec));
        }

        if specs.is_empty() {
            return Err(RegistryError::Empty);
        }

        assign_ids(&mut specs)?;
        specs.sort_by_key(|(_, spec)| spec.service_id);

        let services = specs
            .into_iter()
            .map(|(service, spec)| RegisteredService {
                descriptor: ServiceDescriptor {
                    id: ServiceId::new(spec.service_id.expect("ids assigned above")),
                    name: spec.name,
                    description: spec.description,
                    threads: spec.threads,
                    processes: spec.processes,
                    timeout: spec.timeout,
                    max_timeouts: spec.max_timeouts,
                    groups: spec.groups,
                    allow_batch: spec.allow_batch,
                },
                service,
            })
            .collect::<Vec<_>>();

        tracing::info!(
            "Registry: initialized with services ({}): {:?}",
            services.len(),
            services
                .iter()
                .map(|s| s.descriptor.name.as_str())
                .collect::<Vec<_>>()
        );
        tracing::debug!(
            "Registry: initialized with service groups ({}): {:?}",
            group_names.len(),
            group_names
        );

        Ok(Self {
            services,
            group_names,
            key_sensitivity: config.key_sensitivity,
        })
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn get(&self, id: ServiceId) -> Option<&RegisteredService> {
        self.services.get(id.index())
    }

    pub fn descriptor(&self, id: ServiceId) -> Option<&ServiceDescriptor> {
        self.get(id).map(|s| &s.descriptor)
    }

    pub fn contains(&self, id: ServiceId) -> bool {
        id.index() < self.services.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegisteredService> {
        self.services.iter()
    }

    /// `[(id, name)]` for every service, sorted by id.
    pub fn list_services(&self) -> Vec<(ServiceId, String)> {
        self.services
            .iter()
            .map(|s| (s.descriptor.id, s.descriptor.name.clone()))
            .collect()
    }

    /// `[(id, name, description, groups)]` for every service.
    pub fn list_services_detailed(&self) -> Vec<(ServiceId, String, String, Vec<String>)> {
        self.services
            .iter()
            .map(|s| {
                (
                    s.descriptor.id,
                    s.descriptor.name.clone(),
                    s.descriptor.description.clone(),
                    s.descriptor.groups.clone(),
                )
            })
            .collect()
    }

    /// Every known group with its member services, in first-declared order.
    pub fn groups(&self) -> Vec<(String, Vec<(ServiceId, String)>)> {
        self.group_names
            .iter()
            .map(|name| (name.clone(), self.resolve_group(name, true)))
            .collect()
    }

    /// Services belonging to a group, empty when the group is unknown.
    pub fn resolve_group(&self, group: &str, case_sensitive: bool) -> Vec<(ServiceId, String)> {
        self.services
            .iter()
            .filter(|s| {
                if case_sensitive {
                    s.descriptor.groups.iter().any(|g| g == group)
                } else {
                    s.descriptor
                        .groups
                        .iter()
                        .any(|g| g.eq_ignore_ascii_case(group))
                }
            })
            .map(|s| (s.descriptor.id, s.descriptor.name.clone()))
            .collect()
    }

    pub fn key_sensitivity(&self) -> bool {
        self.key_sensitivity
    }
}

fn valid_name_chars(name: &str) -> bool {
    name.chars()
        .all(|c| c.is_ascii_alphanumeric() || ALLOWED_CHARS.contains(&c))
}

fn validate_spec<'a>(
    spec: &mut ServiceSpec,
    registered: impl Iterator<Item = &'a ServiceSpec> + Clone,
    group_names: &[String],
    config: &Config,
) -> Result<(), RegistryError> {
    if spec.threads + spec.processes == 0 {
        return Err(RegistryError::NoWorkers(spec.name.clone()));
    }

    // Service name validation
    if spec.name.is_empty() {
        return Err(RegistryError::UnnamedService);
    }
    if !valid_name_chars(&spec.name) {
        return Err(RegistryError::InvalidName(spec.name.clone()));
    }
    if spec.name.ends_with(ALLOWED_CHARS) {
        return Err(RegistryError::NameEndsInPunctuation(spec.name.clone()));
    }
    if spec.name != spec.name.trim() {
        return Err(RegistryError::NameHasPadding {
            got: spec.name.clone(),
            want: spec.name.trim().to_string(),
        });
    }
    if RESERVED_NAMES.contains(&spec.name.to_ascii_lowercase().as_str()) {
        return Err(RegistryError::ReservedName);
    }
    for other in registered.clone() {
        let clash = if config.key_sensitivity {
            other.name == spec.name
        } else {
            other.name.eq_ignore_ascii_case(&spec.name)
        };
        if clash {
            return Err(RegistryError::DuplicateName(spec.name.clone()));
        }
    }

    // Explicit id uniqueness; range is checked against the final count
    // once every service is collected
    if let Some(id) = spec.service_id {
        if registered.clone().any(|other| other.service_id == Some(id)) {
            return Err(RegistryError::DuplicateId(spec.name.clone()));
        }
    }

    // Implicit `all` group
    if !config.disable_all_groups {
        for group in &spec.groups {
            if group.trim().eq_ignore_ascii_case("all") && group != "all" {
                return Err(RegistryError::AllLookalike(group.clone()));
            }
        }
        if !spec.groups.iter().any(|g| g == "all") {
            spec.groups.insert(0, "all".to_string());
        }
    } else {
        spec.groups.retain(|g| g != "all");
    }

    let registered_names: Vec<&str> = registered.clone().map(|s| s.name.as_str()).collect();
    for group in &spec.groups {
        if !valid_name_chars(group) {
            return Err(RegistryError::InvalidGroupName(group.clone()));
        }
        if group.ends_with(ALLOWED_CHARS) {
            return Err(RegistryError::GroupNameEndsInPunctuation(group.clone()));
        }
        if group != group.trim() {
            return Err(RegistryError::GroupNameHasPadding {
                got: group.clone(),
                want: group.trim().to_string(),
            });
        }
        // Digit strings route to get_service in URLs, a digit group
        // could never be invoked
        if group.chars().all(|c| c.is_ascii_digit()) {
            return Err(RegistryError::DigitGroupName(group.clone()));
        }
        // the web client prefixes batch searches with "list "
        if group.to_ascii_lowercase().starts_with("list ") {
            return Err(RegistryError::ListPrefixGroupName(group.clone()));
        }
        if !config.disable_name_groups {
            let shadows = registered_names.iter().any(|name| {
                if config.key_sensitivity {
                    *name == group
                } else {
                    name.eq_ignore_ascii_case(group)
                }
            });
            if shadows {
                return Err(RegistryError::GroupShadowsService(group.clone()));
            }
        }
        if !config.key_sensitivity
            && !group_names.contains(group)
            && group_names.iter().any(|g| g.eq_ignore_ascii_case(group))
        {
            tracing::warn!(
                "Registry: service groups '{}' and its case variant are considered the same due to key_sensitivity=false",
                group
            );
        }
    }

    // Implicit name group
    if !config.disable_name_groups {
        let collides = group_names.iter().any(|g| {
            if config.key_sensitivity {
                g == &spec.name
            } else {
                g.eq_ignore_ascii_case(&spec.name)
            }
        });
        if collides {
            return Err(RegistryError::NameGroupCollision(spec.name.clone()));
        }
        if !spec.groups.iter().any(|g| g == &spec.name) {
            spec.groups.insert(0, spec.name.clone());
        }
    }

    if u64::from(spec.timeout) > config.max_service_run_time {
        tracing::warn!(
            "Registry: service '{}' timeout: {} is more than global 'max_service_run_time'={}, this might result in unexpected behavior",
            spec.name,
            spec.timeout,
            config.max_service_run_time
        );
    }
    if spec.threads > 0 && spec.processes > 0 {
        tracing::warn!(
            "Registry: service '{}' is mixing threads ({}) and processes ({})",
            spec.name,
            spec.threads,
            spec.processes
        );
    }

    Ok(())
}

/// Fill missing ids with the lowest unused value and verify explicit ids
/// fit into the dense 0..n range.
fn assign_ids(specs: &mut [(SharedService, ServiceSpec)]) -> Result<(), RegistryError> {
    let count = specs.len() as u32;
    for (_, spec) in specs.iter() {
        if let Some(id) = spec.service_id {
            if id >= count {
                return Err(RegistryError::IdTooLarge(spec.name.clone(), id));
            }
        }
    }

    let mut taken: Vec<u32> = specs.iter().filter_map(|(_, s)| s.service_id).collect();
    for (_, spec) in specs.iter_mut() {
        if spec.service_id.is_none() {
            let id = (0..count)
                .find(|candidate| !taken.contains(candidate))
                .expect("fewer ids than services");
            spec.service_id = Some(id);
            taken.push(id);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{Service, ServiceResult};
    use fanout_types::ServiceSpec;
    use serde_json::{json, Value};
    use std::sync::Arc;

    struct Fake {
        spec: ServiceSpec,
    }

    impl Fake {
        fn named(name: &str) -> Arc<Self> {
            Self::with(ServiceSpec {
                name: name.to_string(),
                ..ServiceSpec::default()
            })
        }

        fn with(spec: ServiceSpec) -> Arc<Self> {
            Arc::new(Self { spec })
        }
    }

    impl Service for Fake {
        fn spec(&self) -> ServiceSpec {
            self.spec.clone()
        }

        fn run(&self, request: &str) -> ServiceResult<Value> {
            Ok(json!({ "ok": request }))
        }
    }

    fn config() -> Config {
        Config::default()
    }

    #[test]
    fn assigns_dense_ids_and_sorts() {
        let registry = Registry::new(
            vec![
                Fake::with(ServiceSpec {
                    name: "b".into(),
                    service_id: Some(2),
                    ..ServiceSpec::default()
                }),
                Fake::named("c"),
                Fake::with(ServiceSpec {
                    name: "a".into(),
                    service_id: Some(0),
                    ..ServiceSpec::default()
                }),
            ],
            &config(),
        )
        .unwrap();

        assert_eq!(
            registry.list_services(),
            vec![
                (ServiceId::new(0), "a".to_string()),
                (ServiceId::new(1), "c".to_string()),
                (ServiceId::new(2), "b".to_string()),
            ]
        );
    }

    #[test]
    fn rejects_reserved_and_duplicate_names() {
        assert!(matches!(
            Registry::new(vec![Fake::named("Server")], &config()),
            Err(RegistryError::ReservedName)
        ));

        // case-insensitive duplicate under the default key_sensitivity=false
        assert!(matches!(
            Registry::new(vec![Fake::named("whois"), Fake::named("WhoIs")], &config()),
            Err(RegistryError::DuplicateName(_))
        ));
    }

    #[test]
    fn rejects_bad_names() {
        assert!(matches!(
            Registry::new(vec![Fake::named("dns:lookup")], &config()),
            Err(RegistryError::InvalidName(_))
        ));
        assert!(matches!(
            Registry::new(vec![Fake::named("dns.")], &config()),
            Err(RegistryError::NameEndsInPunctuation(_))
        ));
        assert!(matches!(
            Registry::new(
                vec![Fake::with(ServiceSpec {
                    name: "x".into(),
                    threads: 0,
                    processes: 0,
                    ..ServiceSpec::default()
                })],
                &config()
            ),
            Err(RegistryError::NoWorkers(_))
        ));
    }

    #[test]
    fn id_out_of_range_is_fatal() {
        assert!(matches!(
            Registry::new(
                vec![Fake::with(ServiceSpec {
                    name: "x".into(),
                    service_id: Some(5),
                    ..ServiceSpec::default()
                })],
                &config()
            ),
            Err(RegistryError::IdTooLarge(_, 5))
        ));
    }

    #[test]
    fn digit_groups_are_rejected() {
        assert!(matches!(
            Registry::new(
                vec![Fake::with(ServiceSpec {
                    name: "x".into(),
                    groups: vec!["42".into()],
                    ..ServiceSpec::default()
                })],
                &config()
            ),
            Err(RegistryError::DigitGroupName(_))
        ));
    }

    #[test]
    fn list_prefixed_groups_are_rejected() {
        assert!(matches!(
            Registry::new(
                vec![Fake::with(ServiceSpec {
                    name: "x".into(),
                    groups: vec!["List of ips".into()],
                    ..ServiceSpec::default()
                })],
                &config()
            ),
            Err(RegistryError::ListPrefixGroupName(_))
        ));

        // "list" alone or as a word prefix without the space is fine
        Registry::new(
            vec![Fake::with(ServiceSpec {
                name: "x".into(),
                groups: vec!["listing".into()],
                ..ServiceSpec::default()
            })],
            &config(),
        )
        .unwrap();
    }

    #[test]
    fn implicit_groups_are_injected() {
        let config = Config {
            disable_all_groups: false,
            disable_name_groups: false,
            ..Config::default()
        };
        let registry = Registry::new(
            vec![Fake::with(ServiceSpec {
                name: "whois".into(),
                groups: vec!["net".into()],
                ..ServiceSpec::default()
            })],
            &config,
        )
        .unwrap();

        let descriptor = registry.descriptor(ServiceId::new(0)).unwrap();
        assert_eq!(descriptor.groups, vec!["whois", "all", "net"]);
        assert_eq!(registry.resolve_group("all", true).len(), 1);
        assert_eq!(registry.resolve_group("whois", true).len(), 1);
        // case-folded resolution
        assert_eq!(registry.resolve_group("NET", false).len(), 1);
        assert!(registry.resolve_group("NET", true).is_empty());
    }

    #[test]
    fn ignored_services_are_skipped() {
        let registry = Registry::new(
            vec![
                Fake::named("kept"),
                Fake::with(ServiceSpec {
                    name: "dropped".into(),
                    ignore: true,
                    ..ServiceSpec::default()
                }),
            ],
            &config(),
        )
        .unwrap();
        assert_eq!(registry.len(), 1);
    }
}
