//! Worker configuration parsing.

use crate::{ConfigError, ConfigResult};
use berth_core::{WorkerInfo, WorkerResourceType, WorkerSettings};
use kdl::{KdlDocument, KdlNode, KdlValue};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// A parsed worker file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub info: WorkerInfo,
    pub settings: WorkerSettings,
}

/// Read and parse a worker file.
pub fn load_worker_config(path: impl AsRef<Path>) -> ConfigResult<WorkerConfig> {
    let text = std::fs::read_to_string(path)?;
    parse_worker_config(&text)
}

/// Parse a worker configuration from KDL text.
pub fn parse_worker_config(kdl: &str) -> ConfigResult<WorkerConfig> {
    let doc: KdlDocument = kdl.parse()?;

    let mut config = None;
    for node in doc.nodes() {
        // Unknown nodes are ignored
        if node.name().value() != "worker" {
            continue;
        }
        if config.is_some() {
            return Err(ConfigError::Duplicate("worker".to_string()));
        }
        config = Some(parse_worker(node)?);
    }

    config.ok_or_else(|| ConfigError::MissingField("worker".to_string()))
}

fn parse_worker(node: &KdlNode) -> ConfigResult<WorkerConfig> {
    let name = get_first_string_arg(node)
        .filter(|name| !name.is_empty())
        .ok_or_else(|| ConfigError::MissingField("worker name".to_string()))?;

    let mut info = WorkerInfo::new(name);
    let mut settings = WorkerSettings::default();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            let key = child.name().value();
            match key {
                "certs-path" => info.certs_path = Some(required_string(child, key)?),
                "http-proxy" => info.http_proxy = Some(required_string(child, key)?),
                "https-proxy" => info.https_proxy = Some(required_string(child, key)?),
                "no-proxy" => info.no_proxy = Some(required_string(child, key)?),
                "resource-type" => {
                    let resource_type = parse_resource_type(child)?;
                    if info.resource_type(&resource_type.type_name).is_some() {
                        return Err(ConfigError::Duplicate(format!(
                            "resource type '{}'",
                            resource_type.type_name
                        )));
                    }
                    info.resource_types.push(resource_type);
                }
                "volume-lock-retry-ms" => {
                    let ms = required_unsigned(child, key)?;
                    settings.lock_retry_interval = Duration::from_millis(ms);
                }
                "stream-concurrency" => {
                    let concurrency = required_unsigned(child, key)?;
                    if concurrency == 0 {
                        return Err(invalid(key, "must be at least 1"));
                    }
                    settings.stream_concurrency = usize::try_from(concurrency)
                        .map_err(|_| invalid(key, "too large"))?;
                }
                "cache-streamed-volumes" => {
                    settings.cache_streamed_volumes = required_bool(child, key)?;
                }
                "p2p-streaming" => settings.p2p_streaming = required_bool(child, key)?,
                _ => {}
            }
        }
    }

    Ok(WorkerConfig { info, settings })
}

fn parse_resource_type(node: &KdlNode) -> ConfigResult<WorkerResourceType> {
    let type_name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("resource type name".to_string()))?;
    let image_path = get_string_prop(node, "image").ok_or_else(|| {
        ConfigError::MissingField(format!("image for resource type '{}'", type_name))
    })?;
    let version = get_string_prop(node, "version").unwrap_or_default();
    let privileged = get_bool_prop(node, "privileged").unwrap_or(false);

    Ok(WorkerResourceType {
        type_name,
        image_path,
        version,
        privileged,
    })
}

fn invalid(field: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        message: message.to_string(),
    }
}

fn required_string(node: &KdlNode, field: &str) -> ConfigResult<String> {
    get_first_string_arg(node).ok_or_else(|| invalid(field, "expected a string"))
}

fn required_bool(node: &KdlNode, field: &str) -> ConfigResult<bool> {
    first_arg(node)
        .and_then(|v| v.as_bool())
        .ok_or_else(|| invalid(field, "expected #true or #false"))
}

fn required_unsigned(node: &KdlNode, field: &str) -> ConfigResult<u64> {
    let value = first_arg(node)
        .and_then(|v| v.as_integer())
        .ok_or_else(|| invalid(field, "expected an integer"))?;
    u64::try_from(value).map_err(|_| invalid(field, "must not be negative"))
}

// Helper functions for extracting values from KDL nodes

fn first_arg(node: &KdlNode) -> Option<&KdlValue> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .map(|e| e.value())
}

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    first_arg(node)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

fn get_bool_prop(node: &KdlNode, name: &str) -> Option<bool> {
    node.get(name).and_then(|v| v.as_bool())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_worker() {
        let kdl = r#"
            worker "worker-1" {
                certs-path "/etc/ssl/certs"
                http-proxy "http://proxy:3128"
                https-proxy "http://proxy:3129"
                no-proxy "localhost,127.0.0.1"
                resource-type "git" image="/opt/resources/git" version="1.2.0" privileged=#false
                resource-type "docker-image" image="/opt/resources/docker-image" privileged=#true
                volume-lock-retry-ms 250
                stream-concurrency 4
                cache-streamed-volumes #false
                p2p-streaming #true
            }
        "#;

        let config = parse_worker_config(kdl).unwrap();
        assert_eq!(config.info.name, "worker-1");
        assert_eq!(config.info.certs_path.as_deref(), Some("/etc/ssl/certs"));
        assert_eq!(
            config.info.proxy_env(),
            vec![
                "http_proxy=http://proxy:3128",
                "https_proxy=http://proxy:3129",
                "no_proxy=localhost,127.0.0.1",
            ]
        );

        assert_eq!(config.info.resource_types.len(), 2);
        let git = config.info.resource_type("git").unwrap();
        assert_eq!(git.image_path, "/opt/resources/git");
        assert_eq!(git.version, "1.2.0");
        assert!(!git.privileged);
        assert!(config.info.resource_type("docker-image").unwrap().privileged);

        assert_eq!(config.settings.lock_retry_interval, Duration::from_millis(250));
        assert_eq!(config.settings.stream_concurrency, 4);
        assert!(!config.settings.cache_streamed_volumes);
        assert!(config.settings.p2p_streaming);
    }

    #[test]
    fn test_defaults() {
        let config = parse_worker_config(r#"worker "w1""#).unwrap();
        assert_eq!(config.info, WorkerInfo::new("w1"));
        assert_eq!(config.settings, WorkerSettings::default());
    }

    #[test]
    fn test_missing_worker() {
        let result = parse_worker_config(r#"other "x""#);
        assert!(matches!(result, Err(ConfigError::MissingField(_))));
    }

    #[test]
    fn test_duplicate_resource_type() {
        let kdl = r#"
            worker "w1" {
                resource-type "git" image="/a"
                resource-type "git" image="/b"
            }
        "#;
        let result = parse_worker_config(kdl);
        assert!(matches!(result, Err(ConfigError::Duplicate(_))));
    }

    #[test]
    fn test_resource_type_needs_image() {
        let kdl = r#"
            worker "w1" {
                resource-type "git" version="1"
            }
        "#;
        let result = parse_worker_config(kdl);
        assert!(matches!(result, Err(ConfigError::MissingField(_))));
    }

    #[test]
    fn test_zero_concurrency_is_rejected() {
        let kdl = r#"
            worker "w1" {
                stream-concurrency 0
            }
        "#;
        let result = parse_worker_config(kdl);
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "stream-concurrency"
        ));
    }

    #[test]
    fn test_negative_retry_is_rejected() {
        let kdl = r#"
            worker "w1" {
                volume-lock-retry-ms -5
            }
        "#;
        assert!(matches!(
            parse_worker_config(kdl),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_two_workers_in_one_file() {
        let kdl = r#"
            worker "w1"
            worker "w2"
        "#;
        assert!(matches!(
            parse_worker_config(kdl),
            Err(ConfigError::Duplicate(_))
        ));
    }
}
