// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Data stream provisioning.
//!
//! For a prefix `p` this creates, in order:
//! - lifecycle policy `p-ilm-policy` (when enabled),
//! - component templates `p-template-settings` and `p-template-mappings`,
//! - index template `p-template` matching `p*` as a data stream,
//! - the data stream `p` itself, unless it already exists.
//!
//! Every request is a PUT of the full definition, so running it again is harmless.

use super::ElasticsearchStore;
use crate::config::RetentionConfig;
use crate::errors::SessionError;
use crate::session::IndexProvisioner;
use async_trait::async_trait;
use reqwest::Method;
use serde_json::{json, Value};
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::debug;

pub const CREATED_BY: &str = "logship";

/// Formats a duration the way index lifecycle policies expect it (`3d`, `12h`, `90s`).
#[must_use]
pub fn ilm_age(duration: Duration) -> String {
    let seconds = duration.as_secs();
    match seconds {
        0 => "0ms".to_string(),
        s if s % 86_400 == 0 => format!("{}d", s / 86_400),
        s if s % 3_600 == 0 => format!("{}h", s / 3_600),
        s if s % 60 == 0 => format!("{}m", s / 60),
        s => format!("{s}s"),
    }
}

#[must_use]
pub fn ilm_policy(retention: &RetentionConfig) -> Value {
    json!({
        "policy": {
            "phases": {
                "hot": {
                    "actions": {
                        "rollover": { "max_size": format!("{}gb", retention.hot_rollover_gb) }
                    }
                },
                "warm": {
                    "min_age": ilm_age(retention.warm_min_age),
                    "actions": {
                        "shrink": { "number_of_shards": retention.warm_shrink_shards },
                        "forcemerge": { "max_num_segments": retention.warm_segments }
                    }
                },
                "delete": {
                    "min_age": ilm_age(retention.delete_min_age),
                    "actions": { "delete": {} }
                }
            }
        }
    })
}

#[must_use]
pub fn settings_template(prefix: &str, retention: &RetentionConfig) -> Value {
    let mut settings = json!({
        "index.number_of_replicas": retention.number_of_replicas,
        "index.number_of_shards": retention.number_of_shards,
    });
    if retention.configure_ilm {
        settings["index.lifecycle.name"] = json!(format!("{prefix}-ilm-policy"));
    }
    json!({ "template": { "settings": settings } })
}

#[must_use]
pub fn mappings_template(created_at: OffsetDateTime) -> Value {
    let keyword = json!({ "type": "keyword", "ignore_above": 256 });
    json!({
        "template": {
            "mappings": {
                "dynamic": false,
                "dynamic_templates": [
                    { "keywords": {
                        "match_mapping_type": "string",
                        "match": "*",
                        "mapping": keyword
                    } }
                ],
                "properties": {
                    "text": { "type": "text" },
                    "message": {
                        "type": "text",
                        "copy_to": ["text"],
                        "fields": { "keyword": keyword }
                    },
                    "@timestamp": { "type": "date" },
                    "thread": { "type": "keyword" },
                    "level": { "type": "keyword" },
                    "logger": { "type": "keyword", "copy_to": ["text"] },
                    "contextName": { "type": "keyword" },
                    "mdc": { "type": "object", "dynamic": true },
                    "context": { "type": "object", "dynamic": true },
                    "exceptionList": {
                        "type": "object",
                        "properties": {
                            "className": { "type": "keyword", "ignore_above": 256, "copy_to": ["text"] },
                            "message": { "type": "text", "copy_to": ["text"] }
                        }
                    }
                }
            }
        },
        "_meta": {
            "created_by": CREATED_BY,
            "created_at": created_at.format(&Rfc3339).unwrap_or_default()
        }
    })
}

#[must_use]
pub fn index_template(prefix: &str) -> Value {
    json!({
        "index_patterns": [format!("{prefix}*")],
        "data_stream": {},
        "priority": 300,
        "composed_of": [
            format!("{prefix}-template-settings"),
            format!("{prefix}-template-mappings")
        ]
    })
}

impl ElasticsearchStore {
    async fn put(&self, path: &str, body: &Value) -> Result<(), SessionError> {
        debug!("LOGSHIP | PUT {path}");
        Self::send(self.request(Method::PUT, path).json(body)).await?;
        Ok(())
    }

    /// `Ok(false)` when the store answers 404.
    pub async fn data_stream_exists(&self, name: &str) -> Result<bool, SessionError> {
        match Self::send(self.request(Method::GET, &format!("/_data_stream/{name}"))).await {
            Ok(_) => Ok(true),
            Err(SessionError::Status { status: 404, .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl IndexProvisioner for ElasticsearchStore {
    async fn ensure_index_infrastructure(
        &self,
        prefix: &str,
        retention: &RetentionConfig,
    ) -> Result<bool, SessionError> {
        if retention.configure_ilm {
            self.put(&format!("/_ilm/policy/{prefix}-ilm-policy"), &ilm_policy(retention))
                .await?;
        }
        self.put(
            &format!("/_component_template/{prefix}-template-settings"),
            &settings_template(prefix, retention),
        )
        .await?;
        self.put(
            &format!("/_component_template/{prefix}-template-mappings"),
            &mappings_template(OffsetDateTime::now_utc()),
        )
        .await?;
        self.put(
            &format!("/_index_template/{prefix}-template"),
            &index_template(prefix),
        )
        .await?;

        if self.data_stream_exists(prefix).await? {
            debug!("LOGSHIP | Data stream {prefix} already exists");
        } else {
            Self::send(self.request(Method::PUT, &format!("/_data_stream/{prefix}"))).await?;
            debug!("LOGSHIP | Created data stream {prefix}");
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use mockito::{Matcher, Server, ServerGuard};

    fn store(server: &ServerGuard) -> ElasticsearchStore {
        let address = server.socket_address();
        ElasticsearchStore::new(&ConnectionConfig {
            host: address.ip().to_string(),
            port: address.port(),
            ..ConnectionConfig::default()
        })
    }

    async fn template_mocks(server: &mut ServerGuard) -> Vec<mockito::Mock> {
        let mut mocks = Vec::new();
        for path in [
            "/_component_template/applogs-template-settings",
            "/_component_template/applogs-template-mappings",
            "/_index_template/applogs-template",
        ] {
            mocks.push(
                server
                    .mock("PUT", path)
                    .with_status(200)
                    .with_body(r#"{"acknowledged":true}"#)
                    .expect(1)
                    .create_async()
                    .await,
            );
        }
        mocks
    }

    #[test]
    fn test_ilm_age() {
        assert_eq!(ilm_age(Duration::from_secs(3 * 86_400)), "3d");
        assert_eq!(ilm_age(Duration::from_secs(7_200)), "2h");
        assert_eq!(ilm_age(Duration::from_secs(300)), "5m");
        assert_eq!(ilm_age(Duration::from_secs(90)), "90s");
        assert_eq!(ilm_age(Duration::ZERO), "0ms");
    }

    #[test]
    fn test_ilm_policy_phases() {
        let policy = ilm_policy(&RetentionConfig::default());
        let phases = &policy["policy"]["phases"];
        assert_eq!(phases["hot"]["actions"]["rollover"]["max_size"], "2gb");
        assert_eq!(phases["warm"]["min_age"], "3d");
        assert_eq!(phases["warm"]["actions"]["shrink"]["number_of_shards"], 1);
        assert_eq!(phases["warm"]["actions"]["forcemerge"]["max_num_segments"], 1);
        assert_eq!(phases["delete"]["min_age"], "30d");
    }

    #[test]
    fn test_settings_template_links_policy_only_when_ilm_enabled() {
        let with_ilm = settings_template("applogs", &RetentionConfig::default());
        assert_eq!(
            with_ilm["template"]["settings"]["index.lifecycle.name"],
            "applogs-ilm-policy"
        );

        let without_ilm = settings_template(
            "applogs",
            &RetentionConfig {
                configure_ilm: false,
                ..RetentionConfig::default()
            },
        );
        assert!(without_ilm["template"]["settings"]
            .get("index.lifecycle.name")
            .is_none());
    }

    #[test]
    fn test_index_template() {
        let template = index_template("applogs");
        assert_eq!(template["index_patterns"], json!(["applogs*"]));
        assert_eq!(template["data_stream"], json!({}));
        assert_eq!(template["priority"], 300);
        assert_eq!(
            template["composed_of"],
            json!(["applogs-template-settings", "applogs-template-mappings"])
        );
    }

    #[test]
    fn test_mappings_template_meta() {
        let created_at = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        let template = mappings_template(created_at);
        assert_eq!(template["_meta"]["created_by"], CREATED_BY);
        assert_eq!(template["_meta"]["created_at"], "2023-11-14T22:13:20Z");
        assert_eq!(
            template["template"]["mappings"]["properties"]["@timestamp"]["type"],
            "date"
        );
    }

    #[tokio::test]
    async fn test_creates_everything_for_new_prefix() {
        let mut server = Server::new_async().await;
        let policy = server
            .mock("PUT", "/_ilm/policy/applogs-ilm-policy")
            .match_body(Matcher::PartialJson(json!({
                "policy": { "phases": { "delete": { "min_age": "30d" } } }
            })))
            .with_status(200)
            .expect(1)
            .create_async()
            .await;
        let templates = template_mocks(&mut server).await;
        let lookup = server
            .mock("GET", "/_data_stream/applogs")
            .with_status(404)
            .with_body(r#"{"error":"index_not_found_exception"}"#)
            .create_async()
            .await;
        let create = server
            .mock("PUT", "/_data_stream/applogs")
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        let ready = store(&server)
            .ensure_index_infrastructure("applogs", &RetentionConfig::default())
            .await
            .unwrap();

        assert!(ready);
        policy.assert_async().await;
        for mock in templates {
            mock.assert_async().await;
        }
        lookup.assert_async().await;
        create.assert_async().await;
    }

    #[tokio::test]
    async fn test_existing_data_stream_is_left_alone() {
        let mut server = Server::new_async().await;
        let policy = server
            .mock("PUT", "/_ilm/policy/applogs-ilm-policy")
            .expect(0)
            .create_async()
            .await;
        let _templates = template_mocks(&mut server).await;
        let _lookup = server
            .mock("GET", "/_data_stream/applogs")
            .with_status(200)
            .with_body(r#"{"data_streams":[{"name":"applogs"}]}"#)
            .create_async()
            .await;
        let create = server
            .mock("PUT", "/_data_stream/applogs")
            .expect(0)
            .create_async()
            .await;

        let retention = RetentionConfig {
            configure_ilm: false,
            ..RetentionConfig::default()
        };
        assert!(store(&server)
            .ensure_index_infrastructure("applogs", &retention)
            .await
            .unwrap());
        policy.assert_async().await;
        create.assert_async().await;
    }

    #[tokio::test]
    async fn test_rejected_template_is_an_error() {
        let mut server = Server::new_async().await;
        let _policy = server
            .mock("PUT", "/_ilm/policy/applogs-ilm-policy")
            .with_status(200)
            .create_async()
            .await;
        let _settings = server
            .mock("PUT", "/_component_template/applogs-template-settings")
            .with_status(403)
            .with_body("security_exception")
            .create_async()
            .await;

        let result = store(&server)
            .ensure_index_infrastructure("applogs", &RetentionConfig::default())
            .await;
        assert!(matches!(
            result,
            Err(SessionError::Status { status: 403, .. })
        ));
    }
}
