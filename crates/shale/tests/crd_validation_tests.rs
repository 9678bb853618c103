// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2024 Jonathan Lee
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License version 3
// as published by the Free Software Foundation.
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.
// See the GNU Affero General Public License for more details.
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see https://www.gnu.org/licenses/.

use serde_json::json;
use shale::resources::{CrdNames, CrdValidation};
use shale::{CrdSpec, ObjectMeta, Phase, Resource, RuntimeConfig, RuntimeManager};

fn data_source_crd() -> Resource {
    Resource::crd(
        ObjectMeta::named("datasources.data.example.com"),
        CrdSpec {
            group: "data.example.com".to_string(),
            names: CrdNames {
                kind: "DataSource".to_string(),
                plural: "datasources".to_string(),
                singular: None,
            },
            scope: Default::default(),
            validation: CrdValidation {
                open_api_v3_schema: json!({
                    "type": "object",
                    "required": ["type", "url"],
                    "properties": {
                        "type": {
                            "type": "string",
                            "enum": ["postgres", "mysql", "mongodb", "redis"],
                        },
                        "url": {"type": "string", "format": "uri"},
                        "credentials": {
                            "type": "object",
                            "properties": {
                                "username": {"type": "string"},
                                "password": {"type": "string", "minLength": 4},
                            },
                        },
                    },
                }),
            },
        },
    )
}

fn data_source(spec: serde_json::Value) -> Resource {
    Resource::custom(
        "data.example.com/v1",
        "DataSource",
        ObjectMeta::named("primary-db"),
        spec,
    )
}

#[tokio::test]
async fn custom_resources_validate_against_their_registration() {
    let manager = RuntimeManager::new(RuntimeConfig::default());

    let crd_key = manager.add_resource(data_source_crd()).await.unwrap();
    let crd = manager.get_resource(&crd_key).await.unwrap();
    assert_eq!(crd.phase(), Phase::Running);

    // Wrong enum member.
    let rejected = manager
        .add_resource(data_source(json!({
            "type": "oracle",
            "url": "postgres://db.internal:5432/app",
        })))
        .await
        .unwrap_err();
    assert_eq!(rejected.name(), "ValidationError");
    assert!(rejected.to_string().contains("type"));

    // Password below minLength.
    let rejected = manager
        .add_resource(data_source(json!({
            "type": "postgres",
            "url": "postgres://db.internal:5432/app",
            "credentials": {"username": "app", "password": "abc"},
        })))
        .await
        .unwrap_err();
    assert_eq!(rejected.name(), "ValidationError");
    assert!(rejected.to_string().contains("minLength"));

    // Conformant instance is admitted.
    let key = manager
        .add_resource(data_source(json!({
            "type": "postgres",
            "url": "postgres://db.internal:5432/app",
            "credentials": {"username": "app", "password": "secret"},
        })))
        .await
        .unwrap();
    assert!(manager.get_resource(&key).await.is_some());
}

#[tokio::test]
async fn unknown_kinds_without_a_crd_are_rejected() {
    let manager = RuntimeManager::new(RuntimeConfig::default());
    let rejected = manager
        .add_resource(Resource::custom(
            "data.example.com/v1",
            "DataSource",
            ObjectMeta::named("premature"),
            json!({"type": "postgres"}),
        ))
        .await
        .unwrap_err();
    assert_eq!(rejected.name(), "ValidationError");
}

#[tokio::test]
async fn removing_a_required_field_fails_validation() {
    let manager = RuntimeManager::new(RuntimeConfig::default());
    manager.add_resource(data_source_crd()).await.unwrap();

    let rejected = manager
        .add_resource(data_source(json!({
            "type": "postgres",
        })))
        .await
        .unwrap_err();
    assert_eq!(rejected.name(), "ValidationError");
    assert!(rejected.to_string().contains("url"));
}

#[tokio::test]
async fn crd_deletion_unregisters_the_kind() {
    let manager = RuntimeManager::new(RuntimeConfig::default());
    let crd_key = manager.add_resource(data_source_crd()).await.unwrap();
    manager.delete_resource(&crd_key).await.unwrap();
    assert!(manager.get_resource(&crd_key).await.is_none());

    let rejected = manager
        .add_resource(data_source(json!({
            "type": "postgres",
            "url": "postgres://db.internal:5432/app",
        })))
        .await
        .unwrap_err();
    assert_eq!(rejected.name(), "ValidationError");
}

#[tokio::test]
async fn crd_status_reflects_registration_outcome() {
    let manager = RuntimeManager::new(RuntimeConfig::default());

    let mut broken = data_source_crd();
    if let shale::ResourceSpec::CustomResourceDefinition(spec) = &mut broken.spec {
        spec.validation.open_api_v3_schema = json!({
            "type": "object",
            "properties": {"x": {"type": "string", "pattern": "("}},
        });
    }
    broken.metadata = ObjectMeta::named("broken.data.example.com");
    let key = manager.add_resource(broken).await.unwrap();
    let resource = manager.get_resource(&key).await.unwrap();
    assert_eq!(resource.phase(), Phase::Failed);
}
