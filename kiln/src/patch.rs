//! Pod-spec patching.
//!
//! The generated pod spec can be amended by user-configured patches, applied
//! in order over its JSON serialization. Three patch dialects are supported:
//! RFC 6902 JSON Patch, RFC 7386 Merge Patch, and the strategic merge used
//! by Kubernetes itself, which merges object lists by their `name` key
//! instead of replacing them wholesale.

use std::fmt;
use std::str::FromStr;

use k8s_openapi::api::core::v1::PodSpec;
use serde::Deserialize;
use serde_json::Value;

/// The dialect of a configured pod-spec patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchType {
    /// RFC 6902 JSON Patch.
    Json,
    /// RFC 7386 JSON Merge Patch.
    Merge,
    /// Kubernetes strategic merge patch.
    Strategic,
}

impl fmt::Display for PatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json => write!(f, "json"),
            Self::Merge => write!(f, "merge"),
            Self::Strategic => write!(f, "strategic"),
        }
    }
}

/// An unsupported patch type name.
#[derive(Debug, thiserror::Error)]
#[error("unsupported patch type `{0}`")]
pub struct UnknownPatchTypeError(String);

impl FromStr for PatchType {
    type Err = UnknownPatchTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(Self::Json),
            "merge" => Ok(Self::Merge),
            "strategic" => Ok(Self::Strategic),
            _ => Err(UnknownPatchTypeError(s.to_string())),
        }
    }
}

/// A configured pod-spec patch.
#[derive(Debug, Clone, Deserialize)]
pub struct PodSpecPatch {
    /// The patch document.
    pub patch: Value,

    /// The dialect the patch is expressed in.
    pub patch_type: PatchType,
}

/// An error applying a configured pod-spec patch.
#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    /// The pod spec or patch could not be (de)serialized.
    #[error("serializing pod spec for patching: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A JSON Patch operation failed.
    #[error("applying pod spec patch: {0}")]
    Json(#[from] json_patch::PatchError),
}

/// Applies the configured patches to a pod spec, in order.
pub fn apply(spec: &PodSpec, patches: &[PodSpecPatch]) -> Result<PodSpec, PatchError> {
    if patches.is_empty() {
        return Ok(spec.clone());
    }

    let mut doc = serde_json::to_value(spec)?;

    for entry in patches {
        match entry.patch_type {
            PatchType::Json => {
                let patch: json_patch::Patch = serde_json::from_value(entry.patch.clone())?;
                json_patch::patch(&mut doc, &patch)?;
            }
            PatchType::Merge => json_patch::merge(&mut doc, &entry.patch),
            PatchType::Strategic => strategic_merge(&mut doc, &entry.patch),
        }
    }

    Ok(serde_json::from_value(doc)?)
}

/// Applies a strategic merge patch.
///
/// Objects merge recursively with `null` deleting keys, like a merge patch.
/// Lists of named objects merge by their `name` key: a patch item updates
/// the identically named target item in place, or is appended when no such
/// item exists. Other lists are replaced. This covers the list shapes of a
/// `PodSpec` (containers, init containers, volumes) that strategic patches
/// are used for.
fn strategic_merge(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                if value.is_null() {
                    target.remove(key);
                } else {
                    strategic_merge(target.entry(key.clone()).or_insert(Value::Null), value);
                }
            }
        }
        (Value::Array(target), Value::Array(patch)) if is_named_list(patch) => {
            for item in patch {
                let name = item.get("name");
                match target
                    .iter_mut()
                    .find(|existing| existing.get("name") == name)
                {
                    Some(existing) => strategic_merge(existing, item),
                    None => target.push(item.clone()),
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

/// Whether every patch list item is an object with a string `name` key.
fn is_named_list(items: &[Value]) -> bool {
    !items.is_empty()
        && items
            .iter()
            .all(|item| item.get("name").is_some_and(Value::is_string))
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::Container;
    use serde_json::json;

    use super::*;

    fn spec() -> PodSpec {
        PodSpec {
            containers: vec![
                Container {
                    name: "build".to_string(),
                    image: Some("alpine:3.20".to_string()),
                    ..Default::default()
                },
                Container {
                    name: "helper".to_string(),
                    image: Some("kilnci/kiln-helper:latest".to_string()),
                    ..Default::default()
                },
            ],
            ..Default::default()
        }
    }

    fn patch(patch_type: PatchType, patch: Value) -> PodSpecPatch {
        PodSpecPatch { patch, patch_type }
    }

    #[test]
    fn no_patches_is_identity() {
        let patched = apply(&spec(), &[]).unwrap();
        assert_eq!(patched.containers.len(), 2);
    }

    #[test]
    fn json_patch_replaces_values() {
        let patched = apply(
            &spec(),
            &[patch(
                PatchType::Json,
                json!([
                    {"op": "replace", "path": "/containers/0/image", "value": "debian:12"}
                ]),
            )],
        )
        .unwrap();

        assert_eq!(patched.containers[0].image.as_deref(), Some("debian:12"));
    }

    #[test]
    fn merge_patch_sets_scalar_fields() {
        let patched = apply(
            &spec(),
            &[patch(
                PatchType::Merge,
                json!({"priorityClassName": "ci", "hostNetwork": true}),
            )],
        )
        .unwrap();

        assert_eq!(patched.priority_class_name.as_deref(), Some("ci"));
        assert_eq!(patched.host_network, Some(true));
    }

    #[test]
    fn strategic_patch_merges_containers_by_name() {
        let patched = apply(
            &spec(),
            &[patch(
                PatchType::Strategic,
                json!({
                    "containers": [
                        {"name": "build", "workingDir": "/workspace"},
                        {"name": "svc-0", "image": "redis:7"}
                    ]
                }),
            )],
        )
        .unwrap();

        // The build container is updated in place, keeping its image.
        assert_eq!(patched.containers[0].name, "build");
        assert_eq!(patched.containers[0].image.as_deref(), Some("alpine:3.20"));
        assert_eq!(
            patched.containers[0].working_dir.as_deref(),
            Some("/workspace")
        );

        // The unknown container is appended.
        assert_eq!(patched.containers[2].name, "svc-0");
        assert_eq!(patched.containers[2].image.as_deref(), Some("redis:7"));
    }

    #[test]
    fn strategic_patch_null_deletes_keys() {
        let patched = apply(
            &spec(),
            &[patch(
                PatchType::Strategic,
                json!({"containers": [{"name": "build", "image": null}]}),
            )],
        )
        .unwrap();

        assert_eq!(patched.containers[0].image, None);
    }

    #[test]
    fn patches_apply_in_order() {
        let patched = apply(
            &spec(),
            &[
                patch(PatchType::Merge, json!({"priorityClassName": "first"})),
                patch(PatchType::Merge, json!({"priorityClassName": "second"})),
            ],
        )
        .unwrap();

        assert_eq!(patched.priority_class_name.as_deref(), Some("second"));
    }

    #[test]
    fn malformed_json_patch_is_an_error() {
        let err = apply(
            &spec(),
            &[patch(PatchType::Json, json!({"not": "a patch"}))],
        )
        .unwrap_err();

        assert!(matches!(err, PatchError::Serialization(_)));
    }

    #[test]
    fn unknown_patch_type_is_rejected() {
        assert!("strategic".parse::<PatchType>().is_ok());
        assert!("clever".parse::<PatchType>().is_err());

        let err = serde_json::from_value::<PodSpecPatch>(json!({
            "patch": {},
            "patch_type": "clever"
        }))
        .unwrap_err();
        assert!(err.to_string().contains("clever"));
    }
}
