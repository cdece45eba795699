//! Resource descriptors and their canonical cache keys.
//!
//! Resources are JSON objects of identifying key-value pairs: the key names a
//! resource dimension, the value is either an ID string or a boolean for
//! "everything". The canonical key derived here is the sole cache key of the
//! permission cache — two descriptors that differ only in object key order
//! must map to the same key, and distinct descriptors must not collide.

use serde_json::{Map, Value, json};

/// A resource descriptor.
pub type Resource = Value;

/// The wildcard resource covering every grant the user holds.
pub fn everything() -> Resource {
    json!({ "everything": true })
}

/// Resource for a single project.
pub fn project(project_id: &str) -> Resource {
    json!({ "project": project_id })
}

/// Resource for one data type within a project.
pub fn project_data_type(project_id: &str, data_type: &str) -> Resource {
    json!({ "project": project_id, "data_type": data_type })
}

/// Resource for a dataset within a project.
pub fn project_dataset(project_id: &str, dataset_id: &str) -> Resource {
    json!({ "project": project_id, "dataset": dataset_id })
}

/// Resource for one data type of a dataset within a project.
pub fn project_dataset_data_type(project_id: &str, dataset_id: &str, data_type: &str) -> Resource {
    json!({ "project": project_id, "dataset": dataset_id, "data_type": data_type })
}

/// Canonical, order-independent fingerprint of a resource descriptor.
///
/// Object keys are sorted recursively; arrays keep their order. The result is
/// the compact JSON serialization of the reordered value.
pub fn make_resource_key(resource: &Resource) -> String {
    recursive_ordered(resource).to_string()
}

fn recursive_ordered(value: &Value) -> Value {
    match value {
        Value::Array(items) => Value::Array(items.iter().map(recursive_ordered).collect()),
        Value::Object(fields) => {
            let mut keys: Vec<&String> = fields.keys().collect();
            keys.sort();
            let mut ordered = Map::new();
            for key in keys {
                ordered.insert(key.clone(), recursive_ordered(&fields[key]));
            }
            Value::Object(ordered)
        }
        primitive => primitive.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_insensitive_to_object_key_order() {
        let a = json!({ "project": "p1", "data_type": "variant" });
        let b = json!({ "data_type": "variant", "project": "p1" });
        assert_eq!(make_resource_key(&a), make_resource_key(&b));
    }

    #[test]
    fn key_sorts_nested_objects() {
        let a = json!({ "outer": { "b": 1, "a": { "z": true, "y": false } } });
        let b = json!({ "outer": { "a": { "y": false, "z": true }, "b": 1 } });
        assert_eq!(make_resource_key(&a), make_resource_key(&b));
    }

    #[test]
    fn arrays_keep_their_order() {
        let a = json!({ "ids": ["a", "b"] });
        let b = json!({ "ids": ["b", "a"] });
        assert_ne!(make_resource_key(&a), make_resource_key(&b));
    }

    #[test]
    fn distinct_resources_do_not_collide() {
        assert_ne!(
            make_resource_key(&project("p1")),
            make_resource_key(&project("p2"))
        );
        assert_ne!(
            make_resource_key(&project("p1")),
            make_resource_key(&project_dataset("p1", "d1"))
        );
        assert_ne!(make_resource_key(&project("p1")), make_resource_key(&everything()));
    }

    #[test]
    fn constructors_produce_expected_shapes() {
        assert_eq!(make_resource_key(&everything()), r#"{"everything":true}"#);
        assert_eq!(make_resource_key(&project("p1")), r#"{"project":"p1"}"#);
        assert_eq!(
            make_resource_key(&project_dataset_data_type("p1", "d1", "variant")),
            r#"{"data_type":"variant","dataset":"d1","project":"p1"}"#
        );
    }
}
