//! Descriptor model shared by unit tests.

use crate::config::{from_json_str, ResolvedModel};

pub const MODEL_JSON: &str = r#"{
    "schema": "public",
    "entities": [
        {"name": "C", "primary_key": "id", "columns": [
            {"name": "id", "type": "serial"},
            {"name": "data", "type": "text"}
        ]},
        {"name": "B", "primary_key": "id", "columns": [
            {"name": "id", "type": "serial"},
            {"name": "name", "type": "text", "nullable": false}
        ]},
        {"name": "A", "primary_key": "id",
         "columns": [
            {"name": "id", "type": "serial"},
            {"name": "x", "type": "integer"},
            {"name": "y", "type": "integer"},
            {"name": "id_c", "type": "integer"}
         ],
         "relationships": [
            {"name": "c", "target": "C", "cardinality": "one"},
            {"name": "bs", "target": "B", "cardinality": "many", "through": "asso_a_b"}
         ]},
        {"name": "Project", "primary_key": "id",
         "columns": [
            {"name": "id", "type": "serial"},
            {"name": "name", "type": "text"},
            {"name": "id_perm_read", "type": "bigint"}
         ],
         "relationships": [
            {"name": "datasets", "target": "Dataset", "cardinality": "many"}
         ]},
        {"name": "Dataset", "primary_key": "id",
         "columns": [
            {"name": "id", "type": "serial"},
            {"name": "name", "type": {"name": "varchar", "params": [50]}},
            {"name": "size", "type": "bigint"},
            {"name": "id_project", "type": "integer"}
         ],
         "relationships": [
            {"name": "project", "target": "Project", "cardinality": "one"}
         ],
         "permissions": [
            {"verbs": ["read"], "list_column": "id_perm_read", "path": ["project"]}
         ]},
        {"name": "Secret", "primary_key": "id",
         "columns": [
            {"name": "id", "type": "integer"},
            {"name": "label", "type": "text"}
         ],
         "permissions": [
            {"verbs": ["read", "update"], "groups": ["G"]},
            {"verbs": ["delete"], "groups": []}
         ]},
        {"name": "Upload", "primary_key": "id",
         "columns": [
            {"name": "id", "type": "serial"},
            {"name": "key", "type": "text"}
         ],
         "files": {"key_column": "key"},
         "permissions": [
            {"verbs": ["download"], "groups": ["G"]}
         ]},
        {"name": "Node", "primary_key": "id",
         "columns": [
            {"name": "id", "type": "serial"},
            {"name": "label", "type": "text"},
            {"name": "id_parent", "type": "integer"}
         ],
         "relationships": [
            {"name": "parent", "target": "Node", "cardinality": "one", "foreign_key": "id_parent"},
            {"name": "children", "target": "Node", "cardinality": "many", "foreign_key": "id_parent"}
         ]},
        {"name": "Pair", "primary_key": ["a", "b"],
         "columns": [
            {"name": "a", "type": "integer"},
            {"name": "b", "type": "text"},
            {"name": "v", "type": "numeric"}
         ]},
        {"name": "Sample", "primary_key": "id", "versioned": true,
         "columns": [
            {"name": "id", "type": "serial"},
            {"name": "name", "type": "text"}
         ],
         "relationships": [
            {"name": "tags", "target": "B", "cardinality": "many", "through": "asso_sample_tag"},
            {"name": "notes", "target": "Note", "cardinality": "many"}
         ]},
        {"name": "Note", "primary_key": "id",
         "columns": [
            {"name": "id", "type": "serial"},
            {"name": "body", "type": "text"},
            {"name": "id_sample_id", "type": "integer"},
            {"name": "id_sample_version", "type": "integer"}
         ]}
    ]
}"#;

pub fn model() -> ResolvedModel {
    from_json_str(MODEL_JSON).expect("fixture model resolves")
}
