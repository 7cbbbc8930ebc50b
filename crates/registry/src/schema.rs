use serde::{Deserialize, Serialize};

/// Describes the payload carried in `Resource::data` for a type.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Schema {
    /// Payload message name, e.g. `catalog.v1.Service`.
    pub name: String,
    pub description: String,
    /// Optional JSON schema used by [`json_schema_validator`] when that feature is enabled.
    pub json_schema: Option<serde_json::Value>,
}

impl Schema {
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Self::default() }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_json_schema(mut self, schema: serde_json::Value) -> Self {
        self.json_schema = Some(schema);
        self
    }
}

/// Compile the schema's JSON schema into a validate hook.
#[cfg(feature = "jsonschema-validate")]
pub fn json_schema_validator(schema: &Schema) -> vigil_core::VigilResult<Option<crate::ValidateHook>> {
    use jsonschema::{Draft, JSONSchema};
    use vigil_core::VigilError;

    let raw = match &schema.json_schema {
        Some(raw) => raw,
        None => return Ok(None),
    };
    let compiled = JSONSchema::options()
        .with_draft(Draft::Draft7)
        .compile(raw)
        .map_err(|e| VigilError::InvalidType(format!("schema {}: {}", schema.name, e)))?;
    let compiled = std::sync::Arc::new(compiled);
    let hook: crate::ValidateHook = std::sync::Arc::new(move |res: &vigil_core::Resource| {
        if let Err(errors) = compiled.validate(&res.data) {
            let issues: Vec<String> = errors.map(|e| format!("{}: {}", e.instance_path, e)).collect();
            return Err(VigilError::Validation(format!("{}: {}", res.id, issues.join("; "))));
        }
        Ok(())
    });
    Ok(Some(hook))
}

#[cfg(all(test, feature = "jsonschema-validate"))]
mod tests {
    use super::*;
    use vigil_core::{Resource, ResourceId, ResourceType};

    #[test]
    fn json_schema_rejects_missing_field() {
        let schema = Schema::named("catalog.v1.Node").with_json_schema(serde_json::json!({
            "type": "object",
            "required": ["address"],
            "properties": { "address": { "type": "string" } }
        }));
        let hook = json_schema_validator(&schema).expect("compiles").expect("present");
        let id = ResourceId::new(ResourceType::new("catalog", "v1", "Node"), "n1");
        assert!(hook(&Resource::new(id.clone(), serde_json::json!({ "address": "10.0.0.1" }))).is_ok());
        assert!(hook(&Resource::new(id, serde_json::json!({}))).is_err());
    }
}
