use csnap_core::Issue;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::debug;

/// A pair of independent shapes for one upstream record type.
///
/// `Lenient` declares only what the pipeline consumes and ignores unknown
/// fields; `transform` turns it into the domain value. `Strict` declares the
/// full shape believed to be upstream and denies unknown fields, so a mismatch
/// signals drift without blocking ingestion.
pub trait RecordSchema {
    const ENTITY: &'static str;

    type Lenient: DeserializeOwned;
    type Strict: DeserializeOwned;
    type Context;
    type Output;

    fn transform(raw: Self::Lenient, ctx: &Self::Context) -> Result<Self::Output, String>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct Validated<T> {
    pub items: Vec<T>,
    pub issues: Vec<Issue>,
}

impl<T> Default for Validated<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            issues: Vec::new(),
        }
    }
}

impl<T> Validated<T> {
    pub fn absorb(&mut self, other: Validated<T>) {
        self.items.extend(other.items);
        self.issues.extend(other.issues);
    }
}

pub fn conforms_strict<S: RecordSchema>(index: usize, raw: &JsonValue) -> Result<(), Issue> {
    S::Strict::deserialize(raw)
        .map(|_| ())
        .map_err(|err| Issue::schema(S::ENTITY, index, err.to_string()))
}

fn lenient<S: RecordSchema>(
    index: usize,
    raw: &JsonValue,
    ctx: &S::Context,
) -> Result<S::Output, Issue> {
    let parsed = S::Lenient::deserialize(raw)
        .map_err(|err| Issue::transform(S::ENTITY, index, err.to_string()))?;
    S::transform(parsed, ctx).map_err(|message| Issue::transform(S::ENTITY, index, message))
}

/// Runs both schemas over one record. The output is `None` only when the
/// lenient path fails; strict failures are reported alongside.
pub fn validate_record<S: RecordSchema>(
    index: usize,
    raw: &JsonValue,
    ctx: &S::Context,
) -> (Option<S::Output>, Vec<Issue>) {
    let mut issues = Vec::new();
    let output = match lenient::<S>(index, raw, ctx) {
        Ok(output) => Some(output),
        Err(issue) => {
            debug!(entity = S::ENTITY, index, message = %issue.message, "record dropped");
            issues.push(issue);
            None
        }
    };
    if let Err(issue) = conforms_strict::<S>(index, raw) {
        issues.push(issue);
    }
    (output, issues)
}

pub fn validate_records<S: RecordSchema>(raw: &[JsonValue], ctx: &S::Context) -> Validated<S::Output> {
    let mut out = Validated::default();
    for (index, record) in raw.iter().enumerate() {
        let (output, issues) = validate_record::<S>(index, record, ctx);
        out.items.extend(output);
        out.issues.extend(issues);
    }
    out
}

pub fn records_at<'a>(value: &'a JsonValue, field: Option<&str>) -> Option<&'a [JsonValue]> {
    let target = match field {
        Some(field) => value.get(field)?,
        None => value,
    };
    target.as_array().map(Vec::as_slice)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schemas::{EndpointContext, EndpointSchema, ModelSchema};
    use csnap_core::IssueKind;
    use serde_json::json;

    fn model(extra: Option<(&str, JsonValue)>) -> JsonValue {
        let mut value = json!({
            "slug": "acme/m-1",
            "hf_slug": null,
            "updated_at": "2025-03-01T00:00:00Z",
            "created_at": "2025-02-01T00:00:00Z",
            "name": "Acme: M1",
            "short_name": "M1",
            "author": "acme",
            "description": "A model.",
            "context_length": 32768,
            "input_modalities": ["text"],
            "output_modalities": ["text"],
            "has_text_output": true,
            "group": "Other",
            "permaslug": "acme/m-1-2025-02-01",
            "endpoint": {"variant": "standard"}
        });
        if let Some((field, v)) = extra {
            value[field] = v;
        }
        value
    }

    #[test]
    fn clean_record_passes_both_schemas() {
        let (output, issues) = validate_record::<ModelSchema>(0, &model(None), &());
        assert!(output.is_some());
        assert!(issues.is_empty(), "{issues:?}");
    }

    #[test]
    fn missing_lenient_field_drops_record_with_transform_issue() {
        let mut raw = model(None);
        raw.as_object_mut().unwrap().remove("permaslug");

        let validated = validate_records::<ModelSchema>(&[raw], &());
        assert!(validated.items.is_empty());
        assert!(validated
            .issues
            .iter()
            .any(|i| i.kind == IssueKind::Transform && i.index == Some(0)));
    }

    #[test]
    fn unexpected_field_is_drift_only() {
        let raw = model(Some(("brand_new_flag", json!(true))));
        let validated = validate_records::<ModelSchema>(&[raw], &());
        assert_eq!(validated.items.len(), 1);
        assert_eq!(validated.issues.len(), 1);
        assert_eq!(validated.issues[0].kind, IssueKind::Schema);
        assert!(validated.issues[0].message.contains("brand_new_flag"));
    }

    #[test]
    fn transform_failure_reports_positional_index() {
        let good = json!({
            "id": "e-1", "name": "Acme | m-1", "context_length": 8192,
            "provider_slug": "acme", "pricing": {"prompt": "0.000001", "completion": "0.000002"},
            "supported_parameters": ["temperature"]
        });
        let mut bad = good.clone();
        bad["pricing"]["prompt"] = json!("not-a-number");
        let ctx = EndpointContext {
            model_permaslug: "acme/m-1-2025-02-01".into(),
            variant: "standard".into(),
        };

        let validated = validate_records::<EndpointSchema>(&[good, bad], &ctx);
        assert_eq!(validated.items.len(), 1);
        let transform = validated
            .issues
            .iter()
            .find(|i| i.kind == IssueKind::Transform)
            .expect("transform issue");
        assert_eq!(transform.index, Some(1));
        assert!(transform.message.contains("pricing.prompt"));
    }

    #[test]
    fn records_at_reads_nested_arrays() {
        let payload = json!({"history": [{"date": "2025-01-01", "uptime": 99.0}]});
        assert_eq!(records_at(&payload, Some("history")).map(<[_]>::len), Some(1));
        assert!(records_at(&payload, Some("missing")).is_none());
        assert!(records_at(&payload, None).is_none());
    }
}
