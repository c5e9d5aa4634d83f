//! Lenient/strict shapes for each catalog payload.
//!
//! Strict shapes exist only to be deserialized; their fields are never read.

use csnap_core::{
    parse_timestamp_millis, App, AppTokenUsage, Author, DataPolicy, Endpoint, EndpointStats, Model,
    ModelTokenUsage, Pricing, Provider, UptimePoint,
};
use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::validate::RecordSchema;

/// Decimal upstream values arrive either as strings or JSON numbers.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Decimal {
    Number(f64),
    Text(String),
}

impl Decimal {
    fn parse(&self, field: &str) -> Result<f64, String> {
        match self {
            Decimal::Number(n) => Ok(*n),
            Decimal::Text(s) => s
                .trim()
                .parse::<f64>()
                .map_err(|_| format!("{field}: {s:?} is not a decimal")),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Count {
    Number(u64),
    Text(String),
}

impl Count {
    fn parse(&self, field: &str) -> Result<u64, String> {
        match self {
            Count::Number(n) => Ok(*n),
            Count::Text(s) => s
                .trim()
                .parse::<u64>()
                .map_err(|_| format!("{field}: {s:?} is not a count")),
        }
    }
}

fn timestamp(field: &str, value: &str) -> Result<i64, String> {
    parse_timestamp_millis(value).ok_or_else(|| format!("{field}: unrecognized timestamp {value:?}"))
}

fn optional_decimal(field: &str, value: &Option<Decimal>) -> Result<Option<f64>, String> {
    value.as_ref().map(|d| d.parse(field)).transpose()
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

// ---------------------------------------------------------------- providers

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderLenient {
    slug: String,
    display_name: String,
    #[serde(default)]
    icon: Option<IconLenient>,
    #[serde(default)]
    data_policy: Option<DataPolicyLenient>,
}

#[derive(Debug, Deserialize)]
struct IconLenient {
    #[serde(default)]
    url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DataPolicyLenient {
    #[serde(default)]
    training: Option<bool>,
    #[serde(default)]
    retains_prompts: Option<bool>,
    #[serde(default)]
    retention_days: Option<u32>,
    #[serde(default, rename = "requiresUserIDs")]
    requires_user_ids: Option<bool>,
}

#[allow(dead_code)]
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ProviderStrict {
    name: String,
    display_name: String,
    slug: String,
    base_url: Option<String>,
    data_policy: JsonValue,
    headquarters: Option<String>,
    has_chat_completions: Option<bool>,
    has_completions: Option<bool>,
    is_abortable: Option<bool>,
    moderation_required: Option<bool>,
    editors: Option<Vec<String>>,
    owners: Option<Vec<String>>,
    adapter_name: Option<String>,
    is_multipart_supported: Option<bool>,
    status_page_url: Option<String>,
    byok_enabled: Option<bool>,
    icon: Option<JsonValue>,
    ignored_provider_models: Option<Vec<String>>,
}

pub struct ProviderSchema;

impl RecordSchema for ProviderSchema {
    const ENTITY: &'static str = "providers";
    type Lenient = ProviderLenient;
    type Strict = ProviderStrict;
    type Context = ();
    type Output = Provider;

    fn transform(raw: ProviderLenient, _ctx: &()) -> Result<Provider, String> {
        if raw.slug.trim().is_empty() {
            return Err("slug: must not be empty".to_string());
        }
        let policy = raw.data_policy.unwrap_or_default();
        Ok(Provider {
            slug: raw.slug,
            display_name: raw.display_name,
            icon_url: non_empty(raw.icon.and_then(|icon| icon.url)),
            data_policy: DataPolicy {
                training: policy.training,
                retains_prompts: policy.retains_prompts,
                retention_days: policy.retention_days,
                requires_user_ids: policy.requires_user_ids,
            },
        })
    }
}

// ------------------------------------------------------------------- models

#[derive(Debug, Deserialize)]
pub struct ModelLenient {
    slug: String,
    permaslug: String,
    name: String,
    #[serde(default)]
    short_name: Option<String>,
    #[serde(default)]
    author: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    context_length: Option<u64>,
    input_modalities: Vec<String>,
    output_modalities: Vec<String>,
    created_at: String,
    updated_at: String,
    #[serde(default)]
    endpoint: Option<VariantRef>,
}

#[derive(Debug, Deserialize)]
struct VariantRef {
    #[serde(default)]
    variant: Option<String>,
}

#[allow(dead_code)]
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelStrict {
    slug: String,
    hf_slug: Option<String>,
    updated_at: String,
    created_at: String,
    hf_updated_at: Option<String>,
    name: String,
    short_name: String,
    author: String,
    description: String,
    model_version_group_id: Option<String>,
    context_length: Option<u64>,
    input_modalities: Vec<String>,
    output_modalities: Vec<String>,
    has_text_output: bool,
    group: String,
    instruct_type: Option<String>,
    default_system: Option<String>,
    default_stops: Option<Vec<String>>,
    hidden: Option<bool>,
    router: Option<String>,
    warning_message: Option<String>,
    permaslug: String,
    reasoning_config: Option<JsonValue>,
    features: Option<JsonValue>,
    endpoint: Option<JsonValue>,
}

pub struct ModelSchema;

impl RecordSchema for ModelSchema {
    const ENTITY: &'static str = "models";
    type Lenient = ModelLenient;
    type Strict = ModelStrict;
    type Context = ();
    type Output = Model;

    fn transform(raw: ModelLenient, _ctx: &()) -> Result<Model, String> {
        let author_slug = match non_empty(raw.author) {
            Some(author) => author,
            None => raw
                .slug
                .split_once('/')
                .map(|(author, _)| author.to_string())
                .ok_or_else(|| format!("slug: {:?} has no author prefix", raw.slug))?,
        };
        Ok(Model {
            created_at: timestamp("created_at", &raw.created_at)?,
            updated_at: timestamp("updated_at", &raw.updated_at)?,
            slug: raw.slug,
            permaslug: raw.permaslug,
            name: raw.name,
            short_name: non_empty(raw.short_name),
            author_slug,
            description: non_empty(raw.description),
            context_length: raw.context_length,
            input_modalities: raw.input_modalities,
            output_modalities: raw.output_modalities,
            variant: raw.endpoint.and_then(|e| non_empty(e.variant)),
            variants: Vec::new(),
        })
    }
}

// ---------------------------------------------------------------- endpoints

#[derive(Debug, Deserialize)]
pub struct EndpointLenient {
    id: String,
    name: String,
    #[serde(default)]
    context_length: Option<u64>,
    provider_slug: String,
    #[serde(default)]
    max_completion_tokens: Option<u64>,
    #[serde(default)]
    quantization: Option<String>,
    pricing: PricingLenient,
    #[serde(default)]
    stats: Option<StatsLenient>,
    #[serde(default)]
    supported_parameters: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct PricingLenient {
    prompt: Decimal,
    completion: Decimal,
    #[serde(default)]
    image: Option<Decimal>,
    #[serde(default)]
    request: Option<Decimal>,
    #[serde(default)]
    web_search: Option<Decimal>,
    #[serde(default)]
    internal_reasoning: Option<Decimal>,
    #[serde(default)]
    input_cache_read: Option<Decimal>,
    #[serde(default)]
    input_cache_write: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
struct StatsLenient {
    #[serde(default)]
    p50_throughput: Option<f64>,
    #[serde(default)]
    p50_latency: Option<f64>,
    #[serde(default)]
    request_count: Option<u64>,
}

#[allow(dead_code)]
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndpointStrict {
    id: String,
    name: String,
    context_length: Option<u64>,
    model: Option<JsonValue>,
    model_variant_slug: Option<String>,
    model_variant_permaslug: Option<String>,
    provider_name: Option<String>,
    provider_info: Option<JsonValue>,
    provider_display_name: Option<String>,
    provider_slug: String,
    provider_model_id: Option<String>,
    provider_region: Option<String>,
    quantization: Option<String>,
    variant: Option<String>,
    is_free: Option<bool>,
    can_abort: Option<bool>,
    max_prompt_tokens: Option<u64>,
    max_completion_tokens: Option<u64>,
    max_prompt_images: Option<u64>,
    max_tokens_per_image: Option<u64>,
    supported_parameters: Vec<String>,
    is_byok: Option<bool>,
    moderation_required: Option<bool>,
    data_policy: Option<JsonValue>,
    pricing: StrictPricing,
    variable_pricings: Option<Vec<JsonValue>>,
    is_hidden: Option<bool>,
    is_deranked: Option<bool>,
    is_disabled: Option<bool>,
    supports_tool_parameters: Option<bool>,
    supports_reasoning: Option<bool>,
    supports_multipart: Option<bool>,
    limit_rpm: Option<u64>,
    limit_rpd: Option<u64>,
    has_completions: Option<bool>,
    has_chat_completions: Option<bool>,
    features: Option<JsonValue>,
    stats: Option<StrictStats>,
    status: Option<i64>,
}

#[allow(dead_code)]
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StrictPricing {
    prompt: String,
    completion: String,
    image: Option<String>,
    request: Option<String>,
    web_search: Option<String>,
    internal_reasoning: Option<String>,
    input_cache_read: Option<String>,
    input_cache_write: Option<String>,
    discount: Option<f64>,
}

#[allow(dead_code)]
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StrictStats {
    endpoint_id: String,
    p50_throughput: Option<f64>,
    p50_latency: Option<f64>,
    request_count: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct EndpointContext {
    pub model_permaslug: String,
    pub variant: String,
}

pub struct EndpointSchema;

impl RecordSchema for EndpointSchema {
    const ENTITY: &'static str = "endpoints";
    type Lenient = EndpointLenient;
    type Strict = EndpointStrict;
    type Context = EndpointContext;
    type Output = Endpoint;

    fn transform(raw: EndpointLenient, ctx: &EndpointContext) -> Result<Endpoint, String> {
        let p = &raw.pricing;
        let pricing = Pricing {
            prompt: p.prompt.parse("pricing.prompt")?,
            completion: p.completion.parse("pricing.completion")?,
            image: optional_decimal("pricing.image", &p.image)?,
            request: optional_decimal("pricing.request", &p.request)?,
            web_search: optional_decimal("pricing.web_search", &p.web_search)?,
            internal_reasoning: optional_decimal("pricing.internal_reasoning", &p.internal_reasoning)?,
            input_cache_read: optional_decimal("pricing.input_cache_read", &p.input_cache_read)?,
            input_cache_write: optional_decimal("pricing.input_cache_write", &p.input_cache_write)?,
        };
        Ok(Endpoint {
            id: raw.id,
            name: raw.name,
            model_permaslug: ctx.model_permaslug.clone(),
            model_variant: ctx.variant.clone(),
            provider_slug: raw.provider_slug,
            context_length: raw.context_length,
            max_completion_tokens: raw.max_completion_tokens,
            quantization: non_empty(raw.quantization),
            pricing,
            stats: raw.stats.map(|s| EndpointStats {
                p50_throughput: s.p50_throughput,
                p50_latency: s.p50_latency,
                request_count: s.request_count,
            }),
            supported_parameters: raw.supported_parameters,
        })
    }
}

// ------------------------------------------------------------------- uptime

#[derive(Debug, Deserialize)]
pub struct UptimeLenient {
    date: String,
    #[serde(default)]
    uptime: Option<f64>,
}

#[allow(dead_code)]
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UptimeStrict {
    date: String,
    uptime: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct UptimeContext {
    pub endpoint_id: String,
}

pub struct UptimeSchema;

impl RecordSchema for UptimeSchema {
    const ENTITY: &'static str = "endpoint_uptime";
    type Lenient = UptimeLenient;
    type Strict = UptimeStrict;
    type Context = UptimeContext;
    type Output = UptimePoint;

    fn transform(raw: UptimeLenient, ctx: &UptimeContext) -> Result<UptimePoint, String> {
        Ok(UptimePoint {
            endpoint_id: ctx.endpoint_id.clone(),
            timestamp: timestamp("date", &raw.date)?,
            uptime: raw.uptime,
        })
    }
}

// --------------------------------------------------------------------- apps

#[derive(Debug, Deserialize)]
pub struct AppEntryLenient {
    app: AppLenient,
    total_tokens: Count,
}

#[derive(Debug, Deserialize)]
struct AppLenient {
    id: u64,
    #[serde(default)]
    title: Option<String>,
    origin_url: String,
    created_at: String,
}

#[allow(dead_code)]
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppEntryStrict {
    app_id: u64,
    total_tokens: JsonValue,
    app: AppStrict,
}

#[allow(dead_code)]
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppStrict {
    id: u64,
    title: Option<String>,
    description: Option<String>,
    main_url: Option<String>,
    origin_url: String,
    source_code_url: Option<String>,
    created_at: String,
}

#[derive(Debug, Clone)]
pub struct AppContext {
    pub model_permaslug: String,
    pub variant: String,
    /// Day bucket the totals are attributed to.
    pub day: i64,
}

/// One app row plus the usage it reported for the queried model variant.
#[derive(Debug, Clone, PartialEq)]
pub struct AppEntry {
    pub app: App,
    pub usage: AppTokenUsage,
}

pub struct AppSchema;

impl RecordSchema for AppSchema {
    const ENTITY: &'static str = "apps";
    type Lenient = AppEntryLenient;
    type Strict = AppEntryStrict;
    type Context = AppContext;
    type Output = AppEntry;

    fn transform(raw: AppEntryLenient, ctx: &AppContext) -> Result<AppEntry, String> {
        let app = App {
            id: raw.app.id,
            title: non_empty(raw.app.title),
            origin_url: raw.app.origin_url,
            created_at: timestamp("app.created_at", &raw.app.created_at)?,
        };
        let usage = AppTokenUsage {
            app_id: app.id,
            model_permaslug: ctx.model_permaslug.clone(),
            variant: ctx.variant.clone(),
            timestamp: ctx.day,
            total_tokens: raw.total_tokens.parse("total_tokens")?,
        };
        Ok(AppEntry { app, usage })
    }
}

// ------------------------------------------------------------------ authors

#[derive(Debug, Deserialize)]
pub struct AuthorLenient {
    id: String,
    slug: String,
    name: String,
    #[serde(default)]
    description: Option<String>,
}

#[allow(dead_code)]
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthorStrict {
    id: String,
    slug: String,
    name: String,
    description: Option<String>,
    created_at: Option<String>,
    updated_at: Option<String>,
    icon_url: Option<String>,
}

pub struct AuthorSchema;

impl RecordSchema for AuthorSchema {
    const ENTITY: &'static str = "authors";
    type Lenient = AuthorLenient;
    type Strict = AuthorStrict;
    type Context = ();
    type Output = Author;

    fn transform(raw: AuthorLenient, _ctx: &()) -> Result<Author, String> {
        Ok(Author {
            id: raw.id,
            slug: raw.slug,
            name: raw.name,
            description: non_empty(raw.description),
        })
    }
}

// ------------------------------------------------------- model token usage

#[derive(Debug, Deserialize)]
pub struct ModelUsageLenient {
    date: String,
    model_permaslug: String,
    #[serde(default)]
    variant: Option<String>,
    total_prompt_tokens: Count,
    total_completion_tokens: Count,
    count: Count,
}

#[allow(dead_code)]
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelUsageStrict {
    date: String,
    model_permaslug: String,
    variant: String,
    total_prompt_tokens: JsonValue,
    total_completion_tokens: JsonValue,
    total_native_tokens_reasoning: Option<JsonValue>,
    total_native_tokens_cached: Option<JsonValue>,
    total_tool_calls: Option<JsonValue>,
    requests_with_tool_call_errors: Option<JsonValue>,
    num_media_prompt: Option<JsonValue>,
    num_media_completion: Option<JsonValue>,
    count: JsonValue,
}

pub struct ModelUsageSchema;

impl RecordSchema for ModelUsageSchema {
    const ENTITY: &'static str = "model_token_usage";
    type Lenient = ModelUsageLenient;
    type Strict = ModelUsageStrict;
    type Context = ();
    type Output = ModelTokenUsage;

    fn transform(raw: ModelUsageLenient, _ctx: &()) -> Result<ModelTokenUsage, String> {
        Ok(ModelTokenUsage {
            timestamp: timestamp("date", &raw.date)?,
            model_permaslug: raw.model_permaslug,
            variant: non_empty(raw.variant).unwrap_or_else(|| "standard".to_string()),
            prompt_tokens: raw.total_prompt_tokens.parse("total_prompt_tokens")?,
            completion_tokens: raw.total_completion_tokens.parse("total_completion_tokens")?,
            request_count: raw.count.parse("count")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validate::{validate_record, validate_records};
    use csnap_core::IssueKind;
    use serde_json::json;

    #[test]
    fn provider_policy_and_icon_are_extracted() {
        let raw = json!({
            "name": "Acme Cloud",
            "displayName": "Acme",
            "slug": "acme",
            "dataPolicy": {"training": false, "retainsPrompts": true, "retentionDays": 30, "requiresUserIDs": true},
            "icon": {"url": "https://acme.test/icon.png"}
        });
        let (provider, issues) = validate_record::<ProviderSchema>(0, &raw, &());
        assert!(issues.is_empty(), "{issues:?}");
        let provider = provider.expect("provider");
        assert_eq!(provider.icon_url.as_deref(), Some("https://acme.test/icon.png"));
        assert_eq!(provider.data_policy.retention_days, Some(30));
        assert_eq!(provider.data_policy.requires_user_ids, Some(true));
    }

    #[test]
    fn model_author_falls_back_to_slug_prefix() {
        let raw = json!({
            "slug": "acme/m-2", "permaslug": "acme/m-2-2025", "name": "Acme: M2",
            "input_modalities": ["text"], "output_modalities": ["text"],
            "created_at": "2025-01-01", "updated_at": "2025-01-02 10:00:00"
        });
        let (model, _) = validate_record::<ModelSchema>(0, &raw, &());
        let model = model.expect("model");
        assert_eq!(model.author_slug, "acme");
        assert_eq!(model.variant, None);
    }

    #[test]
    fn endpoint_pricing_accepts_strings_and_numbers() {
        let raw = json!({
            "id": "e-1", "name": "Acme | m-1", "provider_slug": "acme",
            "pricing": {"prompt": "0.0000015", "completion": 0.000002, "image": "0"},
            "stats": {"endpoint_id": "e-1", "p50_throughput": 41.5, "p50_latency": 380.0, "request_count": 12},
            "supported_parameters": ["tools", "temperature"]
        });
        let ctx = EndpointContext {
            model_permaslug: "acme/m-1-2025".into(),
            variant: "free".into(),
        };
        let (endpoint, _) = validate_record::<EndpointSchema>(0, &raw, &ctx);
        let endpoint = endpoint.expect("endpoint");
        assert_eq!(endpoint.pricing.prompt, 0.0000015);
        assert_eq!(endpoint.pricing.completion, 0.000002);
        assert_eq!(endpoint.pricing.image, Some(0.0));
        assert_eq!(endpoint.model_variant, "free");
        assert_eq!(endpoint.stats.and_then(|s| s.request_count), Some(12));
    }

    #[test]
    fn uptime_nulls_are_kept_as_gaps() {
        let history = [json!({"date": "2025-01-01", "uptime": null}), json!({"date": "2025-01-02", "uptime": 99.5})];
        let ctx = UptimeContext {
            endpoint_id: "e-1".into(),
        };
        let validated = validate_records::<UptimeSchema>(&history, &ctx);
        assert!(validated.issues.is_empty(), "{:?}", validated.issues);
        assert_eq!(validated.items[0].uptime, None);
        assert_eq!(validated.items[1].uptime, Some(99.5));
    }

    #[test]
    fn app_entries_split_into_view_and_usage() {
        let raw = json!({
            "app_id": 7,
            "total_tokens": "123456",
            "app": {"id": 7, "title": "Chatter", "description": null, "main_url": null,
                    "origin_url": "https://chatter.test", "source_code_url": null,
                    "created_at": "2024-06-01T12:00:00Z"}
        });
        let ctx = AppContext {
            model_permaslug: "acme/m-1-2025".into(),
            variant: "standard".into(),
            day: 1_735_689_600_000,
        };
        let (entry, issues) = validate_record::<AppSchema>(0, &raw, &ctx);
        assert!(issues.is_empty(), "{issues:?}");
        let entry = entry.expect("entry");
        assert_eq!(entry.app.id, 7);
        assert_eq!(entry.usage.total_tokens, 123_456);
        assert_eq!(entry.usage.timestamp, 1_735_689_600_000);
    }

    #[test]
    fn model_usage_defaults_variant_and_rejects_bad_counts() {
        let good = json!({"date": "2025-01-01", "model_permaslug": "acme/m-1-2025",
                          "total_prompt_tokens": 10, "total_completion_tokens": "20", "count": 3});
        let mut bad = good.clone();
        bad["count"] = json!("three");

        let validated = validate_records::<ModelUsageSchema>(&[good, bad], &());
        assert_eq!(validated.items.len(), 1);
        assert_eq!(validated.items[0].variant, "standard");
        assert!(validated
            .issues
            .iter()
            .any(|i| i.kind == IssueKind::Transform && i.index == Some(1)));
    }
}
