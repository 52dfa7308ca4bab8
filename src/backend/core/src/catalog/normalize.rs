//! Product normalization.
//!
//! Converts the upstream's loose product records into the stable
//! [`NormalizedProduct`] shape the rest of the system consumes. Pure and
//! synchronous: no I/O happens here.
//!
//! The image-fallback chain is applied in order, first non-empty tier wins:
//! 1. direct product image URLs,
//! 2. URLs mined from the ACF metadata container (featured/deal image
//!    objects, delimited gallery string),
//! 3. a static default image keyed by the primary category slug.
//!
//! [`ImageStatus`] records which tier produced the result so empty or
//! fallback imagery is observable downstream.

use crate::upstream::{RawMeta, RawProduct};
use chrono::{DateTime, NaiveDateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::warn;

/// Metadata key of the nested container the store's ACF export writes all
/// per-product custom fields into. Its sub-fields are flattened into
/// [`NormalizedProduct::custom_fields`].
pub const META_CONTAINER_KEY: &str = "vitrine_product_meta";

/// Long-form rich-text metadata fields that get entity decoding and
/// legacy-host rewriting applied.
const MARKDOWN_KEYS: [&str; 2] = ["product_markdown_content", "product_markdown_description"];

/// Products created within this window are flagged as new.
const NEW_PRODUCT_DAYS: i64 = 30;

/// Stock shown when the upstream does not manage stock for a product.
const DEFAULT_STOCK: i64 = 100;

// ═══════════════════════════════════════════════════════════════════════════════
// Output Types
// ═══════════════════════════════════════════════════════════════════════════════

/// Which tier of the image-fallback chain produced `images`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageStatus {
    /// Direct product image URLs.
    Mapped,
    /// Mined from metadata or the per-category default.
    Fallback,
    /// No tier produced anything.
    Empty,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProductTag {
    pub id: u64,
    pub name: String,
    pub slug: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProductCategory {
    pub id: u64,
    pub name: String,
    pub slug: String,
}

/// The stable internal product shape. Derived fresh from a raw record on
/// every normalization pass and never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedProduct {
    pub id: String,
    pub slug: String,
    pub name: String,
    pub category: String,
    #[serde(rename = "type")]
    pub product_type: String,
    pub price: f64,
    pub origin_price: f64,
    pub sale: bool,
    pub new: bool,
    pub rating: f64,
    pub stock_quantity: i64,
    /// Never null; an empty list is allowed and paired with
    /// `image_status == Empty`.
    pub images: Vec<String>,
    pub image_status: ImageStatus,
    pub description: String,
    pub tags: Vec<ProductTag>,
    pub categories: Vec<ProductCategory>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_fields: Option<Map<String, Value>>,
    pub related_ids: Vec<u64>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Settings
// ═══════════════════════════════════════════════════════════════════════════════

/// Static normalization inputs: asset host rewriting and the per-category
/// default image table.
#[derive(Debug, Clone)]
pub struct NormalizerSettings {
    /// Current asset host; legacy hosts in rich-text and gallery URLs are
    /// rewritten to this.
    pub asset_host: String,

    /// Image hosts that appear in older catalog data.
    pub legacy_image_hosts: Vec<String>,

    /// Default image per category slug; the `general` key is the generic
    /// fallback for unrecognized slugs.
    pub default_images: HashMap<String, String>,
}

impl Default for NormalizerSettings {
    fn default() -> Self {
        let mut default_images = HashMap::new();
        for slug in ["art-toys", "bag", "in-car-accessories", "home", "general"] {
            default_images.insert(
                slug.to_string(),
                format!("https://assets.vitrine.shop/defaults/{}.png", slug),
            );
        }

        Self {
            asset_host: "assets.vitrine.shop".to_string(),
            legacy_image_hosts: vec![
                "image.vitrine.cc".to_string(),
                "media.vitrine-legacy.net".to_string(),
            ],
            default_images,
        }
    }
}

impl NormalizerSettings {
    fn default_image_for(&self, category_slug: &str) -> Option<&str> {
        let key = category_slug.to_lowercase();
        self.default_images
            .get(&key)
            .or_else(|| self.default_images.get("general"))
            .map(String::as_str)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Normalization
// ═══════════════════════════════════════════════════════════════════════════════

/// Normalize a batch of raw JSON records. Items are processed independently:
/// a record that fails to decode degrades to a blank product instead of
/// aborting the batch.
pub fn normalize_all(values: &[Value], settings: &NormalizerSettings) -> Vec<NormalizedProduct> {
    let now = Utc::now();
    values
        .iter()
        .map(|value| normalize_value(value, settings, now))
        .collect()
}

/// Normalize one raw JSON record at the given reference time.
pub fn normalize_value(
    value: &Value,
    settings: &NormalizerSettings,
    now: DateTime<Utc>,
) -> NormalizedProduct {
    match serde_json::from_value::<RawProduct>(value.clone()) {
        Ok(raw) => normalize_at(&raw, settings, now),
        Err(e) => {
            counter!("vitrine_normalization_failures_total").increment(1);
            warn!(error = %e, "Product record failed to decode, emitting degraded item");
            degraded_product(value)
        }
    }
}

/// Normalize one decoded raw product.
pub fn normalize(raw: &RawProduct, settings: &NormalizerSettings) -> NormalizedProduct {
    normalize_at(raw, settings, Utc::now())
}

/// Normalize with an explicit reference time (the recency flag depends on it).
pub fn normalize_at(
    raw: &RawProduct,
    settings: &NormalizerSettings,
    now: DateTime<Utc>,
) -> NormalizedProduct {
    let (images, image_status) = resolve_images(raw, settings);

    let primary_category = raw.categories.first();
    let category = primary_category
        .and_then(|c| c.slug.as_deref().or(c.name.as_deref()))
        .unwrap_or("general")
        .to_lowercase();

    let price = to_number(
        raw.price
            .as_deref()
            .or(raw.sale_price.as_deref())
            .or(raw.regular_price.as_deref()),
    );
    let origin_price = to_number(raw.regular_price.as_deref().or(raw.price.as_deref()));
    let sale = to_number(raw.sale_price.as_deref()) > 0.0 && origin_price > price;

    let stock_quantity = match raw.stock_quantity {
        Some(qty) if qty >= 0 => qty,
        _ => DEFAULT_STOCK,
    };

    let id = raw.id.map(|id| id.to_string()).unwrap_or_default();

    let description = raw
        .description
        .as_deref()
        .or(raw.short_description.as_deref())
        .unwrap_or("");

    NormalizedProduct {
        slug: raw.slug.clone().unwrap_or_else(|| id.clone()),
        name: raw
            .name
            .clone()
            .unwrap_or_else(|| "Unnamed Product".to_string()),
        product_type: extract_product_type(raw, &category),
        category,
        price,
        origin_price: if origin_price > 0.0 {
            origin_price
        } else {
            price
        },
        sale,
        new: is_new(raw.date_created.as_deref(), now),
        rating: to_number(raw.average_rating.as_deref()),
        stock_quantity,
        images,
        image_status,
        description: rewrite_legacy_hosts(&decode_html_entities(description), settings),
        tags: raw
            .tags
            .iter()
            .map(|t| ProductTag {
                id: t.id.unwrap_or(0),
                name: t.name.clone().unwrap_or_default(),
                slug: t.slug.clone().unwrap_or_default(),
            })
            .collect(),
        categories: raw
            .categories
            .iter()
            .map(|c| ProductCategory {
                id: c.id.unwrap_or(0),
                name: c.name.clone().unwrap_or_default(),
                slug: c.slug.clone().unwrap_or_default(),
            })
            .collect(),
        custom_fields: extract_custom_fields(raw, settings),
        related_ids: raw.related_ids.clone(),
        id,
    }
}

/// The degraded stand-in for a record that failed to decode: identifiable
/// where possible, blank everywhere else, `image_status == Empty`.
fn degraded_product(value: &Value) -> NormalizedProduct {
    let id = value
        .get("id")
        .and_then(Value::as_u64)
        .map(|id| id.to_string())
        .unwrap_or_default();

    NormalizedProduct {
        slug: id.clone(),
        name: String::new(),
        category: "general".to_string(),
        product_type: "general".to_string(),
        price: 0.0,
        origin_price: 0.0,
        sale: false,
        new: false,
        rating: 0.0,
        stock_quantity: 0,
        images: Vec::new(),
        image_status: ImageStatus::Empty,
        description: String::new(),
        tags: Vec::new(),
        categories: Vec::new(),
        custom_fields: None,
        related_ids: Vec::new(),
        id,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Image fallback chain
// ─────────────────────────────────────────────────────────────────────────────

fn resolve_images(raw: &RawProduct, settings: &NormalizerSettings) -> (Vec<String>, ImageStatus) {
    // Tier 1: direct product images.
    let direct: Vec<String> = dedupe(
        raw.images
            .iter()
            .filter_map(|img| img.url())
            .filter(|url| url.starts_with("http"))
            .map(|url| url.to_string()),
    );
    if !direct.is_empty() {
        return (direct, ImageStatus::Mapped);
    }

    // Tier 2: URLs mined from the metadata container.
    let mined = extract_meta_images(&raw.meta_data, settings);
    if !mined.is_empty() {
        return (mined, ImageStatus::Fallback);
    }

    // Tier 3: static default keyed by the primary category slug.
    let category_slug = raw
        .categories
        .first()
        .and_then(|c| c.slug.as_deref().or(c.name.as_deref()))
        .unwrap_or("general");
    if let Some(default) = settings.default_image_for(category_slug) {
        return (vec![default.to_string()], ImageStatus::Fallback);
    }

    (Vec::new(), ImageStatus::Empty)
}

/// Mine image URLs out of the ACF container: featured/deal image objects and
/// a comma/whitespace-delimited gallery string.
fn extract_meta_images(metas: &[RawMeta], settings: &NormalizerSettings) -> Vec<String> {
    let mut urls = Vec::new();

    for meta in metas {
        if meta.key.as_deref() != Some(META_CONTAINER_KEY) {
            continue;
        }
        let container = &meta.value;

        for image_key in ["prod_featured_img", "prod_deal_img"] {
            if let Some(image) = container.get(image_key) {
                for field in ["url", "thumbnail"] {
                    if let Some(url) = image.get(field).and_then(Value::as_str) {
                        if !url.is_empty() {
                            urls.push(rewrite_legacy_hosts(url, settings));
                        }
                    }
                }
            }
        }

        if let Some(gallery) = container.get("product-gallery").and_then(Value::as_str) {
            urls.extend(
                gallery
                    .split(|c: char| c == ',' || c.is_whitespace())
                    .filter(|part| !part.is_empty())
                    .map(|part| rewrite_legacy_hosts(part, settings)),
            );
        }
    }

    dedupe(urls.into_iter().filter(|url| url.starts_with("http")))
}

fn dedupe(urls: impl Iterator<Item = String>) -> Vec<String> {
    let mut seen = Vec::new();
    for url in urls {
        if !seen.contains(&url) {
            seen.push(url);
        }
    }
    seen
}

// ─────────────────────────────────────────────────────────────────────────────
// Type extraction
// ─────────────────────────────────────────────────────────────────────────────

/// Keyword table for inferring a product type from its name.
const TYPE_KEYWORDS: [(&str, &str); 12] = [
    ("t-shirt", "t-shirt"),
    ("tee", "t-shirt"),
    ("dress", "dress"),
    ("jacket", "jacket"),
    ("coat", "jacket"),
    ("pants", "pants"),
    ("trousers", "pants"),
    ("shoes", "shoes"),
    ("sneakers", "shoes"),
    ("bag", "bag"),
    ("hat", "hat"),
    ("toy", "toy"),
];

fn extract_product_type(raw: &RawProduct, primary_category: &str) -> String {
    // A dedicated attribute wins.
    let type_attr = raw.attributes.iter().find(|a| {
        matches!(
            a.name.as_deref().map(str::to_lowercase).as_deref(),
            Some("product type") | Some("type")
        )
    });
    if let Some(attr) = type_attr {
        if let Some(first) = attr.options.first() {
            return first.to_lowercase();
        }
    }

    // Keyword match on the product name.
    let name = raw.name.as_deref().unwrap_or("").to_lowercase();
    for (keyword, product_type) in TYPE_KEYWORDS {
        if name.contains(keyword) {
            return product_type.to_string();
        }
    }

    primary_category.to_string()
}

// ─────────────────────────────────────────────────────────────────────────────
// Custom fields
// ─────────────────────────────────────────────────────────────────────────────

/// Scan the metadata list for ACF-style custom fields. The container key is
/// special-cased: its sub-fields are flattened into the output. Markdown
/// fields get entity decoding and legacy-host rewriting.
fn extract_custom_fields(
    raw: &RawProduct,
    settings: &NormalizerSettings,
) -> Option<Map<String, Value>> {
    if raw.meta_data.is_empty() {
        return None;
    }

    let mut fields = Map::new();

    for meta in &raw.meta_data {
        let Some(key) = meta.key.as_deref() else {
            continue;
        };

        if key == META_CONTAINER_KEY {
            if let Value::Object(container) = &meta.value {
                for (sub_key, sub_value) in container {
                    fields.insert(sub_key.clone(), sub_value.clone());
                }
            }
            continue;
        }

        if MARKDOWN_KEYS.contains(&key) {
            if let Some(text) = meta.value.as_str() {
                fields.insert(
                    key.to_string(),
                    Value::String(rewrite_legacy_hosts(&decode_html_entities(text), settings)),
                );
            }
            continue;
        }

        // Plugin-internal keys and flat keys carry through as-is.
        if key.starts_with('_') || key.starts_with("acf_") || !key.contains('_') {
            fields.insert(key.to_string(), meta.value.clone());
        }
    }

    if fields.is_empty() {
        None
    } else {
        Some(fields)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Text helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Decode the HTML entities the upstream editor leaves in rich-text fields.
pub fn decode_html_entities(input: &str) -> String {
    if !input.contains('&') {
        return input.to_string();
    }
    input
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#039;", "'")
        .replace("&apos;", "'")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
}

/// Rewrite legacy image-host URLs to the current asset host.
pub fn rewrite_legacy_hosts(input: &str, settings: &NormalizerSettings) -> String {
    let mut output = input.to_string();
    let target = format!("https://{}", settings.asset_host);
    for host in &settings.legacy_image_hosts {
        output = output
            .replace(&format!("https://{}", host), &target)
            .replace(&format!("http://{}", host), &target);
    }
    output
}

fn to_number(value: Option<&str>) -> f64 {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(0.0)
}

fn is_new(date_created: Option<&str>, now: DateTime<Utc>) -> bool {
    let Some(raw) = date_created else {
        return false;
    };

    // The upstream emits naive local timestamps; RFC 3339 shows up in older
    // records.
    let created = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S")
        .map(|naive| naive.and_utc())
        .or_else(|_| DateTime::parse_from_rfc3339(raw).map(|dt| dt.with_timezone(&Utc)));

    match created {
        Ok(created) => now.signed_duration_since(created) < chrono::Duration::days(NEW_PRODUCT_DAYS),
        Err(_) => false,
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn settings() -> NormalizerSettings {
        NormalizerSettings::default()
    }

    fn raw_from(value: Value) -> RawProduct {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_direct_images_win() {
        let raw = raw_from(json!({
            "id": 1,
            "images": ["https://cdn.example/a.png"],
            "meta_data": [{
                "key": META_CONTAINER_KEY,
                "value": {"product-gallery": "https://cdn.example/gallery.png"}
            }]
        }));

        let product = normalize(&raw, &settings());
        assert_eq!(product.images, vec!["https://cdn.example/a.png"]);
        assert_eq!(product.image_status, ImageStatus::Mapped);
    }

    #[test]
    fn test_meta_gallery_fallback() {
        let raw = raw_from(json!({
            "id": 2,
            "images": [],
            "categories": [{"id": 9, "slug": "bag"}],
            "meta_data": [{
                "key": META_CONTAINER_KEY,
                "value": {
                    "prod_featured_img": {"url": "https://cdn.example/feat.png"},
                    "product-gallery": "https://cdn.example/g1.png, https://cdn.example/g2.png"
                }
            }]
        }));

        let product = normalize(&raw, &settings());
        assert_eq!(product.image_status, ImageStatus::Fallback);
        assert_eq!(
            product.images,
            vec![
                "https://cdn.example/feat.png",
                "https://cdn.example/g1.png",
                "https://cdn.example/g2.png"
            ]
        );
    }

    #[test]
    fn test_category_default_fallback() {
        let raw = raw_from(json!({
            "id": 3,
            "categories": [{"id": 9, "slug": "bag"}]
        }));

        let product = normalize(&raw, &settings());
        assert_eq!(product.image_status, ImageStatus::Fallback);
        assert_eq!(
            product.images,
            vec!["https://assets.vitrine.shop/defaults/bag.png"]
        );
    }

    #[test]
    fn test_unknown_category_uses_generic_default() {
        let raw = raw_from(json!({
            "id": 4,
            "categories": [{"id": 9, "slug": "surfboards"}]
        }));

        let product = normalize(&raw, &settings());
        assert_eq!(
            product.images,
            vec!["https://assets.vitrine.shop/defaults/general.png"]
        );
        assert_eq!(product.image_status, ImageStatus::Fallback);
    }

    #[test]
    fn test_no_image_tier_yields_empty() {
        let mut custom = settings();
        custom.default_images.clear();

        let raw = raw_from(json!({"id": 5}));
        let product = normalize(&raw, &custom);
        assert!(product.images.is_empty());
        assert_eq!(product.image_status, ImageStatus::Empty);
    }

    #[test]
    fn test_sale_detection() {
        let on_sale = raw_from(json!({
            "id": 6,
            "price": "80",
            "regular_price": "100",
            "sale_price": "80"
        }));
        let product = normalize(&on_sale, &settings());
        assert!(product.sale);
        assert_eq!(product.price, 80.0);
        assert_eq!(product.origin_price, 100.0);

        let not_on_sale = raw_from(json!({
            "id": 7,
            "price": "100",
            "regular_price": "100",
            "sale_price": "0"
        }));
        let product = normalize(&not_on_sale, &settings());
        assert!(!product.sale);
        assert_eq!(product.price, 100.0);
    }

    #[test]
    fn test_unparseable_price_is_zero() {
        let raw = raw_from(json!({"id": 8, "price": "call us"}));
        let product = normalize(&raw, &settings());
        assert_eq!(product.price, 0.0);
        assert_eq!(product.origin_price, 0.0);
        assert!(!product.sale);
    }

    #[test]
    fn test_type_from_attribute_wins() {
        let raw = raw_from(json!({
            "id": 9,
            "name": "Weekend Dress",
            "attributes": [{"name": "Product Type", "options": ["Gown"]}]
        }));
        assert_eq!(normalize(&raw, &settings()).product_type, "gown");
    }

    #[test]
    fn test_type_from_name_keyword() {
        let raw = raw_from(json!({"id": 10, "name": "Vintage Band Tee"}));
        assert_eq!(normalize(&raw, &settings()).product_type, "t-shirt");
    }

    #[test]
    fn test_type_defaults_to_category() {
        let raw = raw_from(json!({
            "id": 11,
            "name": "Mystery Object",
            "categories": [{"slug": "home"}]
        }));
        assert_eq!(normalize(&raw, &settings()).product_type, "home");
    }

    #[test]
    fn test_recency_flag() {
        let now = Utc::now();
        let recent = (now - chrono::Duration::days(5))
            .format("%Y-%m-%dT%H:%M:%S")
            .to_string();
        let old = (now - chrono::Duration::days(45))
            .format("%Y-%m-%dT%H:%M:%S")
            .to_string();

        let product = normalize_at(
            &raw_from(json!({"id": 12, "date_created": recent})),
            &settings(),
            now,
        );
        assert!(product.new);

        let product = normalize_at(
            &raw_from(json!({"id": 13, "date_created": old})),
            &settings(),
            now,
        );
        assert!(!product.new);

        let product = normalize_at(
            &raw_from(json!({"id": 14, "date_created": "not a date"})),
            &settings(),
            now,
        );
        assert!(!product.new);
    }

    #[test]
    fn test_custom_fields_container_flattened() {
        let raw = raw_from(json!({
            "id": 15,
            "meta_data": [
                {"key": META_CONTAINER_KEY, "value": {"badge": "limited", "origin": "EU"}},
                {"key": "product_markdown_content",
                 "value": "See &lt;b&gt;photos&lt;/b&gt; at https://image.vitrine.cc/p/15.png"},
                {"key": "_internal", "value": 1},
                {"key": "ignored_plugin_field", "value": 2}
            ]
        }));

        let product = normalize(&raw, &settings());
        let fields = product.custom_fields.unwrap();
        assert_eq!(fields.get("badge"), Some(&json!("limited")));
        assert_eq!(fields.get("origin"), Some(&json!("EU")));
        assert_eq!(fields.get("_internal"), Some(&json!(1)));
        assert!(!fields.contains_key("ignored_plugin_field"));

        let markdown = fields
            .get("product_markdown_content")
            .and_then(Value::as_str)
            .unwrap();
        assert!(markdown.contains("<b>photos</b>"));
        assert!(markdown.contains("https://assets.vitrine.shop/p/15.png"));
    }

    #[test]
    fn test_description_decoded_and_rewritten() {
        let raw = raw_from(json!({
            "id": 16,
            "description": "Ships in 2&nbsp;days. &quot;Great&quot; &amp; durable. http://media.vitrine-legacy.net/x.jpg"
        }));

        let product = normalize(&raw, &settings());
        assert!(product.description.contains("Ships in 2 days"));
        assert!(product.description.contains("\"Great\" & durable"));
        assert!(product
            .description
            .contains("https://assets.vitrine.shop/x.jpg"));
    }

    #[test]
    fn test_stock_quantity_defaulting() {
        let managed = raw_from(json!({"id": 17, "stock_quantity": 3}));
        assert_eq!(normalize(&managed, &settings()).stock_quantity, 3);

        let unmanaged = raw_from(json!({"id": 18, "stock_quantity": null}));
        assert_eq!(normalize(&unmanaged, &settings()).stock_quantity, DEFAULT_STOCK);
    }

    #[test]
    fn test_batch_degrades_single_malformed_item() {
        let values = vec![
            json!({"id": 19, "name": "Good Product"}),
            // `images` as a number cannot decode into the raw schema.
            json!({"id": 20, "images": 42}),
        ];

        let products = normalize_all(&values, &settings());
        assert_eq!(products.len(), 2);
        assert_eq!(products[0].name, "Good Product");
        assert_eq!(products[1].id, "20");
        assert_eq!(products[1].image_status, ImageStatus::Empty);
        assert!(products[1].images.is_empty());
    }

    #[test]
    fn test_images_never_null_in_json() {
        let mut custom = settings();
        custom.default_images.clear();
        let product = normalize(&raw_from(json!({"id": 21})), &custom);
        let rendered = serde_json::to_value(&product).unwrap();
        assert_eq!(rendered.get("images"), Some(&json!([])));
        assert_eq!(rendered.get("image_status"), Some(&json!("empty")));
    }
}
