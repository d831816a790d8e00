//! Product recommendations attached to consultant messages.
//!
//! Whatever the caller hands in (a ready snapshot, a raw catalog record, or
//! just a product id) leaves this module as a flat [`ProductSnapshot`]. No
//! nested catalog data survives, so a large or later-edited product record
//! cannot grow the message.

use std::time::Duration;

use reqwest::Url;
use serde_json::Value;
use tracing::debug;

use crate::{
    auth::Identity,
    error::{ChatError, ChatResult},
    types::{ProductSnapshot, Role, Topic},
};

const MAX_NAME_CHARS: usize = 200;
const MAX_IMAGE_URL_CHARS: usize = 2048;

/// Only consultants, or admins writing into a consultation channel, attach.
pub fn ensure_may_attach(identity: &Identity, topic: Topic) -> ChatResult<()> {
    match (identity.role, topic) {
        (Role::Consultant, Topic::Consultant) | (Role::Admin, Topic::Consultant) => Ok(()),
        _ => Err(ChatError::validation(
            "only consultants can attach product recommendations",
        )),
    }
}

fn text_field(record: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match record.get(*key)? {
        Value::String(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    })
}

fn number_field(record: &Value, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|key| match record.get(*key)? {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    })
}

fn image_field(record: &Value) -> Option<String> {
    if let Some(url) = text_field(record, &["imageUrl", "image_url", "image", "thumbnail"]) {
        return Some(url);
    }
    match record.get("images")?.as_array()?.first()? {
        Value::String(url) => Some(url.trim().to_string()),
        Value::Object(_) => record["images"][0]
            .get("url")
            .and_then(Value::as_str)
            .map(|url| url.trim().to_string()),
        _ => None,
    }
}

fn product_id_of(record: &Value) -> Option<String> {
    text_field(record, &["productId", "product_id", "_id", "id"])
}

/// True when the record only names a product and needs a catalog lookup.
pub fn is_reference_only(record: &Value) -> bool {
    product_id_of(record).is_some() && text_field(record, &["name", "title"]).is_none()
}

/// Flattens a snapshot-shaped or catalog-shaped record and validates it.
pub fn snapshot_from_record(record: &Value) -> ChatResult<ProductSnapshot> {
    if !record.is_object() {
        return Err(ChatError::validation("recommendation must be an object"));
    }
    let product_id = product_id_of(record)
        .ok_or_else(|| ChatError::validation("recommendation needs a productId"))?;
    let name = text_field(record, &["name", "title"])
        .ok_or_else(|| ChatError::validation("recommendation needs a product name"))?;
    let price = number_field(record, &["price", "salePrice", "amount"])
        .ok_or_else(|| ChatError::validation("recommendation needs a price"))?;
    let rating = number_field(record, &["rating", "averageRating", "avgRating"]);
    let image_url = image_field(record).unwrap_or_default();

    let snapshot = ProductSnapshot {
        product_id,
        name,
        price,
        image_url,
        rating,
    };
    validate_snapshot(&snapshot)?;
    Ok(snapshot)
}

pub fn validate_snapshot(snapshot: &ProductSnapshot) -> ChatResult<()> {
    if snapshot.product_id.trim().is_empty() || snapshot.name.trim().is_empty() {
        return Err(ChatError::validation(
            "recommendation needs a productId and name",
        ));
    }
    if snapshot.name.chars().count() > MAX_NAME_CHARS {
        return Err(ChatError::validation("recommendation name is too long"));
    }
    if snapshot.image_url.chars().count() > MAX_IMAGE_URL_CHARS {
        return Err(ChatError::validation("recommendation image url is too long"));
    }
    if !snapshot.price.is_finite() || snapshot.price < 0.0 {
        return Err(ChatError::validation("recommendation price is invalid"));
    }
    if let Some(rating) = snapshot.rating {
        if !rating.is_finite() || !(0.0..=5.0).contains(&rating) {
            return Err(ChatError::validation("recommendation rating must be 0-5"));
        }
    }
    Ok(())
}

/// Thin client for the catalog's product endpoint.
#[derive(Clone)]
pub struct CatalogClient {
    http: reqwest::Client,
    base_url: Url,
}

impl CatalogClient {
    pub fn new(base_url: impl Into<String>) -> ChatResult<Self> {
        let raw = base_url.into();
        let base_url = Url::parse(raw.trim())
            .map_err(|err| ChatError::Catalog(format!("invalid catalog url {raw}: {err}")))?;
        if base_url.cannot_be_a_base() {
            return Err(ChatError::Catalog(format!("invalid catalog url {raw}")));
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self { http, base_url })
    }

    /// `{base}/api/products/{id}` with the id as one escaped segment.
    pub fn product_url(&self, product_id: &str) -> ChatResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| ChatError::Catalog(format!("invalid catalog url {}", self.base_url)))?
            .pop_if_empty()
            .extend(["api", "products", product_id]);
        Ok(url)
    }

    pub async fn fetch_product(&self, product_id: &str) -> ChatResult<Value> {
        let url = self.product_url(product_id)?;
        debug!(%url, "fetching product for recommendation");
        let response = self.http.get(url).send().await?;
        if !response.status().is_success() {
            return Err(ChatError::Catalog(format!(
                "catalog returned {} for product {product_id}",
                response.status().as_u16()
            )));
        }
        let body = response.json::<Value>().await?;
        // Catalog responses are either the bare product or `{ "product": .. }`.
        Ok(match body.get("product") {
            Some(product) if product.is_object() => product.clone(),
            _ => body,
        })
    }
}

pub struct RecommendationPipeline {
    catalog: Option<CatalogClient>,
}

impl RecommendationPipeline {
    pub fn new(catalog: Option<CatalogClient>) -> Self {
        Self { catalog }
    }

    /// Turns an optional attachment request into a validated snapshot.
    pub async fn prepare(
        &self,
        identity: &Identity,
        topic: Topic,
        input: Option<&Value>,
    ) -> ChatResult<Option<ProductSnapshot>> {
        let Some(input) = input.filter(|value| !value.is_null()) else {
            return Ok(None);
        };
        ensure_may_attach(identity, topic)?;

        if is_reference_only(input) {
            let product_id = product_id_of(input).unwrap_or_default();
            let catalog = self.catalog.as_ref().ok_or_else(|| {
                ChatError::validation("recommendation needs full product details")
            })?;
            let record = catalog.fetch_product(&product_id).await?;
            let mut snapshot = snapshot_from_record(&record)?;
            // Keep the id the consultant picked even if the catalog echoes `_id`.
            snapshot.product_id = product_id;
            return Ok(Some(snapshot));
        }

        snapshot_from_record(input).map(Some)
    }
}
