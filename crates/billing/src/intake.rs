//! Delivery payload normalization
//!
//! Upstream lead sources disagree on field names, so each identifier is
//! resolved by an ordered chain of extractors. The first extractor that
//! yields a non-empty value wins. When no identifier is present at all, both
//! keys fall back to a hash of the canonical payload.

use std::collections::HashMap;

use serde_json::Value;
use sha2::{Digest, Sha256};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::models::ContactInfo;
use crate::store::NewLeadEvent;

/// Pulls one candidate identifier out of a payload
pub type Extractor = fn(&Value) -> Option<String>;

const IDEMPOTENCY_KEY_FIELDS: &[&str] = &[
    "idempotencyKey",
    "idempotency_key",
    "deliveryId",
    "delivery_id",
    "eventId",
    "event_id",
];

const SOURCE_ID_FIELDS: &[&str] = &[
    "sourceExternalId",
    "source_external_id",
    "leadId",
    "lead_id",
    "externalId",
    "external_id",
    "id",
];

const PORTAL_KEY_FIELDS: &[&str] = &["portalKey", "portal_key", "clientKey", "client_key"];

const BUSINESS_NAME_FIELDS: &[&str] = &[
    "businessName",
    "business_name",
    "clientName",
    "client_name",
    "companyName",
    "company_name",
];

const QUANTITY_FIELDS: &[&str] = &["quantity", "qty", "leadCount", "lead_count"];

const DELIVERED_AT_FIELDS: &[&str] = &["deliveredAt", "delivered_at", "timestamp"];

/// Epoch values at or above this are milliseconds
const EPOCH_MILLIS_THRESHOLD: f64 = 1e12;

/// Idempotency key: explicit key first, then the source id
pub const IDEMPOTENCY_KEY_CHAIN: &[Extractor] = &[explicit_idempotency_key, explicit_source_id];

/// Source external id: explicit source id first, then the idempotency key
pub const SOURCE_ID_CHAIN: &[Extractor] = &[explicit_source_id, explicit_idempotency_key];

/// Evaluate extractors in order, returning the first hit
pub fn first_match(payload: &Value, chain: &[Extractor]) -> Option<String> {
    chain.iter().find_map(|extract| extract(payload))
}

fn string_field(payload: &Value, fields: &[&str]) -> Option<String> {
    fields.iter().find_map(|field| match payload.get(*field)? {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn explicit_idempotency_key(payload: &Value) -> Option<String> {
    string_field(payload, IDEMPOTENCY_KEY_FIELDS)
}

fn explicit_source_id(payload: &Value) -> Option<String> {
    string_field(payload, SOURCE_ID_FIELDS)
}

/// Hash of the canonical payload. `serde_json` maps are key-ordered, so
/// field order in the original body does not change the result.
pub fn payload_hash_key(payload: &Value) -> String {
    let digest = Sha256::digest(payload.to_string().as_bytes());
    format!("payload:{}", hex::encode(digest))
}

/// Resolves the tenant a delivery belongs to
#[derive(Debug, Clone, Default)]
pub struct PortalKeyResolver {
    /// Lowercased business name → portal key
    business_names: HashMap<String, String>,
}

impl PortalKeyResolver {
    pub fn new(business_portal_map: HashMap<String, String>) -> Self {
        let business_names = business_portal_map
            .into_iter()
            .map(|(name, key)| (name.trim().to_lowercase(), key))
            .collect();
        Self { business_names }
    }

    /// Direct portal key first, then a configured business name
    pub fn resolve(&self, payload: &Value) -> Option<String> {
        string_field(payload, PORTAL_KEY_FIELDS).or_else(|| {
            let name = string_field(payload, BUSINESS_NAME_FIELDS)?;
            self.business_names.get(&name.to_lowercase()).cloned()
        })
    }
}

fn parse_quantity(payload: &Value) -> BillingResult<i64> {
    let Some((field, raw)) = QUANTITY_FIELDS
        .iter()
        .find_map(|field| payload.get(*field).map(|v| (*field, v)))
    else {
        return Ok(1);
    };

    let quantity = match raw {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        Value::Null => return Ok(1),
        _ => None,
    }
    .ok_or_else(|| BillingError::InvalidInput(format!("{} must be an integer", field)))?;

    if quantity < 1 {
        return Err(BillingError::InvalidInput(format!(
            "{} must be at least 1",
            field
        )));
    }
    Ok(quantity)
}

fn from_epoch_int(value: i64) -> Option<OffsetDateTime> {
    if value < 0 {
        return None;
    }
    let nanos = if (value as f64) < EPOCH_MILLIS_THRESHOLD {
        i128::from(value) * 1_000_000_000
    } else {
        i128::from(value) * 1_000_000
    };
    OffsetDateTime::from_unix_timestamp_nanos(nanos).ok()
}

fn from_epoch_float(value: f64) -> Option<OffsetDateTime> {
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    let nanos = if value < EPOCH_MILLIS_THRESHOLD {
        value * 1e9
    } else {
        value * 1e6
    };
    OffsetDateTime::from_unix_timestamp_nanos(nanos as i128).ok()
}

fn from_epoch_number(n: &serde_json::Number) -> Option<OffsetDateTime> {
    match n.as_i64() {
        Some(int) => from_epoch_int(int),
        None => from_epoch_float(n.as_f64()?),
    }
}

/// Accepts epoch seconds, epoch milliseconds, or an RFC 3339 string
pub fn parse_delivered_at(raw: &Value) -> Option<OffsetDateTime> {
    match raw {
        Value::Number(n) => from_epoch_number(n),
        Value::String(s) => {
            let s = s.trim();
            OffsetDateTime::parse(s, &Rfc3339)
                .ok()
                .or_else(|| from_epoch_number(&s.parse::<serde_json::Number>().ok()?))
        }
        _ => None,
    }
}

fn delivered_at(payload: &Value, now: OffsetDateTime) -> BillingResult<OffsetDateTime> {
    match DELIVERED_AT_FIELDS
        .iter()
        .find_map(|field| payload.get(*field).filter(|v| !v.is_null()).map(|v| (*field, v)))
    {
        None => Ok(now),
        Some((field, raw)) => parse_delivered_at(raw).ok_or_else(|| {
            BillingError::InvalidInput(format!(
                "{} must be epoch seconds, epoch milliseconds, or an ISO-8601 timestamp",
                field
            ))
        }),
    }
}

fn contact(payload: &Value) -> ContactInfo {
    let nested = payload.get("contact").filter(|v| v.is_object());
    let pick = |nested_field: &str, flat: &[&str]| {
        nested
            .and_then(|c| string_field(c, &[nested_field]))
            .or_else(|| string_field(payload, flat))
    };
    ContactInfo {
        name: pick("name", &["contactName", "contact_name", "name", "fullName"]),
        email: pick("email", &["contactEmail", "contact_email", "email"]),
        phone: pick("phone", &["contactPhone", "contact_phone", "phone"]),
        address: pick("address", &["contactAddress", "contact_address", "address"]),
    }
}

/// Turn a raw delivery body into a ledger insert
pub fn normalize_delivery(
    payload: &Value,
    resolver: &PortalKeyResolver,
    now: OffsetDateTime,
) -> BillingResult<NewLeadEvent> {
    if !payload.is_object() {
        return Err(BillingError::InvalidInput(
            "delivery payload must be a JSON object".into(),
        ));
    }

    let portal_key = resolver.resolve(payload).ok_or_else(|| {
        BillingError::InvalidInput(
            "portalKey is required (directly or via a mapped business name)".into(),
        )
    })?;

    let fallback = || payload_hash_key(payload);
    let idempotency_key = first_match(payload, IDEMPOTENCY_KEY_CHAIN).unwrap_or_else(fallback);
    let source_external_id = first_match(payload, SOURCE_ID_CHAIN).unwrap_or_else(fallback);

    Ok(NewLeadEvent {
        portal_key,
        idempotency_key,
        source_external_id,
        delivered_at: delivered_at(payload, now)?,
        quantity: parse_quantity(payload)?,
        contact: contact(payload),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use time::macros::datetime;

    fn resolver() -> PortalKeyResolver {
        PortalKeyResolver::new(HashMap::from([(
            "Acme Roofing LLC".to_string(),
            "acme-roofing".to_string(),
        )]))
    }

    const NOW: OffsetDateTime = datetime!(2026-03-01 12:00 UTC);

    #[test]
    fn test_explicit_keys_win() {
        let payload = json!({
            "portalKey": "acme-roofing",
            "deliveryId": "d-1",
            "leadId": "lead-1001",
        });
        let event = normalize_delivery(&payload, &resolver(), NOW).unwrap();
        assert_eq!(event.idempotency_key, "d-1");
        assert_eq!(event.source_external_id, "lead-1001");
        assert_eq!(event.quantity, 1);
        assert_eq!(event.delivered_at, NOW);
    }

    #[test]
    fn test_keys_fall_back_to_each_other() {
        let only_source = json!({ "portalKey": "acme-roofing", "sourceExternalId": "lead-1001" });
        let event = normalize_delivery(&only_source, &resolver(), NOW).unwrap();
        assert_eq!(event.idempotency_key, "lead-1001");
        assert_eq!(event.source_external_id, "lead-1001");

        let only_key = json!({ "portalKey": "acme-roofing", "idempotency_key": 42 });
        let event = normalize_delivery(&only_key, &resolver(), NOW).unwrap();
        assert_eq!(event.idempotency_key, "42");
        assert_eq!(event.source_external_id, "42");
    }

    #[test]
    fn test_payload_hash_is_field_order_independent() {
        let a: Value =
            serde_json::from_str(r#"{"portalKey":"acme-roofing","name":"Jo","phone":"555"}"#)
                .unwrap();
        let b: Value =
            serde_json::from_str(r#"{"phone":"555","name":"Jo","portalKey":"acme-roofing"}"#)
                .unwrap();
        let ea = normalize_delivery(&a, &resolver(), NOW).unwrap();
        let eb = normalize_delivery(&b, &resolver(), NOW).unwrap();
        assert!(ea.idempotency_key.starts_with("payload:"));
        assert_eq!(ea.idempotency_key, eb.idempotency_key);
        assert_eq!(ea.idempotency_key, ea.source_external_id);
    }

    #[test]
    fn test_blank_identifier_is_skipped() {
        let payload = json!({ "portalKey": "acme-roofing", "idempotencyKey": "  ", "eventId": "e-9" });
        assert_eq!(first_match(&payload, IDEMPOTENCY_KEY_CHAIN).as_deref(), Some("e-9"));
    }

    #[test]
    fn test_business_name_resolves_case_insensitively() {
        let payload = json!({ "businessName": "ACME roofing llc", "leadId": "x" });
        let event = normalize_delivery(&payload, &resolver(), NOW).unwrap();
        assert_eq!(event.portal_key, "acme-roofing");

        let unknown = json!({ "businessName": "Nobody Plumbing", "leadId": "x" });
        let err = normalize_delivery(&unknown, &resolver(), NOW).unwrap_err();
        assert!(matches!(err, BillingError::InvalidInput(_)));
    }

    #[test]
    fn test_delivered_at_accepts_seconds_millis_and_iso() {
        let expected = datetime!(2026-01-15 10:30 UTC);
        assert_eq!(parse_delivered_at(&json!(1768473000)), Some(expected));
        assert_eq!(parse_delivered_at(&json!(1768473000000_i64)), Some(expected));
        assert_eq!(
            parse_delivered_at(&json!("2026-01-15T10:30:00Z")),
            Some(expected)
        );
        assert_eq!(parse_delivered_at(&json!("1768473000")), Some(expected));
        assert_eq!(parse_delivered_at(&json!("yesterday")), None);
    }

    #[test]
    fn test_invalid_delivered_at_is_rejected() {
        let payload = json!({ "portalKey": "acme-roofing", "leadId": "x", "deliveredAt": "soon" });
        let err = normalize_delivery(&payload, &resolver(), NOW).unwrap_err();
        assert!(matches!(err, BillingError::InvalidInput(msg) if msg.contains("deliveredAt")));
    }

    #[test]
    fn test_quantity_validation() {
        let ok = json!({ "portalKey": "acme-roofing", "leadId": "x", "qty": "3" });
        assert_eq!(normalize_delivery(&ok, &resolver(), NOW).unwrap().quantity, 3);

        let zero = json!({ "portalKey": "acme-roofing", "leadId": "x", "quantity": 0 });
        assert!(normalize_delivery(&zero, &resolver(), NOW).is_err());

        let text = json!({ "portalKey": "acme-roofing", "leadId": "x", "quantity": "many" });
        assert!(normalize_delivery(&text, &resolver(), NOW).is_err());
    }

    #[test]
    fn test_contact_fields_nested_and_flat() {
        let payload = json!({
            "portalKey": "acme-roofing",
            "leadId": "x",
            "contact": { "name": "Dana", "phone": "555-0100" },
            "email": "dana@example.com",
        });
        let event = normalize_delivery(&payload, &resolver(), NOW).unwrap();
        assert_eq!(event.contact.name.as_deref(), Some("Dana"));
        assert_eq!(event.contact.phone.as_deref(), Some("555-0100"));
        assert_eq!(event.contact.email.as_deref(), Some("dana@example.com"));
        assert_eq!(event.contact.address, None);
    }

    #[test]
    fn test_non_object_payload_rejected() {
        assert!(normalize_delivery(&json!([1, 2]), &resolver(), NOW).is_err());
    }
}
