use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::{PipelineError, Result};

/// A fully decoded, persistable usage event.
///
/// Invariant: `occurred_at` is always a resolved absolute instant. The wire
/// timestamp is decoded as raw text and converted in a fallible step, so no
/// partially-parsed timestamp can ever reach the batch accumulator.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedEvent {
    pub organization_id: i64,
    pub customer_id: String,
    pub idempotency_id: String,
    pub occurred_at: DateTime<Utc>,
    pub properties: Map<String, Value>,
    pub event_name: String,
}

/// Wire-level event as it appears inside an envelope. Identical to
/// [`NormalizedEvent`] except `time_created` is still unparsed text.
#[derive(Debug, Deserialize)]
struct WireEvent {
    #[serde(default)]
    organization_id: i64,
    #[serde(default)]
    customer_id: String,
    #[serde(default)]
    idempotency_id: String,
    #[serde(default)]
    time_created: String,
    #[serde(default)]
    properties: Map<String, Value>,
    #[serde(default)]
    event_name: String,
}

/// Outer wrapper distinguishing singular vs. plural delivery:
///
/// ```json
/// { "event": { ... } }
/// { "events": [ { ... }, ... ], "organization_id": 1 }
/// ```
///
/// The plural form's top-level `organization_id` is carried on the wire but
/// never consumed here; each embedded event carries its own.
#[derive(Debug, Deserialize)]
struct StreamEnvelope {
    event: Option<WireEvent>,
    events: Option<Vec<WireEvent>>,
}

impl TryFrom<WireEvent> for NormalizedEvent {
    type Error = PipelineError;

    fn try_from(wire: WireEvent) -> Result<Self> {
        Ok(NormalizedEvent {
            organization_id: wire.organization_id,
            customer_id: wire.customer_id,
            idempotency_id: wire.idempotency_id,
            occurred_at: resolve_timestamp(&wire.time_created)?,
            properties: wire.properties,
            event_name: wire.event_name,
        })
    }
}

const OFFSET_FRACTIONAL_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f%:z";
const NAIVE_FRACTIONAL_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// Resolve a wire timestamp to an absolute instant.
///
/// Three historical encodings are accepted, tried in order with the first
/// success winning: strict RFC-3339, fractional seconds with an explicit
/// offset, and fractional seconds with no offset (interpreted as UTC).
fn resolve_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = DateTime::parse_from_str(raw, OFFSET_FRACTIONAL_FORMAT) {
        return Ok(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = NaiveDateTime::parse_from_str(raw, NAIVE_FRACTIONAL_FORMAT) {
        return Ok(ts.and_utc());
    }
    Err(PipelineError::MalformedTimestamp {
        value: raw.to_string(),
    })
}

/// Decode one raw broker payload into exactly one [`NormalizedEvent`].
///
/// The singular `event` field wins when present. Otherwise the first element
/// of a non-empty `events` list is used; any further elements are discarded.
/// That discard is a deliberate simplification of the producer contract, not
/// an attempt to batch multiple events per message.
///
/// An envelope carrying neither form is a decode failure, never a silently
/// skipped record.
pub fn decode_record(payload: &[u8]) -> Result<NormalizedEvent> {
    let envelope: StreamEnvelope =
        serde_json::from_slice(payload).map_err(PipelineError::Decode)?;

    let wire = match (envelope.event, envelope.events) {
        (Some(event), _) => event,
        (None, Some(events)) => events
            .into_iter()
            .next()
            .ok_or(PipelineError::EmptyEnvelope)?,
        (None, None) => return Err(PipelineError::EmptyEnvelope),
    };

    wire.try_into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn singular_payload() -> Vec<u8> {
        json!({
            "event": {
                "organization_id": 7,
                "customer_id": "cust_42",
                "idempotency_id": "idem-1",
                "time_created": "2023-03-15T10:30:00Z",
                "properties": {"region": "us-east-1", "count": 3},
                "event_name": "api_call"
            }
        })
        .to_string()
        .into_bytes()
    }

    #[test]
    fn singular_envelope_decodes_embedded_event_unchanged() {
        let event = decode_record(&singular_payload()).unwrap();

        assert_eq!(event.organization_id, 7);
        assert_eq!(event.customer_id, "cust_42");
        assert_eq!(event.idempotency_id, "idem-1");
        assert_eq!(event.event_name, "api_call");
        assert_eq!(
            event.occurred_at,
            Utc.with_ymd_and_hms(2023, 3, 15, 10, 30, 0).unwrap()
        );
        assert_eq!(event.properties["region"], "us-east-1");
        assert_eq!(event.properties["count"], 3);
    }

    #[test]
    fn plural_envelope_uses_first_event_only() {
        let payload = json!({
            "organization_id": 7,
            "events": [
                {
                    "customer_id": "first",
                    "idempotency_id": "idem-1",
                    "time_created": "2023-03-15T10:30:00Z",
                    "event_name": "api_call"
                },
                {
                    "customer_id": "second",
                    "idempotency_id": "idem-2",
                    "time_created": "2023-03-15T10:31:00Z",
                    "event_name": "api_call"
                }
            ]
        })
        .to_string();

        let event = decode_record(payload.as_bytes()).unwrap();
        assert_eq!(event.customer_id, "first");
        assert_eq!(event.idempotency_id, "idem-1");
    }

    #[test]
    fn singular_event_wins_over_plural_list() {
        let payload = json!({
            "event": {
                "customer_id": "singular",
                "time_created": "2023-03-15T10:30:00Z"
            },
            "events": [
                {"customer_id": "plural", "time_created": "2023-03-15T10:31:00Z"}
            ]
        })
        .to_string();

        let event = decode_record(payload.as_bytes()).unwrap();
        assert_eq!(event.customer_id, "singular");
    }

    #[test]
    fn empty_plural_list_fails() {
        let payload = json!({"events": [], "organization_id": 7}).to_string();
        let err = decode_record(payload.as_bytes()).unwrap_err();
        assert!(matches!(err, PipelineError::EmptyEnvelope));
    }

    #[test]
    fn envelope_with_neither_form_fails() {
        let payload = json!({"organization_id": 7}).to_string();
        let err = decode_record(payload.as_bytes()).unwrap_err();
        assert!(matches!(err, PipelineError::EmptyEnvelope));
    }

    #[test]
    fn malformed_json_fails() {
        let err = decode_record(b"{not json").unwrap_err();
        assert!(matches!(err, PipelineError::Decode(_)));
    }

    #[test]
    fn empty_payload_fails_as_malformed_json() {
        let err = decode_record(b"").unwrap_err();
        assert!(matches!(err, PipelineError::Decode(_)));
    }

    #[test]
    fn all_three_timestamp_encodings_resolve_to_the_same_instant() {
        let expected = Utc
            .with_ymd_and_hms(2023, 3, 15, 10, 30, 0)
            .unwrap()
            .checked_add_signed(chrono::Duration::microseconds(123456))
            .unwrap();

        // Same instant: RFC-3339, offset fractional (05:30 ahead), naive UTC.
        let rfc3339 = resolve_timestamp("2023-03-15T10:30:00.123456Z").unwrap();
        let offset = resolve_timestamp("2023-03-15 16:00:00.123456+05:30").unwrap();
        let naive = resolve_timestamp("2023-03-15 10:30:00.123456").unwrap();

        assert_eq!(rfc3339, expected);
        assert_eq!(offset, expected);
        assert_eq!(naive, expected);
    }

    #[test]
    fn unparsable_timestamp_fails() {
        let err = resolve_timestamp("15/03/2023 10:30").unwrap_err();
        assert!(matches!(
            err,
            PipelineError::MalformedTimestamp { ref value } if value == "15/03/2023 10:30"
        ));

        let payload = json!({
            "event": {
                "customer_id": "cust_42",
                "time_created": "not-a-timestamp"
            }
        })
        .to_string();
        let err = decode_record(payload.as_bytes()).unwrap_err();
        assert!(matches!(err, PipelineError::MalformedTimestamp { .. }));
        assert!(err.is_decode());
    }

    #[test]
    fn organization_id_and_properties_default_when_absent() {
        let payload = json!({
            "event": {
                "customer_id": "cust_42",
                "idempotency_id": "idem-1",
                "time_created": "2023-03-15T10:30:00Z",
                "event_name": "api_call"
            }
        })
        .to_string();

        let event = decode_record(payload.as_bytes()).unwrap();
        assert_eq!(event.organization_id, 0);
        assert!(event.properties.is_empty());
    }
}
