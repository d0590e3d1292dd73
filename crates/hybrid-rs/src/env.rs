use std::env;
use std::sync::OnceLock;

static HYBRID_RS_BACKENDS: OnceLock<Option<String>> = OnceLock::new();
static HYBRID_RS_VERIFY_PARTITIONS: OnceLock<bool> = OnceLock::new();

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

/// Backend list used when a configuration string is empty.
pub(crate) fn configured_backends() -> Option<&'static str> {
    HYBRID_RS_BACKENDS
        .get_or_init(|| match env::var("HYBRID_RS_BACKENDS") {
            Ok(value) if !value.trim().is_empty() => Some(value.trim().to_string()),
            _ => None,
        })
        .as_deref()
}

/// Re-checks every partition's structural guarantees after it is built.
pub(crate) fn verify_partitions_enabled() -> bool {
    *HYBRID_RS_VERIFY_PARTITIONS.get_or_init(|| match env::var("HYBRID_RS_VERIFY_PARTITIONS") {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value),
        _ => false,
    })
}
