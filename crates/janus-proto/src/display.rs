use serde::{Deserialize, Serialize};

/// Identity carried inside the VideoRoom `display` string.
///
/// Peers encode `{uuid, display, instrument}` as a JSON document and stuff it
/// into the plugin's free-form display field. Peers that do not follow the
/// convention are still accepted: their raw display string becomes the name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    pub display: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instrument: Option<String>,
}

#[derive(Deserialize)]
struct Nested {
    #[serde(default)]
    uuid: Option<String>,
    #[serde(default)]
    display: Option<String>,
    #[serde(default)]
    instrument: Option<String>,
}

impl ParticipantInfo {
    pub fn parse(raw: &str) -> Self {
        match serde_json::from_str::<Nested>(raw) {
            Ok(nested) => Self {
                uuid: nested.uuid,
                display: nested.display.unwrap_or_else(|| raw.to_string()),
                instrument: nested.instrument,
            },
            Err(_) => Self {
                uuid: None,
                display: raw.to_string(),
                instrument: None,
            },
        }
    }

    /// Serialized form placed in a join request.
    pub fn to_display_field(&self) -> String {
        // Serializing a struct of strings cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}
