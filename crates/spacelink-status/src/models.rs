use serde::{Deserialize, Serialize};

/// Static description of the space, served as the body of `GET /`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpaceInfo {
    /// SpaceAPI version
    pub api: String,
    pub space: String,
    pub logo: String,
    pub url: String,
    pub location: Location,
    pub spacefed: SpaceFed,
    pub contact: Contact,
    pub cam: Vec<String>,
    pub issue_report_channels: Vec<String>,
    pub projects: Vec<String>,
    pub cache: Cache,
}

impl Default for SpaceInfo {
    fn default() -> Self {
        Self {
            api: "0.13".to_string(),
            space: "spacelink".to_string(),
            logo: String::new(),
            url: String::new(),
            location: Location::default(),
            spacefed: SpaceFed::default(),
            contact: Contact::default(),
            cam: Vec::new(),
            issue_report_channels: Vec::new(),
            projects: Vec::new(),
            cache: Cache::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Location {
    pub address: String,
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpaceFed {
    pub spacenet: bool,
    pub spacesaml: bool,
    pub spacephone: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Contact {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub twitter: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub irc: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ml: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issue_mail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Cache {
    pub schedule: String,
}

impl Default for Cache {
    fn default() -> Self {
        Self {
            schedule: "m.05".to_string(),
        }
    }
}

/// Open/closed state derived from heartbeats
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceState {
    pub open: bool,
}

/// Presence document returned by `GET /`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceDocument {
    #[serde(flatten)]
    pub info: SpaceInfo,
    pub state: SpaceState,
}

/// Body returned by `POST /`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub response: String,
    #[serde(default)]
    pub updated_at: String,
}

/// Query string accepted by `POST /`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HeartbeatQuery {
    pub open: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presence_document_flattens_info() {
        let doc = PresenceDocument {
            info: SpaceInfo::default(),
            state: SpaceState { open: true },
        };

        let json = serde_json::to_value(&doc).unwrap();
        assert_eq!(json["api"], "0.13");
        assert_eq!(json["space"], "spacelink");
        assert_eq!(json["state"]["open"], true);
        assert_eq!(json["cache"]["schedule"], "m.05");
    }

    #[test]
    fn test_partial_space_info_uses_defaults() {
        let info: SpaceInfo =
            serde_json::from_str(r#"{"space": "CADR", "location": {"lat": 56.3}}"#).unwrap();
        assert_eq!(info.space, "CADR");
        assert_eq!(info.api, "0.13");
        assert_eq!(info.location.lat, 56.3);
        assert!(info.cam.is_empty());
    }

    #[test]
    fn test_heartbeat_response_tolerates_missing_fields() {
        let resp: HeartbeatResponse = serde_json::from_str(r#"{"response": "OK"}"#).unwrap();
        assert_eq!(resp.response, "OK");
        assert!(resp.error.is_none());
        assert!(resp.updated_at.is_empty());
    }
}
