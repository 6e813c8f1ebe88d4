//! Negotiation payloads carried in peer events
//!
//! Field names follow the browser JSON forms of `RTCSessionDescription` and
//! `RTCIceCandidate` so that browser and native peers can share one relay.

use serde::{Deserialize, Serialize};

/// Session description type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

/// A session description (`{"type": "offer", "sdp": "..."}`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// An ICE candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default)]
    pub username_fragment: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_description_matches_browser_form() {
        let parsed: SessionDescription =
            serde_json::from_value(json!({"type": "answer", "sdp": "v=0\r\n"})).unwrap();
        assert_eq!(parsed, SessionDescription::answer("v=0\r\n"));
    }

    #[test]
    fn test_candidate_matches_browser_form() {
        let browser = json!({
            "candidate": "candidate:1 1 udp 2122260223 192.168.1.2 54321 typ host",
            "sdpMid": "0",
            "sdpMLineIndex": 0,
            "usernameFragment": "abcd"
        });

        let parsed: IceCandidate = serde_json::from_value(browser.clone()).unwrap();
        assert_eq!(parsed.sdp_mid.as_deref(), Some("0"));
        assert_eq!(parsed.sdp_mline_index, Some(0));
        assert_eq!(serde_json::to_value(&parsed).unwrap(), browser);
    }

    #[test]
    fn test_candidate_optional_fields() {
        let parsed: IceCandidate =
            serde_json::from_value(json!({"candidate": "candidate:2 1 udp 1 10.0.0.1 9 typ host"}))
                .unwrap();
        assert!(parsed.sdp_mid.is_none());
        assert!(parsed.sdp_mline_index.is_none());
        assert!(parsed.username_fragment.is_none());
    }
}
