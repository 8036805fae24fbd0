//! Wire protocol for the application chat channel.
//!
//! Inbound frames are JSON objects discriminated by a `type` field. Unknown
//! types decode to [`ServerEvent::Unknown`] so new server frame types never
//! break older clients; frames that fail to parse at all are dropped by the
//! caller. Only `final_summary` ends a session.

use serde::{Deserialize, Serialize};

/// One inbound server frame, decoded.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Session established; carries the server-side session id.
    Welcome { session_id: i64 },
    /// Liveness only.
    Keepalive,
    /// Liveness only.
    Pong,
    /// Progress text while the server evaluates the application.
    AnalysisStatus { message: String },
    /// Typing indicator on/off.
    BotTyping { value: bool },
    /// Interview question addressed to the candidate.
    Question { text: String },
    /// Intermediate analysis acknowledgment, shown as a counterpart message.
    AnalysisUpdate { message: String },
    /// Terminal frame: appends the closing message and permanently ends the
    /// session. No reconnection after this, whatever the close code.
    FinalSummary { message: String },
    /// Application-level error. Surfaced as status text; the connection
    /// stays open.
    Error { message: String },
    /// Forward-compatibility fallback for unrecognized `type` values.
    #[serde(other)]
    Unknown,
}

impl ServerEvent {
    /// Decode one inbound text frame. A parse failure is non-fatal: the
    /// caller drops the frame and logs it.
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// True for events that permanently end the session.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::FinalSummary { .. })
    }
}

/// One outbound client frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Candidate's answer to the current question. Sent only while the
    /// channel is open and the counterpart is not typing.
    Answer { text: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_welcome() {
        let event = ServerEvent::decode(r#"{"type":"welcome","session_id":42}"#).unwrap();
        assert_eq!(event, ServerEvent::Welcome { session_id: 42 });
        assert!(!event.is_terminal());
    }

    #[test]
    fn test_decode_liveness_frames() {
        assert_eq!(
            ServerEvent::decode(r#"{"type":"keepalive"}"#).unwrap(),
            ServerEvent::Keepalive
        );
        assert_eq!(ServerEvent::decode(r#"{"type":"pong"}"#).unwrap(), ServerEvent::Pong);
    }

    #[test]
    fn test_decode_status_and_typing() {
        let status = ServerEvent::decode(r#"{"type":"analysis_status","message":"Evaluating..."}"#)
            .unwrap();
        assert_eq!(
            status,
            ServerEvent::AnalysisStatus {
                message: "Evaluating...".to_string()
            }
        );

        let typing = ServerEvent::decode(r#"{"type":"bot_typing","value":true}"#).unwrap();
        assert_eq!(typing, ServerEvent::BotTyping { value: true });
    }

    #[test]
    fn test_decode_transcript_frames() {
        let question =
            ServerEvent::decode(r#"{"type":"question","text":"Tell me about yourself"}"#).unwrap();
        assert_eq!(
            question,
            ServerEvent::Question {
                text: "Tell me about yourself".to_string()
            }
        );

        let update =
            ServerEvent::decode(r#"{"type":"analysis_update","message":"Noted."}"#).unwrap();
        assert_eq!(
            update,
            ServerEvent::AnalysisUpdate {
                message: "Noted.".to_string()
            }
        );
    }

    #[test]
    fn test_decode_final_summary_is_terminal() {
        let event = ServerEvent::decode(r#"{"type":"final_summary","message":"Thanks"}"#).unwrap();
        assert_eq!(
            event,
            ServerEvent::FinalSummary {
                message: "Thanks".to_string()
            }
        );
        assert!(event.is_terminal());
    }

    #[test]
    fn test_decode_error_event() {
        let event = ServerEvent::decode(r#"{"type":"error","message":"token expired"}"#).unwrap();
        assert_eq!(
            event,
            ServerEvent::Error {
                message: "token expired".to_string()
            }
        );
        assert!(!event.is_terminal());
    }

    #[test]
    fn test_unknown_type_decodes_to_fallback() {
        let event = ServerEvent::decode(r#"{"type":"shiny_new_frame","payload":123}"#).unwrap();
        assert_eq!(event, ServerEvent::Unknown);
    }

    #[test]
    fn test_malformed_frames_fail_decode() {
        assert!(ServerEvent::decode("not json").is_err());
        assert!(ServerEvent::decode(r#"{"no_type_field":true}"#).is_err());
        assert!(ServerEvent::decode(r#"{"type":"question"}"#).is_err()); // missing text
    }

    #[test]
    fn test_answer_frame_encoding() {
        let frame = ClientFrame::Answer {
            text: "Five years of Rust".to_string(),
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert_eq!(json, r#"{"type":"answer","text":"Five years of Rust"}"#);
    }
}
