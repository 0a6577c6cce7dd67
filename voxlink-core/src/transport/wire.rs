//! JSON wire messages.
//!
//! ```text
//! client → server   {"setup": {"model", "voice", "instructions"}}
//!                   {"media": {"format": "pcm16-mono-16kHz", "data": <base64>}}
//! server → client   {"setupComplete": {}}
//!                   {"content": {"turn": {"parts": [{"audio": {...}}]},
//!                                "interrupted": true,
//!                                "transcript": {"text": "..."},
//!                                "turnComplete": true}}
//! ```

use serde::{Deserialize, Serialize};

use super::InboundMessage;
use crate::{
    buffering::chunk::EncodedChunk,
    error::{LiveError, Result},
};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage<'a> {
    Setup(SetupPayload<'a>),
    Media(&'a EncodedChunk),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupPayload<'a> {
    pub model: &'a str,
    pub voice: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    pub instructions: &'a str,
}

impl ClientMessage<'_> {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| LiveError::Other(e.into()))
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default)]
    pub setup_complete: Option<serde_json::Value>,
    #[serde(default)]
    pub content: Option<ServerContent>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub turn: Option<Turn>,
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default)]
    pub transcript: Option<Transcript>,
    #[serde(default)]
    pub turn_complete: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct Turn {
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Default, Deserialize)]
pub struct Part {
    #[serde(default)]
    pub audio: Option<EncodedChunk>,
}

#[derive(Debug, Default, Deserialize)]
pub struct Transcript {
    #[serde(default)]
    pub text: String,
}

impl ServerMessage {
    /// # Errors
    /// `LiveError::Decode` when the payload is not a server message.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload).map_err(|e| LiveError::Decode(format!("server message: {e}")))
    }

    pub fn is_setup_complete(&self) -> bool {
        self.setup_complete.is_some()
    }

    /// Flatten into inbound items.
    ///
    /// Audio parts come first and the interruption after them, so a message
    /// carrying both ends silent.
    pub fn into_inbound(self) -> Vec<InboundMessage> {
        let Some(content) = self.content else {
            return Vec::new();
        };
        let mut out: Vec<InboundMessage> = content
            .turn
            .into_iter()
            .flat_map(|turn| turn.parts)
            .filter_map(|part| part.audio)
            .map(InboundMessage::Audio)
            .collect();
        if content.interrupted {
            out.push(InboundMessage::Interrupted);
        }
        if let Some(transcript) = content.transcript {
            if !transcript.text.is_empty() {
                out.push(InboundMessage::Transcript(transcript.text));
            }
        }
        if content.turn_complete {
            out.push(InboundMessage::TurnComplete);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffering::chunk::AudioFormat;

    #[test]
    fn media_message_shape() {
        let chunk = EncodedChunk::new(AudioFormat::CAPTURE, "AAAA");
        let json = ClientMessage::Media(&chunk).to_json().unwrap();
        assert_eq!(
            json,
            r#"{"media":{"format":"pcm16-mono-16kHz","data":"AAAA"}}"#
        );
    }

    #[test]
    fn setup_omits_empty_instructions() {
        let msg = ClientMessage::Setup(SetupPayload {
            model: "live-audio",
            voice: "Kore",
            instructions: "",
        });
        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value["setup"]["voice"], "Kore");
        assert!(value["setup"].get("instructions").is_none());
    }

    #[test]
    fn audio_then_interruption_order() {
        let raw = br#"{"content":{
            "turn":{"parts":[
                {"audio":{"format":"pcm16-mono-24kHz","data":"AAA="}},
                {"audio":{"format":"pcm16-mono-24kHz","data":"AQA="}}
            ]},
            "interrupted":true,
            "turnComplete":true
        }}"#;
        let items = ServerMessage::parse(raw).unwrap().into_inbound();
        assert_eq!(items.len(), 4);
        assert!(matches!(&items[0], InboundMessage::Audio(c) if c.data() == "AAA="));
        assert!(matches!(&items[1], InboundMessage::Audio(c) if c.format() == AudioFormat::AGENT));
        assert_eq!(items[2], InboundMessage::Interrupted);
        assert_eq!(items[3], InboundMessage::TurnComplete);
    }

    #[test]
    fn transcript_passes_through_and_blank_is_skipped() {
        let items = ServerMessage::parse(br#"{"content":{"transcript":{"text":"hello"}}}"#)
            .unwrap()
            .into_inbound();
        assert_eq!(items, vec![InboundMessage::Transcript("hello".into())]);

        let items = ServerMessage::parse(br#"{"content":{"transcript":{"text":""}}}"#)
            .unwrap()
            .into_inbound();
        assert!(items.is_empty());
    }

    #[test]
    fn setup_complete_and_unknown_fields() {
        let msg = ServerMessage::parse(br#"{"setupComplete":{},"usage":{"tokens":3}}"#).unwrap();
        assert!(msg.is_setup_complete());
        assert!(msg.into_inbound().is_empty());
    }

    #[test]
    fn garbage_is_decode_error() {
        assert!(matches!(
            ServerMessage::parse(b"not json"),
            Err(LiveError::Decode(_))
        ));
    }
}
