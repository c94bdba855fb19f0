//! Line-delimited JSON codec for module communication.
//!
//! Uses LinesCodec for framing + serde_json for serialization.
//! Works over any AsyncRead/AsyncWrite (child pipes in practice).
//!
//! Decoding never fails the stream for a bad line: each non-blank line yields
//! `Ok(Ok(message))` or `Ok(Err(protocol_error))`, and the reader decides
//! whether to skip or stop. Only transport failures surface as `Err(io::Error)`.

use std::io;

use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use super::protocol::{ModuleMessage, ModuleRequest, ModuleResponse, ProgressEvent, ProtocolError};

/// Upper bound on a single output line. Larger lines are discarded.
pub const MAX_LINE_LENGTH: usize = 8 * 1024 * 1024;

/// Validate a request and serialize it as one JSON line.
pub fn encode_request(request: &ModuleRequest) -> Result<Vec<u8>, ProtocolError> {
    let request = request.clone().validated()?;
    let mut bytes = serde_json::to_vec(&request)
        .map_err(|e| ProtocolError::InvalidRequest(format!("failed to serialize: {e}")))?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Classify one line of module output.
///
/// A line that validates as a progress event is always progress. Response
/// envelopes carrying a `progress` object are progress too. Anything else
/// shaped like a response must pass response validation.
pub fn decode_line(line: &[u8]) -> Result<ModuleMessage, ProtocolError> {
    let line = line.trim_ascii();
    if line.is_empty() {
        return Err(ProtocolError::MalformedMessage("empty line".to_string()));
    }

    let progress_reason = match serde_json::from_slice::<ProgressEvent>(line) {
        Ok(event) => match event.validate() {
            Ok(()) => return Ok(ModuleMessage::Progress(event)),
            Err(e) => e.to_string(),
        },
        Err(e) => e.to_string(),
    };

    match serde_json::from_slice::<ModuleResponse>(line) {
        Ok(mut response) => {
            if let Some(event) = response.progress.take() {
                return event
                    .validate()
                    .map(|()| ModuleMessage::Progress(event))
                    .map_err(|e| {
                        ProtocolError::MalformedMessage(format!("progress envelope: {e}"))
                    });
            }
            response.validate()?;
            Ok(ModuleMessage::Response(response))
        }
        Err(e) => Err(ProtocolError::MalformedMessage(format!(
            "neither progress ({progress_reason}) nor response ({e})"
        ))),
    }
}

/// Codec for a module's output stream and request input.
pub struct ModuleLineCodec {
    inner: LinesCodec,
}

impl Default for ModuleLineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleLineCodec {
    pub fn new() -> Self {
        Self::with_max_length(MAX_LINE_LENGTH)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            inner: LinesCodec::new_with_max_length(max_length),
        }
    }

    fn classify(
        result: Result<Option<String>, LinesCodecError>,
    ) -> Result<Option<Option<Result<ModuleMessage, ProtocolError>>>, io::Error> {
        match result {
            Ok(Some(line)) if line.trim().is_empty() => Ok(Some(None)),
            Ok(Some(line)) => Ok(Some(Some(decode_line(line.as_bytes())))),
            Ok(None) => Ok(None),
            Err(LinesCodecError::MaxLineLengthExceeded) => Ok(Some(Some(Err(
                ProtocolError::MalformedMessage("line exceeds maximum length".to_string()),
            )))),
            // LinesCodec consumes the line before checking UTF-8.
            Err(LinesCodecError::Io(e)) if e.kind() == io::ErrorKind::InvalidData => Ok(Some(
                Some(Err(ProtocolError::MalformedMessage(format!("{e}")))),
            )),
            Err(LinesCodecError::Io(e)) => Err(e),
        }
    }
}

impl Decoder for ModuleLineCodec {
    type Item = Result<ModuleMessage, ProtocolError>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match Self::classify(self.inner.decode(src))? {
                Some(Some(item)) => return Ok(Some(item)),
                // blank line
                Some(None) => continue,
                None => return Ok(None),
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match Self::classify(self.inner.decode_eof(src))? {
                Some(Some(item)) => return Ok(Some(item)),
                Some(None) => continue,
                None => return Ok(None),
            }
        }
    }
}

impl Encoder<ModuleRequest> for ModuleLineCodec {
    type Error = io::Error;

    fn encode(&mut self, item: ModuleRequest, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let bytes =
            encode_request(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        tracing::trace!(json_size_bytes = bytes.len(), "Encoding module request");
        dst.extend_from_slice(&bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::Args;
    use serde_json::json;

    fn line(value: serde_json::Value) -> Vec<u8> {
        serde_json::to_vec(&value).unwrap()
    }

    #[test]
    fn encode_request_appends_newline_and_fills_timeout() {
        let req = ModuleRequest::new("info").with_timeout_seconds(0);
        let bytes = encode_request(&req).unwrap();
        assert_eq!(bytes.last(), Some(&b'\n'));
        assert_eq!(bytes.iter().filter(|b| **b == b'\n').count(), 1);

        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["timeout"], 300);
        assert_eq!(value["command"], "info");
    }

    #[test]
    fn encode_request_rejects_empty_command() {
        let err = encode_request(&ModuleRequest::new("")).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidRequest(_)));
    }

    #[test]
    fn request_survives_encode_decode() {
        let req = ModuleRequest::new("download")
            .with_arg("url", "https://example.com/v")
            .with_arg("formats", json!(["mp4", {"height": 720}]))
            .with_timeout_seconds(42);
        let bytes = encode_request(&req).unwrap();
        let decoded: ModuleRequest = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded, req);
    }

    fn decode_value<T: serde::Serialize>(value: &T) -> ModuleMessage {
        decode_line(&serde_json::to_vec(value).unwrap()).unwrap()
    }

    #[test]
    fn responses_survive_encode_decode() {
        let mut data = Args::new();
        data.insert("title".to_string(), json!("Song"));
        data.insert("formats".to_string(), json!([{"height": 720}, {"height": 1080}]));
        let success = ModuleResponse::success(data);
        assert_eq!(decode_value(&success), ModuleMessage::Response(success));

        let failure = ModuleResponse::failure("video unavailable");
        assert_eq!(decode_value(&failure), ModuleMessage::Response(failure));
    }

    #[test]
    fn progress_survives_encode_decode() {
        use chrono::TimeZone;

        let stamped = ProgressEvent {
            timestamp: Some(chrono::Utc.with_ymd_and_hms(2024, 5, 1, 10, 30, 0).unwrap()),
            ..ProgressEvent::new("downloading", 1, 3).with_message("part 1")
        };
        assert_eq!(decode_value(&stamped), ModuleMessage::Progress(stamped));

        let unstamped = ProgressEvent {
            timestamp: None,
            ..ProgressEvent::new("saving", 0, 0)
        };
        assert_eq!(decode_value(&unstamped), ModuleMessage::Progress(unstamped));
    }

    #[test]
    fn decodes_progress_event() {
        let msg = decode_line(&line(json!({
            "stage": "downloading",
            "current": 5,
            "total": 10,
            "percentage": 50.0,
            "message": "halfway",
            "timestamp": "2024-01-01T00:00:00Z"
        })))
        .unwrap();
        match msg {
            ModuleMessage::Progress(event) => {
                assert_eq!(event.stage, "downloading");
                assert_eq!(event.current, 5);
                assert_eq!(event.message, "halfway");
            }
            other => panic!("expected progress, got {other:?}"),
        }
    }

    #[test]
    fn decodes_progress_envelope() {
        let msg = decode_line(&line(json!({
            "success": true,
            "data": {},
            "error": null,
            "progress": {
                "stage": "processing",
                "current": 1,
                "total": 4,
                "percentage": 25.0,
                "message": "",
                "timestamp": 1_700_000_000.25
            }
        })))
        .unwrap();
        assert!(matches!(msg, ModuleMessage::Progress(ref e) if e.stage == "processing"));
    }

    #[test]
    fn decodes_final_response() {
        let msg = decode_line(&line(json!({
            "success": true,
            "data": {"title": "Example"},
            "error": ""
        })))
        .unwrap();
        match msg {
            ModuleMessage::Response(resp) => {
                assert!(resp.success);
                assert_eq!(resp.data["title"], "Example");
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn failed_response_without_error_is_invalid() {
        let err = decode_line(&line(json!({"success": false, "data": {}, "error": ""})))
            .unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidResponse(_)));
    }

    #[test]
    fn invalid_progress_falls_through_to_malformed() {
        let err = decode_line(&line(json!({
            "stage": "downloading",
            "current": 11,
            "total": 10,
            "percentage": 50.0
        })))
        .unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedMessage(_)));
        assert!(err.to_string().contains("current cannot exceed total"));
    }

    #[test]
    fn invalid_progress_envelope_is_malformed() {
        let err = decode_line(&line(json!({
            "success": true,
            "progress": {"stage": "", "current": 0, "total": 0, "percentage": 0.0}
        })))
        .unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedMessage(_)));
    }

    #[test]
    fn garbage_is_malformed() {
        for input in [&b"not json"[..], b"[1,2,3]", b"{\"foo\":1}", b"   "] {
            let err = decode_line(input).unwrap_err();
            assert_eq!(err.code(), "MALFORMED_MESSAGE");
        }
    }

    #[test]
    fn progress_shape_wins_over_response_shape() {
        let msg = decode_line(&line(json!({
            "stage": "s",
            "current": 0,
            "total": 1,
            "percentage": 0.0,
            "success": true,
            "data": {}
        })))
        .unwrap();
        assert!(matches!(msg, ModuleMessage::Progress(_)));
    }

    #[test]
    fn decoder_skips_blank_lines_and_reports_bad_ones() {
        let mut codec = ModuleLineCodec::new();
        let mut buf = BytesMut::from(
            "\n  \n{\"stage\":\"a\",\"current\":1,\"total\":2,\"percentage\":50}\r\nnope\n{\"success\":true,\"data\":{},\"error\":\"\"}"
                .as_bytes(),
        );

        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(first, Ok(ModuleMessage::Progress(_))));

        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(second, Err(ProtocolError::MalformedMessage(_))));

        // final line has no trailing newline yet
        assert!(codec.decode(&mut buf).unwrap().is_none());

        let third = codec.decode_eof(&mut buf).unwrap().unwrap();
        assert!(matches!(third, Ok(ModuleMessage::Response(ref r)) if r.success));
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
    }

    #[test]
    fn decoder_turns_oversized_line_into_item() {
        let mut codec = ModuleLineCodec::with_max_length(16);
        let mut buf = BytesMut::from(
            "{\"success\":true,\"data\":{\"k\":\"a very long value\"}}\n{\"success\":true}\n"
                .as_bytes(),
        );

        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(first, Err(ProtocolError::MalformedMessage(_))));

        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(second, Ok(ModuleMessage::Response(_))));
    }

    #[test]
    fn decoder_turns_invalid_utf8_into_item() {
        let mut codec = ModuleLineCodec::new();
        let mut buf = BytesMut::from(&b"\xff\xfe\n{\"success\":true}\n"[..]);

        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(first, Err(ProtocolError::MalformedMessage(_))));

        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(second, Ok(ModuleMessage::Response(_))));
    }

    #[test]
    fn encoder_writes_single_line() {
        let mut codec = ModuleLineCodec::new();
        let mut buf = BytesMut::new();
        let mut args = Args::new();
        args.insert("url".to_string(), json!("https://example.com"));
        codec
            .encode(ModuleRequest::new("download").with_args(args), &mut buf)
            .unwrap();
        assert!(buf.ends_with(b"\n"));

        let err = codec
            .encode(ModuleRequest::new(""), &mut BytesMut::new())
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
