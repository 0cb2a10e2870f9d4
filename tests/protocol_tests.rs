#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
//! Wire format tests for the session document and gateway frames.
//!
//! Verifies that documents written by other clients parse, that the writes this
//! crate produces have the exact JSON shape the backend expects, and that
//! gateway frames match real gateway output.

use botb_session_sync::error_codes::ErrorCode;
use botb_session_sync::protocol::{
    ClientMessage, Nonce, PendingSound, ServerMessage, SessionDocument, SessionPatch,
};
use botb_session_sync::scores::{totals, GameRecord};
use botb_session_sync::session::SessionCore;
use botb_session_sync::{Passover, Primary, RoundId, SessionConfig, Totals};
use serde_json::json;

// ════════════════════════════════════════════════════════════════════
// Session document fixtures
// ════════════════════════════════════════════════════════════════════

const RUNNING_DOCUMENT: &str = r#"{
    "isActive": true,
    "isPaused": false,
    "startedAt": 1700000000000,
    "segmentId": "6f1c2d7e",
    "originalTotal": 30,
    "remainingOnPause": 0,
    "pendingSound": { "id": "a1b2", "url": "https://cdn.example.com/horn.mp3" },
    "cells": {
        "r1": { "primary": 3, "passover": null },
        "r2": { "primary": "wrong", "passover": 2 },
        "b4": { "primary": 2, "passover": null }
    },
    "teamA": "Owls",
    "teamB": "Foxes",
    "page": 1,
    "_calibId": "c0ffee",
    "_calibAt": 1700000000123
}"#;

#[test]
fn running_document_parses() {
    let doc: SessionDocument = serde_json::from_str(RUNNING_DOCUMENT).unwrap();
    assert!(doc.is_active);
    assert!(!doc.is_paused);
    assert_eq!(doc.started_at, Some(1_700_000_000_000));
    assert_eq!(doc.segment_id, Some(Nonce::from("6f1c2d7e")));
    assert_eq!(doc.original_total, 30.0);
    assert_eq!(
        doc.pending_sound,
        Some(PendingSound {
            id: Nonce::from("a1b2"),
            url: Some("https://cdn.example.com/horn.mp3".into()),
        })
    );
    assert_eq!(doc.team_a.as_deref(), Some("Owls"));
    assert_eq!(doc.page, Some(1));
    assert_eq!(doc.calib_id, Some(Nonce::from("c0ffee")));
    assert_eq!(doc.calib_at, Some(1_700_000_000_123));

    let cells = doc.cells.unwrap();
    assert_eq!(cells[&RoundId::R1].primary, Primary::AwardedThree);
    assert_eq!(cells[&RoundId::R2].primary, Primary::Wrong);
    assert_eq!(cells[&RoundId::R2].passover, Passover::AwardedTwo);
    assert_eq!(cells[&RoundId::B4].primary, Primary::AwardedTwo);
    // r2 is Team B's round, passed over to Team A; b4 is Team B's.
    assert_eq!(totals(&cells), Totals { team_a: 5, team_b: 2 });
}

#[test]
fn empty_document_reads_as_idle() {
    let doc: SessionDocument = serde_json::from_str("{}").unwrap();
    assert_eq!(doc, SessionDocument::default());
    assert!(!doc.is_active);
    assert!(doc.cells.is_none());
}

#[test]
fn unknown_fields_are_ignored() {
    let doc: SessionDocument =
        serde_json::from_str(r#"{"isActive": false, "theme": "dark", "volume": 0.3}"#).unwrap();
    assert!(!doc.is_active);
}

#[test]
fn document_without_segment_id_derives_key_from_start() {
    let doc: SessionDocument =
        serde_json::from_str(r#"{"isActive": true, "startedAt": 42, "originalTotal": 10}"#)
            .unwrap();
    assert_eq!(doc.segment_key(), Some(Nonce::from("at-42")));
}

#[test]
fn invalid_marks_are_rejected() {
    let result = serde_json::from_str::<SessionDocument>(r#"{"cells": {"r1": {"primary": 5}}}"#);
    assert!(result.is_err());
    let result =
        serde_json::from_str::<SessionDocument>(r#"{"cells": {"r1": {"passover": "maybe"}}}"#);
    assert!(result.is_err());
}

#[test]
fn round_ids_use_short_keys() {
    let keys: Vec<String> = RoundId::ALL
        .iter()
        .map(|round| serde_json::to_string(round).unwrap())
        .collect();
    assert_eq!(keys.first().unwrap(), "\"r1\"");
    assert_eq!(keys[11], "\"r12\"");
    assert_eq!(keys[12], "\"b1\"");
    assert_eq!(keys.last().unwrap(), "\"b4\"");
}

// ════════════════════════════════════════════════════════════════════
// Outbound write shapes
// ════════════════════════════════════════════════════════════════════

fn core() -> SessionCore {
    SessionCore::new(&SessionConfig::new())
}

#[test]
fn start_write_shape() {
    let patch = core().start_timer(20.0, 1_000);
    let segment = patch.segment_id.clone().unwrap();
    assert_eq!(
        serde_json::to_value(&patch).unwrap(),
        json!({
            "isActive": true,
            "isPaused": false,
            "startedAt": { ".sv": "timestamp" },
            "segmentId": segment.as_str(),
            "originalTotal": 20.0,
            "remainingOnPause": 0.0,
        })
    );
}

#[test]
fn pause_write_shape() {
    let mut core = core();
    let _ = core.start_timer(20.0, 1_000);
    let patch = core.pause_timer(6_500).unwrap();
    assert_eq!(
        serde_json::to_value(&patch).unwrap(),
        json!({ "isPaused": true, "remainingOnPause": 14.5 })
    );
}

#[test]
fn reset_write_shape() {
    let patch = core().reset_timer();
    assert_eq!(
        serde_json::to_value(&patch).unwrap(),
        json!({ "isActive": false, "isPaused": false })
    );
}

#[test]
fn calibration_write_shape() {
    let patch = core().begin_subscription(0);
    let nonce = patch.calib_id.clone().unwrap();
    assert_eq!(
        serde_json::to_value(&patch).unwrap(),
        json!({ "_calibId": nonce.as_str(), "_calibAt": { ".sv": "timestamp" } })
    );
}

#[test]
fn passover_write_carries_full_cells() {
    let mut core = core();
    let _ = core.set_primary(RoundId::R3, Primary::Wrong);
    let patch = core.set_passover(RoundId::R3, Passover::Wrong).unwrap();
    let value = serde_json::to_value(&patch).unwrap();
    let cells = value["cells"].as_object().unwrap();
    assert_eq!(cells.len(), 16);
    assert_eq!(cells["r3"], json!({ "primary": "wrong", "passover": "wrong" }));
    assert_eq!(cells["r4"], json!({ "primary": null, "passover": null }));
}

#[test]
fn sound_write_shape() {
    let patch = core().broadcast_sound(None);
    let value = serde_json::to_value(&patch).unwrap();
    assert_eq!(value.as_object().unwrap().len(), 1);
    assert!(value["pendingSound"]["id"].is_string());
    assert!(value["pendingSound"]["url"].is_null());
}

#[test]
fn empty_patch_serializes_to_empty_object() {
    assert_eq!(
        serde_json::to_string(&SessionPatch::default()).unwrap(),
        "{}"
    );
}

#[test]
fn game_record_uses_camel_case() {
    let record = GameRecord {
        team_a: "Owls".into(),
        team_b: "Foxes".into(),
        score_a: 12,
        score_b: 9,
        cells: None,
    };
    assert_eq!(
        serde_json::to_value(&record).unwrap(),
        json!({ "teamA": "Owls", "teamB": "Foxes", "scoreA": 12, "scoreB": 9, "cells": null })
    );
}

// ════════════════════════════════════════════════════════════════════
// Gateway frames
// ════════════════════════════════════════════════════════════════════

#[test]
fn subscribe_frame_omits_missing_token() {
    let msg = ClientMessage::Subscribe {
        uid: "u1".into(),
        id_token: None,
    };
    assert_eq!(
        serde_json::to_value(&msg).unwrap(),
        json!({ "type": "Subscribe", "data": { "uid": "u1" } })
    );
}

#[test]
fn merge_frame_shape() {
    let msg = ClientMessage::Merge {
        write_id: 7,
        patch: SessionPatch {
            page: Some(3),
            ..Default::default()
        },
    };
    assert_eq!(
        serde_json::to_value(&msg).unwrap(),
        json!({ "type": "Merge", "data": { "write_id": 7, "patch": { "page": 3 } } })
    );
}

#[test]
fn ping_frame_shape() {
    assert_eq!(
        serde_json::to_string(&ClientMessage::Ping).unwrap(),
        r#"{"type":"Ping"}"#
    );
}

#[test]
fn snapshot_frame_parses() {
    let json = format!(
        r#"{{"type":"Snapshot","data":{{"document":{RUNNING_DOCUMENT},"acknowledged":3}}}}"#
    );
    let msg: ServerMessage = serde_json::from_str(&json).unwrap();
    let ServerMessage::Snapshot {
        document,
        acknowledged,
    } = msg
    else {
        panic!("expected Snapshot variant");
    };
    assert_eq!(acknowledged, Some(3));
    assert_eq!(document.unwrap().team_b.as_deref(), Some("Foxes"));
}

#[test]
fn snapshot_frame_without_document_or_ack() {
    let msg: ServerMessage =
        serde_json::from_str(r#"{"type":"Snapshot","data":{"document":null}}"#).unwrap();
    assert!(matches!(
        msg,
        ServerMessage::Snapshot {
            document: None,
            acknowledged: None
        }
    ));
}

#[test]
fn write_rejected_frame_parses() {
    let json = r#"{"type":"WriteRejected","data":{"write_id":4,"message":"no access","error_code":"PERMISSION_DENIED"}}"#;
    let msg: ServerMessage = serde_json::from_str(json).unwrap();
    if let ServerMessage::WriteRejected {
        write_id,
        message,
        error_code,
    } = msg
    {
        assert_eq!(write_id, 4);
        assert_eq!(message, "no access");
        assert_eq!(error_code, Some(ErrorCode::PermissionDenied));
    } else {
        panic!("expected WriteRejected variant");
    }
}

#[test]
fn error_frame_without_code() {
    let msg: ServerMessage =
        serde_json::from_str(r#"{"type":"Error","data":{"message":"overloaded"}}"#).unwrap();
    assert!(matches!(
        msg,
        ServerMessage::Error { ref message, error_code: None } if message == "overloaded"
    ));
}

#[test]
fn subscribed_and_pong_frames_parse() {
    let msg: ServerMessage =
        serde_json::from_str(r#"{"type":"Subscribed","data":{"uid":"u1"}}"#).unwrap();
    assert!(matches!(msg, ServerMessage::Subscribed { ref uid } if uid == "u1"));
    let msg: ServerMessage = serde_json::from_str(r#"{"type":"Pong"}"#).unwrap();
    assert!(matches!(msg, ServerMessage::Pong));
}

#[test]
fn unknown_frame_type_is_an_error() {
    let result = serde_json::from_str::<ServerMessage>(r#"{"type":"Teleport","data":{}}"#);
    assert!(result.is_err());
}

#[test]
fn error_codes_use_screaming_snake_case() {
    for (code, text) in [
        (ErrorCode::Unauthenticated, "\"UNAUTHENTICATED\""),
        (ErrorCode::InvalidPatch, "\"INVALID_PATCH\""),
        (ErrorCode::DocumentTooLarge, "\"DOCUMENT_TOO_LARGE\""),
        (ErrorCode::DeadlineExceeded, "\"DEADLINE_EXCEEDED\""),
    ] {
        assert_eq!(serde_json::to_string(&code).unwrap(), text);
        assert_eq!(serde_json::from_str::<ErrorCode>(text).unwrap(), code);
    }
}
