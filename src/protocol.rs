//! Data and wire types for the shared session document.
//!
//! The [`SessionDocument`] is the single shared record per user. Field names
//! match the document layout used by every device (`isActive`, `startedAt`,
//! `_calibId`, …). Key encodings:
//!
//! - Timestamps are integer milliseconds since the Unix epoch.
//! - The server-timestamp directive is `{".sv":"timestamp"}` ([`ServerTimestamp`]).
//! - [`Primary`] encodes as `null | 3 | 2 | "wrong"`, [`Passover`] as `null | 2 | "wrong"`.
//! - Round ids are `r1`‥`r12` and `b1`‥`b4`.
//!
//! [`ClientMessage`] and [`ServerMessage`] are the frames spoken by the WebSocket
//! document gateway.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::error_codes::ErrorCode;

// ── Scalars ─────────────────────────────────────────────────────────

/// Milliseconds since the Unix epoch.
pub type Millis = i64;

/// A random single-use identifier.
///
/// Used for sound broadcasts, calibration handshakes and countdown segments.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Nonce(String);

impl Nonce {
    /// Generate a fresh random nonce.
    pub fn fresh() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// The nonce as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Nonce {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for Nonce {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Write-time sentinel that the backend replaces with its own clock value.
///
/// Serializes as `{".sv":"timestamp"}`. Until the write is confirmed, readers
/// see the field as `None`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerTimestamp {
    #[serde(rename = ".sv")]
    kind: ServerValueKind,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ServerValueKind {
    #[default]
    Timestamp,
}

impl ServerTimestamp {
    /// The server-timestamp directive.
    pub const fn new() -> Self {
        Self {
            kind: ServerValueKind::Timestamp,
        }
    }
}

// ── Sound broadcast ─────────────────────────────────────────────────

/// The most recent one-shot playback request.
///
/// A `None` url asks every other device to stop whatever it is playing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingSound {
    pub id: Nonce,
    #[serde(default)]
    pub url: Option<String>,
}

// ── Scoreboard cells ────────────────────────────────────────────────

/// Fixed identifiers of the sixteen scoreboard rounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RoundId {
    #[serde(rename = "r1")]
    R1,
    #[serde(rename = "r2")]
    R2,
    #[serde(rename = "r3")]
    R3,
    #[serde(rename = "r4")]
    R4,
    #[serde(rename = "r5")]
    R5,
    #[serde(rename = "r6")]
    R6,
    #[serde(rename = "r7")]
    R7,
    #[serde(rename = "r8")]
    R8,
    #[serde(rename = "r9")]
    R9,
    #[serde(rename = "r10")]
    R10,
    #[serde(rename = "r11")]
    R11,
    #[serde(rename = "r12")]
    R12,
    #[serde(rename = "b1")]
    B1,
    #[serde(rename = "b2")]
    B2,
    #[serde(rename = "b3")]
    B3,
    #[serde(rename = "b4")]
    B4,
}

impl RoundId {
    /// All rounds in scoresheet order.
    pub const ALL: [RoundId; 16] = [
        Self::R1,
        Self::R2,
        Self::R3,
        Self::R4,
        Self::R5,
        Self::R6,
        Self::R7,
        Self::R8,
        Self::R9,
        Self::R10,
        Self::R11,
        Self::R12,
        Self::B1,
        Self::B2,
        Self::B3,
        Self::B4,
    ];

    /// The wire identifier (`"r1"`, `"b4"`, …).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::R1 => "r1",
            Self::R2 => "r2",
            Self::R3 => "r3",
            Self::R4 => "r4",
            Self::R5 => "r5",
            Self::R6 => "r6",
            Self::R7 => "r7",
            Self::R8 => "r8",
            Self::R9 => "r9",
            Self::R10 => "r10",
            Self::R11 => "r11",
            Self::R12 => "r12",
            Self::B1 => "b1",
            Self::B2 => "b2",
            Self::B3 => "b3",
            Self::B4 => "b4",
        }
    }

    /// Zero-based position in scoresheet order.
    pub fn index(&self) -> usize {
        Self::ALL
            .iter()
            .position(|round| round == self)
            .unwrap_or_default()
    }
}

impl fmt::Display for RoundId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const WRONG: &str = "wrong";

/// Result recorded for the primary team of a round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Primary {
    #[default]
    Unanswered,
    AwardedThree,
    AwardedTwo,
    Wrong,
}

impl Primary {
    /// Points credited to the primary team.
    pub fn points(&self) -> u32 {
        match self {
            Self::AwardedThree => 3,
            Self::AwardedTwo => 2,
            Self::Unanswered | Self::Wrong => 0,
        }
    }
}

/// Result recorded for the passover team of a round.
///
/// Only meaningful while the round's [`Primary`] is [`Primary::Wrong`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Passover {
    #[default]
    Unanswered,
    AwardedTwo,
    Wrong,
}

impl Passover {
    /// Points credited to the passover team.
    pub fn points(&self) -> u32 {
        match self {
            Self::AwardedTwo => 2,
            Self::Unanswered | Self::Wrong => 0,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawMark {
    Points(u8),
    Tag(String),
}

impl Serialize for Primary {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Unanswered => serializer.serialize_none(),
            Self::AwardedThree => serializer.serialize_u8(3),
            Self::AwardedTwo => serializer.serialize_u8(2),
            Self::Wrong => serializer.serialize_str(WRONG),
        }
    }
}

impl<'de> Deserialize<'de> for Primary {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match Option::<RawMark>::deserialize(deserializer)? {
            None => Ok(Self::Unanswered),
            Some(RawMark::Points(3)) => Ok(Self::AwardedThree),
            Some(RawMark::Points(2)) => Ok(Self::AwardedTwo),
            Some(RawMark::Tag(tag)) if tag == WRONG => Ok(Self::Wrong),
            Some(other) => Err(D::Error::custom(format!(
                "invalid primary mark: {other:?}"
            ))),
        }
    }
}

impl Serialize for Passover {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Unanswered => serializer.serialize_none(),
            Self::AwardedTwo => serializer.serialize_u8(2),
            Self::Wrong => serializer.serialize_str(WRONG),
        }
    }
}

impl<'de> Deserialize<'de> for Passover {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match Option::<RawMark>::deserialize(deserializer)? {
            None => Ok(Self::Unanswered),
            Some(RawMark::Points(2)) => Ok(Self::AwardedTwo),
            Some(RawMark::Tag(tag)) if tag == WRONG => Ok(Self::Wrong),
            Some(other) => Err(D::Error::custom(format!(
                "invalid passover mark: {other:?}"
            ))),
        }
    }
}

/// One scoreboard row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cell {
    #[serde(default)]
    pub primary: Primary,
    #[serde(default)]
    pub passover: Passover,
}

impl Cell {
    /// The cell with its passover cleared unless the primary answer was wrong.
    pub fn normalized(self) -> Self {
        if self.primary == Primary::Wrong {
            self
        } else {
            Self {
                primary: self.primary,
                passover: Passover::Unanswered,
            }
        }
    }
}

/// Scoreboard state keyed by round.
pub type Cells = BTreeMap<RoundId, Cell>;

/// A blank scoreboard with every round unanswered.
pub fn blank_cells() -> Cells {
    RoundId::ALL
        .iter()
        .map(|round| (*round, Cell::default()))
        .collect()
}

/// Fill missing rounds and clear passovers that violate the cell invariant.
pub fn normalize_cells(cells: &Cells) -> Cells {
    RoundId::ALL
        .iter()
        .map(|round| {
            let cell = cells.get(round).copied().unwrap_or_default();
            (*round, cell.normalized())
        })
        .collect()
}

// ── Session document ────────────────────────────────────────────────

/// The shared per-user session document.
///
/// `remaining_on_pause` is meaningful only while `is_paused`; `started_at`,
/// `segment_id` and `original_total` only while active and not paused.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionDocument {
    pub is_active: bool,
    pub is_paused: bool,
    pub started_at: Option<Millis>,
    pub segment_id: Option<Nonce>,
    pub original_total: f64,
    pub remaining_on_pause: f64,
    pub pending_sound: Option<PendingSound>,
    pub cells: Option<Cells>,
    pub team_a: Option<String>,
    pub team_b: Option<String>,
    pub page: Option<u32>,
    #[serde(rename = "_calibId")]
    pub calib_id: Option<Nonce>,
    #[serde(rename = "_calibAt")]
    pub calib_at: Option<Millis>,
}

impl SessionDocument {
    /// Apply a merge-style partial write.
    ///
    /// `server_time` resolves [`ServerTimestamp`] directives; pass `None` for an
    /// unconfirmed local overlay, where such fields read as `None`.
    pub fn apply_patch(&mut self, patch: &SessionPatch, server_time: Option<Millis>) {
        if let Some(is_active) = patch.is_active {
            self.is_active = is_active;
        }
        if let Some(is_paused) = patch.is_paused {
            self.is_paused = is_paused;
        }
        if patch.started_at.is_some() {
            self.started_at = server_time;
        }
        if let Some(segment_id) = &patch.segment_id {
            self.segment_id = Some(segment_id.clone());
        }
        if let Some(total) = patch.original_total {
            self.original_total = total;
        }
        if let Some(remaining) = patch.remaining_on_pause {
            self.remaining_on_pause = remaining;
        }
        if let Some(sound) = &patch.pending_sound {
            self.pending_sound = Some(sound.clone());
        }
        if let Some(cells) = &patch.cells {
            self.cells = Some(cells.clone());
        }
        if let Some(name) = &patch.team_a {
            self.team_a = Some(name.clone());
        }
        if let Some(name) = &patch.team_b {
            self.team_b = Some(name.clone());
        }
        if let Some(page) = patch.page {
            self.page = Some(page);
        }
        if let Some(calib_id) = &patch.calib_id {
            self.calib_id = Some(calib_id.clone());
        }
        if patch.calib_at.is_some() {
            self.calib_at = server_time;
        }
    }

    /// Identifier of the running countdown segment.
    ///
    /// Documents written without a `segmentId` fall back to a key derived from
    /// `startedAt`.
    pub fn segment_key(&self) -> Option<Nonce> {
        self.segment_id
            .clone()
            .or_else(|| self.started_at.map(|ms| Nonce::from(format!("at-{ms}"))))
    }
}

/// A merge-style partial write: only `Some` fields are replaced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_active: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_paused: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<ServerTimestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segment_id: Option<Nonce>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_total: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining_on_pause: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_sound: Option<PendingSound>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cells: Option<Cells>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_a: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_b: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    #[serde(
        rename = "_calibId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub calib_id: Option<Nonce>,
    #[serde(
        rename = "_calibAt",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub calib_at: Option<ServerTimestamp>,
}

impl SessionPatch {
    /// Returns `true` if the patch replaces no field.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

// ── Gateway messages ────────────────────────────────────────────────

/// Frames sent from a device to the document gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ClientMessage {
    /// Subscribe to the session document of `uid` (MUST be the first frame).
    Subscribe {
        uid: String,
        /// Identity token proving ownership of `uid`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id_token: Option<String>,
    },
    /// Merge-write a partial update. `write_id` increases per connection.
    Merge { write_id: u64, patch: SessionPatch },
    /// Heartbeat.
    Ping,
}

/// Frames sent from the document gateway to a device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ServerMessage {
    /// The subscription is live.
    Subscribed { uid: String },
    /// The full confirmed document after a change.
    Snapshot {
        /// `None` if the document does not exist yet.
        document: Option<SessionDocument>,
        /// Highest `write_id` from this connection reflected in `document`.
        #[serde(default)]
        acknowledged: Option<u64>,
    },
    /// A merge was refused and will never be applied.
    WriteRejected {
        write_id: u64,
        message: String,
        #[serde(default)]
        error_code: Option<ErrorCode>,
    },
    /// A connection-level error.
    Error {
        message: String,
        #[serde(default)]
        error_code: Option<ErrorCode>,
    },
    /// Heartbeat reply.
    Pong,
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn primary_marks_use_mixed_encoding() {
        let json = serde_json::to_string(&[
            Primary::Unanswered,
            Primary::AwardedThree,
            Primary::AwardedTwo,
            Primary::Wrong,
        ])
        .unwrap();
        assert_eq!(json, r#"[null,3,2,"wrong"]"#);
    }

    #[test]
    fn passover_rejects_three_points() {
        let result = serde_json::from_str::<Passover>("3");
        assert!(result.is_err());
    }

    #[test]
    fn cell_with_missing_fields_is_blank() {
        let cell: Cell = serde_json::from_str("{}").unwrap();
        assert_eq!(cell, Cell::default());
    }

    #[test]
    fn normalized_clears_passover_unless_wrong() {
        let cell = Cell {
            primary: Primary::AwardedTwo,
            passover: Passover::AwardedTwo,
        };
        assert_eq!(cell.normalized().passover, Passover::Unanswered);

        let wrong = Cell {
            primary: Primary::Wrong,
            passover: Passover::AwardedTwo,
        };
        assert_eq!(wrong.normalized(), wrong);
    }

    #[test]
    fn normalize_fills_missing_rounds() {
        let mut partial = Cells::new();
        partial.insert(
            RoundId::R3,
            Cell {
                primary: Primary::Wrong,
                passover: Passover::Wrong,
            },
        );
        let full = normalize_cells(&partial);
        assert_eq!(full.len(), 16);
        assert_eq!(full[&RoundId::R3].passover, Passover::Wrong);
        assert_eq!(full[&RoundId::B4], Cell::default());
    }

    #[test]
    fn round_index_follows_scoresheet_order() {
        assert_eq!(RoundId::R1.index(), 0);
        assert_eq!(RoundId::R12.index(), 11);
        assert_eq!(RoundId::B4.index(), 15);
    }

    #[test]
    fn server_timestamp_sentinel_shape() {
        let json = serde_json::to_value(ServerTimestamp::new()).unwrap();
        assert_eq!(json, serde_json::json!({".sv": "timestamp"}));
    }

    #[test]
    fn patch_serializes_only_listed_fields() {
        let patch = SessionPatch {
            is_paused: Some(true),
            remaining_on_pause: Some(12.5),
            ..Default::default()
        };
        let json = serde_json::to_value(&patch).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"isPaused": true, "remainingOnPause": 12.5})
        );
    }

    #[test]
    fn apply_patch_resolves_server_timestamps() {
        let patch = SessionPatch {
            is_active: Some(true),
            started_at: Some(ServerTimestamp::new()),
            segment_id: Some(Nonce::from("seg-1")),
            original_total: Some(20.0),
            ..Default::default()
        };

        let mut overlay = SessionDocument::default();
        overlay.apply_patch(&patch, None);
        assert!(overlay.is_active);
        assert_eq!(overlay.started_at, None);

        let mut confirmed = SessionDocument::default();
        confirmed.apply_patch(&patch, Some(5_000));
        assert_eq!(confirmed.started_at, Some(5_000));
        assert_eq!(confirmed.original_total, 20.0);
    }

    #[test]
    fn apply_patch_leaves_unlisted_fields() {
        let mut doc = SessionDocument {
            team_a: Some("Owls".into()),
            page: Some(2),
            ..Default::default()
        };
        doc.apply_patch(
            &SessionPatch {
                team_b: Some("Foxes".into()),
                ..Default::default()
            },
            Some(1),
        );
        assert_eq!(doc.team_a.as_deref(), Some("Owls"));
        assert_eq!(doc.team_b.as_deref(), Some("Foxes"));
        assert_eq!(doc.page, Some(2));
    }

    #[test]
    fn segment_key_falls_back_to_started_at() {
        let doc = SessionDocument {
            started_at: Some(1_234),
            ..Default::default()
        };
        assert_eq!(doc.segment_key(), Some(Nonce::from("at-1234")));
    }

    #[test]
    fn fresh_nonces_differ() {
        assert_ne!(Nonce::fresh(), Nonce::fresh());
    }
}
