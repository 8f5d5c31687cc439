use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::error::ScoreError;
use crate::scorer::Scorer;
use crate::types::{PayloadKind, RawPayload};

const MODEL_VERSION: &str = "game-events/1";

/// Goal line x coordinate in rink units; nets sit at ±89.
const NET_X: f64 = 89.0;

/// Default scorer: shot events with a distance/angle quality estimate from
/// play-by-play, per-player stat lines from box scores.
#[derive(Debug, Default)]
pub struct GameEventScorer;

impl GameEventScorer {
    pub fn new() -> Self {
        Self
    }
}

impl Scorer for GameEventScorer {
    fn model_version(&self) -> &str {
        MODEL_VERSION
    }

    fn score(&self, payload: &RawPayload) -> Result<Value, ScoreError> {
        match payload.kind {
            PayloadKind::PlayByPlay => score_play_by_play(&payload.body),
            PayloadKind::BoxScore => score_box_score(&payload.body),
        }
    }
}

// ---------------------------------------------------------------------------
// Play-by-play → shot events
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct PlayByPlayFeed {
    #[serde(default)]
    plays: Option<Vec<Play>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Play {
    #[serde(default)]
    event_id: Option<i64>,
    #[serde(default)]
    period_descriptor: Option<PeriodDescriptor>,
    #[serde(default)]
    time_in_period: Option<String>,
    #[serde(default)]
    type_desc_key: String,
    #[serde(default)]
    details: Option<PlayDetails>,
}

#[derive(Debug, Deserialize)]
struct PeriodDescriptor {
    #[serde(default)]
    number: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlayDetails {
    x_coord: Option<f64>,
    y_coord: Option<f64>,
    event_owner_team_id: Option<i64>,
    shooting_player_id: Option<i64>,
    scoring_player_id: Option<i64>,
    shot_type: Option<String>,
}

fn is_shot(type_desc_key: &str) -> bool {
    matches!(
        type_desc_key,
        "goal" | "shot-on-goal" | "missed-shot" | "blocked-shot"
    )
}

fn score_play_by_play(body: &[u8]) -> Result<Value, ScoreError> {
    let feed: PlayByPlayFeed = serde_json::from_slice(body)?;
    let plays = feed.plays.ok_or(ScoreError::MissingField("plays"))?;

    let mut shots = Vec::new();
    let mut goals = 0u32;
    let mut expected_goals = 0.0f64;

    for play in plays.iter().filter(|p| is_shot(&p.type_desc_key)) {
        let details = play.details.as_ref();
        let geometry = details.and_then(|d| Some(shot_geometry(d.x_coord?, d.y_coord?)));
        let quality = geometry.map(|(distance, angle)| shot_quality(distance, angle));

        if play.type_desc_key == "goal" {
            goals += 1;
        }
        if let Some(q) = quality {
            expected_goals += q;
        }

        shots.push(json!({
            "event_id": play.event_id,
            "period": play.period_descriptor.as_ref().and_then(|p| p.number),
            "time_in_period": play.time_in_period,
            "result": play.type_desc_key,
            "team_id": details.and_then(|d| d.event_owner_team_id),
            "shooter_id": details.and_then(|d| d.scoring_player_id.or(d.shooting_player_id)),
            "shot_type": details.and_then(|d| d.shot_type.clone()),
            "distance": geometry.map(|(d, _)| round(d, 2)),
            "angle": geometry.map(|(_, a)| round(a, 2)),
            "quality": quality.map(|q| round(q, 4)),
        }));
    }

    Ok(json!({
        "shot_count": shots.len(),
        "goals": goals,
        "expected_goals": round(expected_goals, 4),
        "shots": shots,
    }))
}

/// Distance (ft) and angle (degrees off the centre line) to the nearer net.
fn shot_geometry(x: f64, y: f64) -> (f64, f64) {
    let net_x = if x >= 0.0 { NET_X } else { -NET_X };
    let dx = (net_x - x).abs();
    let dy = y.abs();
    let distance = (dx * dx + dy * dy).sqrt();
    let angle = dy.atan2(dx).to_degrees();
    (distance, angle)
}

/// Logistic goal probability falling off with distance and angle.
fn shot_quality(distance: f64, angle: f64) -> f64 {
    let z = 0.9 - 0.07 * distance - 0.025 * angle;
    1.0 / (1.0 + (-z).exp())
}

fn round(v: f64, places: i32) -> f64 {
    let f = 10f64.powi(places);
    (v * f).round() / f
}

// ---------------------------------------------------------------------------
// Box score → per-player stat lines
// ---------------------------------------------------------------------------

const TEAM_SIDES: [(&str, &str); 2] = [("awayTeam", "away"), ("homeTeam", "home")];
const PLAYER_GROUPS: [&str; 3] = ["forwards", "defense", "goalies"];

fn score_box_score(body: &[u8]) -> Result<Value, ScoreError> {
    let doc: Value = serde_json::from_slice(body)?;
    let by_team = doc
        .get("playerByGameStats")
        .and_then(Value::as_object)
        .ok_or(ScoreError::MissingField("playerByGameStats"))?;

    let mut lines: Vec<(String, i64, Value)> = Vec::new();
    for (key, side) in TEAM_SIDES {
        let Some(team) = by_team.get(key) else { continue };
        for group in PLAYER_GROUPS {
            let players = team.get(group).and_then(Value::as_array);
            for player in players.into_iter().flatten() {
                let Some(line) = stat_line(player, side, group) else { continue };
                let id = player.get("playerId").and_then(Value::as_i64).unwrap_or(0);
                lines.push((side.to_string(), id, line));
            }
        }
    }
    lines.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

    Ok(json!({
        "player_count": lines.len(),
        "players": lines.into_iter().map(|(_, _, line)| line).collect::<Vec<_>>(),
    }))
}

/// Scalar stats of one player. Nested objects (names, localisations) are
/// dropped; keys come out sorted since `Map` is ordered.
fn stat_line(player: &Value, side: &str, group: &str) -> Option<Value> {
    let obj = player.as_object()?;
    obj.get("playerId")?;

    let mut line = Map::new();
    for (k, v) in obj {
        if matches!(v, Value::Number(_) | Value::String(_) | Value::Bool(_)) {
            line.insert(k.clone(), v.clone());
        }
    }
    if let Some(name) = obj.get("name").and_then(|n| n.get("default")).and_then(Value::as_str) {
        line.insert("name".to_string(), Value::String(name.to_string()));
    }
    line.insert("team".to_string(), Value::String(side.to_string()));
    line.insert("group".to_string(), Value::String(group.to_string()));
    Some(Value::Object(line))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PayloadRef;
    use chrono::Utc;

    fn raw(kind: PayloadKind, body: &str) -> RawPayload {
        RawPayload {
            payload_ref: PayloadRef { id: 1, revision: 1 },
            event_id: "2024020101".into(),
            kind,
            body: body.as_bytes().to_vec(),
            fetched_at: Utc::now(),
            processed: false,
        }
    }

    const PBP: &str = r#"{
        "plays": [
            {"eventId": 5, "typeDescKey": "faceoff", "details": {"xCoord": 0, "yCoord": 0}},
            {"eventId": 9, "periodDescriptor": {"number": 1}, "timeInPeriod": "03:10",
             "typeDescKey": "shot-on-goal",
             "details": {"xCoord": 79, "yCoord": 0, "eventOwnerTeamId": 10, "shootingPlayerId": 8478402, "shotType": "wrist"}},
            {"eventId": 12, "periodDescriptor": {"number": 2}, "timeInPeriod": "11:42",
             "typeDescKey": "goal",
             "details": {"xCoord": -80, "yCoord": -9, "eventOwnerTeamId": 6, "scoringPlayerId": 8479318, "shotType": "snap"}},
            {"eventId": 14, "typeDescKey": "blocked-shot", "details": {}}
        ]
    }"#;

    #[test]
    fn play_by_play_extracts_shots() {
        let out = GameEventScorer::new().score(&raw(PayloadKind::PlayByPlay, PBP)).unwrap();
        assert_eq!(out["shot_count"], 3);
        assert_eq!(out["goals"], 1);

        let first = &out["shots"][0];
        assert_eq!(first["event_id"], 9);
        assert_eq!(first["distance"], 10.0);
        assert_eq!(first["angle"], 0.0);
        assert_eq!(first["shooter_id"], 8478402);

        // Blocked shot without coordinates still counts, without a quality.
        assert!(out["shots"][2]["quality"].is_null());
    }

    #[test]
    fn closer_shots_score_higher() {
        assert!(shot_quality(10.0, 0.0) > shot_quality(40.0, 0.0));
        assert!(shot_quality(20.0, 5.0) > shot_quality(20.0, 60.0));
    }

    #[test]
    fn geometry_uses_nearer_net() {
        let (d, a) = shot_geometry(-86.0, 4.0);
        assert_eq!(round(d, 2), 5.0);
        assert!((a - 53.13).abs() < 0.01);
    }

    #[test]
    fn rescoring_is_byte_identical() {
        let scorer = GameEventScorer::new();
        let a = serde_json::to_string(&scorer.score(&raw(PayloadKind::PlayByPlay, PBP)).unwrap()).unwrap();
        let b = serde_json::to_string(&scorer.score(&raw(PayloadKind::PlayByPlay, PBP)).unwrap()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn box_score_lines_sorted_by_side_then_player() {
        let body = r#"{
            "playerByGameStats": {
                "homeTeam": {"forwards": [{"playerId": 3, "name": {"default": "C. Three"}, "goals": 1, "toi": "18:01"}]},
                "awayTeam": {
                    "defense": [{"playerId": 9, "name": {"default": "N. Nine"}, "hits": 4}],
                    "goalies": [{"playerId": 1, "saveShotsAgainst": "30/32"}]
                }
            }
        }"#;
        let out = GameEventScorer::new().score(&raw(PayloadKind::BoxScore, body)).unwrap();
        assert_eq!(out["player_count"], 3);
        let ids: Vec<i64> = out["players"]
            .as_array()
            .unwrap()
            .iter()
            .map(|p| p["playerId"].as_i64().unwrap())
            .collect();
        assert_eq!(ids, vec![1, 9, 3]);
        assert_eq!(out["players"][1]["name"], "N. Nine");
        assert_eq!(out["players"][2]["team"], "home");
    }

    #[test]
    fn malformed_and_incomplete_payloads_fail() {
        let scorer = GameEventScorer::new();
        assert!(matches!(
            scorer.score(&raw(PayloadKind::PlayByPlay, "not json")),
            Err(ScoreError::Malformed(_))
        ));
        assert!(matches!(
            scorer.score(&raw(PayloadKind::PlayByPlay, "{}")),
            Err(ScoreError::MissingField("plays"))
        ));
        assert!(matches!(
            scorer.score(&raw(PayloadKind::BoxScore, r#"{"id": 1}"#)),
            Err(ScoreError::MissingField("playerByGameStats"))
        ));
    }
}
