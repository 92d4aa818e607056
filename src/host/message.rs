//! Inbound requests, outbound responses and the asynchronous exit event.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::mpv::PresentationOptions;
use crate::session::{CloseOutcome, RunningStatus, SessionError, StartOutcome};

#[derive(Debug, Error)]
pub enum ProtocolError {
  #[error("Invalid message: {0}")]
  InvalidJson(#[from] serde_json::Error),
  #[error("Message has no action")]
  MissingAction,
  #[error("Invalid '{action}' message: {source}")]
  InvalidPayload {
    action: String,
    #[source]
    source: serde_json::Error,
  },
}

/// Decoded inbound command.
#[derive(Debug)]
pub enum Request {
  Play(PlayRequest),
  Close,
  IsRunning,
  Unknown(String),
}

impl Request {
  pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
    let action = value
      .get("action")
      .and_then(Value::as_str)
      .ok_or(ProtocolError::MissingAction)?
      .to_string();
    match action.as_str() {
      "play" => serde_json::from_value(value)
        .map(Request::Play)
        .map_err(|source| ProtocolError::InvalidPayload { action, source }),
      "close" | "close_mpv" => Ok(Request::Close),
      "isRunning" | "is_mpv_running" => Ok(Request::IsRunning),
      _ => Ok(Request::Unknown(action)),
    }
  }
}

/// Correlation id of a raw message, when it carries one.
pub fn request_id(value: &Value) -> Option<Value> {
  value.get("request_id").filter(|id| !id.is_null()).cloned()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayRequest {
  #[serde(default)]
  pub playlist: Vec<String>,
  #[serde(default, alias = "folderId")]
  pub owner_id: Option<String>,
  #[serde(default)]
  pub geometry: Option<String>,
  #[serde(default, alias = "custom_width", deserialize_with = "dimension")]
  pub custom_width: Option<u32>,
  #[serde(default, alias = "custom_height", deserialize_with = "dimension")]
  pub custom_height: Option<u32>,
  #[serde(default, alias = "custom_mpv_flags")]
  pub mpv_flags: Option<String>,
  #[serde(default, alias = "start_paused")]
  pub start_paused: bool,
}

impl PlayRequest {
  pub fn options(&self) -> PresentationOptions {
    PresentationOptions {
      geometry: self.geometry.clone().filter(|g| !g.trim().is_empty()),
      custom_width: self.custom_width,
      custom_height: self.custom_height,
      mpv_flags: self.mpv_flags.clone(),
      start_paused: self.start_paused,
    }
  }
}

/// Window dimensions arrive as numbers or numeric strings; blanks and zero
/// mean "not set".
fn dimension<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
  D: Deserializer<'de>,
{
  #[derive(Deserialize)]
  #[serde(untagged)]
  enum Raw {
    Number(u32),
    Text(String),
  }

  let parsed = match Option::<Raw>::deserialize(deserializer)? {
    None => None,
    Some(Raw::Number(n)) => Some(n),
    Some(Raw::Text(s)) if s.trim().is_empty() => None,
    Some(Raw::Text(s)) => Some(s.trim().parse::<u32>().map_err(serde::de::Error::custom)?),
  };
  Ok(parsed.filter(|n| *n > 0))
}

/// Tag for the branch a `play` request took.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
  Launched,
  Synced,
  Rejected,
}

/// Reply frame for one request.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Response {
  pub success: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub message: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub outcome: Option<Outcome>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub appended: Option<usize>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub is_running: Option<bool>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub confirmed: Option<bool>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub request_id: Option<Value>,
}

impl Response {
  pub fn ok(message: impl Into<String>) -> Self {
    Self {
      success: true,
      message: Some(message.into()),
      ..Default::default()
    }
  }

  pub fn error(error: impl Into<String>) -> Self {
    Self {
      success: false,
      error: Some(error.into()),
      ..Default::default()
    }
  }

  pub fn with_request_id(mut self, request_id: Option<Value>) -> Self {
    self.request_id = request_id;
    self
  }
}

impl From<Result<StartOutcome, SessionError>> for Response {
  fn from(result: Result<StartOutcome, SessionError>) -> Self {
    match result {
      Ok(outcome) => {
        let mut response = Response::ok(outcome.message());
        match outcome {
          StartOutcome::Launched { .. } => response.outcome = Some(Outcome::Launched),
          StartOutcome::Synced { appended } => {
            response.outcome = Some(Outcome::Synced);
            response.appended = Some(appended);
          }
        }
        response
      }
      Err(e @ SessionError::OwnershipConflict { .. }) => Response {
        outcome: Some(Outcome::Rejected),
        ..Response::error(e.to_string())
      },
      Err(e) => Response::error(e.to_string()),
    }
  }
}

impl From<CloseOutcome> for Response {
  fn from(outcome: CloseOutcome) -> Self {
    Response::ok(outcome.message())
  }
}

impl From<RunningStatus> for Response {
  fn from(status: RunningStatus) -> Self {
    Response {
      success: true,
      is_running: Some(status.running),
      confirmed: Some(status.confirmed),
      ..Default::default()
    }
  }
}

/// Frames sent without a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action")]
pub enum HostEvent {
  #[serde(rename = "process_exited", rename_all = "camelCase")]
  ProcessExited {
    owner_id: String,
    exit_code: Option<i32>,
  },
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_play_accepts_both_field_spellings() {
    let current = json!({
      "action": "play",
      "playlist": ["a.mp4"],
      "ownerId": "folder1",
      "customWidth": 1280,
      "customHeight": "720",
      "mpvFlags": "--mute",
      "startPaused": true,
    });
    let legacy = json!({
      "action": "play",
      "playlist": ["a.mp4"],
      "folderId": "folder1",
      "custom_width": "1280",
      "custom_height": 720,
      "custom_mpv_flags": "--mute",
      "start_paused": true,
    });
    for value in [current, legacy] {
      let Request::Play(play) = Request::from_value(value).unwrap() else {
        panic!("expected play");
      };
      assert_eq!(play.owner_id.as_deref(), Some("folder1"));
      let options = play.options();
      assert_eq!(options.custom_width, Some(1280));
      assert_eq!(options.custom_height, Some(720));
      assert_eq!(options.mpv_flags.as_deref(), Some("--mute"));
      assert!(options.start_paused);
    }
  }

  #[test]
  fn test_blank_dimensions_are_unset() {
    let value = json!({"action": "play", "playlist": ["a"], "ownerId": "f", "customWidth": "", "customHeight": 0, "geometry": " "});
    let Request::Play(play) = Request::from_value(value).unwrap() else {
      panic!("expected play");
    };
    let options = play.options();
    assert_eq!(options.custom_width, None);
    assert_eq!(options.custom_height, None);
    assert_eq!(options.geometry, None);
  }

  #[test]
  fn test_action_names() {
    assert!(matches!(Request::from_value(json!({"action": "close"})).unwrap(), Request::Close));
    assert!(matches!(Request::from_value(json!({"action": "close_mpv"})).unwrap(), Request::Close));
    assert!(matches!(
      Request::from_value(json!({"action": "is_mpv_running"})).unwrap(),
      Request::IsRunning
    ));
    assert!(matches!(
      Request::from_value(json!({"action": "export_data"})).unwrap(),
      Request::Unknown(action) if action == "export_data"
    ));
    assert!(matches!(
      Request::from_value(json!({"playlist": []})),
      Err(ProtocolError::MissingAction)
    ));
    assert!(matches!(
      Request::from_value(json!({"action": "play", "playlist": "a.mp4"})),
      Err(ProtocolError::InvalidPayload { .. })
    ));
  }

  #[test]
  fn test_request_id_extraction() {
    assert_eq!(request_id(&json!({"request_id": 7})), Some(json!(7)));
    assert_eq!(request_id(&json!({"request_id": "abc"})), Some(json!("abc")));
    assert_eq!(request_id(&json!({"request_id": null})), None);
    assert_eq!(request_id(&json!({})), None);
  }

  #[test]
  fn test_response_shapes() {
    let synced = Response::from(Ok(StartOutcome::Synced { appended: 2 })).with_request_id(Some(json!(5)));
    assert_eq!(
      serde_json::to_value(synced).unwrap(),
      json!({
        "success": true,
        "message": "Added 2 new item(s) to the MPV playlist.",
        "outcome": "synced",
        "appended": 2,
        "request_id": 5,
      })
    );

    let rejected = Response::from(Err(SessionError::OwnershipConflict {
      owner: "folder1".to_string(),
      requested: "folder2".to_string(),
    }));
    let value = serde_json::to_value(rejected).unwrap();
    assert_eq!(value["success"], json!(false));
    assert_eq!(value["outcome"], json!("rejected"));
    assert!(value["error"].as_str().unwrap().contains("folder1"));

    let running = Response::from(RunningStatus {
      running: true,
      confirmed: false,
    });
    assert_eq!(
      serde_json::to_value(running).unwrap(),
      json!({"success": true, "is_running": true, "confirmed": false})
    );
  }

  #[test]
  fn test_exit_event_shape() {
    let event = HostEvent::ProcessExited {
      owner_id: "folder1".to_string(),
      exit_code: Some(0),
    };
    assert_eq!(
      serde_json::to_value(event).unwrap(),
      json!({"action": "process_exited", "ownerId": "folder1", "exitCode": 0})
    );
  }
}
