//! Archive API wire types.
//!
//! Every endpoint wraps its payload in an [`Envelope`]. Records are parsed
//! leniently: only the fields the gateway uses are typed, and unknown fields
//! are ignored.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{GalcacheError, Result};

/// Accurate title search.
pub const SEARCH_GAME_PATH: &str = "/open/archive/search-game";

/// Archive record by id.
pub const ARCHIVE_PATH: &str = "/open/archive";

/// Query parameter of [`ARCHIVE_PATH`] selecting a game.
pub const GAME_PARAM: &str = "gid";

/// Query parameter of [`ARCHIVE_PATH`] selecting an organisation.
pub const ORG_PARAM: &str = "orgId";

/// Envelope code for success.
pub const CODE_OK: i64 = 0;

/// Envelope code for "no such record".
pub const CODE_NOT_FOUND: i64 = 614;

/// Status reported for envelope failures that are not "not found".
const ENVELOPE_FAILURE_STATUS: u16 = 502;

/// Response wrapper shared by every archive endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub success: Option<bool>,
    pub code: i64,
    #[serde(default, alias = "message")]
    pub msg: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
}

impl Envelope {
    pub fn parse(body: Value) -> Result<Self> {
        serde_json::from_value(body).map_err(|e| GalcacheError::Malformed(format!("envelope: {e}")))
    }

    /// Unwrap the payload. `what` names the lookup in error messages.
    pub fn into_data(self, what: &str) -> Result<Value> {
        match self.code {
            CODE_OK => Ok(self.data.unwrap_or(Value::Null)),
            CODE_NOT_FOUND => Err(GalcacheError::NotFound(what.to_string())),
            code => Err(GalcacheError::Server {
                status: ENVELOPE_FAILURE_STATUS,
                message: format!(
                    "archive code {code}: {}",
                    self.msg.as_deref().unwrap_or("no message")
                ),
            }),
        }
    }
}

/// The fields of a game record the gateway relies on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameSummary {
    /// Set by the accurate search and archive endpoints.
    #[serde(default)]
    pub gid: Option<u64>,
    /// Set by the list search endpoint.
    #[serde(default)]
    pub id: Option<u64>,
    pub name: String,
    #[serde(default)]
    pub chinese_name: Option<String>,
    #[serde(default)]
    pub main_img: Option<String>,
    #[serde(default)]
    pub release_date: Option<String>,
    /// Organisation id of the developer, for [`ORG_PARAM`] lookups.
    #[serde(default)]
    pub developer_id: Option<u64>,
}

impl GameSummary {
    pub fn game_id(&self) -> Option<u64> {
        self.gid.or(self.id)
    }

    /// Display title: the Chinese name when present, else the original.
    pub fn title(&self) -> &str {
        self.chinese_name
            .as_deref()
            .filter(|name| !name.is_empty())
            .unwrap_or(&self.name)
    }

    /// Every distinct non-empty title this game is known by.
    pub fn titles(&self) -> Vec<&str> {
        let mut titles = vec![self.name.as_str()];
        if let Some(chinese) = self.chinese_name.as_deref() {
            if !chinese.is_empty() && chinese != self.name {
                titles.push(chinese);
            }
        }
        titles
    }
}

/// A developer (organisation) record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrgSummary {
    #[serde(default)]
    pub org_id: Option<u64>,
    pub name: String,
    #[serde(default)]
    pub chinese_name: Option<String>,
    #[serde(default)]
    pub introduction: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
}

impl OrgSummary {
    /// Display name: the Chinese name when present, else the original.
    pub fn title(&self) -> &str {
        self.chinese_name
            .as_deref()
            .filter(|name| !name.is_empty())
            .unwrap_or(&self.name)
    }
}

/// `data.game` of an accurate search or archive lookup.
pub fn game_from_data(data: &Value) -> Result<GameSummary> {
    let game = data
        .get("game")
        .ok_or_else(|| GalcacheError::Malformed("missing data.game".into()))?;
    serde_json::from_value(game.clone())
        .map_err(|e| GalcacheError::Malformed(format!("data.game: {e}")))
}

/// `data.org` of an organisation lookup.
pub fn org_from_data(data: &Value) -> Result<OrgSummary> {
    let org = data
        .get("org")
        .ok_or_else(|| GalcacheError::Malformed("missing data.org".into()))?;
    serde_json::from_value(org.clone())
        .map_err(|e| GalcacheError::Malformed(format!("data.org: {e}")))
}

/// `data.result` of a list search. Entries that do not parse are skipped.
pub fn games_from_list(data: &Value) -> Vec<GameSummary> {
    data.get("result")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| serde_json::from_value(item.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}
