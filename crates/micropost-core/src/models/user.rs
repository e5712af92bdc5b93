use serde::{Deserialize, Deserializer, Serialize};

/// Identity of the signed-in user as reported by the server.
///
/// Replaced wholesale on login and session checks. Screens that adjust
/// follow counts optimistically keep their own copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
pub struct UserProfile {
    #[serde(deserialize_with = "id_from_string_or_number")]
    pub id: String,
    pub name: String,
    pub email: String,
    /// Gravatar reference used to build the avatar URL
    #[serde(default, alias = "gravatar_hash", skip_serializing_if = "Option::is_none")]
    pub gravatar_id: Option<String>,
    #[serde(default)]
    pub admin: bool,
    #[serde(default)]
    pub activated: bool,
}

impl UserProfile {
    /// Avatar URL at the requested pixel size, if the server sent a reference.
    pub fn avatar_url(&self, size: u32) -> Option<String> {
        self.gravatar_id
            .as_ref()
            .map(|id| format!("https://secure.gravatar.com/avatar/{}?s={}", id, size))
    }
}

// Rails serialises ids as numbers, some endpoints as strings.
fn id_from_string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Text(String),
        Number(i64),
    }

    Ok(match RawId::deserialize(deserializer)? {
        RawId::Text(s) => s,
        RawId::Number(n) => n.to_string(),
    })
}
