use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Identity bound to one request or realtime connection.
///
/// `claims` are derived by the server (username, provider, admin flag). `context`
/// comes from the client's `Canopy-Context` header and is never used for identity.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AuthContext {
    pub uid: Option<String>,
    #[serde(default)]
    pub claims: Map<String, Value>,
    #[serde(default)]
    pub context: Map<String, Value>,
}

impl AuthContext {
    pub fn anonymous() -> Self { Self::default() }

    pub fn for_uid(uid: &str, claims: Map<String, Value>) -> Self {
        AuthContext { uid: Some(uid.to_string()), claims, context: Map::new() }
    }

    pub fn with_context(mut self, context: Map<String, Value>) -> Self {
        self.context = context;
        self
    }

    pub fn is_anonymous(&self) -> bool { self.uid.is_none() }

    pub fn is_admin(&self) -> bool {
        self.uid.is_some() && self.claims.get("admin").and_then(|v| v.as_bool()).unwrap_or(false)
    }

    /// The value bound to `auth` in rule expressions: `null`, or `{uid, ...claims}`.
    pub fn to_rule_value(&self) -> Value {
        let Some(uid) = self.uid.as_ref() else { return Value::Null; };
        let mut obj = self.claims.clone();
        obj.insert("uid".into(), Value::String(uid.clone()));
        Value::Object(obj)
    }
}
