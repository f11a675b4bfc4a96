//! Signed session tokens describing the outputs of a search.
//!
//! The claim `info` holds one [`NodeSession`] per node that produced
//! results, in the order the nodes were merged. A later show request
//! decodes the token and pages through those outputs.

use crate::config::SessionConfig;
use crate::{Error, Result};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::str::FromStr;

/// Outputs kept by one node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSession {
    /// Node URL; empty for the local node.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub location: String,
    pub matches: u64,
    pub data: Option<String>,
    pub index: Option<String>,
    pub view: Option<String>,
    pub delim: Option<String>,
    pub width: Option<i32>,
}

/// Claims carried by a token.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Session {
    claims: Map<String, Value>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_info(&mut self, info: Vec<Value>) {
        self.claims.insert("info".to_string(), Value::Array(info));
    }

    /// Per-node entries; entries that do not parse are an error.
    pub fn info(&self) -> Result<Vec<NodeSession>> {
        match self.claims.get("info") {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(v) => serde_json::from_value(v.clone())
                .map_err(|e| Error::BadRequest(format!("bad session info: {e}"))),
        }
    }

    pub fn claims(&self) -> &Map<String, Value> {
        &self.claims
    }
}

/// Signs and verifies session tokens.
#[derive(Clone)]
pub struct SessionKeys {
    algorithm: Algorithm,
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKeys")
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

impl SessionKeys {
    pub fn new(cfg: &SessionConfig) -> Result<Self> {
        let algorithm = match Algorithm::from_str(&cfg.algorithm.to_uppercase()) {
            Ok(alg @ (Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512)) => alg,
            _ => {
                return Err(Error::Config(format!(
                    "{:?} is unsupported session algorithm",
                    cfg.algorithm
                )))
            }
        };
        let secret = match &cfg.secret {
            Some(s) if !s.is_empty() => s.as_bytes().to_vec(),
            _ => {
                let mut buf = vec![0u8; 32];
                rand::thread_rng().fill_bytes(&mut buf);
                buf
            }
        };
        Ok(Self {
            algorithm,
            encoding: EncodingKey::from_secret(&secret),
            decoding: DecodingKey::from_secret(&secret),
        })
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn issue(&self, session: &Session) -> Result<String> {
        encode(&Header::new(self.algorithm), &session.claims, &self.encoding)
            .map_err(|e| Error::Internal(format!("failed to sign session: {e}")))
    }

    pub fn parse(&self, token: &str) -> Result<Session> {
        let mut validation = Validation::new(self.algorithm);
        validation.required_spec_claims = HashSet::new();
        validation.validate_exp = false;
        let data = decode::<Map<String, Value>>(token, &self.decoding, &validation)
            .map_err(|e| Error::BadRequest(format!("failed to parse session token: {e}")))?;
        Ok(Session {
            claims: data.claims,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn keys(secret: &str) -> SessionKeys {
        SessionKeys::new(&SessionConfig {
            algorithm: "hs384".into(),
            secret: Some(secret.into()),
        })
        .unwrap()
    }

    #[test]
    fn token_carries_node_info() {
        let keys = keys("s3cr3t");
        let mut session = Session::new();
        session.set_info(vec![
            json!({"matches": 60, "index": "i.txt", "data": "d.bin", "delim": "\n", "width": 3}),
            json!({"location": "http://10.0.0.2:8765", "matches": 40, "index": "j.txt"}),
        ]);
        let token = keys.issue(&session).unwrap();
        let info = keys.parse(&token).unwrap().info().unwrap();

        assert_eq!(info.len(), 2);
        assert_eq!(info[0].matches, 60);
        assert_eq!(info[0].width, Some(3));
        assert_eq!(info[1].location, "http://10.0.0.2:8765");
        assert_eq!(info[1].data, None);
    }

    #[test]
    fn foreign_or_garbage_tokens_are_bad_requests() {
        let token = keys("one").issue(&Session::new()).unwrap();
        assert_eq!(keys("two").parse(&token).unwrap_err().status_code(), 400);
        assert_eq!(keys("one").parse("not-a-token").unwrap_err().status_code(), 400);
    }

    #[test]
    fn unknown_algorithm_is_rejected() {
        let err = SessionKeys::new(&SessionConfig {
            algorithm: "RS256".into(),
            secret: None,
        })
        .unwrap_err();
        assert!(err.to_string().contains("unsupported"));
    }
}
