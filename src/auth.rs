//! Caller authentication and user management.

use crate::{Error, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const ADMIN_ROLE: &str = "admin";

/// User credentials and related settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct UserInfo {
    pub username: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub password: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub home: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub cluster_tag: String,
}

impl UserInfo {
    /// Caller used when authentication is disabled.
    pub fn anonymous() -> Self {
        Self {
            username: String::new(),
            roles: vec![ADMIN_ROLE.to_string()],
            ..Default::default()
        }
    }

    /// Copy without the password.
    pub fn wipe_out(&self) -> Self {
        Self {
            password: String::new(),
            ..self.clone()
        }
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    pub fn is_admin(&self) -> bool {
        self.has_role(ADMIN_ROLE)
    }
}

/// User store.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// The user when the password matches.
    async fn verify(&self, username: &str, password: &str) -> Option<UserInfo>;
    async fn get_all_users(&self) -> Result<Vec<UserInfo>>;
    async fn get_users(&self, names: &[String]) -> Result<Vec<UserInfo>>;
    async fn create_new(&self, user: UserInfo) -> Result<UserInfo>;
    /// Replace the non-empty fields of an existing user.
    async fn update(&self, user: UserInfo) -> Result<UserInfo>;
    async fn delete(&self, names: &[String]) -> Result<Vec<UserInfo>>;
}

/// Users kept in a YAML or JSON file, chosen by extension.
pub struct FileAuth {
    path: PathBuf,
    users: RwLock<BTreeMap<String, UserInfo>>,
}

impl FileAuth {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let data = std::fs::read(&path).map_err(|e| {
            Error::Config(format!("failed to read users file {}: {e}", path.display()))
        })?;
        let list: Vec<UserInfo> = match extension(&path).as_str() {
            "json" => serde_json::from_slice(&data)?,
            "yaml" | "yml" => serde_yaml::from_slice(&data)?,
            ext => {
                return Err(Error::Config(format!(
                    "{ext:?} is unknown users file extension"
                )))
            }
        };
        let mut users = BTreeMap::new();
        for user in list {
            if users.contains_key(&user.username) {
                return Err(Error::Config(format!(
                    "{:?} user is duplicated",
                    user.username
                )));
            }
            users.insert(user.username.clone(), user);
        }
        info!(path = %path.display(), users = users.len(), "users loaded");
        Ok(Self {
            path,
            users: RwLock::new(users),
        })
    }

    async fn save(&self) -> Result<()> {
        let list: Vec<UserInfo> = self.users.read().values().cloned().collect();
        let data = match extension(&self.path).as_str() {
            "json" => serde_json::to_vec_pretty(&list)?,
            _ => serde_yaml::to_string(&list)?.into_bytes(),
        };
        tokio::fs::write(&self.path, data).await?;
        debug!(path = %self.path.display(), "users saved");
        Ok(())
    }
}

fn extension(path: &Path) -> String {
    path.extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

#[async_trait]
impl AuthProvider for FileAuth {
    async fn verify(&self, username: &str, password: &str) -> Option<UserInfo> {
        let users = self.users.read();
        users
            .get(username)
            .filter(|u| u.password == password)
            .cloned()
    }

    async fn get_all_users(&self) -> Result<Vec<UserInfo>> {
        Ok(self.users.read().values().map(UserInfo::wipe_out).collect())
    }

    async fn get_users(&self, names: &[String]) -> Result<Vec<UserInfo>> {
        let users = self.users.read();
        names
            .iter()
            .map(|name| {
                users
                    .get(name)
                    .map(UserInfo::wipe_out)
                    .ok_or_else(|| Error::NotFound(format!("no {name:?} user found")))
            })
            .collect()
    }

    async fn create_new(&self, user: UserInfo) -> Result<UserInfo> {
        if user.username.is_empty() {
            return Err(Error::BadRequest("no username provided".to_string()));
        }
        {
            let mut users = self.users.write();
            if users.contains_key(&user.username) {
                return Err(Error::Conflict(format!(
                    "{:?} user already exists",
                    user.username
                )));
            }
            users.insert(user.username.clone(), user.clone());
        }
        self.save().await?;
        Ok(user.wipe_out())
    }

    async fn update(&self, user: UserInfo) -> Result<UserInfo> {
        let updated = {
            let mut users = self.users.write();
            let Some(old) = users.get_mut(&user.username) else {
                return Err(Error::NotFound(format!(
                    "no {:?} user found",
                    user.username
                )));
            };
            if !user.password.is_empty() {
                old.password = user.password;
            }
            if !user.roles.is_empty() {
                old.roles = user.roles;
            }
            if !user.home.is_empty() {
                old.home = user.home;
            }
            if !user.cluster_tag.is_empty() {
                old.cluster_tag = user.cluster_tag;
            }
            old.wipe_out()
        };
        self.save().await?;
        Ok(updated)
    }

    async fn delete(&self, names: &[String]) -> Result<Vec<UserInfo>> {
        let removed: Vec<UserInfo> = {
            let mut users = self.users.write();
            names
                .iter()
                .filter_map(|n| users.remove(n))
                .map(|u| u.wipe_out())
                .collect()
        };
        self.save().await?;
        Ok(removed)
    }
}

/// `Basic <base64(user:pass)>` credentials.
pub fn parse_basic(header: &str) -> Option<(String, String)> {
    let encoded = header.strip_prefix("Basic ")?.trim();
    let decoded = BASE64.decode(encoded).ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (user, pass) = text.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

/// Resolve the caller from an `Authorization` header.
pub async fn authenticate(
    provider: Option<&dyn AuthProvider>,
    header: Option<&str>,
) -> Result<UserInfo> {
    let Some(provider) = provider else {
        return Ok(UserInfo::anonymous());
    };
    let (user, pass) = header
        .and_then(parse_basic)
        .ok_or_else(|| Error::Unauthorized("authorization required".to_string()))?;
    provider
        .verify(&user, &pass)
        .await
        .ok_or_else(|| Error::Unauthorized("invalid username or password".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn users_file(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("users.yaml");
        std::fs::write(
            &path,
            "- username: admin\n  password: admin\n  roles: [admin]\n- username: test\n  password: test\n  roles: [user]\n  home: /test\n",
        )
        .unwrap();
        path
    }

    #[tokio::test]
    async fn verify_and_manage_users() {
        let dir = TempDir::new().unwrap();
        let auth = FileAuth::open(users_file(&dir)).unwrap();

        let admin = auth.verify("admin", "admin").await.unwrap();
        assert!(admin.is_admin());
        assert!(auth.verify("admin", "nope").await.is_none());

        let all = auth.get_all_users().await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(|u| u.password.is_empty()));

        let dup = auth
            .create_new(UserInfo {
                username: "test".into(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(dup.status_code(), 409);

        auth.create_new(UserInfo {
            username: "foo".into(),
            password: "bar".into(),
            home: "/foo".into(),
            ..Default::default()
        })
        .await
        .unwrap();
        auth.update(UserInfo {
            username: "foo".into(),
            password: "baz".into(),
            ..Default::default()
        })
        .await
        .unwrap();

        // reloading sees the saved file
        let reloaded = FileAuth::open(dir.path().join("users.yaml")).unwrap();
        let foo = reloaded.verify("foo", "baz").await.unwrap();
        assert_eq!(foo.home, "/foo");

        let removed = reloaded.delete(&["foo".into(), "ghost".into()]).await.unwrap();
        assert_eq!(removed.len(), 1);
        assert!(reloaded.get_users(&["foo".into()]).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn basic_header_resolves_caller() {
        let dir = TempDir::new().unwrap();
        let auth = FileAuth::open(users_file(&dir)).unwrap();
        let header = format!("Basic {}", BASE64.encode("test:test"));

        let user = authenticate(Some(&auth), Some(&header)).await.unwrap();
        assert_eq!(user.home, "/test");
        assert_eq!(
            authenticate(Some(&auth), None).await.unwrap_err().status_code(),
            401
        );
        assert!(authenticate(None, None).await.unwrap().is_admin());
    }
}
