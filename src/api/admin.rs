//! Cluster members, log levels, user management and `/run`.

use super::error::ApiError;
use super::params::Params;
use super::{ApiState, Caller};
use crate::auth::{AuthProvider, UserInfo};
use crate::Error;
use axum::body::Bytes;
use axum::extract::{RawQuery, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info, warn};

type ApiResult<T> = std::result::Result<T, ApiError>;

fn bad_params(e: Error) -> ApiError {
    ApiError::context("failed to parse request parameters", e)
}

fn forbidden(message: impl Into<String>) -> ApiError {
    ApiError::new(StatusCode::FORBIDDEN, message)
}

fn into_response<T: IntoResponse>(res: ApiResult<T>, what: &str) -> Response {
    match res {
        Ok(r) => r.into_response(),
        Err(e) => {
            warn!(error = %e, "{what} failed");
            e.into_response()
        }
    }
}

pub(super) async fn members(State(state): State<ApiState>) -> Response {
    let res = state
        .dispatcher
        .members()
        .await
        .map(Json)
        .map_err(|e| ApiError::context("failed to get cluster members", e));
    into_response(res, "GET /cluster/members")
}

/// `GET|PUT /logging/level?core=debug&search/mux=info`: set the given
/// levels (admin only) and report all of them.
pub(super) async fn logging_level(
    State(state): State<ApiState>,
    Extension(caller): Extension<Caller>,
    RawQuery(query): RawQuery,
) -> Response {
    let res = (|| {
        let params = Params::parse(query.as_deref());
        let updates: BTreeMap<String, String> = params.pairs().iter().cloned().collect();
        if !updates.is_empty() {
            if !caller.user.is_admin() {
                return Err(forbidden("only admin can change logging levels"));
            }
            state
                .log_levels
                .set_many(&updates)
                .map_err(|e| ApiError::context("failed to set logging levels", e))?;
            info!(user = %caller.user.username, ?updates, "logging levels changed");
        }
        Ok(Json(state.log_levels.get_all()))
    })();
    into_response(res, "/logging/level")
}

fn provider(state: &ApiState) -> ApiResult<&dyn AuthProvider> {
    state
        .auth
        .as_deref()
        .ok_or_else(|| ApiError::bad_request("user management requires an auth provider"))
}

fn parse_user(body: &Bytes) -> ApiResult<UserInfo> {
    if body.is_empty() {
        return Ok(UserInfo::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| ApiError::bad_request("failed to parse request JSON parameters").with_details(e))
}

pub(super) async fn get_users(
    State(state): State<ApiState>,
    Extension(caller): Extension<Caller>,
    RawQuery(query): RawQuery,
) -> Response {
    let res = async {
        let names = Params::parse(query.as_deref()).all("name");
        let me = &caller.user;
        if !me.is_admin() {
            if let Some(other) = names.iter().find(|n| **n != me.username) {
                return Err(forbidden(format!("access to {other:?} denied")));
            }
            return Ok(Json(vec![me.wipe_out()]));
        }
        let auth = provider(&state)?;
        let users = if names.is_empty() {
            auth.get_all_users().await
        } else {
            auth.get_users(&names).await
        };
        users
            .map(Json)
            .map_err(|e| ApiError::context("failed to get users", e))
    }
    .await;
    into_response(res, "GET /user")
}

pub(super) async fn create_user(
    State(state): State<ApiState>,
    Extension(caller): Extension<Caller>,
    body: Bytes,
) -> Response {
    let res = async {
        let user = parse_user(&body)?;
        if user.username.is_empty() {
            return Err(ApiError::bad_request("no username provided"));
        }
        if user.password.is_empty() {
            return Err(ApiError::bad_request("no password provided"));
        }
        if !caller.user.is_admin() {
            return Err(forbidden("only admin can create new users"));
        }
        debug!(user = %user.username, "creating new user");
        provider(&state)?
            .create_new(user)
            .await
            .map(Json)
            .map_err(|e| ApiError::context("failed to create new user", e))
    }
    .await;
    into_response(res, "POST /user")
}

pub(super) async fn update_user(
    State(state): State<ApiState>,
    Extension(caller): Extension<Caller>,
    body: Bytes,
) -> Response {
    let res = async {
        let mut user = parse_user(&body)?;
        if user.username.is_empty() {
            user.username = caller.user.username.clone();
        }
        if !caller.user.is_admin() {
            if user.username != caller.user.username {
                return Err(forbidden(format!("access to {:?} denied", user.username)));
            }
            if !user.roles.is_empty() || !user.home.is_empty() || !user.cluster_tag.is_empty() {
                return Err(forbidden("only password can be changed"));
            }
        }
        debug!(user = %user.username, "updating user");
        provider(&state)?
            .update(user)
            .await
            .map(Json)
            .map_err(|e| ApiError::context("failed to update user", e))
    }
    .await;
    into_response(res, "PUT /user")
}

pub(super) async fn delete_users(
    State(state): State<ApiState>,
    Extension(caller): Extension<Caller>,
    RawQuery(query): RawQuery,
) -> Response {
    let res = async {
        let names = Params::parse(query.as_deref()).all("name");
        if names.is_empty() {
            return Err(ApiError::bad_request("no user names provided"));
        }
        if !caller.user.is_admin() {
            return Err(forbidden("only admin can delete users"));
        }
        info!(users = ?names, "deleting users");
        provider(&state)?
            .delete(&names)
            .await
            .map(Json)
            .map_err(|e| ApiError::context("failed to delete users", e))
    }
    .await;
    into_response(res, "DELETE /user")
}

/// Expand `$NAME` and `${NAME}`; unknown names expand to nothing.
fn expand_vars(arg: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(arg.len());
    let mut chars = arg.char_indices().peekable();
    while let Some((_, c)) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        let mut name = String::new();
        if chars.peek().map(|(_, c)| *c) == Some('{') {
            chars.next();
            for (_, c) in chars.by_ref() {
                if c == '}' {
                    break;
                }
                name.push(c);
            }
        } else {
            while let Some(&(_, c)) = chars.peek() {
                if !(c.is_ascii_alphanumeric() || c == '_') {
                    break;
                }
                name.push(c);
                chars.next();
            }
        }
        if name.is_empty() {
            out.push('$');
        } else if let Some(value) = lookup(&name) {
            out.push_str(&value);
        }
    }
    out
}

#[cfg(unix)]
async fn make_executable(path: &Path) -> std::io::Result<bool> {
    use std::os::unix::fs::PermissionsExt;
    let Ok(meta) = tokio::fs::metadata(path).await else {
        return Ok(false);
    };
    let mut perms = meta.permissions();
    perms.set_mode(perms.mode() | 0o111);
    tokio::fs::set_permissions(path, perms).await?;
    Ok(true)
}

#[cfg(not(unix))]
async fn make_executable(_path: &Path) -> std::io::Result<bool> {
    Ok(false)
}

/// `GET /run?image=&command=&arg=`: run a configured image and return its
/// combined output.
pub(super) async fn run(
    State(state): State<ApiState>,
    Extension(caller): Extension<Caller>,
    RawQuery(query): RawQuery,
) -> Response {
    let res = async {
        let params = Params::parse(query.as_deref());
        let image = params.get("image").unwrap_or("default").to_string();
        let command = params.string("command");
        let extra = params.all("arg");

        let mount = state.mount().to_path_buf();
        let home = state.home_path(&caller.user).map_err(bad_params)?;
        let Some(exec) = state.config.docker_images.get(&image) else {
            return Err(ApiError::bad_request(format!("image {image:?} not found")));
        };
        let user = caller.user.username.clone();
        let mut args: Vec<String> = exec
            .iter()
            .map(|arg| {
                expand_vars(arg, |name| match name {
                    "USER" => Some(user.clone()),
                    "HOME" => Some(home.to_string_lossy().into_owned()),
                    "RYFTHOME" => Some(mount.to_string_lossy().into_owned()),
                    _ => None,
                })
            })
            .collect();

        let script = if command.is_empty() {
            extra.first().cloned().unwrap_or_default()
        } else {
            command.clone()
        };
        if !script.is_empty() {
            let path = home.join(&script);
            match make_executable(&path).await {
                Ok(true) => debug!(path = %path.display(), "added +x permission"),
                Ok(false) => {}
                Err(e) => {
                    return Err(ApiError::new(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "failed to add +x permission",
                    )
                    .with_details(e))
                }
            }
        }

        if !command.is_empty() {
            args.push(command);
        }
        args.extend(extra);
        let Some((program, rest)) = args.split_first().filter(|(p, _)| !p.is_empty()) else {
            return Err(ApiError::bad_request("no any command or argument provided"));
        };
        info!(?args, user = %caller.user.username, "start GET /run");

        let output = tokio::process::Command::new(program)
            .args(rest)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "failed to execute").with_details(e)
            })?;
        if !output.status.success() {
            return Err(
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "failed to execute")
                    .with_details(format!("{}", output.status)),
            );
        }
        let mut combined = output.stdout;
        combined.extend_from_slice(&output.stderr);
        Ok((
            [(header::CONTENT_TYPE, "application/octet-stream")],
            combined,
        ))
    }
    .await;
    into_response(res, "GET /run")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vars_are_expanded() {
        let lookup = |name: &str| match name {
            "USER" => Some("bob".to_string()),
            "HOME" => Some("/mnt/bob".to_string()),
            _ => None,
        };
        assert_eq!(expand_vars("-v=$HOME:/data", lookup), "-v=/mnt/bob:/data");
        assert_eq!(expand_vars("${USER}-x", lookup), "bob-x");
        assert_eq!(expand_vars("$UNKNOWN/a", lookup), "/a");
        assert_eq!(expand_vars("cost $", lookup), "cost $");
    }

    #[test]
    fn empty_user_body_is_default() {
        assert_eq!(parse_user(&Bytes::new()).unwrap(), UserInfo::default());
        let u = parse_user(&Bytes::from_static(br#"{"username":"a","password":"p"}"#)).unwrap();
        assert_eq!(u.username, "a");
        assert!(parse_user(&Bytes::from_static(b"nope")).is_err());
    }
}
