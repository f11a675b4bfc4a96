//! `/files` and `/rename`.
//!
//! Uploads are replicated to every node carrying a matching partition tag.
//! Deletes and renames go to all nodes. Listings go through the search
//! engine so a cluster listing is the union of every node's listing.

use super::error::ApiError;
use super::params::{unescape_delimiter, Params};
use super::{ApiState, Caller};
use crate::catalog::is_catalog;
use crate::cluster::ClusterNode;
use crate::files::{
    self, check_relative_to_home, create_file, update_catalog, CatalogUpload, FileUpload, ShareMode,
    Written,
};
use crate::jobs::{DELETE_CATALOG, DELETE_FILE};
use crate::{Error, Result};
use axum::body::{Body, Bytes};
use axum::extract::{FromRequest, Multipart, RawQuery, Request, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use futures::future::join_all;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

type ApiResult<T> = std::result::Result<T, ApiError>;

fn bad_params(e: Error) -> ApiError {
    ApiError::context("failed to parse request parameters", e)
}

fn join_rel(dir: &str, name: &str) -> String {
    match (dir.trim_matches('/'), name) {
        ("", name) => name.to_string(),
        (dir, "") => dir.to_string(),
        (dir, name) => format!("{dir}/{name}"),
    }
}

fn stat_error(rel: &str, e: std::io::Error) -> ApiError {
    match e.kind() {
        std::io::ErrorKind::NotFound => {
            ApiError::new(StatusCode::NOT_FOUND, format!("{rel:?} not found")).with_details(e)
        }
        std::io::ErrorKind::PermissionDenied => {
            ApiError::new(StatusCode::FORBIDDEN, format!("{rel:?} access denied")).with_details(e)
        }
        _ => ApiError::from(Error::Io(e)),
    }
}

fn octet_stream(content: Vec<u8>) -> Response {
    (
        [(header::CONTENT_TYPE, "application/octet-stream")],
        content,
    )
        .into_response()
}

/// Nodes to fan a request out to, `None` when it stays on this node.
async fn cluster_nodes(state: &ApiState, local: bool) -> Option<Vec<ClusterNode>> {
    if local || state.dispatcher.is_local_only() {
        return None;
    }
    match state.dispatcher.arranged_nodes().await {
        Ok(nodes) if !nodes.is_empty() => Some(nodes),
        Ok(_) => None,
        Err(e) => {
            warn!(error = %e, "failed to get cluster info, serving locally");
            None
        }
    }
}

/// Query of a request forwarded to another node: same pairs with `local=true`.
fn forwarded_query(params: &Params) -> Vec<(String, String)> {
    let mut pairs: Vec<(String, String)> = params
        .pairs()
        .iter()
        .filter(|(k, _)| k != "local")
        .cloned()
        .collect();
    pairs.push(("local".to_string(), "true".to_string()));
    pairs
}

async fn forward(
    state: &ApiState,
    caller: &Caller,
    method: Method,
    node: &ClusterNode,
    path: &str,
    query: &[(String, String)],
    body: Option<Bytes>,
) -> Result<Value> {
    let url = format!("{}{path}", node.url.trim_end_matches('/'));
    let mut req = state.client.request(method, &url).query(query);
    if let Some(auth) = caller.auth() {
        req = req.header(header::AUTHORIZATION, auth);
    }
    if let Some(body) = body {
        req = req
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .body(body);
    }
    let resp = req.send().await?;
    let status = resp.status();
    let body: Value = resp.json().await?;
    if status.is_server_error() {
        let message = body
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("request failed");
        return Err(Error::Engine(message.to_string()));
    }
    Ok(body)
}

/// Fold one node's `{path: status}` map into the combined result. An error
/// on any node wins over `"OK"` and is prefixed with the node name.
fn merge_statuses(
    into: &mut BTreeMap<String, String>,
    node: &str,
    statuses: BTreeMap<String, String>,
) {
    for (path, status) in statuses {
        let status = if status == "OK" {
            status
        } else {
            format!("[{node}]: {status}")
        };
        match into.get(&path) {
            Some(existing) if existing != "OK" => {}
            _ => {
                into.insert(path, status);
            }
        }
    }
}

// GET /files

pub(super) async fn get_files(
    State(state): State<ApiState>,
    Extension(caller): Extension<Caller>,
    RawQuery(query): RawQuery,
) -> Response {
    match read_files(state, caller, query).await {
        Ok(resp) => resp,
        Err(e) => {
            warn!(error = %e, "GET /files failed");
            e.into_response()
        }
    }
}

async fn read_files(state: ApiState, caller: Caller, query: Option<String>) -> ApiResult<Response> {
    let params = Params::parse(query.as_deref());
    let dir = params.string("dir");
    let catalog = params.string("catalog");
    let file = params.string("file");
    let hidden = params.flag("hidden", false).map_err(bad_params)?;
    let local = params.flag("local", false).map_err(bad_params)?;

    let home = state.home_of(&caller.user).to_string();
    let home_path = state.home_path(&caller.user)?;
    let rel = if catalog.is_empty() {
        join_rel(&dir, &file)
    } else {
        join_rel(&dir, &catalog)
    };
    let full = check_relative_to_home(&home_path, &rel)?;
    debug!(user = %caller.user.username, path = %rel, "GET /files");

    let meta = tokio::fs::metadata(&full)
        .await
        .map_err(|e| stat_error(&rel, e))?;

    if !meta.is_dir() && !is_catalog(&full) {
        let content = tokio::fs::read(&full).await.map_err(|e| stat_error(&rel, e))?;
        return Ok(octet_stream(content));
    }

    if !catalog.is_empty() && !file.is_empty() {
        let content = read_catalog_file(&state, full, file).await?;
        return Ok(octet_stream(content));
    }

    let engine = state
        .dispatcher
        .build_engine(local, &[], caller.auth(), &home, &caller.user.cluster_tag)
        .await?;
    let info = engine.files(&rel, hidden).await?;
    Ok(Json(info).into_response())
}

async fn read_catalog_file(state: &ApiState, full: PathBuf, name: String) -> ApiResult<Vec<u8>> {
    let catalogs = state.catalogs.clone();
    let content = tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
        let cat = catalogs.open_read_only(&full)?;
        let mut view = cat.get_file(&name)?;
        if view.is_empty() {
            return Err(Error::NotFound(format!("{name:?} not found in catalog")));
        }
        let mut buf = Vec::with_capacity(view.len() as usize);
        view.read_to_end(&mut buf)?;
        Ok(buf)
    })
    .await
    .map_err(|e| Error::Internal(format!("catalog task failed: {e}")))??;
    Ok(content)
}

// POST /files

struct UploadParams {
    file: String,
    catalog: String,
    offset: Option<u64>,
    length: Option<u64>,
    delimiter: Option<String>,
    lifetime: Option<Duration>,
    share_mode: ShareMode,
    local: bool,
}

impl UploadParams {
    fn bind(p: &Params) -> Result<Self> {
        let file = p.string("file");
        if file.is_empty() {
            return Err(Error::BadRequest("missing \"file\" parameter".to_string()));
        }
        let delimiter = match p.get("delimiter") {
            Some(d) => Some(unescape_delimiter(d)?),
            None => None,
        };
        Ok(Self {
            file,
            catalog: p.string("catalog"),
            offset: p.number("offset")?,
            length: p.number("length")?,
            delimiter,
            lifetime: p.duration("lifetime")?,
            share_mode: ShareMode::parse(&p.string("share-mode"))?,
            local: p.flag("local", false)?,
        })
    }

    fn target(&self) -> &str {
        if self.catalog.is_empty() {
            &self.file
        } else {
            &self.catalog
        }
    }
}

pub(super) async fn post_files(
    State(state): State<ApiState>,
    Extension(caller): Extension<Caller>,
    RawQuery(query): RawQuery,
    req: Request<Body>,
) -> Response {
    match upload(state, caller, query, req).await {
        Ok(resp) => resp,
        Err(e) => {
            warn!(error = %e, "POST /files failed");
            e.into_response()
        }
    }
}

async fn read_body(state: &ApiState, headers: &HeaderMap, req: Request<Body>) -> ApiResult<Bytes> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_ascii_lowercase();

    if content_type.starts_with("multipart/form-data") {
        let mut form = Multipart::from_request(req, state)
            .await
            .map_err(|e| ApiError::bad_request("failed to parse multipart form").with_details(e))?;
        while let Some(field) = form
            .next_field()
            .await
            .map_err(|e| ApiError::bad_request("failed to read multipart form").with_details(e))?
        {
            if field.name() == Some("file") {
                return field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::bad_request("failed to read file content").with_details(e));
            }
        }
        return Err(ApiError::bad_request("no \"file\" form field found"));
    }

    if content_type.starts_with("application/octet-stream") {
        return axum::body::to_bytes(req.into_body(), usize::MAX)
            .await
            .map_err(|e| ApiError::bad_request("failed to read request body").with_details(e));
    }

    Err(ApiError::bad_request(format!(
        "unexpected content type: {content_type:?}"
    )))
}

async fn upload(
    state: ApiState,
    caller: Caller,
    query: Option<String>,
    req: Request<Body>,
) -> ApiResult<Response> {
    let params = Params::parse(query.as_deref());
    let upload = UploadParams::bind(&params).map_err(bad_params)?;
    let home_path = state.home_path(&caller.user)?;
    check_relative_to_home(&home_path, upload.target())?;

    let headers = req.headers().clone();
    let mut content = read_body(&state, &headers, req).await?;
    if let Some(length) = upload.length {
        if (content.len() as u64) < length {
            return Ok(upload_error(
                &upload,
                &Error::BadRequest(format!(
                    "not enough data: expected {length} bytes, got {}",
                    content.len()
                )),
            ));
        }
        content.truncate(length as usize);
    }

    let Some(nodes) = cluster_nodes(&state, upload.local).await else {
        return Ok(match write_local(&state, &home_path, &upload, &content).await {
            Ok(body) => Json(body).into_response(),
            Err(e) => upload_error(&upload, &e),
        });
    };

    let routed = state
        .dispatcher
        .route_files(&[upload.target().to_string()], &caller.user.cluster_tag)
        .await?;
    let wanted: Vec<&ClusterNode> = nodes
        .iter()
        .filter(|n| routed.iter().any(|(r, _)| r.instance == n.instance))
        .collect();
    if wanted.is_empty() {
        return Err(ApiError::from(Error::Engine(format!(
            "routing-incomplete: no node accepts {:?}",
            upload.target()
        ))));
    }
    info!(nodes = wanted.len(), target = %upload.target(), "replicate upload");

    let query = forwarded_query(&params);
    let calls = wanted.iter().map(|node| {
        let state = &state;
        let caller = &caller;
        let query = &query;
        let home_path = &home_path;
        let upload = &upload;
        let content = content.clone();
        async move {
            let res = if node.is_local {
                write_local(state, home_path, upload, &content).await
            } else {
                forward(state, caller, Method::POST, node, "/files", query, Some(content)).await
            };
            let res = res.unwrap_or_else(|e| json!({"error": e.to_string()}));
            (node.instance.node.clone(), res)
        }
    });
    let results = join_all(calls).await;
    Ok(Json(merge_uploads(&upload, results)).into_response())
}

/// Combine per-node upload results: `details` per node, the smallest
/// length and the path when every node agrees on it.
fn merge_uploads(upload: &UploadParams, results: Vec<(String, Value)>) -> Value {
    let key = if upload.catalog.is_empty() {
        "path"
    } else {
        "catalog"
    };
    let mut details = Map::new();
    let mut length: Option<u64> = None;
    let mut paths = Vec::new();
    for (node, res) in results {
        if res.get("error").is_none() {
            if let Some(len) = res.get("length").and_then(Value::as_u64) {
                length = Some(length.map_or(len, |l| l.min(len)));
            }
            if let Some(path) = res.get(key).and_then(Value::as_str) {
                if !paths.iter().any(|p| p == path) {
                    paths.push(path.to_string());
                }
            }
        }
        details.insert(node, res);
    }

    let mut out = Map::new();
    out.insert("details".to_string(), Value::Object(details));
    out.insert("length".to_string(), json!(length.unwrap_or(0)));
    if let [path] = paths.as_slice() {
        out.insert(key.to_string(), json!(path));
    }
    Value::Object(out)
}

fn upload_error(upload: &UploadParams, e: &Error) -> Response {
    let mut body = json!({"error": e.to_string(), "length": upload.length.unwrap_or(0)});
    if let Some(offset) = upload.offset {
        body["offset"] = json!(offset);
    }
    (StatusCode::BAD_REQUEST, Json(body)).into_response()
}

async fn write_local(
    state: &ApiState,
    home_path: &Path,
    upload: &UploadParams,
    content: &[u8],
) -> Result<Value> {
    if upload.catalog.is_empty() {
        let written = create_file(
            home_path,
            &FileUpload {
                file: upload.file.clone(),
                offset: upload.offset,
                share_mode: upload.share_mode,
            },
            content,
            &state.writers,
            &state.locks,
        )
        .await?;
        schedule_delete(state, upload, DELETE_FILE, home_path, &written);
        Ok(json!({
            "path": written.path,
            "length": written.length,
            "offset": written.offset,
        }))
    } else {
        let delimiter = upload
            .delimiter
            .clone()
            .or_else(|| Some(state.config.catalogs.default_data_delim.clone()))
            .filter(|d| !d.is_empty());
        let written = update_catalog(
            home_path,
            &CatalogUpload {
                catalog: upload.catalog.clone(),
                file: upload.file.clone(),
                offset: upload.offset,
                delimiter,
                share_mode: upload.share_mode,
            },
            content,
            &state.catalogs,
            &state.locks,
        )
        .await?;
        schedule_delete(state, upload, DELETE_CATALOG, home_path, &written);
        Ok(json!({
            "catalog": written.path,
            "file": upload.file,
            "length": written.length,
            "offset": written.offset,
        }))
    }
}

fn schedule_delete(state: &ApiState, upload: &UploadParams, cmd: &str, home: &Path, written: &Written) {
    let Some(lifetime) = upload.lifetime else {
        return;
    };
    let path = home.join(&written.path);
    if let Err(e) = state.jobs.delete_after(cmd, &path, lifetime) {
        warn!(error = %e, path = %path.display(), "failed to schedule delete");
    }
}

// DELETE /files

pub(super) async fn delete_files(
    State(state): State<ApiState>,
    Extension(caller): Extension<Caller>,
    RawQuery(query): RawQuery,
) -> Response {
    match delete(state, caller, query).await {
        Ok(resp) => resp,
        Err(e) => {
            warn!(error = %e, "DELETE /files failed");
            e.into_response()
        }
    }
}

async fn delete(state: ApiState, caller: Caller, query: Option<String>) -> ApiResult<Response> {
    let params = Params::parse(query.as_deref());
    let local = params.flag("local", false).map_err(bad_params)?;
    let items: Vec<String> = ["file", "dir", "catalog"]
        .iter()
        .flat_map(|k| params.all(k))
        .filter(|s| !s.is_empty())
        .collect();
    if items.is_empty() {
        return Err(ApiError::bad_request("no file, dir or catalog to delete"));
    }
    let home_path = state.home_path(&caller.user)?;
    info!(user = %caller.user.username, ?items, "DELETE /files");

    let Some(nodes) = cluster_nodes(&state, local).await else {
        let res = files::delete_all(&home_path, &items, Some(&state.catalogs)).await;
        return Ok(Json(res).into_response());
    };

    let query = forwarded_query(&params);
    let calls = nodes.iter().map(|node| {
        let (state, caller, query, home_path, items) = (&state, &caller, &query, &home_path, &items);
        async move {
            let res = if node.is_local {
                Ok(files::delete_all(home_path, items, Some(&state.catalogs)).await)
            } else {
                forward(state, caller, Method::DELETE, node, "/files", query, None)
                    .await
                    .and_then(|v| Ok(serde_json::from_value(v)?))
            };
            (node.instance.node.clone(), res)
        }
    });
    Ok(Json(fold_statuses(join_all(calls).await)).into_response())
}

fn fold_statuses(results: Vec<(String, Result<BTreeMap<String, String>>)>) -> BTreeMap<String, String> {
    let mut combined = BTreeMap::new();
    for (node, res) in results {
        match res {
            Ok(statuses) => merge_statuses(&mut combined, &node, statuses),
            Err(e) => {
                warn!(node = %node, error = %e, "remote node failed");
                combined.insert(format!("[{node}]"), e.to_string());
            }
        }
    }
    combined
}

// PUT /rename

#[derive(Debug, Clone)]
enum Rename {
    /// A virtual file (or a `dir/` prefix) inside a catalog.
    CatalogPart { catalog: String, file: String },
    Catalog(String),
    Dir(String),
    File(String),
}

impl Rename {
    fn bind(p: &Params) -> Result<(Self, String)> {
        let new = p.string("new");
        if new.is_empty() {
            return Err(Error::BadRequest("missing \"new\" parameter".to_string()));
        }
        let catalog = p.string("catalog");
        let file = p.string("file");
        let dir = p.string("dir");
        let what = match (catalog.is_empty(), file.is_empty(), dir.is_empty()) {
            (false, false, _) => Self::CatalogPart { catalog, file },
            (false, true, _) => Self::Catalog(join_rel(&dir, &catalog)),
            (true, false, _) => Self::File(join_rel(&dir, &file)),
            (true, true, false) => Self::Dir(dir),
            (true, true, true) => {
                return Err(Error::BadRequest(
                    "missing \"file\", \"dir\" or \"catalog\" parameter".to_string(),
                ))
            }
        };
        Ok((what, new))
    }

    fn old_name(&self) -> &str {
        match self {
            Self::CatalogPart { file, .. } => file,
            Self::Catalog(p) | Self::Dir(p) | Self::File(p) => p,
        }
    }
}

pub(super) async fn rename(
    State(state): State<ApiState>,
    Extension(caller): Extension<Caller>,
    RawQuery(query): RawQuery,
) -> Response {
    match start_rename(state, caller, query).await {
        Ok(resp) => resp,
        Err(e) => {
            warn!(error = %e, "PUT /rename failed");
            e.into_response()
        }
    }
}

async fn start_rename(state: ApiState, caller: Caller, query: Option<String>) -> ApiResult<Response> {
    let params = Params::parse(query.as_deref());
    let local = params.flag("local", false).map_err(bad_params)?;
    let (what, new) = Rename::bind(&params).map_err(bad_params)?;
    let home_path = state.home_path(&caller.user)?;
    info!(user = %caller.user.username, ?what, new = %new, "PUT /rename");

    let Some(nodes) = cluster_nodes(&state, local).await else {
        rename_local(&state, &home_path, &what, &new).await?;
        let res = BTreeMap::from([(what.old_name().to_string(), "OK".to_string())]);
        return Ok(Json(res).into_response());
    };

    let query = forwarded_query(&params);
    let calls = nodes.iter().map(|node| {
        let (state, caller, query, home_path, what, new) =
            (&state, &caller, &query, &home_path, &what, &new);
        async move {
            let res = if node.is_local {
                rename_local(state, home_path, what, new)
                    .await
                    .map(|()| BTreeMap::from([(what.old_name().to_string(), "OK".to_string())]))
            } else {
                forward(state, caller, Method::PUT, node, "/rename", query, None)
                    .await
                    .and_then(|v| {
                        if let Some(message) = v.get("message").and_then(Value::as_str) {
                            return Err(Error::BadRequest(message.to_string()));
                        }
                        Ok(serde_json::from_value(v)?)
                    })
            };
            (node.instance.node.clone(), res)
        }
    });
    Ok(Json(fold_statuses(join_all(calls).await)).into_response())
}

async fn rename_local(state: &ApiState, home: &Path, what: &Rename, new: &str) -> Result<()> {
    match what {
        Rename::File(old) => files::rename_file(home, old, new).await,
        Rename::Dir(old) => files::rename_dir(home, old, new, Some(&state.catalogs)).await,
        Rename::Catalog(old) => {
            if Path::new(old).extension() != Path::new(new).extension() {
                return Err(Error::BadRequest(
                    "changing catalog extention is not allowed".to_string(),
                ));
            }
            let from = check_relative_to_home(home, old)?;
            let to = check_relative_to_home(home, new)?;
            if !is_catalog(&from) {
                return Err(Error::NotFound(format!("{old:?} not found")));
            }
            if let Some(parent) = to.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let catalogs = state.catalogs.clone();
            tokio::task::spawn_blocking(move || -> Result<()> {
                let cat = catalogs.open(&from)?;
                cat.rename_and_close(&to)?;
                drop(cat);
                catalogs.drop_prefix(&from);
                Ok(())
            })
            .await
            .map_err(|e| Error::Internal(format!("catalog task failed: {e}")))?
        }
        Rename::CatalogPart { catalog, file } => {
            let full = check_relative_to_home(home, catalog)?;
            if !is_catalog(&full) {
                return Err(Error::NotFound(format!("{catalog:?} not found")));
            }
            let catalogs = state.catalogs.clone();
            let (old, new) = (file.clone(), new.to_string());
            tokio::task::spawn_blocking(move || -> Result<()> {
                let cat = catalogs.open(&full)?;
                cat.rename_file_parts(&old, &new)?;
                Ok(())
            })
            .await
            .map_err(|e| Error::Internal(format!("catalog task failed: {e}")))?
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_names_are_joined() {
        assert_eq!(join_rel("", "a.txt"), "a.txt");
        assert_eq!(join_rel("/dir/", "a.txt"), "dir/a.txt");
        assert_eq!(join_rel("dir", ""), "dir");
    }

    #[test]
    fn forwarded_requests_are_local() {
        let p = Params::parse(Some("file=a&local=false&lifetime=1h"));
        let q = forwarded_query(&p);
        assert_eq!(q.iter().filter(|(k, _)| k == "local").count(), 1);
        assert!(q.contains(&("local".to_string(), "true".to_string())));
        assert!(q.contains(&("lifetime".to_string(), "1h".to_string())));
    }

    #[test]
    fn errors_win_when_statuses_are_merged() {
        let mut all = BTreeMap::new();
        merge_statuses(&mut all, "n1", BTreeMap::from([("a".into(), "OK".into())]));
        merge_statuses(&mut all, "n2", BTreeMap::from([("a".into(), "busy".into())]));
        merge_statuses(&mut all, "n3", BTreeMap::from([("a".into(), "OK".into())]));
        assert_eq!(all["a"], "[n2]: busy");
    }

    #[test]
    fn replicated_upload_reports_min_length_and_shared_path() {
        let upload = UploadParams::bind(&Params::parse(Some("file=a.txt"))).unwrap();
        let merged = merge_uploads(
            &upload,
            vec![
                ("n1".into(), json!({"path": "a.txt", "length": 5, "offset": 0})),
                ("n2".into(), json!({"path": "a.txt", "length": 3, "offset": 0})),
                ("n3".into(), json!({"error": "disk full"})),
            ],
        );
        assert_eq!(merged["length"], 3);
        assert_eq!(merged["path"], "a.txt");
        assert_eq!(merged["details"]["n3"]["error"], "disk full");
    }

    #[test]
    fn rename_target_is_picked_from_params() {
        let (what, new) = Rename::bind(&Params::parse(Some("catalog=c.db&file=a&new=b"))).unwrap();
        assert!(matches!(what, Rename::CatalogPart { .. }));
        assert_eq!(new, "b");
        let (what, _) = Rename::bind(&Params::parse(Some("dir=d&catalog=c.db&new=x.db"))).unwrap();
        assert!(matches!(what, Rename::Catalog(ref p) if p == "d/c.db"));
        assert!(Rename::bind(&Params::parse(Some("new=x"))).is_err());
        assert!(Rename::bind(&Params::parse(Some("file=x"))).is_err());
    }
}
