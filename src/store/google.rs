use super::{ExternalStore, StoreError, StoreResult, has_legacy_marker, retry_on_timeout};
use crate::config::GoogleConfig;
use crate::models::{ExternalHeader, ExternalItem, ItemDraft, ItemPatch};
use chrono::{DateTime, Duration, Local, Utc};
use reqwest::Url;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration as StdDuration;
use tracing::{debug, info};

const OAUTH_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const OAUTH_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const TASKS_API: &str = "https://tasks.googleapis.com/tasks/v1";
const TASKS_SCOPE: &str = "https://www.googleapis.com/auth/tasks";
const STATUS_COMPLETED: &str = "completed";
const STATUS_OPEN: &str = "needsAction";

#[derive(Serialize, Deserialize)]
struct StoredToken {
    access_token: String,
    refresh_token: String,
    expires_at: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
    refresh_token: Option<String>,
}

#[derive(Deserialize)]
struct TokenErrorResponse {
    error: String,
    error_description: Option<String>,
}

#[derive(Deserialize)]
struct TaskListsResponse {
    items: Option<Vec<RemoteTaskList>>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
struct RemoteTaskList {
    id: String,
    title: Option<String>,
}

#[derive(Deserialize)]
struct TasksListResponse {
    items: Option<Vec<RemoteTask>>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Deserialize, Clone)]
struct RemoteTask {
    id: String,
    title: Option<String>,
    notes: Option<String>,
    status: Option<String>,
    #[serde(default)]
    deleted: bool,
}

impl RemoteTask {
    fn into_item(self) -> ExternalItem {
        ExternalItem {
            completed: self.status.as_deref() == Some(STATUS_COMPLETED),
            title: self.title.unwrap_or_default(),
            notes: self.notes.unwrap_or_default(),
            id: self.id,
        }
    }
}

#[derive(Serialize)]
struct TaskWriteRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    title: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    notes: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<&'static str>,
}

fn status_for(completed: bool) -> &'static str {
    if completed { STATUS_COMPLETED } else { STATUS_OPEN }
}

/// Google Tasks, one task list per synced list name.
pub struct GoogleTasksStore {
    client: Client,
    config: GoogleConfig,
    token_path: PathBuf,
    timeout: StdDuration,
    access_token: Option<String>,
    list_ids: HashMap<String, String>,
}

impl GoogleTasksStore {
    pub fn new(config: GoogleConfig, token_path: PathBuf, timeout: StdDuration) -> StoreResult<Self> {
        if config.client_id.trim().is_empty() || config.client_secret.trim().is_empty() {
            return Err(StoreError::Auth(
                "Google client_id/client_secret required in config.toml".to_string(),
            ));
        }
        Ok(Self {
            client: Client::new(),
            config,
            token_path,
            timeout,
            access_token: None,
            list_ids: HashMap::new(),
        })
    }

    fn token(&mut self) -> StoreResult<String> {
        if let Some(token) = &self.access_token {
            return Ok(token.clone());
        }
        let token = ensure_access_token(&self.client, &self.config, &self.token_path)?;
        self.access_token = Some(token.clone());
        Ok(token)
    }

    fn send<T: DeserializeOwned>(
        &mut self,
        op: &str,
        build: impl Fn(&Client, &str) -> RequestBuilder,
    ) -> StoreResult<Option<T>> {
        let token = self.token()?;
        let client = &self.client;
        retry_on_timeout(op, self.timeout, |timeout| {
            let resp = build(client, &token)
                .timeout(timeout)
                .send()
                .map_err(|e| request_error(op, timeout, e))?;
            decode_response(op, resp)
        })
    }

    fn list_id(&mut self, list: &str) -> StoreResult<String> {
        if let Some(id) = self.list_ids.get(list) {
            return Ok(id.clone());
        }
        let mut page_token: Option<String> = None;
        loop {
            let token = page_token.clone();
            let page: Option<TaskListsResponse> = self.send("list task lists", |client, access| {
                let mut req = client
                    .get(format!("{TASKS_API}/users/@me/lists"))
                    .bearer_auth(access)
                    .query(&[("maxResults", "100")]);
                if let Some(token) = &token {
                    req = req.query(&[("pageToken", token.as_str())]);
                }
                req
            })?;
            let Some(page) = page else { break };
            for remote in page.items.unwrap_or_default() {
                if let Some(title) = remote.title {
                    self.list_ids.entry(title).or_insert(remote.id);
                }
            }
            if let Some(id) = self.list_ids.get(list) {
                return Ok(id.clone());
            }
            match page.next_page_token {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }
        Err(StoreError::ListNotFound(list.to_string()))
    }

    fn list_tasks(&mut self, list: &str, include_completed: bool) -> StoreResult<Vec<RemoteTask>> {
        let list_id = self.list_id(list)?;
        let show_completed = if include_completed { "true" } else { "false" };
        let mut tasks = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let token = page_token.clone();
            let page: Option<TasksListResponse> = self.send("list tasks", |client, access| {
                let mut req = client
                    .get(format!("{TASKS_API}/lists/{list_id}/tasks"))
                    .bearer_auth(access)
                    .query(&[
                        ("showCompleted", show_completed),
                        ("showHidden", show_completed),
                        ("maxResults", "100"),
                    ]);
                if let Some(token) = &token {
                    req = req.query(&[("pageToken", token.as_str())]);
                }
                req
            })?;
            let Some(page) = page else { break };
            tasks.extend(page.items.unwrap_or_default().into_iter().filter(|t| !t.deleted));
            match page.next_page_token {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }
        debug!(list, count = tasks.len(), "listed Google tasks");
        Ok(tasks)
    }
}

impl ExternalStore for GoogleTasksStore {
    fn fetch_by_ids(&mut self, list: &str, ids: &[String]) -> StoreResult<Vec<ExternalItem>> {
        let list_id = self.list_id(list)?;
        let mut items = Vec::new();
        for id in ids {
            let task: Option<RemoteTask> = self.send("get task", |client, access| {
                client
                    .get(format!("{TASKS_API}/lists/{list_id}/tasks/{id}"))
                    .bearer_auth(access)
            })?;
            if let Some(task) = task.filter(|t| !t.deleted) {
                items.push(task.into_item());
            }
        }
        Ok(items)
    }

    fn fetch_by_exact_titles(
        &mut self,
        list: &str,
        titles: &[String],
        include_completed: bool,
    ) -> StoreResult<Vec<ExternalHeader>> {
        let wanted: HashSet<&str> = titles.iter().map(String::as_str).collect();
        Ok(self
            .list_tasks(list, include_completed)?
            .into_iter()
            .map(RemoteTask::into_item)
            .filter(|item| wanted.contains(item.title.as_str()))
            .map(|item| item.header())
            .collect())
    }

    fn fetch_legacy_marked(&mut self, list: &str) -> StoreResult<Vec<ExternalItem>> {
        Ok(self
            .list_tasks(list, true)?
            .into_iter()
            .map(RemoteTask::into_item)
            .filter(|item| has_legacy_marker(&item.notes))
            .collect())
    }

    fn fetch_all_headers(
        &mut self,
        list: &str,
        include_completed: bool,
    ) -> StoreResult<Vec<ExternalHeader>> {
        Ok(self
            .list_tasks(list, include_completed)?
            .into_iter()
            .map(|task| task.into_item().header())
            .collect())
    }

    fn fetch_all_items(
        &mut self,
        list: &str,
        include_completed: bool,
    ) -> StoreResult<Vec<ExternalItem>> {
        Ok(self
            .list_tasks(list, include_completed)?
            .into_iter()
            .map(RemoteTask::into_item)
            .collect())
    }

    fn create(&mut self, list: &str, draft: &ItemDraft) -> StoreResult<String> {
        let list_id = self.list_id(list)?;
        let body = TaskWriteRequest {
            title: Some(&draft.title),
            notes: Some(&draft.notes),
            status: Some(status_for(draft.completed)),
        };
        let created: Option<RemoteTask> = self.send("create task", |client, access| {
            client
                .post(format!("{TASKS_API}/lists/{list_id}/tasks"))
                .bearer_auth(access)
                .json(&body)
        })?;
        created
            .map(|task| task.id)
            .ok_or_else(|| StoreError::Decode("task create returned no item".to_string()))
    }

    fn update(&mut self, list: &str, id: &str, patch: &ItemPatch) -> StoreResult<()> {
        let list_id = self.list_id(list)?;
        let body = TaskWriteRequest {
            title: patch.title.as_deref(),
            notes: patch.notes.as_deref(),
            status: patch.completed.map(status_for),
        };
        let updated: Option<RemoteTask> = self.send("update task", |client, access| {
            client
                .patch(format!("{TASKS_API}/lists/{list_id}/tasks/{id}"))
                .bearer_auth(access)
                .json(&body)
        })?;
        match updated {
            Some(_) => Ok(()),
            None => Err(StoreError::Request(format!("task {id} no longer exists"))),
        }
    }

    fn delete(&mut self, list: &str, id: &str) -> StoreResult<()> {
        let list_id = self.list_id(list)?;
        let _: Option<serde_json::Value> = self.send("delete task", |client, access| {
            client
                .delete(format!("{TASKS_API}/lists/{list_id}/tasks/{id}"))
                .bearer_auth(access)
        })?;
        Ok(())
    }
}

fn request_error(op: &str, timeout: StdDuration, err: reqwest::Error) -> StoreError {
    if err.is_timeout() {
        StoreError::Timeout {
            op: op.to_string(),
            after: timeout,
        }
    } else {
        StoreError::Request(format!("{op}: {err}"))
    }
}

/// `Ok(None)` for 404/410 and empty bodies; other failures become errors.
fn decode_response<T: DeserializeOwned>(op: &str, resp: Response) -> StoreResult<Option<T>> {
    let status = resp.status();
    if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
        return Ok(None);
    }
    if status == StatusCode::UNAUTHORIZED {
        return Err(StoreError::Auth(
            "Google rejected the access token; run `todolist-sync auth`".to_string(),
        ));
    }
    if !status.is_success() {
        let body = resp.text().unwrap_or_default();
        return Err(StoreError::Request(format!(
            "{op} failed: HTTP {status}: {}",
            truncate_error(body.trim())
        )));
    }
    let body = resp
        .text()
        .map_err(|e| StoreError::Request(format!("{op}: {e}")))?;
    if body.trim().is_empty() {
        return Ok(None);
    }
    serde_json::from_str(&body)
        .map(Some)
        .map_err(|e| StoreError::Decode(format!("{op}: {e}")))
}

fn ensure_access_token(
    client: &Client,
    config: &GoogleConfig,
    token_path: &Path,
) -> StoreResult<String> {
    if !token_path.exists() {
        return Err(StoreError::Auth(
            "no Google token found; run `todolist-sync auth` first".to_string(),
        ));
    }

    let stored = load_token(token_path)?;
    let now = Utc::now().timestamp();
    if stored.expires_at > now + 60 {
        return Ok(stored.access_token);
    }

    let updated = refresh_access_token(client, config, &stored.refresh_token)?;
    save_token(token_path, &updated)?;
    Ok(updated.access_token)
}

fn refresh_access_token(
    client: &Client,
    config: &GoogleConfig,
    refresh_token: &str,
) -> StoreResult<StoredToken> {
    let resp = client
        .post(OAUTH_TOKEN_URL)
        .form(&[
            ("client_id", config.client_id.as_str()),
            ("client_secret", config.client_secret.as_str()),
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
        ])
        .send()
        .map_err(|e| StoreError::Request(e.to_string()))?;

    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().unwrap_or_default();
        return Err(StoreError::Auth(format!(
            "token refresh failed: {}; run `todolist-sync auth` again",
            format_oauth_error(status, &body)
        )));
    }

    let token: TokenResponse = resp
        .json()
        .map_err(|e| StoreError::Decode(e.to_string()))?;
    Ok(StoredToken {
        access_token: token.access_token,
        refresh_token: token.refresh_token.unwrap_or_else(|| refresh_token.to_string()),
        expires_at: (Utc::now() + Duration::seconds(token.expires_in as i64)).timestamp(),
    })
}

fn load_token(path: &Path) -> StoreResult<StoredToken> {
    let content = fs::read_to_string(path)?;
    serde_json::from_str(&content).map_err(|e| StoreError::Decode(e.to_string()))
}

fn save_token(path: &Path, token: &StoredToken) -> StoreResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let content =
        serde_json::to_string_pretty(token).map_err(|e| StoreError::Decode(e.to_string()))?;
    fs::write(path, content)?;
    Ok(())
}

struct AuthSession {
    listener: TcpListener,
    auth_url: String,
    state: String,
    redirect_uri: String,
    expires_at: DateTime<Local>,
}

/// Runs the loopback OAuth flow: opens the consent page and waits for the redirect.
pub fn authorize(config: &GoogleConfig, token_path: &Path) -> StoreResult<()> {
    let session = start_local_oauth_flow(config)?;
    println!("Open this URL to authorize todolist-sync:\n\n  {}\n", session.auth_url);
    if let Err(err) = open::that(&session.auth_url) {
        debug!(error = %err, "could not open browser automatically");
    }
    info!(expires_at = %session.expires_at.format("%H:%M:%S"), "waiting for Google redirect");

    let client = Client::new();
    session.listener.set_nonblocking(true)?;
    loop {
        if Local::now() >= session.expires_at {
            return Err(StoreError::Auth("Google auth expired. Please retry.".to_string()));
        }
        match session.listener.accept() {
            Ok((mut stream, _addr)) => {
                stream.set_nonblocking(false)?;
                return handle_auth_redirect(&client, config, &session, &mut stream, token_path)
                    .map_err(StoreError::Auth);
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(StdDuration::from_millis(200));
            }
            Err(err) => return Err(err.into()),
        }
    }
}

fn start_local_oauth_flow(config: &GoogleConfig) -> StoreResult<AuthSession> {
    if config.client_id.trim().is_empty() || config.client_secret.trim().is_empty() {
        return Err(StoreError::Auth(
            "Google client_id/client_secret required in config.toml".to_string(),
        ));
    }

    let listener = TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    let redirect_uri = format!("http://{}", addr);
    let expires_at = Local::now() + Duration::minutes(10);
    let state = generate_state();

    let auth_url = Url::parse_with_params(
        OAUTH_AUTH_URL,
        [
            ("client_id", config.client_id.as_str()),
            ("redirect_uri", redirect_uri.as_str()),
            ("response_type", "code"),
            ("scope", TASKS_SCOPE),
            ("access_type", "offline"),
            ("prompt", "consent"),
            ("state", state.as_str()),
        ],
    )
    .map_err(|e| StoreError::Request(e.to_string()))?
    .to_string();

    Ok(AuthSession {
        listener,
        auth_url,
        state,
        redirect_uri,
        expires_at,
    })
}

fn handle_auth_redirect(
    client: &Client,
    config: &GoogleConfig,
    session: &AuthSession,
    stream: &mut TcpStream,
    token_path: &Path,
) -> Result<(), String> {
    stream
        .set_read_timeout(Some(StdDuration::from_secs(2)))
        .map_err(|e| e.to_string())?;
    let mut buf = [0u8; 8192];
    let read = stream.read(&mut buf).map_err(|e| e.to_string())?;
    let request = String::from_utf8_lossy(&buf[..read]);
    let request_line = request.lines().next().unwrap_or("");
    let path = request_line.split_whitespace().nth(1).unwrap_or("/");
    let query = path.split_once('?').map(|(_, q)| q).unwrap_or("");
    let params = parse_query(query);

    if let Some(error) = params.get("error") {
        let desc = params
            .get("error_description")
            .map(|s| format!(" ({})", s))
            .unwrap_or_default();
        let _ = respond_with_message(stream, &format!("Authorization failed: {error}{desc}"));
        return Err(format!("Google auth failed: {error}{desc}"));
    }

    let Some(code) = params.get("code") else {
        let _ = respond_with_message(stream, "Missing authorization code.");
        return Err("Missing authorization code from Google.".to_string());
    };

    if params.get("state").map(String::as_str) != Some(session.state.as_str()) {
        let _ = respond_with_message(stream, "Invalid state.");
        return Err("Invalid OAuth state. Please retry.".to_string());
    }

    let resp = client
        .post(OAUTH_TOKEN_URL)
        .form(&[
            ("client_id", config.client_id.as_str()),
            ("client_secret", config.client_secret.as_str()),
            ("code", code.as_str()),
            ("redirect_uri", session.redirect_uri.as_str()),
            ("grant_type", "authorization_code"),
        ])
        .send()
        .map_err(|e| e.to_string())?;

    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().unwrap_or_default();
        let detail = format_oauth_error(status, &body);
        let _ = respond_with_message(stream, &format!("Authorization failed: {}", detail));
        return Err(detail);
    }

    let token: TokenResponse = resp.json().map_err(|e| e.to_string())?;
    let Some(refresh) = token.refresh_token else {
        let _ = respond_with_message(
            stream,
            "Missing refresh token. Please retry and grant offline access.",
        );
        return Err("Missing refresh token from Google.".to_string());
    };

    let stored = StoredToken {
        access_token: token.access_token,
        refresh_token: refresh,
        expires_at: (Utc::now() + Duration::seconds(token.expires_in as i64)).timestamp(),
    };
    save_token(token_path, &stored).map_err(|e| e.to_string())?;
    let _ = respond_with_message(stream, "Authorization complete. You can close this window.");
    Ok(())
}

fn respond_with_message(stream: &mut TcpStream, message: &str) -> io::Result<()> {
    let body = format!("{message}\n");
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    );
    stream.write_all(response.as_bytes())
}

fn parse_query(query: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        params.insert(decode_component(key), decode_component(value));
    }
    params
}

fn decode_component(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0usize;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                match std::str::from_utf8(&bytes[i + 1..i + 3])
                    .ok()
                    .and_then(|s| u8::from_str_radix(s, 16).ok())
                {
                    Some(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    None => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn generate_state() -> String {
    use rand::{Rng, distributions::Alphanumeric};
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

fn format_oauth_error(status: StatusCode, body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return format!("HTTP {}", status);
    }

    let summary = if let Ok(err) = serde_json::from_str::<TokenErrorResponse>(trimmed) {
        if let Some(desc) = err.error_description {
            format!("{} ({})", desc, err.error)
        } else {
            err.error
        }
    } else {
        truncate_error(trimmed)
    };
    format!("HTTP {}: {}", status, summary)
}

fn truncate_error(message: &str) -> String {
    let mut out = message.replace(['\n', '\r'], " ");
    if out.len() > 240 {
        let mut cut = 240;
        while !out.is_char_boundary(cut) {
            cut -= 1;
        }
        out.truncate(cut);
        out.push_str("...");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_query_decodes_components() {
        let params = parse_query("code=4%2F0Ab&state=abc+def&error_description=caf%C3%A9");
        assert_eq!(params.get("code").map(String::as_str), Some("4/0Ab"));
        assert_eq!(params.get("state").map(String::as_str), Some("abc def"));
        assert_eq!(params.get("error_description").map(String::as_str), Some("café"));
    }

    #[test]
    fn decode_component_keeps_malformed_escapes() {
        assert_eq!(decode_component("100%"), "100%");
        assert_eq!(decode_component("%zz"), "%zz");
    }

    #[test]
    fn format_oauth_error_prefers_description() {
        let body = r#"{"error":"invalid_grant","error_description":"Token has been expired"}"#;
        assert_eq!(
            format_oauth_error(StatusCode::BAD_REQUEST, body),
            "HTTP 400 Bad Request: Token has been expired (invalid_grant)"
        );
        assert_eq!(format_oauth_error(StatusCode::BAD_GATEWAY, ""), "HTTP 502 Bad Gateway");
    }

    #[test]
    fn remote_task_maps_status_and_defaults() {
        let task: RemoteTask =
            serde_json::from_str(r#"{"id":"t1","title":"Pay rent","status":"completed"}"#)
                .expect("task json");
        let item = task.into_item();
        assert_eq!(item.id, "t1");
        assert!(item.completed);
        assert_eq!(item.notes, "");
    }

    #[test]
    fn write_request_omits_unset_fields() {
        let body = TaskWriteRequest {
            title: None,
            notes: Some("n"),
            status: Some(status_for(true)),
        };
        assert_eq!(
            serde_json::to_string(&body).expect("serialize"),
            r#"{"notes":"n","status":"completed"}"#
        );
    }
}
