use super::{ExternalStore, LEGACY_MARKER_PREFIX, StoreError, StoreResult, retry_on_timeout};
use crate::models::{ExternalHeader, ExternalItem, ItemDraft, ItemPatch};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

const OSASCRIPT: &str = "osascript";
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// JXA program run by `osascript`; `argv[0]` carries the JSON request.
const BRIDGE_SCRIPT: &str = r#"
function run(argv) {
  const req = JSON.parse(argv[0]);
  const app = Application('Reminders');
  const matches = app.lists.whose({ name: req.list });
  if (matches.length === 0) {
    throw new Error('list not found: ' + req.list);
  }
  const list = matches[0];
  const item = (r) => ({ id: r.id(), title: r.name(), completed: r.completed(), notes: r.body() || '' });
  const header = (r) => ({ id: r.id(), title: r.name(), completed: r.completed() });
  const scope = () => req.includeCompleted ? list.reminders : list.reminders.whose({ completed: false });
  const byId = (id) => {
    const found = list.reminders.whose({ id: id });
    return found.length > 0 ? found[0] : null;
  };
  switch (req.op) {
    case 'by_ids': {
      const out = [];
      for (const id of req.ids) {
        const r = byId(id);
        if (r) out.push(item(r));
      }
      return JSON.stringify({ items: out });
    }
    case 'by_titles': {
      const out = [];
      for (const title of req.titles) {
        const found = req.includeCompleted
          ? list.reminders.whose({ name: title })
          : list.reminders.whose({ name: title, completed: false });
        for (let i = 0; i < found.length; i++) out.push(header(found[i]));
      }
      return JSON.stringify({ headers: out });
    }
    case 'legacy': {
      const found = list.reminders.whose({ body: { _contains: req.marker } });
      const out = [];
      for (let i = 0; i < found.length; i++) out.push(item(found[i]));
      return JSON.stringify({ items: out });
    }
    case 'headers': {
      const rs = scope();
      const ids = rs.id(), names = rs.name(), done = rs.completed();
      const out = ids.map((id, i) => ({ id: id, title: names[i], completed: done[i] }));
      return JSON.stringify({ headers: out });
    }
    case 'items': {
      const rs = scope();
      const ids = rs.id(), names = rs.name(), done = rs.completed(), bodies = rs.body();
      const out = ids.map((id, i) => ({ id: id, title: names[i], completed: done[i], notes: bodies[i] || '' }));
      return JSON.stringify({ items: out });
    }
    case 'create': {
      const r = app.Reminder({ name: req.title, body: req.notes });
      list.reminders.push(r);
      if (req.completed) r.completed = true;
      return JSON.stringify({ id: r.id() });
    }
    case 'update': {
      const r = byId(req.id);
      if (!r) throw new Error('reminder not found: ' + req.id);
      if (req.title !== undefined && req.title !== null) r.name = req.title;
      if (req.notes !== undefined && req.notes !== null) r.body = req.notes;
      if (req.completed !== undefined && req.completed !== null) r.completed = req.completed;
      return JSON.stringify({});
    }
    case 'delete': {
      const r = byId(req.id);
      if (r) app.delete(r);
      return JSON.stringify({});
    }
  }
  throw new Error('unknown op: ' + req.op);
}
"#;

#[derive(Deserialize)]
struct ItemsReply {
    items: Vec<ExternalItem>,
}

#[derive(Deserialize)]
struct HeadersReply {
    headers: Vec<ExternalHeader>,
}

#[derive(Deserialize)]
struct CreateReply {
    id: String,
}

/// Apple Reminders driven through `osascript` JavaScript for Automation.
pub struct RemindersStore {
    timeout: Duration,
}

impl RemindersStore {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn call<T: DeserializeOwned>(&self, op: &str, request: Value) -> StoreResult<T> {
        let payload = request.to_string();
        let stdout = retry_on_timeout(op, self.timeout, |timeout| {
            let child = Command::new(OSASCRIPT)
                .args(["-l", "JavaScript", "-e", BRIDGE_SCRIPT, &payload])
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()?;
            run_with_timeout(op, child, timeout)
        })?;
        serde_json::from_str(stdout.trim())
            .map_err(|e| StoreError::Decode(format!("{op}: {e}: {}", stdout.trim())))
    }
}

/// Waits for `child`, killing it once `timeout` elapses.
fn run_with_timeout(op: &str, mut child: Child, timeout: Duration) -> StoreResult<String> {
    let stdout = child.stdout.take().map(spawn_reader);
    let stderr = child.stderr.take().map(spawn_reader);
    let deadline = Instant::now() + timeout;

    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Err(StoreError::Timeout {
                op: op.to_string(),
                after: timeout,
            });
        }
        thread::sleep(POLL_INTERVAL);
    };

    let stdout = stdout
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default();
    let stderr = stderr
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default();
    debug!(op, status = %status, "osascript finished");

    if !status.success() {
        let message = stderr.trim();
        if let Some(list) = message.split("list not found: ").nth(1) {
            return Err(StoreError::ListNotFound(
                list.trim_end_matches(|c: char| c == ')' || c.is_whitespace())
                    .to_string(),
            ));
        }
        return Err(StoreError::Script(format!("{op}: {message}")));
    }
    Ok(stdout)
}

fn spawn_reader<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut out = String::new();
        let _ = pipe.read_to_string(&mut out);
        out
    })
}

impl ExternalStore for RemindersStore {
    fn fetch_by_ids(&mut self, list: &str, ids: &[String]) -> StoreResult<Vec<ExternalItem>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let reply: ItemsReply = self.call(
            "fetch by ids",
            json!({ "op": "by_ids", "list": list, "ids": ids }),
        )?;
        Ok(reply.items)
    }

    fn fetch_by_exact_titles(
        &mut self,
        list: &str,
        titles: &[String],
        include_completed: bool,
    ) -> StoreResult<Vec<ExternalHeader>> {
        if titles.is_empty() {
            return Ok(Vec::new());
        }
        let reply: HeadersReply = self.call(
            "fetch by titles",
            json!({
                "op": "by_titles",
                "list": list,
                "titles": titles,
                "includeCompleted": include_completed,
            }),
        )?;
        Ok(reply.headers)
    }

    fn fetch_legacy_marked(&mut self, list: &str) -> StoreResult<Vec<ExternalItem>> {
        let reply: ItemsReply = self.call(
            "fetch legacy marked",
            json!({ "op": "legacy", "list": list, "marker": LEGACY_MARKER_PREFIX }),
        )?;
        Ok(reply.items)
    }

    fn fetch_all_headers(
        &mut self,
        list: &str,
        include_completed: bool,
    ) -> StoreResult<Vec<ExternalHeader>> {
        let reply: HeadersReply = self.call(
            "fetch headers",
            json!({ "op": "headers", "list": list, "includeCompleted": include_completed }),
        )?;
        Ok(reply.headers)
    }

    fn fetch_all_items(
        &mut self,
        list: &str,
        include_completed: bool,
    ) -> StoreResult<Vec<ExternalItem>> {
        let reply: ItemsReply = self.call(
            "fetch items",
            json!({ "op": "items", "list": list, "includeCompleted": include_completed }),
        )?;
        Ok(reply.items)
    }

    /// Not idempotent. When the first attempt times out after Reminders has
    /// already saved the item, the retry adds a second reminder with the same
    /// title; the next sync then treats it as unmapped.
    fn create(&mut self, list: &str, draft: &ItemDraft) -> StoreResult<String> {
        let reply: CreateReply = self.call(
            "create reminder",
            json!({
                "op": "create",
                "list": list,
                "title": draft.title,
                "notes": draft.notes,
                "completed": draft.completed,
            }),
        )?;
        Ok(reply.id)
    }

    fn update(&mut self, list: &str, id: &str, patch: &ItemPatch) -> StoreResult<()> {
        let _: Value = self.call(
            "update reminder",
            json!({
                "op": "update",
                "list": list,
                "id": id,
                "title": patch.title,
                "notes": patch.notes,
                "completed": patch.completed,
            }),
        )?;
        Ok(())
    }

    fn delete(&mut self, list: &str, id: &str) -> StoreResult<()> {
        let _: Value = self.call(
            "delete reminder",
            json!({ "op": "delete", "list": list, "id": id }),
        )?;
        Ok(())
    }
}
