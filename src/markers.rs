//! Progress-marker wire format embedded in issue-tracker comment bodies.

/// Comment markers look like `<!-- AWK:session:<sid>:<kind>[:<payload>] -->`.
const MARKER_OPEN: &str = "<!-- AWK:session:";
const MARKER_CLOSE: &str = "-->";

pub const KIND_WORKER_START: &str = "worker_start";
pub const KIND_WORKER_PROGRESS: &str = "worker_progress";
/// Terminal marker; payload carries the pull-request URL.
pub const KIND_WORKER_COMPLETE: &str = "worker_complete";

/// Parsed progress marker from a comment body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressMarker {
    pub session_id: String,
    pub kind: String,
    pub payload: Option<String>,
}

impl ProgressMarker {
    /// Render the marker back to its comment form.
    pub fn to_comment(&self) -> String {
        match &self.payload {
            Some(payload) => format!(
                "{MARKER_OPEN}{}:{}:{payload} {MARKER_CLOSE}",
                self.session_id, self.kind
            ),
            None => format!("{MARKER_OPEN}{}:{} {MARKER_CLOSE}", self.session_id, self.kind),
        }
    }
}

/// Extract the first progress marker from a comment body, if any.
///
/// The payload keeps embedded colons intact (pull-request URLs contain them),
/// so only the session id and kind are split on `:`.
pub fn parse_marker(body: &str) -> Option<ProgressMarker> {
    let start = body.find(MARKER_OPEN)? + MARKER_OPEN.len();
    let rest = &body[start..];
    let end = rest.find(MARKER_CLOSE)?;
    let inner = rest[..end].trim();

    let (session_id, after_session) = inner.split_once(':')?;
    let (kind, payload) = match after_session.split_once(':') {
        Some((kind, payload)) => (kind, Some(payload.to_string())),
        None => (after_session, None),
    };
    if session_id.is_empty() || kind.is_empty() {
        return None;
    }
    Some(ProgressMarker {
        session_id: session_id.to_string(),
        kind: kind.to_string(),
        payload: payload.filter(|p| !p.is_empty()),
    })
}
